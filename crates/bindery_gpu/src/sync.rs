use crate::{
    allocator::HostAllocator,
    device::Device,
    error::{Error, Result},
    handle::NonDispatchable
};

use ash::vk;

use std::{sync::Arc, time::Duration};


/// Host-visible completion signal for queue submissions.
pub struct Fence {
    fence: NonDispatchable<vk::Fence>,
}

impl Fence {
    pub fn new(device: &Arc<Device>, signaled: bool, host_allocator: Option<Arc<dyn HostAllocator>>) -> Result<Self> {
        // Create fence
        let flags = match signaled {
            true => vk::FenceCreateFlags::SIGNALED,
            false => vk::FenceCreateFlags::empty()
        };
        let fence_create_info = vk::FenceCreateInfo::default()
            .flags(flags);
        let fence = NonDispatchable::create(device, host_allocator, |driver, callbacks| unsafe {
            driver.create_fence(&fence_create_info, callbacks)
        })
        .map_err(|result| Error::creation("vkCreateFence", result))?;

        Ok(Self { fence })
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence.handle()
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.fence.device().driver().reset_fence(self.handle()) }
            .map_err(|result| Error::native("vkResetFences", result))
    }

    /// Blocks until the fence signals. There is no timeout.
    pub fn wait(&self) -> Result<()> {
        unsafe { self.fence.device().driver().wait_for_fence(self.handle(), u64::MAX) }
            .map_err(|result| Error::native("vkWaitForFences", result))
    }

    /// Returns `false` if the fence did not signal within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let timeout = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.fence.device().driver().wait_for_fence(self.handle(), timeout) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(result) => Err(Error::native("vkWaitForFences", result))
        }
    }

    pub fn is_signaled(&self) -> Result<bool> {
        unsafe { self.fence.device().driver().fence_status(self.handle()) }
            .map_err(|result| Error::native("vkGetFenceStatus", result))
    }
}


/// Orders queue operations on the device. Never waited on by the host.
pub struct Semaphore {
    semaphore: NonDispatchable<vk::Semaphore>,
}

impl Semaphore {
    pub fn new(device: &Arc<Device>, host_allocator: Option<Arc<dyn HostAllocator>>) -> Result<Self> {
        let semaphore_create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = NonDispatchable::create(device, host_allocator, |driver, callbacks| unsafe {
            driver.create_semaphore(&semaphore_create_info, callbacks)
        })
        .map_err(|result| Error::creation("vkCreateSemaphore", result))?;

        Ok(Self { semaphore })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore.handle()
    }
}
