//! Ownership wrappers for native handles.
//!
//! A [`NonDispatchable`] handle owns its native object: it holds a strong reference to the
//! [`Device`] that created it and the host allocator it was created with, and destroys the object
//! exactly once with that same allocator. The device only observes its children through the
//! resource pool.

use crate::{
    allocator::HostAllocator,
    device::Device,
    driver::Driver,
    pool::Footprint
};

use ash::{prelude::VkResult, vk::{self, Handle}};

use std::{mem::size_of, sync::Arc};


const _: () = assert!(size_of::<vk::CommandBuffer>() == size_of::<usize>());
const _: () = assert!(size_of::<vk::Queue>() == size_of::<usize>());
const _: () = assert!(size_of::<vk::Buffer>() == size_of::<u64>());

/// Native object destroyed through a device-level `vkDestroy*` call.
pub trait DeviceChild: Handle + Copy + Send + Sync + 'static {
    /// # Safety
    /// `self` was created on `driver` with `allocator`, and is not in use by the device.
    unsafe fn destroy(self, driver: &dyn Driver, allocator: Option<&vk::AllocationCallbacks<'_>>);
}

impl DeviceChild for vk::Buffer {
    unsafe fn destroy(self, driver: &dyn Driver, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        driver.destroy_buffer(self, allocator)
    }
}

impl DeviceChild for vk::Image {
    unsafe fn destroy(self, driver: &dyn Driver, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        driver.destroy_image(self, allocator)
    }
}

impl DeviceChild for vk::DeviceMemory {
    unsafe fn destroy(self, driver: &dyn Driver, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        driver.free_memory(self, allocator)
    }
}

impl DeviceChild for vk::AccelerationStructureKHR {
    unsafe fn destroy(self, driver: &dyn Driver, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        driver.destroy_acceleration_structure(self, allocator)
    }
}

impl DeviceChild for vk::CommandPool {
    unsafe fn destroy(self, driver: &dyn Driver, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        driver.destroy_command_pool(self, allocator)
    }
}

impl DeviceChild for vk::Fence {
    unsafe fn destroy(self, driver: &dyn Driver, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        driver.destroy_fence(self, allocator)
    }
}

impl DeviceChild for vk::Semaphore {
    unsafe fn destroy(self, driver: &dyn Driver, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        driver.destroy_semaphore(self, allocator)
    }
}


/// Owning wrapper around a non-dispatchable handle.
pub struct NonDispatchable<H: DeviceChild> {
    handle: H,
    host_allocator: Option<Arc<dyn HostAllocator>>,
    footprint: Arc<Footprint>,
    device: Arc<Device>,
}

impl<H: DeviceChild> NonDispatchable<H> {
    /// Runs `create` with the native callbacks of `host_allocator`. Nothing is registered, and
    /// nothing will be destroyed, unless creation succeeds.
    pub(crate) fn create(
        device: &Arc<Device>,
        host_allocator: Option<Arc<dyn HostAllocator>>,
        create: impl FnOnce(&dyn Driver, Option<&vk::AllocationCallbacks<'_>>) -> VkResult<H>
    ) -> VkResult<Self> {
        let callbacks = host_allocator.as_ref().map(|allocator| allocator.callbacks());
        let handle = create(device.driver(), callbacks.as_ref())?;

        let footprint = Footprint::new(H::TYPE, handle.as_raw());
        device.resource_pool().register(&footprint);

        Ok(Self {
            handle,
            host_allocator,
            footprint,
            device: device.clone(),
        })
    }

    /// Destroys the current object and replaces it with a new one made by `create`.
    ///
    /// On failure the wrapper holds a null handle, which is never destroyed.
    pub(crate) fn recreate(
        &mut self,
        create: impl FnOnce(&dyn Driver, Option<&vk::AllocationCallbacks<'_>>) -> VkResult<H>
    ) -> VkResult<()> {
        let callbacks = self.host_allocator.as_ref().map(|allocator| allocator.callbacks());
        let driver = self.device.driver();
        if !self.is_null() {
            // SAFETY: the handle was created on this device with these callbacks
            unsafe { self.handle.destroy(driver, callbacks.as_ref()) };
            self.handle = H::from_raw(0);
            self.footprint.set_handle(0);
        }

        self.handle = create(driver, callbacks.as_ref())?;
        self.footprint.set_handle(self.handle.as_raw());

        Ok(())
    }

    pub fn handle(&self) -> H {
        self.handle
    }

    pub fn is_null(&self) -> bool {
        self.handle.as_raw() == 0
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn host_allocator(&self) -> Option<&Arc<dyn HostAllocator>> {
        self.host_allocator.as_ref()
    }

    pub fn footprint(&self) -> &Footprint {
        &self.footprint
    }
}

impl<H: DeviceChild> Drop for NonDispatchable<H> {
    fn drop(&mut self) {
        if !self.is_null() {
            let callbacks = self.host_allocator.as_ref().map(|allocator| allocator.callbacks());
            //  Safety: vkDestroy*
            //  Host Synchronization
            //   -  Host access to the object must be externally synchronized
            //
            //  The wrapper is the sole owner, and '&mut self' guarantees exclusive access
            unsafe { self.handle.destroy(self.device.driver(), callbacks.as_ref()) };
        }
        self.device.resource_pool().unregister(&self.footprint);
    }
}

impl<H: DeviceChild> std::fmt::Debug for NonDispatchable<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonDispatchable")
            .field("type", &H::TYPE)
            .field("handle", &format_args!("{:#x}", self.handle.as_raw()))
            .finish()
    }
}


/// Pointer-sized handle owned by exactly one parent, e.g. a command buffer by its pool.
pub struct Dispatchable<H: Handle + Copy> {
    handle: H,
}

impl<H: Handle + Copy> Dispatchable<H> {
    pub(crate) fn new(handle: H) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> H {
        self.handle
    }
}

impl<H: Handle + Copy> std::ops::Deref for Dispatchable<H> {
    type Target = H;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

// SAFETY: Dispatchable handles are opaque driver pointers; the API's external synchronization
// rules are enforced by the owning wrapper through '&mut self'
unsafe impl<H: Handle + Copy> Send for Dispatchable<H> {  }
unsafe impl<H: Handle + Copy> Sync for Dispatchable<H> {  }
