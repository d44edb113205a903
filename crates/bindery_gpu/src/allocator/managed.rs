use super::{AllocationRequest, DeviceAllocator, SubAllocation};
use crate::{
    device::Device,
    driver::BindTarget,
    error::{Error, Result}
};

use ash::vk;
use bevy_log::debug;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc},
    MemoryLocation
};

use std::{
    collections::HashMap,
    ffi::c_void,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard
    }
};


/// Pooled [`DeviceAllocator`] backed by `gpu-allocator`. Requires a Vulkan device.
pub struct GpuAllocator {
    allocator: Mutex<Allocator>,
    allocations: Mutex<HashMap<u64, Allocation>>,
    next_id: AtomicU64,
    // Blocks are freed by `allocator` on drop, so the device must outlive it
    _device: Arc<Device>,
}

impl GpuAllocator {
    pub fn new(device: &Arc<Device>) -> Result<Arc<Self>> {
        let vulkan = device.driver()
            .as_vulkan()
            .ok_or_else(|| Error::invalid_usage("pooled allocation requires a Vulkan device"))?;

        // Create allocator
        let allocator_create_desc = AllocatorCreateDesc {
            instance: vulkan.instance().clone(),
            device: (**vulkan).clone(),
            physical_device: **vulkan.physical_device(),
            debug_settings: Default::default(),
            buffer_device_address: device.extensions().buffer_device_address,
            allocation_sizes: Default::default(),
        };
        let allocator = Allocator::new(&allocator_create_desc)?;

        Ok(Arc::new(Self {
            allocator: Mutex::new(allocator),
            allocations: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            _device: device.clone(),
        }))
    }

    fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn allocations(&self) -> MutexGuard<'_, HashMap<u64, Allocation>> {
        self.allocations.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn memory_location(flags: vk::MemoryPropertyFlags) -> MemoryLocation {
    match (
        flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
        flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL),
        flags.contains(vk::MemoryPropertyFlags::HOST_CACHED),
    ) {
        (false, true, _) => MemoryLocation::GpuOnly,
        (true, false, true) => MemoryLocation::GpuToCpu,
        (true, _, _) => MemoryLocation::CpuToGpu,
        (false, false, _) => MemoryLocation::Unknown,
    }
}

impl DeviceAllocator for GpuAllocator {
    fn alloc(&self, request: &AllocationRequest<'_>) -> Result<SubAllocation> {
        let allocation_scheme = match (request.dedicated, request.target) {
            (true, BindTarget::Buffer(buffer)) => AllocationScheme::DedicatedBuffer(buffer),
            (true, BindTarget::Image(image)) => AllocationScheme::DedicatedImage(image),
            (false, _) => AllocationScheme::GpuAllocatorManaged,
        };
        let requirements = vk::MemoryRequirements {
            size: request.requirements.size,
            alignment: request.requirements.alignment,
            memory_type_bits: request.requirements.memory_type_bits,
        };

        // Priority is not forwarded: gpu-allocator owns its memory blocks
        let allocation = self.allocator().allocate(&AllocationCreateDesc {
            name: request.name,
            requirements,
            location: memory_location(request.flags),
            linear: request.linear,
            allocation_scheme,
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sub_allocation = SubAllocation {
            id,
            // SAFETY: the block stays alive until this allocation is freed
            memory: unsafe { allocation.memory() },
            offset: allocation.offset(),
            size: allocation.size(),
            flags: allocation.memory_properties(),
        };
        debug!("Pooled allocation {} '{}': {} bytes at offset {}", id, request.name, sub_allocation.size, sub_allocation.offset);
        self.allocations().insert(id, allocation);

        Ok(sub_allocation)
    }

    fn free(&self, allocation: &SubAllocation) -> Result<()> {
        let Some(allocation) = self.allocations().remove(&allocation.id) else {
            return Err(Error::invalid_usage("sub-allocation was already freed"));
        };
        self.allocator().free(allocation)?;

        Ok(())
    }

    fn mapped_ptr(&self, allocation: &SubAllocation) -> Option<NonNull<c_void>> {
        self.allocations()
            .get(&allocation.id)
            .and_then(Allocation::mapped_ptr)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_flags_pick_a_location() {
        assert_eq!(memory_location(vk::MemoryPropertyFlags::DEVICE_LOCAL), MemoryLocation::GpuOnly);
        assert_eq!(
            memory_location(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            memory_location(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED),
            MemoryLocation::GpuToCpu
        );
    }
}
