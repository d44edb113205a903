pub mod acceleration_structure;
pub mod buffer;
pub mod image;

use crate::{
    allocator::{AllocationRequest, Allocator},
    chain::{ExtensionNode, StructureChain},
    device::Device,
    driver::BindTarget,
    error::{Error, Result},
    memory::{priority, DeviceMemory, ManagedMemory, Memory, MemoryRequirements},
    pool::Footprint
};

use ash::vk;
use bevy_log::debug;

use std::sync::Arc;

// Reexport
pub use acceleration_structure::{AccelerationStructure, AccelerationStructureInfo};
pub use buffer::{Buffer, BufferInfo};
pub use image::{Image, ImageInfo};


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceClass {
    Buffer,
    Image,
    AccelerationStructure,
}

/// Queue family ownership of a resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Sharing {
    #[default]
    Exclusive,
    Concurrent(Vec<u32>),
}

impl Sharing {
    /// Concurrent access from `families`; fewer than two distinct families is exclusive.
    pub fn concurrent(families: impl IntoIterator<Item = u32>) -> Self {
        let mut families: Vec<u32> = families.into_iter().collect();
        families.sort_unstable();
        families.dedup();

        match families.len() {
            0 | 1 => Self::Exclusive,
            _ => Self::Concurrent(families)
        }
    }

    pub fn mode(&self) -> vk::SharingMode {
        match self {
            Self::Exclusive => vk::SharingMode::EXCLUSIVE,
            Self::Concurrent(_) => vk::SharingMode::CONCURRENT,
        }
    }

    pub fn queue_family_indices(&self) -> &[u32] {
        match self {
            Self::Exclusive => &[],
            Self::Concurrent(families) => families,
        }
    }
}

/// Optional creation parameters shared by every resource class.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Initializer {
    /// Physical devices of a device group that receive an instance of the allocation.
    pub device_mask: u32,
    pub memory_priority: f32,
    /// Request lazily allocated memory. Ignored for host-visible memory.
    pub lazily_allocated: bool,
    pub device_address: bool,
    pub device_address_capture_replay: bool,
    pub storage: bool,
    pub src_transfer: bool,
}

impl Default for Initializer {
    fn default() -> Self {
        Self {
            device_mask: 1,
            memory_priority: priority::DEFAULT,
            lazily_allocated: false,
            device_address: false,
            device_address_capture_replay: false,
            storage: false,
            src_transfer: false,
        }
    }
}

/// How a rebuilt resource treats the driver's dedicated-allocation preference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedicatedPolicy {
    /// Re-query requirements and allocate accordingly. Used by `realloc`.
    Requery,
    /// Keep the current memory block and whatever preference it was allocated with. Used by
    /// `on_defragment`.
    KeepExisting,
}

/// Uniform memory binding contract of buffers, images and acceleration structures.
///
/// Binding happens once per native handle. Rebinding requires the handle to be recreated first,
/// which `realloc` and `on_defragment` do.
pub trait Resource {
    fn class(&self) -> ResourceClass;
    fn size(&self) -> vk::DeviceSize;
    /// Offset of the resource inside its memory.
    fn offset(&self) -> vk::DeviceSize;
    fn memory(&self) -> Option<&dyn Memory>;
    fn memory_mut(&mut self) -> Option<&mut (dyn Memory + 'static)>;
    fn is_bound(&self) -> bool;
    fn bind_memory(&mut self, memory: Box<dyn Memory>, offset: vk::DeviceSize) -> Result<()>;
    /// Binds across the physical devices of a device group. Requires `VK_KHR_device_group`.
    fn bind_memory_device_group(&mut self, memory: Box<dyn Memory>, device_indices: &[u32], offset: vk::DeviceSize) -> Result<()>;
    /// Recreates the native handle and binds it to the same memory at the same offset.
    fn on_defragment(&mut self) -> Result<()>;
}


/// Memory owned by a resource.
#[derive(Default)]
pub(crate) struct Binding {
    memory: Option<Box<dyn Memory>>,
    offset: vk::DeviceSize,
    bound: bool,
}

impl Binding {
    pub fn memory(&self) -> Option<&dyn Memory> {
        self.memory.as_deref()
    }

    pub fn memory_mut(&mut self) -> Option<&mut (dyn Memory + 'static)> {
        self.memory.as_deref_mut()
    }

    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn set(&mut self, memory: Box<dyn Memory>, offset: vk::DeviceSize) {
        self.memory = Some(memory);
        self.offset = offset;
        self.bound = true;
    }

    /// Marks the binding stale after the native handle was recreated; the memory stays owned.
    pub fn invalidate(&mut self) {
        self.bound = false;
    }

    pub fn take(&mut self) -> Option<Box<dyn Memory>> {
        self.bound = false;
        self.memory.take()
    }

    /// Holds on to memory that is not bound to the current handle.
    pub fn keep(&mut self, memory: Box<dyn Memory>, offset: vk::DeviceSize) {
        self.memory = Some(memory);
        self.offset = offset;
        self.bound = false;
    }
}


/// Binds `memory` to `target` at `offset` and reports the bound size to the pool.
///
/// A handle takes exactly one binding; the memory must cover the requirements from `offset` on.
pub(crate) fn bind_target(
    binding: &mut Binding,
    footprint: &Footprint,
    target: BindTarget,
    requirements: &MemoryRequirements,
    memory: Box<dyn Memory>,
    offset: vk::DeviceSize,
    device_indices: &[u32]
) -> Result<()> {
    if binding.is_bound() {
        return Err(Error::invalid_usage("resource memory is already bound"));
    }
    if offset + requirements.size > memory.size() {
        return Err(Error::invalid_usage("memory is smaller than the resource"));
    }
    if requirements.alignment > 1 && offset % requirements.alignment != 0 {
        return Err(Error::invalid_usage("memory offset violates the resource alignment"));
    }

    match device_indices.is_empty() {
        true => memory.bind(target, offset)?,
        false => memory.bind_device_group(target, device_indices, offset)?
    }
    let (size, flags) = (requirements.size, memory.flags());
    footprint.update(|detail| {
        detail.memory_size = size;
        detail.memory_flags = flags;
    });
    binding.set(memory, offset);

    Ok(())
}

/// Adds `LAZILY_ALLOCATED` when requested and the memory is not host-visible.
pub(crate) fn memory_flags(flags: vk::MemoryPropertyFlags, initializer: &Initializer) -> vk::MemoryPropertyFlags {
    match initializer.lazily_allocated && !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        true => flags | vk::MemoryPropertyFlags::LAZILY_ALLOCATED,
        false => flags
    }
}

pub(crate) fn memory_requirements(device: &Device, target: BindTarget) -> MemoryRequirements {
    unsafe { device.driver().memory_requirements(target, device.extensions().dedicated_allocation_query()) }
}

/// Composes the allocation chain for `target` from the enabled extensions.
pub(crate) fn memory_chain(
    device: &Device,
    target: BindTarget,
    requirements: &MemoryRequirements,
    initializer: &Initializer
) -> StructureChain {
    let extensions = device.extensions();
    let mut chain = StructureChain::new();

    if requirements.dedicated() && extensions.dedicated_allocation_query() {
        let (buffer, image) = match target {
            BindTarget::Buffer(buffer) => (buffer, vk::Image::null()),
            BindTarget::Image(image) => (vk::Buffer::null(), image),
        };
        chain.link_node(ExtensionNode::DedicatedAllocation { buffer, image });
    }

    let mut flags = vk::MemoryAllocateFlags::empty();
    let mut device_mask = 0;
    if extensions.device_group {
        flags |= vk::MemoryAllocateFlags::DEVICE_MASK;
        device_mask = initializer.device_mask;
    }
    if initializer.device_address && extensions.buffer_device_address && matches!(target, BindTarget::Buffer(_)) {
        flags |= vk::MemoryAllocateFlags::DEVICE_ADDRESS;
        if initializer.device_address_capture_replay {
            flags |= vk::MemoryAllocateFlags::DEVICE_ADDRESS_CAPTURE_REPLAY;
        }
    }
    if !flags.is_empty() {
        chain.link_node(ExtensionNode::AllocateFlags { flags, device_mask });
    }

    if extensions.memory_priority {
        chain.link_node(ExtensionNode::Priority(initializer.memory_priority));
    }

    chain
}

/// Allocates memory for `target`, from the device allocator when one is given.
#[allow(clippy::too_many_arguments)]
pub(crate) fn allocate_memory(
    device: &Arc<Device>,
    name: &str,
    target: BindTarget,
    requirements: &MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
    initializer: &Initializer,
    allocator: &Allocator,
    linear: bool
) -> Result<Box<dyn Memory>> {
    let chain = memory_chain(device, target, requirements, initializer);
    let dedicated = chain.dedicated().is_some();
    if requirements.dedicated() {
        debug!(
            "'{}' asks for a dedicated allocation (required: {}), {}",
            name, requirements.requires_dedicated, if dedicated { "granted" } else { "not available" }
        );
    }

    match allocator.device_allocator() {
        Some(device_allocator) => {
            let request = AllocationRequest {
                name,
                target,
                requirements: *requirements,
                flags,
                priority: initializer.memory_priority,
                dedicated,
                linear,
            };
            let memory = ManagedMemory::allocate(device, device_allocator.clone(), &request)?;
            Ok(Box::new(memory))
        },
        None => {
            let memory = DeviceMemory::with_requirements(
                device,
                requirements,
                flags,
                &chain,
                allocator.host_allocator().cloned()
            )?;
            Ok(Box::new(memory))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_sharing_needs_two_families() {
        assert_eq!(Sharing::concurrent([2, 2]), Sharing::Exclusive);
        assert_eq!(Sharing::concurrent([]), Sharing::Exclusive);

        let sharing = Sharing::concurrent([2, 0, 2]);
        assert_eq!(sharing.mode(), vk::SharingMode::CONCURRENT);
        assert_eq!(sharing.queue_family_indices(), &[0, 2]);
    }

    #[test]
    fn lazy_allocation_skips_host_visible_memory() {
        let initializer = Initializer { lazily_allocated: true, ..Default::default() };
        assert_eq!(
            memory_flags(vk::MemoryPropertyFlags::DEVICE_LOCAL, &initializer),
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::LAZILY_ALLOCATED
        );
        assert_eq!(
            memory_flags(vk::MemoryPropertyFlags::HOST_VISIBLE, &initializer),
            vk::MemoryPropertyFlags::HOST_VISIBLE
        );
        assert_eq!(
            memory_flags(vk::MemoryPropertyFlags::DEVICE_LOCAL, &Initializer::default()),
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        );
    }
}
