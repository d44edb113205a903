//! Device memory blocks.
//!
//! [`DeviceMemory`] owns one native allocation. [`ManagedMemory`] is a region handed out by a
//! [`DeviceAllocator`] and returned to it on drop. Resources hold either through the [`Memory`]
//! trait.

use crate::{
    allocator::{AllocationRequest, DeviceAllocator, HostAllocator, SubAllocation},
    chain::StructureChain,
    device::Device,
    driver::BindTarget,
    error::{Error, Result},
    handle::NonDispatchable
};

use ash::vk;
use bevy_log::{debug, warn};

use std::{ffi::c_void, ptr::NonNull, sync::Arc};


/// Memory priority hints, passed through to the driver unchanged.
pub mod priority {
    pub const LOWEST: f32 = 0.0;
    pub const LOW: f32 = 0.25;
    pub const DEFAULT: f32 = 0.5;
    pub const HIGH: f32 = 0.75;
    pub const HIGHEST: f32 = 1.0;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: vk::DeviceSize,
    pub alignment: vk::DeviceSize,
    pub memory_type_bits: u32,
    pub prefers_dedicated: bool,
    pub requires_dedicated: bool,
}

impl MemoryRequirements {
    /// Whether the driver asked for a dedicated block.
    pub fn dedicated(&self) -> bool {
        self.prefers_dedicated || self.requires_dedicated
    }
}

impl From<vk::MemoryRequirements> for MemoryRequirements {
    fn from(requirements: vk::MemoryRequirements) -> Self {
        Self {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
            ..Default::default()
        }
    }
}

/// Resolves a memory type index among the types allowed by `memory_type_bits`.
///
/// A type whose property flags equal `flags` wins over any type merely containing them; among
/// equals the lowest index wins.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    flags: vk::MemoryPropertyFlags,
    memory_type_bits: u32
) -> Result<u32> {
    let memory_types = &properties.memory_types[..properties.memory_type_count as usize];
    let allowed = |index: &usize| memory_type_bits & (1 << index) != 0;

    let exact = (0..memory_types.len())
        .filter(allowed)
        .find(|&index| memory_types[index].property_flags == flags);
    let superset = || (0..memory_types.len())
        .filter(allowed)
        .find(|&index| memory_types[index].property_flags.contains(flags));

    exact.or_else(superset)
        .map(|index| index as u32)
        .ok_or(Error::UnsupportedMemoryType { flags })
}


/// Memory a resource can bind to.
pub trait Memory: Send + Sync {
    fn native(&self) -> vk::DeviceMemory;
    fn size(&self) -> vk::DeviceSize;
    /// Offset of this memory inside [`Memory::native`]; nonzero for sub-allocations.
    fn base_offset(&self) -> vk::DeviceSize { 0 }
    /// Property flags of the resolved memory type.
    fn flags(&self) -> vk::MemoryPropertyFlags;
    fn priority(&self) -> f32;
    fn device_mask(&self) -> u32;
    fn is_dedicated(&self) -> bool;
    fn is_mapped(&self) -> bool;

    /// Maps `size` bytes at `offset`. Returns `None` on failure, never a partial mapping.
    fn map(&mut self, offset: vk::DeviceSize, size: vk::DeviceSize) -> Option<NonNull<c_void>>;
    fn unmap(&mut self);
    fn flush(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> bool;
    fn invalidate(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> bool;

    fn bind(&self, target: BindTarget, offset: vk::DeviceSize) -> Result<()>;
    fn bind_device_group(&self, target: BindTarget, device_indices: &[u32], offset: vk::DeviceSize) -> Result<()>;

    /// Replaces the memory with a new block fitting `requirements`, keeping flags, priority and
    /// device mask. Previous contents are lost.
    fn realloc(&mut self, target: BindTarget, requirements: &MemoryRequirements, chain: &StructureChain) -> Result<()>;
}

fn host_visible(flags: vk::MemoryPropertyFlags) -> bool {
    flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
}

fn bind_operation(target: BindTarget) -> &'static str {
    match target {
        BindTarget::Buffer(_) => "vkBindBufferMemory2",
        BindTarget::Image(_) => "vkBindImageMemory2",
    }
}


/// A single native memory allocation.
pub struct DeviceMemory {
    memory: NonDispatchable<vk::DeviceMemory>,
    size: vk::DeviceSize,
    memory_type_index: u32,
    flags: vk::MemoryPropertyFlags,
    // Searched again on realloc
    requested_flags: vk::MemoryPropertyFlags,
    priority: f32,
    device_mask: u32,
    dedicated: bool,
    mapped: bool,
}

impl DeviceMemory {
    /// Allocates `size` bytes from any memory type matching `flags`.
    pub fn allocate(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        flags: vk::MemoryPropertyFlags,
        chain: &StructureChain,
        host_allocator: Option<Arc<dyn HostAllocator>>
    ) -> Result<Self> {
        let requirements = MemoryRequirements {
            size,
            alignment: 1,
            memory_type_bits: u32::MAX,
            ..Default::default()
        };

        Self::with_requirements(device, &requirements, flags, chain, host_allocator)
    }

    /// Allocates memory for a resource with the given requirements.
    pub fn with_requirements(
        device: &Arc<Device>,
        requirements: &MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
        chain: &StructureChain,
        host_allocator: Option<Arc<dyn HostAllocator>>
    ) -> Result<Self> {
        let requested_flags = flags;
        let memory_type_index = find_memory_type(device.memory_properties(), requested_flags, requirements.memory_type_bits)?;
        let flags = device.memory_properties().memory_types[memory_type_index as usize].property_flags;

        // Allocate device memory
        let memory = NonDispatchable::create(device, host_allocator, |driver, callbacks| unsafe {
            driver.allocate_memory(requirements.size, memory_type_index, chain, callbacks)
        })
        .map_err(Error::allocation)?;

        let memory = Self {
            memory,
            size: requirements.size,
            memory_type_index,
            flags,
            requested_flags,
            priority: chain.priority().unwrap_or(priority::DEFAULT),
            device_mask: device_mask(chain),
            dedicated: chain.dedicated().is_some(),
            mapped: false,
        };
        memory.report();
        debug!(
            "Allocated {} bytes of {:?} memory from type {}{}",
            memory.size, flags, memory_type_index, if memory.dedicated { " (dedicated)" } else { "" }
        );

        Ok(memory)
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn device(&self) -> &Arc<Device> {
        self.memory.device()
    }

    fn report(&self) {
        let (size, flags) = (self.size, self.flags);
        self.memory.footprint().update(|detail| {
            detail.memory_size = size;
            detail.memory_flags = flags;
        });
    }
}

fn device_mask(chain: &StructureChain) -> u32 {
    chain.allocate_flags()
        .filter(|(flags, _)| flags.contains(vk::MemoryAllocateFlags::DEVICE_MASK))
        .map_or(1, |(_, mask)| mask)
}

impl Memory for DeviceMemory {
    fn native(&self) -> vk::DeviceMemory {
        self.memory.handle()
    }

    fn size(&self) -> vk::DeviceSize {
        self.size
    }

    fn flags(&self) -> vk::MemoryPropertyFlags {
        self.flags
    }

    fn priority(&self) -> f32 {
        self.priority
    }

    fn device_mask(&self) -> u32 {
        self.device_mask
    }

    fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    fn is_mapped(&self) -> bool {
        self.mapped
    }

    fn map(&mut self, offset: vk::DeviceSize, size: vk::DeviceSize) -> Option<NonNull<c_void>> {
        if self.mapped || !host_visible(self.flags) {
            return None;
        }

        let ptr = unsafe { self.device().driver().map_memory(self.native(), offset, size) };
        match ptr.map(NonNull::new) {
            Ok(Some(ptr)) => {
                self.mapped = true;
                Some(ptr)
            },
            Ok(None) => None,
            Err(result) => {
                debug!("Mapping {} bytes at {} failed: {}", size, offset, result);
                None
            }
        }
    }

    fn unmap(&mut self) {
        if !self.mapped {
            warn!("Unmapping device memory that is not mapped");
            return;
        }

        unsafe { self.device().driver().unmap_memory(self.native()) };
        self.mapped = false;
    }

    fn flush(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> bool {
        unsafe { self.device().driver().flush_mapped_memory_range(self.native(), offset, size) }.is_ok()
    }

    fn invalidate(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> bool {
        unsafe { self.device().driver().invalidate_mapped_memory_range(self.native(), offset, size) }.is_ok()
    }

    fn bind(&self, target: BindTarget, offset: vk::DeviceSize) -> Result<()> {
        unsafe { self.device().driver().bind_memory(target, self.native(), offset, &[]) }
            .map_err(|result| Error::native(bind_operation(target), result))
    }

    fn bind_device_group(&self, target: BindTarget, device_indices: &[u32], offset: vk::DeviceSize) -> Result<()> {
        unsafe { self.device().driver().bind_memory(target, self.native(), offset, device_indices) }
            .map_err(|result| Error::native(bind_operation(target), result))
    }

    fn realloc(&mut self, _target: BindTarget, requirements: &MemoryRequirements, chain: &StructureChain) -> Result<()> {
        if self.mapped {
            self.unmap();
        }
        let memory_type_index = find_memory_type(
            self.device().memory_properties(),
            self.requested_flags,
            requirements.memory_type_bits
        )?;

        // Old block is freed before the new one is allocated
        let size = requirements.size;
        self.memory.recreate(|driver, callbacks| unsafe {
            driver.allocate_memory(size, memory_type_index, chain, callbacks)
        })
        .map_err(Error::allocation)?;

        self.size = size;
        self.memory_type_index = memory_type_index;
        self.flags = self.device().memory_properties().memory_types[memory_type_index as usize].property_flags;
        self.priority = chain.priority().unwrap_or(priority::DEFAULT);
        self.device_mask = device_mask(chain);
        self.dedicated = chain.dedicated().is_some();
        self.report();
        debug!("Reallocated device memory: {} bytes from type {}", size, memory_type_index);

        Ok(())
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        if self.mapped && !self.memory.is_null() {
            unsafe { self.device().driver().unmap_memory(self.native()) };
        }
    }
}

impl std::fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("memory", &self.memory)
            .field("size", &self.size)
            .field("memory_type_index", &self.memory_type_index)
            .field("flags", &self.flags)
            .finish()
    }
}


/// Region of a block owned by a [`DeviceAllocator`].
pub struct ManagedMemory {
    allocation: SubAllocation,
    name: String,
    requested_flags: vk::MemoryPropertyFlags,
    priority: f32,
    dedicated: bool,
    linear: bool,
    mapped: bool,
    allocator: Arc<dyn DeviceAllocator>,
    device: Arc<Device>,
}

impl ManagedMemory {
    pub fn allocate(
        device: &Arc<Device>,
        allocator: Arc<dyn DeviceAllocator>,
        request: &AllocationRequest<'_>
    ) -> Result<Self> {
        let allocation = allocator.alloc(request)?;

        Ok(Self {
            allocation,
            name: request.name.to_owned(),
            requested_flags: request.flags,
            priority: request.priority,
            dedicated: request.dedicated,
            linear: request.linear,
            mapped: false,
            allocator,
            device: device.clone(),
        })
    }

    pub fn allocation(&self) -> &SubAllocation {
        &self.allocation
    }

    fn clamp(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> vk::DeviceSize {
        match size {
            vk::WHOLE_SIZE => self.allocation.size.saturating_sub(offset),
            size => size
        }
    }
}

impl Memory for ManagedMemory {
    fn native(&self) -> vk::DeviceMemory {
        self.allocation.memory
    }

    fn size(&self) -> vk::DeviceSize {
        self.allocation.size
    }

    fn base_offset(&self) -> vk::DeviceSize {
        self.allocation.offset
    }

    fn flags(&self) -> vk::MemoryPropertyFlags {
        self.allocation.flags
    }

    fn priority(&self) -> f32 {
        self.priority
    }

    fn device_mask(&self) -> u32 {
        1
    }

    fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    fn is_mapped(&self) -> bool {
        self.mapped
    }

    fn map(&mut self, offset: vk::DeviceSize, size: vk::DeviceSize) -> Option<NonNull<c_void>> {
        if self.mapped || offset + self.clamp(offset, size) > self.allocation.size {
            return None;
        }

        // Pooled blocks stay persistently mapped by their allocator
        let base = self.allocator.mapped_ptr(&self.allocation)?;
        self.mapped = true;
        // SAFETY: offset is within the sub-allocation, checked above
        NonNull::new(unsafe { base.as_ptr().cast::<u8>().add(offset as usize) }.cast())
    }

    fn unmap(&mut self) {
        if !self.mapped {
            warn!("Unmapping pooled memory '{}' that is not mapped", self.name);
        }
        self.mapped = false;
    }

    fn flush(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> bool {
        let size = self.clamp(offset, size);
        unsafe { self.device.driver().flush_mapped_memory_range(self.native(), self.base_offset() + offset, size) }.is_ok()
    }

    fn invalidate(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> bool {
        let size = self.clamp(offset, size);
        unsafe { self.device.driver().invalidate_mapped_memory_range(self.native(), self.base_offset() + offset, size) }.is_ok()
    }

    fn bind(&self, target: BindTarget, offset: vk::DeviceSize) -> Result<()> {
        unsafe { self.device.driver().bind_memory(target, self.native(), self.base_offset() + offset, &[]) }
            .map_err(|result| Error::native(bind_operation(target), result))
    }

    fn bind_device_group(&self, target: BindTarget, device_indices: &[u32], offset: vk::DeviceSize) -> Result<()> {
        unsafe { self.device.driver().bind_memory(target, self.native(), self.base_offset() + offset, device_indices) }
            .map_err(|result| Error::native(bind_operation(target), result))
    }

    fn realloc(&mut self, target: BindTarget, requirements: &MemoryRequirements, chain: &StructureChain) -> Result<()> {
        self.mapped = false;
        self.allocator.free(&self.allocation)?;

        let request = AllocationRequest {
            name: &self.name,
            target,
            requirements: *requirements,
            flags: self.requested_flags,
            priority: self.priority,
            dedicated: chain.dedicated().is_some(),
            linear: self.linear,
        };
        let allocation = self.allocator.alloc(&request)?;
        self.dedicated = request.dedicated;
        self.allocation = allocation;

        Ok(())
    }
}

impl Drop for ManagedMemory {
    fn drop(&mut self) {
        if let Err(error) = self.allocator.free(&self.allocation) {
            warn!("Failed to return pooled memory '{}': {}", self.name, error);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (memory_type, &flags) in properties.memory_types.iter_mut().zip(types) {
            memory_type.property_flags = flags;
        }
        properties
    }

    const LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;

    #[test]
    fn exact_match_beats_superset() {
        let properties = properties(&[LOCAL | VISIBLE | COHERENT, VISIBLE | COHERENT, LOCAL]);

        assert_eq!(find_memory_type(&properties, VISIBLE | COHERENT, u32::MAX).unwrap(), 1);
        assert_eq!(find_memory_type(&properties, LOCAL, u32::MAX).unwrap(), 2);
        assert_eq!(find_memory_type(&properties, VISIBLE, u32::MAX).unwrap(), 0);
    }

    #[test]
    fn type_bits_restrict_the_search() {
        let properties = properties(&[LOCAL, LOCAL | VISIBLE | COHERENT]);

        assert_eq!(find_memory_type(&properties, LOCAL, 0b10).unwrap(), 1);
        assert!(matches!(
            find_memory_type(&properties, VISIBLE, 0b01),
            Err(Error::UnsupportedMemoryType { .. })
        ));
    }

    #[test]
    fn tables_without_a_viable_type_fail() {
        let properties = properties(&[LOCAL]);
        assert!(matches!(
            find_memory_type(&properties, VISIBLE | COHERENT, u32::MAX),
            Err(Error::UnsupportedMemoryType { flags }) if flags == VISIBLE | COHERENT
        ));
        assert!(find_memory_type(&self::properties(&[]), vk::MemoryPropertyFlags::empty(), u32::MAX).is_err());
    }

    #[test]
    fn empty_request_takes_the_first_allowed_type() {
        let properties = properties(&[LOCAL, VISIBLE]);
        assert_eq!(find_memory_type(&properties, vk::MemoryPropertyFlags::empty(), 0b10).unwrap(), 1);
    }

    #[test]
    fn dedicated_follows_either_flag() {
        let requirements = MemoryRequirements { prefers_dedicated: true, ..Default::default() };
        assert!(requirements.dedicated());
        assert!(!MemoryRequirements::default().dedicated());
    }
}
