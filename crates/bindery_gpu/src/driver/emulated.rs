//! Software device that executes the resource protocol in host memory.
//!
//! Device memory is plain heap memory, copy commands run when their command buffer is submitted
//! and fences signal immediately after. Every native call is appended to a shared [`CallLog`],
//! so ordering properties (e.g. "the staging buffer is destroyed after the fence wait") can be
//! observed from the outside.

use super::{BindTarget, Driver};
use crate::{chain::StructureChain, memory::MemoryRequirements};

use ash::{prelude::VkResult, vk::{self, Handle}};
use bevy_log::{debug, warn};

use std::{
    alloc::{self, Layout},
    collections::{HashMap, HashSet},
    ffi::{c_void, CStr, CString},
    ptr::NonNull,
    sync::{Arc, Mutex, MutexGuard}
};


const HOST_ALLOCATION_SIZE: usize = 64;
const HOST_ALLOCATION_ALIGNMENT: usize = 8;
const DEVICE_ADDRESS_BASE: u64 = 0x1_0000_0000;

/// Native call observed by an [`EmulatedDevice`].
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    CreateBuffer { buffer: vk::Buffer, size: vk::DeviceSize },
    DestroyBuffer(vk::Buffer),
    CreateImage(vk::Image),
    DestroyImage(vk::Image),
    CreateAccelerationStructure(vk::AccelerationStructureKHR),
    DestroyAccelerationStructure(vk::AccelerationStructureKHR),
    AllocateMemory {
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
        memory_type_index: u32,
        /// Structure types in `pNext` traversal order.
        chain: Vec<vk::StructureType>,
        dedicated: bool,
        priority: Option<f32>,
        device_mask: Option<u32>
    },
    FreeMemory(vk::DeviceMemory),
    MapMemory(vk::DeviceMemory),
    UnmapMemory(vk::DeviceMemory),
    FlushMemory(vk::DeviceMemory),
    InvalidateMemory(vk::DeviceMemory),
    BindMemory {
        target: BindTarget,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        device_indices: Vec<u32>
    },
    CreateCommandPool(vk::CommandPool),
    DestroyCommandPool(vk::CommandPool),
    ResetCommandBuffer(vk::CommandBuffer),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    /// `(src_offset, dst_offset, size)` per region.
    CopyBuffer { src: vk::Buffer, dst: vk::Buffer, regions: Vec<(u64, u64, u64)> },
    CopyBufferToImage { src: vk::Buffer, dst: vk::Image },
    ImageBarrier { image: vk::Image, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout },
    QueueSubmit { queue: vk::Queue, fence: vk::Fence },
    QueueWaitIdle(vk::Queue),
    DeviceWaitIdle,
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    ResetFence(vk::Fence),
    WaitForFence(vk::Fence),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    /// An object was destroyed with different host allocation callbacks than it was created with.
    AllocatorMismatch(u64),
}

/// Shared, append-only record of native calls.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn lock(&self) -> MutexGuard<'_, Vec<Call>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, call: Call) {
        self.lock().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().clone()
    }

    pub fn position(&self, predicate: impl Fn(&Call) -> bool) -> Option<usize> {
        self.lock().iter().position(predicate)
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.lock().iter().filter(|call| predicate(call)).count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}


struct HostBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: The block is only reached through the device state mutex or through pointers handed
// out by `map_memory`, whose synchronization is the caller's responsibility.
unsafe impl Send for HostBlock {  }

impl HostBlock {
    fn new(size: vk::DeviceSize) -> Option<Self> {
        let layout = Layout::from_size_align(usize::try_from(size.max(1)).ok()?, 64).ok()?;
        // SAFETY: layout has a nonzero size
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;

        Some(Self { ptr, layout })
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with layout in HostBlock::new
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct MemoryObject {
    block: HostBlock,
    size: vk::DeviceSize,
    flags: vk::MemoryPropertyFlags,
    mapped: bool,
}

#[derive(Clone, Copy)]
struct Binding {
    memory: u64,
    offset: vk::DeviceSize,
}

struct BufferObject {
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    binding: Option<Binding>,
}

struct ImageObject {
    size: vk::DeviceSize,
    extent: vk::Extent3D,
    texel_size: u64,
    binding: Option<Binding>,
}

#[derive(Clone)]
enum Command {
    CopyBuffer { src: u64, dst: u64, regions: Vec<vk::BufferCopy> },
    CopyBufferToImage { src: u64, dst: u64, regions: Vec<vk::BufferImageCopy> },
    Barrier,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    allocated: vk::DeviceSize,

    memory: HashMap<u64, MemoryObject>,
    buffers: HashMap<u64, BufferObject>,
    images: HashMap<u64, ImageObject>,
    acceleration_structures: HashMap<u64, u64>,
    command_pools: HashMap<u64, Vec<u64>>,
    command_buffers: HashMap<u64, Vec<Command>>,
    fences: HashMap<u64, bool>,
    semaphores: HashSet<u64>,
    // Handle -> (user data, host allocation), both as addresses
    host_allocations: HashMap<u64, (usize, usize)>,
}

impl State {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn binding(&self, target: BindTarget) -> Option<Binding> {
        match target {
            BindTarget::Buffer(buffer) => self.buffers.get(&buffer.as_raw())?.binding,
            BindTarget::Image(image) => self.images.get(&image.as_raw())?.binding,
        }
    }

    fn copy_bytes(&self, src: Binding, dst: Binding, size: vk::DeviceSize) -> VkResult<()> {
        let (Some(src_memory), Some(dst_memory)) = (self.memory.get(&src.memory), self.memory.get(&dst.memory)) else {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        };
        if src.offset + size > src_memory.size || dst.offset + size > dst_memory.size {
            warn!("Emulated copy out of bounds");
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }

        // SAFETY: both ranges were bounds-checked against their blocks above
        unsafe {
            std::ptr::copy(
                src_memory.block.ptr.as_ptr().add(src.offset as usize),
                dst_memory.block.ptr.as_ptr().add(dst.offset as usize),
                size as usize
            );
        }

        Ok(())
    }

    fn execute(&self, command: &Command) -> VkResult<()> {
        match command {
            Command::CopyBuffer { src, dst, regions } => {
                let src = self.binding(BindTarget::Buffer(vk::Buffer::from_raw(*src)))
                    .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
                let dst = self.binding(BindTarget::Buffer(vk::Buffer::from_raw(*dst)))
                    .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
                for region in regions {
                    self.copy_bytes(
                        Binding { memory: src.memory, offset: src.offset + region.src_offset },
                        Binding { memory: dst.memory, offset: dst.offset + region.dst_offset },
                        region.size
                    )?;
                }
            },
            Command::CopyBufferToImage { src, dst, regions } => {
                let image = self.images.get(dst).ok_or(vk::Result::ERROR_DEVICE_LOST)?;
                let src = self.binding(BindTarget::Buffer(vk::Buffer::from_raw(*src)))
                    .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
                let dst = image.binding.ok_or(vk::Result::ERROR_DEVICE_LOST)?;
                for region in regions {
                    let texels = region.image_extent.width as u64
                        * region.image_extent.height.max(1) as u64
                        * region.image_extent.depth.max(1) as u64
                        * region.image_subresource.layer_count.max(1) as u64;
                    let start = (region.image_offset.z.max(0) as u64 * image.extent.height as u64 * image.extent.width as u64
                        + region.image_offset.y.max(0) as u64 * image.extent.width as u64
                        + region.image_offset.x.max(0) as u64) * image.texel_size;
                    let size = (texels * image.texel_size).min(image.size.saturating_sub(start));
                    self.copy_bytes(
                        Binding { memory: src.memory, offset: src.offset + region.buffer_offset },
                        Binding { memory: dst.memory, offset: dst.offset + start },
                        size
                    )?;
                }
            },
            Command::Barrier => ()
        }

        Ok(())
    }
}


/// In-process device backing tests and headless runs.
pub struct EmulatedDevice {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_families: Vec<vk::QueueFamilyProperties>,
    extensions: Vec<CString>,
    alignment: vk::DeviceSize,
    memory_type_bits: Option<u32>,
    prefers_dedicated: bool,
    requires_dedicated: bool,
    memory_limit: Option<vk::DeviceSize>,

    state: Mutex<State>,
    log: CallLog,
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedDevice {
    /// One device-local and one host-visible, host-coherent memory type, one universal queue family.
    pub fn new() -> Self {
        Self {
            memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
            queue_families: vec![
                vk::QueueFamilyProperties::default()
                    .queue_flags(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)
                    .queue_count(1)
            ],
            extensions: vec![],
            alignment: 16,
            memory_type_bits: None,
            prefers_dedicated: false,
            requires_dedicated: false,
            memory_limit: None,
            state: Mutex::new(State::default()),
            log: CallLog::default(),
        }
        .with_memory_types(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ])
    }

    pub fn with_memory_types(mut self, types: &[vk::MemoryPropertyFlags]) -> Self {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len().min(vk::MAX_MEMORY_TYPES) as u32,
            memory_heap_count: 2,
            ..Default::default()
        };
        properties.memory_heaps[0] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL
        };
        properties.memory_heaps[1] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::empty()
        };
        for (memory_type, &flags) in properties.memory_types.iter_mut().zip(types) {
            *memory_type = vk::MemoryType {
                property_flags: flags,
                heap_index: match flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
                    true => 0,
                    false => 1
                }
            };
        }

        self.memory_properties = properties;
        self
    }

    pub fn with_extensions<'a>(mut self, names: impl IntoIterator<Item = &'a CStr>) -> Self {
        self.extensions = names.into_iter().map(CStr::to_owned).collect();
        self
    }

    pub fn with_queue_families(mut self, families: Vec<vk::QueueFamilyProperties>) -> Self {
        self.queue_families = families;
        self
    }

    /// Dedicated-allocation answer reported through the `vkGet*MemoryRequirements2` path.
    pub fn with_dedicated_preference(mut self, prefers: bool, requires: bool) -> Self {
        self.prefers_dedicated = prefers;
        self.requires_dedicated = requires;
        self
    }

    /// Restricts `memoryTypeBits` reported for every resource.
    pub fn with_memory_type_bits(mut self, bits: u32) -> Self {
        self.memory_type_bits = Some(bits);
        self
    }

    /// Allocations beyond `limit` bytes in total fail with `VK_ERROR_OUT_OF_DEVICE_MEMORY`.
    pub fn with_memory_limit(mut self, limit: vk::DeviceSize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    unsafe fn host_allocate(
        &self,
        state: &mut State,
        handle: u64,
        allocator: Option<&vk::AllocationCallbacks<'_>>
    ) -> VkResult<()> {
        let Some(callbacks) = allocator else {
            return Ok(());
        };
        let Some(allocate) = callbacks.pfn_allocation else {
            return Ok(());
        };

        let ptr = allocate(
            callbacks.p_user_data,
            HOST_ALLOCATION_SIZE,
            HOST_ALLOCATION_ALIGNMENT,
            vk::SystemAllocationScope::OBJECT
        );
        if ptr.is_null() {
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        }
        state.host_allocations.insert(handle, (callbacks.p_user_data as usize, ptr as usize));

        Ok(())
    }

    unsafe fn host_free(&self, state: &mut State, handle: u64, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        match (state.host_allocations.remove(&handle), allocator) {
            (None, None) => (),
            (Some((user_data, ptr)), Some(callbacks)) if user_data == callbacks.p_user_data as usize => {
                if let Some(free) = callbacks.pfn_free {
                    free(callbacks.p_user_data, ptr as *mut c_void);
                }
            },
            _ => {
                warn!("Object {:#x} destroyed with mismatched host allocation callbacks", handle);
                self.log.push(Call::AllocatorMismatch(handle));
            }
        }
    }

    fn memory_type_bits(&self) -> u32 {
        self.memory_type_bits.unwrap_or(
            ((1u64 << self.memory_properties.memory_type_count) - 1) as u32
        )
    }

    fn align(&self, size: vk::DeviceSize) -> vk::DeviceSize {
        size.div_ceil(self.alignment) * self.alignment
    }
}

fn texel_size(format: vk::Format) -> u64 {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::R8_SINT |
        vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_UNORM | vk::Format::R16_SFLOAT | vk::Format::R16_UINT |
        vk::Format::D16_UNORM => 2,
        vk::Format::R16G16B16A16_UNORM | vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT |
        vk::Format::R32G32_UINT => 8,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT | vk::Format::R32G32B32A32_SINT => 16,
        _ => 4
    }
}

impl Driver for EmulatedDevice {
    fn name(&self) -> &str {
        "Emulated Device"
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn queue_family_properties(&self) -> &[vk::QueueFamilyProperties] {
        &self.queue_families
    }

    fn enabled_extensions(&self) -> &[CString] {
        &self.extensions
    }

    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::Buffer> {
        if info.size == 0 {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        let mut state = self.state();
        let handle = state.next_handle();
        self.host_allocate(&mut state, handle, allocator)?;
        state.buffers.insert(handle, BufferObject { size: info.size, usage: info.usage, binding: None });

        let buffer = vk::Buffer::from_raw(handle);
        self.log.push(Call::CreateBuffer { buffer, size: info.size });
        Ok(buffer)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        let mut state = self.state();
        state.buffers.remove(&buffer.as_raw());
        self.host_free(&mut state, buffer.as_raw(), allocator);
        self.log.push(Call::DestroyBuffer(buffer));
    }

    unsafe fn create_image(&self, info: &vk::ImageCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::Image> {
        let texel_size = texel_size(info.format);
        let size = info.extent.width.max(1) as u64
            * info.extent.height.max(1) as u64
            * info.extent.depth.max(1) as u64
            * info.array_layers.max(1) as u64
            * texel_size;

        let mut state = self.state();
        let handle = state.next_handle();
        self.host_allocate(&mut state, handle, allocator)?;
        state.images.insert(handle, ImageObject { size, extent: info.extent, texel_size, binding: None });

        let image = vk::Image::from_raw(handle);
        self.log.push(Call::CreateImage(image));
        Ok(image)
    }

    unsafe fn destroy_image(&self, image: vk::Image, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        let mut state = self.state();
        state.images.remove(&image.as_raw());
        self.host_free(&mut state, image.as_raw(), allocator);
        self.log.push(Call::DestroyImage(image));
    }

    unsafe fn create_acceleration_structure(
        &self,
        info: &vk::AccelerationStructureCreateInfoKHR<'_>,
        allocator: Option<&vk::AllocationCallbacks<'_>>
    ) -> VkResult<vk::AccelerationStructureKHR> {
        let mut state = self.state();
        match state.buffers.get(&info.buffer.as_raw()) {
            Some(buffer) if buffer.binding.is_some() && info.offset + info.size <= buffer.size => (),
            _ => return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
        }
        let handle = state.next_handle();
        self.host_allocate(&mut state, handle, allocator)?;
        state.acceleration_structures.insert(handle, info.buffer.as_raw());

        let acceleration_structure = vk::AccelerationStructureKHR::from_raw(handle);
        self.log.push(Call::CreateAccelerationStructure(acceleration_structure));
        Ok(acceleration_structure)
    }

    unsafe fn destroy_acceleration_structure(&self, acceleration_structure: vk::AccelerationStructureKHR, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        let mut state = self.state();
        state.acceleration_structures.remove(&acceleration_structure.as_raw());
        self.host_free(&mut state, acceleration_structure.as_raw(), allocator);
        self.log.push(Call::DestroyAccelerationStructure(acceleration_structure));
    }

    unsafe fn memory_requirements(&self, target: BindTarget, dedicated: bool) -> MemoryRequirements {
        let state = self.state();
        let size = match target {
            BindTarget::Buffer(buffer) => state.buffers.get(&buffer.as_raw()).map(|buffer| buffer.size),
            BindTarget::Image(image) => state.images.get(&image.as_raw()).map(|image| image.size),
        }
        .unwrap_or_default();

        MemoryRequirements {
            size: self.align(size),
            alignment: self.alignment,
            memory_type_bits: self.memory_type_bits(),
            prefers_dedicated: dedicated && self.prefers_dedicated,
            requires_dedicated: dedicated && self.requires_dedicated,
        }
    }

    unsafe fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let state = self.state();
        match state.buffers.get(&buffer.as_raw()) {
            Some(object) if object.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) => {
                DEVICE_ADDRESS_BASE + buffer.as_raw() * 0x1_0000
            },
            _ => 0
        }
    }

    unsafe fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        chain: &StructureChain,
        allocator: Option<&vk::AllocationCallbacks<'_>>
    ) -> VkResult<vk::DeviceMemory> {
        if memory_type_index >= self.memory_properties.memory_type_count {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        let mut state = self.state();
        if let Some(limit) = self.memory_limit {
            if state.allocated + size > limit {
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
        }
        let block = HostBlock::new(size).ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;
        let handle = state.next_handle();
        self.host_allocate(&mut state, handle, allocator)?;
        state.allocated += size;
        state.memory.insert(handle, MemoryObject {
            block,
            size,
            flags: self.memory_properties.memory_types[memory_type_index as usize].property_flags,
            mapped: false
        });

        let memory = vk::DeviceMemory::from_raw(handle);
        debug!("Emulated allocation {:#x}: {} bytes from type {}", handle, size, memory_type_index);
        self.log.push(Call::AllocateMemory {
            memory,
            size,
            memory_type_index,
            chain: chain.chain_nodes().map(|node| node.structure_type()).collect(),
            dedicated: chain.dedicated().is_some(),
            priority: chain.priority(),
            device_mask: chain.allocate_flags()
                .filter(|(flags, _)| flags.contains(vk::MemoryAllocateFlags::DEVICE_MASK))
                .map(|(_, mask)| mask)
        });
        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        let mut state = self.state();
        if let Some(object) = state.memory.remove(&memory.as_raw()) {
            state.allocated -= object.size;
        }
        self.host_free(&mut state, memory.as_raw(), allocator);
        self.log.push(Call::FreeMemory(memory));
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<*mut c_void> {
        let mut state = self.state();
        let object = state.memory.get_mut(&memory.as_raw()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let in_bounds = match size {
            vk::WHOLE_SIZE => offset < object.size,
            size => offset + size <= object.size
        };
        if object.mapped || !in_bounds || !object.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        object.mapped = true;
        let ptr = object.block.ptr.as_ptr().add(offset as usize) as *mut c_void;

        self.log.push(Call::MapMemory(memory));
        Ok(ptr)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        if let Some(object) = self.state().memory.get_mut(&memory.as_raw()) {
            object.mapped = false;
        }
        self.log.push(Call::UnmapMemory(memory));
    }

    unsafe fn flush_mapped_memory_range(&self, memory: vk::DeviceMemory, _offset: vk::DeviceSize, _size: vk::DeviceSize) -> VkResult<()> {
        match self.state().memory.get(&memory.as_raw()) {
            Some(object) if object.mapped => {
                self.log.push(Call::FlushMemory(memory));
                Ok(())
            },
            _ => Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        }
    }

    unsafe fn invalidate_mapped_memory_range(&self, memory: vk::DeviceMemory, _offset: vk::DeviceSize, _size: vk::DeviceSize) -> VkResult<()> {
        match self.state().memory.get(&memory.as_raw()) {
            Some(object) if object.mapped => {
                self.log.push(Call::InvalidateMemory(memory));
                Ok(())
            },
            _ => Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        }
    }

    unsafe fn bind_memory(&self, target: BindTarget, memory: vk::DeviceMemory, offset: vk::DeviceSize, device_indices: &[u32]) -> VkResult<()> {
        let mut state = self.state();
        let memory_size = state.memory.get(&memory.as_raw())
            .map(|object| object.size)
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        let binding = Binding { memory: memory.as_raw(), offset };
        let (size, slot) = match target {
            BindTarget::Buffer(buffer) => state.buffers.get_mut(&buffer.as_raw())
                .map(|object| (object.size, &mut object.binding)),
            BindTarget::Image(image) => state.images.get_mut(&image.as_raw())
                .map(|object| (object.size, &mut object.binding)),
        }
        .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        if slot.is_some() || offset + size > memory_size {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        *slot = Some(binding);

        self.log.push(Call::BindMemory { target, memory, offset, device_indices: device_indices.to_vec() });
        Ok(())
    }

    unsafe fn create_command_pool(&self, _info: &vk::CommandPoolCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::CommandPool> {
        let mut state = self.state();
        let handle = state.next_handle();
        self.host_allocate(&mut state, handle, allocator)?;
        state.command_pools.insert(handle, vec![]);

        let command_pool = vk::CommandPool::from_raw(handle);
        self.log.push(Call::CreateCommandPool(command_pool));
        Ok(command_pool)
    }

    unsafe fn destroy_command_pool(&self, command_pool: vk::CommandPool, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        let mut state = self.state();
        for command_buffer in state.command_pools.remove(&command_pool.as_raw()).unwrap_or_default() {
            state.command_buffers.remove(&command_buffer);
        }
        self.host_free(&mut state, command_pool.as_raw(), allocator);
        self.log.push(Call::DestroyCommandPool(command_pool));
    }

    unsafe fn allocate_command_buffer(&self, command_pool: vk::CommandPool, _level: vk::CommandBufferLevel) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state();
        let handle = state.next_handle();
        state.command_pools.get_mut(&command_pool.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?
            .push(handle);
        state.command_buffers.insert(handle, vec![]);

        Ok(vk::CommandBuffer::from_raw(handle))
    }

    unsafe fn free_command_buffer(&self, command_pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = self.state();
        if let Some(command_buffers) = state.command_pools.get_mut(&command_pool.as_raw()) {
            command_buffers.retain(|&handle| handle != command_buffer.as_raw());
        }
        state.command_buffers.remove(&command_buffer.as_raw());
    }

    unsafe fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer, _flags: vk::CommandBufferResetFlags) -> VkResult<()> {
        self.state().command_buffers.get_mut(&command_buffer.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?
            .clear();
        self.log.push(Call::ResetCommandBuffer(command_buffer));
        Ok(())
    }

    unsafe fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, _info: &vk::CommandBufferBeginInfo<'_>) -> VkResult<()> {
        self.state().command_buffers.get_mut(&command_buffer.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?
            .clear();
        self.log.push(Call::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        match self.state().command_buffers.contains_key(&command_buffer.as_raw()) {
            true => {
                self.log.push(Call::EndCommandBuffer(command_buffer));
                Ok(())
            },
            false => Err(vk::Result::ERROR_VALIDATION_FAILED_EXT)
        }
    }

    unsafe fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        if let Some(commands) = self.state().command_buffers.get_mut(&command_buffer.as_raw()) {
            commands.push(Command::CopyBuffer { src: src.as_raw(), dst: dst.as_raw(), regions: regions.to_vec() });
        }
        self.log.push(Call::CopyBuffer {
            src,
            dst,
            regions: regions.iter()
                .map(|region| (region.src_offset, region.dst_offset, region.size))
                .collect()
        });
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        _layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy]
    ) {
        if let Some(commands) = self.state().command_buffers.get_mut(&command_buffer.as_raw()) {
            commands.push(Command::CopyBufferToImage { src: src.as_raw(), dst: dst.as_raw(), regions: regions.to_vec() });
        }
        self.log.push(Call::CopyBufferToImage { src, dst });
    }

    unsafe fn cmd_image_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        _src_stage_mask: vk::PipelineStageFlags,
        _dst_stage_mask: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>
    ) {
        if let Some(commands) = self.state().command_buffers.get_mut(&command_buffer.as_raw()) {
            commands.push(Command::Barrier);
        }
        self.log.push(Call::ImageBarrier {
            image: barrier.image,
            old_layout: barrier.old_layout,
            new_layout: barrier.new_layout
        });
    }

    unsafe fn get_device_queue(&self, family_index: u32, index: u32) -> vk::Queue {
        vk::Queue::from_raw(0x1000 + ((family_index as u64) << 8) + index as u64)
    }

    unsafe fn queue_submit(&self, queue: vk::Queue, submits: &[vk::SubmitInfo<'_>], fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state();
        for submit in submits {
            let command_buffers = match submit.command_buffer_count {
                0 => &[][..],
                count => std::slice::from_raw_parts(submit.p_command_buffers, count as usize)
            };
            for command_buffer in command_buffers {
                let commands = state.command_buffers.get(&command_buffer.as_raw())
                    .cloned()
                    .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
                for command in &commands {
                    state.execute(command)?;
                }
            }
        }
        if fence != vk::Fence::null() {
            state.fences.insert(fence.as_raw(), true);
        }

        self.log.push(Call::QueueSubmit { queue, fence });
        Ok(())
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        self.log.push(Call::QueueWaitIdle(queue));
        Ok(())
    }

    unsafe fn device_wait_idle(&self) -> VkResult<()> {
        self.log.push(Call::DeviceWaitIdle);
        Ok(())
    }

    unsafe fn create_fence(&self, info: &vk::FenceCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::Fence> {
        let mut state = self.state();
        let handle = state.next_handle();
        self.host_allocate(&mut state, handle, allocator)?;
        state.fences.insert(handle, info.flags.contains(vk::FenceCreateFlags::SIGNALED));

        let fence = vk::Fence::from_raw(handle);
        self.log.push(Call::CreateFence(fence));
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        let mut state = self.state();
        state.fences.remove(&fence.as_raw());
        self.host_free(&mut state, fence.as_raw(), allocator);
        self.log.push(Call::DestroyFence(fence));
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        *self.state().fences.get_mut(&fence.as_raw()).ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)? = false;
        self.log.push(Call::ResetFence(fence));
        Ok(())
    }

    /// Work completes at submission, so an unsignaled fence can never signal and the wait times out.
    unsafe fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
        let signaled = self.state().fences.get(&fence.as_raw()).copied()
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        self.log.push(Call::WaitForFence(fence));

        match signaled {
            true => Ok(()),
            false => Err(vk::Result::TIMEOUT)
        }
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        self.state().fences.get(&fence.as_raw()).copied()
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)
    }

    unsafe fn create_semaphore(&self, _info: &vk::SemaphoreCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::Semaphore> {
        let mut state = self.state();
        let handle = state.next_handle();
        self.host_allocate(&mut state, handle, allocator)?;
        state.semaphores.insert(handle);

        let semaphore = vk::Semaphore::from_raw(handle);
        self.log.push(Call::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        let mut state = self.state();
        state.semaphores.remove(&semaphore.as_raw());
        self.host_free(&mut state, semaphore.as_raw(), allocator);
        self.log.push(Call::DestroySemaphore(semaphore));
    }
}
