use super::{
    allocate_memory, bind_target, memory_chain, memory_flags, memory_requirements,
    Binding, DedicatedPolicy, Initializer, Resource, ResourceClass, Sharing
};
use crate::{
    allocator::Allocator,
    command::{CommandBuffer, CommandBufferState},
    device::Device,
    driver::{BindTarget, Driver},
    error::{Error, Result},
    extensions::Extensions,
    handle::NonDispatchable,
    memory::{Memory, MemoryRequirements},
    transfer::{self, CopyMemoryFn, CopyRegion}
};

use ash::{prelude::VkResult, vk};
use bevy_log::{debug, warn};

use std::sync::Arc;


#[derive(Clone)]
pub struct BufferInfo {
    pub size: vk::DeviceSize,
    pub flags: vk::BufferCreateFlags,
    pub usage: vk::BufferUsageFlags,
    pub memory_flags: vk::MemoryPropertyFlags,
    pub initializer: Initializer,
    pub sharing: Sharing,
    pub allocator: Allocator,
    pub debug_name: &'static str,
}

impl Default for BufferInfo {
    fn default() -> Self {
        Self {
            size: 0,
            flags: vk::BufferCreateFlags::empty(),
            usage: vk::BufferUsageFlags::empty(),
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            initializer: Initializer::default(),
            sharing: Sharing::Exclusive,
            allocator: Allocator::default(),
            debug_name: "Buffer",
        }
    }
}

/// Initial contents uploaded through a staging buffer.
pub struct InitialData<'a> {
    pub command_buffer: &'a mut CommandBuffer,
    pub data: &'a [u8],
    pub copy_fn: Option<CopyMemoryFn>,
}


pub struct Buffer {
    // Destroyed before the memory it is bound to
    buffer: NonDispatchable<vk::Buffer>,
    binding: Binding,
    info: BufferInfo,
    usage: vk::BufferUsageFlags,
    requirements: MemoryRequirements,
}

fn buffer_usage(info: &BufferInfo, extensions: &Extensions) -> vk::BufferUsageFlags {
    let mut usage = info.usage;
    if info.initializer.storage {
        usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if info.initializer.src_transfer {
        usage |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if info.initializer.device_address && extensions.buffer_device_address {
        usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    usage
}

fn create_buffer(
    driver: &dyn Driver,
    info: &BufferInfo,
    usage: vk::BufferUsageFlags,
    callbacks: Option<&vk::AllocationCallbacks<'_>>
) -> VkResult<vk::Buffer> {
    let buffer_create_info = vk::BufferCreateInfo::default()
        .flags(info.flags)
        .size(info.size)
        .usage(usage)
        .sharing_mode(info.sharing.mode())
        .queue_family_indices(info.sharing.queue_family_indices());
    unsafe { driver.create_buffer(&buffer_create_info, callbacks) }
}

impl Buffer {
    /// Creates a buffer and binds it to newly allocated memory.
    pub fn new(device: &Arc<Device>, info: BufferInfo) -> Result<Self> {
        let mut buffer = Self::unbound(device, info)?;
        let memory = buffer.allocate()?;
        buffer.bind_memory(memory, 0)?;

        Ok(buffer)
    }

    /// Creates a buffer without memory. Bind it with [`Resource::bind_memory`].
    pub fn unbound(device: &Arc<Device>, info: BufferInfo) -> Result<Self> {
        // Create buffer
        let usage = buffer_usage(&info, device.extensions());
        let buffer = NonDispatchable::create(device, info.allocator.host_allocator().cloned(), |driver, callbacks| {
            create_buffer(driver, &info, usage, callbacks)
        })
        .map_err(|result| Error::creation("vkCreateBuffer", result))?;
        let requirements = memory_requirements(device, BindTarget::Buffer(buffer.handle()));

        Ok(Self {
            buffer,
            binding: Binding::default(),
            info,
            usage,
            requirements,
        })
    }

    /// Host-visible, coherent source of transfers, optionally filled with `data`.
    pub fn src_transfer(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        data: Option<&[u8]>,
        allocator: &Allocator,
        copy_fn: Option<CopyMemoryFn>
    ) -> Result<Self> {
        let mut buffer = Self::new(device, BufferInfo {
            size,
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            initializer: Initializer { src_transfer: true, ..Default::default() },
            allocator: allocator.clone(),
            debug_name: "Staging Buffer",
            ..Default::default()
        })?;
        if let Some(data) = data {
            buffer.copy_host(data, CopyRegion::default(), copy_fn)?;
        }

        Ok(buffer)
    }

    /// Host-visible, coherent destination of transfers, for reading results back.
    pub fn dst_transfer(device: &Arc<Device>, size: vk::DeviceSize, allocator: &Allocator) -> Result<Self> {
        Self::new(device, BufferInfo {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_DST,
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            allocator: allocator.clone(),
            debug_name: "Readback Buffer",
            ..Default::default()
        })
    }

    /// Device-local storage buffer. Initial data goes through a staging buffer.
    pub fn storage(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        allocator: &Allocator,
        initial_data: Option<InitialData<'_>>
    ) -> Result<Self> {
        let mut buffer = Self::new(device, BufferInfo {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            initializer: Initializer { storage: true, ..Default::default() },
            allocator: allocator.clone(),
            debug_name: "Storage Buffer",
            ..Default::default()
        })?;
        if let Some(InitialData { command_buffer, data, copy_fn }) = initial_data {
            buffer.copy_staged(command_buffer, data, allocator, copy_fn)?;
        }

        Ok(buffer)
    }

    /// Host-visible storage buffer, written directly by the host. `pinned` also asks for
    /// device-local memory.
    pub fn dynamic_storage(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        pinned: bool,
        data: Option<&[u8]>,
        allocator: &Allocator,
        copy_fn: Option<CopyMemoryFn>
    ) -> Result<Self> {
        let mut memory_flags = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        if pinned {
            memory_flags |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
        }
        let mut buffer = Self::new(device, BufferInfo {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            memory_flags,
            initializer: Initializer { storage: true, ..Default::default() },
            allocator: allocator.clone(),
            debug_name: "Dynamic Storage Buffer",
            ..Default::default()
        })?;
        if let Some(data) = data {
            buffer.copy_host(data, CopyRegion::default(), copy_fn)?;
        }

        Ok(buffer)
    }

    /// Creates a buffer filled with `data`, written directly when the memory is host-visible
    /// and coherent, staged through `command_buffer` otherwise.
    pub fn with_data(
        command_buffer: &mut CommandBuffer,
        mut info: BufferInfo,
        data: &[u8],
        copy_fn: Option<CopyMemoryFn>
    ) -> Result<Self> {
        let device = command_buffer.device().clone();
        let allocator = info.allocator.clone();
        info.usage |= vk::BufferUsageFlags::TRANSFER_DST;

        let mut buffer = Self::new(&device, info)?;
        let host_coherent = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        match buffer.memory().is_some_and(|memory| memory.flags().contains(host_coherent)) {
            true => buffer.copy_host(data, CopyRegion::default(), copy_fn)?,
            false => buffer.copy_staged(command_buffer, data, &allocator, copy_fn)?
        }

        Ok(buffer)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    pub fn device(&self) -> &Arc<Device> {
        self.buffer.device()
    }

    pub fn info(&self) -> &BufferInfo {
        &self.info
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn requirements(&self) -> &MemoryRequirements {
        &self.requirements
    }

    fn target(&self) -> BindTarget {
        BindTarget::Buffer(self.handle())
    }

    pub(crate) fn allocate(&self) -> Result<Box<dyn Memory>> {
        allocate_memory(
            self.device(),
            self.info.debug_name,
            self.target(),
            &self.requirements,
            memory_flags(self.info.memory_flags, &self.info.initializer),
            &self.info.initializer,
            &self.info.allocator,
            true
        )
    }

    fn bind(&mut self, memory: Box<dyn Memory>, offset: vk::DeviceSize, device_indices: &[u32]) -> Result<()> {
        let target = self.target();
        bind_target(&mut self.binding, self.buffer.footprint(), target, &self.requirements, memory, offset, device_indices)
    }

    /// Destroys the native buffer and creates it again from the current info.
    fn recreate(&mut self) -> Result<()> {
        let (info, usage) = (&self.info, self.usage);
        self.buffer.recreate(|driver, callbacks| create_buffer(driver, info, usage, callbacks))
            .map_err(|result| Error::creation("vkCreateBuffer", result))?;
        self.binding.invalidate();
        self.requirements = memory_requirements(self.device(), self.target());

        Ok(())
    }

    /// Resizes the buffer. The handle changes and the previous contents are lost; same-size
    /// requests do nothing.
    ///
    /// Memory requirements are queried again, so a changed dedicated-allocation preference is
    /// followed ([`DedicatedPolicy::Requery`]). If the new handle cannot be created, the buffer
    /// is rebuilt at its previous size on the memory it had. If the new memory cannot be
    /// allocated or bound, the buffer is rebuilt at its previous size but left unbound.
    pub fn realloc(&mut self, size: vk::DeviceSize) -> Result<()> {
        if size == self.info.size {
            return Ok(());
        }

        let previous = self.info.size;
        let offset = self.binding.offset();
        let memory = self.binding.take();
        self.info.size = size;
        if let Err(error) = self.recreate() {
            self.restore(previous, memory, offset);
            return Err(error);
        }

        let Some(mut memory) = memory else {
            return Ok(());
        };
        let target = self.target();
        let chain = memory_chain(self.device(), target, &self.requirements, &self.info.initializer);
        // The old block is already gone once realloc starts, so failures leave the buffer unbound
        let rebound = memory.realloc(target, &self.requirements, &chain)
            .and_then(|()| self.bind(memory, 0, &[]));
        if let Err(error) = rebound {
            self.restore(previous, None, offset);
            return Err(error);
        }
        debug!(
            "Reallocated '{}' from {} to {} bytes ({:?})",
            self.info.debug_name, previous, size, DedicatedPolicy::Requery
        );

        Ok(())
    }

    /// Rebuilds the handle at `size` and binds `memory` back after a failed resize.
    fn restore(&mut self, size: vk::DeviceSize, memory: Option<Box<dyn Memory>>, offset: vk::DeviceSize) {
        self.info.size = size;
        if let Err(error) = self.recreate() {
            warn!("'{}' lost its handle while restoring a failed resize: {}", self.info.debug_name, error);
            if let Some(memory) = memory {
                self.binding.keep(memory, offset);
            }
            return;
        }
        if let Some(memory) = memory {
            if let Err(error) = self.bind(memory, offset, &[]) {
                warn!("'{}' could not rebind its memory after a failed resize: {}", self.info.debug_name, error);
            }
        }
    }

    /// Writes `src` through a host mapping of the buffer memory.
    pub fn copy_host(&mut self, src: &[u8], region: CopyRegion, copy_fn: Option<CopyMemoryFn>) -> Result<()> {
        let region = region.resolve(self.size(), src.len() as vk::DeviceSize)?;
        if region.size == 0 {
            return Ok(());
        }
        if !self.binding.is_bound() {
            return Err(Error::invalid_usage("buffer has no bound memory"));
        }

        let offset = self.binding.offset() + region.dst_offset;
        let memory = self.binding.memory_mut()
            .ok_or_else(|| Error::invalid_usage("buffer has no bound memory"))?;
        if !memory.flags().contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(Error::invalid_usage("buffer memory is not host-visible"));
        }

        let ptr = memory.map(offset, region.size)
            .ok_or(Error::Native { operation: "vkMapMemory", result: vk::Result::ERROR_MEMORY_MAP_FAILED })?;
        // SAFETY: the mapping covers region.size bytes, and the region was clamped to the buffer
        let dst = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr().cast::<u8>(), region.size as usize) };
        let src = &src[region.src_offset as usize..][..region.size as usize];
        transfer::copy_host_bytes(dst, src, copy_fn);

        let flushed = memory.flags().contains(vk::MemoryPropertyFlags::HOST_COHERENT)
            || memory.flush(offset, region.size);
        memory.unmap();
        match flushed {
            true => Ok(()),
            false => Err(Error::Native { operation: "vkFlushMappedMemoryRanges", result: vk::Result::ERROR_MEMORY_MAP_FAILED })
        }
    }

    /// Reads buffer contents into `dst` through a host mapping.
    pub fn read_host(&mut self, dst: &mut [u8], region: CopyRegion) -> Result<()> {
        let region = region.resolve(dst.len() as vk::DeviceSize, self.size())?;
        if region.size == 0 {
            return Ok(());
        }
        if !self.binding.is_bound() {
            return Err(Error::invalid_usage("buffer has no bound memory"));
        }

        let offset = self.binding.offset() + region.src_offset;
        let memory = self.binding.memory_mut()
            .ok_or_else(|| Error::invalid_usage("buffer has no bound memory"))?;
        if !memory.flags().contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(Error::invalid_usage("buffer memory is not host-visible"));
        }

        let ptr = memory.map(offset, region.size)
            .ok_or(Error::Native { operation: "vkMapMemory", result: vk::Result::ERROR_MEMORY_MAP_FAILED })?;
        let coherent = memory.flags().contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        if !coherent && !memory.invalidate(offset, region.size) {
            memory.unmap();
            return Err(Error::Native { operation: "vkInvalidateMappedMemoryRanges", result: vk::Result::ERROR_MEMORY_MAP_FAILED });
        }
        // SAFETY: the mapping covers region.size bytes, and the region was clamped to the buffer
        let src = unsafe { std::slice::from_raw_parts(ptr.as_ptr().cast::<u8>(), region.size as usize) };
        dst[region.dst_offset as usize..][..region.size as usize].copy_from_slice(src);
        memory.unmap();

        Ok(())
    }

    /// Records a copy from `src` into this buffer.
    pub fn copy_transfer(&self, command_buffer: &mut CommandBuffer, src: &Buffer, region: CopyRegion) -> Result<()> {
        let region = region.resolve(self.size(), src.size())?;
        if region.size == 0 {
            return Ok(());
        }

        command_buffer.copy_buffer(src.handle(), self.handle(), &[region.buffer_copy()])
    }

    /// Uploads `data` through a temporary staging buffer and waits for the copy to finish.
    ///
    /// `command_buffer` is reset and re-recorded; it must come from a resettable pool and must
    /// not be recording. The staging buffer is released only after the fence wait returns.
    pub fn copy_staged(
        &mut self,
        command_buffer: &mut CommandBuffer,
        data: &[u8],
        allocator: &Allocator,
        copy_fn: Option<CopyMemoryFn>
    ) -> Result<()> {
        if !command_buffer.allows_reset() {
            return Err(Error::invalid_usage("staged copies need a resettable command buffer"));
        }
        if command_buffer.state() == CommandBufferState::Recording {
            return Err(Error::invalid_usage("command buffer is already recording"));
        }
        if !self.binding.is_bound() {
            return Err(Error::invalid_usage("buffer has no bound memory"));
        }
        if data.is_empty() {
            return Ok(());
        }

        let staging = Buffer::src_transfer(self.device(), self.size(), Some(data), allocator, copy_fn)?;

        command_buffer.reset()?;
        command_buffer.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        self.copy_transfer(command_buffer, &staging, CopyRegion::sized(data.len() as vk::DeviceSize))?;
        command_buffer.end()?;
        transfer::finish(command_buffer)?;
        debug!("Staged {} bytes into '{}'", data.len().min(self.size() as usize), self.info.debug_name);

        drop(staging);
        Ok(())
    }

    /// Descriptor covering the whole buffer.
    pub fn descriptor(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.handle(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    /// Device address of the buffer, or 0 when it was not created for device addressing.
    pub fn device_address(&self) -> vk::DeviceAddress {
        if !self.device().extensions().buffer_device_address
            || !self.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            || !self.binding.is_bound()
        {
            return 0;
        }
        unsafe { self.device().driver().buffer_device_address(self.handle()) }
    }

    /// Sparse binding of the whole bound memory range at `resource_offset`.
    pub fn sparse_memory_bind(&self, resource_offset: vk::DeviceSize) -> vk::SparseMemoryBind {
        let (memory, memory_offset) = match self.binding.memory() {
            Some(memory) => (memory.native(), memory.base_offset() + self.binding.offset()),
            None => (vk::DeviceMemory::null(), 0)
        };

        vk::SparseMemoryBind {
            resource_offset,
            size: self.requirements.size,
            memory,
            memory_offset,
            flags: vk::SparseMemoryBindFlags::empty(),
        }
    }
}

impl Resource for Buffer {
    fn class(&self) -> ResourceClass {
        ResourceClass::Buffer
    }

    fn size(&self) -> vk::DeviceSize {
        self.info.size
    }

    fn offset(&self) -> vk::DeviceSize {
        self.binding.offset()
    }

    fn memory(&self) -> Option<&dyn Memory> {
        self.binding.memory()
    }

    fn memory_mut(&mut self) -> Option<&mut (dyn Memory + 'static)> {
        self.binding.memory_mut()
    }

    fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }

    fn bind_memory(&mut self, memory: Box<dyn Memory>, offset: vk::DeviceSize) -> Result<()> {
        self.bind(memory, offset, &[])
    }

    fn bind_memory_device_group(&mut self, memory: Box<dyn Memory>, device_indices: &[u32], offset: vk::DeviceSize) -> Result<()> {
        self.device().extensions().require(ash::khr::device_group::NAME)?;
        self.bind(memory, offset, device_indices)
    }

    /// Keeps the memory block, so the dedicated preference of the original allocation stays
    /// ([`DedicatedPolicy::KeepExisting`]).
    fn on_defragment(&mut self) -> Result<()> {
        let offset = self.binding.offset();
        let Some(memory) = self.binding.take() else {
            return Err(Error::invalid_usage("cannot defragment a buffer without memory"));
        };
        if let Err(error) = self.recreate() {
            self.binding.keep(memory, offset);
            return Err(error);
        }

        if self.requirements.dedicated() != memory.is_dedicated() {
            debug!(
                "'{}' keeps its existing allocation although the dedicated preference changed ({:?})",
                self.info.debug_name, DedicatedPolicy::KeepExisting
            );
        }
        self.bind(memory, offset, &[])
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.info.debug_name)
            .field("buffer", &self.buffer)
            .field("size", &self.info.size)
            .field("usage", &self.usage)
            .field("bound", &self.binding.is_bound())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializer_extends_usage() {
        let info = BufferInfo {
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            initializer: Initializer { storage: true, src_transfer: true, device_address: true, ..Default::default() },
            ..Default::default()
        };

        let usage = buffer_usage(&info, &Extensions::default());
        assert_eq!(
            usage,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC
        );

        let extensions = Extensions::new([ash::khr::buffer_device_address::NAME]);
        assert!(buffer_usage(&info, &extensions).contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
    }
}
