use super::{Buffer, BufferInfo, Initializer, Resource, ResourceClass};
use crate::{
    allocator::Allocator,
    device::Device,
    driver::Driver,
    error::{Error, Result},
    handle::NonDispatchable,
    memory::Memory
};

use ash::{prelude::VkResult, vk};
use bevy_log::{debug, warn};

use std::sync::Arc;


#[derive(Clone)]
pub struct AccelerationStructureInfo {
    /// Size of the backing storage, from `vkGetAccelerationStructureBuildSizesKHR`.
    pub size: vk::DeviceSize,
    pub ty: vk::AccelerationStructureTypeKHR,
    pub flags: vk::AccelerationStructureCreateFlagsKHR,
    pub initializer: Initializer,
    pub allocator: Allocator,
    pub debug_name: &'static str,
}

impl Default for AccelerationStructureInfo {
    fn default() -> Self {
        Self {
            size: 0,
            ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            flags: vk::AccelerationStructureCreateFlagsKHR::empty(),
            initializer: Initializer::default(),
            allocator: Allocator::default(),
            debug_name: "Acceleration Structure",
        }
    }
}

/// `VK_KHR_acceleration_structure` object placed in a storage buffer it owns.
///
/// The buffer holds the memory; the acceleration structure handle exists only while the buffer
/// is bound.
pub struct AccelerationStructure {
    // Destroyed before the backing buffer
    acceleration_structure: Option<NonDispatchable<vk::AccelerationStructureKHR>>,
    buffer: Buffer,
    info: AccelerationStructureInfo,
}

fn create_acceleration_structure(
    driver: &dyn Driver,
    buffer: vk::Buffer,
    info: &AccelerationStructureInfo,
    callbacks: Option<&vk::AllocationCallbacks<'_>>
) -> VkResult<vk::AccelerationStructureKHR> {
    let acceleration_structure_create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .create_flags(info.flags)
        .buffer(buffer)
        .offset(0)
        .size(info.size)
        .ty(info.ty);
    unsafe { driver.create_acceleration_structure(&acceleration_structure_create_info, callbacks) }
}

fn backing_buffer(device: &Arc<Device>, info: &AccelerationStructureInfo) -> Result<Buffer> {
    Buffer::unbound(device, BufferInfo {
        size: info.size,
        usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        initializer: Initializer { device_address: true, ..info.initializer },
        allocator: info.allocator.clone(),
        debug_name: info.debug_name,
        ..Default::default()
    })
}

impl AccelerationStructure {
    pub fn new(device: &Arc<Device>, info: AccelerationStructureInfo) -> Result<Self> {
        let mut acceleration_structure = Self::unbound(device, info)?;
        let memory = acceleration_structure.buffer.allocate()?;
        acceleration_structure.bind_memory(memory, 0)?;

        Ok(acceleration_structure)
    }

    /// Creates the backing buffer only. The handle is created by the first bind.
    pub fn unbound(device: &Arc<Device>, info: AccelerationStructureInfo) -> Result<Self> {
        device.extensions().require(ash::khr::acceleration_structure::NAME)?;
        let buffer = backing_buffer(device, &info)?;

        Ok(Self {
            acceleration_structure: None,
            buffer,
            info,
        })
    }

    /// Null until the backing buffer is bound.
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.acceleration_structure.as_ref()
            .map_or(vk::AccelerationStructureKHR::null(), NonDispatchable::handle)
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn device(&self) -> &Arc<Device> {
        self.buffer.device()
    }

    pub fn info(&self) -> &AccelerationStructureInfo {
        &self.info
    }

    fn create_handle(&mut self) -> Result<()> {
        let (buffer, info) = (self.buffer.handle(), &self.info);
        let acceleration_structure = NonDispatchable::create(self.buffer.device(), info.allocator.host_allocator().cloned(), |driver, callbacks| {
            create_acceleration_structure(driver, buffer, info, callbacks)
        })
        .map_err(|result| Error::creation("vkCreateAccelerationStructureKHR", result))?;

        let size = self.buffer.requirements().size;
        let flags = self.buffer.memory().map(|memory| memory.flags()).unwrap_or_default();
        acceleration_structure.footprint().update(|detail| {
            detail.memory_size = size;
            detail.memory_flags = flags;
        });
        self.acceleration_structure = Some(acceleration_structure);

        Ok(())
    }

    /// Creates the handle over the just bound buffer. On failure the buffer and its memory are
    /// replaced by a fresh unbound buffer, so memory can be bound again.
    fn bind_handle(&mut self) -> Result<()> {
        let Err(error) = self.create_handle() else {
            return Ok(());
        };

        let device = self.buffer.device().clone();
        match backing_buffer(&device, &self.info) {
            Ok(buffer) => self.buffer = buffer,
            Err(rebuild) => warn!("'{}' keeps a bound buffer without a handle: {}", self.info.debug_name, rebuild)
        }
        Err(error)
    }
}

impl Resource for AccelerationStructure {
    fn class(&self) -> ResourceClass {
        ResourceClass::AccelerationStructure
    }

    fn size(&self) -> vk::DeviceSize {
        self.info.size
    }

    fn offset(&self) -> vk::DeviceSize {
        self.buffer.offset()
    }

    fn memory(&self) -> Option<&dyn Memory> {
        self.buffer.memory()
    }

    fn memory_mut(&mut self) -> Option<&mut (dyn Memory + 'static)> {
        self.buffer.memory_mut()
    }

    fn is_bound(&self) -> bool {
        self.buffer.is_bound() && self.acceleration_structure.is_some()
    }

    fn bind_memory(&mut self, memory: Box<dyn Memory>, offset: vk::DeviceSize) -> Result<()> {
        self.buffer.bind_memory(memory, offset)?;
        self.bind_handle()
    }

    fn bind_memory_device_group(&mut self, memory: Box<dyn Memory>, device_indices: &[u32], offset: vk::DeviceSize) -> Result<()> {
        self.buffer.bind_memory_device_group(memory, device_indices, offset)?;
        self.bind_handle()
    }

    /// Destroys the handle, rebinds a fresh backing buffer to the same memory and creates the
    /// handle again. The structure must be rebuilt afterwards.
    fn on_defragment(&mut self) -> Result<()> {
        self.acceleration_structure = None;
        self.buffer.on_defragment()?;
        self.create_handle()?;
        debug!("Recreated '{}' after defragmentation", self.info.debug_name);

        Ok(())
    }
}

impl std::fmt::Debug for AccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("name", &self.info.debug_name)
            .field("acceleration_structure", &self.acceleration_structure)
            .field("ty", &self.info.ty)
            .field("buffer", &self.buffer)
            .finish()
    }
}
