use super::{BindTarget, Driver};
use crate::{
    chain::{thread_allocate_info, StructureChain},
    context::Instance,
    device::PhysicalDevice,
    error::{Error, Result},
    memory::MemoryRequirements
};

use ash::{prelude::VkResult, vk};
use bevy_log::{info, warn};

use std::{
    ffi::{c_char, c_void, CStr, CString},
    sync::Arc
};


/// Ash-backed device, forwarding every [`Driver`] call to the Vulkan loader.
pub struct LogicalDevice {
    device: ash::Device,
    acceleration_structure: Option<ash::khr::acceleration_structure::Device>,
    extensions: Vec<CString>,
    physical_device: PhysicalDevice,
    instance: Arc<Instance>,
}

impl std::ops::Deref for LogicalDevice {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.device
    }
}

impl LogicalDevice {
    /// Creates a device on `physical_device` with every queue of every family.
    ///
    /// Requested extensions the physical device does not support are skipped with a warning;
    /// capabilities depending on them fail later with [`Error::UnsupportedExtension`].
    pub fn new(
        instance: Arc<Instance>,
        physical_device: PhysicalDevice,
        requested_extensions: &[&CStr]
    ) -> Result<Self> {
        // Gather supported device extensions
        let extensions: Vec<CString> = requested_extensions.iter()
            .filter(|&&name| match physical_device.supports_extension(name) {
                true => true,
                false => {
                    warn!("Device extension {:?} is not supported by {}", name, physical_device.name());
                    false
                }
            })
            .map(|&name| name.to_owned())
            .collect();
        let extension_names: Vec<*const c_char> = extensions.iter()
            .map(|name| name.as_ptr())
            .collect();
        let enabled = |name: &CStr| extensions.iter().any(|extension| extension.as_c_str() == name);

        // Gather device features for enabled extensions
        let mut buffer_device_address_features = vk::PhysicalDeviceBufferDeviceAddressFeatures::default()
            .buffer_device_address(true);
        let mut memory_priority_features = vk::PhysicalDeviceMemoryPriorityFeaturesEXT::default()
            .memory_priority(true);
        let mut acceleration_structure_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);

        // Gather queue info
        let priorities: Vec<Vec<f32>> = physical_device.queue_family_properties.iter()
            .map(|family| vec![1.0; family.queue_count as usize])
            .collect();
        let queue_create_infos: Vec<_> = priorities.iter()
            .enumerate()
            .filter(|(_, priorities)| !priorities.is_empty())
            .map(|(family, priorities)| vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family as u32)
                .queue_priorities(priorities)
            )
            .collect();

        // Create logical device
        let mut device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names);
        if enabled(ash::khr::buffer_device_address::NAME) {
            device_create_info = device_create_info.push_next(&mut buffer_device_address_features);
        }
        if enabled(ash::ext::memory_priority::NAME) {
            device_create_info = device_create_info.push_next(&mut memory_priority_features);
        }
        if enabled(ash::khr::acceleration_structure::NAME) {
            device_create_info = device_create_info.push_next(&mut acceleration_structure_features);
        }
        let device = unsafe {
            instance.create_device(*physical_device, &device_create_info, None)
                .map_err(|result| Error::creation("vkCreateDevice", result))?
        };

        let acceleration_structure = enabled(ash::khr::acceleration_structure::NAME)
            .then(|| ash::khr::acceleration_structure::Device::new(&instance, &device));

        info!("Created logical device on {} with extensions {:?}", physical_device.name(), extensions);

        Ok(Self {
            device,
            acceleration_structure,
            extensions,
            physical_device,
            instance,
        })
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.physical_device
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            //  Safety: vkDestroyDevice
            //  Host Synchronization
            //   -  Host access to device must be externally synchronized
            //   -  Host access to all VkQueue objects created from device must be externally synchronized
            //
            //  Synchronized host access guaranteed by borrow checker with '&mut self'
            //  Every child object holds a strong reference to the owning Device, so none are alive here
            if let Err(result) = self.device.device_wait_idle() {
                warn!("Device wait idle failed during teardown: {}", result);
            }
            self.device.destroy_device(None);
        }
    }
}

impl Driver for LogicalDevice {
    fn name(&self) -> &str {
        self.physical_device.name()
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.physical_device.memory_properties
    }

    fn queue_family_properties(&self) -> &[vk::QueueFamilyProperties] {
        &self.physical_device.queue_family_properties
    }

    fn enabled_extensions(&self) -> &[CString] {
        &self.extensions
    }

    fn as_vulkan(&self) -> Option<&LogicalDevice> {
        Some(self)
    }

    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::Buffer> {
        self.device.create_buffer(info, allocator)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        self.device.destroy_buffer(buffer, allocator)
    }

    unsafe fn create_image(&self, info: &vk::ImageCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::Image> {
        self.device.create_image(info, allocator)
    }

    unsafe fn destroy_image(&self, image: vk::Image, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        self.device.destroy_image(image, allocator)
    }

    unsafe fn create_acceleration_structure(
        &self,
        info: &vk::AccelerationStructureCreateInfoKHR<'_>,
        allocator: Option<&vk::AllocationCallbacks<'_>>
    ) -> VkResult<vk::AccelerationStructureKHR> {
        match &self.acceleration_structure {
            Some(loader) => loader.create_acceleration_structure(info, allocator),
            None => Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
        }
    }

    unsafe fn destroy_acceleration_structure(&self, acceleration_structure: vk::AccelerationStructureKHR, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        if let Some(loader) = &self.acceleration_structure {
            loader.destroy_acceleration_structure(acceleration_structure, allocator);
        }
    }

    unsafe fn memory_requirements(&self, target: BindTarget, dedicated: bool) -> MemoryRequirements {
        if !dedicated {
            let requirements = match target {
                BindTarget::Buffer(buffer) => self.device.get_buffer_memory_requirements(buffer),
                BindTarget::Image(image) => self.device.get_image_memory_requirements(image),
            };
            return MemoryRequirements::from(requirements);
        }

        let mut dedicated_requirements = vk::MemoryDedicatedRequirements::default();
        let mut requirements2 = vk::MemoryRequirements2::default()
            .push_next(&mut dedicated_requirements);
        match target {
            BindTarget::Buffer(buffer) => self.device.get_buffer_memory_requirements2(
                &vk::BufferMemoryRequirementsInfo2::default().buffer(buffer),
                &mut requirements2
            ),
            BindTarget::Image(image) => self.device.get_image_memory_requirements2(
                &vk::ImageMemoryRequirementsInfo2::default().image(image),
                &mut requirements2
            ),
        }
        let requirements = requirements2.memory_requirements;

        MemoryRequirements {
            prefers_dedicated: dedicated_requirements.prefers_dedicated_allocation != vk::FALSE,
            requires_dedicated: dedicated_requirements.requires_dedicated_allocation != vk::FALSE,
            ..MemoryRequirements::from(requirements)
        }
    }

    unsafe fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        self.device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
    }

    unsafe fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        chain: &StructureChain,
        allocator: Option<&vk::AllocationCallbacks<'_>>
    ) -> VkResult<vk::DeviceMemory> {
        let mut nodes = chain.native_nodes();
        let allocate_info = thread_allocate_info(
            vk::MemoryAllocateInfo::default()
                .allocation_size(size)
                .memory_type_index(memory_type_index),
            &mut nodes
        );

        self.device.allocate_memory(&allocate_info, allocator)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        self.device.free_memory(memory, allocator)
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<*mut c_void> {
        self.device.map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.device.unmap_memory(memory)
    }

    unsafe fn flush_mapped_memory_range(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()> {
        self.device.flush_mapped_memory_ranges(&[
            vk::MappedMemoryRange::default()
                .memory(memory)
                .offset(offset)
                .size(size)
        ])
    }

    unsafe fn invalidate_mapped_memory_range(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()> {
        self.device.invalidate_mapped_memory_ranges(&[
            vk::MappedMemoryRange::default()
                .memory(memory)
                .offset(offset)
                .size(size)
        ])
    }

    unsafe fn bind_memory(&self, target: BindTarget, memory: vk::DeviceMemory, offset: vk::DeviceSize, device_indices: &[u32]) -> VkResult<()> {
        match target {
            BindTarget::Buffer(buffer) => {
                let mut device_group = vk::BindBufferMemoryDeviceGroupInfo::default()
                    .device_indices(device_indices);
                let mut bind_info = vk::BindBufferMemoryInfo::default()
                    .buffer(buffer)
                    .memory(memory)
                    .memory_offset(offset);
                if !device_indices.is_empty() {
                    bind_info = bind_info.push_next(&mut device_group);
                }
                self.device.bind_buffer_memory2(&[bind_info])
            },
            BindTarget::Image(image) => {
                let mut device_group = vk::BindImageMemoryDeviceGroupInfo::default()
                    .device_indices(device_indices);
                let mut bind_info = vk::BindImageMemoryInfo::default()
                    .image(image)
                    .memory(memory)
                    .memory_offset(offset);
                if !device_indices.is_empty() {
                    bind_info = bind_info.push_next(&mut device_group);
                }
                self.device.bind_image_memory2(&[bind_info])
            }
        }
    }

    unsafe fn create_command_pool(&self, info: &vk::CommandPoolCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::CommandPool> {
        self.device.create_command_pool(info, allocator)
    }

    unsafe fn destroy_command_pool(&self, command_pool: vk::CommandPool, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        self.device.destroy_command_pool(command_pool, allocator)
    }

    unsafe fn allocate_command_buffer(&self, command_pool: vk::CommandPool, level: vk::CommandBufferLevel) -> VkResult<vk::CommandBuffer> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(level)
            .command_buffer_count(1);

        self.device.allocate_command_buffers(&allocate_info)?
            .first()
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    unsafe fn free_command_buffer(&self, command_pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        self.device.free_command_buffers(command_pool, &[command_buffer])
    }

    unsafe fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer, flags: vk::CommandBufferResetFlags) -> VkResult<()> {
        self.device.reset_command_buffer(command_buffer, flags)
    }

    unsafe fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, info: &vk::CommandBufferBeginInfo<'_>) -> VkResult<()> {
        self.device.begin_command_buffer(command_buffer, info)
    }

    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.device.end_command_buffer(command_buffer)
    }

    unsafe fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.device.cmd_copy_buffer(command_buffer, src, dst, regions)
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy]
    ) {
        self.device.cmd_copy_buffer_to_image(command_buffer, src, dst, layout, regions)
    }

    unsafe fn cmd_image_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>
    ) {
        self.device.cmd_pipeline_barrier(
            command_buffer,
            src_stage_mask,
            dst_stage_mask,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            std::slice::from_ref(barrier)
        )
    }

    unsafe fn get_device_queue(&self, family_index: u32, index: u32) -> vk::Queue {
        self.device.get_device_queue(family_index, index)
    }

    unsafe fn queue_submit(&self, queue: vk::Queue, submits: &[vk::SubmitInfo<'_>], fence: vk::Fence) -> VkResult<()> {
        self.device.queue_submit(queue, submits, fence)
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        self.device.queue_wait_idle(queue)
    }

    unsafe fn device_wait_idle(&self) -> VkResult<()> {
        self.device.device_wait_idle()
    }

    unsafe fn create_fence(&self, info: &vk::FenceCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::Fence> {
        self.device.create_fence(info, allocator)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        self.device.destroy_fence(fence, allocator)
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        self.device.reset_fences(&[fence])
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        self.device.wait_for_fences(&[fence], true, timeout)
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        self.device.get_fence_status(fence)
    }

    unsafe fn create_semaphore(&self, info: &vk::SemaphoreCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::Semaphore> {
        self.device.create_semaphore(info, allocator)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore, allocator: Option<&vk::AllocationCallbacks<'_>>) {
        self.device.destroy_semaphore(semaphore, allocator)
    }
}
