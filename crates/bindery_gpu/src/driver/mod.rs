//! The seam between the resource layer and the native API.
//!
//! [`vulkan::LogicalDevice`] forwards to a real Vulkan device through `ash`,
//! [`emulated::EmulatedDevice`] runs the same protocol in host memory.

pub mod emulated;
pub mod vulkan;

use crate::{chain::StructureChain, memory::MemoryRequirements};

use ash::{prelude::VkResult, vk};

use std::ffi::{c_void, CString};


/// Object that receives a memory binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindTarget {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// Native entry points consumed by the resource layer.
///
/// Every `unsafe` method mirrors the Vulkan command of the same name and inherits its valid
/// usage rules; callers uphold them.
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties;
    fn queue_family_properties(&self) -> &[vk::QueueFamilyProperties];
    fn enabled_extensions(&self) -> &[CString];
    fn as_vulkan(&self) -> Option<&vulkan::LogicalDevice> { None }

    // Resources
    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::Buffer>;
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer, allocator: Option<&vk::AllocationCallbacks<'_>>);
    unsafe fn create_image(&self, info: &vk::ImageCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::Image>;
    unsafe fn destroy_image(&self, image: vk::Image, allocator: Option<&vk::AllocationCallbacks<'_>>);
    unsafe fn create_acceleration_structure(
        &self,
        info: &vk::AccelerationStructureCreateInfoKHR<'_>,
        allocator: Option<&vk::AllocationCallbacks<'_>>
    ) -> VkResult<vk::AccelerationStructureKHR>;
    unsafe fn destroy_acceleration_structure(&self, acceleration_structure: vk::AccelerationStructureKHR, allocator: Option<&vk::AllocationCallbacks<'_>>);
    /// Queries through `vkGet*MemoryRequirements2` with a dedicated-requirements query when `dedicated` is set.
    unsafe fn memory_requirements(&self, target: BindTarget, dedicated: bool) -> MemoryRequirements;
    unsafe fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress;

    // Memory
    unsafe fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        chain: &StructureChain,
        allocator: Option<&vk::AllocationCallbacks<'_>>
    ) -> VkResult<vk::DeviceMemory>;
    unsafe fn free_memory(&self, memory: vk::DeviceMemory, allocator: Option<&vk::AllocationCallbacks<'_>>);
    unsafe fn map_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<*mut c_void>;
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);
    unsafe fn flush_mapped_memory_range(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()>;
    unsafe fn invalidate_mapped_memory_range(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()>;
    /// Binds through `vkBind*Memory2` with a device-group structure when `device_indices` is not empty.
    unsafe fn bind_memory(&self, target: BindTarget, memory: vk::DeviceMemory, offset: vk::DeviceSize, device_indices: &[u32]) -> VkResult<()>;

    // Commands
    unsafe fn create_command_pool(&self, info: &vk::CommandPoolCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::CommandPool>;
    unsafe fn destroy_command_pool(&self, command_pool: vk::CommandPool, allocator: Option<&vk::AllocationCallbacks<'_>>);
    unsafe fn allocate_command_buffer(&self, command_pool: vk::CommandPool, level: vk::CommandBufferLevel) -> VkResult<vk::CommandBuffer>;
    unsafe fn free_command_buffer(&self, command_pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    unsafe fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer, flags: vk::CommandBufferResetFlags) -> VkResult<()>;
    unsafe fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, info: &vk::CommandBufferBeginInfo<'_>) -> VkResult<()>;
    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    unsafe fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);
    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy]
    );
    unsafe fn cmd_image_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>
    );

    // Queues
    unsafe fn get_device_queue(&self, family_index: u32, index: u32) -> vk::Queue;
    unsafe fn queue_submit(&self, queue: vk::Queue, submits: &[vk::SubmitInfo<'_>], fence: vk::Fence) -> VkResult<()>;
    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
    unsafe fn device_wait_idle(&self) -> VkResult<()>;

    // Synchronization
    unsafe fn create_fence(&self, info: &vk::FenceCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::Fence>;
    unsafe fn destroy_fence(&self, fence: vk::Fence, allocator: Option<&vk::AllocationCallbacks<'_>>);
    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()>;
    unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    unsafe fn create_semaphore(&self, info: &vk::SemaphoreCreateInfo<'_>, allocator: Option<&vk::AllocationCallbacks<'_>>) -> VkResult<vk::Semaphore>;
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore, allocator: Option<&vk::AllocationCallbacks<'_>>);
}
