//! Command pools, command buffers and queues.

use crate::{
    allocator::HostAllocator,
    device::Device,
    error::{Error, Result},
    handle::{Dispatchable, NonDispatchable},
    sync::{Fence, Semaphore}
};

use ash::vk;

use std::sync::Arc;


pub struct CommandPool {
    pool: NonDispatchable<vk::CommandPool>,
    flags: vk::CommandPoolCreateFlags,
    queue_family_index: u32,
}

impl CommandPool {
    pub fn new(
        device: &Arc<Device>,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
        host_allocator: Option<Arc<dyn HostAllocator>>
    ) -> Result<Arc<Self>> {
        let command_pool_create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(flags);
        let pool = NonDispatchable::create(device, host_allocator, |driver, callbacks| unsafe {
            driver.create_command_pool(&command_pool_create_info, callbacks)
        })
        .map_err(|result| Error::creation("vkCreateCommandPool", result))?;

        Ok(Arc::new(Self { pool, flags, queue_family_index }))
    }

    /// Pool whose command buffers can be reset individually.
    pub fn resettable(device: &Arc<Device>, queue_family_index: u32) -> Result<Arc<Self>> {
        Self::new(device, queue_family_index, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER, None)
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.pool.handle()
    }

    pub fn device(&self) -> &Arc<Device> {
        self.pool.device()
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn allows_reset(&self) -> bool {
        self.flags.contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
    }

    pub fn allocate(self: &Arc<Self>, level: vk::CommandBufferLevel) -> Result<CommandBuffer> {
        let command_buffer = unsafe { self.device().driver().allocate_command_buffer(self.handle(), level) }
            .map_err(|result| Error::creation("vkAllocateCommandBuffers", result))?;
        let fence = Fence::new(self.device(), false, None)
            .inspect_err(|_| unsafe { self.device().driver().free_command_buffer(self.handle(), command_buffer) })?;

        Ok(CommandBuffer {
            command_buffer: Dispatchable::new(command_buffer),
            state: CommandBufferState::Initial,
            one_time_submit: false,
            fence: Arc::new(fence),
            pool: self.clone(),
        })
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
    Invalid,
}

/// Primary or secondary command buffer owned by its pool.
pub struct CommandBuffer {
    command_buffer: Dispatchable<vk::CommandBuffer>,
    state: CommandBufferState,
    one_time_submit: bool,
    fence: Arc<Fence>,
    pool: Arc<CommandPool>,
}

impl CommandBuffer {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer.handle()
    }

    pub fn device(&self) -> &Arc<Device> {
        self.pool.device()
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn allows_reset(&self) -> bool {
        self.pool.allows_reset()
    }

    pub fn queue_family_index(&self) -> u32 {
        self.pool.queue_family_index()
    }

    /// Fence signaled by [`crate::transfer::finish`].
    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    pub fn begin(&mut self, flags: vk::CommandBufferUsageFlags) -> Result<()> {
        match self.state {
            CommandBufferState::Initial => (),
            CommandBufferState::Executable | CommandBufferState::Invalid if self.allows_reset() => (),
            CommandBufferState::Recording => return Err(Error::invalid_usage("command buffer is already recording")),
            CommandBufferState::Pending => return Err(Error::invalid_usage("command buffer is pending execution")),
            _ => return Err(Error::invalid_usage("command buffer must be reset before recording"))
        }

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(flags);
        unsafe { self.device().driver().begin_command_buffer(self.handle(), &begin_info) }
            .map_err(|result| Error::native("vkBeginCommandBuffer", result))?;
        self.state = CommandBufferState::Recording;
        self.one_time_submit = flags.contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        self.require_recording()?;

        unsafe { self.device().driver().end_command_buffer(self.handle()) }
            .map_err(|result| Error::native("vkEndCommandBuffer", result))?;
        self.state = CommandBufferState::Executable;

        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        if !self.allows_reset() {
            return Err(Error::invalid_usage("command pool does not allow resetting command buffers"));
        }
        match self.state {
            CommandBufferState::Recording => return Err(Error::invalid_usage("cannot reset a recording command buffer")),
            CommandBufferState::Pending => return Err(Error::invalid_usage("cannot reset a pending command buffer")),
            _ => ()
        }

        unsafe { self.device().driver().reset_command_buffer(self.handle(), vk::CommandBufferResetFlags::empty()) }
            .map_err(|result| Error::native("vkResetCommandBuffer", result))?;
        self.state = CommandBufferState::Initial;

        Ok(())
    }

    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) -> Result<()> {
        self.require_recording()?;
        unsafe { self.device().driver().cmd_copy_buffer(self.handle(), src, dst, regions) };
        Ok(())
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy]
    ) -> Result<()> {
        self.require_recording()?;
        unsafe { self.device().driver().cmd_copy_buffer_to_image(self.handle(), src, dst, layout, regions) };
        Ok(())
    }

    pub fn image_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>
    ) -> Result<()> {
        self.require_recording()?;
        unsafe { self.device().driver().cmd_image_barrier(self.handle(), src_stage_mask, dst_stage_mask, barrier) };
        Ok(())
    }

    /// Moves a pending command buffer on once `fence` has signaled. Returns whether it has.
    pub fn finished_execution(&mut self) -> Result<bool> {
        if self.state != CommandBufferState::Pending {
            return Ok(true);
        }
        if !self.fence.is_signaled()? {
            return Ok(false);
        }
        self.state = match self.one_time_submit {
            true => CommandBufferState::Invalid,
            false => CommandBufferState::Executable
        };

        Ok(true)
    }

    pub(crate) fn submitted(&mut self) {
        self.state = CommandBufferState::Pending;
    }

    fn require_recording(&self) -> Result<()> {
        match self.state {
            CommandBufferState::Recording => Ok(()),
            _ => Err(Error::invalid_usage("command buffer is not recording"))
        }
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        //  Safety: vkFreeCommandBuffers
        //  Host Synchronization
        //   -  Host access to commandPool must be externally synchronized
        //   -  Host access to each member of pCommandBuffers must be externally synchronized
        //
        //  Pending command buffers must not be freed; callers wait on the fence first
        unsafe { self.device().driver().free_command_buffer(self.pool.handle(), self.handle()) };
    }
}


/// One device queue. Submission takes `&mut self`, as the API requires per-queue serialization.
pub struct Queue {
    queue: vk::Queue,
    family_index: u32,
    index: u32,
    device: Arc<Device>,
}

impl Queue {
    pub(crate) fn new(device: &Arc<Device>, family_index: u32, index: u32) -> Self {
        let queue = unsafe { device.driver().get_device_queue(family_index, index) };

        Self {
            queue,
            family_index,
            index,
            device: device.clone(),
        }
    }

    pub fn handle(&self) -> vk::Queue {
        self.queue
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn submit(
        &mut self,
        command_buffer: &mut CommandBuffer,
        wait_stage_mask: vk::PipelineStageFlags,
        wait_semaphore: Option<&Semaphore>,
        signal_semaphore: Option<&Semaphore>,
        fence: Option<&Fence>
    ) -> Result<()> {
        if command_buffer.state() != CommandBufferState::Executable {
            return Err(Error::invalid_usage("only executable command buffers can be submitted"));
        }
        if command_buffer.queue_family_index() != self.family_index {
            return Err(Error::invalid_usage("command buffer was allocated for another queue family"));
        }

        let command_buffers = [command_buffer.handle()];
        let wait_semaphores: Vec<_> = wait_semaphore.iter().map(|semaphore| semaphore.handle()).collect();
        let wait_stage_masks: Vec<_> = wait_semaphore.iter().map(|_| wait_stage_mask).collect();
        let signal_semaphores: Vec<_> = signal_semaphore.iter().map(|semaphore| semaphore.handle()).collect();
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stage_masks)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        let fence = fence.map_or(vk::Fence::null(), Fence::handle);

        unsafe { self.device.driver().queue_submit(self.queue, &[submit_info], fence) }
            .map_err(|result| Error::native("vkQueueSubmit", result))?;
        command_buffer.submitted();

        Ok(())
    }

    pub fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.device.driver().queue_wait_idle(self.queue) }
            .map_err(|result| Error::native("vkQueueWaitIdle", result))
    }
}
