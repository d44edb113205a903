use super::{
    allocate_memory, bind_target, memory_flags, memory_requirements,
    Binding, DedicatedPolicy, Initializer, Resource, ResourceClass, Sharing
};
use crate::{
    allocator::Allocator,
    command::{CommandBuffer, CommandBufferState},
    device::Device,
    driver::{BindTarget, Driver},
    error::{Error, Result},
    handle::NonDispatchable,
    memory::{Memory, MemoryRequirements},
    resource::Buffer,
    transfer::{self, CopyMemoryFn}
};

use ash::{prelude::VkResult, vk};
use bevy_log::debug;

use std::sync::Arc;

// Reexport
pub use ash::vk::{
    Format,
    SampleCountFlags
};


#[derive(Clone)]
pub struct ImageInfo {
    pub format: vk::Format,
    /// Image extent with format \[width, height, depth\]. Zero height and depth select a 1D
    /// image, zero depth a 2D image.
    pub extent: [u32; 3],
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
    pub tiling: vk::ImageTiling,
    pub memory_flags: vk::MemoryPropertyFlags,
    pub initializer: Initializer,
    pub sharing: Sharing,
    pub allocator: Allocator,
    pub debug_name: &'static str,
}

impl Default for ImageInfo {
    fn default() -> Self {
        Self {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: [0; 3],
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            usage: vk::ImageUsageFlags::SAMPLED,
            flags: vk::ImageCreateFlags::empty(),
            tiling: vk::ImageTiling::OPTIMAL,
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            initializer: Initializer::default(),
            sharing: Sharing::Exclusive,
            allocator: Allocator::default(),
            debug_name: "Image",
        }
    }
}

fn image_extent(extent: [u32; 3]) -> Result<(vk::ImageType, vk::Extent3D)> {
    match extent {
        [0, _, _] => Err(Error::invalid_usage("image width must be greater than 0")),
        [width, 0, 0] => Ok((vk::ImageType::TYPE_1D, vk::Extent3D { width, height: 1, depth: 1 })),
        [width, height, 0] => Ok((vk::ImageType::TYPE_2D, vk::Extent3D { width, height, depth: 1 })),
        [width, height, depth] => Ok((vk::ImageType::TYPE_3D, vk::Extent3D { width, height, depth })),
    }
}

fn image_usage(info: &ImageInfo) -> vk::ImageUsageFlags {
    let mut usage = info.usage;
    if info.initializer.storage {
        usage |= vk::ImageUsageFlags::STORAGE;
    }
    if info.initializer.src_transfer {
        usage |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    usage
}

/// Aspects covered by a full-image barrier or copy.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM |
        vk::Format::X8_D24_UNORM_PACK32 |
        vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
        vk::Format::D16_UNORM_S8_UINT |
        vk::Format::D24_UNORM_S8_UINT |
        vk::Format::D32_SFLOAT_S8_UINT => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR
    }
}

/// Bytes per texel of uncompressed single-aspect formats.
pub fn texel_size(format: vk::Format) -> Option<vk::DeviceSize> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::R8_SINT |
        vk::Format::R8_SRGB | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SNORM | vk::Format::R8G8_UINT | vk::Format::R8G8_SINT |
        vk::Format::R16_UNORM | vk::Format::R16_SNORM | vk::Format::R16_UINT | vk::Format::R16_SINT |
        vk::Format::R16_SFLOAT | vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SNORM | vk::Format::R8G8B8A8_UINT |
        vk::Format::R8G8B8A8_SINT | vk::Format::R8G8B8A8_SRGB | vk::Format::B8G8R8A8_UNORM |
        vk::Format::B8G8R8A8_SRGB | vk::Format::A2B10G10R10_UNORM_PACK32 | vk::Format::B10G11R11_UFLOAT_PACK32 |
        vk::Format::R16G16_UNORM | vk::Format::R16G16_SFLOAT | vk::Format::R16G16_UINT |
        vk::Format::R32_UINT | vk::Format::R32_SINT | vk::Format::R32_SFLOAT |
        vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => 4,
        vk::Format::R16G16B16A16_UNORM | vk::Format::R16G16B16A16_SFLOAT | vk::Format::R16G16B16A16_UINT |
        vk::Format::R32G32_UINT | vk::Format::R32G32_SINT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32_SFLOAT => 12,
        vk::Format::R32G32B32A32_UINT | vk::Format::R32G32B32A32_SINT | vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None
    };
    Some(size)
}


pub struct Image {
    image: NonDispatchable<vk::Image>,
    binding: Binding,
    info: ImageInfo,
    image_type: vk::ImageType,
    extent: vk::Extent3D,
    usage: vk::ImageUsageFlags,
    layout: vk::ImageLayout,
    requirements: MemoryRequirements,
}

fn create_image(
    driver: &dyn Driver,
    info: &ImageInfo,
    image_type: vk::ImageType,
    extent: vk::Extent3D,
    usage: vk::ImageUsageFlags,
    callbacks: Option<&vk::AllocationCallbacks<'_>>
) -> VkResult<vk::Image> {
    let image_create_info = vk::ImageCreateInfo::default()
        .flags(info.flags)
        .image_type(image_type)
        .format(info.format)
        .extent(extent)
        .mip_levels(info.mip_levels)
        .array_layers(info.array_layers)
        .samples(info.samples)
        .tiling(info.tiling)
        .usage(usage)
        .sharing_mode(info.sharing.mode())
        .queue_family_indices(info.sharing.queue_family_indices())
        .initial_layout(vk::ImageLayout::UNDEFINED);
    unsafe { driver.create_image(&image_create_info, callbacks) }
}

impl Image {
    pub fn new(device: &Arc<Device>, info: ImageInfo) -> Result<Self> {
        let mut image = Self::unbound(device, info)?;
        let memory = allocate_memory(
            device,
            image.info.debug_name,
            image.target(),
            &image.requirements,
            memory_flags(image.info.memory_flags, &image.info.initializer),
            &image.info.initializer,
            &image.info.allocator,
            image.info.tiling == vk::ImageTiling::LINEAR
        )?;
        image.bind_memory(memory, 0)?;

        Ok(image)
    }

    pub fn unbound(device: &Arc<Device>, info: ImageInfo) -> Result<Self> {
        if info.mip_levels == 0 || info.array_layers == 0 {
            return Err(Error::invalid_usage("images need at least one mip level and array layer"));
        }
        let (image_type, extent) = image_extent(info.extent)?;
        if image_type == vk::ImageType::TYPE_3D && info.array_layers > 1 {
            return Err(Error::invalid_usage("3D images cannot have array layers"));
        }

        // Create image
        let usage = image_usage(&info);
        let image = NonDispatchable::create(device, info.allocator.host_allocator().cloned(), |driver, callbacks| {
            create_image(driver, &info, image_type, extent, usage, callbacks)
        })
        .map_err(|result| Error::creation("vkCreateImage", result))?;
        let array_layers = info.array_layers;
        image.footprint().update(|detail| detail.image = Some((image_type, array_layers)));
        let requirements = memory_requirements(device, BindTarget::Image(image.handle()));

        Ok(Self {
            image,
            binding: Binding::default(),
            info,
            image_type,
            extent,
            usage,
            layout: vk::ImageLayout::UNDEFINED,
            requirements,
        })
    }

    /// Creates an image and uploads `data` into mip level 0 of every layer through a staging
    /// buffer. The image ends in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn with_data(
        command_buffer: &mut CommandBuffer,
        mut info: ImageInfo,
        data: &[u8],
        copy_fn: Option<CopyMemoryFn>
    ) -> Result<Self> {
        let device = command_buffer.device().clone();
        let allocator = info.allocator.clone();
        info.usage |= vk::ImageUsageFlags::TRANSFER_DST;

        let mut image = Self::new(&device, info)?;
        image.copy_staged(command_buffer, data, &allocator, copy_fn)?;

        Ok(image)
    }

    pub fn handle(&self) -> vk::Image {
        self.image.handle()
    }

    pub fn device(&self) -> &Arc<Device> {
        self.image.device()
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn image_type(&self) -> vk::ImageType {
        self.image_type
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    /// Layout after the last transition recorded by this image.
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub fn requirements(&self) -> &MemoryRequirements {
        &self.requirements
    }

    fn target(&self) -> BindTarget {
        BindTarget::Image(self.handle())
    }

    fn bind(&mut self, memory: Box<dyn Memory>, offset: vk::DeviceSize, device_indices: &[u32]) -> Result<()> {
        let target = self.target();
        bind_target(&mut self.binding, self.image.footprint(), target, &self.requirements, memory, offset, device_indices)
    }

    /// Tightly packed size of mip level 0 across all layers, when the format has a known
    /// texel size and the size fits in a `DeviceSize`.
    pub fn level_size(&self) -> Option<vk::DeviceSize> {
        [self.extent.height, self.extent.depth, self.info.array_layers]
            .into_iter()
            .try_fold(self.extent.width as vk::DeviceSize, |texels, n| texels.checked_mul(n as vk::DeviceSize))
            .zip(texel_size(self.info.format))
            .and_then(|(texels, size)| texels.checked_mul(size))
    }

    fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(aspect_mask(self.info.format))
            .base_mip_level(0)
            .level_count(self.info.mip_levels)
            .base_array_layer(0)
            .layer_count(self.info.array_layers)
    }

    /// Uploads tightly packed `data` into mip level 0 and waits for the copy to finish.
    ///
    /// `data` must cover the whole level; bytes past it are ignored. Previous contents are
    /// discarded. `command_buffer` is reset and re-recorded, so it must
    /// come from a resettable pool and must not be recording.
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
            return Err(Error::invalid_usage("image has no bound memory"));
        }
        if data.is_empty() {
            return Ok(());
        }
        let level_size = self.level_size()
            .ok_or_else(|| Error::invalid_usage("staged image uploads need a known texel size and a level size that fits in memory"))?;
        if (data.len() as vk::DeviceSize) < level_size {
            return Err(Error::invalid_usage("image data is smaller than mip level 0"));
        }
        let data = &data[..level_size as usize];

        let staging = Buffer::src_transfer(self.device(), level_size, Some(data), allocator, copy_fn)?;
        let range = self.subresource_range();

        command_buffer.reset()?;
        command_buffer.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;

        // Transition image to ImageLayout::TRANSFER_DST_OPTIMAL
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.handle())
            .subresource_range(range);
        command_buffer.image_barrier(vk::PipelineStageFlags::TOP_OF_PIPE, vk::PipelineStageFlags::TRANSFER, &barrier)?;

        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(range.aspect_mask)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(self.info.array_layers)
            )
            .image_offset(vk::Offset3D::default())
            .image_extent(self.extent);
        command_buffer.copy_buffer_to_image(staging.handle(), self.handle(), vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region])?;

        // Transition image to ImageLayout::SHADER_READ_ONLY_OPTIMAL
        let barrier = barrier
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        command_buffer.image_barrier(vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::ALL_COMMANDS, &barrier)?;

        command_buffer.end()?;
        transfer::finish(command_buffer)?;
        self.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        debug!("Staged {} bytes into '{}'", data.len(), self.info.debug_name);

        drop(staging);
        Ok(())
    }
}

impl Resource for Image {
    fn class(&self) -> ResourceClass {
        ResourceClass::Image
    }

    fn size(&self) -> vk::DeviceSize {
        self.requirements.size
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

    /// Rebinds a fresh handle to the existing memory ([`DedicatedPolicy::KeepExisting`]). The
    /// contents and layout of the image are not preserved.
    fn on_defragment(&mut self) -> Result<()> {
        let offset = self.binding.offset();
        let Some(memory) = self.binding.take() else {
            return Err(Error::invalid_usage("cannot defragment an image without memory"));
        };

        let (info, image_type, extent, usage) = (&self.info, self.image_type, self.extent, self.usage);
        let recreated = self.image.recreate(|driver, callbacks| create_image(driver, info, image_type, extent, usage, callbacks));
        if let Err(result) = recreated {
            self.binding.keep(memory, offset);
            return Err(Error::creation("vkCreateImage", result));
        }
        self.layout = vk::ImageLayout::UNDEFINED;
        self.requirements = memory_requirements(self.device(), self.target());

        if self.requirements.dedicated() != memory.is_dedicated() {
            debug!(
                "'{}' keeps its existing allocation although the dedicated preference changed ({:?})",
                self.info.debug_name, DedicatedPolicy::KeepExisting
            );
        }
        self.bind(memory, offset, &[])
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.info.debug_name)
            .field("image", &self.image)
            .field("type", &self.image_type)
            .field("extent", &self.extent)
            .field("format", &self.info.format)
            .field("layout", &self.layout)
            .finish()
    }
}
