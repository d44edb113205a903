use bindery_gpu::{
    chain::StructureChain,
    driver::{emulated::{Call, CallLog, EmulatedDevice}, BindTarget},
    prelude::*,
    resource::ResourceClass
};

use std::{
    ffi::c_void,
    sync::{atomic::{AtomicUsize, Ordering}, Arc}
};


fn device(driver: EmulatedDevice) -> (Arc<Device>, CallLog) {
    let log = driver.call_log();
    (Device::new(driver), log)
}

fn dedicated_device() -> (Arc<Device>, CallLog) {
    device(EmulatedDevice::new()
        .with_extensions([ash::khr::get_memory_requirements2::NAME, ash::khr::dedicated_allocation::NAME])
        .with_dedicated_preference(true, false))
}

fn local_memory(device: &Arc<Device>, size: vk::DeviceSize) -> Box<dyn Memory> {
    Box::new(DeviceMemory::allocate(device, size, vk::MemoryPropertyFlags::DEVICE_LOCAL, &StructureChain::new(), None).unwrap())
}

/// Host allocator whose `fail_at`-th allocation returns null.
struct FailingAllocator {
    inner: Arc<DebugAllocator>,
    allocations: AtomicUsize,
    fail_at: usize,
}

impl HostAllocator for FailingAllocator {
    fn alloc(&self, size: usize, alignment: usize, scope: vk::SystemAllocationScope) -> *mut c_void {
        if self.allocations.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
            return std::ptr::null_mut();
        }
        self.inner.alloc(size, alignment, scope)
    }

    fn realloc(&self, original: *mut c_void, size: usize, alignment: usize, scope: vk::SystemAllocationScope) -> *mut c_void {
        self.inner.realloc(original, size, alignment, scope)
    }

    fn free(&self, memory: *mut c_void) {
        self.inner.free(memory)
    }

    fn callbacks(&self) -> vk::AllocationCallbacks<'_> {
        bindery_gpu::allocator::host_callbacks(self)
    }
}


#[test]
fn memory_binds_once_per_handle() {
    let (device, log) = device(EmulatedDevice::new());

    let mut buffer = Buffer::new(&device, BufferInfo { size: 256, ..Default::default() }).unwrap();
    assert!(buffer.is_bound());
    assert_eq!(buffer.class(), ResourceClass::Buffer);

    let result = buffer.bind_memory(local_memory(&device, 256), 0);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
    assert_eq!(log.count(|call| matches!(call, Call::BindMemory { .. })), 1);
}

#[test]
fn binding_checks_size_and_alignment() {
    let (device, _) = device(EmulatedDevice::new());

    let mut buffer = Buffer::unbound(&device, BufferInfo { size: 256, ..Default::default() }).unwrap();
    assert!(!buffer.is_bound());
    assert!(buffer.memory().is_none());

    let result = buffer.bind_memory(local_memory(&device, 128), 0);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
    let result = buffer.bind_memory(local_memory(&device, 512), 8);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
    assert!(!buffer.is_bound());

    buffer.bind_memory(local_memory(&device, 512), 256).unwrap();
    assert!(buffer.is_bound());
    assert_eq!(buffer.offset(), 256);
}

#[test]
fn device_group_binding_needs_the_extension() {
    let (device, _) = device(EmulatedDevice::new());
    let mut buffer = Buffer::unbound(&device, BufferInfo { size: 64, ..Default::default() }).unwrap();
    let result = buffer.bind_memory_device_group(local_memory(&device, 64), &[0, 1], 0);
    assert!(matches!(result, Err(Error::UnsupportedExtension { .. })));

    let (device, log) = self::device(EmulatedDevice::new().with_extensions([ash::khr::device_group::NAME]));
    let mut buffer = Buffer::unbound(&device, BufferInfo { size: 64, ..Default::default() }).unwrap();
    buffer.bind_memory_device_group(local_memory(&device, 64), &[0, 1], 0).unwrap();
    assert_eq!(
        log.count(|call| matches!(call, Call::BindMemory { device_indices, .. } if device_indices == &[0, 1])),
        1
    );
}

#[test]
fn realloc_to_the_same_size_does_nothing() {
    let (device, log) = device(EmulatedDevice::new());
    let mut buffer = Buffer::new(&device, BufferInfo { size: 256, ..Default::default() }).unwrap();
    let handle = buffer.handle();

    log.clear();
    buffer.realloc(256).unwrap();
    assert!(log.calls().is_empty());
    assert_eq!(buffer.handle(), handle);
}

#[test]
fn realloc_replaces_handle_and_memory() {
    let (device, log) = device(EmulatedDevice::new());
    let mut buffer = Buffer::new(&device, BufferInfo { size: 256, ..Default::default() }).unwrap();
    let (handle, memory) = (buffer.handle(), buffer.memory().unwrap().native());

    log.clear();
    buffer.realloc(512).unwrap();

    assert_ne!(buffer.handle(), handle);
    assert_eq!(buffer.size(), 512);
    assert!(buffer.is_bound());
    assert_eq!(buffer.memory().unwrap().size(), 512);

    let calls = log.calls();
    let destroy = calls.iter().position(|call| *call == Call::DestroyBuffer(handle)).unwrap();
    let create = calls.iter().position(|call| matches!(call, Call::CreateBuffer { size: 512, .. })).unwrap();
    let free = calls.iter().position(|call| *call == Call::FreeMemory(memory)).unwrap();
    let bind = calls.iter().position(|call| matches!(call, Call::BindMemory { .. })).unwrap();
    assert!(destroy < create && create < free && free < bind);
}

#[test]
fn failed_realloc_keeps_the_previous_buffer() {
    let (device, log) = device(EmulatedDevice::new());
    let mut buffer = Buffer::new(&device, BufferInfo { size: 256, ..Default::default() }).unwrap();
    let memory = buffer.memory().unwrap().native();

    log.clear();
    assert!(buffer.realloc(0).is_err());

    assert_eq!(buffer.size(), 256);
    assert!(buffer.is_bound());
    assert_ne!(buffer.handle(), vk::Buffer::null());
    assert_eq!(buffer.memory().unwrap().native(), memory);
    assert_eq!(log.count(|call| matches!(call, Call::AllocateMemory { .. } | Call::FreeMemory(_))), 0);
    assert_eq!(
        log.count(|call| matches!(call, Call::BindMemory { memory: bound, offset: 0, .. } if *bound == memory)),
        1
    );
}

#[test]
fn failed_realloc_allocation_restores_the_previous_size() {
    let (device, _log) = device(EmulatedDevice::new().with_memory_limit(4096));
    let mut buffer = Buffer::new(&device, BufferInfo { size: 256, ..Default::default() }).unwrap();

    assert!(matches!(buffer.realloc(1 << 20), Err(Error::OutOfDeviceMemory)));

    assert_eq!(buffer.size(), 256);
    assert!(!buffer.is_bound());
    assert!(buffer.memory().is_none());
    assert_ne!(buffer.handle(), vk::Buffer::null());
}

#[test]
fn realloc_follows_the_current_dedicated_preference() {
    let (device, log) = dedicated_device();
    let mut buffer = Buffer::new(&device, BufferInfo { size: 256, ..Default::default() }).unwrap();
    assert!(buffer.memory().unwrap().is_dedicated());

    log.clear();
    buffer.realloc(1024).unwrap();

    assert_eq!(log.count(|call| matches!(call, Call::AllocateMemory { dedicated: true, size: 1024, .. })), 1);
    assert!(buffer.memory().unwrap().is_dedicated());
}

#[test]
fn defragmentation_keeps_the_existing_allocation() {
    let (device, log) = dedicated_device();
    let mut buffer = Buffer::new(&device, BufferInfo { size: 256, ..Default::default() }).unwrap();
    let (handle, memory) = (buffer.handle(), buffer.memory().unwrap().native());

    log.clear();
    buffer.on_defragment().unwrap();

    assert_ne!(buffer.handle(), handle);
    assert_eq!(buffer.memory().unwrap().native(), memory);
    assert!(buffer.memory().unwrap().is_dedicated());
    assert_eq!(log.count(|call| matches!(call, Call::AllocateMemory { .. })), 0);
    assert_eq!(log.count(|call| matches!(call, Call::FreeMemory(_))), 0);
    assert_eq!(
        log.count(|call| matches!(call, Call::BindMemory { target: BindTarget::Buffer(buffer), memory: bound, offset: 0, .. }
            if *buffer != handle && *bound == memory)),
        1
    );
}

#[test]
fn defragmenting_unbound_resources_is_rejected() {
    let (device, _) = device(EmulatedDevice::new());
    let mut buffer = Buffer::unbound(&device, BufferInfo { size: 64, ..Default::default() }).unwrap();

    assert!(matches!(buffer.on_defragment(), Err(Error::InvalidUsage(_))));
}

#[test]
fn pool_tracks_live_objects() {
    let (device, _) = device(EmulatedDevice::new());
    let pool = device.resource_pool();
    let allocator = Allocator::default();

    let buffer = Buffer::new(&device, BufferInfo { size: 256, ..Default::default() }).unwrap();
    let dynamic = Buffer::dynamic_storage(&device, 64, false, None, &allocator, None).unwrap();
    let images = [
        ImageInfo { extent: [64, 0, 0], ..Default::default() },
        ImageInfo { extent: [64, 0, 0], array_layers: 4, ..Default::default() },
        ImageInfo { extent: [16, 16, 0], ..Default::default() },
        ImageInfo { extent: [16, 16, 0], array_layers: 6, ..Default::default() },
        ImageInfo { extent: [8, 8, 8], ..Default::default() },
    ]
    .map(|info| Image::new(&device, info).unwrap());

    let resources = pool.count_resources();
    assert_eq!(resources.buffer_count, 2);
    assert_eq!(resources.device_memory_count, 7);
    assert_eq!(resources.image_1d_count, 1);
    assert_eq!(resources.image_1d_array_count, 1);
    assert_eq!(resources.image_2d_count, 1);
    assert_eq!(resources.image_2d_array_count, 1);
    assert_eq!(resources.image_3d_count, 1);

    assert_eq!(pool.host_visible_memory_allocated(), 64);
    assert_eq!(pool.buffer_memory_footprint(), 256 + 64);
    let image_memory: vk::DeviceSize = images.iter().map(|image| image.size()).sum();
    assert_eq!(pool.image_memory_footprint(), image_memory);
    assert_eq!(pool.device_local_memory_allocated(), 256 + image_memory);

    drop((buffer, dynamic, images));
    assert!(!pool.has_unreleased_resources());
}

#[test]
fn image_extent_selects_the_type() {
    let (device, _) = device(EmulatedDevice::new());

    let image = Image::new(&device, ImageInfo { extent: [32, 32, 0], ..Default::default() }).unwrap();
    assert_eq!(image.image_type(), vk::ImageType::TYPE_2D);
    assert_eq!(image.extent().depth, 1);
    assert_eq!(image.class(), ResourceClass::Image);

    let result = Image::new(&device, ImageInfo { extent: [0, 32, 0], ..Default::default() });
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
    let result = Image::new(&device, ImageInfo { extent: [8, 8, 8], array_layers: 2, ..Default::default() });
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
}

#[test]
fn image_defragmentation_rebinds_the_same_memory() {
    let (device, log) = device(EmulatedDevice::new());
    let mut image = Image::new(&device, ImageInfo { extent: [16, 16, 0], ..Default::default() }).unwrap();
    let memory = image.memory().unwrap().native();

    log.clear();
    image.on_defragment().unwrap();

    assert_eq!(image.memory().unwrap().native(), memory);
    assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);
    assert_eq!(log.count(|call| matches!(call, Call::DestroyImage(_))), 1);
    assert_eq!(log.count(|call| matches!(call, Call::CreateImage(_))), 1);
    assert_eq!(log.count(|call| matches!(call, Call::AllocateMemory { .. })), 0);
}

#[test]
fn acceleration_structures_need_the_extension() {
    let (device, _) = device(EmulatedDevice::new());

    let result = AccelerationStructure::new(&device, AccelerationStructureInfo { size: 1024, ..Default::default() });
    assert!(matches!(result, Err(Error::UnsupportedExtension { .. })));
}

#[test]
fn acceleration_structure_lives_in_its_buffer() {
    let driver = EmulatedDevice::new()
        .with_extensions([ash::khr::acceleration_structure::NAME, ash::khr::buffer_device_address::NAME]);
    let (device, log) = device(driver);

    let mut acceleration_structure = AccelerationStructure::new(&device, AccelerationStructureInfo {
        size: 1024,
        ..Default::default()
    }).unwrap();
    assert_ne!(acceleration_structure.handle(), vk::AccelerationStructureKHR::null());
    assert!(acceleration_structure.is_bound());
    assert!(acceleration_structure.buffer().usage().contains(
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
    ));
    assert_eq!(device.resource_pool().acceleration_structure_memory_footprint(), 1024);
    assert_eq!(device.resource_pool().count_resources().acceleration_structure_count, 1);

    let (handle, buffer) = (acceleration_structure.handle(), acceleration_structure.buffer().handle());
    log.clear();
    acceleration_structure.on_defragment().unwrap();

    let destroy_structure = log.position(|call| *call == Call::DestroyAccelerationStructure(handle)).unwrap();
    let destroy_buffer = log.position(|call| *call == Call::DestroyBuffer(buffer)).unwrap();
    let create_structure = log.position(|call| matches!(call, Call::CreateAccelerationStructure(_))).unwrap();
    let bind = log.position(|call| matches!(call, Call::BindMemory { .. })).unwrap();
    assert!(destroy_structure < destroy_buffer && bind < create_structure);
    assert_eq!(log.count(|call| matches!(call, Call::AllocateMemory { .. })), 0);

    drop(acceleration_structure);
    assert!(!device.resource_pool().has_unreleased_resources());
}

#[test]
fn failed_acceleration_structure_binds_can_be_retried() {
    let driver = EmulatedDevice::new()
        .with_extensions([ash::khr::acceleration_structure::NAME, ash::khr::buffer_device_address::NAME]);
    let (device, log) = device(driver);
    // Backing buffer first, then the acceleration structure handle
    let host_allocator = Arc::new(FailingAllocator {
        inner: DebugAllocator::new(),
        allocations: AtomicUsize::new(0),
        fail_at: 2,
    });

    let mut acceleration_structure = AccelerationStructure::unbound(&device, AccelerationStructureInfo {
        size: 1024,
        allocator: Allocator::with_host(host_allocator.clone()),
        ..Default::default()
    }).unwrap();
    let buffer = acceleration_structure.buffer().handle();

    let result = acceleration_structure.bind_memory(local_memory(&device, 1024), 0);
    assert!(matches!(result, Err(Error::OutOfHostMemory)));
    assert!(!acceleration_structure.is_bound());
    assert!(!acceleration_structure.buffer().is_bound());
    assert_ne!(acceleration_structure.buffer().handle(), buffer);
    assert_eq!(log.count(|call| *call == Call::DestroyBuffer(buffer)), 1);

    acceleration_structure.bind_memory(local_memory(&device, 1024), 0).unwrap();
    assert!(acceleration_structure.is_bound());
    assert_ne!(acceleration_structure.handle(), vk::AccelerationStructureKHR::null());
}
