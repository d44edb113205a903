use bindery_gpu::{
    driver::emulated::{Call, CallLog, EmulatedDevice},
    prelude::*
};

use std::{sync::Arc, time::Duration};


fn device(driver: EmulatedDevice) -> (Arc<Device>, CallLog) {
    let log = driver.call_log();
    (Device::new(driver), log)
}

fn command_buffer(device: &Arc<Device>) -> CommandBuffer {
    let pool = CommandPool::resettable(device, 0).unwrap();
    pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap()
}


#[test]
fn staged_upload_reads_back() {
    let (device, _) = device(EmulatedDevice::new());
    let allocator = Allocator::default();
    let mut command_buffer = command_buffer(&device);

    let data: Vec<u8> = (0..=255).collect();
    let storage = Buffer::storage(&device, 256, &allocator, Some(InitialData {
        command_buffer: &mut command_buffer,
        data: &data,
        copy_fn: None,
    })).unwrap();
    assert_eq!(command_buffer.state(), CommandBufferState::Invalid);

    let mut readback = Buffer::dst_transfer(&device, 256, &allocator).unwrap();
    command_buffer.reset().unwrap();
    command_buffer.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
    readback.copy_transfer(&mut command_buffer, &storage, CopyRegion::default()).unwrap();
    command_buffer.end().unwrap();
    bindery_gpu::transfer::finish(&mut command_buffer).unwrap();

    let mut result = vec![0; 256];
    readback.read_host(&mut result, CopyRegion::default()).unwrap();
    assert_eq!(result, data);
}

#[test]
fn staging_buffer_outlives_the_fence_wait() {
    let (device, log) = device(EmulatedDevice::new());
    let mut command_buffer = command_buffer(&device);
    let mut buffer = Buffer::new(&device, BufferInfo {
        size: 128,
        usage: vk::BufferUsageFlags::TRANSFER_DST,
        ..Default::default()
    }).unwrap();

    log.clear();
    buffer.copy_staged(&mut command_buffer, &[7; 64], &Allocator::default(), None).unwrap();

    let calls = log.calls();
    let staging = calls.iter().find_map(|call| match call {
        Call::CreateBuffer { buffer, .. } => Some(*buffer),
        _ => None
    }).unwrap();
    let staging_memory = calls.iter().find_map(|call| match call {
        Call::AllocateMemory { memory, .. } => Some(*memory),
        _ => None
    }).unwrap();

    let submit = log.position(|call| matches!(call, Call::QueueSubmit { .. })).unwrap();
    let wait = log.position(|call| matches!(call, Call::WaitForFence(_))).unwrap();
    let destroy = log.position(|call| *call == Call::DestroyBuffer(staging)).unwrap();
    let free = log.position(|call| *call == Call::FreeMemory(staging_memory)).unwrap();
    assert!(submit < wait && wait < destroy && destroy < free);

    assert_eq!(
        log.count(|call| matches!(call, Call::CopyBuffer { dst, regions, .. } if *dst == buffer.handle() && regions == &[(0, 0, 64)])),
        1
    );
}

#[test]
fn staged_copies_need_an_idle_resettable_command_buffer() {
    let (device, _) = device(EmulatedDevice::new());
    let allocator = Allocator::default();
    let mut buffer = Buffer::new(&device, BufferInfo { size: 64, ..Default::default() }).unwrap();

    let pool = CommandPool::new(&device, 0, vk::CommandPoolCreateFlags::empty(), None).unwrap();
    let mut fixed = pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
    let result = buffer.copy_staged(&mut fixed, &[1; 64], &allocator, None);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));

    let mut recording = command_buffer(&device);
    recording.begin(vk::CommandBufferUsageFlags::empty()).unwrap();
    let result = buffer.copy_staged(&mut recording, &[1; 64], &allocator, None);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
    assert_eq!(recording.state(), CommandBufferState::Recording);
}

#[test]
fn staged_copies_need_bound_memory() {
    let (device, log) = device(EmulatedDevice::new());
    let mut command_buffer = command_buffer(&device);
    let mut buffer = Buffer::unbound(&device, BufferInfo { size: 64, ..Default::default() }).unwrap();

    log.clear();
    let result = buffer.copy_staged(&mut command_buffer, &[1; 64], &Allocator::default(), None);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
    assert!(log.calls().is_empty());
    assert_eq!(command_buffer.state(), CommandBufferState::Initial);
}

#[test]
fn empty_uploads_record_nothing() {
    let (device, log) = device(EmulatedDevice::new());
    let mut command_buffer = command_buffer(&device);
    let mut buffer = Buffer::new(&device, BufferInfo { size: 64, ..Default::default() }).unwrap();

    log.clear();
    buffer.copy_staged(&mut command_buffer, &[], &Allocator::default(), None).unwrap();
    assert!(log.calls().is_empty());
    assert_eq!(command_buffer.state(), CommandBufferState::Initial);
}

#[test]
fn host_copies_are_clamped() {
    let (device, _) = device(EmulatedDevice::new());
    let mut buffer = Buffer::dynamic_storage(&device, 64, false, None, &Allocator::default(), None).unwrap();

    let source: Vec<u8> = (0..100).collect();
    buffer.copy_host(&source, CopyRegion::default(), None).unwrap();
    let mut result = vec![0; 64];
    buffer.read_host(&mut result, CopyRegion::default()).unwrap();
    assert_eq!(result, source[..64]);

    buffer.copy_host(&[0xFF; 8], CopyRegion::new(0, 60, 8), None).unwrap();
    buffer.read_host(&mut result, CopyRegion::default()).unwrap();
    assert_eq!(result[..60], source[..60]);
    assert_eq!(result[60..], [0xFF; 4]);

    let result = buffer.copy_host(&source, CopyRegion { dst_offset: 4, ..Default::default() }, None);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
}

#[test]
fn device_local_memory_is_not_written_by_the_host() {
    let (device, _) = device(EmulatedDevice::new());
    let mut buffer = Buffer::new(&device, BufferInfo { size: 64, ..Default::default() }).unwrap();

    let result = buffer.copy_host(&[1; 64], CopyRegion::default(), None);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
}

#[test]
fn buffers_with_data_pick_the_upload_path() {
    let (device, log) = device(EmulatedDevice::new());
    let mut command_buffer = command_buffer(&device);
    let data = [3u8; 32];

    let mut host = Buffer::with_data(&mut command_buffer, BufferInfo {
        size: 32,
        memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ..Default::default()
    }, &data, None).unwrap();
    assert_eq!(log.count(|call| matches!(call, Call::QueueSubmit { .. })), 0);
    let mut result = [0; 32];
    host.read_host(&mut result, CopyRegion::default()).unwrap();
    assert_eq!(result, data);

    let local = Buffer::with_data(&mut command_buffer, BufferInfo { size: 32, ..Default::default() }, &data, None).unwrap();
    assert!(local.usage().contains(vk::BufferUsageFlags::TRANSFER_DST));
    assert_eq!(log.count(|call| matches!(call, Call::QueueSubmit { .. })), 1);
}

#[test]
fn image_upload_transitions_layouts() {
    let (device, log) = device(EmulatedDevice::new());
    let mut command_buffer = command_buffer(&device);

    let image = Image::with_data(&mut command_buffer, ImageInfo {
        extent: [16, 16, 0],
        ..Default::default()
    }, &[0x80; 16 * 16 * 4], None).unwrap();
    assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert!(image.usage().contains(vk::ImageUsageFlags::TRANSFER_DST));

    let handle = image.handle();
    let to_transfer = log.position(|call| *call == Call::ImageBarrier {
        image: handle,
        old_layout: vk::ImageLayout::UNDEFINED,
        new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL
    }).unwrap();
    let copy = log.position(|call| matches!(call, Call::CopyBufferToImage { dst, .. } if *dst == handle)).unwrap();
    let to_shader = log.position(|call| *call == Call::ImageBarrier {
        image: handle,
        old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    }).unwrap();
    assert!(to_transfer < copy && copy < to_shader);
}

#[test]
fn image_uploads_cover_the_whole_level() {
    let (device, log) = device(EmulatedDevice::new());
    let mut command_buffer = command_buffer(&device);
    let info = ImageInfo { extent: [16, 16, 0], ..Default::default() };

    let result = Image::with_data(&mut command_buffer, info.clone(), &[0x80; 100], None);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
    assert_eq!(log.count(|call| matches!(call, Call::CopyBufferToImage { .. })), 0);
    assert_eq!(log.count(|call| matches!(call, Call::QueueSubmit { .. })), 0);

    log.clear();
    let image = Image::with_data(&mut command_buffer, info, &[0x80; 1100], None).unwrap();
    assert_eq!(image.level_size(), Some(1024));
    assert_eq!(log.count(|call| matches!(call, Call::CreateBuffer { size: 1024, .. })), 1);
    assert_eq!(log.count(|call| matches!(call, Call::CopyBufferToImage { .. })), 1);
}

#[test]
fn submission_checks_the_queue_family() {
    let families = vec![
        vk::QueueFamilyProperties::default()
            .queue_flags(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER)
            .queue_count(1),
        vk::QueueFamilyProperties::default()
            .queue_flags(vk::QueueFlags::TRANSFER)
            .queue_count(2),
    ];
    let (device, _) = device(EmulatedDevice::new().with_queue_families(families));

    let pool = CommandPool::resettable(&device, 1).unwrap();
    let mut command_buffer = pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
    command_buffer.begin(vk::CommandBufferUsageFlags::empty()).unwrap();
    command_buffer.end().unwrap();

    let mut queue = device.queue(vk::QueueFlags::GRAPHICS, 0).unwrap();
    let result = queue.submit(&mut command_buffer, vk::PipelineStageFlags::TOP_OF_PIPE, None, None, None);
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
    assert_eq!(command_buffer.state(), CommandBufferState::Executable);

    let mut queue = device.queue_by_family(1, 1).unwrap();
    queue.submit(&mut command_buffer, vk::PipelineStageFlags::TOP_OF_PIPE, None, None, None).unwrap();
    assert_eq!(command_buffer.state(), CommandBufferState::Pending);
    assert!(device.queue_by_family(1, 2).is_err());
}

#[test]
fn fences_report_timeouts() {
    let (device, _) = device(EmulatedDevice::new());

    let fence = Fence::new(&device, false, None).unwrap();
    assert!(!fence.is_signaled().unwrap());
    assert!(!fence.wait_timeout(Duration::from_millis(1)).unwrap());

    let fence = Fence::new(&device, true, None).unwrap();
    assert!(fence.wait_timeout(Duration::from_millis(1)).unwrap());
    fence.reset().unwrap();
    assert!(!fence.is_signaled().unwrap());
}

#[test]
fn host_allocations_are_paired() {
    let (device, log) = device(EmulatedDevice::new());
    let host_allocator = DebugAllocator::new();
    let allocator = Allocator::with_host(host_allocator.clone());

    let pool = CommandPool::new(
        &device,
        0,
        vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        allocator.host_allocator().cloned()
    ).unwrap();
    let mut command_buffer = pool.allocate(vk::CommandBufferLevel::PRIMARY).unwrap();
    let storage = Buffer::storage(&device, 64, &allocator, Some(InitialData {
        command_buffer: &mut command_buffer,
        data: &[9; 64],
        copy_fn: None,
    })).unwrap();
    let semaphore = Semaphore::new(&device, allocator.host_allocator().cloned()).unwrap();
    assert!(host_allocator.statistics().live_allocations > 0);

    drop((storage, semaphore, command_buffer, pool));
    assert_eq!(host_allocator.statistics().live_allocations, 0);
    assert_eq!(log.count(|call| matches!(call, Call::AllocatorMismatch(_))), 0);
    assert!(!device.resource_pool().has_unreleased_resources());
}
