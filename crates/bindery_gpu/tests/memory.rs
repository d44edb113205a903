use bindery_gpu::{
    chain::StructureChain,
    driver::emulated::{Call, CallLog, EmulatedDevice},
    memory::priority,
    prelude::*
};

use std::sync::Arc;


fn device(driver: EmulatedDevice) -> (Arc<Device>, CallLog) {
    let log = driver.call_log();
    (Device::new(driver), log)
}

fn allocations(log: &CallLog) -> Vec<Call> {
    log.calls().into_iter()
        .filter(|call| matches!(call, Call::AllocateMemory { .. }))
        .collect()
}

const ALL_MEMORY_EXTENSIONS: [&std::ffi::CStr; 5] = [
    ash::khr::get_memory_requirements2::NAME,
    ash::khr::dedicated_allocation::NAME,
    ash::khr::device_group::NAME,
    ash::ext::memory_priority::NAME,
    ash::khr::buffer_device_address::NAME,
];


#[test]
fn memory_type_follows_requested_flags() {
    let (device, _) = device(EmulatedDevice::new());

    let local = DeviceMemory::allocate(&device, 64, vk::MemoryPropertyFlags::DEVICE_LOCAL, &StructureChain::new(), None).unwrap();
    assert_eq!(local.memory_type_index(), 0);

    let host = DeviceMemory::allocate(&device, 64, vk::MemoryPropertyFlags::HOST_VISIBLE, &StructureChain::new(), None).unwrap();
    assert_eq!(host.memory_type_index(), 1);
    assert!(host.flags().contains(vk::MemoryPropertyFlags::HOST_COHERENT));

    let lazy = DeviceMemory::allocate(&device, 64, vk::MemoryPropertyFlags::LAZILY_ALLOCATED, &StructureChain::new(), None);
    assert!(matches!(lazy, Err(Error::UnsupportedMemoryType { .. })));
}

#[test]
fn resource_type_bits_restrict_memory_types() {
    let (device, _) = device(EmulatedDevice::new().with_memory_type_bits(0b10));

    let result = Buffer::new(&device, BufferInfo { size: 64, ..Default::default() });
    assert!(matches!(result, Err(Error::UnsupportedMemoryType { .. })));

    let buffer = Buffer::dst_transfer(&device, 64, &Allocator::default()).unwrap();
    assert!(buffer.is_bound());
}

#[test]
fn device_exhaustion_is_reported() {
    let (device, _) = device(EmulatedDevice::new().with_memory_limit(128));

    let _first = Buffer::new(&device, BufferInfo { size: 128, ..Default::default() }).unwrap();
    let second = Buffer::new(&device, BufferInfo { size: 16, ..Default::default() });
    assert!(matches!(second, Err(Error::OutOfDeviceMemory)));
}

#[test]
fn mapping_is_exclusive_and_unmapping_is_guarded() {
    let (device, log) = device(EmulatedDevice::new());
    let mut memory = DeviceMemory::allocate(
        &device,
        64,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        &StructureChain::new(),
        None
    ).unwrap();

    memory.unmap();
    assert_eq!(log.count(|call| matches!(call, Call::UnmapMemory(_))), 0);

    assert!(memory.map(0, vk::WHOLE_SIZE).is_some());
    assert!(memory.is_mapped());
    assert!(memory.map(0, vk::WHOLE_SIZE).is_none());
    assert!(memory.flush(0, vk::WHOLE_SIZE));

    memory.unmap();
    assert!(!memory.is_mapped());
    assert!(!memory.flush(0, vk::WHOLE_SIZE));

    let mut local = DeviceMemory::allocate(&device, 64, vk::MemoryPropertyFlags::DEVICE_LOCAL, &StructureChain::new(), None).unwrap();
    assert!(local.map(0, 16).is_none());
}

#[test]
fn allocation_chain_without_extensions_is_empty() {
    let (device, log) = device(EmulatedDevice::new().with_dedicated_preference(true, true));

    let _buffer = Buffer::new(&device, BufferInfo {
        size: 256,
        initializer: Initializer {
            device_mask: 0b11,
            memory_priority: priority::HIGH,
            device_address: true,
            ..Default::default()
        },
        ..Default::default()
    }).unwrap();

    match allocations(&log).as_slice() {
        [Call::AllocateMemory { chain, dedicated, priority, device_mask, .. }] => {
            assert!(chain.is_empty());
            assert!(!dedicated);
            assert_eq!(*priority, None);
            assert_eq!(*device_mask, None);
        },
        calls => panic!("unexpected allocations: {:?}", calls)
    }
}

#[test]
fn allocation_chain_is_threaded_head_first() {
    let driver = EmulatedDevice::new()
        .with_extensions(ALL_MEMORY_EXTENSIONS)
        .with_dedicated_preference(true, false);
    let (device, log) = device(driver);

    let buffer = Buffer::new(&device, BufferInfo {
        size: 256,
        initializer: Initializer {
            device_mask: 0b11,
            memory_priority: priority::HIGH,
            device_address: true,
            ..Default::default()
        },
        ..Default::default()
    }).unwrap();

    match allocations(&log).as_slice() {
        [Call::AllocateMemory { chain, dedicated, priority, device_mask, .. }] => {
            assert_eq!(chain, &[
                vk::StructureType::MEMORY_PRIORITY_ALLOCATE_INFO_EXT,
                vk::StructureType::MEMORY_ALLOCATE_FLAGS_INFO,
                vk::StructureType::MEMORY_DEDICATED_ALLOCATE_INFO,
            ]);
            assert!(dedicated);
            assert_eq!(*priority, Some(priority::HIGH));
            assert_eq!(*device_mask, Some(0b11));
        },
        calls => panic!("unexpected allocations: {:?}", calls)
    }

    let memory = buffer.memory().unwrap();
    assert!(memory.is_dedicated());
    assert_eq!(memory.priority(), priority::HIGH);
    assert_eq!(memory.device_mask(), 0b11);
    assert!(buffer.usage().contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
    assert_ne!(buffer.device_address(), 0);
}

#[test]
fn dedicated_preference_needs_both_extensions() {
    let driver = EmulatedDevice::new()
        .with_extensions([ash::khr::dedicated_allocation::NAME])
        .with_dedicated_preference(true, true);
    let (device, log) = device(driver);

    let buffer = Buffer::new(&device, BufferInfo { size: 64, ..Default::default() }).unwrap();
    assert!(!buffer.requirements().dedicated());
    assert_eq!(log.count(|call| matches!(call, Call::AllocateMemory { dedicated: true, .. })), 0);
}

#[test]
fn realloc_keeps_flags_and_replaces_the_block() {
    let driver = EmulatedDevice::new().with_extensions([ash::ext::memory_priority::NAME]);
    let (device, log) = device(driver);

    let mut chain = StructureChain::new();
    chain.link_node(bindery_gpu::chain::ExtensionNode::Priority(priority::LOW));
    let mut memory = DeviceMemory::allocate(
        &device,
        64,
        vk::MemoryPropertyFlags::HOST_VISIBLE,
        &chain,
        None
    ).unwrap();
    let previous = memory.native();
    assert!(memory.map(0, vk::WHOLE_SIZE).is_some());

    let requirements = bindery_gpu::memory::MemoryRequirements {
        size: 128,
        alignment: 16,
        memory_type_bits: u32::MAX,
        ..Default::default()
    };
    let target = bindery_gpu::driver::BindTarget::Buffer(vk::Buffer::null());
    memory.realloc(target, &requirements, &chain).unwrap();

    assert_ne!(memory.native(), previous);
    assert_eq!(memory.size(), 128);
    assert_eq!(memory.priority(), priority::LOW);
    assert!(!memory.is_mapped());
    assert!(memory.flags().contains(vk::MemoryPropertyFlags::HOST_VISIBLE));

    let free = log.position(|call| *call == Call::FreeMemory(previous)).unwrap();
    let allocate = log.position(|call| matches!(call, Call::AllocateMemory { size: 128, .. })).unwrap();
    assert!(free < allocate);
}

#[test]
fn realloc_searches_with_the_requested_flags() {
    let driver = EmulatedDevice::new().with_memory_types(&[
        vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    ]);
    let (device, _) = device(driver);

    let mut memory = DeviceMemory::allocate(&device, 64, vk::MemoryPropertyFlags::HOST_VISIBLE, &StructureChain::new(), None).unwrap();
    assert_eq!(memory.memory_type_index(), 0);

    let requirements = bindery_gpu::memory::MemoryRequirements {
        size: 128,
        alignment: 16,
        memory_type_bits: 0b10,
        ..Default::default()
    };
    let target = bindery_gpu::driver::BindTarget::Buffer(vk::Buffer::null());
    memory.realloc(target, &requirements, &StructureChain::new()).unwrap();

    assert_eq!(memory.memory_type_index(), 1);
    assert!(!memory.flags().contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));
}
