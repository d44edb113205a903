use bindery::gpu::{prelude::*, transfer::copy_memory};

use anyhow::Context as _;
use bevy::{log::LogPlugin, prelude::*};

use std::sync::Arc;


const APPNAME: &str = "Bindery Basic Usage";
const APPVER: (u32, u32, u32, u32) = (0, 0, 1, 0);

fn main() {
    App::new()
        .add_plugins(LogPlugin::default())
        .add_systems(Startup, startup)
        .run();
}

fn startup() {
    if let Err(error) = run() {
        error!("Basic usage failed: {:?}", error);
    }
}

fn run() -> anyhow::Result<()> {
    // Use the primary Vulkan device when there is one, the emulated device otherwise
    let context = Context::new(ContextInfo {
        application_name: APPNAME.into(),
        application_version: APPVER,
        ..Default::default()
    });
    let device = match &context {
        Ok(context) => context.primary_device().clone(),
        Err(error) => {
            warn!("No Vulkan device available ({}), using the emulated device", error);
            Device::new(EmulatedDevice::new())
        }
    };
    info!("Running on {}", device.name());

    // Track host allocations made by the driver
    let host_allocator = DebugAllocator::new();
    let allocator = Allocator::with_host(host_allocator.clone());

    let family = device.queue_family_index(vk::QueueFlags::TRANSFER)
        .context("Device has no transfer queue")?;
    let pool = CommandPool::resettable(&device, family)?;
    let mut command_buffer = pool.allocate(vk::CommandBufferLevel::PRIMARY)?;

    // Upload into device-local memory through a staging buffer
    let data: Vec<u8> = (0..=255).collect();
    let storage = Buffer::storage(&device, data.len() as u64, &allocator, Some(InitialData {
        command_buffer: &mut command_buffer,
        data: &data,
        copy_fn: Some(copy_memory),
    }))?;

    // Read it back
    let mut readback = Buffer::dst_transfer(&device, data.len() as u64, &allocator)?;
    command_buffer.reset()?;
    command_buffer.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
    readback.copy_transfer(&mut command_buffer, &storage, CopyRegion::default())?;
    command_buffer.end()?;
    bindery::gpu::transfer::finish(&mut command_buffer)?;

    let mut result = vec![0; data.len()];
    readback.read_host(&mut result, CopyRegion::default())?;
    anyhow::ensure!(result == data, "Readback does not match the uploaded data");

    report(&device);
    drop((storage, readback, command_buffer, pool));
    info!("Live host allocations after release: {}", host_allocator.statistics().live_allocations);

    Ok(())
}

fn report(device: &Arc<Device>) {
    let pool = device.resource_pool();
    info!("Resources: {:?}", pool.count_resources());
    info!("Device-local memory: {} bytes", pool.device_local_memory_allocated());
    info!("Host-visible memory: {} bytes", pool.host_visible_memory_allocated());
    info!("Buffer footprint: {} bytes", pool.buffer_memory_footprint());
}
