use crate::{
    command::Queue,
    context::Instance,
    driver::{vulkan::LogicalDevice, Driver},
    error::{Error, Result},
    extensions::{Extensions, OPTIONAL_DEVICE_EXTENSIONS},
    pool::ResourcePool
};

use ash::vk;
use bevy_log::{info, warn};

use std::{
    ffi::{CStr, CString},
    sync::Arc
};

// Reexport
pub use ash::vk::PhysicalDeviceType as DeviceType;



#[derive(Clone, Copy, Default)]
pub struct QueueProperties {
    pub compute_family: u32,
    pub graphics_family: u32,
    pub transfer_family: u32,

    pub compute_count: u32,
    pub transfer_count: u32
}

#[derive(Clone, Copy)]
pub struct DeviceProperties {
    properties: vk::PhysicalDeviceProperties,
    pub queue: QueueProperties,
}

impl std::ops::Deref for DeviceProperties {
    type Target = vk::PhysicalDeviceProperties;

    fn deref(&self) -> &Self::Target {
        &self.properties
    }
}



pub struct PhysicalDevice {
    inner: vk::PhysicalDevice,
    name: String,
    pub properties: DeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_family_properties: Vec<vk::QueueFamilyProperties>,
    supported_extensions: Vec<CString>,
}

impl std::ops::Deref for PhysicalDevice {
    type Target = vk::PhysicalDevice;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl PhysicalDevice {
    pub fn new(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> anyhow::Result<Self> {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let queue_family_properties = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let supported_extensions = unsafe { instance.enumerate_device_extension_properties(physical_device)? }
            .iter()
            .filter_map(|extension| extension.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect();
        let name = properties.device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from("Unknown Device"));

        let mut queue_properties = QueueProperties::default();
        for (family, properties) in queue_family_properties.iter().enumerate()  {
            match (
                properties.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                properties.queue_flags.contains(vk::QueueFlags::COMPUTE),
                properties.queue_flags.contains(vk::QueueFlags::TRANSFER),
            ) {
                // Graphics queue family
                (true, true, true) => queue_properties.graphics_family = family as u32,
                // Compute queue family
                (false, true, true) => if queue_properties.compute_count == 0 {
                    queue_properties.compute_family = family as u32;
                    queue_properties.compute_count = properties.queue_count;
                },
                // Transfer queue family
                (false, false, true) => if queue_properties.transfer_count == 0 {
                    queue_properties.transfer_family = family as u32;
                    queue_properties.transfer_count = properties.queue_count;
                },
                _ => ()
            }
        };

        Ok(Self {
            inner: physical_device,
            name,
            properties: DeviceProperties {
                properties,
                queue: queue_properties,
            },
            memory_properties,
            queue_family_properties,
            supported_extensions,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_type(&self) -> DeviceType {
        self.properties.device_type
    }

    pub fn supports_extension(&self, name: &CStr) -> bool {
        self.supported_extensions.iter().any(|extension| extension.as_c_str() == name)
    }
}


/// Options for creating a Vulkan [`Device`].
#[derive(Clone)]
pub struct DeviceInfo {
    /// Requested extensions; the unsupported ones are skipped.
    pub extensions: Vec<&'static CStr>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            extensions: OPTIONAL_DEVICE_EXTENSIONS.to_vec(),
        }
    }
}


/// Logical device shared by every object created on it.
///
/// Children hold a strong reference, so a device outlives everything it created. The device
/// observes its children only through the [`ResourcePool`].
pub struct Device {
    resource_pool: ResourcePool,
    extensions: Extensions,
    driver: Box<dyn Driver>,
}

impl Device {
    pub fn new(driver: impl Driver + 'static) -> Arc<Self> {
        let extensions = Extensions::new(driver.enabled_extensions().iter().map(CString::as_c_str));
        info!("Using device {} with {} optional extensions", driver.name(), extensions.iter().count());

        Arc::new(Self {
            resource_pool: ResourcePool::default(),
            extensions,
            driver: Box::new(driver),
        })
    }

    /// Creates a Vulkan device on `physical_device`.
    pub fn vulkan(instance: Arc<Instance>, physical_device: PhysicalDevice, info: &DeviceInfo) -> Result<Arc<Self>> {
        let logical_device = LogicalDevice::new(instance, physical_device, &info.extensions)?;
        Ok(Self::new(logical_device))
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn name(&self) -> &str {
        self.driver.name()
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn resource_pool(&self) -> &ResourcePool {
        &self.resource_pool
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        self.driver.memory_properties()
    }

    pub fn queue_family_properties(&self) -> &[vk::QueueFamilyProperties] {
        self.driver.queue_family_properties()
    }

    /// First queue family supporting all of `flags`.
    pub fn queue_family_index(&self, flags: vk::QueueFlags) -> Option<u32> {
        self.queue_family_properties().iter()
            .position(|family| family.queue_count > 0 && family.queue_flags.contains(flags))
            .map(|family| family as u32)
    }

    /// Queue `index` of the first family supporting all of `flags`.
    pub fn queue(self: &Arc<Self>, flags: vk::QueueFlags, index: u32) -> Result<Queue> {
        let family_index = self.queue_family_index(flags)
            .ok_or_else(|| Error::invalid_usage("no queue family supports the requested flags"))?;
        self.queue_by_family(family_index, index)
    }

    pub fn queue_by_family(self: &Arc<Self>, family_index: u32, index: u32) -> Result<Queue> {
        match self.queue_family_properties().get(family_index as usize) {
            Some(family) if index < family.queue_count => Ok(Queue::new(self, family_index, index)),
            _ => Err(Error::invalid_usage("queue index out of range"))
        }
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.driver.device_wait_idle() }
            .map_err(|result| Error::native("vkDeviceWaitIdle", result))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        for (object_type, count) in self.resource_pool.unreleased() {
            warn!("Device {} destroyed with {} unreleased {:?} objects", self.driver.name(), count, object_type);
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.driver.name())
            .field("extensions", &self.extensions)
            .finish()
    }
}
