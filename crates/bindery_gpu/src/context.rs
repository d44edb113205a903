use crate::{
    device::{Device, DeviceInfo, PhysicalDevice},
    validation::{messenger_create_info, DebugUtilsInstance, DebugUtilsMessenger, VALIDATION_LAYER}
};

use anyhow::{bail, Context as _, Result};
use ash::vk;
use bevy_log::info;

use std::{
    ffi::{c_char, CString},
    sync::Arc
};


pub struct ContextInfo {
    pub application_name: Box<str>,
    pub application_version: (u32, u32, u32, u32),
    pub engine_name: Box<str>,
    pub engine_version: (u32, u32, u32, u32),
    /// Lowest API version a device must support to be selected.
    pub api_version: u32,
    /// Enables the Khronos validation layer and routes its messages into the log.
    pub validation: bool,
    pub device: DeviceInfo,
}

impl Default for ContextInfo {
    fn default() -> Self {
        Self {
            application_name: "Bindery App".into(),
            application_version: (0, 0, 1, 0),
            engine_name: "Bindery".into(),
            engine_version: (0, 0, 1, 0),
            api_version: vk::API_VERSION_1_2,
            validation: cfg!(all(debug_assertions, feature = "validation")),
            device: DeviceInfo::default(),
        }
    }
}


/// Vulkan instance, destroyed after the last device created from it.
pub struct Instance {
    instance: ash::Instance,
    debug_utils: Option<(DebugUtilsInstance, DebugUtilsMessenger)>,
    // The loader must stay loaded while the instance lives
    _entry: ash::Entry,
}

impl std::ops::Deref for Instance {
    type Target = ash::Instance;

    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl Instance {
    pub fn new(info: &ContextInfo) -> Result<Arc<Self>> {
        let entry = unsafe { ash::Entry::load() }.context("Failed to load the Vulkan loader")?;

        // Gather instance layer and extension names
        let layer_names: Vec<*const c_char> = match info.validation {
            true => vec![VALIDATION_LAYER.as_ptr()],
            false => vec![]
        };
        let extension_names: Vec<*const c_char> = match info.validation {
            true => vec![ash::ext::debug_utils::NAME.as_ptr()],
            false => vec![]
        };

        // Create Vulkan instance
        let application_name = CString::new(info.application_name.as_ref())?;
        let engine_name = CString::new(info.engine_name.as_ref())?;
        let application_info = vk::ApplicationInfo::default()
            .application_name(application_name.as_c_str())
            .application_version(vk::make_api_version(
                info.application_version.0,
                info.application_version.1,
                info.application_version.2,
                info.application_version.3
            ))
            .engine_name(engine_name.as_c_str())
            .engine_version(vk::make_api_version(
                info.engine_version.0,
                info.engine_version.1,
                info.engine_version.2,
                info.engine_version.3
            ))
            .api_version(info.api_version);
        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&application_info)
            .enabled_layer_names(&layer_names)
            .enabled_extension_names(&extension_names);
        let instance = unsafe { entry.create_instance(&instance_create_info, None) }
            .context("Failed to create the Vulkan instance")?;

        // Create Vulkan debug messenger
        let debug_utils = match info.validation {
            true => {
                let debug_utils = DebugUtilsInstance::new(&entry, &instance);
                match unsafe { debug_utils.create_debug_utils_messenger(&messenger_create_info(), None) } {
                    Ok(messenger) => Some((debug_utils, messenger)),
                    Err(result) => {
                        unsafe { instance.destroy_instance(None) };
                        bail!("Failed to create the debug messenger: {}", result);
                    }
                }
            },
            false => None
        };

        Ok(Arc::new(Self {
            instance,
            debug_utils,
            _entry: entry,
        }))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                //  Safety: vkDestroyDebugUtilsMessengerEXT
                //  Host Synchronization
                //   -  Host access to messenger must be externally synchronized
                //
                //  Messenger is private to this object
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            //  Safety: vkDestroyInstance
            //  Host Synchronization
            //   -  Host access to instance must be externally synchronized
            //   -  Host access to all VkPhysicalDevice objects enumerated from instance must be externally synchronized
            //
            //  Every device holds an Arc to this object, so this only runs after all devices drop
            self.instance.destroy_instance(None);
        }
    }
}


/// Ranks physical devices for primary device selection. Devices below the requested API version
/// rank 0.
pub fn device_score(device_type: vk::PhysicalDeviceType, api_version: u32, required_version: u32) -> u32 {
    match api_version >= required_version {
        true => match device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
            _ => 1
        },
        false => 0
    }
}

/// Instance plus one [`Device`] per physical device, with a selected primary device.
pub struct Context {
    info: ContextInfo,
    primary_device: usize,
    devices: Vec<Arc<Device>>,
    instance: Arc<Instance>,
}

impl Context {
    pub fn new(info: ContextInfo) -> Result<Self> {
        let instance = Instance::new(&info)?;

        // Create Vulkan devices
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?
            .into_iter()
            .map(|physical_device| PhysicalDevice::new(&instance, physical_device))
            .collect::<Result<Vec<_>>>()?;

        info!("Available devices: {:?}", physical_devices.iter()
            .map(PhysicalDevice::name)
            .collect::<Vec<_>>()
        );

        let primary_device = physical_devices.iter()
            .enumerate()
            .map(|(index, physical_device)| {
                let score = device_score(physical_device.device_type(), physical_device.properties.api_version, info.api_version);
                (index, score)
            })
            .filter(|&(_, score)| score > 0)
            .max_by_key(|&(_, score)| score)
            .map(|(index, _)| index)
            .context("No valid device found.")?;

        info!("Selected primary device: {}, {}", primary_device, physical_devices[primary_device].name());

        let mut devices = Vec::with_capacity(physical_devices.len());
        for physical_device in physical_devices {
            let name = physical_device.name().to_owned();
            let device = Device::vulkan(instance.clone(), physical_device, &info.device)
                .with_context(|| format!("Failed to create device {}", name))?;
            devices.push(device);
        }

        Ok(Self {
            info,
            primary_device,
            devices,
            instance,
        })
    }

    pub fn info(&self) -> &ContextInfo {
        &self.info
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn primary_device(&self) -> &Arc<Device> {
        &self.devices[self.primary_device]
    }

    pub fn primary_device_index(&self) -> usize {
        self.primary_device
    }

    pub fn set_primary_device(&mut self, index: usize) -> Result<()> {
        match index < self.devices.len() {
            true => self.primary_device = index,
            false => bail!("'index' should be a valid device index.")
        };
        info!("Selected primary device: {}, {}", index, self.devices[index].name());

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_devices_rank_first() {
        let required = vk::API_VERSION_1_2;
        assert!(
            device_score(vk::PhysicalDeviceType::DISCRETE_GPU, vk::API_VERSION_1_3, required)
                > device_score(vk::PhysicalDeviceType::INTEGRATED_GPU, vk::API_VERSION_1_3, required)
        );
        assert_eq!(device_score(vk::PhysicalDeviceType::CPU, vk::API_VERSION_1_2, required), 1);
        assert_eq!(device_score(vk::PhysicalDeviceType::DISCRETE_GPU, vk::API_VERSION_1_1, required), 0);
    }
}
