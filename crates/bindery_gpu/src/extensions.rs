use crate::error::{Error, Result};

use std::{
    collections::HashSet,
    ffi::{CStr, CString}
};


/// Device extensions the resource layer reacts to when they are enabled.
pub const OPTIONAL_DEVICE_EXTENSIONS: [&CStr; 8] = [
    ash::khr::get_memory_requirements2::NAME,
    ash::khr::dedicated_allocation::NAME,
    ash::khr::bind_memory2::NAME,
    ash::khr::device_group::NAME,
    ash::ext::memory_priority::NAME,
    ash::khr::buffer_device_address::NAME,
    ash::khr::deferred_host_operations::NAME,
    ash::khr::acceleration_structure::NAME,
];

/// Capability table populated once when the device is created.
#[derive(Clone, Debug, Default)]
pub struct Extensions {
    enabled: HashSet<CString>,

    pub get_memory_requirements2: bool,
    pub dedicated_allocation: bool,
    pub bind_memory2: bool,
    pub device_group: bool,
    pub memory_priority: bool,
    pub buffer_device_address: bool,
    pub acceleration_structure: bool,
}

impl Extensions {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a CStr>) -> Self {
        let enabled: HashSet<CString> = names.into_iter()
            .map(CStr::to_owned)
            .collect();
        let has = |name: &CStr| enabled.contains(name);

        Self {
            get_memory_requirements2: has(ash::khr::get_memory_requirements2::NAME),
            dedicated_allocation: has(ash::khr::dedicated_allocation::NAME),
            bind_memory2: has(ash::khr::bind_memory2::NAME),
            device_group: has(ash::khr::device_group::NAME),
            memory_priority: has(ash::ext::memory_priority::NAME),
            buffer_device_address: has(ash::khr::buffer_device_address::NAME),
            acceleration_structure: has(ash::khr::acceleration_structure::NAME),
            enabled,
        }
    }

    pub fn enabled(&self, name: &CStr) -> bool {
        self.enabled.contains(name)
    }

    /// Fails lazily, at the first use of a capability whose extension is missing.
    pub fn require(&self, name: &CStr) -> Result<()> {
        match self.enabled(name) {
            true => Ok(()),
            false => Err(Error::unsupported_extension(name))
        }
    }

    /// Drivers can only report dedicated-allocation preferences through `vkGet*MemoryRequirements2`.
    pub fn dedicated_allocation_query(&self) -> bool {
        self.get_memory_requirements2 && self.dedicated_allocation
    }

    pub fn iter(&self) -> impl Iterator<Item = &CStr> + '_ {
        self.enabled.iter().map(CString::as_c_str)
    }
}
