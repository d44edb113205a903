use ash::vk;
use bevy_log::warn;
use thiserror::Error;


#[derive(Debug, Error)]
pub enum Error {
    #[error("{operation} failed: {result}")]
    CreationFailed {
        operation: &'static str,
        result: vk::Result
    },
    /// No memory type of the physical device carries the requested property flags.
    #[error("no memory type supports {flags:?}")]
    UnsupportedMemoryType {
        flags: vk::MemoryPropertyFlags
    },
    #[error("device memory allocation failed: {result}")]
    NativeAllocationFailed {
        result: vk::Result
    },
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("extension {name} is not enabled")]
    UnsupportedExtension {
        name: String
    },
    #[error("invalid usage: {0}")]
    InvalidUsage(&'static str),
    #[error("device lost")]
    DeviceLost,
    #[error("{operation} failed: {result}")]
    Native {
        operation: &'static str,
        result: vk::Result
    },
    #[error(transparent)]
    Allocator(#[from] gpu_allocator::AllocationError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Classifies the status of a failed `vkCreate*` call.
    pub(crate) fn creation(operation: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            result => Self::CreationFailed { operation, result }
        }
    }

    pub(crate) fn allocation(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            result => Self::NativeAllocationFailed { result }
        }
    }

    pub(crate) fn native(operation: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            result => Self::Native { operation, result }
        }
    }

    pub(crate) fn invalid_usage(reason: &'static str) -> Self {
        warn!("Invalid usage: {}", reason);
        Self::InvalidUsage(reason)
    }

    pub(crate) fn unsupported_extension(name: &std::ffi::CStr) -> Self {
        Self::UnsupportedExtension { name: name.to_string_lossy().into_owned() }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_is_distinct_from_creation_failure() {
        assert!(matches!(
            Error::creation("vkCreateBuffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            Error::OutOfDeviceMemory
        ));
        assert!(matches!(
            Error::creation("vkCreateBuffer", vk::Result::ERROR_INITIALIZATION_FAILED),
            Error::CreationFailed { operation: "vkCreateBuffer", .. }
        ));
        assert!(matches!(
            Error::allocation(vk::Result::ERROR_TOO_MANY_OBJECTS),
            Error::NativeAllocationFailed { result: vk::Result::ERROR_TOO_MANY_OBJECTS }
        ));
    }
}
