//! Routes `VK_EXT_debug_utils` messages into the log.

use ash::vk;
use bevy_log::{debug, error, trace, warn};

use std::ffi::{c_void, CStr};

// Reexport types
pub use ash::vk::{
    DebugUtilsMessageSeverityFlagsEXT as MessageSeverity,
    DebugUtilsMessageTypeFlagsEXT as MessageType,
    DebugUtilsMessengerCallbackDataEXT as MessageData,
    DebugUtilsMessengerEXT as DebugUtilsMessenger,
};
pub(crate) use ash::ext::debug_utils::Instance as DebugUtilsInstance;


pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Logs one validation message at the level matching its severity.
pub fn log_message(message_severity: MessageSeverity, message_type: MessageType, message: &str) {
    let types = match message_type {
        MessageType::GENERAL => "General",
        MessageType::PERFORMANCE => "Performance",
        MessageType::VALIDATION => "Validation",
        MessageType::DEVICE_ADDRESS_BINDING => "Device Address Binding",
        _ => "Unknown",
    };

    match message_severity {
        MessageSeverity::ERROR => error!("[{}] {}", types, message),
        MessageSeverity::WARNING => warn!("[{}] {}", types, message),
        MessageSeverity::INFO => debug!("[{}] {}", types, message),
        _ => trace!("[{}] {}", types, message),
    }
}

pub(crate) fn messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            MessageSeverity::ERROR |
            MessageSeverity::WARNING |
            MessageSeverity::INFO |
            MessageSeverity::VERBOSE
        )
        .message_type(
            MessageType::GENERAL |
            MessageType::VALIDATION |
            MessageType::PERFORMANCE
        )
        .pfn_user_callback(Some(debug_utils_messenger_callback))
}

unsafe extern "system" fn debug_utils_messenger_callback(
    message_severity: MessageSeverity,
    message_type: MessageType,
    p_message_data: *const MessageData<'_>,
    _p_user_data: *mut c_void
) -> vk::Bool32 {
    let Some(message_data) = p_message_data.as_ref() else {
        return vk::FALSE;
    };
    if message_data.p_message.is_null() {
        return vk::FALSE;
    }

    let message = CStr::from_ptr(message_data.p_message).to_string_lossy();
    log_message(message_severity, message_type, &message);

    vk::FALSE
}
