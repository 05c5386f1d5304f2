use std::ffi::{c_void, CStr, CString};

use anyhow::Result;
use ash::{extensions::ext::DebugUtils, vk, Entry, Instance as AshInstance};

use crate::{
    physical_device::{fixed_str, PhysicalDevice},
    Version,
};

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Headless instance: no surface extensions. Debug builds turn on the
/// Khronos validation layer when it is installed and route its messages to
/// the `log` crate.
pub struct Instance {
    pub(crate) inner: AshInstance,
    messenger: Option<DebugMessenger>,
}

struct DebugMessenger {
    loader: DebugUtils,
    inner: vk::DebugUtilsMessengerEXT,
}

impl Instance {
    pub(crate) fn new(entry: &Entry, api_version: Version, app_name: &str) -> Result<Self> {
        let app_name = CString::new(app_name)?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(app_name.as_c_str())
            .api_version(api_version.make_api_version());

        let validation = cfg!(debug_assertions) && validation_layer_available(entry)?;
        let layer_name = CString::new(VALIDATION_LAYER)?;
        let layer_names = if validation {
            vec![layer_name.as_ptr()]
        } else {
            vec![]
        };
        let extension_names = if validation {
            vec![DebugUtils::name().as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names)
            .enabled_extension_names(&extension_names);
        let inner = unsafe { entry.create_instance(&create_info, None)? };

        let messenger = if validation {
            match DebugMessenger::new(entry, &inner) {
                Ok(messenger) => Some(messenger),
                Err(err) => {
                    unsafe { inner.destroy_instance(None) };
                    return Err(err);
                }
            }
        } else {
            None
        };

        Ok(Self { inner, messenger })
    }

    /// Every adapter of the instance, preferred ones first.
    pub(crate) fn physical_devices(&self) -> Result<Vec<PhysicalDevice>> {
        let mut physical_devices = unsafe { self.inner.enumerate_physical_devices()? }
            .into_iter()
            .map(|inner| PhysicalDevice::new(&self.inner, inner))
            .collect::<Result<Vec<_>>>()?;
        physical_devices.sort_by_key(PhysicalDevice::rank);

        Ok(physical_devices)
    }
}

fn validation_layer_available(entry: &Entry) -> Result<bool> {
    let available = entry
        .enumerate_instance_layer_properties()?
        .iter()
        .any(|layer| fixed_str(&layer.layer_name) == VALIDATION_LAYER);
    if !available {
        log::warn!("{} is not installed, running without validation", VALIDATION_LAYER);
    }

    Ok(available)
}

impl DebugMessenger {
    fn new(entry: &Entry, instance: &AshInstance) -> Result<Self> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(log_validation_message));

        let loader = DebugUtils::new(entry, instance);
        let inner = unsafe { loader.create_debug_utils_messenger(&create_info, None)? };

        Ok(Self { loader, inner })
    }
}

fn log_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

    if severity.contains(Severity::ERROR) {
        log::Level::Error
    } else if severity.contains(Severity::WARNING) {
        log::Level::Warn
    } else if severity.contains(Severity::INFO) {
        log::Level::Debug
    } else {
        log::Level::Trace
    }
}

unsafe extern "system" fn log_validation_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    if let Some(data) = callback_data.as_ref() {
        let message = match data.p_message.is_null() {
            true => "".into(),
            false => CStr::from_ptr(data.p_message).to_string_lossy(),
        };
        log::log!(target: "vulkan", log_level(severity), "{:?} {}", message_type, message);
    }

    vk::FALSE
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some(messenger) = self.messenger.take() {
                messenger
                    .loader
                    .destroy_debug_utils_messenger(messenger.inner, None);
            }
            self.inner.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

    use super::*;

    #[test]
    fn validation_severities_map_to_log_levels() {
        assert_eq!(log_level(Severity::ERROR), log::Level::Error);
        assert_eq!(log_level(Severity::WARNING), log::Level::Warn);
        assert_eq!(log_level(Severity::INFO), log::Level::Debug);
        assert_eq!(log_level(Severity::VERBOSE), log::Level::Trace);
        assert_eq!(log_level(Severity::WARNING | Severity::ERROR), log::Level::Error);
    }
}
