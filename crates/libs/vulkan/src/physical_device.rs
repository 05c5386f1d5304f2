use std::{collections::HashSet, ffi::c_char};

use anyhow::Result;
use ash::{vk, Instance};

use crate::{
    device::{DeviceFeatures, FeatureChain},
    queue::QueueFamily,
};

/// What the context needs to know about an adapter to pick it and to size
/// ray tracing work for it. Everything is queried once up front.
#[derive(Debug, Clone)]
pub struct PhysicalDevice {
    pub(crate) inner: vk::PhysicalDevice,
    pub name: String,
    pub(crate) device_type: vk::PhysicalDeviceType,
    pub limits: vk::PhysicalDeviceLimits,
    pub(crate) ray_tracing_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
    pub(crate) queue_families: Vec<QueueFamily>,
    pub(crate) supported_extensions: HashSet<String>,
    pub(crate) supported_device_features: DeviceFeatures,
}

impl PhysicalDevice {
    pub(crate) fn new(instance: &Instance, inner: vk::PhysicalDevice) -> Result<Self> {
        let mut ray_tracing_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut properties =
            vk::PhysicalDeviceProperties2::builder().push_next(&mut ray_tracing_properties);
        unsafe { instance.get_physical_device_properties2(inner, &mut properties) };
        let properties = properties.properties;
        ray_tracing_properties.p_next = std::ptr::null_mut();

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(inner) }
            .into_iter()
            .zip(0..)
            .map(|(properties, index)| QueueFamily::new(index, properties))
            .collect();

        let supported_extensions = unsafe { instance.enumerate_device_extension_properties(inner)? }
            .iter()
            .map(|extension| fixed_str(&extension.extension_name))
            .collect();

        Ok(Self {
            inner,
            name: fixed_str(&properties.device_name),
            device_type: properties.device_type,
            limits: properties.limits,
            ray_tracing_properties,
            queue_families,
            supported_extensions,
            supported_device_features: query_features(instance, inner),
        })
    }

    pub fn missing_extensions<'a>(&self, extensions: &[&'a str]) -> Vec<&'a str> {
        extensions
            .iter()
            .copied()
            .filter(|extension| !self.supported_extensions.contains(*extension))
            .collect()
    }

    /// Lower is preferred. Headless dispatch favours dedicated hardware.
    pub(crate) fn rank(&self) -> u8 {
        device_type_rank(self.device_type)
    }
}

fn device_type_rank(device_type: vk::PhysicalDeviceType) -> u8 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        _ => 3,
    }
}

fn query_features(instance: &Instance, inner: vk::PhysicalDevice) -> DeviceFeatures {
    let mut chain = FeatureChain::default();
    unsafe { instance.get_physical_device_features2(inner, &mut chain.link()) };

    chain.features()
}

/// Reads a nul padded name out of a fixed size Vulkan array. A missing
/// terminator ends the name at the array's end.
pub(crate) fn fixed_str(chars: &[c_char]) -> String {
    let bytes = chars
        .iter()
        .map(|&c| c as u8)
        .take_while(|&b| b != 0)
        .collect::<Vec<_>>();

    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(name: &str, len: usize) -> Vec<c_char> {
        let mut chars = name.bytes().map(|b| b as c_char).collect::<Vec<_>>();
        chars.resize(len, 0);
        chars
    }

    #[test]
    fn fixed_names_stop_at_nul() {
        assert_eq!(fixed_str(&padded("VK_KHR_ray_tracing_pipeline", 256)), "VK_KHR_ray_tracing_pipeline");
        assert_eq!(fixed_str(&padded("", 8)), "");

        let unterminated = "abcd".bytes().map(|b| b as c_char).collect::<Vec<_>>();
        assert_eq!(fixed_str(&unterminated), "abcd");
    }

    #[test]
    fn dedicated_hardware_ranks_first() {
        let mut types = [
            vk::PhysicalDeviceType::CPU,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::PhysicalDeviceType::VIRTUAL_GPU,
        ];
        types.sort_by_key(|t| device_type_rank(*t));

        assert_eq!(types[0], vk::PhysicalDeviceType::DISCRETE_GPU);
        assert_eq!(types[1], vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert_eq!(types[3], vk::PhysicalDeviceType::CPU);
    }
}
