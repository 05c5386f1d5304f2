use std::{ffi::CString, sync::Arc};

use anyhow::Result;
use ash::{vk, Device as AshDevice};

use crate::{
    instance::Instance,
    physical_device::PhysicalDevice,
    queue::{Queue, QueueFamily},
};

pub struct Device {
    pub inner: AshDevice,
}

impl Device {
    /// Creates the logical device with a single queue of `queue_family` and
    /// exactly the requested extensions and features enabled.
    pub(crate) fn new(
        instance: &Instance,
        physical_device: &PhysicalDevice,
        queue_family: QueueFamily,
        extensions: &[&str],
        features: &DeviceFeatures,
    ) -> Result<Self> {
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family.index)
            .queue_priorities(&[1.0]);

        let extensions = extensions
            .iter()
            .map(|name| CString::new(*name))
            .collect::<Result<Vec<_>, _>>()?;
        let extension_ptrs = extensions.iter().map(|name| name.as_ptr()).collect::<Vec<_>>();

        let mut chain = FeatureChain::new(features);
        let mut features = chain.link();
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut features);

        let inner = unsafe {
            instance
                .inner
                .create_device(physical_device.inner, &create_info, None)?
        };

        Ok(Self { inner })
    }

    pub fn get_queue(self: &Arc<Self>, queue_family: QueueFamily, queue_index: u32) -> Queue {
        let inner = unsafe { self.inner.get_device_queue(queue_family.index, queue_index) };
        Queue::new(self.clone(), inner)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe { self.inner.destroy_device(None) };
    }
}

/// The optional device features the dispatch core knows about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub ray_tracing_pipeline: bool,
    pub acceleration_structure: bool,
    pub runtime_descriptor_array: bool,
    pub buffer_device_address: bool,
    pub synchronization2: bool,
}

impl DeviceFeatures {
    /// Features a ray tracing dispatch needs from the device.
    pub fn ray_tracing() -> Self {
        Self {
            ray_tracing_pipeline: true,
            acceleration_structure: true,
            runtime_descriptor_array: false,
            buffer_device_address: true,
            synchronization2: true,
        }
    }

    /// Names of the features in `requirements` this set lacks.
    pub fn missing(&self, requirements: &Self) -> Vec<&'static str> {
        self.named()
            .into_iter()
            .zip(requirements.named())
            .filter(|((_, supported), (_, required))| *required && !supported)
            .map(|((name, _), _)| name)
            .collect()
    }

    fn named(&self) -> [(&'static str, bool); 5] {
        [
            ("rayTracingPipeline", self.ray_tracing_pipeline),
            ("accelerationStructure", self.acceleration_structure),
            ("runtimeDescriptorArray", self.runtime_descriptor_array),
            ("bufferDeviceAddress", self.buffer_device_address),
            ("synchronization2", self.synchronization2),
        ]
    }
}

/// The feature structs `DeviceFeatures` maps onto, chained behind a
/// `VkPhysicalDeviceFeatures2` both to query and to enable them.
#[derive(Default)]
pub(crate) struct FeatureChain {
    ray_tracing: vk::PhysicalDeviceRayTracingPipelineFeaturesKHR,
    acceleration_structure: vk::PhysicalDeviceAccelerationStructureFeaturesKHR,
    vulkan_12: vk::PhysicalDeviceVulkan12Features,
    vulkan_13: vk::PhysicalDeviceVulkan13Features,
}

impl FeatureChain {
    pub(crate) fn new(features: &DeviceFeatures) -> Self {
        let mut chain = Self::default();
        chain.ray_tracing.ray_tracing_pipeline = features.ray_tracing_pipeline.into();
        chain.acceleration_structure.acceleration_structure = features.acceleration_structure.into();
        chain.vulkan_12.runtime_descriptor_array = features.runtime_descriptor_array.into();
        chain.vulkan_12.buffer_device_address = features.buffer_device_address.into();
        chain.vulkan_13.synchronization2 = features.synchronization2.into();
        chain
    }

    pub(crate) fn features(&self) -> DeviceFeatures {
        DeviceFeatures {
            ray_tracing_pipeline: self.ray_tracing.ray_tracing_pipeline == vk::TRUE,
            acceleration_structure: self.acceleration_structure.acceleration_structure == vk::TRUE,
            runtime_descriptor_array: self.vulkan_12.runtime_descriptor_array == vk::TRUE,
            buffer_device_address: self.vulkan_12.buffer_device_address == vk::TRUE,
            synchronization2: self.vulkan_13.synchronization2 == vk::TRUE,
        }
    }

    pub(crate) fn link(&mut self) -> vk::PhysicalDeviceFeatures2Builder<'_> {
        vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut self.ray_tracing)
            .push_next(&mut self.acceleration_structure)
            .push_next(&mut self.vulkan_12)
            .push_next(&mut self.vulkan_13)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_features_are_named() {
        let supported = DeviceFeatures {
            ray_tracing_pipeline: true,
            buffer_device_address: true,
            ..Default::default()
        };

        assert_eq!(
            supported.missing(&DeviceFeatures::ray_tracing()),
            ["accelerationStructure", "synchronization2"]
        );
        assert!(supported.missing(&DeviceFeatures::default()).is_empty());
        assert!(DeviceFeatures::ray_tracing().missing(&supported).is_empty());
    }

    #[test]
    fn feature_chain_carries_requested_features() {
        let features = DeviceFeatures::ray_tracing();
        let chain = FeatureChain::new(&features);

        assert_eq!(chain.features(), features);
        assert_eq!(chain.vulkan_12.runtime_descriptor_array, vk::FALSE);
        assert_eq!(FeatureChain::default().features(), DeviceFeatures::default());
    }
}
