mod pipeline;

pub use pipeline::*;

use ash::{extensions::khr::RayTracingPipeline as AshRayTracingPipeline, vk};

use crate::{device::Device, instance::Instance, physical_device::PhysicalDevice};

/// Ray tracing entry points of a device, with the pipeline properties of
/// the adapter it was created on.
pub struct RayTracingContext {
    pub pipeline_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
    pub pipeline_fn: AshRayTracingPipeline,
}

impl RayTracingContext {
    pub(crate) fn new(instance: &Instance, physical_device: &PhysicalDevice, device: &Device) -> Self {
        Self {
            pipeline_properties: physical_device.ray_tracing_properties,
            pipeline_fn: AshRayTracingPipeline::new(&instance.inner, &device.inner),
        }
    }

    /// Bytes `vkGetRayTracingShaderGroupHandlesKHR` writes for `group_count`
    /// groups.
    pub fn handle_data_size(&self, group_count: u32) -> usize {
        self.pipeline_properties.shader_group_handle_size as usize * group_count as usize
    }
}
