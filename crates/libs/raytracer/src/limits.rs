use ash::vk;
use vulkan::Context;

use crate::{Error, Result};

/// Device extensions that must be enabled before a [`crate::RayTracer`] can
/// be built.
pub fn required_device_extensions() -> &'static [&'static str] {
    &[
        "VK_KHR_ray_tracing_pipeline",
        "VK_KHR_acceleration_structure",
        "VK_KHR_deferred_host_operations",
        "VK_KHR_buffer_device_address",
        "VK_KHR_spirv_1_4",
        "VK_KHR_shader_float_controls",
    ]
}

/// The device properties the dispatch core depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingLimits {
    pub handle_size: u32,
    pub handle_alignment: u32,
    pub base_alignment: u32,
    pub max_recursion_depth: u32,
    pub max_dispatch_invocations: u32,
    pub max_extent: [u32; 3],
    pub max_push_constants_size: u32,
    pub max_bound_descriptor_sets: u32,
}

impl RayTracingLimits {
    pub fn from_context(context: &Context) -> Result<Self> {
        let ray_tracing = context
            .ray_tracing
            .as_ref()
            .ok_or(Error::RayTracingDisabled)?;

        Ok(Self::new(
            &ray_tracing.pipeline_properties,
            &context.physical_device.limits,
        ))
    }

    pub fn new(
        properties: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
        limits: &vk::PhysicalDeviceLimits,
    ) -> Self {
        let axis = |i: usize| {
            limits.max_compute_work_group_count[i]
                .saturating_mul(limits.max_compute_work_group_size[i])
        };

        Self {
            handle_size: properties.shader_group_handle_size,
            handle_alignment: properties.shader_group_handle_alignment,
            base_alignment: properties.shader_group_base_alignment,
            max_recursion_depth: properties.max_ray_recursion_depth,
            max_dispatch_invocations: properties.max_ray_dispatch_invocation_count,
            max_extent: [axis(0), axis(1), axis(2)],
            max_push_constants_size: limits.max_push_constants_size,
            max_bound_descriptor_sets: limits.max_bound_descriptor_sets,
        }
    }

    /// Checks the alignments can be used to lay out a shader binding table.
    pub fn validate(&self) -> Result<()> {
        if self.handle_size == 0 {
            return Err(Error::InvalidDeviceLimits(
                "shaderGroupHandleSize is zero".to_string(),
            ));
        }
        for (name, alignment) in [
            ("shaderGroupHandleAlignment", self.handle_alignment),
            ("shaderGroupBaseAlignment", self.base_alignment),
        ] {
            if !alignment.is_power_of_two() {
                return Err(Error::InvalidDeviceLimits(format!(
                    "{name} {alignment} is not a power of two"
                )));
            }
        }

        Ok(())
    }

    pub fn check_extent(&self, extent: [u32; 3]) -> Result<()> {
        let invocations = extent.iter().map(|&e| e as u64).product::<u64>();
        let within_axes = extent
            .iter()
            .zip(self.max_extent.iter())
            .all(|(requested, max)| requested <= max);

        if !within_axes || invocations > self.max_dispatch_invocations as u64 {
            return Err(Error::ExtentTooLarge {
                requested: extent,
                max: self.max_extent,
                max_invocations: self.max_dispatch_invocations,
            });
        }

        Ok(())
    }

    pub fn check_recursion_depth(&self, depth: u32) -> Result<()> {
        if depth > self.max_recursion_depth {
            return Err(Error::RecursionTooDeep {
                requested: depth,
                max: self.max_recursion_depth,
            });
        }

        Ok(())
    }

    /// `set_count` sets starting at index 0 must all be bindable at once.
    pub fn check_descriptor_sets(&self, set_count: u64) -> Result<()> {
        if set_count > self.max_bound_descriptor_sets as u64 {
            return Err(Error::TooManyDescriptorSets {
                set: set_count - 1,
                max: self.max_bound_descriptor_sets,
            });
        }

        Ok(())
    }

    pub fn check_push_constants(&self, size: usize) -> Result<()> {
        if size % 4 != 0 {
            return Err(Error::PushConstantAlignment(size));
        }
        if size > self.max_push_constants_size as usize {
            return Err(Error::PushConstantsTooLarge {
                requested: size,
                max: self.max_push_constants_size,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_limits() -> RayTracingLimits {
        RayTracingLimits {
            handle_size: 32,
            handle_alignment: 32,
            base_alignment: 64,
            max_recursion_depth: 31,
            max_dispatch_invocations: 1 << 30,
            max_extent: [65535 * 1024, 65535 * 1024, 65535 * 64],
            max_push_constants_size: 128,
            max_bound_descriptor_sets: 8,
        }
    }

    #[test]
    fn extent_within_limits() {
        let limits = test_limits();

        assert!(limits.check_extent([1920, 1080, 1]).is_ok());
        assert!(matches!(
            limits.check_extent([1 << 16, 1 << 15, 1]),
            Err(Error::ExtentTooLarge { .. })
        ));
        assert!(matches!(
            limits.check_extent([1, 1, 65535 * 64 + 1]),
            Err(Error::ExtentTooLarge { .. })
        ));
    }

    #[test]
    fn push_constant_checks() {
        let limits = test_limits();

        assert!(limits.check_push_constants(0).is_ok());
        assert!(limits.check_push_constants(128).is_ok());
        assert!(matches!(
            limits.check_push_constants(6),
            Err(Error::PushConstantAlignment(6))
        ));
        assert!(matches!(
            limits.check_push_constants(132),
            Err(Error::PushConstantsTooLarge { .. })
        ));
    }

    #[test]
    fn recursion_depth_check() {
        let limits = test_limits();

        assert!(limits.check_recursion_depth(31).is_ok());
        assert!(matches!(
            limits.check_recursion_depth(32),
            Err(Error::RecursionTooDeep { requested: 32, max: 31 })
        ));
    }

    #[test]
    fn descriptor_set_count_check() {
        let limits = test_limits();

        assert!(limits.check_descriptor_sets(0).is_ok());
        assert!(limits.check_descriptor_sets(8).is_ok());
        assert!(matches!(
            limits.check_descriptor_sets(9),
            Err(Error::TooManyDescriptorSets { set: 8, max: 8 })
        ));
        assert!(limits.check_descriptor_sets(u32::MAX as u64).is_err());
    }

    #[test]
    fn non_power_of_two_alignment_is_rejected() {
        let limits = RayTracingLimits {
            base_alignment: 48,
            ..test_limits()
        };

        assert!(matches!(
            limits.validate(),
            Err(Error::InvalidDeviceLimits(_))
        ));
        assert!(test_limits().validate().is_ok());
    }

    #[test]
    fn limits_from_device_properties() {
        let properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 31,
            max_ray_dispatch_invocation_count: 1 << 30,
            ..Default::default()
        };
        let limits = vk::PhysicalDeviceLimits {
            max_compute_work_group_count: [65535, 65535, 65535],
            max_compute_work_group_size: [1024, 1024, 64],
            max_push_constants_size: 128,
            max_bound_descriptor_sets: 8,
            ..Default::default()
        };

        let limits = RayTracingLimits::new(&properties, &limits);
        assert_eq!(limits, test_limits());
    }

    #[test]
    fn extension_list_is_stable() {
        let extensions = required_device_extensions();

        assert!(extensions.contains(&"VK_KHR_ray_tracing_pipeline"));
        assert!(extensions.contains(&"VK_KHR_acceleration_structure"));
        assert_eq!(extensions, required_device_extensions());
    }
}
