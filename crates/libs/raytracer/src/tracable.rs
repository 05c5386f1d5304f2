use crate::{DescriptorMap, PipelineDesc, RayTracingLimits, Result};

/// Everything needed to record one ray dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracable {
    pub pipeline: PipelineDesc,
    pub extent: [u32; 3],
    pub descriptors: DescriptorMap,
    pub push_constants: Vec<u8>,
}

impl Tracable {
    pub fn new(pipeline: PipelineDesc, width: u32, height: u32) -> Self {
        Self {
            pipeline,
            extent: [width, height, 1],
            descriptors: DescriptorMap::new(),
            push_constants: vec![],
        }
    }

    pub fn depth(self, depth: u32) -> Self {
        let [width, height, _] = self.extent;
        Self {
            extent: [width, height, depth],
            ..self
        }
    }

    pub fn descriptors(self, descriptors: DescriptorMap) -> Self {
        Self {
            descriptors,
            ..self
        }
    }

    pub fn push_constants(self, push_constants: &[u8]) -> Self {
        Self {
            push_constants: push_constants.to_vec(),
            ..self
        }
    }

    /// Checks the dispatch against itself and the device before any object
    /// is created.
    pub fn validate(&self, limits: &RayTracingLimits) -> Result<()> {
        self.pipeline.validate()?;
        limits.check_recursion_depth(self.pipeline.max_recursion_depth)?;
        self.descriptors.validate()?;
        limits.check_descriptor_sets(self.descriptors.set_count())?;
        limits.check_extent(self.extent)?;
        limits.check_push_constants(self.push_constants.len())
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::{self, Handle};

    use super::*;
    use crate::{limits::tests::test_limits, pipeline::tests::test_pipeline, DescriptorResource, Error};

    fn tracable() -> Tracable {
        let mut descriptors = DescriptorMap::new();
        descriptors
            .bind(
                0,
                0,
                DescriptorResource::whole_storage_buffer(vk::Buffer::from_raw(1)),
                vk::ShaderStageFlags::RAYGEN_KHR,
            )
            .unwrap();

        Tracable::new(test_pipeline(), 64, 64)
            .descriptors(descriptors)
            .push_constants(&[0; 16])
    }

    #[test]
    fn valid_tracable_passes() {
        let tracable = tracable();

        assert_eq!(tracable.extent, [64, 64, 1]);
        assert!(tracable.validate(&test_limits()).is_ok());
        assert_eq!(tracable.clone(), tracable);
    }

    #[test]
    fn push_constants_are_checked() {
        let limits = test_limits();

        let tracable = tracable().push_constants(&[0; 6]);
        assert!(matches!(
            tracable.validate(&limits),
            Err(Error::PushConstantAlignment(6))
        ));

        let tracable = tracable.push_constants(&[0; 256]);
        assert!(matches!(
            tracable.validate(&limits),
            Err(Error::PushConstantsTooLarge { requested: 256, .. })
        ));
    }

    #[test]
    fn device_limits_are_checked() {
        let limits = test_limits();

        let tracable = tracable().depth(65535 * 64 + 1);
        assert!(matches!(
            tracable.validate(&limits),
            Err(Error::ExtentTooLarge { .. })
        ));

        let mut tracable = tracable.depth(1);
        tracable.pipeline.max_recursion_depth = 32;
        assert!(matches!(
            tracable.validate(&limits),
            Err(Error::RecursionTooDeep { requested: 32, .. })
        ));
    }

    #[test]
    fn bad_bindings_fail_validation() {
        let mut descriptors = DescriptorMap::new();
        descriptors
            .bind(
                1,
                0,
                DescriptorResource::whole_uniform_buffer(vk::Buffer::from_raw(2)),
                vk::ShaderStageFlags::VERTEX,
            )
            .unwrap();

        let tracable = tracable().descriptors(descriptors);
        assert!(matches!(
            tracable.validate(&test_limits()),
            Err(Error::UnsupportedStages(_))
        ));
    }

    #[test]
    fn far_set_index_is_rejected_before_sets_are_built() {
        let mut descriptors = DescriptorMap::new();
        descriptors
            .bind(
                u32::MAX - 1,
                0,
                DescriptorResource::whole_storage_buffer(vk::Buffer::from_raw(3)),
                vk::ShaderStageFlags::RAYGEN_KHR,
            )
            .unwrap();

        let tracable = tracable().descriptors(descriptors);
        assert!(matches!(
            tracable.validate(&test_limits()),
            Err(Error::TooManyDescriptorSets { set, max: 8 }) if set == (u32::MAX - 1) as u64
        ));
    }
}
