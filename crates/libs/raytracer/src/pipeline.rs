use std::sync::Arc;

use ash::vk;
use vulkan::{
    Context, DescriptorSetLayout, PipelineLayout, RayTracingPipeline,
    RayTracingPipelineCreateInfo, RayTracingShaderCreateInfo, RayTracingShaderGroup,
};

use crate::{descriptor::SetSchema, Error, Result, RAY_TRACING_STAGES};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub code: Arc<[u8]>,
    pub entry_point: String,
}

impl ShaderStage {
    pub fn new(stage: vk::ShaderStageFlags, code: impl Into<Arc<[u8]>>) -> Self {
        Self {
            stage,
            code: code.into(),
            entry_point: "main".to_string(),
        }
    }

    pub fn entry_point(self, entry_point: &str) -> Self {
        Self {
            entry_point: entry_point.to_string(),
            ..self
        }
    }
}

/// Shader stages and groups of a ray tracing pipeline. Hashed by value, so
/// the same description always resolves to the same cached pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineDesc {
    pub stages: Vec<ShaderStage>,
    pub groups: Vec<RayTracingShaderGroup>,
    pub max_recursion_depth: u32,
}

impl PipelineDesc {
    pub fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(Error::NoShaderGroups);
        }

        for (index, stage) in self.stages.iter().enumerate() {
            if stage.stage.as_raw().count_ones() != 1 || !RAY_TRACING_STAGES.contains(stage.stage)
            {
                return Err(Error::InvalidStage {
                    stage: index,
                    flags: stage.stage,
                });
            }
        }

        let raygen_count = self
            .groups
            .iter()
            .filter(|g| matches!(g, RayTracingShaderGroup::RayGen { .. }))
            .count();
        if raygen_count != 1 {
            return Err(Error::RaygenCount(raygen_count));
        }

        self.groups
            .iter()
            .enumerate()
            .try_for_each(|(index, group)| self.validate_group(index, group))
    }

    fn validate_group(&self, index: usize, group: &RayTracingShaderGroup) -> Result<()> {
        use RayTracingShaderGroup::*;

        let invalid = |reason: String| Error::InvalidGroup {
            group: index,
            reason,
        };
        let check = |stage: u32, expected: vk::ShaderStageFlags| -> Result<()> {
            let actual = self
                .stages
                .get(stage as usize)
                .ok_or_else(|| {
                    invalid(format!(
                        "stage {stage} is out of range ({} stages)",
                        self.stages.len()
                    ))
                })?
                .stage;
            if actual != expected {
                return Err(invalid(format!(
                    "stage {stage} is {actual:?}, expected {expected:?}"
                )));
            }
            Ok(())
        };
        let check_opt = |stage: Option<u32>, expected| stage.map_or(Ok(()), |s| check(s, expected));

        match *group {
            RayGen { general } => check(general, vk::ShaderStageFlags::RAYGEN_KHR),
            Miss { general } => check(general, vk::ShaderStageFlags::MISS_KHR),
            Callable { general } => check(general, vk::ShaderStageFlags::CALLABLE_KHR),
            TrianglesHit {
                closest_hit,
                any_hit,
            } => {
                if closest_hit.is_none() && any_hit.is_none() {
                    return Err(invalid("hit group has no shader".to_string()));
                }
                check_opt(closest_hit, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?;
                check_opt(any_hit, vk::ShaderStageFlags::ANY_HIT_KHR)
            }
            ProceduralHit {
                intersection,
                closest_hit,
                any_hit,
            } => {
                check(intersection, vk::ShaderStageFlags::INTERSECTION_KHR)?;
                check_opt(closest_hit, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?;
                check_opt(any_hit, vk::ShaderStageFlags::ANY_HIT_KHR)
            }
        }
    }
}

/// Pipeline cache key. Two dispatches share a pipeline only if their
/// shaders, set layouts and push constant range all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub desc: PipelineDesc,
    pub set_schemas: Vec<SetSchema>,
    pub push_constant_size: u32,
}

/// A ray tracing pipeline together with the layout objects it was built with.
pub struct TracePipeline {
    pub(crate) pipeline: RayTracingPipeline,
    pub(crate) layout: PipelineLayout,
    _set_layouts: Vec<DescriptorSetLayout>,
}

impl TracePipeline {
    pub fn new(context: &Context, key: &PipelineKey) -> Result<Self> {
        let set_layouts = key
            .set_schemas
            .iter()
            .map(|schema| schema.create_layout(context))
            .collect::<Result<Vec<_>>>()?;
        let set_layout_refs = set_layouts.iter().collect::<Vec<_>>();

        let push_constant_ranges = if key.push_constant_size > 0 {
            vec![vk::PushConstantRange::builder()
                .stage_flags(RAY_TRACING_STAGES)
                .offset(0)
                .size(key.push_constant_size)
                .build()]
        } else {
            vec![]
        };

        let layout = context.create_pipeline_layout(&set_layout_refs, &push_constant_ranges)?;

        let stages = key
            .desc
            .stages
            .iter()
            .map(|s| RayTracingShaderCreateInfo {
                source: &s.code,
                stage: s.stage,
                entry_point: &s.entry_point,
            })
            .collect::<Vec<_>>();

        let pipeline = context.create_ray_tracing_pipeline(
            &layout,
            RayTracingPipelineCreateInfo {
                stages: &stages,
                groups: &key.desc.groups,
                max_ray_recursion_depth: key.desc.max_recursion_depth,
            },
        )?;
        log::debug!(
            "Created ray tracing pipeline {:?} ({} stages, {} groups, {} sets)",
            pipeline.handle(),
            stages.len(),
            key.desc.groups.len(),
            set_layouts.len()
        );

        Ok(Self {
            pipeline,
            layout,
            _set_layouts: set_layouts,
        })
    }

    pub fn pipeline(&self) -> &RayTracingPipeline {
        &self.pipeline
    }

    pub fn layout(&self) -> &PipelineLayout {
        &self.layout
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const SPIRV: [u8; 4] = [0x03, 0x02, 0x23, 0x07];

    fn stage(flags: vk::ShaderStageFlags) -> ShaderStage {
        ShaderStage::new(flags, SPIRV.to_vec())
    }

    pub(crate) fn test_pipeline() -> PipelineDesc {
        PipelineDesc {
            stages: vec![
                stage(vk::ShaderStageFlags::RAYGEN_KHR),
                stage(vk::ShaderStageFlags::MISS_KHR),
                stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR),
            ],
            groups: vec![
                RayTracingShaderGroup::RayGen { general: 0 },
                RayTracingShaderGroup::Miss { general: 1 },
                RayTracingShaderGroup::TrianglesHit {
                    closest_hit: Some(2),
                    any_hit: None,
                },
            ],
            max_recursion_depth: 1,
        }
    }

    fn invalid_group(desc: &PipelineDesc) -> Option<usize> {
        match desc.validate() {
            Err(Error::InvalidGroup { group, .. }) => Some(group),
            _ => None,
        }
    }

    #[test]
    fn valid_pipeline_passes() {
        assert!(test_pipeline().validate().is_ok());
        assert_eq!(test_pipeline(), test_pipeline());
    }

    #[test]
    fn group_counts_are_checked() {
        let mut desc = test_pipeline();
        desc.groups.clear();
        assert!(matches!(desc.validate(), Err(Error::NoShaderGroups)));

        let mut desc = test_pipeline();
        desc.groups.remove(0);
        assert!(matches!(desc.validate(), Err(Error::RaygenCount(0))));

        let mut desc = test_pipeline();
        desc.groups.push(RayTracingShaderGroup::RayGen { general: 0 });
        assert!(matches!(desc.validate(), Err(Error::RaygenCount(2))));
    }

    #[test]
    fn group_stage_references_are_checked() {
        let mut desc = test_pipeline();
        desc.groups[1] = RayTracingShaderGroup::Miss { general: 7 };
        assert_eq!(invalid_group(&desc), Some(1));

        // Miss group pointing at the closest hit stage
        let mut desc = test_pipeline();
        desc.groups[1] = RayTracingShaderGroup::Miss { general: 2 };
        assert_eq!(invalid_group(&desc), Some(1));

        let mut desc = test_pipeline();
        desc.groups[2] = RayTracingShaderGroup::TrianglesHit {
            closest_hit: None,
            any_hit: None,
        };
        assert_eq!(invalid_group(&desc), Some(2));

        let mut desc = test_pipeline();
        desc.groups[2] = RayTracingShaderGroup::ProceduralHit {
            intersection: 2,
            closest_hit: None,
            any_hit: None,
        };
        assert_eq!(invalid_group(&desc), Some(2));
    }

    #[test]
    fn stage_flags_must_be_one_ray_tracing_stage() {
        let mut desc = test_pipeline();
        desc.stages[1] = stage(vk::ShaderStageFlags::MISS_KHR | vk::ShaderStageFlags::RAYGEN_KHR);
        assert!(matches!(
            desc.validate(),
            Err(Error::InvalidStage { stage: 1, .. })
        ));

        let mut desc = test_pipeline();
        desc.stages[0] = stage(vk::ShaderStageFlags::COMPUTE);
        assert!(matches!(
            desc.validate(),
            Err(Error::InvalidStage { stage: 0, .. })
        ));
    }

    #[test]
    fn entry_point_is_part_of_identity() {
        let mut other = test_pipeline();
        other.stages[0] = stage(vk::ShaderStageFlags::RAYGEN_KHR).entry_point("trace");

        assert_eq!(test_pipeline().stages[0].entry_point, "main");
        assert_ne!(test_pipeline(), other);
    }
}
