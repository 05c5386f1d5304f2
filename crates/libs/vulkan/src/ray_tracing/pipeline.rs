use std::{ffi::CString, sync::Arc};

use anyhow::Result;
use ash::vk;

use crate::{device::Device, utils::read_shader_from_bytes, Context};

use crate::{PipelineLayout, RayTracingContext};

#[derive(Debug, Clone, Copy)]
pub struct RayTracingPipelineCreateInfo<'a> {
    pub stages: &'a [RayTracingShaderCreateInfo<'a>],
    pub groups: &'a [RayTracingShaderGroup],
    pub max_ray_recursion_depth: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RayTracingShaderCreateInfo<'a> {
    pub source: &'a [u8],
    pub stage: vk::ShaderStageFlags,
    pub entry_point: &'a str,
}

/// A shader group, indexing into the stages of the pipeline it is declared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RayTracingShaderGroup {
    RayGen {
        general: u32,
    },
    Miss {
        general: u32,
    },
    Callable {
        general: u32,
    },
    TrianglesHit {
        closest_hit: Option<u32>,
        any_hit: Option<u32>,
    },
    ProceduralHit {
        intersection: u32,
        closest_hit: Option<u32>,
        any_hit: Option<u32>,
    },
}

/// Which shader binding table region a group's record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderGroupKind {
    RayGen,
    Hit,
    Miss,
    Callable,
}

impl RayTracingShaderGroup {
    pub fn kind(&self) -> ShaderGroupKind {
        match self {
            Self::RayGen { .. } => ShaderGroupKind::RayGen,
            Self::Miss { .. } => ShaderGroupKind::Miss,
            Self::Callable { .. } => ShaderGroupKind::Callable,
            Self::TrianglesHit { .. } | Self::ProceduralHit { .. } => ShaderGroupKind::Hit,
        }
    }

    fn create_info(&self) -> vk::RayTracingShaderGroupCreateInfoKHR {
        let unused = |index: Option<u32>| index.unwrap_or(vk::SHADER_UNUSED_KHR);

        let group = vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(vk::SHADER_UNUSED_KHR)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR);

        match *self {
            Self::RayGen { general } | Self::Miss { general } | Self::Callable { general } => {
                group.general_shader(general)
            }
            Self::TrianglesHit {
                closest_hit,
                any_hit,
            } => group
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .closest_hit_shader(unused(closest_hit))
                .any_hit_shader(unused(any_hit)),
            Self::ProceduralHit {
                intersection,
                closest_hit,
                any_hit,
            } => group
                .ty(vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP)
                .intersection_shader(intersection)
                .closest_hit_shader(unused(closest_hit))
                .any_hit_shader(unused(any_hit)),
        }
        .build()
    }
}

struct ShaderModule {
    device: Arc<Device>,
    inner: vk::ShaderModule,
}

impl ShaderModule {
    fn from_bytes(device: Arc<Device>, source: &[u8]) -> Result<Self> {
        let code = read_shader_from_bytes(source)?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let inner = unsafe { device.inner.create_shader_module(&create_info, None)? };

        Ok(Self { device, inner })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_shader_module(self.inner, None) };
    }
}

pub struct RayTracingPipeline {
    device: Arc<Device>,
    ray_tracing: Arc<RayTracingContext>,
    pub(crate) inner: vk::Pipeline,
    group_kinds: Vec<ShaderGroupKind>,
}

impl RayTracingPipeline {
    pub(crate) fn new(
        device: Arc<Device>,
        ray_tracing: Arc<RayTracingContext>,
        layout: &PipelineLayout,
        create_info: RayTracingPipelineCreateInfo,
    ) -> Result<Self> {
        // Modules only need to outlive pipeline creation
        let modules = create_info
            .stages
            .iter()
            .map(|shader| ShaderModule::from_bytes(device.clone(), shader.source))
            .collect::<Result<Vec<_>>>()?;
        let entry_point_names = create_info
            .stages
            .iter()
            .map(|shader| CString::new(shader.entry_point))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = create_info
            .stages
            .iter()
            .zip(modules.iter().zip(entry_point_names.iter()))
            .map(|(shader, (module, name))| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(shader.stage)
                    .module(module.inner)
                    .name(name)
                    .build()
            })
            .collect::<Vec<_>>();
        let groups = create_info
            .groups
            .iter()
            .map(RayTracingShaderGroup::create_info)
            .collect::<Vec<_>>();

        let pipe_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .layout(layout.inner)
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(create_info.max_ray_recursion_depth);

        let inner = unsafe {
            ray_tracing
                .pipeline_fn
                .create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    vk::PipelineCache::null(),
                    std::slice::from_ref(&pipe_info),
                    None,
                )?[0]
        };

        Ok(Self {
            device,
            ray_tracing,
            inner,
            group_kinds: create_info.groups.iter().map(|g| g.kind()).collect(),
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.inner
    }

    /// Group kinds in declaration order.
    pub fn group_kinds(&self) -> &[ShaderGroupKind] {
        &self.group_kinds
    }

    /// Opaque handles of every group, `shaderGroupHandleSize` bytes each, in
    /// declaration order.
    pub fn get_shader_group_handles(&self) -> Result<Vec<u8>> {
        let group_count = self.group_kinds.len() as u32;

        let handles = unsafe {
            self.ray_tracing
                .pipeline_fn
                .get_ray_tracing_shader_group_handles(
                    self.inner,
                    0,
                    group_count,
                    self.ray_tracing.handle_data_size(group_count),
                )?
        };

        Ok(handles)
    }
}

impl Context {
    pub fn create_ray_tracing_pipeline(
        &self,
        layout: &PipelineLayout,
        create_info: RayTracingPipelineCreateInfo,
    ) -> Result<RayTracingPipeline> {
        let ray_tracing = self.ray_tracing.clone().ok_or_else(|| {
            anyhow::anyhow!("Cannot create a ray tracing pipeline when ray tracing is not enabled")
        })?;

        RayTracingPipeline::new(self.device.clone(), ray_tracing, layout, create_info)
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_pipeline(self.inner, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_groups_share_a_region() {
        let triangles = RayTracingShaderGroup::TrianglesHit {
            closest_hit: Some(2),
            any_hit: None,
        };
        let procedural = RayTracingShaderGroup::ProceduralHit {
            intersection: 3,
            closest_hit: None,
            any_hit: Some(4),
        };

        assert_eq!(triangles.kind(), ShaderGroupKind::Hit);
        assert_eq!(procedural.kind(), ShaderGroupKind::Hit);
        assert_eq!(
            RayTracingShaderGroup::Callable { general: 0 }.kind(),
            ShaderGroupKind::Callable
        );
    }

    #[test]
    fn unused_shaders_are_marked() {
        let info = RayTracingShaderGroup::TrianglesHit {
            closest_hit: Some(2),
            any_hit: None,
        }
        .create_info();

        assert_eq!(info.ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(info.closest_hit_shader, 2);
        assert_eq!(info.any_hit_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(info.general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(info.intersection_shader, vk::SHADER_UNUSED_KHR);
    }
}
