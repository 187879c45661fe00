use std::ffi::CStr;
use std::sync::Arc;

use anyhow::{anyhow, ensure};
use ash::vk;
use log::debug;

use crate::vulkan::{Context, Device, PipelineLayout, ShaderModule};
use crate::HybridResult;

const SHADER_ENTRY_POINT: &CStr = c"main";

#[derive(Clone, Copy)]
pub struct RayTracingShaderStage<'a> {
    pub module: &'a ShaderModule,
    pub stage: vk::ShaderStageFlags,
}

/// Shader group, indices point into the stage list of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RayTracingShaderGroup {
    RayGen {
        shader: u32,
    },
    Miss {
        shader: u32,
    },
    TrianglesHit {
        closest_hit: u32,
        any_hit: Option<u32>,
    },
    ProceduralHit {
        intersection: u32,
        closest_hit: Option<u32>,
        any_hit: Option<u32>,
    },
}

impl RayTracingShaderGroup {
    fn to_vk(self) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
        let unused = vk::SHADER_UNUSED_KHR;
        let info = vk::RayTracingShaderGroupCreateInfoKHR::default()
            .general_shader(unused)
            .closest_hit_shader(unused)
            .any_hit_shader(unused)
            .intersection_shader(unused);

        match self {
            Self::RayGen { shader } | Self::Miss { shader } => info
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(shader),
            Self::TrianglesHit {
                closest_hit,
                any_hit,
            } => info
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .closest_hit_shader(closest_hit)
                .any_hit_shader(any_hit.unwrap_or(unused)),
            Self::ProceduralHit {
                intersection,
                closest_hit,
                any_hit,
            } => info
                .ty(vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP)
                .intersection_shader(intersection)
                .closest_hit_shader(closest_hit.unwrap_or(unused))
                .any_hit_shader(any_hit.unwrap_or(unused)),
        }
    }

    /// Every stage the group references, with the stage kind it must have.
    fn referenced_stages(&self) -> Vec<(u32, vk::ShaderStageFlags)> {
        match *self {
            Self::RayGen { shader } => vec![(shader, vk::ShaderStageFlags::RAYGEN_KHR)],
            Self::Miss { shader } => vec![(shader, vk::ShaderStageFlags::MISS_KHR)],
            Self::TrianglesHit {
                closest_hit,
                any_hit,
            } => std::iter::once((closest_hit, vk::ShaderStageFlags::CLOSEST_HIT_KHR))
                .chain(any_hit.map(|s| (s, vk::ShaderStageFlags::ANY_HIT_KHR)))
                .collect(),
            Self::ProceduralHit {
                intersection,
                closest_hit,
                any_hit,
            } => std::iter::once((intersection, vk::ShaderStageFlags::INTERSECTION_KHR))
                .chain(closest_hit.map(|s| (s, vk::ShaderStageFlags::CLOSEST_HIT_KHR)))
                .chain(any_hit.map(|s| (s, vk::ShaderStageFlags::ANY_HIT_KHR)))
                .collect(),
        }
    }
}

/// Group indices of the pipeline per role, in pipeline order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RayTracingShaderGroupInfo {
    pub raygen: Vec<u32>,
    pub miss: Vec<u32>,
    pub hit: Vec<u32>,
    pub group_count: u32,
}

impl RayTracingShaderGroupInfo {
    pub fn from_groups(groups: &[RayTracingShaderGroup]) -> Self {
        let mut info = Self {
            group_count: groups.len() as u32,
            ..Default::default()
        };

        for (index, group) in groups.iter().enumerate() {
            let index = index as u32;
            match group {
                RayTracingShaderGroup::RayGen { .. } => info.raygen.push(index),
                RayTracingShaderGroup::Miss { .. } => info.miss.push(index),
                RayTracingShaderGroup::TrianglesHit { .. }
                | RayTracingShaderGroup::ProceduralHit { .. } => info.hit.push(index),
            }
        }

        info
    }
}

pub(crate) fn validate_groups(
    stages: &[vk::ShaderStageFlags],
    groups: &[RayTracingShaderGroup],
) -> HybridResult<()> {
    ensure!(
        groups
            .iter()
            .any(|g| matches!(g, RayTracingShaderGroup::RayGen { .. })),
        "Ray tracing pipeline has no raygen group"
    );

    for (group_index, group) in groups.iter().enumerate() {
        for (shader, expected) in group.referenced_stages() {
            let actual = stages.get(shader as usize).ok_or_else(|| {
                anyhow!(
                    "Group {group_index} references shader {shader} but only {} stages exist",
                    stages.len()
                )
            })?;
            ensure!(
                *actual == expected,
                "Group {group_index} expects shader {shader} to be {expected:?}, got {actual:?}"
            );
        }
    }

    Ok(())
}

pub struct RayTracingPipeline {
    device: Arc<Device>,
    pub(crate) inner: vk::Pipeline,
    pub layout: PipelineLayout,
    pub group_info: RayTracingShaderGroupInfo,
}

impl RayTracingPipeline {
    pub fn new(
        context: &Context,
        layout: PipelineLayout,
        stages: &[RayTracingShaderStage],
        groups: &[RayTracingShaderGroup],
        max_ray_recursion_depth: u32,
    ) -> HybridResult<Self> {
        let ray_tracing = context.ray_tracing()?;

        let stage_kinds = stages.iter().map(|s| s.stage).collect::<Vec<_>>();
        validate_groups(&stage_kinds, groups)?;
        ensure!(
            max_ray_recursion_depth <= ray_tracing.pipeline_properties.max_ray_recursion_depth,
            "Ray recursion depth {max_ray_recursion_depth} exceeds the device limit of {}",
            ray_tracing.pipeline_properties.max_ray_recursion_depth
        );

        let stage_infos = stages
            .iter()
            .map(|s| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(s.stage)
                    .module(s.module.inner)
                    .name(SHADER_ENTRY_POINT)
            })
            .collect::<Vec<_>>();
        let group_infos = groups.iter().map(|g| g.to_vk()).collect::<Vec<_>>();

        let pipe_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .layout(layout.inner)
            .stages(&stage_infos)
            .groups(&group_infos)
            .max_pipeline_ray_recursion_depth(max_ray_recursion_depth);

        let inner = unsafe {
            ray_tracing.pipeline_fn.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipe_info),
                None,
            )
        }
        .map_err(|e| anyhow!("Failed to create ray tracing pipeline: {e:?}"))?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Ray tracing pipeline creation returned no pipeline"))?;

        let group_info = RayTracingShaderGroupInfo::from_groups(groups);
        debug!("Created ray tracing pipeline with groups {group_info:?}");

        Ok(Self {
            device: context.device.clone(),
            inner,
            layout,
            group_info,
        })
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

    fn stages() -> Vec<vk::ShaderStageFlags> {
        vec![
            vk::ShaderStageFlags::RAYGEN_KHR,
            vk::ShaderStageFlags::MISS_KHR,
            vk::ShaderStageFlags::MISS_KHR,
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            vk::ShaderStageFlags::INTERSECTION_KHR,
        ]
    }

    fn groups() -> Vec<RayTracingShaderGroup> {
        vec![
            RayTracingShaderGroup::RayGen { shader: 0 },
            RayTracingShaderGroup::Miss { shader: 1 },
            RayTracingShaderGroup::Miss { shader: 2 },
            RayTracingShaderGroup::TrianglesHit {
                closest_hit: 3,
                any_hit: None,
            },
            RayTracingShaderGroup::ProceduralHit {
                intersection: 4,
                closest_hit: Some(3),
                any_hit: None,
            },
        ]
    }

    #[test]
    fn group_indices_are_split_by_role() {
        let info = RayTracingShaderGroupInfo::from_groups(&groups());

        assert_eq!(info.raygen, vec![0]);
        assert_eq!(info.miss, vec![1, 2]);
        assert_eq!(info.hit, vec![3, 4]);
        assert_eq!(info.group_count, 5);
    }

    #[test]
    fn matching_stages_validate() {
        assert!(validate_groups(&stages(), &groups()).is_ok());
    }

    #[test]
    fn out_of_range_shader_is_rejected() {
        let mut groups = groups();
        groups.push(RayTracingShaderGroup::Miss { shader: 9 });

        assert!(validate_groups(&stages(), &groups).is_err());
    }

    #[test]
    fn wrong_stage_kind_is_rejected() {
        let groups = vec![
            RayTracingShaderGroup::RayGen { shader: 0 },
            RayTracingShaderGroup::TrianglesHit {
                closest_hit: 1,
                any_hit: None,
            },
        ];

        assert!(validate_groups(&stages(), &groups).is_err());
    }

    #[test]
    fn pipeline_without_raygen_is_rejected() {
        let groups = vec![RayTracingShaderGroup::Miss { shader: 1 }];
        assert!(validate_groups(&stages(), &groups).is_err());
    }

    #[test]
    fn procedural_group_leaves_general_shader_unused() {
        let info = RayTracingShaderGroup::ProceduralHit {
            intersection: 4,
            closest_hit: Some(3),
            any_hit: None,
        }
        .to_vk();

        assert_eq!(info.ty, vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP);
        assert_eq!(info.general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(info.intersection_shader, 4);
        assert_eq!(info.closest_hit_shader, 3);
        assert_eq!(info.any_hit_shader, vk::SHADER_UNUSED_KHR);
    }
}
