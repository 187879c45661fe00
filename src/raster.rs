use ash::vk;
use glam::Mat4;

use crate::scene::{sorted_opaque_draws, DrawContext, RenderObject};
use crate::vulkan::CommandBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialPass {
    MainColor,
    Transparent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MaterialId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

/// A pipeline plus the descriptor set holding the material's own resources (set 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialInstance {
    pub id: MaterialId,
    pub pipeline: MaterialPipeline,
    pub set: vk::DescriptorSet,
    pub pass: MaterialPass,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GpuDrawPushConstants {
    pub world_matrix: Mat4,
    pub vertex_buffer_address: vk::DeviceAddress,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawStats {
    pub draw_calls: u32,
    pub triangles: u32,
}

/// One indexed draw and the state that has to be rebound before it.
#[derive(Debug, Clone, Copy)]
pub struct DrawStep<'a> {
    pub object: &'a RenderObject,
    pub bind_pipeline: bool,
    pub bind_material: bool,
    pub bind_index_buffer: bool,
}

/// Visible opaque surfaces in material order, then every transparent surface.
pub fn plan_draws<'a>(context: &'a DrawContext, view_proj: &Mat4) -> Vec<DrawStep<'a>> {
    let opaque = sorted_opaque_draws(context, view_proj);
    let objects = opaque
        .into_iter()
        .map(|i| &context.opaque_surfaces[i])
        .chain(context.transparent_surfaces.iter());

    let mut last_pipeline = None;
    let mut last_material = None;
    let mut last_index_buffer = None;

    objects
        .map(|object| {
            let bind_material = last_material != Some(object.material.id);
            let bind_pipeline =
                bind_material && last_pipeline != Some(object.material.pipeline.pipeline);
            let bind_index_buffer = last_index_buffer != Some(object.index_buffer);

            last_material = Some(object.material.id);
            if bind_pipeline {
                last_pipeline = Some(object.material.pipeline.pipeline);
            }
            last_index_buffer = Some(object.index_buffer);

            DrawStep {
                object,
                bind_pipeline,
                bind_material,
                bind_index_buffer,
            }
        })
        .collect()
}

/// Records the draw context inside an active rendering scope and empties it.
///
/// `scene_set` is bound at set 0 of every material pipeline, the material set at set 1.
pub fn record_draws(
    cmd: &CommandBuffer,
    context: &mut DrawContext,
    view_proj: &Mat4,
    scene_set: vk::DescriptorSet,
    extent: vk::Extent2D,
) -> DrawStats {
    let mut stats = DrawStats::default();

    for step in plan_draws(context, view_proj) {
        let object = step.object;
        let material = &object.material;

        if step.bind_pipeline {
            cmd.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, material.pipeline.pipeline);
            cmd.bind_descriptor_sets(
                vk::PipelineBindPoint::GRAPHICS,
                material.pipeline.layout,
                0,
                &[scene_set],
            );
            cmd.set_viewport_and_scissor(extent);
        }
        if step.bind_material {
            cmd.bind_descriptor_sets(
                vk::PipelineBindPoint::GRAPHICS,
                material.pipeline.layout,
                1,
                &[material.set],
            );
        }
        if step.bind_index_buffer {
            cmd.bind_index_buffer(object.index_buffer);
        }

        cmd.push_constant(
            material.pipeline.layout,
            vk::ShaderStageFlags::VERTEX,
            &GpuDrawPushConstants {
                world_matrix: object.transform,
                vertex_buffer_address: object.vertex_buffer_address,
            },
        );
        cmd.draw_indexed(object.index_count, object.first_index);

        stats.draw_calls += 1;
        stats.triangles += object.index_count / 3;
    }

    context.clear();
    stats
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::scene::tests::{camera, material, object};

    fn bindings(steps: &[DrawStep]) -> Vec<(bool, bool, bool)> {
        steps
            .iter()
            .map(|s| (s.bind_pipeline, s.bind_material, s.bind_index_buffer))
            .collect()
    }

    #[test]
    fn state_is_only_rebound_when_it_changes() {
        let mut context = DrawContext::default();
        let a = material(1, 10, MaterialPass::MainColor);
        let b = material(2, 10, MaterialPass::MainColor);
        let c = material(3, 20, MaterialPass::MainColor);

        context.push(object(a, 1, Vec3::ZERO));
        context.push(object(a, 1, Vec3::ZERO));
        context.push(object(b, 1, Vec3::ZERO));
        context.push(object(c, 2, Vec3::ZERO));

        let steps = plan_draws(&context, &camera());

        assert_eq!(
            bindings(&steps),
            vec![
                (true, true, true),
                (false, false, false),
                (false, true, false),
                (true, true, true),
            ]
        );
    }

    #[test]
    fn transparent_surfaces_come_last_and_are_not_culled() {
        let mut context = DrawContext::default();
        let opaque = material(1, 10, MaterialPass::MainColor);
        let transparent = material(0, 10, MaterialPass::Transparent);

        context.push(object(transparent, 5, Vec3::new(100.0, 0.0, 0.0)));
        context.push(object(opaque, 1, Vec3::ZERO));
        context.push(object(opaque, 1, Vec3::new(100.0, 0.0, 0.0)));

        let steps = plan_draws(&context, &camera());

        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].object.material.id, MaterialId(1));
        assert_eq!(steps[1].object.material.pass, MaterialPass::Transparent);
        assert!(steps[1].bind_material);
        assert!(steps[1].bind_index_buffer);
    }

    #[test]
    fn empty_context_plans_nothing() {
        let context = DrawContext::default();
        assert!(plan_draws(&context, &Mat4::IDENTITY).is_empty());
    }
}
