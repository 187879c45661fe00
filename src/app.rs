use std::mem::size_of;
use std::time::Duration;

use ash::vk;
use glam::Mat4;
use winit::event::{DeviceEvent, WindowEvent};

use crate::camera::Camera;
use crate::renderer::Renderer;
use crate::scene::{DrawContext, SceneLighting};
use crate::vulkan::ray_tracing::{RayTracingPipeline, ShaderBindingTable};
use crate::vulkan::{CommandBuffer, Image};
use crate::HybridResult;

/// What the application hands to the renderer every frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameInput {
    pub view: Mat4,
    pub proj: Mat4,
    pub lighting: SceneLighting,
    /// `Some` changes the ray tracing toggle starting with this frame.
    pub ray_tracing_requested: Option<bool>,
}

impl Default for FrameInput {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
            lighting: SceneLighting::default(),
            ray_tracing_requested: None,
        }
    }
}

impl FrameInput {
    /// View and projection of `camera` with the default lighting.
    pub fn from_camera(camera: &Camera, aspect_ratio: f32) -> Self {
        Self {
            view: camera.view_matrix(),
            proj: camera.projection_matrix(aspect_ratio),
            ..Default::default()
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RayTracingPushConstants {
    pub vertex_buffer_address: vk::DeviceAddress,
    pub index_buffer_address: vk::DeviceAddress,
    pub accumulated_frame: u32,
    pub max_accumulated_frames: u32,
}

impl RayTracingPushConstants {
    pub const STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
        vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
            | vk::ShaderStageFlags::MISS_KHR.as_raw(),
    );

    /// Range to declare in the layout of ray tracing pipelines driven by the renderer.
    pub fn range() -> vk::PushConstantRange {
        vk::PushConstantRange {
            stage_flags: Self::STAGES,
            offset: 0,
            size: size_of::<Self>() as u32,
        }
    }
}

/// Pipeline and table used by the ray tracing path. The pipeline layout must be
/// `[ray tracing targets, scene data]` with [`RayTracingPushConstants::range`].
#[derive(Clone, Copy)]
pub struct RayTracingBindings<'a> {
    pub pipeline: &'a RayTracingPipeline,
    pub shader_binding_table: &'a ShaderBindingTable,
    pub vertex_buffer_address: vk::DeviceAddress,
    pub index_buffer_address: vk::DeviceAddress,
}

pub trait RenderApp: Sized {
    fn new(renderer: &mut Renderer) -> HybridResult<Self>;

    fn update(&mut self, _renderer: &mut Renderer, _delta: Duration) -> HybridResult<FrameInput> {
        Ok(FrameInput::default())
    }

    /// Surfaces to rasterize this frame.
    fn fill_draw_context(&mut self, _draw_context: &mut DrawContext) -> HybridResult<()> {
        Ok(())
    }

    /// Runs before the raster pass with the draw image in `GENERAL`.
    fn record_background(&self, cmd: &CommandBuffer, draw_image: &Image) -> HybridResult<()> {
        cmd.clear_color_image(draw_image, vk::ImageLayout::GENERAL, [0.02, 0.02, 0.03, 1.0]);
        Ok(())
    }

    /// `None` keeps the renderer on the raster path.
    fn ray_tracing_resources(&self) -> Option<RayTracingBindings<'_>> {
        None
    }

    fn on_window_event(
        &mut self,
        _renderer: &mut Renderer,
        _event: &WindowEvent,
    ) -> HybridResult<()> {
        Ok(())
    }

    /// Raw device input such as mouse motion, see [`Camera::handle_mouse_motion`].
    fn on_device_event(
        &mut self,
        _renderer: &mut Renderer,
        _event: &DeviceEvent,
    ) -> HybridResult<()> {
        Ok(())
    }

    fn on_recreate_swapchain(&mut self, _renderer: &mut Renderer) -> HybridResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::render_path::{FrameRequest, PathSelector};

    #[test]
    fn moving_the_camera_restarts_accumulation() {
        let mut camera = Camera::default();
        let mut selector = PathSelector::new(4096);
        let request = |input: FrameInput| FrameRequest {
            ray_tracing_requested: true,
            structures_ready: true,
            view: input.view,
        };

        for _ in 0..3 {
            camera.update(Duration::from_millis(16));
            selector.begin_frame(request(FrameInput::from_camera(&camera, 1.5)));
        }
        assert_eq!(selector.accumulated_frames(), 2);

        camera.velocity = Vec3::new(0.0, 0.0, -1.0);
        camera.update(Duration::from_millis(16));
        let input = FrameInput::from_camera(&camera, 1.5);
        assert_ne!(input.view, Camera::default().view_matrix());

        let plan = selector.begin_frame(request(input));
        assert!(plan.restarted);
        assert_eq!(plan.accumulated_frame, 0);
    }

    #[test]
    fn push_constants_fit_the_declared_range() {
        let range = RayTracingPushConstants::range();

        assert_eq!(range.size, 24);
        assert_eq!(range.size % 4, 0);
        assert!(range.stage_flags.contains(vk::ShaderStageFlags::RAYGEN_KHR));
        assert!(range.stage_flags.contains(vk::ShaderStageFlags::CLOSEST_HIT_KHR));
    }
}
