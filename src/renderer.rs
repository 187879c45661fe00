use std::mem::size_of;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use ash::vk;
use glam::{Mat4, UVec2};
use gpu_allocator::MemoryLocation;
use log::{debug, info, warn};
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowAttributes};

use crate::app::{RayTracingBindings, RayTracingPushConstants, RenderApp};
use crate::deletion_queue::DeletionQueue;
use crate::in_flight_frames::InFlightFrames;
use crate::raster::{record_draws, DrawStats};
use crate::render_path::{FrameRequest, PathSelector, RenderPath};
use crate::scene::{DrawContext, GpuSceneData};
use crate::stats::FrameStats;
use crate::vulkan::ray_tracing::{
    AccelerationBuildOrchestrator, AccelerationStructure, GeometryDescriptor, InstanceTable,
};
use crate::vulkan::{
    CommandBuffer, Context, DescriptorAllocator, DescriptorSet, DescriptorSetLayout, ImageAndView,
    ImageBarrier, PoolSizeRatio, SemaphoreSubmitInfo, Swapchain, WriteDescriptorSet,
    WriteDescriptorSetKind,
};
use crate::HybridResult;

pub const DRAW_IMAGE_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug, Default)]
pub enum FeatureValue {
    #[default]
    NotUsed,
    Wanted,
    Needed,
}

#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub name: String,
    pub start_size: UVec2,

    pub ray_tracing: FeatureValue,
    pub validation_layers: FeatureValue,

    pub num_frames_in_flight: usize,
    pub fence_timeout: Duration,
    pub max_accumulated_frames: u32,
    pub descriptor_sets_per_pool: u32,
    pub ray_tracing_enabled_at_start: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            name: "No Name".to_string(),
            start_size: UVec2 { x: 1080, y: 720 },
            ray_tracing: FeatureValue::NotUsed,
            validation_layers: FeatureValue::NotUsed,
            num_frames_in_flight: 2,
            fence_timeout: Duration::from_secs(10),
            max_accumulated_frames: 4096,
            descriptor_sets_per_pool: 1000,
            ray_tracing_enabled_at_start: false,
        }
    }
}

/// Images every frame renders into before the result is blitted to the swapchain.
pub struct RenderTargets {
    pub draw: ImageAndView,
    pub depth: ImageAndView,
    /// Running sum of the ray traced samples, `GENERAL` for its whole lifetime.
    pub accumulation: Option<ImageAndView>,
}

impl RenderTargets {
    fn new(context: &Context, extent: vk::Extent2D) -> HybridResult<Self> {
        debug!("Creating render targets of {}x{}", extent.width, extent.height);

        let draw = context.create_image_and_view(
            vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            DRAW_IMAGE_FORMAT,
            extent.width,
            extent.height,
            false,
        )?;
        let depth = context.create_image_and_view(
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            context.physical_device.depth_format,
            extent.width,
            extent.height,
            true,
        )?;
        let accumulation = context
            .ray_tracing
            .is_some()
            .then(|| {
                context.create_storage_image(
                    vk::Format::R32G32B32A32_SFLOAT,
                    extent,
                    vk::ImageUsageFlags::empty(),
                )
            })
            .transpose()?;

        Ok(Self {
            draw,
            depth,
            accumulation,
        })
    }
}

/// Descriptor set 0 of the ray tracing pipeline: top level structure, output and accumulation.
struct RayTracingTargets {
    set: Option<DescriptorSet>,
    descriptors: DescriptorAllocator,
    layout: DescriptorSetLayout,
}

impl RayTracingTargets {
    fn new(context: &Context) -> HybridResult<Self> {
        let layout = context.create_descriptor_set_layout(&[
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(1)
                .stage_flags(
                    vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                ),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR),
            vk::DescriptorSetLayoutBinding::default()
                .binding(2)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR),
        ])?;
        let descriptors = context.create_descriptor_allocator(
            1,
            vec![
                PoolSizeRatio {
                    ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                    ratio: 1.0,
                },
                PoolSizeRatio {
                    ty: vk::DescriptorType::STORAGE_IMAGE,
                    ratio: 2.0,
                },
            ],
        )?;

        Ok(Self {
            set: None,
            descriptors,
            layout,
        })
    }

    /// Must not be called while a frame using the set is in flight.
    fn write(
        &mut self,
        top_level: &AccelerationStructure,
        targets: &RenderTargets,
    ) -> HybridResult<()> {
        let accumulation = targets
            .accumulation
            .as_ref()
            .context("Ray tracing targets require an accumulation image")?;

        if self.set.is_none() {
            self.set = Some(self.descriptors.allocate(&self.layout)?);
        }
        let set = self.set.as_ref().context("Ray tracing descriptor set missing")?;

        set.update(&[
            WriteDescriptorSet {
                binding: 0,
                kind: WriteDescriptorSetKind::AccelerationStructure {
                    acceleration_structure: top_level,
                },
            },
            WriteDescriptorSet {
                binding: 1,
                kind: WriteDescriptorSetKind::StorageImage {
                    view: &targets.draw.view,
                    layout: vk::ImageLayout::GENERAL,
                },
            },
            WriteDescriptorSet {
                binding: 2,
                kind: WriteDescriptorSetKind::StorageImage {
                    view: &accumulation.view,
                    layout: vk::ImageLayout::GENERAL,
                },
            },
        ]);

        Ok(())
    }
}

/// Fields drop top to bottom. Every GPU resource goes before the context, the window last.
pub struct Renderer {
    pub frame_stats: FrameStats,
    pub draw_context: DrawContext,
    selector: PathSelector,
    ray_tracing_enabled: bool,
    last_frame: Instant,
    frames: InFlightFrames,
    orchestrator: AccelerationBuildOrchestrator,
    deletion_queue: DeletionQueue,
    ray_tracing_targets: Option<RayTracingTargets>,
    pub scene_data_layout: DescriptorSetLayout,
    pub targets: RenderTargets,
    draw_image_layout: vk::ImageLayout,
    pub swapchain: Swapchain,
    config: RendererConfig,
    pub context: Context,
    pub window: Window,
}

impl Renderer {
    pub fn new(event_loop: &ActiveEventLoop, config: &RendererConfig) -> HybridResult<Self> {
        info!("Creating renderer");

        let window = event_loop.create_window(
            WindowAttributes::default()
                .with_title(&config.name)
                .with_inner_size(PhysicalSize::new(config.start_size.x, config.start_size.y))
                .with_resizable(true),
        )?;

        let context = Context::new(&window, &window, config)?;
        if config.ray_tracing != FeatureValue::NotUsed && context.ray_tracing.is_none() {
            warn!("Ray tracing is not supported by the selected device, rasterizing only");
        }

        let size = window.inner_size();
        let swapchain = Swapchain::new(&context, size.width, size.height)?;
        let targets = RenderTargets::new(&context, swapchain.extent())?;

        let mut scene_stages = vk::ShaderStageFlags::ALL_GRAPHICS;
        if context.ray_tracing.is_some() {
            scene_stages |= vk::ShaderStageFlags::RAYGEN_KHR
                | vk::ShaderStageFlags::CLOSEST_HIT_KHR
                | vk::ShaderStageFlags::MISS_KHR;
        }
        let scene_data_layout = context.create_descriptor_set_layout(&[
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(scene_stages),
        ])?;

        let ray_tracing_targets = context
            .ray_tracing
            .is_some()
            .then(|| RayTracingTargets::new(&context))
            .transpose()?;

        let frames = InFlightFrames::new(
            &context,
            config.num_frames_in_flight,
            config.descriptor_sets_per_pool,
        )?;

        Ok(Self {
            frame_stats: FrameStats::new(),
            draw_context: DrawContext::default(),
            selector: PathSelector::new(config.max_accumulated_frames),
            ray_tracing_enabled: config.ray_tracing_enabled_at_start,
            last_frame: Instant::now(),
            frames,
            orchestrator: AccelerationBuildOrchestrator::new(),
            deletion_queue: DeletionQueue::new("engine"),
            ray_tracing_targets,
            scene_data_layout,
            targets,
            draw_image_layout: vk::ImageLayout::UNDEFINED,
            swapchain,
            config: config.clone(),
            context,
            window,
        })
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn supports_ray_tracing(&self) -> bool {
        self.context.ray_tracing.is_some()
    }

    pub fn is_ray_tracing_enabled(&self) -> bool {
        self.ray_tracing_enabled
    }

    /// Read by the next frame. Ignored while the device has no ray tracing support.
    pub fn set_ray_tracing_enabled(&mut self, enabled: bool) {
        if enabled != self.ray_tracing_enabled {
            debug!("Ray tracing toggled {}", if enabled { "on" } else { "off" });
        }
        self.ray_tracing_enabled = enabled;
    }

    pub fn accumulated_frames(&self) -> i64 {
        self.selector.accumulated_frames()
    }

    pub fn acceleration_structures(&self) -> &AccelerationBuildOrchestrator {
        &self.orchestrator
    }

    /// Layout of descriptor set 0 of ray tracing pipelines. Set 1 is [`Self::scene_data_layout`].
    pub fn ray_tracing_descriptor_layout(&self) -> Option<&DescriptorSetLayout> {
        self.ray_tracing_targets.as_ref().map(|t| &t.layout)
    }

    /// Keeps `resource` alive until the renderer knows the GPU no longer uses it.
    pub fn defer_destroy<T: 'static>(&mut self, label: &'static str, resource: T) {
        self.deletion_queue.push(label, resource);
    }

    /// Builds the bottom level structures of `geometries` and the top level structure over
    /// `instances`, replacing the previous ones.
    pub fn build_acceleration_structures(
        &mut self,
        geometries: &[GeometryDescriptor],
        instances: &InstanceTable,
    ) -> HybridResult<()> {
        self.context.ray_tracing()?;
        self.context.device_wait_idle()?;

        self.orchestrator.build(
            &self.context,
            geometries,
            instances,
            &mut self.deletion_queue,
        )?;
        self.deletion_queue.flush();

        self.write_ray_tracing_set()?;
        self.selector.invalidate();

        Ok(())
    }

    fn write_ray_tracing_set(&mut self) -> HybridResult<()> {
        let (Some(rt_targets), Some(top_level)) =
            (self.ray_tracing_targets.as_mut(), self.orchestrator.top_level())
        else {
            return Ok(());
        };

        rt_targets.write(top_level, &self.targets)
    }

    pub fn recreate_swapchain(&mut self, width: u32, height: u32) -> HybridResult<()> {
        debug!("Recreating the swapchain");

        self.wait_for_gpu()?;

        self.swapchain.resize(&self.context, width, height)?;
        self.targets = RenderTargets::new(&self.context, self.swapchain.extent())?;
        self.draw_image_layout = vk::ImageLayout::UNDEFINED;

        self.write_ray_tracing_set()?;
        self.selector.invalidate();

        Ok(())
    }

    pub fn wait_for_gpu(&self) -> HybridResult<()> {
        self.context.device_wait_idle()
    }

    /// Renders one frame. Returns whether the swapchain is stale and must be recreated.
    pub fn draw<A: RenderApp>(&mut self, app: &mut A) -> HybridResult<bool> {
        let now = Instant::now();
        let delta = now - self.last_frame;
        self.last_frame = now;
        self.frame_stats.tick(delta);

        let timeout = self.config.fence_timeout;
        self.frames.next();
        let frame = self.frames.current_mut();
        frame.wait_and_reclaim(timeout)?;
        if let Some(gpu_time) = frame.gpu_frame_time()? {
            self.frame_stats.set_gpu_time(gpu_time);
        }

        let update_start = Instant::now();
        let input = app.update(self, delta)?;
        app.fill_draw_context(&mut self.draw_context)?;
        self.frame_stats.set_scene_update_time(update_start.elapsed());
        if let Some(enabled) = input.ray_tracing_requested {
            self.set_ray_tracing_enabled(enabled);
        }

        let bindings = app.ray_tracing_resources();
        let plan = self.selector.begin_frame(FrameRequest {
            ray_tracing_requested: self.ray_tracing_enabled && self.supports_ray_tracing(),
            structures_ready: self.orchestrator.is_ready()
                && bindings.is_some()
                && self
                    .ray_tracing_targets
                    .as_ref()
                    .is_some_and(|t| t.set.is_some()),
            view: input.view,
        });

        let frame = self.frames.current();
        let acquired = match self
            .swapchain
            .acquire_next_image(timeout, &frame.image_available_semaphore)
        {
            Ok(acquired) => acquired,
            Err(err) => match err.downcast_ref::<vk::Result>() {
                Some(&vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    self.draw_context.clear();
                    return Ok(true);
                }
                _ => return Err(err.context("Failed to acquire the next swapchain image")),
            },
        };

        let draw_extent = self.draw_extent();
        let frame = self.frames.current_mut();
        frame.begin_recording()?;

        let scene_data = GpuSceneData::new(input.view, input.proj, &input.lighting);
        let scene_buffer = self.context.create_buffer(
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            size_of::<GpuSceneData>() as _,
        )?;
        scene_buffer.copy_data_to_buffer(std::slice::from_ref(&scene_data))?;
        let scene_set = frame.descriptors.allocate(&self.scene_data_layout)?;
        scene_set.update(&[WriteDescriptorSet {
            binding: 0,
            kind: WriteDescriptorSetKind::UniformBuffer {
                buffer: &scene_buffer,
            },
        }]);
        frame.deletion_queue.push("scene data buffer", scene_buffer);

        let cmd = &frame.command_buffer;
        let (draw_layout, src_stage_mask) =
            match (plan.path, bindings, self.ray_tracing_targets.as_ref()) {
                (RenderPath::RayTracing, Some(bindings), Some(rt_targets)) => {
                    let rt_set = rt_targets
                        .set
                        .as_ref()
                        .context("Ray tracing descriptor set missing")?;
                    let stage = record_ray_tracing(
                        cmd,
                        &self.targets,
                        self.draw_image_layout,
                        &bindings,
                        [rt_set.handle(), scene_set.handle()],
                        RayTracingPushConstants {
                            vertex_buffer_address: bindings.vertex_buffer_address,
                            index_buffer_address: bindings.index_buffer_address,
                            accumulated_frame: plan.accumulated_frame.max(0) as u32,
                            max_accumulated_frames: self.config.max_accumulated_frames,
                        },
                        plan.dispatch_rays.then_some(draw_extent),
                    )?;
                    (vk::ImageLayout::GENERAL, stage)
                }
                _ => {
                    begin_background(cmd, &self.targets);
                    app.record_background(cmd, &self.targets.draw.image)?;

                    let draw_start = Instant::now();
                    let draws = record_raster(
                        cmd,
                        &self.targets,
                        &mut self.draw_context,
                        &(input.proj * input.view),
                        scene_set.handle(),
                        draw_extent,
                    );
                    self.frame_stats.set_mesh_draw_time(draw_start.elapsed());
                    self.frame_stats.set_draws(draws);

                    (
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    )
                }
            };
        self.draw_context.clear();

        let swapchain_image = &self.swapchain.images_and_views[acquired.index as usize].image;
        cmd.copy_draw_image_to_swapchain(
            &self.targets.draw.image,
            draw_layout,
            src_stage_mask,
            draw_extent,
            swapchain_image,
        );
        self.draw_image_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;

        frame.end_recording()?;
        self.context.graphics_queue.submit(
            &frame.command_buffer,
            Some(SemaphoreSubmitInfo {
                semaphore: &frame.image_available_semaphore,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            }),
            Some(SemaphoreSubmitInfo {
                semaphore: &frame.render_finished_semaphore,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            }),
            &frame.fence,
        )?;
        frame.slot.submitted()?;

        let present_result = self.swapchain.queue_present(
            acquired.index,
            &[&frame.render_finished_semaphore],
            &self.context.present_queue,
        );
        match present_result {
            Ok(is_suboptimal) => Ok(is_suboptimal || acquired.is_suboptimal),
            Err(err) => match err.downcast_ref::<vk::Result>() {
                Some(&vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
                _ => Err(err.context("Failed to present the swapchain image")),
            },
        }
    }

    fn draw_extent(&self) -> vk::Extent2D {
        let swapchain = self.swapchain.extent();
        let draw = self.targets.draw.image.extent_2d();
        vk::Extent2D {
            width: swapchain.width.min(draw.width),
            height: swapchain.height.min(draw.height),
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.wait_for_gpu() {
            warn!("Failed to wait for the GPU before shutdown: {err:#}");
        }

        self.frames.flush_all_deletion_queues();
        self.orchestrator.retire(&mut self.deletion_queue);
        self.deletion_queue.flush();
        info!("Renderer stopped");
    }
}

/// Discards the previous draw image content for the background pass.
fn begin_background(cmd: &CommandBuffer, targets: &RenderTargets) {
    cmd.pipeline_image_barriers(&[ImageBarrier {
        image: &targets.draw.image,
        old_layout: vk::ImageLayout::UNDEFINED,
        new_layout: vk::ImageLayout::GENERAL,
        src_access_mask: vk::AccessFlags2::NONE,
        dst_access_mask: vk::AccessFlags2::SHADER_STORAGE_WRITE
            | vk::AccessFlags2::TRANSFER_WRITE,
        src_stage_mask: vk::PipelineStageFlags2::TRANSFER,
        dst_stage_mask: vk::PipelineStageFlags2::COMPUTE_SHADER
            | vk::PipelineStageFlags2::TRANSFER,
    }]);
}

/// Draw image ends in `COLOR_ATTACHMENT_OPTIMAL`.
fn record_raster(
    cmd: &CommandBuffer,
    targets: &RenderTargets,
    draw_context: &mut DrawContext,
    view_proj: &Mat4,
    scene_set: vk::DescriptorSet,
    extent: vk::Extent2D,
) -> DrawStats {
    cmd.pipeline_image_barriers(&[
        ImageBarrier {
            image: &targets.draw.image,
            old_layout: vk::ImageLayout::GENERAL,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            src_access_mask: vk::AccessFlags2::MEMORY_WRITE,
            dst_access_mask: vk::AccessFlags2::COLOR_ATTACHMENT_READ
                | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            src_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            dst_stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        },
        ImageBarrier {
            image: &targets.depth.image,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            src_access_mask: vk::AccessFlags2::NONE,
            dst_access_mask: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            src_stage_mask: vk::PipelineStageFlags2::NONE,
            dst_stage_mask: vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
        },
    ]);

    cmd.begin_rendering(
        &targets.draw.view,
        Some(&targets.depth.view),
        extent,
        vk::AttachmentLoadOp::LOAD,
        None,
    );
    let draws = record_draws(cmd, draw_context, view_proj, scene_set, extent);
    cmd.end_rendering();

    draws
}

/// Transitions the draw image to `GENERAL` keeping its content, then traces when `dispatch`
/// holds the extent. Returns the stage that last touched the draw image.
fn record_ray_tracing(
    cmd: &CommandBuffer,
    targets: &RenderTargets,
    draw_image_layout: vk::ImageLayout,
    bindings: &RayTracingBindings,
    descriptor_sets: [vk::DescriptorSet; 2],
    push_constants: RayTracingPushConstants,
    dispatch: Option<vk::Extent2D>,
) -> HybridResult<vk::PipelineStageFlags2> {
    cmd.pipeline_image_barriers(&[ImageBarrier {
        image: &targets.draw.image,
        old_layout: draw_image_layout,
        new_layout: vk::ImageLayout::GENERAL,
        src_access_mask: vk::AccessFlags2::TRANSFER_READ,
        dst_access_mask: vk::AccessFlags2::SHADER_STORAGE_READ
            | vk::AccessFlags2::SHADER_STORAGE_WRITE,
        src_stage_mask: vk::PipelineStageFlags2::TRANSFER,
        dst_stage_mask: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
    }]);

    let Some(extent) = dispatch else {
        return Ok(vk::PipelineStageFlags2::TRANSFER);
    };

    let layout = bindings.pipeline.layout.handle();
    cmd.bind_pipeline(
        vk::PipelineBindPoint::RAY_TRACING_KHR,
        bindings.pipeline.inner,
    );
    cmd.bind_descriptor_sets(
        vk::PipelineBindPoint::RAY_TRACING_KHR,
        layout,
        0,
        &descriptor_sets,
    );
    cmd.push_constant(
        layout,
        RayTracingPushConstants::STAGES,
        &push_constants,
    );
    cmd.trace_rays(
        &bindings.shader_binding_table.regions,
        extent.width,
        extent.height,
    )?;

    Ok(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR)
}
