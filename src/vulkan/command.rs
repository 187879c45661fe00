use std::mem::size_of;
use std::sync::Arc;

use anyhow::anyhow;
use ash::vk;

use crate::vulkan::ray_tracing::{RayTracingContext, ShaderBindingTableRegions};
use crate::vulkan::{Buffer, Context, Device, Image, ImageView, QueueFamily, TimestampQueryPool};
use crate::HybridResult;

pub struct CommandPool {
    device: Arc<Device>,
    ray_tracing: Option<Arc<RayTracingContext>>,
    pub(crate) inner: vk::CommandPool,
}

impl CommandPool {
    pub(crate) fn new(
        device: Arc<Device>,
        ray_tracing: Option<Arc<RayTracingContext>>,
        queue_family: QueueFamily,
        flags: Option<vk::CommandPoolCreateFlags>,
    ) -> HybridResult<Self> {
        let flags = flags.unwrap_or_else(vk::CommandPoolCreateFlags::empty);

        let command_pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family.index)
            .flags(flags);
        let inner = unsafe { device.inner.create_command_pool(&command_pool_info, None)? };

        Ok(Self {
            device,
            ray_tracing,
            inner,
        })
    }

    pub fn allocate_command_buffers(
        &self,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> HybridResult<Vec<CommandBuffer>> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.inner)
            .level(level)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.inner.allocate_command_buffers(&allocate_info)? };
        let buffers = buffers
            .into_iter()
            .map(|inner| CommandBuffer {
                device: self.device.clone(),
                ray_tracing: self.ray_tracing.clone(),
                inner,
            })
            .collect();

        Ok(buffers)
    }

    pub fn allocate_command_buffer(&self, level: vk::CommandBufferLevel) -> HybridResult<CommandBuffer> {
        self.allocate_command_buffers(level, 1)?
            .pop()
            .ok_or_else(|| anyhow!("Command buffer allocation returned nothing"))
    }

    pub fn free_command_buffer(&self, buffer: &CommandBuffer) {
        unsafe {
            self.device
                .inner
                .free_command_buffers(self.inner, std::slice::from_ref(&buffer.inner))
        };
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_command_pool(self.inner, None) };
    }
}

/// Owned by its [`CommandPool`], released when the pool is destroyed.
pub struct CommandBuffer {
    device: Arc<Device>,
    ray_tracing: Option<Arc<RayTracingContext>>,
    pub(crate) inner: vk::CommandBuffer,
}

#[derive(Clone, Copy)]
pub struct ImageBarrier<'a> {
    pub image: &'a Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access_mask: vk::AccessFlags2,
    pub dst_access_mask: vk::AccessFlags2,
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_access_mask: vk::AccessFlags2,
    pub dst_access_mask: vk::AccessFlags2,
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
}

impl CommandBuffer {
    pub fn begin(&self, flags: Option<vk::CommandBufferUsageFlags>) -> HybridResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(flags.unwrap_or_else(vk::CommandBufferUsageFlags::empty));
        unsafe { self.device.inner.begin_command_buffer(self.inner, &begin_info)? };
        Ok(())
    }

    pub fn end(&self) -> HybridResult<()> {
        unsafe { self.device.inner.end_command_buffer(self.inner)? };
        Ok(())
    }

    pub fn reset(&self) -> HybridResult<()> {
        unsafe {
            self.device
                .inner
                .reset_command_buffer(self.inner, vk::CommandBufferResetFlags::empty())?
        };
        Ok(())
    }

    pub fn pipeline_image_barriers(&self, barriers: &[ImageBarrier]) {
        let barriers = barriers
            .iter()
            .map(|b| {
                let aspect_mask = if is_depth_format(b.image.format) {
                    vk::ImageAspectFlags::DEPTH
                } else {
                    vk::ImageAspectFlags::COLOR
                };

                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(b.src_stage_mask)
                    .src_access_mask(b.src_access_mask)
                    .old_layout(b.old_layout)
                    .dst_stage_mask(b.dst_stage_mask)
                    .dst_access_mask(b.dst_access_mask)
                    .new_layout(b.new_layout)
                    .image(b.image.inner)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
            })
            .collect::<Vec<_>>();

        let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        unsafe {
            self.device
                .inner
                .cmd_pipeline_barrier2(self.inner, &dependency_info)
        };
    }

    pub fn pipeline_memory_barriers(&self, barriers: &[MemoryBarrier]) {
        let barriers = barriers
            .iter()
            .map(|b| {
                vk::MemoryBarrier2::default()
                    .src_stage_mask(b.src_stage_mask)
                    .src_access_mask(b.src_access_mask)
                    .dst_stage_mask(b.dst_stage_mask)
                    .dst_access_mask(b.dst_access_mask)
            })
            .collect::<Vec<_>>();

        let dependency_info = vk::DependencyInfo::default().memory_barriers(&barriers);
        unsafe {
            self.device
                .inner
                .cmd_pipeline_barrier2(self.inner, &dependency_info)
        };
    }

    pub fn copy_buffer(&self, src_buffer: &Buffer, dst_buffer: &Buffer) {
        let region = vk::BufferCopy::default().size(src_buffer.size.min(dst_buffer.size));
        unsafe {
            self.device.inner.cmd_copy_buffer(
                self.inner,
                src_buffer.inner,
                dst_buffer.inner,
                std::slice::from_ref(&region),
            )
        };
    }

    /// Scaled copy of the full color area of `src` into `dst`.
    pub fn blit_image(
        &self,
        src_image: &Image,
        src_layout: vk::ImageLayout,
        src_extent: vk::Extent2D,
        dst_image: &Image,
        dst_layout: vk::ImageLayout,
        dst_extent: vk::Extent2D,
    ) {
        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };

        let region = vk::ImageBlit2::default()
            .src_subresource(subresource)
            .src_offsets([
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: src_extent.width as _,
                    y: src_extent.height as _,
                    z: 1,
                },
            ])
            .dst_subresource(subresource)
            .dst_offsets([
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: dst_extent.width as _,
                    y: dst_extent.height as _,
                    z: 1,
                },
            ]);

        let blit_info = vk::BlitImageInfo2::default()
            .src_image(src_image.inner)
            .src_image_layout(src_layout)
            .dst_image(dst_image.inner)
            .dst_image_layout(dst_layout)
            .regions(std::slice::from_ref(&region))
            .filter(vk::Filter::LINEAR);

        unsafe { self.device.inner.cmd_blit_image2(self.inner, &blit_info) };
    }

    pub fn clear_color_image(&self, image: &Image, layout: vk::ImageLayout, color: [f32; 4]) {
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let clear = vk::ClearColorValue { float32: color };
        unsafe {
            self.device.inner.cmd_clear_color_image(
                self.inner,
                image.inner,
                layout,
                &clear,
                std::slice::from_ref(&range),
            )
        };
    }

    pub fn begin_rendering(
        &self,
        color_attachment_view: &ImageView,
        depth_attachment_view: Option<&ImageView>,
        extent: vk::Extent2D,
        load_op: vk::AttachmentLoadOp,
        clear_color: Option<[f32; 4]>,
    ) {
        let color_attachment_info = vk::RenderingAttachmentInfo::default()
            .image_view(color_attachment_view.inner)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(load_op)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color.unwrap_or([1.0; 4]),
                },
            })
            .store_op(vk::AttachmentStoreOp::STORE);

        let depth_attachment_info = depth_attachment_view.map(|view| {
            vk::RenderingAttachmentInfo::default()
                .image_view(view.inner)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 0.0,
                        stencil: 0,
                    },
                })
                .store_op(vk::AttachmentStoreOp::STORE)
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment_info));
        if let Some(depth) = depth_attachment_info.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }

        unsafe {
            self.device
                .inner
                .cmd_begin_rendering(self.inner, &rendering_info)
        };
    }

    pub fn end_rendering(&self) {
        unsafe { self.device.inner.cmd_end_rendering(self.inner) };
    }

    pub fn set_viewport_and_scissor(&self, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as _,
            height: extent.height as _,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        unsafe {
            self.device.inner.cmd_set_viewport(self.inner, 0, &[viewport]);
            self.device.inner.cmd_set_scissor(self.inner, 0, &[scissor]);
        }
    }

    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .inner
                .cmd_bind_pipeline(self.inner, bind_point, pipeline)
        }
    }

    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device.inner.cmd_bind_descriptor_sets(
                self.inner,
                bind_point,
                layout,
                first_set,
                sets,
                &[],
            )
        }
    }

    pub fn push_constant<P: Copy>(&self, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, data: &P) {
        let bytes = unsafe { std::slice::from_raw_parts(data as *const P as *const u8, size_of::<P>()) };
        unsafe {
            self.device
                .inner
                .cmd_push_constants(self.inner, layout, stages, 0, bytes)
        };
    }

    pub fn bind_index_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device
                .inner
                .cmd_bind_index_buffer(self.inner, buffer, 0, vk::IndexType::UINT32)
        };
    }

    pub fn draw_indexed(&self, index_count: u32, first_index: u32) {
        unsafe {
            self.device
                .inner
                .cmd_draw_indexed(self.inner, index_count, 1, first_index, 0, 0)
        };
    }

    pub fn dispatch(&self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        unsafe {
            self.device
                .inner
                .cmd_dispatch(self.inner, group_count_x, group_count_y, group_count_z);
        }
    }

    fn ray_tracing(&self) -> HybridResult<&RayTracingContext> {
        self.ray_tracing
            .as_deref()
            .ok_or_else(|| anyhow!("Ray tracing is not enabled on this device"))
    }

    pub fn build_acceleration_structure(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    ) -> HybridResult<()> {
        let ray_tracing = self.ray_tracing()?;

        unsafe {
            ray_tracing
                .acceleration_structure_fn
                .cmd_build_acceleration_structures(
                    self.inner,
                    std::slice::from_ref(build_info),
                    std::slice::from_ref(&ranges),
                )
        };

        Ok(())
    }

    pub fn trace_rays(&self, regions: &ShaderBindingTableRegions, width: u32, height: u32) -> HybridResult<()> {
        let ray_tracing = self.ray_tracing()?;

        unsafe {
            ray_tracing.pipeline_fn.cmd_trace_rays(
                self.inner,
                &regions.raygen,
                &regions.miss,
                &regions.hit,
                &regions.callable,
                width,
                height,
                1,
            )
        };

        Ok(())
    }

    pub fn reset_all_timestamp_queries_from_pool<const C: usize>(&self, pool: &TimestampQueryPool<C>) {
        unsafe {
            self.device
                .inner
                .cmd_reset_query_pool(self.inner, pool.inner, 0, C as _);
        }
    }

    pub fn write_timestamp<const C: usize>(
        &self,
        stage: vk::PipelineStageFlags2,
        pool: &TimestampQueryPool<C>,
        query_index: u32,
    ) {
        assert!(
            query_index < C as u32,
            "Query index must be < {C}. Got {query_index}"
        );

        unsafe {
            self.device
                .inner
                .cmd_write_timestamp2(self.inner, stage, pool.inner, query_index)
        };
    }
}

pub(crate) fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

impl Context {
    pub fn create_command_pool(
        &self,
        queue_family: QueueFamily,
        flags: Option<vk::CommandPoolCreateFlags>,
    ) -> HybridResult<CommandPool> {
        CommandPool::new(
            self.device.clone(),
            self.ray_tracing.clone(),
            queue_family,
            flags,
        )
    }
}
