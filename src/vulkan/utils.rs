use std::mem::size_of_val;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::vulkan::{Buffer, CommandBuffer, Context, Image, ImageAndView, ImageBarrier};
use crate::HybridResult;

/// Smallest multiple of `alignment` that is `>= size`. `alignment` must not be zero.
pub fn compute_aligned_size(size: u64, alignment: u64) -> u64 {
    size.div_ceil(alignment) * alignment
}

pub fn read_shader_from_bytes(bytes: &[u8]) -> HybridResult<Vec<u32>> {
    let mut cursor = std::io::Cursor::new(bytes);
    Ok(ash::util::read_spv(&mut cursor)?)
}

impl Context {
    /// Uploads `data` through a staging buffer into a new device local buffer.
    pub fn create_gpu_only_buffer_from_data<T: Copy>(
        &self,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> HybridResult<Buffer> {
        let size = size_of_val(data) as _;
        let staging_buffer = self.create_buffer(
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            size,
        )?;
        staging_buffer.copy_data_to_buffer(data)?;

        let buffer = self.create_buffer(
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            size,
        )?;

        self.execute_one_time_commands(|cmd_buffer| {
            cmd_buffer.copy_buffer(&staging_buffer, &buffer);
            Ok(())
        })?;

        Ok(buffer)
    }

    /// Storage image that is already in `GENERAL` layout.
    pub fn create_storage_image(
        &self,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
    ) -> HybridResult<ImageAndView> {
        let image = self.create_image(
            usage | vk::ImageUsageFlags::STORAGE,
            MemoryLocation::GpuOnly,
            format,
            extent.width,
            extent.height,
        )?;
        let view = image.create_image_view(false)?;

        self.execute_one_time_commands(|cmd_buffer| {
            cmd_buffer.pipeline_image_barriers(&[ImageBarrier {
                image: &image,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::GENERAL,
                src_access_mask: vk::AccessFlags2::NONE,
                dst_access_mask: vk::AccessFlags2::NONE,
                src_stage_mask: vk::PipelineStageFlags2::NONE,
                dst_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            }]);
            Ok(())
        })?;

        Ok(ImageAndView { image, view })
    }
}

impl CommandBuffer {
    /// Blits the finished draw image onto the swapchain image and leaves the latter presentable.
    pub fn copy_draw_image_to_swapchain(
        &self,
        draw_image: &Image,
        draw_image_layout: vk::ImageLayout,
        draw_src_stage_mask: vk::PipelineStageFlags2,
        draw_extent: vk::Extent2D,
        swapchain_image: &Image,
    ) {
        self.pipeline_image_barriers(&[
            ImageBarrier {
                image: draw_image,
                old_layout: draw_image_layout,
                new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                src_access_mask: vk::AccessFlags2::MEMORY_WRITE,
                dst_access_mask: vk::AccessFlags2::TRANSFER_READ,
                src_stage_mask: draw_src_stage_mask,
                dst_stage_mask: vk::PipelineStageFlags2::TRANSFER,
            },
            ImageBarrier {
                image: swapchain_image,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                src_access_mask: vk::AccessFlags2::NONE,
                dst_access_mask: vk::AccessFlags2::TRANSFER_WRITE,
                src_stage_mask: vk::PipelineStageFlags2::NONE,
                dst_stage_mask: vk::PipelineStageFlags2::TRANSFER,
            },
        ]);

        self.blit_image(
            draw_image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            draw_extent,
            swapchain_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            swapchain_image.extent_2d(),
        );

        self.swapchain_image_present_barrier(swapchain_image);
    }

    pub fn swapchain_image_present_barrier(&self, swapchain_image: &Image) {
        self.pipeline_image_barriers(&[ImageBarrier {
            image: swapchain_image,
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            src_access_mask: vk::AccessFlags2::TRANSFER_WRITE,
            dst_access_mask: vk::AccessFlags2::NONE,
            src_stage_mask: vk::PipelineStageFlags2::TRANSFER,
            dst_stage_mask: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
        }]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_size_rounds_up_to_the_next_multiple() {
        assert_eq!(compute_aligned_size(0, 256), 0);
        assert_eq!(compute_aligned_size(1, 256), 256);
        assert_eq!(compute_aligned_size(256, 256), 256);
        assert_eq!(compute_aligned_size(257, 256), 512);
        assert_eq!(compute_aligned_size(32, 64), 64);
        assert_eq!(compute_aligned_size(65, 64), 128);
    }

    #[test]
    fn aligned_size_works_for_any_granularity() {
        assert_eq!(compute_aligned_size(10, 3), 12);
        assert_eq!(compute_aligned_size(9, 3), 9);
    }
}
