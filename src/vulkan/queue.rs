use std::sync::Arc;

use ash::vk;

use crate::vulkan::{CommandBuffer, Device, Fence, Semaphore};
use crate::HybridResult;

#[derive(Debug, Clone, Copy)]
pub struct QueueFamily {
    pub index: u32,
    pub(crate) inner: vk::QueueFamilyProperties,
    supports_present: bool,
}

impl QueueFamily {
    pub(crate) fn new(index: u32, inner: vk::QueueFamilyProperties, supports_present: bool) -> Self {
        Self {
            index,
            inner,
            supports_present,
        }
    }

    pub fn supports_compute(&self) -> bool {
        self.inner.queue_flags.contains(vk::QueueFlags::COMPUTE)
    }

    pub fn supports_graphics(&self) -> bool {
        self.inner.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    }

    pub fn supports_present(&self) -> bool {
        self.supports_present
    }

    pub fn has_queues(&self) -> bool {
        self.inner.queue_count > 0
    }

    pub fn supports_timestamp_queries(&self) -> bool {
        self.inner.timestamp_valid_bits > 0
    }
}

pub struct Queue {
    device: Arc<Device>,
    pub inner: vk::Queue,
    pub family: QueueFamily,
}

pub struct SemaphoreSubmitInfo<'a> {
    pub semaphore: &'a Semaphore,
    pub stage_mask: vk::PipelineStageFlags2,
}

impl Queue {
    pub(crate) fn new(device: Arc<Device>, family: QueueFamily, queue_index: u32) -> Self {
        let inner = unsafe { device.inner.get_device_queue(family.index, queue_index) };

        Self {
            device,
            inner,
            family,
        }
    }

    pub fn submit(
        &self,
        command_buffer: &CommandBuffer,
        wait_semaphore: Option<SemaphoreSubmitInfo>,
        signal_semaphore: Option<SemaphoreSubmitInfo>,
        fence: &Fence,
    ) -> HybridResult<()> {
        let wait_semaphore_submit_info = wait_semaphore.map(|s| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(s.semaphore.inner)
                .stage_mask(s.stage_mask)
        });

        let signal_semaphore_submit_info = signal_semaphore.map(|s| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(s.semaphore.inner)
                .stage_mask(s.stage_mask)
        });

        let cmd_buffer_submit_info =
            vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer.inner);

        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(std::slice::from_ref(&cmd_buffer_submit_info))
            .wait_semaphore_infos(wait_semaphore_submit_info.as_slice())
            .signal_semaphore_infos(signal_semaphore_submit_info.as_slice());

        unsafe {
            self.device.inner.queue_submit2(
                self.inner,
                std::slice::from_ref(&submit_info),
                fence.inner,
            )?
        };

        Ok(())
    }
}
