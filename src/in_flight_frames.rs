use std::time::Duration;

use anyhow::ensure;
use ash::vk;
use log::debug;

use crate::deletion_queue::DeletionQueue;
use crate::vulkan::{
    CommandBuffer, CommandPool, Context, DescriptorAllocator, Fence, PoolSizeRatio, Semaphore,
    TimestampQueryPool,
};
use crate::HybridResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FrameSlotState {
    /// Fence signaled, nothing of this frame is in use by the GPU.
    #[default]
    Idle,
    Recording,
    Submitted,
}

/// CPU side mirror of a frame context's fence.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameSlot {
    state: FrameSlotState,
    submissions: u64,
}

impl FrameSlot {
    pub fn state(&self) -> FrameSlotState {
        self.state
    }

    /// Called once the slot's fence was waited on.
    pub fn fence_signaled(&mut self) {
        if self.state == FrameSlotState::Submitted {
            self.state = FrameSlotState::Idle;
        }
    }

    pub fn begin_recording(&mut self) -> HybridResult<()> {
        ensure!(
            self.state == FrameSlotState::Idle,
            "Frame context is {:?}, recording requires an idle frame",
            self.state
        );
        self.state = FrameSlotState::Recording;
        Ok(())
    }

    pub fn submitted(&mut self) -> HybridResult<()> {
        ensure!(
            self.state == FrameSlotState::Recording,
            "Frame context is {:?}, only a recording frame can be submitted",
            self.state
        );
        self.state = FrameSlotState::Submitted;
        self.submissions += 1;
        Ok(())
    }

    /// Whether a previous submission of this slot completed, so its queries hold results.
    pub fn has_completed_submission(&self) -> bool {
        self.submissions > 0 && self.state == FrameSlotState::Idle
    }
}

pub const FRAME_DESCRIPTOR_RATIOS: [PoolSizeRatio; 4] = [
    PoolSizeRatio {
        ty: vk::DescriptorType::STORAGE_IMAGE,
        ratio: 3.0,
    },
    PoolSizeRatio {
        ty: vk::DescriptorType::STORAGE_BUFFER,
        ratio: 3.0,
    },
    PoolSizeRatio {
        ty: vk::DescriptorType::UNIFORM_BUFFER,
        ratio: 3.0,
    },
    PoolSizeRatio {
        ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        ratio: 4.0,
    },
];

/// Everything a frame touches while it is in flight.
pub struct FrameContext {
    pub deletion_queue: DeletionQueue,
    pub descriptors: DescriptorAllocator,
    pub command_buffer: CommandBuffer,
    _command_pool: CommandPool,
    pub fence: Fence,
    pub image_available_semaphore: Semaphore,
    pub render_finished_semaphore: Semaphore,
    pub timing_query_pool: TimestampQueryPool<2>,
    pub slot: FrameSlot,
}

impl FrameContext {
    fn new(context: &Context, descriptor_sets_per_pool: u32) -> HybridResult<Self> {
        let command_pool = context.create_command_pool(
            context.physical_device.graphics_queue_family,
            Some(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
        )?;
        let command_buffer = command_pool.allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;

        Ok(Self {
            deletion_queue: DeletionQueue::new("frame"),
            descriptors: context.create_descriptor_allocator(
                descriptor_sets_per_pool,
                FRAME_DESCRIPTOR_RATIOS.to_vec(),
            )?,
            command_buffer,
            _command_pool: command_pool,
            fence: context.create_fence(Some(vk::FenceCreateFlags::SIGNALED))?,
            image_available_semaphore: context.create_semaphore()?,
            render_finished_semaphore: context.create_semaphore()?,
            timing_query_pool: context.create_timestamp_query_pool()?,
            slot: FrameSlot::default(),
        })
    }

    /// Blocks until the GPU released this frame, then frees what the frame deferred and resets
    /// its descriptor pools.
    pub fn wait_and_reclaim(&mut self, timeout: Duration) -> HybridResult<()> {
        self.fence.wait(timeout)?;
        self.slot.fence_signaled();

        self.deletion_queue.flush();
        self.descriptors.clear()
    }

    /// Idle to recording: resets the fence and the command buffer.
    pub fn begin_recording(&mut self) -> HybridResult<()> {
        self.slot.begin_recording()?;
        self.fence.reset()?;
        self.command_buffer.reset()?;
        self.command_buffer.begin(None)?;
        self.command_buffer
            .reset_all_timestamp_queries_from_pool(&self.timing_query_pool);
        self.command_buffer.write_timestamp(
            vk::PipelineStageFlags2::NONE,
            &self.timing_query_pool,
            0,
        );
        Ok(())
    }

    pub fn end_recording(&self) -> HybridResult<()> {
        self.command_buffer.write_timestamp(
            vk::PipelineStageFlags2::ALL_COMMANDS,
            &self.timing_query_pool,
            1,
        );
        self.command_buffer.end()
    }

    /// GPU time of the last completed submission of this frame.
    pub fn gpu_frame_time(&self) -> HybridResult<Option<Duration>> {
        // Before the first submission vkGetQueryPoolResults would block forever on
        // VK_QUERY_RESULT_WAIT_BIT
        if !self.slot.has_completed_submission() {
            return Ok(None);
        }
        Ok(Some(self.timing_query_pool.elapsed(0, 1)?))
    }
}

pub struct InFlightFrames {
    frames: Vec<FrameContext>,
    current_index: usize,
}

impl InFlightFrames {
    pub(crate) fn new(
        context: &Context,
        frame_count: usize,
        descriptor_sets_per_pool: u32,
    ) -> HybridResult<Self> {
        ensure!(frame_count > 0, "At least one frame in flight is required");
        debug!("Creating {frame_count} frame contexts");

        let frames = (0..frame_count)
            .map(|_| FrameContext::new(context, descriptor_sets_per_pool))
            .collect::<HybridResult<Vec<_>>>()?;

        Ok(Self {
            frames,
            current_index: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub(crate) fn next(&mut self) {
        self.current_index = next_frame_index(self.current_index, self.frames.len());
    }

    pub fn current(&self) -> &FrameContext {
        &self.frames[self.current_index]
    }

    pub fn current_mut(&mut self) -> &mut FrameContext {
        &mut self.frames[self.current_index]
    }

    /// Only valid once the device is idle.
    pub(crate) fn flush_all_deletion_queues(&mut self) {
        for frame in self.frames.iter_mut() {
            frame.deletion_queue.flush();
        }
    }
}

fn next_frame_index(current: usize, count: usize) -> usize {
    (current + 1) % count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_goes_through_its_lifecycle() {
        let mut slot = FrameSlot::default();
        assert_eq!(slot.state(), FrameSlotState::Idle);
        assert!(!slot.has_completed_submission());

        slot.begin_recording().unwrap();
        assert_eq!(slot.state(), FrameSlotState::Recording);
        slot.submitted().unwrap();
        assert_eq!(slot.state(), FrameSlotState::Submitted);
        assert!(!slot.has_completed_submission());

        slot.fence_signaled();
        assert_eq!(slot.state(), FrameSlotState::Idle);
        assert!(slot.has_completed_submission());
    }

    #[test]
    fn cannot_record_into_a_frame_still_in_flight() {
        let mut slot = FrameSlot::default();
        slot.begin_recording().unwrap();
        slot.submitted().unwrap();

        assert!(slot.begin_recording().is_err());
        assert!(slot.submitted().is_err());
    }

    #[test]
    fn cannot_submit_without_recording() {
        let mut slot = FrameSlot::default();
        assert!(slot.submitted().is_err());

        slot.fence_signaled();
        assert_eq!(slot.state(), FrameSlotState::Idle);
    }

    #[test]
    fn frames_in_rotation_are_mutually_exclusive() {
        let mut slots = [FrameSlot::default(); 2];
        let mut index = 0;

        for frame in 0..8 {
            let slot = &mut slots[index];
            if frame >= 2 {
                // The slot was submitted two frames ago and its fence not waited on yet.
                assert!(slot.begin_recording().is_err());
                slot.fence_signaled();
            }
            slot.begin_recording().unwrap();
            slot.submitted().unwrap();

            let other = &slots[next_frame_index(index, 2)];
            assert_ne!(other.state(), FrameSlotState::Recording);

            index = next_frame_index(index, 2);
        }
    }

    #[test]
    fn frame_index_wraps_around() {
        assert_eq!(next_frame_index(0, 2), 1);
        assert_eq!(next_frame_index(1, 2), 0);
        assert_eq!(next_frame_index(2, 3), 0);
        assert_eq!(next_frame_index(0, 1), 0);
    }
}
