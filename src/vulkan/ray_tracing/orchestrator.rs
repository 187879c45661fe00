use std::mem::size_of_val;

use anyhow::ensure;
use ash::vk;
use gpu_allocator::MemoryLocation;
use log::{debug, info};

use crate::deletion_queue::DeletionQueue;
use crate::vulkan::ray_tracing::{
    resolve_from_slice, AccelerationStructure, BufferRegion, BuildSizes, GeometryDescriptor,
    InstanceTable, ACCELERATION_STRUCTURE_ALIGNMENT,
};
use crate::vulkan::{Buffer, Context, MemoryBarrier};
use crate::HybridResult;

const INSTANCE_BUFFER_ALIGNMENT: vk::DeviceSize = 16;

/// Between two bottom level builds sharing result and scratch memory.
pub const BOTTOM_LEVEL_BUILD_BARRIER: MemoryBarrier = MemoryBarrier {
    src_access_mask: vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
    dst_access_mask: vk::AccessFlags2::from_raw(
        vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR.as_raw()
            | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
    ),
    src_stage_mask: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
    dst_stage_mask: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
};

/// Instance array copy must land before the top level build reads it.
pub const INSTANCE_UPLOAD_BARRIER: MemoryBarrier = MemoryBarrier {
    src_access_mask: vk::AccessFlags2::TRANSFER_WRITE,
    dst_access_mask: vk::AccessFlags2::from_raw(
        vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR.as_raw()
            | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
    ),
    src_stage_mask: vk::PipelineStageFlags2::TRANSFER,
    dst_stage_mask: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
};

/// Top level structure must be complete before any ray tracing shader traverses it.
pub const TOP_LEVEL_READY_BARRIER: MemoryBarrier = MemoryBarrier {
    src_access_mask: vk::AccessFlags2::from_raw(
        vk::AccessFlags2::TRANSFER_WRITE.as_raw()
            | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
    ),
    dst_access_mask: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
    src_stage_mask: vk::PipelineStageFlags2::from_raw(
        vk::PipelineStageFlags2::TRANSFER.as_raw()
            | vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR.as_raw(),
    ),
    dst_stage_mask: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
};

/// Offsets of every structure inside the shared result and scratch buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionAssignment {
    pub result_offsets: Vec<vk::DeviceSize>,
    pub scratch_offsets: Vec<vk::DeviceSize>,
    pub total: BuildSizes,
}

/// Packs the structures back to back: each offset is the running sum of the sizes before it.
pub fn assign_regions(sizes: &[BuildSizes]) -> RegionAssignment {
    let mut assignment = RegionAssignment {
        result_offsets: Vec::with_capacity(sizes.len()),
        scratch_offsets: Vec::with_capacity(sizes.len()),
        total: BuildSizes::default(),
    };

    for size in sizes {
        assignment.result_offsets.push(assignment.total.result);
        assignment.scratch_offsets.push(assignment.total.scratch);
        assignment.total = assignment.total + *size;
    }

    assignment
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccelerationStructureState {
    #[default]
    Empty,
    BottomLevelBuilt,
    Ready,
}

struct BottomLevelBatch {
    structures: Vec<AccelerationStructure>,
    result_buffer: Buffer,
    scratch_buffer: Buffer,
}

struct TopLevelBatch {
    structure: AccelerationStructure,
    instance_buffer: Buffer,
    result_buffer: Buffer,
    scratch_buffer: Buffer,
}

/// Builds every bottom level structure of a scene and the top level structure over them.
///
/// Both phases record into their own one-shot command buffer and block until the GPU is done,
/// so a returned `Ok` means the structures can be bound right away.
#[derive(Default)]
pub struct AccelerationBuildOrchestrator {
    bottom: Option<BottomLevelBatch>,
    top: Option<TopLevelBatch>,
}

impl AccelerationBuildOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AccelerationStructureState {
        match (&self.bottom, &self.top) {
            (Some(_), Some(_)) => AccelerationStructureState::Ready,
            (Some(_), None) => AccelerationStructureState::BottomLevelBuilt,
            _ => AccelerationStructureState::Empty,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == AccelerationStructureState::Ready
    }

    pub fn top_level(&self) -> Option<&AccelerationStructure> {
        self.top.as_ref().map(|t| &t.structure)
    }

    pub fn bottom_levels(&self) -> &[AccelerationStructure] {
        self.bottom
            .as_ref()
            .map(|b| b.structures.as_slice())
            .unwrap_or_default()
    }

    /// Replaces the current structures. The previous ones go to `deletion_queue`.
    pub fn build(
        &mut self,
        context: &Context,
        geometries: &[GeometryDescriptor],
        instances: &InstanceTable,
        deletion_queue: &mut DeletionQueue,
    ) -> HybridResult<()> {
        ensure!(!geometries.is_empty(), "No geometry to build acceleration structures from");
        ensure!(!instances.is_empty(), "No instances to build a top level structure from");

        self.retire(deletion_queue);

        info!("Building {} bottom level acceleration structures", geometries.len());
        self.bottom = Some(build_bottom_levels(context, geometries)?);

        let bottom_levels = self.bottom_levels();
        info!("Building top level acceleration structure over {} instances", instances.len());
        self.top = Some(build_top_level(context, bottom_levels, instances)?);

        debug!("Acceleration structures ready");
        Ok(())
    }

    /// Hands every structure and buffer to `deletion_queue`. Structures are registered after
    /// their buffers so a reverse flush destroys them first.
    pub fn retire(&mut self, deletion_queue: &mut DeletionQueue) {
        let mut structures = Vec::new();

        if let Some(bottom) = self.bottom.take() {
            deletion_queue.push("bottom level result buffer", bottom.result_buffer);
            deletion_queue.push("bottom level scratch buffer", bottom.scratch_buffer);
            structures.extend(bottom.structures);
        }

        let mut top_level = None;
        if let Some(top) = self.top.take() {
            deletion_queue.push("instance buffer", top.instance_buffer);
            deletion_queue.push("top level result buffer", top.result_buffer);
            deletion_queue.push("top level scratch buffer", top.scratch_buffer);
            top_level = Some(top.structure);
        }

        for structure in structures {
            deletion_queue.push("bottom level acceleration structure", structure);
        }
        if let Some(structure) = top_level {
            deletion_queue.push("top level acceleration structure", structure);
        }
    }
}

fn bottom_level_name(index: usize) -> String {
    format!("BLAS #{index}")
}

fn build_bottom_levels(
    context: &Context,
    geometries: &[GeometryDescriptor],
) -> HybridResult<BottomLevelBatch> {
    let ray_tracing = context.ray_tracing()?;

    let mut structures = geometries
        .iter()
        .map(|geometry| AccelerationStructure::bottom_level(context, std::slice::from_ref(geometry)))
        .collect::<HybridResult<Vec<_>>>()?;

    let sizes = structures.iter().map(|s| s.build_sizes()).collect::<Vec<_>>();
    let assignment = assign_regions(&sizes);
    debug!("Bottom level totals: {:?}", assignment.total);

    let result_buffer = context.create_aligned_buffer(
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        assignment.total.result,
        ACCELERATION_STRUCTURE_ALIGNMENT,
    )?;
    let scratch_buffer = context.create_aligned_buffer(
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        assignment.total.scratch,
        ray_tracing.scratch_alignment(),
    )?;

    for (i, structure) in structures.iter().enumerate() {
        context.set_debug_name(structure.handle(), &bottom_level_name(i))?;
    }
    context.set_debug_name(result_buffer.inner, "BLAS result buffer")?;
    context.set_debug_name(scratch_buffer.inner, "BLAS scratch buffer")?;

    context.execute_one_time_commands(|cmd| {
        for (i, structure) in structures.iter_mut().enumerate() {
            structure.generate(
                cmd,
                BufferRegion {
                    buffer: &scratch_buffer,
                    offset: assignment.scratch_offsets[i],
                },
                BufferRegion {
                    buffer: &result_buffer,
                    offset: assignment.result_offsets[i],
                },
            )?;
            cmd.pipeline_memory_barriers(&[BOTTOM_LEVEL_BUILD_BARRIER]);
        }
        Ok(())
    })?;

    Ok(BottomLevelBatch {
        structures,
        result_buffer,
        scratch_buffer,
    })
}

fn build_top_level(
    context: &Context,
    bottom_levels: &[AccelerationStructure],
    instances: &InstanceTable,
) -> HybridResult<TopLevelBatch> {
    let ray_tracing = context.ray_tracing()?;

    let addresses = bottom_levels
        .iter()
        .map(AccelerationStructure::device_address)
        .collect::<HybridResult<Vec<_>>>()?;
    let records = instances.resolve(resolve_from_slice(&addresses))?;
    let instances_size = size_of_val(records.as_slice()) as vk::DeviceSize;

    let staging_buffer = context.create_buffer(
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        instances_size,
    )?;
    staging_buffer.copy_data_to_buffer(&records)?;

    let instance_buffer = context.create_aligned_buffer(
        vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        MemoryLocation::GpuOnly,
        instances_size,
        INSTANCE_BUFFER_ALIGNMENT,
    )?;

    let mut structure = AccelerationStructure::top_level(
        context,
        instance_buffer.get_device_address(),
        records.len() as u32,
    )?;
    let sizes = structure.build_sizes();

    let result_buffer = context.create_aligned_buffer(
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        sizes.result,
        ACCELERATION_STRUCTURE_ALIGNMENT,
    )?;
    let scratch_buffer = context.create_aligned_buffer(
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        sizes.scratch,
        ray_tracing.scratch_alignment(),
    )?;

    context.set_debug_name(structure.handle(), "TLAS")?;
    context.set_debug_name(instance_buffer.inner, "TLAS instance buffer")?;
    context.set_debug_name(result_buffer.inner, "TLAS result buffer")?;
    context.set_debug_name(scratch_buffer.inner, "TLAS scratch buffer")?;

    context.execute_one_time_commands(|cmd| {
        cmd.copy_buffer(&staging_buffer, &instance_buffer);
        cmd.pipeline_memory_barriers(&[INSTANCE_UPLOAD_BARRIER]);

        structure.generate(
            cmd,
            BufferRegion {
                buffer: &scratch_buffer,
                offset: 0,
            },
            BufferRegion {
                buffer: &result_buffer,
                offset: 0,
            },
        )?;
        cmd.pipeline_memory_barriers(&[TOP_LEVEL_READY_BARRIER]);
        Ok(())
    })?;

    Ok(TopLevelBatch {
        structure,
        instance_buffer,
        result_buffer,
        scratch_buffer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(result: u64, scratch: u64) -> BuildSizes {
        BuildSizes {
            result,
            scratch,
            update_scratch: 0,
        }
    }

    #[test]
    fn offsets_are_running_sums() {
        let all = [sizes(256, 128), sizes(1024, 384), sizes(512, 128), sizes(256, 1280)];

        let assignment = assign_regions(&all);

        assert_eq!(assignment.result_offsets, vec![0, 256, 1280, 1792]);
        assert_eq!(assignment.scratch_offsets, vec![0, 128, 512, 640]);
        assert_eq!(assignment.total, sizes(2048, 1920));
    }

    #[test]
    fn assigned_regions_never_overlap() {
        let all = (1..20u64)
            .map(|i| BuildSizes::from_requirements(i * 700 + 3, i * 333, 0, 128))
            .collect::<Vec<_>>();

        let assignment = assign_regions(&all);

        for i in 1..all.len() {
            let previous_result_end = assignment.result_offsets[i - 1] + all[i - 1].result;
            let previous_scratch_end = assignment.scratch_offsets[i - 1] + all[i - 1].scratch;
            assert_eq!(assignment.result_offsets[i], previous_result_end);
            assert_eq!(assignment.scratch_offsets[i], previous_scratch_end);
            assert_eq!(assignment.result_offsets[i] % ACCELERATION_STRUCTURE_ALIGNMENT, 0);
            assert_eq!(assignment.scratch_offsets[i] % 128, 0);
        }
        let last = all.len() - 1;
        assert_eq!(
            assignment.total.result,
            assignment.result_offsets[last] + all[last].result
        );
    }

    #[test]
    fn empty_batch_has_no_regions() {
        let assignment = assign_regions(&[]);
        assert!(assignment.result_offsets.is_empty());
        assert_eq!(assignment.total, BuildSizes::default());
    }

    #[test]
    fn bottom_levels_are_named_by_build_order() {
        let names = (0..3).map(bottom_level_name).collect::<Vec<_>>();

        assert_eq!(names, ["BLAS #0", "BLAS #1", "BLAS #2"]);
    }

    #[test]
    fn new_orchestrator_is_not_ready() {
        let orchestrator = AccelerationBuildOrchestrator::new();

        assert_eq!(orchestrator.state(), AccelerationStructureState::Empty);
        assert!(!orchestrator.is_ready());
        assert!(orchestrator.top_level().is_none());
        assert!(orchestrator.bottom_levels().is_empty());
    }

    #[test]
    fn retiring_nothing_registers_nothing() {
        let mut orchestrator = AccelerationBuildOrchestrator::new();
        let mut queue = DeletionQueue::new("engine");

        orchestrator.retire(&mut queue);

        assert!(queue.is_empty());
    }

    #[test]
    fn build_barriers_order_the_phases() {
        assert!(BOTTOM_LEVEL_BUILD_BARRIER
            .dst_access_mask
            .contains(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR));
        assert_eq!(
            INSTANCE_UPLOAD_BARRIER.src_access_mask,
            vk::AccessFlags2::TRANSFER_WRITE
        );
        assert_eq!(
            TOP_LEVEL_READY_BARRIER.dst_stage_mask,
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR
        );
    }
}
