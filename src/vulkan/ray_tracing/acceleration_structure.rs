use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context as _};
use ash::vk;
use log::trace;

use crate::vulkan::ray_tracing::{
    BuildSizes, InstanceRecord, RayTracingContext, ACCELERATION_STRUCTURE_ALIGNMENT,
};
use crate::vulkan::{Buffer, CommandBuffer, Context};
use crate::HybridResult;

/// Triangle geometry of one mesh, addressed by device pointers into already uploaded buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryDescriptor {
    pub vertex_address: vk::DeviceAddress,
    pub index_address: vk::DeviceAddress,
    pub vertex_stride: vk::DeviceSize,
    pub max_vertex: u32,
    pub primitive_count: u32,
    pub opaque: bool,
}

impl GeometryDescriptor {
    fn to_vk(self) -> vk::AccelerationStructureGeometryKHR<'static> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.vertex_address,
            })
            .vertex_stride(self.vertex_stride)
            .max_vertex(self.max_vertex)
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.index_address,
            });

        let flags = if self.opaque {
            vk::GeometryFlagsKHR::OPAQUE
        } else {
            vk::GeometryFlagsKHR::empty()
        };

        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(flags)
    }

    /// Range covering every primitive of the geometry.
    pub fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(self.primitive_count)
    }
}

pub enum AccelerationStructureKind {
    BottomLevel {
        geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
        ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
    },
    TopLevel {
        geometry: vk::AccelerationStructureGeometryKHR<'static>,
        range: vk::AccelerationStructureBuildRangeInfoKHR,
    },
}

impl AccelerationStructureKind {
    fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        match self {
            Self::BottomLevel { .. } => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            Self::TopLevel { .. } => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }

    fn geometries(&self) -> &[vk::AccelerationStructureGeometryKHR<'static>] {
        match self {
            Self::BottomLevel { geometries, .. } => geometries,
            Self::TopLevel { geometry, .. } => std::slice::from_ref(geometry),
        }
    }

    fn ranges(&self) -> &[vk::AccelerationStructureBuildRangeInfoKHR] {
        match self {
            Self::BottomLevel { ranges, .. } => ranges,
            Self::TopLevel { range, .. } => std::slice::from_ref(range),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::BottomLevel { .. } => "bottom level",
            Self::TopLevel { .. } => "top level",
        }
    }
}

/// Byte range inside a buffer shared between several structures.
#[derive(Debug, Clone, Copy)]
pub struct BufferRegion<'a> {
    pub buffer: &'a Buffer,
    pub offset: vk::DeviceSize,
}

pub struct AccelerationStructure {
    ray_tracing: Arc<RayTracingContext>,
    kind: AccelerationStructureKind,
    build_sizes: BuildSizes,
    handle: vk::AccelerationStructureKHR,
}

impl AccelerationStructure {
    /// One structure over `geometries`, each range covering the whole geometry.
    pub fn bottom_level(context: &Context, geometries: &[GeometryDescriptor]) -> HybridResult<Self> {
        let ranges = geometries.iter().map(GeometryDescriptor::build_range).collect();
        Self::bottom_level_with_ranges(context, geometries, ranges)
    }

    pub fn bottom_level_with_ranges(
        context: &Context,
        geometries: &[GeometryDescriptor],
        ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
    ) -> HybridResult<Self> {
        ensure!(!geometries.is_empty(), "Bottom level structure needs at least one geometry");
        ensure!(
            geometries.len() == ranges.len(),
            "Got {} geometries but {} build ranges",
            geometries.len(),
            ranges.len()
        );

        let kind = AccelerationStructureKind::BottomLevel {
            geometries: geometries.iter().map(|g| g.to_vk()).collect(),
            ranges,
        };
        Self::new(context, kind)
    }

    /// Wraps an uploaded array of `instance_count` [`InstanceRecord`]s.
    pub fn top_level(
        context: &Context,
        instance_address: vk::DeviceAddress,
        instance_count: u32,
    ) -> HybridResult<Self> {
        let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_address,
            });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { instances });

        let kind = AccelerationStructureKind::TopLevel {
            geometry,
            range: vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(instance_count),
        };
        Self::new(context, kind)
    }

    fn new(context: &Context, kind: AccelerationStructureKind) -> HybridResult<Self> {
        let ray_tracing = context.ray_tracing()?.clone();

        let mut structure = Self {
            ray_tracing,
            kind,
            build_sizes: BuildSizes::default(),
            handle: vk::AccelerationStructureKHR::null(),
        };

        let max_primitive_counts = structure
            .kind
            .ranges()
            .iter()
            .map(|r| r.primitive_count)
            .collect::<Vec<_>>();
        structure.build_sizes = structure
            .ray_tracing
            .query_build_sizes(&structure.build_geometry_info(), &max_primitive_counts)?;

        trace!(
            "Sized {} acceleration structure: {:?}",
            structure.kind.name(),
            structure.build_sizes
        );

        Ok(structure)
    }

    fn build_geometry_info(&self) -> vk::AccelerationStructureBuildGeometryInfoKHR<'_> {
        vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(self.kind.ty())
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(self.kind.geometries())
    }

    pub fn build_sizes(&self) -> BuildSizes {
        self.build_sizes
    }

    pub fn is_top_level(&self) -> bool {
        matches!(self.kind, AccelerationStructureKind::TopLevel { .. })
    }

    pub fn is_generated(&self) -> bool {
        self.handle != vk::AccelerationStructureKHR::null()
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    /// Creates the structure inside `result` and records its build into `command_buffer`.
    ///
    /// Nothing is submitted. The structure content is undefined until the recorded build has
    /// executed and an acceleration structure write barrier follows it.
    pub fn generate(
        &mut self,
        command_buffer: &CommandBuffer,
        scratch: BufferRegion,
        result: BufferRegion,
    ) -> HybridResult<()> {
        ensure!(
            !self.is_generated(),
            "The {} acceleration structure was already generated",
            self.kind.name()
        );
        check_region(
            "Result",
            result.offset,
            self.build_sizes.result,
            result.buffer.size,
            ACCELERATION_STRUCTURE_ALIGNMENT,
        )?;
        check_region(
            "Scratch",
            scratch.offset,
            self.build_sizes.scratch,
            scratch.buffer.size,
            self.ray_tracing.scratch_alignment(),
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(result.buffer.inner)
            .offset(result.offset)
            .size(self.build_sizes.result)
            .ty(self.kind.ty());
        self.handle = unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .create_acceleration_structure(&create_info, None)
        }
        .with_context(|| format!("Failed to create {} acceleration structure", self.kind.name()))?;

        let build_info = self
            .build_geometry_info()
            .dst_acceleration_structure(self.handle)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.buffer.get_device_address() + scratch.offset,
            });
        command_buffer.build_acceleration_structure(&build_info, self.kind.ranges())?;

        trace!(
            "Recorded {} acceleration structure build (result offset {}, scratch offset {})",
            self.kind.name(),
            result.offset,
            scratch.offset
        );

        Ok(())
    }

    pub fn device_address(&self) -> HybridResult<vk::DeviceAddress> {
        ensure!(
            self.is_generated(),
            "The {} acceleration structure has no device address before it is generated",
            self.kind.name()
        );

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(self.handle);
        let address = unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .get_acceleration_structure_device_address(&address_info)
        };

        Ok(address)
    }
}

/// Fails when `required` bytes at `offset` do not fit into `buffer_size` or `offset` breaks `alignment`.
pub(crate) fn check_region(
    label: &str,
    offset: vk::DeviceSize,
    required: vk::DeviceSize,
    buffer_size: vk::DeviceSize,
    alignment: vk::DeviceSize,
) -> HybridResult<()> {
    ensure!(
        offset % alignment == 0,
        "{label} region offset {offset} is not a multiple of {alignment}"
    );
    let end = offset
        .checked_add(required)
        .ok_or_else(|| anyhow!("{label} region end overflows"))?;
    ensure!(
        end <= buffer_size,
        "{label} region [{offset}, {end}) does not fit into a buffer of {buffer_size} bytes"
    );

    Ok(())
}

impl fmt::Debug for AccelerationStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("kind", &self.kind.name())
            .field("geometry_count", &self.kind.geometries().len())
            .field("build_sizes", &self.build_sizes)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        if !self.is_generated() {
            return;
        }

        trace!("Destroying {} acceleration structure", self.kind.name());
        unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .destroy_acceleration_structure(self.handle, None)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_that_fits_exactly_is_accepted() {
        assert!(check_region("Result", 256, 512, 768, 256).is_ok());
        assert!(check_region("Scratch", 0, 128, 128, 128).is_ok());
    }

    #[test]
    fn region_past_the_buffer_end_is_rejected() {
        let err = check_region("Result", 256, 768, 768, 256).unwrap_err();
        assert!(err.to_string().contains("does not fit"));
    }

    #[test]
    fn misaligned_region_is_rejected() {
        let err = check_region("Scratch", 64, 128, 4096, 128).unwrap_err();
        assert!(err.to_string().contains("not a multiple"));
    }

    #[test]
    fn overflowing_region_is_rejected() {
        assert!(check_region("Result", u64::MAX - 255, 512, u64::MAX, 256).is_err());
    }

    #[test]
    fn geometry_range_covers_all_primitives() {
        let geometry = GeometryDescriptor {
            vertex_address: 0x1000,
            index_address: 0x2000,
            vertex_stride: 48,
            max_vertex: 3,
            primitive_count: 1,
            opaque: true,
        };

        let range = geometry.build_range();
        assert_eq!(range.primitive_count, 1);
        assert_eq!(range.primitive_offset, 0);
        assert_eq!(range.first_vertex, 0);
    }
}
