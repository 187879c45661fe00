use std::ops::Add;

use anyhow::ensure;
use ash::vk;

use crate::vulkan::ray_tracing::RayTracingContext;
use crate::vulkan::utils::compute_aligned_size;
use crate::HybridResult;

/// Placement alignment of every acceleration structure inside its backing buffer.
pub const ACCELERATION_STRUCTURE_ALIGNMENT: vk::DeviceSize = 256;

/// Used when the device reports a scratch offset alignment of zero.
pub const FALLBACK_SCRATCH_ALIGNMENT: vk::DeviceSize = 256;

pub(crate) fn effective_scratch_alignment(reported: u32) -> vk::DeviceSize {
    if reported == 0 {
        FALLBACK_SCRATCH_ALIGNMENT
    } else {
        reported as vk::DeviceSize
    }
}

/// Byte sizes a single build needs, already rounded to the placement rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub result: vk::DeviceSize,
    pub scratch: vk::DeviceSize,
    pub update_scratch: vk::DeviceSize,
}

impl BuildSizes {
    /// Rounds the raw device answer: result to 256 bytes, both scratch sizes to `scratch_alignment`.
    pub fn from_requirements(
        result: vk::DeviceSize,
        scratch: vk::DeviceSize,
        update_scratch: vk::DeviceSize,
        scratch_alignment: vk::DeviceSize,
    ) -> Self {
        Self {
            result: compute_aligned_size(result, ACCELERATION_STRUCTURE_ALIGNMENT),
            scratch: compute_aligned_size(scratch, scratch_alignment),
            update_scratch: compute_aligned_size(update_scratch, scratch_alignment),
        }
    }
}

impl Add for BuildSizes {
    type Output = BuildSizes;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            result: self.result + rhs.result,
            scratch: self.scratch + rhs.scratch,
            update_scratch: self.update_scratch + rhs.update_scratch,
        }
    }
}

impl std::iter::Sum for BuildSizes {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

impl RayTracingContext {
    pub fn query_build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        max_primitive_counts: &[u32],
    ) -> HybridResult<BuildSizes> {
        ensure!(
            max_primitive_counts.len() == build_info.geometry_count as usize,
            "Max primitive count length should match the number of geometries (expected: {}, actual: {})",
            build_info.geometry_count,
            max_primitive_counts.len()
        );

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.acceleration_structure_fn.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                build_info,
                max_primitive_counts,
                &mut sizes,
            )
        };

        Ok(BuildSizes::from_requirements(
            sizes.acceleration_structure_size,
            sizes.build_scratch_size,
            sizes.update_scratch_size,
            self.scratch_alignment(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounded_sizes_are_aligned_and_never_shrink() {
        for scratch_alignment in [32, 64, 128, 256] {
            for raw in [0u64, 1, 127, 128, 129, 255, 256, 257, 1000, 4096, 70_001] {
                let sizes = BuildSizes::from_requirements(raw, raw, raw, scratch_alignment);

                assert_eq!(sizes.result % ACCELERATION_STRUCTURE_ALIGNMENT, 0);
                assert_eq!(sizes.scratch % scratch_alignment, 0);
                assert_eq!(sizes.update_scratch % scratch_alignment, 0);
                assert!(sizes.result >= raw);
                assert!(sizes.scratch >= raw);
                assert!(sizes.result - raw < ACCELERATION_STRUCTURE_ALIGNMENT);
                assert!(sizes.scratch - raw < scratch_alignment);
            }
        }
    }

    #[test]
    fn single_triangle_on_device_with_scratch_alignment_128() {
        // Raw answer for one opaque triangle as reported by a typical driver.
        let sizes = BuildSizes::from_requirements(1_408, 1_160, 0, 128);

        assert_eq!(sizes.result, 1_536);
        assert_eq!(sizes.scratch, 1_280);
        assert_eq!(sizes.update_scratch, 0);
    }

    #[test]
    fn result_and_scratch_round_independently() {
        let sizes = BuildSizes::from_requirements(300, 300, 300, 64);

        assert_eq!(sizes.result, 512);
        assert_eq!(sizes.scratch, 320);
        assert_eq!(sizes.update_scratch, 320);
    }

    #[test]
    fn zero_reported_scratch_alignment_uses_fallback() {
        assert_eq!(effective_scratch_alignment(0), FALLBACK_SCRATCH_ALIGNMENT);
        assert_eq!(effective_scratch_alignment(128), 128);
    }

    #[test]
    fn sizes_sum_componentwise() {
        let total: BuildSizes = [
            BuildSizes { result: 256, scratch: 128, update_scratch: 0 },
            BuildSizes { result: 512, scratch: 384, update_scratch: 128 },
        ]
        .into_iter()
        .sum();

        assert_eq!(total, BuildSizes { result: 768, scratch: 512, update_scratch: 128 });
    }
}
