use anyhow::{ensure, Context as _};
use ash::vk;
use gpu_allocator::MemoryLocation;
use log::debug;

use crate::vulkan::ray_tracing::{RayTracingPipeline, RayTracingShaderGroupInfo};
use crate::vulkan::utils::compute_aligned_size;
use crate::vulkan::{Buffer, Context};
use crate::HybridResult;

/// A record of the table: the handle of `group_index` followed by `inline_data`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderBindingTableEntry {
    pub group_index: u32,
    pub inline_data: Vec<u8>,
}

impl ShaderBindingTableEntry {
    pub fn new(group_index: u32) -> Self {
        Self {
            group_index,
            inline_data: Vec::new(),
        }
    }

    pub fn with_inline_data(group_index: u32, inline_data: Vec<u8>) -> Self {
        Self {
            group_index,
            inline_data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderBindingTableDesc {
    pub raygen: Vec<ShaderBindingTableEntry>,
    pub miss: Vec<ShaderBindingTableEntry>,
    pub hit: Vec<ShaderBindingTableEntry>,
    pub callable: Vec<ShaderBindingTableEntry>,
}

impl ShaderBindingTableDesc {
    /// One record without inline data per group of the pipeline.
    pub fn from_group_info(info: &RayTracingShaderGroupInfo) -> Self {
        let entries = |indices: &[u32]| {
            indices
                .iter()
                .copied()
                .map(ShaderBindingTableEntry::new)
                .collect()
        };

        Self {
            raygen: entries(&info.raygen),
            miss: entries(&info.miss),
            hit: entries(&info.hit),
            callable: Vec::new(),
        }
    }

    fn regions(&self) -> [&[ShaderBindingTableEntry]; 4] {
        [&self.raygen, &self.miss, &self.hit, &self.callable]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionLayout {
    pub offset: vk::DeviceSize,
    pub stride: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub entry_count: usize,
}

impl RegionLayout {
    fn new(
        offset: vk::DeviceSize,
        handle_size: vk::DeviceSize,
        base_alignment: vk::DeviceSize,
        entries: &[ShaderBindingTableEntry],
    ) -> Self {
        if entries.is_empty() {
            return Self {
                offset,
                ..Default::default()
            };
        }

        let max_inline = entries
            .iter()
            .map(|e| e.inline_data.len())
            .max()
            .unwrap_or(0) as vk::DeviceSize;
        let stride = compute_aligned_size(handle_size + max_inline, base_alignment);

        Self {
            offset,
            stride,
            size: stride * entries.len() as vk::DeviceSize,
            entry_count: entries.len(),
        }
    }

    pub fn end(&self) -> vk::DeviceSize {
        self.offset + self.size
    }

    fn device_region(&self, table_address: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        if self.entry_count == 0 {
            return vk::StridedDeviceAddressRegionKHR::default();
        }

        vk::StridedDeviceAddressRegionKHR {
            device_address: table_address + self.offset,
            stride: self.stride,
            size: self.size,
        }
    }
}

/// Byte layout of the table: raygen, miss, hit and callable regions back to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderBindingTableLayout {
    pub handle_size: vk::DeviceSize,
    pub raygen: RegionLayout,
    pub miss: RegionLayout,
    pub hit: RegionLayout,
    pub callable: RegionLayout,
    pub total_size: vk::DeviceSize,
}

impl ShaderBindingTableLayout {
    pub fn new(handle_size: u32, base_alignment: u32, desc: &ShaderBindingTableDesc) -> HybridResult<Self> {
        ensure!(
            base_alignment.is_power_of_two(),
            "Shader group base alignment {base_alignment} is not a power of two"
        );
        ensure!(
            desc.raygen.len() == 1,
            "The table needs exactly one raygen record, got {}",
            desc.raygen.len()
        );

        let handle_size = handle_size as vk::DeviceSize;
        let base_alignment = base_alignment as vk::DeviceSize;

        let raygen = RegionLayout::new(0, handle_size, base_alignment, &desc.raygen);
        let miss = RegionLayout::new(raygen.end(), handle_size, base_alignment, &desc.miss);
        let hit = RegionLayout::new(miss.end(), handle_size, base_alignment, &desc.hit);
        let callable = RegionLayout::new(hit.end(), handle_size, base_alignment, &desc.callable);

        Ok(Self {
            handle_size,
            raygen,
            miss,
            hit,
            callable,
            total_size: callable.end(),
        })
    }

    pub fn regions(&self) -> [RegionLayout; 4] {
        [self.raygen, self.miss, self.hit, self.callable]
    }

    /// Fills `dst` with the records of `desc`. `handles` holds the raw group handles back to
    /// back, as returned by the device. Every record starts at a multiple of its region stride.
    pub fn write(&self, desc: &ShaderBindingTableDesc, handles: &[u8], dst: &mut [u8]) -> HybridResult<()> {
        ensure!(
            dst.len() as vk::DeviceSize >= self.total_size,
            "Destination of {} bytes is smaller than the table ({} bytes)",
            dst.len(),
            self.total_size
        );

        let handle_size = self.handle_size as usize;
        for (region, entries) in self.regions().iter().zip(desc.regions()) {
            for (i, entry) in entries.iter().enumerate() {
                let handle_start = entry.group_index as usize * handle_size;
                let handle = handles
                    .get(handle_start..handle_start + handle_size)
                    .with_context(|| {
                        format!(
                            "Shader group {} is outside the {} bytes of fetched handles",
                            entry.group_index,
                            handles.len()
                        )
                    })?;

                let record_start = (region.offset + i as vk::DeviceSize * region.stride) as usize;
                let inline_start = record_start + handle_size;
                dst[record_start..inline_start].copy_from_slice(handle);
                dst[inline_start..inline_start + entry.inline_data.len()]
                    .copy_from_slice(&entry.inline_data);
            }
        }

        Ok(())
    }
}

/// Regions in the form the trace rays command consumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShaderBindingTableRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

pub struct ShaderBindingTable {
    _buffer: Buffer,
    pub layout: ShaderBindingTableLayout,
    pub regions: ShaderBindingTableRegions,
}

impl ShaderBindingTable {
    pub fn new(
        context: &Context,
        pipeline: &RayTracingPipeline,
        desc: &ShaderBindingTableDesc,
    ) -> HybridResult<Self> {
        let ray_tracing = context.ray_tracing()?;
        let properties = ray_tracing.pipeline_properties;

        let layout = ShaderBindingTableLayout::new(
            properties.shader_group_handle_size,
            properties.shader_group_base_alignment,
            desc,
        )?;
        for region in layout.regions() {
            ensure!(
                region.stride <= properties.max_shader_group_stride as vk::DeviceSize,
                "Record stride {} exceeds the device limit of {}",
                region.stride,
                properties.max_shader_group_stride
            );
        }

        let group_count = pipeline.group_info.group_count;
        let expected_len = group_count as usize * properties.shader_group_handle_size as usize;
        let handles = unsafe {
            ray_tracing.pipeline_fn.get_ray_tracing_shader_group_handles(
                pipeline.inner,
                0,
                group_count,
                expected_len,
            )
        }
        .context("Failed to get ray tracing shader group handles")?;
        ensure!(
            handles.len() == expected_len,
            "Device returned {} bytes of shader group handles, expected {expected_len}",
            handles.len()
        );

        let mut data = vec![0u8; layout.total_size as usize];
        layout.write(desc, &handles, &mut data)?;

        let buffer = context.create_aligned_buffer(
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
            MemoryLocation::CpuToGpu,
            layout.total_size,
            properties.shader_group_base_alignment as vk::DeviceSize,
        )?;
        buffer.copy_data_to_buffer(&data)?;

        let address = buffer.get_device_address();
        let regions = ShaderBindingTableRegions {
            raygen: layout.raygen.device_region(address),
            miss: layout.miss.device_region(address),
            hit: layout.hit.device_region(address),
            callable: layout.callable.device_region(address),
        };

        debug!("Shader binding table: {layout:?}");

        Ok(Self {
            _buffer: buffer,
            layout,
            regions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HANDLE_SIZE: u32 = 32;

    fn entries(groups: impl IntoIterator<Item = u32>) -> Vec<ShaderBindingTableEntry> {
        groups.into_iter().map(ShaderBindingTableEntry::new).collect()
    }

    /// `count` handles, handle `i` filled with the byte `i + 1`.
    fn fake_handles(count: usize) -> Vec<u8> {
        (0..count)
            .flat_map(|i| std::iter::repeat(i as u8 + 1).take(HANDLE_SIZE as usize))
            .collect()
    }

    #[test]
    fn one_raygen_two_miss_two_hit_groups() {
        let desc = ShaderBindingTableDesc {
            raygen: entries([0]),
            miss: entries([1, 2]),
            hit: entries([3, 4]),
            callable: Vec::new(),
        };

        let layout = ShaderBindingTableLayout::new(HANDLE_SIZE, 64, &desc).unwrap();

        assert_eq!(layout.raygen.stride, 64);
        assert_eq!(layout.miss.stride, 64);
        assert_eq!(layout.hit.stride, 64);
        assert_eq!(layout.raygen.offset, 0);
        assert_eq!(layout.miss.offset, 64);
        assert_eq!(layout.hit.offset, 192);
        assert_eq!(layout.callable, RegionLayout { offset: 320, ..Default::default() });
        assert_eq!(layout.total_size, 320);
    }

    #[test]
    fn callable_region_and_inline_data_widen_their_own_stride() {
        let desc = ShaderBindingTableDesc {
            raygen: entries([0]),
            miss: entries([1, 2]),
            hit: vec![
                ShaderBindingTableEntry::with_inline_data(3, vec![0xAA; 8]),
                ShaderBindingTableEntry::new(4),
                ShaderBindingTableEntry::with_inline_data(5, vec![0xBB; 40]),
            ],
            callable: vec![ShaderBindingTableEntry::with_inline_data(6, vec![0xCC; 16])],
        };

        let layout = ShaderBindingTableLayout::new(HANDLE_SIZE, 64, &desc).unwrap();

        assert_eq!(layout.miss.stride, 64);
        assert_eq!(layout.hit.offset, 192);
        assert_eq!(layout.hit.stride, 128);
        assert_eq!(layout.hit.size, 384);
        assert_eq!(layout.callable.offset, 576);
        assert_eq!(layout.callable.stride, 64);
        assert_eq!(layout.total_size, 640);
    }

    #[test]
    fn strides_hold_every_record_and_stay_aligned() {
        for base_alignment in [16u32, 32, 64, 128] {
            for handle_size in [16u32, 32] {
                for inline in [0usize, 1, 4, 15, 16, 17, 48, 100] {
                    let desc = ShaderBindingTableDesc {
                        raygen: entries([0]),
                        miss: vec![
                            ShaderBindingTableEntry::new(1),
                            ShaderBindingTableEntry::with_inline_data(2, vec![1; inline]),
                        ],
                        hit: vec![ShaderBindingTableEntry::with_inline_data(3, vec![2; inline])],
                        callable: Vec::new(),
                    };

                    let layout = ShaderBindingTableLayout::new(handle_size, base_alignment, &desc).unwrap();

                    for (region, region_entries) in layout.regions().iter().zip(desc.regions()) {
                        if region_entries.is_empty() {
                            continue;
                        }
                        let max_inline = region_entries.iter().map(|e| e.inline_data.len()).max().unwrap();
                        assert!(region.stride >= handle_size as u64 + max_inline as u64);
                        assert_eq!(region.stride % base_alignment as u64, 0);
                        assert_eq!(region.offset % base_alignment as u64, 0);
                    }
                    assert_eq!(layout.miss.offset, layout.raygen.end());
                    assert_eq!(layout.hit.offset, layout.miss.end());
                }
            }
        }
    }

    #[test]
    fn records_are_written_at_stride_offsets() {
        let desc = ShaderBindingTableDesc {
            raygen: entries([0]),
            miss: entries([2, 1]),
            hit: vec![ShaderBindingTableEntry::with_inline_data(3, vec![0xAA; 8])],
            callable: Vec::new(),
        };
        let layout = ShaderBindingTableLayout::new(HANDLE_SIZE, 64, &desc).unwrap();
        let handles = fake_handles(4);
        let mut dst = vec![0u8; layout.total_size as usize];

        layout.write(&desc, &handles, &mut dst).unwrap();

        assert!(dst[0..32].iter().all(|&b| b == 1));
        assert!(dst[32..64].iter().all(|&b| b == 0));
        // Miss records keep the order of the description, not of the groups.
        assert!(dst[64..96].iter().all(|&b| b == 3));
        assert!(dst[128..160].iter().all(|&b| b == 2));
        assert!(dst[192..224].iter().all(|&b| b == 4));
        assert!(dst[224..232].iter().all(|&b| b == 0xAA));
        assert!(dst[232..256].iter().all(|&b| b == 0));
    }

    #[test]
    fn missing_handle_bytes_are_an_error() {
        let desc = ShaderBindingTableDesc {
            raygen: entries([0]),
            miss: entries([1]),
            hit: entries([3]),
            callable: Vec::new(),
        };
        let layout = ShaderBindingTableLayout::new(HANDLE_SIZE, 64, &desc).unwrap();
        let mut dst = vec![0u8; layout.total_size as usize];

        assert!(layout.write(&desc, &fake_handles(2), &mut dst).is_err());
    }

    #[test]
    fn table_needs_exactly_one_raygen_record() {
        let desc = ShaderBindingTableDesc {
            raygen: Vec::new(),
            miss: entries([0]),
            ..Default::default()
        };
        assert!(ShaderBindingTableLayout::new(HANDLE_SIZE, 64, &desc).is_err());
    }

    #[test]
    fn base_alignment_must_be_a_power_of_two() {
        let desc = ShaderBindingTableDesc {
            raygen: entries([0]),
            ..Default::default()
        };
        assert!(ShaderBindingTableLayout::new(HANDLE_SIZE, 48, &desc).is_err());
    }

    #[test]
    fn desc_from_group_info_keeps_roles() {
        let info = RayTracingShaderGroupInfo {
            raygen: vec![0],
            miss: vec![1, 2],
            hit: vec![3, 4],
            group_count: 5,
        };

        let desc = ShaderBindingTableDesc::from_group_info(&info);

        assert_eq!(desc.raygen, entries([0]));
        assert_eq!(desc.miss, entries([1, 2]));
        assert_eq!(desc.hit, entries([3, 4]));
        assert!(desc.callable.is_empty());
    }
}
