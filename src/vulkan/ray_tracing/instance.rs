use std::fmt;

use anyhow::{anyhow, ensure};
use ash::vk;
use glam::{Mat4, Vec4};

use crate::HybridResult;

pub const DEFAULT_INSTANCE_MASK: u8 = 0xFF;

const CUSTOM_INDEX_BITS: u32 = 0x00FF_FFFF;

/// One entry of the instance array a top level build reads, in the layout the device expects.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct InstanceRecord(pub vk::AccelerationStructureInstanceKHR);

impl InstanceRecord {
    pub fn new(
        blas_address: vk::DeviceAddress,
        transform: &Mat4,
        instance_id: u32,
        hit_group_id: u32,
    ) -> Self {
        Self(vk::AccelerationStructureInstanceKHR {
            transform: pack_transform(transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(
                instance_id & CUSTOM_INDEX_BITS,
                DEFAULT_INSTANCE_MASK,
            ),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                hit_group_id & CUSTOM_INDEX_BITS,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: blas_address,
            },
        })
    }

    /// The stored 3x4 transform extended with the implicit `(0, 0, 0, 1)` bottom row.
    pub fn transform(&self) -> Mat4 {
        let m = self.0.transform.matrix;
        Mat4::from_cols_array(&[
            m[0], m[1], m[2], m[3], m[4], m[5], m[6], m[7], m[8], m[9], m[10], m[11], 0.0, 0.0,
            0.0, 1.0,
        ])
        .transpose()
    }

    pub fn custom_index(&self) -> u32 {
        self.0.instance_custom_index_and_mask.low_24()
    }

    pub fn mask(&self) -> u8 {
        self.0.instance_custom_index_and_mask.high_8()
    }

    pub fn sbt_record_offset(&self) -> u32 {
        self.0
            .instance_shader_binding_table_record_offset_and_flags
            .low_24()
    }

    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(
            self.0
                .instance_shader_binding_table_record_offset_and_flags
                .high_8() as u32,
        )
    }

    pub fn blas_address(&self) -> vk::DeviceAddress {
        unsafe { self.0.acceleration_structure_reference.device_handle }
    }
}

impl fmt::Debug for InstanceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRecord")
            .field("custom_index", &self.custom_index())
            .field("mask", &self.mask())
            .field("sbt_record_offset", &self.sbt_record_offset())
            .field("flags", &self.flags())
            .field("blas_address", &format_args!("{:#x}", self.blas_address()))
            .finish()
    }
}

/// Row-major top three rows of `transform`.
pub fn pack_transform(transform: &Mat4) -> vk::TransformMatrixKHR {
    let rows = transform.transpose().to_cols_array();
    let mut matrix = [0.0; 12];
    matrix.copy_from_slice(&rows[..12]);
    vk::TransformMatrixKHR { matrix }
}

/// Opaque reference to a bottom level structure, resolved to a device address at top level build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlasKey(pub u32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceDesc {
    pub blas: BlasKey,
    pub transform: Mat4,
    pub instance_id: u32,
    pub hit_group_id: u32,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceTable {
    entries: Vec<InstanceDesc>,
}

impl InstanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity placed instance of every mesh, instance id equal to the mesh index, hit group 0.
    pub fn one_per_mesh(mesh_count: usize) -> Self {
        let entries = (0..mesh_count as u32)
            .map(|i| InstanceDesc {
                blas: BlasKey(i),
                transform: Mat4::IDENTITY,
                instance_id: i,
                hit_group_id: 0,
            })
            .collect();

        Self { entries }
    }

    pub fn push(&mut self, instance: InstanceDesc) {
        self.entries.push(instance);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceDesc> {
        self.entries.iter()
    }

    /// Packs every instance, looking up the bottom level address behind its key.
    pub fn resolve<F>(&self, mut address_of: F) -> HybridResult<Vec<InstanceRecord>>
    where
        F: FnMut(BlasKey) -> HybridResult<vk::DeviceAddress>,
    {
        self.entries
            .iter()
            .map(|instance| {
                ensure!(
                    instance.instance_id <= CUSTOM_INDEX_BITS,
                    "Instance id {:#x} does not fit into 24 bits",
                    instance.instance_id
                );
                ensure!(
                    instance.hit_group_id <= CUSTOM_INDEX_BITS,
                    "Hit group offset {:#x} does not fit into 24 bits",
                    instance.hit_group_id
                );

                let address = address_of(instance.blas)?;
                ensure!(
                    address != 0,
                    "Bottom level structure {:?} resolved to a null device address",
                    instance.blas
                );

                Ok(InstanceRecord::new(
                    address,
                    &instance.transform,
                    instance.instance_id,
                    instance.hit_group_id,
                ))
            })
            .collect()
    }
}

/// Resolver over a dense list of addresses indexed by [`BlasKey`].
pub fn resolve_from_slice(addresses: &[vk::DeviceAddress]) -> impl FnMut(BlasKey) -> HybridResult<vk::DeviceAddress> + '_ {
    move |key| {
        addresses
            .get(key.0 as usize)
            .copied()
            .ok_or_else(|| anyhow!("Unknown bottom level structure {key:?}"))
    }
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use glam::{Quat, Vec3};

    use super::*;

    #[test]
    fn record_has_device_layout_size() {
        assert_eq!(size_of::<InstanceRecord>(), 64);
    }

    #[test]
    fn packed_transform_decodes_to_the_same_top_rows() {
        let transform = Mat4::from_scale_rotation_translation(
            Vec3::new(1.5, 2.0, 0.25),
            Quat::from_rotation_y(0.7) * Quat::from_rotation_x(-1.1),
            Vec3::new(10.0, -3.5, 42.0),
        );

        let record = InstanceRecord::new(0xdead_0000, &transform, 7, 2);
        let decoded = record.transform();

        for row in 0..3 {
            assert_eq!(decoded.row(row), transform.row(row));
        }
        assert_eq!(decoded.row(3), Vec4::W);
    }

    #[test]
    fn packed_transform_is_row_major() {
        let transform = Mat4::from_translation(Vec3::new(4.0, 5.0, 6.0));
        let packed = pack_transform(&transform);

        assert_eq!(
            packed.matrix,
            [1.0, 0.0, 0.0, 4.0, 0.0, 1.0, 0.0, 5.0, 0.0, 0.0, 1.0, 6.0]
        );
    }

    #[test]
    fn indices_mask_and_flags_are_packed() {
        let record = InstanceRecord::new(0x1234_5678, &Mat4::IDENTITY, 11, 3);

        assert_eq!(record.custom_index(), 11);
        assert_eq!(record.mask(), 0xFF);
        assert_eq!(record.sbt_record_offset(), 3);
        assert_eq!(
            record.flags(),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE
        );
        assert_eq!(record.blas_address(), 0x1234_5678);
    }

    #[test]
    fn indices_wider_than_24_bits_are_rejected() {
        let addresses = [0x100];
        let instance = |instance_id, hit_group_id| InstanceDesc {
            blas: BlasKey(0),
            transform: Mat4::IDENTITY,
            instance_id,
            hit_group_id,
        };

        let mut table = InstanceTable::new();
        table.push(instance(5, 2));
        table.push(instance(0x0100_0005, 2));
        assert!(table.resolve(resolve_from_slice(&addresses)).is_err());

        let mut table = InstanceTable::new();
        table.push(instance(5, 0x0100_0002));
        assert!(table.resolve(resolve_from_slice(&addresses)).is_err());

        let mut table = InstanceTable::new();
        table.push(instance(0x00FF_FFFF, 0x00FF_FFFF));
        let records = table.resolve(resolve_from_slice(&addresses)).unwrap();
        assert_eq!(records[0].custom_index(), 0x00FF_FFFF);
        assert_eq!(records[0].sbt_record_offset(), 0x00FF_FFFF);
        assert_eq!(records[0].mask(), 0xFF);
    }

    #[test]
    fn one_instance_per_mesh_resolves_in_order() {
        let addresses = [0x100, 0x200, 0x300];
        let table = InstanceTable::one_per_mesh(addresses.len());

        let records = table.resolve(resolve_from_slice(&addresses)).unwrap();

        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.blas_address(), addresses[i]);
            assert_eq!(record.custom_index(), i as u32);
            assert_eq!(record.sbt_record_offset(), 0);
        }
    }

    #[test]
    fn unknown_key_is_an_error() {
        let mut table = InstanceTable::new();
        table.push(InstanceDesc {
            blas: BlasKey(4),
            transform: Mat4::IDENTITY,
            instance_id: 0,
            hit_group_id: 0,
        });

        assert!(table.resolve(resolve_from_slice(&[0x100])).is_err());
    }

    #[test]
    fn null_address_is_an_error() {
        let table = InstanceTable::one_per_mesh(1);
        assert!(table.resolve(|_| Ok(0)).is_err());
    }
}
