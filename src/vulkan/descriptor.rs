use std::sync::Arc;

use ash::vk;
use log::{debug, trace};

use crate::vulkan::ray_tracing::AccelerationStructure;
use crate::vulkan::{Buffer, Context, Device, ImageView};
use crate::HybridResult;

/// Upper bound for the sets of a single pool grown by [`DescriptorAllocator`].
pub const MAX_SETS_PER_POOL: u32 = 4092;

pub struct DescriptorSetLayout {
    device: Arc<Device>,
    pub(crate) inner: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    pub(crate) fn new(
        device: Arc<Device>,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> HybridResult<Self> {
        let dsl_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        let inner = unsafe { device.inner.create_descriptor_set_layout(&dsl_info, None)? };

        Ok(Self { device, inner })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .inner
                .destroy_descriptor_set_layout(self.inner, None);
        }
    }
}

pub struct DescriptorPool {
    device: Arc<Device>,
    pub(crate) inner: vk::DescriptorPool,
}

impl DescriptorPool {
    pub(crate) fn new(
        device: Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> HybridResult<Self> {
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        let inner = unsafe { device.inner.create_descriptor_pool(&pool_info, None)? };

        Ok(Self { device, inner })
    }

    /// Raw result so callers can tell an exhausted pool from other failures.
    fn try_allocate_set(&self, layout: &DescriptorSetLayout) -> Result<DescriptorSet, vk::Result> {
        let layouts = [layout.inner];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.inner)
            .set_layouts(&layouts);

        let inner = unsafe { self.device.inner.allocate_descriptor_sets(&allocate_info)? }[0];

        Ok(DescriptorSet {
            device: self.device.clone(),
            inner,
        })
    }

    fn reset(&self) -> HybridResult<()> {
        unsafe {
            self.device
                .inner
                .reset_descriptor_pool(self.inner, vk::DescriptorPoolResetFlags::empty())?
        };
        Ok(())
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_descriptor_pool(self.inner, None) };
    }
}

/// Released together with the pool it was allocated from.
#[derive(Clone)]
pub struct DescriptorSet {
    device: Arc<Device>,
    pub(crate) inner: vk::DescriptorSet,
}

pub struct WriteDescriptorSet<'a> {
    pub binding: u32,
    pub kind: WriteDescriptorSetKind<'a>,
}

pub enum WriteDescriptorSetKind<'a> {
    StorageImage {
        view: &'a ImageView,
        layout: vk::ImageLayout,
    },
    UniformBuffer {
        buffer: &'a Buffer,
    },
    StorageBuffer {
        buffer: &'a Buffer,
    },
    CombinedImageSampler {
        view: &'a ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
    AccelerationStructure {
        acceleration_structure: &'a AccelerationStructure,
    },
}

impl DescriptorSet {
    pub fn handle(&self) -> vk::DescriptorSet {
        self.inner
    }

    pub fn update(&self, writes: &[WriteDescriptorSet]) {
        for write in writes {
            self.update_one(write);
        }
    }

    fn update_one(&self, write: &WriteDescriptorSet) {
        let base = vk::WriteDescriptorSet::default()
            .dst_set(self.inner)
            .dst_binding(write.binding);

        match write.kind {
            WriteDescriptorSetKind::StorageImage { view, layout } => {
                let img_info = [vk::DescriptorImageInfo::default()
                    .image_view(view.inner)
                    .image_layout(layout)];
                let wds = base
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(&img_info);
                self.write(&wds);
            }
            WriteDescriptorSetKind::UniformBuffer { buffer } => {
                let buf_info = [vk::DescriptorBufferInfo::default()
                    .buffer(buffer.inner)
                    .range(vk::WHOLE_SIZE)];
                let wds = base
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buf_info);
                self.write(&wds);
            }
            WriteDescriptorSetKind::StorageBuffer { buffer } => {
                let buf_info = [vk::DescriptorBufferInfo::default()
                    .buffer(buffer.inner)
                    .range(vk::WHOLE_SIZE)];
                let wds = base
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(&buf_info);
                self.write(&wds);
            }
            WriteDescriptorSetKind::CombinedImageSampler {
                view,
                sampler,
                layout,
            } => {
                let img_info = [vk::DescriptorImageInfo::default()
                    .image_view(view.inner)
                    .sampler(sampler)
                    .image_layout(layout)];
                let wds = base
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&img_info);
                self.write(&wds);
            }
            WriteDescriptorSetKind::AccelerationStructure {
                acceleration_structure,
            } => {
                let handles = [acceleration_structure.handle()];
                let mut write_set_as =
                    vk::WriteDescriptorSetAccelerationStructureKHR::default()
                        .acceleration_structures(&handles);
                let mut wds = base
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .push_next(&mut write_set_as);
                wds.descriptor_count = 1;
                self.write(&wds);
            }
        }
    }

    fn write(&self, write: &vk::WriteDescriptorSet) {
        unsafe {
            self.device
                .inner
                .update_descriptor_sets(std::slice::from_ref(write), &[])
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolSizeRatio {
    pub ty: vk::DescriptorType,
    pub ratio: f32,
}

/// Per pool descriptor counts for `sets` sets, at least one of every type.
pub fn pool_sizes(ratios: &[PoolSizeRatio], sets: u32) -> Vec<vk::DescriptorPoolSize> {
    ratios
        .iter()
        .map(|r| vk::DescriptorPoolSize {
            ty: r.ty,
            descriptor_count: ((r.ratio * sets as f32) as u32).max(1),
        })
        .collect()
}

/// Sets per pool, growing by half every time a fresh pool is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGrowth {
    sets_per_pool: u32,
}

impl PoolGrowth {
    pub fn new(initial_sets: u32) -> Self {
        Self {
            sets_per_pool: initial_sets.clamp(1, MAX_SETS_PER_POOL),
        }
    }

    pub fn sets_per_pool(&self) -> u32 {
        self.sets_per_pool
    }

    /// Size for the pool about to be created, advancing the policy.
    pub fn next_pool(&mut self) -> u32 {
        let sets = self.sets_per_pool;
        self.sets_per_pool = ((sets as f32 * 1.5) as u32).min(MAX_SETS_PER_POOL);
        sets
    }
}

/// Growable allocator over a list of pools. Exhausted pools are kept until [`clear`](Self::clear).
pub struct DescriptorAllocator {
    device: Arc<Device>,
    ratios: Vec<PoolSizeRatio>,
    full_pools: Vec<DescriptorPool>,
    ready_pools: Vec<DescriptorPool>,
    growth: PoolGrowth,
}

impl DescriptorAllocator {
    pub(crate) fn new(
        device: Arc<Device>,
        initial_sets: u32,
        ratios: Vec<PoolSizeRatio>,
    ) -> HybridResult<Self> {
        let mut allocator = Self {
            device,
            ratios,
            full_pools: Vec::new(),
            ready_pools: Vec::new(),
            growth: PoolGrowth::new(initial_sets),
        };

        let pool = allocator.create_pool()?;
        allocator.ready_pools.push(pool);

        Ok(allocator)
    }

    fn create_pool(&mut self) -> HybridResult<DescriptorPool> {
        let sets = self.growth.next_pool();
        trace!("Creating descriptor pool for {sets} sets");
        DescriptorPool::new(self.device.clone(), sets, &pool_sizes(&self.ratios, sets))
    }

    fn get_pool(&mut self) -> HybridResult<DescriptorPool> {
        match self.ready_pools.pop() {
            Some(pool) => Ok(pool),
            None => self.create_pool(),
        }
    }

    pub fn allocate(&mut self, layout: &DescriptorSetLayout) -> HybridResult<DescriptorSet> {
        let pool = self.get_pool()?;

        let (pool, set) = match pool.try_allocate_set(layout) {
            Ok(set) => (pool, set),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                debug!("Descriptor pool exhausted, retrying on a fresh pool");
                self.full_pools.push(pool);

                let pool = self.get_pool()?;
                let set = pool.try_allocate_set(layout)?;
                (pool, set)
            }
            Err(err) => {
                self.ready_pools.push(pool);
                return Err(err.into());
            }
        };

        self.ready_pools.push(pool);
        Ok(set)
    }

    /// Resets every pool. Sets allocated before must no longer be in use.
    pub fn clear(&mut self) -> HybridResult<()> {
        for pool in self.ready_pools.iter() {
            pool.reset()?;
        }
        for pool in self.full_pools.drain(..) {
            pool.reset()?;
            self.ready_pools.push(pool);
        }

        Ok(())
    }
}

impl Context {
    pub fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> HybridResult<DescriptorSetLayout> {
        DescriptorSetLayout::new(self.device.clone(), bindings)
    }

    pub fn create_descriptor_allocator(
        &self,
        initial_sets: u32,
        ratios: Vec<PoolSizeRatio>,
    ) -> HybridResult<DescriptorAllocator> {
        DescriptorAllocator::new(self.device.clone(), initial_sets, ratios)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pools_grow_by_half_until_the_cap() {
        let mut growth = PoolGrowth::new(1000);

        assert_eq!(growth.next_pool(), 1000);
        assert_eq!(growth.next_pool(), 1500);
        assert_eq!(growth.next_pool(), 2250);
        assert_eq!(growth.next_pool(), 3375);
        assert_eq!(growth.next_pool(), MAX_SETS_PER_POOL);
        assert_eq!(growth.next_pool(), MAX_SETS_PER_POOL);
    }

    #[test]
    fn growth_starts_at_least_at_one_set() {
        let mut growth = PoolGrowth::new(0);
        assert_eq!(growth.next_pool(), 1);
        assert_eq!(growth.next_pool(), 1);
    }

    #[test]
    fn pool_sizes_follow_the_ratios() {
        let ratios = [
            PoolSizeRatio {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                ratio: 3.0,
            },
            PoolSizeRatio {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                ratio: 0.5,
            },
            PoolSizeRatio {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                ratio: 0.0001,
            },
        ];

        let sizes = pool_sizes(&ratios, 10);

        assert_eq!(sizes[0].descriptor_count, 30);
        assert_eq!(sizes[0].ty, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(sizes[1].descriptor_count, 5);
        assert_eq!(sizes[2].descriptor_count, 1);
    }
}
