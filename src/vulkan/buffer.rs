use std::mem::size_of_val;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, ensure};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use log::trace;

use crate::vulkan::{Context, Device};
use crate::HybridResult;

#[derive(Debug)]
pub struct Buffer {
    device: Arc<Device>,
    allocator: Arc<Mutex<Allocator>>,
    pub(crate) inner: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

impl Buffer {
    pub(crate) fn new(
        device: Arc<Device>,
        allocator: Arc<Mutex<Allocator>>,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        size: vk::DeviceSize,
    ) -> HybridResult<Self> {
        Self::new_aligned(device, allocator, usage, location, size, None)
    }

    /// Like [`Buffer::new`] but forces the allocation to a minimum alignment.
    pub(crate) fn new_aligned(
        device: Arc<Device>,
        allocator: Arc<Mutex<Allocator>>,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        size: vk::DeviceSize,
        alignment: Option<vk::DeviceSize>,
    ) -> HybridResult<Self> {
        trace!("Creating buffer of {size} bytes with usage {usage:?} at {location:?}");
        ensure!(size > 0, "Buffer size must be greater than zero");

        let create_info = vk::BufferCreateInfo::default().size(size).usage(usage);
        let inner = unsafe { device.inner.create_buffer(&create_info, None)? };
        let mut requirements = unsafe { device.inner.get_buffer_memory_requirements(inner) };
        if let Some(alignment) = alignment {
            requirements.alignment = requirements.alignment.max(alignment);
        }

        let allocation = allocator
            .lock()
            .map_err(|_| anyhow!("Allocator mutex poisoned"))?
            .allocate(&AllocationCreateDesc {
                name: "buffer",
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?;

        unsafe {
            device
                .inner
                .bind_buffer_memory(inner, allocation.memory(), allocation.offset())?
        };

        Ok(Self {
            device,
            allocator,
            inner,
            allocation: Some(allocation),
            size,
            usage,
            location,
        })
    }

    pub fn copy_data_to_buffer<T: Copy>(&self, data: &[T]) -> HybridResult<()> {
        self.copy_data_to_buffer_at(0, data)
    }

    /// Writes `data` at byte `offset` into a host visible buffer.
    pub fn copy_data_to_buffer_at<T: Copy>(&self, offset: usize, data: &[T]) -> HybridResult<()> {
        let byte_len = size_of_val(data);
        ensure!(
            (offset + byte_len) as vk::DeviceSize <= self.size,
            "Write of {byte_len} bytes at offset {offset} overflows buffer of {} bytes",
            self.size
        );

        let dst = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .ok_or_else(|| anyhow!("Buffer is not host visible"))?;

        unsafe {
            let src = std::slice::from_raw_parts(data.as_ptr() as *const u8, byte_len);
            let dst = std::slice::from_raw_parts_mut((dst.as_ptr() as *mut u8).add(offset), byte_len);
            dst.copy_from_slice(src);
        }

        Ok(())
    }

    pub fn get_device_address(&self) -> vk::DeviceAddress {
        let addr_info = vk::BufferDeviceAddressInfo::default().buffer(self.inner);
        unsafe { self.device.inner.get_buffer_device_address(&addr_info) }
    }
}

impl Context {
    pub fn create_buffer(
        &self,
        usage: vk::BufferUsageFlags,
        memory_location: MemoryLocation,
        size: vk::DeviceSize,
    ) -> HybridResult<Buffer> {
        Buffer::new(
            self.device.clone(),
            self.allocator.clone(),
            usage,
            memory_location,
            size,
        )
    }

    pub fn create_aligned_buffer(
        &self,
        usage: vk::BufferUsageFlags,
        memory_location: MemoryLocation,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> HybridResult<Buffer> {
        Buffer::new_aligned(
            self.device.clone(),
            self.allocator.clone(),
            usage,
            memory_location,
            size,
            Some(alignment),
        )
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        trace!("Destroying buffer of {} bytes", self.size);
        unsafe { self.device.inner.destroy_buffer(self.inner, None) };

        if let (Some(allocation), Ok(mut allocator)) = (self.allocation.take(), self.allocator.lock()) {
            if let Err(err) = allocator.free(allocation) {
                log::error!("Failed to free buffer memory: {err}");
            }
        }
    }
}
