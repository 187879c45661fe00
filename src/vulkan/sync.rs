use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use ash::vk;

use crate::vulkan::{Context, Device};
use crate::HybridResult;

#[derive(Debug)]
pub struct Semaphore {
    device: Arc<Device>,
    pub(crate) inner: vk::Semaphore,
}

impl Semaphore {
    pub(crate) fn new(device: Arc<Device>) -> HybridResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let inner = unsafe { device.inner.create_semaphore(&semaphore_info, None)? };

        Ok(Self { device, inner })
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_semaphore(self.inner, None) };
    }
}

#[derive(Debug)]
pub struct Fence {
    device: Arc<Device>,
    pub(crate) inner: vk::Fence,
}

impl Fence {
    pub(crate) fn new(device: Arc<Device>, flags: Option<vk::FenceCreateFlags>) -> HybridResult<Self> {
        let flags = flags.unwrap_or_else(vk::FenceCreateFlags::empty);

        let fence_info = vk::FenceCreateInfo::default().flags(flags);
        let inner = unsafe { device.inner.create_fence(&fence_info, None)? };

        Ok(Self { device, inner })
    }

    /// Blocks until the fence is signaled. Expiry of `timeout` is an error, not a retry.
    pub fn wait(&self, timeout: Duration) -> HybridResult<()> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let result = unsafe {
            self.device
                .inner
                .wait_for_fences(&[self.inner], true, timeout_ns)
        };

        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => bail!("Fence wait timed out after {:?}", timeout),
            Err(err) => Err(err.into()),
        }
    }

    pub fn reset(&self) -> HybridResult<()> {
        unsafe { self.device.inner.reset_fences(&[self.inner])? };

        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_fence(self.inner, None) };
    }
}

impl Context {
    pub fn create_semaphore(&self) -> HybridResult<Semaphore> {
        Semaphore::new(self.device.clone())
    }

    pub fn create_fence(&self, flags: Option<vk::FenceCreateFlags>) -> HybridResult<Fence> {
        Fence::new(self.device.clone(), flags)
    }
}
