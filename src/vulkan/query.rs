use std::sync::Arc;
use std::time::Duration;

use ash::vk;

use crate::vulkan::{Context, Device};
use crate::HybridResult;

#[derive(Debug)]
pub struct TimestampQueryPool<const C: usize> {
    device: Arc<Device>,
    pub(crate) inner: vk::QueryPool,
    timestamp_period: f64,
}

impl<const C: usize> TimestampQueryPool<C> {
    pub(crate) fn new(device: Arc<Device>, timestamp_period: f32) -> HybridResult<Self> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(C as _);

        let inner = unsafe { device.inner.create_query_pool(&create_info, None)? };

        Ok(Self {
            device,
            inner,
            timestamp_period: timestamp_period as f64,
        })
    }

    /// Raw tick values of every query, blocking until all are available.
    pub fn wait_for_all_results(&self) -> HybridResult<[u64; C]> {
        let mut data = [0u64; C];

        unsafe {
            self.device.inner.get_query_pool_results(
                self.inner,
                0,
                &mut data,
                vk::QueryResultFlags::WAIT | vk::QueryResultFlags::TYPE_64,
            )?;
        }

        Ok(data)
    }

    /// Time between two written timestamps.
    pub fn elapsed(&self, from: usize, to: usize) -> HybridResult<Duration> {
        let results = self.wait_for_all_results()?;
        Ok(ticks_to_duration(results[from], results[to], self.timestamp_period))
    }
}

pub(crate) fn ticks_to_duration(start: u64, end: u64, timestamp_period: f64) -> Duration {
    let nanos = end.saturating_sub(start) as f64 * timestamp_period;
    Duration::from_nanos(nanos as u64)
}

impl<const C: usize> Drop for TimestampQueryPool<C> {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_query_pool(self.inner, None) };
    }
}

impl Context {
    pub fn create_timestamp_query_pool<const C: usize>(&self) -> HybridResult<TimestampQueryPool<C>> {
        TimestampQueryPool::new(
            self.device.clone(),
            self.physical_device.limits.timestamp_period,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::ticks_to_duration;
    use std::time::Duration;

    #[test]
    fn ticks_scale_by_timestamp_period() {
        assert_eq!(ticks_to_duration(100, 1100, 1.0), Duration::from_nanos(1000));
        assert_eq!(ticks_to_duration(0, 1000, 2.5), Duration::from_nanos(2500));
    }

    #[test]
    fn reversed_ticks_do_not_underflow() {
        assert_eq!(ticks_to_duration(500, 100, 1.0), Duration::ZERO);
    }
}
