use std::fmt;

use ash::vk;

use crate::vulkan::physical_device::{PhysicalDevice, RAY_TRACING_EXTENSIONS};
use crate::vulkan::Instance;
use crate::HybridResult;

pub struct Device {
    pub inner: ash::Device,
}

impl Device {
    pub(crate) fn new(instance: &Instance, physical_device: &PhysicalDevice) -> HybridResult<Self> {
        let queue_priorities = [1.0f32];

        let queue_create_infos = {
            let mut indices = vec![
                physical_device.graphics_queue_family.index,
                physical_device.present_queue_family.index,
            ];
            indices.dedup();

            indices
                .into_iter()
                .map(|index| {
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(index)
                        .queue_priorities(&queue_priorities)
                })
                .collect::<Vec<_>>()
        };

        let mut extensions = vec![ash::khr::swapchain::NAME.as_ptr()];
        if physical_device.supports_ray_tracing {
            extensions.extend(RAY_TRACING_EXTENSIONS.iter().map(|e| e.as_ptr()));
        }
        if cfg!(target_os = "macos") {
            extensions.push(ash::khr::portability_subset::NAME.as_ptr());
        }

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
            .ray_tracing_pipeline(true);
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut features12)
            .push_next(&mut features13);
        if physical_device.supports_ray_tracing {
            features = features.push_next(&mut as_features).push_next(&mut rt_features);
        }

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features);

        let inner = unsafe {
            instance
                .inner
                .create_device(physical_device.inner, &device_create_info, None)?
        };

        Ok(Self { inner })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("handle", &self.inner.handle()).finish()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.inner.destroy_device(None);
        }
    }
}
