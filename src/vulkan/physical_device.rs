use std::ffi::CStr;

use anyhow::bail;
use ash::vk;
use log::info;

use crate::renderer::FeatureValue;
use crate::vulkan::{Instance, QueueFamily, Surface};
use crate::HybridResult;

pub(crate) const RAY_TRACING_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
];

#[derive(Debug, Clone)]
pub struct PhysicalDevice {
    pub inner: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub limits: vk::PhysicalDeviceLimits,

    pub graphics_queue_family: QueueFamily,
    pub present_queue_family: QueueFamily,

    pub surface_format: vk::SurfaceFormatKHR,
    pub depth_format: vk::Format,
    pub present_mode: vk::PresentModeKHR,

    pub supports_ray_tracing: bool,
}

#[derive(Debug, Clone)]
struct PhysicalDeviceCapabilities {
    inner: vk::PhysicalDevice,
    name: String,
    device_type: vk::PhysicalDeviceType,
    limits: vk::PhysicalDeviceLimits,

    graphics_queues: Vec<QueueFamily>,
    present_queues: Vec<QueueFamily>,

    supports_swapchain: bool,
    supports_core_features: bool,
    supports_ray_tracing: bool,

    surface_formats: Vec<vk::SurfaceFormatKHR>,
    depth_formats: Vec<vk::Format>,
    present_modes: Vec<vk::PresentModeKHR>,
}

/// Lower is worse. Discrete gpus score 0.
pub(crate) fn device_type_penalty(device_type: vk::PhysicalDeviceType) -> i32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::OTHER => -10,
        vk::PhysicalDeviceType::INTEGRATED_GPU => -50,
        vk::PhysicalDeviceType::CPU => -100,
        _ => -150,
    }
}

impl Instance {
    pub(crate) fn select_suitable_physical_device(
        &self,
        surface: &Surface,
        ray_tracing: FeatureValue,
    ) -> HybridResult<PhysicalDevice> {
        let physical_devices = unsafe { self.inner.enumerate_physical_devices()? };

        let mut candidates = physical_devices
            .into_iter()
            .map(|pd| PhysicalDeviceCapabilities::new(self, surface, pd))
            .collect::<HybridResult<Vec<_>>>()?
            .into_iter()
            .filter_map(|capabilities| {
                info!("Possible Device: {}", capabilities.name);

                let mut points = device_type_penalty(capabilities.device_type);
                info!(" -- Device Type: {:?} => {points} Points", capabilities.device_type);

                let mut ok = true;
                if capabilities.graphics_queues.is_empty() {
                    ok = false;
                    info!(" -- No Graphics Queue");
                }
                if capabilities.present_queues.is_empty() {
                    ok = false;
                    info!(" -- No Present Queue");
                }
                if capabilities.surface_formats.is_empty() || capabilities.present_modes.is_empty() {
                    ok = false;
                    info!(" -- No usable surface format or present mode");
                }
                if capabilities.depth_formats.is_empty() {
                    ok = false;
                    info!(" -- No depth format");
                }
                if !capabilities.supports_swapchain {
                    ok = false;
                    info!(" -- Swapchain extension missing");
                }
                if !capabilities.supports_core_features {
                    ok = false;
                    info!(" -- Vulkan 1.2/1.3 features missing");
                }
                if !capabilities.supports_ray_tracing {
                    match ray_tracing {
                        FeatureValue::Needed => {
                            ok = false;
                            info!(" -- Ray tracing needed but not supported");
                        }
                        FeatureValue::Wanted => {
                            points -= 20;
                            info!(" -- Ray tracing wanted but not supported => -20 Points");
                        }
                        FeatureValue::NotUsed => {}
                    }
                }

                ok.then_some((capabilities, points))
            })
            .collect::<Vec<_>>();

        if candidates.is_empty() {
            bail!("No suitable Device found!")
        }

        candidates.sort_by(|(c1, p1), (c2, p2)| {
            p2.cmp(p1).then(
                c2.limits
                    .max_memory_allocation_count
                    .cmp(&c1.limits.max_memory_allocation_count),
            )
        });

        let (selected, _) = candidates.swap_remove(0);
        info!("Selected Physical Device: {}", selected.name);

        let surface_format = selected
            .surface_formats
            .iter()
            .copied()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .unwrap_or(selected.surface_formats[0]);
        info!(" -- Surface format: {:?} {:?}", surface_format.format, surface_format.color_space);

        let present_mode = selected
            .present_modes
            .iter()
            .copied()
            .find(|m| *m == vk::PresentModeKHR::MAILBOX)
            .unwrap_or(vk::PresentModeKHR::FIFO);
        info!(" -- Present Mode: {:?}", present_mode);

        let depth_format = selected.depth_formats[0];
        info!(" -- Depth format: {:?}", depth_format);

        let supports_ray_tracing = selected.supports_ray_tracing && ray_tracing != FeatureValue::NotUsed;
        info!(" -- Ray tracing: {}", if supports_ray_tracing { "enabled" } else { "disabled" });

        Ok(PhysicalDevice {
            inner: selected.inner,
            name: selected.name,
            device_type: selected.device_type,
            limits: selected.limits,
            graphics_queue_family: selected.graphics_queues[0],
            present_queue_family: selected.present_queues[0],
            surface_format,
            depth_format,
            present_mode,
            supports_ray_tracing,
        })
    }
}

impl PhysicalDeviceCapabilities {
    fn new(instance: &Instance, surface: &Surface, inner: vk::PhysicalDevice) -> HybridResult<Self> {
        let props = unsafe { instance.inner.get_physical_device_properties(inner) };
        let name = props.device_name_as_c_str()?.to_string_lossy().into_owned();

        let queue_families = unsafe {
            instance
                .inner
                .get_physical_device_queue_family_properties(inner)
        }
        .into_iter()
        .enumerate()
        .map(|(index, p)| {
            let present_support = unsafe {
                surface.inner.get_physical_device_surface_support(
                    inner,
                    index as _,
                    surface.surface_khr,
                )?
            };
            Ok(QueueFamily::new(index as _, p, present_support))
        })
        .collect::<HybridResult<Vec<_>>>()?;

        let mut graphics_queues = vec![];
        let mut present_queues = vec![];
        for family in queue_families.iter().filter(|f| f.has_queues()) {
            if family.supports_graphics() && family.supports_compute() && family.supports_timestamp_queries() {
                graphics_queues.push(*family);
            }
            if family.supports_present() {
                present_queues.push(*family);
            }
        }

        let extension_properties = unsafe { instance.inner.enumerate_device_extension_properties(inner)? };
        let supported = |wanted: &CStr| {
            extension_properties
                .iter()
                .any(|p| p.extension_name_as_c_str().is_ok_and(|name| name == wanted))
        };
        let supports_swapchain = supported(ash::khr::swapchain::NAME);

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut features12)
            .push_next(&mut features13);
        let ray_tracing_extensions = RAY_TRACING_EXTENSIONS.iter().all(|e| supported(e));
        if ray_tracing_extensions {
            features = features.push_next(&mut as_features).push_next(&mut rt_features);
        }
        unsafe { instance.inner.get_physical_device_features2(inner, &mut features) };

        let supports_core_features = features12.buffer_device_address == vk::TRUE
            && features12.descriptor_indexing == vk::TRUE
            && features13.dynamic_rendering == vk::TRUE
            && features13.synchronization2 == vk::TRUE;
        let supports_ray_tracing = ray_tracing_extensions
            && as_features.acceleration_structure == vk::TRUE
            && rt_features.ray_tracing_pipeline == vk::TRUE;

        let surface_formats = unsafe {
            surface
                .inner
                .get_physical_device_surface_formats(inner, surface.surface_khr)?
        };
        let present_modes = unsafe {
            surface
                .inner
                .get_physical_device_surface_present_modes(inner, surface.surface_khr)?
        };

        let depth_formats = [
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
            vk::Format::D16_UNORM,
        ]
        .into_iter()
        .filter(|format| {
            let props = unsafe { instance.inner.get_physical_device_format_properties(inner, *format) };
            props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .collect();

        Ok(Self {
            inner,
            name,
            device_type: props.device_type,
            limits: props.limits,
            graphics_queues,
            present_queues,
            supports_swapchain,
            supports_core_features,
            supports_ray_tracing,
            surface_formats,
            depth_formats,
            present_modes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_gpu_ranks_above_everything_else() {
        let discrete = device_type_penalty(vk::PhysicalDeviceType::DISCRETE_GPU);
        for other in [
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::VIRTUAL_GPU,
            vk::PhysicalDeviceType::CPU,
            vk::PhysicalDeviceType::OTHER,
        ] {
            assert!(discrete > device_type_penalty(other));
        }
        assert!(
            device_type_penalty(vk::PhysicalDeviceType::INTEGRATED_GPU)
                > device_type_penalty(vk::PhysicalDeviceType::CPU)
        );
    }
}
