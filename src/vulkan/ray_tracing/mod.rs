mod acceleration_structure;
mod build_sizes;
mod instance;
mod orchestrator;
mod pipeline;
mod shader_binding_table;

pub use acceleration_structure::*;
pub use build_sizes::*;
pub use instance::*;
pub use orchestrator::*;
pub use pipeline::*;
pub use shader_binding_table::*;

use ash::{
    khr::{acceleration_structure as ash_acceleration_structure, ray_tracing_pipeline},
    vk,
};

use crate::vulkan::physical_device::PhysicalDevice;
use crate::vulkan::{Device, Instance};

pub struct RayTracingContext {
    pub pipeline_properties: PhysicalDeviceRayTracingPipelineProperties,
    pub pipeline_fn: ray_tracing_pipeline::Device,
    pub acceleration_structure_properties: PhysicalDeviceAccelerationStructureProperties,
    pub acceleration_structure_fn: ash_acceleration_structure::Device,
}

impl RayTracingContext {
    pub(crate) fn new(instance: &Instance, pdevice: &PhysicalDevice, device: &Device) -> Self {
        let mut pipeline_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut acceleration_structure_properties =
            vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut pipeline_properties)
            .push_next(&mut acceleration_structure_properties);
        unsafe {
            instance
                .inner
                .get_physical_device_properties2(pdevice.inner, &mut properties2)
        };

        Self {
            pipeline_properties: pipeline_properties.into(),
            pipeline_fn: ray_tracing_pipeline::Device::new(&instance.inner, &device.inner),
            acceleration_structure_properties: acceleration_structure_properties.into(),
            acceleration_structure_fn: ash_acceleration_structure::Device::new(
                &instance.inner,
                &device.inner,
            ),
        }
    }

    /// Scratch offsets inside a shared scratch buffer must be multiples of this.
    pub fn scratch_alignment(&self) -> vk::DeviceSize {
        effective_scratch_alignment(
            self.acceleration_structure_properties
                .min_acceleration_structure_scratch_offset_alignment,
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceRayTracingPipelineProperties {
    pub shader_group_handle_size: u32,
    pub max_ray_recursion_depth: u32,
    pub max_shader_group_stride: u32,
    pub shader_group_base_alignment: u32,
    pub shader_group_handle_alignment: u32,
    pub max_ray_hit_attribute_size: u32,
}

impl From<vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'_>>
    for PhysicalDeviceRayTracingPipelineProperties
{
    fn from(p: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'_>) -> Self {
        Self {
            shader_group_handle_size: p.shader_group_handle_size,
            max_ray_recursion_depth: p.max_ray_recursion_depth,
            max_shader_group_stride: p.max_shader_group_stride,
            shader_group_base_alignment: p.shader_group_base_alignment,
            shader_group_handle_alignment: p.shader_group_handle_alignment,
            max_ray_hit_attribute_size: p.max_ray_hit_attribute_size,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceAccelerationStructureProperties {
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
    pub max_descriptor_set_acceleration_structures: u32,
    pub min_acceleration_structure_scratch_offset_alignment: u32,
}

impl From<vk::PhysicalDeviceAccelerationStructurePropertiesKHR<'_>>
    for PhysicalDeviceAccelerationStructureProperties
{
    fn from(p: vk::PhysicalDeviceAccelerationStructurePropertiesKHR<'_>) -> Self {
        Self {
            max_geometry_count: p.max_geometry_count,
            max_instance_count: p.max_instance_count,
            max_primitive_count: p.max_primitive_count,
            max_descriptor_set_acceleration_structures: p.max_descriptor_set_acceleration_structures,
            min_acceleration_structure_scratch_offset_alignment: p
                .min_acceleration_structure_scratch_offset_alignment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn context_is_thread_safe_without_manual_impls() {
        assert_send_sync::<PhysicalDeviceRayTracingPipelineProperties>();
        assert_send_sync::<PhysicalDeviceAccelerationStructureProperties>();
        assert_send_sync::<RayTracingContext>();
    }
}
