use std::sync::Arc;

use ash::vk;

use crate::vulkan::utils::read_shader_from_bytes;
use crate::vulkan::{Context, DescriptorSetLayout, Device};
use crate::HybridResult;

pub struct ShaderModule {
    device: Arc<Device>,
    pub(crate) inner: vk::ShaderModule,
}

impl ShaderModule {
    /// `source` is a SPIR-V binary.
    pub fn from_bytes(device: Arc<Device>, source: &[u8]) -> HybridResult<Self> {
        let source = read_shader_from_bytes(source)?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&source);
        let inner = unsafe { device.inner.create_shader_module(&create_info, None)? };

        Ok(Self { device, inner })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_shader_module(self.inner, None) };
    }
}

pub struct PipelineLayout {
    device: Arc<Device>,
    pub(crate) inner: vk::PipelineLayout,
}

impl PipelineLayout {
    pub(crate) fn new(
        device: Arc<Device>,
        descriptor_set_layouts: &[&DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> HybridResult<Self> {
        let layouts = descriptor_set_layouts
            .iter()
            .map(|l| l.inner)
            .collect::<Vec<_>>();

        let pipe_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&layouts)
            .push_constant_ranges(push_constant_ranges);
        let inner = unsafe { device.inner.create_pipeline_layout(&pipe_layout_info, None)? };

        Ok(Self { device, inner })
    }

    pub fn handle(&self) -> vk::PipelineLayout {
        self.inner
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_pipeline_layout(self.inner, None) };
    }
}

impl Context {
    pub fn create_shader_module(&self, source: &[u8]) -> HybridResult<ShaderModule> {
        ShaderModule::from_bytes(self.device.clone(), source)
    }

    pub fn create_pipeline_layout(
        &self,
        descriptor_set_layouts: &[&DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> HybridResult<PipelineLayout> {
        PipelineLayout::new(
            self.device.clone(),
            descriptor_set_layouts,
            push_constant_ranges,
        )
    }
}
