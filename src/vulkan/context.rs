use std::ffi::CString;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use ash::{ext::debug_utils, vk};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use gpu_allocator::AllocatorDebugSettings;
use log::{debug, info};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::renderer::RendererConfig;
use crate::vulkan::physical_device::PhysicalDevice;
use crate::vulkan::ray_tracing::RayTracingContext;
use crate::vulkan::{CommandBuffer, CommandPool, Device, Entry, Instance, Queue, Surface};
use crate::HybridResult;

pub const DEBUG_GPU_ALLOCATOR: bool = false;

/// Fields drop top to bottom: everything holding device memory goes before the device.
pub struct Context {
    pub allocator: Arc<Mutex<Allocator>>,
    pub command_pool: CommandPool,
    pub ray_tracing: Option<Arc<RayTracingContext>>,
    pub graphics_queue: Queue,
    pub present_queue: Queue,
    /// Only present with validation layers.
    debug_utils: Option<debug_utils::Device>,
    pub device: Arc<Device>,
    pub physical_device: PhysicalDevice,
    pub surface: Surface,
    pub instance: Instance,
    pub entry: Entry,
    one_time_timeout: Duration,
}

impl Context {
    pub fn new(
        window_handle: &dyn HasWindowHandle,
        display_handle: &dyn HasDisplayHandle,
        config: &RendererConfig,
    ) -> HybridResult<Self> {
        let entry = Entry::new()?;
        let instance = Instance::new(&entry, display_handle, config)?;
        if instance.validation_layers {
            info!("Validation layers enabled");
        }

        let surface = Surface::new(&entry, &instance, window_handle, display_handle)?;
        let physical_device = instance.select_suitable_physical_device(&surface, config.ray_tracing)?;

        let device = Arc::new(Device::new(&instance, &physical_device)?);

        let debug_utils = instance
            .validation_layers
            .then(|| debug_utils::Device::new(&instance.inner, &device.inner));

        let graphics_queue = Queue::new(device.clone(), physical_device.graphics_queue_family, 0);
        let present_queue = Queue::new(device.clone(), physical_device.present_queue_family, 0);

        let ray_tracing = physical_device.supports_ray_tracing.then(|| {
            let ray_tracing = Arc::new(RayTracingContext::new(&instance, &physical_device, &device));
            debug!(
                "Ray tracing pipeline properties {:#?}",
                ray_tracing.pipeline_properties
            );
            debug!(
                "Acceleration structure properties {:#?}",
                ray_tracing.acceleration_structure_properties
            );
            ray_tracing
        });

        let command_pool = CommandPool::new(
            device.clone(),
            ray_tracing.clone(),
            physical_device.graphics_queue_family,
            Some(vk::CommandPoolCreateFlags::TRANSIENT),
        )?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.inner.clone(),
            device: device.inner.clone(),
            physical_device: physical_device.inner,
            debug_settings: AllocatorDebugSettings {
                log_allocations: DEBUG_GPU_ALLOCATOR,
                log_frees: DEBUG_GPU_ALLOCATOR,
                log_memory_information: DEBUG_GPU_ALLOCATOR,
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            command_pool,
            ray_tracing,
            graphics_queue,
            present_queue,
            debug_utils,
            device,
            physical_device,
            surface,
            instance,
            entry,
            one_time_timeout: config.fence_timeout,
        })
    }

    pub fn ray_tracing(&self) -> HybridResult<&Arc<RayTracingContext>> {
        self.ray_tracing
            .as_ref()
            .ok_or_else(|| anyhow!("Ray tracing is not enabled on this device"))
    }

    /// Labels `handle` for validation messages and capture tools. Does nothing without
    /// validation layers.
    pub fn set_debug_name<H: vk::Handle>(&self, handle: H, name: &str) -> HybridResult<()> {
        let Some(debug_utils) = &self.debug_utils else {
            return Ok(());
        };

        let name = CString::new(name)?;
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        unsafe { debug_utils.set_debug_utils_object_name(&name_info)? };

        Ok(())
    }

    pub fn device_wait_idle(&self) -> HybridResult<()> {
        unsafe { self.device.inner.device_wait_idle()? };

        Ok(())
    }

    /// Records `executor` into a fresh primary command buffer, submits it and blocks until the
    /// GPU finished. The submit and the wait happen even when `executor` fails; its error is
    /// returned afterwards.
    pub fn execute_one_time_commands<R, F: FnOnce(&CommandBuffer) -> HybridResult<R>>(
        &self,
        executor: F,
    ) -> HybridResult<R> {
        let command_buffer = self
            .command_pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;

        let result = self.submit_one_time_commands(&command_buffer, executor);

        self.command_pool.free_command_buffer(&command_buffer);

        result
    }

    fn submit_one_time_commands<R, F: FnOnce(&CommandBuffer) -> HybridResult<R>>(
        &self,
        command_buffer: &CommandBuffer,
        executor: F,
    ) -> HybridResult<R> {
        command_buffer.begin(Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))?;

        let recorded = executor(command_buffer);

        command_buffer.end()?;

        let fence = self.create_fence(None)?;
        self.graphics_queue.submit(command_buffer, None, None, &fence)?;
        fence.wait(self.one_time_timeout)?;

        recorded
    }
}
