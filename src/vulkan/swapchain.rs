use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use glam::{uvec2, UVec2};
use log::{debug, info};

use crate::vulkan::{Context, Device, Image, ImageAndView, Queue, Semaphore};
use crate::HybridResult;

pub struct AcquiredImage {
    pub index: u32,
    pub is_suboptimal: bool,
}

pub struct Swapchain {
    device: Arc<Device>,
    inner: ash::khr::swapchain::Device,
    swapchain_khr: vk::SwapchainKHR,
    pub size: UVec2,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub images_and_views: Vec<ImageAndView>,
}

impl Swapchain {
    pub fn new(context: &Context, width: u32, height: u32) -> HybridResult<Self> {
        debug!("Creating vulkan swapchain");

        let format = context.physical_device.surface_format;
        let inner = ash::khr::swapchain::Device::new(&context.instance.inner, &context.device.inner);

        let mut swapchain = Self {
            device: context.device.clone(),
            inner,
            swapchain_khr: vk::SwapchainKHR::null(),
            size: UVec2::ZERO,
            format: format.format,
            color_space: format.color_space,
            present_mode: context.physical_device.present_mode,
            images_and_views: Vec::new(),
        };
        swapchain.create(context, width, height)?;

        Ok(swapchain)
    }

    fn create(&mut self, context: &Context, width: u32, height: u32) -> HybridResult<()> {
        let capabilities = unsafe {
            context
                .surface
                .inner
                .get_physical_device_surface_capabilities(
                    context.physical_device.inner,
                    context.surface.surface_khr,
                )?
        };

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            let min = capabilities.min_image_extent;
            let max = capabilities.max_image_extent;
            vk::Extent2D {
                width: width.clamp(min.width, max.width),
                height: height.clamp(min.height, max.height),
            }
        };
        info!("Swapchain size: {}x{}", extent.width, extent.height);

        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }
        debug!("Swapchain image count: {image_count}");

        let families_indices = [
            context.physical_device.graphics_queue_family.index,
            context.physical_device.present_queue_family.index,
        ];

        let create_info = {
            let mut builder = vk::SwapchainCreateInfoKHR::default()
                .surface(context.surface.surface_khr)
                .min_image_count(image_count)
                .image_format(self.format)
                .image_color_space(self.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
                );

            builder = if families_indices[0] != families_indices[1] {
                builder
                    .image_sharing_mode(vk::SharingMode::CONCURRENT)
                    .queue_family_indices(&families_indices)
            } else {
                builder.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            };

            builder
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(self.present_mode)
                .clipped(true)
        };

        let swapchain_khr = unsafe { self.inner.create_swapchain(&create_info, None)? };

        let images = unsafe { self.inner.get_swapchain_images(swapchain_khr)? };
        let images_and_views = images
            .into_iter()
            .map(|i| {
                let image = Image::from_swapchain_image(
                    self.device.clone(),
                    context.allocator.clone(),
                    i,
                    self.format,
                    extent,
                );
                let view = image.create_image_view(false)?;
                Ok(ImageAndView { view, image })
            })
            .collect::<HybridResult<Vec<_>>>()?;

        self.swapchain_khr = swapchain_khr;
        self.size = uvec2(extent.width, extent.height);
        self.images_and_views = images_and_views;

        Ok(())
    }

    pub fn resize(&mut self, context: &Context, width: u32, height: u32) -> HybridResult<()> {
        info!("Resizing vulkan swapchain to {width}x{height}");

        self.destroy();
        self.create(context, width, height)
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.size.x,
            height: self.size.y,
        }
    }

    /// Errors with `ERROR_OUT_OF_DATE_KHR` when the swapchain no longer matches the surface.
    pub fn acquire_next_image(
        &self,
        timeout: Duration,
        semaphore: &Semaphore,
    ) -> HybridResult<AcquiredImage> {
        let (index, is_suboptimal) = unsafe {
            self.inner.acquire_next_image(
                self.swapchain_khr,
                timeout.as_nanos() as u64,
                semaphore.inner,
                vk::Fence::null(),
            )?
        };

        Ok(AcquiredImage {
            index,
            is_suboptimal,
        })
    }

    /// Returns whether the swapchain is suboptimal.
    pub fn queue_present(
        &self,
        image_index: u32,
        wait_semaphores: &[&Semaphore],
        queue: &Queue,
    ) -> HybridResult<bool> {
        let swapchains = [self.swapchain_khr];
        let images_indices = [image_index];
        let wait_semaphores = wait_semaphores.iter().map(|s| s.inner).collect::<Vec<_>>();

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&images_indices);

        let result = unsafe { self.inner.queue_present(queue.inner, &present_info)? };

        Ok(result)
    }

    fn destroy(&mut self) {
        self.images_and_views.clear();
        if self.swapchain_khr != vk::SwapchainKHR::null() {
            unsafe { self.inner.destroy_swapchain(self.swapchain_khr, None) };
            self.swapchain_khr = vk::SwapchainKHR::null();
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Swapchain")
            .field("swapchain_khr", &self.swapchain_khr)
            .field("size", &self.size)
            .field("format", &self.format)
            .field("color_space", &self.color_space)
            .field("present_mode", &self.present_mode)
            .field("images_and_views", &self.images_and_views)
            .finish()
    }
}
