use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use log::trace;

use crate::vulkan::{Context, Device};
use crate::HybridResult;

#[derive(Debug)]
pub struct Image {
    device: Arc<Device>,
    allocator: Arc<Mutex<Allocator>>,
    pub(crate) inner: vk::Image,
    allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    is_swapchain: bool, // owned by the swapchain, never destroyed here
}

#[derive(Debug)]
pub struct ImageView {
    device: Arc<Device>,
    pub(crate) inner: vk::ImageView,
}

#[derive(Debug)]
pub struct ImageAndView {
    pub view: ImageView,
    pub image: Image,
}

impl Image {
    pub(crate) fn new_2d(
        device: Arc<Device>,
        allocator: Arc<Mutex<Allocator>>,
        usage: vk::ImageUsageFlags,
        memory_location: MemoryLocation,
        format: vk::Format,
        width: u32,
        height: u32,
    ) -> HybridResult<Self> {
        trace!("Creating image {width}x{height} {format:?} with usage {usage:?}");

        let extent = vk::Extent3D {
            width,
            height,
            depth: 1,
        };

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let inner = unsafe { device.inner.create_image(&image_info, None)? };
        let requirements = unsafe { device.inner.get_image_memory_requirements(inner) };

        let allocation = allocator
            .lock()
            .map_err(|_| anyhow!("Allocator mutex poisoned"))?
            .allocate(&AllocationCreateDesc {
                name: "image",
                requirements,
                location: memory_location,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?;

        unsafe {
            device
                .inner
                .bind_image_memory(inner, allocation.memory(), allocation.offset())?
        };

        Ok(Self {
            device,
            allocator,
            inner,
            allocation: Some(allocation),
            format,
            extent,
            is_swapchain: false,
        })
    }

    pub(crate) fn from_swapchain_image(
        device: Arc<Device>,
        allocator: Arc<Mutex<Allocator>>,
        swapchain_image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            device,
            allocator,
            inner: swapchain_image,
            allocation: None,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            is_swapchain: true,
        }
    }

    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }

    pub fn create_image_view(&self, is_depth: bool) -> HybridResult<ImageView> {
        let aspect_mask = if is_depth {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(self.inner)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let inner = unsafe { self.device.inner.create_image_view(&view_info, None)? };

        Ok(ImageView {
            device: self.device.clone(),
            inner,
        })
    }
}

impl Context {
    pub fn create_image(
        &self,
        usage: vk::ImageUsageFlags,
        memory_location: MemoryLocation,
        format: vk::Format,
        width: u32,
        height: u32,
    ) -> HybridResult<Image> {
        Image::new_2d(
            self.device.clone(),
            self.allocator.clone(),
            usage,
            memory_location,
            format,
            width,
            height,
        )
    }

    pub fn create_image_and_view(
        &self,
        usage: vk::ImageUsageFlags,
        format: vk::Format,
        width: u32,
        height: u32,
        is_depth: bool,
    ) -> HybridResult<ImageAndView> {
        let image = self.create_image(usage, MemoryLocation::GpuOnly, format, width, height)?;
        let view = image.create_image_view(is_depth)?;
        Ok(ImageAndView { view, image })
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if self.is_swapchain {
            return;
        }

        trace!("Destroying image {}x{}", self.extent.width, self.extent.height);
        unsafe { self.device.inner.destroy_image(self.inner, None) };

        if let (Some(allocation), Ok(mut allocator)) = (self.allocation.take(), self.allocator.lock()) {
            if let Err(err) = allocator.free(allocation) {
                log::error!("Failed to free image memory: {err}");
            }
        }
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_image_view(self.inner, None) };
    }
}
