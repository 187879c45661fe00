use ash::{khr::surface, vk};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::vulkan::{Entry, Instance};
use crate::HybridResult;

pub struct Surface {
    pub(crate) inner: surface::Instance,
    pub surface_khr: vk::SurfaceKHR,
}

impl Surface {
    pub(crate) fn new(
        entry: &Entry,
        instance: &Instance,
        window_handle: &dyn HasWindowHandle,
        display_handle: &dyn HasDisplayHandle,
    ) -> HybridResult<Self> {
        let inner = surface::Instance::new(&entry.inner, &instance.inner);
        let surface_khr = unsafe {
            ash_window::create_surface(
                &entry.inner,
                &instance.inner,
                display_handle.display_handle()?.as_raw(),
                window_handle.window_handle()?.as_raw(),
                None,
            )?
        };

        Ok(Self { inner, surface_khr })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.inner.destroy_surface(self.surface_khr, None);
        }
    }
}
