pub extern crate anyhow;
pub extern crate glam;
pub extern crate log;

pub mod app;
pub mod camera;
pub mod deletion_queue;
pub mod in_flight_frames;
pub mod logger;
pub mod raster;
pub mod render_path;
pub mod renderer;
pub mod scene;
pub mod stats;
pub mod vulkan;

pub use app::{FrameInput, RayTracingBindings, RayTracingPushConstants, RenderApp};
pub use camera::Camera;
pub use renderer::{FeatureValue, Renderer, RendererConfig};

use ash::vk;
use log::{debug, error, info};
use winit::{
    application::ApplicationHandler,
    event::{DeviceEvent, DeviceId, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::WindowId,
};

use crate::logger::log_init;

pub type HybridResult<V> = anyhow::Result<V>;

pub fn run<A: RenderApp>(config: RendererConfig) -> HybridResult<()> {
    log_init()?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = Runner::<A> {
        config,
        app: None,
        renderer: None,
        is_swapchain_dirty: false,
        error: None,
    };
    event_loop.run_app(&mut runner)?;

    // The app owns gpu resources and has to go before the renderer
    runner.app = None;
    runner.renderer = None;

    match runner.error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

struct Runner<A: RenderApp> {
    config: RendererConfig,
    app: Option<A>,
    renderer: Option<Renderer>,
    is_swapchain_dirty: bool,
    error: Option<anyhow::Error>,
}

impl<A: RenderApp> Runner<A> {
    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:?}");
        if let Some(renderer) = &self.renderer {
            let _ = renderer.wait_for_gpu();
        }
        self.error = Some(err);
        event_loop.exit();
    }

    fn frame(&mut self) -> HybridResult<()> {
        let (Some(renderer), Some(app)) = (self.renderer.as_mut(), self.app.as_mut()) else {
            return Ok(());
        };

        if self.is_swapchain_dirty {
            let size = renderer.window.inner_size();
            if size.width == 0 || size.height == 0 {
                return Ok(());
            }

            renderer.recreate_swapchain(size.width, size.height)?;
            app.on_recreate_swapchain(renderer)?;
        }

        self.is_swapchain_dirty = renderer.draw(app)?;
        Ok(())
    }
}

impl<A: RenderApp> ApplicationHandler for Runner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_some() {
            return;
        }

        let result = Renderer::new(event_loop, &self.config).and_then(|mut renderer| {
            let app = A::new(&mut renderer)?;
            Ok((renderer, app))
        });

        match result {
            Ok((renderer, app)) => {
                self.renderer = Some(renderer);
                self.app = Some(app);
            }
            Err(err) => self.fail(event_loop, err),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _: WindowId, event: WindowEvent) {
        let (Some(renderer), Some(app)) = (self.renderer.as_mut(), self.app.as_mut()) else {
            return;
        };

        match event {
            WindowEvent::Resized(..) => {
                debug!("Window has been resized");
                self.is_swapchain_dirty = true;
            }
            WindowEvent::CloseRequested => {
                if let Err(err) = renderer.wait_for_gpu() {
                    self.fail(event_loop, err);
                    return;
                }
                info!("Stopping");
                event_loop.exit();
                return;
            }
            _ => (),
        }

        if let Err(err) = app.on_window_event(renderer, &event) {
            self.fail(event_loop, err);
        }
    }

    fn device_event(&mut self, event_loop: &ActiveEventLoop, _: DeviceId, event: DeviceEvent) {
        let (Some(renderer), Some(app)) = (self.renderer.as_mut(), self.app.as_mut()) else {
            return;
        };

        if let Err(err) = app.on_device_event(renderer, &event) {
            self.fail(event_loop, err);
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if let Err(err) = self.frame() {
            if let Some(&vk::Result::ERROR_DEVICE_LOST) = err.downcast_ref::<vk::Result>() {
                error!("Device lost");
            }
            self.fail(event_loop, err);
        }
    }
}
