pub extern crate ash;
pub extern crate ash_window;
pub extern crate gpu_allocator;

mod buffer;
mod command;
mod context;
mod descriptor;
mod device;
mod entry;
mod image;
mod instance;
pub mod physical_device;
mod pipeline;
mod query;
mod queue;
pub mod ray_tracing;
mod surface;
mod swapchain;
mod sync;

pub mod utils;

pub use buffer::*;
pub use command::*;
pub use context::*;
pub use descriptor::*;
pub use device::*;
pub use entry::*;
pub use image::*;
pub use instance::*;
pub use pipeline::*;
pub use query::*;
pub use queue::*;
pub use ray_tracing::*;
pub use surface::*;
pub use swapchain::*;
pub use sync::*;

/// Vulkan api version the renderer targets. Dynamic rendering and synchronization2 are core here.
pub const API_VERSION: u32 = ash::vk::API_VERSION_1_3;
