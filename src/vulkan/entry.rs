use std::ffi::CStr;

use anyhow::Context as _;
use itertools::Itertools;

use crate::HybridResult;

#[derive(Clone)]
pub struct Entry {
    pub inner: ash::Entry,
}

impl Entry {
    pub fn new() -> HybridResult<Self> {
        let inner = unsafe { ash::Entry::load() }.context("Failed to load the Vulkan library")?;

        Ok(Self { inner })
    }

    pub fn check_layer_support(&self, layers: &[&CStr]) -> HybridResult<bool> {
        let available = unsafe { self.inner.enumerate_instance_layer_properties()? };

        layers
            .iter()
            .map(|wanted| {
                let found = available
                    .iter()
                    .map(|layer| layer.layer_name_as_c_str().map(|name| name == *wanted))
                    .process_results(|mut iter| iter.any(|b| b))?;

                if !found {
                    log::warn!("Layer not supported: {:?}", wanted);
                }

                Ok(found)
            })
            .process_results(|mut iter| iter.all(|b| b))
    }
}
