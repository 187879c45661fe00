use std::ffi::{c_void, CStr, CString};

use anyhow::bail;
use ash::{ext::debug_utils, vk};
use log::info;
use raw_window_handle::HasDisplayHandle;

use crate::renderer::{FeatureValue, RendererConfig};
use crate::vulkan::{Entry, API_VERSION};
use crate::HybridResult;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct Instance {
    pub(crate) inner: ash::Instance,
    debug_utils: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub(crate) validation_layers: bool,
}

impl Instance {
    pub(crate) fn new(
        entry: &Entry,
        display_handle: &dyn HasDisplayHandle,
        config: &RendererConfig,
    ) -> HybridResult<Self> {
        info!("Creating Vulkan instance for {}", config.name);

        let app_name = CString::new(config.name.as_bytes())?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name.as_c_str())
            .engine_name(c"hybrid-render")
            .api_version(API_VERSION);

        let mut extension_names =
            ash_window::enumerate_required_extensions(display_handle.display_handle()?.as_raw())?
                .to_vec();

        let mut validation_layers = false;
        if cfg!(debug_assertions) && config.validation_layers != FeatureValue::NotUsed {
            if entry.check_layer_support(&[VALIDATION_LAYER])? {
                extension_names.push(debug_utils::NAME.as_ptr());
                validation_layers = true;
            } else if config.validation_layers == FeatureValue::Needed {
                bail!("Validation layers are needed but not supported");
            }
        }

        let mut flags = vk::InstanceCreateFlags::empty();
        if cfg!(target_os = "macos") {
            extension_names.push(ash::khr::portability_enumeration::NAME.as_ptr());
            extension_names.push(ash::khr::get_physical_device_properties2::NAME.as_ptr());
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let layer_names = [VALIDATION_LAYER.as_ptr()];
        let mut instance_create_info = vk::InstanceCreateInfo::default()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extension_names);

        if validation_layers {
            instance_create_info = instance_create_info.enabled_layer_names(&layer_names);
        }

        let inner = unsafe { entry.inner.create_instance(&instance_create_info, None)? };

        let debug_utils = if validation_layers {
            Some(setup_debug_messenger(&entry.inner, &inner)?)
        } else {
            None
        };

        Ok(Self {
            inner,
            debug_utils,
            validation_layers,
        })
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    flag: vk::DebugUtilsMessageSeverityFlagsEXT,
    typ: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _: *mut c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Flag;

    let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) };
    match flag {
        Flag::VERBOSE => log::trace!("{:?} - {:?}", typ, message),
        Flag::INFO => log::debug!("{:?} - {:?}", typ, message),
        Flag::WARNING => log::warn!("{:?} - {:?}", typ, message),
        _ => log::error!("{:?} - {:?}", typ, message),
    }
    vk::FALSE
}

fn setup_debug_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
) -> HybridResult<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));

    let debug_utils = debug_utils::Instance::new(entry, instance);
    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };

    Ok((debug_utils, messenger))
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((utils, messenger)) = self.debug_utils.take() {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.inner.destroy_instance(None);
        }
    }
}
