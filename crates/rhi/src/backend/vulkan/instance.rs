//! Vulkan instance, validation layer and debug messenger.

use std::borrow::Cow;
use std::ffi::{CStr, c_char, c_void};

use ash::{Entry, vk};
use raw_window_handle::RawDisplayHandle;
use tracing::{debug, error, info, warn};

use crate::error::RhiError;

const KHRONOS_VALIDATION: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Debug-utils messenger forwarding validation output to `tracing`.
struct Messenger {
    loader: ash::ext::debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

impl Messenger {
    fn install(entry: &Entry, instance: &ash::Instance) -> Result<Self, RhiError> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let severity = vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR;
        let kinds = vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE;
        let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(severity)
            .message_type(kinds)
            .pfn_user_callback(Some(forward_to_tracing));
        let handle = unsafe { loader.create_debug_utils_messenger(&info, None)? };
        Ok(Self { loader, handle })
    }
}

/// Owner of the `ash::Instance` every other Vulkan object hangs off.
///
/// With validation on, layer messages land in the same `tracing` sinks
/// (including the in-memory console) as engine logs.
pub struct Instance {
    entry: Entry,
    raw: ash::Instance,
    messenger: Option<Messenger>,
}

impl Instance {
    /// Loads the Vulkan library and creates a 1.3 instance able to present
    /// to `display`.
    ///
    /// # Arguments
    ///
    /// * `display` - Display the window surface lives on
    /// * `enable_validation` - Request the Khronos validation layer; ignored
    ///   with a warning when the layer is not installed
    ///
    /// # Errors
    ///
    /// Returns an error if the loader is missing, the platform surface
    /// extensions are unsupported, or `vkCreateInstance` fails.
    pub fn new(display: RawDisplayHandle, enable_validation: bool) -> Result<Self, RhiError> {
        let entry = unsafe { Entry::load()? };

        let validate = enable_validation && layer_installed(&entry, KHRONOS_VALIDATION)?;
        if enable_validation && !validate {
            warn!("{:?} requested but not installed", KHRONOS_VALIDATION);
        }

        let version = vk::make_api_version(0, 0, 1, 0);
        let app = vk::ApplicationInfo::default()
            .application_name(c"lumen")
            .application_version(version)
            .engine_name(c"lumen")
            .engine_version(version)
            .api_version(vk::API_VERSION_1_3);

        let mut extension_names: Vec<*const c_char> =
            ash_window::enumerate_required_extensions(display)?.to_vec();
        let mut layer_names: Vec<*const c_char> = Vec::new();
        if validate {
            extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
            layer_names.push(KHRONOS_VALIDATION.as_ptr());
        }

        let raw = unsafe {
            entry.create_instance(
                &vk::InstanceCreateInfo::default()
                    .application_info(&app)
                    .enabled_extension_names(&extension_names)
                    .enabled_layer_names(&layer_names),
                None,
            )?
        };
        debug!(
            extensions = extension_names.len(),
            validate, "Vulkan 1.3 instance ready"
        );

        let messenger = match validate {
            true => Some(Messenger::install(&entry, &raw)?),
            false => None,
        };

        Ok(Self {
            entry,
            raw,
            messenger,
        })
    }

    #[inline]
    pub fn handle(&self) -> &ash::Instance {
        &self.raw
    }

    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Whether validation output is being forwarded.
    #[inline]
    pub fn has_validation(&self) -> bool {
        self.messenger.is_some()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Some(messenger) = self.messenger.take() {
            unsafe {
                messenger
                    .loader
                    .destroy_debug_utils_messenger(messenger.handle, None)
            };
        }
        unsafe { self.raw.destroy_instance(None) };
        debug!("Vulkan instance dropped");
    }
}

fn layer_installed(entry: &Entry, wanted: &CStr) -> Result<bool, RhiError> {
    let layers = unsafe { entry.enumerate_instance_layer_properties()? };
    Ok(layers
        .iter()
        .filter_map(|props| props.layer_name_as_c_str().ok())
        .any(|name| name == wanted))
}

fn kind_label(kind: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    }
}

/// Debug-utils callback.
///
/// # Safety
///
/// Invoked by the loader; `data` is either null or valid for the call.
unsafe extern "system" fn forward_to_tracing(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    let Some(data) = (unsafe { data.as_ref() }) else {
        return vk::FALSE;
    };
    let text: Cow<'_, str> = match data.p_message.is_null() {
        true => Cow::Borrowed("<empty>"),
        false => unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy(),
    };
    let kind = kind_label(kind);

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", kind, "{}", text);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", kind, "{}", text);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        info!(target: "vulkan", kind, "{}", text);
    } else {
        debug!(target: "vulkan", kind, "{}", text);
    }
    vk::FALSE
}
