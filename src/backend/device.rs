// Device and capability negotiation
//
// Runs once at startup: instance creation with optional validation,
// surface realization from the injected raw handles, first-fit selection
// of an adequate physical device, and logical device + queue retrieval.
// The capability snapshot taken here is consumed by every other component.

use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::error::{RenderError, RenderResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Device extensions every candidate must support.
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![khr::Swapchain::name()]
}

/// Graphics/present queue family indices for one physical device. Present
/// capability is surface-dependent, so the two may resolve to the same
/// family or to different ones.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }
}

/// Surface-facing swapchain capabilities of one physical device.
#[derive(Clone, Debug, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Everything queried about one physical device during negotiation.
#[derive(Clone, Debug, Default)]
pub struct DeviceProfile {
    pub extensions: Vec<String>,
    pub queue_families: QueueFamilyIndices,
    pub swapchain_support: SwapchainSupport,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl DeviceProfile {
    /// A device qualifies only with the required extensions, both queue
    /// roles resolved, and at least one surface format and present mode.
    pub fn is_adequate(&self, required_extensions: &[&CStr]) -> bool {
        let extensions_ok = required_extensions.iter().all(|required| {
            let required = required.to_string_lossy();
            self.extensions.iter().any(|e| e.as_str() == required)
        });

        extensions_ok
            && self.queue_families.is_complete()
            && !self.swapchain_support.formats.is_empty()
            && !self.swapchain_support.present_modes.is_empty()
    }
}

/// First-fit over the enumerated candidates; no scoring.
fn select_first_adequate(
    profiles: &[DeviceProfile],
    required_extensions: &[&CStr],
) -> Option<usize> {
    profiles
        .iter()
        .position(|p| p.is_adequate(required_extensions))
}

/// Instance-level support plus the profile of the selected device.
#[derive(Clone, Debug)]
pub struct CapabilitySnapshot {
    pub layers: Vec<String>,
    pub instance_extensions: Vec<String>,
    pub profile: DeviceProfile,
}

/// Owns the Vulkan instance, surface, logical device and queues. Drops in
/// strict reverse creation order after a device-wide wait.
pub struct RenderDevice {
    _entry: Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub surface_loader: khr::Surface,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub snapshot: CapabilitySnapshot,
    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
}

impl RenderDevice {
    pub fn negotiate(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        app_name: &str,
        enable_validation: bool,
    ) -> RenderResult<Arc<Self>> {
        let entry = unsafe { Entry::load()? };

        let layers = entry
            .enumerate_instance_layer_properties()?
            .iter()
            .map(|l| raw_name_to_string(&l.layer_name))
            .collect::<Vec<_>>();

        let instance_extensions = entry
            .enumerate_instance_extension_properties(None)?
            .iter()
            .map(|e| raw_name_to_string(&e.extension_name))
            .collect::<Vec<_>>();

        let validation_name = VALIDATION_LAYER.to_string_lossy();
        if enable_validation && !layers.iter().any(|l| l.as_str() == validation_name) {
            return Err(RenderError::MissingRequiredLayer(
                validation_name.into_owned(),
            ));
        }

        let debug_supported = instance_extensions
            .iter()
            .any(|e| e.as_str() == ext::DebugUtils::name().to_string_lossy());

        let instance = create_instance(
            &entry,
            display_handle,
            app_name,
            enable_validation,
            enable_validation && debug_supported,
        )?;

        // Best effort: validation without a reachable messenger entry point
        // degrades to layer-internal reporting.
        let debug_utils = if enable_validation && debug_supported {
            bind_debug_callback(&entry, &instance)
        } else {
            if enable_validation {
                log::warn!("debug-utils extension unavailable, validation output is not captured");
            }
            None
        };

        let surface =
            unsafe { ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)? };
        let surface_loader = khr::Surface::new(&entry, &instance);

        let required = required_device_extensions();
        let physical_devices = unsafe { instance.enumerate_physical_devices()? };
        let profiles = physical_devices
            .iter()
            .map(|&pd| query_device_profile(&instance, pd, &surface_loader, surface))
            .collect::<RenderResult<Vec<_>>>()?;

        let selected = select_first_adequate(&profiles, &required)
            .ok_or(RenderError::NoAdequateDevice)?;
        let physical_device = physical_devices[selected];
        let profile = profiles.into_iter().nth(selected).unwrap_or_default();

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "selected GPU: {} ({} candidates)",
            raw_name_to_string(&properties.device_name),
            physical_devices.len()
        );

        let (device, graphics_queue, present_queue) =
            create_logical_device(&instance, physical_device, &profile, enable_validation)?;

        Ok(Arc::new(Self {
            _entry: entry,
            instance,
            debug_utils,
            surface_loader,
            surface,
            physical_device,
            snapshot: CapabilitySnapshot {
                layers,
                instance_extensions,
                profile,
            },
            device,
            graphics_queue,
            present_queue,
        }))
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.snapshot.profile
    }

    /// Block until the device is quiescent. Required before swapchain
    /// teardown, rebuild and full shutdown.
    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        log::info!("destroying render device");
        let _ = self.wait_idle();

        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn create_instance(
    entry: &Entry,
    display_handle: RawDisplayHandle,
    app_name: &str,
    enable_validation: bool,
    enable_debug_utils: bool,
) -> RenderResult<ash::Instance> {
    let app_name = CString::new(app_name).unwrap_or_default();
    let engine_name = c"orbit-renderer";

    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_2);

    let mut extensions = ash_window::enumerate_required_extensions(display_handle)?.to_vec();
    if enable_debug_utils {
        extensions.push(ext::DebugUtils::name().as_ptr());
    }

    let layer_names = if enable_validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None)? };
    Ok(instance)
}

fn bind_debug_callback(
    entry: &Entry,
    instance: &ash::Instance,
) -> Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = ext::DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    match unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) } {
        Ok(messenger) => Some((debug_utils, messenger)),
        Err(e) => {
            log::warn!("failed to bind debug messenger: {e}");
            None
        }
    }
}

fn query_device_profile(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface_loader: &khr::Surface,
    surface: vk::SurfaceKHR,
) -> RenderResult<DeviceProfile> {
    let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device)? }
        .iter()
        .map(|e| raw_name_to_string(&e.extension_name))
        .collect();

    let queue_families =
        query_queue_families(instance, physical_device, surface_loader, surface)?;

    let swapchain_support = SwapchainSupport {
        capabilities: unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?
        },
        formats: unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)?
        },
        present_modes: unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?
        },
    };

    let memory_properties =
        unsafe { instance.get_physical_device_memory_properties(physical_device) };

    Ok(DeviceProfile {
        extensions,
        queue_families,
        swapchain_support,
        memory_properties,
    })
}

fn query_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface_loader: &khr::Surface,
    surface: vk::SurfaceKHR,
) -> RenderResult<QueueFamilyIndices> {
    let mut indices = QueueFamilyIndices::default();

    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics = Some(i);
        }

        let present_supported = unsafe {
            surface_loader.get_physical_device_surface_support(physical_device, i, surface)?
        };
        if present_supported {
            indices.present = Some(i);
        }

        if indices.is_complete() {
            break;
        }
    }

    Ok(indices)
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    profile: &DeviceProfile,
    enable_validation: bool,
) -> RenderResult<(ash::Device, vk::Queue, vk::Queue)> {
    // is_adequate already held, so both indices are resolved here.
    let graphics_family = profile.queue_families.graphics.unwrap_or_default();
    let present_family = profile.queue_families.present.unwrap_or_default();

    let unique_families: HashSet<u32> = [graphics_family, present_family].into_iter().collect();
    let queue_priorities = [1.0_f32];
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
                .build()
        })
        .collect();

    let mut extensions: Vec<*const std::os::raw::c_char> = required_device_extensions()
        .iter()
        .map(|e| e.as_ptr())
        .collect();

    // Portability-subset implementations require the extension to be listed
    // whenever the device advertises it.
    let portability = vk::KhrPortabilitySubsetFn::name();
    if profile
        .extensions
        .iter()
        .any(|e| e.as_str() == portability.to_string_lossy())
    {
        extensions.push(portability.as_ptr());
    }

    let layer_names = if enable_validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let features = vk::PhysicalDeviceFeatures::default();

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names)
        .enabled_features(&features);

    let device = unsafe { instance.create_device(physical_device, &create_info, None)? };

    // First queue in each required family.
    let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
    let present_queue = unsafe { device.get_device_queue(present_family, 0) };

    Ok((device, graphics_queue, present_queue))
}

fn raw_name_to_string(raw: &[std::os::raw::c_char]) -> String {
    unsafe { CStr::from_ptr(raw.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adequate_profile() -> DeviceProfile {
        DeviceProfile {
            extensions: vec!["VK_KHR_swapchain".to_owned()],
            queue_families: QueueFamilyIndices {
                graphics: Some(0),
                present: Some(0),
            },
            swapchain_support: SwapchainSupport {
                capabilities: vk::SurfaceCapabilitiesKHR::default(),
                formats: vec![vk::SurfaceFormatKHR::default()],
                present_modes: vec![vk::PresentModeKHR::FIFO],
            },
            memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
        }
    }

    #[test]
    fn queue_family_indices_require_both_roles() {
        let mut indices = QueueFamilyIndices::default();
        assert!(!indices.is_complete());
        indices.graphics = Some(2);
        assert!(!indices.is_complete());
        indices.present = Some(2);
        assert!(indices.is_complete());
    }

    #[test]
    fn adequate_device_passes() {
        let profile = adequate_profile();
        assert!(profile.is_adequate(&required_device_extensions()));
    }

    #[test]
    fn zero_surface_formats_fail_adequacy() {
        let mut profile = adequate_profile();
        profile.swapchain_support.formats.clear();
        assert!(!profile.is_adequate(&required_device_extensions()));
    }

    #[test]
    fn missing_extension_fails_adequacy() {
        let mut profile = adequate_profile();
        profile.extensions.clear();
        assert!(!profile.is_adequate(&required_device_extensions()));
    }

    #[test]
    fn unresolved_present_family_fails_adequacy() {
        let mut profile = adequate_profile();
        profile.queue_families.present = None;
        assert!(!profile.is_adequate(&required_device_extensions()));
    }

    #[test]
    fn negotiation_is_first_fit() {
        let mut inadequate = adequate_profile();
        inadequate.swapchain_support.formats.clear();

        let profiles = [inadequate.clone(), adequate_profile(), adequate_profile()];
        assert_eq!(
            select_first_adequate(&profiles, &required_device_extensions()),
            Some(1)
        );

        let only_inadequate = [inadequate];
        assert_eq!(
            select_first_adequate(&only_inadequate, &required_device_extensions()),
            None
        );
    }
}
