//! GPU selection.
//!
//! Every enumerated GPU is checked for a graphics queue, a queue that can
//! present to the surface, Vulkan 1.3 (dynamic rendering) and sampler
//! anisotropy. The suitable ones are scored and the highest score wins,
//! which in practice prefers discrete GPUs.

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::RhiError;

/// Queue family indices the backend submits and presents on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilies {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Distinct families, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(2);
        families.extend(self.graphics);
        if let Some(present) = self.present
            && !families.contains(&present)
        {
            families.push(present);
        }
        families
    }

    /// Picks families from `(flags, can_present)` per family index. A family
    /// doing both graphics and present is preferred over two separate ones.
    pub fn pick(families: &[(vk::QueueFlags, bool)]) -> Self {
        let usable = |flags: vk::QueueFlags| {
            flags.contains(vk::QueueFlags::GRAPHICS) && flags.contains(vk::QueueFlags::COMPUTE)
        };

        if let Some(both) = families
            .iter()
            .position(|&(flags, present)| usable(flags) && present)
        {
            return Self {
                graphics: Some(both as u32),
                present: Some(both as u32),
            };
        }

        Self {
            graphics: families
                .iter()
                .position(|&(flags, _)| usable(flags))
                .map(|i| i as u32),
            present: families
                .iter()
                .position(|&(_, present)| present)
                .map(|i| i as u32),
        }
    }
}

/// A selected GPU and what the backend needs to know about it.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    pub device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: QueueFamilies,
}

impl PhysicalDeviceInfo {
    pub fn device_name(&self) -> &str {
        self.properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("<unnamed>")
    }

    fn kind(&self) -> &'static str {
        kind_name(self.properties.device_type)
    }

    /// Sum of all device-local heaps, in bytes.
    pub fn device_local_memory(&self) -> u64 {
        let count = self.memory_properties.memory_heap_count as usize;
        self.memory_properties.memory_heaps[..count]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }

    fn score(&self) -> u32 {
        rate_device(
            self.properties.device_type,
            self.properties.limits.max_image_dimension2_d,
            self.device_local_memory(),
        )
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {:?}",
            self.device_name(),
            self.kind(),
            self.queue_families
        )
    }
}

/// Why a GPU was passed over.
enum Rejection {
    QueueFamilies(QueueFamilies),
    NoAnisotropy,
    ApiVersion(u32),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFamilies(families) => write!(
                f,
                "missing queue families (graphics={:?}, present={:?})",
                families.graphics, families.present
            ),
            Self::NoAnisotropy => f.write_str("no sampler anisotropy"),
            Self::ApiVersion(version) => write!(f, "Vulkan {} < 1.3", version_string(*version)),
        }
    }
}

fn kind_name(device_type: vk::PhysicalDeviceType) -> &'static str {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual",
        vk::PhysicalDeviceType::CPU => "cpu",
        _ => "other",
    }
}

fn version_string(version: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(version),
        vk::api_version_minor(version),
        vk::api_version_patch(version)
    )
}

/// Selects the most suitable GPU for rendering to `surface`.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no GPU meets the requirements.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Result<PhysicalDeviceInfo, RhiError> {
    let candidates = unsafe { instance.enumerate_physical_devices()? };
    debug!(count = candidates.len(), "Enumerated physical devices");

    let mut chosen: Option<(PhysicalDeviceInfo, u32)> = None;
    for candidate in candidates {
        let info = describe(instance, candidate, surface, surface_loader);
        match qualify(instance, &info) {
            Ok(()) => {
                let score = info.score();
                debug!(gpu = ?info, score, "GPU qualifies");
                if chosen.as_ref().is_none_or(|(_, best)| score > *best) {
                    chosen = Some((info, score));
                }
            }
            Err(reason) => debug!(gpu = info.device_name(), %reason, "GPU rejected"),
        }
    }

    let Some((selected, score)) = chosen else {
        warn!("No GPU offers graphics + present, anisotropy and Vulkan 1.3");
        return Err(RhiError::NoSuitableGpu);
    };
    info!(
        "Using {} ({}, Vulkan {}, score {})",
        selected.device_name(),
        selected.kind(),
        version_string(selected.properties.api_version),
        score
    );
    Ok(selected)
}

fn describe(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> PhysicalDeviceInfo {
    let families: Vec<(vk::QueueFlags, bool)> =
        unsafe { instance.get_physical_device_queue_family_properties(device) }
            .iter()
            .zip(0u32..)
            .map(|(family, index)| {
                if family.queue_count == 0 {
                    return (vk::QueueFlags::empty(), false);
                }
                // A failed support query counts as "cannot present".
                let present = unsafe {
                    surface_loader.get_physical_device_surface_support(device, index, surface)
                }
                .unwrap_or(false);
                (family.queue_flags, present)
            })
            .collect();

    PhysicalDeviceInfo {
        device,
        properties: unsafe { instance.get_physical_device_properties(device) },
        memory_properties: unsafe { instance.get_physical_device_memory_properties(device) },
        queue_families: QueueFamilies::pick(&families),
    }
}

fn qualify(instance: &ash::Instance, info: &PhysicalDeviceInfo) -> Result<(), Rejection> {
    if !info.queue_families.is_complete() {
        return Err(Rejection::QueueFamilies(info.queue_families));
    }
    let features = unsafe { instance.get_physical_device_features(info.device) };
    if features.sampler_anisotropy != vk::TRUE {
        return Err(Rejection::NoAnisotropy);
    }
    if info.properties.api_version < vk::API_VERSION_1_3 {
        return Err(Rejection::ApiVersion(info.properties.api_version));
    }
    Ok(())
}

/// Device type first, then max 2D image size and VRAM in MiB (capped at
/// 16000) as tie breakers.
fn rate_device(device_type: vk::PhysicalDeviceType, max_image_dimension: u32, vram: u64) -> u32 {
    let base = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 100_000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 10_000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1_000,
        vk::PhysicalDeviceType::CPU => 10,
        _ => 1,
    };
    let vram_mib = u32::try_from(vram >> 20).unwrap_or(u32::MAX).min(16_000);
    base + max_image_dimension.min(32_768) + vram_mib
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAPHICS: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw() | vk::QueueFlags::COMPUTE.as_raw(),
    );

    #[test]
    fn test_queue_families_default_is_incomplete() {
        assert!(!QueueFamilies::default().is_complete());
    }

    #[test]
    fn test_pick_prefers_a_family_that_does_both() {
        let families = [
            (GRAPHICS, false),
            (vk::QueueFlags::TRANSFER, true),
            (GRAPHICS, true),
        ];
        let picked = QueueFamilies::pick(&families);
        assert_eq!(picked.graphics, Some(2));
        assert_eq!(picked.present, Some(2));
        assert_eq!(picked.unique(), vec![2]);
    }

    #[test]
    fn test_pick_falls_back_to_separate_families() {
        let families = [(GRAPHICS, false), (vk::QueueFlags::TRANSFER, true)];
        let picked = QueueFamilies::pick(&families);
        assert!(picked.is_complete());
        assert_eq!(picked.unique(), vec![0, 1]);
    }

    #[test]
    fn test_pick_without_present_is_incomplete() {
        let picked = QueueFamilies::pick(&[(GRAPHICS, false)]);
        assert!(!picked.is_complete());
    }

    #[test]
    fn test_discrete_outranks_integrated() {
        let discrete = rate_device(vk::PhysicalDeviceType::DISCRETE_GPU, 8192, 1 << 30);
        let integrated = rate_device(vk::PhysicalDeviceType::INTEGRATED_GPU, 32_768, 64 << 30);
        assert!(discrete > integrated);
    }
}
