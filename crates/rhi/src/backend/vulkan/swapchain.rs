//! Swapchain and its per-slot semaphores.
//!
//! Each frame slot owns an "acquired" semaphore, signaled by the acquire
//! and waited on by the frame's submission, and a "ready" semaphore,
//! signaled by that submission and waited on by the present.

use ash::vk;
use tracing::{debug, info, warn};

use super::convert;
use super::physical_device::QueueFamilies;
use crate::error::{RhiError, RhiResult};
use crate::texture::Format;

/// Everything needed to (re)build a swapchain.
pub struct SwapchainTarget<'a> {
    pub device: &'a ash::Device,
    pub loader: &'a ash::khr::swapchain::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: &'a ash::khr::surface::Instance,
    pub queue_families: QueueFamilies,
    pub vsync: bool,
}

/// The swapchain parameters picked from what the surface offers.
#[derive(Debug, Clone, Copy)]
struct Plan {
    surface_format: vk::SurfaceFormatKHR,
    format: Format,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    min_images: u32,
    usage: vk::ImageUsageFlags,
    transform: vk::SurfaceTransformFlagsKHR,
}

impl Plan {
    fn negotiate(target: &SwapchainTarget<'_>, width: u32, height: u32) -> RhiResult<Self> {
        let (device, surface, loader) = (target.physical_device, target.surface, target.surface_loader);
        let caps = unsafe { loader.get_physical_device_surface_capabilities(device, surface)? };
        let formats = unsafe { loader.get_physical_device_surface_formats(device, surface)? };
        let modes = unsafe { loader.get_physical_device_surface_present_modes(device, surface)? };
        debug!(
            formats = formats.len(),
            modes = modes.len(),
            min_images = caps.min_image_count,
            max_images = caps.max_image_count,
            "Surface capabilities"
        );

        let surface_format = pick_surface_format(&formats)
            .ok_or_else(|| swapchain_error("surface offers no color format lumen can name"))?;
        let format = convert::format_from_vk(surface_format.format)
            .ok_or_else(|| swapchain_error(format!("unmapped surface format {:?}", surface_format.format)))?;

        // Frames are blitted onto swapchain images, never rendered in place.
        let needed = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST;
        if !caps.supported_usage_flags.contains(needed) {
            return Err(swapchain_error("surface images are not blit targets"));
        }

        Ok(Self {
            surface_format,
            format,
            present_mode: pick_present_mode(&modes, target.vsync),
            extent: fit_extent(&caps, width, height),
            min_images: image_count(&caps),
            usage: needed | (caps.supported_usage_flags & vk::ImageUsageFlags::TRANSFER_SRC),
            transform: caps.current_transform,
        })
    }
}

fn swapchain_error(message: impl Into<String>) -> RhiError {
    RhiError::SwapchainError(message.into())
}

/// Semaphores owned by one frame slot.
#[derive(Clone, Copy)]
struct SlotSemaphores {
    acquired: vk::Semaphore,
    ready: vk::Semaphore,
}

pub struct Swapchain {
    raw: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: Format,
    extent: vk::Extent2D,
    slots: Vec<SlotSemaphores>,
}

impl Swapchain {
    /// Creates a swapchain of roughly `width` x `height`, retiring `old`.
    ///
    /// # Errors
    ///
    /// Returns an error if the surface offers no usable format or any Vulkan
    /// call fails.
    pub fn new(
        target: &SwapchainTarget<'_>,
        width: u32,
        height: u32,
        old: vk::SwapchainKHR,
    ) -> RhiResult<Self> {
        let plan = Plan::negotiate(target, width, height)?;

        let families = target.queue_families.unique();
        let mut info = vk::SwapchainCreateInfoKHR::default()
            .surface(target.surface)
            .min_image_count(plan.min_images)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(plan.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(plan.transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true)
            .old_swapchain(old);
        if families.len() > 1 {
            info = info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families);
        }

        let raw = unsafe { target.loader.create_swapchain(&info, None)? };
        let images = unsafe { target.loader.get_swapchain_images(raw) };
        let mut swapchain = Self {
            raw,
            images: Vec::new(),
            format: plan.format,
            extent: plan.extent,
            slots: Vec::new(),
        };
        let images = match images {
            Ok(images) => images,
            Err(err) => {
                swapchain.destroy(target.device, target.loader);
                return Err(err.into());
            }
        };
        let count = images.len();
        swapchain.images = images;

        while swapchain.slots.len() < count {
            match SlotSemaphores::create(target.device) {
                Ok(slot) => swapchain.slots.push(slot),
                Err(err) => {
                    swapchain.destroy(target.device, target.loader);
                    return Err(err);
                }
            }
        }

        info!(
            "Swapchain {}x{} {:?} {:?} ({} images)",
            plan.extent.width, plan.extent.height, plan.surface_format.format, plan.present_mode, count
        );
        Ok(swapchain)
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.raw
    }

    #[inline]
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    #[inline]
    pub fn format(&self) -> Format {
        self.format
    }

    #[inline]
    pub fn extent(&self) -> (u32, u32) {
        (self.extent.width, self.extent.height)
    }

    #[inline]
    pub fn acquired_semaphore(&self, slot: u32) -> vk::Semaphore {
        self.slots[slot as usize].acquired
    }

    #[inline]
    pub fn ready_semaphore(&self, slot: u32) -> vk::Semaphore {
        self.slots[slot as usize].ready
    }

    /// Acquires the next image, signaling the slot's "acquired" semaphore.
    /// Returns `None` when the swapchain is out of date.
    pub fn acquire(
        &self,
        loader: &ash::khr::swapchain::Device,
        slot: u32,
    ) -> RhiResult<Option<u32>> {
        let semaphore = self.acquired_semaphore(slot);
        match unsafe { loader.acquire_next_image(self.raw, u64::MAX, semaphore, vk::Fence::null()) } {
            Ok((index, true)) => {
                debug!(index, "Acquired image from a suboptimal swapchain");
                Ok(Some(index))
            }
            Ok((index, false)) => Ok(Some(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Presents `image` once the slot's "ready" semaphore is signaled.
    /// Returns false when the swapchain no longer matches the surface.
    pub fn present(
        &self,
        loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image: u32,
        slot: u32,
    ) -> RhiResult<bool> {
        let waits = [self.ready_semaphore(slot)];
        let chains = [self.raw];
        let images = [image];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&chains)
            .image_indices(&images);

        // `Ok(true)` is VK_SUBOPTIMAL_KHR.
        match unsafe { loader.queue_present(queue, &info) } {
            Ok(suboptimal) => Ok(!suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Destroys the semaphores and the swapchain. The device must be idle.
    pub fn destroy(&mut self, device: &ash::Device, loader: &ash::khr::swapchain::Device) {
        for slot in self.slots.drain(..) {
            slot.destroy(device);
        }
        self.images.clear();
        let raw = std::mem::replace(&mut self.raw, vk::SwapchainKHR::null());
        if raw != vk::SwapchainKHR::null() {
            unsafe { loader.destroy_swapchain(raw, None) };
        }
    }
}

impl SlotSemaphores {
    fn create(device: &ash::Device) -> RhiResult<Self> {
        let info = vk::SemaphoreCreateInfo::default();
        let acquired = unsafe { device.create_semaphore(&info, None)? };
        match unsafe { device.create_semaphore(&info, None) } {
            Ok(ready) => Ok(Self { acquired, ready }),
            Err(err) => {
                unsafe { device.destroy_semaphore(acquired, None) };
                Err(err.into())
            }
        }
    }

    fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.acquired, None);
            device.destroy_semaphore(self.ready, None);
        }
    }
}

/// B8G8R8A8 sRGB, then B8G8R8A8 UNORM (both with the sRGB non-linear color
/// space), then the first format lumen has a name for.
fn pick_surface_format(offered: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = [vk::Format::B8G8R8A8_SRGB, vk::Format::B8G8R8A8_UNORM];
    for (rank, wanted) in preferred.into_iter().enumerate() {
        let hit = offered
            .iter()
            .find(|f| f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR);
        if let Some(&format) = hit {
            if rank > 0 {
                warn!("sRGB swapchain format unavailable, using {:?}", wanted);
            }
            return Some(format);
        }
    }

    let fallback = offered
        .iter()
        .copied()
        .find(|f| convert::format_from_vk(f.format).is_some());
    if let Some(format) = fallback {
        warn!("Falling back to surface format {:?}", format.format);
    }
    fallback
}

/// FIFO with vsync. Without it the lowest-latency mode offered: MAILBOX,
/// then IMMEDIATE, then FIFO (always available).
fn pick_present_mode(offered: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    const UNCAPPED: [vk::PresentModeKHR; 2] =
        [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE];
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    UNCAPPED
        .into_iter()
        .find(|mode| offered.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's current extent, or the requested size clamped to its
/// limits when the surface leaves the choice to the swapchain.
fn fit_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    let (lo, hi) = (caps.min_image_extent, caps.max_image_extent);
    vk::Extent2D {
        width: width.clamp(lo.width, hi.width),
        height: height.clamp(lo.height, hi.height),
    }
}

/// One above the minimum; `max_image_count == 0` means unbounded.
fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    match caps.max_image_count {
        0 => caps.min_image_count + 1,
        max => (caps.min_image_count + 1).min(max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonlinear(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    #[test]
    fn test_srgb_bgra_wins_over_listing_order() {
        let offered = [
            nonlinear(vk::Format::R8G8B8A8_UNORM),
            nonlinear(vk::Format::B8G8R8A8_UNORM),
            nonlinear(vk::Format::B8G8R8A8_SRGB),
        ];
        assert_eq!(
            pick_surface_format(&offered).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
    }

    #[test]
    fn test_linear_color_space_is_not_preferred() {
        let offered = [
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            },
            nonlinear(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(
            pick_surface_format(&offered).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_UNORM)
        );
    }

    #[test]
    fn test_unnamed_formats_are_skipped() {
        let packed = nonlinear(vk::Format::A2B10G10R10_UNORM_PACK32);
        assert_eq!(
            pick_surface_format(&[packed, nonlinear(vk::Format::R8G8B8A8_UNORM)]).map(|f| f.format),
            Some(vk::Format::R8G8B8A8_UNORM)
        );
        assert!(pick_surface_format(&[packed]).is_none());
    }

    #[test]
    fn test_present_mode_follows_vsync() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(pick_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(pick_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(pick_present_mode(&all[..2], false), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(pick_present_mode(&all[..1], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_fixed_surface_extent_is_used_as_is() {
        let fixed = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..Default::default()
        };
        let extent = fit_extent(&fixed, 640, 480);
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn test_free_surface_extent_is_clamped() {
        let free = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        };
        let extent = fit_extent(&free, 8192, 16);
        assert_eq!((extent.width, extent.height), (4096, 64));
        let extent = fit_extent(&free, 1024, 768);
        assert_eq!((extent.width, extent.height), (1024, 768));
    }

    #[test]
    fn test_image_count_respects_the_maximum() {
        assert_eq!(image_count(&caps(2, 2)), 2);
        assert_eq!(image_count(&caps(2, 8)), 3);
        assert_eq!(image_count(&caps(3, 0)), 4);
    }
}
