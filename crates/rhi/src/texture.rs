//! Texture descriptions, formats and image layouts.
//!
//! A texture's [`TextureUsage`] decides its resting layout. Every operation
//! that moves a texture out of that layout (render pass, copy, blit, mip
//! generation) moves it back before returning, so passes never observe each
//! other's transient layouts.

use crate::backend::{RawTexture, RawView};

/// Pixel formats understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgba16Float,
    R32Float,
    Rgba32Float,
    Depth32Float,
    Depth24Stencil8,
}

impl Format {
    /// Size of one texel in bytes.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Format::R8Unorm => 1,
            Format::Rg8Unorm => 2,
            Format::Rgba8Unorm
            | Format::Rgba8Srgb
            | Format::Bgra8Unorm
            | Format::Bgra8Srgb
            | Format::R32Float
            | Format::Depth32Float
            | Format::Depth24Stencil8 => 4,
            Format::Rgba16Float => 8,
            Format::Rgba32Float => 16,
        }
    }

    #[inline]
    pub fn is_depth(self) -> bool {
        matches!(self, Format::Depth32Float | Format::Depth24Stencil8)
    }

    #[inline]
    pub fn has_stencil(self) -> bool {
        matches!(self, Format::Depth24Stencil8)
    }

    #[inline]
    pub fn is_srgb(self) -> bool {
        matches!(self, Format::Rgba8Srgb | Format::Bgra8Srgb)
    }

    pub fn aspect(self) -> Aspect {
        match self {
            Format::Depth32Float => Aspect::Depth,
            Format::Depth24Stencil8 => Aspect::DepthStencil,
            _ => Aspect::Color,
        }
    }
}

/// Image aspect touched by a barrier or copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aspect {
    Color,
    Depth,
    DepthStencil,
}

/// GPU image layouts the engine moves textures between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    General,
    ColorAttachment,
    DepthAttachment,
    DepthReadOnly,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

/// What a texture is used for between passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureUsage {
    /// Sampled by shaders; also a color render target.
    #[default]
    Sampled,
    /// Read and written as a storage image by compute shaders.
    Storage,
    /// A swapchain image.
    Present,
    /// A depth (or depth/stencil) attachment that can also be sampled.
    Depth,
}

impl TextureUsage {
    /// Layout the texture is kept in whenever no operation is using it.
    pub fn resting_layout(self) -> ImageLayout {
        match self {
            TextureUsage::Sampled => ImageLayout::ShaderReadOnly,
            TextureUsage::Storage => ImageLayout::General,
            TextureUsage::Present => ImageLayout::PresentSrc,
            TextureUsage::Depth => ImageLayout::DepthReadOnly,
        }
    }

    /// Layout used while the texture is bound as a render-pass attachment.
    pub fn attachment_layout(self) -> ImageLayout {
        match self {
            TextureUsage::Depth => ImageLayout::DepthAttachment,
            _ => ImageLayout::ColorAttachment,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureShape {
    #[default]
    D2,
    D2Array,
    Cube,
}

/// Description of a texture to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureSettings {
    pub width: u32,
    pub height: u32,
    /// Mip levels.
    pub levels: u32,
    /// Array layers; cube textures use six.
    pub layers: u32,
    pub samples: u32,
    pub format: Format,
    pub shape: TextureShape,
    pub usage: TextureUsage,
    /// Fill levels 1.. from level 0 by successive blits after an upload.
    pub generate_mips: bool,
}

impl TextureSettings {
    /// A single-level, sampled 2D texture that passes can render into.
    pub fn render_target(width: u32, height: u32, format: Format) -> Self {
        Self {
            width,
            height,
            levels: 1,
            layers: 1,
            samples: 1,
            format,
            shape: TextureShape::D2,
            usage: TextureUsage::Sampled,
            generate_mips: false,
        }
    }

    pub fn depth(width: u32, height: u32) -> Self {
        Self {
            usage: TextureUsage::Depth,
            ..Self::render_target(width, height, Format::Depth32Float)
        }
    }

    pub fn storage(width: u32, height: u32, format: Format) -> Self {
        Self {
            usage: TextureUsage::Storage,
            ..Self::render_target(width, height, format)
        }
    }

    pub fn cube(size: u32, format: Format) -> Self {
        Self {
            layers: 6,
            shape: TextureShape::Cube,
            ..Self::render_target(size, size, format)
        }
    }

    pub fn with_levels(mut self, levels: u32) -> Self {
        self.levels = levels;
        self
    }

    /// Allocates the full mip chain and generates it on upload.
    pub fn with_mip_chain(mut self) -> Self {
        self.levels = max_mip_levels(self.width, self.height);
        self.generate_mips = true;
        self
    }

    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Extent of a mip level, never below 1x1.
    pub fn mip_extent(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }

    /// Bytes of one layer of one mip level.
    pub fn level_size(&self, level: u32) -> u64 {
        let (w, h) = self.mip_extent(level);
        w as u64 * h as u64 * self.format.bytes_per_pixel() as u64
    }

    /// Asserts that the description is internally consistent.
    pub(crate) fn assert_valid(&self) {
        assert!(
            self.width > 0 && self.height > 0,
            "texture extent {}x{} is empty",
            self.width,
            self.height
        );
        assert!(
            self.levels >= 1 && self.levels <= max_mip_levels(self.width, self.height),
            "texture with extent {}x{} cannot have {} mip levels",
            self.width,
            self.height,
            self.levels
        );
        assert!(
            matches!(self.samples, 1 | 2 | 4 | 8),
            "unsupported sample count {}",
            self.samples
        );
        match self.shape {
            TextureShape::D2 => assert_eq!(self.layers, 1, "2D textures have exactly one layer"),
            TextureShape::D2Array => assert!(self.layers >= 1, "array textures need a layer"),
            TextureShape::Cube => {
                assert_eq!(self.layers, 6, "cube textures have six layers");
                assert_eq!(self.width, self.height, "cube faces must be square");
            }
        }
        assert_eq!(
            self.format.is_depth(),
            self.usage == TextureUsage::Depth,
            "depth formats and the depth usage class go together"
        );
    }
}

/// Number of levels in a full mip chain.
pub fn max_mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Dimensionality of an image view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewDimension {
    D2,
    D2Array,
    Cube,
}

/// Subresource window of an image view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewDesc {
    pub format: Format,
    pub dimension: ViewDimension,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl ViewDesc {
    /// View over every level and layer of a texture.
    pub fn full(settings: &TextureSettings) -> Self {
        Self {
            format: settings.format,
            dimension: match settings.shape {
                TextureShape::D2 => ViewDimension::D2,
                TextureShape::D2Array => ViewDimension::D2Array,
                TextureShape::Cube => ViewDimension::Cube,
            },
            base_mip: 0,
            mip_count: settings.levels,
            base_layer: 0,
            layer_count: settings.layers,
        }
    }

    /// View over one level (all layers) for storage-image binding.
    pub fn level(settings: &TextureSettings, mip: u32) -> Self {
        Self {
            dimension: if settings.layers > 1 {
                ViewDimension::D2Array
            } else {
                ViewDimension::D2
            },
            base_mip: mip,
            mip_count: 1,
            ..Self::full(settings)
        }
    }

    /// 2D view of a single level of a single layer, as attachments need.
    pub fn single(settings: &TextureSettings, mip: u32, layer: u32) -> Self {
        Self {
            format: settings.format,
            dimension: ViewDimension::D2,
            base_mip: mip,
            mip_count: 1,
            base_layer: layer,
            layer_count: 1,
        }
    }
}

/// Device-side record of a texture.
#[derive(Debug)]
pub(crate) struct Texture {
    pub raw: RawTexture,
    pub settings: TextureSettings,
    /// View over the whole texture, used for sampling.
    pub view: RawView,
    /// One view per level, created for storage textures.
    pub mip_views: Vec<RawView>,
    /// False until the first transition out of `Undefined` is recorded.
    /// Swapchain images start this way after every rebuild.
    pub initialized: bool,
    /// Owned by the swapchain rather than the device.
    pub external: bool,
}

impl Texture {
    #[inline]
    pub fn resting_layout(&self) -> ImageLayout {
        self.settings.usage.resting_layout()
    }

    /// Layout to name as the old layout of the next barrier.
    #[inline]
    pub fn current_layout(&self) -> ImageLayout {
        if self.initialized {
            self.resting_layout()
        } else {
            ImageLayout::Undefined
        }
    }

    pub fn mip_view(&self, mip: u32) -> RawView {
        assert!(
            (mip as usize) < self.mip_views.len(),
            "texture has no storage view for mip {} ({} available)",
            mip,
            self.mip_views.len()
        );
        self.mip_views[mip as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resting_layouts() {
        assert_eq!(
            TextureUsage::Sampled.resting_layout(),
            ImageLayout::ShaderReadOnly
        );
        assert_eq!(TextureUsage::Storage.resting_layout(), ImageLayout::General);
        assert_eq!(
            TextureUsage::Present.resting_layout(),
            ImageLayout::PresentSrc
        );
        assert_eq!(
            TextureUsage::Depth.resting_layout(),
            ImageLayout::DepthReadOnly
        );
        assert_eq!(
            TextureUsage::Depth.attachment_layout(),
            ImageLayout::DepthAttachment
        );
        assert_eq!(
            TextureUsage::Sampled.attachment_layout(),
            ImageLayout::ColorAttachment
        );
    }

    #[test]
    fn test_max_mip_levels() {
        assert_eq!(max_mip_levels(1, 1), 1);
        assert_eq!(max_mip_levels(256, 256), 9);
        assert_eq!(max_mip_levels(800, 600), 10);
        assert_eq!(max_mip_levels(1024, 1), 11);
    }

    #[test]
    fn test_mip_extent_clamps_to_one() {
        let settings = TextureSettings::render_target(800, 600, Format::Rgba8Unorm)
            .with_levels(10);
        assert_eq!(settings.mip_extent(0), (800, 600));
        assert_eq!(settings.mip_extent(3), (100, 75));
        assert_eq!(settings.mip_extent(9), (1, 1));
        assert_eq!(settings.level_size(1), 400 * 300 * 4);
    }

    #[test]
    fn test_format_properties() {
        assert_eq!(Format::Rgba16Float.bytes_per_pixel(), 8);
        assert!(Format::Depth24Stencil8.has_stencil());
        assert_eq!(Format::Depth32Float.aspect(), Aspect::Depth);
        assert_eq!(Format::Bgra8Srgb.aspect(), Aspect::Color);
        assert!(Format::Rgba8Srgb.is_srgb());
    }

    #[test]
    fn test_with_mip_chain() {
        let settings = TextureSettings::render_target(64, 32, Format::Rgba8Unorm).with_mip_chain();
        assert_eq!(settings.levels, 7);
        assert!(settings.generate_mips);
        settings.assert_valid();
    }

    #[test]
    #[should_panic(expected = "cube textures have six layers")]
    fn test_cube_requires_six_layers() {
        let mut settings = TextureSettings::cube(64, Format::Rgba16Float);
        settings.layers = 4;
        settings.assert_valid();
    }

    #[test]
    #[should_panic(expected = "depth formats and the depth usage class go together")]
    fn test_depth_format_requires_depth_usage() {
        TextureSettings::render_target(4, 4, Format::Depth32Float).assert_valid();
    }
}
