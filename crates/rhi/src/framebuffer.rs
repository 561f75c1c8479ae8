//! Immutable render-pass attachment sets.

use crate::backend::RawView;
use crate::handle::TextureHandle;
use crate::texture::Format;

/// Maximum color attachments per framebuffer.
pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// One attachment, optionally pinned to a layer and mip level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Attachment {
    pub texture: TextureHandle,
    pub layer: Option<u32>,
    pub level: Option<u32>,
}

impl Attachment {
    pub fn layer(mut self, layer: u32) -> Self {
        self.layer = Some(layer);
        self
    }

    pub fn level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    #[inline]
    pub(crate) fn mip(&self) -> u32 {
        self.level.unwrap_or(0)
    }

    #[inline]
    pub(crate) fn base_layer(&self) -> u32 {
        self.layer.unwrap_or(0)
    }
}

impl From<TextureHandle> for Attachment {
    fn from(texture: TextureHandle) -> Self {
        Self {
            texture,
            layer: None,
            level: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FramebufferSettings {
    pub color: Vec<Attachment>,
    pub depth: Option<Attachment>,
}

impl FramebufferSettings {
    pub fn color(mut self, attachment: impl Into<Attachment>) -> Self {
        self.color.push(attachment.into());
        self
    }

    pub fn depth(mut self, attachment: impl Into<Attachment>) -> Self {
        self.depth = Some(attachment.into());
        self
    }
}

/// Render-target description derived from a framebuffer's attachments.
/// Graphics pipelines are built against it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderTargetDesc {
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
    pub samples: u32,
}

/// Device-side record of a framebuffer.
#[derive(Debug)]
pub(crate) struct Framebuffer {
    pub settings: FramebufferSettings,
    pub target: RenderTargetDesc,
    pub extent: (u32, u32),
    pub color_views: Vec<RawView>,
    pub depth_view: Option<RawView>,
}

/// How an attachment's previous contents are treated at the start of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum LoadOp {
    #[default]
    Load,
    Clear,
    DontCare,
}

/// Clear values for `begin_render_pass`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u32,
}

impl ClearValues {
    pub fn color(color: [f32; 4]) -> Self {
        Self {
            color,
            ..Default::default()
        }
    }
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
            depth: 1.0,
            stencil: 0,
        }
    }
}
