//! Pipeline descriptions.
//!
//! A pipeline couples a named shader (plus defines) with fixed-function
//! state and a render-target description taken from a framebuffer, or marks
//! it as compute. The enums here are backend-neutral; each backend maps them
//! to its native values.

use crate::backend::{RawPipeline, RawPipelineLayout};
use crate::handle::{FramebufferHandle, ShaderHandle};

/// Primitive topology for input assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

/// Comparison operator for depth testing and shadow samplers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    Min,
    Max,
}

/// Blend presets applied to every color attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    Alpha,
    Premultiplied,
    Additive,
}

/// Per-attachment blend state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorBlend {
    pub enabled: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
}

impl BlendMode {
    pub fn color_blend(self) -> ColorBlend {
        let (enabled, src, dst) = match self {
            BlendMode::Opaque => (false, BlendFactor::One, BlendFactor::Zero),
            BlendMode::Alpha => (true, BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha),
            BlendMode::Premultiplied => (true, BlendFactor::One, BlendFactor::OneMinusSrcAlpha),
            BlendMode::Additive => (true, BlendFactor::One, BlendFactor::One),
        };
        ColorBlend {
            enabled,
            src_color: src,
            dst_color: dst,
            color_op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: if self == BlendMode::Additive {
                BlendFactor::One
            } else {
                BlendFactor::OneMinusSrcAlpha
            },
            alpha_op: BlendOp::Add,
        }
    }
}

/// Attribute formats a vertex stream can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float,
    Float2,
    Float3,
    Float4,
    Int,
    Int2,
    Int3,
    Int4,
    UInt,
    UInt2,
    UInt3,
    UInt4,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            VertexFormat::Float | VertexFormat::Int | VertexFormat::UInt => 4,
            VertexFormat::Float2 | VertexFormat::Int2 | VertexFormat::UInt2 => 8,
            VertexFormat::Float3 | VertexFormat::Int3 | VertexFormat::UInt3 => 12,
            VertexFormat::Float4 | VertexFormat::Int4 | VertexFormat::UInt4 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

/// A single interleaved vertex stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Packs `(location, format)` pairs tightly in location order.
    pub fn packed(inputs: &[(u32, VertexFormat)]) -> Self {
        let mut sorted = inputs.to_vec();
        sorted.sort_by_key(|(location, _)| *location);

        let mut offset = 0;
        let attributes = sorted
            .into_iter()
            .map(|(location, format)| {
                let attribute = VertexAttribute {
                    location,
                    format,
                    offset,
                };
                offset += format.size();
                attribute
            })
            .collect();

        Self {
            stride: offset,
            attributes,
        }
    }
}

/// Where a pipeline's output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineTarget {
    Framebuffer(FramebufferHandle),
    Compute,
}

/// Description of a pipeline to create.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineSettings {
    /// Shader name handed to the resolver.
    pub shader: String,
    /// Preprocessor defines, `NAME` or `NAME=VALUE`.
    pub defines: Vec<String>,
    pub target: PipelineTarget,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: CompareOp,
    pub blend: BlendMode,
    pub cull: CullMode,
    pub front_face: FrontFace,
    pub topology: PrimitiveTopology,
    pub polygon_mode: PolygonMode,
    /// Explicit vertex layout. When absent the layout is packed from the
    /// shader's reflected vertex inputs.
    pub vertex_layout: Option<VertexLayout>,
}

impl PipelineSettings {
    pub fn graphics(shader: impl Into<String>, framebuffer: FramebufferHandle) -> Self {
        Self {
            shader: shader.into(),
            defines: Vec::new(),
            target: PipelineTarget::Framebuffer(framebuffer),
            depth_test: false,
            depth_write: false,
            depth_compare: CompareOp::Less,
            blend: BlendMode::Opaque,
            cull: CullMode::None,
            front_face: FrontFace::CounterClockwise,
            topology: PrimitiveTopology::TriangleList,
            polygon_mode: PolygonMode::Fill,
            vertex_layout: None,
        }
    }

    pub fn compute(shader: impl Into<String>) -> Self {
        Self {
            target: PipelineTarget::Compute,
            ..Self::graphics(shader, FramebufferHandle::default())
        }
    }

    pub fn define(mut self, define: impl Into<String>) -> Self {
        self.defines.push(define.into());
        self
    }

    pub fn depth(mut self, test: bool, write: bool) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self
    }

    pub fn blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    pub fn cull(mut self, cull: CullMode) -> Self {
        self.cull = cull;
        self
    }

    pub fn topology(mut self, topology: PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.vertex_layout = Some(layout);
        self
    }

    #[inline]
    pub fn is_compute(&self) -> bool {
        self.target == PipelineTarget::Compute
    }
}

/// Which pipeline bind point a command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
}

/// Device-side record of a pipeline. The handle stays stable across
/// shader reloads; `raw` and `shader` are swapped in place.
#[derive(Debug)]
pub(crate) struct Pipeline {
    pub settings: PipelineSettings,
    pub shader: ShaderHandle,
    pub raw: RawPipeline,
    pub layout: RawPipelineLayout,
    pub bind_point: BindPoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_presets() {
        let opaque = BlendMode::Opaque.color_blend();
        assert!(!opaque.enabled);

        let alpha = BlendMode::Alpha.color_blend();
        assert!(alpha.enabled);
        assert_eq!(alpha.src_color, BlendFactor::SrcAlpha);
        assert_eq!(alpha.dst_color, BlendFactor::OneMinusSrcAlpha);

        let additive = BlendMode::Additive.color_blend();
        assert_eq!(additive.dst_color, BlendFactor::One);
        assert_eq!(additive.dst_alpha, BlendFactor::One);
    }

    #[test]
    fn test_packed_vertex_layout() {
        let layout = VertexLayout::packed(&[
            (2, VertexFormat::Float2),
            (0, VertexFormat::Float3),
            (1, VertexFormat::Float3),
        ]);
        assert_eq!(layout.stride, 32);
        assert_eq!(layout.attributes[0].location, 0);
        assert_eq!(layout.attributes[0].offset, 0);
        assert_eq!(layout.attributes[1].offset, 12);
        assert_eq!(layout.attributes[2].location, 2);
        assert_eq!(layout.attributes[2].offset, 24);
    }

    #[test]
    fn test_settings_builders() {
        let settings = PipelineSettings::compute("blur").define("RADIUS=4");
        assert!(settings.is_compute());
        assert_eq!(settings.defines, vec!["RADIUS=4".to_string()]);

        let settings = PipelineSettings::graphics("mesh", FramebufferHandle::default())
            .depth(true, true)
            .blend(BlendMode::Alpha);
        assert!(!settings.is_compute());
        assert!(settings.depth_test && settings.depth_write);
        assert_eq!(settings.blend, BlendMode::Alpha);
    }
}
