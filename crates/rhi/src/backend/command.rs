//! Recorded GPU commands.

use super::{RawBuffer, RawDescriptorSet, RawPipeline, RawPipelineLayout, RawTexture, RawView};
use crate::buffer::IndexType;
use crate::framebuffer::LoadOp;
use crate::pipeline::BindPoint;
use crate::sampler::Filter;
use crate::texture::{Aspect, ImageLayout};

/// Mip and layer window of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub aspect: Aspect,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    pub fn single(aspect: Aspect, mip: u32, layer: u32) -> Self {
        Self {
            aspect,
            base_mip: mip,
            mip_count: 1,
            base_layer: layer,
            layer_count: 1,
        }
    }

    /// Whether `(mip, layer)` falls inside the range.
    #[inline]
    pub fn contains(&self, mip: u32, layer: u32) -> bool {
        mip >= self.base_mip
            && mip < self.base_mip + self.mip_count
            && layer >= self.base_layer
            && layer < self.base_layer + self.layer_count
    }
}

/// A color attachment of a dynamic rendering scope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTarget {
    pub texture: RawTexture,
    pub view: RawView,
    pub mip: u32,
    pub layer: u32,
    pub load: LoadOp,
    pub clear: [f32; 4],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthTarget {
    pub texture: RawTexture,
    pub view: RawView,
    pub aspect: Aspect,
    pub mip: u32,
    pub layer: u32,
    pub load: LoadOp,
    pub depth: f32,
    pub stencil: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Full-extent viewport with the 0..1 depth range.
    pub fn extent(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// One command in a stream.
///
/// Transfer commands expect their source in `TransferSrc` and their
/// destination in `TransferDst`; the context records the barriers around
/// them.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRendering {
        colors: Vec<ColorTarget>,
        depth: Option<DepthTarget>,
        extent: (u32, u32),
    },
    EndRendering,
    BindPipeline {
        point: BindPoint,
        pipeline: RawPipeline,
    },
    BindVertexBuffer {
        buffer: RawBuffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: RawBuffer,
        offset: u64,
        index_type: IndexType,
    },
    BindDescriptorSet {
        point: BindPoint,
        layout: RawPipelineLayout,
        set: u32,
        descriptor_set: RawDescriptorSet,
        dynamic_offsets: Vec<u32>,
    },
    SetViewport(Viewport),
    SetScissor {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    ImageBarrier {
        texture: RawTexture,
        range: SubresourceRange,
        old: ImageLayout,
        new: ImageLayout,
    },
    /// Compute shader writes become visible to every later read.
    MemoryBarrier,
    ClearColor {
        texture: RawTexture,
        range: SubresourceRange,
        color: [f32; 4],
    },
    ClearDepth {
        texture: RawTexture,
        range: SubresourceRange,
        depth: f32,
        stencil: u32,
    },
    /// Tightly packed texels for `layer_count` layers of one mip.
    CopyBufferToTexture {
        buffer: RawBuffer,
        offset: u64,
        texture: RawTexture,
        aspect: Aspect,
        mip: u32,
        base_layer: u32,
        layer_count: u32,
        extent: (u32, u32),
    },
    CopyTextureToBuffer {
        texture: RawTexture,
        aspect: Aspect,
        mip: u32,
        layer: u32,
        extent: (u32, u32),
        buffer: RawBuffer,
        offset: u64,
    },
    CopyTexture {
        src: RawTexture,
        src_mip: u32,
        src_layer: u32,
        dst: RawTexture,
        dst_mip: u32,
        dst_layer: u32,
        aspect: Aspect,
        extent: (u32, u32),
    },
    BlitTexture {
        src: RawTexture,
        src_mip: u32,
        src_layer: u32,
        src_extent: (u32, u32),
        dst: RawTexture,
        dst_mip: u32,
        dst_layer: u32,
        dst_extent: (u32, u32),
        aspect: Aspect,
        filter: Filter,
    },
}

impl Command {
    /// Short name for logs and event traces.
    pub fn name(&self) -> &'static str {
        match self {
            Command::BeginRendering { .. } => "BeginRendering",
            Command::EndRendering => "EndRendering",
            Command::BindPipeline { .. } => "BindPipeline",
            Command::BindVertexBuffer { .. } => "BindVertexBuffer",
            Command::BindIndexBuffer { .. } => "BindIndexBuffer",
            Command::BindDescriptorSet { .. } => "BindDescriptorSet",
            Command::SetViewport(_) => "SetViewport",
            Command::SetScissor { .. } => "SetScissor",
            Command::Draw { .. } => "Draw",
            Command::DrawIndexed { .. } => "DrawIndexed",
            Command::Dispatch { .. } => "Dispatch",
            Command::ImageBarrier { .. } => "ImageBarrier",
            Command::MemoryBarrier => "MemoryBarrier",
            Command::ClearColor { .. } => "ClearColor",
            Command::ClearDepth { .. } => "ClearDepth",
            Command::CopyBufferToTexture { .. } => "CopyBufferToTexture",
            Command::CopyTextureToBuffer { .. } => "CopyTextureToBuffer",
            Command::CopyTexture { .. } => "CopyTexture",
            Command::BlitTexture { .. } => "BlitTexture",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subresource_range_contains() {
        let range = SubresourceRange {
            aspect: Aspect::Color,
            base_mip: 1,
            mip_count: 2,
            base_layer: 0,
            layer_count: 6,
        };
        assert!(range.contains(1, 0));
        assert!(range.contains(2, 5));
        assert!(!range.contains(0, 0));
        assert!(!range.contains(3, 0));
        assert!(!range.contains(1, 6));
    }

    #[test]
    fn test_full_viewport() {
        let viewport = Viewport::extent(800, 600);
        assert_eq!(viewport.width, 800.0);
        assert_eq!(viewport.height, 600.0);
        assert_eq!(viewport.max_depth, 1.0);
    }
}
