//! Mapping of backend-neutral enums onto Vulkan values.

use ash::vk;

use crate::buffer::{BufferKind, IndexType};
use crate::descriptor::{DescriptorKind, StageMask};
use crate::framebuffer::LoadOp;
use crate::pipeline::{
    BindPoint, BlendFactor, BlendOp, CompareOp, CullMode, FrontFace, PolygonMode,
    PrimitiveTopology, VertexFormat,
};
use crate::sampler::{AddressMode, Filter};
use crate::shader::ShaderStage;
use crate::texture::{Aspect, Format, ImageLayout, TextureUsage, ViewDimension};

pub fn format(format: Format) -> vk::Format {
    match format {
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::Rg8Unorm => vk::Format::R8G8_UNORM,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::Depth32Float => vk::Format::D32_SFLOAT,
        Format::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
    }
}

/// Inverse of [`format`] for the formats a surface may offer.
pub fn format_from_vk(format: vk::Format) -> Option<Format> {
    Some(match format {
        vk::Format::R8G8B8A8_UNORM => Format::Rgba8Unorm,
        vk::Format::R8G8B8A8_SRGB => Format::Rgba8Srgb,
        vk::Format::B8G8R8A8_UNORM => Format::Bgra8Unorm,
        vk::Format::B8G8R8A8_SRGB => Format::Bgra8Srgb,
        vk::Format::R16G16B16A16_SFLOAT => Format::Rgba16Float,
        _ => return None,
    })
}

pub fn aspect(aspect: Aspect) -> vk::ImageAspectFlags {
    match aspect {
        Aspect::Color => vk::ImageAspectFlags::COLOR,
        Aspect::Depth => vk::ImageAspectFlags::DEPTH,
        Aspect::DepthStencil => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
    }
}

pub fn image_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let transfer = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    match usage {
        TextureUsage::Sampled => {
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::COLOR_ATTACHMENT | transfer
        }
        TextureUsage::Storage => {
            vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::COLOR_ATTACHMENT
                | transfer
        }
        TextureUsage::Depth => {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED | transfer
        }
        TextureUsage::Present => vk::ImageUsageFlags::COLOR_ATTACHMENT | transfer,
    }
}

pub fn buffer_usage(kind: BufferKind) -> vk::BufferUsageFlags {
    let transfer = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    transfer
        | match kind {
            BufferKind::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferKind::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            BufferKind::Uniform | BufferKind::UniformDynamic => {
                vk::BufferUsageFlags::UNIFORM_BUFFER
            }
            BufferKind::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
            BufferKind::Staging => vk::BufferUsageFlags::empty(),
        }
}

/// Native layout plus the access and stage masks work in that layout uses.
pub fn layout(layout: ImageLayout) -> (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags) {
    use vk::AccessFlags as A;
    use vk::PipelineStageFlags as S;
    match layout {
        ImageLayout::Undefined => (vk::ImageLayout::UNDEFINED, A::empty(), S::TOP_OF_PIPE),
        ImageLayout::General => (
            vk::ImageLayout::GENERAL,
            A::SHADER_READ | A::SHADER_WRITE,
            S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
        ),
        ImageLayout::ColorAttachment => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        ImageLayout::DepthAttachment => (
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
        ),
        ImageLayout::DepthReadOnly => (
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            A::SHADER_READ | A::DEPTH_STENCIL_ATTACHMENT_READ,
            S::FRAGMENT_SHADER | S::COMPUTE_SHADER | S::EARLY_FRAGMENT_TESTS,
        ),
        ImageLayout::ShaderReadOnly => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            A::SHADER_READ,
            S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
        ),
        ImageLayout::TransferSrc => (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            A::TRANSFER_READ,
            S::TRANSFER,
        ),
        ImageLayout::TransferDst => (
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            A::TRANSFER_WRITE,
            S::TRANSFER,
        ),
        ImageLayout::PresentSrc => (
            vk::ImageLayout::PRESENT_SRC_KHR,
            A::empty(),
            S::BOTTOM_OF_PIPE,
        ),
    }
}

pub fn view_type(dimension: ViewDimension) -> vk::ImageViewType {
    match dimension {
        ViewDimension::D2 => vk::ImageViewType::TYPE_2D,
        ViewDimension::D2Array => vk::ImageViewType::TYPE_2D_ARRAY,
        ViewDimension::Cube => vk::ImageViewType::CUBE,
    }
}

pub fn samples(count: u32) -> vk::SampleCountFlags {
    match count {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

pub fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub fn mipmap_mode(filter: Filter) -> vk::SamplerMipmapMode {
    match filter {
        Filter::Nearest => vk::SamplerMipmapMode::NEAREST,
        Filter::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

pub fn compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

pub fn polygon_mode(mode: PolygonMode) -> vk::PolygonMode {
    match mode {
        PolygonMode::Fill => vk::PolygonMode::FILL,
        PolygonMode::Line => vk::PolygonMode::LINE,
    }
}

pub fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub fn front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
    }
}

pub fn blend_factor(factor: BlendFactor) -> vk::BlendFactor {
    match factor {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
    }
}

pub fn blend_op(op: BlendOp) -> vk::BlendOp {
    match op {
        BlendOp::Add => vk::BlendOp::ADD,
        BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        BlendOp::Min => vk::BlendOp::MIN,
        BlendOp::Max => vk::BlendOp::MAX,
    }
}

pub fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float => vk::Format::R32_SFLOAT,
        VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::Int => vk::Format::R32_SINT,
        VertexFormat::Int2 => vk::Format::R32G32_SINT,
        VertexFormat::Int3 => vk::Format::R32G32B32_SINT,
        VertexFormat::Int4 => vk::Format::R32G32B32A32_SINT,
        VertexFormat::UInt => vk::Format::R32_UINT,
        VertexFormat::UInt2 => vk::Format::R32G32_UINT,
        VertexFormat::UInt3 => vk::Format::R32G32B32_UINT,
        VertexFormat::UInt4 => vk::Format::R32G32B32A32_UINT,
    }
}

pub fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorKind::SampledTexture => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
    }
}

pub fn stage_mask(mask: StageMask) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if mask.contains(StageMask::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if mask.contains(StageMask::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if mask.contains(StageMask::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

pub fn shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
    }
}

pub fn index_type(index_type: IndexType) -> vk::IndexType {
    match index_type {
        IndexType::U16 => vk::IndexType::UINT16,
        IndexType::U32 => vk::IndexType::UINT32,
    }
}

pub fn load_op(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub fn bind_point(point: BindPoint) -> vk::PipelineBindPoint {
    match point {
        BindPoint::Graphics => vk::PipelineBindPoint::GRAPHICS,
        BindPoint::Compute => vk::PipelineBindPoint::COMPUTE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_formats_round_trip() {
        for format_in in [
            Format::Rgba8Unorm,
            Format::Rgba8Srgb,
            Format::Bgra8Unorm,
            Format::Bgra8Srgb,
        ] {
            assert_eq!(format_from_vk(format(format_in)), Some(format_in));
        }
        assert_eq!(format_from_vk(vk::Format::D32_SFLOAT), None);
    }

    #[test]
    fn test_depth_stencil_aspect_covers_both_planes() {
        let flags = aspect(Format::Depth24Stencil8.aspect());
        assert!(flags.contains(vk::ImageAspectFlags::DEPTH));
        assert!(flags.contains(vk::ImageAspectFlags::STENCIL));
        assert_eq!(
            aspect(Format::Depth32Float.aspect()),
            vk::ImageAspectFlags::DEPTH
        );
    }

    #[test]
    fn test_uniform_blocks_are_dynamic() {
        assert_eq!(
            descriptor_type(DescriptorKind::UniformBuffer),
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        );
    }

    #[test]
    fn test_layout_masks() {
        let (native, access, stage) = layout(ImageLayout::TransferDst);
        assert_eq!(native, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(stage, vk::PipelineStageFlags::TRANSFER);

        let (native, access, _) = layout(ImageLayout::Undefined);
        assert_eq!(native, vk::ImageLayout::UNDEFINED);
        assert!(access.is_empty());
    }

    #[test]
    fn test_stage_mask_combines() {
        let flags = stage_mask(StageMask::VERTEX | StageMask::FRAGMENT);
        assert_eq!(
            flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert!(stage_mask(StageMask::default()).is_empty());
    }

    #[test]
    fn test_present_images_accept_blits() {
        assert!(image_usage(TextureUsage::Present).contains(vk::ImageUsageFlags::TRANSFER_DST));
        assert!(image_usage(TextureUsage::Storage).contains(vk::ImageUsageFlags::STORAGE));
    }
}
