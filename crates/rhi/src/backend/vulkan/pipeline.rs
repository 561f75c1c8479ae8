//! Graphics and compute pipeline creation.
//!
//! Graphics pipelines target dynamic rendering: attachment formats come
//! from the render target description instead of a render pass, and
//! viewport and scissor are always dynamic.

use ash::vk;
use ash::vk::Handle;
use tracing::debug;

use super::convert;
use crate::backend::{ComputePipelineDesc, GraphicsPipelineDesc};
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{ColorBlend, VertexLayout};

const ENTRY_POINT: &std::ffi::CStr = c"main";

fn blend_attachment(blend: &ColorBlend) -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(blend.enabled)
        .src_color_blend_factor(convert::blend_factor(blend.src_color))
        .dst_color_blend_factor(convert::blend_factor(blend.dst_color))
        .color_blend_op(convert::blend_op(blend.color_op))
        .src_alpha_blend_factor(convert::blend_factor(blend.src_alpha))
        .dst_alpha_blend_factor(convert::blend_factor(blend.dst_alpha))
        .alpha_blend_op(convert::blend_op(blend.alpha_op))
        .color_write_mask(vk::ColorComponentFlags::RGBA)
}

/// Binding and attribute descriptions for one interleaved vertex buffer.
/// An empty layout has no bindings at all.
fn vertex_input(
    layout: &VertexLayout,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    if layout.attributes.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: layout.stride,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let attributes = layout
        .attributes
        .iter()
        .map(|attribute| vk::VertexInputAttributeDescription {
            location: attribute.location,
            binding: 0,
            format: convert::vertex_format(attribute.format),
            offset: attribute.offset,
        })
        .collect();
    (vec![binding], attributes)
}

/// Creates a graphics pipeline for `desc`.
///
/// # Errors
///
/// Returns [`RhiError::PipelineError`] if the driver rejects the pipeline.
pub fn create_graphics(
    device: &ash::Device,
    desc: &GraphicsPipelineDesc<'_>,
) -> RhiResult<vk::Pipeline> {
    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vk::ShaderModule::from_raw(desc.vertex.0))
            .name(ENTRY_POINT),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(vk::ShaderModule::from_raw(desc.fragment.0))
            .name(ENTRY_POINT),
    ];

    let (bindings, attributes) = vertex_input(desc.vertex_layout);
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(convert::topology(desc.topology));

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(convert::polygon_mode(desc.polygon_mode))
        .line_width(1.0)
        .cull_mode(convert::cull_mode(desc.cull))
        .front_face(convert::front_face(desc.front_face));

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(convert::samples(desc.target.samples));

    let has_depth = desc.target.depth_format.is_some();
    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(has_depth && desc.depth_test)
        .depth_write_enable(has_depth && desc.depth_write)
        .depth_compare_op(convert::compare_op(desc.depth_compare));

    let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
        .target
        .color_formats
        .iter()
        .map(|_| blend_attachment(&desc.blend))
        .collect();
    let color_blend_state =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats: Vec<vk::Format> = desc
        .target
        .color_formats
        .iter()
        .map(|&format| convert::format(format))
        .collect();
    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);
    if let Some(depth_format) = desc.target.depth_format {
        rendering_info = rendering_info.depth_attachment_format(convert::format(depth_format));
        if depth_format.has_stencil() {
            rendering_info = rendering_info.stencil_attachment_format(convert::format(depth_format));
        }
    }

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(vk::PipelineLayout::from_raw(desc.layout.0))
        .push_next(&mut rendering_info);

    let pipeline = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, result)| {
                RhiError::PipelineError(format!("'{}': {result}", desc.label))
            })?[0]
    };
    debug!("Graphics pipeline '{}' created", desc.label);
    Ok(pipeline)
}

/// Creates a compute pipeline for `desc`.
///
/// # Errors
///
/// Returns [`RhiError::PipelineError`] if the driver rejects the pipeline.
pub fn create_compute(device: &ash::Device, desc: &ComputePipelineDesc<'_>) -> RhiResult<vk::Pipeline> {
    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(vk::ShaderModule::from_raw(desc.module.0))
        .name(ENTRY_POINT);
    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(vk::PipelineLayout::from_raw(desc.layout.0));

    let pipeline = unsafe {
        device
            .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, result)| {
                RhiError::PipelineError(format!("'{}': {result}", desc.label))
            })?[0]
    };
    debug!("Compute pipeline '{}' created", desc.label);
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{BlendMode, VertexAttribute, VertexFormat};

    #[test]
    fn test_empty_vertex_layout_has_no_bindings() {
        let (bindings, attributes) = vertex_input(&VertexLayout::default());
        assert!(bindings.is_empty());
        assert!(attributes.is_empty());
    }

    #[test]
    fn test_vertex_input_uses_binding_zero() {
        let layout = VertexLayout {
            stride: 20,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float3,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float2,
                    offset: 12,
                },
            ],
        };
        let (bindings, attributes) = vertex_input(&layout);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride, 20);
        assert_eq!(attributes[1].format, vk::Format::R32G32_SFLOAT);
        assert!(attributes.iter().all(|a| a.binding == 0));
    }

    #[test]
    fn test_opaque_blend_is_disabled() {
        let state = blend_attachment(&BlendMode::Opaque.color_blend());
        assert_eq!(state.blend_enable, vk::FALSE);
        assert_eq!(state.color_write_mask, vk::ColorComponentFlags::RGBA);
    }
}
