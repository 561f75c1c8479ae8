//! Command streams and command translation.
//!
//! A stream bundles what one context records into: a command pool with a
//! single primary command buffer, the fence its submissions signal, and a
//! descriptor pool that is reset with the command buffer.

use ash::vk;
use ash::vk::Handle;

use super::convert;
use crate::backend::{Command, SubresourceRange};
use crate::error::RhiResult;
use crate::texture::Aspect;
use lumen_core::DescriptorPoolConfig;

const DESCRIPTOR_TYPES: [vk::DescriptorType; 5] = [
    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::SAMPLED_IMAGE,
    vk::DescriptorType::SAMPLER,
    vk::DescriptorType::STORAGE_IMAGE,
];

pub struct Stream {
    pub pool: vk::CommandPool,
    pub buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub descriptor_pool: vk::DescriptorPool,
}

impl Stream {
    /// Creates a stream whose fence starts signaled.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Vulkan objects cannot be created. The
    /// ones created before the failure are destroyed.
    pub fn new(
        device: &ash::Device,
        queue_family: u32,
        pool: &DescriptorPoolConfig,
    ) -> RhiResult<Self> {
        let mut stream = Self {
            pool: vk::CommandPool::null(),
            buffer: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
            descriptor_pool: vk::DescriptorPool::null(),
        };
        if let Err(err) = stream.create(device, queue_family, pool) {
            stream.destroy(device);
            return Err(err);
        }
        Ok(stream)
    }

    fn create(
        &mut self,
        device: &ash::Device,
        queue_family: u32,
        pool: &DescriptorPoolConfig,
    ) -> RhiResult<()> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(queue_family);
        self.pool = unsafe { device.create_command_pool(&pool_info, None)? };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        self.buffer = unsafe { device.allocate_command_buffers(&alloc_info)?[0] };

        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        self.fence = unsafe { device.create_fence(&fence_info, None)? };

        let sizes: Vec<vk::DescriptorPoolSize> = DESCRIPTOR_TYPES
            .iter()
            .map(|&ty| vk::DescriptorPoolSize {
                ty,
                descriptor_count: pool.per_type,
            })
            .collect();
        let descriptor_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(pool.max_sets)
            .pool_sizes(&sizes);
        self.descriptor_pool = unsafe { device.create_descriptor_pool(&descriptor_info, None)? };
        Ok(())
    }

    /// Resets the command pool and descriptor pool and begins recording.
    pub fn begin(&self, device: &ash::Device) -> RhiResult<()> {
        unsafe {
            device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
            device
                .reset_descriptor_pool(self.descriptor_pool, vk::DescriptorPoolResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(self.buffer, &begin_info)?;
        }
        Ok(())
    }

    pub fn wait(&self, device: &ash::Device) -> RhiResult<()> {
        unsafe { device.wait_for_fences(&[self.fence], true, u64::MAX)? };
        Ok(())
    }

    /// Destroys whatever was created. The stream must not be in flight.
    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            if self.descriptor_pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.descriptor_pool, None);
            }
            if self.fence != vk::Fence::null() {
                device.destroy_fence(self.fence, None);
            }
            if self.pool != vk::CommandPool::null() {
                device.destroy_command_pool(self.pool, None);
            }
        }
        self.descriptor_pool = vk::DescriptorPool::null();
        self.fence = vk::Fence::null();
        self.pool = vk::CommandPool::null();
        self.buffer = vk::CommandBuffer::null();
    }
}

fn subresource_range(range: &SubresourceRange) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: convert::aspect(range.aspect),
        base_mip_level: range.base_mip,
        level_count: range.mip_count,
        base_array_layer: range.base_layer,
        layer_count: range.layer_count,
    }
}

fn subresource_layers(aspect: Aspect, mip: u32, layer: u32, count: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: convert::aspect(aspect),
        mip_level: mip,
        base_array_layer: layer,
        layer_count: count,
    }
}

fn extent3d((width, height): (u32, u32)) -> vk::Extent3D {
    vk::Extent3D {
        width,
        height,
        depth: 1,
    }
}

fn far_corner((width, height): (u32, u32)) -> vk::Offset3D {
    vk::Offset3D {
        x: width as i32,
        y: height as i32,
        z: 1,
    }
}

/// Translates one command into `cmd`.
pub fn record(device: &ash::Device, cmd: vk::CommandBuffer, command: &Command) {
    unsafe {
        match command {
            Command::BeginRendering {
                colors,
                depth,
                extent,
            } => {
                let color_infos: Vec<vk::RenderingAttachmentInfo<'_>> = colors
                    .iter()
                    .map(|target| {
                        vk::RenderingAttachmentInfo::default()
                            .image_view(vk::ImageView::from_raw(target.view.0))
                            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                            .load_op(convert::load_op(target.load))
                            .store_op(vk::AttachmentStoreOp::STORE)
                            .clear_value(vk::ClearValue {
                                color: vk::ClearColorValue {
                                    float32: target.clear,
                                },
                            })
                    })
                    .collect();
                let depth_info = depth.map(|target| {
                    vk::RenderingAttachmentInfo::default()
                        .image_view(vk::ImageView::from_raw(target.view.0))
                        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                        .load_op(convert::load_op(target.load))
                        .store_op(vk::AttachmentStoreOp::STORE)
                        .clear_value(vk::ClearValue {
                            depth_stencil: vk::ClearDepthStencilValue {
                                depth: target.depth,
                                stencil: target.stencil,
                            },
                        })
                });
                let has_stencil = depth.is_some_and(|target| target.aspect == Aspect::DepthStencil);

                let mut info = vk::RenderingInfo::default()
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: vk::Extent2D {
                            width: extent.0,
                            height: extent.1,
                        },
                    })
                    .layer_count(1)
                    .color_attachments(&color_infos);
                if let Some(depth_info) = depth_info.as_ref() {
                    info = info.depth_attachment(depth_info);
                    if has_stencil {
                        info = info.stencil_attachment(depth_info);
                    }
                }
                device.cmd_begin_rendering(cmd, &info);
            }
            Command::EndRendering => device.cmd_end_rendering(cmd),
            Command::BindPipeline { point, pipeline } => device.cmd_bind_pipeline(
                cmd,
                convert::bind_point(*point),
                vk::Pipeline::from_raw(pipeline.0),
            ),
            Command::BindVertexBuffer { buffer, offset } => device.cmd_bind_vertex_buffers(
                cmd,
                0,
                &[vk::Buffer::from_raw(buffer.0)],
                &[*offset],
            ),
            Command::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => device.cmd_bind_index_buffer(
                cmd,
                vk::Buffer::from_raw(buffer.0),
                *offset,
                convert::index_type(*index_type),
            ),
            Command::BindDescriptorSet {
                point,
                layout,
                set,
                descriptor_set,
                dynamic_offsets,
            } => device.cmd_bind_descriptor_sets(
                cmd,
                convert::bind_point(*point),
                vk::PipelineLayout::from_raw(layout.0),
                *set,
                &[vk::DescriptorSet::from_raw(descriptor_set.0)],
                dynamic_offsets,
            ),
            Command::SetViewport(viewport) => device.cmd_set_viewport(
                cmd,
                0,
                &[vk::Viewport {
                    x: viewport.x,
                    y: viewport.y,
                    width: viewport.width,
                    height: viewport.height,
                    min_depth: viewport.min_depth,
                    max_depth: viewport.max_depth,
                }],
            ),
            Command::SetScissor {
                x,
                y,
                width,
                height,
            } => device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: *x, y: *y },
                    extent: vk::Extent2D {
                        width: *width,
                        height: *height,
                    },
                }],
            ),
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => device.cmd_draw(
                cmd,
                *vertex_count,
                *instance_count,
                *first_vertex,
                *first_instance,
            ),
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => device.cmd_draw_indexed(
                cmd,
                *index_count,
                *instance_count,
                *first_index,
                *vertex_offset,
                *first_instance,
            ),
            Command::Dispatch { x, y, z } => device.cmd_dispatch(cmd, *x, *y, *z),
            Command::ImageBarrier {
                texture,
                range,
                old,
                new,
            } => {
                let (old_layout, src_access, src_stage) = convert::layout(*old);
                let (new_layout, dst_access, dst_stage) = convert::layout(*new);
                let barrier = vk::ImageMemoryBarrier::default()
                    .old_layout(old_layout)
                    .new_layout(new_layout)
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(vk::Image::from_raw(texture.0))
                    .subresource_range(subresource_range(range));
                device.cmd_pipeline_barrier(
                    cmd,
                    src_stage,
                    dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
            Command::MemoryBarrier => {
                let barrier = vk::MemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                    .dst_access_mask(
                        vk::AccessFlags::SHADER_READ
                            | vk::AccessFlags::SHADER_WRITE
                            | vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                            | vk::AccessFlags::INDEX_READ
                            | vk::AccessFlags::TRANSFER_READ,
                    );
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
            }
            Command::ClearColor {
                texture,
                range,
                color,
            } => device.cmd_clear_color_image(
                cmd,
                vk::Image::from_raw(texture.0),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue { float32: *color },
                &[subresource_range(range)],
            ),
            Command::ClearDepth {
                texture,
                range,
                depth,
                stencil,
            } => device.cmd_clear_depth_stencil_image(
                cmd,
                vk::Image::from_raw(texture.0),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearDepthStencilValue {
                    depth: *depth,
                    stencil: *stencil,
                },
                &[subresource_range(range)],
            ),
            Command::CopyBufferToTexture {
                buffer,
                offset,
                texture,
                aspect,
                mip,
                base_layer,
                layer_count,
                extent,
            } => {
                let region = vk::BufferImageCopy {
                    buffer_offset: *offset,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: subresource_layers(*aspect, *mip, *base_layer, *layer_count),
                    image_offset: vk::Offset3D::default(),
                    image_extent: extent3d(*extent),
                };
                device.cmd_copy_buffer_to_image(
                    cmd,
                    vk::Buffer::from_raw(buffer.0),
                    vk::Image::from_raw(texture.0),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            Command::CopyTextureToBuffer {
                texture,
                aspect,
                mip,
                layer,
                extent,
                buffer,
                offset,
            } => {
                let region = vk::BufferImageCopy {
                    buffer_offset: *offset,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: subresource_layers(*aspect, *mip, *layer, 1),
                    image_offset: vk::Offset3D::default(),
                    image_extent: extent3d(*extent),
                };
                device.cmd_copy_image_to_buffer(
                    cmd,
                    vk::Image::from_raw(texture.0),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::Buffer::from_raw(buffer.0),
                    &[region],
                );
            }
            Command::CopyTexture {
                src,
                src_mip,
                src_layer,
                dst,
                dst_mip,
                dst_layer,
                aspect,
                extent,
            } => {
                let region = vk::ImageCopy {
                    src_subresource: subresource_layers(*aspect, *src_mip, *src_layer, 1),
                    src_offset: vk::Offset3D::default(),
                    dst_subresource: subresource_layers(*aspect, *dst_mip, *dst_layer, 1),
                    dst_offset: vk::Offset3D::default(),
                    extent: extent3d(*extent),
                };
                device.cmd_copy_image(
                    cmd,
                    vk::Image::from_raw(src.0),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::Image::from_raw(dst.0),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            Command::BlitTexture {
                src,
                src_mip,
                src_layer,
                src_extent,
                dst,
                dst_mip,
                dst_layer,
                dst_extent,
                aspect,
                filter,
            } => {
                let region = vk::ImageBlit {
                    src_subresource: subresource_layers(*aspect, *src_mip, *src_layer, 1),
                    src_offsets: [vk::Offset3D::default(), far_corner(*src_extent)],
                    dst_subresource: subresource_layers(*aspect, *dst_mip, *dst_layer, 1),
                    dst_offsets: [vk::Offset3D::default(), far_corner(*dst_extent)],
                };
                device.cmd_blit_image(
                    cmd,
                    vk::Image::from_raw(src.0),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::Image::from_raw(dst.0),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                    convert::filter(*filter),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subresource_range_translation() {
        let range = SubresourceRange {
            aspect: Aspect::DepthStencil,
            base_mip: 2,
            mip_count: 3,
            base_layer: 1,
            layer_count: 4,
        };
        let native = subresource_range(&range);
        assert_eq!(
            native.aspect_mask,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(native.base_mip_level, 2);
        assert_eq!(native.level_count, 3);
        assert_eq!(native.base_array_layer, 1);
        assert_eq!(native.layer_count, 4);
    }

    #[test]
    fn test_blit_corner_is_exclusive() {
        let corner = far_corner((64, 32));
        assert_eq!((corner.x, corner.y, corner.z), (64, 32, 1));
    }

    #[test]
    fn test_every_descriptor_kind_has_pool_space() {
        use crate::descriptor::DescriptorKind;
        for kind in [
            DescriptorKind::UniformBuffer,
            DescriptorKind::StorageBuffer,
            DescriptorKind::SampledTexture,
            DescriptorKind::Sampler,
            DescriptorKind::StorageImage,
        ] {
            assert!(DESCRIPTOR_TYPES.contains(&convert::descriptor_type(kind)));
        }
    }
}
