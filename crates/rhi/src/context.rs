//! Command recording, resource binding and descriptor-set caching.
//!
//! A [`Context`] is checked out of the [`Device`] for as long as it records.
//! Its lifecycle is `begin -> (record) -> end -> submit`; `begin` waits on
//! the fence of the context's previous submission before it resets the
//! command stream, the descriptor pool and the scratch ring.
//!
//! Resources are bound into per-set slot arrays and only turned into GPU
//! descriptor sets at the next draw or dispatch. A slot array that was
//! already realised during this recording reuses its descriptor set.
//!
//! Every operation that moves a texture out of its resting layout moves it
//! back before returning, so callers never record barriers themselves.

use std::collections::HashMap;

use tracing::trace;

use crate::backend::{
    ColorTarget, Command, DepthTarget, DescriptorResource, DescriptorWrite, RawDescriptorSet,
    RawPipeline, RawPipelineLayout, RawSetLayout, RawStream, SubresourceRange, Viewport,
};
use crate::buffer::{BufferKind, IndexType};
use crate::descriptor::{BindingSlot, DescriptorKind, MAX_BINDINGS, MAX_SETS};
use crate::device::Device;
use crate::error::RhiResult;
use crate::framebuffer::{ClearValues, LoadOp};
use crate::handle::{
    BufferHandle, ContextHandle, FramebufferHandle, PipelineHandle, SamplerHandle, ShaderHandle,
    TextureHandle,
};
use crate::pipeline::BindPoint;
use crate::sampler::Filter;
use crate::scratch::{ScratchRing, ScratchSlice};
use crate::texture::{Aspect, Format, ImageLayout, TextureSettings, TextureUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Idle,
    Recording,
    Ended,
    Submitted,
}

/// Counters for one recording, reset by `begin`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub descriptor_sets_allocated: u32,
    pub descriptor_cache_hits: u32,
    pub descriptor_writes: u32,
    pub draws: u32,
    pub dispatches: u32,
    pub barriers: u32,
}

#[derive(Debug, Clone, Copy)]
struct BoundPipeline {
    handle: PipelineHandle,
    raw: RawPipeline,
    layout: RawPipelineLayout,
    point: BindPoint,
    shader: ShaderHandle,
}

/// A descriptor entry with its name stripped.
#[derive(Debug, Clone, Copy)]
struct Target {
    set: usize,
    binding: usize,
    offset: u32,
    size: u32,
    kind: DescriptorKind,
}

type SetKey = (RawSetLayout, [BindingSlot; MAX_BINDINGS]);

/// Everything a context keeps between recordings. Lives in the device while
/// no [`Context`] has it checked out.
#[derive(Debug, Default)]
pub(crate) struct ContextState {
    pub stream: RawStream,
    pub ring: ScratchRing,
    phase: Phase,
    set_cache: HashMap<SetKey, RawDescriptorSet>,
    slots: [[BindingSlot; MAX_BINDINGS]; MAX_SETS],
    /// Dynamic offset of each uniform slot.
    offsets: [[u32; MAX_BINDINGS]; MAX_SETS],
    /// Scratch slices serving loose uniforms until the next draw.
    scratch: [[Option<ScratchSlice>; MAX_BINDINGS]; MAX_SETS],
    dirty: [bool; MAX_SETS],
    pipeline: Option<BoundPipeline>,
    pass: Option<FramebufferHandle>,
    stats: ContextStats,
}

impl ContextState {
    pub fn new(stream: RawStream, ring_size: u64, alignment: u64) -> Self {
        Self {
            stream,
            ring: ScratchRing::new(ring_size, alignment),
            ..Default::default()
        }
    }

    fn reset_bindings(&mut self) {
        self.slots = Default::default();
        self.offsets = Default::default();
        self.scratch = Default::default();
        self.dirty = [false; MAX_SETS];
        self.pipeline = None;
        self.pass = None;
    }
}

/// Full mip/layer range of a texture.
fn full_range(settings: &TextureSettings) -> SubresourceRange {
    SubresourceRange {
        aspect: settings.format.aspect(),
        base_mip: 0,
        mip_count: settings.levels,
        base_layer: 0,
        layer_count: settings.layers,
    }
}

/// Aspect used when copying between buffers and images; depth/stencil
/// formats copy their depth plane only.
fn copy_aspect(format: Format) -> Aspect {
    if format.is_depth() {
        Aspect::Depth
    } else {
        Aspect::Color
    }
}

/// A recording context borrowed from the [`Device`].
pub struct Context<'d> {
    device: &'d mut Device,
    handle: ContextHandle,
    state: ContextState,
}

impl<'d> Context<'d> {
    pub(crate) fn new(device: &'d mut Device, handle: ContextHandle, state: ContextState) -> Self {
        Self {
            device,
            handle,
            state,
        }
    }

    #[inline]
    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    /// Read access to the device, e.g. for texture sizes inside a pass.
    #[inline]
    pub fn device(&self) -> &Device {
        self.device
    }

    #[inline]
    pub fn stats(&self) -> ContextStats {
        self.state.stats
    }

    /// Ring buffers this context has created since it was made.
    #[inline]
    pub fn scratch_buffers_created(&self) -> u64 {
        self.state.ring.buffers_created()
    }

    #[inline]
    pub fn is_recording(&self) -> bool {
        self.state.phase == Phase::Recording
    }

    /// Whether `begin_render_pass` has not yet been matched by its end.
    #[inline]
    pub fn in_render_pass(&self) -> bool {
        self.state.pass.is_some()
    }

    fn assert_recording(&self, operation: &str) {
        assert_eq!(
            self.state.phase,
            Phase::Recording,
            "{} outside begin/end",
            operation
        );
    }

    fn assert_outside_pass(&self, operation: &str) {
        self.assert_recording(operation);
        assert!(
            self.state.pass.is_none(),
            "{} inside a render pass",
            operation
        );
    }

    fn record(&mut self, command: Command) {
        self.device.backend.record(self.state.stream, &command);
    }

    // Lifecycle

    /// Waits for this context's previous submission, then resets its
    /// command stream, descriptor pool, descriptor-set cache and scratch
    /// ring.
    ///
    /// # Errors
    ///
    /// Returns an error if the fence wait or the reset fails.
    pub fn begin(&mut self) -> RhiResult<()> {
        let stream = self.state.stream;
        self.device.backend.wait_stream(stream)?;
        self.device.backend.begin_stream(stream)?;

        self.state.set_cache.clear();
        self.state.ring.reset(&mut *self.device);
        self.state.reset_bindings();
        self.state.stats = ContextStats::default();
        self.state.phase = Phase::Recording;
        trace!("Context {:?} began recording", self.handle);
        Ok(())
    }

    pub fn end(&mut self) -> RhiResult<()> {
        self.assert_recording("end");
        assert!(self.state.pass.is_none(), "end inside a render pass");
        self.device.backend.end_stream(self.state.stream)?;
        self.state.phase = Phase::Ended;
        Ok(())
    }

    /// Queues the recorded commands. If a swapchain image was acquired for
    /// this frame, the submission waits for it and signals its present.
    pub fn submit(&mut self) -> RhiResult<()> {
        assert_eq!(
            self.state.phase,
            Phase::Ended,
            "submit of a context that was not ended"
        );
        self.device.submit_stream(self.state.stream, true)?;
        self.state.phase = Phase::Submitted;
        Ok(())
    }

    /// Submits without swapchain synchronization and blocks until the GPU is
    /// done.
    pub fn submit_and_wait(&mut self) -> RhiResult<()> {
        assert_eq!(
            self.state.phase,
            Phase::Ended,
            "submit of a context that was not ended"
        );
        self.device.submit_stream(self.state.stream, false)?;
        self.device.backend.wait_stream(self.state.stream)?;
        self.state.phase = Phase::Idle;
        Ok(())
    }

    // Layout transitions

    fn barrier(
        &mut self,
        texture: TextureHandle,
        range: SubresourceRange,
        old: ImageLayout,
        new: ImageLayout,
    ) {
        let raw = self.device.texture(texture).raw;
        self.record(Command::ImageBarrier {
            texture: raw,
            range,
            old,
            new,
        });
        self.state.stats.barriers += 1;
    }

    /// Marks a device-owned texture as holding its resting layout.
    fn settle(&mut self, texture: TextureHandle) {
        let record = self.device.texture_mut(texture);
        if !record.external {
            record.initialized = true;
        }
    }

    /// (settings, layout to leave, resting layout)
    fn layouts(&self, texture: TextureHandle) -> (TextureSettings, ImageLayout, ImageLayout) {
        let record = self.device.texture(texture);
        (
            record.settings,
            record.current_layout(),
            record.resting_layout(),
        )
    }

    /// First transition of a new texture, out of `Undefined`.
    pub(crate) fn initialize_texture(&mut self, texture: TextureHandle) {
        self.assert_outside_pass("initialize_texture");
        let (settings, _, resting) = self.layouts(texture);
        self.barrier(
            texture,
            full_range(&settings),
            ImageLayout::Undefined,
            resting,
        );
        self.settle(texture);
    }

    /// Moves a swapchain image into its present layout without writing it.
    pub fn prepare_present(&mut self, texture: TextureHandle) {
        self.assert_outside_pass("prepare_present");
        let (settings, old, resting) = self.layouts(texture);
        self.barrier(texture, full_range(&settings), old, resting);
        self.settle(texture);
    }

    // Render passes

    /// Starts dynamic rendering into a framebuffer. Attachments move from
    /// their resting layouts into attachment layouts; with `clear` they are
    /// cleared, otherwise their contents are loaded. Viewport and scissor are
    /// set to the full framebuffer.
    pub fn begin_render_pass(&mut self, framebuffer: FramebufferHandle, clear: Option<ClearValues>) {
        self.assert_outside_pass("begin_render_pass");

        let record = self.device.framebuffer(framebuffer);
        let extent = record.extent;
        let colors: Vec<_> = record
            .settings
            .color
            .iter()
            .copied()
            .zip(record.color_views.iter().copied())
            .collect();
        let depth = record.settings.depth.zip(record.depth_view);

        let load = if clear.is_some() {
            LoadOp::Clear
        } else {
            LoadOp::Load
        };
        let clear = clear.unwrap_or_default();

        let mut color_targets = Vec::with_capacity(colors.len());
        for (attachment, view) in colors {
            let (settings, old, _) = self.layouts(attachment.texture);
            let (mip, layer) = (attachment.mip(), attachment.base_layer());
            self.barrier(
                attachment.texture,
                SubresourceRange::single(settings.format.aspect(), mip, layer),
                old,
                ImageLayout::ColorAttachment,
            );
            color_targets.push(ColorTarget {
                texture: self.device.texture(attachment.texture).raw,
                view,
                mip,
                layer,
                load,
                clear: clear.color,
            });
        }

        let depth_target = match depth {
            Some((attachment, view)) => {
                let (settings, old, _) = self.layouts(attachment.texture);
                let (mip, layer) = (attachment.mip(), attachment.base_layer());
                self.barrier(
                    attachment.texture,
                    SubresourceRange::single(settings.format.aspect(), mip, layer),
                    old,
                    ImageLayout::DepthAttachment,
                );
                Some(DepthTarget {
                    texture: self.device.texture(attachment.texture).raw,
                    view,
                    aspect: settings.format.aspect(),
                    mip,
                    layer,
                    load,
                    depth: clear.depth,
                    stencil: clear.stencil,
                })
            }
            None => None,
        };

        self.record(Command::BeginRendering {
            colors: color_targets,
            depth: depth_target,
            extent,
        });
        self.record(Command::SetViewport(Viewport::extent(extent.0, extent.1)));
        self.record(Command::SetScissor {
            x: 0,
            y: 0,
            width: extent.0,
            height: extent.1,
        });
        self.state.pass = Some(framebuffer);
    }

    /// Ends the current render pass and returns every attachment to its
    /// resting layout.
    pub fn end_render_pass(&mut self) {
        self.assert_recording("end_render_pass");
        let framebuffer = self
            .state
            .pass
            .take()
            .unwrap_or_else(|| panic!("end_render_pass without begin_render_pass"));
        self.record(Command::EndRendering);

        let settings = self.device.framebuffer(framebuffer).settings.clone();
        let attachments = settings
            .color
            .iter()
            .map(|a| (a, ImageLayout::ColorAttachment))
            .chain(settings.depth.iter().map(|a| (a, ImageLayout::DepthAttachment)));
        for (attachment, layout) in attachments {
            let (texture_settings, _, resting) = self.layouts(attachment.texture);
            self.barrier(
                attachment.texture,
                SubresourceRange::single(
                    texture_settings.format.aspect(),
                    attachment.mip(),
                    attachment.base_layer(),
                ),
                layout,
                resting,
            );
            self.settle(attachment.texture);
        }
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.assert_recording("set_viewport");
        self.record(Command::SetViewport(viewport));
    }

    pub fn set_scissor(&mut self, x: i32, y: i32, width: u32, height: u32) {
        self.assert_recording("set_scissor");
        self.record(Command::SetScissor {
            x,
            y,
            width,
            height,
        });
    }

    // Binding

    fn bound(&self, operation: &str) -> BoundPipeline {
        self.state
            .pipeline
            .unwrap_or_else(|| panic!("{} without a bound pipeline", operation))
    }

    /// The pipeline bound last, if any.
    pub fn bound_pipeline(&self) -> Option<PipelineHandle> {
        self.state.pipeline.map(|p| p.handle)
    }

    /// Binds a pipeline. Every descriptor set is re-established at the next
    /// draw or dispatch.
    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.assert_recording("bind_pipeline");
        let record = self.device.pipeline(pipeline);
        let bound = BoundPipeline {
            handle: pipeline,
            raw: record.raw,
            layout: record.layout,
            point: record.bind_point,
            shader: record.shader,
        };
        self.record(Command::BindPipeline {
            point: bound.point,
            pipeline: bound.raw,
        });
        self.state.pipeline = Some(bound);
        self.state.dirty = [true; MAX_SETS];
    }

    /// Resolves a descriptor name against the bound pipeline's shader.
    fn resolve(&self, operation: &str, name: &str) -> Target {
        let bound = self.bound(operation);
        let program = self.device.shaders.get(bound.shader);
        let entry = program
            .table
            .find_name(name)
            .filter(|entry| entry.name == name)
            .unwrap_or_else(|| {
                panic!(
                    "{}: shader '{}' has no descriptor named '{}'",
                    operation, program.name, name
                )
            });
        Target {
            set: entry.set as usize,
            binding: entry.binding as usize,
            offset: entry.offset,
            size: entry.size,
            kind: entry.kind,
        }
    }

    fn block_size(&self, shader: ShaderHandle, set: usize, binding: usize) -> Option<u64> {
        self.device
            .shaders
            .get(shader)
            .block_size(set as u32, binding as u32)
            .map(u64::from)
    }

    fn set_slot(&mut self, set: usize, binding: usize, slot: BindingSlot) {
        assert!(
            set < MAX_SETS && binding < MAX_BINDINGS,
            "set {} binding {} is out of range",
            set,
            binding
        );
        self.state.scratch[set][binding] = None;
        self.state.offsets[set][binding] = 0;
        if self.state.slots[set][binding] != slot {
            self.state.slots[set][binding] = slot;
            self.state.dirty[set] = true;
        }
    }

    pub fn bind_vertex_buffer(&mut self, buffer: BufferHandle, offset: u64) {
        self.assert_recording("bind_vertex_buffer");
        let record = self.device.buffer(buffer);
        assert_eq!(
            record.kind,
            BufferKind::Vertex,
            "{} buffer bound as vertex buffer",
            record.kind
        );
        record.assert_range("bind_vertex_buffer", offset, 0);
        let raw = record.raw;
        self.record(Command::BindVertexBuffer {
            buffer: raw,
            offset,
        });
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, index_type: IndexType) {
        self.assert_recording("bind_index_buffer");
        let record = self.device.buffer(buffer);
        assert_eq!(
            record.kind,
            BufferKind::Index,
            "{} buffer bound as index buffer",
            record.kind
        );
        record.assert_range("bind_index_buffer", offset, 0);
        let raw = record.raw;
        self.record(Command::BindIndexBuffer {
            buffer: raw,
            offset,
            index_type,
        });
    }

    /// Binds a uniform or storage buffer to the named block.
    pub fn bind_buffer(&mut self, name: &str, buffer: BufferHandle) {
        let target = self.resolve("bind_buffer", name);
        self.bind_buffer_at(target.set, target.binding, buffer);
    }

    /// Binds a uniform or storage buffer to an explicit slot.
    pub fn bind_buffer_at(&mut self, set: usize, binding: usize, buffer: BufferHandle) {
        self.assert_recording("bind_buffer");
        let record = self.device.buffer(buffer);
        let (kind, size) = (record.kind, record.size);

        let slot = if kind.is_uniform() {
            let block = self
                .state
                .pipeline
                .and_then(|p| self.block_size(p.shader, set, binding))
                .unwrap_or(size);
            assert!(
                block <= size,
                "{} byte uniform block at set {} binding {} bound to a {} byte buffer",
                block,
                set,
                binding,
                size
            );
            BindingSlot::Uniform {
                buffer,
                range: block,
            }
        } else if kind == BufferKind::Storage {
            BindingSlot::Storage {
                buffer,
                offset: 0,
                range: size,
            }
        } else {
            panic!("{} buffer bound to set {} binding {}", kind, set, binding);
        };
        self.set_slot(set, binding, slot);
    }

    pub fn bind_texture(&mut self, name: &str, texture: TextureHandle) {
        let target = self.resolve("bind_texture", name);
        self.bind_texture_at(target.set, target.binding, texture);
    }

    pub fn bind_texture_at(&mut self, set: usize, binding: usize, texture: TextureHandle) {
        self.assert_recording("bind_texture");
        assert!(
            self.device.texture(texture).settings.usage != TextureUsage::Present,
            "swapchain images cannot be sampled"
        );
        self.set_slot(set, binding, BindingSlot::Texture { texture });
    }

    pub fn bind_sampler(&mut self, name: &str, sampler: SamplerHandle) {
        let target = self.resolve("bind_sampler", name);
        self.bind_sampler_at(target.set, target.binding, sampler);
    }

    pub fn bind_sampler_at(&mut self, set: usize, binding: usize, sampler: SamplerHandle) {
        self.assert_recording("bind_sampler");
        self.device.raw_sampler(sampler);
        self.set_slot(set, binding, BindingSlot::Sampler { sampler });
    }

    /// Binds one mip level of a storage texture as a storage image.
    pub fn bind_image(&mut self, name: &str, texture: TextureHandle, mip: u32) {
        let target = self.resolve("bind_image", name);
        self.bind_image_at(target.set, target.binding, texture, mip);
    }

    pub fn bind_image_at(&mut self, set: usize, binding: usize, texture: TextureHandle, mip: u32) {
        self.assert_recording("bind_image");
        let settings = self.device.texture(texture).settings;
        assert_eq!(
            settings.usage,
            TextureUsage::Storage,
            "only storage textures can be bound as images"
        );
        assert!(
            mip < settings.levels,
            "image binding of mip {} on a texture with {} levels",
            mip,
            settings.levels
        );
        self.set_slot(set, binding, BindingSlot::Image { texture, mip });
    }

    // Loose uniforms

    fn allocate_scratch(&mut self, size: u64) -> RhiResult<ScratchSlice> {
        let slice = self.state.ring.allocate(&mut *self.device, size)?;
        let raw = self.device.buffer(slice.buffer).raw;
        let start = slice.offset as usize;
        self.device.backend.mapped(raw)?[start..start + size as usize].fill(0);
        Ok(slice)
    }

    /// Writes `data` into the named uniform (a block or one of its
    /// members). The block is served from the scratch ring until the next
    /// draw or dispatch; members not written read as zero.
    ///
    /// # Errors
    ///
    /// Returns an error if a new ring buffer has to be allocated and that
    /// fails.
    pub fn uniform(&mut self, name: &str, data: &[u8]) -> RhiResult<()> {
        self.assert_recording("uniform");
        let target = self.resolve("uniform", name);
        assert_eq!(
            target.kind,
            DescriptorKind::UniformBuffer,
            "uniform: '{}' is a {:?}, not a uniform",
            name,
            target.kind
        );
        assert!(
            data.len() as u64 <= u64::from(target.size),
            "uniform: {} bytes written to '{}', which holds {}",
            data.len(),
            name,
            target.size
        );

        let (set, binding) = (target.set, target.binding);
        let slice = match self.state.scratch[set][binding] {
            Some(slice) => slice,
            None => {
                let shader = self.bound("uniform").shader;
                let block = self
                    .block_size(shader, set, binding)
                    .unwrap_or(u64::from(target.size));
                let slice = self.allocate_scratch(block)?;
                self.state.slots[set][binding] = BindingSlot::Uniform {
                    buffer: slice.buffer,
                    range: block,
                };
                self.state.offsets[set][binding] = slice.offset as u32;
                self.state.scratch[set][binding] = Some(slice);
                self.state.dirty[set] = true;
                slice
            }
        };

        let raw = self.device.buffer(slice.buffer).raw;
        let start = (slice.offset + u64::from(target.offset)) as usize;
        self.device.backend.mapped(raw)?[start..start + data.len()].copy_from_slice(data);
        self.device
            .backend
            .flush_buffer(raw, start as u64, data.len() as u64)
    }

    /// Typed [`uniform`](Self::uniform).
    pub fn uniform_value<T: bytemuck::Pod>(&mut self, name: &str, value: &T) -> RhiResult<()> {
        self.uniform(name, bytemuck::bytes_of(value))
    }

    // Descriptor sets

    fn descriptor_resource(&self, slot: BindingSlot) -> DescriptorResource {
        match slot {
            BindingSlot::Uniform { buffer, range } => DescriptorResource::Uniform {
                buffer: self.device.buffer(buffer).raw,
                range,
            },
            BindingSlot::Storage {
                buffer,
                offset,
                range,
            } => DescriptorResource::Storage {
                buffer: self.device.buffer(buffer).raw,
                offset,
                range,
            },
            BindingSlot::Texture { texture } => {
                let texture = self.device.texture(texture);
                DescriptorResource::SampledTexture {
                    view: texture.view,
                    layout: texture.resting_layout(),
                }
            }
            BindingSlot::Image { texture, mip } => DescriptorResource::StorageImage {
                view: self.device.texture(texture).mip_view(mip),
            },
            BindingSlot::Sampler { sampler } => DescriptorResource::Sampler {
                sampler: self.device.raw_sampler(sampler),
            },
            BindingSlot::Empty => panic!("an empty binding slot has no descriptor"),
        }
    }

    /// Turns every dirty set of the bound pipeline into a bound descriptor
    /// set, filling unbound samplers with the default sampler and unbound
    /// uniform blocks with zeroed scratch memory.
    fn establish_bindings(&mut self, bound: BoundPipeline) -> RhiResult<()> {
        let set_count = self.device.shaders.get(bound.shader).set_descs.len();

        for set in 0..set_count.min(MAX_SETS) {
            if !self.state.dirty[set] {
                continue;
            }

            let mut kinds = [None; MAX_BINDINGS];
            let layout = {
                let program = self.device.shaders.get(bound.shader);
                for binding in &program.set_descs[set].bindings {
                    kinds[binding.binding as usize] = Some(binding.kind);
                }
                program.set_layouts[set]
            };
            if kinds.iter().all(Option::is_none) {
                self.state.dirty[set] = false;
                continue;
            }

            let mut key = [BindingSlot::Empty; MAX_BINDINGS];
            for (binding, kind) in kinds
                .iter()
                .enumerate()
                .filter_map(|(binding, kind)| kind.map(|kind| (binding, kind)))
            {
                let mut slot = self.state.slots[set][binding];
                if slot.is_empty() {
                    slot = match kind {
                        DescriptorKind::Sampler => BindingSlot::Sampler {
                            sampler: self.device.default_sampler(),
                        },
                        DescriptorKind::UniformBuffer => {
                            let size = self.block_size(bound.shader, set, binding).unwrap_or(16);
                            let slice = self.allocate_scratch(size)?;
                            self.state.scratch[set][binding] = Some(slice);
                            self.state.offsets[set][binding] = slice.offset as u32;
                            BindingSlot::Uniform {
                                buffer: slice.buffer,
                                range: size,
                            }
                        }
                        other => panic!(
                            "{:?} at set {} binding {} of shader '{}' has nothing bound",
                            other,
                            set,
                            binding,
                            self.device.shaders.get(bound.shader).name
                        ),
                    };
                    self.state.slots[set][binding] = slot;
                }
                assert_eq!(
                    slot.kind(),
                    Some(kind),
                    "set {} binding {} of shader '{}' holds the wrong kind of resource",
                    set,
                    binding,
                    self.device.shaders.get(bound.shader).name
                );
                key[binding] = slot;
            }

            let descriptor_set = match self.state.set_cache.get(&(layout, key)) {
                Some(&cached) => {
                    self.state.stats.descriptor_cache_hits += 1;
                    cached
                }
                None => {
                    let allocated = self
                        .device
                        .backend
                        .allocate_descriptor_set(self.state.stream, layout)?;
                    let writes: Vec<DescriptorWrite> = key
                        .iter()
                        .enumerate()
                        .filter(|(_, slot)| !slot.is_empty())
                        .map(|(binding, slot)| DescriptorWrite {
                            binding: binding as u32,
                            resource: self.descriptor_resource(*slot),
                        })
                        .collect();
                    self.device.backend.write_descriptor_set(allocated, &writes);
                    self.state.stats.descriptor_sets_allocated += 1;
                    self.state.stats.descriptor_writes += writes.len() as u32;
                    self.state.set_cache.insert((layout, key), allocated);
                    allocated
                }
            };

            let dynamic_offsets = kinds
                .iter()
                .enumerate()
                .filter(|(_, kind)| **kind == Some(DescriptorKind::UniformBuffer))
                .map(|(binding, _)| self.state.offsets[set][binding])
                .collect();
            self.record(Command::BindDescriptorSet {
                point: bound.point,
                layout: bound.layout,
                set: set as u32,
                descriptor_set,
                dynamic_offsets,
            });
            self.state.dirty[set] = false;
        }
        Ok(())
    }

    /// Releases the scratch slices used by the last draw or dispatch.
    fn reset_scratch_bindings(&mut self) {
        for set in 0..MAX_SETS {
            for binding in 0..MAX_BINDINGS {
                if self.state.scratch[set][binding].take().is_some() {
                    self.state.slots[set][binding] = BindingSlot::Empty;
                    self.state.offsets[set][binding] = 0;
                    self.state.dirty[set] = true;
                }
            }
        }
    }

    // Work

    fn prepare_draw(&mut self, operation: &str) -> RhiResult<()> {
        self.assert_recording(operation);
        assert!(
            self.state.pass.is_some(),
            "{} outside a render pass",
            operation
        );
        let bound = self.bound(operation);
        assert_eq!(
            bound.point,
            BindPoint::Graphics,
            "{} with a compute pipeline bound",
            operation
        );
        self.establish_bindings(bound)
    }

    pub fn draw(&mut self, vertex_count: u32) -> RhiResult<()> {
        self.draw_instanced(vertex_count, 1)
    }

    pub fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32) -> RhiResult<()> {
        self.prepare_draw("draw")?;
        self.record(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex: 0,
            first_instance: 0,
        });
        self.state.stats.draws += 1;
        self.reset_scratch_bindings();
        Ok(())
    }

    pub fn draw_indexed(&mut self, index_count: u32) -> RhiResult<()> {
        self.prepare_draw("draw_indexed")?;
        self.record(Command::DrawIndexed {
            index_count,
            instance_count: 1,
            first_index: 0,
            vertex_offset: 0,
            first_instance: 0,
        });
        self.state.stats.draws += 1;
        self.reset_scratch_bindings();
        Ok(())
    }

    /// Dispatches the bound compute pipeline. If its shader writes storage
    /// resources, a memory barrier makes those writes visible to everything
    /// recorded afterwards.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        self.assert_outside_pass("dispatch");
        let bound = self.bound("dispatch");
        assert_eq!(
            bound.point,
            BindPoint::Compute,
            "dispatch with a graphics pipeline bound"
        );
        self.establish_bindings(bound)?;

        self.record(Command::Dispatch { x, y, z });
        self.state.stats.dispatches += 1;
        if self.device.shaders.get(bound.shader).writes_storage {
            self.record(Command::MemoryBarrier);
        }
        self.reset_scratch_bindings();
        Ok(())
    }

    // Transfers

    /// Fills every level and layer. Depth textures take `color[0]` as depth
    /// and `color[1]` as stencil.
    pub fn clear_texture(&mut self, texture: TextureHandle, color: [f32; 4]) {
        self.assert_outside_pass("clear_texture");
        let (settings, old, resting) = self.layouts(texture);
        let range = full_range(&settings);
        let raw = self.device.texture(texture).raw;

        self.barrier(texture, range, old, ImageLayout::TransferDst);
        if settings.format.is_depth() {
            self.record(Command::ClearDepth {
                texture: raw,
                range,
                depth: color[0],
                stencil: color[1] as u32,
            });
        } else {
            self.record(Command::ClearColor {
                texture: raw,
                range,
                color,
            });
        }
        self.barrier(texture, range, ImageLayout::TransferDst, resting);
        self.settle(texture);
    }

    /// Copies mip 0 of every layer between two textures of equal extent.
    pub fn copy_texture(&mut self, src: TextureHandle, dst: TextureHandle) {
        self.assert_outside_pass("copy_texture");
        assert_ne!(src, dst, "copy_texture onto itself");
        let (src_settings, src_old, src_resting) = self.layouts(src);
        let (dst_settings, dst_old, dst_resting) = self.layouts(dst);
        assert_eq!(
            src_settings.mip_extent(0),
            dst_settings.mip_extent(0),
            "copy_texture between textures of different extent"
        );
        assert_eq!(
            src_settings.format.bytes_per_pixel(),
            dst_settings.format.bytes_per_pixel(),
            "copy_texture between incompatible formats"
        );
        assert_eq!(
            src_settings.layers, dst_settings.layers,
            "copy_texture between textures with different layer counts"
        );

        let src_range = SubresourceRange {
            mip_count: 1,
            ..full_range(&src_settings)
        };
        let dst_range = SubresourceRange {
            mip_count: 1,
            ..full_range(&dst_settings)
        };
        let (src_raw, dst_raw) = (self.device.texture(src).raw, self.device.texture(dst).raw);

        self.barrier(src, src_range, src_old, ImageLayout::TransferSrc);
        self.barrier(dst, dst_range, dst_old, ImageLayout::TransferDst);
        for layer in 0..src_settings.layers {
            self.record(Command::CopyTexture {
                src: src_raw,
                src_mip: 0,
                src_layer: layer,
                dst: dst_raw,
                dst_mip: 0,
                dst_layer: layer,
                aspect: src_settings.format.aspect(),
                extent: src_settings.mip_extent(0),
            });
        }
        self.barrier(src, src_range, ImageLayout::TransferSrc, src_resting);
        self.barrier(dst, dst_range, ImageLayout::TransferDst, dst_resting);
        self.settle(src);
        self.settle(dst);
    }

    /// Scales mip 0, layer 0 of `src` onto mip 0, layer 0 of `dst`.
    pub fn blit_texture(&mut self, src: TextureHandle, dst: TextureHandle, filter: Filter) {
        self.assert_outside_pass("blit_texture");
        assert_ne!(src, dst, "blit_texture onto itself");
        let (src_settings, src_old, src_resting) = self.layouts(src);
        let (dst_settings, dst_old, dst_resting) = self.layouts(dst);
        assert_eq!(
            src_settings.format.is_depth(),
            dst_settings.format.is_depth(),
            "blit between depth and color textures"
        );
        assert!(
            !src_settings.format.is_depth() || filter == Filter::Nearest,
            "depth blits must use nearest filtering"
        );

        let src_range = SubresourceRange::single(src_settings.format.aspect(), 0, 0);
        let dst_range = SubresourceRange::single(dst_settings.format.aspect(), 0, 0);
        let (src_raw, dst_raw) = (self.device.texture(src).raw, self.device.texture(dst).raw);

        self.barrier(src, src_range, src_old, ImageLayout::TransferSrc);
        self.barrier(dst, dst_range, dst_old, ImageLayout::TransferDst);
        self.record(Command::BlitTexture {
            src: src_raw,
            src_mip: 0,
            src_layer: 0,
            src_extent: src_settings.mip_extent(0),
            dst: dst_raw,
            dst_mip: 0,
            dst_layer: 0,
            dst_extent: dst_settings.mip_extent(0),
            aspect: src_settings.format.aspect(),
            filter,
        });
        self.barrier(src, src_range, ImageLayout::TransferSrc, src_resting);
        self.barrier(dst, dst_range, ImageLayout::TransferDst, dst_resting);
        self.settle(src);
        self.settle(dst);
    }

    /// Fills levels 1.. of every layer by successive linear blits from
    /// level 0.
    pub fn generate_mips(&mut self, texture: TextureHandle) {
        self.assert_outside_pass("generate_mips");
        let (settings, old, resting) = self.layouts(texture);
        assert!(
            settings.levels > 1,
            "generate_mips on a texture with a single level"
        );
        assert!(
            !settings.format.is_depth(),
            "generate_mips on a depth texture"
        );

        let raw = self.device.texture(texture).raw;
        let level = |mip: u32, count: u32| SubresourceRange {
            base_mip: mip,
            mip_count: count,
            ..full_range(&settings)
        };

        self.barrier(texture, level(0, 1), old, ImageLayout::TransferSrc);
        self.barrier(
            texture,
            level(1, settings.levels - 1),
            old,
            ImageLayout::TransferDst,
        );
        for mip in 1..settings.levels {
            for layer in 0..settings.layers {
                self.record(Command::BlitTexture {
                    src: raw,
                    src_mip: mip - 1,
                    src_layer: layer,
                    src_extent: settings.mip_extent(mip - 1),
                    dst: raw,
                    dst_mip: mip,
                    dst_layer: layer,
                    dst_extent: settings.mip_extent(mip),
                    aspect: Aspect::Color,
                    filter: Filter::Linear,
                });
            }
            self.barrier(
                texture,
                level(mip, 1),
                ImageLayout::TransferDst,
                ImageLayout::TransferSrc,
            );
        }
        self.barrier(
            texture,
            full_range(&settings),
            ImageLayout::TransferSrc,
            resting,
        );
        self.settle(texture);
    }

    /// Copies tightly packed texels for every layer of `mip` from a buffer.
    pub fn copy_buffer_to_texture(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        texture: TextureHandle,
        mip: u32,
    ) {
        self.assert_outside_pass("copy_buffer_to_texture");
        let (settings, old, resting) = self.layouts(texture);
        assert!(
            mip < settings.levels,
            "copy to mip {} of a texture with {} levels",
            mip,
            settings.levels
        );
        let record = self.device.buffer(buffer);
        record.assert_range(
            "copy_buffer_to_texture",
            offset,
            settings.level_size(mip) * settings.layers as u64,
        );
        let buffer_raw = record.raw;
        let texture_raw = self.device.texture(texture).raw;

        let range = SubresourceRange {
            base_mip: mip,
            mip_count: 1,
            ..full_range(&settings)
        };
        self.barrier(texture, range, old, ImageLayout::TransferDst);
        self.record(Command::CopyBufferToTexture {
            buffer: buffer_raw,
            offset,
            texture: texture_raw,
            aspect: copy_aspect(settings.format),
            mip,
            base_layer: 0,
            layer_count: settings.layers,
            extent: settings.mip_extent(mip),
        });
        self.barrier(texture, range, ImageLayout::TransferDst, resting);
        self.settle(texture);
    }

    /// Copies one layer of one mip level into a buffer, tightly packed.
    pub fn copy_texture_to_buffer(
        &mut self,
        texture: TextureHandle,
        mip: u32,
        layer: u32,
        buffer: BufferHandle,
        offset: u64,
    ) {
        self.assert_outside_pass("copy_texture_to_buffer");
        let (settings, old, resting) = self.layouts(texture);
        assert!(
            mip < settings.levels && layer < settings.layers,
            "copy from mip {} layer {} of a texture with {} levels and {} layers",
            mip,
            layer,
            settings.levels,
            settings.layers
        );
        let record = self.device.buffer(buffer);
        record.assert_range("copy_texture_to_buffer", offset, settings.level_size(mip));
        let buffer_raw = record.raw;
        let texture_raw = self.device.texture(texture).raw;

        let range = SubresourceRange::single(settings.format.aspect(), mip, layer);
        self.barrier(texture, range, old, ImageLayout::TransferSrc);
        self.record(Command::CopyTextureToBuffer {
            texture: texture_raw,
            aspect: copy_aspect(settings.format),
            mip,
            layer,
            extent: settings.mip_extent(mip),
            buffer: buffer_raw,
            offset,
        });
        self.barrier(texture, range, ImageLayout::TransferSrc, resting);
        self.settle(texture);
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        let state = std::mem::take(&mut self.state);
        self.device.return_context(self.handle, state);
    }
}
