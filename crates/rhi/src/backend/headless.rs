//! CPU backend for tests and GPU-less tools.
//!
//! Buffers and images live in host memory. Submissions execute their
//! transfer commands (clears, copies, blits, render-pass load-op clears) on
//! the CPU immediately; draws and dispatches are counted but not
//! rasterized. Every layout the commands expect is checked against the
//! layout the image is actually in, and every fence wait, reset, submit,
//! acquire and present is appended to an event log. A [`HeadlessProbe`]
//! cloned from the backend reads all of this after the backend has been
//! moved into a device.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use half::f16;
use tracing::{debug, trace};

use super::{
    Acquire, Command, ComputePipelineDesc, DescriptorResource, DescriptorWrite, DeviceLimits,
    GpuBackend, GraphicsPipelineDesc, RawBuffer, RawDescriptorSet, RawPipeline,
    RawPipelineLayout, RawSampler, RawSetLayout, RawShaderModule, RawStream, RawTexture,
    RawView, SubmitSync, SwapchainDesc,
};
use crate::buffer::{BufferKind, fits};
use crate::descriptor::{DescriptorKind, SetLayoutDesc};
use crate::error::{RhiError, RhiResult};
use crate::framebuffer::LoadOp;
use crate::pipeline::BindPoint;
use crate::sampler::{Filter, SamplerSettings};
use crate::shader::ShaderStage;
use crate::texture::{Format, ImageLayout, TextureSettings, TextureShape, TextureUsage, ViewDesc};
use lumen_core::DescriptorPoolConfig;

/// Something the backend did that tests may want to order or count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadlessEvent {
    /// Recording began; the stream's command buffer and pool were reset.
    Reset { stream: RawStream },
    /// The CPU waited for the stream's fence. `serial` is the number of the
    /// last submission the wait covered, zero if none.
    FenceWait { stream: RawStream, serial: u64 },
    Submit {
        stream: RawStream,
        serial: u64,
        sync: SubmitSync,
    },
    Acquire { slot: u32, image: u32 },
    AcquireStale { slot: u32 },
    Present { slot: u32, image: u32 },
    PresentStale { slot: u32, image: u32 },
    WaitIdle,
    SwapchainRebuilt { width: u32, height: u32 },
}

/// Object counts and per-operation totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub live_buffers: usize,
    pub live_textures: usize,
    pub live_views: usize,
    pub live_samplers: usize,
    pub live_shader_modules: usize,
    pub live_set_layouts: usize,
    pub live_pipeline_layouts: usize,
    pub live_pipelines: usize,
    pub shader_modules_created: u64,
    pub descriptor_sets_allocated: u64,
    pub descriptor_writes: u64,
    pub draws: u64,
    pub dispatches: u64,
    pub submits: u64,
    pub presents: u64,
}

/// A command found an image subresource in a layout it did not expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutMismatch {
    pub command: &'static str,
    pub texture: RawTexture,
    pub mip: u32,
    pub layer: u32,
    pub expected: ImageLayout,
    pub actual: ImageLayout,
}

/// Pixels of the most recently presented swapchain image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedImage {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub pixels: Vec<u8>,
}

impl PresentedImage {
    /// Raw bytes of the texel at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel() as usize;
        let start = (y as usize * self.width as usize + x as usize) * bpp;
        self.pixels.get(start..start + bpp)
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    events: Vec<HeadlessEvent>,
    stats: HeadlessStats,
    mismatches: Vec<LayoutMismatch>,
    presented: Option<PresentedImage>,
    stale: bool,
    surface: Option<(u32, u32)>,
}

/// Shared view into a [`HeadlessBackend`].
#[derive(Debug, Clone, Default)]
pub struct HeadlessProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl HeadlessProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<HeadlessEvent> {
        self.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    pub fn stats(&self) -> HeadlessStats {
        self.lock().stats.clone()
    }

    pub fn layout_mismatches(&self) -> Vec<LayoutMismatch> {
        self.lock().mismatches.clone()
    }

    pub fn presented(&self) -> Option<PresentedImage> {
        self.lock().presented.clone()
    }

    /// RGBA8 texel of the last presented image.
    pub fn presented_pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let state = self.lock();
        let image = state.presented.as_ref()?;
        let texel = image.pixel(x, y)?;
        Some([texel[0], texel[1], texel[2], texel[3]])
    }

    /// Simulates a window resize: acquire and present report a stale
    /// swapchain until it is rebuilt, and the rebuild uses this extent.
    pub fn resize_surface(&self, width: u32, height: u32) {
        let mut state = self.lock();
        state.stale = true;
        state.surface = Some((width, height));
    }

    /// Marks the swapchain stale without changing the surface extent.
    pub fn mark_stale(&self) {
        self.lock().stale = true;
    }
}

#[derive(Debug)]
struct CpuImage {
    settings: TextureSettings,
    /// One entry per `(mip, layer)`, mip-major.
    layouts: Vec<ImageLayout>,
    data: Vec<Vec<u8>>,
}

impl CpuImage {
    fn new(settings: TextureSettings) -> Self {
        let count = (settings.levels * settings.layers) as usize;
        let data = (0..settings.levels)
            .flat_map(|mip| {
                let size = settings.level_size(mip) as usize;
                (0..settings.layers).map(move |_| vec![0u8; size])
            })
            .collect();
        Self {
            settings,
            layouts: vec![ImageLayout::Undefined; count],
            data,
        }
    }

    #[inline]
    fn index(&self, mip: u32, layer: u32) -> usize {
        assert!(
            mip < self.settings.levels && layer < self.settings.layers,
            "subresource mip {} layer {} outside image with {} levels and {} layers",
            mip,
            layer,
            self.settings.levels,
            self.settings.layers
        );
        (mip * self.settings.layers + layer) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Initial,
    Recording,
    Executable,
    Pending,
}

#[derive(Debug)]
struct Stream {
    pool: DescriptorPoolConfig,
    sets: Vec<RawDescriptorSet>,
    commands: Vec<Command>,
    state: StreamState,
    submitted: u64,
    waited: u64,
}

#[derive(Debug)]
struct Swapchain {
    format: Format,
    extent: (u32, u32),
    images: Vec<RawTexture>,
    next: u32,
}

/// CPU implementation of [`GpuBackend`].
#[derive(Debug)]
pub struct HeadlessBackend {
    next_id: u64,
    limits: DeviceLimits,
    buffers: HashMap<RawBuffer, Vec<u8>>,
    textures: HashMap<RawTexture, CpuImage>,
    views: HashMap<RawView, (RawTexture, ViewDesc)>,
    samplers: HashMap<RawSampler, SamplerSettings>,
    modules: HashMap<RawShaderModule, ShaderStage>,
    set_layouts: HashMap<RawSetLayout, SetLayoutDesc>,
    pipeline_layouts: HashMap<RawPipelineLayout, Vec<RawSetLayout>>,
    pipelines: HashMap<RawPipeline, RawPipelineLayout>,
    streams: HashMap<RawStream, Stream>,
    descriptor_sets: HashMap<RawDescriptorSet, (RawStream, RawSetLayout)>,
    /// Image descriptors written into each set, with the layout each write named.
    set_images: HashMap<RawDescriptorSet, Vec<(RawView, ImageLayout)>>,
    /// Sets bound while the current submission executes.
    bound_sets: HashMap<(BindPoint, u32), RawDescriptorSet>,
    swapchain: Option<Swapchain>,
    image_count: u32,
    probe: HeadlessProbe,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    /// A backend without a swapchain.
    pub fn new() -> Self {
        Self {
            next_id: 0,
            limits: DeviceLimits::default(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            views: HashMap::new(),
            samplers: HashMap::new(),
            modules: HashMap::new(),
            set_layouts: HashMap::new(),
            pipeline_layouts: HashMap::new(),
            pipelines: HashMap::new(),
            streams: HashMap::new(),
            descriptor_sets: HashMap::new(),
            set_images: HashMap::new(),
            bound_sets: HashMap::new(),
            swapchain: None,
            image_count: 0,
            probe: HeadlessProbe::default(),
        }
    }

    /// Adds a simulated RGBA8 swapchain.
    pub fn with_swapchain(mut self, width: u32, height: u32, image_count: u32) -> Self {
        assert!(image_count >= 1, "a swapchain needs at least one image");
        self.image_count = image_count;
        self.build_swapchain(width, height);
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// A probe sharing this backend's log and statistics.
    pub fn probe(&self) -> HeadlessProbe {
        self.probe.clone()
    }

    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn build_swapchain(&mut self, width: u32, height: u32) {
        let settings = TextureSettings {
            width,
            height,
            levels: 1,
            layers: 1,
            samples: 1,
            format: Format::Rgba8Unorm,
            shape: TextureShape::D2,
            usage: TextureUsage::Present,
            generate_mips: false,
        };
        let images = (0..self.image_count)
            .map(|_| {
                let id = RawTexture(self.next());
                self.textures.insert(id, CpuImage::new(settings));
                id
            })
            .collect();
        self.swapchain = Some(Swapchain {
            format: settings.format,
            extent: (width, height),
            images,
            next: 0,
        });
    }

    fn stats(&self) -> MutexGuard<'_, ProbeState> {
        self.probe.lock()
    }

    fn refresh_counts(&self) {
        let mut state = self.probe.lock();
        let swapchain_images = self.swapchain.as_ref().map_or(0, |s| s.images.len());
        let owned_textures = self.textures.len().saturating_sub(swapchain_images);
        state.stats.live_buffers = self.buffers.len();
        state.stats.live_textures = owned_textures;
        state.stats.live_views = self.views.len();
        state.stats.live_samplers = self.samplers.len();
        state.stats.live_shader_modules = self.modules.len();
        state.stats.live_set_layouts = self.set_layouts.len();
        state.stats.live_pipeline_layouts = self.pipeline_layouts.len();
        state.stats.live_pipelines = self.pipelines.len();
    }

    fn push_event(&self, event: HeadlessEvent) {
        trace!("headless event {:?}", event);
        self.probe.lock().events.push(event);
    }

    fn stream_mut(&mut self, stream: RawStream) -> &mut Stream {
        self.streams
            .get_mut(&stream)
            .unwrap_or_else(|| panic!("unknown stream {:?}", stream))
    }

    fn image_mut(&mut self, texture: RawTexture) -> &mut CpuImage {
        self.textures
            .get_mut(&texture)
            .unwrap_or_else(|| panic!("unknown texture {:?}", texture))
    }

    /// Checks the layout of one subresource against the layouts a command
    /// accepts, logging a mismatch against the first.
    fn expect_layout(
        &mut self,
        command: &'static str,
        texture: RawTexture,
        mip: u32,
        layer: u32,
        accepted: &[ImageLayout],
    ) {
        let image = self.image_mut(texture);
        let actual = image.layouts[image.index(mip, layer)];
        if !accepted.contains(&actual) {
            self.probe.lock().mismatches.push(LayoutMismatch {
                command,
                texture,
                mip,
                layer,
                expected: accepted[0],
                actual,
            });
        }
    }

    /// Checks every image reachable through the sets bound at `point`
    /// against the layout its descriptor was written with.
    fn expect_descriptor_layouts(&mut self, command: &'static str, point: BindPoint) {
        let images: Vec<(RawView, ImageLayout)> = self
            .bound_sets
            .iter()
            .filter(|((bound_point, _), _)| *bound_point == point)
            .filter_map(|(_, set)| self.set_images.get(set))
            .flatten()
            .copied()
            .collect();
        for (view, layout) in images {
            let Some(&(texture, desc)) = self.views.get(&view) else {
                panic!("descriptor names destroyed view {:?}", view);
            };
            for mip in desc.base_mip..desc.base_mip + desc.mip_count {
                for layer in desc.base_layer..desc.base_layer + desc.layer_count {
                    self.expect_layout(command, texture, mip, layer, &[layout]);
                }
            }
        }
    }

    fn execute(&mut self, command: &Command) {
        match command {
            Command::BeginRendering { colors, depth, .. } => {
                for color in colors {
                    self.expect_layout(
                        "BeginRendering",
                        color.texture,
                        color.mip,
                        color.layer,
                        &[ImageLayout::ColorAttachment, ImageLayout::General],
                    );
                    if color.load == LoadOp::Clear {
                        self.fill(color.texture, color.mip, color.layer, color.clear);
                    }
                }
                if let Some(depth) = depth {
                    self.expect_layout(
                        "BeginRendering",
                        depth.texture,
                        depth.mip,
                        depth.layer,
                        &[ImageLayout::DepthAttachment],
                    );
                    if depth.load == LoadOp::Clear {
                        let texel = [depth.depth, depth.stencil as f32, 0.0, 1.0];
                        self.fill(depth.texture, depth.mip, depth.layer, texel);
                    }
                }
            }
            Command::Draw { .. } | Command::DrawIndexed { .. } => {
                self.expect_descriptor_layouts(command.name(), BindPoint::Graphics);
                self.stats().stats.draws += 1;
            }
            Command::Dispatch { .. } => {
                self.expect_descriptor_layouts("Dispatch", BindPoint::Compute);
                self.stats().stats.dispatches += 1;
            }
            Command::ImageBarrier {
                texture,
                range,
                old,
                new,
            } => {
                for mip in range.base_mip..range.base_mip + range.mip_count {
                    for layer in range.base_layer..range.base_layer + range.layer_count {
                        if *old != ImageLayout::Undefined {
                            self.expect_layout("ImageBarrier", *texture, mip, layer, &[*old]);
                        }
                        let image = self.image_mut(*texture);
                        let index = image.index(mip, layer);
                        image.layouts[index] = *new;
                    }
                }
            }
            Command::ClearColor {
                texture,
                range,
                color,
            } => {
                self.clear_range("ClearColor", *texture, range, *color);
            }
            Command::ClearDepth {
                texture,
                range,
                depth,
                stencil,
            } => {
                self.clear_range(
                    "ClearDepth",
                    *texture,
                    range,
                    [*depth, *stencil as f32, 0.0, 1.0],
                );
            }
            Command::CopyBufferToTexture {
                buffer,
                offset,
                texture,
                mip,
                base_layer,
                layer_count,
                ..
            } => {
                for layer in *base_layer..base_layer + layer_count {
                    self.expect_layout(
                        "CopyBufferToTexture",
                        *texture,
                        *mip,
                        layer,
                        &[ImageLayout::TransferDst, ImageLayout::General],
                    );
                }
                let level_size = self.image_mut(*texture).settings.level_size(*mip) as usize;
                let source = self.buffers.get(buffer).cloned().unwrap_or_default();
                let image = self.image_mut(*texture);
                for (i, layer) in (*base_layer..base_layer + layer_count).enumerate() {
                    let start = *offset as usize + i * level_size;
                    if let Some(bytes) = source.get(start..start + level_size) {
                        let index = image.index(*mip, layer);
                        image.data[index].copy_from_slice(bytes);
                    }
                }
            }
            Command::CopyTextureToBuffer {
                texture,
                mip,
                layer,
                buffer,
                offset,
                ..
            } => {
                self.expect_layout(
                    "CopyTextureToBuffer",
                    *texture,
                    *mip,
                    *layer,
                    &[ImageLayout::TransferSrc, ImageLayout::General],
                );
                let image = self.image_mut(*texture);
                let bytes = image.data[image.index(*mip, *layer)].clone();
                if let Some(target) = self.buffers.get_mut(buffer) {
                    let start = *offset as usize;
                    if let Some(window) = target.get_mut(start..start + bytes.len()) {
                        window.copy_from_slice(&bytes);
                    }
                }
            }
            Command::CopyTexture {
                src,
                src_mip,
                src_layer,
                dst,
                dst_mip,
                dst_layer,
                extent,
                ..
            } => {
                self.expect_layout(
                    "CopyTexture",
                    *src,
                    *src_mip,
                    *src_layer,
                    &[ImageLayout::TransferSrc, ImageLayout::General],
                );
                self.expect_layout(
                    "CopyTexture",
                    *dst,
                    *dst_mip,
                    *dst_layer,
                    &[ImageLayout::TransferDst, ImageLayout::General],
                );
                self.copy_region(
                    (*src, *src_mip, *src_layer),
                    (*dst, *dst_mip, *dst_layer),
                    *extent,
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
                filter,
                ..
            } => {
                self.expect_layout(
                    "BlitTexture",
                    *src,
                    *src_mip,
                    *src_layer,
                    &[ImageLayout::TransferSrc, ImageLayout::General],
                );
                self.expect_layout(
                    "BlitTexture",
                    *dst,
                    *dst_mip,
                    *dst_layer,
                    &[ImageLayout::TransferDst, ImageLayout::General],
                );
                self.blit(
                    (*src, *src_mip, *src_layer, *src_extent),
                    (*dst, *dst_mip, *dst_layer, *dst_extent),
                    *filter,
                );
            }
            Command::BindPipeline { point, .. } => {
                self.bound_sets.retain(|(bound_point, _), _| bound_point != point);
            }
            Command::BindDescriptorSet {
                point,
                set,
                descriptor_set,
                ..
            } => {
                assert!(
                    self.descriptor_sets.contains_key(descriptor_set),
                    "bound descriptor set {:?} was freed by a pool reset",
                    descriptor_set
                );
                self.bound_sets.insert((*point, *set), *descriptor_set);
            }
            Command::EndRendering
            | Command::BindVertexBuffer { .. }
            | Command::BindIndexBuffer { .. }
            | Command::SetViewport(_)
            | Command::SetScissor { .. }
            | Command::MemoryBarrier => {}
        }
    }

    fn fill(&mut self, texture: RawTexture, mip: u32, layer: u32, texel: [f32; 4]) {
        let image = self.image_mut(texture);
        let format = image.settings.format;
        let mut encoded = vec![0u8; format.bytes_per_pixel() as usize];
        encode_texel(format, texel, &mut encoded);
        let index = image.index(mip, layer);
        for chunk in image.data[index].chunks_exact_mut(encoded.len()) {
            chunk.copy_from_slice(&encoded);
        }
    }

    fn clear_range(
        &mut self,
        command: &'static str,
        texture: RawTexture,
        range: &super::SubresourceRange,
        texel: [f32; 4],
    ) {
        for mip in range.base_mip..range.base_mip + range.mip_count {
            for layer in range.base_layer..range.base_layer + range.layer_count {
                self.expect_layout(
                    command,
                    texture,
                    mip,
                    layer,
                    &[ImageLayout::TransferDst, ImageLayout::General],
                );
                self.fill(texture, mip, layer, texel);
            }
        }
    }

    fn copy_region(
        &mut self,
        (src, src_mip, src_layer): (RawTexture, u32, u32),
        (dst, dst_mip, dst_layer): (RawTexture, u32, u32),
        (width, height): (u32, u32),
    ) {
        let source = self.image_mut(src);
        let src_width = source.settings.mip_extent(src_mip).0 as usize;
        let bpp = source.settings.format.bytes_per_pixel() as usize;
        let bytes = source.data[source.index(src_mip, src_layer)].clone();

        let target = self.image_mut(dst);
        let dst_width = target.settings.mip_extent(dst_mip).0 as usize;
        let index = target.index(dst_mip, dst_layer);
        for y in 0..height as usize {
            let from = y * src_width * bpp;
            let to = y * dst_width * bpp;
            let row = width as usize * bpp;
            target.data[index][to..to + row].copy_from_slice(&bytes[from..from + row]);
        }
    }

    fn blit(
        &mut self,
        (src, src_mip, src_layer, (sw, sh)): (RawTexture, u32, u32, (u32, u32)),
        (dst, dst_mip, dst_layer, (dw, dh)): (RawTexture, u32, u32, (u32, u32)),
        filter: Filter,
    ) {
        let source = self.image_mut(src);
        let src_format = source.settings.format;
        let src_width = source.settings.mip_extent(src_mip).0;
        let src_bytes = source.data[source.index(src_mip, src_layer)].clone();
        let src_bpp = src_format.bytes_per_pixel() as usize;

        let read = |x: u32, y: u32| {
            let start = (y as usize * src_width as usize + x as usize) * src_bpp;
            decode_texel(src_format, &src_bytes[start..start + src_bpp])
        };

        let target = self.image_mut(dst);
        let dst_format = target.settings.format;
        let dst_width = target.settings.mip_extent(dst_mip).0;
        let dst_bpp = dst_format.bytes_per_pixel() as usize;
        let index = target.index(dst_mip, dst_layer);

        for y in 0..dh {
            for x in 0..dw {
                let texel = match filter {
                    Filter::Nearest => {
                        let sx = (((x as f32 + 0.5) * sw as f32 / dw as f32) as u32).min(sw - 1);
                        let sy = (((y as f32 + 0.5) * sh as f32 / dh as f32) as u32).min(sh - 1);
                        read(sx, sy)
                    }
                    Filter::Linear => {
                        // Box filter over the covered source texels.
                        let x0 = (x * sw / dw).min(sw - 1);
                        let x1 = ((x + 1) * sw).div_ceil(dw).clamp(x0 + 1, sw);
                        let y0 = (y * sh / dh).min(sh - 1);
                        let y1 = ((y + 1) * sh).div_ceil(dh).clamp(y0 + 1, sh);
                        let mut sum = [0.0f32; 4];
                        for sy in y0..y1 {
                            for sx in x0..x1 {
                                let texel = read(sx, sy);
                                for (acc, value) in sum.iter_mut().zip(texel) {
                                    *acc += value;
                                }
                            }
                        }
                        let count = ((x1 - x0) * (y1 - y0)) as f32;
                        sum.map(|value| value / count)
                    }
                };
                let start = (y as usize * dst_width as usize + x as usize) * dst_bpp;
                encode_texel(
                    dst_format,
                    texel,
                    &mut target.data[index][start..start + dst_bpp],
                );
            }
        }
    }
}

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> RhiResult<RawBuffer> {
        let id = RawBuffer(self.next());
        self.buffers.insert(id, vec![0u8; size as usize]);
        trace!("headless: created {} buffer {:?} ({} bytes)", kind, id, size);
        self.refresh_counts();
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: RawBuffer) {
        self.buffers.remove(&buffer);
        self.refresh_counts();
    }

    fn mapped(&mut self, buffer: RawBuffer) -> RhiResult<&mut [u8]> {
        Ok(self
            .buffers
            .get_mut(&buffer)
            .unwrap_or_else(|| panic!("unknown buffer {:?}", buffer))
            .as_mut_slice())
    }

    fn flush_buffer(&mut self, buffer: RawBuffer, offset: u64, size: u64) -> RhiResult<()> {
        let len = self.mapped(buffer)?.len() as u64;
        assert!(fits(len, offset, size), "flush outside buffer {:?}", buffer);
        Ok(())
    }

    fn invalidate_buffer(&mut self, buffer: RawBuffer, offset: u64, size: u64) -> RhiResult<()> {
        let len = self.mapped(buffer)?.len() as u64;
        assert!(fits(len, offset, size), "invalidate outside buffer {:?}", buffer);
        Ok(())
    }

    fn create_texture(&mut self, settings: &TextureSettings) -> RhiResult<RawTexture> {
        let id = RawTexture(self.next());
        self.textures.insert(id, CpuImage::new(*settings));
        self.refresh_counts();
        Ok(id)
    }

    fn destroy_texture(&mut self, texture: RawTexture) {
        self.textures.remove(&texture);
        self.refresh_counts();
    }

    fn create_view(&mut self, texture: RawTexture, desc: &ViewDesc) -> RhiResult<RawView> {
        assert!(
            self.textures.contains_key(&texture),
            "view of unknown texture {:?}",
            texture
        );
        let id = RawView(self.next());
        self.views.insert(id, (texture, *desc));
        self.refresh_counts();
        Ok(id)
    }

    fn destroy_view(&mut self, view: RawView) {
        self.views.remove(&view);
        self.refresh_counts();
    }

    fn create_sampler(&mut self, settings: &SamplerSettings) -> RhiResult<RawSampler> {
        let id = RawSampler(self.next());
        self.samplers.insert(id, *settings);
        self.refresh_counts();
        Ok(id)
    }

    fn destroy_sampler(&mut self, sampler: RawSampler) {
        self.samplers.remove(&sampler);
        self.refresh_counts();
    }

    fn create_shader_module(
        &mut self,
        stage: ShaderStage,
        spirv: &[u32],
    ) -> RhiResult<RawShaderModule> {
        if spirv.first() != Some(&0x0723_0203) {
            return Err(RhiError::PipelineError(format!(
                "{} module is not SPIR-V",
                stage
            )));
        }
        let id = RawShaderModule(self.next());
        self.modules.insert(id, stage);
        self.stats().stats.shader_modules_created += 1;
        self.refresh_counts();
        Ok(id)
    }

    fn destroy_shader_module(&mut self, module: RawShaderModule) {
        self.modules.remove(&module);
        self.refresh_counts();
    }

    fn create_set_layout(&mut self, desc: &SetLayoutDesc) -> RhiResult<RawSetLayout> {
        let id = RawSetLayout(self.next());
        self.set_layouts.insert(id, desc.clone());
        self.refresh_counts();
        Ok(id)
    }

    fn destroy_set_layout(&mut self, layout: RawSetLayout) {
        self.set_layouts.remove(&layout);
        self.refresh_counts();
    }

    fn create_pipeline_layout(&mut self, sets: &[RawSetLayout]) -> RhiResult<RawPipelineLayout> {
        let id = RawPipelineLayout(self.next());
        self.pipeline_layouts.insert(id, sets.to_vec());
        self.refresh_counts();
        Ok(id)
    }

    fn destroy_pipeline_layout(&mut self, layout: RawPipelineLayout) {
        self.pipeline_layouts.remove(&layout);
        self.refresh_counts();
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc<'_>,
    ) -> RhiResult<RawPipeline> {
        for module in [desc.vertex, desc.fragment] {
            assert!(
                self.modules.contains_key(&module),
                "pipeline '{}' uses a destroyed shader module",
                desc.label
            );
        }
        let id = RawPipeline(self.next());
        self.pipelines.insert(id, desc.layout);
        self.refresh_counts();
        Ok(id)
    }

    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc<'_>) -> RhiResult<RawPipeline> {
        assert!(
            self.modules.contains_key(&desc.module),
            "pipeline '{}' uses a destroyed shader module",
            desc.label
        );
        let id = RawPipeline(self.next());
        self.pipelines.insert(id, desc.layout);
        self.refresh_counts();
        Ok(id)
    }

    fn destroy_pipeline(&mut self, pipeline: RawPipeline) {
        self.pipelines.remove(&pipeline);
        self.refresh_counts();
    }

    fn create_stream(&mut self, pool: &DescriptorPoolConfig) -> RhiResult<RawStream> {
        let id = RawStream(self.next());
        self.streams.insert(
            id,
            Stream {
                pool: *pool,
                sets: Vec::new(),
                commands: Vec::new(),
                state: StreamState::Initial,
                submitted: 0,
                waited: 0,
            },
        );
        debug!("headless: created stream {:?}", id);
        Ok(id)
    }

    fn destroy_stream(&mut self, stream: RawStream) {
        if let Some(removed) = self.streams.remove(&stream) {
            for set in removed.sets {
                self.descriptor_sets.remove(&set);
                self.set_images.remove(&set);
            }
        }
    }

    fn wait_stream(&mut self, stream: RawStream) -> RhiResult<()> {
        let state = self.stream_mut(stream);
        state.waited = state.submitted;
        if state.state == StreamState::Pending {
            state.state = StreamState::Executable;
        }
        let serial = state.submitted;
        self.push_event(HeadlessEvent::FenceWait { stream, serial });
        Ok(())
    }

    fn begin_stream(&mut self, stream: RawStream) -> RhiResult<()> {
        let state = self.stream_mut(stream);
        assert!(
            state.waited == state.submitted,
            "stream {:?} reset while submission {} is still in flight",
            stream,
            state.submitted
        );
        state.commands.clear();
        state.state = StreamState::Recording;
        let freed = std::mem::take(&mut state.sets);
        for set in freed {
            self.descriptor_sets.remove(&set);
            self.set_images.remove(&set);
        }
        self.push_event(HeadlessEvent::Reset { stream });
        Ok(())
    }

    fn allocate_descriptor_set(
        &mut self,
        stream: RawStream,
        layout: RawSetLayout,
    ) -> RhiResult<RawDescriptorSet> {
        assert!(
            self.set_layouts.contains_key(&layout),
            "unknown set layout {:?}",
            layout
        );
        let id = RawDescriptorSet(self.next());
        let state = self.stream_mut(stream);
        if state.sets.len() as u32 >= state.pool.max_sets {
            return Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        state.sets.push(id);
        self.descriptor_sets.insert(id, (stream, layout));
        self.stats().stats.descriptor_sets_allocated += 1;
        Ok(id)
    }

    fn write_descriptor_set(&mut self, set: RawDescriptorSet, writes: &[DescriptorWrite]) {
        let (_, layout) = *self
            .descriptor_sets
            .get(&set)
            .unwrap_or_else(|| panic!("write to unknown descriptor set {:?}", set));
        let desc = &self.set_layouts[&layout];
        let mut images = Vec::new();
        for write in writes {
            match write.resource {
                DescriptorResource::SampledTexture { view, layout } => images.push((view, layout)),
                DescriptorResource::StorageImage { view } => {
                    images.push((view, ImageLayout::General))
                }
                _ => {}
            }
            let binding = desc.binding(write.binding).unwrap_or_else(|| {
                panic!(
                    "descriptor write to binding {} missing from layout",
                    write.binding
                )
            });
            let kind = match write.resource {
                DescriptorResource::Uniform { .. } => DescriptorKind::UniformBuffer,
                DescriptorResource::Storage { .. } => DescriptorKind::StorageBuffer,
                DescriptorResource::SampledTexture { .. } => DescriptorKind::SampledTexture,
                DescriptorResource::StorageImage { .. } => DescriptorKind::StorageImage,
                DescriptorResource::Sampler { .. } => DescriptorKind::Sampler,
            };
            assert_eq!(
                binding.kind, kind,
                "descriptor write kind does not match binding {}",
                write.binding
            );
        }
        self.set_images.entry(set).or_default().extend(images);
        self.stats().stats.descriptor_writes += writes.len() as u64;
    }

    fn record(&mut self, stream: RawStream, command: &Command) {
        let state = self.stream_mut(stream);
        assert_eq!(
            state.state,
            StreamState::Recording,
            "{} recorded outside begin/end",
            command.name()
        );
        state.commands.push(command.clone());
    }

    fn end_stream(&mut self, stream: RawStream) -> RhiResult<()> {
        let state = self.stream_mut(stream);
        assert_eq!(state.state, StreamState::Recording, "end without begin");
        state.state = StreamState::Executable;
        Ok(())
    }

    fn submit(&mut self, stream: RawStream, sync: SubmitSync) -> RhiResult<()> {
        let state = self.stream_mut(stream);
        assert_eq!(
            state.state,
            StreamState::Executable,
            "submitted a stream that was not ended"
        );
        state.submitted += 1;
        state.state = StreamState::Pending;
        let serial = state.submitted;
        let commands = std::mem::take(&mut state.commands);

        self.bound_sets.clear();
        for command in &commands {
            self.execute(command);
        }
        self.stream_mut(stream).commands = commands;

        self.stats().stats.submits += 1;
        self.push_event(HeadlessEvent::Submit {
            stream,
            serial,
            sync,
        });
        Ok(())
    }

    fn wait_idle(&mut self) -> RhiResult<()> {
        for stream in self.streams.values_mut() {
            stream.waited = stream.submitted;
            if stream.state == StreamState::Pending {
                stream.state = StreamState::Executable;
            }
        }
        self.push_event(HeadlessEvent::WaitIdle);
        Ok(())
    }

    fn swapchain(&self) -> Option<SwapchainDesc> {
        self.swapchain.as_ref().map(|s| SwapchainDesc {
            format: s.format,
            extent: s.extent,
            images: s.images.clone(),
        })
    }

    fn acquire_image(&mut self, slot: u32) -> RhiResult<Acquire> {
        if self.probe.lock().stale {
            self.push_event(HeadlessEvent::AcquireStale { slot });
            return Ok(Acquire::Stale);
        }
        let swapchain = self
            .swapchain
            .as_mut()
            .ok_or_else(|| RhiError::SwapchainError("headless backend has no swapchain".into()))?;
        let image = swapchain.next;
        swapchain.next = (swapchain.next + 1) % swapchain.images.len() as u32;
        self.push_event(HeadlessEvent::Acquire { slot, image });
        Ok(Acquire::Image(image))
    }

    fn present(&mut self, image: u32, slot: u32) -> RhiResult<bool> {
        if self.probe.lock().stale {
            self.push_event(HeadlessEvent::PresentStale { slot, image });
            return Ok(false);
        }
        let raw = self
            .swapchain
            .as_ref()
            .and_then(|s| s.images.get(image as usize).copied())
            .ok_or_else(|| RhiError::SwapchainError(format!("no swapchain image {}", image)))?;

        self.expect_layout("Present", raw, 0, 0, &[ImageLayout::PresentSrc]);
        let cpu = self.image_mut(raw);
        let presented = PresentedImage {
            width: cpu.settings.width,
            height: cpu.settings.height,
            format: cpu.settings.format,
            pixels: cpu.data[0].clone(),
        };

        let mut state = self.probe.lock();
        state.presented = Some(presented);
        state.stats.presents += 1;
        drop(state);
        self.push_event(HeadlessEvent::Present { slot, image });
        Ok(true)
    }

    fn rebuild_swapchain(&mut self, width: u32, height: u32) -> RhiResult<()> {
        let old = self
            .swapchain
            .take()
            .ok_or_else(|| RhiError::SwapchainError("headless backend has no swapchain".into()))?;
        for image in old.images {
            self.textures.remove(&image);
        }

        let (width, height) = {
            let mut state = self.probe.lock();
            state.stale = false;
            state.surface.unwrap_or((width, height))
        };
        self.build_swapchain(width, height);
        self.refresh_counts();
        self.push_event(HeadlessEvent::SwapchainRebuilt { width, height });
        debug!("headless: swapchain rebuilt at {}x{}", width, height);
        Ok(())
    }
}

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

#[inline]
fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[inline]
fn f32_at(bytes: &[u8], index: usize) -> f32 {
    let start = index * 4;
    f32::from_le_bytes([
        bytes[start],
        bytes[start + 1],
        bytes[start + 2],
        bytes[start + 3],
    ])
}

/// Decodes one texel to linear RGBA.
fn decode_texel(format: Format, bytes: &[u8]) -> [f32; 4] {
    let n = |i: usize| bytes[i] as f32 / 255.0;
    match format {
        Format::R8Unorm => [n(0), 0.0, 0.0, 1.0],
        Format::Rg8Unorm => [n(0), n(1), 0.0, 1.0],
        Format::Rgba8Unorm => [n(0), n(1), n(2), n(3)],
        Format::Bgra8Unorm => [n(2), n(1), n(0), n(3)],
        Format::Rgba8Srgb => [
            srgb_to_linear(n(0)),
            srgb_to_linear(n(1)),
            srgb_to_linear(n(2)),
            n(3),
        ],
        Format::Bgra8Srgb => [
            srgb_to_linear(n(2)),
            srgb_to_linear(n(1)),
            srgb_to_linear(n(0)),
            n(3),
        ],
        Format::Rgba16Float => {
            let h = |i: usize| f16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]).to_f32();
            [h(0), h(1), h(2), h(3)]
        }
        Format::R32Float | Format::Depth32Float => [f32_at(bytes, 0), 0.0, 0.0, 1.0],
        Format::Rgba32Float => [
            f32_at(bytes, 0),
            f32_at(bytes, 1),
            f32_at(bytes, 2),
            f32_at(bytes, 3),
        ],
        Format::Depth24Stencil8 => {
            let packed = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let depth = (packed & 0x00ff_ffff) as f32 / 16_777_215.0;
            [depth, (packed >> 24) as f32, 0.0, 1.0]
        }
    }
}

/// Encodes linear RGBA into one texel of `format`.
fn encode_texel(format: Format, texel: [f32; 4], out: &mut [u8]) {
    let [r, g, b, a] = texel;
    match format {
        Format::R8Unorm => out[0] = unorm8(r),
        Format::Rg8Unorm => {
            out[0] = unorm8(r);
            out[1] = unorm8(g);
        }
        Format::Rgba8Unorm => out.copy_from_slice(&[unorm8(r), unorm8(g), unorm8(b), unorm8(a)]),
        Format::Bgra8Unorm => out.copy_from_slice(&[unorm8(b), unorm8(g), unorm8(r), unorm8(a)]),
        Format::Rgba8Srgb => out.copy_from_slice(&[
            unorm8(linear_to_srgb(r)),
            unorm8(linear_to_srgb(g)),
            unorm8(linear_to_srgb(b)),
            unorm8(a),
        ]),
        Format::Bgra8Srgb => out.copy_from_slice(&[
            unorm8(linear_to_srgb(b)),
            unorm8(linear_to_srgb(g)),
            unorm8(linear_to_srgb(r)),
            unorm8(a),
        ]),
        Format::Rgba16Float => {
            for (i, value) in texel.iter().enumerate() {
                out[i * 2..i * 2 + 2].copy_from_slice(&f16::from_f32(*value).to_le_bytes());
            }
        }
        Format::R32Float | Format::Depth32Float => out.copy_from_slice(&r.to_le_bytes()),
        Format::Rgba32Float => {
            for (i, value) in texel.iter().enumerate() {
                out[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
        Format::Depth24Stencil8 => {
            let depth = (r.clamp(0.0, 1.0) * 16_777_215.0).round() as u32;
            let stencil = (g as u32).min(255);
            out.copy_from_slice(&(depth | stencil << 24).to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SubresourceRange;
    use crate::texture::Aspect;

    #[test]
    fn test_texel_codecs() {
        let mut out = [0u8; 4];
        encode_texel(Format::Rgba8Unorm, [1.0, 0.0, 0.5, 1.0], &mut out);
        assert_eq!(out, [255, 0, 128, 255]);

        encode_texel(Format::Bgra8Unorm, [1.0, 0.0, 0.0, 1.0], &mut out);
        assert_eq!(out, [0, 0, 255, 255]);
        assert_eq!(decode_texel(Format::Bgra8Unorm, &out), [1.0, 0.0, 0.0, 1.0]);

        let mut wide = [0u8; 8];
        encode_texel(Format::Rgba16Float, [0.25, 1.0, 2.0, 1.0], &mut wide);
        assert_eq!(decode_texel(Format::Rgba16Float, &wide), [0.25, 1.0, 2.0, 1.0]);

        encode_texel(Format::Depth24Stencil8, [1.0, 7.0, 0.0, 1.0], &mut out);
        let decoded = decode_texel(Format::Depth24Stencil8, &out);
        assert_eq!(decoded[0], 1.0);
        assert_eq!(decoded[1], 7.0);
    }

    #[test]
    fn test_srgb_round_trip_endpoints() {
        let mut out = [0u8; 4];
        encode_texel(Format::Rgba8Srgb, [0.0, 1.0, 0.0, 1.0], &mut out);
        assert_eq!(out, [0, 255, 0, 255]);
    }

    #[test]
    fn test_barrier_mismatch_is_recorded() {
        let mut backend = HeadlessBackend::new();
        let probe = backend.probe();
        let texture = backend
            .create_texture(&TextureSettings::render_target(4, 4, Format::Rgba8Unorm))
            .unwrap();
        let stream = backend
            .create_stream(&DescriptorPoolConfig::default())
            .unwrap();

        backend.begin_stream(stream).unwrap();
        let range = SubresourceRange::single(Aspect::Color, 0, 0);
        backend.record(
            stream,
            &Command::ImageBarrier {
                texture,
                range,
                old: ImageLayout::Undefined,
                new: ImageLayout::TransferDst,
            },
        );
        backend.record(
            stream,
            &Command::ImageBarrier {
                texture,
                range,
                old: ImageLayout::ShaderReadOnly,
                new: ImageLayout::TransferSrc,
            },
        );
        backend.end_stream(stream).unwrap();
        backend.submit(stream, SubmitSync::None).unwrap();

        let mismatches = probe.layout_mismatches();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].expected, ImageLayout::ShaderReadOnly);
        assert_eq!(mismatches[0].actual, ImageLayout::TransferDst);
    }

    #[test]
    #[should_panic(expected = "still in flight")]
    fn test_reset_before_fence_wait_panics() {
        let mut backend = HeadlessBackend::new();
        let stream = backend
            .create_stream(&DescriptorPoolConfig::default())
            .unwrap();
        backend.begin_stream(stream).unwrap();
        backend.end_stream(stream).unwrap();
        backend.submit(stream, SubmitSync::None).unwrap();
        backend.begin_stream(stream).unwrap();
    }

    #[test]
    fn test_descriptor_pool_exhaustion() {
        let mut backend = HeadlessBackend::new();
        let layout = backend.create_set_layout(&SetLayoutDesc::default()).unwrap();
        let stream = backend
            .create_stream(&DescriptorPoolConfig {
                max_sets: 2,
                per_type: 8,
            })
            .unwrap();
        backend.begin_stream(stream).unwrap();
        backend.allocate_descriptor_set(stream, layout).unwrap();
        backend.allocate_descriptor_set(stream, layout).unwrap();
        assert!(backend.allocate_descriptor_set(stream, layout).is_err());

        backend.end_stream(stream).unwrap();
        backend.wait_stream(stream).unwrap();
        backend.begin_stream(stream).unwrap();
        assert!(backend.allocate_descriptor_set(stream, layout).is_ok());
    }

    #[test]
    fn test_stale_swapchain_rebuilds_at_surface_extent() {
        let mut backend = HeadlessBackend::new().with_swapchain(64, 64, 2);
        let probe = backend.probe();
        assert_eq!(backend.acquire_image(0).unwrap(), Acquire::Image(0));
        assert_eq!(backend.acquire_image(1).unwrap(), Acquire::Image(1));

        probe.resize_surface(32, 16);
        assert_eq!(backend.acquire_image(0).unwrap(), Acquire::Stale);

        backend.rebuild_swapchain(1, 1).unwrap();
        assert_eq!(backend.swapchain().unwrap().extent, (32, 16));
        assert_eq!(backend.acquire_image(0).unwrap(), Acquire::Image(0));
    }
}
