//! The device: sole owner of every GPU resource.
//!
//! # Overview
//!
//! [`Device`] wraps one [`GpuBackend`] chosen at construction and hands out
//! generation-checked handles for everything it creates:
//!
//! - Buffers (host-visible, persistently mapped) and textures
//! - Samplers, framebuffers and pipelines
//! - Shader programs, through the content-addressed [`ShaderCache`]
//! - Command [`Context`]s, one per frame in flight plus a private one for
//!   synchronous uploads
//! - The swapchain, whose images are exposed as textures
//!
//! Nothing else frees GPU objects. A handle used after `destroy_*` fails its
//! lookup with a panic instead of reaching a recycled object.
//!
//! # Errors
//!
//! Native failures surface as [`RhiError`]. Shader problems are not errors at
//! this level: [`Device::create_pipeline`] and [`Device::compile_shader`] log
//! the diagnostics and return `Ok(None)`.

use slotmap::SlotMap;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{
    Acquire, ComputePipelineDesc, DeviceLimits, GpuBackend, GraphicsPipelineDesc, RawPipeline,
    RawPipelineLayout, RawSampler, RawStream, RawView, SubmitSync,
};
use crate::buffer::{Buffer, BufferKind};
use crate::context::{Context, ContextState};
use crate::error::{RhiError, RhiResult};
use crate::framebuffer::{
    Attachment, Framebuffer, FramebufferSettings, MAX_COLOR_ATTACHMENTS, RenderTargetDesc,
};
use crate::handle::{
    BufferHandle, ContextHandle, FramebufferHandle, PipelineHandle, SamplerHandle, ShaderHandle,
    TextureHandle,
};
use crate::pipeline::{BindPoint, Pipeline, PipelineSettings, PipelineTarget, VertexLayout};
use crate::sampler::SamplerSettings;
use crate::scratch::RingAllocator;
use crate::shader::{ShaderCache, ShaderError, ShaderProgram, ShaderResolver, ShaderStage};
use crate::texture::{Format, Texture, TextureSettings, TextureShape, TextureUsage, ViewDesc};
use lumen_core::{DescriptorPoolConfig, EngineConfig};

/// Device-level settings taken from the engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Contexts the renderer rotates through.
    pub frames_in_flight: u32,
    /// Initial size of each context's scratch uniform ring.
    pub scratch_ring_size: u64,
    /// Per-context descriptor pool sizing.
    pub descriptor_pool: DescriptorPoolConfig,
}

impl From<&EngineConfig> for DeviceConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            frames_in_flight: config.frames_in_flight,
            scratch_ring_size: config.scratch_ring_size,
            descriptor_pool: config.descriptor_pool,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
struct AcquiredImage {
    image: u32,
    /// Selects the acquired/ready semaphore pair.
    slot: u32,
    submitted: bool,
}

#[derive(Debug)]
struct SwapchainState {
    format: Format,
    extent: (u32, u32),
    images: Vec<TextureHandle>,
    acquired: Option<AcquiredImage>,
}

struct BuiltPipeline {
    raw: RawPipeline,
    layout: RawPipelineLayout,
    bind_point: BindPoint,
}

/// Owner of all GPU resources.
pub struct Device {
    pub(crate) backend: Box<dyn GpuBackend>,
    resolver: Box<dyn ShaderResolver>,
    config: DeviceConfig,
    limits: DeviceLimits,
    pub(crate) buffers: SlotMap<BufferHandle, Buffer>,
    pub(crate) textures: SlotMap<TextureHandle, Texture>,
    samplers: SlotMap<SamplerHandle, RawSampler>,
    pub(crate) framebuffers: SlotMap<FramebufferHandle, Framebuffer>,
    pub(crate) pipelines: SlotMap<PipelineHandle, Pipeline>,
    pub(crate) shaders: ShaderCache,
    /// `None` while a [`Context`] has the state checked out.
    contexts: SlotMap<ContextHandle, Option<ContextState>>,
    default_sampler: SamplerHandle,
    upload_context: ContextHandle,
    swapchain: Option<SwapchainState>,
    frame_index: u64,
}

impl Device {
    /// Creates a device on top of `backend`.
    ///
    /// # Arguments
    ///
    /// * `backend` - The GPU backend every operation is routed to
    /// * `config` - Frames in flight, scratch ring and descriptor pool sizing
    /// * `resolver` - Where shader source comes from
    ///
    /// # Errors
    ///
    /// Returns an error if the default sampler, the upload context or the
    /// swapchain image views cannot be created.
    pub fn new(
        backend: Box<dyn GpuBackend>,
        config: DeviceConfig,
        resolver: Box<dyn ShaderResolver>,
    ) -> RhiResult<Self> {
        assert!(
            config.frames_in_flight >= 1,
            "a device needs at least one frame in flight"
        );
        let limits = backend.limits();
        info!(
            "Creating device on the {} backend ({} frames in flight)",
            backend.name(),
            config.frames_in_flight
        );

        let mut device = Self {
            backend,
            resolver,
            config,
            limits,
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            framebuffers: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            shaders: ShaderCache::new(),
            contexts: SlotMap::with_key(),
            default_sampler: SamplerHandle::default(),
            upload_context: ContextHandle::default(),
            swapchain: None,
            frame_index: 0,
        };

        let sampler = device.backend.create_sampler(&SamplerSettings::default())?;
        device.default_sampler = device.samplers.insert(sampler);
        device.upload_context = device.create_context()?;
        device.register_swapchain()?;
        Ok(device)
    }

    // Lookups. A stale handle is a bug in the caller.

    pub(crate) fn buffer(&self, handle: BufferHandle) -> &Buffer {
        self.buffers
            .get(handle)
            .unwrap_or_else(|| panic!("buffer handle {:?} is stale", handle))
    }

    pub(crate) fn texture(&self, handle: TextureHandle) -> &Texture {
        self.textures
            .get(handle)
            .unwrap_or_else(|| panic!("texture handle {:?} is stale", handle))
    }

    pub(crate) fn texture_mut(&mut self, handle: TextureHandle) -> &mut Texture {
        self.textures
            .get_mut(handle)
            .unwrap_or_else(|| panic!("texture handle {:?} is stale", handle))
    }

    pub(crate) fn raw_sampler(&self, handle: SamplerHandle) -> RawSampler {
        *self
            .samplers
            .get(handle)
            .unwrap_or_else(|| panic!("sampler handle {:?} is stale", handle))
    }

    pub(crate) fn framebuffer(&self, handle: FramebufferHandle) -> &Framebuffer {
        self.framebuffers
            .get(handle)
            .unwrap_or_else(|| panic!("framebuffer handle {:?} is stale", handle))
    }

    pub(crate) fn pipeline(&self, handle: PipelineHandle) -> &Pipeline {
        self.pipelines
            .get(handle)
            .unwrap_or_else(|| panic!("pipeline handle {:?} is stale", handle))
    }

    // Buffers

    /// Creates a host-visible buffer of exactly `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot allocate the memory.
    pub fn create_buffer(&mut self, kind: BufferKind, size: u64) -> RhiResult<BufferHandle> {
        assert!(size > 0, "{} buffer must not be empty", kind);
        let raw = self.backend.create_buffer(kind, size)?;
        trace!("Created {} buffer ({} bytes)", kind, size);
        Ok(self.buffers.insert(Buffer { raw, kind, size }))
    }

    /// Writes `data` at `offset`. Panics if the write would leave the buffer.
    pub fn upload(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RhiResult<()> {
        let record = self.buffer(buffer);
        record.assert_range("upload", offset, data.len() as u64);
        let raw = record.raw;

        let start = offset as usize;
        self.backend.mapped(raw)?[start..start + data.len()].copy_from_slice(data);
        self.backend.flush_buffer(raw, offset, data.len() as u64)
    }

    /// Typed [`upload`](Self::upload).
    pub fn upload_slice<T: bytemuck::Pod>(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[T],
    ) -> RhiResult<()> {
        self.upload(buffer, offset, bytemuck::cast_slice(data))
    }

    /// Zeroes `size` bytes at `offset`. Panics if the range leaves the buffer.
    pub fn clear(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> RhiResult<()> {
        let record = self.buffer(buffer);
        record.assert_range("clear", offset, size);
        let raw = record.raw;

        let start = offset as usize;
        self.backend.mapped(raw)?[start..start + size as usize].fill(0);
        self.backend.flush_buffer(raw, offset, size)
    }

    /// The buffer's persistent mapping. Writes need a [`flush`](Self::flush)
    /// before the GPU is guaranteed to see them.
    pub fn map(&mut self, buffer: BufferHandle) -> RhiResult<&mut [u8]> {
        let raw = self.buffer(buffer).raw;
        self.backend.mapped(raw)
    }

    /// Ends a [`map`](Self::map). Buffers stay mapped for their lifetime.
    pub fn unmap(&mut self, buffer: BufferHandle) {
        let record = self.buffer(buffer);
        trace!("Unmapped {} buffer {:?}", record.kind, record.raw);
    }

    pub fn flush(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> RhiResult<()> {
        let record = self.buffer(buffer);
        record.assert_range("flush", offset, size);
        let raw = record.raw;
        self.backend.flush_buffer(raw, offset, size)
    }

    pub fn invalidate(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> RhiResult<()> {
        let record = self.buffer(buffer);
        record.assert_range("invalidate", offset, size);
        let raw = record.raw;
        self.backend.invalidate_buffer(raw, offset, size)
    }

    /// Copies `len` bytes out of the buffer after making GPU writes visible.
    pub fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, len: u64) -> RhiResult<Vec<u8>> {
        let record = self.buffer(buffer);
        record.assert_range("read", offset, len);
        let raw = record.raw;

        self.backend.invalidate_buffer(raw, offset, len)?;
        let start = offset as usize;
        Ok(self.backend.mapped(raw)?[start..start + len as usize].to_vec())
    }

    pub fn buffer_size(&self, buffer: BufferHandle) -> u64 {
        self.buffer(buffer).size
    }

    pub fn buffer_kind(&self, buffer: BufferHandle) -> BufferKind {
        self.buffer(buffer).kind
    }

    pub fn destroy_buffer(&mut self, buffer: BufferHandle) {
        let record = self
            .buffers
            .remove(buffer)
            .unwrap_or_else(|| panic!("destroy of stale buffer handle {:?}", buffer));
        self.backend.destroy_buffer(record.raw);
    }

    // Textures

    /// Creates a texture and moves it into its resting layout. Contents are
    /// undefined until uploaded or rendered.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the image, a view or the
    /// initial transition.
    pub fn create_texture(&mut self, settings: TextureSettings) -> RhiResult<TextureHandle> {
        settings.assert_valid();
        assert!(
            settings.usage != TextureUsage::Present,
            "present textures belong to the swapchain"
        );

        let raw = self.backend.create_texture(&settings)?;
        let view = self.backend.create_view(raw, &ViewDesc::full(&settings))?;
        let mut mip_views = Vec::new();
        if settings.usage == TextureUsage::Storage {
            for mip in 0..settings.levels {
                mip_views.push(
                    self.backend
                        .create_view(raw, &ViewDesc::level(&settings, mip))?,
                );
            }
        }

        let handle = self.textures.insert(Texture {
            raw,
            settings,
            view,
            mip_views,
            initialized: false,
            external: false,
        });
        self.one_shot(|ctx| {
            ctx.initialize_texture(handle);
            Ok(())
        })?;

        debug!(
            "Created {}x{} {:?} texture ({} levels, {} layers, {:?})",
            settings.width, settings.height, settings.format, settings.levels, settings.layers,
            settings.usage
        );
        Ok(handle)
    }

    /// Uploads tightly packed texels for every layer of mip 0, then fills the
    /// remaining levels if the texture was created with `generate_mips`.
    /// Blocks until the GPU is done.
    pub fn upload_texture(&mut self, texture: TextureHandle, data: &[u8]) -> RhiResult<()> {
        let settings = self.texture(texture).settings;
        assert!(
            !settings.format.has_stencil(),
            "uploads to depth/stencil textures are not supported"
        );
        let expected = settings.level_size(0) * settings.layers as u64;
        assert_eq!(
            data.len() as u64,
            expected,
            "texture upload of {} bytes, level 0 of a {}x{}x{} {:?} texture holds {}",
            data.len(),
            settings.width,
            settings.height,
            settings.layers,
            settings.format,
            expected
        );

        let staging = self.create_buffer(BufferKind::Staging, expected)?;
        let result = self.upload(staging, 0, data).and_then(|()| {
            self.one_shot(|ctx| {
                ctx.copy_buffer_to_texture(staging, 0, texture, 0);
                if settings.generate_mips && settings.levels > 1 {
                    ctx.generate_mips(texture);
                }
                Ok(())
            })
        });
        self.destroy_buffer(staging);
        result
    }

    /// Reads one layer of one mip level back to the CPU. Blocks until the GPU
    /// is done.
    pub fn read_pixels(&mut self, texture: TextureHandle, mip: u32, layer: u32) -> RhiResult<Vec<u8>> {
        let settings = self.texture(texture).settings;
        assert!(
            mip < settings.levels && layer < settings.layers,
            "read_pixels of mip {} layer {} from a texture with {} levels and {} layers",
            mip,
            layer,
            settings.levels,
            settings.layers
        );
        let size = settings.level_size(mip);

        let staging = self.create_buffer(BufferKind::Staging, size)?;
        let result = self
            .one_shot(|ctx| {
                ctx.copy_texture_to_buffer(texture, mip, layer, staging, 0);
                Ok(())
            })
            .and_then(|()| self.read_buffer(staging, 0, size));
        self.destroy_buffer(staging);
        result
    }

    pub fn texture_settings(&self, texture: TextureHandle) -> TextureSettings {
        self.texture(texture).settings
    }

    pub fn destroy_texture(&mut self, texture: TextureHandle) {
        assert!(
            !self.texture(texture).external,
            "swapchain images are destroyed with the swapchain"
        );
        if let Some(record) = self.textures.remove(texture) {
            for view in record.mip_views {
                self.backend.destroy_view(view);
            }
            self.backend.destroy_view(record.view);
            self.backend.destroy_texture(record.raw);
        }
    }

    // Samplers

    pub fn create_sampler(&mut self, settings: SamplerSettings) -> RhiResult<SamplerHandle> {
        let raw = self.backend.create_sampler(&settings)?;
        Ok(self.samplers.insert(raw))
    }

    /// The sampler bound to sampler slots nobody filled.
    #[inline]
    pub fn default_sampler(&self) -> SamplerHandle {
        self.default_sampler
    }

    pub fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        assert_ne!(
            sampler, self.default_sampler,
            "the default sampler belongs to the device"
        );
        let raw = self
            .samplers
            .remove(sampler)
            .unwrap_or_else(|| panic!("destroy of stale sampler handle {:?}", sampler));
        self.backend.destroy_sampler(raw);
    }

    // Framebuffers

    fn check_attachment(&self, attachment: &Attachment, depth: bool) -> TextureSettings {
        let settings = self.texture(attachment.texture).settings;
        assert_eq!(
            settings.format.is_depth(),
            depth,
            "{:?} texture attached as a {} attachment",
            settings.format,
            if depth { "depth" } else { "color" }
        );
        assert!(
            attachment.mip() < settings.levels,
            "attachment level {} of a texture with {} levels",
            attachment.mip(),
            settings.levels
        );
        assert!(
            attachment.base_layer() < settings.layers,
            "attachment layer {} of a texture with {} layers",
            attachment.base_layer(),
            settings.layers
        );
        settings
    }

    /// Creates an immutable attachment set. Every attachment must have the
    /// same extent at its chosen mip level and the same sample count.
    pub fn create_framebuffer(&mut self, settings: FramebufferSettings) -> RhiResult<FramebufferHandle> {
        let max_colors = MAX_COLOR_ATTACHMENTS.min(self.limits.max_color_attachments as usize);
        assert!(
            settings.color.len() <= max_colors,
            "framebuffer with {} color attachments, at most {} are supported",
            settings.color.len(),
            max_colors
        );
        assert!(
            !settings.color.is_empty() || settings.depth.is_some(),
            "framebuffer without attachments"
        );

        let mut shapes = Vec::with_capacity(settings.color.len() + 1);
        let mut color_formats = Vec::with_capacity(settings.color.len());
        for attachment in &settings.color {
            let texture = self.check_attachment(attachment, false);
            color_formats.push(texture.format);
            shapes.push((texture, *attachment));
        }
        let depth_format = settings.depth.as_ref().map(|attachment| {
            let texture = self.check_attachment(attachment, true);
            shapes.push((texture, *attachment));
            texture.format
        });

        let (first, first_attachment) = shapes[0];
        let extent = first.mip_extent(first_attachment.mip());
        for (texture, attachment) in &shapes[1..] {
            assert_eq!(
                texture.mip_extent(attachment.mip()),
                extent,
                "framebuffer attachments disagree on extent"
            );
            assert_eq!(
                texture.samples, first.samples,
                "framebuffer attachments disagree on sample count"
            );
        }

        let mut color_views = Vec::with_capacity(settings.color.len());
        for attachment in &settings.color {
            color_views.push(self.attachment_view(attachment)?);
        }
        let depth_view = match &settings.depth {
            Some(attachment) => Some(self.attachment_view(attachment)?),
            None => None,
        };

        debug!(
            "Created {}x{} framebuffer ({} colors, depth: {})",
            extent.0,
            extent.1,
            color_views.len(),
            depth_view.is_some()
        );
        Ok(self.framebuffers.insert(Framebuffer {
            settings,
            target: RenderTargetDesc {
                color_formats,
                depth_format,
                samples: first.samples,
            },
            extent,
            color_views,
            depth_view,
        }))
    }

    fn attachment_view(&mut self, attachment: &Attachment) -> RhiResult<RawView> {
        let texture = self.texture(attachment.texture);
        let (raw, settings) = (texture.raw, texture.settings);
        self.backend.create_view(
            raw,
            &ViewDesc::single(&settings, attachment.mip(), attachment.base_layer()),
        )
    }

    pub fn framebuffer_extent(&self, framebuffer: FramebufferHandle) -> (u32, u32) {
        self.framebuffer(framebuffer).extent
    }

    pub fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        let record = self
            .framebuffers
            .remove(framebuffer)
            .unwrap_or_else(|| panic!("destroy of stale framebuffer handle {:?}", framebuffer));
        for view in record.color_views.into_iter().chain(record.depth_view) {
            self.backend.destroy_view(view);
        }
    }

    // Shaders and pipelines

    fn log_shader_error(&self, name: &str, err: &ShaderError) {
        let qualified = self
            .resolver
            .resolve(name)
            .map_or_else(|| name.to_string(), |resolved| resolved.qualified_name);
        error!("Shader '{}': {}", qualified, err);
        for diagnostic in err.diagnostics() {
            error!("{}:{}", qualified, diagnostic);
        }
    }

    fn acquire_shader(&mut self, name: &str, defines: &[String]) -> RhiResult<Option<ShaderHandle>> {
        match self
            .shaders
            .acquire(self.backend.as_mut(), self.resolver.as_ref(), name, defines)
        {
            Ok(handle) => Ok(Some(handle)),
            Err(RhiError::Shader(err)) => {
                self.log_shader_error(name, &err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Compiles (or finds) a shader program and takes one use of it.
    ///
    /// Returns `Ok(None)` after logging the diagnostics if the shader cannot
    /// be resolved or compiled.
    pub fn compile_shader<S: AsRef<str>>(
        &mut self,
        name: &str,
        defines: &[S],
    ) -> RhiResult<Option<ShaderHandle>> {
        let defines: Vec<String> = defines.iter().map(|d| d.as_ref().to_string()).collect();
        self.acquire_shader(name, &defines)
    }

    /// Drops one use of a shader. Returns true if its modules were destroyed.
    pub fn release_shader(&mut self, shader: ShaderHandle) -> bool {
        self.shaders.release(self.backend.as_mut(), shader)
    }

    pub fn shader_uses(&self, shader: ShaderHandle) -> u32 {
        self.shaders.get(shader).uses()
    }

    pub fn shader(&self, shader: ShaderHandle) -> &ShaderProgram {
        self.shaders.get(shader)
    }

    pub fn shader_alive(&self, shader: ShaderHandle) -> bool {
        self.shaders.contains(shader)
    }

    pub fn shader_count(&self) -> usize {
        self.shaders.len()
    }

    fn build_pipeline(
        &mut self,
        settings: &PipelineSettings,
        shader: ShaderHandle,
    ) -> RhiResult<Option<BuiltPipeline>> {
        let program = self.shaders.get(shader);
        let layout = program.pipeline_layout;

        match settings.target {
            PipelineTarget::Compute => {
                let Some(module) = program.module(ShaderStage::Compute) else {
                    error!(
                        "Shader '{}' has no compute stage but was used for a compute pipeline",
                        settings.shader
                    );
                    return Ok(None);
                };
                let raw = self.backend.create_compute_pipeline(&ComputePipelineDesc {
                    label: &settings.shader,
                    module,
                    layout,
                })?;
                Ok(Some(BuiltPipeline {
                    raw,
                    layout,
                    bind_point: BindPoint::Compute,
                }))
            }
            PipelineTarget::Framebuffer(framebuffer) => {
                let (Some(vertex), Some(fragment)) = (
                    program.module(ShaderStage::Vertex),
                    program.module(ShaderStage::Fragment),
                ) else {
                    error!(
                        "Shader '{}' has no vertex/fragment stages but was used for a graphics pipeline",
                        settings.shader
                    );
                    return Ok(None);
                };
                let vertex_layout = settings
                    .vertex_layout
                    .clone()
                    .unwrap_or_else(|| VertexLayout::packed(&program.vertex_inputs));
                let target = self.framebuffer(framebuffer).target.clone();

                let raw = self.backend.create_graphics_pipeline(&GraphicsPipelineDesc {
                    label: &settings.shader,
                    vertex,
                    fragment,
                    layout,
                    target: &target,
                    vertex_layout: &vertex_layout,
                    topology: settings.topology,
                    polygon_mode: settings.polygon_mode,
                    cull: settings.cull,
                    front_face: settings.front_face,
                    depth_test: settings.depth_test,
                    depth_write: settings.depth_write,
                    depth_compare: settings.depth_compare,
                    blend: settings.blend.color_blend(),
                })?;
                Ok(Some(BuiltPipeline {
                    raw,
                    layout,
                    bind_point: BindPoint::Graphics,
                }))
            }
        }
    }

    /// Compiles the pipeline's shader (or reuses the cached program) and
    /// builds the pipeline object.
    ///
    /// Returns `Ok(None)` after logging if the shader does not compile or its
    /// stages do not fit the pipeline kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to create modules, layouts or
    /// the pipeline itself.
    pub fn create_pipeline(&mut self, settings: PipelineSettings) -> RhiResult<Option<PipelineHandle>> {
        let Some(shader) = self.acquire_shader(&settings.shader, &settings.defines)? else {
            return Ok(None);
        };

        let built = match self.build_pipeline(&settings, shader) {
            Ok(Some(built)) => built,
            Ok(None) => {
                self.shaders.release(self.backend.as_mut(), shader);
                return Ok(None);
            }
            Err(err) => {
                self.shaders.release(self.backend.as_mut(), shader);
                return Err(err);
            }
        };

        debug!("Created pipeline '{}'", settings.shader);
        Ok(Some(self.pipelines.insert(Pipeline {
            settings,
            shader,
            raw: built.raw,
            layout: built.layout,
            bind_point: built.bind_point,
        })))
    }

    pub fn pipeline_shader(&self, pipeline: PipelineHandle) -> ShaderHandle {
        self.pipeline(pipeline).shader
    }

    pub fn pipeline_settings(&self, pipeline: PipelineHandle) -> &PipelineSettings {
        &self.pipeline(pipeline).settings
    }

    /// Destroys a pipeline and drops its use of the shader.
    pub fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        let record = self
            .pipelines
            .remove(pipeline)
            .unwrap_or_else(|| panic!("destroy of stale pipeline handle {:?}", pipeline));
        self.backend.destroy_pipeline(record.raw);
        self.shaders.release(self.backend.as_mut(), record.shader);
    }

    /// Recompiles the shader of every pipeline whose source changed and
    /// rebuilds the pipeline in place; handles stay valid. A pipeline whose
    /// new source fails to compile keeps its previous program.
    ///
    /// Returns how many pipelines were rebuilt.
    pub fn reload_pipelines(&mut self) -> RhiResult<usize> {
        self.wait_idle()?;

        let handles: Vec<PipelineHandle> = self.pipelines.keys().collect();
        let mut rebuilt = 0;
        for handle in handles {
            let (settings, old_shader) = {
                let pipeline = &self.pipelines[handle];
                (pipeline.settings.clone(), pipeline.shader)
            };

            let key = match ShaderCache::current_key(
                self.resolver.as_ref(),
                &settings.shader,
                &settings.defines,
            ) {
                Ok(key) => key,
                Err(RhiError::Shader(err)) => {
                    self.log_shader_error(&settings.shader, &err);
                    warn!("Keeping the previous pipeline for '{}'", settings.shader);
                    continue;
                }
                Err(err) => return Err(err),
            };
            if key == self.shaders.get(old_shader).key {
                continue;
            }

            let Some(new_shader) = self.acquire_shader(&settings.shader, &settings.defines)? else {
                warn!("Keeping the previous pipeline for '{}'", settings.shader);
                continue;
            };
            let built = match self.build_pipeline(&settings, new_shader) {
                Ok(Some(built)) => built,
                Ok(None) => {
                    self.shaders.release(self.backend.as_mut(), new_shader);
                    warn!("Keeping the previous pipeline for '{}'", settings.shader);
                    continue;
                }
                Err(err) => {
                    self.shaders.release(self.backend.as_mut(), new_shader);
                    return Err(err);
                }
            };

            let pipeline = &mut self.pipelines[handle];
            let old_raw = std::mem::replace(&mut pipeline.raw, built.raw);
            pipeline.layout = built.layout;
            pipeline.bind_point = built.bind_point;
            pipeline.shader = new_shader;
            self.backend.destroy_pipeline(old_raw);
            self.shaders.release(self.backend.as_mut(), old_shader);

            info!("Reloaded pipeline '{}'", settings.shader);
            rebuilt += 1;
        }
        Ok(rebuilt)
    }

    // Contexts

    /// Creates a command context with its own stream, descriptor pool and
    /// scratch ring.
    pub fn create_context(&mut self) -> RhiResult<ContextHandle> {
        let stream = self.backend.create_stream(&self.config.descriptor_pool)?;
        let state = ContextState::new(
            stream,
            self.config.scratch_ring_size,
            self.limits.min_uniform_alignment,
        );
        Ok(self.contexts.insert(Some(state)))
    }

    /// Waits for the context's last submission and destroys it.
    pub fn destroy_context(&mut self, context: ContextHandle) -> RhiResult<()> {
        assert_ne!(
            context, self.upload_context,
            "the upload context belongs to the device"
        );
        let state = self
            .contexts
            .remove(context)
            .unwrap_or_else(|| panic!("destroy of stale context handle {:?}", context))
            .unwrap_or_else(|| panic!("context {:?} destroyed while in use", context));
        self.backend.wait_stream(state.stream)?;
        self.teardown_context(state);
        Ok(())
    }

    fn teardown_context(&mut self, mut state: ContextState) {
        state.ring.destroy(self);
        self.backend.destroy_stream(state.stream);
    }

    /// Checks out a context for recording. The state returns to the device
    /// when the [`Context`] is dropped.
    pub fn context(&mut self, context: ContextHandle) -> Context<'_> {
        let state = self
            .contexts
            .get_mut(context)
            .unwrap_or_else(|| panic!("context handle {:?} is stale", context))
            .take()
            .unwrap_or_else(|| panic!("context {:?} is already in use", context));
        Context::new(self, context, state)
    }

    pub(crate) fn return_context(&mut self, context: ContextHandle, state: ContextState) {
        if let Some(slot) = self.contexts.get_mut(context) {
            *slot = Some(state);
        }
    }

    /// Records `record` into the upload context, submits it and waits for
    /// completion.
    pub fn one_shot<F>(&mut self, record: F) -> RhiResult<()>
    where
        F: FnOnce(&mut Context<'_>) -> RhiResult<()>,
    {
        let upload = self.upload_context;
        let mut ctx = self.context(upload);
        ctx.begin()?;
        record(&mut ctx)?;
        ctx.end()?;
        ctx.submit_and_wait()
    }

    /// Submits a context that has been ended.
    pub fn submit(&mut self, context: ContextHandle) -> RhiResult<()> {
        self.context(context).submit()
    }

    /// Submits a stream, consuming the pending swapchain acquire if there is
    /// one.
    pub(crate) fn submit_stream(&mut self, stream: RawStream, swapchain_sync: bool) -> RhiResult<()> {
        let sync = match self.swapchain.as_mut().and_then(|s| s.acquired.as_mut()) {
            Some(acquired) if swapchain_sync && !acquired.submitted => {
                acquired.submitted = true;
                SubmitSync::Swapchain { slot: acquired.slot }
            }
            _ => SubmitSync::None,
        };
        self.backend.submit(stream, sync)
    }

    /// Blocks until the GPU has finished all submitted work.
    pub fn wait_idle(&mut self) -> RhiResult<()> {
        self.backend.wait_idle()
    }

    // Swapchain

    fn register_swapchain(&mut self) -> RhiResult<()> {
        let Some(desc) = self.backend.swapchain() else {
            self.swapchain = None;
            return Ok(());
        };

        let settings = TextureSettings {
            width: desc.extent.0,
            height: desc.extent.1,
            levels: 1,
            layers: 1,
            samples: 1,
            format: desc.format,
            shape: TextureShape::D2,
            usage: TextureUsage::Present,
            generate_mips: false,
        };
        let mut images = Vec::with_capacity(desc.images.len());
        for raw in desc.images {
            let view = self.backend.create_view(raw, &ViewDesc::full(&settings))?;
            images.push(self.textures.insert(Texture {
                raw,
                settings,
                view,
                mip_views: Vec::new(),
                initialized: false,
                external: true,
            }));
        }

        info!(
            "Swapchain: {} images, {}x{}, {:?}",
            images.len(),
            desc.extent.0,
            desc.extent.1,
            desc.format
        );
        self.swapchain = Some(SwapchainState {
            format: desc.format,
            extent: desc.extent,
            images,
            acquired: None,
        });
        Ok(())
    }

    fn unregister_swapchain(&mut self) {
        if let Some(swapchain) = self.swapchain.take() {
            for image in swapchain.images {
                if let Some(texture) = self.textures.remove(image) {
                    self.backend.destroy_view(texture.view);
                }
            }
        }
    }

    fn swapchain_state(&mut self) -> &mut SwapchainState {
        self.swapchain
            .as_mut()
            .unwrap_or_else(|| panic!("the device has no swapchain"))
    }

    /// Acquires the next presentable image.
    ///
    /// Returns `Ok(None)` if the swapchain is stale and must be rebuilt.
    pub fn acquire_swapchain_image(&mut self) -> RhiResult<Option<TextureHandle>> {
        let frame_index = self.frame_index;
        let swapchain = self.swapchain_state();
        assert!(
            swapchain.acquired.is_none(),
            "swapchain image acquired twice without a present"
        );
        let slot = (frame_index % swapchain.images.len() as u64) as u32;

        match self.backend.acquire_image(slot)? {
            Acquire::Image(image) => {
                let swapchain = self.swapchain_state();
                swapchain.acquired = Some(AcquiredImage {
                    image,
                    slot,
                    submitted: false,
                });
                Ok(Some(swapchain.images[image as usize]))
            }
            Acquire::Stale => {
                debug!("Swapchain is stale at acquire");
                Ok(None)
            }
        }
    }

    /// Presents the acquired image once the frame that rendered it has been
    /// submitted. Returns false if the swapchain is stale.
    pub fn present(&mut self) -> RhiResult<bool> {
        let acquired = self
            .swapchain_state()
            .acquired
            .take()
            .unwrap_or_else(|| panic!("present without an acquired swapchain image"));
        assert!(
            acquired.submitted,
            "present before the frame rendering the image was submitted"
        );

        let presented = self.backend.present(acquired.image, acquired.slot)?;
        self.frame_index += 1;
        if !presented {
            debug!("Swapchain is stale at present");
        }
        Ok(presented)
    }

    /// Waits for the GPU, then recreates the swapchain for a surface of
    /// `width` x `height`. Old swapchain texture handles become stale.
    pub fn rebuild_swapchain(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.wait_idle()?;
        self.unregister_swapchain();
        self.backend.rebuild_swapchain(width, height)?;
        self.register_swapchain()
    }

    pub fn swapchain_extent(&self) -> Option<(u32, u32)> {
        self.swapchain.as_ref().map(|s| s.extent)
    }

    pub fn swapchain_format(&self) -> Option<Format> {
        self.swapchain.as_ref().map(|s| s.format)
    }

    pub fn swapchain_image_count(&self) -> u32 {
        self.swapchain.as_ref().map_or(0, |s| s.images.len() as u32)
    }

    /// Frames presented so far.
    #[inline]
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    #[inline]
    pub fn frames_in_flight(&self) -> u32 {
        self.config.frames_in_flight
    }

    #[inline]
    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}

impl RingAllocator for Device {
    fn create_ring(&mut self, size: u64) -> RhiResult<BufferHandle> {
        debug!("Allocating {} byte scratch ring", size);
        self.create_buffer(BufferKind::UniformDynamic, size)
    }

    fn destroy_ring(&mut self, buffer: BufferHandle) {
        self.destroy_buffer(buffer);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(err) = self.backend.wait_idle() {
            warn!("Waiting for the GPU during device teardown failed: {}", err);
        }

        let contexts: Vec<ContextState> = self.contexts.drain().filter_map(|(_, s)| s).collect();
        for state in contexts {
            self.teardown_context(state);
        }
        for (_, pipeline) in self.pipelines.drain() {
            self.backend.destroy_pipeline(pipeline.raw);
        }
        for (_, framebuffer) in self.framebuffers.drain() {
            for view in framebuffer.color_views.into_iter().chain(framebuffer.depth_view) {
                self.backend.destroy_view(view);
            }
        }
        for (_, texture) in self.textures.drain() {
            for view in texture.mip_views {
                self.backend.destroy_view(view);
            }
            self.backend.destroy_view(texture.view);
            if !texture.external {
                self.backend.destroy_texture(texture.raw);
            }
        }
        for (_, sampler) in self.samplers.drain() {
            self.backend.destroy_sampler(sampler);
        }
        for (_, buffer) in self.buffers.drain() {
            self.backend.destroy_buffer(buffer.raw);
        }
        self.shaders.destroy_all(self.backend.as_mut());
        info!("Device destroyed");
    }
}
