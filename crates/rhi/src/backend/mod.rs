//! GPU backend abstraction.
//!
//! The [`Device`](crate::device::Device) talks to the GPU through a single
//! [`GpuBackend`] trait object chosen when the device is constructed. Objects
//! on the backend side are named by plain 64-bit ids ([`RawBuffer`],
//! [`RawTexture`], ...); the device maps its generation-checked handles onto
//! them. Commands are recorded as the closed [`Command`] enum, which each
//! backend translates with a single `match`.
//!
//! Two backends ship with the crate:
//!
//! - [`VulkanBackend`]: ash + gpu-allocator, Vulkan 1.3 dynamic rendering.
//! - [`HeadlessBackend`]: CPU images and buffers with an inspectable event
//!   log, used by tests and tools that run without a GPU.

pub mod command;
pub mod headless;
pub mod vulkan;

pub use command::{ColorTarget, Command, DepthTarget, SubresourceRange, Viewport};
pub use headless::{HeadlessBackend, HeadlessEvent, HeadlessProbe, HeadlessStats, LayoutMismatch};
pub use vulkan::VulkanBackend;

use crate::buffer::BufferKind;
use crate::descriptor::SetLayoutDesc;
use crate::error::RhiResult;
use crate::framebuffer::RenderTargetDesc;
use crate::pipeline::{
    ColorBlend, CompareOp, CullMode, FrontFace, PolygonMode, PrimitiveTopology, VertexLayout,
};
use crate::sampler::SamplerSettings;
use crate::shader::ShaderStage;
use crate::texture::{Format, ImageLayout, TextureSettings, ViewDesc};
use lumen_core::DescriptorPoolConfig;

macro_rules! raw_handles {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
            pub struct $name(pub u64);

            impl $name {
                pub const NULL: Self = Self(0);

                #[inline]
                pub fn is_null(self) -> bool {
                    self.0 == 0
                }
            }
        )*
    };
}

raw_handles!(
    /// Backend buffer object.
    RawBuffer,
    /// Backend image object.
    RawTexture,
    /// Backend image view.
    RawView,
    RawSampler,
    RawShaderModule,
    RawSetLayout,
    RawPipelineLayout,
    RawPipeline,
    /// A command stream: command buffer, completion fence and descriptor pool.
    RawStream,
    /// A descriptor set allocated from a stream's pool.
    RawDescriptorSet,
);

/// Limits the device layer has to respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Alignment of dynamic uniform offsets.
    pub min_uniform_alignment: u64,
    /// Alignment of storage buffer offsets.
    pub min_storage_alignment: u64,
    pub max_color_attachments: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_alignment: 256,
            min_storage_alignment: 256,
            max_color_attachments: 8,
        }
    }
}

/// Fixed-function and shader state of a graphics pipeline.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc<'a> {
    pub label: &'a str,
    pub vertex: RawShaderModule,
    pub fragment: RawShaderModule,
    pub layout: RawPipelineLayout,
    pub target: &'a RenderTargetDesc,
    pub vertex_layout: &'a VertexLayout,
    pub topology: PrimitiveTopology,
    pub polygon_mode: PolygonMode,
    pub cull: CullMode,
    pub front_face: FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: CompareOp,
    pub blend: ColorBlend,
}

#[derive(Debug, Clone, Copy)]
pub struct ComputePipelineDesc<'a> {
    pub label: &'a str,
    pub module: RawShaderModule,
    pub layout: RawPipelineLayout,
}

/// Resource written into one descriptor binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorResource {
    /// Dynamic uniform buffer; the offset arrives at bind time.
    Uniform { buffer: RawBuffer, range: u64 },
    Storage {
        buffer: RawBuffer,
        offset: u64,
        range: u64,
    },
    /// `layout` is the texture's resting layout, the one it is sampled in.
    SampledTexture { view: RawView, layout: ImageLayout },
    StorageImage { view: RawView },
    Sampler { sampler: RawSampler },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub resource: DescriptorResource,
}

/// How a submission synchronizes with the swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitSync {
    /// No external wait; only the stream's fence is signaled.
    None,
    /// Wait on the slot's "acquired" semaphore and signal its "ready"
    /// semaphore.
    Swapchain { slot: u32 },
}

/// Presentable images of the current swapchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub format: Format,
    pub extent: (u32, u32),
    pub images: Vec<RawTexture>,
}

/// Result of a swapchain acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Image(u32),
    /// The swapchain no longer matches the surface and must be rebuilt.
    Stale,
}

/// Native GPU operations the device is built on.
///
/// Creation and submission return [`RhiResult`]; recording is infallible.
/// Ids passed in were produced by the same backend and have not been
/// destroyed.
pub trait GpuBackend {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    fn limits(&self) -> DeviceLimits;

    // Buffers

    /// Creates a host-visible, persistently mapped buffer of exactly `size`
    /// bytes.
    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> RhiResult<RawBuffer>;
    fn destroy_buffer(&mut self, buffer: RawBuffer);
    /// The buffer's mapped bytes.
    fn mapped(&mut self, buffer: RawBuffer) -> RhiResult<&mut [u8]>;
    /// Makes host writes in `offset..offset + size` visible to the GPU.
    fn flush_buffer(&mut self, buffer: RawBuffer, offset: u64, size: u64) -> RhiResult<()>;
    /// Makes GPU writes in `offset..offset + size` visible to the host.
    fn invalidate_buffer(&mut self, buffer: RawBuffer, offset: u64, size: u64) -> RhiResult<()>;

    // Textures

    /// Creates a device-local image in the `Undefined` layout.
    fn create_texture(&mut self, settings: &TextureSettings) -> RhiResult<RawTexture>;
    fn destroy_texture(&mut self, texture: RawTexture);
    fn create_view(&mut self, texture: RawTexture, desc: &ViewDesc) -> RhiResult<RawView>;
    fn destroy_view(&mut self, view: RawView);
    fn create_sampler(&mut self, settings: &SamplerSettings) -> RhiResult<RawSampler>;
    fn destroy_sampler(&mut self, sampler: RawSampler);

    // Shaders and pipelines

    /// Creates a module from SPIR-V whose entry point is `main`.
    fn create_shader_module(
        &mut self,
        stage: ShaderStage,
        spirv: &[u32],
    ) -> RhiResult<RawShaderModule>;
    fn destroy_shader_module(&mut self, module: RawShaderModule);
    fn create_set_layout(&mut self, desc: &SetLayoutDesc) -> RhiResult<RawSetLayout>;
    fn destroy_set_layout(&mut self, layout: RawSetLayout);
    fn create_pipeline_layout(&mut self, sets: &[RawSetLayout]) -> RhiResult<RawPipelineLayout>;
    fn destroy_pipeline_layout(&mut self, layout: RawPipelineLayout);
    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>)
    -> RhiResult<RawPipeline>;
    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc<'_>) -> RhiResult<RawPipeline>;
    fn destroy_pipeline(&mut self, pipeline: RawPipeline);

    // Command streams

    /// Creates a stream whose fence starts signaled.
    fn create_stream(&mut self, pool: &DescriptorPoolConfig) -> RhiResult<RawStream>;
    fn destroy_stream(&mut self, stream: RawStream);
    /// Blocks until the stream's last submission has completed.
    fn wait_stream(&mut self, stream: RawStream) -> RhiResult<()>;
    /// Resets the command buffer and descriptor pool and begins recording.
    /// The caller must have waited on the stream first.
    fn begin_stream(&mut self, stream: RawStream) -> RhiResult<()>;
    fn allocate_descriptor_set(
        &mut self,
        stream: RawStream,
        layout: RawSetLayout,
    ) -> RhiResult<RawDescriptorSet>;
    fn write_descriptor_set(&mut self, set: RawDescriptorSet, writes: &[DescriptorWrite]);
    fn record(&mut self, stream: RawStream, command: &Command);
    fn end_stream(&mut self, stream: RawStream) -> RhiResult<()>;
    fn submit(&mut self, stream: RawStream, sync: SubmitSync) -> RhiResult<()>;

    /// Blocks until all submitted work has completed.
    fn wait_idle(&mut self) -> RhiResult<()>;

    // Swapchain

    /// The current swapchain, or `None` for a backend without a surface.
    fn swapchain(&self) -> Option<SwapchainDesc>;
    /// Acquires the next image, signaling the slot's "acquired" semaphore.
    fn acquire_image(&mut self, slot: u32) -> RhiResult<Acquire>;
    /// Presents `image` after the slot's "ready" semaphore. Returns false if
    /// the swapchain is stale.
    fn present(&mut self, image: u32, slot: u32) -> RhiResult<bool>;
    /// Recreates the swapchain for a surface of `width` x `height`. Previous
    /// image ids become invalid.
    fn rebuild_swapchain(&mut self, width: u32, height: u32) -> RhiResult<()>;
}
