//! GPU device layer of the lumen render graph.
//!
//! This crate owns every GPU object and the recording of work against them:
//! - [`Device`]: resource arenas, the swapchain and frame pacing
//! - [`Context`]: command recording with automatic image layout tracking,
//!   name-based resource binding and scratch uniform memory
//! - [`ShaderCache`]: GLSL compilation through naga, reflection into a
//!   [`DescriptorTable`], content-addressed sharing and hot reload
//! - [`backend`]: the [`GpuBackend`] seam with a Vulkan implementation and a
//!   headless one for tests and tools

mod error;
mod hash;
mod scratch;

pub mod backend;
pub mod buffer;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod framebuffer;
pub mod handle;
pub mod pipeline;
pub mod sampler;
pub mod shader;
pub mod texture;

pub use backend::{GpuBackend, HeadlessBackend, VulkanBackend};
pub use buffer::{BufferKind, IndexType};
pub use context::{Context, ContextStats};
pub use descriptor::{DescriptorKind, DescriptorTable, NamedDescriptor, StageMask};
pub use device::{Device, DeviceConfig};
pub use error::{RhiError, RhiResult};
pub use framebuffer::{Attachment, ClearValues, FramebufferSettings, LoadOp};
pub use handle::{
    BufferHandle, ContextHandle, FramebufferHandle, PipelineHandle, SamplerHandle, ShaderHandle,
    TextureHandle,
};
pub use hash::{NameHash, name_hash};
pub use pipeline::{
    BlendMode, CompareOp, CullMode, FrontFace, PipelineSettings, PipelineTarget, PolygonMode,
    PrimitiveTopology, VertexFormat, VertexLayout,
};
pub use sampler::{AddressMode, Filter, SamplerSettings};
pub use scratch::ScratchSlice;
pub use shader::{
    FileResolver, MemoryResolver, ShaderCache, ShaderError, ShaderResolver, ShaderStage,
};
pub use texture::{Format, ImageLayout, TextureSettings, TextureShape, TextureUsage};

pub use ash::vk;
