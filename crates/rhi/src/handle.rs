//! Generation-checked handles to device-owned resources.
//!
//! The [`Device`](crate::device::Device) is the only owner of GPU objects.
//! Everything else holds one of these keys, which stay `Copy` and cheap to
//! capture in pass closures. Looking up a destroyed handle fails instead of
//! aliasing whatever reused the slot.

use slotmap::new_key_type;

new_key_type! {
    /// Handle to a linear GPU allocation.
    pub struct BufferHandle;
    /// Handle to a GPU image and its default view.
    pub struct TextureHandle;
    /// Handle to a sampler object.
    pub struct SamplerHandle;
    /// Handle to an immutable set of render-pass attachments.
    pub struct FramebufferHandle;
    /// Handle to a graphics or compute pipeline.
    pub struct PipelineHandle;
    /// Handle to a compiled, reference-counted shader program.
    pub struct ShaderHandle;
    /// Handle to a command recording context.
    pub struct ContextHandle;
}
