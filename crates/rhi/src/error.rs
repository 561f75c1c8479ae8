//! Errors surfaced by the device and its backends.

use thiserror::Error;

use crate::shader::ShaderError;
use crate::texture::Format;

#[derive(Error, Debug)]
pub enum RhiError {
    /// A Vulkan call returned a failure code.
    #[error("vulkan call failed: {0}")]
    VulkanError(#[from] ash::vk::Result),

    #[error("vulkan loader unavailable: {0}")]
    LoadingError(#[from] ash::LoadingError),

    #[error("gpu memory allocation failed: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// The window would not hand out its raw display or window handle.
    #[error("window handle unavailable: {0}")]
    HandleError(#[from] raw_window_handle::HandleError),

    /// No enumerated GPU passed selection.
    #[error("no GPU with graphics and present queues, anisotropy and Vulkan 1.3")]
    NoSuitableGpu,

    #[error("surface: {0}")]
    SurfaceError(String),

    #[error("swapchain: {0}")]
    SwapchainError(String),

    /// The backend cannot use `format` the way `usage` describes.
    #[error("{format:?} cannot be used as {usage}")]
    UnsupportedFormat { format: Format, usage: &'static str },

    #[error("pipeline: {0}")]
    PipelineError(String),

    /// Source, preprocessing, compilation or reflection failure.
    #[error(transparent)]
    Shader(#[from] ShaderError),
}

pub type RhiResult<T> = std::result::Result<T, RhiError>;
