//! Frame orchestration for lumen.
//!
//! This crate sits on top of the device layer:
//! - [`Renderer`]: ordered passes, tracked resources and the present loop
//! - [`Engine`]: rebuilds the passes when the swapchain goes stale
//! - [`EngineDefaults`]: fallback textures and full-screen geometry
//! - [`TextOverlay`]: the hook a debug console draws through

mod defaults;
mod engine;
mod overlay;
mod renderer;

pub use defaults::{EngineDefaults, FULLSCREEN_TRIANGLE};
pub use engine::{BuildFn, Engine};
pub use overlay::TextOverlay;
pub use renderer::{PassFn, Renderer};
