//! Shared foundations for the lumen crates.
//!
//! - Error types and result aliases
//! - Logging initialization, including the in-memory console sink
//! - Engine configuration loaded from TOML
//! - Frame timing

mod config;
mod error;
mod logging;
mod timer;

pub use config::{DescriptorPoolConfig, EngineConfig, SHADER_ROOT_ENV, default_shader_root};
pub use error::{Error, Result};
pub use logging::{ConsoleLayer, ConsoleLine, ConsoleLog, init_logging, init_logging_with_console};
pub use timer::FrameTimer;
