//! Engine configuration.
//!
//! Every field has a default, so a TOML file only needs to name what it
//! overrides:
//!
//! ```toml
//! frames_in_flight = 2
//! shader_root = "assets/shaders"
//!
//! [descriptor_pool]
//! max_sets = 2048
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable consulted for the shader root directory.
pub const SHADER_ROOT_ENV: &str = "LUMEN_SHADER_ROOT";

/// Shader root used when neither the config nor the environment names one.
pub fn default_shader_root() -> PathBuf {
    std::env::var_os(SHADER_ROOT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("shaders"))
}

/// Sizes of the per-context descriptor pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorPoolConfig {
    /// Maximum descriptor sets allocated per context per frame.
    pub max_sets: u32,
    /// Descriptors reserved for each descriptor type.
    pub per_type: u32,
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        Self {
            max_sets: 1024,
            per_type: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of contexts rotated across frames.
    pub frames_in_flight: u32,
    /// Bytes per scratch uniform ring buffer.
    pub scratch_ring_size: u64,
    /// Enable the Khronos validation layer.
    pub validation: bool,
    pub vsync: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shader_root: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub descriptor_pool: DescriptorPoolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            scratch_ring_size: 256 * 1024,
            validation: cfg!(debug_assertions),
            vsync: true,
            shader_root: None,
            width: 1280,
            height: 720,
            descriptor_pool: DescriptorPoolConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads and validates a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=8).contains(&self.frames_in_flight) {
            return Err(Error::InvalidConfig {
                field: "frames_in_flight",
                reason: format!("{} is outside 1..=8", self.frames_in_flight),
            });
        }
        if self.scratch_ring_size < 4096 {
            return Err(Error::InvalidConfig {
                field: "scratch_ring_size",
                reason: format!("{} bytes is below the 4096 byte minimum", self.scratch_ring_size),
            });
        }
        if self.descriptor_pool.max_sets == 0 || self.descriptor_pool.per_type == 0 {
            return Err(Error::InvalidConfig {
                field: "descriptor_pool",
                reason: "pool sizes must be non-zero".to_string(),
            });
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidConfig {
                field: "width/height",
                reason: format!("{}x{} is empty", self.width, self.height),
            });
        }
        Ok(())
    }

    /// Directory shaders are resolved from: the configured root, then
    /// `LUMEN_SHADER_ROOT`, then `./shaders`.
    pub fn shader_root(&self) -> PathBuf {
        self.shader_root.clone().unwrap_or_else(default_shader_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.descriptor_pool.max_sets, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            frames_in_flight = 2
            shader_root = "assets/shaders"

            [descriptor_pool]
            max_sets = 64
            "#,
        )
        .unwrap();

        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.shader_root(), PathBuf::from("assets/shaders"));
        assert_eq!(config.descriptor_pool.max_sets, 64);
        assert_eq!(config.descriptor_pool.per_type, 4096);
        assert_eq!(config.scratch_ring_size, 256 * 1024);
    }

    #[test]
    fn test_invalid_frames_in_flight() {
        let err = EngineConfig::from_toml_str("frames_in_flight = 0").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidConfig {
                field: "frames_in_flight",
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_toml() {
        let err = EngineConfig::from_toml_str("frames_in_flight = ").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lumen.toml");
        let config = EngineConfig {
            vsync: false,
            width: 640,
            height: 480,
            ..Default::default()
        };
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
