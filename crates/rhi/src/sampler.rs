//! Sampler descriptions.

use crate::pipeline::CompareOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerSettings {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mip_filter: Filter,
    pub address_mode: AddressMode,
    /// Maximum anisotropy, or `None` to disable anisotropic filtering.
    pub anisotropy: Option<u8>,
    /// Depth comparison for shadow samplers.
    pub compare: Option<CompareOp>,
}

impl Default for SamplerSettings {
    /// Trilinear, repeating, no anisotropy. This is also the sampler the
    /// device binds to sampler slots nobody filled.
    fn default() -> Self {
        Self {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            mip_filter: Filter::Linear,
            address_mode: AddressMode::Repeat,
            anisotropy: None,
            compare: None,
        }
    }
}

impl SamplerSettings {
    pub fn nearest_clamp() -> Self {
        Self {
            mag_filter: Filter::Nearest,
            min_filter: Filter::Nearest,
            mip_filter: Filter::Nearest,
            address_mode: AddressMode::ClampToEdge,
            ..Default::default()
        }
    }
}
