//! Descriptor tables, set layouts and binding slots.
//!
//! A compiled shader exposes every uniform, block member and resource it
//! declares as a [`DescriptorEntry`]. Entries are sorted by name hash, so
//! pass code resolves `"u_MVP"` with a binary search and never needs to know
//! the set, binding or block it lives in.

use std::ops::BitOr;

use crate::handle::{BufferHandle, SamplerHandle, TextureHandle};
use crate::hash::{NameHash, name_hash};
use crate::shader::ShaderError;

/// Descriptor sets a shader may use.
pub const MAX_SETS: usize = 4;
/// Bindings per descriptor set.
pub const MAX_BINDINGS: usize = 16;

/// Kind of resource behind a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Uniform block, realised as a dynamic uniform buffer so loose
    /// uniforms can be served from the scratch ring.
    UniformBuffer,
    StorageBuffer,
    SampledTexture,
    Sampler,
    StorageImage,
}

impl DescriptorKind {
    /// Whether shaders may write through this binding.
    #[inline]
    pub fn is_writable(self) -> bool {
        matches!(self, DescriptorKind::StorageBuffer | DescriptorKind::StorageImage)
    }
}

/// Set of shader stages, as a bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StageMask(u8);

impl StageMask {
    pub const VERTEX: Self = Self(1);
    pub const FRAGMENT: Self = Self(2);
    pub const COMPUTE: Self = Self(4);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for StageMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A named, addressable slot of a compiled shader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorEntry {
    pub hash: NameHash,
    pub name: String,
    pub set: u32,
    pub binding: u32,
    /// Byte offset inside the block; zero for the block itself and for
    /// non-block resources.
    pub offset: u32,
    /// Byte size of the member or block; zero for textures and samplers.
    pub size: u32,
    pub kind: DescriptorKind,
}

/// Descriptor entry before hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedDescriptor {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub offset: u32,
    pub size: u32,
    pub kind: DescriptorKind,
}

/// Sorted, collision-free lookup table from name hash to slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    entries: Vec<DescriptorEntry>,
}

impl DescriptorTable {
    /// Builds a table using [`name_hash`].
    pub fn build(named: Vec<NamedDescriptor>) -> Result<Self, ShaderError> {
        Self::build_with(named, name_hash)
    }

    /// Builds a table with a caller-supplied hash function.
    ///
    /// # Errors
    ///
    /// Returns [`ShaderError::HashCollision`] if two entries hash to the same
    /// value, including two entries with the same name.
    pub fn build_with(
        named: Vec<NamedDescriptor>,
        hasher: impl Fn(&str) -> NameHash,
    ) -> Result<Self, ShaderError> {
        let mut entries: Vec<DescriptorEntry> = named
            .into_iter()
            .map(|d| DescriptorEntry {
                hash: hasher(&d.name),
                name: d.name,
                set: d.set,
                binding: d.binding,
                offset: d.offset,
                size: d.size,
                kind: d.kind,
            })
            .collect();

        entries.sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.name.cmp(&b.name)));

        if let Some(pair) = entries.windows(2).find(|w| w[0].hash == w[1].hash) {
            return Err(ShaderError::HashCollision {
                first: pair[0].name.clone(),
                second: pair[1].name.clone(),
                hash: pair[0].hash,
            });
        }

        Ok(Self { entries })
    }

    /// Binary search by hash.
    pub fn find(&self, hash: NameHash) -> Option<&DescriptorEntry> {
        self.entries
            .binary_search_by_key(&hash, |e| e.hash)
            .ok()
            .map(|index| &self.entries[index])
    }

    pub fn find_name(&self, name: &str) -> Option<&DescriptorEntry> {
        self.find(name_hash(name))
    }

    pub fn entries(&self) -> &[DescriptorEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One binding of a descriptor-set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub stages: StageMask,
}

/// Structural description of a descriptor-set layout. Equal descriptions
/// share one GPU layout object across all shaders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SetLayoutDesc {
    /// Sorted by binding index.
    pub bindings: Vec<LayoutBinding>,
}

impl SetLayoutDesc {
    pub fn binding(&self, binding: u32) -> Option<&LayoutBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }

    /// Dynamic uniform bindings in binding order; this is the order dynamic
    /// offsets are supplied in.
    pub fn dynamic_bindings(&self) -> impl Iterator<Item = u32> + '_ {
        self.bindings
            .iter()
            .filter(|b| b.kind == DescriptorKind::UniformBuffer)
            .map(|b| b.binding)
    }
}

/// What a context has bound at one binding index.
///
/// The array of slots for a set is the descriptor-set cache key, so two
/// draws with identical slots share one GPU descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BindingSlot {
    #[default]
    Empty,
    /// Uniform block backed by a buffer; the start offset is supplied as a
    /// dynamic offset at bind time.
    Uniform { buffer: BufferHandle, range: u64 },
    Storage {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    /// Sampled texture, all levels.
    Texture { texture: TextureHandle },
    /// Storage image at one mip level.
    Image { texture: TextureHandle, mip: u32 },
    Sampler { sampler: SamplerHandle },
}

impl BindingSlot {
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, BindingSlot::Empty)
    }

    /// Kind of descriptor this slot can fill.
    pub fn kind(&self) -> Option<DescriptorKind> {
        match self {
            BindingSlot::Empty => None,
            BindingSlot::Uniform { .. } => Some(DescriptorKind::UniformBuffer),
            BindingSlot::Storage { .. } => Some(DescriptorKind::StorageBuffer),
            BindingSlot::Texture { .. } => Some(DescriptorKind::SampledTexture),
            BindingSlot::Image { .. } => Some(DescriptorKind::StorageImage),
            BindingSlot::Sampler { .. } => Some(DescriptorKind::Sampler),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(name: &str, offset: u32, size: u32) -> NamedDescriptor {
        NamedDescriptor {
            name: name.to_string(),
            set: 0,
            binding: 0,
            offset,
            size,
            kind: DescriptorKind::UniformBuffer,
        }
    }

    #[test]
    fn test_table_is_sorted_and_searchable() {
        let table = DescriptorTable::build(vec![
            uniform("Globals", 0, 80),
            uniform("u_MVP", 0, 64),
            uniform("u_Color", 64, 16),
        ])
        .unwrap();

        assert_eq!(table.len(), 3);
        assert!(table.entries().windows(2).all(|w| w[0].hash < w[1].hash));

        let color = table.find_name("u_Color").unwrap();
        assert_eq!(color.offset, 64);
        assert_eq!(color.size, 16);
        assert!(table.find_name("u_Missing").is_none());
    }

    #[test]
    fn test_real_hash_collision_is_rejected() {
        let err = DescriptorTable::build(vec![
            uniform("costarring", 0, 4),
            uniform("liquid", 4, 4),
        ])
        .unwrap_err();

        match err {
            ShaderError::HashCollision { hash, .. } => assert_eq!(hash, 0x5e4daa9d),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_injected_hasher_collision_is_rejected() {
        let err = DescriptorTable::build_with(
            vec![uniform("u_A", 0, 4), uniform("u_B", 4, 4)],
            |_| 7,
        )
        .unwrap_err();
        assert!(matches!(err, ShaderError::HashCollision { hash: 7, .. }));
    }

    #[test]
    fn test_duplicate_name_is_a_collision() {
        let err = DescriptorTable::build(vec![uniform("u_A", 0, 4), uniform("u_A", 16, 4)])
            .unwrap_err();
        assert!(matches!(err, ShaderError::HashCollision { .. }));
    }

    #[test]
    fn test_stage_mask() {
        let mask = StageMask::VERTEX | StageMask::FRAGMENT;
        assert!(mask.contains(StageMask::VERTEX));
        assert!(!mask.contains(StageMask::COMPUTE));
    }

    #[test]
    fn test_dynamic_bindings_order() {
        let layout = SetLayoutDesc {
            bindings: vec![
                LayoutBinding {
                    binding: 0,
                    kind: DescriptorKind::UniformBuffer,
                    stages: StageMask::VERTEX,
                },
                LayoutBinding {
                    binding: 1,
                    kind: DescriptorKind::SampledTexture,
                    stages: StageMask::FRAGMENT,
                },
                LayoutBinding {
                    binding: 3,
                    kind: DescriptorKind::UniformBuffer,
                    stages: StageMask::FRAGMENT,
                },
            ],
        };
        assert_eq!(layout.dynamic_bindings().collect::<Vec<_>>(), vec![0, 3]);
    }
}
