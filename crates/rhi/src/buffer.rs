//! Linear GPU allocations.
//!
//! Every buffer is host-visible and persistently mapped, so uploads write
//! straight into the allocation. All writes are bounds-checked against the
//! declared capacity.

use std::fmt;

use crate::backend::RawBuffer;

/// What a buffer is bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Vertex buffer
    Vertex,
    /// Index buffer
    Index,
    /// Uniform buffer bound at a fixed offset
    Uniform,
    /// Uniform buffer addressed with dynamic offsets (scratch rings)
    UniformDynamic,
    /// Shader storage buffer
    Storage,
    /// Transfer source/destination for texture uploads and readback
    Staging,
}

impl BufferKind {
    /// Returns a human-readable name for the kind.
    pub fn name(self) -> &'static str {
        match self {
            BufferKind::Vertex => "Vertex",
            BufferKind::Index => "Index",
            BufferKind::Uniform => "Uniform",
            BufferKind::UniformDynamic => "UniformDynamic",
            BufferKind::Storage => "Storage",
            BufferKind::Staging => "Staging",
        }
    }

    /// Whether the buffer can back a uniform descriptor.
    #[inline]
    pub fn is_uniform(self) -> bool {
        matches!(self, BufferKind::Uniform | BufferKind::UniformDynamic)
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Element type of an index buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexType {
    U16,
    #[default]
    U32,
}

/// Device-side record of a buffer.
#[derive(Debug)]
pub(crate) struct Buffer {
    pub raw: RawBuffer,
    pub kind: BufferKind,
    pub size: u64,
}

impl Buffer {
    /// Panics unless `offset..offset + len` lies inside the buffer.
    pub fn assert_range(&self, operation: &str, offset: u64, len: u64) {
        assert!(
            fits(self.size, offset, len),
            "{} out of bounds: offset {} + size {} exceeds {} buffer capacity {}",
            operation,
            offset,
            len,
            self.kind,
            self.size
        );
    }
}

/// Returns true if `offset + len <= capacity` without overflowing.
#[inline]
pub fn fits(capacity: u64, offset: u64, len: u64) -> bool {
    offset
        .checked_add(len)
        .is_some_and(|end| end <= capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_kind_name() {
        assert_eq!(BufferKind::Vertex.name(), "Vertex");
        assert_eq!(BufferKind::UniformDynamic.to_string(), "UniformDynamic");
        assert!(BufferKind::UniformDynamic.is_uniform());
        assert!(!BufferKind::Storage.is_uniform());
    }

    #[test]
    fn test_fits() {
        assert!(fits(256, 0, 256));
        assert!(fits(256, 255, 1));
        assert!(fits(256, 256, 0));
        assert!(!fits(256, 255, 2));
        assert!(!fits(256, 1, 256));
        assert!(!fits(256, u64::MAX, 2));
    }

    #[test]
    #[should_panic(expected = "upload out of bounds")]
    fn test_assert_range_trips() {
        let buffer = Buffer {
            raw: RawBuffer(1),
            kind: BufferKind::Vertex,
            size: 64,
        };
        buffer.assert_range("upload", 32, 64);
    }
}
