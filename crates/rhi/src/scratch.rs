//! Per-context ring of transient uniform memory.
//!
//! Loose uniform values written between two draws land in an aligned slice
//! of the ring. The cursor only moves forward while a context records, so
//! two slices handed out in the same recording never overlap. When a slice
//! does not fit, the current buffer is retired (the GPU may still read it
//! this frame) and a fresh one takes its place. Retired buffers are
//! destroyed on the context's next `begin`, after its fence has been waited
//! on.

use crate::error::RhiResult;
use crate::handle::BufferHandle;

/// Creates and destroys the buffers a ring lives in.
pub(crate) trait RingAllocator {
    fn create_ring(&mut self, size: u64) -> RhiResult<BufferHandle>;
    fn destroy_ring(&mut self, buffer: BufferHandle);
}

/// One allocation from the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchSlice {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ScratchRing {
    current: Option<BufferHandle>,
    capacity: u64,
    cursor: u64,
    alignment: u64,
    retired: Vec<BufferHandle>,
    /// Buffers created over the ring's lifetime.
    created: u64,
}

#[inline]
fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

impl ScratchRing {
    pub fn new(capacity: u64, alignment: u64) -> Self {
        assert!(alignment.is_power_of_two(), "ring alignment must be a power of two");
        Self {
            capacity,
            alignment,
            ..Default::default()
        }
    }

    /// Hands out `size` bytes at an aligned offset, replacing the buffer if
    /// the slice does not fit behind the cursor.
    pub fn allocate(
        &mut self,
        allocator: &mut impl RingAllocator,
        size: u64,
    ) -> RhiResult<ScratchSlice> {
        let size = size.max(1);
        let mut offset = align_up(self.cursor, self.alignment);

        let buffer = match self.current {
            Some(buffer) if offset + size <= self.capacity => buffer,
            _ => {
                if let Some(full) = self.current.take() {
                    self.retired.push(full);
                }
                self.capacity = self.capacity.max(align_up(size, self.alignment));
                let buffer = allocator.create_ring(self.capacity)?;
                self.current = Some(buffer);
                self.created += 1;
                offset = 0;
                buffer
            }
        };

        self.cursor = offset + size;
        Ok(ScratchSlice {
            buffer,
            offset,
            size,
        })
    }

    /// Rewinds the cursor and frees retired buffers. Only valid once the GPU
    /// has finished with everything allocated since the last reset.
    pub fn reset(&mut self, allocator: &mut impl RingAllocator) {
        self.cursor = 0;
        for buffer in self.retired.drain(..) {
            allocator.destroy_ring(buffer);
        }
    }

    /// Frees every buffer.
    pub fn destroy(&mut self, allocator: &mut impl RingAllocator) {
        self.reset(allocator);
        if let Some(buffer) = self.current.take() {
            allocator.destroy_ring(buffer);
        }
    }

    #[inline]
    pub fn buffers_created(&self) -> u64 {
        self.created
    }

    #[inline]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[derive(Default)]
    struct FakeAllocator {
        live: SlotMap<BufferHandle, u64>,
        destroyed: usize,
    }

    impl RingAllocator for FakeAllocator {
        fn create_ring(&mut self, size: u64) -> RhiResult<BufferHandle> {
            Ok(self.live.insert(size))
        }

        fn destroy_ring(&mut self, buffer: BufferHandle) {
            self.live.remove(buffer);
            self.destroyed += 1;
        }
    }

    #[test]
    fn test_slices_are_aligned_and_disjoint() {
        let mut allocator = FakeAllocator::default();
        let mut ring = ScratchRing::new(1024, 256);

        let a = ring.allocate(&mut allocator, 80).unwrap();
        let b = ring.allocate(&mut allocator, 16).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
        assert_eq!(a.buffer, b.buffer);
        assert!(a.offset + a.size <= b.offset);
    }

    #[test]
    fn test_wrap_allocates_a_fresh_buffer() {
        let mut allocator = FakeAllocator::default();
        let mut ring = ScratchRing::new(1024, 256);

        let slices: Vec<_> = (0..5)
            .map(|_| ring.allocate(&mut allocator, 200).unwrap())
            .collect();
        assert_eq!(ring.buffers_created(), 2);
        assert_eq!(slices[4].offset, 0);
        assert_ne!(slices[3].buffer, slices[4].buffer);

        // No two slices in the same buffer overlap.
        for (i, a) in slices.iter().enumerate() {
            for b in &slices[i + 1..] {
                if a.buffer == b.buffer {
                    assert!(a.offset + a.size <= b.offset || b.offset + b.size <= a.offset);
                }
            }
        }

        // The full buffer stays alive until the next reset.
        assert_eq!(allocator.live.len(), 2);
        ring.reset(&mut allocator);
        assert_eq!(allocator.live.len(), 1);
        assert_eq!(ring.cursor(), 0);
    }

    #[test]
    fn test_oversized_slice_grows_the_ring() {
        let mut allocator = FakeAllocator::default();
        let mut ring = ScratchRing::new(512, 256);
        let slice = ring.allocate(&mut allocator, 1000).unwrap();
        assert_eq!(slice.offset, 0);
        assert_eq!(ring.capacity(), 1024);
        assert_eq!(allocator.live[slice.buffer], 1024);
    }

    #[test]
    fn test_destroy_frees_everything() {
        let mut allocator = FakeAllocator::default();
        let mut ring = ScratchRing::new(256, 256);
        ring.allocate(&mut allocator, 256).unwrap();
        ring.allocate(&mut allocator, 256).unwrap();
        ring.destroy(&mut allocator);
        assert!(allocator.live.is_empty());
        assert_eq!(allocator.destroyed, 2);
    }
}
