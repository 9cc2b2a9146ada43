//! Byte buffers.
//!
//! A [`Buffer`] is an immutable, reference-counted byte span. The caller and
//! every pipeline entry that references it share the same allocation; it is
//! freed once the last holder (usually the write completion) lets go.
//!
//! Read buffers come from a [`BufferAllocator`]. The engine only relies on the
//! acquire/release pair; how memory is pooled is up to the implementation.

use bytes::{Bytes, BytesMut};

/// Immutable shared byte span handed to and from the engine.
pub type Buffer = Bytes;

/// Source of read buffers.
pub trait BufferAllocator: Send + Sync + 'static {
    /// Buffer with at least `size` bytes of spare capacity.
    fn acquire(&self, size: usize) -> BytesMut;

    /// Give a buffer back once its owner is done with it.
    fn release(&self, buf: BytesMut) {
        drop(buf);
    }
}

/// Allocator that goes straight to the heap and frees on release.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn acquire(&self, size: usize) -> BytesMut {
        BytesMut::with_capacity(size)
    }
}

/// Split the filled part off `buf` as a [`Buffer`] and make room for the next
/// read of `size` bytes.
///
/// When the previous chunk has already been dropped by its consumer the
/// original allocation is reclaimed instead of growing.
pub(crate) fn take_filled(buf: &mut BytesMut, size: usize) -> Buffer {
    let chunk = buf.split().freeze();
    buf.reserve(size);
    chunk
}
