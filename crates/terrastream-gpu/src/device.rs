//! Device surface required by the buffer allocator.

use bitflags::bitflags;

use crate::error::Result;

bitflags! {
    /// Usage flags for device buffers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const COPY_DST = 1 << 2;
    }
}

/// The subset of a graphics device the streaming core touches.
///
/// Writes are fire-and-forget: ordering relative to rendering comes from the
/// device's own queue submission order.
pub trait GpuDevice: Send + Sync {
    /// Device buffer object.
    type Buffer: Send;

    /// Create a buffer of `size` bytes.
    fn create_buffer(&self, size: u64, usage: BufferUsage, label: &str) -> Result<Self::Buffer>;

    /// Enqueue a write of `data` at byte `offset`.
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    /// Release the underlying device resource.
    fn destroy_buffer(&self, buffer: Self::Buffer);
}
