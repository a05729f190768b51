//! GPU error types.

use thiserror::Error;

use crate::allocator::BufferHandle;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[cfg(feature = "vulkan")]
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),

    /// Device buffer creation failed.
    #[error("Buffer creation failed: {0}")]
    AllocationFailed(String),

    /// Queue write failed.
    #[error("Buffer write failed: {0}")]
    WriteFailed(String),

    /// Handle is not leased from this allocator (never allocated, released or destroyed).
    #[error("Unknown or inactive buffer: {0:?}")]
    UnknownBuffer(BufferHandle),

    /// Write does not fit inside the buffer.
    #[error("Write of {len} bytes at offset {offset} exceeds buffer size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    /// Handle used with the wrong pool.
    #[error("Buffer {0:?} used as the wrong kind")]
    WrongKind(BufferHandle),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
