//! GPU buffer management for the Terrastream engine.
//!
//! This crate provides:
//! - The minimal device surface the streaming core needs (`GpuDevice`)
//! - A headless in-memory device for tests and tooling
//! - A Vulkan device backed by gpu-allocator
//! - Pooled vertex/index buffer allocation (`BufferAllocator`)

pub mod allocator;
pub mod device;
pub mod error;
pub mod headless;
#[cfg(feature = "vulkan")]
pub mod memory;

pub use allocator::{
    AllocatorConfig, AllocatorStats, BufferAllocator, BufferHandle, BufferKind, MemoryUsage,
    PoolStats,
};
pub use device::{BufferUsage, GpuDevice};
pub use error::{GpuError, Result};
pub use headless::{HeadlessBuffer, HeadlessDevice};
#[cfg(feature = "vulkan")]
pub use memory::{GpuBuffer, VulkanDevice};
