//! Pooled vertex and index buffer allocation.
//!
//! Buffers are leased from one pool per [`BufferKind`]. Releasing a buffer
//! keeps its device memory around for reuse; only aging out, emergency
//! cleanup or teardown gives memory back to the device. A buffer's life:
//!
//! ```text
//! Created(in use) -> Released(available) -> Reused(in use)
//!                                        -> Aged out (destroyed)
//!                                        -> Emergency (destroyed)
//! ```
//!
//! Handles are never recycled, so a destroyed handle can't alias a new buffer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytemuck::Pod;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::device::{BufferUsage, GpuDevice};
use crate::error::{GpuError, Result};

/// Which pool a buffer belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
}

impl BufferKind {
    fn usage(self) -> BufferUsage {
        match self {
            Self::Vertex => BufferUsage::VERTEX | BufferUsage::COPY_DST,
            Self::Index => BufferUsage::INDEX | BufferUsage::COPY_DST,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Vertex => "tile-vertex",
            Self::Index => "tile-index",
        }
    }
}

/// Opaque handle to a pooled buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    id: u64,
    kind: BufferKind,
}

impl BufferHandle {
    /// Pool this handle belongs to.
    pub fn kind(self) -> BufferKind {
        self.kind
    }
}

/// Allocator configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Requests smaller than this are rounded up.
    pub min_buffer_size: u64,
    /// Default age after which an available buffer is destroyed by cleanup.
    pub max_buffer_age: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            min_buffer_size: 64 * 1024,
            max_buffer_age: Duration::from_secs(30),
        }
    }
}

impl AllocatorConfig {
    /// Set the minimum buffer size.
    pub fn with_min_buffer_size(mut self, bytes: u64) -> Self {
        self.min_buffer_size = bytes;
        self
    }

    /// Set the default cleanup age.
    pub fn with_max_buffer_age(mut self, age: Duration) -> Self {
        self.max_buffer_age = age;
        self
    }
}

struct PoolEntry<B> {
    raw: B,
    size: u64,
    /// Time of the most recent lease.
    leased_at: Instant,
}

struct BufferPool<B> {
    in_use: HashMap<u64, PoolEntry<B>>,
    available: HashMap<u64, PoolEntry<B>>,
    reuse_hits: u64,
    misses: u64,
}

impl<B> BufferPool<B> {
    fn new() -> Self {
        Self {
            in_use: HashMap::new(),
            available: HashMap::new(),
            reuse_hits: 0,
            misses: 0,
        }
    }

    /// Smallest available buffer whose size lies in `size..=2 * size`.
    fn find_reusable(&self, size: u64) -> Option<u64> {
        let upper = size.saturating_mul(2);
        self.available
            .iter()
            .filter(|(_, entry)| entry.size >= size && entry.size <= upper)
            .min_by_key(|(id, entry)| (entry.size, **id))
            .map(|(id, _)| *id)
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            in_use_count: self.in_use.len(),
            in_use_bytes: self.in_use.values().map(|e| e.size).sum(),
            available_count: self.available.len(),
            available_bytes: self.available.values().map(|e| e.size).sum(),
            reuse_hits: self.reuse_hits,
            misses: self.misses,
        }
    }
}

/// Aggregate memory usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Bytes held on the device, leased or not.
    pub total_allocated_bytes: u64,
    pub in_use_bytes: u64,
    pub available_bytes: u64,
    pub buffer_count: usize,
}

impl MemoryUsage {
    /// Total allocated memory in MiB.
    pub fn total_mb(&self) -> f64 {
        self.total_allocated_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Per-pool statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub in_use_count: usize,
    pub in_use_bytes: u64,
    pub available_count: usize,
    pub available_bytes: u64,
    /// Allocations served from the available set.
    pub reuse_hits: u64,
    /// Allocations that created a new device buffer.
    pub misses: u64,
}

/// Detailed allocator statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub usage: MemoryUsage,
    pub vertex: PoolStats,
    pub index: PoolStats,
}

/// Pools device buffers by kind and reuses them across tiles.
///
/// Owned by the orchestrating thread; all methods take `&mut self` except
/// reporting.
pub struct BufferAllocator<D: GpuDevice> {
    device: Arc<D>,
    config: AllocatorConfig,
    vertex: BufferPool<D::Buffer>,
    index: BufferPool<D::Buffer>,
    total_allocated: u64,
    next_id: u64,
}

impl<D: GpuDevice> BufferAllocator<D> {
    /// Create an allocator on top of `device`.
    pub fn new(device: Arc<D>, config: AllocatorConfig) -> Self {
        Self {
            device,
            config,
            vertex: BufferPool::new(),
            index: BufferPool::new(),
            total_allocated: 0,
            next_id: 0,
        }
    }

    /// The device buffers are created on.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Allocator configuration.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Lease a vertex buffer of at least `size` bytes.
    pub fn allocate_vertex_buffer(&mut self, size: u64) -> Result<BufferHandle> {
        self.allocate(BufferKind::Vertex, size)
    }

    /// Lease an index buffer of at least `size` bytes.
    pub fn allocate_index_buffer(&mut self, size: u64) -> Result<BufferHandle> {
        self.allocate(BufferKind::Index, size)
    }

    fn allocate(&mut self, kind: BufferKind, size: u64) -> Result<BufferHandle> {
        let size = size.max(self.config.min_buffer_size);
        let now = Instant::now();

        let pool = match kind {
            BufferKind::Vertex => &mut self.vertex,
            BufferKind::Index => &mut self.index,
        };

        if let Some(id) = pool.find_reusable(size) {
            if let Some(mut entry) = pool.available.remove(&id) {
                trace!(?kind, id, size = entry.size, requested = size, "Reusing pooled buffer");
                entry.leased_at = now;
                pool.in_use.insert(id, entry);
                pool.reuse_hits += 1;
                return Ok(BufferHandle { id, kind });
            }
        }

        let raw = self.device.create_buffer(size, kind.usage(), kind.label())?;
        self.next_id += 1;
        let id = self.next_id;
        pool.in_use.insert(
            id,
            PoolEntry {
                raw,
                size,
                leased_at: now,
            },
        );
        pool.misses += 1;
        self.total_allocated += size;
        debug!(?kind, id, size, total = self.total_allocated, "Created device buffer");

        Ok(BufferHandle { id, kind })
    }

    /// Write vertex data at a byte offset.
    pub fn update_vertex_data<T: Pod>(
        &self,
        handle: BufferHandle,
        data: &[T],
        offset: u64,
    ) -> Result<()> {
        if handle.kind != BufferKind::Vertex {
            return Err(GpuError::WrongKind(handle));
        }
        self.write(handle, bytemuck::cast_slice(data), offset)
    }

    /// Write index data at a byte offset.
    pub fn update_index_data<T: Pod>(
        &self,
        handle: BufferHandle,
        data: &[T],
        offset: u64,
    ) -> Result<()> {
        if handle.kind != BufferKind::Index {
            return Err(GpuError::WrongKind(handle));
        }
        self.write(handle, bytemuck::cast_slice(data), offset)
    }

    fn write(&self, handle: BufferHandle, bytes: &[u8], offset: u64) -> Result<()> {
        let entry = self
            .pool(handle.kind)
            .in_use
            .get(&handle.id)
            .ok_or(GpuError::UnknownBuffer(handle))?;

        let len = bytes.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > entry.size) {
            return Err(GpuError::OutOfBounds {
                offset,
                len,
                size: entry.size,
            });
        }
        self.device.write_buffer(&entry.raw, offset, bytes)
    }

    /// Release a leased buffer back to its pool for reuse.
    ///
    /// Capacity is retained: the total allocated counter does not change.
    pub fn deallocate_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let pool = self.pool_mut(handle.kind);
        let entry = pool
            .in_use
            .remove(&handle.id)
            .ok_or(GpuError::UnknownBuffer(handle))?;
        trace!(kind = ?handle.kind, id = handle.id, size = entry.size, "Released buffer to pool");
        pool.available.insert(handle.id, entry);
        Ok(())
    }

    /// Destroy a buffer, leased or available, and free its device memory.
    pub fn destroy_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let pool = self.pool_mut(handle.kind);
        let entry = pool
            .in_use
            .remove(&handle.id)
            .or_else(|| pool.available.remove(&handle.id))
            .ok_or(GpuError::UnknownBuffer(handle))?;
        self.free_entry(entry);
        Ok(())
    }

    /// Destroy available buffers whose last lease is older than `max_age`.
    ///
    /// Leased buffers are never touched. Returns the number destroyed.
    pub fn cleanup_unused_buffers(&mut self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        for pool in [&mut self.vertex, &mut self.index] {
            let ids: Vec<u64> = pool
                .available
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.leased_at) > max_age)
                .map(|(id, _)| *id)
                .collect();
            expired.extend(ids.into_iter().filter_map(|id| pool.available.remove(&id)));
        }

        let count = expired.len();
        for entry in expired {
            self.free_entry(entry);
        }
        if count > 0 {
            debug!(count, total = self.total_allocated, "Aged out pooled buffers");
        }
        count
    }

    /// Cleanup with the configured default age.
    pub fn cleanup_with_default_age(&mut self) -> usize {
        self.cleanup_unused_buffers(self.config.max_buffer_age)
    }

    /// Destroy every available buffer regardless of age.
    pub fn emergency_cleanup(&mut self) -> usize {
        let mut drained: Vec<PoolEntry<D::Buffer>> = self.vertex.available.drain().map(|(_, e)| e).collect();
        drained.extend(self.index.available.drain().map(|(_, e)| e));

        let count = drained.len();
        for entry in drained {
            self.free_entry(entry);
        }
        if count > 0 {
            warn!(count, total = self.total_allocated, "Emergency buffer cleanup");
        }
        count
    }

    /// Destroy every buffer, leased or not.
    pub fn destroy_all(&mut self) {
        let mut drained: Vec<PoolEntry<D::Buffer>> = Vec::new();
        for pool in [&mut self.vertex, &mut self.index] {
            drained.extend(pool.in_use.drain().map(|(_, e)| e));
            drained.extend(pool.available.drain().map(|(_, e)| e));
        }
        for entry in drained {
            self.free_entry(entry);
        }
        debug!(total = self.total_allocated, "Allocator torn down");
    }

    fn free_entry(&mut self, entry: PoolEntry<D::Buffer>) {
        self.total_allocated = self.total_allocated.saturating_sub(entry.size);
        self.device.destroy_buffer(entry.raw);
    }

    /// Whether `handle` is currently leased.
    pub fn is_in_use(&self, handle: BufferHandle) -> bool {
        self.pool(handle.kind).in_use.contains_key(&handle.id)
    }

    /// Whether `handle` is released and waiting for reuse.
    pub fn is_available(&self, handle: BufferHandle) -> bool {
        self.pool(handle.kind).available.contains_key(&handle.id)
    }

    /// Size in bytes of a live buffer.
    pub fn buffer_size(&self, handle: BufferHandle) -> Option<u64> {
        let pool = self.pool(handle.kind);
        pool.in_use
            .get(&handle.id)
            .or_else(|| pool.available.get(&handle.id))
            .map(|e| e.size)
    }

    /// Device buffer behind a leased handle, for binding at draw time.
    pub fn raw_buffer(&self, handle: BufferHandle) -> Option<&D::Buffer> {
        self.pool(handle.kind).in_use.get(&handle.id).map(|e| &e.raw)
    }

    /// Aggregate memory usage.
    pub fn memory_usage(&self) -> MemoryUsage {
        let vertex = self.vertex.stats();
        let index = self.index.stats();
        MemoryUsage {
            total_allocated_bytes: self.total_allocated,
            in_use_bytes: vertex.in_use_bytes + index.in_use_bytes,
            available_bytes: vertex.available_bytes + index.available_bytes,
            buffer_count: vertex.in_use_count
                + vertex.available_count
                + index.in_use_count
                + index.available_count,
        }
    }

    /// Aggregate plus per-pool statistics.
    pub fn detailed_stats(&self) -> AllocatorStats {
        AllocatorStats {
            usage: self.memory_usage(),
            vertex: self.vertex.stats(),
            index: self.index.stats(),
        }
    }

    fn pool(&self, kind: BufferKind) -> &BufferPool<D::Buffer> {
        match kind {
            BufferKind::Vertex => &self.vertex,
            BufferKind::Index => &self.index,
        }
    }

    fn pool_mut(&mut self, kind: BufferKind) -> &mut BufferPool<D::Buffer> {
        match kind {
            BufferKind::Vertex => &mut self.vertex,
            BufferKind::Index => &mut self.index,
        }
    }
}

impl<D: GpuDevice> Drop for BufferAllocator<D> {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
