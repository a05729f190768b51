//! In-memory device for headless runs and tests.

use std::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::device::{BufferUsage, GpuDevice};
use crate::error::{GpuError, Result};

/// Buffer object of the headless device.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct HeadlessBuffer {
    id: u64,
    size: u64,
    usage: BufferUsage,
}

impl HeadlessBuffer {
    /// Device-side id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Usage flags the buffer was created with.
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

#[derive(Default)]
struct HeadlessState {
    next_id: u64,
    contents: HashMap<u64, Vec<u8>>,
    created: u64,
    destroyed: u64,
    writes: u64,
    bytes_written: u64,
}

/// Device that keeps buffer contents in host memory.
///
/// Counts creates, writes and destroys so tests can assert on device churn.
#[derive(Default)]
pub struct HeadlessDevice {
    state: Mutex<HeadlessState>,
    fail_creates: AtomicBool,
    fail_writes: AtomicBool,
}

impl HeadlessDevice {
    /// Create a new headless device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create_buffer` calls fail.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent `write_buffer` calls fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Number of buffers ever created.
    pub fn created_count(&self) -> u64 {
        self.state.lock().created
    }

    /// Number of buffers destroyed.
    pub fn destroyed_count(&self) -> u64 {
        self.state.lock().destroyed
    }

    /// Number of buffers currently alive on the device.
    pub fn live_count(&self) -> usize {
        self.state.lock().contents.len()
    }

    /// Number of writes issued.
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// Total bytes written.
    pub fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    /// Copy of a buffer's contents, if it is still alive.
    pub fn read_buffer(&self, buffer: &HeadlessBuffer) -> Option<Vec<u8>> {
        self.state.lock().contents.get(&buffer.id).cloned()
    }
}

impl GpuDevice for HeadlessDevice {
    type Buffer = HeadlessBuffer;

    fn create_buffer(&self, size: u64, usage: BufferUsage, label: &str) -> Result<HeadlessBuffer> {
        if self.fail_creates.load(Ordering::Relaxed) {
            return Err(GpuError::AllocationFailed(format!(
                "headless device refused {label} ({size} bytes)"
            )));
        }
        let len = usize::try_from(size)
            .map_err(|_| GpuError::AllocationFailed(format!("{size} bytes exceeds host memory")))?;

        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.contents.insert(id, vec![0; len]);
        state.created += 1;
        Ok(HeadlessBuffer { id, size, usage })
    }

    fn write_buffer(&self, buffer: &HeadlessBuffer, offset: u64, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(GpuError::WriteFailed("headless device refused write".to_string()));
        }

        let mut state = self.state.lock();
        let contents = state
            .contents
            .get_mut(&buffer.id)
            .ok_or_else(|| GpuError::InvalidState(format!("buffer {} destroyed", buffer.id)))?;

        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(GpuError::OutOfBounds {
                offset,
                len: data.len() as u64,
                size: buffer.size,
            });
        }
        contents[start..end].copy_from_slice(data);
        state.writes += 1;
        state.bytes_written += data.len() as u64;
        Ok(())
    }

    fn destroy_buffer(&self, buffer: HeadlessBuffer) {
        let mut state = self.state.lock();
        if state.contents.remove(&buffer.id).is_some() {
            state.destroyed += 1;
        }
    }
}
