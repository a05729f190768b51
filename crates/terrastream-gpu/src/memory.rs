//! Vulkan device backed by gpu-allocator.
//!
//! Tile buffers are small and rewritten once per upload, so they live in
//! host-visible memory and writes go straight through the mapped pointer.
//!
//! Creating buffers needs a live Vulkan device, so the unit tests here only
//! cover the device-free parts. The streaming tests run against
//! [`HeadlessDevice`](crate::HeadlessDevice) instead.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use tracing::warn;

use crate::device::{BufferUsage, GpuDevice};
use crate::error::{GpuError, Result};

impl BufferUsage {
    /// Vulkan usage flags for this usage.
    pub fn to_vk(self) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::empty();
        if self.contains(Self::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(Self::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(Self::COPY_DST) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        flags
    }
}

/// A Vulkan buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl GpuBuffer {
    /// Map the buffer memory for CPU access.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
    }

    /// Write raw bytes to the buffer at the given offset.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::WriteFailed("buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::OutOfBounds {
                offset,
                len: data.len() as u64,
                size: self.size,
            });
        }

        // SAFETY: the allocation is host-visible and persistently mapped, and
        // `offset + data.len()` was checked against the buffer size above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }
}

/// Vulkan implementation of [`GpuDevice`].
pub struct VulkanDevice {
    device: Arc<ash::Device>,
    allocator: Mutex<Option<Allocator>>,
}

impl VulkanDevice {
    /// Wrap an existing logical device.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid and must
    /// outlive the returned value.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            device,
            allocator: Mutex::new(Some(allocator)),
        })
    }

    /// The wrapped logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Free all remaining GPU memory.
    ///
    /// Must be called before the Vulkan device is destroyed. Any allocation
    /// still alive is freed and logged as a leak.
    pub fn shutdown(&self) {
        drop(self.allocator.lock().take());
    }
}

impl GpuDevice for VulkanDevice {
    type Buffer = GpuBuffer;

    fn create_buffer(&self, size: u64, usage: BufferUsage, label: &str) -> Result<GpuBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.to_vk())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the device is valid for the lifetime of `self`.
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = {
            let mut allocator = self.allocator.lock();
            let Some(allocator) = allocator.as_mut() else {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::InvalidState("allocator shut down".to_string()));
            };
            allocator.allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        };
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::AllocationFailed(e.to_string()));
            }
        };

        // SAFETY: freshly created buffer and allocation from the same device.
        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        buffer.write_bytes(offset, data)
    }

    fn destroy_buffer(&self, mut buffer: GpuBuffer) {
        if let Some(allocation) = buffer.allocation.take() {
            if let Some(allocator) = self.allocator.lock().as_mut() {
                if let Err(e) = allocator.free(allocation) {
                    warn!("Failed to free buffer allocation: {e}");
                }
            }
        }

        // SAFETY: the buffer was created by this device and is no longer referenced.
        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_maps_to_vulkan_flags() {
        assert_eq!(
            (BufferUsage::VERTEX | BufferUsage::COPY_DST).to_vk(),
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
        assert_eq!(BufferUsage::INDEX.to_vk(), vk::BufferUsageFlags::INDEX_BUFFER);
        assert_eq!(BufferUsage::empty().to_vk(), vk::BufferUsageFlags::empty());
    }

    #[test]
    fn unmapped_buffer_rejects_writes() {
        let buffer = GpuBuffer {
            buffer: vk::Buffer::null(),
            allocation: None,
            size: 64,
        };
        assert!(buffer.mapped_ptr().is_none());
        assert!(matches!(
            buffer.write_bytes(0, &[1, 2, 3]),
            Err(GpuError::WriteFailed(_))
        ));
    }
}
