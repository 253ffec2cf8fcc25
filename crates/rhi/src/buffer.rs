//! Vulkan buffers backed by gpu-allocator memory.
//!
//! [`Buffer`] owns a `VkBuffer` and its allocation. Upload-heap buffers stay
//! persistently mapped for their whole life; everything else is GPU-local.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use crate::device::RawDevice;
use crate::error::{RhiError, RhiResult};
use crate::gpu::NativeBuffer;
use crate::resource::{BufferResourceDesc, BufferUsage, HeapType};

/// Vulkan usage flags for a buffer usage kind.
pub fn vk_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let flags = match usage {
        BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        BufferUsage::Constant => vk::BufferUsageFlags::UNIFORM_BUFFER,
        BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
        BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER,
        BufferUsage::IndirectCommands => {
            vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER
        }
        BufferUsage::UnorderedAccess => {
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC
        }
        BufferUsage::AccelerationStructure => vk::BufferUsageFlags::STORAGE_BUFFER,
    };

    let flags = if usage.allows_unordered_access() {
        flags | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
    } else {
        flags
    };

    // Everything outside the upload heap is filled by copies.
    match usage.heap_type() {
        HeapType::Upload => flags,
        HeapType::Default => flags | vk::BufferUsageFlags::TRANSFER_DST,
    }
}

/// Memory location for a heap type.
pub fn memory_location(heap: HeapType) -> MemoryLocation {
    match heap {
        HeapType::Upload => MemoryLocation::CpuToGpu,
        HeapType::Default => MemoryLocation::GpuOnly,
    }
}

/// GPU buffer with managed memory.
pub struct Buffer {
    device: Arc<RawDevice>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    usage: BufferUsage,
    name: String,
}

impl Buffer {
    /// Creates a buffer for `desc`.
    ///
    /// # Errors
    ///
    /// Returns an error if the description is invalid, or if buffer creation,
    /// allocation or binding fails. Nothing leaks on failure.
    pub fn new(device: Arc<RawDevice>, desc: &BufferResourceDesc) -> RhiResult<Self> {
        desc.validate().map_err(RhiError::InvalidRequest)?;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(vk_buffer_usage(desc.usage))
            .sharing_mode(device.sharing_mode())
            .queue_family_indices(device.queue_families());

        let buffer = unsafe { device.handle().create_buffer(&buffer_info, None)? };

        let mut requirements = unsafe { device.handle().get_buffer_memory_requirements(buffer) };
        requirements.alignment = requirements.alignment.max(desc.alignment);

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name: &desc.name,
            requirements,
            location: memory_location(desc.usage.heap_type()),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        let bind = unsafe {
            device
                .handle()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bind {
            if let Err(free_err) = device.allocator().lock().free(allocation) {
                error!("Failed to free allocation of unbound buffer: {:?}", free_err);
            }
            unsafe { device.handle().destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        debug!(
            "Created {} buffer '{}': {} bytes",
            desc.usage.name(),
            desc.name,
            desc.size
        );

        Ok(Self {
            device,
            buffer,
            allocation: Some(allocation),
            size: desc.size,
            usage: desc.usage,
            name: desc.name.clone(),
        })
    }

    /// Returns the Vulkan buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl NativeBuffer for Buffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn mapped_slice(&self) -> Option<&[u8]> {
        self.allocation.as_ref()?.mapped_slice()
    }

    fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.allocation.as_mut()?.mapped_slice_mut()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Free allocation first, then destroy buffer
        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.device.allocator().lock().free(allocation)
        {
            error!("Failed to free buffer allocation: {:?}", e);
        }

        unsafe {
            self.device.handle().destroy_buffer(self.buffer, None);
        }

        debug!("Destroyed {} buffer '{}'", self.usage.name(), self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_heap_buffers_accept_copies() {
        for usage in [
            BufferUsage::Vertex,
            BufferUsage::Index,
            BufferUsage::IndirectCommands,
            BufferUsage::UnorderedAccess,
            BufferUsage::AccelerationStructure,
        ] {
            assert!(
                vk_buffer_usage(usage).contains(vk::BufferUsageFlags::TRANSFER_DST),
                "{} buffers must be copy destinations",
                usage.name()
            );
        }
    }

    #[test]
    fn test_staging_is_copy_source_only() {
        let flags = vk_buffer_usage(BufferUsage::Staging);
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(!flags.contains(vk::BufferUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn test_writable_buffers_have_device_address() {
        assert!(
            vk_buffer_usage(BufferUsage::UnorderedAccess)
                .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        );
        assert!(
            vk_buffer_usage(BufferUsage::AccelerationStructure)
                .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        );
        assert!(
            !vk_buffer_usage(BufferUsage::Vertex)
                .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        );
    }

    #[test]
    fn test_memory_location() {
        assert_eq!(memory_location(HeapType::Upload), MemoryLocation::CpuToGpu);
        assert_eq!(memory_location(HeapType::Default), MemoryLocation::GpuOnly);
    }
}
