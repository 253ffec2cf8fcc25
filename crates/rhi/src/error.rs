//! RHI-specific error types.

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] vk::Result),

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// The device ran out of memory for a resource
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// A request the device cannot express (bad size, format, usage...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Command list creation, recording or close failure
    #[error("Command list error: {0}")]
    CommandList(String),

    /// The device was lost or removed
    #[error("Device lost: {0}")]
    DeviceLost(String),
}

impl RhiError {
    /// Returns true if the error means the device is gone for good.
    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            RhiError::DeviceLost(_) | RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST)
        )
    }

    /// Returns true if the error is a memory exhaustion that a caller can
    /// recover from by skipping work.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            RhiError::OutOfMemory(_)
                | RhiError::AllocatorError(gpu_allocator::AllocationError::OutOfMemory)
                | RhiError::VulkanError(
                    vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY
                )
        )
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_classification() {
        assert!(RhiError::DeviceLost("hang".to_string()).is_device_lost());
        assert!(RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST).is_device_lost());
        assert!(!RhiError::VulkanError(vk::Result::TIMEOUT).is_device_lost());
        assert!(!RhiError::OutOfMemory("heap".to_string()).is_device_lost());
    }

    #[test]
    fn test_out_of_memory_classification() {
        assert!(RhiError::OutOfMemory("heap".to_string()).is_out_of_memory());
        assert!(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).is_out_of_memory());
        assert!(
            RhiError::AllocatorError(gpu_allocator::AllocationError::OutOfMemory)
                .is_out_of_memory()
        );
        assert!(!RhiError::InvalidRequest("size".to_string()).is_out_of_memory());
    }
}
