//! Timeline semaphores used as monotonic fences.
//!
//! A timeline semaphore carries a 64-bit counter that queues signal and wait
//! on, and that the host can read and block on. That is exactly the fence
//! model the frame pipeline is built around: one counter per queue, "reached"
//! meaning the completed value is at least the target.
//!
//! # Example
//!
//! ```no_run
//! use inflight_rhi::device::Device;
//! use inflight_rhi::gpu::{GpuDevice, QueueKind, WaitStatus};
//!
//! # fn example(device: &Device) -> Result<(), inflight_rhi::RhiError> {
//! let fence = device.create_fence(0)?;
//! device.signal(QueueKind::Direct, &fence, 1)?;
//! assert_eq!(fence.wait(1, u64::MAX)?, WaitStatus::Reached);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::RawDevice;
use crate::error::RhiResult;
use crate::gpu::WaitStatus;

/// Vulkan timeline semaphore wrapper.
///
/// # Thread Safety
///
/// Reading and waiting on the counter may happen from any thread.
pub struct TimelineFence {
    device: Arc<RawDevice>,
    semaphore: vk::Semaphore,
}

impl TimelineFence {
    /// Creates a timeline semaphore starting at `initial_value`.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<RawDevice>, initial_value: u64) -> RhiResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };

        debug!("Created timeline fence at {}", initial_value);

        Ok(Self { device, semaphore })
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Last value the GPU has signaled.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails, including on device loss.
    pub fn completed_value(&self) -> RhiResult<u64> {
        let value = unsafe {
            self.device
                .handle()
                .get_semaphore_counter_value(self.semaphore)?
        };
        Ok(value)
    }

    /// Blocks until the counter reaches `value` or `timeout_ns` expires.
    ///
    /// # Arguments
    ///
    /// * `value` - Counter value to wait for
    /// * `timeout_ns` - Timeout in nanoseconds. Use `u64::MAX` for infinite wait.
    ///
    /// # Errors
    ///
    /// Returns an error for any failure other than a timeout.
    pub fn wait(&self, value: u64, timeout_ns: u64) -> RhiResult<WaitStatus> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        match unsafe { self.device.handle().wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(WaitStatus::Reached),
            Err(vk::Result::TIMEOUT) => Ok(WaitStatus::TimedOut),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TimelineFence {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
        debug!("Destroyed timeline fence");
    }
}
