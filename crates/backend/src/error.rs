//! Backend error types.

use inflight_rhi::RhiError;
use thiserror::Error;

/// Errors produced by the frame-pipelined backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// GPU memory could not be allocated.
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// A request the backend cannot satisfy, such as a zero-sized buffer.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A command list could not be created, opened or closed.
    #[error("Command list failure: {0}")]
    CommandList(String),

    /// A CPU wait on a frame fence did not observe the target value.
    #[error("Wait for fence value {value} failed: {reason}")]
    WaitFailed { value: u64, reason: String },

    /// Work could not be handed to a hardware queue.
    #[error("Queue submission failed: {0}")]
    Submission(String),

    /// The GPU device was removed.
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// A command allocator was reset while lists built from it could still execute.
    #[error("Command allocator reset while in flight (retires at {retire_at:?}, completed {completed})")]
    AllocatorInFlight {
        retire_at: Option<u64>,
        completed: u64,
    },

    /// A frame call out of order, such as `end_frame` without `begin_frame`.
    #[error("Frame protocol violation: {0}")]
    FrameProtocol(&'static str),

    /// A previous fatal error left the backend unusable.
    #[error("Backend unusable after fatal error: {0}")]
    Poisoned(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] inflight_core::Error),

    /// Any other device-level failure.
    #[error("GPU error: {0}")]
    Gpu(RhiError),
}

impl BackendError {
    /// Whether the backend cannot continue after this error.
    ///
    /// Command-list failures abort in debug builds only; release builds log
    /// them and keep going.
    pub fn is_fatal(&self) -> bool {
        match self {
            BackendError::AllocationFailed(_)
            | BackendError::InvalidRequest(_)
            | BackendError::FrameProtocol(_)
            | BackendError::Config(_) => false,
            BackendError::CommandList(_) => cfg!(debug_assertions),
            BackendError::WaitFailed { .. }
            | BackendError::Submission(_)
            | BackendError::DeviceLost(_)
            | BackendError::AllocatorInFlight { .. }
            | BackendError::Poisoned(_)
            | BackendError::Gpu(_) => true,
        }
    }

    #[inline]
    pub fn is_device_lost(&self) -> bool {
        matches!(self, BackendError::DeviceLost(_))
    }

    /// Classifies a failed queue operation (execute, signal or wait).
    ///
    /// Unlike resource creation, running out of memory here loses queued
    /// work, so it is fatal.
    pub fn submission(err: RhiError) -> Self {
        if err.is_device_lost() {
            BackendError::DeviceLost(err.to_string())
        } else {
            BackendError::Submission(err.to_string())
        }
    }
}

impl From<RhiError> for BackendError {
    fn from(err: RhiError) -> Self {
        if err.is_device_lost() {
            BackendError::DeviceLost(err.to_string())
        } else if err.is_out_of_memory() {
            BackendError::AllocationFailed(err.to_string())
        } else {
            match err {
                RhiError::InvalidRequest(msg) => BackendError::InvalidRequest(msg),
                RhiError::CommandList(msg) => BackendError::CommandList(msg),
                other => BackendError::Gpu(other),
            }
        }
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;
