//! GPU device layer (Render Hardware Interface).
//!
//! This crate defines the [`gpu::GpuDevice`] seam the frame-pipelined backend
//! is written against, and implements it over Vulkan using the `ash` crate.
//! It handles:
//! - Instance and device creation
//! - Buffers and textures backed by gpu-allocator memory
//! - Descriptor heaps
//! - Command allocators and command lists
//! - Timeline semaphores used as monotonic fences
//! - Plain-data records for GPU-generated indirect commands
//!
//! With the `mock` feature, `mock::MockDevice` provides a deterministic
//! in-memory device for tests.

mod error;

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod gpu;
pub mod indirect;
pub mod instance;
pub mod physical_device;
pub mod resource;
pub mod sync;
pub mod texture;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
