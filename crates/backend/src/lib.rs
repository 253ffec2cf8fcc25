//! Frame-pipelined GPU resource and command lifecycle management.
//!
//! This crate makes a renderer that keeps several frames in flight correct:
//! - Descriptor allocation from pre-sized heaps ([`DescriptorAllocator`])
//! - Staging and scratch buffer pooling ([`ResourcePool`])
//! - Per-slot fence tracking ([`FrameSynchronizer`])
//! - Command allocator recycling and batched submission ([`CommandSubmitter`])
//! - Fence-gated destruction ([`DeferredDestructionQueue`])
//!
//! [`Backend`] composes all of them behind the `begin_frame` / `end_frame`
//! protocol. It is generic over [`inflight_rhi::gpu::GpuDevice`].

mod backend;
mod error;
mod slots;

pub mod buffer;
pub mod command;
pub mod deferred;
pub mod descriptor;
pub mod diagnostics;
pub mod handle;
pub mod pool;
pub mod sync;

pub use backend::{Backend, BackendStats};
pub use buffer::{Buffer, Texture};
pub use command::{
    AllocatorState, CommandAllocator, CommandList, CommandListState, CommandSubmitter,
};
pub use deferred::DeferredDestructionQueue;
pub use descriptor::{DescriptorAllocator, DescriptorRange};
pub use error::{BackendError, BackendResult};
pub use handle::{BufferHandle, TextureHandle};
pub use pool::ResourcePool;
pub use slots::{PerSlot, SlotTarget};
pub use sync::{FrameSynchronizer, SlotState};
