//! The device seam consumed by the frame-pipelined backend.
//!
//! [`GpuDevice`] exposes exactly the primitives the backend needs: memory
//! creation, descriptor heaps, command allocators and lists, queue
//! submission, and monotonic fences. The Vulkan implementation lives in
//! [`crate::device`]; a deterministic fake for tests lives in `mock`.
//!
//! Native objects are RAII: dropping a `GpuDevice::Buffer` releases its memory.
//! Whoever owns the native object decides when the GPU is done with it.

use std::time::Duration;

use crate::error::RhiResult;
use crate::resource::{BufferResourceDesc, TextureResourceDesc, TextureState};

/// Hardware queue a command list is executed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics/compute queue; also used for presentation transitions.
    Direct,
    /// Transfer queue used for uploads.
    Copy,
}

impl QueueKind {
    /// Both queue kinds, in index order.
    pub const ALL: [QueueKind; 2] = [QueueKind::Direct, QueueKind::Copy];

    /// Dense index for per-queue tables.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            QueueKind::Direct => 0,
            QueueKind::Copy => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QueueKind::Direct => "direct",
            QueueKind::Copy => "copy",
        }
    }
}

/// Outcome of a CPU wait on a fence value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    /// The fence reached the value.
    Reached,
    /// The timeout expired first.
    TimedOut,
    /// The wait was abandoned by the OS or driver.
    Abandoned,
}

/// Descriptor heap kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// Constant, shader-resource and unordered-access views.
    CbvSrvUav,
    /// Render target views.
    Rtv,
    /// Depth-stencil views.
    Dsv,
}

impl DescriptorHeapKind {
    pub const ALL: [DescriptorHeapKind; 3] = [
        DescriptorHeapKind::CbvSrvUav,
        DescriptorHeapKind::Rtv,
        DescriptorHeapKind::Dsv,
    ];

    /// Only the view heap is visible to shaders.
    #[inline]
    pub fn is_shader_visible(self) -> bool {
        self == DescriptorHeapKind::CbvSrvUav
    }

    #[inline]
    pub fn index(self) -> usize {
        match self {
            DescriptorHeapKind::CbvSrvUav => 0,
            DescriptorHeapKind::Rtv => 1,
            DescriptorHeapKind::Dsv => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DescriptorHeapKind::CbvSrvUav => "cbv/srv/uav",
            DescriptorHeapKind::Rtv => "rtv",
            DescriptorHeapKind::Dsv => "dsv",
        }
    }
}

/// Addressing of a descriptor heap: slot `i` lives at `base + i * stride`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorHeapLayout {
    /// Handle of slot 0 for CPU-side writes.
    pub cpu_base: u64,
    /// Handle of slot 0 for shader access, for shader-visible heaps.
    pub gpu_base: Option<u64>,
    /// Distance between two slots.
    pub stride: u64,
}

/// Access to a native buffer's persistent CPU mapping.
pub trait NativeBuffer {
    /// Size of the buffer in bytes.
    fn size(&self) -> u64;

    /// The mapped bytes, for buffers in upload memory.
    fn mapped_slice(&self) -> Option<&[u8]>;

    /// The mapped bytes, mutably.
    fn mapped_slice_mut(&mut self) -> Option<&mut [u8]>;
}

/// GPU device primitives used by the backend.
///
/// All methods take `&self`; the backend drives a device from one thread.
pub trait GpuDevice {
    /// Buffer with its memory.
    type Buffer: NativeBuffer;
    /// Texture with its memory.
    type Texture;
    /// Pre-sized descriptor heap.
    type DescriptorHeap;
    /// Backing storage that command lists record into.
    type CommandAllocator;
    /// Recordable command list.
    type CommandList;
    /// Monotonic 64-bit fence.
    type Fence;

    /// Short description for logs.
    fn name(&self) -> String;

    /// Whether copy work runs on its own hardware queue.
    fn has_dedicated_copy_queue(&self) -> bool;

    // =========================================================================
    // Memory
    // =========================================================================

    /// Creates a buffer in the heap its usage asks for.
    fn create_buffer(&self, desc: &BufferResourceDesc) -> RhiResult<Self::Buffer>;

    /// Creates a texture; render targets and depth buffers get a dedicated allocation.
    fn create_texture(&self, desc: &TextureResourceDesc) -> RhiResult<Self::Texture>;

    // =========================================================================
    // Descriptors
    // =========================================================================

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> RhiResult<Self::DescriptorHeap>;

    fn descriptor_heap_layout(&self, heap: &Self::DescriptorHeap) -> DescriptorHeapLayout;

    // =========================================================================
    // Commands
    // =========================================================================

    fn create_command_allocator(&self, queue: QueueKind) -> RhiResult<Self::CommandAllocator>;

    /// Reclaims all memory recorded through the allocator.
    ///
    /// Every list opened from it must have finished executing.
    fn reset_command_allocator(&self, allocator: &mut Self::CommandAllocator) -> RhiResult<()>;

    /// Opens a list for recording from `allocator`, reusing a cached native
    /// list when the allocator has one.
    fn open_command_list(
        &self,
        allocator: &mut Self::CommandAllocator,
    ) -> RhiResult<Self::CommandList>;

    /// Ends recording. A list that fails to close cannot be executed.
    fn close_command_list(&self, list: &mut Self::CommandList) -> RhiResult<()>;

    /// Executes closed lists in order with a single queue submission.
    fn execute_command_lists(
        &self,
        queue: QueueKind,
        lists: &[&Self::CommandList],
    ) -> RhiResult<()>;

    fn record_buffer_copy(
        &self,
        list: &mut Self::CommandList,
        src: &Self::Buffer,
        src_offset: u64,
        dst: &Self::Buffer,
        dst_offset: u64,
        size: u64,
    );

    fn record_texture_transition(
        &self,
        list: &mut Self::CommandList,
        texture: &Self::Texture,
        before: TextureState,
        after: TextureState,
    );

    // =========================================================================
    // Fences
    // =========================================================================

    fn create_fence(&self, initial_value: u64) -> RhiResult<Self::Fence>;

    /// Queues a GPU-side signal of `value` after all work already on `queue`.
    fn signal(&self, queue: QueueKind, fence: &Self::Fence, value: u64) -> RhiResult<()>;

    /// Makes work submitted to `queue` after this call wait for `value`.
    fn queue_wait(&self, queue: QueueKind, fence: &Self::Fence, value: u64) -> RhiResult<()>;

    /// Last value the GPU has reached.
    fn completed_value(&self, fence: &Self::Fence) -> RhiResult<u64>;

    /// Blocks the calling thread until the fence reaches `value`.
    ///
    /// `None` waits forever.
    fn wait_for_value(
        &self,
        fence: &Self::Fence,
        value: u64,
        timeout: Option<Duration>,
    ) -> RhiResult<WaitStatus>;

    // =========================================================================
    // Device
    // =========================================================================

    /// Blocks until every queue is idle.
    fn wait_idle(&self) -> RhiResult<()>;

    /// Post-mortem report for a lost device, if the device can produce one.
    fn device_lost_report(&self) -> Option<String>;
}

/// Back buffers and presentation.
///
/// Swapchain creation is owned by the windowing layer; the backend only
/// transitions and presents the back buffers it is handed.
pub trait Swapchain<D: GpuDevice> {
    /// Acquires the next back buffer and returns its index.
    fn acquire_next_backbuffer(&mut self, device: &D) -> RhiResult<u32>;

    fn backbuffer(&self, index: u32) -> Option<&D::Texture>;

    /// Presents the most recently acquired back buffer.
    fn present(&mut self, device: &D) -> RhiResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_indices_are_dense() {
        let indices: Vec<usize> = QueueKind::ALL.iter().map(|q| q.index()).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn test_descriptor_heap_kinds() {
        let indices: Vec<usize> = DescriptorHeapKind::ALL.iter().map(|k| k.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(DescriptorHeapKind::CbvSrvUav.is_shader_visible());
        assert!(!DescriptorHeapKind::Rtv.is_shader_visible());
        assert!(!DescriptorHeapKind::Dsv.is_shader_visible());
    }
}
