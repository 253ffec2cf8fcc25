//! Descriptor slot allocation from pre-sized heaps.
//!
//! A [`DescriptorAllocator`] owns one heap. Ranges are served first from a
//! free list of released ranges, most recently freed first, and otherwise
//! bump-allocated from the untouched tail of the heap. There is no grow path:
//! when both are exhausted the allocation fails and is logged.

use tracing::{debug, error, warn};

use inflight_core::DescriptorHeapConfig;
use inflight_rhi::gpu::{DescriptorHeapKind, DescriptorHeapLayout, GpuDevice};

use crate::error::BackendResult;

/// A contiguous block of descriptor slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorRange {
    pub heap: DescriptorHeapKind,
    /// Index of the first slot in the heap.
    pub first: u32,
    pub count: u32,
    /// Handle of the first slot for CPU-side descriptor writes.
    pub cpu_handle: u64,
    /// Handle of the first slot for shaders, on shader-visible heaps.
    pub gpu_handle: Option<u64>,
}

impl DescriptorRange {
    /// One past the last slot, or `None` if that does not fit in a `u32`.
    #[inline]
    pub fn end(&self) -> Option<u32> {
        self.first.checked_add(self.count)
    }

    pub fn overlaps(&self, other: &DescriptorRange) -> bool {
        let end = |range: &DescriptorRange| u64::from(range.first) + u64::from(range.count);
        self.heap == other.heap
            && u64::from(self.first) < end(other)
            && u64::from(other.first) < end(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeBlock {
    first: u32,
    count: u32,
}

/// Allocator over one descriptor heap.
pub struct DescriptorAllocator<D: GpuDevice> {
    heap: D::DescriptorHeap,
    kind: DescriptorHeapKind,
    layout: DescriptorHeapLayout,
    capacity: u32,
    /// First never-allocated slot.
    tail: u32,
    /// Released blocks; the last entry is the most recently freed.
    free: Vec<FreeBlock>,
    /// Slots currently handed out.
    allocated: u32,
}

impl<D: GpuDevice> DescriptorAllocator<D> {
    /// Creates the heap and an allocator over it.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot create the heap.
    pub fn new(device: &D, kind: DescriptorHeapKind, capacity: u32) -> BackendResult<Self> {
        let heap = device.create_descriptor_heap(kind, capacity)?;
        let layout = device.descriptor_heap_layout(&heap);

        debug!(
            "Descriptor allocator for {} heap: {} slot(s)",
            kind.name(),
            capacity
        );

        Ok(Self {
            heap,
            kind,
            layout,
            capacity,
            tail: 0,
            free: Vec::new(),
            allocated: 0,
        })
    }

    /// Allocates `count` contiguous slots.
    ///
    /// Returns `None`, logged, when `count` is zero or no free block and not
    /// enough tail space remain.
    pub fn allocate(&mut self, count: u32) -> Option<DescriptorRange> {
        if count == 0 {
            warn!("Ignoring request for zero {} descriptors", self.kind.name());
            return None;
        }

        // Most recently freed block that is large enough.
        if let Some(pos) = self.free.iter().rposition(|block| block.count >= count) {
            let block = self.free.remove(pos);
            if block.count > count {
                self.free.insert(
                    pos,
                    FreeBlock {
                        first: block.first + count,
                        count: block.count - count,
                    },
                );
            }
            self.allocated += count;
            return Some(self.range(block.first, count));
        }

        if self.capacity - self.tail >= count {
            let first = self.tail;
            self.tail += count;
            self.allocated += count;
            return Some(self.range(first, count));
        }

        error!(
            "{} descriptor heap exhausted: requested {}, {} of {} slot(s) in use, {} free block(s)",
            self.kind.name(),
            count,
            self.allocated,
            self.capacity,
            self.free.len()
        );
        None
    }

    /// Returns `range` to the free list.
    ///
    /// Ranges from another heap, outside the allocated region (including ones
    /// whose end overflows), or overlapping an already free block are rejected
    /// and logged.
    pub fn free(&mut self, range: DescriptorRange) {
        let end = range
            .end()
            .filter(|&end| range.heap == self.kind && range.count > 0 && end <= self.tail);
        let Some(end) = end else {
            error!(
                "Rejecting free of {} descriptor range {}+{} on {} heap",
                range.heap.name(),
                range.first,
                range.count,
                self.kind.name()
            );
            return;
        };
        let double_free = self
            .free
            .iter()
            .any(|block| range.first < block.first + block.count && block.first < end);
        if double_free {
            error!(
                "Descriptor range {}..{} on {} heap freed twice",
                range.first,
                end,
                self.kind.name()
            );
            return;
        }

        self.allocated -= range.count;
        self.free.push(FreeBlock {
            first: range.first,
            count: range.count,
        });
    }

    fn range(&self, first: u32, count: u32) -> DescriptorRange {
        let offset = u64::from(first) * self.layout.stride;
        DescriptorRange {
            heap: self.kind,
            first,
            count,
            cpu_handle: self.layout.cpu_base + offset,
            gpu_handle: self.layout.gpu_base.map(|base| base + offset),
        }
    }

    #[inline]
    pub fn heap(&self) -> &D::DescriptorHeap {
        &self.heap
    }

    #[inline]
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Slots currently handed out.
    #[inline]
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    /// Number of released blocks waiting for reuse.
    #[inline]
    pub fn free_blocks(&self) -> usize {
        self.free.len()
    }
}

/// One allocator per descriptor heap kind.
pub struct DescriptorHeaps<D: GpuDevice> {
    allocators: Vec<DescriptorAllocator<D>>,
}

impl<D: GpuDevice> DescriptorHeaps<D> {
    /// Creates every heap with the configured capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if a heap cannot be created.
    pub fn new(device: &D, config: &DescriptorHeapConfig) -> BackendResult<Self> {
        let allocators = DescriptorHeapKind::ALL
            .iter()
            .map(|&kind| {
                let capacity = match kind {
                    DescriptorHeapKind::CbvSrvUav => config.cbv_srv_uav,
                    DescriptorHeapKind::Rtv => config.rtv,
                    DescriptorHeapKind::Dsv => config.dsv,
                };
                DescriptorAllocator::new(device, kind, capacity)
            })
            .collect::<BackendResult<Vec<_>>>()?;
        Ok(Self { allocators })
    }

    #[inline]
    pub fn get(&self, kind: DescriptorHeapKind) -> &DescriptorAllocator<D> {
        &self.allocators[kind.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, kind: DescriptorHeapKind) -> &mut DescriptorAllocator<D> {
        &mut self.allocators[kind.index()]
    }

    /// Returns a range to the allocator of the heap it came from.
    pub fn free(&mut self, range: DescriptorRange) {
        self.get_mut(range.heap).free(range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inflight_rhi::mock::MockDevice;

    fn allocator(capacity: u32) -> DescriptorAllocator<MockDevice> {
        DescriptorAllocator::new(&MockDevice::new(), DescriptorHeapKind::CbvSrvUav, capacity)
            .unwrap()
    }

    #[test]
    fn test_bump_allocation_is_contiguous() {
        let mut alloc = allocator(16);
        let a = alloc.allocate(4).unwrap();
        let b = alloc.allocate(2).unwrap();
        assert_eq!((a.first, a.count), (0, 4));
        assert_eq!((b.first, b.count), (4, 2));
        assert!(!a.overlaps(&b));
        assert_eq!(alloc.allocated(), 6);
    }

    #[test]
    fn test_handles_follow_layout() {
        let mut alloc = allocator(16);
        let _ = alloc.allocate(3).unwrap();
        let range = alloc.allocate(1).unwrap();
        let layout = alloc.layout;
        assert_eq!(range.cpu_handle, layout.cpu_base + 3 * layout.stride);
        assert_eq!(
            range.gpu_handle,
            layout.gpu_base.map(|base| base + 3 * layout.stride)
        );
    }

    #[test]
    fn test_cpu_only_heap_has_no_gpu_handle() {
        let mut alloc =
            DescriptorAllocator::new(&MockDevice::new(), DescriptorHeapKind::Rtv, 4).unwrap();
        assert!(alloc.allocate(1).unwrap().gpu_handle.is_none());
    }

    #[test]
    fn test_most_recently_freed_is_reused_first() {
        let mut alloc = allocator(16);
        let a = alloc.allocate(2).unwrap();
        let b = alloc.allocate(2).unwrap();
        alloc.free(a);
        alloc.free(b);

        assert_eq!(alloc.allocate(2), Some(b));
        assert_eq!(alloc.allocate(2), Some(a));
    }

    #[test]
    fn test_larger_block_is_split() {
        let mut alloc = allocator(16);
        let big = alloc.allocate(8).unwrap();
        alloc.free(big);

        let small = alloc.allocate(3).unwrap();
        assert_eq!((small.first, small.count), (0, 3));
        let rest = alloc.allocate(5).unwrap();
        assert_eq!((rest.first, rest.count), (3, 5));
        assert_eq!(alloc.free_blocks(), 0);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut alloc = allocator(4);
        assert!(alloc.allocate(3).is_some());
        assert!(alloc.allocate(2).is_none());
        assert!(alloc.allocate(1).is_some());
        assert!(alloc.allocate(1).is_none());
    }

    #[test]
    fn test_zero_count_returns_none() {
        let mut alloc = allocator(4);
        assert!(alloc.allocate(0).is_none());
    }

    #[test]
    fn test_double_free_is_ignored() {
        let mut alloc = allocator(8);
        let a = alloc.allocate(2).unwrap();
        alloc.free(a);
        alloc.free(a);
        assert_eq!(alloc.free_blocks(), 1);
        assert_eq!(alloc.allocated(), 0);
    }

    #[test]
    fn test_foreign_range_is_ignored() {
        let mut alloc = allocator(8);
        let _ = alloc.allocate(2).unwrap();
        let foreign = DescriptorRange {
            heap: DescriptorHeapKind::Dsv,
            first: 0,
            count: 1,
            cpu_handle: 0,
            gpu_handle: None,
        };
        alloc.free(foreign);
        assert_eq!(alloc.free_blocks(), 0);
    }

    #[test]
    fn test_range_ending_past_u32_is_ignored() {
        let mut alloc = allocator(8);
        let live = alloc.allocate(2).unwrap();
        let wrapped = DescriptorRange {
            first: u32::MAX,
            count: 2,
            ..live
        };
        assert_eq!(wrapped.end(), None);
        assert!(!wrapped.overlaps(&live));

        alloc.free(wrapped);
        assert_eq!(alloc.free_blocks(), 0);
        assert_eq!(alloc.allocated(), 2);
    }

    #[test]
    fn test_heaps_use_configured_capacities() {
        let config = DescriptorHeapConfig {
            cbv_srv_uav: 64,
            rtv: 8,
            dsv: 2,
        };
        let mut heaps = DescriptorHeaps::new(&MockDevice::new(), &config).unwrap();
        assert_eq!(heaps.get(DescriptorHeapKind::CbvSrvUav).capacity(), 64);
        assert_eq!(heaps.get(DescriptorHeapKind::Dsv).capacity(), 2);

        let range = heaps.get_mut(DescriptorHeapKind::Rtv).allocate(8).unwrap();
        heaps.free(range);
        assert_eq!(heaps.get(DescriptorHeapKind::Rtv).allocated(), 0);
    }
}
