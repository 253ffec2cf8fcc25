//! Staging and scratch buffer pools.
//!
//! Two independent pools share one rule: a returned buffer is parked on the
//! frame slot it was returned in, and only becomes reusable once that slot
//! has been confirmed retired. Pooled buffers are never destroyed during
//! normal operation; [`ResourcePool::release_all`] frees them at teardown.

use tracing::{debug, trace};

use inflight_rhi::gpu::GpuDevice;
use inflight_rhi::resource::{BufferResourceDesc, BufferUsage, SCRATCH_BUFFER_ALIGNMENT};

use crate::buffer::Buffer;
use crate::error::BackendResult;
use crate::slots::{PerSlot, SlotTarget};

/// Pools of upload (staging) and GPU-local scratch buffers.
pub struct ResourcePool<D: GpuDevice> {
    staging_free: Vec<Buffer<D>>,
    staging_returned: PerSlot<Buffer<D>>,
    scratch_free: Vec<Buffer<D>>,
    scratch_returned: PerSlot<Buffer<D>>,
    staging_created: u32,
    scratch_created: u32,
}

impl<D: GpuDevice> ResourcePool<D> {
    pub fn new(slot_count: usize) -> Self {
        Self {
            staging_free: Vec::new(),
            staging_returned: PerSlot::new(slot_count),
            scratch_free: Vec::new(),
            scratch_returned: PerSlot::new(slot_count),
            staging_created: 0,
            scratch_created: 0,
        }
    }

    // =========================================================================
    // Staging
    // =========================================================================

    /// Returns a mapped upload buffer of at least `size` bytes whose alignment
    /// is exactly `alignment`.
    ///
    /// The first matching free buffer is reused; otherwise a new one is created.
    ///
    /// # Errors
    ///
    /// Returns an error if a new buffer is needed and cannot be created.
    pub fn get_staging_buffer(
        &mut self,
        device: &D,
        size: u64,
        alignment: u64,
    ) -> BackendResult<Buffer<D>> {
        if let Some(pos) = self
            .staging_free
            .iter()
            .position(|b| b.size() >= size && b.alignment() == alignment)
        {
            let buffer = self.staging_free.remove(pos);
            trace!(
                "Reusing '{}' ({} bytes) for a {}-byte staging request",
                buffer.name(),
                buffer.size(),
                size
            );
            return Ok(buffer);
        }

        let desc = BufferResourceDesc::new(
            format!("Staging Buffer {}", self.staging_created),
            BufferUsage::Staging,
            size,
        )
        .with_alignment(alignment);
        let buffer = Buffer::create(device, &desc)?;
        self.staging_created += 1;
        Ok(buffer)
    }

    /// Parks a staging buffer until `target` retires.
    ///
    /// A buffer that is not a staging buffer is handed back unchanged.
    pub fn return_staging_buffer(
        &mut self,
        target: SlotTarget,
        buffer: Buffer<D>,
    ) -> Result<(), Buffer<D>> {
        if buffer.usage() != BufferUsage::Staging {
            return Err(buffer);
        }
        self.staging_returned.push(target, buffer);
        Ok(())
    }

    // =========================================================================
    // Scratch
    // =========================================================================

    /// Returns a GPU-local, UAV-capable buffer of at least `size` bytes.
    ///
    /// The smallest free buffer that fits is reused; otherwise a new one is
    /// created with acceleration-structure scratch alignment.
    ///
    /// # Errors
    ///
    /// Returns an error if a new buffer is needed and cannot be created.
    pub fn get_scratch_buffer(&mut self, device: &D, size: u64) -> BackendResult<Buffer<D>> {
        let best = self
            .scratch_free
            .iter()
            .enumerate()
            .filter(|(_, b)| b.size() >= size)
            .min_by_key(|(_, b)| b.size())
            .map(|(pos, _)| pos);

        if let Some(pos) = best {
            let buffer = self.scratch_free.remove(pos);
            trace!(
                "Reusing '{}' ({} bytes) for a {}-byte scratch request",
                buffer.name(),
                buffer.size(),
                size
            );
            return Ok(buffer);
        }

        let desc = BufferResourceDesc::new(
            format!("Scratch Buffer {}", self.scratch_created),
            BufferUsage::UnorderedAccess,
            size,
        )
        .with_alignment(SCRATCH_BUFFER_ALIGNMENT);
        let buffer = Buffer::create(device, &desc)?;
        self.scratch_created += 1;
        Ok(buffer)
    }

    /// Parks a scratch buffer until `target` retires.
    ///
    /// A buffer without unordered access is handed back unchanged.
    pub fn return_scratch_buffer(
        &mut self,
        target: SlotTarget,
        buffer: Buffer<D>,
    ) -> Result<(), Buffer<D>> {
        if buffer.usage() != BufferUsage::UnorderedAccess {
            return Err(buffer);
        }
        self.scratch_returned.push(target, buffer);
        Ok(())
    }

    // =========================================================================
    // Frame slots
    // =========================================================================

    /// Moves buffers returned in a retired slot to the free lists.
    pub fn reclaim_slot(&mut self, slot: usize) {
        let staging = self.staging_returned.take_slot(slot);
        let scratch = self.scratch_returned.take_slot(slot);
        if !staging.is_empty() || !scratch.is_empty() {
            debug!(
                "Slot {}: reclaimed {} staging and {} scratch buffer(s)",
                slot,
                staging.len(),
                scratch.len()
            );
        }
        self.staging_free.extend(staging);
        self.scratch_free.extend(scratch);
    }

    /// Puts staging buffers whose last reader has already retired straight
    /// back on the free list.
    pub fn recycle_staging(&mut self, buffers: Vec<Buffer<D>>) {
        if !buffers.is_empty() {
            trace!("Recycled {} retired staging buffer(s)", buffers.len());
        }
        self.staging_free.extend(buffers);
    }

    /// Moves buffers returned between frames into `slot`.
    pub fn adopt_carry(&mut self, slot: usize) {
        self.staging_returned.adopt_carry(slot);
        self.scratch_returned.adopt_carry(slot);
    }

    /// Destroys every pooled buffer. The GPU must be idle.
    pub fn release_all(&mut self) -> usize {
        let mut released = self.staging_free.len() + self.scratch_free.len();
        self.staging_free.clear();
        self.scratch_free.clear();
        released += self.staging_returned.drain_all().len();
        released += self.scratch_returned.drain_all().len();
        released
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    #[inline]
    pub fn staging_free(&self) -> usize {
        self.staging_free.len()
    }

    #[inline]
    pub fn staging_returned(&self) -> usize {
        self.staging_returned.len()
    }

    #[inline]
    pub fn scratch_free(&self) -> usize {
        self.scratch_free.len()
    }

    #[inline]
    pub fn scratch_returned(&self) -> usize {
        self.scratch_returned.len()
    }
}
