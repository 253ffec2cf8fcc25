//! Fence-gated resource destruction.
//!
//! Destroying a resource never releases it immediately. It is parked on the
//! frame slot in which it was scheduled and released when that slot is next
//! revisited and its fence has been confirmed reached, one full trip around
//! the slot ring later.

use tracing::debug;

use inflight_rhi::gpu::GpuDevice;

use crate::buffer::{Buffer, Texture};
use crate::descriptor::DescriptorRange;
use crate::slots::{PerSlot, SlotTarget};

/// Buffers, textures and descriptor ranges waiting for their slot to retire.
pub struct DeferredDestructionQueue<D: GpuDevice> {
    buffers: PerSlot<Buffer<D>>,
    textures: PerSlot<Texture<D>>,
    descriptors: PerSlot<DescriptorRange>,
}

/// What draining a slot released.
#[derive(Debug, Default)]
pub struct DrainedSlot {
    pub buffers: usize,
    pub textures: usize,
    /// Ranges the caller must hand back to their allocators.
    pub descriptors: Vec<DescriptorRange>,
}

impl<D: GpuDevice> DeferredDestructionQueue<D> {
    pub fn new(slot_count: usize) -> Self {
        Self {
            buffers: PerSlot::new(slot_count),
            textures: PerSlot::new(slot_count),
            descriptors: PerSlot::new(slot_count),
        }
    }

    pub fn schedule_buffer_destruction(&mut self, target: SlotTarget, buffer: Buffer<D>) {
        debug!("Buffer '{}' scheduled for destruction in {:?}", buffer.name(), target);
        self.buffers.push(target, buffer);
    }

    pub fn schedule_texture_destruction(&mut self, target: SlotTarget, texture: Texture<D>) {
        debug!("Texture '{}' scheduled for destruction in {:?}", texture.name(), target);
        self.textures.push(target, texture);
    }

    /// Holds a descriptor range back from reuse until `target` retires.
    pub fn schedule_descriptor_release(&mut self, target: SlotTarget, range: DescriptorRange) {
        self.descriptors.push(target, range);
    }

    /// Releases everything parked on a retired slot.
    pub fn drain_slot(&mut self, slot: usize) -> DrainedSlot {
        let buffers = self.buffers.take_slot(slot);
        let textures = self.textures.take_slot(slot);
        let drained = DrainedSlot {
            buffers: buffers.len(),
            textures: textures.len(),
            descriptors: self.descriptors.take_slot(slot),
        };
        drop(buffers);
        drop(textures);

        if drained.buffers + drained.textures > 0 {
            debug!(
                "Slot {}: released {} buffer(s) and {} texture(s)",
                slot, drained.buffers, drained.textures
            );
        }
        drained
    }

    /// Moves entries scheduled between frames into `slot`.
    pub fn adopt_carry(&mut self, slot: usize) {
        self.buffers.adopt_carry(slot);
        self.textures.adopt_carry(slot);
        self.descriptors.adopt_carry(slot);
    }

    /// Buffers and textures waiting for release.
    pub fn pending_count(&self) -> usize {
        self.buffers.len() + self.textures.len()
    }

    pub fn pending_descriptor_ranges(&self) -> usize {
        self.descriptors.len()
    }

    /// Releases everything at once. The GPU must be idle.
    pub fn release_all(&mut self) -> usize {
        let released = self.buffers.drain_all().len() + self.textures.drain_all().len();
        self.descriptors.drain_all();
        released
    }
}
