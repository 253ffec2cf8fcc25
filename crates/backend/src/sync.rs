//! Frame slot synchronization.
//!
//! # Overview
//!
//! The [`FrameSynchronizer`] tracks one monotonic fence per queue and, for
//! each of the N frame slots, the direct-fence value that marks the end of the
//! slot's last use. Reusing a slot first blocks until the fence has reached
//! that value; this is the only place the CPU ever waits for the GPU during
//! normal operation.
//!
//! ```text
//!            begin_frame            end_frame            begin_frame (N frames later)
//! Free ──wait──────────► InFlight ──signal──► Retiring ──wait reached──► Free
//! ```
//!
//! Fence values only ever increase. A frame counter that does not exceed the
//! last value used is replaced by the next free value.

use std::fmt;

use tracing::{debug, error, trace};

use inflight_rhi::gpu::{GpuDevice, QueueKind, WaitStatus};

use crate::error::{BackendError, BackendResult};

/// Lifecycle state of a frame slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// No GPU work outstanding.
    Free,
    /// The CPU is recording the slot's frame.
    InFlight,
    /// Submitted; the target value is signaled but may not be reached.
    Retiring,
}

#[derive(Clone, Copy, Debug)]
struct FrameSlot {
    /// Direct-fence value that retires the slot's last use.
    target: u64,
    /// Whether a signal of `target` has been queued.
    signaled: bool,
    state: SlotState,
}

/// Per-slot fence targets over one direct-queue fence and one copy-queue fence.
pub struct FrameSynchronizer<D: GpuDevice> {
    direct_fence: D::Fence,
    copy_fence: D::Fence,
    slots: Vec<FrameSlot>,
    cur_slot: usize,
    /// Highest value assigned on the direct fence.
    last_direct: u64,
    /// Highest value signaled on the copy fence.
    last_copy: u64,
}

impl<D: GpuDevice> FrameSynchronizer<D> {
    /// Creates both fences at zero and `slot_count` free slots.
    ///
    /// # Errors
    ///
    /// Returns an error if a fence cannot be created.
    pub fn new(device: &D, slot_count: usize) -> BackendResult<Self> {
        let direct_fence = device.create_fence(0)?;
        let copy_fence = device.create_fence(0)?;
        let slots = vec![
            FrameSlot {
                target: 0,
                signaled: true,
                state: SlotState::Free,
            };
            slot_count
        ];

        Ok(Self {
            direct_fence,
            copy_fence,
            slots,
            cur_slot: 0,
            last_direct: 0,
            last_copy: 0,
        })
    }

    #[inline]
    pub fn current_slot(&self) -> usize {
        self.cur_slot
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot].state
    }

    pub fn slot_target(&self, slot: usize) -> u64 {
        self.slots[slot].target
    }

    /// Blocks until the current slot's previous use has retired.
    ///
    /// If the slot's target was never queued for signaling, it is signaled
    /// first so the wait cannot deadlock.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::WaitFailed`] if the wait ends without reaching
    /// the target, or the device error that interrupted it.
    pub fn prepare_slot(&mut self, device: &D) -> BackendResult<()> {
        let slot = self.cur_slot;
        let target = self.slots[slot].target;

        if !self.slots[slot].signaled {
            debug!("Slot {}: signaling unsignaled target {}", slot, target);
            device
                .signal(QueueKind::Direct, &self.direct_fence, target)
                .map_err(BackendError::submission)?;
            self.slots[slot].signaled = true;
        }

        self.wait_direct(device, target)?;
        self.slots[slot].state = SlotState::Free;
        trace!("Slot {} retired at {}", slot, target);
        Ok(())
    }

    /// Makes direct-queue work submitted from now on wait for all copy-queue
    /// work submitted so far. Returns the copy-fence value used.
    ///
    /// # Errors
    ///
    /// Returns the device error if the signal or wait cannot be queued.
    pub fn order_copy_before_direct(
        &mut self,
        device: &D,
        requested: Option<u64>,
    ) -> BackendResult<u64> {
        let value = match requested {
            Some(value) if value > self.last_copy => value,
            Some(value) => {
                debug!(
                    "Copy fence value {} already used, using {}",
                    value,
                    self.last_copy + 1
                );
                self.last_copy + 1
            }
            None => self.last_copy + 1,
        };

        device
            .signal(QueueKind::Copy, &self.copy_fence, value)
            .map_err(BackendError::submission)?;
        device
            .queue_wait(QueueKind::Direct, &self.copy_fence, value)
            .map_err(BackendError::submission)?;
        self.last_copy = value;
        Ok(value)
    }

    /// Records the current slot's new target and marks it in flight.
    pub fn arm_slot(&mut self, frame_counter: u64) -> u64 {
        let value = if frame_counter > self.last_direct {
            frame_counter
        } else {
            debug!(
                "Frame counter {} does not advance the fence past {}, using {}",
                frame_counter,
                self.last_direct,
                self.last_direct + 1
            );
            self.last_direct + 1
        };
        self.last_direct = value;

        let slot = &mut self.slots[self.cur_slot];
        slot.target = value;
        slot.signaled = false;
        slot.state = SlotState::InFlight;
        value
    }

    /// Queues the signal of the current slot's target on the direct queue.
    ///
    /// # Errors
    ///
    /// Returns the device error if the signal cannot be queued.
    pub fn signal_slot(&mut self, device: &D) -> BackendResult<u64> {
        let slot = &mut self.slots[self.cur_slot];
        device
            .signal(QueueKind::Direct, &self.direct_fence, slot.target)
            .map_err(BackendError::submission)?;
        slot.signaled = true;
        slot.state = SlotState::Retiring;
        Ok(slot.target)
    }

    pub fn advance(&mut self) {
        self.cur_slot = (self.cur_slot + 1) % self.slots.len();
    }

    /// Waits for every slot in turn, then for a fresh signal behind all
    /// submitted work. Every slot is free afterwards.
    ///
    /// # Errors
    ///
    /// Returns the first wait failure or device error.
    pub fn wait_idle(&mut self, device: &D) -> BackendResult<()> {
        for slot in 0..self.slots.len() {
            let target = self.slots[slot].target;
            if !self.slots[slot].signaled {
                device
                    .signal(QueueKind::Direct, &self.direct_fence, target)
                    .map_err(BackendError::submission)?;
                self.slots[slot].signaled = true;
            }
            self.wait_direct(device, target)?;
        }

        let fresh = self.last_direct + 1;
        device
            .signal(QueueKind::Direct, &self.direct_fence, fresh)
            .map_err(BackendError::submission)?;
        self.wait_direct(device, fresh)?;
        self.last_direct = fresh;

        for slot in &mut self.slots {
            slot.state = SlotState::Free;
        }
        debug!("All {} frame slot(s) idle at {}", self.slots.len(), fresh);
        Ok(())
    }

    /// Frees retiring slots whose target has been reached, without blocking.
    /// Returns how many slots changed state.
    ///
    /// # Errors
    ///
    /// Returns the device error if the fence cannot be read.
    pub fn poll(&mut self, device: &D) -> BackendResult<usize> {
        let completed = device.completed_value(&self.direct_fence)?;
        let mut retired = 0;
        for slot in &mut self.slots {
            if slot.state == SlotState::Retiring && slot.target <= completed {
                slot.state = SlotState::Free;
                retired += 1;
            }
        }
        Ok(retired)
    }

    /// Last value the direct fence has reached.
    ///
    /// # Errors
    ///
    /// Returns the device error if the fence cannot be read.
    pub fn completed_value(&self, device: &D) -> BackendResult<u64> {
        Ok(device.completed_value(&self.direct_fence)?)
    }

    fn wait_direct(&self, device: &D, value: u64) -> BackendResult<()> {
        if value == 0 || device.completed_value(&self.direct_fence)? >= value {
            return Ok(());
        }

        match device.wait_for_value(&self.direct_fence, value, None)? {
            WaitStatus::Reached => Ok(()),
            status => {
                error!("Wait for direct fence value {} ended: {:?}", value, status);
                Err(BackendError::WaitFailed {
                    value,
                    reason: match status {
                        WaitStatus::TimedOut => "timed out".to_string(),
                        _ => "abandoned".to_string(),
                    },
                })
            }
        }
    }
}

impl<D: GpuDevice> fmt::Debug for FrameSynchronizer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSynchronizer")
            .field("slots", &self.slots)
            .field("cur_slot", &self.cur_slot)
            .field("last_direct", &self.last_direct)
            .field("last_copy", &self.last_copy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inflight_rhi::mock::{MockDevice, WaitBehavior};

    #[test]
    fn test_first_use_does_not_wait() {
        let device = MockDevice::new();
        let mut sync = FrameSynchronizer::new(&device, 2).unwrap();
        sync.prepare_slot(&device).unwrap();
        assert_eq!(device.blocking_waits(), 0);
    }

    #[test]
    fn test_slot_lifecycle() {
        let device = MockDevice::new();
        let mut sync = FrameSynchronizer::new(&device, 1).unwrap();

        sync.prepare_slot(&device).unwrap();
        assert_eq!(sync.arm_slot(1), 1);
        assert_eq!(sync.slot_state(0), SlotState::InFlight);

        assert_eq!(sync.signal_slot(&device).unwrap(), 1);
        assert_eq!(sync.slot_state(0), SlotState::Retiring);
        sync.advance();

        sync.prepare_slot(&device).unwrap();
        assert_eq!(device.blocking_waits(), 1);
        assert_eq!(sync.slot_state(0), SlotState::Free);
        assert_eq!(sync.completed_value(&device).unwrap(), 1);
    }

    #[test]
    fn test_targets_are_strictly_increasing() {
        let device = MockDevice::new();
        let mut sync = FrameSynchronizer::new(&device, 3).unwrap();
        assert_eq!(sync.arm_slot(5), 5);
        sync.advance();
        assert_eq!(sync.arm_slot(5), 6);
        sync.advance();
        assert_eq!(sync.arm_slot(2), 7);
    }

    #[test]
    fn test_unsignaled_target_is_signaled_before_waiting() {
        let device = MockDevice::new();
        let mut sync = FrameSynchronizer::new(&device, 1).unwrap();
        sync.arm_slot(1);

        // No end of frame: the guard signals so the wait can finish.
        sync.prepare_slot(&device).unwrap();
        assert_eq!(sync.completed_value(&device).unwrap(), 1);
    }

    #[test]
    fn test_timed_out_wait_is_an_error() {
        let device = MockDevice::new();
        device.set_wait_behavior(WaitBehavior::TimeOut);
        let mut sync = FrameSynchronizer::new(&device, 1).unwrap();
        sync.arm_slot(1);
        sync.signal_slot(&device).unwrap();

        let err = sync.prepare_slot(&device).unwrap_err();
        assert!(matches!(err, BackendError::WaitFailed { value: 1, .. }));
        assert_eq!(sync.slot_state(0), SlotState::Retiring);
    }

    #[test]
    fn test_copy_values_are_strictly_increasing() {
        let device = MockDevice::new();
        let mut sync = FrameSynchronizer::new(&device, 2).unwrap();
        assert_eq!(sync.order_copy_before_direct(&device, Some(1)).unwrap(), 1);
        assert_eq!(sync.order_copy_before_direct(&device, None).unwrap(), 2);
        assert_eq!(sync.order_copy_before_direct(&device, Some(2)).unwrap(), 3);
        assert_eq!(sync.order_copy_before_direct(&device, Some(10)).unwrap(), 10);
    }

    #[test]
    fn test_poll_frees_reached_slots() {
        let device = MockDevice::new();
        let mut sync = FrameSynchronizer::new(&device, 2).unwrap();
        sync.arm_slot(1);
        sync.signal_slot(&device).unwrap();

        assert_eq!(sync.poll(&device).unwrap(), 0);
        device.run_until_idle();
        assert_eq!(sync.poll(&device).unwrap(), 1);
        assert_eq!(sync.slot_state(0), SlotState::Free);
    }

    #[test]
    fn test_wait_idle_drains_everything() {
        let device = MockDevice::new();
        let mut sync = FrameSynchronizer::new(&device, 2).unwrap();
        sync.arm_slot(1);
        sync.signal_slot(&device).unwrap();
        sync.advance();
        sync.arm_slot(2);

        sync.wait_idle(&device).unwrap();
        assert_eq!(sync.completed_value(&device).unwrap(), 3);
        assert_eq!(sync.slot_state(0), SlotState::Free);
        assert_eq!(sync.slot_state(1), SlotState::Free);
    }
}
