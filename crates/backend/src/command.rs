//! Command allocators, command lists and per-slot submission.
//!
//! # Overview
//!
//! Every command list is opened from its own [`CommandAllocator`], which
//! travels with the list until the GPU has retired it:
//!
//! ```text
//! acquire ──► Recording ──submit──► Closed ──end_frame──► Submitted ──slot retired──► Retired
//!    ▲                               (pending[slot])        (in_flight[slot])            │
//!    └──────────────── allocator back to the free pool ◄─────────────────────────────────┘
//! ```
//!
//! An allocator is only reset when it is taken from the free pool again, and
//! [`CommandAllocator::reset`] refuses to reset one whose lists might still
//! execute. Staging buffers a list copies from ride along the same way and are
//! handed back for reuse only when the slot the list executed in retires.

use std::fmt;

use tracing::{debug, error, trace, warn};

use inflight_rhi::gpu::{GpuDevice, QueueKind, WaitStatus};

use crate::buffer::Buffer;
use crate::diagnostics::{CommandHistory, SubmissionRecord};
use crate::error::{BackendError, BackendResult};
use crate::slots::{PerSlot, SlotTarget};

/// Lifecycle of a command allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorState {
    /// Reset, or never used.
    Idle,
    /// A list is being recorded from it.
    Recording,
    /// A list from it was executed. `retire_at` is the direct-fence value
    /// that retires it, once the frame has been signaled.
    InFlight { retire_at: Option<u64> },
}

/// Backing storage for command lists, with its in-flight state.
pub struct CommandAllocator<D: GpuDevice> {
    raw: D::CommandAllocator,
    queue: QueueKind,
    state: AllocatorState,
}

impl<D: GpuDevice> CommandAllocator<D> {
    /// Creates an idle allocator for `queue`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot create it.
    pub fn new(device: &D, queue: QueueKind) -> BackendResult<Self> {
        let raw = device.create_command_allocator(queue)?;
        debug!("Created {} command allocator", queue.name());
        Ok(Self {
            raw,
            queue,
            state: AllocatorState::Idle,
        })
    }

    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    #[inline]
    pub fn state(&self) -> AllocatorState {
        self.state
    }

    /// Resets the allocator for a new recording.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::AllocatorInFlight`] unless the allocator is
    /// idle, recording, or retired by `completed`.
    pub fn reset(&mut self, device: &D, completed: u64) -> BackendResult<()> {
        if let AllocatorState::InFlight { retire_at } = self.state {
            match retire_at {
                Some(value) if value <= completed => {}
                _ => {
                    return Err(BackendError::AllocatorInFlight {
                        retire_at,
                        completed,
                    });
                }
            }
        }
        device.reset_command_allocator(&mut self.raw)?;
        self.state = AllocatorState::Idle;
        Ok(())
    }

    /// Marks an in-flight allocator idle if `completed` retires it.
    pub fn retire(&mut self, completed: u64) -> bool {
        match self.state {
            AllocatorState::InFlight {
                retire_at: Some(value),
            } if value <= completed => {
                self.state = AllocatorState::Idle;
                true
            }
            AllocatorState::InFlight { .. } => false,
            AllocatorState::Idle | AllocatorState::Recording => true,
        }
    }

    /// Whether `retire(completed)` would succeed.
    fn is_retired_by(&self, completed: u64) -> bool {
        match self.state {
            AllocatorState::InFlight { retire_at } => retire_at.is_some_and(|v| v <= completed),
            AllocatorState::Idle | AllocatorState::Recording => true,
        }
    }

    fn mark_in_flight(&mut self) {
        self.state = AllocatorState::InFlight { retire_at: None };
    }

    fn stamp(&mut self, target: u64) {
        if self.state == (AllocatorState::InFlight { retire_at: None }) {
            self.state = AllocatorState::InFlight {
                retire_at: Some(target),
            };
        }
    }
}

/// Lifecycle of a command list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandListState {
    Recording,
    Closed,
    Submitted,
    Retired,
}

/// A command list together with the allocator it records into.
pub struct CommandList<D: GpuDevice> {
    raw: D::CommandList,
    allocator: CommandAllocator<D>,
    /// Staging buffers read by recorded copies.
    staging: Vec<Buffer<D>>,
    queue: QueueKind,
    slot: SlotTarget,
    name: String,
    id: u64,
    state: CommandListState,
}

impl<D: GpuDevice> CommandList<D> {
    /// Native list, for recording.
    #[inline]
    pub fn raw(&self) -> &D::CommandList {
        &self.raw
    }

    #[inline]
    pub fn raw_mut(&mut self) -> &mut D::CommandList {
        &mut self.raw
    }

    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    /// Frame slot the list was issued for.
    #[inline]
    pub fn slot(&self) -> SlotTarget {
        self.slot
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> CommandListState {
        self.state
    }

    #[inline]
    pub fn allocator(&self) -> &CommandAllocator<D> {
        &self.allocator
    }

    /// Staging buffers held until the list retires.
    #[inline]
    pub fn staging_buffers(&self) -> usize {
        self.staging.len()
    }

    /// Keeps `buffer` alive and out of the pool until the GPU has retired
    /// this list.
    pub(crate) fn attach_staging(&mut self, buffer: Buffer<D>) {
        self.staging.push(buffer);
    }
}

impl<D: GpuDevice> fmt::Debug for CommandList<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("slot", &self.slot)
            .field("state", &self.state)
            .field("staging", &self.staging.len())
            .finish()
    }
}

/// Recycles allocators and batches command lists per frame slot.
pub struct CommandSubmitter<D: GpuDevice> {
    free: [Vec<CommandAllocator<D>>; 2],
    pending: PerSlot<CommandList<D>>,
    in_flight: Vec<Vec<CommandList<D>>>,
    /// Staging buffers of retired lists, waiting to go back to the pool.
    retired_staging: Vec<Buffer<D>>,
    /// Lists handed out and not yet submitted.
    outstanding: usize,
    next_id: u64,
    /// Highest completed direct-fence value seen at a reclaim.
    last_completed: u64,
    verify_every_submission: bool,
    history: CommandHistory,
}

impl<D: GpuDevice> CommandSubmitter<D> {
    pub fn new(slot_count: usize, verify_every_submission: bool, history_len: usize) -> Self {
        if verify_every_submission {
            warn!("Every command list submission will be verified with a blocking wait");
        }
        Self {
            free: [Vec::new(), Vec::new()],
            pending: PerSlot::new(slot_count),
            in_flight: (0..slot_count).map(|_| Vec::new()).collect(),
            retired_staging: Vec::new(),
            outstanding: 0,
            next_id: 0,
            last_completed: 0,
            verify_every_submission,
            history: CommandHistory::new(history_len),
        }
    }

    /// Hands out a list in the recording state, tagged with `slot`.
    ///
    /// # Errors
    ///
    /// Returns an error if an allocator cannot be created or reset, or the
    /// list cannot be opened.
    pub fn acquire(
        &mut self,
        device: &D,
        queue: QueueKind,
        slot: SlotTarget,
        name: Option<&str>,
    ) -> BackendResult<CommandList<D>> {
        let mut allocator = match self.free[queue.index()].pop() {
            Some(allocator) => allocator,
            None => CommandAllocator::new(device, queue)?,
        };

        if let Err(e) = allocator.reset(device, self.last_completed) {
            error!("Failed to reset {} command allocator: {}", queue.name(), e);
            if !matches!(e, BackendError::AllocatorInFlight { .. }) {
                self.free[queue.index()].push(allocator);
            }
            return Err(e);
        }

        let raw = match device.open_command_list(&mut allocator.raw) {
            Ok(raw) => raw,
            Err(e) => {
                error!("Failed to open {} command list: {}", queue.name(), e);
                self.free[queue.index()].push(allocator);
                return Err(BackendError::CommandList(e.to_string()));
            }
        };
        allocator.state = AllocatorState::Recording;

        self.next_id += 1;
        self.outstanding += 1;
        let id = self.next_id;
        let name = name.map_or_else(|| format!("{} list {}", queue.name(), id), str::to_string);
        trace!("Acquired command list '{}' for {:?}", name, slot);

        Ok(CommandList {
            raw,
            allocator,
            staging: Vec::new(),
            queue,
            slot,
            name,
            id,
            state: CommandListState::Recording,
        })
    }

    /// Closes `list` and queues it for execution with `target`'s batch.
    ///
    /// A list acquired for another slot is retagged; whatever it holds
    /// (allocator, staging buffers) then retires with `target`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::CommandList`] if the list fails to close in a
    /// debug build. Release builds log the failure, drop the list and continue.
    pub fn submit(
        &mut self,
        device: &D,
        mut list: CommandList<D>,
        target: SlotTarget,
    ) -> BackendResult<()> {
        self.outstanding = self.outstanding.saturating_sub(1);

        if list.state != CommandListState::Recording {
            return Err(BackendError::InvalidRequest(format!(
                "command list '{}' submitted in state {:?}",
                list.name, list.state
            )));
        }
        if list.slot != target {
            warn!(
                "Command list '{}' acquired for {:?} submitted in {:?}",
                list.name, list.slot, target
            );
            list.slot = target;
        }

        if let Err(e) = device.close_command_list(&mut list.raw) {
            error!("Failed to close command list '{}': {}", list.name, e);
            if cfg!(debug_assertions) {
                return Err(BackendError::CommandList(e.to_string()));
            }
            // Never executed, so everything it holds can be reused right away.
            let CommandList {
                mut allocator,
                staging,
                ..
            } = list;
            allocator.state = AllocatorState::Idle;
            self.free[allocator.queue.index()].push(allocator);
            self.retired_staging.extend(staging);
            return Ok(());
        }

        list.state = CommandListState::Closed;
        self.pending.push(target, list);
        Ok(())
    }

    /// Executes the pending lists of `slot` for `queue`, in submission order,
    /// and moves them in flight. Returns how many lists ran.
    ///
    /// All lists go out in one batch, unless per-submission verification is
    /// on, in which case each list is executed and waited for on its own.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Submission`] (or `DeviceLost`) if the queue
    /// rejects a batch, or [`BackendError::WaitFailed`] if a verification wait
    /// fails. Lists that did reach the queue stay in flight on `slot`; the rest
    /// stay pending.
    pub fn execute_pending(
        &mut self,
        device: &D,
        slot: usize,
        queue: QueueKind,
        frame: u64,
    ) -> BackendResult<usize> {
        let (lists, others): (Vec<_>, Vec<_>) = self
            .pending
            .take_slot(slot)
            .into_iter()
            .partition(|list| list.queue == queue);
        for other in others {
            self.pending.push(SlotTarget::Slot(slot), other);
        }
        if lists.is_empty() {
            return Ok(0);
        }

        let mut executed = Vec::with_capacity(lists.len());
        let mut failure = None;
        if self.verify_every_submission {
            let mut lists = lists.into_iter();
            for list in lists.by_ref() {
                if let Err(e) = device.execute_command_lists(queue, &[&list.raw]) {
                    self.pending.push(SlotTarget::Slot(slot), list);
                    failure = Some(BackendError::submission(e));
                    break;
                }
                let verified = Self::verify(device, queue, &list.name);
                executed.push(list);
                if let Err(e) = verified {
                    failure = Some(e);
                    break;
                }
            }
            for list in lists {
                self.pending.push(SlotTarget::Slot(slot), list);
            }
        } else {
            let result = {
                let raws: Vec<&D::CommandList> = lists.iter().map(|list| &list.raw).collect();
                device.execute_command_lists(queue, &raws)
            };
            match result {
                Ok(()) => executed = lists,
                Err(e) => {
                    for list in lists {
                        self.pending.push(SlotTarget::Slot(slot), list);
                    }
                    failure = Some(BackendError::submission(e));
                }
            }
        }

        let count = executed.len();
        for mut list in executed {
            list.state = CommandListState::Submitted;
            list.allocator.mark_in_flight();
            self.history.record(SubmissionRecord {
                frame,
                slot,
                queue,
                name: list.name.clone(),
            });
            self.in_flight[slot].push(list);
        }
        trace!(
            "Slot {}: executed {} {} list(s)",
            slot,
            count,
            queue.name()
        );

        match failure {
            Some(e) => {
                error!(
                    "Slot {}: {} submission stopped after {} list(s): {}",
                    slot,
                    queue.name(),
                    count,
                    e
                );
                Err(e)
            }
            None => Ok(count),
        }
    }

    fn verify(device: &D, queue: QueueKind, name: &str) -> BackendResult<()> {
        let fence = device.create_fence(0)?;
        device
            .signal(queue, &fence, 1)
            .map_err(BackendError::submission)?;
        match device.wait_for_value(&fence, 1, None)? {
            WaitStatus::Reached => Ok(()),
            status => Err(BackendError::WaitFailed {
                value: 1,
                reason: format!("verification of '{name}' ended: {status:?}"),
            }),
        }
    }

    /// Records the fence value that retires everything executed in `slot`.
    pub fn stamp_slot(&mut self, slot: usize, target: u64) {
        for list in &mut self.in_flight[slot] {
            list.allocator.stamp(target);
        }
    }

    /// Returns the allocators of a retired slot to the free pools. Their
    /// staging buffers become available through
    /// [`CommandSubmitter::take_retired_staging`].
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::AllocatorInFlight`] if `completed` does not
    /// retire one of them; nothing is reclaimed in that case.
    pub fn reclaim_slot(&mut self, slot: usize, completed: u64) -> BackendResult<usize> {
        if let Some(list) = self.in_flight[slot]
            .iter()
            .find(|list| !list.allocator.is_retired_by(completed))
        {
            let retire_at = match list.allocator.state {
                AllocatorState::InFlight { retire_at } => retire_at,
                _ => None,
            };
            return Err(BackendError::AllocatorInFlight {
                retire_at,
                completed,
            });
        }

        self.last_completed = self.last_completed.max(completed);
        let lists = std::mem::take(&mut self.in_flight[slot]);
        let count = lists.len();
        for mut list in lists {
            list.state = CommandListState::Retired;
            trace!("Command list '{}' {:?}", list.name, list.state);
            let CommandList {
                raw,
                mut allocator,
                staging,
                ..
            } = list;
            drop(raw);
            allocator.retire(completed);
            self.free[allocator.queue.index()].push(allocator);
            self.retired_staging.extend(staging);
        }
        if count > 0 {
            trace!("Slot {}: reclaimed {} command allocator(s)", slot, count);
        }
        Ok(count)
    }

    /// Staging buffers whose lists have retired (or never executed).
    pub fn take_retired_staging(&mut self) -> Vec<Buffer<D>> {
        std::mem::take(&mut self.retired_staging)
    }

    /// Moves lists submitted between frames into `slot`.
    pub fn adopt_carry(&mut self, slot: usize) -> usize {
        self.pending.adopt_carry(slot)
    }

    /// Drops every list and allocator. The GPU must be idle.
    pub fn release_all(&mut self) -> usize {
        let mut released = self.pending.drain_all().len();
        for slot in &mut self.in_flight {
            released += slot.len();
            slot.clear();
        }
        for pool in &mut self.free {
            released += pool.len();
            pool.clear();
        }
        released += self.retired_staging.len();
        self.retired_staging.clear();
        released
    }

    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn pending_lists(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_in_slot(&self, slot: usize, queue: QueueKind) -> usize {
        self.pending
            .slot(slot)
            .iter()
            .filter(|list| list.queue == queue)
            .count()
    }

    pub fn in_flight_lists(&self) -> usize {
        self.in_flight.iter().map(Vec::len).sum()
    }

    /// Staging buffers held by pending and in-flight lists.
    pub fn staging_in_flight(&self) -> usize {
        self.pending
            .iter()
            .chain(self.in_flight.iter().flatten())
            .map(CommandList::staging_buffers)
            .sum()
    }

    pub fn free_allocators(&self) -> usize {
        self.free.iter().map(Vec::len).sum()
    }

    #[inline]
    pub fn history(&self) -> &CommandHistory {
        &self.history
    }
}
