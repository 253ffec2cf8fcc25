//! Deterministic in-memory [`GpuDevice`] for tests.
//!
//! The mock keeps one FIFO of operations per queue. Nothing executes until a
//! test drives it with [`MockDevice::run_until_idle`], or until the backend
//! blocks on a fence value and the wait behavior lets the "GPU" catch up.
//! That makes every frame of latency observable: a test can submit three
//! frames, run none of them, and check exactly what was reclaimed.
//!
//! Enabled for this crate's tests and for dependents through the `mock` feature.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use tracing::trace;

use crate::error::{RhiError, RhiResult};
use crate::gpu::{
    DescriptorHeapKind, DescriptorHeapLayout, GpuDevice, NativeBuffer, QueueKind, Swapchain,
    WaitStatus,
};
use crate::resource::{BufferResourceDesc, BufferUsage, TextureResourceDesc, TextureState};

/// What a blocking CPU wait does when the fence has not reached the value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitBehavior {
    /// Run queued GPU work until the value is reached.
    AutoComplete,
    /// Report a timeout without running anything.
    TimeOut,
    /// Report an abandoned wait.
    Abandon,
}

#[derive(Clone, Debug)]
enum QueueOp {
    Execute { lists: Vec<(u64, u64)> },
    Signal { fence: usize, value: u64 },
    Wait { fence: usize, value: u64 },
}

struct MockState {
    dedicated_copy: bool,
    queues: [VecDeque<QueueOp>; 2],
    fences: Vec<u64>,
    wait_behavior: WaitBehavior,
    blocking_waits: u32,
    lost: bool,

    next_id: u64,
    live_buffers: usize,
    live_textures: usize,
    live_allocators: usize,
    released: Vec<String>,

    /// Lists of each allocator that were submitted but have not executed.
    executing: HashMap<u64, u32>,
    executed: Vec<(QueueKind, u64)>,
    reset_violations: u32,
    transitions: Vec<(String, TextureState, TextureState)>,
    copies: u32,
    presents: u32,

    failing_allocations: u32,
    fail_next_close: bool,
    /// Queue executions left before one fails; 0 disables.
    failing_execution: u32,
}

impl MockState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn queue_index(&self, queue: QueueKind) -> usize {
        if self.dedicated_copy {
            queue.index()
        } else {
            QueueKind::Direct.index()
        }
    }

    fn check_lost(&self) -> RhiResult<()> {
        if self.lost {
            Err(RhiError::DeviceLost("mock device removed".to_string()))
        } else {
            Ok(())
        }
    }

    fn take_allocation_failure(&mut self) -> bool {
        if self.failing_allocations > 0 {
            self.failing_allocations -= 1;
            true
        } else {
            false
        }
    }

    /// Runs the head operation of `queue` if it can make progress.
    fn step_queue(&mut self, index: usize) -> bool {
        let queue = if index == 0 {
            QueueKind::Direct
        } else {
            QueueKind::Copy
        };
        let Some(op) = self.queues[index].front().cloned() else {
            return false;
        };
        match op {
            QueueOp::Execute { lists } => {
                for (list, allocator) in lists {
                    self.executed.push((queue, list));
                    if let Some(count) = self.executing.get_mut(&allocator) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
            QueueOp::Signal { fence, value } => {
                let current = &mut self.fences[fence];
                *current = (*current).max(value);
                trace!("mock {} queue signaled fence {} to {}", queue.name(), fence, value);
            }
            QueueOp::Wait { fence, value } => {
                if self.fences[fence] < value {
                    return false;
                }
            }
        }
        self.queues[index].pop_front();
        true
    }

    /// One operation per queue, round-robin.
    fn step(&mut self) -> bool {
        let direct = self.step_queue(0);
        let copy = self.step_queue(1);
        direct || copy
    }

    fn run_until(&mut self, fence: usize, value: u64) -> bool {
        while self.fences[fence] < value {
            if !self.step() {
                return false;
            }
        }
        true
    }

    fn run_until_idle(&mut self) {
        while self.step() {}
    }
}

/// Fake device; clones share state.
#[derive(Clone)]
pub struct MockDevice {
    state: Rc<RefCell<MockState>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// A device with separate direct and copy queues.
    pub fn new() -> Self {
        Self::with_copy_queue(true)
    }

    /// A device whose copy work lands on the direct queue.
    pub fn without_copy_queue() -> Self {
        Self::with_copy_queue(false)
    }

    fn with_copy_queue(dedicated_copy: bool) -> Self {
        Self {
            state: Rc::new(RefCell::new(MockState {
                dedicated_copy,
                queues: [VecDeque::new(), VecDeque::new()],
                fences: Vec::new(),
                wait_behavior: WaitBehavior::AutoComplete,
                blocking_waits: 0,
                lost: false,
                next_id: 0,
                live_buffers: 0,
                live_textures: 0,
                live_allocators: 0,
                released: Vec::new(),
                executing: HashMap::new(),
                executed: Vec::new(),
                reset_violations: 0,
                transitions: Vec::new(),
                copies: 0,
                presents: 0,
                failing_allocations: 0,
                fail_next_close: false,
                failing_execution: 0,
            })),
        }
    }

    // =========================================================================
    // GPU control
    // =========================================================================

    /// Executes every queued operation that can make progress.
    pub fn run_until_idle(&self) {
        self.state.borrow_mut().run_until_idle();
    }

    /// Runs queued operations until `fence` reaches `value`. Returns `false`
    /// if the queues stall first.
    pub fn run_until(&self, fence: &MockFence, value: u64) -> bool {
        self.state.borrow_mut().run_until(fence.index, value)
    }

    /// Number of operations still queued on `queue`.
    pub fn queued_ops(&self, queue: QueueKind) -> usize {
        let state = self.state.borrow();
        state.queues[state.queue_index(queue)].len()
    }

    pub fn set_wait_behavior(&self, behavior: WaitBehavior) {
        self.state.borrow_mut().wait_behavior = behavior;
    }

    /// CPU waits that found the fence short of the value.
    pub fn blocking_waits(&self) -> u32 {
        self.state.borrow().blocking_waits
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Makes the next `count` buffer or texture creations fail with out-of-memory.
    pub fn fail_next_allocations(&self, count: u32) {
        self.state.borrow_mut().failing_allocations = count;
    }

    /// Makes the next command list close fail.
    pub fn fail_next_close(&self) {
        self.state.borrow_mut().fail_next_close = true;
    }

    /// Makes the `nth` following queue execution (1-based) fail with
    /// out-of-memory without queuing its lists.
    pub fn fail_nth_execution(&self, nth: u32) {
        self.state.borrow_mut().failing_execution = nth;
    }

    /// Every later queue or fence operation reports device removal.
    pub fn lose_device(&self) {
        self.state.borrow_mut().lost = true;
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().live_buffers
    }

    pub fn live_textures(&self) -> usize {
        self.state.borrow().live_textures
    }

    pub fn live_allocators(&self) -> usize {
        self.state.borrow().live_allocators
    }

    /// Names of released buffers and textures, in release order.
    pub fn released_names(&self) -> Vec<String> {
        self.state.borrow().released.clone()
    }

    /// Executed command list ids with their queue, in execution order.
    pub fn executed_lists(&self) -> Vec<(QueueKind, u64)> {
        self.state.borrow().executed.clone()
    }

    /// Allocator resets attempted while lists were still executing.
    pub fn reset_violations(&self) -> u32 {
        self.state.borrow().reset_violations
    }

    pub fn transitions(&self) -> Vec<(String, TextureState, TextureState)> {
        self.state.borrow().transitions.clone()
    }

    pub fn copies_recorded(&self) -> u32 {
        self.state.borrow().copies
    }

    pub fn presents(&self) -> u32 {
        self.state.borrow().presents
    }

    fn on_release(state: &Rc<RefCell<MockState>>, name: &str, texture: bool) {
        if let Ok(mut state) = state.try_borrow_mut() {
            if texture {
                state.live_textures -= 1;
            } else {
                state.live_buffers -= 1;
            }
            state.released.push(name.to_string());
        }
    }
}

/// Fake buffer; upload-heap buffers carry real bytes.
pub struct MockBuffer {
    state: Rc<RefCell<MockState>>,
    name: String,
    size: u64,
    usage: BufferUsage,
    data: Option<Vec<u8>>,
}

impl MockBuffer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

impl NativeBuffer for MockBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn mapped_slice(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.data.as_deref_mut()
    }
}

impl Drop for MockBuffer {
    fn drop(&mut self) {
        MockDevice::on_release(&self.state, &self.name, false);
    }
}

pub struct MockTexture {
    state: Rc<RefCell<MockState>>,
    name: String,
}

impl MockTexture {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MockTexture {
    fn drop(&mut self) {
        MockDevice::on_release(&self.state, &self.name, true);
    }
}

pub struct MockDescriptorHeap {
    kind: DescriptorHeapKind,
    capacity: u32,
}

impl MockDescriptorHeap {
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

pub struct MockCommandAllocator {
    state: Rc<RefCell<MockState>>,
    id: u64,
    queue: QueueKind,
}

impl Drop for MockCommandAllocator {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_borrow_mut() {
            state.live_allocators -= 1;
            state.executing.remove(&self.id);
        }
    }
}

pub struct MockCommandList {
    id: u64,
    allocator: u64,
    queue: QueueKind,
    closed: bool,
    commands: u32,
}

impl MockCommandList {
    /// Id reported by [`MockDevice::executed_lists`].
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn recorded_commands(&self) -> u32 {
        self.commands
    }
}

pub struct MockFence {
    index: usize,
}

impl GpuDevice for MockDevice {
    type Buffer = MockBuffer;
    type Texture = MockTexture;
    type DescriptorHeap = MockDescriptorHeap;
    type CommandAllocator = MockCommandAllocator;
    type CommandList = MockCommandList;
    type Fence = MockFence;

    fn name(&self) -> String {
        "mock device".to_string()
    }

    fn has_dedicated_copy_queue(&self) -> bool {
        self.state.borrow().dedicated_copy
    }

    fn create_buffer(&self, desc: &BufferResourceDesc) -> RhiResult<MockBuffer> {
        desc.validate().map_err(RhiError::InvalidRequest)?;
        let mut state = self.state.borrow_mut();
        state.check_lost()?;
        if state.take_allocation_failure() {
            return Err(RhiError::OutOfMemory(format!(
                "mock heap exhausted creating '{}'",
                desc.name
            )));
        }
        state.live_buffers += 1;
        let data = desc.usage.is_mappable().then(|| vec![0u8; desc.size as usize]);
        Ok(MockBuffer {
            state: self.state.clone(),
            name: desc.name.clone(),
            size: desc.size,
            usage: desc.usage,
            data,
        })
    }

    fn create_texture(&self, desc: &TextureResourceDesc) -> RhiResult<MockTexture> {
        desc.validate().map_err(RhiError::InvalidRequest)?;
        let mut state = self.state.borrow_mut();
        state.check_lost()?;
        if state.take_allocation_failure() {
            return Err(RhiError::OutOfMemory(format!(
                "mock heap exhausted creating '{}'",
                desc.name
            )));
        }
        state.live_textures += 1;
        Ok(MockTexture {
            state: self.state.clone(),
            name: desc.name.clone(),
        })
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> RhiResult<MockDescriptorHeap> {
        if capacity == 0 {
            return Err(RhiError::InvalidRequest(format!(
                "{} descriptor heap needs a non-zero capacity",
                kind.name()
            )));
        }
        Ok(MockDescriptorHeap { kind, capacity })
    }

    fn descriptor_heap_layout(&self, heap: &MockDescriptorHeap) -> DescriptorHeapLayout {
        let base = 0x1000_0000 * (heap.kind.index() as u64 + 1);
        DescriptorHeapLayout {
            cpu_base: base,
            gpu_base: heap.kind.is_shader_visible().then_some(0x8000_0000 + base),
            stride: 32,
        }
    }

    fn create_command_allocator(&self, queue: QueueKind) -> RhiResult<MockCommandAllocator> {
        let mut state = self.state.borrow_mut();
        state.check_lost()?;
        state.live_allocators += 1;
        let id = state.next_id();
        Ok(MockCommandAllocator {
            state: self.state.clone(),
            id,
            queue,
        })
    }

    fn reset_command_allocator(&self, allocator: &mut MockCommandAllocator) -> RhiResult<()> {
        let mut state = self.state.borrow_mut();
        let executing = state.executing.get(&allocator.id).copied().unwrap_or(0);
        if executing > 0 {
            state.reset_violations += 1;
            return Err(RhiError::InvalidRequest(format!(
                "reset of {} allocator with {} list(s) still executing",
                allocator.queue.name(),
                executing
            )));
        }
        Ok(())
    }

    fn open_command_list(&self, allocator: &mut MockCommandAllocator) -> RhiResult<MockCommandList> {
        let mut state = self.state.borrow_mut();
        state.check_lost()?;
        let id = state.next_id();
        Ok(MockCommandList {
            id,
            allocator: allocator.id,
            queue: allocator.queue,
            closed: false,
            commands: 0,
        })
    }

    fn close_command_list(&self, list: &mut MockCommandList) -> RhiResult<()> {
        let mut state = self.state.borrow_mut();
        if std::mem::take(&mut state.fail_next_close) {
            return Err(RhiError::CommandList(format!(
                "mock list {} failed to close",
                list.id
            )));
        }
        list.closed = true;
        Ok(())
    }

    fn execute_command_lists(
        &self,
        queue: QueueKind,
        lists: &[&MockCommandList],
    ) -> RhiResult<()> {
        if lists.is_empty() {
            return Ok(());
        }
        let mut state = self.state.borrow_mut();
        state.check_lost()?;
        if let Some(open) = lists.iter().find(|list| !list.closed) {
            return Err(RhiError::CommandList(format!(
                "mock list {} executed before it was closed",
                open.id
            )));
        }
        if state.failing_execution > 0 {
            state.failing_execution -= 1;
            if state.failing_execution == 0 {
                return Err(RhiError::OutOfMemory("mock queue submission".to_string()));
            }
        }
        for list in lists {
            *state.executing.entry(list.allocator).or_insert(0) += 1;
        }
        let index = state.queue_index(queue);
        state.queues[index].push_back(QueueOp::Execute {
            lists: lists.iter().map(|l| (l.id, l.allocator)).collect(),
        });
        Ok(())
    }

    fn record_buffer_copy(
        &self,
        list: &mut MockCommandList,
        _src: &MockBuffer,
        _src_offset: u64,
        _dst: &MockBuffer,
        _dst_offset: u64,
        _size: u64,
    ) {
        list.commands += 1;
        self.state.borrow_mut().copies += 1;
    }

    fn record_texture_transition(
        &self,
        list: &mut MockCommandList,
        texture: &MockTexture,
        before: TextureState,
        after: TextureState,
    ) {
        list.commands += 1;
        self.state
            .borrow_mut()
            .transitions
            .push((texture.name.clone(), before, after));
    }

    fn create_fence(&self, initial_value: u64) -> RhiResult<MockFence> {
        let mut state = self.state.borrow_mut();
        state.check_lost()?;
        state.fences.push(initial_value);
        Ok(MockFence {
            index: state.fences.len() - 1,
        })
    }

    fn signal(&self, queue: QueueKind, fence: &MockFence, value: u64) -> RhiResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_lost()?;
        let index = state.queue_index(queue);
        state.queues[index].push_back(QueueOp::Signal {
            fence: fence.index,
            value,
        });
        Ok(())
    }

    fn queue_wait(&self, queue: QueueKind, fence: &MockFence, value: u64) -> RhiResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_lost()?;
        let index = state.queue_index(queue);
        state.queues[index].push_back(QueueOp::Wait {
            fence: fence.index,
            value,
        });
        Ok(())
    }

    fn completed_value(&self, fence: &MockFence) -> RhiResult<u64> {
        let state = self.state.borrow();
        state.check_lost()?;
        Ok(state.fences[fence.index])
    }

    fn wait_for_value(
        &self,
        fence: &MockFence,
        value: u64,
        _timeout: Option<Duration>,
    ) -> RhiResult<WaitStatus> {
        let mut state = self.state.borrow_mut();
        state.check_lost()?;
        if state.fences[fence.index] >= value {
            return Ok(WaitStatus::Reached);
        }
        state.blocking_waits += 1;
        match state.wait_behavior {
            WaitBehavior::AutoComplete => {
                if state.run_until(fence.index, value) {
                    Ok(WaitStatus::Reached)
                } else {
                    // Nothing queued can ever signal the value.
                    Ok(WaitStatus::Abandoned)
                }
            }
            WaitBehavior::TimeOut => Ok(WaitStatus::TimedOut),
            WaitBehavior::Abandon => Ok(WaitStatus::Abandoned),
        }
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_lost()?;
        state.run_until_idle();
        Ok(())
    }

    fn device_lost_report(&self) -> Option<String> {
        let state = self.state.borrow();
        Some(format!(
            "mock device: {} live buffer(s), {} live texture(s), {} queued direct op(s), {} queued copy op(s)",
            state.live_buffers,
            state.live_textures,
            state.queues[0].len(),
            state.queues[1].len()
        ))
    }
}

/// Fake swapchain cycling through its back buffers.
pub struct MockSwapchain {
    backbuffers: Vec<MockTexture>,
    next: u32,
    state: Rc<RefCell<MockState>>,
}

impl MockSwapchain {
    /// Creates `count` render-target back buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if a back buffer cannot be created.
    pub fn new(device: &MockDevice, count: u32, width: u32, height: u32) -> RhiResult<Self> {
        let backbuffers = (0..count)
            .map(|i| {
                device.create_texture(&TextureResourceDesc::new_2d(
                    format!("Backbuffer {i}"),
                    crate::resource::TextureUsage::RenderTarget,
                    crate::resource::TextureFormat::Rgba8Unorm,
                    width,
                    height,
                ))
            })
            .collect::<RhiResult<Vec<_>>>()?;
        Ok(Self {
            backbuffers,
            next: 0,
            state: device.state.clone(),
        })
    }
}

impl Swapchain<MockDevice> for MockSwapchain {
    fn acquire_next_backbuffer(&mut self, _device: &MockDevice) -> RhiResult<u32> {
        self.state.borrow().check_lost()?;
        let index = self.next % self.backbuffers.len().max(1) as u32;
        self.next = self.next.wrapping_add(1);
        Ok(index)
    }

    fn backbuffer(&self, index: u32) -> Option<&MockTexture> {
        self.backbuffers.get(index as usize)
    }

    fn present(&mut self, _device: &MockDevice) -> RhiResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_lost()?;
        state.presents += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_list(device: &MockDevice, allocator: &mut MockCommandAllocator) -> MockCommandList {
        let mut list = device.open_command_list(allocator).unwrap();
        device.close_command_list(&mut list).unwrap();
        list
    }

    #[test]
    fn test_nothing_runs_until_driven() {
        let device = MockDevice::new();
        let fence = device.create_fence(0).unwrap();
        device.signal(QueueKind::Direct, &fence, 1).unwrap();

        assert_eq!(device.completed_value(&fence).unwrap(), 0);
        device.run_until_idle();
        assert_eq!(device.completed_value(&fence).unwrap(), 1);
    }

    #[test]
    fn test_run_until_stops_at_value() {
        let device = MockDevice::new();
        let fence = device.create_fence(0).unwrap();
        device.signal(QueueKind::Direct, &fence, 1).unwrap();
        device.signal(QueueKind::Direct, &fence, 2).unwrap();

        assert!(device.run_until(&fence, 1));
        assert_eq!(device.completed_value(&fence).unwrap(), 1);
        assert_eq!(device.queued_ops(QueueKind::Direct), 1);
        assert!(!device.run_until(&fence, 3));
    }

    #[test]
    fn test_blocking_wait_auto_completes() {
        let device = MockDevice::new();
        let fence = device.create_fence(0).unwrap();
        device.signal(QueueKind::Direct, &fence, 5).unwrap();

        let status = device.wait_for_value(&fence, 5, None).unwrap();
        assert_eq!(status, WaitStatus::Reached);
        assert_eq!(device.blocking_waits(), 1);

        // Already reached, so no blocking.
        device.wait_for_value(&fence, 3, None).unwrap();
        assert_eq!(device.blocking_waits(), 1);
    }

    #[test]
    fn test_wait_for_unsignaled_value_is_abandoned() {
        let device = MockDevice::new();
        let fence = device.create_fence(0).unwrap();
        let status = device.wait_for_value(&fence, 1, None).unwrap();
        assert_eq!(status, WaitStatus::Abandoned);
    }

    #[test]
    fn test_timeout_behavior_runs_nothing() {
        let device = MockDevice::new();
        device.set_wait_behavior(WaitBehavior::TimeOut);
        let fence = device.create_fence(0).unwrap();
        device.signal(QueueKind::Direct, &fence, 1).unwrap();

        let status = device
            .wait_for_value(&fence, 1, Some(Duration::from_millis(1)))
            .unwrap();
        assert_eq!(status, WaitStatus::TimedOut);
        assert_eq!(device.completed_value(&fence).unwrap(), 0);
    }

    #[test]
    fn test_queue_wait_orders_across_queues() {
        let device = MockDevice::new();
        let fence = device.create_fence(0).unwrap();
        let mut copy_alloc = device.create_command_allocator(QueueKind::Copy).unwrap();
        let mut direct_alloc = device.create_command_allocator(QueueKind::Direct).unwrap();
        let copy_list = closed_list(&device, &mut copy_alloc);
        let direct_list = closed_list(&device, &mut direct_alloc);

        device.queue_wait(QueueKind::Direct, &fence, 1).unwrap();
        device
            .execute_command_lists(QueueKind::Direct, &[&direct_list])
            .unwrap();
        device
            .execute_command_lists(QueueKind::Copy, &[&copy_list])
            .unwrap();
        device.signal(QueueKind::Copy, &fence, 1).unwrap();
        device.run_until_idle();

        let executed = device.executed_lists();
        assert_eq!(
            executed,
            vec![
                (QueueKind::Copy, copy_list.id()),
                (QueueKind::Direct, direct_list.id())
            ]
        );
    }

    #[test]
    fn test_reset_while_executing_is_rejected() {
        let device = MockDevice::new();
        let mut allocator = device.create_command_allocator(QueueKind::Direct).unwrap();
        let list = closed_list(&device, &mut allocator);
        device
            .execute_command_lists(QueueKind::Direct, &[&list])
            .unwrap();

        assert!(device.reset_command_allocator(&mut allocator).is_err());
        assert_eq!(device.reset_violations(), 1);

        device.run_until_idle();
        assert!(device.reset_command_allocator(&mut allocator).is_ok());
    }

    #[test]
    fn test_open_list_cannot_execute() {
        let device = MockDevice::new();
        let mut allocator = device.create_command_allocator(QueueKind::Direct).unwrap();
        let list = device.open_command_list(&mut allocator).unwrap();
        assert!(
            device
                .execute_command_lists(QueueKind::Direct, &[&list])
                .is_err()
        );
    }

    #[test]
    fn test_buffer_lifetime_counters() {
        let device = MockDevice::new();
        let desc = BufferResourceDesc::new("upload", BufferUsage::Staging, 64);
        let mut buffer = device.create_buffer(&desc).unwrap();
        assert_eq!(device.live_buffers(), 1);
        buffer.mapped_slice_mut().unwrap()[0] = 7;
        assert_eq!(buffer.mapped_slice().unwrap()[0], 7);

        drop(buffer);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.released_names(), vec!["upload".to_string()]);
    }

    #[test]
    fn test_injected_allocation_failure() {
        let device = MockDevice::new();
        device.fail_next_allocations(1);
        let desc = BufferResourceDesc::new("vb", BufferUsage::Vertex, 64);
        let err = device.create_buffer(&desc).err().unwrap();
        assert!(err.is_out_of_memory());
        assert!(device.create_buffer(&desc).is_ok());
    }

    #[test]
    fn test_injected_execution_failure() {
        let device = MockDevice::new();
        let mut allocator = device.create_command_allocator(QueueKind::Direct).unwrap();
        let first = closed_list(&device, &mut allocator);
        let second = closed_list(&device, &mut allocator);
        device.fail_nth_execution(2);

        device.execute_command_lists(QueueKind::Direct, &[&first]).unwrap();
        let err = device
            .execute_command_lists(QueueKind::Direct, &[&second])
            .unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(device.queued_ops(QueueKind::Direct), 1);
        assert!(device.execute_command_lists(QueueKind::Direct, &[&second]).is_ok());
    }

    #[test]
    fn test_lost_device_fails_queue_operations() {
        let device = MockDevice::new();
        let fence = device.create_fence(0).unwrap();
        device.lose_device();
        let err = device.signal(QueueKind::Direct, &fence, 1).unwrap_err();
        assert!(err.is_device_lost());
    }

    #[test]
    fn test_copy_work_shares_direct_queue_without_dedicated_copy() {
        let device = MockDevice::without_copy_queue();
        assert!(!device.has_dedicated_copy_queue());
        let fence = device.create_fence(0).unwrap();
        device.signal(QueueKind::Copy, &fence, 1).unwrap();
        assert_eq!(device.queued_ops(QueueKind::Direct), 1);
    }
}
