//! The backend orchestrator.
//!
//! [`Backend`] composes the descriptor heaps, the staging/scratch pools, the
//! frame synchronizer, the command submitter and the deferred destruction
//! queue behind one API, and drives them with the per-frame protocol:
//!
//! ```text
//! begin_frame(n)                                   end_frame()
//!   wait for the slot's previous target              backbuffer RenderTarget -> Present
//!   reclaim allocators, pools, deletions             execute copy batch, order copy -> direct
//!   adopt work deferred between frames               execute direct batch
//!   execute carried copy lists                       signal the slot's target
//!   order copy -> direct, arm the slot target        present, advance the slot
//!   backbuffer Present -> RenderTarget
//! ```
//!
//! # Example
//!
//! ```no_run
//! use inflight_backend::Backend;
//! use inflight_core::BackendConfig;
//! use inflight_rhi::gpu::{GpuDevice, QueueKind};
//! use inflight_rhi::resource::{BufferResourceDesc, BufferUsage};
//!
//! # fn example<D: GpuDevice>(device: D) -> Result<(), inflight_backend::BackendError> {
//! let mut backend = Backend::new(device, BackendConfig::default())?;
//! let vertices = backend
//!     .create_buffer(&BufferResourceDesc::new("vertices", BufferUsage::Vertex, 4096))
//!     .expect("vertex buffer");
//!
//! for frame in 1..=3 {
//!     backend.begin_frame(frame)?;
//!     let mut list = backend.acquire_command_list(QueueKind::Direct)?;
//!     backend.upload_to_buffer(&mut list, vertices, &[0u8; 64], 0)?;
//!     backend.submit(list)?;
//!     backend.end_frame()?;
//! }
//!
//! backend.destroy_buffer(vertices);
//! backend.wait_idle()?;
//! # Ok(())
//! # }
//! ```

use slotmap::SlotMap;
use tracing::{debug, debug_span, error, info, warn};

use inflight_core::BackendConfig;
use inflight_rhi::gpu::{DescriptorHeapKind, GpuDevice, QueueKind, Swapchain};
use inflight_rhi::resource::{
    BufferResourceDesc, DEFAULT_BUFFER_ALIGNMENT, TEXTURE_UPLOAD_PLACEMENT_ALIGNMENT,
    TextureResourceDesc, TextureState,
};

use crate::buffer::{Buffer, Texture};
use crate::command::{CommandList, CommandSubmitter};
use crate::deferred::DeferredDestructionQueue;
use crate::descriptor::{DescriptorHeaps, DescriptorRange};
use crate::diagnostics::{CommandHistory, report_device_lost};
use crate::error::{BackendError, BackendResult};
use crate::handle::{BufferHandle, TextureHandle};
use crate::pool::ResourcePool;
use crate::slots::SlotTarget;
use crate::sync::{FrameSynchronizer, SlotState};

/// Point-in-time counters, for logging and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub live_buffers: usize,
    pub live_textures: usize,
    /// Buffers and textures waiting for their slot to retire.
    pub pending_destructions: usize,
    pub pending_descriptor_releases: usize,
    pub staging_free: usize,
    pub staging_returned: usize,
    /// Staging buffers held by submitted lists until they retire.
    pub staging_in_flight: usize,
    pub scratch_free: usize,
    pub scratch_returned: usize,
    pub free_allocators: usize,
    pub pending_lists: usize,
    pub in_flight_lists: usize,
    /// Lists handed out and not yet submitted.
    pub outstanding_lists: usize,
}

/// Why the backend stopped accepting work.
#[derive(Clone, Debug)]
struct Poison {
    device_lost: bool,
    reason: String,
}

/// Frame-pipelined GPU resource and command lifecycle manager.
///
/// # Thread Safety
///
/// The backend is driven from a single thread. Every pool it owns is mutated
/// only through `&mut self`.
pub struct Backend<D: GpuDevice> {
    // Everything holding native objects is declared before `device`.
    swapchain: Option<Box<dyn Swapchain<D>>>,
    buffers: SlotMap<BufferHandle, Buffer<D>>,
    textures: SlotMap<TextureHandle, Texture<D>>,
    heaps: DescriptorHeaps<D>,
    pool: ResourcePool<D>,
    commands: CommandSubmitter<D>,
    deferred: DeferredDestructionQueue<D>,
    sync: FrameSynchronizer<D>,
    config: BackendConfig,
    backbuffer: Option<u32>,
    frame_open: bool,
    /// Fence value of the open (or last) frame.
    frame_value: u64,
    poisoned: Option<Poison>,
    device: D,
}

impl<D: GpuDevice> Backend<D> {
    /// Creates a backend with `config.max_in_flight_frames` frame slots.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, or if the descriptor
    /// heaps or fences cannot be created.
    pub fn new(device: D, config: BackendConfig) -> BackendResult<Self> {
        config.validate()?;
        let slot_count = config.frame_count();

        let heaps = DescriptorHeaps::new(&device, &config.descriptors)?;
        let sync = FrameSynchronizer::new(&device, slot_count)?;
        let commands = CommandSubmitter::new(
            slot_count,
            config.verify_every_submission,
            config.command_history_len,
        );

        info!(
            "Backend created on {} with {} frame slot(s), dedicated copy queue: {}",
            device.name(),
            slot_count,
            device.has_dedicated_copy_queue()
        );

        Ok(Self {
            swapchain: None,
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            heaps,
            pool: ResourcePool::new(slot_count),
            commands,
            deferred: DeferredDestructionQueue::new(slot_count),
            sync,
            config,
            backbuffer: None,
            frame_open: false,
            frame_value: 0,
            poisoned: None,
            device,
        })
    }

    /// Hands the backend a swapchain whose back buffers it transitions and presents.
    pub fn attach_swapchain(&mut self, swapchain: Box<dyn Swapchain<D>>) {
        self.swapchain = Some(swapchain);
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.sync.slot_count()
    }

    #[inline]
    pub fn current_slot(&self) -> usize {
        self.sync.current_slot()
    }

    #[inline]
    pub fn is_frame_open(&self) -> bool {
        self.frame_open
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.sync.slot_state(slot)
    }

    /// Index of the back buffer acquired for the open frame.
    #[inline]
    pub fn backbuffer_index(&self) -> Option<u32> {
        self.backbuffer
    }

    #[inline]
    pub fn command_history(&self) -> &CommandHistory {
        self.commands.history()
    }

    /// Where work deferred right now is parked.
    fn slot_target(&self) -> SlotTarget {
        if self.frame_open {
            SlotTarget::Slot(self.sync.current_slot())
        } else {
            SlotTarget::Carry
        }
    }

    fn check_usable(&self) -> BackendResult<()> {
        match &self.poisoned {
            None => Ok(()),
            Some(poison) if poison.device_lost => {
                Err(BackendError::DeviceLost(poison.reason.clone()))
            }
            Some(poison) => Err(BackendError::Poisoned(poison.reason.clone())),
        }
    }

    /// Poisons the backend on fatal errors, with diagnostics on device loss.
    fn on_error(&mut self, err: BackendError) -> BackendError {
        if err.is_fatal() && self.poisoned.is_none() {
            let reason = err.to_string();
            if err.is_device_lost() {
                report_device_lost(
                    &reason,
                    self.device.device_lost_report(),
                    self.commands.history(),
                );
            } else {
                error!("Fatal backend error: {}", reason);
            }
            self.poisoned = Some(Poison {
                device_lost: err.is_device_lost(),
                reason,
            });
        }
        err
    }

    // =========================================================================
    // Frame protocol
    // =========================================================================

    /// Starts frame `frame_counter` on the current slot.
    ///
    /// Blocks until the slot's previous use has retired on the GPU, then
    /// reclaims everything parked on it.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::FrameProtocol`] if a frame is already open.
    /// Wait failures and device loss are fatal.
    pub fn begin_frame(&mut self, frame_counter: u64) -> BackendResult<()> {
        self.check_usable()?;
        if self.frame_open {
            return Err(BackendError::FrameProtocol(
                "begin_frame called while a frame is open",
            ));
        }
        let _span = debug_span!("begin_frame", frame = frame_counter).entered();

        match self.begin_frame_inner(frame_counter) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.on_error(e)),
        }
    }

    fn begin_frame_inner(&mut self, frame_counter: u64) -> BackendResult<()> {
        let slot = self.sync.current_slot();

        self.sync.prepare_slot(&self.device)?;
        let completed = self.sync.completed_value(&self.device)?;
        self.reclaim_slot(slot, completed)?;

        self.pool.adopt_carry(slot);
        self.deferred.adopt_carry(slot);
        let carried = self.commands.adopt_carry(slot);
        if carried > 0 {
            debug!("Slot {}: adopted {} list(s) submitted between frames", slot, carried);
        }

        self.commands
            .execute_pending(&self.device, slot, QueueKind::Copy, frame_counter)?;
        self.sync
            .order_copy_before_direct(&self.device, Some(frame_counter))?;

        self.frame_value = self.sync.arm_slot(frame_counter);
        self.frame_open = true;

        if let Some(swapchain) = self.swapchain.as_mut() {
            self.backbuffer = Some(swapchain.acquire_next_backbuffer(&self.device)?);
            self.record_backbuffer_transition(
                TextureState::Present,
                TextureState::RenderTarget,
                "Backbuffer Acquire",
            )?;
        }

        debug!(
            "Frame {} begins on slot {} (target {})",
            frame_counter, slot, self.frame_value
        );
        Ok(())
    }

    fn reclaim_slot(&mut self, slot: usize, completed: u64) -> BackendResult<()> {
        self.commands.reclaim_slot(slot, completed)?;
        self.pool.recycle_staging(self.commands.take_retired_staging());
        self.pool.reclaim_slot(slot);
        let drained = self.deferred.drain_slot(slot);
        for range in drained.descriptors {
            self.heaps.free(range);
        }
        Ok(())
    }

    fn record_backbuffer_transition(
        &mut self,
        before: TextureState,
        after: TextureState,
        name: &str,
    ) -> BackendResult<()> {
        let Some(index) = self.backbuffer else {
            return Ok(());
        };
        let target = self.slot_target();
        let mut list = self
            .commands
            .acquire(&self.device, QueueKind::Direct, target, Some(name))?;
        if let Some(texture) = self
            .swapchain
            .as_ref()
            .and_then(|swapchain| swapchain.backbuffer(index))
        {
            self.device
                .record_texture_transition(list.raw_mut(), texture, before, after);
        } else {
            warn!("Swapchain has no back buffer {}", index);
        }
        self.commands.submit(&self.device, list, target)
    }

    /// Executes the open frame's work, signals its fence target and advances
    /// to the next slot.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::FrameProtocol`] if no frame is open. Device
    /// loss, including at present, is fatal.
    pub fn end_frame(&mut self) -> BackendResult<()> {
        self.check_usable()?;
        if !self.frame_open {
            return Err(BackendError::FrameProtocol(
                "end_frame called without an open frame",
            ));
        }
        let _span = debug_span!("end_frame", frame = self.frame_value).entered();

        match self.end_frame_inner() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.on_error(e)),
        }
    }

    fn end_frame_inner(&mut self) -> BackendResult<()> {
        let slot = self.sync.current_slot();

        if self.swapchain.is_some() {
            self.record_backbuffer_transition(
                TextureState::RenderTarget,
                TextureState::Present,
                "Backbuffer Present",
            )?;
        }

        let copies = self
            .commands
            .execute_pending(&self.device, slot, QueueKind::Copy, self.frame_value)?;
        if copies > 0 {
            self.sync.order_copy_before_direct(&self.device, None)?;
        }
        let directs = self
            .commands
            .execute_pending(&self.device, slot, QueueKind::Direct, self.frame_value)?;

        let target = self.sync.signal_slot(&self.device)?;
        self.commands.stamp_slot(slot, target);
        self.frame_open = false;

        if let Some(swapchain) = self.swapchain.as_mut() {
            swapchain.present(&self.device)?;
            self.backbuffer = None;
        }

        debug!(
            "Frame {} ends on slot {}: {} copy and {} direct list(s)",
            target, slot, copies, directs
        );
        self.sync.advance();
        Ok(())
    }

    /// Blocks until the GPU has finished all submitted work, then reclaims
    /// every slot.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::FrameProtocol`] while a frame is open. Wait
    /// failures and device loss are fatal.
    pub fn wait_idle(&mut self) -> BackendResult<()> {
        self.check_usable()?;
        if self.frame_open {
            return Err(BackendError::FrameProtocol(
                "wait_idle called while a frame is open",
            ));
        }
        let _span = debug_span!("wait_idle").entered();

        match self.wait_idle_inner() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.on_error(e)),
        }
    }

    fn wait_idle_inner(&mut self) -> BackendResult<()> {
        self.sync.wait_idle(&self.device)?;
        self.device.wait_idle()?;

        let completed = self.sync.completed_value(&self.device)?;
        for slot in 0..self.sync.slot_count() {
            self.reclaim_slot(slot, completed)?;
        }
        debug!("Backend idle at fence value {}", completed);
        Ok(())
    }

    /// Frees slots whose fence has been reached, without blocking.
    /// Returns how many changed state.
    ///
    /// # Errors
    ///
    /// Device loss is fatal.
    pub fn poll_retired(&mut self) -> BackendResult<usize> {
        self.check_usable()?;
        let result = self.sync.poll(&self.device);
        result.map_err(|e| self.on_error(e))
    }

    /// Last direct-fence value the GPU has reached.
    ///
    /// # Errors
    ///
    /// Device loss is fatal.
    pub fn completed_frame_value(&mut self) -> BackendResult<u64> {
        self.check_usable()?;
        let result = self.sync.completed_value(&self.device);
        result.map_err(|e| self.on_error(e))
    }

    // =========================================================================
    // Buffers and textures
    // =========================================================================

    /// Creates a buffer in the heap its usage asks for.
    ///
    /// Failures are logged and yield `None`. Device loss also poisons the backend.
    pub fn create_buffer(&mut self, desc: &BufferResourceDesc) -> Option<BufferHandle> {
        if let Err(e) = self.check_usable() {
            warn!("Not creating buffer '{}': {}", desc.name, e);
            return None;
        }
        match Buffer::create(&self.device, desc) {
            Ok(buffer) => Some(self.buffers.insert(buffer)),
            Err(e) => {
                warn!("Failed to create buffer '{}': {}", desc.name, e);
                self.on_error(e);
                None
            }
        }
    }

    /// Creates a texture. Render targets and depth buffers get a committed allocation.
    ///
    /// The move out of [`TextureState::Undefined`] into the usage's initial
    /// state is recorded on a direct list submitted to the current slot (or
    /// carried into the next frame between frames).
    ///
    /// Failures are logged and yield `None`. Device loss also poisons the backend.
    pub fn create_texture(&mut self, desc: &TextureResourceDesc) -> Option<TextureHandle> {
        if let Err(e) = self.check_usable() {
            warn!("Not creating texture '{}': {}", desc.name, e);
            return None;
        }
        let result = Texture::create(&self.device, desc).and_then(|mut texture| {
            self.record_initial_state(&mut texture)?;
            Ok(texture)
        });
        match result {
            Ok(texture) => Some(self.textures.insert(texture)),
            Err(e) => {
                warn!("Failed to create texture '{}': {}", desc.name, e);
                self.on_error(e);
                None
            }
        }
    }

    fn record_initial_state(&mut self, texture: &mut Texture<D>) -> BackendResult<()> {
        let target = self.slot_target();
        let mut list = self.commands.acquire(
            &self.device,
            QueueKind::Direct,
            target,
            Some("Initial Texture State"),
        )?;
        let initial = texture.usage().initial_state();
        texture.transition(&self.device, list.raw_mut(), initial);
        self.commands.submit(&self.device, list, target)
    }

    pub fn buffer(&self, handle: BufferHandle) -> Option<&Buffer<D>> {
        self.buffers.get(handle)
    }

    pub fn buffer_mut(&mut self, handle: BufferHandle) -> Option<&mut Buffer<D>> {
        self.buffers.get_mut(handle)
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&Texture<D>> {
        self.textures.get(handle)
    }

    /// Schedules the buffer for release once the current slot retires.
    /// Returns `false` for a stale handle.
    pub fn destroy_buffer(&mut self, handle: BufferHandle) -> bool {
        let Some(buffer) = self.buffers.remove(handle) else {
            warn!("destroy_buffer called with a stale handle");
            return false;
        };
        let target = self.slot_target();
        self.deferred.schedule_buffer_destruction(target, buffer);
        true
    }

    /// Schedules the texture for release once the current slot retires.
    /// Returns `false` for a stale handle.
    pub fn destroy_texture(&mut self, handle: TextureHandle) -> bool {
        let Some(texture) = self.textures.remove(handle) else {
            warn!("destroy_texture called with a stale handle");
            return false;
        };
        let target = self.slot_target();
        self.deferred.schedule_texture_destruction(target, texture);
        true
    }

    /// Buffers and textures alive, including those waiting for deferred release.
    pub fn live_resource_count(&self) -> usize {
        self.buffers.len() + self.textures.len() + self.deferred.pending_count()
    }

    // =========================================================================
    // Staging and scratch buffers
    // =========================================================================

    /// Borrows a mapped upload buffer of at least `size` bytes with exactly
    /// `alignment`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::AllocationFailed`] if a new buffer is needed and
    /// cannot be created. Device loss is fatal.
    pub fn get_staging_buffer(&mut self, size: u64, alignment: u64) -> BackendResult<Buffer<D>> {
        self.check_usable()?;
        let result = self.pool.get_staging_buffer(&self.device, size, alignment);
        result.map_err(|e| self.on_error(e))
    }

    /// Borrows a staging buffer large enough to upload the whole texture
    /// described by `desc`, with rows padded for buffer-to-texture copies.
    ///
    /// # Errors
    ///
    /// Same as [`Backend::get_staging_buffer`].
    pub fn get_staging_buffer_for_texture(
        &mut self,
        desc: &TextureResourceDesc,
    ) -> BackendResult<Buffer<D>> {
        let footprint = desc.upload_footprint();
        self.get_staging_buffer(footprint.total_size, TEXTURE_UPLOAD_PLACEMENT_ALIGNMENT)
    }

    /// Gives a staging buffer back; it becomes reusable once the current slot
    /// retires. A buffer that is not a staging buffer is destroyed instead.
    pub fn return_staging_buffer(&mut self, buffer: Buffer<D>) {
        let target = self.slot_target();
        if let Err(buffer) = self.pool.return_staging_buffer(target, buffer) {
            warn!(
                "'{}' is not a staging buffer; destroying it instead",
                buffer.name()
            );
            self.deferred.schedule_buffer_destruction(target, buffer);
        }
    }

    /// Borrows a GPU-local scratch buffer of at least `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::AllocationFailed`] if a new buffer is needed and
    /// cannot be created. Device loss is fatal.
    pub fn get_scratch_buffer(&mut self, size: u64) -> BackendResult<Buffer<D>> {
        self.check_usable()?;
        let result = self.pool.get_scratch_buffer(&self.device, size);
        result.map_err(|e| self.on_error(e))
    }

    /// Gives a scratch buffer back; it becomes reusable once the current slot
    /// retires. A buffer without unordered access is destroyed instead.
    pub fn return_scratch_buffer(&mut self, buffer: Buffer<D>) {
        let target = self.slot_target();
        if let Err(buffer) = self.pool.return_scratch_buffer(target, buffer) {
            warn!(
                "'{}' is not a scratch buffer; destroying it instead",
                buffer.name()
            );
            self.deferred.schedule_buffer_destruction(target, buffer);
        }
    }

    // =========================================================================
    // Command lists
    // =========================================================================

    /// Hands out a recording command list for `queue`, tagged with the
    /// current frame slot.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::CommandList`] if no list can be opened; fatal
    /// in debug builds.
    pub fn acquire_command_list(&mut self, queue: QueueKind) -> BackendResult<CommandList<D>> {
        self.acquire_inner(queue, None)
    }

    /// Like [`Backend::acquire_command_list`], with a name for breadcrumbs.
    ///
    /// # Errors
    ///
    /// Same as [`Backend::acquire_command_list`].
    pub fn acquire_named(
        &mut self,
        queue: QueueKind,
        name: &str,
    ) -> BackendResult<CommandList<D>> {
        self.acquire_inner(queue, Some(name))
    }

    fn acquire_inner(
        &mut self,
        queue: QueueKind,
        name: Option<&str>,
    ) -> BackendResult<CommandList<D>> {
        self.check_usable()?;
        let target = self.slot_target();
        let result = self.commands.acquire(&self.device, queue, target, name);
        result.map_err(|e| self.on_error(e))
    }

    /// Closes `list` and queues it for the current frame's batch.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::CommandList`] if the list fails to close in a
    /// debug build.
    pub fn submit(&mut self, list: CommandList<D>) -> BackendResult<()> {
        self.check_usable()?;
        let target = self.slot_target();
        let result = self.commands.submit(&self.device, list, target);
        result.map_err(|e| self.on_error(e))
    }

    /// Records an upload of `bytes` into `dst` at `dst_offset` through a
    /// staging buffer.
    ///
    /// The staging buffer stays with `list` and goes back to the pool only
    /// when the slot the list is executed in retires, whenever it is
    /// submitted.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidRequest`] for a stale handle or an empty
    /// or out-of-bounds upload.
    pub fn upload_to_buffer(
        &mut self,
        list: &mut CommandList<D>,
        dst: BufferHandle,
        bytes: &[u8],
        dst_offset: u64,
    ) -> BackendResult<()> {
        let size = bytes.len() as u64;
        let Some(dst_size) = self.buffers.get(dst).map(Buffer::size) else {
            return Err(BackendError::InvalidRequest(
                "upload to a stale buffer handle".to_string(),
            ));
        };
        if size == 0 || dst_offset.checked_add(size).is_none_or(|end| end > dst_size) {
            return Err(BackendError::InvalidRequest(format!(
                "upload of {size} byte(s) at offset {dst_offset} does not fit a {dst_size}-byte buffer"
            )));
        }
        let mut staging = self.get_staging_buffer(size, DEFAULT_BUFFER_ALIGNMENT)?;
        if let Err(e) = staging.write(0, bytes) {
            self.return_staging_buffer(staging);
            return Err(e);
        }

        if let Some(dst) = self.buffers.get(dst) {
            self.device
                .record_buffer_copy(list.raw_mut(), staging.raw(), 0, dst.raw(), dst_offset, size);
        }
        list.attach_staging(staging);
        Ok(())
    }

    // =========================================================================
    // Descriptors
    // =========================================================================

    /// Allocates `count` contiguous descriptors; `None` (logged) when the heap
    /// is exhausted.
    pub fn allocate_descriptors(
        &mut self,
        kind: DescriptorHeapKind,
        count: u32,
    ) -> Option<DescriptorRange> {
        self.heaps.get_mut(kind).allocate(count)
    }

    /// Returns `range` to its heap once the current slot retires.
    pub fn release_descriptors(&mut self, range: DescriptorRange) {
        let target = self.slot_target();
        self.deferred.schedule_descriptor_release(target, range);
    }

    pub fn descriptor_heap(&self, kind: DescriptorHeapKind) -> &D::DescriptorHeap {
        self.heaps.get(kind).heap()
    }

    /// Descriptors currently handed out from `kind`'s heap.
    pub fn allocated_descriptors(&self, kind: DescriptorHeapKind) -> u32 {
        self.heaps.get(kind).allocated()
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            live_buffers: self.buffers.len(),
            live_textures: self.textures.len(),
            pending_destructions: self.deferred.pending_count(),
            pending_descriptor_releases: self.deferred.pending_descriptor_ranges(),
            staging_free: self.pool.staging_free(),
            staging_returned: self.pool.staging_returned(),
            staging_in_flight: self.commands.staging_in_flight(),
            scratch_free: self.pool.scratch_free(),
            scratch_returned: self.pool.scratch_returned(),
            free_allocators: self.commands.free_allocators(),
            pending_lists: self.commands.pending_lists(),
            in_flight_lists: self.commands.in_flight_lists(),
            outstanding_lists: self.commands.outstanding(),
        }
    }
}

impl<D: GpuDevice> Drop for Backend<D> {
    fn drop(&mut self) {
        let device_lost = self.poisoned.as_ref().is_some_and(|p| p.device_lost);

        if self.poisoned.is_none() {
            if self.frame_open
                && let Err(e) = self.end_frame()
            {
                error!("Failed to end the open frame during teardown: {}", e);
            }
            if let Err(e) = self.wait_idle() {
                error!("Failed to wait for the GPU during teardown: {}", e);
            }
        } else if !device_lost && let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for the device during teardown: {}", e);
        }

        let outstanding = self.commands.outstanding();
        if outstanding > 0 {
            warn!(
                "{} command list(s) were acquired but never submitted",
                outstanding
            );
        }

        let deferred = self.deferred.release_all();
        let pooled = self.pool.release_all();
        let commands = self.commands.release_all();
        let live = self.buffers.len() + self.textures.len();
        self.buffers.clear();
        self.textures.clear();
        self.swapchain = None;

        info!(
            "Backend destroyed: released {} deferred, {} pooled, {} live resource(s) and {} command object(s)",
            deferred, pooled, live, commands
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inflight_rhi::mock::MockDevice;
    use inflight_rhi::resource::BufferUsage;

    fn backend(frames: u32) -> (MockDevice, Backend<MockDevice>) {
        let device = MockDevice::new();
        let backend = Backend::new(device.clone(), BackendConfig::with_frames(frames))
            .unwrap();
        (device, backend)
    }

    #[test]
    fn test_invalid_frame_count_is_rejected() {
        let config = BackendConfig::with_frames(9);
        assert!(matches!(
            Backend::new(MockDevice::new(), config),
            Err(BackendError::Config(_))
        ));
    }

    #[test]
    fn test_protocol_violations_are_recoverable() {
        let (_, mut backend) = backend(2);
        assert!(matches!(
            backend.end_frame(),
            Err(BackendError::FrameProtocol(_))
        ));
        backend.begin_frame(1).unwrap();
        assert!(matches!(
            backend.begin_frame(2),
            Err(BackendError::FrameProtocol(_))
        ));
        assert!(matches!(
            backend.wait_idle(),
            Err(BackendError::FrameProtocol(_))
        ));
        backend.end_frame().unwrap();
        backend.wait_idle().unwrap();
    }

    #[test]
    fn test_slot_advances_every_frame() {
        let (_, mut backend) = backend(3);
        let mut slots = Vec::new();
        for frame in 1..=4 {
            backend.begin_frame(frame).unwrap();
            slots.push(backend.current_slot());
            backend.end_frame().unwrap();
        }
        assert_eq!(slots, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_allocation_failure_yields_none() {
        let (device, mut backend) = backend(2);
        device.fail_next_allocations(1);
        let desc = BufferResourceDesc::new("vb", BufferUsage::Vertex, 64);
        assert!(backend.create_buffer(&desc).is_none());
        assert!(backend.create_buffer(&desc).is_some());
        backend.begin_frame(1).unwrap();
    }

    #[test]
    fn test_stale_handle_destroy() {
        let (_, mut backend) = backend(2);
        let desc = BufferResourceDesc::new("vb", BufferUsage::Vertex, 64);
        let handle = backend.create_buffer(&desc).unwrap();
        assert!(backend.destroy_buffer(handle));
        assert!(!backend.destroy_buffer(handle));
        assert!(backend.buffer(handle).is_none());
    }

    #[test]
    fn test_teardown_releases_everything() {
        let device = MockDevice::new();
        {
            let mut backend =
                Backend::new(device.clone(), BackendConfig::with_frames(2)).unwrap();
            let desc = BufferResourceDesc::new("vb", BufferUsage::Vertex, 64);
            let kept = backend.create_buffer(&desc).unwrap();
            let dropped = backend.create_buffer(&desc).unwrap();

            backend.begin_frame(1).unwrap();
            backend.destroy_buffer(dropped);
            let staging = backend.get_staging_buffer(32, 256).unwrap();
            backend.return_staging_buffer(staging);
            let _unsubmitted = backend.acquire_command_list(QueueKind::Direct).unwrap();
            let _ = kept;
        }
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_allocators(), 0);
    }
}
