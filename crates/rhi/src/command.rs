//! Command pools and command buffers.
//!
//! A [`CommandPool`] plays the role of a command allocator: command buffers
//! are recorded into it, and resetting the pool reclaims all of them at once.
//! The pool keeps the command buffers it has allocated and hands them out
//! again after a reset, so steady-state frames allocate nothing.
//!
//! # Example
//!
//! ```no_run
//! use inflight_rhi::device::Device;
//! use inflight_rhi::gpu::{GpuDevice, QueueKind};
//!
//! # fn example(device: &Device) -> Result<(), inflight_rhi::RhiError> {
//! let mut pool = device.create_command_allocator(QueueKind::Direct)?;
//! let mut cmd = pool.begin_command_buffer()?;
//! // ... record commands ...
//! cmd.end()?;
//! device.execute_command_lists(QueueKind::Direct, &[&cmd])?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, trace};

use crate::device::RawDevice;
use crate::error::{RhiError, RhiResult};
use crate::gpu::QueueKind;
use crate::resource::TextureState;
use crate::texture::{Texture, state_access};

/// Vulkan command pool used as a command allocator.
///
/// # Thread Safety
///
/// Command pools are externally synchronized; a pool is only ever touched by
/// the thread that owns it.
pub struct CommandPool {
    device: Arc<RawDevice>,
    pool: vk::CommandPool,
    queue: QueueKind,
    /// Command buffers ready to be begun.
    free: Vec<vk::CommandBuffer>,
    /// Command buffers begun since the last reset.
    recorded: Vec<vk::CommandBuffer>,
}

impl CommandPool {
    /// Creates a pool for the given queue family.
    ///
    /// The pool is transient and only ever reset as a whole.
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new(device: Arc<RawDevice>, queue: QueueKind, queue_family_index: u32) -> RhiResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe { device.handle().create_command_pool(&create_info, None)? };

        debug!(
            "Created {} command pool for queue family {}",
            queue.name(),
            queue_family_index
        );

        Ok(Self {
            device,
            pool,
            queue,
            free: Vec::new(),
            recorded: Vec::new(),
        })
    }

    /// Returns the Vulkan command pool handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    /// Resets every command buffer recorded from this pool.
    ///
    /// None of them may still be executing.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset fails.
    pub fn reset(&mut self) -> RhiResult<()> {
        unsafe {
            self.device
                .handle()
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        }
        self.free.append(&mut self.recorded);
        trace!("Reset command pool, {} buffer(s) ready", self.free.len());
        Ok(())
    }

    /// Begins a one-time-submit command buffer from this pool.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::CommandList`] if allocation or `vkBeginCommandBuffer` fails.
    pub fn begin_command_buffer(&mut self) -> RhiResult<CommandBuffer> {
        let buffer = match self.free.pop() {
            Some(buffer) => buffer,
            None => {
                let alloc_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);

                let buffers = unsafe { self.device.handle().allocate_command_buffers(&alloc_info) }
                    .map_err(|e| {
                        RhiError::CommandList(format!("could not allocate command buffer: {e}"))
                    })?;
                buffers.into_iter().next().ok_or_else(|| {
                    RhiError::CommandList("driver returned no command buffer".to_string())
                })?
            }
        };
        self.recorded.push(buffer);

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.handle().begin_command_buffer(buffer, &begin_info) }
            .map_err(|e| RhiError::CommandList(format!("could not begin command buffer: {e}")))?;

        Ok(CommandBuffer {
            device: self.device.clone(),
            buffer,
            queue: self.queue,
            recorded_commands: 0,
        })
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Destroying the pool frees its command buffers.
        unsafe {
            self.device.handle().destroy_command_pool(self.pool, None);
        }
        debug!("Destroyed {} command pool", self.queue.name());
    }
}

/// A command buffer being recorded or awaiting execution.
///
/// The buffer's storage belongs to the [`CommandPool`] it was begun from.
pub struct CommandBuffer {
    device: Arc<RawDevice>,
    buffer: vk::CommandBuffer,
    queue: QueueKind,
    recorded_commands: u32,
}

impl CommandBuffer {
    /// Returns the Vulkan command buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    /// Number of commands recorded so far.
    #[inline]
    pub fn recorded_commands(&self) -> u32 {
        self.recorded_commands
    }

    /// Ends recording.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::CommandList`] if the driver rejects the recording.
    pub fn end(&self) -> RhiResult<()> {
        unsafe { self.device.handle().end_command_buffer(self.buffer) }
            .map_err(|e| RhiError::CommandList(format!("could not close command buffer: {e}")))
    }

    // =========================================================================
    // Copy Commands
    // =========================================================================

    /// Copies `size` bytes between buffers.
    pub fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        src_offset: u64,
        dst: vk::Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        unsafe {
            self.device
                .handle()
                .cmd_copy_buffer(self.buffer, src, dst, &[region]);
        }
        self.recorded_commands += 1;
    }

    // =========================================================================
    // Barriers
    // =========================================================================

    /// Moves a texture between states with an image memory barrier.
    pub fn transition_texture(
        &mut self,
        texture: &Texture,
        before: TextureState,
        after: TextureState,
    ) {
        let (old_layout, src_access, src_stage) = state_access(before);
        let (new_layout, dst_access, dst_stage) = state_access(after);

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(texture.handle())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(texture.aspect())
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS),
            );

        unsafe {
            self.device.handle().cmd_pipeline_barrier(
                self.buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        self.recorded_commands += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_types_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandPool>();
        assert_send::<CommandBuffer>();
    }
}
