//! Buffers and textures as the backend hands them out.
//!
//! Both wrap a native device object together with the metadata the pools and
//! the renderer need. Neither is `Clone`: moving a value is how ownership passes
//! between the caller, a pool and the deferred destruction queue.

use tracing::debug;

use inflight_rhi::gpu::{GpuDevice, NativeBuffer};
use inflight_rhi::resource::{
    BufferResourceDesc, BufferUsage, TextureFormat, TextureResourceDesc, TextureState,
    TextureUsage,
};

use crate::error::{BackendError, BackendResult};

/// A GPU buffer with its memory.
pub struct Buffer<D: GpuDevice> {
    raw: D::Buffer,
    name: String,
    size: u64,
    alignment: u64,
    usage: BufferUsage,
}

impl<D: GpuDevice> Buffer<D> {
    /// Validates `desc` and creates the native buffer.
    ///
    /// Upload-heap buffers come back persistently mapped.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidRequest`] for a bad description, and the
    /// converted device error when creation fails.
    pub fn create(device: &D, desc: &BufferResourceDesc) -> BackendResult<Self> {
        desc.validate().map_err(BackendError::InvalidRequest)?;
        let raw = device.create_buffer(desc)?;

        debug!(
            "Created {} buffer '{}' ({} bytes, alignment {})",
            desc.usage.name(),
            desc.name,
            desc.size,
            desc.alignment
        );

        Ok(Self {
            raw,
            name: desc.name.clone(),
            size: desc.size,
            alignment: desc.alignment,
            usage: desc.usage,
        })
    }

    #[inline]
    pub fn raw(&self) -> &D::Buffer {
        &self.raw
    }

    #[inline]
    pub fn raw_mut(&mut self) -> &mut D::Buffer {
        &mut self.raw
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requested size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Requested alignment in bytes.
    #[inline]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Whether the buffer has a persistent CPU mapping.
    pub fn is_mapped(&self) -> bool {
        self.raw.mapped_slice().is_some()
    }

    /// The mapped bytes, for upload-heap buffers.
    pub fn mapped(&self) -> Option<&[u8]> {
        self.raw.mapped_slice()
    }

    /// Copies `bytes` into the mapping at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidRequest`] if the buffer is not mapped or
    /// the write would run past its end.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> BackendResult<()> {
        let size = self.size;
        let Some(mapped) = self.raw.mapped_slice_mut() else {
            return Err(BackendError::InvalidRequest(format!(
                "buffer '{}' is not CPU-visible",
                self.name
            )));
        };

        let end = offset
            .checked_add(bytes.len() as u64)
            .filter(|&end| end <= size && end as usize <= mapped.len());
        let Some(end) = end else {
            return Err(BackendError::InvalidRequest(format!(
                "write of {} byte(s) at offset {} overruns buffer '{}' of {} byte(s)",
                bytes.len(),
                offset,
                self.name,
                size
            )));
        };

        mapped[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }
}

impl<D: GpuDevice> std::fmt::Debug for Buffer<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .field("usage", &self.usage)
            .finish()
    }
}

/// A GPU texture with its memory.
pub struct Texture<D: GpuDevice> {
    raw: D::Texture,
    name: String,
    format: TextureFormat,
    width: u32,
    height: u32,
    depth: u32,
    usage: TextureUsage,
    /// Last state a recorded transition leaves the texture in.
    state: TextureState,
}

impl<D: GpuDevice> Texture<D> {
    /// Validates `desc` and creates the native texture.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidRequest`] for a bad description, and the
    /// converted device error when creation fails.
    pub fn create(device: &D, desc: &TextureResourceDesc) -> BackendResult<Self> {
        desc.validate().map_err(BackendError::InvalidRequest)?;
        let raw = device.create_texture(desc)?;

        debug!(
            "Created {} texture '{}' ({}x{}x{}, committed: {})",
            desc.usage.name(),
            desc.name,
            desc.width,
            desc.height,
            desc.depth,
            desc.usage.is_committed()
        );

        Ok(Self {
            raw,
            name: desc.name.clone(),
            format: desc.format,
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
            usage: desc.usage,
            state: TextureState::Undefined,
        })
    }

    #[inline]
    pub fn raw(&self) -> &D::Texture {
        &self.raw
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Width, height and depth in texels.
    #[inline]
    pub fn extent(&self) -> (u32, u32, u32) {
        (self.width, self.height, self.depth)
    }

    #[inline]
    pub fn usage(&self) -> TextureUsage {
        self.usage
    }

    #[inline]
    pub fn state(&self) -> TextureState {
        self.state
    }

    /// Records a transition from the current state to `after` on `list`.
    pub(crate) fn transition(
        &mut self,
        device: &D,
        list: &mut D::CommandList,
        after: TextureState,
    ) {
        device.record_texture_transition(list, &self.raw, self.state, after);
        self.state = after;
    }
}

impl<D: GpuDevice> std::fmt::Debug for Texture<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("extent", &self.extent())
            .field("usage", &self.usage)
            .finish()
    }
}
