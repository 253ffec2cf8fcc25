//! Resource descriptions and the heap/state rules derived from them.
//!
//! Everything here is API-neutral: a device implementation reads a
//! [`BufferResourceDesc`] or [`TextureResourceDesc`] and uses the helper
//! methods to decide where the memory lives and what state the resource
//! starts in.

/// Default placement alignment for buffers created by name.
pub const DEFAULT_BUFFER_ALIGNMENT: u64 = 256;

/// Alignment of scratch buffers used as acceleration-structure build memory.
pub const SCRATCH_BUFFER_ALIGNMENT: u64 = 65_536;

/// Row pitch alignment of buffer-to-texture uploads.
pub const TEXTURE_UPLOAD_PITCH_ALIGNMENT: u64 = 256;

/// Placement alignment of buffer-to-texture uploads.
pub const TEXTURE_UPLOAD_PLACEMENT_ALIGNMENT: u64 = 512;

/// Where a resource's memory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// CPU-writable, GPU-readable memory that stays mapped.
    Upload,
    /// GPU-local memory.
    Default,
}

/// Buffer usage kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// CPU-to-GPU upload source
    Staging,
    /// Constant (uniform) data written by the CPU every frame
    Constant,
    /// Vertex data
    Vertex,
    /// Index data
    Index,
    /// Arguments for indirect draws and dispatches
    IndirectCommands,
    /// General read/write storage
    UnorderedAccess,
    /// Acceleration structure storage
    AccelerationStructure,
}

impl BufferUsage {
    /// Memory heap for this usage.
    pub fn heap_type(self) -> HeapType {
        match self {
            BufferUsage::Staging | BufferUsage::Constant => HeapType::Upload,
            BufferUsage::Vertex
            | BufferUsage::Index
            | BufferUsage::IndirectCommands
            | BufferUsage::UnorderedAccess
            | BufferUsage::AccelerationStructure => HeapType::Default,
        }
    }

    /// Whether buffers of this usage are persistently mapped.
    #[inline]
    pub fn is_mappable(self) -> bool {
        self.heap_type() == HeapType::Upload
    }

    /// Whether shaders may write the buffer.
    #[inline]
    pub fn allows_unordered_access(self) -> bool {
        matches!(
            self,
            BufferUsage::UnorderedAccess | BufferUsage::AccelerationStructure
        )
    }

    /// Returns a human-readable name for the usage.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Staging => "staging",
            BufferUsage::Constant => "constant",
            BufferUsage::Vertex => "vertex",
            BufferUsage::Index => "index",
            BufferUsage::IndirectCommands => "indirect",
            BufferUsage::UnorderedAccess => "unordered-access",
            BufferUsage::AccelerationStructure => "acceleration-structure",
        }
    }
}

/// Description of a buffer to create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferResourceDesc {
    /// Debug name attached to the native object.
    pub name: String,
    /// Intended usage; decides heap and initial state.
    pub usage: BufferUsage,
    /// Size in bytes. Must be non-zero.
    pub size: u64,
    /// Placement alignment in bytes. Must be a power of two.
    pub alignment: u64,
}

impl BufferResourceDesc {
    /// Describes a buffer with the default placement alignment.
    pub fn new(name: impl Into<String>, usage: BufferUsage, size: u64) -> Self {
        Self {
            name: name.into(),
            usage,
            size,
            alignment: DEFAULT_BUFFER_ALIGNMENT,
        }
    }

    /// Overrides the placement alignment.
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Checks size and alignment.
    pub fn validate(&self) -> Result<(), String> {
        if self.size == 0 {
            return Err(format!("buffer '{}' has zero size", self.name));
        }
        if !self.alignment.is_power_of_two() {
            return Err(format!(
                "buffer '{}' alignment {} is not a power of two",
                self.name, self.alignment
            ));
        }
        Ok(())
    }
}

/// Texel formats the backend knows how to size and upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    R32Uint,
    Depth32Float,
    Depth24Stencil8,
}

impl TextureFormat {
    /// Size of one texel in bytes.
    pub fn bytes_per_texel(self) -> u64 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::R32Float
            | TextureFormat::R32Uint
            | TextureFormat::Depth32Float
            | TextureFormat::Depth24Stencil8 => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }

    /// Whether the format has a depth aspect.
    #[inline]
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            TextureFormat::Depth32Float | TextureFormat::Depth24Stencil8
        )
    }
}

/// Texture usage kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureUsage {
    RenderTarget,
    Sampled,
    DepthStencil,
    UnorderedAccess,
}

/// Texture states used by the backend's own transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureState {
    /// Contents undefined; the state of a freshly created texture.
    Undefined,
    Common,
    RenderTarget,
    Present,
    CopyDest,
    ShaderResource,
    DepthWrite,
    UnorderedAccess,
}

impl TextureUsage {
    /// Initial resource state for this usage.
    pub fn initial_state(self) -> TextureState {
        match self {
            TextureUsage::RenderTarget => TextureState::RenderTarget,
            TextureUsage::DepthStencil => TextureState::DepthWrite,
            TextureUsage::Sampled | TextureUsage::UnorderedAccess => TextureState::Common,
        }
    }

    /// Render targets and depth buffers always get their own allocation and
    /// are never sub-allocated from a shared block.
    #[inline]
    pub fn is_committed(self) -> bool {
        matches!(self, TextureUsage::RenderTarget | TextureUsage::DepthStencil)
    }

    /// Whether shaders may write the texture.
    #[inline]
    pub fn allows_unordered_access(self) -> bool {
        !matches!(self, TextureUsage::DepthStencil)
    }

    pub fn name(self) -> &'static str {
        match self {
            TextureUsage::RenderTarget => "render-target",
            TextureUsage::Sampled => "sampled",
            TextureUsage::DepthStencil => "depth-stencil",
            TextureUsage::UnorderedAccess => "unordered-access",
        }
    }
}

/// Description of a texture to create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureResourceDesc {
    pub name: String,
    pub usage: TextureUsage,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    /// Depth in texels; 1 for 2D textures.
    pub depth: u32,
    /// Allocate memory that other devices or processes may open.
    pub shared: bool,
}

/// Byte layout of a texture's upload data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadFootprint {
    /// Bytes between the starts of two rows, padded to the pitch alignment.
    pub row_pitch: u64,
    /// Rows per depth slice.
    pub rows: u32,
    /// Depth slices.
    pub slices: u32,
    /// Total bytes the staging buffer must hold.
    pub total_size: u64,
}

impl TextureResourceDesc {
    /// Describes a 2D texture.
    pub fn new_2d(
        name: impl Into<String>,
        usage: TextureUsage,
        format: TextureFormat,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            name: name.into(),
            usage,
            format,
            width,
            height,
            depth: 1,
            shared: false,
        }
    }

    /// Checks extents and the usage/format pairing.
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return Err(format!(
                "texture '{}' has an empty extent {}x{}x{}",
                self.name, self.width, self.height, self.depth
            ));
        }
        match (self.usage, self.format.is_depth()) {
            (TextureUsage::DepthStencil, false) => Err(format!(
                "texture '{}' is a depth-stencil target with color format {:?}",
                self.name, self.format
            )),
            (TextureUsage::RenderTarget | TextureUsage::UnorderedAccess, true) => Err(format!(
                "texture '{}' uses depth format {:?} as a {} texture",
                self.name,
                self.format,
                self.usage.name()
            )),
            _ => Ok(()),
        }
    }

    /// Layout of the data needed to upload the whole texture.
    pub fn upload_footprint(&self) -> UploadFootprint {
        let row_bytes = u64::from(self.width) * self.format.bytes_per_texel();
        let row_pitch = row_bytes.next_multiple_of(TEXTURE_UPLOAD_PITCH_ALIGNMENT);
        let rows = self.height;
        let slices = self.depth;

        // The last row of the last slice does not need padding.
        let total_size =
            row_pitch * u64::from(rows) * u64::from(slices) - (row_pitch - row_bytes);

        UploadFootprint {
            row_pitch,
            rows,
            slices,
            total_size,
        }
    }
}
