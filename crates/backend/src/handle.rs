//! Opaque handles to backend-owned resources.
//!
//! Handles are generational arena keys: a handle to a destroyed resource
//! resolves to nothing instead of to whatever reused its slot.

use slotmap::new_key_type;

new_key_type! {
    /// Handle to a buffer created through [`crate::Backend::create_buffer`].
    pub struct BufferHandle;

    /// Handle to a texture created through [`crate::Backend::create_texture`].
    pub struct TextureHandle;
}
