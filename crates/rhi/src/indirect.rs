//! Fixed-layout records read by the GPU.
//!
//! These structures are written into indirect-argument and instance buffers,
//! so their byte layout is a contract with shader and driver code. Every
//! record is `#[repr(C)]`, implements `Pod`/`Zeroable`, and has its size
//! checked at compile time.

use bytemuck::{Pod, Zeroable};

/// Instance mask bit for opaque geometry.
pub const OPAQUE_OBJECT_BIT: u8 = 0x01;
/// Instance mask bit for transparent geometry.
pub const TRANSPARENT_OBJECT_BIT: u8 = 0x02;
/// Instance mask bit for emissive geometry.
pub const LIGHT_SOURCE_BIT: u8 = 0x10;

/// Arguments of one indexed indirect draw.
///
/// Matches `VkDrawIndexedIndirectCommand`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedArguments {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// Arguments of one indirect dispatch.
///
/// Matches `VkDispatchIndirectCommand`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DispatchArguments {
    pub group_count_x: u32,
    pub group_count_y: u32,
    pub group_count_z: u32,
}

impl DispatchArguments {
    /// Enough groups of `group_size` threads to cover `threads` in each axis.
    pub fn covering(threads: [u32; 3], group_size: [u32; 3]) -> Self {
        let groups = |n: u32, size: u32| n.div_ceil(size.max(1));
        Self {
            group_count_x: groups(threads[0], group_size[0]),
            group_count_y: groups(threads[1], group_size[1]),
            group_count_z: groups(threads[2], group_size[2]),
        }
    }
}

/// Indexed draw preceded by one 32-bit root constant, typically an object index.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectDrawCommandWithRootConstant {
    pub root_constant: u32,
    pub draw: DrawIndexedArguments,
}

/// Dispatch for a per-object simulation step.
///
/// Every step of the simulation reads the same three indices, so one record
/// type serves all of them.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectDispatchCommand {
    pub data_index: u32,
    pub model_matrix_index: u32,
    pub entity_id: u32,
    pub dispatch: DispatchArguments,
}

/// Indexed draw of a per-object volume.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectDrawCommand {
    pub data_index: u32,
    pub model_matrix_index: u32,
    pub entity_id: u32,
    pub draw: DrawIndexedArguments,
}

/// A 24-bit custom index and an 8-bit visibility mask in one word.
///
/// This is the layout of the `instanceCustomIndex`/`mask` pair of a
/// ray-tracing instance record.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PackedInstanceIndex(u32);

impl PackedInstanceIndex {
    /// Largest custom index that fits.
    pub const MAX_INDEX: u32 = (1 << 24) - 1;

    /// Packs `index` and `mask`, or returns `None` if the index needs more than 24 bits.
    pub fn new(index: u32, mask: u8) -> Option<Self> {
        (index <= Self::MAX_INDEX).then(|| Self(index | (u32::from(mask) << 24)))
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0 & Self::MAX_INDEX
    }

    #[inline]
    pub fn mask(self) -> u8 {
        (self.0 >> 24) as u8
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

const _: () = assert!(size_of::<DrawIndexedArguments>() == 20);
const _: () = assert!(size_of::<DispatchArguments>() == 12);
const _: () = assert!(size_of::<IndirectDrawCommandWithRootConstant>() == 24);
const _: () = assert!(size_of::<IndirectDispatchCommand>() == size_of::<u32>() * 6);
const _: () = assert!(size_of::<IndirectDrawCommand>() == size_of::<u32>() * 8);
const _: () = assert!(size_of::<PackedInstanceIndex>() == 4);
