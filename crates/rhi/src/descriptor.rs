//! Pre-sized descriptor heaps.
//!
//! The shader-visible heap is one descriptor set holding a single, partially
//! bound, update-after-bind array; a slot index in the heap is an index into
//! that array. Render-target and depth-stencil views have no shader-visible
//! storage in Vulkan, so their heaps are plain index spaces.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::RawDevice;
use crate::error::{RhiError, RhiResult};
use crate::gpu::{DescriptorHeapKind, DescriptorHeapLayout};

/// Binding that holds the shader-visible descriptor array.
pub const HEAP_BINDING: u32 = 0;

/// Descriptor type stored in the shader-visible array.
const HEAP_DESCRIPTOR_TYPE: vk::DescriptorType = vk::DescriptorType::STORAGE_BUFFER;

/// Vulkan objects behind the shader-visible heap.
struct ShaderVisibleSet {
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
}

/// A descriptor heap of fixed capacity.
pub struct DescriptorHeap {
    device: Arc<RawDevice>,
    kind: DescriptorHeapKind,
    capacity: u32,
    shader_visible: Option<ShaderVisibleSet>,
}

impl DescriptorHeap {
    /// Creates a heap with room for `capacity` descriptors.
    ///
    /// # Errors
    ///
    /// Returns an error if the capacity is zero or the Vulkan objects cannot
    /// be created.
    pub fn new(device: Arc<RawDevice>, kind: DescriptorHeapKind, capacity: u32) -> RhiResult<Self> {
        if capacity == 0 {
            return Err(RhiError::InvalidRequest(format!(
                "{} descriptor heap needs a non-zero capacity",
                kind.name()
            )));
        }

        let shader_visible = if kind.is_shader_visible() {
            Some(Self::create_shader_visible_set(&device, capacity)?)
        } else {
            None
        };

        debug!(
            "Created {} descriptor heap with {} slot(s)",
            kind.name(),
            capacity
        );

        Ok(Self {
            device,
            kind,
            capacity,
            shader_visible,
        })
    }

    fn create_shader_visible_set(device: &RawDevice, capacity: u32) -> RhiResult<ShaderVisibleSet> {
        let handle = device.handle();

        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(HEAP_BINDING)
            .descriptor_type(HEAP_DESCRIPTOR_TYPE)
            .descriptor_count(capacity)
            .stage_flags(vk::ShaderStageFlags::ALL)];
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&bindings)
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .push_next(&mut flags_info);
        let layout = unsafe { handle.create_descriptor_set_layout(&layout_info, None)? };

        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(HEAP_DESCRIPTOR_TYPE)
            .descriptor_count(capacity)];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND);
        let pool = match unsafe { handle.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { handle.destroy_descriptor_set_layout(layout, None) };
                return Err(e.into());
            }
        };

        let counts = [capacity];
        let mut count_info =
            vk::DescriptorSetVariableDescriptorCountAllocateInfo::default().descriptor_counts(&counts);
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts)
            .push_next(&mut count_info);
        let set = match unsafe { handle.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets.into_iter().next(),
            Err(e) => {
                unsafe {
                    handle.destroy_descriptor_pool(pool, None);
                    handle.destroy_descriptor_set_layout(layout, None);
                }
                return Err(e.into());
            }
        };
        let Some(set) = set else {
            unsafe {
                handle.destroy_descriptor_pool(pool, None);
                handle.destroy_descriptor_set_layout(layout, None);
            }
            return Err(RhiError::InvalidRequest(
                "driver returned no descriptor set".to_string(),
            ));
        };

        Ok(ShaderVisibleSet { pool, layout, set })
    }

    #[inline]
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Set layout to include in pipeline layouts, for the shader-visible heap.
    pub fn set_layout(&self) -> Option<vk::DescriptorSetLayout> {
        self.shader_visible.as_ref().map(|s| s.layout)
    }

    /// Descriptor set to bind, for the shader-visible heap.
    pub fn descriptor_set(&self) -> Option<vk::DescriptorSet> {
        self.shader_visible.as_ref().map(|s| s.set)
    }

    /// Slot `i` is array element `i`; shader-visible slots share the index.
    pub fn layout(&self) -> DescriptorHeapLayout {
        DescriptorHeapLayout {
            cpu_base: 0,
            gpu_base: self.shader_visible.as_ref().map(|_| 0),
            stride: 1,
        }
    }
}

impl Drop for DescriptorHeap {
    fn drop(&mut self) {
        if let Some(set) = self.shader_visible.take() {
            unsafe {
                // Destroying the pool frees the set.
                self.device.handle().destroy_descriptor_pool(set.pool, None);
                self.device
                    .handle()
                    .destroy_descriptor_set_layout(set.layout, None);
            }
        }
        debug!("Destroyed {} descriptor heap", self.kind.name());
    }
}
