//! Vulkan logical device and the [`GpuDevice`] implementation.
//!
//! # Overview
//!
//! - [`RawDevice`] owns the `ash::Device` and the gpu-allocator instance. Every
//!   native object (buffer, texture, pool, fence, heap) holds an `Arc` to it,
//!   so the device is destroyed only after the last object using it.
//! - [`Device`] adds the queues and implements [`GpuDevice`].
//!
//! Queue-level signals and waits are expressed as empty submissions carrying
//! timeline semaphore operations, so they take effect in submission order
//! exactly like commands would.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use inflight_rhi::instance::Instance;
//! use inflight_rhi::physical_device::select_physical_device;
//! use inflight_rhi::device::Device;
//!
//! let instance = Arc::new(Instance::new(false).expect("Failed to create instance"));
//! let info = select_physical_device(&instance).expect("No suitable GPU found");
//! let device = Device::new(instance, &info).expect("Failed to create logical device");
//! ```

use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::buffer::Buffer;
use crate::command::{CommandBuffer, CommandPool};
use crate::descriptor::DescriptorHeap;
use crate::error::RhiResult;
use crate::gpu::{DescriptorHeapKind, DescriptorHeapLayout, GpuDevice, QueueKind, WaitStatus};
use crate::instance::Instance;
use crate::physical_device::PhysicalDeviceInfo;
use crate::resource::{BufferResourceDesc, TextureResourceDesc, TextureState};
use crate::sync::TimelineFence;
use crate::texture::Texture;

/// Logical device and memory allocator shared by every native object.
pub struct RawDevice {
    device: ash::Device,
    /// Dropped by hand before the device is destroyed.
    allocator: ManuallyDrop<Mutex<Allocator>>,
    /// Distinct families of the direct and copy queues.
    queue_families: Vec<u32>,
    _instance: Arc<Instance>,
}

/// Families a resource must be shared between when the copy queue comes from
/// a different family than the direct queue.
pub fn shared_queue_families(graphics: u32, transfer: Option<u32>) -> Vec<u32> {
    let mut families = vec![graphics];
    if let Some(transfer) = transfer
        && transfer != graphics
    {
        families.push(transfer);
    }
    families
}

/// `CONCURRENT` when more than one family touches a resource, so uploads on
/// the copy queue need no ownership transfer before the direct queue reads.
pub fn sharing_mode(families: &[u32]) -> vk::SharingMode {
    if families.len() > 1 {
        vk::SharingMode::CONCURRENT
    } else {
        vk::SharingMode::EXCLUSIVE
    }
}

impl RawDevice {
    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Returns the GPU memory allocator.
    #[inline]
    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Queue families buffers and textures are created for.
    #[inline]
    pub fn queue_families(&self) -> &[u32] {
        &self.queue_families
    }

    #[inline]
    pub fn sharing_mode(&self) -> vk::SharingMode {
        sharing_mode(&self.queue_families)
    }
}

impl Drop for RawDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }

            // The allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

/// A hardware queue and the family it belongs to.
struct QueueContext {
    /// `vkQueueSubmit` requires external synchronization per queue.
    queue: Mutex<vk::Queue>,
    family: u32,
}

/// Vulkan implementation of [`GpuDevice`].
pub struct Device {
    raw: Arc<RawDevice>,
    info: PhysicalDeviceInfo,
    direct: QueueContext,
    copy: Option<QueueContext>,
}

impl Device {
    /// Creates the logical device, its queues and the memory allocator.
    ///
    /// Enables the Vulkan 1.2 features the backend depends on: timeline
    /// semaphores, buffer device addresses, and partially bound,
    /// update-after-bind descriptor arrays.
    ///
    /// # Errors
    ///
    /// Returns an error if device creation or allocator initialization fails.
    pub fn new(instance: Arc<Instance>, info: &PhysicalDeviceInfo) -> RhiResult<Self> {
        let unique_families = info.queue_families.unique_families();
        let queue_priorities = [1.0f32];

        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        debug!(
            "Creating {} queue(s) for families: {:?}",
            queue_create_infos.len(),
            unique_families
        );

        let mut features_1_2 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .descriptor_binding_storage_buffer_update_after_bind(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .push_next(&mut features_1_2);

        let device = unsafe {
            instance
                .handle()
                .create_device(info.device, &create_info, None)?
        };

        info!("Logical device created on '{}'", info.device_name());

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: info.device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        info!("GPU memory allocator initialized");

        let direct = QueueContext {
            queue: Mutex::new(unsafe { device.get_device_queue(info.graphics_family, 0) }),
            family: info.graphics_family,
        };
        let copy = info.queue_families.transfer_family.map(|family| {
            debug!("Copy queue retrieved from family {}", family);
            QueueContext {
                queue: Mutex::new(unsafe { device.get_device_queue(family, 0) }),
                family,
            }
        });

        let queue_families =
            shared_queue_families(info.graphics_family, copy.as_ref().map(|copy| copy.family));
        if queue_families.len() > 1 {
            debug!("Resources shared concurrently by families {:?}", queue_families);
        }

        let raw = Arc::new(RawDevice {
            device,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            queue_families,
            _instance: instance,
        });

        Ok(Self {
            raw,
            info: info.clone(),
            direct,
            copy,
        })
    }

    /// Shared device handle for creating native objects by hand.
    #[inline]
    pub fn raw(&self) -> &Arc<RawDevice> {
        &self.raw
    }

    #[inline]
    pub fn physical_device_info(&self) -> &PhysicalDeviceInfo {
        &self.info
    }

    /// Copy work falls back to the direct queue without a transfer family.
    fn queue(&self, kind: QueueKind) -> &QueueContext {
        match kind {
            QueueKind::Direct => &self.direct,
            QueueKind::Copy => self.copy.as_ref().unwrap_or(&self.direct),
        }
    }

    fn submit(&self, kind: QueueKind, submit_info: &vk::SubmitInfo<'_>) -> RhiResult<()> {
        let queue = self.queue(kind).queue.lock();
        unsafe {
            self.raw.handle().queue_submit(
                *queue,
                std::slice::from_ref(submit_info),
                vk::Fence::null(),
            )?;
        }
        Ok(())
    }
}

impl GpuDevice for Device {
    type Buffer = Buffer;
    type Texture = Texture;
    type DescriptorHeap = DescriptorHeap;
    type CommandAllocator = CommandPool;
    type CommandList = CommandBuffer;
    type Fence = TimelineFence;

    fn name(&self) -> String {
        format!(
            "{} ({})",
            self.info.device_name(),
            self.info.device_type_name()
        )
    }

    fn has_dedicated_copy_queue(&self) -> bool {
        self.copy.is_some()
    }

    fn create_buffer(&self, desc: &BufferResourceDesc) -> RhiResult<Buffer> {
        Buffer::new(self.raw.clone(), desc)
    }

    fn create_texture(&self, desc: &TextureResourceDesc) -> RhiResult<Texture> {
        Texture::new(self.raw.clone(), desc)
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> RhiResult<DescriptorHeap> {
        DescriptorHeap::new(self.raw.clone(), kind, capacity)
    }

    fn descriptor_heap_layout(&self, heap: &DescriptorHeap) -> DescriptorHeapLayout {
        heap.layout()
    }

    fn create_command_allocator(&self, queue: QueueKind) -> RhiResult<CommandPool> {
        CommandPool::new(self.raw.clone(), queue, self.queue(queue).family)
    }

    fn reset_command_allocator(&self, allocator: &mut CommandPool) -> RhiResult<()> {
        allocator.reset()
    }

    fn open_command_list(&self, allocator: &mut CommandPool) -> RhiResult<CommandBuffer> {
        allocator.begin_command_buffer()
    }

    fn close_command_list(&self, list: &mut CommandBuffer) -> RhiResult<()> {
        list.end()
    }

    fn execute_command_lists(&self, queue: QueueKind, lists: &[&CommandBuffer]) -> RhiResult<()> {
        if lists.is_empty() {
            return Ok(());
        }
        let buffers: Vec<vk::CommandBuffer> = lists.iter().map(|list| list.handle()).collect();
        let submit_info = vk::SubmitInfo::default().command_buffers(&buffers);
        self.submit(queue, &submit_info)
    }

    fn record_buffer_copy(
        &self,
        list: &mut CommandBuffer,
        src: &Buffer,
        src_offset: u64,
        dst: &Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        list.copy_buffer(src.handle(), src_offset, dst.handle(), dst_offset, size);
    }

    fn record_texture_transition(
        &self,
        list: &mut CommandBuffer,
        texture: &Texture,
        before: TextureState,
        after: TextureState,
    ) {
        list.transition_texture(texture, before, after);
    }

    fn create_fence(&self, initial_value: u64) -> RhiResult<TimelineFence> {
        TimelineFence::new(self.raw.clone(), initial_value)
    }

    fn signal(&self, queue: QueueKind, fence: &TimelineFence, value: u64) -> RhiResult<()> {
        let semaphores = [fence.handle()];
        let values = [value];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&values);
        let submit_info = vk::SubmitInfo::default()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);
        self.submit(queue, &submit_info)
    }

    fn queue_wait(&self, queue: QueueKind, fence: &TimelineFence, value: u64) -> RhiResult<()> {
        let semaphores = [fence.handle()];
        let values = [value];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().wait_semaphore_values(&values);
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&semaphores)
            .wait_dst_stage_mask(&stages)
            .push_next(&mut timeline_info);
        self.submit(queue, &submit_info)
    }

    fn completed_value(&self, fence: &TimelineFence) -> RhiResult<u64> {
        fence.completed_value()
    }

    fn wait_for_value(
        &self,
        fence: &TimelineFence,
        value: u64,
        timeout: Option<Duration>,
    ) -> RhiResult<WaitStatus> {
        let timeout_ns = timeout.map_or(u64::MAX, |t| {
            u64::try_from(t.as_nanos()).unwrap_or(u64::MAX)
        });
        fence.wait(value, timeout_ns)
    }

    fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.raw.handle().device_wait_idle()? };
        Ok(())
    }

    fn device_lost_report(&self) -> Option<String> {
        let report = self.raw.allocator().lock().generate_report();
        Some(format!(
            "device '{}': {} live allocation(s), {} byte(s) allocated in {} block(s), {} byte(s) reserved",
            self.info.device_name(),
            report.allocations.len(),
            report.total_allocated_bytes,
            report.blocks.len(),
            report.total_reserved_bytes
        ))
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("gpu", &self.info)
            .field("dedicated_copy_queue", &self.copy.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Device>();
        assert_send_sync::<RawDevice>();
    }

    #[test]
    fn test_distinct_transfer_family_shares_concurrently() {
        let families = shared_queue_families(0, Some(2));
        assert_eq!(families, vec![0, 2]);
        assert_eq!(sharing_mode(&families), vk::SharingMode::CONCURRENT);
    }

    #[test]
    fn test_single_family_stays_exclusive() {
        assert_eq!(shared_queue_families(1, Some(1)), vec![1]);
        let families = shared_queue_families(0, None);
        assert_eq!(sharing_mode(&families), vk::SharingMode::EXCLUSIVE);
    }
}
