//! Vulkan images backed by gpu-allocator memory.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use crate::device::RawDevice;
use crate::error::{RhiError, RhiResult};
use crate::resource::{TextureFormat, TextureResourceDesc, TextureState, TextureUsage};

/// Vulkan format for a texture format.
pub fn vk_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::R32Uint => vk::Format::R32_UINT,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
        TextureFormat::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
    }
}

/// Vulkan image usage flags for a texture usage kind.
pub fn vk_image_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let base = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC;
    match usage {
        TextureUsage::RenderTarget => {
            base | vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::STORAGE
        }
        TextureUsage::Sampled | TextureUsage::UnorderedAccess => {
            base | vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST
        }
        TextureUsage::DepthStencil => base | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
    }
}

/// Layout, access mask and pipeline stage a texture state corresponds to.
pub fn state_access(state: TextureState) -> (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags) {
    match state {
        TextureState::Undefined => (
            vk::ImageLayout::UNDEFINED,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ),
        TextureState::Common => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        TextureState::RenderTarget => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        TextureState::Present => (
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
        TextureState::CopyDest => (
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        TextureState::ShaderResource => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        TextureState::DepthWrite => (
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        TextureState::UnorderedAccess => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
    }
}

/// GPU image with managed memory.
pub struct Texture {
    device: Arc<RawDevice>,
    image: vk::Image,
    allocation: Option<Allocation>,
    format: TextureFormat,
    extent: vk::Extent3D,
    usage: TextureUsage,
    name: String,
}

impl Texture {
    /// Creates an image for `desc`.
    ///
    /// Render targets and depth buffers get a dedicated allocation; other
    /// textures are sub-allocated.
    ///
    /// # Errors
    ///
    /// Returns an error if the description is invalid or creation fails.
    pub fn new(device: Arc<RawDevice>, desc: &TextureResourceDesc) -> RhiResult<Self> {
        desc.validate().map_err(RhiError::InvalidRequest)?;

        let extent = vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
        };
        let image_type = if desc.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };

        let image_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(vk_format(desc.format))
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk_image_usage(desc.usage))
            .sharing_mode(device.sharing_mode())
            .queue_family_indices(device.queue_families())
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.handle().create_image(&image_info, None)? };
        let requirements = unsafe { device.handle().get_image_memory_requirements(image) };

        let allocation_scheme = if desc.usage.is_committed() || desc.shared {
            AllocationScheme::DedicatedImage(image)
        } else {
            AllocationScheme::GpuAllocatorManaged
        };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name: &desc.name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_image(image, None) };
                return Err(e.into());
            }
        };

        let bind = unsafe {
            device
                .handle()
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bind {
            if let Err(free_err) = device.allocator().lock().free(allocation) {
                error!("Failed to free allocation of unbound image: {:?}", free_err);
            }
            unsafe { device.handle().destroy_image(image, None) };
            return Err(e.into());
        }

        debug!(
            "Created {} texture '{}': {}x{}x{} {:?}",
            desc.usage.name(),
            desc.name,
            desc.width,
            desc.height,
            desc.depth,
            desc.format
        );

        Ok(Self {
            device,
            image,
            allocation: Some(allocation),
            format: desc.format,
            extent,
            usage: desc.usage,
            name: desc.name.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn format(&self) -> TextureFormat {
        self.format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    /// Aspect covered by layout transitions of this texture.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        match self.format {
            TextureFormat::Depth32Float => vk::ImageAspectFlags::DEPTH,
            TextureFormat::Depth24Stencil8 => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            _ => vk::ImageAspectFlags::COLOR,
        }
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.device.allocator().lock().free(allocation)
        {
            error!("Failed to free texture allocation: {:?}", e);
        }

        unsafe {
            self.device.handle().destroy_image(self.image, None);
        }

        debug!("Destroyed {} texture '{}'", self.usage.name(), self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_formats() {
        assert_eq!(vk_format(TextureFormat::Depth32Float), vk::Format::D32_SFLOAT);
        assert_eq!(
            vk_format(TextureFormat::Depth24Stencil8),
            vk::Format::D24_UNORM_S8_UINT
        );
    }

    #[test]
    fn test_image_usage_flags() {
        assert!(
            vk_image_usage(TextureUsage::RenderTarget)
                .contains(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::STORAGE)
        );
        assert!(
            vk_image_usage(TextureUsage::DepthStencil)
                .contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        );
        assert!(
            !vk_image_usage(TextureUsage::DepthStencil).contains(vk::ImageUsageFlags::STORAGE)
        );
        assert!(
            vk_image_usage(TextureUsage::Sampled).contains(vk::ImageUsageFlags::TRANSFER_DST)
        );
    }

    #[test]
    fn test_present_transition_layouts() {
        let (layout, _, _) = state_access(TextureState::Present);
        assert_eq!(layout, vk::ImageLayout::PRESENT_SRC_KHR);
        let (layout, access, _) = state_access(TextureState::RenderTarget);
        assert_eq!(layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert!(access.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
    }
}
