//! Physical device (GPU) selection.
//!
//! Selection is deliberately minimal: any GPU with a graphics queue and the
//! Vulkan 1.2 features the backend relies on (timeline semaphores, buffer
//! device addresses, partially bound descriptor arrays) qualifies, and a
//! discrete GPU wins over everything else.

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::RhiError;
use crate::instance::Instance;

/// Queue families the backend submits to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    /// Family used for direct (graphics + compute) work.
    pub graphics_family: Option<u32>,
    /// Transfer-only family, if the device has one.
    pub transfer_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Picks the families from a device's family list.
    ///
    /// A transfer family only counts if it supports neither graphics nor
    /// compute; otherwise copy work shares the graphics queue.
    pub fn from_properties(families: &[vk::QueueFamilyProperties]) -> Self {
        let mut indices = Self::default();

        for (i, family) in families.iter().enumerate() {
            if family.queue_count == 0 {
                continue;
            }
            let i = i as u32;
            let flags = family.queue_flags;

            if flags.contains(vk::QueueFlags::GRAPHICS) && indices.graphics_family.is_none() {
                indices.graphics_family = Some(i);
            }
            if flags.contains(vk::QueueFlags::TRANSFER)
                && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                && indices.transfer_family.is_none()
            {
                indices.transfer_family = Some(i);
            }
        }

        indices
    }

    /// Returns the unique queue family indices.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(2);

        if let Some(graphics) = self.graphics_family {
            families.push(graphics);
        }
        if let Some(transfer) = self.transfer_family
            && !families.contains(&transfer)
        {
            families.push(transfer);
        }

        families
    }
}

/// Information about the selected physical device.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    pub device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub queue_families: QueueFamilyIndices,
    /// Queue family index used for direct work. Always present after selection.
    pub graphics_family: u32,
}

impl PhysicalDeviceInfo {
    /// Returns the device name as a string.
    pub fn device_name(&self) -> &str {
        self.properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("Unknown Device")
    }

    /// Returns a human-readable string for the device type.
    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("queue_families", &self.queue_families)
            .finish()
    }
}

/// Selects the GPU the backend will drive.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no GPU has a graphics queue and the
/// required Vulkan 1.2 features.
pub fn select_physical_device(instance: &Instance) -> Result<PhysicalDeviceInfo, RhiError> {
    let handle = instance.handle();
    let devices = unsafe { handle.enumerate_physical_devices()? };

    if devices.is_empty() {
        warn!("No Vulkan-capable GPUs found");
        return Err(RhiError::NoSuitableGpu);
    }

    info!("Found {} GPU(s)", devices.len());

    let selected = devices
        .into_iter()
        .filter_map(|device| check_device_suitability(handle, device))
        .max_by_key(|info| device_type_score(info.properties.device_type))
        .ok_or_else(|| {
            warn!("No GPU supports the required queues and features");
            RhiError::NoSuitableGpu
        })?;

    info!(
        "Selected GPU: '{}' ({}), dedicated transfer queue: {}",
        selected.device_name(),
        selected.device_type_name(),
        selected.queue_families.transfer_family.is_some()
    );

    Ok(selected)
}

fn check_device_suitability(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
) -> Option<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let queue_families = QueueFamilyIndices::from_properties(&families);

    let mut features_1_2 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut features_1_2);
    unsafe { instance.get_physical_device_features2(device, &mut features) };

    let info = PhysicalDeviceInfo {
        device,
        properties,
        queue_families,
        graphics_family: queue_families.graphics_family?,
    };

    if properties.api_version < vk::API_VERSION_1_2 {
        debug!("GPU '{}' skipped: Vulkan 1.2 not supported", info.device_name());
        return None;
    }

    let required = [
        ("timeline semaphores", features_1_2.timeline_semaphore),
        ("buffer device address", features_1_2.buffer_device_address),
        (
            "partially bound descriptors",
            features_1_2.descriptor_binding_partially_bound,
        ),
        (
            "variable descriptor counts",
            features_1_2.descriptor_binding_variable_descriptor_count,
        ),
        (
            "update-after-bind storage buffers",
            features_1_2.descriptor_binding_storage_buffer_update_after_bind,
        ),
    ];
    if let Some((missing, _)) = required.iter().find(|(_, supported)| *supported == vk::FALSE) {
        debug!("GPU '{}' skipped: no {}", info.device_name(), missing);
        return None;
    }

    Some(info)
}

fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}
