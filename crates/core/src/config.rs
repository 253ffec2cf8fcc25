//! Backend configuration.
//!
//! Settings are fixed when the backend is constructed. They can be built in
//! code, or loaded from a TOML file:
//!
//! ```toml
//! max_in_flight_frames = 3
//! verify_every_submission = false
//!
//! [descriptors]
//! rtv = 1024
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Smallest number of frames the CPU may record ahead of the GPU.
pub const MIN_IN_FLIGHT_FRAMES: u32 = 1;

/// Largest number of frame slots the backend will manage.
pub const MAX_IN_FLIGHT_FRAMES_LIMIT: u32 = 8;

/// Frame slot count used when none is configured.
pub const DEFAULT_MAX_IN_FLIGHT_FRAMES: u32 = 3;

/// Capacities of the descriptor heaps, in descriptors.
///
/// There is no grow path, so these must be sized for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DescriptorHeapConfig {
    /// Shader-visible heap for constant, shader-resource and unordered-access views.
    pub cbv_srv_uav: u32,
    /// CPU-only render target view heap.
    pub rtv: u32,
    /// CPU-only depth-stencil view heap.
    pub dsv: u32,
}

impl Default for DescriptorHeapConfig {
    fn default() -> Self {
        Self {
            cbv_srv_uav: 131_072,
            rtv: 1024,
            dsv: 32,
        }
    }
}

/// Configuration of a backend instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Number of frame slots, in `1..=8`.
    pub max_in_flight_frames: u32,
    /// Wait for every command list on a throwaway fence right after it is
    /// executed. Very slow; meant for chasing device-loss bugs.
    pub verify_every_submission: bool,
    /// Request API validation layers when the device is created.
    pub enable_validation: bool,
    /// How many executed command lists are remembered for device-loss dumps.
    pub command_history_len: usize,
    /// Descriptor heap capacities.
    pub descriptors: DescriptorHeapConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_in_flight_frames: DEFAULT_MAX_IN_FLIGHT_FRAMES,
            verify_every_submission: false,
            enable_validation: cfg!(debug_assertions),
            command_history_len: 64,
            descriptors: DescriptorHeapConfig::default(),
        }
    }
}

impl BackendConfig {
    /// Returns a default configuration with the given number of frame slots.
    pub fn with_frames(max_in_flight_frames: u32) -> Self {
        Self {
            max_in_flight_frames,
            ..Self::default()
        }
    }

    /// Parses and validates a configuration from TOML text.
    ///
    /// Missing keys take their default values; unknown keys are rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for this schema, or if
    /// a value is out of range.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or fails [`Self::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded backend configuration from {}", path.display());
        Ok(config)
    }

    /// Checks every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_IN_FLIGHT_FRAMES..=MAX_IN_FLIGHT_FRAMES_LIMIT).contains(&self.max_in_flight_frames)
        {
            return Err(Error::Config(format!(
                "max_in_flight_frames must be in {}..={}, got {}",
                MIN_IN_FLIGHT_FRAMES, MAX_IN_FLIGHT_FRAMES_LIMIT, self.max_in_flight_frames
            )));
        }
        if self.command_history_len == 0 {
            return Err(Error::Config(
                "command_history_len must be at least 1".to_string(),
            ));
        }

        let heaps = [
            ("descriptors.cbv_srv_uav", self.descriptors.cbv_srv_uav),
            ("descriptors.rtv", self.descriptors.rtv),
            ("descriptors.dsv", self.descriptors.dsv),
        ];
        if let Some((key, _)) = heaps.iter().find(|(_, capacity)| *capacity == 0) {
            return Err(Error::Config(format!("{key} must be greater than 0")));
        }

        Ok(())
    }

    /// Number of frame slots as an index type.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.max_in_flight_frames as usize
    }
}
