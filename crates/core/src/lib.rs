//! Core utilities for the in-flight GPU backend.
//!
//! This crate provides foundational types used across the workspace:
//! - Error types and result aliases
//! - Logging initialization
//! - Configuration management ([`BackendConfig`])

mod config;
mod error;
mod logging;

pub use config::{
    BackendConfig, DEFAULT_MAX_IN_FLIGHT_FRAMES, DescriptorHeapConfig, MAX_IN_FLIGHT_FRAMES_LIMIT,
    MIN_IN_FLIGHT_FRAMES,
};
pub use error::{Error, Result};
pub use logging::{init_logging, init_test_logging};
