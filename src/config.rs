//! Configuration loading using Figment.
//!
//! This module provides strongly-typed configuration for the service.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `SCOPEDAQ_`)
//!
//! # Environment Variable Overrides
//!
//! Environment variables with the `SCOPEDAQ_` prefix can override
//! configuration values:
//!
//! ```text
//! SCOPEDAQ_SERVICE_LISTEN_ADDR=0.0.0.0:2626
//! SCOPEDAQ_DEVICE_RESOURCE_MATCH=DS1ZA205020656
//! SCOPEDAQ_DEVICE_PROFILE=legacy
//! ```
//!
//! There is no ambient global state: the loaded [`Settings`] value is passed
//! into the service constructor explicitly.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ShotResult;

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Control-link and protocol settings.
    #[serde(default)]
    pub service: ServiceConfig,
    /// Instrument identity and behavior profile.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Trace persistence settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Control-link and protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Address the command loop listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Suffix that marks a command token as a shot artifact path.
    #[serde(default = "default_shot_suffix")]
    pub shot_file_suffix: String,
}

/// Instrument identity and behavior profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name under which the shot descriptor addresses this device.
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Substring that must match exactly one visible resource address.
    #[serde(default)]
    pub resource_match: String,
    /// Device revision profile selecting decode and persistence policies.
    #[serde(default)]
    pub profile: DeviceProfile,
    /// Delay after a timebase write, giving the instrument time to settle.
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,
}

/// Trace persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Group under which trace series are written in the shot artifact.
    #[serde(default = "default_trace_group")]
    pub trace_group: String,
}

/// Device revision profile.
///
/// The observed instrument revisions disagree on voltage calibration order,
/// time-axis direction, and time-series naming. Rather than hard-coding one
/// formula as universally correct, the profile selects a
/// [`crate::lifecycle::DeviceStrategy`] at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceProfile {
    /// Canonical policy set: offset-before-scale calibration, ascending time
    /// axis, one shared `times` series, reads halt acquisition.
    #[default]
    Standard,
    /// Historical revision behavior: offset-after-scale calibration,
    /// descending time axis, per-channel `times<name>` series, reads leave
    /// acquisition running.
    Legacy,
}

fn default_listen_addr() -> String {
    "0.0.0.0:2627".to_string()
}

fn default_shot_suffix() -> String {
    ".h5".to_string()
}

fn default_device_name() -> String {
    "scope".to_string()
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_trace_group() -> String {
    "ScopeTraces".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            shot_file_suffix: default_shot_suffix(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            resource_match: String::new(),
            profile: DeviceProfile::default(),
            settle_delay: default_settle_delay(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            trace_group: default_trace_group(),
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus `SCOPEDAQ_` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> ShotResult<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed("SCOPEDAQ_").split("_"))
            .extract()?;
        Ok(settings)
    }
}
