//! Workcell configuration using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults reproducing the reference workcell
//! 2. A TOML file (`config/workcell.toml` by default)
//! 3. Environment variables prefixed with `WORKCELL_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated with a double underscore:
//!
//! ```text
//! WORKCELL_APPLICATION__LOG_LEVEL=debug
//! WORKCELL_TIMING__TICK_INTERVAL=100ms
//! WORKCELL_TIMING__ABORT_POLICY=await_acknowledgement
//! ```
//!
//! # Example
//!
//! ```no_run
//! use workcell_hub::config::WorkcellConfig;
//!
//! let config = WorkcellConfig::load().unwrap_or_default();
//! println!("Devices: {}", config.devices.len());
//! println!("Tick interval: {:?}", config.timing.tick_interval);
//! ```

use crate::status::DeviceStatus;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/workcell.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The layered configuration could not be extracted.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// The configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    /// The configuration could not be rendered back to TOML.
    #[error("Configuration serialization error: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Top-level workcell configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkcellConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Simulation timing and abort behaviour
    #[serde(default)]
    pub timing: TimingConfig,
    /// Device catalog, in display order
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceDefinition>,
    /// Protocol catalog and step script
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Sample ledger bounds and candidate sets
    #[serde(default)]
    pub samples: SampleConfig,
    /// Channel capacities
    #[serde(default)]
    pub channels: ChannelConfig,
}

impl Default for WorkcellConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            timing: TimingConfig::default(),
            devices: default_devices(),
            protocol: ProtocolConfig::default(),
            samples: SampleConfig::default(),
            channels: ChannelConfig::default(),
        }
    }
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// How an emergency abort treats runners that are still winding down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AbortPolicy {
    /// Signal cancellation and report the abort immediately. Runners stop at
    /// their next tick boundary.
    #[default]
    BestEffort,
    /// Signal cancellation and wait until every cancelled runner has
    /// terminated before reporting the abort.
    AwaitAcknowledgement,
}

/// Simulation timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Sleep between runner ticks
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Delay between a step completing and the next step starting
    #[serde(default = "default_inter_step_delay", with = "humantime_serde")]
    pub inter_step_delay: Duration,
    /// How long a system notice should stay visible
    #[serde(default = "default_notice_duration", with = "humantime_serde")]
    pub notice_duration: Duration,
    /// Emergency abort acknowledgement policy
    #[serde(default)]
    pub abort_policy: AbortPolicy,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            inter_step_delay: default_inter_step_delay(),
            notice_duration: default_notice_duration(),
            abort_policy: AbortPolicy::default(),
        }
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Stable device identity
    pub name: String,
    /// Status shown before any operation has run
    #[serde(default = "default_initial_status")]
    pub initial_status: DeviceStatus,
    /// Operation description used by the manual test trigger
    #[serde(default = "default_test_operation")]
    pub test_operation: String,
}

impl DeviceDefinition {
    /// Create a definition with an initial status and a test operation.
    pub fn new(
        name: impl Into<String>,
        initial_status: DeviceStatus,
        test_operation: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            initial_status,
            test_operation: test_operation.into(),
        }
    }
}

/// One step of the protocol script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStep {
    /// Device that executes the step
    pub device: String,
    /// Human-readable operation description
    pub operation: String,
}

impl ProtocolStep {
    /// Create a step.
    pub fn new(device: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            operation: operation.into(),
        }
    }
}

/// Protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Protocol names offered to the presentation shell
    #[serde(default = "default_catalog")]
    pub catalog: Vec<String>,
    /// Ordered step script shared by every protocol
    #[serde(default = "default_steps")]
    pub steps: Vec<ProtocolStep>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            catalog: default_catalog(),
            steps: default_steps(),
        }
    }
}

/// Sample ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleConfig {
    /// Smallest sample count a protocol accepts
    #[serde(default = "default_min_count")]
    pub min_count: u32,
    /// Largest sample count a protocol accepts
    #[serde(default = "default_max_count")]
    pub max_count: u32,
    /// Count pre-selected by the presentation shell
    #[serde(default = "default_sample_count")]
    pub default_count: u32,
    /// Candidate sample types
    #[serde(default = "default_sample_types")]
    pub types: Vec<String>,
    /// Candidate sample locations
    #[serde(default = "default_sample_locations")]
    pub locations: Vec<String>,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            min_count: default_min_count(),
            max_count: default_max_count(),
            default_count: default_sample_count(),
            types: default_sample_types(),
            locations: default_sample_locations(),
        }
    }
}

/// Channel capacities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Capacity of the status, log, sample and notice broadcast feeds
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
    /// Capacity of the command mailbox
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
    /// Number of log events retained in the log buffer
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            feed_capacity: default_feed_capacity(),
            command_capacity: default_command_capacity(),
            log_capacity: default_log_capacity(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "Integrated Workcell Control Hub".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_inter_step_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_notice_duration() -> Duration {
    Duration::from_secs(5)
}

fn default_initial_status() -> DeviceStatus {
    DeviceStatus::Ready
}

fn default_test_operation() -> String {
    "Running test".to_string()
}

fn default_devices() -> Vec<DeviceDefinition> {
    vec![
        DeviceDefinition::new("Transport Robot", DeviceStatus::Idle, "Moving to position A3"),
        DeviceDefinition::new("Liquid Handler", DeviceStatus::Ready, "Aspirating samples"),
        DeviceDefinition::new(
            "Plate Reader",
            DeviceStatus::Ready,
            "Reading absorbance at 450nm",
        ),
        DeviceDefinition::new("Centrifuge", DeviceStatus::Ready, "Spinning at 2000 RPM"),
        DeviceDefinition::new(
            "Incubator",
            DeviceStatus::Custom("Maintaining 37°C".to_string()),
            "Temperature verification",
        ),
        DeviceDefinition::new(
            "Storage Unit",
            DeviceStatus::Ready,
            "Retrieving plate from position B2",
        ),
    ]
}

fn default_catalog() -> Vec<String> {
    [
        "Cell Culture - Automated Passage",
        "High-Throughput Clone Screening",
        "Sample Prep for LC-MS Analysis",
        "Plate-Based Assay Workflow",
        "Bioreactor Sample Collection",
        "Inter-Lab Sample Transfer",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_steps() -> Vec<ProtocolStep> {
    vec![
        ProtocolStep::new("Transport Robot", "Retrieving samples from storage"),
        ProtocolStep::new("Liquid Handler", "Dispensing reagents"),
        ProtocolStep::new("Incubator", "Incubating samples"),
        ProtocolStep::new("Centrifuge", "Centrifuging samples"),
        ProtocolStep::new("Plate Reader", "Reading plate"),
        ProtocolStep::new("Transport Robot", "Returning samples to storage"),
    ]
}

fn default_min_count() -> u32 {
    1
}

fn default_max_count() -> u32 {
    96
}

fn default_sample_count() -> u32 {
    24
}

fn default_sample_types() -> Vec<String> {
    ["CHO Clone", "Media Sample", "Assay Plate", "QC Sample"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_sample_locations() -> Vec<String> {
    ["Incubator A", "Storage -80C", "Workcell 1", "Reader Station"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_feed_capacity() -> usize {
    1024
}

fn default_command_capacity() -> usize {
    64
}

fn default_log_capacity() -> usize {
    10_000
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl WorkcellConfig {
    /// Load configuration from `config/workcell.toml` and environment variables
    ///
    /// Precedence (highest to lowest):
    /// 1. Environment variables (`WORKCELL_` prefix)
    /// 2. `config/workcell.toml`
    /// 3. Built-in defaults
    ///
    /// A missing file is not an error; the defaults are used instead.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path and validate it.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("WORKCELL_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Tick interval and channel capacities are non-zero
    /// - Device names are unique and non-empty
    /// - The protocol script is non-empty and only names registered devices
    /// - Sample bounds are ordered and candidate sets are non-empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.timing.tick_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "tick_interval must be greater than zero".to_string(),
            ));
        }

        if self.channels.feed_capacity == 0
            || self.channels.command_capacity == 0
            || self.channels.log_capacity == 0
        {
            return Err(ConfigError::ValidationError(
                "Channel capacities must be greater than zero".to_string(),
            ));
        }

        if self.devices.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one device must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Device name cannot be empty".to_string(),
                ));
            }
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate device name: '{}'",
                    device.name
                )));
            }
        }

        if self.protocol.steps.is_empty() {
            return Err(ConfigError::ValidationError(
                "Protocol script must contain at least one step".to_string(),
            ));
        }

        for (index, step) in self.protocol.steps.iter().enumerate() {
            if !names.contains(step.device.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Protocol step {} references unknown device '{}'",
                    index + 1,
                    step.device
                )));
            }
        }

        let samples = &self.samples;
        if samples.min_count == 0
            || samples.min_count > samples.default_count
            || samples.default_count > samples.max_count
        {
            return Err(ConfigError::ValidationError(format!(
                "Sample bounds must satisfy 1 <= min ({}) <= default ({}) <= max ({})",
                samples.min_count, samples.default_count, samples.max_count
            )));
        }

        if samples.types.is_empty() || samples.locations.is_empty() {
            return Err(ConfigError::ValidationError(
                "Sample types and locations cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
