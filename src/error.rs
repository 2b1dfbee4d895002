//! Custom error types for the workcell hub.
//!
//! `WorkcellError` is the single error type returned by the command intake.
//! Every variant is a local, recoverable rejection: the caller surfaces it as
//! a warning and refuses the action. None of them is fatal to the process,
//! and nothing is retried automatically.
//!
//! ## Error Hierarchy
//!
//! - **`DeviceBusy`**: an operation was requested on a device that already has
//!   a live job.
//! - **`AlreadyRunning`**: a protocol start was requested while a run is active.
//! - **`InvalidSampleCount`**: the requested sample count is outside the
//!   configured bounds.
//! - **`UnknownDevice`**: a device name is absent from the registry.
//! - **`Configuration`**: the configuration failed to load or validate.
//! - **`HubUnavailable`**: the control task has stopped and can no longer take
//!   commands.

use crate::config::ConfigError;
use thiserror::Error;

/// Convenience alias for results using the hub error type.
pub type HubResult<T> = std::result::Result<T, WorkcellError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum WorkcellError {
    #[error("{device} is already active")]
    DeviceBusy { device: String },

    #[error("A protocol is already running")]
    AlreadyRunning,

    #[error("Invalid sample count {count}: must be between {min} and {max}")]
    InvalidSampleCount { count: u32, min: u32, max: u32 },

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Workcell control task is not running")]
    HubUnavailable,
}

impl From<ConfigError> for WorkcellError {
    fn from(err: ConfigError) -> Self {
        WorkcellError::Configuration(err.to_string())
    }
}
