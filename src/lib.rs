//! Core library for the workcell control hub.
//!
//! A simulated laboratory workcell: six named devices, each of which runs
//! timed, cancellable operations, and a sequencer that walks a fixed
//! protocol across them. State changes are published on feeds that a
//! presentation shell subscribes to.
//!
//! # Layout
//!
//! - [`registry`]: the fixed device set and each device's initial state
//! - [`status`]: the shared device status table and its change feed
//! - [`runner`]: cancellable timed jobs, one per device at a time
//! - [`sequencer`]: the protocol state machine
//! - [`samples`]: the append-only sample ledger
//! - [`log_capture`]: operator-facing log events
//! - [`app_actor`] and [`app`]: the control task and its public handle

pub mod app;
pub mod app_actor;
pub mod config;
pub mod error;
pub mod log_capture;
pub mod messages;
pub mod registry;
pub mod runner;
pub mod samples;
pub mod sequencer;
pub mod status;

pub use app::{SystemStats, WorkcellHub};
pub use config::{AbortPolicy, WorkcellConfig, DEFAULT_CONFIG_PATH};
pub use error::{HubResult, WorkcellError};
pub use log_capture::{LogEvent, LogLevel, LogSink};
pub use messages::{AbortOutcome, SystemNotice};
pub use runner::{JobHandle, JobOutcome};
pub use samples::{RoundRobinPicker, SampleEntry, SamplePicker, UniformPicker};
pub use sequencer::{ProtocolProgress, SequencerState};
pub use status::{DeviceState, DeviceStatus, StatusEvent};
