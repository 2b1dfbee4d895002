//! Message types for actor-based communication
//!
//! This module defines the commands the presentation shell sends to the
//! [`WorkcellActor`](crate::app_actor::WorkcellActor). Each command carries a
//! oneshot sender for its acknowledgement. The acknowledgement reports whether
//! the command was accepted; the outcome of the work it starts surfaces on the
//! status, log and sample feeds.

use crate::error::HubResult;
use crate::runner::JobHandle;
use crate::samples::SampleEntry;
use crate::sequencer::RunId;
use std::time::Duration;
use tokio::sync::oneshot;

/// Transient status-bar message for the presentation shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemNotice {
    /// Message text
    pub message: String,
    /// How long to show it; `None` means until replaced
    pub duration: Option<Duration>,
}

impl SystemNotice {
    /// Notice shown until replaced.
    pub fn persistent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            duration: None,
        }
    }

    /// Notice shown for `duration`.
    pub fn transient(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            message: message.into(),
            duration: Some(duration),
        }
    }
}

/// Result of an emergency abort request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The operator declined the confirmation; nothing changed
    Declined,
    /// All operations were halted
    Aborted {
        /// Number of live jobs that were signalled
        cancelled_jobs: usize,
        /// Whether every cancelled job had terminated before the report
        acknowledged: bool,
    },
}

/// Commands that can be sent to the WorkcellActor
#[derive(Debug)]
pub enum HubCommand {
    /// Run a device's test operation
    StartTest {
        device: String,
        response: oneshot::Sender<HubResult<JobHandle>>,
    },

    /// Start a protocol run
    StartProtocol {
        protocol: String,
        sample_count: u32,
        response: oneshot::Sender<HubResult<RunId>>,
    },

    /// Pause the running protocol
    PauseProtocol { response: oneshot::Sender<bool> },

    /// Halt everything, if confirmed
    EmergencyAbort {
        confirmed: bool,
        response: oneshot::Sender<AbortOutcome>,
    },

    /// Register one sample manually
    AddSample {
        response: oneshot::Sender<SampleEntry>,
    },

    /// Get all samples in insertion order
    GetSamples {
        response: oneshot::Sender<Vec<SampleEntry>>,
    },

    /// Stop all operations and the actor
    Shutdown { response: oneshot::Sender<()> },
}

impl HubCommand {
    /// Helper to create a StartTest command
    pub fn start_test(device: String) -> (Self, oneshot::Receiver<HubResult<JobHandle>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::StartTest {
                device,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a StartProtocol command
    pub fn start_protocol(
        protocol: String,
        sample_count: u32,
    ) -> (Self, oneshot::Receiver<HubResult<RunId>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::StartProtocol {
                protocol,
                sample_count,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a PauseProtocol command
    pub fn pause_protocol() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self::PauseProtocol { response: tx }, rx)
    }

    /// Helper to create an EmergencyAbort command
    pub fn emergency_abort(confirmed: bool) -> (Self, oneshot::Receiver<AbortOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::EmergencyAbort {
                confirmed,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create an AddSample command
    pub fn add_sample() -> (Self, oneshot::Receiver<SampleEntry>) {
        let (tx, rx) = oneshot::channel();
        (Self::AddSample { response: tx }, rx)
    }

    /// Helper to create a GetSamples command
    pub fn get_samples() -> (Self, oneshot::Receiver<Vec<SampleEntry>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetSamples { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
