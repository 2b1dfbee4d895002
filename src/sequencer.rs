//! Protocol sequencer state machine.
//!
//! Walks an ordered script of `(device, operation)` steps, one runner per step,
//! advancing only when the job that owns the current step reports completion.
//! The sequencer never launches anything itself and never blocks: the control
//! task asks it what to run next, tells it what was launched, and forwards
//! completion and step-timer events to it.
//!
//! # State Machine
//!
//! ```text
//!            start()                     last step completes
//!   Idle ──────────────▶ Running ───────────────────────────▶ Completed
//!    ▲                   │     │
//!    │ start()           │     │ pause()          abort() from any state
//!    └── Completed/      │     └────────▶ Paused       ───────────────▶ Aborted
//!        Paused/Aborted ◀┘
//! ```
//!
//! Every run has its own id. Completion and step-due events are ignored unless
//! the sequencer is `Running`, the run id matches the current run, and the job
//! id matches the job the current step is waiting on. A paused or aborted run
//! therefore never advances, whatever arrives late.

use crate::config::{ProtocolStep, SampleConfig};
use crate::error::{HubResult, WorkcellError};
use crate::runner::JobId;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Identifier of one protocol run.
pub type RunId = u64;

/// Sequencer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequencerState {
    /// No run has started yet
    Idle,
    /// A run is advancing through its steps
    Running,
    /// The run was paused; it will not advance again
    Paused,
    /// Every step completed
    Completed,
    /// Emergency abort
    Aborted,
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SequencerState::Idle => "Idle",
            SequencerState::Running => "Running",
            SequencerState::Paused => "Paused",
            SequencerState::Completed => "Completed",
            SequencerState::Aborted => "Aborted",
        };
        f.write_str(label)
    }
}

/// One execution of the protocol script.
#[derive(Debug, Clone)]
pub struct ProtocolRun {
    /// Run identifier
    pub id: RunId,
    /// Protocol name chosen by the operator
    pub protocol: String,
    /// Number of samples to register on completion
    pub sample_count: u32,
    /// Index of the step currently executing (or next to execute)
    pub step_index: usize,
    /// Job the current step waits on
    pub awaiting: Option<JobId>,
}

/// Snapshot published to the presentation shell on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolProgress {
    /// Protocol name of the current or last run
    pub protocol: Option<String>,
    /// Sequencer state
    pub state: SequencerState,
    /// Index of the current step
    pub step_index: usize,
    /// Number of steps in the script
    pub total_steps: usize,
    /// Human-readable step label
    pub current_step: String,
    /// Overall progress 0-100
    pub percent: u8,
}

impl ProtocolProgress {
    fn idle(total_steps: usize) -> Self {
        Self {
            protocol: None,
            state: SequencerState::Idle,
            step_index: 0,
            total_steps,
            current_step: "Ready to start protocol".to_string(),
            percent: 0,
        }
    }

    /// Whether a new protocol may be started.
    pub fn can_start(&self) -> bool {
        self.state != SequencerState::Running
    }

    /// Whether the running protocol may be paused.
    pub fn can_pause(&self) -> bool {
        self.state == SequencerState::Running
    }
}

/// What the control task should do after a job finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAdvance {
    /// The event does not concern the running step
    Ignored,
    /// Schedule the next step of `run_id` after the inter-step delay
    ScheduleNext {
        /// Run to advance
        run_id: RunId,
    },
    /// The run finished its last step
    Completed {
        /// Run that completed
        run_id: RunId,
        /// Samples to register
        sample_count: u32,
    },
}

/// Finite-state machine driving a protocol script.
pub struct ProtocolSequencer {
    steps: Vec<ProtocolStep>,
    min_samples: u32,
    max_samples: u32,
    state: SequencerState,
    run: Option<ProtocolRun>,
    next_run_id: RunId,
    progress: watch::Sender<ProtocolProgress>,
}

impl ProtocolSequencer {
    /// Create an idle sequencer for `steps`, accepting sample counts within
    /// the configured bounds.
    pub fn new(steps: Vec<ProtocolStep>, samples: &SampleConfig) -> Self {
        let (progress, _) = watch::channel(ProtocolProgress::idle(steps.len()));
        Self {
            steps,
            min_samples: samples.min_count,
            max_samples: samples.max_count,
            state: SequencerState::Idle,
            run: None,
            next_run_id: 1,
            progress,
        }
    }

    /// Current state.
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Current or last run.
    pub fn run(&self) -> Option<&ProtocolRun> {
        self.run.as_ref()
    }

    /// The protocol script.
    pub fn steps(&self) -> &[ProtocolStep] {
        &self.steps
    }

    /// Subscribe to progress snapshots.
    pub fn subscribe(&self) -> watch::Receiver<ProtocolProgress> {
        self.progress.subscribe()
    }

    /// Begin a fresh run at step 0.
    ///
    /// Fails with `AlreadyRunning` while a run is active and with
    /// `InvalidSampleCount` outside the configured bounds.
    pub fn start(&mut self, protocol: &str, sample_count: u32) -> HubResult<RunId> {
        if self.state == SequencerState::Running {
            return Err(WorkcellError::AlreadyRunning);
        }
        if sample_count < self.min_samples || sample_count > self.max_samples {
            return Err(WorkcellError::InvalidSampleCount {
                count: sample_count,
                min: self.min_samples,
                max: self.max_samples,
            });
        }

        let id = self.next_run_id;
        self.next_run_id += 1;
        self.run = Some(ProtocolRun {
            id,
            protocol: protocol.to_string(),
            sample_count,
            step_index: 0,
            awaiting: None,
        });
        self.state = SequencerState::Running;
        self.publish();
        Ok(id)
    }

    /// The step that should be launched now, if any.
    ///
    /// Returns `None` unless running with no job outstanding.
    pub fn pending_step(&self) -> Option<(RunId, usize, &ProtocolStep)> {
        if self.state != SequencerState::Running {
            return None;
        }
        let run = self.run.as_ref()?;
        if run.awaiting.is_some() {
            return None;
        }
        self.steps
            .get(run.step_index)
            .map(|step| (run.id, run.step_index, step))
    }

    /// Record that `job_id` now carries the current step of `run_id`.
    pub fn step_started(&mut self, run_id: RunId, job_id: JobId) -> bool {
        if self.state != SequencerState::Running {
            return false;
        }
        match self.run.as_mut() {
            Some(run) if run.id == run_id && run.awaiting.is_none() => {
                run.awaiting = Some(job_id);
                true
            }
            _ => false,
        }
    }

    /// React to a job finishing.
    ///
    /// Advances only if running and `job_id` is the job the current step waits on.
    pub fn job_finished(&mut self, job_id: JobId) -> StepAdvance {
        if self.state != SequencerState::Running {
            return StepAdvance::Ignored;
        }
        let total = self.steps.len();
        let Some(run) = self.run.as_mut() else {
            return StepAdvance::Ignored;
        };
        if run.awaiting != Some(job_id) {
            return StepAdvance::Ignored;
        }

        run.awaiting = None;
        run.step_index += 1;
        let advance = if run.step_index >= total {
            StepAdvance::Completed {
                run_id: run.id,
                sample_count: run.sample_count,
            }
        } else {
            StepAdvance::ScheduleNext { run_id: run.id }
        };

        if matches!(advance, StepAdvance::Completed { .. }) {
            self.state = SequencerState::Completed;
        }
        self.publish();
        advance
    }

    /// Whether a step-due timer for `run_id` should launch the next step.
    pub fn step_due(&self, run_id: RunId) -> bool {
        self.pending_step()
            .is_some_and(|(current, _, _)| current == run_id)
    }

    /// Stop advancing. In-flight jobs keep running; their completion no
    /// longer triggers further steps. Returns whether a run was paused.
    pub fn pause(&mut self) -> bool {
        if self.state != SequencerState::Running {
            return false;
        }
        self.state = SequencerState::Paused;
        self.publish();
        true
    }

    /// Enter `Aborted` from any state.
    pub fn abort(&mut self) {
        self.state = SequencerState::Aborted;
        self.publish();
    }

    fn publish(&self) {
        self.progress.send_replace(self.snapshot());
    }

    /// Build the progress snapshot for the current state.
    pub fn snapshot(&self) -> ProtocolProgress {
        let total = self.steps.len();
        let Some(run) = self.run.as_ref() else {
            let mut idle = ProtocolProgress::idle(total);
            idle.state = self.state;
            return idle;
        };

        let step_number = (run.step_index + 1).min(total);
        let (current_step, percent) = match self.state {
            SequencerState::Idle => ("Ready to start protocol".to_string(), 0),
            SequencerState::Running => {
                let operation = self
                    .steps
                    .get(run.step_index)
                    .map(|s| s.operation.as_str())
                    .unwrap_or_default();
                (
                    format!("Step {step_number}/{total}: {operation}"),
                    percent_of(run.step_index, total),
                )
            }
            SequencerState::Paused => (
                format!("Protocol paused at step {step_number}/{total}"),
                percent_of(run.step_index, total),
            ),
            SequencerState::Completed => ("Protocol completed successfully!".to_string(), 100),
            SequencerState::Aborted => (
                "Protocol aborted".to_string(),
                percent_of(run.step_index, total),
            ),
        };

        ProtocolProgress {
            protocol: Some(run.protocol.clone()),
            state: self.state,
            step_index: run.step_index,
            total_steps: total,
            current_step,
            percent,
        }
    }
}

fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done * 100 + total / 2) / total).min(100) as u8
}
