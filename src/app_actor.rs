//! Actor-based workcell control
//!
//! All sequencing decisions happen in a single async task that processes
//! commands from the presentation shell, job completions from runners and
//! step timers it scheduled itself. The actor never waits on a runner inline:
//! it launches jobs and reacts to their completion events, so the protocol
//! state is only ever touched from this one task.

use crate::{
    config::{AbortPolicy, WorkcellConfig},
    error::{HubResult, WorkcellError},
    log_capture::LogSink,
    messages::{AbortOutcome, HubCommand, SystemNotice},
    registry::DeviceRegistry,
    runner::{JobCompletion, JobHandle, JobTable, OperationRunner},
    samples::SampleLedger,
    sequencer::{ProtocolSequencer, RunId, StepAdvance},
    status::DeviceStatusTable,
};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

/// Notice published when an emergency abort completes.
pub const EMERGENCY_STOP_NOTICE: &str = "EMERGENCY STOP - All operations halted";

/// Actor that owns the protocol sequencer and the sample ledger
pub struct WorkcellActor {
    config: Arc<WorkcellConfig>,
    registry: Arc<DeviceRegistry>,
    status: DeviceStatusTable,
    log: LogSink,
    jobs: JobTable,
    runner: OperationRunner,
    sequencer: ProtocolSequencer,
    ledger: SampleLedger,
    notices: watch::Sender<SystemNotice>,
    step_timer_tx: mpsc::UnboundedSender<RunId>,
    shutdown_flag: bool,
}

/// Receivers the actor loop selects over.
pub struct ActorChannels {
    /// Commands from the shell
    pub commands: mpsc::Receiver<HubCommand>,
    /// Completions from runners
    pub completions: mpsc::UnboundedReceiver<JobCompletion>,
    /// Step-due timers scheduled by the actor
    pub step_timers: mpsc::UnboundedReceiver<RunId>,
}

impl WorkcellActor {
    /// Creates a new WorkcellActor
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<WorkcellConfig>,
        registry: Arc<DeviceRegistry>,
        status: DeviceStatusTable,
        log: LogSink,
        runner: OperationRunner,
        sequencer: ProtocolSequencer,
        ledger: SampleLedger,
        notices: watch::Sender<SystemNotice>,
        step_timer_tx: mpsc::UnboundedSender<RunId>,
    ) -> Self {
        let jobs = runner.jobs().clone();
        Self {
            config,
            registry,
            status,
            log,
            jobs,
            runner,
            sequencer,
            ledger,
            notices,
            step_timer_tx,
            shutdown_flag: false,
        }
    }

    /// Runs the actor event loop until shutdown or until every command
    /// sender is dropped.
    pub async fn run(mut self, mut channels: ActorChannels) {
        info!("WorkcellActor started");

        loop {
            tokio::select! {
                command = channels.commands.recv() => {
                    let Some(command) = command else {
                        info!("All command senders dropped");
                        self.shutdown().await;
                        break;
                    };
                    if let ControlFlow::Break(response) = self.handle_command(command).await {
                        info!("Shutdown command received");
                        self.shutdown().await;
                        let _ = response.send(());
                        break;
                    }
                }
                Some(completion) = channels.completions.recv() => {
                    self.handle_completion(completion).await;
                }
                Some(run_id) = channels.step_timers.recv() => {
                    self.handle_step_due(run_id).await;
                }
            }
        }

        info!("WorkcellActor shutting down");
    }

    /// Handle one command. A shutdown request is handed back with its
    /// responder, since it ends the loop.
    async fn handle_command(&mut self, command: HubCommand) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            HubCommand::StartTest { device, response } => {
                let result = self.start_test(&device).await;
                let _ = response.send(result);
            }

            HubCommand::StartProtocol {
                protocol,
                sample_count,
                response,
            } => {
                let result = self.start_protocol(&protocol, sample_count).await;
                let _ = response.send(result);
            }

            HubCommand::PauseProtocol { response } => {
                let paused = self.sequencer.pause();
                if paused {
                    self.log.warning("Protocol paused by user");
                }
                let _ = response.send(paused);
            }

            HubCommand::EmergencyAbort {
                confirmed,
                response,
            } => {
                let outcome = self.emergency_abort(confirmed).await;
                let _ = response.send(outcome);
            }

            HubCommand::AddSample { response } => {
                let entry = self.ledger.create_random();
                debug!(id = %entry.id, "Sample added manually");
                let _ = response.send(entry);
            }

            HubCommand::GetSamples { response } => {
                let _ = response.send(self.ledger.entries().to_vec());
            }

            HubCommand::Shutdown { response } => return ControlFlow::Break(response),
        }
        ControlFlow::Continue(())
    }

    /// Run a device's configured test operation.
    async fn start_test(&mut self, device: &str) -> HubResult<JobHandle> {
        let operation = match self.registry.get(device) {
            Ok(definition) => definition.test_operation.clone(),
            Err(e) => {
                self.log.warning(e.to_string());
                return Err(e);
            }
        };

        if self.jobs.is_busy(device).await {
            let err = WorkcellError::DeviceBusy {
                device: device.to_string(),
            };
            self.log.warning(err.to_string());
            return Err(err);
        }

        self.log.device(format!("Starting {device}: {operation}"));
        self.runner.start(device, &operation).await.inspect_err(|e| {
            self.log.warning(e.to_string());
        })
    }

    async fn start_protocol(&mut self, protocol: &str, sample_count: u32) -> HubResult<RunId> {
        let run_id = match self.sequencer.start(protocol, sample_count) {
            Ok(run_id) => run_id,
            Err(e) => {
                self.log.warning(e.to_string());
                return Err(e);
            }
        };

        self.log.success(format!("Starting protocol: {protocol}"));
        self.log.info(format!("Processing {sample_count} samples"));
        self.execute_step().await;
        Ok(run_id)
    }

    /// Launch the sequencer's pending step, or attach to the job already
    /// holding its device.
    async fn execute_step(&mut self) {
        let Some((run_id, index, step)) = self.sequencer.pending_step() else {
            return;
        };
        let step = step.clone();
        let total = self.sequencer.steps().len();
        debug!(run_id, step = index + 1, total, device = %step.device, "Executing protocol step");

        if let Some(live) = self.jobs.live_job(&step.device).await {
            self.log.info(format!(
                "{} is busy, step {}/{} waits for its current operation",
                step.device,
                index + 1,
                total
            ));
            self.sequencer.step_started(run_id, live.id());
            return;
        }

        match self.runner.start(&step.device, &step.operation).await {
            Ok(handle) => {
                self.sequencer.step_started(run_id, handle.id());
            }
            Err(e) => {
                error!("Protocol step {} failed to start: {}", index + 1, e);
                self.log
                    .error(format!("Protocol step {} failed to start: {e}", index + 1));
                if self.sequencer.pause() {
                    self.log.warning("Protocol paused after step failure");
                }
            }
        }
    }

    async fn handle_completion(&mut self, completion: JobCompletion) {
        debug!(
            job_id = completion.job_id,
            device = %completion.device,
            outcome = ?completion.outcome,
            "Job completed"
        );

        match self.sequencer.job_finished(completion.job_id) {
            StepAdvance::Ignored => {}
            StepAdvance::ScheduleNext { run_id } => {
                let delay = self.config.timing.inter_step_delay;
                let tx = self.step_timer_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(run_id);
                });
            }
            StepAdvance::Completed {
                run_id,
                sample_count,
            } => {
                self.log.success("Protocol execution completed");
                for _ in 0..sample_count {
                    self.ledger.create_random();
                }
                info!(run_id, sample_count, "Protocol run completed");
            }
        }
    }

    async fn handle_step_due(&mut self, run_id: RunId) {
        if self.sequencer.step_due(run_id) {
            self.execute_step().await;
        } else {
            debug!(run_id, "Stale step timer ignored");
        }
    }

    async fn emergency_abort(&mut self, confirmed: bool) -> AbortOutcome {
        if !confirmed {
            self.log.info("Emergency stop cancelled");
            return AbortOutcome::Declined;
        }

        self.log.error("EMERGENCY STOP ACTIVATED");
        self.sequencer.abort();

        let cancelled = self.jobs.cancel_all().await;
        let acknowledged = match self.config.timing.abort_policy {
            AbortPolicy::AwaitAcknowledgement => {
                self.jobs.wait_released(&cancelled).await;
                true
            }
            AbortPolicy::BestEffort => cancelled.is_empty(),
        };

        self.status.stop_all().await;
        self.notices.send_replace(SystemNotice::transient(
            EMERGENCY_STOP_NOTICE,
            self.config.timing.notice_duration,
        ));
        info!(
            cancelled = cancelled.len(),
            acknowledged, "Emergency abort complete"
        );

        AbortOutcome::Aborted {
            cancelled_jobs: cancelled.len(),
            acknowledged,
        }
    }

    /// Cancel every live job and wait for them to wind down.
    async fn shutdown(&mut self) {
        if self.shutdown_flag {
            return;
        }
        info!("Shutting down workcell...");
        self.shutdown_flag = true;

        if self.sequencer.pause() {
            self.log.warning("Protocol paused by shutdown");
        }
        let cancelled = self.jobs.cancel_all().await;
        self.jobs.wait_released(&cancelled).await;

        info!("Workcell shutdown complete");
    }
}
