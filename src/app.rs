//! Public handle onto a running workcell.
//!
//! [`WorkcellHub`] is what a presentation shell holds. It spawns the
//! [`WorkcellActor`] and the shared tables, forwards commands through the
//! actor mailbox and hands out subscriptions to the status, log, sample,
//! progress and notice feeds.
//!
//! # Example
//!
//! ```rust,ignore
//! let hub = WorkcellHub::spawn(WorkcellConfig::default())?;
//! let mut logs = hub.subscribe_logs();
//!
//! hub.start_protocol("Plate-Based Assay Workflow", 24).await?;
//! while let Ok(event) = logs.recv().await {
//!     println!("{event}");
//! }
//! ```

use crate::{
    app_actor::{ActorChannels, WorkcellActor},
    config::WorkcellConfig,
    error::{HubResult, WorkcellError},
    log_capture::{LogEvent, LogSink},
    messages::{AbortOutcome, HubCommand, SystemNotice},
    registry::DeviceRegistry,
    runner::{JobHandle, JobTable, OperationRunner},
    samples::{SampleEntry, SampleLedger, SamplePicker, UniformPicker},
    sequencer::{ProtocolProgress, ProtocolSequencer, RunId},
    status::{DeviceState, DeviceStatusTable, StatusEvent},
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::warn;

/// Aggregate counters for the statistics panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemStats {
    /// Number of registered devices
    pub total_devices: usize,
    /// Number of live jobs
    pub active_operations: usize,
    /// Time since the hub was spawned
    pub uptime: Duration,
}

/// Handle for issuing commands to a running workcell and observing it.
pub struct WorkcellHub {
    command_tx: mpsc::Sender<HubCommand>,
    actor_task: JoinHandle<()>,
    config: Arc<WorkcellConfig>,
    registry: Arc<DeviceRegistry>,
    status: DeviceStatusTable,
    log: LogSink,
    jobs: JobTable,
    samples: broadcast::Sender<SampleEntry>,
    progress: watch::Receiver<ProtocolProgress>,
    notices: watch::Receiver<SystemNotice>,
    started_at: Instant,
}

impl WorkcellHub {
    /// Validate `config` and spawn the workcell on the current tokio runtime,
    /// drawing sample types and locations uniformly at random.
    pub fn spawn(config: WorkcellConfig) -> HubResult<Self> {
        Self::spawn_with_picker(config, Box::new(UniformPicker::new()))
    }

    /// Like [`spawn`](Self::spawn) with a custom sample drawing policy.
    pub fn spawn_with_picker(
        config: WorkcellConfig,
        picker: Box<dyn SamplePicker>,
    ) -> HubResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let feed_capacity = config.channels.feed_capacity;

        let registry = Arc::new(DeviceRegistry::new(&config.devices));
        let status = DeviceStatusTable::new(&registry, feed_capacity);
        let log = LogSink::new(config.channels.log_capacity, feed_capacity);
        let jobs = JobTable::new();

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (step_timer_tx, step_timer_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(config.channels.command_capacity);
        let (notice_tx, notices) = watch::channel(SystemNotice::persistent("System Ready"));

        let runner = OperationRunner::new(
            registry.clone(),
            status.clone(),
            log.clone(),
            jobs.clone(),
            config.timing.tick_interval,
            completion_tx,
        );
        let sequencer = ProtocolSequencer::new(config.protocol.steps.clone(), &config.samples);
        let progress = sequencer.subscribe();
        let ledger = SampleLedger::new(
            config.samples.types.clone(),
            config.samples.locations.clone(),
            picker,
            feed_capacity,
        );
        let samples = ledger.feed();

        let actor = WorkcellActor::new(
            config.clone(),
            registry.clone(),
            status.clone(),
            log.clone(),
            runner,
            sequencer,
            ledger,
            notice_tx,
            step_timer_tx,
        );
        let actor_task = tokio::spawn(actor.run(ActorChannels {
            commands: command_rx,
            completions: completion_rx,
            step_timers: step_timer_rx,
        }));

        log.success("Workcell Control Hub initialized");
        log.info("All devices connected and ready");

        Ok(Self {
            command_tx,
            actor_task,
            config,
            registry,
            status,
            log,
            jobs,
            samples,
            progress,
            notices,
            started_at: Instant::now(),
        })
    }

    async fn request<T>(
        &self,
        command: HubCommand,
        response: oneshot::Receiver<T>,
    ) -> HubResult<T> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| WorkcellError::HubUnavailable)?;
        response.await.map_err(|_| WorkcellError::HubUnavailable)
    }

    // =========================================================================
    // Command intake
    // =========================================================================

    /// Run `device`'s test operation.
    pub async fn start_test(&self, device: &str) -> HubResult<JobHandle> {
        let (command, rx) = HubCommand::start_test(device.to_string());
        self.request(command, rx).await?
    }

    /// Start a protocol run with `sample_count` samples.
    pub async fn start_protocol(&self, protocol: &str, sample_count: u32) -> HubResult<RunId> {
        let (command, rx) = HubCommand::start_protocol(protocol.to_string(), sample_count);
        self.request(command, rx).await?
    }

    /// Pause the running protocol. Returns whether a run was paused.
    pub async fn pause_protocol(&self) -> HubResult<bool> {
        let (command, rx) = HubCommand::pause_protocol();
        self.request(command, rx).await
    }

    /// Halt every operation. `confirmed` is the operator's explicit answer
    /// to the confirmation prompt; without it nothing happens.
    pub async fn emergency_abort(&self, confirmed: bool) -> HubResult<AbortOutcome> {
        let (command, rx) = HubCommand::emergency_abort(confirmed);
        self.request(command, rx).await
    }

    /// Register one sample manually.
    pub async fn add_sample(&self) -> HubResult<SampleEntry> {
        let (command, rx) = HubCommand::add_sample();
        self.request(command, rx).await
    }

    /// All samples in insertion order.
    pub async fn samples(&self) -> HubResult<Vec<SampleEntry>> {
        let (command, rx) = HubCommand::get_samples();
        self.request(command, rx).await
    }

    /// Cancel all operations and stop the control task.
    pub async fn shutdown(self) -> HubResult<()> {
        let (command, rx) = HubCommand::shutdown();
        self.request(command, rx).await?;
        if let Err(e) = self.actor_task.await {
            warn!("Workcell actor task failed during shutdown: {}", e);
        }
        Ok(())
    }

    // =========================================================================
    // Queries and feeds
    // =========================================================================

    /// Configuration the hub runs with.
    pub fn config(&self) -> &WorkcellConfig {
        &self.config
    }

    /// The device registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Protocol names offered to the operator.
    pub fn protocols(&self) -> &[String] {
        &self.config.protocol.catalog
    }

    /// Current state of every device.
    pub async fn device_states(&self) -> HashMap<String, DeviceState> {
        self.status.snapshot().await
    }

    /// Current state of one device.
    pub async fn device_state(&self, device: &str) -> HubResult<DeviceState> {
        self.status
            .get(device)
            .await
            .ok_or_else(|| WorkcellError::UnknownDevice(device.to_string()))
    }

    /// Number of live jobs.
    pub async fn count_active(&self) -> usize {
        self.jobs.count_active().await
    }

    /// Aggregate counters.
    pub async fn stats(&self) -> SystemStats {
        SystemStats {
            total_devices: self.registry.len(),
            active_operations: self.count_active().await,
            uptime: self.started_at.elapsed(),
        }
    }

    /// Latest protocol progress snapshot.
    pub fn progress(&self) -> ProtocolProgress {
        self.progress.borrow().clone()
    }

    /// Buffered log events, oldest first.
    pub fn logs(&self) -> Vec<LogEvent> {
        self.log.buffer().read()
    }

    /// Subscribe to the status feed.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// Subscribe to the log feed.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        self.log.subscribe()
    }

    /// Subscribe to the sample feed.
    pub fn subscribe_samples(&self) -> broadcast::Receiver<SampleEntry> {
        self.samples.subscribe()
    }

    /// Watch protocol progress.
    pub fn watch_progress(&self) -> watch::Receiver<ProtocolProgress> {
        self.progress.clone()
    }

    /// Watch system notices.
    pub fn watch_notices(&self) -> watch::Receiver<SystemNotice> {
        self.notices.clone()
    }
}
