//! Device operation runner.
//!
//! Each operation runs as its own tokio task that walks a fixed number of
//! progress ticks, writing the device's status table entry and the log sink as
//! it goes. Cancellation is cooperative: a flag checked at every tick
//! boundary, never mid-tick. All async sleeps use `tokio::time::sleep`.
//!
//! # Lifecycle
//!
//! ```text
//! start() --> [busy check + spawn, atomic under the job table lock]
//!               |
//!               v
//!         tick 0..=10: cancelled? --yes--> ("Stopped", 0) --+
//!               | no                                        |
//!               v                                           |
//!         ("Active", i*10), 50% log at tick 5, sleep        |
//!               |                                           |
//!               v                                           v
//!         ("Ready", 100) + success log ------------> release job, send JobCompletion
//! ```
//!
//! The job is released from the [`JobTable`] *before* the completion is sent,
//! so whoever reacts to the completion already sees the device as free.

use crate::error::{HubResult, WorkcellError};
use crate::log_capture::LogSink;
use crate::registry::DeviceRegistry;
use crate::status::{DeviceStatus, DeviceStatusTable};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Number of progress increments; an operation emits `TICK_COUNT + 1` ticks.
pub const TICK_COUNT: u32 = 10;

/// Identifier of one launched operation.
pub type JobId = u64;

/// How an operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every tick ran
    Completed,
    /// Cancellation was observed at a tick boundary
    Cancelled,
}

/// Terminal notification, sent exactly once per launched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    /// Job that ended
    pub job_id: JobId,
    /// Device the job ran on
    pub device: String,
    /// Operation description
    pub operation: String,
    /// How it ended
    pub outcome: JobOutcome,
}

/// Cancellable reference to a launched job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    device: String,
    operation: String,
    cancelled: Arc<AtomicBool>,
}

impl JobHandle {
    fn new(id: JobId, device: &str, operation: &str) -> Self {
        Self {
            id,
            device: device.to_string(),
            operation: operation.to_string(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Job identifier.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Device the job runs on.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Operation description.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Request cancellation; observed at the next tick boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct LiveJob {
    handle: JobHandle,
    task: JoinHandle<()>,
}

impl LiveJob {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Live jobs keyed by device. At most one entry per device.
///
/// Entries are added when a runner is spawned and removed by the runner
/// itself when it terminates, so the table is the authority on whether a
/// device is busy and how many operations are active.
#[derive(Clone)]
pub struct JobTable {
    jobs: Arc<Mutex<HashMap<String, LiveJob>>>,
    next_id: Arc<AtomicU64>,
    released: Arc<watch::Sender<u64>>,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    /// Create an empty table.
    pub fn new() -> Self {
        let (released, _) = watch::channel(0);
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            released: Arc::new(released),
        }
    }

    /// Number of jobs whose task is still running.
    pub async fn count_active(&self) -> usize {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|job| job.is_running())
            .count()
    }

    /// Whether `device` has a running job.
    pub async fn is_busy(&self, device: &str) -> bool {
        self.live_job(device).await.is_some()
    }

    /// Handle of the running job on `device`, if any.
    pub async fn live_job(&self, device: &str) -> Option<JobHandle> {
        self.jobs
            .lock()
            .await
            .get(device)
            .filter(|job| job.is_running())
            .map(|job| job.handle.clone())
    }

    /// Signal cancellation to every running job and return their ids.
    pub async fn cancel_all(&self) -> Vec<JobId> {
        let jobs = self.jobs.lock().await;
        jobs.values()
            .filter(|job| job.is_running())
            .map(|job| {
                job.handle.cancel();
                job.handle.id()
            })
            .collect()
    }

    /// Wait until none of `ids` is still held in the table.
    pub async fn wait_released(&self, ids: &[JobId]) {
        let mut changes = self.released.subscribe();
        loop {
            {
                let jobs = self.jobs.lock().await;
                let pending = jobs
                    .values()
                    .any(|job| ids.contains(&job.handle.id()) && job.is_running());
                if !pending {
                    return;
                }
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    fn next_id(&self) -> JobId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn release(&self, job_id: JobId, device: &str) {
        let mut jobs = self.jobs.lock().await;
        if jobs.get(device).is_some_and(|job| job.handle.id() == job_id) {
            jobs.remove(device);
        }
        drop(jobs);
        self.released.send_modify(|generation| *generation += 1);
    }
}

/// Launches simulated device operations.
#[derive(Clone)]
pub struct OperationRunner {
    registry: Arc<DeviceRegistry>,
    status: DeviceStatusTable,
    log: LogSink,
    jobs: JobTable,
    tick_interval: Duration,
    completions: mpsc::UnboundedSender<JobCompletion>,
}

impl OperationRunner {
    /// Create a runner. Every launched job reports its completion on
    /// `completions`.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        status: DeviceStatusTable,
        log: LogSink,
        jobs: JobTable,
        tick_interval: Duration,
        completions: mpsc::UnboundedSender<JobCompletion>,
    ) -> Self {
        Self {
            registry,
            status,
            log,
            jobs,
            tick_interval,
            completions,
        }
    }

    /// The job table this runner registers jobs in.
    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    /// Start `operation` on `device`.
    ///
    /// Fails with `UnknownDevice` for an unregistered device and with
    /// `DeviceBusy` when the device already has a running job. The busy check
    /// and the launch happen under the job table lock, so concurrent starts
    /// on one device yield exactly one acceptance.
    pub async fn start(&self, device: &str, operation: &str) -> HubResult<JobHandle> {
        self.registry.get(device)?;

        let mut jobs = self.jobs.jobs.lock().await;
        if jobs.get(device).is_some_and(LiveJob::is_running) {
            return Err(WorkcellError::DeviceBusy {
                device: device.to_string(),
            });
        }

        let handle = JobHandle::new(self.jobs.next_id(), device, operation);
        let task = tokio::spawn(run_job(
            handle.clone(),
            self.status.clone(),
            self.log.clone(),
            self.jobs.clone(),
            self.tick_interval,
            self.completions.clone(),
        ));
        jobs.insert(
            device.to_string(),
            LiveJob {
                handle: handle.clone(),
                task,
            },
        );
        debug!(job_id = handle.id(), device, operation, "Operation started");
        Ok(handle)
    }
}

async fn run_job(
    job: JobHandle,
    status: DeviceStatusTable,
    log: LogSink,
    jobs: JobTable,
    tick_interval: Duration,
    completions: mpsc::UnboundedSender<JobCompletion>,
) {
    let outcome = simulate(&job, &status, &log, tick_interval).await;
    debug!(job_id = job.id(), device = job.device(), ?outcome, "Operation finished");

    jobs.release(job.id(), job.device()).await;
    let completion = JobCompletion {
        job_id: job.id(),
        device: job.device,
        operation: job.operation,
        outcome,
    };
    if completions.send(completion).is_err() {
        debug!("Completion receiver dropped");
    }
}

async fn simulate(
    job: &JobHandle,
    status: &DeviceStatusTable,
    log: &LogSink,
    tick_interval: Duration,
) -> JobOutcome {
    let device = job.device();
    let operation = job.operation();

    for tick in 0..=TICK_COUNT {
        if job.is_cancelled() {
            report(status, device, DeviceStatus::Stopped, 0).await;
            return JobOutcome::Cancelled;
        }

        let progress = tick_progress(tick);
        if !report_unless_cancelled(job, status, DeviceStatus::Active, progress).await {
            return JobOutcome::Cancelled;
        }
        if tick == TICK_COUNT / 2 {
            log.info(format!("{device}: {operation} 50% complete"));
        }

        tokio::time::sleep(tick_interval).await;
    }

    // The boundary after the last sleep is a cancellation point too.
    if job.is_cancelled() {
        report(status, device, DeviceStatus::Stopped, 0).await;
        return JobOutcome::Cancelled;
    }

    if !report_unless_cancelled(job, status, DeviceStatus::Ready, 100).await {
        return JobOutcome::Cancelled;
    }
    log.success(format!("{device}: {operation} completed successfully"));
    JobOutcome::Completed
}

async fn report(status: &DeviceStatusTable, device: &str, label: DeviceStatus, progress: u8) {
    if let Err(e) = status.update(device, label, progress).await {
        warn!("Failed to update status for '{}': {}", device, e);
    }
}

/// Write a progress status unless the job was cancelled by the time the
/// table lock is taken. Returns false when the cancellation won.
async fn report_unless_cancelled(
    job: &JobHandle,
    status: &DeviceStatusTable,
    label: DeviceStatus,
    progress: u8,
) -> bool {
    match status
        .update_unless_cancelled(job.device(), label, progress, &job.cancelled)
        .await
    {
        Ok(written) => written.is_some(),
        Err(e) => {
            warn!("Failed to update status for '{}': {}", job.device(), e);
            true
        }
    }
}

/// Progress percentage at `tick`, rounded to the nearest integer.
fn tick_progress(tick: u32) -> u8 {
    ((tick * 100 + TICK_COUNT / 2) / TICK_COUNT).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkcellConfig;
    use crate::log_capture::LogLevel;
    use crate::status::StatusEvent;
    use futures::future::join_all;
    use tokio::sync::broadcast;

    struct Fixture {
        runner: OperationRunner,
        status: DeviceStatusTable,
        log: LogSink,
        completions: mpsc::UnboundedReceiver<JobCompletion>,
    }

    fn fixture(tick_ms: u64) -> Fixture {
        let registry = Arc::new(DeviceRegistry::new(&WorkcellConfig::default().devices));
        let status = DeviceStatusTable::new(&registry, 256);
        let log = LogSink::new(256, 256);
        let (tx, completions) = mpsc::unbounded_channel();
        let runner = OperationRunner::new(
            registry,
            status.clone(),
            log.clone(),
            JobTable::new(),
            Duration::from_millis(tick_ms),
            tx,
        );
        Fixture {
            runner,
            status,
            log,
            completions,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_tick_progress_values() {
        let values: Vec<u8> = (0..=TICK_COUNT).map(tick_progress).collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    }

    #[tokio::test]
    async fn test_completed_operation_progress_sequence() {
        let mut fx = fixture(2);
        let mut status_rx = fx.status.subscribe();

        let handle = fx
            .runner
            .start("Centrifuge", "Spinning at 2000 RPM")
            .await
            .unwrap();
        let completion = fx.completions.recv().await.unwrap();
        assert_eq!(completion.job_id, handle.id());
        assert_eq!(completion.outcome, JobOutcome::Completed);

        let events = drain(&mut status_rx);
        let active: Vec<u8> = events
            .iter()
            .filter(|e| e.status == DeviceStatus::Active)
            .map(|e| e.progress)
            .collect();
        assert_eq!(active, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
        assert_eq!(events.last().map(|e| &e.status), Some(&DeviceStatus::Ready));

        let logs = fx.log.buffer().read();
        let halfway: Vec<_> = logs
            .iter()
            .filter(|e| e.message == "Centrifuge: Spinning at 2000 RPM 50% complete")
            .collect();
        assert_eq!(halfway.len(), 1);
        assert_eq!(halfway[0].level, LogLevel::Info);
        assert!(logs.iter().any(|e| e.level == LogLevel::Success
            && e.message == "Centrifuge: Spinning at 2000 RPM completed successfully"));

        let state = fx.status.get("Centrifuge").await.unwrap();
        assert_eq!(state.status, DeviceStatus::Ready);
        assert_eq!(state.progress, 0);
        assert_eq!(fx.runner.jobs().count_active().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_operation_stops_without_success() {
        let mut fx = fixture(20);
        let mut status_rx = fx.status.subscribe();

        let handle = fx
            .runner
            .start("Plate Reader", "Reading plate")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let completion = fx.completions.recv().await.unwrap();
        assert_eq!(completion.outcome, JobOutcome::Cancelled);

        let events = drain(&mut status_rx);
        assert!(events.iter().all(|e| e.progress < 100));
        assert_eq!(
            events.last(),
            Some(&StatusEvent {
                device: "Plate Reader".to_string(),
                status: DeviceStatus::Stopped,
                progress: 0,
            })
        );
        assert!(fx
            .log
            .buffer()
            .read()
            .iter()
            .all(|e| e.level != LogLevel::Success));
    }

    #[tokio::test]
    async fn test_busy_device_rejected() {
        let fx = fixture(20);
        fx.runner.start("Incubator", "Incubating samples").await.unwrap();

        let err = fx
            .runner
            .start("Incubator", "Temperature verification")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WorkcellError::DeviceBusy {
                device: "Incubator".to_string()
            }
        );
        assert_eq!(fx.runner.jobs().count_active().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let fx = fixture(2);
        let err = fx.runner.start("Autoclave", "Sterilising").await.unwrap_err();
        assert_eq!(err, WorkcellError::UnknownDevice("Autoclave".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_accept_exactly_one() {
        let fx = fixture(5);
        for _ in 0..10 {
            let attempts = (0..16).map(|_| {
                let runner = fx.runner.clone();
                tokio::spawn(async move { runner.start("Liquid Handler", "Dispensing").await })
            });
            let results: Vec<_> = join_all(attempts)
                .await
                .into_iter()
                .map(|joined| joined.unwrap())
                .collect();

            let accepted = results.iter().filter(|r| r.is_ok()).count();
            let busy = results
                .iter()
                .filter(|r| matches!(r, Err(WorkcellError::DeviceBusy { .. })))
                .count();
            assert_eq!(accepted, 1);
            assert_eq!(busy, 15);

            let live = fx.runner.jobs().live_job("Liquid Handler").await.unwrap();
            live.cancel();
            fx.runner.jobs().wait_released(&[live.id()]).await;
        }
    }

    #[tokio::test]
    async fn test_device_free_again_after_completion() {
        let mut fx = fixture(1);
        fx.runner.start("Storage Unit", "Retrieving").await.unwrap();
        fx.completions.recv().await.unwrap();
        assert!(!fx.runner.jobs().is_busy("Storage Unit").await);
        assert!(fx.runner.start("Storage Unit", "Storing").await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_all_and_wait_released() {
        let mut fx = fixture(20);
        fx.runner.start("Centrifuge", "Spin").await.unwrap();
        fx.runner.start("Plate Reader", "Read").await.unwrap();
        fx.runner.start("Incubator", "Warm").await.unwrap();
        assert_eq!(fx.runner.jobs().count_active().await, 3);

        let cancelled = fx.runner.jobs().cancel_all().await;
        assert_eq!(cancelled.len(), 3);
        fx.runner.jobs().wait_released(&cancelled).await;
        assert_eq!(fx.runner.jobs().count_active().await, 0);

        for _ in 0..3 {
            let completion = fx.completions.recv().await.unwrap();
            assert_eq!(completion.outcome, JobOutcome::Cancelled);
        }
    }
}
