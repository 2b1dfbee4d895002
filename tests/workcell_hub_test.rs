//! End-to-end tests for the workcell hub: protocol runs, device tests,
//! pause, emergency abort and the sample ledger.

use futures::future::join_all;
use std::time::Duration;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};
use workcell_hub::{
    AbortOutcome, AbortPolicy, DeviceStatus, LogLevel, ProtocolProgress, SequencerState,
    WorkcellConfig, WorkcellError, WorkcellHub,
};

const PROTOCOL: &str = "Plate-Based Assay Workflow";
const WAIT: Duration = Duration::from_secs(10);

/// Default configuration with the simulation sped up.
fn fast_config(tick_ms: u64, policy: AbortPolicy) -> WorkcellConfig {
    let mut config = WorkcellConfig::default();
    config.timing.tick_interval = Duration::from_millis(tick_ms);
    config.timing.inter_step_delay = Duration::from_millis(10);
    config.timing.notice_duration = Duration::from_millis(50);
    config.timing.abort_policy = policy;
    config
}

async fn wait_for_state(hub: &WorkcellHub, state: SequencerState) -> ProtocolProgress {
    let mut rx = hub.watch_progress();
    timeout(WAIT, async move {
        rx.wait_for(|p| p.state == state).await.map(|p| p.clone())
    })
    .await
    .expect("timed out waiting for protocol state")
    .expect("progress channel closed")
}

async fn wait_until_idle(hub: &WorkcellHub) {
    timeout(WAIT, async {
        while hub.count_active().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for jobs to finish");
}

fn logged(hub: &WorkcellHub, level: LogLevel, message: &str) -> bool {
    hub.logs()
        .iter()
        .any(|e| e.level == level && e.message == message)
}

#[tokio::test]
async fn test_startup_state() {
    let hub = WorkcellHub::spawn(fast_config(5, AbortPolicy::BestEffort)).unwrap();

    let logs = hub.logs();
    assert_eq!(logs[0].level, LogLevel::Success);
    assert_eq!(logs[0].message, "Workcell Control Hub initialized");
    assert_eq!(logs[1].level, LogLevel::Info);
    assert_eq!(logs[1].message, "All devices connected and ready");

    let notice = hub.watch_notices().borrow().clone();
    assert_eq!(notice.message, "System Ready");
    assert_eq!(notice.duration, None);

    let robot = hub.device_state("Transport Robot").await.unwrap();
    assert_eq!(robot.status, DeviceStatus::Idle);
    let incubator = hub.device_state("Incubator").await.unwrap();
    assert_eq!(incubator.status.as_str(), "Maintaining 37°C");
    assert_eq!(incubator.progress, 0);

    let progress = hub.progress();
    assert_eq!(progress.state, SequencerState::Idle);
    assert_eq!(progress.current_step, "Ready to start protocol");
    assert!(progress.can_start());
    assert!(!progress.can_pause());

    let stats = hub.stats().await;
    assert_eq!(stats.total_devices, 6);
    assert_eq!(stats.active_operations, 0);
    assert_eq!(hub.protocols().len(), 6);

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_protocol_completes_and_registers_samples() {
    let hub = WorkcellHub::spawn(fast_config(2, AbortPolicy::BestEffort)).unwrap();

    assert_ok!(hub.start_protocol(PROTOCOL, 24).await);
    let progress = wait_for_state(&hub, SequencerState::Completed).await;
    assert_eq!(progress.percent, 100);
    assert_eq!(progress.current_step, "Protocol completed successfully!");
    assert_eq!(progress.protocol.as_deref(), Some(PROTOCOL));

    // Routed through the control task, so the completion handler has run.
    let samples = hub.samples().await.unwrap();
    assert_eq!(samples.len(), 24);
    assert_eq!(samples[0].id, "S0001");
    assert_eq!(samples[23].id, "S0024");
    assert!(samples.windows(2).all(|w| w[0].id < w[1].id));
    assert!(samples.iter().all(|s| s.status == "Active"));

    assert!(logged(&hub, LogLevel::Success, &format!("Starting protocol: {PROTOCOL}")));
    assert!(logged(&hub, LogLevel::Info, "Processing 24 samples"));
    assert!(logged(&hub, LogLevel::Success, "Protocol execution completed"));
    assert!(logged(
        &hub,
        LogLevel::Success,
        "Transport Robot: Returning samples to storage completed successfully"
    ));

    assert_eq!(hub.count_active().await, 0);
    for device in ["Transport Robot", "Liquid Handler", "Incubator", "Centrifuge", "Plate Reader"] {
        let state = hub.device_state(device).await.unwrap();
        assert_eq!(state.status, DeviceStatus::Ready, "{device}");
        assert_eq!(state.progress, 0, "{device}");
    }
    assert!(hub.progress().can_start());

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_protocol_name_is_not_checked_against_catalog() {
    let hub = WorkcellHub::spawn(fast_config(2, AbortPolicy::BestEffort)).unwrap();
    assert_ok!(hub.start_protocol("Custom Workflow", 1).await);
    let progress = wait_for_state(&hub, SequencerState::Completed).await;
    assert_eq!(progress.protocol.as_deref(), Some("Custom Workflow"));
    assert_eq!(hub.samples().await.unwrap().len(), 1);
    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_start_is_rejected_while_running() {
    let hub = WorkcellHub::spawn(fast_config(20, AbortPolicy::BestEffort)).unwrap();

    let first = hub.start_protocol(PROTOCOL, 24).await.unwrap();
    let second = hub.start_protocol("Inter-Lab Sample Transfer", 12).await;
    assert_eq!(second, Err(WorkcellError::AlreadyRunning));
    assert!(logged(&hub, LogLevel::Warning, "A protocol is already running"));

    let progress = hub.progress();
    assert_eq!(progress.protocol.as_deref(), Some(PROTOCOL));
    assert!(!progress.can_start());
    assert!(progress.can_pause());
    assert!(first > 0);

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sample_count_bounds() {
    let hub = WorkcellHub::spawn(fast_config(5, AbortPolicy::BestEffort)).unwrap();

    for count in [0, 97] {
        let err = assert_err!(hub.start_protocol(PROTOCOL, count).await);
        assert_eq!(
            err,
            WorkcellError::InvalidSampleCount {
                count,
                min: 1,
                max: 96
            }
        );
    }
    assert_eq!(hub.progress().state, SequencerState::Idle);
    assert_eq!(hub.count_active().await, 0);

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pause_keeps_step_index() {
    let hub = WorkcellHub::spawn(fast_config(20, AbortPolicy::BestEffort)).unwrap();

    hub.start_protocol(PROTOCOL, 8).await.unwrap();
    assert!(hub.pause_protocol().await.unwrap());

    let paused = hub.progress();
    assert_eq!(paused.state, SequencerState::Paused);
    assert_eq!(paused.step_index, 0);
    assert_eq!(paused.current_step, "Protocol paused at step 1/6");
    assert!(logged(&hub, LogLevel::Warning, "Protocol paused by user"));

    // The in-flight job runs to completion but does not advance the run.
    wait_until_idle(&hub).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = hub.progress();
    assert_eq!(after.state, SequencerState::Paused);
    assert_eq!(after.step_index, 0);
    assert_eq!(hub.count_active().await, 0);
    assert!(hub.samples().await.unwrap().is_empty());

    assert!(!hub.pause_protocol().await.unwrap());
    assert!(hub.progress().can_start());

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_device_test_operation_lifecycle() {
    let hub = WorkcellHub::spawn(fast_config(2, AbortPolicy::BestEffort)).unwrap();
    let mut feed = hub.subscribe_status();

    let job = hub.start_test("Centrifuge").await.unwrap();
    assert_eq!(job.device(), "Centrifuge");
    assert_eq!(job.operation(), "Spinning at 2000 RPM");
    wait_until_idle(&hub).await;

    let mut events = Vec::new();
    while let Ok(event) = feed.try_recv() {
        events.push(event);
    }
    let active: Vec<u8> = events
        .iter()
        .filter(|e| e.status == DeviceStatus::Active)
        .map(|e| e.progress)
        .collect();
    assert_eq!(active, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    let last = events.last().unwrap();
    assert_eq!(last.device, "Centrifuge");
    assert_eq!(last.status, DeviceStatus::Ready);
    assert_eq!(last.progress, 0);

    assert!(logged(&hub, LogLevel::Device, "Starting Centrifuge: Spinning at 2000 RPM"));
    assert!(logged(&hub, LogLevel::Info, "Centrifuge: Spinning at 2000 RPM 50% complete"));
    assert!(logged(
        &hub,
        LogLevel::Success,
        "Centrifuge: Spinning at 2000 RPM completed successfully"
    ));

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_test_rejections() {
    let hub = WorkcellHub::spawn(fast_config(20, AbortPolicy::BestEffort)).unwrap();

    assert_ok!(hub.start_test("Centrifuge").await);
    let busy = hub.start_test("Centrifuge").await;
    assert_eq!(
        busy.unwrap_err(),
        WorkcellError::DeviceBusy {
            device: "Centrifuge".to_string()
        }
    );
    assert!(logged(&hub, LogLevel::Warning, "Centrifuge is already active"));

    let unknown = hub.start_test("Mass Spectrometer").await;
    assert_eq!(
        unknown.unwrap_err(),
        WorkcellError::UnknownDevice("Mass Spectrometer".to_string())
    );
    assert_eq!(hub.stats().await.active_operations, 1);

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_test_requests_accept_one() {
    let hub = WorkcellHub::spawn(fast_config(20, AbortPolicy::BestEffort)).unwrap();

    let results = join_all((0..8).map(|_| hub.start_test("Plate Reader"))).await;
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(WorkcellError::DeviceBusy { .. })))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(busy, 7);
    assert_eq!(hub.count_active().await, 1);

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_busy_step_device_waits_for_live_job() {
    let hub = WorkcellHub::spawn(fast_config(2, AbortPolicy::BestEffort)).unwrap();

    hub.start_test("Transport Robot").await.unwrap();
    hub.start_protocol(PROTOCOL, 2).await.unwrap();
    assert!(logged(
        &hub,
        LogLevel::Info,
        "Transport Robot is busy, step 1/6 waits for its current operation"
    ));

    wait_for_state(&hub, SequencerState::Completed).await;
    assert_eq!(hub.samples().await.unwrap().len(), 2);

    hub.shutdown().await.unwrap();
}

async fn abort_with_live_jobs(policy: AbortPolicy) {
    let hub = WorkcellHub::spawn(fast_config(20, policy)).unwrap();
    let devices = ["Liquid Handler", "Centrifuge", "Plate Reader"];
    for device in devices {
        hub.start_test(device).await.unwrap();
    }
    assert_eq!(hub.count_active().await, 3);

    let outcome = hub.emergency_abort(true).await.unwrap();
    let AbortOutcome::Aborted {
        cancelled_jobs,
        acknowledged,
    } = outcome
    else {
        panic!("abort was declined");
    };
    assert_eq!(cancelled_jobs, 3);

    match policy {
        AbortPolicy::AwaitAcknowledgement => {
            assert!(acknowledged);
            assert_eq!(hub.count_active().await, 0);
        }
        AbortPolicy::BestEffort => {
            assert!(!acknowledged);
            wait_until_idle(&hub).await;
        }
    }

    for (device, state) in hub.device_states().await {
        assert_eq!(state.status, DeviceStatus::Stopped, "{device}");
        assert_eq!(state.progress, 0, "{device}");
    }

    assert!(logged(&hub, LogLevel::Error, "EMERGENCY STOP ACTIVATED"));
    let notice = hub.watch_notices().borrow().clone();
    assert_eq!(notice.message, "EMERGENCY STOP - All operations halted");
    assert_eq!(notice.duration, Some(Duration::from_millis(50)));
    assert_eq!(hub.progress().state, SequencerState::Aborted);

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_abort_stops_every_device_best_effort() {
    abort_with_live_jobs(AbortPolicy::BestEffort).await;
}

#[tokio::test]
async fn test_abort_stops_every_device_with_acknowledgement() {
    abort_with_live_jobs(AbortPolicy::AwaitAcknowledgement).await;
}

#[tokio::test]
async fn test_abort_halts_protocol() {
    let hub = WorkcellHub::spawn(fast_config(20, AbortPolicy::AwaitAcknowledgement)).unwrap();

    hub.start_protocol(PROTOCOL, 24).await.unwrap();
    hub.emergency_abort(true).await.unwrap();

    let progress = hub.progress();
    assert_eq!(progress.state, SequencerState::Aborted);
    assert_eq!(progress.current_step, "Protocol aborted");
    let step = progress.step_index;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.progress().step_index, step);
    assert_eq!(hub.count_active().await, 0);
    assert!(hub.samples().await.unwrap().is_empty());

    // A new run may start after an abort.
    assert_ok!(hub.start_protocol(PROTOCOL, 1).await);

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_declined_abort_changes_nothing() {
    let hub = WorkcellHub::spawn(fast_config(20, AbortPolicy::BestEffort)).unwrap();

    hub.start_test("Liquid Handler").await.unwrap();
    let outcome = hub.emergency_abort(false).await.unwrap();
    assert_eq!(outcome, AbortOutcome::Declined);

    assert_eq!(hub.count_active().await, 1);
    assert!(logged(&hub, LogLevel::Info, "Emergency stop cancelled"));
    assert!(!logged(&hub, LogLevel::Error, "EMERGENCY STOP ACTIVATED"));
    assert_eq!(hub.watch_notices().borrow().message, "System Ready");
    assert_eq!(hub.progress().state, SequencerState::Idle);

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manual_samples_are_sequential() {
    let hub = WorkcellHub::spawn(fast_config(5, AbortPolicy::BestEffort)).unwrap();
    let mut feed = hub.subscribe_samples();
    let config = hub.config().samples.clone();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let entry = hub.add_sample().await.unwrap();
        assert!(config.types.contains(&entry.sample_type));
        assert!(config.locations.contains(&entry.location));
        ids.push(entry.id);
    }
    assert_eq!(ids, vec!["S0001", "S0002", "S0003"]);

    for id in &ids {
        assert_eq!(&feed.recv().await.unwrap().id, id);
    }
    assert_eq!(hub.samples().await.unwrap().len(), 3);

    hub.shutdown().await.unwrap();
}
