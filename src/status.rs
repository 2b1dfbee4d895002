//! Device status table and status feed.
//!
//! The table is the single source of truth for what each device last reported.
//! Runners write their own device's entry; emergency abort overwrites every
//! entry. Each write is published on a broadcast channel (the status feed)
//! while the table lock is held, so subscribers observe writes in the same
//! order the table applied them.
//!
//! Whether a device is *busy* is not answered here: that is derived from live
//! job handles in [`crate::runner::JobTable`], because a runner that just
//! finished may not have written its final status yet.

use crate::error::{HubResult, WorkcellError};
use crate::registry::DeviceRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Status label of a device.
///
/// The set is open-ended: besides the well-known labels a device may report a
/// custom label such as `"Maintaining 37°C"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceStatus {
    /// Powered and waiting, never used yet
    Idle,
    /// Available for a new operation
    Ready,
    /// An operation is in progress
    Active,
    /// Halted by cancellation or emergency abort
    Stopped,
    /// Device-specific label
    Custom(String),
}

impl DeviceStatus {
    /// Label as displayed.
    pub fn as_str(&self) -> &str {
        match self {
            DeviceStatus::Idle => "Idle",
            DeviceStatus::Ready => "Ready",
            DeviceStatus::Active => "Active",
            DeviceStatus::Stopped => "Stopped",
            DeviceStatus::Custom(label) => label,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl From<&str> for DeviceStatus {
    fn from(label: &str) -> Self {
        match label {
            "Idle" => DeviceStatus::Idle,
            "Ready" => DeviceStatus::Ready,
            "Active" => DeviceStatus::Active,
            "Stopped" => DeviceStatus::Stopped,
            other => DeviceStatus::Custom(other.to_string()),
        }
    }
}

impl From<String> for DeviceStatus {
    fn from(label: String) -> Self {
        match DeviceStatus::from(label.as_str()) {
            DeviceStatus::Custom(_) => DeviceStatus::Custom(label),
            known => known,
        }
    }
}

impl From<DeviceStatus> for String {
    fn from(status: DeviceStatus) -> Self {
        match status {
            DeviceStatus::Custom(label) => label,
            other => other.as_str().to_string(),
        }
    }
}

/// Latest known status and progress of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Status label
    pub status: DeviceStatus,
    /// Progress 0-100, always 0 unless the status is `Active`
    pub progress: u8,
}

impl DeviceState {
    /// Build a state, zeroing progress for any status other than `Active`
    /// and clamping it to 100.
    pub fn new(status: DeviceStatus, progress: u8) -> Self {
        let progress = if status == DeviceStatus::Active {
            progress.min(100)
        } else {
            0
        };
        Self { status, progress }
    }

    /// The state every device is forced into by emergency abort.
    pub fn stopped() -> Self {
        Self::new(DeviceStatus::Stopped, 0)
    }
}

/// One entry of the status feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Device identity
    pub device: String,
    /// Status label
    pub status: DeviceStatus,
    /// Progress 0-100
    pub progress: u8,
}

/// Lock-guarded map from device identity to its latest state.
///
/// Cloning the table yields another handle onto the same state.
#[derive(Clone)]
pub struct DeviceStatusTable {
    states: Arc<RwLock<HashMap<String, DeviceState>>>,
    feed: broadcast::Sender<StatusEvent>,
}

impl DeviceStatusTable {
    /// Create a table seeded with every device's initial state.
    pub fn new(registry: &DeviceRegistry, feed_capacity: usize) -> Self {
        let states = registry
            .names()
            .filter_map(|name| {
                let state = registry.initial_state(name).ok()?;
                Some((name.to_string(), state))
            })
            .collect();
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            states: Arc::new(RwLock::new(states)),
            feed,
        }
    }

    /// Overwrite the state of `device` and publish it on the status feed.
    ///
    /// Progress is forced to 0 whenever `status` is not `Active`.
    pub async fn update(
        &self,
        device: &str,
        status: DeviceStatus,
        progress: u8,
    ) -> HubResult<DeviceState> {
        let mut states = self.states.write().await;
        self.write_entry(&mut states, device, DeviceState::new(status, progress))
    }

    /// Like [`update`](Self::update), but `cancelled` is checked while the
    /// table lock is held. When it is set the entry becomes `("Stopped", 0)`
    /// instead and `Ok(None)` is returned.
    ///
    /// Cancellation is always signalled before [`stop_all`](Self::stop_all)
    /// takes the lock, so a runner write that lands after `stop_all` can
    /// never overwrite `Stopped` with a stale label.
    pub async fn update_unless_cancelled(
        &self,
        device: &str,
        status: DeviceStatus,
        progress: u8,
        cancelled: &AtomicBool,
    ) -> HubResult<Option<DeviceState>> {
        let mut states = self.states.write().await;
        if cancelled.load(Ordering::SeqCst) {
            self.write_entry(&mut states, device, DeviceState::stopped())?;
            return Ok(None);
        }
        self.write_entry(&mut states, device, DeviceState::new(status, progress))
            .map(Some)
    }

    fn write_entry(
        &self,
        states: &mut HashMap<String, DeviceState>,
        device: &str,
        state: DeviceState,
    ) -> HubResult<DeviceState> {
        let slot = states
            .get_mut(device)
            .ok_or_else(|| WorkcellError::UnknownDevice(device.to_string()))?;
        *slot = state.clone();

        // No subscribers is fine; the table itself is authoritative.
        let _ = self.feed.send(StatusEvent {
            device: device.to_string(),
            status: state.status.clone(),
            progress: state.progress,
        });
        Ok(state)
    }

    /// Force every device into `("Stopped", 0)`, including idle ones.
    pub async fn stop_all(&self) {
        let mut states = self.states.write().await;
        for (device, slot) in states.iter_mut() {
            *slot = DeviceState::stopped();
            let _ = self.feed.send(StatusEvent {
                device: device.clone(),
                status: DeviceStatus::Stopped,
                progress: 0,
            });
        }
    }

    /// Current state of one device.
    pub async fn get(&self, device: &str) -> Option<DeviceState> {
        self.states.read().await.get(device).cloned()
    }

    /// Copy of every device's current state.
    pub async fn snapshot(&self) -> HashMap<String, DeviceState> {
        self.states.read().await.clone()
    }

    /// Subscribe to the status feed.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.feed.subscribe()
    }
}
