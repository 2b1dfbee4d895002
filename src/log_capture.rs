//! Leveled, timestamped event log for external display.
//!
//! Every component reports operator-facing events through a [`LogSink`]. The
//! sink keeps the most recent events in a fixed-capacity [`LogBuffer`] and
//! publishes each one on a broadcast channel (the log feed). Events are also
//! mirrored to `tracing` so headless runs keep a diagnostic trail.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// General information
    Info,
    /// Rejected commands and operator interventions
    Warning,
    /// Emergency conditions
    Error,
    /// Completed operations and protocols
    Success,
    /// Device-originated activity
    Device,
}

impl LogLevel {
    /// Display colour used by the presentation shell.
    pub fn color(&self) -> &'static str {
        match self {
            LogLevel::Info => "black",
            LogLevel::Warning => "orange",
            LogLevel::Error => "red",
            LogLevel::Success => "green",
            LogLevel::Device => "blue",
        }
    }

    /// Level name as displayed.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Success => "SUCCESS",
            LogLevel::Device => "DEVICE",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a single log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Local time of emission
    pub timestamp: DateTime<Local>,
    /// Severity
    pub level: LogLevel,
    /// Message text
    pub message: String,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// A thread-safe, fixed-capacity log buffer.
///
/// When full, the oldest event is dropped.
#[derive(Clone)]
pub struct LogBuffer {
    entries: Arc<Mutex<VecDeque<LogEvent>>>,
    capacity: usize,
}

impl LogBuffer {
    /// Create an empty buffer holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEvent>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the buffered events, oldest first.
    pub fn read(&self) -> Vec<LogEvent> {
        self.lock().iter().cloned().collect()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every buffered event.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Shared handle that records events and publishes the log feed.
#[derive(Clone)]
pub struct LogSink {
    buffer: LogBuffer,
    feed: broadcast::Sender<LogEvent>,
}

impl LogSink {
    /// Create a sink with the given buffer and feed capacities.
    pub fn new(buffer_capacity: usize, feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            buffer: LogBuffer::new(buffer_capacity),
            feed,
        }
    }

    /// Record an event.
    pub fn emit(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Error => tracing::error!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            _ => tracing::info!(kind = %level, "{}", message),
        }

        // Timestamping, buffering and publishing happen under one lock so the
        // feed order matches the buffer order across concurrent emitters.
        let mut entries = self.buffer.lock();
        let event = LogEvent {
            timestamp: Local::now(),
            level,
            message,
        };
        if entries.len() >= self.buffer.capacity {
            entries.pop_front();
        }
        entries.push_back(event.clone());
        let _ = self.feed.send(event);
    }

    /// Record an `INFO` event.
    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogLevel::Info, message);
    }

    /// Record a `WARNING` event.
    pub fn warning(&self, message: impl Into<String>) {
        self.emit(LogLevel::Warning, message);
    }

    /// Record an `ERROR` event.
    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogLevel::Error, message);
    }

    /// Record a `SUCCESS` event.
    pub fn success(&self, message: impl Into<String>) {
        self.emit(LogLevel::Success, message);
    }

    /// Record a `DEVICE` event.
    pub fn device(&self, message: impl Into<String>) {
        self.emit(LogLevel::Device, message);
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    /// Subscribe to the log feed.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.feed.subscribe()
    }
}
