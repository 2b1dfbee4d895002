//! Append-only sample ledger.
//!
//! Samples are created in bulk when a protocol completes, or one at a time by
//! the manual "add sample" command. Ids are sequential (`S0001`, `S0002`, ...)
//! and entries are never mutated or removed.

use chrono::{DateTime, Local};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Status given to every newly tracked sample.
pub const INITIAL_SAMPLE_STATUS: &str = "Active";

/// A tracked sample record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleEntry {
    /// Sequential id, e.g. `S0007`
    pub id: String,
    /// Sample type, e.g. `CHO Clone`
    pub sample_type: String,
    /// Storage location, e.g. `Incubator A`
    pub location: String,
    /// Tracking status
    pub status: String,
    /// Local creation time
    pub created_at: DateTime<Local>,
}

/// Policy for drawing a sample type or location from its candidate set.
pub trait SamplePicker: Send {
    /// Pick one of `candidates`, or `None` when the set is empty.
    fn pick<'a>(&mut self, candidates: &'a [String]) -> Option<&'a str>;
}

/// Uniform random choice.
pub struct UniformPicker {
    rng: StdRng,
}

impl UniformPicker {
    /// Picker seeded from system entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible picker.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for UniformPicker {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplePicker for UniformPicker {
    fn pick<'a>(&mut self, candidates: &'a [String]) -> Option<&'a str> {
        candidates.choose(&mut self.rng).map(String::as_str)
    }
}

/// Walks each candidate set in order, wrapping around.
#[derive(Debug, Default)]
pub struct RoundRobinPicker {
    cursor: usize,
}

impl SamplePicker for RoundRobinPicker {
    fn pick<'a>(&mut self, candidates: &'a [String]) -> Option<&'a str> {
        if candidates.is_empty() {
            return None;
        }
        let choice = &candidates[self.cursor % candidates.len()];
        self.cursor += 1;
        Some(choice)
    }
}

/// Ordered, append-only record of samples.
pub struct SampleLedger {
    entries: Vec<SampleEntry>,
    types: Vec<String>,
    locations: Vec<String>,
    picker: Box<dyn SamplePicker>,
    feed: broadcast::Sender<SampleEntry>,
}

impl SampleLedger {
    /// Create an empty ledger drawing from the given candidate sets.
    pub fn new(
        types: Vec<String>,
        locations: Vec<String>,
        picker: Box<dyn SamplePicker>,
        feed_capacity: usize,
    ) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            entries: Vec::new(),
            types,
            locations,
            picker,
            feed,
        }
    }

    /// Append a sample, assigning the next sequential id.
    pub fn append(
        &mut self,
        sample_type: impl Into<String>,
        location: impl Into<String>,
    ) -> SampleEntry {
        let entry = SampleEntry {
            id: format!("S{:04}", self.entries.len() + 1),
            sample_type: sample_type.into(),
            location: location.into(),
            status: INITIAL_SAMPLE_STATUS.to_string(),
            created_at: Local::now(),
        };
        self.entries.push(entry.clone());
        let _ = self.feed.send(entry.clone());
        entry
    }

    /// Append a sample with type and location drawn by the picker.
    pub fn create_random(&mut self) -> SampleEntry {
        let sample_type = self.picker.pick(&self.types).unwrap_or("Unknown").to_string();
        let location = self
            .picker
            .pick(&self.locations)
            .unwrap_or("Unassigned")
            .to_string();
        self.append(sample_type, location)
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[SampleEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscribe to the sample feed.
    pub fn subscribe(&self) -> broadcast::Receiver<SampleEntry> {
        self.feed.subscribe()
    }

    /// Sender side of the sample feed, for handing out subscriptions.
    pub fn feed(&self) -> broadcast::Sender<SampleEntry> {
        self.feed.clone()
    }
}
