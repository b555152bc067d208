use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource budget for one mutable generation.
///
/// A generation accepts writes until either limit is exceeded, at which
/// point `set_entity` raises a recoverable overflow and the layered index
/// rotates it out.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Settings {
    /// Maximum number of entity slots per generation
    pub max_entities: u32,
    /// Maximum bytes of chain/entity memory per generation
    pub max_allocate: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_entities: 2000,
            // 256MB
            max_allocate: 256 * 1024 * 1024,
        }
    }
}

impl Settings {
    pub fn with_max_entities(mut self, value: u32) -> Self {
        self.max_entities = value;
        self
    }

    pub fn with_max_allocate(mut self, value: usize) -> Self {
        self.max_allocate = value;
        self
    }
}

/// Configuration for the background merge monitor thread
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How long the monitor waits for a completion event before polling
    /// the merge policy anyway
    pub poll_interval: Duration,
    /// Delay before the monitor starts working after index creation
    pub start_delay: Duration,
    /// Minimum number of adjacent serialized generations before a merge
    /// window is proposed
    pub merge_factor: usize,
    /// Maximum number of generations merged in one fusion job
    pub max_merge: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            start_delay: Duration::ZERO,
            merge_factor: 3,
            max_merge: 8,
        }
    }
}

impl MonitorConfig {
    pub fn with_poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval = value;
        self
    }

    pub fn with_start_delay(mut self, value: Duration) -> Self {
        self.start_delay = value;
        self
    }

    pub fn with_merge_factor(mut self, value: usize) -> Self {
        self.merge_factor = value;
        self
    }

    pub fn with_max_merge(mut self, value: usize) -> Self {
        self.max_merge = value;
        self
    }
}
