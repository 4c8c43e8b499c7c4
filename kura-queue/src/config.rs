use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::command::WorkType;

/// Knobs for the command queue runtime.
///
/// All fields carry defaults so a partial settings file (or none at all) is
/// enough to start the dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Worker pool size. Tag limits decide which free slots a tag may fill,
    /// never the pool size itself.
    pub workers: usize,
    /// Poll cadence while work was admitted on the previous tick.
    pub poll_interval_ms: u64,
    /// Poll cadence when the previous tick admitted nothing.
    pub idle_poll_interval_ms: u64,
    /// Retry budget for commands that do not declare their own.
    pub default_max_retries: u32,
    /// Backoff applied when a command fails transiently.
    pub retry: RetryConfig,
    /// Operator caps per parallel tag, applied on top of each command's own
    /// `parallel_max`. The smaller of the two wins.
    pub tag_caps: HashMap<String, u32>,
    /// Work types excluded from admission at startup.
    pub disabled_work_types: Vec<WorkType>,
    /// Capacity of the in-process event channel.
    pub event_channel_capacity: usize,
    /// How long shutdown waits for running commands after cancelling them.
    pub shutdown_grace_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 250,
            idle_poll_interval_ms: 2_000,
            default_max_retries: 3,
            retry: RetryConfig::default(),
            tag_caps: HashMap::new(),
            disabled_work_types: Vec::new(),
            event_channel_capacity: 1_024,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms.max(self.poll_interval_ms))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Operator cap for `tag`, if any.
    pub fn tag_cap(&self, tag: &str) -> Option<u32> {
        self.tag_caps.get(tag).copied()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds so short delays still spread a bit.
    pub jitter_min_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 5_000,
            backoff_max_ms: 10 * 60 * 1_000,
            jitter_ratio: 0.2,
            jitter_min_ms: 250,
        }
    }
}
