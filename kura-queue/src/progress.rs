//! Progress observation for running commands.
//!
//! Commands receive a [`ProgressReporter`] and publish fractional completion
//! through it. A reporter can be split with [`ProgressReporter::sub_range`] so
//! a nested step reports 0..100 of its own work while the observer sees the
//! parent's slice of the overall range.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use crate::command::CommandId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CommandStatus {
    Queued,
    Running,
    Finished,
    Error,
    Cancelled,
}

/// Ephemeral progress snapshot; never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandProgress {
    pub command_id: CommandId,
    pub class_name: String,
    /// Percent complete, 0..=100.
    pub progress: f64,
    pub status: CommandStatus,
    pub error: Option<String>,
}

/// Observer receiving every progress report.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: CommandProgress);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn report(&self, _progress: CommandProgress) {}
}

/// Keeps every report in memory; handy for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingProgressSink {
    reports: Mutex<Vec<CommandProgress>>,
}

impl RecordingProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<CommandProgress> {
        self.reports
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl ProgressSink for RecordingProgressSink {
    fn report(&self, progress: CommandProgress) {
        let mut guard = self
            .reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(progress);
    }
}

/// Handle a command uses to publish progress. Cheap to clone; clones and
/// sub-ranges share the same sink and high-water mark.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    command_id: CommandId,
    class_name: String,
    low: f64,
    high: f64,
    root: bool,
    high_water: Arc<Mutex<f64>>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("command_id", &self.command_id)
            .field("class_name", &self.class_name)
            .field("low", &self.low)
            .field("high", &self.high)
            .field("root", &self.root)
            .finish()
    }
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>, command_id: CommandId, class_name: String) -> Self {
        Self {
            sink,
            command_id,
            class_name,
            low: 0.0,
            high: 100.0,
            root: true,
            high_water: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Reporter that maps this reporter's `from..to` percent slice onto a
    /// fresh 0..100 scale.
    pub fn sub_range(&self, from: f64, to: f64) -> ProgressReporter {
        let from = clamp_percent(from);
        let to = clamp_percent(to).max(from);
        ProgressReporter {
            sink: Arc::clone(&self.sink),
            command_id: self.command_id.clone(),
            class_name: self.class_name.clone(),
            low: self.map(from),
            high: self.map(to),
            root: false,
            high_water: Arc::clone(&self.high_water),
        }
    }

    pub fn init(&self) {
        self.emit(self.low, CommandStatus::Running, None);
    }

    /// Reports `percent` of this reporter's range. Never moves backwards.
    pub fn update(&self, percent: f64) {
        let absolute = self.map(clamp_percent(percent));
        self.emit(absolute, CommandStatus::Running, None);
    }

    /// Completes the range. Only the root reporter emits `Finished`.
    pub fn finish(&self) {
        if self.root {
            self.emit(100.0, CommandStatus::Finished, None);
        } else {
            self.update(100.0);
        }
    }

    pub fn fail(&self, error: impl fmt::Display) {
        let current = self.current();
        self.emit(current, CommandStatus::Error, Some(error.to_string()));
    }

    pub fn cancelled(&self) {
        let current = self.current();
        self.emit(current, CommandStatus::Cancelled, None);
    }

    /// Highest absolute percentage reported so far.
    pub fn current(&self) -> f64 {
        *self
            .high_water
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn map(&self, percent: f64) -> f64 {
        self.low + (self.high - self.low) * percent / 100.0
    }

    fn emit(&self, absolute: f64, status: CommandStatus, error: Option<String>) {
        let progress = {
            let mut high_water = self
                .high_water
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if absolute > *high_water {
                *high_water = absolute;
            }
            *high_water
        };
        self.sink.report(CommandProgress {
            command_id: self.command_id.clone(),
            class_name: self.class_name.clone(),
            progress,
            status,
            error,
        });
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}
