use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    command::{CommandId, WorkType},
    progress::CommandProgress,
};

/// Identifies one execution attempt. Every event emitted while the attempt is
/// alive carries the same id.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle notifications for queued commands.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum QueueEventPayload {
    Enqueued {
        command_id: CommandId,
        class_name: String,
        work_type: WorkType,
        batch: Option<String>,
        replaced: bool,
    },
    Started {
        command_id: CommandId,
        class_name: String,
        parallel_tag: String,
        run_id: RunId,
    },
    Progress {
        run_id: RunId,
        progress: CommandProgress,
    },
    Completed {
        command_id: CommandId,
        run_id: RunId,
    },
    Rescheduled {
        command_id: CommandId,
        run_id: RunId,
        retries: u32,
        delay_ms: u64,
        error: String,
    },
    /// A precondition held the command back; retries are untouched.
    Deferred {
        command_id: CommandId,
        precondition: String,
        delay_ms: u64,
    },
    Failed {
        command_id: CommandId,
        class_name: String,
        retries: u32,
        error: String,
    },
    Quarantined {
        command_id: CommandId,
        class_name: String,
        reason: String,
    },
    Cancelled {
        command_id: CommandId,
        run_id: RunId,
    },
    Cleared {
        scope: ClearScope,
        removed: u64,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ClearScope {
    Batch(String),
    WorkTypes(Vec<WorkType>),
    All,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEvent {
    pub emitted_at: DateTime<Utc>,
    pub payload: QueueEventPayload,
}

impl QueueEvent {
    pub fn new(emitted_at: DateTime<Utc>, payload: QueueEventPayload) -> Self {
        Self {
            emitted_at,
            payload,
        }
    }
}

/// In-process fan-out of queue events. Publishing never blocks and never
/// fails; slow subscribers observe `Lagged` on their receiver.
pub struct QueueEventBus {
    sender: broadcast::Sender<QueueEvent>,
    capacity: usize,
}

impl fmt::Debug for QueueEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl QueueEventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }
}
