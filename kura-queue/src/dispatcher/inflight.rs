//! Live execution state: per-tag counts, cancellation tokens and the fences
//! raised while a clear is in progress.
//!
//! Every mutation happens under one lock, so the tag capacity check and the
//! increment are a single step even when ticks and clears race.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    admission::tighter,
    command::{CommandId, ScheduledCommand, WorkType},
    events::{ClearScope, RunId},
};

/// Public view of one running command.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InflightInfo {
    pub command_id: CommandId,
    pub class_name: String,
    pub parallel_tag: String,
    pub work_type: WorkType,
    pub batch: Option<String>,
    pub run_id: RunId,
    pub progress: f64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    info: InflightInfo,
    limit: Option<u32>,
    token: CancellationToken,
    cleared: bool,
}

impl Entry {
    fn within(&self, scope: &ClearScope) -> bool {
        match scope {
            ClearScope::All => true,
            ClearScope::Batch(batch) => self.info.batch.as_deref() == Some(batch.as_str()),
            ClearScope::WorkTypes(types) => types.contains(&self.info.work_type),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<CommandId, Entry>,
    by_tag: HashMap<String, u32>,
    fences: Vec<(u64, ClearScope)>,
    next_fence: u64,
}

impl Inner {
    fn fenced(&self, command: &ScheduledCommand) -> bool {
        self.fences.iter().any(|(_, scope)| match scope {
            ClearScope::All => true,
            ClearScope::Batch(batch) => command.batch() == Some(batch.as_str()),
            ClearScope::WorkTypes(types) => types.contains(&command.work_type()),
        })
    }

    fn strictest(&self, tag: &str) -> Option<u32> {
        self.entries
            .values()
            .filter(|entry| entry.info.parallel_tag == tag)
            .fold(None, |acc, entry| tighter(acc, entry.limit))
    }
}

/// Why a command could not take a slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Refusal {
    AlreadyRunning,
    TagFull,
    Fenced,
}

#[derive(Debug, Default)]
pub struct InflightTable {
    inner: Mutex<Inner>,
}

impl InflightTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserves a slot for `command` if its tag has room and no clear covering
    /// it is in progress. Room is judged against the stricter of `limit` and
    /// the smallest limit already running on the tag. The slot is released on
    /// drop.
    pub fn try_admit(
        self: &Arc<Self>,
        command: &ScheduledCommand,
        limit: Option<u32>,
        token: CancellationToken,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> Result<InflightSlot, Refusal> {
        let mut inner = self.lock();
        if inner.entries.contains_key(command.id()) {
            return Err(Refusal::AlreadyRunning);
        }
        if inner.fenced(command) {
            return Err(Refusal::Fenced);
        }
        let tag = command.parallel_tag();
        let running = inner.by_tag.get(tag).copied().unwrap_or(0);
        if tighter(limit, inner.strictest(tag)).is_some_and(|limit| running >= limit) {
            return Err(Refusal::TagFull);
        }

        *inner.by_tag.entry(command.parallel_tag().to_owned()).or_insert(0) += 1;
        inner.entries.insert(
            command.id().clone(),
            Entry {
                info: InflightInfo {
                    command_id: command.id().clone(),
                    class_name: command.class_name().to_owned(),
                    parallel_tag: command.parallel_tag().to_owned(),
                    work_type: command.work_type(),
                    batch: command.batch().map(str::to_owned),
                    run_id,
                    progress: 0.0,
                    started_at: now,
                },
                limit,
                token,
                cleared: false,
            },
        );

        Ok(InflightSlot {
            table: Arc::clone(self),
            id: command.id().clone(),
        })
    }

    /// Raises a fence over `scope`: running commands inside it are cancelled
    /// and marked cleared, and nothing inside it is admitted until the
    /// returned guard drops.
    pub fn fence(self: &Arc<Self>, scope: ClearScope) -> (FenceGuard, usize) {
        let mut inner = self.lock();
        let mut cancelled = 0;
        for entry in inner.entries.values_mut() {
            if entry.within(&scope) {
                entry.cleared = true;
                entry.token.cancel();
                cancelled += 1;
            }
        }
        inner.next_fence += 1;
        let key = inner.next_fence;
        inner.fences.push((key, scope));
        (
            FenceGuard {
                table: Arc::clone(self),
                key,
            },
            cancelled,
        )
    }

    /// Batches under an active fence.
    pub fn fenced_batches(&self) -> Vec<String> {
        self.lock()
            .fences
            .iter()
            .filter_map(|(_, scope)| match scope {
                ClearScope::Batch(batch) => Some(batch.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn tag_counts(&self) -> HashMap<String, u32> {
        self.lock().by_tag.clone()
    }

    /// Smallest limit among running commands, per tag. Tags whose commands
    /// are all unbounded are absent.
    pub fn running_limits(&self) -> HashMap<String, u32> {
        let inner = self.lock();
        let mut limits: HashMap<String, u32> = HashMap::new();
        for entry in inner.entries.values() {
            if let Some(limit) = entry.limit {
                limits
                    .entry(entry.info.parallel_tag.clone())
                    .and_modify(|current| *current = (*current).min(limit))
                    .or_insert(limit);
            }
        }
        limits
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_progress(&self, id: &CommandId, progress: f64) {
        if let Some(entry) = self.lock().entries.get_mut(id) {
            entry.info.progress = progress;
        }
    }

    pub fn snapshot(&self) -> Vec<InflightInfo> {
        let mut running: Vec<InflightInfo> =
            self.lock().entries.values().map(|e| e.info.clone()).collect();
        running.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.command_id.cmp(&b.command_id))
        });
        running
    }

    fn release(&self, id: &CommandId) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.remove(id) {
            let tag = entry.info.parallel_tag;
            if let Some(count) = inner.by_tag.get_mut(&tag) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.by_tag.remove(&tag);
                }
            }
        }
    }

    fn was_cleared(&self, id: &CommandId) -> bool {
        self.lock().entries.get(id).is_some_and(|entry| entry.cleared)
    }
}

/// Holds one tag slot for the lifetime of an execution.
pub struct InflightSlot {
    table: Arc<InflightTable>,
    id: CommandId,
}

impl fmt::Debug for InflightSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InflightSlot").field("id", &self.id).finish()
    }
}

impl InflightSlot {
    /// True once an administrative clear covered this command.
    pub fn was_cleared(&self) -> bool {
        self.table.was_cleared(&self.id)
    }
}

impl Drop for InflightSlot {
    fn drop(&mut self) {
        self.table.release(&self.id);
    }
}

pub struct FenceGuard {
    table: Arc<InflightTable>,
    key: u64,
}

impl fmt::Debug for FenceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceGuard").field("key", &self.key).finish()
    }
}

impl Drop for FenceGuard {
    fn drop(&mut self) {
        let mut inner = self.table.lock();
        inner.fences.retain(|(key, _)| *key != self.key);
    }
}
