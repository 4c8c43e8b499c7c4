use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::{
    admission::{AdmissionQuery, AdmissionWindow},
    clock::{Clock, SystemClock},
    command::{CommandId, CommandRequest, CommandState, WorkType},
    error::Result,
    precondition::to_chrono,
    store::{CommandStore, PutOutcome},
};

#[derive(Debug)]
struct Row {
    request: CommandRequest,
    seq: u64,
}

/// Rows plus the indexes that keep admission and counts cheap: an ordered
/// `(priority, seq)` index over queued rows and counters over active rows.
#[derive(Debug, Default)]
struct Inner {
    rows: HashMap<CommandId, Row>,
    queued: BTreeMap<(i32, u64), CommandId>,
    active_by_work_type: HashMap<WorkType, u64>,
    active_by_batch: HashMap<String, u64>,
    terminal: u64,
    next_seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn insert(&mut self, request: CommandRequest, seq: u64) {
        match request.state {
            CommandState::Queued | CommandState::Running => {
                if request.state == CommandState::Queued {
                    self.queued.insert((request.priority, seq), request.id.clone());
                }
                *self.active_by_work_type.entry(request.work_type).or_insert(0) += 1;
                if let Some(batch) = &request.batch {
                    *self.active_by_batch.entry(batch.clone()).or_insert(0) += 1;
                }
            }
            CommandState::Failed | CommandState::Quarantined => self.terminal += 1,
        }
        self.rows.insert(request.id.clone(), Row { request, seq });
    }

    fn remove(&mut self, id: &CommandId) -> Option<Row> {
        let row = self.rows.remove(id)?;
        let request = &row.request;
        match request.state {
            CommandState::Queued | CommandState::Running => {
                if request.state == CommandState::Queued {
                    self.queued.remove(&(request.priority, row.seq));
                }
                decrement(&mut self.active_by_work_type, &request.work_type);
                if let Some(batch) = &request.batch {
                    decrement(&mut self.active_by_batch, batch);
                }
            }
            CommandState::Failed | CommandState::Quarantined => {
                self.terminal = self.terminal.saturating_sub(1);
            }
        }
        Some(row)
    }

    /// Applies `change` to the row if `allowed` accepts its current state.
    fn transition<F>(&mut self, id: &CommandId, allowed: &[CommandState], change: F) -> bool
    where
        F: FnOnce(&mut CommandRequest),
    {
        let permitted = self
            .rows
            .get(id)
            .is_some_and(|row| allowed.contains(&row.request.state));
        if !permitted {
            return false;
        }
        let Some(Row { mut request, seq }) = self.remove(id) else {
            return false;
        };
        change(&mut request);
        self.insert(request, seq);
        true
    }

    fn remove_where<F>(&mut self, predicate: F) -> u64
    where
        F: Fn(&CommandRequest) -> bool,
    {
        let doomed: Vec<CommandId> = self
            .rows
            .values()
            .filter(|row| predicate(&row.request))
            .map(|row| row.request.id.clone())
            .collect();
        for id in &doomed {
            self.remove(id);
        }
        doomed.len() as u64
    }
}

fn decrement<K>(counts: &mut HashMap<K, u64>, key: &K)
where
    K: std::hash::Hash + Eq,
{
    if let Some(count) = counts.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(key);
        }
    }
}

/// Volatile store for tests and ephemeral deployments. Same semantics as the
/// durable backend, minus durability.
pub struct MemoryCommandStore {
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
}

impl fmt::Debug for MemoryCommandStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = self
            .inner
            .try_read()
            .map(|inner| inner.rows.len())
            .unwrap_or_default();
        f.debug_struct("MemoryCommandStore")
            .field("clock", &self.clock)
            .field("rows", &rows)
            .finish()
    }
}

impl Default for MemoryCommandStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryCommandStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: RwLock::new(Inner::default()),
        }
    }
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    async fn get(&self, query: &AdmissionQuery) -> Result<Vec<CommandRequest>> {
        let now = self.clock.now();
        let inner = self.inner.read().await;
        let mut window = AdmissionWindow::new(query, now);
        for id in inner.queued.values() {
            if window.is_full() {
                break;
            }
            if let Some(row) = inner.rows.get(id)
                && let Err(skip) = window.offer(&row.request)
            {
                trace!(target: "kura::store", command_id = %id, ?skip, "row passed over");
            }
        }
        Ok(window.into_selected())
    }

    async fn put(&self, mut request: CommandRequest, delay: Duration) -> Result<PutOutcome> {
        let now = self.clock.now();
        request.state = CommandState::Queued;
        request.available_at = now + to_chrono(delay);
        request.updated_at = now;

        let mut inner = self.inner.write().await;
        let existing = inner
            .rows
            .get(&request.id)
            .map(|row| (row.request.state, row.seq, row.request.created_at));
        match existing {
            Some((CommandState::Running, _, _)) => Ok(PutOutcome::AlreadyRunning),
            Some((CommandState::Queued, seq, created_at)) => {
                inner.remove(&request.id);
                request.created_at = created_at;
                inner.insert(request, seq);
                Ok(PutOutcome::Replaced)
            }
            Some(_) => {
                inner.remove(&request.id);
                let seq = inner.next_seq();
                inner.insert(request, seq);
                Ok(PutOutcome::Replaced)
            }
            None => {
                let seq = inner.next_seq();
                inner.insert(request, seq);
                Ok(PutOutcome::Inserted)
            }
        }
    }

    async fn find(&self, id: &CommandId) -> Result<Option<CommandRequest>> {
        let inner = self.inner.read().await;
        Ok(inner.rows.get(id).map(|row| row.request.clone()))
    }

    async fn clear_batch(&self, batch: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        Ok(inner.remove_where(|r| r.state.is_active() && r.batch.as_deref() == Some(batch)))
    }

    async fn clear_work_types(&self, work_types: &[WorkType]) -> Result<u64> {
        let mut inner = self.inner.write().await;
        Ok(inner.remove_where(|r| r.state.is_active() && work_types.contains(&r.work_type)))
    }

    async fn clear(&self) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let removed = inner.rows.len() as u64;
        let next_seq = inner.next_seq;
        *inner = Inner {
            next_seq,
            ..Inner::default()
        };
        Ok(removed)
    }

    async fn queued_count(&self, work_types: &[WorkType]) -> Result<u64> {
        let inner = self.inner.read().await;
        let count = if work_types.is_empty() {
            inner.active_by_work_type.values().sum()
        } else {
            work_types
                .iter()
                .filter_map(|work_type| inner.active_by_work_type.get(work_type))
                .sum()
        };
        Ok(count)
    }

    async fn queued_count_for_batch(&self, batch: &str) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner.active_by_batch.get(batch).copied().unwrap_or(0))
    }

    async fn mark_running(&self, id: &CommandId) -> Result<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        Ok(inner.transition(id, &[CommandState::Queued], |request| {
            request.state = CommandState::Running;
            request.updated_at = now;
        }))
    }

    async fn complete(&self, id: &CommandId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let running = inner
            .rows
            .get(id)
            .is_some_and(|row| row.request.state == CommandState::Running);
        if running {
            inner.remove(id);
        }
        Ok(running)
    }

    async fn reschedule(
        &self,
        id: &CommandId,
        delay: Duration,
        error: &str,
        retries: u32,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        Ok(inner.transition(id, &[CommandState::Running], |request| {
            request.state = CommandState::Queued;
            request.retries = retries.min(request.max_retries);
            request.last_error = Some(error.to_owned());
            request.available_at = now + to_chrono(delay);
            request.updated_at = now;
        }))
    }

    async fn defer(&self, id: &CommandId, delay: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        Ok(inner.transition(
            id,
            &[CommandState::Queued, CommandState::Running],
            |request| {
                request.state = CommandState::Queued;
                request.available_at = now + to_chrono(delay);
                request.updated_at = now;
            },
        ))
    }

    async fn fail(&self, id: &CommandId, error: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        Ok(inner.transition(id, &[CommandState::Running], |request| {
            request.state = CommandState::Failed;
            request.last_error = Some(error.to_owned());
            request.updated_at = now;
        }))
    }

    async fn quarantine(&self, id: &CommandId, reason: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        Ok(inner.transition(
            id,
            &[CommandState::Queued, CommandState::Running],
            |request| {
                request.state = CommandState::Quarantined;
                request.last_error = Some(reason.to_owned());
                request.updated_at = now;
            },
        ))
    }

    async fn recover_running(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        let running: Vec<CommandId> = inner
            .rows
            .values()
            .filter(|row| row.request.state == CommandState::Running)
            .map(|row| row.request.id.clone())
            .collect();
        for id in &running {
            inner.transition(id, &[CommandState::Running], |request| {
                request.state = CommandState::Queued;
                request.updated_at = now;
            });
        }
        Ok(running.len() as u64)
    }

    async fn failed_count(&self) -> Result<u64> {
        Ok(self.inner.read().await.terminal)
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<CommandRequest>> {
        let inner = self.inner.read().await;
        let mut failed: Vec<CommandRequest> = inner
            .rows
            .values()
            .filter(|row| !row.request.state.is_active())
            .map(|row| row.request.clone())
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn purge_failed(&self) -> Result<u64> {
        let mut inner = self.inner.write().await;
        Ok(inner.remove_where(|r| !r.state.is_active()))
    }
}
