use std::{fmt, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    command::{Command, CommandRequest, WorkType},
    dispatcher::{inflight::InflightInfo, runtime::Shared},
    error::Result,
    events::{ClearScope, QueueEvent, QueueEventPayload},
    store::PutOutcome,
};

/// How a command is enqueued.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PutOptions {
    /// Label for bulk cancellation.
    pub batch: Option<String>,
    /// Invisible to admission until this has elapsed.
    pub delay: Duration,
    /// Diagnostic recorded with the row.
    pub error: Option<String>,
    /// Seeds the retry counter; capped at the command's budget.
    pub retries: u32,
}

impl PutOptions {
    pub fn in_batch(mut self, batch: impl Into<String>) -> Self {
        self.batch = Some(batch.into());
        self
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Point-in-time view for status pages and the admin CLI.
#[derive(Clone, Debug, Serialize)]
pub struct QueueSnapshot {
    pub queued: u64,
    pub failed: u64,
    pub running: Vec<InflightInfo>,
    pub paused: bool,
    pub disabled_work_types: Vec<WorkType>,
}

/// Cloneable producer and admin surface of a running queue. Every method is
/// safe to call concurrently with the dispatcher.
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle")
            .field("shared", &self.shared)
            .finish()
    }
}

impl QueueHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn request(&self, command: &dyn Command, options: &PutOptions) -> Result<CommandRequest> {
        let mut request = self.shared.registry.to_request(
            command,
            options.batch.as_deref(),
            options.retries,
            self.shared.config.default_max_retries,
            self.shared.clock.now(),
        )?;
        request.last_error = options.error.clone();
        Ok(request)
    }

    fn enqueued(&self, request: &CommandRequest, outcome: PutOutcome) {
        if outcome == PutOutcome::AlreadyRunning {
            return;
        }
        self.shared.publish(QueueEventPayload::Enqueued {
            command_id: request.id.clone(),
            class_name: request.class_name.clone(),
            work_type: request.work_type,
            batch: request.batch.clone(),
            replaced: outcome == PutOutcome::Replaced,
        });
    }

    pub async fn put(&self, command: &dyn Command, options: PutOptions) -> Result<PutOutcome> {
        let request = self.request(command, &options)?;
        let outcome = self.shared.store.put(request.clone(), options.delay).await?;
        self.enqueued(&request, outcome);
        if options.delay.is_zero() {
            self.shared.wake.notify_one();
        }
        Ok(outcome)
    }

    /// Enqueues many commands sharing one batch and delay. The commands may
    /// be of different types; either all are stored or none are.
    pub async fn put_range<'c, I>(
        &self,
        commands: I,
        options: PutOptions,
    ) -> Result<Vec<PutOutcome>>
    where
        I: IntoIterator<Item = &'c dyn Command>,
    {
        let requests = commands
            .into_iter()
            .map(|command| self.request(command, &options))
            .collect::<Result<Vec<_>>>()?;
        let outcomes = self
            .shared
            .store
            .put_range(requests.clone(), options.delay)
            .await?;
        for (request, outcome) in requests.iter().zip(&outcomes) {
            self.enqueued(request, *outcome);
        }
        if options.delay.is_zero() {
            self.shared.wake.notify_one();
        }
        Ok(outcomes)
    }

    /// Removes every queued row of `batch` and cancels its running commands.
    /// Results they report afterwards are discarded.
    pub async fn clear_batch(&self, batch: &str) -> Result<u64> {
        self.clear_scope(ClearScope::Batch(batch.to_owned())).await
    }

    pub async fn clear_work_types(&self, work_types: &[WorkType]) -> Result<u64> {
        if work_types.is_empty() {
            return Ok(0);
        }
        self.clear_scope(ClearScope::WorkTypes(work_types.to_vec()))
            .await
    }

    pub async fn clear(&self) -> Result<u64> {
        self.clear_scope(ClearScope::All).await
    }

    async fn clear_scope(&self, scope: ClearScope) -> Result<u64> {
        let (fence, cancelled) = self.shared.inflight.fence(scope.clone());
        let removed = match &scope {
            ClearScope::Batch(batch) => self.shared.store.clear_batch(batch).await?,
            ClearScope::WorkTypes(types) => self.shared.store.clear_work_types(types).await?,
            ClearScope::All => self.shared.store.clear().await?,
        };
        drop(fence);

        info!(target: "kura::queue", ?scope, removed, cancelled, "queue cleared");
        self.shared.publish(QueueEventPayload::Cleared { scope, removed });
        Ok(removed)
    }

    /// Stops admitting new commands. Running ones are left alone.
    pub fn pause(&self) {
        self.shared.controls().paused = true;
        info!(target: "kura::queue", "queue paused");
    }

    pub fn resume(&self) {
        self.shared.controls().paused = false;
        info!(target: "kura::queue", "queue resumed");
        self.shared.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.controls().paused
    }

    /// Keeps `work_type` out of admission until re-enabled. Queued rows stay.
    pub fn disable_work_type(&self, work_type: WorkType) {
        self.shared.controls().disabled.insert(work_type);
        info!(target: "kura::queue", %work_type, "work type disabled");
    }

    pub fn enable_work_type(&self, work_type: WorkType) {
        let removed = self.shared.controls().disabled.remove(&work_type);
        if removed {
            info!(target: "kura::queue", %work_type, "work type enabled");
            self.shared.wake.notify_one();
        }
    }

    pub fn disabled_work_types(&self) -> Vec<WorkType> {
        let mut types: Vec<WorkType> = self.shared.controls().disabled.iter().copied().collect();
        types.sort();
        types
    }

    pub async fn queued_count(&self, work_types: &[WorkType]) -> Result<u64> {
        self.shared.store.queued_count(work_types).await
    }

    pub async fn queued_count_for_batch(&self, batch: &str) -> Result<u64> {
        self.shared.store.queued_count_for_batch(batch).await
    }

    pub async fn failed_count(&self) -> Result<u64> {
        self.shared.store.failed_count().await
    }

    pub async fn list_failed(&self, limit: usize) -> Result<Vec<CommandRequest>> {
        self.shared.store.list_failed(limit).await
    }

    pub fn running(&self) -> usize {
        self.shared.inflight.len()
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        Ok(QueueSnapshot {
            queued: self.shared.store.queued_count(&[]).await?,
            failed: self.shared.store.failed_count().await?,
            running: self.shared.inflight.snapshot(),
            paused: self.is_paused(),
            disabled_work_types: self.disabled_work_types(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }
}
