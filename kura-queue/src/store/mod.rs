//! Durable queue contract and its backends.
//!
//! A store owns persisted rows. Only three durable transitions exist:
//! `Queued` on put, `Running` once committed by [`CommandStore::mark_running`],
//! and terminal (deleted, `Failed` or `Quarantined`). Admission itself is a
//! read; nothing is lost if the process dies between [`CommandStore::get`] and
//! the start of execution.

use std::{fmt, time::Duration};

use async_trait::async_trait;

use crate::{
    admission::AdmissionQuery,
    command::{CommandId, CommandRequest, WorkType},
    error::Result,
};

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryCommandStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCommandStore;

/// Result of putting a row whose id may already exist.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PutOutcome {
    Inserted,
    /// A queued (or terminal) row with the same id was overwritten in place.
    /// Queued rows keep their original insertion position.
    Replaced,
    /// The id is executing right now; the put was ignored.
    AlreadyRunning,
}

#[async_trait]
pub trait CommandStore: Send + Sync + fmt::Debug {
    /// Previews up to `query.quantity` runnable rows in priority then
    /// insertion order. Never changes persisted state.
    async fn get(&self, query: &AdmissionQuery) -> Result<Vec<CommandRequest>>;

    /// Inserts or replaces a row; it becomes visible after `delay`.
    async fn put(&self, request: CommandRequest, delay: Duration) -> Result<PutOutcome>;

    /// Bulk insert sharing one delay. Implementations backed by a
    /// transactional store should insert all rows atomically.
    async fn put_range(
        &self,
        requests: Vec<CommandRequest>,
        delay: Duration,
    ) -> Result<Vec<PutOutcome>> {
        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            out.push(self.put(request, delay).await?);
        }
        Ok(out)
    }

    async fn find(&self, id: &CommandId) -> Result<Option<CommandRequest>>;

    /// Removes queued and running rows carrying `batch`.
    async fn clear_batch(&self, batch: &str) -> Result<u64>;

    /// Removes queued and running rows of the given work types.
    async fn clear_work_types(&self, work_types: &[WorkType]) -> Result<u64>;

    /// Removes every row, terminal ones included.
    async fn clear(&self) -> Result<u64>;

    /// Outstanding (queued or running) rows; an empty slice counts all work
    /// types.
    async fn queued_count(&self, work_types: &[WorkType]) -> Result<u64>;

    async fn queued_count_for_batch(&self, batch: &str) -> Result<u64>;

    /// `Queued -> Running`. Returns false when the row vanished or is not
    /// queued anymore, in which case the caller must not run it.
    async fn mark_running(&self, id: &CommandId) -> Result<bool>;

    /// Deletes a running row after success.
    async fn complete(&self, id: &CommandId) -> Result<bool>;

    /// `Running -> Queued` with a new retry count and visibility delay.
    /// Returns false when the row was cleared while it ran.
    async fn reschedule(
        &self,
        id: &CommandId,
        delay: Duration,
        error: &str,
        retries: u32,
    ) -> Result<bool>;

    /// Pushes visibility out without touching retries. Running rows are
    /// returned to `Queued`.
    async fn defer(&self, id: &CommandId, delay: Duration) -> Result<bool>;

    /// `Running -> Failed`, retained for inspection.
    async fn fail(&self, id: &CommandId, error: &str) -> Result<bool>;

    /// Parks an undispatchable row as `Quarantined`.
    async fn quarantine(&self, id: &CommandId, reason: &str) -> Result<bool>;

    /// Returns rows left `Running` by a previous process to `Queued`.
    async fn recover_running(&self) -> Result<u64>;

    /// Rows in `Failed` or `Quarantined`.
    async fn failed_count(&self) -> Result<u64>;

    async fn list_failed(&self, limit: usize) -> Result<Vec<CommandRequest>>;

    async fn purge_failed(&self) -> Result<u64>;
}
