use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, QueryBuilder, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    admission::{AdmissionQuery, AdmissionWindow},
    clock::Clock,
    command::{CommandId, CommandRequest, CommandState, PrettyDescription, WorkType},
    error::{QueueError, Result},
    precondition::to_chrono,
    store::{CommandStore, PutOutcome},
};

/// Rows fetched per round trip while walking the admission order.
const ADMISSION_PAGE: i64 = 256;

const COLUMNS: &str = "seq, command_id, class_name, work_type, parallel_tag, parallel_max, \
     priority, batch, retries, max_retries, preconditions, data, description, state, \
     available_at, last_error, created_at, updated_at";

#[derive(Debug, FromRow)]
struct CommandRow {
    seq: i64,
    command_id: String,
    class_name: String,
    work_type: String,
    parallel_tag: String,
    parallel_max: Option<i64>,
    priority: i64,
    batch: Option<String>,
    retries: i64,
    max_retries: i64,
    preconditions: String,
    data: String,
    description: String,
    state: String,
    available_at: i64,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<CommandRow> for CommandRequest {
    type Error = QueueError;

    fn try_from(row: CommandRow) -> Result<Self> {
        let corrupt = |reason: String| QueueError::CorruptRow {
            id: row.command_id.clone(),
            reason,
        };
        let work_type =
            WorkType::from_str(&row.work_type).map_err(|err| corrupt(err.to_string()))?;
        let state = CommandState::parse(&row.state)
            .ok_or_else(|| corrupt(format!("unknown state `{}`", row.state)))?;
        let preconditions: Vec<String> = serde_json::from_str(&row.preconditions)
            .map_err(|err| corrupt(format!("preconditions: {err}")))?;
        let description: PrettyDescription = serde_json::from_str(&row.description)
            .map_err(|err| corrupt(format!("description: {err}")))?;
        let instant = |ms: i64| {
            DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| corrupt(format!("timestamp {ms} out of range")))
        };
        let available_at = instant(row.available_at)?;
        let created_at = instant(row.created_at)?;
        let updated_at = instant(row.updated_at)?;

        Ok(CommandRequest {
            id: CommandId::new(row.command_id),
            class_name: row.class_name,
            work_type,
            parallel_tag: row.parallel_tag,
            parallel_max: row
                .parallel_max
                .map(|max| max.clamp(1, i64::from(u32::MAX)) as u32),
            priority: row.priority as i32,
            batch: row.batch,
            retries: row.retries.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            preconditions,
            data: row.data,
            description,
            state,
            available_at,
            last_error: row.last_error,
            created_at,
            updated_at,
        })
    }
}

/// Durable store on SQLite. A single writer is enough: every command is
/// independent, so no transaction spans more than one row except bulk puts
/// and clears.
pub struct SqliteCommandStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SqliteCommandStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteCommandStore")
            .field("pool_size", &self.pool.size())
            .field("clock", &self.clock)
            .finish()
    }
}

impl SqliteCommandStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Opens (creating if needed) the database at `url` and applies pending
    /// migrations. In-memory URLs get a single connection so every query sees
    /// the same database.
    pub async fn connect(url: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self::new(pool, clock);
        store.migrate().await?;
        info!(target: "kura::store", url, "command store ready");
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        crate::MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// Takes a queued row that no longer decodes out of admission, keeping
    /// it for inspection.
    async fn quarantine_corrupt(&self, seq: i64, err: &QueueError) -> Result<()> {
        let reason = err.to_string();
        error!(target: "kura::store", seq, reason = %reason, "quarantining undecodable row");
        sqlx::query(
            "UPDATE command_requests SET state = 'quarantined', last_error = ?, updated_at = ? \
             WHERE seq = ? AND state = 'queued'",
        )
        .bind(&reason)
        .bind(self.now_ms())
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn visible_at_ms(&self, delay: Duration) -> i64 {
        (self.clock.now() + to_chrono(delay)).timestamp_millis()
    }

    async fn put_one(
        &self,
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        request: &CommandRequest,
        available_at: i64,
        now: i64,
    ) -> Result<PutOutcome> {
        let existing: Option<(i64, String)> =
            sqlx::query_as("SELECT seq, state FROM command_requests WHERE command_id = ?")
                .bind(request.id.as_str())
                .fetch_optional(&mut **tx)
                .await?;

        let preconditions = serde_json::to_string(&request.preconditions)?;
        let description = serde_json::to_string(&request.description)?;

        match existing.as_ref().and_then(|(seq, state)| Some((*seq, CommandState::parse(state)?))) {
            Some((_, CommandState::Running)) => return Ok(PutOutcome::AlreadyRunning),
            Some((seq, CommandState::Queued)) => {
                sqlx::query(
                    "UPDATE command_requests SET class_name = ?, work_type = ?, parallel_tag = ?, \
                     parallel_max = ?, priority = ?, batch = ?, retries = ?, max_retries = ?, \
                     preconditions = ?, data = ?, description = ?, available_at = ?, \
                     last_error = ?, updated_at = ? WHERE seq = ?",
                )
                .bind(&request.class_name)
                .bind(request.work_type.as_str())
                .bind(&request.parallel_tag)
                .bind(request.parallel_max.map(i64::from))
                .bind(i64::from(request.priority))
                .bind(request.batch.as_deref())
                .bind(i64::from(request.retries))
                .bind(i64::from(request.max_retries))
                .bind(&preconditions)
                .bind(&request.data)
                .bind(&description)
                .bind(available_at)
                .bind(request.last_error.as_deref())
                .bind(now)
                .bind(seq)
                .execute(&mut **tx)
                .await?;
                return Ok(PutOutcome::Replaced);
            }
            _ => {}
        }

        let outcome = if existing.is_some() {
            sqlx::query("DELETE FROM command_requests WHERE command_id = ?")
                .bind(request.id.as_str())
                .execute(&mut **tx)
                .await?;
            PutOutcome::Replaced
        } else {
            PutOutcome::Inserted
        };

        sqlx::query(
            "INSERT INTO command_requests (command_id, class_name, work_type, parallel_tag, \
             parallel_max, priority, batch, retries, max_retries, preconditions, data, \
             description, state, available_at, last_error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'queued', ?, ?, ?, ?)",
        )
        .bind(request.id.as_str())
        .bind(&request.class_name)
        .bind(request.work_type.as_str())
        .bind(&request.parallel_tag)
        .bind(request.parallel_max.map(i64::from))
        .bind(i64::from(request.priority))
        .bind(request.batch.as_deref())
        .bind(i64::from(request.retries))
        .bind(i64::from(request.max_retries))
        .bind(&preconditions)
        .bind(&request.data)
        .bind(&description)
        .bind(available_at)
        .bind(request.last_error.as_deref())
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(outcome)
    }
}

#[async_trait]
impl CommandStore for SqliteCommandStore {
    async fn get(&self, query: &AdmissionQuery) -> Result<Vec<CommandRequest>> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let mut window = AdmissionWindow::new(query, now);
        let mut cursor: (i64, i64) = (i64::MIN, i64::MIN);

        let sql = format!(
            "SELECT {COLUMNS} FROM command_requests \
             WHERE state = 'queued' AND available_at <= ? \
               AND (priority > ? OR (priority = ? AND seq > ?)) \
             ORDER BY priority, seq LIMIT ?"
        );

        while !window.is_full() {
            let rows: Vec<CommandRow> = sqlx::query_as(&sql)
                .bind(now_ms)
                .bind(cursor.0)
                .bind(cursor.0)
                .bind(cursor.1)
                .bind(ADMISSION_PAGE)
                .fetch_all(&self.pool)
                .await?;
            let exhausted = (rows.len() as i64) < ADMISSION_PAGE;

            for row in rows {
                cursor = (row.priority, row.seq);
                let seq = row.seq;
                let request = match CommandRequest::try_from(row) {
                    Ok(request) => request,
                    Err(err) => {
                        self.quarantine_corrupt(seq, &err).await?;
                        continue;
                    }
                };
                if let Err(skip) = window.offer(&request) {
                    trace!(
                        target: "kura::store",
                        command_id = %request.id,
                        ?skip,
                        "row passed over"
                    );
                }
                if window.is_full() {
                    break;
                }
            }

            if exhausted {
                break;
            }
        }

        Ok(window.into_selected())
    }

    async fn put(&self, request: CommandRequest, delay: Duration) -> Result<PutOutcome> {
        let now = self.now_ms();
        let available_at = self.visible_at_ms(delay);
        let mut tx = self.pool.begin().await?;
        let outcome = self.put_one(&mut tx, &request, available_at, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn put_range(
        &self,
        requests: Vec<CommandRequest>,
        delay: Duration,
    ) -> Result<Vec<PutOutcome>> {
        let now = self.now_ms();
        let available_at = self.visible_at_ms(delay);
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in &requests {
            outcomes.push(self.put_one(&mut tx, request, available_at, now).await?);
        }
        tx.commit().await?;
        debug!(target: "kura::store", count = outcomes.len(), "bulk put committed");
        Ok(outcomes)
    }

    async fn find(&self, id: &CommandId) -> Result<Option<CommandRequest>> {
        let sql = format!("SELECT {COLUMNS} FROM command_requests WHERE command_id = ?");
        let row: Option<CommandRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(CommandRequest::try_from).transpose()
    }

    async fn clear_batch(&self, batch: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM command_requests WHERE batch = ? AND state IN ('queued', 'running')",
        )
        .bind(batch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clear_work_types(&self, work_types: &[WorkType]) -> Result<u64> {
        if work_types.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::<Sqlite>::new(
            "DELETE FROM command_requests WHERE state IN ('queued', 'running') AND work_type IN (",
        );
        let mut separated = builder.separated(", ");
        for work_type in work_types {
            separated.push_bind(work_type.as_str());
        }
        separated.push_unseparated(")");
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM command_requests")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn queued_count(&self, work_types: &[WorkType]) -> Result<u64> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM command_requests WHERE state IN ('queued', 'running')",
        );
        if !work_types.is_empty() {
            builder.push(" AND work_type IN (");
            let mut separated = builder.separated(", ");
            for work_type in work_types {
                separated.push_bind(work_type.as_str());
            }
            separated.push_unseparated(")");
        }
        let count = builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn queued_count_for_batch(&self, batch: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM command_requests \
             WHERE batch = ? AND state IN ('queued', 'running')",
        )
        .bind(batch)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn mark_running(&self, id: &CommandId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE command_requests SET state = 'running', updated_at = ? \
             WHERE command_id = ? AND state = 'queued'",
        )
        .bind(self.now_ms())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, id: &CommandId) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM command_requests WHERE command_id = ? AND state = 'running'")
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reschedule(
        &self,
        id: &CommandId,
        delay: Duration,
        error: &str,
        retries: u32,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE command_requests SET state = 'queued', retries = MIN(?, max_retries), \
             last_error = ?, available_at = ?, updated_at = ? \
             WHERE command_id = ? AND state = 'running'",
        )
        .bind(i64::from(retries))
        .bind(error)
        .bind(self.visible_at_ms(delay))
        .bind(self.now_ms())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn defer(&self, id: &CommandId, delay: Duration) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE command_requests SET state = 'queued', available_at = ?, updated_at = ? \
             WHERE command_id = ? AND state IN ('queued', 'running')",
        )
        .bind(self.visible_at_ms(delay))
        .bind(self.now_ms())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail(&self, id: &CommandId, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE command_requests SET state = 'failed', last_error = ?, updated_at = ? \
             WHERE command_id = ? AND state = 'running'",
        )
        .bind(error)
        .bind(self.now_ms())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn quarantine(&self, id: &CommandId, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE command_requests SET state = 'quarantined', last_error = ?, updated_at = ? \
             WHERE command_id = ? AND state IN ('queued', 'running')",
        )
        .bind(reason)
        .bind(self.now_ms())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn recover_running(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE command_requests SET state = 'queued', updated_at = ? WHERE state = 'running'",
        )
        .bind(self.now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn failed_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM command_requests WHERE state IN ('failed', 'quarantined')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<CommandRequest>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM command_requests WHERE state IN ('failed', 'quarantined') \
             ORDER BY updated_at DESC, command_id LIMIT ?"
        );
        let rows: Vec<CommandRow> = sqlx::query_as(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut failed = Vec::with_capacity(rows.len());
        for row in rows {
            match CommandRequest::try_from(row) {
                Ok(request) => failed.push(request),
                Err(err) => {
                    warn!(target: "kura::store", error = %err, "failed row cannot be listed")
                }
            }
        }
        Ok(failed)
    }

    async fn purge_failed(&self) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM command_requests WHERE state IN ('failed', 'quarantined')")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
