//! Command model: the unit of background work, its persisted row, and the
//! outcome reported back to the store.
//!
//! A command is a plain value (its payload fields) plus an async `run`. The
//! scheduling metadata (id, tag, priority, batch, retries) travels beside the
//! payload in a [`CommandRequest`] so the store never needs to understand the
//! payload itself.

use std::{any::Any, fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressReporter;

/// Priority used when a command does not pick one. Lower runs first.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Stable identity of a logical piece of work, e.g. `SendAnimeFull_12345`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CommandId(pub String);

impl CommandId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommandId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for CommandId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Coarse resource/provider classification. Used for bulk enable/disable and
/// as the default concurrency domain.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum WorkType {
    #[serde(rename = "AniDB")]
    AniDb,
    Hashing,
    Image,
    Server,
    Trakt,
    #[serde(rename = "TvDB")]
    TvDb,
    MovieDb,
    Plex,
}

impl WorkType {
    pub const ALL: [WorkType; 8] = [
        WorkType::AniDb,
        WorkType::Hashing,
        WorkType::Image,
        WorkType::Server,
        WorkType::Trakt,
        WorkType::TvDb,
        WorkType::MovieDb,
        WorkType::Plex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkType::AniDb => "AniDB",
            WorkType::Hashing => "Hashing",
            WorkType::Image => "Image",
            WorkType::Server => "Server",
            WorkType::Trakt => "Trakt",
            WorkType::TvDb => "TvDB",
            WorkType::MovieDb => "MovieDb",
            WorkType::Plex => "Plex",
        }
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown work type `{0}`")]
pub struct UnknownWorkType(pub String);

impl FromStr for WorkType {
    type Err = UnknownWorkType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkType::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownWorkType(s.to_owned()))
    }
}

/// Display-only description; a localisation key plus its parameters.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PrettyDescription {
    pub key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
}

impl PrettyDescription {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }
}

impl fmt::Display for PrettyDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            f.write_str(&self.key)
        } else {
            write!(f, "{} ({})", self.key, self.params.join(", "))
        }
    }
}

/// The unit of work. Implementors are value objects; everything they need to
/// rebuild themselves lives in their serde representation.
///
/// Only fields that take part in the serde representation are persisted.
/// Runtime-only state (handles, caches, resolved entities) must be marked
/// `#[serde(skip)]` and rebuilt inside [`Command::run`].
#[async_trait]
pub trait Command: Any + Send + Sync + fmt::Debug {
    /// Deterministic identity derived from the command's semantic key.
    fn id(&self) -> CommandId;

    fn work_type(&self) -> WorkType;

    /// Concurrency domain. Defaults to the work type name.
    fn parallel_tag(&self) -> String {
        self.work_type().as_str().to_owned()
    }

    /// Maximum simultaneous executions sharing [`Command::parallel_tag`].
    /// `None` means unbounded.
    fn parallel_max(&self) -> Option<u32> {
        None
    }

    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    /// Per-command retry budget; `None` falls back to the queue default.
    fn max_retries(&self) -> Option<u32> {
        None
    }

    /// Registered precondition names gating this command.
    fn preconditions(&self) -> &'static [&'static str] {
        &[]
    }

    fn pretty_description(&self) -> PrettyDescription {
        PrettyDescription::new(std::any::type_name::<Self>())
    }

    async fn run(
        &self,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), CommandError>;
}

/// Static side of a command: the stable class name used as the registry key.
pub trait CommandType: Command + Serialize + DeserializeOwned + Sized {
    const CLASS_NAME: &'static str;
}

/// Durable lifecycle of a persisted row. `Admitted` never reaches the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CommandState {
    Queued,
    Running,
    Failed,
    Quarantined,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Queued => "queued",
            CommandState::Running => "running",
            CommandState::Failed => "failed",
            CommandState::Quarantined => "quarantined",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(CommandState::Queued),
            "running" => Some(CommandState::Running),
            "failed" => Some(CommandState::Failed),
            "quarantined" => Some(CommandState::Quarantined),
            _ => None,
        }
    }

    /// Rows still counted as outstanding work.
    pub fn is_active(&self) -> bool {
        matches!(self, CommandState::Queued | CommandState::Running)
    }
}

/// Persisted form of a command: scheduling metadata plus the opaque payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: CommandId,
    pub class_name: String,
    pub work_type: WorkType,
    pub parallel_tag: String,
    pub parallel_max: Option<u32>,
    pub priority: i32,
    pub batch: Option<String>,
    pub retries: u32,
    pub max_retries: u32,
    pub preconditions: Vec<String>,
    pub data: String,
    pub description: PrettyDescription,
    pub state: CommandState,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommandRequest {
    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        self.state == CommandState::Queued && self.available_at <= now
    }
}

/// A command rebuilt from its row, carrying the row's scheduling metadata.
#[derive(Clone)]
pub struct ScheduledCommand {
    request: CommandRequest,
    command: Arc<dyn Command>,
}

impl fmt::Debug for ScheduledCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledCommand")
            .field("id", &self.request.id)
            .field("class_name", &self.request.class_name)
            .field("parallel_tag", &self.request.parallel_tag)
            .field("priority", &self.request.priority)
            .field("retries", &self.request.retries)
            .field("command", &self.command)
            .finish()
    }
}

impl ScheduledCommand {
    pub(crate) fn new(request: CommandRequest, command: Arc<dyn Command>) -> Self {
        Self { request, command }
    }

    pub fn id(&self) -> &CommandId {
        &self.request.id
    }

    pub fn class_name(&self) -> &str {
        &self.request.class_name
    }

    pub fn work_type(&self) -> WorkType {
        self.request.work_type
    }

    pub fn parallel_tag(&self) -> &str {
        &self.request.parallel_tag
    }

    pub fn parallel_max(&self) -> Option<u32> {
        self.request.parallel_max
    }

    pub fn priority(&self) -> i32 {
        self.request.priority
    }

    pub fn batch(&self) -> Option<&str> {
        self.request.batch.as_deref()
    }

    pub fn retries(&self) -> u32 {
        self.request.retries
    }

    pub fn max_retries(&self) -> u32 {
        self.request.max_retries
    }

    pub fn preconditions(&self) -> &[String] {
        &self.request.preconditions
    }

    pub fn request(&self) -> &CommandRequest {
        &self.request
    }

    pub fn command(&self) -> &Arc<dyn Command> {
        &self.command
    }

    pub fn downcast_ref<T: Command>(&self) -> Option<&T> {
        let any: &dyn Any = self.command.as_ref();
        any.downcast_ref::<T>()
    }
}

/// Failure raised from a command body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Worth retrying after backoff (timeouts, bans, flaky I/O).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying cannot help; the command fails terminally right away.
    #[error("fatal failure: {0}")]
    Fatal(String),

    #[error("command cancelled")]
    Cancelled,

    /// Every failure of a set of concurrently awaited sub-operations.
    #[error("{} concurrent failures: {}", .0.len(), join_failures(.0))]
    Aggregate(Vec<CommandError>),
}

fn join_failures(errors: &[CommandError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CommandError {
    pub fn transient(msg: impl Into<String>) -> Self {
        CommandError::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        CommandError::Fatal(msg.into())
    }

    /// Collapses a set of failures: none yields `None`, a single failure is
    /// returned as itself, several become one flattened `Aggregate`.
    pub fn from_failures<I>(failures: I) -> Option<CommandError>
    where
        I: IntoIterator<Item = CommandError>,
    {
        let mut flat = Vec::new();
        for failure in failures {
            match failure {
                CommandError::Aggregate(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(CommandError::Aggregate(flat)),
        }
    }

    /// Leaf failures in the order they were collected.
    pub fn failures(&self) -> Vec<&CommandError> {
        match self {
            CommandError::Aggregate(inner) => inner.iter().flat_map(|e| e.failures()).collect(),
            other => vec![other],
        }
    }

    /// An aggregate is retryable when nothing in it is fatal and at least one
    /// member is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            CommandError::Transient(_) => true,
            CommandError::Fatal(_) | CommandError::Cancelled => false,
            CommandError::Aggregate(_) => {
                let leaves = self.failures();
                !leaves.iter().any(|e| matches!(e, CommandError::Fatal(_)))
                    && leaves.iter().any(|e| matches!(e, CommandError::Transient(_)))
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            CommandError::Cancelled => true,
            CommandError::Aggregate(_) => self
                .failures()
                .iter()
                .all(|e| matches!(e, CommandError::Cancelled)),
            _ => false,
        }
    }
}

impl From<std::io::Error> for CommandError {
    fn from(err: std::io::Error) -> Self {
        CommandError::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(err: serde_json::Error) -> Self {
        CommandError::Fatal(err.to_string())
    }
}

/// Awaits every future concurrently and reports all failures, not just the
/// first one.
pub async fn join_all_failures<I, F>(futures: I) -> Result<(), CommandError>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<(), CommandError>>,
{
    let outcomes = futures::future::join_all(futures).await;
    match CommandError::from_failures(outcomes.into_iter().filter_map(Result::err)) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Synchronous convenience wrapper over [`Command::run`]. The command's own
/// error is returned untouched.
///
/// Blocks the calling thread; never call it from inside an async task.
pub fn run_blocking(
    command: &dyn Command,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<(), CommandError> {
    futures::executor::block_on(command.run(progress, cancel))
}

/// Terminal result of one execution, fed back into the store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandResult {
    Completed,
    Retry { error: String },
    Failed { error: String },
    Cancelled,
}

impl CommandResult {
    pub fn from_run(outcome: Result<(), CommandError>) -> Self {
        match outcome {
            Ok(()) => CommandResult::Completed,
            Err(err) if err.is_cancelled() => CommandResult::Cancelled,
            Err(err) if err.is_retryable() => CommandResult::Retry {
                error: err.to_string(),
            },
            Err(err) => CommandResult::Failed {
                error: err.to_string(),
            },
        }
    }

    pub fn needs_retry(&self) -> bool {
        matches!(self, CommandResult::Retry { .. })
    }
}
