//! Fixtures shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        Arc, LazyLock, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::SystemClock,
    command::{
        Command, CommandError, CommandId, CommandRequest, CommandState, CommandType,
        PrettyDescription, ScheduledCommand, WorkType,
    },
    precondition::{BanPrecondition, Precondition, PreconditionResult},
    progress::ProgressReporter,
    registry::CommandRegistry,
};

/// Bare row for store and admission tests.
pub(crate) fn request(
    id: &str,
    tag: &str,
    parallel_max: Option<u32>,
    priority: i32,
    now: DateTime<Utc>,
) -> CommandRequest {
    CommandRequest {
        id: CommandId::new(id),
        class_name: "HashFile".into(),
        work_type: WorkType::Server,
        parallel_tag: tag.into(),
        parallel_max,
        priority,
        batch: None,
        retries: 0,
        max_retries: 3,
        preconditions: Vec::new(),
        data: "{}".into(),
        description: PrettyDescription::new("test"),
        state: CommandState::Queued,
        available_at: now,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct GetAnimeFull {
    pub anime_id: u32,
    pub force_refresh: bool,
    #[serde(skip)]
    pub cached_title: Option<String>,
}

impl GetAnimeFull {
    pub fn new(anime_id: u32) -> Self {
        Self {
            anime_id,
            force_refresh: true,
            cached_title: None,
        }
    }
}

#[async_trait]
impl Command for GetAnimeFull {
    fn id(&self) -> CommandId {
        CommandId::new(format!("GetAnimeFull_{}", self.anime_id))
    }

    fn work_type(&self) -> WorkType {
        WorkType::AniDb
    }

    fn parallel_max(&self) -> Option<u32> {
        Some(1)
    }

    fn priority(&self) -> i32 {
        3
    }

    fn preconditions(&self) -> &'static [&'static str] {
        &["AniDbHttpBan"]
    }

    fn pretty_description(&self) -> PrettyDescription {
        PrettyDescription::new("command.anidb.get_anime").with_param(self.anime_id.to_string())
    }

    async fn run(
        &self,
        _progress: &ProgressReporter,
        _cancel: &CancellationToken,
    ) -> Result<(), CommandError> {
        Ok(())
    }
}

impl CommandType for GetAnimeFull {
    const CLASS_NAME: &'static str = "GetAnimeFull";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct HashFile {
    pub path: String,
}

impl HashFile {
    pub fn new(path: &str) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Command for HashFile {
    fn id(&self) -> CommandId {
        CommandId::new(format!("HashFile_{}", self.path))
    }

    fn work_type(&self) -> WorkType {
        WorkType::Hashing
    }

    async fn run(
        &self,
        progress: &ProgressReporter,
        _cancel: &CancellationToken,
    ) -> Result<(), CommandError> {
        progress.update(50.0);
        Ok(())
    }
}

impl CommandType for HashFile {
    const CLASS_NAME: &'static str = "HashFile";
}

/// Implements [`Command`] but is never registered.
#[derive(Debug)]
pub(crate) struct Orphan;

#[async_trait]
impl Command for Orphan {
    fn id(&self) -> CommandId {
        CommandId::new("Orphan_1")
    }

    fn work_type(&self) -> WorkType {
        WorkType::Server
    }

    async fn run(
        &self,
        _progress: &ProgressReporter,
        _cancel: &CancellationToken,
    ) -> Result<(), CommandError> {
        Ok(())
    }
}

/// Precondition that counts evaluations and opens on demand.
#[derive(Debug, Default)]
pub(crate) struct CountingGate {
    evaluations: AtomicUsize,
    closed: AtomicBool,
}

impl CountingGate {
    pub fn closed() -> Self {
        Self {
            evaluations: AtomicUsize::new(0),
            closed: AtomicBool::new(true),
        }
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }
}

impl Precondition for CountingGate {
    fn can_execute(&self) -> PreconditionResult {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            PreconditionResult::retry_in(Duration::from_secs(1))
        } else {
            PreconditionResult::ready()
        }
    }
}

pub(crate) fn registry_with_gate(gate: Arc<dyn Precondition>) -> CommandRegistry {
    CommandRegistry::builder()
        .command::<GetAnimeFull>()
        .command::<HashFile>()
        .command::<ScriptedCommand>()
        .precondition("AniDbHttpBan", Arc::new(BanPrecondition::new(Arc::new(SystemClock))))
        .precondition("ScriptGate", gate)
        .build()
        .expect("fixture registry")
}

pub(crate) fn fixture_registry() -> CommandRegistry {
    registry_with_gate(Arc::new(CountingGate::default()))
}

pub(crate) fn scheduled(
    registry: &CommandRegistry,
    command: &dyn Command,
    batch: Option<&str>,
) -> ScheduledCommand {
    let request = registry
        .to_request(command, batch, 0, 3, Utc::now())
        .expect("request");
    registry.to_command(request).expect("scheduled command")
}

/// Shared observation point for [`ScriptedCommand`]s. Commands are rebuilt from
/// their payload, so they find their recorder by name.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    state: Mutex<RecorderState>,
}

#[derive(Debug, Default)]
struct RecorderState {
    running: HashMap<String, u32>,
    max_seen: HashMap<String, u32>,
    attempts: HashMap<u32, u32>,
    completed: Vec<u32>,
    cancelled: Vec<u32>,
}

static RECORDERS: LazyLock<Mutex<HashMap<String, Arc<Recorder>>>> =
    LazyLock::new(Default::default);

pub(crate) fn recorder(name: &str) -> Arc<Recorder> {
    let mut recorders = RECORDERS.lock().expect("recorder registry");
    Arc::clone(recorders.entry(name.to_owned()).or_default())
}

impl Recorder {
    fn state(&self) -> std::sync::MutexGuard<'_, RecorderState> {
        self.state.lock().expect("recorder state")
    }

    /// Bodies currently executing on `tag`.
    pub fn running(&self, tag: &str) -> u32 {
        self.state().running.get(tag).copied().unwrap_or(0)
    }

    pub fn max_seen(&self, tag: &str) -> u32 {
        self.state().max_seen.get(tag).copied().unwrap_or(0)
    }

    pub fn attempts(&self, key: u32) -> u32 {
        self.state().attempts.get(&key).copied().unwrap_or(0)
    }

    pub fn completed(&self) -> Vec<u32> {
        self.state().completed.clone()
    }

    pub fn cancelled(&self) -> Vec<u32> {
        self.state().cancelled.clone()
    }

    fn enter(self: &Arc<Self>, tag: &str, key: u32) -> Visit {
        let mut state = self.state();
        let running = {
            let count = state.running.entry(tag.to_owned()).or_insert(0);
            *count += 1;
            *count
        };
        let max = state.max_seen.entry(tag.to_owned()).or_insert(0);
        *max = (*max).max(running);
        *state.attempts.entry(key).or_insert(0) += 1;
        Visit {
            recorder: Arc::clone(self),
            tag: tag.to_owned(),
        }
    }
}

struct Visit {
    recorder: Arc<Recorder>,
    tag: String,
}

impl Drop for Visit {
    fn drop(&mut self) {
        if let Ok(mut state) = self.recorder.state.lock()
            && let Some(count) = state.running.get_mut(&self.tag)
        {
            *count = count.saturating_sub(1);
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) enum Behavior {
    Succeed,
    Transient,
    Fatal,
    Panic,
    WaitForCancel,
}

/// Instrumented command reporting to a named [`Recorder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ScriptedCommand {
    recorder: String,
    key: u32,
    tag: String,
    max: Option<u32>,
    priority: i32,
    behavior: Behavior,
    hold_ms: u64,
    max_retries: Option<u32>,
    gated: bool,
}

impl ScriptedCommand {
    pub fn new(recorder: &str, key: u32) -> Self {
        Self {
            recorder: recorder.to_owned(),
            key,
            tag: "Scripted".into(),
            max: None,
            priority: 5,
            behavior: Behavior::Succeed,
            hold_ms: 0,
            max_retries: None,
            gated: false,
        }
    }

    pub fn tag(mut self, tag: &str, max: Option<u32>) -> Self {
        self.tag = tag.to_owned();
        self.max = max;
        self
    }

    pub fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn hold(mut self, ms: u64) -> Self {
        self.hold_ms = ms;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }
}

#[async_trait]
impl Command for ScriptedCommand {
    fn id(&self) -> CommandId {
        CommandId::new(format!("Scripted_{}_{}", self.recorder, self.key))
    }

    fn work_type(&self) -> WorkType {
        WorkType::Server
    }

    fn parallel_tag(&self) -> String {
        self.tag.clone()
    }

    fn parallel_max(&self) -> Option<u32> {
        self.max
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    fn preconditions(&self) -> &'static [&'static str] {
        if self.gated { &["ScriptGate"] } else { &[] }
    }

    async fn run(
        &self,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), CommandError> {
        let recorder = recorder(&self.recorder);
        let _visit = recorder.enter(&self.tag, self.key);
        if self.hold_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.hold_ms)).await;
        }
        progress.update(50.0);

        match self.behavior {
            Behavior::Succeed => {
                recorder.state().completed.push(self.key);
                Ok(())
            }
            Behavior::Transient => Err(CommandError::transient("remote timed out")),
            Behavior::Fatal => Err(CommandError::fatal("file vanished")),
            Behavior::Panic => panic!("command exploded"),
            Behavior::WaitForCancel => {
                cancel.cancelled().await;
                recorder.state().cancelled.push(self.key);
                Err(CommandError::Cancelled)
            }
        }
    }
}

impl CommandType for ScriptedCommand {
    const CLASS_NAME: &'static str = "ScriptedCommand";
}
