use std::{
    any::Any,
    collections::HashSet,
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::FutureExt;
use tokio::{
    sync::{Mutex as AsyncMutex, Notify, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use crate::{
    admission::AdmissionQuery,
    backoff::retry_delay,
    clock::{Clock, SystemClock},
    command::{CommandError, CommandId, CommandResult, ScheduledCommand, WorkType},
    config::QueueConfig,
    dispatcher::{
        handle::QueueHandle,
        inflight::{InflightSlot, InflightTable},
    },
    error::Result,
    events::{QueueEvent, QueueEventBus, QueueEventPayload, RunId},
    precondition::{GateVerdict, PreconditionGate},
    progress::{CommandProgress, ProgressReporter, ProgressSink},
    registry::CommandRegistry,
    store::CommandStore,
};

/// Operator switches consulted on every tick.
#[derive(Debug, Default)]
pub(crate) struct Controls {
    pub(crate) paused: bool,
    pub(crate) disabled: HashSet<WorkType>,
}

/// State shared by the poll loop, the workers and every [`QueueHandle`].
pub(crate) struct Shared {
    pub(crate) config: QueueConfig,
    pub(crate) store: Arc<dyn CommandStore>,
    pub(crate) registry: Arc<CommandRegistry>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: Arc<QueueEventBus>,
    pub(crate) inflight: Arc<InflightTable>,
    controls: Mutex<Controls>,
    pub(crate) wake: Notify,
    gate: Mutex<PreconditionGate>,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("registry", &self.registry)
            .field("running", &self.inflight.len())
            .field("free_workers", &self.workers.available_permits())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Shared {
    pub(crate) fn controls(&self) -> MutexGuard<'_, Controls> {
        self.controls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate(&self) -> MutexGuard<'_, PreconditionGate> {
        self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn publish(&self, payload: QueueEventPayload) {
        self.events.publish(QueueEvent::new(self.clock.now(), payload));
    }
}

/// Counts from one admission round.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TickReport {
    /// Commands handed to a worker.
    pub dispatched: usize,
    /// Candidates held back by a precondition.
    pub deferred: usize,
    /// Rows that could not be turned back into commands.
    pub quarantined: usize,
}

pub struct QueueRuntimeBuilder {
    store: Arc<dyn CommandStore>,
    registry: Arc<CommandRegistry>,
    config: QueueConfig,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<QueueEventBus>>,
}

impl fmt::Debug for QueueRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRuntimeBuilder")
            .field("store", &self.store)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl QueueRuntimeBuilder {
    pub fn new(store: Arc<dyn CommandStore>, registry: Arc<CommandRegistry>) -> Self {
        Self {
            store,
            registry,
            config: QueueConfig::default(),
            clock: None,
            events: None,
        }
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Must be the same clock the store was built with.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn events(mut self, events: Arc<QueueEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> QueueRuntime {
        let capacity = self.config.event_channel_capacity;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(QueueEventBus::new(capacity)));
        let controls = Controls {
            paused: false,
            disabled: self.config.disabled_work_types.iter().copied().collect(),
        };
        let workers = Arc::new(Semaphore::new(self.config.workers.max(1)));

        QueueRuntime {
            shared: Arc::new(Shared {
                config: self.config,
                store: self.store,
                registry: self.registry,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                events,
                inflight: Arc::new(InflightTable::new()),
                controls: Mutex::new(controls),
                wake: Notify::new(),
                gate: Mutex::new(PreconditionGate::new()),
                workers,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
            poll_loop: AsyncMutex::new(None),
        }
    }
}

/// Owns the dispatcher: one poll loop feeding a bounded worker pool.
pub struct QueueRuntime {
    shared: Arc<Shared>,
    poll_loop: AsyncMutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for QueueRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let polling = self
            .poll_loop
            .try_lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true);
        f.debug_struct("QueueRuntime")
            .field("shared", &self.shared)
            .field("polling", &polling)
            .finish()
    }
}

impl QueueRuntime {
    pub fn builder(
        store: Arc<dyn CommandStore>,
        registry: Arc<CommandRegistry>,
    ) -> QueueRuntimeBuilder {
        QueueRuntimeBuilder::new(store, registry)
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle::new(Arc::clone(&self.shared))
    }

    pub fn events(&self) -> Arc<QueueEventBus> {
        Arc::clone(&self.shared.events)
    }

    /// Recovers rows a previous process left running, then starts polling.
    pub async fn start(&self) -> Result<()> {
        let mut poll_loop = self.poll_loop.lock().await;
        if poll_loop.is_some() {
            return Ok(());
        }

        let recovered = self.shared.store.recover_running().await?;
        if recovered > 0 {
            warn!(
                target: "kura::dispatch",
                recovered,
                "requeued commands interrupted by a previous shutdown"
            );
        }

        let shared = Arc::clone(&self.shared);
        *poll_loop = Some(tokio::spawn(poll(shared)));
        info!(
            target: "kura::dispatch",
            workers = self.shared.config.workers,
            "command dispatcher started"
        );
        Ok(())
    }

    /// Runs a single admission round. The poll loop calls this; it is public
    /// so embedders and tests can drive the dispatcher by hand.
    pub async fn tick(&self) -> Result<TickReport> {
        tick(&self.shared).await
    }

    /// Stops polling, cancels running commands and waits up to the grace
    /// period for them to settle. Interrupted commands go back to the queue
    /// without consuming a retry.
    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "kura::dispatch", "initiating dispatcher shutdown");
        self.shared.shutdown.cancel();

        if let Some(handle) = self.poll_loop.lock().await.take()
            && let Err(err) = handle.await
        {
            warn!(target: "kura::dispatch", error = %err, "poll loop ended abnormally");
        }

        self.shared.tracker.close();
        let grace = self.shared.config.shutdown_grace();
        if tokio::time::timeout(grace, self.shared.tracker.wait()).await.is_err() {
            warn!(
                target: "kura::dispatch",
                still_running = self.shared.inflight.len(),
                grace_ms = grace.as_millis() as u64,
                "commands still running after shutdown grace period"
            );
        }

        info!(target: "kura::dispatch", "dispatcher shutdown complete");
        Ok(())
    }
}

async fn poll(shared: Arc<Shared>) {
    loop {
        let dispatched = match tick(&shared).await {
            Ok(report) => report.dispatched,
            Err(err) => {
                error!(target: "kura::dispatch", error = %err, "admission round failed");
                0
            }
        };
        let wait = if dispatched > 0 {
            shared.config.poll_interval()
        } else {
            shared.config.idle_poll_interval()
        };

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!(target: "kura::dispatch", "poll loop stopped");
}

async fn tick(shared: &Arc<Shared>) -> Result<TickReport> {
    let mut report = TickReport::default();
    if shared.shutdown.is_cancelled() {
        return Ok(report);
    }

    let excluded_work_types = {
        let controls = shared.controls();
        if controls.paused {
            return Ok(report);
        }
        controls.disabled.clone()
    };

    let free = shared.workers.available_permits();
    if free == 0 {
        return Ok(report);
    }

    let now = shared.clock.now();
    let query = AdmissionQuery {
        quantity: free,
        tag_inflight: shared.inflight.tag_counts(),
        running_limits: shared.inflight.running_limits(),
        tag_caps: shared.config.tag_caps.clone(),
        excluded_batches: shared.inflight.fenced_batches().into_iter().collect(),
        excluded_work_types,
        blocked_preconditions: shared.gate().blocked(now),
    };

    let candidates = shared.store.get(&query).await?;
    trace!(target: "kura::dispatch", free, candidates = candidates.len(), "admission round");

    for request in candidates {
        let id = request.id.clone();
        let class_name = request.class_name.clone();

        let command = match shared.registry.to_command(request) {
            Ok(command) => command,
            Err(err) => {
                let reason = err.to_string();
                error!(
                    target: "kura::dispatch",
                    command_id = %id,
                    class = %class_name,
                    reason = %reason,
                    "command cannot be reconstructed; quarantining"
                );
                if shared.store.quarantine(&id, &reason).await? {
                    shared.publish(QueueEventPayload::Quarantined {
                        command_id: id,
                        class_name,
                        reason,
                    });
                }
                report.quarantined += 1;
                continue;
            }
        };

        let verdict = shared
            .gate()
            .evaluate(command.preconditions(), &shared.registry, now);
        match verdict {
            GateVerdict::Clear => {}
            GateVerdict::Blocked {
                precondition,
                retry_in,
            } => {
                debug!(
                    target: "kura::dispatch",
                    command_id = %id,
                    precondition = %precondition,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "precondition blocked; deferring"
                );
                if shared.store.defer(&id, retry_in).await? {
                    shared.publish(QueueEventPayload::Deferred {
                        command_id: id,
                        precondition,
                        delay_ms: retry_in.as_millis() as u64,
                    });
                }
                report.deferred += 1;
                continue;
            }
            GateVerdict::Unknown { precondition } => {
                let reason = format!("precondition `{precondition}` is not registered");
                error!(
                    target: "kura::dispatch",
                    command_id = %id,
                    class = %class_name,
                    reason = %reason,
                    "quarantining"
                );
                if shared.store.quarantine(&id, &reason).await? {
                    shared.publish(QueueEventPayload::Quarantined {
                        command_id: id,
                        class_name,
                        reason,
                    });
                }
                report.quarantined += 1;
                continue;
            }
        }

        let Ok(permit) = Arc::clone(&shared.workers).try_acquire_owned() else {
            break;
        };
        let token = shared.shutdown.child_token();
        let run_id = RunId::new();
        let limit = query.limit_for(command.request());
        let slot = match shared
            .inflight
            .try_admit(&command, limit, token.clone(), run_id, now)
        {
            Ok(slot) => slot,
            Err(refusal) => {
                trace!(target: "kura::dispatch", command_id = %id, ?refusal, "slot refused");
                continue;
            }
        };

        if !shared.store.mark_running(&id).await? {
            debug!(
                target: "kura::dispatch",
                command_id = %id,
                "row changed before start; skipping"
            );
            continue;
        }

        shared.publish(QueueEventPayload::Started {
            command_id: id,
            class_name,
            parallel_tag: command.parallel_tag().to_owned(),
            run_id,
        });
        let worker = Execution {
            shared: Arc::clone(shared),
            command,
            slot,
            permit,
            token,
            run_id,
        };
        shared.tracker.spawn(worker.run());
        report.dispatched += 1;
    }

    Ok(report)
}

/// Forwards a running command's progress to the in-flight table and the
/// event bus.
struct DispatchProgressSink {
    shared: Arc<Shared>,
    run_id: RunId,
}

impl ProgressSink for DispatchProgressSink {
    fn report(&self, progress: CommandProgress) {
        self.shared
            .inflight
            .set_progress(&progress.command_id, progress.progress);
        self.shared.publish(QueueEventPayload::Progress {
            run_id: self.run_id,
            progress,
        });
    }
}

/// One execution attempt. Dropping it releases the tag slot and the worker
/// permit.
struct Execution {
    shared: Arc<Shared>,
    command: ScheduledCommand,
    slot: InflightSlot,
    permit: OwnedSemaphorePermit,
    token: CancellationToken,
    run_id: RunId,
}

impl Execution {
    async fn run(self) {
        let id = self.command.id().clone();
        debug!(
            target: "kura::dispatch",
            command_id = %id,
            class = %self.command.class_name(),
            tag = %self.command.parallel_tag(),
            batch = self.command.batch().unwrap_or_default(),
            retries = self.command.retries(),
            run_id = %self.run_id,
            "command started"
        );

        let reporter = ProgressReporter::new(
            Arc::new(DispatchProgressSink {
                shared: Arc::clone(&self.shared),
                run_id: self.run_id,
            }),
            id.clone(),
            self.command.class_name().to_owned(),
        );
        reporter.init();

        let outcome = if self.token.is_cancelled() {
            Err(CommandError::Cancelled)
        } else {
            let body = self.command.command().run(&reporter, &self.token);
            AssertUnwindSafe(body)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(CommandError::transient(format!(
                        "command panicked: {}",
                        panic_message(&*panic)
                    )))
                })
        };

        let mut result = CommandResult::from_run(outcome);
        if result == CommandResult::Cancelled && !self.token.is_cancelled() {
            result = CommandResult::Retry {
                error: "command cancelled itself".into(),
            };
        }

        if let Err(err) = self.settle(&id, &result, &reporter).await {
            error!(
                target: "kura::dispatch",
                command_id = %id,
                error = %err,
                "failed to record command result"
            );
        }

        drop(self.permit);
        drop(self.slot);
        self.shared.wake.notify_one();
    }

    async fn settle(
        &self,
        id: &CommandId,
        result: &CommandResult,
        reporter: &ProgressReporter,
    ) -> Result<()> {
        let shared = &self.shared;
        let cleared = self.slot.was_cleared();

        match result {
            CommandResult::Completed => {
                reporter.finish();
                if shared.store.complete(id).await? {
                    debug!(target: "kura::dispatch", command_id = %id, "command completed");
                    shared.publish(QueueEventPayload::Completed {
                        command_id: id.clone(),
                        run_id: self.run_id,
                    });
                } else {
                    debug!(
                        target: "kura::dispatch",
                        command_id = %id,
                        "completed after being cleared"
                    );
                }
            }
            CommandResult::Cancelled => {
                reporter.cancelled();
                if !cleared {
                    shared.store.defer(id, Duration::ZERO).await?;
                }
                debug!(
                    target: "kura::dispatch",
                    command_id = %id,
                    cleared,
                    "command cancelled"
                );
                shared.publish(QueueEventPayload::Cancelled {
                    command_id: id.clone(),
                    run_id: self.run_id,
                });
            }
            CommandResult::Retry { error } => {
                reporter.fail(error);
                let retries = self.command.retries().saturating_add(1);
                if retries > self.command.max_retries() {
                    self.fail_terminally(id, error, "retries exhausted").await?;
                    return Ok(());
                }

                let delay = retry_delay(&shared.config.retry, id, retries);
                if shared.store.reschedule(id, delay, error, retries).await? {
                    warn!(
                        target: "kura::dispatch",
                        command_id = %id,
                        class = %self.command.class_name(),
                        retries,
                        max_retries = self.command.max_retries(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "command failed; rescheduled"
                    );
                    shared.publish(QueueEventPayload::Rescheduled {
                        command_id: id.clone(),
                        run_id: self.run_id,
                        retries,
                        delay_ms: delay.as_millis() as u64,
                        error: error.clone(),
                    });
                } else {
                    debug!(
                        target: "kura::dispatch",
                        command_id = %id,
                        "failure after clear dropped"
                    );
                }
            }
            CommandResult::Failed { error } => {
                reporter.fail(error);
                self.fail_terminally(id, error, "fatal error").await?;
            }
        }
        Ok(())
    }

    async fn fail_terminally(&self, id: &CommandId, error: &str, why: &str) -> Result<()> {
        if !self.shared.store.fail(id, error).await? {
            debug!(
                target: "kura::dispatch",
                command_id = %id,
                "terminal failure after clear dropped"
            );
            return Ok(());
        }
        error!(
            target: "kura::dispatch",
            command_id = %id,
            class = %self.command.class_name(),
            tag = %self.command.parallel_tag(),
            batch = self.command.batch().unwrap_or_default(),
            retries = self.command.retries(),
            error = %error,
            "command failed terminally ({why})"
        );
        self.shared.publish(QueueEventPayload::Failed {
            command_id: id.clone(),
            class_name: self.command.class_name().to_owned(),
            retries: self.command.retries(),
            error: error.to_owned(),
        });
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
