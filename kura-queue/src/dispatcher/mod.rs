//! Dispatcher: the poll loop, the bounded worker pool and the handle
//! producers and operators use to talk to it.
//!
//! Admission happens in three steps that must agree: the store picks
//! candidates with tag headroom, the in-flight table reserves the tag slot
//! under its lock, and only then is the row marked running. A clear raises a
//! fence in the in-flight table first, so nothing it covers can be admitted
//! while the store rows are being removed.

mod handle;
mod inflight;
mod runtime;

pub use handle::{PutOptions, QueueHandle, QueueSnapshot};
pub use inflight::{FenceGuard, InflightInfo, InflightSlot, InflightTable, Refusal};
pub use runtime::{QueueRuntime, QueueRuntimeBuilder, TickReport};

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        command::{Command, CommandId, CommandState, WorkType},
        config::{QueueConfig, RetryConfig},
        events::QueueEventPayload,
        registry::CommandRegistry,
        store::{CommandStore, MemoryCommandStore},
        testing::{
            Behavior, CountingGate, GetAnimeFull, HashFile, ScriptedCommand, fixture_registry,
            recorder, registry_with_gate, request,
        },
    };

    fn config() -> QueueConfig {
        QueueConfig {
            workers: 4,
            poll_interval_ms: 5,
            idle_poll_interval_ms: 10,
            retry: RetryConfig {
                backoff_base_ms: 0,
                ..RetryConfig::default()
            },
            shutdown_grace_ms: 2_000,
            ..QueueConfig::default()
        }
    }

    fn runtime_with(
        registry: CommandRegistry,
    ) -> (QueueRuntime, Arc<dyn CommandStore>, ManualClock) {
        let clock = ManualClock::default();
        let store: Arc<dyn CommandStore> =
            Arc::new(MemoryCommandStore::new(Arc::new(clock.clone())));
        let runtime = QueueRuntime::builder(Arc::clone(&store), Arc::new(registry))
            .config(config())
            .clock(Arc::new(clock.clone()))
            .build();
        (runtime, store, clock)
    }

    fn runtime() -> (QueueRuntime, Arc<dyn CommandStore>, ManualClock) {
        runtime_with(fixture_registry())
    }

    async fn wait_idle(handle: &QueueHandle) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.running() > 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("running commands settle");
    }

    /// Waits until `count` command bodies are executing on `tag`. A reserved
    /// slot alone does not mean the worker task has been polled yet.
    async fn wait_started(name: &str, tag: &str, count: u32) {
        let observed = recorder(name);
        tokio::time::timeout(Duration::from_secs(5), async {
            while observed.running(tag) < count {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("command bodies start");
    }

    fn as_dyn(commands: &[ScriptedCommand]) -> impl Iterator<Item = &dyn Command> {
        commands.iter().map(|command| command as &dyn Command)
    }

    fn scripted_id(name: &str, key: u32) -> CommandId {
        CommandId::new(format!("Scripted_{name}_{key}"))
    }

    #[tokio::test]
    async fn tag_limit_holds_under_concurrency() {
        let store: Arc<dyn CommandStore> = Arc::new(MemoryCommandStore::default());
        let runtime = QueueRuntime::builder(store, Arc::new(fixture_registry()))
            .config(config())
            .build();
        let handle = runtime.handle();

        let commands: Vec<ScriptedCommand> = (0..8)
            .map(|key| {
                ScriptedCommand::new("tag-limit", key)
                    .tag("AniDB", Some(2))
                    .hold(20)
            })
            .collect();
        handle
            .put_range(as_dyn(&commands), PutOptions::default())
            .await
            .expect("enqueue");
        handle
            .put(
                &ScriptedCommand::new("tag-limit", 100).tag("Hashing", None),
                PutOptions::default(),
            )
            .await
            .expect("enqueue");

        runtime.start().await.expect("start");
        let observed = recorder("tag-limit");
        tokio::time::timeout(Duration::from_secs(5), async {
            while observed.completed().len() < 9 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("all commands complete");
        runtime.shutdown().await.expect("shutdown");

        assert!(observed.max_seen("AniDB") <= 2);
        assert_eq!(observed.max_seen("Hashing"), 1);
        assert_eq!(handle.queued_count(&[]).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_the_retry_budget() {
        let (runtime, store, _clock) = runtime();
        let handle = runtime.handle();
        let command = ScriptedCommand::new("exhaust", 1)
            .behavior(Behavior::Transient)
            .max_retries(2);
        handle.put(&command, PutOptions::default()).await.expect("enqueue");

        let mut events = handle.subscribe();
        for _ in 0..3 {
            assert_eq!(runtime.tick().await.expect("tick").dispatched, 1);
            wait_idle(&handle).await;
        }
        assert_eq!(runtime.tick().await.expect("tick").dispatched, 0);

        let row = store
            .find(&scripted_id("exhaust", 1))
            .await
            .expect("find")
            .expect("row kept");
        assert_eq!(row.state, CommandState::Failed);
        assert_eq!(row.retries, 2);
        assert_eq!(
            row.last_error.as_deref(),
            Some("transient failure: remote timed out")
        );
        assert_eq!(recorder("exhaust").attempts(1), 3);
        assert_eq!(handle.failed_count().await.expect("count"), 1);

        let mut rescheduled = 0;
        let mut failed = 0;
        while let Ok(event) = events.try_recv() {
            match event.payload {
                QueueEventPayload::Rescheduled { .. } => rescheduled += 1,
                QueueEventPayload::Failed { retries, .. } => {
                    assert_eq!(retries, 2);
                    failed += 1;
                }
                _ => {}
            }
        }
        assert_eq!((rescheduled, failed), (2, 1));
    }

    #[tokio::test]
    async fn fatal_errors_fail_without_retrying() {
        let (runtime, store, _clock) = runtime();
        let handle = runtime.handle();
        let command = ScriptedCommand::new("fatal", 1)
            .behavior(Behavior::Fatal)
            .max_retries(5);
        handle.put(&command, PutOptions::default()).await.expect("enqueue");

        runtime.tick().await.expect("tick");
        wait_idle(&handle).await;

        let row = store
            .find(&scripted_id("fatal", 1))
            .await
            .expect("find")
            .expect("row kept");
        assert_eq!(row.state, CommandState::Failed);
        assert_eq!(row.retries, 0);
        assert_eq!(recorder("fatal").attempts(1), 1);
    }

    #[tokio::test]
    async fn blocked_precondition_never_consumes_retries() {
        let gate = Arc::new(CountingGate::closed());
        let (runtime, store, clock) = runtime_with(registry_with_gate(gate.clone()));
        let handle = runtime.handle();
        let command = ScriptedCommand::new("gated", 1).gated().max_retries(2);
        handle.put(&command, PutOptions::default()).await.expect("enqueue");

        for _ in 0..10 {
            let report = runtime.tick().await.expect("tick");
            assert_eq!(report.dispatched, 0);
            assert_eq!(report.deferred, 1);
            clock.advance(chrono::Duration::seconds(2));
        }

        let row = store
            .find(&scripted_id("gated", 1))
            .await
            .expect("find")
            .expect("row kept");
        assert_eq!(row.state, CommandState::Queued);
        assert_eq!(row.retries, 0);
        assert_eq!(gate.evaluations(), 10);
        assert_eq!(recorder("gated").attempts(1), 0);

        gate.open();
        assert_eq!(runtime.tick().await.expect("tick").dispatched, 1);
        wait_idle(&handle).await;
        assert_eq!(recorder("gated").completed(), vec![1]);
    }

    #[tokio::test]
    async fn blocked_precondition_is_skipped_until_it_expires() {
        let gate = Arc::new(CountingGate::closed());
        let (runtime, _store, clock) = runtime_with(registry_with_gate(gate.clone()));
        let handle = runtime.handle();
        for key in 0..3 {
            handle
                .put(&ScriptedCommand::new("gate-cache", key).gated(), PutOptions::default())
                .await
                .expect("enqueue");
        }

        let report = runtime.tick().await.expect("tick");
        assert_eq!(report.deferred, 3);
        assert_eq!(gate.evaluations(), 1);

        clock.advance(chrono::Duration::milliseconds(500));
        assert_eq!(runtime.tick().await.expect("tick"), TickReport::default());
        assert_eq!(gate.evaluations(), 1);
    }

    #[tokio::test]
    async fn clearing_a_batch_cancels_running_commands() {
        let (runtime, store, _clock) = runtime();
        let handle = runtime.handle();
        let batch: Vec<ScriptedCommand> = (0..2)
            .map(|key| ScriptedCommand::new("clear", key).behavior(Behavior::WaitForCancel))
            .collect();
        handle
            .put_range(as_dyn(&batch), PutOptions::default().in_batch("import-7"))
            .await
            .expect("enqueue");
        handle
            .put(
                &ScriptedCommand::new("clear", 9).tag("Other", None),
                PutOptions::default().in_batch("import-7").after(Duration::from_secs(60)),
            )
            .await
            .expect("enqueue delayed");
        handle
            .put(
                &ScriptedCommand::new("clear", 10),
                PutOptions::default().after(Duration::from_secs(60)),
            )
            .await
            .expect("enqueue unrelated");

        assert_eq!(runtime.tick().await.expect("tick").dispatched, 2);
        wait_started("clear", "Scripted", 2).await;
        assert_eq!(handle.queued_count_for_batch("import-7").await.expect("count"), 3);

        let removed = handle.clear_batch("import-7").await.expect("clear");
        assert_eq!(removed, 3);
        wait_idle(&handle).await;

        let mut cancelled = recorder("clear").cancelled();
        cancelled.sort();
        assert_eq!(cancelled, vec![0, 1]);
        for key in [0, 1, 9] {
            assert!(store.find(&scripted_id("clear", key)).await.expect("find").is_none());
        }
        assert_eq!(handle.queued_count_for_batch("import-7").await.expect("count"), 0);
        assert_eq!(handle.queued_count(&[]).await.expect("count"), 1);
        assert_eq!(runtime.tick().await.expect("tick").dispatched, 0);
    }

    #[tokio::test]
    async fn panicking_command_does_not_take_down_the_dispatcher() {
        let (runtime, store, _clock) = runtime();
        let handle = runtime.handle();
        handle
            .put(
                &ScriptedCommand::new("panic", 1).behavior(Behavior::Panic).max_retries(0),
                PutOptions::default(),
            )
            .await
            .expect("enqueue");
        handle
            .put(&ScriptedCommand::new("panic", 2), PutOptions::default())
            .await
            .expect("enqueue");

        assert_eq!(runtime.tick().await.expect("tick").dispatched, 2);
        wait_idle(&handle).await;

        let row = store
            .find(&scripted_id("panic", 1))
            .await
            .expect("find")
            .expect("row kept");
        assert_eq!(row.state, CommandState::Failed);
        assert!(row.last_error.unwrap_or_default().contains("command exploded"));
        assert_eq!(recorder("panic").completed(), vec![2]);

        handle
            .put(&ScriptedCommand::new("panic", 3), PutOptions::default())
            .await
            .expect("enqueue");
        assert_eq!(runtime.tick().await.expect("tick").dispatched, 1);
        wait_idle(&handle).await;
        assert_eq!(recorder("panic").completed(), vec![2, 3]);
    }

    #[tokio::test]
    async fn unknown_class_is_quarantined() {
        let (runtime, store, clock) = runtime();
        let mut ghost = request("Ghost_1", "Ghost", None, 5, clock.now());
        ghost.class_name = "Ghost".into();
        store.put(ghost, Duration::ZERO).await.expect("put");

        let mut events = runtime.handle().subscribe();
        let report = runtime.tick().await.expect("tick");
        assert_eq!(report.quarantined, 1);
        assert_eq!(report.dispatched, 0);

        let row = store
            .find(&CommandId::new("Ghost_1"))
            .await
            .expect("find")
            .expect("row kept");
        assert_eq!(row.state, CommandState::Quarantined);
        assert!(matches!(
            events.try_recv().map(|event| event.payload),
            Ok(QueueEventPayload::Quarantined { .. })
        ));
        assert_eq!(runtime.tick().await.expect("tick"), TickReport::default());
    }

    #[tokio::test]
    async fn shutdown_requeues_without_consuming_a_retry() {
        let (runtime, store, _clock) = runtime();
        let handle = runtime.handle();
        handle
            .put(
                &ScriptedCommand::new("shutdown", 1).behavior(Behavior::WaitForCancel),
                PutOptions::default(),
            )
            .await
            .expect("enqueue");

        runtime.start().await.expect("start");
        wait_started("shutdown", "Scripted", 1).await;
        runtime.shutdown().await.expect("shutdown");

        assert_eq!(handle.running(), 0);
        assert_eq!(recorder("shutdown").cancelled(), vec![1]);
        let row = store
            .find(&scripted_id("shutdown", 1))
            .await
            .expect("find")
            .expect("row kept");
        assert_eq!(row.state, CommandState::Queued);
        assert_eq!(row.retries, 0);
    }

    #[tokio::test]
    async fn pause_and_disabled_work_types_block_admission() {
        let (runtime, _store, _clock) = runtime();
        let handle = runtime.handle();
        handle
            .put(&ScriptedCommand::new("pause", 1), PutOptions::default())
            .await
            .expect("enqueue");

        handle.pause();
        assert!(handle.is_paused());
        assert_eq!(runtime.tick().await.expect("tick").dispatched, 0);
        handle.resume();

        handle.disable_work_type(WorkType::Server);
        assert_eq!(handle.disabled_work_types(), vec![WorkType::Server]);
        assert_eq!(runtime.tick().await.expect("tick").dispatched, 0);
        assert_eq!(handle.queued_count(&[WorkType::Server]).await.expect("count"), 1);

        handle.enable_work_type(WorkType::Server);
        assert_eq!(runtime.tick().await.expect("tick").dispatched, 1);
        wait_idle(&handle).await;
        assert_eq!(recorder("pause").completed(), vec![1]);

        let snapshot = handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.queued, 0);
        assert!(!snapshot.paused);
        assert!(snapshot.running.is_empty());
    }

    #[tokio::test]
    async fn worker_pool_bounds_admission() {
        let (runtime, _store, _clock) = runtime();
        let handle = runtime.handle();
        let commands: Vec<ScriptedCommand> = (0..6)
            .map(|key| ScriptedCommand::new("pool", key).behavior(Behavior::WaitForCancel))
            .collect();
        handle
            .put_range(as_dyn(&commands), PutOptions::default())
            .await
            .expect("enqueue");

        assert_eq!(runtime.tick().await.expect("tick").dispatched, 4);
        assert_eq!(runtime.tick().await.expect("tick").dispatched, 0);
        assert_eq!(handle.snapshot().await.expect("snapshot").running.len(), 4);

        handle.clear().await.expect("clear");
        wait_idle(&handle).await;
        assert_eq!(handle.queued_count(&[]).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn strict_running_command_keeps_its_tag_exclusive() {
        let (runtime, _store, _clock) = runtime();
        let handle = runtime.handle();
        let strict = ScriptedCommand::new("exclusive", 1)
            .tag("AniDB", Some(1))
            .behavior(Behavior::WaitForCancel);
        handle.put(&strict, PutOptions::default()).await.expect("enqueue");
        assert_eq!(runtime.tick().await.expect("tick").dispatched, 1);
        wait_started("exclusive", "AniDB", 1).await;

        let lax = ScriptedCommand::new("exclusive", 2)
            .tag("AniDB", Some(4))
            .behavior(Behavior::WaitForCancel);
        handle.put(&lax, PutOptions::default()).await.expect("enqueue");
        handle
            .put(&ScriptedCommand::new("exclusive", 3).tag("Hashing", None), PutOptions::default())
            .await
            .expect("enqueue");

        assert_eq!(runtime.tick().await.expect("tick").dispatched, 1);
        assert_eq!(recorder("exclusive").max_seen("AniDB"), 1);
        let running: Vec<_> = handle
            .snapshot()
            .await
            .expect("snapshot")
            .running
            .into_iter()
            .filter(|info| info.parallel_tag == "AniDB")
            .map(|info| info.command_id)
            .collect();
        assert_eq!(running, vec![scripted_id("exclusive", 1)]);

        handle.clear().await.expect("clear");
        wait_idle(&handle).await;
    }

    #[tokio::test]
    async fn strict_newcomer_waits_for_a_lax_tag_to_drain() {
        let (runtime, _store, _clock) = runtime();
        let handle = runtime.handle();
        let lax = ScriptedCommand::new("drain", 1)
            .tag("AniDB", Some(4))
            .behavior(Behavior::WaitForCancel);
        handle.put(&lax, PutOptions::default()).await.expect("enqueue");
        assert_eq!(runtime.tick().await.expect("tick").dispatched, 1);
        wait_started("drain", "AniDB", 1).await;

        let strict = ScriptedCommand::new("drain", 2).tag("AniDB", Some(1));
        handle.put(&strict, PutOptions::default()).await.expect("enqueue");
        assert_eq!(runtime.tick().await.expect("tick").dispatched, 0);

        handle.clear().await.expect("clear");
        wait_idle(&handle).await;
        assert_eq!(recorder("drain").max_seen("AniDB"), 1);
    }

    #[tokio::test]
    async fn put_range_accepts_mixed_command_types() {
        let (runtime, _store, _clock) = runtime();
        let handle = runtime.handle();
        let hash = HashFile::new("/media/show/01.mkv");
        let anime = GetAnimeFull::new(42);
        let scripted = ScriptedCommand::new("mixed", 1);
        let commands: [&dyn Command; 3] = [&hash, &anime, &scripted];

        let outcomes = handle
            .put_range(commands, PutOptions::default().in_batch("import-9"))
            .await
            .expect("enqueue");

        assert_eq!(outcomes.len(), 3);
        assert_eq!(
            handle.queued_count_for_batch("import-9").await.expect("count"),
            3
        );
        assert_eq!(
            handle.queued_count(&[WorkType::AniDb]).await.expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn put_records_error_and_caps_seeded_retries() {
        let (runtime, store, _clock) = runtime();
        let handle = runtime.handle();
        let command = ScriptedCommand::new("seeded", 1).max_retries(2);
        handle
            .put(
                &command,
                PutOptions::default()
                    .with_retries(5)
                    .with_error("moved from legacy queue"),
            )
            .await
            .expect("enqueue");

        let row = store
            .find(&scripted_id("seeded", 1))
            .await
            .expect("find")
            .expect("row");
        assert_eq!(row.retries, 2);
        assert_eq!(row.max_retries, 2);
        assert_eq!(row.last_error.as_deref(), Some("moved from legacy queue"));
    }
}
