//! End-to-end scenarios against the in-memory store (spec §8).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use swig_core::{async_trait, Dispatcher, DispatcherConfig, EnqueueOptions, Handler, HandlerRegistry, JobStatus, QueueConfig, WorkerContext};
use swig_testing::InMemoryStore;

#[derive(Debug, Serialize, Deserialize)]
struct SendEmail {
    to: String,
    subject: String,
}

#[async_trait]
impl Handler for SendEmail {
    fn kind(&self) -> &'static str {
        "send_email"
    }

    async fn execute(&self, _ctx: WorkerContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// S1 — basic happy path.
#[tokio::test]
async fn basic_happy_path_completes() {
    let store = InMemoryStore::new();
    let registry = HandlerRegistry::new();
    registry.register(SendEmail {
        to: String::new(),
        subject: String::new(),
    });

    let dispatcher = Dispatcher::new(store.clone(), vec![QueueConfig::new("default", 3)], registry);
    dispatcher.start().await.unwrap();

    let id = dispatcher
        .enqueue(
            &SendEmail {
                to: "a@x".into(),
                subject: "hi".into(),
            },
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    wait_until(|| store.status_of(&id) == Some(JobStatus::Completed), Duration::from_millis(500)).await;

    assert_eq!(store.status_of(&id), Some(JobStatus::Completed));
    assert_eq!(store.attempts_of(&id), Some(1));

    dispatcher.stop().await.unwrap();
}

/// Handler whose first invocation fails and whose second succeeds. State
/// lives in a process-global counter because each claim deserializes a
/// fresh instance from the stored JSON payload.
static FLAKY_FAILURES_REMAINING: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct FlakyOnce;

#[async_trait]
impl Handler for FlakyOnce {
    fn kind(&self) -> &'static str {
        "flaky_once"
    }

    async fn execute(&self, _ctx: WorkerContext) -> anyhow::Result<()> {
        let still_failing = FLAKY_FAILURES_REMAINING
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if still_failing {
            anyhow::bail!("boom")
        }
        Ok(())
    }
}

/// S3 — retry with backoff: fails once, `scheduled_for` backs off 2^attempts
/// seconds, and a worker's idle poll claims it again once that window passes.
#[tokio::test]
async fn retry_with_backoff_then_succeeds() {
    FLAKY_FAILURES_REMAINING.store(1, Ordering::SeqCst);

    let store = InMemoryStore::new();
    let registry = HandlerRegistry::new();
    registry.register(FlakyOnce);

    let config = DispatcherConfig {
        recovery_interval: Duration::from_millis(200),
        ..Default::default()
    };
    let dispatcher = Dispatcher::with_config(store.clone(), vec![QueueConfig::new("default", 3)], registry, config);
    dispatcher.start().await.unwrap();

    let mut options = EnqueueOptions::default();
    options.max_attempts = 3;
    let id = dispatcher.enqueue(&FlakyOnce, options).await.unwrap();

    wait_until(|| store.status_of(&id) == Some(JobStatus::Completed), Duration::from_secs(5)).await;

    assert_eq!(store.status_of(&id), Some(JobStatus::Completed));
    assert_eq!(store.attempts_of(&id), Some(2));

    dispatcher.stop().await.unwrap();
}

/// S4 — terminal failure after exhausting attempts.
#[tokio::test]
async fn terminal_failure_after_max_attempts() {
    #[derive(Debug, Serialize, Deserialize)]
    struct AlwaysFails;

    #[async_trait]
    impl Handler for AlwaysFails {
        fn kind(&self) -> &'static str {
            "always_fails"
        }

        async fn execute(&self, _ctx: WorkerContext) -> anyhow::Result<()> {
            anyhow::bail!("nope")
        }
    }

    let store = InMemoryStore::new();
    let registry = HandlerRegistry::new();
    registry.register(AlwaysFails);

    let dispatcher = Dispatcher::new(store.clone(), vec![QueueConfig::new("default", 3)], registry);
    dispatcher.start().await.unwrap();

    let mut options = EnqueueOptions::default();
    options.max_attempts = 2;
    let id = dispatcher.enqueue(&AlwaysFails, options).await.unwrap();

    wait_until(|| store.status_of(&id) == Some(JobStatus::Failed), Duration::from_secs(5)).await;

    assert_eq!(store.status_of(&id), Some(JobStatus::Failed));
    assert_eq!(store.attempts_of(&id), Some(2));

    dispatcher.stop().await.unwrap();
}

/// B1 — a job scheduled in the future is not claimed before its time.
#[tokio::test]
async fn scheduled_job_not_claimed_early() {
    let store = InMemoryStore::new();
    let registry = HandlerRegistry::new();
    registry.register(SendEmail {
        to: String::new(),
        subject: String::new(),
    });

    let dispatcher = Dispatcher::new(store.clone(), vec![QueueConfig::new("default", 3)], registry);
    dispatcher.start().await.unwrap();

    let mut options = EnqueueOptions::default();
    options.run_at = Utc::now() + chrono::Duration::milliseconds(400);
    let id = dispatcher
        .enqueue(
            &SendEmail {
                to: "a@x".into(),
                subject: "hi".into(),
            },
            options,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_ne!(store.status_of(&id), Some(JobStatus::Completed));

    wait_until(|| store.status_of(&id) == Some(JobStatus::Completed), Duration::from_secs(2)).await;
    assert_eq!(store.status_of(&id), Some(JobStatus::Completed));
    dispatcher.stop().await.unwrap();
}

/// Unknown kind is recorded as a failure rather than surfaced to the caller.
#[tokio::test]
async fn unknown_kind_is_recorded_not_panicked() {
    let store = InMemoryStore::new();
    let registry = HandlerRegistry::new(); // nothing registered

    let dispatcher = Dispatcher::new(store.clone(), vec![QueueConfig::new("default", 3)], registry);
    dispatcher.start().await.unwrap();

    let mut options = EnqueueOptions::default();
    options.max_attempts = 1;
    let id = dispatcher
        .enqueue(
            &SendEmail {
                to: "a@x".into(),
                subject: "hi".into(),
            },
            options,
        )
        .await
        .unwrap();

    wait_until(|| store.status_of(&id) == Some(JobStatus::Failed), Duration::from_secs(1)).await;
    assert_eq!(store.status_of(&id), Some(JobStatus::Failed));

    dispatcher.stop().await.unwrap();
}

async fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) {
    let start = tokio::time::Instant::now();
    loop {
        if predicate() {
            return;
        }
        if start.elapsed() > timeout {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BlocksForever;

#[async_trait]
impl Handler for BlocksForever {
    fn kind(&self) -> &'static str {
        "blocks_forever"
    }

    async fn execute(&self, _ctx: WorkerContext) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        unreachable!("this handler never returns")
    }
}

/// S6 — `stop_with_timeout` reports a timeout rather than `Ok` while a
/// handler is still mid-execution and ignoring the cancellation signal.
#[tokio::test]
async fn stop_with_timeout_times_out_on_stuck_handler() {
    let store = InMemoryStore::new();
    let registry = HandlerRegistry::new();
    registry.register(BlocksForever);
    let dispatcher = Dispatcher::new(store.clone(), vec![QueueConfig::new("default", 3)], registry);
    dispatcher.start().await.unwrap();

    dispatcher.enqueue(&BlocksForever, EnqueueOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = dispatcher.stop_with_timeout(Duration::from_millis(200)).await;
    assert!(result.is_err(), "stop should time out while the handler still blocks");
}
