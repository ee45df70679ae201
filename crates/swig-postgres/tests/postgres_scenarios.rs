//! Integration tests against a real PostgreSQL instance (spec §8). Gated on
//! `DATABASE_URL` being set, following the pattern other Postgres-backed
//! suites in the pack use to skip silently in environments without a database.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use swig_core::{async_trait, Dispatcher, EnqueueOptions, Handler, HandlerRegistry, QueueConfig, WorkerContext};
use swig_postgres::PgStore;

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    Some(PgPool::connect(&url).await.expect("connect to test database"))
}

async fn fresh_store(pool: &PgPool) -> std::sync::Arc<PgStore> {
    let store = PgStore::new(pool.clone());
    swig_core::JobStoreContract::close(&*store).await.ok();
    swig_core::JobStoreContract::bootstrap_schema(&*store).await.unwrap();
    store
}

#[derive(Debug, Serialize, Deserialize)]
struct SendEmail {
    to: String,
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

/// Same payload shape as `SendEmail` but holds its single worker busy long
/// enough to give a later-enqueued priority row a window to preempt it.
#[derive(Debug, Serialize, Deserialize)]
struct SlowSendEmail {
    to: String,
}

#[async_trait]
impl Handler for SlowSendEmail {
    fn kind(&self) -> &'static str {
        "slow_send_email"
    }

    async fn execute(&self, _ctx: WorkerContext) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }
}

async fn row_status(pool: &PgPool, id: &str) -> Option<String> {
    let id: uuid::Uuid = id.parse().ok()?;
    sqlx::query_scalar("SELECT status FROM swig_jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .unwrap()
}

/// Polls `row_status` until it matches `want` or `timeout` elapses, returning
/// the last observed status either way.
async fn wait_for_status(pool: &PgPool, id: &str, want: &str, timeout: Duration) -> Option<String> {
    let start = tokio::time::Instant::now();
    loop {
        let status = row_status(pool, id).await;
        if status.as_deref() == Some(want) {
            return status;
        }
        if start.elapsed() > timeout {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// S1 — basic happy path against the real claim/complete queries.
#[tokio::test]
async fn basic_happy_path_completes() {
    let Some(pool) = test_pool().await else { return };
    let store = fresh_store(&pool).await;

    let registry = HandlerRegistry::new();
    registry.register(SendEmail { to: String::new() });

    let dispatcher = Dispatcher::new(store.clone(), vec![QueueConfig::new("default", 3)], registry);
    dispatcher.start().await.unwrap();

    let id = dispatcher
        .enqueue(&SendEmail { to: "a@x".into() }, EnqueueOptions::default())
        .await
        .unwrap();

    let status = wait_for_status(&pool, &id, "completed", Duration::from_secs(5)).await;
    assert_eq!(status.as_deref(), Some("completed"));

    dispatcher.stop().await.unwrap();
}

/// S2 — priority preemption: with default workers busy, a priority-queue row
/// completes ahead of default rows enqueued earlier (spec §8 S2, §4.4).
#[tokio::test]
async fn priority_queue_preempts_default_queue() {
    let Some(pool) = test_pool().await else { return };
    let store = fresh_store(&pool).await;

    let registry = HandlerRegistry::new();
    registry.register(SendEmail { to: String::new() });
    registry.register(SlowSendEmail { to: String::new() });

    let dispatcher = Dispatcher::new(
        store.clone(),
        vec![QueueConfig::new("default", 3), QueueConfig::new("priority", 3)],
        registry,
    );
    dispatcher.start().await.unwrap();

    // Slow enough that the default-queue workers are still busy when the
    // priority row lands, giving preemption a window to be observed.
    let mut default_ids = Vec::new();
    for _ in 0..20 {
        let id = dispatcher
            .enqueue(&SlowSendEmail { to: "a@x".into() }, EnqueueOptions::default())
            .await
            .unwrap();
        default_ids.push(id);
    }

    let priority_options = EnqueueOptions {
        queue: "priority".to_string(),
        ..EnqueueOptions::default()
    };
    let priority_id = dispatcher
        .enqueue(&SendEmail { to: "p@x".into() }, priority_options)
        .await
        .unwrap();

    let status = wait_for_status(&pool, &priority_id, "completed", Duration::from_secs(10)).await;
    assert_eq!(status.as_deref(), Some("completed"));

    let mut completed_defaults = 0;
    for id in &default_ids {
        if row_status(&pool, id).await.as_deref() == Some("completed") {
            completed_defaults += 1;
        }
    }
    assert!(
        completed_defaults < default_ids.len(),
        "priority row should have completed before every default row finished"
    );

    dispatcher.stop().await.unwrap();
}

/// B1 — a job scheduled in the future is inserted `pending` but not claimed
/// before `scheduled_for`, and is claimed once that time passes.
#[tokio::test]
async fn scheduled_job_not_claimed_early() {
    let Some(pool) = test_pool().await else { return };
    let store = fresh_store(&pool).await;

    let registry = HandlerRegistry::new();
    registry.register(SendEmail { to: String::new() });
    let dispatcher = Dispatcher::new(store.clone(), vec![QueueConfig::new("default", 3)], registry);
    dispatcher.start().await.unwrap();

    let options = EnqueueOptions {
        run_at: chrono::Utc::now() + chrono::Duration::milliseconds(500),
        ..EnqueueOptions::default()
    };
    let id = dispatcher.enqueue(&SendEmail { to: "a@x".into() }, options).await.unwrap();

    assert_eq!(row_status(&pool, &id).await.as_deref(), Some("pending"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(row_status(&pool, &id).await.as_deref(), Some("pending"));

    let status = wait_for_status(&pool, &id, "completed", Duration::from_secs(3)).await;
    assert_eq!(status.as_deref(), Some("completed"));

    dispatcher.stop().await.unwrap();
}

/// S5 — transactional atomicity: enqueue joined to a caller transaction that
/// rolls back leaves no row; the same flow committed leaves exactly one.
#[tokio::test]
async fn enqueue_in_tx_is_atomic_with_caller_transaction() {
    let Some(pool) = test_pool().await else { return };
    let store = fresh_store(&pool).await;
    sqlx::query("CREATE TABLE IF NOT EXISTS orders (id SERIAL PRIMARY KEY)")
        .execute(&pool)
        .await
        .unwrap();

    let registry = HandlerRegistry::new();
    registry.register(SendEmail { to: String::new() });
    let dispatcher = Dispatcher::new(store.clone(), vec![QueueConfig::new("default", 3)], registry);

    // Rollback path.
    let mut tx: sqlx::Transaction<'static, sqlx::Postgres> = pool.begin().await.unwrap();
    sqlx::query("INSERT INTO orders DEFAULT VALUES").execute(&mut *tx).await.unwrap();
    let id = dispatcher
        .enqueue_in_tx(&mut tx, &SendEmail { to: "a@x".into() }, EnqueueOptions::default())
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(row_status(&pool, &id).await, None);
    let orders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders").fetch_one(&pool).await.unwrap();
    assert_eq!(orders, 0);

    // Commit path.
    let mut tx: sqlx::Transaction<'static, sqlx::Postgres> = pool.begin().await.unwrap();
    sqlx::query("INSERT INTO orders DEFAULT VALUES").execute(&mut *tx).await.unwrap();
    let id = dispatcher
        .enqueue_in_tx(&mut tx, &SendEmail { to: "a@x".into() }, EnqueueOptions::default())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert!(row_status(&pool, &id).await.is_some());
    let orders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders").fetch_one(&pool).await.unwrap();
    assert_eq!(orders, 1);

    sqlx::query("DROP TABLE orders").execute(&pool).await.unwrap();
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

#[derive(Debug, Serialize, Deserialize)]
struct BlocksForeverThenSucceeds;

#[async_trait]
impl Handler for BlocksForeverThenSucceeds {
    fn kind(&self) -> &'static str {
        "blocks_forever"
    }

    async fn execute(&self, _ctx: WorkerContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// S6 — shutdown cleanup: a job claimed by a blocking handler is left
/// `pending` with cleared ownership after a short-deadline `stop`, and a
/// fresh dispatcher instance picks it up and completes it.
#[tokio::test]
async fn shutdown_reclaims_in_flight_job_for_next_instance() {
    let Some(pool) = test_pool().await else { return };
    let store = fresh_store(&pool).await;

    let registry = HandlerRegistry::new();
    registry.register(BlocksForever);
    let dispatcher = Dispatcher::new(store.clone(), vec![QueueConfig::new("default", 3)], registry);
    dispatcher.start().await.unwrap();

    let id = dispatcher.enqueue(&BlocksForever, EnqueueOptions::default()).await.unwrap();

    let status = wait_for_status(&pool, &id, "processing", Duration::from_secs(5)).await;
    assert_eq!(status.as_deref(), Some("processing"));

    let result = dispatcher.stop_with_timeout(Duration::from_millis(200)).await;
    assert!(result.is_err(), "stop should time out while the handler still blocks");
    assert_eq!(row_status(&pool, &id).await.as_deref(), Some("pending"));

    let registry2 = HandlerRegistry::new();
    registry2.register(BlocksForeverThenSucceeds);
    let dispatcher2 = Dispatcher::new(store.clone(), vec![QueueConfig::new("default", 3)], registry2);
    dispatcher2.start().await.unwrap();

    let status = wait_for_status(&pool, &id, "completed", Duration::from_secs(5)).await;
    assert_eq!(status.as_deref(), Some("completed"));

    dispatcher2.stop().await.unwrap();
}
