//! PostgreSQL implementation of the swig job queue.
//!
//! This crate provides the sole production implementation of
//! `JobStoreContract` from `swig-core`: schema bootstrap, the priority-aware
//! skip-locked claim query, `LISTEN`/`NOTIFY` delivery, advisory-lock leader
//! election with a lease row, backoff-aware recovery, and shutdown cleanup.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE swig_jobs (
//!     id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
//!     kind TEXT NOT NULL,
//!     queue TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     status TEXT NOT NULL DEFAULT 'pending'
//!         CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'scheduled')),
//!     priority INTEGER NOT NULL DEFAULT 1,
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     max_attempts INTEGER NOT NULL DEFAULT 3,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     scheduled_for TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     instance_id TEXT,
//!     worker_id TEXT,
//!     locked_at TIMESTAMPTZ,
//!     last_error TEXT,
//!     last_error_at TIMESTAMPTZ
//! );
//!
//! CREATE UNLOGGED TABLE swig_leader (
//!     id TEXT PRIMARY KEY,
//!     leader_id TEXT NOT NULL,
//!     expires_at TIMESTAMPTZ NOT NULL,
//!     acquired_at TIMESTAMPTZ NOT NULL,
//!     CHECK (expires_at > acquired_at)
//! );
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use swig_postgres::PgStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let store = PgStore::new(pool);
//! store.bootstrap_schema().await?;
//! ```

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgListener, PgNotification};
use sqlx::{PgPool, Postgres, Row, Transaction};
use swig_core::{CallerTx, ClaimedJob, JobId, JobNotification, NewJob, Result, SwigError, PRIORITY_QUEUE};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

const LEASE_ROW_ID: &str = "queue_leader";

fn store_err(err: sqlx::Error) -> SwigError {
    SwigError::store(err)
}

fn parse_job_id(job_id: &str) -> Result<uuid::Uuid> {
    job_id
        .parse()
        .map_err(|_| SwigError::store(anyhow::anyhow!("invalid job id {job_id}")))
}

/// PostgreSQL job store implementation.
pub struct PgStore {
    pool: PgPool,
    notify_tx: broadcast::Sender<JobNotification>,
    listening: Mutex<bool>,
    advisory_conn: Mutex<Option<sqlx::pool::PoolConnection<Postgres>>>,
}

impl PgStore {
    /// Create a new PostgreSQL job store backed by `pool`.
    pub fn new(pool: PgPool) -> Arc<Self> {
        let (notify_tx, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            pool,
            notify_tx,
            listening: Mutex::new(false),
            advisory_conn: Mutex::new(None),
        })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Spawn the background `PgListener` task exactly once. Every worker loop
    /// calls `listen`, but only the first establishes the dedicated
    /// connection; the rest fan out from the same broadcast channel.
    async fn ensure_listening(&self, channel: &str) -> Result<()> {
        let mut listening = self.listening.lock().await;
        if *listening {
            return Ok(());
        }

        let mut listener = PgListener::connect_with(&self.pool).await.map_err(store_err)?;
        listener.listen(channel).await.map_err(store_err)?;

        let tx = self.notify_tx.clone();
        tokio::spawn(async move {
            loop {
                // `recv` transparently reconnects on connection loss.
                match listener.recv().await {
                    Ok(notification) => {
                        if let Some(parsed) = parse_notification(&notification) {
                            let _ = tx.send(parsed);
                        }
                    }
                    Err(err) => {
                        error!(?err, "pg listener: recv failed");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        *listening = true;
        Ok(())
    }

    /// Queue statistics by status, grounded in the teacher's `QueueStats`.
    pub async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'scheduled') AS scheduled
            FROM swig_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(QueueStats {
            pending: row.get("pending"),
            processing: row.get("processing"),
            completed: row.get("completed"),
            failed: row.get("failed"),
            scheduled: row.get("scheduled"),
        })
    }
}

/// Job queue statistics (not part of spec.md; supplemental observability surface).
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub scheduled: i64,
}

fn parse_notification(notification: &PgNotification) -> Option<JobNotification> {
    match serde_json::from_str::<JobNotification>(notification.payload()) {
        Ok(n) => Some(n),
        Err(err) => {
            warn!(?err, payload = notification.payload(), "pg listener: malformed notification payload");
            None
        }
    }
}

fn row_to_claimed_job(row: sqlx::postgres::PgRow) -> ClaimedJob {
    ClaimedJob {
        id: row.get::<uuid::Uuid, _>("id").to_string(),
        kind: row.get("kind"),
        payload: row.get("payload"),
        queue: row.get("queue"),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
    }
}

async fn insert_one<'e, E>(exec: E, job: &NewJob) -> std::result::Result<JobId, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    // Always inserted `pending`, even when `scheduled_for` is in the future
    // (spec §4.3): the claim predicates are what hold a future-dated row back,
    // not its status.
    let row = sqlx::query(
        r#"
        INSERT INTO swig_jobs (kind, queue, payload, priority, scheduled_for, max_attempts, status)
        VALUES ($1, $2, $3, $4, $5, $6, 'pending')
        RETURNING id
        "#,
    )
    .bind(&job.kind)
    .bind(&job.queue)
    .bind(&job.payload)
    .bind(job.priority)
    .bind(job.run_at)
    .bind(job.max_attempts)
    .fetch_one(exec)
    .await?;

    Ok(row.get::<uuid::Uuid, _>("id").to_string())
}

/// `VALUES` tuples are built manually rather than with `QueryBuilder` so the
/// statement stays one `INSERT` for an arbitrarily large batch.
async fn insert_batch_raw<'e, E>(exec: E, jobs: &[NewJob]) -> std::result::Result<Vec<JobId>, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let tuples: Vec<String> = (0..jobs.len())
        .map(|i| {
            let base = i * 6;
            format!(
                "(${}, ${}, ${}, ${}, ${}, ${}, 'pending')",
                base + 1,
                base + 2,
                base + 3,
                base + 4,
                base + 5,
                base + 6,
            )
        })
        .collect();

    let sql = format!(
        "INSERT INTO swig_jobs (kind, queue, payload, priority, scheduled_for, max_attempts, status) VALUES {} RETURNING id",
        tuples.join(", ")
    );

    let mut query = sqlx::query(&sql);
    for job in jobs {
        query = query
            .bind(&job.kind)
            .bind(&job.queue)
            .bind(&job.payload)
            .bind(job.priority)
            .bind(job.run_at)
            .bind(job.max_attempts);
    }

    let rows = query.fetch_all(exec).await?;
    Ok(rows.into_iter().map(|r| r.get::<uuid::Uuid, _>("id").to_string()).collect())
}

fn downcast_tx<'a>(tx: CallerTx<'a>) -> Result<&'a mut Transaction<'static, Postgres>> {
    (tx as &mut dyn Any)
        .downcast_mut::<Transaction<'static, Postgres>>()
        .ok_or_else(|| SwigError::TransactionMismatch("expected a sqlx::Transaction<'static, Postgres>".to_string()))
}

#[async_trait]
impl swig_core::JobStoreContract for PgStore {
    async fn bootstrap_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swig_jobs (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                kind TEXT NOT NULL,
                queue TEXT NOT NULL,
                payload JSONB NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'scheduled')),
                priority INTEGER NOT NULL DEFAULT 1,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                scheduled_for TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                instance_id TEXT,
                worker_id TEXT,
                locked_at TIMESTAMPTZ,
                last_error TEXT,
                last_error_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            CREATE UNLOGGED TABLE IF NOT EXISTS swig_leader (
                id TEXT PRIMARY KEY,
                leader_id TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                acquired_at TIMESTAMPTZ NOT NULL,
                CHECK (expires_at > acquired_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            CREATE OR REPLACE FUNCTION swig_jobs_notify() RETURNS trigger AS $$
            BEGIN
                PERFORM pg_notify('swig_jobs', json_build_object(
                    'id', NEW.id,
                    'queue', NEW.queue,
                    'kind', NEW.kind
                )::text);
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query("DROP TRIGGER IF EXISTS swig_jobs_notify_trigger ON swig_jobs")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        sqlx::query(
            r#"
            CREATE TRIGGER swig_jobs_notify_trigger
            AFTER INSERT ON swig_jobs
            FOR EACH ROW EXECUTE FUNCTION swig_jobs_notify()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        info!("pg store: schema bootstrap complete");
        Ok(())
    }

    async fn insert_job(&self, job: NewJob) -> Result<JobId> {
        insert_one(&self.pool, &job).await.map_err(store_err)
    }

    async fn insert_job_in_tx(&self, tx: CallerTx<'_>, job: NewJob) -> Result<JobId> {
        let tx = downcast_tx(tx)?;
        insert_one(&mut **tx, &job).await.map_err(store_err)
    }

    async fn insert_batch(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let ids = insert_batch_raw(&mut *tx, &jobs).await.map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(ids)
    }

    async fn insert_batch_in_tx(&self, tx: CallerTx<'_>, jobs: Vec<NewJob>) -> Result<Vec<JobId>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let tx = downcast_tx(tx)?;
        insert_batch_raw(&mut **tx, &jobs).await.map_err(store_err)
    }

    async fn claim(&self, queue: &str, instance_id: &str, worker_id: &str) -> Result<Option<ClaimedJob>> {
        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT id
                FROM swig_jobs
                WHERE status = 'pending'
                  AND scheduled_for <= NOW()
                  AND (
                        (queue = $1 AND NOT EXISTS (
                            SELECT 1 FROM swig_jobs p
                            WHERE p.queue = $3 AND p.status = 'pending' AND p.scheduled_for <= NOW()
                        ))
                     OR queue = $3
                  )
                ORDER BY (queue = $3) DESC, priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE swig_jobs
            SET status = 'processing',
                instance_id = $2,
                worker_id = $4,
                locked_at = NOW(),
                attempts = attempts + 1
            WHERE id IN (SELECT id FROM candidate)
            RETURNING id, kind, queue, payload, attempts, max_attempts
            "#,
        )
        .bind(queue)
        .bind(instance_id)
        .bind(PRIORITY_QUEUE)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.map(row_to_claimed_job))
    }

    async fn claim_targeted(&self, job_id: &str, instance_id: &str, worker_id: &str) -> Result<Option<ClaimedJob>> {
        let id = parse_job_id(job_id)?;

        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT id
                FROM swig_jobs
                WHERE id = $1 AND status = 'pending' AND scheduled_for <= NOW()
                FOR UPDATE SKIP LOCKED
            )
            UPDATE swig_jobs
            SET status = 'processing',
                instance_id = $2,
                worker_id = $3,
                locked_at = NOW(),
                attempts = attempts + 1
            WHERE id IN (SELECT id FROM candidate)
            RETURNING id, kind, queue, payload, attempts, max_attempts
            "#,
        )
        .bind(id)
        .bind(instance_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.map(row_to_claimed_job))
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        let id = parse_job_id(job_id)?;
        sqlx::query(
            r#"
            UPDATE swig_jobs
            SET status = 'completed', instance_id = NULL, worker_id = NULL, locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn fail(&self, job_id: &str, error: &str, terminal: bool) -> Result<()> {
        let id = parse_job_id(job_id)?;
        let status = if terminal { "failed" } else { "pending" };
        // Matches the backoff formula `recover_stuck_and_failed` uses: a
        // retryable failure is not immediately reclaimable, it comes back
        // after 2^attempts seconds.
        sqlx::query(
            r#"
            UPDATE swig_jobs
            SET status = $2,
                instance_id = NULL,
                worker_id = NULL,
                locked_at = NULL,
                last_error = $3,
                last_error_at = NOW(),
                scheduled_for = CASE WHEN $2 = 'pending' THEN NOW() + (POWER(2, attempts) * INTERVAL '1 second') ELSE scheduled_for END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<()> {
        self.ensure_listening(channel).await
    }

    async fn wait_for_notification(&self) -> Result<Option<JobNotification>> {
        let mut rx = self.notify_tx.subscribe();
        loop {
            match rx.recv().await {
                Ok(n) => return Ok(Some(n)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "pg notification receiver lagged, continuing");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn try_acquire_leadership(&self, leader_id: &str, ttl_secs: i64) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(swig_core::DEFAULT_LEADER_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
            .map_err(store_err)?;

        if !acquired {
            return Ok(false);
        }

        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(ttl_secs);
        let write = sqlx::query(
            r#"
            INSERT INTO swig_leader (id, leader_id, expires_at, acquired_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET leader_id = $2, expires_at = $3, acquired_at = $4
            "#,
        )
        .bind(LEASE_ROW_ID)
        .bind(leader_id)
        .bind(expires_at)
        .bind(now)
        .execute(&mut *conn)
        .await;

        if let Err(err) = write {
            warn!(?err, "pg store: lease write failed, releasing advisory lock");
            let _: std::result::Result<bool, _> = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                .bind(swig_core::DEFAULT_LEADER_LOCK_KEY)
                .fetch_one(&mut *conn)
                .await;
            return Ok(false);
        }

        *self.advisory_conn.lock().await = Some(conn);
        Ok(true)
    }

    async fn refresh_leadership(&self, leader_id: &str, ttl_secs: i64) -> Result<()> {
        let expires_at = Utc::now() + chrono::Duration::seconds(ttl_secs);
        sqlx::query("UPDATE swig_leader SET expires_at = $1 WHERE id = $2 AND leader_id = $3")
            .bind(expires_at)
            .bind(LEASE_ROW_ID)
            .bind(leader_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn release_leadership(&self, leader_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM swig_leader WHERE id = $1 AND leader_id = $2")
            .bind(LEASE_ROW_ID)
            .bind(leader_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        if let Some(mut conn) = self.advisory_conn.lock().await.take() {
            let _: std::result::Result<bool, _> = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                .bind(swig_core::DEFAULT_LEADER_LOCK_KEY)
                .fetch_one(&mut *conn)
                .await;
        }
        Ok(())
    }

    async fn recover_stuck_and_failed(&self, stale_after_secs: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE swig_jobs
            SET status = 'pending',
                instance_id = NULL,
                worker_id = NULL,
                locked_at = NULL,
                scheduled_for = CASE WHEN attempts > 0 THEN NOW() + (POWER(2, attempts) * INTERVAL '1 second') ELSE NOW() END
            WHERE
                (
                    status = 'failed'
                    AND attempts < max_attempts
                    AND (last_error_at IS NULL OR last_error_at < NOW() - (POWER(2, attempts) * INTERVAL '1 second'))
                )
                OR
                (
                    status = 'processing'
                    AND (instance_id IS NULL OR locked_at < NOW() - ($1 * INTERVAL '1 second'))
                )
            "#,
        )
        .bind(stale_after_secs as f64)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(result.rows_affected())
    }

    async fn cleanup_instance(&self, instance_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE swig_jobs
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                last_error = CASE WHEN attempts >= max_attempts THEN 'Job failed due to instance shutdown' ELSE last_error END,
                last_error_at = CASE WHEN attempts >= max_attempts THEN NOW() ELSE last_error_at END,
                instance_id = NULL,
                worker_id = NULL,
                locked_at = NULL
            WHERE instance_id = $1 AND status = 'processing'
            "#,
        )
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        sqlx::query("DROP TRIGGER IF EXISTS swig_jobs_notify_trigger ON swig_jobs")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        sqlx::query("DROP FUNCTION IF EXISTS swig_jobs_notify()")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        sqlx::query("DROP TABLE IF EXISTS swig_jobs")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        sqlx::query("DROP TABLE IF EXISTS swig_leader")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
