//! An in-memory [`JobStoreContract`] implementation used to test dispatcher,
//! worker-loop, and leader-recovery policy without a real Postgres instance.
//!
//! It implements the same claim-ordering and retry-backoff semantics the
//! production Postgres store enforces with SQL, in plain Rust over a mutex-
//! guarded table, so the core crate's policy tests run fast and deterministically.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use swig_core::{CallerTx, ClaimedJob, JobId, JobNotification, JobStatus, JobStoreContract, NewJob, Result, SwigError};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Row {
    id: JobId,
    kind: String,
    queue: String,
    payload: serde_json::Value,
    status: JobStatus,
    priority: i32,
    attempts: i32,
    max_attempts: i32,
    created_at: DateTime<Utc>,
    scheduled_for: DateTime<Utc>,
    instance_id: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    last_error_at: Option<DateTime<Utc>>,
}

struct State {
    rows: Vec<Row>,
    leader: Option<(String, DateTime<Utc>)>,
    pending_notifications: VecDeque<JobNotification>,
}

/// An in-memory job table plus a matching notification queue.
pub struct InMemoryStore {
    state: Mutex<State>,
    notify: Notify,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                rows: Vec::new(),
                leader: None,
                pending_notifications: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert_row(state: &mut State, job: NewJob) -> JobId {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        // Always inserted `pending`, even when `run_at` is in the future
        // (spec §4.3): `eligible` below is what holds a future-dated row back.
        state.rows.push(Row {
            id: id.clone(),
            kind: job.kind.clone(),
            queue: job.queue.clone(),
            payload: job.payload,
            status: JobStatus::Pending,
            priority: job.priority,
            attempts: 0,
            max_attempts: job.max_attempts,
            created_at: now,
            scheduled_for: job.run_at,
            instance_id: None,
            locked_at: None,
            last_error_at: None,
        });
        state.pending_notifications.push_back(JobNotification {
            id: id.clone(),
            queue: job.queue,
            kind: job.kind,
        });
        id
    }

    /// Snapshot a row's current status, for assertions in tests.
    pub fn status_of(&self, id: &str) -> Option<JobStatus> {
        self.state.lock().rows.iter().find(|r| r.id == id).map(|r| r.status)
    }

    pub fn attempts_of(&self, id: &str) -> Option<i32> {
        self.state.lock().rows.iter().find(|r| r.id == id).map(|r| r.attempts)
    }
}

fn eligible(row: &Row, now: DateTime<Utc>) -> bool {
    (row.status == JobStatus::Pending || row.status == JobStatus::Scheduled) && row.scheduled_for <= now
}

#[async_trait]
impl JobStoreContract for InMemoryStore {
    async fn bootstrap_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_job(&self, job: NewJob) -> Result<JobId> {
        let mut state = self.state.lock();
        let id = Self::insert_row(&mut state, job);
        drop(state);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn insert_job_in_tx(&self, _tx: CallerTx<'_>, job: NewJob) -> Result<JobId> {
        self.insert_job(job).await
    }

    async fn insert_batch(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>> {
        let mut state = self.state.lock();
        let ids = jobs.into_iter().map(|j| Self::insert_row(&mut state, j)).collect();
        drop(state);
        self.notify.notify_waiters();
        Ok(ids)
    }

    async fn insert_batch_in_tx(&self, _tx: CallerTx<'_>, jobs: Vec<NewJob>) -> Result<Vec<JobId>> {
        self.insert_batch(jobs).await
    }

    async fn claim(&self, queue: &str, instance_id: &str, worker_id: &str) -> Result<Option<ClaimedJob>> {
        let _ = worker_id;
        let now = Utc::now();
        let mut state = self.state.lock();

        let priority_eligible = state
            .rows
            .iter()
            .any(|r| r.queue == swig_core::PRIORITY_QUEUE && eligible(r, now));

        let target_queue = if priority_eligible { swig_core::PRIORITY_QUEUE } else { queue };

        let mut candidates: Vec<usize> = state
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.queue == target_queue && eligible(r, now))
            .map(|(i, _)| i)
            .collect();

        candidates.sort_by(|&a, &b| {
            let ra = &state.rows[a];
            let rb = &state.rows[b];
            rb.priority.cmp(&ra.priority).then(ra.created_at.cmp(&rb.created_at))
        });

        let Some(&idx) = candidates.first() else {
            return Ok(None);
        };

        let row = &mut state.rows[idx];
        row.status = JobStatus::Processing;
        row.instance_id = Some(instance_id.to_string());
        row.locked_at = Some(now);
        row.attempts += 1;
        Ok(Some(ClaimedJob {
            id: row.id.clone(),
            kind: row.kind.clone(),
            payload: row.payload.clone(),
            queue: row.queue.clone(),
            attempts: row.attempts,
            max_attempts: row.max_attempts,
        }))
    }

    async fn claim_targeted(&self, job_id: &str, instance_id: &str, worker_id: &str) -> Result<Option<ClaimedJob>> {
        let _ = worker_id;
        let now = Utc::now();
        let mut state = self.state.lock();
        let Some(row) = state.rows.iter_mut().find(|r| r.id == job_id) else {
            return Ok(None);
        };
        if !eligible(row, now) {
            return Ok(None);
        }
        row.status = JobStatus::Processing;
        row.instance_id = Some(instance_id.to_string());
        row.locked_at = Some(now);
        row.attempts += 1;
        Ok(Some(ClaimedJob {
            id: row.id.clone(),
            kind: row.kind.clone(),
            payload: row.payload.clone(),
            queue: row.queue.clone(),
            attempts: row.attempts,
            max_attempts: row.max_attempts,
        }))
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(row) = state.rows.iter_mut().find(|r| r.id == job_id) {
            row.status = JobStatus::Completed;
            row.instance_id = None;
            row.locked_at = None;
        }
        Ok(())
    }

    async fn fail(&self, job_id: &str, _error: &str, terminal: bool) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(row) = state.rows.iter_mut().find(|r| r.id == job_id) {
            row.status = if terminal { JobStatus::Failed } else { JobStatus::Pending };
            row.instance_id = None;
            row.locked_at = None;
            row.last_error_at = Some(Utc::now());
            if !terminal {
                // Same backoff formula as `recover_stuck_and_failed`: a
                // retryable failure isn't claimable again until 2^attempts
                // seconds have passed.
                row.scheduled_for = Utc::now() + chrono::Duration::seconds(2i64.pow(row.attempts.max(0) as u32));
            }
        }
        Ok(())
    }

    async fn listen(&self, _channel: &str) -> Result<()> {
        Ok(())
    }

    async fn wait_for_notification(&self) -> Result<Option<JobNotification>> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(n) = state.pending_notifications.pop_front() {
                    return Ok(Some(n));
                }
            }
            self.notify.notified().await;
        }
    }

    async fn try_acquire_leadership(&self, leader_id: &str, ttl_secs: i64) -> Result<bool> {
        let mut state = self.state.lock();
        let now = Utc::now();
        if let Some((_, expires_at)) = &state.leader {
            if *expires_at > now {
                return Ok(false);
            }
        }
        state.leader = Some((leader_id.to_string(), now + chrono::Duration::seconds(ttl_secs)));
        Ok(true)
    }

    async fn refresh_leadership(&self, leader_id: &str, ttl_secs: i64) -> Result<()> {
        let mut state = self.state.lock();
        if let Some((current, expires_at)) = &mut state.leader {
            if current == leader_id {
                *expires_at = Utc::now() + chrono::Duration::seconds(ttl_secs);
            }
        }
        Ok(())
    }

    async fn release_leadership(&self, leader_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some((current, _)) = &state.leader {
            if current == leader_id {
                state.leader = None;
            }
        }
        Ok(())
    }

    async fn recover_stuck_and_failed(&self, stale_after_secs: i64) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut recovered = 0u64;
        for row in state.rows.iter_mut() {
            if row.status == JobStatus::Failed && row.attempts < row.max_attempts {
                let backoff_elapsed = row
                    .last_error_at
                    .map(|t| now - t >= chrono::Duration::seconds(2i64.pow(row.attempts.max(0) as u32)))
                    .unwrap_or(true);
                if backoff_elapsed {
                    row.status = JobStatus::Pending;
                    row.instance_id = None;
                    recovered += 1;
                }
            } else if row.status == JobStatus::Processing {
                let stale = row
                    .locked_at
                    .map(|t| now - t >= chrono::Duration::seconds(stale_after_secs))
                    .unwrap_or(false);
                if stale {
                    row.status = JobStatus::Pending;
                    row.instance_id = None;
                    row.locked_at = None;
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }

    async fn cleanup_instance(&self, instance_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        for row in state.rows.iter_mut() {
            if row.status == JobStatus::Processing && row.instance_id.as_deref() == Some(instance_id) {
                row.status = if row.attempts >= row.max_attempts {
                    JobStatus::Failed
                } else {
                    JobStatus::Pending
                };
                row.instance_id = None;
                row.locked_at = None;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().rows.clear();
        Ok(())
    }
}

/// Helper to build a transaction-shaped `&mut dyn Any` for tests exercising
/// the `TransactionMismatch` path: any type other than the store's own
/// recognized shape is "unrecognized".
pub fn mismatched_tx() -> Box<dyn Any + Send> {
    Box::new(42u32)
}

pub fn store_error(msg: &str) -> SwigError {
    SwigError::store(anyhow::anyhow!(msg.to_string()))
}
