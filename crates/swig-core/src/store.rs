//! Job Store Contract (spec §4.2, C2).
//!
//! The set of database operations the dispatch engine depends on. A
//! production implementation lives in `swig-postgres`; a DB-less in-memory
//! implementation for fast policy tests lives in `swig-testing`. Both must
//! honor this contract identically (spec §6).
//!
//! `attach_tx`/`*_in_tx` accept a caller-supplied, driver-native transaction
//! behind `&mut dyn Any` rather than a generic parameter, so the trait stays
//! object-safe and a single `Arc<dyn JobStoreContract>` can be shared across
//! worker loops. A store that cannot downcast the value it is handed returns
//! `SwigError::TransactionMismatch` rather than panicking.

use std::any::Any;

use async_trait::async_trait;

use crate::error::Result;
use crate::job::{ClaimedJob, JobId, JobNotification, NewJob};

/// A caller-supplied transaction, type-erased so the contract stays store-agnostic.
pub type CallerTx<'a> = &'a mut (dyn Any + Send);

#[async_trait]
pub trait JobStoreContract: Send + Sync {
    /// Idempotently create `swig_jobs`, `swig_leader`, and the notify trigger.
    async fn bootstrap_schema(&self) -> Result<()>;

    /// Insert one row outside of any caller transaction.
    async fn insert_job(&self, job: NewJob) -> Result<JobId>;

    /// Insert one row joined to the caller's own transaction.
    async fn insert_job_in_tx(&self, tx: CallerTx<'_>, job: NewJob) -> Result<JobId>;

    /// Insert many rows as a single statement: all rows commit or none do.
    async fn insert_batch(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>>;

    /// Batch insert joined to the caller's own transaction.
    async fn insert_batch_in_tx(&self, tx: CallerTx<'_>, jobs: Vec<NewJob>) -> Result<Vec<JobId>>;

    /// Untargeted claim: best eligible row in `queue` under the priority-preemption policy.
    async fn claim(&self, queue: &str, instance_id: &str, worker_id: &str) -> Result<Option<ClaimedJob>>;

    /// Targeted claim: a specific row, driven by a notification. Returns `None`
    /// if another worker already won it or it is not eligible.
    async fn claim_targeted(&self, job_id: &str, instance_id: &str, worker_id: &str) -> Result<Option<ClaimedJob>>;

    /// Transition `processing -> completed`, clearing ownership fields.
    async fn complete(&self, job_id: &str) -> Result<()>;

    /// Record a failed attempt. `terminal` selects `failed` vs. `pending` and
    /// is decided by the caller from `ClaimedJob::exhausts_attempts`.
    async fn fail(&self, job_id: &str, error: &str, terminal: bool) -> Result<()>;

    /// LISTEN on `channel`. Idempotent; safe to call from every worker loop.
    async fn listen(&self, channel: &str) -> Result<()>;

    /// Block until a notification arrives or cancellation ends the wait.
    /// `None` on cancellation; never a timeout error for that case.
    async fn wait_for_notification(&self) -> Result<Option<JobNotification>>;

    /// Non-blocking attempt to become leader. `false` means another instance holds it.
    async fn try_acquire_leadership(&self, leader_id: &str, ttl_secs: i64) -> Result<bool>;

    /// Extend the current leader's lease. Only ever called by the holder.
    async fn refresh_leadership(&self, leader_id: &str, ttl_secs: i64) -> Result<()>;

    /// Delete the lease row and release the advisory lock.
    async fn release_leadership(&self, leader_id: &str) -> Result<()>;

    /// One leader recovery tick (spec §4.7): requeue backed-off failures and
    /// reclaim stuck `processing` rows. Returns rows affected.
    async fn recover_stuck_and_failed(&self, stale_after_secs: i64) -> Result<u64>;

    /// Shutdown cleanup (spec §4.8 step 4): every row owned by `instance_id`
    /// becomes `pending` or terminally `failed` depending on attempts.
    async fn cleanup_instance(&self, instance_id: &str) -> Result<()>;

    /// Destructive administrative teardown. Not part of graceful shutdown.
    async fn close(&self) -> Result<()>;
}
