//! The job data model (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque row identifier. The store generates this on insert.
pub type JobId = String;

pub const DEFAULT_QUEUE: &str = "default";
pub const PRIORITY_QUEUE: &str = "priority";
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
pub const DEFAULT_PRIORITY: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Scheduled,
}

impl JobStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Scheduled => "scheduled",
        }
    }
}

/// Options accepted by the enqueue API (spec §4.3).
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub queue: String,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub max_attempts: i32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            priority: DEFAULT_PRIORITY,
            run_at: Utc::now(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// A fully-materialized row ready for insertion, produced by the enqueue API
/// after the handler has been validated and serialized.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: String,
    pub payload: Value,
    pub queue: String,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub max_attempts: i32,
}

/// A row returned by a successful claim, owned by the calling instance/worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: JobId,
    pub kind: String,
    pub payload: Value,
    pub queue: String,
    pub attempts: i32,
    pub max_attempts: i32,
}

impl ClaimedJob {
    /// True once this attempt, if it fails, must become terminal rather than retried.
    pub fn exhausts_attempts(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// The `{id, queue, kind}` payload carried on `swig_jobs` notifications (spec §4.6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobNotification {
    pub id: JobId,
    pub queue: String,
    pub kind: String,
}

/// A full row, as read back for inspection/testing rather than claiming.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: JobId,
    pub kind: String,
    pub queue: String,
    pub payload: Value,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    pub instance_id: Option<String>,
    pub worker_id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}
