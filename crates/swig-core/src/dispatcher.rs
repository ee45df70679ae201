//! The dispatcher: enqueue API (spec §4.3, C3) plus the programmatic surface
//! that wires the registry, claim engine, worker loops, leader election, and
//! shutdown coordinator together (spec §6).

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::barrier::WorkerBarrier;
use crate::error::{Result, SwigError};
use crate::job::{EnqueueOptions, JobId, NewJob};
use crate::leader::{self, LeaderConfig, LeaderState, DEFAULT_LEADER_TTL_SECS, DEFAULT_RECOVERY_INTERVAL, DEFAULT_STALE_AFTER_SECS};
use crate::registry::{Handler, HandlerRegistry};
use crate::shutdown::{self, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::store::{CallerTx, JobStoreContract};

/// The fixed notification channel name the whole fleet shares (spec §4.6).
pub const NOTIFY_CHANNEL: &str = "swig_jobs";

/// Well-known advisory lock key for leader election (spec §4.7 step 1).
pub const DEFAULT_LEADER_LOCK_KEY: i64 = 1_234_567;

/// An item handed to a batch enqueue call: a handler plus its own options.
pub trait EnqueueHandler: Handler {
    fn serialize_payload(&self) -> std::result::Result<Value, serde_json::Error>;
}

impl<T> EnqueueHandler for T
where
    T: Handler + Serialize,
{
    fn serialize_payload(&self) -> std::result::Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// One named queue and how many concurrent worker loops serve it. Any value
/// below 3 is raised to 3 at `start()` (spec §6, B2).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub max_workers: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        Self {
            name: name.into(),
            max_workers,
        }
    }

    fn effective_workers(&self) -> usize {
        self.max_workers.max(3)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub leader_lock_key: i64,
    pub leader_ttl_secs: i64,
    pub recovery_interval: Duration,
    pub stale_after_secs: i64,
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            leader_lock_key: DEFAULT_LEADER_LOCK_KEY,
            leader_ttl_secs: DEFAULT_LEADER_TTL_SECS,
            recovery_interval: DEFAULT_RECOVERY_INTERVAL,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

struct RunningState {
    worker_tasks: Vec<JoinHandle<()>>,
    recovery_task: Option<JoinHandle<()>>,
}

pub struct Dispatcher {
    store: Arc<dyn JobStoreContract>,
    registry: HandlerRegistry,
    queues: Vec<QueueConfig>,
    config: DispatcherConfig,
    instance_id: String,
    shutdown: CancellationToken,
    barrier: WorkerBarrier,
    leader_state: LeaderState,
    running: Mutex<Option<RunningState>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStoreContract>, queues: Vec<QueueConfig>, registry: HandlerRegistry) -> Self {
        Self::with_config(store, queues, registry, DispatcherConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn JobStoreContract>,
        queues: Vec<QueueConfig>,
        registry: HandlerRegistry,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            queues,
            config,
            instance_id: Uuid::new_v4().to_string(),
            shutdown: CancellationToken::new(),
            barrier: WorkerBarrier::new(),
            leader_state: LeaderState::new(),
            running: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_leader(&self) -> bool {
        self.leader_state.is_leader()
    }

    fn leader_config(&self) -> LeaderConfig {
        LeaderConfig {
            leader_id: self.instance_id.clone(),
            ttl_secs: self.config.leader_ttl_secs,
            recovery_interval: self.config.recovery_interval,
            stale_after_secs: self.config.stale_after_secs,
        }
    }

    /// Bootstrap schema (best-effort), attempt leadership, and start worker pools.
    pub async fn start(&self) -> Result<()> {
        if let Err(err) = self.store.bootstrap_schema().await {
            tracing::warn!(?err, "dispatcher start: schema bootstrap failed, continuing anyway");
        }

        leader::try_become_leader(&self.store, &self.leader_config(), &self.leader_state).await;
        let recovery_task = leader::spawn_recovery_task(
            self.store.clone(),
            self.leader_config(),
            self.leader_state.clone(),
            self.shutdown.clone(),
        );

        let mut worker_tasks = Vec::new();
        for queue in &self.queues {
            for _ in 0..queue.effective_workers() {
                let store = self.store.clone();
                let registry = self.registry.clone();
                let shutdown = self.shutdown.clone();
                let barrier = self.barrier.clone();
                let config = crate::worker::WorkerLoopConfig {
                    queue: queue.name.clone(),
                    notify_channel: NOTIFY_CHANNEL,
                    instance_id: self.instance_id.clone(),
                };
                worker_tasks.push(tokio::spawn(crate::worker::run_worker_loop(
                    store, registry, config, shutdown, barrier,
                )));
            }
        }

        info!(
            instance_id = %self.instance_id,
            leader = self.leader_state.is_leader(),
            queues = self.queues.len(),
            "dispatcher started"
        );

        *self.running.lock().await = Some(RunningState {
            worker_tasks,
            recovery_task,
        });

        Ok(())
    }

    /// Graceful shutdown (spec §4.8). Imposes the configured default timeout
    /// if none is supplied.
    pub async fn stop(&self) -> Result<()> {
        self.stop_with_timeout(self.config.shutdown_timeout).await
    }

    pub async fn stop_with_timeout(&self, timeout: Duration) -> Result<()> {
        let result = shutdown::graceful_stop(
            self.store.clone(),
            self.shutdown.clone(),
            self.barrier.clone(),
            self.instance_id.clone(),
            self.leader_config(),
            self.leader_state.clone(),
            timeout,
        )
        .await;

        if let Some(state) = self.running.lock().await.take() {
            for task in state.worker_tasks {
                task.abort();
            }
            if let Some(task) = state.recovery_task {
                task.abort();
            }
        }

        result
    }

    /// Destructive administrative teardown. Not part of graceful shutdown.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }

    // ---- Enqueue API (spec §4.3) ----

    pub async fn enqueue<H>(&self, handler: &H, options: EnqueueOptions) -> Result<JobId>
    where
        H: Handler + Serialize,
    {
        let job = self.build_new_job(handler, options)?;
        self.store.insert_job(job).await
    }

    pub async fn enqueue_in_tx<H>(&self, tx: CallerTx<'_>, handler: &H, options: EnqueueOptions) -> Result<JobId>
    where
        H: Handler + Serialize,
    {
        let job = self.build_new_job(handler, options)?;
        self.store.insert_job_in_tx(tx, job).await
    }

    pub async fn enqueue_batch(&self, items: Vec<(Box<dyn EnqueueHandler>, EnqueueOptions)>) -> Result<Vec<JobId>> {
        let jobs = self.build_new_jobs(items)?;
        self.store.insert_batch(jobs).await
    }

    pub async fn enqueue_batch_in_tx(
        &self,
        tx: CallerTx<'_>,
        items: Vec<(Box<dyn EnqueueHandler>, EnqueueOptions)>,
    ) -> Result<Vec<JobId>> {
        let jobs = self.build_new_jobs(items)?;
        self.store.insert_batch_in_tx(tx, jobs).await
    }

    fn build_new_job<H>(&self, handler: &H, options: EnqueueOptions) -> Result<NewJob>
    where
        H: Handler + Serialize,
    {
        let payload = serde_json::to_value(handler).map_err(SwigError::Serialization)?;
        Ok(NewJob {
            kind: handler.kind().to_string(),
            payload,
            queue: options.queue,
            priority: options.priority,
            run_at: options.run_at,
            max_attempts: options.max_attempts,
        })
    }

    fn build_new_jobs(&self, items: Vec<(Box<dyn EnqueueHandler>, EnqueueOptions)>) -> Result<Vec<NewJob>> {
        items
            .into_iter()
            .map(|(handler, options)| {
                let payload = handler.serialize_payload().map_err(SwigError::Serialization)?;
                Ok(NewJob {
                    kind: handler.kind().to_string(),
                    payload,
                    queue: options.queue,
                    priority: options.priority,
                    run_at: options.run_at,
                    max_attempts: options.max_attempts,
                })
            })
            .collect()
    }
}
