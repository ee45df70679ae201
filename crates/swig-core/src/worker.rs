//! Worker Loop (spec §4.5, C5).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::barrier::WorkerBarrier;
use crate::job::ClaimedJob;
use crate::registry::{HandlerRegistry, WorkerContext};
use crate::store::JobStoreContract;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Idle fallback poll (spec §4.6). Recovered/backoff-delayed rows become
/// claimable through a plain `UPDATE` that never fires the `NOTIFY` trigger,
/// so a worker waiting only on notifications would never learn about them.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct WorkerLoopConfig {
    pub queue: String,
    pub notify_channel: &'static str,
    pub instance_id: String,
}

/// Runs a single worker loop until `shutdown` is cancelled. Registers itself
/// on `barrier` for the lifetime of the loop so shutdown can wait for drain.
pub async fn run_worker_loop(
    store: Arc<dyn JobStoreContract>,
    registry: HandlerRegistry,
    config: WorkerLoopConfig,
    shutdown: CancellationToken,
    barrier: WorkerBarrier,
) {
    let worker_id = format!("{}-{}", config.instance_id, Uuid::new_v4());
    barrier.enter();
    let _guard = scopeguard(barrier.clone());

    if let Err(err) = store.listen(config.notify_channel).await {
        warn!(?err, queue = %config.queue, "worker loop: initial LISTEN failed, falling back to polling");
    }

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match store.claim(&config.queue, &config.instance_id, &worker_id).await {
            Ok(Some(job)) => {
                run_claimed_job(&store, &registry, &config, &worker_id, job, &shutdown).await;
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                error!(?err, queue = %config.queue, "worker loop: untargeted claim failed");
                sleep_unless_cancelled(&shutdown).await;
                continue;
            }
        }

        let notification = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            result = store.wait_for_notification() => result,
            _ = tokio::time::sleep(POLL_INTERVAL) => Ok(None),
        };

        let notification = match notification {
            Ok(n) => n,
            Err(err) => {
                error!(?err, queue = %config.queue, "worker loop: wait_for_notification failed");
                sleep_unless_cancelled(&shutdown).await;
                continue;
            }
        };

        let Some(notification) = notification else {
            continue;
        };

        match store.claim_targeted(&notification.id, &config.instance_id, &worker_id).await {
            Ok(Some(job)) => run_claimed_job(&store, &registry, &config, &worker_id, job, &shutdown).await,
            Ok(None) => debug!(job_id = %notification.id, "worker loop: targeted claim lost the race"),
            Err(err) => {
                error!(?err, job_id = %notification.id, "worker loop: targeted claim failed");
                sleep_unless_cancelled(&shutdown).await;
            }
        }
    }
}

async fn run_claimed_job(
    store: &Arc<dyn JobStoreContract>,
    registry: &HandlerRegistry,
    config: &WorkerLoopConfig,
    worker_id: &str,
    job: ClaimedJob,
    shutdown: &CancellationToken,
) {
    let ClaimedJob {
        id,
        kind,
        payload,
        attempts,
        max_attempts,
        ..
    } = job;
    let terminal_if_fails = attempts >= max_attempts;

    let Some(lookup) = registry.lookup(&kind, payload) else {
        let msg = format!("no handler registered for kind {kind}");
        warn!(job_id = %id, %kind, "worker loop: unknown kind");
        record_failure(store, &id, &msg, terminal_if_fails).await;
        return;
    };

    let handler = match lookup {
        Ok(handler) => handler,
        Err(err) => {
            warn!(job_id = %id, %kind, ?err, "worker loop: payload deserialization failed");
            record_failure(store, &id, &err.to_string(), terminal_if_fails).await;
            return;
        }
    };

    let ctx = WorkerContext {
        job_id: id.clone(),
        attempt: attempts,
        max_attempts,
        instance_id: config.instance_id.clone(),
        worker_id: worker_id.to_string(),
        cancellation: shutdown.clone(),
    };

    match handler.execute(ctx).await {
        Ok(()) => {
            info!(job_id = %id, %kind, attempt = attempts, "worker loop: job completed");
            if let Err(err) = store.complete(&id).await {
                error!(job_id = %id, ?err, "worker loop: failed to record completion");
            }
        }
        Err(err) => {
            warn!(job_id = %id, %kind, attempt = attempts, %err, "worker loop: handler failed");
            record_failure(store, &id, &err.to_string(), terminal_if_fails).await;
        }
    }
}

async fn record_failure(store: &Arc<dyn JobStoreContract>, job_id: &str, message: &str, terminal: bool) {
    if let Err(err) = store.fail(job_id, message, terminal).await {
        error!(job_id = %job_id, ?err, "worker loop: failed to record failure outcome");
    }
}

async fn sleep_unless_cancelled(shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
    }
}

/// Ensures `barrier.exit()` runs when the loop returns by any path, including panics.
fn scopeguard(barrier: WorkerBarrier) -> impl Drop {
    struct Guard(WorkerBarrier);
    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.exit();
        }
    }
    Guard(barrier)
}
