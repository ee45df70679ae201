//! Shutdown Coordinator (spec §4.8, C8).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Result, SwigError};
use crate::leader::{LeaderConfig, LeaderState};
use crate::store::JobStoreContract;
use crate::barrier::WorkerBarrier;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the full graceful-shutdown protocol: stop accepting new work, wait
/// (bounded) for in-flight handlers to finish, reclaim anything this
/// instance still owns, and release leadership if held.
///
/// Step 4 (instance cleanup) always runs, even after a timeout, on a
/// best-effort basis — a stranded `processing` row is worse than a slightly
/// slow shutdown.
pub async fn graceful_stop(
    store: Arc<dyn JobStoreContract>,
    shutdown: CancellationToken,
    barrier: WorkerBarrier,
    instance_id: String,
    leader_config: LeaderConfig,
    leader_state: LeaderState,
    deadline: Duration,
) -> Result<()> {
    shutdown.cancel();

    let drained = tokio::time::timeout(deadline, barrier.drained()).await.is_ok();

    if let Err(err) = store.cleanup_instance(&instance_id).await {
        error!(?err, %instance_id, "shutdown: instance cleanup failed");
    }

    if leader_state.is_leader() {
        if let Err(err) = store.release_leadership(&leader_config.leader_id).await {
            warn!(?err, "shutdown: failed to release leadership lease");
        }
    }

    if drained {
        info!(%instance_id, "shutdown: all worker loops drained");
        Ok(())
    } else {
        let outstanding = barrier.outstanding();
        warn!(outstanding, %instance_id, "shutdown: timed out waiting for worker loops to drain");
        Err(SwigError::Timeout { outstanding })
    }
}
