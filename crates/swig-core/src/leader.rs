//! Leader election & recovery (spec §4.7, C7).
//!
//! Exactly one dispatcher instance in the fleet runs the recovery tick at any
//! time. Leadership is a process-level advisory lock (held for the life of
//! the store's dedicated connection) plus an expiring lease row purely for
//! observability / fleet introspection (spec §3, I4); the advisory lock is
//! what actually excludes other writers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::store::JobStoreContract;

pub const DEFAULT_LEADER_TTL_SECS: i64 = 30;
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STALE_AFTER_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub leader_id: String,
    pub ttl_secs: i64,
    pub recovery_interval: Duration,
    pub stale_after_secs: i64,
}

/// Tracks whether this instance currently believes itself leader, and owns
/// the recovery-tick task while it does.
#[derive(Clone)]
pub struct LeaderState {
    is_leader: Arc<AtomicBool>,
}

impl LeaderState {
    pub fn new() -> Self {
        Self {
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }
}

/// Attempt leadership once at startup (spec step 1-2). Never blocks; a
/// failed attempt leaves the instance a follower contributing only worker
/// capacity.
pub async fn try_become_leader(store: &Arc<dyn JobStoreContract>, config: &LeaderConfig, state: &LeaderState) -> bool {
    match store.try_acquire_leadership(&config.leader_id, config.ttl_secs).await {
        Ok(true) => {
            info!(leader_id = %config.leader_id, "leader election: acquired leadership");
            state.is_leader.store(true, Ordering::SeqCst);
            true
        }
        Ok(false) => false,
        Err(err) => {
            warn!(?err, "leader election: lease write failed, remaining a follower");
            false
        }
    }
}

/// Spawn the recovery-tick task. No-op if this instance never became leader.
pub fn spawn_recovery_task(
    store: Arc<dyn JobStoreContract>,
    config: LeaderConfig,
    state: LeaderState,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !state.is_leader() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.recovery_interval);
        interval.tick().await; // first tick fires immediately; skip it, we just became leader
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            if let Err(err) = store.refresh_leadership(&config.leader_id, config.ttl_secs).await {
                error!(?err, "leader recovery: failed to refresh lease");
            }

            match store.recover_stuck_and_failed(config.stale_after_secs).await {
                Ok(0) => {}
                Ok(n) => info!(recovered = n, "leader recovery: requeued stuck/backed-off jobs"),
                Err(err) => error!(?err, "leader recovery: tick failed"),
            }
        }
    }))
}
