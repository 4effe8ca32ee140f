use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::store::{get_json, CoordinationStore};

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Identifier for this candidate (e.g. worker name).
    pub name: String,
    /// Key where the leader record is stored.
    pub leader_key: String,
    /// TTL for the leader lease. If the leader dies, the key expires after this.
    pub lease_ttl: i64,
    /// How often to send keepalive pings.
    pub keepalive_interval: Duration,
    /// How long to wait before retrying after failing to acquire leadership.
    pub retry_interval: Duration,
}

/// Written to the leader key when leadership is acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub holder: String,
    pub lease_id: i64,
}

/// Leadership transitions observed by this candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipEvent {
    Promoted,
    Retired,
}

/// Run a closure as leader indefinitely.
///
/// Continuously attempts to acquire leadership via a compare-and-set on the
/// leader key. When elected, runs `work_fn` with a cancellation token that is
/// cancelled when leadership is lost. If `work_fn` returns (leadership lost,
/// error, or clean shutdown), waits `retry_interval` and tries again.
///
/// The outer `cancel` token stops the entire election loop.
pub async fn run_as_leader<F, Fut>(
    store: Arc<dyn CoordinationStore>,
    config: LeaderElectionConfig,
    cancel: CancellationToken,
    work_fn: F,
) -> Result<()>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = try_lead(&store, &config, &cancel, &work_fn) => {
                match result {
                    Ok(true) => {
                        tracing::info!(name = %config.name, "leadership ended normally");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(name = %config.name, error = %e, "leader loop ended with error");
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(config.retry_interval) => {}
                }
            }
        }
    }
}

/// Publish leadership transitions on `events` until `cancel` fires.
///
/// Every `Promoted` is followed by exactly one `Retired` unless the whole
/// election is shut down first.
pub async fn run_election(
    store: Arc<dyn CoordinationStore>,
    config: LeaderElectionConfig,
    cancel: CancellationToken,
    events: mpsc::Sender<LeadershipEvent>,
) -> Result<()> {
    run_as_leader(store, config, cancel, |leadership| {
        let events = events.clone();
        async move {
            if events.send(LeadershipEvent::Promoted).await.is_err() {
                return Ok(());
            }
            leadership.cancelled().await;
            drop(events.send(LeadershipEvent::Retired).await);
            Ok(())
        }
    })
    .await
}

/// Returns whether leadership was held during this attempt.
async fn try_lead<F, Fut>(
    store: &Arc<dyn CoordinationStore>,
    config: &LeaderElectionConfig,
    cancel: &CancellationToken,
    work_fn: &F,
) -> Result<bool>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let lease_id = store.grant_lease(config.lease_ttl).await?;

    let record = LeaderRecord {
        holder: config.name.clone(),
        lease_id,
    };
    let value = serde_json::to_vec(&record)?;
    let acquired = store
        .create(&config.leader_key, value, Some(lease_id))
        .await?;
    if !acquired {
        tracing::debug!(name = %config.name, "another candidate is leader, standing by");
        // Best-effort revoke so the lease doesn't linger
        drop(store.revoke_lease(lease_id).await);
        return Ok(false);
    }

    tracing::info!(name = %config.name, lease_id, "acquired leadership");

    // Keepalive runs until leadership_cancel is triggered
    let leadership_cancel = cancel.child_token();
    let keepalive_handle = {
        let store = Arc::clone(store);
        let interval = config.keepalive_interval;
        let token = leadership_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = store.keep_alive(lease_id, interval, token.clone()).await {
                tracing::error!(error = %e, "leader keepalive failed, cancelling leadership");
                token.cancel();
            }
        })
    };

    let result = work_fn(leadership_cancel.clone()).await;

    leadership_cancel.cancel();
    drop(keepalive_handle.await);
    drop(store.revoke_lease(lease_id).await);

    result.map(|()| true)
}

/// Read the current leader (if any).
pub async fn get_leader(store: &dyn CoordinationStore, key: &str) -> Result<Option<LeaderRecord>> {
    get_json(store, key).await
}
