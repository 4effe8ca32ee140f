//! Watchers that feed dispatch requests into the run loop.

use std::time::Duration;

use assignment_coordination::store::KvPair;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::{parse_services, DispatchStore};
use crate::types::ServiceInfo;

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Latest view of items and workers, as seen by one trigger.
#[derive(Debug, Clone)]
pub struct DispatchItem {
    pub sender: &'static str,
    pub pairs: Vec<KvPair>,
    pub services: Vec<ServiceInfo>,
}

/// Doubling retry delay, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            current: base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_RETRY_BACKOFF.max(self.base));
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Sleep for the next backoff step. Returns false if cancelled meanwhile.
async fn pause(backoff: &mut Backoff, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(backoff.next_delay()) => true,
    }
}

/// Worker set changed: re-read the items and request a dispatch.
pub async fn service_trigger(
    store: DispatchStore,
    tx: mpsc::Sender<DispatchItem>,
    retry: Duration,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(retry);
    loop {
        let mut snapshots = match store.watch_services(cancel.child_token()).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(error = %e, "service watch failed, retrying");
                if !pause(&mut backoff, &cancel).await {
                    return;
                }
                continue;
            }
        };
        backoff.reset();

        loop {
            let snapshot = tokio::select! {
                _ = cancel.cancelled() => return,
                snapshot = snapshots.recv() => snapshot,
            };
            let Some(snapshot) = snapshot else {
                break;
            };

            let services = parse_services(&snapshot);
            let pairs = match store.list_items().await {
                Ok(pairs) => pairs,
                Err(e) => {
                    tracing::error!(error = %e, "abort service trigger, failed to list items");
                    continue;
                }
            };
            tracing::info!(items = pairs.len(), services = services.len(), "service trigger fired");
            let item = DispatchItem {
                sender: "service",
                pairs,
                services,
            };
            if tx.send(item).await.is_err() {
                return;
            }
        }

        tracing::warn!("service watch ended, re-establishing");
        if !pause(&mut backoff, &cancel).await {
            return;
        }
    }
}

/// Item set changed: re-read the workers and request a dispatch.
pub async fn item_trigger(
    store: DispatchStore,
    tx: mpsc::Sender<DispatchItem>,
    retry: Duration,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(retry);
    loop {
        let mut snapshots = match store.watch_items(cancel.child_token()).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(error = %e, "item watch failed, retrying");
                if !pause(&mut backoff, &cancel).await {
                    return;
                }
                continue;
            }
        };
        backoff.reset();

        loop {
            let pairs = tokio::select! {
                _ = cancel.cancelled() => return,
                snapshot = snapshots.recv() => snapshot,
            };
            let Some(pairs) = pairs else {
                break;
            };

            let services = match store.list_services().await {
                Ok(services) => services,
                Err(e) => {
                    tracing::error!(error = %e, "abort item trigger, failed to list services");
                    continue;
                }
            };
            tracing::debug!(items = pairs.len(), services = services.len(), "item trigger fired");
            let item = DispatchItem {
                sender: "item",
                pairs,
                services,
            };
            if tx.send(item).await.is_err() {
                return;
            }
        }

        tracing::warn!("item watch ended, re-establishing");
        if !pause(&mut backoff, &cancel).await {
            return;
        }
    }
}

/// Request a dispatch with fresh listings every `period`.
pub async fn period_trigger(
    store: DispatchStore,
    tx: mpsc::Sender<DispatchItem>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let pairs = match store.list_items().await {
            Ok(pairs) => pairs,
            Err(e) => {
                tracing::warn!(error = %e, "period trigger failed to list items");
                continue;
            }
        };
        let services = match store.list_services().await {
            Ok(services) => services,
            Err(e) => {
                tracing::warn!(error = %e, "period trigger failed to list services");
                continue;
            }
        };
        let item = DispatchItem {
            sender: "period",
            pairs,
            services,
        };
        if tx.send(item).await.is_err() {
            return;
        }
    }
}
