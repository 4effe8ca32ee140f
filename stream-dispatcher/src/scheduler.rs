//! Worker side: run one work unit per shadow record assigned to this worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use assignment_coordination::store::KvPair;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::converter::{decode_shadow, ItemConfig};
use crate::dispatcher::Backoff;
use crate::error::{Error, Result};
use crate::metrics_const::UNIT_RESTARTS_COUNTER;
use crate::pipeline::{PipelineManager, UnitSpec};
use crate::store::DispatchStore;
use crate::types::DataId;
use crate::watch::{IndexHelper, WatchEvent, WatchEventKind};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker name, i.e. the shadow subtree this scheduler follows.
    pub worker: String,
    pub check_interval: Duration,
    pub flow_interval: Duration,
    /// Pause between restart attempts of a dead unit.
    pub cleanup_interval: Duration,
    pub flow_record_enabled: bool,
    pub watch_retry_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker: "worker-0".to_string(),
            check_interval: Duration::from_secs(10),
            flow_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(5),
            flow_record_enabled: true,
            watch_retry_interval: Duration::from_secs(5),
        }
    }
}

/// The unit a shadow record asks for.
pub fn unit_spec(shadow: &KvPair) -> Result<UnitSpec> {
    let source = decode_shadow(shadow)?;
    let config = ItemConfig::parse(&source)?;
    Ok(UnitSpec {
        data_id: config.data_id,
        source: source.key,
        config: source.value,
        version: source.version,
    })
}

/// A background restart of one dead unit.
struct PendingRestart {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    store: DispatchStore,
    manager: Arc<PipelineManager>,
    config: SchedulerConfig,
    restarts: Mutex<HashMap<DataId, PendingRestart>>,
}

impl Scheduler {
    pub fn new(store: DispatchStore, manager: Arc<PipelineManager>, config: SchedulerConfig) -> Self {
        Self {
            store,
            manager,
            config,
            restarts: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<PipelineManager> {
        &self.manager
    }

    fn pending_restarts(&self) -> MutexGuard<'_, HashMap<DataId, PendingRestart>> {
        self.restarts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Data ids whose restart is still retrying, sorted.
    pub fn restarting(&self) -> Vec<DataId> {
        let mut ids: Vec<DataId> = self
            .pending_restarts()
            .iter()
            .filter(|(_, restart)| !restart.handle.is_finished())
            .map(|(data_id, _)| *data_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Follow this worker's shadows until cancelled, then stop every unit.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut index: IndexHelper<UnitSpec> = IndexHelper::new();
        let mut backoff = Backoff::new(self.config.watch_retry_interval);

        let now = Instant::now();
        let check = self.config.check_interval.max(Duration::from_millis(1));
        let flow = self.config.flow_interval.max(Duration::from_millis(1));
        let mut check_ticker = interval_at(now + check, check);
        let mut flow_ticker = interval_at(now + flow, flow);
        check_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flow_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(worker = %self.config.worker, "scheduler started");
        'watch: while !cancel.is_cancelled() {
            let mut snapshots = match self
                .store
                .watch_worker_shadows(&self.config.worker, cancel.child_token())
                .await
            {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::warn!(worker = %self.config.worker, error = %e, "shadow watch failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break 'watch,
                        _ = tokio::time::sleep(backoff.next_delay()) => continue 'watch,
                    }
                }
            };
            backoff.reset();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'watch,
                    snapshot = snapshots.recv() => {
                        let Some(shadows) = snapshot else {
                            tracing::warn!(worker = %self.config.worker, "shadow watch ended, re-establishing");
                            continue 'watch;
                        };
                        self.handle_snapshot(&mut index, &shadows).await;
                    }
                    _ = check_ticker.tick() => self.restart_killed(&cancel),
                    _ = flow_ticker.tick() => self.record_flows().await,
                }
            }
        }

        tracing::info!(worker = %self.config.worker, units = self.manager.len(), "scheduler stopping");
        let pending: Vec<PendingRestart> = self
            .pending_restarts()
            .drain()
            .map(|(_, restart)| restart)
            .collect();
        for restart in pending {
            restart.cancel.cancel();
            drop(restart.handle.await);
        }
        self.manager.stop_all().await;
        Ok(())
    }

    /// Diff a full snapshot of this worker's shadows against the last one
    /// and apply the changes.
    pub async fn handle_snapshot(&self, index: &mut IndexHelper<UnitSpec>, shadows: &[KvPair]) {
        let mut events = Vec::new();
        for shadow in shadows {
            let spec = match unit_spec(shadow) {
                Ok(spec) => spec,
                Err(e) => {
                    tracing::warn!(key = %shadow.key, error = %e, "skipping malformed shadow");
                    continue;
                }
            };
            events.extend(index.update(&shadow.key, shadow.version, spec));
        }
        // Stop removed units before starting new ones, so a moved data id
        // is free again.
        let mut ordered = index.rotate();
        ordered.extend(events);

        for event in ordered {
            self.apply(event).await;
        }
    }

    async fn apply(&self, event: WatchEvent<UnitSpec>) {
        let data_id = event.data.data_id;
        match event.kind {
            WatchEventKind::Added => {
                tracing::info!(key = %event.key, data_id, "shadow added");
                if let Err(e) = self.manager.activate(event.data).await {
                    tracing::error!(data_id, error = %e, "failed to activate work unit");
                }
            }
            WatchEventKind::Deleted => {
                tracing::info!(key = %event.key, data_id, "shadow deleted");
                let was_restarting = self.cancel_restart(data_id).await;
                match self.manager.deactivate(data_id).await {
                    Ok(()) => {}
                    Err(Error::NotFound(_)) if was_restarting => {}
                    Err(e) => tracing::error!(data_id, error = %e, "failed to deactivate work unit"),
                }
            }
            WatchEventKind::Modified => {
                let changed = self
                    .manager
                    .spec(data_id)
                    .map_or(true, |live| live.config != event.data.config);
                if !changed {
                    tracing::debug!(key = %event.key, data_id, "shadow rewritten without config change");
                    return;
                }
                tracing::info!(key = %event.key, data_id, "shadow config changed");
                self.cancel_restart(data_id).await;
                // reactivate logs its own failures
                drop(self.manager.reactivate(event.data).await);
            }
        }
    }

    /// Hand every unit that reported its own death to a background restart.
    /// A data id with a restart still pending is left to that restart.
    pub fn restart_killed(&self, cancel: &CancellationToken) {
        let killed = match self.manager.killed() {
            Ok(killed) => killed,
            Err(e) => {
                tracing::error!(error = %e, "failed to read kill signals");
                return;
            }
        };

        let mut pending = self.pending_restarts();
        pending.retain(|_, restart| !restart.handle.is_finished());
        for (data_id, reason) in killed {
            if pending.contains_key(&data_id) {
                tracing::debug!(data_id, "restart already pending");
                continue;
            }
            let Some(spec) = self.manager.spec(data_id) else {
                continue;
            };
            tracing::warn!(data_id, reason = %reason, "work unit died, restarting");
            counter!(UNIT_RESTARTS_COUNTER).increment(1);

            let token = cancel.child_token();
            let handle = tokio::spawn(restart_unit(
                Arc::clone(&self.manager),
                spec,
                self.config.cleanup_interval,
                token.clone(),
            ));
            pending.insert(
                data_id,
                PendingRestart {
                    cancel: token,
                    handle,
                },
            );
        }
    }

    /// Stop a pending restart of `data_id` and wait for it to let go of the
    /// unit. Returns whether one was pending.
    async fn cancel_restart(&self, data_id: DataId) -> bool {
        let pending = self.pending_restarts().remove(&data_id);
        let Some(restart) = pending else {
            return false;
        };
        restart.cancel.cancel();
        if let Err(e) = restart.handle.await {
            tracing::error!(data_id, error = %e, "restart task panicked");
        }
        tracing::info!(data_id, "pending restart cancelled");
        true
    }

    /// Publish the flow of every running unit.
    pub async fn record_flows(&self) {
        if !self.config.flow_record_enabled {
            return;
        }
        for (data_id, flow) in self.manager.flows() {
            if let Err(e) = self.store.put_flow(&self.config.worker, data_id, flow).await {
                tracing::warn!(data_id, error = %e, "failed to record flow");
            }
        }
    }
}

/// Clean up a dead unit, then retry its start every `pause` until it runs
/// or `cancel` fires.
async fn restart_unit(
    manager: Arc<PipelineManager>,
    spec: UnitSpec,
    pause: Duration,
    cancel: CancellationToken,
) {
    let data_id = spec.data_id;
    if let Err(e) = manager.deactivate(data_id).await {
        tracing::warn!(data_id, error = %e, "failed to clean up dead work unit");
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(pause) => {}
        }
        match manager.activate(spec.clone()).await {
            Ok(()) => {
                tracing::info!(data_id, "work unit restarted");
                return;
            }
            Err(e) => tracing::warn!(data_id, error = %e, "restart attempt failed"),
        }
    }
}
