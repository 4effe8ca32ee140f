//! Leader-side planning: balance items over workers, apply manual pins,
//! and publish the result as shadow records.

mod leadership;
mod manual;
mod trigger;

pub use leadership::{follow_leadership, LeaderSlot};
pub use manual::{parse_manual_list, ManualList, ManualResolver};
pub use trigger::{item_trigger, period_trigger, service_trigger, Backoff, DispatchItem};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use assignment_coordination::store::KvPair;
use futures::stream::{self, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::balancer::{AutoBalancer, BalanceOutcome, Balancer, HashBalancer};
use crate::converter::{decode_shadow, encode_shadow, DispatchConverter};
use crate::error::{Error, Result};
use crate::flow::{BalanceNotifier, BalanceSettings, FlowSource};
use crate::metrics_const::{
    DISPATCH_DURATION_HISTOGRAM, DISPATCH_FAILED_COUNTER, DISPATCH_TOTAL_COUNTER,
    PLANNED_PAIRS_GAUGE, RECOVER_TOTAL_COUNTER, SHADOW_DELETES_COUNTER, SHADOW_WRITES_COUNTER,
};
use crate::store::DispatchStore;
use crate::types::{
    BalanceAlgo, BalanceElement, PairDispatchInfo, PlanWithFlows, ServiceDispatchPlan,
    ServiceInfo, ServiceStatus, WorkerNode,
};

const TRIGGER_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Quiet period after the last trigger before a dispatch runs.
    pub dispatch_delay: Duration,
    pub recover_interval: Duration,
    pub trigger_period: Duration,
    /// Max shadow writes or deletes in flight.
    pub concurrency: usize,
    pub watch_retry_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dispatch_delay: Duration::from_secs(3),
            recover_interval: Duration::from_secs(300),
            trigger_period: Duration::from_secs(60),
            concurrency: 16,
            watch_retry_interval: Duration::from_secs(5),
        }
    }
}

/// What one dispatch pass did to the shadow namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub written: usize,
    pub deleted: usize,
    pub failed: usize,
}

struct DispatchState {
    plans: PlanWithFlows,
    hash: HashBalancer,
    auto: AutoBalancer,
}

pub struct Dispatcher {
    store: DispatchStore,
    converter: Arc<dyn DispatchConverter>,
    settings: Arc<BalanceSettings>,
    notifier: Arc<BalanceNotifier>,
    config: DispatcherConfig,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new(
        store: DispatchStore,
        converter: Arc<dyn DispatchConverter>,
        settings: Arc<BalanceSettings>,
        flows: Arc<dyn FlowSource>,
        config: DispatcherConfig,
    ) -> Self {
        let notifier = Arc::new(BalanceNotifier::default());
        let auto = AutoBalancer::new(Arc::clone(&settings), flows, Arc::clone(&notifier));
        Self {
            store,
            converter,
            settings,
            notifier,
            config,
            state: Mutex::new(DispatchState {
                plans: PlanWithFlows::default(),
                hash: HashBalancer::new(),
                auto,
            }),
        }
    }

    /// Make the next auto balancing pass rebalance even if flow is stable.
    pub fn request_rebalance(&self) {
        self.notifier.notify();
    }

    /// Rebuild the plan from the shadow records in the store. The previous
    /// balancer grouping and flow shares are kept.
    pub async fn recover(&self) -> Result<usize> {
        let shadows = self.store.list_shadows().await?;
        tracing::info!(count = shadows.len(), "recovering plan from shadow records");

        let mut plans: BTreeMap<String, ServiceDispatchPlan> = BTreeMap::new();
        for shadow in &shadows {
            let link = match self.converter.shadow_detector(shadow) {
                Ok(link) => link,
                Err(e) => {
                    tracing::warn!(key = %shadow.key, error = %e, "skipping unrecognized shadow");
                    continue;
                }
            };
            let source = match decode_shadow(shadow) {
                Ok(source) => source,
                Err(e) => {
                    tracing::warn!(key = %shadow.key, error = %e, "skipping malformed shadow");
                    continue;
                }
            };
            tracing::debug!(source = %source.key, target = %shadow.key, service = %link.service, "recovered shadow");

            plans
                .entry(link.service.clone())
                .or_insert_with(|| ServiceDispatchPlan::new(link.service.clone()))
                .pairs
                .insert(
                    source.key.clone(),
                    PairDispatchInfo {
                        source: source.key,
                        target: shadow.key.clone(),
                        version: source.version,
                    },
                );
        }

        let mut state = self.state.lock().await;
        state.plans.plans = plans;
        let count = state.plans.pair_count();
        counter!(RECOVER_TOTAL_COUNTER).increment(1);
        gauge!(PLANNED_PAIRS_GAUGE).set(count as f64);
        Ok(count)
    }

    /// Snapshot of the current plan.
    pub async fn current_plan(&self) -> PlanWithFlows {
        self.state.lock().await.plans.clone()
    }

    /// Visit every planned pair until `f` returns false.
    pub async fn visit_plan<F>(&self, mut f: F)
    where
        F: FnMut(&str, &PairDispatchInfo) -> bool,
    {
        let state = self.state.lock().await;
        for (service, plan) in &state.plans.plans {
            for pair in plan.pairs.values() {
                if !f(service, pair) {
                    return;
                }
            }
        }
    }

    fn elements(&self, pairs: &[KvPair]) -> Vec<BalanceElement> {
        pairs
            .iter()
            .filter_map(|pair| match self.converter.element_creator(pair) {
                Ok(elements) => Some(elements),
                Err(e) => {
                    tracing::warn!(key = %pair.key, error = %e, "skipping item record");
                    None
                }
            })
            .flatten()
            .collect()
    }

    /// Balancing nodes. Draining workers get nothing new.
    fn nodes(&self, services: &[ServiceInfo]) -> Vec<WorkerNode> {
        services
            .iter()
            .filter(|s| s.status == ServiceStatus::Ready)
            .filter_map(|s| match self.converter.node_creator(s) {
                Ok(node) => Some(node),
                Err(e) => {
                    tracing::warn!(service = %s.id, error = %e, "skipping worker");
                    None
                }
            })
            .collect()
    }

    /// Run the configured balancer and turn its grouping into per-worker
    /// pair sets.
    async fn plan(
        &self,
        state: &mut DispatchState,
        pairs: &[KvPair],
        nodes: &[WorkerNode],
    ) -> Result<(PlanWithFlows, BalanceAlgo)> {
        let by_key: HashMap<&str, &KvPair> = pairs.iter().map(|p| (p.key.as_str(), p)).collect();
        let elements = self.elements(pairs);

        let DispatchState {
            plans: previous,
            hash,
            auto,
        } = state;
        let outcome: BalanceOutcome = if self.settings.get().auto_balance_enabled {
            auto.balance(previous, &elements, nodes).await?
        } else {
            hash.balance(previous, &elements, nodes).await?
        };

        let by_name: HashMap<&str, &WorkerNode> =
            nodes.iter().map(|n| (n.name.as_str(), n)).collect();
        let mut plans: BTreeMap<String, ServiceDispatchPlan> = BTreeMap::new();
        for (name, elements) in &outcome.assignment.all {
            let Some(node) = by_name.get(name.as_str()) else {
                tracing::warn!(service = %name, "balancer returned an unknown worker");
                continue;
            };
            for element in elements {
                let link = match self.converter.shadow_creator(node, element) {
                    Ok(link) => link,
                    Err(e) => {
                        tracing::error!(data_id = element.id, service = %name, error = %e, "failed to create shadow link");
                        continue;
                    }
                };
                let source = by_key
                    .get(link.source.as_str())
                    .ok_or_else(|| Error::MissingSource(link.source.clone()))?;
                plans
                    .entry(link.service.clone())
                    .or_insert_with(|| ServiceDispatchPlan::new(link.service.clone()))
                    .pairs
                    .insert(source.key.clone(), PairDispatchInfo::new(link.target, source));
            }
        }

        let plan = PlanWithFlows {
            plans,
            flows: outcome.flows.sum_percent_by_service(),
            assignment: outcome.assignment,
        };
        Ok((plan, outcome.algo))
    }

    /// Balanced plan plus manual pins. Pins only apply to hash balancing.
    async fn get_plan(
        &self,
        state: &mut DispatchState,
        pairs: &[KvPair],
        services: &[ServiceInfo],
    ) -> Result<PlanWithFlows> {
        let nodes = self.nodes(services);
        let (mut plan, algo) = self.plan(state, pairs, &nodes).await?;

        if algo == BalanceAlgo::Hash {
            let manual = match self.store.list_manual().await {
                Ok(records) => parse_manual_list(&records),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read manual pins, using balanced plan");
                    ManualList::new()
                }
            };
            let live: HashSet<String> = nodes.into_iter().map(|n| n.name).collect();
            ManualResolver::new(&self.store.layout().shadows_root).apply(
                &mut plan.plans,
                &live,
                &manual,
            );
        }
        Ok(plan)
    }

    /// Compute a new plan for `pairs` over `services` and reconcile the
    /// shadow namespace with it. On planning errors the current plan stays.
    pub async fn dispatch(
        &self,
        pairs: &[KvPair],
        services: &[ServiceInfo],
    ) -> Result<DispatchSummary> {
        if services.is_empty() {
            return Err(Error::EmptyInput("services"));
        }

        let mut state = self.state.lock().await;
        let new_plans = self.get_plan(&mut state, pairs, services).await?;
        let mut old_plans = std::mem::replace(&mut state.plans, new_plans);
        gauge!(PLANNED_PAIRS_GAUGE).set(state.plans.pair_count() as f64);

        let mut writes: Vec<PairDispatchInfo> = Vec::new();
        let mut deletes: Vec<String> = Vec::new();
        for (service, plan) in &state.plans.plans {
            let Some(mut old) = old_plans.plans.remove(service) else {
                tracing::debug!(service = %service, pairs = plan.pairs.len(), "new worker in plan");
                writes.extend(plan.pairs.values().cloned());
                continue;
            };
            for (source, info) in &plan.pairs {
                match old.pairs.remove(source) {
                    Some(prev) if prev.version == info.version && prev.target == info.target => {}
                    Some(prev) if prev.target != info.target => {
                        deletes.push(prev.target);
                        writes.push(info.clone());
                    }
                    _ => writes.push(info.clone()),
                }
            }
            deletes.extend(old.pairs.into_values().map(|p| p.target));
        }
        for (service, plan) in old_plans.plans {
            tracing::debug!(service = %service, pairs = plan.pairs.len(), "cleaning up vanished worker");
            deletes.extend(plan.pairs.into_values().map(|p| p.target));
        }
        drop(state);

        let sources: HashMap<&str, &KvPair> = pairs.iter().map(|p| (p.key.as_str(), p)).collect();
        let mut summary = DispatchSummary::default();

        let write_results: Vec<bool> = stream::iter(writes)
            .map(|info| {
                let source = sources.get(info.source.as_str()).copied();
                async move { self.write_shadow(&info, source).await }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        for ok in write_results {
            if ok {
                summary.written += 1;
            } else {
                summary.failed += 1;
            }
        }

        let delete_results: Vec<bool> = stream::iter(deletes)
            .map(|target| async move { self.delete_shadow(&target).await })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        for ok in delete_results {
            if ok {
                summary.deleted += 1;
            } else {
                summary.failed += 1;
            }
        }

        Ok(summary)
    }

    async fn write_shadow(&self, info: &PairDispatchInfo, source: Option<&KvPair>) -> bool {
        let Some(source) = source else {
            tracing::error!(source = %info.source, "source pair vanished before dispatch");
            counter!(SHADOW_WRITES_COUNTER, "status" => "failure").increment(1);
            return false;
        };
        tracing::debug!(source = %info.source, target = %info.target, version = info.version, "writing shadow");
        let result = match encode_shadow(source) {
            Ok(value) => self.store.put_shadow(&info.target, value).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                counter!(SHADOW_WRITES_COUNTER, "status" => "success").increment(1);
                true
            }
            Err(e) => {
                tracing::error!(target = %info.target, error = %e, "failed to write shadow");
                counter!(SHADOW_WRITES_COUNTER, "status" => "failure").increment(1);
                false
            }
        }
    }

    async fn delete_shadow(&self, target: &str) -> bool {
        tracing::debug!(target, "deleting shadow");
        match self.store.delete_tree(target).await {
            Ok(()) => {
                counter!(SHADOW_DELETES_COUNTER, "status" => "success").increment(1);
                true
            }
            Err(e) => {
                tracing::error!(target, error = %e, "failed to delete shadow");
                counter!(SHADOW_DELETES_COUNTER, "status" => "failure").increment(1);
                false
            }
        }
    }

    async fn dispatch_cycle(&self, latest: Option<&DispatchItem>, trigger: &'static str) {
        let Some(item) = latest else {
            tracing::debug!(trigger, "no trigger input yet, skipping dispatch");
            return;
        };
        tracing::info!(
            trigger,
            sender = item.sender,
            items = item.pairs.len(),
            services = item.services.len(),
            "dispatching"
        );
        counter!(DISPATCH_TOTAL_COUNTER, "trigger" => trigger).increment(1);
        let started = Instant::now();
        match self.dispatch(&item.pairs, &item.services).await {
            Ok(summary) => tracing::info!(
                written = summary.written,
                deleted = summary.deleted,
                failed = summary.failed,
                "dispatch finished"
            ),
            Err(e) => {
                tracing::error!(error = %e, "dispatch failed");
                counter!(DISPATCH_FAILED_COUNTER).increment(1);
            }
        }
        histogram!(DISPATCH_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());
    }

    /// Leader tenure: start the triggers, recover, then dispatch on demand
    /// until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        let triggers = cancel.child_token();
        let mut tasks = JoinSet::new();
        let retry = self.config.watch_retry_interval;

        tasks.spawn(service_trigger(
            self.store.clone(),
            tx.clone(),
            retry,
            triggers.clone(),
        ));
        tasks.spawn(item_trigger(
            self.store.clone(),
            tx.clone(),
            retry,
            triggers.clone(),
        ));
        tasks.spawn(period_trigger(
            self.store.clone(),
            tx,
            self.config.trigger_period,
            triggers.clone(),
        ));

        let result = match self.recover().await {
            Ok(_) => {
                self.run_loop(rx, cancel).await;
                Ok(())
            }
            Err(e) => Err(e),
        };

        triggers.cancel();
        tasks.shutdown().await;
        result
    }

    async fn run_loop(&self, mut rx: mpsc::Receiver<DispatchItem>, cancel: CancellationToken) {
        let delay = self.config.dispatch_delay.max(Duration::from_millis(1));
        let flow_interval = self.settings.get().check_interval();
        let recover_interval = self.config.recover_interval.max(Duration::from_millis(1));
        tracing::info!(?flow_interval, "dispatcher loop started");

        let now = Instant::now();
        let mut delay_ticker = interval_at(now + delay, delay);
        let mut flow_ticker = interval_at(now + flow_interval, flow_interval);
        let mut recover_ticker = interval_at(now + recover_interval, recover_interval);
        for ticker in [&mut delay_ticker, &mut flow_ticker, &mut recover_ticker] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        let mut latest: Option<DispatchItem> = None;
        let mut pending = false;
        let mut updated_at = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => {
                    let Some(item) = item else {
                        tracing::warn!("all triggers stopped");
                        break;
                    };
                    tracing::debug!(sender = item.sender, "dispatch requested");
                    latest = Some(item);
                    pending = true;
                    updated_at = Instant::now();
                }
                _ = delay_ticker.tick() => {
                    if pending && updated_at + delay < Instant::now() {
                        self.dispatch_cycle(latest.as_ref(), "delay").await;
                        pending = false;
                    }
                }
                _ = flow_ticker.tick() => {
                    self.dispatch_cycle(latest.as_ref(), "flow").await;
                }
                _ = recover_ticker.tick() => {
                    if let Err(e) = self.recover().await {
                        tracing::error!(error = %e, "failed to recover plan");
                    }
                }
            }
        }
        tracing::info!("dispatcher loop stopped");
    }
}
