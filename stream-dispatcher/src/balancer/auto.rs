use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, gauge};

use super::{sorted_items, sorted_nodes, BalanceOutcome, Balancer, Draft};
use crate::converter::stable_hash;
use crate::error::{Error, Result};
use crate::flow::{BalanceNotifier, BalanceSettings, FlowSource};
use crate::metrics_const::{
    AUTOBALANCER_BEST_TOP_PERCENT_GAUGE, AUTOBALANCER_DIFFERENCE_GAUGE,
    AUTOBALANCER_EFFECTED_COUNTER, AUTOBALANCER_FLUCTUATION_GAUGE,
    AUTOBALANCER_MAX_FLOW_RATIO_GAUGE, AUTOBALANCER_TARGETS_GAUGE, AUTOBALANCER_ZERO_FLOW_GAUGE,
};
use crate::types::{Assignment, BalanceAlgo, BalanceElement, DataId, PlanWithFlows, WorkerNode};

const TOP_PERCENTS: [f64; 10] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0];

/// Pass on which a rebalance is forced once, after workers had time to
/// report flow.
const WARMUP_PASS: u64 = 3;

/// Flow-weighted balancer that keeps units where they are unless worker
/// load drifted or the inputs changed.
pub struct AutoBalancer {
    settings: Arc<BalanceSettings>,
    flows: Arc<dyn FlowSource>,
    notifier: Arc<BalanceNotifier>,
    first: bool,
    executed: u64,
}

impl AutoBalancer {
    pub fn new(
        settings: Arc<BalanceSettings>,
        flows: Arc<dyn FlowSource>,
        notifier: Arc<BalanceNotifier>,
    ) -> Self {
        Self {
            settings,
            flows,
            notifier,
            first: true,
            executed: 0,
        }
    }

    fn force_executed(&self, force_round: u64) -> bool {
        if self.notifier.take() {
            return true;
        }
        if self.executed == WARMUP_PASS {
            return true;
        }
        force_round > 0 && self.executed % force_round == 0
    }

    /// Match draft groups to workers so that as few heavy units as possible
    /// change owner.
    fn minimize_churn(
        draft: &Draft,
        nodes: &[WorkerNode],
        previous: &BTreeMap<String, Vec<BalanceElement>>,
    ) -> (BTreeMap<String, Vec<BalanceElement>>, usize, f64) {
        let empty = Vec::new();
        let prev_of = |node: &WorkerNode| previous.get(&node.name).unwrap_or(&empty);
        let groups: Vec<Vec<BalanceElement>> = (0..nodes.len()).map(|i| draft.group(i)).collect();

        let mut best = BTreeMap::new();
        let mut best_total = usize::MAX;
        let mut best_percent = 0.0;

        for percent in TOP_PERCENTS {
            let mut selected = vec![false; nodes.len()];
            let mut solution: BTreeMap<String, Vec<BalanceElement>> = BTreeMap::new();

            for group in &groups {
                let mut chosen: Option<usize> = None;
                let mut min_difference = usize::MAX;
                for (j, node) in nodes.iter().enumerate() {
                    if selected[j] {
                        continue;
                    }
                    let difference = top_difference(prev_of(node), group, percent);
                    if difference < min_difference {
                        min_difference = difference;
                        chosen = Some(j);
                    }
                }
                if let Some(j) = chosen {
                    selected[j] = true;
                    solution.insert(nodes[j].name.clone(), group.clone());
                }
            }

            let total: usize = nodes
                .iter()
                .map(|node| {
                    let current = solution.get(&node.name).unwrap_or(&empty);
                    top_difference(prev_of(node), current, 1.0)
                })
                .sum();
            if total < best_total {
                best_total = total;
                best = solution;
                best_percent = percent;
            }
        }

        (best, best_total, best_percent)
    }
}

#[async_trait]
impl Balancer for AutoBalancer {
    async fn balance(
        &mut self,
        previous: &PlanWithFlows,
        items: &[BalanceElement],
        nodes: &[WorkerNode],
    ) -> Result<BalanceOutcome> {
        let first = std::mem::replace(&mut self.first, false);
        if nodes.is_empty() {
            return Err(Error::NoNodes);
        }

        let config = self.settings.get();
        let items = sorted_items(items);
        let nodes = sorted_nodes(nodes);

        let flows = self.flows.flows().await?;
        self.executed += 1;

        let prev_nodes: Vec<&str> = previous.assignment.all.keys().map(String::as_str).collect();
        let prev_items: Vec<DataId> = previous
            .assignment
            .all
            .values()
            .flatten()
            .map(|e| e.id)
            .collect();
        tracing::debug!(
            prev_nodes = prev_nodes.len(),
            prev_items = prev_items.len(),
            curr_nodes = nodes.len(),
            curr_items = items.len(),
            "auto balancing pass"
        );

        let node_names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        let item_ids: Vec<DataId> = items.iter().map(|e| e.id).collect();
        if !first && same_multiset(&prev_nodes, &node_names) && same_multiset(&prev_items, &item_ids)
        {
            let shares = flows.sum_percent_by_service();
            let fluctuated = is_flow_fluctuate(&previous.flows, &shares, config.fluctuation)
                || self.force_executed(config.force_round);
            if !fluctuated {
                return Ok(BalanceOutcome {
                    assignment: previous.assignment.clone(),
                    flows,
                    algo: BalanceAlgo::Auto,
                });
            }
        }

        counter!(AUTOBALANCER_EFFECTED_COUNTER).increment(1);
        gauge!(AUTOBALANCER_TARGETS_GAUGE).set(items.len() as f64);

        let mut draft = Draft::build(&flows.avg_by_data_id(), &items, nodes.len(), 0.0);
        let (with_flow, difference, percent) =
            Self::minimize_churn(&draft, &nodes, &previous.assignment.with_flow);
        draft.difference = difference;

        gauge!(AUTOBALANCER_DIFFERENCE_GAUGE).set(difference as f64);
        gauge!(AUTOBALANCER_BEST_TOP_PERCENT_GAUGE).set(percent);
        gauge!(AUTOBALANCER_MAX_FLOW_RATIO_GAUGE).set(draft.max_ratio);
        tracing::info!(
            total = items.len(),
            difference,
            best_percent = percent,
            max_ratio = draft.max_ratio,
            "auto balancer produced a new grouping"
        );
        if let Ok(detail) = serde_json::to_string(&draft) {
            tracing::debug!(draft = %detail, "auto balancer draft");
        }

        let (all, zero_flows) = place_zero_flows(&draft, &nodes, with_flow.clone());
        gauge!(AUTOBALANCER_ZERO_FLOW_GAUGE).set(zero_flows as f64);

        Ok(BalanceOutcome {
            assignment: Assignment { with_flow, all },
            flows,
            algo: BalanceAlgo::Auto,
        })
    }
}

/// How many of the first `len * percent` units of `current` (at least one
/// position is always skipped) the previous assignment did not hold.
fn top_difference(previous: &[BalanceElement], current: &[BalanceElement], percent: f64) -> usize {
    let mut limit = (current.len() as f64 * percent) as usize;
    if limit >= current.len() {
        limit = current.len().saturating_sub(1);
    }
    if limit == 0 {
        return 0;
    }

    let held: HashSet<DataId> = previous.iter().map(|e| e.id).collect();
    current
        .iter()
        .take(limit + 1)
        .filter(|e| !held.contains(&e.id))
        .count()
}

/// Whether per-worker flow shares moved further than `fluctuation`,
/// measured as the largest gain plus the largest loss.
fn is_flow_fluctuate(
    previous: &HashMap<String, f64>,
    current: &HashMap<String, f64>,
    fluctuation: f64,
) -> bool {
    if previous.is_empty() || current.is_empty() {
        return false;
    }

    let mut min = f64::MAX;
    let mut max = 0.0_f64;
    for (service, share) in previous {
        let delta = current.get(service).copied().unwrap_or(0.0) - share;
        if delta <= min {
            min = delta;
        }
        if delta > max {
            max = delta;
        }
    }

    let r = max.abs() + min.abs();
    gauge!(AUTOBALANCER_FLUCTUATION_GAUGE).set(r);
    let fluctuated = r > fluctuation;
    tracing::info!(fluctuation = r, fluctuated, "auto balancer flow fluctuation");
    fluctuated
}

fn same_multiset<T: Eq + std::hash::Hash>(a: &[T], b: &[T]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut counts: HashMap<&T, i64> = HashMap::new();
    for x in a {
        *counts.entry(x).or_default() += 1;
    }
    for x in b {
        *counts.entry(x).or_default() -= 1;
    }
    counts.values().all(|c| *c == 0)
}

/// Spread zero-flow units by hash: consecutive partitions of one item land
/// on consecutive nodes. Returns the merged mapping and the units placed.
fn place_zero_flows(
    draft: &Draft,
    nodes: &[WorkerNode],
    mut solution: BTreeMap<String, Vec<BalanceElement>>,
) -> (BTreeMap<String, Vec<BalanceElement>>, usize) {
    let mut placed = 0;
    if nodes.is_empty() {
        return (solution, placed);
    }
    let n = nodes.len() as u64;

    for (&data_id, &count) in draft.zero_flows() {
        let Some(origin) = draft.origin(data_id) else {
            continue;
        };
        let mut hash = stable_hash(format!("dataid:{data_id}").as_bytes());
        for _ in 0..count {
            hash = hash.wrapping_add(1);
            let node = &nodes[(hash % n) as usize];
            solution
                .entry(node.name.clone())
                .or_default()
                .push(origin.clone());
            placed += 1;
        }
    }
    (solution, placed)
}
