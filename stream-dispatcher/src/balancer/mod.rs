//! Strategies that split balancing units across workers.

mod auto;
mod draft;
mod hash;

pub use auto::AutoBalancer;
pub use draft::{Draft, FlowGroup, IdWithFlow};
pub use hash::HashBalancer;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::flow::FlowItems;
use crate::types::{Assignment, BalanceAlgo, BalanceElement, PlanWithFlows, WorkerNode};

/// Result of one balancing pass.
#[derive(Debug, Clone)]
pub struct BalanceOutcome {
    pub assignment: Assignment,
    /// Flow snapshot the pass was computed from. Empty for the hash balancer.
    pub flows: FlowItems,
    pub algo: BalanceAlgo,
}

#[async_trait]
pub trait Balancer: Send {
    /// Assign `items` to `nodes`, given what the previous pass produced.
    async fn balance(
        &mut self,
        previous: &PlanWithFlows,
        items: &[BalanceElement],
        nodes: &[WorkerNode],
    ) -> Result<BalanceOutcome>;
}

pub(crate) fn sorted_items(items: &[BalanceElement]) -> Vec<BalanceElement> {
    let mut items = items.to_vec();
    items.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.source.cmp(&b.source)));
    items
}

pub(crate) fn sorted_nodes(nodes: &[WorkerNode]) -> Vec<WorkerNode> {
    let mut nodes = nodes.to_vec();
    nodes.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.name.cmp(&b.name)));
    nodes
}

/// An entry for every node, so workers left without units still show up.
pub(crate) fn empty_assignment(nodes: &[WorkerNode]) -> BTreeMap<String, Vec<BalanceElement>> {
    nodes
        .iter()
        .map(|n| (n.name.clone(), Vec::new()))
        .collect()
}
