use async_trait::async_trait;

use super::{empty_assignment, sorted_items, sorted_nodes, BalanceOutcome, Balancer};
use crate::error::{Error, Result};
use crate::types::{Assignment, BalanceAlgo, BalanceElement, PlanWithFlows, WorkerNode};

/// `item.id mod n` over nodes sorted by id. Ignores flow and history.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashBalancer;

impl HashBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn assign(&self, items: &[BalanceElement], nodes: &[WorkerNode]) -> Result<Assignment> {
        if nodes.is_empty() {
            return Err(Error::NoNodes);
        }
        let nodes = sorted_nodes(nodes);
        let n = nodes.len() as i64;

        let mut all = empty_assignment(&nodes);
        for item in sorted_items(items) {
            let node = &nodes[item.id.rem_euclid(n) as usize];
            all.entry(node.name.clone()).or_default().push(item);
        }
        Ok(Assignment {
            with_flow: Default::default(),
            all,
        })
    }
}

#[async_trait]
impl Balancer for HashBalancer {
    async fn balance(
        &mut self,
        _previous: &PlanWithFlows,
        items: &[BalanceElement],
        nodes: &[WorkerNode],
    ) -> Result<BalanceOutcome> {
        Ok(BalanceOutcome {
            assignment: self.assign(items, nodes)?,
            flows: Default::default(),
            algo: BalanceAlgo::Hash,
        })
    }
}
