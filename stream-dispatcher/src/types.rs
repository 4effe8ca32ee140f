use std::collections::{BTreeMap, HashMap};

use assignment_coordination::store::KvPair;
use serde::{Deserialize, Serialize};

pub type DataId = i64;

/// One balancing unit. An item with N partitions is expanded into N units
/// sharing the same id and source key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BalanceElement {
    pub id: DataId,
    /// Key of the item record this unit was expanded from.
    pub source: String,
}

impl BalanceElement {
    pub fn new(id: DataId, source: impl Into<String>) -> Self {
        Self {
            id,
            source: source.into(),
        }
    }
}

/// A worker eligible to receive assignments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerNode {
    /// Stable numeric identity used for ordering and bucketing.
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Ready,
    Draining,
}

/// Registration record of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub address: String,
    pub status: ServiceStatus,
    pub registered_at: i64,
}

/// "Worker X owns source Y at version V", materialized as `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairDispatchInfo {
    pub source: String,
    pub target: String,
    pub version: i64,
}

impl PairDispatchInfo {
    pub fn new(target: impl Into<String>, source: &KvPair) -> Self {
        Self {
            source: source.key.clone(),
            target: target.into(),
            version: source.version,
        }
    }
}

/// Pairs assigned to one worker, keyed by source key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDispatchPlan {
    pub service: String,
    pub pairs: BTreeMap<String, PairDispatchInfo>,
}

impl ServiceDispatchPlan {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            pairs: BTreeMap::new(),
        }
    }
}

/// Balancer output, keyed by worker name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    /// Grouping of units that carried flow. Used to measure churn on the
    /// next pass.
    pub with_flow: BTreeMap<String, Vec<BalanceElement>>,
    /// Every unit, including zero-flow ones. This is what gets dispatched.
    pub all: BTreeMap<String, Vec<BalanceElement>>,
}

/// Everything the dispatcher remembers between cycles.
#[derive(Debug, Clone, Default)]
pub struct PlanWithFlows {
    pub plans: BTreeMap<String, ServiceDispatchPlan>,
    pub assignment: Assignment,
    /// Flow share per worker at the time of the last balancing pass.
    pub flows: HashMap<String, f64>,
}

impl PlanWithFlows {
    pub fn pair_count(&self) -> usize {
        self.plans.values().map(|p| p.pairs.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceAlgo {
    Hash,
    Auto,
}

impl BalanceAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceAlgo::Hash => "hash",
            BalanceAlgo::Auto => "auto",
        }
    }
}
