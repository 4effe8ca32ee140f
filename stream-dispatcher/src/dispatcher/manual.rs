//! Manual pins: `<manual-root>/<item id>` -> `[{"name": "<worker>"}]`.
//!
//! A pin moves one automatic holder's pair of the item to the pinned worker
//! and sends one of the pinned worker's own pairs back in exchange, so both
//! workers keep their load.

use std::collections::{BTreeMap, HashMap, HashSet};

use assignment_coordination::store::KvPair;
use assignment_coordination::util::{basename, join_key};

use crate::error::{Error, Result};
use crate::types::{PairDispatchInfo, ServiceDispatchPlan};

/// Pinned worker -> item ids, in manual key order.
pub type ManualList = BTreeMap<String, Vec<String>>;

const WORKER_NAME_FIELD: &str = "name";

/// Decode the manual namespace. Records that do not parse are skipped.
pub fn parse_manual_list(pairs: &[KvPair]) -> ManualList {
    let mut list = ManualList::new();
    for pair in pairs {
        let data_id = basename(&pair.key);
        let entries: Vec<HashMap<String, String>> = match serde_json::from_slice(&pair.value) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(key = %pair.key, error = %e, "skipping malformed manual record");
                continue;
            }
        };
        for entry in entries {
            if let Some(worker) = entry.get(WORKER_NAME_FIELD) {
                list.entry(worker.clone())
                    .or_default()
                    .push(data_id.to_string());
            }
        }
    }
    list
}

/// Applies manual pins to a freshly balanced plan set.
pub struct ManualResolver<'a> {
    shadows_root: &'a str,
}

impl<'a> ManualResolver<'a> {
    pub fn new(shadows_root: &'a str) -> Self {
        Self { shadows_root }
    }

    fn target_key(&self, worker: &str, data_id: &str) -> String {
        join_key(&join_key(self.shadows_root, worker), data_id)
    }

    /// Apply every pin whose worker is alive. A pin that cannot be honoured
    /// is logged and skipped; the rest of the plan is kept.
    pub fn apply(
        &self,
        plans: &mut BTreeMap<String, ServiceDispatchPlan>,
        live: &HashSet<String>,
        manual: &ManualList,
    ) {
        let mut staged: BTreeMap<String, Vec<PairDispatchInfo>> = BTreeMap::new();

        for (target, data_ids) in manual {
            if !live.contains(target) {
                tracing::warn!(service = %target, "pinned worker is not alive, skipping its pins");
                continue;
            }
            // A live worker may have been given nothing by the balancer.
            plans
                .entry(target.clone())
                .or_insert_with(|| ServiceDispatchPlan::new(target.as_str()));

            for data_id in data_ids {
                let Some(holder) = self.redirect_source(plans, target, data_id, &mut staged) else {
                    continue;
                };
                if let Err(e) = self.redirect_target(plans, &holder, target) {
                    tracing::error!(
                        holder = %holder,
                        service = %target,
                        data_id = %data_id,
                        error = %e,
                        "failed to exchange pinned item"
                    );
                }
            }
        }

        add_into_plans(plans, staged);
    }

    /// Take the first pair of `data_id` held by any worker (in name order)
    /// and stage it for `target`. Returns the worker it was taken from.
    fn redirect_source(
        &self,
        plans: &mut BTreeMap<String, ServiceDispatchPlan>,
        target: &str,
        data_id: &str,
        staged: &mut BTreeMap<String, Vec<PairDispatchInfo>>,
    ) -> Option<String> {
        for (holder, plan) in plans.iter_mut() {
            let found = plan
                .pairs
                .iter()
                .find(|(_, pair)| basename(&pair.source) == data_id)
                .map(|(key, _)| key.clone());
            let Some(key) = found else {
                continue;
            };
            let Some(mut pair) = plan.pairs.remove(&key) else {
                continue;
            };
            pair.target = self.target_key(target, data_id);
            tracing::info!(data_id, holder = %holder, service = %target, "moving pinned item");
            staged.entry(target.to_string()).or_default().push(pair);
            return Some(holder.clone());
        }
        None
    }

    /// Hand the first pair of `target` (in key order) that `holder` does
    /// not have yet over to `holder`. Takes effect immediately.
    fn redirect_target(
        &self,
        plans: &mut BTreeMap<String, ServiceDispatchPlan>,
        holder: &str,
        target: &str,
    ) -> Result<()> {
        let held: HashSet<String> = plans
            .get(holder)
            .ok_or_else(|| Error::MissingTransfer(holder.to_string()))?
            .pairs
            .keys()
            .cloned()
            .collect();
        let target_plan = plans
            .get_mut(target)
            .ok_or_else(|| Error::MissingTransfer(target.to_string()))?;

        let candidate = target_plan
            .pairs
            .iter()
            .find(|(_, pair)| !held.contains(&pair.source))
            .map(|(key, _)| key.clone());
        let Some(key) = candidate else {
            return Ok(());
        };
        let Some(mut pair) = target_plan.pairs.remove(&key) else {
            return Ok(());
        };

        pair.target = self.target_key(holder, basename(&pair.source));
        tracing::info!(source = %pair.source, from = %target, to = %holder, "exchanging item for pinned one");
        add_into_plans(plans, BTreeMap::from([(holder.to_string(), vec![pair])]));
        Ok(())
    }
}

fn add_into_plans(
    plans: &mut BTreeMap<String, ServiceDispatchPlan>,
    moves: BTreeMap<String, Vec<PairDispatchInfo>>,
) {
    for (service, pairs) in moves {
        let plan = plans
            .entry(service.clone())
            .or_insert_with(|| ServiceDispatchPlan::new(service));
        for pair in pairs {
            plan.pairs.insert(pair.source.clone(), pair);
        }
    }
}
