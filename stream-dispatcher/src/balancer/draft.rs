use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::types::{BalanceElement, DataId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdWithFlow {
    pub data_id: DataId,
    pub flow: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowGroup {
    pub group: Vec<IdWithFlow>,
    pub weight: i64,
    pub percent: f64,
}

impl FlowGroup {
    pub fn ids(&self) -> Vec<DataId> {
        self.group.iter().map(|g| g.data_id).collect()
    }
}

/// Flow-weighted grouping of balancing units into `n` worker slots.
///
/// Only units with flow are packed. Zero-flow items are set aside in
/// `zero_flows` (id -> unit count) and placed by hash afterwards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Draft {
    pub total_weight: i64,
    pub avg_weight: i64,
    pub overflow: f64,
    pub max_ratio: f64,
    pub difference: usize,
    pub groups: Vec<FlowGroup>,
    #[serde(skip)]
    original: Vec<BalanceElement>,
    #[serde(skip)]
    zero_flows: BTreeMap<DataId, usize>,
}

impl Draft {
    /// Pack `items` into `n` groups using the per-item average flows.
    ///
    /// `n` must be at least 1.
    pub fn build(
        flows: &HashMap<DataId, i64>,
        items: &[BalanceElement],
        n: usize,
        overflow: f64,
    ) -> Self {
        let mut counts: HashMap<DataId, usize> = HashMap::new();
        let mut ids: Vec<IdWithFlow> = Vec::new();
        let mut total: i64 = 0;

        for item in items {
            let flow = flows.get(&item.id).copied().unwrap_or(0);
            let count = counts.entry(item.id).or_insert(0);
            if *count == 0 {
                ids.push(IdWithFlow {
                    data_id: item.id,
                    flow,
                });
            }
            *count += 1;
            total += flow;
        }

        ids.sort_by_key(|f| f.flow);

        let slots_total = n as i64;
        let scaled = |sum: i64, slots: i64| ((sum / slots) as f64 * (1.0 + overflow)) as i64;
        let mut avg = scaled(total, slots_total);
        let global_avg = avg;

        let mut groups: Vec<Vec<IdWithFlow>> = Vec::with_capacity(n);
        let mut group: Vec<IdWithFlow> = Vec::new();
        let mut group_sum: i64 = 0;
        let mut cursor = 0;

        for _ in 0..n {
            let mut over_max = false;

            // Heavy side first, one unit per id per group.
            for j in (0..ids.len()).rev() {
                cursor = j;
                let entry = ids[j];
                let remaining = counts.get(&entry.data_id).copied().unwrap_or(0);
                if remaining == 0 || entry.flow == 0 {
                    continue;
                }

                if group_sum + entry.flow >= avg {
                    // A single unit at or above the average fills an empty
                    // group on its own.
                    if group.is_empty() {
                        group.push(entry);
                        decrement(&mut counts, entry.data_id);
                        groups.push(std::mem::take(&mut group));
                        group_sum = 0;

                        let left: i64 = ids
                            .iter()
                            .map(|f| counts.get(&f.data_id).copied().unwrap_or(0) as i64 * f.flow)
                            .sum();
                        let slots = slots_total - groups.len() as i64;
                        if slots > 0 {
                            avg = scaled(left, slots);
                        }
                        over_max = true;
                        break;
                    }
                } else {
                    group_sum += entry.flow;
                    group.push(entry);
                    decrement(&mut counts, entry.data_id);
                }
            }

            if over_max {
                continue;
            }

            // Backfill from the light side until the cursors meet.
            for (j, entry) in ids.iter().enumerate() {
                if j == cursor {
                    break;
                }
                let remaining = counts.get(&entry.data_id).copied().unwrap_or(0);
                if remaining == 0 || entry.flow == 0 {
                    continue;
                }
                if group_sum + entry.flow < avg {
                    group_sum += entry.flow;
                    group.push(*entry);
                    decrement(&mut counts, entry.data_id);
                }
            }

            groups.push(std::mem::take(&mut group));
            group_sum = 0;
        }

        let mut members: Vec<HashSet<DataId>> = groups
            .iter()
            .map(|g| g.iter().map(|f| f.data_id).collect())
            .collect();

        // Leftovers go to the least loaded group that does not hold the id
        // yet, so partitions of one item spread over workers.
        for entry in ids.iter().rev() {
            if entry.flow == 0 {
                continue;
            }
            let remaining = counts.get(&entry.data_id).copied().unwrap_or(0);
            for _ in 0..remaining {
                let order = groups_by_load(&groups);
                let target = order
                    .iter()
                    .copied()
                    .find(|&g| !members[g].contains(&entry.data_id))
                    .or_else(|| order.first().copied());
                let Some(target) = target else {
                    break;
                };
                groups[target].push(*entry);
                members[target].insert(entry.data_id);
            }
            counts.insert(entry.data_id, 0);
        }

        let mut zero_flows = BTreeMap::new();
        for entry in ids.iter().rev() {
            if entry.flow != 0 {
                continue;
            }
            let remaining = counts.insert(entry.data_id, 0).unwrap_or(0);
            zero_flows.insert(entry.data_id, remaining);
        }

        let mut draft = Draft {
            total_weight: total,
            avg_weight: global_avg,
            overflow,
            original: items.to_vec(),
            zero_flows,
            ..Default::default()
        };

        for mut row in groups {
            let weight: i64 = row.iter().map(|g| g.flow).sum();
            row.sort_by_key(|g| g.data_id);
            let percent = if total > 0 {
                weight as f64 / total as f64
            } else {
                0.0
            };
            draft.groups.push(FlowGroup {
                group: row,
                weight,
                percent,
            });
        }

        let mut percents: Vec<f64> = draft.groups.iter().map(|g| g.percent).collect();
        percents.sort_by(f64::total_cmp);
        if let (Some(min), Some(max)) = (percents.first(), percents.last()) {
            if percents.len() >= 2 && *min > 0.0 {
                draft.max_ratio = max / min;
            }
        }

        draft.sort_groups();
        draft
    }

    /// Units of group `i`, heaviest first.
    pub fn group(&self, i: usize) -> Vec<BalanceElement> {
        let Some(group) = self.groups.get(i) else {
            return Vec::new();
        };
        let mut with_flow: Vec<(BalanceElement, i64)> = group
            .group
            .iter()
            .filter_map(|g| self.origin(g.data_id).map(|e| (e.clone(), g.flow)))
            .collect();
        with_flow.sort_by(|a, b| b.1.cmp(&a.1));
        with_flow.into_iter().map(|(e, _)| e).collect()
    }

    /// The first input unit carrying `data_id`. Units of one id are
    /// interchangeable.
    pub fn origin(&self, data_id: DataId) -> Option<&BalanceElement> {
        self.original.iter().find(|e| e.id == data_id)
    }

    pub fn zero_flows(&self) -> &BTreeMap<DataId, usize> {
        &self.zero_flows
    }

    /// Deterministic order: shorter groups first, then by member ids.
    fn sort_groups(&mut self) {
        self.groups.sort_by(|a, b| {
            a.group
                .len()
                .cmp(&b.group.len())
                .then_with(|| a.ids().cmp(&b.ids()))
        });
    }
}

fn decrement(counts: &mut HashMap<DataId, usize>, data_id: DataId) {
    if let Some(c) = counts.get_mut(&data_id) {
        *c = c.saturating_sub(1);
    }
}

/// Group indices ordered by current load, lightest first.
fn groups_by_load(groups: &[Vec<IdWithFlow>]) -> Vec<usize> {
    let mut order: Vec<(usize, i64)> = groups
        .iter()
        .enumerate()
        .map(|(i, g)| (i, g.iter().map(|f| f.flow).sum()))
        .collect();
    order.sort_by_key(|(_, load)| *load);
    order.into_iter().map(|(i, _)| i).collect()
}
