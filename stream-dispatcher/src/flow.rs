use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metrics_const::STALE_FLOW_DELETED_COUNTER;
use crate::store::DispatchStore;
use crate::types::DataId;

/// Strikes after which an orphaned flow record is removed.
const STALE_FLOW_STRIKES: u32 = 5;

/// Observed throughput of one item on one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowItem {
    pub service: String,
    pub data_id: DataId,
    pub flow: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowItems(pub Vec<FlowItem>);

impl FlowItems {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Share of the total flow carried by each worker. Empty when there is
    /// no flow at all.
    pub fn sum_percent_by_service(&self) -> HashMap<String, f64> {
        let total: i64 = self.0.iter().map(|f| f.flow).sum();
        if total <= 0 {
            return HashMap::new();
        }
        let mut sums: HashMap<String, i64> = HashMap::new();
        for item in &self.0 {
            *sums.entry(item.service.clone()).or_default() += item.flow;
        }
        sums.into_iter()
            .map(|(service, sum)| (service, sum as f64 / total as f64))
            .collect()
    }

    /// Integer mean flow of each item across the workers reporting it.
    pub fn avg_by_data_id(&self) -> HashMap<DataId, i64> {
        let mut acc: HashMap<DataId, (i64, i64)> = HashMap::new();
        for item in &self.0 {
            let entry = acc.entry(item.data_id).or_default();
            entry.0 += item.flow;
            entry.1 += 1;
        }
        acc.into_iter()
            .map(|(id, (sum, count))| (id, sum / count))
            .collect()
    }
}

/// Source of the flow snapshot read once per balancing pass.
#[async_trait]
pub trait FlowSource: Send + Sync {
    async fn flows(&self) -> Result<FlowItems>;
}

/// Reads `<flow-root>/<worker>/<item>` records of living workers and prunes
/// records whose assignment disappeared.
pub struct FlowCollector {
    store: DispatchStore,
    strikes: Mutex<HashMap<String, u32>>,
}

impl FlowCollector {
    pub fn new(store: DispatchStore) -> Self {
        Self {
            store,
            strikes: Mutex::new(HashMap::new()),
        }
    }

    /// Give a strike to every flow record without a matching shadow and take
    /// one back from records that have one again. Records reaching the limit
    /// are deleted.
    pub async fn detect_stale(&self) -> Result<()> {
        let shadows_prefix = self.store.shadows_prefix();
        let assigned: HashSet<String> = self
            .store
            .list_shadows()
            .await?
            .iter()
            .filter_map(|kv| worker_and_leaf(&kv.key, &shadows_prefix))
            .collect();

        let flow_prefix = self.store.flow_prefix();
        let flows: Vec<String> = self
            .store
            .list_flows()
            .await?
            .iter()
            .filter_map(|kv| worker_and_leaf(&kv.key, &flow_prefix))
            .collect();

        let doomed = {
            let mut strikes = self
                .strikes
                .lock()
                .map_err(|_| Error::invalid_state("flow strike table poisoned"))?;
            for key in flows {
                if assigned.contains(&key) {
                    if let Some(n) = strikes.get_mut(&key) {
                        *n = n.saturating_sub(1);
                    }
                } else {
                    *strikes.entry(key).or_default() += 1;
                }
            }
            let doomed: Vec<String> = strikes
                .iter()
                .filter(|(_, n)| **n >= STALE_FLOW_STRIKES)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &doomed {
                strikes.remove(key);
            }
            doomed
        };

        for key in doomed {
            let path = format!("{flow_prefix}{key}");
            tracing::info!(key = %path, "deleting flow record of unassigned item");
            match self.store.delete_tree(&path).await {
                Ok(()) => counter!(STALE_FLOW_DELETED_COUNTER).increment(1),
                Err(e) => tracing::error!(key = %path, error = %e, "failed to delete flow record"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FlowSource for FlowCollector {
    async fn flows(&self) -> Result<FlowItems> {
        self.detect_stale().await?;

        let living: HashSet<String> = self
            .store
            .list_services()
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();

        let flow_prefix = self.store.flow_prefix();
        let items = self
            .store
            .list_flows()
            .await?
            .iter()
            .filter_map(|kv| parse_flow_record(&kv.key, &kv.value, &flow_prefix))
            .filter(|item| living.contains(&item.service))
            .collect();
        Ok(FlowItems(items))
    }
}

/// `<prefix><worker>/.../<leaf>` -> `"<worker>/<leaf>"`.
fn worker_and_leaf(key: &str, prefix: &str) -> Option<String> {
    let rest = key.strip_prefix(prefix)?;
    let (worker, tail) = rest.split_once('/')?;
    let leaf = tail.rsplit('/').next()?;
    if worker.is_empty() || leaf.is_empty() {
        return None;
    }
    Some(format!("{worker}/{leaf}"))
}

fn parse_flow_record(key: &str, value: &[u8], prefix: &str) -> Option<FlowItem> {
    let rest = key.strip_prefix(prefix)?;
    let Some((service, id)) = rest.split_once('/') else {
        tracing::warn!(key, "skipping flow record with unexpected key");
        return None;
    };
    let Ok(data_id) = id.parse::<DataId>() else {
        tracing::warn!(key, "skipping flow record with non-numeric item id");
        return None;
    };
    let flow = match std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
    {
        Some(flow) => flow,
        None => {
            tracing::warn!(key, "skipping flow record with unparsable value");
            return None;
        }
    };
    Some(FlowItem {
        service: service.to_string(),
        data_id,
        flow,
    })
}

/// Balancing knobs stored as JSON at the balance config key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    pub auto_balance_enabled: bool,
    /// Max tolerated change in per-worker flow share before rebalancing.
    pub fluctuation: f64,
    /// Force a rebalance every N passes. 0 disables.
    pub force_round: u64,
    /// Period of the flow ticker that re-runs balancing.
    pub check_interval_secs: u64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            auto_balance_enabled: false,
            fluctuation: 0.1,
            force_round: 0,
            check_interval_secs: 120,
        }
    }
}

impl BalanceConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

/// Last known good balance config, refreshed from the store.
#[derive(Debug, Default)]
pub struct BalanceSettings {
    current: RwLock<BalanceConfig>,
}

impl BalanceSettings {
    pub fn new(config: BalanceConfig) -> Self {
        Self {
            current: RwLock::new(config),
        }
    }

    pub fn get(&self) -> BalanceConfig {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, config: BalanceConfig) {
        match self.current.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    /// Reload from the store. A missing record restores defaults, a
    /// malformed one keeps the current value.
    pub async fn sync(&self, store: &DispatchStore) -> Result<()> {
        match store.get_balance_config().await? {
            None => {
                tracing::debug!("no balance config record, using defaults");
                self.set(BalanceConfig::default());
            }
            Some(kv) => match serde_json::from_slice::<BalanceConfig>(&kv.value) {
                Ok(config) => self.set(config),
                Err(e) => {
                    tracing::error!(key = %kv.key, error = %e, "malformed balance config, keeping previous");
                }
            },
        }
        Ok(())
    }

    pub async fn run_sync(&self, store: DispatchStore, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sync(&store).await {
                        tracing::warn!(error = %e, "failed to sync balance config");
                    }
                }
            }
        }
    }
}

/// One-shot "rebalance on the next pass" flag.
#[derive(Debug, Default)]
pub struct BalanceNotifier {
    pending: AtomicBool,
}

impl BalanceNotifier {
    pub fn notify(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Returns whether a request was pending, clearing it.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}
