use std::sync::Arc;

use assignment_coordination::store::{put_json, CoordinationStore, KvPair};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{DataId, ServiceInfo};

/// Where every kind of record lives. Roots carry no trailing slash.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    pub items_root: String,
    pub shadows_root: String,
    pub services_root: String,
    pub manual_root: String,
    pub flow_root: String,
    pub leader_key: String,
    pub balance_config_key: String,
}

impl KeyLayout {
    /// Layout with every root under `base`, e.g. `/stream-dispatcher`.
    pub fn under(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            items_root: format!("{base}/items"),
            shadows_root: format!("{base}/shadows"),
            services_root: format!("{base}/services"),
            manual_root: format!("{base}/manual"),
            flow_root: format!("{base}/flow"),
            leader_key: format!("{base}/leader"),
            balance_config_key: format!("{base}/schedule/balance_conf"),
        }
    }
}

/// All key patterns used by the dispatcher and schedulers.
enum StoreKey<'a> {
    ItemsPrefix,
    ShadowsPrefix,
    WorkerShadowsPrefix(&'a str),
    Service(&'a str),
    ServicesPrefix,
    ManualPrefix,
    FlowPrefix,
    Flow { worker: &'a str, data_id: DataId },
    BalanceConfig,
}

impl StoreKey<'_> {
    fn resolve(&self, layout: &KeyLayout) -> String {
        let root = |r: &str| r.trim_end_matches('/').to_string();
        match self {
            StoreKey::ItemsPrefix => format!("{}/", root(&layout.items_root)),
            StoreKey::ShadowsPrefix => format!("{}/", root(&layout.shadows_root)),
            StoreKey::WorkerShadowsPrefix(worker) => {
                format!("{}/{worker}/", root(&layout.shadows_root))
            }
            StoreKey::Service(id) => format!("{}/{id}", root(&layout.services_root)),
            StoreKey::ServicesPrefix => format!("{}/", root(&layout.services_root)),
            StoreKey::ManualPrefix => format!("{}/", root(&layout.manual_root)),
            StoreKey::FlowPrefix => format!("{}/", root(&layout.flow_root)),
            StoreKey::Flow { worker, data_id } => {
                format!("{}/{worker}/{data_id}", root(&layout.flow_root))
            }
            StoreKey::BalanceConfig => layout.balance_config_key.clone(),
        }
    }
}

/// Typed view of the coordination store for stream dispatching.
///
/// Cheap to clone: the backend sits behind an `Arc`.
#[derive(Clone)]
pub struct DispatchStore {
    inner: Arc<dyn CoordinationStore>,
    layout: Arc<KeyLayout>,
}

impl DispatchStore {
    pub fn new(inner: Arc<dyn CoordinationStore>, layout: KeyLayout) -> Self {
        Self {
            inner,
            layout: Arc::new(layout),
        }
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn backend(&self) -> Arc<dyn CoordinationStore> {
        Arc::clone(&self.inner)
    }

    fn key(&self, k: StoreKey<'_>) -> String {
        k.resolve(&self.layout)
    }

    // ── Items ───────────────────────────────────────────────────

    pub async fn list_items(&self) -> Result<Vec<KvPair>> {
        Ok(self.inner.list(&self.key(StoreKey::ItemsPrefix)).await?)
    }

    pub async fn watch_items(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<KvPair>>> {
        Ok(self
            .inner
            .watch_prefix(&self.key(StoreKey::ItemsPrefix), cancel)
            .await?)
    }

    // ── Services ────────────────────────────────────────────────

    pub async fn register_service(&self, info: &ServiceInfo, lease_id: i64) -> Result<()> {
        let key = self.key(StoreKey::Service(&info.id));
        Ok(put_json(self.inner.as_ref(), &key, info, Some(lease_id)).await?)
    }

    pub async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        let pairs = self.inner.list(&self.key(StoreKey::ServicesPrefix)).await?;
        Ok(parse_services(&pairs))
    }

    pub async fn watch_services(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<KvPair>>> {
        Ok(self
            .inner
            .watch_prefix(&self.key(StoreKey::ServicesPrefix), cancel)
            .await?)
    }

    // ── Shadows ─────────────────────────────────────────────────

    pub async fn list_shadows(&self) -> Result<Vec<KvPair>> {
        Ok(self.inner.list(&self.key(StoreKey::ShadowsPrefix)).await?)
    }

    pub async fn list_worker_shadows(&self, worker: &str) -> Result<Vec<KvPair>> {
        Ok(self
            .inner
            .list(&self.key(StoreKey::WorkerShadowsPrefix(worker)))
            .await?)
    }

    pub async fn watch_worker_shadows(
        &self,
        worker: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<KvPair>>> {
        Ok(self
            .inner
            .watch_prefix(&self.key(StoreKey::WorkerShadowsPrefix(worker)), cancel)
            .await?)
    }

    pub async fn put_shadow(&self, target: &str, value: Vec<u8>) -> Result<()> {
        Ok(self.inner.put(target, value, None).await?)
    }

    /// Remove a record and everything below it.
    pub async fn delete_tree(&self, key: &str) -> Result<()> {
        Ok(self.inner.delete_tree(key).await?)
    }

    // ── Manual overrides ────────────────────────────────────────

    pub async fn list_manual(&self) -> Result<Vec<KvPair>> {
        Ok(self.inner.list(&self.key(StoreKey::ManualPrefix)).await?)
    }

    // ── Flow ────────────────────────────────────────────────────

    pub async fn list_flows(&self) -> Result<Vec<KvPair>> {
        Ok(self.inner.list(&self.key(StoreKey::FlowPrefix)).await?)
    }

    pub async fn put_flow(&self, worker: &str, data_id: DataId, flow: i64) -> Result<()> {
        let key = self.key(StoreKey::Flow { worker, data_id });
        Ok(self
            .inner
            .put(&key, flow.to_string().into_bytes(), None)
            .await?)
    }

    // ── Balance tuning ──────────────────────────────────────────

    pub async fn get_balance_config(&self) -> Result<Option<KvPair>> {
        Ok(self.inner.get(&self.key(StoreKey::BalanceConfig)).await?)
    }

    pub fn shadows_prefix(&self) -> String {
        self.key(StoreKey::ShadowsPrefix)
    }

    pub fn flow_prefix(&self) -> String {
        self.key(StoreKey::FlowPrefix)
    }
}

/// Decode service registrations, skipping records that do not parse.
pub fn parse_services(pairs: &[KvPair]) -> Vec<ServiceInfo> {
    pairs
        .iter()
        .filter_map(|kv| match serde_json::from_slice::<ServiceInfo>(&kv.value) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(key = %kv.key, error = %e, "skipping malformed service record");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceStatus;
    use assignment_coordination::memory::MemoryStore;

    #[test]
    fn key_layout_resolves_nested_keys() {
        let layout = KeyLayout::under("/sd/");
        assert_eq!(
            StoreKey::WorkerShadowsPrefix("w-1").resolve(&layout),
            "/sd/shadows/w-1/"
        );
        assert_eq!(
            StoreKey::Flow {
                worker: "w-1",
                data_id: 1001
            }
            .resolve(&layout),
            "/sd/flow/w-1/1001"
        );
        assert_eq!(StoreKey::ManualPrefix.resolve(&layout), "/sd/manual/");
    }

    #[tokio::test]
    async fn list_services_skips_malformed_records() {
        let backend = Arc::new(MemoryStore::new());
        let store = DispatchStore::new(backend.clone(), KeyLayout::under("/sd"));
        let lease = backend.grant_lease(10).await.unwrap();
        let info = ServiceInfo {
            id: "w-1".to_string(),
            address: "127.0.0.1:1".to_string(),
            status: ServiceStatus::Ready,
            registered_at: 0,
        };
        store.register_service(&info, lease).await.unwrap();
        backend
            .put("/sd/services/broken", b"{".to_vec(), None)
            .await
            .unwrap();

        assert_eq!(store.list_services().await.unwrap(), vec![info]);
    }
}
