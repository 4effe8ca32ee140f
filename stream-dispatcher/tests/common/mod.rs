#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use assignment_coordination::leader_election::{run_election, LeaderElectionConfig};
use assignment_coordination::memory::MemoryStore;
use assignment_coordination::store::{CoordinationStore, KvPair};
use stream_dispatcher::converter::PathConverter;
use stream_dispatcher::dispatcher::{follow_leadership, Dispatcher, DispatcherConfig};
use stream_dispatcher::error::{Error, Result};
use stream_dispatcher::flow::{BalanceConfig, BalanceSettings, FlowItem, FlowItems, FlowSource};
use stream_dispatcher::pipeline::{UnitSpec, WorkUnit, WorkUnitFactory};
use stream_dispatcher::store::{DispatchStore, KeyLayout};
use stream_dispatcher::types::{DataId, ServiceInfo, ServiceStatus};

pub const ROOT: &str = "/sd";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub fn test_store() -> (MemoryStore, DispatchStore) {
    let backend = MemoryStore::new();
    let store = DispatchStore::new(Arc::new(backend.clone()), KeyLayout::under(ROOT));
    (backend, store)
}

pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}

// ── Records ─────────────────────────────────────────────────────

pub fn item_key(suffix: &str) -> String {
    format!("{ROOT}/items/{suffix}")
}

pub fn shadow_key(worker: &str, suffix: &str) -> String {
    format!("{ROOT}/shadows/{worker}/{suffix}")
}

pub fn item_config(data_id: DataId, partitions: usize) -> Vec<u8> {
    format!(
        r#"{{"data_id": {data_id}, "mq_config": {{"storage_config": {{"partition": {partitions}}}}}}}"#
    )
    .into_bytes()
}

/// Write an item record and return it as stored.
pub async fn put_item(
    backend: &MemoryStore,
    suffix: &str,
    data_id: DataId,
    partitions: usize,
) -> KvPair {
    let key = item_key(suffix);
    backend
        .put(&key, item_config(data_id, partitions), None)
        .await
        .unwrap();
    backend.get(&key).await.unwrap().unwrap()
}

pub fn service(id: &str) -> ServiceInfo {
    ServiceInfo {
        id: id.to_string(),
        address: format!("{id}:9000"),
        status: ServiceStatus::Ready,
        registered_at: 0,
    }
}

/// Register workers directly, without a keepalive.
pub async fn register_services(backend: &MemoryStore, store: &DispatchStore, ids: &[&str]) {
    for id in ids {
        let lease = backend.grant_lease(30).await.unwrap();
        store.register_service(&service(id), lease).await.unwrap();
    }
}

/// Shadow keys per worker, sorted.
pub async fn shadows_by_worker(store: &DispatchStore) -> BTreeMap<String, Vec<String>> {
    let prefix = format!("{ROOT}/shadows/");
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for kv in store.list_shadows().await.unwrap() {
        let rest = kv.key.strip_prefix(&prefix).unwrap();
        let (worker, suffix) = rest.split_once('/').unwrap();
        out.entry(worker.to_string())
            .or_default()
            .push(suffix.to_string());
    }
    for suffixes in out.values_mut() {
        suffixes.sort();
    }
    out
}

// ── Flow ────────────────────────────────────────────────────────

/// Fixed flow per data id, attributed to one worker.
pub struct StaticFlows(Mutex<FlowItems>);

impl StaticFlows {
    pub fn new(flows: &[(DataId, i64)]) -> Arc<Self> {
        let items = flows
            .iter()
            .map(|&(data_id, flow)| FlowItem {
                service: "w-0".to_string(),
                data_id,
                flow,
            })
            .collect();
        Arc::new(Self(Mutex::new(FlowItems(items))))
    }
}

#[async_trait]
impl FlowSource for StaticFlows {
    async fn flows(&self) -> Result<FlowItems> {
        Ok(self.0.lock().unwrap().clone())
    }
}

// ── Component builders ──────────────────────────────────────────

pub fn fast_dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        dispatch_delay: Duration::from_millis(30),
        recover_interval: Duration::from_secs(300),
        trigger_period: Duration::from_secs(300),
        concurrency: 4,
        watch_retry_interval: Duration::from_millis(50),
    }
}

pub fn dispatcher(store: &DispatchStore, auto: bool, flows: Arc<dyn FlowSource>) -> Arc<Dispatcher> {
    let settings = Arc::new(BalanceSettings::new(BalanceConfig {
        auto_balance_enabled: auto,
        ..Default::default()
    }));
    Arc::new(Dispatcher::new(
        store.clone(),
        Arc::new(PathConverter::new(
            format!("{ROOT}/items"),
            format!("{ROOT}/shadows"),
        )),
        settings,
        flows,
        fast_dispatcher_config(),
    ))
}

/// Run a leader candidate whose tenures run `dispatcher`.
pub fn start_candidate(
    backend: &MemoryStore,
    name: &str,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let (tx, rx) = mpsc::channel(8);
    let election = LeaderElectionConfig {
        name: name.to_string(),
        leader_key: format!("{ROOT}/leader"),
        lease_ttl: 10,
        keepalive_interval: Duration::from_millis(50),
        retry_interval: Duration::from_millis(50),
    };
    tokio::spawn(run_election(
        Arc::new(backend.clone()),
        election,
        cancel.clone(),
        tx,
    ));
    tokio::spawn(follow_leadership(rx, cancel, move |token| {
        Arc::clone(&dispatcher).run(token)
    }))
}

// ── Work units ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitEvent {
    Started(DataId),
    Stopped(DataId),
    Refused(DataId),
}

/// Records every start and stop, and lets tests kill units or make their
/// creation fail.
#[derive(Default)]
pub struct RecordingFactory {
    pub events: Mutex<Vec<UnitEvent>>,
    kills: Mutex<BTreeMap<DataId, oneshot::Sender<String>>>,
    refused: Mutex<BTreeSet<DataId>>,
}

impl RecordingFactory {
    pub fn events(&self) -> Vec<UnitEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn started(&self, data_id: DataId) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == UnitEvent::Started(data_id))
            .count()
    }

    pub fn refused(&self, data_id: DataId) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == UnitEvent::Refused(data_id))
            .count()
    }

    /// Fail every creation of a unit for `data_id` until allowed again.
    pub fn refuse(&self, data_id: DataId, refuse: bool) {
        let mut refused = self.refused.lock().unwrap();
        if refuse {
            refused.insert(data_id);
        } else {
            refused.remove(&data_id);
        }
    }

    /// Make the running unit of `data_id` report its own death.
    pub fn kill(&self, data_id: DataId) -> bool {
        match self.kills.lock().unwrap().remove(&data_id) {
            Some(tx) => tx.send("killed by test".to_string()).is_ok(),
            None => false,
        }
    }
}

pub struct RecordingUnit {
    data_id: DataId,
    owner: Arc<RecordingFactory>,
}

#[async_trait]
impl WorkUnit for RecordingUnit {
    async fn start(&self) -> Result<oneshot::Receiver<String>> {
        let (tx, rx) = oneshot::channel();
        self.owner.kills.lock().unwrap().insert(self.data_id, tx);
        self.owner
            .events
            .lock()
            .unwrap()
            .push(UnitEvent::Started(self.data_id));
        Ok(rx)
    }

    async fn stop(&self, _timeout: Duration) -> Result<()> {
        self.owner.kills.lock().unwrap().remove(&self.data_id);
        self.owner
            .events
            .lock()
            .unwrap()
            .push(UnitEvent::Stopped(self.data_id));
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        Ok(())
    }

    fn flow(&self) -> i64 {
        self.data_id * 100
    }
}

pub struct SharedFactory(pub Arc<RecordingFactory>);

impl WorkUnitFactory for SharedFactory {
    fn create(&self, spec: &UnitSpec) -> Result<Arc<dyn WorkUnit>> {
        if self.0.refused.lock().unwrap().contains(&spec.data_id) {
            self.0
                .events
                .lock()
                .unwrap()
                .push(UnitEvent::Refused(spec.data_id));
            return Err(Error::work_unit(spec.data_id, "creation refused"));
        }
        Ok(Arc::new(RecordingUnit {
            data_id: spec.data_id,
            owner: Arc::clone(&self.0),
        }))
    }
}
