//! Lifecycle of the work units running on this worker, one per item.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metrics_const::{LIVE_UNITS_GAUGE, UNIT_OPERATIONS_COUNTER};
use crate::types::DataId;

/// What a work unit is started from: the item record behind a shadow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub data_id: DataId,
    /// Key of the item record.
    pub source: String,
    /// Raw item config, opaque to the scheduler.
    pub config: Vec<u8>,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Ready,
    Running,
    Closing,
    Closed,
    Error,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Ready => "ready",
            UnitState::Running => "running",
            UnitState::Closing => "closing",
            UnitState::Closed => "closed",
            UnitState::Error => "error",
        }
    }

    /// States that still occupy the data id.
    fn is_live(&self) -> bool {
        matches!(self, UnitState::Ready | UnitState::Running | UnitState::Closing)
    }
}

/// A long-running unit of work for one item.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    /// Start processing. The returned receiver yields a reason if the unit
    /// dies on its own; it is dropped silently on a requested stop.
    async fn start(&self) -> Result<oneshot::Receiver<String>>;

    /// Ask the unit to stop, giving it `timeout` to wind down.
    async fn stop(&self, timeout: Duration) -> Result<()>;

    /// Resolve once the unit has fully stopped.
    async fn wait(&self) -> Result<()>;

    /// Current throughput, reported as flow.
    fn flow(&self) -> i64 {
        0
    }
}

pub trait WorkUnitFactory: Send + Sync {
    fn create(&self, spec: &UnitSpec) -> Result<Arc<dyn WorkUnit>>;
}

struct UnitEntry {
    spec: UnitSpec,
    unit: Arc<dyn WorkUnit>,
    state: UnitState,
    kill: Option<oneshot::Receiver<String>>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub stop_timeout: Duration,
    pub wait_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
            wait_timeout: Duration::from_secs(30),
        }
    }
}

pub struct PipelineManager {
    factory: Arc<dyn WorkUnitFactory>,
    config: PipelineConfig,
    units: RwLock<HashMap<DataId, UnitEntry>>,
}

impl PipelineManager {
    pub fn new(factory: Arc<dyn WorkUnitFactory>, config: PipelineConfig) -> Self {
        Self {
            factory,
            config,
            units: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<DataId, UnitEntry>>> {
        self.units
            .read()
            .map_err(|_| Error::invalid_state("pipeline registry lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<DataId, UnitEntry>>> {
        self.units
            .write()
            .map_err(|_| Error::invalid_state("pipeline registry lock poisoned"))
    }

    fn set_state(&self, data_id: DataId, state: UnitState) -> Result<()> {
        if let Some(entry) = self.write()?.get_mut(&data_id) {
            entry.state = state;
        }
        Ok(())
    }

    fn update_live_gauge(&self) {
        if let Ok(units) = self.read() {
            let live = units.values().filter(|e| e.state.is_live()).count();
            gauge!(LIVE_UNITS_GAUGE).set(live as f64);
        }
    }

    /// Create and start a unit for `spec`.
    pub async fn activate(&self, spec: UnitSpec) -> Result<()> {
        let data_id = spec.data_id;
        let unit = {
            let mut units = self.write()?;
            if units.get(&data_id).is_some_and(|e| e.state.is_live()) {
                return Err(Error::AlreadyExists(format!("work unit {data_id}")));
            }
            let unit = self.factory.create(&spec)?;
            units.insert(
                data_id,
                UnitEntry {
                    spec,
                    unit: Arc::clone(&unit),
                    state: UnitState::Ready,
                    kill: None,
                },
            );
            unit
        };

        let result = contain(data_id, "start", async move { unit.start().await }).await;
        let outcome = match result {
            Ok(kill) => {
                if let Some(entry) = self.write()?.get_mut(&data_id) {
                    entry.state = UnitState::Running;
                    entry.kill = Some(kill);
                }
                tracing::info!(data_id, "work unit started");
                Ok(())
            }
            Err(e) => {
                tracing::error!(data_id, error = %e, "work unit failed to start");
                self.set_state(data_id, UnitState::Error)?;
                Err(e)
            }
        };
        record_operation("activate", &outcome);
        self.update_live_gauge();
        outcome
    }

    /// Stop, wait for and forget the unit of `data_id`. The unit is removed
    /// even if stopping fails; the first failure is returned.
    pub async fn deactivate(&self, data_id: DataId) -> Result<()> {
        let unit = {
            let mut units = self.write()?;
            let entry = units
                .get_mut(&data_id)
                .ok_or_else(|| Error::NotFound(format!("work unit {data_id}")))?;
            entry.state = UnitState::Closing;
            entry.kill = None;
            Arc::clone(&entry.unit)
        };

        let stop_timeout = self.config.stop_timeout;
        let stop = {
            let unit = Arc::clone(&unit);
            bounded(data_id, "stop", stop_timeout, async move {
                unit.stop(stop_timeout).await
            })
            .await
        };
        let wait = bounded(data_id, "wait", self.config.wait_timeout, async move {
            unit.wait().await
        })
        .await;

        let outcome = match (stop, wait) {
            (Ok(()), Ok(())) => {
                self.set_state(data_id, UnitState::Closed)?;
                Ok(())
            }
            (Err(e), _) | (Ok(()), Err(e)) => {
                tracing::error!(data_id, error = %e, "work unit did not stop cleanly");
                self.set_state(data_id, UnitState::Error)?;
                Err(e)
            }
        };

        self.write()?.remove(&data_id);
        tracing::info!(data_id, "work unit removed");
        record_operation("deactivate", &outcome);
        self.update_live_gauge();
        outcome
    }

    /// Restart the unit with `spec`. A failed stop is logged and ignored;
    /// the result is that of the new start.
    pub async fn reactivate(&self, spec: UnitSpec) -> Result<()> {
        let data_id = spec.data_id;
        if let Err(e) = self.deactivate(data_id).await {
            tracing::warn!(data_id, error = %e, "deactivate before reactivate failed");
        }
        let result = self.activate(spec).await;
        if let Err(e) = &result {
            tracing::error!(data_id, error = %e, "reactivate failed");
        }
        result
    }

    /// Drain kill signals without blocking. Returns each unit that died on
    /// its own since the last call, with the reason it gave.
    pub fn killed(&self) -> Result<Vec<(DataId, String)>> {
        let mut dead = Vec::new();
        let mut units = self.write()?;
        for (data_id, entry) in units.iter_mut() {
            let Some(kill) = entry.kill.as_mut() else {
                continue;
            };
            match kill.try_recv() {
                Ok(reason) => {
                    entry.kill = None;
                    entry.state = UnitState::Error;
                    dead.push((*data_id, reason));
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Closed) => entry.kill = None,
            }
        }
        dead.sort_by_key(|(data_id, _)| *data_id);
        Ok(dead)
    }

    pub fn state(&self, data_id: DataId) -> Option<UnitState> {
        self.read().ok()?.get(&data_id).map(|e| e.state)
    }

    pub fn spec(&self, data_id: DataId) -> Option<UnitSpec> {
        self.read().ok()?.get(&data_id).map(|e| e.spec.clone())
    }

    /// Ids of every unit known to the manager, including failed ones.
    pub fn data_ids(&self) -> Vec<DataId> {
        let mut ids: Vec<DataId> = match self.read() {
            Ok(units) => units.keys().copied().collect(),
            Err(_) => Vec::new(),
        };
        ids.sort_unstable();
        ids
    }

    /// Flow of every running unit.
    pub fn flows(&self) -> Vec<(DataId, i64)> {
        let Ok(units) = self.read() else {
            return Vec::new();
        };
        let mut flows: Vec<(DataId, i64)> = units
            .iter()
            .filter(|(_, e)| e.state == UnitState::Running)
            .map(|(id, e)| (*id, e.unit.flow()))
            .collect();
        flows.sort_by_key(|(id, _)| *id);
        flows
    }

    pub fn len(&self) -> usize {
        self.read().map(|u| u.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deactivate everything. Failures are logged.
    pub async fn stop_all(&self) {
        for data_id in self.data_ids() {
            if let Err(e) = self.deactivate(data_id).await {
                tracing::warn!(data_id, error = %e, "failed to stop work unit on shutdown");
            }
        }
    }
}

fn record_operation(op: &'static str, outcome: &Result<()>) {
    let status = if outcome.is_ok() { "success" } else { "failure" };
    counter!(UNIT_OPERATIONS_COUNTER, "op" => op, "status" => status).increment(1);
}

/// Run a unit call on its own task so a panic becomes an error.
async fn contain<T, F>(data_id: DataId, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(e) => Err(Error::work_unit(data_id, format!("{op} panicked: {e}"))),
    }
}

async fn bounded<T, F>(data_id: DataId, op: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(after, contain(data_id, op, fut)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: op,
            after,
        }),
    }
}

/// Placeholder unit: holds its slot and reports no flow.
pub struct IdleWorkUnit {
    spec: UnitSpec,
    stopped: CancellationToken,
    kill: Mutex<Option<oneshot::Sender<String>>>,
}

impl IdleWorkUnit {
    pub fn new(spec: UnitSpec) -> Self {
        Self {
            spec,
            stopped: CancellationToken::new(),
            kill: Mutex::new(None),
        }
    }
}

#[async_trait]
impl WorkUnit for IdleWorkUnit {
    async fn start(&self) -> Result<oneshot::Receiver<String>> {
        let (tx, rx) = oneshot::channel();
        match self.kill.lock() {
            Ok(mut kill) => *kill = Some(tx),
            Err(poisoned) => *poisoned.into_inner() = Some(tx),
        }
        tracing::debug!(data_id = self.spec.data_id, source = %self.spec.source, "idle unit started");
        Ok(rx)
    }

    async fn stop(&self, _timeout: Duration) -> Result<()> {
        match self.kill.lock() {
            Ok(mut kill) => drop(kill.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }
        self.stopped.cancel();
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        self.stopped.cancelled().await;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct IdleUnitFactory;

impl WorkUnitFactory for IdleUnitFactory {
    fn create(&self, spec: &UnitSpec) -> Result<Arc<dyn WorkUnit>> {
        Ok(Arc::new(IdleWorkUnit::new(spec.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec(data_id: DataId) -> UnitSpec {
        UnitSpec {
            data_id,
            source: format!("/sd/items/{data_id}"),
            config: format!(r#"{{"data_id": {data_id}}}"#).into_bytes(),
            version: 1,
        }
    }

    fn manager(factory: impl WorkUnitFactory + 'static) -> PipelineManager {
        PipelineManager::new(
            Arc::new(factory),
            PipelineConfig {
                stop_timeout: Duration::from_millis(100),
                wait_timeout: Duration::from_millis(100),
            },
        )
    }

    enum Behavior {
        PanicOnStart,
        HangOnWait,
    }

    struct Faulty(Behavior);

    #[async_trait]
    impl WorkUnit for Faulty {
        async fn start(&self) -> Result<oneshot::Receiver<String>> {
            if matches!(self.0, Behavior::PanicOnStart) {
                panic!("boom");
            }
            Ok(oneshot::channel().1)
        }

        async fn stop(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn wait(&self) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct FaultyFactory(fn() -> Behavior);

    impl WorkUnitFactory for FaultyFactory {
        fn create(&self, _spec: &UnitSpec) -> Result<Arc<dyn WorkUnit>> {
            Ok(Arc::new(Faulty((self.0)())))
        }
    }

    /// Keeps the kill sender so tests can fire it.
    #[derive(Default)]
    struct Killable {
        senders: Mutex<HashMap<DataId, oneshot::Sender<String>>>,
        created: AtomicUsize,
    }

    struct KillableUnit {
        data_id: DataId,
        owner: Arc<Killable>,
    }

    #[async_trait]
    impl WorkUnit for KillableUnit {
        async fn start(&self) -> Result<oneshot::Receiver<String>> {
            let (tx, rx) = oneshot::channel();
            self.owner.senders.lock().unwrap().insert(self.data_id, tx);
            Ok(rx)
        }

        async fn stop(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn wait(&self) -> Result<()> {
            Ok(())
        }

        fn flow(&self) -> i64 {
            self.data_id * 10
        }
    }

    struct KillableFactory(Arc<Killable>);

    impl WorkUnitFactory for KillableFactory {
        fn create(&self, spec: &UnitSpec) -> Result<Arc<dyn WorkUnit>> {
            self.0.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(KillableUnit {
                data_id: spec.data_id,
                owner: Arc::clone(&self.0),
            }))
        }
    }

    #[tokio::test]
    async fn lifecycle_and_duplicates() {
        let manager = manager(IdleUnitFactory);

        manager.activate(spec(1)).await.unwrap();
        assert_eq!(manager.state(1), Some(UnitState::Running));
        assert!(matches!(
            manager.activate(spec(1)).await,
            Err(Error::AlreadyExists(_))
        ));

        manager.deactivate(1).await.unwrap();
        assert_eq!(manager.state(1), None);
        assert!(matches!(manager.deactivate(1).await, Err(Error::NotFound(_))));

        manager.activate(spec(1)).await.unwrap();
        let mut changed = spec(1);
        changed.version = 2;
        manager.reactivate(changed.clone()).await.unwrap();
        assert_eq!(manager.spec(1), Some(changed));
    }

    #[tokio::test]
    async fn reactivate_of_unknown_unit_still_starts_it() {
        let manager = manager(IdleUnitFactory);
        manager.reactivate(spec(7)).await.unwrap();
        assert_eq!(manager.state(7), Some(UnitState::Running));
    }

    #[tokio::test]
    async fn panicking_start_is_contained() {
        let manager = manager(FaultyFactory(|| Behavior::PanicOnStart));

        let err = manager.activate(spec(3)).await.unwrap_err();
        assert!(matches!(err, Error::WorkUnit { data_id: 3, .. }));
        assert_eq!(manager.state(3), Some(UnitState::Error));

        // A failed unit does not block a new attempt.
        let err = manager.activate(spec(3)).await.unwrap_err();
        assert!(matches!(err, Error::WorkUnit { .. }));
    }

    #[tokio::test]
    async fn hung_wait_times_out_and_is_removed() {
        let manager = manager(FaultyFactory(|| Behavior::HangOnWait));
        manager.activate(spec(4)).await.unwrap();

        let err = manager.deactivate(4).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                operation: "wait",
                ..
            }
        ));
        assert_eq!(manager.state(4), None);
    }

    #[tokio::test]
    async fn kill_signals_are_drained_once() {
        let owner = Arc::new(Killable::default());
        let manager = manager(KillableFactory(Arc::clone(&owner)));
        manager.activate(spec(1)).await.unwrap();
        manager.activate(spec(2)).await.unwrap();
        assert!(manager.killed().unwrap().is_empty());

        let tx = owner.senders.lock().unwrap().remove(&2).unwrap();
        tx.send("consumer lost".to_string()).unwrap();

        let dead = manager.killed().unwrap();
        assert_eq!(dead, vec![(2, "consumer lost".to_string())]);
        assert_eq!(manager.state(2), Some(UnitState::Error));
        assert!(manager.killed().unwrap().is_empty());

        assert_eq!(manager.flows(), vec![(1, 10)]);
        manager.stop_all().await;
        assert!(manager.is_empty());
        assert_eq!(owner.created.load(Ordering::SeqCst), 2);
    }
}
