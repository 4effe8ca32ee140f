use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::store::{CoordinationStore, KvPair};

const WATCH_CHANNEL_SIZE: usize = 16;

#[derive(Default)]
struct State {
    data: BTreeMap<String, KvPair>,
    revision: i64,
    next_lease: i64,
    leases: HashMap<i64, HashSet<String>>,
    key_leases: HashMap<String, i64>,
}

impl State {
    fn bump(&mut self) -> i64 {
        self.revision += 1;
        self.revision
    }

    fn detach(&mut self, key: &str) {
        if let Some(lease) = self.key_leases.remove(key) {
            if let Some(keys) = self.leases.get_mut(&lease) {
                keys.remove(key);
            }
        }
    }

    fn write(&mut self, key: &str, value: Vec<u8>, lease_id: Option<i64>) -> Result<()> {
        if let Some(lease) = lease_id {
            if !self.leases.contains_key(&lease) {
                return Err(Error::NotFound(format!("lease {lease}")));
            }
        }
        self.detach(key);
        if let Some(lease) = lease_id {
            self.key_leases.insert(key.to_string(), lease);
            if let Some(keys) = self.leases.get_mut(&lease) {
                keys.insert(key.to_string());
            }
        }
        let version = self.bump();
        self.data
            .insert(key.to_string(), KvPair::new(key, value, version));
        Ok(())
    }

    fn remove(&mut self, key: &str) -> bool {
        self.detach(key);
        self.data.remove(key).is_some()
    }

    fn snapshot(&self, prefix: &str) -> Vec<KvPair> {
        self.data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect()
    }
}

/// In-process coordination store.
///
/// Mirrors the etcd semantics the workspace relies on: a global revision
/// used as the record version, lease-bound keys that vanish on revoke, and
/// prefix watches delivering full snapshots.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    changes: Arc<watch::Sender<i64>>,
    closed: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            changes: Arc::new(changes),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.state
            .lock()
            .map_err(|_| Error::InvalidState("memory store lock poisoned".to_string()))
    }

    fn notify(&self, revision: i64) {
        self.changes.send_replace(revision);
    }

    /// Drop a lease and every key bound to it, as if its TTL ran out.
    pub fn expire_lease(&self, lease_id: i64) -> Result<()> {
        let revision = {
            let mut state = self.lock()?;
            let keys = state.leases.remove(&lease_id).unwrap_or_default();
            for key in &keys {
                state.key_leases.remove(key);
                state.data.remove(key);
            }
            state.bump()
        };
        self.notify(revision);
        Ok(())
    }

    pub fn revision(&self) -> i64 {
        *self.changes.borrow()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        Ok(self.lock()?.data.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        Ok(self.lock()?.snapshot(prefix))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease_id: Option<i64>) -> Result<()> {
        let revision = {
            let mut state = self.lock()?;
            state.write(key, value, lease_id)?;
            state.revision
        };
        self.notify(revision);
        Ok(())
    }

    async fn create(&self, key: &str, value: Vec<u8>, lease_id: Option<i64>) -> Result<bool> {
        let revision = {
            let mut state = self.lock()?;
            if state.data.contains_key(key) {
                return Ok(false);
            }
            state.write(key, value, lease_id)?;
            state.revision
        };
        self.notify(revision);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let revision = {
            let mut state = self.lock()?;
            if !state.remove(key) {
                return Ok(());
            }
            state.bump()
        };
        self.notify(revision);
        Ok(())
    }

    async fn delete_tree(&self, key: &str) -> Result<()> {
        let key = key.trim_end_matches('/');
        let children = format!("{key}/");
        let revision = {
            let mut state = self.lock()?;
            let doomed = state
                .data
                .keys()
                .filter(|k| k.as_str() == key || k.starts_with(&children))
                .cloned()
                .collect::<Vec<_>>();
            if doomed.is_empty() {
                return Ok(());
            }
            for k in &doomed {
                state.remove(k);
            }
            state.bump()
        };
        self.notify(revision);
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<KvPair>>> {
        let initial = self.list(prefix).await?;
        let mut changes = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let store = self.clone();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            let mut last = initial.clone();
            if tx.send(initial).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                let snapshot = match store.lock() {
                    Ok(state) => state.snapshot(&prefix),
                    Err(_) => return,
                };
                if snapshot == last {
                    continue;
                }
                last = snapshot.clone();
                if tx.send(snapshot).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn grant_lease(&self, _ttl: i64) -> Result<i64> {
        let mut state = self.lock()?;
        state.next_lease += 1;
        let lease = state.next_lease;
        state.leases.insert(lease, HashSet::new());
        Ok(lease)
    }

    async fn keep_alive(
        &self,
        lease_id: i64,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            if !self.lock()?.leases.contains_key(&lease_id) {
                return Err(Error::LeadershipLost);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn revoke_lease(&self, lease_id: i64) -> Result<()> {
        self.expire_lease(lease_id)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
