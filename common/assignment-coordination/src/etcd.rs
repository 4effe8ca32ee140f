use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::store::{CoordinationStore, KvPair};

const WATCH_CHANNEL_SIZE: usize = 16;
const RELIST_ATTEMPTS: u32 = 2;

/// Re-list a watched prefix after a change, retrying once. `None` closes
/// the watch and leaves re-watching to the caller.
async fn relist<F, Fut>(prefix: &str, mut list: F) -> Option<Vec<KvPair>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<KvPair>>>,
{
    for attempt in 1..=RELIST_ATTEMPTS {
        match list().await {
            Ok(snapshot) => return Some(snapshot),
            Err(e) => {
                tracing::warn!(prefix, attempt, error = %e, "re-listing watched prefix failed")
            }
        }
    }
    tracing::warn!(prefix, "closing watch after failed re-list");
    None
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    /// Namespace prepended to every key, e.g. "/prod" or "/test-{uuid}".
    /// Keys handed back to callers have it stripped again.
    pub prefix: String,
}

/// etcd-backed coordination store.
///
/// `Client` is `Clone` (wraps an inner `Arc`), so each method clones it cheaply.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    config: StoreConfig,
    closed: Arc<AtomicBool>,
}

impl EtcdStore {
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let client = Client::connect(&config.endpoints, None).await?;
        tracing::info!(endpoints = ?config.endpoints, prefix = %config.prefix, "connected to etcd");
        Ok(Self {
            client,
            config,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.prefix.trim_end_matches('/'), key)
    }

    fn strip(&self, raw: &[u8]) -> String {
        let key = String::from_utf8_lossy(raw);
        let namespace = self.config.prefix.trim_end_matches('/');
        key.strip_prefix(namespace).unwrap_or(&key).to_string()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn to_pair(&self, kv: &etcd_client::KeyValue) -> KvPair {
        KvPair {
            key: self.strip(kv.key()),
            value: kv.value().to_vec(),
            version: kv.mod_revision(),
        }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        self.ensure_open()?;
        let resp = self.client.clone().get(self.key(key), None).await?;
        Ok(resp.kvs().first().map(|kv| self.to_pair(kv)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        self.ensure_open()?;
        let options = GetOptions::new().with_prefix();
        let resp = self
            .client
            .clone()
            .get(self.key(prefix), Some(options))
            .await?;
        Ok(resp.kvs().iter().map(|kv| self.to_pair(kv)).collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease_id: Option<i64>) -> Result<()> {
        self.ensure_open()?;
        let options = lease_id.map(|id| PutOptions::new().with_lease(id));
        self.client
            .clone()
            .put(self.key(key), value, options)
            .await?;
        Ok(())
    }

    async fn create(&self, key: &str, value: Vec<u8>, lease_id: Option<i64>) -> Result<bool> {
        self.ensure_open()?;
        let key = self.key(key);
        let options = lease_id.map(|id| PutOptions::new().with_lease(id));
        let txn = Txn::new()
            .when(vec![Compare::version(key.clone(), CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key.clone(), value, options)])
            .or_else(vec![TxnOp::get(key, None)]);

        let resp = self.client.clone().txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.client.clone().delete(self.key(key), None).await?;
        Ok(())
    }

    async fn delete_tree(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let key = self.key(key.trim_end_matches('/'));
        let options = DeleteOptions::new().with_prefix();
        let txn = Txn::new().and_then(vec![
            TxnOp::delete(key.clone(), None),
            TxnOp::delete(format!("{key}/"), Some(options)),
        ]);
        self.client.clone().txn(txn).await?;
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<KvPair>>> {
        self.ensure_open()?;
        let initial = self.list(prefix).await?;
        let options = WatchOptions::new().with_prefix();
        let mut stream = self
            .client
            .clone()
            .watch(self.key(prefix), Some(options))
            .await?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let store = self.clone();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            if tx.send(initial).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = stream.message() => {
                        match msg {
                            Ok(Some(resp)) if resp.canceled() => {
                                tracing::warn!(prefix = %prefix, "etcd watch cancelled by server");
                                return;
                            }
                            Ok(Some(_)) => {}
                            Ok(None) => {
                                tracing::warn!(prefix = %prefix, "etcd watch stream ended");
                                return;
                            }
                            Err(e) => {
                                tracing::warn!(prefix = %prefix, error = %e, "etcd watch failed");
                                return;
                            }
                        }
                    }
                }

                // Deliver the whole prefix, not the delta
                let Some(snapshot) = relist(&prefix, || store.list(&prefix)).await else {
                    return;
                };
                if tx.send(snapshot).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn grant_lease(&self, ttl: i64) -> Result<i64> {
        self.ensure_open()?;
        let resp = self.client.clone().lease_grant(ttl, None).await?;
        Ok(resp.id())
    }

    async fn keep_alive(
        &self,
        lease_id: i64,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.ensure_open()?;
        let (mut keeper, mut stream) = self.client.clone().lease_keep_alive(lease_id).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {
                    keeper.keep_alive().await?;
                    match stream.message().await? {
                        Some(resp) if resp.ttl() > 0 => {}
                        _ => return Err(Error::LeadershipLost),
                    }
                }
            }
        }
    }

    async fn revoke_lease(&self, lease_id: i64) -> Result<()> {
        self.ensure_open()?;
        self.client.clone().lease_revoke(lease_id).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        tracing::info!(prefix = %self.config.prefix, "etcd store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn relist_retries_once() {
        let calls = AtomicU32::new(0);
        let snapshot = relist("/items", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Closed)
            } else {
                Ok(vec![KvPair::new("/items/1", b"a".to_vec(), 3)])
            }
        })
        .await;
        assert_eq!(snapshot.map(|s| s.len()), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn relist_gives_up_after_two_failures() {
        let calls = AtomicU32::new(0);
        let snapshot = relist("/items", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Closed)
        })
        .await;
        assert!(snapshot.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), RELIST_ATTEMPTS);
    }
}
