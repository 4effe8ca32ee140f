use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A single record as seen by the coordination store.
///
/// `version` is the store's modification counter for the key. It changes on
/// every write, so two reads with the same version saw the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub version: i64,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, version: i64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version,
        }
    }
}

/// The KV / Session / Watch contract consumed by the dispatcher and the
/// per-worker schedulers.
///
/// Keys are plain strings laid out hierarchically with `/`. Listings are
/// returned sorted by key.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvPair>>;

    /// All records whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>>;

    /// Keys under `prefix`. With a separator, keys are folded at the first
    /// separator after the prefix, so only one level is returned.
    async fn keys(&self, prefix: &str, separator: Option<char>) -> Result<Vec<String>> {
        let keys = self
            .list(prefix)
            .await?
            .into_iter()
            .map(|kv| kv.key)
            .collect::<Vec<_>>();
        Ok(fold_keys(prefix, keys, separator))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease_id: Option<i64>) -> Result<()>;

    /// Compare-and-set: write only if the key does not exist yet.
    /// Returns whether the write happened.
    async fn create(&self, key: &str, value: Vec<u8>, lease_id: Option<i64>) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete `key` itself and everything below `key/`.
    async fn delete_tree(&self, key: &str) -> Result<()>;

    /// Watch a prefix. The receiver gets the full current set of records
    /// under `prefix` once immediately and again after every change. The
    /// channel closes when `cancel` fires or the underlying watch fails.
    async fn watch_prefix(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<KvPair>>>;

    async fn grant_lease(&self, ttl: i64) -> Result<i64>;

    /// Keep a lease alive until `cancel` fires. Returns
    /// `Error::LeadershipLost` when the lease can no longer be refreshed.
    async fn keep_alive(
        &self,
        lease_id: i64,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<()>;

    async fn revoke_lease(&self, lease_id: i64) -> Result<()>;

    /// Release the connection. Every later call fails with `Error::Closed`.
    async fn close(&self) -> Result<()>;
}

/// Read a record and decode its value as JSON.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn CoordinationStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(kv) => Ok(Some(serde_json::from_slice(&kv.value)?)),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize>(
    store: &dyn CoordinationStore,
    key: &str,
    value: &T,
    lease_id: Option<i64>,
) -> Result<()> {
    let value = serde_json::to_vec(value)?;
    store.put(key, value, lease_id).await
}

/// Fold a sorted list of keys at the first `separator` after `prefix`.
pub fn fold_keys(prefix: &str, keys: Vec<String>, separator: Option<char>) -> Vec<String> {
    let Some(sep) = separator else {
        return keys;
    };

    let mut folded: Vec<String> = Vec::with_capacity(keys.len());
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let entry = match rest.find(sep) {
            Some(idx) => format!("{prefix}{}", &rest[..idx + sep.len_utf8()]),
            None => key,
        };
        if folded.last() != Some(&entry) {
            folded.push(entry);
        }
    }
    folded
}
