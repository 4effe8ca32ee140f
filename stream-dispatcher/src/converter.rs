use std::hash::Hasher;

use assignment_coordination::store::KvPair;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use siphasher::sip::SipHasher13;

use crate::error::{Error, Result};
use crate::types::{BalanceElement, DataId, ServiceInfo, WorkerNode};

/// A (source, shadow, owning worker) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowLink {
    pub source: String,
    pub target: String,
    pub service: String,
}

/// Translates between raw store records and balancing identities.
pub trait DispatchConverter: Send + Sync {
    /// Expand an item record into one balancing unit per partition.
    fn element_creator(&self, pair: &KvPair) -> Result<Vec<BalanceElement>>;

    fn node_creator(&self, service: &ServiceInfo) -> Result<WorkerNode>;

    /// Where `element` lives once assigned to `node`.
    fn shadow_creator(&self, node: &WorkerNode, element: &BalanceElement) -> Result<ShadowLink>;

    /// Map a shadow record back to its source and owner.
    fn shadow_detector(&self, shadow: &KvPair) -> Result<ShadowLink>;
}

/// The item config fields the dispatcher cares about. Everything else in
/// the record is opaque and handed to the work unit untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemConfig {
    pub data_id: DataId,
    #[serde(default)]
    pub mq_config: Option<MqConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MqConfig {
    #[serde(default)]
    pub storage_config: Option<serde_json::Map<String, Value>>,
}

impl ItemConfig {
    pub fn parse(pair: &KvPair) -> Result<Self> {
        serde_json::from_slice(&pair.value).map_err(|e| Error::invalid_record(&pair.key, e))
    }

    /// Partition count from `mq_config.storage_config.partition`, which may
    /// be a number or a numeric string. Anything below 1 counts as 1.
    pub fn partitions(&self) -> usize {
        let value = self
            .mq_config
            .as_ref()
            .and_then(|mq| mq.storage_config.as_ref())
            .and_then(|sc| sc.get("partition"));

        let partitions = match value {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse::<i64>().unwrap_or(0),
            _ => 0,
        };
        usize::try_from(partitions).unwrap_or(0).max(1)
    }
}

/// Shadow record payload: a copy of the source record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ShadowValue {
    key: String,
    /// Base64 of the source value bytes.
    value: String,
    version: i64,
}

pub fn encode_shadow(source: &KvPair) -> Result<Vec<u8>> {
    let shadow = ShadowValue {
        key: source.key.clone(),
        value: general_purpose::STANDARD.encode(&source.value),
        version: source.version,
    };
    Ok(serde_json::to_vec(&shadow)?)
}

/// Recover the source record a shadow was copied from.
pub fn decode_shadow(shadow: &KvPair) -> Result<KvPair> {
    let value: ShadowValue =
        serde_json::from_slice(&shadow.value).map_err(|e| Error::invalid_record(&shadow.key, e))?;
    let bytes = general_purpose::STANDARD
        .decode(value.value.as_bytes())
        .map_err(|e| Error::invalid_record(&shadow.key, e))?;
    Ok(KvPair::new(value.key, bytes, value.version))
}

/// Numeric suffix after the last `-` when there is one (`worker-12` -> 12),
/// otherwise a stable hash of the whole name.
pub fn node_id_from_name(name: &str) -> i64 {
    if let Some((_, suffix)) = name.rsplit_once('-') {
        if let Ok(id) = suffix.parse::<i64>() {
            if id >= 0 {
                return id;
            }
        }
    }
    (stable_hash(name.as_bytes()) >> 1) as i64
}

/// Process-independent hash, so every leader computes the same placement.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new();
    hasher.write(bytes);
    hasher.finish()
}

/// Key-path based converter: items live under `source_root`, their shadows
/// under `target_root/<worker>/<suffix of the item key>`.
#[derive(Debug, Clone)]
pub struct PathConverter {
    source_root: String,
    target_root: String,
}

impl PathConverter {
    pub fn new(source_root: impl Into<String>, target_root: impl Into<String>) -> Self {
        Self {
            source_root: source_root.into().trim_end_matches('/').to_string(),
            target_root: target_root.into().trim_end_matches('/').to_string(),
        }
    }
}

impl DispatchConverter for PathConverter {
    fn element_creator(&self, pair: &KvPair) -> Result<Vec<BalanceElement>> {
        let config = ItemConfig::parse(pair)?;
        let element = BalanceElement::new(config.data_id, pair.key.clone());
        Ok(vec![element; config.partitions()])
    }

    fn node_creator(&self, service: &ServiceInfo) -> Result<WorkerNode> {
        if service.id.is_empty() {
            return Err(Error::invalid_record("<service>", "empty service id"));
        }
        Ok(WorkerNode {
            id: node_id_from_name(&service.id),
            name: service.id.clone(),
        })
    }

    fn shadow_creator(&self, node: &WorkerNode, element: &BalanceElement) -> Result<ShadowLink> {
        let suffix = element
            .source
            .strip_prefix(&self.source_root)
            .unwrap_or(&element.source);
        Ok(ShadowLink {
            source: element.source.clone(),
            target: format!("{}/{}{}", self.target_root, node.name, suffix),
            service: node.name.clone(),
        })
    }

    fn shadow_detector(&self, shadow: &KvPair) -> Result<ShadowLink> {
        let path = shadow
            .key
            .strip_prefix(&self.target_root)
            .unwrap_or(&shadow.key);
        let Some((service, rest)) = path.trim_start_matches('/').split_once('/') else {
            return Err(Error::invalid_record(
                &shadow.key,
                "shadow key has no worker segment",
            ));
        };
        Ok(ShadowLink {
            source: format!("{}/{}", self.source_root, rest),
            target: shadow.key.clone(),
            service: service.to_string(),
        })
    }
}
