use std::time::Duration;

use assignment_coordination::util::{now_seconds, validate_identifier};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::store::DispatchStore;
use crate::types::{ServiceInfo, ServiceStatus};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub name: String,
    pub address: String,
    pub lease_ttl: i64,
    pub keepalive_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: "worker-0".to_string(),
            address: "127.0.0.1:0".to_string(),
            lease_ttl: 30,
            keepalive_interval: Duration::from_secs(10),
        }
    }
}

/// Keeps this process listed as a worker for as long as it runs.
pub struct WorkerRegistry {
    store: DispatchStore,
    config: RegistryConfig,
}

impl WorkerRegistry {
    pub fn new(store: DispatchStore, config: RegistryConfig) -> Self {
        Self { store, config }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Register as `Ready` and hold the lease until cancelled. On shutdown
    /// the record flips to `Draining` before the lease is revoked.
    ///
    /// Returns `Error::Store(LeadershipLost)` if the lease expires under us.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        validate_identifier(&self.config.name)?;

        let lease_id = self.store.backend().grant_lease(self.config.lease_ttl).await?;
        let mut info = ServiceInfo {
            id: self.config.name.clone(),
            address: self.config.address.clone(),
            status: ServiceStatus::Ready,
            registered_at: now_seconds(),
        };
        self.store.register_service(&info, lease_id).await?;
        tracing::info!(service = %info.id, address = %info.address, lease_id, "worker registered");

        let result = self
            .store
            .backend()
            .keep_alive(lease_id, self.config.keepalive_interval, cancel.clone())
            .await;

        if let Err(e) = &result {
            tracing::error!(service = %info.id, error = %e, "worker lease lost");
            return result.map_err(Into::into);
        }

        info.status = ServiceStatus::Draining;
        if let Err(e) = self.store.register_service(&info, lease_id).await {
            tracing::warn!(service = %info.id, error = %e, "failed to mark worker draining");
        }
        drop(self.store.backend().revoke_lease(lease_id).await);
        tracing::info!(service = %info.id, "worker unregistered");
        Ok(())
    }
}
