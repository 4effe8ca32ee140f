use std::time::Duration;

use envconfig::Envconfig;

use crate::dispatcher::DispatcherConfig;
use crate::store::KeyLayout;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // ── Coordination store ──────────────────────────────────────────
    #[envconfig(default = "http://localhost:2379")]
    pub etcd_endpoints: String,

    #[envconfig(default = "")]
    pub etcd_prefix: String,

    /// `etcd` or `memory`. The memory backend only makes sense for a single
    /// local process.
    #[envconfig(default = "etcd")]
    pub store_backend: String,

    // ── This worker ─────────────────────────────────────────────────
    #[envconfig(default = "dispatcher-0")]
    pub service_name: String,

    #[envconfig(default = "127.0.0.1:9102")]
    pub service_address: String,

    // ── Key roots ───────────────────────────────────────────────────
    #[envconfig(default = "/stream-dispatcher/items")]
    pub items_root: String,

    #[envconfig(default = "/stream-dispatcher/shadows")]
    pub shadows_root: String,

    #[envconfig(default = "/stream-dispatcher/services")]
    pub services_root: String,

    #[envconfig(default = "/stream-dispatcher/manual")]
    pub manual_root: String,

    #[envconfig(default = "/stream-dispatcher/flow")]
    pub flow_root: String,

    #[envconfig(default = "/stream-dispatcher/leader")]
    pub leader_key: String,

    #[envconfig(default = "/stream-dispatcher/schedule/balance_conf")]
    pub balance_config_key: String,

    // ── Leases / leader election ────────────────────────────────────
    #[envconfig(default = "30")]
    pub service_lease_ttl_secs: i64,

    #[envconfig(default = "10")]
    pub service_keepalive_interval_secs: u64,

    #[envconfig(default = "15")]
    pub leader_lease_ttl_secs: i64,

    #[envconfig(default = "5")]
    pub leader_keepalive_interval_secs: u64,

    #[envconfig(default = "5")]
    pub election_retry_interval_secs: u64,

    // ── Dispatcher ──────────────────────────────────────────────────
    #[envconfig(default = "3000")]
    pub dispatch_delay_ms: u64,

    #[envconfig(default = "300")]
    pub recover_interval_secs: u64,

    #[envconfig(default = "60")]
    pub trigger_period_secs: u64,

    #[envconfig(default = "16")]
    pub dispatch_concurrency: usize,

    #[envconfig(default = "60")]
    pub balance_sync_interval_secs: u64,

    #[envconfig(default = "5")]
    pub watch_retry_interval_secs: u64,

    // ── Scheduler ───────────────────────────────────────────────────
    #[envconfig(default = "10")]
    pub scheduler_check_interval_secs: u64,

    #[envconfig(default = "60")]
    pub scheduler_flow_interval_secs: u64,

    #[envconfig(default = "5")]
    pub scheduler_cleanup_interval_secs: u64,

    #[envconfig(default = "30")]
    pub unit_stop_timeout_secs: u64,

    #[envconfig(default = "30")]
    pub unit_wait_timeout_secs: u64,

    #[envconfig(default = "true")]
    pub flow_record_enabled: bool,

    // ── HTTP ────────────────────────────────────────────────────────
    #[envconfig(default = "9102")]
    pub metrics_port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn etcd_endpoint_list(&self) -> Vec<String> {
        self.etcd_endpoints
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn key_layout(&self) -> KeyLayout {
        KeyLayout {
            items_root: self.items_root.clone(),
            shadows_root: self.shadows_root.clone(),
            services_root: self.services_root.clone(),
            manual_root: self.manual_root.clone(),
            flow_root: self.flow_root.clone(),
            leader_key: self.leader_key.clone(),
            balance_config_key: self.balance_config_key.clone(),
        }
    }

    pub fn service_keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.service_keepalive_interval_secs)
    }

    pub fn leader_keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.leader_keepalive_interval_secs)
    }

    pub fn election_retry_interval(&self) -> Duration {
        Duration::from_secs(self.election_retry_interval_secs)
    }

    pub fn dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch_delay_ms)
    }

    pub fn recover_interval(&self) -> Duration {
        Duration::from_secs(self.recover_interval_secs)
    }

    pub fn trigger_period(&self) -> Duration {
        Duration::from_secs(self.trigger_period_secs)
    }

    pub fn balance_sync_interval(&self) -> Duration {
        Duration::from_secs(self.balance_sync_interval_secs)
    }

    pub fn watch_retry_interval(&self) -> Duration {
        Duration::from_secs(self.watch_retry_interval_secs)
    }

    pub fn scheduler_check_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_check_interval_secs)
    }

    pub fn scheduler_flow_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_flow_interval_secs)
    }

    pub fn scheduler_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_cleanup_interval_secs)
    }

    pub fn unit_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_stop_timeout_secs)
    }

    pub fn unit_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_wait_timeout_secs)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            dispatch_delay: self.dispatch_delay(),
            recover_interval: self.recover_interval(),
            trigger_period: self.trigger_period(),
            concurrency: self.dispatch_concurrency.max(1),
            watch_retry_interval: self.watch_retry_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses() {
        let config = Config::init_with_defaults().expect("default config should parse");
        assert_eq!(config.store_backend, "etcd");
        assert_eq!(config.dispatch_concurrency, 16);
        assert_eq!(config.service_lease_ttl_secs, 30);
        assert_eq!(config.leader_lease_ttl_secs, 15);
        assert_eq!(config.dispatch_delay(), Duration::from_secs(3));
        assert!(config.flow_record_enabled);
    }

    #[test]
    fn etcd_endpoint_list_splits_comma_separated() {
        let mut config = Config::init_with_defaults().unwrap();
        config.etcd_endpoints = "http://a:2379, http://b:2379".to_string();
        assert_eq!(
            config.etcd_endpoint_list(),
            vec!["http://a:2379", "http://b:2379"]
        );
    }

    #[test]
    fn key_layout_carries_every_root() {
        let config = Config::init_with_defaults().unwrap();
        let layout = config.key_layout();
        assert_eq!(layout.items_root, "/stream-dispatcher/items");
        assert_eq!(layout.shadows_root, "/stream-dispatcher/shadows");
        assert_eq!(
            layout.balance_config_key,
            "/stream-dispatcher/schedule/balance_conf"
        );
    }
}
