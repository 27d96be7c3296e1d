//! Runtime settings the controller needs.
//!
//! The binary owns file and flag parsing and hands the resolved values
//! over as a [`Config`].

use std::time::Duration;

use serde::Serialize;

/// Resolved controller settings.
///
/// Serializes without `product_auth`, which never leaves the process.
#[derive(Clone, Serialize)]
pub struct Config {
    pub admin_addr: String,
    pub product_name: String,
    #[serde(skip)]
    pub product_auth: String,

    pub migration_timeout_ms: u64,
    pub backend_pool_timeout_secs: u64,
    pub backend_rpc_timeout_ms: u64,
    pub proxy_rpc_timeout_ms: u64,

    pub slot_action_interval_ms: u64,
    pub slot_action_disabled: bool,

    pub sentinel_client_timeout_ms: u64,
    pub sentinel_quorum: u32,
    pub sentinel_parallel_syncs: u32,
    pub sentinel_down_after_ms: u64,
    pub sentinel_failover_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            admin_addr: "0.0.0.0:18080".into(),
            product_name: "codis-demo".into(),
            product_auth: String::new(),
            migration_timeout_ms: 30_000,
            backend_pool_timeout_secs: 1800,
            backend_rpc_timeout_ms: 10_000,
            proxy_rpc_timeout_ms: 10_000,
            slot_action_interval_ms: 0,
            slot_action_disabled: false,
            sentinel_client_timeout_ms: 10_000,
            sentinel_quorum: 2,
            sentinel_parallel_syncs: 1,
            sentinel_down_after_ms: 30_000,
            sentinel_failover_timeout_ms: 300_000,
        }
    }
}

impl Config {
    pub fn migration_timeout(&self) -> Duration {
        Duration::from_millis(self.migration_timeout_ms)
    }

    pub fn backend_pool_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_pool_timeout_secs)
    }

    pub fn backend_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_rpc_timeout_ms)
    }

    pub fn proxy_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_rpc_timeout_ms)
    }

    pub fn sentinel_client_timeout(&self) -> Duration {
        Duration::from_millis(self.sentinel_client_timeout_ms)
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("admin_addr", &self.admin_addr)
            .field("product_name", &self.product_name)
            .field("product_auth", &"[redacted]")
            .field("migration_timeout_ms", &self.migration_timeout_ms)
            .field("slot_action_interval_ms", &self.slot_action_interval_ms)
            .field("slot_action_disabled", &self.slot_action_disabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_is_never_rendered() {
        let cfg = Config {
            product_auth: "hunter2".into(),
            ..Default::default()
        };
        assert!(!format!("{cfg:?}").contains("hunter2"));
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("product_auth"));
        assert!(json.contains("\"product_name\":\"codis-demo\""));
    }

    #[test]
    fn durations() {
        let cfg = Config::default();
        assert_eq!(cfg.migration_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.backend_pool_timeout(), Duration::from_secs(1800));
    }
}
