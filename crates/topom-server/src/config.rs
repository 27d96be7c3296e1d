//! TOML configuration for the daemon.
//!
//! Resolution order is defaults, then the TOML file, then env vars and
//! CLI flags (see `apply_args` in `main.rs`).

use std::path::Path;

use serde::{Deserialize, Serialize};
use topom_core::Config;

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopomConfig {
    /// `memory` or `filesystem`.
    pub coordinator_name: String,
    /// Root directory of the filesystem coordinator.
    pub coordinator_addr: String,

    pub admin_addr: String,
    pub product_name: String,
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

    /// Serve `/metrics` on the admin listener.
    pub metrics_enabled: bool,
}

impl Default for TopomConfig {
    fn default() -> Self {
        let core = Config::default();
        TopomConfig {
            coordinator_name: "filesystem".into(),
            coordinator_addr: "/tmp/codis".into(),
            admin_addr: core.admin_addr,
            product_name: core.product_name,
            product_auth: core.product_auth,
            migration_timeout_ms: core.migration_timeout_ms,
            backend_pool_timeout_secs: core.backend_pool_timeout_secs,
            backend_rpc_timeout_ms: core.backend_rpc_timeout_ms,
            proxy_rpc_timeout_ms: core.proxy_rpc_timeout_ms,
            slot_action_interval_ms: core.slot_action_interval_ms,
            slot_action_disabled: core.slot_action_disabled,
            sentinel_client_timeout_ms: core.sentinel_client_timeout_ms,
            sentinel_quorum: core.sentinel_quorum,
            sentinel_parallel_syncs: core.sentinel_parallel_syncs,
            sentinel_down_after_ms: core.sentinel_down_after_ms,
            sentinel_failover_timeout_ms: core.sentinel_failover_timeout_ms,
            metrics_enabled: true,
        }
    }
}

impl TopomConfig {
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config '{}': {e}", path.display()))?;
        Self::from_toml(&text)
            .map_err(|e| format!("invalid config '{}': {e}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Checks what the controller itself would only catch later.
    pub fn validate(&self) -> Result<(), String> {
        if !topom_models::is_valid_product(&self.product_name) {
            return Err(format!("invalid product name '{}'", self.product_name));
        }
        if self.admin_addr.is_empty() {
            return Err("admin_addr must not be empty".into());
        }
        match self.coordinator_name.as_str() {
            "memory" | "filesystem" | "fs" => Ok(()),
            other => Err(format!("invalid coordinator name '{other}'")),
        }
    }

    /// The settings the controller library needs.
    pub fn to_core(&self) -> Config {
        Config {
            admin_addr: self.admin_addr.clone(),
            product_name: self.product_name.clone(),
            product_auth: self.product_auth.clone(),
            migration_timeout_ms: self.migration_timeout_ms,
            backend_pool_timeout_secs: self.backend_pool_timeout_secs,
            backend_rpc_timeout_ms: self.backend_rpc_timeout_ms,
            proxy_rpc_timeout_ms: self.proxy_rpc_timeout_ms,
            slot_action_interval_ms: self.slot_action_interval_ms,
            slot_action_disabled: self.slot_action_disabled,
            sentinel_client_timeout_ms: self.sentinel_client_timeout_ms,
            sentinel_quorum: self.sentinel_quorum,
            sentinel_parallel_syncs: self.sentinel_parallel_syncs,
            sentinel_down_after_ms: self.sentinel_down_after_ms,
            sentinel_failover_timeout_ms: self.sentinel_failover_timeout_ms,
        }
    }
}

impl std::fmt::Debug for TopomConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopomConfig")
            .field("coordinator_name", &self.coordinator_name)
            .field("coordinator_addr", &self.coordinator_addr)
            .field("admin_addr", &self.admin_addr)
            .field("product_name", &self.product_name)
            .field("product_auth", &"[redacted]")
            .finish_non_exhaustive()
    }
}
