//! Prometheus recorder for the controller's gauges and counters.
//!
//! The core library records through the `metrics` facade. This module
//! installs the global recorder and keeps it compacted; the admin API
//! renders it at `/metrics`.

use std::time::Duration;

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs the prometheus recorder without starting an HTTP server.
pub fn install_recorder() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("failed to install prometheus recorder: {e}"))?;
    describe();
    Ok(handle)
}

fn describe() {
    describe_gauge!("topom_proxies", "registered proxies");
    describe_gauge!("topom_groups", "replica groups");
    describe_gauge!(
        "topom_slot_action_remain",
        "keys left in the slot being migrated"
    );
    describe_gauge!(
        "topom_slot_action_executor",
        "1 while a migration batch is running"
    );
    describe_counter!(
        "topom_slot_actions_completed_total",
        "slot migrations finished"
    );
    describe_counter!(
        "topom_broadcast_failures_total",
        "slot pushes that at least one proxy rejected"
    );
}

/// Spawns the periodic upkeep the recorder needs when installed with
/// `install_recorder`.
pub fn spawn_upkeep(handle: PrometheusHandle) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            handle.run_upkeep();
        }
    });
}
