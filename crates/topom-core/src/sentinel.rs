//! Sentinel set management and the switch-master watch.
//!
//! Sentinels only observe here: the masters they report are recorded for
//! operators and stats, and promotions stay an explicit admin action.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, info, warn};

use crate::error::{precondition, TopomError};
use crate::sentinel_client::MonitorConfig;
use crate::topom::Topom;

/// How long one subscription waits for `+switch-master`.
const SUBSCRIBE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Delay before subscribing again after a failed subscription.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(10);

impl Topom {
    /// Adds sentinel `addr` after checking it answers.
    pub async fn add_sentinel(&self, addr: &str) -> Result<(), TopomError> {
        if addr.is_empty() {
            return precondition!("invalid sentinel address");
        }
        let (mut cache, ctx) = self.begin().await?;
        let mut s = ctx.sentinel;
        if s.servers.iter().any(|x| x == addr) {
            return precondition!("sentinel-[{addr}] already exists");
        }
        self.sentinel
            .flush_config(addr, self.config.sentinel_client_timeout())
            .await?;
        s.servers.push(addr.to_owned());
        s.out_of_resync = true;
        cache.update_sentinel(&s).await?;
        cache.dirty_sentinel();
        Ok(())
    }

    /// Removes sentinel `addr`, first making it forget this product's
    /// groups. A sentinel that can't be reached is only dropped when
    /// `force` is set.
    pub async fn del_sentinel(&self, addr: &str, force: bool) -> Result<(), TopomError> {
        if addr.is_empty() {
            return precondition!("invalid sentinel address");
        }
        let (mut cache, ctx) = self.begin().await?;
        let mut s = ctx.sentinel;
        let Some(pos) = s.servers.iter().position(|x| x == addr) else {
            return Err(TopomError::NotFound(format!("sentinel-[{addr}] doesn't exist")));
        };

        s.out_of_resync = true;
        cache.update_sentinel(&s).await?;
        cache.dirty_sentinel();

        let removed = self
            .sentinel
            .remove_groups_all(&[addr.to_owned()], self.config.sentinel_client_timeout())
            .await;
        if let Err(e) = removed {
            warn!(force, "remove sentinel {addr} failed: {e}");
            if !force {
                return Err(e.into());
            }
        }

        s.servers.remove(pos);
        cache.update_sentinel(&s).await?;
        cache.dirty_sentinel();
        Ok(())
    }

    /// Re-registers every group master with every sentinel, restarts the
    /// switch-master watch and pushes the sentinel set to every proxy.
    ///
    /// `out_of_resync` stays set until all of that succeeded.
    pub async fn resync_sentinels(self: &Arc<Self>) -> Result<(), TopomError> {
        let (mut cache, ctx) = self.begin().await?;
        let mut s = ctx.sentinel.clone();
        s.out_of_resync = true;
        cache.update_sentinel(&s).await?;
        cache.dirty_sentinel();

        let timeout = self.config.sentinel_client_timeout();
        if let Err(e) = self.sentinel.remove_groups_all(&s.servers, timeout).await {
            warn!("remove sentinels failed: {e}");
        }
        let monitor = MonitorConfig {
            quorum: self.config.sentinel_quorum,
            parallel_syncs: self.config.sentinel_parallel_syncs,
            down_after: Duration::from_millis(self.config.sentinel_down_after_ms),
            failover_timeout: Duration::from_millis(self.config.sentinel_failover_timeout_ms),
        };
        self.sentinel
            .monitor_groups(&s.servers, timeout, &monitor, &ctx.group_masters())
            .await
            .inspect_err(|e| warn!("resync sentinels failed: {e}"))?;

        self.rewatch_sentinels(s.servers.clone());

        let pushes = ctx.proxies.values().map(|p| {
            let s = &s;
            async move { (p, self.proxy_client(p).set_sentinels(s).await) }
        });
        let mut failed = Vec::new();
        for (p, result) in join_all(pushes).await {
            if let Err(e) = result {
                error!(token = %p.token, "proxy-[{}] resync sentinel failed: {e}", p.token);
                failed.push(format!("proxy-[{}]", p.token));
            }
        }
        if !failed.is_empty() {
            failed.sort();
            return Err(TopomError::Broadcast(format!(
                "{} sentinel failed",
                failed.join(", ")
            )));
        }

        s.out_of_resync = false;
        cache.update_sentinel(&s).await?;
        cache.dirty_sentinel();
        Ok(())
    }

    /// Group masters as last reported by the sentinels.
    pub fn sentinel_masters(&self) -> BTreeMap<u16, String> {
        self.ha_state().masters.clone()
    }

    /// Replaces the switch-master watch with one over `servers`.
    pub(crate) fn rewatch_sentinels(self: &Arc<Self>, servers: Vec<String>) {
        let mut ha = self.ha_state();
        if let Some(monitor) = ha.monitor.take() {
            monitor.abort();
        }
        if servers.is_empty() || self.is_closed() {
            ha.masters.clear();
        } else {
            let task = tokio::spawn(watch_sentinels(Arc::downgrade(self), servers.clone()));
            ha.monitor = Some(task);
        }
        warn!("rewatch sentinels = {servers:?}");
    }
}

async fn watch_sentinels(topom: Weak<Topom>, servers: Vec<String>) {
    loop {
        let Some(t) = topom.upgrade() else {
            return;
        };
        if t.is_closed() {
            return;
        }
        let client = t.sentinel.clone();
        let timeout = t.config.sentinel_client_timeout();
        let mut shutdown = t.shutdown_signal();
        drop(t);

        match client.masters(&servers, timeout).await {
            Ok(masters) => {
                if let Some(t) = topom.upgrade() {
                    info!(groups = masters.len(), "sentinel masters updated");
                    t.ha_state().masters = masters;
                }
            }
            Err(e) => warn!("fetch group masters failed: {e}"),
        }

        let notified = tokio::select! {
            notified = client.subscribe(&servers, SUBSCRIBE_WINDOW) => notified,
            _ = shutdown.wait_for(|closed| *closed) => return,
        };
        if !notified {
            tokio::select! {
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                _ = shutdown.wait_for(|closed| *closed) => return,
            }
        }
    }
}
