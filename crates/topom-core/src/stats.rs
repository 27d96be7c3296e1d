//! Server and proxy stats, refreshed in the background.
//!
//! The refreshers copy what they need out of a snapshot and then do all
//! network I/O without holding the controller mutex. Results land in a
//! side table that [`Topom::stats`] merges with the current model.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use serde::Serialize;
use topom_models::{Group, Proxy, Sentinel, SlotMapping};
use tracing::debug;

use crate::config::Config;
use crate::error::TopomError;
use crate::topom::Topom;

/// Deadline for one round of stats collection.
pub const STATS_TIMEOUT: Duration = Duration::from_secs(5);

/// Crate version reported in the overview.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Last `INFO` of one backend server.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    pub stats: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub unixtime: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timeout: bool,
}

/// Last stats document of one proxy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProxyStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub unixtime: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timeout: bool,
}

#[derive(Debug, Default)]
pub(crate) struct StatsTable {
    servers: HashMap<String, ServerStats>,
    proxies: HashMap<String, ProxyStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupTable {
    pub models: Vec<Group>,
    pub stats: BTreeMap<String, ServerStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyTable {
    pub models: Vec<Proxy>,
    pub stats: BTreeMap<String, ProxyStats>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SlotActionProgress {
    pub remain: u64,
    pub failed: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SlotActionStats {
    pub interval: u64,
    pub disabled: bool,
    pub progress: SlotActionProgress,
    pub executor: bool,
}

/// Everything the dashboard shows about a product.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub closed: bool,
    pub slots: Vec<SlotMapping>,
    pub group: GroupTable,
    pub proxy: ProxyTable,
    pub sentinel: Sentinel,
    pub slot_action: SlotActionStats,
    /// Group masters as the sentinels see them.
    pub masters: BTreeMap<u16, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub version: String,
    pub compile: String,
    pub config: Config,
    pub model: topom_models::Topom,
    pub stats: Stats,
}

impl Topom {
    /// Current model merged with the last collected stats.
    pub async fn stats(&self) -> Result<Stats, TopomError> {
        use std::sync::atomic::Ordering;

        let ctx = self.snapshot().await?;
        let mut groups: Vec<Group> = ctx.groups.into_values().collect();
        groups.sort_by_key(|g| g.id);
        let mut proxies: Vec<Proxy> = ctx.proxies.into_values().collect();
        proxies.sort_by_key(|p| p.id);

        let (server_stats, proxy_stats) = {
            let table = self.stats_table();
            let servers = groups
                .iter()
                .flat_map(|g| &g.servers)
                .filter_map(|s| table.servers.get(&s.addr).map(|st| (s.addr.clone(), st.clone())))
                .collect();
            let proxies = proxies
                .iter()
                .filter_map(|p| table.proxies.get(&p.token).map(|st| (p.token.clone(), st.clone())))
                .collect();
            (servers, proxies)
        };

        Ok(Stats {
            closed: self.is_closed(),
            slots: ctx.slots,
            group: GroupTable {
                models: groups,
                stats: server_stats,
            },
            proxy: ProxyTable {
                models: proxies,
                stats: proxy_stats,
            },
            sentinel: ctx.sentinel,
            slot_action: SlotActionStats {
                interval: self.slot_action_interval(),
                disabled: self.slot_action_disabled(),
                progress: SlotActionProgress {
                    remain: self.action.remain.load(Ordering::Relaxed),
                    failed: self.action.failed.load(Ordering::Relaxed),
                },
                executor: self.action.executor.load(Ordering::Relaxed),
            },
            masters: self.sentinel_masters(),
        })
    }

    pub async fn overview(&self) -> Result<Overview, TopomError> {
        Ok(Overview {
            version: VERSION.to_owned(),
            compile: format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
            config: self.config.clone(),
            model: self.model.clone(),
            stats: self.stats().await?,
        })
    }

    /// Collects `INFO` from every group server.
    pub(crate) async fn refresh_server_stats(&self) -> Result<(), TopomError> {
        let ctx = self.snapshot().await?;
        metrics::gauge!("topom_groups").set(ctx.groups.len() as f64);
        let addrs: Vec<String> = ctx
            .groups
            .values()
            .flat_map(|g| g.servers.iter().map(|s| s.addr.clone()))
            .collect();

        let results = join_all(addrs.into_iter().map(|addr| async move {
            let mut st = ServerStats {
                unixtime: unix_now(),
                ..Default::default()
            };
            match tokio::time::timeout(STATS_TIMEOUT, self.pool.info(&addr)).await {
                Ok(Ok(info)) => st.stats = info,
                Ok(Err(e)) => {
                    debug!("server-[{addr}] stats failed: {e}");
                    st.error = Some(e.to_string());
                }
                Err(_) => st.timeout = true,
            }
            (addr, st)
        }))
        .await;

        self.stats_table().servers = results.into_iter().collect();
        Ok(())
    }

    /// Collects the stats document of every proxy.
    pub(crate) async fn refresh_proxy_stats(&self) -> Result<(), TopomError> {
        let ctx = self.snapshot().await?;
        metrics::gauge!("topom_proxies").set(ctx.proxies.len() as f64);

        let results = join_all(ctx.proxies.values().map(|p| async move {
            let mut st = ProxyStats {
                unixtime: unix_now(),
                ..Default::default()
            };
            match tokio::time::timeout(STATS_TIMEOUT, self.proxy_client(p).stats()).await {
                Ok(Ok(stats)) => st.stats = Some(stats),
                Ok(Err(e)) => {
                    debug!(token = %p.token, "proxy-[{}] stats failed: {e}", p.token);
                    st.error = Some(e.to_string());
                }
                Err(_) => st.timeout = true,
            }
            (p.token.clone(), st)
        }))
        .await;

        self.stats_table().proxies = results.into_iter().collect();
        Ok(())
    }

    fn stats_table(&self) -> std::sync::MutexGuard<'_, StatsTable> {
        self.stats
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
