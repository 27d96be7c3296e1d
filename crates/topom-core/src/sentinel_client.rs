//! Client for the sentinels watching a product's group masters.
//!
//! Each group is registered with sentinels under `<product>-NNNN`. Every
//! operation fans out to all sentinels concurrently and is bounded by a
//! single deadline.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use topom_protocol::Frame;
use tracing::{info, warn};

use crate::redis::{split_host_port, RedisClient, RedisError};

/// Errors from sentinel operations.
#[derive(Debug, thiserror::Error)]
pub enum SentinelError {
    #[error("sentinel-[{addr}]: {source}")]
    Redis {
        addr: String,
        #[source]
        source: RedisError,
    },

    #[error("sentinel-[{0}] timed out")]
    Timeout(String),

    /// Fewer than a majority of sentinels answered.
    #[error("lost majority ({voted}/{total})")]
    LostMajority { voted: usize, total: usize },

    #[error("invalid master address '{0}'")]
    InvalidMaster(String),
}

/// Monitoring parameters pushed with `SENTINEL SET`.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub quorum: u32,
    pub parallel_syncs: u32,
    pub down_after: Duration,
    pub failover_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SentinelClient {
    product: String,
    auth: String,
}

/// A master as one sentinel reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reported {
    addr: String,
    epoch: i64,
}

impl SentinelClient {
    pub fn new(product: &str, auth: &str) -> Self {
        SentinelClient {
            product: product.to_owned(),
            auth: auth.to_owned(),
        }
    }

    /// Name under which group `gid` is monitored.
    pub fn node_name(&self, gid: u16) -> String {
        format!("{}-{gid:04}", self.product)
    }

    /// Group id for a monitored name of this product.
    pub fn group_of(&self, name: &str) -> Option<u16> {
        let rest = name.strip_prefix(&self.product)?.strip_prefix('-')?;
        rest.parse().ok().filter(|&gid| gid != 0)
    }

    async fn with_client<T, F>(&self, addr: &str, timeout: Duration, f: F) -> Result<T, SentinelError>
    where
        F: for<'c> FnOnce(&'c mut RedisClient) -> futures::future::BoxFuture<'c, Result<T, RedisError>>,
    {
        let work = async {
            let mut c = RedisClient::connect(addr, "", timeout).await?;
            f(&mut c).await
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(source)) => Err(SentinelError::Redis {
                addr: addr.to_owned(),
                source,
            }),
            Err(_) => Err(SentinelError::Timeout(addr.to_owned())),
        }
    }

    /// `SENTINEL MASTERS` on one sentinel, filtered to this product.
    async fn masters_of(
        &self,
        addr: &str,
        timeout: Duration,
    ) -> Result<HashMap<u16, Reported>, SentinelError> {
        let rows = self
            .with_client(addr, timeout, |c| {
                Box::pin(async move { c.call(&["SENTINEL", "masters"]).await })
            })
            .await?;
        let mut masters = HashMap::new();
        for row in rows.into_array().unwrap_or_default() {
            let fields = string_map(row);
            let Some(gid) = fields.get("name").and_then(|n| self.group_of(n)) else {
                continue;
            };
            let ip = fields.get("ip").map(String::as_str).unwrap_or("");
            let port = fields.get("port").map(String::as_str).unwrap_or("");
            let epoch = fields.get("config-epoch").and_then(|e| e.parse().ok());
            match epoch {
                Some(epoch) if !ip.is_empty() && !port.is_empty() => {
                    masters.insert(
                        gid,
                        Reported {
                            addr: format!("{ip}:{port}"),
                            epoch,
                        },
                    );
                }
                _ => warn!(sentinel = addr, gid, "sentinel masters row is incomplete"),
            }
        }
        Ok(masters)
    }

    /// Group masters agreed on by a majority of `sentinels`.
    ///
    /// Where sentinels disagree, the report with the highest config
    /// epoch wins.
    pub async fn masters(
        &self,
        sentinels: &[String],
        timeout: Duration,
    ) -> Result<BTreeMap<u16, String>, SentinelError> {
        let results = join_all(sentinels.iter().map(|s| self.masters_of(s, timeout))).await;
        let majority = 1 + sentinels.len() / 2;
        let mut voted = 0;
        let mut current: HashMap<u16, Reported> = HashMap::new();
        for (addr, result) in sentinels.iter().zip(results) {
            match result {
                Ok(reported) => {
                    voted += 1;
                    for (gid, m) in reported {
                        match current.get(&gid) {
                            Some(prev) if prev.epoch >= m.epoch => {}
                            _ => {
                                current.insert(gid, m);
                            }
                        }
                    }
                }
                Err(e) => warn!(sentinel = %addr, "sentinel masters failed: {e}"),
            }
        }
        if voted < majority {
            return Err(SentinelError::LostMajority {
                voted,
                total: sentinels.len(),
            });
        }
        Ok(current.into_iter().map(|(gid, m)| (gid, m.addr)).collect())
    }

    /// Replaces this product's monitored set on every sentinel with
    /// `masters`. Any failure aborts.
    pub async fn monitor_groups(
        &self,
        sentinels: &[String],
        timeout: Duration,
        config: &MonitorConfig,
        masters: &BTreeMap<u16, String>,
    ) -> Result<(), SentinelError> {
        for addr in masters.values() {
            split_host_port(addr).map_err(|_| SentinelError::InvalidMaster(addr.clone()))?;
        }
        let results = join_all(
            sentinels
                .iter()
                .map(|s| self.monitor_one(s, timeout, config, masters)),
        )
        .await;
        results.into_iter().collect()
    }

    async fn monitor_one(
        &self,
        addr: &str,
        timeout: Duration,
        config: &MonitorConfig,
        masters: &BTreeMap<u16, String>,
    ) -> Result<(), SentinelError> {
        self.remove_all_one(addr, timeout).await?;
        let mut commands = Vec::with_capacity(masters.len() * 2);
        for (&gid, master) in masters {
            let Ok((ip, port)) = split_host_port(master) else {
                continue;
            };
            let name = self.node_name(gid);
            commands.push(vec![
                "SENTINEL".to_owned(),
                "monitor".to_owned(),
                name.clone(),
                ip.to_owned(),
                port.to_string(),
                config.quorum.to_string(),
            ]);
            let mut set = vec!["SENTINEL".to_owned(), "set".to_owned(), name];
            if config.parallel_syncs != 0 {
                set.extend(["parallel-syncs".to_owned(), config.parallel_syncs.to_string()]);
            }
            if !config.down_after.is_zero() {
                set.extend([
                    "down-after-milliseconds".to_owned(),
                    config.down_after.as_millis().to_string(),
                ]);
            }
            if !config.failover_timeout.is_zero() {
                set.extend([
                    "failover-timeout".to_owned(),
                    config.failover_timeout.as_millis().to_string(),
                ]);
            }
            if !self.auth.is_empty() {
                set.extend(["auth-pass".to_owned(), self.auth.clone()]);
            }
            commands.push(set);
        }
        self.with_client(addr, timeout, move |c| {
            Box::pin(async move {
                for cmd in &commands {
                    let parts: Vec<&str> = cmd.iter().map(String::as_str).collect();
                    c.call(&parts).await?;
                }
                Ok(())
            })
        })
        .await?;
        info!(sentinel = addr, groups = masters.len(), "sentinel monitor groups done");
        Ok(())
    }

    /// Stops monitoring every group of this product on one sentinel.
    async fn remove_all_one(&self, addr: &str, timeout: Duration) -> Result<(), SentinelError> {
        let names: Vec<String> = self
            .masters_of(addr, timeout)
            .await?
            .into_keys()
            .map(|gid| self.node_name(gid))
            .collect();
        self.with_client(addr, timeout, move |c| {
            Box::pin(async move {
                for name in &names {
                    match c.call(&["SENTINEL", "remove", name]).await {
                        Ok(_) => {}
                        Err(RedisError::Server(msg)) if msg.contains("No such master") => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            })
        })
        .await
    }

    /// Removes every group of this product from each of `sentinels`.
    pub async fn remove_groups_all(
        &self,
        sentinels: &[String],
        timeout: Duration,
    ) -> Result<(), SentinelError> {
        let results = join_all(sentinels.iter().map(|s| self.remove_all_one(s, timeout))).await;
        results.into_iter().collect()
    }

    /// `SENTINEL FLUSHCONFIG`, used as a liveness probe.
    pub async fn flush_config(&self, addr: &str, timeout: Duration) -> Result<(), SentinelError> {
        self.with_client(addr, timeout, |c| {
            Box::pin(async move {
                c.call(&["SENTINEL", "flushconfig"]).await?;
                Ok(())
            })
        })
        .await
    }

    /// Subscribes to `+switch-master` on every sentinel and waits until
    /// one reports a switch for this product, or `expires` passes.
    ///
    /// Returns `true` on a matching event.
    pub async fn subscribe(&self, sentinels: &[String], expires: Duration) -> bool {
        let mut pending: FuturesUnordered<_> = sentinels
            .iter()
            .map(|addr| async move {
                let result = self.subscribe_one(addr).await;
                if let Err(e) = &result {
                    warn!(sentinel = %addr, "sentinel subscribe failed: {e}");
                }
                result.is_ok()
            })
            .collect();

        let majority = 1 + sentinels.len() / 2;
        let wait = async {
            let mut alive = sentinels.len();
            while let Some(notified) = pending.next().await {
                if notified {
                    info!("sentinel subscribe notified +switch-master");
                    return true;
                }
                alive -= 1;
                if alive < majority {
                    warn!("sentinel subscribe lost majority ({alive}/{})", sentinels.len());
                    return false;
                }
            }
            false
        };
        tokio::time::timeout(expires, wait).await.unwrap_or(false)
    }

    async fn subscribe_one(&self, addr: &str) -> Result<(), RedisError> {
        let mut c = RedisClient::connect(addr, "", Duration::from_secs(5)).await?;
        let ack = c.call(&["SUBSCRIBE", "+switch-master"]).await?;
        let ok = matches!(
            ack.clone().into_array().as_deref(),
            Some([kind, ..]) if kind.as_str() == Some("subscribe")
        );
        if !ok {
            return Err(RedisError::Unexpected {
                cmd: "SUBSCRIBE".into(),
                reply: format!("{ack:?}"),
            });
        }
        loop {
            let frame = c.read_frame().await?;
            let Some(items) = frame.into_array() else {
                continue;
            };
            let text: Vec<&str> = items.iter().filter_map(Frame::as_str).collect();
            if let ["message", "+switch-master", payload] = text.as_slice() {
                info!(sentinel = addr, "sentinel event +switch-master {payload}");
                let name = payload.split(' ').next().unwrap_or("");
                if self.group_of(name).is_some() {
                    return Ok(());
                }
            }
        }
    }
}

/// Flattens a RESP2 `[k, v, k, v, ...]` array or a RESP3 map into
/// string pairs.
fn string_map(frame: Frame) -> HashMap<String, String> {
    let mut out = HashMap::new();
    match frame {
        Frame::Array(items) => {
            for pair in items.chunks(2) {
                if let [k, v] = pair {
                    if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                        out.insert(k.to_owned(), v.to_owned());
                    }
                }
            }
        }
        Frame::Map(pairs) => {
            for (k, v) in pairs {
                if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                    out.insert(k.to_owned(), v.to_owned());
                }
            }
        }
        _ => {}
    }
    out
}
