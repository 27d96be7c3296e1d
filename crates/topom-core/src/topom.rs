//! The controller.
//!
//! [`Topom`] owns the store, the cache, the backend pool and the proxy
//! RPC client. Every public mutation takes the controller mutex, builds a
//! fresh [`Context`] from the cache, validates against it, writes the
//! store, marks the touched entries dirty and, when routing changed,
//! pushes new slot views to every proxy before releasing the mutex.
//!
//! The operations themselves live next to their subject: `slots.rs`,
//! `group.rs`, `proxy.rs`, `sync.rs` and `sentinel.rs`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use tokio::sync::{watch, MutexGuard};
use tokio::task::JoinHandle;
use topom_models::{is_valid_product, Client, Proxy, Signal, Slot, Store};
use tracing::{error, info, warn};

use crate::cache::Cache;
use crate::config::Config;
use crate::context::Context;
use crate::error::TopomError;
use crate::proxy_client::ProxyClient;
use crate::redis::RedisPool;
use crate::sentinel_client::SentinelClient;
use crate::stats::StatsTable;
use crate::xauth::ProductSecret;

/// Largest accepted slot action interval, in milliseconds.
pub const MAX_SLOT_ACTION_INTERVAL_MS: u64 = 1_000_000;

/// Runtime knobs and progress of the slot action engine.
#[derive(Debug, Default)]
pub(crate) struct ActionControl {
    pub(crate) interval_ms: AtomicU64,
    pub(crate) disabled: AtomicBool,
    /// Held while keys of one slot are being moved.
    pub(crate) executor: AtomicBool,
    pub(crate) remain: AtomicU64,
    pub(crate) failed: AtomicBool,
}

/// Claim on the slot executor; released on drop.
#[derive(Debug)]
pub(crate) struct ExecutorGuard<'a>(&'a AtomicBool);

impl<'a> ExecutorGuard<'a> {
    pub(crate) fn try_claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ExecutorGuard(flag))
    }
}

impl Drop for ExecutorGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sentinel-side state that lives outside the controller mutex.
#[derive(Debug, Default)]
pub(crate) struct HaState {
    /// Group masters as last reported by the sentinels.
    pub(crate) masters: BTreeMap<u16, String>,
    pub(crate) monitor: Option<JoinHandle<()>>,
}

pub struct Topom {
    pub(crate) config: Config,
    pub(crate) secret: ProductSecret,
    pub(crate) model: topom_models::Topom,
    xauth: String,

    inner: tokio::sync::Mutex<Cache>,

    closed: AtomicBool,
    started: AtomicBool,
    lock_lost: AtomicBool,
    shutdown: watch::Sender<bool>,

    pub(crate) action: ActionControl,
    pub(crate) pool: RedisPool,
    pub(crate) http: reqwest::Client,
    pub(crate) sentinel: SentinelClient,
    pub(crate) stats: Mutex<StatsTable>,
    pub(crate) ha: Mutex<HaState>,
}

impl Topom {
    /// Builds a controller for `config.product_name` and takes the
    /// product's leader lock.
    ///
    /// Fails with [`TopomError::Fatal`] if another controller holds the
    /// lock. The returned controller closes itself if the lock is lost.
    pub async fn new(client: Arc<dyn Client>, config: Config) -> Result<Arc<Topom>, TopomError> {
        if !is_valid_product(&config.product_name) {
            return Err(TopomError::Fatal(format!(
                "invalid product name '{}'",
                config.product_name
            )));
        }
        let model = build_model(&config).await;
        let store = Store::new(client, config.product_name.clone());

        let lost = match store.acquire(&model).await {
            Ok(signal) => signal,
            Err(e) if e.is_already_exists() => {
                let holder = store
                    .load_topom(false)
                    .await
                    .ok()
                    .flatten()
                    .map(|t| t.admin_addr)
                    .unwrap_or_default();
                return Err(TopomError::Fatal(format!(
                    "product '{}' is locked by topom-[{holder}]",
                    config.product_name
                )));
            }
            Err(e) => return Err(TopomError::Store(e)),
        };

        let secret = ProductSecret::new(&config.product_name, &config.product_auth);
        let http = ProxyClient::http_client(config.proxy_rpc_timeout())
            .map_err(|e| TopomError::Fatal(format!("http client: {e}")))?;
        let action = ActionControl::default();
        action
            .interval_ms
            .store(config.slot_action_interval_ms.min(MAX_SLOT_ACTION_INTERVAL_MS), Ordering::Relaxed);
        action
            .disabled
            .store(config.slot_action_disabled, Ordering::Relaxed);

        let topom = Arc::new(Topom {
            xauth: secret.topom_xauth(),
            pool: RedisPool::new(
                &config.product_auth,
                config.backend_rpc_timeout(),
                config.backend_pool_timeout(),
            ),
            sentinel: SentinelClient::new(&config.product_name, &config.product_auth),
            secret,
            model,
            inner: tokio::sync::Mutex::new(Cache::new(store)),
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            lock_lost: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
            action,
            http,
            stats: Mutex::new(StatsTable::default()),
            ha: Mutex::new(HaState::default()),
            config,
        });
        info!(
            product = %topom.config.product_name,
            token = %topom.model.token,
            "topom acquired the product lock"
        );
        spawn_lock_watcher(Arc::downgrade(&topom), lost);
        Ok(topom)
    }

    /// Spawns the background routines. Only the first call has an effect.
    pub fn start(self: &Arc<Self>) -> Result<(), TopomError> {
        if self.is_closed() {
            return Err(TopomError::Closed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        crate::dispatcher::spawn_all(self);
        info!("topom background routines started");
        Ok(())
    }

    /// Shuts the controller down and releases the lock. Idempotent.
    pub async fn close(&self) -> Result<(), TopomError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.send_replace(true);
        if let Some(monitor) = self.ha_state().monitor.take() {
            monitor.abort();
        }
        self.pool.close();

        let cache = self.inner.lock().await;
        let store = cache.store();
        let released = store.release().await;
        if let Err(e) = &released {
            error!("store: release lock of product '{}' failed: {e}", store.product());
        }
        if let Err(e) = store.close().await {
            warn!("store: close failed: {e}");
        }
        info!("topom closed");
        released.map_err(TopomError::Store)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True if the controller closed because the lock cell vanished.
    pub fn lock_lost(&self) -> bool {
        self.lock_lost.load(Ordering::Acquire)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn model(&self) -> &topom_models::Topom {
        &self.model
    }

    /// Token guarding this controller's admin API.
    pub fn xauth(&self) -> &str {
        &self.xauth
    }

    /// Takes the controller mutex and returns it with a fresh snapshot.
    pub(crate) async fn begin(&self) -> Result<(MutexGuard<'_, Cache>, Context), TopomError> {
        let mut cache = self.inner.lock().await;
        if self.is_closed() {
            return Err(TopomError::Closed);
        }
        cache.refill().await?;
        let ctx = cache.context();
        Ok((cache, ctx))
    }

    /// Like [`begin`](Self::begin), but slots rolled back after a failed
    /// push are first reloaded from the store, so the snapshot carries
    /// their persisted state.
    pub(crate) async fn begin_settled(&self) -> Result<(MutexGuard<'_, Cache>, Context), TopomError> {
        let (mut cache, ctx) = self.begin().await?;
        if !cache.settle() {
            return Ok((cache, ctx));
        }
        cache.refill().await?;
        let ctx = cache.context();
        Ok((cache, ctx))
    }

    /// Snapshot of the current state, taken under the mutex.
    pub async fn snapshot(&self) -> Result<Context, TopomError> {
        let (_cache, ctx) = self.begin().await?;
        Ok(ctx)
    }

    /// Forgets everything cached and reloads it from the store.
    pub async fn reload(&self) -> Result<(), TopomError> {
        let mut cache = self.inner.lock().await;
        if self.is_closed() {
            return Err(TopomError::Closed);
        }
        cache.dirty_all();
        cache.refill().await
    }

    /// Routing views of every slot.
    pub async fn slots(&self) -> Result<Vec<Slot>, TopomError> {
        Ok(self.snapshot().await?.all_slots())
    }

    pub fn slot_action_interval(&self) -> u64 {
        self.action.interval_ms.load(Ordering::Relaxed)
    }

    pub fn set_slot_action_interval(&self, ms: u64) {
        let ms = ms.min(MAX_SLOT_ACTION_INTERVAL_MS);
        self.action.interval_ms.store(ms, Ordering::Relaxed);
        info!("set slot action interval = {ms}");
    }

    pub fn slot_action_disabled(&self) -> bool {
        self.action.disabled.load(Ordering::Relaxed)
    }

    pub fn set_slot_action_disabled(&self, value: bool) {
        self.action.disabled.store(value, Ordering::Relaxed);
        info!("set slot action disabled = {value}");
    }

    pub(crate) fn proxy_client(&self, p: &Proxy) -> ProxyClient {
        ProxyClient::new(
            self.http.clone(),
            &p.admin_addr,
            &self.secret.proxy_xauth(&p.token),
        )
    }

    pub(crate) fn ha_state(&self) -> std::sync::MutexGuard<'_, HaState> {
        self.ha.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pushes `slots` to every proxy in `ctx` concurrently.
    ///
    /// Waits for all of them. The error names every proxy that failed.
    pub(crate) async fn resync_slots(&self, ctx: &Context, slots: &[Slot]) -> Result<(), TopomError> {
        if slots.is_empty() {
            return Ok(());
        }
        let pushes = ctx.proxies.values().map(|p| async move {
            let result = self.proxy_client(p).fill_slots(slots).await;
            (p, result)
        });
        let mut failed = Vec::new();
        for (p, result) in join_all(pushes).await {
            if let Err(e) = result {
                warn!(token = %p.token, "proxy-[{}] resync slots failed: {e}", p.token);
                failed.push(format!("proxy-[{}]", p.token));
            }
        }
        if failed.is_empty() {
            return Ok(());
        }
        metrics::counter!("topom_broadcast_failures_total").increment(1);
        failed.sort();
        Err(TopomError::Broadcast(format!(
            "{} resync slots failed",
            failed.join(", ")
        )))
    }
}

impl std::fmt::Debug for Topom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topom")
            .field("product", &self.config.product_name)
            .field("token", &self.model.token)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn spawn_lock_watcher(topom: Weak<Topom>, lost: Signal) {
    tokio::spawn(async move {
        lost.fired().await;
        let Some(topom) = topom.upgrade() else {
            return;
        };
        if topom.is_closed() {
            return;
        }
        error!("topom lost the product lock, shutting down");
        topom.lock_lost.store(true, Ordering::Release);
        if let Err(e) = topom.close().await {
            warn!("close after lock loss: {e}");
        }
    });
}

async fn build_model(config: &Config) -> topom_models::Topom {
    let start_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
        .to_string();
    let pwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let sys = match tokio::process::Command::new("uname").arg("-a").output().await {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_owned(),
        _ => String::new(),
    };
    topom_models::Topom {
        token: hex::encode(rand::random::<[u8; 16]>()),
        start_time,
        admin_addr: config.admin_addr.clone(),
        product_name: config.product_name.clone(),
        pid: std::process::id(),
        pwd,
        sys,
    }
}
