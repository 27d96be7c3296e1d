//! Background routines started by [`Topom::start`].
//!
//! Every routine holds only a `Weak` handle to the controller and stops
//! as soon as the shutdown signal fires or the controller is dropped.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::TopomError;
use crate::topom::Topom;

const SLOT_IDLE: Duration = Duration::from_millis(250);
const SLOT_DISABLED: Duration = Duration::from_secs(1);
const SLOT_ERROR_BACKOFF: Duration = Duration::from_secs(3);
const SYNC_IDLE: Duration = Duration::from_secs(1);
const SYNC_ERROR_BACKOFF: Duration = Duration::from_secs(5);
const STATS_PERIOD: Duration = Duration::from_secs(1);
const POOL_CLEANUP_PERIOD: Duration = Duration::from_secs(60);

pub(crate) fn spawn_all(topom: &Arc<Topom>) {
    spawn_loop(topom, "slot action", |t| async move {
        match t.process_slot_action().await {
            Ok(Some(sid)) => {
                info!(sid, "slot-[{sid}] action done");
                Duration::from_millis(t.slot_action_interval())
            }
            Ok(None) if t.slot_action_disabled() => SLOT_DISABLED,
            Ok(None) => SLOT_IDLE,
            Err(TopomError::Closed) => Duration::ZERO,
            Err(e) => {
                warn!("slot action failed: {e}");
                SLOT_ERROR_BACKOFF
            }
        }
    });

    spawn_loop(topom, "sync action", |t| async move {
        match t.process_sync_action().await {
            Ok(Some(addr)) => {
                info!("server-[{addr}] sync action done");
                Duration::ZERO
            }
            Ok(None) => SYNC_IDLE,
            Err(TopomError::Closed) => Duration::ZERO,
            Err(e) => {
                warn!("sync action failed: {e}");
                SYNC_ERROR_BACKOFF
            }
        }
    });

    spawn_loop(topom, "server stats", |t| async move {
        if let Err(e) = t.refresh_server_stats().await {
            debug!("refresh server stats failed: {e}");
        }
        STATS_PERIOD
    });

    spawn_loop(topom, "proxy stats", |t| async move {
        if let Err(e) = t.refresh_proxy_stats().await {
            debug!("refresh proxy stats failed: {e}");
        }
        STATS_PERIOD
    });

    spawn_loop(topom, "pool cleanup", |t| async move {
        t.pool.cleanup();
        POOL_CLEANUP_PERIOD
    });

    // resume watching the sentinels recorded by a previous controller
    let weak = Arc::downgrade(topom);
    tokio::spawn(async move {
        let Some(t) = weak.upgrade() else {
            return;
        };
        match t.snapshot().await {
            Ok(ctx) if !ctx.sentinel.servers.is_empty() => {
                t.rewatch_sentinels(ctx.sentinel.servers);
            }
            Ok(_) => {}
            Err(e) => warn!("load sentinels failed: {e}"),
        }
    });
}

/// Runs `step` until shutdown, sleeping for whatever delay it returns
/// between rounds.
fn spawn_loop<F, Fut>(topom: &Arc<Topom>, name: &'static str, step: F)
where
    F: Fn(Arc<Topom>) -> Fut + Send + 'static,
    Fut: Future<Output = Duration> + Send + 'static,
{
    let weak: Weak<Topom> = Arc::downgrade(topom);
    let mut shutdown = topom.shutdown_signal();
    tokio::spawn(async move {
        loop {
            let Some(t) = weak.upgrade() else {
                break;
            };
            if t.is_closed() {
                break;
            }
            let delay = tokio::select! {
                delay = step(t) => delay,
                _ = shutdown.wait_for(|closed| *closed) => break,
            };
            if pause(&mut shutdown, delay).await {
                break;
            }
        }
        debug!("{name} routine stopped");
    });
}

/// Sleeps for `delay`. Returns `true` if shutdown fired first.
async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if delay.is_zero() {
        return *shutdown.borrow();
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.wait_for(|closed| *closed) => true,
    }
}
