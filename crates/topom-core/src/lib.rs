//! topom-core: the cluster controller.
//!
//! A [`Topom`] owns one product. It keeps the slot table, the replica
//! groups, the registered proxies and the sentinel set in a coordinator
//! [`Store`](topom_models::Store), and it is the only writer there while
//! it holds the product lock.
//!
//! # Architecture
//!
//! - **Slot migration**: queued slot actions move through
//!   `pending → preparing → prepared → migrating → finished`, one slot at
//!   a time, with every proxy re-pointed at each routing change
//! - **Promotion**: a replica becomes master in three committed steps,
//!   with the group's slots locked on every proxy in between
//! - **Re-sync**: queued `SLAVEOF` actions point replicas back at masters
//! - **Sentinels**: group masters are registered with a sentinel set and
//!   `+switch-master` events are watched
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use topom_core::{Config, Topom};
//! use topom_models::MemoryClient;
//!
//! let topom = Topom::new(Arc::new(MemoryClient::new()), Config::default()).await?;
//! topom.start()?;
//! topom.create_group(1).await?;
//! topom.group_add_server(1, "10.0.0.1:6379").await?;
//! topom.slot_create_action_range(0, 1023, 1).await?;
//! ```

mod cache;
mod config;
mod context;
mod dispatcher;
mod error;
mod group;
mod proxy;
mod proxy_client;
pub mod redis;
mod sentinel;
mod sentinel_client;
mod slots;
mod stats;
mod sync;
mod topom;
mod xauth;

pub use config::Config;
pub use context::Context;
pub use error::{ErrorKind, TopomError};
pub use proxy_client::{ProxyClient, ProxyError};
pub use sentinel_client::{MonitorConfig, SentinelClient, SentinelError};
pub use slots::SlotStep;
pub use stats::{
    GroupTable, Overview, ProxyStats, ProxyTable, ServerStats, SlotActionProgress,
    SlotActionStats, Stats, STATS_TIMEOUT, VERSION,
};
pub use topom::{Topom, MAX_SLOT_ACTION_INTERVAL_MS};
pub use xauth::{verify, ProductSecret};
