//! Coordinator clients.
//!
//! The controller only needs a small key-tree: create, upsert, delete,
//! read, list children, watch a subtree, and one ephemeral node used as
//! the leader lock. [`Client`] is that surface; [`MemoryClient`] and
//! [`FsClient`] implement it.

mod fs;
mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::StoreError;

pub use fs::FsClient;
pub use memory::MemoryClient;

/// A one-shot notification.
///
/// Fires when the watched subtree changes, or for an ephemeral node,
/// when ownership is lost. Dropping the producing side also counts as
/// firing, so a waiter never hangs on a client that went away.
#[derive(Debug, Clone)]
pub struct Signal {
    rx: watch::Receiver<bool>,
}

impl Signal {
    pub(crate) fn pair() -> (Trigger, Signal) {
        let (tx, rx) = watch::channel(false);
        (Trigger { tx }, Signal { rx })
    }

    /// Waits until the signal fires.
    pub async fn fired(mut self) {
        let _ = self.rx.wait_for(|fired| *fired).await;
    }

    /// Non-blocking check.
    pub fn has_fired(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }
}

/// Producing side of a [`Signal`].
#[derive(Debug)]
pub(crate) struct Trigger {
    tx: watch::Sender<bool>,
}

impl Trigger {
    pub(crate) fn fire(&self) {
        self.tx.send_replace(true);
    }
}

/// The key-tree operations the controller relies on.
///
/// Paths are absolute and `/`-separated. Intermediate directories are
/// implicit: writing `/a/b/c` makes `/a/b` listable.
#[async_trait]
pub trait Client: Send + Sync + fmt::Debug {
    /// Creates a node; fails with `AlreadyExists` if one is present.
    async fn create(&self, path: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Creates or overwrites a node.
    async fn update(&self, path: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Removes a node. Removing a missing node succeeds.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Reads a node. A missing node is `Ok(None)` unless `must` is set.
    async fn read(&self, path: &str, must: bool) -> Result<Option<Vec<u8>>, StoreError>;

    /// Lists the full paths of the direct children of `path`, sorted.
    async fn list(&self, path: &str, must: bool) -> Result<Vec<String>, StoreError>;

    /// Returns the current children together with a signal that fires on
    /// the next change anywhere under `path`.
    async fn watch_in_order(&self, path: &str) -> Result<(Signal, Vec<String>), StoreError>;

    /// Creates a node owned by this client session. The returned signal
    /// fires when the node is lost.
    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<Signal, StoreError>;

    /// Closes the session, releasing its ephemeral nodes where the
    /// backend has sessions.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Builds the client named by the `coordinator_name` setting.
pub fn new_client(name: &str, addr: &str) -> Result<Arc<dyn Client>, StoreError> {
    match name {
        "memory" => Ok(Arc::new(MemoryClient::new())),
        "filesystem" | "fs" => Ok(Arc::new(FsClient::new(addr)?)),
        "zookeeper" | "zk" | "etcd" => Err(StoreError::Backend(format!(
            "coordinator '{name}' is not supported by this build"
        ))),
        _ => Err(StoreError::Backend(format!("invalid coordinator name '{name}'"))),
    }
}

/// Joins `parent` and `child` with exactly one separator.
pub(crate) fn join(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{child}")
    } else {
        format!("{parent}/{child}")
    }
}
