//! In-process coordinator.
//!
//! The whole tree sits behind one mutex. Clones share the tree and the
//! session; [`MemoryClient::session`] opens a second session on the same
//! tree, which is how tests stand up two contending controllers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{join, Client, Signal, Trigger};
use crate::error::StoreError;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    /// Owning session and lost-trigger for ephemeral nodes.
    ephemeral: Option<(u64, Trigger)>,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    watchers: Vec<(String, Trigger)>,
    next_session: u64,
}

impl Tree {
    /// Fires and drops every watcher whose subtree contains `path`.
    fn notify(&mut self, path: &str) {
        self.watchers.retain(|(root, trigger)| {
            if covers(root, path) {
                trigger.fire();
                false
            } else {
                true
            }
        });
    }

    fn children(&self, path: &str) -> BTreeSet<String> {
        let prefix = join(path, "");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| k[prefix.len()..].split('/').next())
            .filter(|name| !name.is_empty())
            .map(|name| join(path, name))
            .collect()
    }

    fn remove(&mut self, path: &str) {
        if let Some(node) = self.nodes.remove(path) {
            if let Some((_, lost)) = node.ephemeral {
                lost.fire();
            }
            self.notify(path);
        }
    }
}

fn covers(root: &str, path: &str) -> bool {
    path == root || path.starts_with(&join(root, ""))
}

/// Shared in-memory key tree.
#[derive(Debug, Clone)]
pub struct MemoryClient {
    tree: Arc<Mutex<Tree>>,
    session: u64,
    closed: Arc<AtomicBool>,
}

impl MemoryClient {
    pub fn new() -> Self {
        let tree = Arc::new(Mutex::new(Tree {
            next_session: 1,
            ..Default::default()
        }));
        MemoryClient {
            tree,
            session: 0,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Opens another session on the same tree.
    pub fn session(&self) -> Self {
        let mut tree = self.lock();
        let session = tree.next_session;
        tree.next_session += 1;
        MemoryClient {
            tree: Arc::clone(&self.tree),
            session,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) -> Result<MutexGuard<'_, Tree>, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(self.lock())
    }
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Client for MemoryClient {
    async fn create(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut tree = self.open()?;
        if tree.nodes.contains_key(path) {
            return Err(StoreError::AlreadyExists(path.to_owned()));
        }
        tree.nodes.insert(
            path.to_owned(),
            Node {
                data: data.to_vec(),
                ephemeral: None,
            },
        );
        tree.notify(path);
        Ok(())
    }

    async fn update(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut tree = self.open()?;
        match tree.nodes.get_mut(path) {
            Some(node) => node.data = data.to_vec(),
            None => {
                tree.nodes.insert(
                    path.to_owned(),
                    Node {
                        data: data.to_vec(),
                        ephemeral: None,
                    },
                );
            }
        }
        tree.notify(path);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let mut tree = self.open()?;
        tree.remove(path);
        Ok(())
    }

    async fn read(&self, path: &str, must: bool) -> Result<Option<Vec<u8>>, StoreError> {
        let tree = self.open()?;
        match tree.nodes.get(path) {
            Some(node) => Ok(Some(node.data.clone())),
            None if must => Err(StoreError::NotFound(path.to_owned())),
            None => Ok(None),
        }
    }

    async fn list(&self, path: &str, must: bool) -> Result<Vec<String>, StoreError> {
        let tree = self.open()?;
        let children = tree.children(path);
        if must && children.is_empty() && !tree.nodes.contains_key(path) {
            return Err(StoreError::NotFound(path.to_owned()));
        }
        Ok(children.into_iter().collect())
    }

    async fn watch_in_order(&self, path: &str) -> Result<(Signal, Vec<String>), StoreError> {
        let mut tree = self.open()?;
        let children = tree.children(path).into_iter().collect();
        let (trigger, signal) = Signal::pair();
        tree.watchers.push((path.to_owned(), trigger));
        Ok((signal, children))
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<Signal, StoreError> {
        let mut tree = self.open()?;
        if tree.nodes.contains_key(path) {
            return Err(StoreError::AlreadyExists(path.to_owned()));
        }
        let (trigger, signal) = Signal::pair();
        tree.nodes.insert(
            path.to_owned(),
            Node {
                data: data.to_vec(),
                ephemeral: Some((self.session, trigger)),
            },
        );
        tree.notify(path);
        Ok(signal)
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut tree = self.lock();
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, n)| matches!(n.ephemeral, Some((s, _)) if s == self.session))
            .map(|(k, _)| k.clone())
            .collect();
        for path in owned {
            tree.remove(&path);
        }
        Ok(())
    }
}
