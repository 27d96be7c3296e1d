//! Filesystem coordinator.
//!
//! Nodes are files under `<root>/data`. Every write lands in a temp file
//! under `<root>/temp` first and is renamed into place, so readers never
//! observe a torn value. `create` never replaces an existing file, even
//! one written by another process. There are no sessions: an ephemeral node is an
//! ordinary file whose lost-signal fires when this client closes.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{join, Client, Signal, Trigger};
use crate::error::StoreError;

const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Inner {
    data_dir: PathBuf,
    temp_dir: PathBuf,
    closed: AtomicBool,
    /// Serializes file operations issued through this client.
    io: Mutex<()>,
    ephemerals: Mutex<Vec<Trigger>>,
}

impl Inner {
    fn realpath(&self, path: &str) -> PathBuf {
        let rel = path.trim_start_matches('/');
        if rel.is_empty() {
            self.data_dir.clone()
        } else {
            self.data_dir.join(rel)
        }
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn write_file(&self, path: &str, data: &[u8], exclusive: bool) -> Result<(), StoreError> {
        let _guard = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        let real = self.realpath(path);
        if exclusive && real.exists() {
            return Err(StoreError::AlreadyExists(path.to_owned()));
        }
        if let Some(parent) = real.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(path, e))?;
        }
        std::fs::create_dir_all(&self.temp_dir).map_err(|e| StoreError::io(path, e))?;

        let mut tmp = NamedTempFile::new_in(&self.temp_dir).map_err(|e| StoreError::io(path, e))?;
        tmp.write_all(data).map_err(|e| StoreError::io(path, e))?;
        tmp.as_file().sync_all().map_err(|e| StoreError::io(path, e))?;
        if !exclusive {
            tmp.persist(&real)
                .map_err(|e| StoreError::io(path, e.error))?;
            return Ok(());
        }
        // the existence check above only covers this process
        match tmp.persist_noclobber(&real) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyExists(path.to_owned()))
            }
            Err(e) => Err(StoreError::io(path, e.error)),
        }
    }

    fn read_file(&self, path: &str, must: bool) -> Result<Option<Vec<u8>>, StoreError> {
        let _guard = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        match std::fs::read(self.realpath(path)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound && !must => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.to_owned()))
            }
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn list_dir(&self, path: &str, must: bool) -> Result<Vec<String>, StoreError> {
        let _guard = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = match std::fs::read_dir(self.realpath(path)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound && !must => return Ok(Vec::new()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.to_owned()))
            }
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names.into_iter().map(|n| join(path, &n)).collect())
    }

    fn remove(&self, path: &str) -> Result<(), StoreError> {
        let _guard = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        let real = self.realpath(path);
        let result = match std::fs::metadata(&real) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&real),
            Ok(_) => std::fs::remove_file(&real),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(|e| StoreError::io(path, e))
    }
}

/// Coordinator backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsClient {
    inner: Arc<Inner>,
}

impl FsClient {
    /// Opens (or prepares) the store rooted at `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = std::path::absolute(dir.as_ref())
            .map_err(|e| StoreError::io(dir.as_ref().display().to_string(), e))?;
        Ok(FsClient {
            inner: Arc::new(Inner {
                data_dir: root.join("data"),
                temp_dir: root.join("temp"),
                closed: AtomicBool::new(false),
                io: Mutex::new(()),
                ephemerals: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Runs a blocking file operation off the async worker threads.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, StoreError> + Send + 'static,
    {
        self.inner.check_open()?;
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::Backend(format!("fs task failed: {e}")))?
    }
}

#[async_trait]
impl Client for FsClient {
    async fn create(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let (p, d) = (path.to_owned(), data.to_vec());
        let result = self.blocking(move |fs| fs.write_file(&p, &d, true)).await;
        match &result {
            Ok(()) => info!(path, "fsclient create ok"),
            Err(e) => warn!(path, "fsclient create failed: {e}"),
        }
        result
    }

    async fn update(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let (p, d) = (path.to_owned(), data.to_vec());
        let result = self.blocking(move |fs| fs.write_file(&p, &d, false)).await;
        if let Err(e) = &result {
            warn!(path, "fsclient update failed: {e}");
        }
        result
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let p = path.to_owned();
        let result = self.blocking(move |fs| fs.remove(&p)).await;
        match &result {
            Ok(()) => info!(path, "fsclient delete ok"),
            Err(e) => warn!(path, "fsclient delete failed: {e}"),
        }
        result
    }

    async fn read(&self, path: &str, must: bool) -> Result<Option<Vec<u8>>, StoreError> {
        let p = path.to_owned();
        self.blocking(move |fs| fs.read_file(&p, must)).await
    }

    async fn list(&self, path: &str, must: bool) -> Result<Vec<String>, StoreError> {
        let p = path.to_owned();
        self.blocking(move |fs| fs.list_dir(&p, must)).await
    }

    async fn watch_in_order(&self, path: &str) -> Result<(Signal, Vec<String>), StoreError> {
        let children = self.list(path, false).await?;
        let (trigger, signal) = Signal::pair();

        let client = self.clone();
        let path = path.to_owned();
        let baseline = children.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(WATCH_POLL_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                match client.list(&path, false).await {
                    Ok(now) if now == baseline => continue,
                    Ok(_) => debug!(path, "fsclient watch fired"),
                    Err(e) => debug!(path, "fsclient watch ended: {e}"),
                }
                trigger.fire();
                return;
            }
        });
        Ok((signal, children))
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<Signal, StoreError> {
        self.create(path, data).await?;
        let (trigger, signal) = Signal::pair();
        self.inner
            .ephemerals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(trigger);
        Ok(signal)
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let triggers = std::mem::take(
            &mut *self
                .inner
                .ephemerals
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for trigger in triggers {
            trigger.fire();
        }
        Ok(())
    }
}
