//! Error types for coordinator store operations.

use std::io;

/// Errors surfaced by a coordinator [`Client`](crate::Client) or the
/// typed [`Store`](crate::Store) wrapper.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `create` on a path that already holds a node.
    #[error("node {0} already exists")]
    AlreadyExists(String),

    /// A `must` read or list found nothing at the path.
    #[error("node {0} not found")]
    NotFound(String),

    /// Filesystem failure in the on-disk backend.
    #[error("store i/o on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A node holds bytes that do not decode into the expected entity.
    #[error("decode {path}: {source}")]
    Codec {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// The client has been closed.
    #[error("use of closed store client")]
    Closed,

    /// The coordinator rejected or lost an operation for a reason the
    /// backend reports as text, e.g. an unsupported coordinator kind.
    #[error("coordinator backend: {0}")]
    Backend(String),

    /// A write did not read back as the value just written.
    #[error("write to {0} did not read back intact")]
    Mismatch(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<String>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true for the "node does not exist" family, including an
    /// i/o error of kind `NotFound`.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Returns true if a `create` lost against an existing node.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}
