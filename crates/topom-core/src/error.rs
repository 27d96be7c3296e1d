//! Controller errors and their kinds.

use std::fmt;

use topom_models::StoreError;

use crate::proxy_client::ProxyError;
use crate::redis::RedisError;
use crate::sentinel_client::SentinelError;

/// Coarse classification used for logging, retry policy and the admin
/// API's status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request is invalid for the current state. Nothing changed.
    Precondition,
    /// The coordinator failed or is unreachable.
    Store,
    /// At least one proxy rejected or missed a push.
    Broadcast,
    /// A backend server command failed.
    Backend,
    /// Sentinels did not answer or did not agree.
    Sentinel,
    /// The controller cannot continue, e.g. the lock is held elsewhere.
    Fatal,
    /// The controller has been closed.
    Closed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Precondition => "precondition",
            ErrorKind::Store => "store",
            ErrorKind::Broadcast => "broadcast",
            ErrorKind::Backend => "backend",
            ErrorKind::Sentinel => "sentinel",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Closed => "closed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by controller operations.
#[derive(Debug, thiserror::Error)]
pub enum TopomError {
    /// Request rejected by a state check.
    #[error("{0}")]
    Precondition(String),

    /// A referenced slot, group, server or proxy does not exist.
    #[error("{0}")]
    NotFound(String),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// One or more proxies failed a push. The message names them.
    #[error("{0}")]
    Broadcast(String),

    /// A single proxy RPC outside a broadcast, e.g. during registration.
    #[error("proxy {addr}: {source}")]
    Proxy {
        addr: String,
        #[source]
        source: ProxyError,
    },

    #[error("backend {addr}: {source}")]
    Backend {
        addr: String,
        #[source]
        source: RedisError,
    },

    #[error("sentinel: {0}")]
    Sentinel(#[from] SentinelError),

    #[error("{0}")]
    Fatal(String),

    #[error("use of closed topom")]
    Closed,
}

impl TopomError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TopomError::Precondition(_) | TopomError::NotFound(_) => ErrorKind::Precondition,
            TopomError::Store(_) => ErrorKind::Store,
            TopomError::Broadcast(_) | TopomError::Proxy { .. } => ErrorKind::Broadcast,
            TopomError::Backend { .. } => ErrorKind::Backend,
            TopomError::Sentinel(_) => ErrorKind::Sentinel,
            TopomError::Fatal(_) => ErrorKind::Fatal,
            TopomError::Closed => ErrorKind::Closed,
        }
    }

    /// True for lookups of things that do not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TopomError::NotFound(_))
    }

    pub(crate) fn backend(addr: &str, source: RedisError) -> Self {
        TopomError::Backend {
            addr: addr.to_owned(),
            source,
        }
    }

    pub(crate) fn proxy(addr: &str, source: ProxyError) -> Self {
        TopomError::Proxy {
            addr: addr.to_owned(),
            source,
        }
    }
}

/// Shorthand for `Err(TopomError::Precondition(format!(...)))`.
macro_rules! precondition {
    ($($arg:tt)*) => {
        Err($crate::error::TopomError::Precondition(format!($($arg)*)))
    };
}

pub(crate) use precondition;
