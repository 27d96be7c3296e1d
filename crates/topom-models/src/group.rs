//! Replica groups.

use serde::{Deserialize, Serialize};

use crate::action::{PromotingState, SyncActionState};

/// Reserved id meaning "no group".
pub const INVALID_GROUP_ID: u16 = 0;

/// Largest valid group id.
pub const MAX_GROUP_ID: u16 = 32767;

/// A replica's queued re-SLAVEOF job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncAction {
    pub index: u64,
    pub state: SyncActionState,
}

/// One backend server inside a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupServer {
    #[serde(rename = "server")]
    pub addr: String,
    pub action: SyncAction,
}

impl GroupServer {
    pub fn new(addr: impl Into<String>) -> Self {
        GroupServer {
            addr: addr.into(),
            action: SyncAction::default(),
        }
    }
}

/// Master promotion progress for a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Promoting {
    /// Position in `servers` of the replica being promoted.
    pub index: usize,
    pub state: PromotingState,
}

/// A replica set. `servers[0]` is the master.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    pub id: u16,
    pub servers: Vec<GroupServer>,
    pub promoting: Promoting,
    /// Set when the master changed and sentinels have not been resynced.
    pub out_of_sync: bool,
}

impl Group {
    pub fn new(id: u16) -> Self {
        Group {
            id,
            ..Default::default()
        }
    }

    /// Returns the master address, or `""` for an empty group.
    pub fn master(&self) -> &str {
        self.servers.first().map(|s| s.addr.as_str()).unwrap_or("")
    }

    /// Position of `addr` in the server list.
    pub fn position(&self, addr: &str) -> Option<usize> {
        self.servers.iter().position(|s| s.addr == addr)
    }

    /// True when the group id is inside `1..=MAX_GROUP_ID`.
    pub fn is_valid_id(gid: u16) -> bool {
        gid != INVALID_GROUP_ID && gid <= MAX_GROUP_ID
    }
}
