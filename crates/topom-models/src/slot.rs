//! Slot mappings and the routing view pushed to proxies.

use serde::{Deserialize, Serialize};

use crate::action::SlotActionState;

/// Number of logical hash slots in a product.
pub const MAX_SLOT_NUM: usize = 1024;

/// A queued or running migration on one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotAction {
    /// Global FIFO position, assigned when the action becomes pending.
    pub index: u64,
    pub state: SlotActionState,
    /// Destination group while the action is live.
    pub target_id: u16,
}

impl SlotAction {
    fn is_idle(&self) -> bool {
        self.state == SlotActionState::Nothing
    }
}

/// Persisted ownership record for one slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotMapping {
    pub id: u16,
    /// Owning group, or 0 while the slot is unassigned.
    pub group_id: u16,
    #[serde(skip_serializing_if = "SlotAction::is_idle")]
    pub action: SlotAction,
}

impl SlotMapping {
    /// The zero-valued mapping substituted for a slot with no store node.
    pub fn empty(id: u16) -> Self {
        SlotMapping {
            id,
            ..Default::default()
        }
    }

    /// Panics if the action fields contradict the state.
    ///
    /// An idle slot must carry neither index nor target, and a live one
    /// must name a target. Anything else means the store was written by
    /// something that does not follow the state machine.
    pub fn assert_consistent(&self) {
        let a = &self.action;
        let ok = match a.state {
            SlotActionState::Nothing => a.index == 0 && a.target_id == 0,
            _ => a.target_id != 0,
        };
        if !ok {
            panic!(
                "slot-[{}] is in an impossible state: {}",
                self.id,
                String::from_utf8_lossy(&crate::encode(self))
            );
        }
    }
}

/// The routing view of one slot as proxies consume it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Slot {
    pub id: u16,
    pub locked: bool,
    pub backend_addr: String,
    pub backend_addr_group_id: u16,
    pub migrate_from: String,
    pub migrate_from_group_id: u16,
}
