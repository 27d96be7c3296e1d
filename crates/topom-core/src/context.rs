//! Point-in-time view of the cluster used to validate and plan a change.
//!
//! A [`Context`] is built from the cache while the controller mutex is
//! held, so every check inside one operation sees the same state. It
//! owns its data; mutating it never touches the cache.

use std::collections::{BTreeMap, HashMap};

use topom_models::{
    Group, PromotingState, Proxy, Sentinel, Slot, SlotActionState, SlotMapping, SyncActionState,
    MAX_SLOT_NUM,
};

use crate::error::{precondition, TopomError};

#[derive(Debug, Clone, Default)]
pub struct Context {
    pub slots: Vec<SlotMapping>,
    pub groups: BTreeMap<u16, Group>,
    pub proxies: HashMap<String, Proxy>,
    pub sentinel: Sentinel,
}

impl Context {
    pub fn slot_mapping(&self, sid: u16) -> Result<&SlotMapping, TopomError> {
        if self.slots.len() != MAX_SLOT_NUM {
            return precondition!(
                "invalid number of slots = {}/{}",
                self.slots.len(),
                MAX_SLOT_NUM
            );
        }
        self.slots
            .get(sid as usize)
            .ok_or_else(|| TopomError::NotFound(format!("slot-[{sid}] doesn't exist")))
    }

    /// Slots that reference `gid` as owner or as migration target.
    pub fn slot_mappings_by_group(&self, gid: u16) -> Vec<&SlotMapping> {
        self.slots
            .iter()
            .filter(|m| m.group_id == gid || m.action.target_id == gid)
            .collect()
    }

    pub fn max_slot_action_index(&self) -> u64 {
        self.slots
            .iter()
            .filter(|m| m.action.state != SlotActionState::Nothing)
            .map(|m| m.action.index)
            .max()
            .unwrap_or(0)
    }

    /// The started action with the smallest index, if any.
    pub fn min_started_slot_action(&self) -> Option<&SlotMapping> {
        self.slots
            .iter()
            .filter(|m| m.action.state.is_started())
            .min_by_key(|m| m.action.index)
    }

    /// The pending action with the smallest index, if any.
    pub fn min_pending_slot_action(&self) -> Option<&SlotMapping> {
        self.slots
            .iter()
            .filter(|m| m.action.state == SlotActionState::Pending)
            .min_by_key(|m| m.action.index)
    }

    pub fn group(&self, gid: u16) -> Result<&Group, TopomError> {
        self.groups
            .get(&gid)
            .ok_or_else(|| TopomError::NotFound(format!("group-[{gid}] doesn't exist")))
    }

    /// Finds the group holding `addr` and the server's position in it.
    pub fn group_by_server(&self, addr: &str) -> Result<(&Group, usize), TopomError> {
        self.groups
            .values()
            .find_map(|g| g.position(addr).map(|i| (g, i)))
            .ok_or_else(|| TopomError::NotFound(format!("server-[{addr}] doesn't exist")))
    }

    /// Master address of `gid`, or empty when the group is missing or
    /// has no servers.
    pub fn group_master(&self, gid: u16) -> &str {
        self.groups.get(&gid).map(Group::master).unwrap_or("")
    }

    /// Masters of every group that has one.
    pub fn group_masters(&self) -> BTreeMap<u16, String> {
        self.groups
            .values()
            .filter(|g| !g.servers.is_empty())
            .map(|g| (g.id, g.master().to_owned()))
            .collect()
    }

    pub fn is_group_in_use(&self, gid: u16) -> bool {
        !self.slot_mappings_by_group(gid).is_empty()
    }

    /// A group is locked only at the promotion fence.
    pub fn is_group_locked(&self, gid: u16) -> bool {
        self.groups
            .get(&gid)
            .is_some_and(|g| g.promoting.state == PromotingState::Prepared)
    }

    pub fn is_group_promoting(&self, gid: u16) -> bool {
        self.groups
            .get(&gid)
            .is_some_and(|g| g.promoting.state != PromotingState::Nothing)
    }

    pub fn is_slot_locked(&self, m: &SlotMapping) -> bool {
        match m.action.state {
            SlotActionState::Nothing | SlotActionState::Pending | SlotActionState::Preparing => {
                self.is_group_locked(m.group_id)
            }
            SlotActionState::Prepared => true,
            SlotActionState::Migrating => {
                self.is_group_locked(m.group_id) || self.is_group_locked(m.action.target_id)
            }
            SlotActionState::Finished => self.is_group_locked(m.action.target_id),
        }
    }

    /// Routing view of `m` as pushed to proxies.
    pub fn to_slot(&self, m: &SlotMapping) -> Slot {
        let mut slot = Slot {
            id: m.id,
            locked: self.is_slot_locked(m),
            ..Default::default()
        };
        match m.action.state {
            SlotActionState::Nothing | SlotActionState::Pending | SlotActionState::Preparing => {
                slot.backend_addr = self.group_master(m.group_id).to_owned();
                slot.backend_addr_group_id = m.group_id;
            }
            SlotActionState::Prepared | SlotActionState::Migrating => {
                slot.backend_addr = self.group_master(m.action.target_id).to_owned();
                slot.backend_addr_group_id = m.action.target_id;
                slot.migrate_from = self.group_master(m.group_id).to_owned();
                slot.migrate_from_group_id = m.group_id;
            }
            SlotActionState::Finished => {
                slot.backend_addr = self.group_master(m.action.target_id).to_owned();
                slot.backend_addr_group_id = m.action.target_id;
            }
        }
        slot
    }

    pub fn to_slots(&self, mappings: &[&SlotMapping]) -> Vec<Slot> {
        mappings.iter().map(|m| self.to_slot(m)).collect()
    }

    /// Routing views for all slots.
    pub fn all_slots(&self) -> Vec<Slot> {
        self.slots.iter().map(|m| self.to_slot(m)).collect()
    }

    pub fn proxy(&self, token: &str) -> Result<&Proxy, TopomError> {
        self.proxies
            .get(token)
            .ok_or_else(|| TopomError::NotFound(format!("proxy-[{token}] doesn't exist")))
    }

    pub fn max_proxy_id(&self) -> u32 {
        self.proxies.values().map(|p| p.id).max().unwrap_or(0)
    }

    /// Largest sync index in use, counting queued and running actions.
    pub fn max_sync_action_index(&self) -> u64 {
        self.sync_actions(|state| state != SyncActionState::Nothing)
            .map(|(_, idx)| idx)
            .max()
            .unwrap_or(0)
    }

    /// Pending replica with the smallest sync index.
    pub fn min_sync_action(&self) -> Option<(&str, u64)> {
        self.sync_actions(|state| state == SyncActionState::Pending)
            .min_by_key(|&(_, idx)| idx)
    }

    /// Replica left `syncing` by an earlier run, smallest index first.
    pub fn min_syncing_action(&self) -> Option<(&str, u64)> {
        self.sync_actions(|state| state == SyncActionState::Syncing)
            .min_by_key(|&(_, idx)| idx)
    }

    fn sync_actions<F>(&self, keep: F) -> impl Iterator<Item = (&str, u64)>
    where
        F: Fn(SyncActionState) -> bool,
    {
        self.groups
            .values()
            .flat_map(|g| g.servers.iter())
            .filter(move |s| keep(s.action.state))
            .map(|s| (s.addr.as_str(), s.action.index))
    }
}
