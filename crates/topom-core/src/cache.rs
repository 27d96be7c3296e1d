//! Lazily refilled copy of the store.
//!
//! Mutations write the store first and then queue a [`DirtyHook`]. The
//! next [`Cache::refill`] drains the hooks in order, forgets the
//! affected entries and reloads just those. If a store write fails the
//! entry is never marked dirty, so the cache keeps the old value.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use topom_models::{encode, Group, Proxy, Sentinel, SlotMapping, Store, MAX_SLOT_NUM};
use tracing::{error, warn};

use crate::context::Context;
use crate::error::TopomError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum DirtyHook {
    Slot(u16),
    Group(u16),
    Proxy { token: String, id: u32 },
    Sentinel,
    All,
}

#[derive(Debug)]
pub struct Cache {
    store: Store,
    hooks: VecDeque<DirtyHook>,
    slots: Option<Vec<Option<SlotMapping>>>,
    groups: Option<BTreeMap<u16, Option<Group>>>,
    /// Keyed by token; the id is kept so a dirty entry can be reloaded
    /// from its path.
    proxies: Option<HashMap<String, (u32, Option<Proxy>)>>,
    sentinel: Option<Sentinel>,
    /// Slots whose cached view was put back after a failed push while
    /// the store kept the forward write.
    unsettled: BTreeSet<u16>,
}

impl Cache {
    pub fn new(store: Store) -> Self {
        Cache {
            store,
            hooks: VecDeque::new(),
            slots: None,
            groups: None,
            proxies: None,
            sentinel: None,
            unsettled: BTreeSet::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn dirty_slot(&mut self, sid: u16) {
        self.hooks.push_back(DirtyHook::Slot(sid));
    }

    pub fn dirty_group(&mut self, gid: u16) {
        self.hooks.push_back(DirtyHook::Group(gid));
    }

    pub fn dirty_proxy(&mut self, p: &Proxy) {
        self.hooks.push_back(DirtyHook::Proxy {
            token: p.token.clone(),
            id: p.id,
        });
    }

    pub fn dirty_sentinel(&mut self) {
        self.hooks.push_back(DirtyHook::Sentinel);
    }

    pub fn dirty_all(&mut self) {
        self.hooks.push_back(DirtyHook::All);
    }

    /// Overwrites a cached mapping without touching the store.
    ///
    /// Used for optimistic updates that are broadcast before they are
    /// persisted, and to restore the pre-call view after a failed
    /// broadcast.
    pub fn set_slot(&mut self, m: SlotMapping) {
        if let Some(slot) = self
            .slots
            .as_mut()
            .and_then(|slots| slots.get_mut(m.id as usize))
        {
            *slot = Some(m);
        }
    }

    /// Restores the pre-call view of a slot after a failed push. The
    /// slot stays unsettled until [`settle`](Self::settle) reloads it.
    pub fn rollback_slot(&mut self, m: SlotMapping) {
        self.unsettled.insert(m.id);
        self.set_slot(m);
    }

    /// Queues a reload of every unsettled slot. Returns false if there
    /// was none.
    pub fn settle(&mut self) -> bool {
        if self.unsettled.is_empty() {
            return false;
        }
        for sid in std::mem::take(&mut self.unsettled) {
            self.hooks.push_back(DirtyHook::Slot(sid));
        }
        true
    }

    fn apply(&mut self, hook: DirtyHook) {
        match hook {
            DirtyHook::Slot(sid) => {
                self.unsettled.remove(&sid);
                if let Some(slot) = self.slots.as_mut().and_then(|s| s.get_mut(sid as usize)) {
                    *slot = None;
                }
            }
            DirtyHook::Group(gid) => {
                if let Some(groups) = self.groups.as_mut() {
                    groups.insert(gid, None);
                }
            }
            DirtyHook::Proxy { token, id } => {
                if let Some(proxies) = self.proxies.as_mut() {
                    proxies.insert(token, (id, None));
                }
            }
            DirtyHook::Sentinel => self.sentinel = None,
            DirtyHook::All => {
                self.unsettled.clear();
                self.slots = None;
                self.groups = None;
                self.proxies = None;
                self.sentinel = None;
            }
        }
    }

    /// Applies pending hooks and reloads every forgotten entry.
    pub async fn refill(&mut self) -> Result<(), TopomError> {
        while let Some(hook) = self.hooks.pop_front() {
            self.apply(hook);
        }
        self.refill_slots().await.inspect_err(|e| {
            error!("store: load slots failed: {e}");
        })?;
        self.refill_groups().await.inspect_err(|e| {
            error!("store: load group failed: {e}");
        })?;
        self.refill_proxies().await.inspect_err(|e| {
            error!("store: load proxy failed: {e}");
        })?;
        if self.sentinel.is_none() {
            let s = self.store.load_sentinel(false).await.inspect_err(|e| {
                error!("store: load sentinel failed: {e}");
            })?;
            self.sentinel = Some(s.unwrap_or_default());
        }
        Ok(())
    }

    async fn refill_slots(&mut self) -> Result<(), TopomError> {
        let Some(slots) = self.slots.as_mut() else {
            let all = self.store.slot_mappings().await?;
            self.slots = Some(all.into_iter().map(Some).collect());
            return Ok(());
        };
        for (sid, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                let sid = sid as u16;
                let m = self.store.load_slot_mapping(sid, false).await?;
                *slot = Some(m.unwrap_or_else(|| SlotMapping::empty(sid)));
            }
        }
        Ok(())
    }

    async fn refill_groups(&mut self) -> Result<(), TopomError> {
        let Some(groups) = self.groups.as_mut() else {
            let all = self.store.list_group().await?;
            self.groups = Some(all.into_iter().map(|(gid, g)| (gid, Some(g))).collect());
            return Ok(());
        };
        let missing: Vec<u16> = groups
            .iter()
            .filter(|(_, g)| g.is_none())
            .map(|(&gid, _)| gid)
            .collect();
        for gid in missing {
            match self.store.load_group(gid, false).await? {
                Some(g) => groups.insert(gid, Some(g)),
                None => groups.remove(&gid),
            };
        }
        Ok(())
    }

    async fn refill_proxies(&mut self) -> Result<(), TopomError> {
        let Some(proxies) = self.proxies.as_mut() else {
            let all = self.store.list_proxy().await?;
            self.proxies = Some(
                all.into_iter()
                    .map(|(token, p)| (token, (p.id, Some(p))))
                    .collect(),
            );
            return Ok(());
        };
        let missing: Vec<(String, u32)> = proxies
            .iter()
            .filter(|(_, (_, p))| p.is_none())
            .map(|(token, (id, _))| (token.clone(), *id))
            .collect();
        for (token, id) in missing {
            match self.store.load_proxy(id, false).await? {
                Some(p) if p.token == token => {
                    proxies.insert(token, (id, Some(p)));
                }
                _ => {
                    proxies.remove(&token);
                }
            }
        }
        Ok(())
    }

    /// Snapshot of the cache. Call after [`refill`](Self::refill).
    pub fn context(&self) -> Context {
        let slots = match &self.slots {
            Some(slots) => slots
                .iter()
                .enumerate()
                .map(|(sid, m)| m.clone().unwrap_or_else(|| SlotMapping::empty(sid as u16)))
                .collect(),
            None => (0..MAX_SLOT_NUM as u16).map(SlotMapping::empty).collect(),
        };
        let groups = self
            .groups
            .iter()
            .flatten()
            .filter_map(|(&gid, g)| g.clone().map(|g| (gid, g)))
            .collect();
        let proxies = self
            .proxies
            .iter()
            .flatten()
            .filter_map(|(token, (_, p))| p.clone().map(|p| (token.clone(), p)))
            .collect();
        Context {
            slots,
            groups,
            proxies,
            sentinel: self.sentinel.clone().unwrap_or_default(),
        }
    }

    pub async fn update_slot_mapping(&self, m: &SlotMapping) -> Result<(), TopomError> {
        m.assert_consistent();
        audit("update", &format!("slot-[{}]", m.id), m);
        self.store.update_slot_mapping(m).await.map_err(|e| {
            error!(sid = m.id, "store: update slot-[{}] failed: {e}", m.id);
            TopomError::Store(e)
        })
    }

    pub async fn create_group(&self, g: &Group) -> Result<(), TopomError> {
        audit("create", &format!("group-[{}]", g.id), g);
        self.store.update_group(g).await.map_err(|e| {
            error!(gid = g.id, "store: create group-[{}] failed: {e}", g.id);
            TopomError::Store(e)
        })
    }

    pub async fn update_group(&self, g: &Group) -> Result<(), TopomError> {
        audit("update", &format!("group-[{}]", g.id), g);
        self.store.update_group(g).await.map_err(|e| {
            error!(gid = g.id, "store: update group-[{}] failed: {e}", g.id);
            TopomError::Store(e)
        })
    }

    pub async fn remove_group(&self, g: &Group) -> Result<(), TopomError> {
        audit("remove", &format!("group-[{}]", g.id), g);
        self.store.delete_group(g.id).await.map_err(|e| {
            error!(gid = g.id, "store: remove group-[{}] failed: {e}", g.id);
            TopomError::Store(e)
        })
    }

    pub async fn create_proxy(&self, p: &Proxy) -> Result<(), TopomError> {
        audit("create", &format!("proxy-[{}]", p.token), p);
        self.store.update_proxy(p).await.map_err(|e| {
            error!(token = %p.token, "store: create proxy-[{}] failed: {e}", p.token);
            TopomError::Store(e)
        })
    }

    pub async fn remove_proxy(&self, p: &Proxy) -> Result<(), TopomError> {
        audit("remove", &format!("proxy-[{}]", p.token), p);
        self.store.delete_proxy(p.id).await.map_err(|e| {
            error!(token = %p.token, "store: remove proxy-[{}] failed: {e}", p.token);
            TopomError::Store(e)
        })
    }

    pub async fn update_sentinel(&self, s: &Sentinel) -> Result<(), TopomError> {
        audit("update", "sentinel", s);
        self.store.update_sentinel(s).await.map_err(|e| {
            error!("store: update sentinel failed: {e}");
            TopomError::Store(e)
        })
    }
}

fn audit<T: serde::Serialize>(verb: &str, what: &str, value: &T) {
    warn!(
        "{verb} {what}:\n{}",
        String::from_utf8_lossy(&encode(value))
    );
}
