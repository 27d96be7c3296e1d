//! Replica groups and master promotion.
//!
//! Promotion is a small two-phase commit inside one group:
//!
//! ```text
//! nothing → preparing → prepared → finished → nothing
//! ```
//!
//! `prepared` locks every slot touching the group, so proxies stop
//! sending traffic while the replication topology is rewritten.

use topom_models::{Group, GroupServer, Promoting, PromotingState, SyncActionState};
use tracing::{info, warn};

use crate::error::{precondition, TopomError};
use crate::redis::split_host_port;
use crate::topom::Topom;

impl Topom {
    pub async fn create_group(&self, gid: u16) -> Result<(), TopomError> {
        if !Group::is_valid_id(gid) {
            return precondition!("invalid group id = {gid}, out of range");
        }
        let (mut cache, ctx) = self.begin_settled().await?;
        if ctx.groups.contains_key(&gid) {
            return precondition!("group-[{gid}] already exists");
        }
        cache.create_group(&Group::new(gid)).await?;
        cache.dirty_group(gid);
        Ok(())
    }

    /// Deletes an empty group no slot refers to.
    pub async fn remove_group(&self, gid: u16) -> Result<(), TopomError> {
        let (mut cache, ctx) = self.begin_settled().await?;
        let g = ctx.group(gid)?;
        if !g.servers.is_empty() {
            return precondition!("group-[{gid}] isn't empty");
        }
        if ctx.is_group_in_use(gid) {
            return precondition!("group-[{gid}] is still in use");
        }
        cache.remove_group(g).await?;
        cache.dirty_group(gid);
        Ok(())
    }

    /// Appends `addr` to group `gid`. The first server becomes master.
    pub async fn group_add_server(&self, gid: u16, addr: &str) -> Result<(), TopomError> {
        if let Err(e) = split_host_port(addr) {
            return precondition!("invalid server address: {e}");
        }
        let (mut cache, ctx) = self.begin_settled().await?;
        if let Ok((g, _)) = ctx.group_by_server(addr) {
            return precondition!("server-[{addr}] already exists in group-[{}]", g.id);
        }
        let g = ctx.group(gid)?;
        if g.promoting.state != PromotingState::Nothing {
            return precondition!("group-[{gid}] is promoting");
        }
        let mut g = g.clone();
        g.servers.push(GroupServer::new(addr));
        cache.update_group(&g).await?;
        cache.dirty_group(gid);
        Ok(())
    }

    /// Removes `addr` from group `gid`.
    ///
    /// The master can only go when it is the last server and no slot
    /// refers to the group.
    pub async fn group_del_server(&self, gid: u16, addr: &str) -> Result<(), TopomError> {
        let (mut cache, ctx) = self.begin_settled().await?;
        let (g, index) = ctx.group_by_server(addr)?;
        if g.id != gid {
            return precondition!("server-[{addr}] belongs to group-[{}]", g.id);
        }
        if g.promoting.state != PromotingState::Nothing {
            return precondition!("group-[{gid}] is promoting");
        }
        if index == 0 && (g.servers.len() != 1 || ctx.is_group_in_use(gid)) {
            return precondition!("group-[{gid}] can't remove master, still in use");
        }
        if g.servers[index].action.state != SyncActionState::Nothing {
            return precondition!("server-[{addr}] action is not empty");
        }
        let mut g = g.clone();
        g.servers.remove(index);
        cache.update_group(&g).await?;
        cache.dirty_group(gid);
        Ok(())
    }

    /// Starts promoting replica `addr` to master of group `gid`.
    ///
    /// Nothing moves until [`group_promote_commit`](Self::group_promote_commit).
    pub async fn group_promote_server(&self, gid: u16, addr: &str) -> Result<(), TopomError> {
        let (mut cache, ctx) = self.begin_settled().await?;
        let (g, index) = ctx.group_by_server(addr)?;
        if g.id != gid {
            return precondition!("server-[{addr}] belongs to group-[{}]", g.id);
        }
        if g.promoting.state != PromotingState::Nothing {
            return precondition!("group-[{gid}] is promoting");
        }
        if index == 0 {
            return precondition!("group-[{gid}] can't promote master");
        }
        if let Some(s) = g
            .servers
            .iter()
            .find(|s| s.action.state != SyncActionState::Nothing)
        {
            return precondition!("server-[{}] action is not empty", s.addr);
        }
        if self.action.executor.load(std::sync::atomic::Ordering::Acquire) {
            return precondition!("slots-migration is running");
        }
        let mut g = g.clone();
        g.promoting = Promoting {
            index,
            state: PromotingState::Preparing,
        };
        cache.update_group(&g).await?;
        cache.dirty_group(gid);
        Ok(())
    }

    /// Drives a started promotion of group `gid` to the end.
    ///
    /// Safe to call again after any failure: each phase resumes from the
    /// persisted promoting state. A group that isn't promoting is left
    /// alone.
    pub async fn group_promote_commit(&self, gid: u16) -> Result<(), TopomError> {
        let (mut cache, mut ctx) = self.begin_settled().await?;
        let mut g = ctx.group(gid)?.clone();

        if g.promoting.state == PromotingState::Preparing {
            let unlocked = ctx.to_slots(&ctx.slot_mappings_by_group(gid));
            let mut fenced = ctx.clone();
            if let Some(fg) = fenced.groups.get_mut(&gid) {
                fg.promoting.state = PromotingState::Prepared;
            }
            let locked = fenced.to_slots(&fenced.slot_mappings_by_group(gid));

            warn!(gid, "group-[{gid}] resync to prepared");
            if let Err(e) = self.resync_slots(&ctx, &locked).await {
                warn!(gid, "group-[{gid}] resync to prepared failed, rollback");
                if let Err(e) = self.resync_slots(&ctx, &unlocked).await {
                    warn!(gid, "group-[{gid}] resync-rollback to preparing failed: {e}");
                }
                return Err(e);
            }
            g.promoting.state = PromotingState::Prepared;
            cache.update_group(&g).await?;
            cache.dirty_group(gid);
            ctx = fenced;
        }

        if g.promoting.state == PromotingState::Prepared {
            let index = g.promoting.index;
            if index == 0 || index >= g.servers.len() {
                panic!(
                    "group-[{gid}] is promoting an invalid server:\n{}",
                    String::from_utf8_lossy(&topom_models::encode(&g))
                );
            }
            let promoted = g.servers.remove(index);
            g.servers.insert(0, GroupServer::new(promoted.addr));
            for s in &mut g.servers {
                s.action = Default::default();
            }
            g.promoting = Promoting {
                index: 0,
                state: PromotingState::Finished,
            };
            g.out_of_sync = true;
            cache.update_group(&g).await?;
            cache.dirty_group(gid);
            if let Some(cg) = ctx.groups.get_mut(&gid) {
                *cg = g.clone();
            }
        }

        if g.promoting.state == PromotingState::Finished {
            self.rewire_group(&g).await;

            let mut done = ctx.clone();
            if let Some(dg) = done.groups.get_mut(&gid) {
                dg.promoting = Promoting::default();
            }
            warn!(gid, "group-[{gid}] resync to finished");
            let slots = done.to_slots(&done.slot_mappings_by_group(gid));
            self.resync_slots(&done, &slots).await.inspect_err(|_| {
                warn!(gid, "group-[{gid}] resync to finished failed");
            })?;

            g.promoting = Promoting::default();
            cache.update_group(&g).await?;
            cache.dirty_group(gid);
            info!(gid, master = g.master(), "group-[{gid}] promotion done");
        }
        Ok(())
    }

    /// Points the group's replicas at its master. Failures are logged;
    /// the sync dispatcher or an operator can repair them later.
    async fn rewire_group(&self, g: &Group) {
        let master = g.master();
        for (i, s) in g.servers.iter().enumerate() {
            let target = if i == 0 { "" } else { master };
            let result = async {
                let mut c = self.pool.get_client(&s.addr).await?;
                let r = c.set_master(target).await;
                self.pool.put_client(c);
                r
            }
            .await;
            match result {
                Ok(()) if i == 0 => info!(gid = g.id, "redis {} set master to NO:ONE", s.addr),
                Ok(()) => info!(gid = g.id, "redis {} set master to {master}", s.addr),
                Err(e) => warn!(gid = g.id, "redis {} set master failed: {e}", s.addr),
            }
        }
    }

    /// Pushes the slot views of group `gid` to every proxy again and
    /// clears its `out_of_sync` flag.
    pub async fn resync_group(&self, gid: u16) -> Result<(), TopomError> {
        let (mut cache, ctx) = self.begin_settled().await?;
        let g = ctx.group(gid)?;
        if g.promoting.state != PromotingState::Nothing {
            return precondition!("group-[{gid}] is promoting");
        }
        let slots = ctx.to_slots(&ctx.slot_mappings_by_group(gid));
        self.resync_slots(&ctx, &slots).await?;
        if g.out_of_sync {
            let mut g = g.clone();
            g.out_of_sync = false;
            cache.update_group(&g).await?;
            cache.dirty_group(gid);
        }
        Ok(())
    }
}
