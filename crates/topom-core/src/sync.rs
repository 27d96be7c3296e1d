//! Replica re-sync actions.
//!
//! A sync action points one replica back at its group's master with
//! `SLAVEOF`. Actions queue as `pending`, run one at a time in index
//! order as `syncing`, and go back to `pending` if the command fails.

use topom_models::{GroupServer, PromotingState, SyncAction, SyncActionState};
use tracing::{info, warn};

use crate::error::{precondition, TopomError};
use crate::topom::Topom;

impl Topom {
    /// Queues a re-sync of replica `addr`.
    pub async fn sync_create_action(&self, addr: &str) -> Result<(), TopomError> {
        let (mut cache, ctx) = self.begin().await?;
        let (g, index) = ctx.group_by_server(addr)?;
        if g.promoting.state != PromotingState::Nothing {
            return precondition!("group-[{}] is promoting", g.id);
        }
        if index == 0 {
            return precondition!("server-[{addr}] is the master of group-[{}]", g.id);
        }
        if g.servers[index].action.state != SyncActionState::Nothing {
            return precondition!("server-[{addr}] action already exists");
        }
        let mut g = g.clone();
        g.servers[index].action = SyncAction {
            index: ctx.max_sync_action_index() + 1,
            state: SyncActionState::Pending,
        };
        cache.update_group(&g).await?;
        cache.dirty_group(g.id);
        Ok(())
    }

    /// Drops a queued re-sync. Only `pending` actions can be removed.
    pub async fn sync_remove_action(&self, addr: &str) -> Result<(), TopomError> {
        let (mut cache, ctx) = self.begin().await?;
        let (g, index) = ctx.group_by_server(addr)?;
        if g.promoting.state != PromotingState::Nothing {
            return precondition!("group-[{}] is promoting", g.id);
        }
        if g.servers[index].action.state != SyncActionState::Pending {
            return precondition!("server-[{addr}] action can't be removed");
        }
        let mut g = g.clone();
        g.servers[index] = GroupServer::new(addr);
        cache.update_group(&g).await?;
        cache.dirty_group(g.id);
        Ok(())
    }

    /// Picks the next replica to sync and returns its address, or `None`
    /// when nothing is queued.
    ///
    /// A replica left `syncing` by an interrupted run is resumed before
    /// any pending one is moved to `syncing`.
    pub async fn sync_action_prepare(&self) -> Result<Option<String>, TopomError> {
        let (mut cache, ctx) = self.begin().await?;
        if let Some((addr, _)) = ctx.min_syncing_action() {
            let (g, _) = ctx.group_by_server(addr)?;
            if g.promoting.state != PromotingState::Nothing {
                return Ok(None);
            }
            info!(gid = g.id, "server-[{addr}] action resume");
            return Ok(Some(addr.to_owned()));
        }
        let Some((addr, _)) = ctx.min_sync_action() else {
            return Ok(None);
        };
        let (g, index) = ctx.group_by_server(addr)?;
        if g.promoting.state != PromotingState::Nothing {
            return Ok(None);
        }
        let mut g = g.clone();
        g.servers[index].action.state = SyncActionState::Syncing;
        info!(gid = g.id, "server-[{addr}] action prepare");
        cache.update_group(&g).await?;
        cache.dirty_group(g.id);
        Ok(Some(addr.to_owned()))
    }

    /// Finishes the action of `addr`. A failed action is queued again
    /// with its old index.
    pub async fn sync_action_complete(&self, addr: &str, failed: bool) -> Result<(), TopomError> {
        let (mut cache, ctx) = self.begin().await?;
        let (g, index) = ctx.group_by_server(addr)?;
        match g.servers[index].action.state {
            SyncActionState::Nothing => return Ok(()),
            SyncActionState::Pending => {
                return precondition!("server-[{addr}] action isn't syncing");
            }
            SyncActionState::Syncing => {}
        }
        let mut g = g.clone();
        if failed {
            g.servers[index].action.state = SyncActionState::Pending;
        } else {
            g.servers[index] = GroupServer::new(addr);
        }
        info!(gid = g.id, failed, "server-[{addr}] action complete");
        cache.update_group(&g).await?;
        cache.dirty_group(g.id);
        Ok(())
    }

    /// `SLAVEOF <master>` on replica `addr`.
    async fn sync_action_execute(&self, addr: &str) -> Result<(), TopomError> {
        let master = {
            let (_cache, ctx) = self.begin().await?;
            let (g, index) = ctx.group_by_server(addr)?;
            if index == 0 {
                return precondition!("server-[{addr}] is the master of group-[{}]", g.id);
            }
            g.master().to_owned()
        };
        let mut c = self
            .pool
            .get_client(addr)
            .await
            .map_err(|e| TopomError::backend(addr, e))?;
        let result = c.set_master(&master).await;
        self.pool.put_client(c);
        result.map_err(|e| TopomError::backend(addr, e))
    }

    /// Runs the next queued re-sync, if any. Returns the replica synced.
    pub async fn process_sync_action(&self) -> Result<Option<String>, TopomError> {
        let Some(addr) = self.sync_action_prepare().await? else {
            return Ok(None);
        };
        let result = self.sync_action_execute(&addr).await;
        if let Err(e) = &result {
            warn!("server-[{addr}] sync action failed: {e}");
        }
        self.sync_action_complete(&addr, result.is_err()).await?;
        result.map(|()| Some(addr))
    }
}
