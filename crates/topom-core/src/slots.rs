//! Slot migration actions.
//!
//! An action walks `pending → preparing → prepared → migrating →
//! finished` and then disappears, leaving the slot owned by the target
//! group. `prepared` is the fence: proxies hold every request for the
//! slot until they learn it is `migrating`.
//!
//! Actions run one at a time in ascending index order. Moving keys
//! happens outside the controller mutex under the executor claim.

use std::sync::atomic::Ordering;

use topom_models::{Group, SlotAction, SlotActionState, SlotMapping, MAX_SLOT_NUM};
use tracing::{info, warn};

use crate::context::Context;
use crate::error::{precondition, TopomError};
use crate::topom::{ExecutorGuard, Topom};

/// Outcome of one migration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStep {
    /// The slot is fenced by a promotion or another step is in flight.
    Retry,
    /// Keys are still left on the source.
    Incomplete(u64),
    /// The source holds no more keys of the slot.
    Complete,
}

fn check_slot_id(sid: u16) -> Result<(), TopomError> {
    if sid as usize >= MAX_SLOT_NUM {
        return precondition!("invalid slot id = {sid}, out of range");
    }
    Ok(())
}

fn check_target(m: &SlotMapping, gid: u16) -> Result<(), TopomError> {
    if m.action.state != SlotActionState::Nothing {
        return precondition!("slot-[{}] action already exists", m.id);
    }
    if m.group_id == gid {
        return precondition!("slot-[{}] already in group-[{gid}]", m.id);
    }
    Ok(())
}

fn check_target_group(ctx: &Context, gid: u16) -> Result<&Group, TopomError> {
    let g = ctx.group(gid)?;
    if g.servers.is_empty() {
        return precondition!("group-[{gid}] is empty");
    }
    Ok(g)
}

impl Topom {
    /// Queues a migration of slot `sid` to group `gid`.
    pub async fn slot_create_action(&self, sid: u16, gid: u16) -> Result<(), TopomError> {
        check_slot_id(sid)?;
        let (mut cache, ctx) = self.begin_settled().await?;
        check_target_group(&ctx, gid)?;
        let m = ctx.slot_mapping(sid)?;
        check_target(m, gid)?;

        let n = SlotMapping {
            id: sid,
            group_id: m.group_id,
            action: SlotAction {
                index: ctx.max_slot_action_index() + 1,
                state: SlotActionState::Pending,
                target_id: gid,
            },
        };
        cache.update_slot_mapping(&n).await?;
        cache.dirty_slot(sid);
        Ok(())
    }

    /// Queues migrations of slots `beg..=end` to group `gid`.
    ///
    /// Slots already owned by `gid` are skipped. Every other slot in the
    /// range must be idle, otherwise nothing is queued.
    pub async fn slot_create_action_range(&self, beg: u16, end: u16, gid: u16) -> Result<(), TopomError> {
        check_slot_id(beg)?;
        check_slot_id(end)?;
        if beg > end {
            return precondition!("invalid slot range [{beg},{end}]");
        }
        let (mut cache, ctx) = self.begin_settled().await?;
        check_target_group(&ctx, gid)?;

        for sid in beg..=end {
            let m = ctx.slot_mapping(sid)?;
            if m.group_id == gid && m.action.state == SlotActionState::Nothing {
                continue;
            }
            check_target(m, gid)?;
        }

        let first = ctx.max_slot_action_index();
        let mut index = first;
        for sid in beg..=end {
            let m = ctx.slot_mapping(sid)?;
            if m.group_id == gid && m.action.state == SlotActionState::Nothing {
                continue;
            }
            index += 1;
            let n = SlotMapping {
                id: sid,
                group_id: m.group_id,
                action: SlotAction {
                    index,
                    state: SlotActionState::Pending,
                    target_id: gid,
                },
            };
            cache.update_slot_mapping(&n).await?;
            cache.dirty_slot(sid);
        }
        info!(beg, end, gid, queued = index - first, "slot actions created");
        Ok(())
    }

    /// Drops a queued action. Only `pending` actions can be removed.
    pub async fn slot_remove_action(&self, sid: u16) -> Result<(), TopomError> {
        check_slot_id(sid)?;
        let (mut cache, ctx) = self.begin_settled().await?;
        let m = ctx.slot_mapping(sid)?;
        match m.action.state {
            SlotActionState::Nothing => return precondition!("slot-[{sid}] action doesn't exist"),
            SlotActionState::Pending => {}
            _ => return precondition!("slot-[{sid}] action isn't pending"),
        }
        let n = SlotMapping {
            id: sid,
            group_id: m.group_id,
            action: SlotAction::default(),
        };
        cache.update_slot_mapping(&n).await?;
        cache.dirty_slot(sid);
        Ok(())
    }

    /// Picks the next action and drives it up to `migrating`.
    ///
    /// Started actions are resumed before any pending one is begun, and
    /// pending ones are only begun while the engine is enabled. Returns
    /// the slot id, or `None` when there is nothing to do.
    ///
    /// Each forward step is persisted and then pushed to every proxy. If
    /// a push fails, proxies are sent the previous view again and the
    /// cached mapping is put back as it was when this call started; the
    /// store keeps the forward write. The next slot operation reloads the
    /// slot from the store before deciding anything.
    pub async fn slot_action_prepare(&self) -> Result<Option<u16>, TopomError> {
        let (mut cache, ctx) = self.begin_settled().await?;

        let picked = match ctx.min_started_slot_action() {
            Some(m) => Some(m),
            None if self.slot_action_disabled() => None,
            None => ctx.min_pending_slot_action(),
        };
        let Some(origin) = picked.cloned() else {
            return Ok(None);
        };
        origin.assert_consistent();
        let sid = origin.id;

        let mut m = origin.clone();
        loop {
            let next = match m.action.state {
                SlotActionState::Pending => SlotActionState::Preparing,
                SlotActionState::Preparing => SlotActionState::Prepared,
                SlotActionState::Prepared => SlotActionState::Migrating,
                SlotActionState::Migrating | SlotActionState::Finished => break,
                SlotActionState::Nothing => unreachable!("picked slot-[{sid}] has no action"),
            };
            let prev = m.clone();
            m.action.state = next;
            warn!(sid, "slot-[{sid}] resync to {next}");

            cache.update_slot_mapping(&m).await?;
            if let Err(e) = self.resync_slots(&ctx, &[ctx.to_slot(&m)]).await {
                warn!(sid, "slot-[{sid}] resync to {next} failed, rollback to {}", prev.action.state);
                if let Err(e) = self.resync_slots(&ctx, &[ctx.to_slot(&prev)]).await {
                    warn!(sid, "slot-[{sid}] resync-rollback failed: {e}");
                }
                cache.rollback_slot(origin);
                return Err(e);
            }
        }
        if m != origin {
            cache.dirty_slot(sid);
        }
        Ok(Some(sid))
    }

    /// Moves one batch of keys of slot `sid`.
    ///
    /// Returns [`SlotStep::Retry`] while either group is promoting or
    /// another step holds the executor.
    pub async fn slot_action_execute(&self, sid: u16) -> Result<SlotStep, TopomError> {
        check_slot_id(sid)?;
        let (from, dest, _guard) = {
            let (_cache, ctx) = self.begin_settled().await?;
            let m = ctx.slot_mapping(sid)?;
            match m.action.state {
                SlotActionState::Migrating => {}
                SlotActionState::Finished => return Ok(SlotStep::Complete),
                state => return precondition!("slot-[{sid}] action state '{state}' is invalid"),
            }
            if ctx.is_slot_locked(m)
                || ctx.is_group_promoting(m.group_id)
                || ctx.is_group_promoting(m.action.target_id)
            {
                return Ok(SlotStep::Retry);
            }
            let Some(guard) = ExecutorGuard::try_claim(&self.action.executor) else {
                return Ok(SlotStep::Retry);
            };
            (
                ctx.group_master(m.group_id).to_owned(),
                ctx.group_master(m.action.target_id).to_owned(),
                guard,
            )
        };
        metrics::gauge!("topom_slot_action_executor").set(1.0);
        let result = self.migrate_batch(sid, &from, &dest).await;
        metrics::gauge!("topom_slot_action_executor").set(0.0);
        result
    }

    async fn migrate_batch(&self, sid: u16, from: &str, dest: &str) -> Result<SlotStep, TopomError> {
        if from.is_empty() {
            return Ok(SlotStep::Complete);
        }
        if dest.is_empty() {
            return precondition!("slot-[{sid}] migration target has no master");
        }
        let mut c = self
            .pool
            .get_client(from)
            .await
            .map_err(|e| TopomError::backend(from, e))?;
        let result = c
            .migrate_slot(sid, dest, self.config.migration_timeout())
            .await;
        self.pool.put_client(c);
        match result.map_err(|e| TopomError::backend(from, e))? {
            0 => Ok(SlotStep::Complete),
            n => Ok(SlotStep::Incomplete(n)),
        }
    }

    /// Finishes the action of slot `sid` after its keys are moved.
    ///
    /// `migrating` is pushed as `finished` and persisted; `finished` is
    /// pushed again and the slot is handed to the target group. A slot
    /// with no action is left alone.
    pub async fn slot_action_complete(&self, sid: u16) -> Result<(), TopomError> {
        check_slot_id(sid)?;
        let (mut cache, ctx) = self.begin_settled().await?;
        let mut m = ctx.slot_mapping(sid)?.clone();
        m.assert_consistent();

        match m.action.state {
            SlotActionState::Nothing => return Ok(()),
            SlotActionState::Migrating => {
                m.action.state = SlotActionState::Finished;
                warn!(sid, "slot-[{sid}] resync to finished");
                self.resync_slots(&ctx, &[ctx.to_slot(&m)]).await?;
                cache.update_slot_mapping(&m).await?;
                cache.dirty_slot(sid);
            }
            SlotActionState::Finished => {}
            state => return precondition!("slot-[{sid}] action state '{state}' is invalid"),
        }

        warn!(sid, "slot-[{sid}] resync to finished, then clear");
        self.resync_slots(&ctx, &[ctx.to_slot(&m)]).await?;
        // no push for the handover: its routing view equals `finished`
        let n = SlotMapping {
            id: sid,
            group_id: m.action.target_id,
            action: SlotAction::default(),
        };
        cache.update_slot_mapping(&n).await?;
        cache.dirty_slot(sid);
        metrics::counter!("topom_slot_actions_completed_total").increment(1);
        Ok(())
    }

    /// Drives the next action through to the end.
    ///
    /// Returns `Ok(None)` when nothing is queued.
    pub async fn process_slot_action(&self) -> Result<Option<u16>, TopomError> {
        let Some(sid) = self.slot_action_prepare().await? else {
            return Ok(None);
        };
        let result = self.drive_slot_action(sid).await;
        match &result {
            Ok(()) => {
                self.action.remain.store(0, Ordering::Relaxed);
                self.action.failed.store(false, Ordering::Relaxed);
                metrics::gauge!("topom_slot_action_remain").set(0.0);
            }
            Err(_) => self.action.failed.store(true, Ordering::Relaxed),
        }
        result.map(|()| Some(sid))
    }

    async fn drive_slot_action(&self, sid: u16) -> Result<(), TopomError> {
        while !self.is_closed() {
            match self.slot_action_execute(sid).await? {
                SlotStep::Retry => tokio::time::sleep(std::time::Duration::from_secs(1)).await,
                SlotStep::Incomplete(n) => {
                    self.action.remain.store(n, Ordering::Relaxed);
                    self.action.failed.store(false, Ordering::Relaxed);
                    metrics::gauge!("topom_slot_action_remain").set(n as f64);
                    let ms = self.slot_action_interval();
                    if ms != 0 {
                        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                    }
                }
                SlotStep::Complete => return self.slot_action_complete(sid).await,
            }
        }
        Err(TopomError::Closed)
    }
}
