//! Slot migrations end to end: keys move, proxies see every phase, and
//! a rejected push leaves the queue resumable.

use std::time::Duration;

use topom_core::ErrorKind;
use topom_models::{SlotAction, SlotActionState, SlotMapping, Store};

use crate::helpers::{controller, seed_group, FakeProxy, FakeRedis};

async fn own_slot(store: &Store, sid: u16, gid: u16) {
    store
        .update_slot_mapping(&SlotMapping {
            id: sid,
            group_id: gid,
            action: SlotAction::default(),
        })
        .await
        .unwrap();
}

/// Collapses runs of identical views. `finished` is pushed twice.
fn phases(history: Vec<topom_models::Slot>) -> Vec<topom_models::Slot> {
    let mut out: Vec<topom_models::Slot> = Vec::new();
    for s in history {
        if out.last() != Some(&s) {
            out.push(s);
        }
    }
    out
}

#[tokio::test]
async fn keys_move_to_the_target_group() {
    let (t, _client, store) = controller("mig-keys").await;
    let src = FakeRedis::start().await;
    let dst = FakeRedis::start().await;
    src.set_keys(100, 3);
    seed_group(&store, 1, &[&src.addr]).await;
    seed_group(&store, 2, &[&dst.addr]).await;
    own_slot(&store, 100, 1).await;
    t.reload().await.unwrap();

    t.slot_create_action(100, 2).await.unwrap();
    assert_eq!(t.process_slot_action().await.unwrap(), Some(100));

    let m = store.load_slot_mapping(100, true).await.unwrap().unwrap();
    assert_eq!(m.group_id, 2);
    assert_eq!(m.action.state, SlotActionState::Nothing);
    assert_eq!(src.keys(100), 0);
    assert_eq!(src.migrations(), vec![100, 100, 100]);

    // every batch targets the destination master
    let (host, port) = dst.addr.rsplit_once(':').unwrap();
    for cmd in src.commands().iter().filter(|c| c[0] == "SLOTSMGRTTAGSLOT") {
        assert_eq!(cmd[1], host);
        assert_eq!(cmd[2], port);
    }
    assert!(dst.migrations().is_empty());

    assert_eq!(t.process_slot_action().await.unwrap(), None);
}

#[tokio::test]
async fn proxies_observe_each_phase_in_order() {
    let (t, _client, store) = controller("mig-phases").await;
    let src = FakeRedis::start().await;
    let dst = FakeRedis::start().await;
    src.set_keys(100, 2);
    seed_group(&store, 1, &[&src.addr]).await;
    seed_group(&store, 2, &[&dst.addr]).await;
    own_slot(&store, 100, 1).await;
    t.reload().await.unwrap();

    let proxy = FakeProxy::start("mig-phases", "").await;
    t.create_proxy(&proxy.addr).await.unwrap();
    assert!(proxy.is_online());

    t.slot_create_action(100, 2).await.unwrap();
    assert_eq!(t.process_slot_action().await.unwrap(), Some(100));

    let seen = phases(proxy.history(100));
    let views: Vec<(&str, &str, bool)> = seen
        .iter()
        .map(|s| (s.backend_addr.as_str(), s.migrate_from.as_str(), s.locked))
        .collect();
    assert_eq!(
        views,
        vec![
            (src.addr.as_str(), "", false),
            (dst.addr.as_str(), src.addr.as_str(), true),
            (dst.addr.as_str(), src.addr.as_str(), false),
            (dst.addr.as_str(), "", false),
        ]
    );
    assert_eq!(seen[1].migrate_from_group_id, 1);
    assert_eq!(seen[3].backend_addr_group_id, 2);

    // finished goes out twice: before it is persisted and before handover
    let last = proxy.history(100);
    let n = last.len();
    assert_eq!(last[n - 1], last[n - 2]);

    assert_eq!(src.migrations().len(), 2);
    assert_eq!(proxy.table()[&100].backend_addr, dst.addr);
}

#[tokio::test]
async fn rejected_push_rolls_back_the_cache() {
    let (t, _client, store) = controller("mig-rollback").await;
    let src = FakeRedis::start().await;
    let dst = FakeRedis::start().await;
    seed_group(&store, 1, &[&src.addr]).await;
    seed_group(&store, 2, &[&dst.addr]).await;
    own_slot(&store, 7, 1).await;
    t.reload().await.unwrap();

    let good = FakeProxy::start("mig-rollback", "").await;
    let bad = FakeProxy::start("mig-rollback", "").await;
    t.create_proxy(&good.addr).await.unwrap();
    t.create_proxy(&bad.addr).await.unwrap();
    t.slot_create_action(7, 2).await.unwrap();

    // accepts preparing, refuses the locked prepared view
    bad.reject_locked(true);
    let err = t.slot_action_prepare().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Broadcast);
    assert!(err.to_string().contains(&bad.token));
    assert!(!err.to_string().contains(&good.token));

    // the controller's view is back where the call started
    let ctx = t.snapshot().await.unwrap();
    assert_eq!(ctx.slots[7].action.state, SlotActionState::Pending);
    // the store keeps the forward write
    let m = store.load_slot_mapping(7, true).await.unwrap().unwrap();
    assert_eq!(m.action.state, SlotActionState::Prepared);
    assert!(src.migrations().is_empty());

    // the proxy that took the locked view was sent the previous one again
    let last = good.history(7).last().cloned().unwrap();
    assert!(!last.locked);
    assert_eq!(last.backend_addr, src.addr);

    bad.reject_locked(false);
    assert_eq!(t.slot_action_prepare().await.unwrap(), Some(7));
    let m = store.load_slot_mapping(7, true).await.unwrap().unwrap();
    assert_eq!(m.action.state, SlotActionState::Migrating);

    assert_eq!(t.process_slot_action().await.unwrap(), Some(7));
    let m = store.load_slot_mapping(7, true).await.unwrap().unwrap();
    assert_eq!(m.group_id, 2);
    assert_eq!(good.table()[&7].backend_addr, dst.addr);
    assert_eq!(bad.table()[&7].backend_addr, dst.addr);
}

#[tokio::test]
async fn rolled_back_action_is_judged_by_its_stored_state() {
    let (t, _client, store) = controller("mig-unsettled").await;
    let src = FakeRedis::start().await;
    let dst = FakeRedis::start().await;
    seed_group(&store, 1, &[&src.addr]).await;
    seed_group(&store, 2, &[&dst.addr]).await;
    own_slot(&store, 7, 1).await;
    t.reload().await.unwrap();

    let bad = FakeProxy::start("mig-unsettled", "").await;
    t.create_proxy(&bad.addr).await.unwrap();
    t.slot_create_action(7, 2).await.unwrap();

    bad.reject_locked(true);
    assert!(t.slot_action_prepare().await.is_err());
    assert_eq!(
        t.snapshot().await.unwrap().slots[7].action.state,
        SlotActionState::Pending
    );

    // the stored action is past pending, so it can no longer be dropped
    let err = t.slot_remove_action(7).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(err.to_string().contains("isn't pending"));
    let m = store.load_slot_mapping(7, true).await.unwrap().unwrap();
    assert_eq!(m.action.state, SlotActionState::Prepared);
    assert_eq!(m.action.target_id, 2);

    // a started action is resumed even with the engine disabled; the
    // next view is migrating, which is not locked
    t.set_slot_action_disabled(true);
    assert_eq!(t.slot_action_prepare().await.unwrap(), Some(7));
    let m = store.load_slot_mapping(7, true).await.unwrap().unwrap();
    assert_eq!(m.action.state, SlotActionState::Migrating);

    assert_eq!(t.process_slot_action().await.unwrap(), Some(7));
    let m = store.load_slot_mapping(7, true).await.unwrap().unwrap();
    assert_eq!(m.group_id, 2);
    assert_eq!(bad.table()[&7].backend_addr, dst.addr);
}

#[tokio::test]
async fn assigning_every_slot_routes_to_the_group() {
    let (t, _client, store) = controller("mig-all").await;
    let redis = FakeRedis::start().await;
    t.create_group(1).await.unwrap();
    t.group_add_server(1, &redis.addr).await.unwrap();

    t.slot_create_action_range(0, 1023, 1).await.unwrap();
    let mut done = 0;
    while t.process_slot_action().await.unwrap().is_some() {
        done += 1;
    }
    assert_eq!(done, 1024);

    let ctx = t.snapshot().await.unwrap();
    assert!(ctx
        .slots
        .iter()
        .all(|m| m.action.state == SlotActionState::Nothing && m.group_id == 1));
    assert!(t
        .slots()
        .await
        .unwrap()
        .iter()
        .all(|s| s.backend_addr == redis.addr && !s.locked));
    let m = store.load_slot_mapping(1023, true).await.unwrap().unwrap();
    assert_eq!(m.group_id, 1);
    // unowned slots have nothing to move
    assert!(redis.migrations().is_empty());
}

#[tokio::test]
async fn queued_range_runs_in_index_order() {
    let (t, _client, store) = controller("mig-range").await;
    let src = FakeRedis::start().await;
    let dst = FakeRedis::start().await;
    seed_group(&store, 1, &[&src.addr]).await;
    seed_group(&store, 2, &[&dst.addr]).await;
    for sid in [20, 21, 22] {
        own_slot(&store, sid, 1).await;
        src.set_keys(sid, 1);
    }
    t.reload().await.unwrap();

    t.slot_create_action(22, 2).await.unwrap();
    t.slot_create_action_range(20, 21, 2).await.unwrap();

    let mut done = Vec::new();
    while let Some(sid) = tokio::time::timeout(Duration::from_secs(10), t.process_slot_action())
        .await
        .unwrap()
        .unwrap()
    {
        done.push(sid);
    }
    assert_eq!(done, vec![22, 20, 21]);
    assert_eq!(src.migrations(), vec![22, 20, 21]);
    for sid in [20, 21, 22] {
        let m = store.load_slot_mapping(sid, true).await.unwrap().unwrap();
        assert_eq!(m.group_id, 2);
    }
}
