//! Promotion fences migrations touching the promoting group.

use topom_core::SlotStep;
use topom_models::{PromotingState, SlotAction, SlotActionState, SlotMapping};

use crate::helpers::{controller, seed_group, FakeProxy, FakeRedis};

#[tokio::test]
async fn migration_waits_for_promotion_of_target() {
    let (t, _client, store) = controller("promo-fence").await;
    let src = FakeRedis::start().await;
    let master = FakeRedis::start().await;
    let replica = FakeRedis::start().await;
    src.set_keys(42, 1);
    seed_group(&store, 1, &[&src.addr]).await;
    seed_group(&store, 2, &[&master.addr, &replica.addr]).await;
    store
        .update_slot_mapping(&SlotMapping {
            id: 42,
            group_id: 1,
            action: SlotAction {
                index: 1,
                state: SlotActionState::Migrating,
                target_id: 2,
            },
        })
        .await
        .unwrap();
    t.reload().await.unwrap();

    let proxy = FakeProxy::start("promo-fence", "").await;
    t.create_proxy(&proxy.addr).await.unwrap();

    t.group_promote_server(2, &replica.addr).await.unwrap();
    let g = store.load_group(2, true).await.unwrap().unwrap();
    assert_eq!(g.promoting.state, PromotingState::Preparing);

    assert_eq!(t.slot_action_execute(42).await.unwrap(), SlotStep::Retry);
    assert_eq!(t.slot_action_execute(42).await.unwrap(), SlotStep::Retry);
    assert!(src.migrations().is_empty());

    t.group_promote_commit(2).await.unwrap();
    let g = store.load_group(2, true).await.unwrap().unwrap();
    assert_eq!(g.promoting.state, PromotingState::Nothing);
    assert_eq!(g.master(), replica.addr);
    assert!(g.out_of_sync);

    // the replicas were rewired around the new master
    assert_eq!(replica.master(), "");
    assert_eq!(master.master(), replica.addr);

    // proxies held the slot while the group was fenced
    let history = proxy.history(42);
    assert!(history.iter().any(|s| s.locked));
    let last = history.last().unwrap();
    assert!(!last.locked);
    assert_eq!(last.backend_addr, replica.addr);
    assert_eq!(last.migrate_from, src.addr);

    assert_eq!(t.slot_action_execute(42).await.unwrap(), SlotStep::Complete);
    assert_eq!(src.migrations(), vec![42]);
    let (host, port) = replica.addr.rsplit_once(':').unwrap();
    let cmd = src
        .commands()
        .into_iter()
        .find(|c| c[0] == "SLOTSMGRTTAGSLOT")
        .unwrap();
    assert_eq!((cmd[1].as_str(), cmd[2].as_str()), (host, port));

    t.slot_action_complete(42).await.unwrap();
    let m = store.load_slot_mapping(42, true).await.unwrap().unwrap();
    assert_eq!(m.group_id, 2);

    t.resync_group(2).await.unwrap();
    let g = store.load_group(2, true).await.unwrap().unwrap();
    assert!(!g.out_of_sync);
}

#[tokio::test]
async fn promotion_of_source_also_fences() {
    let (t, _client, store) = controller("promo-source").await;
    let master = FakeRedis::start().await;
    let replica = FakeRedis::start().await;
    let dst = FakeRedis::start().await;
    master.set_keys(7, 2);
    seed_group(&store, 1, &[&master.addr, &replica.addr]).await;
    seed_group(&store, 2, &[&dst.addr]).await;
    store
        .update_slot_mapping(&SlotMapping {
            id: 7,
            group_id: 1,
            action: SlotAction {
                index: 1,
                state: SlotActionState::Migrating,
                target_id: 2,
            },
        })
        .await
        .unwrap();
    t.reload().await.unwrap();

    t.group_promote_server(1, &replica.addr).await.unwrap();
    assert_eq!(t.slot_action_execute(7).await.unwrap(), SlotStep::Retry);
    assert!(master.migrations().is_empty());

    let err = t.group_promote_server(1, &replica.addr).await.unwrap_err();
    assert!(err.to_string().contains("is promoting"));
}
