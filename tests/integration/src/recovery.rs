//! A new leader resumes whatever the previous one left in the store.

use std::sync::Arc;
use std::time::Duration;

use topom_core::Topom;
use topom_models::{Client, MemoryClient, SlotAction, SlotActionState, SlotMapping, Store};

use crate::helpers::{config, eventually, seed_group, FakeProxy, FakeRedis};

#[tokio::test]
async fn restarted_leader_resumes_in_index_order() {
    let client = MemoryClient::new();
    let store = Store::new(Arc::new(client.session()), "recover");
    let src = FakeRedis::start().await;
    let dst = FakeRedis::start().await;
    seed_group(&store, 1, &[&src.addr]).await;
    seed_group(&store, 2, &[&dst.addr]).await;

    // slot ids deliberately out of step with their queue positions
    let queued: [(u16, u64); 5] = [(50, 9), (51, 2), (52, 11), (53, 5), (54, 7)];
    for (sid, index) in queued {
        src.set_keys(sid, 2);
        store
            .update_slot_mapping(&SlotMapping {
                id: sid,
                group_id: 1,
                action: SlotAction {
                    index,
                    state: SlotActionState::Migrating,
                    target_id: 2,
                },
            })
            .await
            .unwrap();
    }

    // the first leader dies with its session, before moving anything
    let session = client.session();
    let a = Topom::new(Arc::new(session.clone()), config("recover"))
        .await
        .unwrap();
    session.close().await.unwrap();
    eventually(Duration::from_secs(5), "first leader to notice", || {
        let a = Arc::clone(&a);
        async move { a.is_closed() }
    })
    .await;

    let b = Topom::new(Arc::new(client.session()), config("recover"))
        .await
        .unwrap();
    let proxy = FakeProxy::start("recover", "").await;
    b.create_proxy(&proxy.addr).await.unwrap();
    b.start().unwrap();

    eventually(Duration::from_secs(20), "every queued slot to land", || {
        let store = store.clone();
        async move {
            let mut left = 0;
            for (sid, _) in queued {
                let m = store.load_slot_mapping(sid, true).await.unwrap().unwrap();
                if m.action.state != SlotActionState::Nothing {
                    left += 1;
                }
            }
            left == 0
        }
    })
    .await;

    // each slot is drained completely before the next one starts
    assert_eq!(
        src.migrations(),
        vec![51, 51, 53, 53, 54, 54, 50, 50, 52, 52]
    );
    for (sid, _) in queued {
        let m = store.load_slot_mapping(sid, true).await.unwrap().unwrap();
        assert_eq!(m.group_id, 2);
        assert_eq!(src.keys(sid), 0);
        assert_eq!(proxy.table()[&sid].backend_addr, dst.addr);
    }
    b.close().await.unwrap();
}

#[tokio::test]
async fn half_prepared_action_is_walked_forward() {
    let client = MemoryClient::new();
    let store = Store::new(Arc::new(client.session()), "recover-prep");
    let src = FakeRedis::start().await;
    let dst = FakeRedis::start().await;
    seed_group(&store, 1, &[&src.addr]).await;
    seed_group(&store, 2, &[&dst.addr]).await;
    src.set_keys(8, 1);
    store
        .update_slot_mapping(&SlotMapping {
            id: 8,
            group_id: 1,
            action: SlotAction {
                index: 4,
                state: SlotActionState::Prepared,
                target_id: 2,
            },
        })
        .await
        .unwrap();
    // a pending action with a lower index still waits its turn
    store
        .update_slot_mapping(&SlotMapping {
            id: 9,
            group_id: 1,
            action: SlotAction {
                index: 1,
                state: SlotActionState::Pending,
                target_id: 2,
            },
        })
        .await
        .unwrap();

    let t = Topom::new(Arc::new(client.session()), config("recover-prep"))
        .await
        .unwrap();
    assert_eq!(t.process_slot_action().await.unwrap(), Some(8));
    assert_eq!(t.process_slot_action().await.unwrap(), Some(9));
    assert_eq!(t.process_slot_action().await.unwrap(), None);
    assert_eq!(src.migrations(), vec![8, 9]);
    t.close().await.unwrap();
}
