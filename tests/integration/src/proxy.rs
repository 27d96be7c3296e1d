//! Proxy registration against a live admin endpoint.

use topom_core::ErrorKind;

use crate::helpers::{controller, seed_group, FakeProxy, FakeRedis};

#[tokio::test]
async fn registered_proxy_gets_full_table_and_starts() {
    let (t, _client, store) = controller("proxy-reg").await;
    let redis = FakeRedis::start().await;
    seed_group(&store, 1, &[&redis.addr]).await;
    t.reload().await.unwrap();
    t.slot_create_action(3, 1).await.unwrap();

    let proxy = FakeProxy::start("proxy-reg", "").await;
    t.create_proxy(&proxy.addr).await.unwrap();

    assert!(proxy.is_online());
    assert_eq!(proxy.table().len(), 1024);

    let p = store.load_proxy(1, true).await.unwrap().unwrap();
    assert_eq!(p.token, proxy.token);
    assert_eq!(p.admin_addr, proxy.addr);

    let err = t.create_proxy(&proxy.addr).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(err.to_string().contains("already exists"));
}

#[tokio::test]
async fn reinit_pushes_the_table_again() {
    let (t, _client, _store) = controller("proxy-reinit").await;
    let proxy = FakeProxy::start("proxy-reinit", "").await;
    t.create_proxy(&proxy.addr).await.unwrap();
    assert_eq!(proxy.history(0).len(), 1);

    t.reinit_proxy(&proxy.token).await.unwrap();
    t.reinit_proxy(&proxy.token).await.unwrap();
    let history = proxy.history(0);
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|s| s == &history[0]));

    let err = t.reinit_proxy("no-such-token").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn foreign_product_is_rejected() {
    let (t, _client, store) = controller("proxy-mine").await;
    let proxy = FakeProxy::start("proxy-theirs", "").await;
    let err = t.create_proxy(&proxy.addr).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(!proxy.is_online());
    assert!(store.load_proxy(1, false).await.unwrap().is_none());
}

#[tokio::test]
async fn wrong_product_auth_fails_xauth() {
    let (t, _client, _store) = controller("proxy-auth").await;
    let proxy = FakeProxy::start("proxy-auth", "secret").await;
    let err = t.create_proxy(&proxy.addr).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Broadcast);
    assert!(t.snapshot().await.unwrap().proxies.is_empty());
}

#[tokio::test]
async fn remove_shuts_the_proxy_down() {
    let (t, _client, store) = controller("proxy-remove").await;
    let proxy = FakeProxy::start("proxy-remove", "").await;
    t.create_proxy(&proxy.addr).await.unwrap();

    t.remove_proxy(&proxy.token, false).await.unwrap();
    assert!(proxy.is_shutdown());
    assert!(store.load_proxy(1, false).await.unwrap().is_none());
    assert!(t.snapshot().await.unwrap().proxies.is_empty());
}

#[tokio::test]
async fn pushes_skip_removed_proxies() {
    let (t, _client, store) = controller("proxy-skip").await;
    let redis = FakeRedis::start().await;
    seed_group(&store, 1, &[&redis.addr]).await;
    t.reload().await.unwrap();

    let kept = FakeProxy::start("proxy-skip", "").await;
    let gone = FakeProxy::start("proxy-skip", "").await;
    t.create_proxy(&kept.addr).await.unwrap();
    t.create_proxy(&gone.addr).await.unwrap();
    t.remove_proxy(&gone.token, false).await.unwrap();

    // a failing push to a forgotten proxy must not break migrations
    gone.fail_fill_slots(true);
    t.slot_create_action(9, 1).await.unwrap();
    assert_eq!(t.process_slot_action().await.unwrap(), Some(9));
    assert_eq!(kept.table()[&9].backend_addr, redis.addr);
    assert_eq!(gone.table()[&9].backend_addr, "");
}
