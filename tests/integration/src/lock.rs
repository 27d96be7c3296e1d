//! One controller per product.

use std::sync::Arc;
use std::time::Duration;

use topom_core::{ErrorKind, Topom};
use topom_models::{FsClient, MemoryClient, Store};

use crate::helpers::{config, eventually};

#[tokio::test]
async fn second_controller_is_refused_until_first_closes() {
    let client = MemoryClient::new();
    let a = Topom::new(Arc::new(client.session()), config("lock-demo"))
        .await
        .unwrap();

    let err = Topom::new(Arc::new(client.session()), config("lock-demo"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(err.to_string().contains("locked"));

    a.close().await.unwrap();
    let b = Topom::new(Arc::new(client.session()), config("lock-demo"))
        .await
        .unwrap();
    assert!(!b.is_closed());
    b.close().await.unwrap();
}

#[tokio::test]
async fn removed_lock_shuts_holder_down() {
    let client = MemoryClient::new();
    let a = Topom::new(Arc::new(client.session()), config("lock-lost"))
        .await
        .unwrap();

    let admin = Store::new(Arc::new(client.session()), "lock-lost");
    let holder = admin.force_remove_lock().await.unwrap().unwrap();
    assert_eq!(holder.token, a.model().token);

    eventually(Duration::from_secs(5), "lock loss to close the controller", || {
        let a = Arc::clone(&a);
        async move { a.is_closed() }
    })
    .await;
    assert!(a.lock_lost());
    assert_eq!(a.snapshot().await.unwrap_err().kind(), ErrorKind::Closed);

    let b = Topom::new(Arc::new(client.session()), config("lock-lost"))
        .await
        .unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn filesystem_lock_excludes_across_clients() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap();

    let a = Topom::new(Arc::new(FsClient::new(root).unwrap()), config("lock-fs"))
        .await
        .unwrap();
    let err = Topom::new(Arc::new(FsClient::new(root).unwrap()), config("lock-fs"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);

    a.close().await.unwrap();
    let b = Topom::new(Arc::new(FsClient::new(root).unwrap()), config("lock-fs"))
        .await
        .unwrap();
    b.close().await.unwrap();
}
