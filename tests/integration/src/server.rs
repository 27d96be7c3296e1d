//! The `topom-server` binary: flags, admin API and lock exclusion.

use std::process::Command;
use std::time::Duration;

use crate::helpers::{find_free_port, server_binary, spawn_server, wait_child, TestServer};

#[tokio::test]
async fn second_server_exits_while_first_holds_lock() {
    let dir = tempfile::tempdir().unwrap();
    let Some(mut a) = TestServer::start("srv-lock", dir.path()) else {
        return;
    };

    let mut b = spawn_server("srv-lock", dir.path(), find_free_port()).unwrap();
    let status = wait_child(&mut b, Duration::from_secs(10)).expect("second server kept running");
    assert!(!status.success());

    // the first one is unaffected
    let http = reqwest::Client::new();
    let model: serde_json::Value = http
        .get(a.url("/api/topom/model"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(model["product_name"], "srv-lock");
    assert_eq!(model["admin_addr"], a.addr);

    // the reply may race the process exit
    let _ = http
        .put(a.url(&format!("/api/topom/shutdown/{}", a.xauth)))
        .send()
        .await;
    let status = a.wait_exit(Duration::from_secs(10)).expect("server ignored shutdown");
    assert!(status.success());

    let c = TestServer::start("srv-lock", dir.path()).expect("binary vanished");
    let resp = http
        .get(c.url(&format!("/api/topom/xping/{}", c.xauth)))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
}

#[tokio::test]
async fn admin_api_drives_groups_and_slots() {
    let dir = tempfile::tempdir().unwrap();
    let Some(s) = TestServer::start("srv-api", dir.path()) else {
        return;
    };
    let http = reqwest::Client::new();
    let x = &s.xauth;

    let put = |path: String| {
        let http = http.clone();
        let url = s.url(&path);
        async move { http.put(url).send().await.unwrap() }
    };

    assert!(put(format!("/api/topom/group/create/{x}/1")).await.status().is_success());
    assert!(put(format!("/api/topom/group/add/{x}/1/127.0.0.1:6379"))
        .await
        .status()
        .is_success());

    let dup = put(format!("/api/topom/group/create/{x}/1")).await;
    assert_eq!(dup.status().as_u16(), 400);
    let body: serde_json::Value = dup.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "precondition");

    let forbidden = put("/api/topom/group/create/bad-xauth/2".to_owned()).await;
    assert_eq!(forbidden.status().as_u16(), 403);

    let stats: serde_json::Value = http
        .get(s.url("/topom/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["closed"], false);
    assert!(stats["group"]["models"].as_array().is_some_and(|g| g.len() == 1));

    let metrics = http.get(s.url("/metrics")).send().await.unwrap();
    assert!(metrics.status().is_success());
}

#[test]
fn config_template_is_valid_toml() {
    let Some(binary) = server_binary() else {
        return;
    };
    let out = Command::new(binary)
        .arg("--config-template")
        .output()
        .unwrap();
    assert!(out.status.success());
    let text = String::from_utf8(out.stdout).unwrap();
    assert!(text.contains("product_name"));
    assert!(text.contains("coordinator_name"));
}
