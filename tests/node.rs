//! Node start, serve and ordered shutdown

use std::sync::Arc;
use usermesh::cache::MemoryCacheStore;
use usermesh::discovery::{CoordinationClient, MemoryCoordinator};
use usermesh::service::{Node, User};
use usermesh::Config;

fn test_config() -> Config {
    let mut config = Config::default();
    config.node_id = "node-test".into();
    config.service.http_addr = "127.0.0.1:0".parse().unwrap();
    config.service.rpc_addr = "127.0.0.1:0".parse().unwrap();
    config.shutdown_timeout_ms = 2_000;
    config
}

#[tokio::test]
async fn test_node_lifecycle() {
    let server = MemoryCoordinator::new();
    let observer = server.client();
    let coordination = server.client();
    let node = Node::start_with(
        test_config(),
        Arc::new(coordination.clone()),
        Arc::new(MemoryCacheStore::new()),
    )
    .await
    .unwrap();

    let listing = observer.list("/services/user-service/").await.unwrap();
    assert_eq!(listing.kvs.len(), 1);
    assert_eq!(listing.kvs[0].value, format!("127.0.0.1:{}", node.rpc_addr().port()));

    node.users()
        .create_user(User::new(5, "grace", "grace@example.com"))
        .await
        .unwrap();

    let http = reqwest::Client::new();
    let health = http
        .get(format!("http://{}/health", node.http_addr()))
        .send()
        .await
        .unwrap();
    assert!(health.status().is_success());

    let user: serde_json::Value = http
        .get(format!("http://{}/api/v1/users/5", node.http_addr()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(user["name"], "grace");

    // sign-up through the public API, then read it back
    let created = http
        .post(format!("http://{}/api/v1/users", node.http_addr()))
        .json(&serde_json::json!({
            "name": "linus",
            "email": "linus@example.com",
            "password": "hunter2",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), reqwest::StatusCode::CREATED);
    let created: serde_json::Value = created.json().await.unwrap();
    let profile = http
        .get(format!("http://{}/api/v1/users/{}", node.http_addr(), created["id"]))
        .send()
        .await
        .unwrap();
    assert!(profile.status().is_success());
    assert!(profile.headers()["cache-control"]
        .to_str()
        .unwrap()
        .starts_with("private, max-age="));

    // the registered address serves the internal API
    let resolved = node.resolver().resolve("user-service").await.unwrap();
    let peer = resolved.pick().unwrap();
    let internal = http
        .get(format!("http://{}/internal/v1/users/5", peer))
        .send()
        .await
        .unwrap();
    assert!(internal.status().is_success());

    let http_addr = node.http_addr();
    node.shutdown().await;

    assert!(observer.list("/services/user-service/").await.unwrap().kvs.is_empty());
    assert!(coordination.is_closed());
    assert!(http.get(format!("http://{}/health", http_addr)).send().await.is_err());
}

#[tokio::test]
async fn test_start_fails_without_coordination() {
    let server = MemoryCoordinator::new();
    let client = server.client();
    client.partition();

    let result = Node::start_with(
        test_config(),
        Arc::new(client),
        Arc::new(MemoryCacheStore::new()),
    )
    .await;
    assert!(result.is_err());
}
