// tests/api_tests.rs
use darkpool::api;
use darkpool::config::Config;
use darkpool::dispatch::Dispatcher;
use darkpool::executor::BatchExecutor;
use darkpool::storage::{create_storage, Storage, StorageMode};
use serde_json::{json, Value as JsonValue};
use std::net::SocketAddr;
use std::sync::Arc;

/// Bind the full router on an ephemeral port and return its address plus the
/// storage handle for direct assertions. The server must be built with
/// connect-info, the same way `run()` builds it, or the rate limiter's
/// extractor fails.
async fn spawn_api(config: Config) -> (SocketAddr, Arc<dyn Storage>) {
    let storage = create_storage(StorageMode::Memory, "")
        .await
        .expect("open storage");
    let router = api::router(storage.clone(), Arc::new(config));
    let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
        .serve(router.into_make_service_with_connect_info::<SocketAddr>());
    let addr = server.local_addr();
    tokio::spawn(server);
    (addr, storage)
}

fn submit_body(agent: &str, url: &str, amount: &str) -> JsonValue {
    json!({
        "agent_id": agent,
        "target_url": url,
        "payload": {"action": "swap", "pair": "SOL/USDC"},
        "amount": amount,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_then_fetch_roundtrip() {
    let (addr, _storage) = spawn_api(Config::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/tx/submit", addr))
        .json(&submit_body("agent-7", "http://executor.local/run", "10.00"))
        .send()
        .await
        .expect("submit");
    assert_eq!(resp.status(), 201);

    let receipt: JsonValue = resp.json().await.expect("receipt json");
    assert_eq!(receipt["privacy_fee"], "0.50");
    assert_eq!(receipt["total_cost"], "10.50");
    assert_eq!(receipt["status"], "pending");
    assert_eq!(receipt["estimated_delay_secs"], 30);
    let tx_id = receipt["transaction_id"].as_str().expect("tx id").to_string();

    let resp = client
        .get(format!("http://{}/tx/{}", addr, tx_id))
        .send()
        .await
        .expect("get tx");
    assert_eq!(resp.status(), 200);
    let tx: JsonValue = resp.json().await.expect("tx json");
    assert_eq!(tx["id"], tx_id.as_str());
    assert_eq!(tx["agent_id"], "agent-7");
    assert_eq!(tx["amount"], "10.00");
    assert_eq!(tx["privacy_fee"], "0.50");
    assert_eq!(tx["status"], "pending");
    assert_eq!(tx["payload"]["action"], "swap");
    assert!(tx["batch_id"].is_null());
    assert!(tx["result"].is_null());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_submissions_get_400_with_error_body() {
    let (addr, storage) = spawn_api(Config::default()).await;
    let client = reqwest::Client::new();

    let cases = [
        submit_body("", "http://executor.local/run", "1.00"),
        submit_body("agent", "not-a-url", "1.00"),
        submit_body("agent", "ftp://executor.local/run", "1.00"),
        submit_body("agent", "http://executor.local/run", "abc"),
        submit_body("agent", "http://executor.local/run", "-5.00"),
    ];

    for body in &cases {
        let resp = client
            .post(format!("http://{}/tx/submit", addr))
            .json(body)
            .send()
            .await
            .expect("submit");
        assert_eq!(resp.status(), 400, "body: {}", body);
        let err: JsonValue = resp.json().await.expect("error json");
        assert!(err["error"].is_string(), "body: {}", body);
    }

    // Rejected submissions leave nothing behind.
    assert_eq!(storage.pending_count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_and_malformed_ids_are_404() {
    let (addr, _storage) = spawn_api(Config::default()).await;
    let client = reqwest::Client::new();

    for path in [
        format!("/tx/{}", uuid::Uuid::new_v4()),
        "/tx/not-a-uuid".to_string(),
        format!("/batch/{}", uuid::Uuid::new_v4()),
        "/batch/99".to_string(),
    ] {
        let resp = client
            .get(format!("http://{}{}", addr, path))
            .send()
            .await
            .expect("get");
        assert_eq!(resp.status(), 404, "path: {}", path);
        let err: JsonValue = resp.json().await.expect("error json");
        assert!(err["error"].as_str().unwrap().contains("not found"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stats_report_zeroed_shape_and_pending_count() {
    let (addr, _storage) = spawn_api(Config::default()).await;
    let client = reqwest::Client::new();

    let stats: JsonValue = client
        .get(format!("http://{}/stats", addr))
        .send()
        .await
        .expect("stats")
        .json()
        .await
        .expect("stats json");
    assert_eq!(stats["total_transactions"], 0);
    assert_eq!(stats["total_volume"], "0");
    assert_eq!(stats["total_fees"], "0");
    assert_eq!(stats["avg_batch_size"], 0.0);
    assert_eq!(stats["mev_attacks_prevented"], 0);
    assert_eq!(stats["pending_count"], 0);

    client
        .post(format!("http://{}/tx/submit", addr))
        .json(&submit_body("agent", "http://executor.local/run", "3.00"))
        .send()
        .await
        .expect("submit");

    let stats: JsonValue = client
        .get(format!("http://{}/stats", addr))
        .send()
        .await
        .expect("stats")
        .json()
        .await
        .expect("stats json");
    assert_eq!(stats["pending_count"], 1);
    // Pending transactions are not part of the rollup until a batch completes.
    assert_eq!(stats["total_transactions"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_view_after_cycle_and_lookups_are_idempotent() {
    let (addr, storage) = spawn_api(Config::default()).await;
    let client = reqwest::Client::new();

    // Echo target so the cycle dispatches successfully.
    let echo = axum::Router::new().route(
        "/run",
        axum::routing::post(|axum::Json(body): axum::Json<JsonValue>| async move {
            axum::Json(json!({"ok": true, "echo": body}))
        }),
    );
    let target = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
        .serve(echo.into_make_service());
    let target_addr = target.local_addr();
    tokio::spawn(target);

    let resp = client
        .post(format!("http://{}/tx/submit", addr))
        .json(&submit_body(
            "agent-3",
            &format!("http://{}/run", target_addr),
            "10.00",
        ))
        .send()
        .await
        .expect("submit");
    let receipt: JsonValue = resp.json().await.expect("receipt json");
    let tx_id = receipt["transaction_id"].as_str().expect("tx id").to_string();

    // Drive one cycle directly instead of waiting out the batch window.
    let executor = BatchExecutor::new(storage.clone(), Dispatcher::new(5), 10);
    executor.run_cycle().await.expect("cycle").expect("batch formed");

    let tx: JsonValue = client
        .get(format!("http://{}/tx/{}", addr, tx_id))
        .send()
        .await
        .expect("get tx")
        .json()
        .await
        .expect("tx json");
    assert_eq!(tx["status"], "executed");
    assert_eq!(tx["result"]["success"], true);
    assert_eq!(tx["result"]["response"]["ok"], true);
    let batch_id = tx["batch_id"].as_str().expect("batch id").to_string();

    let resp = client
        .get(format!("http://{}/batch/{}", addr, batch_id))
        .send()
        .await
        .expect("get batch");
    assert_eq!(resp.status(), 200);
    let batch: JsonValue = resp.json().await.expect("batch json");
    assert_eq!(batch["status"], "completed");
    assert_eq!(batch["tx_count"], 1);
    assert_eq!(batch["total_value"], "10.00");
    assert!(batch["completed_at"].is_string());
    let members = batch["transactions"].as_array().expect("members");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0]["id"], tx_id.as_str());
    assert_eq!(members[0]["status"], "executed");
    assert!(members[0]["executed_at"].is_string());

    // Without new mutations, repeated lookups answer byte-identically.
    for path in [format!("/tx/{}", tx_id), format!("/batch/{}", batch_id)] {
        let again: JsonValue = client
            .get(format!("http://{}{}", addr, path))
            .send()
            .await
            .expect("get")
            .json()
            .await
            .expect("json");
        let reference = if path.starts_with("/tx/") { &tx } else { &batch };
        assert_eq!(&again, reference, "path: {}", path);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_is_static_ok() {
    let (addr, _storage) = spawn_api(Config::default()).await;
    let body: JsonValue = reqwest::get(format!("http://{}/health", addr))
        .await
        .expect("health")
        .json()
        .await
        .expect("health json");
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limit_returns_429_but_health_stays_open() {
    let config = Config {
        rate_limit_max_requests: 2,
        rate_limit_window_secs: 60,
        ..Config::default()
    };
    let (addr, _storage) = spawn_api(config).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let resp = client
            .get(format!("http://{}/stats", addr))
            .send()
            .await
            .expect("stats");
        assert_eq!(resp.status(), 200);
    }
    let resp = client
        .get(format!("http://{}/stats", addr))
        .send()
        .await
        .expect("stats");
    assert_eq!(resp.status(), 429);

    // /health is outside the rate-limited group.
    let resp = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .expect("health");
    assert_eq!(resp.status(), 200);
}
