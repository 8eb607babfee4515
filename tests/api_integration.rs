//! Integration tests for the relay's REST + WebSocket control surface.
//!
//! Each test spins up an Axum server on a random port and talks to it with
//! reqwest and tokio-tungstenite, using the loopback channel so completion
//! signals flow through the real correlator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use sms_relay::Relay;
use sms_relay::auth::DeviceId;
use sms_relay::channels::{ChannelRegistry, LoopbackChannel};
use sms_relay::config::{ChannelBackend, DeliveryConfig, DispatchConfig, RelayConfig};
use sms_relay::store::{IssueLog, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const WEBHOOK_TOKEN: &str = "hook-secret";

fn test_config() -> RelayConfig {
    RelayConfig {
        db_path: PathBuf::from(":memory:"),
        http_port: 0,
        device_id: None,
        channel: ChannelBackend::Loopback,
        log_dir: None,
        autostart_slot: None,
        webhook_token: Some(WEBHOOK_TOKEN.into()),
        dispatch: DispatchConfig {
            idle_interval: Duration::from_millis(20),
            source_backoff: Duration::from_millis(20),
            inter_message_delay: Duration::from_millis(1),
            ..Default::default()
        },
        delivery: DeliveryConfig::default(),
    }
}

struct TestServer {
    base: String,
    port: u16,
    relay: Relay,
    db: Arc<LibSqlBackend>,
    client: reqwest::Client,
}

/// Start an Axum server on a random port for a relay running as `device`.
async fn start_server(device: &str) -> TestServer {
    start_server_with(device, test_config()).await
}

async fn start_server_with(device: &str, config: RelayConfig) -> TestServer {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let ok_code = config.delivery.ok_result_code;
    let relay = Relay::assemble(&config, db.clone(), DeviceId::new(device), |signals| {
        ChannelRegistry::new(Arc::new(LoopbackChannel::new("loopback", signals, ok_code)))
    });
    let app = relay.router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        port,
        relay,
        db,
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    /// POST a delivery report with the given bearer token (if any).
    async fn report(&self, body: Value, token: Option<&str>) -> u16 {
        let mut req = self
            .client
            .post(format!("{}/api/delivery", self.base))
            .json(&body);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send().await.unwrap().status().as_u16()
    }

    async fn register(&self, account_id: &str) -> (u16, Value) {
        self.post(
            "/api/auth/register",
            json!({"account_id": account_id, "credential": "pw"}),
        )
        .await
    }

    async fn balance(&self) -> Decimal {
        let (status, body) = self.get("/api/account").await;
        assert_eq!(status, 200, "account lookup failed: {body}");
        body["balance"].as_str().unwrap().parse().unwrap()
    }
}

/// Read WS frames until one matches `pred`.
async fn next_matching<S>(ws: &mut S, pred: impl Fn(&Value) -> bool) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    timeout(TEST_TIMEOUT, async {
        loop {
            let msg = ws.next().await.expect("socket closed").expect("ws error");
            if let Message::Text(text) = msg {
                let value: Value = serde_json::from_str(&text).unwrap();
                if pred(&value) {
                    return value;
                }
            }
        }
    })
    .await
    .expect("no matching WS message before timeout")
}

#[tokio::test]
async fn health_check() {
    let server = start_server("D1").await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "sms-relay");
}

#[tokio::test]
async fn register_opens_session_with_zero_balance() {
    let server = start_server("D1").await;

    let (status, body) = server.register("9876543210").await;
    assert_eq!(status, 201);
    assert_eq!(body["account_id"], "9876543210");
    assert_eq!(body["device_id"], "D1");

    assert_eq!(server.balance().await, Decimal::ZERO);

    let (_, status_body) = server.get("/api/status").await;
    assert_eq!(status_body["session"]["account_id"], "9876543210");
    assert_eq!(status_body["state"], "idle");
    assert_eq!(status_body["device_id"], "D1");

    // Second account from the same device is refused
    let (status, _) = server.register("1111111111").await;
    assert_eq!(status, 409);
}

#[tokio::test]
async fn sign_in_from_other_device_is_refused_and_session_kept() {
    let server = start_server("D2").await;

    // Account registered on D1 earlier; that session is still stored
    let original = server
        .relay
        .state
        .guard
        .register(
            "9876543210",
            &SecretString::from("pw".to_string()),
            &DeviceId::new("D1"),
        )
        .await
        .unwrap();

    let (status, body) = server
        .post(
            "/api/auth/sign-in",
            json!({"account_id": "9876543210", "credential": "pw"}),
        )
        .await;
    assert_eq!(status, 403);
    assert!(body["error"].as_str().unwrap().contains("another device"));

    let session = server.relay.state.guard.current_session().await.unwrap();
    assert_eq!(session, Some(original));

    let (status, _) = server
        .post(
            "/api/auth/sign-in",
            json!({"account_id": "9876543210", "credential": "nope"}),
        )
        .await;
    assert_eq!(status, 401);

    let (status, _) = server
        .post(
            "/api/auth/sign-in",
            json!({"account_id": "5555555555", "credential": "pw"}),
        )
        .await;
    assert_eq!(status, 404);
}

fn confirmed_report(job_id: &str, account_id: &str) -> Value {
    json!({
        "job_id": job_id,
        "account_id": account_id,
        "address": "+919876543210",
        "result_code": -1,
    })
}

#[tokio::test]
async fn delivery_webhook_credits_once() {
    let server = start_server("D1").await;
    server.register("9876543210").await;
    server.db.record_issued("j1", "9876543210").await.unwrap();

    let report = confirmed_report("j1", "9876543210");
    assert_eq!(server.report(report.clone(), Some(WEBHOOK_TOKEN)).await, 202);
    assert_eq!(server.report(report, Some(WEBHOOK_TOKEN)).await, 202);

    timeout(TEST_TIMEOUT, async {
        while server.balance().await == Decimal::ZERO {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.balance().await, dec!(0.16));
    let (status, logs) = server.get("/api/logs?limit=10").await;
    assert_eq!(status, 200);
    let logs = logs.as_array().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["status"], "sent");
    assert_eq!(logs[0]["job_id"], "j1");
}

#[tokio::test]
async fn report_without_correlation_is_ignored() {
    let server = start_server("D1").await;
    server.register("9876543210").await;

    let status = server
        .report(json!({"result_code": -1, "part_index": 0}), Some(WEBHOOK_TOKEN))
        .await;
    assert_eq!(status, 202);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.balance().await, Decimal::ZERO);
    let (_, logs) = server.get("/api/logs").await;
    assert!(logs.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn reports_for_jobs_never_issued_are_not_credited() {
    let server = start_server("D1").await;
    server.register("9876543210").await;

    for i in 0..3 {
        let report = confirmed_report(&format!("never-issued-{i}"), "9876543210");
        assert_eq!(server.report(report, Some(WEBHOOK_TOKEN)).await, 202);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.balance().await, Decimal::ZERO);
    let (_, logs) = server.get("/api/logs").await;
    assert!(logs.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn report_naming_another_account_is_not_credited() {
    let server = start_server("D1").await;
    server.register("9876543210").await;
    server.db.record_issued("j1", "1111111111").await.unwrap();

    let report = confirmed_report("j1", "9876543210");
    assert_eq!(server.report(report, Some(WEBHOOK_TOKEN)).await, 202);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.balance().await, Decimal::ZERO);
    let (_, logs) = server.get("/api/logs").await;
    assert!(logs.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn webhook_requires_bearer_token() {
    let server = start_server("D1").await;
    server.register("9876543210").await;
    server.db.record_issued("j1", "9876543210").await.unwrap();

    let report = confirmed_report("j1", "9876543210");
    assert_eq!(server.report(report.clone(), None).await, 401);
    assert_eq!(server.report(report, Some("guess")).await, 401);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.balance().await, Decimal::ZERO);
}

#[tokio::test]
async fn webhook_is_disabled_without_token() {
    let config = RelayConfig {
        webhook_token: None,
        ..test_config()
    };
    let server = start_server_with("D1", config).await;
    server.register("9876543210").await;
    server.db.record_issued("j1", "9876543210").await.unwrap();

    let report = confirmed_report("j1", "9876543210");
    assert_eq!(server.report(report, Some(WEBHOOK_TOKEN)).await, 403);
}

#[tokio::test]
async fn start_requires_session() {
    let server = start_server("D1").await;

    let (status, body) = server.post("/api/dispatch/start", json!({})).await;
    assert_eq!(status, 401);
    assert!(body["error"].as_str().unwrap().contains("session"));

    let (status, _) = server.get("/api/logs").await;
    assert_eq!(status, 401);
}

#[tokio::test]
async fn ws_streams_dispatch_progress_and_delivery() {
    let server = start_server("D1").await;
    server.register("9876543210").await;
    server
        .db
        .enqueue_task("j1", Some("98765-43210"), Some("hi"))
        .await
        .unwrap();

    let url = format!("ws://127.0.0.1:{}/ws", server.port);
    let (mut ws, _) = timeout(TEST_TIMEOUT, connect_async(&url))
        .await
        .expect("WS connect timed out")
        .expect("WS connect failed");

    let sync = next_matching(&mut ws, |v| v["type"] == "state").await;
    assert_eq!(sync["state"], "idle");

    let (status, body) = server
        .post("/api/dispatch/start", json!({"slot": 0, "mode": "single_batch"}))
        .await;
    assert_eq!(status, 202, "start failed: {body}");

    let progress = next_matching(&mut ws, |v| v["type"] == "progress").await;
    assert_eq!(progress["sent"], 1);
    assert_eq!(progress["total"], 1);

    let delivered = next_matching(&mut ws, |v| v["type"] == "delivered").await;
    assert_eq!(delivered["job_id"], "j1");
    assert_eq!(delivered["address"], "+919876543210");
    assert_eq!(delivered["result"], "confirmed");

    assert_eq!(server.balance().await, dec!(0.16));
}

#[tokio::test]
async fn sign_out_stops_dispatch_and_clears_session() {
    let server = start_server("D1").await;
    server.register("9876543210").await;

    let (status, _) = server
        .post("/api/dispatch/start", json!({"mode": "continuous"}))
        .await;
    assert_eq!(status, 202);
    let (_, body) = server.get("/api/status").await;
    assert_eq!(body["state"], "running");

    let (status, _) = server.post("/api/auth/sign-out", json!({})).await;
    assert_eq!(status, 200);

    let (_, body) = server.get("/api/status").await;
    assert_eq!(body["state"], "cancelled");
    assert!(body["session"].is_null());

    // Signing back in on the bound device works
    let (status, _) = server
        .post(
            "/api/auth/sign-in",
            json!({"account_id": "9876543210", "credential": "pw"}),
        )
        .await;
    assert_eq!(status, 200);
}
