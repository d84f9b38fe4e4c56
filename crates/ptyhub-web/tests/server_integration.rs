//! End-to-end tests against an in-process server: REST, auth, static
//! serving, and the WebSocket streaming protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use libptyhub::{
    AgentDirectory, AgentStatus, NullSink, PoolConfig, SessionPool, SpawnOptions,
};
use ptyhub_protocol::AgentRunState;
use ptyhub_web::server::{self, RemoteServerConfig, ServerHandle};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Directory double: every known agent is running, task names echo ids.
struct RunningDirectory;

impl AgentDirectory for RunningDirectory {
    fn task_name(&self, task_id: &str) -> String {
        format!("task {task_id}")
    }

    fn agent_status(&self, _agent_id: &str) -> AgentStatus {
        AgentStatus {
            state: AgentRunState::Running,
            exit_code: None,
            last_line: "...".to_string(),
        }
    }
}

struct Harness {
    pool: SessionPool,
    handle: ServerHandle,
    addr: SocketAddr,
    // Keeps the SPA directory alive for the server's lifetime.
    _static_dir: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        let directory: Arc<dyn AgentDirectory> = Arc::new(RunningDirectory);
        let static_dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(static_dir.path().join("index.html"), "<html>spa</html>").unwrap();
        std::fs::write(static_dir.path().join("app.js"), "console.log('spa')").unwrap();

        let pool = SessionPool::new(PoolConfig::default(), Arc::new(NullSink));
        let handle = server::start(
            RemoteServerConfig {
                port: 0,
                static_dir: static_dir.path().to_path_buf(),
            },
            pool.clone(),
            directory,
        )
        .await
        .expect("server start");
        let port = handle.local_addr.port();

        Self {
            pool,
            handle,
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            _static_dir: static_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn token(&self) -> String {
        self.handle.token().to_string()
    }

    async fn spawn(&self, agent_id: &str, task_id: &str, command: &str, args: &[&str]) {
        self.pool
            .spawn(SpawnOptions {
                agent_id: agent_id.to_string(),
                task_id: task_id.to_string(),
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                cwd: "/tmp".to_string(),
                env: HashMap::new(),
                cols: 80,
                rows: 24,
            })
            .await
            .expect("spawn");
    }

    async fn connect_ws(&self) -> WsClient {
        let url = format!("ws://{}/ws?token={}", self.addr, self.token());
        let (ws, _) = connect_async(url).await.expect("ws connect");
        ws
    }

    async fn stop(self) {
        self.pool.kill_all().await;
        self.handle.shutdown().await;
    }
}

async fn next_json(ws: &mut WsClient) -> Value {
    loop {
        let message = timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for ws frame")
            .expect("ws closed")
            .expect("ws error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("frame is json");
        }
    }
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::text(value.to_string())).await.expect("ws send");
}

#[tokio::test]
async fn rest_requires_a_valid_token() {
    let harness = Harness::start().await;
    let client = reqwest::Client::new();

    let bare = client.get(harness.url("/api/agents")).send().await.unwrap();
    assert_eq!(bare.status(), 401);
    let body: Value = bare.json().await.unwrap();
    assert_eq!(body["error"], "unauthorized");

    let wrong = client
        .get(harness.url("/api/agents"))
        .header("Authorization", "Bearer WRONG")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let bearer = client
        .get(harness.url("/api/agents"))
        .header("Authorization", format!("Bearer {}", harness.token()))
        .send()
        .await
        .unwrap();
    assert_eq!(bearer.status(), 200);
    assert!(bearer.json::<Value>().await.unwrap().is_array());

    let query = client
        .get(harness.url(&format!("/api/agents?token={}", harness.token())))
        .send()
        .await
        .unwrap();
    assert_eq!(query.status(), 200);

    harness.stop().await;
}

#[tokio::test]
async fn security_headers_are_on_every_response() {
    let harness = Harness::start().await;
    let client = reqwest::Client::new();

    for path in ["/api/agents", "/", "/api/nope"] {
        let response = client.get(harness.url(path)).send().await.unwrap();
        let headers = response.headers();
        assert_eq!(headers["x-content-type-options"], "nosniff", "path {path}");
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["referrer-policy"], "no-referrer");
    }

    harness.stop().await;
}

#[tokio::test]
async fn rest_agent_detail_and_errors() {
    let harness = Harness::start().await;
    harness.spawn("a1", "t1", "/bin/cat", &[]).await;
    let client = reqwest::Client::new();
    let token = harness.token();

    let detail: Value = client
        .get(harness.url(&format!("/api/agents/a1?token={token}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["agentId"], "a1");
    assert_eq!(detail["status"], "running");
    assert!(detail["exitCode"].is_null());
    assert!(detail["scrollback"].is_string());

    let missing = client
        .get(harness.url(&format!("/api/agents/ghost?token={token}")))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"], "agent not found");

    let unknown_route = client
        .get(harness.url(&format!("/api/bogus/route?token={token}")))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_route.status(), 404);
    let body: Value = unknown_route.json().await.unwrap();
    assert_eq!(body["error"], "not found");

    harness.stop().await;
}

#[tokio::test]
async fn rest_list_deduplicates_by_task() {
    let harness = Harness::start().await;
    harness.spawn("first", "shared-task", "/bin/cat", &[]).await;
    harness.spawn("second", "shared-task", "/bin/cat", &[]).await;
    let client = reqwest::Client::new();

    let list: Value = client
        .get(harness.url(&format!("/api/agents?token={}", harness.token())))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 1, "one entry per task id: {list:?}");
    assert_eq!(list[0]["taskId"], "shared-task");
    assert_eq!(list[0]["taskName"], "task shared-task");
    assert_eq!(list[0]["status"], "running");

    harness.stop().await;
}

#[tokio::test]
async fn static_spa_serving_and_traversal_guard() {
    let harness = Harness::start().await;
    let client = reqwest::Client::new();

    let index = client.get(harness.url("/")).send().await.unwrap();
    assert_eq!(index.status(), 200);
    assert_eq!(index.headers()["content-type"], "text/html");
    assert_eq!(index.headers()["cache-control"], "no-cache");
    assert!(index.text().await.unwrap().contains("spa"));

    let js = client.get(harness.url("/app.js")).send().await.unwrap();
    assert_eq!(js.status(), 200);
    assert_eq!(js.headers()["content-type"], "application/javascript");
    assert_eq!(
        js.headers()["cache-control"],
        "public, max-age=31536000, immutable"
    );

    // Client-side routes fall back to the SPA shell.
    let fallback = client
        .get(harness.url("/tasks/42/terminal"))
        .send()
        .await
        .unwrap();
    assert_eq!(fallback.status(), 200);
    assert!(fallback.text().await.unwrap().contains("spa"));

    // reqwest normalizes dot segments, so drive the traversal attempt over
    // a raw socket.
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream
        .write_all(b"GET /../secret.txt HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    assert!(
        raw.starts_with("HTTP/1.1 400"),
        "traversal was not refused: {raw}"
    );

    harness.stop().await;
}

#[tokio::test]
async fn ws_rejects_bad_or_missing_tokens() {
    let harness = Harness::start().await;

    let unauthorized = connect_async(format!("ws://{}/ws", harness.addr)).await;
    match unauthorized {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected 401 rejection, got {other:?}"),
    }

    let wrong = connect_async(format!("ws://{}/ws?token=WRONG", harness.addr)).await;
    assert!(wrong.is_err());

    harness.stop().await;
}

#[tokio::test]
async fn ws_spawn_subscribe_stream_exit_sequence() {
    let harness = Harness::start().await;
    harness
        .spawn("e2e", "t-e2e", "/bin/sh", &["-c", "sleep 0.5; echo hello"])
        .await;

    let mut ws = harness.connect_ws().await;

    // Connection opens with the current agent list.
    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "agents");
    assert!(
        first["list"]
            .as_array()
            .unwrap()
            .iter()
            .any(|a| a["agentId"] == "e2e"),
        "initial list misses the live agent: {first}"
    );

    send_json(&mut ws, serde_json::json!({"type": "subscribe", "agentId": "e2e"})).await;

    let mut streamed = Vec::new();
    let mut saw_scrollback = false;
    let mut exit_status: Option<Value> = None;

    // Frames must arrive as scrollback, then output*, then the exited
    // status, then an agent list without the agent.
    loop {
        let frame = next_json(&mut ws).await;
        match frame["type"].as_str().unwrap() {
            "scrollback" => {
                assert!(!saw_scrollback, "duplicate scrollback frame");
                assert!(streamed.is_empty(), "scrollback arrived after output");
                assert_eq!(frame["agentId"], "e2e");
                assert_eq!(frame["cols"], 80);
                saw_scrollback = true;
                let decoded = STANDARD.decode(frame["data"].as_str().unwrap()).unwrap();
                streamed.extend_from_slice(&decoded);
            }
            "output" => {
                assert!(saw_scrollback, "output arrived before scrollback");
                assert!(exit_status.is_none(), "output after exited status");
                assert_eq!(frame["agentId"], "e2e");
                let decoded = STANDARD.decode(frame["data"].as_str().unwrap()).unwrap();
                streamed.extend_from_slice(&decoded);
            }
            "status" => {
                assert_eq!(frame["agentId"], "e2e");
                assert_eq!(frame["status"], "exited");
                assert_eq!(frame["exitCode"], 0);
                exit_status = Some(frame);
            }
            "agents" => {
                let list = frame["list"].as_array().unwrap().clone();
                if exit_status.is_some() {
                    assert!(
                        list.iter().all(|a| a["agentId"] != "e2e"),
                        "exited agent still listed: {list:?}"
                    );
                    break;
                }
                // Pre-exit list refreshes may still carry the agent.
            }
            other => panic!("unexpected frame type {other}"),
        }
    }

    let text = String::from_utf8_lossy(&streamed);
    assert!(text.contains("hello"), "streamed bytes: {text:?}");

    harness.stop().await;
}

#[tokio::test]
async fn ws_input_round_trip_through_cat() {
    let harness = Harness::start().await;
    harness.spawn("cat", "t-cat", "/bin/cat", &[]).await;

    let mut ws = harness.connect_ws().await;
    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "agents");

    send_json(&mut ws, serde_json::json!({"type": "subscribe", "agentId": "cat"})).await;
    let scrollback = next_json(&mut ws).await;
    assert_eq!(scrollback["type"], "scrollback");

    send_json(
        &mut ws,
        serde_json::json!({"type": "input", "agentId": "cat", "data": "ping\n"}),
    )
    .await;

    let mut streamed = Vec::new();
    timeout(Duration::from_secs(10), async {
        loop {
            let frame = next_json(&mut ws).await;
            if frame["type"] == "output" {
                let decoded = STANDARD.decode(frame["data"].as_str().unwrap()).unwrap();
                streamed.extend_from_slice(&decoded);
                if String::from_utf8_lossy(&streamed).contains("ping") {
                    break;
                }
            }
        }
    })
    .await
    .expect("echoed input never came back");

    harness.stop().await;
}

#[tokio::test]
async fn ws_subscribe_is_idempotent_and_bad_frames_are_ignored() {
    let harness = Harness::start().await;
    harness.spawn("cat", "t-cat", "/bin/cat", &[]).await;

    let mut ws = harness.connect_ws().await;
    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "agents");

    // None of these may kill the connection or produce a reply.
    ws.send(Message::text("not json")).await.unwrap();
    send_json(&mut ws, serde_json::json!({"type": "warp", "agentId": "cat"})).await;
    send_json(
        &mut ws,
        serde_json::json!({"type": "input", "agentId": "cat", "data": "x".repeat(5000)}),
    )
    .await;
    send_json(
        &mut ws,
        serde_json::json!({"type": "resize", "agentId": "cat", "cols": 0, "rows": 24}),
    )
    .await;
    // Unsubscribing while not subscribed is a no-op.
    send_json(&mut ws, serde_json::json!({"type": "unsubscribe", "agentId": "cat"})).await;

    send_json(&mut ws, serde_json::json!({"type": "subscribe", "agentId": "cat"})).await;
    let scrollback = next_json(&mut ws).await;
    assert_eq!(
        scrollback["type"], "scrollback",
        "connection should have survived the garbage frames"
    );

    // A repeat subscribe is a no-op: no second scrollback frame shows up.
    send_json(&mut ws, serde_json::json!({"type": "subscribe", "agentId": "cat"})).await;
    let quiet = timeout(Duration::from_millis(400), ws.next()).await;
    assert!(quiet.is_err(), "duplicate subscribe produced a frame");

    harness.stop().await;
}

#[tokio::test]
async fn eleventh_client_is_rejected_with_429() {
    let harness = Harness::start().await;

    let mut clients = Vec::new();
    for _ in 0..10 {
        clients.push(harness.connect_ws().await);
    }

    let over_capacity = connect_async(format!(
        "ws://{}/ws?token={}",
        harness.addr,
        harness.token()
    ))
    .await;
    match over_capacity {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 429);
        }
        other => panic!("expected 429 rejection, got {other:?}"),
    }

    // Closing one slot frees capacity for the next client.
    let mut first = clients.remove(0);
    first.close(None).await.unwrap();
    drop(first);
    timeout(Duration::from_secs(10), async {
        loop {
            match connect_async(format!(
                "ws://{}/ws?token={}",
                harness.addr,
                harness.token()
            ))
            .await
            {
                Ok((ws, _)) => break ws,
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .expect("slot never freed after disconnect");

    harness.stop().await;
}
