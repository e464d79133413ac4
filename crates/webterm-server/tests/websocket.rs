//! End-to-end tests: a real server on an ephemeral port, `/bin/sh` sessions
//! and a tokio-tungstenite client.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use webterm_core::{parse_inline, ServerMessage};
use webterm_server::{CliOverrides, ConfigFile, ServerConfig, SessionRegistry, WebTermServer};

const TOKEN: &str = "test-token-0123456789";
const ALLOWED_ORIGIN: &str = "http://term.example";
const WAIT: Duration = Duration::from_secs(10);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let overrides = CliOverrides {
            addr: Some("127.0.0.1:0".into()),
            token: Some(TOKEN.into()),
            shell: Some("/bin/sh".into()),
            allowed_origins: Some(vec![ALLOWED_ORIGIN.into()]),
            ..CliOverrides::default()
        };
        let mut config = ServerConfig::resolve(ConfigFile::default(), overrides).unwrap();
        config.terminal.exit_grace = Duration::from_millis(100);

        let server = WebTermServer::new(config);
        let registry = server.registry();
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .run(listener, async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });
        Self {
            addr,
            registry,
            stop: Some(stop),
            handle,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn connect(&self) -> Client {
        let (ws, _) = tokio::time::timeout(WAIT, connect_async(self.url()))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        ws
    }

    /// Connect and authenticate; returns the client and its session id.
    async fn login(&self, session_id: Option<&str>) -> (Client, String) {
        let mut ws = self.connect().await;
        let mut auth = json!({"type": "auth", "token": TOKEN});
        if let Some(id) = session_id {
            auth["session_id"] = json!(id);
        }
        send_json(&mut ws, auth).await;
        let resp = next_json(&mut ws).await;
        assert_eq!(resp["type"], "auth_response");
        assert_eq!(resp["success"], true, "auth failed: {resp}");
        let id = resp["session_id"].as_str().unwrap().to_string();
        (ws, id)
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("server did not stop")
            .unwrap();
    }
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn send_raw(ws: &mut Client, text: &str) {
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

/// Next data frame as bytes, or `None` once the server closes.
async fn next_frame(ws: &mut Client) -> Option<Vec<u8>> {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame");
        match msg {
            Some(Ok(Message::Text(text))) => return Some(text.into_bytes()),
            Some(Ok(Message::Binary(data))) => return Some(data),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn next_json(ws: &mut Client) -> Value {
    let frame = next_frame(ws).await.expect("connection closed");
    serde_json::from_slice(&frame).expect("frame is not JSON")
}

/// Collect output until `needle` appears.
async fn read_until(ws: &mut Client, needle: &str) -> String {
    let mut seen = Vec::new();
    while let Some(frame) = next_frame(ws).await {
        seen.extend_from_slice(&frame);
        if String::from_utf8_lossy(&seen).contains(needle) {
            return String::from_utf8_lossy(&seen).into_owned();
        }
    }
    panic!("connection closed before {needle:?}; got {:?}", String::from_utf8_lossy(&seen));
}

/// Read frames until the server closes the connection.
async fn read_to_close(ws: &mut Client) -> String {
    let mut seen = Vec::new();
    while let Some(frame) = next_frame(ws).await {
        seen.extend_from_slice(&frame);
    }
    String::from_utf8_lossy(&seen).into_owned()
}

async fn wait_for_count(registry: &SessionRegistry, expected: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while registry.count().await != expected {
        assert!(tokio::time::Instant::now() < deadline, "registry never reached {expected} sessions");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_detach(registry: &SessionRegistry, id: &str) {
    let session = registry.lookup(id).await.expect("session missing");
    let deadline = tokio::time::Instant::now() + WAIT;
    while session.info().connections != 0 {
        assert!(tokio::time::Instant::now() < deadline, "connection never detached");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn expect_auth_failure(server: &TestServer, first: Message, expected: &str) {
    let mut ws = server.connect().await;
    ws.send(first).await.unwrap();
    let resp = next_json(&mut ws).await;
    assert_eq!(resp["type"], "auth_response");
    assert_eq!(resp["success"], false);
    assert_eq!(resp["message"], expected);
    assert!(next_frame(&mut ws).await.is_none(), "connection should close");
}

#[tokio::test]
async fn new_session_runs_commands() {
    let server = TestServer::start().await;
    let (mut ws, id) = server.login(None).await;
    assert_eq!(id.len(), 32);
    assert_eq!(server.registry.count().await, 1);

    send_raw(&mut ws, "echo hello-$((6*7))\n").await;
    let out = read_until(&mut ws, "hello-42").await;
    assert!(!out.contains("__webterm_ready__"), "setup output leaked: {out:?}");

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn bad_credentials_are_rejected() {
    let server = TestServer::start().await;
    let text = |v: Value| Message::Text(v.to_string());

    expect_auth_failure(
        &server,
        text(json!({"type": "auth", "token": "nope"})),
        "Invalid authentication token",
    )
    .await;
    expect_auth_failure(&server, text(json!({"type": "auth"})), "Missing authentication token").await;
    expect_auth_failure(
        &server,
        text(json!({"type": "resize", "rows": 10, "cols": 10})),
        "Invalid message type",
    )
    .await;
    expect_auth_failure(&server, Message::Text("ls -la".into()), "Invalid authentication format").await;

    assert_eq!(server.registry.count().await, 0);
    server.stop().await;
}

#[tokio::test]
async fn repeated_failures_are_rate_limited() {
    let server = TestServer::start().await;
    for _ in 0..5 {
        expect_auth_failure(
            &server,
            Message::Text(json!({"type": "auth", "token": "wrong"}).to_string()),
            "Invalid authentication token",
        )
        .await;
    }
    // Even the right token is refused now.
    expect_auth_failure(
        &server,
        Message::Text(json!({"type": "auth", "token": TOKEN}).to_string()),
        "too many failed authentication attempts",
    )
    .await;
    server.stop().await;
}

#[tokio::test]
async fn reconnect_replays_history() {
    let server = TestServer::start().await;
    let (mut ws, id) = server.login(None).await;
    send_raw(&mut ws, "echo before-$((1+1))\n").await;
    read_until(&mut ws, "before-2").await;
    ws.close(None).await.unwrap();
    drop(ws);
    wait_for_detach(&server.registry, &id).await;

    let (mut ws, resumed) = server.login(Some(&id)).await;
    assert_eq!(resumed, id);
    assert_eq!(server.registry.count().await, 1);
    // The whole history arrives as the first frame, and only once.
    let replay = next_frame(&mut ws).await.expect("no replay frame");
    assert!(String::from_utf8_lossy(&replay).contains("before-2"));

    send_raw(&mut ws, "echo after-$((2+2))\n").await;
    let after = read_until(&mut ws, "after-4").await;
    assert!(!after.contains("before-2"), "history sent twice: {after:?}");

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn two_clients_share_one_session() {
    let server = TestServer::start().await;
    let (mut a, id) = server.login(None).await;
    let (mut b, joined) = server.login(Some(&id)).await;
    assert_eq!(joined, id);
    assert_eq!(server.registry.count().await, 1);
    assert_eq!(server.registry.lookup(&id).await.unwrap().info().connections, 2);

    send_raw(&mut a, "echo shared-$((5*5))\n").await;
    let mut seen_a = read_until(&mut a, "shared-25").await;
    let mut seen_b = read_until(&mut b, "shared-25").await;

    send_raw(&mut b, "exit\n").await;
    seen_a.push_str(&read_to_close(&mut a).await);
    seen_b.push_str(&read_to_close(&mut b).await);

    for seen in [&seen_a, &seen_b] {
        assert_eq!(seen.matches("shared-25").count(), 1, "output: {seen:?}");
        assert_eq!(parse_inline(seen), vec![ServerMessage::session_ended(id.as_str())]);
    }
    wait_for_count(&server.registry, 0).await;
    server.stop().await;
}

#[tokio::test]
async fn ignored_control_messages_keep_session_active() {
    let server = TestServer::start().await;
    let (mut ws, id) = server.login(None).await;
    let session = server.registry.lookup(&id).await.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    while session.info().idle < Duration::from_millis(500) {
        assert!(tokio::time::Instant::now() < deadline, "shell never went quiet");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    send_json(&mut ws, json!({"type": "terminate", "session_id": "someone-else"})).await;

    let deadline = tokio::time::Instant::now() + WAIT;
    while session.info().idle >= Duration::from_millis(500) {
        assert!(tokio::time::Instant::now() < deadline, "control message did not count as activity");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(session.info().connections, 1);

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn no_session_is_created_after_shutdown() {
    let server = TestServer::start().await;
    let registry = server.registry.clone();
    let mut ws = server.connect().await;
    server.stop().await;

    send_json(&mut ws, json!({"type": "auth", "token": TOKEN})).await;
    let resp = next_json(&mut ws).await;
    assert_eq!(resp["type"], "auth_response");
    assert_eq!(resp["success"], false);
    let message = resp["message"].as_str().unwrap();
    assert!(message.starts_with("Failed to create terminal"), "{message}");
    assert_eq!(registry.count().await, 0);
}

#[tokio::test]
async fn unknown_session_id_starts_fresh() {
    let server = TestServer::start().await;
    let (ws, id) = server.login(Some("0123456789abcdef0123456789abcdef")).await;
    assert_ne!(id, "0123456789abcdef0123456789abcdef");
    assert_eq!(server.registry.count().await, 1);
    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn terminate_ends_session_once() {
    let server = TestServer::start().await;
    let (mut ws, id) = server.login(None).await;

    // A terminate for some other session is ignored.
    send_json(&mut ws, json!({"type": "terminate", "session_id": "someone-else"})).await;
    send_raw(&mut ws, "echo still-$((3+3))\n").await;
    read_until(&mut ws, "still-6").await;

    send_json(&mut ws, json!({"type": "terminate", "session_id": id})).await;
    let rest = read_to_close(&mut ws).await;
    let ack = format!(
        r#"{{"type":"terminate_response","success":true,"message":"Session terminated","session_id":"{id}"}}"#
    );
    assert!(rest.contains(&ack), "no terminate ack in {rest:?}");
    wait_for_count(&server.registry, 0).await;
    assert!(!server.registry.terminate(&id).await);

    let (ws, fresh) = server.login(Some(&id)).await;
    assert_ne!(fresh, id);
    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn shell_exit_notifies_and_removes_session() {
    let server = TestServer::start().await;
    let (mut ws, id) = server.login(None).await;

    send_raw(&mut ws, "exit\n").await;
    let rest = read_to_close(&mut ws).await;
    let notices = parse_inline(&rest);
    assert_eq!(notices, vec![ServerMessage::session_ended(id.as_str())]);
    wait_for_count(&server.registry, 0).await;
    server.stop().await;
}

#[tokio::test]
async fn resize_reaches_the_shell() {
    let server = TestServer::start().await;
    let (mut ws, _) = server.login(None).await;

    send_json(&mut ws, json!({"type": "resize", "rows": 40, "cols": 100})).await;
    // Zero dimensions are ignored rather than applied.
    send_json(&mut ws, json!({"type": "resize", "rows": 0, "cols": 100})).await;
    send_raw(&mut ws, "stty size\n").await;
    read_until(&mut ws, "40 100").await;

    drop(ws);
    server.stop().await;
}

#[tokio::test]
async fn upgrade_checks_path_and_origin() {
    let server = TestServer::start().await;

    let wrong_path = format!("ws://{}/nope", server.addr);
    match connect_async(wrong_path).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status().as_u16(), 404),
        other => panic!("expected 404, got {:?}", other.map(|_| ())),
    }

    let mut request = server.url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "http://evil.example".parse().unwrap());
    match connect_async(request).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status().as_u16(), 403),
        other => panic!("expected 403, got {:?}", other.map(|_| ())),
    }

    let mut request = server.url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", ALLOWED_ORIGIN.parse().unwrap());
    assert!(connect_async(request).await.is_ok());

    server.stop().await;
}

#[tokio::test]
async fn shutdown_tears_down_sessions() {
    let server = TestServer::start().await;
    let (mut ws, _) = server.login(None).await;
    let (_other, _) = server.login(None).await;
    assert_eq!(server.registry.count().await, 2);

    let registry = server.registry.clone();
    server.stop().await;
    assert_eq!(registry.count().await, 0);
    read_to_close(&mut ws).await;
}
