//! End-to-end WebSocket gateway tests.
//!
//! Boots a real gateway on an ephemeral port with an in-memory worker and
//! drives it over tokio-tungstenite, the way an external client would.

use async_trait::async_trait;
use chatmux_core::config::{Config, WorkerConfig};
use chatmux_gateway::{GatewayContext, GatewayServer, MessagePipeline, SessionRegistry};
use chatmux_worker::{ClientOptions, RpcClient, WorkerLauncher, WorkerPool};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Worker that answers every run with a short fixed reply.
async fn echo_worker(remote: DuplexStream) {
    let (read_half, mut write_half) = tokio::io::split(remote);
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let cmd: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let id = cmd["id"].as_str().unwrap_or("").to_string();
        match cmd["op"].as_str() {
            Some("run") => {
                let _ = write_half
                    .write_all(
                        b"{\"type\":\"message_start\"}\n\
                          {\"type\":\"text_delta\",\"text\":\"hi there\"}\n\
                          {\"type\":\"message_end\"}\n",
                    )
                    .await;
            }
            Some("ping") => {
                let response = format!(
                    "{{\"type\":\"response\",\"id\":\"{}\",\"ok\":true,\"data\":{{\"pong\":true}}}}\n",
                    id
                );
                let _ = write_half.write_all(response.as_bytes()).await;
            }
            _ => {}
        }
    }
}

struct EchoLauncher;

#[async_trait]
impl WorkerLauncher for EchoLauncher {
    async fn launch(
        &self,
        id: &str,
        exit_tx: mpsc::UnboundedSender<String>,
    ) -> chatmux_worker::Result<RpcClient> {
        let (local, remote) = tokio::io::duplex(16384);
        tokio::spawn(echo_worker(remote));
        let (read_half, write_half) = tokio::io::split(local);
        let options = ClientOptions {
            request_timeout: Duration::from_secs(2),
            turn_idle_timeout: Duration::from_secs(2),
            ..ClientOptions::default()
        };
        Ok(RpcClient::from_io(
            id,
            write_half,
            read_half,
            options,
            Some(exit_tx),
        ))
    }
}

/// Boot a gateway on port 0 and return its ws URL. The TempDir keeps the
/// session store alive for the test's duration.
async fn start_gateway(auth_token: Option<&str>) -> (String, TempDir) {
    let dir = TempDir::new().unwrap();

    let mut config = Config::default();
    config.gateway.port = 0;
    config.gateway.auth_token = auth_token.map(str::to_string);
    config.worker = WorkerConfig {
        min: 1,
        max: 2,
        spawn_backoff_ms: 10,
        health_check_secs: 3600,
        ..WorkerConfig::default()
    };

    let pool = WorkerPool::new(config.worker.clone(), Arc::new(EchoLauncher));
    pool.start().await;
    let registry =
        Arc::new(SessionRegistry::open(config.session.clone(), dir.path()).unwrap());
    let pipeline = Arc::new(
        MessagePipeline::new(pool.clone(), registry.clone())
            .with_acquire_timeout(Duration::from_secs(2)),
    );

    let context = Arc::new(GatewayContext::new(config, pool, registry, pipeline));
    let server = GatewayServer::new(context).await;
    let listener = server.listen().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    (format!("ws://{}/ws", addr), dir)
}

async fn connect(url: &str) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send_json(ws: &mut WsClient, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn recv_json(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_ping_roundtrip() {
    let (url, _dir) = start_gateway(None).await;
    let mut ws = connect(&url).await;

    send_json(&mut ws, serde_json::json!({"type": "req", "id": "1", "method": "ping"})).await;
    let res = recv_json(&mut ws).await;
    assert_eq!(res["type"], "res");
    assert_eq!(res["id"], "1");
    assert_eq!(res["ok"], true);
    assert_eq!(res["result"]["pong"], true);
}

#[tokio::test]
async fn test_chat_send_streams_events_then_response() {
    let (url, _dir) = start_gateway(None).await;
    let mut ws = connect(&url).await;

    send_json(
        &mut ws,
        serde_json::json!({
            "type": "req",
            "id": "42",
            "method": "chat.send",
            "params": {"channel": "web", "conversationId": "1", "text": "hello"},
        }),
    )
    .await;

    // streamed events arrive as chat.event frames; the response settles last
    let mut texts = Vec::new();
    let mut saw_done = false;
    loop {
        let frame = recv_json(&mut ws).await;
        match frame["type"].as_str() {
            Some("event") => {
                assert_eq!(frame["event"], "chat.event");
                match frame["payload"]["type"].as_str() {
                    Some("text") => texts.push(frame["payload"]["text"].as_str().unwrap().to_string()),
                    Some("done") => {
                        assert_eq!(frame["payload"]["status"], "completed");
                        saw_done = true;
                    }
                    other => panic!("unexpected payload type: {:?}", other),
                }
            }
            Some("res") => {
                assert_eq!(frame["id"], "42");
                assert_eq!(frame["ok"], true);
                assert_eq!(frame["result"]["status"], "completed");
                break;
            }
            other => panic!("unexpected frame type: {:?}", other),
        }
    }
    assert_eq!(texts.concat(), "hi there");
    assert!(saw_done);
}

#[tokio::test]
async fn test_unknown_method_rejected() {
    let (url, _dir) = start_gateway(None).await;
    let mut ws = connect(&url).await;

    send_json(&mut ws, serde_json::json!({"type": "req", "id": "7", "method": "no.such"})).await;
    let res = recv_json(&mut ws).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["kind"], "method_not_found");
}

#[tokio::test]
async fn test_auth_gate() {
    let (url, _dir) = start_gateway(Some("sekrit")).await;
    let mut ws = connect(&url).await;

    // anything before connect is rejected
    send_json(&mut ws, serde_json::json!({"type": "req", "id": "1", "method": "ping"})).await;
    let res = recv_json(&mut ws).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["kind"], "unauthorized");

    // wrong token is rejected
    send_json(
        &mut ws,
        serde_json::json!({
            "type": "req", "id": "2", "method": "connect",
            "params": {"token": "wrong"},
        }),
    )
    .await;
    let res = recv_json(&mut ws).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["kind"], "unauthorized");

    // correct token unlocks the connection
    send_json(
        &mut ws,
        serde_json::json!({
            "type": "req", "id": "3", "method": "connect",
            "params": {"token": "sekrit"},
        }),
    )
    .await;
    let res = recv_json(&mut ws).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["result"]["server"], "chatmux");

    send_json(&mut ws, serde_json::json!({"type": "req", "id": "4", "method": "ping"})).await;
    let res = recv_json(&mut ws).await;
    assert_eq!(res["ok"], true);
}
