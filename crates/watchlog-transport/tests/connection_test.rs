// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use watchlog_transport::connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, Connector, ReconnectPolicy, Session,
    WebSocketConnector,
};
use watchlog_transport::identity::{AuthIdentity, IdentitySource};
use watchlog_transport::{DeferredEmitter, TransportError};

const OPEN: &str = r#"0{"sid":"engine-1","pingInterval":25000,"pingTimeout":20000}"#;
const CONNECTED: &str = r#"40{"sid":"socket-1"}"#;

struct CountingIdentity {
    calls: AtomicUsize,
}

impl IdentitySource for CountingIdentity {
    fn resolve(&self) -> AuthIdentity {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        AuthIdentity {
            api_key: "test-key".to_string(),
            host: format!("host-{call}"),
            ip: None,
            uuid: "uuid-1".to_string(),
            distro: "Ubuntu".to_string(),
            release: "22.04".to_string(),
            agent_version: "0.1.1".to_string(),
        }
    }
}

struct ScriptedSession {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {}
}

/// Hands out sessions only when the test provides one, so the manager stays
/// in the connecting state until then.
struct ScriptedConnector {
    sessions: Mutex<mpsc::UnboundedReceiver<ScriptedSession>>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, _url: &str) -> Result<Box<dyn Session>, TransportError> {
        match self.sessions.lock().await.recv().await {
            Some(session) => Ok(Box::new(session)),
            None => Err(TransportError::Closed),
        }
    }
}

/// Server side of one scripted session.
struct ServerEnd {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    async fn next(&mut self) -> String {
        timeout(Duration::from_secs(2), self.from_client.recv())
            .await
            .expect("client did not send in time")
            .expect("client session dropped")
    }

    async fn assert_silent(&mut self) {
        assert!(
            timeout(Duration::from_millis(100), self.from_client.recv())
                .await
                .is_err(),
            "unexpected frame from client"
        );
    }
}

fn session_pair(frames: &[&str]) -> (ScriptedSession, ServerEnd) {
    let (to_client, inbound) = mpsc::unbounded_channel();
    let (outbound, from_client) = mpsc::unbounded_channel();
    for frame in frames {
        to_client.send(frame.to_string()).unwrap();
    }
    (
        ScriptedSession { inbound, outbound },
        ServerEnd {
            to_client,
            from_client,
        },
    )
}

struct Harness {
    emitter: DeferredEmitter,
    sessions: mpsc::UnboundedSender<ScriptedSession>,
    identity: Arc<CountingIdentity>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

fn start() -> Harness {
    let (sessions, sessions_rx) = mpsc::unbounded_channel();
    let identity = Arc::new(CountingIdentity {
        calls: AtomicUsize::new(0),
    });
    let mut config = ConnectionConfig::new("http://collector.test");
    config.reconnect = ReconnectPolicy {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(20),
        jitter: 0.0,
    };
    let cancel = CancellationToken::new();
    let (manager, emitter) = ConnectionManager::new(
        config,
        identity.clone(),
        Arc::new(ScriptedConnector {
            sessions: Mutex::new(sessions_rx),
        }),
        cancel.clone(),
    );
    let task = tokio::spawn(manager.run());
    Harness {
        emitter,
        sessions,
        identity,
        cancel,
        task,
    }
}

async fn wait_for_state(emitter: &DeferredEmitter, state: ConnectionState) {
    let mut rx = emitter.subscribe();
    timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
        .await
        .expect("state not reached in time")
        .unwrap();
}

fn event(frame: &str) -> (String, Value) {
    let body = frame.strip_prefix("42").expect("not an event frame");
    let value: Value = serde_json::from_str(body).unwrap();
    (value[0].as_str().unwrap().to_string(), value[1].clone())
}

#[tokio::test]
async fn emission_while_disconnected_is_sent_once_after_connect() {
    let harness = start();
    harness
        .emitter
        .emit_when_connected("customMetrics", json!([{"metric": "orders", "count": 2}]))
        .unwrap();
    assert!(!harness.emitter.is_connected());

    let (session, mut server) = session_pair(&[OPEN, CONNECTED]);
    harness.sessions.send(session).unwrap();

    let connect = server.next().await;
    assert!(connect.starts_with("40"));
    let auth: Value = serde_json::from_str(&connect[2..]).unwrap();
    assert_eq!(auth["apiKey"], "test-key");
    assert_eq!(auth["uuid"], "uuid-1");
    assert_eq!(auth["agentVersion"], "0.1.1");

    let (name, payload) = event(&server.next().await);
    assert_eq!(name, "customMetrics");
    assert_eq!(payload, json!([{"metric": "orders", "count": 2}]));
    server.assert_silent().await;

    harness.cancel.cancel();
    harness.task.await.unwrap();
}

#[tokio::test]
async fn pending_emissions_keep_call_order_ahead_of_live_ones() {
    let harness = start();
    for i in 0..3 {
        harness
            .emitter
            .emit_when_connected("serverMetricsArray", json!({ "seq": i }))
            .unwrap();
    }

    let (session, mut server) = session_pair(&[OPEN, CONNECTED]);
    harness.sessions.send(session).unwrap();
    server.next().await;
    wait_for_state(&harness.emitter, ConnectionState::Connected).await;

    harness
        .emitter
        .emit_when_connected("serverMetricsArray", json!({ "seq": 3 }))
        .unwrap();

    for i in 0..4 {
        let (_, payload) = event(&server.next().await);
        assert_eq!(payload["seq"], i);
    }

    harness.cancel.cancel();
    harness.task.await.unwrap();
}

#[tokio::test]
async fn answers_pings_and_disconnects_on_shutdown() {
    let harness = start();
    let (session, mut server) = session_pair(&[OPEN, CONNECTED]);
    harness.sessions.send(session).unwrap();
    server.next().await;
    wait_for_state(&harness.emitter, ConnectionState::Connected).await;

    server.to_client.send("2".to_string()).unwrap();
    assert_eq!(server.next().await, "3");

    harness.cancel.cancel();
    assert_eq!(server.next().await, "41");
    harness.task.await.unwrap();
    assert_eq!(harness.emitter.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn rejected_connect_is_retried_with_fresh_identity() {
    let harness = start();
    let (rejected, mut first) = session_pair(&[OPEN, r#"44{"message":"invalid api key"}"#]);
    harness.sessions.send(rejected).unwrap();
    first.next().await;

    let (session, mut second) = session_pair(&[OPEN, CONNECTED]);
    harness.sessions.send(session).unwrap();
    let connect = second.next().await;
    let auth: Value = serde_json::from_str(&connect[2..]).unwrap();
    assert_eq!(auth["host"], "host-1");
    assert_eq!(auth["uuid"], "uuid-1");
    assert!(harness.identity.calls.load(Ordering::SeqCst) >= 2);

    wait_for_state(&harness.emitter, ConnectionState::Connected).await;
    harness.cancel.cancel();
    harness.task.await.unwrap();
}

#[tokio::test]
async fn emissions_after_a_lost_session_reach_the_next_one() {
    let harness = start();
    let (session, mut first) = session_pair(&[OPEN, CONNECTED]);
    harness.sessions.send(session).unwrap();
    first.next().await;
    wait_for_state(&harness.emitter, ConnectionState::Connected).await;

    // server goes away
    drop(first.to_client);
    let mut state = harness.emitter.subscribe();
    timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s != ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    harness
        .emitter
        .emit_when_connected("logs/watchlist", json!({"message": "after outage"}))
        .unwrap();

    let (session, mut second) = session_pair(&[OPEN, CONNECTED]);
    harness.sessions.send(session).unwrap();
    second.next().await;
    let (name, payload) = event(&second.next().await);
    assert_eq!(name, "logs/watchlist");
    assert_eq!(payload["message"], "after outage");
    assert!(first.from_client.try_recv().is_err());

    harness.cancel.cancel();
    harness.task.await.unwrap();
}

#[tokio::test]
async fn websocket_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(OPEN.to_string())).await.unwrap();

        let mut received = Vec::new();
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                if text.starts_with("40") {
                    ws.send(Message::Text(CONNECTED.to_string())).await.unwrap();
                    ws.send(Message::Text("2".to_string())).await.unwrap();
                }
                received.push(text);
                if received.len() == 3 {
                    break;
                }
            }
        }
        received
    });

    let identity = Arc::new(CountingIdentity {
        calls: AtomicUsize::new(0),
    });
    let cancel = CancellationToken::new();
    let (manager, emitter) = ConnectionManager::new(
        ConnectionConfig::new(format!("http://{addr}")),
        identity,
        Arc::new(WebSocketConnector),
        cancel.clone(),
    );
    emitter
        .emit_when_connected("ai-trace", json!({"spans": []}))
        .unwrap();
    let task = tokio::spawn(manager.run());

    let received = timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not finish")
        .unwrap();
    assert!(received[0].starts_with("40{"));
    assert!(received.contains(&"3".to_string()));
    assert!(received.contains(&r#"42["ai-trace",{"spans":[]}]"#.to_string()));

    cancel.cancel();
    task.await.unwrap();
}
