//! End-to-end tests for the WebSocket invalidation endpoint.

use std::time::Duration;

use freshet_core::{ClientMessage, ResourceKey, Sequence, ServerMessage};
use freshet_server::BroadcasterConfig;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

#[path = "support/server.rs"]
mod test_server_support;
use test_server_support::{spawn_server, TestServer};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn key(s: &str) -> ResourceKey {
    ResourceKey::new(s).expect("valid key")
}

async fn connect(server: &TestServer) -> Ws {
    let (ws, _) = connect_async(server.ws_url()).await.expect("ws connect");
    ws
}

async fn next_message(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("message within timeout")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("decode server message");
        }
    }
}

async fn send(ws: &mut Ws, message: &ClientMessage) {
    let text = serde_json::to_string(message).expect("encode");
    ws.send(Message::Text(text)).await.expect("send frame");
}

async fn put(server: &TestServer, k: &str, body: serde_json::Value) -> reqwest::StatusCode {
    reqwest::Client::new()
        .put(server.http_url(&format!("/api/v1/resources/{}", k)))
        .json(&body)
        .send()
        .await
        .expect("put request")
        .status()
}

#[tokio::test]
async fn test_subscribe_then_write_delivers_invalidation() {
    let server = spawn_server(BroadcasterConfig::default()).await;
    let mut ws = connect(&server).await;

    assert!(matches!(
        next_message(&mut ws).await,
        ServerMessage::Connected { .. }
    ));

    send(&mut ws, &ClientMessage::Subscribe { resource_key: key("U1") }).await;
    assert_eq!(
        next_message(&mut ws).await,
        ServerMessage::Subscribed {
            resource_key: key("U1"),
            sequence: Sequence::ZERO,
        }
    );

    assert!(put(&server, "U1", json!({ "name": "b" })).await.is_success());
    match next_message(&mut ws).await {
        ServerMessage::Invalidated {
            resource_key,
            sequence,
            ..
        } => {
            assert_eq!(resource_key, key("U1"));
            assert_eq!(sequence, Sequence::new(1));
        }
        other => panic!("expected invalidation, got {:?}", other),
    }

    let body: serde_json::Value = reqwest::get(server.http_url("/api/v1/resources/U1"))
        .await
        .expect("get request")
        .json()
        .await
        .expect("json body");
    assert_eq!(body["payload"], json!({ "name": "b" }));
}

#[tokio::test]
async fn test_writes_arrive_in_sequence_order() {
    let server = spawn_server(BroadcasterConfig::default()).await;
    let mut ws = connect(&server).await;
    next_message(&mut ws).await;
    send(&mut ws, &ClientMessage::Subscribe { resource_key: key("U1") }).await;
    next_message(&mut ws).await;

    for i in 0..5 {
        assert!(put(&server, "U1", json!({ "rev": i })).await.is_success());
    }

    let mut seen = Vec::new();
    while seen.len() < 5 {
        if let ServerMessage::Invalidated { sequence, .. } = next_message(&mut ws).await {
            seen.push(sequence.value());
        }
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_unsubscribed_key_is_not_delivered() {
    let server = spawn_server(BroadcasterConfig::default()).await;
    let mut ws = connect(&server).await;
    next_message(&mut ws).await;
    send(&mut ws, &ClientMessage::Subscribe { resource_key: key("U1") }).await;
    next_message(&mut ws).await;

    assert!(put(&server, "U2", json!({ "name": "x" })).await.is_success());
    assert!(put(&server, "U1", json!({ "name": "y" })).await.is_success());

    match next_message(&mut ws).await {
        ServerMessage::Invalidated { resource_key, .. } => assert_eq!(resource_key, key("U1")),
        other => panic!("expected invalidation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_frame_gets_error_reply() {
    let server = spawn_server(BroadcasterConfig::default()).await;
    let mut ws = connect(&server).await;
    next_message(&mut ws).await;

    ws.send(Message::Text("not json".to_string()))
        .await
        .expect("send frame");
    assert!(matches!(
        next_message(&mut ws).await,
        ServerMessage::Error { .. }
    ));

    // The session survives a bad frame
    send(&mut ws, &ClientMessage::Subscribe { resource_key: key("U1") }).await;
    assert!(matches!(
        next_message(&mut ws).await,
        ServerMessage::Subscribed { .. }
    ));
}

#[tokio::test]
async fn test_close_removes_session() {
    let server = spawn_server(BroadcasterConfig::default()).await;
    let mut ws = connect(&server).await;
    next_message(&mut ws).await;
    assert_eq!(server.broadcaster.session_count(), 1);

    ws.close(None).await.expect("close");
    drop(ws);

    let removed = timeout(Duration::from_secs(5), async {
        while server.broadcaster.session_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(removed.is_ok(), "session should be removed after close");
}

#[tokio::test]
async fn test_session_limit_rejects_upgrade() {
    let server = spawn_server(BroadcasterConfig {
        max_sessions: Some(1),
        ..BroadcasterConfig::default()
    })
    .await;
    let mut first = connect(&server).await;
    next_message(&mut first).await;

    assert!(connect_async(server.ws_url()).await.is_err());
}

#[tokio::test]
async fn test_resource_routes() {
    let server = spawn_server(BroadcasterConfig::default()).await;

    let missing = reqwest::get(server.http_url("/api/v1/resources/nobody"))
        .await
        .expect("get request");
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    assert!(put(&server, "current-user", json!({ "name": "a" }))
        .await
        .is_success());
    let found = reqwest::get(server.http_url("/api/v1/resources/current-user"))
        .await
        .expect("get request");
    assert_eq!(found.status(), reqwest::StatusCode::OK);
    assert_eq!(
        server.broadcaster.current_sequence(&key("current-user")),
        Sequence::new(1)
    );
}

#[tokio::test]
async fn test_health_and_metrics() {
    let server = spawn_server(BroadcasterConfig::default()).await;

    let health: serde_json::Value = reqwest::get(server.http_url("/health"))
        .await
        .expect("health request")
        .json()
        .await
        .expect("json body");
    assert_eq!(health["status"], "healthy");

    let metrics = reqwest::get(server.http_url("/metrics"))
        .await
        .expect("metrics request");
    assert!(metrics.status().is_success());
    let text = metrics.text().await.expect("metrics body");
    assert!(text.contains("freshet_sessions"));
}
