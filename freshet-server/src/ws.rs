//! WebSocket Invalidation Endpoint
//!
//! Upgrades `GET /api/v1/ws` and bridges one socket to one broadcaster
//! session.
//!
//! ## Architecture
//!
//! - A reader task decodes `subscribe`/`unsubscribe` frames and applies them
//!   to the broadcaster
//! - The connection task is the only writer; it drains the session queue
//!   into the socket
//! - When either side ends, the session is removed from the broadcaster

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use freshet_core::{ClientMessage, ServerMessage, SessionId};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use crate::broadcaster::ChangeBroadcaster;
use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::state::AppState;

/// WebSocket upgrade handler.
///
/// Rejects the upgrade with 503 when the session limit is already reached.
///
/// ## Protocol
///
/// 1. Client connects and the connection is upgraded
/// 2. Server sends `connected` with the new session id
/// 3. Client sends `subscribe` for each key it caches
/// 4. Server answers each with `subscribed` carrying the current sequence
/// 5. Server streams `invalidated` frames for subscribed keys
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    if let Some(max_sessions) = state.broadcaster.config().max_sessions {
        if state.broadcaster.session_count() >= max_sessions {
            return Err(ApiError::new(
                ErrorCode::SessionLimitReached,
                format!("Session limit of {} reached", max_sessions),
            ));
        }
    }

    debug!("WebSocket connection request");
    let broadcaster = state.broadcaster.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, broadcaster)))
}

/// Run one connection until either side closes it.
async fn handle_socket(socket: WebSocket, broadcaster: Arc<ChangeBroadcaster>) {
    let (mut sender, mut receiver) = socket.split();

    let mut channel = match broadcaster.on_connect() {
        Ok(channel) => channel,
        Err(e) => {
            warn!(error = %e, "Refusing WebSocket session");
            let refusal = ServerMessage::Error {
                message: e.to_string(),
            };
            let _ = send_message(&mut sender, &refusal).await;
            let _ = sender.close().await;
            return;
        }
    };
    let session_id = channel.session_id();
    info!(session_id = %session_id, "WebSocket connected");

    let reader_broadcaster = broadcaster.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    handle_client_text(&reader_broadcaster, session_id, &text);
                }
                Ok(Message::Close(_)) => {
                    debug!(session_id = %session_id, "Client sent close frame");
                    break;
                }
                Ok(Message::Binary(data)) => {
                    debug!(session_id = %session_id, len = data.len(), "Binary frame ignored");
                    reader_broadcaster.send_error(session_id, "Binary frames are not supported");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            next = channel.recv() => {
                match next {
                    Some(msg) => {
                        if let Err(e) = send_message(&mut sender, &msg).await {
                            error!(
                                session_id = %session_id,
                                error = %e,
                                "Failed to send message, closing connection"
                            );
                            break;
                        }
                    }
                    None => {
                        info!(session_id = %session_id, "Session dropped by broadcaster");
                        break;
                    }
                }
            }

            _ = &mut recv_task => {
                debug!(session_id = %session_id, "Receiver task finished");
                break;
            }
        }
    }

    broadcaster.on_disconnect(session_id);
    recv_task.abort();
    let _ = sender.close().await;
    info!(session_id = %session_id, "WebSocket disconnected");
}

fn handle_client_text(broadcaster: &ChangeBroadcaster, session_id: SessionId, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(session_id = %session_id, error = %e, "Malformed client frame");
            broadcaster.send_error(session_id, format!("Malformed message: {}", e));
            return;
        }
    };

    let result = match message {
        ClientMessage::Subscribe { resource_key } => broadcaster
            .subscribe(session_id, resource_key)
            .map(|_| ()),
        ClientMessage::Unsubscribe { resource_key } => broadcaster
            .unsubscribe(session_id, &resource_key)
            .map(|_| ()),
    };
    if let Err(e) = result {
        debug!(session_id = %session_id, error = %e, "Client message not applied");
    }
}

/// Serialize a message and send it as a text frame.
async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).map_err(|e| {
        error!(error = %e, "Failed to serialize message");
        axum::Error::new(e)
    })?;

    sender.send(Message::Text(json)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use freshet_core::ResourceKey;

    #[test]
    fn test_malformed_text_queues_error() {
        let broadcaster = ChangeBroadcaster::default();
        let mut channel = broadcaster.on_connect().expect("connect");
        let _ = channel.try_recv();

        handle_client_text(&broadcaster, channel.session_id(), "{\"type\":\"explode\"}");
        assert!(matches!(
            channel.try_recv(),
            Some(ServerMessage::Error { .. })
        ));
    }

    #[test]
    fn test_invalid_key_is_rejected_at_decode() {
        let broadcaster = ChangeBroadcaster::default();
        let mut channel = broadcaster.on_connect().expect("connect");
        let _ = channel.try_recv();

        handle_client_text(
            &broadcaster,
            channel.session_id(),
            r#"{"type":"subscribe","resource_key":""}"#,
        );
        assert!(matches!(
            channel.try_recv(),
            Some(ServerMessage::Error { .. })
        ));
    }

    #[test]
    fn test_subscribe_text_applies_to_session() {
        let broadcaster = ChangeBroadcaster::default();
        let mut channel = broadcaster.on_connect().expect("connect");
        let _ = channel.try_recv();

        handle_client_text(
            &broadcaster,
            channel.session_id(),
            r#"{"type":"subscribe","resource_key":"U1"}"#,
        );
        let key = ResourceKey::new("U1").expect("valid key");
        assert_eq!(broadcaster.subscriber_count(&key), 1);
        assert!(matches!(
            channel.try_recv(),
            Some(ServerMessage::Subscribed { .. })
        ));

        handle_client_text(
            &broadcaster,
            channel.session_id(),
            r#"{"type":"unsubscribe","resource_key":"U1"}"#,
        );
        assert_eq!(broadcaster.subscriber_count(&key), 0);
    }
}
