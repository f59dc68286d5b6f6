//! WebSocket Request Gateway
//!
//! Exposes the unary message service to browsers. Every text frame carries one
//! request and gets exactly one reply frame:
//!
//! ```text
//! → {"type": "SendMessage", "message": {"room_id": "lobby", "sender_id": "ana", "text": "hi"}}
//! ← {"type": "SendMessageResult", "data": {"message": {...}}}
//!
//! → {"type": "GetMessages", "message": {"room_id": "lobby", "limit": 20}}
//! ← {"type": "GetMessageResult", "data": {"messages": [...]}}
//!
//! ← {"error": "invalid argument: room_id is required", "code": "invalid_argument"}
//! ```
//!
//! Bad JSON and unknown request types are answered with an error frame; the
//! socket stays open. Each request runs under the service's request timeout.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn, Instrument};

use crate::error::RelayError;
use crate::events::ChatMessage;
use crate::service::MessageService;
use crate::shutdown::ShutdownListener;

/// Request type for submitting a message
pub const SEND_MESSAGE: &str = "SendMessage";
/// Request type for reading history
pub const GET_MESSAGES: &str = "GetMessages";
/// Reply type for `SendMessage`
pub const SEND_MESSAGE_RESULT: &str = "SendMessageResult";
/// Reply type for `GetMessages`; singular, as existing clients expect
pub const GET_MESSAGES_RESULT: &str = "GetMessageResult";

/// Incoming request frame
#[derive(Debug, Clone, Deserialize)]
pub struct WsRequest {
    /// `SendMessage` or `GetMessages`
    #[serde(rename = "type")]
    pub kind: String,
    /// Request payload, shape depends on `kind`
    #[serde(default)]
    pub message: serde_json::Value,
}

/// Payload of a `GetMessages` request
#[derive(Debug, Clone, Default, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    room_id: String,
    #[serde(default)]
    limit: i64,
}

/// Successful reply frame
#[derive(Debug, Clone, Serialize)]
pub struct WsEnvelope<T> {
    /// Reply type, see [`SEND_MESSAGE_RESULT`] and [`GET_MESSAGES_RESULT`]
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Reply payload
    pub data: T,
}

/// Error reply frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WsError {
    /// Human-readable message
    pub error: String,
    /// Stable error code
    pub code: String,
}

impl WsError {
    fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

impl From<RelayError> for WsError {
    fn from(err: RelayError) -> Self {
        Self::new(err.to_string(), err.code())
    }
}

/// `SendMessageResult` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendMessageReply {
    /// The stored message
    pub message: ChatMessage,
}

/// `GetMessageResult` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetMessagesReply {
    /// History, oldest first
    pub messages: Vec<ChatMessage>,
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        format!(r#"{{"error":"failed to encode reply: {e}","code":"internal"}}"#)
    })
}

fn reply<T: Serialize>(kind: &'static str, data: T) -> String {
    to_json(&WsEnvelope { kind, data })
}

/// Handle one request frame and produce the reply frame
pub async fn handle_request(service: &MessageService, raw: &str) -> String {
    let request: WsRequest = match serde_json::from_str(raw) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Rejecting malformed request");
            return to_json(&WsError::new("invalid json", "invalid_argument"));
        }
    };

    let deadline = service.config().request_timeout;
    match request.kind.as_str() {
        SEND_MESSAGE => {
            let msg: ChatMessage = match serde_json::from_value(request.message) {
                Ok(msg) => msg,
                Err(e) => {
                    return to_json(&WsError::new(
                        format!("invalid message: {e}"),
                        "invalid_argument",
                    ))
                }
            };
            match service.submit_message_within(msg, deadline).await {
                Ok(message) => reply(SEND_MESSAGE_RESULT, SendMessageReply { message }),
                Err(e) => to_json(&WsError::from(e)),
            }
        }
        GET_MESSAGES => {
            let query: HistoryQuery = match serde_json::from_value(request.message) {
                Ok(query) => query,
                Err(e) => {
                    return to_json(&WsError::new(
                        format!("invalid query: {e}"),
                        "invalid_argument",
                    ))
                }
            };
            match service
                .get_messages_within(&query.room_id, query.limit, deadline)
                .await
            {
                Ok(messages) => reply(GET_MESSAGES_RESULT, GetMessagesReply { messages }),
                Err(e) => to_json(&WsError::from(e)),
            }
        }
        other => to_json(&WsError::new(
            format!("unknown request type: {other}"),
            "invalid_argument",
        )),
    }
}

/// Serve one WebSocket client until it closes or shutdown fires
pub async fn handle_ws_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: MessageService,
    mut shutdown: ShutdownListener,
) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    info!(%peer, "WebSocket client connected");

    let (mut sink, mut stream) = ws_stream.split();

    loop {
        let frame = tokio::select! {
            () = shutdown.triggered() => {
                let _ = sink.send(Message::Close(None)).await;
                info!(%peer, "WebSocket closed by shutdown");
                return;
            }
            frame = stream.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Binary(_))) => {
                let err = to_json(&WsError::new("binary frames are not supported", "invalid_argument"));
                if sink.send(Message::text(err)).await.is_err() {
                    break;
                }
                continue;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(%peer, error = %e, "WebSocket read error");
                break;
            }
        };

        let response = handle_request(&service, text.as_str()).await;
        if let Err(e) = sink.send(Message::text(response)).await {
            warn!(%peer, error = %e, "WebSocket write error");
            break;
        }
    }

    info!(%peer, "WebSocket client disconnected");
}

/// Accept WebSocket clients until shutdown fires
///
/// Each client runs in its own task; all of them are stopped on shutdown.
pub async fn serve_websocket(
    listener: TcpListener,
    service: MessageService,
    mut shutdown: ShutdownListener,
) {
    let mut clients = JoinSet::new();
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "WebSocket gateway listening");
    }

    loop {
        tokio::select! {
            () = shutdown.triggered() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let service = service.clone();
                    let listener = shutdown.clone();
                    clients.spawn(
                        handle_ws_connection(stream, peer, service, listener)
                            .instrument(tracing::info_span!("ws_client", %peer)),
                    );
                }
                Err(e) => warn!(error = %e, "WebSocket accept failed"),
            },
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
        }
    }

    clients.shutdown().await;
    info!("WebSocket gateway stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    async fn call(service: &MessageService, request: Value) -> Value {
        let raw = handle_request(service, &request.to_string()).await;
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_send_then_get() {
        let service = MessageService::default();

        let sent = call(
            &service,
            json!({"type": "SendMessage", "message": {"room_id": "lobby", "sender_id": "ana", "text": "hi"}}),
        )
        .await;
        assert_eq!(sent["type"], "SendMessageResult");
        assert_eq!(sent["data"]["message"]["text"], "hi");
        assert!(!sent["data"]["message"]["id"].as_str().unwrap().is_empty());

        let history = call(
            &service,
            json!({"type": "GetMessages", "message": {"room_id": "lobby"}}),
        )
        .await;
        assert_eq!(history["type"], "GetMessageResult");
        assert_eq!(history["data"]["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_room_is_invalid_argument() {
        let service = MessageService::default();
        let reply = call(
            &service,
            json!({"type": "SendMessage", "message": {"sender_id": "ana", "text": "hi"}}),
        )
        .await;
        assert_eq!(reply["code"], "invalid_argument");
        assert!(reply["error"].as_str().unwrap().contains("room_id"));
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let service = MessageService::default();
        let raw = handle_request(&service, "{not json").await;
        let err: WsError = serde_json::from_str(&raw).unwrap();
        assert_eq!(err, WsError::new("invalid json", "invalid_argument"));
    }

    #[tokio::test]
    async fn test_unknown_request_type() {
        let service = MessageService::default();
        let reply = call(&service, json!({"type": "DeleteMessage", "message": {}})).await;
        assert_eq!(reply["error"], "unknown request type: DeleteMessage");
    }

    #[tokio::test]
    async fn test_unknown_room_history_is_empty() {
        let service = MessageService::default();
        let reply = call(
            &service,
            json!({"type": "GetMessages", "message": {"room_id": "room-x", "limit": 0}}),
        )
        .await;
        assert_eq!(reply["data"]["messages"], json!([]));
    }
}
