//! Push-socket transport.
//!
//! The axum upgrade handler plus the per-connection task: one task owns
//! each live socket, reads inbound messages serially, posts them to the
//! hub, and drains the connection's outbound queue.  Admission runs
//! before the upgrade so a rejected client never sees the hello.

use crate::health::HealthReporter;
use crate::hub::{SubscriberHub, SubscriptionError};
use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use f1_protocol::{ClientMessage, ServerMessage};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared handler state for the push socket and the health endpoints.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SubscriberHub>,
    pub health: Arc<HealthReporter>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(crate::health::healthz))
        .route("/readyz", get(crate::health::readyz))
        .route("/api/v1/status", get(crate::health::status))
        .with_state(state)
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let origin = header_str(&headers, "origin");
    let user_agent = header_str(&headers, "user-agent");
    if let Err(error) = state
        .hub
        .check_admission(addr.ip(), origin, user_agent)
        .await
    {
        let status = match error {
            SubscriptionError::ConnectionCap => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::FORBIDDEN,
        };
        debug!(ip = %addr.ip(), error = %error, "connection rejected");
        return (status, error.to_string()).into_response();
    }
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub, addr.ip()))
        .into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<SubscriberHub>, ip: IpAddr) {
    // Registration re-checks the per-IP cap under the write guard, so a
    // race between two upgrades from one address still respects the bound.
    let (connection_id, mut outbound) = match hub.register(ip).await {
        Ok(pair) => pair,
        Err(error) => {
            let reply = ServerMessage::ConnectionStatus {
                connected: false,
                error: Some(error.to_string()),
            };
            if let Ok(json) = serde_json::to_string(&reply) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
            return;
        }
    };

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                match queued {
                    Some(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // The hub dropped this connection (idle eviction).
                    None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    None | Some(Err(_)) => break,
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => hub.handle_message(&connection_id, message).await,
                            Err(e) => warn!(
                                connection_id = %connection_id,
                                error = %e,
                                "unrecognized client message"
                            ),
                        }
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    hub.unregister(&connection_id).await;
}
