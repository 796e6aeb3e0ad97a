use axum::Json;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tracing::info;

use beacon_types::api::EventsWsTokenResponse;
use beacon_types::events::CoordinatorEvent;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::services::broker::{BrokerMessage, EventBroker};
use crate::state::AppState;

/// GET /api/v1/events/token -- mint the short-lived WS token a browser can
/// smuggle through the subprotocol list.
pub async fn ws_token(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<EventsWsTokenResponse>, ApiError> {
    let ws_token = beacon_ticket::issue_events_ws_token(
        &state.config.secret_key,
        &auth.principal_id,
        &auth.client_device_id,
        state.config.events_ws_token_ttl_seconds,
    );
    Ok(Json(EventsWsTokenResponse {
        ws_token,
        expires_in: state.config.events_ws_token_ttl_seconds.max(0) as u64,
    }))
}

fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// GET /api/v1/events/ws -- subscribe to per-principal events.
///
/// Browsers cannot set headers on a WebSocket upgrade, so the events_ws
/// token rides in the subprotocol list as `auth.<token>`. The token is
/// validated BEFORE upgrading; a bad token gets a plain 401.
pub async fn events_ws(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let protocols = offered_protocols(&headers);
    let (token, auth_protocol) = protocols
        .iter()
        .find(|protocol| protocol.starts_with("auth."))
        .map(|protocol| (protocol[5..].to_string(), protocol.clone()))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = beacon_ticket::decode_token(&state.config.secret_key, &token)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    if claims.kind() != beacon_ticket::TicketKind::EventsWs.as_str() {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let principal_id = claims.str_claim("principal_id").to_string();
    if principal_id.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    // Echo back the first non-auth subprotocol the client offered.
    let selected = protocols
        .iter()
        .find(|protocol| **protocol != auth_protocol)
        .cloned();
    let broker = state.broker.clone();

    let mut upgrade = ws;
    if let Some(selected) = selected {
        upgrade = upgrade.protocols([selected]);
    }
    Ok(upgrade.on_upgrade(move |socket| handle_socket(socket, broker, principal_id)))
}

async fn handle_socket(socket: WebSocket, broker: EventBroker, principal_id: String) {
    let (conn_id, mut rx) = broker.connect(&principal_id);
    info!("events subscriber connected for {}", principal_id);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(BrokerMessage::Event(text)) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(BrokerMessage::Close(code)) => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: "shutdown".into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            },
            inbound = receiver.next() => match inbound {
                // Any client text is treated as a keep-alive ping.
                Some(Ok(Message::Text(_))) => {
                    let pong = serde_json::to_string(&CoordinatorEvent::Pong)
                        .unwrap_or_else(|_| "{\"type\":\"pong\"}".to_string());
                    if sender.send(Message::Text(pong.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    broker.disconnect(&principal_id, conn_id);
    info!("events subscriber disconnected for {}", principal_id);
}
