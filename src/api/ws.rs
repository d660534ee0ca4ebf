//! WebSocket endpoints.
//!
//! `/ws/orders/{order_id}` — any authenticated party subscribes to an order
//! room; receives CONNECTED, then STATE_SYNC, then the live event stream.
//!
//! `/ws/middlemen/me/location` — the assigned middleman pushes GPS frames;
//! every frame re-broadcasts to the order room, every Nth persists.
//!
//! Bearer tokens ride in the query string: headers are unavailable at
//! upgrade time.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::Role;
use crate::db;
use crate::errors::MarketError;
use crate::models::WsEvent;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct GpsStreamQuery {
    pub token: String,
    pub order_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct GpsFrame {
    latitude: f64,
    longitude: f64,
}

fn encode(event: &WsEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| {
        warn!("failed to serialize ws event: {}", e);
        "{}".to_string()
    })
}

/// GET /ws/orders/{order_id}?token=…
pub async fn order_websocket(
    ws: WebSocketUpgrade,
    Path(order_id): Path<Uuid>,
    Query(params): Query<WsAuthQuery>,
    State(state): State<AppState>,
) -> Response {
    let (user_id, role) = match state.jwt.decode_ws_token(&params.token) {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_order_socket(socket, state, order_id, user_id, role))
}

async fn handle_order_socket(
    socket: WebSocket,
    state: AppState,
    order_id: Uuid,
    user_id: Uuid,
    role: Role,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let connection_id = Uuid::new_v4();

    state.fabric.connect_to_order(order_id, connection_id, tx.clone());

    // CONNECTED, then the current DB state so a reconnecting client
    // recovers without polling. Queued through the same channel as live
    // events to preserve ordering.
    let _ = tx.send(encode(&WsEvent::Connected {
        order_id,
        role: role.as_str().to_string(),
        user_id,
    }));
    match state_sync_event(&state, order_id) {
        Ok(Some(sync)) => {
            let _ = tx.send(encode(&sync));
        }
        Ok(None) => {}
        Err(e) => debug!("state sync for order {} failed: {}", order_id, e),
    }

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(message) => {
                        if sender.send(Message::Text(message)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if is_ping(&text)
                            && sender
                                .send(Message::Text(encode(&WsEvent::Pong)))
                                .await
                                .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.fabric.disconnect_from_order(order_id, connection_id);
}

fn is_ping(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "PING"))
        .unwrap_or(false)
}

fn state_sync_event(state: &AppState, order_id: Uuid) -> Result<Option<WsEvent>, MarketError> {
    state.store.with_conn(|conn| {
        let Some(order) = db::get_order(conn, order_id)? else {
            return Ok(None);
        };
        let escrow = db::get_escrow_by_order(conn, order_id)?;
        let assignment = db::get_assignment_by_order(conn, order_id)?;
        Ok(Some(WsEvent::StateSync {
            order_id,
            order_status: order.status,
            escrow_status: escrow.map(|e| e.status),
            last_gps_ping_at: assignment.and_then(|a| a.last_gps_ping_at),
        }))
    })
}

/// GET /ws/middlemen/me/location?token=…&order_id=…
pub async fn middleman_location_stream(
    ws: WebSocketUpgrade,
    Query(params): Query<GpsStreamQuery>,
    State(state): State<AppState>,
) -> Response {
    let (user_id, role) = match state.jwt.decode_ws_token(&params.token) {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };
    if role != Role::Middleman {
        return MarketError::Forbidden("middleman role required").into_response();
    }

    let order_id = params.order_id;
    ws.on_upgrade(move |socket| handle_gps_socket(socket, state, order_id, user_id))
}

async fn handle_gps_socket(
    mut socket: WebSocket,
    state: AppState,
    order_id: Uuid,
    middleman_id: Uuid,
) {
    let connection_id = Uuid::new_v4();
    state
        .fabric
        .register_middleman_stream(middleman_id, connection_id);

    let persist_every = state.config.gps_persist_every;
    let mut frame_count: u64 = 0;

    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Text(text)) => {
                let frame: GpsFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(_) => {
                        debug!("dropping malformed gps frame on order {}", order_id);
                        continue;
                    }
                };

                // Every frame fans out; only every Nth hits the database.
                state.fabric.broadcast(
                    order_id,
                    &WsEvent::LocationUpdate {
                        order_id,
                        middleman_id,
                        latitude: frame.latitude,
                        longitude: frame.longitude,
                        timestamp: Utc::now(),
                    },
                );

                frame_count += 1;
                if frame_count % persist_every == 0 {
                    let result = state.store.with_tx(|conn| {
                        db::record_gps_ping(
                            conn,
                            order_id,
                            middleman_id,
                            crate::models::GeoPoint::new(frame.latitude, frame.longitude),
                            Utc::now(),
                        )
                    });
                    if let Err(e) = result {
                        warn!("failed to persist gps frame: {}", e);
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state
        .fabric
        .unregister_middleman_stream(middleman_id, connection_id);
}
