//! Middleman REST endpoints that remain in the trade core.
//!
//! The WebSocket stream is the preferred live path for location; this
//! endpoint exists for devices that can only poll.

use axum::{extract::State, response::Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{self, AuthClaims};
use crate::db;
use crate::errors::MarketError;
use crate::models::GeoPoint;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LocationUpdateRequest {
    pub current_location: GeoPoint,
}

/// PUT /middlemen/me/location
pub async fn update_location(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Json(body): Json<LocationUpdateRequest>,
) -> Result<Json<Value>, MarketError> {
    let middleman_id = auth::require_middleman(&claims)?;

    state.store.with_tx(|conn| {
        if db::get_middleman(conn, middleman_id)?.is_none() {
            return Err(MarketError::Unauthorized);
        }
        db::set_middleman_location(conn, middleman_id, body.current_location)
    })?;

    Ok(Json(json!({
        "ok": true,
        "latitude": body.current_location.latitude,
        "longitude": body.current_location.longitude,
    })))
}
