//! Verification router: QR-gated escrow releases and the proof-of-location
//! dispute primitive.

use axum::{
    extract::State,
    response::Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::auth::{self, AuthClaims};
use crate::db::{self, AuditEntry};
use crate::errors::MarketError;
use crate::escrow;
use crate::models::{Escrow, GeoPoint, OrderStatus};
use crate::spatial;
use crate::state::AppState;

const DISPUTE_THRESHOLD_M: f64 = 100.0;

// Fallback delivery point when the buyer has no location on file.
const DEMO_BUYER_LOCATION: GeoPoint = GeoPoint {
    latitude: 13.0827,
    longitude: 80.2707,
};

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub order_id: Uuid,
    pub qr_token: String,
    #[allow(dead_code)]
    pub middleman_location: Option<GeoPoint>,
}

#[derive(Debug, Deserialize)]
pub struct DisputeRequest {
    pub order_id: Uuid,
    pub middleman_location: GeoPoint,
    pub evidence_description: Option<String>,
}

/// POST /verify/pickup — the assigned middleman scans the farmer's QR;
/// 20% releases to the farmer and the escrow moves to PICKED_UP.
pub async fn verify_pickup(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<Escrow>, MarketError> {
    let middleman_id = auth::require_middleman(&claims)?;

    let quote = escrow::quote_pickup(&state.store, body.order_id, middleman_id, &body.qr_token)?;

    let transfer_id = match &quote.transfer {
        Some(transfer) => Some(
            state
                .stripe
                .create_transfer(
                    transfer.amount_cents,
                    &transfer.destination,
                    &transfer.transfer_group,
                    transfer.kind,
                )
                .await?,
        ),
        None => None,
    };

    let (escrow, events) = escrow::commit_pickup(
        &state.store,
        body.order_id,
        middleman_id,
        &body.qr_token,
        transfer_id,
    )?;
    state.fabric.broadcast_all(body.order_id, &events);

    info!(
        "📦 Pickup verified for order {}: {} cents released to farmer",
        body.order_id, quote.farmer_pickup_cents
    );
    Ok(Json(escrow))
}

/// POST /verify/delivery — delivery QR releases the remaining tranches and
/// settles the order; the whole thing commits or rolls back together.
pub async fn verify_delivery(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<Escrow>, MarketError> {
    let middleman_id = auth::require_middleman(&claims)?;

    let quote = escrow::quote_delivery(&state.store, body.order_id, middleman_id, &body.qr_token)?;

    let farmer_transfer_id = match &quote.farmer_transfer {
        Some(transfer) => Some(
            state
                .stripe
                .create_transfer(
                    transfer.amount_cents,
                    &transfer.destination,
                    &transfer.transfer_group,
                    transfer.kind,
                )
                .await?,
        ),
        None => None,
    };
    let middleman_transfer_id = match &quote.middleman_transfer {
        Some(transfer) => Some(
            state
                .stripe
                .create_transfer(
                    transfer.amount_cents,
                    &transfer.destination,
                    &transfer.transfer_group,
                    transfer.kind,
                )
                .await?,
        ),
        None => None,
    };

    let (escrow, order, events) = escrow::commit_delivery(
        &state.store,
        body.order_id,
        middleman_id,
        &body.qr_token,
        farmer_transfer_id,
        middleman_transfer_id,
    )?;
    state.fabric.broadcast_all(body.order_id, &events);

    info!(
        "🏁 Delivery verified for order {}: {} + {} cents released, order SETTLED",
        order.id, quote.farmer_final_cents, quote.middleman_cents
    );
    Ok(Json(escrow))
}

/// POST /verify/dispute — proof of location when the buyer refuses to scan.
///
/// Records the proximity check as tamper-evident audit evidence. Order
/// status is never altered here; a within-threshold result reports that the
/// auto-release countdown is initiated.
pub async fn dispute_proof_of_location(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Json(body): Json<DisputeRequest>,
) -> Result<Json<Value>, MarketError> {
    let middleman_id = auth::require_middleman(&claims)?;

    let (order, buyer_location) = state.store.with_conn(|conn| {
        let order = db::require_order(conn, body.order_id)?;
        db::require_escrow(conn, body.order_id)?;

        let assignment = db::get_assignment_by_order(conn, body.order_id)?
            .filter(|a| a.middleman_id == middleman_id);
        if assignment.is_none() {
            return Err(MarketError::Forbidden("Not your delivery"));
        }
        if order.status != OrderStatus::InTransit {
            return Err(MarketError::Conflict(format!(
                "Order is in {}",
                order.status.as_str()
            )));
        }

        let buyer_location = order
            .buyer_id
            .map(|buyer_id| db::get_buyer(conn, buyer_id))
            .transpose()?
            .flatten()
            .and_then(|buyer| buyer.delivery_location)
            .unwrap_or(DEMO_BUYER_LOCATION);
        Ok((order, buyer_location))
    })?;

    let proof = spatial::check_middleman_at_buyer(
        body.middleman_location,
        buyer_location,
        DISPUTE_THRESHOLD_M,
    );

    state.store.with_tx(|conn| {
        db::insert_audit(
            conn,
            &AuditEntry {
                order_id: order.id,
                from_status: Some(order.status.as_str()),
                // A dispute alone never moves the FSM.
                to_status: order.status.as_str(),
                actor_type: "middleman",
                actor_id: Some(middleman_id),
                reason: Some("dispute_proof_of_location"),
                extra_data: Some(json!({
                    "middleman_lat": body.middleman_location.latitude,
                    "middleman_lon": body.middleman_location.longitude,
                    "buyer_lat": buyer_location.latitude,
                    "buyer_lon": buyer_location.longitude,
                    "distance_m": proof.distance_m,
                    "threshold_m": DISPUTE_THRESHOLD_M,
                    "within_threshold": proof.is_within,
                    "proof_hash": proof.proof_hash,
                    "timestamp_utc": Utc::now().to_rfc3339(),
                    "evidence_description": body.evidence_description,
                })),
            },
        )
    })?;

    let message = if proof.is_within {
        "Auto-release countdown started (24 hours)"
    } else {
        "Middleman not within threshold of buyer. Dispute logged."
    };

    Ok(Json(json!({
        "within_threshold": proof.is_within,
        "distance_m": proof.distance_m,
        "threshold_m": DISPUTE_THRESHOLD_M,
        "auto_release_initiated": proof.is_within,
        "message": message,
        "proof_hash": proof.proof_hash,
    })))
}
