//! Bids router: submit, list, accept, reject, withdraw.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::{self, AuthClaims};
use crate::db;
use crate::errors::MarketError;
use crate::fsm;
use crate::models::{Bid, BidStatus};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct BidCreateRequest {
    pub order_id: Uuid,
    pub offered_price_per_kg: f64,
    pub volume_kg: f64,
    pub message: Option<String>,
}

/// POST /bids — buyer submits a bid; the first bid moves the order to
/// NEGOTIATING.
pub async fn submit_bid(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Json(body): Json<BidCreateRequest>,
) -> Result<(StatusCode, Json<Bid>), MarketError> {
    let buyer_id = auth::require_buyer(&claims)?;

    if body.offered_price_per_kg <= 0.0 {
        return Err(MarketError::Validation("offered_price_per_kg must be positive"));
    }
    if body.volume_kg <= 0.0 {
        return Err(MarketError::Validation("volume_kg must be positive"));
    }

    let (bid, _, events) = fsm::submit_bid(
        &state.store,
        body.order_id,
        buyer_id,
        body.offered_price_per_kg,
        body.volume_kg,
        body.message,
    )?;
    state.fabric.broadcast_all(body.order_id, &events);

    Ok((StatusCode::CREATED, Json(bid)))
}

/// GET /bids/order/{order_id} — the listing farmer reviews bids.
pub async fn list_bids_for_order(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<Bid>>, MarketError> {
    let farmer_id = auth::require_farmer(&claims)?;

    let bids = state.store.with_conn(|conn| {
        let order = db::require_order(conn, order_id)?;
        if order.farmer_id != farmer_id {
            return Err(MarketError::Forbidden("Not your listing"));
        }
        db::list_bids_for_order(conn, order_id)
    })?;
    Ok(Json(bids))
}

/// Returned once on acceptance. The raw QR tokens are the sole capability
/// for pickup and delivery verification; they are not recoverable.
#[derive(Debug, Serialize)]
pub struct PaymentInitiate {
    pub stripe_client_secret: String,
    pub amount_cents: i64,
    pub currency: String,
    pub pickup_qr_token: String,
    pub delivery_qr_token: String,
}

/// POST /bids/{id}/accept — farmer accepts a bid.
///
/// Preflight validates and prices the escrow, the payment authorization is
/// created against the processor, then the acceptance commits under a write
/// transaction that re-validates every guard. A lost race cancels the
/// just-created authorization best-effort.
pub async fn accept_bid(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Path(bid_id): Path<Uuid>,
) -> Result<Json<PaymentInitiate>, MarketError> {
    let farmer_id = auth::require_farmer(&claims)?;

    let quote = fsm::quote_accept_bid(&state.store, farmer_id, bid_id)?;

    let intent = state
        .stripe
        .create_payment_intent(quote.total_amount_cents, quote.order_id, Uuid::new_v4())
        .await?;

    let accepted = match fsm::commit_accept_bid(
        &state.store,
        farmer_id,
        bid_id,
        intent.intent_id.clone(),
    ) {
        Ok(accepted) => accepted,
        Err(e) => {
            // The authorization exists but the acceptance lost; unwind it.
            if let Err(cancel_err) = state.stripe.cancel_or_refund(&intent.intent_id).await {
                error!(
                    "failed to cancel orphaned intent {}: {}",
                    intent.intent_id, cancel_err
                );
            }
            return Err(e);
        }
    };

    state
        .fabric
        .broadcast_all(accepted.order.id, &accepted.events);
    info!(
        "🤝 Bid {} accepted on order {} ({} cents in escrow)",
        bid_id, accepted.order.id, accepted.escrow.total_amount_cents
    );

    Ok(Json(PaymentInitiate {
        stripe_client_secret: intent.client_secret,
        amount_cents: accepted.escrow.total_amount_cents,
        currency: "usd".to_string(),
        pickup_qr_token: accepted.pickup_qr_token,
        delivery_qr_token: accepted.delivery_qr_token,
    }))
}

/// POST /bids/{id}/reject
pub async fn reject_bid(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Path(bid_id): Path<Uuid>,
) -> Result<Json<Bid>, MarketError> {
    let farmer_id = auth::require_farmer(&claims)?;

    let bid = state.store.with_tx(|conn| {
        let mut bid = db::get_bid(conn, bid_id)?.ok_or(MarketError::BidNotFound(bid_id))?;
        let order = db::require_order(conn, bid.order_id)?;
        if order.farmer_id != farmer_id {
            return Err(MarketError::Forbidden("Not your listing"));
        }
        if bid.status != BidStatus::Pending {
            return Err(MarketError::Conflict("Can only reject PENDING bids".to_string()));
        }
        db::set_bid_status(conn, bid.id, BidStatus::Rejected)?;
        bid.status = BidStatus::Rejected;
        Ok(bid)
    })?;
    Ok(Json(bid))
}

/// DELETE /bids/{id} — buyer withdraws their own pending bid.
pub async fn withdraw_bid(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Path(bid_id): Path<Uuid>,
) -> Result<StatusCode, MarketError> {
    let buyer_id = auth::require_buyer(&claims)?;

    state.store.with_tx(|conn| {
        let bid = db::get_bid(conn, bid_id)?.ok_or(MarketError::BidNotFound(bid_id))?;
        if bid.buyer_id != buyer_id {
            return Err(MarketError::Forbidden("Not your bid"));
        }
        if bid.status != BidStatus::Pending {
            return Err(MarketError::Conflict(
                "Can only withdraw PENDING bids".to_string(),
            ));
        }
        db::set_bid_status(conn, bid.id, BidStatus::Withdrawn)
    })?;

    Ok(StatusCode::NO_CONTENT)
}
