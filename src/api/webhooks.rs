//! Stripe webhook receiver.
//!
//! Signature-checked. The event id is claimed atomically before any
//! processor work — the processor delivers at-least-once, and two
//! simultaneous duplicates must not both reach the capture call. A failed
//! delivery releases its claim so the retry can reprocess.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::db;
use crate::errors::MarketError;
use crate::escrow;
use crate::models::EscrowStatus;
use crate::payments::StripeClient;
use crate::state::AppState;

/// POST /webhooks/stripe
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, MarketError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok());
    state.stripe.verify_webhook_signature(&body, signature)?;

    let event: Value = serde_json::from_slice(&body)
        .map_err(|_| MarketError::InvalidToken("Malformed webhook payload"))?;

    // Claim the event id up front; the insert is atomic, so of two
    // concurrent duplicate deliveries exactly one proceeds past this point.
    let claimed = match event.get("id").and_then(|v| v.as_str()) {
        Some(event_id) => {
            let fresh = state
                .store
                .with_tx(|conn| db::record_webhook_event(conn, event_id))?;
            if !fresh {
                return Ok(Json(json!({ "received": true })));
            }
            Some(event_id.to_string())
        }
        None => None,
    };

    let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or("");
    info!("💳 Stripe webhook received: {}", event_type);

    if event_type == "payment_intent.succeeded" {
        if let Some(intent_id) = event
            .get("data")
            .and_then(|d| d.get("object"))
            .and_then(|o| o.get("id"))
            .and_then(|v| v.as_str())
        {
            if let Err(e) = handle_payment_intent_succeeded(&state, intent_id).await {
                // Un-claim so the processor's retry is not dropped as a
                // duplicate.
                if let Some(event_id) = &claimed {
                    let released = state
                        .store
                        .with_tx(|conn| db::release_webhook_event(conn, event_id));
                    if let Err(release_err) = released {
                        warn!(
                            "failed to release webhook claim {}: {}",
                            event_id, release_err
                        );
                    }
                }
                return Err(e);
            }
        }
    }

    Ok(Json(json!({ "received": true })))
}

async fn handle_payment_intent_succeeded(
    state: &AppState,
    intent_id: &str,
) -> Result<(), MarketError> {
    let escrow_row = state
        .store
        .with_conn(|conn| db::get_escrow_by_intent(conn, intent_id))?;

    let Some(escrow_row) = escrow_row else {
        warn!("no escrow found for payment_intent {}", intent_id);
        return Ok(());
    };
    if escrow_row.status != EscrowStatus::WaitingFunds {
        // Already handled; the escrow machine is status-guarded on top of
        // the event-id claim.
        return Ok(());
    }

    // Capture the authorized funds before advancing local state. Failures
    // here propagate so the processor retries the delivery.
    if !StripeClient::is_demo_intent(intent_id) {
        state.stripe.capture_intent(intent_id).await?;
    }

    if let Some((escrow_row, event)) = escrow::mark_funds_held(&state.store, intent_id)? {
        state.fabric.broadcast(escrow_row.order_id, &event);
        info!(
            "💰 Escrow {} moved to FUNDS_HELD (order {})",
            escrow_row.id, escrow_row.order_id
        );
    }
    Ok(())
}
