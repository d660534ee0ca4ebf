//! Tripartite escrow machine.
//!
//! Tranche schedule on integer cents, floor division per split:
//!   pickup   → 20% to the farmer
//!   delivery → 60% to the farmer + 20% to the middleman
//!   cancel   → everything not yet released refunds to the buyer
//! Any rounding residue (at most 2 cents) stays in escrow as an audited
//! remainder.
//!
//! Flows that also call the processor run in phases: a read-only quote, the
//! processor I/O outside any lock, then a commit that re-validates every
//! guard. The commit functions here never perform I/O.

use chrono::Utc;
use uuid::Uuid;

use crate::db::{self, MarketStore};
use crate::errors::MarketError;
use crate::fsm::{self, hash_token, Actor};
use crate::models::{
    Escrow, EscrowStatus, LogisticsAssignment, Order, OrderStatus, WsEvent,
};
use crate::payments::StripeClient;

pub fn pickup_tranche_cents(total: i64) -> i64 {
    total * 20 / 100
}

pub fn delivery_farmer_tranche_cents(total: i64) -> i64 {
    total * 60 / 100
}

pub fn delivery_middleman_tranche_cents(total: i64) -> i64 {
    total * 20 / 100
}

/// A transfer the caller must execute against the processor between the
/// quote and the commit. Absent in demo mode or when the destination has no
/// connected account.
#[derive(Debug, Clone)]
pub struct TransferInstruction {
    pub amount_cents: i64,
    pub destination: String,
    pub transfer_group: String,
    pub kind: &'static str,
}

#[derive(Debug)]
pub struct PickupQuote {
    pub farmer_pickup_cents: i64,
    pub transfer: Option<TransferInstruction>,
}

#[derive(Debug)]
pub struct DeliveryQuote {
    pub farmer_final_cents: i64,
    pub middleman_cents: i64,
    pub farmer_transfer: Option<TransferInstruction>,
    pub middleman_transfer: Option<TransferInstruction>,
}

fn validate_scan(
    conn: &rusqlite::Connection,
    order_id: Uuid,
    middleman_id: Uuid,
    qr_token: &str,
    expected_escrow: EscrowStatus,
    pickup: bool,
) -> Result<(Order, Escrow, LogisticsAssignment), MarketError> {
    let order = db::require_order(conn, order_id)?;
    let escrow = db::require_escrow(conn, order_id)?;

    let assignment = db::get_assignment_by_order(conn, order_id)?
        .filter(|a| a.middleman_id == middleman_id)
        .ok_or(MarketError::Forbidden(
            "You are not the assigned trucker for this order",
        ))?;

    if order.status != OrderStatus::InTransit {
        return Err(MarketError::Conflict(format!(
            "Order is in {}, expected IN_TRANSIT",
            order.status.as_str()
        )));
    }
    if escrow.status != expected_escrow {
        return Err(MarketError::InvalidEscrowState {
            current: escrow.status,
            expected: expected_escrow,
        });
    }

    let stored_hash = if pickup {
        order.pickup_qr_hash.as_deref()
    } else {
        order.delivery_qr_hash.as_deref()
    };
    if stored_hash != Some(hash_token(qr_token).as_str()) {
        return Err(MarketError::InvalidToken("Invalid QR token"));
    }

    Ok((order, escrow, assignment))
}

fn is_demo(escrow: &Escrow) -> bool {
    escrow
        .stripe_payment_intent_id
        .as_deref()
        .map(StripeClient::is_demo_intent)
        .unwrap_or(true)
}

/// Preflight for the pickup scan: validates the caller, FSM and escrow
/// states, and the QR token, and prices the 20% tranche.
pub fn quote_pickup(
    store: &MarketStore,
    order_id: Uuid,
    middleman_id: Uuid,
    qr_token: &str,
) -> Result<PickupQuote, MarketError> {
    store.with_conn(|conn| {
        let (order, escrow, _) = validate_scan(
            conn,
            order_id,
            middleman_id,
            qr_token,
            EscrowStatus::FundsHeld,
            true,
        )?;

        let farmer_pickup_cents = pickup_tranche_cents(escrow.total_amount_cents);
        let transfer = if is_demo(&escrow) {
            None
        } else {
            db::get_farmer(conn, order.farmer_id)?
                .and_then(|farmer| farmer.stripe_account_id)
                .map(|destination| TransferInstruction {
                    amount_cents: farmer_pickup_cents,
                    destination,
                    transfer_group: order_id.to_string(),
                    kind: "pickup_20pct",
                })
        };

        Ok(PickupQuote {
            farmer_pickup_cents,
            transfer,
        })
    })
}

/// Apply the pickup release. Re-validates under the write transaction, so a
/// duplicate or racing scan fails on the escrow-state guard. Also refreshes
/// the GPS heartbeat: a QR scan is proof of presence.
pub fn commit_pickup(
    store: &MarketStore,
    order_id: Uuid,
    middleman_id: Uuid,
    qr_token: &str,
    transfer_id: Option<String>,
) -> Result<(Escrow, Vec<WsEvent>), MarketError> {
    store.with_tx(|conn| {
        let (_, mut escrow, mut assignment) = validate_scan(
            conn,
            order_id,
            middleman_id,
            qr_token,
            EscrowStatus::FundsHeld,
            true,
        )?;

        assignment.last_gps_ping_at = Some(Utc::now());
        db::update_assignment(conn, &assignment)?;

        escrow.farmer_released_cents += pickup_tranche_cents(escrow.total_amount_cents);
        escrow.stripe_transfer_farmer_pickup_id = transfer_id;
        escrow.status = EscrowStatus::PickedUp;
        escrow.picked_up_at = Some(Utc::now());
        db::update_escrow(conn, &escrow)?;

        let events = vec![WsEvent::escrow_update(&escrow)];
        Ok((escrow, events))
    })
}

/// Preflight for the delivery scan: 60% farmer tranche plus 20% middleman
/// tranche (the latter only when a connected account exists).
pub fn quote_delivery(
    store: &MarketStore,
    order_id: Uuid,
    middleman_id: Uuid,
    qr_token: &str,
) -> Result<DeliveryQuote, MarketError> {
    store.with_conn(|conn| {
        let (order, escrow, assignment) = validate_scan(
            conn,
            order_id,
            middleman_id,
            qr_token,
            EscrowStatus::PickedUp,
            false,
        )?;

        let farmer_final_cents = delivery_farmer_tranche_cents(escrow.total_amount_cents);
        let middleman_cents = delivery_middleman_tranche_cents(escrow.total_amount_cents);

        let (farmer_transfer, middleman_transfer) = if is_demo(&escrow) {
            (None, None)
        } else {
            let farmer_transfer = db::get_farmer(conn, order.farmer_id)?
                .and_then(|farmer| farmer.stripe_account_id)
                .map(|destination| TransferInstruction {
                    amount_cents: farmer_final_cents,
                    destination,
                    transfer_group: order_id.to_string(),
                    kind: "delivery_60pct",
                });
            let middleman_transfer = db::get_middleman(conn, assignment.middleman_id)?
                .and_then(|middleman| middleman.stripe_account_id)
                .map(|destination| TransferInstruction {
                    amount_cents: middleman_cents,
                    destination,
                    transfer_group: order_id.to_string(),
                    kind: "delivery_middleman_20pct",
                });
            (farmer_transfer, middleman_transfer)
        };

        Ok(DeliveryQuote {
            farmer_final_cents,
            middleman_cents,
            farmer_transfer,
            middleman_transfer,
        })
    })
}

/// Apply the delivery release and settle the order, all in one transaction:
/// escrow → DELIVERED, order → SETTLED, middleman freed, reputation counters
/// bumped. Any failure rolls the whole thing back.
pub fn commit_delivery(
    store: &MarketStore,
    order_id: Uuid,
    middleman_id: Uuid,
    qr_token: &str,
    farmer_transfer_id: Option<String>,
    middleman_transfer_id: Option<String>,
) -> Result<(Escrow, Order, Vec<WsEvent>), MarketError> {
    store.with_tx(|conn| {
        let (order, mut escrow, assignment) = validate_scan(
            conn,
            order_id,
            middleman_id,
            qr_token,
            EscrowStatus::PickedUp,
            false,
        )?;

        escrow.farmer_released_cents += delivery_farmer_tranche_cents(escrow.total_amount_cents);
        escrow.middleman_released_cents +=
            delivery_middleman_tranche_cents(escrow.total_amount_cents);
        escrow.stripe_transfer_farmer_final_id = farmer_transfer_id;
        escrow.stripe_transfer_middleman_id = middleman_transfer_id;
        escrow.status = EscrowStatus::Delivered;
        escrow.delivered_at = Some(Utc::now());
        db::update_escrow(conn, &escrow)?;

        let (order, fsm_event) = fsm::transition_order(
            conn,
            order.id,
            OrderStatus::Settled,
            Actor::middleman(middleman_id),
            Some("delivery_qr_verified"),
            None,
        )?;

        db::set_middleman_availability(conn, assignment.middleman_id, true)?;
        db::bump_middleman_deliveries(conn, assignment.middleman_id)?;
        db::bump_farmer_transactions(conn, order.farmer_id)?;

        let events = vec![WsEvent::escrow_update(&escrow), fsm_event];
        Ok((escrow, order, events))
    })
}

/// Move the escrow to FUNDS_HELD once the processor reports the
/// authorization succeeded. Idempotent: any state other than WAITING_FUNDS
/// returns `None` with no side effects. The caller captures the intent
/// before invoking this.
pub fn mark_funds_held(
    store: &MarketStore,
    payment_intent_id: &str,
) -> Result<Option<(Escrow, WsEvent)>, MarketError> {
    store.with_tx(|conn| {
        let Some(mut escrow) = db::get_escrow_by_intent(conn, payment_intent_id)? else {
            return Ok(None);
        };
        if escrow.status != EscrowStatus::WaitingFunds {
            return Ok(None);
        }

        escrow.status = EscrowStatus::FundsHeld;
        escrow.funds_held_at = Some(Utc::now());
        db::update_escrow(conn, &escrow)?;

        let event = WsEvent::escrow_update(&escrow);
        Ok(Some((escrow, event)))
    })
}

/// Result of a local escrow cancellation. `refund_intent` names the
/// processor-side authorization still to unwind; the caller fires it after
/// commit and only logs failures — the local state has already advanced.
#[derive(Debug)]
pub struct CancelOutcome {
    pub escrow: Escrow,
    pub refund_intent: Option<String>,
    pub event: WsEvent,
}

/// Cancel the escrow locally inside the caller's transaction. Everything the
/// farmer has not already been paid refunds to the buyer. Idempotent on
/// CANCELLED; an order without an escrow returns `None`.
pub fn cancel_escrow(
    conn: &rusqlite::Connection,
    order_id: Uuid,
) -> Result<Option<CancelOutcome>, MarketError> {
    let Some(mut escrow) = db::get_escrow_by_order(conn, order_id)? else {
        return Ok(None);
    };
    if escrow.status == EscrowStatus::Cancelled {
        return Ok(None);
    }

    escrow.refunded_cents = escrow.total_amount_cents - escrow.farmer_released_cents;
    escrow.status = EscrowStatus::Cancelled;
    escrow.cancelled_at = Some(Utc::now());
    db::update_escrow(conn, &escrow)?;

    let refund_intent = escrow
        .stripe_payment_intent_id
        .clone()
        .filter(|id| !StripeClient::is_demo_intent(id));

    let event = WsEvent::escrow_update(&escrow);
    Ok(Some(CancelOutcome {
        escrow,
        refund_intent,
        event,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use crate::fsm::{commit_accept_bid, submit_bid};
    use crate::models::{AssignmentStatus, TruckType};

    /// Drive an order to IN_TRANSIT with funds held. Returns
    /// (order_id, middleman_id, pickup_token, delivery_token, total_cents).
    fn in_transit_fixture(store: &MarketStore) -> (Uuid, Uuid, String, String, i64) {
        let farmer = seed_farmer(store);
        let buyer = seed_buyer(store);
        let middleman = seed_middleman(store, TruckType::DryVan);
        let order = seed_order(store, farmer.id, 100.0, 0.8);

        let (bid, _, _) = submit_bid(store, order.id, buyer.id, 0.75, 40.0, None).unwrap();
        let accepted =
            commit_accept_bid(store, farmer.id, bid.id, "pi_demo_fixture".to_string()).unwrap();

        mark_funds_held(store, "pi_demo_fixture").unwrap().unwrap();

        store
            .with_tx(|conn| {
                let assignment = crate::models::LogisticsAssignment {
                    id: Uuid::new_v4(),
                    order_id: order.id,
                    middleman_id: middleman.id,
                    status: AssignmentStatus::Accepted,
                    last_gps_ping_at: Some(Utc::now()),
                    gps_alert_sent: false,
                    estimated_distance_km: Some(120.0),
                    agreed_fee_cents: None,
                    offered_at: Utc::now(),
                    accepted_at: Some(Utc::now()),
                };
                db::insert_assignment(conn, &assignment)?;
                fsm::transition_order(
                    conn,
                    order.id,
                    OrderStatus::InTransit,
                    Actor::middleman(middleman.id),
                    Some("middleman_accepted"),
                    None,
                )?;
                Ok(())
            })
            .unwrap();

        (
            order.id,
            middleman.id,
            accepted.pickup_qr_token,
            accepted.delivery_qr_token,
            accepted.escrow.total_amount_cents,
        )
    }

    #[test]
    fn test_tranche_floor_division_residue() {
        // 101 → 20 + 60 + 20 = 100, one cent stays in escrow.
        assert_eq!(pickup_tranche_cents(101), 20);
        assert_eq!(delivery_farmer_tranche_cents(101), 60);
        assert_eq!(delivery_middleman_tranche_cents(101), 20);

        // Residue never exceeds 2 cents.
        for total in [1i64, 7, 99, 101, 104, 3_000, 999_999] {
            let released = pickup_tranche_cents(total)
                + delivery_farmer_tranche_cents(total)
                + delivery_middleman_tranche_cents(total);
            assert!(released <= total);
            assert!(total - released <= 2, "residue too large for {}", total);
        }
    }

    #[test]
    fn test_funds_held_is_idempotent() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        let buyer = seed_buyer(&store);
        let order = seed_order(&store, farmer.id, 100.0, 0.8);
        let (bid, _, _) = submit_bid(&store, order.id, buyer.id, 0.75, 40.0, None).unwrap();
        commit_accept_bid(&store, farmer.id, bid.id, "pi_demo_funds".to_string()).unwrap();

        let first = mark_funds_held(&store, "pi_demo_funds").unwrap();
        assert!(first.is_some());
        let escrow = first.unwrap().0;
        assert_eq!(escrow.status, EscrowStatus::FundsHeld);
        assert!(escrow.funds_held_at.is_some());

        // Applied twice is equivalent to once.
        let second = mark_funds_held(&store, "pi_demo_funds").unwrap();
        assert!(second.is_none());

        // Unknown intent is a silent no-op.
        assert!(mark_funds_held(&store, "pi_demo_unknown").unwrap().is_none());
    }

    #[test]
    fn test_pickup_release_twenty_percent() {
        let (store, _dir) = temp_store();
        let (order_id, middleman_id, pickup_token, _, total) = in_transit_fixture(&store);

        let quote = quote_pickup(&store, order_id, middleman_id, &pickup_token).unwrap();
        assert_eq!(quote.farmer_pickup_cents, total * 20 / 100);
        assert!(quote.transfer.is_none()); // demo intent

        let (escrow, events) =
            commit_pickup(&store, order_id, middleman_id, &pickup_token, None).unwrap();
        assert_eq!(escrow.status, EscrowStatus::PickedUp);
        assert_eq!(escrow.farmer_released_cents, 600); // 20% of 3,000
        assert!(escrow.picked_up_at.is_some());
        assert_eq!(events.len(), 1);

        // Second scan fails on the state guard.
        let again = commit_pickup(&store, order_id, middleman_id, &pickup_token, None);
        assert!(matches!(
            again,
            Err(MarketError::InvalidEscrowState { .. })
        ));
    }

    #[test]
    fn test_pickup_rejects_bad_token_and_wrong_middleman() {
        let (store, _dir) = temp_store();
        let (order_id, middleman_id, _, _, _) = in_transit_fixture(&store);

        let bad = quote_pickup(&store, order_id, middleman_id, "not-the-token");
        assert!(matches!(bad, Err(MarketError::InvalidToken(_))));

        let stranger = seed_middleman(&store, TruckType::DryVan);
        let forbidden = quote_pickup(&store, order_id, stranger.id, "whatever");
        assert!(matches!(forbidden, Err(MarketError::Forbidden(_))));
    }

    #[test]
    fn test_delivery_release_and_settlement() {
        let (store, _dir) = temp_store();
        let (order_id, middleman_id, pickup_token, delivery_token, total) =
            in_transit_fixture(&store);

        // Delivery before pickup fails on the escrow guard.
        let premature = quote_delivery(&store, order_id, middleman_id, &delivery_token);
        assert!(matches!(
            premature,
            Err(MarketError::InvalidEscrowState { .. })
        ));

        commit_pickup(&store, order_id, middleman_id, &pickup_token, None).unwrap();

        let quote = quote_delivery(&store, order_id, middleman_id, &delivery_token).unwrap();
        assert_eq!(quote.farmer_final_cents, total * 60 / 100);
        assert_eq!(quote.middleman_cents, total * 20 / 100);

        let (escrow, order, events) =
            commit_delivery(&store, order_id, middleman_id, &delivery_token, None, None).unwrap();

        // Scenario A sums: 600 + 1,800 farmer, 600 middleman, nothing refunded.
        assert_eq!(escrow.status, EscrowStatus::Delivered);
        assert_eq!(escrow.farmer_released_cents, 2_400);
        assert_eq!(escrow.middleman_released_cents, 600);
        assert_eq!(escrow.refunded_cents, 0);
        assert_eq!(
            escrow.farmer_released_cents + escrow.middleman_released_cents,
            total
        );

        assert_eq!(order.status, OrderStatus::Settled);
        assert!(order.settled_at.is_some());
        assert_eq!(events.len(), 2);

        // The middleman is free again and credited with the delivery.
        let freed = store
            .with_conn(|conn| db::get_middleman(conn, middleman_id))
            .unwrap()
            .unwrap();
        assert!(freed.is_available);
    }

    #[test]
    fn test_cancel_refunds_unreleased_balance() {
        let (store, _dir) = temp_store();
        let (order_id, middleman_id, pickup_token, _, total) = in_transit_fixture(&store);
        commit_pickup(&store, order_id, middleman_id, &pickup_token, None).unwrap();

        let outcome = store
            .with_tx(|conn| cancel_escrow(conn, order_id))
            .unwrap()
            .expect("cancel should apply");

        // Farmer keeps the pickup tranche; the rest refunds.
        assert_eq!(outcome.escrow.status, EscrowStatus::Cancelled);
        assert_eq!(outcome.escrow.farmer_released_cents, 600);
        assert_eq!(outcome.escrow.refunded_cents, total - 600);
        assert_eq!(
            outcome.escrow.refunded_cents + outcome.escrow.farmer_released_cents,
            total
        );
        // Demo intent: nothing to unwind processor-side.
        assert!(outcome.refund_intent.is_none());

        // Applied twice is equivalent to once.
        let again = store.with_tx(|conn| cancel_escrow(conn, order_id)).unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn test_cancel_before_funds_refunds_everything() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        let buyer = seed_buyer(&store);
        let order = seed_order(&store, farmer.id, 50.0, 1.0);
        let (bid, _, _) = submit_bid(&store, order.id, buyer.id, 1.0, 50.0, None).unwrap();
        commit_accept_bid(&store, farmer.id, bid.id, "pi_demo_cancel".to_string()).unwrap();

        let outcome = store
            .with_tx(|conn| cancel_escrow(conn, order.id))
            .unwrap()
            .unwrap();
        assert_eq!(outcome.escrow.refunded_cents, outcome.escrow.total_amount_cents);
        assert_eq!(outcome.escrow.farmer_released_cents, 0);
    }
}
