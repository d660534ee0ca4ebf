//! Order finite state machine.
//!
//! All mutations run inside one `BEGIN IMMEDIATE` transaction so concurrent
//! actors serialize on the order row: the first committer wins, the second
//! observes the committed state and fails with `InvalidTransition`. Every
//! successful edge appends an audit row in the same transaction; callers
//! broadcast the returned events only after commit.

use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::{self, AuditEntry, MarketStore};
use crate::errors::MarketError;
use crate::models::{Bid, BidStatus, Escrow, EscrowStatus, Order, OrderStatus, WsEvent};

/// The transition table. Everything not listed here is rejected.
pub fn allowed_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    matches!(
        (from, to),
        (Listed, Negotiating)
            | (Negotiating, LogisticsSearch)
            | (Negotiating, Listed)
            | (LogisticsSearch, InTransit)
            | (LogisticsSearch, Listed)
            | (InTransit, Settled)
    )
}

#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub actor_type: &'static str,
    pub actor_id: Option<Uuid>,
}

impl Actor {
    pub fn farmer(id: Uuid) -> Self {
        Self {
            actor_type: "farmer",
            actor_id: Some(id),
        }
    }

    pub fn buyer(id: Uuid) -> Self {
        Self {
            actor_type: "buyer",
            actor_id: Some(id),
        }
    }

    pub fn middleman(id: Uuid) -> Self {
        Self {
            actor_type: "middleman",
            actor_id: Some(id),
        }
    }

    pub fn system() -> Self {
        Self {
            actor_type: "system",
            actor_id: None,
        }
    }
}

/// SHA-256 hex digest of a raw QR token.
pub fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// 32 random bytes, hex encoded. The raw value is handed out exactly once.
fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// Atomically move an order along one permitted edge.
///
/// Must be called inside an open transaction. Stamps
/// `logistics_search_started_at` on entering LOGISTICS_SEARCH and
/// `settled_at` on entering SETTLED, and appends the audit row. The returned
/// event is emitted by the caller after the enclosing transaction commits.
pub fn transition_order(
    conn: &rusqlite::Connection,
    order_id: Uuid,
    to_status: OrderStatus,
    actor: Actor,
    reason: Option<&str>,
    metadata: Option<serde_json::Value>,
) -> Result<(Order, WsEvent), MarketError> {
    let mut order = db::require_order(conn, order_id)?;

    if !allowed_transition(order.status, to_status) {
        return Err(MarketError::InvalidTransition {
            from: order.status,
            to: to_status,
        });
    }

    let from_status = order.status;
    order.status = to_status;
    if to_status == OrderStatus::LogisticsSearch {
        order.logistics_search_started_at = Some(Utc::now());
    }
    if to_status == OrderStatus::Settled {
        order.settled_at = Some(Utc::now());
    }
    db::update_order(conn, &order)?;

    db::insert_audit(
        conn,
        &AuditEntry {
            order_id,
            from_status: Some(from_status.as_str()),
            to_status: to_status.as_str(),
            actor_type: actor.actor_type,
            actor_id: actor.actor_id,
            reason,
            extra_data: metadata.clone(),
        },
    )?;

    let event = WsEvent::FsmTransition {
        order_id,
        from: from_status,
        to: to_status,
        timestamp: Utc::now(),
        metadata,
    };
    Ok((order, event))
}

/// Submit a bid on a LISTED or NEGOTIATING order.
///
/// The first bid on a LISTED order performs the `LISTED → NEGOTIATING` edge
/// in the same transaction. Available volume is checked but not decremented;
/// volume is only committed on acceptance.
pub fn submit_bid(
    store: &MarketStore,
    order_id: Uuid,
    buyer_id: Uuid,
    offered_price_per_kg: f64,
    volume_kg: f64,
    message: Option<String>,
) -> Result<(Bid, Order, Vec<WsEvent>), MarketError> {
    store.with_tx(|conn| {
        let order = db::require_order(conn, order_id)?;

        if !matches!(
            order.status,
            OrderStatus::Listed | OrderStatus::Negotiating
        ) {
            return Err(MarketError::InvalidTransition {
                from: order.status,
                to: OrderStatus::Negotiating,
            });
        }

        if volume_kg > order.available_volume_kg {
            return Err(MarketError::InsufficientVolume {
                requested_kg: volume_kg,
                available_kg: order.available_volume_kg,
            });
        }

        let bid = Bid {
            id: Uuid::new_v4(),
            order_id,
            buyer_id,
            offered_price_per_kg,
            volume_kg,
            status: BidStatus::Pending,
            message,
            expires_at: None,
            created_at: Utc::now(),
        };
        db::insert_bid(conn, &bid)?;

        let mut events = Vec::new();
        let order = if order.status == OrderStatus::Listed {
            let (order, event) = transition_order(
                conn,
                order_id,
                OrderStatus::Negotiating,
                Actor::buyer(buyer_id),
                Some("first_bid_submitted"),
                None,
            )?;
            events.push(event);
            order
        } else {
            order
        };

        events.push(WsEvent::NewBid {
            order_id,
            bid_id: bid.id,
            offered_price_per_kg,
            volume_kg,
        });

        Ok((bid, order, events))
    })
}

/// Everything the caller needs before creating the payment authorization.
#[derive(Debug, Clone)]
pub struct AcceptQuote {
    pub order_id: Uuid,
    pub bid_id: Uuid,
    pub total_amount_cents: i64,
}

/// Result of a committed acceptance. The raw QR tokens appear here and
/// nowhere else; only their hashes are persisted.
#[derive(Debug)]
pub struct AcceptedBid {
    pub order: Order,
    pub escrow: Escrow,
    pub pickup_qr_token: String,
    pub delivery_qr_token: String,
    pub events: Vec<WsEvent>,
}

fn validate_accept(
    conn: &rusqlite::Connection,
    farmer_id: Uuid,
    bid_id: Uuid,
) -> Result<(Bid, Order), MarketError> {
    let bid = db::get_bid(conn, bid_id)?.ok_or(MarketError::BidNotFound(bid_id))?;
    let order = db::require_order(conn, bid.order_id)?;

    if order.farmer_id != farmer_id {
        return Err(MarketError::Forbidden(
            "Only the listing farmer can accept bids",
        ));
    }
    if order.status != OrderStatus::Negotiating {
        return Err(MarketError::InvalidTransition {
            from: order.status,
            to: OrderStatus::LogisticsSearch,
        });
    }
    if bid.status != BidStatus::Pending {
        return Err(MarketError::InvalidBidState {
            current: bid.status,
        });
    }
    if bid.volume_kg > order.available_volume_kg {
        return Err(MarketError::InsufficientVolume {
            requested_kg: bid.volume_kg,
            available_kg: order.available_volume_kg,
        });
    }
    Ok((bid, order))
}

/// Read-only preflight for acceptance: checks every precondition and prices
/// the escrow so the payment authorization can be created before anything is
/// mutated.
pub fn quote_accept_bid(
    store: &MarketStore,
    farmer_id: Uuid,
    bid_id: Uuid,
) -> Result<AcceptQuote, MarketError> {
    store.with_conn(|conn| {
        let (bid, order) = validate_accept(conn, farmer_id, bid_id)?;
        Ok(AcceptQuote {
            order_id: order.id,
            bid_id: bid.id,
            total_amount_cents: escrow_total_cents(bid.volume_kg, bid.offered_price_per_kg),
        })
    })
}

pub fn escrow_total_cents(volume_kg: f64, price_per_kg: f64) -> i64 {
    (volume_kg * price_per_kg * 100.0).round() as i64
}

/// Commit a bid acceptance. Re-validates every precondition under the write
/// transaction, so a racing acceptance resolves with exactly one winner; the
/// loser surfaces `InvalidTransition` from the committed state.
pub fn commit_accept_bid(
    store: &MarketStore,
    farmer_id: Uuid,
    bid_id: Uuid,
    payment_intent_id: String,
) -> Result<AcceptedBid, MarketError> {
    store.with_tx(|conn| {
        let (bid, mut order) = validate_accept(conn, farmer_id, bid_id)?;

        order.available_volume_kg -= bid.volume_kg;
        order.buyer_id = Some(bid.buyer_id);
        order.accepted_price = Some(bid.offered_price_per_kg);

        db::set_bid_status(conn, bid.id, BidStatus::Accepted)?;
        db::reject_other_pending_bids(conn, order.id, bid.id)?;

        let pickup_qr_token = mint_token();
        let delivery_qr_token = mint_token();
        order.pickup_qr_hash = Some(hash_token(&pickup_qr_token));
        order.delivery_qr_hash = Some(hash_token(&delivery_qr_token));
        db::update_order(conn, &order)?;

        let escrow = Escrow {
            id: Uuid::new_v4(),
            order_id: order.id,
            total_amount_cents: escrow_total_cents(bid.volume_kg, bid.offered_price_per_kg),
            farmer_released_cents: 0,
            middleman_released_cents: 0,
            refunded_cents: 0,
            status: EscrowStatus::WaitingFunds,
            stripe_payment_intent_id: Some(payment_intent_id),
            stripe_transfer_farmer_pickup_id: None,
            stripe_transfer_farmer_final_id: None,
            stripe_transfer_middleman_id: None,
            funds_held_at: None,
            picked_up_at: None,
            delivered_at: None,
            cancelled_at: None,
            created_at: Utc::now(),
        };
        db::insert_escrow(conn, &escrow)?;

        let (order, event) = transition_order(
            conn,
            order.id,
            OrderStatus::LogisticsSearch,
            Actor::farmer(farmer_id),
            Some("bid_accepted"),
            Some(serde_json::json!({
                "bid_id": bid.id,
                "volume_kg": bid.volume_kg,
            })),
        )?;

        Ok(AcceptedBid {
            order,
            escrow,
            pickup_qr_token,
            delivery_qr_token,
            events: vec![event],
        })
    })
}

/// Return an order to LISTED after the logistics search ran dry.
///
/// Restores the accepted bid's volume, rejects that bid, clears the buyer,
/// accepted price, both QR hashes, and the search timestamp. Idempotent:
/// any status other than LOGISTICS_SEARCH is a no-op.
pub fn rollback_to_listed(
    conn: &rusqlite::Connection,
    order_id: Uuid,
    reason: &str,
) -> Result<Option<(Order, WsEvent)>, MarketError> {
    let mut order = db::require_order(conn, order_id)?;
    if order.status != OrderStatus::LogisticsSearch {
        return Ok(None);
    }

    if order.buyer_id.is_some() {
        if let Some(accepted) = db::accepted_bid_for_order(conn, order_id)? {
            order.available_volume_kg += accepted.volume_kg;
            db::set_bid_status(conn, accepted.id, BidStatus::Rejected)?;
        }
    }

    order.status = OrderStatus::Listed;
    order.buyer_id = None;
    order.accepted_price = None;
    order.pickup_qr_hash = None;
    order.delivery_qr_hash = None;
    order.logistics_search_started_at = None;
    db::update_order(conn, &order)?;

    db::insert_audit(
        conn,
        &AuditEntry {
            order_id,
            from_status: Some(OrderStatus::LogisticsSearch.as_str()),
            to_status: OrderStatus::Listed.as_str(),
            actor_type: "system",
            actor_id: None,
            reason: Some(reason),
            extra_data: None,
        },
    )?;

    let event = WsEvent::FsmTransition {
        order_id,
        from: OrderStatus::LogisticsSearch,
        to: OrderStatus::Listed,
        timestamp: Utc::now(),
        metadata: None,
    };
    Ok(Some((order, event)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;

    #[test]
    fn test_transition_table() {
        use OrderStatus::*;
        assert!(allowed_transition(Listed, Negotiating));
        assert!(allowed_transition(Negotiating, LogisticsSearch));
        assert!(allowed_transition(Negotiating, Listed));
        assert!(allowed_transition(LogisticsSearch, InTransit));
        assert!(allowed_transition(LogisticsSearch, Listed));
        assert!(allowed_transition(InTransit, Settled));

        // Terminal states have no exits; no edge enters CANCELLED.
        for to in [Listed, Negotiating, LogisticsSearch, InTransit, Settled, Cancelled] {
            assert!(!allowed_transition(Settled, to));
            assert!(!allowed_transition(Cancelled, to));
            assert!(!allowed_transition(to, Cancelled));
        }
        assert!(!allowed_transition(Listed, Settled));
        assert!(!allowed_transition(Listed, InTransit));
        assert!(!allowed_transition(InTransit, Listed));
    }

    #[test]
    fn test_transition_order_not_found() {
        let (store, _dir) = temp_store();
        let result = store.with_tx(|conn| {
            transition_order(
                conn,
                Uuid::new_v4(),
                OrderStatus::Negotiating,
                Actor::system(),
                None,
                None,
            )
        });
        assert!(matches!(result, Err(MarketError::OrderNotFound(_))));
    }

    #[test]
    fn test_invalid_edge_has_no_side_effects() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        let order = seed_order(&store, farmer.id, 100.0, 0.8);

        let result = store.with_tx(|conn| {
            transition_order(
                conn,
                order.id,
                OrderStatus::Settled,
                Actor::system(),
                None,
                None,
            )
        });
        assert!(matches!(result, Err(MarketError::InvalidTransition { .. })));

        let loaded = store
            .with_conn(|conn| db::require_order(conn, order.id))
            .unwrap();
        assert_eq!(loaded.status, OrderStatus::Listed);
        let audits = store
            .with_conn(|conn| db::audit_logs_for_order(conn, order.id))
            .unwrap();
        assert!(audits.is_empty());
    }

    #[test]
    fn test_first_bid_moves_order_to_negotiating() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        let buyer = seed_buyer(&store);
        let order = seed_order(&store, farmer.id, 100.0, 0.8);

        let (bid, order_after, events) =
            submit_bid(&store, order.id, buyer.id, 0.75, 40.0, None).unwrap();

        assert_eq!(bid.status, BidStatus::Pending);
        assert_eq!(order_after.status, OrderStatus::Negotiating);
        // Volume is not decremented on submission.
        assert_eq!(order_after.available_volume_kg, 100.0);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], WsEvent::FsmTransition { .. }));
        assert!(matches!(events[1], WsEvent::NewBid { .. }));

        // Second bid: no further transition, just the bid event.
        let (_, order_after, events) =
            submit_bid(&store, order.id, buyer.id, 0.70, 30.0, None).unwrap();
        assert_eq!(order_after.status, OrderStatus::Negotiating);
        assert_eq!(events.len(), 1);

        let audits = store
            .with_conn(|conn| db::audit_logs_for_order(conn, order.id))
            .unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].from_status.as_deref(), Some("LISTED"));
        assert_eq!(audits[0].to_status, "NEGOTIATING");
    }

    #[test]
    fn test_bid_volume_boundary() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        let buyer = seed_buyer(&store);
        let order = seed_order(&store, farmer.id, 100.0, 0.8);

        // Exactly the available volume is accepted.
        assert!(submit_bid(&store, order.id, buyer.id, 0.75, 100.0, None).is_ok());

        // Any positive excess is rejected.
        let result = submit_bid(&store, order.id, buyer.id, 0.75, 100.001, None);
        assert!(matches!(
            result,
            Err(MarketError::InsufficientVolume { .. })
        ));
    }

    #[test]
    fn test_accept_bid_full_effect() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        let buyer = seed_buyer(&store);
        let order = seed_order(&store, farmer.id, 100.0, 0.8);

        let (bid, _, _) = submit_bid(&store, order.id, buyer.id, 0.75, 40.0, None).unwrap();
        let (other, _, _) = submit_bid(&store, order.id, buyer.id, 0.70, 20.0, None).unwrap();

        let accepted =
            commit_accept_bid(&store, farmer.id, bid.id, "pi_demo_test".to_string()).unwrap();

        assert_eq!(accepted.order.status, OrderStatus::LogisticsSearch);
        assert_eq!(accepted.order.available_volume_kg, 60.0);
        assert_eq!(accepted.order.buyer_id, Some(buyer.id));
        assert_eq!(accepted.order.accepted_price, Some(0.75));
        assert!(accepted.order.logistics_search_started_at.is_some());

        // Escrow: 40 kg × $0.75 = 3,000 cents, waiting for funds.
        assert_eq!(accepted.escrow.total_amount_cents, 3_000);
        assert_eq!(accepted.escrow.status, EscrowStatus::WaitingFunds);
        assert_eq!(
            accepted.escrow.stripe_payment_intent_id.as_deref(),
            Some("pi_demo_test")
        );

        // The stored hashes match the raw tokens returned exactly once.
        let loaded = store
            .with_conn(|conn| db::require_order(conn, order.id))
            .unwrap();
        assert_eq!(
            loaded.pickup_qr_hash.as_deref(),
            Some(hash_token(&accepted.pickup_qr_token).as_str())
        );
        assert_eq!(
            loaded.delivery_qr_hash.as_deref(),
            Some(hash_token(&accepted.delivery_qr_token).as_str())
        );
        assert_ne!(accepted.pickup_qr_token, accepted.delivery_qr_token);

        // All other pending bids are now rejected; exactly one accepted.
        let bids = store
            .with_conn(|conn| db::list_bids_for_order(conn, order.id))
            .unwrap();
        let accepted_count = bids
            .iter()
            .filter(|b| b.status == BidStatus::Accepted)
            .count();
        assert_eq!(accepted_count, 1);
        let other_bid = bids.iter().find(|b| b.id == other.id).unwrap();
        assert_eq!(other_bid.status, BidStatus::Rejected);
    }

    #[test]
    fn test_double_accept_second_loses() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        let buyer = seed_buyer(&store);
        let order = seed_order(&store, farmer.id, 100.0, 0.8);
        let (bid, _, _) = submit_bid(&store, order.id, buyer.id, 0.75, 40.0, None).unwrap();

        commit_accept_bid(&store, farmer.id, bid.id, "pi_demo_one".to_string()).unwrap();
        let second = commit_accept_bid(&store, farmer.id, bid.id, "pi_demo_two".to_string());
        assert!(matches!(
            second,
            Err(MarketError::InvalidTransition { .. })
        ));

        // Exactly one escrow exists for the order.
        let escrow = store
            .with_conn(|conn| db::get_escrow_by_order(conn, order.id))
            .unwrap()
            .unwrap();
        assert_eq!(escrow.stripe_payment_intent_id.as_deref(), Some("pi_demo_one"));
    }

    #[test]
    fn test_accept_requires_ownership() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        let intruder = seed_farmer(&store);
        let buyer = seed_buyer(&store);
        let order = seed_order(&store, farmer.id, 100.0, 0.8);
        let (bid, _, _) = submit_bid(&store, order.id, buyer.id, 0.75, 40.0, None).unwrap();

        let result = quote_accept_bid(&store, intruder.id, bid.id);
        assert!(matches!(result, Err(MarketError::Forbidden(_))));
    }

    #[test]
    fn test_rollback_restores_volume_and_clears_capabilities() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        let buyer = seed_buyer(&store);
        let order = seed_order(&store, farmer.id, 50.0, 1.0);
        let (bid, _, _) = submit_bid(&store, order.id, buyer.id, 1.0, 50.0, None).unwrap();
        commit_accept_bid(&store, farmer.id, bid.id, "pi_demo_rb".to_string()).unwrap();

        let rolled = store
            .with_tx(|conn| rollback_to_listed(conn, order.id, "48hr_timeout"))
            .unwrap()
            .expect("rollback should apply");

        assert_eq!(rolled.0.status, OrderStatus::Listed);
        assert_eq!(rolled.0.available_volume_kg, 50.0);
        assert!(rolled.0.buyer_id.is_none());
        assert!(rolled.0.accepted_price.is_none());
        assert!(rolled.0.pickup_qr_hash.is_none());
        assert!(rolled.0.delivery_qr_hash.is_none());
        assert!(rolled.0.logistics_search_started_at.is_none());

        let bids = store
            .with_conn(|conn| db::list_bids_for_order(conn, order.id))
            .unwrap();
        assert_eq!(bids[0].status, BidStatus::Rejected);

        // Idempotent: second call is a no-op.
        let again = store
            .with_tx(|conn| rollback_to_listed(conn, order.id, "48hr_timeout"))
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn test_every_edge_audited_exactly_once() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        let buyer = seed_buyer(&store);
        let order = seed_order(&store, farmer.id, 100.0, 0.8);

        let (bid, _, _) = submit_bid(&store, order.id, buyer.id, 0.75, 40.0, None).unwrap();
        commit_accept_bid(&store, farmer.id, bid.id, "pi_demo_a".to_string()).unwrap();
        store
            .with_tx(|conn| rollback_to_listed(conn, order.id, "48hr_timeout"))
            .unwrap();

        let audits = store
            .with_conn(|conn| db::audit_logs_for_order(conn, order.id))
            .unwrap();
        let edges: Vec<(Option<String>, String)> = audits
            .iter()
            .map(|a| (a.from_status.clone(), a.to_status.clone()))
            .collect();
        assert_eq!(
            edges,
            vec![
                (Some("LISTED".to_string()), "NEGOTIATING".to_string()),
                (
                    Some("NEGOTIATING".to_string()),
                    "LOGISTICS_SEARCH".to_string()
                ),
                (Some("LOGISTICS_SEARCH".to_string()), "LISTED".to_string()),
            ]
        );
    }

    #[test]
    fn test_escrow_total_rounding() {
        assert_eq!(escrow_total_cents(40.0, 0.75), 3_000);
        assert_eq!(escrow_total_cents(33.3, 0.10), 333);
        assert_eq!(escrow_total_cents(0.333, 1.0), 33);
    }
}
