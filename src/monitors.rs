//! Background monitors.
//!
//! Two wall-clock loops: the logistics timeout sweep (rolls stale searches
//! back and refunds) and the GPS heartbeat sweep (raises alerts, never
//! touches FSM state). One order's failure is logged and never stops the
//! batch. The sweep bodies are plain functions so tests can drive them with
//! a pinned clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{self, MarketStore};
use crate::escrow;
use crate::fabric::EventFabric;
use crate::fsm;
use crate::models::WsEvent;
use crate::payments::StripeClient;

pub struct TimeoutRollback {
    pub order_id: Uuid,
    pub events: Vec<WsEvent>,
    /// Processor-side authorization still to unwind, best-effort.
    pub refund_intent: Option<String>,
}

/// Roll back every order stuck in LOGISTICS_SEARCH since before
/// `now − timeout_hours`, cancelling its escrow in the same transaction.
pub fn sweep_logistics_timeouts(
    store: &MarketStore,
    now: DateTime<Utc>,
    timeout_hours: i64,
) -> Vec<TimeoutRollback> {
    let cutoff = now - chrono::Duration::hours(timeout_hours);

    let expired = match store.with_conn(|conn| db::timed_out_order_ids(conn, cutoff)) {
        Ok(ids) => ids,
        Err(e) => {
            error!("logistics timeout scan failed: {}", e);
            return Vec::new();
        }
    };

    let mut rolled_back = Vec::new();
    for order_id in expired {
        let result = store.with_tx(|conn| {
            let mut events = Vec::new();
            let Some((_, fsm_event)) = fsm::rollback_to_listed(conn, order_id, "48hr_timeout")?
            else {
                // Raced with a concurrent acceptance; nothing to do.
                return Ok(None);
            };
            events.push(fsm_event);

            let refund_intent = match escrow::cancel_escrow(conn, order_id)? {
                Some(outcome) => {
                    events.push(outcome.event);
                    outcome.refund_intent
                }
                None => None,
            };

            Ok(Some(TimeoutRollback {
                order_id,
                events,
                refund_intent,
            }))
        });

        match result {
            Ok(Some(rollback)) => {
                info!("⏳ Rolled back order {} (48hr logistics timeout)", order_id);
                rolled_back.push(rollback);
            }
            Ok(None) => {}
            Err(e) => error!("failed to roll back order {}: {}", order_id, e),
        }
    }
    rolled_back
}

/// Raise one GPS_HEARTBEAT_LOST per silent assignment. The alert flag flips
/// here and is cleared again by the next persisted GPS frame, so each silent
/// period alerts exactly once.
pub fn sweep_gps_heartbeats(
    store: &MarketStore,
    now: DateTime<Utc>,
    silence_hours: i64,
) -> Vec<WsEvent> {
    let cutoff = now - chrono::Duration::hours(silence_hours);

    let stale = match store.with_conn(|conn| db::stale_assignments(conn, cutoff)) {
        Ok(assignments) => assignments,
        Err(e) => {
            error!("gps heartbeat scan failed: {}", e);
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for assignment in stale {
        let result = store.with_tx(|conn| db::set_assignment_alert_sent(conn, assignment.id));
        match result {
            Ok(()) => {
                warn!(
                    "📵 GPS silence alert for order {} (middleman {})",
                    assignment.order_id, assignment.middleman_id
                );
                events.push(WsEvent::GpsHeartbeatLost {
                    order_id: assignment.order_id,
                    middleman_id: assignment.middleman_id,
                    timestamp: now,
                });
            }
            Err(e) => error!(
                "gps heartbeat alert failed for assignment {}: {}",
                assignment.id, e
            ),
        }
    }
    events
}

/// Every 5 minutes (configurable): expire stale logistics searches.
/// Processor refunds fire after the local commit; their failures are logged
/// for manual reconciliation and never block the rollback.
pub async fn logistics_timeout_monitor(
    store: Arc<MarketStore>,
    fabric: Arc<EventFabric>,
    stripe: Arc<StripeClient>,
    poll_secs: u64,
    timeout_hours: i64,
) {
    info!(
        "⏰ Logistics timeout monitor started (every {}s, {}h cutoff)",
        poll_secs, timeout_hours
    );
    let mut ticker = interval(Duration::from_secs(poll_secs));
    loop {
        ticker.tick().await;
        let rollbacks = sweep_logistics_timeouts(&store, Utc::now(), timeout_hours);
        for rollback in rollbacks {
            fabric.broadcast_all(rollback.order_id, &rollback.events);
            if let Some(intent_id) = rollback.refund_intent {
                if let Err(e) = stripe.cancel_or_refund(&intent_id).await {
                    error!(
                        "refund for order {} failed, finance reconciles manually: {}",
                        rollback.order_id, e
                    );
                }
            }
        }
    }
}

/// Every 15 minutes (configurable): alert on 2-hour GPS silence.
pub async fn gps_heartbeat_monitor(
    store: Arc<MarketStore>,
    fabric: Arc<EventFabric>,
    poll_secs: u64,
    silence_hours: i64,
) {
    info!(
        "🛰️ GPS heartbeat monitor started (every {}s, {}h silence)",
        poll_secs, silence_hours
    );
    let mut ticker = interval(Duration::from_secs(poll_secs));
    loop {
        ticker.tick().await;
        let events = sweep_gps_heartbeats(&store, Utc::now(), silence_hours);
        for event in events {
            if let WsEvent::GpsHeartbeatLost { order_id, .. } = &event {
                fabric.broadcast(*order_id, &event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use crate::fsm::{commit_accept_bid, submit_bid, Actor};
    use crate::models::{
        AssignmentStatus, BidStatus, EscrowStatus, GeoPoint, LogisticsAssignment, OrderStatus,
        TruckType,
    };

    #[test]
    fn test_timeout_sweep_rolls_back_and_refunds() {
        let (store, _dir) = temp_store();
        let farmer = seed_farmer(&store);
        let buyer = seed_buyer(&store);
        let order = seed_order(&store, farmer.id, 50.0, 1.0);
        let (bid, _, _) = submit_bid(&store, order.id, buyer.id, 1.0, 50.0, None).unwrap();
        commit_accept_bid(&store, farmer.id, bid.id, "pi_demo_timeout".to_string()).unwrap();

        // Within the window: nothing expires.
        let early = sweep_logistics_timeouts(&store, Utc::now(), 48);
        assert!(early.is_empty());

        // Pretend two days passed.
        let later = Utc::now() + chrono::Duration::hours(49);
        let rollbacks = sweep_logistics_timeouts(&store, later, 48);
        assert_eq!(rollbacks.len(), 1);
        assert_eq!(rollbacks[0].order_id, order.id);
        assert_eq!(rollbacks[0].events.len(), 2);

        let reloaded = store
            .with_conn(|conn| db::require_order(conn, order.id))
            .unwrap();
        assert_eq!(reloaded.status, OrderStatus::Listed);
        assert_eq!(reloaded.available_volume_kg, 50.0);
        assert!(reloaded.pickup_qr_hash.is_none());

        let escrow = store
            .with_conn(|conn| db::get_escrow_by_order(conn, order.id))
            .unwrap()
            .unwrap();
        assert_eq!(escrow.status, EscrowStatus::Cancelled);
        assert_eq!(escrow.refunded_cents, escrow.total_amount_cents);

        let bids = store
            .with_conn(|conn| db::list_bids_for_order(conn, order.id))
            .unwrap();
        assert_eq!(bids[0].status, BidStatus::Rejected);

        // A second sweep finds nothing.
        let again = sweep_logistics_timeouts(&store, later, 48);
        assert!(again.is_empty());
    }

    fn in_transit_with_ping(store: &MarketStore, last_ping: DateTime<Utc>) -> (Uuid, Uuid) {
        let farmer = seed_farmer(store);
        let buyer = seed_buyer(store);
        let middleman = seed_middleman(store, TruckType::DryVan);
        let order = seed_order(store, farmer.id, 100.0, 0.8);
        let (bid, _, _) = submit_bid(store, order.id, buyer.id, 0.75, 40.0, None).unwrap();
        commit_accept_bid(store, farmer.id, bid.id, "pi_demo_hb".to_string()).unwrap();

        store
            .with_tx(|conn| {
                db::insert_assignment(
                    conn,
                    &LogisticsAssignment {
                        id: Uuid::new_v4(),
                        order_id: order.id,
                        middleman_id: middleman.id,
                        status: AssignmentStatus::Accepted,
                        last_gps_ping_at: Some(last_ping),
                        gps_alert_sent: false,
                        estimated_distance_km: None,
                        agreed_fee_cents: None,
                        offered_at: Utc::now(),
                        accepted_at: Some(Utc::now()),
                    },
                )?;
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
        (order.id, middleman.id)
    }

    #[test]
    fn test_heartbeat_alert_fires_once_per_silent_period() {
        let (store, _dir) = temp_store();
        let silent_since = Utc::now() - chrono::Duration::hours(3);
        let (order_id, middleman_id) = in_transit_with_ping(&store, silent_since);

        let events = sweep_gps_heartbeats(&store, Utc::now(), 2);
        assert_eq!(events.len(), 1);
        match &events[0] {
            WsEvent::GpsHeartbeatLost {
                order_id: event_order,
                middleman_id: event_middleman,
                ..
            } => {
                assert_eq!(*event_order, order_id);
                assert_eq!(*event_middleman, middleman_id);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Flag flipped: no repeat alert while the silence continues.
        let repeat = sweep_gps_heartbeats(&store, Utc::now(), 2);
        assert!(repeat.is_empty());

        // FSM state untouched.
        let order = store
            .with_conn(|conn| db::require_order(conn, order_id))
            .unwrap();
        assert_eq!(order.status, OrderStatus::InTransit);
    }

    #[test]
    fn test_heartbeat_not_fired_before_cutoff() {
        let (store, _dir) = temp_store();
        let recent = Utc::now() - chrono::Duration::minutes(90);
        in_transit_with_ping(&store, recent);

        let events = sweep_gps_heartbeats(&store, Utc::now(), 2);
        assert!(events.is_empty());
    }

    #[test]
    fn test_fresh_gps_frame_rearms_alert() {
        let (store, _dir) = temp_store();
        let silent_since = Utc::now() - chrono::Duration::hours(3);
        let (order_id, middleman_id) = in_transit_with_ping(&store, silent_since);

        assert_eq!(sweep_gps_heartbeats(&store, Utc::now(), 2).len(), 1);

        // A persisted frame clears the flag and refreshes the heartbeat.
        store
            .with_tx(|conn| {
                db::record_gps_ping(
                    conn,
                    order_id,
                    middleman_id,
                    GeoPoint::new(12.9, 80.1),
                    Utc::now(),
                )
            })
            .unwrap();
        assert!(sweep_gps_heartbeats(&store, Utc::now(), 2).is_empty());

        // Silence again → a fresh alert fires.
        let much_later = Utc::now() + chrono::Duration::hours(3);
        assert_eq!(sweep_gps_heartbeats(&store, much_later, 2).len(), 1);
    }
}
