//! Logistics router: corridor search, assignment offers, accept/reject.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::auth::{self, AuthClaims};
use crate::db;
use crate::errors::MarketError;
use crate::external;
use crate::fsm::{self, Actor};
use crate::models::{
    AssignmentStatus, GeoPoint, LogisticsAssignment, OrderStatus, TruckType,
};
use crate::spatial::{self, RouteCandidate};
use crate::state::AppState;

// Demo coordinates used when a participant has no location on file
// (Coimbatore farm belt → Chennai wholesale market).
const DEMO_FARM: GeoPoint = GeoPoint {
    latitude: 11.0168,
    longitude: 76.9558,
};
const DEMO_MARKET: GeoPoint = GeoPoint {
    latitude: 13.0827,
    longitude: 80.2707,
};

fn route_endpoints(
    state: &AppState,
    order_id: Uuid,
) -> Result<(GeoPoint, GeoPoint, bool), MarketError> {
    state.store.with_conn(|conn| {
        let order = db::require_order(conn, order_id)?;
        if order.status != OrderStatus::LogisticsSearch {
            return Err(MarketError::Conflict(format!(
                "Order must be in LOGISTICS_SEARCH state (currently {})",
                order.status.as_str()
            )));
        }

        let farmer_location = db::get_farmer(conn, order.farmer_id)?
            .and_then(|farmer| farmer.location)
            .unwrap_or(DEMO_FARM);
        let buyer_location = order
            .buyer_id
            .map(|buyer_id| db::get_buyer(conn, buyer_id))
            .transpose()?
            .flatten()
            .and_then(|buyer| buyer.delivery_location)
            .unwrap_or(DEMO_MARKET);

        Ok((farmer_location, buyer_location, order.requires_cold_chain))
    })
}

/// GET /logistics/search/{order_id} — available trucks near the
/// farmer→buyer route, cold-chain filtered when the order needs it.
pub async fn search_nearby_middlemen(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<RouteCandidate>>, MarketError> {
    let (farmer_location, buyer_location, requires_cold_chain) =
        route_endpoints(&state, order_id)?;

    let candidates = spatial::find_middlemen_near_route(
        &state.store,
        farmer_location,
        buyer_location,
        state.config.route_buffer_km,
        requires_cold_chain,
        &state.config.demo_trucks_path,
    );
    Ok(Json(candidates))
}

#[derive(Debug, Deserialize)]
pub struct OfferRequest {
    pub middleman_id: Uuid,
    pub agreed_fee_cents: Option<i64>,
}

/// POST /logistics/offer/{order_id} — the listing farmer offers the haul to
/// a chosen middleman. An order carries at most one assignment.
pub async fn offer_assignment(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Path(order_id): Path<Uuid>,
    Json(body): Json<OfferRequest>,
) -> Result<(StatusCode, Json<LogisticsAssignment>), MarketError> {
    let farmer_id = auth::require_farmer(&claims)?;

    let assignment = state.store.with_tx(|conn| {
        let order = db::require_order(conn, order_id)?;
        if order.farmer_id != farmer_id {
            return Err(MarketError::Forbidden("Not your listing"));
        }
        if order.status != OrderStatus::LogisticsSearch {
            return Err(MarketError::Conflict(format!(
                "Order must be in LOGISTICS_SEARCH state (currently {})",
                order.status.as_str()
            )));
        }
        if db::get_assignment_by_order(conn, order_id)?.is_some() {
            return Err(MarketError::Conflict(
                "Order already has a logistics assignment".to_string(),
            ));
        }

        let middleman = db::get_middleman(conn, body.middleman_id)?
            .ok_or(MarketError::NotFound("Middleman"))?;
        if !middleman.is_available {
            return Err(MarketError::Conflict("Middleman is not available".to_string()));
        }

        let farmer_location = db::get_farmer(conn, order.farmer_id)?
            .and_then(|farmer| farmer.location)
            .unwrap_or(DEMO_FARM);
        let buyer_location = order
            .buyer_id
            .map(|buyer_id| db::get_buyer(conn, buyer_id))
            .transpose()?
            .flatten()
            .and_then(|buyer| buyer.delivery_location)
            .unwrap_or(DEMO_MARKET);
        let estimate = external::fallback_route_estimate(farmer_location, buyer_location);

        let assignment = LogisticsAssignment {
            id: Uuid::new_v4(),
            order_id,
            middleman_id: middleman.id,
            status: AssignmentStatus::Offered,
            last_gps_ping_at: None,
            gps_alert_sent: false,
            estimated_distance_km: Some(estimate.distance_km),
            agreed_fee_cents: body.agreed_fee_cents,
            offered_at: Utc::now(),
            accepted_at: None,
        };
        db::insert_assignment(conn, &assignment)?;
        Ok(assignment)
    })?;

    info!(
        "🚚 Assignment {} offered to middleman {} for order {}",
        assignment.id, assignment.middleman_id, order_id
    );
    Ok((StatusCode::CREATED, Json(assignment)))
}

fn validate_assignment_action(
    conn: &rusqlite::Connection,
    assignment_id: Uuid,
    middleman_id: Uuid,
) -> Result<LogisticsAssignment, MarketError> {
    let assignment = db::get_assignment(conn, assignment_id)?
        .ok_or(MarketError::AssignmentNotFound(assignment_id))?;
    if assignment.middleman_id != middleman_id {
        return Err(MarketError::Forbidden("Not your assignment"));
    }
    if assignment.status != AssignmentStatus::Offered {
        return Err(MarketError::Conflict("Assignment already actioned".to_string()));
    }
    Ok(assignment)
}

/// POST /logistics/accept/{id} — middleman takes the job; the order moves
/// IN_TRANSIT and the heartbeat clock starts.
///
/// The routing oracle runs before the transaction (network I/O never
/// happens under the store lock); the straight-line estimate covers oracle
/// failure.
pub async fn accept_assignment(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Path(assignment_id): Path<Uuid>,
) -> Result<Json<Value>, MarketError> {
    let middleman_id = auth::require_middleman(&claims)?;

    // Preflight: reject obviously wrong calls before paying for oracle I/O,
    // and resolve the route endpoints for the distance estimate.
    let (order_id, farmer_location, buyer_location) = state.store.with_conn(|conn| {
        let assignment = validate_assignment_action(conn, assignment_id, middleman_id)?;
        let order = db::require_order(conn, assignment.order_id)?;
        if order.status != OrderStatus::LogisticsSearch {
            return Err(MarketError::Conflict(format!(
                "Order is in {}, cannot accept",
                order.status.as_str()
            )));
        }
        if order.requires_cold_chain {
            let middleman = db::get_middleman(conn, middleman_id)?
                .ok_or(MarketError::NotFound("Middleman"))?;
            if middleman.truck_type != TruckType::Reefer {
                return Err(MarketError::Conflict(
                    "Order requires cold chain; only REEFER trucks can accept".to_string(),
                ));
            }
        }

        let farmer_location = db::get_farmer(conn, order.farmer_id)?
            .and_then(|farmer| farmer.location)
            .unwrap_or(DEMO_FARM);
        let buyer_location = order
            .buyer_id
            .map(|buyer_id| db::get_buyer(conn, buyer_id))
            .transpose()?
            .flatten()
            .and_then(|buyer| buyer.delivery_location)
            .unwrap_or(DEMO_MARKET);
        Ok((order.id, farmer_location, buyer_location))
    })?;

    let route = match external::fetch_driving_route(
        &state.http_client,
        state.config.openrouteservice_api_key.as_deref(),
        farmer_location,
        buyer_location,
    )
    .await
    {
        Some(route) => route,
        None => external::fallback_route_estimate(farmer_location, buyer_location),
    };

    let events = state.store.with_tx(|conn| {
        let mut assignment = validate_assignment_action(conn, assignment_id, middleman_id)?;

        assignment.status = AssignmentStatus::Accepted;
        assignment.accepted_at = Some(Utc::now());
        // Grace period for the heartbeat monitor starts now.
        assignment.last_gps_ping_at = Some(Utc::now());
        assignment.estimated_distance_km = Some(route.distance_km);
        db::update_assignment(conn, &assignment)?;

        db::set_middleman_availability(conn, middleman_id, false)?;

        let (_, event) = fsm::transition_order(
            conn,
            assignment.order_id,
            OrderStatus::InTransit,
            Actor::middleman(middleman_id),
            Some("middleman_accepted"),
            None,
        )?;
        Ok(vec![event])
    })?;

    state.fabric.broadcast_all(order_id, &events);
    info!(
        "🚛 Middleman {} accepted assignment {}; order {} IN_TRANSIT",
        middleman_id, assignment_id, order_id
    );

    Ok(Json(json!({
        "ok": true,
        "order_id": order_id,
        "status": "IN_TRANSIT",
    })))
}

/// POST /logistics/reject/{id}
pub async fn reject_assignment(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Path(assignment_id): Path<Uuid>,
) -> Result<Json<Value>, MarketError> {
    let middleman_id = auth::require_middleman(&claims)?;

    state.store.with_tx(|conn| {
        let mut assignment = validate_assignment_action(conn, assignment_id, middleman_id)?;
        assignment.status = AssignmentStatus::Rejected;
        db::update_assignment(conn, &assignment)
    })?;

    Ok(Json(json!({ "ok": true })))
}
