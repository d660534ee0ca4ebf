//! Orders router: listings, marketplace browsing, crop-image grading, and
//! pre-listing price guidance.

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{self, AuthClaims};
use crate::db::{self, OrderFilter};
use crate::errors::MarketError;
use crate::grading::grade_crop_image_bytes;
use crate::models::{Bid, Escrow, GeoPoint, Order, OrderStatus};
use crate::produce;
use crate::external;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct OrderCreateRequest {
    pub crop_type: String,
    pub variety: Option<String>,
    pub total_volume_kg: f64,
    pub unit_price_asking: f64,
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub requires_cold_chain: bool,
    pub harvest_date: Option<DateTime<Utc>>,
}

/// Pre-listing pricing guidance shown to the farmer: standard Grade B
/// discount plus an urgency-adjusted figure when a harvest date is known.
#[derive(Debug, Serialize)]
pub struct PriceGuidance {
    pub crop_type: String,
    pub shelf_life_days: Option<u32>,
    pub requires_cold_chain: bool,
    pub grade_a_suggested_price: Option<f64>,
    pub grade_b_standard_price: Option<f64>,
    pub grade_b_urgency_price: Option<f64>,
    pub days_remaining: Option<u32>,
    pub urgency_note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OrderCreateResponse {
    #[serde(flatten)]
    pub order: Order,
    pub price_guidance: Option<PriceGuidance>,
}

pub fn build_price_guidance(
    crop_type: &str,
    asking_price: Option<f64>,
    harvest_date: Option<DateTime<Utc>>,
) -> PriceGuidance {
    let info = produce::produce_info(crop_type);
    let days_remaining =
        harvest_date.and_then(|date| produce::compute_days_remaining(date, crop_type, Utc::now()));

    let grade_b_standard = asking_price
        .and_then(|price| produce::suggest_price_for_grade(crop_type, "B", price, None));
    let grade_b_urgency = asking_price
        .and_then(|price| produce::suggest_price_for_grade(crop_type, "B", price, days_remaining));

    let urgency_note = match (info, days_remaining) {
        (Some(info), Some(days)) => {
            let shelf = info.shelf_days;
            let pct = if shelf > 0 { 100 * days / shelf } else { 100 };
            Some(if days == 0 {
                "Produce has reached its shelf limit — buyers will expect maximum discount."
                    .to_string()
            } else if pct <= 20 {
                format!(
                    "Only {} day(s) left ({}% of shelf life remaining). \
                     Urgent liquidation pricing has been applied.",
                    days, pct
                )
            } else if pct <= 50 {
                format!(
                    "{} of {} days remaining. Moderate urgency discount applied \
                     on top of Grade B rate.",
                    days, shelf
                )
            } else {
                format!(
                    "{} of {} days remaining — produce is still relatively fresh. \
                     Standard Grade B pricing applies.",
                    days, shelf
                )
            })
        }
        (Some(_), None) if asking_price.is_some() => Some(
            "No harvest date set — standard Grade B pricing shown. \
             Add a harvest date to see urgency-adjusted price."
                .to_string(),
        ),
        _ => None,
    };

    PriceGuidance {
        crop_type: crop_type.to_string(),
        shelf_life_days: info.map(|i| i.shelf_days),
        requires_cold_chain: info.map(|i| i.cold_chain).unwrap_or(false),
        grade_a_suggested_price: asking_price,
        grade_b_standard_price: grade_b_standard,
        grade_b_urgency_price: grade_b_urgency,
        days_remaining,
        urgency_note,
    }
}

/// POST /orders — create a produce listing.
pub async fn create_listing(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Json(body): Json<OrderCreateRequest>,
) -> Result<(StatusCode, Json<OrderCreateResponse>), MarketError> {
    let farmer_id = auth::require_farmer(&claims)?;

    if body.crop_type.trim().len() < 2 {
        return Err(MarketError::Validation("crop_type must be at least 2 characters"));
    }
    if body.total_volume_kg <= 0.0 {
        return Err(MarketError::Validation("total_volume_kg must be positive"));
    }
    if body.unit_price_asking <= 0.0 {
        return Err(MarketError::Validation("unit_price_asking must be positive"));
    }

    // Crops that inherently need refrigeration get the flag regardless of
    // what the farmer ticked.
    let requires_cold_chain =
        body.requires_cold_chain || produce::auto_suggest_cold_chain(&body.crop_type);

    let order = Order {
        id: Uuid::new_v4(),
        farmer_id,
        buyer_id: None,
        crop_type: body.crop_type.trim().to_string(),
        variety: body.variety,
        total_volume_kg: body.total_volume_kg,
        available_volume_kg: body.total_volume_kg,
        unit_price_asking: body.unit_price_asking,
        accepted_price: None,
        status: OrderStatus::Listed,
        requires_cold_chain,
        harvest_date: body.harvest_date,
        route_vector: None,
        crop_image_url: None,
        quality_grade: None,
        pickup_qr_hash: None,
        delivery_qr_hash: None,
        logistics_search_started_at: None,
        settled_at: None,
        created_at: Utc::now(),
        updated_at: None,
    };

    state.store.with_tx(|conn| {
        if db::get_farmer(conn, farmer_id)?.is_none() {
            return Err(MarketError::Unauthorized);
        }
        db::insert_order(conn, &order)
    })?;

    let price_guidance = build_price_guidance(
        &order.crop_type,
        Some(order.unit_price_asking),
        order.harvest_date,
    );

    Ok((
        StatusCode::CREATED,
        Json(OrderCreateResponse {
            order,
            price_guidance: Some(price_guidance),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListOrdersQuery {
    pub status: Option<OrderStatus>,
    pub crop_type: Option<String>,
    pub farmer_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /orders — browse the marketplace.
pub async fn list_orders(
    State(state): State<AppState>,
    Query(params): Query<ListOrdersQuery>,
) -> Result<Json<Vec<Order>>, MarketError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let offset = params.offset.unwrap_or(0).max(0);

    let orders = state.store.with_conn(|conn| {
        db::list_orders(
            conn,
            &OrderFilter {
                status: params.status,
                crop_type: params.crop_type.as_deref(),
                farmer_id: params.farmer_id,
                limit,
                offset,
            },
        )
    })?;
    Ok(Json(orders))
}

#[derive(Debug, Serialize)]
pub struct OrderDetailResponse {
    #[serde(flatten)]
    pub order: Order,
    pub bids: Vec<Bid>,
    pub escrow: Option<Escrow>,
}

/// GET /orders/{id}
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderDetailResponse>, MarketError> {
    let (order, bids, escrow) = state.store.with_conn(|conn| {
        let order = db::require_order(conn, order_id)?;
        let bids = db::list_bids_for_order(conn, order_id)?;
        let escrow = db::get_escrow_by_order(conn, order_id)?;
        Ok((order, bids, escrow))
    })?;
    Ok(Json(OrderDetailResponse {
        order,
        bids,
        escrow,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PriceGuidanceQuery {
    pub asking_price: Option<f64>,
    pub harvest_date: Option<DateTime<Utc>>,
}

/// GET /orders/price-guidance/{crop_type} — guidance before a listing exists.
pub async fn get_price_guidance(
    Path(crop_type): Path<String>,
    Query(params): Query<PriceGuidanceQuery>,
) -> Result<Json<PriceGuidance>, MarketError> {
    if let Some(price) = params.asking_price {
        if price <= 0.0 {
            return Err(MarketError::Validation("asking_price must be positive"));
        }
    }
    Ok(Json(build_price_guidance(
        &crop_type,
        params.asking_price,
        params.harvest_date,
    )))
}

#[derive(Debug, Serialize)]
pub struct ProduceIntelligenceResponse {
    pub crop_type: String,
    pub shelf_life_days: Option<u32>,
    pub days_remaining: Option<u32>,
    pub requires_cold_chain: bool,
    pub suggested_price: Option<f64>,
    pub grade: Option<String>,
}

/// GET /orders/{id}/intelligence — shelf-life view of an existing listing.
pub async fn get_order_intelligence(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ProduceIntelligenceResponse>, MarketError> {
    let order = state
        .store
        .with_conn(|conn| db::require_order(conn, order_id))?;

    let info = produce::produce_info(&order.crop_type);
    let days_remaining = order.harvest_date.and_then(|date| {
        produce::compute_days_remaining(date, &order.crop_type, Utc::now())
    });
    let grade = order.quality_grade.clone();
    let suggested_price = produce::suggest_price_for_grade(
        &order.crop_type,
        grade.as_deref().unwrap_or("A"),
        order.unit_price_asking,
        days_remaining,
    );

    Ok(Json(ProduceIntelligenceResponse {
        crop_type: order.crop_type,
        shelf_life_days: info.map(|i| i.shelf_days),
        days_remaining,
        requires_cold_chain: order.requires_cold_chain,
        suggested_price,
        grade,
    }))
}

#[derive(Debug, Serialize)]
pub struct GradingResult {
    pub quality_grade: String,
    pub confidence_score: f64,
    pub image_url: String,
    pub market_price_hint: Option<f64>,
    pub days_remaining: Option<u32>,
    pub suggested_grade_b_price: Option<f64>,
}

/// POST /orders/{id}/upload-image — grade a crop photo and persist the result.
pub async fn upload_crop_image(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Path(order_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<GradingResult>, MarketError> {
    let farmer_id = auth::require_farmer(&claims)?;

    let mut image: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| MarketError::Validation("malformed multipart body"))?
    {
        let filename = field.file_name().unwrap_or("crop.jpg").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|_| MarketError::Validation("malformed multipart body"))?;
        image = Some((filename, bytes.to_vec()));
        break;
    }
    let (filename, bytes) =
        image.ok_or(MarketError::Validation("image file field is required"))?;

    let (grade, confidence) = grade_crop_image_bytes(&bytes);
    let image_url = format!("/static/crops/{}/{}", order_id, filename);

    let order = state.store.with_tx(|conn| {
        let mut order = db::require_order(conn, order_id)?;
        if order.farmer_id != farmer_id {
            return Err(MarketError::Forbidden("Not your listing"));
        }
        order.quality_grade = Some(grade.clone());
        order.crop_image_url = Some(image_url.clone());
        db::update_order(conn, &order)?;
        Ok(order)
    })?;

    // Best-effort oracles; pricing falls back to the offline table.
    let market_price_hint = external::fetch_market_price(&order.crop_type, "IN").await;
    let days_remaining = order.harvest_date.and_then(|date| {
        produce::compute_days_remaining(date, &order.crop_type, Utc::now())
    });
    let suggested_grade_b_price = produce::suggest_price_for_grade(
        &order.crop_type,
        &grade,
        order.unit_price_asking,
        days_remaining,
    );

    Ok(Json(GradingResult {
        quality_grade: grade,
        confidence_score: confidence,
        image_url,
        market_price_hint,
        days_remaining,
        suggested_grade_b_price,
    }))
}

/// DELETE /orders/{id} — only LISTED orders can be withdrawn.
pub async fn delete_listing(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Path(order_id): Path<Uuid>,
) -> Result<StatusCode, MarketError> {
    let farmer_id = auth::require_farmer(&claims)?;

    state.store.with_tx(|conn| {
        let order = db::require_order(conn, order_id)?;
        if order.farmer_id != farmer_id {
            return Err(MarketError::Forbidden("Not your listing"));
        }
        if order.status != OrderStatus::Listed {
            return Err(MarketError::Conflict(
                "Cannot delete a listing that is not in LISTED state".to_string(),
            ));
        }
        db::delete_order(conn, order_id)
    })?;

    Ok(StatusCode::NO_CONTENT)
}
