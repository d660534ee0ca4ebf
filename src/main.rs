//! AgriMatch backend — three-sided marketplace for perishable produce.
//!
//! The binary wires the trade-coordination core together: SQLite-backed
//! market store, order FSM, tripartite escrow against Stripe, route-corridor
//! logistics matching, the order-room event fabric, and the two background
//! monitors. Auth token issuance, profile CRUD, and demo seeding live in
//! sibling services.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    middleware as axum_mw,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agrimatch_backend::{
    api,
    auth::JwtHandler,
    config::Config,
    db::MarketStore,
    fabric::EventFabric,
    middleware::logging::request_logging,
    monitors,
    payments::StripeClient,
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!("🌾 AgriMatch trade core starting");

    let store = Arc::new(
        MarketStore::open(&config.database_path).context("Failed to initialize database")?,
    );

    let http_client = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;

    let stripe = Arc::new(StripeClient::new(
        http_client.clone(),
        config.stripe_secret_key.clone(),
        config.stripe_webhook_secret.clone(),
    ));
    if stripe.demo_mode() {
        info!("💳 Stripe demo mode active (placeholder key)");
    }

    let jwt = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let fabric = Arc::new(EventFabric::new());
    let config = Arc::new(config);

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        fabric: fabric.clone(),
        stripe: stripe.clone(),
        jwt,
        http_client,
    };

    // Background monitors: 48h logistics timeout and 2h GPS silence.
    tokio::spawn(monitors::logistics_timeout_monitor(
        store.clone(),
        fabric.clone(),
        stripe.clone(),
        config.logistics_poll_secs,
        config.logistics_timeout_hours,
    ));
    tokio::spawn(monitors::gps_heartbeat_monitor(
        store,
        fabric,
        config.heartbeat_poll_secs,
        config.gps_silence_hours,
    ));

    let app = build_router(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("🎯 API server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    // Role and ownership are enforced inside handlers; the AuthClaims
    // extractor rejects requests without a valid token.
    let api_v1 = Router::new()
        .route(
            "/orders",
            get(api::orders::list_orders).post(api::orders::create_listing),
        )
        .route(
            "/orders/price-guidance/:crop_type",
            get(api::orders::get_price_guidance),
        )
        .route(
            "/orders/:order_id",
            get(api::orders::get_order).delete(api::orders::delete_listing),
        )
        .route(
            "/orders/:order_id/upload-image",
            post(api::orders::upload_crop_image),
        )
        .route(
            "/orders/:order_id/intelligence",
            get(api::orders::get_order_intelligence),
        )
        .route("/bids", post(api::bids::submit_bid))
        .route("/bids/order/:order_id", get(api::bids::list_bids_for_order))
        .route("/bids/:bid_id/accept", post(api::bids::accept_bid))
        .route("/bids/:bid_id/reject", post(api::bids::reject_bid))
        .route("/bids/:bid_id", delete(api::bids::withdraw_bid))
        .route(
            "/logistics/search/:order_id",
            get(api::logistics::search_nearby_middlemen),
        )
        .route(
            "/logistics/offer/:order_id",
            post(api::logistics::offer_assignment),
        )
        .route(
            "/logistics/accept/:assignment_id",
            post(api::logistics::accept_assignment),
        )
        .route(
            "/logistics/reject/:assignment_id",
            post(api::logistics::reject_assignment),
        )
        .route("/verify/pickup", post(api::verify::verify_pickup))
        .route("/verify/delivery", post(api::verify::verify_delivery))
        .route(
            "/verify/dispute",
            post(api::verify::dispute_proof_of_location),
        )
        .route("/webhooks/stripe", post(api::webhooks::stripe_webhook))
        .route("/middlemen/me/location", put(api::middlemen::update_location));

    Router::new()
        .nest("/api/v1", api_v1)
        .route("/health", get(health_check))
        // WebSocket paths are top-level; tokens ride in the query string.
        .route("/ws/orders/:order_id", get(api::ws::order_websocket))
        .route(
            "/ws/middlemen/me/location",
            get(api::ws::middleman_location_stream),
        )
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(request_logging))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let db_ok = state
        .store
        .with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(Into::into)
        })
        .is_ok();

    Json(json!({
        "status": "ok",
        "service": "agrimatch",
        "db_ok": db_ok,
    }))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agrimatch_backend=debug,agrimatch=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
