//! Application configuration loaded from the environment.

use anyhow::Result;

/// Runtime configuration, collected once at startup and shared via AppState.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    /// Route-corridor radius for the logistics matcher, in kilometres.
    pub route_buffer_km: f64,
    /// Persist one GPS frame out of every N received on the location stream.
    pub gps_persist_every: u64,
    /// Path to the demo truck seed used when the spatial query fails.
    pub demo_trucks_path: String,
    pub openrouteservice_api_key: Option<String>,
    pub logistics_timeout_hours: i64,
    pub gps_silence_hours: i64,
    pub logistics_poll_secs: u64,
    pub heartbeat_poll_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./agrimatch.db".to_string());

        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());

        let jwt_secret = std::env::var("SECRET_KEY")
            .unwrap_or_else(|_| "dev-secret-key-change-in-production".to_string());

        let stripe_secret_key =
            std::env::var("STRIPE_SECRET_KEY").unwrap_or_else(|_| "sk_test_placeholder".to_string());

        let stripe_webhook_secret =
            std::env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_else(|_| "whsec_placeholder".to_string());

        let route_buffer_km = std::env::var("LOGISTICS_ROUTE_BUFFER_KM")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|&v| v > 0.0)
            .unwrap_or(25.0);

        let gps_persist_every = std::env::var("GPS_PERSIST_EVERY")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(10);

        let demo_trucks_path = std::env::var("AGRIMATCH_DEMO_TRUCKS")
            .unwrap_or_else(|_| "./seed/demo_trucks.json".to_string());

        let openrouteservice_api_key = std::env::var("OPENROUTESERVICE_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let logistics_timeout_hours = std::env::var("LOGISTICS_TIMEOUT_HOURS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(48);

        let gps_silence_hours = std::env::var("GPS_SILENCE_HOURS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(2);

        let logistics_poll_secs = std::env::var("LOGISTICS_POLL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(300);

        let heartbeat_poll_secs = std::env::var("HEARTBEAT_POLL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(900);

        Ok(Self {
            database_path,
            bind_addr,
            jwt_secret,
            stripe_secret_key,
            stripe_webhook_secret,
            route_buffer_km,
            gps_persist_every,
            demo_trucks_path,
            openrouteservice_api_key,
            logistics_timeout_hours,
            gps_silence_hours,
            logistics_poll_secs,
            heartbeat_poll_secs,
        })
    }
}
