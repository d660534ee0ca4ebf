//! Best-effort external oracles.
//!
//! Every function here returns `None` on any failure so callers degrade to a
//! straight-line estimate. Nothing in the trade core depends on these
//! succeeding.

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::models::GeoPoint;
use crate::spatial;

const ORS_BASE: &str = "https://api.openrouteservice.org/v2/directions/driving-car";
const ORACLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrivingRoute {
    pub distance_km: f64,
    pub duration_hours: f64,
}

/// Road driving distance and travel time between two coordinates via
/// OpenRouteService. The key travels in the Authorization header so it never
/// lands in access logs.
pub async fn fetch_driving_route(
    client: &reqwest::Client,
    api_key: Option<&str>,
    start: GeoPoint,
    end: GeoPoint,
) -> Option<DrivingRoute> {
    let api_key = api_key?;

    // ORS convention: longitude first.
    let url = format!(
        "{}?start={},{}&end={},{}",
        ORS_BASE, start.longitude, start.latitude, end.longitude, end.latitude
    );

    let response = client
        .get(&url)
        .timeout(ORACLE_TIMEOUT)
        .header("Accept", "application/json")
        .bearer_auth(api_key)
        .send()
        .await;

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            warn!("routing oracle call failed: {}", e);
            return None;
        }
    };

    if !response.status().is_success() {
        // Status only; the URL could carry coordinates worth keeping quiet.
        warn!("routing oracle returned HTTP {}", response.status());
        return None;
    }

    let body: Value = match response.json().await {
        Ok(v) => v,
        Err(e) => {
            warn!("routing oracle returned unparseable body: {}", e);
            return None;
        }
    };

    let summary = body
        .get("features")?
        .get(0)?
        .get("properties")?
        .get("summary")?;
    let distance_m = summary.get("distance")?.as_f64()?;
    let duration_s = summary.get("duration")?.as_f64()?;

    Some(DrivingRoute {
        distance_km: (distance_m / 1000.0 * 100.0).round() / 100.0,
        duration_hours: (duration_s / 3600.0 * 100.0).round() / 100.0,
    })
}

/// Straight-line fallback when the routing oracle is unavailable: haversine
/// with a 1.3 road-winding factor, 60 km/h average speed.
pub fn fallback_route_estimate(start: GeoPoint, end: GeoPoint) -> DrivingRoute {
    let distance_km = spatial::haversine_m(start, end) / 1000.0 * 1.3;
    DrivingRoute {
        distance_km: (distance_km * 100.0).round() / 100.0,
        duration_hours: (distance_km / 60.0 * 100.0).round() / 100.0,
    }
}

/// Indicative market price per kg. Stub until a commodity price API key is
/// configured.
pub async fn fetch_market_price(_crop_type: &str, _region: &str) -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_estimate_scales_haversine() {
        let farm = GeoPoint::new(11.0168, 76.9558);
        let buyer = GeoPoint::new(13.0827, 80.2707);
        let estimate = fallback_route_estimate(farm, buyer);

        let straight_km = spatial::haversine_m(farm, buyer) / 1000.0;
        assert!(estimate.distance_km > straight_km);
        assert!(estimate.distance_km < straight_km * 1.35);
        assert!((estimate.duration_hours - estimate.distance_km / 60.0).abs() < 0.02);
    }

    #[tokio::test]
    async fn test_route_oracle_without_key_is_none() {
        let client = reqwest::Client::new();
        let result = fetch_driving_route(
            &client,
            None,
            GeoPoint::new(11.0, 77.0),
            GeoPoint::new(13.0, 80.0),
        )
        .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_market_price_is_stubbed() {
        assert_eq!(fetch_market_price("Tomato", "IN").await, None);
    }
}
