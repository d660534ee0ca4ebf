//! Route-corridor matching and proof-of-location primitives.
//!
//! Candidate middlemen are pre-filtered in SQL (availability, location,
//! truck class); the geodesic corridor test runs here as a great-circle
//! cross-track distance against the farmer→buyer segment. On any storage
//! failure the matcher falls back to a file-based demo seed.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::db::{self, MarketStore};
use crate::models::{GeoPoint, Middleman};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Candidates returned ascending by distance to the route.
pub const MATCH_LIMIT: usize = 20;

/// SQL pre-filter bound before corridor math runs.
const CANDIDATE_SCAN_LIMIT: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCandidate {
    pub middleman: Middleman,
    pub distance_km: f64,
    pub estimated_arrival_hours: f64,
}

/// Outcome of a proof-of-location check. `proof_hash` is deterministic for
/// the same inputs and is persisted to the audit log as signed evidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationProof {
    pub is_within: bool,
    pub distance_m: f64,
    pub proof_hash: String,
}

/// Great-circle distance in metres (Haversine).
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let dphi = (b.latitude - a.latitude).to_radians();
    let dlambda = (b.longitude - a.longitude).to_radians();

    let h = (dphi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}

fn initial_bearing_rad(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let dlambda = (b.longitude - a.longitude).to_radians();
    let y = dlambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlambda.cos();
    y.atan2(x)
}

/// Distance in metres from `p` to the great-circle segment `a`→`b`.
///
/// Uses the cross-track formula, clamped to the segment: a point whose
/// projection falls before `a` or past `b` is measured to the nearer
/// endpoint.
pub fn distance_to_segment_m(p: GeoPoint, a: GeoPoint, b: GeoPoint) -> f64 {
    let segment_m = haversine_m(a, b);
    if segment_m < 1.0 {
        return haversine_m(p, a);
    }

    let d13 = haversine_m(a, p) / EARTH_RADIUS_M;
    if d13 == 0.0 {
        return 0.0;
    }
    let theta13 = initial_bearing_rad(a, p);
    let theta12 = initial_bearing_rad(a, b);

    // Projection falls behind the start point.
    if (theta13 - theta12).cos() < 0.0 {
        return haversine_m(p, a);
    }

    let cross_track = (d13.sin() * (theta13 - theta12).sin()).asin();
    let along_track = (d13.cos() / cross_track.cos()).acos();

    // Projection falls past the end point.
    if along_track * EARTH_RADIUS_M > segment_m {
        return haversine_m(p, b);
    }

    cross_track.abs() * EARTH_RADIUS_M
}

/// Pure proximity check between a middleman and the buyer's delivery point.
///
/// Same inputs always produce the same distance and hash; the hash string
/// binds both coordinates, the threshold, and the distance at 4 decimals.
pub fn check_middleman_at_buyer(
    middleman_location: GeoPoint,
    buyer_location: GeoPoint,
    threshold_m: f64,
) -> LocationProof {
    let distance_m = haversine_m(middleman_location, buyer_location);
    let is_within = distance_m <= threshold_m;

    let proof_string = format!(
        "{},{}|{},{}|{}|{:.4}",
        middleman_location.latitude,
        middleman_location.longitude,
        buyer_location.latitude,
        buyer_location.longitude,
        threshold_m,
        distance_m
    );
    let proof_hash = hex::encode(Sha256::digest(proof_string.as_bytes()));

    LocationProof {
        is_within,
        distance_m: (distance_m * 100.0).round() / 100.0,
        proof_hash,
    }
}

/// Available middlemen within `buffer_km` of the farmer→buyer route,
/// ascending by distance, at most [`MATCH_LIMIT`]. Cold-chain orders are
/// restricted to reefer trucks. Falls back to the demo seed when the
/// storage query fails.
pub fn find_middlemen_near_route(
    store: &MarketStore,
    farmer_location: GeoPoint,
    buyer_location: GeoPoint,
    buffer_km: f64,
    requires_cold_chain: bool,
    demo_seed_path: &str,
) -> Vec<RouteCandidate> {
    let candidates = store.with_conn(|conn| {
        db::candidate_middlemen(conn, requires_cold_chain, CANDIDATE_SCAN_LIMIT)
    });

    let candidates = match candidates {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!("spatial candidate query failed, using demo seed: {}", e);
            return load_demo_candidates(demo_seed_path);
        }
    };

    let mut matched: Vec<RouteCandidate> = candidates
        .into_iter()
        .filter_map(|middleman| {
            let location = middleman.current_location?;
            let distance_km =
                distance_to_segment_m(location, farmer_location, buyer_location) / 1000.0;
            if distance_km > buffer_km {
                return None;
            }
            Some(RouteCandidate {
                distance_km: (distance_km * 100.0).round() / 100.0,
                estimated_arrival_hours: (distance_km / 60.0 * 100.0).round() / 100.0,
                middleman,
            })
        })
        .collect();

    matched.sort_by(|a, b| {
        a.distance_km
            .partial_cmp(&b.distance_km)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matched.truncate(MATCH_LIMIT);
    matched
}

/// Demo-only fallback dataset. Missing or malformed seed yields an empty list.
pub fn load_demo_candidates(path: &str) -> Vec<RouteCandidate> {
    if !Path::new(path).exists() {
        return Vec::new();
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("demo truck seed at {} is malformed: {}", path, e);
            Vec::new()
        }),
        Err(e) => {
            warn!("failed to read demo truck seed at {}: {}", path, e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use crate::models::TruckType;

    const CHENNAI_BUYER: GeoPoint = GeoPoint {
        latitude: 13.0827,
        longitude: 80.2707,
    };
    const COIMBATORE_FARM: GeoPoint = GeoPoint {
        latitude: 11.0168,
        longitude: 76.9558,
    };

    #[test]
    fn test_haversine_known_distance() {
        // Coimbatore to Chennai is roughly 430 km as the crow flies.
        let d = haversine_m(COIMBATORE_FARM, CHENNAI_BUYER);
        assert!(d > 400_000.0 && d < 460_000.0, "got {}", d);
    }

    #[test]
    fn test_proof_of_location_near_buyer() {
        let middleman = GeoPoint::new(13.0830, 80.2710);
        let proof = check_middleman_at_buyer(middleman, CHENNAI_BUYER, 100.0);
        assert!(proof.is_within);
        assert!(
            proof.distance_m > 40.0 && proof.distance_m < 50.0,
            "got {}",
            proof.distance_m
        );
    }

    #[test]
    fn test_proof_is_deterministic() {
        let middleman = GeoPoint::new(13.0830, 80.2710);
        let first = check_middleman_at_buyer(middleman, CHENNAI_BUYER, 100.0);
        let second = check_middleman_at_buyer(middleman, CHENNAI_BUYER, 100.0);
        assert_eq!(first, second);
        assert_eq!(first.proof_hash.len(), 64);
    }

    #[test]
    fn test_proof_outside_threshold() {
        let far = GeoPoint::new(13.2000, 80.2707);
        let proof = check_middleman_at_buyer(far, CHENNAI_BUYER, 100.0);
        assert!(!proof.is_within);
        assert!(proof.distance_m > 1_000.0);
    }

    #[test]
    fn test_point_on_route_has_near_zero_distance() {
        // Midpoint-ish of the farm→buyer line should sit almost on the
        // great circle.
        let mid = GeoPoint::new(12.05, 78.62);
        let d = distance_to_segment_m(mid, COIMBATORE_FARM, CHENNAI_BUYER);
        assert!(d < 20_000.0, "got {}", d);
    }

    #[test]
    fn test_point_past_endpoint_clamps_to_endpoint() {
        // Well past Chennai along the same heading.
        let past = GeoPoint::new(13.8, 81.5);
        let d = distance_to_segment_m(past, COIMBATORE_FARM, CHENNAI_BUYER);
        let to_end = haversine_m(past, CHENNAI_BUYER);
        assert!((d - to_end).abs() < 1.0);
    }

    #[test]
    fn test_matcher_cold_chain_filter_and_ordering() {
        let (store, _dir) = temp_store();
        // Two reefers at different offsets from the corridor, one dry van
        // right on it.
        let near = seed_middleman_at(&store, TruckType::Reefer, GeoPoint::new(12.05, 78.62));
        let farther = seed_middleman_at(&store, TruckType::Reefer, GeoPoint::new(12.20, 78.70));
        seed_middleman_at(&store, TruckType::DryVan, GeoPoint::new(12.05, 78.62));

        let matches = find_middlemen_near_route(
            &store,
            COIMBATORE_FARM,
            CHENNAI_BUYER,
            25.0,
            true,
            "/nonexistent/demo.json",
        );

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].middleman.id, near.id);
        assert_eq!(matches[1].middleman.id, farther.id);
        assert!(matches[0].distance_km <= matches[1].distance_km);
        for candidate in &matches {
            assert_eq!(candidate.middleman.truck_type, TruckType::Reefer);
            assert!(
                (candidate.estimated_arrival_hours - candidate.distance_km / 60.0).abs() < 0.01
            );
        }
    }

    #[test]
    fn test_matcher_excludes_outside_corridor() {
        let (store, _dir) = temp_store();
        // Hundreds of km off the route.
        seed_middleman_at(&store, TruckType::DryVan, GeoPoint::new(19.0760, 72.8777));

        let matches = find_middlemen_near_route(
            &store,
            COIMBATORE_FARM,
            CHENNAI_BUYER,
            25.0,
            false,
            "/nonexistent/demo.json",
        );
        assert!(matches.is_empty());
    }

    #[test]
    fn test_demo_seed_missing_file_is_empty() {
        assert!(load_demo_candidates("/nonexistent/demo.json").is_empty());
    }
}
