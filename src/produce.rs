//! Shelf-life, storage, and grade-based pricing intelligence.
//!
//! Offline lookup table; no API keys involved. Shelf lives are ambient
//! (~20°C) figures, grade-B ratios are fractions of the Grade A price.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy)]
pub struct ProduceInfo {
    /// Approximate shelf life in days at ambient temperature.
    pub shelf_days: u32,
    /// True when a reefer truck is required for Grade B / damaged produce.
    pub cold_chain: bool,
    /// Grade B price as a fraction of the Grade A / market price.
    pub grade_b_ratio: f64,
}

const fn info(shelf_days: u32, cold_chain: bool, grade_b_ratio: f64) -> ProduceInfo {
    ProduceInfo {
        shelf_days,
        cold_chain,
        grade_b_ratio,
    }
}

/// Lookup keyed on the normalized (trimmed, case-folded) crop name.
pub fn produce_info(crop_type: &str) -> Option<ProduceInfo> {
    let normalized = crop_type.trim().to_lowercase();
    let entry = match normalized.as_str() {
        "tomato" => info(7, false, 0.60),
        "mango" => info(5, false, 0.65),
        "banana" => info(3, false, 0.50),
        "spinach" => info(3, true, 0.55),
        "onion" => info(180, false, 0.75),
        "potato" => info(90, false, 0.80),
        "strawberry" => info(2, true, 0.45),
        "grapes" => info(7, true, 0.50),
        "cabbage" => info(14, false, 0.70),
        "carrot" => info(21, false, 0.75),
        "papaya" => info(5, false, 0.60),
        "cucumber" => info(7, false, 0.65),
        "cauliflower" => info(14, false, 0.68),
        "brinjal" => info(7, false, 0.62),
        "okra" => info(4, false, 0.58),
        "chilli" => info(10, false, 0.65),
        "pumpkin" => info(60, false, 0.72),
        "watermelon" => info(14, false, 0.60),
        "guava" => info(4, false, 0.55),
        "pomegranate" => info(30, false, 0.70),
        _ => return None,
    };
    Some(entry)
}

/// Days left before the produce expires. None for unknown crops, 0 when the
/// shelf life has already elapsed.
pub fn compute_days_remaining(
    harvest_date: DateTime<Utc>,
    crop_type: &str,
    now: DateTime<Utc>,
) -> Option<u32> {
    let info = produce_info(crop_type)?;
    let elapsed_days = (now - harvest_date).num_seconds() as f64 / 86_400.0;
    let remaining = info.shelf_days as f64 - elapsed_days;
    Some(remaining.max(0.0) as u32)
}

/// Suggested price per kg for a given grade.
///
/// Grade A returns the asking price unchanged; unknown crops return None.
/// When `days_remaining` is known, an urgency multiplier is layered on top of
/// the standard Grade B discount: 1.0 at full shelf life down to 0.5 at
/// expiry.
pub fn suggest_price_for_grade(
    crop_type: &str,
    grade: &str,
    asking_price: f64,
    days_remaining: Option<u32>,
) -> Option<f64> {
    let info = produce_info(crop_type)?;
    if !grade.eq_ignore_ascii_case("b") {
        return Some(asking_price);
    }

    let base_price = asking_price * info.grade_b_ratio;
    let price = match days_remaining {
        Some(days) if info.shelf_days > 0 => {
            let urgency_factor = (days as f64 / info.shelf_days as f64).clamp(0.0, 1.0);
            let urgency_multiplier = 0.5 + 0.5 * urgency_factor;
            base_price * urgency_multiplier
        }
        _ => base_price,
    };
    Some((price * 10_000.0).round() / 10_000.0)
}

/// True when the crop inherently needs a reefer truck.
pub fn auto_suggest_cold_chain(crop_type: &str) -> bool {
    produce_info(crop_type).map(|i| i.cold_chain).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert!(produce_info("Tomato").is_some());
        assert!(produce_info("  STRAWBERRY ").is_some());
        assert!(produce_info("Durian").is_none());
    }

    #[test]
    fn test_cold_chain_suggestion() {
        assert!(auto_suggest_cold_chain("Spinach"));
        assert!(auto_suggest_cold_chain("Grapes"));
        assert!(!auto_suggest_cold_chain("Onion"));
        assert!(!auto_suggest_cold_chain("Durian"));
    }

    #[test]
    fn test_days_remaining_clamps_at_zero() {
        let now = Utc::now();
        let harvested_long_ago = now - Duration::days(30);
        assert_eq!(compute_days_remaining(harvested_long_ago, "Tomato", now), Some(0));

        let fresh = now - Duration::days(2);
        assert_eq!(compute_days_remaining(fresh, "Tomato", now), Some(5));
        assert_eq!(compute_days_remaining(fresh, "Durian", now), None);
    }

    #[test]
    fn test_grade_a_price_unchanged() {
        assert_eq!(suggest_price_for_grade("Tomato", "A", 1.5, None), Some(1.5));
    }

    #[test]
    fn test_grade_b_standard_discount() {
        let price = suggest_price_for_grade("Tomato", "B", 1.0, None).unwrap();
        assert!((price - 0.60).abs() < 1e-9);
    }

    #[test]
    fn test_grade_b_urgency_halves_at_expiry() {
        let fresh = suggest_price_for_grade("Tomato", "B", 1.0, Some(7)).unwrap();
        let expiring = suggest_price_for_grade("Tomato", "B", 1.0, Some(0)).unwrap();
        assert!((fresh - 0.60).abs() < 1e-9);
        assert!((expiring - 0.30).abs() < 1e-9);
        assert!(expiring < fresh);
    }
}
