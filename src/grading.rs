//! Crop image grading.
//!
//! Treated as an opaque collaborator: raw bytes in, `(grade, confidence)`
//! out. The production model runs out-of-process; this stand-in derives a
//! deterministic grade from simple byte statistics so the endpoint contract
//! and persistence paths are exercised end to end.

/// Grade a crop image from raw bytes. Returns (grade "A"|"B"|"C", confidence 0–1).
pub fn grade_crop_image_bytes(image_bytes: &[u8]) -> (String, f64) {
    if image_bytes.len() < 16 {
        return ("C".to_string(), 0.0);
    }

    let len = image_bytes.len() as f64;
    let mean = image_bytes.iter().map(|&b| b as f64).sum::<f64>() / len;
    let variance = image_bytes
        .iter()
        .map(|&b| {
            let d = b as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / len;

    // Stand-ins for freshness (tonal balance) and sharpness (local contrast).
    let freshness = 1.0 - (mean - 127.5).abs() / 127.5;
    let sharpness = (variance / 5_461.25).min(1.0); // 5461.25 = max variance / 3

    let score = 0.6 * freshness + 0.4 * sharpness;
    let (grade, confidence) = if score > 0.75 {
        ("A", score.min(1.0))
    } else if score > 0.45 {
        ("B", (score + 0.1).min(0.75))
    } else {
        ("C", 1.0 - score)
    };

    (grade.to_string(), (confidence * 1000.0).round() / 1000.0)
}
