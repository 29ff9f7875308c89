//! Distance-to-relevance scoring.
//!
//! Converts a `[0,1]` distance (cosine distance from the vector path, or a
//! pseudo-distance from the lexical matcher) into a bounded percentage via
//! a piecewise-linear mapping calibrated against observed short-text
//! embedding distances:
//!
//! | distance | formula | band |
//! |----------|------------------------|-----------|
//! | < 0.10   | 95                     | excellent |
//! | 0.10–0.30 | 85 − (d−0.10)×50      | 75–85     |
//! | 0.30–0.50 | 75 − (d−0.30)×100     | 55–75     |
//! | 0.50–0.70 | 55 − (d−0.50)×75      | 40–55     |
//! | > 0.70   | max(25, 40 − (d−0.70)×50) | 25–40  |
//!
//! The scorer never returns "no match": every input lands in
//! `[SCORE_FLOOR, SCORE_CEILING]`, and filtering near-zero relevance happens
//! downstream in the aggregator's noise-floor threshold.

/// Lower bound on chapter scores. Tunable: lowering it would let weak
/// matches read as weak in the UI instead of clustering at 25.
pub const SCORE_FLOOR: u8 = 25;

/// Upper bound on chapter scores.
pub const SCORE_CEILING: u8 = 100;

/// Map a `[0,1]` distance to a relevance percentage.
///
/// Out-of-range input is clamped into `[0,1]` first. The mapping is
/// non-increasing: a larger distance never scores higher.
pub fn relevance_score(distance: f64) -> u8 {
    let d = distance.clamp(0.0, 1.0);

    let raw = if d < 0.10 {
        95.0
    } else if d <= 0.30 {
        85.0 - (d - 0.10) * 50.0
    } else if d <= 0.50 {
        75.0 - (d - 0.30) * 100.0
    } else if d <= 0.70 {
        55.0 - (d - 0.50) * 75.0
    } else {
        40.0 - (d - 0.70) * 50.0
    };

    (raw.round() as i32).clamp(SCORE_FLOOR as i32, SCORE_CEILING as i32) as u8
}
