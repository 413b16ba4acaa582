//! Trend projection over recent readings.
//!
//! Pure functions: the same input window always produces the same output,
//! with no dependency on the time of call. The fitted curve is a
//! recency-weighted linear trend anchored at the latest reading. Weights
//! grow quadratically with sample index so the slope tracks acceleration in
//! the newest readings while older samples keep it from overreacting to a
//! single jump.

use chrono::{DateTime, Duration, Utc};

use crate::models::{PredictionPoint, Reading};

/// Minutes covered by the dense projection.
const PROJECTION_MINUTES: i64 = 60;

/// Sampling interval of the gapped projection.
const GAPPED_STEP_MINUTES: i64 = 5;

/// Below this many readings no projection is produced.
const MIN_FIT_READINGS: usize = 2;

struct TrendLine {
    anchor_value: f64,
    anchor: DateTime<Utc>,
    slope_per_minute: f64,
}

impl TrendLine {
    fn value_at(&self, minutes_ahead: i64) -> f64 {
        self.anchor_value + self.slope_per_minute * minutes_ahead as f64
    }

    fn point_at(&self, minutes_ahead: i64) -> PredictionPoint {
        PredictionPoint {
            timestamp: self.anchor + Duration::minutes(minutes_ahead),
            value: self.value_at(minutes_ahead),
        }
    }
}

/// Weighted least-squares slope through the window, forced through the
/// latest reading. Returns `None` on insufficient or degenerate input.
fn fit_trend(window: &[Reading]) -> Option<TrendLine> {
    if window.len() < MIN_FIT_READINGS {
        return None;
    }

    let base = window[0].timestamp;
    let minutes_since_base = |reading: &Reading| -> f64 {
        (reading.timestamp - base).num_milliseconds() as f64 / 60_000.0
    };

    let mut weight_sum = 0.0;
    let mut x_sum = 0.0;
    let mut y_sum = 0.0;
    for (index, reading) in window.iter().enumerate() {
        let weight = ((index + 1) * (index + 1)) as f64;
        weight_sum += weight;
        x_sum += weight * minutes_since_base(reading);
        y_sum += weight * reading.value;
    }
    let x_mean = x_sum / weight_sum;
    let y_mean = y_sum / weight_sum;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (index, reading) in window.iter().enumerate() {
        let weight = ((index + 1) * (index + 1)) as f64;
        let dx = minutes_since_base(reading) - x_mean;
        numerator += weight * dx * (reading.value - y_mean);
        denominator += weight * dx * dx;
    }

    // All readings share one timestamp; no direction can be inferred.
    if denominator == 0.0 {
        return None;
    }

    let latest = window.last()?;
    Some(TrendLine {
        anchor_value: latest.value,
        anchor: latest.timestamp,
        slope_per_minute: numerator / denominator,
    })
}

/// One projected point per minute for the next hour.
///
/// Empty when the window holds fewer than two readings; no speculative
/// output from insufficient data.
pub fn next_hour(window: &[Reading]) -> Vec<PredictionPoint> {
    let Some(line) = fit_trend(window) else {
        return Vec::new();
    };

    (1..=PROJECTION_MINUTES)
        .map(|minute| line.point_at(minute))
        .collect()
}

/// The same projection sampled every five minutes (12 points), for surfaces
/// where a dense overlay would be wasteful.
pub fn next_hour_gapped(window: &[Reading]) -> Vec<PredictionPoint> {
    let Some(line) = fit_trend(window) else {
        return Vec::new();
    };

    (1..=PROJECTION_MINUTES / GAPPED_STEP_MINUTES)
        .map(|step| line.point_at(step * GAPPED_STEP_MINUTES))
        .collect()
}

/// First future minute at which the projection drops to `threshold` or
/// below, within the next hour. `None` when the trend never crosses or the
/// window is insufficient.
///
/// Scans the same per-minute curve [`next_hour`] evaluates, so the two
/// always agree.
pub fn minutes_to_low(window: &[Reading], threshold: f64) -> Option<i64> {
    let line = fit_trend(window)?;

    (1..=PROJECTION_MINUTES).find(|&minute| line.value_at(minute) <= threshold)
}

/// Trailing slice of `readings` no older than `minutes` before the latest
/// reading. Input must be in ascending timestamp order.
pub fn recent_window(readings: &[Reading], minutes: i64) -> &[Reading] {
    let Some(latest) = readings.last() else {
        return readings;
    };

    let cutoff = latest.timestamp - Duration::minutes(minutes);
    let start = readings.partition_point(|reading| reading.timestamp < cutoff);
    &readings[start..]
}
