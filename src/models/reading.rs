//! Glucose reading data model.
//!
//! Represents a single sensor or meter value as reported by the remote
//! telemetry server, plus the projection points derived from readings.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Readings older than this are considered outdated for display purposes.
const OUTDATED_AFTER_MINUTES: i64 = 5;

/// Direction hint reported alongside a glucose reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrendArrow {
    None,
    Flat,
    SingleUp,
    DoubleUp,
    SingleDown,
    DoubleDown,
}

impl Default for TrendArrow {
    fn default() -> Self {
        TrendArrow::None
    }
}

impl TrendArrow {
    /// Derive an arrow from a per-five-minute delta when the server omits one.
    pub fn from_delta(delta: f64) -> Self {
        if delta >= 15.0 {
            TrendArrow::DoubleUp
        } else if delta >= 7.0 {
            TrendArrow::SingleUp
        } else if delta <= -15.0 {
            TrendArrow::DoubleDown
        } else if delta <= -7.0 {
            TrendArrow::SingleDown
        } else {
            TrendArrow::Flat
        }
    }
}

/// A single glucose value. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Glucose concentration in mg/dL.
    pub value: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// True for finger-stick meter entries, false for sensor values.
    #[serde(default)]
    pub is_metered: bool,
    #[serde(default)]
    pub trend: TrendArrow,
}

impl Reading {
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            timestamp,
            is_metered: false,
            trend: TrendArrow::None,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }

    /// Whether this reading is older than the expected sensor cadence allows.
    pub fn is_outdated(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > Duration::minutes(OUTDATED_AFTER_MINUTES)
    }
}

/// A projected future value. Produced only, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionPoint {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Restore ascending-timestamp order on a reading batch.
///
/// The sort is stable, so duplicate timestamps keep their incoming order
/// rather than being rejected.
pub fn sort_ascending(readings: &mut [Reading]) {
    readings.sort_by_key(|reading| reading.timestamp);
}
