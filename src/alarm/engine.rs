//! Alarm condition evaluation.
//!
//! A guarded priority list over the device snapshot, the recent readings,
//! and the user's thresholds. Each evaluation yields at most one reason
//! string; delivery (sound, push, badge) is the host's job.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::AlarmConfig;
use crate::clock::Clock;
use crate::models::{DeviceSnapshot, Reading};
use crate::predict;

/// Expected sensor cadence. Edge detection treats a step of roughly twice
/// this as one missing reading.
const READING_CADENCE_MINUTES: i64 = 5;

/// A single tolerated gap spans at most this many minutes.
const MAX_TOLERATED_GAP_MINUTES: i64 = 12;

/// Window of readings handed to the low predictor.
const PREDICTION_WINDOW_MINUTES: i64 = 30;

/// Result of one evaluation tick. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmState {
    pub active_reason_text: Option<String>,
    pub is_snoozed: bool,
    pub remaining_snooze_minutes: i64,
}

impl AlarmState {
    fn inactive() -> Self {
        Self {
            active_reason_text: None,
            is_snoozed: false,
            remaining_snooze_minutes: 0,
        }
    }

    /// Whether the host should alert right now.
    pub fn should_alert(&self) -> bool {
        self.active_reason_text.is_some()
    }
}

/// Stateless rule evaluator. Sustained-high duration is derived from the
/// reading history on every tick rather than tracked between ticks.
pub struct AlarmEngine {
    clock: Arc<dyn Clock>,
}

impl AlarmEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Evaluate every condition in priority order against the current data.
    ///
    /// `readings` is the Today segment in ascending timestamp order.
    pub fn evaluate(
        &self,
        config: &AlarmConfig,
        snapshot: Option<&DeviceSnapshot>,
        readings: &[Reading],
    ) -> AlarmState {
        let now = self.clock.now();

        if config.disabled {
            return AlarmState::inactive();
        }

        if config.is_snoozed(now) {
            return AlarmState {
                active_reason_text: None,
                is_snoozed: true,
                remaining_snooze_minutes: config.remaining_snooze_minutes(now),
            };
        }

        AlarmState {
            active_reason_text: self.first_matching_condition(config, snapshot, readings, now),
            is_snoozed: false,
            remaining_snooze_minutes: 0,
        }
    }

    /// The underlying reason regardless of any active snooze, for surfaces
    /// that pre-warn before the snooze expires. The global disable flag
    /// still applies.
    pub fn active_reason(
        &self,
        config: &AlarmConfig,
        snapshot: Option<&DeviceSnapshot>,
        readings: &[Reading],
        ignore_snooze: bool,
    ) -> Option<String> {
        let now = self.clock.now();

        if config.disabled {
            return None;
        }
        if !ignore_snooze && config.is_snoozed(now) {
            return None;
        }

        self.first_matching_condition(config, snapshot, readings, now)
    }

    fn first_matching_condition(
        &self,
        config: &AlarmConfig,
        snapshot: Option<&DeviceSnapshot>,
        readings: &[Reading],
        now: DateTime<Utc>,
    ) -> Option<String> {
        // Stale data invalidates every value-based condition below, so the
        // missed-readings check always runs first.
        let snapshot = match snapshot {
            Some(snapshot)
                if now - snapshot.time
                    <= Duration::minutes(config.no_data_alarm_after_minutes) =>
            {
                snapshot
            }
            _ => return Some("Missed readings".to_string()),
        };

        let value = snapshot.glucose_value;

        if config.persistent_high_enabled {
            // Replaces the plain high alert: no high is reported until the
            // sustained-high criteria are met.
            if let Some(reason) = persistent_high(config, value, readings) {
                return Some(reason);
            }
        } else if value > config.upper_bound {
            return Some("High BG".to_string());
        }

        if value < config.lower_bound {
            return Some("Low BG".to_string());
        }

        if let Some(reason) = edge_detection(config, readings) {
            return Some(reason);
        }

        if config.low_prediction_enabled {
            let window = predict::recent_window(readings, PREDICTION_WINDOW_MINUTES);
            if let Some(minutes) = predict::minutes_to_low(window, config.lower_bound) {
                if minutes < config.low_prediction_minutes {
                    return Some(format!("Low predicted in {minutes} min"));
                }
            }
        }

        None
    }
}

/// Sustained-high condition. The urgent ceiling bypasses the duration wait;
/// otherwise the trailing run of readings above the upper bound must span
/// the configured minutes.
fn persistent_high(
    config: &AlarmConfig,
    value: f64,
    readings: &[Reading],
) -> Option<String> {
    if value >= config.persistent_high_urgent_bound {
        return Some("Urgent high BG".to_string());
    }

    if value <= config.upper_bound {
        return None;
    }

    let run_start = readings
        .iter()
        .rev()
        .take_while(|reading| reading.value > config.upper_bound)
        .last()?;
    let latest = readings.last()?;

    let run = latest.timestamp - run_start.timestamp;
    if run >= Duration::minutes(config.persistent_high_minutes) {
        Some("Persistent high BG".to_string())
    } else {
        None
    }
}

/// Rate-of-change condition: the last N per-step deltas all exceed the
/// configured magnitude in the same direction. One missing reading in the
/// run is tolerated; deltas are normalized to the five-minute cadence so a
/// gap does not double-count.
fn edge_detection(config: &AlarmConfig, readings: &[Reading]) -> Option<String> {
    if !config.edge_detection_enabled {
        return None;
    }

    let steps = config.edge_consecutive_readings;
    if steps == 0 || config.edge_delta_amount <= 0.0 || readings.len() < steps + 1 {
        return None;
    }

    let tail = &readings[readings.len() - (steps + 1)..];
    let mut gaps = 0;
    let mut direction = 0.0f64;

    for pair in tail.windows(2) {
        let minutes = (pair[1].timestamp - pair[0].timestamp).num_minutes();
        if minutes <= 0 || minutes > MAX_TOLERATED_GAP_MINUTES {
            return None;
        }
        if minutes > READING_CADENCE_MINUTES + 2 {
            gaps += 1;
            if gaps > 1 {
                return None;
            }
        }

        let per_step =
            (pair[1].value - pair[0].value) * READING_CADENCE_MINUTES as f64 / minutes as f64;
        if per_step.abs() < config.edge_delta_amount {
            return None;
        }
        if direction == 0.0 {
            direction = per_step.signum();
        } else if per_step.signum() != direction {
            return None;
        }
    }

    if direction > 0.0 {
        Some("Fast rise".to_string())
    } else {
        Some("Fast drop".to_string())
    }
}
