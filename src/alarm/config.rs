//! User-settable alarm thresholds and the JSON-file store that persists
//! them.
//!
//! The engine only ever reads this configuration; the host UI mutates it.
//! Every field has a default so alarms work before any user configuration
//! exists.

use std::{fs, path::PathBuf, sync::RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlarmConfig {
    /// Master switch; true suppresses every alarm, including missed
    /// readings.
    pub disabled: bool,

    /// Upper glucose bound in mg/dL.
    pub upper_bound: f64,
    /// Lower glucose bound in mg/dL.
    pub lower_bound: f64,

    /// Alarm when no reading has arrived for this many minutes.
    pub no_data_alarm_after_minutes: i64,

    /// Alarm on consistently fast rise or drop across recent readings.
    pub edge_detection_enabled: bool,
    /// Per-reading delta (mg/dL per five-minute step) that counts as fast.
    pub edge_delta_amount: f64,
    /// How many consecutive deltas must exceed the amount.
    pub edge_consecutive_readings: usize,

    /// Replace the plain high alert with a sustained-high alert.
    pub persistent_high_enabled: bool,
    /// Minutes the value must stay above the upper bound before alarming.
    pub persistent_high_minutes: i64,
    /// Ceiling that alarms immediately, bypassing the duration wait.
    pub persistent_high_urgent_bound: f64,

    /// Alarm when a low is predicted within the horizon below.
    pub low_prediction_enabled: bool,
    /// Prediction horizon in minutes.
    pub low_prediction_minutes: i64,

    /// Alarms are suppressed until this instant.
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub snooze_until: Option<DateTime<Utc>>,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            upper_bound: 180.0,
            lower_bound: 80.0,
            no_data_alarm_after_minutes: 15,
            edge_detection_enabled: false,
            edge_delta_amount: 8.0,
            edge_consecutive_readings: 3,
            persistent_high_enabled: false,
            persistent_high_minutes: 30,
            persistent_high_urgent_bound: 250.0,
            low_prediction_enabled: false,
            low_prediction_minutes: 15,
            snooze_until: None,
        }
    }
}

impl AlarmConfig {
    pub fn is_snoozed(&self, now: DateTime<Utc>) -> bool {
        self.snooze_until.is_some_and(|until| now < until)
    }

    /// Whole minutes of snooze left, rounded up; zero when not snoozed.
    pub fn remaining_snooze_minutes(&self, now: DateTime<Utc>) -> i64 {
        match self.snooze_until {
            Some(until) if now < until => {
                let seconds = (until - now).num_seconds();
                (seconds + 59) / 60
            }
            _ => 0,
        }
    }

    pub fn snooze_for_minutes(&mut self, minutes: i64, now: DateTime<Utc>) {
        self.snooze_until = Some(now + Duration::minutes(minutes));
    }

    pub fn clear_snooze(&mut self) {
        self.snooze_until = None;
    }
}

/// Persisted alarm configuration, one JSON file.
///
/// A missing or unreadable file yields the defaults rather than an error.
pub struct ConfigStore {
    path: PathBuf,
    data: RwLock<AlarmConfig>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read alarm config from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            AlarmConfig::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn alarm_config(&self) -> AlarmConfig {
        self.data.read().unwrap().clone()
    }

    pub fn update(&self, config: AlarmConfig) -> Result<()> {
        {
            let mut guard = self.data.write().unwrap();
            *guard = config;
            self.persist(&guard)?;
        }
        Ok(())
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)?;
        let data: AlarmConfig = serde_json::from_str(&contents)?;
        let mut guard = self.data.write().unwrap();
        *guard = data;
        Ok(())
    }

    fn persist(&self, data: &AlarmConfig) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write alarm config to {}", self.path.display()))
    }
}
