//! Device-level state derived from the current reading and the
//! device-status endpoint.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The device snapshot is refreshed on its own five-minute clock,
/// independent of the reading segments.
pub const SNAPSHOT_STALE_AFTER_MINUTES: i64 = 5;

/// Latest known device state, assembled from the current reading plus the
/// auxiliary device-status call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    /// Glucose concentration in mg/dL.
    pub glucose_value: f64,
    /// Change against the previous reading, mg/dL.
    pub delta: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub battery_percent: Option<u8>,
    #[serde(default)]
    pub insulin_on_board: Option<f64>,
    #[serde(default)]
    pub carbs_on_board: Option<f64>,
}

impl DeviceSnapshot {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.time
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > Duration::minutes(SNAPSHOT_STALE_AFTER_MINUTES)
    }
}

/// Raw payload of the device-status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    #[serde(default)]
    pub battery_percent: Option<u8>,
    #[serde(default)]
    pub insulin_on_board: Option<f64>,
    #[serde(default)]
    pub carbs_on_board: Option<f64>,
}

/// Site or hardware change events the server records as treatments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceEventKind {
    CannulaChange,
    SensorChange,
    PumpBatteryChange,
}

impl DeviceEventKind {
    pub const ALL: [DeviceEventKind; 3] = [
        DeviceEventKind::CannulaChange,
        DeviceEventKind::SensorChange,
        DeviceEventKind::PumpBatteryChange,
    ];

    /// How far back the remote lookup searches for the most recent event.
    pub fn default_days_back(&self) -> u32 {
        match self {
            DeviceEventKind::CannulaChange => 7,
            DeviceEventKind::SensorChange => 14,
            DeviceEventKind::PumpBatteryChange => 30,
        }
    }
}

/// An active or recently expired temporary glucose target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporaryTarget {
    pub target_top: f64,
    pub target_bottom: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub duration_minutes: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

impl TemporaryTarget {
    pub fn ends_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::minutes(self.duration_minutes)
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.created_at <= now && now < self.ends_at()
    }
}
