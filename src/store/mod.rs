//! Durable key/value persistence for reading batches and scalar snapshots.
//!
//! The cache treats storage as best-effort: a missing or undecodable value
//! reads as "nothing persisted", and write failures are logged rather than
//! surfaced. Payloads are versioned JSON so older snapshots decode with
//! defaulted fields and snapshots from a newer schema are ignored.

use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

mod sqlite;

pub use sqlite::SqliteStore;

/// Version stamped onto every persisted payload.
pub const SCHEMA_VERSION: u32 = 1;

/// Persisted slots, one per cached segment or scalar snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    TodayReadings,
    YesterdayReadings,
    CurrentReading,
    DeviceSnapshot,
    CannulaChange,
    SensorChange,
    PumpBatteryChange,
    TemporaryTarget,
}

impl StoreKey {
    pub const ALL: [StoreKey; 8] = [
        StoreKey::TodayReadings,
        StoreKey::YesterdayReadings,
        StoreKey::CurrentReading,
        StoreKey::DeviceSnapshot,
        StoreKey::CannulaChange,
        StoreKey::SensorChange,
        StoreKey::PumpBatteryChange,
        StoreKey::TemporaryTarget,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKey::TodayReadings => "today_readings",
            StoreKey::YesterdayReadings => "yesterday_readings",
            StoreKey::CurrentReading => "current_reading",
            StoreKey::DeviceSnapshot => "device_snapshot",
            StoreKey::CannulaChange => "cannula_change",
            StoreKey::SensorChange => "sensor_change",
            StoreKey::PumpBatteryChange => "pump_battery_change",
            StoreKey::TemporaryTarget => "temporary_target",
        }
    }
}

/// Synchronous, best-effort key/value persistence.
///
/// Absence of a value is not an error. Implementations must be safe to call
/// from any thread.
pub trait ReadingStore: Send + Sync + 'static {
    fn load(&self, key: StoreKey) -> Option<String>;
    fn store(&self, key: StoreKey, payload: &str);
    fn clear(&self, key: StoreKey);
}

#[derive(Debug, Serialize, Deserialize)]
struct Versioned<T> {
    version: u32,
    payload: T,
}

/// Decode a persisted payload; decode failures and newer-schema payloads
/// read as "nothing persisted".
pub fn load_json<T: DeserializeOwned>(store: &dyn ReadingStore, key: StoreKey) -> Option<T> {
    let raw = store.load(key)?;
    match serde_json::from_str::<Versioned<T>>(&raw) {
        Ok(versioned) if versioned.version <= SCHEMA_VERSION => Some(versioned.payload),
        Ok(versioned) => {
            warn!(
                "persisted {} was written by schema v{}, newer than v{}; ignoring",
                key.as_str(),
                versioned.version,
                SCHEMA_VERSION
            );
            None
        }
        Err(err) => {
            warn!("failed to decode persisted {}: {err}", key.as_str());
            None
        }
    }
}

/// Encode and persist a payload under the current schema version.
pub fn store_json<T: Serialize>(store: &dyn ReadingStore, key: StoreKey, payload: &T) {
    let versioned = Versioned {
        version: SCHEMA_VERSION,
        payload,
    };
    match serde_json::to_string(&versioned) {
        Ok(json) => store.store(key, &json),
        Err(err) => warn!("failed to encode {} for persistence: {err}", key.as_str()),
    }
}

/// In-memory store for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<StoreKey, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReadingStore for MemoryStore {
    fn load(&self, key: StoreKey) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    fn store(&self, key: StoreKey, payload: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, payload.to_string());
    }

    fn clear(&self, key: StoreKey) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use crate::models::Reading;
    use chrono::{TimeZone, Utc};

    use super::*;

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        let reading = Reading::new(
            120.0,
            Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap(),
        );

        store_json(&store, StoreKey::CurrentReading, &reading);
        let loaded: Reading = load_json(&store, StoreKey::CurrentReading).unwrap();
        assert_eq!(loaded, reading);

        store.clear(StoreKey::CurrentReading);
        assert!(load_json::<Reading>(&store, StoreKey::CurrentReading).is_none());
    }

    #[test]
    fn undecodable_payload_reads_as_absent() {
        let store = MemoryStore::new();
        store.store(StoreKey::TodayReadings, "not json at all");
        assert!(load_json::<Vec<Reading>>(&store, StoreKey::TodayReadings).is_none());
    }

    #[test]
    fn newer_schema_reads_as_absent() {
        let store = MemoryStore::new();
        store.store(
            StoreKey::CurrentReading,
            r#"{"version": 99, "payload": {"value": 1.0, "timestamp": 0}}"#,
        );
        assert!(load_json::<Reading>(&store, StoreKey::CurrentReading).is_none());
    }
}
