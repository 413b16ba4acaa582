//! Companion-client core for a remote glucose-telemetry server.
//!
//! Three components do the real work:
//!
//! - [`cache::ReadingCache`] keeps the Today, Yesterday, and Current reading
//!   segments reconciled against the remote server, with per-segment request
//!   de-duplication, staleness policy, and write-through persistence.
//! - [`predict`] extrapolates the recent trend into the next hour and
//!   answers "when will a threshold be crossed".
//! - [`alarm::AlarmEngine`] turns cached and predicted data plus the user's
//!   thresholds into at most one active alarm reason per evaluation.
//!
//! Everything else (rendering, notification delivery, transport) belongs
//! to the host application. The host supplies a [`remote::RemoteSource`]
//! and a [`store::ReadingStore`] and polls the cache from its own
//! scheduling loop; background wake-ups may call into the same cache
//! without coordination.

pub mod alarm;
pub mod cache;
pub mod clock;
pub mod models;
pub mod predict;
pub mod remote;
pub mod store;
pub mod utils;

pub use alarm::{AlarmConfig, AlarmEngine, AlarmState, ConfigStore};
pub use cache::{CacheUpdate, ReadingCache, UpdateReceiver};
pub use clock::{Clock, SystemClock};
pub use models::{
    DeviceEventKind, DeviceSnapshot, DeviceStatus, GlucoseUnit, PredictionPoint, Reading,
    TemporaryTarget, TrendArrow,
};
pub use remote::{FetchPayload, FetchRequest, RemoteSource};
pub use store::{MemoryStore, ReadingStore, SqliteStore, StoreKey};

/// Opt-in logger setup for hosts and examples (reads `RUST_LOG`).
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}
