pub mod reading;
pub mod snapshot;
pub mod units;

pub use reading::{sort_ascending, PredictionPoint, Reading, TrendArrow};
pub use snapshot::{DeviceEventKind, DeviceSnapshot, DeviceStatus, TemporaryTarget};
pub use units::GlucoseUnit;
