//! Contract with the remote telemetry server.
//!
//! The cache issues one request per logical segment and consumes exactly one
//! resolution per request. Transport, authentication, and wire formats live
//! entirely behind the [`RemoteSource`] implementation supplied by the host.

use std::future::Future;
use std::pin::Pin;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use crate::models::{DeviceEventKind, DeviceStatus, Reading, TemporaryTarget};

/// A single-resolution fetch: the future completes exactly once, with either
/// a typed payload or an error.
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<FetchPayload>> + Send>>;

/// One request per logical segment kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchRequest {
    /// Readings since the start of the current local day.
    Today,
    /// Readings for the previous local day.
    Yesterday,
    /// The most recent reading only.
    Current,
    /// Pump/uploader status: battery, insulin and carbs on board.
    DeviceStatus,
    /// Timestamp of the most recent device event of the given kind.
    LastDeviceEvent { kind: DeviceEventKind, days_back: u32 },
    /// The most recent temporary target, if any was set.
    TemporaryTarget { days_back: u32 },
}

/// Typed response for a [`FetchRequest`].
#[derive(Debug, Clone)]
pub enum FetchPayload {
    Readings(Vec<Reading>),
    Reading(Option<Reading>),
    DeviceStatus(DeviceStatus),
    DeviceEvent(Option<DateTime<Utc>>),
    TemporaryTarget(Option<TemporaryTarget>),
}

impl FetchPayload {
    pub fn into_readings(self) -> Result<Vec<Reading>> {
        match self {
            FetchPayload::Readings(readings) => Ok(readings),
            other => bail!("expected a reading batch, got {other:?}"),
        }
    }

    pub fn into_reading(self) -> Result<Option<Reading>> {
        match self {
            FetchPayload::Reading(reading) => Ok(reading),
            other => bail!("expected a single reading, got {other:?}"),
        }
    }

    pub fn into_device_status(self) -> Result<DeviceStatus> {
        match self {
            FetchPayload::DeviceStatus(status) => Ok(status),
            other => bail!("expected a device status, got {other:?}"),
        }
    }

    pub fn into_device_event(self) -> Result<Option<DateTime<Utc>>> {
        match self {
            FetchPayload::DeviceEvent(event) => Ok(event),
            other => bail!("expected a device event, got {other:?}"),
        }
    }

    pub fn into_temporary_target(self) -> Result<Option<TemporaryTarget>> {
        match self {
            FetchPayload::TemporaryTarget(target) => Ok(target),
            other => bail!("expected a temporary target, got {other:?}"),
        }
    }
}

/// Asynchronous access to the remote telemetry server.
///
/// Implementations must be callable from any task; each call returns an
/// independent future that resolves exactly once.
pub trait RemoteSource: Send + Sync + 'static {
    fn fetch(&self, request: FetchRequest) -> FetchFuture;
}
