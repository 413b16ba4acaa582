//! Reading cache: reconciles the Today, Yesterday, and Current segments
//! against the remote server.
//!
//! Every public operation returns the best-known value immediately and a
//! single-resolution channel that reports how the accompanying refresh
//! round ended. Refreshes are de-duplicated per segment, failures never
//! discard cached data, and each successful refresh is written through to
//! the store so a cold start can answer from the last known state.
//!
//! Operations are synchronous and non-blocking; the only suspension point
//! is the remote fetch inside the spawned refresh task. Callers must be on
//! a tokio runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Error};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::models::{
    self, DeviceEventKind, DeviceSnapshot, DeviceStatus, Reading, TemporaryTarget,
};
use crate::remote::{FetchPayload, FetchRequest, RemoteSource};
use crate::store::{self, ReadingStore, StoreKey};
use crate::{log_debug, log_info, log_warn};

mod segment;

use segment::SegmentState;

// Set to false to silence this module's logging
const ENABLE_LOGS: bool = true;

/// The current reading and the device snapshot are considered fresh for
/// this long; younger caches answer without a network round.
const CURRENT_STALE_AFTER_MINUTES: i64 = 5;

/// Lookback window for the temporary-target query.
const TEMPORARY_TARGET_DAYS_BACK: u32 = 1;

/// How a refresh round ended. Delivered exactly once per operation call.
#[derive(Debug)]
pub enum CacheUpdate<T> {
    /// The refresh succeeded and the cached value changed.
    Updated(T),
    /// The cached value was still fresh; no request was issued.
    Fresh,
    /// A refresh for this segment was already running; this call issued
    /// nothing and the running request remains the source of truth.
    InFlight,
    /// The response carried nothing newer than the cache.
    Superseded,
    /// The refresh failed; the cached value was left untouched.
    Failed(Error),
}

pub type UpdateReceiver<T> = oneshot::Receiver<CacheUpdate<T>>;

/// Yesterday's batch, stored with its timestamps already shifted forward by
/// one day so it overlays today's timeline. `day` records which calendar
/// day the shifted batch belongs to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct YesterdayBatch {
    #[serde(default)]
    day: Option<NaiveDate>,
    #[serde(default)]
    readings: Vec<Reading>,
}

struct CacheInner {
    remote: Arc<dyn RemoteSource>,
    store: Arc<dyn ReadingStore>,
    clock: Arc<dyn Clock>,
    current: Mutex<SegmentState<Option<Reading>>>,
    today: Mutex<SegmentState<Vec<Reading>>>,
    yesterday: Mutex<SegmentState<YesterdayBatch>>,
    device: Mutex<SegmentState<Option<DeviceSnapshot>>>,
    events: Mutex<HashMap<DeviceEventKind, SegmentState<Option<DateTime<Utc>>>>>,
    temp_target: Mutex<SegmentState<Option<TemporaryTarget>>>,
    /// Cancelled and replaced on reset so in-flight responses from the old
    /// server cannot repopulate a cleared cache.
    reset_token: Mutex<CancellationToken>,
}

/// The shared reading cache. Cheap to clone; all clones observe the same
/// segments.
#[derive(Clone)]
pub struct ReadingCache {
    inner: Arc<CacheInner>,
}

impl ReadingCache {
    /// Build a cache and warm every segment from the store. Persisted
    /// values answer immediately; their freshness clocks start expired, so
    /// the first access of each segment also refreshes it.
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        store: Arc<dyn ReadingStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let current =
            store::load_json::<Reading>(store.as_ref(), StoreKey::CurrentReading);
        let today = store::load_json::<Vec<Reading>>(store.as_ref(), StoreKey::TodayReadings)
            .unwrap_or_default();
        let yesterday =
            store::load_json::<YesterdayBatch>(store.as_ref(), StoreKey::YesterdayReadings)
                .unwrap_or_default();
        let device =
            store::load_json::<DeviceSnapshot>(store.as_ref(), StoreKey::DeviceSnapshot);
        let temp_target =
            store::load_json::<Option<TemporaryTarget>>(store.as_ref(), StoreKey::TemporaryTarget)
                .unwrap_or_default();

        let mut events = HashMap::new();
        for kind in DeviceEventKind::ALL {
            let value =
                store::load_json::<Option<DateTime<Utc>>>(store.as_ref(), event_key(kind))
                    .unwrap_or_default();
            events.insert(kind, SegmentState::with_value(value));
        }

        Self {
            inner: Arc::new(CacheInner {
                remote,
                store,
                clock,
                current: Mutex::new(SegmentState::with_value(current)),
                today: Mutex::new(SegmentState::with_value(today)),
                yesterday: Mutex::new(SegmentState::with_value(yesterday)),
                device: Mutex::new(SegmentState::with_value(device)),
                events: Mutex::new(events),
                temp_target: Mutex::new(SegmentState::with_value(temp_target)),
                reset_token: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Most recent reading. Refreshes when forced or when the cached value
    /// is older than five minutes; a response with an equal-or-older
    /// timestamp never overwrites the cache.
    pub fn current(&self, force_refresh: bool) -> (Option<Reading>, UpdateReceiver<Reading>) {
        let (tx, rx) = oneshot::channel();
        let inner = &self.inner;
        let now = inner.clock.now();

        let mut segment = lock(&inner.current);
        segment.reap();
        let cached = segment.value.clone();

        if !force_refresh && segment.is_fresh(now, CURRENT_STALE_AFTER_MINUTES) {
            let _ = tx.send(CacheUpdate::Fresh);
            return (cached, rx);
        }
        if segment.is_refreshing() {
            let _ = tx.send(CacheUpdate::InFlight);
            return (cached, rx);
        }

        log_info!("refreshing current reading (forced: {force_refresh})");
        let handle = spawn_refresh(inner, FetchRequest::Current, tx, |inner, payload, token| {
            match payload.into_reading() {
                Ok(Some(reading)) => inner.apply_current(reading, token),
                Ok(None) => CacheUpdate::Superseded,
                Err(err) => CacheUpdate::Failed(err),
            }
        });
        segment.inflight = Some(handle);

        (cached, rx)
    }

    /// Today's readings, pruned to the current local day before the refresh
    /// decision. A successful refresh replaces the whole segment with the
    /// server's authoritative window.
    pub fn today(&self) -> (Vec<Reading>, UpdateReceiver<Vec<Reading>>) {
        let (tx, rx) = oneshot::channel();
        let inner = &self.inner;
        let now = inner.clock.now();
        let day_start = inner.clock.start_of_day();

        // Segment locks are never nested: read Current before locking Today.
        let (current_reading, current_fresh) = {
            let current = lock(&inner.current);
            (
                current.value.clone(),
                current.is_fresh(now, CURRENT_STALE_AFTER_MINUTES),
            )
        };

        let mut segment = lock(&inner.today);
        segment.reap();
        prune_before(&mut segment.value, day_start);
        let cached = segment.value.clone();

        // Data that arrived via a side channel while this segment was not
        // being watched shows up as a Current newer than our last entry.
        let behind_current = match (&current_reading, cached.last()) {
            (Some(current), Some(last)) => current.timestamp > last.timestamp,
            _ => false,
        };
        let refresh_due = cached.is_empty() || !current_fresh || behind_current;

        if !refresh_due {
            let _ = tx.send(CacheUpdate::Fresh);
            return (cached, rx);
        }
        if segment.is_refreshing() {
            let _ = tx.send(CacheUpdate::InFlight);
            return (cached, rx);
        }

        log_info!("refreshing today segment ({} cached readings)", cached.len());
        let handle = spawn_refresh(inner, FetchRequest::Today, tx, |inner, payload, token| {
            match payload.into_readings() {
                Ok(readings) => inner.apply_today(readings, token),
                Err(err) => CacheUpdate::Failed(err),
            }
        });
        segment.inflight = Some(handle);

        (cached, rx)
    }

    /// Yesterday's readings, shifted forward one day so they overlay
    /// today's timeline. Invalidated when the calendar day changes.
    pub fn yesterday(&self) -> (Vec<Reading>, UpdateReceiver<Vec<Reading>>) {
        let (tx, rx) = oneshot::channel();
        let inner = &self.inner;

        let has_current = lock(&inner.current).value.is_some();

        let mut segment = lock(&inner.yesterday);
        segment.reap();
        let cached = segment.value.readings.clone();

        let overlays_today = segment.value.day == Some(inner.clock.today());
        let refresh_due = cached.is_empty() || !has_current || !overlays_today;

        if !refresh_due {
            let _ = tx.send(CacheUpdate::Fresh);
            return (cached, rx);
        }
        if segment.is_refreshing() {
            let _ = tx.send(CacheUpdate::InFlight);
            return (cached, rx);
        }

        log_info!("refreshing yesterday segment");
        let handle = spawn_refresh(inner, FetchRequest::Yesterday, tx, |inner, payload, token| {
            match payload.into_readings() {
                Ok(readings) => inner.apply_yesterday(readings, token),
                Err(err) => CacheUpdate::Failed(err),
            }
        });
        segment.inflight = Some(handle);

        (cached, rx)
    }

    /// Latest device snapshot, on its own five-minute staleness clock. The
    /// snapshot is assembled from the cached current reading plus the
    /// device-status endpoint.
    pub fn device_snapshot(
        &self,
    ) -> (Option<DeviceSnapshot>, UpdateReceiver<DeviceSnapshot>) {
        let (tx, rx) = oneshot::channel();
        let inner = &self.inner;
        let now = inner.clock.now();

        let mut segment = lock(&inner.device);
        segment.reap();
        let cached = segment.value.clone();

        if segment.is_fresh(now, CURRENT_STALE_AFTER_MINUTES) {
            let _ = tx.send(CacheUpdate::Fresh);
            return (cached, rx);
        }
        if segment.is_refreshing() {
            let _ = tx.send(CacheUpdate::InFlight);
            return (cached, rx);
        }

        log_debug!("refreshing device snapshot");
        let handle =
            spawn_refresh(inner, FetchRequest::DeviceStatus, tx, |inner, payload, token| {
                match payload.into_device_status() {
                    Ok(status) => inner.apply_device_status(status, token),
                    Err(err) => CacheUpdate::Failed(err),
                }
            });
        segment.inflight = Some(handle);

        (cached, rx)
    }

    /// Most recent device event of the given kind (cannula, sensor, or pump
    /// battery change). Answers with the persisted value and refreshes in
    /// the background; the persisted value is overwritten only on success.
    pub fn last_device_event(
        &self,
        kind: DeviceEventKind,
    ) -> (Option<DateTime<Utc>>, UpdateReceiver<Option<DateTime<Utc>>>) {
        let (tx, rx) = oneshot::channel();
        let inner = &self.inner;

        let mut events = lock(&inner.events);
        let segment = events.entry(kind).or_default();
        segment.reap();
        let cached = segment.value;

        if segment.is_refreshing() {
            let _ = tx.send(CacheUpdate::InFlight);
            return (cached, rx);
        }

        let request = FetchRequest::LastDeviceEvent {
            kind,
            days_back: kind.default_days_back(),
        };
        let handle = spawn_refresh(inner, request, tx, move |inner, payload, token| {
            match payload.into_device_event() {
                Ok(event) => inner.apply_device_event(kind, event, token),
                Err(err) => CacheUpdate::Failed(err),
            }
        });
        segment.inflight = Some(handle);

        (cached, rx)
    }

    /// Active or most recent temporary target. Same pattern as
    /// [`last_device_event`](Self::last_device_event): answer from the
    /// persisted value, refresh in the background.
    pub fn temporary_target(
        &self,
    ) -> (Option<TemporaryTarget>, UpdateReceiver<Option<TemporaryTarget>>) {
        let (tx, rx) = oneshot::channel();
        let inner = &self.inner;

        let mut segment = lock(&inner.temp_target);
        segment.reap();
        let cached = segment.value.clone();

        if segment.is_refreshing() {
            let _ = tx.send(CacheUpdate::InFlight);
            return (cached, rx);
        }

        let request = FetchRequest::TemporaryTarget {
            days_back: TEMPORARY_TARGET_DAYS_BACK,
        };
        let handle = spawn_refresh(inner, request, tx, |inner, payload, token| {
            match payload.into_temporary_target() {
                Ok(target) => inner.apply_temporary_target(target, token),
                Err(err) => CacheUpdate::Failed(err),
            }
        });
        segment.inflight = Some(handle);

        (cached, rx)
    }

    /// Clear every segment and its persisted copy, and cancel in-flight
    /// refreshes. Used when the remote server address changes: a late
    /// response from the old server must not repopulate the cache.
    pub fn reset(&self) {
        let inner = &self.inner;

        {
            let mut token = lock(&inner.reset_token);
            token.cancel();
            *token = CancellationToken::new();
        }

        *lock(&inner.current) = SegmentState::default();
        *lock(&inner.today) = SegmentState::default();
        *lock(&inner.yesterday) = SegmentState::default();
        *lock(&inner.device) = SegmentState::default();
        lock(&inner.events).clear();
        *lock(&inner.temp_target) = SegmentState::default();

        for key in StoreKey::ALL {
            inner.store.clear(key);
        }

        log_info!("cache reset; all segments and persisted copies cleared");
    }
}

/// Spawn one refresh task: fetch, convert, apply under the segment lock,
/// and resolve the caller's channel exactly once. A cancelled reset token
/// short-circuits the round without touching the cache.
fn spawn_refresh<T, A>(
    inner: &Arc<CacheInner>,
    request: FetchRequest,
    tx: oneshot::Sender<CacheUpdate<T>>,
    apply: A,
) -> JoinHandle<()>
where
    T: Send + 'static,
    A: FnOnce(&CacheInner, FetchPayload, &CancellationToken) -> CacheUpdate<T> + Send + 'static,
{
    let inner = Arc::clone(inner);
    let token = lock(&inner.reset_token).clone();

    tokio::spawn(async move {
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => reset_outcome(),
            result = inner.remote.fetch(request) => match result {
                Ok(payload) => apply(&inner, payload, &token),
                Err(err) => {
                    log_warn!("refresh of {request:?} failed: {err:#}");
                    CacheUpdate::Failed(err)
                }
            },
        };
        let _ = tx.send(outcome);
    })
}

impl CacheInner {
    fn apply_current(
        &self,
        reading: Reading,
        token: &CancellationToken,
    ) -> CacheUpdate<Reading> {
        let mut segment = lock(&self.current);
        if token.is_cancelled() {
            return reset_outcome();
        }
        let now = self.clock.now();

        if let Some(existing) = &segment.value {
            if reading.timestamp <= existing.timestamp {
                // Late or repeated response. Freshness still advances so
                // the next poll does not immediately re-fetch.
                segment.fetched_at = Some(now);
                return CacheUpdate::Superseded;
            }
        }

        segment.value = Some(reading.clone());
        segment.fetched_at = Some(now);
        drop(segment);

        store::store_json(self.store.as_ref(), StoreKey::CurrentReading, &reading);
        log_info!(
            "current reading now {} mg/dL at {}",
            reading.value,
            reading.timestamp
        );
        CacheUpdate::Updated(reading)
    }

    fn apply_today(
        &self,
        mut readings: Vec<Reading>,
        token: &CancellationToken,
    ) -> CacheUpdate<Vec<Reading>> {
        models::sort_ascending(&mut readings);
        prune_before(&mut readings, self.clock.start_of_day());

        let mut segment = lock(&self.today);
        if token.is_cancelled() {
            return reset_outcome();
        }
        // The server window is authoritative: replace, never append.
        segment.value = readings.clone();
        segment.fetched_at = Some(self.clock.now());
        drop(segment);

        store::store_json(self.store.as_ref(), StoreKey::TodayReadings, &readings);
        log_info!("today segment replaced with {} readings", readings.len());
        CacheUpdate::Updated(readings)
    }

    fn apply_yesterday(
        &self,
        mut readings: Vec<Reading>,
        token: &CancellationToken,
    ) -> CacheUpdate<Vec<Reading>> {
        models::sort_ascending(&mut readings);
        // Shift forward one day so the batch overlays today's timeline.
        for reading in &mut readings {
            reading.timestamp += Duration::days(1);
        }
        let batch = YesterdayBatch {
            day: Some(self.clock.today()),
            readings,
        };

        let mut segment = lock(&self.yesterday);
        if token.is_cancelled() {
            return reset_outcome();
        }
        segment.value = batch.clone();
        segment.fetched_at = Some(self.clock.now());
        drop(segment);

        store::store_json(self.store.as_ref(), StoreKey::YesterdayReadings, &batch);
        log_info!(
            "yesterday segment replaced with {} readings",
            batch.readings.len()
        );
        CacheUpdate::Updated(batch.readings)
    }

    fn apply_device_status(
        &self,
        status: DeviceStatus,
        token: &CancellationToken,
    ) -> CacheUpdate<DeviceSnapshot> {
        let current = lock(&self.current).value.clone();
        let Some(reading) = current else {
            return CacheUpdate::Failed(anyhow!(
                "no current reading cached to derive a device snapshot from"
            ));
        };

        let delta = {
            let today = lock(&self.today);
            delta_against_previous(&today.value, &reading)
        };

        let snapshot = DeviceSnapshot {
            glucose_value: reading.value,
            delta,
            time: reading.timestamp,
            battery_percent: status.battery_percent,
            insulin_on_board: status.insulin_on_board,
            carbs_on_board: status.carbs_on_board,
        };

        let mut segment = lock(&self.device);
        if token.is_cancelled() {
            return reset_outcome();
        }
        segment.value = Some(snapshot.clone());
        segment.fetched_at = Some(self.clock.now());
        drop(segment);

        store::store_json(self.store.as_ref(), StoreKey::DeviceSnapshot, &snapshot);
        CacheUpdate::Updated(snapshot)
    }

    fn apply_device_event(
        &self,
        kind: DeviceEventKind,
        event: Option<DateTime<Utc>>,
        token: &CancellationToken,
    ) -> CacheUpdate<Option<DateTime<Utc>>> {
        let mut events = lock(&self.events);
        if token.is_cancelled() {
            return reset_outcome();
        }
        let segment = events.entry(kind).or_default();
        segment.value = event;
        segment.fetched_at = Some(self.clock.now());
        drop(events);

        store::store_json(self.store.as_ref(), event_key(kind), &event);
        CacheUpdate::Updated(event)
    }

    fn apply_temporary_target(
        &self,
        target: Option<TemporaryTarget>,
        token: &CancellationToken,
    ) -> CacheUpdate<Option<TemporaryTarget>> {
        let mut segment = lock(&self.temp_target);
        if token.is_cancelled() {
            return reset_outcome();
        }
        segment.value = target.clone();
        segment.fetched_at = Some(self.clock.now());
        drop(segment);

        store::store_json(self.store.as_ref(), StoreKey::TemporaryTarget, &target);
        CacheUpdate::Updated(target)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reset_outcome<T>() -> CacheUpdate<T> {
    CacheUpdate::Failed(anyhow!("cache was reset while the refresh was running"))
}

fn prune_before(readings: &mut Vec<Reading>, day_start: DateTime<Utc>) {
    readings.retain(|reading| reading.timestamp >= day_start);
}

/// Change against the most recent earlier reading, or zero when none exists.
fn delta_against_previous(today: &[Reading], current: &Reading) -> f64 {
    today
        .iter()
        .rev()
        .find(|reading| reading.timestamp < current.timestamp)
        .map(|previous| current.value - previous.value)
        .unwrap_or(0.0)
}

fn event_key(kind: DeviceEventKind) -> StoreKey {
    match kind {
        DeviceEventKind::CannulaChange => StoreKey::CannulaChange,
        DeviceEventKind::SensorChange => StoreKey::SensorChange,
        DeviceEventKind::PumpBatteryChange => StoreKey::PumpBatteryChange,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use anyhow::Result;
    use chrono::TimeZone;

    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    use super::*;

    struct FakeRemote {
        calls: StdMutex<Vec<FetchRequest>>,
        responses: StdMutex<HashMap<FetchRequest, VecDeque<Result<FetchPayload>>>>,
    }

    impl FakeRemote {
        fn new() -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                responses: StdMutex::new(HashMap::new()),
            }
        }

        fn script(&self, request: FetchRequest, response: Result<FetchPayload>) {
            self.responses
                .lock()
                .unwrap()
                .entry(request)
                .or_default()
                .push_back(response);
        }

        fn call_count(&self, request: FetchRequest) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|made| **made == request)
                .count()
        }
    }

    impl RemoteSource for FakeRemote {
        fn fetch(&self, request: FetchRequest) -> crate::remote::FetchFuture {
            self.calls.lock().unwrap().push(request);
            let response = self
                .responses
                .lock()
                .unwrap()
                .get_mut(&request)
                .and_then(|queue| queue.pop_front());

            Box::pin(async move {
                match response {
                    Some(response) => response,
                    None => Err(anyhow!("no scripted response for {request:?}")),
                }
            })
        }
    }

    struct Harness {
        remote: Arc<FakeRemote>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        cache: ReadingCache,
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        harness_with_store(Arc::new(MemoryStore::new()))
    }

    fn harness_with_store(store: Arc<MemoryStore>) -> Harness {
        let remote = Arc::new(FakeRemote::new());
        let clock = Arc::new(ManualClock::at(noon()));
        let cache = ReadingCache::new(remote.clone(), store.clone(), clock.clone());
        Harness {
            remote,
            store,
            clock,
            cache,
        }
    }

    fn reading_at(value: f64, hour: u32, minute: u32) -> Reading {
        Reading::new(
            value,
            Utc.with_ymd_and_hms(2024, 3, 5, hour, minute, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn overlapping_today_calls_issue_one_request() {
        let h = harness();
        h.remote.script(
            FetchRequest::Today,
            Ok(FetchPayload::Readings(vec![reading_at(120.0, 11, 55)])),
        );

        let (_, first) = h.cache.today();
        let (_, second) = h.cache.today();

        assert!(matches!(second.await.unwrap(), CacheUpdate::InFlight));
        let updated = match first.await.unwrap() {
            CacheUpdate::Updated(readings) => readings,
            other => panic!("expected Updated, got {other:?}"),
        };
        assert_eq!(updated.len(), 1);
        assert_eq!(h.remote.call_count(FetchRequest::Today), 1);
    }

    #[tokio::test]
    async fn older_current_response_never_overwrites() {
        let h = harness();
        let newer = reading_at(130.0, 11, 58);
        let older = reading_at(120.0, 11, 50);
        h.remote
            .script(FetchRequest::Current, Ok(FetchPayload::Reading(Some(newer.clone()))));
        h.remote
            .script(FetchRequest::Current, Ok(FetchPayload::Reading(Some(older))));

        let (_, rx) = h.cache.current(true);
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Updated(_)));

        let (_, rx) = h.cache.current(true);
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Superseded));

        let (cached, rx) = h.cache.current(false);
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Fresh));
        assert_eq!(cached, Some(newer));
    }

    #[tokio::test]
    async fn current_honors_five_minute_staleness() {
        let h = harness();
        h.remote.script(
            FetchRequest::Current,
            Ok(FetchPayload::Reading(Some(reading_at(120.0, 11, 58)))),
        );
        h.remote.script(
            FetchRequest::Current,
            Ok(FetchPayload::Reading(Some(reading_at(125.0, 12, 5)))),
        );

        let (_, rx) = h.cache.current(false);
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Updated(_)));
        assert_eq!(h.remote.call_count(FetchRequest::Current), 1);

        h.clock.advance_minutes(2);
        let (_, rx) = h.cache.current(false);
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Fresh));
        assert_eq!(h.remote.call_count(FetchRequest::Current), 1);

        h.clock.advance_minutes(4);
        let (_, rx) = h.cache.current(false);
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Updated(_)));
        assert_eq!(h.remote.call_count(FetchRequest::Current), 2);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_value() {
        let h = harness();
        let reading = reading_at(120.0, 11, 58);
        h.remote.script(
            FetchRequest::Current,
            Ok(FetchPayload::Reading(Some(reading.clone()))),
        );
        h.remote
            .script(FetchRequest::Current, Err(anyhow!("server unreachable")));

        let (_, rx) = h.cache.current(true);
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Updated(_)));

        let (cached, rx) = h.cache.current(true);
        assert_eq!(cached, Some(reading.clone()));
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Failed(_)));

        // The cache still answers with the last good value.
        let (cached, _) = h.cache.current(false);
        assert_eq!(cached, Some(reading));
    }

    #[tokio::test]
    async fn yesterday_batch_is_shifted_one_day_forward() {
        let h = harness();
        let fetched = reading_at(110.0, 9, 30);
        let original = fetched.timestamp;
        h.remote.script(
            FetchRequest::Yesterday,
            Ok(FetchPayload::Readings(vec![fetched])),
        );

        let (_, rx) = h.cache.yesterday();
        let shifted = match rx.await.unwrap() {
            CacheUpdate::Updated(readings) => readings,
            other => panic!("expected Updated, got {other:?}"),
        };

        assert_eq!(
            (shifted[0].timestamp - original).num_milliseconds(),
            86_400_000
        );
    }

    #[tokio::test]
    async fn yesterday_invalidated_when_day_changes() {
        let h = harness();
        // A cached current reading keeps the no-current trigger quiet.
        h.remote.script(
            FetchRequest::Current,
            Ok(FetchPayload::Reading(Some(reading_at(120.0, 11, 58)))),
        );
        let (_, rx) = h.cache.current(true);
        rx.await.unwrap();

        h.remote.script(
            FetchRequest::Yesterday,
            Ok(FetchPayload::Readings(vec![reading_at(110.0, 9, 30)])),
        );
        let (_, rx) = h.cache.yesterday();
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Updated(_)));

        // Same day: cached batch is good.
        let (_, rx) = h.cache.yesterday();
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Fresh));
        assert_eq!(h.remote.call_count(FetchRequest::Yesterday), 1);

        // Next day: the stored batch no longer overlays today.
        h.clock.advance_minutes(24 * 60);
        h.remote.script(
            FetchRequest::Yesterday,
            Ok(FetchPayload::Readings(vec![reading_at(115.0, 10, 0)])),
        );
        let (_, rx) = h.cache.yesterday();
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Updated(_)));
        assert_eq!(h.remote.call_count(FetchRequest::Yesterday), 2);
    }

    #[tokio::test]
    async fn today_refresh_prunes_readings_before_midnight() {
        let h = harness();
        let before_midnight = Reading::new(
            140.0,
            Utc.with_ymd_and_hms(2024, 3, 4, 23, 50, 0).unwrap(),
        );
        h.remote.script(
            FetchRequest::Today,
            Ok(FetchPayload::Readings(vec![
                before_midnight,
                reading_at(118.0, 0, 10),
                reading_at(122.0, 11, 0),
            ])),
        );

        let (_, rx) = h.cache.today();
        let readings = match rx.await.unwrap() {
            CacheUpdate::Updated(readings) => readings,
            other => panic!("expected Updated, got {other:?}"),
        };

        assert_eq!(readings.len(), 2);
        assert!(readings
            .iter()
            .all(|reading| reading.timestamp >= h.clock.start_of_day()));
    }

    #[tokio::test]
    async fn persisted_today_is_pruned_on_access() {
        let store = Arc::new(MemoryStore::new());
        let stale = vec![
            Reading::new(140.0, Utc.with_ymd_and_hms(2024, 3, 4, 23, 50, 0).unwrap()),
            reading_at(118.0, 0, 10),
        ];
        store::store_json(store.as_ref(), StoreKey::TodayReadings, &stale);

        let h = harness_with_store(store);
        let (cached, _rx) = h.cache.today();

        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].value, 118.0);
    }

    #[tokio::test]
    async fn current_newer_than_today_forces_refresh() {
        let h = harness();
        h.remote.script(
            FetchRequest::Current,
            Ok(FetchPayload::Reading(Some(reading_at(125.0, 11, 58)))),
        );
        let (_, rx) = h.cache.current(true);
        rx.await.unwrap();

        // First fill: the segment is empty.
        h.remote.script(
            FetchRequest::Today,
            Ok(FetchPayload::Readings(vec![
                reading_at(115.0, 11, 30),
                reading_at(120.0, 11, 50),
            ])),
        );
        let (_, rx) = h.cache.today();
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Updated(_)));

        // The current reading (11:58) is newer than the last entry (11:50),
        // so the next call refreshes again.
        h.remote.script(
            FetchRequest::Today,
            Ok(FetchPayload::Readings(vec![
                reading_at(115.0, 11, 30),
                reading_at(120.0, 11, 50),
                reading_at(125.0, 11, 58),
            ])),
        );
        let (_, rx) = h.cache.today();
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Updated(_)));
        assert_eq!(h.remote.call_count(FetchRequest::Today), 2);

        // Now the segment has caught up; no further request.
        let (_, rx) = h.cache.today();
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Fresh));
        assert_eq!(h.remote.call_count(FetchRequest::Today), 2);
    }

    #[tokio::test]
    async fn reset_clears_segments_store_and_inflight_work() {
        let h = harness();
        h.remote.script(
            FetchRequest::Current,
            Ok(FetchPayload::Reading(Some(reading_at(120.0, 11, 58)))),
        );
        let (_, rx) = h.cache.current(true);
        rx.await.unwrap();
        assert!(h.store.load(StoreKey::CurrentReading).is_some());

        // Leave a refresh in flight, then reset underneath it.
        h.remote.script(
            FetchRequest::Today,
            Ok(FetchPayload::Readings(vec![reading_at(120.0, 11, 58)])),
        );
        let (_, inflight) = h.cache.today();
        h.cache.reset();

        assert!(matches!(inflight.await.unwrap(), CacheUpdate::Failed(_)));
        let (cached, _rx) = h.cache.current(false);
        assert!(cached.is_none());
        for key in StoreKey::ALL {
            assert!(h.store.load(key).is_none(), "{key:?} not cleared");
        }
        let (today, _rx) = h.cache.today();
        assert!(today.is_empty());
    }

    #[tokio::test]
    async fn device_snapshot_combines_current_and_status() {
        let h = harness();
        h.remote.script(
            FetchRequest::Current,
            Ok(FetchPayload::Reading(Some(reading_at(130.0, 11, 58)))),
        );
        let (_, rx) = h.cache.current(true);
        rx.await.unwrap();

        h.remote.script(
            FetchRequest::Today,
            Ok(FetchPayload::Readings(vec![
                reading_at(124.0, 11, 53),
                reading_at(130.0, 11, 58),
            ])),
        );
        let (_, rx) = h.cache.today();
        rx.await.unwrap();

        h.remote.script(
            FetchRequest::DeviceStatus,
            Ok(FetchPayload::DeviceStatus(DeviceStatus {
                battery_percent: Some(42),
                insulin_on_board: Some(1.5),
                carbs_on_board: Some(20.0),
            })),
        );
        let (_, rx) = h.cache.device_snapshot();
        let snapshot = match rx.await.unwrap() {
            CacheUpdate::Updated(snapshot) => snapshot,
            other => panic!("expected Updated, got {other:?}"),
        };

        assert_eq!(snapshot.glucose_value, 130.0);
        assert_eq!(snapshot.delta, 6.0);
        assert_eq!(snapshot.battery_percent, Some(42));
        assert_eq!(snapshot.time, reading_at(130.0, 11, 58).timestamp);

        // Within the staleness window the snapshot answers without a fetch.
        let (cached, rx) = h.cache.device_snapshot();
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Fresh));
        assert_eq!(cached, Some(snapshot));
        assert_eq!(h.remote.call_count(FetchRequest::DeviceStatus), 1);
    }

    #[tokio::test]
    async fn device_event_answers_persisted_value_then_refreshes() {
        let changed_at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let store = Arc::new(MemoryStore::new());
        store::store_json(
            store.as_ref(),
            StoreKey::CannulaChange,
            &Some(changed_at),
        );

        let h = harness_with_store(store);
        let request = FetchRequest::LastDeviceEvent {
            kind: DeviceEventKind::CannulaChange,
            days_back: DeviceEventKind::CannulaChange.default_days_back(),
        };
        let newer = Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap();
        h.remote
            .script(request, Ok(FetchPayload::DeviceEvent(Some(newer))));

        let (cached, rx) = h.cache.last_device_event(DeviceEventKind::CannulaChange);
        assert_eq!(cached, Some(changed_at));

        match rx.await.unwrap() {
            CacheUpdate::Updated(event) => assert_eq!(event, Some(newer)),
            other => panic!("expected Updated, got {other:?}"),
        }

        // A failed background refresh leaves the last good value in place.
        let (cached, rx) = h.cache.last_device_event(DeviceEventKind::CannulaChange);
        assert_eq!(cached, Some(newer));
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Failed(_)));
        let (cached, _rx) = h.cache.last_device_event(DeviceEventKind::CannulaChange);
        assert_eq!(cached, Some(newer));
    }

    #[tokio::test]
    async fn temporary_target_refreshes_in_background() {
        let h = harness();
        let target = TemporaryTarget {
            target_top: 140.0,
            target_bottom: 100.0,
            created_at: noon() - Duration::minutes(30),
            duration_minutes: 60,
            reason: Some("sport".into()),
        };
        h.remote.script(
            FetchRequest::TemporaryTarget {
                days_back: TEMPORARY_TARGET_DAYS_BACK,
            },
            Ok(FetchPayload::TemporaryTarget(Some(target.clone()))),
        );

        let (cached, rx) = h.cache.temporary_target();
        assert!(cached.is_none());

        match rx.await.unwrap() {
            CacheUpdate::Updated(Some(updated)) => {
                assert_eq!(updated, target);
                assert!(updated.is_active(h.clock.now()));
            }
            other => panic!("expected Updated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cold_start_answers_from_store() {
        let store = Arc::new(MemoryStore::new());
        let persisted = reading_at(126.0, 11, 45);
        store::store_json(store.as_ref(), StoreKey::CurrentReading, &persisted);

        let h = harness_with_store(store);
        h.remote.script(
            FetchRequest::Current,
            Ok(FetchPayload::Reading(Some(reading_at(131.0, 11, 58)))),
        );

        // The persisted value answers immediately; freshness starts expired
        // so a refresh still goes out.
        let (cached, rx) = h.cache.current(false);
        assert_eq!(cached, Some(persisted));
        assert!(matches!(rx.await.unwrap(), CacheUpdate::Updated(_)));
    }
}
