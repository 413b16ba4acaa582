use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;

/// Bookkeeping for one cached segment: the value, when it was last
/// refreshed, and the zero-or-one refresh task currently running for it.
pub(crate) struct SegmentState<T> {
    pub value: T,
    pub fetched_at: Option<DateTime<Utc>>,
    pub inflight: Option<JoinHandle<()>>,
}

impl<T: Default> Default for SegmentState<T> {
    fn default() -> Self {
        Self {
            value: T::default(),
            fetched_at: None,
            inflight: None,
        }
    }
}

impl<T> SegmentState<T> {
    pub fn with_value(value: T) -> Self {
        Self {
            value,
            fetched_at: None,
            inflight: None,
        }
    }

    /// Drop the tracked handle once its task has finished.
    pub fn reap(&mut self) {
        if self
            .inflight
            .as_ref()
            .is_some_and(|handle| handle.is_finished())
        {
            self.inflight = None;
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.inflight
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, minutes: i64) -> bool {
        self.fetched_at
            .is_some_and(|at| now - at <= Duration::minutes(minutes))
    }
}
