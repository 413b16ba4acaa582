use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};

/// Source of "now" for staleness, day-boundary, and snooze checks.
///
/// Injected everywhere time is read so tests can simulate elapsed time
/// without real delays.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Start of the local calendar day containing `now()`, expressed in UTC.
    fn start_of_day(&self) -> DateTime<Utc>;

    /// The local calendar date of `now()`.
    fn today(&self) -> NaiveDate;

    fn yesterday(&self) -> NaiveDate {
        self.today().pred_opt().unwrap_or_else(|| self.today())
    }
}

/// Wall-clock time in the system local timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn start_of_day(&self) -> DateTime<Utc> {
        let midnight = Local::now().date_naive().and_time(NaiveTime::MIN);
        match Local.from_local_datetime(&midnight).earliest() {
            Some(start) => start.with_timezone(&Utc),
            // Midnight does not exist in this timezone today (DST edge);
            // fall back to treating the day as starting now.
            None => Utc::now(),
        }
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

#[cfg(test)]
pub use test_clock::ManualClock;
