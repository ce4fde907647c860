//! Wall-clock sources.
//!
//! Everything downstream reads time through [`ClockSource`] and converts with
//! [`ClockSource::to_time_of_day`] / [`ClockSource::to_instant`], so daylight
//! saving transitions are absorbed by the zone conversion rather than by
//! duration arithmetic.

use std::sync::Mutex;

use jiff::{
    SignedDuration, Span, Timestamp,
    civil::{Date, DateTime, Time},
    tz::{AmbiguousOffset, TimeZone},
};

use crate::duration::{HOUR, MINUTE, SECOND, normalise_to_day};

pub trait ClockSource: Send + Sync {
    /// Current instant, millisecond precision.
    fn now(&self) -> Timestamp;

    /// Zone used for all time-of-day conversions.
    fn time_zone(&self) -> &TimeZone;

    /// Milliseconds since local midnight for `instant`, in `[0, DAY)`.
    fn to_time_of_day(&self, instant: Timestamp) -> i64 {
        time_of_day(self.time_zone().to_datetime(instant))
    }

    /// Instant at `time_of_day` on the local calendar day containing
    /// `reference`. Repeated wall times during a fall-back transition resolve
    /// to the side matching `reference`'s offset.
    fn to_instant(&self, time_of_day: i64, reference: Timestamp) -> Timestamp {
        let date = self.time_zone().to_datetime(reference).date();
        resolve_on_date(self.time_zone(), date, time_of_day, reference)
    }

    /// Occurrence of `time_of_day` closest to `reference`, looking at the
    /// previous, same and next calendar day.
    fn nearest_instant(&self, time_of_day: i64, reference: Timestamp) -> Timestamp {
        let date = self.time_zone().to_datetime(reference).date();
        [-1, 0, 1]
            .into_iter()
            .map(|days| {
                resolve_on_date(self.time_zone(), add_days(date, days), time_of_day, reference)
            })
            .min_by_key(|candidate| (candidate.as_millisecond() - reference.as_millisecond()).abs())
            .unwrap_or(reference)
    }

    /// First occurrence of `time_of_day` at or after `reference`.
    fn next_instant(&self, time_of_day: i64, reference: Timestamp) -> Timestamp {
        let candidate = self.to_instant(time_of_day, reference);
        if candidate >= reference {
            return candidate;
        }
        let date = add_days(self.time_zone().to_datetime(reference).date(), 1);
        resolve_on_date(self.time_zone(), date, time_of_day, reference)
    }

    /// Last occurrence of `time_of_day` at or before `reference`.
    fn previous_instant(&self, time_of_day: i64, reference: Timestamp) -> Timestamp {
        let candidate = self.to_instant(time_of_day, reference);
        if candidate <= reference {
            return candidate;
        }
        let date = add_days(self.time_zone().to_datetime(reference).date(), -1);
        resolve_on_date(self.time_zone(), date, time_of_day, reference)
    }

    /// Local noon `days` calendar days after the day containing `reference`.
    fn shift_days(&self, reference: Timestamp, days: i64) -> Timestamp {
        let date = add_days(self.time_zone().to_datetime(reference).date(), days);
        resolve_on_date(self.time_zone(), date, 12 * HOUR, reference)
    }

    /// Calendar days from the local day of `from` to the local day of `to`.
    fn days_between(&self, from: Timestamp, to: Timestamp) -> i64 {
        let from = self.time_zone().to_datetime(from).date();
        let to = self.time_zone().to_datetime(to).date();
        from.until(to)
            .map(|span| i64::from(span.get_days()))
            .unwrap_or_default()
    }
}

fn time_of_day(datetime: DateTime) -> i64 {
    let time = datetime.time();
    i64::from(time.hour()) * HOUR
        + i64::from(time.minute()) * MINUTE
        + i64::from(time.second()) * SECOND
        + i64::from(time.millisecond())
}

fn civil_time(time_of_day: i64) -> Time {
    let millis = normalise_to_day(time_of_day);
    let hour = (millis / HOUR) as i8;
    let minute = ((millis % HOUR) / MINUTE) as i8;
    let second = ((millis % MINUTE) / SECOND) as i8;
    let nanos = ((millis % SECOND) * 1_000_000) as i32;
    Time::new(hour, minute, second, nanos).unwrap_or(Time::midnight())
}

fn add_days(date: Date, days: i64) -> Date {
    Span::new()
        .try_days(days)
        .and_then(|span| date.checked_add(span))
        .unwrap_or(date)
}

fn resolve_on_date(tz: &TimeZone, date: Date, time_of_day: i64, reference: Timestamp) -> Timestamp {
    let datetime = date.to_datetime(civil_time(time_of_day));
    let ambiguous = tz.to_ambiguous_timestamp(datetime);
    let resolved = match ambiguous.offset() {
        AmbiguousOffset::Fold { before, after } => {
            let offset = if tz.to_offset(reference) == after {
                after
            } else {
                before
            };
            offset.to_timestamp(datetime)
        }
        _ => ambiguous.compatible(),
    };
    resolved.unwrap_or(reference)
}

/// Drops sub-millisecond precision.
pub fn truncate_to_millis(instant: Timestamp) -> Timestamp {
    Timestamp::from_millisecond(instant.as_millisecond()).unwrap_or(instant)
}

/// Instant shifted by a signed number of milliseconds.
pub fn shift(instant: Timestamp, millis: i64) -> Timestamp {
    instant
        .checked_add(SignedDuration::from_millis(millis))
        .unwrap_or(instant)
}

/// Signed milliseconds from `from` to `to`.
pub fn millis_between(from: Timestamp, to: Timestamp) -> i64 {
    to.as_millisecond() - from.as_millisecond()
}

/// The host's clock in a fixed zone.
#[derive(Debug, Clone)]
pub struct SystemClock {
    tz: TimeZone,
}

impl SystemClock {
    pub fn new(tz: TimeZone) -> Self {
        Self { tz }
    }

    pub fn system() -> Self {
        Self::new(TimeZone::system())
    }
}

impl ClockSource for SystemClock {
    fn now(&self) -> Timestamp {
        truncate_to_millis(Timestamp::now())
    }

    fn time_zone(&self) -> &TimeZone {
        &self.tz
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    tz: TimeZone,
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(tz: TimeZone, now: Timestamp) -> Self {
        Self {
            tz,
            now: Mutex::new(truncate_to_millis(now)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = truncate_to_millis(now);
    }

    pub fn advance(&self, millis: i64) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = shift(*now, millis);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn time_zone(&self) -> &TimeZone {
        &self.tz
    }
}
