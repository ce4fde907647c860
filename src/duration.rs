//! Millisecond arithmetic for schedule times.
//!
//! Schedule times are stored as milliseconds since local midnight. Anything
//! that can cross midnight goes through these helpers so the wrap is handled
//! in one place.

use num::Integer;

pub const SECOND: i64 = 1_000;
pub const MINUTE: i64 = 60 * SECOND;
pub const HOUR: i64 = 60 * MINUTE;
pub const DAY: i64 = 24 * HOUR;

/// Folds any millisecond value into `[0, DAY)`.
pub fn normalise_to_day(millis: i64) -> i64 {
    millis.mod_floor(&DAY)
}

/// Duration between two times of day, assuming `end` is on the next day when
/// it is earlier than `start`.
pub fn calculate_duration(start: i64, end: i64) -> i64 {
    if end < start {
        end + DAY - start
    } else {
        end - start
    }
}

/// End time of day for a start and a duration.
pub fn end_from_duration(start: i64, duration: i64) -> i64 {
    normalise_to_day(start + duration)
}

/// Whether `time` falls inside the `[start, end)` window, treating windows
/// whose end is before their start as crossing midnight.
pub fn is_inside_window(time: i64, start: i64, end: i64) -> bool {
    if start == end {
        return false;
    }
    if start < end {
        time >= start && time < end
    } else {
        time >= start || time < end
    }
}

/// Milliseconds from `from` forward to the next occurrence of `to`.
pub fn forward_distance(from: i64, to: i64) -> i64 {
    normalise_to_day(to - from)
}

/// Formats a millisecond value as `[-]HH:MM:SS`.
pub fn format_clock(millis: i64) -> String {
    let sign = if millis < 0 { "-" } else { "" };
    let total_seconds = millis.abs() / SECOND;
    let (minutes, seconds) = total_seconds.div_rem(&60);
    let (hours, minutes) = minutes.div_rem(&60);
    format!("{sign}{hours:02}:{minutes:02}:{seconds:02}")
}
