//! Timer state and the arithmetic behind it.
//!
//! All functions are pure over instants so they can be checked without a
//! running clock.

use std::{fmt, str::FromStr};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::{
    clock::{millis_between, shift},
    duration::DAY,
};

/// Largest amount of time, either way, that may be added to a timer.
pub const MAX_ADDED_TIME: i64 = 7 * DAY;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Playback {
    #[default]
    Stop,
    Armed,
    Play,
    Pause,
    Roll,
}

impl Playback {
    pub fn as_str(self) -> &'static str {
        match self {
            Playback::Stop => "stop",
            Playback::Armed => "armed",
            Playback::Play => "play",
            Playback::Pause => "pause",
            Playback::Roll => "roll",
        }
    }
}

impl fmt::Display for Playback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Playback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(Playback::Stop),
            "armed" => Ok(Playback::Armed),
            "play" => Ok(Playback::Play),
            "pause" => Ok(Playback::Pause),
            "roll" => Ok(Playback::Roll),
            other => Err(other.to_owned()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub playback: Playback,
    /// Time left, negative once overtime.
    pub current: Option<i64>,
    pub elapsed: Option<i64>,
    pub duration: Option<i64>,
    pub added_time: i64,
    pub started_at: Option<Timestamp>,
    pub paused_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub expected_finish: Option<Timestamp>,
    /// Countdown to the next event's start while rolling between events.
    pub secondary_timer: Option<i64>,
}

/// Milliseconds spent in the current pause.
pub fn paused_time(paused_at: Option<Timestamp>, now: Timestamp) -> i64 {
    paused_at.map_or(0, |paused| millis_between(paused, now).max(0))
}

/// `startedAt + duration + addedTime + pausedTime - now`.
pub fn current(
    started_at: Timestamp,
    duration: i64,
    added_time: i64,
    paused_at: Option<Timestamp>,
    now: Timestamp,
) -> i64 {
    millis_between(now, started_at) + duration + added_time + paused_time(paused_at, now)
}

/// Running time excluding the current pause.
pub fn elapsed(started_at: Timestamp, paused_at: Option<Timestamp>, now: Timestamp) -> i64 {
    millis_between(started_at, now) - paused_time(paused_at, now)
}

pub fn expected_finish(
    started_at: Timestamp,
    duration: i64,
    added_time: i64,
    paused_at: Option<Timestamp>,
    now: Timestamp,
) -> Timestamp {
    shift(started_at, duration + added_time + paused_time(paused_at, now))
}

impl TimerState {
    /// Recomputes the derived fields for `now`.
    pub fn recalculate(&mut self, now: Timestamp) {
        let Some(duration) = self.duration else {
            self.current = None;
            self.elapsed = None;
            self.expected_finish = None;
            return;
        };
        match self.started_at {
            Some(started) => {
                self.current = Some(current(started, duration, self.added_time, self.paused_at, now));
                self.elapsed = Some(elapsed(started, self.paused_at, now));
                self.expected_finish = Some(expected_finish(
                    started,
                    duration,
                    self.added_time,
                    self.paused_at,
                    now,
                ));
            }
            None => {
                self.current = Some(duration + self.added_time);
                self.elapsed = None;
                self.expected_finish = None;
            }
        }
    }

    /// Moves every anchor by `millis`, leaving the countdown untouched.
    pub fn rebase(&mut self, millis: i64) {
        for anchor in [
            &mut self.started_at,
            &mut self.paused_at,
            &mut self.finished_at,
            &mut self.expected_finish,
        ] {
            if let Some(instant) = anchor {
                *instant = shift(*instant, millis);
            }
        }
    }
}
