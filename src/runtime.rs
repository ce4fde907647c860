//! The playback state machine for the single active show.
//!
//! [`Runtime`] owns [`RuntimeState`] outright. Callers drive it through its
//! operations, each of which samples the clock once and returns `false` when
//! the current state does not allow it.

use std::sync::Arc;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    clock::{ClockSource, millis_between, shift},
    duration::{calculate_duration, forward_distance, is_inside_window},
    restore::RestorePoint,
    rundown::{Event, Group, Timeline},
    timer::{MAX_ADDED_TIME, Playback, TimerState, paused_time},
};

/// What the schedule offset is measured against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OffsetMode {
    /// Scheduled end of the loaded event, as written in the rundown.
    #[default]
    Absolute,
    /// Schedule re-anchored at the moment the show actually started.
    Relative,
}

/// Positive `value` means ahead of schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Offset {
    pub mode: OffsetMode,
    pub value: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub selected_event_index: Option<usize>,
    pub num_events: usize,
    /// Time of day the rundown is planned to start.
    pub planned_start: Option<i64>,
    /// Time of day the rundown is planned to end.
    pub planned_end: Option<i64>,
    pub actual_start: Option<Timestamp>,
    pub expected_end: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    /// Time of day of the latest clock sample.
    pub clock: i64,
    pub event_now: Option<Event>,
    pub event_next: Option<Event>,
    pub group_now: Option<Group>,
    pub timer: TimerState,
    pub offset: Offset,
    pub progress: Progress,
}

/// What a call to [`Runtime::update`] observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub has_timer_finished: bool,
    pub has_secondary_timer_finished: bool,
    pub should_roll: bool,
}

pub struct Runtime {
    clock: Arc<dyn ClockSource>,
    state: RuntimeState,
    last_sample: Option<Timestamp>,
    /// Start of the next event while rolling with nothing on air.
    secondary_target: Option<Timestamp>,
    /// Planned time from the loaded event's end to the rundown's end.
    remaining_after: i64,
    /// Planned distance from the rundown's first start to the loaded event's end.
    planned_from_first: Option<i64>,
}

impl Runtime {
    pub fn new(clock: Arc<dyn ClockSource>, mode: OffsetMode) -> Self {
        let mut runtime = Self {
            clock,
            state: RuntimeState::default(),
            last_sample: None,
            secondary_target: None,
            remaining_after: 0,
            planned_from_first: None,
        };
        runtime.state.offset.mode = mode;
        runtime.sample();
        runtime
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.clock
    }

    pub fn playback(&self) -> Playback {
        self.state.timer.playback
    }

    /// Reads the clock, rebasing every anchor if it went backwards so the
    /// countdown never jumps up.
    fn sample(&mut self) -> Timestamp {
        let now = self.clock.now();
        if let Some(last) = self.last_sample {
            let delta = millis_between(last, now);
            if delta < 0 {
                warn!(delta, "clock went backwards, rebasing timer");
                self.rebase(delta);
            }
        }
        self.last_sample = Some(now);
        self.state.clock = self.clock.to_time_of_day(now);
        now
    }

    fn rebase(&mut self, millis: i64) {
        self.state.timer.rebase(millis);
        self.secondary_target = self.secondary_target.map(|target| shift(target, millis));
        let progress = &mut self.state.progress;
        progress.actual_start = progress.actual_start.map(|start| shift(start, millis));
        progress.expected_end = progress.expected_end.map(|end| shift(end, millis));
    }

    fn select(&mut self, event: &Event, timeline: Timeline<'_>) {
        self.state.event_now = Some(event.clone());
        self.state.event_next = timeline.next_playable(&event.id).cloned();
        self.state.group_now = timeline.group_of(event).cloned();
        self.remaining_after = timeline.remaining_after(event);
        self.planned_from_first = timeline
            .metadata
            .first_event
            .as_deref()
            .and_then(|id| timeline.event(id))
            .map(|first| event.absolute_end() - first.absolute_start());

        let progress = &mut self.state.progress;
        progress.selected_event_index = timeline.playable_index(&event.id);
        progress.num_events = timeline.num_playable();
        progress.planned_start = timeline.metadata.first_start;
        progress.planned_end = timeline.metadata.last_end;
    }

    fn deselect(&mut self) {
        self.state.event_now = None;
        self.state.event_next = None;
        self.state.group_now = None;
        self.state.progress.selected_event_index = None;
        self.remaining_after = 0;
        self.planned_from_first = None;
    }

    fn recalculate(&mut self, now: Timestamp) {
        self.state.timer.recalculate(now);
        if let Some(target) = self.secondary_target {
            self.state.timer.secondary_timer = Some(millis_between(now, target).max(0));
        }
        self.state.progress.expected_end = self
            .state
            .timer
            .expected_finish
            .map(|finish| shift(finish, self.remaining_after));
        self.update_offset();
    }

    fn update_offset(&mut self) {
        let Some(finish) = self.state.timer.expected_finish else {
            return;
        };
        let planned = match self.state.offset.mode {
            OffsetMode::Absolute => self
                .state
                .event_now
                .as_ref()
                .map(|event| self.clock.nearest_instant(event.time_end, finish)),
            OffsetMode::Relative => self
                .state
                .progress
                .actual_start
                .zip(self.planned_from_first)
                .map(|(start, planned)| shift(start, planned)),
        };
        if let Some(planned) = planned {
            self.state.offset.value = millis_between(finish, planned);
        }
    }

    fn arm(&mut self, event: &Event, timeline: Timeline<'_>, playback: Playback) {
        self.state.timer = TimerState {
            playback,
            duration: Some(calculate_duration(event.time_start, event.time_end)),
            ..TimerState::default()
        };
        self.secondary_target = None;
        self.select(event, timeline);
    }

    /// Loads a playable event, replacing whatever was loaded.
    pub fn load(&mut self, event_id: &str, timeline: Timeline<'_>) -> bool {
        let Some(event) = timeline.playable_event(event_id) else {
            debug!(event_id, "refusing to load unknown or skipped event");
            return false;
        };
        let now = self.sample();
        self.arm(event, timeline, Playback::Armed);
        self.recalculate(now);
        true
    }

    pub fn start(&mut self) -> bool {
        let now = self.sample();
        let timer = &mut self.state.timer;
        match timer.playback {
            Playback::Armed => {
                timer.started_at = Some(now);
                self.state.progress.actual_start.get_or_insert(now);
            }
            Playback::Pause => {
                timer.added_time += paused_time(timer.paused_at, now);
                timer.paused_at = None;
            }
            _ => return false,
        }
        self.state.timer.playback = Playback::Play;
        self.recalculate(now);
        true
    }

    pub fn pause(&mut self) -> bool {
        if self.state.timer.playback != Playback::Play {
            return false;
        }
        let now = self.sample();
        self.state.timer.paused_at = Some(now);
        self.state.timer.playback = Playback::Pause;
        self.recalculate(now);
        true
    }

    pub fn stop(&mut self) -> bool {
        if self.state.timer.playback == Playback::Stop {
            return false;
        }
        self.sample();
        self.state.timer = TimerState::default();
        self.state.offset.value = 0;
        self.state.progress = Progress::default();
        self.secondary_target = None;
        self.deselect();
        true
    }

    /// Adds (or with a negative delta removes) time from the loaded event.
    /// The running total is kept within [`MAX_ADDED_TIME`] either way.
    pub fn add_time(&mut self, delta: i64) -> bool {
        if !matches!(
            self.state.timer.playback,
            Playback::Armed | Playback::Play | Playback::Pause
        ) {
            return false;
        }
        let Some(added_time) = self
            .state
            .timer
            .added_time
            .checked_add(delta)
            .filter(|total| total.abs() <= MAX_ADDED_TIME)
        else {
            debug!(delta, "added time out of range");
            return false;
        };
        let now = self.sample();
        self.state.timer.added_time = added_time;
        self.recalculate(now);

        let timer = &mut self.state.timer;
        let current = timer.current.unwrap_or_default();
        if current > 0 {
            timer.finished_at = None;
        } else if current < 0 && timer.started_at.is_some() && timer.finished_at.is_none() {
            timer.finished_at = Some(now);
        }
        true
    }

    /// Follows the schedule: puts on air whichever event's window contains
    /// now, or counts down to the next one.
    pub fn roll(&mut self, timeline: Timeline<'_>) -> bool {
        if timeline.num_playable() == 0 {
            return false;
        }
        let now = self.sample();
        let time_of_day = self.clock.to_time_of_day(now);

        let on_air = timeline
            .playable_events()
            .find(|event| is_inside_window(time_of_day, event.delayed_start(), event.delayed_end()));

        match on_air {
            Some(event) => {
                self.arm(event, timeline, Playback::Roll);
                let started = self.clock.previous_instant(event.delayed_start(), now);
                self.state.timer.started_at = Some(started);
                self.state.progress.actual_start.get_or_insert(started);
                debug!(event_id = %event.id, "rolling into event");
            }
            None => {
                let upcoming = timeline
                    .playable_events()
                    .min_by_key(|event| forward_distance(time_of_day, event.delayed_start()));
                self.state.timer = TimerState {
                    playback: Playback::Roll,
                    ..TimerState::default()
                };
                self.deselect();
                self.state.progress.num_events = timeline.num_playable();
                self.state.event_next = upcoming.cloned();
                self.secondary_target =
                    upcoming.map(|event| self.clock.next_instant(event.delayed_start(), now));
                debug!(next = ?upcoming.map(|event| &event.id), "rolling towards next event");
            }
        }
        self.recalculate(now);
        true
    }

    /// Periodic refresh.
    pub fn update(&mut self) -> UpdateResult {
        let now = self.sample();
        let mut result = UpdateResult::default();
        let playback = self.state.timer.playback;
        if playback == Playback::Stop {
            return result;
        }

        if playback == Playback::Roll {
            if let Some(target) = self.secondary_target {
                if millis_between(now, target) <= 0 {
                    self.secondary_target = None;
                    self.state.timer.secondary_timer = Some(0);
                    result.has_secondary_timer_finished = true;
                    result.should_roll = true;
                }
            }
        }

        self.recalculate(now);

        let timer = &mut self.state.timer;
        let running = matches!(playback, Playback::Play | Playback::Roll) && timer.started_at.is_some();
        if running && timer.current.is_some_and(|current| current <= 0) && timer.finished_at.is_none() {
            timer.finished_at = Some(now);
            result.has_timer_finished = true;
            if playback == Playback::Roll {
                result.should_roll = true;
            }
        }
        result
    }

    /// Refreshes the loaded event after the rundown changed, keeping the
    /// timer anchors. Stops if the event is gone or no longer playable.
    pub fn reconcile(&mut self, timeline: Timeline<'_>) -> bool {
        match self.state.timer.playback {
            Playback::Stop => true,
            Playback::Roll => self.roll(timeline),
            _ => {
                let Some(id) = self.state.event_now.as_ref().map(|event| event.id.clone()) else {
                    self.stop();
                    return false;
                };
                match timeline.playable_event(&id) {
                    Some(event) => {
                        let now = self.sample();
                        self.state.timer.duration =
                            Some(calculate_duration(event.time_start, event.time_end));
                        self.select(event, timeline);
                        self.recalculate(now);
                        true
                    }
                    None => {
                        debug!(event_id = %id, "loaded event left the rundown");
                        self.stop();
                        false
                    }
                }
            }
        }
    }

    /// Snapshot sufficient to rebuild the current state after a restart.
    pub fn restore_point(&self) -> RestorePoint {
        let timer = &self.state.timer;
        let time_of_day = |instant: Option<Timestamp>| instant.map(|at| self.clock.to_time_of_day(at));
        let actual_start = self.state.progress.actual_start;
        let selected_event_id = match timer.playback {
            Playback::Stop | Playback::Roll => None,
            _ => self.state.event_now.as_ref().map(|event| event.id.clone()),
        };
        RestorePoint {
            playback: timer.playback,
            selected_event_id,
            started_at: time_of_day(timer.started_at),
            added_time: timer.added_time,
            paused_at: time_of_day(timer.paused_at),
            first_start: time_of_day(actual_start),
            start_epoch: actual_start.map(Timestamp::as_millisecond),
            current_day: actual_start
                .zip(timer.started_at)
                .map_or(0, |(first, started)| self.clock.days_between(first, started)),
        }
    }

    /// Rebuilds state from a restore point. Returns `false`, leaving the
    /// runtime stopped, when there is nothing to resume.
    pub fn resume(&mut self, point: &RestorePoint, timeline: Timeline<'_>) -> bool {
        match point.playback {
            Playback::Stop => false,
            Playback::Roll => self.roll(timeline),
            playback => {
                let Some(id) = point.selected_event_id.as_deref() else {
                    return false;
                };
                if !self.load(id, timeline) {
                    debug!(event_id = id, "restore point references a missing event");
                    return false;
                }
                let now = self.last_sample.unwrap_or_else(|| self.clock.now());
                self.state.timer.added_time = point.added_time.clamp(-MAX_ADDED_TIME, MAX_ADDED_TIME);

                if let (Playback::Play | Playback::Pause, Some(started_tod)) = (playback, point.started_at) {
                    let epoch = point
                        .start_epoch
                        .and_then(|millis| Timestamp::from_millisecond(millis).ok());
                    let day = epoch.map_or(now, |epoch| self.clock.shift_days(epoch, point.current_day));
                    let started = self.clock.to_instant(started_tod, day);
                    let actual_start = epoch.or_else(|| {
                        point
                            .first_start
                            .map(|first| self.clock.previous_instant(first, started))
                    });

                    let timer = &mut self.state.timer;
                    timer.playback = playback;
                    timer.started_at = Some(started);
                    if playback == Playback::Pause {
                        timer.paused_at = Some(
                            point
                                .paused_at
                                .map_or(now, |paused| self.clock.next_instant(paused, started)),
                        );
                    }
                    self.state.progress.actual_start = Some(actual_start.unwrap_or(started));
                }

                self.recalculate(now);
                let timer = &mut self.state.timer;
                if timer.started_at.is_some() && timer.current.is_some_and(|current| current <= 0) {
                    timer.finished_at = timer.expected_finish;
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use jiff::tz::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        clock::ManualClock,
        duration::{HOUR, MINUTE, SECOND},
        metadata::{ProcessedRundown, process_rundown},
        rundown::{CustomFields, Delay, Entry, Rundown},
    };

    const NINE: i64 = 9 * HOUR;

    fn clock_at(rfc3339: &str) -> Arc<ManualClock> {
        Arc::new(ManualClock::new(TimeZone::UTC, rfc3339.parse().unwrap()))
    }

    fn runtime(clock: &Arc<ManualClock>, mode: OffsetMode) -> Runtime {
        Runtime::new(clock.clone(), mode)
    }

    fn processed(entries: impl IntoIterator<Item = Entry>) -> ProcessedRundown {
        process_rundown(&Rundown::from_entries(entries), &CustomFields::new(), &mut |_| {})
    }

    /// A 09:00-09:10, B 09:10-09:30, C 10:00-10:30.
    fn show() -> ProcessedRundown {
        processed([
            Entry::Event(Event::new("a", NINE, NINE + 10 * MINUTE)),
            Entry::Event(Event::new("b", NINE + 10 * MINUTE, NINE + 30 * MINUTE)),
            Entry::Event(Event::new("c", 10 * HOUR, 10 * HOUR + 30 * MINUTE)),
        ])
    }

    #[test]
    fn test_load_arms_event() {
        let clock = clock_at("2024-05-01T08:55:00Z");
        let show = show();
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        assert!(runtime.load("b", show.timeline()));

        let state = runtime.state();
        assert_eq!(state.timer.playback, Playback::Armed);
        assert_eq!(state.timer.current, Some(20 * MINUTE));
        assert_eq!(state.event_next.as_ref().map(|e| e.id.as_str()), Some("c"));
        assert_eq!(state.progress.selected_event_index, Some(1));
        assert_eq!(state.progress.num_events, 3);
        assert!(!runtime.load("missing", show.timeline()));
    }

    #[test]
    fn test_skipped_events_cannot_load() {
        let clock = clock_at("2024-05-01T08:55:00Z");
        let mut skipped = Event::new("s", NINE, NINE + MINUTE);
        skipped.skip = true;
        let show = processed([Entry::Event(skipped)]);
        assert!(!runtime(&clock, OffsetMode::Absolute).load("s", show.timeline()));
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let clock = clock_at("2024-05-01T08:55:00Z");
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        assert!(!runtime.pause());
        assert!(!runtime.start());
        assert!(!runtime.stop());
        assert!(!runtime.add_time(MINUTE));
        assert_eq!(runtime.playback(), Playback::Stop);
    }

    #[test]
    fn test_play_counts_down_and_finishes() {
        let clock = clock_at("2024-05-01T09:00:00Z");
        let show = show();
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        runtime.load("a", show.timeline());
        assert!(runtime.start());

        clock.advance(4 * MINUTE);
        let result = runtime.update();
        assert_eq!(result, UpdateResult::default());
        assert_eq!(runtime.state().timer.current, Some(6 * MINUTE));
        assert_eq!(runtime.state().timer.elapsed, Some(4 * MINUTE));

        clock.advance(6 * MINUTE);
        let result = runtime.update();
        assert!(result.has_timer_finished);
        assert!(!result.should_roll);
        assert!(runtime.state().timer.finished_at.is_some());

        // only reported once
        clock.advance(SECOND);
        assert!(!runtime.update().has_timer_finished);
        assert_eq!(runtime.state().timer.current, Some(-SECOND));
    }

    #[test]
    fn test_pause_then_resume_folds_pause_into_added_time() {
        let clock = clock_at("2024-05-01T09:00:00Z");
        let show = show();
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        runtime.load("a", show.timeline());
        runtime.start();
        clock.advance(2 * MINUTE);
        assert!(runtime.pause());
        assert!(!runtime.pause());

        clock.advance(3 * MINUTE);
        runtime.update();
        assert_eq!(runtime.state().timer.current, Some(8 * MINUTE));

        assert!(runtime.start());
        let timer = &runtime.state().timer;
        assert_eq!(timer.added_time, 3 * MINUTE);
        assert_eq!(timer.paused_at, None);
        assert_eq!(timer.current, Some(8 * MINUTE));
    }

    #[test]
    fn test_offset_persists_across_pause() {
        let clock = clock_at("2024-05-01T09:00:00Z");
        let show = show();
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        runtime.load("a", show.timeline());
        runtime.start();
        assert_eq!(runtime.state().offset.value, 0);

        clock.advance(MINUTE);
        runtime.pause();
        clock.advance(2 * MINUTE);
        runtime.update();
        // two minutes of pausing pushed the finish two minutes late
        assert_eq!(runtime.state().offset.value, -2 * MINUTE);

        runtime.start();
        clock.advance(MINUTE);
        runtime.update();
        assert_eq!(runtime.state().offset.value, -2 * MINUTE);

        runtime.stop();
        assert_eq!(runtime.state().offset.value, 0);
        assert_eq!(runtime.state().offset.mode, OffsetMode::Absolute);
    }

    #[test]
    fn test_relative_offset_uses_actual_start() {
        // started 15 minutes late; relative mode is on time, absolute is behind
        let clock = clock_at("2024-05-01T09:15:00Z");
        let show = show();
        let mut relative = runtime(&clock, OffsetMode::Relative);
        let mut absolute = runtime(&clock, OffsetMode::Absolute);
        for runtime in [&mut relative, &mut absolute] {
            runtime.load("a", show.timeline());
            runtime.start();
        }
        assert_eq!(relative.state().offset.value, 0);
        assert_eq!(absolute.state().offset.value, -15 * MINUTE);
    }

    #[test]
    fn test_add_time_is_reversible() {
        let clock = clock_at("2024-05-01T09:00:00Z");
        let show = show();
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        runtime.load("a", show.timeline());
        runtime.start();
        clock.advance(MINUTE);
        runtime.update();
        let before = runtime.state().timer.clone();

        assert!(runtime.add_time(30 * SECOND));
        assert_eq!(runtime.state().timer.current, Some(9 * MINUTE + 30 * SECOND));
        assert!(runtime.add_time(-30 * SECOND));
        assert_eq!(runtime.state().timer, before);
    }

    #[test]
    fn test_add_time_crossing_zero_stamps_and_clears_finish() {
        let clock = clock_at("2024-05-01T09:00:00Z");
        let show = show();
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        runtime.load("a", show.timeline());
        runtime.start();

        runtime.add_time(-11 * MINUTE);
        assert_eq!(runtime.state().timer.current, Some(-MINUTE));
        assert_eq!(runtime.state().timer.finished_at, Some(clock.now()));

        runtime.add_time(2 * MINUTE);
        assert_eq!(runtime.state().timer.finished_at, None);
    }

    #[test]
    fn test_add_time_rejects_overflowing_totals() {
        let clock = clock_at("2024-05-01T09:00:00Z");
        let show = show();
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        runtime.load("a", show.timeline());
        runtime.start();
        let before = runtime.state().timer.clone();

        assert!(!runtime.add_time(i64::MAX));
        assert!(!runtime.add_time(i64::MIN));
        assert!(!runtime.add_time(MAX_ADDED_TIME + 1));
        assert_eq!(runtime.state().timer, before);

        assert!(runtime.add_time(MAX_ADDED_TIME));
        assert!(!runtime.add_time(1));
        assert_eq!(runtime.state().timer.added_time, MAX_ADDED_TIME);
    }

    #[test]
    fn test_backwards_clock_never_raises_current() {
        let clock = clock_at("2024-05-01T09:00:00Z");
        let show = show();
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        runtime.load("a", show.timeline());
        runtime.start();
        clock.advance(2 * MINUTE);
        runtime.update();
        let before = runtime.state().timer.current.unwrap();

        clock.advance(-MINUTE);
        runtime.update();
        let after = runtime.state().timer.current.unwrap();
        assert!(after <= before);

        clock.advance(SECOND);
        runtime.update();
        assert_eq!(runtime.state().timer.current, Some(before - SECOND));
    }

    #[test]
    fn test_roll_inside_window() {
        let clock = clock_at("2024-05-01T09:04:00Z");
        let show = show();
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        assert!(runtime.roll(show.timeline()));

        let state = runtime.state();
        assert_eq!(state.timer.playback, Playback::Roll);
        assert_eq!(state.event_now.as_ref().map(|e| e.id.as_str()), Some("a"));
        assert_eq!(state.timer.current, Some(6 * MINUTE));
        assert_eq!(state.timer.secondary_timer, None);
    }

    #[test]
    fn test_roll_before_first_event_arms_secondary_timer() {
        let clock = clock_at("2024-05-01T08:30:00Z");
        let show = show();
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        assert!(runtime.roll(show.timeline()));

        let state = runtime.state();
        assert_eq!(state.event_now, None);
        assert_eq!(state.event_next.as_ref().map(|e| e.id.as_str()), Some("a"));
        assert_eq!(state.timer.secondary_timer, Some(30 * MINUTE));

        clock.advance(30 * MINUTE);
        let result = runtime.update();
        assert!(result.has_secondary_timer_finished);
        assert!(result.should_roll);

        runtime.roll(show.timeline());
        assert_eq!(runtime.state().event_now.as_ref().map(|e| e.id.as_str()), Some("a"));
        assert_eq!(runtime.state().timer.current, Some(10 * MINUTE));
    }

    #[test]
    fn test_roll_in_gap_counts_to_next_event() {
        let clock = clock_at("2024-05-01T09:45:00Z");
        let show = show();
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        runtime.roll(show.timeline());
        let state = runtime.state();
        assert_eq!(state.event_next.as_ref().map(|e| e.id.as_str()), Some("c"));
        assert_eq!(state.timer.secondary_timer, Some(15 * MINUTE));
    }

    #[test]
    fn test_roll_finish_asks_to_advance() {
        let clock = clock_at("2024-05-01T09:09:59Z");
        let show = show();
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        runtime.roll(show.timeline());
        clock.advance(SECOND);
        let result = runtime.update();
        assert!(result.has_timer_finished);
        assert!(result.should_roll);

        runtime.roll(show.timeline());
        assert_eq!(runtime.state().event_now.as_ref().map(|e| e.id.as_str()), Some("b"));
        assert_eq!(runtime.state().timer.current, Some(20 * MINUTE));
    }

    #[test]
    fn test_roll_honours_delay() {
        let clock = clock_at("2024-05-01T09:12:00Z");
        let show = processed([
            Entry::Delay(Delay {
                id: "d".into(),
                duration: 5 * MINUTE,
                parent: None,
            }),
            Entry::Event(Event::new("a", NINE, NINE + 10 * MINUTE)),
        ]);
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        runtime.roll(show.timeline());
        assert_eq!(runtime.state().timer.current, Some(3 * MINUTE));
    }

    #[test]
    fn test_roll_across_midnight() {
        let clock = clock_at("2024-05-02T00:20:00Z");
        let show = processed([Entry::Event(Event::new("late", 23 * HOUR + 30 * MINUTE, 30 * MINUTE))]);
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        runtime.roll(show.timeline());
        let timer = &runtime.state().timer;
        assert_eq!(timer.duration, Some(HOUR));
        assert_eq!(timer.current, Some(10 * MINUTE));
        assert_eq!(timer.started_at, Some("2024-05-01T23:30:00Z".parse().unwrap()));
    }

    #[test]
    fn test_reconcile_follows_rundown_changes() {
        let clock = clock_at("2024-05-01T09:00:00Z");
        let show = show();
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        runtime.load("a", show.timeline());
        runtime.start();

        let longer = processed([Entry::Event(Event::new("a", NINE, NINE + 20 * MINUTE))]);
        assert!(runtime.reconcile(longer.timeline()));
        assert_eq!(runtime.state().timer.current, Some(20 * MINUTE));
        assert_eq!(runtime.state().timer.playback, Playback::Play);
        assert_eq!(runtime.state().event_next, None);

        let without = processed([Entry::Event(Event::new("b", NINE, NINE + MINUTE))]);
        assert!(!runtime.reconcile(without.timeline()));
        assert_eq!(runtime.playback(), Playback::Stop);
    }

    #[test]
    fn test_restore_point_round_trip() {
        let clock = clock_at("2024-05-01T09:00:00Z");
        let show = show();
        let mut original = runtime(&clock, OffsetMode::Absolute);
        original.load("a", show.timeline());
        original.start();
        clock.advance(2 * MINUTE);
        original.pause();
        clock.advance(MINUTE);
        original.update();
        let point = original.restore_point();
        assert_eq!(point.playback, Playback::Pause);
        assert_eq!(point.started_at, Some(NINE));
        assert_eq!(point.paused_at, Some(NINE + 2 * MINUTE));

        let mut resumed = runtime(&clock, OffsetMode::Absolute);
        assert!(resumed.resume(&point, show.timeline()));
        assert_eq!(resumed.state().timer, original.state().timer);
        assert_eq!(resumed.state().progress, original.state().progress);
    }

    #[test]
    fn test_resume_after_midnight() {
        let clock = clock_at("2024-05-01T23:50:00Z");
        let show = processed([Entry::Event(Event::new("late", 23 * HOUR + 50 * MINUTE, 30 * MINUTE))]);
        let mut original = runtime(&clock, OffsetMode::Absolute);
        original.load("late", show.timeline());
        original.start();
        let point = original.restore_point();
        assert_eq!(point.current_day, 0);

        clock.advance(30 * MINUTE);
        let mut resumed = runtime(&clock, OffsetMode::Absolute);
        assert!(resumed.resume(&point, show.timeline()));
        assert_eq!(resumed.state().timer.current, Some(10 * MINUTE));
    }

    #[test]
    fn test_resume_tolerates_unchecked_points() {
        let clock = clock_at("2024-05-01T09:00:00Z");
        let point = RestorePoint {
            playback: Playback::Play,
            selected_event_id: Some("a".into()),
            started_at: Some(NINE),
            added_time: i64::MAX,
            start_epoch: Some(clock.now().as_millisecond()),
            current_day: 99_999_999,
            ..RestorePoint::default()
        };
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        assert!(runtime.resume(&point, show().timeline()));
        assert_eq!(runtime.state().timer.added_time, MAX_ADDED_TIME);
        assert_eq!(runtime.state().timer.started_at, Some(clock.now()));
    }

    #[test]
    fn test_resume_gives_up_on_missing_event() {
        let clock = clock_at("2024-05-01T09:00:00Z");
        let point = RestorePoint {
            playback: Playback::Play,
            selected_event_id: Some("gone".into()),
            started_at: Some(NINE),
            ..RestorePoint::default()
        };
        let mut runtime = runtime(&clock, OffsetMode::Absolute);
        assert!(!runtime.resume(&point, show().timeline()));
        assert_eq!(runtime.playback(), Playback::Stop);
        assert!(!runtime.resume(&RestorePoint::default(), show().timeline()));
    }
}
