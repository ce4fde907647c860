//! Composition root.
//!
//! [`Engine`] ties the processed rundown, the runtime, restore persistence
//! and notification fan-out together. Every mutating call goes through
//! [`Engine::commit`], which diffs the runtime snapshot, emits a batched
//! patch, queues a restore point and runs the update listeners.

use std::{sync::Arc, time::Duration};

use jiff::Timestamp;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::{
    clock::{ClockSource, millis_between},
    error::RestoreError,
    metadata::{ProcessWarning, ProcessedRundown, process_rundown},
    restore::{RestorePoint, RestoreService, RestoreWriter},
    rundown::{CustomFields, EndAction, EntryId, Event, Group, Rundown, Timeline},
    runtime::{Offset, OffsetMode, Progress, Runtime, RuntimeState, UpdateResult},
    timer::{Playback, TimerState},
};

pub type SharedEngine = Arc<Mutex<Engine>>;

pub type UpdateListener = Box<dyn Fn(&UpdateResult) + Send + Sync>;

const NOTIFICATION_CAPACITY: usize = 64;

/// Fields of [`RuntimeState`] that changed since the last notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_now: Option<Option<Event>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_next: Option<Option<Event>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_now: Option<Option<Group>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer: Option<TimerState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<Offset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
}

fn changed<T: Clone + PartialEq>(previous: &T, next: &T) -> Option<T> {
    (previous != next).then(|| next.clone())
}

impl RuntimePatch {
    pub fn diff(previous: &RuntimeState, next: &RuntimeState) -> Self {
        Self {
            clock: changed(&previous.clock, &next.clock),
            event_now: changed(&previous.event_now, &next.event_now),
            event_next: changed(&previous.event_next, &next.event_next),
            group_now: changed(&previous.group_now, &next.group_now),
            timer: changed(&previous.timer, &next.timer),
            offset: changed(&previous.offset, &next.offset),
            progress: changed(&previous.progress, &next.progress),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Whether anything beyond the running countdown moved.
fn is_significant(previous: &RuntimeState, next: &RuntimeState) -> bool {
    previous.event_now != next.event_now
        || previous.event_next != next.event_next
        || previous.group_now != next.group_now
        || previous.timer.playback != next.timer.playback
        || previous.timer.finished_at != next.timer.finished_at
        || previous.timer.added_time != next.timer.added_time
        || previous.progress.selected_event_index != next.progress.selected_event_index
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    Runtime { patch: RuntimePatch },
    #[serde(rename_all = "camelCase")]
    TimerFinished { event_id: Option<EntryId> },
    Rundown { revision: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub offset_mode: OffsetMode,
    /// Minimum spacing of routine tick notifications.
    pub notify_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            offset_mode: OffsetMode::Absolute,
            notify_interval: Duration::from_secs(1),
        }
    }
}

pub struct Engine {
    runtime: Runtime,
    processed: ProcessedRundown,
    fields: CustomFields,
    restore: Option<RestoreWriter>,
    notifier: broadcast::Sender<Notification>,
    listeners: Vec<UpdateListener>,
    /// Snapshot as of the last emitted patch.
    notified: RuntimeState,
    notified_at: Option<Timestamp>,
    notify_interval: i64,
}

fn log_warning(warning: ProcessWarning) {
    warn!(entry_id = %warning.entry_id, "{warning}");
}

impl Engine {
    pub fn new(
        clock: Arc<dyn ClockSource>,
        rundown: Rundown,
        fields: CustomFields,
        settings: EngineSettings,
    ) -> Self {
        let processed = process_rundown(&rundown, &fields, &mut log_warning);
        let runtime = Runtime::new(clock, settings.offset_mode);
        let (notifier, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            notified: runtime.state().clone(),
            runtime,
            processed,
            fields,
            restore: None,
            notifier,
            listeners: Vec::new(),
            notified_at: None,
            notify_interval: i64::try_from(settings.notify_interval.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Persists a restore point after every state-affecting change.
    pub fn with_restore(mut self, writer: RestoreWriter) -> Self {
        self.restore = Some(writer);
        self
    }

    pub fn into_shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    pub fn timeline(&self) -> Timeline<'_> {
        self.processed.timeline()
    }

    pub fn processed(&self) -> &ProcessedRundown {
        &self.processed
    }

    pub fn get_state(&self) -> RuntimeState {
        self.runtime.state().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    pub fn on_update(&mut self, listener: impl Fn(&UpdateResult) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    fn notify(&self, notification: Notification) {
        // no subscribers is fine
        let _ = self.notifier.send(notification);
    }

    fn emit_patch(&mut self, now: Timestamp) {
        let state = self.runtime.state();
        let patch = RuntimePatch::diff(&self.notified, state);
        self.notified = state.clone();
        self.notified_at = Some(now);
        if !patch.is_empty() {
            self.notify(Notification::Runtime { patch });
        }
    }

    fn save_restore_point(&self) {
        if let Some(writer) = &self.restore {
            writer.save(self.runtime.restore_point());
        }
    }

    fn run_listeners(&self, result: &UpdateResult) {
        for listener in &self.listeners {
            listener(result);
        }
    }

    /// Publishes the outcome of a mutating call.
    fn commit(&mut self, accepted: bool) -> bool {
        if accepted {
            let now = self.runtime.clock().now();
            self.emit_patch(now);
            self.save_restore_point();
        }
        self.run_listeners(&UpdateResult::default());
        accepted
    }

    pub fn load_event(&mut self, event_id: &str) -> bool {
        let accepted = self.runtime.load(event_id, self.processed.timeline());
        self.commit(accepted)
    }

    pub fn start(&mut self) -> bool {
        let accepted = self.runtime.start();
        self.commit(accepted)
    }

    pub fn pause(&mut self) -> bool {
        let accepted = self.runtime.pause();
        self.commit(accepted)
    }

    pub fn stop(&mut self) -> bool {
        let accepted = self.runtime.stop();
        self.commit(accepted)
    }

    pub fn add_time(&mut self, delta: i64) -> bool {
        let accepted = self.runtime.add_time(delta);
        self.commit(accepted)
    }

    pub fn roll(&mut self) -> bool {
        let accepted = self.runtime.roll(self.processed.timeline());
        self.commit(accepted)
    }

    pub fn resume_from(&mut self, point: &RestorePoint) -> bool {
        let accepted = self.runtime.resume(point, self.processed.timeline());
        self.commit(accepted)
    }

    /// Resumes from whatever `service` holds, logging why when it cannot.
    pub fn resume_from_service(&mut self, service: &RestoreService) -> bool {
        match service.load_for(&self.processed.timeline()) {
            Ok(point) => {
                let resumed = self.resume_from(&point);
                info!(playback = %point.playback, resumed, "restore point found");
                resumed
            }
            Err(RestoreError::Missing) => {
                debug!("no restore point to resume");
                false
            }
            Err(err) => {
                warn!(error = %err, path = %service.path().display(), "ignoring restore point");
                false
            }
        }
    }

    fn run_end_action(&mut self) {
        let Some(event) = self.runtime.state().event_now.as_ref() else {
            return;
        };
        let id = event.id.clone();
        let action = event.end_action;
        let timeline = self.processed.timeline();
        match action {
            EndAction::None => {}
            EndAction::Stop => {
                self.runtime.stop();
            }
            EndAction::LoadNext | EndAction::PlayNext => {
                let Some(next) = timeline.next_playable(&id) else {
                    debug!(event_id = %id, "no event to continue with");
                    return;
                };
                self.runtime.load(&next.id, timeline);
                if action == EndAction::PlayNext {
                    self.runtime.start();
                }
            }
        }
    }

    /// Periodic step: advances the runtime, runs end actions and roll
    /// advance, and emits a throttled notification.
    pub fn tick(&mut self) -> UpdateResult {
        let playback = self.runtime.playback();
        let result = self.runtime.update();
        let mut mutated = false;

        if result.has_timer_finished {
            let event_id = self.runtime.state().event_now.as_ref().map(|event| event.id.clone());
            debug!(?event_id, "timer finished");
            self.notify(Notification::TimerFinished { event_id });
            if playback == Playback::Play {
                self.run_end_action();
                mutated = true;
            }
        }
        if result.should_roll {
            self.runtime.roll(self.processed.timeline());
            mutated = true;
        }

        let now = self.runtime.clock().now();
        let due = self
            .notified_at
            .is_none_or(|at| millis_between(at, now) >= self.notify_interval);
        if mutated || due || is_significant(&self.notified, self.runtime.state()) {
            self.emit_patch(now);
        }
        if mutated {
            self.save_restore_point();
        }
        self.run_listeners(&result);
        result
    }

    /// Replaces the rundown, recomputing metadata wholesale and reconciling
    /// the runtime with the new data. Returns the processing warnings.
    pub fn replace_rundown(&mut self, mut rundown: Rundown) -> Vec<ProcessWarning> {
        rundown.revision = self.processed.rundown.revision;
        rundown.bump_revision();

        let mut warnings = Vec::new();
        self.processed = process_rundown(&rundown, &self.fields, &mut |warning| {
            warnings.push(warning);
        });
        for warning in &warnings {
            log_warning(warning.clone());
        }

        let revision = self.processed.rundown.revision;
        info!(revision, "rundown replaced");
        self.notify(Notification::Rundown { revision });

        self.runtime.reconcile(self.processed.timeline());
        self.commit(true);
        warnings
    }

    /// Stops persisting and removes the restore point. Only for an orderly
    /// shutdown; a crash leaves the point behind on purpose.
    pub async fn shutdown(&mut self) {
        if let Some(writer) = self.restore.take() {
            writer.clear();
            writer.close().await;
        }
        info!("engine shut down");
    }
}
