//! Crash recovery.
//!
//! A [`RestorePoint`] is the smallest amount of state needed to bring a
//! running timer back after the process dies. It is written after every
//! state-affecting change and removed only on an orderly shutdown.

use std::{
    fs, io,
    ops::Range,
    path::{Path, PathBuf},
};

use jiff::Timestamp;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    duration::DAY,
    error::RestoreError,
    rundown::{EntryId, Timeline},
    timer::{MAX_ADDED_TIME, Playback},
};

/// Longest a show may run, in calendar days, for a restore to be honoured.
pub const MAX_SHOW_DAYS: i64 = 366;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePoint {
    pub playback: Playback,
    pub selected_event_id: Option<EntryId>,
    /// Time of day the loaded event started.
    pub started_at: Option<i64>,
    pub added_time: i64,
    /// Time of day the current pause began.
    pub paused_at: Option<i64>,
    /// Time of day the rundown actually started.
    pub first_start: Option<i64>,
    /// Unix milliseconds of the rundown's actual start.
    pub start_epoch: Option<i64>,
    /// Calendar days from the actual start to `started_at`.
    pub current_day: i64,
}

fn field<'a>(map: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, RestoreError> {
    map.get(name).ok_or(RestoreError::MissingField(name))
}

fn number(name: &'static str, value: &Value) -> Result<i64, RestoreError> {
    let invalid = || RestoreError::InvalidNumber {
        field: name,
        value: value.to_string(),
    };
    match value {
        Value::Number(number) => number.as_i64().ok_or_else(invalid),
        Value::String(text) => text.trim().parse().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn required_number(map: &Map<String, Value>, name: &'static str) -> Result<i64, RestoreError> {
    number(name, field(map, name)?)
}

fn optional_number(map: &Map<String, Value>, name: &'static str) -> Result<Option<i64>, RestoreError> {
    match field(map, name)? {
        Value::Null => Ok(None),
        value => number(name, value).map(Some),
    }
}

fn in_range(name: &'static str, value: i64, range: Range<i64>) -> Result<i64, RestoreError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(RestoreError::OutOfRange { field: name, value })
    }
}

impl RestorePoint {
    /// Parses and validates stored content. Unknown keys are ignored.
    pub fn parse(text: &str) -> Result<Self, RestoreError> {
        let Value::Object(map) = serde_json::from_str::<Value>(text)? else {
            return Err(RestoreError::NotAnObject);
        };

        let playback = match field(&map, "playback")? {
            Value::String(state) => state.parse().map_err(RestoreError::InvalidPlayback)?,
            other => return Err(RestoreError::InvalidPlayback(other.to_string())),
        };

        let selected_event_id = match field(&map, "selectedEventId")? {
            Value::Null => None,
            Value::String(id) => Some(id.clone()),
            other => {
                return Err(RestoreError::InvalidField {
                    field: "selectedEventId",
                    value: other.to_string(),
                });
            }
        };

        let time_of_day = |name: &'static str| {
            optional_number(&map, name)?
                .map(|value| in_range(name, value, 0..DAY))
                .transpose()
        };
        let start_epoch = optional_number(&map, "startEpoch")?;
        if let Some(epoch) = start_epoch {
            if Timestamp::from_millisecond(epoch).is_err() {
                return Err(RestoreError::OutOfRange {
                    field: "startEpoch",
                    value: epoch,
                });
            }
        }

        Ok(Self {
            playback,
            selected_event_id,
            started_at: time_of_day("startedAt")?,
            added_time: in_range(
                "addedTime",
                required_number(&map, "addedTime")?,
                -MAX_ADDED_TIME..MAX_ADDED_TIME + 1,
            )?,
            paused_at: time_of_day("pausedAt")?,
            first_start: time_of_day("firstStart")?,
            start_epoch,
            current_day: in_range("currentDay", required_number(&map, "currentDay")?, 0..MAX_SHOW_DAYS + 1)?,
        })
    }

    /// Fails if the referenced event is not in `timeline`.
    pub fn check_event(&self, timeline: &Timeline<'_>) -> Result<(), RestoreError> {
        match &self.selected_event_id {
            Some(id) if timeline.event(id).is_none() => Err(RestoreError::UnknownEvent(id.clone())),
            _ => Ok(()),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let staging = path.with_extension("tmp");
    fs::write(&staging, bytes)?;
    fs::rename(&staging, path)
}

/// File-backed restore point storage.
#[derive(Debug)]
pub struct RestoreService {
    path: PathBuf,
    last_written: Option<blake3::Hash>,
}

impl RestoreService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_written: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `point` unless identical content was the last thing written.
    /// Returns whether a write happened.
    pub fn save(&mut self, point: &RestorePoint) -> Result<bool, RestoreError> {
        let bytes = serde_json::to_vec(point)?;
        let hash = blake3::hash(&bytes);
        if self.last_written == Some(hash) {
            return Ok(false);
        }
        write_atomic(&self.path, &bytes)?;
        self.last_written = Some(hash);
        debug!(playback = %point.playback, "restore point written");
        Ok(true)
    }

    pub fn load(&self) -> Result<RestorePoint, RestoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(RestoreError::Missing),
            Err(err) => return Err(err.into()),
        };
        RestorePoint::parse(&text)
    }

    /// Loads and checks the point against the current rundown.
    pub fn load_for(&self, timeline: &Timeline<'_>) -> Result<RestorePoint, RestoreError> {
        let point = self.load()?;
        point.check_event(timeline)?;
        Ok(point)
    }

    pub fn clear(&mut self) -> Result<(), RestoreError> {
        self.last_written = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

enum WriterCommand {
    Save(RestorePoint),
    Clear,
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget front for a [`RestoreService`].
///
/// Writes happen in order on a blocking worker; callers never wait on disk.
/// Failed writes are logged and not retried.
pub struct RestoreWriter {
    tx: mpsc::UnboundedSender<WriterCommand>,
    worker: JoinHandle<()>,
}

impl RestoreWriter {
    /// Starts the worker. Must be called inside a tokio runtime.
    pub fn spawn(mut service: RestoreService) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = tokio::task::spawn_blocking(move || {
            while let Some(command) = rx.blocking_recv() {
                match command {
                    WriterCommand::Save(point) => {
                        if let Err(err) = service.save(&point) {
                            warn!(error = %err, path = %service.path().display(), "restore point write failed");
                        }
                    }
                    WriterCommand::Clear => {
                        if let Err(err) = service.clear() {
                            warn!(error = %err, "restore point removal failed");
                        }
                    }
                    WriterCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("restore writer stopped");
        });
        Self { tx, worker }
    }

    pub fn save(&self, point: RestorePoint) {
        self.send(WriterCommand::Save(point));
    }

    pub fn clear(&self) {
        self.send(WriterCommand::Clear);
    }

    fn send(&self, command: WriterCommand) {
        if self.tx.send(command).is_err() {
            warn!("restore writer is not running");
        }
    }

    /// Waits until everything queued so far has been handled.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(WriterCommand::Flush(done));
        let _ = wait.await;
    }

    /// Drains the queue and stops the worker.
    pub async fn close(self) {
        let RestoreWriter { tx, worker } = self;
        drop(tx);
        if let Err(err) = worker.await {
            warn!(error = %err, "restore writer panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        metadata::process_rundown,
        rundown::{CustomFields, Entry, Event, Rundown},
    };

    fn sample() -> RestorePoint {
        RestorePoint {
            playback: Playback::Pause,
            selected_event_id: Some("a".into()),
            started_at: Some(32_400_000),
            added_time: -5_000,
            paused_at: Some(32_460_000),
            first_start: Some(32_400_000),
            start_epoch: Some(1_714_554_000_000),
            current_day: 0,
        }
    }

    fn service(dir: &TempDir) -> RestoreService {
        RestoreService::new(dir.path().join("restore.json"))
    }

    fn with_field(key: &str, value: Value) -> String {
        let mut json = serde_json::to_value(sample()).unwrap();
        json[key] = value;
        json.to_string()
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut service = service(&dir);
        assert!(service.save(&sample()).unwrap());
        assert_eq!(service.load().unwrap(), sample());
    }

    #[test]
    fn test_save_skips_identical_content() {
        let dir = TempDir::new().unwrap();
        let mut service = service(&dir);
        assert!(service.save(&sample()).unwrap());
        assert!(!service.save(&sample()).unwrap());
        let changed = RestorePoint {
            added_time: 0,
            ..sample()
        };
        assert!(service.save(&changed).unwrap());
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = TempDir::new().unwrap();
        let mut service = service(&dir);
        service.save(&sample()).unwrap();
        service.clear().unwrap();
        assert!(matches!(service.load(), Err(RestoreError::Missing)));
        // clearing twice is fine and the next save is not deduplicated away
        service.clear().unwrap();
        assert!(service.save(&sample()).unwrap());
    }

    #[test]
    fn test_unknown_keys_are_tolerated() {
        let text = with_field("futureField", Value::Bool(true));
        assert_eq!(RestorePoint::parse(&text).unwrap(), sample());
    }

    #[test]
    fn test_numeric_strings_are_accepted() {
        let text = with_field("addedTime", Value::String("-5000".into()));
        assert_eq!(RestorePoint::parse(&text).unwrap(), sample());
    }

    #[test]
    fn test_truncated_content() {
        let text = serde_json::to_string(&sample()).unwrap();
        let truncated = &text[..text.len() - 1];
        assert!(matches!(RestorePoint::parse(truncated), Err(RestoreError::Malformed(_))));
    }

    #[test]
    fn test_not_an_object() {
        assert!(matches!(RestorePoint::parse("[1, 2]"), Err(RestoreError::NotAnObject)));
    }

    #[test]
    fn test_bad_playback() {
        let text = with_field("playback", Value::String("rewind".into()));
        assert!(matches!(
            RestorePoint::parse(&text),
            Err(RestoreError::InvalidPlayback(state)) if state == "rewind"
        ));
    }

    #[test]
    fn test_bad_number() {
        let text = with_field("startedAt", Value::String("nine".into()));
        assert!(matches!(
            RestorePoint::parse(&text),
            Err(RestoreError::InvalidNumber { field: "startedAt", .. })
        ));
    }

    #[test]
    fn test_out_of_range_values() {
        for (key, value) in [
            ("currentDay", Value::from(99_999_999)),
            ("currentDay", Value::from(-1)),
            ("startedAt", Value::from(DAY)),
            ("pausedAt", Value::from(-5)),
            ("firstStart", Value::from(i64::MAX)),
            ("addedTime", Value::from(i64::MIN)),
            ("startEpoch", Value::from(i64::MAX)),
        ] {
            let text = with_field(key, value);
            assert!(
                matches!(RestorePoint::parse(&text), Err(RestoreError::OutOfRange { field, .. }) if field == key),
                "{key} was accepted"
            );
        }
    }

    #[test]
    fn test_missing_field() {
        let mut json = serde_json::to_value(sample()).unwrap();
        json.as_object_mut().unwrap().remove("currentDay");
        assert!(matches!(
            RestorePoint::parse(&json.to_string()),
            Err(RestoreError::MissingField("currentDay"))
        ));
    }

    #[test]
    fn test_bad_event_id_kind() {
        let text = with_field("selectedEventId", Value::from(4));
        assert!(matches!(
            RestorePoint::parse(&text),
            Err(RestoreError::InvalidField { field: "selectedEventId", .. })
        ));
    }

    #[test]
    fn test_unknown_event() {
        let dir = TempDir::new().unwrap();
        let mut service = service(&dir);
        service.save(&sample()).unwrap();

        let rundown = Rundown::from_entries([Entry::Event(Event::new("b", 0, 1_000))]);
        let processed = process_rundown(&rundown, &CustomFields::new(), &mut |_| {});
        assert!(matches!(
            service.load_for(&processed.timeline()),
            Err(RestoreError::UnknownEvent(id)) if id == "a"
        ));
    }

    #[tokio::test]
    async fn test_writer_persists_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("restore.json");
        let writer = RestoreWriter::spawn(RestoreService::new(&path));
        writer.save(RestorePoint::default());
        writer.save(sample());
        writer.flush().await;
        assert_eq!(RestoreService::new(&path).load().unwrap(), sample());

        writer.clear();
        writer.close().await;
        assert!(!path.exists());
    }
}
