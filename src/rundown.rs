use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    duration::{DAY, calculate_duration, normalise_to_day},
    metadata::RundownMetadata,
};

pub type EntryId = String;

/// Custom field values keyed by the field's declared key.
pub type CustomValues = BTreeMap<String, String>;

/// Custom fields declared at rundown scope.
pub type CustomFields = BTreeMap<String, CustomField>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomField {
    pub label: String,
    #[serde(default)]
    pub colour: String,
}

/// Which value survives when a linked event's start moves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeStrategy {
    #[default]
    LockDuration,
    LockEnd,
}

/// What happens when an event's timer finishes while playing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndAction {
    #[default]
    None,
    Stop,
    LoadNext,
    PlayNext,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EntryId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub cue: String,
    /// Milliseconds since midnight.
    #[serde(default)]
    pub time_start: i64,
    #[serde(default)]
    pub time_end: i64,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub time_strategy: TimeStrategy,
    #[serde(default)]
    pub link_start: bool,
    #[serde(default = "default_true")]
    pub is_public: bool,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub flag: bool,
    #[serde(default)]
    pub end_action: EndAction,
    #[serde(default)]
    pub custom: CustomValues,

    // Derived by the metadata processor; stored values are overwritten.
    #[serde(default)]
    pub delay: i64,
    #[serde(default)]
    pub gap: i64,
    #[serde(default)]
    pub day_offset: i64,
    #[serde(default)]
    pub parent: Option<EntryId>,
}

impl Event {
    pub fn new(id: impl Into<EntryId>, time_start: i64, time_end: i64) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            cue: String::new(),
            time_start,
            time_end,
            duration: calculate_duration(time_start, time_end),
            time_strategy: TimeStrategy::default(),
            link_start: false,
            is_public: true,
            skip: false,
            flag: false,
            end_action: EndAction::default(),
            custom: CustomValues::new(),
            delay: 0,
            gap: 0,
            day_offset: 0,
            parent: None,
        }
    }

    pub fn is_playable(&self) -> bool {
        !self.skip
    }

    /// Start including any accumulated delay, as a time of day.
    pub fn delayed_start(&self) -> i64 {
        normalise_to_day(self.time_start + self.delay)
    }

    /// End including any accumulated delay, as a time of day.
    pub fn delayed_end(&self) -> i64 {
        normalise_to_day(self.time_end + self.delay)
    }

    /// Start measured from midnight of the rundown's first day.
    pub fn absolute_start(&self) -> i64 {
        self.day_offset * DAY + self.time_start
    }

    /// End measured from midnight of the rundown's first day.
    pub fn absolute_end(&self) -> i64 {
        self.absolute_start() + self.duration
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delay {
    pub id: EntryId,
    pub duration: i64,
    #[serde(default)]
    pub parent: Option<EntryId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: EntryId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub custom: CustomValues,
    #[serde(default)]
    pub parent: Option<EntryId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: EntryId,
    #[serde(default)]
    pub title: String,
    /// Child ids in order.
    #[serde(default)]
    pub entries: Vec<EntryId>,
    #[serde(default)]
    pub target_duration: Option<i64>,
    #[serde(default)]
    pub custom: CustomValues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Entry {
    Event(Event),
    Delay(Delay),
    Milestone(Milestone),
    Group(Group),
    /// Stored content that could not be read as an entry.
    #[serde(skip_deserializing)]
    Malformed { reason: String },
    #[serde(other)]
    Unknown,
}

impl Entry {
    pub fn id(&self) -> Option<&str> {
        match self {
            Entry::Event(event) => Some(&event.id),
            Entry::Delay(delay) => Some(&delay.id),
            Entry::Milestone(milestone) => Some(&milestone.id),
            Entry::Group(group) => Some(&group.id),
            Entry::Malformed { .. } | Entry::Unknown => None,
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Entry::Event(event) => Some(event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rundown {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Top level ids; group children are listed on the group.
    pub order: Vec<EntryId>,
    /// Every id in play order, group children in place.
    #[serde(default)]
    pub flat_order: Vec<EntryId>,
    #[serde(deserialize_with = "entries_lenient")]
    pub entries: BTreeMap<EntryId, Entry>,
    #[serde(default)]
    pub revision: u64,
}

/// Reads each entry on its own so one bad entry cannot reject the rundown.
fn entries_lenient<'de, D>(deserializer: D) -> Result<BTreeMap<EntryId, Entry>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<EntryId, serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(id, value)| {
            let entry = serde_json::from_value(value).unwrap_or_else(|err| Entry::Malformed {
                reason: err.to_string(),
            });
            (id, entry)
        })
        .collect())
}

impl Rundown {
    /// Builds a rundown from top level entries in order.
    pub fn from_entries(entries: impl IntoIterator<Item = Entry>) -> Self {
        let mut rundown = Rundown::default();
        for entry in entries {
            let Some(id) = entry.id().map(str::to_owned) else {
                continue;
            };
            rundown.order.push(id.clone());
            rundown.entries.insert(id, entry);
        }
        rundown
    }

    pub fn bump_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    pub fn event(&self, id: &str) -> Option<&Event> {
        self.entries.get(id).and_then(Entry::as_event)
    }
}

/// On-disk project: a rundown plus the custom fields it may reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RundownFile {
    pub rundown: Rundown,
    #[serde(default)]
    pub custom_fields: CustomFields,
}

/// Read-only view over a processed rundown and its metadata.
#[derive(Debug, Clone, Copy)]
pub struct Timeline<'a> {
    pub rundown: &'a Rundown,
    pub metadata: &'a RundownMetadata,
}

impl<'a> Timeline<'a> {
    pub fn new(rundown: &'a Rundown, metadata: &'a RundownMetadata) -> Self {
        Self { rundown, metadata }
    }

    pub fn event(&self, id: &str) -> Option<&'a Event> {
        self.rundown.event(id)
    }

    /// Event by id, only if it can be loaded.
    pub fn playable_event(&self, id: &str) -> Option<&'a Event> {
        self.event(id).filter(|event| event.is_playable())
    }

    pub fn playable_events(&self) -> impl Iterator<Item = &'a Event> + 'a {
        let rundown = self.rundown;
        self.metadata
            .playable_order
            .iter()
            .filter_map(move |id| rundown.event(id))
    }

    pub fn num_playable(&self) -> usize {
        self.metadata.playable_order.len()
    }

    pub fn playable_index(&self, id: &str) -> Option<usize> {
        self.metadata.playable_order.iter().position(|other| other == id)
    }

    pub fn next_playable(&self, id: &str) -> Option<&'a Event> {
        let index = self.playable_index(id)?;
        let next = self.metadata.playable_order.get(index + 1)?;
        self.event(next)
    }

    pub fn group_of(&self, event: &Event) -> Option<&'a Group> {
        let parent = event.parent.as_deref()?;
        match self.rundown.entries.get(parent)? {
            Entry::Group(group) => Some(group),
            _ => None,
        }
    }

    /// Planned time from the end of `event` to the end of the rundown.
    pub fn remaining_after(&self, event: &Event) -> i64 {
        let Some(last) = self
            .metadata
            .last_event
            .as_deref()
            .and_then(|id| self.event(id))
        else {
            return 0;
        };
        (last.absolute_end() - event.absolute_end()).max(0)
    }
}
