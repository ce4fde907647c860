//! Derived rundown data.
//!
//! [`process_rundown`] folds over the canonical flat order once, threading an
//! [`Accumulator`] through every entry. Each step returns the updated
//! accumulator and the processed entry. The result is always recomputed
//! wholesale; nothing here patches a previous result.
//!
//! Bad input never aborts the pass. Dangling references, unknown entry kinds
//! and id collisions are skipped and reported through the warning callback.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
};

use serde::Serialize;
use tracing::debug;

use crate::{
    duration::{DAY, calculate_duration, end_from_duration},
    rundown::{CustomFields, CustomValues, Delay, Entry, EntryId, Event, Group, Milestone, Rundown, Timeline, TimeStrategy},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RundownMetadata {
    pub total_delay: i64,
    pub total_duration: i64,
    pub total_days: i64,
    pub first_start: Option<i64>,
    pub last_end: Option<i64>,
    pub first_event: Option<EntryId>,
    pub last_event: Option<EntryId>,
    /// Events that can be loaded, in order.
    pub playable_order: Vec<EntryId>,
    /// Every event, skipped ones included.
    pub timed_order: Vec<EntryId>,
    /// Every entry in processing order.
    pub flat_order: Vec<EntryId>,
    pub flags: Vec<EntryId>,
    /// Custom field key to the entries that carry a value for it.
    pub assigned_custom_fields: BTreeMap<String, Vec<EntryId>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarningKind {
    /// An ordering references an id with no entry.
    DanglingReference,
    UnknownType,
    /// The stored entry could not be read.
    Malformed,
    /// The id was already placed, or the entry's own id differs from its key.
    DuplicateId,
    NestedGroup,
    /// The entry is not referenced by any ordering.
    Orphan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessWarning {
    pub entry_id: EntryId,
    pub kind: WarningKind,
}

impl fmt::Display for ProcessWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = &self.entry_id;
        match self.kind {
            WarningKind::DanglingReference => write!(f, "entry `{id}` is referenced but does not exist"),
            WarningKind::UnknownType => write!(f, "entry `{id}` has an unknown type"),
            WarningKind::Malformed => write!(f, "entry `{id}` is malformed"),
            WarningKind::DuplicateId => write!(f, "entry `{id}` collides with an existing id"),
            WarningKind::NestedGroup => write!(f, "group `{id}` cannot be nested in another group"),
            WarningKind::Orphan => write!(f, "entry `{id}` is not part of any ordering"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedRundown {
    pub rundown: Rundown,
    pub metadata: RundownMetadata,
}

impl ProcessedRundown {
    pub fn timeline(&self) -> Timeline<'_> {
        Timeline::new(&self.rundown, &self.metadata)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Previous {
    Event,
    Delay(i64),
    Milestone,
    Group,
}

/// State threaded through the fold.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    previous_playable: Option<Event>,
    previous_entry: Option<Previous>,
    /// Absolute start of the last timed event.
    latest_start: Option<i64>,
    /// Latest absolute finish among timed events so far.
    latest_finish: Option<i64>,
    day: i64,
    total_delay: i64,
    total_duration: i64,
    metadata: RundownMetadata,
}

impl Accumulator {
    /// Processes one entry. `parent` is the owning group, if any.
    pub fn step(mut self, entry: Entry, parent: Option<&str>, fields: &CustomFields) -> (Self, Entry) {
        let processed = match entry {
            Entry::Event(event) => Entry::Event(self.event(event, parent, fields)),
            Entry::Delay(delay) => Entry::Delay(self.delay(delay, parent)),
            Entry::Milestone(milestone) => Entry::Milestone(self.milestone(milestone, parent, fields)),
            Entry::Group(group) => Entry::Group(self.group(group, fields)),
            other @ (Entry::Malformed { .. } | Entry::Unknown) => other,
        };
        if let Some(id) = processed.id() {
            self.metadata.flat_order.push(id.to_owned());
        }
        (self, processed)
    }

    fn assign_fields(&mut self, id: &str, custom: &mut CustomValues, fields: &CustomFields) {
        custom.retain(|key, _| fields.contains_key(key));
        for (key, value) in custom.iter() {
            if value.is_empty() {
                continue;
            }
            self.metadata
                .assigned_custom_fields
                .entry(key.clone())
                .or_default()
                .push(id.to_owned());
        }
    }

    fn event(&mut self, mut event: Event, parent: Option<&str>, fields: &CustomFields) -> Event {
        let linked_to = event
            .link_start
            .then(|| self.previous_playable.as_ref().map(|previous| previous.time_end))
            .flatten();
        match linked_to {
            Some(start) => {
                event.time_start = start;
                match event.time_strategy {
                    TimeStrategy::LockDuration => {
                        event.time_end = end_from_duration(event.time_start, event.duration);
                    }
                    TimeStrategy::LockEnd => {
                        event.duration = calculate_duration(event.time_start, event.time_end);
                    }
                }
            }
            None => {
                // explicit times are authoritative
                event.link_start = false;
                event.duration = calculate_duration(event.time_start, event.time_end);
            }
        }

        let mut custom = std::mem::take(&mut event.custom);
        self.assign_fields(&event.id, &mut custom, fields);
        event.custom = custom;
        event.parent = parent.map(str::to_owned);

        self.metadata.timed_order.push(event.id.clone());
        if event.flag {
            self.metadata.flags.push(event.id.clone());
        }

        if !event.is_playable() {
            event.gap = 0;
            event.day_offset = self.day;
            event.delay = self.total_delay;
            self.previous_entry = Some(Previous::Event);
            return event;
        }

        let mut absolute_start = self.day * DAY + event.time_start;
        if self.latest_start.is_some_and(|latest| absolute_start < latest) {
            self.day += 1;
            absolute_start += DAY;
        }
        event.day_offset = self.day;

        let gap = self
            .latest_finish
            .map_or(0, |finish| absolute_start - finish);
        event.gap = gap;

        if self.latest_finish.is_none() || gap >= 0 {
            self.total_duration += gap + event.duration;
        } else {
            self.total_duration += (event.duration + gap).max(0);
        }

        if gap > 0 && self.total_delay > 0 {
            let preserved = match self.previous_entry {
                Some(Previous::Delay(duration)) if duration > 0 => duration.min(self.total_delay),
                _ => 0,
            };
            let absorbable = self.total_delay - preserved;
            self.total_delay = preserved + (absorbable - gap).max(0);
        }
        event.delay = self.total_delay;

        let absolute_end = absolute_start + event.duration;
        self.latest_finish = Some(self.latest_finish.map_or(absolute_end, |f| f.max(absolute_end)));
        self.latest_start = Some(absolute_start);

        let metadata = &mut self.metadata;
        metadata.playable_order.push(event.id.clone());
        if metadata.first_event.is_none() {
            metadata.first_event = Some(event.id.clone());
            metadata.first_start = Some(event.time_start);
        }
        metadata.last_event = Some(event.id.clone());
        metadata.last_end = Some(event.time_end);

        self.previous_playable = Some(event.clone());
        self.previous_entry = Some(Previous::Event);
        event
    }

    fn delay(&mut self, mut delay: Delay, parent: Option<&str>) -> Delay {
        self.total_delay += delay.duration;
        delay.parent = parent.map(str::to_owned);
        self.previous_entry = Some(Previous::Delay(delay.duration));
        delay
    }

    fn milestone(&mut self, mut milestone: Milestone, parent: Option<&str>, fields: &CustomFields) -> Milestone {
        let mut custom = std::mem::take(&mut milestone.custom);
        self.assign_fields(&milestone.id, &mut custom, fields);
        milestone.custom = custom;
        milestone.parent = parent.map(str::to_owned);
        self.previous_entry = Some(Previous::Milestone);
        milestone
    }

    fn group(&mut self, mut group: Group, fields: &CustomFields) -> Group {
        let mut custom = std::mem::take(&mut group.custom);
        self.assign_fields(&group.id, &mut custom, fields);
        group.custom = custom;
        self.previous_entry = Some(Previous::Group);
        group
    }

    fn finish(mut self) -> RundownMetadata {
        self.metadata.total_delay = self.total_delay;
        self.metadata.total_duration = self.total_duration.max(0);
        self.metadata.total_days = self.day;
        self.metadata
    }
}

/// Looks up an ordering reference, reporting anything unusable.
fn resolve<'a>(
    rundown: &'a Rundown,
    id: &str,
    seen: &mut HashSet<EntryId>,
    warn: &mut dyn FnMut(ProcessWarning),
) -> Option<&'a Entry> {
    let mut report = |kind| {
        warn(ProcessWarning {
            entry_id: id.to_owned(),
            kind,
        })
    };
    let Some(entry) = rundown.entries.get(id) else {
        report(WarningKind::DanglingReference);
        return None;
    };
    if !seen.insert(id.to_owned()) {
        report(WarningKind::DuplicateId);
        return None;
    }
    match entry.id() {
        None => {
            let kind = match entry {
                Entry::Malformed { reason } => {
                    debug!(entry_id = id, reason, "unreadable entry");
                    WarningKind::Malformed
                }
                _ => WarningKind::UnknownType,
            };
            report(kind);
            None
        }
        Some(own) if own != id => {
            report(WarningKind::DuplicateId);
            None
        }
        Some(_) => Some(entry),
    }
}

/// Derives metadata for `rundown` and returns it with a repaired copy of the
/// rundown: orderings hold only resolvable ids, derived event fields are
/// filled in and orphaned entries are dropped.
pub fn process_rundown(
    rundown: &Rundown,
    fields: &CustomFields,
    warn: &mut dyn FnMut(ProcessWarning),
) -> ProcessedRundown {
    let mut acc = Accumulator::default();
    let mut seen = HashSet::new();
    let mut order = Vec::with_capacity(rundown.order.len());
    let mut entries = BTreeMap::new();

    for id in &rundown.order {
        let Some(entry) = resolve(rundown, id, &mut seen, warn) else {
            continue;
        };
        order.push(id.clone());

        let Entry::Group(group) = entry else {
            let (next, processed) = acc.step(entry.clone(), None, fields);
            acc = next;
            entries.insert(id.clone(), processed);
            continue;
        };

        let (next, processed) = acc.step(Entry::Group(group.clone()), None, fields);
        acc = next;
        let Entry::Group(mut processed_group) = processed else {
            continue;
        };

        let mut children = Vec::with_capacity(group.entries.len());
        for child_id in &group.entries {
            let Some(child) = resolve(rundown, child_id, &mut seen, warn) else {
                continue;
            };
            if matches!(child, Entry::Group(_)) {
                warn(ProcessWarning {
                    entry_id: child_id.clone(),
                    kind: WarningKind::NestedGroup,
                });
                continue;
            }
            let (next, processed) = acc.step(child.clone(), Some(id), fields);
            acc = next;
            children.push(child_id.clone());
            entries.insert(child_id.clone(), processed);
        }
        processed_group.entries = children;
        entries.insert(id.clone(), Entry::Group(processed_group));
    }

    for id in rundown.entries.keys() {
        if !seen.contains(id) {
            warn(ProcessWarning {
                entry_id: id.clone(),
                kind: WarningKind::Orphan,
            });
        }
    }

    let metadata = acc.finish();
    let repaired = Rundown {
        id: rundown.id.clone(),
        title: rundown.title.clone(),
        order,
        flat_order: metadata.flat_order.clone(),
        entries,
        revision: rundown.revision,
    };

    ProcessedRundown {
        rundown: repaired,
        metadata,
    }
}
