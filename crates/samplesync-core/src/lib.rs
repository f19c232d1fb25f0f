use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("authorization error: {0}")]
    Authorization(String),
    #[error("identifier allocation error: {0}")]
    Allocation(String),
    #[error("commit error: {0}")]
    Commit(#[from] GatewayError),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GatewayError {
    #[error("concurrent modification of {sample_code}: expected version {expected}, found {found}")]
    Conflict { sample_code: String, expected: i64, found: i64 },
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordKey(pub Ulid);

impl RecordKey {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordKey {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SlotId(pub Ulid);

impl SlotId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SlotId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a sampling act on the study time axis. Ordering is field order:
/// day, then hour, then minute.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default,
)]
pub struct TimePoint {
    pub day: i32,
    pub hour: u8,
    pub minute: u8,
}

impl TimePoint {
    #[must_use]
    pub fn day(day: i32) -> Self {
        Self { day, hour: 0, minute: 0 }
    }
}

impl Display for TimePoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.hour == 0 && self.minute == 0 {
            write!(f, "d{}", self.day)
        } else {
            write!(f, "d{} {:02}:{:02}", self.day, self.hour, self.minute)
        }
    }
}

/// Lifecycle of a top-level subject. `Deceased` subjects lose derived records
/// scheduled after the terminal time point; `Archived` subjects are terminal
/// but keep everything already collected (necropsy-style closure).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    Alive,
    Deceased { at: TimePoint },
    Archived { at: TimePoint },
}

impl LifecycleState {
    #[must_use]
    pub fn is_available(self) -> bool {
        matches!(self, Self::Alive)
    }

    /// Time point after which derived records must not exist, if any.
    #[must_use]
    pub fn removes_after(self) -> Option<TimePoint> {
        match self {
            Self::Deceased { at } => Some(at),
            Self::Alive | Self::Archived { .. } => None,
        }
    }
}

/// Link from a record to the study structure it inherits: owning top-level
/// subject, group membership, and sampling time point. A top-level subject
/// links to itself with no time point.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Attachment {
    pub subject: RecordKey,
    pub group: Option<String>,
    pub time_point: Option<TimePoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Record {
    pub key: RecordKey,
    /// Persistence identity; 0 means unsaved/transient.
    pub db_id: i64,
    /// External-facing identifier; empty until allocated.
    pub sample_code: String,
    pub type_name: String,
    pub metadata: BTreeMap<String, String>,
    pub comments: String,
    pub parent: Option<RecordKey>,
    /// Template node that generated this record; `None` for manual records.
    pub template_slot: Option<SlotId>,
    pub attachment: Option<Attachment>,
    pub lifecycle: LifecycleState,
    /// Optimistic concurrency token checked by the persistence gateway.
    pub row_version: i64,
}

impl Record {
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.db_id > 0
    }

    #[must_use]
    pub fn subject(&self) -> Option<RecordKey> {
        self.attachment.as_ref().map(|a| a.subject)
    }

    #[must_use]
    pub fn time_point(&self) -> Option<TimePoint> {
        self.attachment.as_ref().and_then(|a| a.time_point)
    }

    /// Identifier prefix handed to the allocator: the first three
    /// alphanumeric characters of the type, uppercased, or `SMP`.
    #[must_use]
    pub fn type_prefix(&self) -> String {
        let prefix = self
            .type_name
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(3)
            .collect::<String>()
            .to_ascii_uppercase();
        if prefix.is_empty() {
            "SMP".to_string()
        } else {
            prefix
        }
    }
}

/// Flat, key-addressed record forest. Ownership is single-directional
/// (child holds the parent key); the children index is recomputed on demand.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordStore {
    records: BTreeMap<RecordKey, Record>,
}

impl RecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: Record) -> RecordKey {
        let key = record.key;
        self.records.insert(key, record);
        key
    }

    pub fn remove(&mut self, key: RecordKey) -> Option<Record> {
        self.records.remove(&key)
    }

    #[must_use]
    pub fn get(&self, key: RecordKey) -> Option<&Record> {
        self.records.get(&key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when the key is unknown.
    pub fn record(&self, key: RecordKey) -> Result<&Record, EngineError> {
        self.records
            .get(&key)
            .ok_or_else(|| EngineError::Validation(format!("unknown record key {key}")))
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when the key is unknown.
    pub fn record_mut(&mut self, key: RecordKey) -> Result<&mut Record, EngineError> {
        self.records
            .get_mut(&key)
            .ok_or_else(|| EngineError::Validation(format!("unknown record key {key}")))
    }

    #[must_use]
    pub fn children_index(&self) -> BTreeMap<RecordKey, Vec<RecordKey>> {
        let mut index: BTreeMap<RecordKey, Vec<RecordKey>> = BTreeMap::new();
        for record in self.records.values() {
            if let Some(parent) = record.parent {
                index.entry(parent).or_default().push(record.key);
            }
        }
        index
    }

    #[must_use]
    pub fn children_of(&self, key: RecordKey) -> Vec<RecordKey> {
        self.records
            .values()
            .filter(|record| record.parent == Some(key))
            .map(|record| record.key)
            .collect()
    }

    /// The record plus all its descendants, parents before children.
    #[must_use]
    pub fn subtree(&self, key: RecordKey) -> Vec<RecordKey> {
        let index = self.children_index();
        let mut ordered = Vec::new();
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            if !self.records.contains_key(&current) {
                continue;
            }
            ordered.push(current);
            if let Some(children) = index.get(&current) {
                for &child in children.iter().rev() {
                    stack.push(child);
                }
            }
        }
        ordered
    }

    /// Number of ancestors above the record. Roots are depth 0.
    #[must_use]
    pub fn depth(&self, key: RecordKey) -> usize {
        let mut depth = 0;
        let mut current = key;
        while let Some(record) = self.records.get(&current) {
            match record.parent {
                Some(parent) if depth < self.records.len() => {
                    depth += 1;
                    current = parent;
                }
                _ => break,
            }
        }
        depth
    }

    /// Persisted or transient records attached to the subject, excluding the
    /// subject record itself.
    #[must_use]
    pub fn attached_to(&self, subject: RecordKey) -> Vec<RecordKey> {
        self.records
            .values()
            .filter(|record| record.key != subject && record.subject() == Some(subject))
            .map(|record| record.key)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TemplateSlot {
    pub id: SlotId,
    pub type_name: String,
    pub metadata: BTreeMap<String, String>,
    pub comments: String,
    /// Parent slot inside the template tree; derived records nest the same way.
    pub parent: Option<SlotId>,
}

/// One sampling prescription: which root slots are collected for which
/// groups at which time point. `group: None` applies to every group.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScheduleEntry {
    pub group: Option<String>,
    pub time_point: TimePoint,
    pub slots: Vec<SlotId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Template {
    pub name: String,
    /// Per-study switch: when off, reconciliation is a no-op.
    pub synchronize: bool,
    pub slots: Vec<TemplateSlot>,
    pub schedule: Vec<ScheduleEntry>,
}

impl Template {
    /// # Errors
    /// Returns [`EngineError::Validation`] when a slot has no type, a slot
    /// parent is unknown, or the schedule references an unknown slot.
    pub fn validate(&self) -> Result<(), EngineError> {
        let known: BTreeSet<SlotId> = self.slots.iter().map(|slot| slot.id).collect();
        if known.len() != self.slots.len() {
            return Err(EngineError::Validation(format!(
                "template {} contains duplicate slot ids",
                self.name
            )));
        }
        for slot in &self.slots {
            if slot.type_name.trim().is_empty() {
                return Err(EngineError::Validation(format!(
                    "template {} has a slot with no type",
                    self.name
                )));
            }
            if let Some(parent) = slot.parent {
                if !known.contains(&parent) {
                    return Err(EngineError::Validation(format!(
                        "template {} slot {} references unknown parent {parent}",
                        self.name, slot.id
                    )));
                }
            }
        }
        for entry in &self.schedule {
            for slot in &entry.slots {
                if !known.contains(slot) {
                    return Err(EngineError::Validation(format!(
                        "template {} schedule references unknown slot {slot}",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn slot(&self, id: SlotId) -> Option<&TemplateSlot> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    #[must_use]
    pub fn child_slots(&self, id: SlotId) -> Vec<&TemplateSlot> {
        self.slots.iter().filter(|slot| slot.parent == Some(id)).collect()
    }
}

/// Comparison key recognizing "the same logical record" across regenerations.
/// Only meaningful between records under the same top-level subject.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct SignatureKey {
    pub slot: SlotId,
    pub type_name: String,
    pub payload: String,
}

/// Canonical metadata-and-comments form: sorted keys, collapsed whitespace,
/// empty values dropped.
#[must_use]
pub fn normalized_payload(metadata: &BTreeMap<String, String>, comments: &str) -> String {
    let mut parts: Vec<String> = metadata
        .iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .map(|(key, value)| format!("{}={}", collapse_whitespace(key), collapse_whitespace(value)))
        .collect();
    let comments = collapse_whitespace(comments);
    if !comments.is_empty() {
        parts.push(comments);
    }
    parts.join("; ")
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Derive the signature of a record. Manual records (no template slot) have
/// none and therefore never match anything.
#[must_use]
pub fn signature(record: &Record) -> Option<SignatureKey> {
    let slot = record.template_slot?;
    Some(SignatureKey {
        slot,
        type_name: record.type_name.clone(),
        payload: normalized_payload(&record.metadata, &record.comments),
    })
}

/// Expand the template against the subject roster, returning the full needed
/// set. Entries already satisfied by a persisted record reuse that record's
/// key; unsatisfied entries are inserted as transient records (`db_id` 0).
///
/// # Errors
/// Returns [`EngineError::Validation`] when the template is malformed or a
/// subject key is unknown or not a root record.
pub fn expand_template(
    store: &mut RecordStore,
    subjects: &[RecordKey],
    template: &Template,
) -> Result<Vec<RecordKey>, EngineError> {
    template.validate()?;

    let mut needed = Vec::new();
    for &subject in subjects {
        let subject_record = store.record(subject)?;
        if subject_record.parent.is_some() {
            return Err(EngineError::Validation(format!(
                "record {} is not a top-level subject",
                subject_record.sample_code
            )));
        }
        let group = subject_record.attachment.as_ref().and_then(|a| a.group.clone());

        // Existing counterparts under this subject, keyed by structural identity.
        let mut satisfied: BTreeMap<(SlotId, TimePoint, String, String), Vec<RecordKey>> =
            BTreeMap::new();
        for key in store.attached_to(subject) {
            let record = store.record(key)?;
            if !record.is_persisted() {
                continue;
            }
            let (Some(slot), Some(time_point)) = (record.template_slot, record.time_point()) else {
                continue;
            };
            let identity = (
                slot,
                time_point,
                record.type_name.clone(),
                normalized_payload(&record.metadata, &record.comments),
            );
            satisfied.entry(identity).or_default().push(key);
        }

        for entry in &template.schedule {
            if entry.group.is_some() && entry.group != group {
                continue;
            }
            for &slot_id in &entry.slots {
                expand_slot(
                    store,
                    template,
                    subject,
                    group.as_deref(),
                    entry.time_point,
                    slot_id,
                    subject,
                    &mut satisfied,
                    &mut needed,
                )?;
            }
        }
    }
    debug!(needed = needed.len(), "template expansion complete");
    Ok(needed)
}

#[allow(clippy::too_many_arguments)]
fn expand_slot(
    store: &mut RecordStore,
    template: &Template,
    subject: RecordKey,
    group: Option<&str>,
    time_point: TimePoint,
    slot_id: SlotId,
    parent: RecordKey,
    satisfied: &mut BTreeMap<(SlotId, TimePoint, String, String), Vec<RecordKey>>,
    needed: &mut Vec<RecordKey>,
) -> Result<(), EngineError> {
    let slot = template
        .slot(slot_id)
        .ok_or_else(|| EngineError::Validation(format!("unknown template slot {slot_id}")))?
        .clone();

    let identity = (
        slot_id,
        time_point,
        slot.type_name.clone(),
        normalized_payload(&slot.metadata, &slot.comments),
    );
    let key = match satisfied.get_mut(&identity).and_then(Vec::pop) {
        Some(existing) => existing,
        None => store.insert(Record {
            key: RecordKey::new(),
            db_id: 0,
            sample_code: String::new(),
            type_name: slot.type_name.clone(),
            metadata: slot.metadata.clone(),
            comments: slot.comments.clone(),
            parent: Some(parent),
            template_slot: Some(slot_id),
            attachment: Some(Attachment {
                subject,
                group: group.map(str::to_string),
                time_point: Some(time_point),
            }),
            lifecycle: LifecycleState::Alive,
            row_version: 0,
        }),
    };
    needed.push(key);

    let child_ids: Vec<SlotId> = template.child_slots(slot_id).iter().map(|s| s.id).collect();
    for child in child_ids {
        expand_slot(store, template, subject, group, time_point, child, key, satisfied, needed)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DiffOutcome {
    pub to_add: Vec<RecordKey>,
    pub to_delete: Vec<RecordKey>,
}

impl DiffOutcome {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_delete.is_empty()
    }
}

/// Classify needed and existing records into add and delete candidates.
///
/// Needed records under a deceased subject whose time point falls after the
/// terminal time point are deleted if persisted and skipped otherwise. Stale
/// persisted records (their slot/time-point pair no longer in the needed set)
/// become delete candidates, except records outside template scope: no group,
/// no time point, or no slot back-reference.
///
/// # Errors
/// Returns [`EngineError::Validation`] when a referenced key is unknown.
pub fn diff_records(
    store: &RecordStore,
    needed: &[RecordKey],
    subjects: &[RecordKey],
) -> Result<DiffOutcome, EngineError> {
    let needed_set: BTreeSet<RecordKey> = needed.iter().copied().collect();
    let mut outcome = DiffOutcome::default();

    for &key in needed {
        let record = store.record(key)?;
        let subject_key = record
            .subject()
            .ok_or_else(|| EngineError::Validation(format!("needed record {key} has no subject")))?;
        let subject = store.record(subject_key)?;
        let removed = match (subject.lifecycle.removes_after(), record.time_point()) {
            (Some(terminal), Some(time_point)) => time_point > terminal,
            _ => false,
        };
        if removed {
            if record.is_persisted() {
                outcome.to_delete.push(key);
            }
            // Never regenerated: transient entries are simply dropped.
        } else if !record.is_persisted() {
            outcome.to_add.push(key);
        }
    }

    for &subject in subjects {
        if !store.record(subject)?.lifecycle.is_available() {
            continue;
        }
        for key in store.attached_to(subject) {
            let record = store.record(key)?;
            if !record.is_persisted() || needed_set.contains(&key) {
                continue;
            }
            let Some(attachment) = record.attachment.as_ref() else {
                continue;
            };
            if attachment.group.is_none()
                || attachment.time_point.is_none()
                || record.template_slot.is_none()
            {
                // Reserve samples and manual records are out of template scope.
                continue;
            }
            outcome.to_delete.push(key);
        }
    }

    debug!(
        to_add = outcome.to_add.len(),
        to_delete = outcome.to_delete.len(),
        "diff classification complete"
    );
    Ok(outcome)
}

/// A detected move: `record` is the surviving persisted record carried into
/// the update bucket; `absorbed` is the transient add candidate it replaced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct MoveEntry {
    pub record: RecordKey,
    pub absorbed: RecordKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub store: RecordStore,
    pub to_add: Vec<RecordKey>,
    pub to_update: Vec<MoveEntry>,
    pub to_delete: Vec<RecordKey>,
    pub to_questionable: Vec<RecordKey>,
    /// Subjects excluded by the rights authority.
    pub denied_subjects: Vec<RecordKey>,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

impl ReconcilePlan {
    /// True when the plan prescribes no action. Questionable records alone do
    /// not make a plan actionable: they are left untouched by definition.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    /// Structural description of the plan, independent of transient keys.
    /// Two reconcile runs over the same input produce equal fingerprints.
    #[must_use]
    pub fn fingerprint(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for &key in &self.to_add {
            lines.push(self.describe("add", key));
        }
        for entry in &self.to_update {
            lines.push(self.describe("update", entry.record));
        }
        for &key in &self.to_delete {
            lines.push(self.describe("delete", key));
        }
        for &key in &self.to_questionable {
            lines.push(self.describe("questionable", key));
        }
        lines.sort_unstable();
        lines
    }

    fn describe(&self, bucket: &str, key: RecordKey) -> String {
        let Some(record) = self.store.get(key) else {
            return format!("{bucket} <missing {key}>");
        };
        let subject = record
            .subject()
            .and_then(|s| self.store.get(s))
            .map_or_else(String::new, |s| s.sample_code.clone());
        let time_point = record.time_point().map_or_else(String::new, |tp| tp.to_string());
        format!(
            "{bucket} subject={subject} type={} tp={time_point} payload={}",
            record.type_name,
            normalized_payload(&record.metadata, &record.comments)
        )
    }

    fn sort_buckets(&mut self) {
        let store = self.store.clone();
        let sort_key = |key: RecordKey| {
            let record = store.get(key);
            let subject = record
                .and_then(Record::subject)
                .and_then(|s| store.get(s))
                .map_or_else(String::new, |s| s.sample_code.clone());
            let time_point = record.and_then(Record::time_point).unwrap_or_default();
            let type_name = record.map_or_else(String::new, |r| r.type_name.clone());
            (subject, time_point, type_name, key)
        };
        self.to_add.sort_by_key(|&key| sort_key(key));
        self.to_delete.sort_by_key(|&key| sort_key(key));
        self.to_questionable.sort_by_key(|&key| sort_key(key));
        self.to_update.sort_by_key(|entry| sort_key(entry.record));
    }
}

struct MoveResolution {
    to_add: Vec<RecordKey>,
    to_update: Vec<MoveEntry>,
    to_delete: Vec<RecordKey>,
    to_questionable: Vec<RecordKey>,
}

/// Pair delete candidates with add candidates under the same subject by
/// signature. Exactly one match is a move; more than one is ambiguous and
/// parks every involved record in the questionable bucket. The engine never
/// guesses between candidates.
fn resolve_moves(store: &mut RecordStore, diff: DiffOutcome) -> Result<MoveResolution, EngineError> {
    let mut adds_by_subject: BTreeMap<RecordKey, Vec<RecordKey>> = BTreeMap::new();
    for &key in &diff.to_add {
        if let Some(subject) = store.record(key)?.subject() {
            adds_by_subject.entry(subject).or_default().push(key);
        }
    }

    let mut updates: Vec<MoveEntry> = Vec::new();
    let mut consumed: BTreeSet<RecordKey> = BTreeSet::new();
    let mut moved: BTreeSet<RecordKey> = BTreeSet::new();
    let mut questionable: BTreeSet<RecordKey> = BTreeSet::new();

    for &delete_key in &diff.to_delete {
        let delete_record = store.record(delete_key)?;
        let Some(delete_signature) = signature(delete_record) else {
            continue;
        };
        let Some(subject) = delete_record.subject() else {
            continue;
        };

        let mut matches = Vec::new();
        for &add_key in adds_by_subject.get(&subject).into_iter().flatten() {
            if consumed.contains(&add_key) {
                continue;
            }
            if signature(store.record(add_key)?).as_ref() == Some(&delete_signature) {
                matches.push(add_key);
            }
        }

        match matches.as_slice() {
            [] => {}
            &[add_key] => {
                let new_time_point = store.record(add_key)?.time_point();
                if let Some(attachment) = store.record_mut(delete_key)?.attachment.as_mut() {
                    attachment.time_point = new_time_point;
                }
                for child in store.children_of(add_key) {
                    store.record_mut(child)?.parent = Some(delete_key);
                }
                store.remove(add_key);
                consumed.insert(add_key);
                moved.insert(delete_key);
                updates.push(MoveEntry { record: delete_key, absorbed: add_key });
            }
            _ => {
                questionable.insert(delete_key);
                questionable.extend(matches.iter().copied());
            }
        }
    }

    let to_add = diff
        .to_add
        .iter()
        .copied()
        .filter(|key| !consumed.contains(key) && !questionable.contains(key))
        .collect();
    let to_delete = diff
        .to_delete
        .iter()
        .copied()
        .filter(|key| !moved.contains(key) && !questionable.contains(key))
        .collect();

    Ok(MoveResolution {
        to_add,
        to_update: updates,
        to_delete,
        to_questionable: questionable.into_iter().collect(),
    })
}

/// One colliding pair handed to [`resolve_identifier_conflicts`]: a record
/// being imported with an externally supplied identifier, and the persisted
/// record already carrying that identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConflictPair {
    pub incoming: RecordKey,
    pub conflict: RecordKey,
}

/// Re-parent incoming records so externally supplied identifiers stay unique.
///
/// Three cases per pair: a conflict with no owning subject becomes the
/// incoming record's parent directly; a conflict owned by a subject but
/// without a parent is demoted under a freshly synthesized ancestor (a bare
/// clone of its type, owned by nobody, identified by the colliding code plus
/// a trailing underscore) and re-coded with a sibling suffix; a conflict
/// that already has a parent shares that parent with the incoming record.
/// The incoming record always receives the next free sibling code under its
/// final parent. No record in the output carries a code still held by
/// another row, so the ordered output persists under a unique-code
/// constraint.
///
/// Returns every touched record, parents before children, ready for a
/// referential-integrity-checking gateway.
///
/// # Errors
/// Returns [`EngineError::Validation`] when a referenced key is unknown.
pub fn resolve_identifier_conflicts(
    store: &mut RecordStore,
    pairs: &[ConflictPair],
) -> Result<Vec<RecordKey>, EngineError> {
    let mut touched: BTreeSet<RecordKey> = BTreeSet::new();

    for pair in pairs {
        let conflict = store.record(pair.conflict)?;
        let final_parent = match (conflict.subject(), conflict.parent) {
            (None, _) => pair.conflict,
            (Some(_), Some(parent)) => parent,
            (Some(_), None) => {
                let ancestor_key = RecordKey::new();
                let ancestor = Record {
                    key: ancestor_key,
                    db_id: 0,
                    // The persisted conflict row still holds the base code
                    // when the ancestor is inserted.
                    sample_code: format!("{}_", conflict.sample_code),
                    type_name: conflict.type_name.clone(),
                    metadata: BTreeMap::new(),
                    comments: String::new(),
                    parent: None,
                    template_slot: None,
                    attachment: None,
                    lifecycle: LifecycleState::Alive,
                    row_version: 0,
                };
                store.insert(ancestor);
                store.record_mut(pair.conflict)?.parent = Some(ancestor_key);
                let demoted_code = next_sibling_code(store, ancestor_key)?;
                store.record_mut(pair.conflict)?.sample_code = demoted_code;
                touched.insert(ancestor_key);
                touched.insert(pair.conflict);
                ancestor_key
            }
        };

        store.record_mut(pair.incoming)?.parent = Some(final_parent);
        let code = next_sibling_code(store, final_parent)?;
        store.record_mut(pair.incoming)?.sample_code = code;
        touched.insert(pair.incoming);
    }

    let mut ordered: Vec<RecordKey> = touched.into_iter().collect();
    ordered.sort_by_key(|&key| (store.depth(key), key));
    Ok(ordered)
}

/// Next free `<base>.<n>` suffix among the parent's children, where the base
/// is the parent's code without any trailing underscore (synthetic ancestors
/// carry one). The demoted record itself counts, so allocation never reuses
/// a suffix.
fn next_sibling_code(store: &RecordStore, parent: RecordKey) -> Result<String, EngineError> {
    let base = store.record(parent)?.sample_code.trim_end_matches('_').to_string();
    if base.is_empty() {
        return Err(EngineError::Validation(format!(
            "record {parent} has no identifier to derive sibling codes from"
        )));
    }
    let mut highest = 0u32;
    for child in store.children_of(parent) {
        let code = &store.record(child)?.sample_code;
        if let Some(suffix) = code.strip_prefix(&base).and_then(|rest| rest.strip_prefix('.')) {
            if let Ok(value) = suffix.parse::<u32>() {
                highest = highest.max(value);
            }
        }
    }
    Ok(format!("{base}.{}", highest + 1))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyDecision {
    Proceed,
    ProceedWithoutDeletions,
    Cancel,
}

/// Batch handed to the persistence gateway. `saves` are ordered parents
/// before children; `deletes` children before parents (full subtrees).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistBatch {
    pub saves: Vec<Record>,
    pub deletes: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedChanges {
    pub decision: ApplyDecision,
    pub added: Vec<Record>,
    pub updated: Vec<Record>,
    pub deleted: Vec<Record>,
    /// The record forest as persisted after the transaction.
    pub store: RecordStore,
}

impl AppliedChanges {
    fn none(decision: ApplyDecision, store: RecordStore) -> Self {
        Self { decision, added: Vec::new(), updated: Vec::new(), deleted: Vec::new(), store }
    }
}

pub trait IdentifierAllocator {
    /// Issue the next external identifier for the given type prefix.
    ///
    /// # Errors
    /// Returns [`EngineError::Allocation`] when the identifier source fails.
    fn next_code(&mut self, type_prefix: &str) -> Result<String, EngineError>;
}

pub trait PersistenceGateway {
    /// Persist the batch atomically, returning assigned persistence ids for
    /// every save. Partial application is forbidden: any failure must leave
    /// storage untouched.
    ///
    /// # Errors
    /// Returns [`GatewayError`] when the transaction cannot commit.
    fn apply_batch(&mut self, batch: &PersistBatch)
        -> Result<BTreeMap<RecordKey, i64>, GatewayError>;
}

pub trait RightsAuthority {
    fn can_modify(&self, record: &Record) -> bool;
}

pub trait AuditSink {
    fn record_outcome(&mut self, changes: &AppliedChanges);
}

/// The reconciliation engine. Collaborators are injected explicitly; the
/// engine holds no process-wide state beyond its own id memoization.
pub struct Engine<A, G, R, S> {
    allocator: A,
    gateway: G,
    rights: R,
    audit: S,
    issued_codes: BTreeMap<(String, RecordKey), String>,
}

impl<A, G, R, S> Engine<A, G, R, S>
where
    A: IdentifierAllocator,
    G: PersistenceGateway,
    R: RightsAuthority,
    S: AuditSink,
{
    pub fn new(allocator: A, gateway: G, rights: R, audit: S) -> Self {
        Self { allocator, gateway, rights, audit, issued_codes: BTreeMap::new() }
    }

    /// Compute the reconciliation plan for the given subjects against the
    /// template. Pure with respect to persistence: the input store is cloned
    /// and the plan owns its working copy.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for a malformed template and
    /// [`EngineError::Authorization`] when every requested subject is denied.
    pub fn reconcile(
        &self,
        store: &RecordStore,
        subjects: &[RecordKey],
        template: &Template,
    ) -> Result<ReconcilePlan, EngineError> {
        template.validate()?;
        let mut working = store.clone();
        let generated_at = OffsetDateTime::now_utc();

        let empty_plan = |working: RecordStore, denied: Vec<RecordKey>| ReconcilePlan {
            store: working,
            to_add: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
            to_questionable: Vec::new(),
            denied_subjects: denied,
            generated_at,
        };

        if !template.synchronize {
            debug!(template = %template.name, "synchronization disabled, nothing to do");
            return Ok(empty_plan(working, Vec::new()));
        }

        let mut allowed = Vec::new();
        let mut denied = Vec::new();
        for &subject in subjects {
            if self.rights.can_modify(working.record(subject)?) {
                allowed.push(subject);
            } else {
                denied.push(subject);
            }
        }
        if allowed.is_empty() && !subjects.is_empty() {
            return Err(EngineError::Authorization(
                "no modifiable subjects in reconciliation scope".to_string(),
            ));
        }

        let needed = expand_template(&mut working, &allowed, template)?;
        let diff = diff_records(&working, &needed, &allowed)?;
        if diff.is_empty() {
            info!(template = %template.name, "records already match the template");
            return Ok(empty_plan(working, denied));
        }

        let resolution = resolve_moves(&mut working, diff)?;
        debug!(
            to_add = resolution.to_add.len(),
            to_update = resolution.to_update.len(),
            to_delete = resolution.to_delete.len(),
            to_questionable = resolution.to_questionable.len(),
            "move resolution complete"
        );

        let mut plan = ReconcilePlan {
            store: working,
            to_add: resolution.to_add,
            to_update: resolution.to_update,
            to_delete: resolution.to_delete,
            to_questionable: resolution.to_questionable,
            denied_subjects: denied,
            generated_at,
        };
        plan.sort_buckets();
        Ok(plan)
    }

    /// Apply a confirmed plan: allocate identifiers for new records, then
    /// persist adds, updates, and (unless skipped) cascading deletes in one
    /// transaction. Rolls back completely on any failure. The audit sink is
    /// informed after the commit, outside the transaction.
    ///
    /// # Errors
    /// Returns [`EngineError::Allocation`] when identifier allocation fails
    /// and [`EngineError::Commit`] when the gateway rejects the transaction.
    pub fn apply(
        &mut self,
        mut plan: ReconcilePlan,
        decision: ApplyDecision,
    ) -> Result<AppliedChanges, EngineError> {
        if plan.is_empty() {
            return Ok(AppliedChanges::none(decision, plan.store));
        }

        for &key in &plan.to_add {
            let prefix = plan.store.record(key)?.type_prefix();
            if !plan.store.record(key)?.sample_code.is_empty() {
                continue;
            }
            let memo_key = (prefix.clone(), key);
            let code = match self.issued_codes.get(&memo_key) {
                Some(code) => code.clone(),
                None => {
                    let code = self.allocator.next_code(&prefix)?;
                    self.issued_codes.insert(memo_key, code.clone());
                    code
                }
            };
            plan.store.record_mut(key)?.sample_code = code;
        }

        if decision == ApplyDecision::Cancel {
            debug!("plan cancelled, discarding");
            return Ok(AppliedChanges::none(decision, plan.store));
        }
        let skip_deletions = decision == ApplyDecision::ProceedWithoutDeletions;

        let mut save_keys: Vec<RecordKey> = plan.to_add.clone();
        save_keys.extend(plan.to_update.iter().map(|entry| entry.record));
        save_keys.sort_by_key(|&key| (plan.store.depth(key), key));
        let mut saves = Vec::new();
        for key in save_keys {
            saves.push(plan.store.record(key)?.clone());
        }

        let mut delete_keys: Vec<RecordKey> = Vec::new();
        let mut seen: BTreeSet<RecordKey> = BTreeSet::new();
        if !skip_deletions {
            for &key in &plan.to_delete {
                let mut subtree = plan.store.subtree(key);
                subtree.reverse();
                for k in subtree {
                    if seen.insert(k) {
                        delete_keys.push(k);
                    }
                }
            }
        }
        let mut deletes = Vec::new();
        for &key in &delete_keys {
            deletes.push(plan.store.record(key)?.clone());
        }

        let batch = PersistBatch { saves, deletes };
        let assigned = self.gateway.apply_batch(&batch)?;
        info!(
            saved = batch.saves.len(),
            deleted = batch.deletes.len(),
            "reconciliation plan committed"
        );

        for (key, db_id) in &assigned {
            if let Ok(record) = plan.store.record_mut(*key) {
                record.db_id = *db_id;
                record.row_version += 1;
            }
        }
        for key in delete_keys {
            plan.store.remove(key);
        }

        let mut added = Vec::new();
        for &key in &plan.to_add {
            added.push(plan.store.record(key)?.clone());
        }
        let mut updated = Vec::new();
        for entry in &plan.to_update {
            updated.push(plan.store.record(entry.record)?.clone());
        }
        let deleted = if skip_deletions { Vec::new() } else { batch.deletes.clone() };

        let changes =
            AppliedChanges { decision, added, updated, deleted, store: plan.store };
        self.audit.record_outcome(&changes);
        Ok(changes)
    }
}
