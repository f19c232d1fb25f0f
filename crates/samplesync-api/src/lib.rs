use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use samplesync_core::{
    AppliedChanges, ApplyDecision, Attachment, AuditSink, Engine, LifecycleState, Record,
    RecordKey, RecordStore, ReconcilePlan, RightsAuthority, Template, TimePoint,
};
use samplesync_store_sqlite::{SequenceAllocator, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterSubjectRequest {
    pub sample_code: String,
    pub type_name: String,
    pub group: Option<String>,
    pub lifecycle: LifecycleState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub subject_codes: Vec<String>,
    pub template: Template,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyRequest {
    pub subject_codes: Vec<String>,
    pub template: Template,
    pub decision: ApplyDecision,
}

/// One row of a rendered plan, ready for a confirmation table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanLine {
    pub action: String,
    pub subject_code: String,
    pub type_name: String,
    pub time_point: Option<TimePoint>,
    /// Empty for records that have not been assigned an identifier yet.
    pub sample_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanPreview {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub lines: Vec<PlanLine>,
    pub denied_subject_codes: Vec<String>,
}

impl PlanPreview {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(|line| line.action == "questionable")
    }

    #[must_use]
    pub fn count(&self, action: &str) -> usize {
        self.lines.iter().filter(|line| line.action == action).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplySummary {
    pub decision: ApplyDecision,
    pub added_codes: Vec<String>,
    pub updated_codes: Vec<String>,
    pub deleted_codes: Vec<String>,
}

/// Permissive rights authority for deployments without per-record ownership.
pub struct OpenRights;

impl RightsAuthority for OpenRights {
    fn can_modify(&self, _record: &Record) -> bool {
        true
    }
}

/// Audit sink that reports committed outcomes through the tracing pipeline.
#[derive(Default)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record_outcome(&mut self, changes: &AppliedChanges) {
        info!(
            added = changes.added.len(),
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            "reconciliation outcome recorded"
        );
    }
}

/// Library facade for a presentation layer: owns the database path and wires
/// the engine with sqlite-backed collaborators per call.
#[derive(Debug, Clone)]
pub struct ReconcilerApi {
    db_path: PathBuf,
}

impl ReconcilerApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    fn mk_engine(
        &self,
        gateway: SqliteStore,
    ) -> Result<Engine<SequenceAllocator, SqliteStore, OpenRights, TracingAudit>> {
        let allocator = SequenceAllocator::open(&self.db_path)?;
        Ok(Engine::new(allocator, gateway, OpenRights, TracingAudit))
    }

    /// Apply pending schema migrations.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn migrate(&self) -> Result<()> {
        self.open_store().map(|_| ())
    }

    /// Register a top-level subject so the reconciler can expand templates
    /// against it.
    ///
    /// # Errors
    /// Returns an error when the subject cannot be persisted.
    pub fn register_subject(&self, input: RegisterSubjectRequest) -> Result<Record> {
        let mut store = self.open_store()?;
        let key = RecordKey::new();
        let mut record = Record {
            key,
            db_id: 0,
            sample_code: input.sample_code,
            type_name: input.type_name,
            metadata: BTreeMap::new(),
            comments: String::new(),
            parent: None,
            template_slot: None,
            attachment: Some(Attachment { subject: key, group: input.group, time_point: None }),
            lifecycle: input.lifecycle,
            row_version: 0,
        };
        record.db_id = store.save_record(&record)?;
        record.row_version = 1;
        Ok(record)
    }

    /// Compute a reconciliation plan and render it as a flat preview without
    /// touching persistence.
    ///
    /// # Errors
    /// Returns an error when a subject code is unknown or reconciliation fails.
    pub fn reconcile_preview(&self, input: &ReconcileRequest) -> Result<PlanPreview> {
        let store = self.open_store()?;
        let records = store.load_records()?;
        let subjects = resolve_subjects(&records, &input.subject_codes)?;
        let engine = self.mk_engine(store)?;

        let plan = engine
            .reconcile(&records, &subjects, &input.template)
            .map_err(|err| anyhow!("reconciliation failed: {err}"))?;
        Ok(render_preview(&plan))
    }

    /// Compute a plan and apply it in one call with a caller-supplied
    /// decision. `Cancel` computes and discards; the other decisions commit.
    ///
    /// # Errors
    /// Returns an error when reconciliation, allocation, or the commit fails.
    pub fn reconcile_and_apply(&self, input: ApplyRequest) -> Result<ApplySummary> {
        let store = self.open_store()?;
        let records = store.load_records()?;
        let subjects = resolve_subjects(&records, &input.subject_codes)?;
        let mut engine = self.mk_engine(store)?;

        let plan = engine
            .reconcile(&records, &subjects, &input.template)
            .map_err(|err| anyhow!("reconciliation failed: {err}"))?;
        let changes = engine
            .apply(plan, input.decision)
            .map_err(|err| anyhow!("apply failed: {err}"))?;

        Ok(ApplySummary {
            decision: changes.decision,
            added_codes: changes.added.iter().map(|record| record.sample_code.clone()).collect(),
            updated_codes: changes
                .updated
                .iter()
                .map(|record| record.sample_code.clone())
                .collect(),
            deleted_codes: changes
                .deleted
                .iter()
                .map(|record| record.sample_code.clone())
                .collect(),
        })
    }
}

fn resolve_subjects(store: &RecordStore, codes: &[String]) -> Result<Vec<RecordKey>> {
    let mut subjects = Vec::new();
    for code in codes {
        let key = store
            .iter()
            .find(|record| record.parent.is_none() && record.sample_code == *code)
            .map(|record| record.key)
            .with_context(|| format!("unknown subject code: {code}"))?;
        subjects.push(key);
    }
    Ok(subjects)
}

fn render_preview(plan: &ReconcilePlan) -> PlanPreview {
    let mut lines = Vec::new();
    let mut push = |action: &str, key: RecordKey| {
        let Some(record) = plan.store.get(key) else {
            return;
        };
        let subject_code = record
            .subject()
            .and_then(|subject| plan.store.get(subject))
            .map_or_else(String::new, |subject| subject.sample_code.clone());
        lines.push(PlanLine {
            action: action.to_string(),
            subject_code,
            type_name: record.type_name.clone(),
            time_point: record.time_point(),
            sample_code: record.sample_code.clone(),
        });
    };

    for &key in &plan.to_add {
        push("add", key);
    }
    for entry in &plan.to_update {
        push("update", entry.record);
    }
    for &key in &plan.to_delete {
        push("delete", key);
    }
    for &key in &plan.to_questionable {
        push("questionable", key);
    }

    let denied_subject_codes = plan
        .denied_subjects
        .iter()
        .filter_map(|&key| plan.store.get(key))
        .map(|record| record.sample_code.clone())
        .collect();

    PlanPreview { generated_at: plan.generated_at, lines, denied_subject_codes }
}
