use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use samplesync_core::{
    Attachment, EngineError, GatewayError, IdentifierAllocator, LifecycleState, PersistBatch,
    PersistenceGateway, Record, RecordKey, RecordStore, SlotId, TimePoint,
};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS sample_records (
  db_id INTEGER PRIMARY KEY AUTOINCREMENT,
  record_key TEXT NOT NULL UNIQUE,
  sample_code TEXT NOT NULL UNIQUE,
  type_name TEXT NOT NULL,
  metadata_json TEXT NOT NULL,
  comments TEXT NOT NULL,
  parent_key TEXT REFERENCES sample_records(record_key),
  template_slot TEXT,
  subject_key TEXT REFERENCES sample_records(record_key),
  group_name TEXT,
  time_point_json TEXT,
  lifecycle_json TEXT NOT NULL,
  row_version INTEGER NOT NULL CHECK (row_version >= 1),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS id_sequences (
  prefix TEXT PRIMARY KEY,
  next_value INTEGER NOT NULL CHECK (next_value >= 1)
);

CREATE INDEX IF NOT EXISTS idx_sample_records_parent ON sample_records(parent_key);
CREATE INDEX IF NOT EXISTS idx_sample_records_subject ON sample_records(subject_key);
CREATE INDEX IF NOT EXISTS idx_sample_records_slot ON sample_records(template_slot);
";

/// SQLite-backed persistence gateway for sample records. One connection,
/// one writer; concurrent readers are served through WAL.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a SQLite-backed record store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Current recorded schema version, 0 for a fresh database.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_version(&self) -> Result<i64> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        current_schema_version(&self.conn)
    }

    /// Insert one record outside the batch path. Used to register top-level
    /// subjects before reconciliation; the record must carry a sample code.
    ///
    /// # Errors
    /// Returns an error when required fields are empty or the insert fails.
    pub fn save_record(&mut self, record: &Record) -> Result<i64> {
        validate_record(record).map_err(|err| anyhow!("record validation failed: {err}"))?;
        if record.db_id != 0 {
            return Err(anyhow!(
                "record {} is already persisted with db id {}",
                record.sample_code,
                record.db_id
            ));
        }

        let tx = self.conn.transaction().context("failed to start transaction")?;
        insert_record(&tx, record).map_err(|err| anyhow!("{err}"))?;
        let db_id = tx.last_insert_rowid();
        tx.commit().context("failed to commit record insert")?;
        Ok(db_id)
    }

    /// Load every persisted record into an in-memory store, keyed by the
    /// stored record keys so parent and subject links survive the round trip.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn load_records(&self) -> Result<RecordStore> {
        let mut stmt = self.conn.prepare(
            "SELECT
                db_id, record_key, sample_code, type_name, metadata_json, comments,
                parent_key, template_slot, subject_key, group_name, time_point_json,
                lifecycle_json, row_version
             FROM sample_records
             ORDER BY db_id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut store = RecordStore::new();

        while let Some(row) = rows.next()? {
            let record_key_raw: String = row.get(1)?;
            let metadata_json: String = row.get(4)?;
            let parent_raw: Option<String> = row.get(6)?;
            let slot_raw: Option<String> = row.get(7)?;
            let subject_raw: Option<String> = row.get(8)?;
            let group_name: Option<String> = row.get(9)?;
            let time_point_json: Option<String> = row.get(10)?;
            let lifecycle_json: String = row.get(11)?;

            let key = RecordKey(parse_ulid(&record_key_raw)?);
            let parent = parent_raw.as_deref().map(parse_ulid).transpose()?.map(RecordKey);
            let template_slot = slot_raw.as_deref().map(parse_ulid).transpose()?.map(SlotId);
            let subject = subject_raw.as_deref().map(parse_ulid).transpose()?.map(RecordKey);
            let time_point: Option<TimePoint> = time_point_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("failed to deserialize time point")?;
            let lifecycle: LifecycleState = serde_json::from_str(&lifecycle_json)
                .context("failed to deserialize lifecycle state")?;

            store.insert(Record {
                key,
                db_id: row.get(0)?,
                sample_code: row.get(2)?,
                type_name: row.get(3)?,
                metadata: serde_json::from_str(&metadata_json)
                    .context("failed to deserialize metadata")?,
                comments: row.get(5)?,
                parent,
                template_slot,
                attachment: subject.map(|subject| Attachment {
                    subject,
                    group: group_name.clone(),
                    time_point,
                }),
                lifecycle,
                row_version: row.get(12)?,
            });
        }

        Ok(store)
    }

    /// Number of persisted records.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn record_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sample_records", [], |row| row.get(0))
            .context("failed to count sample records")?;
        usize::try_from(count).context("record count out of range")
    }
}

impl PersistenceGateway for SqliteStore {
    /// Persist the whole batch in one transaction: saves first in the order
    /// given (parents before children), then deletes (children before
    /// parents). Updates carry the expected `row_version`; a mismatch aborts
    /// and rolls back everything.
    fn apply_batch(
        &mut self,
        batch: &PersistBatch,
    ) -> Result<BTreeMap<RecordKey, i64>, GatewayError> {
        for record in &batch.saves {
            validate_record(record)?;
        }

        let tx = self.conn.transaction().map_err(storage_error)?;
        let mut assigned = BTreeMap::new();

        for record in &batch.saves {
            if record.db_id == 0 {
                insert_record(&tx, record)?;
                assigned.insert(record.key, tx.last_insert_rowid());
            } else {
                update_record(&tx, record)?;
                assigned.insert(record.key, record.db_id);
            }
        }

        for record in &batch.deletes {
            if record.db_id == 0 {
                continue;
            }
            tx.execute("DELETE FROM sample_records WHERE db_id = ?1", params![record.db_id])
                .map_err(storage_error)?;
        }

        tx.commit().map_err(storage_error)?;
        Ok(assigned)
    }
}

fn validate_record(record: &Record) -> Result<(), GatewayError> {
    if record.sample_code.trim().is_empty() {
        return Err(GatewayError::Storage(format!(
            "record {} has no sample code",
            record.key
        )));
    }
    if record.type_name.trim().is_empty() {
        return Err(GatewayError::Storage(format!(
            "record {} has no type",
            record.sample_code
        )));
    }
    Ok(())
}

fn insert_record(tx: &rusqlite::Transaction<'_>, record: &Record) -> Result<(), GatewayError> {
    let now = now_rfc3339()?;
    tx.execute(
        "INSERT INTO sample_records(
            record_key, sample_code, type_name, metadata_json, comments,
            parent_key, template_slot, subject_key, group_name, time_point_json,
            lifecycle_json, row_version, created_at, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14
        )",
        params![
            record.key.to_string(),
            record.sample_code,
            record.type_name,
            to_json(&record.metadata)?,
            record.comments,
            record.parent.map(|key| key.to_string()),
            record.template_slot.map(|slot| slot.to_string()),
            record.subject().map(|key| key.to_string()),
            record.attachment.as_ref().and_then(|a| a.group.clone()),
            record.time_point().map(|tp| to_json(&tp)).transpose()?,
            to_json(&record.lifecycle)?,
            1_i64,
            now,
            now,
        ],
    )
    .map_err(storage_error)?;
    Ok(())
}

fn update_record(tx: &rusqlite::Transaction<'_>, record: &Record) -> Result<(), GatewayError> {
    let changed = tx
        .execute(
            "UPDATE sample_records SET
                sample_code = ?1, type_name = ?2, metadata_json = ?3, comments = ?4,
                parent_key = ?5, template_slot = ?6, subject_key = ?7, group_name = ?8,
                time_point_json = ?9, lifecycle_json = ?10,
                row_version = row_version + 1, updated_at = ?11
             WHERE db_id = ?12 AND row_version = ?13",
            params![
                record.sample_code,
                record.type_name,
                to_json(&record.metadata)?,
                record.comments,
                record.parent.map(|key| key.to_string()),
                record.template_slot.map(|slot| slot.to_string()),
                record.subject().map(|key| key.to_string()),
                record.attachment.as_ref().and_then(|a| a.group.clone()),
                record.time_point().map(|tp| to_json(&tp)).transpose()?,
                to_json(&record.lifecycle)?,
                now_rfc3339()?,
                record.db_id,
                record.row_version,
            ],
        )
        .map_err(storage_error)?;

    if changed == 0 {
        let found = tx
            .query_row(
                "SELECT row_version FROM sample_records WHERE db_id = ?1",
                params![record.db_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(storage_error)?
            .unwrap_or(0);
        return Err(GatewayError::Conflict {
            sample_code: record.sample_code.clone(),
            expected: record.row_version,
            found,
        });
    }
    Ok(())
}

fn storage_error(err: rusqlite::Error) -> GatewayError {
    GatewayError::Storage(err.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, GatewayError> {
    serde_json::to_string(value)
        .map_err(|err| GatewayError::Storage(format!("serialization failed: {err}")))
}

fn now_rfc3339() -> Result<String, GatewayError> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| GatewayError::Storage(format!("failed to format timestamp: {err}")))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339().map_err(|err| anyhow!("{err}"))?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

/// Identifier allocator backed by the `id_sequences` table. Each bump runs
/// in its own transaction on a dedicated connection so allocation survives a
/// later cancelled plan (gaps are acceptable, reuse is not).
pub struct SequenceAllocator {
    conn: Connection,
}

impl SequenceAllocator {
    /// Open an allocator on an already-migrated database.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }
}

impl IdentifierAllocator for SequenceAllocator {
    fn next_code(&mut self, type_prefix: &str) -> Result<String, EngineError> {
        if type_prefix.trim().is_empty() {
            return Err(EngineError::Allocation("empty identifier prefix".to_string()));
        }

        let allocation_failed =
            |err: rusqlite::Error| EngineError::Allocation(err.to_string());

        let tx = self.conn.transaction().map_err(allocation_failed)?;
        tx.execute(
            "INSERT INTO id_sequences(prefix, next_value) VALUES (?1, 1)
             ON CONFLICT(prefix) DO UPDATE SET next_value = next_value + 1",
            params![type_prefix],
        )
        .map_err(allocation_failed)?;
        let value: i64 = tx
            .query_row(
                "SELECT next_value FROM id_sequences WHERE prefix = ?1",
                params![type_prefix],
                |row| row.get(0),
            )
            .map_err(allocation_failed)?;
        tx.commit().map_err(allocation_failed)?;

        Ok(format!("{type_prefix}{value:06}"))
    }
}
