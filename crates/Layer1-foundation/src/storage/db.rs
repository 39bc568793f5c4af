//! SQLite storage for task records
//!
//! One durable table shared by the web process and every worker process.
//! All cross-cutting writes (create/claim/finish/abort) run inside
//! `TaskStore::locked`, an exclusive transaction with a bounded busy
//! timeout - the advisory lock the Manager builds its check-then-act
//! sequences on. Plain reads and single-writer progress updates go
//! through the unlocked methods.
//!
//! ## Migration System
//!
//! Database schema is versioned. Migrations run automatically on startup.
//! - Version 1: Initial schema (tasks)

use crate::state::TaskState;
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Database file name
pub const DB_FILE: &str = "conveyor.db";

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Column list shared by every SELECT, in `row_to_record` order
const SELECT_COLUMNS: &str =
    "id, code, type, state, input, progress, output, initializing_datetime, last_activity_datetime";

/// Store service for persisting task records
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    /// Open (creating if needed) the task database under `data_dir`
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;

        let db_path = data_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        // Enable WAL mode so unlocked reads proceed while a claim is in flight
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.initialize_schema()?;
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.initialize_schema()?;
        store.run_migrations()?;

        Ok(store)
    }

    /// Get current schema version from database
    pub fn get_schema_version(&self) -> Result<i32> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))?;

        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to get schema version: {}", e)))
    }

    /// Initialize database schema (base tables)
    fn initialize_schema(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))?;

        conn.execute_batch(
            r#"
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Task records
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL DEFAULT '',
                type TEXT NOT NULL,
                state TEXT NOT NULL CHECK(state IN ('pending', 'processing', 'terminated', 'succeeded', 'failed')),
                input TEXT NOT NULL DEFAULT '{}',
                progress REAL NOT NULL DEFAULT 0.0,
                output TEXT NOT NULL DEFAULT '{}',
                initializing_datetime TEXT NOT NULL,
                last_activity_datetime TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_code
                ON tasks(code, id DESC);
            CREATE INDEX IF NOT EXISTS idx_tasks_state
                ON tasks(state);

            -- Insert initial schema version if not exists
            INSERT OR IGNORE INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Run all pending migrations
    fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version()?;

        if current_version >= CURRENT_SCHEMA_VERSION {
            debug!(
                "Database schema is up to date (version {})",
                current_version
            );
            return Ok(());
        }

        info!(
            "Running database migrations from version {} to {}",
            current_version, CURRENT_SCHEMA_VERSION
        );

        Ok(())
    }

    // ========================================================================
    // Advisory lock
    // ========================================================================

    /// Run `f` inside the advisory lock: an exclusive transaction that
    /// other writers (in this process or any other process sharing the
    /// database file) cannot enter concurrently.
    ///
    /// Acquisition blocks up to `timeout`, then fails with
    /// [`Error::LockTimeout`]. An `Err` from `f` rolls the transaction
    /// back, leaving storage untouched.
    pub fn locked<T>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))?;

        conn.busy_timeout(timeout)
            .map_err(|e| Error::Storage(format!("Failed to set busy timeout: {}", e)))?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)
            .map_err(|e| {
                if is_busy(&e) {
                    Error::LockTimeout(format!("Task store busy for more than {:?}", timeout))
                } else {
                    Error::Storage(format!("Failed to begin transaction: {}", e))
                }
            })?;

        let value = f(&tx)?;

        tx.commit().map_err(|e| {
            if is_busy(&e) {
                Error::LockTimeout(format!("Task store busy for more than {:?}", timeout))
            } else {
                Error::Storage(format!("Failed to commit transaction: {}", e))
            }
        })?;

        Ok(value)
    }

    // ========================================================================
    // Row operations usable inside `locked` (take the open connection)
    // ========================================================================

    /// Insert a new PENDING record; both datetimes start at creation time
    pub fn create(
        conn: &Connection,
        type_name: &str,
        input: &serde_json::Value,
        code: &str,
    ) -> Result<TaskRecord> {
        let stamp = format_stamp(&Utc::now());

        conn.execute(
            r#"
            INSERT INTO tasks (code, type, state, input, progress, output,
                               initializing_datetime, last_activity_datetime)
            VALUES (?1, ?2, 'pending', ?3, 0.0, '{}', ?4, ?4)
            "#,
            params![code, type_name, input.to_string(), stamp],
        )
        .map_err(|e| Error::Storage(format!("Failed to create task: {}", e)))?;

        let created = parse_stamp(&stamp)?;

        Ok(TaskRecord {
            id: conn.last_insert_rowid(),
            code: code.to_string(),
            type_name: type_name.to_string(),
            state: TaskState::Pending,
            input: input.clone(),
            progress: 0.0,
            output: serde_json::json!({}),
            initializing_datetime: created,
            last_activity_datetime: created,
        })
    }

    /// Fetch one record by id
    pub fn fetch_by_id(conn: &Connection, id: i64) -> Result<Option<TaskRecord>> {
        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", SELECT_COLUMNS),
            params![id],
            row_to_record,
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to get task: {}", e)))
    }

    /// Fetch one PENDING record - the given id, or any eligible row.
    /// Claim order among multiple eligible rows is unspecified.
    pub fn fetch_pending(conn: &Connection, target: Option<i64>) -> Result<Option<TaskRecord>> {
        match target {
            Some(id) => conn
                .query_row(
                    &format!(
                        "SELECT {} FROM tasks WHERE state = 'pending' AND id = ?1 LIMIT 1",
                        SELECT_COLUMNS
                    ),
                    params![id],
                    row_to_record,
                )
                .optional(),
            None => conn
                .query_row(
                    &format!(
                        "SELECT {} FROM tasks WHERE state = 'pending' LIMIT 1",
                        SELECT_COLUMNS
                    ),
                    [],
                    row_to_record,
                )
                .optional(),
        }
        .map_err(|e| Error::Storage(format!("Failed to fetch pending task: {}", e)))
    }

    /// Fetch the most recent non-final record for a code
    pub fn fetch_active_by_code(conn: &Connection, code: &str) -> Result<Option<TaskRecord>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM tasks WHERE code = ?1 AND state NOT IN ({}) ORDER BY id DESC LIMIT 1",
                SELECT_COLUMNS,
                final_state_list()
            ),
            params![code],
            row_to_record,
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to fetch active task: {}", e)))
    }

    /// Persist every mutable field of a record, including its state.
    ///
    /// With `touch_activity` the last-activity datetime is advanced to now
    /// before writing; without it the record's own value is written as-is
    /// (explicit override).
    pub fn persist(
        conn: &Connection,
        record: &mut TaskRecord,
        touch_activity: bool,
    ) -> Result<()> {
        if touch_activity {
            record.last_activity_datetime = parse_stamp(&format_stamp(&Utc::now()))?;
        }

        let affected = conn
            .execute(
                r#"
                UPDATE tasks SET
                    state = ?2,
                    input = ?3,
                    progress = ?4,
                    output = ?5,
                    last_activity_datetime = ?6
                WHERE id = ?1
                "#,
                params![
                    record.id,
                    record.state.as_str(),
                    record.input.to_string(),
                    record.progress,
                    record.output.to_string(),
                    format_stamp(&record.last_activity_datetime),
                ],
            )
            .map_err(|e| Error::Storage(format!("Failed to save task: {}", e)))?;

        if affected == 0 {
            return Err(Error::NotFound(format!("Task {} not found", record.id)));
        }

        Ok(())
    }

    /// Persist the data fields of a record, leaving its stored state
    /// untouched. A mid-run progress save must never overwrite a
    /// concurrent external termination.
    pub fn persist_data(
        conn: &Connection,
        record: &mut TaskRecord,
        touch_activity: bool,
    ) -> Result<()> {
        if touch_activity {
            record.last_activity_datetime = parse_stamp(&format_stamp(&Utc::now()))?;
        }

        let affected = conn
            .execute(
                r#"
                UPDATE tasks SET
                    input = ?2,
                    progress = ?3,
                    output = ?4,
                    last_activity_datetime = ?5
                WHERE id = ?1
                "#,
                params![
                    record.id,
                    record.input.to_string(),
                    record.progress,
                    record.output.to_string(),
                    format_stamp(&record.last_activity_datetime),
                ],
            )
            .map_err(|e| Error::Storage(format!("Failed to save task: {}", e)))?;

        if affected == 0 {
            return Err(Error::NotFound(format!("Task {} not found", record.id)));
        }

        Ok(())
    }

    // ========================================================================
    // Unlocked operations (plain reads and single-writer saves)
    // ========================================================================

    /// Get one record by id
    pub fn get(&self, id: i64) -> Result<Option<TaskRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))?;

        Self::fetch_by_id(&conn, id)
    }

    /// Get the most recent record for a code (any state)
    pub fn get_by_code(&self, code: &str) -> Result<Option<TaskRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))?;

        conn.query_row(
            &format!(
                "SELECT {} FROM tasks WHERE code = ?1 ORDER BY id DESC LIMIT 1",
                SELECT_COLUMNS
            ),
            params![code],
            row_to_record,
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to get task by code: {}", e)))
    }

    /// Get recent records for a code, most recent first.
    ///
    /// With a cutoff, records whose last activity predates it are excluded -
    /// except a currently active (non-final) one. `limit` of 0 means
    /// unlimited.
    pub fn get_last(
        &self,
        code: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))?;

        let mut query = format!("SELECT {} FROM tasks WHERE code = ?1", SELECT_COLUMNS);
        if since.is_some() {
            query.push_str(&format!(
                " AND (last_activity_datetime >= ?2 OR state NOT IN ({}))",
                final_state_list()
            ));
        }
        query.push_str(" ORDER BY id DESC");
        if limit > 0 {
            query.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = conn
            .prepare(&query)
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

        let records = match since {
            Some(cutoff) => stmt
                .query_map(params![code, format_stamp(&cutoff)], row_to_record)
                .map_err(|e| Error::Storage(format!("Failed to query tasks: {}", e)))?
                .filter_map(|r| r.ok())
                .collect(),
            None => stmt
                .query_map(params![code], row_to_record)
                .map_err(|e| Error::Storage(format!("Failed to query tasks: {}", e)))?
                .filter_map(|r| r.ok())
                .collect(),
        };

        Ok(records)
    }

    /// Persist a record outside the advisory lock, state included
    pub fn save(&self, record: &mut TaskRecord, touch_activity: bool) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))?;

        Self::persist(&conn, record, touch_activity)
    }

    /// Persist a record's data fields outside the advisory lock
    /// (single-writer progress and output updates during execution)
    pub fn save_data(&self, record: &mut TaskRecord, touch_activity: bool) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))?;

        Self::persist_data(&conn, record, touch_activity)
    }
}

// ============================================================================
// Record Types
// ============================================================================

/// One persisted unit of background work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    /// Logical deduplication key; empty means "no dedup"
    pub code: String,
    /// Handler identifier resolved through the registry
    pub type_name: String,
    pub state: TaskState,
    pub input: serde_json::Value,
    /// Completion level, domain [0, 1]
    pub progress: f64,
    pub output: serde_json::Value,
    pub initializing_datetime: DateTime<Utc>,
    pub last_activity_datetime: DateTime<Utc>,
}

// ============================================================================
// Helpers
// ============================================================================

/// RFC 3339 UTC with fixed microsecond precision, so the cutoff comparison
/// in get_last is sound as a string comparison
fn format_stamp(datetime: &DateTime<Utc>) -> String {
    datetime.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_stamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Invalid datetime '{}': {}", raw, e)))
}

fn final_state_list() -> String {
    TaskState::FINAL
        .iter()
        .map(|state| format!("'{}'", state.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn conversion_error(index: usize, err: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let state_raw: String = row.get(3)?;
    let input_raw: String = row.get(4)?;
    let output_raw: String = row.get(6)?;
    let initializing_raw: String = row.get(7)?;
    let last_activity_raw: String = row.get(8)?;

    Ok(TaskRecord {
        id: row.get(0)?,
        code: row.get(1)?,
        type_name: row.get(2)?,
        state: state_raw
            .parse()
            .map_err(|e| conversion_error(3, e))?,
        input: serde_json::from_str(&input_raw)
            .map_err(|e| conversion_error(4, Error::Json(e)))?,
        progress: row.get(5)?,
        output: serde_json::from_str(&output_raw)
            .map_err(|e| conversion_error(6, Error::Json(e)))?,
        initializing_datetime: parse_stamp(&initializing_raw)
            .map_err(|e| conversion_error(7, e))?,
        last_activity_datetime: parse_stamp(&last_activity_raw)
            .map_err(|e| conversion_error(8, e))?,
    })
}
