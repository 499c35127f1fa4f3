use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use havoc_core::{AttackKind, Experiment, ExperimentStatus, ExperimentStore, HavocError, Result};

const COLUMNS: &str =
    "uid, kind, action, status, message, recover_command, created_at, updated_at";

/// SQLite-backed experiment store.
///
/// The connection sits behind a mutex so the store can be shared between the
/// scheduler's timer callbacks and API handlers.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!(path = %path, "Experiment store opened");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| HavocError::Persistence("experiment store lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS experiments (
                    uid TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    action TEXT NOT NULL,
                    status TEXT NOT NULL,
                    message TEXT NOT NULL DEFAULT '',
                    recover_command TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_experiments_status ON experiments(status);",
            )
            .map_err(db_err)
    }

    fn query(&self, sql: &str, status: Option<ExperimentStatus>) -> Result<Vec<Experiment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = match status {
            Some(status) => stmt.query_map(params![status.as_str()], raw_row),
            None => stmt.query_map([], raw_row),
        }
        .map_err(db_err)?;

        rows.map(|row| row.map_err(db_err).and_then(RawExperiment::into_experiment))
            .collect()
    }
}

impl ExperimentStore for SqliteStore {
    fn set(&self, experiment: &Experiment) -> Result<()> {
        self.conn()?
            .execute(
                &format!("INSERT INTO experiments ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    experiment.uid.to_string(),
                    experiment.kind.as_str(),
                    experiment.action,
                    experiment.status.as_str(),
                    experiment.message,
                    experiment.recover_command,
                    experiment.created_at.to_rfc3339(),
                    experiment.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        debug!(uid = %experiment.uid, status = %experiment.status, "Experiment recorded");
        Ok(())
    }

    fn update(
        &self,
        uid: &Uuid,
        status: ExperimentStatus,
        message: &str,
        recover_command: &str,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM experiments WHERE uid = ?1",
                params![uid.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let current: ExperimentStatus = current
            .ok_or(HavocError::NotFound(*uid))?
            .parse()
            .map_err(corrupt)?;
        current.transition(status)?;

        tx.execute(
            "UPDATE experiments
             SET status = ?2, message = ?3, recover_command = ?4, updated_at = ?5
             WHERE uid = ?1",
            params![
                uid.to_string(),
                status.as_str(),
                message,
                recover_command,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        debug!(uid = %uid, from = %current, to = %status, "Experiment status updated");
        Ok(())
    }

    fn find_by_uid(&self, uid: &Uuid) -> Result<Option<Experiment>> {
        let raw = self
            .conn()?
            .query_row(
                &format!("SELECT {COLUMNS} FROM experiments WHERE uid = ?1"),
                params![uid.to_string()],
                raw_row,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(RawExperiment::into_experiment).transpose()
    }

    fn list(&self) -> Result<Vec<Experiment>> {
        self.query(
            &format!("SELECT {COLUMNS} FROM experiments ORDER BY created_at ASC"),
            None,
        )
    }

    fn list_by_status(&self, status: ExperimentStatus) -> Result<Vec<Experiment>> {
        self.query(
            &format!("SELECT {COLUMNS} FROM experiments WHERE status = ?1 ORDER BY created_at ASC"),
            Some(status),
        )
    }
}

/// Column values as stored, before parsing into domain types.
struct RawExperiment {
    uid: String,
    kind: String,
    action: String,
    status: String,
    message: String,
    recover_command: String,
    created_at: String,
    updated_at: String,
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawExperiment> {
    Ok(RawExperiment {
        uid: row.get(0)?,
        kind: row.get(1)?,
        action: row.get(2)?,
        status: row.get(3)?,
        message: row.get(4)?,
        recover_command: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl RawExperiment {
    fn into_experiment(self) -> Result<Experiment> {
        Ok(Experiment {
            uid: Uuid::parse_str(&self.uid)
                .map_err(|e| HavocError::Persistence(format!("bad uid '{}': {e}", self.uid)))?,
            kind: self.kind.parse::<AttackKind>().map_err(corrupt)?,
            action: self.action,
            status: self.status.parse::<ExperimentStatus>().map_err(corrupt)?,
            message: self.message,
            recover_command: self.recover_command,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| HavocError::Persistence(format!("bad timestamp '{raw}': {e}")))
}

fn db_err(e: rusqlite::Error) -> HavocError {
    HavocError::Persistence(e.to_string())
}

fn corrupt(e: HavocError) -> HavocError {
    HavocError::Persistence(format!("corrupt experiment row: {e}"))
}
