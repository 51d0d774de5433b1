use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rc_types::StorageError;

use super::{StorageResult, StudyStorage};
use crate::search::ParameterKind;
use crate::trial::{FrozenTrial, StudyDirection, StudyId, TrialId, TrialState};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS studies (
    study_id INTEGER PRIMARY KEY AUTOINCREMENT,
    study_name TEXT NOT NULL UNIQUE,
    direction TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trials (
    trial_id INTEGER PRIMARY KEY AUTOINCREMENT,
    number INTEGER NOT NULL,
    study_id INTEGER NOT NULL REFERENCES studies(study_id),
    state TEXT NOT NULL,
    value REAL,
    datetime_start TEXT NOT NULL,
    datetime_complete TEXT,
    UNIQUE(study_id, number)
);

CREATE TABLE IF NOT EXISTS trial_params (
    trial_id INTEGER NOT NULL REFERENCES trials(trial_id),
    param_name TEXT NOT NULL,
    param_value REAL NOT NULL,
    distribution_json TEXT NOT NULL,
    PRIMARY KEY (trial_id, param_name)
);

CREATE TABLE IF NOT EXISTS trial_user_attrs (
    trial_id INTEGER NOT NULL REFERENCES trials(trial_id),
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    PRIMARY KEY (trial_id, key)
);

CREATE TABLE IF NOT EXISTS trial_intermediate_values (
    trial_id INTEGER NOT NULL REFERENCES trials(trial_id),
    step INTEGER NOT NULL,
    intermediate_value REAL,
    PRIMARY KEY (trial_id, step)
);

CREATE INDEX IF NOT EXISTS idx_trials_study ON trials(study_id, number);
";

/// Study store in a single SQLite database file.
///
/// Concurrent workers rely on SQLite's own locking; trial numbers are drawn
/// inside an immediate transaction.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Sqlite {
                message: format!("cannot create {}: {}", parent.display(), e),
            })?;
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn initialize(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)
    }
}

// ----------------------------------------------------------------------------
// Row helpers
// ----------------------------------------------------------------------------

fn sql_err(e: rusqlite::Error) -> StorageError {
    StorageError::Sqlite { message: e.to_string() }
}

fn decode_err(message: impl Into<String>) -> StorageError {
    StorageError::Sqlite { message: message.into() }
}

fn parse_time(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| decode_err(format!("bad timestamp {raw}: {e}")))
}

fn non_nan(value: Option<f64>) -> Option<f64> {
    value.filter(|v| !v.is_nan())
}

struct TrialRow {
    trial_id: TrialId,
    number: i64,
    state: String,
    value: Option<f64>,
    datetime_start: String,
    datetime_complete: Option<String>,
}

impl TrialRow {
    const COLUMNS: &'static str = "trial_id, number, state, value, datetime_start, datetime_complete";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            trial_id: row.get(0)?,
            number: row.get(1)?,
            state: row.get(2)?,
            value: row.get(3)?,
            datetime_start: row.get(4)?,
            datetime_complete: row.get(5)?,
        })
    }

    fn into_trial(self) -> StorageResult<FrozenTrial> {
        let state = self.state.parse::<TrialState>().map_err(decode_err)?;
        let mut trial = FrozenTrial::new(self.trial_id, self.number as u64).with_state(state, self.value);
        trial.datetime_start = parse_time(&self.datetime_start)?;
        trial.datetime_complete = self.datetime_complete.as_deref().map(parse_time).transpose()?;
        Ok(trial)
    }
}

fn ensure_running(conn: &Connection, trial: TrialId) -> StorageResult<()> {
    let state: Option<String> = conn
        .query_row("SELECT state FROM trials WHERE trial_id = ?1", params![trial], |row| row.get(0))
        .optional()
        .map_err(sql_err)?;
    let state = state
        .ok_or(StorageError::TrialNotFound { trial_id: trial })?
        .parse::<TrialState>()
        .map_err(decode_err)?;
    if state.is_finished() {
        return Err(StorageError::TrialFinished { trial_id: trial });
    }
    Ok(())
}

/// Fill params, user attributes and intermediate values for `trials`,
/// selecting rows with `filter` (a WHERE clause over alias `t`).
fn attach_details(conn: &Connection, trials: &mut [FrozenTrial], filter: &str, key: i64) -> StorageResult<()> {
    let slots: HashMap<TrialId, usize> = trials.iter().enumerate().map(|(i, t)| (t.trial_id, i)).collect();

    let sql = format!(
        "SELECT p.trial_id, p.param_name, p.param_value FROM trial_params p
         JOIN trials t ON t.trial_id = p.trial_id WHERE {filter}"
    );
    let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
    let rows = stmt
        .query_map(params![key], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?)))
        .map_err(sql_err)?;
    for row in rows {
        let (id, name, value) = row.map_err(sql_err)?;
        if let Some(&i) = slots.get(&id) {
            trials[i].params.insert(name, value);
        }
    }

    let sql = format!(
        "SELECT a.trial_id, a.key, a.value_json FROM trial_user_attrs a
         JOIN trials t ON t.trial_id = a.trial_id WHERE {filter}"
    );
    let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
    let rows = stmt
        .query_map(params![key], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)))
        .map_err(sql_err)?;
    for row in rows {
        let (id, attr, raw) = row.map_err(sql_err)?;
        let value = serde_json::from_str(&raw).map_err(|e| decode_err(format!("bad user attribute {attr}: {e}")))?;
        if let Some(&i) = slots.get(&id) {
            trials[i].user_attrs.insert(attr, value);
        }
    }

    let sql = format!(
        "SELECT v.trial_id, v.step, v.intermediate_value FROM trial_intermediate_values v
         JOIN trials t ON t.trial_id = v.trial_id WHERE {filter}"
    );
    let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
    let rows = stmt
        .query_map(params![key], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, Option<f64>>(2)?))
        })
        .map_err(sql_err)?;
    for row in rows {
        let (id, step, value) = row.map_err(sql_err)?;
        if let Some(&i) = slots.get(&id) {
            trials[i].intermediate_values.insert(step as u64, value.unwrap_or(f64::NAN));
        }
    }

    Ok(())
}

// ----------------------------------------------------------------------------
// StudyStorage
// ----------------------------------------------------------------------------

impl StudyStorage for SqliteStorage {
    fn create_study(&self, name: &str, direction: StudyDirection, load_if_exists: bool) -> StorageResult<StudyId> {
        let conn = self.conn.lock();
        let existing: Option<StudyId> = conn
            .query_row("SELECT study_id FROM studies WHERE study_name = ?1", params![name], |row| row.get(0))
            .optional()
            .map_err(sql_err)?;

        match existing {
            Some(id) if load_if_exists => {
                tracing::info!("Loading existing study {} (id {})", name, id);
                Ok(id)
            }
            Some(_) => Err(StorageError::StudyExists { name: name.to_string() }),
            None => {
                conn.execute(
                    "INSERT OR IGNORE INTO studies (study_name, direction) VALUES (?1, ?2)",
                    params![name, direction.as_str()],
                )
                .map_err(sql_err)?;
                // Another worker may have won the insert.
                let id = conn
                    .query_row("SELECT study_id FROM studies WHERE study_name = ?1", params![name], |row| row.get(0))
                    .map_err(sql_err)?;
                tracing::info!("Created study {} (id {})", name, id);
                Ok(id)
            }
        }
    }

    fn study_id(&self, name: &str) -> StorageResult<StudyId> {
        let conn = self.conn.lock();
        conn.query_row("SELECT study_id FROM studies WHERE study_name = ?1", params![name], |row| row.get(0))
            .optional()
            .map_err(sql_err)?
            .ok_or_else(|| StorageError::StudyNotFound { name: name.to_string() })
    }

    fn study_direction(&self, study: StudyId) -> StorageResult<StudyDirection> {
        let conn = self.conn.lock();
        let raw: String = conn
            .query_row("SELECT direction FROM studies WHERE study_id = ?1", params![study], |row| row.get(0))
            .optional()
            .map_err(sql_err)?
            .ok_or_else(|| StorageError::StudyNotFound { name: study.to_string() })?;
        raw.parse().map_err(decode_err)
    }

    fn create_trial(&self, study: StudyId) -> StorageResult<FrozenTrial> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;

        let known: Option<i64> = tx
            .query_row("SELECT 1 FROM studies WHERE study_id = ?1", params![study], |row| row.get(0))
            .optional()
            .map_err(sql_err)?;
        if known.is_none() {
            return Err(StorageError::StudyNotFound { name: study.to_string() });
        }

        let number: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(number) + 1, 0) FROM trials WHERE study_id = ?1",
                params![study],
                |row| row.get(0),
            )
            .map_err(sql_err)?;

        let mut trial = FrozenTrial::new(0, number as u64);
        tx.execute(
            "INSERT INTO trials (number, study_id, state, datetime_start) VALUES (?1, ?2, ?3, ?4)",
            params![number, study, TrialState::Running.as_str(), trial.datetime_start.to_rfc3339()],
        )
        .map_err(sql_err)?;
        trial.trial_id = tx.last_insert_rowid();
        tx.commit().map_err(sql_err)?;

        Ok(trial)
    }

    fn set_param(&self, trial: TrialId, name: &str, value: f64, kind: &ParameterKind) -> StorageResult<()> {
        let distribution = serde_json::to_string(kind).map_err(|e| decode_err(e.to_string()))?;
        let conn = self.conn.lock();
        ensure_running(&conn, trial)?;
        conn.execute(
            "INSERT OR REPLACE INTO trial_params (trial_id, param_name, param_value, distribution_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![trial, name, value, distribution],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn set_user_attr(&self, trial: TrialId, key: &str, value: serde_json::Value) -> StorageResult<()> {
        let conn = self.conn.lock();
        ensure_running(&conn, trial)?;
        conn.execute(
            "INSERT OR REPLACE INTO trial_user_attrs (trial_id, key, value_json) VALUES (?1, ?2, ?3)",
            params![trial, key, value.to_string()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn report_intermediate(&self, trial: TrialId, step: u64, value: f64) -> StorageResult<()> {
        let conn = self.conn.lock();
        ensure_running(&conn, trial)?;
        conn.execute(
            "INSERT OR REPLACE INTO trial_intermediate_values (trial_id, step, intermediate_value)
             VALUES (?1, ?2, ?3)",
            params![trial, step as i64, non_nan(Some(value))],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn finish_trial(&self, trial: TrialId, state: TrialState, value: Option<f64>) -> StorageResult<()> {
        let conn = self.conn.lock();
        ensure_running(&conn, trial)?;
        conn.execute(
            "UPDATE trials SET state = ?1, value = ?2, datetime_complete = ?3 WHERE trial_id = ?4",
            params![state.as_str(), non_nan(value), Utc::now().to_rfc3339(), trial],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn trial(&self, trial: TrialId) -> StorageResult<FrozenTrial> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM trials WHERE trial_id = ?1", TrialRow::COLUMNS);
        let row = conn
            .query_row(&sql, params![trial], TrialRow::from_row)
            .optional()
            .map_err(sql_err)?
            .ok_or(StorageError::TrialNotFound { trial_id: trial })?;

        let mut trials = vec![row.into_trial()?];
        attach_details(&conn, &mut trials, "t.trial_id = ?1", trial)?;
        Ok(trials.remove(0))
    }

    fn trials(&self, study: StudyId) -> StorageResult<Vec<FrozenTrial>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM trials WHERE study_id = ?1 ORDER BY number", TrialRow::COLUMNS);
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(params![study], TrialRow::from_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        drop(stmt);

        let mut trials = rows.into_iter().map(TrialRow::into_trial).collect::<StorageResult<Vec<_>>>()?;
        attach_details(&conn, &mut trials, "t.study_id = ?1", study)?;
        Ok(trials)
    }
}
