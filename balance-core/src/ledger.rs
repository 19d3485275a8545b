use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::browser::{ErrorKind, ScrapeError};
use crate::config::ObservabilitySection;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<LedgerError> for ScrapeError {
    fn from(error: LedgerError) -> Self {
        ScrapeError::Unexpected(format!("ledger: {error}"))
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub institution: String,
    pub success: bool,
    pub duration_ms: i64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub artifact: Option<PathBuf>,
}

impl RunRecord {
    pub fn success(institution: &str, duration_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            institution: institution.to_string(),
            success: true,
            duration_ms,
            error_kind: None,
            error_message: None,
            artifact: None,
        }
    }

    pub fn failure(
        institution: &str,
        duration_ms: i64,
        error: &ScrapeError,
        artifact: Option<PathBuf>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            institution: institution.to_string(),
            success: false,
            duration_ms,
            error_kind: Some(error.kind()),
            error_message: Some(error.to_string()),
            artifact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JailEntry {
    pub institution: String,
    pub jailed_at: DateTime<Utc>,
    pub reason: ErrorKind,
    pub message: String,
    pub screenshot: Option<PathBuf>,
}

/// SQLite record of every retrieval plus the set of jailed institutions.
/// Failures are also appended to a JSON-lines log.
pub struct RunLedger {
    log: Mutex<File>,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl RunLedger {
    pub fn new(log_path: impl AsRef<Path>, db_path: impl AsRef<Path>) -> LedgerResult<Self> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let ledger = Self {
            log: Mutex::new(file),
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        ledger.initialize_db()?;
        Ok(ledger)
    }

    pub fn from_config(section: &ObservabilitySection) -> LedgerResult<Self> {
        Self::new(&section.failure_log, &section.ledger_db)
    }

    fn initialize_db(&self) -> LedgerResult<()> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS retrieval_runs (
                id TEXT PRIMARY KEY,
                ts TEXT NOT NULL,
                institution TEXT NOT NULL,
                success INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                error_kind TEXT,
                error_message TEXT,
                artifact TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_retrieval_runs_ts ON retrieval_runs(ts DESC);
            CREATE TABLE IF NOT EXISTS jail (
                institution TEXT PRIMARY KEY COLLATE NOCASE,
                jailed_at TEXT NOT NULL,
                reason TEXT NOT NULL,
                message TEXT NOT NULL,
                screenshot TEXT
            );",
        )?;
        Ok(())
    }

    fn open_db(&self) -> LedgerResult<Connection> {
        Ok(Connection::open_with_flags(&self.db_path, self.flags)?)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    pub fn record_run(&self, run: &RunRecord) -> LedgerResult<()> {
        if !run.success {
            let json = serde_json::to_string(run)?;
            let mut guard = self.log.lock().unwrap_or_else(|poisoned| {
                warn!("failure log lock poisoned; writing anyway");
                poisoned.into_inner()
            });
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO retrieval_runs (
                id, ts, institution, success, duration_ms, error_kind, error_message, artifact
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.id.to_string(),
                run.timestamp,
                run.institution,
                run.success,
                run.duration_ms,
                run.error_kind.map(|kind| kind.as_str()),
                run.error_message,
                run.artifact.as_ref().map(|p| p.to_string_lossy().to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn recent_runs(&self, limit: usize) -> LedgerResult<Vec<RunRecord>> {
        let conn = self.open_db()?;
        let mut stmt = conn.prepare(
            "SELECT id, ts, institution, success, duration_ms, error_kind, error_message, artifact
             FROM retrieval_runs ORDER BY ts DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], run_from_row)?;
        let runs = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// The newest run of each institution, ordered by institution name.
    pub fn latest_runs(&self) -> LedgerResult<Vec<RunRecord>> {
        let conn = self.open_db()?;
        let mut stmt = conn.prepare(
            "SELECT id, ts, institution, success, duration_ms, error_kind, error_message, artifact
             FROM retrieval_runs AS r
             WHERE ts = (
                SELECT MAX(ts) FROM retrieval_runs
                WHERE institution = r.institution COLLATE NOCASE
             )
             GROUP BY institution COLLATE NOCASE
             ORDER BY institution COLLATE NOCASE",
        )?;
        let rows = stmt.query_map([], run_from_row)?;
        let runs = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    pub fn jail(&self, entry: &JailEntry) -> LedgerResult<()> {
        warn!(
            institution = %entry.institution,
            reason = %entry.reason,
            "moving institution to jail"
        );
        let conn = self.open_db()?;
        conn.execute(
            "INSERT OR REPLACE INTO jail (institution, jailed_at, reason, message, screenshot)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.institution,
                entry.jailed_at,
                entry.reason.as_str(),
                entry.message,
                entry
                    .screenshot
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string()),
            ],
        )?;
        Ok(())
    }

    /// Returns whether an entry was removed.
    pub fn release(&self, institution: &str) -> LedgerResult<bool> {
        let conn = self.open_db()?;
        let removed = conn.execute(
            "DELETE FROM jail WHERE institution = ?1",
            params![institution],
        )?;
        if removed > 0 {
            info!(institution, "released institution from jail");
        }
        Ok(removed > 0)
    }

    pub fn is_jailed(&self, institution: &str) -> LedgerResult<bool> {
        let conn = self.open_db()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM jail WHERE institution = ?1",
                params![institution],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn jailed(&self) -> LedgerResult<Vec<JailEntry>> {
        let conn = self.open_db()?;
        let mut stmt = conn.prepare(
            "SELECT institution, jailed_at, reason, message, screenshot
             FROM jail ORDER BY jailed_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let reason: String = row.get(2)?;
            let screenshot: Option<String> = row.get(4)?;
            Ok(JailEntry {
                institution: row.get(0)?,
                jailed_at: row.get(1)?,
                reason: reason.parse().unwrap_or(ErrorKind::Unexpected),
                message: row.get(3)?,
                screenshot: screenshot.map(PathBuf::from),
            })
        })?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let id: String = row.get(0)?;
    let error_kind: Option<String> = row.get(5)?;
    let artifact: Option<String> = row.get(7)?;
    Ok(RunRecord {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        timestamp: row.get(1)?,
        institution: row.get(2)?,
        success: row.get(3)?,
        duration_ms: row.get(4)?,
        error_kind: error_kind.and_then(|kind| kind.parse().ok()),
        error_message: row.get(6)?,
        artifact: artifact.map(PathBuf::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ledger(dir: &Path) -> RunLedger {
        RunLedger::new(dir.join("logs/failures.log"), dir.join("db/ledger.sqlite")).unwrap()
    }

    #[test]
    fn runs_persist_and_failures_reach_the_log() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path());
        ledger.record_run(&RunRecord::success("Chase", 1200)).unwrap();
        let error = ScrapeError::Timeout("landing page".into());
        ledger
            .record_run(&RunRecord::failure(
                "Zillow",
                900,
                &error,
                Some(PathBuf::from("errors/x_Zillow.png")),
            ))
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join("logs/failures.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("landing page"));

        let runs = ledger.recent_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        let failed = runs.iter().find(|run| !run.success).unwrap();
        assert_eq!(failed.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(failed.artifact, Some(PathBuf::from("errors/x_Zillow.png")));

        let conn = Connection::open(ledger.database_path()).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM retrieval_runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn poisoned_log_lock_still_records_failures() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path());
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = ledger.log.lock().unwrap();
            panic!("writer died mid-append");
        }));
        assert!(ledger.log.is_poisoned());

        let error = ScrapeError::MissingElement("#accounts".into());
        ledger
            .record_run(&RunRecord::failure("Vanguard", 40, &error, None))
            .unwrap();
        let log = std::fs::read_to_string(dir.path().join("logs/failures.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("Vanguard"));
    }

    #[test]
    fn latest_runs_keep_one_row_per_institution() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path());
        let mut early = RunRecord::failure(
            "Chase",
            900,
            &ScrapeError::Timeout("landing page".into()),
            None,
        );
        early.timestamp = Utc::now() - chrono::Duration::minutes(5);
        ledger.record_run(&early).unwrap();
        ledger.record_run(&RunRecord::success("chase", 700)).unwrap();
        ledger.record_run(&RunRecord::success("Ally", 300)).unwrap();

        let latest = ledger.latest_runs().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].institution, "Ally");
        assert!(latest[1].institution.eq_ignore_ascii_case("chase"));
        assert!(latest[1].success);
    }

    #[test]
    fn jail_and_release() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path());
        ledger
            .jail(&JailEntry {
                institution: "Chase".into(),
                jailed_at: Utc::now(),
                reason: ErrorKind::MissingElement,
                message: "element not found: #signin-button".into(),
                screenshot: None,
            })
            .unwrap();
        assert!(ledger.is_jailed("Chase").unwrap());
        assert!(ledger.is_jailed("chase").unwrap());
        assert_eq!(ledger.jailed().unwrap()[0].reason, ErrorKind::MissingElement);

        assert!(ledger.release("Chase").unwrap());
        assert!(!ledger.release("Chase").unwrap());
        assert!(ledger.jailed().unwrap().is_empty());
    }
}
