//! Append-only TLE history.
//!
//! Two implementations of [`TleRepository`]:
//! - [`SqliteTleRepository`]: durable store. One serialized writer connection,
//!   readers open their own connection so WAL gives them a consistent snapshot.
//! - [`InMemoryTleRepository`]: for tests and local runs.
//!
//! There is no update or delete. Storage errors propagate to the caller.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{IngestError, Result, TleSet};

pub trait TleRepository: Send + Sync {
    /// Append one record.
    fn save(&self, tle: &TleSet) -> Result<()>;

    /// Records for `norad_id` fetched at or after `since`, newest first.
    fn list_since(&self, norad_id: u32, since: DateTime<Utc>) -> Result<Vec<TleSet>>;

    /// Most recently fetched record for `norad_id`.
    fn latest(&self, norad_id: u32) -> Result<Option<TleSet>>;

    /// Records fetched within the trailing `days`, newest first.
    fn list_recent(&self, norad_id: u32, days: i64) -> Result<Vec<TleSet>> {
        let since = Duration::try_days(days)
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.list_since(norad_id, since)
    }
}

// ============================================================================
// SQLite
// ============================================================================

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    norad_id INTEGER NOT NULL,
    source TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    epoch TEXT NOT NULL,
    line1 TEXT NOT NULL,
    line2 TEXT NOT NULL,
    score REAL NOT NULL,
    warnings TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tles_norad_fetched ON tles(norad_id, fetched_at);
"#;

const SELECT_COLUMNS: &str =
    "SELECT id, norad_id, source, fetched_at, epoch, line1, line2, score, warnings FROM tles";

pub struct SqliteTleRepository {
    path: PathBuf,
    writer: Mutex<Connection>,
}

impl SqliteTleRepository {
    /// Open or create the store at `path` and run the schema migration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.execute_batch(SCHEMA)?;
        info!("TLE store opened at {}", path.display());

        Ok(Self {
            path,
            writer: Mutex::new(conn),
        })
    }

    fn reader(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(id: i64, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| IngestError::CorruptRecord {
            id,
            reason: format!("bad timestamp {:?}: {}", raw, e),
        })
}

/// Raw columns, decoded outside the rusqlite row callback.
struct StoredRow {
    id: i64,
    norad_id: u32,
    source: String,
    fetched_at: String,
    epoch: String,
    line1: String,
    line2: String,
    score: f64,
    warnings: String,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            norad_id: row.get(1)?,
            source: row.get(2)?,
            fetched_at: row.get(3)?,
            epoch: row.get(4)?,
            line1: row.get(5)?,
            line2: row.get(6)?,
            score: row.get(7)?,
            warnings: row.get(8)?,
        })
    }

    fn into_tle(self) -> Result<TleSet> {
        Ok(TleSet {
            norad_id: self.norad_id,
            source: self.source,
            fetched_at: parse_ts(self.id, &self.fetched_at)?,
            epoch: parse_ts(self.id, &self.epoch)?,
            line1: self.line1,
            line2: self.line2,
            score: self.score,
            warnings: serde_json::from_str(&self.warnings)?,
        })
    }
}

impl TleRepository for SqliteTleRepository {
    fn save(&self, tle: &TleSet) -> Result<()> {
        let warnings = serde_json::to_string(&tle.warnings)?;
        let mut conn = self.writer.lock().map_err(|_| IngestError::LockPoisoned)?;

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO tles (norad_id, source, fetched_at, epoch, line1, line2, score, warnings)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tle.norad_id,
                tle.source,
                format_ts(&tle.fetched_at),
                format_ts(&tle.epoch),
                tle.line1,
                tle.line2,
                tle.score,
                warnings,
            ],
        )?;
        tx.commit()?;

        debug!(norad_id = tle.norad_id, source = %tle.source, score = tle.score, "TLE saved");
        Ok(())
    }

    fn list_since(&self, norad_id: u32, since: DateTime<Utc>) -> Result<Vec<TleSet>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE norad_id = ?1 AND fetched_at >= ?2 ORDER BY fetched_at DESC, id DESC",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![norad_id, format_ts(&since)], StoredRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(StoredRow::into_tle).collect()
    }

    fn latest(&self, norad_id: u32) -> Result<Option<TleSet>> {
        let conn = self.reader()?;
        let row = conn
            .query_row(
                &format!(
                    "{} WHERE norad_id = ?1 ORDER BY fetched_at DESC, id DESC LIMIT 1",
                    SELECT_COLUMNS
                ),
                params![norad_id],
                StoredRow::from_row,
            )
            .optional()?;

        row.map(StoredRow::into_tle).transpose()
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct InMemoryTleRepository {
    records: RwLock<Vec<TleSet>>,
}

impl InMemoryTleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TleRepository for InMemoryTleRepository {
    fn save(&self, tle: &TleSet) -> Result<()> {
        self.records
            .write()
            .map_err(|_| IngestError::LockPoisoned)?
            .push(tle.clone());
        Ok(())
    }

    fn list_since(&self, norad_id: u32, since: DateTime<Utc>) -> Result<Vec<TleSet>> {
        let records = self.records.read().map_err(|_| IngestError::LockPoisoned)?;
        // Reverse insertion order first so equal fetch times list the later write first.
        let mut matching: Vec<TleSet> = records
            .iter()
            .rev()
            .filter(|t| t.norad_id == norad_id && t.fetched_at >= since)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.fetched_at.cmp(&a.fetched_at));
        Ok(matching)
    }

    fn latest(&self, norad_id: u32) -> Result<Option<TleSet>> {
        Ok(self
            .list_since(norad_id, DateTime::<Utc>::MIN_UTC)?
            .into_iter()
            .next())
    }
}
