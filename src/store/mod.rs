//! Identity & dedup store: the run ledger and the tender table.
//!
//! This is the only resource mutated by more than one job at a time, so the
//! uniqueness guarantee lives here as a SQL constraint rather than in any
//! in-memory structure. A conflicting insert is rejected by SQLite and
//! reported to the caller; it is never silently dropped.

pub mod models;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{Connection, params};

pub use models::*;

/// SQL predicate selecting rows that participate in the identity constraint.
/// Must agree with `models::is_placeholder_id`.
const IDENTITY_ELIGIBLE: &str =
    "lower(trim(tender_id)) NOT IN ('', 'n/a', 'na', 'none', 'unknown', '-')";

/// Outcome of an insert attempt against the identity constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// The store rejected the row: an identical normalized
    /// (portal, tender_id, closing_date) tuple already exists.
    Duplicate,
}

/// Async-safe handle to the sync store.
///
/// Wraps `SyncStore` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite I/O
/// off the async worker threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<SyncStore>>,
}

impl StoreHandle {
    pub fn new(store: SyncStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SyncStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Store task panicked")?
    }

    /// Acquire the store mutex synchronously. For startup initialization and
    /// tests; not for hot async paths.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, SyncStore>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))
    }
}

pub struct SyncStore {
    conn: Connection,
}

impl SyncStore {
    /// Open (or create) the SQLite database at the given path and run
    /// migrations. Failure here is fatal to the caller.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(&format!(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    portal_name TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    completed_at TEXT,
                    status TEXT NOT NULL DEFAULT 'running',
                    scope_mode TEXT NOT NULL DEFAULT 'full',
                    expected_total INTEGER,
                    extracted_total INTEGER,
                    skipped_total INTEGER
                );

                CREATE TABLE IF NOT EXISTS tenders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id),
                    portal_name TEXT NOT NULL,
                    department_name TEXT NOT NULL DEFAULT '',
                    tender_id TEXT NOT NULL DEFAULT '',
                    closing_date TEXT NOT NULL DEFAULT '',
                    title TEXT NOT NULL DEFAULT '',
                    description TEXT NOT NULL DEFAULT '',
                    source_url TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_runs_portal
                    ON runs(portal_name, started_at);
                CREATE INDEX IF NOT EXISTS idx_runs_status
                    ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_tenders_run
                    ON tenders(run_id);
                CREATE INDEX IF NOT EXISTS idx_tenders_portal
                    ON tenders(portal_name);

                CREATE UNIQUE INDEX IF NOT EXISTS idx_tenders_identity
                    ON tenders(
                        lower(trim(portal_name)),
                        lower(trim(tender_id)),
                        lower(trim(closing_date))
                    )
                    WHERE {IDENTITY_ELIGIBLE};
                ",
            ))
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Run ledger ────────────────────────────────────────────────────

    pub fn create_run(&self, portal: &str, scope: ScopeMode) -> Result<Run> {
        let started_at = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO runs (portal_name, started_at, status, scope_mode)
                 VALUES (?1, ?2, 'running', ?3)",
                params![portal, started_at, scope.as_str()],
            )
            .context("Failed to insert run")?;
        let id = self.conn.last_insert_rowid();
        self.get_run(id)?.context("Run not found after insert")
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, portal_name, started_at, completed_at, status, scope_mode,
                        expected_total, extracted_total, skipped_total
                 FROM runs WHERE id = ?1",
            )
            .context("Failed to prepare get_run")?;
        let mut rows = stmt
            .query_map(params![id], Self::map_run)
            .context("Failed to query run")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read run row")?)),
            None => Ok(None),
        }
    }

    /// The most recent run still marked `running` for this portal, if any.
    pub fn latest_running_run(&self, portal: &str) -> Result<Option<Run>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, portal_name, started_at, completed_at, status, scope_mode,
                        expected_total, extracted_total, skipped_total
                 FROM runs
                 WHERE portal_name = ?1 AND status = 'running'
                 ORDER BY started_at DESC, id DESC LIMIT 1",
            )
            .context("Failed to prepare latest_running_run")?;
        let mut rows = stmt
            .query_map(params![portal], Self::map_run)
            .context("Failed to query running run")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read run row")?)),
            None => Ok(None),
        }
    }

    /// The most recent run for this portal regardless of status.
    pub fn latest_run(&self, portal: &str) -> Result<Option<Run>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, portal_name, started_at, completed_at, status, scope_mode,
                        expected_total, extracted_total, skipped_total
                 FROM runs WHERE portal_name = ?1
                 ORDER BY started_at DESC, id DESC LIMIT 1",
            )
            .context("Failed to prepare latest_run")?;
        let mut rows = stmt
            .query_map(params![portal], Self::map_run)
            .context("Failed to query latest run")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read run row")?)),
            None => Ok(None),
        }
    }

    /// Update run progress counters. Counters never regress: the stored
    /// value is the max of the current and the reported value.
    pub fn update_run_progress(
        &self,
        id: i64,
        expected: Option<i64>,
        extracted: i64,
        skipped: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET
                    expected_total = max(coalesce(expected_total, 0), coalesce(?2, expected_total, 0)),
                    extracted_total = max(coalesce(extracted_total, 0), ?3),
                    skipped_total = max(coalesce(skipped_total, 0), ?4)
                 WHERE id = ?1 AND status = 'running'",
                params![id, expected, extracted, skipped],
            )
            .context("Failed to update run progress")?;
        Ok(())
    }

    /// Move a run to a terminal status, stamping completion. No-op if the
    /// run is already terminal.
    pub fn finish_run(&self, id: i64, status: RunStatus) -> Result<()> {
        debug_assert!(status.is_terminal());
        self.conn
            .execute(
                "UPDATE runs SET status = ?2, completed_at = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id, status.as_str(), Utc::now().to_rfc3339()],
            )
            .context("Failed to finish run")?;
        Ok(())
    }

    /// Oracle cleanup: mark a stale run `timeout_cleaned`. Extracted data is
    /// left untouched.
    pub fn mark_timeout_cleaned(&self, id: i64) -> Result<()> {
        self.finish_run(id, RunStatus::TimeoutCleaned)
    }

    /// Backdate a run's start timestamp. Maintenance/backfill support; also
    /// what lets tests manufacture stale runs.
    pub fn set_run_started_at(&self, id: i64, started_at: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET started_at = ?2 WHERE id = ?1",
                params![id, started_at],
            )
            .context("Failed to set run started_at")?;
        Ok(())
    }

    /// Bulk housekeeping variant of the stall check: `running` runs older
    /// than the threshold with zero recorded progress. Stricter than the
    /// single-portal pre-flight, which also accepts checkpoint evidence.
    pub fn get_stuck_runs(&self, older_than: Duration) -> Result<Vec<Run>> {
        let cutoff = (Utc::now() - older_than).to_rfc3339();
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, portal_name, started_at, completed_at, status, scope_mode,
                        expected_total, extracted_total, skipped_total
                 FROM runs
                 WHERE status = 'running'
                   AND started_at < ?1
                   AND coalesce(extracted_total, 0) = 0
                   AND coalesce(skipped_total, 0) = 0
                 ORDER BY started_at",
            )
            .context("Failed to prepare get_stuck_runs")?;
        let rows = stmt
            .query_map(params![cutoff], Self::map_run)
            .context("Failed to query stuck runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read stuck run row")?);
        }
        Ok(runs)
    }

    pub fn list_portals(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT portal_name FROM runs ORDER BY portal_name")
            .context("Failed to prepare list_portals")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query portals")?;
        let mut portals = Vec::new();
        for row in rows {
            portals.push(row.context("Failed to read portal row")?);
        }
        Ok(portals)
    }

    fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
        let status: String = row.get(4)?;
        let scope: String = row.get(5)?;
        Ok(Run {
            id: row.get(0)?,
            portal_name: row.get(1)?,
            started_at: row.get(2)?,
            completed_at: row.get(3)?,
            status: RunStatus::from_str(&status).unwrap_or(RunStatus::Error),
            scope_mode: ScopeMode::from_str(&scope).unwrap_or(ScopeMode::Full),
            expected_total: row.get(6)?,
            extracted_total: row.get(7)?,
            skipped_total: row.get(8)?,
        })
    }

    // ── Tenders ───────────────────────────────────────────────────────

    /// Insert one tender. A violation of the identity's unique index is
    /// reported as `InsertOutcome::Duplicate`; any other failure, including
    /// other constraint violations, is an error. A row is only ever dropped
    /// because its identity tuple already exists.
    pub fn insert_tender(&self, tender: &NewTender) -> Result<InsertOutcome> {
        let result = self.conn.execute(
            "INSERT INTO tenders (run_id, portal_name, department_name, tender_id,
                                  closing_date, title, description, source_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tender.run_id,
                tender.portal_name,
                tender.department_name,
                tender.tender_id,
                tender.closing_date,
                tender.title,
                tender.description,
                tender.source_url,
            ],
        );
        match result {
            Ok(_) => Ok(InsertOutcome::Inserted(self.conn.last_insert_rowid())),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(e).context("Failed to insert tender"),
        }
    }

    pub fn get_tender(&self, id: i64) -> Result<Option<TenderRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, portal_name, department_name, tender_id,
                        closing_date, title, description, source_url
                 FROM tenders WHERE id = ?1",
            )
            .context("Failed to prepare get_tender")?;
        let mut rows = stmt
            .query_map(params![id], Self::map_tender)
            .context("Failed to query tender")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read tender row")?)),
            None => Ok(None),
        }
    }

    /// All natural keys stored for a portal. The manifest is cross-checked
    /// against this set; the store is the authority.
    pub fn tender_ids_for_portal(&self, portal: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT DISTINCT tender_id FROM tenders
                 WHERE portal_name = ?1 AND {IDENTITY_ELIGIBLE}"
            ))
            .context("Failed to prepare tender_ids_for_portal")?;
        let rows = stmt
            .query_map(params![portal], |row| row.get::<_, String>(0))
            .context("Failed to query tender ids")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read tender id")?);
        }
        Ok(ids)
    }

    pub fn tender_count(&self, portal: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM tenders WHERE portal_name = ?1",
                params![portal],
                |row| row.get(0),
            )
            .context("Failed to count tenders")
    }

    /// Rows exempt from the identity constraint (unextractable keys). These
    /// can legitimately accumulate across runs; surfaced so the growth is
    /// visible rather than silent.
    pub fn placeholder_tender_count(&self, portal: &str) -> Result<i64> {
        self.conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM tenders
                     WHERE portal_name = ?1 AND NOT ({IDENTITY_ELIGIBLE})"
                ),
                params![portal],
                |row| row.get(0),
            )
            .context("Failed to count placeholder tenders")
    }

    /// Out-of-band dedup repair: within each normalized identity group, keep
    /// only the highest-id row. Returns the number of rows deleted; running
    /// it twice in a row deletes zero the second time. Placeholder-keyed
    /// rows are never touched.
    pub fn repair_duplicates(&self) -> Result<usize> {
        let deleted = self
            .conn
            .execute(
                &format!(
                    "DELETE FROM tenders
                     WHERE {IDENTITY_ELIGIBLE}
                       AND id NOT IN (
                           SELECT MAX(id) FROM tenders
                           WHERE {IDENTITY_ELIGIBLE}
                           GROUP BY lower(trim(portal_name)),
                                    lower(trim(tender_id)),
                                    lower(trim(closing_date))
                       )"
                ),
                [],
            )
            .context("Failed to repair duplicate tenders")?;
        Ok(deleted)
    }

    fn map_tender(row: &rusqlite::Row<'_>) -> rusqlite::Result<TenderRecord> {
        Ok(TenderRecord {
            id: row.get(0)?,
            run_id: row.get(1)?,
            portal_name: row.get(2)?,
            department_name: row.get(3)?,
            tender_id: row.get(4)?,
            closing_date: row.get(5)?,
            title: row.get(6)?,
            description: row.get(7)?,
            source_url: row.get(8)?,
        })
    }
}
