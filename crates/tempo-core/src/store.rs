//! Durable sample storage (C2, §4.2).
//!
//! Backed by SQLite through a single [`tokio_rusqlite::Connection`], whose
//! background thread serializes every write against the database, giving
//! single-writer discipline without a hand-rolled connection pool.
use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::error::TempoError;
use crate::model::{HttpMethod, RequestSample, RunDescriptor, RunStatus};

/// Durable store for run descriptors and per-request samples.
pub struct Store {
    conn: Connection,
}

/// Column list shared by every `runs` select so `row_to_descriptor`'s
/// positional indices stay in sync with the query (§3, §6 durable schema).
const RUN_COLUMNS: &str = "internal_key, id, target, mask, users, ramp_up_secs, duration_secs,
     method, body, headers_json, max_concurrent_requests, error_threshold_pct, status,
     started_at, completed_at, total_requests, success_requests, error_requests,
     avg_latency_ms, min_latency_ms, max_latency_ms, rps, stopped_by_circuit";

impl Store {
    /// Opens (creating if absent) the SQLite database at `path` and applies
    /// the schema migration. WAL mode plus a busy timeout keep the writer
    /// thread from colliding with concurrent readers serving live queries.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TempoError> {
        let conn = Connection::open(path.as_ref()).await?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA busy_timeout = 5000;
                 CREATE TABLE IF NOT EXISTS runs (
                     internal_key INTEGER PRIMARY KEY AUTOINCREMENT,
                     id TEXT NOT NULL UNIQUE,
                     target TEXT NOT NULL,
                     mask INTEGER NOT NULL,
                     users INTEGER NOT NULL,
                     ramp_up_secs INTEGER NOT NULL,
                     duration_secs INTEGER NOT NULL,
                     method TEXT NOT NULL,
                     body TEXT,
                     headers_json TEXT,
                     max_concurrent_requests INTEGER NOT NULL DEFAULT 10,
                     error_threshold_pct REAL NOT NULL,
                     status TEXT NOT NULL,
                     started_at TEXT NOT NULL,
                     completed_at TEXT,
                     total_requests INTEGER NOT NULL DEFAULT 0,
                     success_requests INTEGER NOT NULL DEFAULT 0,
                     error_requests INTEGER NOT NULL DEFAULT 0,
                     avg_latency_ms REAL NOT NULL DEFAULT 0,
                     min_latency_ms REAL NOT NULL DEFAULT 0,
                     max_latency_ms REAL NOT NULL DEFAULT 0,
                     rps REAL NOT NULL DEFAULT 0,
                     stopped_by_circuit INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE TABLE IF NOT EXISTS samples (
                     run_key INTEGER NOT NULL,
                     completed_at TEXT NOT NULL,
                     latency_ms REAL NOT NULL,
                     success INTEGER NOT NULL,
                     status_code INTEGER NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_samples_run_key ON samples(run_key);",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Inserts the initial run row and assigns its internal sequential key.
    /// The only storage write whose failure is fatal to the start request
    /// (§4.2): without a row, there is nowhere to append samples.
    pub async fn insert_run(&self, run: &RunDescriptor) -> Result<i64, TempoError> {
        let id = run.id.to_string();
        let target = run.target.clone();
        let method = run.method.to_string();
        let users = run.users;
        let ramp_up_secs = run.ramp_up_secs;
        let duration_secs = run.duration_secs;
        let body = run.body.clone();
        let headers_json = if run.headers.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&run.headers)?)
        };
        let max_concurrent_requests = run.max_concurrent_requests;
        let error_threshold_pct = run.error_threshold_pct;
        let status = run.status.to_string();
        let started_at = run.started_at.to_rfc3339();
        let mask = run.mask;

        let key = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO runs (id, target, mask, users, ramp_up_secs, duration_secs,
                         method, body, headers_json, max_concurrent_requests,
                         error_threshold_pct, status, started_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    rusqlite::params![
                        id,
                        target,
                        i64::from(mask),
                        users,
                        ramp_up_secs,
                        duration_secs,
                        method,
                        body,
                        headers_json,
                        max_concurrent_requests,
                        error_threshold_pct,
                        status,
                        started_at,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(key)
    }

    /// Appends a sample. Failures are logged by the caller and swallowed —
    /// a dropped sample never aborts a run (§7).
    pub async fn append_sample(&self, sample: RequestSample) -> Result<(), TempoError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO samples (run_key, completed_at, latency_ms, success, status_code)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        sample.run_key,
                        sample.completed_at.to_rfc3339(),
                        sample.latency_ms,
                        i64::from(sample.success),
                        sample.status_code,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Finalizes a run: sets status, completion time, and aggregate totals.
    pub async fn finalize_run(
        &self,
        run_key: i64,
        status: RunStatus,
        completed_at: DateTime<Utc>,
        total_requests: u64,
        success_requests: u64,
        error_requests: u64,
        avg_latency_ms: f64,
        min_latency_ms: f64,
        max_latency_ms: f64,
        rps: f64,
        stopped_by_circuit: bool,
    ) -> Result<(), TempoError> {
        let status = status.to_string();
        let completed_at = completed_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE runs SET status = ?1, completed_at = ?2, total_requests = ?3,
                         success_requests = ?4, error_requests = ?5, avg_latency_ms = ?6,
                         min_latency_ms = ?7, max_latency_ms = ?8, rps = ?9,
                         stopped_by_circuit = ?10
                     WHERE internal_key = ?11",
                    rusqlite::params![
                        status,
                        completed_at,
                        total_requests,
                        success_requests,
                        error_requests,
                        avg_latency_ms,
                        min_latency_ms,
                        max_latency_ms,
                        rps,
                        i64::from(stopped_by_circuit),
                        run_key,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Fetches a run descriptor by its opaque caller-visible id.
    pub async fn get_run(&self, id: Uuid) -> Result<Option<RunDescriptor>, TempoError> {
        let id_str = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                if let Some(row) = rows.next()? {
                    Ok(Some(row_to_descriptor(row)?))
                } else {
                    Ok(None)
                }
            })
            .await?;
        Ok(row)
    }

    /// Lists run descriptors with `status = running`, newest first.
    pub async fn list_running(&self) -> Result<Vec<RunDescriptor>, TempoError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE status = 'running' ORDER BY internal_key DESC"
                ))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_descriptor(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    /// Lists completed/stopped run descriptors, newest first, bounded to
    /// `limit` rows.
    pub async fn list_history(&self, limit: u32) -> Result<Vec<RunDescriptor>, TempoError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE status != 'running'
                     ORDER BY internal_key DESC LIMIT ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_descriptor(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    /// Returns every sample recorded for `run_key`, ordered by completion
    /// time, for historical percentile and time-series reconstruction.
    pub async fn query_samples(&self, run_key: i64) -> Result<Vec<RequestSample>, TempoError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT run_key, completed_at, latency_ms, success, status_code
                     FROM samples WHERE run_key = ?1 ORDER BY completed_at ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![run_key])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let completed_at: String = row.get(1)?;
                    out.push(RequestSample {
                        run_key: row.get(0)?,
                        completed_at: parse_rfc3339(&completed_at),
                        latency_ms: row.get(2)?,
                        success: row.get::<_, i64>(3)? != 0,
                        status_code: row.get(4)?,
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }
}

fn row_to_descriptor(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunDescriptor> {
    let id_str: String = row.get(1)?;
    let method_str: String = row.get(7)?;
    let headers_json: Option<String> = row.get(9)?;
    let status_str: String = row.get(12)?;
    let started_at: String = row.get(13)?;
    let completed_at: Option<String> = row.get(14)?;
    let headers: HashMap<String, String> = headers_json
        .map(|json| serde_json::from_str(&json).unwrap_or_default())
        .unwrap_or_default();

    Ok(RunDescriptor {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        internal_key: Some(row.get(0)?),
        target: row.get(2)?,
        mask: row.get::<_, i64>(3)? != 0,
        users: row.get(4)?,
        ramp_up_secs: row.get(5)?,
        duration_secs: row.get(6)?,
        method: parse_method(&method_str),
        body: row.get(8)?,
        headers,
        max_concurrent_requests: row.get(10)?,
        error_threshold_pct: row.get(11)?,
        auth: None,
        status: parse_status(&status_str),
        started_at: parse_rfc3339(&started_at),
        completed_at: completed_at.map(|s| parse_rfc3339(&s)),
        total_requests: row.get(15)?,
        success_requests: row.get(16)?,
        error_requests: row.get(17)?,
        avg_latency_ms: row.get(18)?,
        min_latency_ms: row.get(19)?,
        max_latency_ms: row.get(20)?,
        rps: row.get(21)?,
        stopped_by_circuit: row.get::<_, i64>(22)? != 0,
    })
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

fn parse_method(s: &str) -> HttpMethod {
    match s {
        "POST" => HttpMethod::Post,
        "PUT" => HttpMethod::Put,
        "DELETE" => HttpMethod::Delete,
        "PATCH" => HttpMethod::Patch,
        "HEAD" => HttpMethod::Head,
        "OPTIONS" => HttpMethod::Options,
        _ => HttpMethod::Get,
    }
}

fn parse_status(s: &str) -> RunStatus {
    match s {
        "stopped" => RunStatus::Stopped,
        "completed" => RunStatus::Completed,
        _ => RunStatus::Running,
    }
}
