//! libSQL backend — async `JobStore` implementation.
//!
//! Supports local file and in-memory databases. State maps are serialized to
//! canonical JSON and stored as an ordered sequence of fixed-size chunks;
//! every persist replaces a job's chunks in full inside one transaction.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::{Diagnostic, JobRecord, JobState, JobStatus};
use crate::runnable::SCHEDULER_KIND;
use crate::store::migrations;
use crate::store::traits::JobStore;

/// Columns selected by every job query, in `row_to_job` order.
const JOB_COLUMNS: &str = "id, owner, status, runnable_type, reference, maximum_retries, \
     retry_number, retry_interval_ms, scheduled_run_time, last_run_time, external_execution_id";

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    chunk_size: usize,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, chunk_size: usize) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            chunk_size,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// Create an in-memory store (for tests).
    pub async fn new_memory(chunk_size: usize) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            chunk_size,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Load and reassemble a job's state map from its chunks.
    async fn load_state(&self, job_id: Uuid) -> Result<JobState, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT chunk FROM job_state_chunks WHERE job_id = ?1 ORDER BY seq ASC",
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_state: {e}")))?;

        let mut joined = String::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let chunk: String = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("load_state chunk: {e}")))?;
                    joined.push_str(&chunk);
                }
                Ok(None) => break,
                // A truncated chunk stream must never masquerade as a
                // complete (smaller) state map.
                Err(e) => return Err(DatabaseError::Query(format!("load_state: {e}"))),
            }
        }

        if joined.is_empty() {
            return Ok(JobState::new());
        }
        serde_json::from_str(&joined)
            .map_err(|e| DatabaseError::Serialization(format!("state map parse: {e}")))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical fixed-width timestamp format, so lexicographic SQL comparisons
/// agree with chronological order.
fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert a JobStatus to its DB string.
fn status_to_str(status: &JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Succeeded => "succeeded",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

/// Parse a status string from the DB.
fn str_to_status(s: &str) -> JobStatus {
    match s {
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "succeeded" => JobStatus::Succeeded,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        _ => JobStatus::Pending,
    }
}

/// Split a serialized state map into chunks of at most `size` bytes,
/// respecting char boundaries.
fn split_chunks(s: &str, size: usize) -> Vec<&str> {
    let size = size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < s.len() {
        let mut end = (start + size).min(s.len());
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        chunks.push(&s[start..end]);
        start = end;
    }
    chunks
}

/// Map a libsql row to a JobRecord. Column order matches JOB_COLUMNS.
/// The state map is loaded separately from its chunks.
fn row_to_job(row: &libsql::Row) -> Result<JobRecord, libsql::Error> {
    let id_str: String = row.get(0)?;
    let owner: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let runnable_type: String = row.get(3)?;
    let reference: String = row.get(4)?;
    let maximum_retries: i64 = row.get(5)?;
    let retry_number: i64 = row.get(6)?;
    let retry_interval_ms: i64 = row.get(7)?;
    let scheduled_str: String = row.get(8)?;
    let last_run_str: Option<String> = row.get(9).ok();
    let external_execution_id: Option<String> = row.get(10).ok();

    Ok(JobRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        owner,
        status: str_to_status(&status_str),
        runnable_type,
        reference,
        maximum_retries: maximum_retries.max(0) as u32,
        retry_number: retry_number.max(0) as u32,
        retry_interval_ms,
        scheduled_run_time: parse_datetime(&scheduled_str),
        last_run_time: last_run_str.as_deref().map(parse_datetime),
        state: JobState::new(),
        external_execution_id,
    })
}

#[async_trait]
impl JobStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn fetch_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let mut job = row_to_job(&row)
                    .map_err(|e| DatabaseError::Query(format!("fetch_job row parse: {e}")))?;
                job.state = self.load_state(job.id).await?;
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("fetch_job: {e}"))),
        }
    }

    async fn fetch_ready(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE owner = ?1 AND status = 'queued' \
                       AND scheduled_run_time <= ?2 AND runnable_type != ?3 \
                     ORDER BY scheduled_run_time ASC, id ASC LIMIT ?4"
                ),
                params![owner, fmt_datetime(now), SCHEDULER_KIND, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_ready: {e}")))?;

        let mut jobs = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => match row_to_job(&row) {
                    Ok(job) => jobs.push(job),
                    Err(e) => {
                        tracing::warn!("Skipping job row: {e}");
                    }
                },
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("fetch_ready: {e}"))),
            }
        }
        for job in &mut jobs {
            job.state = self.load_state(job.id).await?;
        }
        Ok(jobs)
    }

    async fn count_schedulable(&self, owner: &str) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM jobs \
                 WHERE owner = ?1 AND status IN ('queued', 'running') \
                   AND runnable_type != ?2",
                params![owner, SCHEDULER_KIND],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_schedulable: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_schedulable: {e}")))?;
        let count: i64 = row
            .map(|r| r.get(0))
            .transpose()
            .map_err(|e| DatabaseError::Query(format!("count_schedulable: {e}")))?
            .unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    async fn count_active(&self, owner: &str, kind: &str) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM jobs \
                 WHERE owner = ?1 AND status = 'running' AND runnable_type = ?2",
                params![owner, kind],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_active: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_active: {e}")))?;
        let count: i64 = row
            .map(|r| r.get(0))
            .transpose()
            .map_err(|e| DatabaseError::Query(format!("count_active: {e}")))?
            .unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    async fn upsert_jobs(&self, jobs: &[JobRecord]) -> Result<(), DatabaseError> {
        if jobs.is_empty() {
            return Ok(());
        }

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("upsert_jobs begin: {e}")))?;

        let result = async {
            for job in jobs {
                tx.execute(
                    "INSERT INTO jobs (id, owner, status, runnable_type, reference, \
                         maximum_retries, retry_number, retry_interval_ms, \
                         scheduled_run_time, last_run_time, external_execution_id, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                     ON CONFLICT(id) DO UPDATE SET \
                         owner = excluded.owner, \
                         status = excluded.status, \
                         runnable_type = excluded.runnable_type, \
                         reference = excluded.reference, \
                         maximum_retries = excluded.maximum_retries, \
                         retry_number = excluded.retry_number, \
                         retry_interval_ms = excluded.retry_interval_ms, \
                         scheduled_run_time = excluded.scheduled_run_time, \
                         last_run_time = excluded.last_run_time, \
                         external_execution_id = excluded.external_execution_id, \
                         updated_at = excluded.updated_at",
                    params![
                        job.id.to_string(),
                        job.owner.clone(),
                        status_to_str(&job.status),
                        job.runnable_type.clone(),
                        job.reference.clone(),
                        job.maximum_retries as i64,
                        job.retry_number as i64,
                        job.retry_interval_ms,
                        fmt_datetime(job.scheduled_run_time),
                        job.last_run_time.map(fmt_datetime),
                        job.external_execution_id.clone(),
                        fmt_datetime(Utc::now()),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("upsert_jobs insert: {e}")))?;

                // Full state replacement: delete all prior chunks, reinsert.
                tx.execute(
                    "DELETE FROM job_state_chunks WHERE job_id = ?1",
                    params![job.id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("upsert_jobs chunk delete: {e}")))?;

                if !job.state.is_empty() {
                    let serialized = serde_json::to_string(&job.state).map_err(|e| {
                        DatabaseError::Serialization(format!("state map serialize: {e}"))
                    })?;
                    for (seq, chunk) in split_chunks(&serialized, self.chunk_size)
                        .into_iter()
                        .enumerate()
                    {
                        tx.execute(
                            "INSERT INTO job_state_chunks (job_id, seq, chunk) VALUES (?1, ?2, ?3)",
                            params![job.id.to_string(), seq as i64, chunk],
                        )
                        .await
                        .map_err(|e| {
                            DatabaseError::Query(format!("upsert_jobs chunk insert: {e}"))
                        })?;
                    }
                }
            }
            Ok::<(), DatabaseError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Transaction(format!("upsert_jobs commit: {e}")))?;
                debug!(count = jobs.len(), "Jobs upserted");
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn record_dispatch(
        &self,
        id: Uuid,
        execution_id: &str,
        last_run_time: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        // Bookkeeping write only: state chunks are left untouched so a
        // dispatch can never clobber runnable-owned state.
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'running', external_execution_id = ?1, \
                     last_run_time = ?2, updated_at = ?3 \
                 WHERE id = ?4 AND status = 'queued'",
                params![
                    execution_id,
                    fmt_datetime(last_run_time),
                    fmt_datetime(Utc::now()),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_dispatch: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "queued job".to_string(),
                id: id.to_string(),
            });
        }
        debug!(job_id = %id, execution_id, "Dispatch recorded");
        Ok(())
    }

    async fn record_cancellation(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'cancelled', updated_at = ?1 \
                 WHERE id = ?2 AND status = 'running'",
                params![fmt_datetime(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_cancellation: {e}")))?;
        if affected > 0 {
            debug!(job_id = %id, "Cancellation recorded");
        }
        Ok(affected > 0)
    }

    async fn delete_jobs(&self, ids: &[Uuid]) -> Result<(), DatabaseError> {
        if ids.is_empty() {
            return Ok(());
        }

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("delete_jobs begin: {e}")))?;

        let result = async {
            for id in ids {
                tx.execute(
                    "DELETE FROM job_state_chunks WHERE job_id = ?1",
                    params![id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("delete_jobs chunks: {e}")))?;
                tx.execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
                    .await
                    .map_err(|e| DatabaseError::Query(format!("delete_jobs: {e}")))?;
            }
            Ok::<(), DatabaseError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Transaction(format!("delete_jobs commit: {e}")))?;
                debug!(count = ids.len(), "Jobs deleted");
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn append_diagnostic(&self, diagnostic: &Diagnostic) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO job_diagnostics (job_id, message, recorded_at) VALUES (?1, ?2, ?3)",
                params![
                    diagnostic.job_id.to_string(),
                    diagnostic.message.clone(),
                    fmt_datetime(diagnostic.recorded_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_diagnostic: {e}")))?;
        Ok(())
    }

    async fn diagnostics_for(&self, job_id: Uuid) -> Result<Vec<Diagnostic>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT job_id, message, recorded_at FROM job_diagnostics \
                 WHERE job_id = ?1 ORDER BY id ASC",
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("diagnostics_for: {e}")))?;

        let mut diagnostics = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let id_str: String = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("diagnostics_for: {e}")))?;
                    let message: String = row
                        .get(1)
                        .map_err(|e| DatabaseError::Query(format!("diagnostics_for: {e}")))?;
                    let recorded_str: String = row
                        .get(2)
                        .map_err(|e| DatabaseError::Query(format!("diagnostics_for: {e}")))?;
                    diagnostics.push(Diagnostic {
                        job_id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
                        message,
                        recorded_at: parse_datetime(&recorded_str),
                    });
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("diagnostics_for: {e}"))),
            }
        }
        Ok(diagnostics)
    }
}
