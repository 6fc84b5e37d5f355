//! `JobStore` trait — the persistence gateway contract.
//!
//! The only component allowed to read or write job records and their state
//! chunks. The scheduler and completion handler depend on this contract, not
//! on a concrete backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::{Diagnostic, JobRecord};

/// Backend-agnostic persistence gateway for job records.
///
/// All multi-record write operations are atomic per call: every record in the
/// call is persisted or none is. Writes never trigger validation or
/// scheduling side effects — the engine drives those explicitly.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Fetch a job by id, with its state map reassembled from chunks.
    async fn fetch_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError>;

    /// Fetch up to `limit` queued jobs whose scheduled run time is at or
    /// before `now`, excluding the scheduler's self-dispatch marker, ordered
    /// ascending by scheduled run time (ties broken by id).
    async fn fetch_ready(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, DatabaseError>;

    /// Count queued-or-running jobs for an owner, excluding the self-dispatch
    /// marker.
    async fn count_schedulable(&self, owner: &str) -> Result<u64, DatabaseError>;

    /// Count currently running jobs of one runnable type for an owner.
    async fn count_active(&self, owner: &str, kind: &str) -> Result<u64, DatabaseError>;

    /// Insert or replace the given records, replacing each record's state
    /// chunks in full (delete-all-then-insert-all, atomically).
    async fn upsert_jobs(&self, jobs: &[JobRecord]) -> Result<(), DatabaseError>;

    /// Bookkeeping write at dispatch time: status to running, external
    /// execution id, last run time. Does not touch state chunks.
    async fn record_dispatch(
        &self,
        id: Uuid,
        execution_id: &str,
        last_run_time: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Bookkeeping write for external cancellation of an in-flight job:
    /// flips status to cancelled only if the record is still running.
    /// Returns false when the attempt already settled the record, so the
    /// caller can re-read instead of clobbering a terminal status.
    async fn record_cancellation(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Delete the given records and their state chunks, atomically.
    async fn delete_jobs(&self, ids: &[Uuid]) -> Result<(), DatabaseError>;

    /// Append a diagnostic record to a job's trail.
    async fn append_diagnostic(&self, diagnostic: &Diagnostic) -> Result<(), DatabaseError>;

    /// Fetch a job's diagnostic trail, oldest first.
    async fn diagnostics_for(&self, job_id: Uuid) -> Result<Vec<Diagnostic>, DatabaseError>;
}
