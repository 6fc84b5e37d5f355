//! Job records and the job status state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created but not yet admitted to the queue.
    Pending,
    /// Waiting for dispatch.
    Queued,
    /// Dispatched to the execution substrate.
    Running,
    /// Final attempt succeeded.
    Succeeded,
    /// Retries exhausted.
    Failed,
    /// Abandoned, either externally or by the runnable.
    Cancelled,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Pending (validation gate)
            (Pending, Queued) | (Pending, Cancelled) |
            // From Queued
            (Queued, Running) | (Queued, Cancelled) |
            // From Running; Running -> Queued is a retry
            (Running, Succeeded) | (Running, Failed) |
            (Running, Queued) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Check if the job counts toward its type's concurrency ceiling.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Opaque string-keyed state owned by the runnable.
///
/// Round-trips verbatim across persistence; a `BTreeMap` keeps the serialized
/// form canonical so chunking is deterministic.
pub type JobState = BTreeMap<String, String>;

/// Durable description of one schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job ID, assigned at creation and immutable thereafter.
    pub id: Uuid,
    /// Identity of the submitting principal; scopes every store query.
    pub owner: String,
    /// Current status.
    pub status: JobStatus,
    /// Runnable type name, re-resolved on every dispatch.
    pub runnable_type: String,
    /// Caller-supplied label, not interpreted by the engine.
    pub reference: String,
    /// Ceiling on re-attempts after the first.
    pub maximum_retries: u32,
    /// Current attempt count; 0 on the first run.
    pub retry_number: u32,
    /// Minimum delay in milliseconds between a failed attempt and the next run.
    pub retry_interval_ms: i64,
    /// Timestamp after which the job is eligible for dispatch; ordering key.
    pub scheduled_run_time: DateTime<Utc>,
    /// Timestamp of the most recent dispatch.
    pub last_run_time: Option<DateTime<Utc>>,
    /// Runnable-owned state, persisted as chunked blobs.
    pub state: JobState,
    /// Identifier of the dispatched task in the execution substrate.
    pub external_execution_id: Option<String>,
}

impl JobRecord {
    /// Create an unpersisted record in `Pending` status.
    pub fn new(
        owner: impl Into<String>,
        runnable_type: impl Into<String>,
        reference: impl Into<String>,
        maximum_retries: u32,
        retry_interval_ms: i64,
        state: JobState,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            status: JobStatus::Pending,
            runnable_type: runnable_type.into(),
            reference: reference.into(),
            maximum_retries,
            retry_number: 0,
            retry_interval_ms,
            scheduled_run_time: Utc::now(),
            last_run_time: None,
            state,
            external_execution_id: None,
        }
    }

    /// True when a further failure routes to `on_failure` instead of `on_error`.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_number >= self.maximum_retries
    }

    /// Transition to a new status, enforcing the state machine.
    pub fn transition_to(&mut self, target: JobStatus) -> Result<(), crate::error::JobError> {
        if !self.status.can_transition_to(target) {
            return Err(crate::error::JobError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        Ok(())
    }
}

/// Diagnostic record appended when completion handling hits an internal error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub job_id: Uuid,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

impl Diagnostic {
    pub fn new(job_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            job_id,
            message: message.into(),
            recorded_at: Utc::now(),
        }
    }
}
