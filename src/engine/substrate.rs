//! Execution substrate — runs dispatched attempts.
//!
//! The engine coordinates everything through the durable store; the substrate
//! only runs one attempt per dispatch and hands the outcome to the finalizer
//! exactly once. `TokioSubstrate` is the in-process implementation; tests
//! substitute their own to observe dispatches without running them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::engine::finalizer::Finalizer;
use crate::error::{Error, JobError, ValidationError};
use crate::job::{JobRecord, JobStatus};
use crate::runnable::RunnableRegistry;
use crate::store::JobStore;

/// Dispatches admitted jobs as independent units of work.
#[async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    /// Start one attempt for an admitted job. Records the dispatch in the
    /// store (status running, execution id, last run time) before the attempt
    /// begins, and returns the opaque execution id.
    async fn dispatch(&self, job: JobRecord) -> Result<String, Error>;
}

/// Tokio-backed substrate: each attempt is a spawned task whose outcome is
/// routed to the finalizer. Panics inside `run` are caught at the join point
/// and treated as attempt failures.
pub struct TokioSubstrate {
    store: Arc<dyn JobStore>,
    registry: Arc<RunnableRegistry>,
    finalizer: Arc<Finalizer>,
}

impl TokioSubstrate {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<RunnableRegistry>,
        finalizer: Arc<Finalizer>,
    ) -> Self {
        Self {
            store,
            registry,
            finalizer,
        }
    }
}

#[async_trait]
impl ExecutionSubstrate for TokioSubstrate {
    async fn dispatch(&self, job: JobRecord) -> Result<String, Error> {
        // Resolve before any durable write so a stale binding cannot leave
        // the record stuck in running.
        let runnable = self.registry.get(&job.runnable_type).await.ok_or_else(|| {
            ValidationError::UnknownRunnable {
                kind: job.runnable_type.clone(),
            }
        })?;

        let execution_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        // Durable bookkeeping first: the attempt may finish (and the
        // finalizer re-read the record) before this function returns.
        self.store
            .record_dispatch(job.id, &execution_id, now)
            .await?;

        let mut job = job;
        job.status = JobStatus::Running;
        job.external_execution_id = Some(execution_id.clone());
        job.last_run_time = Some(now);

        tracing::debug!(
            job_id = %job.id,
            kind = %job.runnable_type,
            execution_id = %execution_id,
            "Dispatching job"
        );

        let finalizer = self.finalizer.clone();
        let exec_id = execution_id.clone();
        let pre_run = job.clone();
        tokio::spawn(async move {
            let attempt = tokio::spawn(async move {
                let mut job = job;
                let result = runnable.run(&mut job, &exec_id).await;
                (job, result)
            });
            match attempt.await {
                Ok((job, result)) => finalizer.complete(job, result).await,
                Err(e) => {
                    // State mutations from a panicking run are discarded.
                    finalizer
                        .complete(pre_run, Err(JobError::AttemptPanicked(e.to_string())))
                        .await;
                }
            }
        });

        Ok(execution_id)
    }
}
