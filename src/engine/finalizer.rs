//! Completion handler — interprets attempt outcomes and drives the state
//! machine.
//!
//! Invoked exactly once per dispatched attempt. This is the last line of
//! defense: nothing here propagates. Internal errors are appended to the
//! job's diagnostic trail and the record is repaired out of `running` so it
//! can never be left in an ambiguous status.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;

use crate::error::{Error, JobError, ValidationError};
use crate::job::{Diagnostic, JobRecord, JobStatus};
use crate::runnable::{ErrorDisposition, RunnableRegistry};
use crate::store::JobStore;

/// Decides a completed job's next state: success, terminal failure, retry,
/// or cancellation.
pub struct Finalizer {
    store: Arc<dyn JobStore>,
    registry: Arc<RunnableRegistry>,
    /// Wakes the scheduler when a retry re-enters the queue.
    wake: Arc<Notify>,
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<RunnableRegistry>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            registry,
            wake,
        }
    }

    /// Handle one completed attempt. `snapshot` is the in-memory record as
    /// the attempt left it; `result` is the attempt outcome. Never errors:
    /// failures inside completion handling are recorded as diagnostics.
    pub async fn complete(&self, snapshot: JobRecord, result: Result<(), JobError>) {
        let job_id = snapshot.id;
        if let Err(e) = self.try_complete(snapshot, result).await {
            tracing::error!(job_id = %job_id, error = %e, "Completion handling failed");
            let diagnostic =
                Diagnostic::new(job_id, format!("completion handling failed: {e}"));
            if let Err(e) = self.store.append_diagnostic(&diagnostic).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to append diagnostic");
            }
            self.repair(job_id).await;
        }
    }

    async fn try_complete(
        &self,
        snapshot: JobRecord,
        result: Result<(), JobError>,
    ) -> Result<(), Error> {
        // The durable copy is authoritative for status and retry bookkeeping;
        // the snapshot only contributes the state map mutated by `run`.
        let Some(mut durable) = self.store.fetch_job(snapshot.id).await? else {
            tracing::warn!(job_id = %snapshot.id, "Completed job no longer in store");
            return Ok(());
        };

        let runnable = self
            .registry
            .get(&durable.runnable_type)
            .await
            .ok_or_else(|| ValidationError::UnknownRunnable {
                kind: durable.runnable_type.clone(),
            })?;

        // External cancellation while running wins over the attempt outcome.
        if durable.status == JobStatus::Cancelled {
            tracing::info!(job_id = %durable.id, "Job was cancelled while running");
            let keep = runnable.on_cancellation(&durable).await;
            if !keep {
                self.store.delete_jobs(&[durable.id]).await?;
            }
            return Ok(());
        }

        match result {
            Ok(()) => {
                // State mutations made by `run` persist only on this path.
                let mut done = snapshot;
                done.status = durable.status;
                done.transition_to(JobStatus::Succeeded)?;
                let keep = runnable.on_success(&done).await;
                tracing::info!(job_id = %done.id, keep, "Job succeeded");
                if keep {
                    self.store.upsert_jobs(&[done]).await?;
                } else {
                    self.store.delete_jobs(&[done.id]).await?;
                }
            }
            Err(error) => {
                if durable.retries_exhausted() {
                    durable.transition_to(JobStatus::Failed)?;
                    let keep = runnable.on_failure(&durable, &error).await;
                    tracing::warn!(
                        job_id = %durable.id,
                        retry_number = durable.retry_number,
                        error = %error,
                        keep,
                        "Job failed, retries exhausted"
                    );
                    if keep {
                        self.store.upsert_jobs(&[durable]).await?;
                    } else {
                        self.store.delete_jobs(&[durable.id]).await?;
                    }
                } else {
                    match runnable.on_error(&durable, &error).await {
                        ErrorDisposition::Retry => {
                            durable.retry_number += 1;
                            durable.scheduled_run_time = Utc::now()
                                + chrono::Duration::milliseconds(durable.retry_interval_ms);
                            durable.transition_to(JobStatus::Queued)?;
                            tracing::info!(
                                job_id = %durable.id,
                                retry_number = durable.retry_number,
                                error = %error,
                                "Attempt failed, retrying"
                            );
                            self.store.upsert_jobs(&[durable]).await?;
                            self.wake.notify_one();
                        }
                        ErrorDisposition::Cancel => {
                            durable.transition_to(JobStatus::Cancelled)?;
                            // Both cancellation sources invoke on_cancellation;
                            // see the cancellation notes in DESIGN.md.
                            let keep = runnable.on_cancellation(&durable).await;
                            tracing::info!(
                                job_id = %durable.id,
                                keep,
                                "Job cancelled by on_error"
                            );
                            if keep {
                                self.store.upsert_jobs(&[durable]).await?;
                            } else {
                                self.store.delete_jobs(&[durable.id]).await?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Best-effort repair: a record must never be left in `running` after its
    /// attempt completed.
    async fn repair(&self, job_id: uuid::Uuid) {
        match self.store.fetch_job(job_id).await {
            Ok(Some(mut job)) if job.status == JobStatus::Running => {
                if job.transition_to(JobStatus::Failed).is_ok()
                    && let Err(e) = self.store.upsert_jobs(&[job]).await
                {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to repair job status");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to re-read job for repair");
            }
        }
    }
}
