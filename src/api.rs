//! Public engine façade.
//!
//! Callers create job records, queue them through the validation gate, and
//! inspect or cancel them later. Everything after `queue_jobs` returns is
//! asynchronous; later lifecycle errors are visible only on the persisted
//! record and its diagnostic trail.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::engine::{Finalizer, Scheduler, SchedulerDeps, TokioSubstrate};
use crate::error::{Error, JobError, Result, ValidationError};
use crate::job::{Diagnostic, JobRecord, JobState, JobStatus};
use crate::runnable::{RunnableRegistry, SCHEDULER_KIND};
use crate::store::JobStore;

/// Durable job engine: validation gate, scheduler, and completion handling
/// wired over one store and one runnable registry.
pub struct JobEngine {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<RunnableRegistry>,
    scheduler: Arc<Scheduler>,
    wake: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobEngine {
    /// Wire an engine over a store and registry.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        registry: Arc<RunnableRegistry>,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let finalizer = Arc::new(Finalizer::new(
            store.clone(),
            registry.clone(),
            wake.clone(),
        ));
        let substrate = Arc::new(TokioSubstrate::new(
            store.clone(),
            registry.clone(),
            finalizer,
        ));
        let scheduler = Arc::new(Scheduler::new(
            config.clone(),
            SchedulerDeps {
                store: store.clone(),
                registry: registry.clone(),
                substrate,
            },
            wake.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            store,
            registry,
            scheduler,
            wake,
            shutdown_tx,
            loop_handle: Mutex::new(None),
        }
    }

    /// The runnable registry this engine dispatches from.
    pub fn registry(&self) -> &Arc<RunnableRegistry> {
        &self.registry
    }

    /// Build an unpersisted job record in `pending` status, bound to a
    /// runnable type and owned by this engine's owner.
    pub fn create_job(
        &self,
        kind: impl Into<String>,
        reference: impl Into<String>,
        maximum_retries: u32,
        retry_interval_ms: i64,
        initial_state: JobState,
    ) -> JobRecord {
        JobRecord::new(
            self.config.owner.clone(),
            kind,
            reference,
            maximum_retries,
            retry_interval_ms,
            initial_state,
        )
    }

    /// Validation gate plus persistence: admit pending records to the queue.
    ///
    /// Every record must bind to a registered runnable type; admitted records
    /// get `retry_number` reset to 0, `scheduled_run_time` stamped now, and
    /// status `queued`. The call is atomic: one bad record rejects the batch.
    pub async fn queue_jobs(&self, jobs: Vec<JobRecord>) -> Result<Vec<JobRecord>> {
        let mut admitted = Vec::with_capacity(jobs.len());
        let now = Utc::now();
        for mut job in jobs {
            if job.status != JobStatus::Pending {
                return Err(ValidationError::WrongStatus {
                    id: job.id,
                    status: job.status.to_string(),
                    expected: JobStatus::Pending.to_string(),
                }
                .into());
            }
            if job.runnable_type == SCHEDULER_KIND {
                return Err(ValidationError::ReservedRunnable {
                    kind: job.runnable_type,
                }
                .into());
            }
            if !self.registry.has(&job.runnable_type).await {
                return Err(ValidationError::UnknownRunnable {
                    kind: job.runnable_type,
                }
                .into());
            }
            if job.owner != self.config.owner {
                return Err(ValidationError::InvalidRecord {
                    reason: format!(
                        "job {} is owned by {}, engine owner is {}",
                        job.id, job.owner, self.config.owner
                    ),
                }
                .into());
            }
            job.retry_number = 0;
            job.scheduled_run_time = now;
            job.transition_to(JobStatus::Queued).map_err(Error::Job)?;
            admitted.push(job);
        }

        self.store.upsert_jobs(&admitted).await?;
        tracing::info!(count = admitted.len(), "Jobs queued");
        self.wake.notify_one();
        Ok(admitted)
    }

    /// Cancel a job. Queued jobs are cancelled immediately and
    /// `on_cancellation` decides retention; running jobs are flagged so the
    /// completion handler invokes `on_cancellation` once the attempt ends.
    pub async fn cancel_job(&self, id: Uuid) -> Result<()> {
        loop {
            let Some(mut job) = self.store.fetch_job(id).await? else {
                return Err(JobError::NotFound { id }.into());
            };

            match job.status {
                JobStatus::Pending | JobStatus::Queued => {
                    job.transition_to(JobStatus::Cancelled).map_err(Error::Job)?;
                    let runnable =
                        self.registry.get(&job.runnable_type).await.ok_or_else(|| {
                            ValidationError::UnknownRunnable {
                                kind: job.runnable_type.clone(),
                            }
                        })?;
                    let keep = runnable.on_cancellation(&job).await;
                    tracing::info!(job_id = %id, keep, "Queued job cancelled");
                    if keep {
                        self.store.upsert_jobs(&[job]).await?;
                    } else {
                        self.store.delete_jobs(&[id]).await?;
                    }
                    return Ok(());
                }
                JobStatus::Running => {
                    // Conditional write: the attempt may settle the record
                    // between the read above and this update. Zero affected
                    // rows means the finalizer won; re-read and decide again
                    // from the fresh status.
                    if self.store.record_cancellation(id).await? {
                        tracing::info!(job_id = %id, "Running job flagged for cancellation");
                        return Ok(());
                    }
                }
                status => {
                    return Err(JobError::InvalidTransition {
                        id,
                        from: status.to_string(),
                        to: JobStatus::Cancelled.to_string(),
                    }
                    .into());
                }
            }
        }
    }

    /// Fetch a job record for inspection.
    pub async fn job(&self, id: Uuid) -> Result<Option<JobRecord>> {
        Ok(self.store.fetch_job(id).await?)
    }

    /// Fetch a job's diagnostic trail, oldest first.
    pub async fn diagnostics(&self, id: Uuid) -> Result<Vec<Diagnostic>> {
        Ok(self.store.diagnostics_for(id).await?)
    }

    /// Count queued-or-running jobs for this engine's owner.
    pub async fn pending_work(&self) -> Result<u64> {
        Ok(self.store.count_schedulable(&self.config.owner).await?)
    }

    /// Start the scheduler loop. Idempotent: a second call while the loop is
    /// alive is a no-op, so there is never more than one active scheduler.
    pub async fn start(&self) {
        let mut handle = self.loop_handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let scheduler = self.scheduler.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(scheduler.run_loop(shutdown_rx)));
        tracing::info!(owner = %self.config.owner, "Scheduler started");
    }

    /// Stop the scheduler loop and wait for it to exit. In-flight attempts
    /// keep running; their completions are still handled.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.wake.notify_one();
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
