//! Scheduler — the admission control loop.
//!
//! Each pass selects queued jobs that are due, enforces the per-type
//! concurrency ceiling against currently running jobs (plus jobs admitted
//! earlier in the same pass), and dispatches the admitted ones. Jobs that a
//! pass could not admit form the residual set, which the loop feeds straight
//! into the next pass so older eligible work keeps its place.
//!
//! The loop is the only pass driver and there is exactly one loop per engine,
//! which is what enforces the scheduler's own concurrency ceiling of 1.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Notify, watch};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::engine::substrate::ExecutionSubstrate;
use crate::error::Error;
use crate::job::{Diagnostic, JobRecord, JobStatus};
use crate::runnable::{RunnableRegistry, SCHEDULER_KIND};
use crate::store::JobStore;

/// Shared dependencies for the scheduler.
pub struct SchedulerDeps {
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<RunnableRegistry>,
    pub substrate: Arc<dyn ExecutionSubstrate>,
}

/// Result of one admission pass.
#[derive(Debug, Default)]
pub struct PassOutcome {
    /// Jobs dispatched by this pass, in admission order.
    pub admitted: Vec<Uuid>,
    /// Eligible jobs the pass could not admit (concurrency ceiling or batch
    /// overflow), carried into the next pass.
    pub residual: Vec<Uuid>,
    /// Whether more queued jobs were due when the pass finished.
    pub more_ready: bool,
    /// True when another pass was already in flight and this call did nothing.
    pub skipped: bool,
}

/// Admission-control scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    deps: SchedulerDeps,
    wake: Arc<Notify>,
    /// Serializes passes; a pass that finds another in flight is a no-op.
    pass_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, deps: SchedulerDeps, wake: Arc<Notify>) -> Self {
        Self {
            config,
            deps,
            wake,
            pass_lock: Mutex::new(()),
        }
    }

    /// Run one admission pass. `residual` carries ids a previous pass could
    /// not admit; they are considered ahead of the ready query.
    pub async fn run_pass(&self, residual: Vec<Uuid>) -> Result<PassOutcome, Error> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            return Ok(PassOutcome {
                skipped: true,
                ..PassOutcome::default()
            });
        };

        let now = Utc::now();
        let owner = &self.config.owner;
        let limit = self.config.max_jobs_per_pass;

        // Residual jobs first: re-read each and keep the ones still eligible.
        let mut candidates: Vec<JobRecord> = Vec::new();
        for id in residual {
            match self.deps.store.fetch_job(id).await? {
                Some(job)
                    if job.owner == *owner
                        && job.status == JobStatus::Queued
                        && job.scheduled_run_time <= now
                        && job.runnable_type != SCHEDULER_KIND =>
                {
                    candidates.push(job);
                }
                _ => {}
            }
        }

        // Fill the batch from the ready query, skipping residual duplicates.
        for job in self.deps.store.fetch_ready(owner, limit, now).await? {
            if !candidates.iter().any(|c| c.id == job.id) {
                candidates.push(job);
            }
        }
        candidates.sort_by(|a, b| {
            a.scheduled_run_time
                .cmp(&b.scheduled_run_time)
                .then(a.id.cmp(&b.id))
        });
        let overflow: Vec<Uuid> = candidates
            .split_off(limit.min(candidates.len()))
            .into_iter()
            .map(|j| j.id)
            .collect();

        let mut outcome = PassOutcome::default();
        // Active counts are read once per kind, then projected forward as
        // this pass admits jobs, so same-kind candidates throttle each other.
        let mut active: HashMap<String, u64> = HashMap::new();
        let mut projected: HashMap<String, u64> = HashMap::new();

        for job in candidates {
            let kind = job.runnable_type.clone();
            let Some(runnable) = self.deps.registry.get(&kind).await else {
                // The validation gate should make this impossible; pull the
                // job out of the queue so it cannot wedge every later pass.
                self.orphan(job).await?;
                continue;
            };
            let ceiling = runnable.maximum_active().max(1) as u64;

            let base = match active.get(&kind) {
                Some(n) => *n,
                None => {
                    let n = self.deps.store.count_active(owner, &kind).await?;
                    active.insert(kind.clone(), n);
                    n
                }
            };
            let in_pass = projected.get(&kind).copied().unwrap_or(0);

            if base + in_pass >= ceiling {
                outcome.residual.push(job.id);
                continue;
            }

            let job_id = job.id;
            match self.deps.substrate.dispatch(job).await {
                Ok(execution_id) => {
                    tracing::debug!(
                        job_id = %job_id,
                        kind = %kind,
                        execution_id = %execution_id,
                        "Job admitted"
                    );
                    *projected.entry(kind).or_insert(0) += 1;
                    outcome.admitted.push(job_id);
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Dispatch failed");
                    let diagnostic =
                        Diagnostic::new(job_id, format!("dispatch failed: {e}"));
                    if let Err(e) = self.deps.store.append_diagnostic(&diagnostic).await {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to append diagnostic");
                    }
                    outcome.residual.push(job_id);
                }
            }
        }

        outcome.residual.extend(overflow);
        outcome.more_ready = !self
            .deps
            .store
            .fetch_ready(owner, 1, Utc::now())
            .await?
            .is_empty();

        if !outcome.admitted.is_empty() || !outcome.residual.is_empty() {
            tracing::info!(
                admitted = outcome.admitted.len(),
                residual = outcome.residual.len(),
                more_ready = outcome.more_ready,
                "Admission pass complete"
            );
        }
        Ok(outcome)
    }

    /// Run passes until shutdown, sleeping when idle. Residual ids from each
    /// pass are fed into the next one.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut residual: Vec<Uuid> = Vec::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_pass(std::mem::take(&mut residual)).await {
                Ok(outcome) => {
                    residual = outcome.residual;
                    if residual.is_empty() && !outcome.more_ready {
                        // Idle throttle: wait for new work, the idle delay,
                        // or shutdown, whichever comes first.
                        tokio::select! {
                            _ = self.wake.notified() => {}
                            _ = tokio::time::sleep(self.config.idle_delay) => {}
                            _ = shutdown.changed() => {}
                        }
                    } else {
                        // Concurrency-blocked residual work frees up only on
                        // completion; wait rather than spinning on it.
                        if outcome.admitted.is_empty() && !residual.is_empty() {
                            tokio::select! {
                                _ = self.wake.notified() => {}
                                _ = tokio::time::sleep(self.config.idle_delay) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Admission pass failed");
                    tokio::time::sleep(self.config.idle_delay).await;
                }
            }
        }
        tracing::info!("Scheduler loop stopped");
    }

    /// Wake the loop if it is idle.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Remove a queued job whose runnable type has no binding.
    async fn orphan(&self, mut job: JobRecord) -> Result<(), Error> {
        tracing::warn!(job_id = %job.id, kind = %job.runnable_type, "No runnable bound for queued job");
        let diagnostic = Diagnostic::new(
            job.id,
            format!("no runnable registered for type {}", job.runnable_type),
        );
        self.deps.store.append_diagnostic(&diagnostic).await?;
        job.transition_to(JobStatus::Cancelled)?;
        self.deps.store.upsert_jobs(&[job]).await?;
        Ok(())
    }
}
