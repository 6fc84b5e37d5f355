//! Runnable contract and registry.
//!
//! A `Runnable` is the user-supplied behavior bound to a job record's type:
//! the work itself plus the lifecycle callbacks the completion handler drives.
//! No runnable instance survives across attempts — the registry re-resolves
//! the type name on every dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{JobError, ValidationError};
use crate::job::JobRecord;

/// Reserved runnable type name for the scheduler's own self-dispatch marker.
///
/// Kept in the durable format for compatibility: eligibility and count queries
/// exclude it, and it can never be registered as ordinary work.
pub const SCHEDULER_KIND: &str = "__scheduler__";

/// What to do after a failed attempt that still has retries remaining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Re-queue the job for another attempt (the default).
    Retry,
    /// Abandon the job; `on_cancellation` decides record retention.
    Cancel,
}

/// User-supplied behavior plus lifecycle callbacks for one job type.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Type name used to bind job records to this implementation.
    fn kind(&self) -> &str;

    /// Hard concurrency ceiling for this type, counted across all of the
    /// owner's currently running jobs of this type. Must be at least 1.
    fn maximum_active(&self) -> usize {
        1
    }

    /// Perform one attempt. Signal failure by returning an error; mutations
    /// to `job.state` are persisted only if this does not fail.
    async fn run(&self, job: &mut JobRecord, execution_id: &str) -> Result<(), JobError>;

    /// Called once after a successful attempt. Return `true` to retain the
    /// terminal record, `false` to delete it.
    async fn on_success(&self, _job: &JobRecord) -> bool {
        true
    }

    /// Called once after the final failed attempt (retries exhausted).
    /// Same retain/delete semantics as `on_success`.
    async fn on_failure(&self, _job: &JobRecord, _error: &JobError) -> bool {
        true
    }

    /// Called exactly once when the job is cancelled, whichever side
    /// (external actor or `on_error`) triggered it.
    async fn on_cancellation(&self, _job: &JobRecord) -> bool {
        true
    }

    /// Called after every failed attempt that still has retries remaining.
    async fn on_error(&self, _job: &JobRecord, _error: &JobError) -> ErrorDisposition {
        ErrorDisposition::Retry
    }
}

/// Registry of runnable implementations, keyed by type name.
pub struct RunnableRegistry {
    runnables: RwLock<HashMap<String, Arc<dyn Runnable>>>,
}

impl RunnableRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            runnables: RwLock::new(HashMap::new()),
        }
    }

    /// Register a runnable. Duplicate bindings and the reserved scheduler
    /// type are rejected.
    pub async fn register(&self, runnable: Arc<dyn Runnable>) -> Result<(), ValidationError> {
        let kind = runnable.kind().to_string();
        if kind == SCHEDULER_KIND {
            return Err(ValidationError::ReservedRunnable { kind });
        }
        let mut runnables = self.runnables.write().await;
        if runnables.contains_key(&kind) {
            return Err(ValidationError::DuplicateRunnable { kind });
        }
        tracing::debug!(kind = %kind, "Registered runnable");
        runnables.insert(kind, runnable);
        Ok(())
    }

    /// Resolve a runnable by type name.
    pub async fn get(&self, kind: &str) -> Option<Arc<dyn Runnable>> {
        self.runnables.read().await.get(kind).cloned()
    }

    /// Check whether a type name is bound.
    pub async fn has(&self, kind: &str) -> bool {
        self.runnables.read().await.contains_key(kind)
    }

    /// List all registered type names.
    pub async fn list(&self) -> Vec<String> {
        self.runnables.read().await.keys().cloned().collect()
    }
}

impl Default for RunnableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    #[async_trait]
    impl Runnable for Noop {
        fn kind(&self) -> &str {
            self.0
        }

        async fn run(&self, _job: &mut JobRecord, _execution_id: &str) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn register_and_resolve() {
        let registry = RunnableRegistry::new();
        registry.register(Arc::new(Noop("noop"))).await.unwrap();
        assert!(registry.has("noop").await);
        assert!(registry.get("noop").await.is_some());
        assert!(registry.get("other").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let registry = RunnableRegistry::new();
        registry.register(Arc::new(Noop("noop"))).await.unwrap();
        let err = registry.register(Arc::new(Noop("noop"))).await.unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateRunnable { .. }));
    }

    #[tokio::test]
    async fn scheduler_kind_reserved() {
        let registry = RunnableRegistry::new();
        let err = registry
            .register(Arc::new(Noop(SCHEDULER_KIND)))
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::ReservedRunnable { .. }));
    }

    #[tokio::test]
    async fn default_callbacks() {
        let noop = Noop("noop");
        let job = JobRecord::new("me", "noop", "r", 0, 0, Default::default());
        assert!(noop.on_success(&job).await);
        assert!(noop.on_failure(&job, &JobError::attempt("x")).await);
        assert!(noop.on_cancellation(&job).await);
        assert_eq!(
            noop.on_error(&job, &JobError::attempt("x")).await,
            ErrorDisposition::Retry
        );
    }
}
