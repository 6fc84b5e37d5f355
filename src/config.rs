//! Configuration types.

use std::time::Duration;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Owner identity; the scheduler only ever sees jobs queued under this owner.
    pub owner: String,
    /// Maximum number of jobs started per admission pass.
    pub max_jobs_per_pass: usize,
    /// How long the scheduler sleeps when a pass finds nothing eligible.
    pub idle_delay: Duration,
    /// Maximum size in bytes of a single persisted state chunk.
    pub state_chunk_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            owner: "default".to_string(),
            max_jobs_per_pass: 25,
            idle_delay: Duration::from_secs(1),
            state_chunk_size: 4096,
        }
    }
}
