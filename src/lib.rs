//! jobwell — durable, retrying, concurrency-bounded job scheduling over a
//! transactional record store.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod runnable;
pub mod store;

pub use api::JobEngine;
pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use job::{Diagnostic, JobRecord, JobState, JobStatus};
pub use runnable::{ErrorDisposition, Runnable, RunnableRegistry, SCHEDULER_KIND};
pub use store::{JobStore, LibSqlStore};
