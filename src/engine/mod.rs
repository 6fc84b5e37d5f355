//! Scheduling engine.
//!
//! Core components:
//! - `substrate` — dispatches attempts as independent tasks
//! - `finalizer` — interprets attempt outcomes, drives retries
//! - `scheduler` — admission control loop under concurrency ceilings

pub mod finalizer;
pub mod scheduler;
pub mod substrate;

pub use finalizer::Finalizer;
pub use scheduler::{PassOutcome, Scheduler, SchedulerDeps};
pub use substrate::{ExecutionSubstrate, TokioSubstrate};
