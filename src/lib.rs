//! priority-scheduler: distributed priority scheduling of recurring agents on Redis.
//!
//! A fleet of nodes shares two Redis sorted sets. Each node acquires ready
//! agents atomically, runs them under a local concurrency limit and writes
//! their next due time back, while cleanup services recover work lost to
//! crashed nodes and hung executions.

// Core modules
pub mod cli;
pub mod error;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used error types
pub use error::{ExecutionError, SchedulerError, ScriptError};
