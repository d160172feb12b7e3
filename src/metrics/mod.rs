//! Metrics module for Prometheus-based monitoring.
//!
//! Covers scheduler ticks, acquisition, cleanup passes, script evaluation and
//! execution outcomes.
//!
//! # Example
//!
//! ```ignore
//! use priority_scheduler::metrics::{init_metrics, export_metrics, SchedulerMetrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let metrics = SchedulerMetrics::new();
//! metrics.record_cleanup("zombie", elapsed, cleaned);
//!
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::SchedulerMetrics;
pub use prometheus::{export_metrics, init_metrics, REGISTRY};
