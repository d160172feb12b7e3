//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the scheduler and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all scheduler metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Scheduler tick duration in seconds, labeled by success.
pub static RUN_CYCLE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Tick and execution failures, labeled by reason.
pub static RUN_FAILURES: OnceLock<CounterVec> = OnceLock::new();

/// Acquisition passes attempted.
pub static ACQUIRE_ATTEMPTS: OnceLock<Counter> = OnceLock::new();

/// Agents moved from waiting to working by this node.
pub static ACQUIRED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Acquisition latency in seconds, labeled by mode (batch/individual).
pub static ACQUIRE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Batched script calls that fell back to individual commands.
pub static BATCH_FALLBACKS: OnceLock<Counter> = OnceLock::new();

/// Circuit breaker transitions and blocked calls, labeled by event.
pub static CIRCUIT_BREAKER_EVENTS: OnceLock<CounterVec> = OnceLock::new();

/// Repopulation duration in seconds.
pub static REPOPULATE_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Agents written to the waiting set by repopulation.
pub static REPOPULATE_ADDED: OnceLock<Counter> = OnceLock::new();

/// Repopulation failures, labeled by reason.
pub static REPOPULATE_ERRORS: OnceLock<CounterVec> = OnceLock::new();

/// Cleanup pass duration in seconds, labeled by type (zombie/orphan).
pub static CLEANUP_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Entries removed or repaired by cleanup, labeled by type.
pub static CLEANUP_CLEANED: OnceLock<CounterVec> = OnceLock::new();

/// Cleanup passes skipped because the previous one was still running.
pub static CLEANUP_SKIPPED: OnceLock<CounterVec> = OnceLock::new();

/// Cleanup passes aborted by the hung-cleanup watchdog.
pub static CLEANUP_TIMEOUTS: OnceLock<CounterVec> = OnceLock::new();

/// Script evaluations, labeled by script.
pub static SCRIPT_EVALS: OnceLock<CounterVec> = OnceLock::new();

/// Script latency in seconds, labeled by script.
pub static SCRIPT_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Script failures, labeled by script and reason.
pub static SCRIPT_ERRORS: OnceLock<CounterVec> = OnceLock::new();

/// Full script reloads after `NOSCRIPT`.
pub static SCRIPT_RELOADS: OnceLock<Counter> = OnceLock::new();

/// Agent executions finished, labeled by outcome and failure class.
pub static EXECUTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Agents currently executing on this node.
pub static ACTIVE_AGENTS: OnceLock<Gauge> = OnceLock::new();

/// Agents registered on this node.
pub static REGISTERED_AGENTS: OnceLock<Gauge> = OnceLock::new();

/// Ready agents seen in the waiting set on the last acquisition pass.
pub static READY_AGENTS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording methods are no-ops until this has run.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Tick metrics
    let run_cycle_duration = HistogramVec::new(
        HistogramOpts::new(
            "priority_scheduler_run_cycle_seconds",
            "Scheduler tick duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["success"],
    )?;

    let run_failures = CounterVec::new(
        Opts::new(
            "priority_scheduler_run_failures_total",
            "Tick and execution failures",
        ),
        &["reason"],
    )?;

    // Acquisition metrics
    let acquire_attempts = Counter::new(
        "priority_scheduler_acquire_attempts_total",
        "Acquisition passes attempted",
    )?;

    let acquired_total = Counter::new(
        "priority_scheduler_acquired_total",
        "Agents acquired by this node",
    )?;

    let acquire_duration = HistogramVec::new(
        HistogramOpts::new(
            "priority_scheduler_acquire_seconds",
            "Acquisition latency in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        &["mode"],
    )?;

    let batch_fallbacks = Counter::new(
        "priority_scheduler_batch_fallbacks_total",
        "Batched script calls that fell back to individual commands",
    )?;

    let circuit_breaker_events = CounterVec::new(
        Opts::new(
            "priority_scheduler_circuit_breaker_events_total",
            "Circuit breaker trips, recoveries and blocked calls",
        ),
        &["event"],
    )?;

    // Repopulation metrics
    let repopulate_duration = Histogram::with_opts(
        HistogramOpts::new(
            "priority_scheduler_repopulate_seconds",
            "Repopulation duration in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
    )?;

    let repopulate_added = Counter::new(
        "priority_scheduler_repopulate_added_total",
        "Agents written to the waiting set by repopulation",
    )?;

    let repopulate_errors = CounterVec::new(
        Opts::new(
            "priority_scheduler_repopulate_errors_total",
            "Repopulation failures",
        ),
        &["reason"],
    )?;

    // Cleanup metrics
    let cleanup_duration = HistogramVec::new(
        HistogramOpts::new(
            "priority_scheduler_cleanup_seconds",
            "Cleanup pass duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["type"],
    )?;

    let cleanup_cleaned = CounterVec::new(
        Opts::new(
            "priority_scheduler_cleanup_cleaned_total",
            "Entries removed or repaired by cleanup",
        ),
        &["type"],
    )?;

    let cleanup_skipped = CounterVec::new(
        Opts::new(
            "priority_scheduler_cleanup_skipped_total",
            "Cleanup passes skipped because one was still running",
        ),
        &["type"],
    )?;

    let cleanup_timeouts = CounterVec::new(
        Opts::new(
            "priority_scheduler_cleanup_timeouts_total",
            "Cleanup passes aborted by the watchdog",
        ),
        &["type"],
    )?;

    // Script metrics
    let script_evals = CounterVec::new(
        Opts::new("priority_scheduler_script_evals_total", "Script evaluations"),
        &["script"],
    )?;

    let script_latency = HistogramVec::new(
        HistogramOpts::new(
            "priority_scheduler_script_latency_seconds",
            "Script latency in seconds",
        )
        .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        &["script"],
    )?;

    let script_errors = CounterVec::new(
        Opts::new("priority_scheduler_script_errors_total", "Script failures"),
        &["script", "reason"],
    )?;

    let script_reloads = Counter::new(
        "priority_scheduler_script_reloads_total",
        "Full script reloads after NOSCRIPT",
    )?;

    // Execution metrics
    let executions_total = CounterVec::new(
        Opts::new(
            "priority_scheduler_executions_total",
            "Agent executions finished",
        ),
        &["outcome", "failure_class"],
    )?;

    let active_agents = Gauge::new(
        "priority_scheduler_active_agents",
        "Agents currently executing on this node",
    )?;

    let registered_agents = Gauge::new(
        "priority_scheduler_registered_agents",
        "Agents registered on this node",
    )?;

    let ready_agents = Gauge::new(
        "priority_scheduler_ready_agents",
        "Ready agents seen on the last acquisition pass",
    )?;

    registry.register(Box::new(run_cycle_duration.clone()))?;
    registry.register(Box::new(run_failures.clone()))?;
    registry.register(Box::new(acquire_attempts.clone()))?;
    registry.register(Box::new(acquired_total.clone()))?;
    registry.register(Box::new(acquire_duration.clone()))?;
    registry.register(Box::new(batch_fallbacks.clone()))?;
    registry.register(Box::new(circuit_breaker_events.clone()))?;
    registry.register(Box::new(repopulate_duration.clone()))?;
    registry.register(Box::new(repopulate_added.clone()))?;
    registry.register(Box::new(repopulate_errors.clone()))?;
    registry.register(Box::new(cleanup_duration.clone()))?;
    registry.register(Box::new(cleanup_cleaned.clone()))?;
    registry.register(Box::new(cleanup_skipped.clone()))?;
    registry.register(Box::new(cleanup_timeouts.clone()))?;
    registry.register(Box::new(script_evals.clone()))?;
    registry.register(Box::new(script_latency.clone()))?;
    registry.register(Box::new(script_errors.clone()))?;
    registry.register(Box::new(script_reloads.clone()))?;
    registry.register(Box::new(executions_total.clone()))?;
    registry.register(Box::new(active_agents.clone()))?;
    registry.register(Box::new(registered_agents.clone()))?;
    registry.register(Box::new(ready_agents.clone()))?;

    // Later calls leave the first set of metrics in place
    let _ = REGISTRY.set(registry);
    let _ = RUN_CYCLE_DURATION.set(run_cycle_duration);
    let _ = RUN_FAILURES.set(run_failures);
    let _ = ACQUIRE_ATTEMPTS.set(acquire_attempts);
    let _ = ACQUIRED_TOTAL.set(acquired_total);
    let _ = ACQUIRE_DURATION.set(acquire_duration);
    let _ = BATCH_FALLBACKS.set(batch_fallbacks);
    let _ = CIRCUIT_BREAKER_EVENTS.set(circuit_breaker_events);
    let _ = REPOPULATE_DURATION.set(repopulate_duration);
    let _ = REPOPULATE_ADDED.set(repopulate_added);
    let _ = REPOPULATE_ERRORS.set(repopulate_errors);
    let _ = CLEANUP_DURATION.set(cleanup_duration);
    let _ = CLEANUP_CLEANED.set(cleanup_cleaned);
    let _ = CLEANUP_SKIPPED.set(cleanup_skipped);
    let _ = CLEANUP_TIMEOUTS.set(cleanup_timeouts);
    let _ = SCRIPT_EVALS.set(script_evals);
    let _ = SCRIPT_LATENCY.set(script_latency);
    let _ = SCRIPT_ERRORS.set(script_errors);
    let _ = SCRIPT_RELOADS.set(script_reloads);
    let _ = EXECUTIONS_TOTAL.set(executions_total);
    let _ = ACTIVE_AGENTS.set(active_agents);
    let _ = REGISTERED_AGENTS.set(registered_agents);
    let _ = READY_AGENTS.set(ready_agents);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an informative comment line when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
