//! Scheduler metric recording.
//!
//! `SchedulerMetrics` wraps the raw Prometheus statics with the label sets the
//! scheduler uses. Every method is a no-op until `init_metrics()` has run, so
//! library users that never export metrics pay nothing.

use std::time::Duration;

use super::prometheus::{
    ACQUIRED_TOTAL, ACQUIRE_ATTEMPTS, ACQUIRE_DURATION, ACTIVE_AGENTS, BATCH_FALLBACKS,
    CIRCUIT_BREAKER_EVENTS, CLEANUP_CLEANED, CLEANUP_DURATION, CLEANUP_SKIPPED, CLEANUP_TIMEOUTS,
    EXECUTIONS_TOTAL, READY_AGENTS, REGISTERED_AGENTS, REPOPULATE_ADDED, REPOPULATE_DURATION,
    REPOPULATE_ERRORS, RUN_CYCLE_DURATION, RUN_FAILURES, SCRIPT_ERRORS, SCRIPT_EVALS,
    SCRIPT_LATENCY, SCRIPT_RELOADS,
};

/// Metrics recorder shared by every scheduler service.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self
    }

    /// Record one driver tick.
    pub fn record_run_cycle(&self, success: bool, elapsed: Duration) {
        if let Some(m) = RUN_CYCLE_DURATION.get() {
            m.with_label_values(&[if success { "true" } else { "false" }])
                .observe(elapsed.as_secs_f64());
        }
    }

    pub fn inc_run_failure(&self, reason: &str) {
        if let Some(m) = RUN_FAILURES.get() {
            m.with_label_values(&[reason]).inc();
        }
    }

    pub fn inc_acquire_attempts(&self) {
        if let Some(m) = ACQUIRE_ATTEMPTS.get() {
            m.inc();
        }
    }

    pub fn inc_acquired(&self, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(m) = ACQUIRED_TOTAL.get() {
            m.inc_by(count as f64);
        }
    }

    /// Record acquisition latency for `mode` ("batch" or "individual").
    pub fn record_acquire_time(&self, mode: &str, elapsed: Duration) {
        if let Some(m) = ACQUIRE_DURATION.get() {
            m.with_label_values(&[mode]).observe(elapsed.as_secs_f64());
        }
    }

    pub fn inc_batch_fallback(&self) {
        if let Some(m) = BATCH_FALLBACKS.get() {
            m.inc();
        }
    }

    /// Record a circuit breaker event: "trip", "recovery" or "blocked".
    pub fn record_circuit_breaker(&self, event: &str) {
        if let Some(m) = CIRCUIT_BREAKER_EVENTS.get() {
            m.with_label_values(&[event]).inc();
        }
    }

    pub fn record_repopulate(&self, elapsed: Duration, added: usize) {
        if let Some(m) = REPOPULATE_DURATION.get() {
            m.observe(elapsed.as_secs_f64());
        }
        if added > 0 {
            if let Some(m) = REPOPULATE_ADDED.get() {
                m.inc_by(added as f64);
            }
        }
    }

    pub fn inc_repopulate_error(&self, reason: &str) {
        if let Some(m) = REPOPULATE_ERRORS.get() {
            m.with_label_values(&[reason]).inc();
        }
    }

    /// Record one cleanup pass. Called for every pass, including ones that
    /// cleaned nothing.
    pub fn record_cleanup(&self, kind: &str, elapsed: Duration, cleaned: usize) {
        if let Some(m) = CLEANUP_DURATION.get() {
            m.with_label_values(&[kind]).observe(elapsed.as_secs_f64());
        }
        if let Some(m) = CLEANUP_CLEANED.get() {
            m.with_label_values(&[kind]).inc_by(cleaned as f64);
        }
    }

    pub fn inc_cleanup_skipped(&self, kind: &str) {
        if let Some(m) = CLEANUP_SKIPPED.get() {
            m.with_label_values(&[kind]).inc();
        }
    }

    pub fn inc_cleanup_timeout(&self, kind: &str) {
        if let Some(m) = CLEANUP_TIMEOUTS.get() {
            m.with_label_values(&[kind]).inc();
        }
    }

    pub fn record_script_eval(&self, script: &str, elapsed: Duration) {
        if let Some(m) = SCRIPT_EVALS.get() {
            m.with_label_values(&[script]).inc();
        }
        if let Some(m) = SCRIPT_LATENCY.get() {
            m.with_label_values(&[script]).observe(elapsed.as_secs_f64());
        }
    }

    pub fn inc_script_error(&self, script: &str, reason: &str) {
        if let Some(m) = SCRIPT_ERRORS.get() {
            m.with_label_values(&[script, reason]).inc();
        }
    }

    pub fn inc_script_reload(&self) {
        if let Some(m) = SCRIPT_RELOADS.get() {
            m.inc();
        }
    }

    /// Record a finished execution. `failure_class` is "none" on success.
    pub fn record_execution(&self, success: bool, failure_class: &str) {
        if let Some(m) = EXECUTIONS_TOTAL.get() {
            m.with_label_values(&[if success { "success" } else { "failure" }, failure_class])
                .inc();
        }
    }

    pub fn set_active_agents(&self, count: usize) {
        if let Some(m) = ACTIVE_AGENTS.get() {
            m.set(count as f64);
        }
    }

    pub fn set_registered_agents(&self, count: usize) {
        if let Some(m) = REGISTERED_AGENTS.get() {
            m.set(count as f64);
        }
    }

    pub fn set_ready_agents(&self, count: usize) {
        if let Some(m) = READY_AGENTS.get() {
            m.set(count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_scheduler_metrics_is_zero_sized() {
        let metrics = SchedulerMetrics::new();
        assert!(std::mem::size_of_val(&metrics) == 0);
    }

    #[test]
    fn test_record_cleanup_includes_zero_passes() {
        ensure_metrics_init();
        let metrics = SchedulerMetrics::new();

        metrics.record_cleanup("zombie", Duration::from_millis(12), 0);
        metrics.record_cleanup("orphan", Duration::from_millis(40), 3);

        let text = export_metrics();
        assert!(text.contains("priority_scheduler_cleanup_seconds"));
        assert!(text.contains("type=\"zombie\""));
    }

    #[test]
    fn test_record_acquisition_and_execution() {
        ensure_metrics_init();
        let metrics = SchedulerMetrics::new();

        metrics.inc_acquire_attempts();
        metrics.inc_acquired(3);
        metrics.inc_acquired(0);
        metrics.record_acquire_time("batch", Duration::from_millis(2));
        metrics.record_execution(true, "none");
        metrics.record_execution(false, "throttled");
        metrics.set_active_agents(2);

        let text = export_metrics();
        assert!(text.contains("priority_scheduler_executions_total"));
    }

    #[test]
    fn test_record_script_and_breaker_events() {
        ensure_metrics_init();
        let metrics = SchedulerMetrics::new();

        metrics.record_script_eval("acquire_agents", Duration::from_micros(300));
        metrics.inc_script_error("acquire_agents", "noscript");
        metrics.inc_script_reload();
        metrics.record_circuit_breaker("trip");
        metrics.inc_cleanup_skipped("orphan");
        metrics.inc_cleanup_timeout("zombie");
    }
}
