//! Reclaims executions on this node that ran past their deadline.
//!
//! A zombie is a locally active agent whose working-set deadline plus the
//! configured threshold lies in the past. Its execution is aborted and its
//! working entry removed, conditional on the deadline recorded at
//! acquisition. Zombies are never rescheduled here; repopulation restores
//! them on a later tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::metrics::SchedulerMetrics;

use super::acquisition::AcquisitionService;
use super::config::{compile_optional_pattern, ConfigError, SchedulerConfig, ZombieCleanupConfig};
use super::{lock, read, write};

const KIND: &str = "zombie";

/// True when `now_ms` is strictly past `deadline_s` plus `threshold`.
pub fn is_zombie(now_ms: i64, deadline_s: i64, threshold: Duration) -> bool {
    let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX / 2);
    now_ms > deadline_s.saturating_mul(1000).saturating_add(threshold_ms)
}

pub struct ZombieCleanupService {
    acquisition: Arc<AcquisitionService>,
    config: ZombieCleanupConfig,
    batch_enabled: bool,
    batch_size: usize,
    exceptional: RwLock<Option<Regex>>,
    last_run: Mutex<Option<Instant>>,
    cleaned_total: AtomicU64,
    metrics: SchedulerMetrics,
}

impl ZombieCleanupService {
    pub fn new(
        acquisition: Arc<AcquisitionService>,
        config: &SchedulerConfig,
    ) -> Result<Self, ConfigError> {
        let exceptional = compile_optional_pattern(&config.zombie.exceptional_agents_pattern)
            .map_err(|source| ConfigError::InvalidPattern {
                key: "zombie.exceptional_agents_pattern",
                source,
            })?;

        Ok(Self {
            acquisition,
            config: config.zombie.clone(),
            batch_enabled: config.batch.enabled,
            batch_size: config.batch.batch_size,
            exceptional: RwLock::new(exceptional),
            last_run: Mutex::new(None),
            cleaned_total: AtomicU64::new(0),
            metrics: SchedulerMetrics::new(),
        })
    }

    /// Replaces the exceptional-agents pattern. A blank pattern clears it.
    pub fn refresh_exceptional_pattern(&self, pattern: &str) -> Result<(), regex::Error> {
        let compiled = compile_optional_pattern(pattern)?;
        *write(&self.exceptional) = compiled;
        info!(pattern = %pattern, "Refreshed exceptional agents pattern");
        Ok(())
    }

    pub fn run_budget(&self) -> Duration {
        self.config.run_budget
    }

    pub fn cleaned_total(&self) -> u64 {
        self.cleaned_total.load(Ordering::Relaxed)
    }

    /// Enabled and the cleanup interval has elapsed since the last pass.
    pub fn is_due(&self) -> bool {
        self.config.enabled
            && lock(&self.last_run).is_none_or(|at| at.elapsed() >= self.config.interval)
    }

    fn threshold_for(&self, agent_type: &str) -> Duration {
        match read(&self.exceptional).as_ref() {
            Some(pattern) if pattern.is_match(agent_type) => self.config.exceptional_threshold,
            _ => self.config.threshold,
        }
    }

    /// Runs a pass when enabled and due. Returns the number of zombies cleaned.
    pub async fn cleanup_if_needed(
        &self,
        active: &HashMap<String, i64>,
        handles: &HashMap<String, AbortHandle>,
    ) -> usize {
        if !self.is_due() {
            return 0;
        }
        self.cleanup(active, handles).await
    }

    /// Scans the given snapshot of active agents and reclaims every zombie.
    pub async fn cleanup(
        &self,
        active: &HashMap<String, i64>,
        handles: &HashMap<String, AbortHandle>,
    ) -> usize {
        *lock(&self.last_run) = Some(Instant::now());
        let start = Instant::now();
        let now_ms = self.acquisition.time().now_ms();

        let mut zombies: Vec<(String, i64)> = active
            .iter()
            .filter(|(agent_type, deadline)| {
                is_zombie(now_ms, **deadline, self.threshold_for(agent_type))
            })
            .map(|(agent_type, deadline)| (agent_type.clone(), *deadline))
            .collect();
        zombies.sort_by_key(|(_, deadline)| *deadline);

        let mut cleaned = Vec::with_capacity(zombies.len());
        for (agent_type, deadline) in zombies {
            if self.budget_exhausted(start) {
                self.metrics.inc_cleanup_timeout(KIND);
                warn!(cleaned = cleaned.len(), "Zombie cleanup run budget exhausted");
                break;
            }
            if let Some(handle) = handles.get(&agent_type) {
                handle.abort();
            }
            warn!(
                agent_type = %agent_type,
                deadline = deadline,
                overdue_ms = now_ms - deadline * 1000,
                "Reclaiming zombie agent"
            );
            cleaned.push((agent_type, deadline));
        }

        let removed = self.remove_from_working(&cleaned).await;
        for (agent_type, deadline) in &cleaned {
            let local = self.acquisition.active();
            if local.deadline(agent_type) == Some(*deadline) {
                local.remove(agent_type);
            }
        }

        let count = cleaned.len();
        self.cleaned_total.fetch_add(count as u64, Ordering::Relaxed);
        self.metrics.record_cleanup(KIND, start.elapsed(), count);
        if count > 0 {
            info!(cleaned = count, removed_from_redis = removed, "Zombie cleanup complete");
        } else {
            debug!(scanned = active.len(), "No zombies found");
        }
        count
    }

    fn budget_exhausted(&self, start: Instant) -> bool {
        !self.config.run_budget.is_zero() && start.elapsed() > self.config.run_budget
    }

    /// Removes each `(agent, deadline)` whose working score still equals the
    /// deadline. Returns the number removed from Redis.
    async fn remove_from_working(&self, pairs: &[(String, i64)]) -> usize {
        if pairs.is_empty() {
            return 0;
        }
        let scripts = self.acquisition.scripts();
        let working = self.acquisition.keys().working.clone();

        if !self.batch_enabled {
            return self.remove_individually(pairs).await;
        }

        let chunk_size = if self.batch_size == 0 {
            pairs.len()
        } else {
            self.batch_size
        };
        let mut removed = 0;
        for chunk in pairs.chunks(chunk_size) {
            match scripts.remove_conditional(&working, chunk).await {
                Ok(members) => removed += members.len(),
                Err(e) => {
                    warn!(error = %e, agents = chunk.len(), "Batch zombie removal failed, removing individually");
                    removed += self.remove_individually(chunk).await;
                }
            }
        }
        removed
    }

    async fn remove_individually(&self, pairs: &[(String, i64)]) -> usize {
        let scripts = self.acquisition.scripts();
        let working = self.acquisition.keys().working.clone();
        let mut removed = 0;
        for pair in pairs {
            match scripts
                .remove_conditional(&working, std::slice::from_ref(pair))
                .await
            {
                Ok(members) => removed += members.len(),
                Err(e) => {
                    warn!(agent_type = %pair.0, error = %e, "Failed to remove zombie from working set");
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zombie_boundary_is_strict() {
        let deadline = 1_700_000_000;
        let threshold = Duration::from_secs(30);
        let edge = deadline * 1000 + 30_000;

        assert!(!is_zombie(edge, deadline, threshold));
        assert!(is_zombie(edge + 1, deadline, threshold));
        assert!(is_zombie(edge + 1000, deadline, threshold));
        assert!(!is_zombie(deadline * 1000, deadline, threshold));
    }

    #[test]
    fn test_exceptional_threshold_extends_deadline() {
        let deadline = 1_700_000_000;
        let now = deadline * 1000 + 120_000;

        assert!(is_zombie(now, deadline, Duration::from_secs(30)));
        assert!(!is_zombie(now, deadline, Duration::from_secs(3600)));
    }

    #[test]
    fn test_zero_threshold() {
        assert!(is_zombie(1_001, 1, Duration::ZERO));
        assert!(!is_zombie(1_000, 1, Duration::ZERO));
    }
}
