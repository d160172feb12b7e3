//! Fleet-wide sweep of stale entries in both sets.
//!
//! Entries older than the orphan threshold are left behind by nodes that
//! died or by agents that no longer exist. One node at a time, holding the
//! leadership key, pages through both sets:
//!
//! - working: a registered, shard-owned agent goes back to waiting at the time
//!   it was originally ready; an unregistered, shard-owned one is removed.
//! - waiting: numeric-only members and unregistered, shard-owned agents are
//!   removed.
//!
//! Every change is conditional on the score observed during the scan.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use redis::aio::ConnectionManager;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::metrics::SchedulerMetrics;

use super::acquisition::AcquisitionService;
use super::config::{OrphanCleanupConfig, SchedulerConfig};
use super::lock;
use super::scripts::parse_score;

const KIND: &str = "orphan";

const DEFAULT_PAGE_SIZE: usize = 100;

/// What to do with a stale working-set entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingAction {
    Skip,
    Requeue,
    Remove,
}

pub fn decide_working(locally_active: bool, registered: bool, owned: bool) -> WorkingAction {
    if locally_active || !owned {
        WorkingAction::Skip
    } else if registered {
        WorkingAction::Requeue
    } else {
        WorkingAction::Remove
    }
}

/// Whether a stale waiting-set entry should be removed.
pub fn should_remove_waiting(
    agent_type: &str,
    registered: bool,
    owned: bool,
    remove_numeric_only: bool,
) -> bool {
    (remove_numeric_only && is_numeric_only(agent_type)) || (!registered && owned)
}

/// Members that are 9 to 11 ASCII digits, i.e. raw epoch seconds written as
/// agent names.
pub fn is_numeric_only(agent_type: &str) -> bool {
    (9..=11).contains(&agent_type.len()) && agent_type.bytes().all(|b| b.is_ascii_digit())
}

/// `(now_ms - threshold_ms) / 1000`
pub fn cutoff_seconds(now_ms: i64, threshold_ms: i64) -> i64 {
    (now_ms - threshold_ms).div_euclid(1000)
}

/// Leadership owner id: `{hostname}::{uuid}`.
pub fn owner_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}::{}", host, uuid::Uuid::new_v4())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanStats {
    pub cleaned_total: u64,
    /// Epoch millis of the start of the last pass, 0 before the first.
    pub last_cleanup_epoch_ms: i64,
}

/// Outcome of one page.
#[derive(Debug, Default)]
struct PageResult {
    scanned: usize,
    cleaned: usize,
    left_in_place: usize,
}

/// A scanned set member. `raw_score` is the score exactly as Redis returned
/// it and is the expected value for conditional moves and removals.
struct ScannedEntry {
    agent_type: String,
    score: i64,
    raw_score: String,
}

pub struct OrphanCleanupService {
    redis: ConnectionManager,
    acquisition: Arc<AcquisitionService>,
    config: OrphanCleanupConfig,
    batch_enabled: bool,
    page_size: usize,
    owner: String,
    last_cleanup: Mutex<Option<Instant>>,
    last_cleanup_epoch_ms: AtomicI64,
    cleaned_total: AtomicU64,
    metrics: SchedulerMetrics,
}

impl OrphanCleanupService {
    pub fn new(
        redis: ConnectionManager,
        acquisition: Arc<AcquisitionService>,
        config: &SchedulerConfig,
    ) -> Self {
        let page_size = match config.batch.batch_size {
            0 => DEFAULT_PAGE_SIZE,
            size => size,
        };
        Self {
            redis,
            acquisition,
            config: config.orphan.clone(),
            batch_enabled: config.batch.enabled,
            page_size,
            owner: owner_id(),
            last_cleanup: Mutex::new(None),
            last_cleanup_epoch_ms: AtomicI64::new(0),
            cleaned_total: AtomicU64::new(0),
            metrics: SchedulerMetrics::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn run_budget(&self) -> std::time::Duration {
        self.config.run_budget
    }

    pub fn stats(&self) -> OrphanStats {
        OrphanStats {
            cleaned_total: self.cleaned_total.load(Ordering::Relaxed),
            last_cleanup_epoch_ms: self.last_cleanup_epoch_ms.load(Ordering::Relaxed),
        }
    }

    pub fn is_due(&self) -> bool {
        self.config.enabled
            && lock(&self.last_cleanup).is_none_or(|at| at.elapsed() >= self.config.interval)
    }

    /// Runs a pass when enabled, due and this node holds leadership.
    /// Returns the number of entries cleaned.
    pub async fn cleanup_if_needed(&self) -> usize {
        if !self.is_due() {
            return 0;
        }

        if self.config.force_all_pods {
            return self.run_pass().await;
        }

        match self.try_acquire_leadership().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Another node holds cleanup leadership, skipping orphan pass");
                return 0;
            }
            Err(e) => {
                warn!(error = %e, "Failed to acquire cleanup leadership");
                return 0;
            }
        }

        let cleaned = self.run_pass().await;
        self.release_leadership().await;
        cleaned
    }

    /// Runs a pass immediately, ignoring the interval and leadership.
    pub async fn force_cleanup(&self) -> usize {
        self.run_pass().await
    }

    /// `SET leader owner NX PX ttl`.
    pub async fn try_acquire_leadership(&self) -> Result<bool, redis::RedisError> {
        let mut conn = self.redis.clone();
        let ttl_ms = u64::try_from(self.config.leadership_ttl.as_millis()).unwrap_or(u64::MAX);
        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.acquisition.keys().leader)
            .arg(&self.owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    /// Deletes the leadership key only while this node still owns it.
    pub async fn release_leadership(&self) {
        match self
            .acquisition
            .scripts()
            .release_leadership(&self.owner)
            .await
        {
            Ok(true) => debug!(owner = %self.owner, "Released cleanup leadership"),
            Ok(false) => debug!(owner = %self.owner, "Cleanup leadership already expired"),
            Err(e) => warn!(error = %e, "Failed to release cleanup leadership, TTL will expire it"),
        }
    }

    async fn run_pass(&self) -> usize {
        *lock(&self.last_cleanup) = Some(Instant::now());
        self.last_cleanup_epoch_ms
            .store(super::time::local_now_ms(), Ordering::Relaxed);

        let start = Instant::now();
        let threshold_ms = i64::try_from(self.config.threshold.as_millis()).unwrap_or(i64::MAX / 2);
        let cutoff = cutoff_seconds(self.acquisition.time().now_ms(), threshold_ms);

        let working = self.acquisition.keys().working.clone();
        let waiting = self.acquisition.keys().waiting.clone();

        let mut cleaned = self.scan(&working, cutoff, start, true).await;
        if self.budget_exhausted(start) {
            self.metrics.inc_cleanup_timeout(KIND);
            warn!("Orphan cleanup budget exhausted, skipping waiting set");
        } else {
            cleaned += self.scan(&waiting, cutoff, start, false).await;
        }

        self.cleaned_total
            .fetch_add(cleaned as u64, Ordering::Relaxed);
        self.metrics.record_cleanup(KIND, start.elapsed(), cleaned);
        if cleaned > 0 {
            info!(cleaned = cleaned, cutoff = cutoff, "Orphan cleanup complete");
        } else {
            debug!(cutoff = cutoff, "No orphans found");
        }
        cleaned
    }

    fn budget_exhausted(&self, start: Instant) -> bool {
        !self.config.run_budget.is_zero() && start.elapsed() > self.config.run_budget
    }

    async fn scan(&self, set: &str, cutoff: i64, start: Instant, is_working: bool) -> usize {
        let mut conn = self.redis.clone();
        let mut offset = 0usize;
        let mut cleaned = 0;

        loop {
            if self.budget_exhausted(start) {
                break;
            }

            let page: Vec<(String, String)> = match redis::cmd("ZRANGEBYSCORE")
                .arg(set)
                .arg(0)
                .arg(cutoff)
                .arg("WITHSCORES")
                .arg("LIMIT")
                .arg(offset)
                .arg(self.page_size)
                .query_async(&mut conn)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(set = %set, error = %e, "Orphan scan failed");
                    break;
                }
            };
            let fetched = page.len();
            if fetched == 0 {
                break;
            }

            let entries: Vec<ScannedEntry> = page
                .into_iter()
                .filter_map(|(agent_type, raw_score)| {
                    let score = parse_score(&raw_score)?;
                    Some(ScannedEntry {
                        agent_type,
                        score,
                        raw_score,
                    })
                })
                .collect();
            let result = if is_working {
                self.process_working(set, entries).await
            } else {
                self.process_waiting(set, entries).await
            };
            cleaned += result.cleaned;
            offset += result.left_in_place + (fetched - result.scanned);

            if fetched < self.page_size {
                break;
            }
        }
        cleaned
    }

    async fn process_working(&self, set: &str, entries: Vec<ScannedEntry>) -> PageResult {
        let mut result = PageResult {
            scanned: entries.len(),
            ..Default::default()
        };
        let mut removals = Vec::new();
        let active = self.acquisition.active();

        for ScannedEntry {
            agent_type,
            score,
            raw_score,
        } in entries
        {
            let action = decide_working(
                active.contains(&agent_type),
                self.acquisition.is_registered(&agent_type),
                self.acquisition.belongs_to_this_shard(&agent_type),
            );
            match action {
                WorkingAction::Skip => result.left_in_place += 1,
                WorkingAction::Requeue => {
                    let ready = self
                        .acquisition
                        .compute_original_ready_seconds(&agent_type, score);
                    match self
                        .acquisition
                        .scripts()
                        .move_agent_conditional(&agent_type, &raw_score, ready)
                        .await
                    {
                        Ok(true) => {
                            info!(
                                agent_type = %agent_type,
                                working_score = score,
                                ready = ready,
                                "Requeued orphaned working agent"
                            );
                            result.cleaned += 1;
                        }
                        Ok(false) => result.left_in_place += 1,
                        Err(e) => {
                            warn!(agent_type = %agent_type, error = %e, "Failed to requeue orphan");
                            result.left_in_place += 1;
                        }
                    }
                }
                WorkingAction::Remove => removals.push((agent_type, raw_score)),
            }
        }

        let attempted = removals.len();
        let removed = self.remove_entries(set, &removals, false).await;
        result.cleaned += removed;
        result.left_in_place += attempted.saturating_sub(removed);
        result
    }

    async fn process_waiting(&self, set: &str, entries: Vec<ScannedEntry>) -> PageResult {
        let mut result = PageResult {
            scanned: entries.len(),
            ..Default::default()
        };
        let mut removals = Vec::new();
        let mut invalid = Vec::new();

        for ScannedEntry {
            agent_type,
            raw_score,
            ..
        } in entries
        {
            if self.config.remove_numeric_only_agents && is_numeric_only(&agent_type) {
                invalid.push((agent_type, raw_score));
            } else if should_remove_waiting(
                &agent_type,
                self.acquisition.is_registered(&agent_type),
                self.acquisition.belongs_to_this_shard(&agent_type),
                false,
            ) {
                removals.push((agent_type, raw_score));
            } else {
                result.left_in_place += 1;
            }
        }

        for (batch, invalid_names) in [(removals, false), (invalid, true)] {
            let attempted = batch.len();
            let removed = self.remove_entries(set, &batch, invalid_names).await;
            result.cleaned += removed;
            result.left_in_place += attempted.saturating_sub(removed);
        }
        result
    }

    /// Conditional removal of `(agent, score)` pairs from `set`. Invalid names
    /// whose conditional removal misses are removed unconditionally.
    async fn remove_entries(&self, set: &str, pairs: &[(String, String)], invalid: bool) -> usize {
        if pairs.is_empty() {
            return 0;
        }
        let scripts = self.acquisition.scripts();

        let mut removed: Vec<String> = Vec::new();
        if self.batch_enabled {
            for chunk in pairs.chunks(self.page_size) {
                match scripts.remove_conditional(set, chunk).await {
                    Ok(members) => removed.extend(members),
                    Err(e) => {
                        warn!(set = %set, error = %e, "Batch orphan removal failed, removing individually");
                        removed.extend(self.remove_individually(set, chunk).await);
                    }
                }
            }
        } else {
            removed = self.remove_individually(set, pairs).await;
        }

        if invalid {
            for (agent_type, _) in pairs {
                if removed.contains(agent_type) {
                    continue;
                }
                match scripts.remove_agent(agent_type).await {
                    Ok(true) => removed.push(agent_type.clone()),
                    Ok(false) => {}
                    Err(e) => warn!(agent_type = %agent_type, error = %e, "Failed to remove invalid agent"),
                }
            }
        }

        for agent_type in &removed {
            info!(set = %set, agent_type = %agent_type, "Removed orphaned agent");
        }
        removed.len()
    }

    async fn remove_individually(&self, set: &str, pairs: &[(String, String)]) -> Vec<String> {
        let scripts = self.acquisition.scripts();
        let mut removed = Vec::new();
        for pair in pairs {
            match scripts
                .remove_conditional(set, std::slice::from_ref(pair))
                .await
            {
                Ok(members) => removed.extend(members),
                Err(e) => warn!(agent_type = %pair.0, error = %e, "Failed to remove orphan"),
            }
        }
        removed
    }
}
