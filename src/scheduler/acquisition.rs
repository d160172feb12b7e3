//! Agent registry and the acquire / execute / complete cycle.
//!
//! Each tick `saturate_pool` keeps Redis populated with every registered
//! agent, moves ready agents from waiting to working while permits are
//! available, spawns one worker per acquisition and writes the next run time
//! of every finished execution back into the waiting set.
//!
//! Workers never touch Redis. They report a [`Completion`] on an unbounded
//! channel that the tick drains, so a slow or unavailable Redis never blocks
//! an execution from finishing and releasing its permit.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use redis::aio::ConnectionManager;
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::{ExecutionError, SchedulerError};
use crate::metrics::SchedulerMetrics;

use super::agent::{
    Agent, AgentExecution, ExecutionInstrumentation, Interval, IntervalProvider, ShardingFilter,
};
use super::backoff::{
    cadence_offset_ms, classify_failure, failure_offset_ms, registration_jitter_ms,
    shutdown_offset_ms, FailureClass,
};
use super::circuit_breaker::CircuitBreaker;
use super::config::{AgentPatterns, ConfigError, SchedulerConfig, SchedulerKeys};
use super::scripts::ScriptManager;
use super::time::{score_at, TimeSource};
use super::{lock, read, write};

/// Upper bound on waiting-set chunks read per tick.
const MAX_CHUNK_ATTEMPTS: usize = 100;

/// Agents per `score_agents` / `add_agents` call during repopulation.
const REPOPULATE_CHUNK: usize = 500;

const REGISTER_ATTEMPTS: u32 = 3;

/// A registered agent with its callbacks.
#[derive(Clone)]
pub struct RegisteredAgent {
    pub agent: Agent,
    pub execution: Arc<dyn AgentExecution>,
    pub instrumentation: Arc<dyn ExecutionInstrumentation>,
}

/// Result of one finished execution, drained by the next tick.
#[derive(Debug, Clone)]
pub struct Completion {
    pub agent: Agent,
    pub success: bool,
    pub failure_class: Option<FailureClass>,
    pub error: Option<String>,
    pub elapsed: Duration,
    /// Working-set score written at acquisition.
    pub deadline: i64,
}

#[derive(Debug)]
struct ActiveEntry {
    deadline: i64,
    run_id: u64,
    abort: Option<AbortHandle>,
}

/// Agents executing on this node: deadline score plus the abort handle of
/// the spawned execution.
#[derive(Debug, Default)]
pub struct ActiveAgents {
    entries: Mutex<HashMap<String, ActiveEntry>>,
}

impl ActiveAgents {
    fn insert(&self, agent_type: &str, deadline: i64, run_id: u64) -> bool {
        let mut entries = lock(&self.entries);
        if entries.contains_key(agent_type) {
            return false;
        }
        entries.insert(
            agent_type.to_string(),
            ActiveEntry {
                deadline,
                run_id,
                abort: None,
            },
        );
        true
    }

    fn attach(&self, agent_type: &str, run_id: u64, handle: AbortHandle) {
        if let Some(entry) = lock(&self.entries).get_mut(agent_type) {
            if entry.run_id == run_id {
                entry.abort = Some(handle);
            }
        }
    }

    fn remove_run(&self, agent_type: &str, run_id: u64) {
        let mut entries = lock(&self.entries);
        if entries.get(agent_type).is_some_and(|e| e.run_id == run_id) {
            entries.remove(agent_type);
        }
    }

    /// Drops the entry whatever run it belongs to; returns its deadline.
    pub fn remove(&self, agent_type: &str) -> Option<i64> {
        lock(&self.entries).remove(agent_type).map(|e| e.deadline)
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        lock(&self.entries).contains_key(agent_type)
    }

    pub fn deadline(&self, agent_type: &str) -> Option<i64> {
        lock(&self.entries).get(agent_type).map(|e| e.deadline)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of agent type to deadline score.
    pub fn deadlines(&self) -> HashMap<String, i64> {
        lock(&self.entries)
            .iter()
            .map(|(k, e)| (k.clone(), e.deadline))
            .collect()
    }

    /// Snapshot of agent type to abort handle.
    pub fn handles(&self) -> HashMap<String, AbortHandle> {
        lock(&self.entries)
            .iter()
            .filter_map(|(k, e)| e.abort.clone().map(|h| (k.clone(), h)))
            .collect()
    }
}

/// Removes the active entry when the worker future finishes or is dropped.
struct ActiveGuard {
    active: Arc<ActiveAgents>,
    agent_type: String,
    run_id: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.remove_run(&self.agent_type, self.run_id);
    }
}

/// Readiness of the waiting set after the last acquisition pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub ready_count: usize,
    pub oldest_overdue_seconds: i64,
    /// The oldest ready agent is overdue by more than the shortest
    /// registered interval.
    pub degraded: bool,
}

/// Counters kept by the acquisition service.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AcquisitionStats {
    pub acquired: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rescheduled: u64,
    pub shutdown_requeued: u64,
    pub batch_fallbacks: u64,
}

#[derive(Debug, Default)]
struct SharedAcquisitionStats {
    acquired: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rescheduled: AtomicU64,
    shutdown_requeued: AtomicU64,
    batch_fallbacks: AtomicU64,
}

impl SharedAcquisitionStats {
    fn snapshot(&self) -> AcquisitionStats {
        AcquisitionStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rescheduled: self.rescheduled.load(Ordering::Relaxed),
            shutdown_requeued: self.shutdown_requeued.load(Ordering::Relaxed),
            batch_fallbacks: self.batch_fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// A ready candidate read from the waiting set.
struct Candidate {
    registered: RegisteredAgent,
    deadline: i64,
}

pub struct AcquisitionService {
    redis: ConnectionManager,
    config: Arc<SchedulerConfig>,
    keys: SchedulerKeys,
    scripts: Arc<ScriptManager>,
    time: TimeSource,
    patterns: AgentPatterns,
    intervals: Arc<dyn IntervalProvider>,
    sharding: Arc<dyn ShardingFilter>,
    registry: std::sync::RwLock<HashMap<String, RegisteredAgent>>,
    active: Arc<ActiveAgents>,
    failure_streaks: Mutex<HashMap<String, u32>>,
    semaphore: Arc<Semaphore>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: Mutex<mpsc::UnboundedReceiver<Completion>>,
    pending_completions: Arc<AtomicUsize>,
    shutting_down: AtomicBool,
    breaker: CircuitBreaker,
    last_repopulate: Mutex<Option<Instant>>,
    next_run_id: AtomicU64,
    diagnostics: Mutex<Diagnostics>,
    stats: SharedAcquisitionStats,
    metrics: SchedulerMetrics,
}

impl AcquisitionService {
    /// Creates the service.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidPattern` when an agent pattern does not compile.
    pub fn new(
        redis: ConnectionManager,
        config: Arc<SchedulerConfig>,
        scripts: Arc<ScriptManager>,
        intervals: Arc<dyn IntervalProvider>,
        sharding: Arc<dyn ShardingFilter>,
    ) -> Result<Self, ConfigError> {
        let patterns = config.compile_patterns()?;
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        Ok(Self {
            time: TimeSource::new(redis.clone(), config.time_cache_duration),
            keys: config.keys.resolved(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_agents)),
            breaker: CircuitBreaker::new("redis", config.circuit_breaker.clone()),
            redis,
            config,
            scripts,
            patterns,
            intervals,
            sharding,
            registry: std::sync::RwLock::new(HashMap::new()),
            active: Arc::new(ActiveAgents::default()),
            failure_streaks: Mutex::new(HashMap::new()),
            completions_tx,
            completions_rx: Mutex::new(completions_rx),
            pending_completions: Arc::new(AtomicUsize::new(0)),
            shutting_down: AtomicBool::new(false),
            last_repopulate: Mutex::new(None),
            next_run_id: AtomicU64::new(1),
            diagnostics: Mutex::new(Diagnostics::default()),
            stats: SharedAcquisitionStats::default(),
            metrics: SchedulerMetrics::new(),
        })
    }

    /// Initial clock synchronization.
    pub async fn initialize(&self) {
        self.time.sync().await;
    }

    pub fn time(&self) -> &TimeSource {
        &self.time
    }

    pub fn keys(&self) -> &SchedulerKeys {
        &self.keys
    }

    pub fn scripts(&self) -> &Arc<ScriptManager> {
        &self.scripts
    }

    pub fn active(&self) -> &Arc<ActiveAgents> {
        &self.active
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// True when the agent type passes the enabled/disabled patterns.
    pub fn is_enabled(&self, agent_type: &str) -> bool {
        self.patterns.is_enabled(agent_type)
    }

    pub fn belongs_to_this_shard(&self, agent_type: &str) -> bool {
        self.sharding.owns(agent_type)
    }

    pub fn is_registered(&self, agent_type: &str) -> bool {
        read(&self.registry).contains_key(agent_type)
    }

    pub fn registered_agent(&self, agent_type: &str) -> Option<Agent> {
        read(&self.registry).get(agent_type).map(|r| r.agent.clone())
    }

    pub fn registered_count(&self) -> usize {
        read(&self.registry).len()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = read(&self.registry).keys().cloned().collect();
        types.sort();
        types
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn held_permits(&self) -> usize {
        self.config
            .max_concurrent_agents
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn pending_completions(&self) -> usize {
        self.pending_completions.load(Ordering::SeqCst)
    }

    pub fn diagnostics(&self) -> Diagnostics {
        lock(&self.diagnostics).clone()
    }

    pub fn stats(&self) -> AcquisitionStats {
        self.stats.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn interval_for(&self, agent: &Agent) -> Interval {
        self.intervals.interval(agent)
    }

    /// Registers an agent and writes it to the waiting set when absent.
    ///
    /// Returns `false` when the agent is not enabled on this node.
    pub async fn register(
        &self,
        agent: Agent,
        execution: Arc<dyn AgentExecution>,
        instrumentation: Arc<dyn ExecutionInstrumentation>,
    ) -> bool {
        let agent_type = agent.agent_type.clone();
        if !self.is_enabled(&agent_type) {
            debug!(agent_type = %agent_type, "Agent not enabled on this node, skipping registration");
            return false;
        }

        {
            let mut registry = write(&self.registry);
            if let Some(existing) = registry.get(&agent_type) {
                warn!(
                    agent_type = %agent_type,
                    existing_provider = %existing.agent.provider_name,
                    provider = %agent.provider_name,
                    "Agent type collision, replacing registration"
                );
            }
            registry.insert(
                agent_type.clone(),
                RegisteredAgent {
                    agent,
                    execution,
                    instrumentation,
                },
            );
            self.metrics.set_registered_agents(registry.len());
        }

        if !self.scripts.is_initialized() {
            debug!(agent_type = %agent_type, "Scripts not loaded yet, deferring to repopulation");
            return true;
        }

        let delay = registration_jitter_ms(self.config.jitter.initial_registration_seconds);
        let score = self.time.score_after(delay);
        for attempt in 1..=REGISTER_ATTEMPTS {
            match self.scripts.add_agent(&agent_type, score).await {
                Ok(added) => {
                    debug!(agent_type = %agent_type, added = added, score = score, "Registered agent");
                    return true;
                }
                Err(e) if attempt < REGISTER_ATTEMPTS => {
                    debug!(agent_type = %agent_type, attempt = attempt, error = %e, "add_agent failed, retrying");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(e) => {
                    warn!(agent_type = %agent_type, error = %e, "add_agent failed, using fallback");
                    if let Err(e) = self.add_if_absent(&agent_type, score).await {
                        warn!(
                            agent_type = %agent_type,
                            error = %e,
                            "Fallback registration failed, repopulation will retry"
                        );
                    }
                }
            }
        }
        true
    }

    /// Removes an agent from this node. The shared sets are left alone.
    pub fn unregister(&self, agent_type: &str) -> bool {
        let removed = {
            let mut registry = write(&self.registry);
            let removed = registry.remove(agent_type).is_some();
            self.metrics.set_registered_agents(registry.len());
            removed
        };
        lock(&self.failure_streaks).remove(agent_type);
        if removed {
            debug!(agent_type = %agent_type, "Unregistered agent");
        }
        removed
    }

    async fn add_if_absent(&self, agent_type: &str, score: i64) -> Result<bool, redis::RedisError> {
        let mut conn = self.redis.clone();
        let working: Option<f64> = redis::cmd("ZSCORE")
            .arg(&self.keys.working)
            .arg(agent_type)
            .query_async(&mut conn)
            .await?;
        if working.is_some() {
            return Ok(false);
        }
        let added: i64 = redis::cmd("ZADD")
            .arg(&self.keys.waiting)
            .arg("NX")
            .arg(score)
            .arg(agent_type)
            .query_async(&mut conn)
            .await?;
        Ok(added > 0)
    }

    /// The central tick. Returns the number of workers spawned.
    pub async fn saturate_pool(&self, cycle: u64) -> usize {
        self.time.refresh().await;

        if cycle == 0 || self.repopulate_due() {
            self.repopulate().await;
        }

        let mut spawned = 0;
        if self.is_shutting_down() {
            debug!("Shutting down, not acquiring");
        } else if !self.breaker.allow_request() {
            debug!("Redis circuit breaker open, not acquiring");
        } else {
            self.metrics.inc_acquire_attempts();
            match self.acquire().await {
                Ok(count) => {
                    self.breaker.record_success();
                    spawned = count;
                }
                Err(e) => {
                    self.breaker.record_failure();
                    self.metrics.inc_run_failure("acquire");
                    warn!(error = %e, "Acquisition failed, no agents acquired this tick");
                }
            }
        }

        self.drain_completions().await;

        if let Err(e) = self.update_diagnostics().await {
            debug!(error = %e, "Failed to update readiness diagnostics");
        }
        self.metrics.set_active_agents(self.active.len());
        spawned
    }

    fn repopulate_due(&self) -> bool {
        lock(&self.last_repopulate).is_none_or(|at| at.elapsed() >= self.config.refresh_period)
    }

    /// Writes every registered, shard-owned agent missing from both sets into
    /// the waiting set, due now. Returns the number of agents added.
    pub async fn repopulate(&self) -> usize {
        *lock(&self.last_repopulate) = Some(Instant::now());
        let start = Instant::now();

        let agents: Vec<String> = self
            .registered_types()
            .into_iter()
            .filter(|t| self.belongs_to_this_shard(t))
            .collect();
        if agents.is_empty() {
            return 0;
        }

        let now_s = self.time.now_seconds();
        let mut added = 0;
        for chunk in agents.chunks(REPOPULATE_CHUNK) {
            match self.repopulate_chunk(chunk, now_s).await {
                Ok(count) => added += count,
                Err(e) => {
                    warn!(error = %e, agents = chunk.len(), "Repopulation scripts failed, using fallback");
                    self.metrics.inc_repopulate_error("script");
                    match self.repopulate_fallback(chunk, now_s).await {
                        Ok(count) => added += count,
                        Err(e) => {
                            self.metrics.inc_repopulate_error("redis");
                            warn!(error = %e, "Repopulation fallback failed");
                        }
                    }
                }
            }
        }

        self.metrics.record_repopulate(start.elapsed(), added);
        if added > 0 {
            info!(added = added, registered = agents.len(), "Repopulated missing agents");
        }
        added
    }

    async fn repopulate_chunk(
        &self,
        agents: &[String],
        now_s: i64,
    ) -> Result<usize, crate::error::ScriptError> {
        let scores = self.scripts.score_agents(agents).await?;
        let missing: Vec<(String, i64)> = scores
            .into_iter()
            .filter(|s| !s.is_present())
            .map(|s| (s.agent_type, now_s))
            .collect();
        Ok(self.scripts.add_agents(&missing).await?.len())
    }

    async fn repopulate_fallback(
        &self,
        agents: &[String],
        now_s: i64,
    ) -> Result<usize, redis::RedisError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for agent in agents {
            pipe.cmd("ZSCORE").arg(&self.keys.working).arg(agent);
            pipe.cmd("ZSCORE").arg(&self.keys.waiting).arg(agent);
        }
        let scores: Vec<Option<f64>> = pipe.query_async(&mut conn).await?;

        let mut added = 0;
        for (agent, pair) in agents.iter().zip(scores.chunks(2)) {
            if pair.iter().any(Option::is_some) {
                continue;
            }
            let count: i64 = redis::cmd("ZADD")
                .arg(&self.keys.waiting)
                .arg("NX")
                .arg(now_s)
                .arg(agent)
                .query_async(&mut conn)
                .await?;
            added += count as usize;
        }
        Ok(added)
    }

    async fn acquire(&self) -> Result<usize, SchedulerError> {
        let mut conn = self.redis.clone();
        let now_ms = self.time.now_ms();
        let now_s = score_at(now_ms, 0);
        let permits = self.semaphore.available_permits();
        if permits == 0 {
            return Ok(0);
        }

        let chunk_limit = match self.config.batch.batch_size {
            0 => permits,
            size => size,
        };
        let max_chunks = chunk_attempts(
            permits,
            chunk_limit,
            self.config.batch.chunk_attempt_multiplier,
        );
        let mut offset = 0usize;
        let mut spawned = 0;

        for _ in 0..max_chunks {
            let remaining = self.semaphore.available_permits();
            if remaining == 0 {
                break;
            }

            let chunk = remaining.min(chunk_limit);
            let ready: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&self.keys.waiting)
                .arg("-inf")
                .arg(now_s)
                .arg("LIMIT")
                .arg(offset)
                .arg(chunk)
                .query_async(&mut conn)
                .await?;
            if ready.is_empty() {
                break;
            }

            let candidates = self.eligible_candidates(&ready, now_ms);
            let acquired = if candidates.is_empty() {
                0
            } else if self.config.batch.enabled {
                self.acquire_batch(candidates, now_s).await
            } else {
                self.acquire_individual(candidates, now_s).await
            };

            // Acquired agents leave the waiting set, so the head is read again.
            if acquired == 0 {
                offset += ready.len();
            } else {
                spawned += acquired;
                offset = 0;
            }
        }

        if spawned > 0 {
            self.metrics.inc_acquired(spawned);
            self.stats
                .acquired
                .fetch_add(spawned as u64, Ordering::Relaxed);
            debug!(acquired = spawned, "Acquired agents");
        }
        Ok(spawned)
    }

    fn eligible_candidates(&self, ready: &[String], now_ms: i64) -> Vec<Candidate> {
        let registry = read(&self.registry);
        ready
            .iter()
            .filter(|t| !self.active.contains(t) && self.is_enabled(t))
            .filter_map(|t| registry.get(t))
            .map(|registered| {
                let timeout = self.interval_for(&registered.agent).timeout;
                let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX / 2);
                Candidate {
                    registered: registered.clone(),
                    deadline: score_at(now_ms, timeout_ms),
                }
            })
            .collect()
    }

    /// Batched acquisition with one permit taken per candidate up front.
    /// Falls back to the individual path when the script fails.
    async fn acquire_batch(&self, candidates: Vec<Candidate>, now_s: i64) -> usize {
        let start = Instant::now();
        let mut reserved = Vec::new();
        for candidate in candidates {
            match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => reserved.push((candidate, permit)),
                Err(_) => break,
            }
        }
        if reserved.is_empty() {
            return 0;
        }

        let limit = match self.config.batch.batch_size {
            0 => reserved.len(),
            size => size.min(reserved.len()),
        };
        let pairs: Vec<(String, i64)> = reserved
            .iter()
            .map(|(c, _)| (c.registered.agent.agent_type.clone(), c.deadline))
            .collect();

        match self.scripts.acquire_agents(now_s, limit, &pairs).await {
            Ok(acquired) => {
                let mut spawned = 0;
                for (candidate, permit) in reserved {
                    if acquired.contains(&candidate.registered.agent.agent_type)
                        && self.spawn_worker(candidate, permit)
                    {
                        spawned += 1;
                    }
                }
                self.metrics.record_acquire_time("batch", start.elapsed());
                spawned
            }
            Err(e) => {
                warn!(error = %e, candidates = pairs.len(), "Batch acquisition failed, using individual path");
                self.metrics.inc_batch_fallback();
                self.stats.batch_fallbacks.fetch_add(1, Ordering::Relaxed);
                let candidates = reserved.into_iter().map(|(c, _)| c).collect();
                self.acquire_individual(candidates, now_s).await
            }
        }
    }

    async fn acquire_individual(&self, candidates: Vec<Candidate>, now_s: i64) -> usize {
        let start = Instant::now();
        let mut spawned = 0;
        for candidate in candidates {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };

            let agent_type = candidate.registered.agent.agent_type.clone();
            let moved = match self
                .scripts
                .move_agent(&agent_type, candidate.deadline, now_s)
                .await
            {
                Ok(result) => result.is_some(),
                Err(e) => {
                    debug!(agent_type = %agent_type, error = %e, "move_agents failed, using plain commands");
                    match self.move_agent_fallback(&agent_type, candidate.deadline).await {
                        Ok(moved) => moved,
                        Err(e) => {
                            warn!(agent_type = %agent_type, error = %e, "Individual acquisition failed");
                            false
                        }
                    }
                }
            };

            if moved && self.spawn_worker(candidate, permit) {
                spawned += 1;
            }
        }
        self.metrics.record_acquire_time("individual", start.elapsed());
        spawned
    }

    async fn move_agent_fallback(
        &self,
        agent_type: &str,
        deadline: i64,
    ) -> Result<bool, redis::RedisError> {
        let mut conn = self.redis.clone();
        let removed: i64 = redis::cmd("ZREM")
            .arg(&self.keys.waiting)
            .arg(agent_type)
            .query_async(&mut conn)
            .await?;
        if removed != 1 {
            return Ok(false);
        }
        redis::cmd("ZADD")
            .arg(&self.keys.working)
            .arg(deadline)
            .arg(agent_type)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(true)
    }

    fn spawn_worker(&self, candidate: Candidate, permit: OwnedSemaphorePermit) -> bool {
        let agent_type = candidate.registered.agent.agent_type.clone();
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        if !self.active.insert(&agent_type, candidate.deadline, run_id) {
            warn!(agent_type = %agent_type, "Acquired agent is already active locally");
            return false;
        }

        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            agent_type: agent_type.clone(),
            run_id,
        };
        let handle = tokio::spawn(run_agent(
            candidate.registered,
            candidate.deadline,
            permit,
            guard,
            self.completions_tx.clone(),
            Arc::clone(&self.pending_completions),
        ));
        self.active.attach(&agent_type, run_id, handle.abort_handle());
        true
    }

    /// Writes the next run time of every queued completion. Returns the
    /// number of completions processed.
    pub async fn drain_completions(&self) -> usize {
        let records: Vec<Completion> = {
            let mut rx = lock(&self.completions_rx);
            let mut records = Vec::new();
            while let Ok(record) = rx.try_recv() {
                records.push(record);
            }
            records
        };

        let count = records.len();
        for record in records {
            self.pending_completions.fetch_sub(1, Ordering::SeqCst);
            self.reschedule(record).await;
        }
        count
    }

    async fn reschedule(&self, record: Completion) {
        let agent_type = record.agent.agent_type.clone();
        let interval = self.interval_for(&record.agent);
        let now_ms = self.time.now_ms();

        let streak = {
            let mut streaks = lock(&self.failure_streaks);
            if record.success {
                streaks.remove(&agent_type);
                0
            } else {
                let streak = streaks.entry(agent_type.clone()).or_insert(0);
                *streak += 1;
                *streak
            }
        };

        let class = record.failure_class.unwrap_or(FailureClass::Unknown);
        let offset_ms = if self.is_shutting_down() {
            self.shutdown_offset(&interval, Some(record.deadline), now_ms)
        } else if record.success {
            cadence_offset_ms(&interval, Some(record.deadline), now_ms)
        } else {
            failure_offset_ms(
                &self.config.failure_backoff,
                &interval,
                class,
                streak,
                self.config.jitter.failure_backoff_ratio,
            )
        };

        if record.success {
            self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_execution(true, "none");
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_execution(false, class.as_str());
            debug!(
                agent_type = %agent_type,
                failure_class = %class,
                streak = streak,
                offset_ms = offset_ms,
                error = record.error.as_deref().unwrap_or(""),
                "Rescheduling failed agent"
            );
        }

        let score = score_at(now_ms, offset_ms);
        match self.scripts.reschedule_agent(&agent_type, score).await {
            Ok(outcome) => {
                self.stats.rescheduled.fetch_add(1, Ordering::Relaxed);
                debug!(agent_type = %agent_type, score = score, outcome = ?outcome, "Rescheduled agent");
            }
            Err(e) => {
                debug!(agent_type = %agent_type, error = %e, "reschedule_agent failed, using pipeline");
                match self.reschedule_fallback(&agent_type, score).await {
                    Ok(()) => {
                        self.stats.rescheduled.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.metrics.inc_run_failure("reschedule");
                        warn!(
                            agent_type = %agent_type,
                            error = %e,
                            "Failed to reschedule agent, repopulation will restore it"
                        );
                    }
                }
            }
        }
    }

    async fn reschedule_fallback(&self, agent_type: &str, score: i64) -> Result<(), redis::RedisError> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(&self.keys.working)
            .arg(agent_type)
            .ignore()
            .cmd("ZADD")
            .arg(&self.keys.waiting)
            .arg(score)
            .arg(agent_type)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
    }

    fn shutdown_offset(&self, interval: &Interval, deadline: Option<i64>, now_ms: i64) -> i64 {
        shutdown_offset_ms(
            interval,
            deadline,
            now_ms,
            self.config.jitter.shutdown_seconds,
        )
    }

    /// Switches completion handling to shutdown offsets and drains what is
    /// already queued.
    pub async fn set_shutting_down(&self, shutting_down: bool) {
        self.shutting_down.store(shutting_down, Ordering::SeqCst);
        if shutting_down {
            let drained = self.drain_completions().await;
            info!(drained = drained, "Acquisition service entering shutdown");
        }
    }

    /// Moves an agent this node still holds back to waiting, only if its
    /// working score still equals `expected_deadline`.
    pub async fn force_requeue_agent_for_shutdown(&self, agent_type: &str, expected_deadline: i64) {
        let agent = self
            .registered_agent(agent_type)
            .unwrap_or_else(|| Agent::new(agent_type, ""));
        let interval = self.interval_for(&agent);
        let now_ms = self.time.now_ms();
        let offset = self.shutdown_offset(&interval, Some(expected_deadline), now_ms);
        let score = score_at(now_ms, offset);

        match self
            .scripts
            .move_agent_conditional(agent_type, expected_deadline, score)
            .await
        {
            Ok(true) => {
                self.stats.shutdown_requeued.fetch_add(1, Ordering::Relaxed);
                info!(agent_type = %agent_type, score = score, "Requeued agent for shutdown");
            }
            Ok(false) => {
                debug!(
                    agent_type = %agent_type,
                    expected_deadline = expected_deadline,
                    "Agent no longer owned, skipping shutdown requeue"
                );
            }
            Err(e) => {
                warn!(agent_type = %agent_type, error = %e, "Shutdown requeue failed");
            }
        }
    }

    /// Acquisition time implied by a working score: `max(0, score - timeout)`
    /// using the currently configured timeout.
    pub fn compute_original_ready_seconds(&self, agent_type: &str, working_score: i64) -> i64 {
        let timeout_s = self
            .registered_agent(agent_type)
            .map(|agent| self.interval_for(&agent).timeout.as_secs())
            .and_then(|s| i64::try_from(s).ok())
            .unwrap_or(0);
        (working_score - timeout_s).max(0)
    }

    async fn update_diagnostics(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.redis.clone();
        let now_s = self.time.now_seconds();
        let (ready, oldest): (usize, Vec<(String, f64)>) = redis::pipe()
            .cmd("ZCOUNT")
            .arg(&self.keys.waiting)
            .arg("-inf")
            .arg(now_s)
            .cmd("ZRANGE")
            .arg(&self.keys.waiting)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        let oldest_overdue = oldest
            .first()
            .map(|(_, score)| (now_s - *score as i64).max(0))
            .unwrap_or(0);
        let min_interval = {
            let registry = read(&self.registry);
            registry
                .values()
                .map(|r| self.interval_for(&r.agent).interval.as_secs())
                .min()
        };
        let degraded = ready > 0
            && min_interval.is_some_and(|min| oldest_overdue > i64::try_from(min).unwrap_or(i64::MAX));

        self.metrics.set_ready_agents(ready);
        *lock(&self.diagnostics) = Diagnostics {
            ready_count: ready,
            oldest_overdue_seconds: oldest_overdue,
            degraded,
        };
        Ok(())
    }
}

/// Chunks to read in one tick: enough to fill `permits` at `chunk_limit` per
/// chunk, scaled by `multiplier` to see past filtered entries.
fn chunk_attempts(permits: usize, chunk_limit: usize, multiplier: usize) -> usize {
    let base = permits.div_ceil(chunk_limit.max(1)).max(1);
    match multiplier {
        0 => base,
        m => base.saturating_mul(m).min(MAX_CHUNK_ATTEMPTS),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn contain_hook(agent: &Agent, hook: &str, f: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(agent_type = %agent.agent_type, hook = hook, "Instrumentation hook panicked");
    }
}

/// Body of a spawned execution. The guard and permit are dropped after the
/// completion is queued, or when the task is aborted.
async fn run_agent(
    registered: RegisteredAgent,
    deadline: i64,
    permit: OwnedSemaphorePermit,
    guard: ActiveGuard,
    completions: mpsc::UnboundedSender<Completion>,
    pending: Arc<AtomicUsize>,
) {
    let agent = &registered.agent;
    let instrumentation = &registered.instrumentation;

    contain_hook(agent, "execution_started", || {
        instrumentation.execution_started(agent)
    });

    let start = Instant::now();
    let result = AssertUnwindSafe(registered.execution.execute(agent))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ExecutionError::Panicked(panic_message(panic.as_ref()))));
    let elapsed = start.elapsed();

    match &result {
        Ok(()) => contain_hook(agent, "execution_completed", || {
            instrumentation.execution_completed(agent, elapsed)
        }),
        Err(e) => contain_hook(agent, "execution_failed", || {
            instrumentation.execution_failed(agent, e, elapsed)
        }),
    }

    let record = Completion {
        agent: agent.clone(),
        success: result.is_ok(),
        failure_class: result.as_ref().err().map(classify_failure),
        error: result.as_ref().err().map(ToString::to_string),
        elapsed,
        deadline,
    };

    pending.fetch_add(1, Ordering::SeqCst);
    if completions.send(record).is_err() {
        pending.fetch_sub(1, Ordering::SeqCst);
        debug!(agent_type = %agent.agent_type, "Completion queue closed");
    }

    drop(guard);
    drop(permit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::agent::NoopInstrumentation;
    use async_trait::async_trait;

    struct Succeed;

    #[async_trait]
    impl AgentExecution for Succeed {
        async fn execute(&self, _agent: &Agent) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl AgentExecution for Panics {
        async fn execute(&self, _agent: &Agent) -> Result<(), ExecutionError> {
            panic!("exploded")
        }
    }

    struct Sleeps;

    #[async_trait]
    impl AgentExecution for Sleeps {
        async fn execute(&self, _agent: &Agent) -> Result<(), ExecutionError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct PanickingHooks;

    impl ExecutionInstrumentation for PanickingHooks {
        fn execution_started(&self, _agent: &Agent) {
            panic!("hook");
        }
    }

    fn registered(
        agent_type: &str,
        execution: Arc<dyn AgentExecution>,
        instrumentation: Arc<dyn ExecutionInstrumentation>,
    ) -> RegisteredAgent {
        RegisteredAgent {
            agent: Agent::new(agent_type, "test"),
            execution,
            instrumentation,
        }
    }

    async fn run_once(
        registered: RegisteredAgent,
    ) -> (Option<Completion>, Arc<ActiveAgents>, Arc<Semaphore>) {
        let active = Arc::new(ActiveAgents::default());
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.clone().try_acquire_owned().unwrap();
        let agent_type = registered.agent.agent_type.clone();
        assert!(active.insert(&agent_type, 100, 7));
        let guard = ActiveGuard {
            active: Arc::clone(&active),
            agent_type,
            run_id: 7,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        run_agent(registered, 100, permit, guard, tx, pending).await;
        (rx.try_recv().ok(), active, semaphore)
    }

    #[test]
    fn test_active_agents_run_id_guard() {
        let active = ActiveAgents::default();
        assert!(active.insert("aws/A", 100, 1));
        assert!(!active.insert("aws/A", 200, 2));

        // A stale run cannot remove a newer entry
        active.remove("aws/A");
        assert!(active.insert("aws/A", 300, 3));
        active.remove_run("aws/A", 1);
        assert_eq!(active.deadline("aws/A"), Some(300));
        active.remove_run("aws/A", 3);
        assert!(active.is_empty());
    }

    #[test]
    fn test_chunk_attempts() {
        // 10 permits in chunks of 2 need 5 reads
        assert_eq!(chunk_attempts(10, 2, 0), 5);
        assert_eq!(chunk_attempts(10, 2, 1), 5);
        assert_eq!(chunk_attempts(10, 3, 2), 8);
        // Unbounded chunks read once
        assert_eq!(chunk_attempts(10, 10, 0), 1);
        assert_eq!(chunk_attempts(1, 0, 0), 1);
        assert_eq!(chunk_attempts(1000, 1, 5), MAX_CHUNK_ATTEMPTS);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_worker_reports_success_and_releases() {
        let (record, active, semaphore) =
            run_once(registered("aws/A", Arc::new(Succeed), Arc::new(NoopInstrumentation))).await;
        let record = record.unwrap();
        assert!(record.success);
        assert_eq!(record.deadline, 100);
        assert!(active.is_empty());
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_worker_contains_execution_panic() {
        let (record, active, semaphore) =
            run_once(registered("aws/B", Arc::new(Panics), Arc::new(NoopInstrumentation))).await;
        let record = record.unwrap();
        assert!(!record.success);
        assert_eq!(record.failure_class, Some(FailureClass::Unknown));
        assert!(record.error.unwrap().contains("exploded"));
        assert!(active.is_empty());
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_worker_contains_hook_panic() {
        let (record, _, _) =
            run_once(registered("aws/C", Arc::new(Succeed), Arc::new(PanickingHooks))).await;
        assert!(record.unwrap().success);
    }

    #[tokio::test]
    async fn test_aborted_worker_releases_permit_and_entry() {
        let active = Arc::new(ActiveAgents::default());
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.clone().try_acquire_owned().unwrap();
        assert!(active.insert("aws/D", 100, 1));
        let guard = ActiveGuard {
            active: Arc::clone(&active),
            agent_type: "aws/D".to_string(),
            run_id: 1,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_agent(
            registered("aws/D", Arc::new(Sleeps), Arc::new(NoopInstrumentation)),
            100,
            permit,
            guard,
            tx,
            Arc::new(AtomicUsize::new(0)),
        ));
        active.attach("aws/D", 1, handle.abort_handle());
        assert_eq!(active.handles().len(), 1);

        handle.abort();
        let _ = handle.await;

        assert!(active.is_empty());
        assert_eq!(semaphore.available_permits(), 1);
        assert!(rx.try_recv().is_err());
    }
}
