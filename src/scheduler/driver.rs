//! The scheduler a host process embeds.
//!
//! [`PriorityScheduler`] owns the acquisition service and both cleanup
//! services, and drives them from one tick loop. Cleanup passes run on
//! spawned tasks so a slow scan never delays acquisition; a watchdog aborts
//! passes that hang.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures::FutureExt;
use redis::aio::ConnectionManager;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;
use crate::metrics::SchedulerMetrics;

use super::acquisition::{AcquisitionService, AcquisitionStats, RegisteredAgent};
use super::agent::{
    Agent, AgentExecution, ExecutionInstrumentation, IntervalProvider, NodeStatusProvider,
    ShardingFilter,
};
use super::config::SchedulerConfig;
use super::orphan::{OrphanCleanupService, OrphanStats};
use super::scripts::ScriptManager;
use super::zombie::ZombieCleanupService;
use super::{lock, read, write};

/// Grace added to a cleanup run budget before the watchdog aborts the pass.
const WATCHDOG_GRACE: Duration = Duration::from_secs(30);

/// Watchdog limit for cleanup passes without a run budget.
const WATCHDOG_DEFAULT: Duration = Duration::from_secs(60);

/// Working-set members sampled by the overlap check.
const OVERLAP_SAMPLE: isize = 100;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Snapshot of scheduler state and counters.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub cycles: u64,
    pub tick_failures: u64,
    pub known_agents: usize,
    pub registered_agents: usize,
    pub active_agents: usize,
    pub acquisition: AcquisitionStats,
    pub zombies_cleaned: u64,
    pub orphans: OrphanStats,
    pub cleanup_skips: u64,
    pub cleanup_timeouts: u64,
}

/// Point-in-time view of scheduler health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub registered_agents: usize,
    pub active_agents: usize,
    pub ready_agents: usize,
    pub oldest_overdue_seconds: i64,
    pub degraded: bool,
    pub permits_available: usize,
    pub permits_held: usize,
    pub pending_completions: usize,
    pub working_set_size: usize,
    pub waiting_set_size: usize,
    /// Sampled working members also present in the waiting set.
    pub overlapping_agents: usize,
    pub circuit_state: String,
    pub clock_offset_ms: i64,
}

struct CleanupTask {
    handle: JoinHandle<usize>,
    started: Instant,
}

#[derive(Debug, Clone, Copy)]
enum CleanupKind {
    Zombie,
    Orphan,
}

impl CleanupKind {
    fn as_str(&self) -> &'static str {
        match self {
            CleanupKind::Zombie => "zombie",
            CleanupKind::Orphan => "orphan",
        }
    }
}

pub struct PriorityScheduler {
    redis: ConnectionManager,
    config: Arc<SchedulerConfig>,
    scripts: Arc<ScriptManager>,
    acquisition: Arc<AcquisitionService>,
    zombie: Arc<ZombieCleanupService>,
    orphan: Arc<OrphanCleanupService>,
    sharding: Arc<dyn ShardingFilter>,
    node_status: Arc<dyn NodeStatusProvider>,
    known_agents: RwLock<HashMap<String, RegisteredAgent>>,
    initialized: AtomicBool,
    running: AtomicBool,
    cycle: AtomicU64,
    tick_failures: AtomicU64,
    cleanup_skips: AtomicU64,
    cleanup_timeouts: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    zombie_task: Mutex<Option<CleanupTask>>,
    orphan_task: Mutex<Option<CleanupTask>>,
    last_reconcile: Mutex<Option<Instant>>,
    last_health_summary: Mutex<Option<Instant>>,
    metrics: SchedulerMetrics,
}

impl PriorityScheduler {
    /// Validates the configuration, connects to Redis and builds the
    /// scheduler. Call [`initialize`](Self::initialize) before starting it.
    pub async fn connect(
        config: SchedulerConfig,
        intervals: Arc<dyn IntervalProvider>,
        sharding: Arc<dyn ShardingFilter>,
        node_status: Arc<dyn NodeStatusProvider>,
    ) -> Result<Arc<Self>, SchedulerError> {
        let config = config.normalize();
        config.validate()?;

        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| SchedulerError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| SchedulerError::ConnectionFailed(e.to_string()))?;

        info!(redis_url = %config.redis_url, "Connected to Redis");
        Self::new(redis, config, intervals, sharding, node_status).map(Arc::new)
    }

    /// Builds the scheduler on an existing connection.
    pub fn new(
        redis: ConnectionManager,
        config: SchedulerConfig,
        intervals: Arc<dyn IntervalProvider>,
        sharding: Arc<dyn ShardingFilter>,
        node_status: Arc<dyn NodeStatusProvider>,
    ) -> Result<Self, SchedulerError> {
        let config = Arc::new(config);
        let scripts = Arc::new(ScriptManager::new(redis.clone(), config.keys.resolved()));
        let acquisition = Arc::new(AcquisitionService::new(
            redis.clone(),
            Arc::clone(&config),
            Arc::clone(&scripts),
            intervals,
            Arc::clone(&sharding),
        )?);
        let zombie = Arc::new(ZombieCleanupService::new(Arc::clone(&acquisition), &config)?);
        let orphan = Arc::new(OrphanCleanupService::new(
            redis.clone(),
            Arc::clone(&acquisition),
            &config,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            redis,
            config,
            scripts,
            acquisition,
            zombie,
            orphan,
            sharding,
            node_status,
            known_agents: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            cycle: AtomicU64::new(0),
            tick_failures: AtomicU64::new(0),
            cleanup_skips: AtomicU64::new(0),
            cleanup_timeouts: AtomicU64::new(0),
            shutdown_tx,
            loop_handle: Mutex::new(None),
            zombie_task: Mutex::new(None),
            orphan_task: Mutex::new(None),
            last_reconcile: Mutex::new(None),
            last_health_summary: Mutex::new(None),
            metrics: SchedulerMetrics::new(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn scripts(&self) -> &Arc<ScriptManager> {
        &self.scripts
    }

    pub fn acquisition(&self) -> &Arc<AcquisitionService> {
        &self.acquisition
    }

    pub fn zombie_cleanup(&self) -> &Arc<ZombieCleanupService> {
        &self.zombie
    }

    pub fn orphan_cleanup(&self) -> &Arc<OrphanCleanupService> {
        &self.orphan
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn should_register(&self, agent_type: &str) -> bool {
        self.sharding.owns(agent_type) && self.acquisition.is_enabled(agent_type)
    }

    /// Records an agent and registers it for execution when this node owns
    /// it. Returns whether it was registered.
    pub async fn schedule(
        &self,
        agent: Agent,
        execution: Arc<dyn AgentExecution>,
        instrumentation: Arc<dyn ExecutionInstrumentation>,
    ) -> bool {
        let agent_type = agent.agent_type.clone();
        let registered = RegisteredAgent {
            agent,
            execution,
            instrumentation,
        };
        write(&self.known_agents).insert(agent_type.clone(), registered.clone());

        if !self.should_register(&agent_type) {
            debug!(agent_type = %agent_type, "Agent not owned or not enabled, recorded only");
            return false;
        }
        self.acquisition
            .register(
                registered.agent,
                registered.execution,
                registered.instrumentation,
            )
            .await
    }

    pub fn unschedule(&self, agent_type: &str) -> bool {
        let known = write(&self.known_agents).remove(agent_type).is_some();
        let registered = self.acquisition.unregister(agent_type);
        known || registered
    }

    /// Loads the scripts and synchronizes the clock. Fails when the scripts
    /// cannot be loaded.
    pub async fn initialize(&self) -> Result<(), SchedulerError> {
        self.scripts
            .initialize()
            .await
            .map_err(|source| SchedulerError::Initialization {
                message: "failed to load scheduler scripts".to_string(),
                source,
            })?;
        self.acquisition.initialize().await;
        self.initialized.store(true, Ordering::SeqCst);
        info!(
            scripts = self.scripts.script_count(),
            keys = ?self.acquisition.keys(),
            "Priority scheduler initialized"
        );
        Ok(())
    }

    /// Spawns the tick loop.
    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Tick loop received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if AssertUnwindSafe(this.run_once()).catch_unwind().await.is_err() {
                            this.tick_failures.fetch_add(1, Ordering::Relaxed);
                            this.metrics.inc_run_failure("panic");
                            error!("Scheduler tick panicked");
                        }
                    }
                }
            }
        });
        *lock(&self.loop_handle) = Some(handle);

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_concurrent = self.config.max_concurrent_agents,
            "Priority scheduler started"
        );
        Ok(())
    }

    /// One scheduler tick.
    pub async fn run_once(&self) {
        let start = Instant::now();

        if !self.node_status.is_node_enabled() {
            debug!("Node disabled, skipping tick");
            return;
        }

        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst);
        if cycle > 0 && self.reconcile_due() {
            self.reconcile_known_agents().await;
        }

        let acquired = self.acquisition.saturate_pool(cycle).await;

        self.check_hung_cleanups();
        self.spawn_zombie_cleanup();
        self.spawn_orphan_cleanup();
        self.maybe_log_health_summary().await;

        self.metrics.record_run_cycle(true, start.elapsed());
        if acquired > 0 {
            debug!(cycle = cycle, acquired = acquired, "Tick complete");
        }
    }

    fn reconcile_due(&self) -> bool {
        let mut last = lock(&self.last_reconcile);
        match *last {
            Some(at) if at.elapsed() < self.config.refresh_period => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    /// Registers known agents this node now owns and unregisters those it
    /// no longer owns.
    async fn reconcile_known_agents(&self) {
        let known: Vec<RegisteredAgent> = read(&self.known_agents).values().cloned().collect();
        let mut registered = 0;
        let mut unregistered = 0;

        for entry in known {
            let agent_type = entry.agent.agent_type.clone();
            let should = self.should_register(&agent_type);
            let is = self.acquisition.is_registered(&agent_type);
            if should && !is {
                if self
                    .acquisition
                    .register(entry.agent, entry.execution, entry.instrumentation)
                    .await
                {
                    registered += 1;
                }
            } else if !should && is && self.acquisition.unregister(&agent_type) {
                unregistered += 1;
            }
        }

        if registered > 0 || unregistered > 0 {
            info!(
                registered = registered,
                unregistered = unregistered,
                "Reconciled known agents"
            );
        }
    }

    fn watchdog_limit(budget: Duration) -> Duration {
        if budget.is_zero() {
            WATCHDOG_DEFAULT
        } else {
            budget + WATCHDOG_GRACE
        }
    }

    fn check_hung_cleanups(&self) {
        for (kind, slot, budget) in [
            (CleanupKind::Zombie, &self.zombie_task, self.zombie.run_budget()),
            (CleanupKind::Orphan, &self.orphan_task, self.orphan.run_budget()),
        ] {
            let mut slot = lock(slot);
            let hung = slot.as_ref().is_some_and(|task| {
                !task.handle.is_finished() && task.started.elapsed() > Self::watchdog_limit(budget)
            });
            if hung {
                if let Some(task) = slot.take() {
                    task.handle.abort();
                }
                self.cleanup_timeouts.fetch_add(1, Ordering::Relaxed);
                self.metrics.inc_cleanup_timeout(kind.as_str());
                warn!(kind = kind.as_str(), "Cleanup pass hung, aborted");
            }
        }
    }

    /// Returns false and counts a skip when the previous pass is still running.
    fn claim_slot(&self, kind: CleanupKind, slot: &Mutex<Option<CleanupTask>>) -> bool {
        let busy = lock(slot)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished());
        if busy {
            self.cleanup_skips.fetch_add(1, Ordering::Relaxed);
            self.metrics.inc_cleanup_skipped(kind.as_str());
            debug!(kind = kind.as_str(), "Previous cleanup still running, skipping");
        }
        !busy
    }

    fn spawn_zombie_cleanup(&self) {
        if !self.zombie.is_due() || !self.claim_slot(CleanupKind::Zombie, &self.zombie_task) {
            return;
        }
        let active = self.acquisition.active();
        let deadlines = active.deadlines();
        let handles = active.handles();
        let zombie = Arc::clone(&self.zombie);
        let handle =
            tokio::spawn(async move { zombie.cleanup_if_needed(&deadlines, &handles).await });
        *lock(&self.zombie_task) = Some(CleanupTask {
            handle,
            started: Instant::now(),
        });
    }

    fn spawn_orphan_cleanup(&self) {
        if !self.orphan.is_due() || !self.claim_slot(CleanupKind::Orphan, &self.orphan_task) {
            return;
        }
        let orphan = Arc::clone(&self.orphan);
        let handle = tokio::spawn(async move { orphan.cleanup_if_needed().await });
        *lock(&self.orphan_task) = Some(CleanupTask {
            handle,
            started: Instant::now(),
        });
    }

    async fn maybe_log_health_summary(&self) {
        let period = self.config.health_summary_period;
        if period.is_zero() {
            return;
        }
        {
            let mut last = lock(&self.last_health_summary);
            if last.is_some_and(|at| at.elapsed() < period) {
                return;
            }
            *last = Some(Instant::now());
        }

        match self.health_summary().await {
            Ok(summary) if summary.degraded || summary.overlapping_agents > 0 => {
                warn!(
                    registered = summary.registered_agents,
                    active = summary.active_agents,
                    ready = summary.ready_agents,
                    oldest_overdue_s = summary.oldest_overdue_seconds,
                    overlapping = summary.overlapping_agents,
                    "Scheduler health degraded"
                );
            }
            Ok(summary) => {
                info!(
                    registered = summary.registered_agents,
                    active = summary.active_agents,
                    ready = summary.ready_agents,
                    working = summary.working_set_size,
                    waiting = summary.waiting_set_size,
                    permits_available = summary.permits_available,
                    "Scheduler health summary"
                );
            }
            Err(e) => debug!(error = %e, "Failed to build health summary"),
        }
    }

    pub async fn health_summary(&self) -> Result<HealthSummary, SchedulerError> {
        let keys = self.acquisition.keys();
        let mut conn = self.redis.clone();

        let (working_size, waiting_size, sample): (usize, usize, Vec<String>) = redis::pipe()
            .cmd("ZCARD")
            .arg(&keys.working)
            .cmd("ZCARD")
            .arg(&keys.waiting)
            .cmd("ZRANGE")
            .arg(&keys.working)
            .arg(0)
            .arg(OVERLAP_SAMPLE - 1)
            .query_async(&mut conn)
            .await?;

        let overlapping_agents = if sample.is_empty() {
            0
        } else {
            let mut pipe = redis::pipe();
            for agent in &sample {
                pipe.cmd("ZSCORE").arg(&keys.waiting).arg(agent);
            }
            let scores: Vec<Option<f64>> = pipe.query_async(&mut conn).await?;
            scores.iter().filter(|s| s.is_some()).count()
        };

        let diagnostics = self.acquisition.diagnostics();
        Ok(HealthSummary {
            registered_agents: self.acquisition.registered_count(),
            active_agents: self.acquisition.active().len(),
            ready_agents: diagnostics.ready_count,
            oldest_overdue_seconds: diagnostics.oldest_overdue_seconds,
            degraded: diagnostics.degraded,
            permits_available: self.acquisition.available_permits(),
            permits_held: self.acquisition.held_permits(),
            pending_completions: self.acquisition.pending_completions(),
            working_set_size: working_size,
            waiting_set_size: waiting_size,
            overlapping_agents,
            circuit_state: self.acquisition.breaker().state().to_string(),
            clock_offset_ms: self.acquisition.time().offset_ms(),
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.is_running(),
            cycles: self.cycle.load(Ordering::SeqCst),
            tick_failures: self.tick_failures.load(Ordering::Relaxed),
            known_agents: read(&self.known_agents).len(),
            registered_agents: self.acquisition.registered_count(),
            active_agents: self.acquisition.active().len(),
            acquisition: self.acquisition.stats(),
            zombies_cleaned: self.zombie.cleaned_total(),
            orphans: self.orphan.stats(),
            cleanup_skips: self.cleanup_skips.load(Ordering::Relaxed),
            cleanup_timeouts: self.cleanup_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Stops the tick loop and hands this node's agents back to the fleet.
    ///
    /// Active agents are requeued first; in-flight executions are then given
    /// up to `shutdown_timeout` to finish while completions are drained.
    /// Running executions are not cancelled.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        info!("Shutting down priority scheduler");

        let _ = self.shutdown_tx.send(());
        let loop_handle = lock(&self.loop_handle).take();
        if let Some(handle) = loop_handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Tick loop ended abnormally");
            }
        }

        self.acquisition.set_shutting_down(true).await;

        let active = self.acquisition.active().deadlines();
        for (agent_type, deadline) in &active {
            self.acquisition
                .force_requeue_agent_for_shutdown(agent_type, *deadline)
                .await;
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while !self.acquisition.active().is_empty() && Instant::now() < deadline {
            self.acquisition.drain_completions().await;
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        let remaining = self.acquisition.active().len();
        if remaining > 0 {
            warn!(remaining = remaining, "Shutdown timeout reached with executions in flight");
        }
        self.acquisition.drain_completions().await;

        for slot in [&self.zombie_task, &self.orphan_task] {
            if let Some(task) = lock(slot).take() {
                task.handle.abort();
            }
        }

        info!(
            requeued = active.len(),
            stats = ?self.acquisition.stats(),
            "Priority scheduler stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_limit() {
        assert_eq!(
            PriorityScheduler::watchdog_limit(Duration::ZERO),
            Duration::from_secs(60)
        );
        assert_eq!(
            PriorityScheduler::watchdog_limit(Duration::from_secs(10)),
            Duration::from_secs(40)
        );
    }

    #[test]
    fn test_cleanup_kind_labels() {
        assert_eq!(CleanupKind::Zombie.as_str(), "zombie");
        assert_eq!(CleanupKind::Orphan.as_str(), "orphan");
    }
}
