//! Integration tests against a live Redis server.
//!
//! Every test isolates its keys under a random prefix.
//! Run with: REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_integration -- --ignored

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use priority_scheduler::scheduler::config::{JitterConfig, OrphanCleanupConfig, ZombieCleanupConfig};
use priority_scheduler::scheduler::time::local_now_ms;
use priority_scheduler::scheduler::{
    Agent, AgentExecution, AllShards, AlwaysEnabled, Interval, NoopInstrumentation,
    PatternShardingFilter, PriorityScheduler, SchedulerConfig, SchedulerKeys, ScriptName,
    ShardingFilter, StaticIntervalProvider,
};
use priority_scheduler::ExecutionError;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn connect() -> ConnectionManager {
    let client = redis::Client::open(redis_url()).expect("valid REDIS_URL");
    ConnectionManager::new(client)
        .await
        .expect("Redis must be reachable for integration tests")
}

fn test_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::new()
        .with_redis_url(redis_url())
        .with_key_prefix(format!("test:{}:", uuid::Uuid::new_v4()))
        .with_max_concurrent_agents(10)
        .with_jitter(JitterConfig {
            initial_registration_seconds: 0,
            shutdown_seconds: 0,
            failure_backoff_ratio: 0.0,
        })
        .with_zombie_cleanup(ZombieCleanupConfig {
            enabled: false,
            ..Default::default()
        })
        .with_orphan_cleanup(OrphanCleanupConfig {
            enabled: false,
            ..Default::default()
        });
    config.health_summary_period = Duration::ZERO;
    config
}

fn interval(interval_secs: u64, timeout_secs: u64) -> StaticIntervalProvider {
    StaticIntervalProvider::new(Interval::new(
        Duration::from_secs(interval_secs),
        Duration::from_secs(timeout_secs),
    ))
}

async fn build(
    conn: &ConnectionManager,
    config: SchedulerConfig,
    intervals: StaticIntervalProvider,
    sharding: Arc<dyn ShardingFilter>,
) -> Arc<PriorityScheduler> {
    let scheduler = PriorityScheduler::new(
        conn.clone(),
        config.normalize(),
        Arc::new(intervals),
        sharding,
        Arc::new(AlwaysEnabled),
    )
    .expect("valid config");
    scheduler.initialize().await.expect("scripts load");
    Arc::new(scheduler)
}

async fn cleanup_keys(conn: &mut ConnectionManager, keys: &SchedulerKeys) {
    let _: () = redis::cmd("DEL")
        .arg(&keys.waiting)
        .arg(&keys.working)
        .arg(&keys.leader)
        .query_async(conn)
        .await
        .expect("DEL");
}

async fn redis_now(conn: &mut ConnectionManager) -> i64 {
    let (secs, _): (i64, i64) = redis::cmd("TIME").query_async(conn).await.expect("TIME");
    secs
}

async fn score(conn: &mut ConnectionManager, key: &str, agent: &str) -> Option<i64> {
    let score: Option<f64> = redis::cmd("ZSCORE")
        .arg(key)
        .arg(agent)
        .query_async(conn)
        .await
        .expect("ZSCORE");
    score.map(|s| s as i64)
}

async fn zadd(conn: &mut ConnectionManager, key: &str, score: i64, agent: &str) {
    let _: i64 = redis::cmd("ZADD")
        .arg(key)
        .arg(score)
        .arg(agent)
        .query_async(conn)
        .await
        .expect("ZADD");
}

async fn assert_disjoint(conn: &mut ConnectionManager, keys: &SchedulerKeys, agents: &[&str]) {
    for agent in agents {
        let working = score(conn, &keys.working, agent).await;
        let waiting = score(conn, &keys.waiting, agent).await;
        assert!(
            working.is_some() != waiting.is_some(),
            "{} must be in exactly one set (working={:?}, waiting={:?})",
            agent,
            working,
            waiting
        );
    }
}

struct Sleeps(Duration);

#[async_trait]
impl AgentExecution for Sleeps {
    async fn execute(&self, _agent: &Agent) -> Result<(), ExecutionError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

struct Fails(Arc<AtomicUsize>);

#[async_trait]
impl AgentExecution for Fails {
    async fn execute(&self, _agent: &Agent) -> Result<(), ExecutionError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(ExecutionError::other("boom"))
    }
}

struct Panics;

#[async_trait]
impl AgentExecution for Panics {
    async fn execute(&self, _agent: &Agent) -> Result<(), ExecutionError> {
        panic!("agent exploded")
    }
}

async fn register(scheduler: &PriorityScheduler, agent_type: &str, execution: Arc<dyn AgentExecution>) {
    assert!(
        scheduler
            .schedule(
                Agent::new(agent_type, "test"),
                execution,
                Arc::new(NoopInstrumentation)
            )
            .await
    );
}

/// Drains completions until no execution is in flight.
async fn settle(scheduler: &PriorityScheduler) {
    for _ in 0..100 {
        scheduler.acquisition().drain_completions().await;
        if scheduler.acquisition().active().is_empty()
            && scheduler.acquisition().pending_completions() == 0
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("executions did not settle");
}

fn abort_all(scheduler: &PriorityScheduler) {
    for handle in scheduler.acquisition().active().handles().values() {
        handle.abort();
    }
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_acquires_every_ready_agent_with_timeout_deadline() {
    let mut conn = connect().await;
    let scheduler = build(&conn, test_config().with_max_concurrent_agents(3), interval(60, 300), Arc::new(AllShards)).await;
    let keys = scheduler.acquisition().keys().clone();

    let agents = ["aws/A", "aws/B", "aws/C"];
    for agent in agents {
        register(&scheduler, agent, Arc::new(Sleeps(Duration::from_secs(30)))).await;
    }

    let acquired = scheduler.acquisition().saturate_pool(0).await;
    assert_eq!(acquired, 3);
    assert_eq!(scheduler.acquisition().available_permits(), 0);

    let now = redis_now(&mut conn).await;
    for agent in agents {
        let deadline = score(&mut conn, &keys.working, agent)
            .await
            .expect("agent in working");
        assert!((deadline - (now + 300)).abs() <= 2, "deadline {} vs now {}", deadline, now);
    }
    assert_disjoint(&mut conn, &keys, &agents).await;

    abort_all(&scheduler);
    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_acquisition_follows_score_order() {
    let mut conn = connect().await;
    let scheduler = build(&conn, test_config().with_max_concurrent_agents(2), interval(60, 300), Arc::new(AllShards)).await;
    let keys = scheduler.acquisition().keys().clone();

    let now = redis_now(&mut conn).await;
    zadd(&mut conn, &keys.waiting, now - 30, "aws/T1").await;
    zadd(&mut conn, &keys.waiting, now - 20, "aws/T2").await;
    zadd(&mut conn, &keys.waiting, now - 10, "aws/T3").await;
    for agent in ["aws/T3", "aws/T1", "aws/T2"] {
        register(&scheduler, agent, Arc::new(Sleeps(Duration::from_secs(30)))).await;
    }

    assert_eq!(scheduler.acquisition().saturate_pool(1).await, 2);
    let active = scheduler.acquisition().active();
    assert!(active.contains("aws/T1"));
    assert!(active.contains("aws/T2"));
    assert!(!active.contains("aws/T3"));
    assert_eq!(score(&mut conn, &keys.waiting, "aws/T3").await, Some(now - 10));

    abort_all(&scheduler);
    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_small_batches_fill_every_permit_in_score_order() {
    let mut conn = connect().await;
    let config = test_config().with_max_concurrent_agents(10).with_batch_size(2);
    let scheduler = build(&conn, config, interval(60, 300), Arc::new(AllShards)).await;
    let keys = scheduler.acquisition().keys().clone();

    let now = redis_now(&mut conn).await;
    let agents: Vec<String> = (0..30).map(|i| format!("aws/T{:02}", i)).collect();
    for (i, agent) in agents.iter().enumerate() {
        zadd(&mut conn, &keys.waiting, now - 100 + i as i64, agent).await;
    }
    for agent in &agents {
        register(&scheduler, agent, Arc::new(Sleeps(Duration::from_secs(30)))).await;
    }

    assert_eq!(scheduler.acquisition().saturate_pool(1).await, 10);
    assert_eq!(scheduler.acquisition().available_permits(), 0);
    let active = scheduler.acquisition().active();
    for agent in &agents[..10] {
        assert!(active.contains(agent), "{} is among the most overdue", agent);
    }
    for (i, agent) in agents.iter().enumerate().skip(10) {
        assert_eq!(score(&mut conn, &keys.waiting, agent).await, Some(now - 100 + i as i64));
    }

    abort_all(&scheduler);
    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_no_agent_is_lost_across_mixed_outcomes() {
    let mut conn = connect().await;
    let scheduler = build(&conn, test_config().with_max_concurrent_agents(4), interval(1, 300), Arc::new(AllShards)).await;
    let keys = scheduler.acquisition().keys().clone();
    let failures = Arc::new(AtomicUsize::new(0));

    let agents = ["aws/Ok1", "aws/Ok2", "aws/Fail1", "aws/Fail2", "aws/Panic1", "aws/Panic2"];
    for agent in agents {
        let execution: Arc<dyn AgentExecution> = if agent.contains("Ok") {
            Arc::new(Sleeps(Duration::from_millis(50)))
        } else if agent.contains("Fail") {
            Arc::new(Fails(failures.clone()))
        } else {
            Arc::new(Panics)
        };
        register(&scheduler, agent, execution).await;
    }

    for cycle in 0..8 {
        scheduler.acquisition().saturate_pool(cycle).await;

        let mut missing = 0;
        for agent in agents {
            let working = score(&mut conn, &keys.working, agent).await;
            let waiting = score(&mut conn, &keys.waiting, agent).await;
            assert!(working.is_none() || waiting.is_none(), "{} is in both sets", agent);
            if working.is_none() && waiting.is_none() {
                missing += 1;
            }
        }
        let accounted = scheduler.acquisition().pending_completions()
            + scheduler.acquisition().active().len();
        assert!(missing <= accounted, "cycle {}: {} missing, {} in flight", cycle, missing, accounted);

        tokio::time::sleep(Duration::from_millis(600)).await;
    }

    settle(&scheduler).await;
    assert_disjoint(&mut conn, &keys, &agents).await;
    assert!(failures.load(Ordering::SeqCst) > 0);
    assert!(scheduler.acquisition().stats().failed > 0);

    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_register_is_idempotent() {
    let mut conn = connect().await;
    let scheduler = build(&conn, test_config(), interval(60, 300), Arc::new(AllShards)).await;
    let keys = scheduler.acquisition().keys().clone();

    zadd(&mut conn, &keys.waiting, 42, "aws/Existing").await;
    register(&scheduler, "aws/Existing", Arc::new(Sleeps(Duration::ZERO))).await;
    register(&scheduler, "aws/Existing", Arc::new(Sleeps(Duration::ZERO))).await;

    let size: usize = redis::cmd("ZCARD")
        .arg(&keys.waiting)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(size, 1);
    assert_eq!(score(&mut conn, &keys.waiting, "aws/Existing").await, Some(42));
    assert_eq!(scheduler.acquisition().repopulate().await, 0);

    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_failure_without_backoff_uses_error_interval() {
    let mut conn = connect().await;
    let intervals = StaticIntervalProvider::new(
        Interval::new(Duration::from_secs(3600), Duration::from_secs(300))
            .with_error_interval(Duration::from_secs(1)),
    );
    let scheduler = build(&conn, test_config(), intervals, Arc::new(AllShards)).await;
    let keys = scheduler.acquisition().keys().clone();
    let calls = Arc::new(AtomicUsize::new(0));

    register(&scheduler, "aws/Flaky", Arc::new(Fails(calls.clone()))).await;
    assert_eq!(scheduler.acquisition().saturate_pool(0).await, 1);
    settle(&scheduler).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let now = redis_now(&mut conn).await;
    let next = score(&mut conn, &keys.waiting, "aws/Flaky")
        .await
        .expect("rescheduled into waiting");
    assert!((next - now).abs() <= 4, "next {} vs now {}", next, now);
    assert_eq!(score(&mut conn, &keys.working, "aws/Flaky").await, None);
    assert_eq!(scheduler.acquisition().stats().failed, 1);

    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_batch_failure_falls_back_to_individual_acquisition() {
    let mut conn = connect().await;
    let scheduler = build(&conn, test_config().with_max_concurrent_agents(3), interval(60, 300), Arc::new(AllShards)).await;
    let keys = scheduler.acquisition().keys().clone();

    let agents = ["aws/A", "aws/B", "aws/C"];
    for agent in agents {
        register(&scheduler, agent, Arc::new(Sleeps(Duration::from_secs(30)))).await;
    }

    let failing: String = redis::cmd("SCRIPT")
        .arg("LOAD")
        .arg("return redis.error_reply('forced batch failure')")
        .query_async(&mut conn)
        .await
        .unwrap();
    scheduler
        .scripts()
        .replace_sha(ScriptName::AcquireAgents, failing);

    assert_eq!(scheduler.acquisition().saturate_pool(0).await, 3);
    assert_eq!(scheduler.acquisition().stats().batch_fallbacks, 1);
    assert_disjoint(&mut conn, &keys, &agents).await;
    for agent in agents {
        assert!(score(&mut conn, &keys.working, agent).await.is_some());
    }

    abort_all(&scheduler);
    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_shutdown_requeue_checks_ownership() {
    let mut conn = connect().await;
    let scheduler = build(&conn, test_config(), interval(60, 300), Arc::new(AllShards)).await;
    let keys = scheduler.acquisition().keys().clone();

    zadd(&mut conn, &keys.working, 1_000, "aws/Held").await;
    scheduler
        .acquisition()
        .force_requeue_agent_for_shutdown("aws/Held", 999)
        .await;
    assert_eq!(score(&mut conn, &keys.working, "aws/Held").await, Some(1_000));
    assert_eq!(score(&mut conn, &keys.waiting, "aws/Held").await, None);

    scheduler
        .acquisition()
        .force_requeue_agent_for_shutdown("aws/Held", 1_000)
        .await;
    assert_eq!(score(&mut conn, &keys.working, "aws/Held").await, None);
    assert!(score(&mut conn, &keys.waiting, "aws/Held").await.is_some());

    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_shutdown_mid_execution_lands_in_waiting() {
    let mut conn = connect().await;
    let config = test_config()
        .with_interval(Duration::from_millis(100))
        .with_shutdown_timeout(Duration::from_secs(5));
    let scheduler = build(&conn, config, interval(2, 60), Arc::new(AllShards)).await;
    let keys = scheduler.acquisition().keys().clone();

    register(&scheduler, "aws/Slow", Arc::new(Sleeps(Duration::from_millis(1500)))).await;
    scheduler.start().unwrap();

    for _ in 0..50 {
        if scheduler.acquisition().active().contains("aws/Slow") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(scheduler.acquisition().active().contains("aws/Slow"));

    scheduler.shutdown().await.unwrap();

    let now = redis_now(&mut conn).await;
    let next = score(&mut conn, &keys.waiting, "aws/Slow")
        .await
        .expect("requeued into waiting");
    assert!(next <= now + 4, "next {} vs now {}", next, now);
    assert_eq!(score(&mut conn, &keys.working, "aws/Slow").await, None);
    assert!(scheduler.acquisition().active().is_empty());

    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_zombie_is_aborted_and_released() {
    let mut conn = connect().await;
    let config = test_config().with_zombie_cleanup(ZombieCleanupConfig {
        enabled: true,
        threshold: Duration::from_secs(1),
        interval: Duration::ZERO,
        ..Default::default()
    });
    let scheduler = build(&conn, config, interval(60, 0), Arc::new(AllShards)).await;
    let keys = scheduler.acquisition().keys().clone();

    register(&scheduler, "aws/Hung", Arc::new(Sleeps(Duration::from_secs(3600)))).await;
    assert_eq!(scheduler.acquisition().saturate_pool(0).await, 1);

    tokio::time::sleep(Duration::from_millis(2100)).await;
    let active = scheduler.acquisition().active();
    let cleaned = scheduler
        .zombie_cleanup()
        .cleanup_if_needed(&active.deadlines(), &active.handles())
        .await;

    assert_eq!(cleaned, 1);
    assert!(active.is_empty());
    assert_eq!(score(&mut conn, &keys.working, "aws/Hung").await, None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.acquisition().available_permits(), 10);

    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_exceptional_agents_use_their_own_zombie_threshold() {
    let mut conn = connect().await;
    let config = test_config().with_zombie_cleanup(ZombieCleanupConfig {
        enabled: true,
        threshold: Duration::from_secs(1),
        interval: Duration::ZERO,
        exceptional_agents_pattern: "gcp/.*BigQuery.*".to_string(),
        exceptional_threshold: Duration::from_secs(3600),
        ..Default::default()
    });
    let scheduler = build(&conn, config, interval(60, 300), Arc::new(AllShards)).await;
    let keys = scheduler.acquisition().keys().clone();
    let now = redis_now(&mut conn).await;

    let deadlines: HashMap<String, i64> = [
        ("gcp/BigQueryAgent", now - 10),
        ("gcp/BigQueryStale", now - 4_000),
        // Full match: a longer type containing the pattern is not exceptional
        ("aws/gcp/BigQueryAgent", now - 10),
        ("aws/Instances", now - 10),
    ]
    .into_iter()
    .map(|(agent, deadline)| (agent.to_string(), deadline))
    .collect();
    for (agent, deadline) in &deadlines {
        zadd(&mut conn, &keys.working, *deadline, agent).await;
    }

    let zombies = scheduler.zombie_cleanup();
    assert_eq!(zombies.cleanup(&deadlines, &HashMap::new()).await, 3);
    assert_eq!(score(&mut conn, &keys.working, "gcp/BigQueryAgent").await, Some(now - 10));
    for agent in ["gcp/BigQueryStale", "aws/gcp/BigQueryAgent", "aws/Instances"] {
        assert_eq!(score(&mut conn, &keys.working, agent).await, None, "{} is a zombie", agent);
    }

    // Clearing the pattern puts every agent on the default threshold
    zombies.refresh_exceptional_pattern("").expect("blank pattern");
    let remaining: HashMap<String, i64> = [("gcp/BigQueryAgent".to_string(), now - 10)].into();
    assert_eq!(zombies.cleanup(&remaining, &HashMap::new()).await, 1);
    assert_eq!(score(&mut conn, &keys.working, "gcp/BigQueryAgent").await, None);

    zadd(&mut conn, &keys.working, now - 10, "aws/Reloaded").await;
    zombies.refresh_exceptional_pattern("aws/Reloaded").expect("valid pattern");
    let reloaded: HashMap<String, i64> = [("aws/Reloaded".to_string(), now - 10)].into();
    assert_eq!(zombies.cleanup(&reloaded, &HashMap::new()).await, 0);
    assert_eq!(score(&mut conn, &keys.working, "aws/Reloaded").await, Some(now - 10));

    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_orphan_cleanup_preserves_cadence_and_respects_shards() {
    let mut conn = connect().await;
    let scheduler = build(
        &conn,
        test_config(),
        interval(60, 100),
        Arc::new(PatternShardingFilter::new("aws/.*").unwrap()),
    )
    .await;
    let keys = scheduler.acquisition().keys().clone();
    let now = redis_now(&mut conn).await;
    let stale = now - 1_000;

    zadd(&mut conn, &keys.working, stale, "aws/Registered").await;
    zadd(&mut conn, &keys.working, stale, "aws/Gone").await;
    zadd(&mut conn, &keys.working, stale, "gcp/Foreign").await;
    zadd(&mut conn, &keys.waiting, stale, "aws/GoneWaiting").await;
    zadd(&mut conn, &keys.waiting, stale, "gcp/ForeignWaiting").await;
    zadd(&mut conn, &keys.waiting, stale, "1700000000").await;
    register(&scheduler, "aws/Registered", Arc::new(Sleeps(Duration::ZERO))).await;

    let cleaned = scheduler.orphan_cleanup().force_cleanup().await;
    assert_eq!(cleaned, 4);

    assert_eq!(score(&mut conn, &keys.working, "aws/Registered").await, None);
    assert_eq!(
        score(&mut conn, &keys.waiting, "aws/Registered").await,
        Some(stale - 100)
    );
    assert_eq!(score(&mut conn, &keys.working, "aws/Gone").await, None);
    assert_eq!(score(&mut conn, &keys.working, "gcp/Foreign").await, Some(stale));
    assert_eq!(score(&mut conn, &keys.waiting, "aws/GoneWaiting").await, None);
    assert_eq!(
        score(&mut conn, &keys.waiting, "gcp/ForeignWaiting").await,
        Some(stale)
    );
    assert_eq!(score(&mut conn, &keys.waiting, "1700000000").await, None);
    assert_eq!(scheduler.orphan_cleanup().stats().cleaned_total, 4);

    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_orphan_cleanup_handles_fractional_scores() {
    let mut conn = connect().await;
    let scheduler = build(&conn, test_config(), interval(60, 100), Arc::new(AllShards)).await;
    let keys = scheduler.acquisition().keys().clone();
    let now = redis_now(&mut conn).await;
    let stale = now - 1_000;
    let fractional = format!("{}.5", stale);

    for (key, agent) in [
        (&keys.working, "aws/Registered"),
        (&keys.working, "aws/Gone"),
        (&keys.waiting, "aws/GoneWaiting"),
    ] {
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(&fractional)
            .arg(agent)
            .query_async(&mut conn)
            .await
            .expect("ZADD");
    }
    register(&scheduler, "aws/Registered", Arc::new(Sleeps(Duration::ZERO))).await;

    assert_eq!(scheduler.orphan_cleanup().force_cleanup().await, 3);
    assert_eq!(score(&mut conn, &keys.working, "aws/Registered").await, None);
    assert_eq!(
        score(&mut conn, &keys.waiting, "aws/Registered").await,
        Some(stale - 100)
    );
    assert_eq!(score(&mut conn, &keys.working, "aws/Gone").await, None);
    assert_eq!(score(&mut conn, &keys.waiting, "aws/GoneWaiting").await, None);

    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_leadership_is_exclusive_and_expires() {
    let mut conn = connect().await;
    let config = test_config().with_orphan_cleanup(OrphanCleanupConfig {
        leadership_ttl: Duration::from_secs(1),
        ..Default::default()
    });
    let first = build(&conn, config.clone(), interval(60, 300), Arc::new(AllShards)).await;
    let second = build(&conn, config, interval(60, 300), Arc::new(AllShards)).await;
    let keys = first.acquisition().keys().clone();

    let a = first.orphan_cleanup();
    let b = second.orphan_cleanup();
    assert_ne!(a.owner(), b.owner());

    assert!(a.try_acquire_leadership().await.unwrap());
    assert!(!b.try_acquire_leadership().await.unwrap());

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(b.try_acquire_leadership().await.unwrap());

    // A stale owner cannot release the new leader's key
    a.release_leadership().await;
    let holder: Option<String> = redis::cmd("GET")
        .arg(&keys.leader)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(holder.as_deref(), Some(b.owner()));

    b.release_leadership().await;
    assert!(a.try_acquire_leadership().await.unwrap());

    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_scripts_self_heal_after_flush() {
    let mut conn = connect().await;
    let scheduler = build(&conn, test_config(), interval(60, 300), Arc::new(AllShards)).await;
    let keys = scheduler.acquisition().keys().clone();

    scheduler
        .scripts()
        .replace_sha(ScriptName::AddAgent, "0".repeat(40));
    assert!(scheduler.scripts().add_agent("aws/Healed", 7).await.unwrap());
    assert_eq!(score(&mut conn, &keys.waiting, "aws/Healed").await, Some(7));

    cleanup_keys(&mut conn, &keys).await;
}

#[tokio::test]
#[ignore]
async fn test_health_summary_reports_sets() {
    let mut conn = connect().await;
    let scheduler = build(&conn, test_config(), interval(60, 300), Arc::new(AllShards)).await;
    let keys = scheduler.acquisition().keys().clone();
    let now_ms = local_now_ms();

    zadd(&mut conn, &keys.waiting, now_ms / 1000 - 5, "aws/Ready").await;
    zadd(&mut conn, &keys.working, now_ms / 1000 + 100, "aws/Busy").await;

    let summary = scheduler.health_summary().await.unwrap();
    assert_eq!(summary.waiting_set_size, 1);
    assert_eq!(summary.working_set_size, 1);
    assert_eq!(summary.overlapping_agents, 0);
    assert_eq!(summary.circuit_state, "closed");

    cleanup_keys(&mut conn, &keys).await;
}
