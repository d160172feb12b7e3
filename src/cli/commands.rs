//! CLI command definitions for priority-scheduler.
//!
//! `run` starts a fleet node driving synthetic agents, `status` inspects the
//! shared sets and `scripts` loads the Lua scripts and prints their hashes.

use crate::error::ExecutionError;
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::agent::{
    Agent, AgentExecution, AllShards, AlwaysEnabled, Interval, LoggingInstrumentation,
    PatternShardingFilter, ShardingFilter, StaticIntervalProvider,
};
use crate::scheduler::{PriorityScheduler, SchedulerConfig, SchedulerKeys, ScriptManager};
use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use rand::RngExt;
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default number of synthetic agents registered by `run`.
const DEFAULT_AGENT_COUNT: usize = 10;

/// Distributed priority scheduler backed by Redis sorted sets.
#[derive(Parser)]
#[command(name = "priority-scheduler")]
#[command(about = "Run and inspect a Redis-backed distributed agent scheduler")]
#[command(version)]
#[command(
    long_about = "priority-scheduler coordinates recurring agents across a fleet of nodes through two Redis sorted sets.\n\nExample usage:\n  priority-scheduler run --agents 20 --interval-secs 30\n  priority-scheduler status --head 10 --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL. Overrides PRIORITY_SCHEDULER_REDIS_URL.
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    /// Key prefix for the scheduler sets.
    #[arg(long, global = true)]
    pub prefix: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a scheduler node with synthetic agents until Ctrl-C.
    Run(RunArgs),

    /// Show the size and head entries of the waiting and working sets.
    Status(StatusArgs),

    /// Load the scheduler scripts and print their SHA1 hashes.
    Scripts,
}

/// Arguments for `priority-scheduler run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of synthetic agents to register.
    #[arg(short = 'n', long, default_value_t = DEFAULT_AGENT_COUNT)]
    pub agents: usize,

    /// Agent type prefix; agents are named `{provider}/Agent-{i}`.
    #[arg(long, default_value = "demo")]
    pub provider: String,

    /// Cadence of every agent in seconds.
    #[arg(long, default_value = "30")]
    pub interval_secs: u64,

    /// Execution timeout of every agent in seconds.
    #[arg(long, default_value = "120")]
    pub timeout_secs: u64,

    /// Maximum concurrent executions on this node.
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Minimum synthetic execution time in milliseconds.
    #[arg(long, default_value = "100")]
    pub min_work_ms: u64,

    /// Maximum synthetic execution time in milliseconds.
    #[arg(long, default_value = "2000")]
    pub max_work_ms: u64,

    /// Probability in [0, 1] that a synthetic execution fails.
    #[arg(long, default_value = "0.0")]
    pub failure_rate: f64,

    /// Only own agent types fully matching this pattern.
    #[arg(long)]
    pub shard_pattern: Option<String>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Print Prometheus metrics on exit.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `priority-scheduler status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Number of head entries to show per set.
    #[arg(long, default_value = "5")]
    pub head: usize,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.redis_url.as_deref(), cli.prefix.as_deref())?;
    match cli.command {
        Commands::Run(args) => run_node_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::Scripts => run_scripts_command(config).await,
    }
}

fn load_config(redis_url: Option<&str>, prefix: Option<&str>) -> anyhow::Result<SchedulerConfig> {
    let mut config = SchedulerConfig::from_env().context("invalid scheduler environment")?;
    if let Some(url) = redis_url {
        config = config.with_redis_url(url);
    }
    if let Some(prefix) = prefix {
        config = config.with_key_prefix(prefix);
    }
    Ok(config)
}

async fn connect(config: &SchedulerConfig) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(config.redis_url.as_str())
        .with_context(|| format!("invalid Redis URL: {}", config.redis_url))?;
    ConnectionManager::new(client)
        .await
        .with_context(|| format!("failed to connect to {}", config.redis_url))
}

// ============================================================================
// Run Command Implementation
// ============================================================================

/// Sleeps for a random time and fails with a configured probability.
struct SyntheticExecution {
    min_work_ms: u64,
    max_work_ms: u64,
    failure_rate: f64,
}

#[async_trait]
impl AgentExecution for SyntheticExecution {
    async fn execute(&self, agent: &Agent) -> Result<(), ExecutionError> {
        let (work_ms, fail) = {
            let mut rng = rand::rng();
            let work_ms = if self.max_work_ms > self.min_work_ms {
                rng.random_range(self.min_work_ms..=self.max_work_ms)
            } else {
                self.min_work_ms
            };
            (work_ms, rng.random_range(0.0..1.0) < self.failure_rate)
        };

        tokio::time::sleep(Duration::from_millis(work_ms)).await;
        if fail {
            return Err(ExecutionError::other(format!(
                "synthetic failure in {}",
                agent.agent_type
            )));
        }
        Ok(())
    }
}

async fn run_node_command(config: SchedulerConfig, args: RunArgs) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&args.failure_rate) {
        anyhow::bail!("--failure-rate must be within [0, 1]");
    }
    if args.metrics {
        init_metrics().context("failed to register metrics")?;
    }

    let mut config = config;
    if let Some(max) = args.max_concurrent {
        config = config.with_max_concurrent_agents(max);
    }

    let intervals = StaticIntervalProvider::new(Interval::new(
        Duration::from_secs(args.interval_secs),
        Duration::from_secs(args.timeout_secs),
    ));
    let sharding: Arc<dyn ShardingFilter> = match &args.shard_pattern {
        Some(pattern) => Arc::new(
            PatternShardingFilter::new(pattern)
                .with_context(|| format!("invalid shard pattern: {}", pattern))?,
        ),
        None => Arc::new(AllShards),
    };

    let scheduler = PriorityScheduler::connect(
        config,
        Arc::new(intervals),
        sharding,
        Arc::new(AlwaysEnabled),
    )
    .await?;
    scheduler.initialize().await?;

    let execution = Arc::new(SyntheticExecution {
        min_work_ms: args.min_work_ms,
        max_work_ms: args.max_work_ms,
        failure_rate: args.failure_rate,
    });
    let mut registered = 0;
    for i in 0..args.agents {
        let agent = Agent::new(format!("{}/Agent-{}", args.provider, i), &args.provider);
        if scheduler
            .schedule(agent, execution.clone(), Arc::new(LoggingInstrumentation))
            .await
        {
            registered += 1;
        }
    }
    info!(registered = registered, requested = args.agents, "Registered synthetic agents");

    scheduler.start()?;

    match args.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
        }
    }

    scheduler.shutdown().await?;
    println!("{}", serde_json::to_string_pretty(&scheduler.stats())?);
    if args.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

// ============================================================================
// Status Command Implementation
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct SetEntry {
    agent_type: String,
    score: i64,
    /// Score minus Redis time; negative means overdue.
    due_in_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
struct SetStatus {
    key: String,
    size: usize,
    head: Vec<SetEntry>,
}

#[derive(Debug, Clone, Serialize)]
struct StatusOutput {
    redis_time: i64,
    waiting: SetStatus,
    working: SetStatus,
    leader: Option<String>,
}

async fn read_set(
    conn: &mut ConnectionManager,
    key: &str,
    head: usize,
    now: i64,
) -> anyhow::Result<SetStatus> {
    let size: usize = redis::cmd("ZCARD").arg(key).query_async(conn).await?;
    let entries: Vec<(String, f64)> = if head == 0 {
        Vec::new()
    } else {
        redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(head - 1)
            .arg("WITHSCORES")
            .query_async(conn)
            .await?
    };
    Ok(SetStatus {
        key: key.to_string(),
        size,
        head: entries
            .into_iter()
            .map(|(agent_type, score)| SetEntry {
                agent_type,
                score: score as i64,
                due_in_seconds: score as i64 - now,
            })
            .collect(),
    })
}

async fn collect_status(
    conn: &mut ConnectionManager,
    keys: &SchedulerKeys,
    head: usize,
) -> anyhow::Result<StatusOutput> {
    let (redis_time, _): (i64, i64) = redis::cmd("TIME").query_async(conn).await?;
    let waiting = read_set(conn, &keys.waiting, head, redis_time).await?;
    let working = read_set(conn, &keys.working, head, redis_time).await?;
    let leader: Option<String> = redis::cmd("GET").arg(&keys.leader).query_async(conn).await?;
    Ok(StatusOutput {
        redis_time,
        waiting,
        working,
        leader,
    })
}

fn print_set(name: &str, set: &SetStatus) {
    println!("{} ({}): {} entries", name, set.key, set.size);
    for entry in &set.head {
        println!(
            "  {:<40} score={} due_in={}s",
            entry.agent_type, entry.score, entry.due_in_seconds
        );
    }
}

async fn run_status_command(config: SchedulerConfig, args: StatusArgs) -> anyhow::Result<()> {
    let mut conn = connect(&config).await?;
    let status = collect_status(&mut conn, &config.keys.resolved(), args.head).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    print_set("waiting", &status.waiting);
    print_set("working", &status.working);
    match &status.leader {
        Some(owner) => println!("cleanup leader: {}", owner),
        None => println!("cleanup leader: none"),
    }
    Ok(())
}

// ============================================================================
// Scripts Command Implementation
// ============================================================================

async fn run_scripts_command(config: SchedulerConfig) -> anyhow::Result<()> {
    let conn = connect(&config).await?;
    let scripts = ScriptManager::new(conn, config.keys.resolved());
    scripts
        .initialize()
        .await
        .context("failed to load scheduler scripts")?;

    for (name, sha) in scripts.handles() {
        println!("{:<28} {}", name, sha);
    }
    Ok(())
}
