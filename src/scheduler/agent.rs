//! Agents and the collaborator traits the scheduler consumes.
//!
//! The scheduler never knows what an agent does. It needs an execution
//! callback, optional instrumentation, a per-agent interval, a shard filter
//! and a node-eligibility signal; all of them are traits here with small
//! bundled implementations.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::ExecutionError;

use super::config::compile_full_match;

/// A recurring unit of work, identified fleet-wide by its type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Agent {
    /// Unique name; the member stored in the Redis sets.
    pub agent_type: String,
    /// Provider that owns the agent, used for logging.
    pub provider_name: String,
}

impl Agent {
    pub fn new(agent_type: impl Into<String>, provider_name: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            provider_name: provider_name.into(),
        }
    }
}

/// Cadence and limits of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// Desired gap between successive run starts.
    pub interval: Duration,
    /// Maximum execution time before the run counts as a zombie.
    pub timeout: Duration,
    /// Delay before the next run after a failure.
    pub error_interval: Duration,
}

impl Interval {
    /// Creates an interval whose error interval equals the cadence.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            error_interval: interval,
        }
    }

    pub fn with_error_interval(mut self, error_interval: Duration) -> Self {
        self.error_interval = error_interval;
        self
    }
}

/// The work performed when an agent is acquired.
#[async_trait]
pub trait AgentExecution: Send + Sync {
    async fn execute(&self, agent: &Agent) -> Result<(), ExecutionError>;
}

/// Side-effect-only hooks around an execution. Panics are contained by the
/// scheduler.
pub trait ExecutionInstrumentation: Send + Sync {
    fn execution_started(&self, _agent: &Agent) {}

    fn execution_completed(&self, _agent: &Agent, _elapsed: Duration) {}

    fn execution_failed(&self, _agent: &Agent, _error: &ExecutionError, _elapsed: Duration) {}
}

/// Supplies the interval of an agent. Consulted on every reschedule and
/// recovery, so a changed value takes effect on the next run.
pub trait IntervalProvider: Send + Sync {
    fn interval(&self, agent: &Agent) -> Interval;
}

/// Decides whether this node owns an agent type.
pub trait ShardingFilter: Send + Sync {
    fn owns(&self, agent_type: &str) -> bool;
}

/// Whether this node should schedule anything at all right now.
pub trait NodeStatusProvider: Send + Sync {
    fn is_node_enabled(&self) -> bool;
}

/// Fixed default interval with optional per-type overrides.
#[derive(Debug, Clone)]
pub struct StaticIntervalProvider {
    default: Interval,
    overrides: HashMap<String, Interval>,
}

impl StaticIntervalProvider {
    pub fn new(default: Interval) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, agent_type: impl Into<String>, interval: Interval) -> Self {
        self.overrides.insert(agent_type.into(), interval);
        self
    }
}

impl IntervalProvider for StaticIntervalProvider {
    fn interval(&self, agent: &Agent) -> Interval {
        self.overrides
            .get(&agent.agent_type)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Owns every agent type.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllShards;

impl ShardingFilter for AllShards {
    fn owns(&self, _agent_type: &str) -> bool {
        true
    }
}

/// Owns agent types fully matching a pattern.
#[derive(Debug, Clone)]
pub struct PatternShardingFilter {
    pattern: Regex,
}

impl PatternShardingFilter {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: compile_full_match(pattern)?,
        })
    }
}

impl ShardingFilter for PatternShardingFilter {
    fn owns(&self, agent_type: &str) -> bool {
        self.pattern.is_match(agent_type)
    }
}

/// Node is always eligible.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEnabled;

impl NodeStatusProvider for AlwaysEnabled {
    fn is_node_enabled(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInstrumentation;

impl ExecutionInstrumentation for NoopInstrumentation {}

/// Logs execution lifecycle events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInstrumentation;

impl ExecutionInstrumentation for LoggingInstrumentation {
    fn execution_started(&self, agent: &Agent) {
        debug!(
            agent_type = %agent.agent_type,
            provider = %agent.provider_name,
            "Agent execution started"
        );
    }

    fn execution_completed(&self, agent: &Agent, elapsed: Duration) {
        debug!(
            agent_type = %agent.agent_type,
            elapsed_ms = elapsed.as_millis() as u64,
            "Agent execution completed"
        );
    }

    fn execution_failed(&self, agent: &Agent, error: &ExecutionError, elapsed: Duration) {
        warn!(
            agent_type = %agent.agent_type,
            provider = %agent.provider_name,
            elapsed_ms = elapsed.as_millis() as u64,
            error = %error,
            "Agent execution failed"
        );
    }
}
