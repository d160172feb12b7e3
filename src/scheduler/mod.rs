//! Distributed priority scheduler on Redis.
//!
//! Every node of a fleet registers the same recurring agents. Two sorted sets
//! shared by the fleet decide which node runs what:
//!
//! - **waiting**: agent type scored by the epoch second it is next due
//! - **working**: agent type scored by the epoch second its run times out
//!
//! A node acquires a ready agent by atomically moving it from waiting to
//! working, executes it locally and moves it back with its next due time.
//!
//! # Architecture
//!
//! ```text
//!                 ┌─────────────────────┐
//!                 │  PriorityScheduler  │  tick loop
//!                 └──────────┬──────────┘
//!          ┌─────────────────┼──────────────────┐
//!          │                 │                  │
//!   ┌──────▼──────┐   ┌──────▼──────┐    ┌──────▼──────┐
//!   │ Acquisition │   │   Zombie    │    │   Orphan    │
//!   │   Service   │   │   Cleanup   │    │   Cleanup   │
//!   └──────┬──────┘   └──────┬──────┘    └──────┬──────┘
//!          │                 │                  │ leadership
//!          └─────────┬───────┴──────────────────┘
//!             ┌──────▼───────┐
//!             │ ScriptManager│  EVALSHA
//!             └──────┬───────┘
//!             ┌──────▼───────┐
//!             │    Redis     │  waiting / working / cleanup-leader
//!             └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use priority_scheduler::scheduler::{
//!     Agent, AllShards, AlwaysEnabled, Interval, LoggingInstrumentation,
//!     PriorityScheduler, SchedulerConfig, StaticIntervalProvider,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let intervals = StaticIntervalProvider::new(Interval::new(
//!     Duration::from_secs(60),
//!     Duration::from_secs(300),
//! ));
//! let scheduler = PriorityScheduler::connect(
//!     SchedulerConfig::from_env()?,
//!     Arc::new(intervals),
//!     Arc::new(AllShards),
//!     Arc::new(AlwaysEnabled),
//! )
//! .await?;
//!
//! scheduler.initialize().await?;
//! scheduler
//!     .schedule(Agent::new("aws/Instances", "aws"), execution, Arc::new(LoggingInstrumentation))
//!     .await;
//! scheduler.start()?;
//!
//! // Requeue held agents and wait for in-flight runs
//! scheduler.shutdown().await?;
//! ```
//!
//! # Reliability
//!
//! - **Atomic moves**: every transition between the sets is a Lua script
//! - **Zombie cleanup**: local runs past deadline are aborted and released
//! - **Orphan cleanup**: stale entries left by dead nodes are recovered by one leader
//! - **Graceful shutdown**: held agents are requeued before the process exits

pub mod acquisition;
pub mod agent;
pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod driver;
pub mod orphan;
pub mod scripts;
pub mod time;
pub mod zombie;

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use acquisition::{AcquisitionService, AcquisitionStats, ActiveAgents, Diagnostics};
pub use agent::{
    Agent, AgentExecution, AllShards, AlwaysEnabled, ExecutionInstrumentation, Interval,
    IntervalProvider, LoggingInstrumentation, NodeStatusProvider, NoopInstrumentation,
    PatternShardingFilter, ShardingFilter, StaticIntervalProvider,
};
pub use backoff::FailureClass;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::{ConfigError, SchedulerConfig, SchedulerKeys};
pub use driver::{HealthSummary, PriorityScheduler, SchedulerStats};
pub use orphan::{OrphanCleanupService, OrphanStats};
pub use scripts::{ScriptManager, ScriptName};
pub use time::TimeSource;
pub use zombie::ZombieCleanupService;

// Critical sections never await, so a poisoned lock still holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
