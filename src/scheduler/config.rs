//! Scheduler configuration.
//!
//! [`SchedulerConfig`] is an immutable snapshot handed to every service at
//! construction. It can be built from defaults, builder methods, or the
//! `PRIORITY_SCHEDULER_*` environment variables. Clearly invalid values are
//! rejected by [`SchedulerConfig::validate`]; out-of-range dimensional values
//! are clamped by [`SchedulerConfig::normalize`] so a misconfigured node keeps
//! scheduling.

use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::warn;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// A configured pattern is not a valid regular expression.
    #[error("Invalid pattern for {key}: {source}")]
    InvalidPattern {
        key: &'static str,
        #[source]
        source: regex::Error,
    },
}

/// Redis key names. The resolved key is `prefix + name`, followed by
/// `{hash_tag}` when a hash tag is configured so cluster deployments keep
/// both sets on one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConfig {
    pub waiting_set: String,
    pub working_set: String,
    pub cleanup_leader_key: String,
    pub prefix: String,
    pub hash_tag: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            waiting_set: "waiting".to_string(),
            working_set: "working".to_string(),
            cleanup_leader_key: "cleanup-leader".to_string(),
            prefix: String::new(),
            hash_tag: String::new(),
        }
    }
}

impl KeyConfig {
    fn resolve(&self, name: &str) -> String {
        if self.hash_tag.is_empty() {
            format!("{}{}", self.prefix, name)
        } else {
            format!("{}{}{{{}}}", self.prefix, name, self.hash_tag)
        }
    }

    /// Fully qualified key names.
    pub fn resolved(&self) -> SchedulerKeys {
        SchedulerKeys {
            waiting: self.resolve(&self.waiting_set),
            working: self.resolve(&self.working_set),
            leader: self.resolve(&self.cleanup_leader_key),
        }
    }
}

/// Resolved Redis keys shared by all services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerKeys {
    pub waiting: String,
    pub working: String,
    pub leader: String,
}

/// Batch acquisition and cleanup settings.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub enabled: bool,
    /// Rows per batched script call. Zero means "use the remaining permits".
    pub batch_size: usize,
    /// Scales the chunk reads per tick to look past filtered entries.
    /// Zero reads only the chunks needed to fill the free permits.
    pub chunk_attempt_multiplier: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 0,
            chunk_attempt_multiplier: 0,
        }
    }
}

/// Redis circuit breaker guarding the acquisition path.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
    pub half_open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            failure_window: Duration::from_secs(10),
            cooldown: Duration::from_secs(30),
            half_open_duration: Duration::from_secs(5),
        }
    }
}

/// Exponential backoff for throttled failures.
#[derive(Debug, Clone)]
pub struct ThrottledBackoffConfig {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl Default for ThrottledBackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            multiplier: 2.0,
            cap: Duration::from_secs(600),
        }
    }
}

/// Failure-class aware backoff. When disabled every failure waits the
/// agent's error interval.
#[derive(Debug, Clone)]
pub struct FailureBackoffConfig {
    pub enabled: bool,
    pub max_immediate_retries: u32,
    pub permanent_forbidden_backoff: Duration,
    pub throttled: ThrottledBackoffConfig,
}

impl Default for FailureBackoffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_immediate_retries: 0,
            permanent_forbidden_backoff: Duration::from_secs(30 * 60),
            throttled: ThrottledBackoffConfig::default(),
        }
    }
}

/// Randomization windows used to spread load.
#[derive(Debug, Clone)]
pub struct JitterConfig {
    /// Upper bound of the random delay added to a freshly registered agent.
    pub initial_registration_seconds: u64,
    /// Upper bound of the random delay for shutdown requeues without a deadline.
    pub shutdown_seconds: u64,
    /// Relative jitter applied to non-zero failure backoffs, in `[0, 1]`.
    pub failure_backoff_ratio: f64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            initial_registration_seconds: 0,
            shutdown_seconds: 0,
            failure_backoff_ratio: 0.1,
        }
    }
}

/// Zombie cleanup settings.
#[derive(Debug, Clone)]
pub struct ZombieCleanupConfig {
    pub enabled: bool,
    pub threshold: Duration,
    pub interval: Duration,
    /// Agent types matching this pattern use `exceptional_threshold`.
    pub exceptional_agents_pattern: String,
    pub exceptional_threshold: Duration,
    /// Zero disables the budget.
    pub run_budget: Duration,
}

impl Default for ZombieCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: Duration::from_secs(30),
            interval: Duration::from_secs(300),
            exceptional_agents_pattern: String::new(),
            exceptional_threshold: Duration::from_secs(3600),
            run_budget: Duration::ZERO,
        }
    }
}

/// Orphan cleanup settings.
#[derive(Debug, Clone)]
pub struct OrphanCleanupConfig {
    pub enabled: bool,
    pub threshold: Duration,
    pub interval: Duration,
    pub leadership_ttl: Duration,
    /// Every node scans, leadership is not taken.
    pub force_all_pods: bool,
    /// Zero disables the budget.
    pub run_budget: Duration,
    /// Remove waiting members that look like raw epoch timestamps.
    pub remove_numeric_only_agents: bool,
}

impl Default for OrphanCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: Duration::from_secs(600),
            interval: Duration::from_secs(300),
            leadership_ttl: Duration::from_secs(120),
            force_all_pods: false,
            run_budget: Duration::ZERO,
            remove_numeric_only_agents: true,
        }
    }
}

/// Complete scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Tick period of the driver loop.
    pub interval: Duration,
    /// How often the registry is re-written into Redis and known agents are reconciled.
    pub refresh_period: Duration,
    /// Minimum gap between health summaries. Zero disables them.
    pub health_summary_period: Duration,
    /// How long a Redis `TIME` offset stays valid.
    pub time_cache_duration: Duration,
    /// Permits of the node-wide concurrency semaphore.
    pub max_concurrent_agents: usize,
    /// Agent types must fully match this pattern to be scheduled.
    pub enabled_agent_pattern: String,
    /// Agent types fully matching this pattern are never scheduled.
    pub disabled_agent_pattern: Option<String>,
    /// Upper bound on waiting for in-flight executions during shutdown.
    pub shutdown_timeout: Duration,

    pub keys: KeyConfig,
    pub batch: BatchConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub failure_backoff: FailureBackoffConfig,
    pub jitter: JitterConfig,
    pub zombie: ZombieCleanupConfig,
    pub orphan: OrphanCleanupConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            interval: Duration::from_millis(1000),
            refresh_period: Duration::from_secs(30),
            health_summary_period: Duration::from_secs(600),
            time_cache_duration: Duration::from_secs(10),
            max_concurrent_agents: 100,
            enabled_agent_pattern: ".*".to_string(),
            disabled_agent_pattern: None,
            shutdown_timeout: Duration::from_secs(30),
            keys: KeyConfig::default(),
            batch: BatchConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            failure_backoff: FailureBackoffConfig::default(),
            jitter: JitterConfig::default(),
            zombie: ZombieCleanupConfig::default(),
            orphan: OrphanCleanupConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from `PRIORITY_SCHEDULER_*` environment variables,
    /// starting from defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |name: &str| {
            let key = format!("PRIORITY_SCHEDULER_{}", name);
            lookup(&key).map(|v| (key, v))
        };

        if let Some((_, val)) = var("REDIS_URL") {
            config.redis_url = val;
        }
        if let Some((key, val)) = var("INTERVAL_MS") {
            config.interval = parse_env_millis(&val, &key)?;
        }
        if let Some((key, val)) = var("REFRESH_PERIOD_SECONDS") {
            config.refresh_period = Duration::from_secs(parse_env_value(&val, &key)?);
        }
        if let Some((key, val)) = var("HEALTH_SUMMARY_PERIOD_SECONDS") {
            config.health_summary_period = Duration::from_secs(parse_env_value(&val, &key)?);
        }
        if let Some((key, val)) = var("TIME_CACHE_DURATION_MS") {
            config.time_cache_duration = parse_env_millis(&val, &key)?;
        }
        if let Some((key, val)) = var("MAX_CONCURRENT_AGENTS") {
            config.max_concurrent_agents = parse_env_value(&val, &key)?;
        }
        if let Some((_, val)) = var("ENABLED_AGENT_PATTERN") {
            config.enabled_agent_pattern = val;
        }
        if let Some((_, val)) = var("DISABLED_AGENT_PATTERN") {
            config.disabled_agent_pattern = if val.trim().is_empty() {
                None
            } else {
                Some(val)
            };
        }
        if let Some((key, val)) = var("SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout = parse_env_millis(&val, &key)?;
        }

        // Keys
        if let Some((_, val)) = var("KEYS_WAITING_SET") {
            config.keys.waiting_set = val;
        }
        if let Some((_, val)) = var("KEYS_WORKING_SET") {
            config.keys.working_set = val;
        }
        if let Some((_, val)) = var("KEYS_CLEANUP_LEADER_KEY") {
            config.keys.cleanup_leader_key = val;
        }
        if let Some((_, val)) = var("KEYS_PREFIX") {
            config.keys.prefix = val;
        }
        if let Some((_, val)) = var("KEYS_HASH_TAG") {
            config.keys.hash_tag = val;
        }

        // Batch operations
        if let Some((key, val)) = var("BATCH_ENABLED") {
            config.batch.enabled = parse_env_bool(&val, &key)?;
        }
        if let Some((key, val)) = var("BATCH_SIZE") {
            config.batch.batch_size = parse_env_count(&val, &key)?;
        }
        if let Some((key, val)) = var("BATCH_CHUNK_ATTEMPT_MULTIPLIER") {
            config.batch.chunk_attempt_multiplier = parse_env_count(&val, &key)?;
        }

        // Circuit breaker
        if let Some((key, val)) = var("CIRCUIT_BREAKER_ENABLED") {
            config.circuit_breaker.enabled = parse_env_bool(&val, &key)?;
        }
        if let Some((key, val)) = var("CIRCUIT_BREAKER_FAILURE_THRESHOLD") {
            config.circuit_breaker.failure_threshold = parse_env_value(&val, &key)?;
        }
        if let Some((key, val)) = var("CIRCUIT_BREAKER_COOLDOWN_MS") {
            config.circuit_breaker.cooldown = parse_env_millis(&val, &key)?;
        }

        // Failure backoff
        if let Some((key, val)) = var("FAILURE_BACKOFF_ENABLED") {
            config.failure_backoff.enabled = parse_env_bool(&val, &key)?;
        }
        if let Some((key, val)) = var("FAILURE_BACKOFF_MAX_IMMEDIATE_RETRIES") {
            config.failure_backoff.max_immediate_retries = parse_env_value(&val, &key)?;
        }
        if let Some((key, val)) = var("FAILURE_BACKOFF_PERMANENT_FORBIDDEN_MS") {
            config.failure_backoff.permanent_forbidden_backoff = parse_env_millis(&val, &key)?;
        }
        if let Some((key, val)) = var("FAILURE_BACKOFF_THROTTLED_BASE_MS") {
            config.failure_backoff.throttled.base = parse_env_millis(&val, &key)?;
        }
        if let Some((key, val)) = var("FAILURE_BACKOFF_THROTTLED_MULTIPLIER") {
            config.failure_backoff.throttled.multiplier = parse_env_value(&val, &key)?;
        }
        if let Some((key, val)) = var("FAILURE_BACKOFF_THROTTLED_CAP_MS") {
            config.failure_backoff.throttled.cap = parse_env_millis(&val, &key)?;
        }

        // Jitter
        if let Some((key, val)) = var("JITTER_INITIAL_REGISTRATION_SECONDS") {
            config.jitter.initial_registration_seconds = parse_env_value(&val, &key)?;
        }
        if let Some((key, val)) = var("JITTER_SHUTDOWN_SECONDS") {
            config.jitter.shutdown_seconds = parse_env_value(&val, &key)?;
        }
        if let Some((key, val)) = var("JITTER_FAILURE_BACKOFF_RATIO") {
            config.jitter.failure_backoff_ratio = parse_env_value(&val, &key)?;
        }

        // Zombie cleanup
        if let Some((key, val)) = var("ZOMBIE_ENABLED") {
            config.zombie.enabled = parse_env_bool(&val, &key)?;
        }
        if let Some((key, val)) = var("ZOMBIE_THRESHOLD_MS") {
            config.zombie.threshold = parse_env_millis(&val, &key)?;
        }
        if let Some((key, val)) = var("ZOMBIE_INTERVAL_MS") {
            config.zombie.interval = parse_env_millis(&val, &key)?;
        }
        if let Some((_, val)) = var("ZOMBIE_EXCEPTIONAL_AGENTS_PATTERN") {
            config.zombie.exceptional_agents_pattern = val;
        }
        if let Some((key, val)) = var("ZOMBIE_EXCEPTIONAL_THRESHOLD_MS") {
            config.zombie.exceptional_threshold = parse_env_millis(&val, &key)?;
        }
        if let Some((key, val)) = var("ZOMBIE_RUN_BUDGET_MS") {
            config.zombie.run_budget = parse_env_millis(&val, &key)?;
        }

        // Orphan cleanup
        if let Some((key, val)) = var("ORPHAN_ENABLED") {
            config.orphan.enabled = parse_env_bool(&val, &key)?;
        }
        if let Some((key, val)) = var("ORPHAN_THRESHOLD_MS") {
            config.orphan.threshold = parse_env_millis(&val, &key)?;
        }
        if let Some((key, val)) = var("ORPHAN_INTERVAL_MS") {
            config.orphan.interval = parse_env_millis(&val, &key)?;
        }
        if let Some((key, val)) = var("ORPHAN_LEADERSHIP_TTL_MS") {
            config.orphan.leadership_ttl = parse_env_millis(&val, &key)?;
        }
        if let Some((key, val)) = var("ORPHAN_FORCE_ALL_PODS") {
            config.orphan.force_all_pods = parse_env_bool(&val, &key)?;
        }
        if let Some((key, val)) = var("ORPHAN_RUN_BUDGET_MS") {
            config.orphan.run_budget = parse_env_millis(&val, &key)?;
        }
        if let Some((key, val)) = var("ORPHAN_REMOVE_NUMERIC_ONLY_AGENTS") {
            config.orphan.remove_numeric_only_agents = parse_env_bool(&val, &key)?;
        }

        Ok(config)
    }

    // Builder methods

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the repopulation / reconcile period.
    pub fn with_refresh_period(mut self, period: Duration) -> Self {
        self.refresh_period = period;
        self
    }

    /// Sets the node-wide concurrency limit.
    pub fn with_max_concurrent_agents(mut self, max: usize) -> Self {
        self.max_concurrent_agents = max;
        self
    }

    /// Sets the key prefix shared by all scheduler keys.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.keys.prefix = prefix.into();
        self
    }

    /// Enables or disables batched script calls.
    pub fn with_batch_operations(mut self, enabled: bool) -> Self {
        self.batch.enabled = enabled;
        self
    }

    /// Sets the batch size (zero means "remaining permits").
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch.batch_size = size;
        self
    }

    /// Sets the enabled-agent pattern.
    pub fn with_enabled_agent_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.enabled_agent_pattern = pattern.into();
        self
    }

    /// Sets the disabled-agent pattern.
    pub fn with_disabled_agent_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.disabled_agent_pattern = Some(pattern.into());
        self
    }

    /// Replaces the failure backoff section.
    pub fn with_failure_backoff(mut self, backoff: FailureBackoffConfig) -> Self {
        self.failure_backoff = backoff;
        self
    }

    /// Replaces the jitter section.
    pub fn with_jitter(mut self, jitter: JitterConfig) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replaces the zombie cleanup section.
    pub fn with_zombie_cleanup(mut self, zombie: ZombieCleanupConfig) -> Self {
        self.zombie = zombie;
        self
    }

    /// Replaces the orphan cleanup section.
    pub fn with_orphan_cleanup(mut self, orphan: OrphanCleanupConfig) -> Self {
        self.orphan = orphan;
        self
    }

    /// Sets the shutdown wait bound.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validates values that cannot be repaired.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` or `ConfigError::InvalidPattern`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "interval must be greater than 0".to_string(),
            ));
        }

        if self.refresh_period.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "refresh_period must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_agents == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_agents must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("keys.waiting_set", &self.keys.waiting_set),
            ("keys.working_set", &self.keys.working_set),
            ("keys.cleanup_leader_key", &self.keys.cleanup_leader_key),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must not be blank",
                    name
                )));
            }
        }

        let keys = self.keys.resolved();
        if keys.waiting == keys.working {
            return Err(ConfigError::ValidationFailed(
                "waiting and working sets must use different keys".to_string(),
            ));
        }

        self.compile_patterns()?;
        compile_optional_pattern(&self.zombie.exceptional_agents_pattern).map_err(|source| {
            ConfigError::InvalidPattern {
                key: "zombie.exceptional_agents_pattern",
                source,
            }
        })?;

        if self.orphan.enabled
            && !self.orphan.force_all_pods
            && self.orphan.leadership_ttl < self.orphan.run_budget + Duration::from_secs(60)
        {
            warn!(
                leadership_ttl_ms = self.orphan.leadership_ttl.as_millis() as u64,
                run_budget_ms = self.orphan.run_budget.as_millis() as u64,
                "Orphan leadership TTL is shorter than run budget + 60s; another node may start a pass while this one is still running"
            );
        }

        Ok(())
    }

    /// Clamps dimensional values into their valid ranges, logging each repair.
    pub fn normalize(mut self) -> Self {
        let ratio = self.jitter.failure_backoff_ratio;
        if !(0.0..=1.0).contains(&ratio) || ratio.is_nan() {
            let clamped = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
            warn!(
                configured = ratio,
                clamped = clamped,
                "jitter.failure_backoff_ratio out of range"
            );
            self.jitter.failure_backoff_ratio = clamped;
        }

        let multiplier = self.failure_backoff.throttled.multiplier;
        if !(multiplier >= 1.0) {
            warn!(
                configured = multiplier,
                "failure_backoff.throttled.multiplier below 1.0, using 1.0"
            );
            self.failure_backoff.throttled.multiplier = 1.0;
        }

        if self.failure_backoff.throttled.cap < self.failure_backoff.throttled.base {
            warn!("failure_backoff.throttled.cap below base, raising cap to base");
            self.failure_backoff.throttled.cap = self.failure_backoff.throttled.base;
        }

        if self.circuit_breaker.failure_threshold == 0 {
            warn!("circuit_breaker.failure_threshold is 0, using 1");
            self.circuit_breaker.failure_threshold = 1;
        }

        if self.max_concurrent_agents == 0 {
            warn!("max_concurrent_agents is 0, using 1");
            self.max_concurrent_agents = 1;
        }

        self
    }

    /// Compiles the enabled and disabled patterns.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidPattern` for the first pattern that fails.
    pub fn compile_patterns(&self) -> Result<AgentPatterns, ConfigError> {
        let enabled = compile_full_match(&self.enabled_agent_pattern).map_err(|source| {
            ConfigError::InvalidPattern {
                key: "enabled_agent_pattern",
                source,
            }
        })?;

        let disabled = match self.disabled_agent_pattern.as_deref() {
            Some(p) if !p.trim().is_empty() => Some(compile_full_match(p).map_err(|source| {
                ConfigError::InvalidPattern {
                    key: "disabled_agent_pattern",
                    source,
                }
            })?),
            _ => None,
        };

        Ok(AgentPatterns { enabled, disabled })
    }
}

/// Precompiled agent-type matchers.
#[derive(Debug, Clone)]
pub struct AgentPatterns {
    enabled: Regex,
    disabled: Option<Regex>,
}

impl Default for AgentPatterns {
    fn default() -> Self {
        Self {
            enabled: Regex::new(".*").unwrap_or_else(|_| unreachable!()),
            disabled: None,
        }
    }
}

impl AgentPatterns {
    /// True when the type matches the enabled pattern and not the disabled one.
    pub fn is_enabled(&self, agent_type: &str) -> bool {
        self.enabled.is_match(agent_type)
            && !self
                .disabled
                .as_ref()
                .is_some_and(|d| d.is_match(agent_type))
    }
}

/// Compiles `pattern` so that it must match the whole agent type.
pub fn compile_full_match(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

/// Compiles an optional full-match pattern; blank means none.
pub fn compile_optional_pattern(pattern: &str) -> Result<Option<Regex>, regex::Error> {
    if pattern.trim().is_empty() {
        Ok(None)
    } else {
        compile_full_match(pattern).map(Some)
    }
}

/// Parse an environment variable value into a typed value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse a millisecond count into a `Duration`.
fn parse_env_millis(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_millis)
}

/// Parse a count where negative values mean "use the default" (zero).
fn parse_env_count(value: &str, key: &str) -> Result<usize, ConfigError> {
    let raw: i64 = parse_env_value(value, key)?;
    if raw < 0 {
        warn!(key = key, value = raw, "negative value normalized to 0");
        return Ok(0);
    }
    Ok(raw as usize)
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
