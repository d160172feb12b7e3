//! Named Lua scripts executed via `EVALSHA`.
//!
//! Every multi-key state transition of the scheduler is one of the scripts
//! below, so each transition is atomic on the Redis side. Scripts are loaded
//! once with `SCRIPT LOAD`; when Redis forgets them (failover, restart,
//! `SCRIPT FLUSH`) the first caller to see `NOSCRIPT` reloads the whole set
//! and retries once. Any other failure is returned so the caller can fall back
//! to plain commands.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use redis::aio::ConnectionManager;
use redis::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ScriptError;
use crate::metrics::SchedulerMetrics;

use super::config::SchedulerKeys;

/// Identifier of a scheduler script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptName {
    AddAgent,
    AddAgents,
    RemoveAgent,
    RescheduleAgent,
    MoveAgents,
    MoveAgentsConditional,
    RemoveAgentsConditional,
    AcquireAgents,
    ScoreAgents,
    ReleaseLeadership,
}

impl ScriptName {
    pub const ALL: [ScriptName; 10] = [
        ScriptName::AddAgent,
        ScriptName::AddAgents,
        ScriptName::RemoveAgent,
        ScriptName::RescheduleAgent,
        ScriptName::MoveAgents,
        ScriptName::MoveAgentsConditional,
        ScriptName::RemoveAgentsConditional,
        ScriptName::AcquireAgents,
        ScriptName::ScoreAgents,
        ScriptName::ReleaseLeadership,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptName::AddAgent => "add_agent",
            ScriptName::AddAgents => "add_agents",
            ScriptName::RemoveAgent => "remove_agent",
            ScriptName::RescheduleAgent => "reschedule_agent",
            ScriptName::MoveAgents => "move_agents",
            ScriptName::MoveAgentsConditional => "move_agents_conditional",
            ScriptName::RemoveAgentsConditional => "remove_agents_conditional",
            ScriptName::AcquireAgents => "acquire_agents",
            ScriptName::ScoreAgents => "score_agents",
            ScriptName::ReleaseLeadership => "release_leadership",
        }
    }

    /// Lua body. Unless noted, KEYS[1] is the working set and KEYS[2] the
    /// waiting set.
    pub fn body(&self) -> &'static str {
        match self {
            // ARGV: agent, score. Adds only when absent from both sets.
            ScriptName::AddAgent => {
                r#"
local exists = redis.call('zscore', KEYS[1], ARGV[1]) or redis.call('zscore', KEYS[2], ARGV[1])
if exists then
  return 0
end
redis.call('zadd', KEYS[2], ARGV[2], ARGV[1])
return 1
"#
            }
            // ARGV: agent1, score1, agent2, score2, ...
            ScriptName::AddAgents => {
                r#"
local added = {}
local count = 0
for i = 1, #ARGV, 2 do
  local agent = ARGV[i]
  local score = ARGV[i + 1]
  if tonumber(score) ~= nil and tonumber(agent) == nil then
    local exists = redis.call('zscore', KEYS[1], agent) or redis.call('zscore', KEYS[2], agent)
    if not exists then
      redis.call('zadd', KEYS[2], score, agent)
      table.insert(added, agent)
      count = count + 1
    end
  end
end
return {count, added}
"#
            }
            // ARGV: agent
            ScriptName::RemoveAgent => {
                r#"
local removed = redis.call('zrem', KEYS[1], ARGV[1]) + redis.call('zrem', KEYS[2], ARGV[1])
if removed > 0 then
  return 1
end
return 0
"#
            }
            // ARGV: agent, score
            ScriptName::RescheduleAgent => {
                r#"
if redis.call('zscore', KEYS[2], ARGV[1]) then
  return 'exists'
end
if redis.call('zscore', KEYS[1], ARGV[1]) then
  redis.call('zrem', KEYS[1], ARGV[1])
  redis.call('zadd', KEYS[2], ARGV[2], ARGV[1])
  return 'moved'
end
redis.call('zadd', KEYS[2], ARGV[2], ARGV[1])
return 'added'
"#
            }
            // ARGV: agent, deadline, now. Moves only a ready waiting entry.
            ScriptName::MoveAgents => {
                r#"
local score = redis.call('zscore', KEYS[2], ARGV[1])
if score and tonumber(score) <= tonumber(ARGV[3]) then
  redis.call('zrem', KEYS[2], ARGV[1])
  redis.call('zadd', KEYS[1], ARGV[2], ARGV[1])
  return ARGV[2]
end
return false
"#
            }
            // ARGV: agent, expected working score, new waiting score
            ScriptName::MoveAgentsConditional => {
                r#"
local score = redis.call('zscore', KEYS[1], ARGV[1])
if score and tonumber(score) == tonumber(ARGV[2]) then
  redis.call('zrem', KEYS[1], ARGV[1])
  redis.call('zadd', KEYS[2], ARGV[3], ARGV[1])
  return 'swapped'
end
return false
"#
            }
            // KEYS[1]: any set. ARGV: agent1, expected1, agent2, expected2, ...
            ScriptName::RemoveAgentsConditional => {
                r#"
local removed = {}
local count = 0
for i = 1, #ARGV, 2 do
  local agent = ARGV[i]
  local actual = redis.call('zscore', KEYS[1], agent)
  if actual and tonumber(actual) == tonumber(ARGV[i + 1]) then
    redis.call('zrem', KEYS[1], agent)
    table.insert(removed, agent)
    count = count + 1
  end
end
return {count, removed}
"#
            }
            // ARGV: now, limit, agent1, deadline1, agent2, deadline2, ...
            ScriptName::AcquireAgents => {
                r#"
local now = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local acquired = {}
local count = 0
for i = 3, #ARGV, 2 do
  if count >= limit then
    break
  end
  local agent = ARGV[i]
  local deadline = ARGV[i + 1]
  if tonumber(deadline) ~= nil then
    local score = redis.call('zscore', KEYS[2], agent)
    if score and tonumber(score) <= now then
      redis.call('zrem', KEYS[2], agent)
      redis.call('zadd', KEYS[1], deadline, agent)
      table.insert(acquired, agent)
      count = count + 1
    end
  end
end
return {count, acquired}
"#
            }
            // ARGV: agents. Returns agent, working score, waiting score per agent.
            ScriptName::ScoreAgents => {
                r#"
local results = {}
for i = 1, #ARGV do
  local agent = ARGV[i]
  table.insert(results, agent)
  table.insert(results, redis.call('zscore', KEYS[1], agent) or false)
  table.insert(results, redis.call('zscore', KEYS[2], agent) or false)
end
return results
"#
            }
            // KEYS[1]: leader key. ARGV: owner id.
            ScriptName::ReleaseLeadership => {
                r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('del', KEYS[1])
end
return 0
"#
            }
        }
    }
}

impl fmt::Display for ScriptName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptName {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScriptName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| ScriptError::InvalidArgument(format!("unknown script: {}", s)))
    }
}

/// Outcome of `reschedule_agent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleOutcome {
    /// Already waiting; nothing changed.
    Exists,
    /// Moved from working to waiting.
    Moved,
    /// Was in neither set and has been added to waiting.
    Added,
}

/// Scores of one agent in both sets, as returned by `score_agents`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentScores {
    pub agent_type: String,
    pub working: Option<i64>,
    pub waiting: Option<i64>,
}

impl AgentScores {
    pub fn is_present(&self) -> bool {
        self.working.is_some() || self.waiting.is_some()
    }
}

/// Loads the scheduler scripts and evaluates them with self-heal.
pub struct ScriptManager {
    redis: ConnectionManager,
    keys: SchedulerKeys,
    shas: RwLock<HashMap<ScriptName, String>>,
    initialized: AtomicBool,
    generation: AtomicU64,
    reload_lock: Mutex<()>,
    metrics: SchedulerMetrics,
}

impl ScriptManager {
    pub fn new(redis: ConnectionManager, keys: SchedulerKeys) -> Self {
        Self {
            redis,
            keys,
            shas: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            reload_lock: Mutex::new(()),
            metrics: SchedulerMetrics::new(),
        }
    }

    /// Resolved keys the scripts operate on.
    pub fn keys(&self) -> &SchedulerKeys {
        &self.keys
    }

    /// Loads every script. Idempotent; concurrent callers load once.
    pub async fn initialize(&self) -> Result<(), ScriptError> {
        if self.is_initialized() {
            return Ok(());
        }

        let _guard = self.reload_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        self.load_all().await?;
        self.initialized.store(true, Ordering::SeqCst);
        info!(
            scripts = self.script_count(),
            "Loaded scheduler Lua scripts"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn script_count(&self) -> usize {
        self.read_shas().len()
    }

    /// Resolves a script name to its loaded SHA1.
    pub fn get_handle(&self, name: &str) -> Result<String, ScriptError> {
        if name.trim().is_empty() {
            return Err(ScriptError::InvalidArgument(
                "script name cannot be empty".to_string(),
            ));
        }
        if !self.is_initialized() {
            return Err(ScriptError::NotInitialized);
        }
        let name: ScriptName = name.parse()?;
        self.sha(name)
    }

    /// Loaded scripts and their hashes, in declaration order.
    pub fn handles(&self) -> Vec<(ScriptName, String)> {
        let shas = self.read_shas();
        ScriptName::ALL
            .iter()
            .filter_map(|name| shas.get(name).map(|sha| (*name, sha.clone())))
            .collect()
    }

    fn sha(&self, name: ScriptName) -> Result<String, ScriptError> {
        if !self.is_initialized() {
            return Err(ScriptError::NotInitialized);
        }
        self.read_shas()
            .get(&name)
            .cloned()
            .ok_or_else(|| ScriptError::InvalidArgument(format!("unknown script: {}", name)))
    }

    fn read_shas(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ScriptName, String>> {
        self.shas.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Overrides a cached hash so the next evaluation misses the script cache.
    #[doc(hidden)]
    pub fn replace_sha(&self, name: ScriptName, sha: impl Into<String>) {
        self.shas
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, sha.into());
    }

    async fn load_all(&self) -> Result<(), ScriptError> {
        let mut conn = self.redis.clone();
        let mut loaded = HashMap::with_capacity(ScriptName::ALL.len());
        for name in ScriptName::ALL {
            let sha: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(name.body())
                .query_async(&mut conn)
                .await
                .map_err(|source| ScriptError::LoadFailed {
                    name: name.as_str(),
                    source,
                })?;
            loaded.insert(name, sha);
        }

        *self.shas.write().unwrap_or_else(|e| e.into_inner()) = loaded;
        self.generation.fetch_add(1, Ordering::SeqCst);
        debug!("Loaded Redis Lua scripts");
        Ok(())
    }

    async fn reload_if_stale(&self, observed: u64, name: ScriptName) -> Result<(), ScriptError> {
        let _guard = self.reload_lock.lock().await;
        if self.generation.load(Ordering::SeqCst) != observed {
            debug!(script = %name, "Skipping script reload, already reloaded");
            return Ok(());
        }

        warn!(
            script = %name,
            "Reloading Redis scripts after NOSCRIPT (failover, restart or SCRIPT FLUSH)"
        );
        self.load_all().await?;
        self.metrics.inc_script_reload();
        Ok(())
    }

    async fn evalsha(
        &self,
        name: ScriptName,
        keys: &[&str],
        args: &[String],
    ) -> Result<Value, ScriptError> {
        let sha = self.sha(name)?;
        let mut conn = self.redis.clone();
        let start = Instant::now();
        let value = redis::cmd("EVALSHA")
            .arg(sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async::<_, Value>(&mut conn)
            .await?;
        self.metrics.record_script_eval(name.as_str(), start.elapsed());
        Ok(value)
    }

    /// Evaluates a script, reloading all scripts once on `NOSCRIPT`.
    pub async fn eval_with_self_heal(
        &self,
        name: ScriptName,
        keys: &[&str],
        args: &[String],
    ) -> Result<Value, ScriptError> {
        let observed = self.generation.load(Ordering::SeqCst);
        match self.evalsha(name, keys, args).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_missing_script() => {
                self.reload_if_stale(observed, name).await?;
                self.evalsha(name, keys, args).await.inspect_err(|e| {
                    self.metrics.inc_script_error(name.as_str(), "retry_failed");
                    warn!(script = %name, error = %e, "Script retry after reload failed");
                })
            }
            Err(e) => {
                self.metrics.inc_script_error(name.as_str(), error_reason(&e));
                Err(e)
            }
        }
    }

    fn set_keys(&self) -> [&str; 2] {
        [self.keys.working.as_str(), self.keys.waiting.as_str()]
    }

    /// Adds `agent_type` to waiting with `score` unless it is in either set.
    pub async fn add_agent(&self, agent_type: &str, score: i64) -> Result<bool, ScriptError> {
        let value = self
            .eval_with_self_heal(
                ScriptName::AddAgent,
                &self.set_keys(),
                &[agent_type.to_string(), score.to_string()],
            )
            .await?;
        parse_flag(ScriptName::AddAgent, &value)
    }

    /// Adds every absent pair to waiting; returns the added agents.
    pub async fn add_agents(&self, pairs: &[(String, i64)]) -> Result<Vec<String>, ScriptError> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let value = self
            .eval_with_self_heal(ScriptName::AddAgents, &self.set_keys(), &pair_args(pairs))
            .await?;
        parse_members(ScriptName::AddAgents, &value)
    }

    /// Removes `agent_type` from both sets.
    pub async fn remove_agent(&self, agent_type: &str) -> Result<bool, ScriptError> {
        let value = self
            .eval_with_self_heal(
                ScriptName::RemoveAgent,
                &self.set_keys(),
                &[agent_type.to_string()],
            )
            .await?;
        parse_flag(ScriptName::RemoveAgent, &value)
    }

    /// Places `agent_type` in waiting with `score`, moving it out of working.
    pub async fn reschedule_agent(
        &self,
        agent_type: &str,
        score: i64,
    ) -> Result<RescheduleOutcome, ScriptError> {
        let value = self
            .eval_with_self_heal(
                ScriptName::RescheduleAgent,
                &self.set_keys(),
                &[agent_type.to_string(), score.to_string()],
            )
            .await?;
        parse_reschedule(&value)
    }

    /// Acquires one ready agent; returns the deadline written on success.
    pub async fn move_agent(
        &self,
        agent_type: &str,
        deadline: i64,
        now: i64,
    ) -> Result<Option<i64>, ScriptError> {
        let value = self
            .eval_with_self_heal(
                ScriptName::MoveAgents,
                &self.set_keys(),
                &[agent_type.to_string(), deadline.to_string(), now.to_string()],
            )
            .await?;
        Ok(value_to_string(&value).and_then(|s| parse_score(&s)))
    }

    /// Moves `agent_type` from working to waiting only if its working score
    /// still equals `expected`. Pass a score read from Redis verbatim so
    /// fractional scores compare equal.
    pub async fn move_agent_conditional(
        &self,
        agent_type: &str,
        expected: impl Display,
        new_score: i64,
    ) -> Result<bool, ScriptError> {
        let value = self
            .eval_with_self_heal(
                ScriptName::MoveAgentsConditional,
                &self.set_keys(),
                &[
                    agent_type.to_string(),
                    expected.to_string(),
                    new_score.to_string(),
                ],
            )
            .await?;
        Ok(value_to_string(&value).is_some_and(|s| s == "swapped"))
    }

    /// Removes each pair from `set` whose score still matches; returns the
    /// removed agents.
    pub async fn remove_conditional<S: Display>(
        &self,
        set: &str,
        pairs: &[(String, S)],
    ) -> Result<Vec<String>, ScriptError> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let value = self
            .eval_with_self_heal(ScriptName::RemoveAgentsConditional, &[set], &pair_args(pairs))
            .await?;
        parse_members(ScriptName::RemoveAgentsConditional, &value)
    }

    /// Acquires up to `limit` ready agents from `(agent, deadline)` pairs.
    pub async fn acquire_agents(
        &self,
        now: i64,
        limit: usize,
        pairs: &[(String, i64)],
    ) -> Result<Vec<String>, ScriptError> {
        if pairs.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let mut args = Vec::with_capacity(2 + pairs.len() * 2);
        args.push(now.to_string());
        args.push(limit.to_string());
        args.extend(pair_args(pairs));
        let value = self
            .eval_with_self_heal(ScriptName::AcquireAgents, &self.set_keys(), &args)
            .await?;
        parse_members(ScriptName::AcquireAgents, &value)
    }

    /// Looks up the scores of each agent in both sets.
    pub async fn score_agents(&self, agents: &[String]) -> Result<Vec<AgentScores>, ScriptError> {
        if agents.is_empty() {
            return Ok(Vec::new());
        }
        let value = self
            .eval_with_self_heal(ScriptName::ScoreAgents, &self.set_keys(), agents)
            .await?;
        parse_score_triples(&value)
    }

    /// Deletes the leadership key when it still holds `owner`.
    pub async fn release_leadership(&self, owner: &str) -> Result<bool, ScriptError> {
        let value = self
            .eval_with_self_heal(
                ScriptName::ReleaseLeadership,
                &[self.keys.leader.as_str()],
                &[owner.to_string()],
            )
            .await?;
        parse_flag(ScriptName::ReleaseLeadership, &value)
    }
}

fn error_reason(e: &ScriptError) -> &'static str {
    if e.is_connection_error() {
        "connection"
    } else {
        match e {
            ScriptError::NotInitialized => "not_initialized",
            ScriptError::InvalidArgument(_) => "invalid_argument",
            ScriptError::LoadFailed { .. } => "load_failed",
            ScriptError::Redis(_) => "redis",
            ScriptError::UnexpectedResult { .. } => "unexpected_result",
        }
    }
}

fn pair_args<S: Display>(pairs: &[(String, S)]) -> Vec<String> {
    pairs
        .iter()
        .flat_map(|(agent, score)| [agent.clone(), score.to_string()])
        .collect()
}

/// Parses a ZSET score, truncating fractional seconds.
pub fn parse_score(raw: &str) -> Option<i64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(|f| f as i64)
}

pub(crate) fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::Status(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Okay => Some("OK".to_string()),
        Value::Nil | Value::Bulk(_) => None,
    }
}

fn parse_flag(name: ScriptName, value: &Value) -> Result<bool, ScriptError> {
    match value {
        Value::Int(i) => Ok(*i > 0),
        Value::Nil => Ok(false),
        other => Err(ScriptError::UnexpectedResult {
            name: name.as_str(),
            detail: format!("expected integer, got {:?}", other),
        }),
    }
}

/// Parses the `{count, members}` shape of the batch scripts.
fn parse_members(name: ScriptName, value: &Value) -> Result<Vec<String>, ScriptError> {
    let unexpected = |detail: String| ScriptError::UnexpectedResult {
        name: name.as_str(),
        detail,
    };

    let Value::Bulk(items) = value else {
        return Err(unexpected(format!("expected array, got {:?}", value)));
    };

    let count = match items.first() {
        Some(Value::Int(count)) => *count,
        other => return Err(unexpected(format!("missing count, got {:?}", other))),
    };

    let members: Vec<String> = match items.get(1) {
        Some(Value::Bulk(members)) => members.iter().filter_map(value_to_string).collect(),
        Some(Value::Nil) | None => Vec::new(),
        Some(other) => return Err(unexpected(format!("expected member list, got {:?}", other))),
    };

    if members.len() as i64 != count {
        warn!(
            script = %name,
            count = count,
            members = members.len(),
            "Script count does not match returned members"
        );
    }
    Ok(members)
}

fn parse_reschedule(value: &Value) -> Result<RescheduleOutcome, ScriptError> {
    match value_to_string(value).as_deref() {
        Some("exists") => Ok(RescheduleOutcome::Exists),
        Some("moved") => Ok(RescheduleOutcome::Moved),
        Some("added") => Ok(RescheduleOutcome::Added),
        _ => Err(ScriptError::UnexpectedResult {
            name: ScriptName::RescheduleAgent.as_str(),
            detail: format!("{:?}", value),
        }),
    }
}

fn parse_score_triples(value: &Value) -> Result<Vec<AgentScores>, ScriptError> {
    let Value::Bulk(items) = value else {
        return Err(ScriptError::UnexpectedResult {
            name: ScriptName::ScoreAgents.as_str(),
            detail: format!("expected array, got {:?}", value),
        });
    };
    if items.len() % 3 != 0 {
        return Err(ScriptError::UnexpectedResult {
            name: ScriptName::ScoreAgents.as_str(),
            detail: format!("expected triples, got {} items", items.len()),
        });
    }

    let score = |v: &Value| value_to_string(v).and_then(|s| parse_score(&s));
    Ok(items
        .chunks(3)
        .filter_map(|chunk| {
            let agent_type = value_to_string(&chunk[0])?;
            Some(AgentScores {
                agent_type,
                working: score(&chunk[1]),
                waiting: score(&chunk[2]),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn test_script_name_parsing() {
        for name in ScriptName::ALL {
            assert_eq!(name.as_str().parse::<ScriptName>().unwrap(), name);
        }
        let err = "addAgent".parse::<ScriptName>().unwrap_err();
        assert!(matches!(err, ScriptError::InvalidArgument(_)));
    }

    #[test]
    fn test_script_bodies_use_declared_keys() {
        for name in ScriptName::ALL {
            let body = name.body();
            assert!(body.contains("redis.call"), "{} has no redis call", name);
        }
        assert!(!ScriptName::ReleaseLeadership.body().contains("KEYS[2]"));
        assert!(!ScriptName::RemoveAgentsConditional.body().contains("KEYS[2]"));
    }

    #[test]
    fn test_pair_args_keep_scores_verbatim() {
        let pairs = vec![("aws/A".to_string(), "1700000000.5".to_string())];
        assert_eq!(pair_args(&pairs), vec!["aws/A", "1700000000.5"]);
        let pairs = vec![("aws/B".to_string(), 1_700_000_000i64)];
        assert_eq!(pair_args(&pairs), vec!["aws/B", "1700000000"]);
    }

    #[test]
    fn test_parse_score_truncates() {
        assert_eq!(parse_score("1700000000"), Some(1_700_000_000));
        assert_eq!(parse_score("1700000000.75"), Some(1_700_000_000));
        assert_eq!(parse_score("-3"), Some(-3));
        assert_eq!(parse_score("inf"), None);
        assert_eq!(parse_score("abc"), None);
    }

    #[test]
    fn test_parse_members() {
        let value = Value::Bulk(vec![
            Value::Int(2),
            Value::Bulk(vec![data("aws/A"), data("aws/B")]),
        ]);
        let members = parse_members(ScriptName::AcquireAgents, &value).unwrap();
        assert_eq!(members, vec!["aws/A".to_string(), "aws/B".to_string()]);

        // An empty Lua table comes back as an empty array
        let value = Value::Bulk(vec![Value::Int(0), Value::Bulk(vec![])]);
        assert!(parse_members(ScriptName::AddAgents, &value)
            .unwrap()
            .is_empty());

        let err = parse_members(ScriptName::AddAgents, &Value::Int(3)).unwrap_err();
        assert!(matches!(err, ScriptError::UnexpectedResult { .. }));
    }

    #[test]
    fn test_parse_reschedule() {
        assert_eq!(
            parse_reschedule(&data("moved")).unwrap(),
            RescheduleOutcome::Moved
        );
        assert_eq!(
            parse_reschedule(&Value::Status("exists".to_string())).unwrap(),
            RescheduleOutcome::Exists
        );
        assert_eq!(
            parse_reschedule(&data("added")).unwrap(),
            RescheduleOutcome::Added
        );
        assert!(parse_reschedule(&Value::Nil).is_err());
    }

    #[test]
    fn test_parse_score_triples() {
        let value = Value::Bulk(vec![
            data("aws/A"),
            data("1700000100"),
            Value::Nil,
            data("aws/B"),
            Value::Nil,
            data("1700000050.5"),
            data("aws/C"),
            Value::Nil,
            Value::Nil,
        ]);
        let scores = parse_score_triples(&value).unwrap();
        assert_eq!(scores.len(), 3);
        assert_eq!(scores[0].working, Some(1_700_000_100));
        assert_eq!(scores[1].waiting, Some(1_700_000_050));
        assert!(!scores[2].is_present());

        let short = Value::Bulk(vec![data("aws/A"), Value::Nil]);
        assert!(parse_score_triples(&short).is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag(ScriptName::AddAgent, &Value::Int(1)).unwrap());
        assert!(!parse_flag(ScriptName::AddAgent, &Value::Int(0)).unwrap());
        assert!(parse_flag(ScriptName::AddAgent, &data("1")).is_err());
    }

    #[test]
    fn test_pair_args_interleaves() {
        let args = pair_args(&[("a".to_string(), 10), ("b".to_string(), 20)]);
        assert_eq!(args, vec!["a", "10", "b", "20"]);
    }
}
