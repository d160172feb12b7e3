//! Error types for priority-scheduler operations.
//!
//! Defines the error taxonomy for the major subsystems:
//! - Scheduler lifecycle and Redis connectivity
//! - Lua script loading and evaluation
//! - Agent execution failures reported by task bodies

use thiserror::Error;

use crate::scheduler::config::ConfigError;

/// Errors surfaced by the scheduler's public operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Scripts could not be loaded; nothing can run without them.
    #[error("Scheduler initialization failed: {message}")]
    Initialization {
        message: String,
        #[source]
        source: ScriptError,
    },

    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,
}

/// Errors from the Lua script layer.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Scripts have not been initialized")]
    NotInitialized,

    #[error("Invalid script argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to load script '{name}': {source}")]
    LoadFailed {
        name: &'static str,
        #[source]
        source: redis::RedisError,
    },

    #[error("Script evaluation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unexpected result from script '{name}': {detail}")]
    UnexpectedResult { name: &'static str, detail: String },
}

impl ScriptError {
    /// True when Redis reported that the script body is not cached.
    pub fn is_missing_script(&self) -> bool {
        matches!(self, ScriptError::Redis(e) if e.kind() == redis::ErrorKind::NoScriptError)
    }

    /// True when the failure came from the connection rather than the script.
    pub fn is_connection_error(&self) -> bool {
        match self {
            ScriptError::Redis(e) | ScriptError::LoadFailed { source: e, .. } => {
                e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
                    || e.is_io_error()
            }
            _ => false,
        }
    }
}

/// Failure reported by an agent execution.
///
/// The variant drives failure classification and therefore the backoff
/// applied before the agent runs again.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("I/O failure: {0}")]
    Io(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Execution panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

impl ExecutionError {
    pub fn other(message: impl Into<String>) -> Self {
        ExecutionError::Other(message.into())
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        ExecutionError::Http {
            status,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ExecutionError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            ExecutionError::Timeout(e.to_string())
        } else {
            ExecutionError::Io(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_error_display() {
        let err = SchedulerError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = SchedulerError::InvalidArgument("script name".to_string());
        assert!(err.to_string().contains("script name"));

        let err = SchedulerError::Initialization {
            message: "scripts".to_string(),
            source: ScriptError::NotInitialized,
        };
        assert!(err.to_string().contains("initialization failed"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_missing_script_detection() {
        let err = ScriptError::Redis(redis::RedisError::from((
            redis::ErrorKind::NoScriptError,
            "NOSCRIPT",
        )));
        assert!(err.is_missing_script());
        assert!(!err.is_connection_error());

        let err = ScriptError::Redis(redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "ERR wrong number of arguments",
        )));
        assert!(!err.is_missing_script());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: ExecutionError =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline").into();
        assert!(matches!(err, ExecutionError::Timeout(_)));

        let err: ExecutionError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(err, ExecutionError::Io(_)));
    }

    #[test]
    fn test_execution_error_display() {
        let err = ExecutionError::http(429, "slow down");
        assert_eq!(err.to_string(), "HTTP 429: slow down");
        assert_eq!(ExecutionError::other("boom").to_string(), "boom");
    }
}
