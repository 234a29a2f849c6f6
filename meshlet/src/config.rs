//! Worker process configuration handed down from the parent orchestrator.
//!
//! Constructed exactly once at process entry (explicitly, or from the
//! environment the parent populates before spawning the worker) and
//! read-only thereafter. Components receive it by reference; nothing reads
//! ambient global state after construction.

use std::path::PathBuf;
use std::str::FromStr;

pub const ENV_SOCKET_PATH: &str = "MESHLET_SOCKET_PATH";
pub const ENV_WORKER_ID: &str = "MESHLET_WORKER_ID";
pub const ENV_PORT: &str = "MESHLET_PORT";
pub const ENV_LOG_LEVEL: &str = "MESHLET_LOG_LEVEL";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid port directive '{0}': expected a port number, 'auto', or 'false'")]
    InvalidPort(String),

    #[error("invalid log level '{0}'")]
    InvalidLogLevel(String),
}

/// Parent-supplied directive for the worker's own listen port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPlan {
    Fixed(u16),
    /// Bind an ephemeral port.
    Ephemeral,
    /// Explicit do-not-bind sentinel. The worker's requested port is left
    /// untouched, never overridden.
    DoNotBind,
}

impl PortPlan {
    pub fn parse(value: &str) -> Result<Self, ContextError> {
        match value {
            "false" => Ok(Self::DoNotBind),
            "true" | "auto" | "0" => Ok(Self::Ephemeral),
            other => other
                .parse::<u16>()
                .map(Self::Fixed)
                .map_err(|_| ContextError::InvalidPort(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggerOptions {
    pub level: tracing::Level,
    /// Worker identity stamped on every log record.
    pub name: Option<String>,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            level: tracing::Level::INFO,
            name: None,
        }
    }
}

/// Everything a worker needs to join its parent's control plane.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// The parent's control socket.
    pub socket_path: PathBuf,
    pub worker_id: String,
    pub port: PortPlan,
    pub logger: LoggerOptions,
}

impl WorkerContext {
    /// Reads the context from the environment the parent populated.
    pub fn from_env() -> Result<Self, ContextError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ContextError> {
        let socket_path = var(ENV_SOCKET_PATH)
            .ok_or(ContextError::MissingVar(ENV_SOCKET_PATH))?
            .into();

        let worker_id = var(ENV_WORKER_ID)
            .unwrap_or_else(|| format!("worker-{}", std::process::id()));

        let port = match var(ENV_PORT) {
            Some(value) => PortPlan::parse(&value)?,
            None => PortPlan::Ephemeral,
        };

        let level = match var(ENV_LOG_LEVEL) {
            Some(value) => tracing::Level::from_str(&value)
                .map_err(|_| ContextError::InvalidLogLevel(value))?,
            None => tracing::Level::INFO,
        };

        Ok(Self {
            socket_path,
            worker_id: worker_id.clone(),
            port,
            logger: LoggerOptions {
                level,
                name: Some(worker_id),
            },
        })
    }
}
