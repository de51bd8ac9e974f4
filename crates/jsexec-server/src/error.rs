use jsexec_common::{ErrorCode, ScriptId};
use std::time::Duration;
use thiserror::Error;

fn at_line(line: &Option<u32>) -> String {
    line.map(|l| format!(" (line {})", l)).unwrap_or_default()
}

/// Failure reported by a script engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{message}{}", at_line(.line))]
    Compilation { message: String, line: Option<u32> },

    #[error("{message}{}", at_line(.line))]
    Runtime { message: String, line: Option<u32> },

    #[error("Script execution timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Result of {len} characters exceeds maximum allowed size of {max}")]
    ResultTooLarge { len: usize, max: usize },

    /// Too many threads are still busy with timed-out scripts.
    #[error("{0} engine threads are still running timed-out scripts; rejecting new work")]
    Saturated(usize),
}

impl EngineError {
    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        EngineError::Runtime {
            message: message.into(),
            line: None,
        }
    }

    /// Wire error code this failure is reported under.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            EngineError::Compilation { .. } => ErrorCode::Compilation,
            EngineError::Runtime { .. }
            | EngineError::ResultTooLarge { .. }
            | EngineError::Saturated(_) => ErrorCode::Runtime,
            EngineError::Timeout(_) => ErrorCode::Timeout,
        }
    }
}

/// Failure resolving a script through the cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Script {0} is not compiled and no body was supplied")]
    NotFound(ScriptId),

    /// Compiling the supplied body failed; nothing was cached.
    #[error(transparent)]
    Compilation(EngineError),
}

impl CacheError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CacheError::NotFound(_) => ErrorCode::NotFound,
            CacheError::Compilation(_) => ErrorCode::Compilation,
        }
    }
}

/// Broker-side failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    Send(String),

    #[error("Acknowledgement error: {0}")]
    Ack(String),

    #[error("Failed to provision topic '{topic}': {reason}")]
    Provision { topic: String, reason: String },

    #[error("Adapter is closed")]
    Closed,

    /// Non-retryable; the worker tears down and exits.
    #[error("Fatal broker error: {0}")]
    Fatal(String),
}

impl AdapterError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdapterError::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
