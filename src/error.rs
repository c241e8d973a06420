//! Error types for ovnode

use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Command execution failed
    #[error("Command '{cmd}' failed{}: {stderr}", exit_code_suffix(.code))]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },

    /// An external process or query did not answer in time
    #[error("Timeout after {after:?}: {what}")]
    Timeout { what: String, after: Duration },

    /// Interactive session ended before the expected signal
    #[error("Process exited early: {0}")]
    ProcessExited(String),

    /// Named entity absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input or file content does not match the expected grammar
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Required external binary or file absent
    #[error("Environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    /// On-disk state contradicts itself
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),
}

impl NodeError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        NodeError::Timeout { what: what.into(), after }
    }
}

fn exit_code_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {}", code),
        None => String::new(),
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(error: serde_json::Error) -> Self {
        NodeError::ParseError(error.to_string())
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
