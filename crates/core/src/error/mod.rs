//! Unified error handling for devbridge
//!
//! Errors are grouped the way the bridge degrades: transport failures end a
//! device session, protocol failures drop a single message, correlation
//! failures are logged and forwarded, and external tool failures are handed
//! back to whoever invoked the tool.

use serde_json::Value;
use thiserror::Error;

pub mod retry;

/// Result type alias for all devbridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Central error type for all devbridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Socket connect/read/write failures
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed frames or envelopes
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Responses that could not be matched to a request
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    /// Failures reported by external tools such as `adb` or `lsof`
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Configuration errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Transport-related errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Address could not be parsed
    #[error("Invalid device address '{address}'")]
    InvalidAddress { address: String },
}

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A frame did not contain valid JSON
    #[error("Message deserialization failed: {reason}")]
    Deserialization { reason: String },

    /// A frame was not valid UTF-8
    #[error("Frame payload is not valid UTF-8")]
    InvalidUtf8,

    /// An envelope did not have the expected shape
    #[error("Invalid message format: {reason}")]
    InvalidFormat { reason: String },

    /// A frame exceeded the configured limit
    #[error("Frame too large: {size} bytes")]
    FrameTooLarge { size: usize },
}

/// Correlation errors
#[derive(Error, Debug)]
pub enum CorrelationError {
    /// No request is waiting for this id
    #[error("No pending request for id {id}")]
    UnknownId { id: i64 },

    /// The response carried neither `result` nor `error`
    #[error("Response {id} has neither result nor error")]
    MalformedResponse { id: i64 },
}

/// Errors raised by external tool invocations
#[derive(Error, Debug)]
pub enum ToolError {
    /// Tool wrote to stderr
    #[error("{tool} failed: {stderr}")]
    Stderr { tool: String, stderr: String },

    /// Tool could not be spawned
    #[error("Failed to run {tool}: {reason}")]
    Spawn { tool: String, reason: String },

    /// Tool output did not parse
    #[error("Unexpected {tool} output: {output}")]
    UnexpectedOutput { tool: String, output: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// Configuration file error
    #[error("Configuration file error: {reason}")]
    FileError { reason: String },

    /// Validation failed
    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },
}

/// Outcome of a proxy-initiated call that did not produce a result
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TargetError {
    /// The device answered with an `error` object
    #[error("Target rejected the call: {0}")]
    Rejected(Value),

    /// No response arrived in time
    #[error("Target call timed out after {millis}ms")]
    Timeout { millis: u64 },

    /// The device answered with neither `result` nor `error`
    #[error("Target sent a malformed response")]
    MalformedResponse,

    /// The target shut down before answering
    #[error("Target is closed")]
    Closed,
}

// Convenience constructors for common error cases
impl BridgeError {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(ProtocolError::InvalidFormat {
            reason: message.into(),
        })
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(ConfigError::ValidationFailed {
            reason: message.into(),
        })
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn tool<T: Into<String>, S: Into<String>>(tool: T, stderr: S) -> Self {
        Self::Tool(ToolError::Stderr {
            tool: tool.into(),
            stderr: stderr.into(),
        })
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            BridgeError::Transport(_) => "transport",
            BridgeError::Protocol(_) => "protocol",
            BridgeError::Correlation(_) => "correlation",
            BridgeError::Tool(_) => "tool",
            BridgeError::Config(_) => "config",
            BridgeError::Io(_) => "io",
            BridgeError::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(ProtocolError::Deserialization {
            reason: err.to_string(),
        })
    }
}
