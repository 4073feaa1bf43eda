//! # devbridge Core Library
//!
//! This crate provides the pieces shared by every devbridge component: the
//! device wire format, the per-device message pump, the filter pipeline and
//! the engine-specific protocol adapters, plus configuration and logging.
//!
//! ## Key Components
//!
//! - **Protocol**: Debugger envelopes and the length-prefixed device framing
//! - **Target**: One debugging session, relaying client and device messages
//!   through ordered filter pipelines and correlating responses
//! - **Protocols**: Filter sets for specific engines (generic CDP, Hermes)
//! - **Configuration**: Centralized configuration management
//! - **Logging**: Structured logging setup on top of `tracing`
//!
//! ## Architecture
//!
//! Each target runs as a single task that owns its socket and tables, and is
//! driven through a cloneable handle. Nothing is shared between targets.

pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod protocols;
pub mod target;

// Re-export commonly used types
pub use config::DevBridgeConfig;
pub use error::{BridgeError, Result, TargetError};
pub use logging::{LogFormat, LogLevel, LogOutput, LoggerBuilder, LoggingConfig};
pub use protocols::{GenericProtocol, HermesProtocol, ProtocolAdapter, ProtocolKind};
pub use target::{
    AndroidTarget, FilterKey, FilterOutcome, MessageFilter, Target, TargetEvent, TargetOptions,
    ToolsSink,
};
