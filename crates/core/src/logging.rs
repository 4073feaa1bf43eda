//! Unified logging infrastructure for devbridge
//!
//! This module provides standardized logging configuration for the proxy,
//! the device subsystems and the command-line front end.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Global log level
    pub level: LogLevel,
    /// Per-module log levels
    pub module_levels: HashMap<String, LogLevel>,
    /// Log output format
    pub format: LogFormat,
    /// Output destination
    pub output: LogOutput,
    /// Include source location (file:line) in logs
    pub include_location: bool,
    /// Include thread information
    pub include_thread_info: bool,
    /// Include span information for tracing
    pub include_spans: bool,
    /// Enable ANSI color codes
    pub enable_colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            module_levels: HashMap::new(),
            format: LogFormat::Compact,
            output: LogOutput::Stderr,
            include_location: false,
            include_thread_info: false,
            include_spans: false,
            enable_colors: true,
        }
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(BridgeError::config(format!("Invalid log level: {}", s))),
        }
    }
}

/// Log output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact single-line format
    Compact,
    /// Pretty multi-line format for development
    Pretty,
    /// Full format with all available information
    Full,
    /// JSON format for structured logging
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            "full" => Ok(LogFormat::Full),
            "json" => Ok(LogFormat::Json),
            _ => Err(BridgeError::config(format!("Invalid log format: {}", s))),
        }
    }
}

/// Log output destinations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogOutput {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
    /// File output
    File {
        /// Path to the log file
        path: PathBuf,
        /// Whether to append to existing file
        append: bool,
    },
}

impl LogOutput {
    fn make_writer(&self) -> Result<BoxMakeWriter> {
        match self {
            LogOutput::Stdout => Ok(BoxMakeWriter::new(std::io::stdout)),
            LogOutput::Stderr => Ok(BoxMakeWriter::new(std::io::stderr)),
            LogOutput::File { path, append } => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(*append)
                    .truncate(!*append)
                    .open(path)?;
                Ok(BoxMakeWriter::new(Mutex::new(file)))
            }
        }
    }
}

/// Logger builder for configuring the logging system
pub struct LoggerBuilder {
    config: LoggingConfig,
}

impl LoggerBuilder {
    /// Create a new logger builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LoggingConfig::default(),
        }
    }

    /// Create a logger builder from configuration
    pub fn from_config(config: LoggingConfig) -> Self {
        Self { config }
    }

    /// Set the global log level
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    /// Set log level for a specific module
    pub fn module_level<S: Into<String>>(mut self, module: S, level: LogLevel) -> Self {
        self.config.module_levels.insert(module.into(), level);
        self
    }

    /// Set the log format
    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    /// Set the log output destination
    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    /// Enable or disable source location information
    pub fn location(mut self, enable: bool) -> Self {
        self.config.include_location = enable;
        self
    }

    /// Enable or disable span information
    pub fn spans(mut self, enable: bool) -> Self {
        self.config.include_spans = enable;
        self
    }

    /// Enable or disable colored output
    pub fn colors(mut self, enable: bool) -> Self {
        self.config.enable_colors = enable;
        self
    }

    /// Initialize the global logger
    pub fn init(self) -> Result<()> {
        init_logging(self.config)
    }
}

impl Default for LoggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    // RUST_LOG wins over everything configured here
    if let Ok(env_filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::new(env_filter));
    }

    let mut filter = EnvFilter::new(format!("warn,devbridge={}", config.level));
    for crate_name in ["devbridge_core", "devbridge_device", "devbridge_proxy"] {
        filter = filter.add_directive(
            format!("{}={}", crate_name, config.level)
                .parse()
                .map_err(|e| BridgeError::config(format!("Invalid log directive: {}", e)))?,
        );
    }
    for (module, level) in &config.module_levels {
        filter = filter.add_directive(
            format!("{}={}", module, level)
                .parse()
                .map_err(|e| BridgeError::config(format!("Invalid log directive: {}", e)))?,
        );
    }
    Ok(filter)
}

/// Initialize the logging system with the given configuration
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = build_filter(&config)?;
    let writer = config.output.make_writer()?;
    let registry = Registry::default().with(filter);

    let span_events = if config.include_spans {
        FmtSpan::ENTER | FmtSpan::EXIT
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(config.include_spans)
                .with_span_list(config.include_spans)
                .with_target(true)
                .with_thread_ids(config.include_thread_info)
                .with_file(config.include_location)
                .with_line_number(config.include_location);
            registry.with(fmt_layer).try_init()
        }
        LogFormat::Compact | LogFormat::Pretty | LogFormat::Full => {
            let fmt_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(config.include_thread_info)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_ansi(config.enable_colors)
                .with_span_events(span_events);

            match config.format {
                LogFormat::Compact => registry.with(fmt_layer.compact()).try_init(),
                LogFormat::Pretty => registry.with(fmt_layer.pretty()).try_init(),
                _ => registry.with(fmt_layer).try_init(),
            }
        }
    };
    result.map_err(|e| BridgeError::internal(format!("Logger already initialized: {}", e)))?;

    tracing::debug!("Logging system initialized with level: {}", config.level);
    Ok(())
}

/// Apply `DEVBRIDGE_LOG_*` and `NO_COLOR` environment overrides to a configuration
pub fn apply_env_overrides(mut config: LoggingConfig) -> Result<LoggingConfig> {
    if let Ok(level_str) = std::env::var("DEVBRIDGE_LOG_LEVEL") {
        config.level = level_str.parse()?;
    }

    if let Ok(format_str) = std::env::var("DEVBRIDGE_LOG_FORMAT") {
        config.format = format_str.parse()?;
    }

    if let Ok(file_path) = std::env::var("DEVBRIDGE_LOG_FILE") {
        config.output = LogOutput::File {
            path: PathBuf::from(file_path),
            append: true,
        };
    }

    if std::env::var("NO_COLOR").is_ok() {
        config.enable_colors = false;
    }

    Ok(config)
}

/// Initialize logging with environment-based configuration
pub fn init_from_env() -> Result<()> {
    init_logging(apply_env_overrides(LoggingConfig::default())?)
}
