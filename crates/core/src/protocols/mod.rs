//! Engine-specific protocol adapters
//!
//! A protocol adapter wraps one target and installs the filters that paper
//! over the quirks of a particular JavaScript engine. The target itself never
//! knows which engine it talks to.

pub mod hermes;

pub use hermes::HermesProtocol;

use crate::error::BridgeError;
use crate::target::Target;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Filter set layered onto a target
pub trait ProtocolAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn target(&self) -> &Arc<dyn Target>;
}

/// Plain CDP: every message passes through untouched
pub struct GenericProtocol {
    target: Arc<dyn Target>,
}

impl GenericProtocol {
    pub fn new(target: Arc<dyn Target>) -> Self {
        Self { target }
    }
}

impl ProtocolAdapter for GenericProtocol {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn target(&self) -> &Arc<dyn Target> {
        &self.target
    }
}

/// Which adapter to attach to new targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Generic,
    #[default]
    Hermes,
}

impl ProtocolKind {
    /// Attach the adapter for this engine to a target
    ///
    /// `runtime_id` identifies the JavaScript runtime on the device that the
    /// session should debug.
    pub fn attach(self, target: Arc<dyn Target>, runtime_id: &str) -> Box<dyn ProtocolAdapter> {
        match self {
            ProtocolKind::Generic => Box::new(GenericProtocol::new(target)),
            ProtocolKind::Hermes => Box::new(HermesProtocol::new(target, runtime_id)),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Generic => write!(f, "generic"),
            ProtocolKind::Hermes => write!(f, "hermes"),
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "generic" | "cdp" => Ok(ProtocolKind::Generic),
            "hermes" => Ok(ProtocolKind::Hermes),
            _ => Err(BridgeError::config(format!("Unknown protocol: {}", s))),
        }
    }
}
