//! ADB port-forward tunnels and snapshot diffing

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// A `adb forward tcp:<local_port> tcp:<device_port>` binding on one device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tunnel {
    pub device_id: String,
    pub local_port: u16,
    pub device_port: u16,
}

pub type TunnelSet = BTreeSet<Tunnel>;

impl Tunnel {
    pub fn new<S: Into<String>>(device_id: S, local_port: u16, device_port: u16) -> Self {
        Self {
            device_id: device_id.into(),
            local_port,
            device_port,
        }
    }

    /// Stable identity used in logs, `adb:<device>:<local port>`
    pub fn key(&self) -> String {
        format!("adb:{}:{}", self.device_id, self.local_port)
    }

    /// Where the local end of the tunnel accepts connections
    pub fn local_address(&self) -> String {
        format!("localhost:{}", self.local_port)
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> device:{}", self.key(), self.device_port)
    }
}

/// Difference between two tunnel snapshots
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TunnelDiff {
    pub added: TunnelSet,
    pub removed: TunnelSet,
}

impl TunnelDiff {
    pub fn between(previous: &TunnelSet, current: &TunnelSet) -> Self {
        Self {
            added: current.difference(previous).cloned().collect(),
            removed: previous.difference(current).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
