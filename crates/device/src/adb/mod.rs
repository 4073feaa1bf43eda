//! ADB tunnel subsystem

pub mod auto_connector;
pub mod client;
pub mod connection;
pub mod tunnel;

pub use auto_connector::{AdbAutoConnector, DebuggableTarget};
pub use client::{AdbClient, DeviceBridge};
pub use connection::{ConnectionState, DaemonConnection, DaemonEvent};
pub use tunnel::{Tunnel, TunnelDiff, TunnelSet};
