//! # devbridge device discovery
//!
//! Finds debuggable JavaScript engines on attached devices:
//!
//! - **ADB**: polls `adb` for Android devices, keeps reload and debugger
//!   tunnels open for each, and holds a reconnecting session to the app's
//!   reload daemon behind every reload tunnel.
//! - **Simulator**: polls for iOS simulator inspector sockets.
//!
//! Both run as background tasks and publish their view through
//! `tokio::sync::watch` channels.

pub mod adb;
pub mod simulator;

pub use adb::{
    AdbAutoConnector, AdbClient, ConnectionState, DaemonConnection, DaemonEvent, DebuggableTarget,
    DeviceBridge, Tunnel, TunnelDiff, TunnelSet,
};
pub use simulator::{LsofSocketSource, SimulatorSocketFinder, SocketSource};
