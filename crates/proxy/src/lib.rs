//! # devbridge proxy
//!
//! The DevTools-facing half of devbridge. A [`ProxyServer`] listens for
//! debugger clients, answers discovery requests, and hands each client to
//! the [`UniversalAdapter`], which routes it by path prefix to the platform
//! adapter owning the device.

pub mod adapter;
pub mod discovery;
pub mod server;

pub use adapter::{Adapter, AndroidAdapter, ClientToken, TargetInfo, UniversalAdapter};
pub use discovery::{DiscoveryCache, VersionInfo};
pub use server::{ProxyServer, RunningServer};
