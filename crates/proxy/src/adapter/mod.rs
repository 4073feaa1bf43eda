//! Platform adapters
//!
//! An adapter owns one class of devices. It discovers debuggable targets,
//! creates a [`Target`](devbridge_core::Target) when a client attaches, and
//! relays client traffic to it. [`UniversalAdapter`] routes between adapters
//! by the first path segment of the client URL.

pub mod android;
pub mod universal;

pub use android::AndroidAdapter;
pub use universal::UniversalAdapter;

use async_trait::async_trait;
use devbridge_core::{Result, ToolsSink};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Capacity of each adapter's socket-closed channel
pub(crate) const CLOSED_CAPACITY: usize = 64;

/// Identifies one client attachment to a target
///
/// A route can be re-attached by a newer client; only the holder of the
/// current token may close the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientToken(pub u64);

/// One entry of the `/json/list` discovery response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub adapter_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default)]
    pub web_socket_debugger_url: String,
    #[serde(default)]
    pub devtools_frontend_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl TargetInfo {
    /// Fill in the client-facing URLs for a proxy reachable at `host`
    ///
    /// The id doubles as the route, `<adapter>/<target>`.
    pub fn with_endpoint(mut self, host: &str) -> Self {
        let path = format!("{}/{}", host, self.id);
        self.web_socket_debugger_url = format!("ws://{}", path);
        self.devtools_frontend_url = format!(
            "devtools://devtools/bundled/js_app.html?experiments=true&v8only=true&ws={}",
            path
        );
        self
    }
}

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Route prefix, e.g. `android`
    fn id(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self);

    /// Targets a client can attach to right now
    async fn get_targets(&self) -> Vec<TargetInfo>;

    /// Attach a client to `target_id`; device output goes to `tools`
    async fn connect_to(&self, target_id: &str, tools: ToolsSink) -> Result<ClientToken>;

    /// Relay a raw client message
    async fn forward_to(&self, target_id: &str, message: String);

    /// Drop the session for `target_id` without notifying the client
    ///
    /// Ignored when `client` is no longer the session's current client.
    async fn close_connection_to(&self, target_id: &str, client: ClientToken);

    /// Re-read device topology now
    async fn force_refresh(&self);

    /// Target ids whose device socket closed
    fn subscribe_socket_closed(&self) -> broadcast::Receiver<String>;
}
