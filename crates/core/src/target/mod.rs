//! # Targets
//!
//! A target is one debugging session against one device. It owns the
//! device-side socket, the correlation tables and the filter pipelines, and
//! relays messages between the device and a single debugger client.
//!
//! [`AndroidTarget`] runs as a task that exclusively owns all of that state.
//! The handle only sends commands to the task, so correlation tables and
//! buffers never need locking.

pub mod android;
pub mod correlation;
pub mod filter;

pub use android::AndroidTarget;
pub use filter::{Direction, FilterKey, FilterOutcome, MessageFilter, Pipeline};

use crate::config::TargetConfig;
use crate::error::TargetError;
use crate::protocol::envelope;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Where messages for the debugger client go
pub type ToolsSink = mpsc::UnboundedSender<String>;

/// Observable activity of a target
#[derive(Debug, Clone, PartialEq)]
pub enum TargetEvent {
    /// A client message is about to run through `tools::<method>`
    Tools { method: String, message: Value },
    /// A device message is about to run through `target::<method>`
    Target { method: String, message: Value },
    /// The device socket ended, failed, or could not be written
    SocketClosed { target_id: String },
}

/// Per-target settings
#[derive(Debug, Clone)]
pub struct TargetOptions {
    /// Wrap and unwrap messages for a multiplexed session
    pub target_based: bool,
    /// Session id used when wrapping in target-based mode
    pub target_id: String,
    /// How long [`Target::call_target`] waits for the device
    pub call_timeout: Duration,
    /// Largest accepted device frame
    pub max_frame_size: usize,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self::from(&TargetConfig::default())
    }
}

impl From<&TargetConfig> for TargetOptions {
    fn from(config: &TargetConfig) -> Self {
        Self {
            target_based: false,
            target_id: String::new(),
            call_timeout: config.call_timeout(),
            max_frame_size: config.max_frame_size,
        }
    }
}

impl TargetOptions {
    pub fn target_based<S: Into<String>>(mut self, target_id: S) -> Self {
        self.target_based = true;
        self.target_id = target_id.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// One debugging session against one device
#[async_trait]
pub trait Target: Send + Sync {
    /// Identifier used in logs and `SocketClosed` events
    fn id(&self) -> &str;

    /// Bind a debugger client and open the device connection
    ///
    /// A second call while a connection exists is logged and ignored.
    fn connect_to(&self, url: &str, tools: ToolsSink);

    /// Open the device connection without a client
    fn direct_connect_to(&self, url: &str);

    /// Replace the client and reopen the device connection
    fn update_client(&self, tools: ToolsSink);

    /// Relay a raw client message to the device
    ///
    /// Messages sent before the device connects are buffered and replayed
    /// in order.
    fn forward(&self, message: String);

    /// Append a filter to the pipeline for `key`
    fn add_message_filter(&self, key: FilterKey, filter: Arc<dyn MessageFilter>);

    /// Issue a request of our own to the device and wait for its response
    async fn call_target(&self, method: &str, params: Value) -> Result<Value, TargetError>;

    /// Push a notification straight to the client
    fn fire_event_to_tools(&self, method: &str, params: Value);

    /// Push a response straight to the client
    fn fire_result_to_tools(&self, id: i64, result: Value);

    fn subscribe(&self) -> broadcast::Receiver<TargetEvent>;

    /// Tear down the device connection without telling the client
    fn kill(&self);

    /// Filter helper that answers a client request with an empty result
    fn reply_with_empty(&self, message: &Value) -> FilterOutcome {
        if let Some(id) = envelope::message_id(message) {
            self.fire_result_to_tools(id, json!({}));
        }
        FilterOutcome::Drop
    }
}
