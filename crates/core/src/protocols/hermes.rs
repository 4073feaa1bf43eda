//! Hermes engine quirks
//!
//! Hermes announces `Debugger.scriptParsed` for every script as soon as the
//! debugger attaches, before the client has finished its own handshake. Those
//! notifications are held back until the client has both enabled the runtime
//! and asked it to run (`Runtime.runIfWaitingForDebugger`), then replayed in
//! arrival order. `Runtime.callFunctionOn` is answered locally because Hermes
//! does not handle it reliably.

use super::ProtocolAdapter;
use crate::protocol::envelope;
use crate::target::{FilterKey, FilterOutcome, Target};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

/// Proxy call that attaches the debugger to a runtime on the device
pub const CONNECT_METHOD: &str = "Valdi.connectToDebuggableDevice";

#[derive(Debug, Default)]
struct DeferralState {
    runtime_enabled: bool,
    released: bool,
    deferred: Vec<Value>,
}

fn lock(state: &Mutex<DeferralState>) -> MutexGuard<'_, DeferralState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeferralState {
    /// Hold a notification back, or hand it back if already released
    fn defer(&mut self, message: Value) -> FilterOutcome {
        if self.released {
            return FilterOutcome::Forward(message);
        }
        self.deferred.push(message);
        FilterOutcome::Drop
    }

    /// Flip the latch once the runtime is enabled and return what was held
    fn release(&mut self) -> Vec<Value> {
        if !self.runtime_enabled || self.released {
            return Vec::new();
        }
        self.released = true;
        std::mem::take(&mut self.deferred)
    }
}

pub struct HermesProtocol {
    target: Arc<dyn Target>,
    runtime_id: String,
    state: Arc<Mutex<DeferralState>>,
}

impl HermesProtocol {
    /// Install the Hermes filters and attach the debugger to `runtime_id`
    ///
    /// If the device refuses the attach call the target is killed.
    pub fn new<S: Into<String>>(target: Arc<dyn Target>, runtime_id: S) -> Self {
        let protocol = Self {
            target,
            runtime_id: runtime_id.into(),
            state: Arc::default(),
        };
        protocol.install_filters();
        protocol.connect_runtime();
        protocol
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    fn install_filters(&self) {
        self.target.add_message_filter(
            FilterKey::tools("Runtime.enable"),
            Arc::new(|message: Value| async move { FilterOutcome::Forward(message) }),
        );

        let state = self.state.clone();
        self.target.add_message_filter(
            FilterKey::target("Runtime.enable"),
            Arc::new(move |message: Value| {
                let state = state.clone();
                async move {
                    lock(&state).runtime_enabled = true;
                    FilterOutcome::Forward(message)
                }
            }),
        );

        let state = self.state.clone();
        let target = self.target.clone();
        self.target.add_message_filter(
            FilterKey::target("Runtime.runIfWaitingForDebugger"),
            Arc::new(move |message: Value| {
                let state = state.clone();
                let target = target.clone();
                async move {
                    let held = lock(&state).release();
                    if !held.is_empty() {
                        debug!(target_id = %target.id(), count = held.len(), "Replaying deferred scripts");
                    }
                    for notification in held {
                        replay(target.as_ref(), notification);
                    }
                    FilterOutcome::Forward(message)
                }
            }),
        );

        let state = self.state.clone();
        self.target.add_message_filter(
            FilterKey::target("Debugger.scriptParsed"),
            Arc::new(move |message: Value| {
                let state = state.clone();
                async move { lock(&state).defer(message) }
            }),
        );

        let target = self.target.clone();
        self.target.add_message_filter(
            FilterKey::tools("Runtime.callFunctionOn"),
            Arc::new(move |message: Value| {
                let target = target.clone();
                async move {
                    if let Some(id) = envelope::message_id(&message) {
                        target.fire_result_to_tools(id, json!({ "result": { "type": "undefined" } }));
                    }
                    FilterOutcome::Drop
                }
            }),
        );
    }

    fn connect_runtime(&self) {
        let target = self.target.clone();
        let runtime_id = self.runtime_id.clone();
        tokio::spawn(async move {
            match target
                .call_target(CONNECT_METHOD, json!({ "id": runtime_id }))
                .await
            {
                Ok(_) => {
                    info!(target_id = %target.id(), runtime_id = %runtime_id, "Debugger attached to runtime");
                }
                Err(e) => {
                    error!(target_id = %target.id(), runtime_id = %runtime_id, "Failed to attach debugger: {}", e);
                    target.kill();
                }
            }
        });
    }
}

fn replay(target: &dyn Target, notification: Value) {
    let method = envelope::message_method(&notification)
        .unwrap_or("Debugger.scriptParsed")
        .to_string();
    let params = notification.get("params").cloned().unwrap_or_else(|| json!({}));
    target.fire_event_to_tools(&method, params);
}

impl ProtocolAdapter for HermesProtocol {
    fn name(&self) -> &'static str {
        "hermes"
    }

    fn target(&self) -> &Arc<dyn Target> {
        &self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TargetError;
    use crate::target::filter::{MessageFilter, Pipeline, run_pipeline};
    use crate::target::{TargetEvent, ToolsSink};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::broadcast;

    /// Records what the protocol does to its target
    #[derive(Default)]
    struct FakeTarget {
        filters: Mutex<Vec<(FilterKey, Arc<dyn MessageFilter>)>>,
        to_tools: Mutex<Vec<Value>>,
        calls: Mutex<Vec<(String, Value)>>,
        reject_calls: bool,
        killed: AtomicBool,
    }

    impl FakeTarget {
        fn pipeline(&self, key: &FilterKey) -> Pipeline {
            self.filters
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, f)| f.clone())
                .collect()
        }

        async fn deliver(&self, key: FilterKey, message: Value) -> FilterOutcome {
            run_pipeline(self.pipeline(&key), message).await
        }

        fn sent_to_tools(&self) -> Vec<Value> {
            std::mem::take(&mut *self.to_tools.lock().unwrap())
        }
    }

    #[async_trait]
    impl Target for FakeTarget {
        fn id(&self) -> &str {
            "fake"
        }

        fn connect_to(&self, _url: &str, _tools: ToolsSink) {}

        fn direct_connect_to(&self, _url: &str) {}

        fn update_client(&self, _tools: ToolsSink) {}

        fn forward(&self, _message: String) {}

        fn add_message_filter(&self, key: FilterKey, filter: Arc<dyn MessageFilter>) {
            self.filters.lock().unwrap().push((key, filter));
        }

        async fn call_target(&self, method: &str, params: Value) -> Result<Value, TargetError> {
            self.calls.lock().unwrap().push((method.to_string(), params));
            if self.reject_calls {
                Err(TargetError::Rejected(json!({ "message": "unknown runtime" })))
            } else {
                Ok(json!({}))
            }
        }

        fn fire_event_to_tools(&self, method: &str, params: Value) {
            self.to_tools
                .lock()
                .unwrap()
                .push(envelope::notification(method, params));
        }

        fn fire_result_to_tools(&self, id: i64, result: Value) {
            self.to_tools.lock().unwrap().push(envelope::result(id, result));
        }

        fn subscribe(&self) -> broadcast::Receiver<TargetEvent> {
            broadcast::channel(1).1
        }

        fn kill(&self) {
            self.killed.store(true, Ordering::SeqCst);
        }
    }

    fn script(id: &str) -> Value {
        envelope::notification("Debugger.scriptParsed", json!({ "scriptId": id }))
    }

    #[tokio::test]
    async fn test_attaches_debugger_to_runtime() {
        let fake = Arc::new(FakeTarget::default());
        let protocol = HermesProtocol::new(fake.clone(), "7");
        assert_eq!(protocol.name(), "hermes");
        assert_eq!(protocol.runtime_id(), "7");

        tokio::task::yield_now().await;
        let calls = fake.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(CONNECT_METHOD.to_string(), json!({ "id": "7" }))]);
        assert!(!fake.killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_attach_kills_target() {
        let fake = Arc::new(FakeTarget {
            reject_calls: true,
            ..FakeTarget::default()
        });
        let _protocol = HermesProtocol::new(fake.clone(), "1");

        for _ in 0..10 {
            if fake.killed.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(fake.killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_scripts_are_deferred_then_replayed_in_order() {
        let fake = Arc::new(FakeTarget::default());
        let _protocol = HermesProtocol::new(fake.clone(), "1");
        let parsed = FilterKey::target("Debugger.scriptParsed");

        assert_eq!(fake.deliver(parsed.clone(), script("a")).await, FilterOutcome::Drop);
        assert_eq!(fake.deliver(parsed.clone(), script("b")).await, FilterOutcome::Drop);

        let enabled = json!({ "id": 1, "result": {} });
        assert_eq!(
            fake.deliver(FilterKey::target("Runtime.enable"), enabled.clone()).await,
            FilterOutcome::Forward(enabled)
        );
        assert_eq!(fake.deliver(parsed.clone(), script("c")).await, FilterOutcome::Drop);
        assert!(fake.sent_to_tools().is_empty());

        let run = json!({ "id": 2, "result": {} });
        let run_key = FilterKey::target("Runtime.runIfWaitingForDebugger");
        assert_eq!(
            fake.deliver(run_key.clone(), run.clone()).await,
            FilterOutcome::Forward(run.clone())
        );
        assert_eq!(fake.sent_to_tools(), vec![script("a"), script("b"), script("c")]);

        // After the latch flips scripts flow straight through
        assert_eq!(
            fake.deliver(parsed, script("d")).await,
            FilterOutcome::Forward(script("d"))
        );
        assert_eq!(fake.deliver(run_key, run.clone()).await, FilterOutcome::Forward(run));
        assert!(fake.sent_to_tools().is_empty());
    }

    #[tokio::test]
    async fn test_run_before_enable_keeps_deferring() {
        let fake = Arc::new(FakeTarget::default());
        let _protocol = HermesProtocol::new(fake.clone(), "1");
        let parsed = FilterKey::target("Debugger.scriptParsed");

        fake.deliver(parsed.clone(), script("a")).await;
        fake.deliver(
            FilterKey::target("Runtime.runIfWaitingForDebugger"),
            json!({ "id": 3, "result": {} }),
        )
        .await;

        assert!(fake.sent_to_tools().is_empty());
        assert_eq!(fake.deliver(parsed, script("b")).await, FilterOutcome::Drop);
    }

    #[tokio::test]
    async fn test_call_function_on_is_answered_locally() {
        let fake = Arc::new(FakeTarget::default());
        let _protocol = HermesProtocol::new(fake.clone(), "1");

        let request = envelope::request(12, "Runtime.callFunctionOn", json!({ "functionDeclaration": "f" }));
        assert_eq!(
            fake.deliver(FilterKey::tools("Runtime.callFunctionOn"), request).await,
            FilterOutcome::Drop
        );
        assert_eq!(
            fake.sent_to_tools(),
            vec![json!({ "id": 12, "result": { "result": { "type": "undefined" } } })]
        );
    }

    #[tokio::test]
    async fn test_runtime_enable_passes_through_to_device() {
        let fake = Arc::new(FakeTarget::default());
        let _protocol = HermesProtocol::new(fake.clone(), "1");

        let request = envelope::request(1, "Runtime.enable", json!({}));
        assert_eq!(
            fake.deliver(FilterKey::tools("Runtime.enable"), request.clone()).await,
            FilterOutcome::Forward(request)
        );
    }
}
