//! Message filter pipeline
//!
//! Filters are keyed by direction and method (`tools::Runtime.enable`,
//! `target::Debugger.scriptParsed`). Filters registered under the same key run
//! strictly in registration order; each stage sees the output of the previous
//! one, and a [`FilterOutcome::Drop`] ends the chain without forwarding.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Which side a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client (debugger front end) to device
    Tools,
    /// Device to client
    Target,
}

impl Direction {
    fn prefix(self) -> &'static str {
        match self {
            Direction::Tools => "tools",
            Direction::Target => "target",
        }
    }
}

/// Synthetic event name a filter is registered under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterKey {
    direction: Direction,
    method: String,
}

impl FilterKey {
    pub fn new<S: Into<String>>(direction: Direction, method: S) -> Self {
        Self {
            direction,
            method: method.into(),
        }
    }

    /// Key for client → device messages
    pub fn tools<S: Into<String>>(method: S) -> Self {
        Self::new(Direction::Tools, method)
    }

    /// Key for device → client messages
    pub fn target<S: Into<String>>(method: S) -> Self {
        Self::new(Direction::Target, method)
    }

    /// Key that catches error responses to client requests
    pub fn target_error() -> Self {
        Self::target("error")
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.direction.prefix(), self.method)
    }
}

impl std::str::FromStr for FilterKey {
    type Err = crate::error::BridgeError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.split_once("::") {
            Some(("tools", method)) => Ok(Self::tools(method)),
            Some(("target", method)) => Ok(Self::target(method)),
            _ => Err(crate::error::BridgeError::protocol(format!(
                "Invalid filter key: {}",
                s
            ))),
        }
    }
}

/// Result of one filter stage
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    /// Pass this (possibly rewritten) message to the next stage
    Forward(Value),
    /// Stop here, nothing is forwarded
    Drop,
}

impl From<Option<Value>> for FilterOutcome {
    fn from(value: Option<Value>) -> Self {
        match value {
            Some(message) => FilterOutcome::Forward(message),
            None => FilterOutcome::Drop,
        }
    }
}

/// One stage of a pipeline
#[async_trait]
pub trait MessageFilter: Send + Sync {
    async fn filter(&self, message: Value) -> FilterOutcome;
}

#[async_trait]
impl<F, Fut> MessageFilter for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = FilterOutcome> + Send,
{
    async fn filter(&self, message: Value) -> FilterOutcome {
        (self)(message).await
    }
}

/// Ordered filters for one key
pub type Pipeline = Vec<Arc<dyn MessageFilter>>;

/// All filters registered on a target
#[derive(Default)]
pub struct FilterTable {
    filters: HashMap<FilterKey, Pipeline>,
}

impl FilterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: FilterKey, filter: Arc<dyn MessageFilter>) {
        self.filters.entry(key).or_default().push(filter);
    }

    pub fn contains(&self, key: &FilterKey) -> bool {
        self.filters.get(key).is_some_and(|p| !p.is_empty())
    }

    /// Snapshot of the pipeline for a key
    pub fn pipeline(&self, key: &FilterKey) -> Option<Pipeline> {
        self.filters.get(key).filter(|p| !p.is_empty()).cloned()
    }
}

impl fmt::Debug for FilterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .filters
            .iter()
            .map(|(key, pipeline)| format!("{} ({})", key, pipeline.len()))
            .collect();
        keys.sort();
        f.debug_struct("FilterTable").field("keys", &keys).finish()
    }
}

/// Run a pipeline, awaiting each stage before starting the next
pub async fn run_pipeline(pipeline: Pipeline, message: Value) -> FilterOutcome {
    let mut current = message;
    for filter in &pipeline {
        match filter.filter(current).await {
            FilterOutcome::Forward(next) => current = next,
            FilterOutcome::Drop => return FilterOutcome::Drop,
        }
    }
    FilterOutcome::Forward(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_filter_key_names() {
        assert_eq!(FilterKey::tools("Runtime.enable").to_string(), "tools::Runtime.enable");
        assert_eq!(FilterKey::target_error().to_string(), "target::error");
        assert_eq!(
            "target::Debugger.scriptParsed".parse::<FilterKey>().unwrap(),
            FilterKey::target("Debugger.scriptParsed")
        );
        assert!("Debugger.scriptParsed".parse::<FilterKey>().is_err());
    }

    #[tokio::test]
    async fn test_stages_run_in_registration_order() {
        let mut table = FilterTable::new();
        let key = FilterKey::tools("Page.navigate");
        table.add(
            key.clone(),
            Arc::new(|mut msg: Value| async move {
                // The slow first stage must still finish before the second starts
                tokio::time::sleep(Duration::from_millis(20)).await;
                msg["params"]["trail"] = json!(["f1"]);
                FilterOutcome::Forward(msg)
            }),
        );
        table.add(
            key.clone(),
            Arc::new(|mut msg: Value| async move {
                msg["params"]["trail"]
                    .as_array_mut()
                    .expect("f1 ran first")
                    .push(json!("f2"));
                FilterOutcome::Forward(msg)
            }),
        );

        let pipeline = table.pipeline(&key).unwrap();
        let outcome = run_pipeline(pipeline, json!({"id": 1, "params": {}})).await;
        assert_eq!(
            outcome,
            FilterOutcome::Forward(json!({"id": 1, "params": {"trail": ["f1", "f2"]}}))
        );
    }

    #[tokio::test]
    async fn test_drop_short_circuits() {
        let second_ran = Arc::new(AtomicBool::new(false));
        let flag = second_ran.clone();

        let pipeline: Pipeline = vec![
            Arc::new(|_msg: Value| async { FilterOutcome::Drop }),
            Arc::new(move |msg: Value| {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    FilterOutcome::Forward(msg)
                }
            }),
        ];

        assert_eq!(run_pipeline(pipeline, json!({})).await, FilterOutcome::Drop);
        assert!(!second_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_empty_pipeline_forwards_verbatim() {
        let msg = json!({"id": 2, "method": "Runtime.enable"});
        assert_eq!(
            run_pipeline(Vec::new(), msg.clone()).await,
            FilterOutcome::Forward(msg)
        );
        assert!(FilterTable::new().pipeline(&FilterKey::tools("x")).is_none());
    }
}
