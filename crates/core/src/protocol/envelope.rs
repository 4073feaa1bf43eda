//! Debugger protocol envelopes
//!
//! Messages travel as loosely typed JSON so that filters can rewrite any
//! field. The helpers here classify and build the three envelope shapes:
//! requests `{id, method, params}`, responses `{id, result|error}` and
//! notifications `{method, params}`.

use crate::error::{BridgeError, ProtocolError, Result};
use serde_json::{Map, Value, json};
use std::fmt;

/// Method that wraps a session message sent to a multiplexed target
pub const SEND_MESSAGE_TO_TARGET: &str = "Target.sendMessageToTarget";
/// Method that wraps a session message coming back from a multiplexed target
pub const DISPATCH_MESSAGE_FROM_TARGET: &str = "Target.dispatchMessageFromTarget";

/// Who issued a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestId {
    /// Assigned by the debugger client
    Tools(i64),
    /// Assigned by the proxy itself
    Proxy(ProxyRequestId),
}

/// Identifier of a proxy-initiated request
///
/// Proxy requests are numbered 1, 2, 3... and travel on the wire as -1, -2,
/// -3... so they never look like the ids a debugger client hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyRequestId(u32);

impl ProxyRequestId {
    pub fn new(sequence: u32) -> Self {
        Self(sequence)
    }

    /// The id as written into the JSON envelope
    pub fn wire(self) -> i64 {
        -i64::from(self.0)
    }

    /// Recover a proxy id from its wire form, `None` for non-negative ids
    pub fn from_wire(id: i64) -> Option<Self> {
        if id >= 0 {
            return None;
        }
        id.checked_neg()
            .and_then(|n| u32::try_from(n).ok())
            .map(Self)
    }
}

impl fmt::Display for ProxyRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire())
    }
}

/// Parse a raw JSON message
pub fn parse(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err(ProtocolError::InvalidFormat {
            reason: "envelope is not a JSON object".to_string(),
        }
        .into());
    }
    Ok(value)
}

/// The numeric `id` of a message, if it has one
pub fn message_id(message: &Value) -> Option<i64> {
    message.get("id").and_then(Value::as_i64)
}

/// Whether the message carries an `id` field at all
pub fn has_id(message: &Value) -> bool {
    message.get("id").is_some()
}

/// The `method` of a message, if it has one
pub fn message_method(message: &Value) -> Option<&str> {
    message.get("method").and_then(Value::as_str)
}

/// Whether the message is a response carrying an `error`
pub fn is_error(message: &Value) -> bool {
    message.get("error").is_some()
}

/// Whether the method belongs to the `Target` domain
pub fn is_target_domain(method: &str) -> bool {
    method.starts_with("Target")
}

pub fn request(id: i64, method: &str, params: Value) -> Value {
    json!({ "id": id, "method": method, "params": params })
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({ "method": method, "params": params })
}

pub fn result(id: i64, result: Value) -> Value {
    json!({ "id": id, "result": result })
}

/// Wrap a message for a multiplexed target session
///
/// `Target.*` messages and messages without a method are returned unchanged.
pub fn wrap_for_target(message: Value, target_id: &str) -> Result<Value> {
    let Some(method) = message_method(&message) else {
        return Ok(message);
    };
    if is_target_domain(method) {
        return Ok(message);
    }

    let id = message.get("id").cloned().unwrap_or(Value::Null);
    let inner = serde_json::to_string(&message)?;
    let mut params = Map::new();
    params.insert("id".to_string(), id.clone());
    params.insert("message".to_string(), Value::String(inner));
    params.insert("targetId".to_string(), Value::String(target_id.to_string()));

    Ok(json!({
        "id": id,
        "method": SEND_MESSAGE_TO_TARGET,
        "params": Value::Object(params),
    }))
}

/// The serialized inner message of a `Target.dispatchMessageFromTarget`
pub fn dispatched_payload(message: &Value) -> Result<&str> {
    message
        .get("params")
        .and_then(|params| params.get("message"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            BridgeError::protocol(format!(
                "{} without a string params.message",
                DISPATCH_MESSAGE_FROM_TARGET
            ))
        })
}
