//! Request correlation tables
//!
//! A target tracks two kinds of outstanding requests. Client requests are
//! remembered by id so the response can be routed through the
//! `target::<method>` filters. Proxy calls hold the reply channel of the
//! caller waiting in [`Target::call_target`](super::Target::call_target).

use crate::error::{CorrelationError, TargetError};
use crate::protocol::{ProxyRequestId, RequestId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::oneshot;
use tracing::warn;

/// Reply channel of a pending proxy call
pub type CallReply = oneshot::Sender<std::result::Result<Value, TargetError>>;

/// Hands out proxy request ids, written on the wire as -1, -2, -3...
#[derive(Debug, Default)]
pub struct CallIdAllocator {
    last: AtomicU32,
}

impl CallIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> ProxyRequestId {
        ProxyRequestId::new(self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
    }
}

#[derive(Debug, Default)]
pub struct Correlation {
    tool_requests: HashMap<i64, String>,
    calls: HashMap<ProxyRequestId, CallReply>,
}

impl Correlation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the method of a client request that is about to be forwarded
    pub fn record_tool_request(&mut self, id: i64, method: String) {
        if ProxyRequestId::from_wire(id).is_some_and(|pid| self.calls.contains_key(&pid)) {
            warn!(id, "Client request id collides with a pending proxy call");
        }
        self.tool_requests.insert(id, method);
    }

    pub fn register_call(&mut self, id: ProxyRequestId, reply: CallReply) {
        self.calls.insert(id, reply);
    }

    /// Forget a call whose caller gave up waiting
    pub fn cancel_call(&mut self, id: ProxyRequestId) -> bool {
        self.calls.remove(&id).is_some()
    }

    /// Who is waiting for a response with this id
    ///
    /// Client requests win over proxy calls when both tables know the id.
    pub fn classify(&self, id: i64) -> Option<RequestId> {
        if self.tool_requests.contains_key(&id) {
            return Some(RequestId::Tools(id));
        }
        ProxyRequestId::from_wire(id)
            .filter(|pid| self.calls.contains_key(pid))
            .map(RequestId::Proxy)
    }

    /// Consume the client request entry for a response
    pub fn take_tool_request(&mut self, id: i64) -> Option<String> {
        self.tool_requests.remove(&id)
    }

    /// Resolve or reject a pending call with the device response
    ///
    /// The entry is removed before the caller is woken, so a duplicate
    /// response for the same id finds nothing.
    pub fn settle_call(
        &mut self,
        id: ProxyRequestId,
        response: &Value,
    ) -> std::result::Result<(), CorrelationError> {
        let reply = self
            .calls
            .remove(&id)
            .ok_or(CorrelationError::UnknownId { id: id.wire() })?;

        let outcome = if let Some(result) = response.get("result") {
            Ok(result.clone())
        } else if let Some(error) = response.get("error") {
            Err(TargetError::Rejected(error.clone()))
        } else {
            // Still wake the caller so the call settles exactly once
            let _ = reply.send(Err(TargetError::MalformedResponse));
            return Err(CorrelationError::MalformedResponse { id: id.wire() });
        };

        // The caller may have timed out already
        let _ = reply.send(outcome);
        Ok(())
    }

    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn pending_tool_requests(&self) -> usize {
        self.tool_requests.len()
    }

    /// Drop every entry; waiting callers observe [`TargetError::Closed`]
    pub fn clear(&mut self) {
        self.tool_requests.clear();
        self.calls.clear();
    }
}
