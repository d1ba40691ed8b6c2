//! Correlates responses with in-flight requests.

use crate::error::GatewayError;
use crate::jsonrpc::JsonRpcResponse;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// One-shot completion for a pending request.
pub type Completion = oneshot::Sender<Result<JsonRpcResponse, GatewayError>>;

/// Pending-request table, owned by the supervisor task.
///
/// Each id maps to exactly one completion, and each completion fires at most
/// once: on the matching response, on an explicit failure, or on drain.
#[derive(Debug, Default)]
pub struct ResponseRouter {
    pending: HashMap<String, Completion>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a completion for `id`.
    ///
    /// A second registration for an id that is still pending is rejected: the
    /// new completion is failed immediately with `DuplicateRequestId` and the
    /// existing one is left untouched. Returns whether the registration took.
    pub fn register(&mut self, id: String, completion: Completion) -> bool {
        if self.pending.contains_key(&id) {
            tracing::warn!("Rejecting duplicate pending request id '{id}'");
            let _ = completion.send(Err(GatewayError::DuplicateRequestId(id)));
            return false;
        }
        self.pending.insert(id, completion);
        true
    }

    /// Deliver a response to its waiting caller.
    ///
    /// Unknown ids are dropped; this covers late responses for calls that
    /// were already failed by a drain or abandoned by the caller.
    pub fn resolve(&mut self, response: JsonRpcResponse) -> bool {
        match self.pending.remove(&response.id) {
            Some(completion) => {
                // The caller may have given up waiting; that is not an error.
                let _ = completion.send(Ok(response));
                true
            }
            None => {
                tracing::debug!("Dropping response for unknown request id '{}'", response.id);
                false
            }
        }
    }

    /// Fail a single pending request.
    pub fn fail(&mut self, id: &str, error: GatewayError) -> bool {
        match self.pending.remove(id) {
            Some(completion) => {
                let _ = completion.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every pending request. Returns how many were drained.
    pub fn drain_all(&mut self, error: &GatewayError) -> usize {
        let count = self.pending.len();
        for (_, completion) in self.pending.drain() {
            let _ = completion.send(Err(error.clone()));
        }
        if count > 0 {
            tracing::debug!("Drained {count} pending request(s): {error}");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
