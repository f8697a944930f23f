//! Relay-wide index of requests awaiting a COMMAND_RESULT.
//!
//! Completion slots are created by the client-facing path and resolved by
//! the editor-facing path, so the index is the rendezvous between the two
//! sides of a dispatch.

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use prism_proto::{CommandResult, ErrorBody, ErrorCode};

/// Index of in-flight request completion slots, keyed by request
/// identifier.
#[derive(Default)]
pub struct PendingRequests {
    slots: DashMap<String, oneshot::Sender<CommandResult>>,
}

impl PendingRequests {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a completion slot for a request and returns its receiver.
    ///
    /// A prior slot under the same identifier is dropped; its waiter sees
    /// a closed channel. The idempotency cache's single-flight rule makes
    /// that case unreachable in practice.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<CommandResult> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(request_id.to_owned(), tx);
        rx
    }

    /// Resolves a slot with an editor result.
    ///
    /// Returns false when no slot is waiting, which is how late results
    /// (after a TIMEOUT reply) are detected and discarded.
    pub fn resolve(&self, request_id: &str, result: CommandResult) -> bool {
        match self.slots.remove(request_id) {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => {
                debug!(request_id = %request_id, "no completion slot for result");
                false
            }
        }
    }

    /// Resolves a slot with a relay-synthesised failure.
    pub fn fail(&self, request_id: &str, code: ErrorCode, message: impl Into<String>) -> bool {
        self.resolve(
            request_id,
            CommandResult::failure(request_id, ErrorBody::new(code, message)),
        )
    }

    /// Removes a slot without resolving it (deadline expiry).
    pub fn discard(&self, request_id: &str) {
        self.slots.remove(request_id);
    }

    /// Number of requests currently awaiting a result.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
