//! Pending invocation registry
//!
//! Correlates outbound invocations with the completions and stream items
//! the server sends back. Entries are owned exclusively by the registry and
//! released when a completion retires the id or the connection is lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Result, SignalRError};
use crate::messages::CompletionMessage;

/// Events delivered to a `stream()` consumer.
pub(crate) enum StreamEvent {
    Item(Value),
    Done(CompletionMessage),
}

enum Pending {
    Invoke {
        waiter: oneshot::Sender<CompletionMessage>,
        created_at: Instant,
    },
    Stream {
        sink: mpsc::UnboundedSender<StreamEvent>,
        created_at: Instant,
    },
}

#[derive(Default)]
pub(crate) struct InvocationRegistry {
    pending: Mutex<HashMap<String, Pending>>,
    next_id: AtomicU64,
}

impl InvocationRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocate the next invocation id: monotonically increasing per
    /// connection, rendered as a string.
    pub(crate) fn next_invocation_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Restart id allocation; called on every successful (re)connect, after
    /// the previous epoch's entries have been failed.
    pub(crate) fn reset(&self) {
        self.next_id.store(0, Ordering::SeqCst);
    }

    /// Register a unary waiter for `id`.
    pub(crate) fn register_invoke(&self, id: &str) -> Result<oneshot::Receiver<CompletionMessage>> {
        let mut pending = self.pending.lock();
        if pending.contains_key(id) {
            return Err(SignalRError::Protocol(format!(
                "invocation id {id} is already outstanding"
            )));
        }
        let (waiter, rx) = oneshot::channel();
        pending.insert(
            id.to_string(),
            Pending::Invoke {
                waiter,
                created_at: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Register a stream sink for `id`.
    pub(crate) fn register_stream(
        &self,
        id: &str,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>> {
        let mut pending = self.pending.lock();
        if pending.contains_key(id) {
            return Err(SignalRError::Protocol(format!(
                "invocation id {id} is already outstanding"
            )));
        }
        let (sink, rx) = mpsc::unbounded_channel();
        pending.insert(
            id.to_string(),
            Pending::Stream {
                sink,
                created_at: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Drop the entry for `id` without delivering anything. Used when the
    /// invocation never made it onto the wire.
    pub(crate) fn discard(&self, id: &str) {
        self.pending.lock().remove(id);
    }

    /// Whether `id` is still outstanding.
    pub(crate) fn is_outstanding(&self, id: &str) -> bool {
        self.pending.lock().contains_key(id)
    }

    /// Deliver a stream item. Returns false when no stream is registered
    /// under the id (already completed, or never ours).
    pub(crate) fn deliver_item(&self, id: &str, item: Value) -> bool {
        let pending = self.pending.lock();
        match pending.get(id) {
            Some(Pending::Stream { sink, .. }) => {
                // a dropped consumer is fine; the entry stays until completion
                let _ = sink.send(StreamEvent::Item(item));
                true
            }
            Some(Pending::Invoke { .. }) => {
                debug!(id, "stream item for a unary invocation dropped");
                false
            }
            None => false,
        }
    }

    /// Deliver a completion and retire the id. Returns false when the id was
    /// not outstanding.
    pub(crate) fn complete(&self, message: CompletionMessage) -> bool {
        let entry = self.pending.lock().remove(&message.invocation_id);
        match entry {
            Some(Pending::Invoke { waiter, .. }) => {
                let _ = waiter.send(message);
                true
            }
            Some(Pending::Stream { sink, .. }) => {
                let _ = sink.send(StreamEvent::Done(message));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding invocation by dropping its waiter or sink;
    /// callers observe the loss as a connection error.
    pub(crate) fn fail_all(&self) {
        let drained: Vec<(String, Pending)> = self.pending.lock().drain().collect();
        for (id, entry) in drained {
            let created_at = match &entry {
                Pending::Invoke { created_at, .. } | Pending::Stream { created_at, .. } => {
                    *created_at
                }
            };
            debug!(id = %id, age = ?created_at.elapsed(), "failing pending invocation");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_monotonic() {
        let registry = InvocationRegistry::new();
        assert_eq!(registry.next_invocation_id(), "1");
        assert_eq!(registry.next_invocation_id(), "2");
        assert_eq!(registry.next_invocation_id(), "3");
    }

    #[test]
    fn test_reset_restarts_allocation() {
        let registry = InvocationRegistry::new();
        registry.next_invocation_id();
        registry.next_invocation_id();
        registry.reset();
        assert_eq!(registry.next_invocation_id(), "1");
    }

    #[test]
    fn test_register_rejects_outstanding_id() {
        let registry = InvocationRegistry::new();
        let _rx = registry.register_invoke("1").unwrap();
        assert!(registry.register_invoke("1").is_err());
        assert!(registry.register_stream("1").is_err());
    }

    #[tokio::test]
    async fn test_complete_delivers_and_retires() {
        let registry = InvocationRegistry::new();
        let rx = registry.register_invoke("1").unwrap();

        assert!(registry.complete(CompletionMessage::with_result("1", json!(3))));
        assert!(!registry.is_outstanding("1"));
        // a second completion for the same id has nowhere to go
        assert!(!registry.complete(CompletionMessage::void("1")));

        let completion = rx.await.unwrap();
        assert_eq!(completion.result, Some(json!(3)));
    }

    #[tokio::test]
    async fn test_stream_items_then_done() {
        let registry = InvocationRegistry::new();
        let mut rx = registry.register_stream("2").unwrap();

        assert!(registry.deliver_item("2", json!(1)));
        assert!(registry.deliver_item("2", json!(2)));
        assert!(registry.complete(CompletionMessage::void("2")));
        // items after completion are dropped
        assert!(!registry.deliver_item("2", json!(3)));

        assert!(matches!(rx.recv().await, Some(StreamEvent::Item(v)) if v == json!(1)));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Item(v)) if v == json!(2)));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Done(_))));
    }

    #[test]
    fn test_deliver_item_unknown_id() {
        let registry = InvocationRegistry::new();
        assert!(!registry.deliver_item("404", json!(null)));
    }

    #[tokio::test]
    async fn test_fail_all_unblocks_waiters() {
        let registry = InvocationRegistry::new();
        let rx = registry.register_invoke("1").unwrap();
        let mut stream_rx = registry.register_stream("2").unwrap();

        registry.fail_all();
        assert_eq!(registry.len(), 0);

        assert!(rx.await.is_err());
        assert!(stream_rx.recv().await.is_none());
    }

    #[test]
    fn test_discard_removes_entry() {
        let registry = InvocationRegistry::new();
        let _rx = registry.register_invoke("1").unwrap();
        registry.discard("1");
        assert!(!registry.is_outstanding("1"));
    }
}
