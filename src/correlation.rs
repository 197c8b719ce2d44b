//! Correlation-id generation and the pending-request table that matches
//! responses back to their waiting caller.

use crate::message::{new_correlation_id, Message};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex};

pub struct PendingRequest {
    pub source_process: String,
    responder: oneshot::Sender<Message>,
    #[allow(dead_code)]
    pub timestamp: Instant,
}

/// `correlation_id -> PendingRequest`, with the lookup-and-delete used by
/// response routing folded into one critical section so a response can
/// never be delivered twice.
#[derive(Default)]
pub struct CorrelationTable {
    sequence: AtomicU64,
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl CorrelationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn next_correlation_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        new_correlation_id(seq)
    }

    /// Register a waiter for `correlation_id`, returning the receiving half
    /// the caller awaits on.
    pub async fn register(&self, correlation_id: String, source_process: String) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingRequest {
            source_process,
            responder: tx,
            timestamp: Instant::now(),
        };
        self.entries.lock().await.insert(correlation_id, entry);
        rx
    }

    /// Atomically remove and hand a response to its waiter. Returns `true`
    /// if a waiter existed (whether or not it was still listening).
    pub async fn deliver(&self, correlation_id: &str, response: Message) -> bool {
        let entry = self.entries.lock().await.remove(correlation_id);
        match entry {
            Some(entry) => {
                let _ = entry.responder.send(response);
                true
            }
            None => false,
        }
    }

    /// Remove a pending entry without delivering anything (timeout / shutdown path).
    pub async fn remove(&self, correlation_id: &str) {
        self.entries.lock().await.remove(correlation_id);
    }

    pub async fn contains(&self, correlation_id: &str) -> bool {
        self.entries.lock().await.contains_key(correlation_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn deliver_resolves_exactly_one_waiter() {
        let table = CorrelationTable::new();
        let rx = table.register("c1".into(), "caller".into()).await;
        assert!(table.contains("c1").await);

        let delivered = table
            .deliver("c1", Message::response("echo", json!({"ok": true})))
            .await;
        assert!(delivered);
        assert!(!table.contains("c1").await);

        let msg = rx.await.unwrap();
        assert_eq!(msg.payload, json!({"ok": true}));
    }

    #[tokio::test]
    async fn deliver_without_pending_entry_is_a_noop() {
        let table = CorrelationTable::new();
        let delivered = table.deliver("missing", Message::response("x", json!(null))).await;
        assert!(!delivered);
    }
}
