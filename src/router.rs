//! Router & RPC: delivers messages by target, pairs responses with pending
//! requests by correlation id, and serves the two broker-local RPC methods.

use crate::correlation::CorrelationTable;
use crate::error::BrokerError;
use crate::message::{Message, MessageType, BROKER_ID};
use crate::registry::TransportRegistry;
use crate::stats::MessageStats;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Deadline for offering a matched response to its waiter's channel. The
/// channel has capacity 1, so only a pathologically slow waiter misses it.
const RESPONSE_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

const INTERNAL_QUEUE_CAPACITY: usize = 100;

/// Insertion-ordered, de-duplicated set of RPC method names a child has
/// advertised. Pure bookkeeping; nothing routes differently based on it.
#[derive(Default)]
struct EndpointSet {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl EndpointSet {
    fn insert(&mut self, endpoint: String) {
        if self.seen.insert(endpoint.clone()) {
            self.order.push(endpoint);
        }
    }
}

#[derive(Default)]
struct EndpointRegistry {
    by_process: Mutex<HashMap<String, EndpointSet>>,
}

impl EndpointRegistry {
    async fn register(&self, pid: &str, endpoint: &str) {
        let mut by_process = self.by_process.lock().await;
        by_process.entry(pid.to_string()).or_default().insert(endpoint.to_string());
    }

    async fn endpoints(&self, pid: &str) -> Vec<String> {
        self.by_process
            .lock()
            .await
            .get(pid)
            .map(|set| set.order.clone())
            .unwrap_or_default()
    }

    async fn all(&self) -> HashMap<String, Vec<String>> {
        self.by_process
            .lock()
            .await
            .iter()
            .map(|(pid, set)| (pid.clone(), set.order.clone()))
            .collect()
    }
}

pub struct Router {
    correlation: Arc<CorrelationTable>,
    transports: Arc<TransportRegistry>,
    stats: Arc<MessageStats>,
    endpoints: EndpointRegistry,
    internal_tx: mpsc::Sender<Message>,
}

impl Router {
    pub fn new(
        correlation: Arc<CorrelationTable>,
        transports: Arc<TransportRegistry>,
        stats: Arc<MessageStats>,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_QUEUE_CAPACITY);
        let router = Arc::new(Self {
            correlation,
            transports,
            stats,
            endpoints: EndpointRegistry::default(),
            internal_tx,
        });
        (router, internal_rx)
    }

    pub async fn register_endpoint(&self, pid: &str, endpoint: &str) {
        self.endpoints.register(pid, endpoint).await;
    }

    pub async fn endpoints(&self, pid: &str) -> Vec<String> {
        self.endpoints.endpoints(pid).await
    }

    pub async fn all_endpoints(&self) -> HashMap<String, Vec<String>> {
        self.endpoints.all().await
    }

    /// Routes one observed message. `observed_source` fills in `msg.source`
    /// when the sender left it blank (e.g. a pipe transport that doesn't
    /// know its own process id).
    pub async fn route(&self, mut msg: Message, observed_source: &str) -> Result<(), BrokerError> {
        if msg.source.is_empty() {
            msg.source = observed_source.to_string();
        }
        self.stats.record_received(&msg.source);

        if msg.kind == MessageType::Response || msg.kind == MessageType::Error {
            if !msg.correlation_id.is_empty() {
                let delivered = self.deliver_response(&msg).await?;
                if delivered {
                    return Ok(());
                }
                // No pending entry: unsolicited, fall through to target routing.
            }
        }

        if !msg.target.is_empty() {
            if msg.target == BROKER_ID {
                let response = self.process_local(&msg).await;
                self.stats.record_sent(&response.target);
                self.transports.send_to(&response.target, &response).await?;
                return Ok(());
            }
            self.stats.record_sent(&msg.target);
            return self.transports.send_to(&msg.target, &msg).await;
        }

        self.internal_tx
            .send(msg)
            .await
            .map_err(|_| BrokerError::ShuttingDown)
    }

    /// Atomically looks up and removes the pending entry for `msg`'s
    /// correlation id, then offers the message to its waiter with a 5s
    /// deadline. Returns whether a pending entry existed at all.
    async fn deliver_response(&self, msg: &Message) -> Result<bool, BrokerError> {
        let deadline = tokio::time::timeout(
            RESPONSE_DELIVERY_TIMEOUT,
            self.correlation.deliver(&msg.correlation_id, msg.clone()),
        )
        .await;
        match deadline {
            Ok(existed) => Ok(existed),
            Err(_) => Err(BrokerError::Timeout(format!(
                "delivering response for {}",
                msg.correlation_id
            ))),
        }
    }

    /// Sends a Request to `target`, waits for the matching Response/Error up
    /// to `timeout`. On timeout the pending entry is removed before
    /// returning so it can never be delivered late.
    pub async fn invoke_rpc(
        &self,
        source: &str,
        target: &str,
        method: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<Message, BrokerError> {
        let correlation_id = self.correlation.next_correlation_id();
        let mut request = Message::request(method, target, payload);
        request.source = source.to_string();
        request.correlation_id = correlation_id.clone();

        let rx = self.correlation.register(correlation_id.clone(), source.to_string()).await;
        self.stats.record_sent(target);
        if let Err(e) = self.transports.send_to(target, &request).await {
            self.correlation.remove(&correlation_id).await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.correlation.remove(&correlation_id).await;
                Err(BrokerError::ShuttingDown)
            }
            Err(_) => {
                self.correlation.remove(&correlation_id).await;
                Err(BrokerError::Timeout(format!("{method} -> {target}")))
            }
        }
    }

    /// Broker-local RPC dispatch. Every produced response carries
    /// `source="broker"`, `target=req.source`, and the original correlation id.
    async fn process_local(&self, req: &Message) -> Message {
        match req.id.as_str() {
            "RPCGetMessageStats" => {
                let total = self.stats.total_stats();
                let per_process = self.stats.per_process_stats();
                let payload = json!({
                    "total": total,
                    "per_process": per_process,
                });
                self.local_response(req, payload)
            }
            "RPCGetMessageCount" => {
                let payload = json!({ "count": self.stats.total_count() });
                self.local_response(req, payload)
            }
            other => {
                warn!(method = other, "unknown broker-local RPC method");
                Message::error_reply(
                    req.id.clone(),
                    req.correlation_id.clone(),
                    format!("unknown RPC method: {other}"),
                )
            }
        }
    }

    fn local_response(&self, req: &Message, payload: serde_json::Value) -> Message {
        let mut response = Message::response(req.id.clone(), payload);
        response.source = BROKER_ID.to_string();
        response.target = req.source.clone();
        response.correlation_id = req.correlation_id.clone();
        response
    }

    /// Used by the reader-path error recovery: if routing a correlated
    /// Request fails, synthesize an Error back to the original sender,
    /// best-effort (failures here are logged, not propagated).
    pub async fn reply_with_error(&self, original: &Message, error: impl Into<String>) {
        if original.correlation_id.is_empty() {
            return;
        }
        let reply = Message::error_reply(original.id.clone(), original.correlation_id.clone(), error.into());
        if let Err(e) = self.transports.send_to(&original.source, &reply).await {
            debug!(target = %original.source, error = %e, "failed to deliver synthesized error reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_router() -> (Arc<Router>, mpsc::Receiver<Message>) {
        let correlation = CorrelationTable::new();
        let transports = TransportRegistry::new();
        let stats = Arc::new(MessageStats::new());
        Router::new(correlation, transports, stats)
    }

    #[tokio::test]
    async fn unrouted_message_lands_on_internal_channel() {
        let (router, mut rx) = new_router();
        let msg = Message::event("tick", json!({}));
        router.route(msg, "svc").await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.source, "svc");
    }

    #[tokio::test]
    async fn broker_local_message_count_rpc_delivers_response_to_caller() {
        use crate::transport::{Transport, TransportState};
        use async_trait::async_trait;
        use tokio::sync::mpsc as tmpsc;

        struct CapturingTransport(tmpsc::UnboundedSender<Message>);

        #[async_trait]
        impl Transport for CapturingTransport {
            async fn connect(&mut self) -> Result<(), BrokerError> {
                Ok(())
            }
            async fn send(&self, message: &Message) -> Result<(), BrokerError> {
                let _ = self.0.send(message.clone());
                Ok(())
            }
            async fn receive(&self) -> Result<Message, BrokerError> {
                Err(BrokerError::ClosedError("capturing".into()))
            }
            async fn close(&self) -> Result<(), BrokerError> {
                Ok(())
            }
            fn state(&self) -> TransportState {
                TransportState::Connected
            }
            fn name(&self) -> &'static str {
                "capturing"
            }
        }

        let correlation = CorrelationTable::new();
        let transports = TransportRegistry::new();
        let stats = Arc::new(MessageStats::new());
        let (router, _rx) = Router::new(correlation, transports.clone(), stats);

        let (tx, mut captured) = tmpsc::unbounded_channel();
        transports.register("caller", Box::new(CapturingTransport(tx))).await;

        let mut req = Message::request("RPCGetMessageCount", BROKER_ID, json!({}));
        req.source = "caller".to_string();
        req.correlation_id = "c1".to_string();
        router.route(req, "caller").await.unwrap();

        let response = captured.recv().await.unwrap();
        assert_eq!(response.kind, MessageType::Response);
        assert_eq!(response.source, BROKER_ID);
        assert_eq!(response.target, "caller");
        assert_eq!(response.correlation_id, "c1");
        assert_eq!(response.payload["count"], 1);
    }

    #[tokio::test]
    async fn unknown_broker_method_is_error_without_pending_side_effects() {
        let (router, _rx) = new_router();
        let mut req = Message::request("NotAMethod", BROKER_ID, json!({}));
        req.source = "caller".to_string();
        let response = router.process_local(&req).await;
        assert_eq!(response.kind, MessageType::Error);
        assert_eq!(response.error, "unknown RPC method: NotAMethod");
        assert_eq!(response.target, "caller");
    }

    #[tokio::test]
    async fn endpoint_registration_is_deduplicated_and_ordered() {
        let (router, _rx) = new_router();
        router.register_endpoint("svc", "echo").await;
        router.register_endpoint("svc", "echo").await;
        router.register_endpoint("svc", "ping").await;
        assert_eq!(router.endpoints("svc").await, vec!["echo", "ping"]);
    }
}
