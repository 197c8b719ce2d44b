//! Transport manager: `process_id -> Transport`, and the `sendTo` routing
//! entry point the router calls into.

use crate::error::BrokerError;
use crate::message::Message;
use crate::transport::{ConnectionRole, Transport, UnixSocketTransport};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

type BoxedTransport = Arc<dyn Transport>;

#[derive(Default)]
pub struct TransportRegistry {
    transports: RwLock<HashMap<String, BoxedTransport>>,
}

impl TransportRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts `transport` for `pid`, replacing (without closing) any
    /// previous entry — closing a replaced transport is the caller's job.
    pub async fn register(&self, pid: impl Into<String>, transport: Box<dyn Transport>) {
        self.transports.write().await.insert(pid.into(), Arc::from(transport));
    }

    pub async fn unregister(&self, pid: &str) {
        let removed = self.transports.write().await.remove(pid);
        if let Some(transport) = removed {
            if let Err(e) = transport.close().await {
                warn!(process_id = pid, error = %e, "error closing transport on unregister");
            }
        }
    }

    pub async fn get(&self, pid: &str) -> Result<BoxedTransport, BrokerError> {
        self.transports
            .read()
            .await
            .get(pid)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(pid.to_string()))
    }

    /// Looks up the transport for `pid` and sends `msg` on it. The read lock
    /// only guards the map lookup, not the send itself: each transport
    /// serializes its own sends internally, and a `receive()` in flight on
    /// the same transport never blocks this call.
    pub async fn send_to(&self, pid: &str, msg: &Message) -> Result<(), BrokerError> {
        let transport = {
            let transports = self.transports.read().await;
            transports.get(pid).cloned().ok_or_else(|| BrokerError::NotFound(pid.to_string()))?
        };
        transport.send(msg).await
    }

    /// Constructs a server-side UDS transport at `{base}_{pid}.sock`,
    /// connects it, registers it, and returns the socket path.
    pub async fn register_uds_transport(
        &self,
        pid: &str,
        base: &std::path::Path,
        max_attempts: u32,
        delay: Duration,
    ) -> Result<PathBuf, BrokerError> {
        let path = PathBuf::from(format!("{}_{pid}.sock", base.display()));
        let mut transport = UnixSocketTransport::new(path.clone(), ConnectionRole::Server, max_attempts, delay);
        transport.connect().await?;
        self.register(pid, Box::new(transport)).await;
        Ok(path)
    }

    /// Closes every transport, logging (not surfacing) individual close
    /// failures, and empties the map.
    pub async fn close_all(&self) {
        let mut transports = self.transports.write().await;
        for (pid, transport) in transports.drain() {
            if let Err(e) = transport.close().await {
                warn!(process_id = %pid, error = %e, "error closing transport during shutdown");
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.transports.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportState;
    use async_trait::async_trait;
    use std::sync::Mutex as SyncMutex;

    struct NoopTransport(SyncMutex<TransportState>);

    impl NoopTransport {
        fn new(state: TransportState) -> Self {
            Self(SyncMutex::new(state))
        }
    }

    #[async_trait]
    impl Transport for NoopTransport {
        async fn connect(&mut self) -> Result<(), BrokerError> {
            *self.0.lock().unwrap() = TransportState::Connected;
            Ok(())
        }
        async fn send(&self, _message: &Message) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn receive(&self) -> Result<Message, BrokerError> {
            Err(BrokerError::ClosedError("noop".into()))
        }
        async fn close(&self) -> Result<(), BrokerError> {
            *self.0.lock().unwrap() = TransportState::Disconnected;
            Ok(())
        }
        fn state(&self) -> TransportState {
            *self.0.lock().unwrap()
        }
        fn name(&self) -> &'static str {
            "noop"
        }
    }

    #[tokio::test]
    async fn get_missing_returns_not_found() {
        let registry = TransportRegistry::new();
        assert!(matches!(registry.get("nope").await, Err(BrokerError::NotFound(_))));
    }

    #[tokio::test]
    async fn register_then_send_to_succeeds_and_unregister_closes() {
        let registry = TransportRegistry::new();
        registry
            .register("p1", Box::new(NoopTransport::new(TransportState::Connected)))
            .await;
        assert_eq!(registry.len().await, 1);
        registry
            .send_to("p1", &Message::event("e", serde_json::json!({})))
            .await
            .unwrap();
        registry.unregister("p1").await;
        assert_eq!(registry.len().await, 0);
    }
}
