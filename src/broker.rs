//! The broker: wires together the message/transport/router/supervisor
//! layers into the one object an embedder or the demo binary talks to.

use crate::config::BrokerConfig;
use crate::correlation::CorrelationTable;
use crate::error::BrokerError;
use crate::message::Message;
use crate::optimizer::SharedOptimizer;
use crate::process::ProcessRecord;
use crate::registry::TransportRegistry;
use crate::router::Router;
use crate::stats::MessageStats;
use crate::supervisor::{SpawnOptions, Supervisor};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct Broker {
    pub config: BrokerConfig,
    supervisor: Arc<Supervisor>,
    router: Arc<Router>,
    transports: Arc<TransportRegistry>,
    stats: Arc<MessageStats>,
    internal_task: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        let transports = TransportRegistry::new();
        let correlation = CorrelationTable::new();
        let stats = Arc::new(MessageStats::new());
        let (router, mut internal_rx) = Router::new(correlation, transports.clone(), stats.clone());
        let supervisor = Supervisor::new(config.clone(), transports.clone(), router.clone());

        let internal_task = tokio::spawn(async move {
            while let Some(msg) = internal_rx.recv().await {
                debug!(id = %msg.id, source = %msg.source, "message delivered to broker's internal channel");
            }
        });

        Arc::new(Self {
            config,
            supervisor,
            router,
            transports,
            stats,
            internal_task: Mutex::new(Some(internal_task)),
        })
    }

    pub async fn set_optimizer(&self, optimizer: SharedOptimizer) {
        self.supervisor.set_optimizer(optimizer).await;
    }

    pub async fn spawn(&self, id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Result<ProcessRecord, BrokerError> {
        self.supervisor.spawn(SpawnOptions::plain(id, command, args)).await
    }

    pub async fn spawn_rpc(&self, id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Result<ProcessRecord, BrokerError> {
        self.supervisor
            .spawn(SpawnOptions::rpc(id, command, args).with_ready_wait())
            .await
    }

    pub async fn spawn_with_restart(
        &self,
        id: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        max_restarts: i64,
    ) -> Result<ProcessRecord, BrokerError> {
        self.supervisor
            .spawn(SpawnOptions::plain(id, command, args).with_restart(max_restarts))
            .await
    }

    pub async fn spawn_rpc_with_restart(
        &self,
        id: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        max_restarts: i64,
    ) -> Result<ProcessRecord, BrokerError> {
        self.supervisor
            .spawn(SpawnOptions::rpc(id, command, args).with_restart(max_restarts).with_ready_wait())
            .await
    }

    pub async fn kill(&self, id: &str) -> Result<(), BrokerError> {
        self.supervisor.kill(id).await
    }

    pub async fn process_count(&self) -> usize {
        self.supervisor.process_count().await
    }

    pub async fn get_process(&self, id: &str) -> Option<ProcessRecord> {
        self.supervisor.get(id).await
    }

    pub async fn list_processes(&self) -> Vec<ProcessRecord> {
        self.supervisor.list().await
    }

    /// Routes an externally-observed message (e.g. one injected by a test
    /// harness or an out-of-band listener) the same way the reader tasks do.
    pub async fn route(&self, msg: Message, observed_source: &str) -> Result<(), BrokerError> {
        self.router.route(msg, observed_source).await
    }

    pub async fn invoke_rpc(
        &self,
        source: &str,
        target: &str,
        method: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<Message, BrokerError> {
        self.router.invoke_rpc(source, target, method, payload, timeout).await
    }

    pub async fn register_endpoint(&self, pid: &str, endpoint: &str) {
        self.router.register_endpoint(pid, endpoint).await;
    }

    pub async fn endpoints(&self, pid: &str) -> Vec<String> {
        self.router.endpoints(pid).await
    }

    pub async fn all_endpoints(&self) -> HashMap<String, Vec<String>> {
        self.router.all_endpoints().await
    }

    pub fn message_stats(&self) -> &MessageStats {
        &self.stats
    }

    pub fn transports(&self) -> &Arc<TransportRegistry> {
        &self.transports
    }

    /// Cancels the broker context, kills every running process, awaits all
    /// background tasks, then closes every transport.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        if let Some(handle) = self.internal_task.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn duplicate_spawn_keeps_process_count_at_one() {
        let broker = Broker::new(BrokerConfig::default());
        broker.spawn("p1", "/bin/true", vec![]).await.unwrap();
        let err = broker.spawn("p1", "/bin/true", vec![]).await.unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateId(_)));
        assert_eq!(broker.process_count().await, 1);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn broker_local_get_message_count_round_trips() {
        let broker = Broker::new(BrokerConfig::default());
        let response = broker
            .invoke_rpc("caller", "broker", "RPCGetMessageCount", json!({}), Duration::from_secs(1))
            .await;
        // "broker" isn't a transport-routable target; invoke_rpc always goes
        // through sendTo, so calling the local RPC this way returns NotFound --
        // broker-local methods are only reachable via route()'s target="broker"
        // shortcut. route() is exercised directly in router::tests.
        assert!(response.is_err());
        broker.shutdown().await;
    }
}
