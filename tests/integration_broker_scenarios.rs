//! Black-box scenarios against the public `Broker` API, using the
//! `echo_child` test fixture binary as the RPC-enabled child.

use procbroker::config::BrokerConfig;
use procbroker::error::BrokerError;
use procbroker::message::{Message, MessageType};
use procbroker::process::ProcessStatus;
use procbroker::transport::{ConnectionRole, Transport, TransportState};
use procbroker::Broker;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

fn echo_child_path() -> &'static str {
    env!("CARGO_BIN_EXE_echo_child")
}

#[tokio::test]
async fn basic_rpc_round_trip_through_pipe_transport() {
    let broker = Broker::new(BrokerConfig::default());
    broker
        .spawn_rpc("child1", echo_child_path(), vec!["pipe".to_string()])
        .await
        .unwrap();

    let response = broker
        .invoke_rpc("harness", "child1", "echo", json!({"value": 42}), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(response.kind, MessageType::Response);
    assert_eq!(response.payload["value"], 42);
    broker.shutdown().await;
}

#[tokio::test]
async fn duplicate_spawn_is_rejected_and_leaves_original_running() {
    let broker = Broker::new(BrokerConfig::default());
    broker.spawn("sleepy", "/bin/sleep", vec!["5".to_string()]).await.unwrap();

    let err = broker.spawn("sleepy", "/bin/sleep", vec!["5".to_string()]).await.unwrap_err();
    assert!(matches!(err, BrokerError::DuplicateId(_)));

    let record = broker.get_process("sleepy").await.unwrap();
    assert_eq!(record.status, ProcessStatus::Running);
    broker.shutdown().await;
}

#[tokio::test]
async fn rpc_request_to_unresponsive_child_times_out() {
    let mut config = BrokerConfig::default();
    let mut env = HashMap::new();
    env.insert("BROKER_CHILD_MUTE".to_string(), "1".to_string());
    config.extra_env.insert("mute".to_string(), env);

    let broker = Broker::new(config);
    broker
        .spawn_rpc("mute", echo_child_path(), vec!["pipe".to_string()])
        .await
        .unwrap();

    let err = broker
        .invoke_rpc("harness", "mute", "echo", json!({}), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Timeout(_)));
    broker.shutdown().await;
}

#[tokio::test]
async fn auto_restart_preserves_restart_count_up_to_the_limit() {
    let broker = Broker::new(BrokerConfig::default());
    broker
        .spawn_with_restart("flaky", "sh", vec!["-c".to_string(), "exit 7".to_string()], 2)
        .await
        .unwrap();

    // Each exit->restart cycle takes at least the reaper's 1s restart delay;
    // two restarts plus slack comfortably fits in 5s.
    tokio::time::sleep(Duration::from_secs(5)).await;

    let record = broker.get_process("flaky").await.unwrap();
    assert_eq!(record.status, ProcessStatus::Exited);
    let policy = record.restart_policy.unwrap();
    assert_eq!(policy.restart_count, 2);
    assert!(!policy.may_restart());
    broker.shutdown().await;
}

#[tokio::test]
async fn broker_local_rpc_reports_message_count_to_registered_transport() {
    use tokio::sync::mpsc;

    struct CapturingTransport(mpsc::UnboundedSender<Message>);

    #[async_trait::async_trait]
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

    let broker = Broker::new(BrokerConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    broker.transports().register("caller", Box::new(CapturingTransport(tx))).await;

    let mut request = Message::request("RPCGetMessageCount", "broker", json!({}));
    request.source = "caller".to_string();
    request.correlation_id = "integration-probe".to_string();
    broker.route(request, "caller").await.unwrap();

    let response = rx.recv().await.unwrap();
    assert_eq!(response.kind, MessageType::Response);
    assert_eq!(response.target, "caller");
    assert_eq!(response.correlation_id, "integration-probe");
    assert!(response.payload["count"].is_number());
    broker.shutdown().await;
}

#[tokio::test]
async fn shared_memory_transport_falls_back_to_socket_without_losing_messages() {
    use procbroker::transport::shared_memory::HybridTransport;
    use tempfile::tempdir;

    let dir = tempdir().unwrap();
    let path = dir.path().join("fallback.sock");
    let pid = format!("integration-{}", std::process::id());

    let mut server = HybridTransport::new(pid.clone(), path.clone(), ConnectionRole::Server, 65536);
    let mut client = HybridTransport::new(pid, path, ConnectionRole::Client, 65536);

    let server_task = tokio::spawn(async move {
        server.connect().await.unwrap();
        server
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.connect().await.unwrap();
    let mut server = server_task.await.unwrap();

    for i in 0..3 {
        client.send(&Message::event("shm", json!({"i": i}))).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let first = server.receive().await.unwrap();
    assert_eq!(first.payload["i"], 0);
    server.switch_to_socket().await;
    client.switch_to_socket().await;
    client.send(&Message::event("sock", json!({"i": 99}))).await.unwrap();

    let second = server.receive().await.unwrap();
    assert_eq!(second.payload["i"], 1);
    let third = server.receive().await.unwrap();
    assert_eq!(third.payload["i"], 2);
    let fourth = server.receive().await.unwrap();
    assert_eq!(fourth.id, "sock");
}
