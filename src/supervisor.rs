//! Supervisor: spawns and reaps child processes, owns their transports for
//! RPC-enabled children, and drives auto-restart.

use crate::config::{BrokerConfig, ChildTransportKind};
use crate::error::BrokerError;
use crate::message::{Message, MessageType};
use crate::optimizer::SharedOptimizer;
use crate::process::{ProcessRecord, ProcessStatus, RestartPolicy};
use crate::registry::TransportRegistry;
use crate::router::Router;
use crate::transport::pipe::PipeTransport;
use crate::transport::shared_memory::HybridTransport;
use crate::transport::unix_socket::UnixSocketTransport;
use crate::transport::{ConnectionRole, Transport};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const BROKER_PASSING_RPC_FDS_ENV: &str = "BROKER_PASSING_RPC_FDS";
const READY_EVENT_ID: &str = "subprocess_ready";
const REAPER_RESTART_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

pub struct SpawnOptions {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub rpc: bool,
    pub restart_max: Option<i64>,
    pub wait_ready: bool,
    /// Carries a restart policy snapshot (with its already-incremented
    /// `restart_count`) through a restart-triggered respawn, so the record
    /// `spawn()` inserts has the correct count from the moment it becomes
    /// visible in the registry instead of being patched in afterward.
    pub initial_restart_policy: Option<RestartPolicy>,
}

impl SpawnOptions {
    pub fn plain(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args,
            rpc: false,
            restart_max: None,
            wait_ready: false,
            initial_restart_policy: None,
        }
    }

    pub fn rpc(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            rpc: true,
            ..Self::plain(id, command, args)
        }
    }

    pub fn with_restart(mut self, max_restarts: i64) -> Self {
        self.restart_max = Some(max_restarts);
        self
    }

    pub fn with_ready_wait(mut self) -> Self {
        self.wait_ready = true;
        self
    }

    /// Used by the reaper to respawn with the policy's restart count already
    /// advanced, rather than letting `spawn()` build a fresh count-0 policy.
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_max = Some(policy.max_restarts);
        self.initial_restart_policy = Some(policy);
        self
    }
}

struct ChildHandle {
    exited: Arc<Notify>,
    kill_pid: i32,
}

pub struct Supervisor {
    config: BrokerConfig,
    registry: RwLock<HashMap<String, ProcessRecord>>,
    transports: Arc<TransportRegistry>,
    router: Arc<Router>,
    optimizer: RwLock<Option<SharedOptimizer>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ready_waiters: Mutex<HashMap<String, oneshot::Sender<()>>>,
    children: Mutex<HashMap<String, ChildHandle>>,
}

impl Supervisor {
    pub fn new(config: BrokerConfig, transports: Arc<TransportRegistry>, router: Arc<Router>) -> Arc<Self> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Arc::new(Self {
            config,
            registry: RwLock::new(HashMap::new()),
            transports,
            router,
            optimizer: RwLock::new(None),
            cancel_tx,
            cancel_rx,
            tasks: Mutex::new(Vec::new()),
            ready_waiters: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
        })
    }

    pub async fn set_optimizer(&self, optimizer: SharedOptimizer) {
        *self.optimizer.write().await = Some(optimizer);
    }

    pub async fn process_count(&self) -> usize {
        self.registry.read().await.len()
    }

    pub async fn get(&self, id: &str) -> Option<ProcessRecord> {
        self.registry.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<ProcessRecord> {
        self.registry.read().await.values().cloned().collect()
    }

    fn env_for(&self, id: &str, rpc: bool) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if rpc && self.config.child_transport_kind == ChildTransportKind::Pipe {
            env.push((BROKER_PASSING_RPC_FDS_ENV.to_string(), "1".to_string()));
        }
        if let Some(extra) = self.config.env_for(id) {
            for (k, v) in extra {
                env.push((k.clone(), v.clone()));
            }
        }
        env
    }

    /// Shared spawn sequence for every variant in §4.D: duplicate-id check,
    /// transport construction (if RPC), process start, registration, then
    /// the reader/reaper background tasks.
    pub async fn spawn(self: &Arc<Self>, opts: SpawnOptions) -> Result<ProcessRecord, BrokerError> {
        {
            let registry = self.registry.read().await;
            if registry.contains_key(&opts.id) {
                return Err(BrokerError::DuplicateId(opts.id.clone()));
            }
        }

        let mut command = Command::new(&opts.command);
        command.args(&opts.args).stdin(Stdio::null()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
        for (k, v) in self.env_for(&opts.id, opts.rpc) {
            command.env(k, v);
        }

        let transport: Option<Box<dyn Transport>> = if opts.rpc {
            match self.config.child_transport_kind {
                ChildTransportKind::Pipe => {
                    let (transport, child_fds) = PipeTransport::new()?;
                    let read_fd = self.config.pipe_read_fd;
                    let write_fd = self.config.pipe_write_fd;
                    unsafe {
                        command.pre_exec(move || {
                            if libc::dup2(child_fds.child_read_fd, read_fd) < 0 {
                                return Err(std::io::Error::last_os_error());
                            }
                            if libc::dup2(child_fds.child_write_fd, write_fd) < 0 {
                                return Err(std::io::Error::last_os_error());
                            }
                            Ok(())
                        });
                    }
                    Some(Box::new(transport))
                }
                ChildTransportKind::UnixSocket => {
                    let path = self.config.uds_socket_path(&opts.id);
                    let transport = UnixSocketTransport::new(
                        path,
                        ConnectionRole::Server,
                        self.config.reconnect_max_attempts,
                        self.config.reconnect_delay,
                    );
                    transport.bind_server().await?;
                    Some(Box::new(transport))
                }
                ChildTransportKind::SharedMemory => {
                    let path = self.config.uds_socket_path(&opts.id);
                    let transport = HybridTransport::new(opts.id.clone(), path, ConnectionRole::Server, self.config.shm_ring_capacity);
                    Some(Box::new(transport))
                }
            }
        } else {
            None
        };

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(process_id = %opts.id, error = %e, "spawn failed");
                if let Some(transport) = transport {
                    if let Err(close_err) = transport.close().await {
                        warn!(process_id = %opts.id, error = %close_err, "failed to release transport after spawn failure");
                    }
                }
                return Ok(ProcessRecord::failed(opts.id, opts.command, opts.args));
            }
        };

        let pid = child.id().unwrap_or(0);
        let mut record = ProcessRecord::new(opts.id.clone(), pid, opts.command.clone(), opts.args.clone(), opts.rpc);
        record.restart_policy = match opts.initial_restart_policy {
            Some(policy) => Some(policy),
            None => opts
                .restart_max
                .map(|max_restarts| RestartPolicy::new(max_restarts, opts.command.clone(), opts.args.clone(), opts.rpc)),
        };

        {
            let mut registry = self.registry.write().await;
            registry.insert(opts.id.clone(), record.clone());
        }

        if let Some(mut transport) = transport {
            if let Err(e) = transport.connect().await {
                warn!(process_id = %opts.id, error = %e, "transport connect failed after spawn");
            }
            self.transports.register(&opts.id, transport).await;
        }

        let exited = Arc::new(Notify::new());
        self.children.lock().await.insert(
            opts.id.clone(),
            ChildHandle {
                exited: exited.clone(),
                kill_pid: pid as i32,
            },
        );

        self.spawn_reader_task(opts.id.clone()).await;
        self.spawn_reaper_task(opts.id.clone(), pid, child, exited).await;

        if opts.rpc && opts.wait_ready {
            self.await_ready(&opts.id).await;
        }

        Ok(record)
    }

    async fn await_ready(&self, id: &str) {
        let (tx, rx) = oneshot::channel();
        self.ready_waiters.lock().await.insert(id.to_string(), tx);
        match tokio::time::timeout(self.config.ready_timeout, rx).await {
            Ok(Ok(())) => debug!(process_id = id, "subprocess_ready observed"),
            _ => warn!(process_id = id, "timed out waiting for subprocess_ready"),
        }
        self.ready_waiters.lock().await.remove(id);
    }

    async fn spawn_reader_task(self: &Arc<Self>, id: String) {
        let this = Arc::clone(self);
        let mut cancel_rx = self.cancel_rx.clone();
        let handle = tokio::spawn(async move {
            loop {
                let transport = match this.transports.get(&id).await {
                    Ok(t) => t,
                    Err(_) => break,
                };
                let received = tokio::select! {
                    _ = cancel_rx.changed() => None,
                    result = transport.receive() => Some(result),
                };
                let message = match received {
                    None => break,
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!(process_id = %id, error = %e, "reader task ending");
                        break;
                    }
                };

                if message.kind == MessageType::Event && message.id == READY_EVENT_ID {
                    if let Some(tx) = this.ready_waiters.lock().await.remove(&id) {
                        let _ = tx.send(());
                    }
                }

                let optimizer = this.optimizer.read().await.clone();
                if let Some(optimizer) = optimizer {
                    if optimizer.offer(&message).await {
                        continue;
                    }
                }

                let had_correlation = !message.correlation_id.is_empty();
                let original = message.clone();
                if let Err(e) = this.router.route(message, &id).await {
                    warn!(process_id = %id, error = %e, "routing failed");
                    if had_correlation {
                        this.router.reply_with_error(&original, e.to_string()).await;
                    }
                }
            }
            info!(process_id = %id, "reader task exited");
        });
        self.tasks.lock().await.push(handle);
    }

    async fn spawn_reaper_task(self: &Arc<Self>, id: String, pid: u32, mut child: tokio::process::Child, exited: Arc<Notify>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let exit_status = child.wait().await;
            let exit_code = exit_status.ok().and_then(|s| s.code());
            let end_time = SystemTime::now();

            let restart_attempt = {
                let mut registry = this.registry.write().await;
                if let Some(record) = registry.get_mut(&id) {
                    record.status = ProcessStatus::Exited;
                    record.exit_code = exit_code;
                    record.end_time = Some(end_time);
                }
                registry.get(&id).and_then(|r| r.restart_policy.clone())
            };

            exited.notify_waiters();

            let payload = serde_json::json!({ "id": id, "pid": pid, "exit_code": exit_code });
            if let Err(e) = this.router.route(Message::event("process_exited", payload), "broker").await {
                debug!(process_id = %id, error = %e, "failed to publish process_exited event");
            }

            this.transports.unregister(&id).await;
            this.children.lock().await.remove(&id);

            if let Some(policy) = restart_attempt {
                if policy.may_restart() && !*this.cancel_rx.borrow() {
                    let next = policy.next_attempt();
                    this.registry.write().await.remove(&id);
                    tokio::time::sleep(REAPER_RESTART_DELAY).await;
                    let opts = if next.is_rpc {
                        SpawnOptions::rpc(id.clone(), next.command.clone(), next.args.clone())
                    } else {
                        SpawnOptions::plain(id.clone(), next.command.clone(), next.args.clone())
                    }
                    .with_restart_policy(next);
                    if let Err(e) = this.spawn(opts).await {
                        error!(process_id = %id, error = %e, "restart attempt failed");
                    }
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }

    /// SIGTERM, then SIGKILL if the reaper hasn't observed exit within
    /// `kill_grace`. Always waits for the reaper before returning.
    pub async fn kill(&self, id: &str) -> Result<(), BrokerError> {
        let pid = {
            let children = self.children.lock().await;
            let handle = children.get(id).ok_or_else(|| BrokerError::NotFound(id.to_string()))?;
            (handle.kill_pid, handle.exited.clone())
        };
        let (pid, exited) = pid;
        send_signal(pid, libc::SIGTERM);

        let observed = tokio::time::timeout(self.config.kill_grace, exited.notified()).await;
        if observed.is_err() {
            warn!(process_id = id, "kill grace elapsed, sending SIGKILL");
            send_signal(pid, libc::SIGKILL);
            exited.notified().await;
        }
        Ok(())
    }

    /// Cancels the broker context, kills every running process, awaits all
    /// background tasks, then closes every transport -- in that order, so no
    /// task ever touches an already-closed fd.
    pub async fn shutdown(&self) {
        let _ = self.cancel_tx.send(true);

        let running_ids: Vec<String> = {
            let registry = self.registry.read().await;
            registry
                .iter()
                .filter(|(_, record)| record.status == ProcessStatus::Running)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in running_ids {
            if let Err(e) = self.kill(&id).await {
                debug!(process_id = %id, error = %e, "kill during shutdown failed");
            }
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.transports.close_all().await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }
}

fn send_signal(pid: i32, signal: i32) {
    unsafe {
        libc::kill(pid, signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationTable;
    use crate::stats::MessageStats;

    fn new_supervisor() -> Arc<Supervisor> {
        let config = BrokerConfig::default();
        let transports = TransportRegistry::new();
        let correlation = CorrelationTable::new();
        let stats = Arc::new(MessageStats::new());
        let (router, _rx) = Router::new(correlation, transports.clone(), stats);
        Supervisor::new(config, transports, router)
    }

    #[tokio::test]
    async fn duplicate_spawn_is_rejected() {
        let supervisor = new_supervisor();
        let r1 = supervisor.spawn(SpawnOptions::plain("p1", "/bin/true", vec![])).await.unwrap();
        assert_eq!(r1.status, ProcessStatus::Running);
        let err = supervisor.spawn(SpawnOptions::plain("p1", "/bin/true", vec![])).await.unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateId(_)));
        assert_eq!(supervisor.process_count().await, 1);
    }

    #[tokio::test]
    async fn spawn_failure_marks_record_failed() {
        let supervisor = new_supervisor();
        let record = supervisor
            .spawn(SpawnOptions::plain("bad", "/nonexistent/binary/path", vec![]))
            .await
            .unwrap();
        assert_eq!(record.status, ProcessStatus::Failed);
    }
}
