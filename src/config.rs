//! Ambient configuration. The core never parses a config file itself; this
//! struct is the whole surface a caller (the demo binary's `cli.rs`, or an
//! embedding application) fills in before constructing a broker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// How a spawned RPC child's transport is established. A child is wired for
/// exactly one of these -- §9 treats requesting more than one as a
/// configuration-validation error rather than a "dual-mode" transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildTransportKind {
    /// Two anonymous pipes, descriptor-inherited at fixed fd numbers.
    Pipe,
    /// A UDS at a deterministic `{base}_{pid}.sock` path.
    UnixSocket,
    /// The shared-memory ring, falling back to the same UDS path on fault.
    SharedMemory,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Directory under which `registerUdsTransport` creates `{base}_{pid}.sock`.
    pub uds_base_path: PathBuf,
    /// Transport variant used for every RPC-enabled child this broker spawns.
    pub child_transport_kind: ChildTransportKind,
    /// File descriptor number a pipe-transport child reads its requests on.
    pub pipe_read_fd: i32,
    /// File descriptor number a pipe-transport child writes its responses on.
    pub pipe_write_fd: i32,
    /// How long `spawnWithReady` waits for `subprocess_ready` before warning.
    pub ready_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL on `kill`.
    pub kill_grace: Duration,
    /// Maximum UDS reconnect attempts before `ReconnectExhausted`.
    pub reconnect_max_attempts: u32,
    /// Delay between UDS reconnect attempts.
    pub reconnect_delay: Duration,
    /// Ring buffer capacity for the hybrid shared-memory transport.
    pub shm_ring_capacity: usize,
    /// Extra environment variables injected per known process id.
    pub extra_env: HashMap<String, HashMap<String, String>>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uds_base_path: PathBuf::from("/tmp/broker"),
            child_transport_kind: ChildTransportKind::Pipe,
            pipe_read_fd: 3,
            pipe_write_fd: 4,
            ready_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
            reconnect_max_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            shm_ring_capacity: 64 * 1024,
            extra_env: HashMap::new(),
        }
    }
}

impl BrokerConfig {
    pub fn uds_socket_path(&self, process_id: &str) -> PathBuf {
        self.uds_base_path.join(format!("{process_id}.sock"))
    }

    pub fn env_for(&self, process_id: &str) -> Option<&HashMap<String, String>> {
        self.extra_env.get(process_id)
    }
}
