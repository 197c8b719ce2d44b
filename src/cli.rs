//! Command-line argument parsing for the broker demo binary.
//!
//! A thin translation layer: flags in, a [`BrokerConfig`] out. All behavior
//! lives in [`crate::broker::Broker`].

use crate::config::{BrokerConfig, ChildTransportKind};
use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, ValueEnum,
};
use std::path::PathBuf;
use std::time::Duration;

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Local-host process broker -- spawns child processes, owns their
/// transports, and routes structured messages between them.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Directory under which per-process UDS sockets are created.
    #[arg(long, default_value = "/tmp/broker")]
    pub uds_base_path: PathBuf,

    /// Transport used for every RPC-enabled child this broker spawns.
    #[arg(long, value_enum, default_value_t = TransportArg::Pipe)]
    pub transport: TransportArg,

    /// Seconds to wait for a spawned child's `subprocess_ready` event.
    #[arg(long, default_value_t = 5)]
    pub ready_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL when killing a child.
    #[arg(long, default_value_t = 5)]
    pub kill_grace_secs: u64,

    /// Maximum UDS reconnect attempts before giving up on a transport.
    #[arg(long, default_value_t = 5)]
    pub reconnect_max_attempts: u32,

    /// Milliseconds between UDS reconnect attempts.
    #[arg(long, default_value_t = 1000)]
    pub reconnect_delay_ms: u64,

    /// Ring buffer capacity in bytes for the shared-memory transport.
    #[arg(long, default_value_t = 64 * 1024)]
    pub shm_ring_capacity: usize,

    /// Directory to write rolling daily log files to. Logs go to stdout only if unset.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Silence the colorized human-facing stdout log layer.
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Raise the diagnostic log level from info to debug.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Pipe,
    #[value(name = "unix-socket")]
    UnixSocket,
    #[value(name = "shared-memory")]
    SharedMemory,
}

impl From<TransportArg> for ChildTransportKind {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Pipe => ChildTransportKind::Pipe,
            TransportArg::UnixSocket => ChildTransportKind::UnixSocket,
            TransportArg::SharedMemory => ChildTransportKind::SharedMemory,
        }
    }
}

impl From<&Args> for BrokerConfig {
    fn from(args: &Args) -> Self {
        let mut config = BrokerConfig::default();
        config.uds_base_path = args.uds_base_path.clone();
        config.child_transport_kind = args.transport.into();
        config.ready_timeout = Duration::from_secs(args.ready_timeout_secs);
        config.kill_grace = Duration::from_secs(args.kill_grace_secs);
        config.reconnect_max_attempts = args.reconnect_max_attempts;
        config.reconnect_delay = Duration::from_millis(args.reconnect_delay_ms);
        config.shm_ring_capacity = args.shm_ring_capacity;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_translate_into_broker_config() {
        let args = Args {
            uds_base_path: PathBuf::from("/tmp/custom"),
            transport: TransportArg::UnixSocket,
            ready_timeout_secs: 2,
            kill_grace_secs: 3,
            reconnect_max_attempts: 9,
            reconnect_delay_ms: 250,
            shm_ring_capacity: 8192,
            log_dir: None,
            quiet: false,
            verbose: false,
        };
        let config: BrokerConfig = (&args).into();
        assert_eq!(config.uds_base_path, PathBuf::from("/tmp/custom"));
        assert_eq!(config.child_transport_kind, ChildTransportKind::UnixSocket);
        assert_eq!(config.ready_timeout, Duration::from_secs(2));
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
    }
}
