//! # Local-host process broker
//!
//! A long-lived supervisor that spawns child processes, owns their
//! bidirectional message channels, and routes structured messages (requests,
//! responses, events, errors) between them and itself.

pub mod ack;
pub mod broker;
pub mod cli;
pub mod config;
pub mod correlation;
pub mod error;
pub mod message;
pub mod optimizer;
pub mod process;
pub mod registry;
pub mod router;
pub mod stats;
pub mod supervisor;
pub mod transport;

pub use ack::{AckBatcher, AckPolicy};
pub use broker::Broker;
pub use config::{BrokerConfig, ChildTransportKind};
pub use error::{BrokerError, BrokerResult};
pub use message::{Message, MessageType};
pub use process::{ProcessRecord, ProcessStatus, RestartPolicy};

/// The current version of the broker crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
