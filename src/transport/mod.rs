//! # Transport abstraction
//!
//! Every child process owns one [`Transport`]: an ordered, framed,
//! bidirectional byte channel. Three variants implement it — an anonymous
//! [`pipe`] pair, a [`unix_socket`] with bounded reconnect, and a
//! [`shared_memory`] ring buffer that falls back to a socket without losing
//! messages. The router and supervisor only ever see the trait object.

pub mod pipe;
pub mod ring;
pub mod shared_memory;
pub mod unix_socket;

pub use pipe::PipeTransport;
pub use shared_memory::HybridTransport;
pub use unix_socket::UnixSocketTransport;

use crate::error::BrokerError;
use crate::message::Message;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Connected,
    Disconnected,
}

/// Contract every transport variant fulfills: ordered, framed, bidirectional.
///
/// `send`/`send` on the same transport preserve per-transport FIFO at the
/// peer. No ordering is defined across different transports.
///
/// `send`/`receive`/`close` take `&self`, not `&mut self`: every variant
/// guards its read half and write half behind independent interior locks,
/// so a `receive()` parked waiting for the next frame -- the steady state
/// for an idle RPC child -- never blocks a concurrent `send()` on the same
/// transport. Only `connect()` runs before the transport is shared across
/// tasks and keeps exclusive access.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&mut self) -> Result<(), BrokerError>;

    async fn send(&self, message: &Message) -> Result<(), BrokerError>;

    async fn receive(&self) -> Result<Message, BrokerError>;

    /// Idempotent: calling `close` on an already-closed transport is a no-op.
    async fn close(&self) -> Result<(), BrokerError>;

    fn state(&self) -> TransportState;

    fn name(&self) -> &'static str;
}
