//! Capability interface for the optional "optimizer" component.
//!
//! The optimizer is an external collaborator (§9 design notes): the broker
//! only ever sees this minimal `offer`/`stop`/`metrics`/`set_logger` surface,
//! never a concrete type. An optimizer that wants to forward a message back
//! into routing holds its own (non-owning) handle to the router rather than
//! the broker holding a strong reference back to it — that would form an
//! ownership cycle between broker and optimizer.

use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;

/// What the reader task does with a message after offering it to the
/// optimizer: `true` means the optimizer consumed it and routing stops;
/// `false` means it was declined and the reader hands it to the router.
///
/// Whether a "route-through" optimizer is expected to eventually re-inject
/// consumed messages back into the router is unresolved upstream (see
/// DESIGN.md); this broker treats `true` as terminal.
#[async_trait]
pub trait Optimizer: Send + Sync {
    /// Offers one message for the optimizer to preempt. Returning `true`
    /// means it has fully handled the message; the reader stops processing it.
    async fn offer(&self, message: &Message) -> bool;

    /// Requests the optimizer release any background resources.
    async fn stop(&self);

    /// A small snapshot of optimizer-internal counters for diagnostics.
    fn metrics(&self) -> serde_json::Value;
}

pub type SharedOptimizer = Arc<dyn Optimizer>;
