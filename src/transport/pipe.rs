//! Anonymous pipe-pair transport.
//!
//! Two pipes are created before the child spawns: one carries broker-to-child
//! traffic, the other child-to-broker. The child receives its read end and
//! write end at fixed descriptor numbers (`BrokerConfig::pipe_read_fd` /
//! `pipe_write_fd`, default 3 and 4) via `dup2` in a `pre_exec` hook, the way
//! a supervisor wires up a subprocess's stdio but targeting arbitrary fds
//! instead of 0/1/2. There is no reconnect: once either half closes, the
//! transport is permanently broken.
//!
//! The read half and write half each sit behind their own async mutex, so a
//! `receive()` parked waiting on the next frame never blocks a concurrent
//! `send()` -- only concurrent sends (or concurrent receives) serialize with
//! each other.

use crate::error::BrokerError;
use crate::message::Message;
use crate::transport::{Transport, TransportState};
use async_trait::async_trait;
use os_pipe::{PipeReader, PipeWriter};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::Mutex as SyncMutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;

/// The child-facing halves of both pipes, handed to the supervisor so it can
/// duplicate them onto fixed descriptor numbers before `exec`.
pub struct PipeChildFds {
    pub child_read_fd: RawFd,
    pub child_write_fd: RawFd,
}

/// Broker-side handle: write to the child, read from the child.
pub struct PipeTransport {
    state: SyncMutex<TransportState>,
    to_child: AsyncMutex<Option<PipeWriter>>,
    from_child: AsyncMutex<Option<BufReader<tokio::fs::File>>>,
}

impl PipeTransport {
    /// Build both pipe pairs. Returns the transport plus the fds the caller
    /// must dup2 into the child before exec; the parent-side fds are closed
    /// automatically once the child has started (the `os_pipe` writer/reader
    /// objects on the parent side are kept, the child-side duplicates are
    /// the only copies passed across fork).
    pub fn new() -> Result<(Self, PipeChildFds), BrokerError> {
        let (child_reads_from_broker, broker_writes_to_child) = os_pipe::pipe()
            .map_err(|e| BrokerError::SpawnError("pipe transport".into(), e))?;
        let (broker_reads_from_child, child_writes_to_broker) = os_pipe::pipe()
            .map_err(|e| BrokerError::SpawnError("pipe transport".into(), e))?;

        let child_fds = PipeChildFds {
            child_read_fd: child_reads_from_broker.as_raw_fd(),
            child_write_fd: child_writes_to_broker.as_raw_fd(),
        };

        // The child-side ends must stay open (not dropped) until after fork,
        // so the supervisor takes raw ownership of them across the pre_exec
        // boundary; leak them here and let dup2 + explicit close handle
        // lifetime on the other side of fork.
        let _ = child_reads_from_broker.into_raw_fd();
        let _ = child_writes_to_broker.into_raw_fd();

        let transport = Self {
            state: SyncMutex::new(TransportState::Uninitialized),
            to_child: AsyncMutex::new(Some(broker_writes_to_child)),
            from_child: AsyncMutex::new(Some(BufReader::new(Self::to_tokio_file(broker_reads_from_child)))),
        };

        Ok((transport, child_fds))
    }

    fn to_tokio_file(reader: PipeReader) -> tokio::fs::File {
        let raw = reader.into_raw_fd();
        let std_file = unsafe { std::fs::File::from_raw_fd(raw) };
        tokio::fs::File::from_std(std_file)
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        *self.state.lock().unwrap() = TransportState::Connected;
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<(), BrokerError> {
        let frame = message.encode()?;
        let mut guard = self.to_child.lock().await;
        let writer = guard.as_mut().ok_or_else(|| BrokerError::ClosedError("pipe".into()))?;
        let mut writer_clone = writer
            .try_clone()
            .map_err(|e| BrokerError::IoError("pipe".into(), e))?;
        // Held across the blocking write (not just the clone) so concurrent
        // sends on this transport still serialize and frames stay intact.
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            writer_clone.write_all(&frame)?;
            writer_clone.flush()
        })
        .await
        .map_err(|e| BrokerError::IoError("pipe".into(), std::io::Error::other(e)))?
        .map_err(|e| BrokerError::IoError("pipe".into(), e))
    }

    async fn receive(&self) -> Result<Message, BrokerError> {
        let mut guard = self.from_child.lock().await;
        let reader = guard.as_mut().ok_or_else(|| BrokerError::ClosedError("pipe".into()))?;
        let mut line = Vec::new();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| BrokerError::IoError("pipe".into(), e))?;
        if n == 0 {
            return Err(BrokerError::ClosedError("pipe".into()));
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        Message::decode(&line)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        *self.to_child.lock().await = None;
        *self.from_child.lock().await = None;
        *self.state.lock().unwrap() = TransportState::Disconnected;
        Ok(())
    }

    fn state(&self) -> TransportState {
        *self.state.lock().unwrap()
    }

    fn name(&self) -> &'static str {
        "pipe"
    }
}
