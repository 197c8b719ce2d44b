//! Hybrid shared-memory transport with lossless socket fallback.
//!
//! Primary path: two SPSC rings (one per direction) backed by anonymous
//! shared-memory segments, set up through a companion Unix-domain socket
//! that exchanges the segment names. On any ring fault the transport drains
//! whatever is left in the ring into an in-memory pending queue and
//! transitions permanently to using the companion socket as a plain framed
//! transport — `receive()` always drains `pending` before touching the
//! socket, so message order survives the fallback.
//!
//! The read path (`recv_ring`/`recv_accumulator`/`pending`/`socket_reader`)
//! and the write path (`send_ring`/`socket_writer`) each sit behind their
//! own async mutex, so a `receive()` parked polling the ring never blocks a
//! concurrent `send()`. `switch_to_socket` takes the read lock first and
//! checks-and-sets `ring_state` inside that same critical section, so a
//! send-triggered and a receive-triggered fallback can't double-drain the
//! ring.

use crate::error::BrokerError;
use crate::message::{extract_frames, Message};
use crate::transport::ring::{normalize_capacity, RingBuffer, RingError};
use crate::transport::{ConnectionRole, Transport, TransportState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex as SyncMutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingState {
    ActiveShm,
    ActiveSock,
}

#[derive(Serialize, Deserialize)]
struct RingHandshake {
    /// Ring the server writes to / the client reads from.
    server_to_client: String,
    /// Ring the client writes to / the server reads from.
    client_to_server: String,
}

struct ReadSide {
    recv_ring: Option<RingBuffer>,
    socket_reader: Option<BufReader<tokio::net::unix::OwnedReadHalf>>,
    recv_accumulator: Vec<u8>,
    pending: VecDeque<Message>,
}

pub struct HybridTransport {
    process_id: String,
    socket_path: PathBuf,
    role: ConnectionRole,
    ring_capacity: usize,
    transport_state: SyncMutex<TransportState>,
    ring_state: SyncMutex<RingState>,

    listener: SyncMutex<Option<UnixListener>>,
    socket_writer: AsyncMutex<Option<tokio::net::unix::OwnedWriteHalf>>,
    send_ring: AsyncMutex<Option<RingBuffer>>,

    read_side: AsyncMutex<ReadSide>,
}

impl HybridTransport {
    pub fn new(process_id: impl Into<String>, socket_path: PathBuf, role: ConnectionRole, ring_capacity: usize) -> Self {
        Self {
            process_id: process_id.into(),
            socket_path,
            role,
            ring_capacity: normalize_capacity(ring_capacity),
            transport_state: SyncMutex::new(TransportState::Uninitialized),
            ring_state: SyncMutex::new(RingState::ActiveShm),
            listener: SyncMutex::new(None),
            socket_writer: AsyncMutex::new(None),
            send_ring: AsyncMutex::new(None),
            read_side: AsyncMutex::new(ReadSide {
                recv_ring: None,
                socket_reader: None,
                recv_accumulator: Vec::new(),
                pending: VecDeque::new(),
            }),
        }
    }

    pub async fn has_pending(&self) -> bool {
        !self.read_side.lock().await.pending.is_empty()
    }

    pub fn is_shm_active(&self) -> bool {
        *self.ring_state.lock().unwrap() == RingState::ActiveShm
    }

    async fn handshake_server(&mut self) -> Result<RingHandshake, BrokerError> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| BrokerError::bind_failed(self.socket_path.clone(), e))?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| BrokerError::bind_failed(self.socket_path.clone(), e))?;
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| BrokerError::ConnectError(self.socket_path.display().to_string(), e.to_string()))?;
        *self.listener.get_mut().unwrap() = Some(listener);

        let handshake = RingHandshake {
            server_to_client: format!("broker-shm-{}-s2c", self.process_id),
            client_to_server: format!("broker-shm-{}-c2s", self.process_id),
        };
        let (read_half, mut write_half) = stream.into_split();
        let mut line = serde_json::to_vec(&handshake).map_err(|e| BrokerError::DecodeError(e.to_string()))?;
        line.push(b'\n');
        write_half
            .write_all(&line)
            .await
            .map_err(|e| BrokerError::IoError(self.socket_path.display().to_string(), e))?;

        self.read_side.get_mut().socket_reader = Some(BufReader::new(read_half));
        *self.socket_writer.get_mut() = Some(write_half);
        Ok(handshake)
    }

    async fn handshake_client(&mut self) -> Result<RingHandshake, BrokerError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| BrokerError::ConnectError(self.socket_path.display().to_string(), e.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = Vec::new();
        reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| BrokerError::IoError(self.socket_path.display().to_string(), e))?;
        let handshake: RingHandshake =
            serde_json::from_slice(&line).map_err(|e| BrokerError::DecodeError(e.to_string()))?;

        self.read_side.get_mut().socket_reader = Some(reader);
        *self.socket_writer.get_mut() = Some(write_half);
        Ok(handshake)
    }

    fn setup_rings(&mut self, handshake: &RingHandshake) {
        let (send_id, recv_id) = match self.role {
            ConnectionRole::Server => (&handshake.server_to_client, &handshake.client_to_server),
            ConnectionRole::Client => (&handshake.client_to_server, &handshake.server_to_client),
        };

        let send_ring = match self.role {
            ConnectionRole::Server => RingBuffer::create(send_id, self.ring_capacity),
            ConnectionRole::Client => RingBuffer::open(send_id),
        };
        let recv_ring = match self.role {
            ConnectionRole::Server => RingBuffer::create(recv_id, self.ring_capacity),
            ConnectionRole::Client => RingBuffer::open(recv_id),
        };

        match (send_ring, recv_ring) {
            (Ok(s), Ok(r)) => {
                *self.send_ring.get_mut() = Some(s);
                self.read_side.get_mut().recv_ring = Some(r);
                *self.ring_state.get_mut().unwrap() = RingState::ActiveShm;
                debug!(process_id = %self.process_id, "shared-memory ring established");
            }
            (send, recv) => {
                if let Err(e) = &send {
                    warn!(process_id = %self.process_id, error = %e, "send ring setup failed");
                }
                if let Err(e) = &recv {
                    warn!(process_id = %self.process_id, error = %e, "recv ring setup failed");
                }
                *self.ring_state.get_mut().unwrap() = RingState::ActiveSock;
            }
        }
    }

    /// Drains whatever is left in the ring (plus any partially-accumulated
    /// bytes already pulled off it) into `pending`, then permanently
    /// switches to the companion socket. Idempotent past the first call.
    ///
    /// Takes `read_side` first and does the check-and-set of `ring_state`
    /// inside that critical section, so a concurrent `send()`-triggered and
    /// `receive()`-triggered fallback can't both drain the ring.
    pub async fn switch_to_socket(&self) {
        let mut read_side = self.read_side.lock().await;
        {
            let mut ring_state = self.ring_state.lock().unwrap();
            if *ring_state == RingState::ActiveSock {
                return;
            }
            *ring_state = RingState::ActiveSock;
        }

        if let Some(ring) = &read_side.recv_ring {
            let drained = ring.drain_all();
            read_side.recv_accumulator.extend(drained);
        }
        let frames = extract_frames(&mut read_side.recv_accumulator);
        for frame in frames {
            match Message::decode(&frame) {
                Ok(msg) => read_side.pending.push_back(msg),
                Err(e) => warn!(process_id = %self.process_id, error = %e, "dropping malformed frame during ring drain"),
            }
        }
        if !read_side.recv_accumulator.is_empty() {
            warn!(
                process_id = %self.process_id,
                bytes = read_side.recv_accumulator.len(),
                "discarding incomplete trailing frame on ring fallback"
            );
            read_side.recv_accumulator.clear();
        }
        read_side.recv_ring = None;
        drop(read_side);

        *self.send_ring.lock().await = None;
    }

    async fn send_socket(&self, message: &Message) -> Result<(), BrokerError> {
        let mut writer_guard = self.socket_writer.lock().await;
        let writer = writer_guard
            .as_mut()
            .ok_or_else(|| BrokerError::ClosedError(self.socket_path.display().to_string()))?;
        let frame = message.encode()?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| BrokerError::IoError(self.socket_path.display().to_string(), e))
    }

    async fn receive_socket(&self, read_side: &mut ReadSide) -> Result<Message, BrokerError> {
        let reader = read_side
            .socket_reader
            .as_mut()
            .ok_or_else(|| BrokerError::ClosedError(self.socket_path.display().to_string()))?;
        let mut line = Vec::new();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| BrokerError::IoError(self.socket_path.display().to_string(), e))?;
        if n == 0 {
            return Err(BrokerError::ClosedError(self.socket_path.display().to_string()));
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        Message::decode(&line)
    }
}

#[async_trait]
impl Transport for HybridTransport {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        if *self.transport_state.get_mut().unwrap() == TransportState::Connected {
            return Ok(());
        }
        let handshake = match self.role {
            ConnectionRole::Server => self.handshake_server().await?,
            ConnectionRole::Client => self.handshake_client().await?,
        };
        self.setup_rings(&handshake);
        *self.transport_state.get_mut().unwrap() = TransportState::Connected;
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<(), BrokerError> {
        if *self.ring_state.lock().unwrap() == RingState::ActiveSock {
            return self.send_socket(message).await;
        }

        let frame = message.encode()?;
        let write_result = {
            let guard = self.send_ring.lock().await;
            guard.as_ref().map(|ring| ring.write_bytes(&frame)).unwrap_or(Err(RingError::Full))
        };

        match write_result {
            Ok(()) => Ok(()),
            Err(RingError::Full) => {
                debug!(process_id = %self.process_id, "ring full, falling back to socket");
                self.switch_to_socket().await;
                self.send_socket(message).await
            }
            Err(e) => {
                warn!(process_id = %self.process_id, error = %e, "ring write error, falling back to socket");
                self.switch_to_socket().await;
                self.send_socket(message).await
            }
        }
    }

    async fn receive(&self) -> Result<Message, BrokerError> {
        {
            let mut read_side = self.read_side.lock().await;
            if let Some(msg) = read_side.pending.pop_front() {
                return Ok(msg);
            }
        }

        if *self.ring_state.lock().unwrap() == RingState::ActiveSock {
            let mut read_side = self.read_side.lock().await;
            return self.receive_socket(&mut read_side).await;
        }

        loop {
            let mut read_side = self.read_side.lock().await;
            let frames = extract_frames(&mut read_side.recv_accumulator);
            if !frames.is_empty() {
                let mut iter = frames.into_iter();
                let first = iter.next().unwrap();
                for rest in iter {
                    read_side.pending.push_back(Message::decode(&rest)?);
                }
                return Message::decode(&first);
            }

            let chunk = match &read_side.recv_ring {
                Some(ring) => ring.read_chunk(4096),
                None => Err(RingError::Full),
            };
            match chunk {
                Ok(bytes) => {
                    read_side.recv_accumulator.extend(bytes);
                }
                Err(RingError::InsufficientData) => {
                    // Drop the lock before sleeping so a concurrent `send()`
                    // (or a fallback-triggering `switch_to_socket`) isn't
                    // blocked behind this poll loop.
                    drop(read_side);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
                Err(e) => {
                    warn!(process_id = %self.process_id, error = %e, "ring read error, falling back to socket");
                    drop(read_side);
                    self.switch_to_socket().await;
                    let mut read_side = self.read_side.lock().await;
                    return self.receive_socket(&mut read_side).await;
                }
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if *self.transport_state.lock().unwrap() == TransportState::Disconnected {
            return Ok(());
        }
        {
            let mut read_side = self.read_side.lock().await;
            read_side.socket_reader = None;
            read_side.recv_ring = None;
        }
        *self.socket_writer.lock().await = None;
        *self.listener.lock().unwrap() = None;
        *self.send_ring.lock().await = None;
        if self.role == ConnectionRole::Server {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        *self.transport_state.lock().unwrap() = TransportState::Disconnected;
        Ok(())
    }

    fn state(&self) -> TransportState {
        *self.transport_state.lock().unwrap()
    }

    fn name(&self) -> &'static str {
        match *self.ring_state.lock().unwrap() {
            RingState::ActiveShm => "shared_memory",
            RingState::ActiveSock => "shared_memory(fallback=socket)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn ring_handshake_round_trips_one_message() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hybrid.sock");
        let pid = format!("test-{}", uuid::Uuid::new_v4());

        let mut server = HybridTransport::new(pid.clone(), path.clone(), ConnectionRole::Server, normalize_capacity(4096));
        let server_task = tokio::spawn(async move {
            server.connect().await.unwrap();
            let msg = server.receive().await.unwrap();
            (server, msg)
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let mut client = HybridTransport::new(pid, path, ConnectionRole::Client, normalize_capacity(4096));
        client.connect().await.unwrap();
        assert!(client.is_shm_active());
        client.send(&Message::event("ping", json!({"n": 1}))).await.unwrap();

        let (server, msg) = server_task.await.unwrap();
        assert_eq!(msg.id, "ping");
        assert!(server.is_shm_active());
    }

    #[tokio::test]
    async fn fallback_delivers_pending_before_socket_messages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hybrid2.sock");
        let pid = format!("test-{}", uuid::Uuid::new_v4());

        let mut server = HybridTransport::new(pid.clone(), path.clone(), ConnectionRole::Server, normalize_capacity(65536));
        let mut client = HybridTransport::new(pid, path, ConnectionRole::Client, normalize_capacity(65536));

        let server_task = tokio::spawn(async move {
            server.connect().await.unwrap();
            server
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        client.connect().await.unwrap();
        let server = server_task.await.unwrap();

        for i in 0..3 {
            client.send(&Message::event("shm-msg", json!({"i": i}))).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Pull the bytes onto the server's accumulator, then force fallback.
        let _ = server.receive().await.unwrap();
        server.switch_to_socket().await;
        assert!(server.has_pending().await);

        client.switch_to_socket().await;
        client
            .send(&Message::event("sock-msg", json!({"i": 99})))
            .await
            .unwrap();

        let second = server.receive().await.unwrap();
        assert_eq!(second.payload["i"], 1);
        let third = server.receive().await.unwrap();
        assert_eq!(third.payload["i"], 2);
        assert!(!server.has_pending().await);
        let fourth = server.receive().await.unwrap();
        assert_eq!(fourth.id, "sock-msg");
    }
}
