//! Unix-domain-socket transport with bounded reconnect.
//!
//! One `SOCK_STREAM` endpoint per child. The server side binds, listens, and
//! accepts the first client; the client side dials. On EOF or a broken
//! connection the transport attempts reconnection up to `max_attempts` times,
//! `delay` apart; exhausting the cap is terminal and reported once via a
//! user-set callback.
//!
//! The read half and write half each sit behind their own async mutex, so a
//! `receive()` parked waiting on the next frame never blocks a concurrent
//! `send()`. Reconnection, which must swap both halves together, takes a
//! dedicated lock so a send-triggered and a receive-triggered reconnect
//! don't race each other.

use crate::error::BrokerError;
use crate::message::Message;
use crate::transport::{ConnectionRole, Transport, TransportState};
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

type ReconnectCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub struct UnixSocketTransport {
    path: PathBuf,
    role: ConnectionRole,
    state: SyncMutex<TransportState>,
    listener: AsyncMutex<Option<UnixListener>>,
    reader: AsyncMutex<Option<BufReader<OwnedReadHalf>>>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    max_attempts: u32,
    delay: Duration,
    attempts_used: AtomicU32,
    exhausted: AtomicBool,
    on_reconnect_exhausted: SyncMutex<Option<ReconnectCallback>>,
    /// Serializes reconnect attempts so a send-triggered and a
    /// receive-triggered reconnect don't race to swap the halves.
    reconnect_lock: AsyncMutex<()>,
}

impl UnixSocketTransport {
    pub fn new(path: PathBuf, role: ConnectionRole, max_attempts: u32, delay: Duration) -> Self {
        Self {
            path,
            role,
            state: SyncMutex::new(TransportState::Uninitialized),
            listener: AsyncMutex::new(None),
            reader: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
            max_attempts,
            delay,
            attempts_used: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
            on_reconnect_exhausted: SyncMutex::new(None),
            reconnect_lock: AsyncMutex::new(()),
        }
    }

    pub fn set_reconnect_exhausted_callback(&self, callback: ReconnectCallback) {
        *self.on_reconnect_exhausted.lock().unwrap() = Some(callback);
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Binds and listens without accepting. Lets the supervisor reserve the
    /// socket path before the child starts, the way a pipe transport must
    /// create its descriptors before `exec`; the blocking accept happens
    /// later, on the first `connect()`/send/receive.
    pub async fn bind_server(&self) -> Result<(), BrokerError> {
        let mut guard = self.listener.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path).map_err(|e| BrokerError::bind_failed(self.path.clone(), e))?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| BrokerError::bind_failed(self.path.clone(), e))?;
        *guard = Some(listener);
        Ok(())
    }

    async fn install_stream(&self, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(BufReader::new(read_half));
        *self.writer.lock().await = Some(write_half);
    }

    async fn dial(&self) -> Result<UnixStream, BrokerError> {
        UnixStream::connect(&self.path)
            .await
            .map_err(|e| BrokerError::ConnectError(self.path.display().to_string(), e.to_string()))
    }

    async fn accept_one(&self) -> Result<UnixStream, BrokerError> {
        let guard = self.listener.lock().await;
        let listener = guard
            .as_ref()
            .ok_or_else(|| BrokerError::ConnectError(self.path.display().to_string(), "no listener".into()))?;
        let (stream, _addr) = listener
            .accept()
            .await
            .map_err(|e| BrokerError::ConnectError(self.path.display().to_string(), e.to_string()))?;
        Ok(stream)
    }

    /// Attempt reconnection, honoring `max_attempts`/`delay`. On exhaustion,
    /// fires the callback once and marks the transport permanently dead.
    async fn reconnect(&self) -> Result<(), BrokerError> {
        if self.exhausted.load(Ordering::Acquire) {
            return Err(BrokerError::ReconnectExhausted(self.path.display().to_string(), self.max_attempts));
        }

        let _guard = self.reconnect_lock.lock().await;
        // Another task may have already reconnected (or exhausted the
        // budget) while we were waiting for this lock.
        if self.exhausted.load(Ordering::Acquire) {
            return Err(BrokerError::ReconnectExhausted(self.path.display().to_string(), self.max_attempts));
        }
        if *self.state.lock().unwrap() == TransportState::Connected {
            return Ok(());
        }

        loop {
            if self.attempts_used.load(Ordering::Acquire) >= self.max_attempts {
                self.exhausted.store(true, Ordering::Release);
                *self.state.lock().unwrap() = TransportState::Disconnected;
                if let Some(cb) = self.on_reconnect_exhausted.lock().unwrap().as_ref() {
                    cb(&self.path.display().to_string());
                }
                return Err(BrokerError::ReconnectExhausted(self.path.display().to_string(), self.max_attempts));
            }
            let attempt_no = self.attempts_used.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(path = %self.path.display(), attempt = attempt_no, "reconnecting unix socket transport");

            let attempt = match self.role {
                ConnectionRole::Server => self.accept_one().await,
                ConnectionRole::Client => self.dial().await,
            };

            match attempt {
                Ok(stream) => {
                    self.install_stream(stream).await;
                    self.attempts_used.store(0, Ordering::Release);
                    *self.state.lock().unwrap() = TransportState::Connected;
                    return Ok(());
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "reconnect attempt failed");
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        if *self.state.get_mut().unwrap() == TransportState::Connected {
            return Ok(());
        }
        match self.role {
            ConnectionRole::Server => {
                self.bind_server().await?;
                let stream = self.accept_one().await?;
                self.install_stream(stream).await;
            }
            ConnectionRole::Client => {
                let stream = self.dial().await?;
                self.install_stream(stream).await;
            }
        }
        *self.state.get_mut().unwrap() = TransportState::Connected;
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<(), BrokerError> {
        if self.exhausted.load(Ordering::Acquire) {
            return Err(BrokerError::ReconnectExhausted(self.path.display().to_string(), self.max_attempts));
        }
        let frame = message.encode()?;
        let result = {
            let mut writer_guard = self.writer.lock().await;
            match writer_guard.as_mut() {
                Some(writer) => writer.write_all(&frame).await,
                None => return Err(BrokerError::ClosedError(self.path.display().to_string())),
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "write failed, attempting reconnect");
                self.reconnect().await?;
                Err(BrokerError::IoError(self.path.display().to_string(), e))
            }
        }
    }

    async fn receive(&self) -> Result<Message, BrokerError> {
        loop {
            if self.exhausted.load(Ordering::Acquire) {
                return Err(BrokerError::ReconnectExhausted(self.path.display().to_string(), self.max_attempts));
            }
            let outcome = {
                let mut reader_guard = self.reader.lock().await;
                match reader_guard.as_mut() {
                    Some(reader) => {
                        let mut line = Vec::new();
                        reader.read_until(b'\n', &mut line).await.map(|n| (n, line))
                    }
                    None => return Err(BrokerError::ClosedError(self.path.display().to_string())),
                }
            };
            match outcome {
                Ok((0, _)) => {
                    self.reconnect().await?;
                    continue;
                }
                Ok((_, mut line)) => {
                    if line.last() == Some(&b'\n') {
                        line.pop();
                    }
                    return Message::decode(&line);
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "read failed, attempting reconnect");
                    self.reconnect().await?;
                }
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        *self.reader.lock().await = None;
        *self.writer.lock().await = None;
        *self.listener.lock().await = None;
        if self.role == ConnectionRole::Server {
            let _ = std::fs::remove_file(&self.path);
        }
        *self.state.lock().unwrap() = TransportState::Disconnected;
        Ok(())
    }

    fn state(&self) -> TransportState {
        *self.state.lock().unwrap()
    }

    fn name(&self) -> &'static str {
        "unix_socket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn server_and_client_exchange_one_message() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.sock");

        let mut server = UnixSocketTransport::new(path.clone(), ConnectionRole::Server, 5, Duration::from_millis(10));
        let server_task = tokio::spawn(async move {
            server.connect().await.unwrap();
            let msg = server.receive().await.unwrap();
            (server, msg)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut client = UnixSocketTransport::new(path, ConnectionRole::Client, 5, Duration::from_millis(10));
        client.connect().await.unwrap();
        client
            .send(&Message::event("ping", json!({"n": 1})))
            .await
            .unwrap();

        let (_server, msg) = server_task.await.unwrap();
        assert_eq!(msg.id, "ping");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test2.sock");
        let t = UnixSocketTransport::new(path, ConnectionRole::Server, 5, Duration::from_millis(10));
        t.close().await.unwrap();
        t.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_does_not_block_behind_a_parked_receive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test3.sock");

        let mut server = UnixSocketTransport::new(path.clone(), ConnectionRole::Server, 5, Duration::from_millis(10));
        server.connect().await.unwrap();
        let server = Arc::new(server);

        let reader_server = server.clone();
        let reader_task = tokio::spawn(async move { reader_server.receive().await });

        // Give the reader task a chance to park inside `receive()` before a
        // concurrent `send()` is attempted on the same transport.
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut client = UnixSocketTransport::new(path, ConnectionRole::Client, 5, Duration::from_millis(10));
        client.connect().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), server.send(&Message::event("ping", json!({}))))
            .await
            .expect("send must not be starved by a parked receive")
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), reader_task).await.unwrap().unwrap();
        assert_eq!(received.unwrap().id, "ping");
    }
}
