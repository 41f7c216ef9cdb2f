//! One live TCP link: a reader task that decodes frames into events, and a single serialized writer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nearby_core::wire::{self, LEN_SIZE};
use nearby_core::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::error::LinkError;

pub type ConnectionId = u64;

/// A peer that accepts no bytes for this long is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a connection stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Remote closed the stream at a frame boundary.
    Remote,
    Malformed,
    Io,
    /// `close()` was called on this side.
    Local,
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Message {
        conn: ConnectionId,
        peer_id: String,
        message: Message,
    },
    /// Sent exactly once per connection.
    Closed {
        conn: ConnectionId,
        peer_id: String,
        reason: CloseReason,
    },
}

/// Read exactly one frame. `Ok(None)` when the stream ends cleanly before a new frame starts.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>, LinkError> {
    let mut header = [0u8; LEN_SIZE];
    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut header[1..])
        .await
        .map_err(mid_frame)?;
    let len = wire::frame_len(header).map_err(|e| LinkError::MalformedFrame(e.to_string()))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(mid_frame)?;
    wire::decode_payload(&payload)
        .map(Some)
        .map_err(|e| LinkError::MalformedFrame(e.to_string()))
}

/// Resolves once the connection is marked closed.
async fn closed_signal(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

fn mid_frame(e: std::io::Error) -> LinkError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        LinkError::MalformedFrame("stream closed mid-frame".into())
    } else {
        LinkError::Io(e)
    }
}

/// A connected peer socket. Reads run on their own task; writes go through one locked writer so
/// concurrent `send` calls never interleave bytes.
pub struct PeerConnection {
    id: ConnectionId,
    peer_id: String,
    peer_addr: Option<SocketAddr>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl PeerConnection {
    /// Take ownership of `stream` and start its reader task. `peer_id` labels events from this link.
    pub fn spawn(
        stream: TcpStream,
        id: ConnectionId,
        peer_id: impl Into<String>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let peer_addr = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let conn = Arc::new(Self {
            id,
            peer_id: peer_id.into(),
            peer_addr,
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            shutdown,
            events,
        });
        let reader_conn = conn.clone();
        tokio::spawn(async move { reader_conn.read_loop(reader, shutdown_rx).await });
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one frame. Fails with `LinkClosed` once the connection is dead.
    pub async fn send(&self, message: &Message) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::LinkClosed);
        }
        let frame = wire::encode_frame(message)?;
        let stop = self.shutdown.subscribe();
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(LinkError::LinkClosed);
        }
        // close() must not wait on a write stuck behind a peer that stopped reading.
        let result = tokio::select! {
            written = tokio::time::timeout(WRITE_TIMEOUT, async {
                writer.write_all(&frame).await?;
                writer.flush().await
            }) => match written {
                Ok(written) => written,
                Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out")),
            },
            _ = closed_signal(stop) => {
                Err(std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "connection closed"))
            }
        };
        drop(writer);
        if let Err(e) = result {
            debug!(conn = self.id, peer = %self.peer_id, error = %e, "write failed");
            self.finish(CloseReason::Io).await;
            return Err(LinkError::LinkClosed);
        }
        Ok(())
    }

    /// Close the socket and stop the reader. Idempotent.
    pub async fn close(&self) {
        self.finish(CloseReason::Local).await;
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf, mut shutdown: watch::Receiver<bool>) {
        let reason = loop {
            tokio::select! {
                frame = read_frame(&mut reader) => match frame {
                    Ok(Some(message)) => {
                        let event = ConnectionEvent::Message {
                            conn: self.id,
                            peer_id: self.peer_id.clone(),
                            message,
                        };
                        if self.events.send(event).is_err() {
                            break CloseReason::Local;
                        }
                    }
                    Ok(None) => break CloseReason::Remote,
                    Err(LinkError::MalformedFrame(e)) => {
                        warn!(conn = self.id, peer = %self.peer_id, error = %e, "dropping connection");
                        break CloseReason::Malformed;
                    }
                    Err(e) => {
                        debug!(conn = self.id, peer = %self.peer_id, error = %e, "read failed");
                        break CloseReason::Io;
                    }
                },
                _ = shutdown.changed() => break CloseReason::Local,
            }
        };
        self.finish(reason).await;
    }

    /// Mark dead, shut the socket and report `Closed`; only the first caller does anything.
    async fn finish(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        debug!(conn = self.id, peer = %self.peer_id, ?reason, "connection closed");
        let _ = self.events.send(ConnectionEvent::Closed {
            conn: self.id,
            peer_id: self.peer_id.clone(),
            reason,
        });
        // A send blocked in write_all has seen the shutdown signal and gives the writer back.
        let _ = self.writer.lock().await.shutdown().await;
    }
}
