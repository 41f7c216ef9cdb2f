//! Link client: the single outbound connection a non-relay member holds to the relay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nearby_core::Message;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionEvent, PeerConnection};
use crate::error::LinkError;
use crate::events::Delivery;
use crate::runtime::LinkFailure;

/// Handle to a connected link client. Cheap to clone.
#[derive(Clone)]
pub struct LinkClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    identifier: String,
    conn: Arc<PeerConnection>,
    delivery: Delivery,
    disconnect_requested: AtomicBool,
}

impl LinkClient {
    /// Connect to the relay at `host:port` within `connect_timeout` and send the join handshake.
    /// Link loss not caused by [`disconnect`](Self::disconnect) is reported on `failures`.
    pub async fn connect(
        host: &str,
        port: u16,
        identifier: &str,
        connect_timeout: Duration,
        delivery: Delivery,
        failures: mpsc::UnboundedSender<LinkFailure>,
        generation: u64,
    ) -> Result<Self, LinkError> {
        let addr = format!("{host}:{port}");
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(LinkError::Io(e)),
            Err(_) => return Err(LinkError::ConnectTimeout { addr }),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::spawn(stream, 0, addr.clone(), tx);
        if let Err(e) = conn.send(&Message::connect(identifier)).await {
            conn.close().await;
            return Err(LinkError::Handshake(e.to_string()));
        }
        let client = Self {
            inner: Arc::new(ClientInner {
                identifier: identifier.to_string(),
                conn,
                delivery,
                disconnect_requested: AtomicBool::new(false),
            }),
        };
        let reader = client.clone();
        tokio::spawn(async move { reader.inbound_loop(rx, failures, generation).await });
        info!(relay = %addr, identifier, "connected to relay");
        Ok(client)
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.conn.is_closed()
    }

    /// Send through the relay. `sender_id` is always this device.
    pub async fn send(&self, mut message: Message) -> Result<(), LinkError> {
        message.sender_id = self.inner.identifier.clone();
        self.inner.conn.send(&message).await
    }

    pub async fn send_request(&self, mut message: Message, timeout: Duration) -> Result<Message, LinkError> {
        let requests = self.inner.delivery.requests();
        let (id, rx) = requests.register(&mut message).await;
        if let Err(e) = self.send(message).await {
            requests.cancel(&id).await;
            return Err(e);
        }
        requests.wait(id, rx, timeout).await
    }

    /// Close the link without reporting an error. Idempotent.
    pub async fn disconnect(&self) {
        if self.inner.disconnect_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.conn.close().await;
    }

    async fn inbound_loop(
        self,
        mut rx: mpsc::UnboundedReceiver<ConnectionEvent>,
        failures: mpsc::UnboundedSender<LinkFailure>,
        generation: u64,
    ) {
        while let Some(event) = rx.recv().await {
            match event {
                ConnectionEvent::Message { message, .. } => {
                    if let Some(reply) = self.inner.delivery.deliver(message).await {
                        let client = self.clone();
                        tokio::spawn(async move {
                            if let Ok(response) = reply.await {
                                if let Err(e) = client.send(response).await {
                                    debug!(error = %e, "reply not sent");
                                }
                            }
                        });
                    }
                }
                ConnectionEvent::Closed { reason, .. } => {
                    if self.inner.disconnect_requested.load(Ordering::Acquire) {
                        debug!("link closed on request");
                    } else {
                        warn!(?reason, "link to relay lost");
                        let _ = failures.send(LinkFailure { generation });
                    }
                    break;
                }
            }
        }
    }
}
