//! Events delivered to the application, and request/reply correlation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nearby_core::protocol::{self, ARG_REQUEST_ID};
use nearby_core::{InstanceEvent, Message, MessageKind};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::error::LinkError;

/// What the group layer reports to the application. Consumed from the receiver returned by
/// [`GroupRuntime::start`](crate::runtime::GroupRuntime::start), on whatever task the application chooses.
#[derive(Debug)]
pub enum GroupEvent {
    InstanceFound(String),
    InstanceLost(String),
    MessageReceived(Message),
    /// A peer expects an answer; complete it with [`Responder::respond`].
    Request { message: Message, reply: Responder },
    /// The active link was lost or could not be formed.
    Error,
}

/// Answer to one incoming request. Dropping it sends nothing; the requester times out.
#[derive(Debug)]
pub struct Responder {
    request: Message,
    tx: oneshot::Sender<Message>,
}

impl Responder {
    pub fn respond(self, response: Message) {
        let reply = self.request.reply_to(response);
        let _ = self.tx.send(reply);
    }
}

/// Requests this device sent and is still waiting on, keyed by request id.
#[derive(Default)]
pub struct PendingRequests {
    waiting: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Tag `message` as a request with a fresh id and start waiting for its reply.
    pub async fn register(&self, message: &mut Message) -> (String, oneshot::Receiver<Message>) {
        let id = protocol::new_request_id();
        message.kind = MessageKind::Request;
        message.args.insert(ARG_REQUEST_ID.to_string(), id.clone());
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.insert(id.clone(), tx);
        (id, rx)
    }

    pub async fn cancel(&self, id: &str) {
        self.waiting.lock().await.remove(id);
    }

    pub async fn wait(
        &self,
        id: String,
        rx: oneshot::Receiver<Message>,
        timeout: Duration,
    ) -> Result<Message, LinkError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(LinkError::LinkClosed),
            Err(_) => {
                self.cancel(&id).await;
                Err(LinkError::RequestTimeout { request_id: id })
            }
        }
    }

    /// Hand a reply to its waiter. False if nobody is waiting (late or unknown id).
    pub async fn complete(&self, reply: Message) -> bool {
        let Some(id) = reply.request_id() else {
            return false;
        };
        let waiter = self.waiting.lock().await.remove(id);
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding request with `LinkClosed`.
    pub async fn clear(&self) {
        self.waiting.lock().await.clear();
    }
}

/// Local delivery of inbound messages to the application's event channel.
#[derive(Clone)]
pub struct Delivery {
    events: mpsc::UnboundedSender<GroupEvent>,
    requests: Arc<PendingRequests>,
}

impl Delivery {
    pub fn new(events: mpsc::UnboundedSender<GroupEvent>, requests: Arc<PendingRequests>) -> Self {
        Self { events, requests }
    }

    pub fn requests(&self) -> &Arc<PendingRequests> {
        &self.requests
    }

    pub fn emit(&self, event: GroupEvent) {
        if self.events.send(event).is_err() {
            debug!("application event receiver dropped");
        }
    }

    /// Deliver one message addressed to this device. For an incoming request, returns the
    /// receiver on which the application's reply will arrive; the caller sends it back.
    pub async fn deliver(&self, message: Message) -> Option<oneshot::Receiver<Message>> {
        match message.kind {
            MessageKind::Data => self.emit(GroupEvent::MessageReceived(message)),
            MessageKind::InstanceEvent => match message.instance_event() {
                Some(InstanceEvent::Found(id)) => self.emit(GroupEvent::InstanceFound(id)),
                Some(InstanceEvent::Lost(id)) => self.emit(GroupEvent::InstanceLost(id)),
                None => debug!(sender = %message.sender_id, "ignoring malformed instance event"),
            },
            MessageKind::Request if message.is_reply() => {
                if !self.requests.complete(message).await {
                    debug!("reply for unknown or expired request");
                }
            }
            MessageKind::Request => {
                let (tx, rx) = oneshot::channel();
                self.emit(GroupEvent::Request {
                    message: message.clone(),
                    reply: Responder {
                        request: message,
                        tx,
                    },
                });
                return Some(rx);
            }
            MessageKind::Connect => {
                debug!(sender = %message.sender_id, "ignoring connect outside handshake")
            }
        }
        None
    }
}
