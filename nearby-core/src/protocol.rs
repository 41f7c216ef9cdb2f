//! Nearby wire protocol: message kinds, reserved identifiers and argument keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reserved receiver id: every current member except the sender.
pub const BROADCAST: &str = "*";

/// Instance events: `found` or `lost`.
pub const ARG_EVENT: &str = "event";
/// Instance events: the peer the event is about.
pub const ARG_IDENTIFIER: &str = "identifier";
/// Requests and their replies share this correlation id.
pub const ARG_REQUEST_ID: &str = "request-id";
/// Set to `"true"` on the reply to a request.
pub const ARG_REPLY: &str = "reply";

pub const EVENT_FOUND: &str = "found";
pub const EVENT_LOST: &str = "lost";

/// Message kind. Encoded as a `u32` tag (declaration order) on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Join handshake: first frame a link client sends to the relay.
    Connect,
    /// Membership announcement from the relay (`found` / `lost`).
    InstanceEvent,
    /// Application payload.
    Data,
    /// Request expecting a reply, or the reply itself.
    Request,
}

/// One unit of the wire protocol. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    /// Overwritten by the sending endpoint just before transmission.
    pub sender_id: String,
    /// Peer identifier or [`BROADCAST`].
    pub receiver_id: String,
    pub args: BTreeMap<String, String>,
}

/// Membership change carried by an instance-event message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    Found(String),
    Lost(String),
}

impl Message {
    pub fn new(kind: MessageKind, receiver_id: impl Into<String>) -> Self {
        Self {
            kind,
            sender_id: String::new(),
            receiver_id: receiver_id.into(),
            args: BTreeMap::new(),
        }
    }

    /// Application data addressed to one peer or [`BROADCAST`].
    pub fn data(receiver_id: impl Into<String>) -> Self {
        Self::new(MessageKind::Data, receiver_id)
    }

    pub fn request(receiver_id: impl Into<String>) -> Self {
        Self::new(MessageKind::Request, receiver_id)
    }

    /// Join handshake announcing `identifier` to the relay.
    pub fn connect(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        Self {
            kind: MessageKind::Connect,
            sender_id: identifier,
            receiver_id: String::new(),
            args: BTreeMap::new(),
        }
    }

    pub fn instance_found(receiver_id: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::new(MessageKind::InstanceEvent, receiver_id)
            .with_arg(ARG_EVENT, EVENT_FOUND)
            .with_arg(ARG_IDENTIFIER, identifier)
    }

    pub fn instance_lost(receiver_id: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::new(MessageKind::InstanceEvent, receiver_id)
            .with_arg(ARG_EVENT, EVENT_LOST)
            .with_arg(ARG_IDENTIFIER, identifier)
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver_id == BROADCAST
    }

    pub fn request_id(&self) -> Option<&str> {
        self.arg(ARG_REQUEST_ID)
    }

    pub fn is_reply(&self) -> bool {
        self.kind == MessageKind::Request && self.arg(ARG_REPLY) == Some("true")
    }

    /// Build the reply to this request: same correlation id, addressed back to the requester.
    /// The caller fills in the payload args.
    pub fn reply_to(&self, mut response: Message) -> Message {
        response.kind = MessageKind::Request;
        response.receiver_id = self.sender_id.clone();
        if let Some(id) = self.request_id() {
            response
                .args
                .insert(ARG_REQUEST_ID.to_string(), id.to_string());
        }
        response.args.insert(ARG_REPLY.to_string(), "true".to_string());
        response
    }

    /// Decode the membership change this message announces, if it is a well-formed instance event.
    pub fn instance_event(&self) -> Option<InstanceEvent> {
        if self.kind != MessageKind::InstanceEvent {
            return None;
        }
        let identifier = self.arg(ARG_IDENTIFIER)?.to_string();
        match self.arg(ARG_EVENT)? {
            EVENT_FOUND => Some(InstanceEvent::Found(identifier)),
            EVENT_LOST => Some(InstanceEvent::Lost(identifier)),
            _ => None,
        }
    }
}

/// Fresh correlation id for an outgoing request.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
