use nearby_core::FrameEncodeError;

/// Errors surfaced by connections, the relay hub and the link client.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Protocol desync. Fatal to the connection; never retried on the same socket.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("link closed")]
    LinkClosed,

    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("no active group link")]
    NotActive,

    #[error("request {request_id} timed out")]
    RequestTimeout { request_id: String },

    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
