//! Framing: length-prefix (4 bytes LE) + bincode payload.
//!
//! Payload layout (bincode 1, fixint, little endian): `u32` kind tag, sender id and
//! receiver id as `u64` length + UTF-8 bytes, `u64` argument count, then each key and
//! value as `u64` length + UTF-8 bytes. Every variable-length field is length-prefixed.

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Payload length announced by a frame header. Rejects lengths above [`MAX_FRAME_LEN`].
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode a payload whose length was already taken from the header.
/// Trailing bytes inside the payload are a framing violation.
pub fn decode_payload(payload: &[u8]) -> Result<Message, FrameDecodeError> {
    let msg: Message = bincode::deserialize(payload).map_err(FrameDecodeError::Decode)?;
    let used = bincode::serialized_size(&msg).map_err(FrameDecodeError::Decode)?;
    if used as usize != payload.len() {
        return Err(FrameDecodeError::TrailingBytes);
    }
    Ok(msg)
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = decode_payload(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("trailing bytes after message")]
    TrailingBytes,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
