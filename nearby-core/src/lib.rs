//! Nearby ad hoc group messaging core.
//! Host-driven: no I/O; host passes discovery and link events and receives actions.

pub mod group;
pub mod peers;
pub mod protocol;
pub mod wire;

pub use group::{GroupAction, GroupController, GroupState, LinkStatus, Role};
pub use peers::{select_target, PeerRecord, PeerTable};
pub use protocol::{InstanceEvent, Message, MessageKind, BROADCAST};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
