//! WSP Protocol Definitions
//!
//! This crate defines the wire vocabulary shared by the gateway: the textual
//! envelope carried over every tunnel message, the typed requests built on top
//! of it, and the reassembler that splits an upstream byte stream into
//! control text and length-prefixed binary frames.

pub mod envelope;
pub mod frame;
pub mod messages;

pub use envelope::{Envelope, EnvelopeError, Headers, StartLine};
pub use frame::{Reassembler, Unit, Units};
pub use messages::*;

/// Protocol tag opening every envelope start line
pub const PROTOCOL_TAG: &str = "WSP/1.1";

/// Prefix identifying upstream control-protocol text
pub const CONTROL_MARKER: &[u8] = b"RTSP/";

/// Binary frame header size: 2 reserved bytes + 2-byte big-endian body length
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest frame the 16-bit length field can describe
pub const MAX_FRAME_SIZE: usize = FRAME_HEADER_SIZE + u16::MAX as usize;
