//! Wire protocol for Portway TCP sessions.
//!
//! Every message on a session is a frame: a fixed 8-byte header followed by
//! an opaque payload. The codec never interprets payload bytes; body shape is
//! the concern of the payload transformer on the processing side.
//!
//! Wire format (big-endian):
//!
//! ```text
//! | version: u8 | type: u8 | length: u32 | reserved: u16 | payload: length bytes |
//! ```

mod codec;
mod error;
mod frame;

pub use codec::{encode_frame, read_frame, read_frame_or_idle, write_frame};
pub use error::FrameError;
pub use frame::{Frame, FrameHeader, FrameType};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum payload size (10 MiB).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 0x01;
