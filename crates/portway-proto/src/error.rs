//! Error types for the wire protocol.

use thiserror::Error;

/// Framing errors.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The stream ended before a complete header or payload was read.
    #[error("short read: {0}")]
    ShortRead(&'static str),

    /// Unsupported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Declared payload length exceeds the frame size cap.
    #[error("frame too large: {size} bytes (max {max})")]
    Oversize { size: usize, max: usize },

    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
