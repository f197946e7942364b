//! Frame header and message types.

use crate::error::FrameError;
use crate::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE, PROTOCOL_VERSION};

/// Message type discriminant.
///
/// Unknown discriminants decode to [`FrameType::Unknown`] rather than failing
/// the session: the wire contract requires servers to ignore types they do
/// not recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Client request carrying a binary work payload.
    Request,
    /// Server response carrying the transformed upstream reply.
    Response,
    /// Error notification with a short text message.
    Error,
    /// Liveness probe.
    Ping,
    /// Liveness probe answer.
    Pong,
    /// Unrecognised discriminant, preserved for logging.
    Unknown(u8),
}

impl FrameType {
    /// Creates a frame type from its wire discriminant.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::Request,
            0x02 => Self::Response,
            0x03 => Self::Error,
            0x04 => Self::Ping,
            0x05 => Self::Pong,
            other => Self::Unknown(other),
        }
    }

    /// Returns the wire discriminant of this frame type.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Request => 0x01,
            Self::Response => 0x02,
            Self::Error => 0x03,
            Self::Ping => 0x04,
            Self::Pong => 0x05,
            Self::Unknown(other) => other,
        }
    }
}

/// Frame header for protocol messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version.
    pub version: u8,
    /// Message type discriminant.
    pub frame_type: FrameType,
    /// Length of the payload in bytes.
    pub length: u32,
}

impl FrameHeader {
    /// Creates a new header at the current protocol version.
    #[must_use]
    pub const fn new(frame_type: FrameType, length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            length,
        }
    }

    /// Encodes the header to its wire representation.
    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.frame_type.as_u8();
        buf[2..6].copy_from_slice(&self.length.to_be_bytes());
        // buf[6..8] reserved, zero
        buf
    }

    /// Decodes a header from its wire representation.
    ///
    /// Rejects unsupported versions and oversized length declarations before
    /// any payload buffer is allocated.
    pub fn decode(bytes: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, FrameError> {
        let version = bytes[0];
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        let length = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        if length as usize > MAX_FRAME_SIZE {
            return Err(FrameError::Oversize {
                size: length as usize,
                max: MAX_FRAME_SIZE,
            });
        }

        Ok(Self {
            version,
            frame_type: FrameType::from_u8(bytes[1]),
            length,
        })
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type.
    pub frame_type: FrameType,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame with the given type and payload.
    #[must_use]
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// Creates an empty ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(FrameType::Ping, Vec::new())
    }

    /// Creates an empty pong frame.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(FrameType::Pong, Vec::new())
    }

    /// Creates an error frame carrying a short text message.
    #[must_use]
    pub fn error_text(message: &str) -> Self {
        Self::new(FrameType::Error, message.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = FrameHeader::new(FrameType::Request, 1024);
        let bytes = header.encode();
        let decoded = FrameHeader::decode(&bytes).unwrap();

        assert_eq!(header, decoded);
    }

    #[test]
    fn header_rejects_bad_version() {
        let mut bytes = FrameHeader::new(FrameType::Ping, 0).encode();
        bytes[0] = 0x02;

        let result = FrameHeader::decode(&bytes);
        assert!(matches!(result, Err(FrameError::UnsupportedVersion(0x02))));
    }

    #[test]
    fn header_rejects_oversize_length() {
        let mut bytes = FrameHeader::new(FrameType::Request, 0).encode();
        let oversize = (MAX_FRAME_SIZE as u32) + 1;
        bytes[2..6].copy_from_slice(&oversize.to_be_bytes());

        let result = FrameHeader::decode(&bytes);
        assert!(matches!(result, Err(FrameError::Oversize { .. })));
    }

    #[test]
    fn reserved_bytes_are_zero_on_encode() {
        let bytes = FrameHeader::new(FrameType::Response, 7).encode();
        assert_eq!(&bytes[6..8], &[0, 0]);
    }

    #[test]
    fn frame_type_roundtrip() {
        let types = [
            FrameType::Request,
            FrameType::Response,
            FrameType::Error,
            FrameType::Ping,
            FrameType::Pong,
        ];

        for t in types {
            assert_eq!(FrameType::from_u8(t.as_u8()), t);
        }

        assert_eq!(FrameType::from_u8(0x7F), FrameType::Unknown(0x7F));
        assert_eq!(FrameType::Unknown(0x7F).as_u8(), 0x7F);
    }

    #[test]
    fn liveness_constructors() {
        assert_eq!(Frame::ping().frame_type, FrameType::Ping);
        assert!(Frame::ping().payload.is_empty());
        assert_eq!(Frame::pong().frame_type, FrameType::Pong);

        let err = Frame::error_text("no route");
        assert_eq!(err.frame_type, FrameType::Error);
        assert_eq!(err.payload, b"no route");
    }
}
