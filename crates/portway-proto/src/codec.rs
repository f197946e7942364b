//! Async frame reader and writer.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;
use crate::frame::{Frame, FrameHeader, FrameType};
use crate::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};

/// Encodes a frame to its contiguous wire representation.
///
/// Callers that write through a shared connection handle encode first and
/// hand the bytes off as a single write.
pub fn encode_frame(frame_type: FrameType, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::Oversize {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let header = FrameHeader::new(frame_type, payload.len() as u32);
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Reads exactly one frame from the stream.
///
/// Reads the 8-byte header first and validates it before allocating the
/// payload buffer, so an oversized length declaration is rejected without
/// reserving memory for it. EOF mid-header or mid-payload surfaces as
/// [`FrameError::ShortRead`]; partial frames are never returned.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    read_exact_or_short(reader, &mut header_buf, "header").await?;

    let header = FrameHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.length as usize];
    if header.length > 0 {
        read_exact_or_short(reader, &mut payload, "payload").await?;
    }

    Ok(Frame::new(header.frame_type, payload))
}

/// Reads one frame, or returns `None` when no byte arrives within `idle`.
///
/// This is the read path for server sessions running a probe-on-idle loop.
/// The idle window elapses only while zero bytes have been consumed (waiting
/// for a single byte is cancellation-safe), so returning `None` never
/// desynchronises the stream. Once a frame has started, the remainder must
/// arrive within `idle` as well; a mid-frame stall surfaces as an I/O
/// timeout error, not as idleness.
pub async fn read_frame_or_idle<R>(
    reader: &mut R,
    idle: Duration,
) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    match tokio::time::timeout(idle, reader.read(&mut first)).await {
        Err(_) => return Ok(None),
        Ok(Ok(0)) => return Err(FrameError::ShortRead("header")),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(FrameError::Io(e)),
    }

    let frame = tokio::time::timeout(idle, async {
        let mut rest = [0u8; FRAME_HEADER_SIZE - 1];
        read_exact_or_short(reader, &mut rest, "header").await?;

        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        header_buf[0] = first[0];
        header_buf[1..].copy_from_slice(&rest);
        let header = FrameHeader::decode(&header_buf)?;

        let mut payload = vec![0u8; header.length as usize];
        if header.length > 0 {
            read_exact_or_short(reader, &mut payload, "payload").await?;
        }

        Ok::<Frame, FrameError>(Frame::new(header.frame_type, payload))
    })
    .await
    .map_err(|_| {
        FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "frame read stalled mid-message",
        ))
    })??;

    Ok(Some(frame))
}

/// Writes one frame to the stream as a single contiguous write.
///
/// `write_all` retries partial transport writes until the frame is complete
/// or the transport errors.
pub async fn write_frame<W>(
    writer: &mut W,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode_frame(frame_type, payload)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_exact_or_short<R>(
    reader: &mut R,
    buf: &mut [u8],
    what: &'static str,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(FrameError::ShortRead(what))
        }
        Err(e) => Err(FrameError::Io(e)),
    }
}
