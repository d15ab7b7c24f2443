//! The object store daemon's wire envelope (spec.md §6): length-prefixed
//! frames of `version:i64 | type:i64 | length:i64 | payload:bytes`, carried
//! over a Unix domain socket. File descriptors for shared-memory regions are
//! passed out of band (via `SCM_RIGHTS`) and are not modeled here — this
//! module only frames the control-plane messages.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use thiserror::Error;

/// The only protocol version this build speaks. A mismatch is fatal per
/// spec.md §7, not a recoverable `Result`.
pub const PROTOCOL_VERSION: i64 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i64)]
pub enum MessageType {
    Create = 0,
    Seal = 1,
    Get = 2,
    Delete = 3,
    Contains = 4,
    Refresh = 5,
    Reply = 6,
    DisconnectClient = 7,
}

impl MessageType {
    fn from_i64(v: i64) -> Option<Self> {
        Some(match v {
            0 => Self::Create,
            1 => Self::Seal,
            2 => Self::Get,
            3 => Self::Delete,
            4 => Self::Contains,
            5 => Self::Refresh,
            6 => Self::Reply,
            7 => Self::DisconnectClient,
            _ => return None,
        })
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown message type tag {0}")]
    UnknownMessageType(i64),
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: i64, actual: i64 },
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

/// Writes one frame: `version | type | length | payload`, all integers
/// little-endian i64, matching the envelope named in spec.md §6.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_i64_le(PROTOCOL_VERSION).await?;
    writer.write_i64_le(frame.message_type as i64).await?;
    writer.write_i64_le(frame.payload.len() as i64).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame, rejecting a version mismatch as a protocol error (the
/// caller decides whether to treat it as fatal; at the real socket boundary
/// it is, per spec.md §7).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let version = reader.read_i64_le().await?;
    if version != PROTOCOL_VERSION {
        return Err(FrameError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: version,
        });
    }
    let type_tag = reader.read_i64_le().await?;
    let message_type =
        MessageType::from_i64(type_tag).ok_or(FrameError::UnknownMessageType(type_tag))?;
    let length = reader.read_i64_le().await? as usize;
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Frame {
        message_type,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frame_roundtrips_over_a_pipe() {
        let (mut a, mut b) = duplex(4096);
        let frame = Frame {
            message_type: MessageType::Seal,
            payload: b"object-id-bytes".to_vec(),
        };
        write_frame(&mut a, &frame).await.unwrap();
        let read_back = read_frame(&mut b).await.unwrap();
        assert_eq!(read_back.message_type, MessageType::Seal);
        assert_eq!(read_back.payload, frame.payload);
    }

    #[tokio::test]
    async fn version_mismatch_is_reported() {
        let (mut a, mut b) = duplex(4096);
        a.write_i64_le(PROTOCOL_VERSION + 1).await.unwrap();
        a.write_i64_le(MessageType::Get as i64).await.unwrap();
        a.write_i64_le(0).await.unwrap();
        a.flush().await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::VersionMismatch { .. }));
    }
}
