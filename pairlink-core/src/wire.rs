//! Framing: length-prefix (4 bytes LE) + bincode `Frame`.

use serde::{Deserialize, Serialize};

use crate::message::PeerMessage;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Everything that crosses the link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Key/value message; `expects_reply` asks the peer to answer with a `Reply` carrying `id`.
    Message {
        id: u64,
        expects_reply: bool,
        payload: PeerMessage,
    },
    Reply {
        id: u64,
        payload: PeerMessage,
    },
    /// Bulk file with its metadata and SHA-256 digest.
    File {
        transfer_id: [u8; 16],
        name: String,
        metadata: PeerMessage,
        digest: [u8; 32],
        data: Vec<u8>,
    },
    /// Receiver's verdict on a `File`; `error` is `None` on success.
    FileAck {
        transfer_id: [u8; 16],
        error: Option<String>,
    },
}

/// Encode a frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(frame).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Read the length prefix of a frame, rejecting oversized frames. Used by stream readers.
pub fn frame_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode a frame body (without the length prefix).
pub fn decode_body(body: &[u8]) -> Result<Frame, FrameDecodeError> {
    bincode::deserialize(body).map_err(FrameDecodeError::Decode)
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` until the whole frame is present.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame = decode_body(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((frame, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
