//! Framing: length-prefix (4 bytes LE) + bincode batch of named messages.

use crate::protocol::{InviteContext, Message, Payload};

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Wire body: ordered descriptor -> payload-or-null pairs.
type Batch = Vec<(String, Option<Payload>)>;

/// Encode a batch of messages into a single frame: 4 bytes LE length + bincode body.
pub fn encode_batch(messages: &[Message]) -> Result<Vec<u8>, FrameEncodeError> {
    let batch: Vec<(&str, Option<&Payload>)> = messages
        .iter()
        .map(|m| (m.descriptor.as_str(), m.payload.as_ref()))
        .collect();
    let body = bincode::serialize(&batch).map_err(FrameEncodeError::Encode)?;
    frame(body)
}

/// Encode a single message as a one-entry batch.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    encode_batch(std::slice::from_ref(msg))
}

/// Encode the invitation context sent alongside a session request.
pub fn encode_context(ctx: &InviteContext) -> Result<Vec<u8>, FrameEncodeError> {
    let body = bincode::serialize(&ctx.to_payload()).map_err(FrameEncodeError::Encode)?;
    frame(body)
}

/// Build the reserved disconnect frame.
pub fn disconnect_frame(reason: Option<&str>) -> Result<Vec<u8>, FrameEncodeError> {
    encode_message(&Message::disconnect(reason))
}

fn frame(body: Vec<u8>) -> Result<Vec<u8>, FrameEncodeError> {
    let len = body.len() as u32;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Error encoding a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Split one frame off the front of `bytes`. Returns the body and the number of bytes consumed.
fn unframe(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Decode one frame from the front of `bytes`. Returns its messages in wire order and the
/// number of bytes consumed. Returns `NeedMore` on a partial buffer.
pub fn decode_batch(bytes: &[u8]) -> Result<(Vec<Message>, usize), FrameDecodeError> {
    let (body, consumed) = unframe(bytes)?;
    let batch: Batch = bincode::deserialize(body).map_err(FrameDecodeError::Decode)?;
    let messages = batch
        .into_iter()
        .map(|(descriptor, payload)| Message {
            descriptor,
            payload,
        })
        .collect();
    Ok((messages, consumed))
}

/// Decode every frame in `bytes`. A trailing partial frame is an error.
pub fn decode_frames(mut bytes: &[u8]) -> Result<Vec<Message>, FrameDecodeError> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let (messages, n) = decode_batch(bytes)?;
        out.extend(messages);
        bytes = &bytes[n..];
    }
    Ok(out)
}

/// Decode an invitation context frame.
pub fn decode_context(bytes: &[u8]) -> Result<InviteContext, FrameDecodeError> {
    let (body, _) = unframe(bytes)?;
    let payload: Payload = bincode::deserialize(body).map_err(FrameDecodeError::Decode)?;
    Ok(InviteContext::from_payload(&payload))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
