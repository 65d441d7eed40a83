//! LAN framing: 4-byte LE length prefix. Beacons and handshakes carry a bincode body;
//! session data frames carry codec bytes untouched.

use huddle_core::PROTOCOL_VERSION;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Multicast announcement of an advertising node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub version: u8,
    pub service: String,
    /// Per-process id so a node never discovers itself.
    pub instance: Uuid,
    pub device_name: String,
    pub listen_port: u16,
}

impl Beacon {
    pub fn new(service: &str, instance: Uuid, device_name: &str, listen_port: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            service: service.to_owned(),
            instance,
            device_name: device_name.to_owned(),
            listen_port,
        }
    }
}

/// Session setup exchanged once per TCP connection, before any data frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Handshake {
    Hello {
        version: u8,
        device_name: String,
        context: Option<Vec<u8>>,
    },
    Welcome {
        device_name: String,
    },
    Reject,
}

#[derive(Debug, thiserror::Error)]
pub enum LanWireError {
    #[error("encode/decode error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
    #[error("truncated frame")]
    Truncated,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, LanWireError> {
    let body = bincode::serialize(value)?;
    frame(&body)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LanWireError> {
    if bytes.len() < LEN_SIZE {
        return Err(LanWireError::Truncated);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(LanWireError::TooLarge);
    }
    let body = bytes
        .get(LEN_SIZE..LEN_SIZE + len)
        .ok_or(LanWireError::Truncated)?;
    Ok(bincode::deserialize(body)?)
}

fn frame(body: &[u8]) -> Result<Vec<u8>, LanWireError> {
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(LanWireError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> Result<(), LanWireError> {
    let bytes = frame(body)?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, LanWireError> {
    let mut len_buf = [0u8; LEN_SIZE];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(LanWireError::TooLarge);
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    Ok(body)
}

pub async fn write_message<W: AsyncWrite + Unpin, T: Serialize>(
    w: &mut W,
    value: &T,
) -> Result<(), LanWireError> {
    write_frame(w, &bincode::serialize(value)?).await
}

pub async fn read_message<R: AsyncRead + Unpin, T: DeserializeOwned>(
    r: &mut R,
) -> Result<T, LanWireError> {
    let body = read_frame(r).await?;
    Ok(bincode::deserialize(&body)?)
}
