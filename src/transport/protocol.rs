//! Wire Protocol
//!
//! Frame layout: `magic(4) | length(u32 BE) | bincode(WireMessage)`.
//! Block payloads are opaque; encoding them is the caller's business.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RelayError;
use crate::types::{BlockHash, GossipAddr};

/// Protocol version announced in `Hello`
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame body size (32 MiB, room for the largest blocks)
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Maximum addresses accepted from one `Addr` message
pub const MAX_GOSSIP_ADDRS: usize = 1000;

/// Inventory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvItem {
    Block(BlockHash),
    Tx([u8; 32]),
}

/// Messages exchanged over a relay link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    Hello {
        version: u32,
        user_agent: String,
    },
    Block {
        payload: Vec<u8>,
    },
    GetAddr,
    Addr {
        addrs: Vec<GossipAddr>,
    },
    Inv {
        items: Vec<InvItem>,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
}

impl WireMessage {
    pub fn name(&self) -> &'static str {
        match self {
            WireMessage::Hello { .. } => "hello",
            WireMessage::Block { .. } => "block",
            WireMessage::GetAddr => "getaddr",
            WireMessage::Addr { .. } => "addr",
            WireMessage::Inv { .. } => "inv",
            WireMessage::Ping { .. } => "ping",
            WireMessage::Pong { .. } => "pong",
        }
    }
}

/// Parse a network magic given as 8 hex digits
pub fn parse_magic(s: &str) -> Result<[u8; 4], RelayError> {
    let bytes = hex::decode(s.trim())
        .map_err(|e| RelayError::Protocol(format!("invalid network magic {:?}: {}", s, e)))?;
    bytes
        .try_into()
        .map_err(|_| RelayError::Protocol(format!("network magic {:?} is not 4 bytes", s)))
}

/// Write one framed message
pub async fn write_frame<W>(
    writer: &mut W,
    magic: [u8; 4],
    message: &WireMessage,
) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(RelayError::Protocol(format!(
            "{} frame too large: {} bytes",
            message.name(),
            body.len()
        )));
    }

    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&magic);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message.
///
/// Oversized `Addr` lists are truncated to [`MAX_GOSSIP_ADDRS`].
pub async fn read_frame<R>(reader: &mut R, magic: [u8; 4]) -> Result<WireMessage, RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 8];
    reader.read_exact(&mut header).await?;

    if header[..4] != magic {
        return Err(RelayError::Protocol(format!(
            "bad magic {}",
            hex::encode(&header[..4])
        )));
    }

    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RelayError::Protocol(format!("frame too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let mut message: WireMessage = bincode::deserialize(&body)?;
    if let WireMessage::Addr { addrs } = &mut message {
        addrs.truncate(MAX_GOSSIP_ADDRS);
    }

    Ok(message)
}
