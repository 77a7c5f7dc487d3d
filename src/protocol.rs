//! Control-channel messages exchanged by the built-in engine.
//!
//! Every message is JSON, prefixed with its length as a big-endian `u32`.
//!
//! # Flow
//!
//! 1. Client sends `Setup` with the test parameters
//! 2. Server answers `SetupAck`, or `Error` when it rejects the test
//! 3. Payload travels on a separate TCP connection or as UDP datagrams
//! 4. Client sends `Finished` with its sender-side totals
//! 5. Server answers `Result` with its receiver-side totals

use crate::config::Protocol;
use crate::report::UdpSummary;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bumped on any incompatible change to [`Message`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single control message; anything larger is garbage.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    Setup {
        version: u32,
        protocol: Protocol,
        duration_secs: u64,
        block_size: u64,
        bytes: Option<u64>,
        blocks: Option<u64>,
    },

    SetupAck { cookie: String },

    /// Sender-side totals, sent once the client stops transmitting
    Finished { bytes: u64, packets: u64, seconds: f64 },

    /// Receiver-side totals
    Result {
        bytes: u64,
        packets: u64,
        seconds: f64,
        udp: Option<UdpSummary>,
    },

    Error { message: String },
}

impl Message {
    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }

    /// Name of the variant, for log and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Setup { .. } => "Setup",
            Message::SetupAck { .. } => "SetupAck",
            Message::Finished { .. } => "Finished",
            Message::Result { .. } => "Result",
            Message::Error { .. } => "Error",
        }
    }
}

/// Encodes a message as length prefix + JSON.
pub fn serialize_message(msg: &Message) -> io::Result<Vec<u8>> {
    let json = serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(json.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;

    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> io::Result<()> {
    let bytes = serialize_message(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Reads one length-prefixed message.
///
/// Lengths above [`MAX_MESSAGE_LEN`] are rejected before allocating.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Message> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("control message of {} bytes exceeds limit", len),
        ));
    }

    let mut json = vec![0u8; len];
    reader.read_exact(&mut json).await?;
    serde_json::from_slice(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Message {
        Message::Setup {
            version: PROTOCOL_VERSION,
            protocol: Protocol::Udp,
            duration_secs: 10,
            block_size: 8192,
            bytes: Some(1 << 20),
            blocks: None,
        }
    }

    #[test]
    fn test_serialize_has_length_prefix() {
        let bytes = serialize_message(&setup()).unwrap();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - 4);

        let json: serde_json::Value = serde_json::from_slice(&bytes[4..]).unwrap();
        assert_eq!(json["type"], "Setup");
        assert_eq!(json["protocol"], "Udp");
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &setup()).await.unwrap();
        write_message(&mut a, &Message::error("busy")).await.unwrap();

        assert_eq!(read_message(&mut b).await.unwrap(), setup());
        assert_eq!(read_message(&mut b).await.unwrap(), Message::error("busy"));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let mut data = vec![0xFF, 0xFF, 0xFF, 0xFF];
        data.extend_from_slice(b"{\"type\":\"Error\"}");
        let mut reader = &data[..];

        let err = read_message(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_message() {
        let mut bytes = serialize_message(&Message::SetupAck {
            cookie: "abc".to_string(),
        })
        .unwrap();
        bytes.truncate(bytes.len() - 2);
        let mut reader = &bytes[..];

        let err = read_message(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let body = b"not json";
        let mut data = (body.len() as u32).to_be_bytes().to_vec();
        data.extend_from_slice(body);
        let mut reader = &data[..];

        let err = read_message(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_message_names() {
        assert_eq!(setup().name(), "Setup");
        assert_eq!(Message::error("x").name(), "Error");
    }
}
