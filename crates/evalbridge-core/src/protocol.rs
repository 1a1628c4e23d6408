//! Wire messages and framing.
//!
//! Every message is a JSON object tagged by `op`:
//!
//! ```text
//! outbound: {"op":"eval","code":"..."} | {"op":"eval-file","file":"..."}
//! inbound:  {"op":"result","value":"..."} | {"op":"print","value":"..."} | {"op":"ready"}
//! ```
//!
//! The TCP transport carries each message in a length-prefixed frame:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::ProtocolConfig;
use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Evaluation request sent to the remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum OutboundMessage {
    /// Executable text carried inline.
    #[serde(rename = "eval")]
    Eval { code: String },
    /// Path of a staged file holding the executable text.
    #[serde(rename = "eval-file")]
    EvalFile { file: String },
}

/// Message received from the remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum InboundMessage {
    /// Value of the most recent evaluation.
    Result { value: String },
    /// Output fragment emitted by remote code.
    Print { value: String },
    /// Remote host (re)started and is ready for requests.
    Ready,
    /// Any op this side does not know about.
    #[serde(other)]
    Unknown,
}

/// Serialize an outbound request.
pub fn encode(message: &OutboundMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Parse one inbound message.
pub fn decode(raw: &str) -> Result<InboundMessage> {
    serde_json::from_str(raw).map_err(|e| BridgeError::Protocol {
        message: format!("Undecodable message: {}", e),
    })
}

/// Turn a print payload back into printable text.
///
/// Remote hosts send print payloads as JSON string literals so that control
/// characters survive the trip; anything else is printed verbatim.
pub fn decode_printable(value: &str) -> String {
    match serde_json::from_str::<String>(value) {
        Ok(text) => text,
        Err(_) => value.to_string(),
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(BridgeError::Protocol {
            message: format!(
                "Message size {} exceeds maximum {}",
                len,
                ProtocolConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| BridgeError::Protocol {
        message: format!("Message of {} bytes cannot be framed", payload.len()),
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
