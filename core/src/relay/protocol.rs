//! Relay wire protocol: one newline-terminated JSON frame each way

use crate::auth::Role;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a handshake line. A real frame is well under 1 KiB;
/// anything larger is garbage and must not grow our buffers.
pub const MAX_FRAME_LEN: u64 = 4096;

/// Handshake framing errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Connection closed during handshake")]
    Closed,
    #[error("Handshake frame exceeds {MAX_FRAME_LEN} bytes")]
    FrameTooLong,
    #[error("Invalid handshake frame: {0}")]
    Invalid(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// First and only frame a client sends after connecting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub session_id: String,
    pub relay_token: String,
    pub role: Role,
}

/// The relay's only frame back; after a success the pipe is opaque
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
        }
    }
}

/// Read one newline-terminated JSON value, refusing oversized frames.
///
/// The reader stays positioned right after the newline, so every byte
/// that follows belongs to the spliced stream.
pub async fn read_json_line<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let mut limited = reader.take(MAX_FRAME_LEN);
    let n = limited.read_line(&mut line).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::InvalidData {
            ProtocolError::Invalid("frame is not UTF-8".into())
        } else {
            ProtocolError::Io(e)
        }
    })?;

    if n == 0 {
        return Err(ProtocolError::Closed);
    }
    if !line.ends_with('\n') {
        // Either the peer hung up mid-frame or the cap was hit
        if n as u64 >= MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLong);
        }
        return Err(ProtocolError::Closed);
    }

    serde_json::from_str(line.trim_end()).map_err(|e| ProtocolError::Invalid(e.to_string()))
}

/// Write one JSON value followed by a newline and flush it
pub async fn write_json_line<W, T>(writer: &mut W, value: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf =
        serde_json::to_vec(value).map_err(|e| ProtocolError::Invalid(e.to_string()))?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_request_round_trip() {
        let req = HandshakeRequest {
            session_id: "abc123".to_string(),
            relay_token: "tok".to_string(),
            role: Role::Host,
        };

        let mut wire = Vec::new();
        write_json_line(&mut wire, &req).await.expect("Failed to write");
        assert!(wire.ends_with(b"\n"));

        let mut reader = BufReader::new(wire.as_slice());
        let parsed: HandshakeRequest = read_json_line(&mut reader).await.expect("Failed to read");
        assert_eq!(parsed.session_id, "abc123");
        assert_eq!(parsed.role, Role::Host);
    }

    #[tokio::test]
    async fn test_wire_field_names() {
        let req = HandshakeRequest {
            session_id: "s".to_string(),
            relay_token: "t".to_string(),
            role: Role::Joiner,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(
            json,
            r#"{"sessionId":"s","relayToken":"t","role":"joiner"}"#
        );

        let ok = serde_json::to_string(&HandshakeResponse::ok()).unwrap();
        assert_eq!(ok, r#"{"success":true}"#);

        let no = serde_json::to_string(&HandshakeResponse::rejected("bad token")).unwrap();
        assert_eq!(no, r#"{"success":false,"error":"bad token"}"#);
    }

    #[tokio::test]
    async fn test_trailing_bytes_stay_buffered() {
        let req = HandshakeRequest {
            session_id: "s".to_string(),
            relay_token: "t".to_string(),
            role: Role::Host,
        };
        let mut wire = Vec::new();
        write_json_line(&mut wire, &req).await.unwrap();
        wire.extend_from_slice(b"payload-after-handshake");

        let mut reader = BufReader::new(wire.as_slice());
        let _: HandshakeRequest = read_json_line(&mut reader).await.expect("Failed to read");

        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut rest)
            .await
            .expect("Failed to read rest");
        assert_eq!(rest, b"payload-after-handshake");
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let mut reader = BufReader::new(&b"{\"sessionId\":\"s\""[..]);
        let res: Result<HandshakeRequest, _> = read_json_line(&mut reader).await;
        assert!(matches!(res, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let mut reader = BufReader::new(&b""[..]);
        let res: Result<HandshakeRequest, _> = read_json_line(&mut reader).await;
        assert!(matches!(res, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_frame() {
        let huge = format!("{}\n", "x".repeat(MAX_FRAME_LEN as usize + 100));
        let mut reader = BufReader::new(huge.as_bytes());
        let res: Result<HandshakeRequest, _> = read_json_line(&mut reader).await;
        assert!(matches!(res, Err(ProtocolError::FrameTooLong)));
    }

    #[tokio::test]
    async fn test_garbage_frame() {
        let mut reader = BufReader::new(&b"this is not json\n"[..]);
        let res: Result<HandshakeRequest, _> = read_json_line(&mut reader).await;
        assert!(matches!(res, Err(ProtocolError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_bad_role_rejected() {
        let mut reader =
            BufReader::new(&b"{\"sessionId\":\"s\",\"relayToken\":\"t\",\"role\":\"admin\"}\n"[..]);
        let res: Result<HandshakeRequest, _> = read_json_line(&mut reader).await;
        assert!(matches!(res, Err(ProtocolError::Invalid(_))));
    }
}
