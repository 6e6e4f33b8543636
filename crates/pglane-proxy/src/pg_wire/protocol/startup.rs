//! Startup-phase frame decoding and encoding
//!
//! A startup frame is a big-endian u32 total length (including itself)
//! followed by the payload. The first payload word is either one of the
//! negotiation magic numbers or the protocol version of a StartupMessage,
//! in which case the remainder is a block of `key\0value\0` pairs closed
//! by an empty key.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt};

use pglane_common::{ProxyError, Result};

use super::constants::{
    CANCEL_REQUEST_CODE, GSSENC_REQUEST_CODE, MAX_STARTUP_LENGTH, MIN_STARTUP_LENGTH,
    SSL_REQUEST_CODE,
};

/// A decoded startup-phase frame
#[derive(Debug)]
pub enum StartupFrame {
    /// Client wants to negotiate TLS
    SslRequest,
    /// Client wants GSSAPI encryption
    GssEncRequest,
    /// Client wants to cancel an in-flight query on another connection
    CancelRequest { process_id: i32, secret_key: i32 },
    /// Normal connection startup
    Startup {
        protocol_version: u32,
        parameters: HashMap<String, String>,
    },
}

/// Read and classify one startup-phase frame from the stream.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<StartupFrame> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let length = u32::from_be_bytes(header) as usize;

    if !(MIN_STARTUP_LENGTH..=MAX_STARTUP_LENGTH).contains(&length) {
        return Err(ProxyError::Framing(format!(
            "invalid startup frame length: {}",
            length
        )));
    }

    let mut payload = vec![0u8; length - 4];
    stream.read_exact(&mut payload).await?;

    let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let body = &payload[4..];

    match code {
        SSL_REQUEST_CODE => Ok(StartupFrame::SslRequest),
        GSSENC_REQUEST_CODE => Ok(StartupFrame::GssEncRequest),
        CANCEL_REQUEST_CODE => {
            if body.len() != 8 {
                return Err(ProxyError::Framing(format!(
                    "cancel request with {} payload bytes",
                    body.len()
                )));
            }
            Ok(StartupFrame::CancelRequest {
                process_id: i32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                secret_key: i32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            })
        }
        version => Ok(StartupFrame::Startup {
            protocol_version: version,
            parameters: parse_parameters(body)?,
        }),
    }
}

/// Parse a startup parameter block: `key\0value\0`... closed by an empty key.
///
/// Duplicate keys last-write-wins; bytes after the terminator are ignored;
/// a key without a NUL-terminated value is a framing error.
pub fn parse_parameters(block: &[u8]) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut rest = block;

    loop {
        let (key, after_key) = take_cstring(rest)
            .ok_or_else(|| ProxyError::Framing("unterminated parameter key".into()))?;
        rest = after_key;

        if key.is_empty() {
            break;
        }

        let (value, after_value) = take_cstring(rest).ok_or_else(|| {
            ProxyError::Framing(format!("parameter {:?} has no value", key))
        })?;
        rest = after_value;

        params.insert(key, value);
    }

    Ok(params)
}

/// Split one NUL-terminated string off the front of `buf`.
fn take_cstring(buf: &[u8]) -> Option<(String, &[u8])> {
    let nul = buf.iter().position(|&b| b == 0)?;
    let s = std::str::from_utf8(&buf[..nul]).ok()?;
    Some((s.to_string(), &buf[nul + 1..]))
}

/// Encode a StartupMessage frame: total length, protocol version, parameter
/// pairs, final terminator. The declared length always equals the byte count.
pub fn encode_startup(protocol_version: u32, params: &HashMap<String, String>) -> Vec<u8> {
    let mut total = 4 + 4;
    for (key, value) in params {
        total += key.len() + 1 + value.len() + 1;
    }
    total += 1;

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_be_bytes());
    frame.extend_from_slice(&protocol_version.to_be_bytes());
    for (key, value) in params {
        frame.extend_from_slice(key.as_bytes());
        frame.push(0);
        frame.extend_from_slice(value.as_bytes());
        frame.push(0);
    }
    frame.push(0);

    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame_bytes(code: u32, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((4 + 4 + body.len()) as u32).to_be_bytes());
        buf.extend_from_slice(&code.to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    #[tokio::test]
    async fn test_read_ssl_request() {
        let buf = frame_bytes(SSL_REQUEST_CODE, &[]);
        let frame = read_frame(&mut Cursor::new(buf)).await.unwrap();
        assert!(matches!(frame, StartupFrame::SslRequest));
    }

    #[tokio::test]
    async fn test_read_cancel_request() {
        let mut body = Vec::new();
        body.extend_from_slice(&42i32.to_be_bytes());
        body.extend_from_slice(&7i32.to_be_bytes());
        let buf = frame_bytes(CANCEL_REQUEST_CODE, &body);
        let frame = read_frame(&mut Cursor::new(buf)).await.unwrap();
        match frame {
            StartupFrame::CancelRequest {
                process_id,
                secret_key,
            } => {
                assert_eq!(process_id, 42);
                assert_eq!(secret_key, 7);
            }
            other => panic!("expected CancelRequest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_startup_message() {
        let mut body = Vec::new();
        body.extend_from_slice(b"user\0alice.db-prod\0");
        body.extend_from_slice(b"database\0app\0");
        body.push(0);

        let buf = frame_bytes(3 << 16, &body);
        let frame = read_frame(&mut Cursor::new(buf)).await.unwrap();
        match frame {
            StartupFrame::Startup {
                protocol_version,
                parameters,
            } => {
                assert_eq!(protocol_version, 3 << 16);
                assert_eq!(parameters["user"], "alice.db-prod");
                assert_eq!(parameters["database"], "app");
            }
            other => panic!("expected Startup, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_length_below_minimum_rejected() {
        let buf = 7u32.to_be_bytes().to_vec();
        let err = read_frame(&mut Cursor::new(buf)).await.unwrap_err();
        assert!(matches!(err, ProxyError::Framing(_)));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let buf = 1_000_000u32.to_be_bytes().to_vec();
        let err = read_frame(&mut Cursor::new(buf)).await.unwrap_err();
        assert!(matches!(err, ProxyError::Framing(_)));
    }

    #[tokio::test]
    async fn test_short_read_is_io_error() {
        // Declared length 100 but only a few payload bytes follow
        let mut buf = 100u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0, 3, 0, 0]);
        let err = read_frame(&mut Cursor::new(buf)).await.unwrap_err();
        assert!(matches!(err, ProxyError::Io(_)));
    }

    #[test]
    fn test_parse_duplicate_keys_last_wins() {
        let block = b"user\0first\0user\0second\0\0";
        let params = parse_parameters(block).unwrap();
        assert_eq!(params["user"], "second");
    }

    #[test]
    fn test_parse_trailing_bytes_ignored() {
        let block = b"user\0alice\0\0garbage after terminator";
        let params = parse_parameters(block).unwrap();
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_parse_missing_value_rejected() {
        let block = b"user\0alice\0database";
        assert!(parse_parameters(block).is_err());
    }

    #[test]
    fn test_parse_missing_terminator_rejected() {
        let block = b"user\0alice\0";
        assert!(parse_parameters(block).is_err());
    }

    #[test]
    fn test_encode_length_matches_bytes() {
        let mut params = HashMap::new();
        params.insert("user".to_string(), "alice".to_string());
        params.insert("database".to_string(), "app".to_string());

        let frame = encode_startup(3 << 16, &params);
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len());
    }

    #[tokio::test]
    async fn test_encode_decode_round_trip() {
        let mut params = HashMap::new();
        params.insert("user".to_string(), "alice".to_string());
        params.insert("database".to_string(), "app".to_string());
        params.insert("client_encoding".to_string(), "UTF8".to_string());

        let frame = encode_startup(3 << 16, &params);
        let decoded = read_frame(&mut Cursor::new(frame)).await.unwrap();
        match decoded {
            StartupFrame::Startup {
                protocol_version,
                parameters,
            } => {
                assert_eq!(protocol_version, 3 << 16);
                assert_eq!(parameters, params);
            }
            other => panic!("expected Startup, got {:?}", other),
        }
    }
}
