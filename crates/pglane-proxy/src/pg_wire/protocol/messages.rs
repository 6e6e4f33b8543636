//! PostgreSQL wire protocol message builders
//!
//! The proxy only ever speaks one backend-to-frontend message itself:
//! ErrorResponse, used to report pre-relay failures.

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Build an ErrorResponse frame with the given severity, SQLSTATE and message.
pub fn build_error_response(severity: &str, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut fields = Vec::new();
    // Severity
    fields.push(b'S');
    fields.extend_from_slice(severity.as_bytes());
    fields.push(0);
    // SQLSTATE
    fields.push(b'C');
    fields.extend_from_slice(sqlstate.as_bytes());
    fields.push(0);
    // Message
    fields.push(b'M');
    fields.extend_from_slice(message.as_bytes());
    fields.push(0);
    // Terminator
    fields.push(0);

    let mut buf = Vec::with_capacity(1 + 4 + fields.len());
    buf.push(b'E'); // ErrorResponse
    let len = (4 + fields.len()) as u32;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&fields);
    buf
}

/// Send an ErrorResponse to the client.
pub async fn send_error_response<S>(
    socket: &mut S,
    severity: &str,
    sqlstate: &str,
    message: &str,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let frame = build_error_response(severity, sqlstate, message);
    socket.write_all(&frame).await?;
    socket.flush().await
}
