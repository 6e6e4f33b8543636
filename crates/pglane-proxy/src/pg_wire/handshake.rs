//! Client-side handshake: startup decoding and optional TLS upgrade
//!
//! Drives the startup phase of a freshly accepted connection until a
//! StartupMessage has been parsed, upgrading to TLS on the way when the
//! client sends an SSLRequest and certificate material is configured.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use pglane_common::{ProxyError, Result};

use super::protocol::constants::SEVERITY_FATAL;
use super::protocol::messages::send_error_response;
use super::protocol::{read_frame, StartupFrame};
use super::routing::rewrite_startup;

/// The client byte stream after the startup phase: the accepted socket
/// as-is, or wrapped in a server-side TLS session.
#[derive(Debug)]
pub enum ClientStream<S> {
    Plain(S),
    Tls(Box<tokio_rustls::server::TlsStream<S>>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ClientStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ClientStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Result of a completed handshake
#[derive(Debug)]
pub enum HandshakeOutcome<S> {
    /// A StartupMessage was parsed; the connection proceeds to routing.
    Startup {
        /// The stream to use for the rest of the session
        stream: ClientStream<S>,
        /// Every startup parameter plus the extracted routing keys
        metadata: HashMap<String, String>,
        /// Reconstructed startup packet to forward to the backend
        startup_packet: Vec<u8>,
    },
    /// The client sent a CancelRequest; nothing to proxy.
    Cancelled { process_id: i32 },
}

/// Run the startup phase on a freshly accepted socket.
///
/// At most one TLS upgrade is performed; an SSLRequest arriving on the
/// already-encrypted stream is a protocol error. Without configured
/// certificate material, SSLRequests are declined with `'N'` and the
/// client is expected to retry in plaintext.
pub async fn perform_handshake<S>(
    mut socket: S,
    tls: Option<&TlsAcceptor>,
) -> Result<HandshakeOutcome<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match read_frame(&mut socket).await? {
            StartupFrame::SslRequest => {
                let Some(acceptor) = tls else {
                    debug!("SSL requested but TLS is not configured, declining");
                    socket.write_all(b"N").await?;
                    socket.flush().await?;
                    continue;
                };

                socket.write_all(b"S").await?;
                socket.flush().await?;

                return match acceptor.accept(socket).into_fallible().await {
                    Ok(tls_stream) => {
                        debug!("TLS handshake complete");
                        startup_after_upgrade(tls_stream).await
                    }
                    Err((err, mut raw)) => {
                        let _ = send_error_response(
                            &mut raw,
                            SEVERITY_FATAL,
                            "08006",
                            &format!("TLS handshake failed: {}", err),
                        )
                        .await;
                        Err(ProxyError::TlsHandshake(err.to_string()))
                    }
                };
            }
            StartupFrame::GssEncRequest => {
                debug!("GSSAPI encryption requested, declining");
                socket.write_all(b"N").await?;
                socket.flush().await?;
            }
            StartupFrame::CancelRequest { process_id, .. } => {
                return Ok(HandshakeOutcome::Cancelled { process_id });
            }
            StartupFrame::Startup {
                protocol_version,
                parameters,
            } => {
                return Ok(finish(
                    ClientStream::Plain(socket),
                    protocol_version,
                    parameters,
                ));
            }
        }
    }
}

/// Continue decoding on the encrypted stream. No second upgrade is allowed.
async fn startup_after_upgrade<S>(
    mut tls_stream: tokio_rustls::server::TlsStream<S>,
) -> Result<HandshakeOutcome<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match read_frame(&mut tls_stream).await? {
            StartupFrame::SslRequest => {
                return Err(ProxyError::Framing(
                    "SSLRequest received after TLS upgrade".into(),
                ));
            }
            StartupFrame::GssEncRequest => {
                debug!("GSSAPI encryption requested inside TLS session, declining");
                tls_stream.write_all(b"N").await?;
                tls_stream.flush().await?;
            }
            StartupFrame::CancelRequest { process_id, .. } => {
                return Ok(HandshakeOutcome::Cancelled { process_id });
            }
            StartupFrame::Startup {
                protocol_version,
                parameters,
            } => {
                return Ok(finish(
                    ClientStream::Tls(Box::new(tls_stream)),
                    protocol_version,
                    parameters,
                ));
            }
        }
    }
}

fn finish<S>(
    stream: ClientStream<S>,
    protocol_version: u32,
    mut parameters: HashMap<String, String>,
) -> HandshakeOutcome<S> {
    if let Some(user) = parameters.get("user") {
        info!(user = %user, "client startup received");
    }
    let startup_packet = rewrite_startup(protocol_version, &mut parameters);
    HandshakeOutcome::Startup {
        stream,
        metadata: parameters,
        startup_packet,
    }
}
