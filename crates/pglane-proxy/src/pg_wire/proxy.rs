//! Per-connection pipeline
//!
//! handshake → resolve → dial → forward startup → full-duplex relay.
//! Failures before the relay phase are reported to the client as
//! PostgreSQL ErrorResponse frames; once a byte has gone toward the
//! backend, failures close both sides silently.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use pglane_common::{CertificateMaterial, DatabaseType, ProxyError, Result};

use crate::discovery::BackendResolver;

use super::handshake::{perform_handshake, HandshakeOutcome};
use super::protocol::constants::SEVERITY_FATAL;
use super::protocol::messages::send_error_response;

/// Deadline for backend resolution. The watched registry answers from its
/// snapshot, so this only fires when the resolver itself is stuck.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handles one client connection end to end
pub struct PostgresProxy {
    resolver: Arc<dyn BackendResolver>,
    tls: Option<TlsAcceptor>,
    database_type: DatabaseType,
}

impl PostgresProxy {
    pub fn new(
        resolver: Arc<dyn BackendResolver>,
        tls_material: Option<&CertificateMaterial>,
        database_type: DatabaseType,
    ) -> Result<Self> {
        let tls = match tls_material {
            Some(material) => Some(TlsAcceptor::from(material.server_config()?)),
            None => {
                warn!("TLS is disabled, client connections will not be encrypted");
                None
            }
        };

        Ok(Self {
            resolver,
            tls,
            database_type,
        })
    }

    /// Take full ownership of an accepted connection. Never propagates an
    /// error out of the connection task.
    pub async fn handle_connection<S>(&self, socket: S, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Err(err) = self.run(socket).await {
            match err {
                // Plain disconnects during startup are routine
                ProxyError::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!(peer = ?peer, "client disconnected during startup");
                }
                err => {
                    error!(peer = ?peer, code = err.code(), error = %err, "connection failed");
                }
            }
        }
    }

    async fn run<S>(&self, socket: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // 1. Handshake and protocol parsing. The 08006 case writes its own
        //    frame inside the decoder; everything else closes silently.
        let (mut client, metadata, startup_packet) =
            match perform_handshake(socket, self.tls.as_ref()).await? {
                HandshakeOutcome::Startup {
                    stream,
                    metadata,
                    startup_packet,
                } => (stream, metadata, startup_packet),
                HandshakeOutcome::Cancelled { process_id } => {
                    info!(
                        process_id = process_id,
                        "cancel request received, not forwarded"
                    );
                    return Ok(());
                }
            };

        // 2. Resolve the backend under a deadline.
        let resolved = match timeout(
            RESOLVE_TIMEOUT,
            self.resolver.resolve(&metadata, self.database_type),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProxyError::NotFound("backend resolution timed out".into())),
        };

        let backend_addr = match resolved {
            Ok(addr) => addr,
            Err(err) => {
                let _ = send_error_response(
                    &mut client,
                    SEVERITY_FATAL,
                    "08001",
                    &format!("resolution failed: {}", err),
                )
                .await;
                return Err(err);
            }
        };

        // 3. Dial.
        let mut backend = match TcpStream::connect(&backend_addr).await {
            Ok(stream) => stream,
            Err(err) => {
                let _ = send_error_response(
                    &mut client,
                    SEVERITY_FATAL,
                    "08001",
                    &format!("failed to connect to backend {}: {}", backend_addr, err),
                )
                .await;
                return Err(ProxyError::Dial {
                    addr: backend_addr,
                    source: err,
                });
            }
        };

        // 4. Forward the rewritten startup message. From here on the backend
        //    may have answered, so no client-facing error frames anymore.
        backend.write_all(&startup_packet).await?;

        info!(backend = %backend_addr, "relaying");

        // 5. Full-duplex relay until both directions are done. Half-close is
        //    fine; copy_bidirectional finishes each direction independently.
        match copy_bidirectional(&mut client, &mut backend).await {
            Ok((to_backend, to_client)) => {
                info!(
                    backend = %backend_addr,
                    sent = to_backend,
                    received = to_client,
                    "session ended"
                );
            }
            Err(err) => {
                debug!(backend = %backend_addr, error = %err, "relay ended with error");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticResolver;
    use crate::pg_wire::protocol::parse_parameters;
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn startup_bytes(pairs: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(3u32 << 16).to_be_bytes());
        for (k, v) in pairs {
            body.extend_from_slice(k.as_bytes());
            body.push(0);
            body.extend_from_slice(v.as_bytes());
            body.push(0);
        }
        body.push(0);

        let mut frame = Vec::new();
        frame.extend_from_slice(&((4 + body.len()) as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    /// Read one startup frame off a backend-side socket and parse its params.
    async fn read_startup<S: AsyncRead + Unpin>(stream: &mut S) -> (u32, HashMap<String, String>) {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes(header) as usize;
        let mut payload = vec![0u8; len - 4];
        stream.read_exact(&mut payload).await.unwrap();
        let version = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        (version, parse_parameters(&payload[4..]).unwrap())
    }

    /// Read one ErrorResponse frame off the client side.
    async fn read_error_response<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<(u8, String)> {
        let mut kind = [0u8; 1];
        stream.read_exact(&mut kind).await.unwrap();
        assert_eq!(kind[0], b'E');

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; len - 4];
        stream.read_exact(&mut body).await.unwrap();

        let mut fields = Vec::new();
        let mut rest = &body[..];
        while rest[0] != 0 {
            let code = rest[0];
            let nul = rest[1..].iter().position(|&b| b == 0).unwrap() + 1;
            fields.push((code, String::from_utf8(rest[1..nul].to_vec()).unwrap()));
            rest = &rest[nul + 1..];
        }
        fields
    }

    fn proxy_for(table: &str) -> PostgresProxy {
        let resolver = Arc::new(StaticResolver::from_mapping(table).unwrap());
        PostgresProxy::new(resolver, None, DatabaseType::Postgresql).unwrap()
    }

    #[tokio::test]
    async fn test_routed_connection_rewrites_startup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = listener.local_addr().unwrap();

        let backend_task = tokio::spawn(async move {
            let (mut backend, _) = listener.accept().await.unwrap();
            let (version, params) = read_startup(&mut backend).await;
            assert_eq!(version, 3 << 16);
            assert_eq!(params["user"], "alice");
            assert_eq!(params["database"], "app");
            assert_eq!(params["application_name"], "psql");
            assert!(!params.contains_key("deployment_id"));
            assert!(!params.contains_key("pooled"));
            assert!(!params.contains_key("username"));

            // Answer with a few bytes to exercise the backend→client leg
            backend.write_all(b"RELAYOK").await.unwrap();
            backend.flush().await.unwrap();
        });

        let proxy = proxy_for(&format!("db-prod={}", backend_addr));
        let (client, server) = tokio::io::duplex(16 * 1024);

        let proxy_task = tokio::spawn(async move {
            proxy.handle_connection(server, None).await;
        });

        let mut client = client;
        client
            .write_all(&startup_bytes(&[
                ("user", "alice.db-prod"),
                ("database", "app"),
                ("application_name", "psql"),
            ]))
            .await
            .unwrap();

        let mut answer = [0u8; 7];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"RELAYOK");

        drop(client);
        backend_task.await.unwrap();
        proxy_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_pooled_routing_and_database_default() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = listener.local_addr().unwrap();

        let backend_task = tokio::spawn(async move {
            let (mut backend, _) = listener.accept().await.unwrap();
            let (_, params) = read_startup(&mut backend).await;
            assert_eq!(params["user"], "alice");
            // No database was sent, so the proxy substituted "postgres"
            assert_eq!(params["database"], "postgres");
        });

        let proxy = proxy_for(&format!("db-prod.pool={}", backend_addr));
        let (client, server) = tokio::io::duplex(16 * 1024);

        let proxy_task = tokio::spawn(async move {
            proxy.handle_connection(server, None).await;
        });

        let mut client = client;
        client
            .write_all(&startup_bytes(&[("user", "alice.db-prod.pool")]))
            .await
            .unwrap();

        backend_task.await.unwrap();
        drop(client);
        proxy_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_resolution_failure_reports_08001() {
        let proxy = proxy_for("db-prod=127.0.0.1:5432");
        let (client, server) = tokio::io::duplex(16 * 1024);

        let proxy_task = tokio::spawn(async move {
            proxy.handle_connection(server, None).await;
        });

        let mut client = client;
        client
            .write_all(&startup_bytes(&[("user", "alice.missing")]))
            .await
            .unwrap();

        let fields = read_error_response(&mut client).await;
        let severity = &fields.iter().find(|(c, _)| *c == b'S').unwrap().1;
        let sqlstate = &fields.iter().find(|(c, _)| *c == b'C').unwrap().1;
        let message = &fields.iter().find(|(c, _)| *c == b'M').unwrap().1;
        assert_eq!(severity, "FATAL");
        assert_eq!(sqlstate, "08001");
        assert!(message.starts_with("resolution failed:"));
        assert!(message.contains("not found"));

        // Connection closes after the error frame
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        proxy_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_reports_08001() {
        // An address nothing listens on: bind a listener, grab the port,
        // then drop it before the proxy dials.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let proxy = proxy_for(&format!("db-prod={}", dead_addr));
        let (client, server) = tokio::io::duplex(16 * 1024);

        let proxy_task = tokio::spawn(async move {
            proxy.handle_connection(server, None).await;
        });

        let mut client = client;
        client
            .write_all(&startup_bytes(&[("user", "alice.db-prod")]))
            .await
            .unwrap();

        let fields = read_error_response(&mut client).await;
        let sqlstate = &fields.iter().find(|(c, _)| *c == b'C').unwrap().1;
        let message = &fields.iter().find(|(c, _)| *c == b'M').unwrap().1;
        assert_eq!(sqlstate, "08001");
        assert!(message.contains("failed to connect to backend"));

        proxy_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_to_backend_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = listener.local_addr().unwrap();

        let backend_task = tokio::spawn(async move {
            let (mut backend, _) = listener.accept().await.unwrap();
            let _ = read_startup(&mut backend).await;

            // Client-originated bytes after startup arrive untouched
            let mut buf = [0u8; 5];
            backend.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"QUERY");
        });

        let proxy = proxy_for(&format!("db-prod={}", backend_addr));
        let (client, server) = tokio::io::duplex(16 * 1024);

        let proxy_task = tokio::spawn(async move {
            proxy.handle_connection(server, None).await;
        });

        let mut client = client;
        client
            .write_all(&startup_bytes(&[("user", "alice.db-prod")]))
            .await
            .unwrap();
        client.write_all(b"QUERY").await.unwrap();

        backend_task.await.unwrap();
        drop(client);
        proxy_task.await.unwrap();
    }
}
