//! Accept loop
//!
//! Owns the single listener and hands every accepted socket to a fresh
//! connection task. All per-connection work happens in the task.

use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use pglane_common::config::env_parse_or_default;

use super::proxy::PostgresProxy;

pub struct ProxyServer {
    listener: TcpListener,
    proxy: Arc<PostgresProxy>,
    keepalive_secs: u64,
}

impl ProxyServer {
    pub fn new(listener: TcpListener, proxy: Arc<PostgresProxy>) -> Self {
        Self {
            listener,
            proxy,
            keepalive_secs: env_parse_or_default("PGLANE_TCP_KEEPALIVE_SECS", 10),
        }
    }

    /// Accept connections forever. An accept error is fatal and bubbles up.
    pub async fn serve(self) -> std::io::Result<()> {
        info!(addr = %self.listener.local_addr()?, "proxy listening");

        loop {
            let (socket, peer_addr) = self.listener.accept().await?;
            debug!(peer = %peer_addr, "accepted connection");

            configure_tcp_keepalive(&socket, self.keepalive_secs);

            let proxy = self.proxy.clone();
            tokio::spawn(async move {
                proxy.handle_connection(socket, Some(peer_addr)).await;
            });
        }
    }
}

/// Configure TCP keepalive on an accepted socket. Detects dead peers much
/// faster than kernel defaults, which matters for long-lived idle sessions.
fn configure_tcp_keepalive(stream: &TcpStream, keepalive_secs: u64) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {}", e);
    }

    let socket = SockRef::from(stream);

    if let Err(e) = socket.set_keepalive(true) {
        warn!("failed to enable TCP keepalive: {}", e);
        return;
    }

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(keepalive_secs))
        .with_interval(Duration::from_secs(keepalive_secs / 2 + 1));

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(3);

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("failed to configure TCP keepalive timing: {}", e);
    }
}
