//! pglane proxy
//!
//! Transparent content-routing proxy for the PostgreSQL wire protocol.
//! Clients encode their destination into the `user` startup parameter
//! (`alice.db-prod`, `alice.db-prod.pool`); the proxy resolves a backend
//! from a static table or a watched Kubernetes Service registry, rewrites
//! the startup message, and relays bytes until either side closes.

mod discovery;
mod http_api;
mod pg_wire;
mod telemetry;
mod tls;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use pglane_common::{Config, DatabaseType, DiscoveryMode, TlsMode};

use crate::discovery::{BackendResolver, KubernetesResolver, StaticResolver};
use crate::http_api::ReadyState;
use crate::pg_wire::{PostgresProxy, ProxyServer};

#[derive(Parser, Debug)]
#[command(name = "pglane-proxy")]
#[command(about = "Content-routing PostgreSQL wire protocol proxy")]
struct Args {
    /// PostgreSQL listener port
    #[arg(long, env = "PGLANE_PROXY_PORT", default_value = "5432")]
    proxy_port: u16,

    /// Health/readiness probe port
    #[arg(long, env = "PGLANE_HEALTH_PORT", default_value = "8080")]
    health_port: u16,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize rustls crypto provider (required by the kube client too)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let cfg = Config::load_from_env().context("invalid configuration")?;

    let log_level = if cfg.debug { "debug" } else { &args.log_level };
    telemetry::init(log_level)?;

    info!("starting pglane proxy");
    info!("  database type: {}", cfg.database_type);
    info!("  discovery mode: {:?}", cfg.discovery_mode);
    info!("  TLS: enabled={} mode={:?}", cfg.tls_enabled, cfg.tls_mode);
    info!("  proxy port: {}", args.proxy_port);
    info!("  health port: {}", args.health_port);

    // Kubernetes client, shared by the registry resolver and the secret
    // provider when either is configured
    let needs_kube = cfg.discovery_mode == DiscoveryMode::Kubernetes
        || (cfg.tls_enabled && cfg.tls_mode == TlsMode::Kubernetes);
    let kube_client = if needs_kube {
        Some(
            kube::Client::try_default()
                .await
                .context("failed to create kubernetes client")?,
        )
    } else {
        None
    };

    // Backend resolver
    let resolver: Arc<dyn BackendResolver> = match cfg.discovery_mode {
        DiscoveryMode::Static => {
            info!(backends = %cfg.static_backends, "using static backend resolver");
            Arc::new(StaticResolver::from_mapping(&cfg.static_backends)?)
        }
        DiscoveryMode::Kubernetes => {
            info!("using kubernetes service registry resolver");
            Arc::new(KubernetesResolver::new(
                kube_client.clone().expect("kube client present"),
            ))
        }
    };

    // TLS material, acquired once and shared read-only by every connection
    let tls_material = if cfg.tls_enabled {
        let provider = tls::provider_from_config(&cfg, kube_client)?;
        Some(
            tls::ensure_certificate(provider.as_ref(), &cfg)
                .await
                .context("certificate bootstrap failed")?,
        )
    } else {
        warn!("TLS is disabled, SSL requests will be declined");
        None
    };

    // Protocol handler
    let proxy = match cfg.database_type {
        DatabaseType::Postgresql => Arc::new(PostgresProxy::new(
            resolver,
            tls_material.as_ref(),
            cfg.database_type,
        )?),
        other => anyhow::bail!("{} proxying is not implemented", other),
    };

    // Probe surface on its own port
    let ready = ReadyState::new();
    let health_listener = TcpListener::bind(("0.0.0.0", args.health_port))
        .await
        .with_context(|| format!("failed to bind health port {}", args.health_port))?;
    let health_state = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = http_api::serve(health_listener, health_state).await {
            error!("health server error: {}", e);
        }
    });

    // Proxy listener
    let listener = TcpListener::bind(("0.0.0.0", args.proxy_port))
        .await
        .with_context(|| format!("failed to bind proxy port {}", args.proxy_port))?;
    let server = ProxyServer::new(listener, proxy);

    ready.set_ready(true);

    tokio::select! {
        result = server.serve() => {
            result.context("accept loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down pglane proxy");
        }
    }

    Ok(())
}
