//! Environment-driven configuration for the proxy
//!
//! Everything is read once at startup into an immutable [`Config`].
//! Discovery and TLS modes auto-detect from which variables are present,
//! and an explicit `PGLANE_DISCOVERY_MODE` / `PGLANE_TLS_MODE` overrides
//! the detection.

use std::fmt;
use std::str::FromStr;

use crate::error::{ProxyError, Result};

/// Database protocol spoken by the proxied backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    Postgresql,
    Mysql,
    Mongodb,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Postgresql => "postgresql",
            DatabaseType::Mysql => "mysql",
            DatabaseType::Mongodb => "mongodb",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseType {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DatabaseType::Postgresql),
            "mysql" => Ok(DatabaseType::Mysql),
            "mongodb" => Ok(DatabaseType::Mongodb),
            other => Err(ProxyError::Config(format!(
                "unsupported database type: {} (supported: postgresql, mysql, mongodb)",
                other
            ))),
        }
    }
}

/// Backend discovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    Kubernetes,
    Static,
}

/// TLS certificate storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    File,
    Kubernetes,
    Memory,
}

/// Immutable application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,
    pub database_type: DatabaseType,

    /// Kubernetes namespace this instance runs in (used for the TLS secret)
    pub namespace: String,

    // Backend discovery
    pub discovery_mode: DiscoveryMode,
    pub static_backends: String,

    // TLS
    pub tls_enabled: bool,
    pub tls_mode: TlsMode,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    pub tls_secret_name: String,
    pub tls_auto_generate: bool,
}

impl Config {
    /// Load configuration from environment variables and validate it.
    pub fn load_from_env() -> Result<Self> {
        let cfg = Config {
            debug: env_parse_or_default("PGLANE_DEBUG", false),
            database_type: env_or_default("PGLANE_DATABASE_TYPE", "postgresql").parse()?,

            namespace: determine_namespace(),

            discovery_mode: determine_discovery_mode(),
            static_backends: env_or_default("PGLANE_STATIC_BACKENDS", ""),

            tls_enabled: env_parse_or_default("PGLANE_TLS_ENABLED", true),
            tls_mode: determine_tls_mode(),
            tls_cert_file: env_or_default("PGLANE_TLS_CERT_FILE", ""),
            tls_key_file: env_or_default("PGLANE_TLS_KEY_FILE", ""),
            tls_secret_name: env_or_default("PGLANE_TLS_SECRET_NAME", ""),
            tls_auto_generate: env_parse_or_default("PGLANE_TLS_AUTO_GENERATE", true),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Ensure the configuration is coherent.
    pub fn validate(&self) -> Result<()> {
        if self.tls_enabled {
            if self.tls_mode == TlsMode::File
                && (self.tls_cert_file.is_empty() || self.tls_key_file.is_empty())
            {
                return Err(ProxyError::Config(
                    "PGLANE_TLS_CERT_FILE and PGLANE_TLS_KEY_FILE must be set for file TLS mode"
                        .into(),
                ));
            }

            if self.tls_mode == TlsMode::Kubernetes {
                if self.tls_secret_name.is_empty() {
                    return Err(ProxyError::Config(
                        "PGLANE_TLS_SECRET_NAME must be set for kubernetes TLS mode".into(),
                    ));
                }
                if self.discovery_mode == DiscoveryMode::Static {
                    return Err(ProxyError::Config(
                        "kubernetes TLS mode requires kubernetes discovery \
                         (cannot be combined with PGLANE_STATIC_BACKENDS)"
                            .into(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Get environment variable with default
pub fn env_or_default(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

/// Get environment variable as parsed type with default
pub fn env_parse_or_default<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn determine_namespace() -> String {
    // Kubernetes downward API first, then a generic override
    if let Ok(ns) = std::env::var("POD_NAMESPACE") {
        if !ns.is_empty() {
            return ns;
        }
    }
    if let Ok(ns) = std::env::var("NAMESPACE") {
        if !ns.is_empty() {
            return ns;
        }
    }

    // In-cluster serviceaccount mount
    if let Ok(data) =
        std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
    {
        let ns = data.trim();
        if !ns.is_empty() {
            return ns.to_string();
        }
    }

    "default".to_string()
}

fn determine_discovery_mode() -> DiscoveryMode {
    if let Ok(mode) = std::env::var("PGLANE_DISCOVERY_MODE") {
        if mode.eq_ignore_ascii_case("static") {
            return DiscoveryMode::Static;
        }
        if !mode.is_empty() {
            return DiscoveryMode::Kubernetes;
        }
    }

    // Auto-detect: static iff a backend table is configured
    if !env_or_default("PGLANE_STATIC_BACKENDS", "").is_empty() {
        return DiscoveryMode::Static;
    }

    DiscoveryMode::Kubernetes
}

fn determine_tls_mode() -> TlsMode {
    if let Ok(mode) = std::env::var("PGLANE_TLS_MODE") {
        match mode.to_ascii_lowercase().as_str() {
            "file" | "filesystem" => return TlsMode::File,
            "kubernetes" | "k8s" | "secret" => return TlsMode::Kubernetes,
            "memory" | "in-memory" => return TlsMode::Memory,
            _ => {}
        }
    }

    // Auto-detect based on which material source is configured
    if !env_or_default("PGLANE_TLS_CERT_FILE", "").is_empty() {
        return TlsMode::File;
    }
    if !env_or_default("PGLANE_TLS_SECRET_NAME", "").is_empty() {
        return TlsMode::Kubernetes;
    }

    TlsMode::Memory
}
