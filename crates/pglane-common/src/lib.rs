//! pglane common library
//!
//! Shared configuration, error types and TLS certificate material for the
//! pglane proxy.

pub mod config;
pub mod error;
pub mod tls;

// Re-export commonly used types
pub use config::{Config, DatabaseType, DiscoveryMode, TlsMode};
pub use error::{ProxyError, Result};
pub use tls::CertificateMaterial;
