//! Error types for pglane services

/// Result type alias using ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Main error type for the proxy pipeline and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Startup bytes violate the frame grammar
    #[error("protocol framing error: {0}")]
    Framing(String),

    /// TLS server handshake with the client failed
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Certificate material could not be loaded, parsed or stored
    #[error("TLS error: {0}")]
    Tls(String),

    /// Routing metadata is missing a required key
    #[error("invalid routing metadata: {0}")]
    InvalidMetadata(String),

    /// No backend matches the routing metadata
    #[error("backend not found: {0}")]
    NotFound(String),

    /// TCP connection to the resolved backend failed
    #[error("failed to connect to backend {addr}: {source}")]
    Dial {
        addr: String,
        source: std::io::Error,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kubernetes(String),

    /// Underlying socket I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// SQLSTATE reported to the client when this error aborts a connection
    /// before the relay phase. Errors that close silently return `None`.
    pub fn sqlstate(&self) -> Option<&'static str> {
        match self {
            // sqlclient_unable_to_establish_sqlconnection
            ProxyError::InvalidMetadata(_) | ProxyError::NotFound(_) | ProxyError::Dial { .. } => {
                Some("08001")
            }
            // connection_failure
            ProxyError::TlsHandshake(_) => Some("08006"),
            _ => None,
        }
    }

    /// Short classifier used in log fields
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::Framing(_) => "FRAMING",
            ProxyError::TlsHandshake(_) => "TLS_HANDSHAKE",
            ProxyError::Tls(_) => "TLS",
            ProxyError::InvalidMetadata(_) => "INVALID_METADATA",
            ProxyError::NotFound(_) => "NOT_FOUND",
            ProxyError::Dial { .. } => "DIAL",
            ProxyError::Config(_) => "CONFIG",
            ProxyError::Kubernetes(_) => "KUBERNETES",
            ProxyError::Io(_) => "IO",
        }
    }

    /// Whether this error means "the thing does not exist" as opposed to
    /// "looking for it failed". The TLS bootstrap uses this to decide
    /// between generating a fresh certificate and giving up.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProxyError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_mapping() {
        assert_eq!(
            ProxyError::NotFound("key db-1".into()).sqlstate(),
            Some("08001")
        );
        assert_eq!(
            ProxyError::TlsHandshake("bad record".into()).sqlstate(),
            Some("08006")
        );
        assert_eq!(ProxyError::Framing("short".into()).sqlstate(), None);
    }

    #[test]
    fn test_not_found_display_mentions_not_found() {
        let err = ProxyError::NotFound("no backend for key: db-1".into());
        assert!(err.to_string().contains("not found"));
    }
}
