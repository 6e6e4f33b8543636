//! PostgreSQL wire protocol constants

/// SSLRequest magic number
pub const SSL_REQUEST_CODE: u32 = (1234 << 16) | 5679; // 80877103

/// GSSENCRequest magic number
pub const GSSENC_REQUEST_CODE: u32 = (1234 << 16) | 5680; // 80877104

/// CancelRequest magic number
pub const CANCEL_REQUEST_CODE: u32 = (1234 << 16) | 5678; // 80877102

/// Minimum total length of a startup frame (length field + code)
pub const MIN_STARTUP_LENGTH: usize = 8;

/// Maximum total length of a startup frame. Startup messages carry a handful
/// of short parameters; anything bigger is a framing violation.
pub const MAX_STARTUP_LENGTH: usize = 10_000;

/// Severity used for every pre-relay error reported to the client
pub const SEVERITY_FATAL: &str = "FATAL";
