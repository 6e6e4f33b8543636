//! PostgreSQL wire protocol proxying
//!
//! ## Module structure
//!
//! - `protocol` - startup framing, constants and the ErrorResponse builder
//! - `handshake` - startup decoding with optional TLS upgrade
//! - `routing` - routing-key extraction and startup rewriting
//! - `proxy` - the per-connection pipeline
//! - `server` - accept loop

pub mod handshake;
pub mod protocol;
pub mod routing;
pub mod proxy;
pub mod server;

pub use proxy::PostgresProxy;
pub use server::ProxyServer;
