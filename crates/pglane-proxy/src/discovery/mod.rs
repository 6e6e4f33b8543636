//! Backend discovery
//!
//! A [`BackendResolver`] maps routing metadata extracted from the client
//! handshake to a concrete `host:port`. Two strategies exist: a static
//! mapping table and a watched Kubernetes Service registry.

use std::collections::HashMap;

use async_trait::async_trait;

use pglane_common::{DatabaseType, Result};

pub mod kubernetes;
pub mod static_table;

pub use kubernetes::KubernetesResolver;
pub use static_table::StaticResolver;

/// Parameters extracted from the protocol handshake, used to pick a backend.
///
/// Holds every original startup parameter plus the extracted routing keys.
pub type RoutingMetadata = HashMap<String, String>;

/// Routing key: the backend class an extracted `user` points at
pub const META_DEPLOYMENT_ID: &str = "deployment_id";
/// Routing key: `"true"` when the client asked for the pooled backend
pub const META_POOLED: &str = "pooled";
/// Routing key: the client's real username, with the routing suffix stripped
pub const META_USERNAME: &str = "username";

/// Maps routing metadata to a backend address.
///
/// Implementations are called concurrently from every connection task and
/// must not hold locks across I/O.
#[async_trait]
pub trait BackendResolver: Send + Sync {
    async fn resolve(
        &self,
        metadata: &RoutingMetadata,
        database_type: DatabaseType,
    ) -> Result<String>;
}
