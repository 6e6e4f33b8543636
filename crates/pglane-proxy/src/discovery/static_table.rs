//! Static backend table
//!
//! Resolves deployments from a fixed comma-separated mapping string, e.g.
//! `db-prod=10.0.0.5:5432,db-prod.pool=10.0.0.5:6432`. Intended for
//! development and for running outside a cluster.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use pglane_common::{DatabaseType, ProxyError, Result};

use super::{BackendResolver, RoutingMetadata, META_DEPLOYMENT_ID, META_POOLED};

/// Resolver backed by an immutable in-memory table
pub struct StaticResolver {
    backends: HashMap<String, String>,
}

impl StaticResolver {
    /// Parse a mapping string of the form `key=host:port[,key=host:port...]`
    /// where `key` is `<deployment_id>` or `<deployment_id>.pool`.
    /// An empty string yields an empty table.
    pub fn from_mapping(mapping: &str) -> Result<Self> {
        let mut backends = HashMap::new();
        if mapping.is_empty() {
            return Ok(Self { backends });
        }

        for pair in mapping.split(',') {
            let pair = pair.trim();
            let mut parts = pair.splitn(2, '=');
            let (key, addr) = match (parts.next(), parts.next()) {
                (Some(k), Some(a)) if !k.is_empty() && !a.is_empty() && !a.contains('=') => {
                    (k.trim(), a.trim())
                }
                _ => {
                    return Err(ProxyError::Config(format!(
                        "invalid backend mapping entry: {:?}",
                        pair
                    )))
                }
            };
            backends.insert(key.to_string(), addr.to_string());
        }

        Ok(Self { backends })
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[async_trait]
impl BackendResolver for StaticResolver {
    async fn resolve(
        &self,
        metadata: &RoutingMetadata,
        _database_type: DatabaseType,
    ) -> Result<String> {
        let deployment_id = metadata
            .get(META_DEPLOYMENT_ID)
            .ok_or_else(|| ProxyError::InvalidMetadata("missing deployment_id".into()))?;

        let pooled = metadata.get(META_POOLED).map(String::as_str) == Some("true");
        let key = if pooled {
            format!("{}.pool", deployment_id)
        } else {
            deployment_id.clone()
        };

        let addr = self
            .backends
            .get(&key)
            .ok_or_else(|| ProxyError::NotFound(format!("no backend for key: {}", key)))?;

        debug!(deployment_id = %deployment_id, pooled = pooled, backend = %addr, "static resolution");
        Ok(addr.clone())
    }
}
