//! Kubernetes Service registry resolver
//!
//! A background task watches Services cluster-wide and keeps an immutable
//! snapshot of the ones labeled for proxying. Resolution scans the snapshot
//! it grabs from the slot; the lock is never held across I/O.
//!
//! A Service opts in with labels:
//!
//! ```text
//! pglane.io/enabled: "true"
//! pglane.io/database-type: "postgresql"
//! pglane.io/deployment-id: "db-prod"
//! pglane.io/pooled: "false"
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::watcher;
use kube::{Api, Client};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use pglane_common::{DatabaseType, ProxyError, Result};

use super::{BackendResolver, RoutingMetadata, META_DEPLOYMENT_ID, META_POOLED};

pub const LABEL_ENABLED: &str = "pglane.io/enabled";
pub const LABEL_DATABASE_TYPE: &str = "pglane.io/database-type";
pub const LABEL_DEPLOYMENT_ID: &str = "pglane.io/deployment-id";
pub const LABEL_POOLED: &str = "pglane.io/pooled";

/// One labeled Service as seen by the resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub namespace: String,
    pub enabled: bool,
    pub database_type: String,
    pub deployment_id: String,
    pub pooled: String,
    pub ports: Vec<i32>,
}

type Snapshot = Arc<Vec<ServiceRecord>>;

/// Resolver over a live snapshot of labeled Services
pub struct KubernetesResolver {
    snapshot: Arc<RwLock<Snapshot>>,
}

impl KubernetesResolver {
    /// Start watching Services and return the resolver. The watcher task
    /// runs for the lifetime of the process and swaps in a fresh snapshot
    /// on every registry change.
    pub fn new(client: Client) -> Self {
        let snapshot: Arc<RwLock<Snapshot>> = Arc::new(RwLock::new(Arc::new(Vec::new())));

        let slot = snapshot.clone();
        tokio::spawn(async move {
            run_watcher(client, slot).await;
        });

        Self { snapshot }
    }

    /// Build a resolver over a fixed record set (no watcher).
    #[cfg(test)]
    pub fn from_records(records: Vec<ServiceRecord>) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(Arc::new(records))),
        }
    }
}

#[async_trait]
impl BackendResolver for KubernetesResolver {
    async fn resolve(
        &self,
        metadata: &RoutingMetadata,
        database_type: DatabaseType,
    ) -> Result<String> {
        let deployment_id = metadata
            .get(META_DEPLOYMENT_ID)
            .ok_or_else(|| ProxyError::InvalidMetadata("missing deployment_id".into()))?;
        let pooled = metadata
            .get(META_POOLED)
            .map(String::as_str)
            .unwrap_or("false");

        // Clone the handle out; the scan runs without the lock.
        let snapshot = self.snapshot.read().clone();

        for record in snapshot.iter() {
            if !record.enabled
                || record.database_type != database_type.as_str()
                || record.deployment_id != *deployment_id
                || record.pooled != pooled
            {
                continue;
            }

            let port = record.ports.first().ok_or_else(|| {
                ProxyError::NotFound(format!(
                    "service {}/{} has no ports",
                    record.namespace, record.name
                ))
            })?;

            let addr = format!(
                "{}.{}.svc.cluster.local:{}",
                record.name, record.namespace, port
            );
            debug!(deployment_id = %deployment_id, pooled = %pooled, backend = %addr, "registry resolution");
            return Ok(addr);
        }

        Err(ProxyError::NotFound(format!(
            "no service for deployment {} (pooled={})",
            deployment_id, pooled
        )))
    }
}

/// Extract a record from a Service if it carries the deployment-id label.
fn record_from_service(svc: &Service) -> Option<ServiceRecord> {
    let labels = svc.metadata.labels.as_ref()?;
    let deployment_id = labels.get(LABEL_DEPLOYMENT_ID)?.clone();

    let ports = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| ports.iter().map(|p| p.port).collect())
        .unwrap_or_default();

    Some(ServiceRecord {
        name: svc.metadata.name.clone()?,
        namespace: svc.metadata.namespace.clone()?,
        enabled: labels.get(LABEL_ENABLED).map(String::as_str) == Some("true"),
        database_type: labels
            .get(LABEL_DATABASE_TYPE)
            .cloned()
            .unwrap_or_default(),
        deployment_id,
        pooled: labels
            .get(LABEL_POOLED)
            .cloned()
            .unwrap_or_else(|| "false".to_string()),
        ports,
    })
}

fn service_key(svc: &Service) -> Option<String> {
    Some(format!(
        "{}/{}",
        svc.metadata.namespace.as_deref()?,
        svc.metadata.name.as_deref()?
    ))
}

fn publish(slot: &Arc<RwLock<Snapshot>>, store: &BTreeMap<String, ServiceRecord>) {
    let records: Vec<ServiceRecord> = store.values().cloned().collect();
    *slot.write() = Arc::new(records);
}

/// Drive the Service watcher, installing a fresh snapshot on every change.
/// Watch errors are transient; the stream resumes on its own.
async fn run_watcher(client: Client, slot: Arc<RwLock<Snapshot>>) {
    let api: Api<Service> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default()).boxed();

    let mut store: BTreeMap<String, ServiceRecord> = BTreeMap::new();
    let mut pending: BTreeMap<String, ServiceRecord> = BTreeMap::new();

    info!("service registry watcher started");

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Init) => {
                pending.clear();
            }
            Ok(watcher::Event::InitApply(svc)) => {
                if let (Some(key), Some(record)) = (service_key(&svc), record_from_service(&svc)) {
                    pending.insert(key, record);
                }
            }
            Ok(watcher::Event::InitDone) => {
                store = std::mem::take(&mut pending);
                publish(&slot, &store);
                info!(services = store.len(), "service registry synced");
            }
            Ok(watcher::Event::Apply(svc)) => {
                let Some(key) = service_key(&svc) else {
                    continue;
                };
                match record_from_service(&svc) {
                    Some(record) => {
                        debug!(service = %key, deployment_id = %record.deployment_id, "service applied");
                        store.insert(key, record);
                    }
                    // Labels were removed; the service no longer routes.
                    None => {
                        store.remove(&key);
                    }
                }
                publish(&slot, &store);
            }
            Ok(watcher::Event::Delete(svc)) => {
                if let Some(key) = service_key(&svc) {
                    debug!(service = %key, "service deleted");
                    store.remove(&key);
                    publish(&slot, &store);
                }
            }
            Err(err) => {
                warn!(error = %err, "service watch error, stream will resume");
            }
        }
    }

    warn!("service registry watcher stream ended");
}
