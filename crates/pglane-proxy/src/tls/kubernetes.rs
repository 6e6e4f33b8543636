//! Kubernetes secret TLS provider
//!
//! Stores the certificate pair in a `kubernetes.io/tls` secret under the
//! standard `tls.crt` / `tls.key` fields. Creation races with sibling
//! instances resolve to an update.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::debug;

use pglane_common::{CertificateMaterial, ProxyError, Result};

use super::TlsProvider;

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

pub struct SecretTlsProvider {
    api: Api<Secret>,
    namespace: String,
    secret_name: String,
}

impl SecretTlsProvider {
    pub fn new(client: Client, namespace: String, secret_name: String) -> Self {
        let api = Api::namespaced(client, &namespace);
        Self {
            api,
            namespace,
            secret_name,
        }
    }

    fn build_secret(&self, cert_pem: &[u8], key_pem: &[u8]) -> Secret {
        let mut data = BTreeMap::new();
        data.insert(TLS_CERT_KEY.to_string(), ByteString(cert_pem.to_vec()));
        data.insert(TLS_PRIVATE_KEY_KEY.to_string(), ByteString(key_pem.to_vec()));

        Secret {
            metadata: ObjectMeta {
                name: Some(self.secret_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(data),
            ..Default::default()
        }
    }
}

fn material_from_secret(secret: &Secret, name: &str) -> Result<CertificateMaterial> {
    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| ProxyError::NotFound(format!("secret {} has no data", name)))?;

    let cert = data
        .get(TLS_CERT_KEY)
        .ok_or_else(|| ProxyError::NotFound(format!("secret {} missing {}", name, TLS_CERT_KEY)))?;
    let key = data.get(TLS_PRIVATE_KEY_KEY).ok_or_else(|| {
        ProxyError::NotFound(format!("secret {} missing {}", name, TLS_PRIVATE_KEY_KEY))
    })?;

    CertificateMaterial::from_pem(&cert.0, &key.0)
}

#[async_trait]
impl TlsProvider for SecretTlsProvider {
    async fn get_certificate(&self) -> Result<CertificateMaterial> {
        let secret = self.api.get(&self.secret_name).await.map_err(|e| match e {
            kube::Error::Api(ref ae) if ae.code == 404 => ProxyError::NotFound(format!(
                "secret {}/{}",
                self.namespace, self.secret_name
            )),
            other => ProxyError::Kubernetes(format!(
                "failed to get secret {}/{}: {}",
                self.namespace, self.secret_name, other
            )),
        })?;

        material_from_secret(&secret, &self.secret_name)
    }

    async fn store(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<()> {
        // Validate before touching the cluster
        CertificateMaterial::from_pem(cert_pem, key_pem)?;

        let secret = self.build_secret(cert_pem, key_pem);
        let pp = PostParams::default();

        match self.api.create(&pp, &secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(secret = %self.secret_name, "secret exists, replacing");
                self.api
                    .replace(&self.secret_name, &pp, &secret)
                    .await
                    .map_err(|e| {
                        ProxyError::Kubernetes(format!(
                            "failed to update secret {}/{}: {}",
                            self.namespace, self.secret_name, e
                        ))
                    })?;
                Ok(())
            }
            Err(e) => Err(ProxyError::Kubernetes(format!(
                "failed to create secret {}/{}: {}",
                self.namespace, self.secret_name, e
            ))),
        }
    }
}
