//! TLS certificate providers
//!
//! A [`TlsProvider`] retrieves and persists the server certificate pair.
//! Three storage backends exist (in-memory, filesystem, Kubernetes secret),
//! plus the self-signed bootstrap that runs once at startup.

use async_trait::async_trait;
use tracing::{info, warn};

use pglane_common::config::env_or_default;
use pglane_common::{tls, CertificateMaterial, Config, ProxyError, Result, TlsMode};

pub mod filesystem;
pub mod kubernetes;
pub mod memory;

pub use filesystem::FileTlsProvider;
pub use kubernetes::SecretTlsProvider;
pub use memory::MemoryTlsProvider;

/// Retrieves and persists the server certificate pair.
///
/// `get_certificate` surfaces absence as [`ProxyError::NotFound`] so the
/// bootstrap can distinguish "nothing stored yet" from a broken backend.
#[async_trait]
pub trait TlsProvider: Send + Sync {
    async fn get_certificate(&self) -> Result<CertificateMaterial>;
    async fn store(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<()>;
}

/// Build the provider selected by configuration.
pub fn provider_from_config(
    cfg: &Config,
    client: Option<kube::Client>,
) -> Result<Box<dyn TlsProvider>> {
    match cfg.tls_mode {
        TlsMode::File => {
            info!(cert = %cfg.tls_cert_file, key = %cfg.tls_key_file, "using file TLS provider");
            Ok(Box::new(FileTlsProvider::new(
                cfg.tls_cert_file.clone(),
                cfg.tls_key_file.clone(),
            )))
        }
        TlsMode::Kubernetes => {
            let client = client.ok_or_else(|| {
                ProxyError::Config(
                    "kubernetes TLS mode requires a kubernetes client (kubernetes discovery)"
                        .into(),
                )
            })?;
            info!(namespace = %cfg.namespace, secret = %cfg.tls_secret_name, "using kubernetes TLS provider");
            Ok(Box::new(SecretTlsProvider::new(
                client,
                cfg.namespace.clone(),
                cfg.tls_secret_name.clone(),
            )))
        }
        TlsMode::Memory => {
            info!("using in-memory TLS provider");
            Ok(Box::new(MemoryTlsProvider::new()))
        }
    }
}

/// Acquire the certificate the proxy will serve, generating and storing a
/// self-signed pair when none exists yet.
///
/// A failed store is retried as a read: a sibling instance may have stored
/// material between our get and our store, and its material is as good as
/// ours. Only when that second read also fails is bootstrap fatal.
pub async fn ensure_certificate(
    provider: &dyn TlsProvider,
    cfg: &Config,
) -> Result<CertificateMaterial> {
    match provider.get_certificate().await {
        Ok(material) => {
            info!("certificate loaded");
            Ok(material)
        }
        Err(err) if err.is_not_found() => {
            if !cfg.tls_auto_generate {
                return Err(ProxyError::Tls(format!(
                    "certificate not found and auto-generation is disabled: {}",
                    err
                )));
            }

            info!("certificate not found, generating self-signed pair");
            let common_name = env_or_default("PGLANE_TLS_COMMON_NAME", "pglane.local");
            let san_dns = vec![
                "localhost".to_string(),
                "pglane-proxy".to_string(),
                format!("*.{}.svc.cluster.local", cfg.namespace),
            ];
            let (cert_pem, key_pem) = tls::generate_self_signed(&common_name, &san_dns)?;

            match provider
                .store(cert_pem.as_bytes(), key_pem.as_bytes())
                .await
            {
                Ok(()) => {
                    info!("self-signed certificate stored");
                    CertificateMaterial::from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
                }
                Err(store_err) => {
                    // A sibling may have won the race; its certificate works too.
                    warn!(error = %store_err, "certificate store failed, re-reading");
                    let material = provider.get_certificate().await.map_err(|get_err| {
                        ProxyError::Tls(format!(
                            "store failed ({}) and no certificate could be read back: {}",
                            store_err, get_err
                        ))
                    })?;
                    info!("loaded certificate stored by a concurrent instance");
                    Ok(material)
                }
            }
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn test_config(auto_generate: bool) -> Config {
        Config {
            debug: false,
            database_type: pglane_common::DatabaseType::Postgresql,
            namespace: "default".into(),
            discovery_mode: pglane_common::DiscoveryMode::Static,
            static_backends: String::new(),
            tls_enabled: true,
            tls_mode: TlsMode::Memory,
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            tls_secret_name: String::new(),
            tls_auto_generate: auto_generate,
        }
    }

    /// Provider whose store always fails, with a slot a "sibling" can fill.
    struct RacingProvider {
        slot: Mutex<Option<CertificateMaterial>>,
    }

    #[async_trait]
    impl TlsProvider for RacingProvider {
        async fn get_certificate(&self) -> Result<CertificateMaterial> {
            self.slot
                .lock()
                .clone()
                .ok_or_else(|| ProxyError::NotFound("no certificate stored".into()))
        }

        async fn store(&self, _cert_pem: &[u8], _key_pem: &[u8]) -> Result<()> {
            // Simulate losing the creation race: our write is rejected, but
            // by now the sibling's material is in place.
            let (cert_pem, key_pem) =
                tls::generate_self_signed("sibling.local", &["localhost".to_string()])?;
            *self.slot.lock() = Some(CertificateMaterial::from_pem(
                cert_pem.as_bytes(),
                key_pem.as_bytes(),
            )?);
            Err(ProxyError::Tls("already exists".into()))
        }
    }

    #[tokio::test]
    async fn test_bootstrap_generates_when_missing() {
        let provider = MemoryTlsProvider::new();
        let material = ensure_certificate(&provider, &test_config(true))
            .await
            .unwrap();
        assert!(!material.cert_pem().is_empty());

        // And the provider now serves it
        provider.get_certificate().await.unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_fatal_without_auto_generate() {
        let provider = MemoryTlsProvider::new();
        assert!(ensure_certificate(&provider, &test_config(false))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_survives_store_race() {
        let provider = RacingProvider {
            slot: Mutex::new(None),
        };
        let material = ensure_certificate(&provider, &test_config(true))
            .await
            .unwrap();
        // The sibling's certificate was adopted
        assert!(String::from_utf8_lossy(material.cert_pem()).contains("BEGIN CERTIFICATE"));
    }

    /// Provider that is simply broken: store fails and nothing lands.
    struct BrokenProvider;

    #[async_trait]
    impl TlsProvider for BrokenProvider {
        async fn get_certificate(&self) -> Result<CertificateMaterial> {
            Err(ProxyError::NotFound("no certificate stored".into()))
        }

        async fn store(&self, _cert_pem: &[u8], _key_pem: &[u8]) -> Result<()> {
            Err(ProxyError::Tls("backend unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_bootstrap_fatal_when_store_and_reread_fail() {
        assert!(ensure_certificate(&BrokenProvider, &test_config(true))
            .await
            .is_err());
    }
}
