//! In-memory TLS provider, for development and tests

use async_trait::async_trait;
use parking_lot::RwLock;

use pglane_common::{CertificateMaterial, ProxyError, Result};

use super::TlsProvider;

/// Holds the certificate pair in a process-local slot
#[derive(Default)]
pub struct MemoryTlsProvider {
    slot: RwLock<Option<CertificateMaterial>>,
}

impl MemoryTlsProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TlsProvider for MemoryTlsProvider {
    async fn get_certificate(&self) -> Result<CertificateMaterial> {
        self.slot
            .read()
            .clone()
            .ok_or_else(|| ProxyError::NotFound("no certificate stored".into()))
    }

    async fn store(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<()> {
        let material = CertificateMaterial::from_pem(cert_pem, key_pem)?;
        *self.slot.write() = Some(material);
        Ok(())
    }
}
