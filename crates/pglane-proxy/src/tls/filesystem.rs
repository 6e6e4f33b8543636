//! Filesystem TLS provider
//!
//! Loads and stores the certificate pair as two PEM files. The key file is
//! written with mode 0600, the certificate with 0644.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use pglane_common::{CertificateMaterial, ProxyError, Result};

use super::TlsProvider;

pub struct FileTlsProvider {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl FileTlsProvider {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProxyError::NotFound(format!("certificate file {}", path.display()))
        } else {
            ProxyError::Tls(format!("failed to read {}: {}", path.display(), e))
        }
    })
}

async fn write_pem(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    tokio::fs::write(path, data)
        .await
        .map_err(|e| ProxyError::Tls(format!("failed to write {}: {}", path.display(), e)))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| ProxyError::Tls(format!("failed to chmod {}: {}", path.display(), e)))
}

#[async_trait]
impl TlsProvider for FileTlsProvider {
    async fn get_certificate(&self) -> Result<CertificateMaterial> {
        let cert_pem = read_pem(&self.cert_path).await?;
        let key_pem = read_pem(&self.key_path).await?;
        CertificateMaterial::from_pem(&cert_pem, &key_pem)
    }

    async fn store(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<()> {
        write_pem(&self.cert_path, cert_pem, 0o644).await?;
        write_pem(&self.key_path, key_pem, 0o600).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pglane_common::tls::generate_self_signed;

    fn temp_paths(tag: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "pglane-tls-test-{}-{}",
            tag,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        (dir.join("tls.crt"), dir.join("tls.key"))
    }

    #[tokio::test]
    async fn test_missing_files_are_not_found() {
        let (cert, key) = temp_paths("missing");
        let provider = FileTlsProvider::new(cert, key);
        let err = provider.get_certificate().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_store_sets_modes_and_round_trips() {
        let (cert_path, key_path) = temp_paths("modes");
        let provider = FileTlsProvider::new(cert_path.clone(), key_path.clone());

        let (cert_pem, key_pem) =
            generate_self_signed("pglane.local", &["localhost".to_string()]).unwrap();
        provider
            .store(cert_pem.as_bytes(), key_pem.as_bytes())
            .await
            .unwrap();

        let cert_mode = std::fs::metadata(&cert_path).unwrap().permissions().mode() & 0o777;
        let key_mode = std::fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(cert_mode, 0o644);
        assert_eq!(key_mode, 0o600);

        let material = provider.get_certificate().await.unwrap();
        assert_eq!(material.key_pem(), key_pem.as_bytes());
    }
}
