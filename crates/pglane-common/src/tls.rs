//! TLS certificate material
//!
//! [`CertificateMaterial`] is the parsed server certificate/key pair shared
//! read-only by every connection, plus the PEM bytes it was built from so a
//! provider can persist it unchanged.

use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;

use crate::error::{ProxyError, Result};

/// Parsed certificate chain and private key, ready for TLS server use
#[derive(Debug)]
pub struct CertificateMaterial {
    /// Certificate chain in DER format
    cert_chain: Vec<CertificateDer<'static>>,
    /// Private key in DER format (stored as bytes for cloning)
    private_key_bytes: Vec<u8>,
    /// Original PEM encodings, kept for storage
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl Clone for CertificateMaterial {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key_bytes: self.private_key_bytes.clone(),
            cert_pem: self.cert_pem.clone(),
            key_pem: self.key_pem.clone(),
        }
    }
}

impl CertificateMaterial {
    /// Parse a PEM certificate/key pair.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let cert_chain = parse_pem_certs(cert_pem)?;
        if cert_chain.is_empty() {
            return Err(ProxyError::Tls("no certificate found in PEM data".into()));
        }
        let private_key = parse_pem_key(key_pem)?;

        let private_key_bytes = match &private_key {
            PrivateKeyDer::Pkcs1(key) => key.secret_pkcs1_der().to_vec(),
            PrivateKeyDer::Sec1(key) => key.secret_sec1_der().to_vec(),
            PrivateKeyDer::Pkcs8(key) => key.secret_pkcs8_der().to_vec(),
            _ => return Err(ProxyError::Tls("unsupported private key format".into())),
        };

        Ok(Self {
            cert_chain,
            private_key_bytes,
            cert_pem: cert_pem.to_vec(),
            key_pem: key_pem.to_vec(),
        })
    }

    /// Get the private key.
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        // Parse from stored bytes - always succeeds as we validated on construction
        PrivateKeyDer::try_from(self.private_key_bytes.clone())
            .expect("private key bytes were validated at construction")
    }

    /// PEM encoding of the certificate chain.
    pub fn cert_pem(&self) -> &[u8] {
        &self.cert_pem
    }

    /// PEM encoding of the private key.
    pub fn key_pem(&self) -> &[u8] {
        &self.key_pem
    }

    /// Build a rustls server config serving this certificate.
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.private_key())
            .map_err(|e| ProxyError::Tls(format!("failed to build server config: {}", e)))?;
        Ok(Arc::new(config))
    }
}

/// Generate a fresh self-signed certificate/key pair as PEM.
pub fn generate_self_signed(common_name: &str, san_dns: &[String]) -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.distinguished_name.push(DnType::OrganizationName, "pglane");

    let mut subject_alt_names = Vec::new();
    for dns in san_dns {
        subject_alt_names.push(rcgen::SanType::DnsName(
            dns.clone()
                .try_into()
                .map_err(|e| ProxyError::Tls(format!("invalid DNS name {}: {}", dns, e)))?,
        ));
    }
    params.subject_alt_names = subject_alt_names;

    let key_pair = KeyPair::generate()
        .map_err(|e| ProxyError::Tls(format!("failed to generate key pair: {}", e)))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ProxyError::Tls(format!("failed to generate certificate: {}", e)))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

fn parse_pem_certs(pem_data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem_data);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("failed to parse certificates: {}", e)))
}

fn parse_pem_key(pem_data: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem_data);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::Tls(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| ProxyError::Tls("no private key found in PEM data".into()))
}
