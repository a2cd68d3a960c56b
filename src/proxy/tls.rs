/// Dynamic listener TLS: the certificate is chosen per-handshake from
/// the SNI server name, looked up in the replicated certificate table.
use std::sync::Arc;

use async_trait::async_trait;
use pingora_core::listeners::TlsAccept;
use pingora_core::tls::ext;
use pingora_core::tls::pkey::PKey;
use pingora_core::tls::ssl::{NameType, SslRef};
use pingora_core::tls::x509::X509;

use crate::certs::CertificateManager;
use crate::store::CertificateRecord;

pub struct SniCertResolver {
    certs: Arc<CertificateManager>,
}

impl SniCertResolver {
    pub fn new(certs: Arc<CertificateManager>) -> Self {
        Self { certs }
    }

    async fn lookup(&self, server_name: &str) -> Option<CertificateRecord> {
        let record = self
            .certs
            .lookup_domain(&server_name.to_ascii_lowercase())
            .await
            .ok()
            .flatten()?;
        if record.certificate.is_empty() || record.private_key.is_empty() {
            // Requested but not yet issued
            return None;
        }
        Some(record)
    }
}

#[async_trait]
impl TlsAccept for SniCertResolver {
    async fn certificate_callback(&self, ssl: &mut SslRef) {
        let Some(server_name) = ssl.servername(NameType::HOST_NAME).map(str::to_string) else {
            log::debug!("TLS client offered no SNI, handshake will fail");
            return;
        };

        let Some(record) = self.lookup(&server_name).await else {
            log::warn!("no certificate installed for {server_name}");
            return;
        };

        let cert = match X509::from_pem(record.certificate.as_bytes()) {
            Ok(cert) => cert,
            Err(e) => {
                log::warn!("certificate for {server_name} is not valid PEM: {e}");
                return;
            }
        };
        let key = match PKey::private_key_from_pem(record.private_key.as_bytes()) {
            Ok(key) => key,
            Err(e) => {
                log::warn!("private key for {server_name} is not valid PEM: {e}");
                return;
            }
        };

        if let Err(e) = ext::ssl_use_certificate(ssl, &cert) {
            log::warn!("failed to attach certificate for {server_name}: {e}");
            return;
        }
        if let Err(e) = ext::ssl_use_private_key(ssl, &key) {
            log::warn!("failed to attach private key for {server_name}: {e}");
            return;
        }

        if let Some(chain) = &record.chain {
            for pem in X509::stack_from_pem(chain.as_bytes()).unwrap_or_default() {
                if let Err(e) = ext::ssl_add_chain_cert(ssl, &pem) {
                    log::warn!("failed to attach chain certificate for {server_name}: {e}");
                    return;
                }
            }
        }

        log::debug!("TLS handshake for {server_name} using certificate {}", record.id);
    }
}
