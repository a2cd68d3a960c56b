/// Certificate management over the store.
///
/// Acquisition and renewal are performed by an external ACME client;
/// the core only persists records, answers HTTP-01 challenges it has
/// been handed, and signals the collaborator over the event channel.
/// The core never calls out to the ACME client directly.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::{EdgeError, EdgeResult};
use crate::store::{CertificateRecord, Store};
use crate::utils::now_millis;

/// Events published for external collaborators (ACME client, dashboard)
#[derive(Debug, Clone)]
pub enum CoreEvent {
    CertificateRequested { id: String, domain: String },
    CertificateRenewalRequested { id: String, domain: String },
    CertificateDeleted { id: String, domain: String },
}

const EVENT_CAPACITY: usize = 64;

pub struct CertificateManager {
    store: Arc<Store>,
    events: broadcast::Sender<CoreEvent>,
    /// ACME HTTP-01 tokens, populated by the external client
    challenges: RwLock<HashMap<String, String>>,
}

impl CertificateManager {
    pub fn new(store: Arc<Store>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            events,
            challenges: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Create a pending certificate record for `domain` and signal the
    /// ACME collaborator. The record stays expired until installed.
    pub async fn request(&self, domain: &str) -> EdgeResult<CertificateRecord> {
        let domain = domain.trim().to_ascii_lowercase();
        if domain.is_empty() || !domain.contains('.') {
            return Err(EdgeError::validation(format!("invalid domain: {domain:?}")));
        }
        if self.lookup_domain(&domain).await?.is_some() {
            return Err(EdgeError::AlreadyExists(format!("certificate for {domain}")));
        }

        let now = now_millis();
        let record = CertificateRecord {
            id: Uuid::new_v4().to_string(),
            domain: domain.clone(),
            certificate: String::new(),
            private_key: String::new(),
            chain: None,
            issuer: String::new(),
            // Pending until the ACME client installs the real material
            expires_at: now,
            auto_renew: true,
            provider: "letsencrypt".to_string(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.put(&record).await?;
        let _ = self.events.send(CoreEvent::CertificateRequested {
            id: record.id.clone(),
            domain,
        });
        Ok(record)
    }

    /// Install issued material into an existing record; called by the
    /// ACME collaborator once an order completes
    pub async fn install(
        &self,
        id: &str,
        certificate: String,
        private_key: String,
        chain: Option<String>,
        issuer: String,
        expires_at: u64,
    ) -> EdgeResult<CertificateRecord> {
        let mut record: CertificateRecord = self.store.get(id).await?;
        record.certificate = certificate;
        record.private_key = private_key;
        record.chain = chain;
        record.issuer = issuer;
        record.expires_at = expires_at;
        record.updated_at = now_millis();
        self.store.put(&record).await?;
        Ok(record)
    }

    /// Mark a certificate for renewal and signal the collaborator
    pub async fn renew(&self, id: &str) -> EdgeResult<CertificateRecord> {
        let record: CertificateRecord = self.store.get(id).await?;
        let _ = self.events.send(CoreEvent::CertificateRenewalRequested {
            id: record.id.clone(),
            domain: record.domain.clone(),
        });
        Ok(record)
    }

    pub async fn delete(&self, id: &str) -> EdgeResult<()> {
        let record: CertificateRecord = self.store.get(id).await?;
        self.store.delete::<CertificateRecord>(id).await?;
        let _ = self.events.send(CoreEvent::CertificateDeleted {
            id: record.id,
            domain: record.domain,
        });
        Ok(())
    }

    pub async fn get(&self, id: &str) -> EdgeResult<CertificateRecord> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> EdgeResult<Vec<CertificateRecord>> {
        self.store.list().await
    }

    /// Find by domain through the unique index
    pub async fn lookup_domain(&self, domain: &str) -> EdgeResult<Option<CertificateRecord>> {
        let mut records: Vec<CertificateRecord> =
            self.store.index_lookup("domain", domain).await?;
        Ok(records.pop())
    }

    /// Certificates inside the renewal window, expired ones included
    pub async fn expiring_soon(&self) -> EdgeResult<Vec<CertificateRecord>> {
        let now = now_millis();
        let records: Vec<CertificateRecord> = self.store.list().await?;
        Ok(records
            .into_iter()
            .filter(|c| c.expiring_soon(now))
            .collect())
    }

    /// Publish an HTTP-01 token; the edge serves it on
    /// `/.well-known/acme-challenge/<token>`
    pub async fn set_challenge(&self, token: String, key_auth: String) {
        self.challenges.write().await.insert(token, key_auth);
    }

    pub async fn challenge(&self, token: &str) -> Option<String> {
        self.challenges.read().await.get(token).cloned()
    }

    pub async fn clear_challenge(&self, token: &str) {
        self.challenges.write().await.remove(token);
    }
}
