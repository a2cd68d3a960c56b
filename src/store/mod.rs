/// Replicated persistent tables for pools, backends, and certificates.
///
/// The store owns the persisted bytes: an in-process engine per table
/// (no external database), writes linearizable per key locally, changes
/// fanned out to subscribers and shipped asynchronously to cluster
/// peers with last-write-wins on `updated_at`.
pub mod engine;
pub mod wal;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::core::{Algorithm, AlgorithmState, Backend, SslMode};
use crate::error::{EdgeError, EdgeResult};
use crate::utils::now_millis;

use engine::TableEngine;

/// The three logical tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Pools,
    Backends,
    Certificates,
}

impl Table {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Table::Pools => "pools",
            Table::Backends => "backends",
            Table::Certificates => "certificates",
        }
    }

    fn indexed_fields(&self) -> &'static [&'static str] {
        match self {
            Table::Pools => &[],
            Table::Backends => &["pool_name", "healthy"],
            Table::Certificates => &["domain", "expires_at"],
        }
    }

    pub const ALL: [Table; 3] = [Table::Pools, Table::Backends, Table::Certificates];
}

/// A typed record living in one table
pub trait Record: Serialize + DeserializeOwned + Clone {
    const TABLE: Table;
    fn key(&self) -> String;
    fn updated_at(&self) -> u64;
}

/// Persisted pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    pub name: String,
    pub algorithm: Algorithm,
    #[serde(default)]
    pub ssl_mode: SslMode,
    #[serde(default)]
    pub ssl_domain: Option<String>,
    #[serde(default)]
    pub ssl_cert_id: Option<String>,
    #[serde(default)]
    pub validate_backend_cert: bool,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,
    #[serde(default)]
    pub algorithm_state: AlgorithmState,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: u64,
    pub updated_at: u64,
}

fn default_health_interval() -> u64 {
    10_000
}

impl PoolRecord {
    pub fn new(name: impl Into<String>, algorithm: Algorithm) -> Self {
        let now = now_millis();
        Self {
            name: name.into(),
            algorithm,
            ssl_mode: SslMode::Off,
            ssl_domain: None,
            ssl_cert_id: None,
            validate_backend_cert: false,
            health_check_interval_ms: default_health_interval(),
            algorithm_state: AlgorithmState::default(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> EdgeResult<()> {
        if self.name.is_empty() {
            return Err(EdgeError::validation("pool name cannot be empty"));
        }
        if self.health_check_interval_ms < 1_000 {
            return Err(EdgeError::validation(
                "health_check_interval_ms must be at least 1000",
            ));
        }
        if self.ssl_mode == SslMode::FullStrict && !self.validate_backend_cert {
            return Err(EdgeError::validation(
                "ssl_mode full_strict requires validate_backend_cert",
            ));
        }
        Ok(())
    }
}

impl Record for PoolRecord {
    const TABLE: Table = Table::Pools;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn updated_at(&self) -> u64 {
        self.updated_at
    }
}

/// Persisted backend, keyed `<pool_name>/<backend_id>`.
///
/// The volatile counters inside `backend` are checkpointed
/// opportunistically; the pool actor owns the live values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRecord {
    pub pool_name: String,
    /// Mirror of `backend.healthy` kept at the top level for indexing
    pub healthy: bool,
    pub backend: Backend,
}

impl BackendRecord {
    pub fn new(pool_name: impl Into<String>, backend: Backend) -> Self {
        Self {
            pool_name: pool_name.into(),
            healthy: backend.healthy,
            backend,
        }
    }

    pub fn record_key(pool_name: &str, backend_id: &str) -> String {
        format!("{pool_name}/{backend_id}")
    }
}

impl Record for BackendRecord {
    const TABLE: Table = Table::Backends;

    fn key(&self) -> String {
        Self::record_key(&self.pool_name, &self.backend.id())
    }

    fn updated_at(&self) -> u64 {
        self.backend.updated_at
    }
}

/// Persisted certificate, keyed by uuid with a unique domain index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: String,
    pub domain: String,
    pub certificate: String,
    pub private_key: String,
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub issuer: String,
    /// Unix millis; always present
    pub expires_at: u64,
    #[serde(default = "default_true")]
    pub auto_renew: bool,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: u64,
    pub updated_at: u64,
}

fn default_true() -> bool {
    true
}

fn default_provider() -> String {
    "letsencrypt".to_string()
}

/// Thirty days, in milliseconds
const EXPIRY_WINDOW_MS: u64 = 30 * 24 * 60 * 60 * 1000;

impl CertificateRecord {
    pub fn expired(&self, now: u64) -> bool {
        self.expires_at < now
    }

    pub fn expiring_soon(&self, now: u64) -> bool {
        self.expires_at.saturating_sub(now) <= EXPIRY_WINDOW_MS
    }
}

impl Record for CertificateRecord {
    const TABLE: Table = Table::Certificates;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn updated_at(&self) -> u64 {
        self.updated_at
    }
}

/// A change applied to a table, local or replicated from a peer
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Put { key: String, value: Value },
    Delete { key: String },
}

/// One write as shipped between cluster nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationFrame {
    pub table: Table,
    pub key: String,
    #[serde(default)]
    pub value: Option<Value>,
    pub updated_at: u64,
}

const EVENT_CAPACITY: usize = 256;

struct TableSlot {
    engine: Mutex<TableEngine>,
    events: broadcast::Sender<ChangeEvent>,
}

/// The replicated store
pub struct Store {
    root: PathBuf,
    tables: HashMap<Table, TableSlot>,
    replicator: std::sync::Mutex<Option<mpsc::UnboundedSender<ReplicationFrame>>>,
}

impl Store {
    /// Open all tables under `root`, initializing schema metadata
    /// idempotently. Corruption beyond a truncated WAL tail is an error
    /// here and fatal to startup.
    pub async fn open(root: &Path) -> EdgeResult<Self> {
        tokio::fs::create_dir_all(root.join("schema"))
            .await
            .map_err(|e| EdgeError::storage(format!("create {}: {e}", root.display())))?;

        let schema_path = root.join("schema").join("schema.json");
        if !schema_path.exists() {
            let schema = serde_json::json!({
                "version": 1,
                "tables": Table::ALL.iter().map(|t| t.dir_name()).collect::<Vec<_>>(),
                "created_at": now_millis(),
            });
            tokio::fs::write(&schema_path, serde_json::to_vec_pretty(&schema).unwrap())
                .await
                .map_err(|e| EdgeError::storage(format!("write schema: {e}")))?;
        }

        let mut tables = HashMap::new();
        for table in Table::ALL {
            let engine =
                TableEngine::open(&root.join(table.dir_name()), table.indexed_fields()).await?;
            let (events, _) = broadcast::channel(EVENT_CAPACITY);
            tables.insert(
                table,
                TableSlot {
                    engine: Mutex::new(engine),
                    events,
                },
            );
        }

        Ok(Self {
            root: root.to_path_buf(),
            tables,
            replicator: std::sync::Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wire the outbound replication queue; set once by the cluster
    pub fn set_replicator(&self, tx: mpsc::UnboundedSender<ReplicationFrame>) {
        *self.replicator.lock().expect("replicator lock poisoned") = Some(tx);
    }

    /// Durable write: returns after local commit, replication is
    /// enqueued asynchronously
    pub async fn put<R: Record>(&self, record: &R) -> EdgeResult<()> {
        let key = record.key();
        let updated_at = record.updated_at();
        let value = serde_json::to_value(record)
            .map_err(|e| EdgeError::storage(format!("encode record: {e}")))?;

        let slot = self.slot(R::TABLE);
        slot.engine
            .lock()
            .await
            .put(&key, value.clone(), updated_at)
            .await?;

        let _ = slot.events.send(ChangeEvent::Put {
            key: key.clone(),
            value: value.clone(),
        });
        self.replicate(ReplicationFrame {
            table: R::TABLE,
            key,
            value: Some(value),
            updated_at,
        });
        Ok(())
    }

    pub async fn get<R: Record>(&self, key: &str) -> EdgeResult<R> {
        let slot = self.slot(R::TABLE);
        let engine = slot.engine.lock().await;
        let value = engine
            .get(key)
            .ok_or_else(|| EdgeError::NotFound(format!("{}/{key}", R::TABLE.dir_name())))?;
        serde_json::from_value(value.clone())
            .map_err(|e| EdgeError::storage(format!("decode record: {e}")))
    }

    /// Unordered snapshot of all records in the table
    pub async fn list<R: Record>(&self) -> EdgeResult<Vec<R>> {
        let slot = self.slot(R::TABLE);
        let engine = slot.engine.lock().await;
        engine
            .list()
            .into_iter()
            .map(|(_, value)| {
                serde_json::from_value(value)
                    .map_err(|e| EdgeError::storage(format!("decode record: {e}")))
            })
            .collect()
    }

    /// Idempotent delete; succeeds even if the key is absent
    pub async fn delete<R: Record>(&self, key: &str) -> EdgeResult<()> {
        self.delete_in(R::TABLE, key).await
    }

    pub async fn delete_in(&self, table: Table, key: &str) -> EdgeResult<()> {
        let updated_at = now_millis();
        let slot = self.slot(table);
        slot.engine.lock().await.delete(key, updated_at).await?;

        let _ = slot.events.send(ChangeEvent::Delete {
            key: key.to_string(),
        });
        self.replicate(ReplicationFrame {
            table,
            key: key.to_string(),
            value: None,
            updated_at,
        });
        Ok(())
    }

    /// All records where `field == value`, served from the maintained
    /// secondary index
    pub async fn index_lookup<R: Record>(&self, field: &str, value: &str) -> EdgeResult<Vec<R>> {
        let slot = self.slot(R::TABLE);
        let engine = slot.engine.lock().await;
        engine
            .index_lookup(field, value)
            .into_iter()
            .filter_map(|key| engine.get(&key).cloned())
            .map(|value| {
                serde_json::from_value(value)
                    .map_err(|e| EdgeError::storage(format!("decode record: {e}")))
            })
            .collect()
    }

    /// Change stream for one table, including peer-applied changes
    pub fn subscribe(&self, table: Table) -> broadcast::Receiver<ChangeEvent> {
        self.slot(table).events.subscribe()
    }

    /// Apply a peer write under last-write-wins; emits a change event
    /// when the write is applied, and never re-replicates
    pub async fn apply_remote(&self, frame: ReplicationFrame) -> EdgeResult<bool> {
        let slot = self.slot(frame.table);
        let applied = slot
            .engine
            .lock()
            .await
            .apply_remote(&frame.key, frame.value.clone(), frame.updated_at)
            .await?;
        if applied {
            let event = match frame.value {
                Some(value) => ChangeEvent::Put {
                    key: frame.key,
                    value,
                },
                None => ChangeEvent::Delete { key: frame.key },
            };
            let _ = slot.events.send(event);
        }
        Ok(applied)
    }

    /// Full table dump (live records and tombstones) for bootstrapping a
    /// joining peer
    pub async fn dump(&self, table: Table) -> Vec<ReplicationFrame> {
        let slot = self.slot(table);
        let engine = slot.engine.lock().await;
        engine
            .dump()
            .into_iter()
            .map(|(key, value, updated_at)| ReplicationFrame {
                table,
                key,
                value,
                updated_at,
            })
            .collect()
    }

    fn slot(&self, table: Table) -> &TableSlot {
        self.tables.get(&table).expect("all tables opened")
    }

    fn replicate(&self, frame: ReplicationFrame) {
        if let Some(tx) = self
            .replicator
            .lock()
            .expect("replicator lock poisoned")
            .as_ref()
        {
            let _ = tx.send(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_record(name: &str) -> PoolRecord {
        PoolRecord::new(name, Algorithm::RoundRobin)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        store.put(&pool_record("web")).await.unwrap();
        let loaded: PoolRecord = store.get("web").await.unwrap();
        assert_eq!(loaded.name, "web");
        assert_eq!(loaded.algorithm, Algorithm::RoundRobin);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let result: EdgeResult<PoolRecord> = store.get("missing").await;
        assert!(matches!(result, Err(EdgeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_restart_yields_identical_record() {
        let dir = tempfile::tempdir().unwrap();
        let original = pool_record("web");
        {
            let store = Store::open(dir.path()).await.unwrap();
            store.put(&original).await.unwrap();
        }
        let store = Store::open(dir.path()).await.unwrap();
        let loaded: PoolRecord = store.get("web").await.unwrap();
        assert_eq!(
            serde_json::to_value(&loaded).unwrap(),
            serde_json::to_value(&original).unwrap()
        );
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        store.put(&pool_record("web")).await.unwrap();
        store.delete::<PoolRecord>("web").await.unwrap();
        store.delete::<PoolRecord>("web").await.unwrap();

        let result: EdgeResult<PoolRecord> = store.get("web").await;
        assert!(matches!(result, Err(EdgeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_backend_index_lookup_by_pool() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        let b1 = Backend::new("http://a:1").unwrap();
        let mut b2 = Backend::new("http://a:2").unwrap();
        b2.set_health(false);
        let b3 = Backend::new("http://a:3").unwrap();

        store.put(&BackendRecord::new("web", b1)).await.unwrap();
        store.put(&BackendRecord::new("web", b2)).await.unwrap();
        store.put(&BackendRecord::new("api", b3)).await.unwrap();

        let web: Vec<BackendRecord> = store.index_lookup("pool_name", "web").await.unwrap();
        assert_eq!(web.len(), 2);
        assert!(web.iter().all(|r| r.pool_name == "web"));

        let healthy: Vec<BackendRecord> = store.index_lookup("healthy", "true").await.unwrap();
        assert_eq!(healthy.len(), 2);
    }

    #[tokio::test]
    async fn test_certificate_domain_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        let now = now_millis();
        let cert = CertificateRecord {
            id: "cert-1".to_string(),
            domain: "example.com".to_string(),
            certificate: "PEM".to_string(),
            private_key: "PEM".to_string(),
            chain: None,
            issuer: "test".to_string(),
            expires_at: now + 90 * 24 * 3600 * 1000,
            auto_renew: true,
            provider: "letsencrypt".to_string(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        store.put(&cert).await.unwrap();

        let found: Vec<CertificateRecord> =
            store.index_lookup("domain", "example.com").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "cert-1");
    }

    #[tokio::test]
    async fn test_subscribe_sees_local_and_remote_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let mut events = store.subscribe(Table::Pools);

        store.put(&pool_record("web")).await.unwrap();
        match events.recv().await.unwrap() {
            ChangeEvent::Put { key, .. } => assert_eq!(key, "web"),
            other => panic!("unexpected event: {other:?}"),
        }

        let frame = ReplicationFrame {
            table: Table::Pools,
            key: "api".to_string(),
            value: Some(serde_json::to_value(pool_record("api")).unwrap()),
            updated_at: now_millis() + 1,
        };
        assert!(store.apply_remote(frame).await.unwrap());
        match events.recv().await.unwrap() {
            ChangeEvent::Put { key, .. } => assert_eq!(key, "api"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replication_queue_receives_local_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.set_replicator(tx);

        store.put(&pool_record("web")).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.table, Table::Pools);
        assert_eq!(frame.key, "web");
        assert!(frame.value.is_some());

        // Remote applies never loop back into replication
        let incoming = ReplicationFrame {
            table: Table::Pools,
            key: "peer".to_string(),
            value: Some(serde_json::to_value(pool_record("peer")).unwrap()),
            updated_at: now_millis() + 1,
        };
        store.apply_remote(incoming).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pool_record_validation() {
        let mut record = pool_record("web");
        assert!(record.validate().is_ok());

        record.health_check_interval_ms = 500;
        assert!(record.validate().is_err());
        record.health_check_interval_ms = 10_000;

        record.ssl_mode = SslMode::FullStrict;
        record.validate_backend_cert = false;
        assert!(record.validate().is_err());
        record.validate_backend_cert = true;
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_certificate_expiry_windows() {
        let now = now_millis();
        let mut cert = CertificateRecord {
            id: "c".into(),
            domain: "d".into(),
            certificate: String::new(),
            private_key: String::new(),
            chain: None,
            issuer: String::new(),
            expires_at: now + 90 * 24 * 3600 * 1000,
            auto_renew: true,
            provider: default_provider(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        assert!(!cert.expired(now));
        assert!(!cert.expiring_soon(now));

        cert.expires_at = now + 10 * 24 * 3600 * 1000;
        assert!(!cert.expired(now));
        assert!(cert.expiring_soon(now));

        cert.expires_at = now - 1;
        assert!(cert.expired(now));
        assert!(cert.expiring_soon(now));
    }
}
