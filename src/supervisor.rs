/// Dynamic supervision of pool actors.
///
/// The supervisor hydrates the registry from the store at startup and
/// keeps it converged afterwards: admin mutations go through it, and a
/// watcher task applies change events (including writes replicated from
/// peers) to the running actors. Pool create spawns an actor and its
/// health checker; pool delete joins the actor and cancels the checker.
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::core::{Backend, Pool, PoolConfig, PoolHandle, PoolRegistry, PoolStats};
use crate::error::{EdgeError, EdgeResult};
use crate::health::HealthChecker;
use crate::store::{BackendRecord, ChangeEvent, PoolRecord, Record, Store, Table};
use crate::utils::now_millis;

pub struct PoolSupervisor {
    store: Arc<Store>,
    registry: Arc<PoolRegistry>,
    /// Deadline applied to proxied requests unless a pool overrides it
    default_request_timeout_ms: u64,
}

impl PoolSupervisor {
    pub fn new(store: Arc<Store>, registry: Arc<PoolRegistry>, request_timeout_ms: u64) -> Self {
        Self {
            store,
            registry,
            default_request_timeout_ms: request_timeout_ms,
        }
    }

    pub fn registry(&self) -> Arc<PoolRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Spawn actors for every stored pool, then start the watcher that
    /// follows store changes
    pub async fn start(self: &Arc<Self>) -> EdgeResult<JoinHandle<()>> {
        let pools: Vec<PoolRecord> = self.store.list().await?;
        for record in pools {
            let backends = self.stored_backends(&record.name).await?;
            self.spawn_pool(&record, backends).await;
        }

        let supervisor = Arc::clone(self);
        Ok(tokio::spawn(supervisor.watch()))
    }

    /// Create and persist a pool, then run it
    pub async fn create_pool(&self, record: PoolRecord) -> EdgeResult<PoolRecord> {
        record.validate()?;
        if self.store.get::<PoolRecord>(&record.name).await.is_ok() {
            return Err(EdgeError::AlreadyExists(format!("pool {}", record.name)));
        }
        self.store.put(&record).await?;
        self.spawn_pool(&record, Vec::new()).await;
        Ok(record)
    }

    /// Delete a pool: stored record, stored backends, and the running
    /// actor with its health checker
    pub async fn delete_pool(&self, name: &str) -> EdgeResult<()> {
        let _: PoolRecord = self.store.get(name).await?;

        let backends: Vec<BackendRecord> = self.store.index_lookup("pool_name", name).await?;
        for record in backends {
            self.store
                .delete::<BackendRecord>(&record.key())
                .await?;
        }
        self.store.delete::<PoolRecord>(name).await?;
        self.registry.deregister(name).await;
        Ok(())
    }

    pub async fn pool(&self, name: &str) -> EdgeResult<PoolHandle> {
        self.registry
            .get(name)
            .await
            .ok_or_else(|| EdgeError::NotFound(format!("pool {name}")))
    }

    /// Add a backend to a running pool and persist it
    pub async fn add_backend(&self, pool_name: &str, url: &str) -> EdgeResult<Backend> {
        let pool = self.pool(pool_name).await?;
        let backend = pool.add_backend_url(url).await?;
        self.store
            .put(&BackendRecord::new(pool_name, backend.clone()))
            .await?;
        Ok(backend)
    }

    /// Remove a backend from a running pool and the store
    pub async fn remove_backend(&self, pool_name: &str, backend_id: &str) -> EdgeResult<()> {
        let pool = self.pool(pool_name).await?;
        pool.remove_backend(backend_id).await?;
        self.store
            .delete::<BackendRecord>(&BackendRecord::record_key(pool_name, backend_id))
            .await?;
        Ok(())
    }

    pub async fn stats(&self, pool_name: &str) -> EdgeResult<PoolStats> {
        self.pool(pool_name).await?.stats().await
    }

    async fn stored_backends(&self, pool_name: &str) -> EdgeResult<Vec<Backend>> {
        let records: Vec<BackendRecord> = self.store.index_lookup("pool_name", pool_name).await?;
        Ok(records.into_iter().map(|r| r.backend).collect())
    }

    fn pool_config(&self, record: &PoolRecord) -> PoolConfig {
        PoolConfig {
            name: record.name.clone(),
            algorithm: record.algorithm,
            ssl_mode: record.ssl_mode,
            ssl_domain: record.ssl_domain.clone(),
            ssl_cert_id: record.ssl_cert_id.clone(),
            validate_backend_cert: record.validate_backend_cert,
            health_check_interval_ms: record.health_check_interval_ms,
            request_timeout_ms: self.default_request_timeout_ms,
        }
    }

    async fn spawn_pool(&self, record: &PoolRecord, backends: Vec<Backend>) {
        let config = self.pool_config(record);
        let (handle, actor) =
            Pool::spawn_with_state(config, backends, record.algorithm_state);

        let store = Arc::clone(&self.store);
        let checkpoint = Arc::new(move |pool_name: String, backends: Vec<Backend>| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for mut backend in backends {
                    backend.updated_at = now_millis();
                    let record = BackendRecord::new(pool_name.clone(), backend);
                    if let Err(e) = store.put(&record).await {
                        log::warn!("health checkpoint for {} failed: {e}", record.key());
                    }
                }
            });
        });
        let checker = HealthChecker::new(handle.clone(), record.health_check_interval_ms)
            .with_checkpoint(checkpoint)
            .spawn();

        log::info!("pool {} running ({})", record.name, record.algorithm.as_str());
        self.registry.register(handle, actor, Some(checker)).await;
    }

    /// Follow store change events and converge the running actors.
    ///
    /// Local admin calls already updated the actors, so everything here
    /// is idempotent; the interesting traffic is writes applied from
    /// cluster peers.
    async fn watch(self: Arc<Self>) {
        let mut pool_events = self.store.subscribe(Table::Pools);
        let mut backend_events = self.store.subscribe(Table::Backends);

        loop {
            tokio::select! {
                event = pool_events.recv() => {
                    match event {
                        Ok(event) => self.apply_pool_event(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("pool event stream lagged by {n}, resyncing");
                            self.resync_pools().await;
                        }
                        Err(_) => return,
                    }
                }
                event = backend_events.recv() => {
                    match event {
                        Ok(event) => self.apply_backend_event(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("backend event stream lagged by {n}, resyncing");
                            self.resync_pools().await;
                        }
                        Err(_) => return,
                    }
                }
            }
        }
    }

    async fn apply_pool_event(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::Put { key, value } => {
                let record: PoolRecord = match serde_json::from_value(value) {
                    Ok(record) => record,
                    Err(e) => {
                        log::warn!("undecodable pool record for {key}: {e}");
                        return;
                    }
                };
                match self.registry.get(&record.name).await {
                    Some(handle) => handle.update_config(self.pool_config(&record)),
                    None => {
                        let backends = self
                            .stored_backends(&record.name)
                            .await
                            .unwrap_or_default();
                        self.spawn_pool(&record, backends).await;
                    }
                }
            }
            ChangeEvent::Delete { key } => {
                if self.registry.deregister(&key).await {
                    log::info!("pool {key} deleted, actor stopped");
                }
            }
        }
    }

    async fn apply_backend_event(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::Put { key, value } => {
                let record: BackendRecord = match serde_json::from_value(value) {
                    Ok(record) => record,
                    Err(e) => {
                        log::warn!("undecodable backend record for {key}: {e}");
                        return;
                    }
                };
                if let Some(pool) = self.registry.get(&record.pool_name).await {
                    match pool.add_backend(record.backend).await {
                        Ok(_) | Err(EdgeError::AlreadyExists(_)) => {}
                        Err(e) => log::warn!("could not apply backend {key}: {e}"),
                    }
                }
            }
            ChangeEvent::Delete { key } => {
                let Some((pool_name, backend_id)) = key.split_once('/') else {
                    return;
                };
                if let Some(pool) = self.registry.get(pool_name).await {
                    match pool.remove_backend(backend_id).await {
                        Ok(()) | Err(EdgeError::NotFound(_)) => {}
                        Err(e) => log::warn!("could not remove backend {key}: {e}"),
                    }
                }
            }
        }
    }

    /// Full reconciliation against the store, used after event loss
    async fn resync_pools(&self) {
        let records: Vec<PoolRecord> = match self.store.list().await {
            Ok(records) => records,
            Err(e) => {
                log::warn!("resync failed to list pools: {e}");
                return;
            }
        };
        for record in records {
            if self.registry.get(&record.name).await.is_none() {
                let backends = self
                    .stored_backends(&record.name)
                    .await
                    .unwrap_or_default();
                self.spawn_pool(&record, backends).await;
            }
        }
    }
}
