/// Pool actor: owns a backend set, its algorithm cursor, and health
/// flags. All mutations and selections are serialized through a single
/// mailbox, so counters and cursors never need external locks and
/// observe exactly the order they were enqueued.
///
/// Selection never holds the mailbox across network I/O: the actor
/// returns a snapshot immediately and the proxy does all socket work
/// outside.
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use crate::core::{select, Algorithm, AlgorithmState, Backend, SslMode};
use crate::error::{EdgeError, EdgeResult};

/// Runtime configuration of a pool actor, derived from its stored record
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub algorithm: Algorithm,
    pub ssl_mode: SslMode,
    pub ssl_domain: Option<String>,
    pub ssl_cert_id: Option<String>,
    pub validate_backend_cert: bool,
    pub health_check_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, algorithm: Algorithm) -> Self {
        Self {
            name: name.into(),
            algorithm,
            ssl_mode: SslMode::Off,
            ssl_domain: None,
            ssl_cert_id: None,
            validate_backend_cert: false,
            health_check_interval_ms: 10_000,
            request_timeout_ms: 60_000,
        }
    }
}

/// Aggregate counters for a pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool_name: String,
    pub algorithm: String,
    pub total_backends: usize,
    pub healthy_backends: usize,
    pub unhealthy_backends: usize,
    pub current_connections: u64,
    pub total_requests: u64,
}

enum Command {
    AddBackend(Backend, oneshot::Sender<EdgeResult<Backend>>),
    RemoveBackend(String, oneshot::Sender<EdgeResult<()>>),
    Select(oneshot::Sender<EdgeResult<Backend>>),
    Release(String),
    SetHealth(String, bool),
    List(oneshot::Sender<Vec<Backend>>),
    Stats(oneshot::Sender<PoolStats>),
    UpdateConfig(PoolConfig),
    Shutdown,
}

/// The actor state; use [`Pool::spawn`] to start one
pub struct Pool {
    config: PoolConfig,
    backends: Vec<Backend>,
    state: AlgorithmState,
}

impl Pool {
    /// Spawn the actor task and return a cloneable handle to it
    pub fn spawn(config: PoolConfig, backends: Vec<Backend>) -> (PoolHandle, JoinHandle<()>) {
        Self::spawn_with_state(config, backends, AlgorithmState::default())
    }

    /// Spawn with a previously checkpointed algorithm cursor
    pub fn spawn_with_state(
        config: PoolConfig,
        backends: Vec<Backend>,
        state: AlgorithmState,
    ) -> (PoolHandle, JoinHandle<()>) {
        let name = config.name.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let shared_config = Arc::new(RwLock::new(config.clone()));
        let pool = Pool {
            config,
            backends,
            state,
        };
        let task = tokio::spawn(pool.run(rx, Arc::clone(&shared_config)));
        let handle = PoolHandle {
            name: Arc::new(name),
            tx,
            config: shared_config,
        };
        (handle, task)
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        shared_config: Arc<RwLock<PoolConfig>>,
    ) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::AddBackend(backend, reply) => {
                    let _ = reply.send(self.add_backend(backend));
                }
                Command::RemoveBackend(id, reply) => {
                    let _ = reply.send(self.remove_backend(&id));
                }
                Command::Select(reply) => {
                    let _ = reply.send(self.select_backend());
                }
                Command::Release(id) => {
                    if let Some(backend) = self.backends.iter_mut().find(|b| b.id() == id) {
                        backend.dec_connections();
                    }
                }
                Command::SetHealth(id, healthy) => {
                    if let Some(backend) = self.backends.iter_mut().find(|b| b.id() == id) {
                        if backend.healthy != healthy {
                            log::info!(
                                "pool {}: backend {} -> {}",
                                self.config.name,
                                id,
                                if healthy { "healthy" } else { "unhealthy" }
                            );
                        }
                        backend.set_health(healthy);
                    }
                }
                Command::List(reply) => {
                    let _ = reply.send(self.backends.clone());
                }
                Command::Stats(reply) => {
                    let _ = reply.send(self.stats());
                }
                Command::UpdateConfig(config) => {
                    *shared_config.write().await = config.clone();
                    self.config = config;
                }
                Command::Shutdown => break,
            }
        }
        log::debug!("pool {} actor stopped", self.config.name);
    }

    fn add_backend(&mut self, backend: Backend) -> EdgeResult<Backend> {
        if backend.weight == 0 {
            return Err(EdgeError::validation("backend weight must be at least 1"));
        }
        let id = backend.id();
        if self.backends.iter().any(|b| b.id() == id) {
            return Err(EdgeError::AlreadyExists(id));
        }
        self.backends.push(backend.clone());
        Ok(backend)
    }

    fn remove_backend(&mut self, id: &str) -> EdgeResult<()> {
        let before = self.backends.len();
        self.backends.retain(|b| b.id() != id);
        if self.backends.len() == before {
            return Err(EdgeError::NotFound(format!("backend {id}")));
        }
        Ok(())
    }

    fn select_backend(&mut self) -> EdgeResult<Backend> {
        let (result, next_state) = select(&self.backends, self.config.algorithm, &self.state);
        self.state = next_state;
        let index = result?;
        self.backends[index].inc_connections();
        Ok(self.backends[index].clone())
    }

    fn stats(&self) -> PoolStats {
        let healthy = self.backends.iter().filter(|b| b.healthy).count();
        PoolStats {
            pool_name: self.config.name.clone(),
            algorithm: self.config.algorithm.as_str().to_string(),
            total_backends: self.backends.len(),
            healthy_backends: healthy,
            unhealthy_backends: self.backends.len() - healthy,
            current_connections: self.backends.iter().map(|b| b.current_connections).sum(),
            total_requests: self.backends.iter().map(|b| b.total_requests).sum(),
        }
    }
}

/// Cloneable handle to a running pool actor
#[derive(Clone)]
pub struct PoolHandle {
    name: Arc<String>,
    tx: mpsc::UnboundedSender<Command>,
    config: Arc<RwLock<PoolConfig>>,
}

impl PoolHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the pool's runtime configuration
    pub async fn config(&self) -> PoolConfig {
        self.config.read().await.clone()
    }

    pub async fn add_backend(&self, backend: Backend) -> EdgeResult<Backend> {
        self.request(|reply| Command::AddBackend(backend, reply))
            .await?
    }

    /// Parse and add a backend by URL
    pub async fn add_backend_url(&self, url: &str) -> EdgeResult<Backend> {
        let backend = Backend::new(url)?;
        self.add_backend(backend).await
    }

    pub async fn remove_backend(&self, id: &str) -> EdgeResult<()> {
        self.request(|reply| Command::RemoveBackend(id.to_string(), reply))
            .await?
    }

    /// Select a backend and pair it with a guard that releases the
    /// connection count on drop, whatever the exit path.
    pub async fn select_backend(&self) -> EdgeResult<(Backend, SelectionGuard)> {
        let backend = self
            .request(Command::Select)
            .await??;
        let guard = SelectionGuard {
            tx: self.tx.clone(),
            backend_id: backend.id(),
        };
        Ok((backend, guard))
    }

    /// Explicit release; a no-op when the backend was already removed
    pub fn release_backend(&self, id: &str) {
        let _ = self.tx.send(Command::Release(id.to_string()));
    }

    pub fn set_health(&self, id: &str, healthy: bool) {
        let _ = self.tx.send(Command::SetHealth(id.to_string(), healthy));
    }

    pub async fn list_backends(&self) -> EdgeResult<Vec<Backend>> {
        self.request(Command::List).await
    }

    pub async fn stats(&self) -> EdgeResult<PoolStats> {
        self.request(Command::Stats).await
    }

    pub fn update_config(&self, config: PoolConfig) {
        let _ = self.tx.send(Command::UpdateConfig(config));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> EdgeResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| EdgeError::NotFound(format!("pool {}", self.name)))?;
        reply_rx
            .await
            .map_err(|_| EdgeError::NotFound(format!("pool {}", self.name)))
    }
}

/// Releases the paired selection when dropped.
///
/// The release rides the pool mailbox, so a guard dropped on any exit
/// path (success, error, cancellation, panic) decrements the counter
/// exactly once.
pub struct SelectionGuard {
    tx: mpsc::UnboundedSender<Command>,
    backend_id: String,
}

impl SelectionGuard {
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }
}

impl Drop for SelectionGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Release(self.backend_id.clone()));
    }
}

/// Map of running pool actors, keyed by pool name.
///
/// Registration and deregistration happen on pool create/delete; the
/// request path only ever reads.
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, RunningPool>>,
}

struct RunningPool {
    handle: PoolHandle,
    actor: JoinHandle<()>,
    health: Option<JoinHandle<()>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a running pool, replacing (and shutting down) any
    /// previous actor under the same name
    pub async fn register(
        &self,
        handle: PoolHandle,
        actor: JoinHandle<()>,
        health: Option<JoinHandle<()>>,
    ) {
        let name = handle.name().to_string();
        let previous = self.pools.write().await.insert(
            name,
            RunningPool {
                handle,
                actor,
                health,
            },
        );
        if let Some(previous) = previous {
            previous.handle.shutdown();
            if let Some(task) = previous.health {
                task.abort();
            }
        }
    }

    /// Stop a pool actor and its health checker; the actor task is
    /// joined so its resources are fully released
    pub async fn deregister(&self, name: &str) -> bool {
        let removed = self.pools.write().await.remove(name);
        match removed {
            Some(running) => {
                running.handle.shutdown();
                if let Some(task) = running.health {
                    task.abort();
                }
                let _ = running.actor.await;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, name: &str) -> Option<PoolHandle> {
        self.pools.read().await.get(name).map(|p| p.handle.clone())
    }

    pub async fn names(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.pools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pools.read().await.is_empty()
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(url: &str) -> Backend {
        Backend::new(url).unwrap()
    }

    async fn three_backend_pool(algorithm: Algorithm) -> (PoolHandle, JoinHandle<()>) {
        let (handle, task) = Pool::spawn(
            PoolConfig::new("p", algorithm),
            vec![
                backend("http://a:1"),
                backend("http://a:2"),
                backend("http://a:3"),
            ],
        );
        (handle, task)
    }

    #[tokio::test]
    async fn test_round_robin_rotation() {
        let (pool, _task) = three_backend_pool(Algorithm::RoundRobin).await;

        let mut ids = Vec::new();
        for _ in 0..10 {
            let (chosen, _guard) = pool.select_backend().await.unwrap();
            ids.push(chosen.id());
        }
        assert_eq!(
            ids,
            vec![
                "http://a:1",
                "http://a:2",
                "http://a:3",
                "http://a:1",
                "http://a:2",
                "http://a:3",
                "http://a:1",
                "http://a:2",
                "http://a:3",
                "http://a:1",
            ]
        );
    }

    #[tokio::test]
    async fn test_unhealthy_backend_excluded() {
        let (pool, _task) = three_backend_pool(Algorithm::RoundRobin).await;

        for _ in 0..10 {
            pool.select_backend().await.unwrap();
        }
        pool.set_health("http://a:2", false);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let (chosen, _guard) = pool.select_backend().await.unwrap();
            ids.push(chosen.id());
        }
        assert_eq!(ids, vec!["http://a:1", "http://a:3", "http://a:1"]);
    }

    #[tokio::test]
    async fn test_empty_pool_select_fails() {
        let (pool, _task) = Pool::spawn(
            PoolConfig::new("empty", Algorithm::LeastConnections),
            Vec::new(),
        );
        assert!(matches!(
            pool.select_backend().await,
            Err(EdgeError::NoBackends)
        ));
    }

    #[tokio::test]
    async fn test_add_duplicate_backend_does_not_mutate() {
        let (pool, _task) = Pool::spawn(
            PoolConfig::new("p", Algorithm::RoundRobin),
            vec![backend("http://a:1")],
        );

        let result = pool.add_backend(backend("http://a:1")).await;
        assert!(matches!(result, Err(EdgeError::AlreadyExists(_))));
        assert_eq!(pool.list_backends().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_backend_rejects_zero_weight() {
        let (pool, _task) = Pool::spawn(PoolConfig::new("p", Algorithm::RoundRobin), Vec::new());
        let mut zero = backend("http://a:1");
        zero.weight = 0;
        assert!(matches!(
            pool.add_backend(zero).await,
            Err(EdgeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_removed_backend_never_selected() {
        let (pool, _task) = three_backend_pool(Algorithm::RoundRobin).await;

        pool.remove_backend("http://a:2").await.unwrap();
        for _ in 0..12 {
            let (chosen, _guard) = pool.select_backend().await.unwrap();
            assert_ne!(chosen.id(), "http://a:2");
        }
    }

    #[tokio::test]
    async fn test_remove_missing_backend() {
        let (pool, _task) = three_backend_pool(Algorithm::RoundRobin).await;
        assert!(matches!(
            pool.remove_backend("http://missing:1").await,
            Err(EdgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_accounting() {
        let (pool, _task) = three_backend_pool(Algorithm::RoundRobin).await;

        let (b1, g1) = pool.select_backend().await.unwrap();
        let (_b2, g2) = pool.select_backend().await.unwrap();
        let (_b3, g3) = pool.select_backend().await.unwrap();
        assert_eq!(b1.current_connections, 1);

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.current_connections, 3);
        assert_eq!(stats.total_requests, 3);

        drop(g1);
        drop(g2);
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.current_connections, 1);
        assert_eq!(stats.total_requests, 3);

        drop(g3);
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.current_connections, 0);
    }

    #[tokio::test]
    async fn test_release_after_remove_is_noop() {
        let (pool, _task) = three_backend_pool(Algorithm::RoundRobin).await;

        let (chosen, guard) = pool.select_backend().await.unwrap();
        pool.remove_backend(&chosen.id()).await.unwrap();
        drop(guard);

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.total_backends, 2);
        assert_eq!(stats.current_connections, 0);
    }

    #[tokio::test]
    async fn test_least_connections_follows_load() {
        let (pool, _task) = three_backend_pool(Algorithm::LeastConnections).await;

        // Hold guards so connections stay live
        let (b1, _g1) = pool.select_backend().await.unwrap();
        let (b2, _g2) = pool.select_backend().await.unwrap();
        let (b3, _g3) = pool.select_backend().await.unwrap();
        let picked: Vec<String> = vec![b1.id(), b2.id(), b3.id()];
        assert_eq!(
            picked,
            vec!["http://a:1", "http://a:2", "http://a:3"],
            "ties break by id while load is even"
        );

        drop(_g2);
        let (next, _g4) = pool.select_backend().await.unwrap();
        assert_eq!(next.id(), "http://a:2");
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let (pool, _task) = three_backend_pool(Algorithm::RoundRobin).await;
        pool.set_health("http://a:3", false);

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.pool_name, "p");
        assert_eq!(stats.algorithm, "round_robin");
        assert_eq!(stats.total_backends, 3);
        assert_eq!(stats.healthy_backends, 2);
        assert_eq!(stats.unhealthy_backends, 1);
    }

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let registry = PoolRegistry::new();
        let (handle, task) = three_backend_pool(Algorithm::RoundRobin).await;
        registry.register(handle, task, None).await;

        assert!(registry.get("p").await.is_some());
        assert_eq!(registry.names().await, vec!["p".to_string()]);

        assert!(registry.deregister("p").await);
        assert!(registry.get("p").await.is_none());
        assert!(!registry.deregister("p").await);
    }

    #[tokio::test]
    async fn test_shutdown_pool_rejects_operations() {
        let (pool, task) = three_backend_pool(Algorithm::RoundRobin).await;
        pool.shutdown();
        let _ = task.await;

        assert!(matches!(
            pool.select_backend().await,
            Err(EdgeError::NotFound(_))
        ));
    }
}
