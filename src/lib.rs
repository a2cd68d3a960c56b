pub mod admin;
pub mod certs;
pub mod cluster;
pub mod config;
/// Singularity Edge - global HTTP/HTTPS reverse proxy and Layer-4
/// passthrough load balancer
///
/// Requests are resolved to a named pool of backends, a backend is
/// selected under the pool's load-balancing policy, and bytes are
/// forwarded on one of two paths:
/// 1. HTTP mode: TLS-terminating reverse proxy built on Pingora's HTTP
///    proxy, with per-pool upstream TLS policy
/// 2. Passthrough mode: raw TCP splicing, one listener per pool
///
/// Pool, backend, and certificate state is persisted in an in-process
/// table store and replicated across cluster nodes.
pub mod core;
pub mod error;
pub mod health;
pub mod proxy;
pub mod routing;
pub mod store;
pub mod supervisor;
pub mod utils;

use std::error::Error;
use std::sync::Arc;

// Pingora framework imports
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::listeners::Listeners;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_core::services::listening::Service;
use pingora_proxy::http_proxy_service;

use crate::admin::AdminApp;
use crate::certs::CertificateManager;
use crate::cluster::{Cluster, ClusterSettings};
use crate::config::Config;
use crate::core::{Algorithm, PoolRegistry};
use crate::proxy::{EdgeHttpProxy, SniCertResolver, TcpPassthroughApp};
use crate::routing::RouteResolver;
use crate::store::{PoolRecord, Store};
use crate::supervisor::PoolSupervisor;

/// The long-lived core shared between all listening services
struct EdgeCore {
    registry: Arc<PoolRegistry>,
    supervisor: Arc<PoolSupervisor>,
    certs: Arc<CertificateManager>,
}

impl EdgeCore {
    /// Open the store, hydrate the pool actors, and join the cluster.
    ///
    /// Store corruption here is fatal by design: a node that cannot
    /// trust its local state must not serve traffic.
    async fn bootstrap(config: &Config) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let store = Arc::new(Store::open(&config.store.dir).await?);
        let registry = Arc::new(PoolRegistry::new());
        let supervisor = Arc::new(PoolSupervisor::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.proxy.request_timeout_ms,
        ));
        supervisor.start().await?;

        // The default pool always exists so routing has a destination
        if store
            .get::<PoolRecord>(&config.server.default_pool)
            .await
            .is_err()
        {
            supervisor
                .create_pool(PoolRecord::new(
                    config.server.default_pool.clone(),
                    Algorithm::RoundRobin,
                ))
                .await?;
            log::info!("created default pool {}", config.server.default_pool);
        }

        let certs = Arc::new(CertificateManager::new(Arc::clone(&store)));

        if config.cluster.enabled {
            let settings = ClusterSettings {
                node_name: config.cluster.node_name.clone(),
                bind_addr: format!("0.0.0.0:{}", config.cluster.port),
                peer_port: config.cluster.port,
                discovery_query: config.cluster.discovery_query.clone(),
                release_cookie: config
                    .cluster
                    .release_cookie
                    .clone()
                    .unwrap_or_default(),
            };
            let cluster = Arc::new(Cluster::new(Arc::clone(&store), settings)?);
            let addr = cluster.start().await?;
            log::info!("cluster replication listening on {addr}");
        }

        Ok(Self {
            registry,
            supervisor,
            certs,
        })
    }
}

/// Main edge instance wiring the core into Pingora services
pub struct Edge {
    config: Config,
    server: Option<Server>,
}

impl Edge {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            server: None,
        }
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Initialize the Pingora server
    pub fn initialize(&mut self, opt: Option<Opt>) -> Result<(), Box<dyn Error + Send + Sync>> {
        let server = Server::new(opt)?;
        self.server = Some(server);
        Ok(())
    }

    /// Check if the server is initialized
    pub fn is_initialized(&self) -> bool {
        self.server.is_some()
    }

    /// Assemble the services and run forever.
    ///
    /// The control plane (store, pool actors, health checkers, cluster
    /// links) lives on a dedicated runtime; Pingora owns the data-plane
    /// runtimes. Neither outlives the other since this never returns.
    pub fn run(mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut server = self
            .server
            .take()
            .ok_or("Server not initialized. Call initialize() first.")?;
        server.bootstrap();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("edge-core")
            .build()?;
        let core = runtime.block_on(EdgeCore::bootstrap(&self.config))?;

        let resolver = RouteResolver::new(
            self.config.server.base_domain.clone(),
            self.config.server.default_pool.clone(),
        );

        if self.config.server.start_listeners {
            let edge_proxy = EdgeHttpProxy::new(
                Arc::clone(&core.registry),
                resolver,
                Arc::clone(&core.certs),
                self.config.proxy.request_timeout_ms,
            );
            let mut proxy_service = http_proxy_service(&server.configuration, edge_proxy);
            let http_addr = format!("0.0.0.0:{}", self.config.server.http_port);
            proxy_service.add_tcp(&http_addr);
            log::info!("HTTP proxy listening on {http_addr}");

            if let Some(https_port) = self.config.server.https_port {
                let sni_resolver = SniCertResolver::new(Arc::clone(&core.certs));
                let tls_settings = TlsSettings::with_callbacks(Box::new(sni_resolver))?;
                let https_addr = format!("0.0.0.0:{https_port}");
                proxy_service.add_tls_with_settings(&https_addr, None, tls_settings);
                log::info!("HTTPS proxy listening on {https_addr} (SNI certificate lookup)");
            }
            server.add_service(proxy_service);

            for binding in &self.config.proxy.passthrough {
                let app = TcpPassthroughApp::new(binding.pool.clone(), Arc::clone(&core.registry));
                let addr = format!("0.0.0.0:{}", binding.port);
                let service = Service::with_listeners(
                    format!("TCP Passthrough ({})", binding.pool),
                    Listeners::tcp(&addr),
                    app,
                );
                server.add_service(service);
                log::info!("TCP passthrough for pool {} listening on {addr}", binding.pool);
            }
        } else {
            log::info!("listeners disabled (PHX_SERVER not set)");
        }

        let admin_app = AdminApp::new(
            Arc::clone(&core.supervisor),
            Arc::clone(&core.certs),
            self.config.cluster.node_name.clone(),
        );
        let admin_addr = format!("0.0.0.0:{}", self.config.server.admin_port);
        let admin_service = Service::with_listeners(
            "Admin API".to_string(),
            Listeners::tcp(&admin_addr),
            admin_app,
        );
        server.add_service(admin_service);
        log::info!("admin API listening on {admin_addr}");

        // run_forever never returns, so the control runtime is never
        // dropped and its tasks keep running
        server.run_forever();
    }
}
