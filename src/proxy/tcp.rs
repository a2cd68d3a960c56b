/// Layer-4 passthrough proxy.
///
/// One listening service per passthrough pool; the listening port is
/// the routing decision, so no application bytes are ever inspected.
/// Bytes are spliced in both directions until either side closes or
/// errors, then both sides are closed and the selection guard releases
/// the backend.
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use pingora_core::apps::ServerApp;
use pingora_core::connectors::TransportConnector;
use pingora_core::protocols::Stream;
use pingora_core::server::ShutdownWatch;
use pingora_core::upstreams::peer::BasicPeer;

use crate::core::PoolRegistry;
use crate::utils::{format_bytes, format_duration};

/// Plain TCP connect deadline for passthrough dials
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const BUFFER_SIZE: usize = 8192;

pub struct TcpPassthroughApp {
    pool_name: String,
    registry: Arc<PoolRegistry>,
    connector: TransportConnector,
}

impl TcpPassthroughApp {
    pub fn new(pool_name: impl Into<String>, registry: Arc<PoolRegistry>) -> Self {
        Self {
            pool_name: pool_name.into(),
            registry,
            connector: TransportConnector::new(None),
        }
    }

    /// Bidirectional splice between client and backend streams.
    ///
    /// Returns bytes moved in each direction. When one side half-closes
    /// or errors, both streams are dropped and therefore closed.
    async fn splice(
        &self,
        mut client_stream: Stream,
        mut backend_stream: Stream,
    ) -> (u64, u64) {
        let mut client_buf = [0; BUFFER_SIZE];
        let mut backend_buf = [0; BUFFER_SIZE];
        let mut bytes_to_backend = 0u64;
        let mut bytes_to_client = 0u64;

        loop {
            tokio::select! {
                result = client_stream.read(&mut client_buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            bytes_to_backend += n as u64;
                            if let Err(e) = backend_stream.write_all(&client_buf[0..n]).await {
                                log::debug!("write to backend failed: {e}");
                                break;
                            }
                            if let Err(e) = backend_stream.flush().await {
                                log::debug!("flush to backend failed: {e}");
                                break;
                            }
                        }
                        Err(e) => {
                            log::debug!("read from client failed: {e}");
                            break;
                        }
                    }
                }
                result = backend_stream.read(&mut backend_buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            bytes_to_client += n as u64;
                            if let Err(e) = client_stream.write_all(&backend_buf[0..n]).await {
                                log::debug!("write to client failed: {e}");
                                break;
                            }
                            if let Err(e) = client_stream.flush().await {
                                log::debug!("flush to client failed: {e}");
                                break;
                            }
                        }
                        Err(e) => {
                            log::debug!("read from backend failed: {e}");
                            break;
                        }
                    }
                }
            }
        }

        (bytes_to_backend, bytes_to_client)
    }
}

#[async_trait]
impl ServerApp for TcpPassthroughApp {
    async fn process_new(
        self: &Arc<Self>,
        client_stream: Stream,
        _shutdown: &ShutdownWatch,
    ) -> Option<Stream> {
        let Some(pool) = self.registry.get(&self.pool_name).await else {
            // Pool was deleted; refuse new connections on this listener
            log::warn!("passthrough pool {} is not running", self.pool_name);
            return None;
        };

        let (backend, _guard) = match pool.select_backend().await {
            Ok(selected) => selected,
            Err(e) => {
                log::warn!("pool {}: selection failed: {e}", self.pool_name);
                return None;
            }
        };

        let peer = BasicPeer::new(&backend.addr());
        let backend_stream =
            match timeout(CONNECT_TIMEOUT, self.connector.new_stream(&peer)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    log::warn!("connect to backend {} failed: {e}", backend.id());
                    return None;
                }
                Err(_) => {
                    log::warn!("connect to backend {} timed out", backend.id());
                    return None;
                }
            };

        log::debug!(
            "pool {}: passthrough established to {}",
            self.pool_name,
            backend.id()
        );

        let started = Instant::now();
        let (to_backend, to_client) = self.splice(client_stream, backend_stream).await;
        log::debug!(
            "pool {}: passthrough to {} closed after {}, {} out / {} in",
            self.pool_name,
            backend.id(),
            format_duration(started.elapsed()),
            format_bytes(to_backend),
            format_bytes(to_client)
        );

        // _guard drops here and releases the selection
        None
    }
}
