/// Periodic backend liveness probing.
///
/// One checker task per pool. Every interval it probes each backend in
/// parallel with a bare TCP connect bounded at one second; no
/// application bytes are ever written. Results flow back into the pool
/// actor as health flips, which take effect on the next selection.
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::core::{Backend, PoolHandle};

/// TCP connect deadline for a single probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of a single liveness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Healthy,
    Unhealthy(String),
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }
}

/// Probe a backend address: a completed TCP connect within the deadline
/// means alive. This is a liveness check, not a correctness check.
pub async fn probe(addr: &str) -> ProbeResult {
    match timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => ProbeResult::Healthy,
        Ok(Err(e)) => ProbeResult::Unhealthy(format!("connect failed: {e}")),
        Err(_) => ProbeResult::Unhealthy("connect timed out".to_string()),
    }
}

/// Callback used to opportunistically persist backend health; invoked at
/// most once per interval and only after a flip
pub type CheckpointFn = Arc<dyn Fn(String, Vec<Backend>) + Send + Sync>;

/// Periodic health checker for one pool
pub struct HealthChecker {
    pool: PoolHandle,
    interval: Duration,
    checkpoint: Option<CheckpointFn>,
}

impl HealthChecker {
    pub fn new(pool: PoolHandle, interval_ms: u64) -> Self {
        Self {
            pool,
            // Pool validation enforces >= 1000 ms; clamp anyway so a bad
            // record cannot spin the scheduler
            interval: Duration::from_millis(interval_ms.max(1_000)),
            checkpoint: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointFn) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Spawn the checker loop; abort the returned handle to stop it
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let flipped = Arc::new(AtomicBool::new(false));
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            // Debounced checkpoint: persist the previous sweep's flips
            // at most once per interval
            if flipped.swap(false, Ordering::Relaxed) {
                if let Some(checkpoint) = &self.checkpoint {
                    if let Ok(backends) = self.pool.list_backends().await {
                        checkpoint(self.pool.name().to_string(), backends);
                    }
                }
            }

            let backends = match self.pool.list_backends().await {
                Ok(backends) => backends,
                // Pool actor is gone; the registry will abort us shortly
                Err(_) => return,
            };

            for backend in backends {
                let id = backend.id();
                {
                    let mut in_flight = in_flight.lock().expect("probe set poisoned");
                    // A probe still running from the previous interval
                    // suppresses relaunch
                    if !in_flight.insert(id.clone()) {
                        continue;
                    }
                }

                let pool = self.pool.clone();
                let in_flight = Arc::clone(&in_flight);
                let flipped = Arc::clone(&flipped);
                let addr = backend.addr();
                let was_healthy = backend.healthy;
                tokio::spawn(async move {
                    let result = probe(&addr).await;
                    let healthy = result.is_healthy();
                    if healthy != was_healthy {
                        flipped.store(true, Ordering::Relaxed);
                        if !healthy {
                            log::warn!("backend {id} failed probe: {result:?}");
                        }
                    }
                    pool.set_health(&id, healthy);
                    in_flight.lock().expect("probe set poisoned").remove(&id);
                });
            }
        }
    }
}
