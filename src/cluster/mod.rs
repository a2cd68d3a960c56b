/// Cluster membership and state replication.
///
/// Peers are discovered by polling a DNS query every five seconds;
/// successive answer sets are diffed into join/leave events. Each peer
/// gets a replication link: newline-delimited JSON frames over TCP,
/// authenticated with the release cookie. The accepting side streams a
/// full snapshot first, then both sides exchange per-write frames with
/// last-write-wins applied at the store.
///
/// Replication is fire-and-forget from the request path's point of
/// view: frames queue while a link is down and the snapshot on
/// reconnect heals anything lost in between.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{EdgeError, EdgeResult};
use crate::store::{ReplicationFrame, Store, Table};

/// DNS poll cadence
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);

/// Reconnect backoff for a down peer link
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Deadline for the peer's hello frame
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub node_name: String,
    /// Listener for inbound replication links
    pub bind_addr: String,
    /// Port peers listen on; combined with discovered addresses
    pub peer_port: u16,
    /// DNS name polled for peer discovery; `None` disables discovery
    pub discovery_query: Option<String>,
    /// Shared secret; required, never optional in production
    pub release_cookie: String,
}

/// Wire frames exchanged on a replication link
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Hello {
        cookie: String,
        node: String,
    },
    Write {
        table: Table,
        key: String,
        #[serde(default)]
        value: Option<Value>,
        updated_at: u64,
    },
    SnapshotEnd,
}

impl Frame {
    fn write(frame: ReplicationFrame) -> Self {
        Frame::Write {
            table: frame.table,
            key: frame.key,
            value: frame.value,
            updated_at: frame.updated_at,
        }
    }
}

struct PeerLink {
    tx: mpsc::UnboundedSender<ReplicationFrame>,
    task: JoinHandle<()>,
}

pub struct Cluster {
    store: Arc<Store>,
    settings: ClusterSettings,
    peers: Mutex<HashMap<SocketAddr, PeerLink>>,
}

impl Cluster {
    pub fn new(store: Arc<Store>, settings: ClusterSettings) -> EdgeResult<Self> {
        if settings.release_cookie.is_empty() {
            return Err(EdgeError::validation(
                "clustering requires a release cookie",
            ));
        }
        Ok(Self {
            store,
            settings,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Start the inbound listener, the write fanout, and (when a
    /// discovery query is configured) the DNS polling loop. Returns the
    /// bound replication address.
    pub async fn start(self: &Arc<Self>) -> EdgeResult<SocketAddr> {
        let listener = TcpListener::bind(&self.settings.bind_addr)
            .await
            .map_err(|e| {
                EdgeError::storage(format!("bind {}: {e}", self.settings.bind_addr))
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| EdgeError::storage(e.to_string()))?;
        log::info!(
            "cluster node {} accepting replication on {local_addr}",
            self.settings.node_name
        );

        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let cluster = Arc::clone(&cluster);
                        tokio::spawn(async move {
                            if let Err(e) = cluster.handle_inbound(stream).await {
                                log::debug!("replication link from {peer_addr} ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("replication accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        // Ship every local write to all known peers
        let (tx, mut rx) = mpsc::unbounded_channel::<ReplicationFrame>();
        self.store.set_replicator(tx);
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let peers = cluster.peers.lock().await;
                for link in peers.values() {
                    let _ = link.tx.send(frame.clone());
                }
            }
        });

        if self.settings.discovery_query.is_some() {
            let cluster = Arc::clone(self);
            tokio::spawn(cluster.discover());
        }

        Ok(local_addr)
    }

    /// DNS polling loop producing join/leave events from set diffs
    async fn discover(self: Arc<Self>) {
        let query = self
            .settings
            .discovery_query
            .clone()
            .expect("discovery loop requires a query");
        let mut known: HashSet<SocketAddr> = HashSet::new();
        let mut ticker = tokio::time::interval(DISCOVERY_INTERVAL);

        loop {
            ticker.tick().await;
            let resolved = match tokio::net::lookup_host((query.as_str(), self.settings.peer_port))
                .await
            {
                Ok(addrs) => addrs.collect::<HashSet<_>>(),
                Err(e) => {
                    log::debug!("peer discovery for {query} failed: {e}");
                    continue;
                }
            };

            let (joined, left) = diff_peer_sets(&known, &resolved);
            for addr in joined {
                log::info!("peer appeared: {addr}");
                self.add_peer(addr).await;
            }
            for addr in left {
                log::info!("peer disappeared: {addr}");
                self.remove_peer(addr).await;
            }
            known = resolved;
        }
    }

    /// Open (or keep retrying) a replication link to a peer
    pub async fn add_peer(self: &Arc<Self>, addr: SocketAddr) {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(&addr) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let cluster = Arc::clone(self);
        let task = tokio::spawn(cluster.run_link(addr, rx));
        peers.insert(addr, PeerLink { tx, task });
    }

    pub async fn remove_peer(&self, addr: SocketAddr) {
        if let Some(link) = self.peers.lock().await.remove(&addr) {
            link.task.abort();
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Outbound side of a link: dial, introduce ourselves, then apply
    /// whatever the peer sends while draining our queue to it
    async fn run_link(
        self: Arc<Self>,
        addr: SocketAddr,
        mut rx: mpsc::UnboundedReceiver<ReplicationFrame>,
    ) {
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    log::debug!("replication link to {addr} established");
                    if let Err(e) = self.drive_link(stream, &mut rx).await {
                        log::debug!("replication link to {addr} dropped: {e}");
                    }
                }
                Err(e) => {
                    log::debug!("replication connect to {addr} failed: {e}");
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn drive_link(
        &self,
        stream: TcpStream,
        rx: &mut mpsc::UnboundedReceiver<ReplicationFrame>,
    ) -> EdgeResult<()> {
        let (read_half, mut write_half) = stream.into_split();
        write_frame(
            &mut write_half,
            &Frame::Hello {
                cookie: self.settings.release_cookie.clone(),
                node: self.settings.node_name.clone(),
            },
        )
        .await?;

        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = line
                        .map_err(|e| EdgeError::ReplicationLagged(e.to_string()))?
                        .ok_or_else(|| EdgeError::ReplicationLagged("peer closed".into()))?;
                    self.apply_frame(&line).await;
                }
                frame = rx.recv() => {
                    match frame {
                        Some(frame) => {
                            write_frame(&mut write_half, &Frame::write(frame)).await?;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Inbound side: verify the hello, stream a snapshot, then apply
    /// the peer's writes
    async fn handle_inbound(&self, stream: TcpStream) -> EdgeResult<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let hello = timeout(HELLO_TIMEOUT, lines.next_line())
            .await
            .map_err(|_| EdgeError::timeout("peer hello"))?
            .map_err(|e| EdgeError::ReplicationLagged(e.to_string()))?
            .ok_or_else(|| EdgeError::ReplicationLagged("peer closed before hello".into()))?;

        match serde_json::from_str::<Frame>(&hello) {
            Ok(Frame::Hello { cookie, node }) => {
                if cookie != self.settings.release_cookie {
                    log::warn!("rejecting peer {node}: bad release cookie");
                    return Err(EdgeError::validation("bad release cookie"));
                }
                if node == self.settings.node_name {
                    // Our own dial reflected back through DNS
                    return Ok(());
                }
                log::info!("peer {node} joined, sending snapshot");
            }
            _ => return Err(EdgeError::validation("expected hello frame")),
        }

        for table in Table::ALL {
            for frame in self.store.dump(table).await {
                write_frame(&mut write_half, &Frame::write(frame)).await?;
            }
        }
        write_frame(&mut write_half, &Frame::SnapshotEnd).await?;

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| EdgeError::ReplicationLagged(e.to_string()))?
        {
            self.apply_frame(&line).await;
        }
        Ok(())
    }

    async fn apply_frame(&self, line: &str) {
        match serde_json::from_str::<Frame>(line) {
            Ok(Frame::Write {
                table,
                key,
                value,
                updated_at,
            }) => {
                let frame = ReplicationFrame {
                    table,
                    key,
                    value,
                    updated_at,
                };
                if let Err(e) = self.store.apply_remote(frame).await {
                    log::warn!("failed to apply replicated write: {e}");
                }
            }
            Ok(Frame::SnapshotEnd) => log::debug!("peer snapshot complete"),
            Ok(Frame::Hello { node, .. }) => {
                log::debug!("unexpected mid-stream hello from {node}")
            }
            Err(e) => log::debug!("undecodable replication frame: {e}"),
        }
    }
}

async fn write_frame(write_half: &mut OwnedWriteHalf, frame: &Frame) -> EdgeResult<()> {
    let mut line = serde_json::to_string(frame)
        .map_err(|e| EdgeError::ReplicationLagged(e.to_string()))?;
    line.push('\n');
    write_half
        .write_all(line.as_bytes())
        .await
        .map_err(|e| EdgeError::ReplicationLagged(e.to_string()))
}

/// Diff successive discovery answers into join/leave events
fn diff_peer_sets(
    known: &HashSet<SocketAddr>,
    resolved: &HashSet<SocketAddr>,
) -> (Vec<SocketAddr>, Vec<SocketAddr>) {
    let joined = resolved.difference(known).copied().collect();
    let left = known.difference(resolved).copied().collect();
    (joined, left)
}
