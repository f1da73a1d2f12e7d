//! Cluster Manager
//!
//! Owns the outbound peer links and the relay listener, and implements
//! [`ClusterRelay`] by broadcasting to every connected peer.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;

use super::peer::{dispatch, ClusterInboundCallback, ClusterPeer, HANDSHAKE_TIMEOUT, PING_INTERVAL};
use super::protocol::{read_message, write_message, ClusterMessage, CLUSTER_PROTOCOL_VERSION};
use super::{ClusterError, ClusterRelay, InternalMessage};

/// Cluster manager for static-peer message relay
pub struct ClusterManager {
    node_id: Arc<str>,
    config: ClusterConfig,
    peers: Mutex<Vec<Arc<ClusterPeer>>>,
    inbound: ClusterInboundCallback,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterManager {
    /// Create a cluster manager. Nothing is started until [`start`](Self::start).
    pub fn new(config: ClusterConfig, inbound: ClusterInboundCallback) -> Self {
        let node_id: Arc<str> = config.get_node_id().into();
        info!("Cluster node '{}' with {} configured peers", node_id, config.peers.len());

        Self {
            node_id,
            config,
            peers: Mutex::new(Vec::new()),
            inbound,
            listener_task: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.peers.lock().iter().filter(|p| p.is_connected()).count()
    }

    /// Bind the relay listener and start dialing peers.
    /// Returns the bound listener address.
    pub async fn start(&self) -> Result<SocketAddr, ClusterError> {
        let bind_addr = self.config.peer_addr.ok_or_else(|| {
            ClusterError::Rejected("cluster.peer_addr is not configured".to_string())
        })?;

        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Cluster relay listening on {}", local_addr);

        let task = tokio::spawn(Self::peer_listener_loop(
            listener,
            self.inbound.clone(),
            self.node_id.clone(),
        ));
        *self.listener_task.lock() = Some(task);

        let mut peers = self.peers.lock();
        for addr in &self.config.peers {
            debug!("Dialing cluster peer {}", addr);
            peers.push(ClusterPeer::spawn(
                addr.clone(),
                self.node_id.clone(),
                self.inbound.clone(),
            ));
        }

        Ok(local_addr)
    }

    /// Stop the listener and say Goodbye to every peer
    pub async fn stop(&self) {
        info!("Stopping cluster manager");

        if let Some(task) = self.listener_task.lock().take() {
            task.abort();
        }

        let peers: Vec<_> = self.peers.lock().drain(..).collect();
        for peer in peers {
            peer.shutdown().await;
        }
    }

    /// Listen for incoming peer connections
    async fn peer_listener_loop(
        listener: TcpListener,
        inbound: ClusterInboundCallback,
        local_node_id: Arc<str>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Incoming cluster peer connection from {}", addr);
                    let inbound = inbound.clone();
                    let node_id = local_node_id.clone();

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_incoming_peer(stream, inbound, &node_id).await {
                            debug!("Incoming peer connection from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept peer connection: {}", e);
                }
            }
        }
    }

    /// Handle an incoming peer connection
    async fn handle_incoming_peer(
        stream: TcpStream,
        inbound: ClusterInboundCallback,
        local_node_id: &str,
    ) -> Result<(), ClusterError> {
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();
        let mut read_buf = BytesMut::with_capacity(8 * 1024);

        let hello = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            read_message(&mut read_half, &mut read_buf),
        )
        .await
        .map_err(|_| ClusterError::Timeout)??;

        let peer_node_id = match hello {
            Some(ClusterMessage::Hello { node_id, version }) => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    let _ = write_message(&mut write_half, &ClusterMessage::Goodbye).await;
                    return Err(ClusterError::Rejected(format!(
                        "protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )));
                }
                node_id
            }
            Some(other) => {
                return Err(ClusterError::Rejected(format!(
                    "expected Hello, got {}",
                    other.type_name()
                )));
            }
            None => return Ok(()),
        };

        info!("Incoming cluster peer: {}", peer_node_id);

        let ack = ClusterMessage::HelloAck {
            node_id: local_node_id.to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        write_message(&mut write_half, &ack).await?;

        // The dialing side pings every interval.
        let idle_limit = PING_INTERVAL * 3;
        loop {
            let next = tokio::time::timeout(idle_limit, read_message(&mut read_half, &mut read_buf))
                .await
                .map_err(|_| ClusterError::Timeout)??;

            let Some(msg) = next else {
                info!("Cluster peer '{}' disconnected", peer_node_id);
                return Ok(());
            };
            if !dispatch(&peer_node_id, msg, &mut write_half, &inbound).await? {
                return Ok(());
            }
        }
    }
}

impl ClusterRelay for ClusterManager {
    fn send(&self, message: InternalMessage) {
        for peer in self.peers.lock().iter() {
            if let Err(e) = peer.try_forward(message.clone()) {
                match e {
                    ClusterError::QueueFull => {
                        warn!("Cluster peer {} queue full, dropping '{}'", peer.peer_addr(), message.topic)
                    }
                    e => debug!("Not relaying '{}' to {}: {}", message.topic, peer.peer_addr(), e),
                }
            }
        }
    }
}
