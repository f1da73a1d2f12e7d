//! Cluster Peer
//!
//! An outbound link to one configured peer node. The link reconnects with
//! exponential backoff and only accepts messages while connected.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{
    into_internal, read_message, write_message, ClusterMessage, CLUSTER_PROTOCOL_VERSION,
};
use super::{ClusterError, InternalMessage, PeerStatus};

const PEER_QUEUE_CAPACITY: usize = 1000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(super) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub(super) const PING_INTERVAL: Duration = Duration::from_secs(15);
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Callback for messages received from a cluster peer
pub type ClusterInboundCallback = Arc<dyn Fn(InternalMessage) + Send + Sync>;

/// Commands sent to the peer connection task
#[derive(Debug)]
enum PeerCommand {
    Publish(InternalMessage),
    Shutdown,
}

/// A connection to another cluster node
pub struct ClusterPeer {
    peer_addr: String,
    status: Arc<RwLock<PeerStatus>>,
    command_tx: mpsc::Sender<PeerCommand>,
}

impl ClusterPeer {
    /// Spawn the connection task for `peer_addr`
    pub fn spawn(
        peer_addr: String,
        local_node_id: Arc<str>,
        inbound: ClusterInboundCallback,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        let status = Arc::new(RwLock::new(PeerStatus::Disconnected));

        let peer = Arc::new(Self {
            peer_addr: peer_addr.clone(),
            status: status.clone(),
            command_tx,
        });

        tokio::spawn(Self::connection_loop(
            peer_addr,
            local_node_id,
            status,
            command_rx,
            inbound,
        ));

        peer
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.read()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == PeerStatus::Connected
    }

    /// Queue a message for this peer without waiting
    pub fn try_forward(&self, message: InternalMessage) -> Result<(), ClusterError> {
        if !self.is_connected() {
            return Err(ClusterError::NotConnected);
        }
        self.command_tx
            .try_send(PeerCommand::Publish(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ClusterError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => {
                    ClusterError::ConnectionLost("peer task stopped".to_string())
                }
            })
    }

    /// Ask the connection task to say Goodbye and stop
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(PeerCommand::Shutdown).await;
    }

    /// Run the connection loop with reconnection
    async fn connection_loop(
        peer_addr: String,
        local_node_id: Arc<str>,
        status: Arc<RwLock<PeerStatus>>,
        mut command_rx: mpsc::Receiver<PeerCommand>,
        inbound: ClusterInboundCallback,
    ) {
        let mut retry_interval = MIN_BACKOFF;

        loop {
            *status.write() = PeerStatus::Connecting;
            debug!("ClusterPeer '{}': connecting", peer_addr);

            match Self::connect_and_run(&peer_addr, &local_node_id, &status, &mut command_rx, &inbound)
                .await
            {
                Ok(()) => {
                    info!("ClusterPeer '{}': disconnected gracefully", peer_addr);
                    *status.write() = PeerStatus::Disconnected;
                    return;
                }
                Err(e) => {
                    if *status.read() == PeerStatus::Connected {
                        retry_interval = MIN_BACKOFF;
                    }
                    warn!("ClusterPeer '{}': connection failed: {}", peer_addr, e);
                    *status.write() = PeerStatus::Backoff;
                    debug!("ClusterPeer '{}': reconnecting in {:?}", peer_addr, retry_interval);

                    if Self::wait_backoff(retry_interval, &mut command_rx).await {
                        info!("ClusterPeer '{}': shutdown requested", peer_addr);
                        *status.write() = PeerStatus::Disconnected;
                        return;
                    }
                    retry_interval = std::cmp::min(retry_interval * 2, MAX_BACKOFF);
                }
            }
        }
    }

    /// Sleep for `delay`, discarding queued publishes. Returns true on shutdown.
    async fn wait_backoff(delay: Duration, command_rx: &mut mpsc::Receiver<PeerCommand>) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                cmd = command_rx.recv() => match cmd {
                    Some(PeerCommand::Publish(_)) => continue,
                    Some(PeerCommand::Shutdown) | None => return true,
                },
            }
        }
    }

    /// Connect to the peer and run the message loop
    async fn connect_and_run(
        peer_addr: &str,
        local_node_id: &str,
        status: &RwLock<PeerStatus>,
        command_rx: &mut mpsc::Receiver<PeerCommand>,
        inbound: &ClusterInboundCallback,
    ) -> Result<(), ClusterError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer_addr))
            .await
            .map_err(|_| ClusterError::Timeout)??;
        let _ = stream.set_nodelay(true);

        let (mut read_half, mut write_half) = stream.into_split();
        let mut read_buf = BytesMut::with_capacity(8 * 1024);

        let hello = ClusterMessage::Hello {
            node_id: local_node_id.to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        write_message(&mut write_half, &hello).await?;

        let reply = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            read_message(&mut read_half, &mut read_buf),
        )
        .await
        .map_err(|_| ClusterError::Timeout)??;

        match reply {
            Some(ClusterMessage::HelloAck { node_id, version }) => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(ClusterError::Rejected(format!(
                        "protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )));
                }
                info!("ClusterPeer '{}': connected (peer_id={})", peer_addr, node_id);
            }
            Some(other) => {
                return Err(ClusterError::Rejected(format!(
                    "expected HelloAck, got {}",
                    other.type_name()
                )));
            }
            None => {
                return Err(ClusterError::ConnectionLost(
                    "closed during handshake".to_string(),
                ));
            }
        }

        *status.write() = PeerStatus::Connected;

        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.reset();
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(PeerCommand::Publish(message)) => {
                        debug!("ClusterPeer '{}': forwarding '{}'", peer_addr, message.topic);
                        let frame = ClusterMessage::publish(&message, local_node_id);
                        write_message(&mut write_half, &frame).await?;
                    }
                    Some(PeerCommand::Shutdown) | None => {
                        let _ = write_message(&mut write_half, &ClusterMessage::Goodbye).await;
                        return Ok(());
                    }
                },

                result = read_message(&mut read_half, &mut read_buf) => {
                    let Some(msg) = result? else {
                        return Err(ClusterError::ConnectionLost("connection closed".to_string()));
                    };
                    last_seen = Instant::now();
                    if !dispatch(peer_addr, msg, &mut write_half, inbound).await? {
                        return Err(ClusterError::ConnectionLost("peer said goodbye".to_string()));
                    }
                }

                _ = ping_timer.tick() => {
                    if last_seen.elapsed() > PING_INTERVAL * 3 {
                        return Err(ClusterError::Timeout);
                    }
                    write_message(&mut write_half, &ClusterMessage::Ping).await?;
                }
            }
        }
    }
}

/// Handle one post-handshake message. Returns false when the peer leaves.
pub(super) async fn dispatch<W>(
    peer: &str,
    msg: ClusterMessage,
    writer: &mut W,
    inbound: &ClusterInboundCallback,
) -> Result<bool, ClusterError>
where
    W: AsyncWrite + Unpin,
{
    match msg {
        msg @ ClusterMessage::Publish { .. } => {
            if let Some((message, origin)) = into_internal(msg)? {
                debug!(
                    "ClusterPeer '{}': received publish on '{}' (origin={})",
                    peer, message.topic, origin
                );
                inbound(message);
            }
        }
        ClusterMessage::Ping => {
            write_message(writer, &ClusterMessage::Pong).await?;
        }
        ClusterMessage::Pong => {}
        ClusterMessage::Goodbye => {
            info!("ClusterPeer '{}': goodbye received", peer);
            return Ok(false);
        }
        other @ (ClusterMessage::Hello { .. } | ClusterMessage::HelloAck { .. }) => {
            warn!("ClusterPeer '{}': unexpected {} after handshake", peer, other.type_name());
        }
    }
    Ok(true)
}
