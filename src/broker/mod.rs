//! MQTT Broker Core
//!
//! Wires the stores, the publish engine and the optional cluster relay
//! together, accepts TCP connections and runs one [`Connection`] task per
//! client.

mod connection;
mod writer;

pub use connection::{Connection, ConnectionError};
pub use writer::SharedWriter;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::auth::AuthProvider;
use crate::cluster::{
    ClusterError, ClusterInboundCallback, ClusterManager, ClusterRelay, InternalMessage, NoopRelay,
};
use crate::config::Config;
use crate::engine::{FanOut, PublishEngine};
use crate::packet_id::AtomicPacketIds;
use crate::persistence::{FjallBackend, PersistenceError, PersistenceManager};
use crate::protocol::QoS;
use crate::session::SessionStore;
use crate::store::{InflightMessages, RetainedMessages};
use crate::topic::SubscriptionStore;

/// Error starting or running the broker
#[derive(Debug)]
pub enum BrokerError {
    Io(std::io::Error),
    Persistence(PersistenceError),
    Cluster(ClusterError),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Io(e) => write!(f, "IO error: {}", e),
            BrokerError::Persistence(e) => write!(f, "Persistence error: {}", e),
            BrokerError::Cluster(e) => write!(f, "Cluster error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Io(e) => Some(e),
            BrokerError::Persistence(e) => Some(e),
            BrokerError::Cluster(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Io(e)
    }
}

impl From<PersistenceError> for BrokerError {
    fn from(e: PersistenceError) -> Self {
        BrokerError::Persistence(e)
    }
}

impl From<ClusterError> for BrokerError {
    fn from(e: ClusterError) -> Self {
        BrokerError::Cluster(e)
    }
}

/// Components shared by every connection task
pub struct BrokerContext {
    pub(crate) config: Config,
    /// `mqtt.max_qos` as a QoS level
    pub(crate) max_qos: QoS,
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) subscriptions: Arc<SubscriptionStore>,
    pub(crate) engine: Arc<PublishEngine>,
    pub(crate) auth: AuthProvider,
    connection_ids: AtomicU64,
}

impl BrokerContext {
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.connection_ids.fetch_add(1, Ordering::Relaxed)
    }
}

/// The MQTT Broker
pub struct Broker {
    ctx: Arc<BrokerContext>,
    retained: Arc<RetainedMessages>,
    inflight: Arc<InflightMessages>,
    cluster: Option<Arc<ClusterManager>>,
    persistence: Option<Arc<PersistenceManager>>,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    /// Build the broker from configuration.
    ///
    /// Opens and loads the persistence store when enabled. The cluster
    /// listener is started by [`Broker::run`].
    pub async fn new(config: Config) -> Result<Self, BrokerError> {
        let (shutdown, _) = broadcast::channel(1);

        let persistence = if config.persistence.enabled {
            let backend = Arc::new(FjallBackend::open(&config.persistence.path)?);
            info!(
                "Persistence enabled at {}",
                config.persistence.path.display()
            );
            Some(Arc::new(PersistenceManager::new(
                backend,
                config.persistence.flush_interval,
                config.persistence.max_batch_size,
            )))
        } else {
            None
        };

        let (retained, inflight) = match &persistence {
            Some(manager) => {
                let retained = Arc::new(RetainedMessages::with_persistence(manager.clone()));
                let inflight = Arc::new(InflightMessages::with_persistence(manager.clone()));
                let loaded = manager.load_all().await?;
                let restored_retained = retained.restore(loaded.retained);
                let restored_inflight = inflight.restore(loaded.inflight);
                info!(
                    "Restored {} retained messages and {} in-flight records",
                    restored_retained, restored_inflight
                );
                (retained, inflight)
            }
            None => (
                Arc::new(RetainedMessages::new()),
                Arc::new(InflightMessages::new()),
            ),
        };

        let sessions = Arc::new(SessionStore::new());
        let subscriptions = Arc::new(SubscriptionStore::new());
        let fan_out = Arc::new(FanOut::new(
            sessions.clone(),
            subscriptions.clone(),
            Arc::new(AtomicPacketIds::new()),
            inflight.clone(),
        ));

        let cluster = if config.cluster.enabled {
            let inbound_fan_out = fan_out.clone();
            // Messages from peers are delivered locally only, never relayed again
            let inbound: ClusterInboundCallback = Arc::new(move |message: InternalMessage| {
                inbound_fan_out.fan_out(
                    &message.topic,
                    message.qos,
                    &message.payload,
                    false,
                    false,
                );
            });
            Some(Arc::new(ClusterManager::new(config.cluster.clone(), inbound)))
        } else {
            None
        };
        let relay: Arc<dyn ClusterRelay> = match &cluster {
            Some(manager) => manager.clone() as Arc<dyn ClusterRelay>,
            None => Arc::new(NoopRelay),
        };

        let engine = Arc::new(PublishEngine::new(fan_out, retained.clone(), relay));
        let max_qos = QoS::from_u8(config.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce);
        let auth = AuthProvider::new(&config.auth);
        if auth.is_enabled() {
            info!("Authentication enabled");
        }

        let ctx = Arc::new(BrokerContext {
            config,
            max_qos,
            sessions,
            subscriptions,
            engine,
            auth,
            connection_ids: AtomicU64::new(1),
        });

        Ok(Self {
            ctx,
            retained,
            inflight,
            cluster,
            persistence,
            shutdown,
        })
    }

    /// Run the broker on the configured bind address
    pub async fn run(&self) -> Result<(), BrokerError> {
        let listener = TcpListener::bind(self.ctx.config.server.bind).await?;
        self.serve(listener).await
    }

    /// Run the broker on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BrokerError> {
        info!("MQTT/TCP listening on {}", listener.local_addr()?);

        if let Some(cluster) = &self.cluster {
            let addr = cluster.start().await?;
            info!(
                "Cluster node {} listening for peers on {}",
                cluster.node_id(),
                addr
            );
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        debug!("Starting TCP accept loop");
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        self.handle_connection(stream, addr);
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("Accept loop stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Handle a new connection
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let ctx = self.ctx.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut conn = Connection::new(stream, addr, ctx);

            // Pin the connection future so we can poll it repeatedly
            let conn_fut = conn.run();
            tokio::pin!(conn_fut);

            loop {
                tokio::select! {
                    biased;

                    result = &mut conn_fut => {
                        if let Err(e) = result {
                            debug!("Connection error from {}: {}", addr, e);
                        }
                        break;
                    }
                    result = shutdown_rx.recv() => {
                        match result {
                            Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                                debug!("Connection {} shutting down", addr);
                                break;
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        }
                    }
                }
            }
        });
    }

    /// Stop accepting, close connections, stop the cluster and flush
    /// persistence
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());

        if let Some(cluster) = &self.cluster {
            cluster.stop().await;
        }

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.shutdown().await {
                error!("Persistence shutdown failed: {}", e);
            }
        }
    }

    /// Get connected client count
    pub fn connection_count(&self) -> usize {
        self.ctx.sessions.len()
    }

    /// Get retained message count
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Get in-flight record count
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Get the number of cluster peers with an established relay link
    pub fn connected_peer_count(&self) -> usize {
        self.cluster
            .as_ref()
            .map_or(0, |cluster| cluster.connected_peer_count())
    }

    pub fn engine(&self) -> &Arc<PublishEngine> {
        &self.ctx.engine
    }
}
