//! RelayMQ - clustered MQTT v3.1.1 broker
//!
//! The core is the publish engine: every inbound PUBLISH is relayed to
//! cluster peers, fanned out to local subscribers at `min(publish, subscribed)`
//! QoS, acknowledged to the publisher and finally applied to the retained
//! store. The rest of the crate is the broker built around it.

pub mod auth;
pub mod broker;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod engine;
pub mod packet_id;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod store;
pub mod topic;

pub use auth::AuthProvider;
pub use broker::{Broker, BrokerError};
pub use cluster::{ClusterManager, ClusterRelay, InternalMessage, NoopRelay};
pub use config::{ClusterConfig, Config};
pub use engine::{FanOut, PublishEngine};
pub use persistence::{FjallBackend, PersistenceManager, StorageBackend};
pub use protocol::{ProtocolVersion, QoS};
