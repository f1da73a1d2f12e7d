//! Cluster Relay
//!
//! Propagates every locally ingested PUBLISH to the other broker nodes so
//! each node can fan the message out to its own connected subscribers.
//!
//! Peers are configured statically. Each node dials every configured peer
//! and accepts inbound peer connections on `cluster.peer_addr`. Messages
//! received from a peer are delivered locally only and never relayed again.

mod manager;
mod peer;
pub mod protocol;

pub use manager::ClusterManager;
pub use peer::{ClusterInboundCallback, ClusterPeer};

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::protocol::QoS;

/// A message exchanged between broker nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalMessage {
    pub topic: Arc<str>,
    pub qos: QoS,
    pub payload: Bytes,
    pub dup: bool,
    pub retain: bool,
}

impl InternalMessage {
    /// Build the relay form of an ingested publish. Flags are always cleared.
    pub fn new(topic: Arc<str>, qos: QoS, payload: Bytes) -> Self {
        Self {
            topic,
            qos,
            payload,
            dup: false,
            retain: false,
        }
    }
}

/// Fire-and-forget broadcast to peer nodes
pub trait ClusterRelay: Send + Sync {
    /// Hand a message to the relay. Never blocks and never reports failure.
    fn send(&self, message: InternalMessage);
}

/// Relay used when clustering is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRelay;

impl ClusterRelay for NoopRelay {
    fn send(&self, _message: InternalMessage) {}
}

/// Connection status of a cluster peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before the next reconnect attempt
    Backoff,
}

/// Errors raised by peer links
#[derive(Debug)]
pub enum ClusterError {
    ConnectionLost(String),
    Rejected(String),
    Timeout,
    NotConnected,
    QueueFull,
    FrameTooLarge(usize),
    Encode(String),
    Decode(String),
    Io(std::io::Error),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            Self::Rejected(msg) => write!(f, "rejected by peer: {}", msg),
            Self::Timeout => write!(f, "timed out"),
            Self::NotConnected => write!(f, "peer not connected"),
            Self::QueueFull => write!(f, "peer queue full"),
            Self::FrameTooLarge(len) => write!(f, "frame of {} bytes exceeds limit", len),
            Self::Encode(msg) => write!(f, "encode error: {}", msg),
            Self::Decode(msg) => write!(f, "decode error: {}", msg),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ClusterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<bincode::error::EncodeError> for ClusterError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for ClusterError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_message_clears_flags() {
        let msg = InternalMessage::new(Arc::from("a/b"), QoS::ExactlyOnce, Bytes::from_static(b"x"));
        assert!(!msg.dup);
        assert!(!msg.retain);
        assert_eq!(msg.qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_noop_relay_accepts_anything() {
        let relay: Arc<dyn ClusterRelay> = Arc::new(NoopRelay);
        relay.send(InternalMessage::new(Arc::from("t"), QoS::AtMostOnce, Bytes::new()));
    }
}
