//! Cluster Protocol Messages
//!
//! Defines the binary protocol used for inter-node communication.
//! Each frame is a 4-byte big-endian length followed by a bincode payload.

use bincode::{Decode, Encode};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ClusterError, InternalMessage};
use crate::protocol::QoS;

/// Protocol version for compatibility checking
pub const CLUSTER_PROTOCOL_VERSION: u8 = 1;

/// Largest accepted frame payload
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Messages exchanged between cluster nodes over TCP
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ClusterMessage {
    /// Handshake sent when connecting to a peer
    Hello { node_id: String, version: u8 },

    /// Handshake acknowledgment
    HelloAck { node_id: String, version: u8 },

    /// A message ingested on the origin node
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
        dup: bool,
        retain: bool,
        /// Origin node ID, for logging
        origin_node: String,
    },

    /// Keep-alive ping
    Ping,

    /// Keep-alive pong
    Pong,

    /// Graceful disconnect notification
    Goodbye,
}

impl ClusterMessage {
    /// Build a Publish frame from a relayed message
    pub fn publish(message: &InternalMessage, origin_node: &str) -> Self {
        ClusterMessage::Publish {
            topic: message.topic.to_string(),
            payload: message.payload.to_vec(),
            qos: message.qos as u8,
            dup: message.dup,
            retain: message.retain,
            origin_node: origin_node.to_string(),
        }
    }

    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ClusterMessage::Hello { .. } => "Hello",
            ClusterMessage::HelloAck { .. } => "HelloAck",
            ClusterMessage::Publish { .. } => "Publish",
            ClusterMessage::Ping => "Ping",
            ClusterMessage::Pong => "Pong",
            ClusterMessage::Goodbye => "Goodbye",
        }
    }
}

/// Convert a received Publish into the local message form.
/// Returns `None` for other variants.
pub fn into_internal(msg: ClusterMessage) -> Result<Option<(InternalMessage, String)>, ClusterError> {
    match msg {
        ClusterMessage::Publish {
            topic,
            payload,
            qos,
            dup,
            retain,
            origin_node,
        } => {
            let qos = QoS::from_u8(qos)
                .ok_or_else(|| ClusterError::Decode(format!("invalid QoS {}", qos)))?;
            let message = InternalMessage {
                topic: topic.into(),
                qos,
                payload: payload.into(),
                dup,
                retain,
            };
            Ok(Some((message, origin_node)))
        }
        _ => Ok(None),
    }
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(msg: &ClusterMessage) -> Result<Vec<u8>, ClusterError> {
    let payload = msg.encode()?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ClusterError::FrameTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    let prefix: [u8; LENGTH_PREFIX] = data.get(..LENGTH_PREFIX)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix))
}

/// Split one complete frame off the front of `buf`
pub fn split_frame(buf: &mut BytesMut) -> Result<Option<ClusterMessage>, ClusterError> {
    let Some(len) = read_frame_length(buf) else {
        return Ok(None);
    };
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(ClusterError::FrameTooLarge(len));
    }
    if buf.len() < LENGTH_PREFIX + len {
        buf.reserve(LENGTH_PREFIX + len - buf.len());
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX);
    let payload = buf.split_to(len);
    Ok(Some(ClusterMessage::decode(&payload)?))
}

/// Read the next message from a stream, buffering partial frames in `buf`.
///
/// Returns `Ok(None)` when the peer closes the stream. Cancel safe: bytes
/// already read stay in `buf`.
pub async fn read_message<R>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<Option<ClusterMessage>, ClusterError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(msg) = split_frame(buf)? {
            return Ok(Some(msg));
        }
        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ClusterError::ConnectionLost(
                "connection closed mid-frame".to_string(),
            ));
        }
    }
}

/// Frame and write a message
pub async fn write_message<W>(writer: &mut W, msg: &ClusterMessage) -> Result<(), ClusterError>
where
    W: AsyncWrite + Unpin,
{
    let frame = frame_message(msg)?;
    writer.write_all(&frame).await?;
    Ok(())
}
