//! Acknowledgments sent back to a publisher

use tracing::debug;

use crate::protocol::{Packet, PubAck, PubRec};
use crate::session::ClientConnection;

/// Acknowledge a QoS 1 PUBLISH. Write failures are left to the connection.
pub fn send_puback(connection: &dyn ClientConnection, packet_id: u16) {
    if let Err(e) = connection.write(Packet::PubAck(PubAck::new(packet_id))) {
        debug!(
            "PUBACK {} to {} not sent: {}",
            packet_id,
            connection.client_id(),
            e
        );
    }
}

/// First step of the QoS 2 handshake. Write failures are left to the connection.
pub fn send_pubrec(connection: &dyn ClientConnection, packet_id: u16) {
    if let Err(e) = connection.write(Packet::PubRec(PubRec::new(packet_id))) {
        debug!(
            "PUBREC {} to {} not sent: {}",
            packet_id,
            connection.client_id(),
            e
        );
    }
}
