//! QoS 1/2 acknowledgment handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{ClientSession, Connection, ConnectionError};
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel};
use crate::session::ClientConnection;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// PUBACK from a subscriber completes a QoS 1 delivery
    pub(crate) fn handle_puback(&self, session: &ClientSession, puback: PubAck) {
        self.acknowledge(session, puback.packet_id, "PUBACK");
    }

    /// PUBREC from a subscriber: answer with PUBREL and keep the record
    /// until PUBCOMP
    pub(crate) fn handle_pubrec(
        &self,
        session: &ClientSession,
        pubrec: PubRec,
    ) -> Result<(), ConnectionError> {
        debug!(
            "PUBREC {} from {}",
            pubrec.packet_id, session.client_id
        );
        session
            .writer
            .write(Packet::PubRel(PubRel::new(pubrec.packet_id)))?;
        Ok(())
    }

    /// PUBREL from a publisher completes its QoS 2 publish
    pub(crate) fn handle_pubrel(
        &self,
        session: &ClientSession,
        pubrel: PubRel,
    ) -> Result<(), ConnectionError> {
        debug!(
            "PUBREL {} from {}",
            pubrel.packet_id, session.client_id
        );
        session
            .writer
            .write(Packet::PubComp(PubComp::new(pubrel.packet_id)))?;
        Ok(())
    }

    /// PUBCOMP from a subscriber completes a QoS 2 delivery
    pub(crate) fn handle_pubcomp(&self, session: &ClientSession, pubcomp: PubComp) {
        self.acknowledge(session, pubcomp.packet_id, "PUBCOMP");
    }

    fn acknowledge(&self, session: &ClientSession, packet_id: u16, kind: &str) {
        let inflight = self.ctx.engine.fan_out().inflight();
        match inflight.acknowledge(&session.client_id, packet_id) {
            Ok(true) => debug!(
                "{} {} from {} cleared in-flight record",
                kind, packet_id, session.client_id
            ),
            Ok(false) => debug!(
                "{} {} from {} matches no in-flight record",
                kind, packet_id, session.client_id
            ),
            Err(e) => warn!(
                "{} {} from {}: in-flight store failed: {}",
                kind, packet_id, session.client_id, e
            ),
        }
    }
}
