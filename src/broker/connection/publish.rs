//! PUBLISH packet handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::{ClientSession, Connection, ConnectionError};
use crate::protocol::{ProtocolError, Publish};
use crate::topic::validate_topic_name_with_max_levels;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Validate an inbound PUBLISH and hand it to the publish engine
    pub(crate) fn handle_publish(
        &self,
        session: &ClientSession,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        trace!(
            "PUBLISH from {} on '{}' ({:?}, retain: {}, {} bytes)",
            session.client_id,
            publish.topic,
            publish.qos,
            publish.retain,
            publish.payload.len()
        );

        validate_topic_name_with_max_levels(
            &publish.topic,
            self.ctx.config.limits.max_topic_levels,
        )
        .map_err(|reason| ConnectionError::Protocol(ProtocolError::Violation(reason)))?;

        if publish.qos > self.ctx.max_qos {
            return Err(ConnectionError::Protocol(ProtocolError::Violation(
                "QoS exceeds maximum",
            )));
        }

        if publish.retain && !self.ctx.config.mqtt.retain_available {
            return Err(ConnectionError::Protocol(ProtocolError::Violation(
                "retain not available",
            )));
        }

        self.ctx
            .engine
            .process_publish(session.writer.as_ref(), publish);
        Ok(())
    }
}
