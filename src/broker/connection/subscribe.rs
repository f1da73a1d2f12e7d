//! SUBSCRIBE and UNSUBSCRIBE packet handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{ClientSession, Connection, ConnectionError};
use crate::protocol::{
    Packet, Publish, QoS, SubAck, SubAckReturnCode, Subscribe, UnsubAck, Unsubscribe,
};
use crate::session::ClientConnection;
use crate::topic::validate_topic_filter_with_max_levels;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle SUBSCRIBE packet
    pub(crate) fn handle_subscribe(
        &self,
        session: &ClientSession,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let max_levels = self.ctx.config.limits.max_topic_levels;
        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut granted_filters: Vec<(String, QoS)> = Vec::new();

        for sub in subscribe.subscriptions {
            if let Err(reason) = validate_topic_filter_with_max_levels(&sub.filter, max_levels) {
                debug!(
                    "Rejecting filter '{}' from {}: {}",
                    sub.filter, session.client_id, reason
                );
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            let granted = sub.qos.min(self.ctx.max_qos);
            self.ctx
                .subscriptions
                .subscribe(&session.client_id, &sub.filter, granted);
            debug!(
                "{} subscribed to '{}' ({:?})",
                session.client_id, sub.filter, granted
            );
            return_codes.push(SubAckReturnCode::Granted(granted));
            granted_filters.push((sub.filter, granted));
        }

        session.writer.write(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))?;

        for (filter, granted) in &granted_filters {
            self.replay_retained(session, filter, *granted);
        }
        Ok(())
    }

    /// Send retained messages matching a new subscription
    fn replay_retained(&self, session: &ClientSession, filter: &str, granted: QoS) {
        let messages = match self.ctx.engine.retained().matching(filter) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Retained lookup for '{}' failed: {}", filter, e);
                return;
            }
        };

        let fan_out = self.ctx.engine.fan_out();
        for message in messages {
            let publish = Publish {
                dup: false,
                qos: message.qos.min(granted),
                retain: true,
                topic: message.topic,
                packet_id: None,
                payload: message.payload,
            };
            let topic = publish.topic.clone();
            if let Err(e) = fan_out.deliver(session.writer.as_ref(), &session.client_id, publish) {
                warn!(
                    "Retained '{}' to {} failed: {}",
                    topic, session.client_id, e
                );
            }
        }
    }

    /// Handle UNSUBSCRIBE packet
    pub(crate) fn handle_unsubscribe(
        &self,
        session: &ClientSession,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsubscribe.filters {
            let removed = self
                .ctx
                .subscriptions
                .unsubscribe(filter, &session.client_id);
            debug!(
                "{} unsubscribed from '{}' (existed: {})",
                session.client_id, filter, removed
            );
        }

        session.writer.write(Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }))?;
        Ok(())
    }
}
