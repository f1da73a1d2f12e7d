//! Publish Engine
//!
//! Routes one inbound PUBLISH: relays it to the cluster, fans it out to
//! locally connected subscribers, acknowledges the publisher and updates
//! the retained store. Each step fails independently.
//!
//! [`FanOut`] is the local-delivery half on its own so that messages arriving
//! from cluster peers can be delivered without being relayed again.

mod ack;
mod delivery;


pub use ack::{send_puback, send_pubrec};
pub use delivery::Delivery;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::cluster::{ClusterRelay, InternalMessage};
use crate::packet_id::PacketIdAllocator;
use crate::protocol::{Packet, Publish, QoS, Will};
use crate::session::{ClientConnection, SendError, SessionDirectory};
use crate::store::{InflightRecord, InflightStore, RetainedMessage, RetainedStore, StoreError};
use crate::topic::SubscriptionDirectory;

/// Failure delivering to a single subscriber
#[derive(Debug)]
pub enum DeliveryError {
    /// In-flight record could not be written; nothing was sent
    Store(StoreError),
    /// The connection refused the packet
    Send(SendError),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "in-flight store: {}", e),
            Self::Send(e) => write!(f, "send: {}", e),
        }
    }
}

impl std::error::Error for DeliveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Send(e) => Some(e),
        }
    }
}

impl From<StoreError> for DeliveryError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<SendError> for DeliveryError {
    fn from(e: SendError) -> Self {
        Self::Send(e)
    }
}

/// Delivers messages to locally connected subscribers
pub struct FanOut {
    sessions: Arc<dyn SessionDirectory>,
    subscriptions: Arc<dyn SubscriptionDirectory>,
    packet_ids: Arc<dyn PacketIdAllocator>,
    inflight: Arc<dyn InflightStore>,
}

impl FanOut {
    pub fn new(
        sessions: Arc<dyn SessionDirectory>,
        subscriptions: Arc<dyn SubscriptionDirectory>,
        packet_ids: Arc<dyn PacketIdAllocator>,
        inflight: Arc<dyn InflightStore>,
    ) -> Self {
        Self {
            sessions,
            subscriptions,
            packet_ids,
            inflight,
        }
    }

    /// Deliver to every connected subscriber whose filter matches `topic`.
    ///
    /// Each subscriber receives `min(qos, subscribed qos)`. Offline subscribers
    /// are skipped. A failure for one subscriber is logged and does not stop
    /// the others. Returns the number of packets written.
    pub fn fan_out(
        &self,
        topic: &Arc<str>,
        qos: QoS,
        payload: &Bytes,
        retain: bool,
        dup: bool,
    ) -> usize {
        let mut delivered = 0;

        for subscription in self.subscriptions.search(topic) {
            if !self.sessions.is_connected(&subscription.client_id) {
                debug!(
                    "Skipping offline subscriber {} for '{}'",
                    subscription.client_id, topic
                );
                continue;
            }
            // Disconnect between the check and the lookup is tolerated.
            let Some(connection) = self.sessions.get(&subscription.client_id) else {
                continue;
            };

            let publish = Publish {
                dup,
                qos: qos.min(subscription.qos),
                retain,
                topic: topic.clone(),
                packet_id: None,
                payload: payload.clone(),
            };

            match self.deliver(connection.as_ref(), &subscription.client_id, publish) {
                Ok(delivery) => {
                    delivered += 1;
                    debug!(
                        "Delivered '{}' to {} via '{}' ({:?})",
                        topic, subscription.client_id, subscription.filter, delivery
                    );
                }
                Err(e) => {
                    warn!(
                        "Delivery of '{}' to {} failed: {}",
                        topic, subscription.client_id, e
                    );
                }
            }
        }

        delivered
    }

    /// Send one PUBLISH at its already-effective QoS.
    ///
    /// QoS 1/2 gets a fresh packet identifier and the client's in-flight
    /// record is replaced before the packet is written.
    pub fn deliver(
        &self,
        connection: &dyn ClientConnection,
        client_id: &Arc<str>,
        publish: Publish,
    ) -> Result<Delivery, DeliveryError> {
        let delivery = Delivery::plan(publish.qos, self.packet_ids.as_ref());
        let publish = delivery.apply(publish);

        if let Some(packet_id) = delivery.packet_id() {
            self.inflight.put(
                client_id,
                InflightRecord {
                    client_id: client_id.clone(),
                    topic: publish.topic.clone(),
                    qos: publish.qos,
                    payload: publish.payload.clone(),
                    packet_id,
                },
            )?;
        }

        connection.write(Packet::Publish(publish))?;
        Ok(delivery)
    }

    pub fn inflight(&self) -> &Arc<dyn InflightStore> {
        &self.inflight
    }
}

/// Entry point for PUBLISH packets received from local clients
pub struct PublishEngine {
    fan_out: Arc<FanOut>,
    retained: Arc<dyn RetainedStore>,
    relay: Arc<dyn ClusterRelay>,
}

impl PublishEngine {
    pub fn new(
        fan_out: Arc<FanOut>,
        retained: Arc<dyn RetainedStore>,
        relay: Arc<dyn ClusterRelay>,
    ) -> Self {
        Self {
            fan_out,
            retained,
            relay,
        }
    }

    pub fn fan_out(&self) -> &FanOut {
        &self.fan_out
    }

    pub fn retained(&self) -> &Arc<dyn RetainedStore> {
        &self.retained
    }

    /// Process a validated PUBLISH from `source`.
    ///
    /// Order: cluster relay, local fan-out, publisher acknowledgment,
    /// retained update. Subscribers always receive `dup` and `retain` cleared.
    pub fn process_publish(&self, source: &dyn ClientConnection, publish: Publish) {
        let Publish {
            qos,
            retain,
            topic,
            packet_id,
            payload,
            ..
        } = publish;

        self.relay
            .send(InternalMessage::new(topic.clone(), qos, payload.clone()));

        let delivered = self.fan_out.fan_out(&topic, qos, &payload, false, false);
        debug!(
            "PUBLISH '{}' from {} ({:?}) reached {} subscribers",
            topic,
            source.client_id(),
            qos,
            delivered
        );

        match (qos, packet_id) {
            (QoS::AtMostOnce, _) => {}
            (QoS::AtLeastOnce, Some(id)) => send_puback(source, id),
            (QoS::ExactlyOnce, Some(id)) => send_pubrec(source, id),
            (_, None) => warn!(
                "{:?} PUBLISH '{}' from {} has no packet id",
                qos,
                topic,
                source.client_id()
            ),
        }

        if retain {
            self.update_retained(&topic, qos, payload);
        }
    }

    /// Publish a client's will after an abnormal disconnect
    pub fn publish_will(&self, client_id: &str, will: &Will) {
        let topic: Arc<str> = Arc::from(will.topic.as_str());
        debug!("Publishing will of {} on '{}'", client_id, topic);

        self.relay
            .send(InternalMessage::new(topic.clone(), will.qos, will.payload.clone()));
        self.fan_out
            .fan_out(&topic, will.qos, &will.payload, false, false);

        if will.retain {
            self.update_retained(&topic, will.qos, will.payload.clone());
        }
    }

    /// Empty payload clears the topic, anything else replaces it
    fn update_retained(&self, topic: &Arc<str>, qos: QoS, payload: Bytes) {
        let result = if payload.is_empty() {
            self.retained.remove(topic)
        } else {
            self.retained.put(
                topic,
                RetainedMessage {
                    topic: topic.clone(),
                    qos,
                    payload,
                },
            )
        };

        if let Err(e) = result {
            warn!("Retained update for '{}' failed: {}", topic, e);
        }
    }
}
