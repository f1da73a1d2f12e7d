//! Per-subscriber delivery intent

use crate::packet_id::PacketIdAllocator;
use crate::protocol::{Publish, QoS};

/// How a single PUBLISH goes out to one subscriber.
///
/// Only acknowledged deliveries carry a packet identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    AtMostOnce,
    AtLeastOnce { packet_id: u16 },
    ExactlyOnce { packet_id: u16 },
}

impl Delivery {
    /// Choose the delivery for an effective QoS, allocating an id when needed
    pub fn plan(qos: QoS, packet_ids: &dyn PacketIdAllocator) -> Self {
        match qos {
            QoS::AtMostOnce => Delivery::AtMostOnce,
            QoS::AtLeastOnce => Delivery::AtLeastOnce {
                packet_id: packet_ids.next_id(),
            },
            QoS::ExactlyOnce => Delivery::ExactlyOnce {
                packet_id: packet_ids.next_id(),
            },
        }
    }

    pub fn qos(&self) -> QoS {
        match self {
            Delivery::AtMostOnce => QoS::AtMostOnce,
            Delivery::AtLeastOnce { .. } => QoS::AtLeastOnce,
            Delivery::ExactlyOnce { .. } => QoS::ExactlyOnce,
        }
    }

    pub fn packet_id(&self) -> Option<u16> {
        match *self {
            Delivery::AtMostOnce => None,
            Delivery::AtLeastOnce { packet_id } | Delivery::ExactlyOnce { packet_id } => {
                Some(packet_id)
            }
        }
    }

    /// Stamp QoS and packet identifier onto an outbound PUBLISH
    pub fn apply(&self, mut publish: Publish) -> Publish {
        publish.qos = self.qos();
        publish.packet_id = self.packet_id();
        publish
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_id::AtomicPacketIds;
    use test_case::test_case;

    #[test_case(QoS::AtMostOnce, None ; "qos0 has no id")]
    #[test_case(QoS::AtLeastOnce, Some(1) ; "qos1 allocates")]
    #[test_case(QoS::ExactlyOnce, Some(1) ; "qos2 allocates")]
    fn test_plan(qos: QoS, expected_id: Option<u16>) {
        let ids = AtomicPacketIds::new();
        let delivery = Delivery::plan(qos, &ids);
        assert_eq!(delivery.qos(), qos);
        assert_eq!(delivery.packet_id(), expected_id);
    }

    #[test]
    fn test_qos0_does_not_consume_ids() {
        let ids = AtomicPacketIds::new();
        Delivery::plan(QoS::AtMostOnce, &ids);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn test_apply_overwrites_qos_and_id() {
        let publish = Publish {
            qos: QoS::ExactlyOnce,
            packet_id: Some(42),
            ..Default::default()
        };
        let out = Delivery::AtMostOnce.apply(publish);
        assert_eq!(out.qos, QoS::AtMostOnce);
        assert_eq!(out.packet_id, None);

        let out = Delivery::AtLeastOnce { packet_id: 7 }.apply(out);
        assert_eq!(out.qos, QoS::AtLeastOnce);
        assert_eq!(out.packet_id, Some(7));
    }
}
