//! MQTT Packet Encoder
//!
//! Encodes MQTT v3.1 / v3.1.1 packets

use bytes::{BufMut, BytesMut};

use super::{put_prefixed, put_remaining_length};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
};

/// MQTT Packet Encoder
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) => self.encode_ack(0x40, p.packet_id, buf),
            Packet::PubRec(p) => self.encode_ack(0x50, p.packet_id, buf),
            // PUBREL carries the reserved 0010 flags
            Packet::PubRel(p) => self.encode_ack(0x62, p.packet_id, buf),
            Packet::PubComp(p) => self.encode_ack(0x70, p.packet_id, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => self.encode_ack(0xB0, p.packet_id, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0); // PINGREQ type + flags
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0); // PINGRESP type + flags
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0);
                buf.put_u8(0x00);
                Ok(())
            }
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let protocol_name = packet.protocol_version.protocol_name();

        // Protocol name, level, flags, keep alive
        let mut remaining_length = 2 + protocol_name.len() + 1 + 1 + 2;

        remaining_length += 2 + packet.client_id.len();

        if let Some(ref will) = packet.will {
            remaining_length += 2 + will.topic.len();
            remaining_length += 2 + will.payload.len();
        }

        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }

        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        buf.put_u8(0x10);
        put_remaining_length(buf, remaining_length)?;

        put_prefixed(buf, protocol_name.as_bytes())?;
        buf.put_u8(packet.protocol_version as u8);

        let mut connect_flags: u8 = 0;
        if packet.clean_session {
            connect_flags |= 0x02;
        }
        if let Some(ref will) = packet.will {
            connect_flags |= 0x04;
            connect_flags |= (will.qos as u8) << 3;
            if will.retain {
                connect_flags |= 0x20;
            }
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);

        buf.put_u16(packet.keep_alive);

        put_prefixed(buf, packet.client_id.as_bytes())?;

        if let Some(ref will) = packet.will {
            put_prefixed(buf, will.topic.as_bytes())?;
            put_prefixed(buf, &will.payload)?;
        }

        if let Some(ref username) = packet.username {
            put_prefixed(buf, username.as_bytes())?;
        }

        if let Some(ref password) = packet.password {
            put_prefixed(buf, password)?;
        }

        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x20);
        buf.put_u8(0x02);
        buf.put_u8(if packet.session_present { 0x01 } else { 0x00 });
        buf.put_u8(packet.return_code as u8);
        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let packet_id = match (packet.qos, packet.packet_id) {
            (QoS::AtMostOnce, _) => None,
            (_, Some(id)) => Some(id),
            (_, None) => return Err(EncodeError::MissingPacketId),
        };

        let mut remaining_length = 2 + packet.topic.len();
        if packet_id.is_some() {
            remaining_length += 2;
        }
        remaining_length += packet.payload.len();

        let mut first_byte: u8 = 0x30; // PUBLISH type (0011)
        if packet.dup {
            first_byte |= 0x08;
        }
        first_byte |= (packet.qos as u8) << 1;
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.put_u8(first_byte);
        put_remaining_length(buf, remaining_length)?;

        put_prefixed(buf, packet.topic.as_bytes())?;

        if let Some(packet_id) = packet_id {
            buf.put_u16(packet_id);
        }

        buf.put_slice(&packet.payload);

        Ok(())
    }

    /// Two-byte packet id acknowledgments (PUBACK, PUBREC, PUBREL, PUBCOMP, UNSUBACK)
    fn encode_ack(&self, header: u8, packet_id: u16, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(header);
        buf.put_u8(0x02);
        buf.put_u16(packet_id);
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet
            .subscriptions
            .iter()
            .map(|s| 2 + s.filter.len() + 1)
            .sum::<usize>();

        buf.put_u8(0x82); // SUBSCRIBE type + reserved flags (1000 0010)
        put_remaining_length(buf, remaining_length)?;
        buf.put_u16(packet.packet_id);

        for sub in &packet.subscriptions {
            put_prefixed(buf, sub.filter.as_bytes())?;
            buf.put_u8(sub.qos as u8);
        }

        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet.return_codes.len();

        buf.put_u8(0x90);
        put_remaining_length(buf, remaining_length)?;
        buf.put_u16(packet.packet_id);

        for code in &packet.return_codes {
            buf.put_u8(code.to_u8());
        }

        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet
            .filters
            .iter()
            .map(|f| 2 + f.len())
            .sum::<usize>();

        buf.put_u8(0xA2); // UNSUBSCRIBE type + reserved flags (1010 0010)
        put_remaining_length(buf, remaining_length)?;
        buf.put_u16(packet.packet_id);

        for filter in &packet.filters {
            put_prefixed(buf, filter.as_bytes())?;
        }

        Ok(())
    }
}
