//! MQTT Packet Decoder
//!
//! Decodes MQTT v3.1 / v3.1.1 packets. The broker only ever receives the
//! client-to-server packets, but the server-to-client ones are decoded too so
//! that test clients can share the codec.

use std::sync::Arc;

use bytes::Bytes;

use super::{read_remaining_length, Reader, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolVersion, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, SubAckReturnCode, Subscribe, Subscription, UnsubAck,
    Unsubscribe, Will,
};

/// Frame splitter and packet parser for one connection
pub struct Decoder {
    max_packet_size: usize,
    /// Set once a CONNECT has been decoded
    protocol_version: Option<ProtocolVersion>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version: None,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    /// Decode the first packet in `buf`.
    ///
    /// Returns the packet and the number of bytes it used, or `None` if the
    /// frame is not complete yet.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some(&header) = buf.first() else {
            return Ok(None);
        };
        let Some((size, len_bytes)) = read_remaining_length(&buf[1..])? else {
            return Ok(None);
        };
        if size > self.max_packet_size {
            return Err(DecodeError::TooLarge {
                size,
                max: self.max_packet_size,
            });
        }

        let frame_len = 1 + len_bytes + size;
        let Some(body) = buf.get(1 + len_bytes..frame_len) else {
            return Ok(None);
        };

        let flags = header & 0x0F;
        let mut body = Reader::new(body);
        let packet = match header >> 4 {
            1 => {
                require_flags(flags, 0)?;
                self.decode_connect(&mut body)?
            }
            2 => {
                require_flags(flags, 0)?;
                decode_connack(&mut body)?
            }
            3 => decode_publish(flags, &mut body)?,
            4 => Packet::PubAck(PubAck::new(ack_id(flags, 0, &mut body)?)),
            5 => Packet::PubRec(PubRec::new(ack_id(flags, 0, &mut body)?)),
            6 => Packet::PubRel(PubRel::new(ack_id(flags, 0x02, &mut body)?)),
            7 => Packet::PubComp(PubComp::new(ack_id(flags, 0, &mut body)?)),
            8 => {
                require_flags(flags, 0x02)?;
                decode_subscribe(&mut body)?
            }
            9 => {
                require_flags(flags, 0)?;
                decode_suback(&mut body)?
            }
            10 => {
                require_flags(flags, 0x02)?;
                decode_unsubscribe(&mut body)?
            }
            11 => Packet::UnsubAck(UnsubAck {
                packet_id: ack_id(flags, 0, &mut body)?,
            }),
            12 => empty(flags, &body, Packet::PingReq)?,
            13 => empty(flags, &body, Packet::PingResp)?,
            14 => empty(flags, &body, Packet::Disconnect)?,
            other => return Err(DecodeError::UnknownPacketType(other)),
        };

        Ok(Some((packet, frame_len)))
    }

    fn decode_connect(&mut self, body: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        let protocol_name = body.string("truncated protocol name")?;
        let level = body.u8("missing protocol level")?;
        let protocol_version = match (protocol_name, level) {
            ("MQTT", 4) => ProtocolVersion::V311,
            ("MQIsdp", 3) => ProtocolVersion::V31,
            ("MQTT" | "MQIsdp", level) => return Err(DecodeError::UnsupportedLevel(level)),
            _ => return Err(DecodeError::UnknownProtocol),
        };
        self.protocol_version = Some(protocol_version);

        let connect_flags = body.u8("missing connect flags")?;
        if connect_flags & 0x01 != 0 {
            return Err(DecodeError::ReservedFlags);
        }
        let clean_session = connect_flags & 0x02 != 0;
        let will_flag = connect_flags & 0x04 != 0;
        let will_qos_bits = (connect_flags >> 3) & 0x03;
        let will_retain = connect_flags & 0x20 != 0;
        let password_flag = connect_flags & 0x40 != 0;
        let username_flag = connect_flags & 0x80 != 0;

        // Password without username is not allowed in v3.1.1
        if password_flag && !username_flag {
            return Err(DecodeError::ReservedFlags);
        }
        let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;
        if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(DecodeError::ReservedFlags);
        }

        let keep_alive = body.u16("missing keep alive")?;
        let client_id = body.string("truncated client id")?.to_string();

        let will = if will_flag {
            let topic = body.string("truncated will topic")?.to_string();
            let payload = Bytes::copy_from_slice(body.binary("truncated will payload")?);
            Some(Will {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = match username_flag {
            true => Some(body.string("truncated username")?.to_string()),
            false => None,
        };
        let password = match password_flag {
            true => Some(Bytes::copy_from_slice(body.binary("truncated password")?)),
            false => None,
        };

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id,
            clean_session,
            keep_alive,
            username,
            password,
            will,
        })))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn require_flags(flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags == expected {
        Ok(())
    } else {
        Err(DecodeError::ReservedFlags)
    }
}

fn empty(flags: u8, body: &Reader<'_>, packet: Packet) -> Result<Packet, DecodeError> {
    require_flags(flags, 0)?;
    if !body.is_empty() {
        return Err(DecodeError::Malformed("unexpected payload"));
    }
    Ok(packet)
}

/// Body of PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK
fn ack_id(flags: u8, expected: u8, body: &mut Reader<'_>) -> Result<u16, DecodeError> {
    require_flags(flags, expected)?;
    let id = body.u16("ack must carry a packet id")?;
    if !body.is_empty() {
        return Err(DecodeError::Malformed("ack must carry only a packet id"));
    }
    Ok(id)
}

fn decode_connack(body: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    let ack_flags = body.u8("CONNACK length must be 2")?;
    let code = body.u8("CONNACK length must be 2")?;
    if !body.is_empty() {
        return Err(DecodeError::Malformed("CONNACK length must be 2"));
    }
    // Only bit 0 (session present) may be set
    if ack_flags & 0xFE != 0 {
        return Err(DecodeError::ReservedFlags);
    }
    let return_code = ConnectReturnCode::from_u8(code)
        .ok_or(DecodeError::Malformed("unknown CONNACK return code"))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: ack_flags & 0x01 != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    let dup = flags & 0x08 != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = flags & 0x01 != 0;
    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::Malformed("DUP must be 0 for QoS 0"));
    }

    let topic = body.string("truncated topic")?;
    if topic.contains(['+', '#']) {
        return Err(DecodeError::Malformed("topic contains wildcard"));
    }
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(body.packet_id()?),
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Arc::from(topic),
        packet_id,
        payload: Bytes::copy_from_slice(body.rest()),
    }))
}

fn decode_subscribe(body: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    let packet_id = body.packet_id()?;

    let mut subscriptions = Vec::new();
    while !body.is_empty() {
        let filter = body.string("truncated topic filter")?;
        if filter.is_empty() {
            return Err(DecodeError::Malformed("topic filter cannot be empty"));
        }
        let requested = body.u8("missing requested QoS")?;
        // Upper six bits are reserved
        if requested & 0xFC != 0 {
            return Err(DecodeError::Malformed("reserved subscription bits set"));
        }
        let qos = QoS::from_u8(requested).ok_or(DecodeError::InvalidQoS(requested))?;
        subscriptions.push(Subscription {
            filter: filter.to_string(),
            qos,
        });
    }

    if subscriptions.is_empty() {
        return Err(DecodeError::Malformed("SUBSCRIBE must have at least one topic"));
    }
    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
    }))
}

fn decode_suback(body: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    let packet_id = body.u16("truncated packet id")?;
    let codes = body.rest();
    if codes.is_empty() {
        return Err(DecodeError::Malformed("SUBACK without return codes"));
    }
    let return_codes = codes
        .iter()
        .map(|&code| {
            SubAckReturnCode::from_u8(code)
                .ok_or(DecodeError::Malformed("invalid SUBACK return code"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(body: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    let packet_id = body.packet_id()?;

    let mut filters = Vec::new();
    while !body.is_empty() {
        filters.push(body.string("truncated topic filter")?.to_string());
    }
    if filters.is_empty() {
        return Err(DecodeError::Malformed("UNSUBSCRIBE must have at least one topic"));
    }
    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}
