//! MQTT 3.1/3.1.1 packet serialization and deserialization.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

mod acks;
mod codec;
mod connect;
mod publish;
mod subscribe;
mod topic;

pub use acks::*;
pub use codec::*;
pub use connect::*;
pub use publish::*;
pub use subscribe::*;
pub use topic::*;

/// Remaining length is capped at four 7 bit digits
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Errors during serialization and deserialization
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Invalid connect return code: {0}")]
    InvalidConnectReturnCode(u8),
    #[error("Invalid protocol name")]
    InvalidProtocol,
    #[error("Invalid protocol level: {0}")]
    InvalidProtocolLevel(u8),
    #[error("Incorrect packet format")]
    IncorrectPacketFormat,
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),
    #[error("Invalid subscribe return code: {0}")]
    InvalidSubscribeReturnCode(u8),
    #[error("Payload required")]
    PayloadRequired,
    #[error("Payload size {pkt_size} bigger than limit {max}")]
    PayloadSizeLimitExceeded { pkt_size: usize, max: usize },
    #[error("Topic is not valid utf-8")]
    TopicNotUtf8,
    #[error("Promised boundary crossed: {0}")]
    BoundaryCrossed(usize),
    #[error("Malformed packet")]
    MalformedPacket,
    #[error("Malformed remaining length")]
    MalformedRemainingLength,
    /// More bytes required to frame packet. Argument implies minimum
    /// additional bytes required to proceed further
    #[error("At least {0} more bytes required to frame packet")]
    InsufficientBytes(usize),
    #[error("I/O: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(Arc::new(e))
    }
}

/// MQTT packet type
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

/// Protocol version. 3.1 connects with the "MQIsdp" protocol name at
/// level 3, 3.1.1 with "MQTT" at level 4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    V31,
    V311,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::V31 => "MQIsdp",
            Protocol::V311 => "MQTT",
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            Protocol::V31 => 3,
            Protocol::V311 => 4,
        }
    }
}

/// Quality of service
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// Maps a number to QoS
pub fn qos(num: u8) -> Result<QoS, Error> {
    match num {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        qos => Err(Error::InvalidQoS(qos)),
    }
}

/// First byte and remaining length of a packet. Every packet starts with
/// the type and flag nibbles in byte one, followed by the remaining
/// length of the variable header plus payload, which is enough to size
/// the frame before assembling it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub struct FixedHeader {
    /// Type nibble and per type flag bits
    pub byte1: u8,
    /// Bytes the header itself occupies: byte one plus 1 to 4 length
    /// digits
    pub fixed_header_len: usize,
    /// Bytes after the header: variable header plus payload
    pub remaining_len: usize,
}

impl FixedHeader {
    /// Decodes the header from the front of `stream` without consuming
    /// anything. Fails with `InsufficientBytes` until the whole frame is
    /// buffered, so a partial read never produces a partial packet
    fn peek(stream: &[u8], max_size: usize) -> Result<FixedHeader, Error> {
        if stream.len() < 2 {
            return Err(Error::InsufficientBytes(2 - stream.len()));
        }

        // remaining length digits carry 7 bits each, least significant
        // first, with the high bit flagging a continuation
        let mut remaining_len = 0;
        let mut len_len = 0;
        loop {
            if len_len == 4 {
                return Err(Error::MalformedRemainingLength);
            }

            let digit = match stream.get(1 + len_len) {
                Some(digit) => *digit,
                None => return Err(Error::InsufficientBytes(1)),
            };

            remaining_len |= ((digit & 0x7F) as usize) << (7 * len_len);
            len_len += 1;

            if digit & 0x80 == 0 {
                break;
            }
        }

        let header = FixedHeader {
            byte1: stream[0],
            fixed_header_len: 1 + len_len,
            remaining_len,
        };

        // refuse to buffer frames beyond the configured limit
        if remaining_len > max_size {
            return Err(Error::PayloadSizeLimitExceeded {
                pkt_size: remaining_len,
                max: max_size,
            });
        }

        if stream.len() < header.frame_length() {
            return Err(Error::InsufficientBytes(
                header.frame_length() - stream.len(),
            ));
        }

        Ok(header)
    }

    pub fn packet_type(&self) -> Result<PacketType, Error> {
        let num = self.byte1 >> 4;
        match num {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(Error::InvalidPacketType(num)),
        }
    }

    /// Size of the whole frame
    pub fn frame_length(&self) -> usize {
        self.fixed_header_len + self.remaining_len
    }
}

/// Encapsulates all MQTT packet types
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Reads a stream of bytes and extracts next MQTT packet out of it
    pub fn read(stream: &mut BytesMut, max_size: usize) -> Result<Packet, Error> {
        let fixed_header = FixedHeader::peek(&stream[..], max_size)?;

        let frame = stream.split_to(fixed_header.frame_length());
        let packet_type = fixed_header.packet_type()?;

        if fixed_header.remaining_len == 0 {
            // no payload packets
            return match packet_type {
                PacketType::PingReq => Ok(Packet::PingReq),
                PacketType::PingResp => Ok(Packet::PingResp),
                PacketType::Disconnect => Ok(Packet::Disconnect),
                _ => Err(Error::PayloadRequired),
            };
        }

        let frame = frame.freeze();
        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(fixed_header, frame)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(fixed_header, frame)?),
            PacketType::Publish => Packet::Publish(Publish::read(fixed_header, frame)?),
            PacketType::PubAck => Packet::PubAck(PubAck::read(fixed_header, frame)?),
            PacketType::PubRec => Packet::PubRec(PubRec::read(fixed_header, frame)?),
            PacketType::PubRel => Packet::PubRel(PubRel::read(fixed_header, frame)?),
            PacketType::PubComp => Packet::PubComp(PubComp::read(fixed_header, frame)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(fixed_header, frame)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(fixed_header, frame)?),
            PacketType::Unsubscribe => {
                Packet::Unsubscribe(Unsubscribe::read(fixed_header, frame)?)
            }
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::read(fixed_header, frame)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect,
        };

        Ok(packet)
    }

    /// Serializes the packet into the write buffer
    pub fn write(&self, buffer: &mut BytesMut, max_size: usize) -> Result<usize, Error> {
        if self.len() > max_size {
            return Err(Error::PayloadSizeLimitExceeded {
                pkt_size: self.len(),
                max: max_size,
            });
        }

        match self {
            Packet::Connect(connect) => connect.write(buffer),
            Packet::ConnAck(connack) => connack.write(buffer),
            Packet::Publish(publish) => publish.write(buffer),
            Packet::PubAck(puback) => puback.write(buffer),
            Packet::PubRec(pubrec) => pubrec.write(buffer),
            Packet::PubRel(pubrel) => pubrel.write(buffer),
            Packet::PubComp(pubcomp) => pubcomp.write(buffer),
            Packet::Subscribe(subscribe) => subscribe.write(buffer),
            Packet::SubAck(suback) => suback.write(buffer),
            Packet::Unsubscribe(unsubscribe) => unsubscribe.write(buffer),
            Packet::UnsubAck(unsuback) => unsuback.write(buffer),
            Packet::PingReq => {
                buffer.put_slice(&[0xC0, 0]);
                Ok(2)
            }
            Packet::PingResp => {
                buffer.put_slice(&[0xD0, 0]);
                Ok(2)
            }
            Packet::Disconnect => {
                buffer.put_slice(&[0xE0, 0]);
                Ok(2)
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Packet::Connect(connect) => connect.len(),
            Packet::ConnAck(connack) => connack.len(),
            Packet::Publish(publish) => publish.len(),
            Packet::Subscribe(subscribe) => subscribe.len(),
            Packet::SubAck(suback) => suback.len(),
            Packet::Unsubscribe(unsubscribe) => unsubscribe.len(),
            // two byte acks and empty packets
            _ => 2,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Packet id carried by the packet. 0 for packet types which don't
    /// have one
    pub fn packet_id(&self) -> u16 {
        match self {
            Packet::Publish(publish) => publish.pkid,
            Packet::PubAck(puback) => puback.pkid,
            Packet::PubRec(pubrec) => pubrec.pkid,
            Packet::PubRel(pubrel) => pubrel.pkid,
            Packet::PubComp(pubcomp) => pubcomp.pkid,
            Packet::Subscribe(subscribe) => subscribe.pkid,
            Packet::SubAck(suback) => suback.pkid,
            Packet::Unsubscribe(unsubscribe) => unsubscribe.pkid,
            Packet::UnsubAck(unsuback) => unsuback.pkid,
            _ => 0,
        }
    }
}

/// Length prefixed binary field: a two byte big endian count followed by
/// that many bytes. Fails when the count points past the end of the
/// frame, which can only happen on a lying remaining length
fn take_bytes(stream: &mut Bytes) -> Result<Bytes, Error> {
    let len = take_u16(stream)? as usize;
    if len > stream.len() {
        return Err(Error::BoundaryCrossed(len));
    }

    Ok(stream.split_to(len))
}

/// Length prefixed utf-8 field
fn take_string(stream: &mut Bytes) -> Result<String, Error> {
    let bytes = take_bytes(stream)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::TopicNotUtf8)
}

fn take_u16(stream: &mut Bytes) -> Result<u16, Error> {
    if stream.len() < 2 {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u16())
}

fn take_u8(stream: &mut Bytes) -> Result<u8, Error> {
    if stream.is_empty() {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u8())
}

fn put_bytes(buffer: &mut BytesMut, bytes: &[u8]) {
    buffer.put_u16(bytes.len() as u16);
    buffer.extend_from_slice(bytes);
}

fn put_string(buffer: &mut BytesMut, value: &str) {
    put_bytes(buffer, value.as_bytes());
}

/// Encodes `len` as the variable length remaining length field and
/// returns the number of digits written
fn put_remaining_length(buffer: &mut BytesMut, mut len: usize) -> Result<usize, Error> {
    if len > MAX_REMAINING_LENGTH {
        return Err(Error::PayloadSizeLimitExceeded {
            pkt_size: len,
            max: MAX_REMAINING_LENGTH,
        });
    }

    let mut count = 0;
    loop {
        count += 1;
        let digit = (len & 0x7F) as u8;
        len >>= 7;

        if len == 0 {
            buffer.put_u8(digit);
            return Ok(count);
        }

        buffer.put_u8(digit | 0x80);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fixed_header_peek_leaves_the_stream_alone() {
        let stream = [0xC0, 0x00, 0xDE, 0xAD];
        let header = FixedHeader::peek(&stream, 100).unwrap();

        assert_eq!(header.byte1, 0xC0);
        assert_eq!(header.fixed_header_len, 2);
        assert_eq!(header.remaining_len, 0);
        assert_eq!(header.packet_type().unwrap(), PacketType::PingReq);
    }

    #[test]
    fn remaining_length_round_trips_at_the_digit_edges() {
        for len in [
            0usize,
            127,
            128,
            16_383,
            16_384,
            2_097_151,
            2_097_152,
            MAX_REMAINING_LENGTH,
        ] {
            let mut stream = BytesMut::new();
            stream.put_u8(0x30);
            let count = put_remaining_length(&mut stream, len).unwrap();
            assert_eq!(count, stream.len() - 1);

            // without the payload present, peek reports exactly how many
            // bytes the decoded length promises
            match FixedHeader::peek(&stream, usize::MAX) {
                Ok(header) => {
                    assert_eq!(len, 0);
                    assert_eq!(header.remaining_len, 0);
                }
                Err(Error::InsufficientBytes(missing)) => assert_eq!(missing, len),
                v => panic!("Unexpected peek outcome: {:?}", v),
            }
        }
    }

    #[test]
    fn oversized_remaining_length_is_rejected() {
        let mut buffer = BytesMut::new();
        match put_remaining_length(&mut buffer, MAX_REMAINING_LENGTH + 1) {
            Err(Error::PayloadSizeLimitExceeded { .. }) => (),
            v => panic!("Expecting size limit error. Found = {:?}", v),
        }
    }

    #[test]
    fn five_length_digits_are_malformed() {
        let stream = [0x30, 0x80, 0x80, 0x80, 0x80, 0x01];
        match FixedHeader::peek(&stream, usize::MAX) {
            Err(Error::MalformedRemainingLength) => (),
            v => panic!("Expecting malformed length error. Found = {:?}", v),
        }
    }

    #[test]
    fn incomplete_frame_asks_for_more_bytes() {
        let mut stream = BytesMut::new();
        // publish header promising 10 more bytes, only one buffered
        stream.extend_from_slice(&[0x30, 10, 0x00]);

        match Packet::read(&mut stream, 100) {
            Err(Error::InsufficientBytes(count)) => assert_eq!(count, 9),
            v => panic!("Expecting insufficient bytes error. Found = {:?}", v),
        }
    }

    #[test]
    fn frames_over_the_size_limit_are_rejected() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&[0x30, 60]);
        stream.extend_from_slice(&[0u8; 60]);

        match Packet::read(&mut stream, 10) {
            Err(Error::PayloadSizeLimitExceeded { pkt_size, max }) => {
                assert_eq!(pkt_size, 60);
                assert_eq!(max, 10);
            }
            v => panic!("Expecting size limit error. Found = {:?}", v),
        }
    }
}
