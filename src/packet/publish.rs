use super::*;
use bytes::{Buf, Bytes};

/// Publish packet
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub pkid: u16,
    pub payload: Bytes,
}

impl Publish {
    pub fn new<S: Into<String>, P: Into<Vec<u8>>>(topic: S, qos: QoS, payload: P) -> Publish {
        Publish::from_bytes(topic, qos, Bytes::from(payload.into()))
    }

    pub fn from_bytes<S: Into<String>>(topic: S, qos: QoS, payload: Bytes) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            pkid: 0,
            topic: topic.into(),
            payload,
        }
    }

    pub fn len(&self) -> usize {
        let pkid = match self.qos {
            QoS::AtMostOnce => 0,
            _ => 2,
        };

        2 + self.topic.len() + pkid + self.payload.len()
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Self, Error> {
        // the flag nibble of byte one: dup(3), qos(2..1), retain(0)
        let flags = fixed_header.byte1 & 0x0F;
        let qos = qos((flags >> 1) & 0x03)?;

        bytes.advance(fixed_header.fixed_header_len);
        let topic = take_string(&mut bytes)?;
        let pkid = match qos {
            QoS::AtMostOnce => 0,
            _ => take_u16(&mut bytes)?,
        };

        // whatever is left of the frame is the payload
        Ok(Publish {
            dup: flags & 0x08 != 0,
            qos,
            retain: flags & 0x01 != 0,
            topic,
            pkid,
            payload: bytes,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        if self.qos != QoS::AtMostOnce && self.pkid == 0 {
            return Err(Error::MalformedPacket);
        }

        let mut byte1 = 0x30 | (self.qos as u8) << 1;
        if self.dup {
            byte1 |= 0x08;
        }
        if self.retain {
            byte1 |= 0x01;
        }
        buffer.put_u8(byte1);

        let len = self.len();
        let count = put_remaining_length(buffer, len)?;
        put_string(buffer, &self.topic);
        if self.qos != QoS::AtMostOnce {
            buffer.put_u16(self.pkid);
        }
        buffer.extend_from_slice(&self.payload);

        Ok(1 + count + len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn publish_with_identifier_round_trips() {
        let mut publish = Publish::new("sensors/kitchen/temp", QoS::AtLeastOnce, vec![0x21, 0x17]);
        publish.pkid = 42;

        let mut buffer = BytesMut::new();
        publish.write(&mut buffer).unwrap();

        assert_eq!(
            &buffer[..],
            &[
                0x32, 26, // qos 1 publish, remaining length
                0x00, 0x14, b's', b'e', b'n', b's', b'o', b'r', b's', b'/', b'k', b'i', b't',
                b'c', b'h', b'e', b'n', b'/', b't', b'e', b'm', b'p', // topic
                0x00, 0x2A, // pkid = 42
                0x21, 0x17, // payload
            ]
        );

        let packet = Packet::read(&mut buffer, 100).unwrap();
        assert_eq!(packet, Packet::Publish(publish));
    }

    #[test]
    fn qos0_publish_has_no_identifier() {
        let mut buffer = BytesMut::from(&[0x30, 8, 0x00, 0x04, b'l', b'o', b'g', b's', b'o', b'k'][..]);
        let packet = Packet::read(&mut buffer, 100).unwrap();

        assert_eq!(
            packet,
            Packet::Publish(Publish::new("logs", QoS::AtMostOnce, "ok"))
        );
    }

    #[test]
    fn dup_and_retain_bits_round_trip() {
        let publish = Publish {
            dup: true,
            qos: QoS::ExactlyOnce,
            retain: true,
            topic: "a".to_owned(),
            pkid: 7,
            payload: Bytes::from_static(b"x"),
        };

        let mut buffer = BytesMut::new();
        publish.write(&mut buffer).unwrap();
        assert_eq!(buffer[0], 0x3D);

        let packet = Packet::read(&mut buffer, 100).unwrap();
        assert_eq!(packet, Packet::Publish(publish));
    }

    #[test]
    fn publish_without_identifier_is_rejected() {
        let publish = Publish::new("logs", QoS::AtLeastOnce, "ok");
        let mut buffer = BytesMut::new();

        match publish.write(&mut buffer) {
            Err(Error::MalformedPacket) => (),
            v => panic!("Expecting malformed packet error. Found = {:?}", v),
        }
    }
}
