use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::{Error, Packet};

/// MQTT 3.1/3.1.1 codec
#[derive(Debug, Clone)]
pub struct Codec {
    /// Maximum packet size allowed by client
    pub max_incoming_size: usize,
    /// Maximum packet size allowed by broker
    pub max_outgoing_size: usize,
}

impl Decoder for Codec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        match Packet::read(src, self.max_incoming_size) {
            Ok(packet) => Ok(Some(packet)),
            Err(Error::InsufficientBytes(required)) => {
                src.reserve(required);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Encoder<Packet> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write(dst, self.max_outgoing_size)?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::{Publish, QoS};

    #[test]
    fn partial_frames_return_none_until_complete() {
        let mut codec = Codec {
            max_incoming_size: 1024,
            max_outgoing_size: 1024,
        };

        let mut publish = Publish::new("a/b", QoS::AtLeastOnce, vec![1, 2, 3]);
        publish.pkid = 1;

        let mut encoded = BytesMut::new();
        codec
            .encode(Packet::Publish(publish.clone()), &mut encoded)
            .unwrap();

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&encoded[..4]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&encoded[4..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, Packet::Publish(publish));
    }
}
