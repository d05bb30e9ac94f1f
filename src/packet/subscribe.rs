use super::*;
use bytes::{Buf, Bytes};
use std::convert::TryFrom;

/// Subscription packet
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

impl Subscribe {
    pub fn new<S: Into<String>>(path: S, qos: QoS) -> Subscribe {
        Subscribe {
            pkid: 0,
            filters: vec![SubscribeFilter::new(path.into(), qos)],
        }
    }

    pub fn new_many<T>(topics: T) -> Subscribe
    where
        T: IntoIterator<Item = SubscribeFilter>,
    {
        Subscribe {
            pkid: 0,
            filters: topics.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        // pkid, then a string and an options byte per filter
        let filters: usize = self.filters.iter().map(|f| 2 + f.path.len() + 1).sum();
        2 + filters
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Self, Error> {
        bytes.advance(fixed_header.fixed_header_len);
        let pkid = take_u16(&mut bytes)?;

        let mut filters = Vec::new();
        while !bytes.is_empty() {
            let path = take_string(&mut bytes)?;
            let options = take_u8(&mut bytes)?;
            filters.push(SubscribeFilter::new(path, qos(options & 0x03)?));
        }

        if filters.is_empty() {
            return Err(Error::MalformedPacket);
        }

        Ok(Subscribe { pkid, filters })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        // subscribe type with its reserved flag bits
        buffer.put_u8(0x82);
        let len = self.len();
        let count = put_remaining_length(buffer, len)?;

        buffer.put_u16(self.pkid);
        for filter in &self.filters {
            put_string(buffer, &filter.path);
            buffer.put_u8(filter.qos as u8);
        }

        Ok(1 + count + len)
    }
}

/// Subscription filter
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

impl SubscribeFilter {
    pub fn new(path: String, qos: QoS) -> SubscribeFilter {
        SubscribeFilter { path, qos }
    }
}

/// Acknowledgement to subscribe
#[derive(Debug, Clone, PartialEq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

impl SubAck {
    pub fn new(pkid: u16, return_codes: Vec<SubscribeReturnCode>) -> SubAck {
        SubAck { pkid, return_codes }
    }

    pub fn len(&self) -> usize {
        2 + self.return_codes.len()
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Self, Error> {
        bytes.advance(fixed_header.fixed_header_len);
        let pkid = take_u16(&mut bytes)?;

        // one return code per requested filter
        let mut return_codes = Vec::with_capacity(bytes.len());
        for code in bytes.iter() {
            return_codes.push(SubscribeReturnCode::try_from(*code)?);
        }

        if return_codes.is_empty() {
            return Err(Error::MalformedPacket);
        }

        Ok(SubAck { pkid, return_codes })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        buffer.put_u8(0x90);
        let len = self.len();
        let count = put_remaining_length(buffer, len)?;

        buffer.put_u16(self.pkid);
        for code in &self.return_codes {
            let byte = match code {
                SubscribeReturnCode::Success(qos) => *qos as u8,
                SubscribeReturnCode::Failure => 0x80,
            };
            buffer.put_u8(byte);
        }

        Ok(1 + count + len)
    }
}

/// Per topic return code in suback. Failure (0x80) is a value, not an
/// error, so the caller can inspect which filter was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl TryFrom<u8> for SubscribeReturnCode {
    type Error = crate::packet::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x80 => Ok(SubscribeReturnCode::Failure),
            value => match qos(value) {
                Ok(qos) => Ok(SubscribeReturnCode::Success(qos)),
                Err(_) => Err(Error::InvalidSubscribeReturnCode(value)),
            },
        }
    }
}

/// Unsubscribe packet
#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

impl Unsubscribe {
    pub fn new<S: Into<String>>(topic: S) -> Unsubscribe {
        Unsubscribe {
            pkid: 0,
            topics: vec![topic.into()],
        }
    }

    pub fn len(&self) -> usize {
        let topics: usize = self.topics.iter().map(|topic| 2 + topic.len()).sum();
        2 + topics
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Self, Error> {
        bytes.advance(fixed_header.fixed_header_len);
        let pkid = take_u16(&mut bytes)?;

        let mut topics = Vec::new();
        while !bytes.is_empty() {
            topics.push(take_string(&mut bytes)?);
        }

        if topics.is_empty() {
            return Err(Error::MalformedPacket);
        }

        Ok(Unsubscribe { pkid, topics })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        // unsubscribe type with its reserved flag bits
        buffer.put_u8(0xA2);
        let len = self.len();
        let count = put_remaining_length(buffer, len)?;

        buffer.put_u16(self.pkid);
        for topic in &self.topics {
            put_string(buffer, topic);
        }

        Ok(1 + count + len)
    }
}

/// Acknowledgement to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
}

impl UnsubAck {
    pub fn new(pkid: u16) -> UnsubAck {
        UnsubAck { pkid }
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Self, Error> {
        if fixed_header.remaining_len != 2 {
            return Err(Error::MalformedPacket);
        }

        bytes.advance(fixed_header.fixed_header_len);
        Ok(UnsubAck {
            pkid: take_u16(&mut bytes)?,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        buffer.put_slice(&[0xB0, 0x02]);
        buffer.put_u16(self.pkid);
        Ok(4)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_filter_subscribe_encodes_as_expected() {
        let mut subscribe = Subscribe::new("a", QoS::AtMostOnce);
        subscribe.pkid = 5;

        let mut buffer = BytesMut::new();
        subscribe.write(&mut buffer).unwrap();
        assert_eq!(&buffer[..], &[0x82, 6, 0x00, 0x05, 0x00, 0x01, b'a', 0x00]);
    }

    #[test]
    fn multi_filter_subscribe_round_trips() {
        let mut subscribe = Subscribe::new_many(vec![
            SubscribeFilter::new("metrics/+/load".to_owned(), QoS::AtLeastOnce),
            SubscribeFilter::new("alerts/#".to_owned(), QoS::ExactlyOnce),
        ]);
        subscribe.pkid = 9;

        let mut buffer = BytesMut::new();
        subscribe.write(&mut buffer).unwrap();

        let packet = Packet::read(&mut buffer, 100).unwrap();
        assert_eq!(packet, Packet::Subscribe(subscribe));
    }

    #[test]
    fn suback_failure_code_is_a_value() {
        let mut buffer = BytesMut::from(&[0x90, 4, 0x00, 0x09, 0x02, 0x80][..]);
        let packet = Packet::read(&mut buffer, 100).unwrap();

        assert_eq!(
            packet,
            Packet::SubAck(SubAck::new(
                9,
                vec![
                    SubscribeReturnCode::Success(QoS::ExactlyOnce),
                    SubscribeReturnCode::Failure,
                ],
            ))
        );
    }

    #[test]
    fn suback_without_return_codes_is_rejected() {
        let mut buffer = BytesMut::from(&[0x90, 2, 0x00, 0x09][..]);
        match Packet::read(&mut buffer, 100) {
            Err(Error::MalformedPacket) => (),
            v => panic!("Expecting malformed packet error. Found = {:?}", v),
        }
    }

    #[test]
    fn unsubscribe_round_trips() {
        let unsubscribe = Unsubscribe {
            pkid: 3,
            topics: vec!["metrics/load".to_owned(), "alerts".to_owned()],
        };

        let mut buffer = BytesMut::new();
        unsubscribe.write(&mut buffer).unwrap();

        let packet = Packet::read(&mut buffer, 100).unwrap();
        assert_eq!(packet, Packet::Unsubscribe(unsubscribe));
    }

    #[test]
    fn unsuback_round_trips() {
        let mut buffer = BytesMut::from(&[0xB0, 0x02, 0x00, 0x03][..]);
        let packet = Packet::read(&mut buffer, 100).unwrap();
        assert_eq!(packet, Packet::UnsubAck(UnsubAck::new(3)));

        let mut buffer = BytesMut::new();
        UnsubAck::new(3).write(&mut buffer).unwrap();
        assert_eq!(&buffer[..], &[0xB0, 0x02, 0x00, 0x03]);
    }
}
