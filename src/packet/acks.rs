use super::*;
use bytes::{Buf, Bytes};

/// Acknowledgement to QoS1 publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub pkid: u16,
}

impl PubAck {
    pub fn new(pkid: u16) -> PubAck {
        PubAck { pkid }
    }

    pub fn read(fixed_header: FixedHeader, bytes: Bytes) -> Result<Self, Error> {
        Ok(PubAck {
            pkid: read_ack_pkid(fixed_header, bytes)?,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        write_ack(buffer, 0x40, self.pkid)
    }
}

/// First acknowledgement of a QoS2 publish on the receiver side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    pub pkid: u16,
}

impl PubRec {
    pub fn new(pkid: u16) -> PubRec {
        PubRec { pkid }
    }

    pub fn read(fixed_header: FixedHeader, bytes: Bytes) -> Result<Self, Error> {
        Ok(PubRec {
            pkid: read_ack_pkid(fixed_header, bytes)?,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        write_ack(buffer, 0x50, self.pkid)
    }
}

/// Release of a QoS2 publish by its sender. Fixed header carries the
/// reserved 0b0010 flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub pkid: u16,
}

impl PubRel {
    pub fn new(pkid: u16) -> PubRel {
        PubRel { pkid }
    }

    pub fn read(fixed_header: FixedHeader, bytes: Bytes) -> Result<Self, Error> {
        Ok(PubRel {
            pkid: read_ack_pkid(fixed_header, bytes)?,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        write_ack(buffer, 0x62, self.pkid)
    }
}

/// Final acknowledgement of a QoS2 publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubComp {
    pub pkid: u16,
}

impl PubComp {
    pub fn new(pkid: u16) -> PubComp {
        PubComp { pkid }
    }

    pub fn read(fixed_header: FixedHeader, bytes: Bytes) -> Result<Self, Error> {
        Ok(PubComp {
            pkid: read_ack_pkid(fixed_header, bytes)?,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        write_ack(buffer, 0x70, self.pkid)
    }
}

fn read_ack_pkid(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<u16, Error> {
    if fixed_header.remaining_len != 2 {
        return Err(Error::MalformedPacket);
    }

    bytes.advance(fixed_header.fixed_header_len);
    take_u16(&mut bytes)
}

fn write_ack(buffer: &mut BytesMut, byte1: u8, pkid: u16) -> Result<usize, Error> {
    buffer.put_u8(byte1);
    buffer.put_u8(0x02);
    buffer.put_u16(pkid);
    Ok(4)
}
