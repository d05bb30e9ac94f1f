use super::*;
use bytes::{Buf, Bytes};

/// Connection packet initiated by the client
#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    /// Mqtt protocol version
    pub protocol: Protocol,
    /// Mqtt keep alive time
    pub keep_alive: u16,
    /// Client Id
    pub client_id: String,
    /// Clean session. Asks the broker to clear previous state
    pub clean_session: bool,
    /// Will that broker needs to publish when the client disconnects
    pub last_will: Option<LastWill>,
    /// Login credentials
    pub login: Option<Login>,
}

impl Connect {
    pub fn new<S: Into<String>>(id: S) -> Connect {
        Connect {
            protocol: Protocol::V311,
            keep_alive: 30,
            client_id: id.into(),
            clean_session: true,
            last_will: None,
            login: None,
        }
    }

    pub fn set_login<S: Into<String>>(&mut self, u: S, p: S) -> &mut Connect {
        self.login = Some(Login::new(u, p));
        self
    }

    pub fn len(&self) -> usize {
        // variable header: protocol name, level, connect flags, keep alive
        let mut len = 2 + self.protocol.name().len() + 1 + 1 + 2;

        len += 2 + self.client_id.len();
        len += self.last_will.as_ref().map_or(0, |will| will.len());
        len += self.login.as_ref().map_or(0, |login| login.len());
        len
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Connect, Error> {
        bytes.advance(fixed_header.fixed_header_len);

        let protocol_name = take_string(&mut bytes)?;
        let level = take_u8(&mut bytes)?;

        let protocol = match (protocol_name.as_str(), level) {
            ("MQIsdp", 3) => Protocol::V31,
            ("MQTT", 4) => Protocol::V311,
            ("MQIsdp", level) | ("MQTT", level) => return Err(Error::InvalidProtocolLevel(level)),
            _ => return Err(Error::InvalidProtocol),
        };

        let flags = take_u8(&mut bytes)?;
        let keep_alive = take_u16(&mut bytes)?;
        let client_id = take_string(&mut bytes)?;

        Ok(Connect {
            protocol,
            keep_alive,
            client_id,
            clean_session: flags & 0x02 != 0,
            last_will: LastWill::read(flags, &mut bytes)?,
            login: Login::read(flags, &mut bytes)?,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        // connect flags are fully known up front, no backpatching needed
        let mut flags = 0;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &self.last_will {
            flags |= will.flags();
        }
        if let Some(login) = &self.login {
            flags |= login.flags();
        }

        let len = self.len();
        buffer.put_u8(0x10);
        let count = put_remaining_length(buffer, len)?;

        put_string(buffer, self.protocol.name());
        buffer.put_u8(self.protocol.level());
        buffer.put_u8(flags);
        buffer.put_u16(self.keep_alive);
        put_string(buffer, &self.client_id);

        if let Some(will) = &self.last_will {
            will.write(buffer);
        }
        if let Some(login) = &self.login {
            login.write(buffer);
        }

        Ok(1 + count + len)
    }
}

/// LastWill that broker forwards on behalf of the client
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl LastWill {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> LastWill {
        LastWill {
            topic: topic.into(),
            message: Bytes::from(payload.into()),
            qos,
            retain,
        }
    }

    fn len(&self) -> usize {
        2 + self.topic.len() + 2 + self.message.len()
    }

    fn read(connect_flags: u8, bytes: &mut Bytes) -> Result<Option<LastWill>, Error> {
        if connect_flags & 0x04 == 0 {
            // will qos and retain bits must stay clear without a will
            if connect_flags & 0x38 != 0 {
                return Err(Error::IncorrectPacketFormat);
            }

            return Ok(None);
        }

        Ok(Some(LastWill {
            topic: take_string(bytes)?,
            message: take_bytes(bytes)?,
            qos: qos((connect_flags >> 3) & 0x03)?,
            retain: connect_flags & 0x20 != 0,
        }))
    }

    fn flags(&self) -> u8 {
        let mut flags = 0x04 | (self.qos as u8) << 3;
        if self.retain {
            flags |= 0x20;
        }

        flags
    }

    fn write(&self, buffer: &mut BytesMut) {
        put_string(buffer, &self.topic);
        put_bytes(buffer, &self.message);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Login {
    pub username: String,
    pub password: String,
}

impl Login {
    pub fn new<S: Into<String>>(u: S, p: S) -> Login {
        Login {
            username: u.into(),
            password: p.into(),
        }
    }

    fn len(&self) -> usize {
        let username = match self.username.is_empty() {
            true => 0,
            false => 2 + self.username.len(),
        };
        let password = match self.password.is_empty() {
            true => 0,
            false => 2 + self.password.len(),
        };

        username + password
    }

    fn read(connect_flags: u8, bytes: &mut Bytes) -> Result<Option<Login>, Error> {
        let has_username = connect_flags & 0x80 != 0;
        let has_password = connect_flags & 0x40 != 0;
        if !has_username && !has_password {
            return Ok(None);
        }

        let mut login = Login::new("", "");
        if has_username {
            login.username = take_string(bytes)?;
        }
        if has_password {
            login.password = take_string(bytes)?;
        }

        Ok(Some(login))
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if !self.username.is_empty() {
            flags |= 0x80;
        }
        if !self.password.is_empty() {
            flags |= 0x40;
        }

        flags
    }

    fn write(&self, buffer: &mut BytesMut) {
        if !self.username.is_empty() {
            put_string(buffer, &self.username);
        }
        if !self.password.is_empty() {
            put_string(buffer, &self.password);
        }
    }
}

/// Return code in connack
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted = 0,
    RefusedProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUserNamePassword,
    NotAuthorized,
}

/// Acknowledgement to connect packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

impl ConnAck {
    pub fn new(code: ConnectReturnCode, session_present: bool) -> ConnAck {
        ConnAck {
            code,
            session_present,
        }
    }

    pub fn len(&self) -> usize {
        // session present + code
        1 + 1
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Self, Error> {
        bytes.advance(fixed_header.fixed_header_len);

        let flags = take_u8(&mut bytes)?;
        let code = take_u8(&mut bytes)?;

        Ok(ConnAck {
            session_present: flags & 0x01 != 0,
            code: connect_return(code)?,
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        let len = self.len();
        buffer.put_u8(0x20);

        let count = put_remaining_length(buffer, len)?;
        buffer.put_u8(self.session_present as u8);
        buffer.put_u8(self.code as u8);

        Ok(1 + count + len)
    }
}

/// Connection return code type
fn connect_return(num: u8) -> Result<ConnectReturnCode, Error> {
    match num {
        0 => Ok(ConnectReturnCode::Accepted),
        1 => Ok(ConnectReturnCode::RefusedProtocolVersion),
        2 => Ok(ConnectReturnCode::IdentifierRejected),
        3 => Ok(ConnectReturnCode::ServerUnavailable),
        4 => Ok(ConnectReturnCode::BadUserNamePassword),
        5 => Ok(ConnectReturnCode::NotAuthorized),
        num => Err(Error::InvalidConnectReturnCode(num)),
    }
}
