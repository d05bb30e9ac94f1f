//! Framed packet transport and broker endpoint dialing.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use url::Url;

use crate::packet::{self, Codec, Packet};

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Errors on the wire
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Packet codec: {0}")]
    Packet(#[from] packet::Error),
    #[error("Invalid broker url: {0}")]
    Url(#[from] url::ParseError),
    #[error("Unsupported url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Broker url is missing a host")]
    MissingHost,
    #[error("Connection closed by peer")]
    ConnectionAborted,
}

/// Network transforms packets <-> frames efficiently. It takes advantage
/// of pre-allocation and buffering to achieve performance
pub struct Network {
    framed: Framed<Box<dyn AsyncReadWrite>, Codec>,
}

impl Network {
    pub fn new(socket: impl AsyncReadWrite + 'static, max_packet_size: usize) -> Network {
        let socket = Box::new(socket) as Box<dyn AsyncReadWrite>;
        let codec = Codec {
            max_incoming_size: max_packet_size,
            max_outgoing_size: max_packet_size,
        };

        Network {
            framed: Framed::new(socket, codec),
        }
    }

    /// Reads and returns a single packet from network
    pub async fn read(&mut self) -> Result<Packet, NetworkError> {
        match self.framed.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => Err(e.into()),
            None => Err(NetworkError::ConnectionAborted),
        }
    }

    /// Serializes a packet into the write buffer and flushes it
    pub async fn send(&mut self, packet: Packet) -> Result<(), NetworkError> {
        self.framed.send(packet).await?;
        Ok(())
    }

    /// Splits the connection into independently owned read and write
    /// halves. The reader task owns the read half exclusively while
    /// callers share the write half behind a lock
    pub fn split(self) -> (NetworkWriter, NetworkReader) {
        let (sink, stream) = self.framed.split();
        (NetworkWriter { sink }, NetworkReader { stream })
    }
}

/// Read half of a connection. Exclusively owned by a single reader task
pub struct NetworkReader {
    stream: SplitStream<Framed<Box<dyn AsyncReadWrite>, Codec>>,
}

impl NetworkReader {
    pub async fn read(&mut self) -> Result<Packet, NetworkError> {
        match self.stream.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => Err(e.into()),
            None => Err(NetworkError::ConnectionAborted),
        }
    }
}

/// Write half of a connection
pub struct NetworkWriter {
    sink: SplitSink<Framed<Box<dyn AsyncReadWrite>, Codec>, Packet>,
}

impl NetworkWriter {
    pub async fn send(&mut self, packet: Packet) -> Result<(), NetworkError> {
        self.sink.send(packet).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), NetworkError> {
        self.sink.close().await?;
        Ok(())
    }
}

/// Opens a connection to the broker named by `url`. `tcp://` and
/// `mqtt://` URLs connect over plain TCP (default port 1883). TLS and
/// websocket endpoints require an external transport adapter and are
/// rejected here
pub async fn dial(url: &Url, max_packet_size: usize) -> Result<Network, NetworkError> {
    match url.scheme() {
        "tcp" | "mqtt" => (),
        scheme => return Err(NetworkError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(NetworkError::MissingHost)?;
    let port = url.port().unwrap_or(1883);

    let socket = TcpStream::connect((host, port)).await?;
    Ok(Network::new(socket, max_packet_size))
}
