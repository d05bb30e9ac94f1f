//! A resilient MQTT 3.1/3.1.1 client which keeps itself connected.
//!
//! The crate is two layered façades over a common packet codec and
//! transport. [`Client`] is a single session endpoint: it connects once,
//! correlates broker acknowledgements to the operations that spawned them
//! through completion futures, and dies on disconnect. [`Service`] owns a
//! client and maintains the always connected illusion: it reconnects with
//! backoff, restores subscriptions, queues operations issued while offline
//! and notifies the application through a [`Listener`].
//!
//! A simple publish and subscribe
//! ------------------------------
//!
//! ```no_run
//! use limpet::{Listener, Message, Options, QoS, Service};
//! use std::time::Duration;
//!
//! struct Printer;
//!
//! impl Listener for Printer {
//!     fn message(&self, message: &Message) {
//!         println!("{} = {:?}", message.topic, message.payload);
//!     }
//! }
//!
//! #[tokio::main(worker_threads = 1)]
//! async fn main() {
//!     let options = Options::builder()
//!         .client_id("limpet-demo")
//!         .keep_alive(Duration::from_secs(5))
//!         .build();
//!
//!     let service = Service::new();
//!     service.set_listener(Printer);
//!     service.start("tcp://test.mosquitto.org:1883", options).unwrap();
//!
//!     let granted = service.subscribe("hello/limpet", QoS::AtMostOnce).await;
//!     granted.wait(Duration::from_secs(5)).await.unwrap();
//!
//!     let message = Message::new("hello/limpet", QoS::AtLeastOnce, "hello");
//!     let done = service.publish(message).await;
//!     done.wait(Duration::from_secs(5)).await.unwrap();
//!
//!     service.stop().await;
//! }
//! ```
//!
//! Operations return a future which resolves with the broker's
//! acknowledgement: immediately after the write for QoS 0, on PUBACK for
//! QoS 1 and on PUBCOMP for QoS 2. Operations submitted while the service
//! is reconnecting are queued (bounded, see
//! [`Options::offline_queue_size`]) and drained in order once a
//! connection comes up, with each queued future bound to the live
//! operation's outcome.

#[macro_use]
extern crate log;

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use typed_builder::TypedBuilder;

mod backoff;
mod client;
mod counter;
mod future;
mod network;
pub mod packet;
mod queue;
mod service;
mod session;
mod store;
mod tracker;

pub use client::{Client, ClientError, ClientState};
pub use future::{ConnectFuture, Future, GenericFuture, SubscribeFuture};
pub use network::{Network, NetworkError};
pub use packet::{LastWill, Protocol, QoS, SubscribeFilter, SubscribeReturnCode};
pub use queue::QueuePolicy;
pub use service::{clear_session, Listener, Service, ServiceError, ServiceState};
pub use session::{Direction, MemorySession, Session};

/// An application level publish message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn new<S: Into<String>, P: Into<Vec<u8>>>(topic: S, qos: QoS, payload: P) -> Message {
        Message {
            topic: topic.into(),
            payload: Bytes::from(payload.into()),
            qos,
            retain: false,
        }
    }
}

impl From<packet::Publish> for Message {
    fn from(publish: packet::Publish) -> Message {
        Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

/// Options to configure the behaviour of a connection
///
/// ```
/// # use limpet::Options;
/// # use std::time::Duration;
/// let options = Options::builder()
///     .client_id("123")
///     .keep_alive(Duration::from_secs(5))
///     .build();
/// ```
#[derive(Clone, TypedBuilder)]
pub struct Options {
    /// Client identifier. Empty asks the broker to assign one, which
    /// requires a clean session
    #[builder(setter(into), default)]
    pub client_id: String,
    /// Clean (or) persistent session
    #[builder(default = true)]
    pub clean_session: bool,
    /// Keep alive time to send pingreq to broker when the connection is
    /// idle. 0 disables keepalive
    #[builder(default = Duration::from_secs(30))]
    pub keep_alive: Duration,
    /// How long to wait for CONNACK before the connection attempt fails
    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,
    /// How long a graceful disconnect waits for in-flight
    /// acknowledgements to drain
    #[builder(default = Duration::from_secs(10))]
    pub drain_timeout: Duration,
    /// Delay before the first reconnection attempt
    #[builder(default = Duration::from_secs(1))]
    pub min_reconnect_delay: Duration,
    /// Ceiling for the reconnection delay
    #[builder(default = Duration::from_secs(32))]
    pub max_reconnect_delay: Duration,
    /// Double the reconnect delay after every failed attempt instead of
    /// keeping it fixed
    #[builder(default = false)]
    pub exponential_backoff: bool,
    /// Capacity of the offline operation queue
    #[builder(default = 100)]
    pub offline_queue_size: usize,
    /// What to do with submissions once the offline queue is full
    #[builder(default = QueuePolicy::RejectNewest)]
    pub queue_policy: QueuePolicy,
    /// Username and password
    #[builder(setter(into, strip_option), default)]
    pub credentials: Option<(String, String)>,
    /// Last will that the broker publishes on unexpected disconnect
    #[builder(setter(into, strip_option), default)]
    pub last_will: Option<LastWill>,
    /// Protocol version used in CONNECT
    #[builder(default = Protocol::V311)]
    pub version: Protocol,
    /// Maximum packet size in either direction
    #[builder(default = 10 * 1024)]
    pub max_packet_size: usize,
    /// Session store for packets whose delivery is not yet complete
    #[builder(default = Arc::new(MemorySession::new()))]
    pub store: Arc<dyn Session>,
}

// Implement Debug manually because the session store doesn't
impl Debug for Options {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Options")
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .field("drain_timeout", &self.drain_timeout)
            .field("min_reconnect_delay", &self.min_reconnect_delay)
            .field("max_reconnect_delay", &self.max_reconnect_delay)
            .field("exponential_backoff", &self.exponential_backoff)
            .field("offline_queue_size", &self.offline_queue_size)
            .field("queue_policy", &self.queue_policy)
            .field("credentials", &self.credentials)
            .field("last_will", &self.last_will)
            .field("version", &self.version)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn options_defaults_match_documented_values() {
        let options = Options::builder().build();

        assert_eq!(options.client_id, "");
        assert!(options.clean_session);
        assert_eq!(options.keep_alive, Duration::from_secs(30));
        assert_eq!(options.connect_timeout, Duration::from_secs(5));
        assert_eq!(options.min_reconnect_delay, Duration::from_secs(1));
        assert_eq!(options.max_reconnect_delay, Duration::from_secs(32));
        assert_eq!(options.offline_queue_size, 100);
        assert_eq!(options.queue_policy, QueuePolicy::RejectNewest);
        assert_eq!(options.version, Protocol::V311);
    }

    #[test]
    fn message_from_publish_keeps_flags() {
        let mut publish = packet::Publish::new("a/b", QoS::AtLeastOnce, vec![1, 2]);
        publish.retain = true;

        let message = Message::from(publish);
        assert_eq!(message.topic, "a/b");
        assert_eq!(message.qos, QoS::AtLeastOnce);
        assert!(message.retain);
        assert_eq!(&message.payload[..], &[1, 2]);
    }
}
