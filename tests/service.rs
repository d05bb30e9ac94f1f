use std::time::Duration;

use matches::assert_matches;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::{task, time};


use broker::Broker;
use limpet::packet::{Packet, QoS, SubscribeReturnCode};
use limpet::{clear_session, ClientError, Listener, Message, Options, Service, ServiceState};

#[derive(Debug)]
enum Event {
    Online(bool),
    Offline,
    Message(Message),
    Error(ClientError),
}

struct Recorder {
    events: UnboundedSender<Event>,
}

impl Listener for Recorder {
    fn online(&self, resumed: bool) {
        let _ = self.events.send(Event::Online(resumed));
    }

    fn offline(&self) {
        let _ = self.events.send(Event::Offline);
    }

    fn message(&self, message: &Message) {
        let _ = self.events.send(Event::Message(message.clone()));
    }

    fn error(&self, error: &ClientError) {
        let _ = self.events.send(Event::Error(error.clone()));
    }
}

fn options() -> Options {
    Options::builder()
        .client_id("test")
        .min_reconnect_delay(Duration::from_millis(50))
        .max_reconnect_delay(Duration::from_millis(200))
        .build()
}

#[tokio::test]
async fn service_publish_subscribe_roundtrip() {
    let broker = task::spawn(Broker::new(1971, 0));
    time::sleep(Duration::from_millis(10)).await;

    let (tx, mut rx) = unbounded_channel();
    let service = Service::new();
    service.set_listener(Recorder { events: tx });
    service.start("tcp://127.0.0.1:1971", options()).unwrap();

    let mut broker = broker.await.unwrap();
    assert_matches!(rx.recv().await.unwrap(), Event::Online(false));

    let granted = service.subscribe("test", QoS::AtMostOnce).await;
    let subscribe = match broker.read_packet().await {
        Packet::Subscribe(subscribe) => subscribe,
        packet => panic!("Expecting a subscribe. Received = {:?}", packet),
    };
    broker
        .suback(
            subscribe.pkid,
            vec![SubscribeReturnCode::Success(QoS::AtMostOnce)],
        )
        .await;
    granted.wait(Duration::from_secs(1)).await.unwrap();

    let done = service
        .publish(Message::new("test", QoS::AtMostOnce, "test"))
        .await;
    done.wait(Duration::from_secs(1)).await.unwrap();

    // echo the publish back and expect the message callback
    let publish = broker.read_publish().await;
    assert_eq!(publish.topic, "test");
    broker.send(Packet::Publish(publish)).await;

    match rx.recv().await.unwrap() {
        Event::Message(message) => {
            assert_eq!(message.topic, "test");
            assert_eq!(&message.payload[..], b"test");
        }
        event => panic!("Expecting a message event. Received = {:?}", event),
    }

    service.stop().await;
    assert_matches!(broker.read_packet().await, Packet::Disconnect);
    assert_eq!(service.state(), ServiceState::Stopped);
    assert_matches!(rx.recv().await.unwrap(), Event::Offline);
}

#[tokio::test]
async fn clear_session_performs_clean_connect_disconnect() {
    let broker = task::spawn(Broker::new(1972, 0));
    time::sleep(Duration::from_millis(10)).await;

    clear_session("tcp://127.0.0.1:1972", "test").await.unwrap();

    let mut broker = broker.await.unwrap();
    assert_eq!(broker.connect.client_id, "test");
    assert!(broker.connect.clean_session);
    assert_matches!(broker.read_packet().await, Packet::Disconnect);
}

#[tokio::test]
async fn offline_publish_drains_after_reconnect() {
    // nothing is listening yet, the first attempts fail
    let service = Service::new();
    service.start("tcp://127.0.0.1:1973", options()).unwrap();

    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.state(), ServiceState::Reconnecting);

    let future = service
        .publish(Message::new("test", QoS::AtLeastOnce, "payload"))
        .await;
    assert!(!future.is_settled());

    // bring the broker up, the service reconnects and drains the queue
    let mut broker = Broker::new(1973, 0).await;
    let publish = broker.read_publish().await;
    assert_eq!(publish.topic, "test");
    broker.ack(publish.pkid).await;

    future.wait(Duration::from_secs(2)).await.unwrap();
    service.stop().await;
}

#[tokio::test]
async fn full_offline_queue_rejects_new_publishes() {
    let service = Service::new();
    let options = Options::builder()
        .client_id("test")
        .offline_queue_size(1)
        .min_reconnect_delay(Duration::from_secs(10))
        .max_reconnect_delay(Duration::from_secs(10))
        .build();

    service.start("tcp://127.0.0.1:1974", options).unwrap();
    time::sleep(Duration::from_millis(50)).await;

    let first = service
        .publish(Message::new("test", QoS::AtLeastOnce, "one"))
        .await;
    let second = service
        .publish(Message::new("test", QoS::AtLeastOnce, "two"))
        .await;

    assert_matches!(
        second.wait(Duration::from_millis(10)).await,
        Err(ClientError::QueueFull)
    );
    assert!(!first.is_settled());

    // stop cancels whatever is still queued
    service.stop().await;
    assert_matches!(
        first.wait(Duration::from_millis(10)).await,
        Err(ClientError::NotConnected)
    );
}

#[tokio::test]
async fn service_resubscribes_after_connection_loss() {
    let listener = TcpListener::bind(("127.0.0.1", 1975)).await.unwrap();

    let (tx, mut rx) = unbounded_channel();
    let service = Service::new();
    service.set_listener(Recorder { events: tx });
    service.start("tcp://127.0.0.1:1975", options()).unwrap();

    let mut broker = Broker::accept(&listener, 0).await;
    assert_matches!(rx.recv().await.unwrap(), Event::Online(false));

    let granted = service.subscribe("test", QoS::AtLeastOnce).await;
    let subscribe = match broker.read_packet().await {
        Packet::Subscribe(subscribe) => subscribe,
        packet => panic!("Expecting a subscribe. Received = {:?}", packet),
    };
    broker
        .suback(
            subscribe.pkid,
            vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)],
        )
        .await;
    granted.wait(Duration::from_secs(1)).await.unwrap();

    // kill the connection, the service goes offline and reconnects
    drop(broker);
    assert_matches!(rx.recv().await.unwrap(), Event::Error(_));
    assert_matches!(rx.recv().await.unwrap(), Event::Offline);

    // the fresh session triggers a resubscription before anything else
    let mut broker = Broker::accept(&listener, 0).await;
    let subscribe = match broker.read_packet().await {
        Packet::Subscribe(subscribe) => subscribe,
        packet => panic!("Expecting a subscribe. Received = {:?}", packet),
    };
    assert_eq!(subscribe.filters[0].path, "test");
    broker
        .suback(
            subscribe.pkid,
            vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)],
        )
        .await;

    assert_matches!(rx.recv().await.unwrap(), Event::Online(false));
    service.stop().await;
}

#[tokio::test]
async fn terminal_refusal_stops_reconnecting() {
    struct NoRetry {
        events: UnboundedSender<Event>,
    }

    impl Listener for NoRetry {
        fn error(&self, error: &ClientError) {
            let _ = self.events.send(Event::Error(error.clone()));
        }

        fn should_reconnect(&self, error: &ClientError) -> bool {
            !matches!(error, ClientError::Refused(_))
        }
    }

    let broker = task::spawn(Broker::new(1976, 1));
    time::sleep(Duration::from_millis(10)).await;

    let (tx, mut rx) = unbounded_channel();
    let service = Service::new();
    service.set_listener(NoRetry { events: tx });
    service.start("tcp://127.0.0.1:1976", options()).unwrap();

    assert_matches!(
        rx.recv().await.unwrap(),
        Event::Error(ClientError::Refused(_))
    );

    let _broker = broker.await.unwrap();
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.state(), ServiceState::Stopped);
}
