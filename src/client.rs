//! Single session MQTT client.
//!
//! A `Client` connects once and dies on disconnect. Operations return
//! completion futures correlated to broker acknowledgements by packet id;
//! reconnection and offline buffering live a layer up in
//! [`Service`](crate::Service).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::time;
use url::Url;

use crate::counter::Counter;
use crate::future::{ConnectFuture, GenericFuture, SubscribeFuture};
use crate::network::{self, NetworkError, NetworkReader};
use crate::packet::{
    self, valid_filter, valid_topic, ConnAck, Connect, ConnectReturnCode, Login, Packet,
    PacketType, PubAck, PubComp, PubRec, PubRel, Publish, QoS, Subscribe, SubscribeFilter,
    Unsubscribe,
};
use crate::session::{Direction, Session};
use crate::store::{FutureStore, Pending, CONNECT_ID};
use crate::tracker::Tracker;
use crate::{Message, Options};

/// Connection lifecycle of a client. Transitions are linear forward; any
/// unexpected event forces `Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Initial,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Client errors. Cloneable so a single reader side failure can fan out
/// to every pending future
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("Client is not connected")]
    NotConnected,
    #[error("Client is already connecting")]
    AlreadyConnecting,
    #[error("Operation future was canceled")]
    FutureCanceled,
    #[error("Timeout exceeded")]
    TimeoutExceeded,
    #[error("Offline queue is full")]
    QueueFull,
    #[error("Connection aborted by user")]
    AbortedByUser,
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
    #[error("A subscribe must contain at least one filter")]
    EmptySubscription,
    #[error("Connection refused, return code: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("Received unsolicited ack pkid: {0}")]
    Unsolicited(u16),
    #[error("Received unexpected packet: {0:?}")]
    UnexpectedPacket(PacketType),
    #[error("Packet codec: {0}")]
    Protocol(#[from] packet::Error),
    #[error("Network: {0}")]
    Network(Arc<NetworkError>),
}

impl From<NetworkError> for ClientError {
    fn from(e: NetworkError) -> Self {
        ClientError::Network(Arc::new(e))
    }
}

type Callback = Arc<dyn Fn(Message) + Send + Sync>;

struct ClientInner {
    /// Connection state. The watch channel mirrors it for `closed` waiters
    state: Mutex<ClientState>,
    state_tx: watch::Sender<ClientState>,
    state_rx: watch::Receiver<ClientState>,
    /// Write half of the connection. Writes from callers, the reader task
    /// and the keepalive task are serialized here
    writer: AsyncMutex<Option<network::NetworkWriter>>,
    /// Pending operations keyed by packet id
    store: FutureStore,
    /// Packet id allocation
    counter: Counter,
    /// Session store of the current connection
    session: Mutex<Option<Arc<dyn Session>>>,
    /// Keepalive bookkeeping
    tracker: Mutex<Tracker>,
    /// Incoming message callback. Runs on the reader task, must not call
    /// blocking client methods
    callback: Mutex<Option<Callback>>,
    /// Why the connection died
    error: Mutex<Option<ClientError>>,
    /// Signals the reader and keepalive tasks to wind down
    shutdown: Notify,
}

/// A single session MQTT endpoint
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Client {
        let (state_tx, state_rx) = watch::channel(ClientState::Initial);

        Client {
            inner: Arc::new(ClientInner {
                state: Mutex::new(ClientState::Initial),
                state_tx,
                state_rx,
                writer: AsyncMutex::new(None),
                store: FutureStore::new(),
                counter: Counter::new(),
                session: Mutex::new(None),
                tracker: Mutex::new(Tracker::new()),
                callback: Mutex::new(None),
                error: Mutex::new(None),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Sets the callback invoked for every incoming publish. Runs on the
    /// reader task; it must not block on client methods
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        *self.inner.callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.lock().unwrap()
    }

    /// The error which killed the connection, if any
    pub fn last_error(&self) -> Option<ClientError> {
        self.inner.error.lock().unwrap().clone()
    }

    /// Resolves once the client reaches `Disconnected`
    pub async fn closed(&self) {
        let mut state_rx = self.inner.state_rx.clone();
        loop {
            if *state_rx.borrow() == ClientState::Disconnected {
                return;
            }

            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Dials the broker, sends CONNECT and spawns the reader task. The
    /// returned future resolves with the CONNACK outcome. The connection
    /// is torn down if no CONNACK arrives within the connect timeout
    pub async fn connect(&self, url: &str, options: Options) -> Result<ConnectFuture, ClientError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                ClientState::Initial => *state = ClientState::Connecting,
                ClientState::Connecting | ClientState::Connected => {
                    return Err(ClientError::AlreadyConnecting)
                }
                _ => return Err(ClientError::NotConnected),
            }
        }
        let _ = self.inner.state_tx.send(ClientState::Connecting);

        match self.open(url, options).await {
            Ok(future) => Ok(future),
            Err(e) => {
                self.die(e.clone());
                Err(e)
            }
        }
    }

    async fn open(&self, url: &str, options: Options) -> Result<ConnectFuture, ClientError> {
        let url = Url::parse(url).map_err(NetworkError::from)?;
        let mut network = network::dial(&url, options.max_packet_size).await?;

        // a clean session discards client side state along with the
        // broker side one
        if options.clean_session {
            options.store.reset();
        }
        *self.inner.session.lock().unwrap() = Some(options.store.clone());

        let mut connect = Connect::new(options.client_id.clone());
        connect.protocol = options.version;
        connect.keep_alive = options.keep_alive.as_secs() as u16;
        connect.clean_session = options.clean_session;
        connect.last_will = options.last_will.clone();
        if let Some((username, password)) = &options.credentials {
            connect.login = Some(Login::new(username.clone(), password.clone()));
        }

        debug!(
            "Connect. Client id = {:?}, clean session = {}",
            connect.client_id, connect.clean_session
        );
        network.send(Packet::Connect(connect)).await?;

        let (writer, reader) = network.split();
        *self.inner.writer.lock().await = Some(writer);

        let future = ConnectFuture::new();
        self.inner
            .store
            .put(CONNECT_ID, Pending::Connect(future.clone()));

        let client = self.clone();
        let clean_session = options.clean_session;
        let keep_alive = options.keep_alive;
        tokio::spawn(async move { client.read_loop(reader, clean_session, keep_alive).await });

        // first packet must be a connack within the connect timeout
        let client = self.clone();
        let connack = future.clone();
        let connect_timeout = options.connect_timeout;
        tokio::spawn(async move {
            if let Err(ClientError::TimeoutExceeded) = connack.wait(connect_timeout).await {
                // the connect future reports the missing connack itself,
                // before teardown cancels whatever else is pending
                connack.fail(ClientError::NotConnected);
                client.die(ClientError::NotConnected);
            }
        });

        Ok(future)
    }

    /// Publishes a message. QoS 0 futures complete on write, QoS 1 on
    /// PUBACK and QoS 2 on PUBCOMP
    pub async fn publish(&self, message: Message) -> Result<GenericFuture, ClientError> {
        self.ensure_connected()?;

        if !valid_topic(&message.topic) {
            return Err(ClientError::InvalidTopic(message.topic));
        }

        debug!(
            "Publish. Topic = {}, QoS = {:?}, Payload Size = {:?}",
            message.topic,
            message.qos,
            message.payload.len()
        );

        let future = GenericFuture::new();
        let mut publish = Publish::from_bytes(message.topic, message.qos, message.payload);
        publish.retain = message.retain;

        match publish.qos {
            QoS::AtMostOnce => {
                self.send(Packet::Publish(publish)).await?;
                future.complete(());
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                let pkid = self.next_pkid();
                publish.pkid = pkid;
                let packet = Packet::Publish(publish);

                self.session()?.save(Direction::Outgoing, &packet)?;
                self.inner.store.put(pkid, Pending::Generic(future.clone()));
                self.send(packet).await?;
            }
        }

        Ok(future)
    }

    /// Subscribes to a set of topic filters. The future carries the
    /// granted QoS codes from SUBACK; a per topic failure surfaces as
    /// [`SubscribeReturnCode::Failure`](crate::packet::SubscribeReturnCode)
    /// in the result, not as an error
    pub async fn subscribe<T>(&self, filters: T) -> Result<SubscribeFuture, ClientError>
    where
        T: IntoIterator<Item = SubscribeFilter>,
    {
        self.ensure_connected()?;

        let mut subscribe = Subscribe::new_many(filters);
        if subscribe.filters.is_empty() {
            return Err(ClientError::EmptySubscription);
        }

        for filter in &subscribe.filters {
            if !valid_filter(&filter.path) {
                return Err(ClientError::InvalidTopic(filter.path.clone()));
            }
        }

        let pkid = self.next_pkid();
        subscribe.pkid = pkid;
        debug!(
            "Subscribe. Topics = {:?}, Pkid = {:?}",
            subscribe.filters, pkid
        );

        let future = SubscribeFuture::new();
        self.inner
            .store
            .put(pkid, Pending::Subscribe(future.clone()));
        self.send(Packet::Subscribe(subscribe)).await?;

        Ok(future)
    }

    /// Unsubscribes from a set of topics. The future completes on UNSUBACK
    pub async fn unsubscribe<T>(&self, topics: T) -> Result<GenericFuture, ClientError>
    where
        T: IntoIterator<Item = String>,
    {
        self.ensure_connected()?;

        let mut unsubscribe = Unsubscribe {
            pkid: 0,
            topics: topics.into_iter().collect(),
        };
        if unsubscribe.topics.is_empty() {
            return Err(ClientError::EmptySubscription);
        }

        let pkid = self.next_pkid();
        unsubscribe.pkid = pkid;
        debug!(
            "Unsubscribe. Topics = {:?}, Pkid = {:?}",
            unsubscribe.topics, pkid
        );

        let future = GenericFuture::new();
        self.inner.store.put(pkid, Pending::Generic(future.clone()));
        self.send(Packet::Unsubscribe(unsubscribe)).await?;

        Ok(future)
    }

    /// Waits up to `timeout` for in-flight acknowledgements to drain,
    /// sends DISCONNECT and closes the connection. Futures still pending
    /// past the deadline fail with [`ClientError::AbortedByUser`]
    pub async fn disconnect(&self, timeout: Duration) -> Result<(), ClientError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != ClientState::Connected {
                return Err(ClientError::NotConnected);
            }
            *state = ClientState::Disconnecting;
        }
        let _ = self.inner.state_tx.send(ClientState::Disconnecting);

        let _ = self.inner.store.await_empty(timeout).await;

        debug!("Disconnect");
        {
            let mut writer = self.inner.writer.lock().await;
            if let Some(writer) = writer.as_mut() {
                let _ = writer.send(Packet::Disconnect).await;
                let _ = writer.close().await;
            }
            *writer = None;
        }

        self.inner.store.fail_all(ClientError::AbortedByUser);

        *self.inner.state.lock().unwrap() = ClientState::Disconnected;
        let _ = self.inner.state_tx.send(ClientState::Disconnected);
        self.inner.shutdown.notify_waiters();

        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        match *self.inner.state.lock().unwrap() {
            ClientState::Connected => Ok(()),
            _ => Err(ClientError::NotConnected),
        }
    }

    fn session(&self) -> Result<Arc<dyn Session>, ClientError> {
        self.inner
            .session
            .lock()
            .unwrap()
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    /// Allocates the next free packet id, skipping 0 and ids still
    /// resident in the future store
    fn next_pkid(&self) -> u16 {
        loop {
            let pkid = self.inner.counter.next();
            if pkid != 0 && !self.inner.store.contains(pkid) {
                return pkid;
            }
        }
    }

    async fn send(&self, packet: Packet) -> Result<(), ClientError> {
        let mut writer = self.inner.writer.lock().await;
        let writer = writer.as_mut().ok_or(ClientError::NotConnected)?;

        match writer.send(packet).await {
            Ok(()) => {
                self.inner.tracker.lock().unwrap().packet_sent();
                Ok(())
            }
            Err(e) => {
                let error = ClientError::from(e);
                self.die(error.clone());
                Err(error)
            }
        }
    }

    /// Tears the connection down. The error fans out to every pending
    /// future and the reader and keepalive tasks are signalled to exit
    fn die(&self, error: ClientError) {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                ClientState::Disconnecting | ClientState::Disconnected => return,
                _ => *state = ClientState::Disconnected,
            }
        }

        error!("Connection lost: {}", error);
        *self.inner.error.lock().unwrap() = Some(error);

        // waiters on abandoned operations observe the cancellation, the
        // connection error itself is kept in `last_error`
        self.inner.store.clear(true);
        self.inner.shutdown.notify_waiters();
        let _ = self.inner.state_tx.send(ClientState::Disconnected);

        // drop the write half so the socket closes
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut writer = inner.writer.lock().await;
            if let Some(writer) = writer.as_mut() {
                let _ = writer.close().await;
            }
            *writer = None;
        });
    }

    async fn read_loop(self, mut reader: NetworkReader, clean_session: bool, keep_alive: Duration) {
        let mut connected = false;

        loop {
            // a teardown from another task can fire between two awaits,
            // notifications only reach a registered waiter
            if self.state() == ClientState::Disconnected {
                break;
            }

            tokio::select! {
                _ = self.inner.shutdown.notified() => break,
                packet = reader.read() => {
                    let packet = match packet {
                        Ok(packet) => packet,
                        Err(e) => {
                            self.die(e.into());
                            break;
                        }
                    };

                    self.inner.tracker.lock().unwrap().packet_received();

                    let result = if !connected {
                        match packet {
                            Packet::ConnAck(connack) => {
                                connected = true;
                                self.handle_connack(connack, clean_session, keep_alive).await
                            }
                            packet => Err(ClientError::UnexpectedPacket(packet.packet_type())),
                        }
                    } else {
                        self.handle_packet(packet).await
                    };

                    if let Err(e) = result {
                        self.die(e);
                        break;
                    }
                }
            }
        }
    }

    async fn handle_connack(
        &self,
        connack: ConnAck,
        clean_session: bool,
        keep_alive: Duration,
    ) -> Result<(), ClientError> {
        let pending = match self.inner.store.del(CONNECT_ID) {
            Some(Pending::Connect(future)) => Some(future),
            _ => None,
        };

        if connack.code != ConnectReturnCode::Accepted {
            let error = ClientError::Refused(connack.code);
            if let Some(future) = pending {
                future.fail(error.clone());
            }
            return Err(error);
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != ClientState::Connecting {
                return Err(ClientError::UnexpectedPacket(PacketType::ConnAck));
            }
            *state = ClientState::Connected;
        }
        let _ = self.inner.state_tx.send(ClientState::Connected);
        info!("Connected. Session present = {}", connack.session_present);

        if keep_alive > Duration::ZERO {
            let client = self.clone();
            tokio::spawn(async move { client.keepalive_loop(keep_alive).await });
        }

        // resumed sessions republish whatever the broker hasn't acked yet
        if connack.session_present && !clean_session {
            if let Err(e) = self.replay().await {
                if let Some(future) = pending {
                    future.fail(e.clone());
                }
                return Err(e);
            }
        }

        if let Some(future) = pending {
            future.complete(connack);
        }

        Ok(())
    }

    /// Retransmits unacknowledged outgoing packets from the session, in
    /// packet id order. Stored publishes go out with the dup flag set,
    /// stored pubrels as they are
    async fn replay(&self) -> Result<(), ClientError> {
        let session = self.session()?;

        for packet in session.all(Direction::Outgoing)? {
            let packet = match packet {
                Packet::Publish(mut publish) => {
                    publish.dup = true;
                    Packet::Publish(publish)
                }
                packet => packet,
            };

            let pkid = packet.packet_id();
            debug!("Replay. Pkid = {:?}", pkid);
            self.inner
                .store
                .put(pkid, Pending::Generic(GenericFuture::new()));
            self.send(packet).await?;
        }

        Ok(())
    }

    async fn handle_packet(&self, packet: Packet) -> Result<(), ClientError> {
        match packet {
            Packet::Publish(publish) => self.handle_incoming_publish(publish).await,
            Packet::PubAck(puback) => self.handle_incoming_puback(puback),
            Packet::PubRec(pubrec) => self.handle_incoming_pubrec(pubrec).await,
            Packet::PubRel(pubrel) => self.handle_incoming_pubrel(pubrel).await,
            Packet::PubComp(pubcomp) => self.handle_incoming_pubcomp(pubcomp),
            Packet::SubAck(suback) => self.handle_incoming_suback(suback),
            Packet::UnsubAck(unsuback) => self.handle_incoming_unsuback(unsuback),
            Packet::PingResp => {
                self.inner.tracker.lock().unwrap().pong_received();
                Ok(())
            }
            packet => {
                error!("Invalid incoming packet = {:?}", packet);
                Err(ClientError::UnexpectedPacket(packet.packet_type()))
            }
        }
    }

    async fn handle_incoming_publish(&self, publish: Publish) -> Result<(), ClientError> {
        match publish.qos {
            QoS::AtMostOnce => {
                self.deliver(publish);
                Ok(())
            }
            QoS::AtLeastOnce => {
                let pkid = publish.pkid;
                let session = self.session()?;
                session.save(Direction::Incoming, &Packet::Publish(publish.clone()))?;

                // deliver before acknowledging for at least once semantics
                self.deliver(publish);
                self.send(Packet::PubAck(PubAck::new(pkid))).await?;
                session.delete(Direction::Incoming, pkid);
                Ok(())
            }
            QoS::ExactlyOnce => {
                let pkid = publish.pkid;
                self.session()?
                    .save(Direction::Incoming, &Packet::Publish(publish))?;
                self.send(Packet::PubRec(PubRec::new(pkid))).await
            }
        }
    }

    /// Delivery happens on the release, deduplicated by the stored
    /// incoming entry. Duplicate releases only get the comp
    async fn handle_incoming_pubrel(&self, pubrel: PubRel) -> Result<(), ClientError> {
        let session = self.session()?;
        if let Some(Packet::Publish(publish)) = session.lookup(Direction::Incoming, pubrel.pkid)? {
            self.deliver(publish);
        }

        self.send(Packet::PubComp(PubComp::new(pubrel.pkid))).await?;
        session.delete(Direction::Incoming, pubrel.pkid);
        Ok(())
    }

    fn handle_incoming_puback(&self, puback: PubAck) -> Result<(), ClientError> {
        match self.inner.store.del(puback.pkid) {
            Some(Pending::Generic(future)) => {
                self.session()?.delete(Direction::Outgoing, puback.pkid);
                future.complete(());
                Ok(())
            }
            _ => {
                error!("Unsolicited puback packet: {:?}", puback.pkid);
                Err(ClientError::Unsolicited(puback.pkid))
            }
        }
    }

    async fn handle_incoming_pubrec(&self, pubrec: PubRec) -> Result<(), ClientError> {
        if !matches!(self.inner.store.get(pubrec.pkid), Some(Pending::Generic(_))) {
            error!("Unsolicited pubrec packet: {:?}", pubrec.pkid);
            return Err(ClientError::Unsolicited(pubrec.pkid));
        }

        // the publish made it over, persist the release in its place. The
        // future completes on pubcomp, not here
        let pubrel = Packet::PubRel(PubRel::new(pubrec.pkid));
        self.session()?.save(Direction::Outgoing, &pubrel)?;
        self.send(pubrel).await
    }

    fn handle_incoming_pubcomp(&self, pubcomp: PubComp) -> Result<(), ClientError> {
        match self.inner.store.del(pubcomp.pkid) {
            Some(Pending::Generic(future)) => {
                self.session()?.delete(Direction::Outgoing, pubcomp.pkid);
                future.complete(());
                Ok(())
            }
            _ => {
                error!("Unsolicited pubcomp packet: {:?}", pubcomp.pkid);
                Err(ClientError::Unsolicited(pubcomp.pkid))
            }
        }
    }

    fn handle_incoming_suback(&self, suback: packet::SubAck) -> Result<(), ClientError> {
        match self.inner.store.del(suback.pkid) {
            Some(Pending::Subscribe(future)) => {
                future.complete(suback.return_codes);
                Ok(())
            }
            _ => {
                error!("Unsolicited suback packet: {:?}", suback.pkid);
                Err(ClientError::Unsolicited(suback.pkid))
            }
        }
    }

    fn handle_incoming_unsuback(&self, unsuback: packet::UnsubAck) -> Result<(), ClientError> {
        match self.inner.store.del(unsuback.pkid) {
            Some(Pending::Generic(future)) => {
                future.complete(());
                Ok(())
            }
            _ => {
                error!("Unsolicited unsuback packet: {:?}", unsuback.pkid);
                Err(ClientError::Unsolicited(unsuback.pkid))
            }
        }
    }

    fn deliver(&self, publish: Publish) {
        let callback = self.inner.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(Message::from(publish));
        }
    }

    async fn keepalive_loop(self, keep_alive: Duration) {
        let mut interval = time::interval(keep_alive / 2);
        interval.tick().await; // first tick completes immediately

        loop {
            if self.state() == ClientState::Disconnected {
                break;
            }

            tokio::select! {
                _ = self.inner.shutdown.notified() => break,
                _ = interval.tick() => {
                    let (ping, dead, silence) = {
                        let tracker = self.inner.tracker.lock().unwrap();
                        (
                            tracker.should_ping(keep_alive),
                            tracker.dead(keep_alive),
                            tracker.silence(),
                        )
                    };

                    if dead {
                        warn!("No pingresp within {:?}, assuming dead peer", keep_alive);
                        self.die(ClientError::TimeoutExceeded);
                        break;
                    }

                    if ping {
                        self.inner.tracker.lock().unwrap().ping_sent();
                        debug!(
                            "Pingreq,
                            last incoming packet before {} millisecs,
                            last outgoing request before {} millisecs",
                            silence.0.as_millis(),
                            silence.1.as_millis()
                        );
                        if self.send(Packet::PingReq).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}
