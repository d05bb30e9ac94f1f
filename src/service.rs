//! Auto reconnecting supervisor over [`Client`].
//!
//! A `Service` keeps one logical MQTT identity connected across client
//! incarnations: it reconnects with backoff, restores subscriptions when
//! the broker lost the session, queues operations issued while offline and
//! notifies the application of transitions through a [`Listener`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use flume::{Receiver, Sender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use url::Url;

use crate::backoff::Backoff;
use crate::client::{Client, ClientError};
use crate::future::{Future, GenericFuture, SubscribeFuture};
use crate::packet::{QoS, SubscribeFilter};
use crate::queue::{OfflineQueue, QueuedOp};
use crate::{Message, Options};

/// Lifecycle of a service. `Online` means the owned client is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Online,
    Reconnecting,
    Stopping,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service is already started")]
    AlreadyStarted,
    #[error("Invalid broker url: {0}")]
    Url(#[from] url::ParseError),
}

/// Application notification surface. Invocations are serialized per
/// service; implementations must not block for long since they share a
/// single dispatch task
pub trait Listener: Send + Sync + 'static {
    /// The service connected. `resumed` reflects the session present flag
    /// from CONNACK
    fn online(&self, _resumed: bool) {}

    /// The service lost its connection or was stopped
    fn offline(&self) {}

    /// An incoming publish
    fn message(&self, _message: &Message) {}

    /// A connection level error. Per operation errors surface through
    /// their futures instead
    fn error(&self, _error: &ClientError) {}

    /// Whether the service should keep reconnecting after `error`. The
    /// default retries everything; deployments typically make
    /// authentication refusals terminal here
    fn should_reconnect(&self, _error: &ClientError) -> bool {
        true
    }
}

enum ServiceEvent {
    Online(bool),
    Offline,
    Message(Message),
    Error(ClientError),
}

struct ServiceInner {
    state: Mutex<ServiceState>,
    listener: Mutex<Option<Arc<dyn Listener>>>,
    /// Current client incarnation while online
    client: Mutex<Option<Client>>,
    /// Operations issued while there is no usable connection
    queue: Mutex<Option<Arc<OfflineQueue>>>,
    /// Subscriptions to restore when the broker lost the session
    subscriptions: Mutex<Vec<SubscribeFilter>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    events: Mutex<Option<Sender<ServiceEvent>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// A self healing MQTT endpoint
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

impl Service {
    pub fn new() -> Service {
        Service {
            inner: Arc::new(ServiceInner {
                state: Mutex::new(ServiceState::Stopped),
                listener: Mutex::new(None),
                client: Mutex::new(None),
                queue: Mutex::new(None),
                subscriptions: Mutex::new(Vec::new()),
                stop_tx: Mutex::new(None),
                events: Mutex::new(None),
                supervisor: Mutex::new(None),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Installs the application listener. Must be called before `start`
    pub fn set_listener<L: Listener>(&self, listener: L) {
        *self.inner.listener.lock().unwrap() = Some(Arc::new(listener));
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.lock().unwrap()
    }

    /// Starts supervising a connection to `url`. Must be called from
    /// within a tokio runtime
    pub fn start(&self, url: &str, options: Options) -> Result<(), ServiceError> {
        let _ = Url::parse(url)?;

        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != ServiceState::Stopped {
                return Err(ServiceError::AlreadyStarted);
            }
            *state = ServiceState::Starting;
        }

        let queue = Arc::new(OfflineQueue::new(
            options.offline_queue_size,
            options.queue_policy,
        ));
        *self.inner.queue.lock().unwrap() = Some(queue.clone());

        let (event_tx, event_rx) = flume::unbounded();
        *self.inner.events.lock().unwrap() = Some(event_tx.clone());

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.inner.stop_tx.lock().unwrap() = Some(stop_tx);

        let listener = self.inner.listener.lock().unwrap().clone();
        let dispatcher = tokio::spawn(dispatch(listener, event_rx));
        *self.inner.dispatcher.lock().unwrap() = Some(dispatcher);

        let service = self.clone();
        let url = url.to_owned();
        let supervisor = tokio::spawn(async move {
            service.supervise(url, options, queue, event_tx, stop_rx).await;
        });
        *self.inner.supervisor.lock().unwrap() = Some(supervisor);

        Ok(())
    }

    /// Stops the service. If connected, in-flight acknowledgements are
    /// drained before DISCONNECT goes out; everything still queued is
    /// canceled with [`ClientError::NotConnected`]
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                ServiceState::Stopped | ServiceState::Stopping => return,
                _ => *state = ServiceState::Stopping,
            }
        }

        if let Some(stop_tx) = self.inner.stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(true);
        }

        let supervisor = self.inner.supervisor.lock().unwrap().take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }

        if let Some(queue) = self.inner.queue.lock().unwrap().take() {
            queue.fail_all(ClientError::NotConnected);
        }

        // final offline notification, then close the event channel so the
        // dispatcher can drain and exit
        let events = self.inner.events.lock().unwrap().take();
        if let Some(events) = events {
            let _ = events.send(ServiceEvent::Offline);
        }

        let dispatcher = self.inner.dispatcher.lock().unwrap().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }

        *self.inner.state.lock().unwrap() = ServiceState::Stopped;
        info!("Stopped");
    }

    /// Publishes a message, or queues it while offline. QoS 0 messages
    /// are queued too so submission order is preserved, even though they
    /// carry no delivery guarantee
    pub async fn publish(&self, message: Message) -> GenericFuture {
        if let Some(client) = self.online_client() {
            match client.publish(message.clone()).await {
                Ok(future) => return future,
                // raced a disconnect, fall through to the queue
                Err(ClientError::NotConnected) => (),
                Err(e) => return GenericFuture::failed(e),
            }
        }

        let future = GenericFuture::new();
        self.enqueue(QueuedOp::Publish(message, future.clone()));
        future
    }

    /// Subscribes to a topic, or queues the subscription while offline.
    /// The filter is remembered and re-issued whenever a reconnect comes
    /// up without a resumed session
    pub async fn subscribe<S: Into<String>>(&self, topic: S, qos: QoS) -> SubscribeFuture {
        let topic = topic.into();

        {
            let mut subscriptions = self.inner.subscriptions.lock().unwrap();
            subscriptions.retain(|f| f.path != topic);
            subscriptions.push(SubscribeFilter::new(topic.clone(), qos));
        }

        if let Some(client) = self.online_client() {
            match client
                .subscribe(vec![SubscribeFilter::new(topic.clone(), qos)])
                .await
            {
                Ok(future) => return future,
                Err(ClientError::NotConnected) => (),
                Err(e) => return SubscribeFuture::failed(e),
            }
        }

        let future = SubscribeFuture::new();
        self.enqueue(QueuedOp::Subscribe(topic, qos, future.clone()));
        future
    }

    /// Unsubscribes from a topic, or queues the operation while offline
    pub async fn unsubscribe<S: Into<String>>(&self, topic: S) -> GenericFuture {
        let topic = topic.into();

        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .retain(|f| f.path != topic);

        if let Some(client) = self.online_client() {
            match client.unsubscribe(vec![topic.clone()]).await {
                Ok(future) => return future,
                Err(ClientError::NotConnected) => (),
                Err(e) => return GenericFuture::failed(e),
            }
        }

        let future = GenericFuture::new();
        self.enqueue(QueuedOp::Unsubscribe(topic, future.clone()));
        future
    }

    fn online_client(&self) -> Option<Client> {
        if *self.inner.state.lock().unwrap() != ServiceState::Online {
            return None;
        }

        self.inner.client.lock().unwrap().clone()
    }

    fn enqueue(&self, op: QueuedOp) {
        let queue = self.inner.queue.lock().unwrap().clone();
        match queue {
            Some(queue) => {
                if let Err(op) = queue.push(op) {
                    op.fail(ClientError::QueueFull);
                } else {
                    debug!("Queued operation while offline. Queue size = {}", queue.len());
                }
            }
            None => op.fail(ClientError::NotConnected),
        }
    }

    fn set_state(&self, to: ServiceState) {
        let mut state = self.inner.state.lock().unwrap();

        // a concurrent stop wins over supervisor transitions
        if matches!(*state, ServiceState::Stopping | ServiceState::Stopped) {
            return;
        }

        *state = to;
    }

    async fn supervise(
        self,
        url: String,
        options: Options,
        queue: Arc<OfflineQueue>,
        events: Sender<ServiceEvent>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut backoff = Backoff::new(
            options.min_reconnect_delay,
            options.max_reconnect_delay,
            options.exponential_backoff,
        );
        let listener = self.inner.listener.lock().unwrap().clone();

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let client = Client::new();
            let tx = events.clone();
            client.on_message(move |message| {
                let _ = tx.send(ServiceEvent::Message(message));
            });

            info!("Connecting to {}", url);
            let outcome = match client.connect(&url, options.clone()).await {
                // the client enforces the connect timeout internally, the
                // extra second keeps this wait from racing it
                Ok(future) => {
                    future
                        .wait(options.connect_timeout + Duration::from_secs(1))
                        .await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(connack) => {
                    backoff.reset();
                    *self.inner.client.lock().unwrap() = Some(client.clone());
                    self.set_state(ServiceState::Online);

                    // a fresh broker session lost our subscriptions, set
                    // them up again before draining queued operations
                    if !connack.session_present {
                        let filters = self.inner.subscriptions.lock().unwrap().clone();
                        if !filters.is_empty() {
                            if let Err(e) = client.subscribe(filters).await {
                                warn!("Resubscription failed: {}", e);
                            }
                        }
                    }

                    drain(&client, &queue).await;
                    let _ = events.send(ServiceEvent::Online(connack.session_present));

                    tokio::select! {
                        _ = client.closed() => {
                            *self.inner.client.lock().unwrap() = None;
                            let error = client.last_error().unwrap_or(ClientError::NotConnected);
                            warn!("Connection to {} lost: {}", url, error);
                            let _ = events.send(ServiceEvent::Error(error.clone()));
                            let _ = events.send(ServiceEvent::Offline);

                            if !should_reconnect(&listener, &error) {
                                break;
                            }
                            self.set_state(ServiceState::Reconnecting);
                        }
                        _ = stop_rx.changed() => {
                            let _ = client.disconnect(options.drain_timeout).await;
                            *self.inner.client.lock().unwrap() = None;
                            break;
                        }
                    }
                }
                Err(error) => {
                    // a teardown cancels the connect future, the actual
                    // cause of death is on the client
                    let error = client.last_error().unwrap_or(error);
                    debug!("Connection attempt to {} failed: {}", url, error);
                    let _ = events.send(ServiceEvent::Error(error.clone()));

                    if !should_reconnect(&listener, &error) {
                        break;
                    }
                    self.set_state(ServiceState::Reconnecting);
                }
            }

            // cancellation aware backoff sleep so stop returns promptly
            let delay = backoff.next_delay();
            tokio::select! {
                _ = time::sleep(delay) => (),
                _ = stop_rx.changed() => break,
            }
        }

        // a terminal error ends supervision without a stop call, clean up
        // here instead of in stop
        if !*stop_rx.borrow() {
            queue.fail_all(ClientError::NotConnected);
            let _ = events.send(ServiceEvent::Offline);
            self.set_state(ServiceState::Stopped);
        }
    }
}

fn should_reconnect(listener: &Option<Arc<dyn Listener>>, error: &ClientError) -> bool {
    match listener {
        Some(listener) => listener.should_reconnect(error),
        None => true,
    }
}

/// Submits queued operations to the live client in FIFO order, binding
/// each waiting future to the client's future. New submissions while
/// draining go directly to the client
async fn drain(client: &Client, queue: &OfflineQueue) {
    while let Some(op) = queue.pop() {
        match op {
            QueuedOp::Publish(message, future) => match client.publish(message).await {
                Ok(upstream) => bind(future, upstream),
                Err(e) => future.fail(e),
            },
            QueuedOp::Subscribe(topic, qos, future) => {
                match client.subscribe(vec![SubscribeFilter::new(topic, qos)]).await {
                    Ok(upstream) => bind(future, upstream),
                    Err(e) => future.fail(e),
                }
            }
            QueuedOp::Unsubscribe(topic, future) => match client.unsubscribe(vec![topic]).await {
                Ok(upstream) => bind(future, upstream),
                Err(e) => future.fail(e),
            },
        }
    }
}

fn bind<T>(downstream: Future<T>, upstream: Future<T>)
where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move { downstream.bind(upstream).await });
}

async fn dispatch(listener: Option<Arc<dyn Listener>>, events: Receiver<ServiceEvent>) {
    while let Ok(event) = events.recv_async().await {
        let listener = match &listener {
            Some(listener) => listener,
            None => continue,
        };

        match event {
            ServiceEvent::Online(resumed) => listener.online(resumed),
            ServiceEvent::Offline => listener.offline(),
            ServiceEvent::Message(message) => listener.message(&message),
            ServiceEvent::Error(error) => listener.error(&error),
        }
    }
}

/// Connects with a clean session for `client_id` and disconnects right
/// away, purging the server side persistent session for that client
/// identifier
pub async fn clear_session(url: &str, client_id: &str) -> Result<(), ClientError> {
    let options = Options::builder()
        .client_id(client_id)
        .clean_session(true)
        .build();
    let connect_timeout = options.connect_timeout;

    let client = Client::new();
    let future = client.connect(url, options).await?;
    future.wait(connect_timeout).await?;
    client.disconnect(Duration::from_secs(1)).await
}
