//! Completion handles for in-flight operations.
//!
//! Every operation that needs a broker acknowledgement returns one of these
//! futures. The caller keeps the handle and waits on it; the connection's
//! reader task completes it when the matching ack arrives.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time;

use crate::client::ClientError;
use crate::packet::{ConnAck, SubscribeReturnCode};

/// Completion handle for operations with an empty result (publish,
/// unsubscribe, disconnect)
pub type GenericFuture = Future<()>;

/// Completion handle for connect. Carries the session present flag and the
/// return code from connack
pub type ConnectFuture = Future<ConnAck>;

/// Completion handle for subscribe. Carries the granted QoS codes from
/// suback
pub type SubscribeFuture = Future<Vec<SubscribeReturnCode>>;

enum State<T> {
    Pending,
    Done(Result<T, ClientError>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// A pending operation result. Completed exactly once; the first
/// completion wins and later ones are no-ops
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Future<T> {
    pub fn new() -> Future<T> {
        Future {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending),
                notify: Notify::new(),
            }),
        }
    }

    /// A future which has already failed with `error`
    pub fn failed(error: ClientError) -> Future<T> {
        let future = Future::new();
        future.fail(error);
        future
    }

    /// Completes the future with a value. No-op if already settled
    pub fn complete(&self, value: T) {
        self.settle(Ok(value));
    }

    /// Completes the future with an error. No-op if already settled
    pub fn fail(&self, error: ClientError) {
        self.settle(Err(error));
    }

    /// Marks the future canceled. Every pending and subsequent `wait`
    /// returns [`ClientError::FutureCanceled`]
    pub fn cancel(&self) {
        self.fail(ClientError::FutureCanceled);
    }

    pub fn is_settled(&self) -> bool {
        matches!(*self.shared.state.lock().unwrap(), State::Done(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(
            *self.shared.state.lock().unwrap(),
            State::Done(Err(ClientError::FutureCanceled))
        )
    }

    /// Waits for the result, up to `timeout`. Elapsing the deadline
    /// returns [`ClientError::TimeoutExceeded`] and leaves the future
    /// untouched
    pub async fn wait(&self, timeout: Duration) -> Result<T, ClientError> {
        match time::timeout(timeout, self.resolved()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClientError::TimeoutExceeded),
        }
    }

    /// Copies the outcome of `upstream` into this future once it settles.
    /// Cancellation propagates in both directions: canceling either future
    /// cancels the other
    pub async fn bind(&self, upstream: Future<T>) {
        tokio::select! {
            outcome = upstream.resolved() => self.settle(outcome),
            outcome = self.resolved() => {
                if matches!(outcome, Err(ClientError::FutureCanceled)) {
                    upstream.cancel();
                }
            }
        }
    }

    fn settle(&self, outcome: Result<T, ClientError>) {
        let mut state = self.shared.state.lock().unwrap();
        if matches!(*state, State::Done(_)) {
            return;
        }

        *state = State::Done(outcome);
        drop(state);
        self.shared.notify.notify_waiters();
    }

    async fn resolved(&self) -> Result<T, ClientError> {
        loop {
            // register for a wakeup before checking so a completion
            // between the check and the await isn't missed
            let notified = self.shared.notify.notified();
            if let State::Done(outcome) = &*self.shared.state.lock().unwrap() {
                return outcome.clone();
            }

            notified.await;
        }
    }
}
