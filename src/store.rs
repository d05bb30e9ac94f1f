//! Registry of operations waiting for a broker acknowledgement, keyed by
//! packet id.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time;

use crate::client::ClientError;
use crate::future::{ConnectFuture, GenericFuture, SubscribeFuture};

/// Packet id the connect future is registered under. CONNECT carries no
/// packet id and 0 is never allocated to another operation
pub(crate) const CONNECT_ID: u16 = 0;

/// A tracked in-flight operation
#[derive(Clone)]
pub(crate) enum Pending {
    Connect(ConnectFuture),
    Generic(GenericFuture),
    Subscribe(SubscribeFuture),
}

impl Pending {
    pub fn cancel(&self) {
        match self {
            Pending::Connect(f) => f.cancel(),
            Pending::Generic(f) => f.cancel(),
            Pending::Subscribe(f) => f.cancel(),
        }
    }

    pub fn fail(&self, error: ClientError) {
        match self {
            Pending::Connect(f) => f.fail(error),
            Pending::Generic(f) => f.fail(error),
            Pending::Subscribe(f) => f.fail(error),
        }
    }
}

/// Mutex protected map of pending futures. Deletions wake `await_empty`
/// waiters
pub(crate) struct FutureStore {
    futures: Mutex<HashMap<u16, Pending>>,
    emptied: Notify,
}

impl FutureStore {
    pub fn new() -> FutureStore {
        FutureStore {
            futures: Mutex::new(HashMap::new()),
            emptied: Notify::new(),
        }
    }

    pub fn put(&self, id: u16, future: Pending) {
        self.futures.lock().unwrap().insert(id, future);
    }

    pub fn get(&self, id: u16) -> Option<Pending> {
        self.futures.lock().unwrap().get(&id).cloned()
    }

    pub fn del(&self, id: u16) -> Option<Pending> {
        let future = self.futures.lock().unwrap().remove(&id);
        self.emptied.notify_waiters();
        future
    }

    pub fn contains(&self, id: u16) -> bool {
        self.futures.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.futures.lock().unwrap().len()
    }

    #[allow(dead_code)]
    pub fn all(&self) -> Vec<Pending> {
        self.futures.lock().unwrap().values().cloned().collect()
    }

    /// Returns once the store is empty, or with
    /// [`ClientError::TimeoutExceeded`] when the deadline passes first
    pub async fn await_empty(&self, timeout: Duration) -> Result<(), ClientError> {
        let drained = async {
            loop {
                let notified = self.emptied.notified();
                if self.len() == 0 {
                    return;
                }

                notified.await;
            }
        };

        match time::timeout(timeout, drained).await {
            Ok(()) => Ok(()),
            Err(_) => Err(ClientError::TimeoutExceeded),
        }
    }

    /// Removes every tracked future, optionally canceling them first so
    /// their waiters unblock
    pub fn clear(&self, cancel: bool) {
        let futures: Vec<Pending> = self.futures.lock().unwrap().drain().map(|(_, f)| f).collect();
        for future in &futures {
            if cancel {
                future.cancel();
            }
        }

        self.emptied.notify_waiters();
    }

    /// Fails every tracked future with `error` and removes them. Used by
    /// a graceful disconnect to abort whatever outlived the drain deadline
    pub fn fail_all(&self, error: ClientError) {
        let futures: Vec<Pending> = self.futures.lock().unwrap().drain().map(|(_, f)| f).collect();
        for future in futures {
            future.fail(error.clone());
        }

        self.emptied.notify_waiters();
    }
}
