//! Bounded FIFO of operations submitted while the service has no usable
//! connection.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::client::ClientError;
use crate::future::{GenericFuture, SubscribeFuture};
use crate::packet::QoS;
use crate::Message;

/// What to do with a submission when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Reject the new operation with [`ClientError::QueueFull`]
    RejectNewest,
    /// Evict and cancel the oldest queued operation
    DropOldest,
}

/// An operation waiting for a connection, together with the future handed
/// to the caller. On drain the future is bound to the live client's future
pub(crate) enum QueuedOp {
    Publish(Message, GenericFuture),
    Subscribe(String, QoS, SubscribeFuture),
    Unsubscribe(String, GenericFuture),
}

impl QueuedOp {
    fn cancel(&self) {
        match self {
            QueuedOp::Publish(_, f) => f.cancel(),
            QueuedOp::Subscribe(_, _, f) => f.cancel(),
            QueuedOp::Unsubscribe(_, f) => f.cancel(),
        }
    }

    pub fn fail(&self, error: ClientError) {
        match self {
            QueuedOp::Publish(_, f) => f.fail(error),
            QueuedOp::Subscribe(_, _, f) => f.fail(error),
            QueuedOp::Unsubscribe(_, f) => f.fail(error),
        }
    }
}

pub(crate) struct OfflineQueue {
    ops: Mutex<VecDeque<QueuedOp>>,
    limit: usize,
    policy: QueuePolicy,
}

impl OfflineQueue {
    pub fn new(limit: usize, policy: QueuePolicy) -> OfflineQueue {
        OfflineQueue {
            ops: Mutex::new(VecDeque::new()),
            limit,
            policy,
        }
    }

    /// Enqueues an operation. A full queue either rejects the new
    /// operation (handing it back) or evicts and cancels the oldest one
    pub fn push(&self, op: QueuedOp) -> Result<(), QueuedOp> {
        let mut ops = self.ops.lock().unwrap();
        if ops.len() >= self.limit {
            match self.policy {
                QueuePolicy::RejectNewest => return Err(op),
                QueuePolicy::DropOldest => {
                    if let Some(evicted) = ops.pop_front() {
                        evicted.cancel();
                    }
                }
            }
        }

        ops.push_back(op);
        Ok(())
    }

    pub fn pop(&self) -> Option<QueuedOp> {
        self.ops.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.ops.lock().unwrap().len()
    }

    /// Fails every queued operation with `error` and drops them
    pub fn fail_all(&self, error: ClientError) {
        let ops: Vec<QueuedOp> = self.ops.lock().unwrap().drain(..).collect();
        for op in ops {
            op.fail(error.clone());
        }
    }
}
