use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use bitflags::bitflags;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::RpcError;
use crate::rpc::{RpcId, RpcKey};

bitflags! {
    /// Flags for [crate::endpoint::Endpoint::receive]
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct RecvFlags: u8 {
        /// accept incoming requests (when no specific id is given)
        const REQUEST     = 0b0000_0001;
        /// accept responses to this endpoint's requests (when no specific id is given)
        const RESPONSE    = 0b0000_0010;
        /// fail with 'would block' instead of waiting
        const NONBLOCKING = 0b0000_0100;
        /// return whatever part of the message fits into the buffer, keeping the rest for
        ///  subsequent calls
        const PARTIAL     = 0b0000_1000;
    }
}

/// The outcome of a successful receive call. An RPC that failed is received like any other,
///  with `error` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: RpcId,
    pub peer: SocketAddr,
    pub completion_cookie: u64,
    /// the number of bytes copied by this call
    pub length: usize,
    pub message_length: usize,
    /// bytes still to be received with further (partial) receive calls
    pub remaining: usize,
    pub error: Option<RpcError>,
}

impl Completion {
    pub fn result(&self) -> Result<usize, RpcError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.length),
        }
    }
}

#[derive(Debug, Default)]
struct ReadyQueues {
    requests: VecDeque<RpcKey>,
    responses: VecDeque<RpcKey>,
    shutdown: bool,
}

impl ReadyQueues {
    fn queue(&mut self, is_request: bool) -> &mut VecDeque<RpcKey> {
        if is_request {
            &mut self.requests
        }
        else {
            &mut self.responses
        }
    }
}

/// Hands RPCs that became ready to the application.
///
/// An RPC is queued when it becomes `Ready`. Whoever takes its key out of the queue (by
///  [Gateway::pop] or [Gateway::claim]) owns its delivery; an RPC that is `Ready` but not queued
///  is being received by someone else.
///
/// Waiting is built on a per-endpoint [Notify]: every state change that may be of interest to
///  a waiter wakes all waiters, and each of them re-checks its condition. Waiters must register
///  (see [Gateway::notified]) *before* checking so that no wakeup gets lost.
///
/// NB: The queues are behind a synchronous mutex that is never held across an `.await`. It may
///  be acquired while an RPC's lock is held, but not the other way around.
#[derive(Debug, Default)]
pub struct Gateway {
    queues: Mutex<ReadyQueues>,
    notify: Notify,
}

impl Gateway {
    pub fn new() -> Gateway {
        Default::default()
    }

    pub fn enqueue(&self, key: RpcKey, is_request: bool) {
        self.queues.lock().unwrap()
            .queue(is_request)
            .push_back(key);
        self.notify.notify_waiters();
    }

    /// puts an RPC back at the head of its queue, e.g. after a partial read
    pub fn requeue_front(&self, key: RpcKey, is_request: bool) {
        self.queues.lock().unwrap()
            .queue(is_request)
            .push_front(key);
        self.notify.notify_waiters();
    }

    /// Takes a specific RPC out of its queue, returning false if it was not queued
    pub fn claim(&self, key: &RpcKey, is_request: bool) -> bool {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.queue(is_request);
        match queue.iter().position(|k| k == key) {
            Some(idx) => {
                queue.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Takes the first ready RPC matching the flags, requests before responses
    pub fn pop(&self, flags: RecvFlags) -> Option<RpcKey> {
        let mut queues = self.queues.lock().unwrap();
        if flags.contains(RecvFlags::REQUEST) {
            if let Some(key) = queues.requests.pop_front() {
                return Some(key);
            }
        }
        if flags.contains(RecvFlags::RESPONSE) {
            return queues.responses.pop_front();
        }
        None
    }

    /// removes an RPC that is being freed
    pub fn forget(&self, key: &RpcKey) {
        let mut queues = self.queues.lock().unwrap();
        queues.requests.retain(|k| k != key);
        queues.responses.retain(|k| k != key);
    }

    /// Wakes all waiters, which then fail with a shutdown error. This is irreversible.
    pub fn shutdown(&self) {
        debug!("shutting down gateway");
        {
            let mut queues = self.queues.lock().unwrap();
            queues.shutdown = true;
            queues.requests.clear();
            queues.responses.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.queues.lock().unwrap().shutdown
    }

    /// wakes waiters without a change to the queues, e.g. when a waited-for RPC was freed
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    /// A future that completes on the next wakeup. Call `enable()` on it (pinned) before
    ///  checking the waited-for condition.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// the number of queued (requests, responses)
    pub fn num_ready(&self) -> (usize, usize) {
        let queues = self.queues.lock().unwrap();
        (queues.requests.len(), queues.responses.len())
    }
}
