use std::sync::atomic::{AtomicI64, Ordering};

use tracing::trace;

/// Tracks the bytes that were granted (explicitly or as unscheduled bytes) but did not arrive
///  yet, summed over all incoming messages of a [crate::homa::Homa] instance. Grants are only
///  issued while this total is below `max_incoming`.
///
/// The counter is touched by every packet arrival context, so it is only ever updated through
///  atomic adds. Each message contributes its [crate::segments::IncomingMessage::outstanding]
///  bytes, and every change to that value is mirrored here as a delta.
#[derive(Debug)]
pub struct IncomingAccountant {
    total_incoming: AtomicI64,
    max_incoming: i64,
}

impl IncomingAccountant {
    pub fn new(max_incoming: i64) -> IncomingAccountant {
        IncomingAccountant {
            total_incoming: AtomicI64::new(0),
            max_incoming,
        }
    }

    pub fn add(&self, delta: i64) {
        if delta != 0 {
            let prev = self.total_incoming.fetch_add(delta, Ordering::AcqRel);
            trace!("total_incoming {} -> {}", prev, prev + delta);
        }
    }

    pub fn total(&self) -> i64 {
        self.total_incoming.load(Ordering::Acquire)
    }

    pub fn max_incoming(&self) -> i64 {
        self.max_incoming
    }

    /// the number of bytes that may still be granted
    pub fn available(&self) -> i64 {
        self.max_incoming - self.total()
    }
}
