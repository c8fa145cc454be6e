use std::sync::atomic::{AtomicU64, Ordering};

use crate::packet::PacketType;

/// Diagnostic event counters of a [crate::homa::Homa] instance.
#[derive(Debug, Default)]
pub struct HomaMetrics {
    /// packets that were too short to parse or had an unknown type
    pub short_packets: AtomicU64,
    /// packets for RPCs that do not exist (any more)
    pub unknown_rpcs: AtomicU64,
    /// DATA packets that did not contain a single new byte
    pub redundant_packets: AtomicU64,
    /// packets addressed to a port without an endpoint
    pub unreachable_ports: AtomicU64,
    pub packets_received: [AtomicU64; PacketType::ALL.len()],
    pub packets_sent: [AtomicU64; PacketType::ALL.len()],
    /// complete requests handed to the gateway
    pub requests_queued: AtomicU64,
    /// complete responses handed to the gateway
    pub responses_queued: AtomicU64,
    pub resent_packets: AtomicU64,
    pub client_rpc_timeouts: AtomicU64,
    pub server_rpc_discards: AtomicU64,
    /// transmissions that failed because the packet I/O layer was out of buffers
    pub xmit_exhausted: AtomicU64,
    pub xmit_errors: AtomicU64,
}

impl HomaMetrics {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_received(&self, packet_type: PacketType) {
        Self::inc(&self.packets_received[packet_type.index()]);
    }

    pub fn packet_sent(&self, packet_type: PacketType) {
        Self::inc(&self.packets_sent[packet_type.index()]);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            short_packets: load(&self.short_packets),
            unknown_rpcs: load(&self.unknown_rpcs),
            redundant_packets: load(&self.redundant_packets),
            unreachable_ports: load(&self.unreachable_ports),
            packets_received: self.packets_received.each_ref().map(load),
            packets_sent: self.packets_sent.each_ref().map(load),
            requests_queued: load(&self.requests_queued),
            responses_queued: load(&self.responses_queued),
            resent_packets: load(&self.resent_packets),
            client_rpc_timeouts: load(&self.client_rpc_timeouts),
            server_rpc_discards: load(&self.server_rpc_discards),
            xmit_exhausted: load(&self.xmit_exhausted),
            xmit_errors: load(&self.xmit_errors),
        }
    }
}

/// A point-in-time copy of [HomaMetrics]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub short_packets: u64,
    pub unknown_rpcs: u64,
    pub redundant_packets: u64,
    pub unreachable_ports: u64,
    pub packets_received: [u64; PacketType::ALL.len()],
    pub packets_sent: [u64; PacketType::ALL.len()],
    pub requests_queued: u64,
    pub responses_queued: u64,
    pub resent_packets: u64,
    pub client_rpc_timeouts: u64,
    pub server_rpc_discards: u64,
    pub xmit_exhausted: u64,
    pub xmit_errors: u64,
}

impl MetricsSnapshot {
    pub fn received(&self, packet_type: PacketType) -> u64 {
        self.packets_received[packet_type.index()]
    }

    pub fn sent(&self, packet_type: PacketType) -> u64 {
        self.packets_sent[packet_type.index()]
    }
}
