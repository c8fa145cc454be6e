//! Utilities for testing code on top of a [Homa] instance without a network. They are used for
//!  testing this crate itself, and they are exported for application testing.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::HomaConfig;
use crate::error::HomaError;
use crate::homa::Homa;
use crate::packet::{DataFlags, DataHeader, Packet, PacketBody};
use crate::packet_io::{PacketSender, UnreachableNotifier};
use crate::rpc::RpcId;

/// the host that test requests come from
pub const CLIENT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

/// the peer that test requests are sent to
pub fn server_addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 2], 99))
}

/// Records transmitted packets instead of sending them. Transmission can be made to fail for a
///  number of packets to simulate exhausted buffers, or for hosts that are unreachable.
#[derive(Debug, Default)]
pub struct TrackingPacketSender {
    tracker: Mutex<Vec<(SocketAddr, Packet)>>,
    fail_next: AtomicUsize,
    unreachable: Mutex<Vec<IpAddr>>,
}
impl TrackingPacketSender {
    pub fn new() -> Arc<TrackingPacketSender> {
        Default::default()
    }

    /// returns sent packets, clearing the internal buffer
    pub fn sent_packets(&self) -> Vec<(SocketAddr, Packet)> {
        std::mem::take(&mut *self.tracker.lock().unwrap())
    }

    /// the short form (see [Packet]'s `Display`) of sent packets, clearing the internal buffer
    pub fn sent_summary(&self) -> Vec<String> {
        self.sent_packets().iter()
            .map(|(_, p)| p.to_string())
            .collect()
    }

    /// the next `n` packets fail with [HomaError::NoBufferSpace] and are not recorded
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// packets to `host` fail with [HomaError::HostUnreachable] from now on
    pub fn make_unreachable(&self, host: IpAddr) {
        self.unreachable.lock().unwrap().push(host);
    }
}

#[async_trait]
impl PacketSender for TrackingPacketSender {
    async fn transmit(&self, to: SocketAddr, packet: Bytes) -> Result<(), HomaError> {
        if self.unreachable.lock().unwrap().contains(&to.ip()) {
            return Err(HomaError::HostUnreachable);
        }
        let failing = self.fail_next.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(HomaError::NoBufferSpace);
        }

        let mut buf = packet;
        let packet = Packet::deser(&mut buf)
            .map_err(|e| HomaError::Transmit(format!("sent an invalid packet: {}", e)))?;
        self.tracker.lock().unwrap().push((to, packet));
        Ok(())
    }
}

/// Records 'destination unreachable' signals
#[derive(Debug, Default)]
pub struct TrackingUnreachableNotifier {
    tracker: Mutex<Vec<(SocketAddr, u16)>>,
}
impl TrackingUnreachableNotifier {
    pub fn new() -> Arc<TrackingUnreachableNotifier> {
        Default::default()
    }

    pub fn signals(&self) -> Vec<(SocketAddr, u16)> {
        std::mem::take(&mut *self.tracker.lock().unwrap())
    }
}
impl UnreachableNotifier for TrackingUnreachableNotifier {
    fn destination_unreachable(&self, source: SocketAddr, dport: u16) {
        self.tracker.lock().unwrap().push((source, dport));
    }
}

/// A [Homa] instance that sends into a [TrackingPacketSender]
pub fn test_homa(config: HomaConfig) -> (Homa, Arc<TrackingPacketSender>) {
    let sender = TrackingPacketSender::new();
    let homa = Homa::new(config, sender.clone(), TrackingUnreachableNotifier::new())
        .expect("invalid test configuration");
    (homa, sender)
}

/// The bytes of a message as [data_packet] generates them
pub fn message_bytes(offset: usize, len: usize) -> Vec<u8> {
    (offset..offset + len)
        .map(|i| (i % 251) as u8)
        .collect()
}

/// A serialized DATA packet carrying `seg_len` bytes of [message_bytes] at `offset`
pub fn data_packet(sport: u16, dport: u16, sender_id: u64, message_length: u32, incoming: u32, offset: u32, seg_len: usize) -> Bytes {
    Packet::new(sport, dport, RpcId(sender_id), PacketBody::Data {
        header: DataHeader {
            message_length,
            incoming,
            offset,
            flags: DataFlags::empty(),
        },
        payload: Bytes::from(message_bytes(offset as usize, seg_len)),
    }).to_bytes()
}

/// A serialized control packet
pub fn control_packet(sport: u16, dport: u16, sender_id: u64, body: PacketBody) -> Bytes {
    Packet::new(sport, dport, RpcId(sender_id), body).to_bytes()
}
