//! Handling of packets arriving from the network.
//!
//! Packets arrive in batches. Before a batch is dispatched, it is sorted by the total length of
//!  the message each packet belongs to, so that short messages complete (and their receivers
//!  are woken) before processing time goes to long ones. The sort is stable: packets of
//!  equally long messages keep their arrival order, and an already sorted batch is dispatched
//!  unchanged.

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use tracing::{debug, span, trace, warn, Instrument, Level};

use crate::endpoint::Endpoint;
use crate::homa::Homa;
use crate::metrics::HomaMetrics;
use crate::packet::{DataFlags, DataHeader, Packet, PacketBody};
use crate::rpc::{HomaRpc, RpcKey, RpcState};
use crate::segments::IncomingMessage;

impl Homa {
    /// Processes a batch of packets that arrived together. `source` is the sending host, the
    ///  peer's Homa port is taken from the packet header.
    ///
    /// Malformed packets and packets for unknown ports are counted and dropped; nothing in
    ///  here fails.
    pub async fn handle_batch(&self, batch: Vec<(IpAddr, Bytes)>) {
        let span = span!(Level::TRACE, "packet_batch", size = batch.len());
        self.do_handle_batch(batch)
            .instrument(span)
            .await
    }

    async fn do_handle_batch(&self, batch: Vec<(IpAddr, Bytes)>) {
        let core = &self.core;
        core.timetrace.record("received batch of {} packets", [batch.len() as u32, 0, 0, 0]);

        let mut packets = Vec::with_capacity(batch.len());
        for (source, mut buf) in batch {
            match Packet::deser(&mut buf) {
                Ok(packet) if packet.packet_type().is_some() => packets.push((source, packet)),
                Ok(packet) => {
                    debug!("received packet with unrecognized type from {:?} - dropping: {:?}", source, packet);
                    HomaMetrics::inc(&core.metrics.short_packets);
                }
                Err(e) => {
                    debug!("received short or invalid packet from {:?} - dropping: {}", source, e);
                    HomaMetrics::inc(&core.metrics.short_packets);
                }
            }
        }

        packets.sort_by_key(|(_, packet)| packet.scheduling_key());

        let mut needs_grants = false;
        for (source, packet) in packets {
            let dport = packet.common.dport;
            let peer = SocketAddr::new(source, packet.common.sport);

            let endpoint = self.ports.read().await
                .get(&dport)
                .cloned();
            match endpoint {
                Some(endpoint) => {
                    needs_grants |= endpoint.dispatch(peer, packet).await;
                }
                None => {
                    debug!("received packet from {:?} for unbound port {} - dropping", peer, dport);
                    HomaMetrics::inc(&core.metrics.unreachable_ports);
                    core.unreachable.destination_unreachable(peer, dport);
                }
            }
        }

        if needs_grants {
            core.send_grants().await;
        }
    }
}

impl Endpoint {
    /// Handles a single packet, returning true if it was data for a message that needs grants
    pub(crate) async fn dispatch(&self, peer: SocketAddr, packet: Packet) -> bool {
        let Some(packet_type) = packet.packet_type() else {
            return false;
        };
        self.core.metrics.packet_received(packet_type);
        trace!("dispatching {:?} from {:?}", packet, peer);

        let key = RpcKey { peer, id: packet.common.sender_id.peer_id() };
        match packet.body {
            PacketBody::Data { header, payload } => return self.handle_data(key, header, payload).await,
            PacketBody::Grant { offset, .. } => self.handle_grant(key, offset as usize).await,
            PacketBody::Resend { offset, length, .. } => self.handle_resend(key, offset as usize, length as usize).await,
            PacketBody::Unknown => self.handle_unknown(key).await,
            PacketBody::Busy => self.handle_busy(key).await,
            PacketBody::Cutoffs { version, .. } => trace!("ignoring CUTOFFS v{} from {:?}", version, peer),
            PacketBody::NeedAck => self.handle_need_ack(key).await,
            PacketBody::Ack => self.handle_ack(key).await,
            PacketBody::Unrecognized(_) => {}
        }
        false
    }

    fn unknown_rpc(&self, key: &RpcKey, what: &str) {
        debug!("received {} for unknown RPC {:?} - dropping", what, key);
        HomaMetrics::inc(&self.core.metrics.unknown_rpcs);
    }

    async fn handle_data(&self, key: RpcKey, header: DataHeader, payload: Bytes) -> bool {
        let rpc_ref = if key.id.is_client() {
            match self.rpcs.get(&key).await {
                Some(rpc) => rpc,
                None => {
                    self.unknown_rpc(&key, "DATA");
                    return false;
                }
            }
        }
        else {
            let (rpc, created) = self.rpcs.get_or_create(key, || HomaRpc::new_server(key, self.core.next_birth())).await;
            if created {
                trace!("created server RPC {:?}", key);
                self.core.timetrace.record("server rpc {} created", [key.id.0 as u32, 0, 0, 0]);
            }
            rpc
        };

        let mut rpc = rpc_ref.lock().await;
        if self.gateway.is_shutdown() {
            // shutdown may have taken its snapshot of the table before this RPC was created
            self.free_rpc(&mut rpc).await;
            return false;
        }
        rpc.heard_from_peer();
        if rpc.is_client() && rpc.state == RpcState::Outgoing {
            // the response started, so the server has the whole request
            rpc.state = RpcState::Incoming;
        }
        if rpc.state != RpcState::Incoming {
            debug!("received DATA for RPC {:?} in state {:?} - dropping", key, rpc.state);
            return false;
        }

        if rpc.msgin.is_none() {
            let msgin = IncomingMessage::new(header.message_length as usize, header.incoming as usize);
            self.core.accountant.add(msgin.outstanding());
            if msgin.is_scheduled() {
                self.core.grants.add(self.port(), key, rpc_ref.clone());
            }
            rpc.msgin = Some(msgin);
        }
        let Some(msgin) = rpc.msgin.as_mut() else {
            return false;
        };
        if msgin.declared_length() != header.message_length as usize {
            warn!("received DATA for RPC {:?} with message length {}, expected {} - dropping", key, header.message_length, msgin.declared_length());
            return false;
        }

        let before = msgin.outstanding();
        let added = msgin.add_segment(header.offset as usize, payload);
        self.core.accountant.add(msgin.outstanding() - before);
        if added == 0 {
            trace!("redundant DATA for RPC {:?} at offset {}", key, header.offset);
            HomaMetrics::inc(&self.core.metrics.redundant_packets);
        }
        self.core.timetrace.record("data for rpc {}, offset {}", [key.id.0 as u32, header.offset, 0, 0]);

        if msgin.is_complete() {
            self.rpc_ready(&mut rpc);
            false
        }
        else {
            msgin.is_scheduled()
        }
    }

    async fn handle_grant(&self, key: RpcKey, offset: usize) {
        let Some(rpc_ref) = self.rpcs.get(&key).await else {
            self.unknown_rpc(&key, "GRANT");
            return;
        };
        {
            let mut rpc = rpc_ref.lock().await;
            rpc.heard_from_peer();
            if rpc.is_terminal() || rpc.state == RpcState::InService {
                return;
            }
            let Some(msgout) = rpc.msgout.as_mut() else {
                return;
            };
            if !msgout.grant(offset) {
                return;
            }
        }
        self.xmit_data(&rpc_ref).await;
    }

    async fn handle_resend(&self, key: RpcKey, offset: usize, length: usize) {
        let Some(rpc_ref) = self.rpcs.get(&key).await else {
            debug!("RESEND for unknown RPC {:?} - responding UNKNOWN", key);
            let unknown = Packet::new(self.port(), key.peer.port(), key.id, PacketBody::Unknown);
            self.core.send_control(key.peer, unknown).await;
            return;
        };

        let busy = Packet::new(self.port(), key.peer.port(), key.id, PacketBody::Busy);
        let packets = {
            let mut rpc = rpc_ref.lock().await;
            rpc.heard_from_peer();
            if rpc.is_terminal() || rpc.state == RpcState::InService || (!rpc.is_client() && rpc.state != RpcState::Outgoing) {
                None
            }
            else {
                match rpc.msgout.as_ref() {
                    Some(msgout) if length > 0 => {
                        let segments = msgout.segments_in_range(offset, length);
                        if segments.is_empty() {
                            None
                        }
                        else {
                            Some(self.data_packets(&rpc.key, msgout.length(), msgout.granted(), segments, DataFlags::RETRANSMIT))
                        }
                    }
                    _ => None,
                }
            }
        };

        match packets {
            None => {
                trace!("nothing to resend for {:?} - responding BUSY", key);
                self.core.send_control(key.peer, busy).await;
            }
            Some(packets) => {
                for (_, packet) in packets {
                    HomaMetrics::inc(&self.core.metrics.resent_packets);
                    self.core.transmit(key.peer, &packet).await.ok();
                }
            }
        }
    }

    async fn handle_unknown(&self, key: RpcKey) {
        let Some(rpc_ref) = self.rpcs.get(&key).await else {
            self.unknown_rpc(&key, "UNKNOWN");
            return;
        };
        {
            let mut rpc = rpc_ref.lock().await;
            if !rpc.is_client() {
                debug!("client does not know server RPC {:?} - discarding it", key);
                HomaMetrics::inc(&self.core.metrics.server_rpc_discards);
                self.free_rpc(&mut rpc).await;
                return;
            }
            let waiting_for_response = rpc.state == RpcState::Outgoing || (rpc.state == RpcState::Incoming && rpc.msgin.is_none());
            if !waiting_for_response {
                return;
            }
            debug!("server does not know RPC {:?} - restarting the request", key);
            if let Some(msgout) = rpc.msgout.as_mut() {
                msgout.restart();
            }
            rpc.state = RpcState::Outgoing;
            rpc.heard_from_peer();
        }
        self.xmit_data(&rpc_ref).await;
    }

    async fn handle_busy(&self, key: RpcKey) {
        match self.rpcs.get(&key).await {
            Some(rpc) => rpc.lock().await.heard_from_peer(),
            None => self.unknown_rpc(&key, "BUSY"),
        }
    }

    async fn handle_need_ack(&self, key: RpcKey) {
        let ack = match self.rpcs.get(&key).await {
            None => true,
            Some(rpc) => {
                let rpc = rpc.lock().await;
                rpc.state == RpcState::Ready && rpc.error.is_none()
            }
        };
        if ack {
            let ack = Packet::new(self.port(), key.peer.port(), key.id, PacketBody::Ack);
            self.core.send_control(key.peer, ack).await;
        }
    }

    async fn handle_ack(&self, key: RpcKey) {
        let Some(rpc_ref) = self.rpcs.get(&key).await else {
            trace!("ACK for RPC {:?} that was already discarded", key);
            return;
        };
        let mut rpc = rpc_ref.lock().await;
        if !rpc.is_client() {
            trace!("RPC {:?} acknowledged by the client", key);
            self.free_rpc(&mut rpc).await;
        }
    }
}
