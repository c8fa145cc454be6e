use std::net::{IpAddr, SocketAddr};

use tracing::{debug, trace};

use crate::endpoint::Endpoint;
use crate::error::RpcError;
use crate::homa::{Homa, PortMap};
use crate::metrics::HomaMetrics;
use crate::packet::{Packet, PacketBody};
use crate::rpc::{HomaRpc, RpcState};

/// What one tick decided for an RPC, carried out after its lock is released
#[derive(Default)]
struct TickAction {
    control: Option<(SocketAddr, Packet)>,
    xmit: bool,
    /// a client RPC gave up on this host, so all other RPCs with it are given up on as well
    abort_peer: Option<IpAddr>,
}

impl Homa {
    /// Runs one timer tick over all endpoints. [Homa::spawn_timer] calls this periodically;
    ///  applications driving time themselves may call it directly.
    pub async fn tick(&self) {
        Self::tick_ports(&self.ports).await
    }

    pub(crate) async fn tick_ports(ports: &PortMap) {
        let endpoints: Vec<_> = ports.read().await
            .values()
            .cloned()
            .collect();
        for endpoint in endpoints {
            endpoint.check_timeouts().await;
        }
    }
}

impl Endpoint {
    /// Detects RPCs whose peer went silent. After [crate::config::HomaConfig::resend_ticks]
    ///  ticks without a packet from the peer, RESEND (or NEED_ACK for a transmitted reply) is
    ///  sent every `resend_interval` ticks. When `abort_resends` of them went unanswered, the RPC
    ///  is given up on; for a client RPC, this gives up on all RPCs with the same peer host.
    pub(crate) async fn check_timeouts(&self) {
        for rpc_ref in self.rpcs.snapshot().await {
            let action = {
                let mut rpc = rpc_ref.lock().await;
                self.tick_rpc(&mut rpc).await
            };

            if let Some((to, packet)) = action.control {
                self.core.send_control(to, packet).await;
            }
            if action.xmit {
                self.xmit_data(&rpc_ref).await;
            }
            if let Some(addr) = action.abort_peer {
                self.abort_peer_everywhere(addr, RpcError::Timeout).await;
            }
        }
    }

    async fn tick_rpc(&self, rpc: &mut HomaRpc) -> TickAction {
        let config = &self.core.config;
        let mut action = TickAction::default();
        if rpc.is_terminal() {
            return action;
        }

        // segments that were granted but could not be transmitted, e.g. for lack of buffers
        action.xmit = rpc.msgout.as_ref()
            .is_some_and(|m| m.next_xmit_offset() < m.granted());

        let waiting = match rpc.state {
            RpcState::Incoming | RpcState::Outgoing => true,
            RpcState::InService | RpcState::Ready | RpcState::Dead => false,
        };
        if !waiting {
            rpc.silent_ticks = 0;
            return action;
        }

        rpc.silent_ticks += 1;
        if rpc.silent_ticks < config.resend_ticks || (rpc.silent_ticks - config.resend_ticks) % config.resend_interval != 0 {
            return action;
        }

        if rpc.num_resends >= config.abort_resends {
            if rpc.is_client() {
                debug!("RPC {:?} timed out after {} unanswered resends", rpc.key, rpc.num_resends);
                HomaMetrics::inc(&self.core.metrics.client_rpc_timeouts);
                self.abort_rpc(rpc, RpcError::Timeout);
                action.abort_peer = Some(rpc.key.peer.ip());
            }
            else {
                debug!("discarding server RPC {:?} after {} unanswered resends", rpc.key, rpc.num_resends);
                HomaMetrics::inc(&self.core.metrics.server_rpc_discards);
                self.free_rpc(rpc).await;
            }
            action.xmit = false;
            return action;
        }
        rpc.num_resends += 1;

        let key = rpc.key;
        if !rpc.is_client() && rpc.state == RpcState::Outgoing {
            // the client acknowledges a complete response; until then the reply is retransmitted
            //  on the client's RESEND
            if rpc.msgout.as_ref().is_some_and(|m| m.is_fully_transmitted()) {
                trace!("reply of {:?} not acknowledged - sending NEED_ACK", key);
                action.control = Some((key.peer, Packet::new(self.port(), key.peer.port(), key.id, PacketBody::NeedAck)));
            }
            return action;
        }

        let (offset, length) = rpc.msgin.as_ref()
            .and_then(|m| m.resend_range())
            .unwrap_or_else(|| {
                let offset = rpc.msgin.as_ref().map(|m| m.contiguous_received()).unwrap_or(0);
                (offset, config.rtt_bytes as usize)
            });
        let priority = config.num_priorities - 1;
        trace!("no news from peer of {:?} for {} ticks - requesting resend of {}@{}", key, rpc.silent_ticks, length, offset);
        action.control = Some((key.peer, Packet::new(
            self.port(),
            key.peer.port(),
            key.id,
            PacketBody::Resend { offset: offset as u32, length: length as u32, priority },
        )));
        action
    }
}
