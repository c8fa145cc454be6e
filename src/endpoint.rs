use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{HomaError, RpcError};
use crate::gateway::{Completion, Gateway, RecvFlags};
use crate::homa::{Homa, HomaCore, PortMap};
use crate::metrics::HomaMetrics;
use crate::packet::{DataFlags, DataHeader, Packet, PacketBody};
use crate::rpc::{HomaRpc, RpcId, RpcKey, RpcState};
use crate::rpc_table::{RpcRef, RpcTable};
use crate::segments::{OutgoingMessage, RecvBuffer};

/// What a receive call waits for
#[derive(Debug, Clone, Copy)]
enum RecvTarget<'a> {
    Id(RpcId),
    AnyOf(&'a [RpcId]),
    /// the first queued RPC matching the flags
    Queued,
}

/// A Homa endpoint ('socket'), bound to a local port. This is the application's interface for
///  sending requests and replies and for receiving responses and requests.
pub struct Endpoint {
    local_addr: SocketAddr,
    pub(crate) core: Arc<HomaCore>,
    ports: Weak<PortMap>,
    pub(crate) rpcs: RpcTable,
    pub(crate) gateway: Gateway,
}

impl Endpoint {
    pub(crate) fn new(local_addr: SocketAddr, core: Arc<HomaCore>, ports: Weak<PortMap>) -> Endpoint {
        Endpoint {
            local_addr,
            core,
            ports,
            rpcs: RpcTable::new(),
            gateway: Gateway::new(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn is_shutdown(&self) -> bool {
        self.gateway.is_shutdown()
    }

    /// the number of RPCs this endpoint currently tracks
    pub async fn num_rpcs(&self) -> usize {
        self.rpcs.len().await
    }

    fn check_open(&self) -> Result<(), HomaError> {
        if self.gateway.is_shutdown() {
            return Err(HomaError::Shutdown);
        }
        Ok(())
    }

    fn check_destination(&self, dest: SocketAddr) -> Result<(), HomaError> {
        if dest.is_ipv4() != self.local_addr.is_ipv4() {
            return Err(HomaError::AddressFamily);
        }
        if dest.port() == 0 {
            return Err(HomaError::InvalidArgument(format!("destination {:?} has no port", dest)));
        }
        Ok(())
    }

    fn check_length(&self, length: usize) -> Result<(), HomaError> {
        if length == 0 {
            return Err(HomaError::InvalidArgument("empty message".to_string()));
        }
        let max = self.core.config.max_message_length;
        if length > max {
            return Err(HomaError::MessageTooLong { length, max });
        }
        Ok(())
    }

    /// Sends a request, returning the new RPC's id. The response is received with
    ///  [Endpoint::receive], either by id or as [RecvFlags::RESPONSE].
    pub async fn send(&self, dest: SocketAddr, payload: Bytes, completion_cookie: u64) -> Result<RpcId, HomaError> {
        self.check_open()?;
        self.check_destination(dest)?;
        self.check_length(payload.len())?;

        let id = self.core.next_client_id();
        let key = RpcKey { peer: dest, id };
        let rpc = HomaRpc::new_client(key, payload, completion_cookie, &self.core.config, self.core.next_birth());
        let rpc = self.rpcs.insert(rpc).await;

        if self.gateway.is_shutdown() {
            // raced with shutdown, which may have missed this RPC
            self.free_rpc(&mut *rpc.lock().await).await;
            return Err(HomaError::Shutdown);
        }

        debug!("sending request {:?}", key);
        self.core.timetrace.record("client rpc {} created", [id.0 as u32, 0, 0, 0]);
        self.xmit_data(&rpc).await;
        Ok(id)
    }

    /// Sends the reply for a request that was received by the application
    pub async fn reply(&self, dest: SocketAddr, id: RpcId, payload: Bytes) -> Result<(), HomaError> {
        self.check_open()?;
        self.check_destination(dest)?;
        self.check_length(payload.len())?;

        let key = RpcKey { peer: dest, id };
        let rpc = match self.rpcs.get(&key).await {
            Some(rpc) if !id.is_client() => rpc,
            _ => return Err(HomaError::NoSuchRpc(id.0)),
        };

        {
            let mut rpc = rpc.lock().await;
            if rpc.state != RpcState::InService {
                return Err(HomaError::InvalidArgument(format!("RPC {} is not waiting for a reply (state {:?})", id, rpc.state)));
            }
            let config = &self.core.config;
            let unscheduled = config.unscheduled_bytes(payload.len());
            rpc.msgout = Some(OutgoingMessage::new(payload, config.max_segment_payload, unscheduled));
            rpc.state = RpcState::Outgoing;
            rpc.heard_from_peer();
        }

        debug!("sending reply {:?}", key);
        self.xmit_data(&rpc).await;
        Ok(())
    }

    /// Receives a ready RPC: a response to a specific request if `id` is given, or otherwise
    ///  the next request or response as selected by `flags`.
    ///
    /// The message is copied into `buf`. Without [RecvFlags::PARTIAL] a message is consumed by
    ///  one call (and truncated if it does not fit); with it, each call returns the next part
    ///  and the RPC stays around until all of it was received.
    ///
    /// If `deadline` passes while waiting, the call fails with [HomaError::Timeout].
    pub async fn receive(&self, id: Option<RpcId>, flags: RecvFlags, buf: &mut dyn RecvBuffer, deadline: Option<Instant>) -> Result<Completion, HomaError> {
        let target = match id {
            Some(id) if id.0 != 0 => RecvTarget::Id(id),
            _ => {
                if !flags.intersects(RecvFlags::REQUEST | RecvFlags::RESPONSE) {
                    return Err(HomaError::InvalidArgument("receive needs an RPC id, REQUEST or RESPONSE".to_string()));
                }
                RecvTarget::Queued
            }
        };
        self.do_receive(target, flags, buf, deadline).await
    }

    /// Receives whichever of the given RPCs is ready first
    pub async fn receive_any_of(&self, ids: &[RpcId], flags: RecvFlags, buf: &mut dyn RecvBuffer, deadline: Option<Instant>) -> Result<Completion, HomaError> {
        if ids.is_empty() {
            return Err(HomaError::InvalidArgument("no RPC ids to wait for".to_string()));
        }
        self.do_receive(RecvTarget::AnyOf(ids), flags, buf, deadline).await
    }

    async fn do_receive(&self, target: RecvTarget<'_>, flags: RecvFlags, buf: &mut dyn RecvBuffer, deadline: Option<Instant>) -> Result<Completion, HomaError> {
        loop {
            let notified = self.gateway.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_open()?;

            let attempt = match target {
                RecvTarget::Id(id) => self.try_receive_id(id, flags, buf).await,
                RecvTarget::AnyOf(ids) => self.try_receive_any_of(ids, flags, buf).await,
                RecvTarget::Queued => self.try_receive_queued(flags, buf).await,
            };
            if attempt.is_err() && self.gateway.is_shutdown() {
                // the RPCs were discarded by a concurrent shutdown
                return Err(HomaError::Shutdown);
            }
            if let Some(completion) = attempt? {
                return Ok(completion);
            }

            if flags.contains(RecvFlags::NONBLOCKING) {
                return Err(HomaError::WouldBlock);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(HomaError::Timeout);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn try_receive_id(&self, id: RpcId, flags: RecvFlags, buf: &mut dyn RecvBuffer) -> Result<Option<Completion>, HomaError> {
        let rpc = self.rpcs.find_client(id).await
            .ok_or(HomaError::NoSuchRpc(id.0))?;

        let (completion, ack) = {
            let mut rpc = rpc.lock().await;
            if rpc.state != RpcState::Ready || !self.gateway.claim(&rpc.key, false) {
                return Ok(None);
            }
            self.deliver(&mut rpc, flags, buf).await?
        };
        self.send_ack(ack).await;
        Ok(Some(completion))
    }

    async fn try_receive_any_of(&self, ids: &[RpcId], flags: RecvFlags, buf: &mut dyn RecvBuffer) -> Result<Option<Completion>, HomaError> {
        let mut num_missing = 0;
        for &id in ids {
            match self.try_receive_id(id, flags, buf).await {
                Ok(Some(completion)) => return Ok(Some(completion)),
                Ok(None) => {}
                Err(HomaError::NoSuchRpc(_)) => num_missing += 1,
                Err(e) => return Err(e),
            }
        }
        if num_missing == ids.len() {
            return Err(HomaError::NoSuchRpc(ids[0].0));
        }
        Ok(None)
    }

    async fn try_receive_queued(&self, flags: RecvFlags, buf: &mut dyn RecvBuffer) -> Result<Option<Completion>, HomaError> {
        while let Some(key) = self.gateway.pop(flags) {
            let Some(rpc) = self.rpcs.get(&key).await else {
                continue;
            };

            let (completion, ack) = {
                let mut rpc = rpc.lock().await;
                if rpc.state != RpcState::Ready {
                    continue;
                }
                self.deliver(&mut rpc, flags, buf).await?
            };
            self.send_ack(ack).await;
            return Ok(Some(completion));
        }
        Ok(None)
    }

    /// Hands a claimed `Ready` RPC to the application. Returns an ACK to be sent once the RPC's
    ///  lock is released.
    async fn deliver(&self, rpc: &mut HomaRpc, flags: RecvFlags, buf: &mut dyn RecvBuffer) -> Result<(Completion, Option<(SocketAddr, Packet)>), HomaError> {
        let is_request = !rpc.is_client();
        let mut completion = Completion {
            id: rpc.key.id,
            peer: rpc.key.peer,
            completion_cookie: rpc.completion_cookie,
            length: 0,
            message_length: rpc.msgin.as_ref().map(|m| m.declared_length()).unwrap_or(0),
            remaining: 0,
            error: rpc.error,
        };

        if let Some(error) = rpc.error {
            debug!("delivering failed RPC {:?}: {}", rpc.key, error);
            self.free_rpc(rpc).await;
            return Ok((completion, None));
        }

        let Some(msgin) = rpc.msgin.as_mut() else {
            warn!("ready RPC {:?} has no message - discarding", rpc.key);
            self.free_rpc(rpc).await;
            return Ok((completion, None));
        };

        match msgin.copy_to(buf) {
            Ok(n) => completion.length = n,
            Err(e) => {
                debug!("copying RPC {:?} to the application failed - keeping it ready: {}", rpc.key, e);
                self.gateway.requeue_front(rpc.key, is_request);
                return Err(e);
            }
        }

        if flags.contains(RecvFlags::PARTIAL) && !msgin.is_drained() {
            completion.remaining = msgin.declared_length() - msgin.copied_out();
            trace!("partial read of {:?}: {} bytes, {} remaining", rpc.key, completion.length, completion.remaining);
            self.gateway.requeue_front(rpc.key, is_request);
            return Ok((completion, None));
        }
        if !msgin.is_drained() {
            debug!("message of {:?} truncated to {} bytes", rpc.key, completion.length);
        }

        if is_request {
            rpc.state = RpcState::InService;
            rpc.msgin = None;
            rpc.heard_from_peer();
            Ok((completion, None))
        }
        else {
            let ack = Packet::new(self.port(), rpc.key.peer.port(), rpc.key.id, PacketBody::Ack);
            let peer = rpc.key.peer;
            self.free_rpc(rpc).await;
            Ok((completion, Some((peer, ack))))
        }
    }

    async fn send_ack(&self, ack: Option<(SocketAddr, Packet)>) {
        if let Some((to, packet)) = ack {
            self.core.send_control(to, packet).await;
        }
    }

    /// Aborts one of this endpoint's requests (by id), or all of them (no id, or id 0).
    ///
    /// An aborted RPC becomes ready with the given error, and the application receives it as
    ///  usual. Without an error, the RPC is discarded right away.
    pub async fn abort(&self, id: Option<RpcId>, error: Option<RpcError>) -> Result<(), HomaError> {
        self.check_open()?;

        match id {
            Some(id) if id.0 != 0 => {
                let rpc = self.rpcs.find_client(id).await
                    .ok_or(HomaError::NoSuchRpc(id.0))?;
                let mut rpc = rpc.lock().await;
                if rpc.is_terminal() {
                    return Err(HomaError::AlreadyCompleted(id.0));
                }
                self.abort_or_free(&mut rpc, error).await;
            }
            _ => {
                debug!("aborting all requests of endpoint {:?}", self.local_addr);
                for rpc in self.rpcs.snapshot().await {
                    let mut rpc = rpc.lock().await;
                    if !rpc.is_client() || rpc.is_terminal() {
                        continue;
                    }
                    self.abort_or_free(&mut rpc, error).await;
                }
            }
        }
        Ok(())
    }

    async fn abort_or_free(&self, rpc: &mut HomaRpc, error: Option<RpcError>) {
        match error {
            Some(error) => self.abort_rpc(rpc, error),
            None => self.free_rpc(rpc).await,
        }
    }

    /// Fails this endpoint's client RPCs to the host `addr` with `error`, and discards its server
    ///  RPCs from there. A `port` other than 0 restricts this to RPCs with that peer port.
    pub(crate) async fn abort_peer_rpcs(&self, addr: IpAddr, port: u16, error: RpcError) {
        for rpc in self.rpcs.snapshot().await {
            let mut rpc = rpc.lock().await;
            if rpc.key.peer.ip() != addr || (port != 0 && rpc.key.peer.port() != port) || rpc.state == RpcState::Dead {
                continue;
            }
            if rpc.is_client() {
                if rpc.state != RpcState::Ready {
                    self.abort_rpc(&mut rpc, error);
                }
            }
            else {
                debug!("discarding server RPC {:?}: {}", rpc.key, error);
                HomaMetrics::inc(&self.core.metrics.server_rpc_discards);
                self.free_rpc(&mut rpc).await;
            }
        }
    }

    /// [Endpoint::abort_peer_rpcs] for all endpoints of the Homa instance
    pub(crate) async fn abort_peer_everywhere(&self, addr: IpAddr, error: RpcError) {
        match self.ports.upgrade() {
            Some(ports) => Homa::abort_peer_in(&ports, addr, 0, error).await,
            None => self.abort_peer_rpcs(addr, 0, error).await,
        }
    }

    /// Closes the endpoint: waiters fail with [HomaError::Shutdown], all RPCs are discarded
    ///  and the port is released.
    pub async fn shutdown(&self) {
        if self.gateway.is_shutdown() {
            return;
        }
        self.gateway.shutdown();

        if let Some(ports) = self.ports.upgrade() {
            let mut ports = ports.write().await;
            if ports.get(&self.port()).is_some_and(|e| std::ptr::eq(Arc::as_ptr(e), self)) {
                ports.remove(&self.port());
            }
        }

        for rpc in self.rpcs.snapshot().await {
            self.free_rpc(&mut *rpc.lock().await).await;
        }
        debug!("endpoint {:?} shut down", self.local_addr);
    }

    /// Makes an RPC visible to the application.
    pub(crate) fn rpc_ready(&self, rpc: &mut HomaRpc) {
        rpc.state = RpcState::Ready;
        if let Some(msgin) = rpc.msgin.as_mut() {
            self.core.accountant.add(msgin.release_outstanding());
        }
        self.core.grants.remove(self.port(), &rpc.key);

        let is_request = !rpc.is_client();
        if is_request {
            HomaMetrics::inc(&self.core.metrics.requests_queued);
        }
        else {
            HomaMetrics::inc(&self.core.metrics.responses_queued);
        }
        self.core.timetrace.record("rpc {} ready", [rpc.key.id.0 as u32, 0, 0, 0]);
        trace!("RPC {:?} is ready", rpc.key);
        self.gateway.enqueue(rpc.key, is_request);
    }

    pub(crate) fn abort_rpc(&self, rpc: &mut HomaRpc, error: RpcError) {
        debug!("aborting RPC {:?}: {}", rpc.key, error);
        rpc.error = Some(error);
        self.rpc_ready(rpc);
    }

    /// Discards an RPC. Its lock must be held by the caller, which may be the RPC's last user.
    pub(crate) async fn free_rpc(&self, rpc: &mut HomaRpc) {
        if rpc.state == RpcState::Dead {
            return;
        }
        trace!("freeing RPC {:?}", rpc.key);
        rpc.state = RpcState::Dead;
        if let Some(msgin) = rpc.msgin.as_mut() {
            self.core.accountant.add(msgin.release_outstanding());
        }
        self.core.grants.remove(self.port(), &rpc.key);
        self.gateway.forget(&rpc.key);
        self.rpcs.remove(&rpc.key).await;
        self.gateway.wake_all();
    }

    pub(crate) fn data_packets(&self, key: &RpcKey, length: usize, granted: usize, segments: Vec<(usize, Bytes)>, flags: DataFlags) -> Vec<(usize, Packet)> {
        segments.into_iter()
            .map(|(offset, payload)| (offset, Packet::new(
                self.port(),
                key.peer.port(),
                key.id,
                PacketBody::Data {
                    header: DataHeader {
                        message_length: length as u32,
                        incoming: granted as u32,
                        offset: offset as u32,
                        flags,
                    },
                    payload,
                },
            )))
            .collect()
    }

    /// Transmits the RPC's outgoing segments that are granted but not sent yet
    pub(crate) async fn xmit_data(&self, rpc_ref: &RpcRef) {
        let (peer, packets) = {
            let mut rpc = rpc_ref.lock().await;
            if rpc.is_terminal() {
                return;
            }
            let is_client = rpc.is_client();
            let Some(msgout) = rpc.msgout.as_mut() else {
                return;
            };
            let segments = msgout.next_segments();
            let length = msgout.length();
            let granted = msgout.granted();
            let fully_transmitted = msgout.is_fully_transmitted();
            if fully_transmitted && is_client && rpc.state == RpcState::Outgoing {
                rpc.state = RpcState::Incoming;
            }
            (rpc.key.peer, self.data_packets(&rpc.key, length, granted, segments, DataFlags::empty()))
        };

        for (offset, packet) in packets {
            match self.core.transmit(peer, &packet).await {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => {
                    let mut rpc = rpc_ref.lock().await;
                    if let Some(msgout) = rpc.msgout.as_mut() {
                        msgout.rewind_to(offset);
                    }
                    if rpc.is_client() && rpc.state == RpcState::Incoming && rpc.msgin.is_none() {
                        rpc.state = RpcState::Outgoing;
                    }
                    return;
                }
                Err(HomaError::HostUnreachable) => {
                    self.abort_peer_everywhere(peer.ip(), RpcError::PeerUnreachable).await;
                    return;
                }
                Err(_) => {}
            }
        }
    }
}
