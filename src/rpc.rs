use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use bytes::Bytes;

use crate::config::HomaConfig;
use crate::error::RpcError;
use crate::segments::{IncomingMessage, OutgoingMessage};

/// An RPC's id on one side of the exchange. The client allocates even ids; the server's id for
///  the same RPC is the client's id with the low bit set, so ids never collide between the
///  client and the server role of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcId(pub u64);
impl RpcId {
    pub fn is_client(&self) -> bool {
        self.0 & 1 == 0
    }

    /// the peer's id for the same RPC
    pub fn peer_id(&self) -> RpcId {
        RpcId(self.0 ^ 1)
    }
}
impl Display for RpcId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies an RPC in an endpoint's table. `peer` is the peer's address with its Homa port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcKey {
    pub peer: SocketAddr,
    pub id: RpcId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcRole {
    Client,
    Server,
}

/// see [HomaRpc] for the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    /// sending a request (client) or reply (server)
    Outgoing,
    /// receiving a response (client) or request (server)
    Incoming,
    /// the server application received the request and owes a reply
    InService,
    /// a complete message or an error waits to be received by the application
    Ready,
    Dead,
}

/// One client request/response exchange, or the handling of one request on the server.
///
/// Client: `Outgoing` -> `Incoming` (request fully transmitted or first response byte) ->
///  `Ready` (response complete, or failed) -> `Dead` (received by the application).
///
/// Server: `Incoming` -> `Ready` (request complete) -> `InService` (received by the
///  application) -> `Outgoing` (reply) -> `Dead` (acknowledged by the client).
#[derive(Debug)]
pub struct HomaRpc {
    pub key: RpcKey,
    pub role: RpcRole,
    pub state: RpcState,
    pub msgout: Option<OutgoingMessage>,
    pub msgin: Option<IncomingMessage>,
    pub error: Option<RpcError>,
    pub completion_cookie: u64,
    /// timer ticks since the last packet from the peer
    pub silent_ticks: u32,
    pub num_resends: u32,
    /// creation sequence number, the tie breaker for grant ranking
    pub birth: u64,
}

impl HomaRpc {
    pub fn new_client(key: RpcKey, payload: Bytes, completion_cookie: u64, config: &HomaConfig, birth: u64) -> HomaRpc {
        let unscheduled = config.unscheduled_bytes(payload.len());
        HomaRpc {
            key,
            role: RpcRole::Client,
            state: RpcState::Outgoing,
            msgout: Some(OutgoingMessage::new(payload, config.max_segment_payload, unscheduled)),
            msgin: None,
            error: None,
            completion_cookie,
            silent_ticks: 0,
            num_resends: 0,
            birth,
        }
    }

    pub fn new_server(key: RpcKey, birth: u64) -> HomaRpc {
        HomaRpc {
            key,
            role: RpcRole::Server,
            state: RpcState::Incoming,
            msgout: None,
            msgin: None,
            error: None,
            completion_cookie: 0,
            silent_ticks: 0,
            num_resends: 0,
            birth,
        }
    }

    pub fn is_client(&self) -> bool {
        self.role == RpcRole::Client
    }

    /// true once the application can see the RPC's outcome (or nothing is left to see)
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RpcState::Ready | RpcState::Dead)
    }

    /// this RPC's share of the process-wide incoming counter
    pub fn outstanding_incoming(&self) -> i64 {
        self.msgin.as_ref()
            .map(|m| m.outstanding())
            .unwrap_or(0)
    }

    /// a packet from the peer shows it is alive
    pub fn heard_from_peer(&mut self) {
        self.silent_ticks = 0;
        self.num_resends = 0;
    }
}
