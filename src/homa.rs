use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace};

use crate::accounting::IncomingAccountant;
use crate::config::HomaConfig;
use crate::endpoint::Endpoint;
use crate::error::{HomaError, RpcError};
use crate::grant::GrantScheduler;
use crate::metrics::{HomaMetrics, MetricsSnapshot};
use crate::packet::Packet;
use crate::packet_io::{PacketSender, UnreachableNotifier};
use crate::rpc::RpcId;
use crate::timetrace::TimeTrace;

/// bound endpoints by port
pub type PortMap = RwLock<FxHashMap<u16, Arc<Endpoint>>>;

/// State shared by all endpoints of a [Homa] instance
pub struct HomaCore {
    pub config: HomaConfig,
    pub accountant: Arc<IncomingAccountant>,
    pub grants: GrantScheduler,
    pub metrics: HomaMetrics,
    pub timetrace: Arc<TimeTrace>,
    pub(crate) unreachable: Arc<dyn UnreachableNotifier>,
    sender: Arc<dyn PacketSender>,
    next_client_id: AtomicU64,
    next_birth: AtomicU64,
}

impl HomaCore {
    /// client ids are even, see [RpcId]
    pub fn next_client_id(&self) -> RpcId {
        RpcId(self.next_client_id.fetch_add(2, Ordering::Relaxed))
    }

    pub fn next_birth(&self) -> u64 {
        self.next_birth.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn transmit(&self, to: SocketAddr, packet: &Packet) -> Result<(), HomaError> {
        trace!("sending {:?} to {:?}", packet, to);
        if let Some(packet_type) = packet.packet_type() {
            self.metrics.packet_sent(packet_type);
        }

        let result = self.sender.transmit(to, packet.to_bytes()).await;
        match &result {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                debug!("transmit buffers exhausted sending {} to {:?}", packet, to);
                HomaMetrics::inc(&self.metrics.xmit_exhausted);
            }
            Err(HomaError::HostUnreachable) => {
                debug!("{:?} is unreachable, not sending {}", to, packet);
                HomaMetrics::inc(&self.metrics.xmit_errors);
            }
            Err(e) => {
                error!("error sending {} to {:?}: {}", packet, to, e);
                HomaMetrics::inc(&self.metrics.xmit_errors);
            }
        }
        result
    }

    /// Sends a control packet. A control packet that cannot be sent is treated as lost, the
    ///  timer takes care of that.
    pub async fn send_control(&self, to: SocketAddr, packet: Packet) {
        self.transmit(to, &packet).await.ok();
    }

    pub async fn send_grants(&self) {
        let grants = self.grants.compute_grants(&self.config, &self.accountant).await;
        for (to, packet) in grants {
            self.send_control(to, packet).await;
        }
    }
}

/// A Homa instance: the process-wide state shared by a set of endpoints, and the entry point
///  for packets arriving from the network.
pub struct Homa {
    pub(crate) core: Arc<HomaCore>,
    pub(crate) ports: Arc<PortMap>,
    timer_handle: Option<JoinHandle<()>>,
}

impl Drop for Homa {
    fn drop(&mut self) {
        if let Some(handle) = &self.timer_handle {
            handle.abort();
        }
    }
}

impl Homa {
    pub fn new(config: HomaConfig, sender: Arc<dyn PacketSender>, unreachable: Arc<dyn UnreachableNotifier>) -> anyhow::Result<Homa> {
        let accountant = Arc::new(IncomingAccountant::new(config.max_incoming()));
        Self::with_accountant(config, accountant, sender, unreachable)
    }

    /// NB: the accountant's `max_incoming` takes precedence over the one derived from `config`
    pub fn with_accountant(config: HomaConfig, accountant: Arc<IncomingAccountant>, sender: Arc<dyn PacketSender>, unreachable: Arc<dyn UnreachableNotifier>) -> anyhow::Result<Homa> {
        config.validate()?;

        Ok(Homa {
            core: Arc::new(HomaCore {
                config,
                accountant,
                grants: GrantScheduler::new(),
                metrics: HomaMetrics::default(),
                timetrace: Arc::new(TimeTrace::default()),
                unreachable,
                sender,
                next_client_id: AtomicU64::new(2),
                next_birth: AtomicU64::new(0),
            }),
            ports: Default::default(),
            timer_handle: None,
        })
    }

    pub fn config(&self) -> &HomaConfig {
        &self.core.config
    }

    pub fn accountant(&self) -> &Arc<IncomingAccountant> {
        &self.core.accountant
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    pub fn timetrace(&self) -> &Arc<TimeTrace> {
        &self.core.timetrace
    }

    /// Gives up on all RPCs with the peer host `addr`, e.g. once it is known to be unreachable.
    ///  Client RPCs become ready with `error`, server RPCs are discarded. A `port` other than 0
    ///  restricts this to RPCs with that peer port.
    pub async fn abort_peer(&self, addr: IpAddr, port: u16, error: RpcError) {
        Self::abort_peer_in(&self.ports, addr, port, error).await
    }

    pub(crate) async fn abort_peer_in(ports: &PortMap, addr: IpAddr, port: u16, error: RpcError) {
        debug!("aborting RPCs with {:?} (port {}): {}", addr, port, error);
        let endpoints: Vec<_> = ports.read().await
            .values()
            .cloned()
            .collect();
        for endpoint in endpoints {
            endpoint.abort_peer_rpcs(addr, port, error).await;
        }
    }

    /// Creates an endpoint for the given local address. The address family of `local_addr`
    ///  determines which peers the endpoint can talk to.
    pub async fn bind(&self, local_addr: SocketAddr) -> Result<Arc<Endpoint>, HomaError> {
        let port = local_addr.port();
        if port == 0 {
            return Err(HomaError::InvalidArgument("port 0 can not be bound".to_string()));
        }

        let mut ports = self.ports.write().await;
        if ports.contains_key(&port) {
            return Err(HomaError::PortInUse(port));
        }
        let endpoint = Arc::new(Endpoint::new(local_addr, self.core.clone(), Arc::downgrade(&self.ports)));
        ports.insert(port, endpoint.clone());
        info!("bound endpoint {:?}", local_addr);
        Ok(endpoint)
    }

    pub async fn endpoint(&self, port: u16) -> Option<Arc<Endpoint>> {
        self.ports.read().await
            .get(&port)
            .cloned()
    }

    /// Starts calling [Homa::tick] in the configured interval until this instance is dropped
    pub fn spawn_timer(&mut self) {
        if self.timer_handle.is_some() {
            return;
        }
        let ports = self.ports.clone();
        let interval = self.core.config.timer_interval;
        self.timer_handle = Some(tokio::spawn(async move {
            let mut ticks = time::interval(interval);
            ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                Self::tick_ports(&ports).await;
            }
        }));
    }

    /// Receives datagrams from a UDP socket and feeds them to [Homa::handle_batch]. Datagrams
    ///  that are already queued when one arrives are collected into the same batch.
    pub async fn run_udp_receiver(&self, socket: Arc<UdpSocket>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; 65_536];
        loop {
            let mut batch = Vec::new();
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => batch.push((from.ip(), Bytes::copy_from_slice(&buf[..n]))),
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            }
            while batch.len() < self.core.config.max_batch_size {
                match socket.try_recv_from(&mut buf) {
                    Ok((n, from)) => batch.push((from.ip(), Bytes::copy_from_slice(&buf[..n]))),
                    Err(_) => break,
                }
            }
            self.handle_batch(batch).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{test_homa, TrackingPacketSender};
    use crate::packet_io::LoggingUnreachableNotifier;
    use rstest::rstest;

    #[tokio::test]
    async fn test_bind() {
        let (homa, _) = test_homa(HomaConfig::default());
        let endpoint = homa.bind(SocketAddr::from(([127, 0, 0, 1], 500))).await.unwrap();
        assert_eq!(endpoint.port(), 500);
        assert!(homa.endpoint(500).await.is_some());
        assert!(homa.endpoint(501).await.is_none());
    }

    #[rstest]
    #[case::port_zero(vec![], 0, HomaError::InvalidArgument("port 0 can not be bound".to_string()))]
    #[case::in_use(vec![500], 500, HomaError::PortInUse(500))]
    fn test_bind_rejected(#[case] bound: Vec<u16>, #[case] port: u16, #[case] expected: HomaError) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (homa, _) = test_homa(HomaConfig::default());
            for p in bound {
                homa.bind(SocketAddr::from(([127, 0, 0, 1], p))).await.unwrap();
            }
            let result = homa.bind(SocketAddr::from(([127, 0, 0, 1], port))).await;
            assert_eq!(result.err(), Some(expected));
        });
    }

    #[test]
    fn test_invalid_config() {
        let result = Homa::new(
            HomaConfig { rtt_bytes: 0, ..HomaConfig::default() },
            TrackingPacketSender::new(),
            Arc::new(LoggingUnreachableNotifier),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_client_ids_are_even_and_increasing() {
        let (homa, _) = test_homa(HomaConfig::default());
        let a = homa.core.next_client_id();
        let b = homa.core.next_client_id();
        assert!(a.is_client() && b.is_client());
        assert!(b > a);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_timer_ticks() {
        let config = HomaConfig {
            timer_interval: std::time::Duration::from_millis(1),
            resend_ticks: 2,
            resend_interval: 1,
            abort_resends: 3,
            ..HomaConfig::default()
        };
        let (mut homa, sender) = test_homa(config);
        let endpoint = homa.bind(SocketAddr::from(([127, 0, 0, 1], 500))).await.unwrap();
        endpoint.send(SocketAddr::from(([127, 0, 0, 2], 99)), Bytes::from_static(b"hello"), 0).await.unwrap();
        sender.sent_summary();

        homa.spawn_timer();
        time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(sender.sent_summary().iter().any(|s| s.starts_with("RESEND")));
        assert_eq!(homa.metrics().client_rpc_timeouts, 1);
    }

    #[tokio::test]
    async fn test_udp_receiver() {
        let (homa, _) = test_homa(HomaConfig::default());
        let homa = Arc::new(homa);
        homa.bind(SocketAddr::from(([127, 0, 0, 1], 500))).await.unwrap();

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let h = homa.clone();
        let receiver = tokio::spawn(async move { h.run_udp_receiver(socket).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&crate::test_util::data_packet(40, 500, 1000, 100, 100, 0, 100), addr).await.unwrap();

        let endpoint = homa.endpoint(500).await.unwrap();
        for _ in 0..100 {
            if endpoint.num_rpcs().await == 1 {
                break;
            }
            time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(endpoint.num_rpcs().await, 1);
        receiver.abort();
    }
}
