use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

use crate::error::{errno, HomaError};

/// The transmit side of raw packet I/O, introduced to facilitate mocking the network away for
///  testing.
///
/// `to` is the peer's address with its Homa port. Running out of buffers is reported as
///  [HomaError::NoBufferSpace], which callers treat as 'not sent yet' rather than as loss.
///  [HomaError::HostUnreachable] gives up on all RPCs with the peer's host.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSender: Send + Sync + 'static {
    async fn transmit(&self, to: SocketAddr, packet: Bytes) -> Result<(), HomaError>;
}

/// Signals 'destination unreachable' back to the sender of a packet that was addressed to a
///  port without an endpoint
#[cfg_attr(test, automock)]
pub trait UnreachableNotifier: Send + Sync + 'static {
    /// `source` is the packet's sender (with its Homa port), `dport` the port nobody listens on
    fn destination_unreachable(&self, source: SocketAddr, dport: u16);
}

/// Sends Homa packets as UDP datagrams. All peers' Homa instances are expected to listen on the
///  same UDP port, Homa ports are multiplexed inside the packet header.
pub struct UdpPacketSender {
    socket: Arc<UdpSocket>,
    peer_udp_port: u16,
}

impl UdpPacketSender {
    pub fn new(socket: Arc<UdpSocket>, peer_udp_port: u16) -> UdpPacketSender {
        UdpPacketSender { socket, peer_udp_port }
    }
}

#[async_trait]
impl PacketSender for UdpPacketSender {
    async fn transmit(&self, to: SocketAddr, packet: Bytes) -> Result<(), HomaError> {
        let udp_addr = SocketAddr::new(to.ip(), self.peer_udp_port);
        trace!("UDP socket: sending packet to {:?}", udp_addr);

        match self.socket.send_to(&packet, udp_addr).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::OutOfMemory || e.raw_os_error() == Some(errno::ENOBUFS) => {
                debug!("no buffer space for sending UDP packet to {:?}: {}", udp_addr, e);
                Err(HomaError::NoBufferSpace)
            }
            Err(e) if matches!(e.raw_os_error(), Some(errno::EHOSTUNREACH) | Some(errno::ENETUNREACH)) => {
                debug!("UDP destination {:?} is unreachable: {}", udp_addr, e);
                Err(HomaError::HostUnreachable)
            }
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", udp_addr, e);
                Err(HomaError::Transmit(e.to_string()))
            }
        }
    }
}

/// There is no portable way to emit ICMP from user space, so this notifier only logs
#[derive(Debug, Default)]
pub struct LoggingUnreachableNotifier;

impl UnreachableNotifier for LoggingUnreachableNotifier {
    fn destination_unreachable(&self, source: SocketAddr, dport: u16) {
        debug!("packet from {:?} for port {} which has no endpoint - destination unreachable", source, dport);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, PacketBody};
    use crate::rpc::RpcId;

    #[tokio::test]
    async fn test_udp_transmit() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_port = receiver.local_addr().unwrap().port();

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sender = UdpPacketSender::new(socket, udp_port);

        let packet = Packet::new(1, 500, RpcId(2), PacketBody::Busy).to_bytes();
        sender.transmit(SocketAddr::from(([127, 0, 0, 1], 500)), packet.clone()).await.unwrap();

        let mut buf = [0u8; 100];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], packet.as_ref());
    }
}
