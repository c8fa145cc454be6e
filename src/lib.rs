//! The transport engine of Homa, an RPC oriented network protocol that keeps tail latency of
//!  short messages low when they share the network with long bulk transfers.
//!
//! A [homa::Homa] instance holds the process-wide state: configuration, the total of granted
//!  but not yet received bytes, the grant scheduler and diagnostics. Applications
//!  [bind](homa::Homa::bind) [endpoints](endpoint::Endpoint) to local ports and use them to send
//!  requests, receive requests and responses, and reply.
//!
//! Messages are split into segments of [config::HomaConfig::max_segment_payload] bytes. The
//!  first [config::HomaConfig::rtt_bytes] bytes of a message are sent right away ('unscheduled');
//!  the receiver grants the rest step by step, preferring messages with the fewest bytes still
//!  to go, and bounding the total of outstanding grants.
//!
//! Packets from the network are passed to [homa::Homa::handle_batch] in batches. Each batch is
//!  reordered so that packets of short messages are handled first. Packet transmission is
//!  abstracted by [packet_io::PacketSender]; [packet_io::UdpPacketSender] and
//!  [homa::Homa::run_udp_receiver] carry Homa packets over UDP.
//!
//! Lost packets are detected by the periodic [timer](homa::Homa::tick): an RPC whose peer is
//!  silent for a while requests retransmission, and is eventually given up on.

pub mod accounting;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod gateway;
pub mod grant;
pub mod homa;
pub mod incoming;
pub mod metrics;
pub mod packet;
pub mod packet_io;
pub mod rpc;
pub mod rpc_table;
pub mod segments;
pub mod test_util;
pub mod timer;
pub mod timetrace;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            // .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
