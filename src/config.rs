use std::time::Duration;

use anyhow::bail;

/// Tunables for a [crate::homa::Homa] instance. All endpoints bound to the same instance share
///  one configuration.
#[derive(Debug, Clone)]
pub struct HomaConfig {
    /// The number of bytes a sender may transmit for a message before it needs explicit grants
    ///  from the receiver. This is roughly the bandwidth-delay product of the network, and it is
    ///  also the window by which the receiver advances a grant.
    pub rtt_bytes: u32,

    /// The receiver grants to at most this many messages 'worth' of [HomaConfig::rtt_bytes]
    ///  concurrently, i.e. the limit for the total number of granted but not yet received bytes
    ///  is `max_overcommit * rtt_bytes`.
    pub max_overcommit: u32,

    /// Payload bytes per DATA packet. Outgoing messages are split into segments of this size.
    ///
    /// NB: This is a payload size, header bytes are added on top, so it should leave room
    ///  for headers inside the network's MTU.
    pub max_segment_payload: usize,

    /// Messages longer than this are rejected when they are sent.
    pub max_message_length: usize,

    /// The upper bound of GRANT packets issued in one pass over the grantable messages.
    pub max_grants_per_round: usize,

    /// The number of priority levels the grant scheduler may assign (higher is more urgent).
    pub num_priorities: u8,

    /// The share of granted bytes, in thousandths, that goes to the oldest incoming message
    ///  rather than to the one with the fewest remaining bytes. 0 disables these 'FIFO' grants;
    ///  the maximum is 500.
    pub grant_fifo_fraction: u32,

    /// The number of bytes a single FIFO grant adds to a message's grant
    pub fifo_grant_increment: u32,

    /// The interval between two timer ticks
    pub timer_interval: Duration,

    /// An RPC that has not heard from its peer for this many ticks starts requesting resends.
    pub resend_ticks: u32,

    /// Once RESEND packets are being sent for an RPC, they are repeated every this many ticks.
    pub resend_interval: u32,

    /// An RPC is aborted with a timeout after this many RESEND packets went unanswered.
    pub abort_resends: u32,

    /// The UDP port peers' Homa instances listen on. This is only used by the UDP based packet
    ///  I/O, it has no meaning for the protocol itself.
    pub udp_port: u16,

    /// The maximum number of datagrams the UDP receiver collects into one batch before handing
    ///  them to the incoming scheduler.
    pub max_batch_size: usize,
}

impl Default for HomaConfig {
    fn default() -> Self {
        HomaConfig {
            rtt_bytes: 10_000,
            max_overcommit: 8,
            max_segment_payload: 1400,
            max_message_length: 1_000_000,
            max_grants_per_round: 10,
            num_priorities: 8,
            grant_fifo_fraction: 50,
            fifo_grant_increment: 10_000,
            timer_interval: Duration::from_millis(1),
            resend_ticks: 15,
            resend_interval: 10,
            abort_resends: 10,
            udp_port: 4000,
            max_batch_size: 64,
        }
    }
}

impl HomaConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rtt_bytes == 0 {
            bail!("rtt_bytes must be greater than 0");
        }
        if self.max_overcommit == 0 {
            bail!("max_overcommit must be greater than 0");
        }
        if self.max_segment_payload == 0 || self.max_segment_payload > 65_000 {
            bail!("max_segment_payload must be in the range 1..=65000, is {}", self.max_segment_payload);
        }
        if self.max_message_length == 0 || self.max_message_length > u32::MAX as usize {
            bail!("max_message_length must be in the range 1..=u32::MAX, is {}", self.max_message_length);
        }
        if self.max_grants_per_round == 0 {
            bail!("max_grants_per_round must be greater than 0");
        }
        if self.num_priorities == 0 || self.num_priorities > 8 {
            bail!("num_priorities must be in the range 1..=8, is {}", self.num_priorities);
        }
        if self.grant_fifo_fraction > 500 {
            bail!("grant_fifo_fraction must be at most 500, is {}", self.grant_fifo_fraction);
        }
        if self.grant_fifo_fraction > 0 && self.fifo_grant_increment == 0 {
            bail!("fifo_grant_increment must be greater than 0 when FIFO grants are enabled");
        }
        if self.timer_interval.is_zero() {
            bail!("timer_interval must not be zero");
        }
        if self.resend_interval == 0 {
            bail!("resend_interval must be greater than 0");
        }
        if self.max_batch_size == 0 {
            bail!("max_batch_size must be greater than 0");
        }
        Ok(())
    }

    /// The limit for the total number of granted but not yet received bytes
    pub fn max_incoming(&self) -> i64 {
        self.max_overcommit as i64 * self.rtt_bytes as i64
    }

    /// The number of bytes of a message of the given length that are sent without waiting for
    ///  a grant
    pub fn unscheduled_bytes(&self, message_length: usize) -> usize {
        message_length.min(self.rtt_bytes as usize)
    }

    /// The number of bytes granted by rank between two FIFO grants, 0 if FIFO grants are
    ///  disabled
    pub fn grant_nonfifo(&self) -> i64 {
        if self.grant_fifo_fraction == 0 {
            return 0;
        }
        let increment = self.fifo_grant_increment as i64;
        1000 * increment / self.grant_fifo_fraction as i64 - increment
    }

    /// The silent-tick count at which an RPC is given up on
    pub fn abort_ticks(&self) -> u32 {
        self.resend_ticks + self.abort_resends * self.resend_interval
    }
}
