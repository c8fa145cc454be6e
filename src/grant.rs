use std::net::SocketAddr;
use std::sync::Mutex;

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::accounting::IncomingAccountant;
use crate::config::HomaConfig;
use crate::packet::{Packet, PacketBody};
use crate::rpc::{RpcKey, RpcState};
use crate::rpc_table::RpcRef;

#[derive(Clone)]
struct GrantCandidate {
    /// the local endpoint's port
    sport: u16,
    key: RpcKey,
    rpc: RpcRef,
}

/// Receiver-driven flow control for messages that are longer than their unscheduled part.
///
/// Incoming messages that need grants are registered here. Each round ranks them by the number
///  of bytes they still need (fewest first, older messages first on ties) and grants to the
///  top-ranked message of each peer host, as long as the total of granted but not received
///  bytes stays below `max_incoming`.
///
/// Ranking by remaining bytes can starve long messages. So once
///  [HomaConfig::grant_nonfifo] bytes were granted this way, a round additionally grants
///  [HomaConfig::fifo_grant_increment] bytes to the oldest message.
#[derive(Default)]
pub struct GrantScheduler {
    grantable: Mutex<Vec<GrantCandidate>>,
    /// held for the duration of a round; the bytes left to grant before the next FIFO grant
    round: tokio::sync::Mutex<Option<i64>>,
}

impl GrantScheduler {
    pub fn new() -> GrantScheduler {
        Default::default()
    }

    pub fn add(&self, sport: u16, key: RpcKey, rpc: RpcRef) {
        let mut grantable = self.grantable.lock().unwrap();
        if !grantable.iter().any(|c| c.sport == sport && c.key == key) {
            grantable.push(GrantCandidate { sport, key, rpc });
        }
    }

    pub fn remove(&self, sport: u16, key: &RpcKey) {
        self.grantable.lock().unwrap()
            .retain(|c| !(c.sport == sport && &c.key == key));
    }

    pub fn len(&self) -> usize {
        self.grantable.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one grant round, updating the grantees' `incoming` and the accountant. The returned
    ///  GRANT packets are to be transmitted by the caller (after all RPC locks are released).
    ///
    /// NB: RPC locks are acquired one at a time while this method runs, so callers must not hold
    ///  any RPC lock.
    pub async fn compute_grants(&self, config: &HomaConfig, accountant: &IncomingAccountant) -> Vec<(SocketAddr, Packet)> {
        let mut round = self.round.lock().await;
        let nonfifo_left = round.get_or_insert_with(|| config.grant_nonfifo());

        let candidates = self.grantable.lock().unwrap().clone();
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut ranked = Vec::with_capacity(candidates.len());
        for c in candidates {
            let rpc = c.rpc.lock().await;
            if rpc.state != RpcState::Incoming {
                continue;
            }
            if let Some(msgin) = &rpc.msgin {
                if msgin.needs_grant() {
                    ranked.push((msgin.bytes_remaining(), rpc.birth, c.clone()));
                }
            }
        }
        ranked.sort_by_key(|(remaining, birth, _)| (*remaining, *birth));

        let mut available = accountant.available();
        let mut granted_hosts = FxHashSet::default();
        let mut granted = FxHashSet::default();
        let mut fully_granted = Vec::new();
        let mut result = Vec::new();

        for (_, _, c) in &ranked {
            if available <= 0 || result.len() >= config.max_grants_per_round {
                break;
            }
            if granted_hosts.contains(&c.key.peer.ip()) {
                continue;
            }

            let mut rpc = c.rpc.lock().await;
            if rpc.state != RpcState::Incoming {
                continue;
            }
            let Some(msgin) = rpc.msgin.as_mut() else {
                continue;
            };

            let new_grant = (msgin.bytes_received() + config.rtt_bytes as usize).min(msgin.declared_length());
            let increment = (new_grant as i64 - msgin.incoming() as i64).min(available);
            if increment <= 0 {
                continue;
            }
            let new_incoming = msgin.incoming() + increment as usize;
            let delta = msgin.grant(new_incoming);
            accountant.add(delta);
            available -= delta;
            *nonfifo_left -= delta;
            granted_hosts.insert(c.key.peer.ip());
            granted.insert((c.sport, c.key));
            if !msgin.needs_grant() {
                fully_granted.push((c.sport, c.key));
            }

            let priority = (config.num_priorities as usize - 1).saturating_sub(result.len()) as u8;
            trace!("granting {:?} up to {} with priority {}", c.key, new_incoming, priority);
            result.push(grant_packet(c, new_incoming, priority));
        }

        if *nonfifo_left <= 0 && config.grant_fifo_fraction > 0 {
            *nonfifo_left += config.grant_nonfifo();
            if accountant.available() > 0 {
                let mut by_age: Vec<_> = ranked.iter()
                    .filter(|(_, _, c)| !granted.contains(&(c.sport, c.key)))
                    .collect();
                by_age.sort_by_key(|(_, birth, _)| *birth);

                for (_, _, c) in by_age {
                    let mut rpc = c.rpc.lock().await;
                    if rpc.state != RpcState::Incoming {
                        continue;
                    }
                    let Some(msgin) = rpc.msgin.as_mut() else {
                        continue;
                    };
                    // the previous FIFO grant was not used up yet
                    if !msgin.needs_grant() || msgin.outstanding() > config.rtt_bytes as i64 {
                        continue;
                    }

                    let new_incoming = (msgin.incoming() + config.fifo_grant_increment as usize).min(msgin.declared_length());
                    accountant.add(msgin.grant(new_incoming));
                    if !msgin.needs_grant() {
                        fully_granted.push((c.sport, c.key));
                    }
                    trace!("FIFO grant for {:?} up to {}", c.key, new_incoming);
                    result.push(grant_packet(c, new_incoming, config.num_priorities - 1));
                    break;
                }
            }
        }

        for (sport, key) in fully_granted {
            self.remove(sport, &key);
        }
        result
    }
}

fn grant_packet(c: &GrantCandidate, offset: usize, priority: u8) -> (SocketAddr, Packet) {
    (c.key.peer, Packet::new(
        c.sport,
        c.key.peer.port(),
        c.key.id,
        PacketBody::Grant { offset: offset as u32, priority },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{HomaRpc, RpcId};
    use crate::segments::IncomingMessage;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    fn incoming_rpc(host: u8, id: u64, length: usize, received: usize, birth: u64, accountant: &IncomingAccountant) -> (RpcKey, RpcRef) {
        let key = RpcKey { peer: SocketAddr::from(([10, 0, 0, host], 40)), id: RpcId(id) };
        let mut rpc = HomaRpc::new_server(key, birth);
        let mut msgin = IncomingMessage::new(length, 10_000);
        msgin.add_segment(0, Bytes::from(vec![0u8; received]));
        accountant.add(msgin.outstanding());
        rpc.msgin = Some(msgin);
        (key, Arc::new(AsyncMutex::new(rpc)))
    }

    fn config() -> HomaConfig {
        HomaConfig { rtt_bytes: 10_000, max_overcommit: 8, num_priorities: 8, ..HomaConfig::default() }
    }

    fn summary(grants: &[(SocketAddr, Packet)]) -> Vec<(RpcId, String)> {
        grants.iter()
            .map(|(_, p)| (p.common.sender_id, p.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_grants_ranked_by_remaining_bytes() {
        let accountant = IncomingAccountant::new(config().max_incoming());
        let scheduler = GrantScheduler::new();
        let (k1, r1) = incoming_rpc(1, 101, 50_000, 1400, 0, &accountant);
        let (k2, r2) = incoming_rpc(2, 201, 20_000, 1400, 1, &accountant);
        scheduler.add(99, k1, r1.clone());
        scheduler.add(99, k2, r2);

        let grants = scheduler.compute_grants(&config(), &accountant).await;
        assert_eq!(summary(&grants), vec![
            (RpcId(201), "GRANT 11400@7".to_string()),
            (RpcId(101), "GRANT 11400@6".to_string()),
        ]);
        assert_eq!(grants[0].0, k2.peer);
        assert_eq!(grants[0].1.common.sport, 99);
        assert_eq!(accountant.total(), 2 * 10_000);
        assert_eq!(r1.lock().await.msgin.as_ref().unwrap().incoming(), 11_400);
    }

    #[tokio::test]
    async fn test_one_grant_per_host() {
        let accountant = IncomingAccountant::new(config().max_incoming());
        let scheduler = GrantScheduler::new();
        let (k1, r1) = incoming_rpc(1, 101, 50_000, 1400, 0, &accountant);
        let (k2, r2) = incoming_rpc(1, 203, 30_000, 1400, 1, &accountant);
        scheduler.add(99, k1, r1);
        scheduler.add(99, k2, r2);

        let grants = scheduler.compute_grants(&config(), &accountant).await;
        assert_eq!(summary(&grants), vec![(RpcId(203), "GRANT 11400@7".to_string())]);
    }

    #[tokio::test]
    async fn test_grant_limited_by_max_incoming() {
        let config = config();
        let accountant = IncomingAccountant::new(9000);
        let scheduler = GrantScheduler::new();
        let (k1, r1) = incoming_rpc(1, 101, 50_000, 1400, 0, &accountant);
        scheduler.add(99, k1, r1);

        let grants = scheduler.compute_grants(&config, &accountant).await;
        assert_eq!(summary(&grants), vec![(RpcId(101), "GRANT 10400@7".to_string())]);
        assert_eq!(accountant.available(), 0);

        assert!(scheduler.compute_grants(&config, &accountant).await.is_empty());
    }

    #[tokio::test]
    async fn test_fully_granted_message_leaves_scheduler() {
        let accountant = IncomingAccountant::new(config().max_incoming());
        let scheduler = GrantScheduler::new();
        let (k1, r1) = incoming_rpc(1, 101, 12_000, 5000, 0, &accountant);
        scheduler.add(99, k1, r1);

        let grants = scheduler.compute_grants(&config(), &accountant).await;
        assert_eq!(summary(&grants), vec![(RpcId(101), "GRANT 12000@7".to_string())]);
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_priority_counts_only_granted_messages() {
        let accountant = IncomingAccountant::new(config().max_incoming());
        let scheduler = GrantScheduler::new();
        let (k1, r1) = incoming_rpc(1, 101, 50_000, 0, 0, &accountant);
        let (k2, r2) = incoming_rpc(2, 201, 60_000, 1400, 1, &accountant);
        scheduler.add(99, k1, r1);
        scheduler.add(99, k2, r2);

        let grants = scheduler.compute_grants(&config(), &accountant).await;
        assert_eq!(summary(&grants), vec![(RpcId(201), "GRANT 11400@7".to_string())]);
    }

    #[tokio::test]
    async fn test_oldest_message_gets_fifo_grant() {
        let config = HomaConfig { grant_fifo_fraction: 250, fifo_grant_increment: 10_000, ..config() };
        assert_eq!(config.grant_nonfifo(), 30_000);
        let accountant = IncomingAccountant::new(config.max_incoming());
        let scheduler = GrantScheduler::new();
        let (old_key, old) = incoming_rpc(1, 101, 100_000, 1400, 0, &accountant);
        scheduler.add(99, old_key, old.clone());

        // a stream of shorter messages from the same host wins every ranking
        for round in 0..3u64 {
            let id = 201 + 2 * round;
            let (k, r) = incoming_rpc(1, id, 20_000, 10_000, round + 1, &accountant);
            scheduler.add(99, k, r);

            let grants = scheduler.compute_grants(&config, &accountant).await;
            let mut expected = vec![(RpcId(id), "GRANT 20000@7".to_string())];
            if round == 2 {
                expected.push((RpcId(101), "GRANT 20000@7".to_string()));
            }
            assert_eq!(summary(&grants), expected);
        }
        assert_eq!(old.lock().await.msgin.as_ref().unwrap().incoming(), 20_000);
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test]
    async fn test_fifo_grants_disabled() {
        let config = HomaConfig { grant_fifo_fraction: 0, ..config() };
        let accountant = IncomingAccountant::new(config.max_incoming());
        let scheduler = GrantScheduler::new();
        let (old_key, old) = incoming_rpc(1, 101, 100_000, 1400, 0, &accountant);
        scheduler.add(99, old_key, old.clone());

        for round in 0..5u64 {
            let (k, r) = incoming_rpc(1, 201 + 2 * round, 20_000, 10_000, round + 1, &accountant);
            scheduler.add(99, k, r);
            assert_eq!(scheduler.compute_grants(&config, &accountant).await.len(), 1);
        }
        assert_eq!(old.lock().await.msgin.as_ref().unwrap().incoming(), 10_000);
    }

    #[tokio::test]
    async fn test_no_grant_without_progress() {
        let accountant = IncomingAccountant::new(config().max_incoming());
        let scheduler = GrantScheduler::new();
        let (k1, r1) = incoming_rpc(1, 101, 50_000, 0, 0, &accountant);
        scheduler.add(99, k1, r1.clone());
        scheduler.add(99, k1, r1);
        assert_eq!(scheduler.len(), 1);

        assert!(scheduler.compute_grants(&config(), &accountant).await.is_empty());
        assert_eq!(accountant.total(), 10_000);
    }
}
