//! Reliable LSA flooding (RFC 2328 section 13): newness-gated install,
//! acknowledgement, duplicate suppression, and the per-neighbor
//! retransmission lists.

use std::cmp::Ordering;

use log::trace;

use super::lsa::{Lsa, LsaHeader};
use super::lsdb::Lsdb;
use super::neighbor::{Neighbor, NeighborState};
use super::packet::{LsAckPacket, LsuPacket};

/// What one received Link-State-Update produces
#[derive(Debug, Default)]
pub struct FloodOutcome {
    /// Every received LSA is acknowledged (except those answered with a
    /// newer copy)
    pub acks: Vec<LsaHeader>,
    /// Strictly newer instances that were installed and must be flooded
    /// to every adjacent neighbor except the sender
    pub installed: Vec<Lsa>,
    /// The sender has older instances; our newer copies go straight back
    pub send_back_newer: Vec<Lsa>,
}

/// Process the LSAs of one LS-Update against the database.
/// Checksums were already verified at decode.
pub fn process_update(lsdb: &mut Lsdb, lsu: &LsuPacket) -> FloodOutcome {
    let mut outcome = FloodOutcome::default();
    for lsa in &lsu.lsas {
        let newness = match lsdb.get(&lsa.key()) {
            Some(existing) => lsa.header.compare_newness(&existing.header),
            None => Ordering::Greater,
        };
        match newness {
            Ordering::Greater => {
                lsdb.install(lsa.clone());
                outcome.acks.push(lsa.header);
                outcome.installed.push(lsa.clone());
            }
            Ordering::Equal => {
                // Duplicate: acknowledged, never flooded
                trace!("Duplicate LSA {} dropped", lsa.key());
                outcome.acks.push(lsa.header);
            }
            Ordering::Less => {
                if let Some(ours) = lsdb.get(&lsa.key()) {
                    outcome.send_back_newer.push(ours.clone());
                }
            }
        }
    }
    outcome
}

/// Schedule newly flooded LSAs for retransmission to a neighbor until it
/// acknowledges them. Only neighbors that take part in flooding
/// (Exchange or later) track retransmissions.
pub fn track_flood(neighbor: &mut Neighbor, lsas: &[Lsa]) {
    if neighbor.state < NeighborState::Exchange {
        return;
    }
    for lsa in lsas {
        neighbor.track_retransmission(lsa.key());
    }
}

/// Apply a received LS-Ack: acknowledged LSAs leave the retransmission
/// list
pub fn process_ack(neighbor: &mut Neighbor, ack: &LsAckPacket) {
    for header in &ack.headers {
        neighbor.acknowledge(&header.key());
    }
}

/// LSAs due for retransmission to this neighbor (5 s timer lapsed),
/// resolved against the current database copies
pub fn retransmissions(neighbor: &mut Neighbor, lsdb: &Lsdb) -> Vec<Lsa> {
    if neighbor.state < NeighborState::Exchange {
        return Vec::new();
    }
    neighbor
        .retransmissions_due()
        .into_iter()
        .filter_map(|key| lsdb.get(&key).cloned())
        .collect()
}
