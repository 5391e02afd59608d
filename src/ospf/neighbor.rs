//! Per-neighbor state (RFC 2328 section 10): the eight-state machine,
//! Database-Description master/slave bookkeeping, and the three LSA lists
//! (database summary, link-state request, retransmission).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Duration, Utc};
use log::debug;

use super::lsa::{LsaHeader, LsaKey};
use super::RXMT_INTERVAL_SECS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NeighborState {
    Down,
    Attempt,
    Init,
    TwoWay,
    ExStart,
    Exchange,
    Loading,
    Full,
}

impl fmt::Display for NeighborState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            NeighborState::Down => "Down",
            NeighborState::Attempt => "Attempt",
            NeighborState::Init => "Init",
            NeighborState::TwoWay => "TwoWay",
            NeighborState::ExStart => "ExStart",
            NeighborState::Exchange => "Exchange",
            NeighborState::Loading => "Loading",
            NeighborState::Full => "Full",
        };
        write!(f, "{}", word)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborEvent {
    HelloReceived,
    Start,
    TwoWayReceived,
    NegotiationDone,
    ExchangeDone,
    LoadingDone,
    AdjOk,
    SeqNumberMismatch,
    BadLsReq,
    KillNbr,
    InactivityTimer,
    OneWayReceived,
}

#[derive(Debug)]
pub struct Neighbor {
    pub router_id: Ipv4Addr,
    /// Source address of the neighbor's packets on this interface
    pub addr: Ipv4Addr,
    pub priority: u8,
    pub state: NeighborState,
    pub last_hello: DateTime<Utc>,
    /// DR/BDR the neighbor claims in its Hellos
    pub declared_dr: Ipv4Addr,
    pub declared_bdr: Ipv4Addr,

    // Database exchange state
    pub dd_sequence: u32,
    /// True when the NEIGHBOR is master of the exchange
    pub neighbor_is_master: bool,
    /// Headers still to be described to this neighbor in DD packets
    pub db_summary_list: VecDeque<LsaHeader>,
    /// LSAs the neighbor has that we still need (populated during
    /// Exchange, drained during Loading)
    pub ls_request_list: Vec<LsaKey>,
    /// Flooded-but-unacknowledged LSAs, with the time last (re)sent
    pub ls_retransmission_list: HashMap<LsaKey, DateTime<Utc>>,
    /// The last DD packet we sent, kept for slave-side retransmission
    pub last_dd_sent: Option<super::packet::DdPacket>,
}

impl Neighbor {
    pub fn new(router_id: Ipv4Addr, addr: Ipv4Addr, priority: u8) -> Self {
        Self {
            router_id,
            addr,
            priority,
            state: NeighborState::Down,
            last_hello: Utc::now(),
            declared_dr: Ipv4Addr::UNSPECIFIED,
            declared_bdr: Ipv4Addr::UNSPECIFIED,
            dd_sequence: 0,
            neighbor_is_master: false,
            db_summary_list: VecDeque::new(),
            ls_request_list: Vec::new(),
            ls_retransmission_list: HashMap::new(),
            last_dd_sent: None,
        }
    }

    /// Apply an event; returns the new state
    pub fn handle_event(&mut self, event: NeighborEvent) -> NeighborState {
        use NeighborEvent::*;
        use NeighborState::*;

        let next = match (self.state, event) {
            (Down, HelloReceived) | (Attempt, HelloReceived) => Init,
            (Down, Start) => Attempt,
            (Init, TwoWayReceived) => TwoWay,
            (_, TwoWayReceived) if self.state >= TwoWay => self.state,

            // Adjacency formation decision happens at AdjOk; the caller
            // fires it only when an adjacency should form
            (TwoWay, AdjOk) => ExStart,
            (ExStart, NegotiationDone) => Exchange,
            (Exchange, ExchangeDone) => {
                // ls-request-list is fully populated by now; an empty one
                // means the databases already agree
                if self.ls_request_list.is_empty() {
                    Full
                } else {
                    Loading
                }
            }
            (Loading, LoadingDone) => Full,

            // Exchange failures restart the adjacency
            (state, SeqNumberMismatch) | (state, BadLsReq) if state >= Exchange => {
                self.reset_exchange();
                ExStart
            }

            (_, KillNbr) | (_, InactivityTimer) => {
                self.reset_exchange();
                Down
            }
            (state, OneWayReceived) if state >= TwoWay => {
                self.reset_exchange();
                Init
            }

            // Hellos keep arriving in every live state
            (state, HelloReceived) => state,
            (state, _) => state,
        };
        if next != self.state {
            debug!("Neighbor {} went from {} to {}", self.router_id, self.state, next);
            self.state = next;
        }
        next
    }

    pub fn hello_seen(&mut self) {
        self.last_hello = Utc::now();
    }

    pub fn is_dead(&self, dead_interval_secs: u32) -> bool {
        Utc::now() - self.last_hello >= Duration::seconds(i64::from(dead_interval_secs))
    }

    /// Start the exchange over: empty lists, fresh sequence
    pub fn reset_exchange(&mut self) {
        self.db_summary_list.clear();
        self.ls_request_list.clear();
        self.ls_retransmission_list.clear();
        self.last_dd_sent = None;
    }

    /// Record that an LSA was flooded to this neighbor and awaits an ack
    pub fn track_retransmission(&mut self, key: LsaKey) {
        self.ls_retransmission_list.insert(key, Utc::now());
    }

    pub fn acknowledge(&mut self, key: &LsaKey) {
        self.ls_retransmission_list.remove(key);
    }

    /// Keys whose 5 s retransmit timer has lapsed; their timers reset as
    /// they are returned
    pub fn retransmissions_due(&mut self) -> Vec<LsaKey> {
        let now = Utc::now();
        let due: Vec<LsaKey> = self
            .ls_retransmission_list
            .iter()
            .filter(|(_, sent)| now - **sent >= Duration::seconds(RXMT_INTERVAL_SECS))
            .map(|(key, _)| *key)
            .collect();
        for key in &due {
            self.ls_retransmission_list.insert(*key, now);
        }
        due
    }

    /// Remove a satisfied request; returns true when the list just became
    /// empty (LoadingDone)
    pub fn satisfy_request(&mut self, key: &LsaKey) -> bool {
        let before = self.ls_request_list.len();
        self.ls_request_list.retain(|k| k != key);
        before > 0 && self.ls_request_list.is_empty()
    }
}
