//! An OSPF-enabled interface: hello emission, DR/BDR election on
//! broadcast networks, and ownership of the neighbors heard on it.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use log::{debug, info};

use super::neighbor::{Neighbor, NeighborState};
use super::packet::{HelloPacket, OPTIONS_E};
use crate::config::{NetworkKind, OspfInterfaceConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    Down,
    PointToPoint,
    Waiting,
    DrOther,
    Backup,
    Dr,
}

impl fmt::Display for InterfaceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            InterfaceState::Down => "Down",
            InterfaceState::PointToPoint => "PointToPoint",
            InterfaceState::Waiting => "Waiting",
            InterfaceState::DrOther => "DROther",
            InterfaceState::Backup => "Backup",
            InterfaceState::Dr => "DR",
        };
        write!(f, "{}", word)
    }
}

#[derive(Debug)]
pub struct Interface {
    pub config: OspfInterfaceConfig,
    pub state: InterfaceState,
    /// Elected DR/BDR, by interface address (0.0.0.0 = none)
    pub dr: Ipv4Addr,
    pub bdr: Ipv4Addr,
    /// Neighbors heard on this interface, by router-id
    pub neighbors: HashMap<Ipv4Addr, Neighbor>,
    /// Seconds until the next scheduled Hello
    pub hello_due_in: u16,
}

impl Interface {
    pub fn new(config: OspfInterfaceConfig) -> Self {
        let state = match config.network {
            NetworkKind::PointToPoint => InterfaceState::PointToPoint,
            NetworkKind::Broadcast => InterfaceState::Waiting,
        };
        Self {
            config,
            state,
            dr: Ipv4Addr::UNSPECIFIED,
            bdr: Ipv4Addr::UNSPECIFIED,
            neighbors: HashMap::new(),
            hello_due_in: 0,
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.config.address.ip()
    }

    pub fn mask(&self) -> Ipv4Addr {
        self.config.address.mask()
    }

    /// One second of the hello clock; true when a Hello should go out now
    pub fn hello_tick(&mut self) -> bool {
        if self.hello_due_in == 0 {
            self.hello_due_in = self.config.hello_interval;
            return true;
        }
        self.hello_due_in -= 1;
        false
    }

    // The sending router-id rides in the packet header, not the Hello body
    pub fn build_hello(&self) -> HelloPacket {
        HelloPacket {
            network_mask: self.mask(),
            hello_interval: self.config.hello_interval,
            options: OPTIONS_E,
            priority: self.config.priority,
            dead_interval: self.config.dead_interval,
            designated_router: self.dr,
            backup_designated_router: self.bdr,
            neighbors: self.neighbors.keys().copied().collect(),
        }
    }

    /// Should this router become adjacent with the neighbor (RFC 2328
    /// 10.4)? Always on point-to-point links; on broadcast networks only
    /// when one endpoint is DR or BDR.
    pub fn should_be_adjacent(&self, neighbor: &Neighbor) -> bool {
        match self.config.network {
            NetworkKind::PointToPoint => true,
            NetworkKind::Broadcast => {
                let me = self.addr();
                self.dr == me
                    || self.bdr == me
                    || self.dr == neighbor.addr
                    || self.bdr == neighbor.addr
            }
        }
    }

    /// (B)DR election, simplified from RFC 2328 9.4: among this router
    /// and its two-way neighbors with priority > 0, the highest
    /// (priority, router-id) pair becomes DR, the runner-up BDR.
    /// Returns true when DR or BDR changed.
    pub fn elect_dr(&mut self, router_id: Ipv4Addr) -> bool {
        if self.config.network != NetworkKind::Broadcast {
            return false;
        }
        let mut eligible: Vec<(u8, Ipv4Addr, Ipv4Addr)> = self
            .neighbors
            .values()
            .filter(|n| n.state >= NeighborState::TwoWay && n.priority > 0)
            .map(|n| (n.priority, n.router_id, n.addr))
            .collect();
        if self.config.priority > 0 {
            eligible.push((self.config.priority, router_id, self.addr()));
        }
        eligible.sort_by(|a, b| b.cmp(a));

        let new_dr = eligible.first().map(|(_, _, addr)| *addr).unwrap_or(Ipv4Addr::UNSPECIFIED);
        let new_bdr = eligible.get(1).map(|(_, _, addr)| *addr).unwrap_or(Ipv4Addr::UNSPECIFIED);
        let changed = new_dr != self.dr || new_bdr != self.bdr;
        if changed {
            info!(
                "{}: DR={} BDR={} (was DR={} BDR={})",
                self.config.name, new_dr, new_bdr, self.dr, self.bdr
            );
            self.dr = new_dr;
            self.bdr = new_bdr;
            self.state = if new_dr == self.addr() {
                InterfaceState::Dr
            } else if new_bdr == self.addr() {
                InterfaceState::Backup
            } else {
                InterfaceState::DrOther
            };
            debug!("{} interface state {}", self.config.name, self.state);
        }
        changed
    }

    /// Drop neighbors whose dead interval lapsed; returns their router-ids
    pub fn expire_neighbors(&mut self) -> Vec<Ipv4Addr> {
        let dead_interval = self.config.dead_interval;
        let dead: Vec<Ipv4Addr> = self
            .neighbors
            .values()
            .filter(|n| n.is_dead(dead_interval))
            .map(|n| n.router_id)
            .collect();
        for router_id in &dead {
            info!("Neighbor {} timed out on {}", router_id, self.config.name);
            self.neighbors.remove(router_id);
        }
        dead
    }

    pub fn full_neighbors(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors
            .values()
            .filter(|n| n.state == NeighborState::Full)
    }
}
