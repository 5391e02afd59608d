//! The OSPF speaker: one instance per area, owning the interfaces, the
//! neighbor machines, the LSDB, and the SPF schedule. Packet handlers
//! return the transmissions they produce; the run loop does the I/O.

use std::net::Ipv4Addr;

use chrono::Utc;
use futures::future::select_all;
use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

use super::flooding;
use super::interface::Interface;
use super::lsa::{link_type, ls_type, Lsa, LsaBody, RouterLink};
use super::lsdb::{next_sequence, Lsdb};
use super::neighbor::{Neighbor, NeighborEvent, NeighborState};
use super::packet::{
    dd_flags, DdPacket, HelloPacket, LsAckPacket, LsrPacket, LsuPacket, OspfPacket,
    PacketHeader, OPTIONS_E,
};
use super::socket::OspfSocket;
use super::spf::{self, SpfRoute};
use super::{OspfError, ALL_SPF_ROUTERS, INITIAL_SEQUENCE};
use crate::config::OspfConfig;

/// Headers per Database-Description packet
const DD_BATCH: usize = 64;
/// Ticks of quiet before a scheduled SPF actually runs
const SPF_DEBOUNCE_TICKS: u8 = 1;

/// What the OSPF speaker reports to the cross-protocol core
#[derive(Debug)]
pub enum OspfUpdate {
    RoutingTable(Vec<SpfRoute>),
}

/// Copy-out view for the observable-state API; refreshed by the run loop
#[derive(Debug, Clone, Default)]
pub struct OspfSnapshot {
    pub neighbors: Vec<NeighborSummary>,
    pub lsdb: Vec<super::lsa::LsaHeader>,
    pub table: Vec<SpfRoute>,
    pub stats: InstanceStats,
}

#[derive(Debug, Clone)]
pub struct NeighborSummary {
    pub router_id: Ipv4Addr,
    pub addr: Ipv4Addr,
    pub interface: String,
    pub state: String,
    pub priority: u8,
}

/// A packet to put on the wire
#[derive(Debug)]
pub struct Transmission {
    pub interface: usize,
    pub dst: Ipv4Addr,
    pub packet: OspfPacket,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InstanceStats {
    pub hellos_received: u64,
    pub lsas_received: u64,
    pub bad_packets: u64,
    pub spf_runs: u64,
}

pub struct Instance {
    pub router_id: Ipv4Addr,
    pub area_id: Ipv4Addr,
    pub interfaces: Vec<Interface>,
    pub lsdb: Lsdb,
    tx: mpsc::UnboundedSender<OspfUpdate>,
    pub stats: InstanceStats,
    spf_countdown: Option<u8>,
    last_table: Vec<SpfRoute>,
}

impl Instance {
    pub fn new(
        config: &OspfConfig,
        router_id: Ipv4Addr,
    ) -> (Self, mpsc::UnboundedReceiver<OspfUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let interfaces = config
            .interfaces
            .iter()
            .cloned()
            .map(Interface::new)
            .collect();
        let instance = Self {
            router_id,
            area_id: config.area,
            interfaces,
            lsdb: Lsdb::default(),
            tx,
            stats: InstanceStats::default(),
            spf_countdown: None,
            last_table: Vec::new(),
        };
        (instance, rx)
    }

    // ===== packet dispatch =====

    pub fn handle_packet(
        &mut self,
        iface_index: usize,
        src: Ipv4Addr,
        header: PacketHeader,
        packet: OspfPacket,
    ) -> Vec<Transmission> {
        if header.area_id != self.area_id {
            self.stats.bad_packets += 1;
            trace!("Dropping packet from area {}", header.area_id);
            return vec![];
        }
        if header.router_id == self.router_id {
            return vec![];
        }
        match packet {
            OspfPacket::Hello(hello) => self.handle_hello(iface_index, src, &header, &hello),
            OspfPacket::DatabaseDescription(dd) => self.handle_dd(iface_index, &header, dd),
            OspfPacket::LinkStateRequest(lsr) => self.handle_lsr(iface_index, &header, &lsr),
            OspfPacket::LinkStateUpdate(lsu) => self.handle_lsu(iface_index, &header, &lsu),
            OspfPacket::LinkStateAck(ack) => self.handle_ack(iface_index, &header, &ack),
        }
    }

    fn handle_hello(
        &mut self,
        iface_index: usize,
        src: Ipv4Addr,
        header: &PacketHeader,
        hello: &HelloPacket,
    ) -> Vec<Transmission> {
        self.stats.hellos_received += 1;
        let router_id = self.router_id;
        let iface = &mut self.interfaces[iface_index];

        // Hello-parameter mismatches reject the neighbor silently
        if hello.hello_interval != iface.config.hello_interval
            || hello.dead_interval != iface.config.dead_interval
        {
            debug!(
                "Hello from {} rejected: interval mismatch ({}/{})",
                header.router_id, hello.hello_interval, hello.dead_interval
            );
            self.stats.bad_packets += 1;
            return vec![];
        }

        if !iface.neighbors.contains_key(&header.router_id) {
            info!("New neighbor {} on {}", header.router_id, iface.config.name);
        }
        let neighbor = iface
            .neighbors
            .entry(header.router_id)
            .or_insert_with(|| Neighbor::new(header.router_id, src, hello.priority));
        neighbor.hello_seen();
        neighbor.priority = hello.priority;
        neighbor.declared_dr = hello.designated_router;
        neighbor.declared_bdr = hello.backup_designated_router;
        neighbor.handle_event(NeighborEvent::HelloReceived);

        // Two-way check: does the neighbor list us?
        let seen = hello.neighbors.contains(&router_id);
        if seen {
            neighbor.handle_event(NeighborEvent::TwoWayReceived);
        } else {
            neighbor.handle_event(NeighborEvent::OneWayReceived);
        }

        let mut out = Vec::new();
        let dr_changed = iface.elect_dr(router_id);

        // Form adjacencies where the network type calls for them
        let iface = &mut self.interfaces[iface_index];
        let should_adjoin = {
            let neighbor = iface.neighbors.get(&header.router_id).expect("just inserted");
            neighbor.state == NeighborState::TwoWay && iface.should_be_adjacent(neighbor)
        };
        if should_adjoin {
            let neighbor = iface.neighbors.get_mut(&header.router_id).expect("present");
            neighbor.handle_event(NeighborEvent::AdjOk);
            neighbor.neighbor_is_master = false;
            neighbor.dd_sequence = dd_sequence_seed();
            out.push(Transmission {
                interface: iface_index,
                dst: neighbor.addr,
                packet: OspfPacket::DatabaseDescription(DdPacket {
                    interface_mtu: 1500,
                    options: OPTIONS_E,
                    flags: dd_flags::INIT | dd_flags::MORE | dd_flags::MASTER,
                    dd_sequence: neighbor.dd_sequence,
                    lsa_headers: vec![],
                }),
            });
        }

        if dr_changed {
            out.extend(self.originate_router_lsa());
        }
        out
    }

    fn handle_dd(
        &mut self,
        iface_index: usize,
        header: &PacketHeader,
        dd: DdPacket,
    ) -> Vec<Transmission> {
        let router_id = self.router_id;
        let headers = self.lsdb.headers();
        let iface = &mut self.interfaces[iface_index];
        let Some(neighbor) = iface.neighbors.get_mut(&header.router_id) else {
            return vec![];
        };
        let state_before = neighbor.state;
        let mut out: Vec<Transmission> = Vec::new();

        match neighbor.state {
            NeighborState::ExStart => {
                let neighbor_id_higher = u32::from(header.router_id) > u32::from(router_id);
                if dd.is_init() && dd.has_more() && dd.is_master() && neighbor_id_higher {
                    // The neighbor is master; adopt its sequence (slave)
                    neighbor.neighbor_is_master = true;
                    neighbor.dd_sequence = dd.dd_sequence;
                    neighbor.db_summary_list = headers.into_iter().collect();
                    neighbor.handle_event(NeighborEvent::NegotiationDone);
                    out.push(slave_reply(iface_index, neighbor, dd.dd_sequence));
                } else if !dd.is_init()
                    && !dd.is_master()
                    && dd.dd_sequence == neighbor.dd_sequence
                    && !neighbor_id_higher
                {
                    // We are master and the slave echoed our sequence
                    neighbor.neighbor_is_master = false;
                    neighbor.db_summary_list = headers.into_iter().collect();
                    neighbor.handle_event(NeighborEvent::NegotiationDone);
                    // The slave's first packet may already carry headers
                    let needed = self.collect_needed(&dd);
                    let iface = &mut self.interfaces[iface_index];
                    let neighbor = iface.neighbors.get_mut(&header.router_id).expect("present");
                    neighbor.ls_request_list.extend(needed.iter().copied());
                    neighbor.dd_sequence = neighbor.dd_sequence.wrapping_add(1);
                    out.push(master_next(iface_index, neighbor));
                    return self.after_dd(iface_index, header.router_id, state_before, out);
                }
                // Anything else in ExStart is ignored
            }
            NeighborState::Exchange => {
                if neighbor.neighbor_is_master {
                    // Slave: the master drives the sequence forward by one
                    if dd.dd_sequence == neighbor.dd_sequence {
                        // Duplicate of the last packet: resend our reply
                        if let Some(last) = neighbor.last_dd_sent.clone() {
                            out.push(Transmission {
                                interface: iface_index,
                                dst: neighbor.addr,
                                packet: OspfPacket::DatabaseDescription(last),
                            });
                        }
                        return out;
                    }
                    if dd.dd_sequence != neighbor.dd_sequence.wrapping_add(1) {
                        neighbor.handle_event(NeighborEvent::SeqNumberMismatch);
                        return vec![];
                    }
                    neighbor.dd_sequence = dd.dd_sequence;
                    // The request list must be fully grown before the
                    // exchange can be declared done
                    let needed = self.collect_needed(&dd);
                    let iface = &mut self.interfaces[iface_index];
                    let neighbor = iface.neighbors.get_mut(&header.router_id).expect("present");
                    neighbor.ls_request_list.extend(needed.iter().copied());
                    out.push(slave_reply(iface_index, neighbor, dd.dd_sequence));
                    if !dd.has_more() && neighbor.db_summary_list.is_empty() {
                        neighbor.handle_event(NeighborEvent::ExchangeDone);
                    }
                } else {
                    // Master: the slave echoes our current sequence
                    if dd.dd_sequence != neighbor.dd_sequence {
                        neighbor.handle_event(NeighborEvent::SeqNumberMismatch);
                        return vec![];
                    }
                    let needed = self.collect_needed(&dd);
                    let iface = &mut self.interfaces[iface_index];
                    let neighbor = iface.neighbors.get_mut(&header.router_id).expect("present");
                    neighbor.ls_request_list.extend(needed.iter().copied());
                    if neighbor.db_summary_list.is_empty() && !dd.has_more() {
                        neighbor.handle_event(NeighborEvent::ExchangeDone);
                    } else {
                        neighbor.dd_sequence = neighbor.dd_sequence.wrapping_add(1);
                        out.push(master_next(iface_index, neighbor));
                    }
                }
            }
            NeighborState::Loading | NeighborState::Full => {
                // A DD here with an unexpected sequence restarts the
                // adjacency
                if dd.is_init() || dd.dd_sequence != neighbor.dd_sequence {
                    neighbor.handle_event(NeighborEvent::SeqNumberMismatch);
                }
            }
            _ => (),
        }
        self.after_dd(iface_index, header.router_id, state_before, out)
    }

    /// After a DD step: emit LS requests if the neighbor just entered
    /// Loading, re-originate if it just reached Full
    fn after_dd(
        &mut self,
        iface_index: usize,
        router_id: Ipv4Addr,
        state_before: NeighborState,
        mut out: Vec<Transmission>,
    ) -> Vec<Transmission> {
        let iface = &self.interfaces[iface_index];
        let Some(neighbor) = iface.neighbors.get(&router_id) else {
            return out;
        };
        if neighbor.state == NeighborState::Loading && !neighbor.ls_request_list.is_empty() {
            out.push(Transmission {
                interface: iface_index,
                dst: neighbor.addr,
                packet: OspfPacket::LinkStateRequest(LsrPacket {
                    requests: neighbor.ls_request_list.clone(),
                }),
            });
        }
        let became_full =
            neighbor.state == NeighborState::Full && state_before != NeighborState::Full;
        if became_full {
            out.extend(self.adjacency_became_full());
        }
        out
    }

    /// Which of the DD's headers we lack or hold only older copies of
    fn collect_needed(&self, dd: &DdPacket) -> Vec<super::lsa::LsaKey> {
        dd.lsa_headers
            .iter()
            .filter(|header| self.lsdb.is_newer(header))
            .map(|header| header.key())
            .collect()
    }

    fn handle_lsr(
        &mut self,
        iface_index: usize,
        header: &PacketHeader,
        lsr: &LsrPacket,
    ) -> Vec<Transmission> {
        let mut lsas = Vec::with_capacity(lsr.requests.len());
        for key in &lsr.requests {
            match self.lsdb.get(key) {
                Some(lsa) => lsas.push(lsa.clone()),
                None => {
                    // Requesting something we never described
                    let iface = &mut self.interfaces[iface_index];
                    if let Some(neighbor) = iface.neighbors.get_mut(&header.router_id) {
                        warn!("BadLSReq from {}: {}", header.router_id, key);
                        neighbor.handle_event(NeighborEvent::BadLsReq);
                    }
                    return vec![];
                }
            }
        }
        let iface = &self.interfaces[iface_index];
        let Some(neighbor) = iface.neighbors.get(&header.router_id) else {
            return vec![];
        };
        vec![Transmission {
            interface: iface_index,
            dst: neighbor.addr,
            packet: OspfPacket::LinkStateUpdate(LsuPacket { lsas }),
        }]
    }

    fn handle_lsu(
        &mut self,
        iface_index: usize,
        header: &PacketHeader,
        lsu: &LsuPacket,
    ) -> Vec<Transmission> {
        self.stats.lsas_received += lsu.lsas.len() as u64;
        let outcome = flooding::process_update(&mut self.lsdb, lsu);
        let mut out = Vec::new();
        let sender_addr = {
            let iface = &self.interfaces[iface_index];
            iface
                .neighbors
                .get(&header.router_id)
                .map(|neighbor| neighbor.addr)
        };
        let Some(sender_addr) = sender_addr else {
            return out;
        };

        // Acknowledge everything we accepted or already had
        if !outcome.acks.is_empty() {
            out.push(Transmission {
                interface: iface_index,
                dst: sender_addr,
                packet: OspfPacket::LinkStateAck(LsAckPacket {
                    headers: outcome.acks,
                }),
            });
        }
        // The sender is behind: return our newer copies directly
        if !outcome.send_back_newer.is_empty() {
            out.push(Transmission {
                interface: iface_index,
                dst: sender_addr,
                packet: OspfPacket::LinkStateUpdate(LsuPacket {
                    lsas: outcome.send_back_newer,
                }),
            });
        }

        if outcome.installed.is_empty() {
            return out;
        }

        // Satisfied link-state requests may complete Loading
        let mut became_full = false;
        {
            let iface = &mut self.interfaces[iface_index];
            if let Some(neighbor) = iface.neighbors.get_mut(&header.router_id) {
                for lsa in &outcome.installed {
                    if neighbor.satisfy_request(&lsa.key())
                        && neighbor.state == NeighborState::Loading
                    {
                        neighbor.handle_event(NeighborEvent::LoadingDone);
                        became_full = true;
                    }
                }
            }
        }

        // Flood strictly-newer instances onward, everywhere except back
        // at the sender
        out.extend(self.flood(&outcome.installed, Some((iface_index, header.router_id))));
        self.schedule_spf();
        if became_full {
            out.extend(self.adjacency_became_full());
        }
        out
    }

    fn handle_ack(
        &mut self,
        iface_index: usize,
        header: &PacketHeader,
        ack: &LsAckPacket,
    ) -> Vec<Transmission> {
        let iface = &mut self.interfaces[iface_index];
        if let Some(neighbor) = iface.neighbors.get_mut(&header.router_id) {
            flooding::process_ack(neighbor, ack);
        }
        vec![]
    }

    // ===== origination and flooding =====

    /// Flood LSAs to every adjacent neighbor, optionally skipping the one
    /// they came from
    fn flood(
        &mut self,
        lsas: &[Lsa],
        except: Option<(usize, Ipv4Addr)>,
    ) -> Vec<Transmission> {
        let mut out = Vec::new();
        if lsas.is_empty() {
            return out;
        }
        for (index, iface) in self.interfaces.iter_mut().enumerate() {
            let mut any = false;
            for neighbor in iface.neighbors.values_mut() {
                if neighbor.state < NeighborState::Exchange {
                    continue;
                }
                if except == Some((index, neighbor.router_id)) {
                    continue;
                }
                flooding::track_flood(neighbor, lsas);
                any = true;
            }
            if any {
                out.push(Transmission {
                    interface: index,
                    dst: ALL_SPF_ROUTERS,
                    packet: OspfPacket::LinkStateUpdate(LsuPacket {
                        lsas: lsas.to_vec(),
                    }),
                });
            }
        }
        out
    }

    /// Build and install our Router LSA from current interface and
    /// adjacency state, then flood it.
    pub fn originate_router_lsa(&mut self) -> Vec<Transmission> {
        let mut links = Vec::new();
        for iface in &self.interfaces {
            let full_neighbor = iface.full_neighbors().next();
            match iface.config.network {
                crate::config::NetworkKind::PointToPoint => {
                    if let Some(neighbor) = full_neighbor {
                        links.push(RouterLink {
                            link_id: neighbor.router_id,
                            link_data: iface.addr(),
                            link_type: link_type::POINT_TO_POINT,
                            metric: iface.config.cost,
                        });
                    }
                    links.push(RouterLink {
                        link_id: iface.config.address.network(),
                        link_data: iface.mask(),
                        link_type: link_type::STUB,
                        metric: iface.config.cost,
                    });
                }
                crate::config::NetworkKind::Broadcast => {
                    if full_neighbor.is_some() && iface.dr != Ipv4Addr::UNSPECIFIED {
                        links.push(RouterLink {
                            link_id: iface.dr,
                            link_data: iface.addr(),
                            link_type: link_type::TRANSIT,
                            metric: iface.config.cost,
                        });
                    } else {
                        links.push(RouterLink {
                            link_id: iface.config.address.network(),
                            link_data: iface.mask(),
                            link_type: link_type::STUB,
                            metric: iface.config.cost,
                        });
                    }
                }
            }
        }
        // The router-id itself, reachable as a host route
        links.push(RouterLink {
            link_id: self.router_id,
            link_data: Ipv4Addr::BROADCAST,
            link_type: link_type::STUB,
            metric: 0,
        });

        // Sequence continues from whatever instance is in the database,
        // including copies bumped by the refresh task
        let key = super::lsa::LsaKey {
            ls_type: ls_type::ROUTER,
            link_state_id: self.router_id,
            advertising_router: self.router_id,
        };
        let sequence = match self.lsdb.get(&key) {
            Some(existing) => next_sequence(existing.header.ls_sequence),
            None => INITIAL_SEQUENCE,
        };
        let lsa = Lsa::build(
            ls_type::ROUTER,
            self.router_id,
            self.router_id,
            sequence,
            LsaBody::Router { flags: 0, links },
        );
        self.lsdb.install(lsa.clone());
        self.schedule_spf();
        self.flood(&[lsa], None)
    }

    fn adjacency_became_full(&mut self) -> Vec<Transmission> {
        self.schedule_spf();
        self.originate_router_lsa()
    }

    // ===== timers =====

    /// One second of protocol clock: hellos, neighbor death, LSA aging,
    /// refresh, retransmission, and the SPF debounce.
    pub fn tick(&mut self) -> Vec<Transmission> {
        let mut out = Vec::new();
        let router_id = self.router_id;

        let mut lost_neighbors = false;
        for index in 0..self.interfaces.len() {
            let iface = &mut self.interfaces[index];
            if iface.hello_tick() {
                out.push(Transmission {
                    interface: index,
                    dst: ALL_SPF_ROUTERS,
                    packet: OspfPacket::Hello(iface.build_hello()),
                });
            }
            if !iface.expire_neighbors().is_empty() {
                iface.elect_dr(router_id);
                lost_neighbors = true;
            }
        }
        if lost_neighbors {
            out.extend(self.originate_router_lsa());
        }

        // Retransmit unacknowledged floods
        for index in 0..self.interfaces.len() {
            let mut resend: Vec<(Ipv4Addr, Vec<Lsa>)> = Vec::new();
            {
                let lsdb = &self.lsdb;
                let iface = &mut self.interfaces[index];
                for neighbor in iface.neighbors.values_mut() {
                    let due = flooding::retransmissions(neighbor, lsdb);
                    if !due.is_empty() {
                        resend.push((neighbor.addr, due));
                    }
                }
            }
            for (addr, lsas) in resend {
                trace!("Retransmitting {} LSAs to {}", lsas.len(), addr);
                out.push(Transmission {
                    interface: index,
                    dst: addr,
                    packet: OspfPacket::LinkStateUpdate(LsuPacket { lsas }),
                });
            }
        }

        // Age the database; MaxAge instances get one parting flood
        let max_aged = self.lsdb.age_tick();
        if !max_aged.is_empty() {
            out.extend(self.flood(&max_aged, None));
            self.schedule_spf();
        }

        // Refresh our own LSAs at LSRefreshTime
        let refreshed = self.lsdb.refresh_own(router_id);
        if !refreshed.is_empty() {
            debug!("Refreshing {} self-originated LSAs", refreshed.len());
            out.extend(self.flood(&refreshed, None));
        }

        // SPF debounce
        if let Some(countdown) = self.spf_countdown {
            if countdown == 0 {
                self.spf_countdown = None;
                self.run_spf();
            } else {
                self.spf_countdown = Some(countdown - 1);
            }
        }
        out
    }

    pub fn schedule_spf(&mut self) {
        if self.spf_countdown.is_none() {
            self.spf_countdown = Some(SPF_DEBOUNCE_TICKS);
        }
    }

    fn run_spf(&mut self) {
        self.stats.spf_runs += 1;
        let interfaces: Vec<&Interface> = self.interfaces.iter().collect();
        let table = spf::compute(&self.lsdb, self.router_id, &interfaces);
        if table != self.last_table {
            debug!("SPF table changed: {} routes", table.len());
            self.last_table = table.clone();
            let _ = self.tx.send(OspfUpdate::RoutingTable(table));
        }
    }

    pub fn routing_table(&self) -> &[SpfRoute] {
        &self.last_table
    }

    pub fn snapshot(&self) -> OspfSnapshot {
        let mut neighbors: Vec<NeighborSummary> = self
            .interfaces
            .iter()
            .flat_map(|iface| {
                iface.neighbors.values().map(|neighbor| NeighborSummary {
                    router_id: neighbor.router_id,
                    addr: neighbor.addr,
                    interface: iface.config.name.clone(),
                    state: neighbor.state.to_string(),
                    priority: neighbor.priority,
                })
            })
            .collect();
        neighbors.sort_by_key(|summary| summary.router_id);
        let mut lsdb = self.lsdb.headers();
        lsdb.sort_by_key(|header| header.key());
        OspfSnapshot {
            neighbors,
            lsdb,
            table: self.last_table.clone(),
            stats: self.stats,
        }
    }

    // ===== the run loop =====

    /// Drive the instance against its sockets (one per interface) until
    /// the process exits. The snapshot slot is refreshed once per tick
    /// for the API's copy-out reads.
    pub async fn run(
        mut self,
        sockets: Vec<OspfSocket>,
        snapshot: std::sync::Arc<tokio::sync::Mutex<OspfSnapshot>>,
    ) -> Result<(), OspfError> {
        info!(
            "OSPF speaker up: router-id={} area={} [{} interfaces]",
            self.router_id,
            self.area_id,
            self.interfaces.len()
        );
        self.originate_router_lsa();
        let mut clock = interval(Duration::from_secs(1));
        if sockets.is_empty() {
            warn!("No OSPF sockets available; speaker idles");
            loop {
                clock.tick().await;
                self.tick();
                *snapshot.lock().await = self.snapshot();
            }
        }
        loop {
            let receives = sockets.iter().map(|socket| {
                Box::pin(async move {
                    let mut buf = vec![0u8; 2048];
                    let result = socket.recv(&mut buf).await;
                    result.map(|(len, src)| {
                        buf.truncate(len);
                        (buf, src)
                    })
                })
            });
            let transmissions = tokio::select! {
                (result, index, _) = select_all(receives) => {
                    match result {
                        Ok((payload, src)) => match OspfPacket::decode(&payload) {
                            Ok((header, packet)) => {
                                trace!("[{}] Incoming: {} from {}", index, packet.kind(), src);
                                self.handle_packet(index, src, header, packet)
                            }
                            Err(err) => {
                                self.stats.bad_packets += 1;
                                debug!("Dropping malformed packet from {}: {}", src, err);
                                vec![]
                            }
                        },
                        Err(err) => {
                            warn!("Raw socket receive error: {}", err);
                            vec![]
                        }
                    }
                }
                _ = clock.tick() => {
                    let out = self.tick();
                    *snapshot.lock().await = self.snapshot();
                    out
                }
            };
            for transmission in transmissions {
                let bytes = transmission
                    .packet
                    .encode(self.router_id, self.area_id);
                if let Err(err) = sockets[transmission.interface]
                    .send_to(&bytes, transmission.dst)
                    .await
                {
                    warn!("Send to {} failed: {}", transmission.dst, err);
                }
            }
        }
    }
}

fn slave_reply(iface_index: usize, neighbor: &mut Neighbor, sequence: u32) -> Transmission {
    let batch: Vec<_> = drain_batch(neighbor);
    let mut flags = 0;
    if !neighbor.db_summary_list.is_empty() {
        flags |= dd_flags::MORE;
    }
    let dd = DdPacket {
        interface_mtu: 1500,
        options: OPTIONS_E,
        flags,
        dd_sequence: sequence,
        lsa_headers: batch,
    };
    neighbor.last_dd_sent = Some(dd.clone());
    Transmission {
        interface: iface_index,
        dst: neighbor.addr,
        packet: OspfPacket::DatabaseDescription(dd),
    }
}

fn master_next(iface_index: usize, neighbor: &mut Neighbor) -> Transmission {
    let batch: Vec<_> = drain_batch(neighbor);
    let mut flags = dd_flags::MASTER;
    if !neighbor.db_summary_list.is_empty() {
        flags |= dd_flags::MORE;
    }
    let dd = DdPacket {
        interface_mtu: 1500,
        options: OPTIONS_E,
        flags,
        dd_sequence: neighbor.dd_sequence,
        lsa_headers: batch,
    };
    neighbor.last_dd_sent = Some(dd.clone());
    Transmission {
        interface: iface_index,
        dst: neighbor.addr,
        packet: OspfPacket::DatabaseDescription(dd),
    }
}

fn drain_batch(neighbor: &mut Neighbor) -> Vec<super::lsa::LsaHeader> {
    let take = neighbor.db_summary_list.len().min(DD_BATCH);
    neighbor.db_summary_list.drain(..take).collect()
}

/// Seed the DD sequence from the clock so restarts do not collide with a
/// previous exchange
fn dd_sequence_seed() -> u32 {
    Utc::now().timestamp() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkKind, OspfConfig, OspfInterfaceConfig};

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn config() -> OspfConfig {
        OspfConfig {
            area: Ipv4Addr::UNSPECIFIED,
            interfaces: vec![OspfInterfaceConfig {
                name: "eth0".to_string(),
                address: "10.0.0.1/30".parse().unwrap(),
                hello_interval: 10,
                dead_interval: 40,
                priority: 1,
                cost: 10,
                network: NetworkKind::PointToPoint,
            }],
        }
    }

    fn instance() -> (Instance, mpsc::UnboundedReceiver<OspfUpdate>) {
        Instance::new(&config(), addr("10.0.1.1"))
    }

    fn hello_from(router_id: &str, seen_us: bool) -> (PacketHeader, HelloPacket) {
        (
            PacketHeader {
                router_id: addr(router_id),
                area_id: Ipv4Addr::UNSPECIFIED,
            },
            HelloPacket {
                network_mask: addr("255.255.255.252"),
                hello_interval: 10,
                options: OPTIONS_E,
                priority: 1,
                dead_interval: 40,
                designated_router: Ipv4Addr::UNSPECIFIED,
                backup_designated_router: Ipv4Addr::UNSPECIFIED,
                neighbors: if seen_us {
                    vec![addr("10.0.1.1")]
                } else {
                    vec![]
                },
            },
        )
    }

    #[test]
    fn test_first_hello_creates_neighbor_in_init() {
        let (mut instance, _rx) = instance();
        let (header, hello) = hello_from("10.0.1.2", false);
        let out = instance.handle_hello(0, addr("10.0.0.2"), &header, &hello);
        assert!(out.is_empty());
        let neighbor = &instance.interfaces[0].neighbors[&addr("10.0.1.2")];
        assert_eq!(neighbor.state, NeighborState::Init);
    }

    #[test]
    fn test_two_way_hello_starts_exstart_on_p2p() {
        let (mut instance, _rx) = instance();
        let (header, hello) = hello_from("10.0.1.2", true);
        let out = instance.handle_hello(0, addr("10.0.0.2"), &header, &hello);
        let neighbor = &instance.interfaces[0].neighbors[&addr("10.0.1.2")];
        assert_eq!(neighbor.state, NeighborState::ExStart);
        // The empty initial DD goes out with I|M|MS
        let dd = out
            .iter()
            .find_map(|t| match &t.packet {
                OspfPacket::DatabaseDescription(dd) => Some(dd),
                _ => None,
            })
            .expect("initial DD");
        assert!(dd.is_init() && dd.has_more() && dd.is_master());
        assert!(dd.lsa_headers.is_empty());
    }

    #[test]
    fn test_hello_interval_mismatch_rejected() {
        let (mut instance, _rx) = instance();
        let (header, mut hello) = hello_from("10.0.1.2", false);
        hello.hello_interval = 5;
        instance.handle_hello(0, addr("10.0.0.2"), &header, &hello);
        assert!(instance.interfaces[0].neighbors.is_empty());
        assert_eq!(instance.stats.bad_packets, 1);
    }

    #[test]
    fn test_dd_negotiation_as_slave() {
        // Peer 10.0.1.9 has the higher router-id, so it is master
        let (mut instance, _rx) = instance();
        let (header, hello) = hello_from("10.0.1.9", true);
        instance.handle_hello(0, addr("10.0.0.2"), &header, &hello);
        instance.originate_router_lsa();

        let dd = DdPacket {
            interface_mtu: 1500,
            options: OPTIONS_E,
            flags: dd_flags::INIT | dd_flags::MORE | dd_flags::MASTER,
            dd_sequence: 5000,
            lsa_headers: vec![],
        };
        let out = instance.handle_dd(0, &header, dd);
        let neighbor = &instance.interfaces[0].neighbors[&addr("10.0.1.9")];
        assert_eq!(neighbor.state, NeighborState::Exchange);
        assert!(neighbor.neighbor_is_master);
        assert_eq!(neighbor.dd_sequence, 5000);
        // Our reply echoes the master's sequence and lists our headers
        let reply = out
            .iter()
            .find_map(|t| match &t.packet {
                OspfPacket::DatabaseDescription(dd) => Some(dd),
                _ => None,
            })
            .expect("slave DD reply");
        assert_eq!(reply.dd_sequence, 5000);
        assert!(!reply.is_master());
        assert!(!reply.lsa_headers.is_empty());
    }

    #[test]
    fn test_exchange_populates_request_list_before_done() {
        let (mut instance, _rx) = instance();
        let (header, hello) = hello_from("10.0.1.9", true);
        instance.handle_hello(0, addr("10.0.0.2"), &header, &hello);

        // Negotiate: peer is master
        let init = DdPacket {
            interface_mtu: 1500,
            options: OPTIONS_E,
            flags: dd_flags::INIT | dd_flags::MORE | dd_flags::MASTER,
            dd_sequence: 5000,
            lsa_headers: vec![],
        };
        instance.handle_dd(0, &header, init);

        // Master's data packet describes an LSA we lack; M=0 ends the
        // exchange
        let foreign = Lsa::build(
            ls_type::ROUTER,
            addr("10.0.1.9"),
            addr("10.0.1.9"),
            INITIAL_SEQUENCE,
            LsaBody::Router {
                flags: 0,
                links: vec![],
            },
        );
        let data = DdPacket {
            interface_mtu: 1500,
            options: OPTIONS_E,
            flags: dd_flags::MASTER,
            dd_sequence: 5001,
            lsa_headers: vec![foreign.header],
        };
        let out = instance.handle_dd(0, &header, data);
        let neighbor = &instance.interfaces[0].neighbors[&addr("10.0.1.9")];
        // Loading, with the request list already populated
        assert_eq!(neighbor.state, NeighborState::Loading);
        assert_eq!(neighbor.ls_request_list, vec![foreign.key()]);
        // And the LSR went out immediately
        assert!(out.iter().any(|t| matches!(
            t.packet,
            OspfPacket::LinkStateRequest(_)
        )));
    }

    #[test]
    fn test_lsu_completes_loading() {
        let (mut instance, mut rx) = instance();
        let (header, hello) = hello_from("10.0.1.9", true);
        instance.handle_hello(0, addr("10.0.0.2"), &header, &hello);
        let foreign = Lsa::build(
            ls_type::ROUTER,
            addr("10.0.1.9"),
            addr("10.0.1.9"),
            INITIAL_SEQUENCE,
            LsaBody::Router {
                flags: 0,
                links: vec![
                    RouterLink {
                        link_id: addr("10.0.1.1"),
                        link_data: addr("10.0.0.2"),
                        link_type: link_type::POINT_TO_POINT,
                        metric: 10,
                    },
                    RouterLink {
                        link_id: addr("10.0.1.9"),
                        link_data: Ipv4Addr::BROADCAST,
                        link_type: link_type::STUB,
                        metric: 0,
                    },
                ],
            },
        );
        {
            let neighbor = instance.interfaces[0]
                .neighbors
                .get_mut(&addr("10.0.1.9"))
                .unwrap();
            neighbor.state = NeighborState::Loading;
            neighbor.ls_request_list = vec![foreign.key()];
        }
        instance.originate_router_lsa();
        let out = instance.handle_lsu(
            0,
            &header,
            &LsuPacket {
                lsas: vec![foreign],
            },
        );
        let neighbor = &instance.interfaces[0].neighbors[&addr("10.0.1.9")];
        assert_eq!(neighbor.state, NeighborState::Full);
        // The LSA was acknowledged
        assert!(out
            .iter()
            .any(|t| matches!(t.packet, OspfPacket::LinkStateAck(_))));

        // Aging ticks past the debounce run SPF and publish a table with
        // the neighbor's loopback
        instance.tick();
        instance.tick();
        match rx.try_recv() {
            Ok(OspfUpdate::RoutingTable(table)) => {
                assert!(table
                    .iter()
                    .any(|route| route.prefix == "10.0.1.9/32".parse().unwrap()));
            }
            other => panic!("expected routing table update, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_lsu_not_reflooded() {
        let (mut instance, _rx) = instance();
        let (header, hello) = hello_from("10.0.1.9", true);
        instance.handle_hello(0, addr("10.0.0.2"), &header, &hello);
        {
            let neighbor = instance.interfaces[0]
                .neighbors
                .get_mut(&addr("10.0.1.9"))
                .unwrap();
            neighbor.state = NeighborState::Full;
        }
        let foreign = Lsa::build(
            ls_type::ROUTER,
            addr("10.0.1.9"),
            addr("10.0.1.9"),
            INITIAL_SEQUENCE,
            LsaBody::Router {
                flags: 0,
                links: vec![],
            },
        );
        let lsu = LsuPacket {
            lsas: vec![foreign],
        };
        instance.handle_lsu(0, &header, &lsu);
        // Second copy: ack only, no flood, no second install
        let out = instance.handle_lsu(0, &header, &lsu);
        assert!(out
            .iter()
            .all(|t| !matches!(t.packet, OspfPacket::LinkStateUpdate(_))));
        assert_eq!(instance.lsdb.len(), 1);
    }

    #[test]
    fn test_area_mismatch_dropped() {
        let (mut instance, _rx) = instance();
        let (mut header, hello) = hello_from("10.0.1.2", false);
        header.area_id = addr("0.0.0.1");
        let out = instance.handle_packet(
            0,
            addr("10.0.0.2"),
            header,
            OspfPacket::Hello(hello),
        );
        assert!(out.is_empty());
        assert!(instance.interfaces[0].neighbors.is_empty());
    }

    #[test]
    fn test_hello_emitted_on_first_tick() {
        let (mut instance, _rx) = instance();
        let out = instance.tick();
        assert!(out.iter().any(|t| {
            matches!(t.packet, OspfPacket::Hello(_)) && t.dst == ALL_SPF_ROUTERS
        }));
    }
}
