//! The three-stage BGP route store: per-peer Adj-RIB-In, the shared
//! Loc-RIB, and per-peer Adj-RIB-Out. All three are keyed by prefix;
//! an announcement for a prefix replaces the prior entry from that peer
//! and a withdrawal removes it.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use log::trace;

use super::community::CommunityList;
use super::families::Family;
use super::msg::{
    identifier, AsPath, MpReachNlri, MpUnreachNlri, Origin, PathAttribute, Update,
};
use crate::utils::format_time_as_elapsed;

/// RPKI origin-validation state of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    Valid,
    Invalid,
    NotFound,
    Unverified,
}

impl fmt::Display for ValidationState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            ValidationState::Valid => "Valid",
            ValidationState::Invalid => "Invalid",
            ValidationState::NotFound => "NotFound",
            ValidationState::Unverified => "Unverified",
        };
        write!(f, "{}", word)
    }
}

/// The typed attribute view a stored route carries (the codec-level
/// attribute list folded down, MP next-hops resolved)
#[derive(Debug, Clone, PartialEq)]
pub struct PathSet {
    pub origin: Origin,
    pub as_path: AsPath,
    pub next_hop: Option<IpAddr>,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    pub communities: CommunityList,
    pub originator_id: Option<Ipv4Addr>,
    pub cluster_list: Vec<Ipv4Addr>,
    pub atomic_aggregate: bool,
    pub aggregator: Option<(u32, Ipv4Addr)>,
}

impl Default for PathSet {
    fn default() -> Self {
        Self {
            origin: Origin::Incomplete,
            as_path: AsPath::default(),
            next_hop: None,
            local_pref: None,
            multi_exit_disc: None,
            communities: CommunityList::default(),
            originator_id: None,
            cluster_list: Vec::new(),
            atomic_aggregate: false,
            aggregator: None,
        }
    }
}

impl PathSet {
    /// Fold a decoded attribute list into the typed view.
    ///
    /// `mp_next_hop` (from MP_REACH_NLRI) wins over a plain NEXT_HOP for
    /// the families it announces.
    pub fn from_attributes(attributes: &[PathAttribute], mp_next_hop: Option<IpAddr>) -> Self {
        let mut set = PathSet::default();
        for attribute in attributes {
            match attribute {
                PathAttribute::Origin(origin) => set.origin = *origin,
                PathAttribute::AsPath(as_path) => set.as_path = as_path.clone(),
                PathAttribute::NextHop(next_hop) => {
                    if set.next_hop.is_none() {
                        set.next_hop = Some(IpAddr::V4(*next_hop));
                    }
                }
                PathAttribute::LocalPref(pref) => set.local_pref = Some(*pref),
                PathAttribute::MultiExitDisc(med) => set.multi_exit_disc = Some(*med),
                PathAttribute::Communities(values) => {
                    set.communities = CommunityList::from(values.as_slice())
                }
                PathAttribute::OriginatorId(id) => set.originator_id = Some(*id),
                PathAttribute::ClusterList(ids) => set.cluster_list = ids.clone(),
                PathAttribute::AtomicAggregate => set.atomic_aggregate = true,
                PathAttribute::Aggregator { asn, speaker } => {
                    set.aggregator = Some((*asn, *speaker))
                }
                PathAttribute::MpReachNlri(_)
                | PathAttribute::MpUnreachNlri(_)
                | PathAttribute::Unknown { .. } => (),
            }
        }
        if let Some(next_hop) = mp_next_hop {
            set.next_hop = Some(next_hop);
        }
        set
    }

    /// Rebuild the wire attribute list for advertisement of `prefix`
    pub fn to_attributes(&self, family: Family, prefix: IpNetwork) -> Vec<PathAttribute> {
        let mut attributes: Vec<PathAttribute> = Vec::with_capacity(4);
        attributes.push(PathAttribute::Origin(self.origin));
        attributes.push(PathAttribute::AsPath(self.as_path.clone()));
        match (family, self.next_hop) {
            (family, Some(IpAddr::V4(next_hop))) if family == Family::ipv4_unicast() => {
                attributes.push(PathAttribute::NextHop(next_hop));
            }
            (family, Some(next_hop)) if family == Family::ipv6_unicast() => {
                attributes.push(PathAttribute::MpReachNlri(MpReachNlri {
                    afi: family.afi,
                    safi: family.safi,
                    next_hop,
                    announced: vec![prefix],
                }));
            }
            _ => (),
        }
        if let Some(pref) = self.local_pref {
            attributes.push(PathAttribute::LocalPref(pref));
        }
        if let Some(med) = self.multi_exit_disc {
            attributes.push(PathAttribute::MultiExitDisc(med));
        }
        if !self.communities.0.is_empty() {
            attributes.push(PathAttribute::Communities(self.communities.values()));
        }
        if let Some(id) = self.originator_id {
            attributes.push(PathAttribute::OriginatorId(id));
        }
        if !self.cluster_list.is_empty() {
            attributes.push(PathAttribute::ClusterList(self.cluster_list.clone()));
        }
        if self.atomic_aggregate {
            attributes.push(PathAttribute::AtomicAggregate);
        }
        if let Some((asn, speaker)) = self.aggregator {
            attributes.push(PathAttribute::Aggregator { asn, speaker });
        }
        attributes
    }
}

/// A route as learned from one peer
#[derive(Debug, Clone)]
pub struct Route {
    pub family: Family,
    pub prefix: IpNetwork,
    pub attributes: Arc<PathSet>,
    /// Address the owning session peers with
    pub peer_ip: IpAddr,
    /// BGP identifier the peer sent in its OPEN
    pub router_id: Ipv4Addr,
    pub remote_as: u32,
    pub local_as: u32,
    pub received_at: DateTime<Utc>,
    pub validation: ValidationState,
    /// Held through a graceful-restart window, pending refresh
    pub stale: bool,
}

impl Route {
    pub fn is_ebgp(&self) -> bool {
        self.remote_as != self.local_as
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Route {} from {} age={}>",
            self.prefix,
            self.peer_ip,
            format_time_as_elapsed(self.received_at),
        )
    }
}

/// Routes received from one peer, post-import-policy
#[derive(Debug, Default)]
pub struct AdjRibIn {
    routes: HashMap<IpNetwork, Route>,
}

impl AdjRibIn {
    pub fn insert(&mut self, route: Route) -> IpNetwork {
        let prefix = route.prefix;
        self.routes.insert(prefix, route);
        prefix
    }

    pub fn withdraw(&mut self, prefix: &IpNetwork) -> Option<Route> {
        self.routes.remove(prefix)
    }

    pub fn get(&self, prefix: &IpNetwork) -> Option<&Route> {
        self.routes.get(prefix)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn prefixes(&self) -> Vec<IpNetwork> {
        self.routes.keys().copied().collect()
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    pub fn mark_all_stale(&mut self) {
        for route in self.routes.values_mut() {
            route.stale = true;
        }
    }

    /// Refresh clears the stale flag when a peer re-announces after restart
    pub fn clear_stale(&mut self, prefix: &IpNetwork) {
        if let Some(route) = self.routes.get_mut(prefix) {
            route.stale = false;
        }
    }

    pub fn sweep_stale(&mut self) -> Vec<IpNetwork> {
        let stale: Vec<IpNetwork> = self
            .routes
            .iter()
            .filter(|(_, route)| route.stale)
            .map(|(prefix, _)| *prefix)
            .collect();
        for prefix in &stale {
            self.routes.remove(prefix);
        }
        stale
    }
}

/// The single best route per prefix
#[derive(Debug, Default)]
pub struct LocRib {
    routes: HashMap<IpNetwork, Arc<Route>>,
}

impl LocRib {
    pub fn get(&self, prefix: &IpNetwork) -> Option<&Arc<Route>> {
        self.routes.get(prefix)
    }

    pub fn install(&mut self, route: Arc<Route>) -> Option<Arc<Route>> {
        self.routes.insert(route.prefix, route)
    }

    pub fn remove(&mut self, prefix: &IpNetwork) -> Option<Arc<Route>> {
        self.routes.remove(prefix)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.values()
    }

    pub fn prefixes(&self) -> Vec<IpNetwork> {
        self.routes.keys().copied().collect()
    }
}

/// What was last advertised to a peer, post-export-policy
#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisedRoute {
    pub family: Family,
    pub prefix: IpNetwork,
    pub attributes: PathSet,
}

#[derive(Debug, Default)]
pub struct AdjRibOut {
    routes: HashMap<IpNetwork, AdvertisedRoute>,
}

impl AdjRibOut {
    pub fn get(&self, prefix: &IpNetwork) -> Option<&AdvertisedRoute> {
        self.routes.get(prefix)
    }

    pub fn insert(&mut self, route: AdvertisedRoute) {
        self.routes.insert(route.prefix, route);
    }

    pub fn remove(&mut self, prefix: &IpNetwork) -> Option<AdvertisedRoute> {
        self.routes.remove(prefix)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn routes(&self) -> impl Iterator<Item = &AdvertisedRoute> {
        self.routes.values()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }
}

/// All three stages, owned by the handler and mutated only from the
/// scheduler thread
#[derive(Debug, Default)]
pub struct Rib {
    adj_in: HashMap<IpAddr, AdjRibIn>,
    pub loc: LocRib,
    adj_out: HashMap<IpAddr, AdjRibOut>,
}

/// The NLRI changes one UPDATE produced against a peer's Adj-RIB-In
#[derive(Debug, Default)]
pub struct RibInChange {
    pub announced: Vec<IpNetwork>,
    pub withdrawn: Vec<IpNetwork>,
}

impl RibInChange {
    pub fn touched(&self) -> impl Iterator<Item = &IpNetwork> {
        self.announced.iter().chain(self.withdrawn.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.announced.is_empty() && self.withdrawn.is_empty()
    }
}

impl Rib {
    pub fn adj_in(&self, peer_ip: &IpAddr) -> Option<&AdjRibIn> {
        self.adj_in.get(peer_ip)
    }

    pub fn adj_in_mut(&mut self, peer_ip: IpAddr) -> &mut AdjRibIn {
        self.adj_in.entry(peer_ip).or_default()
    }

    pub fn adj_out(&self, peer_ip: &IpAddr) -> Option<&AdjRibOut> {
        self.adj_out.get(peer_ip)
    }

    pub fn adj_out_mut(&mut self, peer_ip: IpAddr) -> &mut AdjRibOut {
        self.adj_out.entry(peer_ip).or_default()
    }

    pub fn peers_with_routes(&self) -> Vec<IpAddr> {
        self.adj_in.keys().copied().collect()
    }

    /// Apply one (validated) UPDATE from a peer.
    ///
    /// `make_route` builds the stored route for each announced prefix; a
    /// `None` from it means import policy rejected the prefix.
    pub fn apply_update<F>(
        &mut self,
        peer_ip: IpAddr,
        update: &Update,
        mut make_route: F,
    ) -> RibInChange
    where
        F: FnMut(IpNetwork, Family, &PathSet) -> Option<Route>,
    {
        let table = self.adj_in.entry(peer_ip).or_default();
        let mut change = RibInChange::default();

        let mut withdrawn: Vec<(Family, IpNetwork)> = update
            .withdrawn_routes
            .iter()
            .map(|prefix| (Family::ipv4_unicast(), *prefix))
            .collect();
        if let Some(PathAttribute::MpUnreachNlri(MpUnreachNlri { afi, safi, withdrawn: mp, .. })) =
            update.get(identifier::MP_UNREACH_NLRI)
        {
            withdrawn.extend(mp.iter().map(|prefix| (Family::new(*afi, *safi), *prefix)));
        }

        let mut announced: Vec<(Family, IpNetwork, Option<IpAddr>)> = update
            .announced_routes
            .iter()
            .map(|prefix| (Family::ipv4_unicast(), *prefix, None))
            .collect();
        if let Some(PathAttribute::MpReachNlri(MpReachNlri {
            afi,
            safi,
            next_hop,
            announced: mp,
        })) = update.get(identifier::MP_REACH_NLRI)
        {
            announced.extend(
                mp.iter()
                    .map(|prefix| (Family::new(*afi, *safi), *prefix, Some(*next_hop))),
            );
        }

        // RFC 7606: a treat-as-withdraw UPDATE withdraws its own NLRI
        if update.treat_as_withdraw {
            withdrawn.extend(
                announced
                    .drain(..)
                    .map(|(family, prefix, _)| (family, prefix)),
            );
        }

        for (_family, prefix) in withdrawn {
            if table.withdraw(&prefix).is_some() {
                change.withdrawn.push(prefix);
            }
        }

        for (family, prefix, mp_next_hop) in announced {
            let attributes = PathSet::from_attributes(&update.attributes, mp_next_hop);
            match make_route(prefix, family, &attributes) {
                Some(route) => {
                    table.insert(route);
                    change.announced.push(prefix);
                }
                None => {
                    // Import policy rejected: an older accepted copy no
                    // longer reflects what the peer is announcing
                    if table.withdraw(&prefix).is_some() {
                        change.withdrawn.push(prefix);
                    }
                }
            }
        }
        change
    }

    /// Drop all RIB state for a peer whose session left Established.
    /// Returns the prefixes that need re-deciding.
    pub fn purge_peer(&mut self, peer_ip: &IpAddr) -> Vec<IpNetwork> {
        self.adj_out.remove(peer_ip);
        match self.adj_in.remove(peer_ip) {
            Some(table) => {
                let prefixes = table.prefixes();
                trace!("Removed {} routes from Adj-RIB-In for {}", prefixes.len(), peer_ip);
                prefixes
            }
            None => vec![],
        }
    }

    /// Every prefix present in any Adj-RIB-In (used when the IGP view
    /// changes and next-hop resolution must be re-checked)
    pub fn all_prefixes(&self) -> Vec<IpNetwork> {
        let mut prefixes: Vec<IpNetwork> = self
            .adj_in
            .values()
            .flat_map(|table| table.prefixes())
            .collect();
        prefixes.sort();
        prefixes.dedup();
        prefixes
    }

    /// All candidate routes for a prefix across every Adj-RIB-In
    pub fn candidates(&self, prefix: &IpNetwork) -> Vec<&Route> {
        self.adj_in
            .values()
            .filter_map(|table| table.get(prefix))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_route(prefix: &str, peer_ip: &str) -> Route {
        Route {
            family: Family::ipv4_unicast(),
            prefix: prefix.parse().unwrap(),
            attributes: Arc::new(PathSet {
                origin: Origin::Igp,
                as_path: AsPath::from_sequence(vec![65002]),
                next_hop: Some("192.0.2.2".parse().unwrap()),
                ..PathSet::default()
            }),
            peer_ip: peer_ip.parse().unwrap(),
            router_id: "10.0.1.2".parse().unwrap(),
            remote_as: 65002,
            local_as: 65001,
            received_at: Utc::now(),
            validation: ValidationState::Unverified,
            stale: false,
        }
    }

    fn learn_update(announce: &str) -> Update {
        Update {
            attributes: vec![
                PathAttribute::Origin(Origin::Igp),
                PathAttribute::AsPath(AsPath::from_sequence(vec![65002])),
                PathAttribute::NextHop("192.0.2.2".parse().unwrap()),
            ],
            announced_routes: vec![announce.parse().unwrap()],
            ..Update::default()
        }
    }

    fn accept_all(
        peer_ip: IpAddr,
    ) -> impl FnMut(IpNetwork, Family, &PathSet) -> Option<Route> {
        move |prefix, family, attributes| {
            Some(Route {
                family,
                prefix,
                attributes: Arc::new(attributes.clone()),
                peer_ip,
                router_id: "10.0.1.2".parse().unwrap(),
                remote_as: 65002,
                local_as: 65001,
                received_at: Utc::now(),
                validation: ValidationState::Unverified,
                stale: false,
            })
        }
    }

    #[test]
    fn test_announce_then_withdraw_clears_adj_in() {
        let mut rib = Rib::default();
        let peer: IpAddr = "192.0.2.2".parse().unwrap();
        let prefix: IpNetwork = "203.0.113.0/24".parse().unwrap();

        let change = rib.apply_update(peer, &learn_update("203.0.113.0/24"), accept_all(peer));
        assert_eq!(change.announced, vec![prefix]);
        assert!(rib.adj_in(&peer).unwrap().get(&prefix).is_some());

        let withdraw = Update {
            withdrawn_routes: vec![prefix],
            ..Update::default()
        };
        let change = rib.apply_update(peer, &withdraw, accept_all(peer));
        assert_eq!(change.withdrawn, vec![prefix]);
        assert!(rib.adj_in(&peer).unwrap().get(&prefix).is_none());
    }

    #[test]
    fn test_treat_as_withdraw_removes_nlri() {
        let mut rib = Rib::default();
        let peer: IpAddr = "192.0.2.2".parse().unwrap();
        let prefix: IpNetwork = "203.0.113.0/24".parse().unwrap();
        rib.apply_update(peer, &learn_update("203.0.113.0/24"), accept_all(peer));

        let mut poisoned = learn_update("203.0.113.0/24");
        poisoned.treat_as_withdraw = true;
        let change = rib.apply_update(peer, &poisoned, accept_all(peer));
        assert!(change.announced.is_empty());
        assert_eq!(change.withdrawn, vec![prefix]);
        assert!(rib.adj_in(&peer).unwrap().is_empty());
    }

    #[test]
    fn test_import_reject_withdraws_prior_copy() {
        let mut rib = Rib::default();
        let peer: IpAddr = "192.0.2.2".parse().unwrap();
        let prefix: IpNetwork = "203.0.113.0/24".parse().unwrap();
        rib.apply_update(peer, &learn_update("203.0.113.0/24"), accept_all(peer));

        let change =
            rib.apply_update(peer, &learn_update("203.0.113.0/24"), |_, _, _| None);
        assert_eq!(change.withdrawn, vec![prefix]);
        assert!(rib.adj_in(&peer).unwrap().is_empty());
    }

    #[test]
    fn test_purge_peer_returns_prefixes() {
        let mut rib = Rib::default();
        let peer: IpAddr = "192.0.2.2".parse().unwrap();
        rib.apply_update(peer, &learn_update("203.0.113.0/24"), accept_all(peer));
        rib.apply_update(peer, &learn_update("198.51.100.0/24"), accept_all(peer));
        let mut purged = rib.purge_peer(&peer);
        purged.sort();
        assert_eq!(purged.len(), 2);
        assert!(rib.adj_in(&peer).is_none());
    }

    #[test]
    fn test_candidates_across_peers() {
        let mut rib = Rib::default();
        let prefix: IpNetwork = "203.0.113.0/24".parse().unwrap();
        for peer in ["192.0.2.2", "192.0.2.6"] {
            let peer: IpAddr = peer.parse().unwrap();
            rib.adj_in_mut(peer).insert(test_route("203.0.113.0/24", &peer.to_string()));
        }
        assert_eq!(rib.candidates(&prefix).len(), 2);
    }

    #[test]
    fn test_stale_sweep() {
        let mut table = AdjRibIn::default();
        table.insert(test_route("203.0.113.0/24", "192.0.2.2"));
        table.insert(test_route("198.51.100.0/24", "192.0.2.2"));
        table.mark_all_stale();
        table.clear_stale(&"203.0.113.0/24".parse().unwrap());
        let swept = table.sweep_stale();
        assert_eq!(swept, vec!["198.51.100.0/24".parse::<IpNetwork>().unwrap()]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_pathset_round_trip_via_attributes() {
        let set = PathSet {
            origin: Origin::Igp,
            as_path: AsPath::from_sequence(vec![65002, 65010]),
            next_hop: Some("192.0.2.2".parse().unwrap()),
            local_pref: Some(200),
            multi_exit_disc: Some(10),
            communities: CommunityList::from([65000u32 << 16 | 100].as_slice()),
            ..PathSet::default()
        };
        let prefix: IpNetwork = "203.0.113.0/24".parse().unwrap();
        let attrs = set.to_attributes(Family::ipv4_unicast(), prefix);
        let folded = PathSet::from_attributes(&attrs, None);
        assert_eq!(folded, set);
    }
}
