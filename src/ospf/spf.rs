//! The shortest-path-first computation (RFC 2328 section 16): a directed
//! graph from Router and Network LSAs, Dijkstra rooted at this router,
//! and the resulting routing table. The result is a pure function of the
//! database, so LSA arrival order cannot change it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeMap, HashMap};
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use log::debug;

use super::interface::Interface;
use super::lsa::{link_type, ls_type, LsaBody, RouterLink};
use super::lsdb::Lsdb;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfRoute {
    pub prefix: Ipv4Network,
    pub cost: u32,
    pub next_hop: Ipv4Addr,
    pub interface: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum NodeId {
    Router(Ipv4Addr),
    Network(Ipv4Addr),
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    to: NodeId,
    cost: u32,
    /// The advertiser's interface address on this link (used to find the
    /// next-hop address of first-hop routers)
    via: Ipv4Addr,
}

#[derive(Debug, Clone, Copy)]
struct NodeState {
    cost: u32,
    hops: u32,
    /// First-hop router-id out of the root (root's neighbors point at
    /// themselves)
    first_hop_id: Ipv4Addr,
    /// Packet next-hop: the first-hop neighbor's interface address
    next_hop: Ipv4Addr,
}

/// Compute the routing table from the database, rooted at `router_id`.
/// `interfaces` supply the outgoing interface names for next-hops.
pub fn compute(lsdb: &Lsdb, router_id: Ipv4Addr, interfaces: &[&Interface]) -> Vec<SpfRoute> {
    // Graph build. BTreeMap keeps iteration deterministic.
    let mut edges: BTreeMap<NodeId, Vec<Edge>> = BTreeMap::new();
    let mut stubs: BTreeMap<Ipv4Addr, Vec<(Ipv4Network, u32)>> = BTreeMap::new();
    let mut network_masks: HashMap<Ipv4Addr, Ipv4Addr> = HashMap::new();
    // Interface addresses per router, keyed by (router, neighbor it faces)
    let mut p2p_addr: HashMap<(Ipv4Addr, Ipv4Addr), Ipv4Addr> = HashMap::new();
    let mut transit_addr: HashMap<(Ipv4Addr, Ipv4Addr), Ipv4Addr> = HashMap::new();

    for lsa in lsdb.lsas() {
        match &lsa.body {
            LsaBody::Router { links, .. } => {
                let from = lsa.header.advertising_router;
                for RouterLink {
                    link_id,
                    link_data,
                    link_type: kind,
                    metric,
                } in links
                {
                    match *kind {
                        link_type::POINT_TO_POINT => {
                            edges.entry(NodeId::Router(from)).or_default().push(Edge {
                                to: NodeId::Router(*link_id),
                                cost: u32::from(*metric),
                                via: *link_data,
                            });
                            p2p_addr.insert((from, *link_id), *link_data);
                        }
                        link_type::TRANSIT => {
                            edges.entry(NodeId::Router(from)).or_default().push(Edge {
                                to: NodeId::Network(*link_id),
                                cost: u32::from(*metric),
                                via: *link_data,
                            });
                            transit_addr.insert((from, *link_id), *link_data);
                        }
                        link_type::STUB => {
                            if let Ok(prefix) = Ipv4Network::with_netmask(*link_id, *link_data)
                            {
                                stubs
                                    .entry(from)
                                    .or_default()
                                    .push((prefix, u32::from(*metric)));
                            }
                        }
                        _ => (),
                    }
                }
            }
            LsaBody::Network {
                network_mask,
                attached_routers,
            } => {
                let network = NodeId::Network(lsa.header.link_state_id);
                network_masks.insert(lsa.header.link_state_id, *network_mask);
                for attached in attached_routers {
                    edges.entry(network).or_default().push(Edge {
                        to: NodeId::Router(*attached),
                        cost: 0,
                        via: lsa.header.link_state_id,
                    });
                }
            }
            _ => (),
        }
    }

    // A link is usable only when the far end also claims it (RFC 2328
    // 16.1 step 2b)
    let has_back_link = |from: NodeId, to: NodeId| -> bool {
        edges
            .get(&to)
            .map(|back| back.iter().any(|edge| edge.to == from))
            .unwrap_or(false)
    };

    // Dijkstra. The heap orders by (cost, hops, first-hop id) so equal-cost
    // ties resolve to fewer hops, then the lower neighbor router-id.
    let root = NodeId::Router(router_id);
    let mut best: HashMap<NodeId, NodeState> = HashMap::new();
    best.insert(
        root,
        NodeState {
            cost: 0,
            hops: 0,
            first_hop_id: router_id,
            next_hop: Ipv4Addr::UNSPECIFIED,
        },
    );
    let mut heap: BinaryHeap<Reverse<(u32, u32, Ipv4Addr, NodeId)>> = BinaryHeap::new();
    heap.push(Reverse((0, 0, router_id, root)));

    while let Some(Reverse((cost, hops, first_hop_id, node))) = heap.pop() {
        let state = match best.get(&node) {
            Some(state)
                if (state.cost, state.hops, state.first_hop_id)
                    < (cost, hops, first_hop_id) =>
            {
                continue;
            }
            Some(state) => *state,
            None => continue,
        };
        let Some(outgoing) = edges.get(&node) else {
            continue;
        };
        for edge in outgoing {
            if !has_back_link(node, edge.to) {
                continue;
            }
            let next_cost = cost.saturating_add(edge.cost);
            let next_hops = hops + 1;

            // Resolve the first hop for this candidate path
            let (candidate_first_id, candidate_next_hop) = if node == root {
                match edge.to {
                    NodeId::Router(neighbor_id) => {
                        // The neighbor's address is its interface towards us
                        let addr = p2p_addr
                            .get(&(neighbor_id, router_id))
                            .copied()
                            .unwrap_or(Ipv4Addr::UNSPECIFIED);
                        (neighbor_id, addr)
                    }
                    // First hop onto a directly attached network: routers
                    // beyond it become first hops themselves
                    NodeId::Network(_) => (router_id, Ipv4Addr::UNSPECIFIED),
                }
            } else if state.first_hop_id == router_id && state.next_hop == Ipv4Addr::UNSPECIFIED
            {
                // node is a directly attached network; the attached router
                // is the real first hop
                match edge.to {
                    NodeId::Router(neighbor_id) => {
                        let network_id = match node {
                            NodeId::Network(addr) => addr,
                            NodeId::Router(_) => unreachable!("root-adjacent network"),
                        };
                        let addr = transit_addr
                            .get(&(neighbor_id, network_id))
                            .copied()
                            .unwrap_or(Ipv4Addr::UNSPECIFIED);
                        (neighbor_id, addr)
                    }
                    NodeId::Network(_) => (state.first_hop_id, state.next_hop),
                }
            } else {
                (state.first_hop_id, state.next_hop)
            };

            let candidate = NodeState {
                cost: next_cost,
                hops: next_hops,
                first_hop_id: candidate_first_id,
                next_hop: candidate_next_hop,
            };
            let improves = match best.get(&edge.to) {
                Some(current) => {
                    (candidate.cost, candidate.hops, candidate.first_hop_id)
                        < (current.cost, current.hops, current.first_hop_id)
                }
                None => true,
            };
            if improves {
                best.insert(edge.to, candidate);
                heap.push(Reverse((
                    candidate.cost,
                    candidate.hops,
                    candidate.first_hop_id,
                    edge.to,
                )));
            }
        }
    }

    // Emit routes: remote stubs, transit networks, then externals
    let interface_for = |next_hop: Ipv4Addr| -> Option<&&Interface> {
        interfaces
            .iter()
            .find(|iface| iface.config.address.contains(next_hop))
    };
    let mut routes: BTreeMap<Ipv4Network, SpfRoute> = BTreeMap::new();
    let mut add_route = |prefix: Ipv4Network, cost: u32, next_hop: Ipv4Addr| {
        let Some(interface) = interface_for(next_hop) else {
            return;
        };
        let candidate = SpfRoute {
            prefix,
            cost,
            next_hop,
            interface: interface.config.name.clone(),
        };
        match routes.get(&prefix) {
            Some(existing) if existing.cost <= cost => (),
            _ => {
                routes.insert(prefix, candidate);
            }
        }
    };

    for (router, router_stubs) in &stubs {
        if *router == router_id {
            continue; // our own stubs are connected routes
        }
        let Some(state) = best.get(&NodeId::Router(*router)) else {
            continue;
        };
        for (prefix, metric) in router_stubs {
            add_route(*prefix, state.cost + metric, state.next_hop);
        }
    }

    for (network_id, mask) in &network_masks {
        let Some(state) = best.get(&NodeId::Network(*network_id)) else {
            continue;
        };
        if let Ok(raw) = Ipv4Network::with_netmask(*network_id, *mask) {
            // Skip our own attached networks
            if state.next_hop != Ipv4Addr::UNSPECIFIED {
                let prefix = Ipv4Network::new(raw.network(), raw.prefix())
                    .expect("mask came from a valid network");
                add_route(prefix, state.cost, state.next_hop);
            }
        }
    }

    // AS-external routes from reachable ASBRs, at path-cost + metric
    for lsa in lsdb.lsas() {
        if lsa.header.ls_type != ls_type::EXTERNAL {
            continue;
        }
        if let LsaBody::External {
            network_mask,
            metric,
            ..
        } = &lsa.body
        {
            let Some(state) = best.get(&NodeId::Router(lsa.header.advertising_router)) else {
                continue;
            };
            if state.next_hop == Ipv4Addr::UNSPECIFIED {
                continue;
            }
            if let Ok(prefix) =
                Ipv4Network::with_netmask(lsa.header.link_state_id, *network_mask)
            {
                add_route(prefix, state.cost + metric, state.next_hop);
            }
        }
    }

    let table: Vec<SpfRoute> = routes.into_values().collect();
    debug!("SPF complete: {} routes", table.len());
    table
}

#[cfg(test)]
mod tests {
    use super::super::lsa::{Lsa, LsaBody, RouterLink};
    use super::super::INITIAL_SEQUENCE;
    use super::*;
    use crate::config::{NetworkKind, OspfInterfaceConfig};

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn iface(name: &str, address: &str) -> Interface {
        Interface::new(OspfInterfaceConfig {
            name: name.to_string(),
            address: address.parse().unwrap(),
            hello_interval: 10,
            dead_interval: 40,
            priority: 1,
            cost: 10,
            network: NetworkKind::PointToPoint,
        })
    }

    fn p2p(link_id: &str, link_data: &str, metric: u16) -> RouterLink {
        RouterLink {
            link_id: addr(link_id),
            link_data: addr(link_data),
            link_type: link_type::POINT_TO_POINT,
            metric,
        }
    }

    fn stub(network: &str, mask: &str, metric: u16) -> RouterLink {
        RouterLink {
            link_id: addr(network),
            link_data: addr(mask),
            link_type: link_type::STUB,
            metric,
        }
    }

    fn router_lsa(router: &str, links: Vec<RouterLink>) -> Lsa {
        Lsa::build(
            ls_type::ROUTER,
            addr(router),
            addr(router),
            INITIAL_SEQUENCE,
            LsaBody::Router { flags: 0, links },
        )
    }

    /// Two routers on a /30, each with a /32 loopback stub
    fn two_router_db() -> Vec<Lsa> {
        vec![
            router_lsa(
                "10.0.1.1",
                vec![
                    p2p("10.0.1.2", "10.0.0.1", 10),
                    stub("10.0.0.0", "255.255.255.252", 10),
                    stub("10.0.1.1", "255.255.255.255", 0),
                ],
            ),
            router_lsa(
                "10.0.1.2",
                vec![
                    p2p("10.0.1.1", "10.0.0.2", 10),
                    stub("10.0.0.0", "255.255.255.252", 10),
                    stub("10.0.1.2", "255.255.255.255", 0),
                ],
            ),
        ]
    }

    fn run(lsas: Vec<Lsa>) -> Vec<SpfRoute> {
        let mut lsdb = Lsdb::default();
        for lsa in lsas {
            lsdb.install(lsa);
        }
        let interface = iface("eth0", "10.0.0.1/30");
        compute(&lsdb, addr("10.0.1.1"), &[&interface])
    }

    #[test]
    fn test_p2p_stub_route() {
        let routes = run(two_router_db());
        let loopback = routes
            .iter()
            .find(|route| route.prefix == "10.0.1.2/32".parse().unwrap())
            .expect("route to remote loopback");
        assert_eq!(loopback.cost, 10);
        assert_eq!(loopback.next_hop, addr("10.0.0.2"));
        assert_eq!(loopback.interface, "eth0");
    }

    #[test]
    fn test_own_stubs_not_emitted() {
        let routes = run(two_router_db());
        assert!(routes
            .iter()
            .all(|route| route.prefix != "10.0.1.1/32".parse().unwrap()));
    }

    #[test]
    fn test_arrival_order_does_not_matter() {
        let mut forward = two_router_db();
        let reversed: Vec<Lsa> = forward.iter().rev().cloned().collect();
        let a = run(forward.drain(..).collect());
        let b = run(reversed);
        assert_eq!(a, b);
    }

    #[test]
    fn test_unidirectional_link_unusable() {
        // Only one side claims the link
        let routes = run(vec![router_lsa(
            "10.0.1.1",
            vec![p2p("10.0.1.2", "10.0.0.1", 10)],
        )]);
        assert!(routes.is_empty());
    }

    #[test]
    fn test_three_router_chain() {
        // A -- B -- C, each hop cost 10; C has a loopback
        let lsas = vec![
            router_lsa(
                "10.0.1.1",
                vec![p2p("10.0.1.2", "10.0.0.1", 10)],
            ),
            router_lsa(
                "10.0.1.2",
                vec![
                    p2p("10.0.1.1", "10.0.0.2", 10),
                    p2p("10.0.1.3", "10.0.0.5", 10),
                ],
            ),
            router_lsa(
                "10.0.1.3",
                vec![
                    p2p("10.0.1.2", "10.0.0.6", 10),
                    stub("10.0.1.3", "255.255.255.255", 0),
                ],
            ),
        ];
        let routes = run(lsas);
        let remote = routes
            .iter()
            .find(|route| route.prefix == "10.0.1.3/32".parse().unwrap())
            .expect("route via B to C");
        assert_eq!(remote.cost, 20);
        // Next hop is B, the first hop towards C
        assert_eq!(remote.next_hop, addr("10.0.0.2"));
    }

    #[test]
    fn test_external_route_from_reachable_asbr() {
        let mut lsas = two_router_db();
        lsas.push(Lsa::build(
            ls_type::EXTERNAL,
            addr("198.51.100.0"),
            addr("10.0.1.2"),
            INITIAL_SEQUENCE,
            LsaBody::External {
                network_mask: addr("255.255.255.0"),
                type2: false,
                metric: 20,
                forwarding_address: Ipv4Addr::UNSPECIFIED,
                route_tag: 0,
            },
        ));
        let routes = run(lsas);
        let external = routes
            .iter()
            .find(|route| route.prefix == "198.51.100.0/24".parse().unwrap())
            .expect("external route");
        assert_eq!(external.cost, 30); // 10 to the ASBR + 20 external
        assert_eq!(external.next_hop, addr("10.0.0.2"));
    }
}
