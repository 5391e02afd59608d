//! Shaping a Loc-RIB route for advertisement to one peer: split-horizon
//! and reflection rules, export policy, and the eBGP/iBGP attribute
//! rewrites.

use std::net::IpAddr;
use std::net::Ipv4Addr;

use super::decision::DEFAULT_LOCAL_PREF;
use super::reflector::{PeerRole, RouteReflector};
use super::rib::{AdvertisedRoute, Route};
use crate::config::PeerConfig;

pub struct ExportContext<'a> {
    pub local_as: u32,
    pub router_id: Ipv4Addr,
    /// Set when this speaker is a configured route reflector
    pub reflector: Option<RouteReflector>,
    /// iBGP role of the peer a route was learned from
    pub role_of: Box<dyn Fn(&IpAddr) -> Option<PeerRole> + 'a>,
    /// Our address on the TCP session towards the target peer, for
    /// NEXT_HOP rewriting on eBGP export
    pub local_addr: Option<IpAddr>,
}

/// Shape `route` for advertisement to `peer`, or None when the route must
/// not be sent there.
pub fn export_route(
    route: &Route,
    peer: &PeerConfig,
    ctx: &ExportContext,
) -> Option<AdvertisedRoute> {
    if !peer.families.contains(&route.family) {
        return None;
    }
    // Never hand a route back to the peer that announced it
    if peer.remote_ip.contains(route.peer_ip) {
        return None;
    }

    let learned_ibgp = !route.is_ebgp();
    let target_ibgp = !peer.is_ebgp();
    let mut attributes = (*route.attributes).clone();

    if learned_ibgp && target_ibgp {
        // iBGP split horizon unless reflection rules permit
        let reflector = ctx.reflector.as_ref()?;
        let from_role = (ctx.role_of)(&route.peer_ip).unwrap_or(PeerRole::NonClient);
        let to_role = peer.role.unwrap_or(PeerRole::NonClient);
        if !reflector.should_reflect(from_role, to_role) {
            return None;
        }
        attributes = reflector.prepare(&attributes, route.router_id);
    }

    // Export policy runs before the Adj-RIB-Out write
    let mut attributes = match &peer.export_policy {
        Some(policy) => policy.apply(&route.prefix, &attributes)?,
        None => attributes,
    };

    if peer.is_ebgp() {
        // NEXT_HOP becomes the local peering address; LOCAL_PREF and
        // reflection attributes stay inside the AS
        if let Some(local_addr) = ctx.local_addr {
            attributes.next_hop = Some(local_addr);
        }
        attributes.local_pref = None;
        attributes.originator_id = None;
        attributes.cluster_list.clear();
        attributes.as_path.prepend(ctx.local_as);
    } else {
        // NEXT_HOP is preserved on iBGP export
        if attributes.local_pref.is_none() {
            attributes.local_pref = Some(DEFAULT_LOCAL_PREF);
        }
    }

    Some(AdvertisedRoute {
        family: route.family,
        prefix: route.prefix,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::families::Family;
    use crate::bgp::msg::{AsPath, Origin};
    use crate::bgp::rib::{PathSet, ValidationState};
    use crate::bgp::policy::{Policy, PolicyAction, PolicyRule};
    use chrono::Utc;
    use ipnetwork::IpNetwork;
    use std::sync::Arc;

    fn peer(remote_ip: &str, remote_as: u32, role: Option<PeerRole>) -> PeerConfig {
        PeerConfig {
            remote_ip: remote_ip.parse().unwrap(),
            remote_as,
            local_as: 65001,
            local_router_id: "10.0.1.1".parse().unwrap(),
            enabled: true,
            passive: false,
            hold_timer: 180,
            dest_port: 179,
            families: vec![Family::ipv4_unicast(), Family::ipv6_unicast()],
            role,
            import_policy: None,
            export_policy: None,
        }
    }

    fn learned(prefix: &str, from_peer: &str, remote_as: u32) -> Route {
        Route {
            family: Family::ipv4_unicast(),
            prefix: prefix.parse().unwrap(),
            attributes: Arc::new(PathSet {
                origin: Origin::Igp,
                as_path: AsPath::from_sequence(vec![remote_as]),
                next_hop: Some("192.0.2.2".parse().unwrap()),
                ..PathSet::default()
            }),
            peer_ip: from_peer.parse().unwrap(),
            router_id: "10.0.1.2".parse().unwrap(),
            remote_as,
            local_as: 65001,
            received_at: Utc::now(),
            validation: ValidationState::Unverified,
            stale: false,
        }
    }

    fn ibgp_learned(prefix: &str, from_peer: &str) -> Route {
        let mut route = learned(prefix, from_peer, 65001);
        let mut attributes = (*route.attributes).clone();
        attributes.as_path = AsPath::default();
        attributes.local_pref = Some(100);
        route.attributes = Arc::new(attributes);
        route
    }

    fn ctx<'a>() -> ExportContext<'a> {
        ExportContext {
            local_as: 65001,
            router_id: "10.0.1.1".parse().unwrap(),
            reflector: None,
            role_of: Box::new(|_| None),
            local_addr: Some("192.0.2.1".parse().unwrap()),
        }
    }

    #[test]
    fn test_not_back_to_announcing_peer() {
        let route = learned("203.0.113.0/24", "192.0.2.2", 65002);
        let back = peer("192.0.2.2", 65002, None);
        assert!(export_route(&route, &back, &ctx()).is_none());
    }

    #[test]
    fn test_ebgp_export_rewrites() {
        let route = learned("203.0.113.0/24", "192.0.2.2", 65002);
        let target = peer("198.51.100.2", 65099, None);
        let advertised = export_route(&route, &target, &ctx()).unwrap();
        // NEXT_HOP overwritten with the local peering address
        assert_eq!(
            advertised.attributes.next_hop,
            Some("192.0.2.1".parse().unwrap())
        );
        // Local AS prepended
        assert_eq!(advertised.attributes.as_path.first_asn(), Some(65001));
        assert_eq!(advertised.attributes.local_pref, None);
    }

    #[test]
    fn test_ibgp_split_horizon_without_reflector() {
        let route = ibgp_learned("203.0.113.0/24", "192.0.2.2");
        let target = peer("192.0.2.6", 65001, None);
        assert!(export_route(&route, &target, &ctx()).is_none());
    }

    #[test]
    fn test_ibgp_export_preserves_next_hop() {
        // eBGP-learned route to an iBGP peer: allowed, next-hop untouched
        let route = learned("203.0.113.0/24", "192.0.2.2", 65002);
        let target = peer("192.0.2.6", 65001, None);
        let advertised = export_route(&route, &target, &ctx()).unwrap();
        assert_eq!(
            advertised.attributes.next_hop,
            Some("192.0.2.2".parse().unwrap())
        );
        assert_eq!(advertised.attributes.local_pref, Some(100));
    }

    #[test]
    fn test_reflection_client_to_non_client() {
        let from_client: IpAddr = "192.0.2.2".parse().unwrap();
        let reflector = RouteReflector::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.1.1".parse().unwrap(),
        );
        let context = ExportContext {
            reflector: Some(reflector),
            role_of: Box::new(move |addr| {
                if *addr == from_client {
                    Some(PeerRole::Client)
                } else {
                    Some(PeerRole::NonClient)
                }
            }),
            ..ctx()
        };
        let route = ibgp_learned("192.0.2.0/24", "192.0.2.2");
        let target = peer("192.0.2.6", 65001, Some(PeerRole::NonClient));
        let advertised = export_route(&route, &target, &context).unwrap();
        // Reflection stamps ORIGINATOR_ID and the cluster list
        assert_eq!(
            advertised.attributes.originator_id,
            Some("10.0.1.2".parse().unwrap())
        );
        assert_eq!(
            advertised.attributes.cluster_list,
            vec!["10.0.0.1".parse::<Ipv4Addr>().unwrap()]
        );
    }

    #[test]
    fn test_reflection_non_client_to_non_client_blocked() {
        let reflector = RouteReflector::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.1.1".parse().unwrap(),
        );
        let context = ExportContext {
            reflector: Some(reflector),
            role_of: Box::new(|_| Some(PeerRole::NonClient)),
            ..ctx()
        };
        let route = ibgp_learned("192.0.2.0/24", "192.0.2.2");
        let target = peer("192.0.2.6", 65001, Some(PeerRole::NonClient));
        assert!(export_route(&route, &target, &context).is_none());
    }

    #[test]
    fn test_export_policy_reject() {
        let route = learned("203.0.113.0/24", "192.0.2.2", 65002);
        let mut target = peer("198.51.100.2", 65099, None);
        target.export_policy = Some(Arc::new(Policy {
            name: "deny".to_string(),
            rules: vec![PolicyRule {
                name: "deny-all".to_string(),
                matches: vec![],
                actions: vec![PolicyAction::Reject],
            }],
            default_accept: true,
        }));
        assert!(export_route(&route, &target, &ctx()).is_none());
    }

    #[test]
    fn test_family_not_negotiated() {
        let route = learned("203.0.113.0/24", "192.0.2.2", 65002);
        let mut target = peer("198.51.100.2", 65099, None);
        target.families = vec![Family::ipv6_unicast()];
        assert!(export_route(&route, &target, &ctx()).is_none());
    }

    #[test]
    fn test_reflected_route_prefix_survives() {
        let route = learned("203.0.113.0/24", "192.0.2.2", 65002);
        let target = peer("192.0.2.6", 65001, None);
        let advertised = export_route(&route, &target, &ctx()).unwrap();
        assert_eq!(
            advertised.prefix,
            "203.0.113.0/24".parse::<IpNetwork>().unwrap()
        );
    }
}
