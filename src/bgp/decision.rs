//! The best-path decision process (RFC 4271 section 9.1.2).
//!
//! Candidates come from every peer's Adj-RIB-In; the winner lands in the
//! Loc-RIB. The comparison is a total order, so running the process twice
//! with no intervening input cannot change the outcome.

use std::cmp::Ordering;
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use log::trace;

use super::rib::{Rib, Route, ValidationState};

/// Default LOCAL_PREF when the attribute is absent (RFC 4271 9.1.1)
pub const DEFAULT_LOCAL_PREF: u32 = 100;

/// Environment the decision process consults: next-hop reachability,
/// IGP costs, and the advanced-feature managers' verdicts.
pub struct DecisionContext<'a> {
    /// Exclude routes whose RPKI validation failed
    pub reject_invalid: bool,
    /// Is this next-hop currently resolvable in the host's routing view
    pub resolves: Box<dyn Fn(&IpAddr) -> bool + 'a>,
    /// IGP cost to reach a next-hop (None when unknown; unknown ties)
    pub igp_cost: Box<dyn Fn(&IpAddr) -> Option<u32> + 'a>,
    /// Flap damping verdict for a prefix learned from a peer
    pub suppressed: Box<dyn Fn(&IpNetwork, &IpAddr) -> bool + 'a>,
}

impl<'a> Default for DecisionContext<'a> {
    fn default() -> Self {
        Self {
            reject_invalid: false,
            resolves: Box::new(|_| true),
            igp_cost: Box::new(|_| None),
            suppressed: Box::new(|_, _| false),
        }
    }
}

/// Compare two candidate routes; `Ordering::Less` means `a` wins.
///
/// The nine steps, first difference decides:
/// (a) higher LOCAL_PREF, (b) shorter AS_PATH (an AS_SET counts as one),
/// (c) lower ORIGIN, (d) lower MED between routes from the same
/// neighboring AS, (e) eBGP over iBGP, (f) lower IGP cost to the
/// NEXT_HOP, (g) older route, (h) lower BGP identifier, (i) lower peer
/// address.
pub fn compare(a: &Route, b: &Route, ctx: &DecisionContext) -> Ordering {
    let local_pref = |r: &Route| r.attributes.local_pref.unwrap_or(DEFAULT_LOCAL_PREF);
    // (a) higher wins, so compare reversed
    let ordering = local_pref(b).cmp(&local_pref(a));
    if ordering != Ordering::Equal {
        return ordering;
    }

    // (b)
    let ordering = a
        .attributes
        .as_path
        .path_length()
        .cmp(&b.attributes.as_path.path_length());
    if ordering != Ordering::Equal {
        return ordering;
    }

    // (c)
    let ordering = a.attributes.origin.cmp(&b.attributes.origin);
    if ordering != Ordering::Equal {
        return ordering;
    }

    // (d) MED compares only within the same neighboring AS; absent MED
    // counts as zero
    let neighbor_as = |r: &Route| r.attributes.as_path.first_asn();
    if neighbor_as(a).is_some() && neighbor_as(a) == neighbor_as(b) {
        let med = |r: &Route| r.attributes.multi_exit_disc.unwrap_or(0);
        let ordering = med(a).cmp(&med(b));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    // (e) eBGP-learned beats iBGP-learned
    let ordering = b.is_ebgp().cmp(&a.is_ebgp());
    if ordering != Ordering::Equal {
        return ordering;
    }

    // (f) lower IGP cost to the next-hop; unknown costs tie
    let cost = |r: &Route| r.attributes.next_hop.as_ref().and_then(|nh| (ctx.igp_cost)(nh));
    if let (Some(cost_a), Some(cost_b)) = (cost(a), cost(b)) {
        let ordering = cost_a.cmp(&cost_b);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    // (g) oldest route wins
    let ordering = a.received_at.cmp(&b.received_at);
    if ordering != Ordering::Equal {
        return ordering;
    }

    // (h) lower BGP identifier
    let ordering = a.router_id.cmp(&b.router_id);
    if ordering != Ordering::Equal {
        return ordering;
    }

    // (i) lower peer address
    a.peer_ip.cmp(&b.peer_ip)
}

/// One Loc-RIB delta produced by a decision run
#[derive(Debug, Clone)]
pub struct LocRibChange {
    pub prefix: IpNetwork,
    pub new_best: Option<Arc<Route>>,
}

/// Re-decide the given prefixes, mutating the Loc-RIB in place.
/// Returns only the prefixes whose best route actually changed.
pub fn decide(rib: &mut Rib, prefixes: &[IpNetwork], ctx: &DecisionContext) -> Vec<LocRibChange> {
    let mut changes = Vec::new();
    for prefix in prefixes {
        let best: Option<Route> = {
            let mut candidates: Vec<&Route> = rib
                .candidates(prefix)
                .into_iter()
                .filter(|route| !(ctx.reject_invalid && route.validation == ValidationState::Invalid))
                .filter(|route| !(ctx.suppressed)(prefix, &route.peer_ip))
                .filter(|route| match &route.attributes.next_hop {
                    Some(next_hop) => (ctx.resolves)(next_hop),
                    None => false,
                })
                .collect();
            candidates.sort_by(|a, b| compare(a, b, ctx));
            candidates.first().map(|route| (*route).clone())
        };

        let current = rib.loc.get(prefix);
        let changed = match (&current, &best) {
            (None, None) => false,
            (Some(old), Some(new)) => {
                old.peer_ip != new.peer_ip || old.received_at != new.received_at
            }
            _ => true,
        };
        if !changed {
            continue;
        }

        let new_best = best.map(Arc::new);
        match &new_best {
            Some(route) => {
                trace!("Loc-RIB[{}] now via {}", prefix, route.peer_ip);
                rib.loc.install(Arc::clone(route));
            }
            None => {
                trace!("Loc-RIB[{}] withdrawn", prefix);
                rib.loc.remove(prefix);
            }
        }
        changes.push(LocRibChange {
            prefix: *prefix,
            new_best,
        });
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::community::CommunityList;
    use crate::bgp::families::Family;
    use crate::bgp::msg::{AsPath, Origin};
    use crate::bgp::rib::PathSet;
    use chrono::{Duration, Utc};

    fn route(prefix: &str, peer_ip: &str, router_id: &str, remote_as: u32) -> Route {
        Route {
            family: Family::ipv4_unicast(),
            prefix: prefix.parse().unwrap(),
            attributes: Arc::new(PathSet {
                origin: Origin::Igp,
                as_path: AsPath::from_sequence(vec![remote_as]),
                next_hop: Some("192.0.2.2".parse().unwrap()),
                local_pref: None,
                multi_exit_disc: None,
                communities: CommunityList::default(),
                ..PathSet::default()
            }),
            peer_ip: peer_ip.parse().unwrap(),
            router_id: router_id.parse().unwrap(),
            remote_as,
            local_as: 65001,
            received_at: Utc::now(),
            validation: ValidationState::Unverified,
            stale: false,
        }
    }

    fn with_attrs(mut r: Route, f: impl FnOnce(&mut PathSet)) -> Route {
        let mut attributes = (*r.attributes).clone();
        f(&mut attributes);
        r.attributes = Arc::new(attributes);
        r
    }

    #[test]
    fn test_local_pref_wins_first() {
        let ctx = DecisionContext::default();
        let a = with_attrs(route("10.0.0.0/24", "192.0.2.2", "10.0.1.2", 65002), |s| {
            s.local_pref = Some(200)
        });
        // Shorter AS path loses to higher local-pref
        let b = with_attrs(route("10.0.0.0/24", "192.0.2.6", "10.0.1.3", 65003), |s| {
            s.local_pref = Some(100);
            s.as_path = AsPath::default();
        });
        assert_eq!(compare(&a, &b, &ctx), Ordering::Less);
    }

    #[test]
    fn test_as_path_length_tiebreak() {
        let ctx = DecisionContext::default();
        let x = with_attrs(route("198.51.100.0/24", "192.0.2.2", "10.0.1.2", 65010), |s| {
            s.as_path = AsPath::from_sequence(vec![65010, 65020, 65030]);
        });
        let y = with_attrs(route("198.51.100.0/24", "192.0.2.6", "10.0.1.3", 65040), |s| {
            s.as_path = AsPath::from_sequence(vec![65040, 65050]);
        });
        // Y wins by step (b)
        assert_eq!(compare(&y, &x, &ctx), Ordering::Less);
        assert_eq!(compare(&x, &y, &ctx), Ordering::Greater);
    }

    #[test]
    fn test_as_set_counts_as_one() {
        use crate::bgp::msg::Segment;
        let ctx = DecisionContext::default();
        let set_path = with_attrs(route("10.0.0.0/24", "192.0.2.2", "10.0.1.2", 65002), |s| {
            s.as_path = AsPath {
                segments: vec![
                    Segment::AsSequence(vec![65002]),
                    Segment::AsSet(vec![65031, 65032, 65033]),
                ],
            };
        });
        let seq_path = with_attrs(route("10.0.0.0/24", "192.0.2.6", "10.0.1.3", 65002), |s| {
            s.as_path = AsPath::from_sequence(vec![65002, 65031, 65032]);
        });
        // 2 (sequence + set) beats 3
        assert_eq!(compare(&set_path, &seq_path, &ctx), Ordering::Less);
    }

    #[test]
    fn test_origin_tiebreak() {
        let ctx = DecisionContext::default();
        let igp = route("10.0.0.0/24", "192.0.2.2", "10.0.1.2", 65002);
        let incomplete =
            with_attrs(route("10.0.0.0/24", "192.0.2.6", "10.0.1.3", 65003), |s| {
                s.origin = Origin::Incomplete
            });
        assert_eq!(compare(&igp, &incomplete, &ctx), Ordering::Less);
    }

    #[test]
    fn test_med_only_within_same_neighbor_as() {
        let ctx = DecisionContext::default();
        let low_med = with_attrs(route("10.0.0.0/24", "192.0.2.2", "10.0.1.2", 65002), |s| {
            s.multi_exit_disc = Some(10)
        });
        let high_med = with_attrs(route("10.0.0.0/24", "192.0.2.6", "10.0.1.3", 65002), |s| {
            s.multi_exit_disc = Some(50)
        });
        assert_eq!(compare(&low_med, &high_med, &ctx), Ordering::Less);

        // Different neighbor AS: MED is skipped, (e)+(g..i) decide
        let other_as = with_attrs(route("10.0.0.0/24", "192.0.2.6", "10.0.1.3", 65099), |s| {
            s.as_path = AsPath::from_sequence(vec![65099]);
            s.multi_exit_disc = Some(0);
        });
        let mut med_ignored =
            with_attrs(route("10.0.0.0/24", "192.0.2.2", "10.0.1.1", 65002), |s| {
                s.multi_exit_disc = Some(1000)
            });
        med_ignored.received_at = other_as.received_at;
        // Both eBGP, same path length, same age: falls through MED to
        // router-id
        assert_eq!(compare(&med_ignored, &other_as, &ctx), Ordering::Less);
    }

    #[test]
    fn test_ebgp_beats_ibgp() {
        let ctx = DecisionContext::default();
        let ebgp = route("10.0.0.0/24", "192.0.2.2", "10.0.1.9", 65002);
        let mut ibgp = route("10.0.0.0/24", "192.0.2.6", "10.0.1.1", 65001);
        ibgp.received_at = ibgp.received_at - Duration::seconds(60);
        assert_eq!(compare(&ebgp, &ibgp, &ctx), Ordering::Less);
    }

    #[test]
    fn test_igp_cost_tiebreak() {
        let near: IpAddr = "192.0.2.2".parse().unwrap();
        let ctx = DecisionContext {
            igp_cost: Box::new(move |nh| if *nh == near { Some(5) } else { Some(20) }),
            ..DecisionContext::default()
        };
        let a = route("10.0.0.0/24", "192.0.2.2", "10.0.1.2", 65002);
        let b = with_attrs(route("10.0.0.0/24", "192.0.2.6", "10.0.1.3", 65002), |s| {
            s.next_hop = Some("192.0.2.6".parse().unwrap())
        });
        assert_eq!(compare(&a, &b, &ctx), Ordering::Less);
    }

    #[test]
    fn test_oldest_then_router_id_then_peer_ip() {
        let ctx = DecisionContext::default();
        let newer = route("10.0.0.0/24", "192.0.2.2", "10.0.1.2", 65002);
        let mut older = route("10.0.0.0/24", "192.0.2.6", "10.0.1.9", 65002);
        older.received_at = newer.received_at - Duration::seconds(30);
        assert_eq!(compare(&older, &newer, &ctx), Ordering::Less);

        let mut same_age = route("10.0.0.0/24", "192.0.2.6", "10.0.1.9", 65002);
        same_age.received_at = newer.received_at;
        // Lower router-id wins
        assert_eq!(compare(&newer, &same_age, &ctx), Ordering::Less);
    }

    #[test]
    fn test_decide_installs_and_withdraws() {
        let mut rib = Rib::default();
        let prefix: IpNetwork = "203.0.113.0/24".parse().unwrap();
        let peer: IpAddr = "192.0.2.2".parse().unwrap();
        rib.adj_in_mut(peer)
            .insert(route("203.0.113.0/24", "192.0.2.2", "10.0.1.2", 65002));

        let ctx = DecisionContext::default();
        let changes = decide(&mut rib, &[prefix], &ctx);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].new_best.is_some());
        assert!(rib.loc.get(&prefix).is_some());

        // Idempotent: a second run with no input changes nothing
        let changes = decide(&mut rib, &[prefix], &ctx);
        assert!(changes.is_empty());

        rib.adj_in_mut(peer).withdraw(&prefix);
        let changes = decide(&mut rib, &[prefix], &ctx);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].new_best.is_none());
        assert!(rib.loc.get(&prefix).is_none());
    }

    #[test]
    fn test_unresolvable_next_hop_excluded() {
        let mut rib = Rib::default();
        let prefix: IpNetwork = "203.0.113.0/24".parse().unwrap();
        let peer: IpAddr = "192.0.2.2".parse().unwrap();
        rib.adj_in_mut(peer)
            .insert(route("203.0.113.0/24", "192.0.2.2", "10.0.1.2", 65002));

        let ctx = DecisionContext {
            resolves: Box::new(|_| false),
            ..DecisionContext::default()
        };
        let changes = decide(&mut rib, &[prefix], &ctx);
        assert!(changes.is_empty());
        assert!(rib.loc.get(&prefix).is_none());
    }

    #[test]
    fn test_invalid_routes_excluded_when_rejecting() {
        let mut rib = Rib::default();
        let prefix: IpNetwork = "203.0.113.0/24".parse().unwrap();
        let peer: IpAddr = "192.0.2.2".parse().unwrap();
        let mut bad = route("203.0.113.0/24", "192.0.2.2", "10.0.1.2", 65002);
        bad.validation = ValidationState::Invalid;
        rib.adj_in_mut(peer).insert(bad);

        let ctx = DecisionContext {
            reject_invalid: true,
            ..DecisionContext::default()
        };
        assert!(decide(&mut rib, &[prefix], &ctx).is_empty());
        let ctx = DecisionContext::default();
        assert_eq!(decide(&mut rib, &[prefix], &ctx).len(), 1);
    }
}
