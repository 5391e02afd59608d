use super::rpc::LearnedRoute;
use crate::bgp::rib::{AdvertisedRoute, Route};
use crate::utils::format_time_as_elapsed;

pub(super) fn route_to_learned(route: &Route) -> LearnedRoute {
    LearnedRoute {
        source: route.peer_ip.to_string(),
        afi: route.family.afi.to_string(),
        safi: route.family.safi.to_string(),
        received_at: route.received_at.timestamp(),
        age: format_time_as_elapsed(route.received_at),
        prefix: route.prefix.to_string(),
        next_hop: route.attributes.next_hop,
        origin: route.attributes.origin.to_string(),
        as_path: route.attributes.as_path.to_string(),
        local_pref: route.attributes.local_pref,
        multi_exit_disc: route.attributes.multi_exit_disc,
        communities: route
            .attributes
            .communities
            .iter()
            .map(|community| community.to_string())
            .collect(),
        validation: route.validation.to_string(),
        stale: route.stale,
    }
}

pub(super) fn advertised_to_learned(peer: &str, route: &AdvertisedRoute) -> LearnedRoute {
    LearnedRoute {
        source: peer.to_string(),
        afi: route.family.afi.to_string(),
        safi: route.family.safi.to_string(),
        received_at: 0,
        age: String::new(),
        prefix: route.prefix.to_string(),
        next_hop: route.attributes.next_hop,
        origin: route.attributes.origin.to_string(),
        as_path: route.attributes.as_path.to_string(),
        local_pref: route.attributes.local_pref,
        multi_exit_disc: route.attributes.multi_exit_disc,
        communities: route
            .attributes
            .communities
            .iter()
            .map(|community| community.to_string())
            .collect(),
        validation: "Unverified".to_string(),
        stale: false,
    }
}
