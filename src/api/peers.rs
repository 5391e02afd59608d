use std::sync::Arc;

use super::rpc::{PeerDetail, PeerSummary};
use crate::bgp::Session;
use crate::config::PeerConfig;
use crate::utils::format_time_as_elapsed;

pub(super) fn peer_to_summary(
    config: Arc<PeerConfig>,
    session: Option<&Session>,
    prefixes_received: Option<u64>,
) -> PeerSummary {
    match session {
        Some(session) => PeerSummary {
            peer: session.addr.to_string(),
            enabled: config.enabled,
            router_id: Some(session.router_id.into()),
            remote_asn: config.remote_as,
            local_asn: config.local_as,
            msg_received: Some(session.counts.received()),
            msg_sent: Some(session.counts.sent()),
            uptime: Some(format_time_as_elapsed(session.connect_time)),
            state: session.state().to_string(),
            prefixes_received,
        },
        None => PeerSummary {
            peer: config.remote_ip.to_string(),
            enabled: config.enabled,
            router_id: None,
            remote_asn: config.remote_as,
            local_asn: config.local_as,
            msg_received: None,
            msg_sent: None,
            uptime: None,
            state: "Idle".to_string(),
            prefixes_received: None,
        },
    }
}

pub(super) fn peer_to_detail(
    config: Arc<PeerConfig>,
    session: Option<&Session>,
    prefixes_received: Option<u64>,
) -> PeerDetail {
    let summary = peer_to_summary(config.clone(), session, prefixes_received);
    match session {
        Some(session) => PeerDetail {
            summary,
            hold_timer: session.hold_timer.hold_timer,
            hold_timer_interval: session.hold_timer.interval,
            last_received: Some(format_time_as_elapsed(session.hold_timer.last_received)),
            last_sent: Some(format_time_as_elapsed(session.hold_timer.last_sent)),
            capabilities: session.capabilities.describe(),
        },
        None => PeerDetail {
            summary,
            hold_timer: config.hold_timer,
            hold_timer_interval: config.hold_timer / 3,
            last_received: None,
            last_sent: None,
            capabilities: vec![],
        },
    }
}
