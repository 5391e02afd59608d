//! Graceful-restart helper mode (RFC 4724).
//!
//! When a peer that negotiated the Graceful-Restart capability drops, its
//! routes are kept in the Adj-RIB-In marked stale instead of being purged,
//! for the restart window the peer advertised. Routes the peer re-announces
//! after reconnecting are refreshed; the End-of-RIB marker (or the window
//! lapsing) sweeps whatever is still stale.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

use super::msg::GracefulRestartCap;

/// Stale window when the peer's capability did not carry a restart time
pub const DEFAULT_RESTART_SECS: u16 = 120;

/// What to do with a peer's routes when its session drops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Keep routes, marked stale, for the given window
    PreserveStale { restart_secs: u16 },
    /// No graceful restart negotiated: purge as usual
    Flush,
}

#[derive(Debug)]
struct RestartingPeer {
    deadline: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct GracefulRestartManager {
    enabled: bool,
    restarting: HashMap<IpAddr, RestartingPeer>,
}

impl GracefulRestartManager {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            restarting: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Call point: session left Established. The peer's advertised restart
    /// time is authoritative; the default applies only when the capability
    /// carried none.
    pub fn session_down(
        &mut self,
        peer_ip: IpAddr,
        negotiated: Option<GracefulRestartCap>,
    ) -> RestartDecision {
        if !self.enabled {
            return RestartDecision::Flush;
        }
        match negotiated {
            Some(cap) => {
                let restart_secs = if cap.restart_time > 0 {
                    cap.restart_time
                } else {
                    DEFAULT_RESTART_SECS
                };
                info!(
                    "Preserving routes from {} for {}s (graceful restart)",
                    peer_ip, restart_secs
                );
                self.restarting.insert(
                    peer_ip,
                    RestartingPeer {
                        deadline: Utc::now() + Duration::seconds(i64::from(restart_secs)),
                    },
                );
                RestartDecision::PreserveStale { restart_secs }
            }
            None => RestartDecision::Flush,
        }
    }

    pub fn is_restarting(&self, peer_ip: &IpAddr) -> bool {
        self.restarting.contains_key(peer_ip)
    }

    /// Call point: the restarted peer finished its initial re-advertisement
    /// (End-of-RIB). Returns true when a restart window was open; the
    /// caller then sweeps the routes still stale.
    pub fn end_of_rib(&mut self, peer_ip: &IpAddr) -> bool {
        if self.restarting.remove(peer_ip).is_some() {
            debug!("End-of-RIB from {}: closing restart window", peer_ip);
            true
        } else {
            false
        }
    }

    /// Peers whose restart window lapsed without an End-of-RIB; their stale
    /// routes must be flushed now.
    pub fn take_expired(&mut self) -> Vec<IpAddr> {
        let now = Utc::now();
        let expired: Vec<IpAddr> = self
            .restarting
            .iter()
            .filter(|(_, peer)| peer.deadline <= now)
            .map(|(addr, _)| *addr)
            .collect();
        for peer_ip in &expired {
            info!("Restart window for {} lapsed, flushing stale routes", peer_ip);
            self.restarting.remove(peer_ip);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> IpAddr {
        "192.0.2.2".parse().unwrap()
    }

    fn cap(restart_time: u16) -> GracefulRestartCap {
        GracefulRestartCap {
            restart_state: false,
            restart_time,
        }
    }

    #[test]
    fn test_disabled_always_flushes() {
        let mut gr = GracefulRestartManager::new(false);
        assert_eq!(gr.session_down(peer(), Some(cap(90))), RestartDecision::Flush);
    }

    #[test]
    fn test_peer_restart_time_is_authoritative() {
        let mut gr = GracefulRestartManager::new(true);
        assert_eq!(
            gr.session_down(peer(), Some(cap(90))),
            RestartDecision::PreserveStale { restart_secs: 90 }
        );
        assert!(gr.is_restarting(&peer()));
    }

    #[test]
    fn test_default_window_when_capability_has_no_time() {
        let mut gr = GracefulRestartManager::new(true);
        assert_eq!(
            gr.session_down(peer(), Some(cap(0))),
            RestartDecision::PreserveStale {
                restart_secs: DEFAULT_RESTART_SECS
            }
        );
    }

    #[test]
    fn test_no_capability_flushes() {
        let mut gr = GracefulRestartManager::new(true);
        assert_eq!(gr.session_down(peer(), None), RestartDecision::Flush);
    }

    #[test]
    fn test_end_of_rib_closes_window() {
        let mut gr = GracefulRestartManager::new(true);
        gr.session_down(peer(), Some(cap(90)));
        assert!(gr.end_of_rib(&peer()));
        assert!(!gr.is_restarting(&peer()));
        // A second End-of-RIB is a no-op
        assert!(!gr.end_of_rib(&peer()));
    }

    #[test]
    fn test_expiry_sweep() {
        let mut gr = GracefulRestartManager::new(true);
        gr.session_down(peer(), Some(cap(90)));
        assert!(gr.take_expired().is_empty());
        gr.restarting.get_mut(&peer()).unwrap().deadline =
            Utc::now() - Duration::seconds(1);
        assert_eq!(gr.take_expired(), vec![peer()]);
        assert!(!gr.is_restarting(&peer()));
    }
}
