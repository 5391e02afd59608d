//! Route flap damping (RFC 2439).
//!
//! Flapping routes accumulate penalty: 1000 per withdrawal, 500 per
//! attribute change. Penalty decays exponentially with a configurable
//! half-life. A route whose penalty crosses the suppress threshold is
//! excluded from the decision process until decay brings it under the
//! reuse threshold (or the max-suppress window lapses).

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use ipnetwork::IpNetwork;
use log::{debug, info};

use crate::config::DampingConfig;

pub const WITHDRAWAL_PENALTY: f64 = 1000.0;
pub const ATTRIBUTE_CHANGE_PENALTY: f64 = 500.0;
/// Penalty below which history stops being tracked
pub const CUTOFF_THRESHOLD: f64 = 1000.0;
pub const MAX_SUPPRESS_SECS: i64 = 3600;

#[derive(Debug)]
struct FlapInfo {
    penalty: f64,
    last_update: DateTime<Utc>,
    flap_count: u64,
    suppressed_at: Option<DateTime<Utc>>,
}

impl FlapInfo {
    fn new() -> Self {
        Self {
            penalty: 0.0,
            last_update: Utc::now(),
            flap_count: 0,
            suppressed_at: None,
        }
    }

    fn is_suppressed(&self) -> bool {
        self.suppressed_at.is_some()
    }
}

#[derive(Debug)]
pub struct FlapDamping {
    config: Option<DampingConfig>,
    flaps: HashMap<(IpAddr, IpNetwork), FlapInfo>,
    suppressed_count: u64,
}

impl FlapDamping {
    /// A `None` config yields a disabled manager whose call points are
    /// no-ops.
    pub fn new(config: Option<DampingConfig>) -> Self {
        Self {
            config,
            flaps: HashMap::new(),
            suppressed_count: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// Penalize a withdrawal. Returns true when the route is suppressed.
    pub fn route_withdrawn(&mut self, peer_ip: IpAddr, prefix: IpNetwork) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        let config = config.clone();
        let info = self
            .flaps
            .entry((peer_ip, prefix))
            .or_insert_with(FlapInfo::new);
        decay(info, &config);
        info.penalty += WITHDRAWAL_PENALTY;
        info.flap_count += 1;
        debug!(
            "Flap: {} withdrawn by {} [penalty {:.0}]",
            prefix, peer_ip, info.penalty
        );
        self.update_suppression(peer_ip, prefix)
    }

    /// Penalize a re-announcement (only when the attributes changed).
    /// Returns true when the route is suppressed.
    pub fn route_announced(
        &mut self,
        peer_ip: IpAddr,
        prefix: IpNetwork,
        attributes_changed: bool,
    ) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        let config = config.clone();
        let info = self
            .flaps
            .entry((peer_ip, prefix))
            .or_insert_with(FlapInfo::new);
        decay(info, &config);
        if attributes_changed {
            info.penalty += ATTRIBUTE_CHANGE_PENALTY;
            info.flap_count += 1;
        }
        self.update_suppression(peer_ip, prefix)
    }

    /// Is this (peer, prefix) currently suppressed? Applies decay first so
    /// long-quiet routes are released.
    pub fn is_suppressed(&mut self, prefix: &IpNetwork, peer_ip: &IpAddr) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        let config = config.clone();
        match self.flaps.get_mut(&(*peer_ip, *prefix)) {
            Some(info) => {
                decay(info, &config);
                self.update_suppression(*peer_ip, *prefix)
            }
            None => false,
        }
    }

    /// A session drop wipes flap history for the peer: the penalty model
    /// tracks route instability, not session instability.
    pub fn clear_peer(&mut self, peer_ip: &IpAddr) {
        self.flaps.retain(|(peer, _), _| peer != peer_ip);
    }

    pub fn suppressed_count(&self) -> u64 {
        self.suppressed_count
    }

    pub fn penalty(&self, peer_ip: &IpAddr, prefix: &IpNetwork) -> Option<f64> {
        self.flaps.get(&(*peer_ip, *prefix)).map(|info| info.penalty)
    }

    fn update_suppression(&mut self, peer_ip: IpAddr, prefix: IpNetwork) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        let config = config.clone();
        let Some(info) = self.flaps.get_mut(&(peer_ip, prefix)) else {
            return false;
        };
        if !info.is_suppressed() && info.penalty >= config.suppress_threshold {
            info!(
                "Suppressing {} from {} [penalty {:.0} >= {:.0}]",
                prefix, peer_ip, info.penalty, config.suppress_threshold
            );
            info.suppressed_at = Some(Utc::now());
            self.suppressed_count += 1;
        } else if info.is_suppressed() {
            let held_too_long = info
                .suppressed_at
                .map(|at| Utc::now() - at >= Duration::seconds(MAX_SUPPRESS_SECS))
                .unwrap_or(false);
            if info.penalty <= config.reuse_threshold || held_too_long {
                info!("Reusing {} from {} [penalty {:.0}]", prefix, peer_ip, info.penalty);
                info.suppressed_at = None;
            }
        }
        info.is_suppressed()
    }
}

/// Apply exponential decay since the last update:
/// penalty *= 2^(-elapsed / half_life)
fn decay(info: &mut FlapInfo, config: &DampingConfig) {
    let now = Utc::now();
    let elapsed = (now - info.last_update).num_milliseconds() as f64 / 1000.0;
    if elapsed <= 0.0 {
        return;
    }
    let decay_constant = std::f64::consts::LN_2 / config.half_life_secs as f64;
    info.penalty *= (-decay_constant * elapsed).exp();
    info.last_update = now;
    // Forget negligible history unless currently suppressed
    if info.penalty < CUTOFF_THRESHOLD && !info.is_suppressed() {
        info.flap_count = 0;
    }
}
