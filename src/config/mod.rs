mod file;

pub use file::{DampingSpec, GracefulRestartSpec, NetworkKind, RpkiSpec};

use std::collections::HashMap;
use std::convert::TryFrom;
use std::io::{self, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use ipnetwork::{IpNetwork, Ipv4Network};
use regex::Regex;

use crate::bgp::community::Community;
use crate::bgp::families::Family;
use crate::bgp::msg::Origin;
use crate::bgp::policy::{MatchCondition, Policy, PolicyAction, PolicyRule};
use crate::bgp::reflector::PeerRole;

#[derive(Debug)]
pub struct ServerConfig {
    pub router_id: Ipv4Addr,
    pub default_as: u32,
    pub bgp: BgpConfig,
    pub ospf: Option<OspfConfig>,
    pub features: FeatureConfig,
    pub api_listen: Option<SocketAddr>,
}

#[derive(Debug)]
pub struct BgpConfig {
    pub listen_addr: IpAddr,
    pub listen_port: u16,
    pub poll_interval: u16,
    pub cluster_id: Option<Ipv4Addr>,
    pub peers: Vec<Arc<PeerConfig>>,
}

/// In-Memory Server representation of a Peer config
///   Has missing PeerConfigSpec items defaulted to Server values
#[derive(Debug)]
pub struct PeerConfig {
    pub remote_ip: IpNetwork,
    pub remote_as: u32,
    pub local_as: u32,
    pub local_router_id: Ipv4Addr,
    pub enabled: bool,
    pub passive: bool,
    pub hold_timer: u16,
    pub dest_port: u16,
    pub families: Vec<Family>,
    pub role: Option<PeerRole>,
    pub import_policy: Option<Arc<Policy>>,
    pub export_policy: Option<Arc<Policy>>,
}

impl PeerConfig {
    // Is this an eBGP session
    pub fn is_ebgp(&self) -> bool {
        self.remote_as != self.local_as
    }
}

#[derive(Debug, Clone)]
pub struct OspfConfig {
    pub area: Ipv4Addr,
    pub interfaces: Vec<OspfInterfaceConfig>,
}

#[derive(Debug, Clone)]
pub struct OspfInterfaceConfig {
    pub name: String,
    pub address: Ipv4Network,
    pub hello_interval: u16,
    pub dead_interval: u32,
    pub priority: u8,
    pub cost: u16,
    pub network: NetworkKind,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureConfig {
    pub damping: Option<DampingConfig>,
    pub rpki: Option<RpkiConfig>,
    pub graceful_restart: Option<GracefulRestartConfig>,
}

#[derive(Debug, Clone)]
pub struct DampingConfig {
    pub suppress_threshold: f64,
    pub reuse_threshold: f64,
    pub half_life_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RpkiConfig {
    pub roa_source: PathBuf,
    pub reject_invalid: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct GracefulRestartConfig {
    pub restart_time: u16,
}

impl ServerConfig {
    /// Parse a TOML config file
    pub fn from_file(path: &str) -> Result<ServerConfig> {
        Self::from_spec(file::ServerConfigSpec::from_file(path)?)
    }

    pub fn from_str(contents: &str) -> Result<ServerConfig> {
        Self::from_spec(file::ServerConfigSpec::from_str(contents)?)
    }

    fn from_spec(spec: file::ServerConfigSpec) -> Result<ServerConfig> {
        let policies: HashMap<String, Arc<Policy>> = spec
            .bgp
            .policies
            .iter()
            .map(|policy_spec| {
                policy_from_spec(policy_spec)
                    .map(|policy| (policy_spec.name.clone(), Arc::new(policy)))
            })
            .collect::<Result<_>>()?;

        let lookup_policy = |name: &Option<String>| -> Result<Option<Arc<Policy>>> {
            match name {
                Some(name) => policies
                    .get(name)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| invalid(format!("Unknown policy: '{}'", name))),
                None => Ok(None),
            }
        };

        let peers: Vec<Arc<PeerConfig>> = spec
            .bgp
            .peers
            .iter()
            .map(|p| {
                Ok(Arc::new(PeerConfig {
                    remote_ip: p.remote_ip,
                    remote_as: p.remote_as,
                    local_as: p.local_as.unwrap_or(spec.default_as),
                    local_router_id: p.local_router_id.unwrap_or(spec.router_id),
                    enabled: p.enabled,
                    passive: p.passive,
                    hold_timer: p.hold_timer,
                    dest_port: p.dest_port,
                    families: p.families.clone(),
                    role: p.role,
                    import_policy: lookup_policy(&p.import_policy)?,
                    export_policy: lookup_policy(&p.export_policy)?,
                }))
            })
            .collect::<Result<_>>()?;

        let ospf = spec.ospf.map(|ospf_spec| OspfConfig {
            area: ospf_spec.area,
            interfaces: ospf_spec
                .interfaces
                .into_iter()
                .map(|iface| OspfInterfaceConfig {
                    dead_interval: iface
                        .dead_interval
                        .unwrap_or(4 * u32::from(iface.hello_interval)),
                    name: iface.name,
                    address: iface.address,
                    hello_interval: iface.hello_interval,
                    priority: iface.priority,
                    cost: iface.cost,
                    network: iface.network,
                })
                .collect(),
        });

        Ok(ServerConfig {
            router_id: spec.router_id,
            default_as: spec.default_as,
            bgp: BgpConfig {
                listen_addr: spec.bgp.listen_addr,
                listen_port: spec.bgp.listen_port,
                poll_interval: spec.bgp.poll_interval,
                cluster_id: spec.bgp.cluster_id,
                peers,
            },
            ospf,
            features: FeatureConfig {
                damping: spec.features.flap_damping.map(|d| DampingConfig {
                    suppress_threshold: d.suppress_threshold,
                    reuse_threshold: d.reuse_threshold,
                    half_life_secs: d.half_life,
                }),
                rpki: spec.features.rpki.map(|r| RpkiConfig {
                    roa_source: r.roa_source,
                    reject_invalid: r.reject_invalid,
                }),
                graceful_restart: spec.features.graceful_restart.map(|g| {
                    GracefulRestartConfig {
                        restart_time: g.restart_time,
                    }
                }),
            },
            api_listen: spec.api.listen,
        })
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

fn policy_from_spec(spec: &file::PolicySpec) -> Result<Policy> {
    let rules: Vec<PolicyRule> = spec
        .rules
        .iter()
        .enumerate()
        .map(|(index, rule)| {
            Ok(PolicyRule {
                name: rule
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}-{}", spec.name, index)),
                matches: matches_from_spec(rule.matches.as_ref())?,
                actions: actions_from_spec(&rule.action)?,
            })
        })
        .collect::<Result<_>>()?;
    Ok(Policy {
        name: spec.name.clone(),
        rules,
        default_accept: spec.default_accept,
    })
}

fn matches_from_spec(spec: Option<&file::MatchSpec>) -> Result<Vec<MatchCondition>> {
    let mut matches = Vec::new();
    let Some(spec) = spec else {
        return Ok(matches);
    };
    if let Some(network) = spec.prefix {
        matches.push(MatchCondition::Prefix {
            network,
            exact: spec.prefix_exact,
        });
    }
    if spec.prefix_min.is_some() || spec.prefix_max.is_some() {
        matches.push(MatchCondition::PrefixLength {
            min: spec.prefix_min.unwrap_or(0),
            max: spec.prefix_max.unwrap_or(128),
        });
    }
    if let Some(pattern) = &spec.as_path_regex {
        let regex = Regex::new(pattern)
            .map_err(|err| invalid(format!("Bad as_path_regex '{}': {}", pattern, err)))?;
        matches.push(MatchCondition::AsPathRegex(regex));
    }
    if let Some(asn) = spec.as_path_contains {
        matches.push(MatchCondition::AsPathContains(asn));
    }
    if let Some(bound) = spec.as_path_max_length {
        matches.push(MatchCondition::AsPathMaxLength(bound));
    }
    if let Some(community) = &spec.community {
        matches.push(MatchCondition::Community(parse_community(community)?));
    }
    if let Some(next_hop) = spec.next_hop {
        matches.push(MatchCondition::NextHop(next_hop));
    }
    if let Some(pref) = spec.local_pref {
        matches.push(MatchCondition::LocalPref(pref));
    }
    if let Some(med) = spec.med {
        matches.push(MatchCondition::Med(med));
    }
    if let Some(origin) = &spec.origin {
        let origin = match origin.to_lowercase().as_str() {
            "igp" => Origin::Igp,
            "egp" => Origin::Egp,
            "incomplete" => Origin::Incomplete,
            other => return Err(invalid(format!("Unknown origin: '{}'", other))),
        };
        matches.push(MatchCondition::Origin(origin));
    }
    Ok(matches)
}

fn actions_from_spec(spec: &file::ActionSpec) -> Result<Vec<PolicyAction>> {
    let mut actions = Vec::new();
    if spec.reject {
        actions.push(PolicyAction::Reject);
        return Ok(actions);
    }
    if let Some(pref) = spec.set_local_pref {
        actions.push(PolicyAction::SetLocalPref(pref));
    }
    if let Some(med) = spec.set_med {
        actions.push(PolicyAction::SetMed(med));
    }
    if let Some(next_hop) = spec.set_next_hop {
        actions.push(PolicyAction::SetNextHop(next_hop));
    }
    if let Some(asn) = spec.prepend_as_path {
        actions.push(PolicyAction::PrependAsPath {
            asn,
            count: spec.prepend_count,
        });
    }
    if let Some(community) = &spec.add_community {
        actions.push(PolicyAction::AddCommunity(parse_community(community)?));
    }
    if let Some(community) = &spec.remove_community {
        actions.push(PolicyAction::RemoveCommunity(parse_community(community)?));
    }
    if let Some(communities) = &spec.set_communities {
        let communities = communities
            .iter()
            .map(|c| parse_community(c))
            .collect::<Result<Vec<_>>>()?;
        actions.push(PolicyAction::SetCommunities(communities));
    }
    if spec.accept {
        actions.push(PolicyAction::Accept);
    }
    Ok(actions)
}

fn parse_community(value: &str) -> Result<Community> {
    Community::try_from(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
router_id = "10.0.1.1"
default_as = 65001

[bgp]
listen_port = 1179
cluster_id = "10.0.0.1"

[[bgp.peers]]
remote_ip = "192.0.2.2"
remote_as = 65002
hold_timer = 30
export_policy = "shape-out"

[[bgp.peers]]
remote_ip = "192.0.2.6"
remote_as = 65001
role = "client"
passive = true
families = ["ipv4 unicast"]

[[bgp.policies]]
name = "shape-out"
default_accept = false

[[bgp.policies.rules]]
match = { prefix = "203.0.113.0/24", prefix_exact = true }
action = { set_local_pref = 200, accept = true }

[ospf]
area = "0.0.0.0"

[[ospf.interfaces]]
name = "eth0"
address = "10.0.0.1/30"
cost = 10
network = "point-to-point"

[features]
flap_damping = { suppress_threshold = 2000.0, reuse_threshold = 500.0, half_life = 600 }
graceful_restart = { restart_time = 90 }

[api]
listen = "127.0.0.1:8080"
"#;

    #[test]
    fn test_parse_config() {
        let config = ServerConfig::from_str(CONFIG).unwrap();
        assert_eq!(config.router_id, "10.0.1.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(config.default_as, 65001);
        assert_eq!(config.bgp.listen_port, 1179);
        assert_eq!(config.bgp.cluster_id, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(config.bgp.peers.len(), 2);

        let ebgp = &config.bgp.peers[0];
        assert!(ebgp.is_ebgp());
        assert_eq!(ebgp.hold_timer, 30);
        assert_eq!(ebgp.local_as, 65001);
        assert!(ebgp.export_policy.is_some());

        let client = &config.bgp.peers[1];
        assert!(!client.is_ebgp());
        assert_eq!(client.role, Some(PeerRole::Client));
        assert!(client.passive);
        assert_eq!(client.families, vec![Family::ipv4_unicast()]);

        let ospf = config.ospf.unwrap();
        assert_eq!(ospf.interfaces.len(), 1);
        let iface = &ospf.interfaces[0];
        // Dead interval defaults to 4x hello
        assert_eq!(iface.dead_interval, 40);
        assert_eq!(iface.network, NetworkKind::PointToPoint);

        let damping = config.features.damping.unwrap();
        assert_eq!(damping.half_life_secs, 600);
        assert_eq!(config.features.graceful_restart.unwrap().restart_time, 90);
        assert_eq!(
            config.api_listen,
            Some("127.0.0.1:8080".parse().unwrap())
        );
    }

    #[test]
    fn test_unknown_policy_reference_fails() {
        let bad = r#"
router_id = "10.0.1.1"
default_as = 65001

[[bgp.peers]]
remote_ip = "192.0.2.2"
remote_as = 65002
import_policy = "missing"
"#;
        assert!(ServerConfig::from_str(bad).is_err());
    }

    #[test]
    fn test_policy_translation() {
        let config = ServerConfig::from_str(CONFIG).unwrap();
        let policy = config.bgp.peers[0].export_policy.as_ref().unwrap();
        assert_eq!(policy.rules.len(), 1);
        assert!(!policy.default_accept);
    }
}
