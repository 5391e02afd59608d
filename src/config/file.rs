//! On-disk (toml) representation of the server config. Specs are plain
//! serde structs with defaults; `config::mod` turns them into the
//! in-memory form.

use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use ipnetwork::{IpNetwork, Ipv4Network};
use serde::Deserialize;

use crate::bgp::families::Family;
use crate::bgp::reflector::PeerRole;

pub(super) struct Defaults {}

impl Defaults {
    fn enabled() -> bool {
        true
    }

    fn passive() -> bool {
        false
    }

    fn poll_interval() -> u16 {
        30
    }

    fn hold_timer() -> u16 {
        180
    }

    fn dest_port() -> u16 {
        179
    }

    fn listen_port() -> u16 {
        179
    }

    fn listen_addr() -> IpAddr {
        IpAddr::from(Ipv4Addr::UNSPECIFIED)
    }

    fn families() -> Vec<Family> {
        vec![Family::ipv4_unicast(), Family::ipv6_unicast()]
    }

    fn default_accept() -> bool {
        true
    }

    fn hello_interval() -> u16 {
        10
    }

    fn priority() -> u8 {
        1
    }

    fn cost() -> u16 {
        10
    }

    fn network_kind() -> NetworkKind {
        NetworkKind::Broadcast
    }

    fn prepend_count() -> u8 {
        1
    }

    fn reject_invalid() -> bool {
        false
    }

    fn restart_time() -> u16 {
        120
    }

    fn suppress_threshold() -> f64 {
        3000.0
    }

    fn reuse_threshold() -> f64 {
        750.0
    }

    fn half_life() -> u64 {
        900
    }
}

/// Config (toml) representation of a BGP peer
#[derive(Clone, Debug, Deserialize)]
pub(super) struct PeerConfigSpec {
    // Peer connection details
    pub(super) remote_ip: IpNetwork,
    pub(super) remote_as: u32,
    // Local connection details (defer to server config if not provided)
    pub(super) local_as: Option<u32>,
    pub(super) local_router_id: Option<Ipv4Addr>,

    // Peer is configured and allowed to connect
    #[serde(default = "Defaults::enabled")]
    pub(super) enabled: bool,

    // Only listen to incoming TCP sessions for passive peers
    // And don't attempt outbound TCP connections
    #[serde(default = "Defaults::passive")]
    pub(super) passive: bool,

    // Timer to keep peers active
    // Will send keepalives every 1/3rd of this value
    #[serde(default = "Defaults::hold_timer")]
    pub(super) hold_timer: u16,

    // Destination port for BGP session
    // Used when initiating connection to peer
    #[serde(default = "Defaults::dest_port")]
    pub(super) dest_port: u16,

    // AFI/SAFI Families to Rx/Tx for this peer
    #[serde(default = "Defaults::families")]
    pub(super) families: Vec<Family>,

    // iBGP role for route reflection (client or non-client)
    pub(super) role: Option<PeerRole>,

    // Names of policies from [[bgp.policies]]
    pub(super) import_policy: Option<String>,
    pub(super) export_policy: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct MatchSpec {
    pub(super) prefix: Option<IpNetwork>,
    #[serde(default)]
    pub(super) prefix_exact: bool,
    pub(super) prefix_min: Option<u8>,
    pub(super) prefix_max: Option<u8>,
    pub(super) as_path_regex: Option<String>,
    pub(super) as_path_contains: Option<u32>,
    pub(super) as_path_max_length: Option<usize>,
    pub(super) community: Option<String>,
    pub(super) next_hop: Option<IpAddr>,
    pub(super) local_pref: Option<u32>,
    pub(super) med: Option<u32>,
    pub(super) origin: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct ActionSpec {
    #[serde(default)]
    pub(super) accept: bool,
    #[serde(default)]
    pub(super) reject: bool,
    pub(super) set_local_pref: Option<u32>,
    pub(super) set_med: Option<u32>,
    pub(super) set_next_hop: Option<IpAddr>,
    pub(super) prepend_as_path: Option<u32>,
    #[serde(default = "Defaults::prepend_count")]
    pub(super) prepend_count: u8,
    pub(super) add_community: Option<String>,
    pub(super) remove_community: Option<String>,
    pub(super) set_communities: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct RuleSpec {
    pub(super) name: Option<String>,
    #[serde(rename = "match", default)]
    pub(super) matches: Option<MatchSpec>,
    pub(super) action: ActionSpec,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct PolicySpec {
    pub(super) name: String,
    #[serde(default = "Defaults::default_accept")]
    pub(super) default_accept: bool,
    #[serde(default = "Vec::new")]
    pub(super) rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize)]
pub(super) struct BgpConfigSpec {
    #[serde(default = "Defaults::listen_addr")]
    pub(super) listen_addr: IpAddr,
    #[serde(default = "Defaults::listen_port")]
    pub(super) listen_port: u16,
    // Interval to poll idle peers (outbound connection)
    #[serde(default = "Defaults::poll_interval")]
    pub(super) poll_interval: u16,
    // Enables route reflection when set
    pub(super) cluster_id: Option<Ipv4Addr>,
    #[serde(default = "Vec::new")]
    pub(super) peers: Vec<PeerConfigSpec>,
    #[serde(default = "Vec::new")]
    pub(super) policies: Vec<PolicySpec>,
}

impl Default for BgpConfigSpec {
    fn default() -> Self {
        Self {
            listen_addr: Defaults::listen_addr(),
            listen_port: Defaults::listen_port(),
            poll_interval: Defaults::poll_interval(),
            cluster_id: None,
            peers: vec![],
            policies: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkKind {
    Broadcast,
    PointToPoint,
}

/// Config (toml) representation of one OSPF-enabled interface
#[derive(Clone, Debug, Deserialize)]
pub(super) struct OspfInterfaceSpec {
    pub(super) name: String,
    // Interface address with mask, e.g. "10.0.0.1/30"
    pub(super) address: Ipv4Network,
    #[serde(default = "Defaults::hello_interval")]
    pub(super) hello_interval: u16,
    // Defaults to 4x hello
    pub(super) dead_interval: Option<u32>,
    #[serde(default = "Defaults::priority")]
    pub(super) priority: u8,
    #[serde(default = "Defaults::cost")]
    pub(super) cost: u16,
    #[serde(default = "Defaults::network_kind")]
    pub(super) network: NetworkKind,
}

#[derive(Debug, Deserialize)]
pub(super) struct OspfConfigSpec {
    // Single-area operation; usually the backbone
    pub(super) area: Ipv4Addr,
    #[serde(default = "Vec::new")]
    pub(super) interfaces: Vec<OspfInterfaceSpec>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DampingSpec {
    #[serde(default = "Defaults::suppress_threshold")]
    pub suppress_threshold: f64,
    #[serde(default = "Defaults::reuse_threshold")]
    pub reuse_threshold: f64,
    /// Seconds for the penalty to halve
    #[serde(default = "Defaults::half_life")]
    pub half_life: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RpkiSpec {
    pub roa_source: PathBuf,
    #[serde(default = "Defaults::reject_invalid")]
    pub reject_invalid: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GracefulRestartSpec {
    #[serde(default = "Defaults::restart_time")]
    pub restart_time: u16,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct FeaturesSpec {
    pub(super) flap_damping: Option<DampingSpec>,
    pub(super) rpki: Option<RpkiSpec>,
    pub(super) graceful_restart: Option<GracefulRestartSpec>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ApiSpec {
    pub(super) listen: Option<SocketAddr>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerConfigSpec {
    // Global Router-ID (can be overridden per-peer in peer config)
    pub(super) router_id: Ipv4Addr,
    // Global ASN (can be overridden per-peer in peer config)
    pub(super) default_as: u32,
    #[serde(default)]
    pub(super) bgp: BgpConfigSpec,
    pub(super) ospf: Option<OspfConfigSpec>,
    #[serde(default)]
    pub(super) features: FeaturesSpec,
    #[serde(default)]
    pub(super) api: ApiSpec,
}

impl ServerConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        toml::from_str(&contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
    }

    pub(super) fn from_str(contents: &str) -> io::Result<Self> {
        toml::from_str(contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
    }
}
