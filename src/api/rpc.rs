//! The read-only snapshot API. Every method copies state out under the
//! scheduler's locks and returns; nothing here can mutate protocol state
//! and no streaming is promised.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use serde::{Deserialize, Serialize};

#[rpc(server)]
pub trait Api {
    #[method(name = "show_peers")]
    async fn show_peers(&self) -> RpcResult<Vec<PeerSummary>>;
    #[method(name = "show_peer_detail")]
    async fn show_peer_detail(&self) -> RpcResult<Vec<PeerDetail>>;
    #[method(name = "show_routes_learned")]
    async fn show_routes_learned(
        &self,
        from_peer: Option<IpNetwork>,
    ) -> RpcResult<Vec<LearnedRoute>>;
    #[method(name = "show_routes_advertised")]
    async fn show_routes_advertised(
        &self,
        to_peer: Option<IpNetwork>,
    ) -> RpcResult<Vec<LearnedRoute>>;
    #[method(name = "show_loc_rib")]
    async fn show_loc_rib(&self) -> RpcResult<Vec<LearnedRoute>>;
    #[method(name = "show_ospf_neighbors")]
    async fn show_ospf_neighbors(&self) -> RpcResult<Vec<OspfNeighborInfo>>;
    #[method(name = "show_lsdb")]
    async fn show_lsdb(&self) -> RpcResult<Vec<LsdbEntry>>;
    #[method(name = "show_spf_table")]
    async fn show_spf_table(&self) -> RpcResult<Vec<SpfTableEntry>>;
    #[method(name = "show_installed")]
    async fn show_installed(&self) -> RpcResult<Vec<InstalledSummary>>;
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PeerSummary {
    pub peer: String,
    pub enabled: bool,
    pub router_id: Option<IpAddr>,
    pub remote_asn: u32,
    pub local_asn: u32,
    pub msg_received: Option<u64>,
    pub msg_sent: Option<u64>,
    pub uptime: Option<String>,
    pub state: String,
    pub prefixes_received: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PeerDetail {
    pub summary: PeerSummary,
    pub hold_timer: u16,
    pub hold_timer_interval: u16,
    pub last_received: Option<String>,
    pub last_sent: Option<String>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LearnedRoute {
    pub source: String,
    pub afi: String,
    pub safi: String,
    pub received_at: i64,
    pub age: String,
    pub prefix: String,
    pub next_hop: Option<IpAddr>,
    pub origin: String,
    pub as_path: String,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    pub communities: Vec<String>,
    pub validation: String,
    pub stale: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OspfNeighborInfo {
    pub router_id: IpAddr,
    pub address: IpAddr,
    pub interface: String,
    pub state: String,
    pub priority: u8,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LsdbEntry {
    pub ls_type: u8,
    pub link_state_id: IpAddr,
    pub advertising_router: IpAddr,
    pub sequence: i64,
    pub age: u16,
    pub checksum: u16,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SpfTableEntry {
    pub prefix: String,
    pub cost: u32,
    pub next_hop: IpAddr,
    pub interface: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct InstalledSummary {
    pub prefix: String,
    pub next_hop: IpAddr,
    pub metric: u32,
    pub source: String,
    pub state: String,
}
