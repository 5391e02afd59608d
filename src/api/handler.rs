use std::net::SocketAddr;

use ipnetwork::IpNetwork;
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::server::ServerBuilder;
use log::{info, warn};

use super::peers::{peer_to_detail, peer_to_summary};
use super::routes::{advertised_to_learned, route_to_learned};
use super::rpc::{
    ApiServer, InstalledSummary, LearnedRoute, LsdbEntry, OspfNeighborInfo, PeerDetail,
    PeerSummary, SpfTableEntry,
};
use crate::handler::Server;
use crate::utils::get_host_address;

#[async_trait]
impl ApiServer for Server {
    async fn show_peers(&self) -> RpcResult<Vec<PeerSummary>> {
        let mut output: Vec<PeerSummary> = vec![];
        let sessions = self.inner.sessions.lock().await;
        let rib = self.inner.rib.lock().await;
        // Summary for any non-idle sessions
        for (addr, session) in sessions.iter() {
            let pfx_rcvd = rib.adj_in(addr).map(|table| table.len() as u64);
            output.push(peer_to_summary(session.config.clone(), Some(session), pfx_rcvd));
        }
        // Summaries for idle peer/network configs
        for config in &self.inner.config.bgp.peers {
            if let Some(remote_ip) = get_host_address(&config.remote_ip) {
                // Don't duplicate session summaries
                if sessions.contains_key(&remote_ip) {
                    continue;
                }
            }
            output.push(peer_to_summary(config.clone(), None, None));
        }
        Ok(output)
    }

    async fn show_peer_detail(&self) -> RpcResult<Vec<PeerDetail>> {
        let mut output: Vec<PeerDetail> = vec![];
        let sessions = self.inner.sessions.lock().await;
        let rib = self.inner.rib.lock().await;
        for (addr, session) in sessions.iter() {
            let pfx_rcvd = rib.adj_in(addr).map(|table| table.len() as u64);
            output.push(peer_to_detail(session.config.clone(), Some(session), pfx_rcvd));
        }
        for config in &self.inner.config.bgp.peers {
            if let Some(remote_ip) = get_host_address(&config.remote_ip) {
                if sessions.contains_key(&remote_ip) {
                    continue;
                }
            }
            output.push(peer_to_detail(config.clone(), None, None));
        }
        Ok(output)
    }

    async fn show_routes_learned(
        &self,
        from_peer: Option<IpNetwork>,
    ) -> RpcResult<Vec<LearnedRoute>> {
        let rib = self.inner.rib.lock().await;
        let mut output: Vec<LearnedRoute> = vec![];
        for peer_ip in rib.peers_with_routes() {
            if let Some(filter) = from_peer {
                if !filter.contains(peer_ip) {
                    continue;
                }
            }
            if let Some(table) = rib.adj_in(&peer_ip) {
                output.extend(table.routes().map(route_to_learned));
            }
        }
        Ok(output)
    }

    async fn show_routes_advertised(
        &self,
        to_peer: Option<IpNetwork>,
    ) -> RpcResult<Vec<LearnedRoute>> {
        let sessions = self.inner.sessions.lock().await;
        let rib = self.inner.rib.lock().await;
        let mut output: Vec<LearnedRoute> = vec![];
        for addr in sessions.keys() {
            if let Some(filter) = to_peer {
                if !filter.contains(*addr) {
                    continue;
                }
            }
            if let Some(table) = rib.adj_out(addr) {
                let peer = addr.to_string();
                output.extend(
                    table
                        .routes()
                        .map(|route| advertised_to_learned(&peer, route)),
                );
            }
        }
        Ok(output)
    }

    async fn show_loc_rib(&self) -> RpcResult<Vec<LearnedRoute>> {
        let rib = self.inner.rib.lock().await;
        Ok(rib
            .loc
            .routes()
            .map(|route| route_to_learned(route))
            .collect())
    }

    async fn show_ospf_neighbors(&self) -> RpcResult<Vec<OspfNeighborInfo>> {
        let snapshot = self.inner.ospf.lock().await;
        Ok(snapshot
            .neighbors
            .iter()
            .map(|neighbor| OspfNeighborInfo {
                router_id: neighbor.router_id.into(),
                address: neighbor.addr.into(),
                interface: neighbor.interface.clone(),
                state: neighbor.state.clone(),
                priority: neighbor.priority,
            })
            .collect())
    }

    async fn show_lsdb(&self) -> RpcResult<Vec<LsdbEntry>> {
        let snapshot = self.inner.ospf.lock().await;
        Ok(snapshot
            .lsdb
            .iter()
            .map(|header| LsdbEntry {
                ls_type: header.ls_type,
                link_state_id: header.link_state_id.into(),
                advertising_router: header.advertising_router.into(),
                sequence: i64::from(header.ls_sequence),
                age: header.ls_age,
                checksum: header.ls_checksum,
            })
            .collect())
    }

    async fn show_spf_table(&self) -> RpcResult<Vec<SpfTableEntry>> {
        let snapshot = self.inner.ospf.lock().await;
        Ok(snapshot
            .table
            .iter()
            .map(|route| SpfTableEntry {
                prefix: route.prefix.to_string(),
                cost: route.cost,
                next_hop: route.next_hop.into(),
                interface: route.interface.clone(),
            })
            .collect())
    }

    async fn show_installed(&self) -> RpcResult<Vec<InstalledSummary>> {
        let installer = self.inner.installer.lock().await;
        Ok(installer
            .snapshot()
            .into_iter()
            .map(|route| InstalledSummary {
                prefix: route.prefix.to_string(),
                next_hop: route.next_hop,
                metric: route.metric,
                source: route.source.to_string(),
                state: format!("{:?}", route.state),
            })
            .collect())
    }
}

impl Server {
    pub fn serve_rpc_api(&self, socket: SocketAddr) {
        let server = self.clone();
        info!("Starting JSON-RPC server on {}...", socket);
        tokio::task::spawn(async move {
            let http = match ServerBuilder::default().build(socket).await {
                Ok(http) => http,
                Err(err) => {
                    warn!("Can't start API server: {}", err);
                    return;
                }
            };
            match http.start(server.into_rpc()) {
                Ok(handle) => handle.stopped().await,
                Err(err) => warn!("API server failed: {}", err),
            }
        });
    }
}
