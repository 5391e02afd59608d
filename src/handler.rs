//! The server core: one cooperative loop that drives the BGP session
//! manager, consumes OSPF routing-table updates, runs the debounced
//! decision process, keeps every peer's Adj-RIB-Out synchronized with
//! the Loc-RIB, and feeds winners to the kernel installer.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Duration, Instant};

use crate::bgp::damping::FlapDamping;
use crate::bgp::decision::{self, DecisionContext};
use crate::bgp::export::{export_route, ExportContext};
use crate::bgp::families::Family;
use crate::bgp::graceful::{GracefulRestartManager, RestartDecision};
use crate::bgp::msg::Update;
use crate::bgp::reflector::RouteReflector;
use crate::bgp::rib::{Rib, Route, ValidationState};
use crate::bgp::rpki::RpkiValidator;
use crate::bgp::session::Session;
use crate::bgp::{EndedPeer, SessionManager, SessionState, SessionUpdate};
use crate::config::{PeerConfig, ServerConfig};
use crate::kernel::{DynFib, Installer, IpRouteFib, RouteSource};
use crate::ospf::instance::{Instance, OspfSnapshot, OspfUpdate};
use crate::ospf::socket::OspfSocket;
use crate::ospf::spf::SpfRoute;

/// How long Adj-RIB-In churn is allowed to pool before one decision run
const DECISION_DEBOUNCE_MS: u64 = 200;

/// Shared state the API server reads (snapshots only)
pub struct ServerInner {
    pub config: Arc<ServerConfig>,
    pub rib: Arc<Mutex<Rib>>,
    pub sessions: Arc<Mutex<HashMap<IpAddr, Session>>>,
    pub installer: Arc<Mutex<Installer<DynFib>>>,
    pub ospf: Arc<Mutex<OspfSnapshot>>,
}

#[derive(Clone)]
pub struct Server {
    pub inner: Arc<ServerInner>,
}

/// Serve until the process is stopped.
pub async fn serve(config: ServerConfig) -> io::Result<()> {
    let config = Arc::new(config);
    let listener =
        TcpListener::bind((config.bgp.listen_addr, config.bgp.listen_port)).await?;
    info!(
        "Starting BGP listener on {}:{}...",
        config.bgp.listen_addr, config.bgp.listen_port
    );
    let mut manager = SessionManager::new(Arc::clone(&config), listener);
    let sessions = manager.sessions();
    let rib = Arc::new(Mutex::new(Rib::default()));
    let installer: Arc<Mutex<Installer<DynFib>>> = Arc::new(Mutex::new(Installer::new(
        Box::new(IpRouteFib::default()),
    )));
    if let Err(err) = installer.lock().await.reconcile().await {
        warn!("FIB reconciliation failed: {}", err);
    }

    // Advanced-feature managers; no-ops unless configured
    let mut damping = FlapDamping::new(config.features.damping.clone());
    let mut graceful =
        GracefulRestartManager::new(config.features.graceful_restart.is_some());
    let rpki = match &config.features.rpki {
        Some(rpki_config) => match RpkiValidator::from_file(&rpki_config.roa_source) {
            Ok(validator) => validator,
            Err(err) => {
                warn!("Failed to load ROAs: {}; RPKI validation disabled", err);
                RpkiValidator::disabled()
            }
        },
        None => RpkiValidator::disabled(),
    };
    let reject_invalid = config
        .features
        .rpki
        .as_ref()
        .map(|rpki_config| rpki_config.reject_invalid)
        .unwrap_or(false);

    let reflector = config
        .bgp
        .cluster_id
        .map(|cluster_id| RouteReflector::new(cluster_id, config.router_id));

    // The OSPF speaker runs as its own task on the same scheduler
    let ospf_snapshot = Arc::new(Mutex::new(OspfSnapshot::default()));
    let mut ospf_rx = start_ospf(&config, Arc::clone(&ospf_snapshot), &installer).await;

    if let Some(api_listen) = config.api_listen {
        let server = Server {
            inner: Arc::new(ServerInner {
                config: Arc::clone(&config),
                rib: Arc::clone(&rib),
                sessions: Arc::clone(&sessions),
                installer: Arc::clone(&installer),
                ospf: Arc::clone(&ospf_snapshot),
            }),
        };
        server.serve_rpc_api(api_listen);
    }

    // The decision debounce: prefixes pool here until the deadline
    let mut pending: HashSet<IpNetwork> = HashSet::new();
    let mut decision_due: Option<Instant> = None;
    let mut ospf_table: Vec<SpfRoute> = Vec::new();
    let mut housekeeping = tokio::time::interval(Duration::from_secs(1));

    loop {
        let deadline = decision_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            update = manager.get_update() => {
                match update {
                    Ok(Some(SessionUpdate::Learned { peer_ip, router_id, update })) => {
                        let touched = apply_learned(
                            &config, &rib, &mut damping, &rpki, reflector.as_ref(),
                            peer_ip, router_id, &update,
                        ).await;
                        schedule_decision(&mut pending, &mut decision_due, touched);
                    }
                    Ok(Some(SessionUpdate::EndOfRib { peer_ip, family })) => {
                        debug!("End-of-RIB for {:?} from {}", family, peer_ip);
                        if graceful.end_of_rib(&peer_ip) {
                            let mut rib = rib.lock().await;
                            let swept = rib.adj_in_mut(peer_ip).sweep_stale();
                            schedule_decision(&mut pending, &mut decision_due, swept);
                        }
                    }
                    Ok(Some(SessionUpdate::Ended(peers))) => {
                        let touched = apply_ended(&rib, &mut damping, &mut graceful, &peers).await;
                        schedule_decision(&mut pending, &mut decision_due, touched);
                    }
                    Ok(None) => (),
                    Err(err) => warn!("Session manager error: {}", err),
                }
            }
            ospf_update = recv_ospf(&mut ospf_rx) => {
                match ospf_update {
                    Some(OspfUpdate::RoutingTable(table)) => {
                        apply_ospf_table(&installer, &mut ospf_table, table).await;
                        // IGP changes shift next-hop reachability and costs
                        let prefixes = rib.lock().await.all_prefixes();
                        schedule_decision(&mut pending, &mut decision_due, prefixes);
                    }
                    // Speaker gone; stop polling its channel
                    None => ospf_rx = None,
                }
            }
            _ = sleep_until(deadline), if decision_due.is_some() => {
                decision_due = None;
                let prefixes: Vec<IpNetwork> = pending.drain().collect();
                run_decision(
                    &config, &rib, &installer, &mut damping, reject_invalid, &prefixes,
                ).await;
                sync_adj_out(&config, &rib, &sessions, reflector, &prefixes).await;
            }
            _ = housekeeping.tick() => {
                for peer_ip in graceful.take_expired() {
                    let mut rib = rib.lock().await;
                    let swept = rib.adj_in_mut(peer_ip).sweep_stale();
                    drop(rib);
                    schedule_decision(&mut pending, &mut decision_due, swept);
                }
                // Sessions freshly Established get their initial
                // advertisement pass even when nothing else changed
                sync_adj_out(&config, &rib, &sessions, reflector, &[]).await;
            }
        }
    }
}

fn schedule_decision(
    pending: &mut HashSet<IpNetwork>,
    due: &mut Option<Instant>,
    touched: Vec<IpNetwork>,
) {
    if touched.is_empty() {
        return;
    }
    pending.extend(touched);
    if due.is_none() {
        *due = Some(Instant::now() + Duration::from_millis(DECISION_DEBOUNCE_MS));
    }
}

async fn recv_ospf(
    rx: &mut Option<mpsc::UnboundedReceiver<OspfUpdate>>,
) -> Option<OspfUpdate> {
    match rx {
        Some(rx) => rx.recv().await,
        None => futures::future::pending().await,
    }
}

async fn start_ospf(
    config: &Arc<ServerConfig>,
    snapshot: Arc<Mutex<OspfSnapshot>>,
    installer: &Arc<Mutex<Installer<DynFib>>>,
) -> Option<mpsc::UnboundedReceiver<OspfUpdate>> {
    let ospf_config = config.ospf.as_ref()?;
    let (instance, rx) = Instance::new(ospf_config, config.router_id);

    // Connected networks anchor both protocol preference and BGP
    // next-hop resolution
    {
        let mut installer = installer.lock().await;
        for iface in &ospf_config.interfaces {
            let prefix = IpNetwork::V4(iface.address);
            installer
                .offer(
                    RouteSource::Connected,
                    prefix,
                    IpAddr::V4(iface.address.ip()),
                    0,
                )
                .await;
        }
    }

    let mut sockets = Vec::new();
    for iface in &ospf_config.interfaces {
        match OspfSocket::bind(&iface.name, iface.address.ip()) {
            Ok(socket) => sockets.push(socket),
            Err(err) => warn!(
                "Can't open OSPF socket on {}: {} (interface skipped)",
                iface.name, err
            ),
        }
    }
    tokio::spawn(async move {
        if let Err(err) = instance.run(sockets, snapshot).await {
            warn!("OSPF speaker exited: {}", err);
        }
    });
    Some(rx)
}

/// Fold a validated UPDATE into the peer's Adj-RIB-In, applying the
/// import pipeline: loop checks, RPKI validation, flap damping, import
/// policy. Returns the prefixes that need re-deciding.
async fn apply_learned(
    config: &Arc<ServerConfig>,
    rib: &Arc<Mutex<Rib>>,
    damping: &mut FlapDamping,
    rpki: &RpkiValidator,
    reflector: Option<&RouteReflector>,
    peer_ip: IpAddr,
    router_id: std::net::Ipv4Addr,
    update: &Update,
) -> Vec<IpNetwork> {
    let Some(peer) = peer_config_for(config, &peer_ip) else {
        warn!("UPDATE from unconfigured peer {}", peer_ip);
        return vec![];
    };
    let mut rib = rib.lock().await;

    // Damping sees announcements and withdrawals before anything else
    for prefix in &update.withdrawn_routes {
        damping.route_withdrawn(peer_ip, *prefix);
    }

    let local_as = peer.local_as;
    let remote_as = peer.remote_as;
    let is_ebgp = peer.is_ebgp();
    let import_policy = peer.import_policy.clone();

    let change = {
        let prior: HashMap<IpNetwork, Arc<crate::bgp::rib::PathSet>> = rib
            .adj_in(&peer_ip)
            .map(|table| {
                table
                    .routes()
                    .map(|route| (route.prefix, Arc::clone(&route.attributes)))
                    .collect()
            })
            .unwrap_or_default();

        rib.apply_update(peer_ip, update, |prefix, family, attributes| {
            // eBGP loop prevention: our own AS in the path
            if is_ebgp && attributes.as_path.contains(local_as) {
                debug!("AS_PATH loop on {} from {}", prefix, peer_ip);
                return None;
            }
            // Reflection loop prevention on import
            if let Some(reflector) = reflector {
                if !is_ebgp && reflector.is_looped(attributes) {
                    debug!("Reflection loop on {} from {}", prefix, peer_ip);
                    return None;
                }
            }

            let changed = prior
                .get(&prefix)
                .map(|previous| **previous != *attributes)
                .unwrap_or(false);
            damping.route_announced(peer_ip, prefix, changed);

            let validation = if rpki.is_enabled() {
                rpki.validate(&prefix, attributes.as_path.origin_asn())
            } else {
                ValidationState::Unverified
            };

            // Per-peer import policy, then the global default (accept)
            let attributes = match &import_policy {
                Some(policy) => policy.apply(&prefix, attributes)?,
                None => attributes.clone(),
            };

            Some(Route {
                family,
                prefix,
                attributes: Arc::new(attributes),
                peer_ip,
                router_id,
                remote_as,
                local_as,
                received_at: chrono::Utc::now(),
                validation,
                stale: false,
            })
        })
    };

    // A re-announcement from a restarting peer refreshes its stale mark
    for prefix in &change.announced {
        rib.adj_in_mut(peer_ip).clear_stale(prefix);
    }
    change.touched().copied().collect()
}

async fn apply_ended(
    rib: &Arc<Mutex<Rib>>,
    damping: &mut FlapDamping,
    graceful: &mut GracefulRestartManager,
    peers: &[EndedPeer],
) -> Vec<IpNetwork> {
    let mut touched = Vec::new();
    let mut rib = rib.lock().await;
    for ended in peers {
        damping.clear_peer(&ended.peer_ip);
        match graceful.session_down(ended.peer_ip, ended.graceful_restart) {
            RestartDecision::PreserveStale { restart_secs } => {
                debug!(
                    "Holding routes from {} stale for {}s",
                    ended.peer_ip, restart_secs
                );
                rib.adj_in_mut(ended.peer_ip).mark_all_stale();
            }
            RestartDecision::Flush => {
                touched.extend(rib.purge_peer(&ended.peer_ip));
            }
        }
    }
    touched
}

async fn apply_ospf_table(
    installer: &Arc<Mutex<Installer<DynFib>>>,
    previous: &mut Vec<SpfRoute>,
    table: Vec<SpfRoute>,
) {
    let mut installer = installer.lock().await;
    for old in previous.iter() {
        if !table.iter().any(|route| route.prefix == old.prefix) {
            installer
                .withdraw(RouteSource::Ospf, IpNetwork::V4(old.prefix))
                .await;
        }
    }
    for route in &table {
        installer
            .offer(
                RouteSource::Ospf,
                IpNetwork::V4(route.prefix),
                IpAddr::V4(route.next_hop),
                route.cost,
            )
            .await;
    }
    info!("OSPF routing table applied: {} routes", table.len());
    *previous = table;
}

async fn run_decision(
    config: &Arc<ServerConfig>,
    rib: &Arc<Mutex<Rib>>,
    installer: &Arc<Mutex<Installer<DynFib>>>,
    damping: &mut FlapDamping,
    reject_invalid: bool,
    prefixes: &[IpNetwork],
) {
    if prefixes.is_empty() {
        return;
    }
    let mut rib = rib.lock().await;
    let mut installer_guard = installer.lock().await;

    // Damping verdicts need &mut (decay); settle them before the
    // immutable decision context exists
    let mut suppressed: HashSet<(IpNetwork, IpAddr)> = HashSet::new();
    if damping.is_enabled() {
        for prefix in prefixes {
            let candidates: Vec<IpAddr> = rib
                .candidates(prefix)
                .iter()
                .map(|route| route.peer_ip)
                .collect();
            for peer_ip in candidates {
                if damping.is_suppressed(prefix, &peer_ip) {
                    suppressed.insert((*prefix, peer_ip));
                }
            }
        }
    }

    let changes = {
        let installer_ref = &*installer_guard;
        let peers: Vec<IpNetwork> =
            config.bgp.peers.iter().map(|peer| peer.remote_ip).collect();
        let ctx = DecisionContext {
            reject_invalid,
            resolves: Box::new(move |next_hop| {
                installer_ref.resolves(next_hop)
                    || peers.iter().any(|network| network.contains(*next_hop))
            }),
            igp_cost: Box::new(move |next_hop| installer_ref.igp_cost(next_hop)),
            suppressed: Box::new(move |prefix, peer_ip| {
                suppressed.contains(&(*prefix, *peer_ip))
            }),
        };
        decision::decide(&mut rib, prefixes, &ctx)
    };

    for change in &changes {
        match &change.new_best {
            Some(route) => {
                if let Some(next_hop) = route.attributes.next_hop {
                    installer_guard
                        .offer(RouteSource::Bgp, change.prefix, next_hop, 100)
                        .await;
                }
            }
            None => {
                installer_guard
                    .withdraw(RouteSource::Bgp, change.prefix)
                    .await;
            }
        }
    }
    if !changes.is_empty() {
        debug!("Decision process updated {} prefixes", changes.len());
    }
}

/// Bring every Established session's Adj-RIB-Out in line with the
/// Loc-RIB for the dirty prefixes (or the whole table for sessions that
/// just reached Established).
async fn sync_adj_out(
    config: &Arc<ServerConfig>,
    rib: &Arc<Mutex<Rib>>,
    sessions: &Arc<Mutex<HashMap<IpAddr, Session>>>,
    reflector: Option<RouteReflector>,
    dirty: &[IpNetwork],
) {
    let mut sessions = sessions.lock().await;
    let mut rib = rib.lock().await;

    for (addr, session) in sessions.iter_mut() {
        if session.state() != SessionState::Established {
            continue;
        }
        let initial_pass = session.needs_initial_advertisement;
        let prefixes: Vec<IpNetwork> = if initial_pass {
            // A full pass starts from a clean slate: a reconnecting peer
            // (or a ROUTE-REFRESH) must see every route again
            rib.adj_out_mut(*addr).clear();
            rib.loc.prefixes()
        } else if dirty.is_empty() {
            continue;
        } else {
            dirty.to_vec()
        };

        let peer_configs = config.bgp.peers.clone();
        let ctx = ExportContext {
            local_as: session.config.local_as,
            router_id: config.router_id,
            reflector,
            role_of: Box::new(move |peer_ip| {
                peer_configs
                    .iter()
                    .find(|peer| peer.remote_ip.contains(*peer_ip))
                    .and_then(|peer| peer.role)
            }),
            local_addr: session.local_addr(),
        };

        let mut withdraws: HashMap<Family, Vec<IpNetwork>> = HashMap::new();
        for prefix in &prefixes {
            let shaped = rib
                .loc
                .get(prefix)
                .and_then(|route| export_route(route, &session.config, &ctx));
            let previous = rib.adj_out(addr).and_then(|table| table.get(prefix)).cloned();
            match (previous, shaped) {
                (Some(old), Some(new)) if old == new => (),
                (_, Some(new)) => {
                    session.queue_advertisement(&new);
                    rib.adj_out_mut(*addr).insert(new);
                }
                (Some(old), None) => {
                    withdraws.entry(old.family).or_default().push(*prefix);
                    rib.adj_out_mut(*addr).remove(prefix);
                }
                (None, None) => (),
            }
        }
        for (family, prefixes) in withdraws {
            session.queue_withdraw(family, prefixes);
        }

        if initial_pass {
            session.needs_initial_advertisement = false;
            // End-of-RIB closes the initial pass when graceful restart
            // was negotiated
            if session.capabilities.graceful_restart.is_some() && !session.end_of_rib_sent {
                for family in session.config.families.clone() {
                    session.queue_message(Session::end_of_rib_marker(family));
                }
                session.end_of_rib_sent = true;
            }
        }
    }
}

fn peer_config_for<'a>(
    config: &'a Arc<ServerConfig>,
    peer_ip: &IpAddr,
) -> Option<&'a Arc<PeerConfig>> {
    config
        .bgp
        .peers
        .iter()
        .find(|peer| peer.remote_ip.contains(*peer_ip))
}
