//! Cross-protocol route installation.
//!
//! The installer owns the RouteSink: the set of prefixes this agent has
//! pushed into the host forwarding table. Each prefix has at most one
//! installed winner, chosen by protocol preference (Connected > OSPF >
//! BGP). Winner changes are applied with a kernel `replace`, never
//! delete-then-add, so forwarding never gaps. Every installed route
//! carries a protocol-source tag so reconciliation and removal only ever
//! touch routes this agent created.

mod fib;

pub use fib::{proto_tag, IpRouteFib, MockFib};

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use log::{debug, info, warn};

/// Source protocol of an installed route, in descending preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteSource {
    Connected,
    Ospf,
    Bgp,
}

impl fmt::Display for RouteSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            RouteSource::Connected => "connected",
            RouteSource::Ospf => "ospf",
            RouteSource::Bgp => "bgp",
        };
        write!(f, "{}", word)
    }
}

/// A route as the kernel sees it
#[derive(Debug, Clone, PartialEq)]
pub struct FibRoute {
    pub prefix: IpNetwork,
    pub next_hop: IpAddr,
    pub metric: u32,
    pub source: RouteSource,
}

/// The host's route-manipulation surface. Implementations bind to the
/// platform; `replace` must be idempotent.
#[async_trait]
pub trait Fib {
    async fn replace(&mut self, route: &FibRoute) -> io::Result<()>;
    async fn remove(&mut self, prefix: &IpNetwork, source: RouteSource) -> io::Result<()>;
    /// Dump only the routes carrying this agent's source tags
    async fn dump(&mut self) -> io::Result<Vec<FibRoute>>;
}

pub type DynFib = Box<dyn Fib + Send>;

#[async_trait]
impl Fib for DynFib {
    async fn replace(&mut self, route: &FibRoute) -> io::Result<()> {
        (**self).replace(route).await
    }

    async fn remove(&mut self, prefix: &IpNetwork, source: RouteSource) -> io::Result<()> {
        (**self).remove(prefix, source).await
    }

    async fn dump(&mut self) -> io::Result<Vec<FibRoute>> {
        (**self).dump().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub next_hop: IpAddr,
    pub metric: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstallState {
    Installed,
    /// Kernel install failed after bounded retries; internal state stays
    /// consistent so a later offer can retry
    Failed,
}

#[derive(Debug, Default)]
struct SinkEntry {
    offers: HashMap<RouteSource, Candidate>,
    installed: Option<(RouteSource, Candidate)>,
    state: Option<InstallState>,
}

impl SinkEntry {
    fn winner(&self) -> Option<(RouteSource, Candidate)> {
        self.offers
            .iter()
            .min_by_key(|(source, _)| **source)
            .map(|(source, candidate)| (*source, *candidate))
    }
}

/// Snapshot row for the observable-state API
#[derive(Debug, Clone)]
pub struct InstalledRoute {
    pub prefix: IpNetwork,
    pub next_hop: IpAddr,
    pub metric: u32,
    pub source: RouteSource,
    pub state: InstallState,
}

const INSTALL_RETRIES: u8 = 3;

pub struct Installer<F: Fib> {
    fib: F,
    sink: HashMap<IpNetwork, SinkEntry>,
}

impl<F: Fib> Installer<F> {
    pub fn new(fib: F) -> Self {
        Self {
            fib,
            sink: HashMap::new(),
        }
    }

    /// Remove tagged leftovers from a previous run. Only routes carrying
    /// our source tags are ever touched; host routes are invisible here.
    pub async fn reconcile(&mut self) -> io::Result<()> {
        let stale = self.fib.dump().await?;
        for route in stale {
            if !self.sink.contains_key(&route.prefix) {
                info!("Reconcile: removing stale {} route {}", route.source, route.prefix);
                self.fib.remove(&route.prefix, route.source).await?;
            }
        }
        Ok(())
    }

    /// A protocol offers (or refreshes) its route for a prefix
    pub async fn offer(
        &mut self,
        source: RouteSource,
        prefix: IpNetwork,
        next_hop: IpAddr,
        metric: u32,
    ) {
        let entry = self.sink.entry(prefix).or_default();
        entry.offers.insert(source, Candidate { next_hop, metric });
        self.sync(prefix).await;
    }

    /// A protocol withdraws its route for a prefix. The remaining offers
    /// are consulted for a fallback before the kernel entry is removed.
    pub async fn withdraw(&mut self, source: RouteSource, prefix: IpNetwork) {
        let Some(entry) = self.sink.get_mut(&prefix) else {
            return;
        };
        entry.offers.remove(&source);
        self.sync(prefix).await;
    }

    /// Converge the kernel entry for a prefix with the best current offer
    async fn sync(&mut self, prefix: IpNetwork) {
        let Some(entry) = self.sink.get_mut(&prefix) else {
            return;
        };
        match entry.winner() {
            Some((source, candidate)) => {
                if entry.installed == Some((source, candidate))
                    && entry.state == Some(InstallState::Installed)
                {
                    return;
                }
                // The kernel owns connected routes; winning here only
                // means retracting whatever we had installed over it
                if source == RouteSource::Connected {
                    if let Some((previous, _)) = entry.installed {
                        if previous != RouteSource::Connected {
                            if let Err(err) = self.fib.remove(&prefix, previous).await {
                                warn!("Remove {} failed: {}", prefix, err);
                            }
                        }
                    }
                    entry.installed = Some((source, candidate));
                    entry.state = Some(InstallState::Installed);
                    return;
                }
                let route = FibRoute {
                    prefix,
                    next_hop: candidate.next_hop,
                    metric: candidate.metric,
                    source,
                };
                let mut outcome = None;
                for attempt in 1..=INSTALL_RETRIES {
                    match self.fib.replace(&route).await {
                        Ok(()) => {
                            outcome = Some(InstallState::Installed);
                            break;
                        }
                        Err(err) => {
                            warn!(
                                "Install {} via {} failed (attempt {}/{}): {}",
                                prefix, candidate.next_hop, attempt, INSTALL_RETRIES, err
                            );
                        }
                    }
                }
                match outcome {
                    Some(state) => {
                        debug!("Installed {} via {} [{}]", prefix, candidate.next_hop, source);
                        entry.installed = Some((source, candidate));
                        entry.state = Some(state);
                    }
                    None => {
                        entry.installed = None;
                        entry.state = Some(InstallState::Failed);
                    }
                }
            }
            None => {
                if entry.installed.is_some() {
                    let (source, _) = entry.installed.expect("checked above");
                    if let Err(err) = self.fib.remove(&prefix, source).await {
                        warn!("Remove {} failed: {}", prefix, err);
                    } else {
                        debug!("Removed {} [{}]", prefix, source);
                    }
                }
                self.sink.remove(&prefix);
            }
        }
    }

    /// Is `next_hop` reachable through something we know how to forward to
    /// (a connected network or an IGP route)?
    pub fn resolves(&self, next_hop: &IpAddr) -> bool {
        self.sink.iter().any(|(prefix, entry)| {
            prefix.contains(*next_hop)
                && entry
                    .offers
                    .keys()
                    .any(|source| *source != RouteSource::Bgp)
        })
    }

    /// Cost to reach a next-hop through the IGP, for decision step (f)
    pub fn igp_cost(&self, next_hop: &IpAddr) -> Option<u32> {
        self.sink
            .iter()
            .filter(|(prefix, _)| prefix.contains(*next_hop))
            .filter_map(|(_, entry)| entry.offers.get(&RouteSource::Ospf))
            .map(|candidate| candidate.metric)
            .min()
    }

    pub fn snapshot(&self) -> Vec<InstalledRoute> {
        let mut routes: Vec<InstalledRoute> = self
            .sink
            .iter()
            .filter_map(|(prefix, entry)| {
                let (source, candidate) = entry.installed?;
                Some(InstalledRoute {
                    prefix: *prefix,
                    next_hop: candidate.next_hop,
                    metric: candidate.metric,
                    source,
                    state: entry.state.unwrap_or(InstallState::Installed),
                })
            })
            .collect();
        routes.sort_by_key(|route| route.prefix);
        routes
    }

    /// For every sink prefix, exactly one source is installed
    pub fn installed_source(&self, prefix: &IpNetwork) -> Option<RouteSource> {
        self.sink
            .get(prefix)
            .and_then(|entry| entry.installed.map(|(source, _)| source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix() -> IpNetwork {
        "203.0.113.0/24".parse().unwrap()
    }

    fn next_hop() -> IpAddr {
        "192.0.2.2".parse().unwrap()
    }

    #[tokio::test]
    async fn test_offer_installs() {
        let mut installer = Installer::new(MockFib::default());
        installer
            .offer(RouteSource::Bgp, prefix(), next_hop(), 100)
            .await;
        assert_eq!(installer.installed_source(&prefix()), Some(RouteSource::Bgp));
        let ops = installer.fib.operations();
        assert_eq!(ops.len(), 1);
        assert!(ops[0].starts_with("replace"));
    }

    #[tokio::test]
    async fn test_preference_connected_over_ospf_over_bgp() {
        let mut installer = Installer::new(MockFib::default());
        installer
            .offer(RouteSource::Bgp, prefix(), next_hop(), 100)
            .await;
        installer
            .offer(RouteSource::Ospf, prefix(), "10.0.0.2".parse().unwrap(), 10)
            .await;
        assert_eq!(installer.installed_source(&prefix()), Some(RouteSource::Ospf));
        installer
            .offer(
                RouteSource::Connected,
                prefix(),
                "0.0.0.0".parse().unwrap(),
                0,
            )
            .await;
        assert_eq!(
            installer.installed_source(&prefix()),
            Some(RouteSource::Connected)
        );
        // A connected winner retracts our route instead of replacing it:
        // the kernel already has the connected entry
        assert!(installer
            .fib
            .operations()
            .last()
            .unwrap()
            .starts_with("remove"));
    }

    #[tokio::test]
    async fn test_withdraw_falls_back_without_gap() {
        let mut installer = Installer::new(MockFib::default());
        installer
            .offer(RouteSource::Ospf, prefix(), "10.0.0.2".parse().unwrap(), 10)
            .await;
        installer
            .offer(RouteSource::Bgp, prefix(), next_hop(), 100)
            .await;
        assert_eq!(installer.installed_source(&prefix()), Some(RouteSource::Ospf));

        installer.withdraw(RouteSource::Ospf, prefix()).await;
        // Fallback to BGP happened via replace; no remove was issued
        assert_eq!(installer.installed_source(&prefix()), Some(RouteSource::Bgp));
        assert!(installer
            .fib
            .operations()
            .iter()
            .all(|op| op.starts_with("replace")));
    }

    #[tokio::test]
    async fn test_withdraw_last_offer_removes() {
        let mut installer = Installer::new(MockFib::default());
        installer
            .offer(RouteSource::Bgp, prefix(), next_hop(), 100)
            .await;
        installer.withdraw(RouteSource::Bgp, prefix()).await;
        assert_eq!(installer.installed_source(&prefix()), None);
        let ops = installer.fib.operations();
        assert_eq!(ops.last().unwrap(), &format!("remove {} bgp", prefix()));
    }

    #[tokio::test]
    async fn test_same_offer_is_idempotent() {
        let mut installer = Installer::new(MockFib::default());
        installer
            .offer(RouteSource::Bgp, prefix(), next_hop(), 100)
            .await;
        installer
            .offer(RouteSource::Bgp, prefix(), next_hop(), 100)
            .await;
        assert_eq!(installer.fib.operations().len(), 1);
    }

    #[tokio::test]
    async fn test_install_failure_is_bounded_and_recoverable() {
        let mut fib = MockFib::default();
        fib.fail_replaces(INSTALL_RETRIES as usize);
        let mut installer = Installer::new(fib);
        installer
            .offer(RouteSource::Bgp, prefix(), next_hop(), 100)
            .await;
        assert_eq!(installer.installed_source(&prefix()), None);
        assert_eq!(installer.fib.operations().len(), 3);

        // The next offer retries and succeeds
        installer
            .offer(RouteSource::Bgp, prefix(), next_hop(), 100)
            .await;
        assert_eq!(installer.installed_source(&prefix()), Some(RouteSource::Bgp));
    }

    #[tokio::test]
    async fn test_reconcile_removes_tagged_strays() {
        let mut fib = MockFib::default();
        fib.preload(FibRoute {
            prefix: prefix(),
            next_hop: next_hop(),
            metric: 100,
            source: RouteSource::Bgp,
        });
        let mut installer = Installer::new(fib);
        installer.reconcile().await.unwrap();
        assert_eq!(
            installer.fib.operations().last().unwrap(),
            &format!("remove {} bgp", prefix())
        );
    }

    #[tokio::test]
    async fn test_resolves_and_igp_cost() {
        let mut installer = Installer::new(MockFib::default());
        installer
            .offer(
                RouteSource::Ospf,
                "192.0.2.0/24".parse().unwrap(),
                "10.0.0.2".parse().unwrap(),
                15,
            )
            .await;
        assert!(installer.resolves(&next_hop()));
        assert_eq!(installer.igp_cost(&next_hop()), Some(15));
        assert!(!installer.resolves(&"198.51.100.1".parse().unwrap()));
    }
}
