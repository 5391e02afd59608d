//! Concrete FIB backends: the Linux `ip route` surface and an in-memory
//! mock for tests.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::process::Output;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use log::trace;
use tokio::process::Command;

use super::{Fib, FibRoute, RouteSource};

/// Kernel routing-protocol tags for routes this agent installs. Numeric
/// values in the user-defined range so `ip route show proto <tag>` yields
/// exactly our routes and nothing the host owns.
pub fn proto_tag(source: RouteSource) -> u8 {
    match source {
        RouteSource::Connected => 201,
        RouteSource::Ospf => 202,
        RouteSource::Bgp => 203,
    }
}

fn source_for_tag(tag: &str) -> Option<RouteSource> {
    match tag {
        "201" => Some(RouteSource::Connected),
        "202" => Some(RouteSource::Ospf),
        "203" => Some(RouteSource::Bgp),
        _ => None,
    }
}

/// Installs routes with the `ip route` command
#[derive(Debug, Default)]
pub struct IpRouteFib;

impl IpRouteFib {
    async fn run(args: &[String]) -> io::Result<Output> {
        trace!("ip {}", args.join(" "));
        let output = Command::new("ip").args(args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Removing a route that is already gone is not a failure
            if !stderr.contains("No such process") {
                return Err(io::Error::new(io::ErrorKind::Other, stderr.to_string()));
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl Fib for IpRouteFib {
    async fn replace(&mut self, route: &FibRoute) -> io::Result<()> {
        let args: Vec<String> = vec![
            "route".into(),
            "replace".into(),
            route.prefix.to_string(),
            "via".into(),
            route.next_hop.to_string(),
            "metric".into(),
            route.metric.to_string(),
            "proto".into(),
            proto_tag(route.source).to_string(),
        ];
        Self::run(&args).await.map(|_| ())
    }

    async fn remove(&mut self, prefix: &IpNetwork, source: RouteSource) -> io::Result<()> {
        let args: Vec<String> = vec![
            "route".into(),
            "del".into(),
            prefix.to_string(),
            "proto".into(),
            proto_tag(source).to_string(),
        ];
        Self::run(&args).await.map(|_| ())
    }

    async fn dump(&mut self) -> io::Result<Vec<FibRoute>> {
        let mut routes = Vec::new();
        for source in [RouteSource::Connected, RouteSource::Ospf, RouteSource::Bgp] {
            let args: Vec<String> = vec![
                "route".into(),
                "show".into(),
                "proto".into(),
                proto_tag(source).to_string(),
            ];
            let output = Self::run(&args).await?;
            let stdout = String::from_utf8_lossy(&output.stdout);
            for line in stdout.lines() {
                if let Some(route) = parse_route_line(line, source) {
                    routes.push(route);
                }
            }
        }
        Ok(routes)
    }
}

/// Parse one `ip route show` line:
/// `203.0.113.0/24 via 192.0.2.2 dev eth0 metric 100`
fn parse_route_line(line: &str, source: RouteSource) -> Option<FibRoute> {
    let mut words = line.split_whitespace();
    let prefix: IpNetwork = words.next()?.parse().ok()?;
    let mut next_hop: Option<IpAddr> = None;
    let mut metric = 0u32;
    while let Some(word) = words.next() {
        match word {
            "via" => next_hop = words.next()?.parse().ok(),
            "metric" => metric = words.next()?.parse().ok()?,
            _ => (),
        }
    }
    Some(FibRoute {
        prefix,
        next_hop: next_hop?,
        metric,
        source,
    })
}

/// Records operations instead of touching the host; used by tests
#[derive(Debug, Default)]
pub struct MockFib {
    routes: HashMap<IpNetwork, FibRoute>,
    operations: Vec<String>,
    replace_failures: usize,
}

impl MockFib {
    pub fn operations(&self) -> &[String] {
        &self.operations
    }

    pub fn routes(&self) -> Vec<FibRoute> {
        self.routes.values().cloned().collect()
    }

    /// Make the next `count` replace calls fail
    pub fn fail_replaces(&mut self, count: usize) {
        self.replace_failures = count;
    }

    /// Seed a tagged route as if left over from a previous run
    pub fn preload(&mut self, route: FibRoute) {
        self.routes.insert(route.prefix, route);
    }
}

#[async_trait]
impl Fib for MockFib {
    async fn replace(&mut self, route: &FibRoute) -> io::Result<()> {
        self.operations.push(format!(
            "replace {} via {} {}",
            route.prefix, route.next_hop, route.source
        ));
        if self.replace_failures > 0 {
            self.replace_failures -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "mock failure"));
        }
        self.routes.insert(route.prefix, route.clone());
        Ok(())
    }

    async fn remove(&mut self, prefix: &IpNetwork, source: RouteSource) -> io::Result<()> {
        self.operations.push(format!("remove {} {}", prefix, source));
        self.routes.remove(prefix);
        Ok(())
    }

    async fn dump(&mut self) -> io::Result<Vec<FibRoute>> {
        Ok(self.routes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route_line() {
        let route = parse_route_line(
            "203.0.113.0/24 via 192.0.2.2 dev eth0 metric 100",
            RouteSource::Bgp,
        )
        .unwrap();
        assert_eq!(route.prefix, "203.0.113.0/24".parse::<IpNetwork>().unwrap());
        assert_eq!(route.next_hop, "192.0.2.2".parse::<IpAddr>().unwrap());
        assert_eq!(route.metric, 100);
    }

    #[test]
    fn test_parse_route_line_without_via_is_skipped() {
        assert!(parse_route_line(
            "203.0.113.0/24 dev eth0 scope link",
            RouteSource::Connected
        )
        .is_none());
    }

    #[test]
    fn test_proto_tags_are_distinct() {
        let tags = [
            proto_tag(RouteSource::Connected),
            proto_tag(RouteSource::Ospf),
            proto_tag(RouteSource::Bgp),
        ];
        assert_eq!(
            tags.iter().collect::<std::collections::HashSet<_>>().len(),
            3
        );
    }
}
