//! Route reflection (RFC 4456): advertisement rules between clients and
//! non-clients, plus ORIGINATOR_ID / CLUSTER_LIST loop prevention.

use std::net::Ipv4Addr;

use serde::Deserialize;

use super::rib::PathSet;

/// iBGP role of a peer relative to this speaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Client,
    NonClient,
}

impl<'de> Deserialize<'de> for PeerRole {
    fn deserialize<D>(deserializer: D) -> Result<PeerRole, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_lowercase().as_str() {
            "client" => Ok(PeerRole::Client),
            "non-client" => Ok(PeerRole::NonClient),
            _ => Err(serde::de::Error::custom(format!(
                "Unsupported peer role: '{}'",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RouteReflector {
    pub cluster_id: Ipv4Addr,
    pub router_id: Ipv4Addr,
}

impl RouteReflector {
    pub fn new(cluster_id: Ipv4Addr, router_id: Ipv4Addr) -> Self {
        Self {
            cluster_id,
            router_id,
        }
    }

    /// May an iBGP-learned route be sent on to another iBGP peer?
    ///
    /// - from a client: reflect to every other iBGP peer
    /// - from a non-client: reflect to clients only
    pub fn should_reflect(&self, from: PeerRole, to: PeerRole) -> bool {
        match from {
            PeerRole::Client => true,
            PeerRole::NonClient => to == PeerRole::Client,
        }
    }

    /// Import-side check: a reflected route that carries our identity has
    /// looped and must be discarded.
    pub fn is_looped(&self, attributes: &PathSet) -> bool {
        if attributes.originator_id == Some(self.router_id) {
            return true;
        }
        attributes.cluster_list.contains(&self.cluster_id)
    }

    /// Shape attributes for reflection: stamp the originator (if absent)
    /// and prepend our cluster-id.
    pub fn prepare(&self, attributes: &PathSet, originator: Ipv4Addr) -> PathSet {
        let mut reflected = attributes.clone();
        if reflected.originator_id.is_none() {
            reflected.originator_id = Some(originator);
        }
        reflected.cluster_list.insert(0, self.cluster_id);
        reflected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reflector() -> RouteReflector {
        RouteReflector::new("10.0.0.1".parse().unwrap(), "10.0.1.1".parse().unwrap())
    }

    #[test]
    fn test_reflection_rules() {
        let rr = reflector();
        assert!(rr.should_reflect(PeerRole::Client, PeerRole::Client));
        assert!(rr.should_reflect(PeerRole::Client, PeerRole::NonClient));
        assert!(rr.should_reflect(PeerRole::NonClient, PeerRole::Client));
        assert!(!rr.should_reflect(PeerRole::NonClient, PeerRole::NonClient));
    }

    #[test]
    fn test_prepare_stamps_originator_and_cluster() {
        let rr = reflector();
        let originator: Ipv4Addr = "10.0.1.2".parse().unwrap();
        let reflected = rr.prepare(&PathSet::default(), originator);
        assert_eq!(reflected.originator_id, Some(originator));
        assert_eq!(reflected.cluster_list, vec![rr.cluster_id]);

        // A second reflection keeps the original originator and grows the
        // cluster list
        let second = RouteReflector::new("10.0.0.2".parse().unwrap(), rr.router_id);
        let again = second.prepare(&reflected, "10.0.9.9".parse().unwrap());
        assert_eq!(again.originator_id, Some(originator));
        assert_eq!(
            again.cluster_list,
            vec![second.cluster_id, rr.cluster_id]
        );
    }

    #[test]
    fn test_loop_detection() {
        let rr = reflector();
        let mut attributes = PathSet::default();
        assert!(!rr.is_looped(&attributes));
        attributes.cluster_list = vec![rr.cluster_id];
        assert!(rr.is_looped(&attributes));

        let mut attributes = PathSet::default();
        attributes.originator_id = Some(rr.router_id);
        assert!(rr.is_looped(&attributes));
    }
}
