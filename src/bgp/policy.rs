//! Import/export route policy: an ordered list of rules, each a
//! conjunction of match conditions with a sequence of actions. The first
//! rule whose matches all succeed fires and evaluation stops; otherwise
//! the policy's default action decides.
//!
//! Policies run at exactly two points: on import (before the Adj-RIB-In
//! write) and on export (after Loc-RIB selection, before the Adj-RIB-Out
//! write). A rejected route leaves no partial state behind.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use regex::Regex;

use super::community::Community;
use super::msg::Origin;
use super::rib::PathSet;

#[derive(Debug, Clone)]
pub enum MatchCondition {
    /// Prefix is equal to (exact) or contained in the given network
    Prefix { network: IpNetwork, exact: bool },
    /// Prefix length within the inclusive range
    PrefixLength { min: u8, max: u8 },
    /// Regex over the displayed AS path ("65010 65020 ...")
    AsPathRegex(Regex),
    AsPathMaxLength(usize),
    AsPathContains(u32),
    Community(Community),
    NextHop(IpAddr),
    LocalPref(u32),
    Med(u32),
    Origin(Origin),
}

impl MatchCondition {
    pub fn matches(&self, prefix: &IpNetwork, attributes: &PathSet) -> bool {
        match self {
            MatchCondition::Prefix { network, exact: true } => prefix == network,
            MatchCondition::Prefix { network, exact: false } => {
                network.contains(prefix.ip()) && prefix.prefix() >= network.prefix()
            }
            MatchCondition::PrefixLength { min, max } => {
                (*min..=*max).contains(&prefix.prefix())
            }
            MatchCondition::AsPathRegex(regex) => {
                regex.is_match(&attributes.as_path.to_string())
            }
            MatchCondition::AsPathMaxLength(bound) => {
                attributes.as_path.path_length() <= *bound
            }
            MatchCondition::AsPathContains(asn) => attributes.as_path.contains(*asn),
            MatchCondition::Community(community) => attributes.communities.contains(*community),
            MatchCondition::NextHop(next_hop) => attributes.next_hop == Some(*next_hop),
            MatchCondition::LocalPref(pref) => attributes.local_pref == Some(*pref),
            MatchCondition::Med(med) => attributes.multi_exit_disc == Some(*med),
            MatchCondition::Origin(origin) => attributes.origin == *origin,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PolicyAction {
    Accept,
    Reject,
    SetLocalPref(u32),
    SetMed(u32),
    SetNextHop(IpAddr),
    PrependAsPath { asn: u32, count: u8 },
    AddCommunity(Community),
    RemoveCommunity(Community),
    SetCommunities(Vec<Community>),
}

#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub name: String,
    pub matches: Vec<MatchCondition>,
    pub actions: Vec<PolicyAction>,
}

impl PolicyRule {
    fn fires(&self, prefix: &IpNetwork, attributes: &PathSet) -> bool {
        self.matches
            .iter()
            .all(|condition| condition.matches(prefix, attributes))
    }

    /// Run the action sequence over a copy of the attributes.
    /// `None` means the rule rejected the route.
    fn execute(&self, attributes: &PathSet) -> Option<PathSet> {
        let mut modified = attributes.clone();
        for action in &self.actions {
            match action {
                PolicyAction::Accept => return Some(modified),
                PolicyAction::Reject => return None,
                PolicyAction::SetLocalPref(pref) => modified.local_pref = Some(*pref),
                PolicyAction::SetMed(med) => modified.multi_exit_disc = Some(*med),
                PolicyAction::SetNextHop(next_hop) => modified.next_hop = Some(*next_hop),
                PolicyAction::PrependAsPath { asn, count } => {
                    for _ in 0..*count {
                        modified.as_path.prepend(*asn);
                    }
                }
                PolicyAction::AddCommunity(community) => {
                    if !modified.communities.contains(*community) {
                        modified.communities.0.push(*community);
                    }
                }
                PolicyAction::RemoveCommunity(community) => {
                    modified.communities.0.retain(|c| c != community);
                }
                PolicyAction::SetCommunities(communities) => {
                    modified.communities.0 = communities.clone();
                }
            }
        }
        // A fired rule without an explicit verdict accepts the route as
        // modified
        Some(modified)
    }
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub name: String,
    pub rules: Vec<PolicyRule>,
    pub default_accept: bool,
}

impl Policy {
    /// Accept-everything policy used when a peer has none configured
    pub fn permit_all() -> Self {
        Self {
            name: "permit-all".to_string(),
            rules: vec![],
            default_accept: true,
        }
    }

    pub fn apply(&self, prefix: &IpNetwork, attributes: &PathSet) -> Option<PathSet> {
        for rule in &self.rules {
            if rule.fires(prefix, attributes) {
                return rule.execute(attributes);
            }
        }
        if self.default_accept {
            Some(attributes.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::msg::AsPath;

    fn attributes() -> PathSet {
        PathSet {
            origin: Origin::Igp,
            as_path: AsPath::from_sequence(vec![65010, 65020]),
            next_hop: Some("192.0.2.2".parse().unwrap()),
            local_pref: Some(100),
            ..PathSet::default()
        }
    }

    fn prefix() -> IpNetwork {
        "203.0.113.0/24".parse().unwrap()
    }

    #[test]
    fn test_default_action_decides_without_rules() {
        let permit = Policy::permit_all();
        assert!(permit.apply(&prefix(), &attributes()).is_some());
        let deny = Policy {
            name: "deny-all".to_string(),
            rules: vec![],
            default_accept: false,
        };
        assert!(deny.apply(&prefix(), &attributes()).is_none());
    }

    #[test]
    fn test_first_matching_rule_fires() {
        let policy = Policy {
            name: "test".to_string(),
            rules: vec![
                PolicyRule {
                    name: "set-pref".to_string(),
                    matches: vec![MatchCondition::Prefix {
                        network: "203.0.113.0/24".parse().unwrap(),
                        exact: true,
                    }],
                    actions: vec![PolicyAction::SetLocalPref(200), PolicyAction::Accept],
                },
                PolicyRule {
                    name: "reject-rest".to_string(),
                    matches: vec![],
                    actions: vec![PolicyAction::Reject],
                },
            ],
            default_accept: false,
        };
        let accepted = policy.apply(&prefix(), &attributes()).unwrap();
        assert_eq!(accepted.local_pref, Some(200));
        assert!(policy
            .apply(&"198.51.100.0/24".parse().unwrap(), &attributes())
            .is_none());
    }

    #[test]
    fn test_conjunction_of_matches() {
        let rule = PolicyRule {
            name: "both".to_string(),
            matches: vec![
                MatchCondition::AsPathContains(65010),
                MatchCondition::LocalPref(100),
            ],
            actions: vec![PolicyAction::Accept],
        };
        assert!(rule.fires(&prefix(), &attributes()));
        let mut other = attributes();
        other.local_pref = Some(50);
        assert!(!rule.fires(&prefix(), &other));
    }

    #[test]
    fn test_prefix_range_match() {
        let condition = MatchCondition::Prefix {
            network: "203.0.0.0/8".parse().unwrap(),
            exact: false,
        };
        assert!(condition.matches(&prefix(), &attributes()));
        let condition = MatchCondition::PrefixLength { min: 8, max: 16 };
        assert!(!condition.matches(&prefix(), &attributes()));
    }

    #[test]
    fn test_as_path_regex() {
        let condition = MatchCondition::AsPathRegex(Regex::new("^65010 ").unwrap());
        assert!(condition.matches(&prefix(), &attributes()));
        let condition = MatchCondition::AsPathRegex(Regex::new("65099").unwrap());
        assert!(!condition.matches(&prefix(), &attributes()));
    }

    #[test]
    fn test_prepend_and_community_actions() {
        let rule = PolicyRule {
            name: "shape".to_string(),
            matches: vec![],
            actions: vec![
                PolicyAction::PrependAsPath { asn: 65001, count: 2 },
                PolicyAction::AddCommunity(Community::new(65000, 42)),
            ],
        };
        let shaped = rule.execute(&attributes()).unwrap();
        assert_eq!(shaped.as_path.path_length(), 4);
        assert_eq!(shaped.as_path.first_asn(), Some(65001));
        assert!(shaped.communities.contains(Community::new(65000, 42)));
    }

    #[test]
    fn test_reject_leaves_no_partial_state() {
        let rule = PolicyRule {
            name: "mutate-then-reject".to_string(),
            matches: vec![],
            actions: vec![PolicyAction::SetLocalPref(500), PolicyAction::Reject],
        };
        let original = attributes();
        assert!(rule.execute(&original).is_none());
        // Input untouched
        assert_eq!(original.local_pref, Some(100));
    }
}
