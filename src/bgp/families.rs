use std::collections::HashSet;
use std::fmt;

use serde::{self, Deserialize, Deserializer, Serialize, Serializer};

use super::msg::{Afi, Capability, Safi};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Family {
    pub afi: Afi,
    pub safi: Safi,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.afi, self.safi)
    }
}

impl Family {
    pub fn new(afi: Afi, safi: Safi) -> Self {
        Self { afi, safi }
    }

    pub fn ipv4_unicast() -> Self {
        Self::new(Afi::Ipv4, Safi::Unicast)
    }

    pub fn ipv6_unicast() -> Self {
        Self::new(Afi::Ipv6, Safi::Unicast)
    }

    pub fn to_capability(self) -> Capability {
        Capability::MultiProtocol(self.afi, self.safi)
    }
}

impl From<&Family> for (Afi, Safi) {
    fn from(family: &Family) -> (Afi, Safi) {
        (family.afi, family.safi)
    }
}

impl From<(Afi, Safi)> for Family {
    fn from(pair: (Afi, Safi)) -> Family {
        Family::new(pair.0, pair.1)
    }
}

impl Serialize for Family {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Family {
    fn deserialize<D>(deserializer: D) -> Result<Family, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let parts: Vec<&str> = s.trim().split_whitespace().collect();
        if parts.len() != 2 {
            return Err(serde::de::Error::custom(format!(
                "Incorrect family format: '{}'",
                s
            )));
        }
        let afi = match parts[0].to_lowercase().as_str() {
            "ipv4" => Afi::Ipv4,
            "ipv6" => Afi::Ipv6,
            family => {
                return Err(serde::de::Error::custom(format!(
                    "Unsupported AFI: '{}'",
                    family
                )))
            }
        };
        let safi = match parts[1].to_lowercase().as_str() {
            "unicast" => Safi::Unicast,
            sfamily => {
                return Err(serde::de::Error::custom(format!(
                    "Unsupported SAFI: '{}'",
                    sfamily
                )))
            }
        };
        Ok(Family::new(afi, safi))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Families(HashSet<Family>);

impl Families {
    pub fn new(families: Vec<Family>) -> Self {
        Self(families.into_iter().collect())
    }

    pub fn common(&self, other: &Families) -> Self {
        Self(self.0.intersection(&other.0).cloned().collect())
    }

    pub fn contains(&self, family: Family) -> bool {
        self.0.contains(&family)
    }

    pub fn iter(&self) -> std::collections::hash_set::Iter<Family> {
        self.0.iter()
    }
}

impl From<&HashSet<(Afi, Safi)>> for Families {
    fn from(pairs: &HashSet<(Afi, Safi)>) -> Self {
        Self(pairs.iter().copied().map(Family::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::de::value::{Error, StrDeserializer};
    use serde::de::IntoDeserializer;

    #[test]
    fn test_serialize_family() {
        assert_eq!(&Family::ipv4_unicast().to_string(), "IPv4 Unicast");
        assert_eq!(&Family::ipv6_unicast().to_string(), "IPv6 Unicast");
    }

    #[test]
    fn test_deserialize_family() {
        let deserializer: StrDeserializer<Error> = "ipv6 unicast".into_deserializer();
        let family = Family::deserialize(deserializer).unwrap();
        assert_eq!(family, Family::ipv6_unicast());

        let deserializer: StrDeserializer<Error> = "ipv4 flowspec".into_deserializer();
        assert!(Family::deserialize(deserializer).is_err());
    }
}
