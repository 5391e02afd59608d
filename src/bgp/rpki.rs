//! RPKI origin validation (RFC 6811) against a locally loaded ROA table.
//!
//! The transport that feeds the table (RTR et al.) is out of scope; ROAs
//! arrive from a file named in the config. Validation states are attached
//! to routes at import; whether Invalid routes are excluded from the
//! decision process is a config knob.

use std::fs;
use std::io;
use std::path::Path;

use ipnetwork::IpNetwork;
use log::info;
use serde::Deserialize;

use super::rib::ValidationState;

#[derive(Debug, Clone, PartialEq)]
pub struct Roa {
    pub prefix: IpNetwork,
    /// Longest announced prefix the ROA authorizes; defaults to the ROA
    /// prefix length
    pub max_length: u8,
    pub asn: u32,
}

impl Roa {
    /// Does this ROA cover the announced prefix at all?
    fn covers(&self, prefix: &IpNetwork) -> bool {
        self.prefix.contains(prefix.ip()) && self.prefix.prefix() <= prefix.prefix()
    }
}

#[derive(Debug, Deserialize)]
struct RoaSpec {
    prefix: IpNetwork,
    asn: u32,
    max_length: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct RoaFileSpec {
    #[serde(default = "Vec::new")]
    roas: Vec<RoaSpec>,
}

#[derive(Debug, Default)]
pub struct RpkiValidator {
    roas: Vec<Roa>,
    enabled: bool,
}

impl RpkiValidator {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(roas: Vec<Roa>) -> Self {
        Self {
            roas,
            enabled: true,
        }
    }

    /// Load a ROA table from a TOML file:
    ///
    /// ```toml
    /// [[roas]]
    /// prefix = "203.0.113.0/24"
    /// asn = 65002
    /// max_length = 24
    /// ```
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let spec: RoaFileSpec = toml::from_str(&contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        let roas: Vec<Roa> = spec
            .roas
            .into_iter()
            .map(|roa| Roa {
                prefix: roa.prefix,
                max_length: roa.max_length.unwrap_or_else(|| roa.prefix.prefix()),
                asn: roa.asn,
            })
            .collect();
        info!("Loaded {} ROAs from {}", roas.len(), path.display());
        Ok(Self::new(roas))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn roa_count(&self) -> usize {
        self.roas.len()
    }

    /// Validate an announced prefix against the table (RFC 6811 section 2):
    /// NotFound when no ROA covers the prefix; Valid when a covering ROA
    /// matches the origin ASN and allows the prefix length; Invalid
    /// otherwise.
    pub fn validate(&self, prefix: &IpNetwork, origin_asn: Option<u32>) -> ValidationState {
        if !self.enabled {
            return ValidationState::Unverified;
        }
        let covering: Vec<&Roa> = self.roas.iter().filter(|roa| roa.covers(prefix)).collect();
        if covering.is_empty() {
            return ValidationState::NotFound;
        }
        let valid = covering.iter().any(|roa| {
            Some(roa.asn) == origin_asn && prefix.prefix() <= roa.max_length
        });
        if valid {
            ValidationState::Valid
        } else {
            ValidationState::Invalid
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> RpkiValidator {
        RpkiValidator::new(vec![Roa {
            prefix: "203.0.113.0/24".parse().unwrap(),
            max_length: 25,
            asn: 65002,
        }])
    }

    #[test]
    fn test_valid_origin() {
        let v = validator();
        assert_eq!(
            v.validate(&"203.0.113.0/24".parse().unwrap(), Some(65002)),
            ValidationState::Valid
        );
        // More specific but within max_length
        assert_eq!(
            v.validate(&"203.0.113.0/25".parse().unwrap(), Some(65002)),
            ValidationState::Valid
        );
    }

    #[test]
    fn test_wrong_origin_is_invalid() {
        assert_eq!(
            validator().validate(&"203.0.113.0/24".parse().unwrap(), Some(65099)),
            ValidationState::Invalid
        );
    }

    #[test]
    fn test_too_specific_is_invalid() {
        assert_eq!(
            validator().validate(&"203.0.113.0/26".parse().unwrap(), Some(65002)),
            ValidationState::Invalid
        );
    }

    #[test]
    fn test_uncovered_is_not_found() {
        assert_eq!(
            validator().validate(&"198.51.100.0/24".parse().unwrap(), Some(65002)),
            ValidationState::NotFound
        );
    }

    #[test]
    fn test_disabled_is_unverified() {
        assert_eq!(
            RpkiValidator::disabled().validate(&"203.0.113.0/24".parse().unwrap(), Some(65002)),
            ValidationState::Unverified
        );
    }
}
