use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::slice::Iter;

use serde::Serialize;

/// A standard (RFC 1997) community, displayed as "asn:value"
#[derive(Serialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Community(pub u32);

impl Community {
    pub fn new(asn: u16, value: u16) -> Self {
        Self((u32::from(asn) << 16) + u32::from(value))
    }
}

impl fmt::Display for Community {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0 >> 16, self.0 & 0xffff)
    }
}

impl TryFrom<&str> for Community {
    type Error = io::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let invalid = || io::Error::new(io::ErrorKind::InvalidInput, "Invalid community");
        let chunks: Vec<_> = value.split(':').collect();
        match chunks.len() {
            // Whole-u32 form (e.g. "4259840100")
            1 => chunks[0].parse().map(Community).map_err(|_| invalid()),
            2 => {
                let asn = chunks[0].parse::<u16>().map_err(|_| invalid())?;
                let value = chunks[1].parse::<u16>().map_err(|_| invalid())?;
                Ok(Community::new(asn, value))
            }
            _ => Err(invalid()),
        }
    }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CommunityList(pub Vec<Community>);

impl CommunityList {
    pub fn iter(&self) -> Iter<Community> {
        self.0.iter()
    }

    pub fn contains(&self, community: Community) -> bool {
        self.0.contains(&community)
    }

    pub fn values(&self) -> Vec<u32> {
        self.0.iter().map(|c| c.0).collect()
    }
}

impl From<&[u32]> for CommunityList {
    fn from(values: &[u32]) -> Self {
        CommunityList(values.iter().map(|v| Community(*v)).collect())
    }
}

impl fmt::Display for CommunityList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let communities = self
            .0
            .iter()
            .map(std::string::ToString::to_string)
            .collect::<Vec<String>>()
            .join(" ");
        write!(f, "{}", communities)
    }
}
