pub mod flooding;
pub mod instance;
pub mod interface;
pub mod lsa;
pub mod lsdb;
pub mod neighbor;
pub mod packet;
pub mod socket;
pub mod spf;

use std::error;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;

pub const OSPF_VERSION: u8 = 2;
pub const OSPF_IP_PROTO: u8 = 89;

/// AllSPFRouters multicast group (every flooded packet goes here, TTL 1)
pub const ALL_SPF_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 5);
pub const ALL_DR_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 6);

/// Architectural constants (RFC 2328 appendix B)
pub const MAX_AGE: u16 = 3600;
pub const MAX_AGE_DIFF: u16 = 900;
pub const LS_REFRESH_TIME: u16 = 1800;
pub const RXMT_INTERVAL_SECS: i64 = 5;
pub const INITIAL_SEQUENCE: i32 = -0x7FFF_FFFF; // 0x80000001
pub const MAX_SEQUENCE: i32 = 0x7FFF_FFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Truncated,
    BadVersion(u8),
    BadPacketType(u8),
    BadChecksum,
    BadLsaChecksum,
    /// Only null authentication is in scope
    BadAuthType(u16),
    BadLsaType(u8),
    BadLength,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "Packet truncated"),
            DecodeError::BadVersion(v) => write!(f, "Unsupported OSPF version {}", v),
            DecodeError::BadPacketType(t) => write!(f, "Unknown packet type {}", t),
            DecodeError::BadChecksum => write!(f, "Header checksum mismatch"),
            DecodeError::BadLsaChecksum => write!(f, "LSA checksum mismatch"),
            DecodeError::BadAuthType(t) => write!(f, "Unsupported auth type {}", t),
            DecodeError::BadLsaType(t) => write!(f, "Unknown LSA type {}", t),
            DecodeError::BadLength => write!(f, "Inconsistent length field"),
        }
    }
}

impl error::Error for DecodeError {}

#[derive(Debug)]
pub enum OspfError {
    Decode(DecodeError),
    Io(io::Error),
}

impl fmt::Display for OspfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OspfError::Decode(err) => write!(f, "OSPF decode error: {}", err),
            OspfError::Io(err) => write!(f, "OSPF I/O error: {}", err),
        }
    }
}

impl error::Error for OspfError {}

impl From<DecodeError> for OspfError {
    fn from(err: DecodeError) -> Self {
        OspfError::Decode(err)
    }
}

impl From<io::Error> for OspfError {
    fn from(err: io::Error) -> Self {
        OspfError::Io(err)
    }
}
