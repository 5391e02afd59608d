//! OPEN capability encoding (RFC 5492) and the negotiated capability set.

use std::collections::HashSet;
use std::convert::TryFrom;
use std::io::{Cursor, Read};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

use super::{Afi, MessageError, Open, Safi};

const CAP_MULTIPROTOCOL: u8 = 1;
const CAP_ROUTE_REFRESH: u8 = 2;
const CAP_GRACEFUL_RESTART: u8 = 64;
const CAP_FOUR_BYTE_ASN: u8 = 65;

#[derive(Debug, Clone, PartialEq)]
pub enum Capability {
    MultiProtocol(Afi, Safi),
    RouteRefresh,
    GracefulRestart {
        restart_state: bool,
        restart_time: u16,
        families: Vec<(Afi, Safi)>,
    },
    FourByteAsn(u32),
    Unknown { code: u8, value: Vec<u8> },
}

impl Capability {
    pub(crate) fn decode_list(buf: &[u8]) -> Result<Vec<Capability>, MessageError> {
        let mut cursor = Cursor::new(buf);
        let mut capabilities = Vec::new();
        while (cursor.position() as usize) < buf.len() {
            let code = cursor.read_u8()?;
            let length = cursor.read_u8()? as usize;
            let mut value = vec![0u8; length];
            cursor.read_exact(&mut value)?;
            let capability = match (code, length) {
                (CAP_MULTIPROTOCOL, 4) => {
                    let mut inner = Cursor::new(&value[..]);
                    let afi = match Afi::try_from(inner.read_u16::<NetworkEndian>()?) {
                        Ok(afi) => afi,
                        // A family we don't speak is simply not negotiated
                        Err(_) => continue,
                    };
                    let _reserved = inner.read_u8()?;
                    let safi = match Safi::try_from(inner.read_u8()?) {
                        Ok(safi) => safi,
                        Err(_) => continue,
                    };
                    Capability::MultiProtocol(afi, safi)
                }
                (CAP_ROUTE_REFRESH, 0) => Capability::RouteRefresh,
                (CAP_FOUR_BYTE_ASN, 4) => {
                    let mut inner = Cursor::new(&value[..]);
                    Capability::FourByteAsn(inner.read_u32::<NetworkEndian>()?)
                }
                (CAP_GRACEFUL_RESTART, n) if n >= 2 && (n - 2) % 4 == 0 => {
                    let mut inner = Cursor::new(&value[..]);
                    let word = inner.read_u16::<NetworkEndian>()?;
                    let restart_state = word & 0x8000 != 0;
                    let restart_time = word & 0x0fff;
                    let mut families = Vec::new();
                    for _ in 0..(n - 2) / 4 {
                        let afi = Afi::try_from(inner.read_u16::<NetworkEndian>()?);
                        let safi = Safi::try_from(inner.read_u8()?);
                        let _flags = inner.read_u8()?;
                        if let (Ok(afi), Ok(safi)) = (afi, safi) {
                            families.push((afi, safi));
                        }
                    }
                    Capability::GracefulRestart {
                        restart_state,
                        restart_time,
                        families,
                    }
                }
                _ => Capability::Unknown { code, value },
            };
            capabilities.push(capability);
        }
        Ok(capabilities)
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) -> Result<(), MessageError> {
        match self {
            Capability::MultiProtocol(afi, safi) => {
                out.write_u8(CAP_MULTIPROTOCOL)?;
                out.write_u8(4)?;
                out.write_u16::<NetworkEndian>(*afi as u16)?;
                out.write_u8(0)?;
                out.write_u8(*safi as u8)?;
            }
            Capability::RouteRefresh => {
                out.write_u8(CAP_ROUTE_REFRESH)?;
                out.write_u8(0)?;
            }
            Capability::GracefulRestart {
                restart_state,
                restart_time,
                families,
            } => {
                out.write_u8(CAP_GRACEFUL_RESTART)?;
                out.write_u8((2 + families.len() * 4) as u8)?;
                let mut word = restart_time & 0x0fff;
                if *restart_state {
                    word |= 0x8000;
                }
                out.write_u16::<NetworkEndian>(word)?;
                for (afi, safi) in families {
                    out.write_u16::<NetworkEndian>(*afi as u16)?;
                    out.write_u8(*safi as u8)?;
                    out.write_u8(0)?;
                }
            }
            Capability::FourByteAsn(asn) => {
                out.write_u8(CAP_FOUR_BYTE_ASN)?;
                out.write_u8(4)?;
                out.write_u32::<NetworkEndian>(*asn)?;
            }
            Capability::Unknown { code, value } => {
                out.write_u8(*code)?;
                out.write_u8(value.len() as u8)?;
                out.extend_from_slice(value);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GracefulRestartCap {
    pub restart_state: bool,
    pub restart_time: u16,
}

/// The capability view of one side of a session, and (via [`common`]) the
/// negotiated intersection. Capabilities the peer did not echo are
/// un-negotiated.
///
/// [`common`]: Capabilities::common
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities {
    pub families: HashSet<(Afi, Safi)>,
    pub route_refresh: bool,
    pub four_byte_asn: Option<u32>,
    pub graceful_restart: Option<GracefulRestartCap>,
}

impl Capabilities {
    pub fn from_open(open: &Open) -> Self {
        let mut caps = Capabilities::default();
        for capability in open.capabilities() {
            match capability {
                Capability::MultiProtocol(afi, safi) => {
                    caps.families.insert((*afi, *safi));
                }
                Capability::RouteRefresh => caps.route_refresh = true,
                Capability::FourByteAsn(asn) => caps.four_byte_asn = Some(*asn),
                Capability::GracefulRestart {
                    restart_state,
                    restart_time,
                    ..
                } => {
                    caps.graceful_restart = Some(GracefulRestartCap {
                        restart_state: *restart_state,
                        restart_time: *restart_time,
                    })
                }
                Capability::Unknown { .. } => (),
            }
        }
        caps
    }

    /// Intersection of what we offered with what the peer offered.
    ///
    /// Graceful-restart keeps the peer's timing (it describes the peer's
    /// restart behavior, not a shared parameter).
    pub fn common(&self, peer: &Capabilities) -> Capabilities {
        Capabilities {
            families: self.families.intersection(&peer.families).copied().collect(),
            route_refresh: self.route_refresh && peer.route_refresh,
            four_byte_asn: match (self.four_byte_asn, peer.four_byte_asn) {
                (Some(_), Some(asn)) => Some(asn),
                _ => None,
            },
            graceful_restart: match (self.graceful_restart, peer.graceful_restart) {
                (Some(_), Some(peer_gr)) => Some(peer_gr),
                _ => None,
            },
        }
    }

    pub fn supports_family(&self, afi: Afi, safi: Safi) -> bool {
        self.families.contains(&(afi, safi))
    }

    /// Human-readable capability list for the API
    pub fn describe(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .families
            .iter()
            .map(|(afi, safi)| format!("{} {}", afi, safi))
            .collect();
        out.sort();
        if self.route_refresh {
            out.push("Route Refresh".to_string());
        }
        if let Some(asn) = self.four_byte_asn {
            out.push(format!("4-Octet ASN ({})", asn));
        }
        if let Some(gr) = self.graceful_restart {
            out.push(format!("Graceful Restart ({}s)", gr.restart_time));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_list_round_trip() {
        let caps = vec![
            Capability::MultiProtocol(Afi::Ipv4, Safi::Unicast),
            Capability::MultiProtocol(Afi::Ipv6, Safi::Unicast),
            Capability::RouteRefresh,
            Capability::GracefulRestart {
                restart_state: false,
                restart_time: 120,
                families: vec![(Afi::Ipv4, Safi::Unicast)],
            },
            Capability::FourByteAsn(4259840100),
        ];
        let mut bytes = Vec::new();
        for capability in &caps {
            capability.encode(&mut bytes).unwrap();
        }
        assert_eq!(Capability::decode_list(&bytes).unwrap(), caps);
    }

    #[test]
    fn test_common_capabilities() {
        let mut ours = Capabilities::default();
        ours.families.insert((Afi::Ipv4, Safi::Unicast));
        ours.families.insert((Afi::Ipv6, Safi::Unicast));
        ours.route_refresh = true;
        ours.four_byte_asn = Some(65001);

        let mut theirs = Capabilities::default();
        theirs.families.insert((Afi::Ipv4, Safi::Unicast));
        theirs.four_byte_asn = Some(65002);
        theirs.graceful_restart = Some(GracefulRestartCap {
            restart_state: false,
            restart_time: 90,
        });

        let common = ours.common(&theirs);
        assert_eq!(common.families.len(), 1);
        assert!(common.supports_family(Afi::Ipv4, Safi::Unicast));
        assert!(!common.route_refresh);
        // The negotiated value is the peer's ASN
        assert_eq!(common.four_byte_asn, Some(65002));
        // We did not offer graceful restart, so it is not negotiated
        assert_eq!(common.graceful_restart, None);
    }
}
