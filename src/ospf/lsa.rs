//! Link-State Advertisement formats (RFC 2328 section 12 / appendix A.4):
//! the 20-byte header, the five body types, the Fletcher-16 checksum
//! (computed with the age field excluded), and the section 13.1 newness
//! comparison.

use std::cmp::Ordering;
use std::fmt;
use std::io::Cursor;
use std::net::Ipv4Addr;

use byteorder::{NetworkEndian, ReadBytesExt};

use super::packet::read_addr;
use super::{DecodeError, MAX_AGE, MAX_AGE_DIFF};

pub const LSA_HEADER_LENGTH: usize = 20;

pub mod ls_type {
    pub const ROUTER: u8 = 1;
    pub const NETWORK: u8 = 2;
    pub const SUMMARY: u8 = 3;
    pub const ASBR_SUMMARY: u8 = 4;
    pub const EXTERNAL: u8 = 5;
}

pub mod link_type {
    pub const POINT_TO_POINT: u8 = 1;
    pub const TRANSIT: u8 = 2;
    pub const STUB: u8 = 3;
    pub const VIRTUAL: u8 = 4;
}

/// The LSDB key: at most one instance per triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LsaKey {
    pub ls_type: u8,
    pub link_state_id: Ipv4Addr,
    pub advertising_router: Ipv4Addr,
}

impl fmt::Display for LsaKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "type-{} id={} adv={}",
            self.ls_type, self.link_state_id, self.advertising_router
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsaHeader {
    pub ls_age: u16,
    pub options: u8,
    pub ls_type: u8,
    pub link_state_id: Ipv4Addr,
    pub advertising_router: Ipv4Addr,
    pub ls_sequence: i32,
    pub ls_checksum: u16,
    pub length: u16,
}

impl LsaHeader {
    pub fn key(&self) -> LsaKey {
        LsaKey {
            ls_type: self.ls_type,
            link_state_id: self.link_state_id,
            advertising_router: self.advertising_router,
        }
    }

    pub(crate) fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Self, DecodeError> {
        let truncated = |_| DecodeError::Truncated;
        let ls_age = cursor.read_u16::<NetworkEndian>().map_err(truncated)?;
        let options = cursor.read_u8().map_err(truncated)?;
        let ls_type = cursor.read_u8().map_err(truncated)?;
        if !(ls_type::ROUTER..=ls_type::EXTERNAL).contains(&ls_type) {
            return Err(DecodeError::BadLsaType(ls_type));
        }
        let link_state_id = read_addr(cursor)?;
        let advertising_router = read_addr(cursor)?;
        let ls_sequence = cursor.read_i32::<NetworkEndian>().map_err(truncated)?;
        let ls_checksum = cursor.read_u16::<NetworkEndian>().map_err(truncated)?;
        let length = cursor.read_u16::<NetworkEndian>().map_err(truncated)?;
        Ok(Self {
            ls_age,
            options,
            ls_type,
            link_state_id,
            advertising_router,
            ls_sequence,
            ls_checksum,
            length,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ls_age.to_be_bytes());
        out.push(self.options);
        out.push(self.ls_type);
        out.extend_from_slice(&self.link_state_id.octets());
        out.extend_from_slice(&self.advertising_router.octets());
        out.extend_from_slice(&self.ls_sequence.to_be_bytes());
        out.extend_from_slice(&self.ls_checksum.to_be_bytes());
        out.extend_from_slice(&self.length.to_be_bytes());
    }

    /// RFC 2328 section 13.1: which instance is more recent.
    /// `Ordering::Greater` means `self` is newer than `other`.
    pub fn compare_newness(&self, other: &LsaHeader) -> Ordering {
        match self.ls_sequence.cmp(&other.ls_sequence) {
            Ordering::Equal => (),
            ordering => return ordering,
        }
        match self.ls_checksum.cmp(&other.ls_checksum) {
            Ordering::Equal => (),
            ordering => return ordering,
        }
        // An instance at MaxAge is considered most recent
        match (self.ls_age == MAX_AGE, other.ls_age == MAX_AGE) {
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => (),
        }
        // Ages differing by more than MaxAgeDiff: the smaller age wins
        if self.ls_age.abs_diff(other.ls_age) > MAX_AGE_DIFF {
            return other.ls_age.cmp(&self.ls_age);
        }
        Ordering::Equal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterLink {
    /// Meaning depends on type: neighbor router-id (p2p), DR address
    /// (transit), or network address (stub)
    pub link_id: Ipv4Addr,
    /// Interface address (p2p/transit) or network mask (stub)
    pub link_data: Ipv4Addr,
    pub link_type: u8,
    pub metric: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LsaBody {
    Router {
        flags: u8,
        links: Vec<RouterLink>,
    },
    Network {
        network_mask: Ipv4Addr,
        attached_routers: Vec<Ipv4Addr>,
    },
    /// Types 3 and 4 share the layout
    Summary {
        network_mask: Ipv4Addr,
        metric: u32,
    },
    External {
        network_mask: Ipv4Addr,
        /// E-bit: type-2 external metric
        type2: bool,
        metric: u32,
        forwarding_address: Ipv4Addr,
        route_tag: u32,
    },
}

impl LsaBody {
    fn decode(ls_type: u8, buf: &[u8]) -> Result<Self, DecodeError> {
        let truncated = |_| DecodeError::Truncated;
        let mut cursor = Cursor::new(buf);
        match ls_type {
            ls_type::ROUTER => {
                let flags = cursor.read_u8().map_err(truncated)?;
                let _zero = cursor.read_u8().map_err(truncated)?;
                let count = cursor.read_u16::<NetworkEndian>().map_err(truncated)?;
                let mut links = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let link_id = read_addr(&mut cursor)?;
                    let link_data = read_addr(&mut cursor)?;
                    let link_type = cursor.read_u8().map_err(truncated)?;
                    let tos_count = cursor.read_u8().map_err(truncated)?;
                    let metric = cursor.read_u16::<NetworkEndian>().map_err(truncated)?;
                    // TOS metrics are obsolete; skip them
                    for _ in 0..tos_count {
                        cursor.read_u32::<NetworkEndian>().map_err(truncated)?;
                    }
                    links.push(RouterLink {
                        link_id,
                        link_data,
                        link_type,
                        metric,
                    });
                }
                Ok(LsaBody::Router { flags, links })
            }
            ls_type::NETWORK => {
                let network_mask = read_addr(&mut cursor)?;
                let mut attached_routers = Vec::new();
                while (cursor.position() as usize) < buf.len() {
                    attached_routers.push(read_addr(&mut cursor)?);
                }
                Ok(LsaBody::Network {
                    network_mask,
                    attached_routers,
                })
            }
            ls_type::SUMMARY | ls_type::ASBR_SUMMARY => {
                let network_mask = read_addr(&mut cursor)?;
                let metric = cursor.read_u32::<NetworkEndian>().map_err(truncated)? & 0x00ff_ffff;
                Ok(LsaBody::Summary {
                    network_mask,
                    metric,
                })
            }
            ls_type::EXTERNAL => {
                let network_mask = read_addr(&mut cursor)?;
                let word = cursor.read_u32::<NetworkEndian>().map_err(truncated)?;
                let type2 = word & 0x8000_0000 != 0;
                let metric = word & 0x00ff_ffff;
                let forwarding_address = read_addr(&mut cursor)?;
                let route_tag = cursor.read_u32::<NetworkEndian>().map_err(truncated)?;
                Ok(LsaBody::External {
                    network_mask,
                    type2,
                    metric,
                    forwarding_address,
                    route_tag,
                })
            }
            t => Err(DecodeError::BadLsaType(t)),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            LsaBody::Router { flags, links } => {
                out.push(*flags);
                out.push(0);
                out.extend_from_slice(&(links.len() as u16).to_be_bytes());
                for link in links {
                    out.extend_from_slice(&link.link_id.octets());
                    out.extend_from_slice(&link.link_data.octets());
                    out.push(link.link_type);
                    out.push(0); // no TOS metrics
                    out.extend_from_slice(&link.metric.to_be_bytes());
                }
            }
            LsaBody::Network {
                network_mask,
                attached_routers,
            } => {
                out.extend_from_slice(&network_mask.octets());
                for router in attached_routers {
                    out.extend_from_slice(&router.octets());
                }
            }
            LsaBody::Summary {
                network_mask,
                metric,
            } => {
                out.extend_from_slice(&network_mask.octets());
                out.extend_from_slice(&(metric & 0x00ff_ffff).to_be_bytes());
            }
            LsaBody::External {
                network_mask,
                type2,
                metric,
                forwarding_address,
                route_tag,
            } => {
                out.extend_from_slice(&network_mask.octets());
                let mut word = metric & 0x00ff_ffff;
                if *type2 {
                    word |= 0x8000_0000;
                }
                out.extend_from_slice(&word.to_be_bytes());
                out.extend_from_slice(&forwarding_address.octets());
                out.extend_from_slice(&route_tag.to_be_bytes());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lsa {
    pub header: LsaHeader,
    pub body: LsaBody,
}

impl Lsa {
    /// Construct a fresh LSA with length and checksum computed
    pub fn build(
        ls_type: u8,
        link_state_id: Ipv4Addr,
        advertising_router: Ipv4Addr,
        ls_sequence: i32,
        body: LsaBody,
    ) -> Lsa {
        let mut lsa = Lsa {
            header: LsaHeader {
                ls_age: 0,
                options: super::packet::OPTIONS_E,
                ls_type,
                link_state_id,
                advertising_router,
                ls_sequence,
                ls_checksum: 0,
                length: 0,
            },
            body,
        };
        lsa.finalize();
        lsa
    }

    /// Recompute length and checksum after any header/body change
    pub fn finalize(&mut self) {
        self.header.ls_checksum = 0;
        let mut bytes = Vec::with_capacity(64);
        self.encode(&mut bytes);
        self.header.length = bytes.len() as u16;
        bytes[18..20].copy_from_slice(&self.header.length.to_be_bytes());
        let checksum = fletcher16_checksum(&bytes[2..]);
        self.header.ls_checksum = u16::from_be_bytes(checksum);
    }

    pub fn key(&self) -> LsaKey {
        self.header.key()
    }

    pub(crate) fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Lsa, DecodeError> {
        let start = cursor.position() as usize;
        let header = LsaHeader::decode(cursor)?;
        let total = header.length as usize;
        if total < LSA_HEADER_LENGTH || start + total > cursor.get_ref().len() {
            return Err(DecodeError::BadLength);
        }
        let raw = &cursor.get_ref()[start..start + total];
        // Fletcher sum over the LSA with the age field excluded must be
        // zero for an intact LSA
        if fletcher::calc_fletcher16(&raw[2..]) != 0 {
            return Err(DecodeError::BadLsaChecksum);
        }
        let body = LsaBody::decode(header.ls_type, &raw[LSA_HEADER_LENGTH..])?;
        cursor.set_position((start + total) as u64);
        Ok(Lsa { header, body })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        self.body.encode(out);
    }
}

/// Fletcher-16 with the RFC 905 scaling adjustment placing the checksum
/// at offset 16 of the LSA (14 bytes into the checked region)
fn fletcher16_checksum(data: &[u8]) -> [u8; 2] {
    let checksum = fletcher::calc_fletcher16(data);
    let mut checkbyte0 = (checksum & 0x00ff) as i32;
    let mut checkbyte1 = ((checksum >> 8) & 0x00ff) as i32;

    let sop = data.len() as u16 - 15;
    let mut x = (sop as i32 * checkbyte0 - checkbyte1) % 255;
    if x <= 0 {
        x += 255;
    }
    checkbyte1 = 510 - checkbyte0 - x;
    if checkbyte1 > 255 {
        checkbyte1 -= 255;
    }
    checkbyte0 = x;
    [checkbyte0 as u8, checkbyte1 as u8]
}

#[cfg(test)]
mod tests {
    use super::super::{INITIAL_SEQUENCE, MAX_AGE};
    use super::*;

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn router_lsa() -> Lsa {
        Lsa::build(
            ls_type::ROUTER,
            addr("10.0.1.1"),
            addr("10.0.1.1"),
            INITIAL_SEQUENCE,
            LsaBody::Router {
                flags: 0,
                links: vec![
                    RouterLink {
                        link_id: addr("10.0.1.2"),
                        link_data: addr("10.0.0.1"),
                        link_type: link_type::POINT_TO_POINT,
                        metric: 10,
                    },
                    RouterLink {
                        link_id: addr("10.0.1.1"),
                        link_data: addr("255.255.255.255"),
                        link_type: link_type::STUB,
                        metric: 0,
                    },
                ],
            },
        )
    }

    fn decode_one(bytes: &[u8]) -> Result<Lsa, DecodeError> {
        let mut cursor = Cursor::new(bytes);
        Lsa::decode(&mut cursor)
    }

    #[test]
    fn test_lsa_round_trip() {
        let lsa = router_lsa();
        let mut bytes = Vec::new();
        lsa.encode(&mut bytes);
        assert_eq!(bytes.len(), lsa.header.length as usize);
        assert_eq!(decode_one(&bytes).unwrap(), lsa);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let lsa = router_lsa();
        let mut bytes = Vec::new();
        lsa.encode(&mut bytes);
        bytes[25] ^= 0x01;
        assert_eq!(decode_one(&bytes).unwrap_err(), DecodeError::BadLsaChecksum);
    }

    #[test]
    fn test_age_is_excluded_from_checksum() {
        let lsa = router_lsa();
        let mut bytes = Vec::new();
        lsa.encode(&mut bytes);
        // Aging an LSA in place must not invalidate it
        bytes[0..2].copy_from_slice(&100u16.to_be_bytes());
        let aged = decode_one(&bytes).unwrap();
        assert_eq!(aged.header.ls_age, 100);
    }

    #[test]
    fn test_network_and_external_round_trip() {
        let network = Lsa::build(
            ls_type::NETWORK,
            addr("10.0.0.1"),
            addr("10.0.1.1"),
            INITIAL_SEQUENCE,
            LsaBody::Network {
                network_mask: addr("255.255.255.0"),
                attached_routers: vec![addr("10.0.1.1"), addr("10.0.1.2")],
            },
        );
        let external = Lsa::build(
            ls_type::EXTERNAL,
            addr("198.51.100.0"),
            addr("10.0.1.1"),
            INITIAL_SEQUENCE,
            LsaBody::External {
                network_mask: addr("255.255.255.0"),
                type2: true,
                metric: 20,
                forwarding_address: Ipv4Addr::UNSPECIFIED,
                route_tag: 0,
            },
        );
        for lsa in [network, external] {
            let mut bytes = Vec::new();
            lsa.encode(&mut bytes);
            assert_eq!(decode_one(&bytes).unwrap(), lsa);
        }
    }

    #[test]
    fn test_newness_by_sequence_then_checksum() {
        let old = router_lsa();
        let mut new = router_lsa();
        new.header.ls_sequence += 1;
        new.finalize();
        assert_eq!(
            new.header.compare_newness(&old.header),
            Ordering::Greater
        );
        assert_eq!(old.header.compare_newness(&new.header), Ordering::Less);
    }

    #[test]
    fn test_newness_equal_instances() {
        let a = router_lsa();
        let mut b = router_lsa();
        // Small age difference does not affect newness
        b.header.ls_age = a.header.ls_age + 10;
        assert_eq!(a.header.compare_newness(&b.header), Ordering::Equal);
    }

    #[test]
    fn test_max_age_instance_is_newer() {
        let a = router_lsa();
        let mut at_max = router_lsa();
        at_max.header.ls_age = MAX_AGE;
        assert_eq!(
            at_max.header.compare_newness(&a.header),
            Ordering::Greater
        );
    }

    #[test]
    fn test_large_age_difference_prefers_younger() {
        let mut young = router_lsa();
        young.header.ls_age = 10;
        let mut old = router_lsa();
        old.header.ls_age = 10 + super::super::MAX_AGE_DIFF + 1;
        assert_eq!(
            young.header.compare_newness(&old.header),
            Ordering::Greater
        );
    }

    #[test]
    fn test_lsdb_key_from_header() {
        let lsa = router_lsa();
        let key = lsa.key();
        assert_eq!(key.ls_type, ls_type::ROUTER);
        assert_eq!(key.link_state_id, addr("10.0.1.1"));
    }
}
