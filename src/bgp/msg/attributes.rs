//! Path attribute wire formats (RFC 4271 section 4.3, RFC 4760, RFC 4456).
//!
//! Decode validates the attribute flag categories and value lengths; errors
//! carry the RFC 7606 disposition so the caller can distinguish
//! session-reset errors from treat-as-withdraw errors.

use std::convert::TryFrom;
use std::fmt;
use std::io::{Cursor, Read};
use std::net::{IpAddr, Ipv4Addr};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use ipnetwork::IpNetwork;

use super::{
    decode_prefix, encode_prefix, update_subcode, Afi, MessageError, Safi,
};
use crate::utils::{bytes_to_ipv6, u32_to_dotted};

const FLAG_OPTIONAL: u8 = 0x80;
const FLAG_TRANSITIVE: u8 = 0x40;
const FLAG_PARTIAL: u8 = 0x20;
const FLAG_EXTENDED_LENGTH: u8 = 0x10;

pub mod identifier {
    pub const ORIGIN: u8 = 1;
    pub const AS_PATH: u8 = 2;
    pub const NEXT_HOP: u8 = 3;
    pub const MULTI_EXIT_DISC: u8 = 4;
    pub const LOCAL_PREF: u8 = 5;
    pub const ATOMIC_AGGREGATE: u8 = 6;
    pub const AGGREGATOR: u8 = 7;
    pub const COMMUNITIES: u8 = 8;
    pub const ORIGINATOR_ID: u8 = 9;
    pub const CLUSTER_LIST: u8 = 10;
    pub const MP_REACH_NLRI: u8 = 14;
    pub const MP_UNREACH_NLRI: u8 = 15;
}

/// How a malformed attribute is handled (RFC 7606)
#[derive(Debug)]
pub(crate) enum AttrError {
    /// Tear the session with the contained NOTIFICATION error
    Session(MessageError),
    /// Strip the attribute and treat the enclosed NLRI as withdrawn
    TreatAsWithdraw(MessageError),
}

impl From<MessageError> for AttrError {
    fn from(err: MessageError) -> Self {
        AttrError::Session(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Origin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Origin::Igp => write!(f, "IGP"),
            Origin::Egp => write!(f, "EGP"),
            Origin::Incomplete => write!(f, "Incomplete"),
        }
    }
}

impl TryFrom<u8> for Origin {
    type Error = MessageError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Origin::Igp),
            1 => Ok(Origin::Egp),
            2 => Ok(Origin::Incomplete),
            _ => Err(MessageError::update(
                update_subcode::INVALID_ORIGIN_ATTRIBUTE,
                vec![v],
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    AsSequence(Vec<u32>),
    AsSet(Vec<u32>),
}

impl Segment {
    /// AS_SET counts as one hop regardless of its size (RFC 4271 9.1.2.2a)
    pub fn path_length(&self) -> usize {
        match self {
            Segment::AsSequence(seq) => seq.len(),
            Segment::AsSet(_) => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsPath {
    pub segments: Vec<Segment>,
}

impl AsPath {
    pub fn from_sequence(asns: Vec<u32>) -> Self {
        Self {
            segments: vec![Segment::AsSequence(asns)],
        }
    }

    pub fn path_length(&self) -> usize {
        self.segments.iter().map(Segment::path_length).sum()
    }

    /// Leftmost AS: the neighboring AS the route was learned from
    pub fn first_asn(&self) -> Option<u32> {
        self.segments.first().and_then(|segment| match segment {
            Segment::AsSequence(seq) => seq.first().copied(),
            Segment::AsSet(set) => set.first().copied(),
        })
    }

    /// Rightmost AS: the originator of the route
    pub fn origin_asn(&self) -> Option<u32> {
        self.segments.last().and_then(|segment| match segment {
            Segment::AsSequence(seq) => seq.last().copied(),
            Segment::AsSet(set) => set.last().copied(),
        })
    }

    pub fn contains(&self, asn: u32) -> bool {
        self.segments.iter().any(|segment| match segment {
            Segment::AsSequence(seq) => seq.contains(&asn),
            Segment::AsSet(set) => set.contains(&asn),
        })
    }

    /// Prepend `asn` to the leading AS_SEQUENCE, creating one if needed
    pub fn prepend(&mut self, asn: u32) {
        match self.segments.first_mut() {
            Some(Segment::AsSequence(seq)) => seq.insert(0, asn),
            _ => self.segments.insert(0, Segment::AsSequence(vec![asn])),
        }
    }
}

impl fmt::Display for AsPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::AsSequence(seq) => {
                    parts.extend(seq.iter().map(|asn| u32_to_dotted(*asn, '.')))
                }
                Segment::AsSet(set) => parts.push(format!(
                    "{{{}}}",
                    set.iter()
                        .map(|asn| u32_to_dotted(*asn, '.'))
                        .collect::<Vec<_>>()
                        .join(",")
                )),
            }
        }
        write!(f, "{}", parts.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MpReachNlri {
    pub afi: Afi,
    pub safi: Safi,
    pub next_hop: IpAddr,
    pub announced: Vec<IpNetwork>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MpUnreachNlri {
    pub afi: Afi,
    pub safi: Safi,
    pub withdrawn: Vec<IpNetwork>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathAttribute {
    Origin(Origin),
    AsPath(AsPath),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator { asn: u32, speaker: Ipv4Addr },
    Communities(Vec<u32>),
    OriginatorId(Ipv4Addr),
    ClusterList(Vec<Ipv4Addr>),
    MpReachNlri(MpReachNlri),
    MpUnreachNlri(MpUnreachNlri),
    /// Unrecognized optional transitive attribute, carried unmodified
    Unknown { code: u8, flags: u8, value: Vec<u8> },
}

impl PathAttribute {
    pub fn type_code(&self) -> u8 {
        use identifier::*;
        match self {
            PathAttribute::Origin(_) => ORIGIN,
            PathAttribute::AsPath(_) => AS_PATH,
            PathAttribute::NextHop(_) => NEXT_HOP,
            PathAttribute::MultiExitDisc(_) => MULTI_EXIT_DISC,
            PathAttribute::LocalPref(_) => LOCAL_PREF,
            PathAttribute::AtomicAggregate => ATOMIC_AGGREGATE,
            PathAttribute::Aggregator { .. } => AGGREGATOR,
            PathAttribute::Communities(_) => COMMUNITIES,
            PathAttribute::OriginatorId(_) => ORIGINATOR_ID,
            PathAttribute::ClusterList(_) => CLUSTER_LIST,
            PathAttribute::MpReachNlri(_) => MP_REACH_NLRI,
            PathAttribute::MpUnreachNlri(_) => MP_UNREACH_NLRI,
            PathAttribute::Unknown { code, .. } => *code,
        }
    }

    /// The high two flag bits this attribute category must carry
    fn category_flags(code: u8) -> Option<u8> {
        use identifier::*;
        match code {
            ORIGIN | AS_PATH | NEXT_HOP | LOCAL_PREF | ATOMIC_AGGREGATE => Some(FLAG_TRANSITIVE),
            MULTI_EXIT_DISC | ORIGINATOR_ID | CLUSTER_LIST | MP_REACH_NLRI | MP_UNREACH_NLRI => {
                Some(FLAG_OPTIONAL)
            }
            AGGREGATOR | COMMUNITIES => Some(FLAG_OPTIONAL | FLAG_TRANSITIVE),
            _ => None,
        }
    }

    /// Decode a single attribute (flags, type, length, value).
    ///
    /// Returns `Ok(None)` for an attribute that was consumed but dropped
    /// (unrecognized optional non-transitive).
    pub(crate) fn decode(
        cursor: &mut Cursor<&[u8]>,
        four_byte_asn: bool,
    ) -> Result<Option<PathAttribute>, AttrError> {
        let flags = cursor.read_u8().map_err(malformed_list)?;
        let code = cursor.read_u8().map_err(malformed_list)?;
        let length = if flags & FLAG_EXTENDED_LENGTH != 0 {
            cursor.read_u16::<NetworkEndian>().map_err(malformed_list)? as usize
        } else {
            cursor.read_u8().map_err(malformed_list)? as usize
        };
        let mut value = vec![0u8; length];
        cursor.read_exact(&mut value).map_err(|_| {
            AttrError::Session(MessageError::update(
                update_subcode::ATTRIBUTE_LENGTH_ERROR,
                vec![flags, code],
            ))
        })?;

        match Self::category_flags(code) {
            Some(expected) => {
                if flags & (FLAG_OPTIONAL | FLAG_TRANSITIVE) != expected {
                    return Err(AttrError::Session(MessageError::update(
                        update_subcode::ATTRIBUTE_FLAGS_ERROR,
                        header_of(flags, code, &value),
                    )));
                }
            }
            None => {
                if flags & FLAG_OPTIONAL == 0 {
                    return Err(AttrError::Session(MessageError::update(
                        update_subcode::UNRECOGNIZED_WELL_KNOWN_ATTRIBUTE,
                        header_of(flags, code, &value),
                    )));
                }
                // Unrecognized optional: carried through with the partial
                // bit set if transitive, dropped otherwise
                if flags & FLAG_TRANSITIVE != 0 {
                    return Ok(Some(PathAttribute::Unknown {
                        code,
                        flags: flags | FLAG_PARTIAL,
                        value,
                    }));
                }
                return Ok(None);
            }
        }

        Self::decode_value(code, flags, &value, four_byte_asn).map(Some)
    }

    fn decode_value(
        code: u8,
        flags: u8,
        value: &[u8],
        four_byte_asn: bool,
    ) -> Result<PathAttribute, AttrError> {
        use identifier::*;
        let mut cursor = Cursor::new(value);
        let attr = match code {
            ORIGIN => {
                if value.len() != 1 {
                    return Err(withdraw_len(flags, code, value));
                }
                PathAttribute::Origin(
                    Origin::try_from(value[0]).map_err(AttrError::TreatAsWithdraw)?,
                )
            }
            AS_PATH => {
                let mut segments = Vec::new();
                while (cursor.position() as usize) < value.len() {
                    let segment_type = cursor.read_u8().map_err(malformed_as_path)?;
                    let count = cursor.read_u8().map_err(malformed_as_path)? as usize;
                    let mut asns = Vec::with_capacity(count);
                    for _ in 0..count {
                        let asn = if four_byte_asn {
                            cursor.read_u32::<NetworkEndian>().map_err(malformed_as_path)?
                        } else {
                            u32::from(
                                cursor.read_u16::<NetworkEndian>().map_err(malformed_as_path)?,
                            )
                        };
                        asns.push(asn);
                    }
                    match segment_type {
                        1 => segments.push(Segment::AsSet(asns)),
                        2 => segments.push(Segment::AsSequence(asns)),
                        _ => {
                            return Err(AttrError::Session(MessageError::update(
                                update_subcode::MALFORMED_AS_PATH,
                                vec![segment_type],
                            )))
                        }
                    }
                }
                PathAttribute::AsPath(AsPath { segments })
            }
            NEXT_HOP => {
                if value.len() != 4 {
                    return Err(withdraw_len(flags, code, value));
                }
                let addr = Ipv4Addr::new(value[0], value[1], value[2], value[3]);
                if addr.is_unspecified() || addr.is_multicast() {
                    return Err(AttrError::TreatAsWithdraw(MessageError::update(
                        update_subcode::INVALID_NEXT_HOP_ATTRIBUTE,
                        value.to_vec(),
                    )));
                }
                PathAttribute::NextHop(addr)
            }
            MULTI_EXIT_DISC => {
                if value.len() != 4 {
                    return Err(withdraw_len(flags, code, value));
                }
                PathAttribute::MultiExitDisc(cursor.read_u32::<NetworkEndian>().unwrap())
            }
            LOCAL_PREF => {
                if value.len() != 4 {
                    return Err(withdraw_len(flags, code, value));
                }
                PathAttribute::LocalPref(cursor.read_u32::<NetworkEndian>().unwrap())
            }
            ATOMIC_AGGREGATE => {
                if !value.is_empty() {
                    return Err(withdraw_len(flags, code, value));
                }
                PathAttribute::AtomicAggregate
            }
            AGGREGATOR => {
                let expected = if four_byte_asn { 8 } else { 6 };
                if value.len() != expected {
                    return Err(withdraw_len(flags, code, value));
                }
                let asn = if four_byte_asn {
                    cursor.read_u32::<NetworkEndian>().unwrap()
                } else {
                    u32::from(cursor.read_u16::<NetworkEndian>().unwrap())
                };
                let speaker = Ipv4Addr::from(cursor.read_u32::<NetworkEndian>().unwrap());
                PathAttribute::Aggregator { asn, speaker }
            }
            COMMUNITIES => {
                if value.len() % 4 != 0 {
                    return Err(withdraw_len(flags, code, value));
                }
                let communities = (0..value.len() / 4)
                    .map(|_| cursor.read_u32::<NetworkEndian>().unwrap())
                    .collect();
                PathAttribute::Communities(communities)
            }
            ORIGINATOR_ID => {
                if value.len() != 4 {
                    return Err(withdraw_len(flags, code, value));
                }
                PathAttribute::OriginatorId(Ipv4Addr::from(
                    cursor.read_u32::<NetworkEndian>().unwrap(),
                ))
            }
            CLUSTER_LIST => {
                if value.len() % 4 != 0 {
                    return Err(withdraw_len(flags, code, value));
                }
                let ids = (0..value.len() / 4)
                    .map(|_| Ipv4Addr::from(cursor.read_u32::<NetworkEndian>().unwrap()))
                    .collect();
                PathAttribute::ClusterList(ids)
            }
            MP_REACH_NLRI => {
                let afi = Afi::try_from(
                    cursor.read_u16::<NetworkEndian>().map_err(withdraw_io(flags, code))?,
                )
                .map_err(AttrError::TreatAsWithdraw)?;
                let safi = Safi::try_from(cursor.read_u8().map_err(withdraw_io(flags, code))?)
                    .map_err(AttrError::TreatAsWithdraw)?;
                let next_hop_len = cursor.read_u8().map_err(withdraw_io(flags, code))? as usize;
                let mut next_hop_bytes = vec![0u8; next_hop_len];
                cursor
                    .read_exact(&mut next_hop_bytes)
                    .map_err(withdraw_io(flags, code))?;
                let next_hop = match next_hop_len {
                    4 => IpAddr::from(<[u8; 4]>::try_from(&next_hop_bytes[..4]).unwrap()),
                    // 16 = global; 32 = global + link-local, global first
                    16 | 32 => bytes_to_ipv6(&next_hop_bytes),
                    _ => {
                        return Err(AttrError::TreatAsWithdraw(MessageError::update(
                            update_subcode::INVALID_NEXT_HOP_ATTRIBUTE,
                            next_hop_bytes,
                        )))
                    }
                };
                let _reserved = cursor.read_u8().map_err(withdraw_io(flags, code))?;
                let mut announced = Vec::new();
                while (cursor.position() as usize) < value.len() {
                    announced.push(
                        decode_prefix(&mut cursor, afi).map_err(AttrError::TreatAsWithdraw)?,
                    );
                }
                PathAttribute::MpReachNlri(MpReachNlri {
                    afi,
                    safi,
                    next_hop,
                    announced,
                })
            }
            MP_UNREACH_NLRI => {
                let afi = Afi::try_from(
                    cursor.read_u16::<NetworkEndian>().map_err(withdraw_io(flags, code))?,
                )
                .map_err(AttrError::TreatAsWithdraw)?;
                let safi = Safi::try_from(cursor.read_u8().map_err(withdraw_io(flags, code))?)
                    .map_err(AttrError::TreatAsWithdraw)?;
                let mut withdrawn = Vec::new();
                while (cursor.position() as usize) < value.len() {
                    withdrawn.push(
                        decode_prefix(&mut cursor, afi).map_err(AttrError::TreatAsWithdraw)?,
                    );
                }
                PathAttribute::MpUnreachNlri(MpUnreachNlri {
                    afi,
                    safi,
                    withdrawn,
                })
            }
            _ => unreachable!("validated by category_flags"),
        };
        Ok(attr)
    }

    pub(crate) fn encode(
        &self,
        out: &mut Vec<u8>,
        four_byte_asn: bool,
    ) -> Result<(), MessageError> {
        let mut value: Vec<u8> = Vec::with_capacity(8);
        let mut flags = Self::category_flags(self.type_code()).unwrap_or(FLAG_OPTIONAL);
        match self {
            PathAttribute::Origin(origin) => value.write_u8(*origin as u8)?,
            PathAttribute::AsPath(as_path) => {
                for segment in &as_path.segments {
                    let (segment_type, asns) = match segment {
                        Segment::AsSet(asns) => (1u8, asns),
                        Segment::AsSequence(asns) => (2u8, asns),
                    };
                    value.write_u8(segment_type)?;
                    value.write_u8(asns.len() as u8)?;
                    for asn in asns {
                        if four_byte_asn {
                            value.write_u32::<NetworkEndian>(*asn)?;
                        } else {
                            value.write_u16::<NetworkEndian>(*asn as u16)?;
                        }
                    }
                }
            }
            PathAttribute::NextHop(addr) => value.extend_from_slice(&addr.octets()),
            PathAttribute::MultiExitDisc(med) => value.write_u32::<NetworkEndian>(*med)?,
            PathAttribute::LocalPref(pref) => value.write_u32::<NetworkEndian>(*pref)?,
            PathAttribute::AtomicAggregate => (),
            PathAttribute::Aggregator { asn, speaker } => {
                if four_byte_asn {
                    value.write_u32::<NetworkEndian>(*asn)?;
                } else {
                    value.write_u16::<NetworkEndian>(*asn as u16)?;
                }
                value.extend_from_slice(&speaker.octets());
            }
            PathAttribute::Communities(communities) => {
                for community in communities {
                    value.write_u32::<NetworkEndian>(*community)?;
                }
            }
            PathAttribute::OriginatorId(id) => value.extend_from_slice(&id.octets()),
            PathAttribute::ClusterList(ids) => {
                for id in ids {
                    value.extend_from_slice(&id.octets());
                }
            }
            PathAttribute::MpReachNlri(mp) => {
                value.write_u16::<NetworkEndian>(mp.afi as u16)?;
                value.write_u8(mp.safi as u8)?;
                match mp.next_hop {
                    IpAddr::V4(addr) => {
                        value.write_u8(4)?;
                        value.extend_from_slice(&addr.octets());
                    }
                    IpAddr::V6(addr) => {
                        value.write_u8(16)?;
                        value.extend_from_slice(&addr.octets());
                    }
                }
                value.write_u8(0)?; // reserved
                for prefix in &mp.announced {
                    encode_prefix(&mut value, prefix)?;
                }
            }
            PathAttribute::MpUnreachNlri(mp) => {
                value.write_u16::<NetworkEndian>(mp.afi as u16)?;
                value.write_u8(mp.safi as u8)?;
                for prefix in &mp.withdrawn {
                    encode_prefix(&mut value, prefix)?;
                }
            }
            PathAttribute::Unknown {
                flags: unknown_flags,
                value: unknown_value,
                ..
            } => {
                flags = *unknown_flags & !FLAG_EXTENDED_LENGTH;
                value.extend_from_slice(unknown_value);
            }
        }
        if value.len() > 255 {
            flags |= FLAG_EXTENDED_LENGTH;
        }
        out.write_u8(flags)?;
        out.write_u8(self.type_code())?;
        if flags & FLAG_EXTENDED_LENGTH != 0 {
            out.write_u16::<NetworkEndian>(value.len() as u16)?;
        } else {
            out.write_u8(value.len() as u8)?;
        }
        out.extend_from_slice(&value);
        Ok(())
    }
}

fn header_of(flags: u8, code: u8, value: &[u8]) -> Vec<u8> {
    let mut data = vec![flags, code];
    data.extend_from_slice(value);
    data
}

fn malformed_list(_: std::io::Error) -> AttrError {
    AttrError::Session(MessageError::update(
        update_subcode::MALFORMED_ATTRIBUTE_LIST,
        vec![],
    ))
}

fn malformed_as_path(_: std::io::Error) -> AttrError {
    AttrError::Session(MessageError::update(
        update_subcode::MALFORMED_AS_PATH,
        vec![],
    ))
}

fn withdraw_len(flags: u8, code: u8, value: &[u8]) -> AttrError {
    AttrError::TreatAsWithdraw(MessageError::update(
        update_subcode::ATTRIBUTE_LENGTH_ERROR,
        header_of(flags, code, value),
    ))
}

fn withdraw_io(flags: u8, code: u8) -> impl Fn(std::io::Error) -> AttrError {
    move |_| {
        AttrError::TreatAsWithdraw(MessageError::update(
            update_subcode::ATTRIBUTE_LENGTH_ERROR,
            vec![flags, code],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(attr: PathAttribute) {
        let mut bytes = Vec::new();
        attr.encode(&mut bytes, true).unwrap();
        let mut cursor = Cursor::new(&bytes[..]);
        let decoded = PathAttribute::decode(&mut cursor, true).unwrap().unwrap();
        assert_eq!(decoded, attr);
        assert_eq!(cursor.position() as usize, bytes.len());
    }

    #[test]
    fn test_attribute_round_trips() {
        round_trip(PathAttribute::Origin(Origin::Igp));
        round_trip(PathAttribute::AsPath(AsPath {
            segments: vec![
                Segment::AsSequence(vec![65010, 65020]),
                Segment::AsSet(vec![65030, 65040]),
            ],
        }));
        round_trip(PathAttribute::NextHop(Ipv4Addr::new(192, 0, 2, 2)));
        round_trip(PathAttribute::MultiExitDisc(50));
        round_trip(PathAttribute::LocalPref(200));
        round_trip(PathAttribute::AtomicAggregate);
        round_trip(PathAttribute::Aggregator {
            asn: 65001,
            speaker: Ipv4Addr::new(10, 0, 1, 1),
        });
        round_trip(PathAttribute::Communities(vec![65000 << 16 | 100]));
        round_trip(PathAttribute::OriginatorId(Ipv4Addr::new(10, 0, 1, 2)));
        round_trip(PathAttribute::ClusterList(vec![
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        ]));
        round_trip(PathAttribute::MpReachNlri(MpReachNlri {
            afi: Afi::Ipv6,
            safi: Safi::Unicast,
            next_hop: "2001:db8::1".parse().unwrap(),
            announced: vec!["2001:db8:100::/48".parse().unwrap()],
        }));
        round_trip(PathAttribute::MpUnreachNlri(MpUnreachNlri {
            afi: Afi::Ipv6,
            safi: Safi::Unicast,
            withdrawn: vec!["2001:db8:100::/48".parse().unwrap()],
        }));
    }

    #[test]
    fn test_extended_length_encoding() {
        // 64 cluster ids = 256 value bytes, forcing the 2-byte length form
        let ids: Vec<Ipv4Addr> = (0..64u32).map(Ipv4Addr::from).collect();
        let attr = PathAttribute::ClusterList(ids);
        let mut bytes = Vec::new();
        attr.encode(&mut bytes, true).unwrap();
        assert!(bytes[0] & FLAG_EXTENDED_LENGTH != 0);
        let mut cursor = Cursor::new(&bytes[..]);
        assert_eq!(
            PathAttribute::decode(&mut cursor, true).unwrap().unwrap(),
            attr
        );
    }

    #[test]
    fn test_flag_category_mismatch_is_session_error() {
        // ORIGIN with the optional bit set
        let bytes = vec![FLAG_OPTIONAL | FLAG_TRANSITIVE, identifier::ORIGIN, 1, 0];
        let mut cursor = Cursor::new(&bytes[..]);
        match PathAttribute::decode(&mut cursor, true) {
            Err(AttrError::Session(err)) => {
                assert_eq!(err.subcode, update_subcode::ATTRIBUTE_FLAGS_ERROR)
            }
            other => panic!("expected flags error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_origin_is_treat_as_withdraw() {
        let bytes = vec![FLAG_TRANSITIVE, identifier::ORIGIN, 1, 9];
        let mut cursor = Cursor::new(&bytes[..]);
        match PathAttribute::decode(&mut cursor, true) {
            Err(AttrError::TreatAsWithdraw(err)) => {
                assert_eq!(err.subcode, update_subcode::INVALID_ORIGIN_ATTRIBUTE)
            }
            other => panic!("expected treat-as-withdraw, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_med_length_is_treat_as_withdraw() {
        let bytes = vec![FLAG_OPTIONAL, identifier::MULTI_EXIT_DISC, 2, 0, 1];
        let mut cursor = Cursor::new(&bytes[..]);
        match PathAttribute::decode(&mut cursor, true) {
            Err(AttrError::TreatAsWithdraw(err)) => {
                assert_eq!(err.subcode, update_subcode::ATTRIBUTE_LENGTH_ERROR)
            }
            other => panic!("expected treat-as-withdraw, got {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_well_known_is_session_error() {
        let bytes = vec![FLAG_TRANSITIVE, 99, 1, 0];
        let mut cursor = Cursor::new(&bytes[..]);
        match PathAttribute::decode(&mut cursor, true) {
            Err(AttrError::Session(err)) => assert_eq!(
                err.subcode,
                update_subcode::UNRECOGNIZED_WELL_KNOWN_ATTRIBUTE
            ),
            other => panic!("expected session error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_optional_transitive_passes_through() {
        let bytes = vec![FLAG_OPTIONAL | FLAG_TRANSITIVE, 200, 2, 0xde, 0xad];
        let mut cursor = Cursor::new(&bytes[..]);
        let attr = PathAttribute::decode(&mut cursor, true).unwrap().unwrap();
        match attr {
            PathAttribute::Unknown { code, flags, value } => {
                assert_eq!(code, 200);
                assert!(flags & FLAG_PARTIAL != 0);
                assert_eq!(value, vec![0xde, 0xad]);
            }
            other => panic!("expected unknown attribute, got {:?}", other),
        }
    }

    #[test]
    fn test_as_path_two_byte_encoding() {
        let attr = PathAttribute::AsPath(AsPath::from_sequence(vec![65010, 65020]));
        let mut bytes = Vec::new();
        attr.encode(&mut bytes, false).unwrap();
        // flags, type, len, segment type, count, 2 x u16
        assert_eq!(bytes.len(), 3 + 2 + 4);
        let mut cursor = Cursor::new(&bytes[..]);
        assert_eq!(
            PathAttribute::decode(&mut cursor, false).unwrap().unwrap(),
            attr
        );
    }

    #[test]
    fn test_as_path_helpers() {
        let mut path = AsPath::from_sequence(vec![65020, 65030]);
        assert_eq!(path.path_length(), 2);
        assert_eq!(path.first_asn(), Some(65020));
        path.prepend(65010);
        assert_eq!(path.first_asn(), Some(65010));
        assert!(path.contains(65030));
        let with_set = AsPath {
            segments: vec![
                Segment::AsSequence(vec![65010]),
                Segment::AsSet(vec![1, 2, 3]),
            ],
        };
        assert_eq!(with_set.path_length(), 2);
    }
}
