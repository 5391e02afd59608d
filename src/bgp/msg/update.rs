//! UPDATE message wire format (RFC 4271 section 4.3) with RFC 7606
//! revised error handling.

use std::io::Cursor;

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use ipnetwork::IpNetwork;

use super::attributes::{identifier, AttrError, PathAttribute};
use super::{decode_prefix, encode_prefix, update_subcode, Afi, MessageError, Safi};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Update {
    pub withdrawn_routes: Vec<IpNetwork>,
    pub attributes: Vec<PathAttribute>,
    pub announced_routes: Vec<IpNetwork>,
    /// Set when a malformed attribute forced RFC 7606 treat-as-withdraw:
    /// the NLRI in this message must be withdrawn, not installed.
    pub treat_as_withdraw: bool,
}

impl Update {
    pub(crate) fn decode(buf: &[u8], four_byte_asn: bool) -> Result<Update, MessageError> {
        let mut cursor = Cursor::new(buf);

        let withdrawn_len = cursor.read_u16::<NetworkEndian>()? as usize;
        let withdrawn_end = cursor.position() as usize + withdrawn_len;
        if withdrawn_end > buf.len() {
            return Err(MessageError::update(
                update_subcode::MALFORMED_ATTRIBUTE_LIST,
                vec![],
            ));
        }
        let mut withdrawn_routes = Vec::new();
        while (cursor.position() as usize) < withdrawn_end {
            withdrawn_routes.push(decode_prefix(&mut cursor, Afi::Ipv4)?);
        }

        let attrs_len = cursor.read_u16::<NetworkEndian>()? as usize;
        let attrs_end = cursor.position() as usize + attrs_len;
        if attrs_end > buf.len() {
            return Err(MessageError::update(
                update_subcode::MALFORMED_ATTRIBUTE_LIST,
                vec![],
            ));
        }
        let mut attributes: Vec<PathAttribute> = Vec::new();
        let mut treat_as_withdraw = false;
        {
            let attr_buf = &buf[cursor.position() as usize..attrs_end];
            let mut attr_cursor = Cursor::new(attr_buf);
            while (attr_cursor.position() as usize) < attr_buf.len() {
                match PathAttribute::decode(&mut attr_cursor, four_byte_asn) {
                    Ok(Some(attr)) => {
                        let code = attr.type_code();
                        if attributes.iter().any(|a| a.type_code() == code) {
                            return Err(MessageError::update(
                                update_subcode::MALFORMED_ATTRIBUTE_LIST,
                                vec![code],
                            ));
                        }
                        attributes.push(attr);
                    }
                    // Unrecognized optional non-transitive: dropped
                    Ok(None) => (),
                    Err(AttrError::TreatAsWithdraw(_)) => treat_as_withdraw = true,
                    Err(AttrError::Session(err)) => return Err(err),
                }
            }
        }
        cursor.set_position(attrs_end as u64);

        let mut announced_routes = Vec::new();
        while (cursor.position() as usize) < buf.len() {
            announced_routes.push(decode_prefix(&mut cursor, Afi::Ipv4)?);
        }

        let update = Update {
            withdrawn_routes,
            attributes,
            announced_routes,
            treat_as_withdraw,
        };
        if !treat_as_withdraw {
            update.validate_mandatory()?;
        }
        Ok(update)
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>, four_byte_asn: bool) -> Result<(), MessageError> {
        let mut withdrawn: Vec<u8> = Vec::new();
        for prefix in &self.withdrawn_routes {
            encode_prefix(&mut withdrawn, prefix)?;
        }
        out.write_u16::<NetworkEndian>(withdrawn.len() as u16)?;
        out.extend_from_slice(&withdrawn);

        // Attributes are emitted in type-code order so that a decode/encode
        // cycle is byte-identical for any valid input
        let mut ordered: Vec<&PathAttribute> = self.attributes.iter().collect();
        ordered.sort_by_key(|attr| attr.type_code());
        let mut attrs: Vec<u8> = Vec::new();
        for attribute in ordered {
            attribute.encode(&mut attrs, four_byte_asn)?;
        }
        out.write_u16::<NetworkEndian>(attrs.len() as u16)?;
        out.extend_from_slice(&attrs);

        for prefix in &self.announced_routes {
            encode_prefix(out, prefix)?;
        }
        Ok(())
    }

    pub fn get(&self, code: u8) -> Option<&PathAttribute> {
        self.attributes.iter().find(|attr| attr.type_code() == code)
    }

    fn mp_reach(&self) -> Option<&PathAttribute> {
        self.get(identifier::MP_REACH_NLRI)
    }

    /// Well-known mandatory attributes must accompany any reachable NLRI
    fn validate_mandatory(&self) -> Result<(), MessageError> {
        let has_nlri = !self.announced_routes.is_empty() || self.mp_reach().is_some();
        if !has_nlri {
            return Ok(());
        }
        for code in [identifier::ORIGIN, identifier::AS_PATH] {
            if self.get(code).is_none() {
                return Err(MessageError::update(
                    update_subcode::MISSING_WELL_KNOWN_ATTRIBUTE,
                    vec![code],
                ));
            }
        }
        if !self.announced_routes.is_empty() && self.get(identifier::NEXT_HOP).is_none() {
            return Err(MessageError::update(
                update_subcode::MISSING_WELL_KNOWN_ATTRIBUTE,
                vec![identifier::NEXT_HOP],
            ));
        }
        Ok(())
    }

    /// End-of-RIB marker (RFC 4724 section 2): an empty IPv4 UPDATE, or an
    /// MP_UNREACH_NLRI with no withdrawn routes and nothing else.
    pub fn end_of_rib(&self) -> Option<(Afi, Safi)> {
        if !self.withdrawn_routes.is_empty() || !self.announced_routes.is_empty() {
            return None;
        }
        match self.attributes.as_slice() {
            [] => Some((Afi::Ipv4, Safi::Unicast)),
            [PathAttribute::MpUnreachNlri(mp)] if mp.withdrawn.is_empty() => {
                Some((mp.afi, mp.safi))
            }
            _ => None,
        }
    }
}
