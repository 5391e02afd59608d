//! BGP-4 message encoding and decoding (RFC 4271, RFC 2918, RFC 4760,
//! RFC 5492, RFC 6793).
//!
//! Every decode validates the invariants the wire format promises and fails
//! with a typed [`MessageError`] that maps 1:1 onto a NOTIFICATION
//! error-code/subcode pair. The codec neither logs nor retries.

mod attributes;
mod capabilities;
mod update;

pub use attributes::{identifier, AsPath, MpReachNlri, MpUnreachNlri, Origin, PathAttribute, Segment};
pub use capabilities::{Capabilities, Capability, GracefulRestartCap};
pub use update::Update;

use std::convert::TryFrom;
use std::fmt;
use std::io::{self, Cursor, Read};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use ipnetwork::IpNetwork;

/// BGP message header: 16-byte marker, 2-byte length, 1-byte type
pub const HEADER_LENGTH: usize = 19;
pub const MAX_MESSAGE_LENGTH: usize = 4096;

/// Address Family Identifier (RFC 4760)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Afi {
    Ipv4 = 1,
    Ipv6 = 2,
}

impl TryFrom<u16> for Afi {
    type Error = MessageError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Afi::Ipv4),
            2 => Ok(Afi::Ipv6),
            _ => Err(MessageError::update(
                update_subcode::OPTIONAL_ATTRIBUTE_ERROR,
                vec![],
            )),
        }
    }
}

impl fmt::Display for Afi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Afi::Ipv4 => write!(f, "IPv4"),
            Afi::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// Subsequent Address Family Identifier (RFC 4760)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Safi {
    Unicast = 1,
}

impl TryFrom<u8> for Safi {
    type Error = MessageError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Safi::Unicast),
            _ => Err(MessageError::update(
                update_subcode::OPTIONAL_ATTRIBUTE_ERROR,
                vec![],
            )),
        }
    }
}

impl fmt::Display for Safi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Safi::Unicast => write!(f, "Unicast"),
        }
    }
}

/// NOTIFICATION error codes (RFC 4271 section 4.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MessageHeader = 1,
    OpenMessage = 2,
    UpdateMessage = 3,
    HoldTimerExpired = 4,
    FiniteStateMachine = 5,
    Cease = 6,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorCode::MessageHeader => "Message Header Error",
            ErrorCode::OpenMessage => "OPEN Message Error",
            ErrorCode::UpdateMessage => "UPDATE Message Error",
            ErrorCode::HoldTimerExpired => "Hold Timer Expired",
            ErrorCode::FiniteStateMachine => "Finite State Machine Error",
            ErrorCode::Cease => "Cease",
        };
        write!(f, "{}", name)
    }
}

pub mod header_subcode {
    pub const CONNECTION_NOT_SYNCHRONIZED: u8 = 1;
    pub const BAD_MESSAGE_LENGTH: u8 = 2;
    pub const BAD_MESSAGE_TYPE: u8 = 3;
}

pub mod open_subcode {
    pub const UNSUPPORTED_VERSION_NUMBER: u8 = 1;
    pub const BAD_PEER_AS: u8 = 2;
    pub const BAD_BGP_IDENTIFIER: u8 = 3;
    pub const UNSUPPORTED_OPTIONAL_PARAMETER: u8 = 4;
    pub const UNACCEPTABLE_HOLD_TIME: u8 = 6;
}

pub mod update_subcode {
    pub const MALFORMED_ATTRIBUTE_LIST: u8 = 1;
    pub const UNRECOGNIZED_WELL_KNOWN_ATTRIBUTE: u8 = 2;
    pub const MISSING_WELL_KNOWN_ATTRIBUTE: u8 = 3;
    pub const ATTRIBUTE_FLAGS_ERROR: u8 = 4;
    pub const ATTRIBUTE_LENGTH_ERROR: u8 = 5;
    pub const INVALID_ORIGIN_ATTRIBUTE: u8 = 6;
    pub const INVALID_NEXT_HOP_ATTRIBUTE: u8 = 8;
    pub const OPTIONAL_ATTRIBUTE_ERROR: u8 = 9;
    pub const INVALID_NETWORK_FIELD: u8 = 10;
    pub const MALFORMED_AS_PATH: u8 = 11;
}

pub mod cease_subcode {
    pub const MAX_PREFIXES_REACHED: u8 = 1;
    pub const ADMINISTRATIVE_SHUTDOWN: u8 = 2;
    pub const PEER_DECONFIGURED: u8 = 3;
    pub const ADMINISTRATIVE_RESET: u8 = 4;
    pub const CONNECTION_REJECTED: u8 = 5;
    pub const CONNECTION_COLLISION_RESOLUTION: u8 = 7;
}

/// A typed wire-format error, carrying the NOTIFICATION (code, subcode, data)
/// triple that reports it to the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageError {
    pub code: ErrorCode,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl MessageError {
    pub fn header(subcode: u8, data: Vec<u8>) -> Self {
        Self {
            code: ErrorCode::MessageHeader,
            subcode,
            data,
        }
    }

    pub fn open(subcode: u8, data: Vec<u8>) -> Self {
        Self {
            code: ErrorCode::OpenMessage,
            subcode,
            data,
        }
    }

    pub fn update(subcode: u8, data: Vec<u8>) -> Self {
        Self {
            code: ErrorCode::UpdateMessage,
            subcode,
            data,
        }
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [subcode {}]", self.code, self.subcode)
    }
}

impl std::error::Error for MessageError {}

// A message shorter than its header length claims is a framing-level
// length inconsistency.
impl From<io::Error> for MessageError {
    fn from(_: io::Error) -> Self {
        MessageError::header(header_subcode::BAD_MESSAGE_LENGTH, vec![])
    }
}

impl From<&MessageError> for Notification {
    fn from(err: &MessageError) -> Notification {
        Notification {
            major_err_code: err.code as u8,
            minor_err_code: err.subcode,
            data: err.data.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Open(Open),
    Update(Update),
    Notification(Notification),
    KeepAlive,
    RouteRefresh(RouteRefresh),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Open(_) => "OPEN",
            Message::Update(_) => "UPDATE",
            Message::Notification(_) => "NOTIFICATION",
            Message::KeepAlive => "KEEPALIVE",
            Message::RouteRefresh(_) => "ROUTEREFRESH",
        }
    }

    fn type_code(&self) -> u8 {
        match self {
            Message::Open(_) => 1,
            Message::Update(_) => 2,
            Message::Notification(_) => 3,
            Message::KeepAlive => 4,
            Message::RouteRefresh(_) => 5,
        }
    }

    /// Decode a whole message (header included) from `buf`.
    ///
    /// `four_byte_asn` selects the AS_PATH encoding negotiated for the
    /// session (RFC 6793).
    pub fn decode(buf: &[u8], four_byte_asn: bool) -> Result<Message, MessageError> {
        if buf.len() < HEADER_LENGTH {
            return Err(MessageError::header(
                header_subcode::BAD_MESSAGE_LENGTH,
                (buf.len() as u16).to_be_bytes().to_vec(),
            ));
        }
        if buf[..16] != [0xff; 16] {
            return Err(MessageError::header(
                header_subcode::CONNECTION_NOT_SYNCHRONIZED,
                vec![],
            ));
        }
        let mut cursor = Cursor::new(&buf[16..]);
        let length = cursor.read_u16::<NetworkEndian>()? as usize;
        if !(HEADER_LENGTH..=MAX_MESSAGE_LENGTH).contains(&length) || length != buf.len() {
            return Err(MessageError::header(
                header_subcode::BAD_MESSAGE_LENGTH,
                (length as u16).to_be_bytes().to_vec(),
            ));
        }
        let message_type = cursor.read_u8()?;
        let body = &buf[HEADER_LENGTH..];
        match message_type {
            1 => Ok(Message::Open(Open::decode(body)?)),
            2 => Ok(Message::Update(Update::decode(body, four_byte_asn)?)),
            3 => Ok(Message::Notification(Notification::decode(body)?)),
            4 => {
                if !body.is_empty() {
                    return Err(MessageError::header(
                        header_subcode::BAD_MESSAGE_LENGTH,
                        (length as u16).to_be_bytes().to_vec(),
                    ));
                }
                Ok(Message::KeepAlive)
            }
            5 => Ok(Message::RouteRefresh(RouteRefresh::decode(body)?)),
            t => Err(MessageError::header(
                header_subcode::BAD_MESSAGE_TYPE,
                vec![t],
            )),
        }
    }

    /// Encode this message, header included, into `out`.
    pub fn encode(&self, out: &mut Vec<u8>, four_byte_asn: bool) -> Result<(), MessageError> {
        let mut body: Vec<u8> = Vec::with_capacity(64);
        match self {
            Message::Open(open) => open.encode(&mut body)?,
            Message::Update(update) => update.encode(&mut body, four_byte_asn)?,
            Message::Notification(notification) => notification.encode(&mut body)?,
            Message::KeepAlive => (),
            Message::RouteRefresh(rr) => rr.encode(&mut body)?,
        }
        out.extend_from_slice(&[0xff; 16]);
        out.write_u16::<NetworkEndian>((HEADER_LENGTH + body.len()) as u16)?;
        out.write_u8(self.type_code())?;
        out.extend_from_slice(&body);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    pub version: u8,
    pub peer_asn: u16,
    pub hold_timer: u16,
    pub identifier: u32,
    pub parameters: Vec<OpenParameter>,
}

impl Open {
    fn decode(buf: &[u8]) -> Result<Open, MessageError> {
        let mut cursor = Cursor::new(buf);
        let version = cursor.read_u8()?;
        if version != 4 {
            return Err(MessageError::open(
                open_subcode::UNSUPPORTED_VERSION_NUMBER,
                vec![0, 4],
            ));
        }
        let peer_asn = cursor.read_u16::<NetworkEndian>()?;
        let hold_timer = cursor.read_u16::<NetworkEndian>()?;
        if hold_timer == 1 || hold_timer == 2 {
            return Err(MessageError::open(
                open_subcode::UNACCEPTABLE_HOLD_TIME,
                hold_timer.to_be_bytes().to_vec(),
            ));
        }
        let identifier = cursor.read_u32::<NetworkEndian>()?;
        // 0.0.0.0 and class-D/E space are not valid unicast identifiers
        let first_octet = (identifier >> 24) as u8;
        if identifier == 0 || first_octet >= 224 {
            return Err(MessageError::open(
                open_subcode::BAD_BGP_IDENTIFIER,
                identifier.to_be_bytes().to_vec(),
            ));
        }
        let param_len = cursor.read_u8()? as usize;
        let params_start = cursor.position() as usize;
        if params_start + param_len != buf.len() {
            return Err(MessageError::open(
                open_subcode::UNSUPPORTED_OPTIONAL_PARAMETER,
                vec![],
            ));
        }
        let mut parameters = Vec::new();
        let mut remaining = param_len;
        while remaining > 0 {
            let (consumed, parameter) = OpenParameter::decode(&mut cursor)?;
            if consumed > remaining {
                return Err(MessageError::open(
                    open_subcode::UNSUPPORTED_OPTIONAL_PARAMETER,
                    vec![],
                ));
            }
            remaining -= consumed;
            parameters.push(parameter);
        }
        Ok(Open {
            version,
            peer_asn,
            hold_timer,
            identifier,
            parameters,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), MessageError> {
        out.write_u8(self.version)?;
        out.write_u16::<NetworkEndian>(self.peer_asn)?;
        out.write_u16::<NetworkEndian>(self.hold_timer)?;
        out.write_u32::<NetworkEndian>(self.identifier)?;
        let mut params: Vec<u8> = Vec::with_capacity(32);
        for parameter in &self.parameters {
            parameter.encode(&mut params)?;
        }
        out.write_u8(params.len() as u8)?;
        out.extend_from_slice(&params);
        Ok(())
    }

    /// Capabilities advertised in this OPEN, flattened across parameters
    pub fn capabilities(&self) -> Vec<&Capability> {
        self.parameters
            .iter()
            .filter_map(|p| match p {
                OpenParameter::Capabilities(caps) => Some(caps.iter()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpenParameter {
    Capabilities(Vec<Capability>),
    Unknown { param_type: u8, value: Vec<u8> },
}

impl OpenParameter {
    fn decode(cursor: &mut Cursor<&[u8]>) -> Result<(usize, OpenParameter), MessageError> {
        let param_type = cursor.read_u8()?;
        let length = cursor.read_u8()? as usize;
        let mut value = vec![0u8; length];
        cursor.read_exact(&mut value).map_err(|_| {
            MessageError::open(open_subcode::UNSUPPORTED_OPTIONAL_PARAMETER, vec![])
        })?;
        let parameter = match param_type {
            2 => OpenParameter::Capabilities(Capability::decode_list(&value)?),
            _ => OpenParameter::Unknown { param_type, value },
        };
        Ok((2 + length, parameter))
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), MessageError> {
        match self {
            OpenParameter::Capabilities(caps) => {
                let mut value: Vec<u8> = Vec::with_capacity(16);
                for capability in caps {
                    capability.encode(&mut value)?;
                }
                out.write_u8(2)?;
                out.write_u8(value.len() as u8)?;
                out.extend_from_slice(&value);
            }
            OpenParameter::Unknown { param_type, value } => {
                out.write_u8(*param_type)?;
                out.write_u8(value.len() as u8)?;
                out.extend_from_slice(value);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub major_err_code: u8,
    pub minor_err_code: u8,
    pub data: Vec<u8>,
}

impl Notification {
    fn decode(buf: &[u8]) -> Result<Notification, MessageError> {
        let mut cursor = Cursor::new(buf);
        let major_err_code = cursor.read_u8()?;
        let minor_err_code = cursor.read_u8()?;
        let data = buf[2..].to_vec();
        Ok(Notification {
            major_err_code,
            minor_err_code,
            data,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), MessageError> {
        out.write_u8(self.major_err_code)?;
        out.write_u8(self.minor_err_code)?;
        out.extend_from_slice(&self.data);
        Ok(())
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let code = match self.major_err_code {
            1 => "Message Header Error",
            2 => "OPEN Message Error",
            3 => "UPDATE Message Error",
            4 => "Hold Timer Expired",
            5 => "Finite State Machine Error",
            6 => "Cease",
            _ => "Unknown",
        };
        write!(f, "{} [subcode {}]", code, self.minor_err_code)
    }
}

/// ROUTE-REFRESH (RFC 2918)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteRefresh {
    pub afi: Afi,
    pub safi: Safi,
}

impl RouteRefresh {
    fn decode(buf: &[u8]) -> Result<RouteRefresh, MessageError> {
        let mut cursor = Cursor::new(buf);
        let afi = Afi::try_from(cursor.read_u16::<NetworkEndian>()?)?;
        let _reserved = cursor.read_u8()?;
        let safi = Safi::try_from(cursor.read_u8()?)?;
        Ok(RouteRefresh { afi, safi })
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), MessageError> {
        out.write_u16::<NetworkEndian>(self.afi as u16)?;
        out.write_u8(0)?;
        out.write_u8(self.safi as u8)?;
        Ok(())
    }
}

/// Decode one NLRI prefix (length byte + truncated network bytes)
pub(crate) fn decode_prefix(
    cursor: &mut Cursor<&[u8]>,
    afi: Afi,
) -> Result<IpNetwork, MessageError> {
    let bits = cursor.read_u8().map_err(|_| {
        MessageError::update(update_subcode::INVALID_NETWORK_FIELD, vec![])
    })?;
    let max_bits = match afi {
        Afi::Ipv4 => 32,
        Afi::Ipv6 => 128,
    };
    if bits > max_bits {
        return Err(MessageError::update(
            update_subcode::INVALID_NETWORK_FIELD,
            vec![bits],
        ));
    }
    let num_bytes = (usize::from(bits) + 7) / 8;
    let mut octets = vec![0u8; num_bytes];
    cursor.read_exact(&mut octets).map_err(|_| {
        MessageError::update(update_subcode::INVALID_NETWORK_FIELD, vec![bits])
    })?;
    let network = match afi {
        Afi::Ipv4 => {
            let mut buf = [0u8; 4];
            buf[..num_bytes].copy_from_slice(&octets);
            IpNetwork::new(std::net::Ipv4Addr::from(buf).into(), bits)
        }
        Afi::Ipv6 => {
            let mut buf = [0u8; 16];
            buf[..num_bytes].copy_from_slice(&octets);
            IpNetwork::new(std::net::Ipv6Addr::from(buf).into(), bits)
        }
    };
    network.map_err(|_| MessageError::update(update_subcode::INVALID_NETWORK_FIELD, vec![bits]))
}

/// Encode one NLRI prefix in the truncated wire form
pub(crate) fn encode_prefix(out: &mut Vec<u8>, prefix: &IpNetwork) -> Result<(), MessageError> {
    let bits = prefix.prefix();
    out.write_u8(bits)?;
    let num_bytes = (usize::from(bits) + 7) / 8;
    match prefix {
        IpNetwork::V4(net) => out.extend_from_slice(&net.network().octets()[..num_bytes]),
        IpNetwork::V6(net) => out.extend_from_slice(&net.network().octets()[..num_bytes]),
    }
    Ok(())
}
