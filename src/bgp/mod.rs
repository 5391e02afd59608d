pub mod codec;
pub mod community;
pub mod damping;
pub mod decision;
pub mod export;
pub mod families;
pub mod fsm;
pub mod graceful;
pub mod hold_timer;
pub mod manager;
pub mod message_counts;
pub mod msg;
pub mod policy;
pub mod poller;
pub mod reflector;
pub mod rib;
pub mod rpki;
pub mod session;

use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};

pub use fsm::{Fsm, FsmEvent, SessionState};
pub use hold_timer::HoldTimer;
pub use manager::SessionManager;
pub use message_counts::MessageCounts;
pub use session::Session;

use msg::{MessageError, Update};

/// What a session turn surfaces to the handler
#[derive(Debug)]
pub enum SessionUpdate {
    /// Update received from a peer
    Learned {
        peer_ip: IpAddr,
        router_id: Ipv4Addr,
        update: Update,
    },
    /// Peer finished its initial table dump (RFC 4724 End-of-RIB)
    EndOfRib {
        peer_ip: IpAddr,
        family: (msg::Afi, msg::Safi),
    },
    /// Sessions ended; the handler decides between purge and
    /// graceful-restart stale preservation
    Ended(Vec<EndedPeer>),
}

#[derive(Debug, Clone, Copy)]
pub struct EndedPeer {
    pub peer_ip: IpAddr,
    /// Graceful-Restart capability as negotiated, if it was
    pub graceful_restart: Option<msg::GracefulRestartCap>,
}

#[derive(Debug)]
pub enum SessionError {
    /// Peer De-configured
    Deconfigured,
    /// Received an unexpected ASN. [received, expected]
    OpenAsnMismatch(u32, u32),
    /// Finite State Machine error, unexpected transition [minor_err_code]
    FiniteStateMachine(u8),
    /// Hold time expired. [interval]
    HoldTimeExpired(u16),
    /// Wire-format error with its NOTIFICATION mapping
    Wire(MessageError),
    /// Something happened in transport. [reason]
    TransportError(String),
    /// Some other issue happened. [reason]
    Other(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Session Error: ")?;
        use SessionError::*;
        match self {
            Deconfigured => write!(f, "Peer De-configured")?,
            OpenAsnMismatch(r, e) => {
                write!(f, "Open ASN Mismatch (received={}, expected={})", r, e)?;
            }
            HoldTimeExpired(h) => write!(f, "Hold time expired after {} seconds", h)?,
            FiniteStateMachine(minor) => write!(f, "Finite State Machine err [{}]", minor)?,
            Wire(err) => write!(f, "{}", err)?,
            TransportError(r) => write!(f, "Transport error [{}]", r)?,
            Other(r) => write!(f, "{}", r)?,
        }
        Ok(())
    }
}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        SessionError::TransportError(error.to_string())
    }
}

impl From<MessageError> for SessionError {
    fn from(error: MessageError) -> Self {
        SessionError::Wire(error)
    }
}

impl error::Error for SessionError {}
