use std::cmp;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};

use super::codec::MessageProtocol;
use super::fsm::{Fsm, FsmAction, FsmEvent, SessionState};
use super::msg::{
    cease_subcode, open_subcode, Afi, Capabilities, Capability, Message, Notification, Open,
    RouteRefresh, Safi, Update,
};
use super::rib::AdvertisedRoute;
use super::{HoldTimer, MessageCounts, SessionError, SessionUpdate};
use crate::bgp::families::Family;
use crate::config::PeerConfig;
use crate::utils::transform_u32_to_bytes;

/// This is where a connected peer is managed.
///
/// A `Session` is a stream for processing BGP messages and
/// handling peer timeouts
pub struct Session {
    pub(crate) addr: IpAddr,
    pub(crate) fsm: Fsm,
    pub(crate) router_id: Ipv4Addr,
    pub(crate) config: Arc<PeerConfig>,
    pub(crate) protocol: MessageProtocol,
    pub(crate) connect_time: DateTime<Utc>,
    pub(crate) hold_timer: HoldTimer,
    pub(crate) counts: MessageCounts,
    pub(crate) capabilities: Capabilities,
    /// UPDATEs queued by the manager's Adj-RIB-Out pass
    outbound: VecDeque<Message>,
    /// Set on entry to Established; cleared once the manager has walked
    /// the Loc-RIB for the initial advertisement pass
    pub(crate) needs_initial_advertisement: bool,
    /// End-of-RIB goes out once after the initial advertisement pass
    pub(crate) end_of_rib_sent: bool,
}

/// Hold time used between connection establishment and OPEN negotiation
/// (RFC 4271 8.2.2 suggests a large value)
const LARGE_HOLD_SECS: u16 = 240;

impl Session {
    pub fn new(config: Arc<PeerConfig>, protocol: MessageProtocol) -> Session {
        let addr = protocol
            .get_ref()
            .peer_addr()
            .expect("Stream has remote IP")
            .ip();
        let capabilities = Self::local_capabilities(&config);
        let mut fsm = Fsm::new();
        // The TCP connection exists by the time a session is built
        let _ = fsm.handle(FsmEvent::ManualStart);
        Session {
            addr,
            fsm,
            router_id: config.local_router_id,
            config,
            protocol,
            connect_time: Utc::now(),
            hold_timer: HoldTimer::new(LARGE_HOLD_SECS),
            counts: MessageCounts::new(),
            capabilities,
            outbound: VecDeque::new(),
            needs_initial_advertisement: false,
            end_of_rib_sent: false,
        }
    }

    fn local_capabilities(config: &PeerConfig) -> Capabilities {
        let mut capabilities = Capabilities::default();
        for family in &config.families {
            capabilities.families.insert((family.afi, family.safi));
        }
        capabilities.route_refresh = true;
        capabilities.four_byte_asn = Some(config.local_as);
        capabilities
    }

    pub fn state(&self) -> SessionState {
        self.fsm.state
    }

    /// Did the local side initiate the connection out (vs. receiving SYN
    /// from peer). This is true if the remote port is the configured dest
    /// port since a remote initiation would mean a random remote port.
    pub fn is_locally_initiated(&self) -> bool {
        let remote_port = self
            .protocol
            .get_ref()
            .peer_addr()
            .expect("Getting remote addr")
            .port();
        remote_port == self.config.dest_port
    }

    /// Our address on this TCP session (used for eBGP NEXT_HOP rewrite)
    pub fn local_addr(&self) -> Option<IpAddr> {
        self.protocol
            .get_ref()
            .local_addr()
            .ok()
            .map(|addr| addr.ip())
    }

    pub fn update_config(&mut self, new_config: Arc<PeerConfig>) {
        debug!("Peer config for {} (active session) updated", self.addr);
        self.config = new_config;
    }

    fn transition(&mut self, event: FsmEvent) -> Result<Vec<FsmAction>, SessionError> {
        let from = self.fsm.state;
        let transition = self
            .fsm
            .handle(event)
            .map_err(SessionError::FiniteStateMachine)?;
        if from != transition.next {
            debug!("{} went from {} to {}", self.addr, from, transition.next);
        }
        Ok(transition.actions)
    }

    /// Queue an UPDATE built from the Adj-RIB-Out pass
    pub fn queue_advertisement(&mut self, route: &AdvertisedRoute) {
        let update = create_update(route);
        self.outbound.push_back(Message::Update(update));
    }

    pub fn queue_withdraw(&mut self, family: Family, prefixes: Vec<ipnetwork::IpNetwork>) {
        if prefixes.is_empty() {
            return;
        }
        self.outbound
            .push_back(Message::Update(create_withdraw(family, prefixes)));
    }

    /// Main function for making progress with the session
    /// Waits for either a new incoming message or a HoldTimer event
    pub async fn run(&mut self) -> Result<Option<SessionUpdate>, SessionError> {
        if !self.config.enabled {
            // Peer has been disabled, shutdown session
            return Err(SessionError::Deconfigured);
        }
        if self.fsm.state == SessionState::Connect && self.is_locally_initiated() {
            let open = self.create_open();
            let actions = self.transition(FsmEvent::TcpConnectionConfirmed)?;
            if actions.contains(&FsmAction::SendOpen) {
                self.send_message(Message::Open(open)).await?;
            }
        }
        trace!("Hold time on {}: {}", self.addr, self.hold_timer);

        if self.fsm.state == SessionState::Established {
            while let Some(message) = self.outbound.pop_front() {
                self.send_message(message).await?;
            }
        }

        tokio::select! {
            message = self.protocol.next() => {
                match message {
                    // Framed stream is exhausted, remote side closed connection
                    None => {
                        let _ = self.transition(FsmEvent::TcpConnectionFails);
                        Err(SessionError::Other(format!(
                            "Session ended with {}",
                            self.addr
                        )))
                    }
                    Some(Ok(Ok(message))) => {
                        trace!("[{}] Incoming: {}", self.addr, message.kind());
                        self.counts.increment_received();
                        self.hold_timer.received();
                        let resp = self.process_message(message)?;
                        match resp {
                            MessageResponse::Reply(messages) => {
                                for message in messages {
                                    self.send_message(message).await?;
                                }
                            }
                            MessageResponse::Refresh(refresh) => {
                                // Re-advertise the whole table for the
                                // refreshed family on the next sync pass
                                debug!("[{}] ROUTE-REFRESH for {} {}", self.addr, refresh.afi, refresh.safi);
                                self.needs_initial_advertisement = true;
                            }
                            MessageResponse::Update(update) => {
                                if let Some(family) = update.end_of_rib() {
                                    return Ok(Some(SessionUpdate::EndOfRib {
                                        peer_ip: self.addr,
                                        family,
                                    }));
                                }
                                return Ok(Some(SessionUpdate::Learned {
                                    peer_ip: self.addr,
                                    router_id: self.router_id,
                                    update,
                                }));
                            }
                            _ => (),
                        }
                        Ok(None)
                    }
                    // The message failed wire validation: notify and end
                    Some(Ok(Err(wire_error))) => {
                        warn!("[{}] Malformed message: {}", self.addr, wire_error);
                        let notification = Notification::from(&wire_error);
                        let _ = self.send_message(Message::Notification(notification)).await;
                        Err(SessionError::Wire(wire_error))
                    }
                    // Transport-level error
                    Some(Err(err)) => {
                        let _ = self.transition(FsmEvent::TcpConnectionFails);
                        Err(SessionError::Other(format!(
                            "Session ended with {}: {}",
                            self.addr, err
                        )))
                    }
                }
            },
            // Hold Timer
            keepalive = self.hold_timer.should_send_keepalive() => {
                match keepalive {
                    Err(err) => {
                        // Hold Timer Expired: notify the peer, then drop
                        let _ = self
                            .send_message(Message::Notification(Notification {
                                major_err_code: 4,
                                minor_err_code: 0,
                                data: vec![],
                            }))
                            .await;
                        Err(err)
                    }
                    Ok(should_send) => {
                        if should_send {
                            let actions = self.transition(FsmEvent::KeepaliveTimerExpires)?;
                            // Exactly one KEEPALIVE per expiry
                            if actions.contains(&FsmAction::SendKeepalive) {
                                self.send_message(Message::KeepAlive).await?;
                            }
                        }
                        Ok(None)
                    }
                }
            },
        }
    }

    pub fn process_message(&mut self, message: Message) -> Result<MessageResponse, SessionError> {
        let response = match message {
            Message::Open(open) => {
                let (capabilities, hold_timer) = self.open_received(open)?;
                self.capabilities = capabilities;
                self.hold_timer = HoldTimer::new(hold_timer);
                self.protocol
                    .codec_mut()
                    .set_four_byte_asn(self.capabilities.four_byte_asn.is_some());
                let actions = self.transition(FsmEvent::BgpOpen)?;
                let mut replies = Vec::with_capacity(2);
                if actions.contains(&FsmAction::SendOpen) {
                    // Remote initiated; our OPEN goes back first
                    replies.push(Message::Open(self.create_open()));
                }
                if actions.contains(&FsmAction::SendKeepalive) {
                    replies.push(Message::KeepAlive);
                }
                MessageResponse::Reply(replies)
            }
            Message::KeepAlive => {
                let previous = self.fsm.state;
                let actions = self.transition(FsmEvent::KeepaliveMsg)?;
                if previous == SessionState::OpenConfirm
                    && actions.contains(&FsmAction::RunInitialAdvertisement)
                {
                    self.needs_initial_advertisement = true;
                }
                MessageResponse::Empty
            }
            Message::Update(update) => {
                self.transition(FsmEvent::UpdateMsg)?;
                MessageResponse::Update(update)
            }
            Message::Notification(notification) => {
                warn!("{} NOTIFICATION: {}", self.addr, notification);
                let _ = self.transition(FsmEvent::NotifMsg);
                return Err(SessionError::Other(format!(
                    "Peer sent NOTIFICATION: {}",
                    notification
                )));
            }
            Message::RouteRefresh(refresh) => MessageResponse::Refresh(refresh),
        };
        Ok(response)
    }

    // Send a message, and flush the send buffer afterwards
    pub async fn send_message(&mut self, message: Message) -> Result<(), io::Error> {
        trace!("[{}] Outgoing: {}", self.addr, message.kind());
        self.protocol.send(message).await?;
        self.counts.increment_sent();
        self.hold_timer.sent();
        Ok(())
    }

    pub async fn notify(&mut self, major: u8, minor: u8) -> Result<(), io::Error> {
        let notification = Notification {
            major_err_code: major,
            minor_err_code: minor,
            data: vec![],
        };
        self.send_message(Message::Notification(notification)).await
    }

    pub fn open_received(
        &mut self,
        received_open: Open,
    ) -> Result<(Capabilities, u16), SessionError> {
        let router_id = Ipv4Addr::from(transform_u32_to_bytes(received_open.identifier));
        let remote_asn = asn_from_open(&received_open);
        if remote_asn != self.config.remote_as {
            return Err(SessionError::OpenAsnMismatch(
                remote_asn,
                self.config.remote_as,
            ));
        }
        let hold_timer = cmp::min(received_open.hold_timer, self.config.hold_timer);
        debug!(
            "[{}] Received OPEN [w/ {} params]",
            self.addr,
            received_open.parameters.len()
        );
        self.router_id = router_id;
        let received_capabilities = Capabilities::from_open(&received_open);
        let common_capabilities = self.capabilities.common(&received_capabilities);
        Ok((common_capabilities, hold_timer))
    }

    pub fn create_open(&self) -> Open {
        let mut capabilities: Vec<Capability> =
            Vec::with_capacity(self.config.families.len() + 2);
        capabilities.extend(
            self.config
                .families
                .iter()
                .map(|family| family.to_capability()),
        );
        capabilities.push(Capability::RouteRefresh);
        capabilities.push(Capability::FourByteAsn(self.config.local_as));
        if let Some(gr) = self.capabilities.graceful_restart {
            capabilities.push(Capability::GracefulRestart {
                restart_state: false,
                restart_time: gr.restart_time,
                families: self
                    .config
                    .families
                    .iter()
                    .map(|family| (family.afi, family.safi))
                    .collect(),
            });
        }
        let two_byte_asn = if self.config.local_as < 65535 {
            self.config.local_as as u16
        } else {
            // AS-TRANS: RFC 6793 [4.2.3.9]
            23456
        };
        Open {
            version: 4,
            peer_asn: two_byte_asn,
            hold_timer: self.config.hold_timer,
            identifier: u32::from_be_bytes(self.config.local_router_id.octets()),
            parameters: vec![super::msg::OpenParameter::Capabilities(capabilities)],
        }
    }

    /// Offer the Graceful-Restart capability in our OPEN
    pub fn enable_graceful_restart(&mut self, restart_time: u16) {
        self.capabilities.graceful_restart = Some(super::msg::GracefulRestartCap {
            restart_state: false,
            restart_time,
        });
    }

    /// The End-of-RIB marker for a family (sent after the initial
    /// advertisement pass when graceful restart is negotiated)
    pub fn end_of_rib_marker(family: Family) -> Message {
        match (family.afi, family.safi) {
            (Afi::Ipv4, Safi::Unicast) => Message::Update(Update::default()),
            (afi, safi) => Message::Update(Update {
                attributes: vec![super::msg::PathAttribute::MpUnreachNlri(
                    super::msg::MpUnreachNlri {
                        afi,
                        safi,
                        withdrawn: vec![],
                    },
                )],
                ..Update::default()
            }),
        }
    }

    pub fn queue_message(&mut self, message: Message) {
        self.outbound.push_back(message);
    }

    pub async fn close(mut self, major: u8, minor: u8) {
        let _ = self.notify(major, minor).await;
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Session {} uptime={} hold_time={}>",
            self.addr,
            crate::utils::format_time_as_elapsed(self.connect_time),
            self.hold_timer,
        )
    }
}

#[derive(Debug)]
pub enum MessageResponse {
    Reply(Vec<Message>),
    Update(Update),
    Refresh(RouteRefresh),
    Empty,
}

/// Check 4-byte ASN first, fallback to 2-byte
fn asn_from_open(open: &Open) -> u32 {
    open.capabilities()
        .iter()
        .find_map(|capability| match capability {
            Capability::FourByteAsn(asn) => Some(*asn),
            _ => None,
        })
        .unwrap_or_else(|| u32::from(open.peer_asn))
}

/// Build a single-prefix UPDATE from an Adj-RIB-Out entry
pub fn create_update(route: &AdvertisedRoute) -> Update {
    let attributes = route.attributes.to_attributes(route.family, route.prefix);
    let announced_routes = if route.family == Family::ipv4_unicast() {
        vec![route.prefix]
    } else {
        // Non-IPv4 NLRI rides inside MP_REACH_NLRI
        vec![]
    };
    Update {
        withdrawn_routes: Vec::new(),
        attributes,
        announced_routes,
        treat_as_withdraw: false,
    }
}

/// Build a withdraw-only UPDATE
pub fn create_withdraw(family: Family, prefixes: Vec<ipnetwork::IpNetwork>) -> Update {
    if family == Family::ipv4_unicast() {
        Update {
            withdrawn_routes: prefixes,
            ..Update::default()
        }
    } else {
        Update {
            attributes: vec![super::msg::PathAttribute::MpUnreachNlri(
                super::msg::MpUnreachNlri {
                    afi: family.afi,
                    safi: family.safi,
                    withdrawn: prefixes,
                },
            )],
            ..Update::default()
        }
    }
}

/// Connection collision resolution (RFC 4271 6.8): when two connections
/// to the same peer exist, the side with the numerically smaller BGP
/// identifier closes its connection.
pub fn collision_close_local(local_id: Ipv4Addr, remote_id: Ipv4Addr) -> bool {
    u32::from_be_bytes(local_id.octets()) < u32::from_be_bytes(remote_id.octets())
}

pub(crate) fn notification_for(error: &SessionError) -> Option<Notification> {
    match error {
        SessionError::Deconfigured => Some(Notification {
            major_err_code: 6,
            minor_err_code: cease_subcode::PEER_DECONFIGURED,
            data: vec![],
        }),
        SessionError::HoldTimeExpired(_) => None, // already sent inline
        SessionError::FiniteStateMachine(minor) => Some(Notification {
            major_err_code: 5,
            minor_err_code: *minor,
            data: vec![],
        }),
        SessionError::OpenAsnMismatch(_, _) => Some(Notification {
            major_err_code: 2,
            minor_err_code: open_subcode::BAD_PEER_AS,
            data: vec![],
        }),
        SessionError::Wire(_) => None, // already sent inline
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::msg::{AsPath, Origin, PathAttribute};
    use crate::bgp::rib::PathSet;

    #[test]
    fn test_create_update_v4() {
        let route = AdvertisedRoute {
            family: Family::ipv4_unicast(),
            prefix: "203.0.113.0/24".parse().unwrap(),
            attributes: PathSet {
                origin: Origin::Igp,
                as_path: AsPath::from_sequence(vec![65001, 65002]),
                next_hop: Some("192.0.2.1".parse().unwrap()),
                ..PathSet::default()
            },
        };
        let update = create_update(&route);
        assert_eq!(update.announced_routes, vec![route.prefix]);
        assert!(update
            .get(crate::bgp::msg::identifier::NEXT_HOP)
            .is_some());
    }

    #[test]
    fn test_create_update_v6_uses_mp_reach() {
        let route = AdvertisedRoute {
            family: Family::ipv6_unicast(),
            prefix: "2001:db8:100::/48".parse().unwrap(),
            attributes: PathSet {
                origin: Origin::Igp,
                as_path: AsPath::from_sequence(vec![65001]),
                next_hop: Some("2001:db8::1".parse().unwrap()),
                ..PathSet::default()
            },
        };
        let update = create_update(&route);
        assert!(update.announced_routes.is_empty());
        match update.get(crate::bgp::msg::identifier::MP_REACH_NLRI) {
            Some(PathAttribute::MpReachNlri(mp)) => {
                assert_eq!(mp.announced, vec![route.prefix]);
            }
            other => panic!("expected MP_REACH_NLRI, got {:?}", other),
        }
    }

    #[test]
    fn test_create_withdraw() {
        let prefixes = vec!["203.0.113.0/24".parse().unwrap()];
        let update = create_withdraw(Family::ipv4_unicast(), prefixes.clone());
        assert_eq!(update.withdrawn_routes, prefixes);

        let v6: Vec<ipnetwork::IpNetwork> = vec!["2001:db8::/48".parse().unwrap()];
        let update = create_withdraw(Family::ipv6_unicast(), v6.clone());
        match update.get(crate::bgp::msg::identifier::MP_UNREACH_NLRI) {
            Some(PathAttribute::MpUnreachNlri(mp)) => assert_eq!(mp.withdrawn, v6),
            other => panic!("expected MP_UNREACH_NLRI, got {:?}", other),
        }
    }

    #[test]
    fn test_collision_resolution() {
        let smaller: Ipv4Addr = "10.0.1.1".parse().unwrap();
        let bigger: Ipv4Addr = "10.0.1.2".parse().unwrap();
        assert!(collision_close_local(smaller, bigger));
        assert!(!collision_close_local(bigger, smaller));
    }

    #[test]
    fn test_asn_from_open_fallback() {
        let open = Open {
            version: 4,
            peer_asn: 65002,
            hold_timer: 90,
            identifier: 0x0a000102,
            parameters: vec![],
        };
        assert_eq!(asn_from_open(&open), 65002);
        let open_4byte = Open {
            parameters: vec![super::super::msg::OpenParameter::Capabilities(vec![
                Capability::FourByteAsn(4_200_000_000),
            ])],
            ..open
        };
        assert_eq!(asn_from_open(&open_4byte), 4_200_000_000);
    }

    #[test]
    fn test_end_of_rib_markers() {
        match Session::end_of_rib_marker(Family::ipv4_unicast()) {
            Message::Update(update) => {
                assert_eq!(update.end_of_rib(), Some((Afi::Ipv4, Safi::Unicast)))
            }
            other => panic!("expected UPDATE, got {:?}", other),
        }
        match Session::end_of_rib_marker(Family::ipv6_unicast()) {
            Message::Update(update) => {
                assert_eq!(update.end_of_rib(), Some((Afi::Ipv6, Safi::Unicast)))
            }
            other => panic!("expected UPDATE, got {:?}", other),
        }
    }
}
