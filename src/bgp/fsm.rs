//! The per-peer session state machine (RFC 4271 section 8).
//!
//! The machine itself is pure: feeding it an event yields the next state
//! plus the side effects the session layer must perform. Keeping it free of
//! I/O makes every transition directly testable.

use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            SessionState::Idle => "Idle",
            SessionState::Connect => "Connect",
            SessionState::Active => "Active",
            SessionState::OpenSent => "OpenSent",
            SessionState::OpenConfirm => "OpenConfirm",
            SessionState::Established => "Established",
        };
        write!(f, "{}", word)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FsmEvent {
    ManualStart,
    ManualStop,
    TcpConnectionConfirmed,
    TcpConnectionFails,
    BgpOpen,
    BgpOpenMsgErr,
    BgpHeaderErr,
    KeepaliveMsg,
    UpdateMsg,
    UpdateMsgErr,
    NotifMsg,
    HoldTimerExpires,
    KeepaliveTimerExpires,
    ConnectRetryTimerExpires,
}

/// Side effects the session layer performs for a transition, in order
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FsmAction {
    StartConnectRetryTimer,
    StopConnectRetryTimer,
    InitiateTcpConnection,
    SendOpen,
    SendKeepalive,
    /// Restart (never merely stop) the hold timer with its current value
    RestartHoldTimer,
    RestartKeepaliveTimer,
    /// Walk the Loc-RIB and emit the initial advertisements
    RunInitialAdvertisement,
    CloseTcpConnection,
    /// Drop every route learned from this peer
    PurgeAdjRibIn,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub next: SessionState,
    pub actions: Vec<FsmAction>,
}

/// FSM-error subcode reported when a message arrives in a state that cannot
/// accept it (RFC 6608)
fn fsm_err_for_state(state: SessionState) -> u8 {
    use SessionState::*;
    match state {
        OpenSent => 1,
        OpenConfirm => 2,
        Established => 3,
        _ => 0,
    }
}

#[derive(Debug)]
pub struct Fsm {
    pub state: SessionState,
}

impl Fsm {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    /// Apply `event`, returning the performed transition, or the FSM-error
    /// subcode when the event is invalid in the current state.
    pub fn handle(&mut self, event: FsmEvent) -> Result<Transition, u8> {
        use FsmAction::*;
        use FsmEvent::*;
        use SessionState::*;

        let transition = match (self.state, event) {
            (Idle, ManualStart) => Transition {
                next: Connect,
                actions: vec![StartConnectRetryTimer, InitiateTcpConnection],
            },
            // Events other than a start are ignored in Idle
            (Idle, _) => Transition {
                next: Idle,
                actions: vec![],
            },

            (_, ManualStop) => Transition {
                next: Idle,
                actions: vec![CloseTcpConnection, PurgeAdjRibIn],
            },

            (Connect, TcpConnectionConfirmed) | (Active, TcpConnectionConfirmed) => Transition {
                next: OpenSent,
                actions: vec![StopConnectRetryTimer, SendOpen, RestartHoldTimer],
            },
            (Connect, TcpConnectionFails) => Transition {
                next: Active,
                actions: vec![StartConnectRetryTimer],
            },
            (Connect, ConnectRetryTimerExpires) | (Active, ConnectRetryTimerExpires) => {
                Transition {
                    next: Connect,
                    actions: vec![StartConnectRetryTimer, InitiateTcpConnection],
                }
            }
            (Active, TcpConnectionFails) => Transition {
                next: Active,
                actions: vec![StartConnectRetryTimer],
            },

            (OpenSent, BgpOpen) => Transition {
                next: OpenConfirm,
                // The hold timer is restarted with the negotiated value;
                // stopping it here and relying on KEEPALIVE reception alone
                // is a protocol-observable bug.
                actions: vec![RestartHoldTimer, SendKeepalive, RestartKeepaliveTimer],
            },
            // Remote opened first; our OPEN goes back before the keepalive
            (Connect, BgpOpen) | (Active, BgpOpen) => Transition {
                next: OpenConfirm,
                actions: vec![
                    StopConnectRetryTimer,
                    SendOpen,
                    RestartHoldTimer,
                    SendKeepalive,
                    RestartKeepaliveTimer,
                ],
            },
            (OpenSent, TcpConnectionFails) => Transition {
                next: Active,
                actions: vec![CloseTcpConnection, StartConnectRetryTimer],
            },

            (OpenConfirm, KeepaliveMsg) => Transition {
                next: Established,
                actions: vec![RestartHoldTimer, RunInitialAdvertisement],
            },

            (Established, KeepaliveMsg) | (Established, UpdateMsg) => Transition {
                next: Established,
                actions: vec![RestartHoldTimer],
            },
            // Exactly one KEEPALIVE per keepalive-timer expiry
            (Established, KeepaliveTimerExpires) | (OpenConfirm, KeepaliveTimerExpires) => {
                Transition {
                    next: self.state,
                    actions: vec![SendKeepalive, RestartKeepaliveTimer],
                }
            }

            (_, HoldTimerExpires) => Transition {
                next: Idle,
                actions: vec![CloseTcpConnection, PurgeAdjRibIn],
            },
            (_, NotifMsg) => Transition {
                next: Idle,
                actions: vec![CloseTcpConnection, PurgeAdjRibIn],
            },
            (_, TcpConnectionFails) => Transition {
                next: Idle,
                actions: vec![CloseTcpConnection, PurgeAdjRibIn, StartConnectRetryTimer],
            },
            (_, BgpHeaderErr) | (_, BgpOpenMsgErr) | (_, UpdateMsgErr) => Transition {
                next: Idle,
                actions: vec![CloseTcpConnection, PurgeAdjRibIn],
            },

            // A second connection while one is already being opened is
            // resolved by the manager (collision detection); the running
            // machine ignores it.
            (_, TcpConnectionConfirmed) => Transition {
                next: self.state,
                actions: vec![],
            },

            // A message the current state cannot accept
            (state, BgpOpen) | (state, KeepaliveMsg) | (state, UpdateMsg) => {
                return Err(fsm_err_for_state(state));
            }

            (_, ManualStart) | (_, ConnectRetryTimerExpires) | (_, KeepaliveTimerExpires) => {
                Transition {
                    next: self.state,
                    actions: vec![],
                }
            }
        };
        self.state = transition.next;
        Ok(transition)
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::FsmAction::*;
    use super::FsmEvent::*;
    use super::SessionState::*;
    use super::*;

    fn fsm_in(state: SessionState) -> Fsm {
        Fsm { state }
    }

    #[test]
    fn test_happy_path_to_established() {
        let mut fsm = Fsm::new();
        fsm.handle(ManualStart).unwrap();
        assert_eq!(fsm.state, Connect);
        fsm.handle(TcpConnectionConfirmed).unwrap();
        assert_eq!(fsm.state, OpenSent);
        let transition = fsm.handle(BgpOpen).unwrap();
        assert_eq!(fsm.state, OpenConfirm);
        // The hold timer must be restarted, not stopped
        assert!(transition.actions.contains(&RestartHoldTimer));
        assert!(transition.actions.contains(&SendKeepalive));
        let transition = fsm.handle(KeepaliveMsg).unwrap();
        assert_eq!(fsm.state, Established);
        assert!(transition.actions.contains(&RunInitialAdvertisement));
        // No duplicate KEEPALIVE on the transition into Established
        assert!(!transition.actions.contains(&SendKeepalive));
    }

    #[test]
    fn test_keepalive_timer_in_established() {
        let mut fsm = fsm_in(Established);
        let transition = fsm.handle(KeepaliveTimerExpires).unwrap();
        assert_eq!(fsm.state, Established);
        let sends = transition
            .actions
            .iter()
            .filter(|a| **a == SendKeepalive)
            .count();
        assert_eq!(sends, 1);
        assert!(transition.actions.contains(&RestartKeepaliveTimer));
    }

    #[test]
    fn test_hold_expiry_purges_rib() {
        for state in [Connect, Active, OpenSent, OpenConfirm, Established] {
            let mut fsm = fsm_in(state);
            let transition = fsm.handle(HoldTimerExpires).unwrap();
            assert_eq!(fsm.state, Idle);
            assert!(transition.actions.contains(&CloseTcpConnection));
            assert!(transition.actions.contains(&PurgeAdjRibIn));
        }
    }

    #[test]
    fn test_notification_drops_to_idle() {
        let mut fsm = fsm_in(Established);
        let transition = fsm.handle(NotifMsg).unwrap();
        assert_eq!(fsm.state, Idle);
        assert!(transition.actions.contains(&PurgeAdjRibIn));
    }

    #[test]
    fn test_connect_failure_backs_off_to_active() {
        let mut fsm = fsm_in(Connect);
        fsm.handle(TcpConnectionFails).unwrap();
        assert_eq!(fsm.state, Active);
        let transition = fsm.handle(ConnectRetryTimerExpires).unwrap();
        assert_eq!(fsm.state, Connect);
        assert!(transition.actions.contains(&InitiateTcpConnection));
    }

    #[test]
    fn test_unexpected_open_is_fsm_error() {
        assert_eq!(fsm_in(OpenSent).handle(KeepaliveMsg).unwrap_err(), 1);
        assert_eq!(fsm_in(OpenConfirm).handle(BgpOpen).unwrap_err(), 2);
        assert_eq!(fsm_in(Established).handle(BgpOpen).unwrap_err(), 3);
    }

    #[test]
    fn test_idle_ignores_non_start_events() {
        let mut fsm = Fsm::new();
        for event in [KeepaliveMsg, UpdateMsg, HoldTimerExpires, NotifMsg] {
            let transition = fsm.handle(event).unwrap();
            assert_eq!(transition.next, Idle);
            assert!(transition.actions.is_empty());
        }
    }
}
