use std::collections::HashMap;
use std::error::Error;
use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

use super::codec::{MessageCodec, MessageProtocol};
use super::fsm::SessionState;
use super::msg::{cease_subcode, Message};
use super::poller::{Poller, PollerTx};
use super::session::{collision_close_local, notification_for, Session};
use super::{EndedPeer, SessionError, SessionUpdate};
use crate::config::{PeerConfig, ServerConfig};
use tokio_util::codec::Framed;

pub struct SessionManager {
    pub(crate) poller: Poller,
    // Active Sessions                  remote_ip: session
    pub(crate) sessions: Arc<Mutex<HashMap<IpAddr, Session>>>,
    config: Arc<ServerConfig>,
    poller_tx: PollerTx,
}

impl SessionManager {
    pub fn new(config: Arc<ServerConfig>, listener: TcpListener) -> Self {
        let (poller_tx, poller_rx) = mpsc::unbounded_channel();
        let mut poller = Poller::new(listener, config.bgp.poll_interval, poller_rx);
        for peer_config in config.bgp.peers.iter() {
            poller.upsert_peer(peer_config.clone());
        }

        Self {
            poller,
            sessions: Arc::new(Mutex::new(HashMap::with_capacity(config.bgp.peers.len()))),
            config,
            poller_tx,
        }
    }

    pub fn get_peer_configs(&self) -> Vec<Arc<PeerConfig>> {
        self.config.bgp.peers.to_vec()
    }

    pub fn sessions(&self) -> Arc<Mutex<HashMap<IpAddr, Session>>> {
        Arc::clone(&self.sessions)
    }

    /// Drive every active session one turn, then wait for the next
    /// session-starting event. Returns learned routes, End-of-RIB marks,
    /// and ended sessions for the handler to apply.
    pub async fn get_update(&mut self) -> Result<Option<SessionUpdate>, Box<dyn Error>> {
        {
            // Store sessions that have ended
            let mut ended_sessions: Vec<EndedPeer> = Vec::new();
            let mut sessions = self.sessions.lock().await;
            for (remote_ip, session) in sessions.iter_mut() {
                match session.run().await {
                    Ok(update) => {
                        if update.is_some() {
                            return Ok(update);
                        }
                    }
                    Err(err) => {
                        if let Some(notification) = notification_for(&err) {
                            let _ = session
                                .send_message(Message::Notification(notification))
                                .await;
                        }
                        warn!("{}", err);
                        self.poller_tx.send(session.config.clone())?;
                        let graceful_restart = match err {
                            // A deconfigured peer's routes go away for good
                            SessionError::Deconfigured => None,
                            _ => session.capabilities.graceful_restart,
                        };
                        ended_sessions.push(EndedPeer {
                            peer_ip: *remote_ip,
                            graceful_restart,
                        });
                    }
                }
            }
            // Remove ended sessions and alert handler for RIB removal
            if !ended_sessions.is_empty() {
                for ended in &ended_sessions {
                    sessions.remove(&ended.peer_ip);
                }
                return Ok(Some(SessionUpdate::Ended(ended_sessions)));
            }
        }

        match self.poller.get_connection().await {
            Ok(Some((stream, peer_config))) => {
                let mut sessions = self.sessions.lock().await;
                let remote_ip = stream.peer_addr().expect("Stream has remote peer").ip();
                if let Some(existing) = sessions.get(&remote_ip) {
                    if !self.resolve_collision(existing, remote_ip) {
                        warn!(
                            "Connection collision with {}: closing the new connection",
                            remote_ip,
                        );
                        let mut protocol: MessageProtocol =
                            Framed::new(stream, MessageCodec::new());
                        close_with_cease(&mut protocol).await;
                        return Ok(None);
                    }
                    debug!(
                        "Connection collision with {}: replacing the local connection",
                        remote_ip,
                    );
                    sessions.remove(&remote_ip);
                }
                let protocol = Framed::new(stream, MessageCodec::new());
                let mut new_session = Session::new(Arc::clone(&peer_config), protocol);
                if let Some(gr) = &self.config.features.graceful_restart {
                    new_session.enable_graceful_restart(gr.restart_time);
                }
                info!("New session started: {}", remote_ip);
                sessions.insert(remote_ip, new_session);
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Decide a connection collision (RFC 4271 6.8). Returns true when the
    /// existing local connection should yield to the new one.
    fn resolve_collision(&self, existing: &Session, remote_ip: IpAddr) -> bool {
        match existing.state() {
            // A settled session always wins
            SessionState::Established => false,
            // During the OPEN exchange the lower BGP identifier closes its
            // own connection; before the peer's OPEN we keep the existing
            SessionState::OpenSent | SessionState::OpenConfirm => {
                let local_id = existing.config.local_router_id;
                let remote_id = existing.router_id;
                if remote_id == local_id {
                    return false;
                }
                let replace = collision_close_local(local_id, remote_id)
                    && existing.is_locally_initiated();
                if replace {
                    debug!("Collision with {}: local id {} yields to {}", remote_ip, local_id, remote_id);
                }
                replace
            }
            _ => true,
        }
    }
}

async fn close_with_cease(protocol: &mut MessageProtocol) {
    use futures::SinkExt;
    let notification = super::msg::Notification {
        major_err_code: 6,
        minor_err_code: cease_subcode::CONNECTION_COLLISION_RESOLUTION,
        data: vec![],
    };
    let _ = protocol.send(Message::Notification(notification)).await;
}
