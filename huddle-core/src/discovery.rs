//! Discovery roles: the host advertises and answers invitations, the client browses and
//! re-finds peers it should reconnect to.

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::coordinator::{invite_context, Coordinator, Notification};
use crate::delegate::AcceptDelegate;
use crate::error::CommsError;
use crate::peer::ConnectionState;
use crate::protocol::InviteContext;
use crate::transport::{PeerHandle, SessionRef, Transport, TransportError};
use crate::wire;

/// Which side of discovery this node plays. Chosen once, at construction.
#[derive(Clone)]
pub enum Role {
    /// Advertise and accept inbound sessions. Without a delegate every request is accepted.
    Host {
        accept: Option<Arc<dyn AcceptDelegate>>,
    },
    /// Browse for hosts and connect to them.
    Client,
}

impl Role {
    pub fn host() -> Self {
        Role::Host { accept: None }
    }

    pub fn host_with(accept: Arc<dyn AcceptDelegate>) -> Self {
        Role::Host {
            accept: Some(accept),
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Role::Host { .. })
    }

    pub fn is_client(&self) -> bool {
        matches!(self, Role::Client)
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host { accept } => f
                .debug_struct("Host")
                .field("accept_delegate", &accept.is_some())
                .finish(),
            Role::Client => f.write_str("Client"),
        }
    }
}

/// Handler lifecycle, independent of any one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    NotStarted,
    Advertising,
    Browsing,
}

/// Advertise/browse bookkeeping against the transport.
#[derive(Debug)]
pub struct Discovery {
    service: String,
    state: HandlerState,
    /// Client only: browsing is suspended while a session is connected.
    paused: bool,
}

impl Discovery {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            state: HandlerState::NotStarted,
            paused: false,
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn start(&mut self, role: &Role, transport: &mut dyn Transport) -> Result<(), CommsError> {
        if self.state != HandlerState::NotStarted {
            return Err(CommsError::AlreadyStarted);
        }
        self.state = match role {
            Role::Host { .. } => {
                transport.advertise(&self.service)?;
                HandlerState::Advertising
            }
            Role::Client => {
                transport.browse(&self.service)?;
                HandlerState::Browsing
            }
        };
        self.paused = false;
        info!(service = %self.service, state = ?self.state, "discovery started");
        Ok(())
    }

    pub fn stop(&mut self, transport: &mut dyn Transport) {
        match self.state {
            HandlerState::NotStarted => return,
            HandlerState::Advertising => transport.stop_advertising(),
            HandlerState::Browsing if !self.paused => transport.stop_browsing(),
            HandlerState::Browsing => {}
        }
        self.state = HandlerState::NotStarted;
        self.paused = false;
        info!(service = %self.service, "discovery stopped");
    }

    /// Client connected to a host: no need to keep browsing.
    pub fn pause(&mut self, transport: &mut dyn Transport) {
        if self.state == HandlerState::Browsing && !self.paused {
            transport.stop_browsing();
            self.paused = true;
            debug!(service = %self.service, "browsing paused");
        }
    }

    /// Restart browsing so every visible peer is reported again.
    pub fn restart(&mut self, transport: &mut dyn Transport) -> Result<(), TransportError> {
        if self.state != HandlerState::Browsing {
            return Ok(());
        }
        if !self.paused {
            transport.stop_browsing();
        }
        if let Err(e) = transport.browse(&self.service) {
            self.paused = true;
            return Err(e);
        }
        self.paused = false;
        debug!(service = %self.service, "browsing restarted");
        Ok(())
    }
}

impl Coordinator {
    pub(crate) fn on_peer_found(&mut self, handle: PeerHandle, out: &mut Vec<Notification>) {
        if self.discovery.state() != HandlerState::Browsing {
            debug!(peer = handle.name(), "peer found while not browsing; ignored");
            return;
        }
        let identity = handle.name().to_owned();
        let (record, created) = self.peers.upsert(handle);
        if record.reconnect() && !self.sessions.contains(&identity) {
            self.auto_reconnect(&identity, out);
        } else if created {
            debug!(peer = %identity, "peer found");
            out.push(Notification::PeerFound(record.info()));
        }
    }

    fn auto_reconnect(&mut self, identity: &str, out: &mut Vec<Notification>) {
        let Some(record) = self.peers.get_mut(identity) else {
            return;
        };
        let context = invite_context(record);
        match self.transport.open_session(record.handle(), context) {
            Ok(session) => {
                info!(peer = identity, "peer rediscovered; reconnecting");
                record.state = ConnectionState::Connecting;
                self.sessions.insert(identity, session);
            }
            Err(e) => {
                warn!(peer = identity, error = %e, "automatic reconnect failed; restarting browse");
                record.state = ConnectionState::Reconnecting;
                out.push(Notification::StateChanged(record.info()));
                if let Err(e) = self.discovery.restart(self.transport.as_mut()) {
                    warn!(error = %e, "failed to restart browsing");
                }
            }
        }
    }

    pub(crate) fn on_peer_lost(&mut self, handle: PeerHandle, out: &mut Vec<Notification>) {
        let identity = handle.name();
        let Some(record) = self.peers.get_mut(identity) else {
            debug!(peer = identity, "unknown peer lost");
            return;
        };
        if record.handle() != &handle {
            debug!(peer = identity, "stale handle lost; peer was rediscovered");
            return;
        }
        if record.reconnect() {
            if record.state != ConnectionState::Reconnecting {
                record.state = ConnectionState::Reconnecting;
                out.push(Notification::StateChanged(record.info()));
            }
            return;
        }
        out.push(Notification::PeerLost(record.info()));
        // A live session keeps the record until the transport reports it closed.
        if !self.sessions.contains(identity) {
            self.peers.remove(identity);
        }
    }

    pub(crate) fn on_invitation(
        &mut self,
        handle: PeerHandle,
        context: Option<Vec<u8>>,
        session: SessionRef,
        reply: oneshot::Sender<bool>,
        out: &mut Vec<Notification>,
    ) {
        let accept = match (&self.role, self.discovery.state()) {
            (Role::Host { accept }, HandlerState::Advertising) => accept.clone(),
            _ => {
                warn!(peer = handle.name(), "invitation while not advertising; rejected");
                let _ = reply.send(false);
                return;
            }
        };
        let ctx = match context.as_deref().map(wire::decode_context) {
            Some(Ok(ctx)) => ctx,
            Some(Err(e)) => {
                warn!(peer = handle.name(), error = %e, "undecodable invitation context");
                InviteContext::default()
            }
            None => InviteContext::default(),
        };

        let identity = handle.name().to_owned();
        let replaced = self.sessions.remove(&identity);
        if let Some(old) = &replaced {
            info!(peer = %identity, "fresh invitation replaces existing session");
            old.close();
        }

        let (record, _) = self.peers.upsert(handle);
        record.player_name = ctx.player;
        record.player_identity = ctx.email;
        record.should_reconnect = ctx.reconnect.unwrap_or(true);
        record.last_disconnect_reason = None;

        let accepted = accept.map_or(true, |d| d.should_accept(&record.info()));
        if accepted {
            record.state = ConnectionState::Connecting;
            self.sessions.insert(&identity, session);
            let _ = reply.send(true);
            debug!(peer = %identity, "invitation accepted");
            return;
        }

        let _ = reply.send(false);
        info!(peer = %identity, "invitation rejected");
        if replaced.is_some() {
            self.end_session(&identity, out);
        } else if !record.reconnect() {
            self.peers.remove(&identity);
        }
    }
}
