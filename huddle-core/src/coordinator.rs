//! Connection coordinator: the single writer of peer and session state.
//! The service task feeds it events; it drives the transport and returns the
//! notifications to deliver once the step is complete.

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::discovery::{Discovery, HandlerState, Role};
use crate::error::CommsError;
use crate::peer::{ConnectionState, PeerInfo, PeerRecord, PeerTable};
use crate::protocol::{InviteContext, Message, Payload, DISCONNECT};
use crate::session::SessionTable;
use crate::transport::{
    PeerHandle, SessionId, SessionRef, SessionState, Transport, TransportEvent,
};
use crate::wire;

/// Reason sent to a peer whose session we never asked for.
pub const UNEXPECTED_CONNECTION: &str = "Unexpected connection";
/// Reason sent to every peer when the service stops.
pub const STOPPED: &str = "Stopped";
const RESET: &str = "Reset";

/// Application calls, posted to the service task.
#[derive(Debug)]
pub enum Command {
    Start(oneshot::Sender<Result<(), CommsError>>),
    Stop(oneshot::Sender<()>),
    Reset,
    Connect {
        peer: String,
        player_identity: Option<String>,
        player_name: Option<String>,
        reconnect: bool,
    },
    Disconnect {
        peer: String,
        reason: Option<String>,
        reconnect: bool,
    },
    Send {
        descriptor: String,
        payload: Option<Payload>,
        to: Option<String>,
        match_player: Option<String>,
    },
    ConnectionCount(oneshot::Sender<usize>),
    Peers(oneshot::Sender<Vec<PeerInfo>>),
    State(oneshot::Sender<HandlerState>),
}

/// Everything the service task consumes, in arrival order.
#[derive(Debug)]
pub enum Event {
    Transport(TransportEvent),
    Command(Command),
}

/// Delegate callbacks produced by one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    PeerFound(PeerInfo),
    PeerLost(PeerInfo),
    Error(String),
    StateChanged(PeerInfo),
    DataReceived {
        descriptor: String,
        payload: Option<Payload>,
        from: PeerInfo,
    },
}

/// Context payload for a session request, built from the record's player metadata.
pub(crate) fn invite_context(record: &PeerRecord) -> Option<Vec<u8>> {
    let ctx = InviteContext {
        player: record.player_name.clone(),
        email: record.player_identity.clone(),
        reconnect: Some(record.should_reconnect),
    };
    match wire::encode_context(&ctx) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(peer = record.identity(), error = %e, "failed to encode invitation context");
            None
        }
    }
}

/// Main coordinator. Host passes events; coordinator returns notifications.
pub struct Coordinator {
    pub(crate) role: Role,
    pub(crate) discovery: Discovery,
    pub(crate) peers: PeerTable,
    pub(crate) sessions: SessionTable,
    pub(crate) transport: Box<dyn Transport>,
}

impl Coordinator {
    pub fn new(role: Role, service: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            role,
            discovery: Discovery::new(service),
            peers: PeerTable::new(),
            sessions: SessionTable::new(),
            transport,
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn state(&self) -> HandlerState {
        self.discovery.state()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.snapshot()
    }

    pub fn peer(&self, identity: &str) -> Option<PeerInfo> {
        self.peers.get(identity).map(PeerRecord::info)
    }

    /// Armed reconnect policy of a peer, if known.
    pub fn reconnect_armed(&self, identity: &str) -> Option<bool> {
        self.peers.get(identity).map(PeerRecord::reconnect)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of peers with an established session.
    pub fn connection_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|r| r.state == ConnectionState::Connected && self.sessions.contains(r.identity()))
            .count()
    }

    /// Apply one event. Delegates are not called here; the caller dispatches the result.
    pub fn handle(&mut self, event: Event) -> Vec<Notification> {
        match event {
            Event::Transport(ev) => self.on_transport_event(ev),
            Event::Command(cmd) => self.on_command(cmd),
        }
    }

    fn on_command(&mut self, cmd: Command) -> Vec<Notification> {
        match cmd {
            Command::Start(reply) => {
                let _ = reply.send(self.start());
                Vec::new()
            }
            Command::Stop(reply) => {
                let out = self.stop();
                let _ = reply.send(());
                out
            }
            Command::Reset => self.reset(),
            Command::Connect {
                peer,
                player_identity,
                player_name,
                reconnect,
            } => self.connect(&peer, player_identity, player_name, reconnect),
            Command::Disconnect {
                peer,
                reason,
                reconnect,
            } => self.disconnect(&peer, reason, reconnect),
            Command::Send {
                descriptor,
                payload,
                to,
                match_player,
            } => {
                self.send(&descriptor, payload, to.as_deref(), match_player.as_deref());
                Vec::new()
            }
            Command::ConnectionCount(reply) => {
                let _ = reply.send(self.connection_count());
                Vec::new()
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.peers());
                Vec::new()
            }
            Command::State(reply) => {
                let _ = reply.send(self.state());
                Vec::new()
            }
        }
    }

    pub fn on_transport_event(&mut self, event: TransportEvent) -> Vec<Notification> {
        let mut out = Vec::new();
        match event {
            TransportEvent::PeerFound(handle) => self.on_peer_found(handle, &mut out),
            TransportEvent::PeerLost(handle) => self.on_peer_lost(handle, &mut out),
            TransportEvent::Invitation {
                handle,
                context,
                session,
                reply,
            } => self.on_invitation(handle, context, session, reply, &mut out),
            TransportEvent::SessionStateChanged {
                handle,
                session,
                state,
            } => self.on_session_state(handle, session, state, &mut out),
            TransportEvent::DataReceived {
                handle,
                session,
                bytes,
            } => self.on_data(handle, session, &bytes, &mut out),
        }
        out
    }

    pub fn start(&mut self) -> Result<(), CommsError> {
        self.discovery.start(&self.role, self.transport.as_mut())
    }

    /// End every session, forget every peer, stop discovery. Safe to repeat.
    pub fn stop(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        let frame = match wire::disconnect_frame(Some(STOPPED)) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(error = %e, "failed to encode disconnect");
                None
            }
        };
        for (identity, session) in self.sessions.drain() {
            if let Some(frame) = &frame {
                if let Err(e) = session.send(frame) {
                    debug!(peer = %identity, error = %e, "disconnect not delivered");
                }
            }
            session.close();
        }
        for mut record in self.peers.drain() {
            if record.state != ConnectionState::NotConnected {
                record.state = ConnectionState::NotConnected;
                record.last_disconnect_reason = Some(STOPPED.into());
                out.push(Notification::StateChanged(record.info()));
            }
        }
        self.discovery.stop(self.transport.as_mut());
        out
    }

    /// End every session without a goodbye. Remote peers see signal loss and come back on
    /// their own; a client also starts browsing afresh.
    pub fn reset(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        for (_, session) in self.sessions.drain() {
            session.close();
        }
        for mut record in self.peers.drain() {
            if record.state != ConnectionState::NotConnected {
                record.state = ConnectionState::NotConnected;
                record.last_disconnect_reason = Some(RESET.into());
                out.push(Notification::StateChanged(record.info()));
            }
        }
        if self.role.is_client() {
            if let Err(e) = self.discovery.restart(self.transport.as_mut()) {
                warn!(error = %e, "failed to resume browsing after reset");
                out.push(Notification::Error(format!("Failed to resume browsing: {e}")));
            }
        }
        info!(role = ?self.role, "sessions reset");
        out
    }

    pub fn connect(
        &mut self,
        peer: &str,
        player_identity: Option<String>,
        player_name: Option<String>,
        reconnect: bool,
    ) -> Vec<Notification> {
        let mut out = Vec::new();
        let Some(record) = self.peers.get_mut(peer) else {
            warn!(peer, "connect to unknown peer");
            out.push(Notification::Error(format!("Unknown peer {peer}")));
            return out;
        };
        if let Some(old) = self.sessions.remove(peer) {
            debug!(peer, "closing previous session before reconnecting");
            old.close();
        }
        record.player_identity = player_identity;
        record.player_name = player_name;
        record.should_reconnect = reconnect;
        let context = invite_context(record);
        match self.transport.open_session(record.handle(), context) {
            Ok(session) => {
                info!(peer, reconnect, "connecting");
                record.state = ConnectionState::Connecting;
                record.last_disconnect_reason = None;
                self.sessions.insert(peer, session);
            }
            Err(e) => {
                warn!(peer, error = %e, "failed to open session");
                record.state = ConnectionState::NotConnected;
                out.push(Notification::Error(format!("Failed to connect to {peer}: {e}")));
            }
        }
        out
    }

    /// Ask `peer` to hang up. The transport's `NotConnected` drives the local teardown.
    pub fn disconnect(
        &mut self,
        peer: &str,
        reason: Option<String>,
        reconnect: bool,
    ) -> Vec<Notification> {
        let mut out = Vec::new();
        let Some(record) = self.peers.get_mut(peer) else {
            debug!(peer, "disconnect from unknown peer ignored");
            return out;
        };
        record.should_reconnect = reconnect;
        if !reconnect {
            record.disarm();
        }
        record.last_disconnect_reason = reason.clone();

        if let Some(session) = self.sessions.get(peer) {
            match wire::disconnect_frame(reason.as_deref()) {
                Ok(frame) => {
                    if let Err(e) = session.send(&frame) {
                        debug!(peer, error = %e, "disconnect not delivered");
                    }
                }
                Err(e) => warn!(peer, error = %e, "failed to encode disconnect"),
            }
            info!(peer, ?reason, "disconnecting");
            session.close();
            return out;
        }

        // Nothing in flight: a pending reconnect is the only thing left to cancel.
        if !record.reconnect() && record.state != ConnectionState::NotConnected {
            record.state = ConnectionState::NotConnected;
            out.push(Notification::StateChanged(record.info()));
            self.peers.remove(peer);
            self.resume_discovery(&mut out);
        }
        out
    }

    /// Best-effort send. Without `to`, every connected session whose peer matches
    /// `match_player` (or every one, without a filter) receives the message.
    pub fn send(
        &mut self,
        descriptor: &str,
        payload: Option<Payload>,
        to: Option<&str>,
        match_player: Option<&str>,
    ) {
        if descriptor == DISCONNECT {
            warn!(descriptor, "reserved descriptor cannot be sent by the application");
            return;
        }
        let frame = match wire::encode_message(&Message::new(descriptor, payload)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(descriptor, error = %e, "failed to encode message; nothing sent");
                return;
            }
        };
        let targets: Vec<(String, SessionRef)> = match to {
            Some(peer) => self
                .sessions
                .get(peer)
                .map(|s| vec![(peer.to_owned(), s.clone())])
                .unwrap_or_default(),
            None => self
                .sessions
                .snapshot()
                .into_iter()
                .filter(|(identity, _)| {
                    self.peers.get(identity).is_some_and(|r| {
                        r.state == ConnectionState::Connected
                            && match_player
                                .map_or(true, |m| r.player_identity.as_deref() == Some(m))
                    })
                })
                .collect(),
        };
        if targets.is_empty() {
            debug!(descriptor, ?to, "no session to send to");
        }
        for (identity, session) in targets {
            if let Err(e) = session.send(&frame) {
                warn!(peer = %identity, descriptor, error = %e, "send failed");
            }
        }
    }

    fn on_session_state(
        &mut self,
        handle: PeerHandle,
        session: SessionRef,
        state: SessionState,
        out: &mut Vec<Notification>,
    ) {
        let identity = handle.name();
        if !self.peers.contains(identity) || !self.sessions.is_current(identity, session.id()) {
            if state == SessionState::NotConnected {
                debug!(peer = identity, session = session.id(), "stale session closed");
            } else {
                warn!(peer = identity, ?state, "session for unexpected peer; disconnecting");
                self.reject_unexpected(identity, &session);
            }
            return;
        }
        let Some(record) = self.peers.get_mut(identity) else {
            return;
        };
        match state {
            SessionState::Connecting => {
                record.state = ConnectionState::Connecting;
                out.push(Notification::StateChanged(record.info()));
            }
            SessionState::Connected => {
                record.state = ConnectionState::Connected;
                record.arm();
                record.last_disconnect_reason = None;
                info!(peer = identity, reconnect = record.reconnect(), "connected");
                out.push(Notification::StateChanged(record.info()));
                if self.role.is_client() {
                    self.discovery.pause(self.transport.as_mut());
                }
            }
            SessionState::NotConnected => {
                self.sessions.remove(identity);
                self.end_session(identity, out);
            }
        }
    }

    /// The session for `identity` is gone: either wait for the peer to come back or forget it.
    pub(crate) fn end_session(&mut self, identity: &str, out: &mut Vec<Notification>) {
        let Some(record) = self.peers.get_mut(identity) else {
            return;
        };
        if record.reconnect() {
            info!(peer = identity, "connection lost; waiting to reconnect");
            record.state = ConnectionState::Reconnecting;
            out.push(Notification::StateChanged(record.info()));
        } else {
            info!(peer = identity, reason = ?record.last_disconnect_reason, "disconnected");
            record.state = ConnectionState::NotConnected;
            out.push(Notification::StateChanged(record.info()));
            self.peers.remove(identity);
        }
        self.resume_discovery(out);
    }

    /// Client with nothing connected: browse again so lost peers can be re-found.
    fn resume_discovery(&mut self, out: &mut Vec<Notification>) {
        if !self.role.is_client()
            || self.discovery.state() != HandlerState::Browsing
            || self.connection_count() > 0
        {
            return;
        }
        if let Err(e) = self.discovery.restart(self.transport.as_mut()) {
            warn!(error = %e, "failed to resume browsing");
            out.push(Notification::Error(format!("Failed to resume browsing: {e}")));
        }
    }

    fn reject_unexpected(&self, identity: &str, session: &SessionRef) {
        match wire::disconnect_frame(Some(UNEXPECTED_CONNECTION)) {
            Ok(frame) => {
                if let Err(e) = session.send(&frame) {
                    debug!(peer = identity, error = %e, "disconnect not delivered");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode disconnect"),
        }
        session.close();
    }

    fn on_data(
        &mut self,
        handle: PeerHandle,
        session: SessionId,
        bytes: &[u8],
        out: &mut Vec<Notification>,
    ) {
        let identity = handle.name();
        if !self.sessions.is_current(identity, session) {
            debug!(peer = identity, session, "data from stale session dropped");
            return;
        }
        let messages = match wire::decode_frames(bytes) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(peer = identity, error = %e, "undecodable data dropped");
                return;
            }
        };
        for msg in messages {
            if msg.is_disconnect() {
                let reason = msg.reason().map(str::to_owned);
                self.on_remote_disconnect(identity, reason, out);
                return;
            }
            let Some(record) = self.peers.get(identity) else {
                return;
            };
            out.push(Notification::DataReceived {
                descriptor: msg.descriptor,
                payload: msg.payload,
                from: record.info(),
            });
        }
    }

    /// Peer hung up: never reconnect on our own, and tell the application why.
    fn on_remote_disconnect(
        &mut self,
        identity: &str,
        reason: Option<String>,
        out: &mut Vec<Notification>,
    ) {
        info!(peer = identity, ?reason, "peer disconnected");
        if let Some(session) = self.sessions.remove(identity) {
            session.close();
        }
        if let Some(mut record) = self.peers.remove(identity) {
            record.disarm();
            record.state = ConnectionState::NotConnected;
            record.last_disconnect_reason = reason;
            out.push(Notification::StateChanged(record.info()));
        }
        self.resume_discovery(out);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;
    use crate::delegate::AcceptDelegate;
    use crate::protocol::{payload, Value};
    use crate::transport::mock::{Call, CallLog, MockSession, MockTransport};
    use crate::transport::TransportSession;

    struct Harness {
        core: Coordinator,
        log: CallLog,
        opened: Arc<std::sync::Mutex<Vec<Arc<MockSession>>>>,
        fail_open: Arc<std::sync::atomic::AtomicBool>,
        /// Ids for inbound sessions; kept clear of the ids `open_session` hands out.
        next_inbound: u64,
    }

    impl Harness {
        fn new(role: Role) -> Self {
            let transport = MockTransport::new();
            let log = transport.log.clone();
            let opened = transport.opened.clone();
            let fail_open = transport.fail_open.clone();
            let mut core = Coordinator::new(role, "huddle", Box::new(transport));
            core.start().unwrap();
            log.lock().unwrap().clear();
            Self {
                core,
                log,
                opened,
                fail_open,
                next_inbound: 1000,
            }
        }

        fn calls(&self) -> Vec<Call> {
            std::mem::take(&mut *self.log.lock().unwrap())
        }

        fn last_opened(&self) -> Arc<MockSession> {
            self.opened.lock().unwrap().last().unwrap().clone()
        }

        fn found(&mut self, name: &str, token: u64) -> Vec<Notification> {
            self.core
                .on_transport_event(TransportEvent::PeerFound(PeerHandle::new(name, token)))
        }

        fn state(&mut self, name: &str, session: &Arc<MockSession>, state: SessionState) -> Vec<Notification> {
            self.core.on_transport_event(TransportEvent::SessionStateChanged {
                handle: PeerHandle::new(name, 1),
                session: session.clone(),
                state,
            })
        }

        fn data(&mut self, name: &str, session: &Arc<MockSession>, bytes: Vec<u8>) -> Vec<Notification> {
            self.core.on_transport_event(TransportEvent::DataReceived {
                handle: PeerHandle::new(name, 1),
                session: session.id(),
                bytes,
            })
        }

        fn invite(
            &mut self,
            name: &str,
            ctx: Option<InviteContext>,
        ) -> (Arc<MockSession>, oneshot::Receiver<bool>, Vec<Notification>) {
            self.next_inbound += 1;
            let session = MockSession::new(self.next_inbound, self.log.clone());
            let (reply, rx) = oneshot::channel();
            let context = ctx.map(|c| wire::encode_context(&c).unwrap());
            let out = self.core.on_transport_event(TransportEvent::Invitation {
                handle: PeerHandle::new(name, 1),
                context,
                session: session.clone(),
                reply,
            });
            (session, rx, out)
        }

        /// Client: discover and fully connect `name`.
        fn connected_client_peer(&mut self, name: &str, reconnect: bool) -> Arc<MockSession> {
            self.found(name, 1);
            self.core.connect(name, None, None, reconnect);
            let s = self.last_opened();
            self.state(name, &s, SessionState::Connecting);
            self.state(name, &s, SessionState::Connected);
            self.calls();
            s
        }
    }

    fn decoded(bytes: &[u8]) -> Vec<Message> {
        wire::decode_frames(bytes).unwrap()
    }

    fn states(out: &[Notification]) -> Vec<(String, ConnectionState, Option<String>)> {
        out.iter()
            .filter_map(|n| match n {
                Notification::StateChanged(p) => {
                    Some((p.device_name.clone(), p.state, p.reason.clone()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn found_peer_is_surfaced_once() {
        let mut h = Harness::new(Role::Client);
        let out = h.found("table", 1);
        assert!(matches!(&out[..], [Notification::PeerFound(p)] if p.device_name == "table"));
        assert!(h.found("table", 2).is_empty());
        assert_eq!(h.core.peers().len(), 1);
    }

    #[test]
    fn connect_to_unknown_peer_reports_error() {
        let mut h = Harness::new(Role::Client);
        let out = h.core.connect("ghost", None, None, true);
        assert!(matches!(&out[..], [Notification::Error(m)] if m.contains("ghost")));
        assert!(h.calls().is_empty());
        assert_eq!(h.core.session_count(), 0);
    }

    #[test]
    fn connect_sends_player_context() {
        let mut h = Harness::new(Role::Client);
        h.found("table", 1);
        h.core
            .connect("table", Some("ada@example.com".into()), Some("Ada".into()), true);
        let calls = h.calls();
        let Call::Open(name, Some(ctx)) = &calls[0] else {
            panic!("expected open with context, got {calls:?}");
        };
        assert_eq!(name, "table");
        let ctx = wire::decode_context(ctx).unwrap();
        assert_eq!(ctx.player.as_deref(), Some("Ada"));
        assert_eq!(ctx.email.as_deref(), Some("ada@example.com"));
        assert_eq!(ctx.reconnect, Some(true));
        assert_eq!(h.core.peer("table").unwrap().state, ConnectionState::Connecting);
        assert_eq!(h.core.session_count(), 1);
    }

    #[test]
    fn connect_failure_reports_error_and_keeps_no_session() {
        let mut h = Harness::new(Role::Client);
        h.found("table", 1);
        h.fail_open.store(true, Ordering::SeqCst);
        let out = h.core.connect("table", None, None, true);
        assert!(matches!(&out[..], [Notification::Error(_)]));
        assert_eq!(h.core.session_count(), 0);
        assert_eq!(h.core.peer("table").unwrap().state, ConnectionState::NotConnected);
    }

    #[test]
    fn unknown_peer_state_change_sends_single_disconnect() {
        let mut h = Harness::new(Role::Client);
        let stray = MockSession::new(77, h.log.clone());
        let out = h.state("intruder", &stray, SessionState::Connected);
        assert!(out.is_empty());
        assert!(h.core.peer("intruder").is_none());
        let calls = h.calls();
        assert_eq!(calls.len(), 2, "{calls:?}");
        let Call::Send(77, bytes) = &calls[0] else {
            panic!("expected send, got {calls:?}");
        };
        let msgs = decoded(bytes);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].is_disconnect());
        assert_eq!(msgs[0].reason(), Some(UNEXPECTED_CONNECTION));
        assert_eq!(calls[1], Call::Close(77));
    }

    #[test]
    fn unknown_peer_closing_is_ignored() {
        let mut h = Harness::new(Role::Client);
        let stray = MockSession::new(77, h.log.clone());
        assert!(h.state("intruder", &stray, SessionState::NotConnected).is_empty());
        assert!(h.calls().is_empty());
    }

    #[test]
    fn failed_attempt_never_reconnects() {
        let mut h = Harness::new(Role::Client);
        h.found("table", 1);
        h.core.connect("table", None, None, true);
        let s = h.last_opened();
        assert_eq!(h.core.reconnect_armed("table"), Some(false));

        let out = h.state("table", &s, SessionState::NotConnected);
        assert_eq!(
            states(&out),
            vec![("table".to_string(), ConnectionState::NotConnected, None)]
        );
        assert!(h.core.peer("table").is_none());
        assert_eq!(h.core.session_count(), 0);

        // Rediscovery is a plain "peer found", not an automatic reconnect.
        h.calls();
        let out = h.found("table", 2);
        assert!(matches!(&out[..], [Notification::PeerFound(_)]));
        assert!(!h.calls().iter().any(|c| matches!(c, Call::Open(..))));
    }

    #[test]
    fn connected_arms_reconnect_and_pauses_browsing() {
        let mut h = Harness::new(Role::Client);
        h.found("table", 1);
        h.core.connect("table", None, None, true);
        let s = h.last_opened();
        h.calls();
        let out = h.state("table", &s, SessionState::Connected);
        assert_eq!(
            states(&out),
            vec![("table".to_string(), ConnectionState::Connected, None)]
        );
        assert_eq!(h.core.reconnect_armed("table"), Some(true));
        assert_eq!(h.core.connection_count(), 1);
        assert_eq!(h.calls(), vec![Call::StopBrowsing]);
    }

    #[test]
    fn signal_loss_with_armed_reconnect_is_transient() {
        let mut h = Harness::new(Role::Client);
        let s = h.connected_client_peer("table", true);
        let out = h.state("table", &s, SessionState::NotConnected);
        assert_eq!(
            states(&out),
            vec![("table".to_string(), ConnectionState::Reconnecting, None)]
        );
        assert_eq!(h.core.session_count(), 0);
        assert_eq!(h.calls(), vec![Call::Browse("huddle".into())]);

        // Rediscovery reconnects without surfacing "peer found".
        let out = h.found("table", 9);
        assert!(out.is_empty());
        let calls = h.calls();
        assert!(matches!(&calls[..], [Call::Open(name, Some(_))] if name == "table"));
        assert_eq!(h.core.peer("table").unwrap().state, ConnectionState::Connecting);
        assert_eq!(h.core.session_count(), 1);
    }

    #[test]
    fn auto_reconnect_rejected_by_transport_restarts_browsing() {
        let mut h = Harness::new(Role::Client);
        let s = h.connected_client_peer("table", true);
        h.state("table", &s, SessionState::NotConnected);
        h.calls();
        h.fail_open.store(true, Ordering::SeqCst);
        let out = h.found("table", 2);
        assert_eq!(
            states(&out),
            vec![("table".to_string(), ConnectionState::Reconnecting, None)]
        );
        assert_eq!(
            h.calls(),
            vec![Call::StopBrowsing, Call::Browse("huddle".into())]
        );
        assert_eq!(h.core.session_count(), 0);
    }

    #[test]
    fn peer_lost_depends_on_armed_reconnect() {
        let mut h = Harness::new(Role::Client);
        h.found("idle", 1);
        let out = h
            .core
            .on_transport_event(TransportEvent::PeerLost(PeerHandle::new("idle", 1)));
        assert!(matches!(&out[..], [Notification::PeerLost(p)] if p.device_name == "idle"));
        assert!(h.core.peer("idle").is_none());

        let s = h.connected_client_peer("table", true);
        h.state("table", &s, SessionState::NotConnected);
        // Browsing resumed; the peer now drops out of range entirely.
        h.core
            .on_transport_event(TransportEvent::PeerFound(PeerHandle::new("table", 3)));
        let s2 = h.last_opened();
        h.state("table", &s2, SessionState::NotConnected);
        let out = h
            .core
            .on_transport_event(TransportEvent::PeerLost(PeerHandle::new("table", 3)));
        assert!(out.is_empty(), "already reconnecting: {out:?}");
        assert!(h.core.peer("table").is_some());
    }

    #[test]
    fn lost_with_stale_handle_is_ignored() {
        let mut h = Harness::new(Role::Client);
        h.found("table", 1);
        h.found("table", 2);
        let out = h
            .core
            .on_transport_event(TransportEvent::PeerLost(PeerHandle::new("table", 1)));
        assert!(out.is_empty());
        assert!(h.core.peer("table").is_some());
    }

    #[test]
    fn disconnect_requests_teardown_and_waits_for_transport() {
        let mut h = Harness::new(Role::Client);
        let s = h.connected_client_peer("table", true);
        let out = h.core.disconnect("table", Some("Game over".to_string()), false);
        assert!(out.is_empty());
        let calls = h.calls();
        let Call::Send(id, bytes) = &calls[0] else {
            panic!("expected disconnect message, got {calls:?}");
        };
        assert_eq!(*id, s.id());
        let msgs = decoded(bytes);
        assert!(msgs[0].is_disconnect());
        assert_eq!(msgs[0].reason(), Some("Game over"));
        assert_eq!(calls[1], Call::Close(s.id()));
        // Not torn down until the transport says so.
        assert_eq!(h.core.peer("table").unwrap().state, ConnectionState::Connected);
        assert_eq!(h.core.reconnect_armed("table"), Some(false));

        let out = h.state("table", &s, SessionState::NotConnected);
        assert_eq!(
            states(&out),
            vec![(
                "table".to_string(),
                ConnectionState::NotConnected,
                Some("Game over".to_string())
            )]
        );
        assert!(h.core.peer("table").is_none());
        assert_eq!(h.core.session_count(), 0);
    }

    #[test]
    fn disconnect_cancels_pending_reconnect() {
        let mut h = Harness::new(Role::Client);
        let s = h.connected_client_peer("table", true);
        h.state("table", &s, SessionState::NotConnected);
        let out = h.core.disconnect("table", Some("Leaving".into()), false);
        assert_eq!(
            states(&out),
            vec![(
                "table".to_string(),
                ConnectionState::NotConnected,
                Some("Leaving".to_string())
            )]
        );
        assert!(h.core.peer("table").is_none());
    }

    #[test]
    fn remote_disconnect_is_not_delivered_as_data() {
        let mut h = Harness::new(Role::Client);
        let s = h.connected_client_peer("table", true);
        let mut bytes = wire::encode_message(&Message::new(
            "score",
            Some(payload([("round", 3), ("value", 7)])),
        ))
        .unwrap();
        bytes.extend(wire::disconnect_frame(Some("Host left")).unwrap());
        let out = h.data("table", &s, bytes);
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0],
            Notification::DataReceived { descriptor, .. } if descriptor == "score"
        ));
        assert_eq!(
            states(&out),
            vec![(
                "table".to_string(),
                ConnectionState::NotConnected,
                Some("Host left".to_string())
            )]
        );
        assert!(h.core.peer("table").is_none());
        let calls = h.calls();
        assert!(calls.contains(&Call::Close(s.id())));
        assert!(calls.contains(&Call::Browse("huddle".into())));

        // The transport's own close for that session is now stale.
        assert!(h.state("table", &s, SessionState::NotConnected).is_empty());
    }

    #[test]
    fn null_payload_is_forwarded() {
        let mut h = Harness::new(Role::Client);
        let s = h.connected_client_peer("table", false);
        let bytes = wire::encode_batch(&[
            Message::new("ready", None),
            Message::new("bid", Some(payload([("amount", Value::Int(4))]))),
        ])
        .unwrap();
        let out = h.data("table", &s, bytes);
        assert_eq!(
            out,
            vec![
                Notification::DataReceived {
                    descriptor: "ready".into(),
                    payload: None,
                    from: h.core.peer("table").unwrap(),
                },
                Notification::DataReceived {
                    descriptor: "bid".into(),
                    payload: Some(payload([("amount", 4)])),
                    from: h.core.peer("table").unwrap(),
                },
            ]
        );
    }

    #[test]
    fn undecodable_or_stale_data_is_dropped() {
        let mut h = Harness::new(Role::Client);
        let s = h.connected_client_peer("table", false);
        assert!(h.data("table", &s, vec![1, 2, 3]).is_empty());
        let other = MockSession::new(500, h.log.clone());
        let bytes = wire::encode_message(&Message::new("x", None)).unwrap();
        assert!(h.data("table", &other, bytes).is_empty());
    }

    fn host_with_players(h: &mut Harness, players: &[(&str, &str)]) -> Vec<Arc<MockSession>> {
        players
            .iter()
            .map(|(name, email)| {
                let ctx = InviteContext {
                    player: Some(name.to_uppercase()),
                    email: Some((*email).into()),
                    reconnect: Some(true),
                };
                let (s, mut rx, _) = h.invite(name, Some(ctx));
                assert_eq!(rx.try_recv(), Ok(true));
                h.state(name, &s, SessionState::Connected);
                s
            })
            .collect()
    }

    #[test]
    fn invitation_records_player_context() {
        let mut h = Harness::new(Role::host());
        let sessions = host_with_players(&mut h, &[("phone-a", "a@x")]);
        let info = h.core.peer("phone-a").unwrap();
        assert_eq!(info.player_name.as_deref(), Some("PHONE-A"));
        assert_eq!(info.player_identity.as_deref(), Some("a@x"));
        assert_eq!(info.state, ConnectionState::Connected);
        assert_eq!(h.core.reconnect_armed("phone-a"), Some(true));
        assert_eq!(sessions.len(), 1);
        // Hosts keep advertising while connected.
        assert!(!h.calls().contains(&Call::StopAdvertising));
    }

    #[test]
    fn fresh_invitation_replaces_existing_session() {
        let mut h = Harness::new(Role::host());
        let (first, _rx1, _) = h.invite("phone", None);
        h.state("phone", &first, SessionState::Connected);
        h.calls();
        let (second, mut rx2, _) = h.invite("phone", None);
        assert_eq!(rx2.try_recv(), Ok(true));
        assert_eq!(h.calls(), vec![Call::Close(first.id())]);
        assert_eq!(h.core.session_count(), 1);

        // The old session's close must not tear down the new one.
        assert!(h.state("phone", &first, SessionState::NotConnected).is_empty());
        assert_eq!(h.core.peer("phone").unwrap().state, ConnectionState::Connecting);
        h.state("phone", &second, SessionState::Connected);
        assert_eq!(h.core.connection_count(), 1);
    }

    #[test]
    fn host_honours_invitation_without_reconnect() {
        let mut h = Harness::new(Role::host());
        let ctx = InviteContext {
            player: Some("Bo".into()),
            email: None,
            reconnect: Some(false),
        };
        let (s, mut rx, _) = h.invite("phone", Some(ctx));
        assert_eq!(rx.try_recv(), Ok(true));
        h.state("phone", &s, SessionState::Connected);
        assert_eq!(h.core.reconnect_armed("phone"), Some(false));

        let out = h.state("phone", &s, SessionState::NotConnected);
        assert_eq!(
            states(&out),
            vec![("phone".to_string(), ConnectionState::NotConnected, None)]
        );
        assert!(h.core.peer("phone").is_none());
        assert_eq!(h.core.session_count(), 0);
    }

    struct Refuse;
    impl AcceptDelegate for Refuse {
        fn should_accept(&self, peer: &PeerInfo) -> bool {
            peer.device_name != "banned"
        }
    }

    #[test]
    fn accept_delegate_can_refuse() {
        let mut h = Harness::new(Role::host_with(Arc::new(Refuse)));
        let (_, mut rx, out) = h.invite("banned", None);
        assert_eq!(rx.try_recv(), Ok(false));
        assert!(out.is_empty());
        assert!(h.core.peer("banned").is_none());
        assert_eq!(h.core.session_count(), 0);

        let (_, mut rx, _) = h.invite("friend", None);
        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[test]
    fn client_rejects_invitations() {
        let mut h = Harness::new(Role::Client);
        let (_, mut rx, _) = h.invite("phone", None);
        assert_eq!(rx.try_recv(), Ok(false));
        assert!(h.core.peer("phone").is_none());
    }

    #[test]
    fn broadcast_respects_player_filter_and_state() {
        let mut h = Harness::new(Role::host());
        let sessions = host_with_players(&mut h, &[("a", "a@x"), ("b", "b@x")]);
        let (pending, _rx, _) = h.invite("c", None);
        h.calls();

        h.core
            .send("score", Some(payload([("round", 1)])), None, Some("b@x"));
        let calls = h.calls();
        assert!(matches!(&calls[..], [Call::Send(id, _)] if *id == sessions[1].id()));

        h.core.send("score", None, None, None);
        let mut ids: Vec<u64> = h
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send(id, _) => Some(id),
                _ => None,
            })
            .collect();
        ids.sort();
        assert_eq!(ids, vec![sessions[0].id(), sessions[1].id()]);
        assert!(!ids.contains(&pending.id()));

        h.core.send("hint", None, Some("a"), None);
        assert!(matches!(&h.calls()[..], [Call::Send(id, _)] if *id == sessions[0].id()));
    }

    #[test]
    fn send_failures_and_reserved_descriptor_are_swallowed() {
        let mut h = Harness::new(Role::host());
        let sessions = host_with_players(&mut h, &[("a", "a@x"), ("b", "b@x")]);
        h.calls();
        sessions[0].fail_sends.store(true, Ordering::SeqCst);
        h.core.send("score", None, None, None);
        assert!(matches!(&h.calls()[..], [Call::Send(id, _)] if *id == sessions[1].id()));

        h.core.send(DISCONNECT, None, None, None);
        assert!(h.calls().is_empty());
    }

    #[test]
    fn oversized_message_is_sent_to_nobody() {
        let mut h = Harness::new(Role::host());
        host_with_players(&mut h, &[("a", "a@x"), ("b", "b@x")]);
        h.calls();
        let huge = payload([("blob", Value::Bytes(vec![0; 17 << 20]))]);
        h.core.send("blob", Some(huge), None, None);
        assert!(!h.calls().iter().any(|c| matches!(c, Call::Send(..))));
        assert_eq!(h.core.connection_count(), 2);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut h = Harness::new(Role::host());
        let sessions = host_with_players(&mut h, &[("a", "a@x"), ("b", "b@x")]);
        h.calls();
        let out = h.core.stop();
        assert_eq!(out.len(), 2);
        assert_eq!(h.core.peers().len(), 0);
        assert_eq!(h.core.session_count(), 0);
        assert_eq!(h.core.state(), HandlerState::NotStarted);
        let calls = h.calls();
        for s in &sessions {
            let sent = calls.iter().find_map(|c| match c {
                Call::Send(id, bytes) if *id == s.id() => Some(decoded(bytes)),
                _ => None,
            });
            assert_eq!(sent.unwrap()[0].reason(), Some(STOPPED));
            assert!(calls.contains(&Call::Close(s.id())));
        }
        assert!(calls.contains(&Call::StopAdvertising));

        assert!(h.core.stop().is_empty());
        assert!(h.calls().is_empty());
        assert!(h.core.start().is_ok());
    }

    #[test]
    fn client_reset_clears_and_browses_again() {
        let mut h = Harness::new(Role::Client);
        let s = h.connected_client_peer("table", true);
        let out = h.core.reset();
        assert_eq!(
            states(&out),
            vec![(
                "table".to_string(),
                ConnectionState::NotConnected,
                Some(RESET.to_string())
            )]
        );
        assert_eq!(
            h.calls(),
            vec![Call::Close(s.id()), Call::Browse("huddle".into())]
        );
        assert!(h.core.peers().is_empty());
        // Late close from the transport is stale.
        assert!(h.state("table", &s, SessionState::NotConnected).is_empty());
    }

    #[test]
    fn host_reset_sends_no_goodbye() {
        let mut h = Harness::new(Role::host());
        let sessions = host_with_players(&mut h, &[("a", "a@x")]);
        h.calls();
        h.core.reset();
        assert_eq!(h.calls(), vec![Call::Close(sessions[0].id())]);
        assert_eq!(h.core.state(), HandlerState::Advertising);
    }
}
