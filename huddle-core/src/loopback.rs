//! In-memory transport: any number of nodes on one simulated radio. Used by the
//! two-node tests and handy for driving the engine without a network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::oneshot;
use tracing::debug;

use crate::transport::{
    EventSink, PeerHandle, SessionId, SessionRef, SessionState, Transport, TransportError,
    TransportEvent, TransportSession,
};

type NodeId = u64;

struct Node {
    name: String,
    sink: Option<EventSink>,
    advertising: Option<String>,
    browsing: Option<String>,
}

/// One end of a session pair.
struct LinkEnd {
    owner: NodeId,
    remote: NodeId,
    partner: SessionId,
    session: Arc<LoopbackSession>,
    established: bool,
}

#[derive(Default)]
struct NetState {
    nodes: HashMap<NodeId, Node>,
    links: HashMap<SessionId, LinkEnd>,
    next_node: NodeId,
    next_session: SessionId,
}

impl NetState {
    fn handle_of(&self, node: NodeId) -> Option<PeerHandle> {
        self.nodes.get(&node).map(|n| PeerHandle::new(n.name.clone(), node))
    }

    fn emit(&self, node: NodeId, event: TransportEvent) {
        if let Some(sink) = self.nodes.get(&node).and_then(|n| n.sink.as_ref()) {
            sink.emit(event);
        }
    }

    fn report(&self, end: &LinkEnd, state: SessionState) {
        if let Some(handle) = self.handle_of(end.remote) {
            self.emit(
                end.owner,
                TransportEvent::SessionStateChanged {
                    handle,
                    session: end.session.clone(),
                    state,
                },
            );
        }
    }

    /// Invitation accepted: both ends become usable.
    fn establish(&mut self, session: SessionId) {
        let Some(partner) = self.links.get(&session).map(|e| e.partner) else {
            return;
        };
        if !self.links.contains_key(&partner) {
            return;
        }
        for id in [session, partner] {
            if let Some(end) = self.links.get_mut(&id) {
                end.established = true;
            }
        }
        if let Some(end) = self.links.get(&partner) {
            self.report(end, SessionState::Connecting);
            self.report(end, SessionState::Connected);
        }
        if let Some(end) = self.links.get(&session) {
            self.report(end, SessionState::Connected);
        }
    }

    /// Drop both ends of the pair through `session`; each side sees `NotConnected`.
    fn tear_down(&mut self, session: SessionId) -> bool {
        let Some(end) = self.links.remove(&session) else {
            return false;
        };
        let partner = self.links.remove(&end.partner);
        self.report(&end, SessionState::NotConnected);
        if let Some(partner) = partner {
            self.report(&partner, SessionState::NotConnected);
        }
        true
    }
}

fn lock(net: &Mutex<NetState>) -> MutexGuard<'_, NetState> {
    net.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared medium. Clone it to hand the same network to several tasks.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node named `device_name`. Names must be unique on one network.
    pub fn transport(&self, device_name: impl Into<String>) -> LoopbackTransport {
        let mut state = lock(&self.inner);
        state.next_node += 1;
        let id = state.next_node;
        state.nodes.insert(
            id,
            Node {
                name: device_name.into(),
                sink: None,
                advertising: None,
                browsing: None,
            },
        );
        LoopbackTransport {
            id,
            net: self.inner.clone(),
        }
    }

    /// Simulate signal loss between two nodes: every session between them ends with no
    /// goodbye. Returns the number of session pairs cut.
    pub fn sever(&self, a: &str, b: &str) -> usize {
        let mut state = lock(&self.inner);
        let id_of = |name: &str| {
            state
                .nodes
                .iter()
                .find(|(_, n)| n.name == name)
                .map(|(id, _)| *id)
        };
        let (Some(a), Some(b)) = (id_of(a), id_of(b)) else {
            return 0;
        };
        let doomed: Vec<SessionId> = state
            .links
            .iter()
            .filter(|(_, e)| e.owner == a && e.remote == b)
            .map(|(id, _)| *id)
            .collect();
        let cut = doomed
            .into_iter()
            .filter(|id| state.tear_down(*id))
            .count();
        debug!(cut, "loopback link severed");
        cut
    }
}

#[derive(Debug)]
pub struct LoopbackSession {
    id: SessionId,
    net: Weak<Mutex<NetState>>,
}

impl TransportSession for LoopbackSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let net = self.net.upgrade().ok_or(TransportError::Closed)?;
        let state = lock(&net);
        let end = state
            .links
            .get(&self.id)
            .filter(|e| e.established)
            .ok_or(TransportError::Closed)?;
        let handle = state.handle_of(end.owner).ok_or(TransportError::Closed)?;
        state.emit(
            end.remote,
            TransportEvent::DataReceived {
                handle,
                session: end.partner,
                bytes: bytes.to_vec(),
            },
        );
        Ok(())
    }

    fn close(&self) {
        if let Some(net) = self.net.upgrade() {
            lock(&net).tear_down(self.id);
        }
    }
}

/// One node on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    id: NodeId,
    net: Arc<Mutex<NetState>>,
}

impl Transport for LoopbackTransport {
    fn bind(&mut self, events: EventSink) {
        if let Some(node) = lock(&self.net).nodes.get_mut(&self.id) {
            node.sink = Some(events);
        }
    }

    fn advertise(&mut self, service: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.net);
        let me = state
            .handle_of(self.id)
            .ok_or_else(|| TransportError::Unavailable("node detached".into()))?;
        if let Some(node) = state.nodes.get_mut(&self.id) {
            node.advertising = Some(service.to_owned());
        }
        for (id, node) in &state.nodes {
            if *id != self.id && node.browsing.as_deref() == Some(service) {
                state.emit(*id, TransportEvent::PeerFound(me.clone()));
            }
        }
        Ok(())
    }

    fn stop_advertising(&mut self) {
        let mut state = lock(&self.net);
        let Some(me) = state.handle_of(self.id) else {
            return;
        };
        let Some(service) = state
            .nodes
            .get_mut(&self.id)
            .and_then(|n| n.advertising.take())
        else {
            return;
        };
        for (id, node) in &state.nodes {
            if *id != self.id && node.browsing.as_deref() == Some(service.as_str()) {
                state.emit(*id, TransportEvent::PeerLost(me.clone()));
            }
        }
    }

    fn browse(&mut self, service: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.net);
        let node = state
            .nodes
            .get_mut(&self.id)
            .ok_or_else(|| TransportError::Unavailable("node detached".into()))?;
        node.browsing = Some(service.to_owned());
        let visible: Vec<PeerHandle> = state
            .nodes
            .iter()
            .filter(|(id, n)| **id != self.id && n.advertising.as_deref() == Some(service))
            .map(|(id, n)| PeerHandle::new(n.name.clone(), *id))
            .collect();
        for handle in visible {
            state.emit(self.id, TransportEvent::PeerFound(handle));
        }
        Ok(())
    }

    fn stop_browsing(&mut self) {
        if let Some(node) = lock(&self.net).nodes.get_mut(&self.id) {
            node.browsing = None;
        }
    }

    fn open_session(
        &mut self,
        peer: &PeerHandle,
        context: Option<Vec<u8>>,
    ) -> Result<SessionRef, TransportError> {
        let mut state = lock(&self.net);
        let remote = peer.token();
        let reachable = state
            .nodes
            .get(&remote)
            .is_some_and(|n| n.name == peer.name() && n.advertising.is_some());
        if !reachable {
            return Err(TransportError::Unreachable(peer.name().to_owned()));
        }
        let me = state
            .handle_of(self.id)
            .ok_or_else(|| TransportError::Unavailable("node detached".into()))?;

        let local = state.next_session + 1;
        let inbound = state.next_session + 2;
        state.next_session += 2;
        let weak = Arc::downgrade(&self.net);
        let local_session = Arc::new(LoopbackSession {
            id: local,
            net: weak.clone(),
        });
        let inbound_session = Arc::new(LoopbackSession {
            id: inbound,
            net: weak,
        });
        state.links.insert(
            local,
            LinkEnd {
                owner: self.id,
                remote,
                partner: inbound,
                session: local_session.clone(),
                established: false,
            },
        );
        state.links.insert(
            inbound,
            LinkEnd {
                owner: remote,
                remote: self.id,
                partner: local,
                session: inbound_session.clone(),
                established: false,
            },
        );

        state.emit(
            self.id,
            TransportEvent::SessionStateChanged {
                handle: peer.clone(),
                session: local_session.clone(),
                state: SessionState::Connecting,
            },
        );
        let (reply, answer) = oneshot::channel();
        state.emit(
            remote,
            TransportEvent::Invitation {
                handle: me,
                context,
                session: inbound_session,
                reply,
            },
        );
        drop(state);

        let net = self.net.clone();
        tokio::spawn(async move {
            let accepted = answer.await.unwrap_or(false);
            let mut state = lock(&net);
            if accepted {
                state.establish(local);
            } else {
                debug!(session = local, "invitation declined");
                state.tear_down(local);
            }
        });
        Ok(local_session)
    }
}
