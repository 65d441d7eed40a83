//! Injected transport capability: advertise/browse, open sessions, move bytes.
//! The engine never does I/O itself; a transport reports back through an [`EventSink`].

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::coordinator::Event;

/// Transport-level address of a remote device. Only `name` is meaningful to the engine;
/// `token` is whatever the transport needs to reach the device again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    name: String,
    token: u64,
}

impl PeerHandle {
    pub fn new(name: impl Into<String>, token: u64) -> Self {
        Self {
            name: name.into(),
            token,
        }
    }

    /// Stable device name; the peer identity.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

/// Session state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    NotConnected,
}

pub type SessionId = u64;

/// One live conversation with one peer.
pub trait TransportSession: Send + Sync + fmt::Debug {
    fn id(&self) -> SessionId;
    /// Queue bytes for the peer. May fail; callers treat sends as best-effort.
    fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;
    /// End the session after queued writes are flushed. The transport then reports
    /// `NotConnected` for it.
    fn close(&self);
}

pub type SessionRef = Arc<dyn TransportSession>;

/// Callbacks from the transport. May be produced on any thread.
#[derive(Debug)]
pub enum TransportEvent {
    PeerFound(PeerHandle),
    PeerLost(PeerHandle),
    /// Inbound session request (advertiser only). Answer on `reply`; `true` accepts.
    Invitation {
        handle: PeerHandle,
        context: Option<Vec<u8>>,
        session: SessionRef,
        reply: oneshot::Sender<bool>,
    },
    SessionStateChanged {
        handle: PeerHandle,
        session: SessionRef,
        state: SessionState,
    },
    DataReceived {
        handle: PeerHandle,
        session: SessionId,
        bytes: Vec<u8>,
    },
}

/// Where a transport posts its events. Cheap to clone; does not keep the engine alive.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::WeakUnboundedSender<Event>,
}

impl EventSink {
    /// Sink feeding `tx`. The engine builds its own; this is for hosts that drive a
    /// transport directly.
    pub fn new(tx: &mpsc::UnboundedSender<Event>) -> Self {
        Self { tx: tx.downgrade() }
    }

    /// Post an event. Returns false once the engine has shut down.
    pub fn emit(&self, event: TransportEvent) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(Event::Transport(event)).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// What the engine requires from the byte-moving layer.
pub trait Transport: Send {
    /// Called once, before any other method, with the sink for all callbacks.
    fn bind(&mut self, events: EventSink);
    fn advertise(&mut self, service: &str) -> Result<(), TransportError>;
    fn stop_advertising(&mut self);
    /// Start browsing. Restarting reports every visible peer again.
    fn browse(&mut self, service: &str) -> Result<(), TransportError>;
    fn stop_browsing(&mut self);
    fn open_session(
        &mut self,
        peer: &PeerHandle,
        context: Option<Vec<u8>>,
    ) -> Result<SessionRef, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("session closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
