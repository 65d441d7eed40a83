//! Huddle nearby-session engine.
//! Transport-driven: the engine does no I/O itself; an injected transport reports events
//! and one coordinator task applies them in order.

pub mod delegate;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod wire;

pub use delegate::{AcceptDelegate, BrowserDelegate, DataDelegate, StateDelegate};
pub use error::CommsError;
pub use peer::{ConnectionState, PeerInfo};
pub use protocol::{payload, Message, Payload, Value, DISCONNECT, PROTOCOL_VERSION};
pub use wire::{FrameDecodeError, FrameEncodeError};
pub use coordinator::{Coordinator, Notification};
pub use discovery::{HandlerState, Role};
pub use service::{CommsService, Delegates, WeakCommsService};
pub use transport::{
    EventSink, PeerHandle, SessionId, SessionRef, SessionState, Transport, TransportError,
    TransportEvent, TransportSession,
};

pub mod coordinator;
pub mod discovery;
pub mod loopback;
pub mod service;
pub mod session;
pub mod transport;
