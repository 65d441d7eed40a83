//! Delegate contract: how the application observes the engine.
//!
//! Delegates run on the engine task after each state step has completed. They may call
//! back into [`crate::CommsService`]; such calls are queued, never run inline.

use crate::peer::PeerInfo;
use crate::protocol::Payload;

/// Discovery events (browser role) and caller errors.
pub trait BrowserDelegate: Send + Sync {
    fn peer_found(&self, _peer: &PeerInfo) {}
    fn peer_lost(&self, _peer: &PeerInfo) {}
    fn error(&self, _message: &str) {}
}

/// Connection state changes. `peer.reason` carries the disconnect reason, if any.
pub trait StateDelegate: Send + Sync {
    fn state_changed(&self, peer: &PeerInfo);
}

/// Application messages. The reserved `"disconnect"` descriptor never reaches this.
pub trait DataDelegate: Send + Sync {
    fn data_received(&self, descriptor: &str, payload: Option<&Payload>, from: &PeerInfo);
}

/// Host only: decide whether to accept an inbound session. Called on the engine task,
/// so it must not block.
pub trait AcceptDelegate: Send + Sync {
    fn should_accept(&self, peer: &PeerInfo) -> bool;
}
