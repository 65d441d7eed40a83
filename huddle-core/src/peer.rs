//! Peer records: one per remote device identity.

use std::collections::HashMap;

use crate::transport::PeerHandle;

/// Per-peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Read-only snapshot of a peer handed to delegates and callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub device_name: String,
    pub player_identity: Option<String>,
    pub player_name: Option<String>,
    pub state: ConnectionState,
    pub reason: Option<String>,
}

/// Everything the engine knows about one remote device.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    handle: PeerHandle,
    pub player_identity: Option<String>,
    pub player_name: Option<String>,
    pub state: ConnectionState,
    /// Policy requested when the connection was initiated.
    pub should_reconnect: bool,
    /// Policy currently armed. Only set by a successful connection.
    reconnect: bool,
    pub last_disconnect_reason: Option<String>,
}

impl PeerRecord {
    pub fn new(handle: PeerHandle) -> Self {
        Self {
            handle,
            player_identity: None,
            player_name: None,
            state: ConnectionState::NotConnected,
            should_reconnect: false,
            reconnect: false,
            last_disconnect_reason: None,
        }
    }

    pub fn identity(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    /// Rediscovery replaces the transport handle; identity is unchanged.
    pub fn replace_handle(&mut self, handle: PeerHandle) {
        debug_assert_eq!(handle.name(), self.handle.name());
        self.handle = handle;
    }

    pub fn reconnect(&self) -> bool {
        self.reconnect
    }

    /// A connection succeeded: arm the requested policy.
    pub fn arm(&mut self) {
        self.reconnect = self.should_reconnect;
    }

    /// Explicit teardown: never come back on our own.
    pub fn disarm(&mut self) {
        self.reconnect = false;
        self.should_reconnect = false;
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            device_name: self.identity().to_owned(),
            player_identity: self.player_identity.clone(),
            player_name: self.player_name.clone(),
            state: self.state,
            reason: self.last_disconnect_reason.clone(),
        }
    }
}

/// Identity-keyed peer records. At most one record per identity.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record for `handle`, or replace the handle of the existing one.
    /// Returns the record and whether it was created.
    pub fn upsert(&mut self, handle: PeerHandle) -> (&mut PeerRecord, bool) {
        let mut created = false;
        let record = self
            .peers
            .entry(handle.name().to_owned())
            .and_modify(|r| r.replace_handle(handle.clone()))
            .or_insert_with(|| {
                created = true;
                PeerRecord::new(handle)
            });
        (record, created)
    }

    pub fn get(&self, identity: &str) -> Option<&PeerRecord> {
        self.peers.get(identity)
    }

    pub fn get_mut(&mut self, identity: &str) -> Option<&mut PeerRecord> {
        self.peers.get_mut(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.peers.contains_key(identity)
    }

    pub fn remove(&mut self, identity: &str) -> Option<PeerRecord> {
        self.peers.remove(identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PeerRecord> + '_ {
        self.peers.drain().map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut out: Vec<PeerInfo> = self.peers.values().map(PeerRecord::info).collect();
        out.sort_by(|a, b| a.device_name.cmp(&b.device_name));
        out
    }
}
