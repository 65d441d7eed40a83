//! Live sessions, keyed by peer identity. At most one per peer.

use std::collections::HashMap;

use crate::transport::{SessionId, SessionRef};

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<String, SessionRef>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `session` for `identity`. Returns the session it replaced, if any;
    /// the caller owns closing it.
    pub fn insert(&mut self, identity: &str, session: SessionRef) -> Option<SessionRef> {
        self.sessions.insert(identity.to_owned(), session)
    }

    pub fn get(&self, identity: &str) -> Option<&SessionRef> {
        self.sessions.get(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    /// Whether `id` is the session currently installed for `identity`.
    pub fn is_current(&self, identity: &str, id: SessionId) -> bool {
        self.sessions.get(identity).is_some_and(|s| s.id() == id)
    }

    pub fn remove(&mut self, identity: &str) -> Option<SessionRef> {
        self.sessions.remove(identity)
    }

    pub fn drain(&mut self) -> Vec<(String, SessionRef)> {
        self.sessions.drain().collect()
    }

    /// Detached copy of the table for iteration while the table may change.
    pub fn snapshot(&self) -> Vec<(String, SessionRef)> {
        self.sessions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
