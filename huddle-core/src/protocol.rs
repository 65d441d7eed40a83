//! Huddle wire protocol: named messages with a structured payload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Current protocol version. Carried in LAN beacons and handshakes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Reserved descriptor: "tear down this session". Never forwarded to the data delegate.
pub const DISCONNECT: &str = "disconnect";

/// Payload key carrying the human-readable reason of a disconnect.
pub const REASON_KEY: &str = "reason";

/// Invitation context keys.
pub const CONTEXT_PLAYER: &str = "player";
pub const CONTEXT_EMAIL: &str = "email";
pub const CONTEXT_RECONNECT: &str = "reconnect";

/// Dynamically typed payload value. Encoding is bincode (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Key/value body of a message.
pub type Payload = BTreeMap<String, Value>;

/// Build a payload from `(key, value)` pairs.
pub fn payload<K, V, I>(entries: I) -> Payload
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// One named message. `payload` is `None` for signals without a body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub descriptor: String,
    pub payload: Option<Payload>,
}

impl Message {
    pub fn new(descriptor: impl Into<String>, payload: Option<Payload>) -> Self {
        Self {
            descriptor: descriptor.into(),
            payload,
        }
    }

    /// The reserved teardown message.
    pub fn disconnect(reason: Option<&str>) -> Self {
        let payload = reason.map(|r| payload([(REASON_KEY, r)]));
        Self::new(DISCONNECT, payload)
    }

    pub fn is_disconnect(&self) -> bool {
        self.descriptor == DISCONNECT
    }

    /// Reason carried by a disconnect message, if any.
    pub fn reason(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get(REASON_KEY))
            .and_then(Value::as_str)
    }
}

/// Player metadata the connecting side attaches to its invitation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InviteContext {
    pub player: Option<String>,
    pub email: Option<String>,
    pub reconnect: Option<bool>,
}

impl InviteContext {
    pub fn to_payload(&self) -> Payload {
        let mut p = Payload::new();
        if let Some(player) = &self.player {
            p.insert(CONTEXT_PLAYER.into(), player.as_str().into());
        }
        if let Some(email) = &self.email {
            p.insert(CONTEXT_EMAIL.into(), email.as_str().into());
        }
        if let Some(reconnect) = self.reconnect {
            p.insert(CONTEXT_RECONNECT.into(), reconnect.into());
        }
        p
    }

    pub fn from_payload(p: &Payload) -> Self {
        Self {
            player: p.get(CONTEXT_PLAYER).and_then(Value::as_str).map(str::to_owned),
            email: p.get(CONTEXT_EMAIL).and_then(Value::as_str).map(str::to_owned),
            reconnect: p.get(CONTEXT_RECONNECT).and_then(Value::as_bool),
        }
    }
}
