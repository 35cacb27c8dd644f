use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One ordered set of telemetry messages delivered by a single send
/// operation. Batches carry no identity beyond the position of their
/// messages and are not retained after delivery.
pub type Batch = Vec<TelemetryMessage>;

/// A single message on the dial-out stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TelemetryMessage {
    /// The producer has finished sending its initial snapshot.
    SyncMarker,
    /// A telemetry update: path prefix and/or alias plus path-value pairs.
    Notification(Notification),
}

/// A telemetry notification. The transport treats the contents as opaque;
/// the structure exists only so producers and handlers agree on it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Notification {
    /// Producer-side timestamp, nanoseconds since the Unix epoch.
    pub timestamp: i64,
    /// Prefix applied to every update path in this notification.
    pub prefix: Option<Path>,
    /// Alias established for (or referring to) the prefix.
    pub alias: Option<String>,
    /// Path-value updates, in producer order.
    pub updates: Vec<Update>,
}

/// A structured path, e.g. `interfaces/interface[name=1/1]`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Path {
    pub elems: Vec<PathElem>,
}

impl Path {
    /// Build a path from plain element names, no keys.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            elems: names.into_iter().map(PathElem::new).collect(),
        }
    }
}

/// One element of a [`Path`], optionally keyed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PathElem {
    pub name: String,
    pub keys: BTreeMap<String, String>,
}

impl PathElem {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            keys: BTreeMap::new(),
        }
    }

    pub fn with_key<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.keys.insert(key.into(), value.into());
        self
    }
}

/// A single path-value update inside a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub path: Path,
    pub value: TypedValue,
}

impl Update {
    pub fn uint(path: Path, value: u64) -> Self {
        Self {
            path,
            value: TypedValue::Uint(value),
        }
    }

    pub fn string<S: Into<String>>(path: Path, value: S) -> Self {
        Self {
            path,
            value: TypedValue::String(value.into()),
        }
    }
}

/// Typed scalar carried by an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedValue {
    String(String),
    Int(i64),
    Uint(u64),
    Bool(bool),
    Double(f64),
    Bytes(Vec<u8>),
}

/// Wire frames exchanged over one dial-out session.
///
/// The client speaks first with `Hello`; the server answers with
/// `HelloAck` or `AuthReject` and afterwards returns nothing but stream
/// status. Everything else flows client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Session opener, sent exactly once. Credentials are optional and
    /// checked only when the server requires them.
    Hello {
        username: Option<String>,
        password: Option<String>,
    },
    /// Session admitted; batches may follow.
    HelloAck,
    /// Session refused; the server closes the connection after this.
    AuthReject { reason: String },
    /// One ordered batch of telemetry messages.
    Batch(Vec<TelemetryMessage>),
    /// Graceful half-close from the client.
    Goodbye,
}
