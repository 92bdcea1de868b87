//! Cross-process change notifications.
//!
//! After a commit, the effective diff of an account is broadcast as a [`ChangeMessage`] on one
//! topic per service type it touches, plus the global topic. Managers created for a single
//! service type only listen on that type's topic and on the global one.
//!
//! [`SessionBus`] carries the notifications between processes, [`LocalBus`] only between the
//! managers of one process.

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::trace;

use crate::{
    error::{CodecSnafu, Result},
    service::{ServiceId, GLOBAL},
    value::Value,
    AccountId,
};

mod session;

pub use self::session::{SessionBus, INTERFACE, SIGNAL};

/// Namespace of all change notification topics.
pub const TOPIC_PREFIX: &str = "/ServiceType";

/// Escapes a string so it can be used as a single topic path element.
///
/// Every byte which is not an ASCII letter or digit, and a leading digit, is replaced by `_`
/// followed by its two digit lowercase hex code. The empty string escapes to `_`.
pub fn escape_as_identifier(s: &str) -> String {
    if s.is_empty() {
        return "_".to_string();
    }
    let mut out = String::with_capacity(s.len());
    for (i, b) in s.bytes().enumerate() {
        if b.is_ascii_alphabetic() || (b.is_ascii_digit() && i > 0) {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{b:02x}"));
        }
    }
    out
}

/// Returns the topic on which changes to services of `service_type` are sent.
pub fn topic_for_service_type(service_type: &str) -> String {
    format!("{TOPIC_PREFIX}/{}", escape_as_identifier(service_type))
}

/// Returns the topic which receives every change.
pub fn global_topic() -> String {
    topic_for_service_type(GLOBAL)
}

/// The changes of one service within a [`ChangeMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDelta {
    /// Name of the service, `global` for account-wide settings.
    pub service_name: String,
    /// Type of the service.
    pub service_type: String,
    /// Storage id of the service, `0` for account-wide settings.
    pub service_id: ServiceId,
    /// Settings which were set.
    pub changed: BTreeMap<String, Value>,
    /// Settings which were removed.
    pub removed: Vec<String>,
}

/// A committed change to one account, as sent between processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    /// Seconds part of the timestamp identifying the change.
    pub sec: u32,
    /// Nanoseconds part of the timestamp identifying the change.
    pub nsec: u32,
    /// The changed account.
    pub account_id: AccountId,
    /// Whether the account was created by this change.
    pub created: bool,
    /// Whether the account was deleted by this change.
    pub deleted: bool,
    /// Provider of the account, empty if unknown.
    pub provider: String,
    /// The changed services.
    pub services: Vec<ServiceDelta>,
}

impl ChangeMessage {
    /// Encodes the message for the wire.
    pub fn encode(&self) -> Result<Bytes> {
        let buf = postcard::to_stdvec(self).context(CodecSnafu)?;
        Ok(buf.into())
    }

    /// Decodes a message received from the wire.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        postcard::from_bytes(buf).context(CodecSnafu)
    }
}

/// A payload received on a topic.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The topic the payload was sent on.
    pub topic: String,
    /// The encoded [`ChangeMessage`].
    pub payload: Bytes,
}

/// A broadcast channel shared by all managers on the machine.
pub trait Bus: Debug + Send + Sync + 'static {
    /// Sends `payload` to every subscriber of `topic`, including the sender itself.
    fn emit(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribes to a set of topics, or to every topic if `topics` is `None`.
    fn subscribe(&self, topics: Option<Vec<String>>) -> flume::Receiver<BusMessage>;
}

/// A [`Bus`] connecting the managers of a single process.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

#[derive(Debug)]
struct Subscriber {
    topics: Option<Vec<String>>,
    sender: flume::Sender<BusMessage>,
}

impl LocalBus {
    /// Creates a bus without subscribers.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Bus for LocalBus {
    fn emit(&self, topic: &str, payload: Bytes) -> Result<()> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            let interested = sub
                .topics
                .as_ref()
                .is_none_or(|topics| topics.iter().any(|t| t == topic));
            if !interested {
                return !sub.sender.is_disconnected();
            }
            let msg = BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            sub.sender.send(msg).is_ok()
        });
        trace!(%topic, subscribers = subscribers.len(), "emitted");
        Ok(())
    }

    fn subscribe(&self, topics: Option<Vec<String>>) -> flume::Receiver<BusMessage> {
        let (sender, receiver) = flume::unbounded();
        self.subscribers.lock().push(Subscriber { topics, sender });
        receiver
    }
}
