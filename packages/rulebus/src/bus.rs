//! Message bus adapter interface and an in-memory implementation.
//!
//! The engine never talks to a broker directly. It consumes a
//! [`MessageBus`] that can publish [`Publication`]s and deliver incoming
//! messages to handlers registered for a topic pattern.
//!
//! # Guarantees Expected From Adapters
//!
//! - **At-least-once delivery**: handlers may observe duplicates
//! - **Per-publisher, per-topic ordering**: nothing stronger is assumed
//! - **Retained last value**: `retained` publications are replayed to
//!   subscribers that join later
//!
//! # Echo Publications
//!
//! Publications with [`Origin::Echo`] mirror a write the engine just
//! received on a `/on` topic. Handlers feeding the engine must ignore them,
//! otherwise every write would be consumed twice. A broker adapter whose
//! broker already carries the original write may drop them entirely.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::BusError;
use crate::topic::{topic_matches, validate_pattern};

/// Delivery assurance level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn level(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid QoS level: {other}")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.level()
    }
}

impl FromStr for QoS {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level: u8 = s
            .trim()
            .parse()
            .map_err(|_| format!("invalid QoS level: {s:?}"))?;
        QoS::try_from(level)
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// Who produced a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// An external client (UI, device driver, test).
    Client,
    /// The engine mirroring a write it received.
    Echo,
    /// Canonical state or metadata published by the engine.
    Engine,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Client => f.write_str("client"),
            Origin::Echo => f.write_str("echo"),
            Origin::Engine => f.write_str("engine"),
        }
    }
}

/// One outbound (or inbound) bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retained: bool,
    pub origin: Origin,
}

impl Publication {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<String>,
        qos: QoS,
        retained: bool,
        origin: Origin,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained,
            origin,
        }
    }

    /// A client write, as published by a UI or device driver.
    pub fn client(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(topic, payload, QoS::AtLeastOnce, false, Origin::Client)
    }
}

/// Renders as `<topic>: [<payload>] (QoS <n>[, retained])`.
impl fmt::Display for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: [{}] (QoS {}", self.topic, self.payload, self.qos)?;
        if self.retained {
            f.write_str(", retained")?;
        }
        f.write_str(")")
    }
}

/// Handler invoked for every delivered message matching a subscription.
pub type MessageHandler = Arc<dyn Fn(&Publication) + Send + Sync>;

/// Identifier returned by [`MessageBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Publish/subscribe capability consumed by the engine.
pub trait MessageBus: Send + Sync + 'static {
    /// Publish a message, preserving topic, payload, QoS and retained flag.
    fn publish(&self, publication: &Publication) -> Result<(), BusError>;

    /// Register a handler for topics matching `pattern` (`+` and `#` wildcards).
    fn subscribe(&self, pattern: &str, handler: MessageHandler)
        -> Result<SubscriptionId, BusError>;

    /// Remove a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError>;
}

struct Subscriber {
    id: SubscriptionId,
    pattern: String,
    handler: MessageHandler,
}

#[derive(Default)]
struct InMemoryState {
    subscribers: Vec<Subscriber>,
    retained: IndexMap<String, Publication>,
    next_id: u64,
    closed: bool,
}

/// In-process bus with synchronous delivery and retained-message replay.
///
/// Handlers run on the publishing thread, in subscription order, after the
/// internal lock is released (a handler may publish again).
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Last retained publication on `topic`, if any.
    pub fn retained(&self, topic: &str) -> Option<Publication> {
        self.lock().retained.get(topic).cloned()
    }

    /// All retained publications, in first-retained order.
    pub fn retained_messages(&self) -> Vec<Publication> {
        self.lock().retained.values().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Stop accepting traffic. Later calls fail with [`BusError::Closed`].
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, publication: &Publication) -> Result<(), BusError> {
        let handlers: Vec<MessageHandler> = {
            let mut state = self.lock();
            if state.closed {
                return Err(BusError::Closed);
            }
            if publication.retained {
                if publication.payload.is_empty() {
                    state.retained.shift_remove(&publication.topic);
                } else {
                    state
                        .retained
                        .insert(publication.topic.clone(), publication.clone());
                }
            }
            state
                .subscribers
                .iter()
                .filter(|s| topic_matches(&s.pattern, &publication.topic))
                .map(|s| s.handler.clone())
                .collect()
        };

        trace!(topic = %publication.topic, receivers = handlers.len(), "delivering");
        for handler in handlers {
            handler(publication);
        }
        Ok(())
    }

    fn subscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, BusError> {
        validate_pattern(pattern)?;
        let (id, replay) = {
            let mut state = self.lock();
            if state.closed {
                return Err(BusError::Closed);
            }
            state.next_id += 1;
            let id = SubscriptionId(state.next_id);
            state.subscribers.push(Subscriber {
                id,
                pattern: pattern.to_string(),
                handler: handler.clone(),
            });
            let replay: Vec<Publication> = state
                .retained
                .values()
                .filter(|p| topic_matches(pattern, &p.topic))
                .cloned()
                .collect();
            (id, replay)
        };

        for publication in &replay {
            handler(publication);
        }
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        self.lock().subscribers.retain(|s| s.id != id);
        Ok(())
    }
}

impl fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemoryBus")
            .field("subscriber_count", &state.subscribers.len())
            .field("retained_count", &state.retained.len())
            .field("closed", &state.closed)
            .finish()
    }
}
