//! Publication Router - turns engine intents into bus messages.
//!
//! The router applies the topic scheme and the configured QoS level, then
//! forwards publications to the [`MessageBus`] unmodified and in submission
//! order. It never reorders or batches.
//!
//! # Delivery
//!
//! Cycles buffer their output while the registry is locked, submit it to one
//! outbox shared by all cycles, and only then release the lock. Delivery to
//! the bus and log sink happens afterwards, with nothing locked:
//!
//! ```text
//! cycle A ─► [A1 A2]      ┐
//!                         ├─► outbox ─► A1 A2 B1 ─► bus / log sink
//! cycle B ─► [B1] (nested)┘
//! ```
//!
//! Only one caller drains the outbox at a time. A cycle that finishes while
//! another caller is draining (a bus subscriber calling back into the engine,
//! for instance) appends its output and returns; the active drainer delivers
//! it after everything queued before it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{trace, warn};

use crate::bus::{MessageBus, Origin, Publication, QoS};
use crate::dispatch::Emission;
use crate::error::EngineError;
use crate::log_sink::LogSink;
use crate::registry::{Applied, ControlRegistry};
use crate::topic::{device_meta_topic, ControlRef};
use crate::value::ControlValue;

pub struct PublicationRouter {
    bus: Arc<dyn MessageBus>,
    qos: QoS,
    outbox: Mutex<Outbox>,
}

#[derive(Default)]
struct Outbox {
    queue: VecDeque<Emission>,
    draining: bool,
}

/// Releases the drainer role if delivery unwinds.
struct DrainGuard<'a>(&'a PublicationRouter);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.outbox().draining = false;
        }
    }
}

impl PublicationRouter {
    pub fn new(bus: Arc<dyn MessageBus>, qos: QoS) -> Self {
        Self {
            bus,
            qos,
            outbox: Mutex::new(Outbox::default()),
        }
    }

    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Mirror of a received write: same `/on` topic, literal payload, never retained.
    pub fn echo(&self, control: &ControlRef, raw: &str) -> Publication {
        Publication::new(control.on_topic(), raw, self.qos, false, Origin::Echo)
    }

    /// Canonical state publication carrying the control's retained policy.
    pub fn canonical(&self, applied: &Applied) -> Publication {
        Publication::new(
            applied.control.topic(),
            applied.new.to_payload(),
            self.qos,
            applied.retained,
            Origin::Engine,
        )
    }

    /// Forward a publication to the bus.
    pub fn route(&self, publication: &Publication) -> Result<(), EngineError> {
        trace!(
            topic = %publication.topic,
            payload = %publication.payload,
            retained = publication.retained,
            "routing publication"
        );
        self.bus.publish(publication).map_err(|e| {
            warn!(topic = %publication.topic, error = %e, "publication failed");
            EngineError::from(e)
        })
    }

    /// Append a cycle's output to the outbox.
    ///
    /// Called while the registry is still locked so cycles queue in the order
    /// they ran. Returns `true` if the caller became the drainer and must call
    /// [`PublicationRouter::drain`]; otherwise the active drainer delivers it.
    pub(crate) fn submit(&self, emissions: Vec<Emission>) -> bool {
        let mut outbox = self.outbox();
        outbox.queue.extend(emissions);
        if outbox.draining {
            trace!(queued = outbox.queue.len(), "outbox busy, output queued");
            return false;
        }
        outbox.draining = true;
        true
    }

    /// Deliver queued output in order until the outbox is empty.
    ///
    /// Nothing is held while a publication or log record is delivered. A
    /// failed publication does not stop delivery; the first failure is
    /// returned.
    pub(crate) fn drain(&self, log: &dyn LogSink) -> Result<(), EngineError> {
        let _guard = DrainGuard(self);
        let mut first_error = None;
        loop {
            let next = {
                let mut outbox = self.outbox();
                match outbox.queue.pop_front() {
                    Some(emission) => emission,
                    None => {
                        outbox.draining = false;
                        break;
                    }
                }
            };
            match next {
                Emission::Publish(publication) => {
                    if let Err(e) = self.route(&publication) {
                        first_error.get_or_insert(e);
                    }
                }
                Emission::Log(level, message) => log.log(level, &message),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Retained metadata and initial values describing every declared device.
    pub fn definitions(&self, registry: &ControlRegistry) -> Vec<Publication> {
        let meta = |topic: String, payload: String| {
            Publication::new(topic, payload, self.qos, true, Origin::Engine)
        };

        let mut out = Vec::new();
        for (device, title) in registry.devices() {
            out.push(meta(device_meta_topic(device, "name"), title.to_string()));
            for (control, state) in registry.controls().filter(|(c, _)| c.device == device) {
                out.push(meta(control.meta_topic("type"), state.kind.to_string()));
                out.push(meta(control.meta_topic("order"), state.order.to_string()));
                if let Some(max) = state.max {
                    out.push(meta(
                        control.meta_topic("max"),
                        ControlValue::Number(max).to_payload(),
                    ));
                }
                if state.readonly {
                    out.push(meta(control.meta_topic("readonly"), "1".to_string()));
                }
                if let Some(value) = &state.value {
                    out.push(Publication::new(
                        control.topic(),
                        value.to_payload(),
                        self.qos,
                        state.retained,
                        Origin::Engine,
                    ));
                }
            }
        }
        out
    }
}

impl std::fmt::Debug for PublicationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicationRouter")
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}
