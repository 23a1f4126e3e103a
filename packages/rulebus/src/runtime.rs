//! Runtime connecting an [`Engine`] to a [`MessageBus`].
//!
//! The runtime:
//! 1. Subscribes to `/devices/+/controls/+/on` on the bus
//! 2. Forwards client writes into an unbounded channel
//! 3. Drains the channel on a single task, one message at a time
//!
//! Publications made by the engine itself (echoes and canonical state) are
//! not fed back into the engine.
//!
//! # Example
//!
//! ```ignore
//! let bus = Arc::new(InMemoryBus::new());
//! let engine = Arc::new(EngineBuilder::new(bus.clone(), log).with_device(dev).build()?);
//!
//! let handle = Runtime::new(engine, bus.clone()).start()?;
//!
//! // Fire and forget through the bus...
//! bus.publish(&Publication::client("/devices/loopback/controls/set_loud/on", "1"))?;
//!
//! // ...or submit directly and wait for the cycle to finish
//! let report = handle.deliver("/devices/loopback/controls/gauge/on", "3").await?;
//!
//! handle.shutdown().await;
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bus::{MessageBus, Origin, Publication, SubscriptionId};
use crate::dispatch::DispatchReport;
use crate::engine::Engine;
use crate::error::{BusError, EngineError};
use crate::topic::CONTROL_WRITE_PATTERN;

type Ack = oneshot::Sender<Result<DispatchReport, EngineError>>;

enum Inbound {
    Message {
        topic: String,
        payload: String,
        ack: Option<Ack>,
    },
    Shutdown,
}

/// Runtime for one engine on one bus.
pub struct Runtime {
    engine: Arc<Engine>,
    bus: Arc<dyn MessageBus>,
}

impl Runtime {
    pub fn new(engine: Arc<Engine>, bus: Arc<dyn MessageBus>) -> Self {
        Self { engine, bus }
    }

    /// Subscribe to control writes and spawn the dispatch task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<RuntimeHandle, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let forward = tx.clone();
        let subscription = self.bus.subscribe(
            CONTROL_WRITE_PATTERN,
            Arc::new(move |publication: &Publication| {
                if publication.origin != Origin::Client {
                    trace!(
                        topic = %publication.topic,
                        origin = %publication.origin,
                        "skipping own publication"
                    );
                    return;
                }
                let message = Inbound::Message {
                    topic: publication.topic.clone(),
                    payload: publication.payload.clone(),
                    ack: None,
                };
                if forward.send(message).is_err() {
                    debug!(topic = %publication.topic, "runtime stopped, write dropped");
                }
            }),
        )?;

        let task = tokio::spawn(run(self.engine, rx));
        info!(pattern = CONTROL_WRITE_PATTERN, "runtime started");

        Ok(RuntimeHandle {
            tx,
            task,
            bus: self.bus,
            subscription,
        })
    }
}

/// Handle to a started [`Runtime`].
pub struct RuntimeHandle {
    tx: mpsc::UnboundedSender<Inbound>,
    task: JoinHandle<()>,
    bus: Arc<dyn MessageBus>,
    subscription: SubscriptionId,
}

impl RuntimeHandle {
    /// Submit a write and wait until its whole dispatch cycle has finished.
    ///
    /// Writes are processed in submission order together with writes
    /// arriving through the bus.
    pub async fn deliver(
        &self,
        topic: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<DispatchReport, EngineError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Inbound::Message {
                topic: topic.into(),
                payload: payload.into(),
                ack: Some(ack),
            })
            .map_err(|_| BusError::Closed)?;
        done.await.map_err(|_| BusError::Closed)?
    }

    /// Stop receiving from the bus, finish queued writes and join the task.
    pub async fn shutdown(self) {
        if let Err(e) = self.bus.unsubscribe(self.subscription) {
            warn!(error = %e, "failed to unsubscribe runtime");
        }
        if self.tx.send(Inbound::Shutdown).is_err() {
            debug!("runtime task already stopped, shutdown not sent");
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "runtime task ended abnormally");
        }
    }
}

async fn run(engine: Arc<Engine>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(message) = rx.recv().await {
        let (topic, payload, ack) = match message {
            Inbound::Message { topic, payload, ack } => (topic, payload, ack),
            Inbound::Shutdown => break,
        };

        let result = engine.handle_inbound(&topic, &payload);
        match &result {
            Ok(report) if !report.is_clean() => {
                warn!(
                    %topic,
                    failures = report.failures.len(),
                    dropped_cascades = report.dropped_cascades,
                    "cycle finished with problems"
                );
            }
            Ok(_) => {}
            Err(e) if e.is_rejection() => debug!(%topic, error = %e, "write rejected"),
            Err(e) => warn!(%topic, error = %e, "write failed"),
        }

        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
    }
    info!("runtime stopped");
}
