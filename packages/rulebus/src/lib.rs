//! # Rulebus
//!
//! A reactive automation engine that binds named controls to user rules and
//! is driven over a publish/subscribe bus.
//!
//! ## Core Concepts
//!
//! - A **control** lives at `/devices/<device>/controls/<control>` and has a
//!   type, a current value and a fixed retained policy
//! - Clients write to `/devices/<device>/controls/<control>/on`
//! - A **rule** is bound to one or more controls and runs whenever they are
//!   written; it may read controls, set controls and log
//!
//! ## Architecture
//!
//! ```text
//! client ─► MessageBus ─► Runtime (single task)
//!                              │
//!                              ▼ handle_inbound()
//!                           Engine ──────────────────────────────┐
//!                              │                                 │
//!                              ├─► PublicationRouter ─► echo /on │
//!                              ├─► ControlRegistry.apply         │
//!                              ├─► PublicationRouter ─► canonical│
//!                              ▼                                 │
//!                        RuleDispatcher                          │
//!                              │                                 │
//!                              ├─► rule A ─► ctx.set() ──────────┤
//!                              └─► rule B ─► ctx.info() ─► LogSink
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One stimulus at a time** - an inbound write is processed end to end
//!    before the next one starts
//! 2. **Declaration order** - rules bound to a control run in the order bound
//! 3. **Isolation** - a failing or panicking rule never stops its siblings
//! 4. **Bounded cascades** - rule-triggered changes are dispatched breadth
//!    first and cut off at a configurable depth
//! 5. **Deterministic output** - identical stimuli on identical state yield
//!    identical publications and log records
//!
//! ## Example
//!
//! ```ignore
//! use rulebus::{EngineBuilder, InMemoryBus, Runtime, TracingLogSink, loopback_device};
//!
//! let bus = Arc::new(InMemoryBus::new());
//! let engine = EngineBuilder::new(bus.clone(), Arc::new(TracingLogSink))
//!     .with_device(loopback_device())
//!     .with_fn_rule("announce gauge", "loopback/gauge", |ctx| {
//!         let message = format!("gauge set to {}", ctx.event().new);
//!         ctx.info(message);
//!         Ok(())
//!     })
//!     .with_fn_rule("silent button", "loopback/set_silent", |ctx| {
//!         ctx.set_cell("loopback/gauge~", 84)?;
//!         Ok(())
//!     })
//!     .build()?;
//!
//! let handle = Runtime::new(Arc::new(engine), bus.clone()).start()?;
//! handle.deliver("/devices/loopback/controls/set_silent/on", "1").await?;
//! ```
//!
//! ## What This Is Not
//!
//! Rulebus does not persist control history, coordinate several engine
//! instances or authorize writers. Broker connectivity lives behind the
//! [`MessageBus`] trait.

mod bus;
mod config;
mod device;
mod dispatch;
mod engine;
mod error;
mod log_sink;
mod registry;
mod router;
mod rule;
mod runtime;
mod topic;
mod value;

// Recording bus + log sink for tests and the CLI
pub mod journal;

pub use bus::{InMemoryBus, MessageBus, MessageHandler, Origin, Publication, QoS, SubscriptionId};
pub use config::{EngineConfig, DEFAULT_MAX_CASCADE_DEPTH};
pub use device::{load_devices, loopback_device, parse_devices, ControlDefinition, DeviceDefinition};
pub use dispatch::{DispatchReport, RuleBinding, RuleDispatcher, RuleFailure};
pub use engine::{Engine, EngineBuilder};
pub use error::{BusError, EngineError};
pub use log_sink::{LogLevel, LogRecord, LogSink, MemoryLogSink, TracingLogSink};
pub use registry::{Applied, ControlRegistry, ControlState};
pub use router::PublicationRouter;
pub use rule::{ChangeEvent, FnRule, Rule, RuleContext};
pub use runtime::{Runtime, RuntimeHandle};
pub use topic::{topic_matches, validate_pattern, CellRef, ControlRef, CONTROL_WRITE_PATTERN};
pub use value::{ControlType, ControlValue};
