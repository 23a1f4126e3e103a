//! Rulebus Engine - one explicit instance owning registry, rules and router.
//!
//! ```text
//! client ─► /devices/d/controls/c/on ─► Engine::handle_inbound
//!                                          │ echo /on
//!                                          │ apply + canonical /devices/d/controls/c
//!                                          ▼
//!                                   RuleDispatcher ─► rules ─► set / log
//!                                          ▲                    │
//!                                          └──── cascade queue ◄┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use rulebus::{EngineBuilder, InMemoryBus, TracingLogSink, loopback_device};
//!
//! let bus = Arc::new(InMemoryBus::new());
//! let engine = EngineBuilder::new(bus.clone(), Arc::new(TracingLogSink))
//!     .with_device(loopback_device())
//!     .with_fn_rule("loud button", "loopback/set_loud", |ctx| {
//!         ctx.info("set_loud button pressed");
//!         ctx.set("loopback", "gauge", 42)?;
//!         Ok(())
//!     })
//!     .build()?;
//!
//! let report = engine.handle_inbound("/devices/loopback/controls/set_loud/on", "1")?;
//! ```
//!
//! # Serialization
//!
//! Every inbound message, external `set` and definition pass runs under one
//! engine-wide lock. Registry mutations of one stimulus never interleave with
//! another's.
//!
//! Publications and log records are buffered during the cycle and queued on
//! the router's outbox before the lock is released, so they leave the engine
//! in cycle order. They are delivered with no lock held: a bus subscriber or
//! log sink may call `read`, `snapshot`, `set` or `handle_inbound` on the same
//! engine. Output of such a nested call follows the output already queued.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::config::EngineConfig;
use crate::device::DeviceDefinition;
use crate::dispatch::{Cycle, DispatchReport, Emission, RuleDispatcher};
use crate::error::EngineError;
use crate::log_sink::{LogLevel, LogSink};
use crate::registry::ControlRegistry;
use crate::router::PublicationRouter;
use crate::rule::{CycleOps, FnRule, Rule, RuleContext};
use crate::topic::{CellRef, ControlRef};
use crate::value::ControlValue;

struct PendingRule {
    name: String,
    triggers: Vec<String>,
    rule: Arc<dyn Rule>,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    bus: Arc<dyn MessageBus>,
    log: Arc<dyn LogSink>,
    config: EngineConfig,
    devices: Vec<DeviceDefinition>,
    rules: Vec<PendingRule>,
}

impl EngineBuilder {
    pub fn new(bus: Arc<dyn MessageBus>, log: Arc<dyn LogSink>) -> Self {
        Self {
            bus,
            log,
            config: EngineConfig::default(),
            devices: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Declare a device. Devices are registered in the order added.
    pub fn with_device(mut self, device: DeviceDefinition) -> Self {
        self.devices.push(device);
        self
    }

    pub fn with_devices(mut self, devices: impl IntoIterator<Item = DeviceDefinition>) -> Self {
        self.devices.extend(devices);
        self
    }

    /// Bind a rule to a trigger control written as `device/control`.
    ///
    /// Rules bound to the same control run in the order they are added.
    pub fn with_rule<R: Rule>(self, name: impl Into<String>, trigger: &str, rule: R) -> Self {
        self.with_rule_on_many(name, [trigger], rule)
    }

    /// Bind a closure as a rule.
    pub fn with_fn_rule<F>(self, name: impl Into<String>, trigger: &str, f: F) -> Self
    where
        F: Fn(&mut RuleContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with_rule(name, trigger, FnRule::new(f))
    }

    /// Bind one rule to several trigger controls under a single name.
    pub fn with_rule_on_many<R, I, S>(
        mut self,
        name: impl Into<String>,
        triggers: I,
        rule: R,
    ) -> Self
    where
        R: Rule,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.push(PendingRule {
            name: name.into(),
            triggers: triggers.into_iter().map(Into::into).collect(),
            rule: Arc::new(rule),
        });
        self
    }

    /// Declare devices and bind rules.
    ///
    /// Fails on duplicate controls or rule names, malformed trigger
    /// references and triggers naming undeclared controls.
    pub fn build(self) -> Result<Engine, EngineError> {
        let mut registry = ControlRegistry::new();
        for device in &self.devices {
            registry.declare(device)?;
        }

        let mut dispatcher = RuleDispatcher::new();
        for pending in self.rules {
            let mut triggers = Vec::with_capacity(pending.triggers.len());
            for raw in &pending.triggers {
                let trigger: ControlRef = raw.parse()?;
                if !registry.contains(&trigger) {
                    return Err(EngineError::unknown(&trigger.device, &trigger.control));
                }
                triggers.push(trigger);
            }
            dispatcher.bind_many(pending.name, triggers, pending.rule)?;
        }

        info!(
            controls = registry.len(),
            rules = dispatcher.len(),
            qos = %self.config.qos,
            max_cascade_depth = self.config.max_cascade_depth,
            "engine built"
        );

        Ok(Engine {
            registry: Mutex::new(registry),
            router: PublicationRouter::new(self.bus, self.config.qos),
            dispatcher,
            log: self.log,
            config: self.config,
        })
    }
}

/// The control/rule dispatch engine.
pub struct Engine {
    registry: Mutex<ControlRegistry>,
    router: PublicationRouter,
    dispatcher: RuleDispatcher,
    log: Arc<dyn LogSink>,
    config: EngineConfig,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &RuleDispatcher {
        &self.dispatcher
    }

    fn lock(&self) -> MutexGuard<'_, ControlRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Process one client write received on `/devices/<d>/controls/<c>/on`.
    ///
    /// Unknown controls are rejected before anything is published. A payload
    /// that does not fit the control's type is echoed and logged but neither
    /// stored nor dispatched.
    pub fn handle_inbound(
        &self,
        topic: &str,
        payload: &str,
    ) -> Result<DispatchReport, EngineError> {
        let control = ControlRef::from_on_topic(topic)?;
        let id = Uuid::new_v4();
        let span = info_span!("dispatch_cycle", cycle = %id, %control);
        let _enter = span.enter();

        let (outcome, drain) = {
            let mut registry = self.lock();
            if !registry.contains(&control) {
                debug!(%control, "write to undeclared control");
                return Err(EngineError::unknown(&control.device, &control.control));
            }

            let mut cycle = Cycle::new(&mut registry, &self.router, id);
            cycle.route(self.router.echo(&control, payload));

            let applied = match cycle.apply_inbound(&control, payload) {
                Ok(event) => {
                    cycle.enqueue(event);
                    self.dispatcher.run(&mut cycle, self.config.max_cascade_depth);
                    Ok(())
                }
                Err(e @ EngineError::InvalidValueKind { .. }) => {
                    warn!(%control, payload, "rejected invalid value");
                    cycle.log(LogLevel::Error, &e.to_string());
                    Err(e)
                }
                Err(e) => Err(e),
            };

            let (report, emissions) = cycle.finish();
            (applied.map(|()| report), self.router.submit(emissions))
        };

        if drain {
            self.router.drain(self.log.as_ref())?;
        }
        let report = outcome?;
        debug!(
            publications = report.publications,
            rules_invoked = report.rules_invoked,
            failures = report.failures.len(),
            "cycle complete"
        );
        Ok(report)
    }

    /// Write a control from outside any rule.
    ///
    /// `cell` is `device/control` (rules are notified) or
    /// `device/control~` (silent).
    pub fn set(
        &self,
        cell: &str,
        value: impl Into<ControlValue>,
    ) -> Result<DispatchReport, EngineError> {
        let cell: CellRef = cell.parse()?;
        let id = Uuid::new_v4();
        let span = info_span!("dispatch_cycle", cycle = %id, control = %cell.control);
        let _enter = span.enter();

        let (outcome, drain) = {
            let mut registry = self.lock();
            let mut cycle = Cycle::new(&mut registry, &self.router, id);
            let written = cycle.write(&cell.control, value.into(), cell.notify, 0);
            if written.is_ok() {
                self.dispatcher.run(&mut cycle, self.config.max_cascade_depth);
            }
            let (report, emissions) = cycle.finish();
            (written.map(|_| report), self.router.submit(emissions))
        };

        if drain {
            self.router.drain(self.log.as_ref())?;
        }
        outcome
    }

    pub fn read(&self, device: &str, control: &str) -> Result<ControlValue, EngineError> {
        self.lock().read(&ControlRef::new(device, control))
    }

    /// Snapshot of every declared control and its current value.
    pub fn snapshot(&self) -> Vec<(ControlRef, ControlValue)> {
        self.lock()
            .controls()
            .map(|(control, state)| (control.clone(), state.current()))
            .collect()
    }

    /// Publish retained metadata and initial values for every declared device.
    ///
    /// Returns the number of publications routed.
    pub fn publish_definitions(&self) -> Result<usize, EngineError> {
        let (count, drain) = {
            let registry = self.lock();
            let publications = self.router.definitions(&registry);
            let count = publications.len();
            (count, self.router.submit(publications.into_iter().map(Emission::Publish).collect()))
        };

        if drain {
            self.router.drain(self.log.as_ref())?;
        }
        info!(count, "device definitions published");
        Ok(count)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("router", &self.router)
            .field("dispatcher", &self.dispatcher)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
