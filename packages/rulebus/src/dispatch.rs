//! Rule Dispatcher - routes control changes to the rules bound to them.
//!
//! The `RuleDispatcher` is responsible for:
//! 1. Holding rule bindings in declaration order
//! 2. Invoking every binding of a changed control exactly once, in order
//! 3. Containing rule failures so sibling rules still run
//! 4. Draining follow-up changes queued by rules, breadth-first and bounded
//!
//! # Cascades
//!
//! ```text
//! inbound write ─► event (depth 0)
//!                    ├─► rule A ─► set X (loud)   ─► queue X (depth 1)
//!                    └─► rule B ─► set Y (silent) ─► publish only
//! queue ─► X (depth 1) ─► rules bound to X ─► ...
//! ```
//!
//! Events deeper than the configured bound are dropped with a warning; their
//! canonical state has already been published.

use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::bus::Publication;
use crate::error::EngineError;
use crate::log_sink::LogLevel;
use crate::registry::ControlRegistry;
use crate::router::PublicationRouter;
use crate::rule::{ChangeEvent, CycleOps, Rule, RuleContext};
use crate::topic::ControlRef;
use crate::value::ControlValue;

/// Association of one trigger control with one rule.
#[derive(Clone)]
pub struct RuleBinding {
    name: String,
    trigger: ControlRef,
    rule: Arc<dyn Rule>,
}

impl RuleBinding {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trigger(&self) -> &ControlRef {
        &self.trigger
    }
}

impl std::fmt::Debug for RuleBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleBinding")
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

/// A rule invocation that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFailure {
    pub rule: String,
    pub message: String,
}

/// What one inbound stimulus caused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub cycle: Uuid,
    /// Publications routed to the bus, echo included.
    pub publications: usize,
    /// Records written to the log sink.
    pub log_records: usize,
    /// Change events delivered to the dispatcher.
    pub events: usize,
    pub rules_invoked: usize,
    pub failures: Vec<RuleFailure>,
    /// Queued events discarded for exceeding the cascade bound.
    pub dropped_cascades: usize,
}

impl DispatchReport {
    pub(crate) fn new(cycle: Uuid) -> Self {
        Self {
            cycle,
            publications: 0,
            log_records: 0,
            events: 0,
            rules_invoked: 0,
            failures: Vec::new(),
            dropped_cascades: 0,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.dropped_cascades == 0
    }
}

/// Output of a cycle, in production order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Emission {
    Publish(Publication),
    Log(LogLevel, String),
}

/// One end-to-end processing pass: registry writes, buffered output and
/// the queue of follow-up events, all for a single stimulus.
///
/// Nothing leaves the cycle until [`Cycle::finish`]; the caller hands the
/// emissions to [`PublicationRouter::submit`] before the registry is unlocked.
pub(crate) struct Cycle<'a> {
    registry: &'a mut ControlRegistry,
    router: &'a PublicationRouter,
    pending: VecDeque<ChangeEvent>,
    emissions: Vec<Emission>,
    report: DispatchReport,
}

impl<'a> Cycle<'a> {
    pub(crate) fn new(
        registry: &'a mut ControlRegistry,
        router: &'a PublicationRouter,
        id: Uuid,
    ) -> Self {
        Self {
            registry,
            router,
            pending: VecDeque::new(),
            emissions: Vec::new(),
            report: DispatchReport::new(id),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.report.cycle
    }

    pub(crate) fn route(&mut self, publication: Publication) {
        self.emissions.push(Emission::Publish(publication));
        self.report.publications += 1;
    }

    /// Apply a raw inbound payload and publish the control's canonical state.
    ///
    /// Returns the depth-0 event for the dispatcher.
    pub(crate) fn apply_inbound(
        &mut self,
        control: &ControlRef,
        raw: &str,
    ) -> Result<ChangeEvent, EngineError> {
        let applied = self.registry.apply(control, raw)?;
        self.route(self.router.canonical(&applied));
        Ok(ChangeEvent::from_applied(applied, 0, self.id()))
    }

    /// Queue an event for the next [`RuleDispatcher::run`].
    pub(crate) fn enqueue(&mut self, event: ChangeEvent) {
        self.pending.push_back(event);
    }

    pub(crate) fn finish(self) -> (DispatchReport, Vec<Emission>) {
        (self.report, self.emissions)
    }
}

impl CycleOps for Cycle<'_> {
    fn read(&self, control: &ControlRef) -> Result<ControlValue, EngineError> {
        self.registry.read(control)
    }

    fn write(
        &mut self,
        control: &ControlRef,
        value: ControlValue,
        notify: bool,
        depth: usize,
    ) -> Result<Publication, EngineError> {
        let applied = self.registry.set(control, value)?;
        let publication = self.router.canonical(&applied);
        self.route(publication.clone());
        if notify {
            let event = ChangeEvent::from_applied(applied, depth, self.id());
            self.pending.push_back(event);
        }
        Ok(publication)
    }

    fn log(&mut self, level: LogLevel, message: &str) {
        self.emissions.push(Emission::Log(level, message.to_string()));
        self.report.log_records += 1;
    }
}

/// Rule dispatcher holding bindings in declaration order.
///
/// # Example
///
/// ```ignore
/// let mut dispatcher = RuleDispatcher::new();
/// dispatcher.bind("announce", ControlRef::new("loopback", "gauge"), Arc::new(Announce))?;
/// dispatcher.bind_many("any button", [loud, silent], Arc::new(Buttons))?;
/// ```
#[derive(Debug, Default)]
pub struct RuleDispatcher {
    bindings: Vec<RuleBinding>,
    names: HashSet<String>,
}

impl RuleDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a rule to one trigger control.
    ///
    /// Returns [`EngineError::DuplicateRule`] if the name is taken.
    pub fn bind(
        &mut self,
        name: impl Into<String>,
        trigger: ControlRef,
        rule: Arc<dyn Rule>,
    ) -> Result<(), EngineError> {
        self.bind_many(name, [trigger], rule)
    }

    /// Bind one rule to several trigger controls under a single name.
    pub fn bind_many(
        &mut self,
        name: impl Into<String>,
        triggers: impl IntoIterator<Item = ControlRef>,
        rule: Arc<dyn Rule>,
    ) -> Result<(), EngineError> {
        let name = name.into();
        if self.names.contains(&name) {
            return Err(EngineError::DuplicateRule { name });
        }
        for trigger in triggers {
            debug!(rule = %name, trigger = %trigger, "rule bound");
            self.bindings.push(RuleBinding {
                name: name.clone(),
                trigger,
                rule: rule.clone(),
            });
        }
        self.names.insert(name);
        Ok(())
    }

    /// Bindings triggered by `control`, in declaration order.
    pub fn bindings_for<'s>(
        &'s self,
        control: &'s ControlRef,
    ) -> impl Iterator<Item = &'s RuleBinding> + 's {
        self.bindings.iter().filter(move |b| &b.trigger == control)
    }

    pub fn bindings(&self) -> &[RuleBinding] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Deliver every queued event and everything it cascades into.
    pub(crate) fn run(&self, cycle: &mut Cycle<'_>, max_depth: usize) {
        while let Some(event) = cycle.pending.pop_front() {
            if event.depth > max_depth {
                warn!(
                    control = %event.control,
                    depth = event.depth,
                    max_depth,
                    "cascade depth exceeded, event dropped"
                );
                cycle.report.dropped_cascades += 1;
                let message = format!(
                    "cascade depth {} exceeded for {}, rules not triggered",
                    max_depth, event.control
                );
                cycle.log(LogLevel::Warn, &message);
                continue;
            }
            self.dispatch(cycle, &event);
        }
    }

    /// Invoke every binding of `event.control` exactly once, in order.
    fn dispatch(&self, cycle: &mut Cycle<'_>, event: &ChangeEvent) {
        cycle.report.events += 1;
        for binding in self.bindings_for(&event.control) {
            debug!(
                rule = %binding.name,
                control = %event.control,
                new = %event.new,
                "invoking rule"
            );
            cycle.report.rules_invoked += 1;

            let outcome = {
                let mut ctx = RuleContext::new(&binding.name, event, &mut *cycle);
                catch_unwind(AssertUnwindSafe(|| binding.rule.execute(&mut ctx)))
            };

            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(panic.as_ref()),
            };

            let failure = EngineError::InternalRuleError {
                rule: binding.name.clone(),
                message: message.clone(),
            };
            error!(rule = %binding.name, control = %event.control, error = %message, "rule failed");
            cycle.log(LogLevel::Error, &failure.to_string());
            cycle.report.failures.push(RuleFailure {
                rule: binding.name.clone(),
                message,
            });
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, QoS};
    use crate::device::loopback_device;
    use crate::log_sink::MemoryLogSink;
    use crate::rule::FnRule;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn gauge() -> ControlRef {
        ControlRef::new("loopback", "gauge")
    }

    fn loud() -> ControlRef {
        ControlRef::new("loopback", "set_loud")
    }

    struct Fixture {
        registry: ControlRegistry,
        router: PublicationRouter,
        log: MemoryLogSink,
    }

    impl Fixture {
        fn new() -> Self {
            let mut registry = ControlRegistry::new();
            registry.declare(&loopback_device()).unwrap();
            Self {
                registry,
                router: PublicationRouter::new(Arc::new(InMemoryBus::new()), QoS::AtLeastOnce),
                log: MemoryLogSink::new(),
            }
        }

        fn press(
            &mut self,
            dispatcher: &RuleDispatcher,
            control: &ControlRef,
            max_depth: usize,
        ) -> DispatchReport {
            let mut cycle = Cycle::new(&mut self.registry, &self.router, Uuid::new_v4());
            let event = cycle.apply_inbound(control, "1").unwrap();
            cycle.enqueue(event);
            dispatcher.run(&mut cycle, max_depth);
            let (report, emissions) = cycle.finish();
            assert!(self.router.submit(emissions));
            self.router.drain(&self.log).unwrap();
            report
        }
    }

    fn recorder(order: Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Arc<dyn Rule> {
        Arc::new(FnRule::new(move |_ctx: &mut RuleContext<'_>| {
            order.lock().unwrap().push(tag);
            Ok(())
        }))
    }

    #[test]
    fn test_bindings_run_in_declaration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = RuleDispatcher::new();
        dispatcher.bind("first", loud(), recorder(order.clone(), "first")).unwrap();
        dispatcher.bind("other", gauge(), recorder(order.clone(), "other")).unwrap();
        dispatcher.bind("second", loud(), recorder(order.clone(), "second")).unwrap();

        let mut fx = Fixture::new();
        let report = fx.press(&dispatcher, &loud(), 8);

        assert_eq!(*order.lock().unwrap(), ["first", "second"]);
        assert_eq!(report.rules_invoked, 2);
        assert_eq!(report.events, 1);
        assert!(report.is_clean());
    }

    #[test]
    fn test_duplicate_rule_name_rejected() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = RuleDispatcher::new();
        dispatcher.bind("r", loud(), recorder(order.clone(), "a")).unwrap();
        let err = dispatcher.bind("r", gauge(), recorder(order, "b")).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateRule { .. }));
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn test_bind_many_shares_rule() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = RuleDispatcher::new();
        let triggers = [loud(), ControlRef::new("loopback", "set_silent")];
        dispatcher
            .bind_many("buttons", triggers, recorder(order.clone(), "hit"))
            .unwrap();
        assert_eq!(dispatcher.len(), 2);

        let mut fx = Fixture::new();
        fx.press(&dispatcher, &loud(), 8);
        fx.press(&dispatcher, &ControlRef::new("loopback", "set_silent"), 8);
        assert_eq!(order.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_failing_and_panicking_rules_are_isolated() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = RuleDispatcher::new();
        dispatcher
            .bind("fails", loud(), Arc::new(FnRule::new(|_ctx: &mut RuleContext<'_>| {
                Err(anyhow::anyhow!("boom"))
            })))
            .unwrap();
        dispatcher
            .bind("panics", loud(), Arc::new(FnRule::new(|_ctx: &mut RuleContext<'_>| {
                panic!("kaboom")
            })))
            .unwrap();
        dispatcher.bind("survivor", loud(), recorder(order.clone(), "ran")).unwrap();

        let mut fx = Fixture::new();
        let report = fx.press(&dispatcher, &loud(), 8);

        assert_eq!(*order.lock().unwrap(), ["ran"]);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].rule, "fails");
        assert_eq!(report.failures[0].message, "boom");
        assert_eq!(report.failures[1].message, "panic: kaboom");
        assert_eq!(
            fx.log.lines(),
            [
                "[error] rule 'fails' failed: boom",
                "[error] rule 'panics' failed: panic: kaboom",
            ]
        );
    }

    #[test]
    fn test_loud_set_is_dispatched_after_current_event() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = RuleDispatcher::new();
        let seen = order.clone();
        dispatcher
            .bind("setter", loud(), Arc::new(FnRule::new(move |ctx: &mut RuleContext<'_>| {
                ctx.set("loopback", "gauge", 42)?;
                seen.lock().unwrap().push("setter done");
                Ok(())
            })))
            .unwrap();
        dispatcher.bind("after setter", loud(), recorder(order.clone(), "after setter")).unwrap();
        dispatcher
            .bind("gauge watcher", gauge(), recorder(order.clone(), "gauge watcher"))
            .unwrap();

        let mut fx = Fixture::new();
        let report = fx.press(&dispatcher, &loud(), 8);

        assert_eq!(
            *order.lock().unwrap(),
            ["setter done", "after setter", "gauge watcher"]
        );
        assert_eq!(report.events, 2);
        assert_eq!(report.publications, 2);
    }

    #[test]
    fn test_silent_set_does_not_dispatch() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = RuleDispatcher::new();
        dispatcher
            .bind("setter", loud(), Arc::new(FnRule::new(|ctx: &mut RuleContext<'_>| {
                ctx.set_silent("loopback", "gauge", 84)?;
                Ok(())
            })))
            .unwrap();
        let hits = counter.clone();
        dispatcher
            .bind("gauge watcher", gauge(), Arc::new(FnRule::new(move |_ctx: &mut RuleContext<'_>| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })))
            .unwrap();

        let mut fx = Fixture::new();
        let report = fx.press(&dispatcher, &loud(), 8);

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(fx.registry.read(&gauge()).unwrap(), ControlValue::Number(84.0));
        assert_eq!(report.events, 1);
    }

    #[test]
    fn test_cascade_is_bounded() {
        let mut dispatcher = RuleDispatcher::new();
        dispatcher
            .bind("ping", gauge(), Arc::new(FnRule::new(|ctx: &mut RuleContext<'_>| {
                let next = ctx.event().new.as_f64().unwrap_or(0.0) + 1.0;
                ctx.set("loopback", "gauge", next)?;
                Ok(())
            })))
            .unwrap();

        let mut fx = Fixture::new();
        let report = fx.press(&dispatcher, &gauge(), 3);

        // depths 0..=3 dispatched, depth 4 dropped
        assert_eq!(report.events, 4);
        assert_eq!(report.dropped_cascades, 1);
        assert_eq!(fx.registry.read(&gauge()).unwrap(), ControlValue::Number(5.0));
        assert_eq!(
            fx.log.lines(),
            ["[warn] cascade depth 3 exceeded for loopback/gauge, rules not triggered"]
        );
    }

    #[test]
    fn test_rule_error_from_unknown_control() {
        let mut dispatcher = RuleDispatcher::new();
        dispatcher
            .bind("bad target", loud(), Arc::new(FnRule::new(|ctx: &mut RuleContext<'_>| {
                ctx.set("loopback", "missing", 1)?;
                Ok(())
            })))
            .unwrap();

        let mut fx = Fixture::new();
        let report = fx.press(&dispatcher, &loud(), 8);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].message, "unknown control: loopback/missing");
    }
}
