//! Rule trait and the context handed to rule callbacks.
//!
//! Rules are opaque to the engine: anything that can `execute(context)`.
//! The context is intentionally narrow:
//!
//! | Capability | Method                                  |
//! |------------|-----------------------------------------|
//! | Read       | [`RuleContext::read`], [`RuleContext::get`] |
//! | Set        | [`RuleContext::set`], [`RuleContext::set_silent`], [`RuleContext::set_cell`] |
//! | Log        | [`RuleContext::log`] and the level helpers |
//!
//! # Set Semantics
//!
//! Every set publishes the control's canonical state immediately. A loud
//! set additionally queues a [`ChangeEvent`] that the dispatcher delivers
//! after all rules of the current event have returned; a silent set queues
//! nothing. Rules are never re-entered from inside another rule.
//!
//! # Example
//!
//! ```ignore
//! let engine = EngineBuilder::new(bus, log_sink)
//!     .with_device(loopback_device())
//!     .with_fn_rule("announce gauge", "loopback/gauge", |ctx| {
//!         ctx.info(format!("gauge set to {}", ctx.event().new));
//!         Ok(())
//!     })
//!     .with_fn_rule("loud button", "loopback/set_loud", |ctx| {
//!         ctx.info("set_loud button pressed");
//!         ctx.set_cell("loopback/gauge", 42)?;
//!         Ok(())
//!     })
//!     .build()?;
//! ```

use anyhow::Result;
use uuid::Uuid;

use crate::bus::Publication;
use crate::error::EngineError;
use crate::log_sink::LogLevel;
use crate::registry::Applied;
use crate::topic::{CellRef, ControlRef};
use crate::value::ControlValue;

/// "Control C changed to value V": the unit of work the dispatcher delivers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub control: ControlRef,
    pub old: ControlValue,
    pub new: ControlValue,
    /// False when the write stored the value the control already had.
    pub changed: bool,
    /// 0 for inbound writes, parent depth + 1 for writes made by rules.
    pub depth: usize,
    /// Identifies the inbound stimulus this event descends from.
    pub cycle: Uuid,
}

impl ChangeEvent {
    pub(crate) fn from_applied(applied: Applied, depth: usize, cycle: Uuid) -> Self {
        Self {
            control: applied.control,
            old: applied.old,
            new: applied.new,
            changed: applied.changed,
            depth,
            cycle,
        }
    }
}

/// User logic bound to one or more controls.
///
/// Implementations must be fast and synchronous. State that survives
/// between invocations needs interior mutability (the engine only holds
/// `&self`). Errors and panics are contained by the dispatcher.
pub trait Rule: Send + Sync + 'static {
    fn execute(&self, ctx: &mut RuleContext<'_>) -> Result<()>;
}

/// Adapts a closure into a [`Rule`].
pub struct FnRule<F> {
    f: F,
}

impl<F> FnRule<F>
where
    F: Fn(&mut RuleContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Rule for FnRule<F>
where
    F: Fn(&mut RuleContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    fn execute(&self, ctx: &mut RuleContext<'_>) -> Result<()> {
        (self.f)(ctx)
    }
}

/// Operations a dispatch cycle provides to rules.
pub(crate) trait CycleOps {
    fn read(&self, control: &ControlRef) -> Result<ControlValue, EngineError>;

    fn write(
        &mut self,
        control: &ControlRef,
        value: ControlValue,
        notify: bool,
        depth: usize,
    ) -> Result<Publication, EngineError>;

    fn log(&mut self, level: LogLevel, message: &str);
}

/// Context passed to [`Rule::execute`].
pub struct RuleContext<'a> {
    rule: &'a str,
    event: &'a ChangeEvent,
    cycle: &'a mut dyn CycleOps,
}

impl<'a> RuleContext<'a> {
    pub(crate) fn new(rule: &'a str, event: &'a ChangeEvent, cycle: &'a mut dyn CycleOps) -> Self {
        Self { rule, event, cycle }
    }

    /// Name of the binding being executed.
    pub fn rule_name(&self) -> &str {
        self.rule
    }

    /// The change that triggered this invocation.
    pub fn event(&self) -> &ChangeEvent {
        self.event
    }

    /// Current value of any declared control.
    pub fn read(&self, device: &str, control: &str) -> Result<ControlValue, EngineError> {
        self.cycle.read(&ControlRef::new(device, control))
    }

    /// Current value of a control addressed as `device/control`.
    pub fn get(&self, cell: &str) -> Result<ControlValue, EngineError> {
        let cell: CellRef = cell.parse()?;
        self.cycle.read(&cell.control)
    }

    /// Set a control and notify the rules bound to it.
    pub fn set(
        &mut self,
        device: &str,
        control: &str,
        value: impl Into<ControlValue>,
    ) -> Result<Publication, EngineError> {
        self.write(CellRef::loud(ControlRef::new(device, control)), value.into())
    }

    /// Set a control without notifying any rule.
    pub fn set_silent(
        &mut self,
        device: &str,
        control: &str,
        value: impl Into<ControlValue>,
    ) -> Result<Publication, EngineError> {
        self.write(CellRef::silent(ControlRef::new(device, control)), value.into())
    }

    /// Set a control addressed as `device/control` (loud) or `device/control~` (silent).
    pub fn set_cell(
        &mut self,
        cell: &str,
        value: impl Into<ControlValue>,
    ) -> Result<Publication, EngineError> {
        let cell: CellRef = cell.parse()?;
        self.write(cell, value.into())
    }

    fn write(&mut self, cell: CellRef, value: ControlValue) -> Result<Publication, EngineError> {
        let depth = self.event.depth + 1;
        self.cycle.write(&cell.control, value, cell.notify, depth)
    }

    pub fn log(&mut self, level: LogLevel, message: impl AsRef<str>) {
        self.cycle.log(level, message.as_ref());
    }

    pub fn debug(&mut self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message);
    }
}
