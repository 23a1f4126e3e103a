//! Control Registry - the authoritative map of device → control → value.
//!
//! The registry owns every control's current value and its fixed retained
//! policy. Values change only through [`ControlRegistry::apply`] (raw bus
//! payloads) and [`ControlRegistry::set`] (typed values from rules).
//! Controls are never removed.

use indexmap::IndexMap;
use tracing::debug;

use crate::device::{ControlDefinition, DeviceDefinition};
use crate::error::EngineError;
use crate::topic::ControlRef;
use crate::value::{ControlType, ControlValue};

/// Stored state of one control.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    pub kind: ControlType,
    /// `None` until the first write for controls declared without a value.
    pub value: Option<ControlValue>,
    pub retained: bool,
    pub max: Option<f64>,
    pub readonly: bool,
    /// Position within the device, starting at 1.
    pub order: usize,
}

impl ControlState {
    fn from_definition(def: &ControlDefinition, order: usize) -> Self {
        Self {
            kind: def.kind,
            value: def.value.clone(),
            retained: def.is_retained(),
            max: def.max,
            readonly: def.readonly,
            order,
        }
    }

    /// Current value, or the type default for a never-written control.
    pub fn current(&self) -> ControlValue {
        self.value
            .clone()
            .unwrap_or_else(|| self.kind.default_value())
    }

    fn accepts(&self, value: &ControlValue) -> bool {
        match (self.kind, self.max, value) {
            (ControlType::Range, Some(max), ControlValue::Number(n)) => (0.0..=max).contains(n),
            _ => true,
        }
    }
}

/// Outcome of a successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub control: ControlRef,
    pub old: ControlValue,
    pub new: ControlValue,
    pub changed: bool,
    /// The control's fixed retained policy.
    pub retained: bool,
}

/// Registry of declared devices and controls.
#[derive(Debug, Default)]
pub struct ControlRegistry {
    devices: IndexMap<String, String>,
    controls: IndexMap<ControlRef, ControlState>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a device and its controls.
    ///
    /// Declaring more controls for an existing device extends it; declaring
    /// a control twice fails and leaves the registry untouched.
    pub fn declare(&mut self, device: &DeviceDefinition) -> Result<(), EngineError> {
        for def in &device.controls {
            let key = ControlRef::new(&device.name, &def.name);
            if self.controls.contains_key(&key) {
                return Err(EngineError::DuplicateControl {
                    device: key.device,
                    control: key.control,
                });
            }
        }

        self.devices
            .entry(device.name.clone())
            .or_insert_with(|| device.display_title().to_string());

        let base = self
            .controls
            .keys()
            .filter(|c| c.device == device.name)
            .count();
        for (i, def) in device.controls.iter().enumerate() {
            let key = ControlRef::new(&device.name, &def.name);
            debug!(control = %key, kind = %def.kind, "control declared");
            self.controls
                .insert(key, ControlState::from_definition(def, base + i + 1));
        }
        Ok(())
    }

    pub fn contains(&self, control: &ControlRef) -> bool {
        self.controls.contains_key(control)
    }

    pub fn state(&self, control: &ControlRef) -> Result<&ControlState, EngineError> {
        self.controls
            .get(control)
            .ok_or_else(|| EngineError::unknown(&control.device, &control.control))
    }

    /// Parse and store a raw payload received from the bus.
    ///
    /// An identical value still succeeds with `changed == false`.
    pub fn apply(&mut self, control: &ControlRef, raw: &str) -> Result<Applied, EngineError> {
        let state = self.state(control)?;
        let value = state
            .kind
            .parse(raw)
            .filter(|v| state.accepts(v))
            .ok_or_else(|| invalid(control, state.kind, raw))?;
        self.store(control, value)
    }

    /// Current value of a control.
    pub fn read(&self, control: &ControlRef) -> Result<ControlValue, EngineError> {
        Ok(self.state(control)?.current())
    }

    /// Store a typed value pushed by a rule, coercing it to the control type.
    pub fn set(&mut self, control: &ControlRef, value: ControlValue) -> Result<Applied, EngineError> {
        let state = self.state(control)?;
        let raw = value.to_payload();
        let value = state
            .kind
            .coerce(value)
            .filter(|v| state.accepts(v))
            .ok_or_else(|| invalid(control, state.kind, &raw))?;
        self.store(control, value)
    }

    fn store(&mut self, control: &ControlRef, value: ControlValue) -> Result<Applied, EngineError> {
        let state = self
            .controls
            .get_mut(control)
            .ok_or_else(|| EngineError::unknown(&control.device, &control.control))?;
        let old = state.current();
        let changed = state.value.as_ref() != Some(&value);
        state.value = Some(value.clone());
        Ok(Applied {
            control: control.clone(),
            old,
            new: value,
            changed,
            retained: state.retained,
        })
    }

    /// Declared devices with their titles, in declaration order.
    pub fn devices(&self) -> impl Iterator<Item = (&str, &str)> {
        self.devices.iter().map(|(n, t)| (n.as_str(), t.as_str()))
    }

    /// Declared controls, in declaration order.
    pub fn controls(&self) -> impl Iterator<Item = (&ControlRef, &ControlState)> {
        self.controls.iter()
    }

    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }
}

fn invalid(control: &ControlRef, kind: ControlType, raw: &str) -> EngineError {
    EngineError::InvalidValueKind {
        device: control.device.clone(),
        control: control.control.clone(),
        kind,
        raw: raw.to_string(),
    }
}
