//! Control types and values.
//!
//! A control's value is the smallest useful union of payload kinds:
//! boolean, number or string. The declared [`ControlType`] decides how raw
//! bus payloads are parsed and how values set by rules are coerced.
//!
//! # Payload Format
//!
//! | Value            | Payload |
//! |------------------|---------|
//! | `Bool(true)`     | `1`     |
//! | `Bool(false)`    | `0`     |
//! | `Number(42.0)`   | `42`    |
//! | `Number(0.5)`    | `0.5`   |
//! | `Text("on")`     | `on`    |

use std::fmt;

use serde::{Deserialize, Serialize};

/// Largest magnitude rendered as an integer payload.
const MAX_INTEGRAL_PAYLOAD: f64 = 1e15;

/// Declared type of a control.
///
/// The lower-case name is what gets published on the control's
/// `meta/type` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlType {
    /// On/off state.
    Switch,
    /// Momentary button; every press is an event and it never retains.
    PushButton,
    /// Free numeric value.
    Value,
    /// Numeric value bounded by `0..=max`.
    Range,
    /// Arbitrary text.
    Text,
}

impl ControlType {
    /// Name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlType::Switch => "switch",
            ControlType::PushButton => "pushbutton",
            ControlType::Value => "value",
            ControlType::Range => "range",
            ControlType::Text => "text",
        }
    }

    /// Whether canonical publications of this type carry the retained flag
    /// unless the declaration says otherwise.
    pub fn default_retained(&self) -> bool {
        !matches!(self, ControlType::PushButton)
    }

    /// Value reported for a declared control that was never written.
    pub fn default_value(&self) -> ControlValue {
        match self {
            ControlType::Switch | ControlType::PushButton => ControlValue::Bool(false),
            ControlType::Value | ControlType::Range => ControlValue::Number(0.0),
            ControlType::Text => ControlValue::Text(String::new()),
        }
    }

    /// Parse a raw bus payload.
    ///
    /// Returns `None` when the payload cannot represent a value of this type.
    pub fn parse(&self, raw: &str) -> Option<ControlValue> {
        match self {
            ControlType::Switch | ControlType::PushButton => parse_bool(raw).map(ControlValue::Bool),
            ControlType::Value | ControlType::Range => parse_number(raw).map(ControlValue::Number),
            ControlType::Text => Some(ControlValue::Text(raw.to_string())),
        }
    }

    /// Convert a value supplied by a rule into this type.
    pub fn coerce(&self, value: ControlValue) -> Option<ControlValue> {
        match (self, value) {
            (ControlType::Text, v) => Some(ControlValue::Text(v.to_string())),
            (ControlType::Switch | ControlType::PushButton, ControlValue::Bool(b)) => {
                Some(ControlValue::Bool(b))
            }
            (ControlType::Switch | ControlType::PushButton, ControlValue::Number(n)) => {
                Some(ControlValue::Bool(n != 0.0))
            }
            (ControlType::Value | ControlType::Range, ControlValue::Number(n)) if n.is_finite() => {
                Some(ControlValue::Number(n))
            }
            (ControlType::Value | ControlType::Range, ControlValue::Bool(b)) => {
                Some(ControlValue::Number(if b { 1.0 } else { 0.0 }))
            }
            (kind, ControlValue::Text(s)) => kind.parse(&s),
            _ => None,
        }
    }
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current value of a control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ControlValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ControlValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ControlValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ControlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness used by rules that treat any control as a condition.
    pub fn is_truthy(&self) -> bool {
        match self {
            ControlValue::Bool(b) => *b,
            ControlValue::Number(n) => *n != 0.0,
            ControlValue::Text(s) => !s.is_empty(),
        }
    }

    /// Bus payload for this value.
    pub fn to_payload(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlValue::Bool(true) => f.write_str("1"),
            ControlValue::Bool(false) => f.write_str("0"),
            ControlValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < MAX_INTEGRAL_PAYLOAD {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            ControlValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ControlValue {
    fn from(b: bool) -> Self {
        ControlValue::Bool(b)
    }
}

impl From<f64> for ControlValue {
    fn from(n: f64) -> Self {
        ControlValue::Number(n)
    }
}

impl From<i32> for ControlValue {
    fn from(n: i32) -> Self {
        ControlValue::Number(f64::from(n))
    }
}

impl From<u32> for ControlValue {
    fn from(n: u32) -> Self {
        ControlValue::Number(f64::from(n))
    }
}

impl From<i64> for ControlValue {
    fn from(n: i64) -> Self {
        ControlValue::Number(n as f64)
    }
}

impl From<&str> for ControlValue {
    fn from(s: &str) -> Self {
        ControlValue::Text(s.to_string())
    }
}

impl From<String> for ControlValue {
    fn from(s: String) -> Self {
        ControlValue::Text(s)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}
