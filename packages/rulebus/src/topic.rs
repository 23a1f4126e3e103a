//! Control addressing and the bus topic scheme.
//!
//! ```text
//! /devices/<device>/controls/<control>            canonical state
//! /devices/<device>/controls/<control>/on         client writes
//! /devices/<device>/controls/<control>/meta/<key> control metadata
//! /devices/<device>/meta/<key>                    device metadata
//! ```
//!
//! Rules address controls as `device/control`. A trailing `~`
//! (`loopback/gauge~`) asks for a silent write: the new state is published
//! but no rule is notified.

use std::fmt;
use std::str::FromStr;

use crate::error::{BusError, EngineError};

const DEVICES_PREFIX: &str = "/devices/";
const CONTROLS_SEGMENT: &str = "controls";
const ON_SUFFIX: &str = "on";
const SILENT_MARKER: char = '~';

/// Subscription pattern matching every control write topic.
pub const CONTROL_WRITE_PATTERN: &str = "/devices/+/controls/+/on";

/// Identity of a control: `(device, control)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlRef {
    pub device: String,
    pub control: String,
}

impl ControlRef {
    pub fn new(device: impl Into<String>, control: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            control: control.into(),
        }
    }

    /// Canonical state topic.
    pub fn topic(&self) -> String {
        format!(
            "{DEVICES_PREFIX}{}/{CONTROLS_SEGMENT}/{}",
            self.device, self.control
        )
    }

    /// Topic clients publish writes to.
    pub fn on_topic(&self) -> String {
        format!("{}/{ON_SUFFIX}", self.topic())
    }

    /// Metadata topic for this control (`meta/type`, `meta/order`, ...).
    pub fn meta_topic(&self, key: &str) -> String {
        format!("{}/meta/{key}", self.topic())
    }

    /// Parse an inbound write topic (`/devices/<d>/controls/<c>/on`).
    pub fn from_on_topic(topic: &str) -> Result<Self, EngineError> {
        let invalid = || EngineError::InvalidTopic(topic.to_string());
        let rest = topic.strip_prefix(DEVICES_PREFIX).ok_or_else(invalid)?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [device, CONTROLS_SEGMENT, control, ON_SUFFIX]
                if !device.is_empty() && !control.is_empty() =>
            {
                Ok(ControlRef::new(*device, *control))
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for ControlRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.control)
    }
}

impl FromStr for ControlRef {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cell: CellRef = s.parse()?;
        if !cell.notify {
            return Err(EngineError::InvalidControlRef(s.to_string()));
        }
        Ok(cell.control)
    }
}

/// A control reference as written by rules, including the notify flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRef {
    pub control: ControlRef,
    /// `false` when the reference carried the silent `~` marker.
    pub notify: bool,
}

impl CellRef {
    pub fn loud(control: ControlRef) -> Self {
        Self {
            control,
            notify: true,
        }
    }

    pub fn silent(control: ControlRef) -> Self {
        Self {
            control,
            notify: false,
        }
    }
}

impl FromStr for CellRef {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (body, notify) = match s.strip_suffix(SILENT_MARKER) {
            Some(body) => (body, false),
            None => (s, true),
        };
        let invalid = || EngineError::InvalidControlRef(s.to_string());
        let (device, control) = body.split_once('/').ok_or_else(invalid)?;
        if device.is_empty() || control.is_empty() || control.contains('/') {
            return Err(invalid());
        }
        Ok(CellRef {
            control: ControlRef::new(device, control),
            notify,
        })
    }
}

impl From<ControlRef> for CellRef {
    fn from(control: ControlRef) -> Self {
        CellRef::loud(control)
    }
}

/// Device metadata topic (`/devices/<device>/meta/<key>`).
pub fn device_meta_topic(device: &str, key: &str) -> String {
    format!("{DEVICES_PREFIX}{device}/meta/{key}")
}

/// Check that a subscription pattern is well formed.
///
/// `+` must occupy a whole level and `#` must be the whole last level.
pub fn validate_pattern(pattern: &str) -> Result<(), BusError> {
    let levels: Vec<&str> = pattern.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        let bad_plus = level.contains('+') && *level != "+";
        let bad_hash = level.contains('#') && (*level != "#" || i != last);
        if bad_plus || bad_hash {
            return Err(BusError::InvalidPattern(pattern.to_string()));
        }
    }
    Ok(())
}

/// MQTT-style topic matching with `+` (one level) and `#` (all remaining levels).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
