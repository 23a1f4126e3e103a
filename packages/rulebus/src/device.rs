//! Device and control declarations.
//!
//! Declarations come from configuration (JSON device files) or are built in
//! code. They are consumed once by the registry at engine construction.
//!
//! ```json
//! [{
//!   "name": "loopback",
//!   "controls": [
//!     { "name": "gauge", "type": "value", "value": 0 },
//!     { "name": "set_loud", "type": "pushbutton" }
//!   ]
//! }]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::value::{ControlType, ControlValue};

/// A virtual device with its controls, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    pub name: String,
    /// Human readable title published on `meta/name`; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub controls: Vec<ControlDefinition>,
}

impl DeviceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            controls: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_control(mut self, control: ControlDefinition) -> Self {
        self.controls.push(control);
        self
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.name)
    }
}

/// A single control of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ControlType,
    /// Initial value; pushbuttons normally have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ControlValue>,
    /// Overrides the type's retained default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retained: Option<bool>,
    /// Upper bound for `range` controls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default)]
    pub readonly: bool,
}

impl ControlDefinition {
    pub fn new(name: impl Into<String>, kind: ControlType) -> Self {
        Self {
            name: name.into(),
            kind,
            value: None,
            retained: None,
            max: None,
            readonly: false,
        }
    }

    pub fn with_value(mut self, value: impl Into<ControlValue>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = Some(retained);
        self
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Effective retained policy.
    pub fn is_retained(&self) -> bool {
        self.retained.unwrap_or_else(|| self.kind.default_retained())
    }
}

/// Load device definitions from a JSON file containing an array of devices.
pub fn load_devices(path: &Path) -> Result<Vec<DeviceDefinition>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read device file {}", path.display()))?;
    parse_devices(&raw).with_context(|| format!("invalid device file {}", path.display()))
}

/// Parse device definitions from a JSON array.
pub fn parse_devices(raw: &str) -> Result<Vec<DeviceDefinition>> {
    let devices: Vec<DeviceDefinition> = serde_json::from_str(raw)?;
    Ok(devices)
}

/// The loopback device used by the built-in demo rules.
pub fn loopback_device() -> DeviceDefinition {
    DeviceDefinition::new("loopback")
        .with_control(ControlDefinition::new("gauge", ControlType::Value).with_value(0))
        .with_control(ControlDefinition::new("set_loud", ControlType::PushButton))
        .with_control(ControlDefinition::new("set_silent", ControlType::PushButton))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_file() {
        let devices = parse_devices(
            r#"[{
                "name": "loopback",
                "controls": [
                    { "name": "gauge", "type": "value", "value": 0 },
                    { "name": "set_loud", "type": "pushbutton" },
                    { "name": "level", "type": "range", "max": 100, "retained": false }
                ]
            }]"#,
        )
        .unwrap();

        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.display_title(), "loopback");
        assert_eq!(device.controls[0].value, Some(ControlValue::Number(0.0)));
        assert!(device.controls[0].is_retained());
        assert!(!device.controls[1].is_retained());
        assert_eq!(device.controls[2].max, Some(100.0));
        assert!(!device.controls[2].is_retained());
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let err = parse_devices(r#"[{ "name": "d", "controls": [{ "name": "c", "type": "rgb" }] }]"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_loopback_device_shape() {
        let device = loopback_device();
        let names: Vec<_> = device.controls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["gauge", "set_loud", "set_silent"]);
        assert_eq!(device.with_title("Loopback").display_title(), "Loopback");
    }

    #[test]
    fn test_load_devices_reports_missing_file() {
        let err = load_devices(Path::new("/nonexistent/devices.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read device file"));
    }
}
