//! Structured error types for the dispatch engine.
//!
//! `EngineError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Rule bodies are free to use `anyhow` internally; the
//! dispatcher converts whatever they return into
//! [`EngineError::InternalRuleError`] at the rule boundary.
//!
//! # The Error Boundary Rule
//!
//! > **No error ever escapes a dispatch cycle to terminate the process.**
//!
//! - `UnknownControl` aborts the single operation that named the control
//! - `InvalidValueKind` rejects the write (no canonical publication, no dispatch)
//! - `InternalRuleError` is logged and sibling rules keep running
//!
//! # Example
//!
//! ```ignore
//! match engine.handle_inbound(topic, payload) {
//!     Ok(report) => debug!(?report, "dispatched"),
//!     Err(EngineError::UnknownControl { device, control }) => {
//!         warn!(%device, %control, "write to undeclared control");
//!     }
//!     Err(e) => warn!(error = %e, "inbound message rejected"),
//! }
//! ```

use thiserror::Error;

use crate::value::ControlType;

/// Errors produced by the control registry, dispatcher and engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A control was referenced that is not present in the registry.
    #[error("unknown control: {device}/{control}")]
    UnknownControl { device: String, control: String },

    /// A payload could not be coerced to the control's declared type.
    #[error("invalid value for {device}/{control} ({kind}): {raw:?}")]
    InvalidValueKind {
        device: String,
        control: String,
        kind: ControlType,
        raw: String,
    },

    /// A rule callback returned an error or panicked.
    #[error("rule '{rule}' failed: {message}")]
    InternalRuleError { rule: String, message: String },

    /// The topic is not an inbound `/devices/<device>/controls/<control>/on` topic.
    #[error("not a control write topic: {0}")]
    InvalidTopic(String),

    /// A `device/control` reference could not be parsed.
    #[error("invalid control reference: {0:?}")]
    InvalidControlRef(String),

    /// A control was declared twice.
    #[error("control already declared: {device}/{control}")]
    DuplicateControl { device: String, control: String },

    /// Two rule bindings share the same name.
    #[error("rule already registered: {name}")]
    DuplicateRule { name: String },

    /// The message bus refused a publication or subscription.
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl EngineError {
    pub(crate) fn unknown(device: &str, control: &str) -> Self {
        EngineError::UnknownControl {
            device: device.to_string(),
            control: control.to_string(),
        }
    }

    /// Returns true for errors that reject a single write without
    /// indicating a wiring problem in the engine.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownControl { .. }
                | EngineError::InvalidValueKind { .. }
                | EngineError::InvalidTopic(_)
        )
    }
}

/// Errors reported by [`MessageBus`](crate::bus::MessageBus) adapters.
#[derive(Debug, Error)]
pub enum BusError {
    /// The subscription pattern is malformed (e.g. `#` not in last position).
    #[error("invalid topic pattern: {0:?}")]
    InvalidPattern(String),

    /// The adapter is shut down and accepts no more traffic.
    #[error("message bus closed")]
    Closed,

    /// Adapter-specific transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_control_display() {
        let err = EngineError::unknown("loopback", "nope");
        assert_eq!(err.to_string(), "unknown control: loopback/nope");
        assert!(err.is_rejection());
    }

    #[test]
    fn test_invalid_value_display_names_kind() {
        let err = EngineError::InvalidValueKind {
            device: "loopback".into(),
            control: "gauge".into(),
            kind: ControlType::Value,
            raw: "abc".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for loopback/gauge (value): \"abc\""
        );
    }

    #[test]
    fn test_bus_error_is_transparent() {
        let err: EngineError = BusError::Closed.into();
        assert_eq!(err.to_string(), "message bus closed");
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_rule_error_is_not_a_rejection() {
        let err = EngineError::InternalRuleError {
            rule: "r".into(),
            message: "boom".into(),
        };
        assert!(!err.is_rejection());
        assert!(err.to_string().contains("boom"));
    }
}
