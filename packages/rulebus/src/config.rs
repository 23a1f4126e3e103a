use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;

use crate::bus::QoS;

/// Default bound on rule-triggered cascades per inbound message.
pub const DEFAULT_MAX_CASCADE_DEPTH: usize = 8;

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// QoS applied to every outbound publication.
    pub qos: QoS,
    pub max_cascade_depth: usize,
    /// JSON file with additional device declarations.
    pub devices_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            max_cascade_depth: DEFAULT_MAX_CASCADE_DEPTH,
            devices_file: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            qos: match lookup("RULEBUS_QOS") {
                Some(raw) => raw
                    .parse::<QoS>()
                    .map_err(anyhow::Error::msg)
                    .context("RULEBUS_QOS must be 0, 1 or 2")?,
                None => defaults.qos,
            },
            max_cascade_depth: match lookup("RULEBUS_MAX_CASCADE_DEPTH") {
                Some(raw) => raw
                    .parse()
                    .context("RULEBUS_MAX_CASCADE_DEPTH must be a valid number")?,
                None => defaults.max_cascade_depth,
            },
            devices_file: lookup("RULEBUS_DEVICES")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        })
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_max_cascade_depth(mut self, depth: usize) -> Self {
        self.max_cascade_depth = depth;
        self
    }
}
