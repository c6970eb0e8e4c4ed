//! Scheduler Configuration
//!
//! Tunables with serde support for hot-reload, plus the state snapshot
//! carried across a reload.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Scheduler configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Merge compatible draws into instanced calls
    pub instancing: bool,

    /// Rows a new instance buffer reserves (at least 4)
    pub initial_instance_capacity: usize,

    /// Entries the order index reserves up front
    pub initial_entry_capacity: usize,

    /// Retry failed nodes at the start of every emit
    pub retry_failed_on_emit: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instancing: true,
            initial_instance_capacity: 16,
            initial_entry_capacity: 1024,
            retry_failed_on_emit: false,
        }
    }
}

impl SchedulerConfig {
    /// Configuration for backends without instancing support
    pub fn no_instancing() -> Self {
        Self {
            instancing: false,
            ..Default::default()
        }
    }

    /// Configuration for large, mostly static scenes
    pub fn large_scene() -> Self {
        Self {
            initial_instance_capacity: 256,
            initial_entry_capacity: 16384,
            ..Default::default()
        }
    }

    /// Parse from JSON, filling missing fields with defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject unusable values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_instance_capacity == 0 {
            return Err(ConfigError::Invalid(
                "initial_instance_capacity must be non-zero".into(),
            ));
        }
        if self.initial_entry_capacity == 0 {
            return Err(ConfigError::Invalid(
                "initial_entry_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Serialized scheduler state for hot-reload
///
/// Entries and settings are rebuilt from the scene after a restore.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Active configuration
    pub config: SchedulerConfig,
    /// Frames emitted so far
    pub frame: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SchedulerConfig::default();
        assert!(config.instancing);
        assert!(config.validate().is_ok());
        assert!(!SchedulerConfig::no_instancing().instancing);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config = SchedulerConfig::from_json(r#"{ "instancing": false }"#).unwrap();
        assert!(!config.instancing);
        assert_eq!(config.initial_entry_capacity, 1024);
    }

    #[test]
    fn test_config_rejects_zero_capacity() {
        let err = SchedulerConfig::from_json(r#"{ "initial_instance_capacity": 0 }"#);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
        assert!(matches!(SchedulerConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = SchedulerConfig::large_scene();
        let json = config.to_json().unwrap();
        assert_eq!(SchedulerConfig::from_json(&json).unwrap(), config);
    }
}
