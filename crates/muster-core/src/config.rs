//! Engine configuration.
//!
//! Loaded from a YAML (or JSON) file; every field has a default so an empty
//! document is valid:
//!
//! ```yaml
//! default_task_timeout_secs: 300
//! observer_queue_capacity: 256
//! collaboration_retention_secs: 600
//! driver_tick_ms: 250
//! template_dirs: ["./sop"]
//! artifact_db_path: "/var/lib/muster/artifacts.db"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deadline for tasks without their own `timeout_seconds`.
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,

    /// Events buffered per progress observer before the oldest is dropped.
    #[serde(default = "default_observer_queue_capacity")]
    pub observer_queue_capacity: usize,

    /// How long resolved collaboration requests stay queryable.
    #[serde(default = "default_collaboration_retention_secs")]
    pub collaboration_retention_secs: u64,

    /// Driver housekeeping interval.
    #[serde(default = "default_driver_tick_ms")]
    pub driver_tick_ms: u64,

    /// Extra directories scanned for templates.
    #[serde(default)]
    pub template_dirs: Vec<String>,

    /// SQLite file for artifacts; in-memory storage when unset.
    #[serde(default)]
    pub artifact_db_path: Option<String>,
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_observer_queue_capacity() -> usize {
    crate::events::DEFAULT_OBSERVER_CAPACITY
}

fn default_collaboration_retention_secs() -> u64 {
    600
}

fn default_driver_tick_ms() -> u64 {
    250
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_task_timeout_secs: default_task_timeout_secs(),
            observer_queue_capacity: default_observer_queue_capacity(),
            collaboration_retention_secs: default_collaboration_retention_secs(),
            driver_tick_ms: default_driver_tick_ms(),
            template_dirs: Vec::new(),
            artifact_db_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Config(format!("Failed to parse config YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file '{}': {}", path, e)))?;
        if path.ends_with(".json") {
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| EngineError::Config(format!("Failed to parse config JSON: {}", e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Self::from_yaml(&content)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.default_task_timeout_secs == 0 {
            return Err(EngineError::Config(
                "default_task_timeout_secs must be positive".to_string(),
            ));
        }
        if self.driver_tick_ms == 0 {
            return Err(EngineError::Config("driver_tick_ms must be positive".to_string()));
        }
        if self.observer_queue_capacity == 0 {
            return Err(EngineError::Config(
                "observer_queue_capacity must be positive".to_string(),
            ));
        }
        if self.collaboration_retention_secs == 0 {
            return Err(EngineError::Config(
                "collaboration_retention_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }

    pub fn driver_tick(&self) -> Duration {
        Duration::from_millis(self.driver_tick_ms)
    }

    pub fn collaboration_retention(&self) -> Duration {
        Duration::from_secs(self.collaboration_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_yaml("{}").unwrap();
        assert_eq!(config.default_task_timeout_secs, 300);
        assert_eq!(config.observer_queue_capacity, 256);
        assert_eq!(config.collaboration_retention(), Duration::from_secs(600));
        assert_eq!(config.driver_tick(), Duration::from_millis(250));
        assert!(config.artifact_db_path.is_none());
    }

    #[test]
    fn test_overrides_and_validation() {
        let config = EngineConfig::from_yaml(
            "default_task_timeout_secs: 30\ntemplate_dirs: [\"./sop\"]\n",
        )
        .unwrap();
        assert_eq!(config.default_task_timeout(), Duration::from_secs(30));
        assert_eq!(config.template_dirs, vec!["./sop".to_string()]);

        assert!(matches!(
            EngineConfig::from_yaml("driver_tick_ms: 0"),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_zero_values_are_rejected() {
        for field in [
            "default_task_timeout_secs",
            "observer_queue_capacity",
            "collaboration_retention_secs",
            "driver_tick_ms",
        ] {
            let err = EngineConfig::from_yaml(&format!("{}: 0", field)).unwrap_err();
            assert!(
                matches!(&err, EngineError::Config(msg) if msg.contains(field)),
                "{} accepted zero: {:?}",
                field,
                err
            );
        }
    }
}
