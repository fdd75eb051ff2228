//! Engine configuration.

use crucible_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for a running engine, loadable from YAML. Every field has a
/// default so an empty document is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between forced maintenance sweeps. Eager signals after
    /// schedule/cancel/completion run the sweep sooner; this is the
    /// backstop that also re-checks quiet periods and dead executors.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
    /// Seconds between load statistics samples.
    #[serde(default = "default_statistics_interval")]
    pub statistics_interval_secs: u64,
    /// Quiet period applied to projects that do not declare their own.
    #[serde(default = "default_quiet_period")]
    pub default_quiet_period_secs: u64,
    /// Completed build records kept before the oldest are evicted.
    #[serde(default = "default_build_registry_capacity")]
    pub build_registry_capacity: usize,
    /// Ring capacity of the event broadcast bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_maintenance_interval() -> u64 {
    5
}

fn default_statistics_interval() -> u64 {
    10
}

fn default_quiet_period() -> u64 {
    5
}

fn default_build_registry_capacity() -> usize {
    512
}

fn default_event_bus_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_secs: default_maintenance_interval(),
            statistics_interval_secs: default_statistics_interval(),
            default_quiet_period_secs: default_quiet_period(),
            build_registry_capacity: default_build_registry_capacity(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&content)
            .map_err(|e| Error::Internal(format!("parsing {}: {e}", path.display())))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn statistics_interval(&self) -> Duration {
        Duration::from_secs(self.statistics_interval_secs)
    }

    pub fn default_quiet_period(&self) -> Duration {
        Duration::from_secs(self.default_quiet_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: EngineConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.maintenance_interval_secs, 5);
        assert_eq!(config.build_registry_capacity, 512);
    }

    #[test]
    fn test_partial_override() {
        let config: EngineConfig =
            serde_yaml::from_str("maintenance_interval_secs: 1\ndefault_quiet_period_secs: 0\n")
                .unwrap();
        assert_eq!(config.maintenance_interval(), Duration::from_secs(1));
        assert_eq!(config.default_quiet_period(), Duration::ZERO);
        assert_eq!(config.statistics_interval_secs, 10);
    }
}
