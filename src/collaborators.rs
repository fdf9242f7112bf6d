//! Narrow seams for the external collaborators this crate does not
//! implement itself: the thermal watchdog, the settings file, and the
//! export/dashboard query.

use serde::{Deserialize, Serialize};

pub use crate::store::EXPORT_QUERY;

/// Consulted at the top of every engine loop iteration. A real implementation
/// watches host temperature or load average; this crate ships only the
/// no-op default so the engine is runnable standalone.
pub trait ThermalGovernor: Send + Sync {
    fn should_pause(&self, max_load: f64, cool_down_target: f64) -> bool;
}

/// Always reports no thermal pressure.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopThermalGovernor;

impl ThermalGovernor for NoopThermalGovernor {
    fn should_pause(&self, _max_load: f64, _cool_down_target: f64) -> bool {
        false
    }
}

/// Mirrors the settings-file keys an external orchestrator may own. The core
/// never reads or writes the JSON file itself; a caller that does can
/// deserialize into this struct and pass the derived fields through as CLI
/// flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub power_level: u32,
    pub max_load: f64,
    pub cool_down_target: f64,
    pub export_path: String,
    pub target_network: String,
    pub scan_speed: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            power_level: 50,
            max_load: 6.0,
            cool_down_target: 3.0,
            export_path: "export.json".to_string(),
            target_network: String::new(),
            scan_speed: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_governor_never_pauses() {
        let governor = NoopThermalGovernor;
        assert!(!governor.should_pause(100.0, 0.0));
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = ScannerConfig::default();
        assert_eq!(config.scan_speed, 300);
        assert_eq!(config.power_level, 50);
    }
}
