//! Node configuration
//!
//! The horizon depths arrive from the host's config file at startup;
//! changing them at runtime is not supported.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Branching horizon must not exceed the erase horizon")]
    InvertedHorizon,
}

/// Pruning horizons, in blocks behind the tip
///
/// Zero disables a horizon. Branches whose entire subtree is older than the
/// branching horizon are deleted; bodies of canonical blocks older than the
/// erase horizon are dropped, leaving only headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horizon {
    pub branching: u64,
    pub erase: u64,
}

impl Horizon {
    /// Both horizons disabled
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Validated constructor
    pub fn new(branching: u64, erase: u64) -> Result<Self, ConfigError> {
        let horizon = Horizon { branching, erase };
        horizon.validate()?;
        Ok(horizon)
    }

    /// A rollback may not reach below the erase horizon, where bodies and
    /// rollback data no longer exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.branching != 0 && self.erase != 0 && self.branching > self.erase {
            return Err(ConfigError::InvertedHorizon);
        }
        Ok(())
    }
}

/// Top-level node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Database directory
    pub db_path: String,
    /// Pruning horizons
    #[serde(default)]
    pub horizon: Horizon,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            db_path: "data".to_string(),
            horizon: Horizon::disabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_horizon_validation() {
        assert!(Horizon::new(4, 8).is_ok());
        assert!(Horizon::new(8, 8).is_ok());
        assert!(Horizon::new(0, 8).is_ok());
        assert!(Horizon::new(4, 0).is_ok());
        assert_eq!(Horizon::new(9, 8), Err(ConfigError::InvertedHorizon));
    }

    #[test]
    fn test_config_deserializes_with_default_horizon() {
        let config: NodeConfig = serde_json::from_str(r#"{"db_path":"x"}"#).unwrap();
        assert_eq!(config.horizon, Horizon::disabled());
    }
}
