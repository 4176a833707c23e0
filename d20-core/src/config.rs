//! Engine settings.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Table-wide rules switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Derive iterative attacks from BAB for PC weapon attacks.
    pub auto_scale_attacks_bab: bool,
    /// Allow ranged weapon attacks without selecting ammunition.
    pub allow_no_ammo: bool,
    /// Nesting limit for formula-valued variables.
    pub max_formula_depth: usize,
    pub sole_natural_attack_multiplier: f64,
    pub secondary_attack_penalty: i64,
    pub multiattack_secondary_penalty: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_scale_attacks_bab: false,
            allow_no_ammo: true,
            max_formula_depth: crate::context::DEFAULT_MAX_DEPTH,
            sole_natural_attack_multiplier: 1.5,
            secondary_attack_penalty: -5,
            multiattack_secondary_penalty: -2,
        }
    }
}

impl EngineConfig {
    pub fn with_auto_scale_attacks_bab(mut self, enabled: bool) -> Self {
        self.auto_scale_attacks_bab = enabled;
        self
    }

    pub fn with_allow_no_ammo(mut self, allowed: bool) -> Self {
        self.allow_no_ammo = allowed;
        self
    }

    pub fn with_max_formula_depth(mut self, depth: usize) -> Self {
        self.max_formula_depth = depth;
        self
    }

    /// Read settings from a JSON file. Missing keys take their defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}
