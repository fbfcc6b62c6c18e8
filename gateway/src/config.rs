//! Service configuration.
//!
//! One YAML document; every section and field is optional and falls back to
//! its default. The whole document is validated before any service sees it.

use decision_engine::{DecisionConfig, DecisionError};
use flux_gateway::{FluxConfig, FluxError};
use orbital_mechanics::{OrbitConfig, OrbitalError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tle_ingest::{IngestError, TleQualityConfig, TleSourceConfig};
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Orbit(#[from] OrbitalError),
    #[error(transparent)]
    Tle(#[from] IngestError),
    #[error(transparent)]
    Flux(#[from] FluxError),
    #[error(transparent)]
    Decision(#[from] DecisionError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub orbits: OrbitConfig,
    pub tle_quality: TleQualityConfig,
    pub tle_source: TleSourceConfig,
    pub flux: FluxConfig,
    pub decision: DecisionConfig,
}

impl AppConfig {
    /// Load and validate `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("no config at {}, using defaults", path.display());
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&text)?;
        info!("config loaded from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orbits.validate()?;
        self.tle_quality.validated()?;
        self.tle_source.validate()?;
        self.flux.validate()?;
        self.decision.validated()?;
        Ok(())
    }
}
