//! Flux Model Gateway
//!
//! Batched flux lookup along a ground track or over a lat/lon grid.
//!
//! | Model | Behaviour |
//! |-------|-----------|
//! | [`MockFluxModel`] | Altitude interpolation between a quiet and a storm profile, seeded jitter |
//! | [`ExternalFluxModel`] | Model process behind [`FluxRunner`], results cached on disk by payload hash |
//!
//! The strategy is picked once in [`FluxGateway::from_config`]. An external
//! model without an executable or command template falls back to the mock.

use chrono::{DateTime, Utc};
use orbital_mechanics::TrackPoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

pub mod cache;
pub mod config;
pub mod external;
pub mod grid;
pub mod mock;

pub use cache::FluxCache;
pub use config::{ExternalModelConfig, FluxConfig, FluxModelKind, GridConfig, GridMode, MockProfile};
pub use external::{CommandRunner, ExternalFluxModel, FluxRequest, FluxRunner};
pub use grid::FluxGrid;
pub use mock::MockFluxModel;

#[derive(Error, Debug)]
pub enum FluxError {
    #[error("Flux model process failed: {0}")]
    Process(String),
    #[error("Flux model process timed out after {0}s")]
    Timeout(u64),
    #[error("Malformed flux model output: {0}")]
    Malformed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid flux configuration: {0}")]
    InvalidConfig(String),
    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, FluxError>;

/// Channel name → flux value for one point.
pub type ChannelValues = BTreeMap<String, f64>;

/// Where and when to evaluate the flux model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FluxPoint {
    pub t: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub alt_km: f64,
}

impl From<&TrackPoint> for FluxPoint {
    fn from(p: &TrackPoint) -> Self {
        Self {
            t: p.t,
            lat: p.lat,
            lon: p.lon,
            alt_km: p.alt_km,
        }
    }
}

/// One (time, channel) flux value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluxSample {
    pub t: DateTime<Utc>,
    pub channel: String,
    pub value: f64,
    pub percentile: String,
}

// ============================================================================
// Strategy
// ============================================================================

pub enum FluxModel {
    Mock(MockFluxModel),
    External(ExternalFluxModel),
}

impl FluxModel {
    pub fn name(&self) -> &'static str {
        match self {
            FluxModel::Mock(_) => "mock",
            FluxModel::External(_) => "external",
        }
    }

    /// One channel map per input point, index-aligned. The external model
    /// either fulfils the whole batch or fails it.
    pub async fn flux_batch(
        &self,
        points: &[FluxPoint],
        channels: &[String],
        percentile: &str,
    ) -> Result<Vec<ChannelValues>> {
        match self {
            FluxModel::Mock(m) => Ok(points.iter().map(|p| m.flux(p, channels)).collect()),
            FluxModel::External(m) => m.flux_batch(points, channels, percentile).await,
        }
    }
}

// ============================================================================
// Gateway
// ============================================================================

pub struct FluxGateway {
    config: FluxConfig,
    model: FluxModel,
}

impl FluxGateway {
    pub fn from_config(config: &FluxConfig) -> Result<Self> {
        config.validate()?;

        let model = match config.model {
            FluxModelKind::Mock => FluxModel::Mock(MockFluxModel::new(config.mock_profile.clone())),
            FluxModelKind::External => match ExternalFluxModel::from_config(&config.external) {
                Some(external) => FluxModel::External(external),
                None => {
                    warn!("external flux model incompletely configured, falling back to mock");
                    FluxModel::Mock(MockFluxModel::new(config.mock_profile.clone()))
                }
            },
        };
        debug!(model = model.name(), channels = config.channels.len(), "flux gateway ready");

        Ok(Self {
            config: config.clone(),
            model,
        })
    }

    /// Gateway over a caller-supplied model.
    pub fn with_model(config: &FluxConfig, model: FluxModel) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            model,
        })
    }

    pub fn config(&self) -> &FluxConfig {
        &self.config
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    /// Flux for every configured channel at each point.
    pub async fn flux_batch(
        &self,
        points: &[FluxPoint],
        percentile: &str,
    ) -> Result<Vec<ChannelValues>> {
        self.model.flux_batch(points, &self.config.channels, percentile).await
    }

    /// Flattened (time, channel) series along a track, in track order then
    /// configured channel order.
    pub async fn compute_series(
        &self,
        track: &[TrackPoint],
        percentile: &str,
    ) -> Result<Vec<FluxSample>> {
        let points: Vec<FluxPoint> = track.iter().map(FluxPoint::from).collect();
        let batch = self.flux_batch(&points, percentile).await?;

        let mut series = Vec::with_capacity(points.len() * self.config.channels.len());
        for (point, values) in points.iter().zip(batch) {
            for channel in &self.config.channels {
                if let Some(&value) = values.get(channel) {
                    series.push(FluxSample {
                        t: point.t,
                        channel: channel.clone(),
                        value,
                        percentile: percentile.to_string(),
                    });
                }
            }
        }
        Ok(series)
    }
}
