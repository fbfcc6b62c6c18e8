//! Flux model selection, mock profile and external model settings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::{FluxError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FluxModelKind {
    Mock,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridMode {
    /// One altitude
    #[serde(rename = "2d")]
    TwoD,
    /// Every configured altitude layer
    #[serde(rename = "3d")]
    ThreeD,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockProfile {
    pub quiet_altitude_km: f64,
    pub storm_altitude_km: f64,
    pub quiet_flux: f64,
    pub storm_flux: f64,
    /// Standard deviation of the multiplicative noise around 1.0
    pub jitter: f64,
    /// Fraction of the base magnitude per channel; unlisted channels get 1.0
    pub channel_fractions: BTreeMap<String, f64>,
}

impl Default for MockProfile {
    fn default() -> Self {
        let channel_fractions = [
            ("Je>100keV", 1.0),
            ("Je>1MeV", 0.5),
            ("Jp>10MeV", 0.2),
            ("Jp>50MeV", 0.05),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            quiet_altitude_km: 800.0,
            storm_altitude_km: 1200.0,
            quiet_flux: 1.0e2,
            storm_flux: 5.0e4,
            jitter: 0.05,
            channel_fractions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalModelConfig {
    /// Model executable; substituted for `{exe}`
    pub executable: Option<String>,
    /// Whitespace-separated argv with `{exe}`, `{input}` and `{output}` placeholders
    pub command_template: String,
    pub cache_dir: PathBuf,
    pub cache_ttl_sec: u64,
    pub timeout_sec: u64,
}

impl Default for ExternalModelConfig {
    fn default() -> Self {
        Self {
            executable: None,
            command_template: "{exe} --input {input} --output {output}".to_string(),
            cache_dir: PathBuf::from("data/flux_cache"),
            cache_ttl_sec: 24 * 3600,
            timeout_sec: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub mode: GridMode,
    pub lat_step_deg: f64,
    pub lon_step_deg: f64,
    /// Layers used in 3d mode
    pub alt_layers_km: Vec<f64>,
    /// Altitude used in 2d mode when the caller gives none
    pub default_alt_km: f64,
    /// Grid time is floored to this bucket; 0 disables bucketing
    pub time_bucket_sec: i64,
    pub max_points_per_call: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            mode: GridMode::TwoD,
            lat_step_deg: 5.0,
            lon_step_deg: 5.0,
            alt_layers_km: vec![500.0, 800.0, 1200.0],
            default_alt_km: 800.0,
            time_bucket_sec: 3600,
            max_points_per_call: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FluxConfig {
    pub model: FluxModelKind,
    pub percentile_default: String,
    pub channels: Vec<String>,
    pub mock_profile: MockProfile,
    pub external: ExternalModelConfig,
    pub grid: GridConfig,
}

impl Default for FluxConfig {
    fn default() -> Self {
        Self {
            model: FluxModelKind::Mock,
            percentile_default: "mean".to_string(),
            channels: ["Je>100keV", "Je>1MeV", "Jp>10MeV", "Jp>50MeV"]
                .into_iter()
                .map(String::from)
                .collect(),
            mock_profile: MockProfile::default(),
            external: ExternalModelConfig::default(),
            grid: GridConfig::default(),
        }
    }
}

/// Finest accepted lat/lon grid spacing.
pub const MIN_GRID_STEP_DEG: f64 = 0.1;
/// Largest grid (all layers) one request may evaluate.
pub const MAX_GRID_POINTS: usize = 1_000_000;
/// Longest accepted cache entry lifetime (one year).
pub const MAX_CACHE_TTL_SEC: u64 = 365 * 86_400;

fn invalid(msg: &str) -> FluxError {
    FluxError::InvalidConfig(msg.to_string())
}

impl FluxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(invalid("channels must not be empty"));
        }
        if self.percentile_default.trim().is_empty() {
            return Err(invalid("percentile_default must not be empty"));
        }

        let mock = &self.mock_profile;
        if mock.storm_altitude_km == mock.quiet_altitude_km {
            return Err(invalid("storm_altitude_km must differ from quiet_altitude_km"));
        }
        if !(mock.jitter >= 0.0 && mock.jitter.is_finite()) {
            return Err(invalid("mock jitter must be finite and >= 0"));
        }

        let ext = &self.external;
        if ext.timeout_sec == 0 {
            return Err(invalid("external timeout_sec must be > 0"));
        }
        if ext.cache_ttl_sec == 0 || ext.cache_ttl_sec > MAX_CACHE_TTL_SEC {
            return Err(invalid("external cache_ttl_sec must be within 1..=31536000"));
        }

        let grid = &self.grid;
        let step_ok = |step: f64| (MIN_GRID_STEP_DEG..=360.0).contains(&step);
        if !step_ok(grid.lat_step_deg) || !step_ok(grid.lon_step_deg) {
            return Err(invalid("grid lat/lon steps must be within 0.1..=360 degrees"));
        }
        if grid.max_points_per_call == 0 {
            return Err(invalid("grid max_points_per_call must be > 0"));
        }
        if grid.time_bucket_sec < 0 {
            return Err(invalid("grid time_bucket_sec must be >= 0"));
        }
        if grid.mode == GridMode::ThreeD && grid.alt_layers_km.is_empty() {
            return Err(invalid("3d grid needs at least one altitude layer"));
        }
        if grid.point_count() > MAX_GRID_POINTS {
            return Err(invalid("grid exceeds 1000000 points; widen the steps or drop layers"));
        }
        Ok(())
    }
}

impl GridConfig {
    /// Points in one full grid across every evaluated layer.
    pub fn point_count(&self) -> usize {
        let lats = (180.0 / self.lat_step_deg).floor() as usize + 1;
        let lons = (360.0 / self.lon_step_deg).ceil() as usize;
        let layers = match self.mode {
            GridMode::TwoD => 1,
            GridMode::ThreeD => self.alt_layers_km.len(),
        };
        lats.saturating_mul(lons).saturating_mul(layers)
    }
}
