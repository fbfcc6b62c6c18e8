//! Lat/lon flux grids at one instant, in one or several altitude layers.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{GridConfig, GridMode};
use crate::{FluxError, FluxGateway, FluxPoint, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluxGrid {
    /// Evaluation time after bucketing
    pub t: DateTime<Utc>,
    pub channel: String,
    pub percentile: String,
    pub latitudes: Vec<f64>,
    pub longitudes: Vec<f64>,
    pub altitudes_km: Vec<f64>,
    /// `values[alt][lat][lon]`
    pub values: Vec<Vec<Vec<f64>>>,
}

/// -90..=90 by `step`.
pub fn latitudes(step: f64) -> Vec<f64> {
    let n = (180.0 / step).floor() as usize;
    (0..=n).map(|i| -90.0 + i as f64 * step).collect()
}

/// -180..180 by `step`, antimeridian once.
pub fn longitudes(step: f64) -> Vec<f64> {
    let n = (360.0 / step).ceil() as usize;
    (0..n)
        .map(|i| -180.0 + i as f64 * step)
        .filter(|lon| *lon < 180.0)
        .collect()
}

/// Floor `t` to a multiple of `bucket_sec`; a zero bucket leaves it as is.
pub fn bucket_time(t: DateTime<Utc>, bucket_sec: i64) -> DateTime<Utc> {
    if bucket_sec <= 0 {
        return t;
    }
    let floored = t.timestamp().div_euclid(bucket_sec) * bucket_sec;
    Utc.timestamp_opt(floored, 0).single().unwrap_or(t)
}

fn altitudes(config: &GridConfig, alt_km: Option<f64>) -> Vec<f64> {
    match config.mode {
        GridMode::ThreeD => config.alt_layers_km.clone(),
        GridMode::TwoD => vec![alt_km.unwrap_or(config.default_alt_km)],
    }
}

impl FluxGateway {
    /// One channel over the full grid. The instant is bucketed first so nearby
    /// requests share cache entries; points go to the model in chunks of at
    /// most `max_points_per_call`.
    pub async fn compute_grid(
        &self,
        t: DateTime<Utc>,
        channel: &str,
        percentile: &str,
        alt_km: Option<f64>,
    ) -> Result<FluxGrid> {
        let grid = &self.config().grid;
        let t = bucket_time(t, grid.time_bucket_sec);
        let lats = latitudes(grid.lat_step_deg);
        let lons = longitudes(grid.lon_step_deg);
        let alts = altitudes(grid, alt_km);

        let mut points = Vec::with_capacity(alts.len() * lats.len() * lons.len());
        for &alt_km in &alts {
            for &lat in &lats {
                for &lon in &lons {
                    points.push(FluxPoint { t, lat, lon, alt_km });
                }
            }
        }

        let channels = vec![channel.to_string()];
        let mut flat = Vec::with_capacity(points.len());
        for chunk in points.chunks(grid.max_points_per_call) {
            let batch = self.model.flux_batch(chunk, &channels, percentile).await?;
            for values in batch {
                let value = values.get(channel).copied().ok_or_else(|| {
                    FluxError::Malformed(format!("grid point missing channel {}", channel))
                })?;
                flat.push(value);
            }
        }

        debug!(
            %t,
            channel,
            points = points.len(),
            calls = points.len().div_ceil(grid.max_points_per_call),
            "flux grid computed"
        );

        let per_layer = lats.len() * lons.len();
        let values = flat
            .chunks(per_layer.max(1))
            .map(|layer| layer.chunks(lons.len().max(1)).map(<[f64]>::to_vec).collect())
            .collect();

        Ok(FluxGrid {
            t,
            channel: channel.to_string(),
            percentile: percentile.to_string(),
            latitudes: lats,
            longitudes: lons,
            altitudes_km: alts,
            values,
        })
    }
}
