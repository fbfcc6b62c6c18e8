//! Orbit propagator: single states and ground tracks from a scored TLE.
//!
//! Every point is computed independently from the parsed model, so the track
//! is evaluated in parallel with rayon. A numerical failure drops only the
//! affected instant.

use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::propagation::Sgp4Model;
use crate::{transforms, OrbitState, OrbitalError, Result, TleSet, TrackPoint};

/// Propagation cadence and horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbitConfig {
    /// Background TLE refresh period
    pub refresh_rate_sec: u64,
    /// Track length when only a start time is given
    pub prediction_horizon_sec: i64,
    /// How far back TLE selection looks
    pub history_days: i64,
    pub track_step_sec: i64,
    /// Track length centred on "now" when no bounds are given
    pub track_length_sec: i64,
    /// Largest track one call may compute
    pub max_track_points: usize,
}

/// Longest accepted horizon or default track length (one year).
pub const MAX_SPAN_SEC: i64 = 366 * 86_400;
/// Longest accepted TLE history lookback.
pub const MAX_HISTORY_DAYS: i64 = 3650;

impl Default for OrbitConfig {
    fn default() -> Self {
        Self {
            refresh_rate_sec: 900,
            prediction_horizon_sec: 4 * 3600,
            history_days: 14,
            track_step_sec: 60,
            track_length_sec: 7200,
            max_track_points: 100_000,
        }
    }
}

impl OrbitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.refresh_rate_sec == 0 {
            return Err(OrbitalError::InvalidConfig("refresh_rate_sec must be > 0".into()));
        }
        if self.track_step_sec <= 0 {
            return Err(OrbitalError::InvalidConfig("track_step_sec must be > 0".into()));
        }
        let span_ok = |sec: i64| (1..=MAX_SPAN_SEC).contains(&sec);
        if !span_ok(self.prediction_horizon_sec) || !span_ok(self.track_length_sec) {
            return Err(OrbitalError::InvalidConfig(
                "prediction_horizon_sec and track_length_sec must be within 1..=31622400".into(),
            ));
        }
        if !(1..=MAX_HISTORY_DAYS).contains(&self.history_days) {
            return Err(OrbitalError::InvalidConfig(
                "history_days must be within 1..=3650".into(),
            ));
        }
        if self.max_track_points == 0 {
            return Err(OrbitalError::InvalidConfig("max_track_points must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrbitPropagator {
    config: OrbitConfig,
}

impl OrbitPropagator {
    pub fn new(config: OrbitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OrbitConfig {
        &self.config
    }

    /// Propagate `tle` to `t` and convert to geodetic coordinates.
    pub fn propagate(&self, tle: &TleSet, t: DateTime<Utc>) -> Result<OrbitState> {
        let model = Sgp4Model::from_lines(&tle.line1, &tle.line2)?;
        state_from_model(&model, tle, t)
    }

    /// Ground track from `start` to `end` inclusive of `start`, stepping by
    /// `step_sec`. Points whose propagation fails are dropped and logged.
    /// Fails with [`OrbitalError::TooManyPoints`] before any work when the
    /// range holds more than `max_track_points` instants.
    pub fn track(
        &self,
        tle: &TleSet,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_sec: i64,
    ) -> Result<Vec<TrackPoint>> {
        if step_sec <= 0 {
            return Err(OrbitalError::InvalidStep(step_sec));
        }
        let span_sec = (end - start).num_seconds();
        if span_sec < 0 {
            return Ok(Vec::new());
        }
        let requested = span_sec / step_sec + 1;
        let max = self.config.max_track_points;
        if usize::try_from(requested).map_or(true, |n| n > max) {
            return Err(OrbitalError::TooManyPoints { requested, max });
        }
        let model = Sgp4Model::from_lines(&tle.line1, &tle.line2)?;

        let times: Vec<DateTime<Utc>> = (0..requested)
            .filter_map(|i| {
                Duration::try_seconds(i * step_sec).and_then(|d| start.checked_add_signed(d))
            })
            .collect();

        let points: Vec<TrackPoint> = times
            .par_iter()
            .filter_map(|&t| match state_from_model(&model, tle, t) {
                Ok(state) => Some(TrackPoint::from(state)),
                Err(e) => {
                    warn!(norad_id = tle.norad_id, %t, "dropping track point: {}", e);
                    None
                }
            })
            .collect();

        debug!(
            norad_id = tle.norad_id,
            requested = times.len(),
            computed = points.len(),
            "track propagated"
        );

        Ok(points)
    }
}

fn state_from_model(model: &Sgp4Model, tle: &TleSet, t: DateTime<Utc>) -> Result<OrbitState> {
    let state = model.state_at(t)?;
    let geo = transforms::teme_to_geodetic(&state)?;

    Ok(OrbitState {
        t,
        lat: geo.latitude,
        lon: geo.longitude,
        alt_km: geo.altitude_km,
        velocity_km_s: state.speed_km_s(),
        tle_epoch: tle.epoch,
        orbit_quality: tle.score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn iss(score: f64) -> TleSet {
        let fetched = Utc.with_ymd_and_hms(2025, 1, 5, 13, 0, 0).unwrap();
        TleSet::from_lines("primary", ISS_LINE1, ISS_LINE2, fetched)
            .unwrap()
            .with_assessment(score, Vec::new())
    }

    #[test]
    fn test_propagate_carries_provenance() {
        let tle = iss(0.7);
        let t = Utc.with_ymd_and_hms(2025, 1, 5, 15, 0, 0).unwrap();
        let state = OrbitPropagator::default().propagate(&tle, t).unwrap();

        assert_eq!(state.t, t);
        assert_eq!(state.orbit_quality, 0.7);
        assert_eq!(state.tle_epoch, tle.epoch);
        assert!(state.lat.abs() <= 51.7);
        assert!(state.alt_km > 350.0 && state.alt_km < 500.0, "alt {}", state.alt_km);
    }

    #[test]
    fn test_track_bounds_and_step() {
        let tle = iss(1.0);
        let start = Utc.with_ymd_and_hms(2025, 1, 5, 12, 0, 0).unwrap();
        let end = start + Duration::seconds(610);
        let track = OrbitPropagator::default().track(&tle, start, end, 60).unwrap();

        assert_eq!(track.len(), 11);
        assert_eq!(track[0].t, start);
        assert!(track.last().unwrap().t <= end);
        for pair in track.windows(2) {
            assert_eq!(pair[1].t - pair[0].t, Duration::seconds(60));
        }
    }

    #[test]
    fn test_track_rejects_non_positive_step() {
        let tle = iss(1.0);
        let start = Utc.with_ymd_and_hms(2025, 1, 5, 12, 0, 0).unwrap();
        let err = OrbitPropagator::default()
            .track(&tle, start, start + Duration::seconds(60), 0)
            .unwrap_err();
        assert!(matches!(err, OrbitalError::InvalidStep(0)));
    }

    #[test]
    fn test_track_empty_when_end_before_start() {
        let tle = iss(1.0);
        let start = Utc.with_ymd_and_hms(2025, 1, 5, 12, 0, 0).unwrap();
        let track = OrbitPropagator::default()
            .track(&tle, start, start - Duration::seconds(1), 60)
            .unwrap();
        assert!(track.is_empty());
    }

    #[test]
    fn test_track_point_cap() {
        let tle = iss(1.0);
        let start = Utc.with_ymd_and_hms(2025, 1, 5, 12, 0, 0).unwrap();
        let propagator = OrbitPropagator::new(OrbitConfig {
            max_track_points: 10,
            ..OrbitConfig::default()
        });

        let ok = propagator.track(&tle, start, start + Duration::seconds(540), 60).unwrap();
        assert_eq!(ok.len(), 10);

        let err = propagator
            .track(&tle, start, start + Duration::seconds(600), 60)
            .unwrap_err();
        assert!(matches!(err, OrbitalError::TooManyPoints { requested: 11, max: 10 }));
    }

    #[test]
    fn test_track_over_huge_range_fails_fast() {
        let tle = iss(1.0);
        let err = OrbitPropagator::default()
            .track(&tle, DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC, 1)
            .unwrap_err();
        assert!(matches!(err, OrbitalError::TooManyPoints { .. }));
    }

    #[test]
    fn test_config_validation() {
        assert!(OrbitConfig::default().validate().is_ok());
        let bad = OrbitConfig {
            track_step_sec: 0,
            ..OrbitConfig::default()
        };
        assert!(bad.validate().is_err());
        let long = OrbitConfig {
            prediction_horizon_sec: i64::MAX,
            ..OrbitConfig::default()
        };
        assert!(long.validate().is_err());
        let deep = OrbitConfig {
            history_days: i64::MAX,
            ..OrbitConfig::default()
        };
        assert!(deep.validate().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_track_invariants(
            offset_min in 0i64..2_000,
            span_sec in 0i64..7_200,
            step_sec in 10i64..900,
            score in 0.0f64..=1.0,
        ) {
            let tle = iss(score);
            let start = tle.epoch + Duration::minutes(offset_min);
            let end = start + Duration::seconds(span_sec);
            let track = OrbitPropagator::default().track(&tle, start, end, step_sec).unwrap();

            prop_assert!(!track.is_empty());
            prop_assert_eq!(track[0].t, start);
            for pair in track.windows(2) {
                prop_assert_eq!(pair[1].t - pair[0].t, Duration::seconds(step_sec));
            }
            for p in &track {
                prop_assert!(p.t <= end);
                prop_assert_eq!(p.orbit_quality, tle.score);
                prop_assert!(p.lon >= -180.0 && p.lon < 180.0);
            }
        }
    }
}
