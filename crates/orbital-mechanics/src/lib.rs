//! Orbital Mechanics Library
//!
//! TLE parsing, SGP4 propagation and TEME → Earth-fixed → geodetic transforms
//! for the RadGuard instrument-safing pipeline.
//!
//! - [`TleSet`]: one scored element set with full provenance
//! - [`propagation`]: SGP4 on the mean elements, output in TEME
//! - [`transforms`]: sidereal rotation to ECEF, WGS-84 geodetic conversion
//! - [`OrbitPropagator`]: single states and ground tracks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod propagator;

pub use propagator::{OrbitConfig, OrbitPropagator, MAX_HISTORY_DAYS, MAX_SPAN_SEC};

#[derive(Error, Debug)]
pub enum OrbitalError {
    #[error("Invalid TLE format: {0}")]
    InvalidTle(String),
    #[error("Propagation failed: {0}")]
    PropagationFailed(String),
    #[error("Invalid track step: {0}s")]
    InvalidStep(i64),
    #[error("Invalid orbit configuration: {0}")]
    InvalidConfig(String),
    #[error("Track of {requested} points exceeds the limit of {max}")]
    TooManyPoints { requested: i64, max: usize },
}

pub type Result<T> = std::result::Result<T, OrbitalError>;

/// Scored two-line element set.
///
/// Records are never edited in place: re-scoring produces a new value via
/// [`TleSet::with_assessment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TleSet {
    pub norad_id: u32,
    /// Provenance tag (`primary`, `fallback`, `placeholder`, ...)
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub epoch: DateTime<Utc>,
    pub line1: String,
    pub line2: String,
    /// Quality score in [0, 1]
    pub score: f64,
    pub warnings: Vec<String>,
}

impl TleSet {
    /// Build an unscored record from raw lines. The epoch is taken from the
    /// element set itself, the NORAD number from line 1 columns [2:7].
    pub fn from_lines(
        source: impl Into<String>,
        line1: &str,
        line2: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self> {
        let line1 = line1.trim();
        let line2 = line2.trim();
        let parsed = elements::parse(line1, line2)?;
        let norad_id = elements::norad_from_line1(line1)
            .ok_or_else(|| OrbitalError::InvalidTle(format!("bad catalog number in {:?}", line1)))?;

        Ok(Self {
            norad_id,
            source: source.into(),
            fetched_at,
            epoch: DateTime::<Utc>::from_naive_utc_and_offset(parsed.datetime, Utc),
            line1: line1.to_string(),
            line2: line2.to_string(),
            score: 1.0,
            warnings: Vec::new(),
        })
    }

    /// Copy of this record carrying a new score and warning list.
    pub fn with_assessment(self, score: f64, warnings: Vec<String>) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            warnings,
            ..self
        }
    }

    pub fn mean_elements(&self) -> Result<elements::MeanElements> {
        elements::mean_elements(&self.line1, &self.line2)
    }
}

/// TEME state vector (km, km/s)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StateVector {
    pub position_x: f64,
    pub position_y: f64,
    pub position_z: f64,
    pub velocity_x: f64,
    pub velocity_y: f64,
    pub velocity_z: f64,
    pub epoch: DateTime<Utc>,
}

impl StateVector {
    pub fn position(&self) -> nalgebra::Vector3<f64> {
        nalgebra::Vector3::new(self.position_x, self.position_y, self.position_z)
    }

    pub fn speed_km_s(&self) -> f64 {
        nalgebra::Vector3::new(self.velocity_x, self.velocity_y, self.velocity_z).norm()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeodeticPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_km: f64,
}

/// Single propagated state, with velocity magnitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrbitState {
    pub t: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub alt_km: f64,
    pub velocity_km_s: f64,
    pub tle_epoch: DateTime<Utc>,
    /// Copy of the source TLE score
    pub orbit_quality: f64,
}

/// Ground track sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub t: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub alt_km: f64,
    pub tle_epoch: DateTime<Utc>,
    pub orbit_quality: f64,
}

impl From<OrbitState> for TrackPoint {
    fn from(state: OrbitState) -> Self {
        Self {
            t: state.t,
            lat: state.lat,
            lon: state.lon,
            alt_km: state.alt_km,
            tle_epoch: state.tle_epoch,
            orbit_quality: state.orbit_quality,
        }
    }
}

pub mod elements {
    use super::*;

    /// Mean elements compared by the stability check.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct MeanElements {
        /// rev/day
        pub mean_motion: f64,
        pub inclination_deg: f64,
        pub raan_deg: f64,
        pub eccentricity: f64,
    }

    pub fn parse(line1: &str, line2: &str) -> Result<sgp4::Elements> {
        sgp4::Elements::from_tle(None, line1.trim().as_bytes(), line2.trim().as_bytes())
            .map_err(|e| OrbitalError::InvalidTle(format!("{:?}", e)))
    }

    pub fn mean_elements(line1: &str, line2: &str) -> Result<MeanElements> {
        let parsed = parse(line1, line2)?;
        Ok(MeanElements {
            mean_motion: parsed.mean_motion,
            inclination_deg: parsed.inclination,
            raan_deg: parsed.right_ascension,
            eccentricity: parsed.eccentricity,
        })
    }

    /// Catalog number from line 1, characters [2:7].
    pub fn norad_from_line1(line1: &str) -> Option<u32> {
        line1.get(2..7)?.trim().parse().ok()
    }

    /// Keeps only lines starting with "1 " / "2 " and returns the first pair.
    pub fn extract_pair(text: &str) -> Option<(String, String)> {
        let mut line1 = None;
        for raw in text.lines() {
            let line = raw.trim();
            if line.starts_with("1 ") && line1.is_none() {
                line1 = Some(line.to_string());
            } else if line.starts_with("2 ") {
                if let Some(l1) = line1.take() {
                    return Some((l1, line.to_string()));
                }
            }
        }
        None
    }
}

pub mod propagation {
    use super::*;

    /// Parsed SGP4 model, reusable across many instants.
    pub struct Sgp4Model {
        epoch: DateTime<Utc>,
        constants: sgp4::Constants,
    }

    impl Sgp4Model {
        pub fn from_lines(tle_line1: &str, tle_line2: &str) -> Result<Self> {
            let elements = elements::parse(tle_line1, tle_line2)?;

            let constants = sgp4::Constants::from_elements(&elements)
                .map_err(|e| OrbitalError::PropagationFailed(format!("{:?}", e)))?;

            Ok(Self {
                epoch: DateTime::<Utc>::from_naive_utc_and_offset(elements.datetime, Utc),
                constants,
            })
        }

        pub fn epoch(&self) -> DateTime<Utc> {
            self.epoch
        }

        /// TEME state at `time`. Decayed or otherwise diverged orbits surface
        /// as [`OrbitalError::PropagationFailed`] for this instant only.
        pub fn state_at(&self, time: DateTime<Utc>) -> Result<StateVector> {
            let duration = time.signed_duration_since(self.epoch);
            let minutes_since_epoch = duration.num_milliseconds() as f64 / 60_000.0;

            let prediction = self
                .constants
                .propagate(minutes_since_epoch)
                .map_err(|e| OrbitalError::PropagationFailed(format!("{:?}", e)))?;

            let state = StateVector {
                position_x: prediction.position[0],
                position_y: prediction.position[1],
                position_z: prediction.position[2],
                velocity_x: prediction.velocity[0],
                velocity_y: prediction.velocity[1],
                velocity_z: prediction.velocity[2],
                epoch: time,
            };

            if !state.position().iter().all(|c| c.is_finite()) {
                return Err(OrbitalError::PropagationFailed(format!(
                    "non-finite position at {}",
                    time
                )));
            }

            Ok(state)
        }
    }

    pub fn sgp4_propagate(
        tle_line1: &str,
        tle_line2: &str,
        time: DateTime<Utc>,
    ) -> Result<StateVector> {
        Sgp4Model::from_lines(tle_line1, tle_line2)?.state_at(time)
    }
}

pub mod transforms {
    use super::*;
    use nalgebra::{Rotation3, Vector3};

    const EARTH_RADIUS_KM: f64 = 6378.137;
    const EARTH_FLATTENING: f64 = 1.0 / 298.257223563;
    const JD_UNIX_EPOCH: f64 = 2_440_587.5;
    const JD_J2000: f64 = 2_451_545.0;

    fn eccentricity_sq() -> f64 {
        EARTH_FLATTENING * (2.0 - EARTH_FLATTENING)
    }

    pub fn julian_date(time: DateTime<Utc>) -> f64 {
        time.timestamp_millis() as f64 / 86_400_000.0 + JD_UNIX_EPOCH
    }

    /// Greenwich mean sidereal time in radians (IAU-82).
    pub fn gmst_rad(jd: f64) -> f64 {
        let d = jd - JD_J2000;
        let t = d / 36_525.0;
        let gmst_deg = 280.46061837 + 360.98564736629 * d + 0.000387933 * t * t
            - t * t * t / 38_710_000.0;
        gmst_deg.rem_euclid(360.0).to_radians()
    }

    /// TEME → Earth-fixed by rotating about the polar axis through -GMST.
    pub fn teme_to_ecef(r_teme: Vector3<f64>, time: DateTime<Utc>) -> Vector3<f64> {
        let gmst = gmst_rad(julian_date(time));
        Rotation3::from_axis_angle(&Vector3::z_axis(), -gmst) * r_teme
    }

    /// Map any longitude in degrees into [-180, 180).
    pub fn normalize_longitude(lon: f64) -> f64 {
        let wrapped = (lon + 180.0).rem_euclid(360.0) - 180.0;
        if wrapped >= 180.0 {
            wrapped - 360.0
        } else {
            wrapped
        }
    }

    /// WGS-84 geodetic coordinates from an Earth-fixed position (km).
    pub fn ecef_to_geodetic(r: Vector3<f64>) -> Result<GeodeticPosition> {
        let (x, y, z) = (r.x, r.y, r.z);
        if !(x.is_finite() && y.is_finite() && z.is_finite()) {
            return Err(OrbitalError::PropagationFailed(
                "non-finite position".to_string(),
            ));
        }

        let e2 = eccentricity_sq();
        let p = (x * x + y * y).sqrt();
        let longitude = y.atan2(x).to_degrees();

        let mut lat = z.atan2(p * (1.0 - e2));
        let mut alt = 0.0;
        for _ in 0..10 {
            let n = EARTH_RADIUS_KM / (1.0 - e2 * lat.sin().powi(2)).sqrt();
            alt = if lat.cos().abs() > 1e-10 {
                p / lat.cos() - n
            } else {
                z.abs() - EARTH_RADIUS_KM * (1.0 - EARTH_FLATTENING)
            };
            let next = z.atan2(p * (1.0 - e2 * n / (n + alt)));
            if (next - lat).abs() < 1e-12 {
                lat = next;
                break;
            }
            lat = next;
        }

        Ok(GeodeticPosition {
            latitude: lat.to_degrees(),
            longitude: normalize_longitude(longitude),
            altitude_km: alt,
        })
    }

    pub fn geodetic_to_ecef(pos: &GeodeticPosition) -> Vector3<f64> {
        let lat_rad = pos.latitude.to_radians();
        let lon_rad = pos.longitude.to_radians();
        let alt = pos.altitude_km;
        let e2 = eccentricity_sq();

        let n = EARTH_RADIUS_KM / (1.0 - e2 * lat_rad.sin().powi(2)).sqrt();

        Vector3::new(
            (n + alt) * lat_rad.cos() * lon_rad.cos(),
            (n + alt) * lat_rad.cos() * lon_rad.sin(),
            (n * (1.0 - e2) + alt) * lat_rad.sin(),
        )
    }

    /// Full chain used by the propagator: TEME position → geodetic.
    pub fn teme_to_geodetic(state: &StateVector) -> Result<GeodeticPosition> {
        ecef_to_geodetic(teme_to_ecef(state.position(), state.epoch))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_from_lines_reads_epoch_and_catalog_number() {
        let fetched = Utc.with_ymd_and_hms(2025, 1, 5, 13, 0, 0).unwrap();
        let tle = TleSet::from_lines("primary", ISS_LINE1, ISS_LINE2, fetched).unwrap();

        assert_eq!(tle.norad_id, 25544);
        assert_eq!(tle.score, 1.0);
        assert!(tle.warnings.is_empty());
        // Day 5.5 of 2025 = Jan 5, 12:00:00 UTC
        let expected = Utc.with_ymd_and_hms(2025, 1, 5, 12, 0, 0).unwrap();
        assert!((tle.epoch - expected).num_milliseconds().abs() < 1_000);
    }

    #[test]
    fn test_from_lines_rejects_garbage() {
        let fetched = Utc::now();
        assert!(TleSet::from_lines("primary", "1 garbage", "2 garbage", fetched).is_err());
    }

    #[test]
    fn test_with_assessment_clamps_score() {
        let tle = TleSet::from_lines("primary", ISS_LINE1, ISS_LINE2, Utc::now()).unwrap();
        let scored = tle.clone().with_assessment(-0.3, vec!["stale".into()]);
        assert_eq!(scored.score, 0.0);
        assert_eq!(scored.warnings, vec!["stale".to_string()]);
        assert_eq!(scored.line1, tle.line1);
    }

    #[test]
    fn test_extract_pair_skips_name_line() {
        let text = format!("ISS (ZARYA)\n{}\n{}\n", ISS_LINE1, ISS_LINE2);
        let (l1, l2) = elements::extract_pair(&text).unwrap();
        assert_eq!(l1, ISS_LINE1);
        assert_eq!(l2, ISS_LINE2);
        assert!(elements::extract_pair("no elements here").is_none());
    }

    #[test]
    fn test_norad_from_line1() {
        assert_eq!(elements::norad_from_line1(ISS_LINE1), Some(25544));
        assert_eq!(elements::norad_from_line1("1 AB"), None);
    }

    #[test]
    fn test_sgp4_leo_radius() {
        let t = Utc.with_ymd_and_hms(2025, 1, 5, 14, 0, 0).unwrap();
        let state = propagation::sgp4_propagate(ISS_LINE1, ISS_LINE2, t).unwrap();
        let radius = state.position().norm();
        assert!(radius > 6600.0 && radius < 6900.0, "radius {}", radius);
        assert!(state.speed_km_s() > 7.0 && state.speed_km_s() < 8.0);
    }

    #[test]
    fn test_normalize_longitude() {
        assert_eq!(transforms::normalize_longitude(180.0), -180.0);
        assert_eq!(transforms::normalize_longitude(-180.0), -180.0);
        assert!((transforms::normalize_longitude(190.0) + 170.0).abs() < 1e-9);
        assert!((transforms::normalize_longitude(-190.0) - 170.0).abs() < 1e-9);
        assert!((transforms::normalize_longitude(725.5) - 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_geodetic_round_trip() {
        let pos = GeodeticPosition {
            latitude: 51.5,
            longitude: -0.12,
            altitude_km: 420.0,
        };
        let back = transforms::ecef_to_geodetic(transforms::geodetic_to_ecef(&pos)).unwrap();
        assert!((back.latitude - pos.latitude).abs() < 1e-6);
        assert!((back.longitude - pos.longitude).abs() < 1e-6);
        assert!((back.altitude_km - pos.altitude_km).abs() < 1e-6);
    }

    #[test]
    fn test_gmst_at_j2000() {
        // GMST at J2000.0 is 280.46061837 degrees
        let gmst = transforms::gmst_rad(2_451_545.0).to_degrees();
        assert!((gmst - 280.46061837).abs() < 1e-6);
    }
}
