//! TLE quality scoring.
//!
//! Score starts at 1.0 and loses weight for three independent checks:
//!
//! | Check | Needs previous | Penalty |
//! |-------|----------------|---------|
//! | Freshness | no | `w_freshness × min(1, age/ceiling − 1)` |
//! | Element stability | yes | `w_stability / 2` per field over threshold |
//! | Propagation bias | yes | `w_propagation × min(1, bias/tolerance)` |
//!
//! Assessment is total: any input combination yields a scored record.

use chrono::{DateTime, Utc};
use orbital_mechanics::elements::MeanElements;
use orbital_mechanics::propagation::Sgp4Model;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{IngestError, Result, TleSet};

// ============================================================================
// Configuration
// ============================================================================

/// Largest accepted change between consecutive element sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementThresholds {
    /// rev/day
    pub mean_motion: f64,
    pub inclination_deg: f64,
    pub raan_deg: f64,
    pub eccentricity: f64,
}

impl Default for ElementThresholds {
    fn default() -> Self {
        Self {
            mean_motion: 0.05,
            inclination_deg: 0.05,
            raan_deg: 0.05,
            eccentricity: 0.0001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub freshness: f64,
    pub stability: f64,
    pub propagation: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            freshness: 0.4,
            stability: 0.3,
            propagation: 0.3,
        }
    }
}

impl ScoreWeights {
    /// Weights rescaled to sum to 1.
    pub fn normalized(&self) -> Result<Self> {
        if [self.freshness, self.stability, self.propagation]
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err(IngestError::InvalidConfig(
                "score_weights must be finite and non-negative".into(),
            ));
        }
        let total = self.freshness + self.stability + self.propagation;
        if total <= 0.0 {
            return Err(IngestError::InvalidConfig("score_weights sum to zero".into()));
        }
        Ok(Self {
            freshness: self.freshness / total,
            stability: self.stability / total,
            propagation: self.propagation / total,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TleQualityConfig {
    /// Age ceiling before freshness penalties start
    pub freshness_max_sec: i64,
    pub element_change_threshold: ElementThresholds,
    pub propagation_tolerance_km: f64,
    pub score_weights: ScoreWeights,
}

impl Default for TleQualityConfig {
    fn default() -> Self {
        Self {
            freshness_max_sec: 7200,
            element_change_threshold: ElementThresholds::default(),
            propagation_tolerance_km: 15.0,
            score_weights: ScoreWeights::default(),
        }
    }
}

impl TleQualityConfig {
    /// Checked copy with weights normalized.
    pub fn validated(&self) -> Result<Self> {
        if self.freshness_max_sec <= 0 {
            return Err(IngestError::InvalidConfig("freshness_max_sec must be > 0".into()));
        }
        if !(self.propagation_tolerance_km > 0.0) {
            return Err(IngestError::InvalidConfig(
                "propagation_tolerance_km must be > 0".into(),
            ));
        }
        let t = &self.element_change_threshold;
        if [t.mean_motion, t.inclination_deg, t.raan_deg, t.eccentricity]
            .iter()
            .any(|v| !(*v >= 0.0))
        {
            return Err(IngestError::InvalidConfig(
                "element_change_threshold values must be >= 0".into(),
            ));
        }
        Ok(Self {
            score_weights: self.score_weights.normalized()?,
            ..self.clone()
        })
    }
}

// ============================================================================
// Assessor
// ============================================================================

#[derive(Debug, Clone)]
pub struct QualityAssessor {
    config: TleQualityConfig,
}

impl QualityAssessor {
    pub fn new(config: TleQualityConfig) -> Result<Self> {
        Ok(Self {
            config: config.validated()?,
        })
    }

    pub fn config(&self) -> &TleQualityConfig {
        &self.config
    }

    /// Score `candidate` as of `now`, against the previously accepted record.
    ///
    /// Warnings already on the candidate (source provenance) are kept and the
    /// quality warnings are appended after them.
    pub fn assess(
        &self,
        candidate: TleSet,
        previous: Option<&TleSet>,
        now: DateTime<Utc>,
    ) -> TleSet {
        let weights = &self.config.score_weights;
        let mut score = 1.0;
        let mut warnings = candidate.warnings.clone();

        let age_sec = (now - candidate.epoch).num_milliseconds() as f64 / 1000.0;
        let ceiling = self.config.freshness_max_sec as f64;
        if age_sec > ceiling {
            let penalty = (age_sec / ceiling - 1.0).min(1.0);
            score -= weights.freshness * penalty;
            warnings.push(format!("TLE stale by {}s", age_sec as i64));
        }

        if let Some(previous) = previous {
            match element_deltas(previous, &candidate) {
                Some(deltas) => {
                    let limits = &self.config.element_change_threshold;
                    for (field, delta, limit) in [
                        ("mean_motion", deltas.mean_motion, limits.mean_motion),
                        ("inclination_deg", deltas.inclination_deg, limits.inclination_deg),
                        ("raan_deg", deltas.raan_deg, limits.raan_deg),
                        ("eccentricity", deltas.eccentricity, limits.eccentricity),
                    ] {
                        if delta.abs() > limit {
                            score -= weights.stability * 0.5;
                            warnings.push(format!("Element jump {} {:.4}", field, delta));
                        }
                    }
                }
                None => {
                    score -= weights.stability;
                    warnings.push("Element comparison unavailable".to_string());
                }
            }

            let tolerance = self.config.propagation_tolerance_km;
            match propagation_bias_km(previous, &candidate) {
                Some(bias) if bias > tolerance => {
                    score -= weights.propagation * (bias / tolerance).min(1.0);
                    warnings.push(format!("Propagation bias {:.1} km", bias));
                }
                Some(_) => {}
                None => {
                    score -= weights.propagation;
                    warnings.push("Propagation bias unavailable".to_string());
                }
            }
        }

        debug!(
            norad_id = candidate.norad_id,
            source = %candidate.source,
            score,
            "TLE assessed"
        );

        candidate.with_assessment(score.max(0.0), warnings)
    }
}

/// Candidate minus previous. RAAN is wrapped into (-180, 180].
fn element_deltas(previous: &TleSet, candidate: &TleSet) -> Option<MeanElements> {
    let old = previous.mean_elements().ok()?;
    let new = candidate.mean_elements().ok()?;

    let mut raan = (new.raan_deg - old.raan_deg).rem_euclid(360.0);
    if raan > 180.0 {
        raan -= 360.0;
    }

    Some(MeanElements {
        mean_motion: new.mean_motion - old.mean_motion,
        inclination_deg: new.inclination_deg - old.inclination_deg,
        raan_deg: raan,
        eccentricity: new.eccentricity - old.eccentricity,
    })
}

/// Distance (km) at the candidate epoch between `previous` propagated forward
/// and the candidate's own state. `None` when either propagation breaks down.
fn propagation_bias_km(previous: &TleSet, candidate: &TleSet) -> Option<f64> {
    let at = candidate.epoch;
    let predicted = Sgp4Model::from_lines(&previous.line1, &previous.line2)
        .and_then(|m| m.state_at(at))
        .ok()?;
    let actual = Sgp4Model::from_lines(&candidate.line1, &candidate.line2)
        .and_then(|m| m.state_at(at))
        .ok()?;

    Some((actual.position() - predicted.position()).norm())
}
