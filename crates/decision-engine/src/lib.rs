//! Decision Engine
//!
//! Turns a flux series into a scalar risk series and runs a two-state
//! hysteresis machine over a ground track:
//!
//! ```text
//!            risk > r_off (min ON time)
//!   OBS_ON ─────────────────────────────▶ OBS_OFF
//!          ◀─────────────────────────────
//!            risk < r_on (hold, min OFF time)
//! ```
//!
//! Only accepted transitions are emitted. [`plan`] turns transitions into a
//! contiguous observation plan and exports its ON items as CSV.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub mod engine;
pub mod plan;

pub use engine::DecisionEngine;
pub use plan::{build_plan, write_plan_csv, PlanItem, PlanProvenance};

#[derive(Error, Debug)]
pub enum DecisionError {
    #[error("Invalid decision configuration: {0}")]
    InvalidConfig(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DecisionError>;

/// Upper bound for hold, dwell and margin times (30 days).
pub const MAX_TIMER_SEC: i64 = 30 * 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Instrument active
    #[serde(rename = "OBS_ON")]
    ObsOn,
    /// Instrument safed
    #[serde(rename = "OBS_OFF")]
    ObsOff,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::ObsOn => write!(f, "OBS_ON"),
            Mode::ObsOff => write!(f, "OBS_OFF"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSample {
    pub t: DateTime<Utc>,
    pub risk: f64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Margins {
    pub lead_time_sec: i64,
    pub lag_time_sec: i64,
}

/// Accepted mode transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub t_start: DateTime<Utc>,
    pub t_end: DateTime<Utc>,
    pub mode: Mode,
    pub reason: String,
    pub margins: Margins,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Per-channel weights, normalized to sum 1 on validation
    pub risk_weights: BTreeMap<String, f64>,
    pub risk_exponent: f64,
    pub risk_scale: f64,
    pub r_off: f64,
    pub r_on: f64,
    /// Floor after any transition before switching back ON
    pub hold_time_sec: i64,
    pub min_off_time_sec: i64,
    pub min_on_time_sec: i64,
    pub lead_time_sec: i64,
    pub lag_time_sec: i64,
    pub inflate_factor: f64,
    /// Orbit quality below which risk is inflated
    pub low_quality_threshold: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        let risk_weights = [
            ("Je>100keV", 0.4),
            ("Je>1MeV", 0.3),
            ("Jp>10MeV", 0.2),
            ("Jp>50MeV", 0.1),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            risk_weights,
            risk_exponent: 1.0,
            risk_scale: 1.0,
            r_off: 4.2,
            r_on: 3.0,
            hold_time_sec: 20,
            min_off_time_sec: 0,
            min_on_time_sec: 0,
            lead_time_sec: 180,
            lag_time_sec: 180,
            inflate_factor: 2.0,
            low_quality_threshold: 0.5,
        }
    }
}

impl DecisionConfig {
    /// Checked copy with weights normalized.
    pub fn validated(&self) -> Result<Self> {
        let invalid = |msg: &str| Err(DecisionError::InvalidConfig(msg.to_string()));

        if self.risk_weights.is_empty() {
            return invalid("risk_weights must not be empty");
        }
        if self.risk_weights.values().any(|w| !w.is_finite() || *w < 0.0) {
            return invalid("risk_weights must be finite and non-negative");
        }
        let total: f64 = self.risk_weights.values().sum();
        if total <= 0.0 {
            return invalid("risk_weights sum to zero");
        }
        if !(self.r_on < self.r_off) {
            return invalid("r_on must be below r_off");
        }
        if !self.risk_exponent.is_finite()
            || !self.risk_scale.is_finite()
            || self.risk_scale < 0.0
        {
            return invalid("risk_exponent and risk_scale must be finite, risk_scale >= 0");
        }
        if [
            self.hold_time_sec,
            self.min_off_time_sec,
            self.min_on_time_sec,
            self.lead_time_sec,
            self.lag_time_sec,
        ]
        .iter()
        .any(|t| !(0..=MAX_TIMER_SEC).contains(t))
        {
            return invalid("hold, min and margin times must be within 0..=2592000 s");
        }
        if !(self.inflate_factor >= 1.0) {
            return invalid("inflate_factor must be >= 1");
        }

        Ok(Self {
            risk_weights: self
                .risk_weights
                .iter()
                .map(|(k, w)| (k.clone(), w / total))
                .collect(),
            ..self.clone()
        })
    }

    pub fn margins(&self) -> Margins {
        Margins {
            lead_time_sec: self.lead_time_sec,
            lag_time_sec: self.lag_time_sec,
        }
    }
}
