//! Risk aggregation and the hysteresis fold.

use chrono::{DateTime, Duration, Utc};
use flux_gateway::FluxSample;
use orbital_mechanics::TrackPoint;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::{DecisionConfig, Mode, Result, RiskSample, Window};

/// Accumulator of one `decide_windows` pass.
#[derive(Debug, Clone, Copy)]
struct Hysteresis {
    mode: Mode,
    last_change: Option<DateTime<Utc>>,
    hold_until: Option<DateTime<Utc>>,
}

impl Hysteresis {
    fn initial() -> Self {
        Self {
            mode: Mode::ObsOn,
            last_change: None,
            hold_until: None,
        }
    }

    fn dwell_elapsed(&self, t: DateTime<Utc>, min_sec: i64) -> bool {
        match self.last_change {
            None => true,
            Some(last) => Duration::try_seconds(min_sec).map_or(false, |min| t - last >= min),
        }
    }

    fn held(&self, t: DateTime<Utc>) -> bool {
        matches!(self.hold_until, Some(until) if t < until)
    }
}

/// `t + sec`, saturating at the ends of the representable range.
fn shifted(t: DateTime<Utc>, sec: i64) -> DateTime<Utc> {
    Duration::try_seconds(sec)
        .and_then(|d| t.checked_add_signed(d))
        .unwrap_or(if sec < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

#[derive(Debug, Clone)]
pub struct DecisionEngine {
    config: DecisionConfig,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Result<Self> {
        Ok(Self {
            config: config.validated()?,
        })
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// One risk sample per distinct timestamp, in time order:
    /// `scale × Σ weight[ch] × value[ch]^exponent` over positive values.
    /// Unweighted channels contribute nothing.
    pub fn compute_risk_series(&self, flux: &[FluxSample]) -> Vec<RiskSample> {
        let mut by_time: BTreeMap<DateTime<Utc>, BTreeMap<&str, f64>> = BTreeMap::new();
        for sample in flux {
            by_time
                .entry(sample.t)
                .or_default()
                .insert(sample.channel.as_str(), sample.value);
        }

        by_time
            .into_iter()
            .map(|(t, channels)| {
                let mut risk = 0.0;
                let mut dominant: Option<(&str, f64)> = None;
                for (channel, value) in channels {
                    let weight = self.config.risk_weights.get(channel).copied().unwrap_or(0.0);
                    if value <= 0.0 {
                        continue;
                    }
                    let contribution = weight * value.powf(self.config.risk_exponent);
                    risk += contribution;
                    if contribution > 0.0 && dominant.map_or(true, |(_, c)| contribution > c) {
                        dominant = Some((channel, contribution));
                    }
                }
                RiskSample {
                    t,
                    risk: risk * self.config.risk_scale,
                    reason: dominant.map(|(ch, _)| format!("dominated by {}", ch)),
                }
            })
            .collect()
    }

    /// Accepted transitions along `track`. Points without a risk sample at
    /// the same instant are skipped. Starts in [`Mode::ObsOn`]; only the edge
    /// leaving the current mode is evaluated, so one point fires at most one
    /// transition.
    pub fn decide_windows(&self, track: &[TrackPoint], risks: &[RiskSample]) -> Vec<Window> {
        if risks.is_empty() {
            return Vec::new();
        }
        let risk_at: HashMap<DateTime<Utc>, f64> = risks.iter().map(|r| (r.t, r.risk)).collect();

        let (_, windows) = track
            .iter()
            .filter_map(|p| risk_at.get(&p.t).map(|&r| (p, r)))
            .fold(
                (Hysteresis::initial(), Vec::new()),
                |(state, mut windows), (point, risk)| {
                    let (next, window) = self.step(state, point, risk);
                    windows.extend(window);
                    (next, windows)
                },
            );

        debug!(points = track.len(), windows = windows.len(), "decision pass complete");
        windows
    }

    /// Risk used for the threshold test at `point`.
    pub fn effective_risk(&self, point: &TrackPoint, risk: f64) -> f64 {
        if point.orbit_quality < self.config.low_quality_threshold {
            risk * self.config.inflate_factor
        } else {
            risk
        }
    }

    fn step(
        &self,
        state: Hysteresis,
        point: &TrackPoint,
        risk: f64,
    ) -> (Hysteresis, Option<Window>) {
        let cfg = &self.config;
        let t = point.t;
        let risk = self.effective_risk(point, risk);

        let window = match state.mode {
            Mode::ObsOn if risk > cfg.r_off && state.dwell_elapsed(t, cfg.min_on_time_sec) => {
                Window {
                    t_start: shifted(t, -cfg.lead_time_sec),
                    t_end: t,
                    mode: Mode::ObsOff,
                    reason: format!("Risk {:.2} > R_off {:?}", risk, cfg.r_off),
                    margins: cfg.margins(),
                }
            }
            Mode::ObsOff
                if risk < cfg.r_on
                    && !state.held(t)
                    && state.dwell_elapsed(t, cfg.min_off_time_sec) =>
            {
                Window {
                    t_start: t,
                    t_end: shifted(t, cfg.lag_time_sec),
                    mode: Mode::ObsOn,
                    reason: format!("Risk {:.2} < R_on {:?}", risk, cfg.r_on),
                    margins: cfg.margins(),
                }
            }
            _ => return (state, None),
        };

        let next = Hysteresis {
            mode: window.mode,
            last_change: Some(t),
            hold_until: Some(shifted(t, cfg.hold_time_sec)),
        };
        (next, Some(window))
    }
}
