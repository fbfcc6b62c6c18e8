//! Deterministic altitude-profile flux model.

use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;

use crate::config::MockProfile;
use crate::{ChannelValues, FluxPoint};

#[derive(Debug, Clone)]
pub struct MockFluxModel {
    profile: MockProfile,
}

impl MockFluxModel {
    pub fn new(profile: MockProfile) -> Self {
        Self { profile }
    }

    /// Base magnitude, linear in altitude between the quiet and storm
    /// profile points and flat outside them.
    pub fn base_flux(&self, alt_km: f64) -> f64 {
        let p = &self.profile;
        let frac = ((alt_km - p.quiet_altitude_km) / (p.storm_altitude_km - p.quiet_altitude_km))
            .clamp(0.0, 1.0);
        p.quiet_flux + frac * (p.storm_flux - p.quiet_flux)
    }

    /// Multiplicative noise seeded by the point's Unix second.
    fn noise(&self, point: &FluxPoint) -> f64 {
        if self.profile.jitter <= 0.0 {
            return 1.0;
        }
        let mut rng = Pcg64Mcg::new(point.t.timestamp() as u64 as u128);
        Normal::new(1.0, self.profile.jitter)
            .map(|n| n.sample(&mut rng))
            .unwrap_or(1.0)
    }

    pub fn flux(&self, point: &FluxPoint, channels: &[String]) -> ChannelValues {
        let base = self.base_flux(point.alt_km) * self.noise(point);
        channels
            .iter()
            .map(|ch| {
                let fraction = self.profile.channel_fractions.get(ch).copied().unwrap_or(1.0);
                (ch.clone(), base * fraction)
            })
            .collect()
    }
}
