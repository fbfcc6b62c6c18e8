//! Service registry.
//!
//! Every service is built from one validated [`AppConfig`] and published as a
//! single `Arc<Services>`. A config update builds a complete new graph and
//! swaps the pointer; requests holding the old `Arc` finish on the old graph.

use decision_engine::DecisionEngine;
use flux_gateway::FluxGateway;
use orbital_mechanics::OrbitPropagator;
use std::sync::Arc;
use tle_ingest::{AcquisitionService, HttpTleSource, QualityAssessor, TleRepository, TleSource};
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{AppConfig, ConfigError};

pub struct Services {
    pub version: u64,
    pub config: AppConfig,
    pub acquisition: AcquisitionService,
    pub propagator: OrbitPropagator,
    pub flux: FluxGateway,
    pub decision: DecisionEngine,
}

impl Services {
    pub fn build(
        config: AppConfig,
        version: u64,
        repo: Arc<dyn TleRepository>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let sources = &config.tle_source;
        let primary = HttpTleSource::primary(sources)?.map(|s| Box::new(s) as Box<dyn TleSource>);
        let fallback = Box::new(HttpTleSource::fallback(sources)?);
        let acquisition = AcquisitionService::new(
            repo,
            QualityAssessor::new(config.tle_quality.clone())?,
            primary,
            fallback,
            sources.norad_id,
        );

        Ok(Self {
            version,
            propagator: OrbitPropagator::new(config.orbits.clone()),
            flux: FluxGateway::from_config(&config.flux)?,
            decision: DecisionEngine::new(config.decision.clone())?,
            acquisition,
            config,
        })
    }
}

#[derive(Clone)]
pub struct Registry {
    repo: Arc<dyn TleRepository>,
    current: Arc<RwLock<Arc<Services>>>,
}

impl Registry {
    pub fn new(config: AppConfig, repo: Arc<dyn TleRepository>) -> Result<Self, ConfigError> {
        let services = Services::build(config, 0, repo.clone())?;
        Ok(Self {
            repo,
            current: Arc::new(RwLock::new(Arc::new(services))),
        })
    }

    /// Snapshot of the active service graph.
    pub async fn current(&self) -> Arc<Services> {
        self.current.read().await.clone()
    }

    /// Build services for `config` and make them current. An invalid config
    /// leaves the active graph untouched.
    pub async fn replace(&self, config: AppConfig) -> Result<Arc<Services>, ConfigError> {
        let mut slot = self.current.write().await;
        let next = Arc::new(Services::build(config, slot.version + 1, self.repo.clone())?);
        *slot = next.clone();

        info!(version = next.version, flux_model = next.flux.model_name(), "services rebuilt");
        Ok(next)
    }
}
