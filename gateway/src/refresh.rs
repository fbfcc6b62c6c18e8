//! Background TLE refresh.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::registry::Registry;

/// Fetch and store a TLE, then sleep for the refresh period of whichever
/// config is active at that moment. Failures are logged and retried next cycle.
pub fn spawn_tle_refresh(registry: Registry) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let services = registry.current().await;
            match services.acquisition.fetch_and_store().await {
                Ok(tle) => info!(
                    norad_id = tle.norad_id,
                    source = %tle.source,
                    score = tle.score,
                    "TLE refreshed"
                ),
                Err(e) => error!("TLE refresh failed: {}", e),
            }

            let period = Duration::from_secs(services.config.orbits.refresh_rate_sec);
            drop(services);
            tokio::time::sleep(period).await;
        }
    })
}
