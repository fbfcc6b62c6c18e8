//! RadGuard Gateway
//!
//! Service entry point for the radiation safing pipeline:
//! TLE acquisition → SGP4 track → flux lookup → ON/OFF decision.
//!
//! | Variable | Default |
//! |---|---|
//! | `RADGUARD_CONFIG` | `config/config.yaml` |
//! | `RADGUARD_TLE_DB` | `data/tle_history.db` |
//! | `RADGUARD_PORT` / `PORT` | `8000` |

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tle_ingest::SqliteTleRepository;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod refresh;
mod registry;
mod routes;

use config::AppConfig;
use registry::Registry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "radguard_gateway=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = PathBuf::from(
        std::env::var("RADGUARD_CONFIG").unwrap_or_else(|_| "config/config.yaml".to_string()),
    );
    let config = AppConfig::load(&config_path)?;

    let db_path =
        std::env::var("RADGUARD_TLE_DB").unwrap_or_else(|_| "data/tle_history.db".to_string());
    let repo = Arc::new(SqliteTleRepository::open(&db_path)?);
    tracing::info!("TLE history at {}", db_path);

    let registry = Registry::new(config, repo)?;
    {
        let services = registry.current().await;
        tracing::info!(
            norad_id = services.acquisition.norad_id(),
            flux_model = services.flux.model_name(),
            "services ready"
        );
    }
    let _refresh = refresh::spawn_tle_refresh(registry.clone());

    let app = routes::router(registry)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let port = std::env::var("RADGUARD_PORT")
        .or_else(|_| std::env::var("PORT"))
        .unwrap_or_else(|_| "8000".to_string());
    let addr = format!("0.0.0.0:{}", port);

    tracing::info!("RadGuard gateway starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
