use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use decision_engine::{build_plan, write_plan_csv, Mode, PlanProvenance, Window};
use flux_gateway::{FluxGrid, FluxSample};
use orbital_mechanics::{OrbitState, TrackPoint};
use serde::{Deserialize, Serialize};
use tle_ingest::TleSet;
use tracing::debug;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::registry::{Registry, Services};

type ApiResult<T> = Result<T, AppError>;

pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config).put(put_config))
        .route("/sat/state", get(sat_state))
        .route("/sat/track", get(sat_track))
        .route("/env/flux/track", get(flux_track))
        .route("/env/flux/grid", get(flux_grid))
        .route("/decision/windows", get(decision_windows))
        .route("/decision/plan/export", get(plan_export))
        .with_state(registry)
}

// ============================================================================
// Request / response shapes
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub config_version: u64,
}

#[derive(Serialize)]
pub struct ConfigResponse {
    pub version: u64,
    pub config: AppConfig,
    pub flux_model: &'static str,
}

#[derive(Deserialize)]
pub struct StateQuery {
    pub time: Option<String>,
}

/// Shared by every endpoint that works along a ground track.
#[derive(Deserialize)]
pub struct TrackQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub step: Option<i64>,
    pub percentile: Option<String>,
}

#[derive(Deserialize)]
pub struct GridQuery {
    pub time: Option<String>,
    pub channel: Option<String>,
    pub percentile: Option<String>,
    pub alt_km: Option<f64>,
}

#[derive(Deserialize)]
pub struct PlanQuery {
    pub start: Option<String>,
    pub hours: Option<i64>,
    pub step: Option<i64>,
    pub percentile: Option<String>,
}

// ============================================================================
// Helpers
// ============================================================================

/// RFC 3339 instant, or now when absent.
fn parse_time(param: Option<&str>) -> ApiResult<DateTime<Utc>> {
    match param {
        None => Ok(Utc::now()),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| AppError::BadRequest(format!("Invalid time format: {}", e))),
    }
}

/// `t + delta`, or 400 when either is outside the representable range.
fn shifted(t: DateTime<Utc>, delta: Option<Duration>) -> ApiResult<DateTime<Utc>> {
    delta
        .and_then(|d| t.checked_add_signed(d))
        .ok_or_else(|| AppError::BadRequest("time range out of bounds".into()))
}

/// Stored TLE closest to `t`, or a fresh acquisition when history has none.
async fn best_tle(services: &Services, t: DateTime<Utc>) -> ApiResult<TleSet> {
    let history_days = services.config.orbits.history_days;
    if let Some(tle) = services.acquisition.select_for_time(t, history_days).await? {
        return Ok(tle);
    }
    debug!(%t, "no stored TLE in window, acquiring");
    Ok(services.acquisition.fetch_and_store().await?)
}

struct ResolvedTrack {
    tle: TleSet,
    step_sec: i64,
    points: Vec<TrackPoint>,
}

async fn resolve_track(services: &Services, query: &TrackQuery) -> ApiResult<ResolvedTrack> {
    let orbits = &services.config.orbits;
    let (start, end, reference) = if query.start.is_none() && query.end.is_none() {
        let now = Utc::now();
        let half = Duration::try_milliseconds(orbits.track_length_sec.saturating_mul(500));
        (shifted(now, half.map(|h| -h))?, shifted(now, half)?, now)
    } else {
        let start = parse_time(query.start.as_deref())?;
        let end = match query.end.as_deref() {
            Some(s) => parse_time(Some(s))?,
            None => shifted(start, Duration::try_seconds(orbits.prediction_horizon_sec))?,
        };
        (start, end, start)
    };
    if end <= start {
        return Err(AppError::BadRequest("end must be after start".into()));
    }

    let step_sec = query.step.unwrap_or(orbits.track_step_sec);
    let tle = best_tle(services, reference).await?;
    let points = services.propagator.track(&tle, start, end, step_sec)?;
    Ok(ResolvedTrack { tle, step_sec, points })
}

fn percentile_or_default(services: &Services, percentile: Option<&str>) -> String {
    percentile
        .map(str::to_string)
        .unwrap_or_else(|| services.config.flux.percentile_default.clone())
}

async fn windows_along(
    services: &Services,
    track: &[TrackPoint],
    percentile: &str,
) -> ApiResult<Vec<Window>> {
    let flux = services.flux.compute_series(track, percentile).await?;
    let risks = services.decision.compute_risk_series(&flux);
    Ok(services.decision.decide_windows(track, &risks))
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health(State(registry): State<Registry>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        config_version: registry.current().await.version,
    })
}

pub async fn get_config(State(registry): State<Registry>) -> Json<ConfigResponse> {
    let services = registry.current().await;
    Json(ConfigResponse {
        version: services.version,
        config: services.config.clone(),
        flux_model: services.flux.model_name(),
    })
}

pub async fn put_config(
    State(registry): State<Registry>,
    Json(config): Json<AppConfig>,
) -> ApiResult<Json<ConfigResponse>> {
    let services = registry.replace(config).await?;
    Ok(Json(ConfigResponse {
        version: services.version,
        config: services.config.clone(),
        flux_model: services.flux.model_name(),
    }))
}

pub async fn sat_state(
    State(registry): State<Registry>,
    Query(query): Query<StateQuery>,
) -> ApiResult<Json<OrbitState>> {
    let services = registry.current().await;
    let t = parse_time(query.time.as_deref())?;
    let tle = best_tle(&services, t).await?;
    Ok(Json(services.propagator.propagate(&tle, t)?))
}

pub async fn sat_track(
    State(registry): State<Registry>,
    Query(query): Query<TrackQuery>,
) -> ApiResult<Json<Vec<TrackPoint>>> {
    let services = registry.current().await;
    let track = resolve_track(&services, &query).await?;
    Ok(Json(track.points))
}

pub async fn flux_track(
    State(registry): State<Registry>,
    Query(query): Query<TrackQuery>,
) -> ApiResult<Json<Vec<FluxSample>>> {
    let services = registry.current().await;
    let track = resolve_track(&services, &query).await?;
    let percentile = percentile_or_default(&services, query.percentile.as_deref());
    Ok(Json(services.flux.compute_series(&track.points, &percentile).await?))
}

pub async fn flux_grid(
    State(registry): State<Registry>,
    Query(query): Query<GridQuery>,
) -> ApiResult<Json<FluxGrid>> {
    let services = registry.current().await;
    let t = parse_time(query.time.as_deref())?;
    let channel = query.channel.as_deref().unwrap_or("Je>1MeV");
    let percentile = percentile_or_default(&services, query.percentile.as_deref());
    let grid = services
        .flux
        .compute_grid(t, channel, &percentile, query.alt_km)
        .await?;
    Ok(Json(grid))
}

pub async fn decision_windows(
    State(registry): State<Registry>,
    Query(query): Query<TrackQuery>,
) -> ApiResult<Json<Vec<Window>>> {
    let services = registry.current().await;
    let track = resolve_track(&services, &query).await?;
    let percentile = percentile_or_default(&services, query.percentile.as_deref());
    Ok(Json(windows_along(&services, &track.points, &percentile).await?))
}

pub async fn plan_export(
    State(registry): State<Registry>,
    Query(query): Query<PlanQuery>,
) -> ApiResult<impl IntoResponse> {
    let services = registry.current().await;
    let start = parse_time(query.start.as_deref())?;
    let hours = query.hours.unwrap_or(24);
    if hours <= 0 {
        return Err(AppError::BadRequest("hours must be > 0".into()));
    }
    let end = shifted(start, Duration::try_hours(hours))?;

    let track_query = TrackQuery {
        start: Some(start.to_rfc3339()),
        end: Some(end.to_rfc3339()),
        step: query.step,
        percentile: None,
    };
    let track = resolve_track(&services, &track_query).await?;
    let percentile = percentile_or_default(&services, query.percentile.as_deref());
    let windows = windows_along(&services, &track.points, &percentile).await?;
    let items = build_plan(start, end, &windows, Mode::ObsOn);

    let provenance = PlanProvenance {
        norad_id: Some(track.tle.norad_id),
        tle_epoch: Some(track.tle.epoch),
        percentile,
        flux_model: services.flux.model_name().to_string(),
        track_step_sec: track.step_sec,
    };
    let mut body = Vec::new();
    write_plan_csv(&mut body, &items, &provenance)?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=observation_plan.csv",
            ),
        ],
        body,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tle_ingest::{InMemoryTleRepository, TleRepository};
    use tower::ServiceExt;

    const ISS_LINE1: &str = "1 25544U 98067A   25005.50000000  .00016717  00000+0  10270-3 0  9991";
    const ISS_LINE2: &str = "2 25544  51.6428  43.5905 0006786 306.3418  53.6891 15.50355749442125";

    fn seeded_registry() -> Registry {
        let repo = InMemoryTleRepository::new();
        let tle = TleSet::from_lines("fallback", ISS_LINE1, ISS_LINE2, Utc::now()).unwrap();
        repo.save(&tle).unwrap();

        let mut config = AppConfig::default();
        config.tle_source.norad_id = 25544;
        Registry::new(config, Arc::new(repo)).unwrap()
    }

    async fn get(registry: &Registry, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router(registry.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get(&seeded_registry(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["config_version"], 0);
    }

    #[tokio::test]
    async fn test_sat_state_uses_stored_tle() {
        let (status, body) = get(&seeded_registry(), "/sat/state?time=2025-01-05T13:00:00Z").await;
        assert_eq!(status, StatusCode::OK);
        let state: OrbitState = serde_json::from_slice(&body).unwrap();
        assert!(state.lat.abs() <= 52.0);
        assert!(state.alt_km > 350.0 && state.alt_km < 480.0);
        assert!(state.velocity_km_s > 7.0 && state.velocity_km_s < 8.0);
    }

    #[tokio::test]
    async fn test_track_bounds_and_step() {
        let registry = seeded_registry();
        let (status, body) = get(
            &registry,
            "/sat/track?start=2025-01-05T13:00:00Z&end=2025-01-05T13:10:00Z&step=60",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let points: Vec<TrackPoint> = serde_json::from_slice(&body).unwrap();
        assert_eq!(points.len(), 11);
        assert!(points.windows(2).all(|w| w[0].t < w[1].t));
    }

    #[tokio::test]
    async fn test_track_rejects_inverted_range() {
        let (status, body) = get(
            &seeded_registry(),
            "/sat/track?start=2025-01-05T13:10:00Z&end=2025-01-05T13:00:00Z",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_track_rejects_zero_step() {
        let (status, _) = get(
            &seeded_registry(),
            "/sat/track?start=2025-01-05T13:00:00Z&end=2025-01-05T13:10:00Z&step=0",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_track_over_huge_range_rejected() {
        let (status, body) = get(
            &seeded_registry(),
            "/sat/track?start=2025-01-05T13:00:00Z&end=2125-01-05T13:00:00Z&step=1",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["message"].as_str().unwrap().contains("exceeds the limit"));
    }

    #[tokio::test]
    async fn test_plan_export_rejects_overflowing_hours() {
        let registry = seeded_registry();
        for hours in ["3000000000", "9223372036854775807"] {
            let uri = format!("/decision/plan/export?start=2025-01-05T13:00:00Z&hours={hours}");
            let (status, _) = get(&registry, &uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "hours={hours}");
        }
    }

    #[tokio::test]
    async fn test_plan_export_rejects_oversized_track() {
        let (status, _) = get(
            &seeded_registry(),
            "/decision/plan/export?start=2025-01-05T13:00:00Z&hours=1000&step=1",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bad_time_is_bad_request() {
        let (status, _) = get(&seeded_registry(), "/sat/state?time=yesterday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_flux_track_covers_every_channel() {
        let (status, body) = get(
            &seeded_registry(),
            "/env/flux/track?start=2025-01-05T13:00:00Z&end=2025-01-05T13:05:00Z&step=60",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let samples: Vec<FluxSample> = serde_json::from_slice(&body).unwrap();
        assert_eq!(samples.len(), 6 * 4);
        assert!(samples.iter().all(|s| s.percentile == "mean" && s.value > 0.0));
    }

    #[tokio::test]
    async fn test_flux_grid_two_d() {
        let (status, body) = get(
            &seeded_registry(),
            "/env/flux/grid?time=2025-01-05T13:20:00Z&alt_km=900",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let grid: FluxGrid = serde_json::from_slice(&body).unwrap();
        assert_eq!(grid.channel, "Je>1MeV");
        assert_eq!(grid.altitudes_km, vec![900.0]);
        assert_eq!(grid.values.len(), 1);
        assert_eq!(grid.values[0].len(), grid.latitudes.len());
        assert_eq!(grid.values[0][0].len(), grid.longitudes.len());
    }

    #[tokio::test]
    async fn test_default_thresholds_switch_off_on_first_point() {
        // Mock flux of order 1e2 puts risk well above R_off; it never drops below R_on
        let (status, body) = get(
            &seeded_registry(),
            "/decision/windows?start=2025-01-05T13:00:00Z&end=2025-01-05T14:00:00Z",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let windows: Vec<Window> = serde_json::from_slice(&body).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].mode, Mode::ObsOff);
        assert_eq!(windows[0].t_end.to_rfc3339(), "2025-01-05T13:00:00+00:00");
        assert_eq!((windows[0].t_end - windows[0].t_start).num_seconds(), 180);
    }

    async fn export(registry: Registry, uri: &str) -> (axum::http::HeaderMap, String) {
        let response = router(registry)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (headers, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_plan_export_with_no_on_time_is_header_only() {
        let (headers, text) = export(
            seeded_registry(),
            "/decision/plan/export?start=2025-01-05T13:00:00Z&hours=1",
        )
        .await;
        assert_eq!(headers[header::CONTENT_TYPE], "text/csv");
        assert!(headers[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("observation_plan.csv"));
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("mode,on_utc,off_utc"));
    }

    #[tokio::test]
    async fn test_plan_export_quiet_thresholds() {
        let registry = seeded_registry();
        let mut config = registry.current().await.config.clone();
        config.decision.r_off = 1.0e6;
        config.decision.r_on = 1.0e5;
        registry.replace(config).await.unwrap();

        let (_, text) = export(
            registry,
            "/decision/plan/export?start=2025-01-05T13:00:00Z&hours=1",
        )
        .await;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with(
            "OBS_ON,2025-01-05T13:00:00Z,2025-01-05T14:00:00Z,3600,initial,25544,"
        ));
        assert!(lines[1].ends_with(",mean,mock,60"));
    }

    #[tokio::test]
    async fn test_config_update_round_trip() {
        let registry = seeded_registry();
        let mut config = registry.current().await.config.clone();
        config.decision.r_off = 5.5;

        let response = router(registry.clone())
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/config")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(&config).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (_, body) = get(&registry, "/config").await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["config"]["decision"]["r_off"], 5.5);
        assert_eq!(json["flux_model"], "mock");
    }

    #[tokio::test]
    async fn test_invalid_config_update_rejected() {
        let registry = seeded_registry();
        let mut config = registry.current().await.config.clone();
        config.decision.r_on = 9.0;

        let response = router(registry.clone())
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/config")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(&config).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(registry.current().await.version, 0);
    }
}
