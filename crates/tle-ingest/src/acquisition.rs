//! TLE acquisition: fetch → cross-check → score → persist.
//!
//! Degrades in three steps and never fails on source trouble:
//! 1. primary, cross-checked against the fallback
//! 2. fallback alone
//! 3. a `placeholder` record with a warning and a capped score, so the
//!    pipeline keeps running with risk inflated downstream
//!
//! Storage failures do propagate. Repository calls run on the blocking pool.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::quality::QualityAssessor;
use crate::repository::TleRepository;
use crate::sources::TleSource;
use crate::{DataSourceError, IngestError, Result, TleSet};
use orbital_mechanics::elements;

/// Used only when every source is down. Tagged `placeholder`.
const PLACEHOLDER_LINE1: &str =
    "1 25544U 98067A   25005.50000000  .00016717  00000+0  10270-3 0  9991";
const PLACEHOLDER_LINE2: &str =
    "2 25544  51.6428  43.5905 0006786 306.3418  53.6891 15.50355749442125";

/// Score ceiling for placeholder records; stays under any sane low-quality
/// threshold so downstream risk is inflated.
pub const PLACEHOLDER_MAX_SCORE: f64 = 0.1;

pub struct AcquisitionService {
    repo: Arc<dyn TleRepository>,
    assessor: QualityAssessor,
    primary: Option<Box<dyn TleSource>>,
    fallback: Box<dyn TleSource>,
    norad_id: u32,
}

impl AcquisitionService {
    pub fn new(
        repo: Arc<dyn TleRepository>,
        assessor: QualityAssessor,
        primary: Option<Box<dyn TleSource>>,
        fallback: Box<dyn TleSource>,
        norad_id: u32,
    ) -> Self {
        Self {
            repo,
            assessor,
            primary,
            fallback,
            norad_id,
        }
    }

    pub fn norad_id(&self) -> u32 {
        self.norad_id
    }

    pub fn repository(&self) -> &Arc<dyn TleRepository> {
        &self.repo
    }

    pub async fn fetch_and_store(&self) -> Result<TleSet> {
        self.fetch_and_store_at(Utc::now()).await
    }

    /// Acquire, score against the latest stored record and append.
    pub async fn fetch_and_store_at(&self, now: DateTime<Utc>) -> Result<TleSet> {
        let candidate = self.acquire(now).await?;
        let norad_id = self.norad_id;
        let previous = self.blocking(move |repo| repo.latest(norad_id)).await?;
        let mut scored = self.assessor.assess(candidate, previous.as_ref(), now);
        if scored.source == PLACEHOLDER_SOURCE && scored.score > PLACEHOLDER_MAX_SCORE {
            let warnings = std::mem::take(&mut scored.warnings);
            scored = scored.with_assessment(PLACEHOLDER_MAX_SCORE, warnings);
        }

        let record = scored.clone();
        self.blocking(move |repo| repo.save(&record)).await?;

        info!(
            norad_id = scored.norad_id,
            source = %scored.source,
            score = scored.score,
            warnings = scored.warnings.len(),
            "TLE stored"
        );
        Ok(scored)
    }

    /// Stored TLE fetched within `history_days` whose epoch is closest to
    /// `t`, higher score winning ties.
    pub async fn select_for_time(
        &self,
        t: DateTime<Utc>,
        history_days: i64,
    ) -> Result<Option<TleSet>> {
        let norad_id = self.norad_id;
        let candidates = self
            .blocking(move |repo| repo.list_recent(norad_id, history_days))
            .await?;
        Ok(candidates.into_iter().min_by(|a, b| {
            let da = (t - a.epoch).num_milliseconds().unsigned_abs();
            let db = (t - b.epoch).num_milliseconds().unsigned_abs();
            da.cmp(&db).then_with(|| b.score.total_cmp(&a.score))
        }))
    }

    /// Run a repository call on the blocking pool; SQLite I/O must not stall
    /// the runtime workers.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn TleRepository) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let repo = Arc::clone(&self.repo);
        tokio::task::spawn_blocking(move || f(repo.as_ref()))
            .await
            .map_err(IngestError::from)?
    }

    async fn acquire(&self, now: DateTime<Utc>) -> std::result::Result<TleSet, DataSourceError> {
        let mut warnings = Vec::new();

        if let Some(primary) = &self.primary {
            match self.fetch_parsed(primary.as_ref(), now).await {
                Ok(tle) => {
                    match self.fallback.fetch(self.norad_id).await {
                        Ok((l1, l2)) => warnings.extend(self.compare_sources(
                            (tle.line1.as_str(), tle.line2.as_str()),
                            (l1.as_str(), l2.as_str()),
                        )),
                        Err(e) => {
                            warn!("fallback unavailable for cross-check: {}", e);
                            warnings.push("Fallback unavailable for consistency check".to_string());
                        }
                    }
                    return Ok(tle.with_assessment(1.0, warnings));
                }
                Err(e) => {
                    warn!("primary TLE source failed: {}", e);
                    warnings.push(format!("Primary source failed: {}", e));
                }
            }
        }

        match self.fetch_parsed(self.fallback.as_ref(), now).await {
            Ok(tle) => return Ok(tle.with_assessment(1.0, warnings)),
            Err(e) => {
                warn!("fallback TLE source failed: {}", e);
                warnings.push(format!("Fallback source failed: {}", e));
            }
        }

        warn!(norad_id = self.norad_id, "all TLE sources down, using placeholder elements");
        warnings.push("Placeholder TLE in use; orbit is not trustworthy".to_string());
        let tle = placeholder(PLACEHOLDER_LINE1, PLACEHOLDER_LINE2, self.norad_id, now)?;
        Ok(tle.with_assessment(1.0, warnings))
    }

    async fn fetch_parsed(
        &self,
        source: &dyn TleSource,
        now: DateTime<Utc>,
    ) -> std::result::Result<TleSet, DataSourceError> {
        let (l1, l2) = source.fetch(self.norad_id).await?;
        let mut tle = TleSet::from_lines(source.name(), &l1, &l2, now).map_err(|e| {
            DataSourceError::Parse {
                source_name: source.name().to_string(),
                message: e.to_string(),
            }
        })?;
        tle.norad_id = self.norad_id;
        Ok(tle)
    }

    fn compare_sources(&self, primary: (&str, &str), secondary: (&str, &str)) -> Vec<String> {
        let primary_num = elements::norad_from_line1(primary.0);
        let secondary_num = elements::norad_from_line1(secondary.0);

        if primary_num != secondary_num || primary_num != Some(self.norad_id) {
            return vec![format!(
                "NORAD mismatch primary={} secondary={} expected={}",
                fmt_num(primary_num),
                fmt_num(secondary_num),
                self.norad_id
            )];
        }
        if primary.0.trim() != secondary.0.trim() || primary.1.trim() != secondary.1.trim() {
            return vec!["Primary vs fallback TLE lines differ".to_string()];
        }
        Vec::new()
    }
}

const PLACEHOLDER_SOURCE: &str = "placeholder";

/// Placeholder record relabelled to `norad_id`. Lines that do not parse are
/// an error rather than a record with a made-up epoch.
fn placeholder(
    line1: &str,
    line2: &str,
    norad_id: u32,
    now: DateTime<Utc>,
) -> std::result::Result<TleSet, DataSourceError> {
    let mut tle = TleSet::from_lines(PLACEHOLDER_SOURCE, line1, line2, now).map_err(|e| {
        error!(norad_id, "placeholder TLE does not parse: {}", e);
        DataSourceError::Parse {
            source_name: PLACEHOLDER_SOURCE.to_string(),
            message: e.to_string(),
        }
    })?;
    tle.norad_id = norad_id;
    Ok(tle)
}

fn fmt_num(n: Option<u32>) -> String {
    n.map(|n| n.to_string()).unwrap_or_else(|| "none".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::TleQualityConfig;
    use crate::repository::InMemoryTleRepository;
    use crate::test_support::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSource {
        name: &'static str,
        reply: std::result::Result<(String, String), DataSourceError>,
        calls: Arc<AtomicUsize>,
    }

    impl FixedSource {
        fn ok(name: &'static str, l1: &str, l2: &str) -> Self {
            Self {
                name,
                reply: Ok((l1.to_string(), l2.to_string())),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn down(name: &'static str) -> Self {
            Self {
                name,
                reply: Err(DataSourceError::Status {
                    source_name: name.to_string(),
                    status: 503,
                }),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl TleSource for FixedSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch(
            &self,
            _norad_id: u32,
        ) -> std::result::Result<(String, String), DataSourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    fn service(
        primary: Option<FixedSource>,
        fallback: FixedSource,
    ) -> (AcquisitionService, Arc<InMemoryTleRepository>) {
        let repo = Arc::new(InMemoryTleRepository::new());
        let assessor = QualityAssessor::new(TleQualityConfig::default()).unwrap();
        let svc = AcquisitionService::new(
            repo.clone(),
            assessor,
            primary.map(|p| Box::new(p) as Box<dyn TleSource>),
            Box::new(fallback),
            25544,
        );
        (svc, repo)
    }

    #[tokio::test]
    async fn test_primary_with_matching_fallback() {
        let (svc, repo) = service(
            Some(FixedSource::ok("primary", ISS_LINE1, ISS_LINE2)),
            FixedSource::ok("fallback", ISS_LINE1, ISS_LINE2),
        );
        let tle = svc.fetch_and_store_at(epoch()).await.unwrap();

        assert_eq!(tle.source, "primary");
        assert_eq!(tle.score, 1.0);
        assert!(tle.warnings.is_empty(), "{:?}", tle.warnings);
        assert_eq!(repo.latest(25544).unwrap().unwrap(), tle);
    }

    #[tokio::test]
    async fn test_primary_lines_differ_from_fallback() {
        let (svc, _) = service(
            Some(FixedSource::ok("primary", ISS_LINE1, ISS_LINE2)),
            FixedSource::ok("fallback", ISS_LINE1, ISS_TILTED_LINE2),
        );
        let tle = svc.fetch_and_store_at(epoch()).await.unwrap();

        assert_eq!(tle.source, "primary");
        assert_eq!(tle.warnings, vec!["Primary vs fallback TLE lines differ".to_string()]);
    }

    #[tokio::test]
    async fn test_primary_with_fallback_down() {
        let (svc, _) = service(
            Some(FixedSource::ok("primary", ISS_LINE1, ISS_LINE2)),
            FixedSource::down("fallback"),
        );
        let tle = svc.fetch_and_store_at(epoch()).await.unwrap();
        assert_eq!(tle.source, "primary");
        assert_eq!(
            tle.warnings,
            vec!["Fallback unavailable for consistency check".to_string()]
        );
    }

    #[test]
    fn test_norad_mismatch_is_warned() {
        let (svc, _) = service(
            Some(FixedSource::ok("primary", ISS_LINE1, ISS_LINE2)),
            FixedSource::ok("fallback", ISS_LINE1, ISS_LINE2),
        );
        let warnings = svc.compare_sources(
            (ISS_LINE1, ISS_LINE2),
            ("1 99999U 98067A   25005.50000000", ISS_LINE2),
        );
        assert_eq!(
            warnings,
            vec!["NORAD mismatch primary=25544 secondary=99999 expected=25544".to_string()]
        );
    }

    #[tokio::test]
    async fn test_fallback_used_when_primary_fails() {
        let (svc, _) = service(
            Some(FixedSource::down("primary")),
            FixedSource::ok("fallback", ISS_LINE1, ISS_LINE2),
        );
        let tle = svc.fetch_and_store_at(epoch()).await.unwrap();

        assert_eq!(tle.source, "fallback");
        assert_eq!(tle.warnings.len(), 1);
        assert!(tle.warnings[0].starts_with("Primary source failed"));
    }

    #[tokio::test]
    async fn test_placeholder_when_all_sources_down() {
        let primary = FixedSource::down("primary");
        let fallback = FixedSource::down("fallback");
        let fallback_calls = fallback.calls.clone();
        let (svc, repo) = service(Some(primary), fallback);

        let tle = svc.fetch_and_store_at(epoch()).await.unwrap();

        assert_eq!(tle.source, "placeholder");
        assert_eq!(tle.norad_id, 25544);
        assert!(tle.warnings.iter().any(|w| w.starts_with("Placeholder TLE")));
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
        assert_eq!(repo.latest(25544).unwrap().unwrap().source, "placeholder");
    }

    #[tokio::test]
    async fn test_placeholder_score_stays_below_low_quality_threshold() {
        let (svc, repo) =
            service(Some(FixedSource::down("primary")), FixedSource::down("fallback"));
        // Fetched at the placeholder epoch; the assessor alone gives 1.0
        let tle = svc.fetch_and_store_at(epoch()).await.unwrap();

        assert_eq!(tle.score, PLACEHOLDER_MAX_SCORE);
        assert!(tle.score < 0.5);
        assert!(tle.warnings.iter().any(|w| w.starts_with("Placeholder TLE")));
        assert_eq!(repo.latest(25544).unwrap().unwrap().score, PLACEHOLDER_MAX_SCORE);
    }

    #[test]
    fn test_placeholder_lines_parse_and_propagate() {
        let tle = placeholder(PLACEHOLDER_LINE1, PLACEHOLDER_LINE2, 65488, epoch()).unwrap();
        assert_eq!(tle.norad_id, 65488);
        assert_eq!(tle.source, "placeholder");
        assert_eq!(tle.epoch, epoch());

        let propagator = orbital_mechanics::OrbitPropagator::default();
        let state = propagator.propagate(&tle, tle.epoch + Duration::hours(1)).unwrap();
        assert!(state.alt_km > 350.0 && state.alt_km < 500.0, "alt {}", state.alt_km);
    }

    #[test]
    fn test_unparseable_placeholder_is_an_error() {
        let err = placeholder("1 garbage", "2 garbage", 25544, epoch()).unwrap_err();
        assert!(matches!(
            err,
            DataSourceError::Parse { ref source_name, .. } if source_name == "placeholder"
        ));
    }

    #[tokio::test]
    async fn test_unparseable_primary_degrades() {
        let (svc, _) = service(
            Some(FixedSource::ok("primary", "1 garbage", "2 garbage")),
            FixedSource::ok("fallback", ISS_LINE1, ISS_LINE2),
        );
        let tle = svc.fetch_and_store_at(epoch()).await.unwrap();
        assert_eq!(tle.source, "fallback");
    }

    #[tokio::test]
    async fn test_second_fetch_scored_against_first() {
        let (svc, repo) = service(None, FixedSource::ok("fallback", ISS_LINE1, ISS_LINE2));
        svc.fetch_and_store_at(epoch()).await.unwrap();
        let later = epoch() + Duration::hours(3);
        let second = svc.fetch_and_store_at(later).await.unwrap();

        assert!(second.score < 1.0);
        assert!(second.warnings.iter().any(|w| w.starts_with("TLE stale")));
        assert_eq!(repo.list_since(25544, DateTime::<Utc>::MIN_UTC).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_select_for_time_prefers_closest_then_score() {
        let repo = Arc::new(InMemoryTleRepository::new());
        let now = Utc::now();
        let base = iss("fallback", now);
        let later = TleSet {
            epoch: base.epoch + Duration::hours(6),
            ..base.clone()
        };

        repo.save(&base.clone().with_assessment(0.4, Vec::new())).unwrap();
        repo.save(&base.clone().with_assessment(0.9, Vec::new())).unwrap();
        repo.save(&later.clone().with_assessment(1.0, Vec::new())).unwrap();

        let svc = AcquisitionService::new(
            repo,
            QualityAssessor::new(TleQualityConfig::default()).unwrap(),
            None,
            Box::new(FixedSource::down("fallback")),
            25544,
        );

        let picked = svc
            .select_for_time(base.epoch + Duration::hours(1), 14)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(picked.epoch, base.epoch);
        assert_eq!(picked.score, 0.9);

        let picked = svc
            .select_for_time(base.epoch + Duration::hours(5), 14)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(picked.epoch, later.epoch);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sqlite_store_and_select_off_runtime_workers() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(crate::SqliteTleRepository::open(dir.path().join("tle.db")).unwrap());
        let svc = AcquisitionService::new(
            repo.clone(),
            QualityAssessor::new(TleQualityConfig::default()).unwrap(),
            None,
            Box::new(FixedSource::ok("fallback", ISS_LINE1, ISS_LINE2)),
            25544,
        );

        let stored = svc.fetch_and_store_at(Utc::now()).await.unwrap();
        let picked = svc.select_for_time(stored.epoch, 14).await.unwrap().unwrap();
        assert_eq!(picked.epoch, stored.epoch);
        assert_eq!(repo.latest(25544).unwrap().unwrap().source, "fallback");
    }

    #[tokio::test]
    async fn test_select_for_time_empty_history() {
        let (svc, _) = service(None, FixedSource::down("fallback"));
        assert!(svc.select_for_time(Utc::now(), 14).await.unwrap().is_none());
    }
}
