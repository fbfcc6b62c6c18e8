//! On-disk flux result cache.
//!
//! One JSON file per request, named by the SHA-256 of the serialized
//! payload. Entries are written to a temp file in the cache directory and
//! renamed into place, so readers never see a partial entry.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::external::FluxRequest;
use crate::{ChannelValues, Result};

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    written_at: DateTime<Utc>,
    values: Vec<ChannelValues>,
}

#[derive(Debug, Clone)]
pub struct FluxCache {
    dir: PathBuf,
    ttl: Duration,
}

impl FluxCache {
    pub fn new(dir: impl Into<PathBuf>, ttl_sec: u64) -> Self {
        Self {
            dir: dir.into(),
            ttl: i64::try_from(ttl_sec)
                .ok()
                .and_then(Duration::try_seconds)
                .unwrap_or(Duration::MAX),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Hex SHA-256 of the exact request payload.
    pub fn key(request: &FluxRequest) -> Result<String> {
        let bytes = serde_json::to_vec(request)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Cached values if present and younger than the TTL. Unreadable entries
    /// count as misses; expired ones are removed.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<Vec<ChannelValues>> {
        let path = self.entry_path(key);
        let raw = std::fs::read(&path).ok()?;
        let entry: CacheEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), "ignoring unreadable flux cache entry: {}", e);
                return None;
            }
        };

        if now - entry.written_at > self.ttl {
            debug!(key, "flux cache entry expired");
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), "cannot remove expired flux cache entry: {}", e);
                }
            }
            return None;
        }
        Some(entry.values)
    }

    pub fn put(&self, key: &str, values: &[ChannelValues], now: DateTime<Utc>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let entry = CacheEntry {
            written_at: now,
            values: values.to_vec(),
        };
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&serde_json::to_vec(&entry)?)?;
        tmp.flush()?;
        tmp.persist(self.entry_path(key)).map_err(|e| e.error)?;

        debug!(key, points = values.len(), "flux cache entry written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(percentile: &str) -> FluxRequest {
        FluxRequest {
            percentile: percentile.to_string(),
            channels: vec!["Je>1MeV".to_string()],
            points: Vec::new(),
        }
    }

    fn values() -> Vec<ChannelValues> {
        vec![[("Je>1MeV".to_string(), 12.5)].into_iter().collect()]
    }

    #[test]
    fn test_key_depends_on_payload() {
        let a = FluxCache::key(&request("mean")).unwrap();
        let b = FluxCache::key(&request("mean")).unwrap();
        let c = FluxCache::key(&request("p95")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_put_then_get_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FluxCache::new(dir.path().join("flux"), 60);
        let now = Utc::now();

        cache.put("abc", &values(), now).unwrap();
        assert_eq!(cache.get("abc", now + Duration::seconds(30)), Some(values()));
        assert_eq!(cache.get("abc", now + Duration::seconds(61)), None);
        assert_eq!(cache.get("missing", now), None);
    }

    #[test]
    fn test_expired_entry_is_removed_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FluxCache::new(dir.path(), 60);
        let now = Utc::now();
        cache.put("old", &values(), now).unwrap();
        assert!(dir.path().join("old.json").exists());

        assert_eq!(cache.get("old", now + Duration::seconds(120)), None);
        assert!(!dir.path().join("old.json").exists());
        // Still a plain miss afterwards
        assert_eq!(cache.get("old", now), None);
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FluxCache::new(dir.path(), u64::MAX);
        let now = Utc::now();
        cache.put("k", &values(), now).unwrap();
        assert_eq!(cache.get("k", now + Duration::days(3650)), Some(values()));
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FluxCache::new(dir.path(), 60);
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        assert_eq!(cache.get("bad", Utc::now()), None);
    }

    #[test]
    fn test_put_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FluxCache::new(dir.path(), 60);
        cache.put("k", &values(), Utc::now()).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["k.json".to_string()]);
    }
}
