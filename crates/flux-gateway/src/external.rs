//! External flux model process.
//!
//! Request file (JSON):
//! ```text
//! {"percentile": "p95", "channels": ["Je>1MeV"],
//!  "points": [{"lat": 1.0, "lon": 2.0, "alt_km": 500.0, "time": "2025-01-01T00:00:00Z"}]}
//! ```
//! Accepted output, index-aligned with the request points:
//! - JSON `{"points": [{"values": {"Je>1MeV": 1.5}}]}`
//! - CSV rows `index,channel,value` (optional header)
//!
//! Every point must carry every requested channel or the batch fails.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cache::FluxCache;
use crate::config::ExternalModelConfig;
use crate::{ChannelValues, FluxError, FluxPoint, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPoint {
    pub lat: f64,
    pub lon: f64,
    pub alt_km: f64,
    /// ISO-8601 UTC
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluxRequest {
    pub percentile: String,
    pub channels: Vec<String>,
    pub points: Vec<RequestPoint>,
}

impl FluxRequest {
    pub fn new(points: &[FluxPoint], channels: &[String], percentile: &str) -> Self {
        Self {
            percentile: percentile.to_string(),
            channels: channels.to_vec(),
            points: points
                .iter()
                .map(|p| RequestPoint {
                    lat: p.lat,
                    lon: p.lon,
                    alt_km: p.alt_km,
                    time: p.t.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct ModelOutput {
    points: Vec<ModelOutputPoint>,
}

#[derive(Deserialize)]
struct ModelOutputPoint {
    values: ChannelValues,
}

/// Runs one flux request to completion.
#[async_trait]
pub trait FluxRunner: Send + Sync {
    async fn run(&self, request: &FluxRequest) -> Result<Vec<ChannelValues>>;
}

// ============================================================================
// Subprocess runner
// ============================================================================

pub struct CommandRunner {
    executable: String,
    template: String,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(
        executable: impl Into<String>,
        template: impl Into<String>,
        timeout_sec: u64,
    ) -> Self {
        Self {
            executable: executable.into(),
            template: template.into(),
            timeout: Duration::from_secs(timeout_sec),
        }
    }

    /// Argv from the template. Tokens are split on whitespace before
    /// substitution, so paths containing spaces stay single arguments.
    pub fn argv(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.template
            .split_whitespace()
            .map(|token| {
                token
                    .replace("{exe}", &self.executable)
                    .replace("{input}", &input)
                    .replace("{output}", &output)
            })
            .collect()
    }
}

#[async_trait]
impl FluxRunner for CommandRunner {
    async fn run(&self, request: &FluxRequest) -> Result<Vec<ChannelValues>> {
        let workdir = tempfile::tempdir()?;
        let input_path = workdir.path().join("input.json");
        let output_path = workdir.path().join("output.json");
        tokio::fs::write(&input_path, serde_json::to_vec(request)?).await?;

        let argv = self.argv(&input_path, &output_path);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| FluxError::InvalidConfig("empty command template".into()))?;

        debug!(%program, points = request.points.len(), "running flux model");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FluxError::Process(format!("cannot start {}: {}", program, e)))?;

        // Dropping the child on timeout kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| FluxError::Timeout(self.timeout.as_secs()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FluxError::Process(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        let text = tokio::fs::read_to_string(&output_path)
            .await
            .map_err(|e| FluxError::Malformed(format!("no output file: {}", e)))?;
        parse_output(&text, request)
    }
}

/// Decode model output for `request`, JSON first, CSV otherwise.
pub fn parse_output(text: &str, request: &FluxRequest) -> Result<Vec<ChannelValues>> {
    let n = request.points.len();
    let trimmed = text.trim_start();

    let values = if trimmed.starts_with('{') {
        let parsed: ModelOutput = serde_json::from_str(trimmed)
            .map_err(|e| FluxError::Malformed(format!("bad JSON output: {}", e)))?;
        if parsed.points.len() != n {
            return Err(FluxError::Malformed(format!(
                "expected {} points, got {}",
                n,
                parsed.points.len()
            )));
        }
        parsed.points.into_iter().map(|p| p.values).collect()
    } else {
        parse_csv(trimmed, n)?
    };

    check_complete(values, &request.channels)
}

fn parse_csv(text: &str, n: usize) -> Result<Vec<ChannelValues>> {
    let mut out = vec![ChannelValues::new(); n];
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = 0usize;
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| FluxError::Malformed(format!("bad CSV output: {}", e)))?;
        if record.len() < 3 {
            return Err(FluxError::Malformed(format!(
                "line {}: expected index,channel,value",
                line + 1
            )));
        }
        let Ok(index) = record[0].parse::<usize>() else {
            if line == 0 {
                continue;
            }
            return Err(FluxError::Malformed(format!(
                "line {}: bad index {:?}",
                line + 1,
                &record[0]
            )));
        };
        let value: f64 = record[2].parse().map_err(|_| {
            FluxError::Malformed(format!("line {}: bad value {:?}", line + 1, &record[2]))
        })?;
        let slot = out.get_mut(index).ok_or_else(|| {
            FluxError::Malformed(format!("line {}: index {} out of range", line + 1, index))
        })?;
        slot.insert(record[1].to_string(), value);
        rows += 1;
    }

    if rows == 0 && n > 0 {
        return Err(FluxError::Malformed("empty CSV output".into()));
    }
    Ok(out)
}

/// Keep only requested channels and require all of them at every point.
fn check_complete(values: Vec<ChannelValues>, channels: &[String]) -> Result<Vec<ChannelValues>> {
    values
        .into_iter()
        .enumerate()
        .map(|(i, mut point)| {
            point.retain(|ch, _| channels.contains(ch));
            match channels.iter().find(|ch| !point.contains_key(*ch)) {
                Some(missing) => Err(FluxError::Malformed(format!(
                    "point {} missing channel {}",
                    i, missing
                ))),
                None => Ok(point),
            }
        })
        .collect()
}

// ============================================================================
// Cached model
// ============================================================================

pub struct ExternalFluxModel {
    runner: Box<dyn FluxRunner>,
    cache: FluxCache,
}

impl ExternalFluxModel {
    pub fn new(runner: Box<dyn FluxRunner>, cache: FluxCache) -> Self {
        Self { runner, cache }
    }

    /// `None` when no executable or command template is configured.
    pub fn from_config(config: &ExternalModelConfig) -> Option<Self> {
        let executable = config.executable.as_deref().filter(|e| !e.trim().is_empty())?;
        if config.command_template.trim().is_empty() {
            return None;
        }
        info!(%executable, cache = %config.cache_dir.display(), "external flux model configured");

        let runner = CommandRunner::new(
            executable,
            config.command_template.clone(),
            config.timeout_sec,
        );
        Some(Self::new(
            Box::new(runner),
            FluxCache::new(config.cache_dir.clone(), config.cache_ttl_sec),
        ))
    }

    pub async fn flux_batch(
        &self,
        points: &[FluxPoint],
        channels: &[String],
        percentile: &str,
    ) -> Result<Vec<ChannelValues>> {
        if points.is_empty() {
            return Ok(Vec::new());
        }

        let request = FluxRequest::new(points, channels, percentile);
        let key = FluxCache::key(&request)?;
        let cached = {
            let (cache, key) = (self.cache.clone(), key.clone());
            tokio::task::spawn_blocking(move || cache.get(&key, Utc::now())).await?
        };
        if let Some(hit) = cached {
            if hit.len() == points.len() {
                debug!(%key, "flux cache hit");
                return Ok(hit);
            }
        }

        let values = self.runner.run(&request).await?;
        if values.len() != points.len() {
            return Err(FluxError::Malformed(format!(
                "expected {} points, got {}",
                points.len(),
                values.len()
            )));
        }

        let written = {
            let (cache, key, values) = (self.cache.clone(), key.clone(), values.clone());
            tokio::task::spawn_blocking(move || cache.put(&key, &values, Utc::now())).await?
        };
        if let Err(e) = written {
            warn!(%key, "flux cache write failed: {}", e);
        }
        Ok(values)
    }
}
