//! Line-delimited TLE sources over HTTP.

use async_trait::async_trait;
use orbital_mechanics::elements;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::{DataSourceError, IngestError, Result};

pub const CELESTRAK_GP_URL: &str =
    "https://celestrak.org/NORAD/elements/gp.php?CATNR={norad_id}&FORMAT=TLE";

/// Where the acquisition service looks for element sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TleSourceConfig {
    pub norad_id: u32,
    /// Operator feed. `None` means only the fallback is used.
    pub primary_url: Option<String>,
    /// `{norad_id}` is substituted before the request
    pub fallback_url: String,
    pub primary_user: Option<String>,
    pub primary_password: Option<String>,
    pub timeout_sec: u64,
}

impl Default for TleSourceConfig {
    fn default() -> Self {
        Self {
            norad_id: 65488,
            primary_url: None,
            fallback_url: CELESTRAK_GP_URL.to_string(),
            primary_user: None,
            primary_password: None,
            timeout_sec: 10,
        }
    }
}

impl TleSourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_sec == 0 {
            return Err(IngestError::InvalidConfig("tle source timeout_sec must be > 0".into()));
        }
        if self.fallback_url.trim().is_empty() {
            return Err(IngestError::InvalidConfig("fallback_url must not be empty".into()));
        }
        Ok(())
    }
}

/// Anything that can hand back one raw (line1, line2) pair for a catalog number.
#[async_trait]
pub trait TleSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, norad_id: u32) -> std::result::Result<(String, String), DataSourceError>;
}

pub struct HttpTleSource {
    name: String,
    url_template: String,
    basic_auth: Option<(String, Option<String>)>,
    client: reqwest::Client,
}

impl HttpTleSource {
    pub fn new(
        name: impl Into<String>,
        url_template: impl Into<String>,
        timeout_sec: u64,
    ) -> Result<Self> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_sec))
            .build()
            .map_err(|e| {
                IngestError::InvalidConfig(format!("{}: cannot build HTTP client: {}", name, e))
            })?;

        Ok(Self {
            name,
            url_template: url_template.into(),
            basic_auth: None,
            client,
        })
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        self.basic_auth = Some((user.into(), password));
        self
    }

    /// Primary source from config, if one is configured.
    pub fn primary(config: &TleSourceConfig) -> Result<Option<Self>> {
        let Some(url) = config.primary_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let mut source = Self::new("primary", url, config.timeout_sec)?;
        if let Some(user) = &config.primary_user {
            source = source.with_basic_auth(user.clone(), config.primary_password.clone());
        }
        Ok(Some(source))
    }

    pub fn fallback(config: &TleSourceConfig) -> Result<Self> {
        Self::new("fallback", config.fallback_url.clone(), config.timeout_sec)
    }

    pub fn url_for(&self, norad_id: u32) -> String {
        self.url_template.replace("{norad_id}", &norad_id.to_string())
    }
}

#[async_trait]
impl TleSource for HttpTleSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, norad_id: u32) -> std::result::Result<(String, String), DataSourceError> {
        let url = self.url_for(norad_id);
        debug!(source = %self.name, %url, "requesting TLE");

        let mut request = self.client.get(&url);
        if let Some((user, password)) = &self.basic_auth {
            request = request.basic_auth(user, password.as_ref());
        }

        let response = request.send().await.map_err(|e| DataSourceError::Request {
            source_name: self.name.clone(),
            message: e.to_string(),
        })?;

        if !response.status().is_success() {
            return Err(DataSourceError::Status {
                source_name: self.name.clone(),
                status: response.status().as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| DataSourceError::Request {
            source_name: self.name.clone(),
            message: e.to_string(),
        })?;

        elements::extract_pair(&body).ok_or_else(|| DataSourceError::MissingLines {
            source_name: self.name.clone(),
        })
    }
}
