//! Panel settings
//!
//! Loads from built-in defaults, an optional settings file, then `PANEL_*`
//! environment variables.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::scheduler::PollingConfig;
use crate::types::EquityRange;

pub const ENV_PREFIX: &str = "PANEL";

#[derive(Debug, Deserialize)]
struct RawSettings {
    engine_url: String,
    #[serde(default)]
    api_token: Option<String>,
    request_timeout_secs: u64,
    status_interval_secs: u64,
    dashboard_interval_secs: u64,
    protections_max_age_secs: u64,
    equity_range: String,
    log_level: String,
}

/// Validated settings for the sync orchestrator
#[derive(Clone)]
pub struct PanelSettings {
    pub engine_url: String,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
    pub polling: PollingConfig,
    pub protections_max_age: Duration,
    pub log_level: tracing::Level,
}

impl PanelSettings {
    /// Load settings, reading `path` when it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("engine_url", "http://127.0.0.1:8080")?
            .set_default("request_timeout_secs", 10)?
            .set_default("status_interval_secs", 5)?
            .set_default("dashboard_interval_secs", 30)?
            .set_default("protections_max_age_secs", 60)?
            .set_default("equity_range", "1d")?
            .set_default("log_level", "info")?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        let raw: RawSettings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()
            .context("Failed to build settings")?
            .try_deserialize()
            .context("Failed to deserialize settings")?;

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self> {
        let engine_url = raw.engine_url.trim().trim_end_matches('/').to_string();
        if !(engine_url.starts_with("http://") || engine_url.starts_with("https://")) {
            bail!("engine_url must be an http(s) URL, got {:?}", raw.engine_url);
        }

        let seconds = |name: &str, value: u64| -> Result<Duration> {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
            Ok(Duration::from_secs(value))
        };

        let equity_range: EquityRange = raw
            .equity_range
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let log_level = raw
            .log_level
            .parse::<tracing::Level>()
            .with_context(|| format!("Invalid log_level {:?}", raw.log_level))?;

        Ok(Self {
            engine_url,
            api_token: raw.api_token.filter(|token| !token.is_empty()),
            request_timeout: seconds("request_timeout_secs", raw.request_timeout_secs)?,
            polling: PollingConfig {
                status_interval: seconds("status_interval_secs", raw.status_interval_secs)?,
                dashboard_interval: seconds("dashboard_interval_secs", raw.dashboard_interval_secs)?,
                equity_range,
            },
            protections_max_age: seconds("protections_max_age_secs", raw.protections_max_age_secs)?,
            log_level,
        })
    }
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            engine_url: "http://127.0.0.1:8080".to_string(),
            api_token: None,
            request_timeout: Duration::from_secs(10),
            polling: PollingConfig::default(),
            protections_max_age: Duration::from_secs(60),
            log_level: tracing::Level::INFO,
        }
    }
}

impl std::fmt::Debug for PanelSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelSettings")
            .field("engine_url", &self.engine_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .field("polling", &self.polling)
            .field("protections_max_age", &self.protections_max_age)
            .field("log_level", &self.log_level)
            .finish()
    }
}
