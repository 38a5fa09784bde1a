//! Engine configuration document
//!
//! The engine owns the configuration. The panel only ever holds a fetched
//! copy and edits it through [`ConfigPatch`] in a read-modify-write cycle.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::GatewayError;
use crate::types::Timeframe;

/// Full engine configuration.
///
/// Every section is required on the wire; a reply missing one does not
/// decode. `Default` is only a starting document for tests and tooling.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub exchange: ExchangeConfig,
    pub strategy: StrategyConfig,
    pub database: DatabaseConfig,
    pub api_server: ApiServerConfig,
    pub log: LogConfig,
}

impl AppConfig {
    pub const SECTIONS: [&'static str; 6] =
        ["bot", "exchange", "strategy", "database", "api_server", "log"];
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BotConfig {
    pub max_open_trades: usize,
    pub stake_currency: String,
    pub stake_amount: f64,
    pub dry_run: bool,
    pub dry_run_wallet: f64,
    pub process_only_new_candles: bool,
    #[serde(default)]
    pub trading_pairs: Vec<String>,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            max_open_trades: 3,
            stake_currency: "USDT".to_string(),
            stake_amount: 100.0,
            dry_run: true,
            dry_run_wallet: 10000.0,
            process_only_new_candles: true,
            trading_pairs: Vec::new(),
            timeframe: default_timeframe(),
        }
    }
}

fn default_timeframe() -> String {
    "1h".to_string()
}

#[derive(Clone, PartialEq, Deserialize, Serialize)]
pub struct ExchangeConfig {
    pub name: String,
    pub key: String,
    pub secret: String,
    pub enable_rate_limit: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            name: "binance".to_string(),
            key: String::new(),
            secret: String::new(),
            enable_rate_limit: true,
        }
    }
}

// Credentials stay out of logs
impl std::fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("name", &self.name)
            .field("key", &redacted(&self.key))
            .field("secret", &redacted(&self.secret))
            .field("enable_rate_limit", &self.enable_rate_limit)
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        "***"
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StrategyConfig {
    pub name: String,
    pub timeframe: Timeframe,
    #[serde(default)]
    pub params: Value,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            name: "SimpleStrategy".to_string(),
            timeframe: Timeframe::OneHour,
            params: Value::Object(Map::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "user_data/trades.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApiServerConfig {
    pub enabled: bool,
    pub listen_ip: String,
    pub listen_port: u16,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_ip: "127.0.0.1".to_string(),
            listen_port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
        }
    }
}

/// Partial configuration update.
///
/// Objects are merged key by key into the current remote document; any
/// other value replaces the target. `null` is refused because every field
/// of the document is required by the engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ConfigPatch {
    sections: Map<String, Value>,
}

impl ConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single field, e.g. `set("bot", "max_open_trades", json!(5))`
    pub fn set(mut self, section: &str, key: &str, value: impl Into<Value>) -> Self {
        let entry = self
            .sections
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(fields) = entry {
            fields.insert(key.to_string(), value.into());
        } else {
            let mut fields = Map::new();
            fields.insert(key.to_string(), value.into());
            *entry = Value::Object(fields);
        }
        self
    }

    /// Build from a JSON object such as `{"bot": {"dry_run": false}}`
    pub fn from_value(value: Value) -> Result<Self, ConfigUpdateError> {
        match value {
            Value::Object(sections) => Ok(Self { sections }),
            other => Err(ConfigUpdateError::InvalidPatch(format!(
                "patch must be a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Merge into `base` and check that the result is still a valid document
    pub fn apply_to(&self, base: &AppConfig) -> Result<AppConfig, ConfigUpdateError> {
        for section in self.sections.keys() {
            if !AppConfig::SECTIONS.contains(&section.as_str()) {
                return Err(ConfigUpdateError::InvalidPatch(format!(
                    "unknown config section: {}",
                    section
                )));
            }
        }

        let mut document = serde_json::to_value(base)
            .map_err(|e| ConfigUpdateError::InvalidPatch(e.to_string()))?;
        merge(&mut document, &Value::Object(self.sections.clone()), "")?;

        serde_json::from_value(document).map_err(|e| {
            ConfigUpdateError::InvalidPatch(format!("patched config is invalid: {}", e))
        })
    }
}

fn merge(target: &mut Value, patch: &Value, path: &str) -> Result<(), ConfigUpdateError> {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                if value.is_null() {
                    return Err(ConfigUpdateError::InvalidPatch(format!(
                        "{} cannot be null",
                        child_path
                    )));
                }
                let nested = value.is_object()
                    && target.get(key).map_or(false, |existing| existing.is_object());
                match target.get_mut(key) {
                    Some(existing) if nested => merge(existing, value, &child_path)?,
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
            Ok(())
        }
        (target, patch) => {
            *target = patch.clone();
            Ok(())
        }
    }
}

/// Failure of a configuration update
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigUpdateError {
    #[error("invalid config patch: {0}")]
    InvalidPatch(String),

    #[error("config update failed: {0}")]
    Remote(#[from] GatewayError),
}
