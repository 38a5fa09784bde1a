//! Protection Manager
//!
//! The engine owns the active protection set. This module validates new
//! rules before they leave the process, keeps a short-lived cache of the
//! engine's listing, and forwards global/pair stop queries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::gateway::{commands, CommandGateway};
use crate::types::StopStatus;

/// How long a fetched listing is trusted by default
pub const DEFAULT_LISTING_MAX_AGE: Duration = Duration::from_secs(60);

/// Protection families understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionKind {
    Cooldown,
    LowProfit,
    MaxDrawdown,
    StoplossGuard,
}

/// Whether a protection halts everything or a single pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopScope {
    Global,
    Pair,
}

impl ProtectionKind {
    pub const ALL: [ProtectionKind; 4] = [
        ProtectionKind::Cooldown,
        ProtectionKind::LowProfit,
        ProtectionKind::MaxDrawdown,
        ProtectionKind::StoplossGuard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionKind::Cooldown => "cooldown",
            ProtectionKind::LowProfit => "low_profit",
            ProtectionKind::MaxDrawdown => "max_drawdown",
            ProtectionKind::StoplossGuard => "stoploss_guard",
        }
    }

    /// Name the engine lists this protection under
    pub fn engine_name(&self) -> &'static str {
        match self {
            ProtectionKind::Cooldown => "CooldownPeriod",
            ProtectionKind::LowProfit => "LowProfitPairs",
            ProtectionKind::MaxDrawdown => "MaxDrawdownProtection",
            ProtectionKind::StoplossGuard => "StoplossGuard",
        }
    }

    pub fn from_engine_name(name: &str) -> Option<Self> {
        ProtectionKind::ALL
            .into_iter()
            .find(|kind| kind.engine_name() == name)
    }

    pub fn scope(&self) -> StopScope {
        match self {
            ProtectionKind::Cooldown | ProtectionKind::MaxDrawdown => StopScope::Global,
            ProtectionKind::LowProfit | ProtectionKind::StoplossGuard => StopScope::Pair,
        }
    }

    pub(crate) fn add_command(&self) -> &'static str {
        match self {
            ProtectionKind::Cooldown => commands::ADD_COOLDOWN_PROTECTION,
            ProtectionKind::LowProfit => commands::ADD_LOW_PROFIT_PROTECTION,
            ProtectionKind::MaxDrawdown => commands::ADD_MAX_DRAWDOWN_PROTECTION,
            ProtectionKind::StoplossGuard => commands::ADD_STOPLOSS_GUARD,
        }
    }
}

impl std::fmt::Display for ProtectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProtectionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown protection kind: {}", s))
    }
}

/// Untyped parameters as entered by a user, validated per kind
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProtectionParams {
    values: Map<String, Value>,
}

impl ProtectionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(values) => Some(Self { values }),
            _ => None,
        }
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownConfig {
    pub stop_duration: i64,
    pub lookback_period: i64,
    pub stop_after_losses: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowProfitConfig {
    pub stop_duration: i64,
    pub lookback_period: i64,
    /// Minimum profit ratio over the lookback window
    pub required_profit: f64,
    pub required_trades: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaxDrawdownConfig {
    /// Drawdown ratio in (0, 1], e.g. 0.2 for 20%
    pub max_allowed_drawdown: f64,
    pub lookback_period: i64,
    pub stop_duration: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoplossGuardConfig {
    pub lookback_period: i64,
    pub stop_duration: i64,
    pub max_stoploss_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtectionSettings {
    Cooldown(CooldownConfig),
    LowProfit(LowProfitConfig),
    MaxDrawdown(MaxDrawdownConfig),
    StoplossGuard(StoplossGuardConfig),
}

/// A validated protection ready to be sent to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectionRule {
    pub settings: ProtectionSettings,
    pub enabled: bool,
}

impl ProtectionRule {
    /// Validate `params` for `kind`. Durations are in minutes.
    pub fn from_params(
        kind: ProtectionKind,
        params: &ProtectionParams,
    ) -> Result<Self, ProtectionError> {
        let check = Validator { kind, params };

        let settings = match kind {
            ProtectionKind::Cooldown => ProtectionSettings::Cooldown(CooldownConfig {
                lookback_period: check.required_minutes("lookback_period")?,
                stop_duration: check.optional_minutes("stop_duration", 60)?,
                stop_after_losses: check.optional_count("stop_after_losses", 2)?,
            }),
            ProtectionKind::LowProfit => ProtectionSettings::LowProfit(LowProfitConfig {
                lookback_period: check.required_minutes("lookback_period")?,
                required_profit: check.ratio("required_profit", -1.0, true)?,
                stop_duration: check.optional_minutes("stop_duration", 60)?,
                required_trades: check.optional_count("required_trades", 3)?,
            }),
            ProtectionKind::MaxDrawdown => ProtectionSettings::MaxDrawdown(MaxDrawdownConfig {
                max_allowed_drawdown: check.ratio("max_allowed_drawdown", 0.0, false)?,
                lookback_period: check.optional_minutes("lookback_period", 1440)?,
                stop_duration: check.optional_minutes("stop_duration", 60)?,
            }),
            ProtectionKind::StoplossGuard => {
                ProtectionSettings::StoplossGuard(StoplossGuardConfig {
                    lookback_period: check.required_minutes("lookback_period")?,
                    stop_duration: check.optional_minutes("stop_duration", 30)?,
                    max_stoploss_count: check.optional_count("max_stoploss_count", 2)?,
                })
            }
        };

        let enabled = match params.get("enabled") {
            None => true,
            Some(Value::Bool(enabled)) => *enabled,
            Some(_) => return Err(check.invalid("enabled must be true or false")),
        };

        Ok(Self { settings, enabled })
    }

    pub fn kind(&self) -> ProtectionKind {
        match self.settings {
            ProtectionSettings::Cooldown(_) => ProtectionKind::Cooldown,
            ProtectionSettings::LowProfit(_) => ProtectionKind::LowProfit,
            ProtectionSettings::MaxDrawdown(_) => ProtectionKind::MaxDrawdown,
            ProtectionSettings::StoplossGuard(_) => ProtectionKind::StoplossGuard,
        }
    }

    /// Engine payload for the kind's add command
    pub(crate) fn to_config_value(&self) -> serde_json::Result<Value> {
        let mut value = match &self.settings {
            ProtectionSettings::Cooldown(c) => serde_json::to_value(c)?,
            ProtectionSettings::LowProfit(c) => serde_json::to_value(c)?,
            ProtectionSettings::MaxDrawdown(c) => serde_json::to_value(c)?,
            ProtectionSettings::StoplossGuard(c) => serde_json::to_value(c)?,
        };
        if let Value::Object(fields) = &mut value {
            fields.insert("enabled".to_string(), Value::Bool(self.enabled));
        }
        Ok(value)
    }
}

struct Validator<'a> {
    kind: ProtectionKind,
    params: &'a ProtectionParams,
}

impl Validator<'_> {
    fn invalid(&self, reason: impl Into<String>) -> ProtectionError {
        ProtectionError::InvalidProtectionConfig {
            kind: self.kind,
            reason: reason.into(),
        }
    }

    fn required_minutes(&self, field: &str) -> Result<i64, ProtectionError> {
        match self.params.get(field) {
            None => Err(self.invalid(format!("{} is required", field))),
            Some(value) => self.minutes(field, value),
        }
    }

    fn optional_minutes(&self, field: &str, default: i64) -> Result<i64, ProtectionError> {
        match self.params.get(field) {
            None => Ok(default),
            Some(value) => self.minutes(field, value),
        }
    }

    fn minutes(&self, field: &str, value: &Value) -> Result<i64, ProtectionError> {
        match value.as_i64() {
            Some(minutes) if minutes > 0 => Ok(minutes),
            Some(_) => Err(self.invalid(format!("{} must be a positive number of minutes", field))),
            None => Err(self.invalid(format!("{} must be a whole number of minutes", field))),
        }
    }

    fn optional_count(&self, field: &str, default: usize) -> Result<usize, ProtectionError> {
        match self.params.get(field) {
            None => Ok(default),
            Some(value) => match value.as_u64() {
                Some(count) if count > 0 => Ok(count as usize),
                _ => Err(self.invalid(format!("{} must be a positive whole number", field))),
            },
        }
    }

    /// Ratio within `(min, 1]`, or `[min, 1]` when `min_inclusive`
    fn ratio(&self, field: &str, min: f64, min_inclusive: bool) -> Result<f64, ProtectionError> {
        let value = match self.params.get(field) {
            None => return Err(self.invalid(format!("{} is required", field))),
            Some(Value::String(text)) => {
                return Err(self.invalid(format!(
                    "{} must be a ratio such as 0.2, not the string {:?}",
                    field, text
                )))
            }
            Some(value) => value
                .as_f64()
                .ok_or_else(|| self.invalid(format!("{} must be a ratio", field)))?,
        };

        let above_min = if min_inclusive { value >= min } else { value > min };
        if !value.is_finite() || !above_min || value > 1.0 {
            let lower = if min_inclusive { "[" } else { "(" };
            return Err(self.invalid(format!(
                "{} must be a ratio in {}{}, 1], got {}",
                field, lower, min, value
            )));
        }
        Ok(value)
    }
}

/// One entry of the engine's active protection listing.
///
/// The engine lists only the names of active rules, so an entry carries
/// no enabled flag or parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtectionEntry {
    pub name: String,
    /// `None` when the engine reports a protection this client does not know
    pub kind: Option<ProtectionKind>,
}

impl ProtectionEntry {
    fn from_engine_name(name: String) -> Self {
        Self {
            kind: ProtectionKind::from_engine_name(&name),
            name,
        }
    }

    pub fn scope(&self) -> Option<StopScope> {
        self.kind.map(|kind| kind.scope())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtectionError {
    /// Local validation failure; nothing was sent to the engine
    #[error("invalid {kind} protection config: {reason}")]
    InvalidProtectionConfig { kind: ProtectionKind, reason: String },

    #[error("failed to add {kind} protection: {source}")]
    Add {
        kind: ProtectionKind,
        source: GatewayError,
    },

    #[error("failed to remove protection {name}: {source}")]
    Remove { name: String, source: GatewayError },

    #[error("failed to list protections: {0}")]
    List(GatewayError),

    #[error("stop query failed: {0}")]
    Query(GatewayError),
}

struct CachedListing {
    entries: Arc<Vec<ProtectionEntry>>,
    fetched_at: Instant,
}

#[derive(Default)]
struct ListingState {
    cached: Option<CachedListing>,
    /// Bumped on every invalidation so a fetch racing a mutation is not stored
    generation: u64,
}

/// Manages the engine's protection rules
pub struct ProtectionManager {
    gateway: Arc<CommandGateway>,
    listing: Mutex<ListingState>,
    max_age: Duration,
}

impl ProtectionManager {
    pub fn new(gateway: Arc<CommandGateway>) -> Self {
        Self {
            gateway,
            listing: Mutex::new(ListingState::default()),
            max_age: DEFAULT_LISTING_MAX_AGE,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Last known listing, fetched when missing or stale
    pub async fn list(&self) -> Result<Arc<Vec<ProtectionEntry>>, ProtectionError> {
        {
            let listing = self.listing.lock().await;
            if let Some(cached) = &listing.cached {
                if cached.fetched_at.elapsed() < self.max_age {
                    return Ok(cached.entries.clone());
                }
                debug!("Protection listing is stale, refetching");
            }
        }
        self.refresh().await
    }

    /// Fetch the listing from the engine regardless of the cache
    pub async fn refresh(&self) -> Result<Arc<Vec<ProtectionEntry>>, ProtectionError> {
        let generation = self.listing.lock().await.generation;

        let names = self
            .gateway
            .list_protections()
            .await
            .map_err(ProtectionError::List)?;
        let entries: Arc<Vec<ProtectionEntry>> = Arc::new(
            names
                .into_iter()
                .map(ProtectionEntry::from_engine_name)
                .collect(),
        );

        let mut listing = self.listing.lock().await;
        if listing.generation == generation {
            listing.cached = Some(CachedListing {
                entries: entries.clone(),
                fetched_at: Instant::now(),
            });
        } else {
            debug!("Protection set changed during fetch, not caching listing");
        }
        Ok(entries)
    }

    /// Cached listing without touching the engine
    pub async fn cached(&self) -> Option<Arc<Vec<ProtectionEntry>>> {
        self.listing
            .lock()
            .await
            .cached
            .as_ref()
            .map(|cached| cached.entries.clone())
    }

    /// Validate and add a rule
    pub async fn add(
        &self,
        kind: ProtectionKind,
        params: &ProtectionParams,
    ) -> Result<ProtectionRule, ProtectionError> {
        let rule = ProtectionRule::from_params(kind, params)?;

        self.gateway
            .add_protection(&rule)
            .await
            .map_err(|source| ProtectionError::Add { kind, source })?;
        self.invalidate().await;

        info!("Added {} protection ({})", kind, kind.engine_name());
        Ok(rule)
    }

    /// Remove a rule by engine name or kind tag.
    ///
    /// Returns whether the engine had the rule; absence is not an error.
    pub async fn remove(&self, name: &str) -> Result<bool, ProtectionError> {
        let engine_name = ProtectionKind::from_str(name)
            .map(|kind| kind.engine_name().to_string())
            .unwrap_or_else(|_| name.to_string());

        let removed = self
            .gateway
            .remove_protection(&engine_name)
            .await
            .map_err(|source| ProtectionError::Remove {
                name: engine_name.clone(),
                source,
            })?;
        self.invalidate().await;

        if removed {
            info!("Removed protection {}", engine_name);
        } else {
            debug!("Protection {} was not active, nothing to remove", engine_name);
        }
        Ok(removed)
    }

    pub async fn check_global_stop(&self) -> Result<StopStatus, ProtectionError> {
        self.gateway
            .check_global_stop()
            .await
            .map_err(ProtectionError::Query)
    }

    pub async fn check_pair_stop(&self, pair: &str) -> Result<StopStatus, ProtectionError> {
        self.gateway
            .check_pair_stop(pair)
            .await
            .map_err(ProtectionError::Query)
    }

    async fn invalidate(&self) {
        let mut listing = self.listing.lock().await;
        listing.cached = None;
        listing.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubTransport;
    use serde_json::json;

    fn manager(stub: &Arc<StubTransport>) -> ProtectionManager {
        ProtectionManager::new(Arc::new(CommandGateway::new(stub.clone())))
    }

    #[test]
    fn test_cooldown_requires_lookback() {
        let err = ProtectionRule::from_params(ProtectionKind::Cooldown, &ProtectionParams::new())
            .unwrap_err();
        assert_eq!(
            err,
            ProtectionError::InvalidProtectionConfig {
                kind: ProtectionKind::Cooldown,
                reason: "lookback_period is required".to_string(),
            }
        );
    }

    #[test]
    fn test_defaults_fill_optional_fields() {
        let rule = ProtectionRule::from_params(
            ProtectionKind::StoplossGuard,
            &ProtectionParams::new().with("lookback_period", 90),
        )
        .unwrap();

        assert!(rule.enabled);
        assert_eq!(
            rule.settings,
            ProtectionSettings::StoplossGuard(StoplossGuardConfig {
                lookback_period: 90,
                stop_duration: 30,
                max_stoploss_count: 2,
            })
        );
    }

    #[test]
    fn test_drawdown_must_be_ratio() {
        let as_string = ProtectionParams::new().with("max_allowed_drawdown", "20%");
        assert!(matches!(
            ProtectionRule::from_params(ProtectionKind::MaxDrawdown, &as_string),
            Err(ProtectionError::InvalidProtectionConfig { .. })
        ));

        let as_percent = ProtectionParams::new().with("max_allowed_drawdown", 20.0);
        assert!(ProtectionRule::from_params(ProtectionKind::MaxDrawdown, &as_percent).is_err());

        let ok = ProtectionParams::new().with("max_allowed_drawdown", 0.2);
        let rule = ProtectionRule::from_params(ProtectionKind::MaxDrawdown, &ok).unwrap();
        assert_eq!(rule.kind().scope(), StopScope::Global);
    }

    #[test]
    fn test_low_profit_needs_lookback_and_profit() {
        let only_lookback = ProtectionParams::new().with("lookback_period", 60);
        let err =
            ProtectionRule::from_params(ProtectionKind::LowProfit, &only_lookback).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid low_profit protection config: required_profit is required"
        );

        let negative_lookback = ProtectionParams::new()
            .with("lookback_period", -5)
            .with("required_profit", 0.0);
        assert!(ProtectionRule::from_params(ProtectionKind::LowProfit, &negative_lookback).is_err());

        let ok = ProtectionParams::new()
            .with("lookback_period", 60)
            .with("required_profit", -0.05);
        assert!(ProtectionRule::from_params(ProtectionKind::LowProfit, &ok).is_ok());
    }

    #[test]
    fn test_engine_names_round_trip() {
        for kind in ProtectionKind::ALL {
            assert_eq!(ProtectionKind::from_engine_name(kind.engine_name()), Some(kind));
            assert_eq!(kind.as_str().parse::<ProtectionKind>(), Ok(kind));
        }
        assert_eq!(ProtectionKind::from_engine_name("cooldown"), None);
    }

    #[tokio::test]
    async fn test_invalid_add_makes_no_remote_call() {
        let stub = Arc::new(StubTransport::new());
        let result = manager(&stub)
            .add(ProtectionKind::Cooldown, &ProtectionParams::new())
            .await;

        assert!(matches!(
            result,
            Err(ProtectionError::InvalidProtectionConfig { .. })
        ));
        assert_eq!(stub.calls(commands::ADD_COOLDOWN_PROTECTION), 0);
    }

    #[tokio::test]
    async fn test_add_sends_kind_command_and_invalidates_listing() {
        let stub = Arc::new(StubTransport::new());
        stub.reply(commands::LIST_PROTECTIONS, Ok(json!(["CooldownPeriod"])));
        stub.reply(commands::ADD_MAX_DRAWDOWN_PROTECTION, Ok(Value::Null));

        let manager = manager(&stub);
        manager.list().await.unwrap();
        manager.list().await.unwrap();
        assert_eq!(stub.calls(commands::LIST_PROTECTIONS), 1);

        manager
            .add(
                ProtectionKind::MaxDrawdown,
                &ProtectionParams::new().with("max_allowed_drawdown", 0.25),
            )
            .await
            .unwrap();
        assert_eq!(
            stub.last_args(commands::ADD_MAX_DRAWDOWN_PROTECTION),
            Some(json!({
                "config": {
                    "max_allowed_drawdown": 0.25,
                    "lookback_period": 1440,
                    "stop_duration": 60,
                    "enabled": true
                }
            }))
        );
        assert!(manager.cached().await.is_none());

        manager.list().await.unwrap();
        assert_eq!(stub.calls(commands::LIST_PROTECTIONS), 2);
    }

    #[tokio::test]
    async fn test_stale_listing_is_refetched() {
        let stub = Arc::new(StubTransport::new());
        stub.reply(commands::LIST_PROTECTIONS, Ok(json!(["StoplossGuard", "Custom"])));

        let manager = manager(&stub).with_max_age(Duration::ZERO);
        let entries = manager.list().await.unwrap();
        assert_eq!(entries[0].kind, Some(ProtectionKind::StoplossGuard));
        assert_eq!(entries[0].scope(), Some(StopScope::Pair));
        assert_eq!(entries[1].kind, None);
        assert_eq!(
            serde_json::to_value(&entries[0]).unwrap(),
            json!({ "name": "StoplossGuard", "kind": "stoploss_guard" })
        );

        manager.list().await.unwrap();
        assert_eq!(stub.calls(commands::LIST_PROTECTIONS), 2);
    }

    #[tokio::test]
    async fn test_remove_absent_rule_is_success() {
        let stub = Arc::new(StubTransport::new());
        stub.reply(commands::REMOVE_PROTECTION, Ok(json!(false)));

        let removed = manager(&stub).remove("cooldown").await.unwrap();
        assert!(!removed);
        assert_eq!(
            stub.last_args(commands::REMOVE_PROTECTION),
            Some(json!({ "name": "CooldownPeriod" }))
        );
    }

    #[tokio::test]
    async fn test_stop_queries_leave_listing_alone() {
        let stub = Arc::new(StubTransport::new());
        stub.reply(commands::LIST_PROTECTIONS, Ok(json!(["CooldownPeriod"])));
        stub.reply(commands::CHECK_GLOBAL_STOP, Ok(Value::Null));

        let manager = manager(&stub);
        let before = manager.list().await.unwrap();
        assert_eq!(manager.check_global_stop().await.unwrap(), StopStatus::Clear);
        assert_eq!(manager.cached().await, Some(before));
    }
}
