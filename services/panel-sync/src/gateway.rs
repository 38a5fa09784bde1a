//! Command Gateway
//!
//! Typed wrapper over [`CommandTransport`]. One method per engine
//! capability; arguments are validated locally and replies are decoded
//! exactly once, here. No retries happen at this layer.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::protections::ProtectionRule;
use crate::transport::{CommandTransport, Reply, TransportError};
use crate::types::{
    BacktestConfig, BacktestResult, BotStatus, DashboardStats, EquityPoint, EquityRange,
    StopReason, StopStatus, Trade,
};

/// Default bound on a single command round trip
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine command names
pub mod commands {
    pub const GET_BOT_STATUS: &str = "get_bot_status";
    pub const START_BOT: &str = "start_bot";
    pub const STOP_BOT: &str = "stop_bot";
    pub const GET_OPEN_TRADES: &str = "get_open_trades";
    pub const GET_ALL_TRADES: &str = "get_all_trades";
    pub const GET_DASHBOARD_STATS: &str = "get_dashboard_stats";
    pub const GET_EQUITY_CURVE: &str = "get_equity_curve";
    pub const GET_CONFIG: &str = "get_config";
    pub const UPDATE_CONFIG: &str = "update_config";
    pub const LIST_PROTECTIONS: &str = "list_protections";
    pub const ADD_COOLDOWN_PROTECTION: &str = "add_cooldown_protection";
    pub const ADD_LOW_PROFIT_PROTECTION: &str = "add_low_profit_protection";
    pub const ADD_MAX_DRAWDOWN_PROTECTION: &str = "add_max_drawdown_protection";
    pub const ADD_STOPLOSS_GUARD: &str = "add_stoploss_guard";
    pub const REMOVE_PROTECTION: &str = "remove_protection";
    pub const CHECK_GLOBAL_STOP: &str = "check_global_stop";
    pub const CHECK_PAIR_STOP: &str = "check_pair_stop";
    pub const RUN_BACKTEST: &str = "run_backtest";
}

/// Typed access to the engine command surface
pub struct CommandGateway {
    transport: Arc<dyn CommandTransport>,
    timeout: Duration,
}

impl CommandGateway {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    // --- Bot lifecycle ---

    pub async fn get_status(&self) -> GatewayResult<BotStatus> {
        self.call(commands::GET_BOT_STATUS, Value::Null).await
    }

    /// Returns the engine's confirmation message
    pub async fn start_bot(&self) -> GatewayResult<String> {
        self.call_confirmation(commands::START_BOT, Value::Null).await
    }

    pub async fn stop_bot(&self) -> GatewayResult<String> {
        self.call_confirmation(commands::STOP_BOT, Value::Null).await
    }

    // --- Trades and dashboard ---

    pub async fn get_open_trades(&self) -> GatewayResult<Vec<Trade>> {
        self.call(commands::GET_OPEN_TRADES, Value::Null).await
    }

    pub async fn get_all_trades(&self) -> GatewayResult<Vec<Trade>> {
        self.call(commands::GET_ALL_TRADES, Value::Null).await
    }

    pub async fn get_dashboard_stats(&self) -> GatewayResult<DashboardStats> {
        self.call(commands::GET_DASHBOARD_STATS, Value::Null).await
    }

    pub async fn get_equity_curve(&self, range: EquityRange) -> GatewayResult<Vec<EquityPoint>> {
        self.call(
            commands::GET_EQUITY_CURVE,
            json!({ "timeframe": range.as_str() }),
        )
        .await
    }

    // --- Configuration ---

    pub async fn get_config(&self) -> GatewayResult<AppConfig> {
        self.call(commands::GET_CONFIG, Value::Null).await
    }

    /// Replace the engine configuration with a full document
    pub async fn update_config(&self, config: &AppConfig) -> GatewayResult<()> {
        let config = serde_json::to_value(config).map_err(|e| GatewayError::InvalidArgument {
            command: commands::UPDATE_CONFIG,
            reason: e.to_string(),
        })?;
        self.call_unit(commands::UPDATE_CONFIG, json!({ "config": config }))
            .await
    }

    // --- Protections ---

    pub async fn list_protections(&self) -> GatewayResult<Vec<String>> {
        self.call(commands::LIST_PROTECTIONS, Value::Null).await
    }

    pub async fn add_protection(&self, rule: &ProtectionRule) -> GatewayResult<()> {
        let command = rule.kind().add_command();
        let config = rule.to_config_value().map_err(|e| GatewayError::InvalidArgument {
            command,
            reason: e.to_string(),
        })?;
        self.call_unit(command, json!({ "config": config })).await
    }

    /// Returns whether the engine actually had a rule with that name
    pub async fn remove_protection(&self, name: &str) -> GatewayResult<bool> {
        if name.trim().is_empty() {
            return Err(GatewayError::InvalidArgument {
                command: commands::REMOVE_PROTECTION,
                reason: "protection name must not be empty".to_string(),
            });
        }
        self.call(commands::REMOVE_PROTECTION, json!({ "name": name }))
            .await
    }

    pub async fn check_global_stop(&self) -> GatewayResult<StopStatus> {
        let reason: Option<StopReason> = self.call(commands::CHECK_GLOBAL_STOP, Value::Null).await?;
        Ok(StopStatus::from(reason))
    }

    pub async fn check_pair_stop(&self, pair: &str) -> GatewayResult<StopStatus> {
        let pair = pair.trim();
        if pair.is_empty() {
            return Err(GatewayError::InvalidArgument {
                command: commands::CHECK_PAIR_STOP,
                reason: "pair symbol must not be empty".to_string(),
            });
        }
        let reason: Option<StopReason> = self
            .call(commands::CHECK_PAIR_STOP, json!({ "pair": pair }))
            .await?;
        Ok(StopStatus::from(reason))
    }

    // --- Backtest ---

    pub async fn run_backtest(&self, config: &BacktestConfig) -> GatewayResult<BacktestResult> {
        let invalid = |reason: &str| GatewayError::InvalidArgument {
            command: commands::RUN_BACKTEST,
            reason: reason.to_string(),
        };
        if config.strategy.trim().is_empty() {
            return Err(invalid("strategy must not be empty"));
        }
        if config.pair.trim().is_empty() {
            return Err(invalid("pair symbol must not be empty"));
        }
        let config = serde_json::to_value(config).map_err(|e| invalid(&e.to_string()))?;
        self.call(commands::RUN_BACKTEST, json!({ "config": config }))
            .await
    }

    // --- Plumbing ---

    async fn call<T: DeserializeOwned>(&self, command: &'static str, args: Value) -> GatewayResult<T> {
        let reply = self.invoke(command, args).await?.ok_or_else(|| {
            warn!("Discarding empty {} reply", command);
            GatewayError::DecodeError {
                command,
                reason: "empty reply".to_string(),
            }
        })?;
        decode(command, reply)
    }

    /// Confirmation replies are a bare message string, or nothing at all
    async fn call_confirmation(&self, command: &'static str, args: Value) -> GatewayResult<String> {
        let message: Option<String> = match self.invoke(command, args).await? {
            Some(reply) => decode(command, reply)?,
            None => None,
        };
        Ok(message.unwrap_or_default())
    }

    /// Commands whose reply carries no information
    async fn call_unit(&self, command: &'static str, args: Value) -> GatewayResult<()> {
        self.invoke(command, args).await.map(|_| ())
    }

    async fn invoke(&self, command: &'static str, args: Value) -> GatewayResult<Reply> {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.transport.invoke(command, args)).await;
        let elapsed_ms = started.elapsed().as_millis();

        match outcome {
            Ok(Ok(reply)) => {
                debug!("{} completed in {}ms", command, elapsed_ms);
                Ok(reply)
            }
            Ok(Err(e)) => {
                debug!("{} failed after {}ms: {}", command, elapsed_ms, e);
                Err(match e {
                    TransportError::Unavailable(reason) => {
                        GatewayError::RemoteUnavailable { command, reason }
                    }
                    TransportError::Rejected(reason) => {
                        GatewayError::RemoteRejected { command, reason }
                    }
                    TransportError::Malformed(reason) => GatewayError::DecodeError { command, reason },
                })
            }
            Err(_) => {
                debug!("{} timed out after {:?}", command, self.timeout);
                Err(GatewayError::RemoteUnavailable {
                    command,
                    reason: format!("timed out after {}s", self.timeout.as_secs_f64()),
                })
            }
        }
    }
}

fn decode<T: DeserializeOwned>(command: &'static str, reply: Value) -> GatewayResult<T> {
    serde_json::from_value(reply).map_err(|e| {
        warn!("Discarding malformed {} reply: {}", command, e);
        GatewayError::DecodeError {
            command,
            reason: e.to_string(),
        }
    })
}
