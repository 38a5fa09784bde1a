//! Core domain types shared between the engine and the panel
//!
//! These types define the wire contract of the engine command surface.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    #[default]
    #[serde(alias = "Stopped")]
    Stopped,
    #[serde(alias = "Running")]
    Running,
    #[serde(alias = "Paused")]
    Paused,
    #[serde(alias = "Error")]
    Error,
}

impl BotStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, BotStatus::Running)
    }

    /// Whether the engine is alive enough to be worth polling
    pub fn is_active(&self) -> bool {
        matches!(self, BotStatus::Running | BotStatus::Paused)
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BotStatus::Stopped => write!(f, "stopped"),
            BotStatus::Running => write!(f, "running"),
            BotStatus::Paused => write!(f, "paused"),
            BotStatus::Error => write!(f, "error"),
        }
    }
}

/// Candle timeframe tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "2h")]
    TwoHours,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "8h")]
    EightHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "3d")]
    ThreeDays,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1M")]
    OneMonth,
}

impl Timeframe {
    const ALL: [Timeframe; 15] = [
        Timeframe::OneMinute,
        Timeframe::ThreeMinutes,
        Timeframe::FiveMinutes,
        Timeframe::FifteenMinutes,
        Timeframe::ThirtyMinutes,
        Timeframe::OneHour,
        Timeframe::TwoHours,
        Timeframe::FourHours,
        Timeframe::SixHours,
        Timeframe::EightHours,
        Timeframe::TwelveHours,
        Timeframe::OneDay,
        Timeframe::ThreeDays,
        Timeframe::OneWeek,
        Timeframe::OneMonth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::ThreeMinutes => "3m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::ThirtyMinutes => "30m",
            Timeframe::OneHour => "1h",
            Timeframe::TwoHours => "2h",
            Timeframe::FourHours => "4h",
            Timeframe::SixHours => "6h",
            Timeframe::EightHours => "8h",
            Timeframe::TwelveHours => "12h",
            Timeframe::OneDay => "1d",
            Timeframe::ThreeDays => "3d",
            Timeframe::OneWeek => "1w",
            Timeframe::OneMonth => "1M",
        }
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| format!("unknown timeframe: {}", s))
    }
}

/// Why a trade was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitType {
    Signal,
    StopLoss,
    TakeProfit,
    StopLossOnExchange,
    ForceExit,
    EmergencyExit,
    Custom,
}

/// A trade as reported by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub pair: String,
    pub is_open: bool,
    #[serde(default)]
    pub exchange: String,
    pub open_rate: Decimal,
    pub open_date: DateTime<Utc>,
    #[serde(default)]
    pub close_rate: Option<Decimal>,
    #[serde(default)]
    pub close_date: Option<DateTime<Utc>>,
    pub amount: Decimal,
    pub stake_amount: Decimal,
    pub strategy: String,
    pub timeframe: Timeframe,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub exit_reason: Option<ExitType>,
    #[serde(default)]
    pub profit_abs: Option<Decimal>,
    #[serde(default)]
    pub profit_ratio: Option<Decimal>,
}

impl Trade {
    /// Closed trades are immutable once `close_date` is set
    pub fn is_active(&self) -> bool {
        self.is_open && self.close_date.is_none()
    }
}

/// Aggregate dashboard statistics, always replaced as a whole
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_profit: f64,
    pub win_rate: f64,
    pub open_trades: usize,
    pub max_drawdown: f64,
    pub total_balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: String,
    pub value: f64,
}

/// Granularity selector for the equity curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EquityRange {
    #[default]
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
}

impl EquityRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            EquityRange::OneDay => "1d",
            EquityRange::OneWeek => "1w",
        }
    }
}

impl FromStr for EquityRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1d" => Ok(EquityRange::OneDay),
            "1w" => Ok(EquityRange::OneWeek),
            other => Err(format!("unknown equity range: {}", other)),
        }
    }
}

impl std::fmt::Display for EquityRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Equity points together with the range they were fetched for
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct EquityCurve {
    pub range: Option<EquityRange>,
    pub points: Vec<EquityPoint>,
}

/// An engine-enforced trading halt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReason {
    pub reason: String,
    pub until: DateTime<Utc>,
    /// Engine name of the protection that raised the stop
    pub protection: String,
}

/// Answer to a global or pair stop query.
///
/// `Clear` is only produced from an explicit engine reply; a failed query
/// is an error, never `Clear`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum StopStatus {
    Clear,
    Active(StopReason),
}

impl StopStatus {
    pub fn is_stopped(&self) -> bool {
        matches!(self, StopStatus::Active(_))
    }

    pub fn reason(&self) -> Option<&StopReason> {
        match self {
            StopStatus::Clear => None,
            StopStatus::Active(reason) => Some(reason),
        }
    }
}

impl From<Option<StopReason>> for StopStatus {
    fn from(value: Option<StopReason>) -> Self {
        value.map_or(StopStatus::Clear, StopStatus::Active)
    }
}

/// Backtest request handed to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub strategy: String,
    pub pair: String,
    pub timeframe: Timeframe,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timerange: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stake_amount: Option<Decimal>,
}

/// Backtest outcome; the simulation itself runs inside the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy: String,
    pub pair: String,
    pub timeframe: Timeframe,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_profit: Decimal,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub profit_factor: f64,
    pub avg_profit: Decimal,
    pub avg_loss: Decimal,
    #[serde(default)]
    pub trades: Vec<Trade>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bot_status_accepts_both_casings() {
        let lower: BotStatus = serde_json::from_value(json!("running")).unwrap();
        let upper: BotStatus = serde_json::from_value(json!("Running")).unwrap();
        assert_eq!(lower, BotStatus::Running);
        assert_eq!(upper, BotStatus::Running);
        assert!(serde_json::from_value::<BotStatus>(json!("starting")).is_err());
    }

    #[test]
    fn test_timeframe_tags() {
        assert_eq!("1h".parse::<Timeframe>().unwrap(), Timeframe::OneHour);
        assert_eq!("1M".parse::<Timeframe>().unwrap(), Timeframe::OneMonth);
        assert!("2w".parse::<Timeframe>().is_err());
        assert_eq!(serde_json::to_value(Timeframe::FifteenMinutes).unwrap(), json!("15m"));
    }

    #[test]
    fn test_trade_decodes_with_optional_fields_missing() {
        let trade: Trade = serde_json::from_value(json!({
            "id": "6f1c2c8e-5d8a-4d43-9d6e-1f1b6f2a9c11",
            "pair": "BTCUSDT",
            "is_open": true,
            "open_rate": "42000.5",
            "open_date": "2026-01-02T03:04:05Z",
            "amount": 0.01,
            "stake_amount": "420.005",
            "strategy": "SimpleStrategy",
            "timeframe": "1h"
        }))
        .unwrap();

        assert!(trade.is_active());
        assert_eq!(trade.open_rate, Decimal::new(420005, 1));
        assert!(trade.exit_reason.is_none());
    }

    #[test]
    fn test_stop_status_from_option() {
        assert_eq!(StopStatus::from(None), StopStatus::Clear);

        let empty_reason = StopReason {
            reason: String::new(),
            until: Utc::now(),
            protection: "StoplossGuard".to_string(),
        };
        let status = StopStatus::from(Some(empty_reason.clone()));
        assert!(status.is_stopped());
        assert_eq!(status.reason(), Some(&empty_reason));
    }
}
