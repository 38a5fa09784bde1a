//! Panel Sync Library
//!
//! Keeps a local model of a trading engine in sync for a control panel:
//! typed command access, a cached domain model, status-driven polling,
//! bot lifecycle control and protection management.

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod panel;
pub mod protections;
pub mod scheduler;
pub mod settings;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use cache::{ModelCache, Snapshot};
pub use config::{AppConfig, ConfigPatch, ConfigUpdateError};
pub use error::{GatewayError, GatewayResult};
pub use gateway::CommandGateway;
pub use lifecycle::{LifecycleAction, LifecycleController, LifecycleError};
pub use panel::Panel;
pub use protections::{
    ProtectionEntry, ProtectionError, ProtectionKind, ProtectionManager, ProtectionParams,
    ProtectionRule, StopScope,
};
pub use scheduler::{CycleKind, CycleReport, Notice, PollingConfig, SchedulerError, SchedulerState};
pub use settings::PanelSettings;
pub use transport::{CommandTransport, HttpTransport, Reply, TransportError};
pub use types::{
    BacktestConfig, BacktestResult, BotStatus, DashboardStats, EquityCurve, EquityPoint,
    EquityRange, StopReason, StopStatus, Timeframe, Trade,
};
