//! Panel orchestrator
//!
//! Owns the gateway, cache, scheduler, lifecycle controller and protection
//! manager for one engine connection. Every cache mutation outside the
//! scheduler goes through a method here.

use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::cache::{ModelCache, Snapshot};
use crate::config::{AppConfig, ConfigPatch, ConfigUpdateError};
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::CommandGateway;
use crate::lifecycle::{LifecycleAction, LifecycleController, LifecycleError};
use crate::protections::ProtectionManager;
use crate::scheduler::{self, CycleReport, Notice, SchedulerError, SchedulerHandle, SchedulerState};
use crate::settings::PanelSettings;
use crate::transport::{CommandTransport, HttpTransport};
use crate::types::{BacktestConfig, BacktestResult, BotStatus, EquityRange};

pub struct Panel {
    gateway: Arc<CommandGateway>,
    cache: ModelCache,
    scheduler: SchedulerHandle,
    lifecycle: LifecycleController,
    protections: ProtectionManager,
    default_range: EquityRange,
    /// Serializes config read-modify-write
    config_turn: Mutex<()>,
}

impl Panel {
    /// Connect to the engine over HTTP
    pub fn connect(settings: &PanelSettings) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(
            &settings.engine_url,
            settings.api_token.clone(),
            settings.request_timeout,
        )?;
        info!("Engine endpoint: {}", settings.engine_url);
        Ok(Self::with_transport(Arc::new(transport), settings))
    }

    /// Build on any transport; spawns the polling scheduler
    pub fn with_transport(transport: Arc<dyn CommandTransport>, settings: &PanelSettings) -> Self {
        let gateway = Arc::new(CommandGateway::new(transport).with_timeout(settings.request_timeout));
        let cache = ModelCache::new();
        let scheduler = scheduler::spawn(gateway.clone(), cache.clone(), settings.polling.clone());

        Self {
            lifecycle: LifecycleController::new(gateway.clone(), cache.clone()),
            protections: ProtectionManager::new(gateway.clone())
                .with_max_age(settings.protections_max_age),
            default_range: settings.polling.equity_range,
            config_turn: Mutex::new(()),
            gateway,
            cache,
            scheduler,
        }
    }

    /// One-time initial load. Each failure is logged and returned; the
    /// rest of the load still happens.
    pub async fn bootstrap(&self) -> Vec<GatewayError> {
        info!("Loading initial engine state...");
        let range = self.equity_range();

        let (status, config, trades, stats, equity) = tokio::join!(
            self.gateway.get_status(),
            self.gateway.get_config(),
            self.gateway.get_open_trades(),
            self.gateway.get_dashboard_stats(),
            self.gateway.get_equity_curve(range)
        );

        let mut failures = Vec::new();
        match status {
            Ok(status) => {
                self.cache.apply_status(status);
            }
            Err(e) => failures.push(e),
        }
        match config {
            Ok(config) => {
                self.cache.apply_config(config);
            }
            Err(e) => failures.push(e),
        }
        match trades {
            Ok(trades) => self.cache.apply_trades(trades),
            Err(e) => failures.push(e),
        }
        match stats {
            Ok(stats) => self.cache.apply_stats(stats),
            Err(e) => failures.push(e),
        }
        match equity {
            Ok(points) => self.cache.apply_equity(range, points),
            Err(e) => failures.push(e),
        }

        for e in &failures {
            warn!("Initial load: {}", e);
        }
        info!(
            "Initial load complete ({} of 5 parts failed), bot {}",
            failures.len(),
            self.cache.status()
        );
        failures
    }

    pub fn snapshot(&self) -> Snapshot {
        self.cache.snapshot()
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    pub fn status(&self) -> BotStatus {
        self.cache.status()
    }

    // --- Sync ---

    /// Full sync cycle now, sharing one already in flight
    pub async fn refresh(&self) -> Result<CycleReport, SchedulerError> {
        self.scheduler.refresh().await
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn subscribe_scheduler(&self) -> watch::Receiver<SchedulerState> {
        self.scheduler.subscribe_state()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.scheduler.subscribe_notices()
    }

    // --- Lifecycle ---

    pub async fn start(&self) -> Result<BotStatus, LifecycleError> {
        self.lifecycle.start().await
    }

    pub async fn stop(&self) -> Result<BotStatus, LifecycleError> {
        self.lifecycle.stop().await
    }

    pub async fn pending_action(&self) -> Option<LifecycleAction> {
        self.lifecycle.pending().await
    }

    // --- Trades and equity ---

    /// Load the equity curve for `range`; later polls keep that range
    pub async fn load_equity(&self, range: EquityRange) -> GatewayResult<()> {
        let points = self.gateway.get_equity_curve(range).await?;
        self.cache.apply_equity(range, points);
        Ok(())
    }

    pub async fn load_open_trades(&self) -> GatewayResult<usize> {
        let trades = self.gateway.get_open_trades().await?;
        let count = trades.len();
        self.cache.apply_trades(trades);
        Ok(count)
    }

    pub async fn load_stats(&self) -> GatewayResult<()> {
        let stats = self.gateway.get_dashboard_stats().await?;
        self.cache.apply_stats(stats);
        Ok(())
    }

    pub async fn load_trade_history(&self) -> GatewayResult<usize> {
        let trades = self.gateway.get_all_trades().await?;
        let count = trades.len();
        self.cache.apply_trade_history(trades);
        Ok(count)
    }

    fn equity_range(&self) -> EquityRange {
        self.cache.equity_range().unwrap_or(self.default_range)
    }

    // --- Configuration ---

    pub async fn reload_config(&self) -> GatewayResult<Arc<AppConfig>> {
        let config = self.gateway.get_config().await?;
        Ok(self.cache.apply_config(config))
    }

    /// Merge `patch` into the engine's current config and push the result.
    ///
    /// The cached config is taken from a fetch after the update, never from
    /// the locally merged document.
    pub async fn update_config(&self, patch: &ConfigPatch) -> Result<Arc<AppConfig>, ConfigUpdateError> {
        if patch.is_empty() {
            return Err(ConfigUpdateError::InvalidPatch("patch is empty".to_string()));
        }
        let _turn = self.config_turn.lock().await;

        let current = self.gateway.get_config().await?;
        let updated = patch.apply_to(&current)?;
        self.gateway.update_config(&updated).await?;
        debug!("Config update accepted, refetching");

        let confirmed = self.gateway.get_config().await?;
        info!("Engine config updated");
        Ok(self.cache.apply_config(confirmed))
    }

    // --- Protections and backtest ---

    pub fn protections(&self) -> &ProtectionManager {
        &self.protections
    }

    pub async fn run_backtest(&self, config: &BacktestConfig) -> GatewayResult<BacktestResult> {
        info!("Running backtest of {} on {}", config.strategy, config.pair);
        self.gateway.run_backtest(config).await
    }

    /// Stop polling and wait for the scheduler loop to exit
    pub async fn shutdown(self) {
        info!("Shutting down panel sync");
        self.scheduler.shutdown().await;
    }
}
