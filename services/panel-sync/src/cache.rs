//! Domain Model Cache
//!
//! Latest known engine state, one slice per concern. Each slice lives in
//! its own watch channel so a replacement is a single atomic step and no
//! reader can observe half of an update. Slices are replaced whole, never
//! merged.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::types::{BotStatus, DashboardStats, EquityCurve, EquityPoint, EquityRange, Trade};

/// Immutable view over every slice at the time of the call
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub status: BotStatus,
    /// Open trades from the last poll
    pub trades: Arc<Vec<Trade>>,
    /// Full trade listing, loaded on demand
    pub trade_history: Arc<Vec<Trade>>,
    pub stats: Option<Arc<DashboardStats>>,
    pub equity: Arc<EquityCurve>,
    pub config: Option<Arc<AppConfig>>,
    /// Time of the most recent slice replacement
    pub updated_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// Trades that have not been closed yet
    pub fn active_trades(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter().filter(|trade| trade.is_active())
    }
}

struct Slices {
    status: watch::Sender<BotStatus>,
    trades: watch::Sender<Arc<Vec<Trade>>>,
    trade_history: watch::Sender<Arc<Vec<Trade>>>,
    stats: watch::Sender<Option<Arc<DashboardStats>>>,
    equity: watch::Sender<Arc<EquityCurve>>,
    config: watch::Sender<Option<Arc<AppConfig>>>,
    revision: watch::Sender<u64>,
    updated_at: watch::Sender<Option<DateTime<Utc>>>,
}

/// Shared handle to the cache; clones see the same slices
#[derive(Clone)]
pub struct ModelCache {
    slices: Arc<Slices>,
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelCache {
    pub fn new() -> Self {
        Self {
            slices: Arc::new(Slices {
                status: watch::channel(BotStatus::default()).0,
                trades: watch::channel(Arc::new(Vec::new())).0,
                trade_history: watch::channel(Arc::new(Vec::new())).0,
                stats: watch::channel(None).0,
                equity: watch::channel(Arc::new(EquityCurve::default())).0,
                config: watch::channel(None).0,
                revision: watch::channel(0).0,
                updated_at: watch::channel(None).0,
            }),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let s = &self.slices;
        Snapshot {
            status: *s.status.borrow(),
            trades: s.trades.borrow().clone(),
            trade_history: s.trade_history.borrow().clone(),
            stats: s.stats.borrow().clone(),
            equity: s.equity.borrow().clone(),
            config: s.config.borrow().clone(),
            updated_at: *s.updated_at.borrow(),
        }
    }

    pub fn status(&self) -> BotStatus {
        *self.slices.status.borrow()
    }

    /// Range of the cached equity curve, if one was loaded
    pub fn equity_range(&self) -> Option<EquityRange> {
        self.slices.equity.borrow().range
    }

    /// Replace the status; subscribers are only woken on an actual change.
    ///
    /// Returns the previous status.
    pub fn apply_status(&self, status: BotStatus) -> BotStatus {
        let mut previous = status;
        self.slices.status.send_if_modified(|current| {
            previous = *current;
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if previous != status {
            info!("Bot status {} -> {}", previous, status);
        }
        self.touch();
        previous
    }

    pub fn apply_trades(&self, trades: Vec<Trade>) {
        debug!("Applying {} open trades", trades.len());
        self.slices.trades.send_replace(Arc::new(trades));
        self.touch();
    }

    pub fn apply_trade_history(&self, trades: Vec<Trade>) {
        debug!("Applying trade history of {} trades", trades.len());
        self.slices.trade_history.send_replace(Arc::new(trades));
        self.touch();
    }

    pub fn apply_stats(&self, stats: DashboardStats) {
        self.slices.stats.send_replace(Some(Arc::new(stats)));
        self.touch();
    }

    /// Replace the equity curve; points from a previous range are dropped
    pub fn apply_equity(&self, range: EquityRange, points: Vec<EquityPoint>) {
        debug!("Applying {} equity points for {}", points.len(), range);
        self.slices.equity.send_replace(Arc::new(EquityCurve {
            range: Some(range),
            points,
        }));
        self.touch();
    }

    pub fn apply_config(&self, config: AppConfig) -> Arc<AppConfig> {
        let config = Arc::new(config);
        self.slices.config.send_replace(Some(config.clone()));
        self.touch();
        config
    }

    pub fn subscribe_status(&self) -> watch::Receiver<BotStatus> {
        self.slices.status.subscribe()
    }

    pub fn subscribe_trades(&self) -> watch::Receiver<Arc<Vec<Trade>>> {
        self.slices.trades.subscribe()
    }

    pub fn subscribe_config(&self) -> watch::Receiver<Option<Arc<AppConfig>>> {
        self.slices.config.subscribe()
    }

    /// Ticks on every slice replacement, for re-rendering on any change
    pub fn subscribe_revision(&self) -> watch::Receiver<u64> {
        self.slices.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.slices.revision.borrow()
    }

    fn touch(&self) {
        self.slices.updated_at.send_replace(Some(Utc::now()));
        self.slices.revision.send_modify(|revision| *revision += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn trade(pair: &str, closed: bool) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            pair: pair.to_string(),
            is_open: !closed,
            exchange: "binance".to_string(),
            open_rate: Decimal::from(100),
            open_date: Utc::now(),
            close_rate: closed.then(|| Decimal::from(110)),
            close_date: closed.then(Utc::now),
            amount: Decimal::ONE,
            stake_amount: Decimal::from(100),
            strategy: "SimpleStrategy".to_string(),
            timeframe: crate::types::Timeframe::OneHour,
            stop_loss: None,
            take_profit: None,
            exit_reason: None,
            profit_abs: None,
            profit_ratio: None,
        }
    }

    #[test]
    fn test_trades_are_replaced_not_merged() {
        let cache = ModelCache::new();
        let first = vec![trade("BTCUSDT", false), trade("ETHUSDT", false)];
        let second = vec![trade("SOLUSDT", false)];

        cache.apply_trades(first);
        cache.apply_trades(second.clone());
        assert_eq!(*cache.snapshot().trades, second);

        cache.apply_trades(Vec::new());
        assert!(cache.snapshot().trades.is_empty());
    }

    #[test]
    fn test_active_view_excludes_closed_trades() {
        let cache = ModelCache::new();
        cache.apply_trades(vec![trade("BTCUSDT", false), trade("ETHUSDT", true)]);

        let snapshot = cache.snapshot();
        let active: Vec<_> = snapshot.active_trades().map(|t| t.pair.as_str()).collect();
        assert_eq!(active, vec!["BTCUSDT"]);
    }

    #[test]
    fn test_equity_range_replaces_sequence() {
        let cache = ModelCache::new();
        let point = |time: &str, value: f64| EquityPoint {
            time: time.to_string(),
            value,
        };

        cache.apply_equity(EquityRange::OneDay, vec![point("10:00", 1.0), point("11:00", 2.0)]);
        cache.apply_equity(EquityRange::OneWeek, vec![point("Mon", 3.0)]);

        let equity = cache.snapshot().equity;
        assert_eq!(equity.range, Some(EquityRange::OneWeek));
        assert_eq!(equity.points, vec![point("Mon", 3.0)]);
    }

    #[test]
    fn test_status_notifies_only_on_change() {
        let cache = ModelCache::new();
        let mut rx = cache.subscribe_status();

        assert_eq!(cache.apply_status(BotStatus::Stopped), BotStatus::Stopped);
        assert!(!rx.has_changed().unwrap());

        assert_eq!(cache.apply_status(BotStatus::Running), BotStatus::Stopped);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), BotStatus::Running);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_updates() {
        let cache = ModelCache::new();
        cache.apply_trades(vec![trade("BTCUSDT", false)]);
        let before = cache.snapshot();
        let revision = cache.revision();

        cache.apply_trades(vec![]);
        assert_eq!(before.trades.len(), 1);
        assert_eq!(cache.revision(), revision + 1);
    }
}
