//! Polling Scheduler
//!
//! Periodic status and dashboard sync against the engine. A single task
//! owns the timers and the one in-flight slot; cycles run on their own
//! detached tasks and the loop applies their results to the cache when
//! they complete. Timers follow the cached bot status: Running arms both,
//! Paused arms status only, Stopped and Error suspend polling entirely.

use chrono::{DateTime, Utc};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::ModelCache;
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::CommandGateway;
use crate::types::{BotStatus, DashboardStats, EquityPoint, EquityRange, Trade};

const REQUEST_QUEUE: usize = 16;
const NOTICE_BUFFER: usize = 32;

/// Observable scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No timer armed and nothing in flight
    Idle,
    Scheduled,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// Status only
    Status,
    /// Status, then trades, stats and equity when running
    Dashboard,
}

impl std::fmt::Display for CycleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleKind::Status => write!(f, "status"),
            CycleKind::Dashboard => write!(f, "dashboard"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub status_interval: Duration,
    pub dashboard_interval: Duration,
    /// Equity range used until one has been loaded into the cache
    pub equity_range: EquityRange,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(5),
            dashboard_interval: Duration::from_secs(30),
            equity_range: EquityRange::OneDay,
        }
    }
}

/// A sync failure worth showing to the user
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub error: GatewayError,
    pub at: DateTime<Utc>,
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.at.format("%H:%M:%S"), self.error)
    }
}

/// What a completed cycle did
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub kind: CycleKind,
    /// Status fetched by the cycle, if the fetch succeeded
    pub status: Option<BotStatus>,
    pub errors: Vec<GatewayError>,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        self.status.is_some() && self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("polling scheduler was torn down")]
    TornDown,
}

type RefreshReply = oneshot::Sender<Result<CycleReport, SchedulerError>>;

/// Owner side of a running scheduler; dropping it tears the scheduler down
pub struct SchedulerHandle {
    requests: mpsc::Sender<RefreshReply>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<SchedulerState>,
    notices: broadcast::Sender<Notice>,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Run a full cycle now, or wait for the one already in flight
    pub async fn refresh(&self) -> Result<CycleReport, SchedulerError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(reply)
            .await
            .map_err(|_| SchedulerError::TornDown)?;
        response.await.map_err(|_| SchedulerError::TornDown)?
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Cancel timers and stop the loop without waiting for in-flight calls
    pub fn teardown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Tear down and wait for the loop task to exit
    pub async fn shutdown(mut self) {
        self.teardown();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Scheduler task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Start the scheduler loop on the current runtime
pub fn spawn(gateway: Arc<CommandGateway>, cache: ModelCache, config: PollingConfig) -> SchedulerHandle {
    let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
    let (notices_tx, _) = broadcast::channel(NOTICE_BUFFER);

    let scheduler = Scheduler {
        gateway,
        cache,
        config,
        state: state_tx,
        notices: notices_tx.clone(),
        status_timer: None,
        dashboard_timer: None,
        in_flight: None,
        dashboard_queued: false,
        reported: Vec::new(),
    };
    let task = tokio::spawn(scheduler.run(requests_rx, shutdown_rx));

    SchedulerHandle {
        requests: requests_tx,
        shutdown: shutdown_tx,
        state: state_rx,
        notices: notices_tx,
        task: Some(task),
    }
}

struct InFlight {
    kind: CycleKind,
    task: JoinHandle<CycleOutcome>,
    waiters: Vec<RefreshReply>,
}

/// Raw results of one cycle, applied by the loop on completion
struct CycleOutcome {
    kind: CycleKind,
    status: GatewayResult<BotStatus>,
    trades: Option<GatewayResult<Vec<Trade>>>,
    stats: Option<GatewayResult<DashboardStats>>,
    equity: Option<(EquityRange, GatewayResult<Vec<EquityPoint>>)>,
}

struct Scheduler {
    gateway: Arc<CommandGateway>,
    cache: ModelCache,
    config: PollingConfig,
    state: watch::Sender<SchedulerState>,
    notices: broadcast::Sender<Notice>,
    status_timer: Option<Interval>,
    dashboard_timer: Option<Interval>,
    in_flight: Option<InFlight>,
    /// Dashboard tick that landed during a status cycle
    dashboard_queued: bool,
    /// Failures already published since the last clean cycle
    reported: Vec<GatewayError>,
}

impl Scheduler {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<RefreshReply>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut status_rx = self.cache.subscribe_status();
        let initial = *status_rx.borrow_and_update();
        info!("Polling scheduler started (bot {})", initial);
        self.arm(initial);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                joined = join_cycle(&mut self.in_flight) => self.complete(joined),

                request = requests.recv() => match request {
                    Some(reply) => self.refresh(reply),
                    None => break,
                },

                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *status_rx.borrow_and_update();
                    self.arm(status);
                }

                _ = tick(&mut self.dashboard_timer) => self.on_tick(CycleKind::Dashboard),

                _ = tick(&mut self.status_timer) => self.on_tick(CycleKind::Status),
            }
        }

        self.teardown(requests);
    }

    /// Arm or cancel timers for the given bot status
    fn arm(&mut self, status: BotStatus) {
        let (status_wanted, dashboard_wanted) = match status {
            BotStatus::Running => (true, true),
            BotStatus::Paused => (true, false),
            BotStatus::Stopped | BotStatus::Error => (false, false),
        };

        if set_timer(&mut self.status_timer, status_wanted, self.config.status_interval) {
            info!(
                "Status polling {} (bot {})",
                if status_wanted { "armed" } else { "suspended" },
                status
            );
        }
        if set_timer(
            &mut self.dashboard_timer,
            dashboard_wanted,
            self.config.dashboard_interval,
        ) {
            info!(
                "Dashboard polling {} (bot {})",
                if dashboard_wanted { "armed" } else { "suspended" },
                status
            );
        }
        self.publish();
    }

    fn on_tick(&mut self, kind: CycleKind) {
        if let Some(flight) = &self.in_flight {
            if kind == CycleKind::Dashboard && flight.kind == CycleKind::Status {
                debug!("Dashboard tick queued behind status cycle");
                self.dashboard_queued = true;
            } else {
                debug!("{} tick dropped, {} cycle still in flight", kind, flight.kind);
            }
            return;
        }
        self.launch(kind, Vec::new());
    }

    fn refresh(&mut self, reply: RefreshReply) {
        match &mut self.in_flight {
            Some(flight) => {
                debug!("Manual refresh joins in-flight {} cycle", flight.kind);
                flight.waiters.push(reply);
            }
            None => {
                debug!("Manual refresh");
                self.launch(CycleKind::Dashboard, vec![reply]);
            }
        }
    }

    fn launch(&mut self, kind: CycleKind, waiters: Vec<RefreshReply>) {
        let range = self.cache.equity_range().unwrap_or(self.config.equity_range);
        let task = tokio::spawn(run_cycle(self.gateway.clone(), kind, range));
        self.in_flight = Some(InFlight {
            kind,
            task,
            waiters,
        });
        self.publish();
    }

    fn complete(&mut self, joined: Result<CycleOutcome, JoinError>) {
        let Some(flight) = self.in_flight.take() else {
            return;
        };

        let report = match joined {
            Ok(outcome) => self.apply(outcome),
            Err(e) => {
                error!("{} cycle task failed: {}", flight.kind, e);
                CycleReport {
                    kind: flight.kind,
                    status: None,
                    errors: Vec::new(),
                }
            }
        };

        // Next tick counts from completion; a dashboard cycle also fetched status
        if let Some(timer) = &mut self.status_timer {
            timer.reset();
        }
        if flight.kind == CycleKind::Dashboard {
            if let Some(timer) = &mut self.dashboard_timer {
                timer.reset();
            }
        }

        for waiter in flight.waiters {
            let _ = waiter.send(Ok(report.clone()));
        }

        let queued = std::mem::take(&mut self.dashboard_queued);
        if queued && self.dashboard_timer.is_some() && report.status == Some(BotStatus::Running) {
            self.launch(CycleKind::Dashboard, Vec::new());
        } else {
            self.publish();
        }
    }

    fn apply(&mut self, outcome: CycleOutcome) -> CycleReport {
        let mut errors = Vec::new();

        let status = match outcome.status {
            Ok(status) => {
                self.cache.apply_status(status);
                Some(status)
            }
            Err(e) => {
                errors.push(e);
                None
            }
        };
        match outcome.trades {
            Some(Ok(trades)) => self.cache.apply_trades(trades),
            Some(Err(e)) => errors.push(e),
            None => {}
        }
        match outcome.stats {
            Some(Ok(stats)) => self.cache.apply_stats(stats),
            Some(Err(e)) => errors.push(e),
            None => {}
        }
        match outcome.equity {
            Some((range, Ok(points))) => self.cache.apply_equity(range, points),
            Some((_, Err(e))) => errors.push(e),
            None => {}
        }

        self.report_errors(&errors);
        CycleReport {
            kind: outcome.kind,
            status,
            errors,
        }
    }

    /// Unavailable is left to the next poll; everything else becomes a
    /// notice, once per distinct failure until a clean cycle.
    fn report_errors(&mut self, errors: &[GatewayError]) {
        if errors.is_empty() {
            if !self.reported.is_empty() {
                info!("Engine sync recovered");
                self.reported.clear();
            }
            return;
        }

        for e in errors {
            if e.is_unavailable() {
                warn!("Poll failed, retrying on next tick: {}", e);
                continue;
            }
            if self.reported.contains(e) {
                debug!("Suppressing repeated notice: {}", e);
                continue;
            }
            error!("{}", e);
            self.reported.push(e.clone());
            let _ = self.notices.send(Notice {
                error: e.clone(),
                at: Utc::now(),
            });
        }
    }

    fn publish(&self) {
        let state = if self.in_flight.is_some() {
            SchedulerState::InFlight
        } else if self.status_timer.is_some() || self.dashboard_timer.is_some() {
            SchedulerState::Scheduled
        } else {
            SchedulerState::Idle
        };
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn teardown(mut self, mut requests: mpsc::Receiver<RefreshReply>) {
        self.status_timer = None;
        self.dashboard_timer = None;
        self.dashboard_queued = false;

        // The cycle task is detached, not awaited; its result is dropped
        if let Some(flight) = self.in_flight.take() {
            debug!("Discarding in-flight {} cycle", flight.kind);
            for waiter in flight.waiters {
                let _ = waiter.send(Err(SchedulerError::TornDown));
            }
        }

        requests.close();
        while let Ok(reply) = requests.try_recv() {
            let _ = reply.send(Err(SchedulerError::TornDown));
        }

        self.publish();
        info!("Polling scheduler stopped");
    }
}

async fn run_cycle(gateway: Arc<CommandGateway>, kind: CycleKind, range: EquityRange) -> CycleOutcome {
    let status = gateway.get_status().await;
    let mut outcome = CycleOutcome {
        kind,
        status,
        trades: None,
        stats: None,
        equity: None,
    };

    if kind == CycleKind::Dashboard && matches!(outcome.status, Ok(BotStatus::Running)) {
        let (trades, stats, equity) = tokio::join!(
            gateway.get_open_trades(),
            gateway.get_dashboard_stats(),
            gateway.get_equity_curve(range)
        );
        outcome.trades = Some(trades);
        outcome.stats = Some(stats);
        outcome.equity = Some((range, equity));
    }
    outcome
}

/// Returns true when the timer changed between armed and disarmed
fn set_timer(timer: &mut Option<Interval>, wanted: bool, period: Duration) -> bool {
    match (timer.is_some(), wanted) {
        (false, true) => {
            let mut armed = interval_at(Instant::now() + period, period);
            armed.set_missed_tick_behavior(MissedTickBehavior::Skip);
            *timer = Some(armed);
            true
        }
        (true, false) => {
            *timer = None;
            true
        }
        _ => false,
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending().await,
    }
}

async fn join_cycle(in_flight: &mut Option<InFlight>) -> Result<CycleOutcome, JoinError> {
    match in_flight {
        Some(flight) => (&mut flight.task).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::commands;
    use crate::testing::StubTransport;
    use crate::transport::TransportError;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::sleep;

    fn start(stub: &Arc<StubTransport>, cache: &ModelCache) -> SchedulerHandle {
        spawn(
            Arc::new(CommandGateway::new(stub.clone())),
            cache.clone(),
            PollingConfig::default(),
        )
    }

    async fn wait_for_call(stub: &StubTransport, command: &str, count: usize) {
        while stub.calls(command) < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_bot_is_idle() {
        let stub = Arc::new(StubTransport::new());
        let cache = ModelCache::new();
        let handle = start(&stub, &cache);

        sleep(Duration::from_secs(120)).await;
        assert_eq!(handle.state(), SchedulerState::Idle);
        assert_eq!(stub.calls(commands::GET_BOT_STATUS), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_during_in_flight_cycle_is_dropped() {
        let stub = Arc::new(StubTransport::new());
        stub.reply(commands::GET_BOT_STATUS, Ok(json!("paused")));
        stub.delay(commands::GET_BOT_STATUS, Duration::from_secs(8));
        let cache = ModelCache::new();
        cache.apply_status(BotStatus::Paused);
        let handle = start(&stub, &cache);

        // First cycle starts at 5s and runs until 13s; the 10s tick is dropped
        sleep(Duration::from_secs(12)).await;
        assert_eq!(stub.calls(commands::GET_BOT_STATUS), 1);
        assert_eq!(handle.state(), SchedulerState::InFlight);

        // Re-armed from completion: next cycle at 18s
        sleep(Duration::from_secs(5)).await;
        assert_eq!(stub.calls(commands::GET_BOT_STATUS), 1);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(stub.calls(commands::GET_BOT_STATUS), 2);
        assert_eq!(stub.calls(commands::GET_OPEN_TRADES), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_refresh_joins_in_flight_cycle() {
        let stub = Arc::new(StubTransport::new());
        stub.hold(commands::GET_BOT_STATUS);
        stub.reply(commands::GET_BOT_STATUS, Ok(json!("stopped")));
        let cache = ModelCache::new();
        let handle = Arc::new(start(&stub, &cache));

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.refresh().await }
        });
        wait_for_call(&stub, commands::GET_BOT_STATUS, 1).await;
        let second = tokio::spawn({
            let handle = handle.clone();
            async move { handle.refresh().await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.state(), SchedulerState::InFlight);

        stub.release(commands::GET_BOT_STATUS);
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(first.status, Some(BotStatus::Stopped));
        assert_eq!(stub.calls(commands::GET_BOT_STATUS), 1);
        assert_eq!(handle.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_fails_pending_refresh() {
        let stub = Arc::new(StubTransport::new());
        stub.hold(commands::GET_BOT_STATUS);
        let cache = ModelCache::new();
        let handle = Arc::new(start(&stub, &cache));

        let waiting = tokio::spawn({
            let handle = handle.clone();
            async move { handle.refresh().await }
        });
        wait_for_call(&stub, commands::GET_BOT_STATUS, 1).await;

        handle.teardown();
        assert_eq!(waiting.await.unwrap(), Err(SchedulerError::TornDown));
        assert_eq!(handle.refresh().await, Err(SchedulerError::TornDown));
        assert_eq!(handle.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_are_noticed_once_until_recovery() {
        let stub = Arc::new(StubTransport::new());
        stub.reply(
            commands::GET_BOT_STATUS,
            Err(TransportError::Rejected("not authorized".to_string())),
        );
        let cache = ModelCache::new();
        cache.apply_status(BotStatus::Paused);
        let handle = start(&stub, &cache);
        let mut notices = handle.subscribe_notices();

        sleep(Duration::from_secs(16)).await;
        assert_eq!(stub.calls(commands::GET_BOT_STATUS), 3);
        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.error.reason(), "not authorized");
        assert_eq!(notices.try_recv().unwrap_err(), TryRecvError::Empty);

        stub.reply(commands::GET_BOT_STATUS, Ok(json!("paused")));
        sleep(Duration::from_secs(5)).await;
        stub.reply(
            commands::GET_BOT_STATUS,
            Err(TransportError::Rejected("not authorized".to_string())),
        );
        sleep(Duration::from_secs(5)).await;
        assert!(notices.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_engine_produces_no_notice() {
        let stub = Arc::new(StubTransport::new());
        stub.reply(
            commands::GET_BOT_STATUS,
            Err(TransportError::Unavailable("connection refused".to_string())),
        );
        let cache = ModelCache::new();
        cache.apply_status(BotStatus::Running);
        let handle = start(&stub, &cache);
        let mut notices = handle.subscribe_notices();

        sleep(Duration::from_secs(31)).await;
        assert!(stub.calls(commands::GET_BOT_STATUS) >= 5);
        assert_eq!(notices.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(cache.status(), BotStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dashboard_tick_waits_for_status_cycle() {
        let stub = Arc::new(StubTransport::new());
        stub.reply(commands::GET_BOT_STATUS, Ok(json!("running")));
        stub.delay(commands::GET_BOT_STATUS, Duration::from_secs(3));
        let cache = ModelCache::new();
        cache.apply_status(BotStatus::Running);
        let _handle = start(&stub, &cache);

        // Status cycles run 5-8, 13-16, 21-24 and 29-32, so the 30s
        // dashboard tick lands mid-cycle and runs right after it
        sleep(Duration::from_secs(31)).await;
        assert_eq!(stub.calls(commands::GET_OPEN_TRADES), 0);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(stub.calls(commands::GET_OPEN_TRADES), 1);
        assert_eq!(stub.calls(commands::GET_DASHBOARD_STATS), 1);
    }

    fn stats_json(total_profit: f64) -> serde_json::Value {
        json!({
            "total_profit": total_profit,
            "win_rate": 0.5,
            "open_trades": 1,
            "max_drawdown": 0.1,
            "total_balance": 1000.0
        })
    }

    fn open_trade_json(pair: &str) -> serde_json::Value {
        json!({
            "id": "6f1c2c8e-5d8a-4d43-9d6e-1f1b6f2a9c11",
            "pair": pair,
            "is_open": true,
            "open_rate": "100.0",
            "open_date": "2026-01-02T03:04:05Z",
            "amount": "1.0",
            "stake_amount": "100.0",
            "strategy": "SimpleStrategy",
            "timeframe": "1h"
        })
    }

    #[tokio::test]
    async fn test_malformed_slice_keeps_previous_value_and_siblings_apply() {
        let stub = Arc::new(StubTransport::new());
        stub.reply(commands::GET_BOT_STATUS, Ok(json!("running")));
        stub.reply(commands::GET_EQUITY_CURVE, Ok(json!([])));
        stub.push(commands::GET_OPEN_TRADES, Ok(json!([])));
        stub.reply(commands::GET_OPEN_TRADES, Ok(json!([open_trade_json("ETHUSDT")])));
        stub.push(commands::GET_DASHBOARD_STATS, Ok(stats_json(42.0)));
        stub.reply(commands::GET_DASHBOARD_STATS, Ok(json!({ "total_profit": "lots" })));
        let cache = ModelCache::new();
        let handle = start(&stub, &cache);
        let mut notices = handle.subscribe_notices();

        let first = handle.refresh().await.unwrap();
        assert!(first.is_success());
        assert!(cache.snapshot().trades.is_empty());

        let second = handle.refresh().await.unwrap();
        assert_eq!(second.errors.len(), 1);
        assert!(matches!(
            second.errors[0],
            GatewayError::DecodeError { command: commands::GET_DASHBOARD_STATS, .. }
        ));

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.stats.as_ref().map(|stats| stats.total_profit), Some(42.0));
        assert_eq!(snapshot.trades.len(), 1);
        assert_eq!(snapshot.trades[0].pair, "ETHUSDT");

        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.error.command(), commands::GET_DASHBOARD_STATS);
        assert_eq!(notices.try_recv().unwrap_err(), TryRecvError::Empty);

        // Same failure again is not re-announced
        handle.refresh().await.unwrap();
        assert_eq!(notices.try_recv().unwrap_err(), TryRecvError::Empty);
    }
}
