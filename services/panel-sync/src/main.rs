//! Panel Sync - control panel companion for a trading engine
//!
//! `watch` keeps a live model of the engine in sync:
//! 1. Loads status, config, trades, stats and equity once
//! 2. Polls status and dashboard data while the bot is active
//! 3. Logs state changes and sync notices until Ctrl-C
//!
//! The other subcommands run a single operation and print the result.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use panel_sync::{
    BacktestConfig, ConfigPatch, EquityRange, Panel, PanelSettings, ProtectionKind,
    ProtectionParams, StopStatus, Timeframe,
};

#[derive(Parser, Debug)]
#[command(name = "panel-sync", about = "Sync and control a trading engine", version)]
struct Cli {
    /// Settings file (TOML, JSON or YAML); PANEL_* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep the local model in sync and log changes until Ctrl-C
    Watch,
    /// Show bot status and dashboard summary
    Status,
    /// Start the bot
    Start,
    /// Stop the bot
    Stop,
    /// List trades
    Trades {
        /// Include closed trades
        #[arg(long)]
        all: bool,
    },
    /// Dashboard statistics
    Stats,
    /// Equity curve
    Equity {
        #[arg(long, default_value = "1d")]
        range: EquityRange,
    },
    /// Engine configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Protection rules
    #[command(subcommand)]
    Protections(ProtectionsCommand),
    /// Check for a global trading stop
    GlobalStop,
    /// Check for a trading stop on one pair
    PairStop { pair: String },
    /// Run a backtest on the engine
    Backtest {
        #[arg(long)]
        strategy: String,
        #[arg(long)]
        pair: String,
        #[arg(long, default_value = "1h")]
        timeframe: Timeframe,
        /// e.g. 20240101-20240301
        #[arg(long)]
        timerange: Option<String>,
        #[arg(long)]
        stake_amount: Option<rust_decimal::Decimal>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Show,
    /// Set one field, e.g. `config set bot.max_open_trades 5`
    Set {
        key: String,
        /// JSON value; bare words are taken as strings
        value: String,
    },
}

#[derive(Subcommand, Debug)]
enum ProtectionsCommand {
    List,
    /// Add a rule, e.g. `protections add cooldown --set lookback_period=60`
    Add {
        kind: ProtectionKind,
        #[arg(long = "set", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Remove a rule by engine name or kind
    Remove { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = PanelSettings::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_max_level(settings.log_level)
        .with_writer(std::io::stderr)
        .init();

    let panel = Panel::connect(&settings)?;
    let outcome = run(&panel, cli.command).await;
    panel.shutdown().await;
    outcome
}

async fn run(panel: &Panel, command: Command) -> Result<()> {
    match command {
        Command::Watch => watch(panel).await,
        Command::Status => {
            let report = panel.refresh().await?;
            for e in &report.errors {
                warn!("{}", e);
            }
            let snapshot = panel.snapshot();
            println!("status:      {}", snapshot.status);
            println!("open trades: {}", snapshot.active_trades().count());
            if let Some(stats) = &snapshot.stats {
                println!("profit:      {:.2}", stats.total_profit);
                println!("win rate:    {:.1}%", stats.win_rate * 100.0);
                println!("balance:     {:.2}", stats.total_balance);
            }
            Ok(())
        }
        Command::Start => {
            let status = panel.start().await?;
            println!("bot {}", status);
            Ok(())
        }
        Command::Stop => {
            let status = panel.stop().await?;
            println!("bot {}", status);
            Ok(())
        }
        Command::Trades { all } => {
            if all {
                panel.load_trade_history().await?;
                print_json(&*panel.snapshot().trade_history)
            } else {
                panel.load_open_trades().await?;
                print_json(&*panel.snapshot().trades)
            }
        }
        Command::Stats => {
            panel.load_stats().await?;
            print_json(&panel.snapshot().stats.as_deref())
        }
        Command::Equity { range } => {
            panel.load_equity(range).await?;
            print_json(&*panel.snapshot().equity)
        }
        Command::Config(ConfigCommand::Show) => {
            let config = panel.reload_config().await?;
            println!("{:#?}", config);
            Ok(())
        }
        Command::Config(ConfigCommand::Set { key, value }) => {
            let (section, field) = key
                .split_once('.')
                .with_context(|| format!("expected <section>.<key>, got {:?}", key))?;
            let patch = ConfigPatch::new().set(section, field, parse_value(&value));
            panel.update_config(&patch).await?;
            println!("{} updated", key);
            Ok(())
        }
        Command::Protections(ProtectionsCommand::List) => {
            let entries = panel.protections().refresh().await?;
            if entries.is_empty() {
                println!("no active protections");
            }
            for entry in entries.iter() {
                let scope = entry
                    .scope()
                    .map(|scope| format!("{:?}", scope).to_lowercase())
                    .unwrap_or_else(|| "unknown".to_string());
                println!("{:<24} {}", entry.name, scope);
            }
            Ok(())
        }
        Command::Protections(ProtectionsCommand::Add { kind, params }) => {
            let mut parsed = ProtectionParams::new();
            for param in &params {
                let (key, value) = param
                    .split_once('=')
                    .with_context(|| format!("expected KEY=VALUE, got {:?}", param))?;
                parsed = parsed.with(key, parse_value(value));
            }
            panel.protections().add(kind, &parsed).await?;
            println!("added {} ({})", kind, kind.engine_name());
            Ok(())
        }
        Command::Protections(ProtectionsCommand::Remove { name }) => {
            if panel.protections().remove(&name).await? {
                println!("removed {}", name);
            } else {
                println!("{} was not active", name);
            }
            Ok(())
        }
        Command::GlobalStop => {
            print_stop("global", &panel.protections().check_global_stop().await?);
            Ok(())
        }
        Command::PairStop { pair } => {
            print_stop(&pair, &panel.protections().check_pair_stop(&pair).await?);
            Ok(())
        }
        Command::Backtest {
            strategy,
            pair,
            timeframe,
            timerange,
            stake_amount,
        } => {
            let config = BacktestConfig {
                strategy,
                pair,
                timeframe,
                timerange,
                stake_amount,
            };
            print_json(&panel.run_backtest(&config).await?)
        }
    }
}

async fn watch(panel: &Panel) -> Result<()> {
    let failures = panel.bootstrap().await;
    if failures.len() == 5 {
        warn!("Engine not reachable yet, will keep polling");
    }

    let mut notices = panel.subscribe_notices();
    let mut status = panel.cache().subscribe_status();
    let mut trades = panel.cache().subscribe_trades();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!("Watching engine, bot {} (Ctrl-C to exit)", panel.status());
    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(e) = signal {
                    bail!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Ctrl-C received");
                break;
            }
            notice = notices.recv() => match notice {
                Ok(notice) => warn!("{}", notice),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} notices", skipped),
                Err(RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                info!("Bot is {}", current);
            }
            changed = trades.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = panel.snapshot();
                let open = snapshot.active_trades().count();
                match &snapshot.stats {
                    Some(stats) => info!(
                        "{} open trades, profit {:.2}, balance {:.2}",
                        open, stats.total_profit, stats.total_balance
                    ),
                    None => info!("{} open trades", open),
                }
            }
        }
    }
    Ok(())
}

/// JSON if it parses, otherwise the raw text as a string
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_stop(scope: &str, status: &StopStatus) {
    match status {
        StopStatus::Clear => println!("{}: no stop", scope),
        StopStatus::Active(stop) => println!(
            "{}: stopped by {} until {} ({})",
            scope, stop.protection, stop.until, stop.reason
        ),
    }
}
