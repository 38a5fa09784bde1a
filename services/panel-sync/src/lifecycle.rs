//! Bot Lifecycle Controller
//!
//! Start/stop requests are de-duplicated while in flight and serialized
//! per controller. Each action runs on its own task, so it completes and
//! releases the turn even when every caller awaiting it goes away. The
//! cached status is only ever written from an authoritative status fetch,
//! never flipped locally.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::ModelCache;
use crate::error::GatewayError;
use crate::gateway::{commands, CommandGateway};
use crate::types::BotStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleAction {
    Start,
    Stop,
}

impl LifecycleAction {
    /// Status the engine should report once the action took effect
    pub fn target(&self) -> BotStatus {
        match self {
            LifecycleAction::Start => BotStatus::Running,
            LifecycleAction::Stop => BotStatus::Stopped,
        }
    }

    fn command(&self) -> &'static str {
        match self {
            LifecycleAction::Start => commands::START_BOT,
            LifecycleAction::Stop => commands::STOP_BOT,
        }
    }
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleAction::Start => write!(f, "start"),
            LifecycleAction::Stop => write!(f, "stop"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// The engine refused the transition; status is unchanged
    #[error("engine refused to {action} the bot: {reason}")]
    Rejected {
        action: LifecycleAction,
        reason: String,
    },

    #[error("could not {action} the bot: {source}")]
    Failed {
        action: LifecycleAction,
        source: GatewayError,
    },

    /// The command went through but the follow-up status fetch did not
    #[error("{action} was accepted but the bot status could not be confirmed: {source}")]
    Unconfirmed {
        action: LifecycleAction,
        source: GatewayError,
    },
}

impl LifecycleError {
    fn from_command(action: LifecycleAction, source: GatewayError) -> Self {
        match source {
            GatewayError::RemoteRejected { reason, .. } => LifecycleError::Rejected { action, reason },
            source => LifecycleError::Failed { action, source },
        }
    }

    pub fn action(&self) -> LifecycleAction {
        match self {
            LifecycleError::Rejected { action, .. }
            | LifecycleError::Failed { action, .. }
            | LifecycleError::Unconfirmed { action, .. } => *action,
        }
    }

    /// Underlying reason text from the engine or transport
    pub fn reason(&self) -> &str {
        match self {
            LifecycleError::Rejected { reason, .. } => reason,
            LifecycleError::Failed { source, .. } | LifecycleError::Unconfirmed { source, .. } => {
                source.reason()
            }
        }
    }
}

type LifecycleOutcome = Result<BotStatus, LifecycleError>;
type SharedOutcome = Shared<BoxFuture<'static, LifecycleOutcome>>;

struct PendingOp {
    id: u64,
    action: LifecycleAction,
    /// Set by the action task itself, whether or not anyone awaits it
    done: Arc<AtomicBool>,
    outcome: SharedOutcome,
}

impl PendingOp {
    fn is_finished(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Serializes start/stop against the engine
pub struct LifecycleController {
    gateway: Arc<CommandGateway>,
    cache: ModelCache,
    /// Held for the whole command + confirmation of one action
    turn: Arc<Mutex<()>>,
    pending: Mutex<Vec<PendingOp>>,
    next_id: AtomicU64,
}

impl LifecycleController {
    pub fn new(gateway: Arc<CommandGateway>, cache: ModelCache) -> Self {
        Self {
            gateway,
            cache,
            turn: Arc::new(Mutex::new(())),
            pending: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Start the bot and return the status confirmed by the engine
    pub async fn start(&self) -> LifecycleOutcome {
        self.run(LifecycleAction::Start).await
    }

    /// Stop the bot and return the status confirmed by the engine
    pub async fn stop(&self) -> LifecycleOutcome {
        self.run(LifecycleAction::Stop).await
    }

    /// Action currently in flight, for "starting..." style indicators
    pub async fn pending(&self) -> Option<LifecycleAction> {
        self.pending
            .lock()
            .await
            .iter()
            .find(|op| !op.is_finished())
            .map(|op| op.action)
    }

    async fn run(&self, action: LifecycleAction) -> LifecycleOutcome {
        let (owned_id, outcome) = {
            let mut pending = self.pending.lock().await;
            pending.retain(|op| !op.is_finished());

            match pending.iter().find(|op| op.action == action) {
                Some(op) => {
                    debug!("{} already in flight, joining it", action);
                    (None, op.outcome.clone())
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let done = Arc::new(AtomicBool::new(false));
                    let task = tokio::spawn({
                        let gateway = self.gateway.clone();
                        let cache = self.cache.clone();
                        let turn = self.turn.clone();
                        let done = done.clone();
                        async move {
                            let outcome = execute(gateway, cache, turn, action).await;
                            done.store(true, Ordering::Release);
                            outcome
                        }
                    });
                    let outcome = async move {
                        task.await.unwrap_or_else(|e| {
                            error!("{} task ended abnormally: {}", action, e);
                            Err(LifecycleError::Failed {
                                action,
                                source: GatewayError::RemoteUnavailable {
                                    command: action.command(),
                                    reason: format!("{} task ended abnormally", action),
                                },
                            })
                        })
                    }
                    .boxed()
                    .shared();
                    pending.push(PendingOp {
                        id,
                        action,
                        done,
                        outcome: outcome.clone(),
                    });
                    (Some(id), outcome)
                }
            }
        };

        let result = outcome.await;

        if let Some(id) = owned_id {
            self.pending.lock().await.retain(|op| op.id != id);
        }
        result
    }
}

async fn execute(
    gateway: Arc<CommandGateway>,
    cache: ModelCache,
    turn: Arc<Mutex<()>>,
    action: LifecycleAction,
) -> LifecycleOutcome {
    let _turn = turn.lock_owned().await;
    let target = action.target();

    // Already there according to the cache: let the engine confirm before
    // skipping the command.
    if cache.status() == target {
        match gateway.get_status().await {
            Ok(status) if status == target => {
                cache.apply_status(status);
                info!("Bot already {}, {} not sent", status, action);
                return Ok(status);
            }
            Ok(status) => {
                cache.apply_status(status);
            }
            Err(e) => {
                debug!("Status pre-check before {} failed: {}", action, e);
            }
        }
    }

    let message = match action {
        LifecycleAction::Start => gateway.start_bot().await,
        LifecycleAction::Stop => gateway.stop_bot().await,
    }
    .map_err(|source| {
        let err = LifecycleError::from_command(action, source);
        error!("{}", err);
        err
    })?;
    info!("Engine accepted {}: {}", action, message);

    let status = gateway.get_status().await.map_err(|source| {
        let err = LifecycleError::Unconfirmed { action, source };
        warn!("{}", err);
        err
    })?;
    cache.apply_status(status);

    if status != target {
        warn!("Engine reports {} after {}", status, action);
    }
    Ok(status)
}
