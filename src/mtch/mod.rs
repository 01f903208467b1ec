//! Matches and the per-match actor
//!
//! One actor task owns everything mutable about one match: the authoritative
//! engine state, the idempotency table, the turn/disconnect timers and the
//! broadcast channel feeding live subscribers. Operations arrive through a
//! mailbox and run one at a time, so state mutation needs no locks and
//! `state_version` stays gapless.
//!
//! LIFECYCLE
//! - spawned by the matchmaker when a pairing completes
//! - serves moves/snapshots/subscriptions while `active`
//! - on termination, persists the result, broadcasts `game_ended`, then
//!   keeps serving reads for a grace period before the task exits
//! - the registry prunes handles whose actor has exited

mod actor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

use crate::config::ServerConfig;
use crate::engine::AgentId;
use crate::error::ApiError;
use crate::events::{Broadcast, MatchSnapshot, WireEvent};
use crate::store::Store;

pub use actor::MatchActor;

/// Id for a given match (a v7 uuid, but treated as opaque text)
pub type MatchId = String;

/// Why a match ended, as recorded in `match_results.reason`
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EndReason {
    Terminal,
    #[allow(unused)]
    Forfeit,
    TurnTimeout,
    DisconnectTimeout,
    #[allow(unused)]
    IllegalMove,
    InitFailed,
    AdminFinish,
}

/// The exact response returned for a move submission. Cached verbatim under
/// the move id so every retry observes the original bytes.
#[derive(Debug, Clone)]
pub struct MoveResponse {
    /// Http-ish status the adapter should use
    pub status: u16,
    pub body: Value,
}

impl MoveResponse {
    pub fn is_ok(&self) -> bool {
        self.status < 300
    }
}

/// Mailbox protocol for the match actor
pub enum MatchCommand {
    SubmitMove {
        agent_id: AgentId,
        move_id: String,
        expected_version: u64,
        mv: Value,
        reply: oneshot::Sender<MoveResponse>,
    },
    GetState {
        reply: oneshot::Sender<MatchSnapshot>,
    },
    Subscribe {
        agent_id: Option<AgentId>,
        reply: oneshot::Sender<Subscription>,
    },
    PublishThought {
        agent_id: AgentId,
        thought: Value,
    },
    Finish {
        admin_reason: String,
        reply: oneshot::Sender<bool>,
    },
    ConnOpened {
        agent_id: AgentId,
    },
    ConnClosed {
        agent_id: AgentId,
    },
    TurnTimerFired {
        generation: u64,
    },
    DisconnectTimerFired {
        agent_id: AgentId,
        generation: u64,
    },
}

/// Cheap cloneable handle to one match actor
#[derive(Clone)]
pub struct MatchHandle {
    pub match_id: MatchId,
    tx: mpsc::Sender<MatchCommand>,
}

impl MatchHandle {
    pub async fn submit_move(
        &self,
        agent_id: AgentId,
        move_id: String,
        expected_version: u64,
        mv: Value,
    ) -> Result<MoveResponse, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.send(MatchCommand::SubmitMove {
            agent_id,
            move_id,
            expected_version,
            mv,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ApiError::NotFound)
    }

    pub async fn get_state(&self) -> Result<MatchSnapshot, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.send(MatchCommand::GetState { reply }).await?;
        rx.await.map_err(|_| ApiError::NotFound)
    }

    pub async fn subscribe(&self, agent_id: Option<AgentId>) -> Result<Subscription, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.send(MatchCommand::Subscribe { agent_id, reply }).await?;
        rx.await.map_err(|_| ApiError::NotFound)
    }

    pub async fn publish_thought(&self, agent_id: AgentId, thought: Value) -> Result<(), ApiError> {
        self.send(MatchCommand::PublishThought { agent_id, thought })
            .await
    }

    /// Returns whether this call ended the match (false: already over)
    pub async fn finish(&self, admin_reason: String) -> Result<bool, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.send(MatchCommand::Finish { admin_reason, reply }).await?;
        rx.await.map_err(|_| ApiError::NotFound)
    }

    /// Track a live streaming connection for disconnect forfeits. The
    /// returned guard reports the close when dropped.
    pub async fn track_connection(&self, agent_id: AgentId) -> Result<ConnectionGuard, ApiError> {
        self.send(MatchCommand::ConnOpened {
            agent_id: agent_id.clone(),
        })
        .await?;
        Ok(ConnectionGuard {
            agent_id,
            tx: self.tx.clone(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, cmd: MatchCommand) -> Result<(), ApiError> {
        // A closed mailbox means the actor was released after its grace
        self.tx.send(cmd).await.map_err(|_| ApiError::NotFound)
    }
}

/// Notifies the actor when a streaming connection goes away
pub struct ConnectionGuard {
    agent_id: AgentId,
    tx: mpsc::Sender<MatchCommand>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let tx = self.tx.clone();
        let agent_id = self.agent_id.clone();
        tokio::spawn(async move {
            let _ = tx.send(MatchCommand::ConnClosed { agent_id }).await;
        });
    }
}

/// A live, single-pass event stream for one subscriber
///
/// Starts with a `state` snapshot (plus `your_turn`/`game_ended` when they
/// already apply), then relays broadcasts in order. Ends after `game_ended`,
/// or early if this subscriber lags the channel beyond its backlog; a
/// dropped subscriber re-subscribes for a fresh snapshot.
pub struct Subscription {
    initial: std::collections::VecDeque<WireEvent>,
    rx: broadcast::Receiver<Broadcast>,
    agent_id: Option<AgentId>,
    done: bool,
}

impl Subscription {
    pub(crate) fn new(
        initial: Vec<WireEvent>,
        rx: broadcast::Receiver<Broadcast>,
        agent_id: Option<AgentId>,
    ) -> Self {
        let done = matches!(initial.last(), Some(WireEvent::GameEnded { .. }));
        Self {
            initial: initial.into(),
            rx,
            agent_id,
            done,
        }
    }

    /// Next event for this subscriber, or None once the stream is over
    pub async fn next(&mut self) -> Option<WireEvent> {
        if let Some(event) = self.initial.pop_front() {
            return Some(event);
        }
        if self.done {
            return None;
        }

        loop {
            match self.rx.recv().await {
                Ok(broadcast) => {
                    if let Some(target) = &broadcast.target {
                        if self.agent_id.as_ref() != Some(target) {
                            continue;
                        }
                    }
                    if matches!(broadcast.event, WireEvent::GameEnded { .. }) {
                        self.done = true;
                    }
                    return Some(broadcast.event);
                }
                // Fell behind the backlog: drop this subscriber rather than
                // deliver a gapped sequence
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("dropping lagged subscriber ({skipped} events behind)");
                    self.done = true;
                    return None;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

/// Process-wide address book of live match actors
#[derive(Clone)]
pub struct MatchRegistry {
    handles: Arc<Mutex<HashMap<MatchId, MatchHandle>>>,
    store: Store,
    config: Arc<ServerConfig>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl MatchRegistry {
    pub fn new(
        store: Store,
        config: Arc<ServerConfig>,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handles: Arc::new(Mutex::new(HashMap::new())),
            store,
            config,
            tracker,
            cancel,
        }
    }

    /// Spawn the actor for a fresh match. Fails if the engine cannot build
    /// an initial state, in which case no actor is left behind.
    pub fn create_match(
        &self,
        match_id: MatchId,
        seed: u64,
        players: [(AgentId, i64); 2],
    ) -> anyhow::Result<MatchHandle> {
        let (tx, rx) = mpsc::channel(64);
        let handle = MatchHandle {
            match_id: match_id.clone(),
            tx: tx.clone(),
        };

        let actor = MatchActor::init(
            match_id.clone(),
            seed,
            players,
            self.store.clone(),
            self.config.clone(),
            tx,
            rx,
            self.cancel.clone(),
        )?;
        self.tracker.spawn(actor.run());

        let mut handles = self.handles.lock().expect("poisoned");
        handles.retain(|_, h| !h.is_closed());
        handles.insert(match_id, handle.clone());
        Ok(handle)
    }

    pub fn get(&self, match_id: &str) -> Option<MatchHandle> {
        let handles = self.handles.lock().expect("poisoned");
        handles.get(match_id).filter(|h| !h.is_closed()).cloned()
    }
}
