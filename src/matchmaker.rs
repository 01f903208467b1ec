//! The matchmaker actor
//!
//! One process-wide task serializes every queue operation: joins, leaves,
//! pairing, and delivery of per-agent notifications. It owns nothing about
//! running matches beyond a pointer to the latest one; authoritative match
//! state lives with the match actors.
//!
//! PAIRING
//! The queue is a single pending slot. First eligible join fills it (and
//! creates the match row up front); the next join from a different agent
//! pairs, spins up the match actor and notifies both sides. Re-joining
//! while pending is idempotent.

use std::collections::HashMap;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::AgentId;
use crate::error::ApiError;
use crate::events::{EventBuffer, QueueEvent};
use crate::mtch::{EndReason, MatchId, MatchRegistry};
use crate::store::Store;

/// Result of a join: either you wait, or the pairing just completed
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub match_id: MatchId,
    pub status: QueuePhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePhase {
    Waiting,
    Ready,
}

/// Queue state for one agent, as reported by the status endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_id: Option<MatchId>,
}

/// Point-in-time view of the matchmaker's pointers (for featured/live)
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub pending: Option<(MatchId, AgentId)>,
    pub latest_match_id: Option<MatchId>,
}

enum QueueCommand {
    Join {
        agent_id: AgentId,
        reply: oneshot::Sender<JoinResponse>,
    },
    Status {
        agent_id: AgentId,
        reply: oneshot::Sender<QueueStatus>,
    },
    Leave {
        agent_id: AgentId,
        reply: oneshot::Sender<()>,
    },
    WaitEvents {
        agent_id: AgentId,
        park: oneshot::Sender<QueueEvent>,
        reply: oneshot::Sender<Option<QueueEvent>>,
    },
    CancelWait {
        agent_id: AgentId,
    },
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
}

#[derive(Clone)]
pub struct MatchmakerHandle {
    tx: mpsc::Sender<QueueCommand>,
}

impl MatchmakerHandle {
    pub async fn join(&self, agent_id: AgentId) -> Result<JoinResponse, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::Join { agent_id, reply }).await?;
        rx.await.map_err(|_| ApiError::Unavailable)
    }

    pub async fn status(&self, agent_id: AgentId) -> Result<QueueStatus, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::Status { agent_id, reply }).await?;
        rx.await.map_err(|_| ApiError::Unavailable)
    }

    pub async fn leave(&self, agent_id: AgentId) -> Result<(), ApiError> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::Leave { agent_id, reply }).await?;
        rx.await.map_err(|_| ApiError::Unavailable)
    }

    /// Long-poll for the next queue event. Returns `no_events` when `wait`
    /// elapses first; a caller that gives up early never consumes an event.
    pub async fn wait_events(&self, agent_id: AgentId, wait: Duration) -> QueueEvent {
        let (park_tx, mut park_rx) = oneshot::channel();
        let (reply, reply_rx) = oneshot::channel();
        if self
            .send(QueueCommand::WaitEvents {
                agent_id: agent_id.clone(),
                park: park_tx,
                reply,
            })
            .await
            .is_err()
        {
            return QueueEvent::NoEvents;
        }

        match reply_rx.await {
            Ok(Some(event)) => return event,
            Ok(None) => {}
            Err(_) => return QueueEvent::NoEvents,
        }

        // Parked: an event may arrive before the deadline
        match timeout(wait, &mut park_rx).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) => QueueEvent::NoEvents,
            Err(_elapsed) => {
                let _ = self
                    .send(QueueCommand::CancelWait { agent_id })
                    .await;
                // The actor may have fulfilled the waiter in the race window
                park_rx.try_recv().unwrap_or(QueueEvent::NoEvents)
            }
        }
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| ApiError::Unavailable)
    }

    async fn send(&self, cmd: QueueCommand) -> Result<(), ApiError> {
        self.tx.send(cmd).await.map_err(|_| ApiError::Unavailable)
    }
}

struct PendingSlot {
    match_id: MatchId,
    agent_id: AgentId,
    seed: u64,
}

pub struct Matchmaker {
    store: Store,
    registry: MatchRegistry,
    per_agent_buffer_max: usize,

    pending: Option<PendingSlot>,
    latest_match_id: Option<MatchId>,

    buffers: HashMap<AgentId, EventBuffer>,
    waiters: HashMap<AgentId, oneshot::Sender<QueueEvent>>,

    rx: mpsc::Receiver<QueueCommand>,
    cancel: CancellationToken,
}

impl Matchmaker {
    pub fn spawn(
        store: Store,
        registry: MatchRegistry,
        per_agent_buffer_max: usize,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> MatchmakerHandle {
        let (tx, rx) = mpsc::channel(256);
        let matchmaker = Self {
            store,
            registry,
            per_agent_buffer_max,
            pending: None,
            latest_match_id: None,
            buffers: HashMap::new(),
            waiters: HashMap::new(),
            rx,
            cancel,
        };
        tracker.spawn(matchmaker.run());
        MatchmakerHandle { tx }
    }

    async fn run(mut self) {
        info!("matchmaker starting");
        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                () = self.cancel.cancelled() => break,
            }
        }
    }

    async fn handle(&mut self, cmd: QueueCommand) {
        match cmd {
            QueueCommand::Join { agent_id, reply } => {
                let _ = reply.send(self.join(agent_id).await);
            }

            QueueCommand::Status { agent_id, reply } => {
                let status = match &self.pending {
                    Some(slot) if slot.agent_id == agent_id => QueueStatus {
                        status: "waiting",
                        match_id: Some(slot.match_id.clone()),
                    },
                    _ => QueueStatus {
                        status: "idle",
                        match_id: None,
                    },
                };
                let _ = reply.send(status);
            }

            QueueCommand::Leave { agent_id, reply } => {
                // Only the pending slot can be abandoned; started matches
                // are never cancelled from the queue
                if self
                    .pending
                    .as_ref()
                    .is_some_and(|slot| slot.agent_id == agent_id)
                {
                    self.pending = None;
                }
                let _ = reply.send(());
            }

            QueueCommand::WaitEvents {
                agent_id,
                park,
                reply,
            } => {
                let immediate = self
                    .buffers
                    .get_mut(&agent_id)
                    .and_then(EventBuffer::pop);
                if immediate.is_none() {
                    // Replacing a stale waiter ends the older poll empty
                    self.waiters.insert(agent_id, park);
                }
                let _ = reply.send(immediate);
            }

            QueueCommand::CancelWait { agent_id } => {
                if self
                    .waiters
                    .get(&agent_id)
                    .is_some_and(oneshot::Sender::is_closed)
                {
                    self.waiters.remove(&agent_id);
                }
            }

            QueueCommand::Snapshot { reply } => {
                let _ = reply.send(QueueSnapshot {
                    pending: self
                        .pending
                        .as_ref()
                        .map(|slot| (slot.match_id.clone(), slot.agent_id.clone())),
                    latest_match_id: self.latest_match_id.clone(),
                });
            }
        }
    }

    async fn join(&mut self, agent_id: AgentId) -> JoinResponse {
        // Re-join while pending is idempotent
        if let Some(slot) = &self.pending {
            if slot.agent_id == agent_id {
                return JoinResponse {
                    match_id: slot.match_id.clone(),
                    status: QueuePhase::Waiting,
                };
            }
        }

        match self.pending.take() {
            // Someone is waiting: pair up
            Some(slot) => {
                let match_id = slot.match_id.clone();
                self.latest_match_id = Some(match_id.clone());
                self.start_match(slot, agent_id).await;
                JoinResponse {
                    match_id,
                    status: QueuePhase::Ready,
                }
            }

            // Queue empty: take the slot
            None => {
                let match_id = Uuid::now_v7().hyphenated().to_string();
                let seed: u64 = rand::rng().random();

                // Best-effort: a failed row insert must not wedge the queue
                if let Err(err) = self.store.record_match_created(&match_id, seed).await {
                    warn!(%match_id, "failed to record match row: {err}");
                }

                self.pending = Some(PendingSlot {
                    match_id: match_id.clone(),
                    agent_id,
                    seed,
                });
                JoinResponse {
                    match_id,
                    status: QueuePhase::Waiting,
                }
            }
        }
    }

    /// Pairing completed: boot the match actor, record seats, notify both
    async fn start_match(&mut self, slot: PendingSlot, joiner: AgentId) {
        let PendingSlot {
            match_id,
            agent_id: first,
            seed,
        } = slot;

        let rating_first = self.store.get_rating(&first).await.unwrap_or(1500);
        let rating_joiner = self.store.get_rating(&joiner).await.unwrap_or(1500);

        let created = self.registry.create_match(
            match_id.clone(),
            seed,
            [
                (first.clone(), rating_first),
                (joiner.clone(), rating_joiner),
            ],
        );

        match created {
            Ok(_handle) => {
                // Seat rows are best-effort; the in-memory pairing stands
                // even if this insert fails
                if let Err(err) = self
                    .store
                    .record_match_players(
                        &match_id,
                        &[
                            (first.clone(), 0, rating_first),
                            (joiner.clone(), 1, rating_joiner),
                        ],
                    )
                    .await
                {
                    warn!(%match_id, "failed to record match players: {err}");
                }

                info!(%match_id, "paired {first} vs {joiner}");
                self.push_event(
                    first.clone(),
                    QueueEvent::MatchFound {
                        match_id: match_id.clone(),
                        opponent: joiner.clone(),
                    },
                );
                self.push_event(
                    joiner,
                    QueueEvent::MatchFound {
                        match_id,
                        opponent: first,
                    },
                );
            }

            Err(err) => {
                warn!(%match_id, "match init failed: {err:#}");
                let reason = EndReason::InitFailed.to_string();
                if let Err(err) = self
                    .store
                    .record_match_ended(&match_id, None, None, &reason, 0, &[])
                    .await
                {
                    warn!(%match_id, "failed to record init failure: {err}");
                }
                for agent in [first, joiner] {
                    self.push_event(
                        agent,
                        QueueEvent::MatchFailed {
                            match_id: match_id.clone(),
                            reason: reason.clone(),
                        },
                    );
                }
            }
        }
    }

    /// Hand an event to a parked waiter, or buffer it (drop-oldest past cap)
    fn push_event(&mut self, agent_id: AgentId, event: QueueEvent) {
        if let Some(waiter) = self.waiters.remove(&agent_id) {
            match waiter.send(event) {
                Ok(()) => return,
                // Waiter went away without cancelling: keep the event
                Err(event) => {
                    self.buffer(agent_id, event);
                }
            }
            return;
        }
        self.buffer(agent_id, event);
    }

    fn buffer(&mut self, agent_id: AgentId, event: QueueEvent) {
        self.buffers
            .entry(agent_id)
            .or_default()
            .push(event, self.per_agent_buffer_max);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ServerConfig;
    use crate::store::test_store;
    use std::sync::Arc;

    async fn spawn_matchmaker() -> (MatchmakerHandle, MatchRegistry, Store) {
        let store = test_store().await;
        let config = Arc::new(ServerConfig::for_tests());
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let registry = MatchRegistry::new(store.clone(), config, tracker.clone(), cancel.clone());
        let handle = Matchmaker::spawn(store.clone(), registry.clone(), 25, &tracker, cancel);
        (handle, registry, store)
    }

    #[tokio::test]
    async fn test_pairing_flow() {
        let (mm, registry, store) = spawn_matchmaker().await;

        let first = mm.join("alpha".into()).await.unwrap();
        assert_eq!(first.status, QueuePhase::Waiting);

        let second = mm.join("beta".into()).await.unwrap();
        assert_eq!(second.status, QueuePhase::Ready);
        assert_eq!(second.match_id, first.match_id);

        // Both sides get exactly one match_found naming the opponent
        match mm.wait_events("alpha".into(), Duration::from_secs(1)).await {
            QueueEvent::MatchFound { match_id, opponent } => {
                assert_eq!(match_id, first.match_id);
                assert_eq!(opponent, "beta");
            }
            other => panic!("unexpected {other:?}"),
        }
        match mm.wait_events("beta".into(), Duration::from_secs(1)).await {
            QueueEvent::MatchFound { opponent, .. } => assert_eq!(opponent, "alpha"),
            other => panic!("unexpected {other:?}"),
        }

        // The match actor is live and the row + seats were recorded
        let handle = registry.get(&first.match_id).expect("actor running");
        assert_eq!(handle.get_state().await.unwrap().state_version, 0);
        let players = store.get_match_players(&first.match_id).await.unwrap();
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].seat, 0);
    }

    #[tokio::test]
    async fn test_rejoin_is_idempotent() {
        let (mm, _registry, _store) = spawn_matchmaker().await;

        let first = mm.join("alpha".into()).await.unwrap();
        for _ in 0..3 {
            let again = mm.join("alpha".into()).await.unwrap();
            assert_eq!(again.status, QueuePhase::Waiting);
            assert_eq!(again.match_id, first.match_id);
        }
    }

    #[tokio::test]
    async fn test_leave_clears_pending() {
        let (mm, _registry, _store) = spawn_matchmaker().await;

        let first = mm.join("alpha".into()).await.unwrap();
        assert_eq!(
            mm.status("alpha".into()).await.unwrap().match_id,
            Some(first.match_id.clone())
        );

        mm.leave("alpha".into()).await.unwrap();
        assert_eq!(mm.status("alpha".into()).await.unwrap().status, "idle");

        // A later join opens a fresh match
        let second = mm.join("alpha".into()).await.unwrap();
        assert_ne!(second.match_id, first.match_id);
    }

    #[tokio::test]
    async fn test_wait_zero_timeout_returns_immediately() {
        let (mm, _registry, _store) = spawn_matchmaker().await;
        let event = mm.wait_events("alpha".into(), Duration::ZERO).await;
        assert!(matches!(event, QueueEvent::NoEvents));
    }

    #[tokio::test]
    async fn test_parked_waiter_gets_event() {
        let (mm, _registry, _store) = spawn_matchmaker().await;

        let waiter = {
            let mm = mm.clone();
            tokio::spawn(async move { mm.wait_events("alpha".into(), Duration::from_secs(2)).await })
        };
        // Give the waiter time to park before pairing happens
        tokio::time::sleep(Duration::from_millis(50)).await;

        mm.join("alpha".into()).await.unwrap();
        mm.join("beta".into()).await.unwrap();

        match waiter.await.unwrap() {
            QueueEvent::MatchFound { opponent, .. } => assert_eq!(opponent, "beta"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abandoned_wait_preserves_event() {
        let (mm, _registry, _store) = spawn_matchmaker().await;

        // Waiter gives up before anything arrives
        let event = mm.wait_events("alpha".into(), Duration::from_millis(50)).await;
        assert!(matches!(event, QueueEvent::NoEvents));

        mm.join("alpha".into()).await.unwrap();
        mm.join("beta".into()).await.unwrap();

        // The pairing event was buffered, not lost
        match mm.wait_events("alpha".into(), Duration::ZERO).await {
            QueueEvent::MatchFound { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_snapshot_tracks_latest() {
        let (mm, _registry, _store) = spawn_matchmaker().await;
        assert!(mm.snapshot().await.unwrap().latest_match_id.is_none());

        let join = mm.join("alpha".into()).await.unwrap();
        mm.join("beta".into()).await.unwrap();

        let snapshot = mm.snapshot().await.unwrap();
        assert_eq!(snapshot.latest_match_id, Some(join.match_id));
        assert!(snapshot.pending.is_none());
    }
}
