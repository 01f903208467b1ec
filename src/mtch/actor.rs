use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EndReason, MatchCommand, MatchId, MoveResponse, Subscription};
use crate::config::ServerConfig;
use crate::engine::{self, AgentId, GameState, Move};
use crate::events::{Broadcast, MatchSnapshot, TerminalSnapshot, WireEvent, EVENT_VERSION};
use crate::rating::{updated_rating, Score};
use crate::store::{LeaderboardUpdate, Store};

const RESULT_WRITE_ATTEMPTS: u32 = 3;

enum Status {
    Active,
    Ended {
        winner: Option<AgentId>,
        /// Reason string as broadcast (admin finishes carry their detail)
        wire_reason: String,
    },
}

/// Owns one match. See the module docs for the lifecycle.
pub struct MatchActor {
    match_id: MatchId,
    store: Store,
    config: Arc<ServerConfig>,

    state: GameState,
    state_version: u64,
    status: Status,

    /// `(agent, starting rating)` by seat, captured at pairing time
    seats: [(AgentId, i64); 2],

    /// move id -> the exact response the first submission produced
    idempotency: HashMap<String, MoveResponse>,

    broadcast_tx: broadcast::Sender<Broadcast>,
    self_tx: mpsc::Sender<MatchCommand>,
    rx: mpsc::Receiver<MatchCommand>,
    cancel: CancellationToken,

    turn_timer_generation: u64,
    turn_timer: Option<JoinHandle<()>>,

    /// Open streaming connections per participant
    connections: HashMap<AgentId, usize>,
    disconnect_generations: HashMap<AgentId, u64>,
    disconnect_timers: HashMap<AgentId, JoinHandle<()>>,

    /// Set at termination; the actor exits once this deadline passes
    release_at: Option<Instant>,
}

impl MatchActor {
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        match_id: MatchId,
        seed: u64,
        players: [(AgentId, i64); 2],
        store: Store,
        config: Arc<ServerConfig>,
        self_tx: mpsc::Sender<MatchCommand>,
        rx: mpsc::Receiver<MatchCommand>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let state = engine::initial_state(seed, [players[0].0.clone(), players[1].0.clone()]);
        let (broadcast_tx, _) = broadcast::channel(config.subscriber_backlog_max);

        Ok(Self {
            match_id,
            store,
            config,
            state,
            state_version: 0,
            status: Status::Active,
            seats: players,
            idempotency: HashMap::new(),
            broadcast_tx,
            self_tx,
            rx,
            cancel,
            turn_timer_generation: 0,
            turn_timer: None,
            connections: HashMap::new(),
            disconnect_generations: HashMap::new(),
            disconnect_timers: HashMap::new(),
            release_at: None,
        })
    }

    pub async fn run(mut self) {
        info!(match_id = %self.match_id, "match actor starting");
        self.arm_turn_timer();

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                () = maybe_sleep_until(self.release_at) => break,
                () = self.cancel.cancelled() => break,
            }
        }

        self.cancel_timers();
        debug!(match_id = %self.match_id, "match actor released");
    }

    async fn handle(&mut self, cmd: MatchCommand) {
        match cmd {
            MatchCommand::SubmitMove {
                agent_id,
                move_id,
                expected_version,
                mv,
                reply,
            } => {
                let response = self.submit_move(agent_id, move_id, expected_version, mv).await;
                let _ = reply.send(response);
            }

            MatchCommand::GetState { reply } => {
                let _ = reply.send(self.snapshot());
            }

            MatchCommand::Subscribe { agent_id, reply } => {
                let _ = reply.send(self.subscribe(agent_id));
            }

            MatchCommand::PublishThought { agent_id, thought } => {
                if self.seat_of(&agent_id).is_some() && matches!(self.status, Status::Active) {
                    self.broadcast(Broadcast::everyone(WireEvent::AgentThought {
                        event_version: EVENT_VERSION,
                        match_id: self.match_id.clone(),
                        agent_id,
                        thought,
                    }));
                }
            }

            MatchCommand::Finish { admin_reason, reply } => {
                let newly_ended = match self.status {
                    Status::Active => {
                        let wire_reason = format!("admin_finish_{admin_reason}");
                        self.terminate(EndReason::AdminFinish, None, wire_reason).await;
                        true
                    }
                    Status::Ended { .. } => false,
                };
                let _ = reply.send(newly_ended);
            }

            MatchCommand::ConnOpened { agent_id } => self.conn_opened(agent_id),
            MatchCommand::ConnClosed { agent_id } => self.conn_closed(agent_id),

            MatchCommand::TurnTimerFired { generation } => {
                self.turn_timer_fired(generation).await;
            }

            MatchCommand::DisconnectTimerFired {
                agent_id,
                generation,
            } => {
                self.disconnect_timer_fired(agent_id, generation).await;
            }
        }
    }

    // --- moves --------------------------------------------------------------

    async fn submit_move(
        &mut self,
        agent_id: AgentId,
        move_id: String,
        expected_version: u64,
        mv: Value,
    ) -> MoveResponse {
        // Retries are absorbed here: same move id, same bytes out
        if let Some(cached) = self.idempotency.get(&move_id) {
            return cached.clone();
        }

        let response = self
            .evaluate_move(&agent_id, &move_id, expected_version, mv)
            .await;
        self.idempotency.insert(move_id, response.clone());
        response
    }

    async fn evaluate_move(
        &mut self,
        agent_id: &AgentId,
        move_id: &str,
        expected_version: u64,
        mv: Value,
    ) -> MoveResponse {
        if let Status::Ended { .. } = self.status {
            return MoveResponse {
                status: 409,
                body: json!({
                    "ok": false,
                    "error": "match already ended",
                    "code": "terminal",
                }),
            };
        }

        let active = engine::current_player(&self.state);
        if agent_id != active {
            return MoveResponse {
                status: 403,
                body: json!({
                    "ok": false,
                    "error": "not your turn",
                    "code": "not_your_turn",
                    "current": active,
                }),
            };
        }

        if expected_version != self.state_version {
            return MoveResponse {
                status: 409,
                body: json!({
                    "ok": false,
                    "error": "state version mismatch",
                    "code": "version_mismatch",
                    "stateVersion": self.state_version,
                }),
            };
        }

        let parsed: Move = match serde_json::from_value(mv.clone()) {
            Ok(parsed) => parsed,
            Err(err) => {
                return MoveResponse {
                    status: 400,
                    body: json!({
                        "ok": false,
                        "error": format!("unknown move shape: {err}"),
                        "code": "invalid_move_schema",
                    }),
                };
            }
        };

        let (next, engine_events) = match engine::apply(&self.state, &parsed) {
            Ok(applied) => applied,
            Err(reason) => {
                return MoveResponse {
                    status: 400,
                    body: json!({
                        "ok": false,
                        "error": "illegal move",
                        "code": "illegal_move",
                        "reason": reason.to_string(),
                    }),
                };
            }
        };

        // Accepted: the in-memory state is the source of truth
        let previous_active = engine::current_player(&self.state).clone();
        self.state = next;
        self.state_version += 1;

        let payload = json!({
            "move": &parsed,
            "engineEvents": &engine_events,
            "agentId": agent_id,
            "moveId": move_id,
            "stateVersion": self.state_version,
        });
        self.append_event("move_applied", &payload).await;

        let terminal = engine::is_terminal(&self.state);

        // Timer rotation is atomic with the state update: both happen inside
        // this serialized handler
        if terminal.is_none() {
            self.arm_turn_timer();
        }

        self.broadcast(Broadcast::everyone(WireEvent::State {
            event_version: EVENT_VERSION,
            match_id: self.match_id.clone(),
            state: self.snapshot(),
        }));
        self.broadcast(Broadcast::everyone(WireEvent::EngineEvents {
            event_version: EVENT_VERSION,
            match_id: self.match_id.clone(),
            state_version: self.state_version,
            agent_id: agent_id.clone(),
            move_id: move_id.to_string(),
            mv: parsed,
            engine_events,
            ts: Utc::now(),
        }));

        let new_active = engine::current_player(&self.state).clone();
        if new_active != previous_active && terminal.is_none() {
            self.broadcast(Broadcast::only(
                &new_active,
                WireEvent::YourTurn {
                    event_version: EVENT_VERSION,
                    match_id: self.match_id.clone(),
                    state_version: self.state_version,
                },
            ));
        }

        if let Some(outcome) = terminal {
            let winner = outcome.winner_seat.map(|seat| self.seats[seat].0.clone());
            self.terminate(EndReason::Terminal, winner, EndReason::Terminal.to_string())
                .await;
        }

        MoveResponse {
            status: 200,
            body: json!({
                "ok": true,
                "stateVersion": self.state_version,
                "state": serde_json::to_value(self.snapshot()).unwrap_or(Value::Null),
            }),
        }
    }

    // --- subscriptions ------------------------------------------------------

    fn subscribe(&self, agent_id: Option<AgentId>) -> Subscription {
        let mut initial = vec![WireEvent::State {
            event_version: EVENT_VERSION,
            match_id: self.match_id.clone(),
            state: self.snapshot(),
        }];

        match &self.status {
            Status::Active => {
                // A participant subscribing on their own turn hears about it
                // immediately rather than on the next rotation
                let active = engine::current_player(&self.state);
                if agent_id.as_ref() == Some(active) {
                    initial.push(WireEvent::YourTurn {
                        event_version: EVENT_VERSION,
                        match_id: self.match_id.clone(),
                        state_version: self.state_version,
                    });
                }
            }
            Status::Ended {
                winner,
                wire_reason,
            } => {
                initial.push(WireEvent::GameEnded {
                    event_version: EVENT_VERSION,
                    match_id: self.match_id.clone(),
                    winner: winner.clone(),
                    reason: wire_reason.clone(),
                    final_state_version: self.state_version,
                });
            }
        }

        Subscription::new(initial, self.broadcast_tx.subscribe(), agent_id)
    }

    fn broadcast(&self, broadcast: Broadcast) {
        // A send error just means nobody is subscribed right now
        let _ = self.broadcast_tx.send(broadcast);
    }

    // --- timers -------------------------------------------------------------

    fn arm_turn_timer(&mut self) {
        self.turn_timer_generation += 1;
        let generation = self.turn_timer_generation;
        if let Some(handle) = self.turn_timer.take() {
            handle.abort();
        }

        let tx = self.self_tx.clone();
        let timeout = self.config.turn_timeout;
        self.turn_timer = Some(tokio::spawn(async move {
            sleep(timeout).await;
            let _ = tx.send(MatchCommand::TurnTimerFired { generation }).await;
        }));
    }

    async fn turn_timer_fired(&mut self, generation: u64) {
        if generation != self.turn_timer_generation || !matches!(self.status, Status::Active) {
            return;
        }

        let slow = engine::current_player(&self.state).clone();
        let winner = self.opponent_of(&slow);
        info!(match_id = %self.match_id, agent = %slow, "turn deadline missed, forfeiting");
        self.terminate(
            EndReason::TurnTimeout,
            winner,
            EndReason::TurnTimeout.to_string(),
        )
        .await;
    }

    fn conn_opened(&mut self, agent_id: AgentId) {
        if self.seat_of(&agent_id).is_none() {
            return;
        }
        *self.connections.entry(agent_id.clone()).or_default() += 1;

        // Any pending disconnect forfeit for this agent is off
        *self.disconnect_generations.entry(agent_id.clone()).or_default() += 1;
        if let Some(handle) = self.disconnect_timers.remove(&agent_id) {
            handle.abort();
        }
    }

    fn conn_closed(&mut self, agent_id: AgentId) {
        let Some(open) = self.connections.get_mut(&agent_id) else {
            return;
        };
        *open = open.saturating_sub(1);
        if *open > 0 || !matches!(self.status, Status::Active) {
            return;
        }

        let generation = {
            let slot = self.disconnect_generations.entry(agent_id.clone()).or_default();
            *slot += 1;
            *slot
        };
        let tx = self.self_tx.clone();
        let grace = self.config.disconnect_grace;
        let agent = agent_id.clone();
        let handle = tokio::spawn(async move {
            sleep(grace).await;
            let _ = tx
                .send(MatchCommand::DisconnectTimerFired {
                    agent_id: agent,
                    generation,
                })
                .await;
        });
        if let Some(old) = self.disconnect_timers.insert(agent_id, handle) {
            old.abort();
        }
    }

    async fn disconnect_timer_fired(&mut self, agent_id: AgentId, generation: u64) {
        if !matches!(self.status, Status::Active) {
            return;
        }
        if self.disconnect_generations.get(&agent_id) != Some(&generation) {
            return;
        }
        if self.connections.get(&agent_id).copied().unwrap_or(0) > 0 {
            return;
        }

        let winner = self.opponent_of(&agent_id);
        info!(match_id = %self.match_id, agent = %agent_id, "disconnect grace exceeded, forfeiting");
        self.terminate(
            EndReason::DisconnectTimeout,
            winner,
            EndReason::DisconnectTimeout.to_string(),
        )
        .await;
    }

    fn cancel_timers(&mut self) {
        if let Some(handle) = self.turn_timer.take() {
            handle.abort();
        }
        for (_, handle) in self.disconnect_timers.drain() {
            handle.abort();
        }
    }

    // --- termination --------------------------------------------------------

    async fn terminate(
        &mut self,
        reason: EndReason,
        winner: Option<AgentId>,
        wire_reason: String,
    ) {
        if let Status::Ended { .. } = self.status {
            return;
        }
        self.cancel_timers();

        let loser = winner.as_ref().and_then(|w| self.opponent_of(w));
        let updates = self.leaderboard_updates(winner.as_ref());

        // The result row is the one critical write: retry with backoff, but
        // the in-memory match ends either way
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .store
                .record_match_ended(
                    &self.match_id,
                    winner.as_ref(),
                    loser.as_ref(),
                    &reason.to_string(),
                    self.state_version,
                    &updates,
                )
                .await
            {
                Ok(()) => break,
                Err(err) if attempt < RESULT_WRITE_ATTEMPTS => {
                    warn!(
                        match_id = %self.match_id,
                        "result write failed (attempt {attempt}): {err}"
                    );
                    sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(err) => {
                    error!(
                        match_id = %self.match_id,
                        "giving up on result write after {attempt} attempts: {err}"
                    );
                    break;
                }
            }
        }

        self.status = Status::Ended {
            winner: winner.clone(),
            wire_reason: wire_reason.clone(),
        };

        let payload = json!({
            "winner": &winner,
            "reason": &wire_reason,
            "finalStateVersion": self.state_version,
        });
        self.append_event("game_ended", &payload).await;

        self.broadcast(Broadcast::everyone(WireEvent::GameEnded {
            event_version: EVENT_VERSION,
            match_id: self.match_id.clone(),
            winner,
            reason: wire_reason,
            final_state_version: self.state_version,
        }));

        self.release_at = Some(Instant::now() + self.config.ended_match_grace);
        info!(match_id = %self.match_id, %reason, "match ended");
    }

    fn leaderboard_updates(&self, winner: Option<&AgentId>) -> Vec<LeaderboardUpdate> {
        let [(agent_a, rating_a), (agent_b, rating_b)] = &self.seats;
        let score_a = match winner {
            None => Score::Draw,
            Some(w) if w == agent_a => Score::Win,
            Some(_) => Score::Loss,
        };
        let score_b = score_a.inverse();
        let k = self.config.rating_k_factor;

        vec![
            LeaderboardUpdate {
                agent_id: agent_a.clone(),
                new_rating: updated_rating(*rating_a, *rating_b, score_a, k),
                won: score_a == Score::Win,
                lost: score_a == Score::Loss,
            },
            LeaderboardUpdate {
                agent_id: agent_b.clone(),
                new_rating: updated_rating(*rating_b, *rating_a, score_b, k),
                won: score_b == Score::Win,
                lost: score_b == Score::Loss,
            },
        ]
    }

    // --- helpers ------------------------------------------------------------

    async fn append_event(&self, event_type: &str, payload: &Value) {
        // Event rows are best-effort: a storage hiccup must not stall play
        if let Err(err) = self
            .store
            .append_event(&self.match_id, self.state.turn, event_type, payload)
            .await
        {
            warn!(match_id = %self.match_id, "failed to append {event_type} event: {err}");
        }
    }

    fn snapshot(&self) -> MatchSnapshot {
        let terminal = match &self.status {
            Status::Active => None,
            Status::Ended {
                winner,
                wire_reason,
            } => Some(TerminalSnapshot {
                winner: winner.clone(),
                reason: wire_reason.clone(),
            }),
        };
        MatchSnapshot {
            state: self.state.clone(),
            state_version: self.state_version,
            turn: self.state.turn,
            active_agent_id: engine::current_player(&self.state).clone(),
            terminal,
        }
    }

    fn seat_of(&self, agent_id: &AgentId) -> Option<usize> {
        self.seats.iter().position(|(agent, _)| agent == agent_id)
    }

    fn opponent_of(&self, agent_id: &AgentId) -> Option<AgentId> {
        self.seat_of(agent_id)
            .map(|seat| self.seats[1 - seat].0.clone())
    }
}

async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mtch::{MatchHandle, MatchRegistry};
    use crate::store::test_store;
    use tokio_util::task::TaskTracker;

    async fn spawn_match() -> (MatchRegistry, MatchHandle, Store) {
        let store = test_store().await;
        let config = Arc::new(ServerConfig::for_tests());
        let registry = MatchRegistry::new(
            store.clone(),
            config,
            TaskTracker::new(),
            CancellationToken::new(),
        );

        let match_id: MatchId = "m-test".into();
        store.record_match_created(&match_id, 42).await.unwrap();
        let handle = registry
            .create_match(match_id, 42, [("alpha".into(), 1500), ("beta".into(), 1500)])
            .unwrap();
        (registry, handle, store)
    }

    fn end_turn() -> Value {
        json!({"action": "end_turn"})
    }

    #[tokio::test]
    async fn test_move_applies_and_rotates() {
        let (_registry, handle, _store) = spawn_match().await;

        let response = handle
            .submit_move("alpha".into(), "u1".into(), 0, end_turn())
            .await
            .unwrap();
        assert!(response.is_ok());
        assert_eq!(response.body["stateVersion"], 1);

        let snapshot = handle.get_state().await.unwrap();
        assert_eq!(snapshot.state_version, 1);
        assert_eq!(snapshot.active_agent_id, "beta");
    }

    #[tokio::test]
    async fn test_retry_is_byte_identical_and_single_shot() {
        let (_registry, handle, _store) = spawn_match().await;

        let first = handle
            .submit_move("alpha".into(), "u1".into(), 0, end_turn())
            .await
            .unwrap();
        // Same move id, same args: same bytes, no second transition
        let second = handle
            .submit_move("alpha".into(), "u1".into(), 0, end_turn())
            .await
            .unwrap();

        assert_eq!(first.status, second.status);
        assert_eq!(
            serde_json::to_string(&first.body).unwrap(),
            serde_json::to_string(&second.body).unwrap()
        );
        assert_eq!(handle.get_state().await.unwrap().state_version, 1);
    }

    #[tokio::test]
    async fn test_not_your_turn() {
        let (_registry, handle, _store) = spawn_match().await;

        let response = handle
            .submit_move("beta".into(), "u1".into(), 0, end_turn())
            .await
            .unwrap();
        assert_eq!(response.status, 403);
        assert_eq!(response.body["code"], "not_your_turn");
        assert_eq!(response.body["current"], "alpha");
    }

    #[tokio::test]
    async fn test_version_mismatch_carries_current() {
        let (_registry, handle, _store) = spawn_match().await;
        handle
            .submit_move("alpha".into(), "u1".into(), 0, end_turn())
            .await
            .unwrap();

        let stale = handle
            .submit_move("beta".into(), "u2".into(), 0, end_turn())
            .await
            .unwrap();
        assert_eq!(stale.status, 409);
        assert_eq!(stale.body["code"], "version_mismatch");
        assert_eq!(stale.body["stateVersion"], 1);
        assert_eq!(handle.get_state().await.unwrap().state_version, 1);
    }

    #[tokio::test]
    async fn test_bad_schema_rejected() {
        let (_registry, handle, _store) = spawn_match().await;
        let response = handle
            .submit_move(
                "alpha".into(),
                "u1".into(),
                0,
                json!({"action": "summon_dragon"}),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 400);
        assert_eq!(response.body["code"], "invalid_move_schema");
    }

    #[tokio::test]
    async fn test_subscription_ordering_and_filtering() {
        let (_registry, handle, _store) = spawn_match().await;

        let mut alpha = handle.subscribe(Some("alpha".into())).await.unwrap();
        let mut beta = handle.subscribe(Some("beta".into())).await.unwrap();
        let mut spectator = handle.subscribe(None).await.unwrap();

        // Everyone starts with a snapshot; only alpha gets the initial your_turn
        assert!(matches!(alpha.next().await, Some(WireEvent::State { .. })));
        assert!(matches!(alpha.next().await, Some(WireEvent::YourTurn { .. })));
        assert!(matches!(beta.next().await, Some(WireEvent::State { .. })));
        assert!(matches!(spectator.next().await, Some(WireEvent::State { .. })));

        handle
            .submit_move("alpha".into(), "u1".into(), 0, end_turn())
            .await
            .unwrap();

        // state then engine_events, in that order, for every subscriber
        assert!(matches!(beta.next().await, Some(WireEvent::State { .. })));
        assert!(matches!(beta.next().await, Some(WireEvent::EngineEvents { .. })));
        // rotation: beta hears your_turn, the spectator never does
        assert!(matches!(beta.next().await, Some(WireEvent::YourTurn { .. })));

        assert!(matches!(spectator.next().await, Some(WireEvent::State { .. })));
        assert!(matches!(
            spectator.next().await,
            Some(WireEvent::EngineEvents { .. })
        ));
    }

    #[tokio::test]
    async fn test_admin_finish_is_idempotent() {
        let (_registry, handle, store) = spawn_match().await;
        let mut subscription = handle.subscribe(None).await.unwrap();
        subscription.next().await; // initial snapshot

        assert!(handle.finish("forfeit".into()).await.unwrap());
        assert!(!handle.finish("forfeit".into()).await.unwrap());

        match subscription.next().await {
            Some(WireEvent::GameEnded { winner, reason, .. }) => {
                assert_eq!(winner, None);
                assert_eq!(reason, "admin_finish_forfeit");
            }
            other => panic!("expected game_ended, got {other:?}"),
        }

        // Moves after the end reject with `terminal`
        let response = handle
            .submit_move("alpha".into(), "u9".into(), 0, end_turn())
            .await
            .unwrap();
        assert_eq!(response.body["code"], "terminal");

        // Draw: games_played moves, no win/loss counted
        let row = store.get_match("m-test").await.unwrap().unwrap();
        assert_eq!(row.status, "ended");
        let top = store.leaderboard_top(10).await.unwrap();
        assert_eq!(top.len(), 2);
        assert!(top.iter().all(|r| r.wins == 0 && r.losses == 0 && r.games_played == 1));
    }

    #[tokio::test]
    async fn test_turn_timeout_forfeits_active_agent() {
        let (_registry, handle, store) = spawn_match().await;
        let mut subscription = handle.subscribe(None).await.unwrap();
        subscription.next().await;

        // Test config arms a short turn deadline; alpha never moves
        match subscription.next().await {
            Some(WireEvent::GameEnded { winner, reason, .. }) => {
                assert_eq!(winner.as_deref(), Some("beta"));
                assert_eq!(reason, "turn_timeout");
            }
            other => panic!("expected game_ended, got {other:?}"),
        }

        let row = store.get_match("m-test").await.unwrap().unwrap();
        assert_eq!(row.end_reason.as_deref(), Some("turn_timeout"));
        assert_eq!(row.winner_agent_id.as_deref(), Some("beta"));

        let top = store.leaderboard_top(10).await.unwrap();
        let beta = top.iter().find(|r| r.agent_id == "beta").unwrap();
        assert_eq!((beta.wins, beta.losses), (1, 0));
        assert_eq!(beta.rating, 1516);
    }

    #[tokio::test]
    async fn test_disconnect_grace_forfeits() {
        let (_registry, handle, store) = spawn_match().await;

        let guard = handle.track_connection("alpha".into()).await.unwrap();
        // Beta keeps a connection open the whole time
        let _beta_guard = handle.track_connection("beta".into()).await.unwrap();
        drop(guard);

        // The 150ms disconnect grace fires well before the 400ms turn deadline
        tokio::time::sleep(Duration::from_millis(250)).await;
        let row = store.get_match("m-test").await.unwrap().unwrap();
        assert_eq!(row.status, "ended");
        assert_eq!(row.end_reason.as_deref(), Some("disconnect_timeout"));
        assert_eq!(row.winner_agent_id.as_deref(), Some("beta"));
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_terminal_state() {
        let (_registry, handle, _store) = spawn_match().await;
        handle.finish("wrapup".into()).await.unwrap();

        let mut late = handle.subscribe(None).await.unwrap();
        assert!(matches!(late.next().await, Some(WireEvent::State { .. })));
        assert!(matches!(late.next().await, Some(WireEvent::GameEnded { .. })));
        assert!(late.next().await.is_none());
    }
}
