//! Wire envelopes sent to streaming clients, plus the bounded per-agent
//! buffer the matchmaker parks notifications in.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::engine::{AgentId, EngineEvent, GameState, Move};
use crate::mtch::MatchId;

/// Version stamp on every match event envelope
pub const EVENT_VERSION: u8 = 1;

/// Event sent to match subscribers (SSE and WebSocket carry the same shape)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WireEvent {
    /// Full authoritative snapshot; always the first event of a subscription
    State {
        event_version: u8,
        match_id: MatchId,
        state: MatchSnapshot,
    },

    /// One accepted move and everything the engine said about it
    EngineEvents {
        event_version: u8,
        match_id: MatchId,
        state_version: u64,
        agent_id: AgentId,
        move_id: String,
        #[serde(rename = "move")]
        mv: Move,
        engine_events: Vec<EngineEvent>,
        ts: DateTime<Utc>,
    },

    /// Delivered only to the agent whose turn just started
    YourTurn {
        event_version: u8,
        match_id: MatchId,
        state_version: u64,
    },

    /// Opaque pass-through published by an agent for spectators
    AgentThought {
        event_version: u8,
        match_id: MatchId,
        agent_id: AgentId,
        thought: Value,
    },

    /// Terminal event; every subscription ends after this
    GameEnded {
        event_version: u8,
        match_id: MatchId,
        winner: Option<AgentId>,
        reason: String,
        final_state_version: u64,
    },
}

/// The portion of match state exposed to clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSnapshot {
    pub state: GameState,
    pub state_version: u64,
    pub turn: u32,
    pub active_agent_id: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TerminalSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSnapshot {
    pub winner: Option<AgentId>,
    pub reason: String,
}

/// An envelope as fanned out by the match actor. `target` narrows delivery
/// to one agent (used for `your_turn`); everything else goes to everyone.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub target: Option<AgentId>,
    pub event: WireEvent,
}

impl Broadcast {
    pub fn everyone(event: WireEvent) -> Self {
        Self { target: None, event }
    }

    pub fn only(agent_id: &AgentId, event: WireEvent) -> Self {
        Self {
            target: Some(agent_id.clone()),
            event,
        }
    }
}

/// Event delivered through the matchmaker's wait endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum QueueEvent {
    /// You were paired; go subscribe to the match
    MatchFound { match_id: MatchId, opponent: AgentId },

    /// Pairing completed but the match could not start
    MatchFailed { match_id: MatchId, reason: String },

    /// Nothing arrived within the requested wait
    NoEvents,
}

/// Bounded FIFO of queue events for one agent
///
/// Overflow drops the OLDEST entry: notifications for agents that wandered
/// off must not starve agents still polling.
#[derive(Debug, Default)]
pub struct EventBuffer {
    events: VecDeque<QueueEvent>,
}

impl EventBuffer {
    pub fn push(&mut self, event: QueueEvent, cap: usize) {
        while self.events.len() >= cap {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<QueueEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_buffer_is_fifo() {
        let mut buffer = EventBuffer::default();
        buffer.push(
            QueueEvent::MatchFound {
                match_id: "m1".into(),
                opponent: "beta".into(),
            },
            25,
        );
        buffer.push(QueueEvent::NoEvents, 25);

        assert!(matches!(buffer.pop(), Some(QueueEvent::MatchFound { .. })));
        assert!(matches!(buffer.pop(), Some(QueueEvent::NoEvents)));
        assert!(buffer.pop().is_none());
    }

    #[test]
    fn test_buffer_overflow_drops_oldest() {
        let mut buffer = EventBuffer::default();
        for i in 0..30 {
            buffer.push(
                QueueEvent::MatchFound {
                    match_id: format!("m{i}"),
                    opponent: "x".into(),
                },
                25,
            );
        }

        // First popped should be m5: m0..m4 were dropped on overflow
        match buffer.pop() {
            Some(QueueEvent::MatchFound { match_id, .. }) => assert_eq!(match_id, "m5"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_wire_event_envelope_shape() {
        let event = WireEvent::YourTurn {
            event_version: EVENT_VERSION,
            match_id: "m1".into(),
            state_version: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "your_turn");
        assert_eq!(json["eventVersion"], 1);
        assert_eq!(json["stateVersion"], 3);
    }
}
