//! The deterministic arena engine
//!
//! The orchestration core treats this module as a pure-function collaborator:
//! `initial_state`, `legal_moves`, `apply`, `is_terminal`, `current_player`.
//! Nothing outside this module inspects the state or events beyond their
//! serde shape.
//!
//! RULES (two-player skirmish on a single lane):
//! - Each side owns a stronghold, a gold purse, an army somewhere on the
//!   lane, walls, and a tech level.
//! - A turn grants `ACTIONS_PER_TURN` action points; every move except
//!   `end_turn` costs one. Running out of points rotates the turn.
//! - Income is paid when a side's turn begins.
//! - Combat rolls are drawn from a rng seeded by `(match seed, nonce)` so
//!   replaying a move log reproduces the state exactly.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Id of an agent, as issued at registration (opaque uuid text)
pub type AgentId = String;

pub const ACTIONS_PER_TURN: u8 = 3;
pub const LANE_LEN: i32 = 7;
pub const TURN_CAP: u32 = 60;

const STARTING_HP: i32 = 30;
const STARTING_GOLD: i32 = 10;
const STARTING_ARMY: i32 = 3;
const INCOME_PER_TURN: i32 = 5;
const RECRUIT_COST: i32 = 3;
const FORTIFY_COST: i32 = 4;
const FORTIFY_WALLS: i32 = 2;
const UPGRADE_COST: i32 = 8;
const MAX_TECH: i32 = 5;

/// One side of the match
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Side {
    pub agent_id: AgentId,

    pub stronghold_hp: i32,
    pub gold: i32,
    pub walls: i32,
    pub tech: i32,

    /// Units in the field army
    pub army: i32,

    /// Lane cell the army stands on. Seat 0 attacks rightward (its
    /// stronghold is cell 0), seat 1 leftward (stronghold `LANE_LEN - 1`).
    pub position: i32,
}

/// Authoritative engine state for one match
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub seed: u64,

    /// Bumped on every accepted move; feeds the combat rng
    pub nonce: u64,

    /// Increments whenever the active seat rotates
    pub turn: u32,

    pub active_seat: usize,
    pub actions_remaining: u8,

    pub sides: [Side; 2],
}

/// A move as submitted by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Move {
    Move { direction: Direction },
    Attack,
    Recruit { count: i32 },
    Fortify,
    Upgrade,
    EndTurn,
    Pass,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Advance,
    Retreat,
}

/// Emitted alongside each state transition, forwarded verbatim to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Marched { seat: usize, to: i32 },
    Battle { attacker: usize, attacker_losses: i32, defender_losses: i32 },
    Siege { seat: usize, wall_damage: i32, hp_damage: i32 },
    Recruited { seat: usize, count: i32 },
    Fortified { seat: usize, walls: i32 },
    Upgraded { seat: usize, tech: i32 },
    Passed { seat: usize },
    Income { seat: usize, gold: i32 },
    TurnRotated { turn: u32, active_seat: usize },
}

/// Why the engine refused a move
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RejectReason {
    NotEnoughGold,
    NoArmy,
    NothingInRange,
    BlockedByEnemyArmy,
    OutOfBounds,
    BadUnitCount,
    TechMaxed,
}

/// Terminal outcome of a match, by seat
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// None on a draw
    pub winner_seat: Option<usize>,
    pub reason: &'static str,
}

pub fn initial_state(seed: u64, players: [AgentId; 2]) -> GameState {
    let [a, b] = players;
    GameState {
        seed,
        nonce: 0,
        turn: 0,
        active_seat: 0,
        actions_remaining: ACTIONS_PER_TURN,
        sides: [
            Side {
                agent_id: a,
                stronghold_hp: STARTING_HP,
                gold: STARTING_GOLD,
                walls: 0,
                tech: 1,
                army: STARTING_ARMY,
                position: 1,
            },
            Side {
                agent_id: b,
                stronghold_hp: STARTING_HP,
                gold: STARTING_GOLD,
                walls: 0,
                tech: 1,
                army: STARTING_ARMY,
                position: LANE_LEN - 2,
            },
        ],
    }
}

pub fn current_player(state: &GameState) -> &AgentId {
    &state.sides[state.active_seat].agent_id
}

pub fn is_terminal(state: &GameState) -> Option<Outcome> {
    for seat in 0..2 {
        if state.sides[seat].stronghold_hp <= 0 {
            return Some(Outcome {
                winner_seat: Some(1 - seat),
                reason: "stronghold_destroyed",
            });
        }
    }

    if state.turn >= TURN_CAP {
        let (a, b) = (state.sides[0].stronghold_hp, state.sides[1].stronghold_hp);
        let winner_seat = match a.cmp(&b) {
            std::cmp::Ordering::Greater => Some(0),
            std::cmp::Ordering::Less => Some(1),
            std::cmp::Ordering::Equal => None,
        };
        return Some(Outcome {
            winner_seat,
            reason: "turn_cap",
        });
    }

    None
}

/// Every move the active player could legally make right now
pub fn legal_moves(state: &GameState) -> Vec<Move> {
    let seat = state.active_seat;
    let side = &state.sides[seat];
    let mut moves = vec![Move::EndTurn, Move::Pass];

    for direction in [Direction::Advance, Direction::Retreat] {
        if march_target(state, seat, direction).is_ok() {
            moves.push(Move::Move { direction });
        }
    }
    if side.army > 0 && attack_kind(state, seat).is_some() {
        moves.push(Move::Attack);
    }
    if side.gold >= RECRUIT_COST {
        moves.push(Move::Recruit { count: 1 });
    }
    if side.gold >= FORTIFY_COST {
        moves.push(Move::Fortify);
    }
    if side.gold >= UPGRADE_COST && side.tech < MAX_TECH {
        moves.push(Move::Upgrade);
    }

    moves
}

/// Apply one move for the active player
///
/// Pure: the input state is untouched, the successor state and the events
/// that explain it are returned together.
pub fn apply(state: &GameState, mv: &Move) -> Result<(GameState, Vec<EngineEvent>), RejectReason> {
    let mut next = state.clone();
    let mut events = Vec::new();
    let seat = next.active_seat;

    next.nonce += 1;
    let mut rng = StdRng::seed_from_u64(next.seed.wrapping_add(next.nonce));

    match mv {
        Move::Move { direction } => {
            let to = march_target(state, seat, *direction)?;
            next.sides[seat].position = to;
            events.push(EngineEvent::Marched { seat, to });
        }

        Move::Attack => {
            let side = &next.sides[seat];
            if side.army <= 0 {
                return Err(RejectReason::NoArmy);
            }
            match attack_kind(state, seat) {
                Some(AttackKind::Battle) => {
                    let attack = roll_attack(&mut rng, side.army, side.tech);
                    let counter = next.sides[1 - seat].army / 2;
                    let defender_losses = attack.min(next.sides[1 - seat].army);
                    let attacker_losses = counter.min(next.sides[seat].army);
                    next.sides[1 - seat].army -= defender_losses;
                    next.sides[seat].army -= attacker_losses;
                    events.push(EngineEvent::Battle {
                        attacker: seat,
                        attacker_losses,
                        defender_losses,
                    });
                }
                Some(AttackKind::Siege) => {
                    let attack = roll_attack(&mut rng, side.army, side.tech);
                    let wall_damage = attack.min(next.sides[1 - seat].walls);
                    let hp_damage = attack - wall_damage;
                    next.sides[1 - seat].walls -= wall_damage;
                    next.sides[1 - seat].stronghold_hp -= hp_damage;
                    events.push(EngineEvent::Siege {
                        seat,
                        wall_damage,
                        hp_damage,
                    });
                }
                None => return Err(RejectReason::NothingInRange),
            }
        }

        Move::Recruit { count } => {
            if *count < 1 {
                return Err(RejectReason::BadUnitCount);
            }
            let cost = count * RECRUIT_COST;
            if next.sides[seat].gold < cost {
                return Err(RejectReason::NotEnoughGold);
            }
            next.sides[seat].gold -= cost;
            next.sides[seat].army += count;
            events.push(EngineEvent::Recruited { seat, count: *count });
        }

        Move::Fortify => {
            if next.sides[seat].gold < FORTIFY_COST {
                return Err(RejectReason::NotEnoughGold);
            }
            next.sides[seat].gold -= FORTIFY_COST;
            next.sides[seat].walls += FORTIFY_WALLS;
            events.push(EngineEvent::Fortified {
                seat,
                walls: next.sides[seat].walls,
            });
        }

        Move::Upgrade => {
            if next.sides[seat].tech >= MAX_TECH {
                return Err(RejectReason::TechMaxed);
            }
            if next.sides[seat].gold < UPGRADE_COST {
                return Err(RejectReason::NotEnoughGold);
            }
            next.sides[seat].gold -= UPGRADE_COST;
            next.sides[seat].tech += 1;
            events.push(EngineEvent::Upgraded {
                seat,
                tech: next.sides[seat].tech,
            });
        }

        Move::EndTurn => {
            rotate_turn(&mut next, &mut events);
            return Ok((next, events));
        }

        Move::Pass => {
            events.push(EngineEvent::Passed { seat });
        }
    }

    // Everything except end_turn costs one action point
    next.actions_remaining -= 1;
    if next.actions_remaining == 0 {
        rotate_turn(&mut next, &mut events);
    }

    Ok((next, events))
}

enum AttackKind {
    /// Armies are adjacent on the lane
    Battle,
    /// Army stands on the enemy stronghold cell
    Siege,
}

fn attack_kind(state: &GameState, seat: usize) -> Option<AttackKind> {
    let my = state.sides[seat].position;
    let their = state.sides[1 - seat].position;
    let enemy_base = if seat == 0 { LANE_LEN - 1 } else { 0 };

    if my == enemy_base {
        Some(AttackKind::Siege)
    } else if state.sides[1 - seat].army > 0 && (my - their).abs() <= 1 {
        Some(AttackKind::Battle)
    } else {
        None
    }
}

fn march_target(state: &GameState, seat: usize, direction: Direction) -> Result<i32, RejectReason> {
    let side = &state.sides[seat];
    if side.army <= 0 {
        return Err(RejectReason::NoArmy);
    }

    let towards_enemy = if seat == 0 { 1 } else { -1 };
    let delta = match direction {
        Direction::Advance => towards_enemy,
        Direction::Retreat => -towards_enemy,
    };
    let to = side.position + delta;

    if !(0..LANE_LEN).contains(&to) {
        return Err(RejectReason::OutOfBounds);
    }
    // Can't walk through a standing enemy army
    if to == state.sides[1 - seat].position && state.sides[1 - seat].army > 0 {
        return Err(RejectReason::BlockedByEnemyArmy);
    }

    Ok(to)
}

fn roll_attack(rng: &mut StdRng, army: i32, tech: i32) -> i32 {
    // Base hit per unit, plus up to `tech` bonus
    (army + rng.random_range(0..=tech)).max(1)
}

fn rotate_turn(state: &mut GameState, events: &mut Vec<EngineEvent>) {
    state.active_seat = 1 - state.active_seat;
    state.turn += 1;
    state.actions_remaining = ACTIONS_PER_TURN;

    // Income at the start of the new side's turn
    let seat = state.active_seat;
    state.sides[seat].gold += INCOME_PER_TURN;
    events.push(EngineEvent::Income {
        seat,
        gold: state.sides[seat].gold,
    });
    events.push(EngineEvent::TurnRotated {
        turn: state.turn,
        active_seat: seat,
    });
}

#[cfg(test)]
mod test {
    use super::*;

    fn fresh() -> GameState {
        initial_state(42, ["alpha".into(), "beta".into()])
    }

    #[test]
    fn test_initial_state_shape() {
        let state = fresh();
        assert_eq!(state.active_seat, 0);
        assert_eq!(state.actions_remaining, ACTIONS_PER_TURN);
        assert_eq!(current_player(&state), "alpha");
        assert!(is_terminal(&state).is_none());
    }

    #[test]
    fn test_end_turn_rotates_and_pays_income() {
        let state = fresh();
        let (next, events) = apply(&state, &Move::EndTurn).unwrap();
        assert_eq!(next.active_seat, 1);
        assert_eq!(next.turn, 1);
        assert_eq!(next.sides[1].gold, STARTING_GOLD + INCOME_PER_TURN);
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::TurnRotated { active_seat: 1, .. })));
    }

    #[test]
    fn test_actions_exhaust_into_rotation() {
        let mut state = fresh();
        for _ in 0..ACTIONS_PER_TURN {
            assert_eq!(state.active_seat, 0);
            (state, _) = apply(&state, &Move::Pass).unwrap();
        }
        assert_eq!(state.active_seat, 1);
    }

    #[test]
    fn test_recruit_costs_gold() {
        let state = fresh();
        let (next, _) = apply(&state, &Move::Recruit { count: 2 }).unwrap();
        assert_eq!(next.sides[0].gold, STARTING_GOLD - 2 * RECRUIT_COST);
        assert_eq!(next.sides[0].army, STARTING_ARMY + 2);

        let broke = apply(&state, &Move::Recruit { count: 100 });
        assert_eq!(broke.unwrap_err(), RejectReason::NotEnoughGold);
    }

    #[test]
    fn test_attack_out_of_range_rejected() {
        // Armies start 3 cells apart, nothing in reach
        let state = fresh();
        assert_eq!(apply(&state, &Move::Attack).unwrap_err(), RejectReason::NothingInRange);
    }

    #[test]
    fn test_siege_drops_stronghold() {
        let mut state = fresh();
        // Teleport seat 0's army to the enemy stronghold and flatten it
        state.sides[0].position = LANE_LEN - 1;
        state.sides[1].position = 3;
        state.sides[0].army = 40;

        let (next, events) = apply(&state, &Move::Attack).unwrap();
        assert!(matches!(events[0], EngineEvent::Siege { seat: 0, .. }));
        assert!(next.sides[1].stronghold_hp < STARTING_HP);
    }

    #[test]
    fn test_determinism() {
        let state = fresh();
        // Same state, same move, byte-identical successor
        let a = apply(&state, &Move::Recruit { count: 1 }).unwrap();
        let b = apply(&state, &Move::Recruit { count: 1 }).unwrap();
        assert_eq!(
            serde_json::to_string(&a.0).unwrap(),
            serde_json::to_string(&b.0).unwrap()
        );
    }

    #[test]
    fn test_turn_cap_decides_on_hp() {
        let mut state = fresh();
        state.turn = TURN_CAP;
        state.sides[0].stronghold_hp = 10;
        state.sides[1].stronghold_hp = 20;
        let outcome = is_terminal(&state).unwrap();
        assert_eq!(outcome.winner_seat, Some(1));
        assert_eq!(outcome.reason, "turn_cap");
    }

    #[test]
    fn test_move_schema_validation() {
        // Unknown discriminant
        let unknown = serde_json::from_value::<Move>(serde_json::json!({
            "action": "summon_dragon",
        }));
        assert!(unknown.is_err());

        // Known discriminant, missing field
        let missing = serde_json::from_value::<Move>(serde_json::json!({
            "action": "recruit",
        }));
        assert!(missing.is_err());

        let ok = serde_json::from_value::<Move>(serde_json::json!({"action": "end_turn"}));
        assert_eq!(ok.unwrap(), Move::EndTurn);
    }
}
