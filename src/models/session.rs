use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::rules::{AppliedMove, MoveError, MoveRequest, Position, RulesEngine, Verdict};
use crate::server::clock::TurnClock;

/// Stable identity token, issued once at pairing and presented on rejoin.
pub type ParticipantId = Uuid;
/// Transient transport id; a participant gets a new one on every reconnect.
pub type ConnId = Uuid;
pub type SessionId = Uuid;

/// Board side, assigned explicitly at pairing time (the first client
/// popped from the queue plays white). Never inferred from array position.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SideColor {
    White,
    Black,
}

impl SideColor {
    pub fn opposite(self) -> Self {
        match self {
            SideColor::White => SideColor::Black,
            SideColor::Black => SideColor::White,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Connected,
    Disconnected { since: Instant },
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub color: SideColor,
    /// Current transport ref; stale once the participant disconnects.
    pub conn: ConnId,
    pub presence: Presence,
}

impl Participant {
    pub fn is_connected(&self) -> bool {
        matches!(self.presence, Presence::Connected)
    }

    pub fn short_name(&self) -> String {
        let hex = self.id.simple().to_string();
        format!("P{}", &hex[..5])
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WinReason {
    Checkmate,
    Timeout,
    Abandoned,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DrawReason {
    Stalemate,
    InsufficientMaterial,
    Draw,
    /// Both sides gone past the stuck threshold; nobody left to win.
    Abandoned,
}

/// How a finished match ended. Winner and loser ids exist exactly when the
/// result is decisive; draws carry only a reason.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MatchOutcome {
    Win {
        winner: ParticipantId,
        loser: ParticipantId,
        reason: WinReason,
    },
    Draw {
        reason: DrawReason,
    },
}

impl MatchOutcome {
    pub fn describe(&self) -> String {
        match self {
            MatchOutcome::Win {
                winner,
                loser,
                reason: WinReason::Checkmate,
            } => format!("{winner} wins by checkmate against {loser}"),
            MatchOutcome::Win {
                winner,
                loser,
                reason: WinReason::Timeout,
            } => format!("{winner} wins; {loser} ran out of time"),
            MatchOutcome::Win {
                winner,
                loser,
                reason: WinReason::Abandoned,
            } => format!("{winner} wins; {loser} abandoned the match"),
            MatchOutcome::Draw { reason: DrawReason::Stalemate } => "draw by stalemate".to_string(),
            MatchOutcome::Draw {
                reason: DrawReason::InsufficientMaterial,
            } => "draw by insufficient material".to_string(),
            MatchOutcome::Draw { reason: DrawReason::Draw } => "draw".to_string(),
            MatchOutcome::Draw { reason: DrawReason::Abandoned } => {
                "match abandoned by both sides".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Ended(MatchOutcome),
}

/// Why a move submission was refused before touching any state. Only the
/// submitter hears about these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    SessionOver,
    NotAParticipant,
    NotYourTurn,
    OpponentUnreachable,
}

/// What became of a move submission, for the transport layer to fan out.
#[derive(Debug)]
pub enum MoveDisposition {
    /// Refused up front; session state is untouched.
    Rejected(RejectReason),
    /// The rules engine refused the move. The clock has been restarted for
    /// the same turn holder, so the failed attempt costs only real elapsed
    /// time; `restart_generation` is the new tick schedule to install.
    Illegal {
        error: MoveError,
        restart_generation: Option<u64>,
    },
    /// The submitter's clock ran out while they deliberated; the session
    /// is now ended.
    Flagged { outcome: MatchOutcome },
    /// Move accepted and appended to history.
    Applied { applied: AppliedMove, sequel: Sequel },
}

#[derive(Debug)]
pub enum Sequel {
    /// The move ended the game.
    Over(MatchOutcome),
    /// Play continues; `generation` is the tick schedule for the new
    /// turn holder's clock.
    NextTurn {
        turn_holder: ParticipantId,
        generation: Option<u64>,
    },
}

/// Outcome of a transport-level disconnect notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectNote {
    /// The participant was connected until now. Grace supervision should
    /// begin iff the session was still active.
    WentDark {
        participant: ParticipantId,
        opponent: ParticipantId,
        /// Where to notify the opponent, if they are reachable.
        opponent_conn: Option<ConnId>,
        was_active: bool,
    },
    /// Stale conn, unknown conn, or an already-disconnected participant.
    Ignored,
}

/// One two-party timed match: participants, turn pointer, clock, history,
/// lifecycle. All mutation happens inside single-threaded server handlers;
/// the struct itself carries no locking.
pub struct Session {
    pub id: SessionId,
    participants: [Participant; 2],
    pub turn_holder: ParticipantId,
    /// Opaque to the session; only the rules engine looks inside.
    pub position: Position,
    pub history: Vec<AppliedMove>,
    pub clock: TurnClock,
    lifecycle: Lifecycle,
    pub created_at: Instant,
    /// Creation, moves, disconnects, reconnects, and ending all bump this;
    /// the janitor measures idleness against it.
    pub last_activity: Instant,
}

impl Session {
    pub fn new(
        id: SessionId,
        white: (ParticipantId, ConnId),
        black: (ParticipantId, ConnId),
        position: Position,
        allotment: Duration,
        now: Instant,
    ) -> Self {
        let participants = [
            Participant {
                id: white.0,
                color: SideColor::White,
                conn: white.1,
                presence: Presence::Connected,
            },
            Participant {
                id: black.0,
                color: SideColor::Black,
                conn: black.1,
                presence: Presence::Connected,
            },
        ];
        Self {
            id,
            turn_holder: white.0,
            participants,
            position,
            history: Vec::new(),
            clock: TurnClock::new(allotment),
            lifecycle: Lifecycle::Active,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn participants(&self) -> &[Participant; 2] {
        &self.participants
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    fn participant_mut(&mut self, id: ParticipantId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    pub fn opponent_of(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id != id)
    }

    pub fn participant_by_conn(&self, conn: ConnId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.conn == conn)
    }

    pub fn by_side(&self, side: SideColor) -> &Participant {
        if self.participants[0].color == side {
            &self.participants[0]
        } else {
            &self.participants[1]
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Active)
    }

    pub fn outcome(&self) -> Option<MatchOutcome> {
        match self.lifecycle {
            Lifecycle::Ended(outcome) => Some(outcome),
            Lifecycle::Active => None,
        }
    }

    pub fn both_connected(&self) -> bool {
        self.participants.iter().all(Participant::is_connected)
    }

    pub fn all_disconnected(&self) -> bool {
        !self.participants.iter().any(Participant::is_connected)
    }

    pub fn holder_side(&self) -> SideColor {
        self.participant(self.turn_holder)
            .map(|p| p.color)
            .unwrap_or(SideColor::White)
    }

    pub fn display_name(&self) -> String {
        format!(
            "{} vs {}",
            self.by_side(SideColor::White).short_name(),
            self.by_side(SideColor::Black).short_name()
        )
    }

    /// Start the turn holder's countdown if the state allows it: session
    /// active and both sides connected. Returns the tick generation to
    /// schedule against, or None when the clock must stay frozen.
    pub fn maybe_start_clock(&mut self, now: Instant) -> Option<u64> {
        if !self.is_active() || !self.both_connected() {
            return None;
        }
        let side = self.holder_side();
        Some(self.clock.start(side, now))
    }

    pub fn timeout_outcome(&self, flagged: SideColor) -> MatchOutcome {
        MatchOutcome::Win {
            winner: self.by_side(flagged.opposite()).id,
            loser: self.by_side(flagged).id,
            reason: WinReason::Timeout,
        }
    }

    /// Terminal transition. Freezes the clock permanently; idempotent once
    /// ended.
    pub fn end(&mut self, outcome: MatchOutcome, now: Instant) {
        if !self.is_active() {
            return;
        }
        self.clock.halt(now);
        self.lifecycle = Lifecycle::Ended(outcome);
        self.last_activity = now;
    }

    /// Full move transition: guards, clock freeze, delegation to the rules
    /// engine, history append, end-of-game evaluation, turn flip.
    pub fn apply_move(
        &mut self,
        submitter: ParticipantId,
        request: &MoveRequest,
        rules: &dyn RulesEngine,
        now: Instant,
    ) -> MoveDisposition {
        if !self.is_active() {
            return MoveDisposition::Rejected(RejectReason::SessionOver);
        }
        if self.participant(submitter).is_none() {
            return MoveDisposition::Rejected(RejectReason::NotAParticipant);
        }
        if submitter != self.turn_holder {
            return MoveDisposition::Rejected(RejectReason::NotYourTurn);
        }
        let opponent = match self.opponent_of(submitter) {
            Some(opponent) => opponent,
            None => return MoveDisposition::Rejected(RejectReason::NotAParticipant),
        };
        if !opponent.is_connected() {
            return MoveDisposition::Rejected(RejectReason::OpponentUnreachable);
        }
        let opponent_id = opponent.id;

        // Freeze the mover's time before consulting the rules engine.
        if let Some(flagged) = self.clock.halt(now) {
            let outcome = self.timeout_outcome(flagged);
            self.end(outcome, now);
            return MoveDisposition::Flagged { outcome };
        }

        match rules.try_apply(&mut self.position, request) {
            Err(error) => {
                let restart_generation = self.maybe_start_clock(now);
                MoveDisposition::Illegal {
                    error,
                    restart_generation,
                }
            }
            Ok((applied, verdict)) => {
                self.history.push(applied.clone());
                self.last_activity = now;
                let sequel = match verdict {
                    Some(Verdict::Checkmate) => {
                        let outcome = MatchOutcome::Win {
                            winner: submitter,
                            loser: opponent_id,
                            reason: WinReason::Checkmate,
                        };
                        self.end(outcome, now);
                        Sequel::Over(outcome)
                    }
                    Some(verdict) => {
                        let outcome = MatchOutcome::Draw {
                            reason: match verdict {
                                Verdict::Stalemate => DrawReason::Stalemate,
                                Verdict::InsufficientMaterial => DrawReason::InsufficientMaterial,
                                _ => DrawReason::Draw,
                            },
                        };
                        self.end(outcome, now);
                        Sequel::Over(outcome)
                    }
                    None => {
                        self.turn_holder = opponent_id;
                        let generation = self.maybe_start_clock(now);
                        Sequel::NextTurn {
                            turn_holder: opponent_id,
                            generation,
                        }
                    }
                };
                MoveDisposition::Applied { applied, sequel }
            }
        }
    }

    /// Record a transport disconnect. Pauses the clock if the session was
    /// active; on an ended session this is bookkeeping only (it feeds the
    /// janitor's cleanup eligibility).
    pub fn note_disconnect(&mut self, conn: ConnId, now: Instant) -> DisconnectNote {
        let index = match self.participants.iter().position(|p| p.conn == conn) {
            Some(index) => index,
            None => return DisconnectNote::Ignored,
        };
        if !self.participants[index].is_connected() {
            return DisconnectNote::Ignored;
        }
        self.participants[index].presence = Presence::Disconnected { since: now };
        self.last_activity = now;
        let was_active = self.is_active();
        if was_active {
            self.clock.halt(now);
        }
        let other = &self.participants[1 - index];
        DisconnectNote::WentDark {
            participant: self.participants[index].id,
            opponent: other.id,
            opponent_conn: other.is_connected().then_some(other.conn),
            was_active,
        }
    }

    /// Whether the grace window for a disconnected participant has already
    /// elapsed, judged from the disconnect stamp rather than from any
    /// timer having fired.
    pub fn grace_expired(&self, id: ParticipantId, grace: Duration, now: Instant) -> bool {
        match self.participant(id).map(|p| p.presence) {
            Some(Presence::Disconnected { since }) => now.saturating_duration_since(since) > grace,
            _ => false,
        }
    }

    /// Re-associate a participant with a fresh transport and mark them
    /// connected.
    pub fn mark_connected(&mut self, id: ParticipantId, conn: ConnId, now: Instant) {
        if let Some(participant) = self.participant_mut(id) {
            participant.conn = conn;
            participant.presence = Presence::Connected;
        }
        self.last_activity = now;
    }

    /// Forfeiture on grace expiry. Authoritative only if the participant
    /// is still disconnected and the session still active; a stale timer
    /// gets None.
    pub fn forfeit_abandoned(&mut self, id: ParticipantId, now: Instant) -> Option<MatchOutcome> {
        if !self.is_active() {
            return None;
        }
        let participant = self.participant(id)?;
        if participant.is_connected() {
            return None;
        }
        let winner = self.opponent_of(id)?.id;
        let outcome = MatchOutcome::Win {
            winner,
            loser: id,
            reason: WinReason::Abandoned,
        };
        self.end(outcome, now);
        Some(outcome)
    }
}
