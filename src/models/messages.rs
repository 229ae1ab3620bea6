use actix::{Message, Recipient};
use serde::{Deserialize, Serialize};

use crate::game::rules::{AppliedMove, MoveRequest};
use crate::models::session::{ConnId, MatchOutcome, ParticipantId, SessionId, SideColor};

/// One client intent, decoded from a WebSocket text frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientIntent {
    StartMatch,
    CancelMatch,
    SubmitMove {
        session_id: SessionId,
        #[serde(rename = "move")]
        mv: MoveRequest,
    },
    Rejoin {
        session_id: SessionId,
        participant_token: ParticipantId,
    },
    Spectate {
        session_id: SessionId,
    },
    ListActiveSessions,
    Chat {
        session_id: SessionId,
        message: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejoinFailure {
    SessionNotFound,
    InvalidToken,
    GraceExpired,
}

/// Summary row for spectator discovery.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub moves: usize,
}

/// One server event, fanned out as a WebSocket text frame. Every variant
/// carries exactly the fields its event name implies; nothing is optional
/// unless absence is meaningful.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionStarted {
        session_id: SessionId,
        participant_token: ParticipantId,
        color: SideColor,
        turn_holder: ParticipantId,
        white_ms: u64,
        black_ms: u64,
    },
    SessionRejoined {
        session_id: SessionId,
        participant_token: ParticipantId,
        color: SideColor,
        turn_holder: ParticipantId,
        fen: String,
        history: Vec<AppliedMove>,
        white_ms: u64,
        black_ms: u64,
        opponent_connected: bool,
        /// Present iff the session has already ended; a late rejoiner
        /// still gets to observe the terminal state.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<MatchOutcome>,
    },
    RejoinFailed {
        reason: RejoinFailure,
        message: String,
    },
    MoveApplied {
        #[serde(rename = "move")]
        mv: AppliedMove,
        fen: String,
    },
    TurnChanged {
        turn_holder: ParticipantId,
    },
    ClockUpdate {
        white_ms: u64,
        black_ms: u64,
    },
    SessionEnded {
        outcome: MatchOutcome,
        message: String,
    },
    OpponentDisconnected {
        participant_id: ParticipantId,
    },
    OpponentReconnected {
        participant_id: ParticipantId,
    },
    InvalidMove {
        #[serde(rename = "move")]
        mv: MoveRequest,
        message: String,
    },
    OpponentUnreachable {
        message: String,
    },
    ActiveSessions {
        sessions: Vec<SessionSummary>,
    },
    SpectateStarted {
        session_id: SessionId,
        fen: String,
        history: Vec<AppliedMove>,
        turn_holder: ParticipantId,
        white_ms: u64,
        black_ms: u64,
    },
    SpectateFailed {
        message: String,
    },
    Chat {
        from: ParticipantId,
        message: String,
    },
    Error {
        message: String,
    },
}

/// Pre-serialized event pushed to one connection actor.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Frame(pub String);

/// Registration of a freshly opened socket.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect {
    pub conn: ConnId,
    pub addr: Recipient<Frame>,
}

/// Transport-level disconnect notification.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub conn: ConnId,
}

/// Decoded client intent, forwarded by the socket actor.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Inbound {
    pub conn: ConnId,
    pub intent: ClientIntent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn intents_decode_from_tagged_json() {
        let session_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"action":"submit_move","session_id":"{session_id}","move":{{"from":"e2","to":"e4"}}}}"#
        );
        let intent: ClientIntent = serde_json::from_str(&raw).unwrap();
        match intent {
            ClientIntent::SubmitMove { session_id: sid, mv } => {
                assert_eq!(sid, session_id);
                assert_eq!(mv.from, "e2");
                assert_eq!(mv.promotion, None);
            }
            other => panic!("unexpected intent: {other:?}"),
        }

        let intent: ClientIntent = serde_json::from_str(r#"{"action":"start_match"}"#).unwrap();
        assert_eq!(intent, ClientIntent::StartMatch);
    }

    #[test]
    fn decisive_outcomes_carry_winner_and_loser() {
        use crate::models::session::WinReason;
        let winner = Uuid::new_v4();
        let loser = Uuid::new_v4();
        let event = ServerEvent::SessionEnded {
            outcome: MatchOutcome::Win {
                winner,
                loser,
                reason: WinReason::Timeout,
            },
            message: "time".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["event"], "session_ended");
        assert_eq!(json["outcome"]["result"], "win");
        assert_eq!(json["outcome"]["reason"], "timeout");
        assert_eq!(json["outcome"]["winner"], winner.to_string());
    }

    #[test]
    fn draws_carry_no_winner_field() {
        use crate::models::session::DrawReason;
        let event = ServerEvent::SessionEnded {
            outcome: MatchOutcome::Draw {
                reason: DrawReason::Stalemate,
            },
            message: "draw".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["outcome"]["result"], "draw");
        assert!(json["outcome"].get("winner").is_none());
    }

    #[test]
    fn events_round_trip() {
        let event = ServerEvent::ClockUpdate {
            white_ms: 890_000,
            black_ms: 900_000,
        };
        let raw = serde_json::to_string(&event).unwrap();
        let back: ServerEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, event);
    }
}
