use std::str::FromStr;

use chess::{Board, BoardStatus, ChessMove, Color, Game, Piece, Square};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Position state is owned by the rules engine; the session core carries it
/// around as an opaque value and never inspects it.
pub type Position = Game;

/// A move as submitted by a client, in coordinate form.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion: Option<String>,
}

/// A move the engine accepted, as recorded in session history. The history
/// is append-only and sufficient to replay the game.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AppliedMove {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion: Option<String>,
    /// Position after the move.
    pub fen: String,
}

/// Terminal verdict reached by an accepted move, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Checkmate,
    Stalemate,
    InsufficientMaterial,
    Draw,
}

#[derive(Debug, Error)]
pub enum MoveError {
    #[error("malformed square {0:?}")]
    MalformedSquare(String),
    #[error("unknown promotion piece {0:?}")]
    UnknownPromotion(String),
    #[error("illegal move {from}-{to}")]
    Illegal { from: String, to: String },
}

/// Seam to the move legality engine. The session core only ever asks
/// "apply this or refuse it"; tests substitute scripted implementations.
pub trait RulesEngine {
    fn new_position(&self) -> Position;

    fn fen(&self, position: &Position) -> String;

    /// Validate and apply a move. On success the position has been mutated
    /// and the returned verdict says whether the game just ended.
    fn try_apply(
        &self,
        position: &mut Position,
        request: &MoveRequest,
    ) -> Result<(AppliedMove, Option<Verdict>), MoveError>;
}

/// Standard chess, backed by the `chess` crate.
pub struct StandardChess;

impl RulesEngine for StandardChess {
    fn new_position(&self) -> Position {
        Game::new()
    }

    fn fen(&self, position: &Position) -> String {
        position.current_position().to_string()
    }

    fn try_apply(
        &self,
        position: &mut Position,
        request: &MoveRequest,
    ) -> Result<(AppliedMove, Option<Verdict>), MoveError> {
        let from = request.from.to_lowercase();
        let to = request.to.to_lowercase();
        let from_square =
            Square::from_str(&from).map_err(|_| MoveError::MalformedSquare(request.from.clone()))?;
        let to_square =
            Square::from_str(&to).map_err(|_| MoveError::MalformedSquare(request.to.clone()))?;
        let promotion = match request.promotion.as_deref() {
            Some(name) => Some(
                promotion_piece(name).ok_or_else(|| MoveError::UnknownPromotion(name.to_string()))?,
            ),
            None => None,
        };

        let mv = ChessMove::new(from_square, to_square, promotion);
        if !position.make_move(mv) {
            return Err(MoveError::Illegal { from, to });
        }

        let fen = self.fen(position);
        let verdict = verdict_for(position);
        let applied = AppliedMove {
            from,
            to,
            promotion: request.promotion.clone(),
            fen,
        };
        Ok((applied, verdict))
    }
}

fn promotion_piece(name: &str) -> Option<Piece> {
    match name.to_lowercase().as_str() {
        "q" | "queen" => Some(Piece::Queen),
        "r" | "rook" => Some(Piece::Rook),
        "b" | "bishop" => Some(Piece::Bishop),
        "n" | "knight" => Some(Piece::Knight),
        _ => None,
    }
}

fn verdict_for(position: &Position) -> Option<Verdict> {
    let board = position.current_position();
    match board.status() {
        BoardStatus::Checkmate => Some(Verdict::Checkmate),
        BoardStatus::Stalemate => Some(Verdict::Stalemate),
        BoardStatus::Ongoing => {
            if has_insufficient_material(&board) {
                Some(Verdict::InsufficientMaterial)
            } else if position.can_declare_draw() {
                Some(Verdict::Draw)
            } else {
                None
            }
        }
    }
}

/// Neither side can force mate: bare kings, a lone minor piece, or single
/// bishops on same-colored squares.
fn has_insufficient_material(board: &Board) -> bool {
    let mut knights = [0usize; 2];
    let mut bishops = [0usize; 2];
    let mut bishop_parity = [None::<usize>; 2];

    for square in chess::ALL_SQUARES {
        let piece = match board.piece_on(square) {
            Some(piece) => piece,
            None => continue,
        };
        let side = match board.color_on(square) {
            Some(Color::White) => 0,
            _ => 1,
        };
        match piece {
            Piece::Pawn | Piece::Rook | Piece::Queen => return false,
            Piece::Knight => knights[side] += 1,
            Piece::Bishop => {
                bishops[side] += 1;
                bishop_parity[side] =
                    Some((square.get_rank().to_index() + square.get_file().to_index()) % 2);
            }
            Piece::King => {}
        }
    }

    let minors = knights[0] + bishops[0] + knights[1] + bishops[1];
    if minors <= 1 {
        return true;
    }
    knights == [0, 0] && bishops == [1, 1] && bishop_parity[0] == bishop_parity[1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv(from: &str, to: &str) -> MoveRequest {
        MoveRequest {
            from: from.to_string(),
            to: to.to_string(),
            promotion: None,
        }
    }

    #[test]
    fn legal_opening_move_is_applied() {
        let rules = StandardChess;
        let mut position = rules.new_position();
        let (applied, verdict) = rules.try_apply(&mut position, &mv("e2", "e4")).unwrap();
        assert_eq!(applied.from, "e2");
        assert_eq!(applied.to, "e4");
        assert!(applied.fen.contains(" b ")); // black to move
        assert_eq!(verdict, None);
    }

    #[test]
    fn illegal_move_is_refused_without_mutation() {
        let rules = StandardChess;
        let mut position = rules.new_position();
        let before = rules.fen(&position);
        let err = rules.try_apply(&mut position, &mv("e2", "e5")).unwrap_err();
        assert!(matches!(err, MoveError::Illegal { .. }));
        assert_eq!(rules.fen(&position), before);
    }

    #[test]
    fn malformed_square_is_reported() {
        let rules = StandardChess;
        let mut position = rules.new_position();
        let err = rules.try_apply(&mut position, &mv("z9", "e4")).unwrap_err();
        assert!(matches!(err, MoveError::MalformedSquare(_)));
    }

    #[test]
    fn uppercase_coordinates_are_accepted() {
        let rules = StandardChess;
        let mut position = rules.new_position();
        let (applied, _) = rules.try_apply(&mut position, &mv("E2", "E4")).unwrap();
        assert_eq!(applied.from, "e2");
    }

    #[test]
    fn fools_mate_yields_checkmate_verdict() {
        let rules = StandardChess;
        let mut position = rules.new_position();
        for (from, to) in [("f2", "f3"), ("e7", "e5"), ("g2", "g4")] {
            let (_, verdict) = rules.try_apply(&mut position, &mv(from, to)).unwrap();
            assert_eq!(verdict, None);
        }
        let (_, verdict) = rules.try_apply(&mut position, &mv("d8", "h4")).unwrap();
        assert_eq!(verdict, Some(Verdict::Checkmate));
    }

    #[test]
    fn unknown_promotion_piece_is_refused() {
        let rules = StandardChess;
        let mut position = rules.new_position();
        let request = MoveRequest {
            from: "e2".to_string(),
            to: "e4".to_string(),
            promotion: Some("king".to_string()),
        };
        let err = rules.try_apply(&mut position, &request).unwrap_err();
        assert!(matches!(err, MoveError::UnknownPromotion(_)));
    }

    #[test]
    fn bare_kings_are_insufficient_material() {
        use std::str::FromStr;
        let board = Board::from_str("8/8/4k3/8/8/3K4/8/8 w - - 0 1").unwrap();
        assert!(has_insufficient_material(&board));
    }

    #[test]
    fn rook_is_sufficient_material() {
        use std::str::FromStr;
        let board = Board::from_str("8/8/4k3/8/8/3KR3/8/8 w - - 0 1").unwrap();
        assert!(!has_insufficient_material(&board));
    }
}
