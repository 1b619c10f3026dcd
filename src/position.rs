// src/position.rs
//
// Thin wrapper around chess::Board adding the state the search needs but the
// board crate does not track: the halfmove clock for the 50-move rule, the
// plies-since-reset counter bounding the repetition window, and a couple of
// draw/quietness predicates.

use anyhow::{anyhow, Result};
use chess::{BitBoard, Board, ChessMove, Color, MoveGen, Piece};
use std::str::FromStr;

#[derive(Clone, Copy)]
pub struct Position {
    board: Board,
    halfmove_clock: u16,
    plies_from_null: u16,
}

impl Position {
    pub fn startpos() -> Self {
        Self {
            board: Board::default(),
            halfmove_clock: 0,
            plies_from_null: 0,
        }
    }

    /// Parse a FEN. The board crate ignores the halfmove clock field, so it
    /// is picked out of the string here. An invalid FEN leaves the caller's
    /// state untouched because nothing is returned.
    pub fn from_fen(fen: &str) -> Result<Self> {
        let board = Board::from_str(fen).map_err(|e| anyhow!("invalid fen '{}': {}", fen, e))?;
        let halfmove_clock = fen
            .split_whitespace()
            .nth(4)
            .and_then(|f| f.parse().ok())
            .unwrap_or(0);
        Ok(Self {
            board,
            halfmove_clock,
            plies_from_null: 0,
        })
    }

    #[inline]
    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Zobrist key of the position.
    #[inline]
    pub fn key(&self) -> u64 {
        self.board.get_hash()
    }

    #[inline]
    pub fn side_to_move(&self) -> Color {
        self.board.side_to_move()
    }

    #[inline]
    pub fn checkers(&self) -> BitBoard {
        *self.board.checkers()
    }

    #[inline]
    pub fn in_check(&self) -> bool {
        self.board.checkers().popcnt() > 0
    }

    #[inline]
    pub fn is_legal(&self, mv: ChessMove) -> bool {
        self.board.legal(mv)
    }

    #[inline]
    pub fn half_moves(&self) -> u32 {
        self.halfmove_clock as u32
    }

    #[inline]
    pub fn plies_from_null(&self) -> u32 {
        self.plies_from_null as u32
    }

    /// En passant captures land on an empty square, hence the file test.
    pub fn is_capture(&self, mv: ChessMove) -> bool {
        if self.board.piece_on(mv.get_dest()).is_some() {
            return true;
        }
        self.board.piece_on(mv.get_source()) == Some(Piece::Pawn)
            && mv.get_source().get_file() != mv.get_dest().get_file()
    }

    pub fn is_quiet(&self, mv: ChessMove) -> bool {
        !self.is_capture(mv) && mv.get_promotion().is_none()
    }

    /// Apply a legal move, maintaining the halfmove clock.
    pub fn do_move(&self, mv: ChessMove) -> Position {
        let pawn_move = self.board.piece_on(mv.get_source()) == Some(Piece::Pawn);
        let resets = pawn_move || self.is_capture(mv);
        Position {
            board: self.board.make_move_new(mv),
            halfmove_clock: if resets { 0 } else { self.halfmove_clock + 1 },
            plies_from_null: self.plies_from_null.saturating_add(1),
        }
    }

    /// Insufficient mating material: no pawns or majors on the board and at
    /// most one minor per side.
    pub fn is_material_draw(&self) -> bool {
        let majors_or_pawns = *self.board.pieces(Piece::Pawn)
            | *self.board.pieces(Piece::Rook)
            | *self.board.pieces(Piece::Queen);
        if majors_or_pawns.popcnt() > 0 {
            return false;
        }
        let minors = *self.board.pieces(Piece::Knight) | *self.board.pieces(Piece::Bishop);
        for color in [Color::White, Color::Black] {
            if (minors & self.board.color_combined(color)).popcnt() > 1 {
                return false;
            }
        }
        true
    }

    pub fn legal_move_count(&self) -> usize {
        MoveGen::new_legal(&self.board).len()
    }

    /// FEN re-serialization. The board crate prints placement, side,
    /// castling and en passant; the clock fields come from this wrapper.
    pub fn fen(&self) -> String {
        let board_fen = self.board.to_string();
        let fields: Vec<&str> = board_fen.split_whitespace().take(4).collect();
        format!("{} {} 1", fields.join(" "), self.halfmove_clock)
    }
}
