// src/eval.rs
//
// Static evaluation: material plus piece-square tables, from the side to
// move's perspective. The tables can be overridden at runtime through the
// `evalfile` option; a failed load keeps the built-in weights.

use crate::position::Position;
use anyhow::{Context, Result};
use chess::{Color, Piece, Square};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Piece-square tables, generated from a handful of positional rules
/// instead of tuned entry by entry. Squares are indexed from the owning
/// side's point of view (a1 = 0 for White).
///
/// The rules: minors and the queen gravitate to the center, pawns gain by
/// advancing (more so on central files), rooks like the seventh rank, and
/// the king stays on the back-rank wings.
fn default_tables() -> Vec<Vec<i32>> {
    let mut tables = vec![vec![0i32; 64]; 6];
    for sq in 0..64usize {
        let (file, rank) = (sq % 8, sq / 8);
        let fd = file.min(7 - file) as i32;
        let rd = rank.min(7 - rank) as i32;
        let centrality = fd + rd;

        // pawn
        tables[0][sq] = rank as i32 * 5 + if (2..6).contains(&rank) { fd * 3 } else { 0 };
        // knight
        tables[1][sq] = centrality * 8 - 20;
        // bishop
        tables[2][sq] = centrality * 5 - 12;
        // rook
        tables[3][sq] = fd * 2 + if rank == 6 { 10 } else { 0 };
        // queen
        tables[4][sq] = centrality * 3 - 8;
        // king
        tables[5][sq] = if rank == 0 {
            if fd <= 1 {
                18
            } else {
                -8
            }
        } else {
            -12 * (rank.min(4) as i32)
        };
    }
    tables
}

pub fn piece_index(piece: Piece) -> usize {
    match piece {
        Piece::Pawn => 0,
        Piece::Knight => 1,
        Piece::Bishop => 2,
        Piece::Rook => 3,
        Piece::Queen => 4,
        Piece::King => 5,
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct EvalWeights {
    pub piece_values: [i32; 6],
    pub tempo: i32,
    pub pst: Vec<Vec<i32>>,
}

impl Default for EvalWeights {
    fn default() -> Self {
        Self {
            piece_values: [100, 320, 330, 500, 900, 20_000],
            tempo: 10,
            pst: default_tables(),
        }
    }
}

pub struct Evaluator {
    weights: RwLock<EvalWeights>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            weights: RwLock::new(EvalWeights::default()),
        }
    }

    /// Replace the weights with the contents of a JSON file. On error the
    /// built-in (or previously loaded) weights stay in effect.
    pub fn load_weights(&self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("could not read eval file {}", path.display()))?;
        let weights: EvalWeights = serde_json::from_str(&text)
            .with_context(|| format!("could not parse eval file {}", path.display()))?;
        anyhow::ensure!(
            weights.pst.len() == 6 && weights.pst.iter().all(|t| t.len() == 64),
            "eval file {} must contain 6 piece-square tables of 64 entries",
            path.display()
        );
        *self.weights.write() = weights;
        Ok(())
    }

    /// Score from the side to move's perspective.
    pub fn evaluate(&self, pos: &Position) -> i32 {
        let w = self.weights.read();
        let board = pos.board();
        let mut score = 0;

        for sq in *board.combined() {
            let piece = board.piece_on(sq).unwrap();
            let color = board.color_on(sq).unwrap();
            let idx = piece_index(piece);
            let val = w.piece_values[idx] + w.pst[idx][pst_index(sq, color)];
            if color == Color::White {
                score += val;
            } else {
                score -= val;
            }
        }

        if board.side_to_move() == Color::White {
            score + w.tempo
        } else {
            -score + w.tempo
        }
    }
}

// Tables are laid out from White's side; Black mirrors vertically, which
// on a rank-major index is a flip of the rank bits.
fn pst_index(sq: Square, color: Color) -> usize {
    match color {
        Color::White => sq.to_index(),
        Color::Black => sq.to_index() ^ 56,
    }
}
