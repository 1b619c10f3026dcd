// src/uci.rs
//
// UCI protocol front-end. One handler owns the board state and the search
// worker; commands that cannot be parsed are ignored, malformed tails are
// accepted as far as they go, and option values outside their declared
// bounds leave the current value untouched.

use crate::defs::MAX_DEPTH;
use crate::eval::Evaluator;
use crate::position::Position;
use crate::search::stack::Stack;
use crate::search::{Config, SearchHandle, SearchJob, SearchLimits};
use crate::tree::TreeRecorder;
use crate::tt::TranspositionTable;
use chess::{Board, ChessMove, MoveGen};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

pub const HASH_DEFAULT: usize = 64;
const HASH_MIN: usize = 1;
const HASH_MAX: usize = 4096;
const MULTIPV_MIN: u32 = 1;
const MULTIPV_MAX: u32 = 64;
const ASP_DELTA_MIN: i32 = 8;
const ASP_DELTA_MAX: i32 = 256;
const ASP_MIN_DEPTH_MIN: i32 = 2;
const ASP_MIN_DEPTH_MAX: i32 = 10;

/// Write one protocol line and flush, so a piped GUI sees it immediately.
pub fn emit<T: std::fmt::Display>(msg: T) {
    let stdout = io::stdout();
    let mut lock = stdout.lock();
    let _ = writeln!(lock, "{}", msg);
    let _ = lock.flush();
}

pub struct UciHandler {
    tt: Arc<TranspositionTable>,
    eval: Arc<Evaluator>,
    search: SearchHandle,
    position: Position,
    stack: Stack,
    config: Config,
}

impl Default for UciHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl UciHandler {
    pub fn new() -> Self {
        let tt = Arc::new(TranspositionTable::new(HASH_DEFAULT));
        let eval = Arc::new(Evaluator::new());
        let tree = Arc::new(TreeRecorder::new(cfg!(debug_assertions)));
        let search = SearchHandle::new(Arc::clone(&tt), Arc::clone(&eval), tree);

        Self {
            tt,
            eval,
            search,
            position: Position::startpos(),
            stack: Stack::new(),
            config: Config::default(),
        }
    }

    pub fn run(&mut self) {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(cmd) = line else { break };
            let cmd = cmd.trim();
            if cmd.is_empty() {
                continue;
            }
            if !self.handle_command(cmd) {
                break;
            }
        }
        self.search.stop();
        self.search.wait_for_completion();
    }

    /// Returns false once the session should end.
    pub fn handle_command(&mut self, command: &str) -> bool {
        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.first().copied() {
            Some("uci") => self.handle_uci(),
            Some("isready") => emit("readyok"),
            Some("setoption") => self.handle_setoption(&parts[1..]),
            Some("ucinewgame") => self.handle_new_game(),
            Some("position") => self.handle_position(&parts[1..]),
            Some("go") => self.handle_go(&parts[1..]),
            Some("stop") => self.search.stop(),
            Some("ponderhit") => self.search.ponderhit(),
            Some("d") => emit(self.position.fen()),
            Some("quit") => return false,
            _ => (), // Ignore unknown commands
        }
        true
    }

    fn handle_uci(&self) {
        emit("id name Coral 0.1");
        emit("id author the Coral developers");
        emit(format!(
            "option name Hash type spin default {} min {} max {}",
            HASH_DEFAULT, HASH_MIN, HASH_MAX
        ));
        emit("option name Ponder type check default false");
        emit("option name clear hash type button");
        emit(format!(
            "option name multipv type spin default 1 min {} max {}",
            MULTIPV_MIN, MULTIPV_MAX
        ));
        emit(format!(
            "option name aspdelta type spin default 16 min {} max {}",
            ASP_DELTA_MIN, ASP_DELTA_MAX
        ));
        emit(format!(
            "option name aspmindepth type spin default 5 min {} max {}",
            ASP_MIN_DEPTH_MIN, ASP_MIN_DEPTH_MAX
        ));
        emit("option name lmrcoeff type string default 0.00");
        emit("option name evalfile type string default <empty>");
        emit("uciok");
    }

    fn handle_new_game(&mut self) {
        self.search.stop();
        self.search.wait_for_completion();
        self.tt.clear();
        self.position = Position::startpos();
        self.stack.reset();
    }

    fn handle_setoption(&mut self, parts: &[&str]) {
        if parts.first() != Some(&"name") {
            return;
        }
        let value_idx = parts.iter().position(|&p| p == "value");
        let name = parts[1..value_idx.unwrap_or(parts.len())]
            .join(" ")
            .to_lowercase();
        let value = value_idx.map(|vi| parts[vi + 1..].join(" ")).unwrap_or_default();

        match name.as_str() {
            "hash" => {
                if let Ok(mb) = value.parse::<usize>() {
                    if (HASH_MIN..=HASH_MAX).contains(&mb) {
                        self.search.stop();
                        self.search.wait_for_completion();
                        self.tt.resize(mb);
                        log::info!("hash table resized to {} MB", mb);
                    }
                }
            }
            "clear hash" => {
                self.search.stop();
                self.search.wait_for_completion();
                self.tt.clear();
            }
            "ponder" => {
                self.config.ponder = value == "true";
            }
            "multipv" => {
                if let Ok(v) = value.parse::<u32>() {
                    if (MULTIPV_MIN..=MULTIPV_MAX).contains(&v) {
                        self.config.multipv = v;
                    }
                }
            }
            "aspdelta" => {
                if let Ok(v) = value.parse::<i32>() {
                    if (ASP_DELTA_MIN..=ASP_DELTA_MAX).contains(&v) {
                        self.config.asp_init_delta = v;
                    }
                }
            }
            "aspmindepth" => {
                if let Ok(v) = value.parse::<i32>() {
                    if (ASP_MIN_DEPTH_MIN..=ASP_MIN_DEPTH_MAX).contains(&v) {
                        self.config.asp_min_depth = v;
                    }
                }
            }
            "lmrcoeff" => {
                if let Ok(v) = value.parse::<f32>() {
                    if v >= 0.0 {
                        self.config.lmr_coeff = v;
                    }
                }
            }
            "evalfile" => match self.eval.load_weights(Path::new(value.trim())) {
                Ok(()) => emit(format!("info string eval weights loaded from {}", value.trim())),
                Err(e) => {
                    emit(format!("info string failed to load eval weights: {:#}", e));
                }
            },
            _ => {}
        }
    }

    fn handle_position(&mut self, parts: &[&str]) {
        let mut i;
        let mut pos = match parts.first().copied() {
            Some("startpos") => {
                i = 1;
                Position::startpos()
            }
            Some("fen") => {
                let fen_parts: Vec<&str> = parts
                    .iter()
                    .skip(1)
                    .take_while(|&&p| p != "moves")
                    .copied()
                    .collect();
                i = 1 + fen_parts.len();
                match Position::from_fen(&fen_parts.join(" ")) {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("{:#}", e);
                        return;
                    }
                }
            }
            _ => return,
        };

        let mut stack = Stack::new();
        if parts.get(i) == Some(&"moves") {
            i += 1;
            for s in &parts[i..] {
                let Ok(mv) = ChessMove::from_str(s) else { break };
                if !pos.is_legal(mv) {
                    break;
                }
                stack.push(pos.key(), mv);
                pos = pos.do_move(mv);
            }
        }

        stack.set_start(stack.total_height());
        self.position = pos;
        self.stack = stack;
    }

    fn handle_go(&mut self, parts: &[&str]) {
        let mut limits = SearchLimits {
            start: Instant::now(),
            ..Default::default()
        };

        let mut i = 0;
        while i < parts.len() {
            let arg = |j: usize| parts.get(j).and_then(|s| s.parse::<u64>().ok());
            match parts[i] {
                "wtime" => {
                    if let Some(v) = arg(i + 1) {
                        limits.time[0] = v;
                    }
                    i += 2;
                }
                "btime" => {
                    if let Some(v) = arg(i + 1) {
                        limits.time[1] = v;
                    }
                    i += 2;
                }
                "winc" => {
                    if let Some(v) = arg(i + 1) {
                        limits.inc[0] = v;
                    }
                    i += 2;
                }
                "binc" => {
                    if let Some(v) = arg(i + 1) {
                        limits.inc[1] = v;
                    }
                    i += 2;
                }
                "movetime" => {
                    if let Some(v) = arg(i + 1) {
                        limits.move_time = v;
                    }
                    i += 2;
                }
                "depth" => {
                    if let Some(v) = arg(i + 1) {
                        limits.max_depth = (v as i32).clamp(1, MAX_DEPTH);
                    }
                    i += 2;
                }
                "nodes" => {
                    if let Some(v) = arg(i + 1) {
                        limits.max_nodes = v;
                    }
                    i += 2;
                }
                "infinite" => {
                    limits.infinite = true;
                    i += 1;
                }
                "ponder" => {
                    limits.ponder = true;
                    i += 1;
                }
                "perft" => {
                    let depth = parts.get(i + 1).and_then(|s| s.parse::<i64>().ok());
                    self.handle_perft(depth);
                    return;
                }
                _ => i += 1,
            }
        }

        if limits.time == [0, 0] && limits.move_time == 0 {
            limits.infinite = true;
        }

        self.search.go(SearchJob {
            root: self.position,
            stack: self.stack.clone(),
            limits,
            config: self.config,
        });
    }

    /// A missing or unparsable depth means 1; an explicit depth below 1 is
    /// answered with no output at all.
    fn handle_perft(&self, depth: Option<i64>) {
        let depth = depth.unwrap_or(1);
        if depth < 1 {
            return;
        }

        let start = Instant::now();
        let nodes = perft(self.position.board(), depth as u32);
        let millis = start.elapsed().as_millis() as u64;
        let mnps = nodes / (millis + 1) / 1000;
        emit(format!("{} nodes @ {} mn/s", nodes, mnps));
    }

    /// Fixed-position search sweep used by the `bench` CLI subcommand.
    pub fn bench(&mut self, depth: i32) {
        let positions = [
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
            "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
            "8/2p5/3p4/KP5r/1R3p1k/8/4P1P1/8 w - - 0 1",
            "r3k2r/Pppp1ppp/1b3nbN/nP6/BBP1P3/q4N2/Pp1P2PP/R2Q1RK1 w kq - 0 1",
            "rnbq1k1r/pp1Pbppp/2p5/8/2B5/8/PPP1NnPP/RNBQK2R w KQ - 1 8",
        ];

        let mut total_nodes = 0u64;
        let start = Instant::now();

        for fen in positions {
            self.handle_command(&format!("position fen {}", fen));
            self.handle_command(&format!("go depth {}", depth));
            self.search.wait_for_completion();
            total_nodes += self.search.nodes();
        }

        let secs = start.elapsed().as_secs_f64();
        let nps = if secs > 0.0 {
            (total_nodes as f64 / secs) as u64
        } else {
            0
        };
        emit(format!(
            "info string bench: {} positions, {} nodes, {:.2}s, {} nps",
            positions.len(),
            total_nodes,
            secs,
            nps
        ));
    }
}

fn perft(board: &Board, depth: u32) -> u64 {
    if depth == 0 {
        return 1;
    }
    let moves = MoveGen::new_legal(board);
    if depth == 1 {
        return moves.len() as u64;
    }
    moves
        .map(|m| perft(&board.make_move_new(m), depth - 1))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perft_matches_known_counts() {
        let board = Board::default();
        assert_eq!(perft(&board, 1), 20);
        assert_eq!(perft(&board, 2), 400);
        assert_eq!(perft(&board, 3), 8_902);
        assert_eq!(perft(&board, 4), 197_281);
    }

    #[test]
    fn position_command_applies_legal_prefix() {
        let mut uci = UciHandler::new();
        // The third move is illegal; the first two must stick.
        uci.handle_command("position startpos moves e2e4 e7e5 e4e6");
        let fen = uci.position.fen();
        assert!(fen.starts_with("rnbqkbnr/pppp1ppp/8/4p3/4P3/8/PPPP1PPP/RNBQKBNR w"));
        assert_eq!(uci.stack.total_height(), 2);
    }

    #[test]
    fn invalid_fen_keeps_previous_position() {
        let mut uci = UciHandler::new();
        uci.handle_command("position startpos moves e2e4");
        let before = uci.position.fen();
        uci.handle_command("position fen total garbage");
        assert_eq!(uci.position.fen(), before);
    }

    #[test]
    fn option_out_of_range_is_rejected() {
        let mut uci = UciHandler::new();
        uci.handle_command("setoption name multipv value 3");
        assert_eq!(uci.config.multipv, 3);
        uci.handle_command("setoption name multipv value 0");
        assert_eq!(uci.config.multipv, 3);
        uci.handle_command("setoption name multipv value 1");
        assert_eq!(uci.config.multipv, 1);
    }

    #[test]
    fn warm_tt_makes_a_repeat_search_trivial() {
        let mut uci = UciHandler::new();
        uci.handle_command(
            "position fen r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
        );
        uci.handle_command("go depth 4");
        uci.search.wait_for_completion();
        let first = uci.search.nodes();
        assert!(first > 0);

        // Without `clear hash` the stored root entry answers every iteration.
        uci.handle_command("go depth 4");
        uci.search.wait_for_completion();
        let second = uci.search.nodes();
        assert!(second < first);
        assert!(!uci.tt.extract_pv(uci.position, 1).is_empty());
    }

    #[test]
    fn option_names_are_case_insensitive() {
        let mut uci = UciHandler::new();
        uci.handle_command("setoption name AspDelta value 32");
        assert_eq!(uci.config.asp_init_delta, 32);
        uci.handle_command("setoption name aspmindepth value 4");
        assert_eq!(uci.config.asp_min_depth, 4);
    }
}
