// src/search/mod.rs
//
// The search driver: iterative deepening with aspiration windows around a
// principal-variation alpha-beta search, quiescence at the leaves, and the
// transposition table consulted before work and written after. All recursion
// happens on the worker thread; the front-end talks to it through
// `SearchHandle`.

pub mod history;
pub mod picker;
pub mod stack;
pub mod time;
pub mod worker;

use crate::defs::{format_score, MAX_DEPTH, VALUE_MATE};
use crate::eval::Evaluator;
use crate::position::Position;
use crate::tree::TreeRecorder;
use crate::tt::{Bound, TranspositionTable, TtEntry};
use crate::uci::emit;
use chess::ChessMove;
use history::{HistoryTable, ReplyTable};
use parking_lot::Mutex;
use picker::MovePicker;
use stack::Stack;
use std::sync::Arc;
use std::time::Instant;
use time::TimeManager;
use worker::{Signals, WorkerLoop};

/// How often the clock and node budget are consulted.
const CHECK_TIME_MASK: u64 = 2047;

/// Ancestor occurrences needed before a position counts as repeated.
const DRAW_FOLD: u32 = 2;

/// Root moves below this depth are all searched with a full window.
const FULL_WINDOW_ROOT_DEPTH: i32 = 6;

#[derive(Clone, Copy)]
pub struct SearchLimits {
    pub time: [u64; 2],
    pub inc: [u64; 2],
    pub move_time: u64,
    pub max_depth: i32,
    pub max_nodes: u64,
    pub infinite: bool,
    pub ponder: bool,
    pub start: Instant,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            time: [0; 2],
            inc: [0; 2],
            move_time: 0,
            max_depth: MAX_DEPTH,
            max_nodes: u64::MAX,
            infinite: false,
            ponder: false,
            start: Instant::now(),
        }
    }
}

/// Engine options that shape the search.
#[derive(Clone, Copy)]
pub struct Config {
    pub multipv: u32,
    pub asp_init_delta: i32,
    pub asp_min_depth: i32,
    pub lmr_coeff: f32,
    pub ponder: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multipv: 1,
            asp_init_delta: 16,
            asp_min_depth: 5,
            lmr_coeff: 0.0,
            ponder: false,
        }
    }
}

#[derive(Clone, Copy, Default)]
pub struct SearchStats {
    pub nodes: u64,
    pub qnodes: u64,
    pub fail_high: u64,
    pub fail_high_first: u64,
}

#[derive(Clone, Copy)]
pub struct RootMove {
    pub mv: ChessMove,
    pub score: i32,
    pub prev_score: i32,
    pub nodes: u64,
}

/// Ordered iteration over root moves, re-sorted after every completed
/// iteration so the best line from the previous depth leads the next one.
#[derive(Default)]
pub struct RootMovePicker {
    moves: Vec<RootMove>,
    cur: usize,
}

impl RootMovePicker {
    fn reset(&mut self, root: &Position, tt: &TranspositionTable, history: &HistoryTable) {
        let ttm = tt
            .probe(root.key())
            .and_then(|e| e.mv())
            .filter(|&m| root.is_legal(m));
        let mut mp = MovePicker::new(root, ttm, [None; 2], history, None, None);

        self.moves.clear();
        self.cur = 0;
        while let Some(m) = mp.next(false) {
            self.moves.push(RootMove {
                mv: m,
                score: 0,
                prev_score: 0,
                nodes: 0,
            });
        }
    }

    fn next(&mut self) -> Option<ChessMove> {
        let rm = self.moves.get(self.cur)?;
        self.cur += 1;
        Some(rm.mv)
    }

    fn update_last(&mut self, score: i32, nodes: u64) {
        debug_assert!(self.cur > 0 && self.cur <= self.moves.len());
        let last = &mut self.moves[self.cur - 1];
        last.nodes = nodes;
        last.prev_score = last.score;
        last.score = score;
    }

    fn complete_iter(&mut self) {
        self.moves.sort_by(|x, y| {
            y.score
                .cmp(&x.score)
                .then(y.prev_score.cmp(&x.prev_score))
        });
        self.cur = 0;
    }

    fn num_moves(&self) -> usize {
        self.moves.len()
    }

    fn first_move(&self) -> Option<ChessMove> {
        self.moves.first().map(|rm| rm.mv)
    }
}

fn can_return_ttscore(tte: &TtEntry, alpha: &mut i32, beta: i32, depth: i32, ply: i32) -> bool {
    if tte.depth() < depth {
        return false;
    }

    let score = tte.score(ply);
    match tte.bound() {
        Bound::Exact => {
            *alpha = score;
            true
        }
        Bound::Upper => score <= *alpha,
        Bound::Lower => {
            if score >= beta {
                *alpha = beta;
                true
            } else {
                false
            }
        }
    }
}

fn determine_bound(alpha: i32, beta: i32, old_alpha: i32) -> Bound {
    if alpha >= beta {
        Bound::Lower
    } else if alpha > old_alpha {
        Bound::Exact
    } else {
        Bound::Upper
    }
}

/// Everything a single search run needs. Owned by the worker thread.
pub struct SearchJob {
    pub root: Position,
    pub stack: Stack,
    pub limits: SearchLimits,
    pub config: Config,
}

pub struct Searcher {
    tt: Arc<TranspositionTable>,
    eval: Arc<Evaluator>,
    tree: Arc<TreeRecorder>,
    signals: Arc<Signals>,

    root: Position,
    stack: Stack,
    rmp: RootMovePicker,
    history: HistoryTable,
    counters: ReplyTable,
    followups: ReplyTable,
    stats: SearchStats,
    limits: SearchLimits,
    config: Config,
    man: TimeManager,
}

impl Searcher {
    pub fn new(
        tt: Arc<TranspositionTable>,
        eval: Arc<Evaluator>,
        tree: Arc<TreeRecorder>,
        signals: Arc<Signals>,
    ) -> Self {
        Self {
            tt,
            eval,
            tree,
            signals,
            root: Position::startpos(),
            stack: Stack::new(),
            rmp: RootMovePicker::default(),
            history: HistoryTable::new(),
            counters: ReplyTable::new(),
            followups: ReplyTable::new(),
            stats: SearchStats::default(),
            limits: SearchLimits::default(),
            config: Config::default(),
            man: TimeManager::default(),
        }
    }

    /// Run a full search and return the move and score settled on. Protocol
    /// output (`info`, `bestmove`) is emitted along the way.
    pub fn run(&mut self, job: SearchJob) -> (Option<ChessMove>, i32) {
        self.prepare(job);
        let result = self.iterative_deepening();
        self.signals.publish_nodes(self.stats.nodes);
        result
    }

    fn prepare(&mut self, job: SearchJob) {
        self.root = job.root;
        self.stack = job.stack;
        self.limits = job.limits;
        self.config = job.config;

        self.stack.set_start(self.stack.total_height());
        self.stats = SearchStats::default();
        self.history.reset();
        self.counters.reset();
        self.followups.reset();
        self.man.init(
            &self.limits,
            self.root.side_to_move(),
            self.stack.total_height() as u32,
        );
        self.rmp.reset(&self.root, &self.tt, &self.history);
    }

    pub fn stats(&self) -> &SearchStats {
        &self.stats
    }

    fn check_time(&mut self) {
        if self.stats.nodes & CHECK_TIME_MASK != 0 {
            return;
        }
        self.signals.publish_nodes(self.stats.nodes);
        if !self.signals.keep_going() {
            return;
        }
        if self.stats.nodes >= self.limits.max_nodes {
            self.signals.set_keep_going(false);
            return;
        }
        if self.signals.pondering() || self.limits.infinite {
            return;
        }
        if self.man.out_of_time() {
            self.signals.set_keep_going(false);
        }
    }

    fn iterative_deepening(&mut self) -> (Option<ChessMove>, i32) {
        let mut pv: Vec<ChessMove> = Vec::new();

        if self.rmp.num_moves() == 0 {
            let score = if self.root.in_check() {
                self.stack.mated_score()
            } else {
                0
            };
            emit(format!("info depth 0 score {}", format_score(score)));
            emit("bestmove 0000");
            return (None, score);
        }
        if self.rmp.num_moves() == 1 {
            let only = self.rmp.first_move().unwrap();
            emit(format!("bestmove {}", only));
            return (Some(only), 0);
        }

        let mut score = self.search_root(-VALUE_MATE, VALUE_MATE, 1);
        let mut nodes_this = self.stats.nodes.max(1);
        let mut ebf = 1;
        self.report(1, score, ebf, &mut pv);

        for depth in 2..=self.limits.max_depth {
            self.tree.clear();
            let prev_nodes = nodes_this;
            let before = self.stats.nodes;
            let prev_score = score;
            let iter_start = Instant::now();

            score = self.aspiration_window(score, depth);
            if !self.signals.keep_going() {
                break;
            }
            self.report(depth, score, ebf, &mut pv);

            nodes_this = (self.stats.nodes - before).max(1);
            ebf = (nodes_this + prev_nodes - 1) / prev_nodes.max(1);

            // Assume the next iteration costs at least as much as this one:
            // with a stable score and less than that on the clock, bail now.
            if let Some(remaining) = self.man.remaining() {
                if self.limits.move_time == 0
                    && !self.limits.infinite
                    && (score - prev_score).abs() < 8
                    && iter_start.elapsed() >= remaining
                {
                    break;
                }
            }

            if score.abs() >= VALUE_MATE - depth {
                break;
            }
        }

        let best = pv.first().copied().or_else(|| self.rmp.first_move());
        match best {
            Some(m) if self.config.ponder && pv.len() > 1 => {
                emit(format!("bestmove {} ponder {}", m, pv[1]));
            }
            Some(m) => emit(format!("bestmove {}", m)),
            None => emit("bestmove 0000"),
        }
        (best, score)
    }

    fn report(&mut self, depth: i32, score: i32, ebf: u64, pv: &mut Vec<ChessMove>) {
        let elapsed = self.limits.start.elapsed().as_millis() as u64;
        let nps = self.stats.nodes * 1000 / (elapsed + 1);
        let fhf = self.stats.fail_high_first as f64 / (self.stats.fail_high + 1) as f64;

        *pv = self.tt.extract_pv(self.root, depth.max(1) as usize);
        let pv_str = pv
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(" ");

        emit(format!(
            "info score {} depth {} nodes {} time {} nps {} fhf {:.2} ebf {} hashfull {} pv {}",
            format_score(score),
            depth,
            self.stats.nodes,
            elapsed,
            nps,
            fhf,
            ebf,
            self.tt.hashfull(),
            pv_str,
        ));
    }

    fn aspiration_window(&mut self, mut score: i32, depth: i32) -> i32 {
        if depth <= self.config.asp_min_depth {
            return self.search_root(-VALUE_MATE, VALUE_MATE, depth);
        }

        let mut delta = self.config.asp_init_delta;
        let mut alpha = (score - delta).max(-VALUE_MATE);
        let mut beta = (score + delta).min(VALUE_MATE);

        while self.signals.keep_going() {
            score = self.search_root(alpha, beta, depth);

            if score <= alpha {
                beta = (alpha + beta) / 2;
                alpha = (alpha - delta).max(-VALUE_MATE);
            } else if score >= beta {
                beta = (beta + delta).min(VALUE_MATE);
            } else {
                break;
            }

            delta += delta / 2;
        }

        score
    }

    fn search_root(&mut self, mut alpha: i32, beta: i32, depth: i32) -> i32 {
        let root = self.root;
        if root.half_moves() >= 100
            || (!root.in_check() && root.is_material_draw())
            || self.stack.is_repetition(&root, DRAW_FOLD)
        {
            return 0;
        }

        if let Some(tte) = self.tt.probe(root.key()) {
            if can_return_ttscore(&tte, &mut alpha, beta, depth, 0) {
                return alpha;
            }
        }

        let old_alpha = alpha;
        let mut best_score = -VALUE_MATE;
        let mut best_move: Option<ChessMove> = None;
        let mut moves_tried = 0;

        while let Some(m) = self.rmp.next() {
            let nodes_before = self.stats.nodes;
            let handle = self.tree.begin_node(m, alpha, beta, depth, 0);
            let child = root.do_move(m);
            self.stack.push(root.key(), m);

            let score = if moves_tried == 0 || depth <= FULL_WINDOW_ROOT_DEPTH {
                -self.search(&child, -beta, -alpha, depth - 1)
            } else {
                let mut s = -self.search(&child, -(alpha + 1), -alpha, depth - 1);
                if s > alpha && s < beta {
                    s = -self.search(&child, -beta, -alpha, depth - 1);
                }
                s
            };

            moves_tried += 1;
            self.stack.pop();
            self.tree.end_node(handle, score);
            self.rmp
                .update_last(score, self.stats.nodes - nodes_before);

            if score > best_score {
                best_score = score;
                best_move = Some(m);
            }
            if score > alpha {
                alpha = score;
            }
            if score >= beta {
                alpha = beta;
                break;
            }
        }

        self.rmp.complete_iter();
        if self.signals.keep_going() {
            self.tt.store(TtEntry::new(
                root.key(),
                alpha,
                0,
                determine_bound(alpha, beta, old_alpha),
                depth,
                best_move,
                0,
            ));
        }

        alpha
    }

    fn search(&mut self, pos: &Position, mut alpha: i32, mut beta: i32, depth: i32) -> i32 {
        let ply = self.stack.height();

        self.check_time();
        if !self.signals.keep_going() {
            return 0;
        }

        // Mate distance pruning
        let mated = self.stack.mated_score();
        alpha = alpha.max(mated);
        beta = beta.min(-mated - 1);
        if alpha >= beta {
            return alpha;
        }

        if depth <= 0 {
            let in_check = pos.in_check();
            return self.quiescence(pos, alpha, beta, in_check);
        }
        self.stats.nodes += 1;
        if self.stack.capped() {
            return self.eval.evaluate(pos);
        }

        self.tt.prefetch(pos.key());
        if pos.half_moves() >= 100
            || (!pos.in_check() && pos.is_material_draw())
            || self.stack.is_repetition(pos, DRAW_FOLD)
        {
            return 0;
        }

        let mut ttm: Option<ChessMove> = None;
        if let Some(tte) = self.tt.probe(pos.key()) {
            ttm = tte.mv().filter(|&m| pos.is_legal(m));

            if can_return_ttscore(&tte, &mut alpha, beta, depth, ply as i32) {
                if let Some(m) = ttm {
                    if pos.is_quiet(m) {
                        self.history.add_bonus(pos, m, depth * depth);
                    }
                }
                return alpha;
            }
        }

        // Internal iterative deepening: a reduced search to seed the TT with
        // a move worth trying first.
        if ttm.is_none() && depth >= 5 {
            self.search(pos, alpha, beta, depth - 2);
            if let Some(tte) = self.tt.probe(pos.key()) {
                ttm = tte.mv().filter(|&m| pos.is_legal(m));
            }
        }

        let static_eval = self.eval.evaluate(pos);
        self.stack.at_mut(ply).static_eval = static_eval.clamp(i16::MIN as i32, i16::MAX as i32) as i16;

        let opp_move = self.stack.at(ply - 1).mv;
        let (prev_own, followup) = if ply >= 2 {
            let prev = self.stack.at(ply - 2).mv;
            (prev, prev.and_then(|m| self.followups.get(m)))
        } else {
            (None, None)
        };
        let killers = self.stack.at(ply).killers;
        let counter = opp_move.and_then(|m| self.counters.get(m));

        let mut mp = MovePicker::new(pos, ttm, killers, &self.history, counter, followup);
        let old_alpha = alpha;
        let mut best_score = -VALUE_MATE;
        let mut best_move: Option<ChessMove> = None;
        let mut moves_tried = 0;

        while let Some(m) = mp.next(false) {
            let handle = self.tree.begin_node(m, alpha, beta, depth, ply as i32);
            let child = pos.do_move(m);
            self.stack.push(pos.key(), m);

            let score = -self.search(&child, -beta, -alpha, depth - 1);

            self.stack.pop();
            self.tree.end_node(handle, score);
            moves_tried += 1;

            if score > best_score {
                best_score = score;
                best_move = Some(m);
            }
            if score > alpha {
                alpha = score;
            }
            if score >= beta {
                break;
            }
        }

        if moves_tried == 0 {
            if pos.in_check() {
                return self.stack.mated_score();
            }
            return 0;
        }

        if alpha >= beta {
            alpha = beta;
            self.stats.fail_high += 1;
            if moves_tried == 1 {
                self.stats.fail_high_first += 1;
            }

            if let Some(bm) = best_move {
                if pos.is_quiet(bm) {
                    let entry = self.stack.at_mut(ply);
                    if entry.killers[0] != Some(bm) {
                        entry.killers[1] = entry.killers[0];
                        entry.killers[0] = Some(bm);
                    }

                    self.history.add_bonus(pos, bm, depth * depth);
                    if let Some(om) = opp_move {
                        self.counters.set(om, bm);
                    }
                    if let Some(pm) = prev_own {
                        self.followups.set(pm, bm);
                    }
                }
            }
        }

        if self.signals.keep_going() {
            self.tt.store(TtEntry::new(
                pos.key(),
                alpha,
                static_eval,
                determine_bound(alpha, beta, old_alpha),
                depth,
                best_move,
                ply as i32,
            ));
        }

        alpha
    }

    fn quiescence(&mut self, pos: &Position, mut alpha: i32, mut beta: i32, with_evasions: bool) -> i32 {
        self.check_time();
        if !self.signals.keep_going()
            || pos.half_moves() >= 100
            || pos.is_material_draw()
            || self.stack.is_repetition(pos, DRAW_FOLD)
        {
            return 0;
        }

        if self.stack.capped() {
            return self.eval.evaluate(pos);
        }

        self.stats.nodes += 1;
        self.stats.qnodes += 1;

        // Mate distance pruning
        let mated = self.stack.mated_score();
        alpha = alpha.max(mated);
        beta = beta.min(-mated - 1);
        if alpha >= beta {
            return alpha;
        }

        if !with_evasions {
            let stand_pat = self.eval.evaluate(pos);
            alpha = alpha.max(stand_pat);
            if alpha >= beta {
                return beta;
            }
        }

        let mut mp = MovePicker::quiescence(pos);
        let only_tacticals = !with_evasions;
        let mut moves_tried = 0;

        while let Some(m) = mp.next(only_tacticals) {
            let handle = self
                .tree
                .begin_node(m, alpha, beta, 0, self.stack.height() as i32);
            let child = pos.do_move(m);
            self.stack.push(pos.key(), m);

            // Checking replies get the evasion generator, which also finds
            // mates delivered by a capture.
            let child_evasions = !with_evasions && child.in_check();
            let score = -self.quiescence(&child, -beta, -alpha, child_evasions);

            self.stack.pop();
            self.tree.end_node(handle, score);
            moves_tried += 1;

            if score > alpha {
                alpha = score;
            }
            if score >= beta {
                return beta;
            }
        }

        if with_evasions && moves_tried == 0 {
            return self.stack.mated_score();
        }

        alpha
    }
}

/// Thread-safe facade over the worker: `go`, `stop`, `ponderhit`,
/// `wait_for_completion`. The searcher itself lives on the worker thread.
pub struct SearchHandle {
    worker: WorkerLoop,
    signals: Arc<Signals>,
    jobs: Arc<Mutex<Option<SearchJob>>>,
    tt: Arc<TranspositionTable>,
}

impl SearchHandle {
    pub fn new(tt: Arc<TranspositionTable>, eval: Arc<Evaluator>, tree: Arc<TreeRecorder>) -> Self {
        let signals = Arc::new(Signals::default());
        let jobs: Arc<Mutex<Option<SearchJob>>> = Arc::new(Mutex::new(None));

        let mut searcher = Searcher::new(Arc::clone(&tt), eval, tree, Arc::clone(&signals));
        let mailbox = Arc::clone(&jobs);
        let worker = WorkerLoop::start(Arc::clone(&signals), move || {
            let job = mailbox.lock().take();
            if let Some(job) = job {
                searcher.run(job);
            }
        });

        Self {
            worker,
            signals,
            jobs,
            tt,
        }
    }

    /// Launch a search; a running one is cancelled and awaited first.
    pub fn go(&self, job: SearchJob) {
        self.worker.pause();
        self.worker.wait_for_completion();

        self.tt.new_search();
        self.signals.set_pondering(job.limits.ponder);
        *self.jobs.lock() = Some(job);
        self.worker.resume();
    }

    pub fn stop(&self) {
        self.signals.set_pondering(false);
        self.worker.pause();
    }

    pub fn ponderhit(&self) {
        self.signals.set_pondering(false);
    }

    pub fn wait_for_completion(&self) {
        self.worker.wait_for_completion();
    }

    /// Nodes searched by the last (or current) run.
    pub fn nodes(&self) -> u64 {
        self.signals.nodes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_searcher() -> Searcher {
        let tt = Arc::new(TranspositionTable::new(8));
        let eval = Arc::new(Evaluator::new());
        let tree = Arc::new(TreeRecorder::new(false));
        let signals = Arc::new(Signals::default());
        Searcher::new(tt, eval, tree, signals)
    }

    fn depth_job(pos: Position, depth: i32) -> SearchJob {
        SearchJob {
            root: pos,
            stack: Stack::new(),
            limits: SearchLimits {
                max_depth: depth,
                infinite: true,
                ..Default::default()
            },
            config: Config::default(),
        }
    }

    #[test]
    fn bound_determination() {
        assert_eq!(determine_bound(5, 5, 0), Bound::Lower);
        assert_eq!(determine_bound(3, 5, 0), Bound::Exact);
        assert_eq!(determine_bound(0, 5, 0), Bound::Upper);
    }

    #[test]
    fn tt_cutoff_rules() {
        let key = 0x42;

        let exact = TtEntry::new(key, 123, 0, Bound::Exact, 6, None, 0);
        let mut alpha = -100;
        assert!(can_return_ttscore(&exact, &mut alpha, 100, 6, 0));
        assert_eq!(alpha, 123);

        let mut alpha = -100;
        assert!(
            !can_return_ttscore(&exact, &mut alpha, 100, 7, 0),
            "shallower entries must not cut off"
        );

        let lower = TtEntry::new(key, 200, 0, Bound::Lower, 6, None, 0);
        let mut alpha = 0;
        assert!(can_return_ttscore(&lower, &mut alpha, 150, 4, 0));
        assert_eq!(alpha, 150, "fail-high returns beta");

        let upper = TtEntry::new(key, -50, 0, Bound::Upper, 6, None, 0);
        let mut alpha = 0;
        assert!(can_return_ttscore(&upper, &mut alpha, 100, 4, 0));
        assert_eq!(alpha, 0);

        let mut alpha = -60;
        assert!(!can_return_ttscore(&upper, &mut alpha, 100, 4, 0));
    }

    #[test]
    fn aspiration_matches_full_window_at_low_depth() {
        let pos = Position::from_fen(
            "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
        )
        .unwrap();

        let mut a = make_searcher();
        a.prepare(depth_job(pos, 4));
        let s1 = a.aspiration_window(0, 4);

        let mut b = make_searcher();
        b.prepare(depth_job(pos, 4));
        let s2 = b.search_root(-VALUE_MATE, VALUE_MATE, 4);

        assert_eq!(s1, s2);
    }

    #[test]
    fn search_is_deterministic_with_fresh_tables() {
        let pos = Position::from_fen("8/2p5/3p4/KP5r/1R3p1k/8/4P1P1/8 w - - 0 1").unwrap();
        let r1 = make_searcher().run(depth_job(pos, 5));
        let r2 = make_searcher().run(depth_job(pos, 5));
        assert_eq!(r1, r2);
    }
}
