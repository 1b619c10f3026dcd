use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chess::ChessMove;
use coral::defs::{mated_in, VALUE_MATE};
use coral::eval::Evaluator;
use coral::position::Position;
use coral::search::stack::Stack;
use coral::search::worker::Signals;
use coral::search::{Config, SearchHandle, SearchJob, SearchLimits, Searcher};
use coral::tree::TreeRecorder;
use coral::tt::TranspositionTable;

fn make_searcher() -> (Searcher, Arc<TranspositionTable>) {
    let tt = Arc::new(TranspositionTable::new(8));
    let eval = Arc::new(Evaluator::new());
    let tree = Arc::new(TreeRecorder::new(false));
    let signals = Arc::new(Signals::default());
    (
        Searcher::new(Arc::clone(&tt), eval, tree, signals),
        tt,
    )
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
fn finds_mate_in_one() {
    let (mut searcher, tt) = make_searcher();
    let pos = Position::from_fen("6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1").unwrap();

    let (best, score) = searcher.run(depth_job(pos, 2));

    let mate = ChessMove::from_str("a1a8").unwrap();
    assert_eq!(best, Some(mate));
    assert_eq!(score, VALUE_MATE - 1);
    assert_eq!(tt.extract_pv(pos, 1), vec![mate]);
}

#[test]
fn stalemate_scores_zero_with_no_best_move() {
    let (mut searcher, _tt) = make_searcher();
    let pos = Position::from_fen("7k/5Q2/6K1/8/8/8/8/8 b - - 0 1").unwrap();
    assert_eq!(pos.legal_move_count(), 0);
    assert!(!pos.in_check());

    let (best, score) = searcher.run(depth_job(pos, 1));
    assert_eq!(best, None);
    assert_eq!(score, 0);
}

#[test]
fn checkmated_root_reports_mate_now() {
    let (mut searcher, _tt) = make_searcher();
    let pos = Position::from_fen("R5k1/5ppp/8/8/8/8/5PPP/6K1 b - - 0 1").unwrap();
    assert_eq!(pos.legal_move_count(), 0);
    assert!(pos.in_check());

    let (best, score) = searcher.run(depth_job(pos, 1));
    assert_eq!(best, None);
    assert_eq!(score, mated_in(0));
}

#[test]
fn threefold_repetition_scores_zero_at_root() {
    let mut pos = Position::startpos();
    let mut stack = Stack::new();
    for s in [
        "g1f3", "g8f6", "f3g1", "f6g8", "g1f3", "g8f6", "f3g1", "f6g8",
    ] {
        let m = ChessMove::from_str(s).unwrap();
        stack.push(pos.key(), m);
        pos = pos.do_move(m);
    }
    stack.set_start(stack.total_height());

    let (mut searcher, _tt) = make_searcher();
    let job = SearchJob {
        root: pos,
        stack,
        limits: SearchLimits {
            max_depth: 2,
            infinite: true,
            ..Default::default()
        },
        config: Config::default(),
    };
    let (_, score) = searcher.run(job);
    assert_eq!(score, 0);
}

#[test]
fn promotes_when_a_queen_is_free() {
    let (mut searcher, _tt) = make_searcher();
    let pos = Position::from_fen("8/5P1k/8/8/8/8/8/6K1 w - - 0 1").unwrap();
    let (best, score) = searcher.run(depth_job(pos, 3));
    assert_eq!(best, Some(ChessMove::from_str("f7f8q").unwrap()));
    assert!(score > 500);
}

#[test]
fn scores_stay_within_mate_bounds() {
    let fens = [
        "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
        "8/2p5/3p4/KP5r/1R3p1k/8/4P1P1/8 w - - 0 1",
        "rnbq1k1r/pp1Pbppp/2p5/8/2B5/8/PPP1NnPP/RNBQK2R w KQ - 1 8",
    ];
    for fen in fens {
        let (mut searcher, _tt) = make_searcher();
        let pos = Position::from_fen(fen).unwrap();
        let (best, score) = searcher.run(depth_job(pos, 4));
        assert!(best.is_some(), "no move for {}", fen);
        assert!(score.abs() <= VALUE_MATE, "score out of range for {}", fen);
    }
}

#[test]
fn node_budget_is_a_hard_stop() {
    let (mut searcher, _tt) = make_searcher();
    let pos = Position::from_fen(
        "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
    )
    .unwrap();

    let job = SearchJob {
        root: pos,
        stack: Stack::new(),
        limits: SearchLimits {
            max_nodes: 2048,
            ..Default::default()
        },
        config: Config::default(),
    };
    searcher.run(job);
    // Cancellation is observed on the 2048-node cadence, so allow slack of a
    // couple of check intervals.
    assert!(searcher.stats().nodes <= 3 * 2048);
}

#[test]
fn deep_endgame_search_builds_a_pv() {
    // Sparse position so a deep dive (past the internal iterative deepening
    // and aspiration thresholds) stays cheap.
    let (mut searcher, tt) = make_searcher();
    let pos = Position::from_fen("8/2p5/3p4/KP5r/1R3p1k/8/4P1P1/8 w - - 0 1").unwrap();
    let (best, score) = searcher.run(depth_job(pos, 7));
    assert!(best.is_some());
    assert!(score.abs() <= VALUE_MATE);
    assert!(!tt.extract_pv(pos, 7).is_empty());
}

#[test]
fn stop_ends_an_infinite_search_promptly() {
    let tt = Arc::new(TranspositionTable::new(8));
    let handle = SearchHandle::new(
        Arc::clone(&tt),
        Arc::new(Evaluator::new()),
        Arc::new(TreeRecorder::new(false)),
    );
    let pos = Position::from_fen(
        "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
    )
    .unwrap();

    handle.go(SearchJob {
        root: pos,
        stack: Stack::new(),
        limits: SearchLimits {
            infinite: true,
            ..Default::default()
        },
        config: Config::default(),
    });

    std::thread::sleep(Duration::from_millis(200));
    handle.stop();
    let begin = Instant::now();
    handle.wait_for_completion();
    assert!(begin.elapsed() < Duration::from_millis(500));
    assert!(handle.nodes() > 0);

    // The worker is reusable after a cancelled run.
    handle.go(SearchJob {
        root: Position::startpos(),
        stack: Stack::new(),
        limits: SearchLimits {
            max_depth: 3,
            infinite: true,
            ..Default::default()
        },
        config: Config::default(),
    });
    handle.wait_for_completion();
}

#[test]
fn movetime_bounds_the_search() {
    let (mut searcher, _tt) = make_searcher();
    let pos = Position::from_fen(
        "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
    )
    .unwrap();

    let begin = Instant::now();
    let job = SearchJob {
        root: pos,
        stack: Stack::new(),
        limits: SearchLimits {
            move_time: 150,
            ..Default::default()
        },
        config: Config::default(),
    };
    let (best, _) = searcher.run(job);
    assert!(best.is_some());
    assert!(begin.elapsed() < Duration::from_secs(2));
}
